// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use pamshim_protocol::{ConversationPrompt, ConversationReply};

use crate::consts::PAM_CONV_ERR;

/// The application-supplied conversation callback, reified as a trait so
/// the `extern "C"` surface (§ffi) can wrap a raw `pam_conv` and the safe
/// Rust surface (the CLI, tests) can supply an ordinary closure-backed
/// implementation.
///
/// An `Err` status aborts the in-flight `AUTHENTICATE`; an empty reply
/// vector for a non-empty prompt set is treated the same as `Err` with
/// [`PAM_CONV_ERR`] by the caller.
pub trait Conversation: Send + Sync {
    fn converse(
        &self,
        prompts: &[ConversationPrompt],
    ) -> std::result::Result<Vec<ConversationReply>, libc::c_int>;
}

/// `(delay_retval, delay_usec)`, the application's own `pam_fail_delay`
/// hook if one was installed with `SET_ITEM(PAM_FAIL_DELAY, ...)`.
pub type FailDelayFn = Arc<dyn Fn(libc::c_int, i64) + Send + Sync>;

/// A conversation that always fails, used when no conversation struct was
/// supplied — mirrors what happens when the application passes a null
/// `pam_conv` to the real library.
pub struct NullConversation;

impl Conversation for NullConversation {
    fn converse(
        &self,
        _prompts: &[ConversationPrompt],
    ) -> std::result::Result<Vec<ConversationReply>, libc::c_int> {
        Err(PAM_CONV_ERR)
    }
}
