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

//! Storage for the two item types that never touch the wire.

use std::sync::Arc;

use crate::client::conv::{Conversation, FailDelayFn};

/// The client-local half of `SET_ITEM`/`GET_ITEM`: values for `PAM_CONV`
/// and `PAM_FAIL_DELAY` only ever make sense inside this process, so they
/// are stored here rather than marshaled to the server.
#[derive(Default)]
pub struct LocalItems {
    pub conv: Option<Arc<dyn Conversation>>,
    pub fail_delay: Option<FailDelayFn>,
}
