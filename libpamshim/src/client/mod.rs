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

//! The safe, owned-value client API: spawns a `pam-shim-server` child and
//! speaks the wire protocol to it. This is what the `ffi` module and
//! `pam-shim-cli` build on; it never touches a raw pointer.

mod conv;
mod item;
mod session;

pub use conv::{Conversation, FailDelayFn, NullConversation};
pub use session::Session;
