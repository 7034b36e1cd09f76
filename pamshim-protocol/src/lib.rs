// Copyright 2024 Google LLC
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

//! Wire protocol and framed-stream primitive shared by the pam-shim
//! client library and server binary.
//!
//! This crate has no dependency on PAM itself: it only knows how to frame
//! and encode/decode the request/response messages that cross the pipe
//! between a shim client and its disposable server subprocess. Everything
//! PAM-specific — the handle table, the real `libpam` calls, the C ABI —
//! lives in `libpamshim`.

mod error;
mod framed;
mod item;
mod message;

pub use error::{ProtocolError, Result};
pub use framed::{FramedStream, BUF_SIZE};
pub use item::{ItemType, ItemValue};
pub use message::{ConversationPrompt, ConversationReply, DefaultCall, Request, Response};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
