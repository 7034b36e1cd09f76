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

//! A transparent shim for the platform PAM application API. Every call a
//! host application makes against `libpam` is forwarded, through this
//! library, to a disposable child process that links the real PAM stack;
//! the host process itself never loads a PAM module directly.
//!
//! This crate builds two things:
//!   - a `cdylib`, loadable as a drop-in `libpam.so` replacement through
//!     [`ffi`]'s `extern "C"` surface;
//!   - an `rlib`, exposing the same functionality as safe Rust through
//!     [`client::Session`], used by `pam-shim-cli` and by `pam-shim-server`'s
//!     counterpart, [`server::run`].

pub mod client;
mod config;
pub mod consts;
mod error;
pub mod ffi;
mod logging;
pub mod server;

pub use config::ShimConfig;
pub use error::{Result, ShimError};
pub use logging::init_subscriber;
