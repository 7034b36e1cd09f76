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

//! Wire-level and PAM-level constants. PAM status codes are plain `c_int`s
//! here rather than `pam_sys` enum values because they cross an `extern
//! "C"` boundary in both directions and a foreign application is free to
//! pass back any `int` it likes.

pub const PAM_SUCCESS: libc::c_int = 0;
pub const PAM_SYSTEM_ERR: libc::c_int = 4;
pub const PAM_BUF_ERR: libc::c_int = 6;
pub const PAM_CONV_ERR: libc::c_int = 19;

/// Conversation prompt styles, matching the real library's `pam_message`
/// `msg_style` values.
pub const PAM_PROMPT_ECHO_OFF: libc::c_int = 1;
pub const PAM_PROMPT_ECHO_ON: libc::c_int = 2;
pub const PAM_ERROR_MSG: libc::c_int = 3;
pub const PAM_TEXT_INFO: libc::c_int = 4;

/// `PATH`-resolvable name of the server binary, used when `PAM_SHIM_SERVER`
/// is unset.
pub const DEFAULT_SERVER_BINARY: &str = "pam_shim_server";

/// Overrides the server binary path/name that the client spawns.
pub const SERVER_ENV_VAR: &str = "PAM_SHIM_SERVER";

/// A `tracing_subscriber::EnvFilter` directive string, e.g. `debug` or
/// `libpamshim=trace`. Defaults to `warn` when unset.
pub const LOG_ENV_VAR: &str = "PAM_SHIM_LOG";
pub const DEFAULT_LOG_FILTER: &str = "warn";
