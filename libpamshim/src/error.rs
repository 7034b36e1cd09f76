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

use pamshim_protocol::ProtocolError;

use crate::consts::{PAM_BUF_ERR, PAM_SYSTEM_ERR};

/// The typed error shared by the client session and server loop for
/// anything that isn't a PAM status code propagated from the real library.
///
/// `ShimError` never crosses the wire itself — `Protocol`/`Io` mean the
/// wire failed, so there was nothing left to send. It only ever surfaces
/// at the edges: a public client entry point collapses it into a PAM
/// status sentinel, and the server's main loop logs it before exiting.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("child process {0} exited unexpectedly")]
    ChildGone(libc::pid_t),

    #[error("session already in a terminal state")]
    Dead,
}

impl ShimError {
    /// Maps to the one of two sentinel statuses a client entry point may
    /// originate itself (every other status comes from the server).
    pub fn pam_status(&self) -> libc::c_int {
        match self {
            ShimError::Protocol(ProtocolError::Resource) => PAM_BUF_ERR,
            _ => PAM_SYSTEM_ERR,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;
