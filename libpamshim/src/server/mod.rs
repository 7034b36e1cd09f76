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

//! The server loop: runs in the disposable child, reads requests off
//! standard input, dispatches each to the real platform PAM library, and
//! writes responses to a private duplicate of standard output.

mod conv;
mod dispatch;

use std::os::fd::{FromRawFd, OwnedFd};

use nix::unistd::{dup, dup2};
use pamshim_protocol::{FramedStream, Request};
use tracing::{error, info, instrument};

/// Runs the server loop to completion. Returns the process exit code the
/// caller (`main`) should use: `0` on a clean `END`, nonzero on a framing
/// failure that leaves the protocol in an unrecoverable state.
#[instrument(skip_all)]
pub fn run() -> libc::c_int {
    // Duplicate stdout to a private descriptor before anything can write
    // to the real stdout, then point stdout at stderr so incidental
    // output from the loaded PAM modules can't corrupt the protocol
    // stream. Tracing is already configured to write to stderr only, both
    // before and after this point.
    let ipc_out = match dup(1) {
        Ok(fd) => fd,
        Err(err) => {
            error!(?err, "failed to duplicate stdout for IPC");
            return 1;
        }
    };
    if dup2(2, 1).is_err() {
        error!("failed to redirect stdout to stderr");
        return 1;
    }

    // SAFETY: fd 0 is standard input, valid for the life of this process
    // and not used for anything else once the loop starts. `ipc_out` was
    // just duplicated above and is exclusively owned here.
    let mut from_client = unsafe { FramedStream::from_raw_fd(0) };
    let mut to_client = FramedStream::from_owned_fd(unsafe { OwnedFd::from_raw_fd(ipc_out) });

    let mut state = dispatch::ServerState::default();

    loop {
        let request = match Request::read(&mut from_client) {
            Ok(r) => r,
            Err(err) => {
                error!(?err, "failed to read shim request");
                return 2;
            }
        };

        let response = dispatch::handle(&mut state, request, &mut to_client, &mut from_client);
        let did_end = state.did_end;

        if let Err(err) = response.write(&mut to_client) {
            error!(?err, "failed to write shim response");
            return 1;
        }

        if did_end {
            info!("session ended");
            return 0;
        }
    }
}
