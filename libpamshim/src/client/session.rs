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

use std::{ffi::CString, os::fd::AsRawFd, sync::Arc};

use nix::{
    sys::wait::{waitpid, WaitStatus},
    unistd::{dup2, execvp, fork, pipe, ForkResult, Pid},
};
use pamshim_protocol::{
    ConversationReply, DefaultCall, FramedStream, ItemType, ItemValue, Request, Response,
};
use tracing::{instrument, warn};

use crate::{
    client::{
        conv::{Conversation, FailDelayFn, NullConversation},
        item::LocalItems,
    },
    config::ShimConfig,
    consts::{PAM_BUF_ERR, PAM_CONV_ERR, PAM_SUCCESS, PAM_SYSTEM_ERR},
    error::{Result, ShimError},
};

/// Where a [`Session`] sits in its lifecycle. Mirrors the state machine in
/// the component design: every non-auth call keeps the session `Open`;
/// `authenticate` passes through `Authenticating` for the duration of the
/// conversation loop; `end` (or a fatal I/O error) is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Authenticating,
    Closed,
    Dead,
}

/// A client-side handle to a running `pam-shim-server` subprocess.
///
/// Not `Sync`: the wire protocol is stateful on both ends and a single
/// pipe pair cannot multiplex concurrent calls. Documented usage is one
/// session per cooperating caller.
pub struct Session {
    pid: Pid,
    to_server: FramedStream,
    from_server: FramedStream,
    handle: u64,
    local: LocalItems,
    state: SessionState,
}

/// Spawns the server subprocess, wiring its stdin/stdout to a fresh pair
/// of pipes. Grounded directly on the original implementation's
/// `remote_init`: two `pipe(2)`s, a `fork(2)`, `dup2` in the child,
/// `execvp` of the configured server binary.
fn spawn_server(config: &ShimConfig) -> Result<(Pid, FramedStream, FramedStream)> {
    let (client_read, server_write) = pipe().map_err(|e| ShimError::Protocol(io_err(e)))?;
    let (server_read, client_write) = pipe().map_err(|e| ShimError::Protocol(io_err(e)))?;

    // SAFETY: the child immediately dup2s over stdio and execs; no Rust
    // heap state is touched between fork and exec.
    match unsafe { fork() }.map_err(|e| ShimError::Protocol(io_err(e)))? {
        ForkResult::Child => {
            let _ = dup2(server_read.as_raw_fd(), libc::STDIN_FILENO);
            let _ = dup2(server_write.as_raw_fd(), libc::STDOUT_FILENO);
            drop(client_read);
            drop(client_write);
            drop(server_read);
            drop(server_write);

            let prog = CString::new(config.server_path.clone()).unwrap_or_default();
            let argv = [prog.clone()];
            let _ = execvp(&prog, &argv);
            std::process::exit(1);
        }
        ForkResult::Parent { child } => {
            drop(server_read);
            drop(server_write);
            let to_server = FramedStream::from_owned_fd(client_write);
            let from_server = FramedStream::from_owned_fd(client_read);
            Ok((child, to_server, from_server))
        }
    }
}

fn io_err(e: nix::Error) -> pamshim_protocol::ProtocolError {
    pamshim_protocol::ProtocolError::Io(std::io::Error::from_raw_os_error(e as i32))
}

impl Session {
    /// `pam_start`/`pam_start_confdir`: spawns the server, sends `START`,
    /// and expects a `HANDLE` response.
    #[instrument(skip(config, conv), fields(service_name))]
    pub fn start(
        config: &ShimConfig,
        service_name: &str,
        user: &str,
        confdir: Option<&str>,
        conv: Arc<dyn Conversation>,
    ) -> std::result::Result<Session, libc::c_int> {
        let (pid, mut to_server, mut from_server) =
            spawn_server(config).map_err(|e| e.pam_status())?;

        let request = Request::Start {
            service_name: service_name.to_string(),
            user: user.to_string(),
            confdir: confdir.map(str::to_string),
        };
        if let Err(e) = request.write(&mut to_server) {
            let _ = waitpid(pid, None);
            return Err(ShimError::from(e).pam_status());
        }

        let response = match Response::read(&mut from_server) {
            Ok(r) => r,
            Err(e) => {
                let _ = waitpid(pid, None);
                return Err(ShimError::from(e).pam_status());
            }
        };

        match response {
            Response::Handle { status, handle } if status == PAM_SUCCESS => Ok(Session {
                pid,
                to_server,
                from_server,
                handle,
                local: LocalItems { conv: Some(conv), fail_delay: None },
                state: SessionState::Open,
            }),
            Response::Handle { status, .. } => {
                let _ = waitpid(pid, None);
                Err(status)
            }
            _ => {
                let _ = waitpid(pid, None);
                Err(PAM_SYSTEM_ERR)
            }
        }
    }

    /// The sentinel status for a call made after the session has already
    /// gone terminal, logged through the named error rather than a bare
    /// literal so the reason is visible in traces.
    fn dead_status(&self) -> libc::c_int {
        warn!(error = %ShimError::Dead, state = ?self.state, "call on a session already in a terminal state");
        ShimError::Dead.pam_status()
    }

    fn default_call(&mut self, build: impl Fn(DefaultCall) -> Request, flags: libc::c_int) -> libc::c_int {
        if self.state == SessionState::Dead || self.state == SessionState::Closed {
            return self.dead_status();
        }
        let req = build(DefaultCall { handle: self.handle, flags });
        if let Err(e) = req.write(&mut self.to_server) {
            self.state = SessionState::Dead;
            return ShimError::from(e).pam_status();
        }
        match Response::read(&mut self.from_server) {
            Ok(Response::Result { status }) => status,
            Ok(_) => PAM_SYSTEM_ERR,
            Err(e) => {
                self.state = SessionState::Dead;
                ShimError::from(e).pam_status()
            }
        }
    }

    pub fn setcred(&mut self, flags: libc::c_int) -> libc::c_int {
        self.default_call(Request::SetCred, flags)
    }

    pub fn acct_mgmt(&mut self, flags: libc::c_int) -> libc::c_int {
        self.default_call(Request::AcctMgmt, flags)
    }

    pub fn open_session(&mut self, flags: libc::c_int) -> libc::c_int {
        self.default_call(Request::OpenSession, flags)
    }

    pub fn close_session(&mut self, flags: libc::c_int) -> libc::c_int {
        self.default_call(Request::CloseSession, flags)
    }

    pub fn chauthtok(&mut self, flags: libc::c_int) -> libc::c_int {
        self.default_call(Request::ChangeAuthTok, flags)
    }

    /// `pam_fail_delay`: asks the *server's* PAM stack to register a
    /// minimum delay, distinct from the client-local fail-delay callback
    /// stored via `SET_ITEM(PAM_FAIL_DELAY, ...)`.
    pub fn fail_delay(&mut self, usec: libc::c_int) -> libc::c_int {
        self.default_call(Request::FailDelay, usec)
    }

    pub fn strerror(&mut self, errnum: libc::c_int) -> Option<String> {
        if self.state == SessionState::Dead || self.state == SessionState::Closed {
            return None;
        }
        let req = Request::StrError(DefaultCall { handle: self.handle, flags: errnum });
        if req.write(&mut self.to_server).is_err() {
            self.state = SessionState::Dead;
            return None;
        }
        match Response::read(&mut self.from_server) {
            Ok(Response::String { text }) => text,
            _ => {
                self.state = SessionState::Dead;
                None
            }
        }
    }

    pub fn putenv(&mut self, name_value: &str) -> libc::c_int {
        if self.state == SessionState::Dead || self.state == SessionState::Closed {
            return self.dead_status();
        }
        let req = Request::PutEnv { handle: self.handle, text: name_value.to_string() };
        if req.write(&mut self.to_server).is_err() {
            self.state = SessionState::Dead;
            return PAM_SYSTEM_ERR;
        }
        match Response::read(&mut self.from_server) {
            Ok(Response::Result { status }) => status,
            _ => {
                self.state = SessionState::Dead;
                PAM_SYSTEM_ERR
            }
        }
    }

    pub fn getenv(&mut self, name: &str) -> Option<String> {
        if self.state == SessionState::Dead || self.state == SessionState::Closed {
            return None;
        }
        let req = Request::GetEnv { handle: self.handle, name: name.to_string() };
        if req.write(&mut self.to_server).is_err() {
            self.state = SessionState::Dead;
            return None;
        }
        match Response::read(&mut self.from_server) {
            Ok(Response::String { text }) => text,
            _ => {
                self.state = SessionState::Dead;
                None
            }
        }
    }

    pub fn getenvlist(&mut self) -> Option<Vec<String>> {
        if self.state == SessionState::Dead || self.state == SessionState::Closed {
            return None;
        }
        let req = Request::GetEnvList(DefaultCall { handle: self.handle, flags: 0 });
        if req.write(&mut self.to_server).is_err() {
            self.state = SessionState::Dead;
            return None;
        }
        match Response::read(&mut self.from_server) {
            Ok(Response::StringList { items }) => Some(items),
            _ => {
                self.state = SessionState::Dead;
                None
            }
        }
    }

    /// `SET_ITEM`. `PAM_CONV` and `PAM_FAIL_DELAY` are intercepted locally
    /// and never reach the wire.
    pub fn set_item(&mut self, item_type: ItemType, value: ItemValue) -> libc::c_int {
        match (item_type, &value) {
            (ItemType::Conv, _) => {
                // A conversation value can only arrive through the typed
                // Rust API (see set_conv below); over SET_ITEM it's
                // rejected the same way an unrecognized tag would be.
                PAM_SYSTEM_ERR
            }
            (ItemType::FailDelay, _) => PAM_SYSTEM_ERR,
            _ => {
                if self.state == SessionState::Dead || self.state == SessionState::Closed {
                    return self.dead_status();
                }
                let req = Request::SetItem { handle: self.handle, item_type, value };
                if req.write(&mut self.to_server).is_err() {
                    self.state = SessionState::Dead;
                    return PAM_SYSTEM_ERR;
                }
                match Response::read(&mut self.from_server) {
                    Ok(Response::Result { status }) => status,
                    _ => {
                        self.state = SessionState::Dead;
                        PAM_SYSTEM_ERR
                    }
                }
            }
        }
    }

    /// Installs the application's conversation callback, the Rust-typed
    /// equivalent of `SET_ITEM(PAM_CONV, ...)`.
    pub fn set_conv(&mut self, conv: Arc<dyn Conversation>) {
        self.local.conv = Some(conv);
    }

    /// Installs a client-local fail-delay hook, the Rust-typed equivalent
    /// of `SET_ITEM(PAM_FAIL_DELAY, ...)`.
    pub fn set_fail_delay_hook(&mut self, hook: FailDelayFn) {
        self.local.fail_delay = Some(hook);
    }

    /// `GET_ITEM`. Returns `None` both for "bad item" and for any wire
    /// failure; the two are indistinguishable to a caller using only the
    /// owned-value API (the `extern "C"` surface maps "bad item" to its
    /// own status separately, see `ffi`).
    pub fn get_item(&mut self, item_type: ItemType) -> Option<ItemValue> {
        if item_type.is_local_only() {
            return None;
        }
        if self.state == SessionState::Dead || self.state == SessionState::Closed {
            return None;
        }
        let req = Request::GetItem { handle: self.handle, item_type };
        if req.write(&mut self.to_server).is_err() {
            self.state = SessionState::Dead;
            return None;
        }
        match Response::read(&mut self.from_server) {
            Ok(Response::Item { status, value, .. }) if status == PAM_SUCCESS => value,
            _ => None,
        }
    }

    /// `pam_authenticate`: the one call with a reentrant sub-protocol. See
    /// §4.3 of the design notes — the server may emit any number of
    /// `CONVERSATION` responses before the terminating `AUTHENTICATE`.
    #[instrument(skip(self))]
    pub fn authenticate(&mut self, flags: libc::c_int) -> libc::c_int {
        if self.state != SessionState::Open {
            return PAM_SYSTEM_ERR;
        }
        let req = Request::Authenticate(DefaultCall { handle: self.handle, flags });
        if req.write(&mut self.to_server).is_err() {
            self.state = SessionState::Dead;
            return PAM_SYSTEM_ERR;
        }
        self.state = SessionState::Authenticating;

        let conv = self.local.conv.clone().unwrap_or_else(|| Arc::new(NullConversation));

        loop {
            let response = match Response::read(&mut self.from_server) {
                Ok(r) => r,
                Err(e) => {
                    self.state = SessionState::Dead;
                    return ShimError::from(e).pam_status();
                }
            };

            match response {
                Response::Conversation { prompts } => {
                    // Always complete the round trip, even when the local
                    // callback fails: leaving the server blocked on a
                    // request that will never arrive would wedge the
                    // session for any later call, including `end`. But a
                    // genuine callback failure still breaks with the
                    // callback's own status, not whatever the server
                    // decides once it sees the placeholder replies.
                    let callback_failure = match conv.converse(&prompts) {
                        Ok(replies) if !prompts.is_empty() && replies.is_empty() => None,
                        Ok(replies) => {
                            let reply_req = Request::AuthenticateResponse { replies };
                            if reply_req.write(&mut self.to_server).is_err() {
                                self.state = SessionState::Dead;
                                return PAM_SYSTEM_ERR;
                            }
                            continue;
                        }
                        Err(status) => Some(status),
                    };
                    let status = callback_failure.unwrap_or(PAM_CONV_ERR);
                    let replies = vec![ConversationReply { text: None, retcode: status }; prompts.len()];
                    let reply_req = Request::AuthenticateResponse { replies };
                    if reply_req.write(&mut self.to_server).is_err() {
                        self.state = SessionState::Dead;
                        return PAM_SYSTEM_ERR;
                    }
                    if let Some(status) = callback_failure {
                        self.drain_authenticate_after_conv_failure();
                        return status;
                    }
                }
                Response::Authenticate { status, delay_retval, delay_usec } => {
                    self.state = SessionState::Open;
                    match &self.local.fail_delay {
                        Some(hook) => hook(delay_retval, delay_usec),
                        None if status != PAM_SUCCESS && delay_usec > 0 => {
                            std::thread::sleep(std::time::Duration::from_micros(delay_usec.max(0) as u64));
                        }
                        None => {}
                    }
                    return status;
                }
                _ => {
                    warn!("unexpected response tag during authenticate");
                    self.state = SessionState::Dead;
                    return PAM_SYSTEM_ERR;
                }
            }
        }
    }

    /// Finishes draining the reentrant conversation sub-protocol after a
    /// local callback failure has already decided the status to return.
    /// The server doesn't know the callback failed locally — from its
    /// side this looks like an ordinary (if conv-error-laden) exchange —
    /// so it may still emit further `CONVERSATION` responses before its
    /// own terminating `AUTHENTICATE`. Those get the same placeholder
    /// treatment so the session comes back to `Open` instead of wedging.
    fn drain_authenticate_after_conv_failure(&mut self) {
        loop {
            match Response::read(&mut self.from_server) {
                Ok(Response::Authenticate { .. }) => {
                    self.state = SessionState::Open;
                    return;
                }
                Ok(Response::Conversation { prompts }) => {
                    let replies = vec![ConversationReply { text: None, retcode: PAM_CONV_ERR }; prompts.len()];
                    if Request::AuthenticateResponse { replies }.write(&mut self.to_server).is_err() {
                        self.state = SessionState::Dead;
                        return;
                    }
                }
                _ => {
                    self.state = SessionState::Dead;
                    return;
                }
            }
        }
    }

    /// `pam_end`: sends `END`, always tears down the pipes and reaps the
    /// child regardless of what the server answered. Best-effort: I/O
    /// failure during teardown still completes reaping.
    #[instrument(skip(self))]
    pub fn end(mut self, pam_status: libc::c_int) -> libc::c_int {
        if self.state == SessionState::Dead {
            let status = self.dead_status();
            self.reap();
            return status;
        }

        let req = Request::End(DefaultCall { handle: self.handle, flags: pam_status });
        let result = if req.write(&mut self.to_server).is_err() {
            PAM_SYSTEM_ERR
        } else {
            match Response::read(&mut self.from_server) {
                Ok(Response::Result { status }) => status,
                _ => PAM_SYSTEM_ERR,
            }
        };

        self.state = SessionState::Closed;
        self.reap();
        result
    }

    fn reap(&mut self) {
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, 0)) => {}
            Ok(WaitStatus::Exited(pid, code)) => {
                warn!(error = %ShimError::ChildGone(pid.as_raw()), code, "pam-shim-server exited abnormally");
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                warn!(error = %ShimError::ChildGone(pid.as_raw()), ?signal, "pam-shim-server was killed");
            }
            Ok(_) => {}
            Err(err) => warn!(?err, "failed to reap pam-shim-server child"),
        }
    }
}

impl Drop for Session {
    /// A safety net, not the primary teardown path: applications are
    /// expected to call `end`. If they don't, we still avoid leaving a
    /// zombie behind.
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.reap();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Builds a `Session` wired to an in-process fake server thread instead
    /// of a forked `pam-shim-server`, so the state machine and reentrant
    /// conversation loop can be exercised without a real PAM stack.
    fn fake_session(server: impl FnOnce(FramedStream, FramedStream) + Send + 'static) -> Session {
        let (client_read, server_write) = pipe().unwrap();
        let (server_read, client_write) = pipe().unwrap();

        std::thread::spawn(move || {
            let to_client = FramedStream::from_owned_fd(server_write);
            let from_client = FramedStream::from_owned_fd(server_read);
            server(to_client, from_client);
        });

        Session {
            // Never reaped in these tests: no child was forked. `end`'s
            // `waitpid` would block forever on a real pid, so tests call
            // `end`'s wire logic directly rather than going through reap.
            pid: Pid::this(),
            to_server: FramedStream::from_owned_fd(client_write),
            from_server: FramedStream::from_owned_fd(client_read),
            handle: 42,
            local: LocalItems { conv: Some(Arc::new(NullConversation)), fail_delay: None },
            state: SessionState::Open,
        }
    }

    struct ScriptedConversation {
        replies: std::sync::Mutex<Vec<ConversationReply>>,
    }

    impl Conversation for ScriptedConversation {
        fn converse(
            &self,
            prompts: &[pamshim_protocol::ConversationPrompt],
        ) -> std::result::Result<Vec<ConversationReply>, libc::c_int> {
            let mut replies = self.replies.lock().unwrap();
            Ok(replies.drain(..prompts.len().min(replies.len())).collect())
        }
    }

    #[test]
    fn default_call_returns_server_status() {
        let mut session = fake_session(|mut to_client, mut from_client| {
            let _ = Request::read(&mut from_client).unwrap();
            Response::Result { status: PAM_SUCCESS }.write(&mut to_client).unwrap();
        });
        assert_eq!(session.setcred(0), PAM_SUCCESS);
        // Avoid blocking on a real child in `Drop`.
        session.state = SessionState::Closed;
    }

    #[test]
    fn default_call_after_wire_failure_reports_system_error() {
        let mut session = fake_session(|to_client, _from_client| {
            drop(to_client);
        });
        // First call: server closes its end without responding.
        let status = session.setcred(0);
        assert_eq!(status, PAM_SYSTEM_ERR);
        // Session is now Dead; further calls short-circuit without I/O.
        assert_eq!(session.acct_mgmt(0), PAM_SYSTEM_ERR);
        session.state = SessionState::Closed;
    }

    #[test]
    fn authenticate_completes_a_single_conversation_round_trip() {
        let mut session = fake_session(|mut to_client, mut from_client| {
            let _ = Request::read(&mut from_client).unwrap();
            Response::Conversation {
                prompts: vec![pamshim_protocol::ConversationPrompt {
                    style: 1,
                    text: Some("Password: ".to_string()),
                }],
            }
            .write(&mut to_client)
            .unwrap();

            match Request::read(&mut from_client).unwrap() {
                Request::AuthenticateResponse { replies } => {
                    assert_eq!(replies.len(), 1);
                    assert_eq!(replies[0].text.as_deref(), Some("hunter2"));
                }
                other => panic!("unexpected request: {other:?}"),
            }

            Response::Authenticate { status: PAM_SUCCESS, delay_retval: PAM_SUCCESS, delay_usec: 0 }
                .write(&mut to_client)
                .unwrap();
        });
        session.set_conv(Arc::new(ScriptedConversation {
            replies: std::sync::Mutex::new(vec![ConversationReply {
                text: Some("hunter2".to_string()),
                retcode: 0,
            }]),
        }));

        let status = session.authenticate(0);
        assert_eq!(status, PAM_SUCCESS);
        session.state = SessionState::Closed;
    }

    #[test]
    fn authenticate_completes_round_trip_even_when_conversation_replies_are_short() {
        let mut session = fake_session(|mut to_client, mut from_client| {
            let _ = Request::read(&mut from_client).unwrap();
            Response::Conversation {
                prompts: vec![pamshim_protocol::ConversationPrompt { style: 1, text: None }],
            }
            .write(&mut to_client)
            .unwrap();

            // The client must still answer with exactly one reply even
            // though the scripted conversation below returns none.
            match Request::read(&mut from_client).unwrap() {
                Request::AuthenticateResponse { replies } => assert_eq!(replies.len(), 1),
                other => panic!("unexpected request: {other:?}"),
            }

            Response::Authenticate { status: PAM_CONV_ERR, delay_retval: PAM_SUCCESS, delay_usec: 0 }
                .write(&mut to_client)
                .unwrap();
        });
        session.set_conv(Arc::new(ScriptedConversation { replies: std::sync::Mutex::new(Vec::new()) }));

        let status = session.authenticate(0);
        assert_eq!(status, PAM_CONV_ERR);
        session.state = SessionState::Closed;
    }

    struct FailingConversation;

    impl Conversation for FailingConversation {
        fn converse(
            &self,
            _prompts: &[pamshim_protocol::ConversationPrompt],
        ) -> std::result::Result<Vec<ConversationReply>, libc::c_int> {
            Err(PAM_BUF_ERR)
        }
    }

    #[test]
    fn authenticate_returns_the_callbacks_own_status_on_conversation_failure() {
        let mut session = fake_session(|mut to_client, mut from_client| {
            let _ = Request::read(&mut from_client).unwrap();
            Response::Conversation {
                prompts: vec![pamshim_protocol::ConversationPrompt {
                    style: 1,
                    text: Some("Password: ".to_string()),
                }],
            }
            .write(&mut to_client)
            .unwrap();

            // Even though the client already knows it's failing locally, it
            // must still answer the round trip so the server doesn't wedge
            // waiting for a reply that never comes.
            match Request::read(&mut from_client).unwrap() {
                Request::AuthenticateResponse { replies } => {
                    assert_eq!(replies.len(), 1);
                    assert_eq!(replies[0].retcode, PAM_BUF_ERR);
                }
                other => panic!("unexpected request: {other:?}"),
            }

            // The server's own eventual status is PAM_SUCCESS here, but the
            // caller should see the callback's PAM_BUF_ERR instead.
            Response::Authenticate { status: PAM_SUCCESS, delay_retval: PAM_SUCCESS, delay_usec: 0 }
                .write(&mut to_client)
                .unwrap();
        });
        session.set_conv(Arc::new(FailingConversation));

        let status = session.authenticate(0);
        assert_eq!(status, PAM_BUF_ERR);
        session.state = SessionState::Closed;
    }

    #[test]
    fn local_items_never_touch_the_wire() {
        let mut session = fake_session(|_to_client, mut from_client| {
            // If the client sent anything for a local-only item, this read
            // would succeed and the test below would hang instead of
            // completing; there's nothing to read here because nothing is
            // sent.
            let _ = Request::read(&mut from_client);
        });
        assert_eq!(session.set_item(ItemType::FailDelay, ItemValue::Text(None)), PAM_SYSTEM_ERR);
        assert_eq!(session.get_item(ItemType::Conv), None);
        session.state = SessionState::Closed;
    }
}
