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

//! Translates wire requests into calls against the real platform PAM
//! library (via `pam_sys::raw`) and wire responses back. One request in,
//! one response out, except `AUTHENTICATE`, whose conversation callback
//! recurses back into the wire through [`super::conv`].

use std::{
    ffi::{c_void, CStr, CString},
    os::raw::c_int,
};

use pam_sys::{raw as pam, PamConversation, PamHandle, PamMessage, PamResponse};
use pamshim_protocol::{DefaultCall, FramedStream, ItemType, ItemValue, Request, Response};

use super::conv::{converse_over_wire, Prompt};
use crate::consts::{PAM_CONV_ERR, PAM_SUCCESS, PAM_SYSTEM_ERR};

/// Tracks whether a session is open and whether `END` has been seen, per
/// the two-boolean state described in the component design. The server
/// handles exactly one session per process, so there is no session table.
#[derive(Default)]
pub struct ServerState {
    pub running: bool,
    pub did_end: bool,
}

/// Raw pointers to the two framed streams, boxed and leaked for the
/// process lifetime so the conversation trampoline can reach them from
/// inside the real library's call stack. Safe because the server only
/// ever runs a single session and the streams outlive it.
struct Pipes {
    to_client: *mut FramedStream,
    from_client: *mut FramedStream,
}

extern "C" fn conv_trampoline(
    num_msg: c_int,
    msg: *mut *const PamMessage,
    resp: *mut *mut PamResponse,
    appdata_ptr: *mut c_void,
) -> c_int {
    // SAFETY: `appdata_ptr` was set from a `Box::leak`ed `Pipes` at START
    // and outlives every call the real library makes during this
    // process's single session.
    let pipes = unsafe { &*(appdata_ptr as *const Pipes) };
    // SAFETY: the pointers in `pipes` were built from live `&mut
    // FramedStream` references owned by the server's main loop.
    let to_client = unsafe { &mut *pipes.to_client };
    let from_client = unsafe { &mut *pipes.from_client };

    let prompts: Vec<Prompt> = (0..num_msg as isize)
        .map(|i| {
            // SAFETY: the real library guarantees `msg` points to
            // `num_msg` valid `*const PamMessage` entries for the
            // duration of this call.
            let m = unsafe { &**msg.offset(i) };
            Prompt { style: m.msg_style, text: cstr_to_owned(m.msg) }
        })
        .collect();

    match converse_over_wire(to_client, from_client, prompts) {
        Some(replies) => {
            let count = replies.len();
            // allocated with the C allocator: ownership passes to the
            // real library / loaded modules, which free it with libc
            // `free`, not Rust's global allocator.
            let array = unsafe {
                libc::calloc(count.max(1), std::mem::size_of::<PamResponse>()) as *mut PamResponse
            };
            if array.is_null() {
                return PAM_CONV_ERR;
            }
            for (i, reply) in replies.into_iter().enumerate() {
                let resp_ptr = match reply.text {
                    Some(s) => CString::new(s).map(CString::into_raw).unwrap_or(std::ptr::null_mut()),
                    None => std::ptr::null_mut(),
                };
                unsafe {
                    *array.add(i) = PamResponse { resp: resp_ptr, resp_retcode: reply.retcode };
                }
            }
            unsafe { *resp = array };
            PAM_SUCCESS
        }
        None => PAM_CONV_ERR,
    }
}

fn cstr_to_owned(ptr: *const std::os::raw::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: the real library only ever hands us NUL-terminated strings
    // it owns for the duration of the call.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn handle_ptr(raw: u64) -> *mut PamHandle {
    raw as usize as *mut PamHandle
}

pub fn handle(
    state: &mut ServerState,
    request: Request,
    to_client: &mut FramedStream,
    from_client: &mut FramedStream,
) -> Response {
    match request {
        Request::Start { service_name, user, confdir } => {
            if state.running {
                return Response::Handle { status: PAM_SYSTEM_ERR, handle: 0 };
            }
            let (status, ptr) = start(&service_name, &user, confdir.as_deref(), to_client, from_client);
            state.running = status == PAM_SUCCESS;
            Response::Handle { status, handle: ptr as usize as u64 }
        }
        Request::End(DefaultCall { handle, flags }) => {
            state.did_end = true;
            state.running = false;
            let status = unsafe { pam::pam_end(handle_ptr(handle), flags) };
            Response::Result { status }
        }
        Request::Authenticate(DefaultCall { handle, flags }) => {
            let status = unsafe { pam::pam_authenticate(handle_ptr(handle), flags) };
            Response::Result { status }
        }
        Request::SetCred(call) => default_result(call, pam::pam_setcred),
        Request::AcctMgmt(call) => default_result(call, pam::pam_acct_mgmt),
        Request::OpenSession(call) => default_result(call, pam::pam_open_session),
        Request::CloseSession(call) => default_result(call, pam::pam_close_session),
        Request::ChangeAuthTok(call) => default_result(call, pam::pam_chauthtok),
        Request::FailDelay(DefaultCall { handle, flags }) => {
            let status = unsafe { pam::pam_fail_delay(handle_ptr(handle), flags as u32) };
            Response::Result { status }
        }
        Request::StrError(DefaultCall { handle, flags }) => {
            let ptr = unsafe { pam::pam_strerror(handle_ptr(handle), flags) };
            Response::String { text: cstr_to_owned(ptr) }
        }
        Request::GetEnvList(DefaultCall { handle, .. }) => {
            let list = unsafe { pam::pam_getenvlist(handle_ptr(handle)) };
            Response::StringList { items: envlist_to_owned(list) }
        }
        Request::PutEnv { handle, text } => {
            let status = match CString::new(text) {
                Ok(c) => unsafe { pam::pam_putenv(handle_ptr(handle), c.as_ptr()) },
                Err(_) => PAM_SYSTEM_ERR,
            };
            Response::Result { status }
        }
        Request::GetEnv { handle, name } => {
            let text = match CString::new(name) {
                Ok(c) => cstr_to_owned(unsafe { pam::pam_getenv(handle_ptr(handle), c.as_ptr()) }),
                Err(_) => None,
            };
            Response::String { text }
        }
        Request::SetItem { handle, item_type, value } => {
            let status = set_item(handle_ptr(handle), item_type, value);
            Response::Result { status }
        }
        Request::GetItem { handle, item_type } => {
            let (status, value) = get_item(handle_ptr(handle), item_type);
            Response::Item { status, item_type, value }
        }
        // Only ever consumed inside the conversation loop in
        // `conv_trampoline`; arriving here means the client sent one
        // unprompted.
        Request::AuthenticateResponse { .. } => Response::Result { status: PAM_SYSTEM_ERR },
    }
}

fn default_result(
    call: DefaultCall,
    f: unsafe extern "C" fn(*mut PamHandle, c_int) -> c_int,
) -> Response {
    let status = unsafe { f(handle_ptr(call.handle), call.flags) };
    Response::Result { status }
}

fn start(
    service_name: &str,
    user: &str,
    confdir: Option<&str>,
    to_client: &mut FramedStream,
    from_client: &mut FramedStream,
) -> (c_int, *mut PamHandle) {
    let service_name = match CString::new(service_name) {
        Ok(c) => c,
        Err(_) => return (PAM_SYSTEM_ERR, std::ptr::null_mut()),
    };
    let user = match CString::new(user) {
        Ok(c) => c,
        Err(_) => return (PAM_SYSTEM_ERR, std::ptr::null_mut()),
    };

    // Leaked for the process lifetime: the real library retains the
    // `pam_conv` pointer and may call back through it at any point until
    // `pam_end`, which this single-session server never outlives.
    let pipes = Box::leak(Box::new(Pipes {
        to_client: to_client as *mut FramedStream,
        from_client: from_client as *mut FramedStream,
    }));
    let conv = PamConversation {
        conv: Some(conv_trampoline),
        appdata_ptr: pipes as *mut Pipes as *mut c_void,
    };

    let mut handle: *mut PamHandle = std::ptr::null_mut();
    let status = match confdir {
        None => unsafe { pam::pam_start(service_name.as_ptr(), user.as_ptr(), &conv, &mut handle) },
        Some(dir) => match CString::new(dir) {
            Ok(dir) => unsafe {
                pam::pam_start_confdir(
                    service_name.as_ptr(),
                    user.as_ptr(),
                    &conv,
                    dir.as_ptr(),
                    &mut handle,
                )
            },
            Err(_) => PAM_SYSTEM_ERR,
        },
    };
    (status, handle)
}

fn envlist_to_owned(list: *mut *mut std::os::raw::c_char) -> Vec<String> {
    if list.is_null() {
        return Vec::new();
    }
    let mut out = Vec::new();
    // SAFETY: the real library returns a NUL-terminated array of
    // NUL-terminated strings it has allocated; we only read it here.
    unsafe {
        let mut i = 0isize;
        loop {
            let entry = *list.offset(i);
            if entry.is_null() {
                break;
            }
            out.push(CStr::from_ptr(entry).to_string_lossy().into_owned());
            i += 1;
        }
    }
    out
}

/// Local item types (`CONV`, `FAIL_DELAY`) never reach `dispatch::handle`
/// at all: the client intercepts them before sending anything. Anything
/// else marshals through `pam_set_item`/`pam_get_item` using the shape
/// from the item-type encoding table.
fn set_item(handle: *mut PamHandle, item_type: ItemType, value: ItemValue) -> c_int {
    match (item_type, value) {
        (ItemType::Conv | ItemType::FailDelay, _) => PAM_SYSTEM_ERR,
        (_, ItemValue::Text(text)) => {
            let cstr = match text {
                Some(t) => match CString::new(t) {
                    Ok(c) => c,
                    Err(_) => return PAM_SYSTEM_ERR,
                },
                None => return unsafe {
                    pam::pam_set_item(handle, wire_item_type(item_type), std::ptr::null())
                },
            };
            unsafe { pam::pam_set_item(handle, wire_item_type(item_type), cstr.as_ptr() as *const c_void) }
        }
        (ItemType::XAuthData, ItemValue::XAuthData { .. }) => {
            // Rejected on both set and get (see `get_item`): the real
            // `pam_xauth_data` struct layout is module-ABI-sensitive
            // enough that constructing or reading one here would be
            // guesswork, so this is refused rather than faked.
            PAM_SYSTEM_ERR
        }
        _ => PAM_SYSTEM_ERR,
    }
}

fn get_item(handle: *mut PamHandle, item_type: ItemType) -> (c_int, Option<ItemValue>) {
    if item_type.is_local_only() {
        return (PAM_SYSTEM_ERR, None);
    }
    if item_type == ItemType::XAuthData {
        // `pam_get_item(PAM_XAUTHDATA, ...)` returns a pointer to a
        // `pam_xauth_data` struct (`namelen`/`name`/`datalen`/`data`), not
        // a C string. Reading it through `cstr_to_owned` would interpret
        // the leading `namelen` field's bytes as string data. Rather than
        // guess at that struct's exact layout (the same trade-off noted
        // in `set_item`), this is rejected consistently on both the get
        // and set paths instead of returning garbage.
        return (PAM_SYSTEM_ERR, None);
    }
    let mut out: *const c_void = std::ptr::null();
    let status = unsafe { pam::pam_get_item(handle, wire_item_type(item_type), &mut out) };
    if status != PAM_SUCCESS {
        return (status, None);
    }
    let value = ItemValue::Text(cstr_to_owned(out as *const std::os::raw::c_char));
    (status, Some(value))
}

fn wire_item_type(item_type: ItemType) -> c_int {
    // Matches the real library's `PAM_ITEM_TYPE` numbering, independent
    // of this crate's own wire tag numbering in `pamshim-protocol`. These
    // values are load-bearing for `Conv`/`FailDelay`: a mismatch here
    // means the real library's own `PAM_CONV`/`PAM_FAIL_DELAY` requests
    // get misclassified as marshalable items instead of being rejected by
    // `is_local_only()`.
    match item_type {
        ItemType::Service => 1,
        ItemType::User => 2,
        ItemType::Tty => 3,
        ItemType::RHost => 4,
        ItemType::Conv => 5,
        ItemType::AuthTok => 6,
        ItemType::OldAuthTok => 7,
        ItemType::RUser => 8,
        ItemType::UserPrompt => 9,
        ItemType::FailDelay => 10,
        ItemType::XDisplay => 11,
        ItemType::XAuthData => 12,
        ItemType::AuthTokType => 13,
    }
}
