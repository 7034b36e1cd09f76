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

//! The `extern "C"` application-facing surface: a drop-in replacement for
//! the platform `libpam`. Every entry point here adapts between C calling
//! convention and the safe [`crate::client::Session`] API, and owns the
//! *deferred-free list* — pointers the real library's contract says must
//! stay valid until `pam_end`, which this shim reproduces by stashing them
//! on the opaque handle instead of leaking them outright.

use std::{
    ffi::{c_void, CStr, CString},
    os::raw::{c_char, c_int},
    ptr,
    sync::Arc,
};

use pamshim_protocol::{ConversationPrompt, ConversationReply, ItemType, ItemValue};

use crate::{
    client::{Conversation, FailDelayFn, Session},
    config::ShimConfig,
    consts::{PAM_CONV_ERR, PAM_SUCCESS, PAM_SYSTEM_ERR},
};

/// Opaque to callers, matching `pam_handle_t` in the real API. Never
/// constructed by a caller; only handed back the pointer this crate gave
/// them via `pam_start`/`pam_start_confdir`.
pub enum pam_handle_t {}

/// Mirrors `struct pam_message`: one conversation prompt as the host
/// application's conversation function expects to receive it.
#[repr(C)]
pub struct pam_message {
    pub msg_style: c_int,
    pub msg: *const c_char,
}

/// Mirrors `struct pam_response`: one conversation reply as the host
/// application's conversation function is expected to allocate it. The
/// `resp` pointer, if non-null, is freed with `free(3)` by this shim after
/// it has been copied out, matching the real library's contract that the
/// *caller* of the conversation function owns and frees the response
/// array and its strings.
#[repr(C)]
pub struct pam_response {
    pub resp: *mut c_char,
    pub resp_retcode: c_int,
}

type ConvFn = unsafe extern "C" fn(
    num_msg: c_int,
    msg: *const *const pam_message,
    resp: *mut *mut pam_response,
    appdata_ptr: *mut c_void,
) -> c_int;

/// Mirrors `struct pam_conv`: the conversation function pointer plus the
/// opaque application data the real library threads through unexamined.
#[repr(C)]
pub struct pam_conv {
    pub conv: Option<ConvFn>,
    pub appdata_ptr: *mut c_void,
}

struct HostConversation {
    conv: ConvFn,
    appdata_ptr: *mut c_void,
}

// SAFETY: the pointer is opaque application data the host application
// passed in; we never touch it ourselves, only hand it back to `conv`. The
// function pointer itself is plain code.
unsafe impl Send for HostConversation {}
unsafe impl Sync for HostConversation {}

impl Conversation for HostConversation {
    fn converse(&self, prompts: &[ConversationPrompt]) -> Result<Vec<ConversationReply>, c_int> {
        let texts: Vec<CString> = prompts
            .iter()
            .map(|p| CString::new(p.text.clone().unwrap_or_default()).unwrap_or_default())
            .collect();
        let messages: Vec<pam_message> = prompts
            .iter()
            .zip(&texts)
            .map(|(p, text)| pam_message { msg_style: p.style, msg: text.as_ptr() })
            .collect();
        let message_ptrs: Vec<*const pam_message> = messages.iter().map(|m| m as *const pam_message).collect();

        let mut resp: *mut pam_response = ptr::null_mut();
        // SAFETY: `message_ptrs` is a valid array of `message_ptrs.len()`
        // live `pam_message` pointers for the duration of this call; `resp`
        // is an out-param the callee is expected to allocate into.
        let status = unsafe {
            (self.conv)(message_ptrs.len() as c_int, message_ptrs.as_ptr(), &mut resp, self.appdata_ptr)
        };
        if status != PAM_SUCCESS || resp.is_null() {
            return Err(status);
        }

        let mut replies = Vec::with_capacity(message_ptrs.len());
        for i in 0..message_ptrs.len() {
            // SAFETY: the callee allocated `message_ptrs.len()` entries on
            // success, per the real conversation function contract.
            let entry = unsafe { &*resp.add(i) };
            let text = if entry.resp.is_null() {
                None
            } else {
                // SAFETY: `entry.resp`, if non-null, is a NUL-terminated
                // string the callee allocated with the C allocator.
                let s = unsafe { CStr::from_ptr(entry.resp) }.to_string_lossy().into_owned();
                unsafe { libc::free(entry.resp as *mut c_void) };
                Some(s)
            };
            replies.push(ConversationReply { text, retcode: entry.resp_retcode });
        }
        // SAFETY: `resp` itself was allocated by the callee with the C
        // allocator; we free the array once every element has been read.
        unsafe { libc::free(resp as *mut c_void) };
        Ok(replies)
    }
}

/// Pointers handed back to a C caller that must outlive the call that
/// produced them, drained at `pam_end`.
enum Deferred {
    Text(*mut c_char),
    EnvList(*mut *mut c_char),
}

/// The real, boxed state behind an opaque `pam_handle_t *`.
struct Handle {
    session: Session,
    deferred: Vec<Deferred>,
}

impl Handle {
    fn drain_deferred(&mut self) {
        for item in self.deferred.drain(..) {
            // SAFETY: every pointer here was allocated by this module with
            // `CString::into_raw`/`libc::malloc` and handed out exactly
            // once; nothing else holds or frees it.
            unsafe {
                match item {
                    Deferred::Text(p) => {
                        if !p.is_null() {
                            drop(CString::from_raw(p));
                        }
                    }
                    Deferred::EnvList(list) => free_envlist(list),
                }
            }
        }
    }
}

unsafe fn free_envlist(list: *mut *mut c_char) {
    if list.is_null() {
        return;
    }
    let mut i = 0isize;
    loop {
        let entry = *list.offset(i);
        if entry.is_null() {
            break;
        }
        drop(CString::from_raw(entry));
        i += 1;
    }
    libc::free(list as *mut c_void);
}

fn as_handle<'a>(pamh: *mut pam_handle_t) -> Option<&'a mut Handle> {
    if pamh.is_null() {
        None
    } else {
        // SAFETY: every live `pam_handle_t *` given to a caller was built
        // from `Box::into_raw(Box::new(Handle { .. })).cast()` in
        // `start`/`start_confdir` and not freed until `pam_end`.
        Some(unsafe { &mut *(pamh as *mut Handle) })
    }
}

fn owned_text(s: Option<String>, handle: &mut Handle) -> *const c_char {
    match s.and_then(|s| CString::new(s).ok()) {
        Some(c) => {
            let ptr = c.into_raw();
            handle.deferred.push(Deferred::Text(ptr));
            ptr
        }
        None => ptr::null(),
    }
}

fn start_common(
    service_name: *const c_char,
    user: *const c_char,
    pam_conversation: *const pam_conv,
    confdir: Option<&str>,
    pamh: *mut *mut pam_handle_t,
) -> c_int {
    if pamh.is_null() || service_name.is_null() || user.is_null() || pam_conversation.is_null() {
        return PAM_SYSTEM_ERR;
    }
    // SAFETY: both pointers are documented by the real API to be
    // NUL-terminated strings valid for the duration of this call.
    let service_name = unsafe { CStr::from_ptr(service_name) }.to_string_lossy().into_owned();
    let user = unsafe { CStr::from_ptr(user) }.to_string_lossy().into_owned();
    // SAFETY: the caller guarantees `pam_conversation` points at a live
    // `pam_conv` for the duration of this call; we only copy its fields.
    let conv_struct = unsafe { &*pam_conversation };
    let conv: Arc<dyn Conversation> = match conv_struct.conv {
        Some(f) => Arc::new(HostConversation { conv: f, appdata_ptr: conv_struct.appdata_ptr }),
        None => return PAM_SYSTEM_ERR,
    };

    let config = ShimConfig::from_env();
    crate::logging::init_subscriber(&config);

    match Session::start(&config, &service_name, &user, confdir, conv) {
        Ok(session) => {
            let handle = Box::new(Handle { session, deferred: Vec::new() });
            unsafe { *pamh = Box::into_raw(handle) as *mut pam_handle_t };
            PAM_SUCCESS
        }
        Err(status) => {
            unsafe { *pamh = ptr::null_mut() };
            status
        }
    }
}

/// # Safety
/// `service_name`, `user`, and `pam_conversation` must be valid for the
/// duration of the call; `pamh` must be a valid out-pointer.
#[no_mangle]
pub unsafe extern "C" fn pam_start(
    service_name: *const c_char,
    user: *const c_char,
    pam_conversation: *const pam_conv,
    pamh: *mut *mut pam_handle_t,
) -> c_int {
    start_common(service_name, user, pam_conversation, None, pamh)
}

/// # Safety
/// Same requirements as [`pam_start`], plus `confdir` must be NUL-terminated
/// and valid for the duration of the call if non-null.
#[no_mangle]
pub unsafe extern "C" fn pam_start_confdir(
    service_name: *const c_char,
    user: *const c_char,
    pam_conversation: *const pam_conv,
    confdir: *const c_char,
    pamh: *mut *mut pam_handle_t,
) -> c_int {
    let confdir = if confdir.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(confdir) }.to_string_lossy().into_owned())
    };
    start_common(service_name, user, pam_conversation, confdir.as_deref(), pamh)
}

/// # Safety
/// `pamh` must be a handle previously returned by `pam_start`/
/// `pam_start_confdir`, not yet passed to `pam_end`.
#[no_mangle]
pub unsafe extern "C" fn pam_end(pamh: *mut pam_handle_t, pam_status: c_int) -> c_int {
    if pamh.is_null() {
        return PAM_SYSTEM_ERR;
    }
    // SAFETY: reclaiming ownership of the box this handle's creator leaked.
    let mut handle = unsafe { Box::from_raw(pamh as *mut Handle) };
    let status = handle.session.end(pam_status);
    handle.drain_deferred();
    status
}

macro_rules! default_call_fn {
    ($name:ident, $method:ident) => {
        /// # Safety
        /// `pamh` must be a live handle from `pam_start`/`pam_start_confdir`.
        #[no_mangle]
        pub unsafe extern "C" fn $name(pamh: *mut pam_handle_t, flags: c_int) -> c_int {
            match as_handle(pamh) {
                Some(handle) => handle.session.$method(flags),
                None => PAM_SYSTEM_ERR,
            }
        }
    };
}

default_call_fn!(pam_authenticate, authenticate);
default_call_fn!(pam_setcred, setcred);
default_call_fn!(pam_acct_mgmt, acct_mgmt);
default_call_fn!(pam_open_session, open_session);
default_call_fn!(pam_close_session, close_session);
default_call_fn!(pam_chauthtok, chauthtok);

/// # Safety
/// `pamh` must be a live handle from `pam_start`/`pam_start_confdir`.
#[no_mangle]
pub unsafe extern "C" fn pam_fail_delay(pamh: *mut pam_handle_t, usec: c_int) -> c_int {
    match as_handle(pamh) {
        Some(handle) => handle.session.fail_delay(usec),
        None => PAM_SYSTEM_ERR,
    }
}

/// # Safety
/// `pamh` must be a live handle. The returned pointer is owned by the
/// session and must not be freed by the caller; it remains valid until
/// `pam_end`.
#[no_mangle]
pub unsafe extern "C" fn pam_strerror(pamh: *mut pam_handle_t, errnum: c_int) -> *const c_char {
    match as_handle(pamh) {
        Some(handle) => {
            let text = handle.session.strerror(errnum);
            owned_text(text, handle)
        }
        None => ptr::null(),
    }
}

/// # Safety
/// `pamh` must be a live handle; `name_value` must be a NUL-terminated
/// string valid for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn pam_putenv(pamh: *mut pam_handle_t, name_value: *const c_char) -> c_int {
    if name_value.is_null() {
        return PAM_SYSTEM_ERR;
    }
    let name_value = unsafe { CStr::from_ptr(name_value) }.to_string_lossy().into_owned();
    match as_handle(pamh) {
        Some(handle) => handle.session.putenv(&name_value),
        None => PAM_SYSTEM_ERR,
    }
}

/// # Safety
/// `pamh` must be a live handle; `name` must be a NUL-terminated string
/// valid for the duration of the call. The returned pointer, if non-null,
/// is owned by the session and must not be freed by the caller.
#[no_mangle]
pub unsafe extern "C" fn pam_getenv(pamh: *mut pam_handle_t, name: *const c_char) -> *const c_char {
    if name.is_null() {
        return ptr::null();
    }
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
    match as_handle(pamh) {
        Some(handle) => {
            let value = handle.session.getenv(&name);
            owned_text(value, handle)
        }
        None => ptr::null(),
    }
}

/// # Safety
/// `pamh` must be a live handle. The returned array, if non-null, is owned
/// by the caller, who must free it (and every string inside it) with
/// `free(3)`; matches the real library's contract for this call only.
#[no_mangle]
pub unsafe extern "C" fn pam_getenvlist(pamh: *mut pam_handle_t) -> *mut *mut c_char {
    let handle = match as_handle(pamh) {
        Some(h) => h,
        None => return ptr::null_mut(),
    };
    let Some(items) = handle.session.getenvlist() else {
        return ptr::null_mut();
    };
    let cstrings: Vec<CString> = items.into_iter().map(|s| CString::new(s).unwrap_or_default()).collect();
    // SAFETY: allocated with the C allocator so the caller can free it with
    // `free(3)`, matching the documented contract for this one call.
    let array = unsafe {
        libc::malloc((cstrings.len() + 1) * std::mem::size_of::<*mut c_char>()) as *mut *mut c_char
    };
    if array.is_null() {
        return ptr::null_mut();
    }
    let count = cstrings.len();
    for (i, c) in cstrings.into_iter().enumerate() {
        unsafe { *array.add(i) = c.into_raw() };
    }
    unsafe { *array.add(count) = ptr::null_mut() };
    array
}

/// # Safety
/// `pamh` must be a live handle; `item_type` must be one of the `PAM_*`
/// item constants. For text-shaped items, `item` points at a
/// NUL-terminated string; for `PAM_XAUTHDATA`, at a `pam_xauth_data`-shaped
/// value (not reconstructed here, see the item dispatch notes).
#[no_mangle]
pub unsafe extern "C" fn pam_set_item(
    pamh: *mut pam_handle_t,
    item_type: c_int,
    item: *const c_void,
) -> c_int {
    let Some(handle) = as_handle(pamh) else { return PAM_SYSTEM_ERR };
    let Some(kind) = decode_item_type(item_type) else { return PAM_SYSTEM_ERR };
    if kind.is_local_only() {
        return PAM_SYSTEM_ERR;
    }
    let text = if item.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(item as *const c_char) }.to_string_lossy().into_owned())
    };
    handle.session.set_item(kind, ItemValue::Text(text))
}

/// # Safety
/// `pamh` must be a live handle; `item` is an out-pointer the real API
/// documents callers to treat as read-only and session-owned.
#[no_mangle]
pub unsafe extern "C" fn pam_get_item(
    pamh: *mut pam_handle_t,
    item_type: c_int,
    item: *mut *const c_void,
) -> c_int {
    if item.is_null() {
        return PAM_SYSTEM_ERR;
    }
    let Some(handle) = as_handle(pamh) else { return PAM_SYSTEM_ERR };
    let Some(kind) = decode_item_type(item_type) else { return PAM_SYSTEM_ERR };
    match handle.session.get_item(kind) {
        Some(ItemValue::Text(text)) => {
            unsafe { *item = owned_text(text, handle) as *const c_void };
            PAM_SUCCESS
        }
        // `PAM_XAUTHDATA` is rejected consistently on both `get` and
        // `set` (see the server-side dispatch note): the server never
        // returns a success status with an `XAuthData` value, so this
        // arm is unreachable in practice, not merely unhandled.
        Some(ItemValue::XAuthData { .. }) | None => PAM_SYSTEM_ERR,
    }
}

// Matches the real library's `PAM_ITEM_TYPE` numbering (see the mirror
// table in `server::dispatch::wire_item_type`). `PAM_CONV` and
// `PAM_FAIL_DELAY` are load-bearing here: a caller passing the real
// library's own integer for either must decode to the matching
// `ItemType` so `is_local_only()` intercepts it instead of marshaling
// it over the wire.
fn decode_item_type(tag: c_int) -> Option<ItemType> {
    Some(match tag {
        1 => ItemType::Service,
        2 => ItemType::User,
        3 => ItemType::Tty,
        4 => ItemType::RHost,
        5 => ItemType::Conv,
        6 => ItemType::AuthTok,
        7 => ItemType::OldAuthTok,
        8 => ItemType::RUser,
        9 => ItemType::UserPrompt,
        10 => ItemType::FailDelay,
        11 => ItemType::XDisplay,
        12 => ItemType::XAuthData,
        13 => ItemType::AuthTokType,
        _ => return None,
    })
}

/// Installs the application's conversation callback outside the
/// `pam_set_item`/`PAM_CONV` path, for callers using the safe Rust surface
/// directly rather than the C ABI. Exposed for `pam-shim-cli`.
pub fn set_conv(pamh: *mut pam_handle_t, conv: Arc<dyn Conversation>) {
    if let Some(handle) = as_handle(pamh) {
        handle.session.set_conv(conv);
    }
}

/// Installs a fail-delay hook outside the C ABI, for callers using the
/// safe Rust surface directly.
pub fn set_fail_delay_hook(pamh: *mut pam_handle_t, hook: FailDelayFn) {
    if let Some(handle) = as_handle(pamh) {
        handle.session.set_fail_delay_hook(hook);
    }
}
