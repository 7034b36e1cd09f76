use crate::{
    error::{ProtocolError, Result},
    framed::FramedStream,
    item::{ItemType, ItemValue},
};

/// Arrays and strings decoded off the wire are capped at this many
/// elements/bytes so a corrupt or hostile length prefix can't be used to
/// force an unbounded allocation. Exceeding the cap is reported the same
/// way a real allocation failure would be: [`ProtocolError::Resource`].
const MAX_WIRE_LEN: u64 = 16 * 1024 * 1024;

pub(crate) fn write_text(s: &mut FramedStream, text: Option<&str>) -> Result<()> {
    match text {
        None => s.write_u64(0),
        Some(t) => {
            // the length prefix includes the trailing NUL, matching the
            // source's `strlen(str) + 1`; empty string and absent text
            // would otherwise be indistinguishable.
            let len = t.len() as u64 + 1;
            s.write_u64(len)?;
            s.write_exact(t.as_bytes())?;
            s.write_exact(&[0u8])
        }
    }
}

pub(crate) fn read_text(s: &mut FramedStream) -> Result<Option<String>> {
    let len = s.read_u64()?;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_WIRE_LEN {
        return Err(ProtocolError::Resource);
    }
    // len includes the trailing NUL that was written but never belongs in
    // the Rust `String`.
    let mut buf = vec![0u8; len as usize];
    s.read_exact(&mut buf)?;
    buf.pop(); // drop the NUL
    String::from_utf8(buf).map(Some).map_err(|_| ProtocolError::protocol("text was not valid utf-8"))
}

fn checked_count(raw: u64) -> Result<usize> {
    if raw > MAX_WIRE_LEN {
        return Err(ProtocolError::Resource);
    }
    Ok(raw as usize)
}

/// The session handle + integer flags shape shared by every request that
/// doesn't need its own payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultCall {
    pub handle: u64,
    pub flags: i32,
}

impl DefaultCall {
    fn write(&self, s: &mut FramedStream) -> Result<()> {
        s.write_u64(self.handle)?;
        s.write_i32(self.flags)
    }

    fn read(s: &mut FramedStream) -> Result<Self> {
        let handle = s.read_u64()?;
        let flags = s.read_i32()?;
        Ok(DefaultCall { handle, flags })
    }
}

/// A single reply to a conversation prompt: the user's (possibly absent)
/// text answer and the conversation function's per-message return code.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationReply {
    pub text: Option<String>,
    pub retcode: i32,
}

impl ConversationReply {
    fn write(&self, s: &mut FramedStream) -> Result<()> {
        write_text(s, self.text.as_deref())?;
        s.write_i32(self.retcode)
    }

    fn read(s: &mut FramedStream) -> Result<Self> {
        let text = read_text(s)?;
        let retcode = s.read_i32()?;
        Ok(ConversationReply { text, retcode })
    }
}

/// A single conversation prompt: the PAM message style
/// (`PAM_PROMPT_ECHO_OFF` and friends) and the prompt text.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationPrompt {
    pub style: i32,
    pub text: Option<String>,
}

impl ConversationPrompt {
    fn write(&self, s: &mut FramedStream) -> Result<()> {
        s.write_i32(self.style)?;
        write_text(s, self.text.as_deref())
    }

    fn read(s: &mut FramedStream) -> Result<Self> {
        let style = s.read_i32()?;
        let text = read_text(s)?;
        Ok(ConversationPrompt { style, text })
    }
}

fn write_array<T>(s: &mut FramedStream, items: &[T], write_one: impl Fn(&T, &mut FramedStream) -> Result<()>) -> Result<()> {
    s.write_u64(items.len() as u64)?;
    for item in items {
        write_one(item, s)?;
    }
    Ok(())
}

fn read_array<T>(s: &mut FramedStream, read_one: impl Fn(&mut FramedStream) -> Result<T>) -> Result<Vec<T>> {
    let count = checked_count(s.read_u64()?)?;
    // allocated up front, then filled element by element; if an element
    // fails to decode the partially-built Vec is simply dropped, freeing
    // whatever elements were already pushed.
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_one(s)?);
    }
    Ok(out)
}

macro_rules! tag_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        enum $name { $($variant),+ }

        impl $name {
            fn to_wire(self) -> u32 {
                match self { $($name::$variant => $value),+ }
            }

            fn from_wire(v: u32) -> Option<Self> {
                match v {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

tag_enum!(RequestTag {
    None = 0,
    Start = 1,
    End = 2,
    Authenticate = 3,
    SetCred = 4,
    AcctMgmt = 5,
    OpenSession = 6,
    CloseSession = 7,
    ChangeAuthTok = 8,
    FailDelay = 9,
    AuthenticateResponse = 10,
    SetItem = 11,
    GetItem = 12,
    PutEnv = 13,
    GetEnv = 14,
    GetEnvList = 15,
    StrError = 16,
});

tag_enum!(ResponseTag {
    None = 0,
    Handle = 1,
    Result = 2,
    Conversation = 3,
    Authenticate = 4,
    Item = 5,
    String = 6,
    StringList = 7,
});

/// A request sent from the client session to the server loop.
///
/// `GetItem` and the `PutEnv`/`GetEnv` pair are each modeled as their own
/// variant with the payload their name implies — `(handle, item_type)` for
/// `GetItem`, `(handle, name)` for the env requests — rather than sharing
/// a `switch` arm the way the source's request codec did, which resolves
/// the ambiguous fallthrough the distilled spec calls out.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Start { service_name: String, user: String, confdir: Option<String> },
    End(DefaultCall),
    Authenticate(DefaultCall),
    SetCred(DefaultCall),
    AcctMgmt(DefaultCall),
    OpenSession(DefaultCall),
    CloseSession(DefaultCall),
    ChangeAuthTok(DefaultCall),
    FailDelay(DefaultCall),
    StrError(DefaultCall),
    GetEnvList(DefaultCall),
    AuthenticateResponse { replies: Vec<ConversationReply> },
    SetItem { handle: u64, item_type: ItemType, value: ItemValue },
    GetItem { handle: u64, item_type: ItemType },
    PutEnv { handle: u64, text: String },
    GetEnv { handle: u64, name: String },
}

impl Request {
    /// Encodes the request and flushes the stream, making the write a
    /// single kernel-visible unit.
    pub fn write(&self, s: &mut FramedStream) -> Result<()> {
        self.encode(s)?;
        s.flush()
    }

    fn encode(&self, s: &mut FramedStream) -> Result<()> {
        match self {
            Request::Start { service_name, user, confdir } => {
                s.write_u32(RequestTag::Start.to_wire())?;
                write_text(s, Some(service_name))?;
                write_text(s, Some(user))?;
                write_text(s, confdir.as_deref())
            }
            Request::End(c) => write_tagged_default(s, RequestTag::End, c),
            Request::Authenticate(c) => write_tagged_default(s, RequestTag::Authenticate, c),
            Request::SetCred(c) => write_tagged_default(s, RequestTag::SetCred, c),
            Request::AcctMgmt(c) => write_tagged_default(s, RequestTag::AcctMgmt, c),
            Request::OpenSession(c) => write_tagged_default(s, RequestTag::OpenSession, c),
            Request::CloseSession(c) => write_tagged_default(s, RequestTag::CloseSession, c),
            Request::ChangeAuthTok(c) => write_tagged_default(s, RequestTag::ChangeAuthTok, c),
            Request::FailDelay(c) => write_tagged_default(s, RequestTag::FailDelay, c),
            Request::StrError(c) => write_tagged_default(s, RequestTag::StrError, c),
            Request::GetEnvList(c) => write_tagged_default(s, RequestTag::GetEnvList, c),
            Request::AuthenticateResponse { replies } => {
                s.write_u32(RequestTag::AuthenticateResponse.to_wire())?;
                write_array(s, replies, ConversationReply::write)
            }
            Request::SetItem { handle, item_type, value } => {
                s.write_u32(RequestTag::SetItem.to_wire())?;
                s.write_u64(*handle)?;
                item_type.write(s)?;
                value.write(*item_type, s)
            }
            Request::GetItem { handle, item_type } => {
                s.write_u32(RequestTag::GetItem.to_wire())?;
                s.write_u64(*handle)?;
                item_type.write(s)
            }
            Request::PutEnv { handle, text } => {
                s.write_u32(RequestTag::PutEnv.to_wire())?;
                s.write_u64(*handle)?;
                write_text(s, Some(text))
            }
            Request::GetEnv { handle, name } => {
                s.write_u32(RequestTag::GetEnv.to_wire())?;
                s.write_u64(*handle)?;
                write_text(s, Some(name))
            }
        }
    }

    /// Decodes a request. An unknown or `NONE` tag fails with
    /// [`ProtocolError::Protocol`] — there is no partially constructed
    /// `Request` left behind to reset, since decoding a Rust enum either
    /// succeeds completely or not at all.
    pub fn read(s: &mut FramedStream) -> Result<Self> {
        let tag = s.read_u32()?;
        let tag = RequestTag::from_wire(tag)
            .ok_or_else(|| ProtocolError::protocol(format!("unrecognized request tag {tag}")))?;

        match tag {
            RequestTag::None => Err(ProtocolError::protocol("received NONE request tag")),
            RequestTag::Start => {
                let service_name = read_text(s)?
                    .ok_or_else(|| ProtocolError::protocol("START service name must not be null"))?;
                let user =
                    read_text(s)?.ok_or_else(|| ProtocolError::protocol("START user must not be null"))?;
                let confdir = read_text(s)?;
                Ok(Request::Start { service_name, user, confdir })
            }
            RequestTag::End => Ok(Request::End(DefaultCall::read(s)?)),
            RequestTag::Authenticate => Ok(Request::Authenticate(DefaultCall::read(s)?)),
            RequestTag::SetCred => Ok(Request::SetCred(DefaultCall::read(s)?)),
            RequestTag::AcctMgmt => Ok(Request::AcctMgmt(DefaultCall::read(s)?)),
            RequestTag::OpenSession => Ok(Request::OpenSession(DefaultCall::read(s)?)),
            RequestTag::CloseSession => Ok(Request::CloseSession(DefaultCall::read(s)?)),
            RequestTag::ChangeAuthTok => Ok(Request::ChangeAuthTok(DefaultCall::read(s)?)),
            RequestTag::FailDelay => Ok(Request::FailDelay(DefaultCall::read(s)?)),
            RequestTag::StrError => Ok(Request::StrError(DefaultCall::read(s)?)),
            RequestTag::GetEnvList => Ok(Request::GetEnvList(DefaultCall::read(s)?)),
            RequestTag::AuthenticateResponse => {
                let replies = read_array(s, ConversationReply::read)?;
                Ok(Request::AuthenticateResponse { replies })
            }
            RequestTag::SetItem => {
                let handle = s.read_u64()?;
                let item_type = ItemType::read(s)?;
                let value = ItemValue::read(item_type, s)?;
                Ok(Request::SetItem { handle, item_type, value })
            }
            RequestTag::GetItem => {
                let handle = s.read_u64()?;
                let item_type = ItemType::read(s)?;
                Ok(Request::GetItem { handle, item_type })
            }
            RequestTag::PutEnv => {
                let handle = s.read_u64()?;
                let text = read_text(s)?.ok_or_else(|| ProtocolError::protocol("PUTENV text must not be null"))?;
                Ok(Request::PutEnv { handle, text })
            }
            RequestTag::GetEnv => {
                let handle = s.read_u64()?;
                let name = read_text(s)?.ok_or_else(|| ProtocolError::protocol("GETENV name must not be null"))?;
                Ok(Request::GetEnv { handle, name })
            }
        }
    }
}

fn write_tagged_default(s: &mut FramedStream, tag: RequestTag, call: &DefaultCall) -> Result<()> {
    s.write_u32(tag.to_wire())?;
    call.write(s)
}

/// A response sent from the server loop back to the client session.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Handle { status: i32, handle: u64 },
    Result { status: i32 },
    /// Non-terminating: the client must answer with exactly one
    /// `AuthenticateResponse` request before the server produces any
    /// further message for the in-flight `AUTHENTICATE`.
    Conversation { prompts: Vec<ConversationPrompt> },
    Authenticate { status: i32, delay_retval: i32, delay_usec: i64 },
    Item { status: i32, item_type: ItemType, value: Option<ItemValue> },
    String { text: Option<String> },
    StringList { items: Vec<String> },
}

impl Response {
    /// Encodes the response and flushes the stream.
    pub fn write(&self, s: &mut FramedStream) -> Result<()> {
        self.encode(s)?;
        s.flush()
    }

    fn encode(&self, s: &mut FramedStream) -> Result<()> {
        match self {
            Response::Handle { status, handle } => {
                s.write_u32(ResponseTag::Handle.to_wire())?;
                s.write_i32(*status)?;
                s.write_u64(*handle)
            }
            Response::Result { status } => {
                s.write_u32(ResponseTag::Result.to_wire())?;
                s.write_i32(*status)
            }
            Response::Conversation { prompts } => {
                s.write_u32(ResponseTag::Conversation.to_wire())?;
                write_array(s, prompts, ConversationPrompt::write)
            }
            Response::Authenticate { status, delay_retval, delay_usec } => {
                s.write_u32(ResponseTag::Authenticate.to_wire())?;
                s.write_i32(*status)?;
                s.write_i32(*delay_retval)?;
                s.write_i64(*delay_usec)
            }
            Response::Item { status, item_type, value } => {
                s.write_u32(ResponseTag::Item.to_wire())?;
                s.write_i32(*status)?;
                item_type.write(s)?;
                match value {
                    Some(v) => v.write(*item_type, s),
                    None => Ok(()),
                }
            }
            Response::String { text } => {
                s.write_u32(ResponseTag::String.to_wire())?;
                write_text(s, text.as_deref())
            }
            Response::StringList { items } => {
                s.write_u32(ResponseTag::StringList.to_wire())?;
                s.write_u64(items.len() as u64)?;
                for item in items {
                    write_text(s, Some(item))?;
                }
                Ok(())
            }
        }
    }

    /// Decodes a response. Sets no partial state on failure: an `Err`
    /// means nothing was constructed.
    pub fn read(s: &mut FramedStream) -> Result<Self> {
        let tag = s.read_u32()?;
        let tag = ResponseTag::from_wire(tag)
            .ok_or_else(|| ProtocolError::protocol(format!("unrecognized response tag {tag}")))?;

        match tag {
            ResponseTag::None => Err(ProtocolError::protocol("received NONE response tag")),
            ResponseTag::Handle => {
                let status = s.read_i32()?;
                let handle = s.read_u64()?;
                Ok(Response::Handle { status, handle })
            }
            ResponseTag::Result => Ok(Response::Result { status: s.read_i32()? }),
            ResponseTag::Conversation => {
                let prompts = read_array(s, ConversationPrompt::read)?;
                Ok(Response::Conversation { prompts })
            }
            ResponseTag::Authenticate => {
                let status = s.read_i32()?;
                let delay_retval = s.read_i32()?;
                let delay_usec = s.read_i64()?;
                Ok(Response::Authenticate { status, delay_retval, delay_usec })
            }
            ResponseTag::Item => {
                let status = s.read_i32()?;
                let item_type = ItemType::read(s)?;
                let value = if item_type.is_local_only() {
                    None
                } else {
                    Some(ItemValue::read(item_type, s)?)
                };
                Ok(Response::Item { status, item_type, value })
            }
            ResponseTag::String => Ok(Response::String { text: read_text(s)? }),
            ResponseTag::StringList => {
                let count = checked_count(s.read_u64()?)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let item = read_text(s)?
                        .ok_or_else(|| ProtocolError::protocol("STRING_LIST entries must not be null"))?;
                    items.push(item);
                }
                Ok(Response::StringList { items })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

    use super::*;

    fn pipe_pair() -> (FramedStream, FramedStream) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        (FramedStream::from_owned_fd(r), FramedStream::from_owned_fd(w))
    }

    // writes happen on a background thread so a full pipe can't deadlock
    // the test when a message is larger than the kernel pipe buffer.

    #[test]
    fn start_request_round_trips_with_null_confdir() {
        let (mut r, mut w) = pipe_pair();
        let req = Request::Start { service_name: "login".into(), user: "alice".into(), confdir: None };
        std::thread::spawn({
            let req = req.clone();
            move || req.write(&mut w).unwrap()
        });
        let got = Request::read(&mut r).unwrap();
        assert_eq!(got, req);
    }

    #[test]
    fn default_call_round_trips() {
        let (mut r, mut w) = pipe_pair();
        let req = Request::Authenticate(DefaultCall { handle: 0xABCD, flags: 7 });
        std::thread::spawn({
            let req = req.clone();
            move || req.write(&mut w).unwrap()
        });
        let got = Request::read(&mut r).unwrap();
        assert_eq!(got, req);
    }

    #[test]
    fn empty_text_round_trips_as_null_not_empty_string() {
        let (mut r, mut w) = pipe_pair();
        let req = Request::PutEnv { handle: 1, text: "X=1".into() };
        std::thread::spawn({
            let req = req.clone();
            move || req.write(&mut w).unwrap()
        });
        let got = Request::read(&mut r).unwrap();
        assert_eq!(got, req);

        let (mut r2, mut w2) = pipe_pair();
        let resp = Response::String { text: None };
        std::thread::spawn({
            let resp = resp.clone();
            move || resp.write(&mut w2).unwrap()
        });
        let got = Response::read(&mut r2).unwrap();
        assert_eq!(got, Response::String { text: None });
    }

    #[test]
    fn authenticate_response_array_round_trips() {
        let (mut r, mut w) = pipe_pair();
        let req = Request::AuthenticateResponse {
            replies: vec![ConversationReply { text: Some("hunter2".into()), retcode: 0 }],
        };
        std::thread::spawn({
            let req = req.clone();
            move || req.write(&mut w).unwrap()
        });
        let got = Request::read(&mut r).unwrap();
        assert_eq!(got, req);
    }

    #[test]
    fn conversation_response_round_trips() {
        let (mut r, mut w) = pipe_pair();
        let resp = Response::Conversation {
            prompts: vec![ConversationPrompt { style: 1, text: Some("Password: ".into()) }],
        };
        std::thread::spawn({
            let resp = resp.clone();
            move || resp.write(&mut w).unwrap()
        });
        let got = Response::read(&mut r).unwrap();
        assert_eq!(got, resp);
    }

    #[test]
    fn xauthdata_item_round_trips() {
        let (mut r, mut w) = pipe_pair();
        let value = ItemValue::XAuthData {
            name: Some("MIT-MAGIC-COOKIE-1".into()),
            data: Some("0123456789abcdef".into()),
        };
        let resp = Response::Item { status: 0, item_type: ItemType::XAuthData, value: Some(value) };
        std::thread::spawn({
            let resp = resp.clone();
            move || resp.write(&mut w).unwrap()
        });
        let got = Response::read(&mut r).unwrap();
        assert_eq!(got, resp);
    }

    #[test]
    fn string_list_round_trips() {
        let (mut r, mut w) = pipe_pair();
        let resp = Response::StringList { items: vec!["A=1".into(), "B=2".into()] };
        std::thread::spawn({
            let resp = resp.clone();
            move || resp.write(&mut w).unwrap()
        });
        let got = Response::read(&mut r).unwrap();
        assert_eq!(got, resp);
    }

    #[test]
    fn unknown_request_tag_is_a_protocol_error() {
        let (mut r, mut w) = pipe_pair();
        std::thread::spawn(move || {
            w.write_exact(&255u32.to_ne_bytes()).unwrap();
            w.flush().unwrap();
        });
        let err = Request::read(&mut r).unwrap_err();
        assert!(matches!(err, ProtocolError::Protocol(_)));
    }

    #[test]
    fn unknown_item_type_is_rejected() {
        let (mut r, mut w) = pipe_pair();
        std::thread::spawn(move || {
            w.write_exact(&255u32.to_ne_bytes()).unwrap();
            w.flush().unwrap();
        });
        let err = ItemType::read(&mut r).unwrap_err();
        assert!(matches!(err, ProtocolError::Protocol(_)));
    }
}
