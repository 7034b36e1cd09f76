use crate::{
    error::{ProtocolError, Result},
    framed::FramedStream,
    message::{read_text, write_text},
};

/// The PAM item types the shim knows how to marshal, plus the two that are
/// deliberately never marshaled at all.
///
/// `Conv` and `FailDelay` are recognized by [`SET_ITEM`]/[`GET_ITEM`]
/// handling on the client but never reach the wire: they identify values
/// (a callback pointer and a fail-delay hook) that only make sense in the
/// client's own address space.
///
/// [`SET_ITEM`]: crate::message::Request::SetItem
/// [`GET_ITEM`]: crate::message::Request::GetItem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Service,
    User,
    UserPrompt,
    Tty,
    RUser,
    RHost,
    AuthTok,
    OldAuthTok,
    XDisplay,
    AuthTokType,
    XAuthData,
    Conv,
    FailDelay,
}

impl ItemType {
    /// Item types that are ever written to the wire. `Conv` and
    /// `FailDelay` are excluded: they never generate wire traffic.
    pub fn is_local_only(self) -> bool {
        matches!(self, ItemType::Conv | ItemType::FailDelay)
    }

    fn wire_tag(self) -> u32 {
        match self {
            ItemType::Service => 1,
            ItemType::User => 2,
            ItemType::UserPrompt => 3,
            ItemType::Tty => 4,
            ItemType::RUser => 5,
            ItemType::RHost => 6,
            ItemType::AuthTok => 7,
            ItemType::OldAuthTok => 8,
            ItemType::XDisplay => 9,
            ItemType::AuthTokType => 10,
            ItemType::XAuthData => 11,
            ItemType::Conv => 12,
            ItemType::FailDelay => 13,
        }
    }

    fn from_wire_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => ItemType::Service,
            2 => ItemType::User,
            3 => ItemType::UserPrompt,
            4 => ItemType::Tty,
            5 => ItemType::RUser,
            6 => ItemType::RHost,
            7 => ItemType::AuthTok,
            8 => ItemType::OldAuthTok,
            9 => ItemType::XDisplay,
            10 => ItemType::AuthTokType,
            11 => ItemType::XAuthData,
            12 => ItemType::Conv,
            13 => ItemType::FailDelay,
            _ => return None,
        })
    }

    pub(crate) fn write(self, s: &mut FramedStream) -> Result<()> {
        s.write_u32(self.wire_tag())
    }

    pub(crate) fn read(s: &mut FramedStream) -> Result<Self> {
        let tag = s.read_u32()?;
        Self::from_wire_tag(tag)
            .ok_or_else(|| ProtocolError::protocol(format!("unrecognized item type tag {tag}")))
    }
}

/// The value carried alongside an `ItemType` in `SET_ITEM`/`GET_ITEM`
/// requests and `ITEM` responses. Never constructed for `Conv` or
/// `FailDelay`, which stay off the wire entirely.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    /// The plain nullable-text shape shared by most item types.
    Text(Option<String>),
    /// `PAM_XAUTHDATA`: `(namelen, name, datalen, data)`. The length
    /// fields are carried verbatim even though the text framing beneath
    /// `name`/`data` already self-describes its own length — that
    /// redundancy mirrors the `pam_xauth_data` struct layout being copied
    /// field-by-field rather than reconstructed from the string lengths.
    XAuthData { name: Option<String>, data: Option<String> },
}

impl ItemValue {
    pub(crate) fn write(&self, item_type: ItemType, s: &mut FramedStream) -> Result<()> {
        match (item_type, self) {
            (
                ItemType::Service
                | ItemType::User
                | ItemType::UserPrompt
                | ItemType::Tty
                | ItemType::RUser
                | ItemType::RHost
                | ItemType::AuthTok
                | ItemType::OldAuthTok
                | ItemType::XDisplay
                | ItemType::AuthTokType,
                ItemValue::Text(text),
            ) => write_text(s, text.as_deref()),
            (ItemType::XAuthData, ItemValue::XAuthData { name, data }) => {
                s.write_i32(text_len(name))?;
                write_text(s, name.as_deref())?;
                s.write_i32(text_len(data))?;
                write_text(s, data.as_deref())
            }
            _ => Err(ProtocolError::protocol("item type/value shape mismatch on write")),
        }
    }

    pub(crate) fn read(item_type: ItemType, s: &mut FramedStream) -> Result<Self> {
        match item_type {
            ItemType::Service
            | ItemType::User
            | ItemType::UserPrompt
            | ItemType::Tty
            | ItemType::RUser
            | ItemType::RHost
            | ItemType::AuthTok
            | ItemType::OldAuthTok
            | ItemType::XDisplay
            | ItemType::AuthTokType => Ok(ItemValue::Text(read_text(s)?)),
            ItemType::XAuthData => {
                let _namelen = s.read_i32()?;
                let name = read_text(s)?;
                let _datalen = s.read_i32()?;
                let data = read_text(s)?;
                Ok(ItemValue::XAuthData { name, data })
            }
            ItemType::Conv | ItemType::FailDelay => {
                Err(ProtocolError::protocol("Conv/FailDelay items never appear on the wire"))
            }
        }
    }
}

fn text_len(text: &Option<String>) -> i32 {
    text.as_ref().map(|s| s.len() as i32).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_only_items_are_conv_and_fail_delay() {
        assert!(ItemType::Conv.is_local_only());
        assert!(ItemType::FailDelay.is_local_only());
        assert!(!ItemType::User.is_local_only());
        assert!(!ItemType::XAuthData.is_local_only());
    }

    #[test]
    fn wire_tag_round_trips_for_every_recognized_type() {
        let all = [
            ItemType::Service,
            ItemType::User,
            ItemType::UserPrompt,
            ItemType::Tty,
            ItemType::RUser,
            ItemType::RHost,
            ItemType::AuthTok,
            ItemType::OldAuthTok,
            ItemType::XDisplay,
            ItemType::AuthTokType,
            ItemType::XAuthData,
            ItemType::Conv,
            ItemType::FailDelay,
        ];
        for item in all {
            assert_eq!(ItemType::from_wire_tag(item.wire_tag()), Some(item));
        }
    }

    #[test]
    fn unrecognized_wire_tag_is_rejected() {
        assert_eq!(ItemType::from_wire_tag(999), None);
    }
}
