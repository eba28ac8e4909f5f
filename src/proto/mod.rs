//! Wire protocol model
//!
//! A `ProtoMsg` is the unit of traffic between devices, the bridge, and
//! users: a small routing header plus an opaque body. Frames travel as
//! single binary WebSocket messages and as message-bus payloads, encoded
//! with the msgpack-layout codec in [`codec`].

pub mod codec;

use std::collections::BTreeMap;

use thiserror::Error;

/// Protocol family tag for remote shell traffic.
pub const PROTO_SHELL: u16 = 1;

/// Shell message types carried in `ProtoHeader::msg_type`.
pub mod msgtype {
    /// Start a new shell on the device.
    pub const NEW: &str = "new";
    /// Tear down the shell for a session.
    pub const STOP: &str = "stop";
    /// Terminal input/output payload.
    pub const SHELL: &str = "shell";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
}

/// Header property key carrying the acting user's id.
pub const PROP_USER_ID: &str = "user_id";

/// Scalar values allowed in `ProtoHeader::properties`.
///
/// Non-negative integers always travel in the unsigned msgpack family, so
/// a round trip through the codec preserves equality.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

/// Routing header of a frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProtoHeader {
    /// Protocol family (`PROTO_SHELL` is the only routed family).
    pub proto: u16,
    /// Message type within the family, e.g. `msgtype::SHELL`.
    pub msg_type: String,
    /// Session this frame belongs to. Empty until stamped by the bridge.
    pub session_id: String,
    /// Scalar metadata. The bridge stamps `user_id` on user-originated
    /// frames; everything else passes through untouched.
    pub properties: BTreeMap<String, PropertyValue>,
}

/// A framed protocol message: header plus opaque body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProtoMsg {
    pub header: ProtoHeader,
    pub body: Vec<u8>,
}

impl ProtoMsg {
    /// A shell-family frame with the given message type and no body.
    pub fn shell(msg_type: &str) -> Self {
        ProtoMsg {
            header: ProtoHeader {
                proto: PROTO_SHELL,
                msg_type: msg_type.to_string(),
                ..Default::default()
            },
            body: Vec::new(),
        }
    }

    /// The `stop` frame the bridge publishes toward a device when a user
    /// connection terminates, so the device-side shell is torn down even
    /// after an abrupt close.
    pub fn stop_shell(session_id: &str, user_id: &str) -> Self {
        let mut msg = ProtoMsg::shell(msgtype::STOP);
        msg.header.session_id = session_id.to_string();
        msg.header
            .properties
            .insert(PROP_USER_ID.to_string(), PropertyValue::from(user_id));
        msg
    }
}

/// Frame codec errors.
#[derive(Debug, Error, PartialEq)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
