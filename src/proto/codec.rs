//! Frame encoding and decoding
//!
//! Frames are serialized with a msgpack-compatible byte layout: a
//! two-element array `[header, body]` where the header is a map with keys
//! `proto` (uint), `msg_type` (str), `session_id` (str, optional) and
//! `properties` (map of scalars, optional), and the body is a bin value
//! (nil when empty). Only the type families the wire format needs are
//! implemented; anything else in the input is a malformed frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{PropertyValue, ProtoError, ProtoHeader, ProtoMsg};

const KEY_PROTO: &str = "proto";
const KEY_MSG_TYPE: &str = "msg_type";
const KEY_SESSION_ID: &str = "session_id";
const KEY_PROPERTIES: &str = "properties";

/// Encode a message. Infallible for well-formed inputs.
pub fn encode(msg: &ProtoMsg) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + msg.body.len());
    write_array_len(&mut buf, 2);

    let mut fields = 2u32;
    if !msg.header.session_id.is_empty() {
        fields += 1;
    }
    if !msg.header.properties.is_empty() {
        fields += 1;
    }
    write_map_len(&mut buf, fields);
    write_str(&mut buf, KEY_PROTO);
    write_uint(&mut buf, u64::from(msg.header.proto));
    write_str(&mut buf, KEY_MSG_TYPE);
    write_str(&mut buf, &msg.header.msg_type);
    if !msg.header.session_id.is_empty() {
        write_str(&mut buf, KEY_SESSION_ID);
        write_str(&mut buf, &msg.header.session_id);
    }
    if !msg.header.properties.is_empty() {
        write_str(&mut buf, KEY_PROPERTIES);
        write_map_len(&mut buf, msg.header.properties.len() as u32);
        for (key, value) in &msg.header.properties {
            write_str(&mut buf, key);
            write_value(&mut buf, value);
        }
    }

    if msg.body.is_empty() {
        buf.put_u8(0xc0);
    } else {
        write_bin(&mut buf, &msg.body);
    }
    buf.freeze()
}

/// Decode a message, consuming the whole input.
pub fn decode(mut input: &[u8]) -> Result<ProtoMsg, ProtoError> {
    let buf = &mut input;
    let elems = read_array_len(buf)?;
    if elems != 2 {
        return Err(ProtoError::Malformed("frame is not a two-element array"));
    }

    let mut header = ProtoHeader::default();
    let mut seen_proto = false;
    let mut seen_msg_type = false;
    let fields = read_map_len(buf)?;
    for _ in 0..fields {
        let key = read_str(buf)?;
        match key.as_str() {
            KEY_PROTO => {
                let v = read_uint(buf)?;
                header.proto = u16::try_from(v)
                    .map_err(|_| ProtoError::Malformed("proto tag out of range"))?;
                seen_proto = true;
            }
            KEY_MSG_TYPE => {
                header.msg_type = read_str(buf)?;
                seen_msg_type = true;
            }
            KEY_SESSION_ID => {
                header.session_id = read_str(buf)?;
            }
            KEY_PROPERTIES => {
                let entries = read_map_len(buf)?;
                for _ in 0..entries {
                    let prop_key = read_str(buf)?;
                    let value = read_value(buf)?;
                    header.properties.insert(prop_key, value);
                }
            }
            _ => return Err(ProtoError::Malformed("unknown header field")),
        }
    }
    if !seen_proto || !seen_msg_type {
        return Err(ProtoError::Malformed("header missing proto or msg_type"));
    }

    let body = read_body(buf)?;
    if buf.has_remaining() {
        return Err(ProtoError::Malformed("trailing bytes after frame"));
    }
    Ok(ProtoMsg { header, body })
}

// ---- writers ----

fn write_array_len(buf: &mut BytesMut, len: u32) {
    // the wire only ever carries the outer two-element array
    debug_assert!(len < 16);
    buf.put_u8(0x90 | len as u8);
}

fn write_map_len(buf: &mut BytesMut, len: u32) {
    if len < 16 {
        buf.put_u8(0x80 | len as u8);
    } else if len <= u32::from(u16::MAX) {
        buf.put_u8(0xde);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0xdf);
        buf.put_u32(len);
    }
}

fn write_str(buf: &mut BytesMut, s: &str) {
    let len = s.len();
    if len < 32 {
        buf.put_u8(0xa0 | len as u8);
    } else if len <= usize::from(u8::MAX) {
        buf.put_u8(0xd9);
        buf.put_u8(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(0xda);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0xdb);
        buf.put_u32(len as u32);
    }
    buf.put_slice(s.as_bytes());
}

fn write_bin(buf: &mut BytesMut, b: &[u8]) {
    let len = b.len();
    if len <= usize::from(u8::MAX) {
        buf.put_u8(0xc4);
        buf.put_u8(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(0xc5);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0xc6);
        buf.put_u32(len as u32);
    }
    buf.put_slice(b);
}

fn write_uint(buf: &mut BytesMut, v: u64) {
    if v < 0x80 {
        buf.put_u8(v as u8);
    } else if v <= u64::from(u8::MAX) {
        buf.put_u8(0xcc);
        buf.put_u8(v as u8);
    } else if v <= u64::from(u16::MAX) {
        buf.put_u8(0xcd);
        buf.put_u16(v as u16);
    } else if v <= u64::from(u32::MAX) {
        buf.put_u8(0xce);
        buf.put_u32(v as u32);
    } else {
        buf.put_u8(0xcf);
        buf.put_u64(v);
    }
}

fn write_int(buf: &mut BytesMut, v: i64) {
    if v >= 0 {
        write_uint(buf, v as u64);
    } else if v >= -32 {
        buf.put_i8(v as i8);
    } else if v >= i64::from(i8::MIN) {
        buf.put_u8(0xd0);
        buf.put_i8(v as i8);
    } else if v >= i64::from(i16::MIN) {
        buf.put_u8(0xd1);
        buf.put_i16(v as i16);
    } else if v >= i64::from(i32::MIN) {
        buf.put_u8(0xd2);
        buf.put_i32(v as i32);
    } else {
        buf.put_u8(0xd3);
        buf.put_i64(v);
    }
}

fn write_value(buf: &mut BytesMut, value: &PropertyValue) {
    match value {
        PropertyValue::Bool(b) => buf.put_u8(if *b { 0xc3 } else { 0xc2 }),
        PropertyValue::Int(v) => write_int(buf, *v),
        PropertyValue::Str(s) => write_str(buf, s),
        PropertyValue::Bytes(b) => write_bin(buf, b),
    }
}

// ---- readers ----

fn need(buf: &&[u8], n: usize) -> Result<(), ProtoError> {
    if buf.remaining() < n {
        Err(ProtoError::Malformed("truncated frame"))
    } else {
        Ok(())
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, ProtoError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn read_array_len(buf: &mut &[u8]) -> Result<u32, ProtoError> {
    let tag = take_u8(buf)?;
    match tag {
        0x90..=0x9f => Ok(u32::from(tag & 0x0f)),
        0xdc => {
            need(buf, 2)?;
            Ok(u32::from(buf.get_u16()))
        }
        0xdd => {
            need(buf, 4)?;
            Ok(buf.get_u32())
        }
        _ => Err(ProtoError::Malformed("expected array")),
    }
}

fn read_map_len(buf: &mut &[u8]) -> Result<u32, ProtoError> {
    let tag = take_u8(buf)?;
    match tag {
        0x80..=0x8f => Ok(u32::from(tag & 0x0f)),
        0xde => {
            need(buf, 2)?;
            Ok(u32::from(buf.get_u16()))
        }
        0xdf => {
            need(buf, 4)?;
            Ok(buf.get_u32())
        }
        0xc0 => Ok(0),
        _ => Err(ProtoError::Malformed("expected map")),
    }
}

fn read_exact(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, ProtoError> {
    need(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn read_str(buf: &mut &[u8]) -> Result<String, ProtoError> {
    let tag = take_u8(buf)?;
    let len = match tag {
        0xa0..=0xbf => usize::from(tag & 0x1f),
        0xd9 => usize::from(take_u8(buf)?),
        0xda => {
            need(buf, 2)?;
            usize::from(buf.get_u16())
        }
        0xdb => {
            need(buf, 4)?;
            buf.get_u32() as usize
        }
        _ => return Err(ProtoError::Malformed("expected string")),
    };
    let raw = read_exact(buf, len)?;
    String::from_utf8(raw).map_err(|_| ProtoError::Malformed("string is not valid utf-8"))
}

fn read_bin(buf: &mut &[u8], tag: u8) -> Result<Vec<u8>, ProtoError> {
    let len = match tag {
        0xc4 => usize::from(take_u8(buf)?),
        0xc5 => {
            need(buf, 2)?;
            usize::from(buf.get_u16())
        }
        0xc6 => {
            need(buf, 4)?;
            buf.get_u32() as usize
        }
        _ => return Err(ProtoError::Malformed("expected bin")),
    };
    read_exact(buf, len)
}

fn read_uint(buf: &mut &[u8]) -> Result<u64, ProtoError> {
    let tag = take_u8(buf)?;
    match tag {
        0x00..=0x7f => Ok(u64::from(tag)),
        0xcc => Ok(u64::from(take_u8(buf)?)),
        0xcd => {
            need(buf, 2)?;
            Ok(u64::from(buf.get_u16()))
        }
        0xce => {
            need(buf, 4)?;
            Ok(u64::from(buf.get_u32()))
        }
        0xcf => {
            need(buf, 8)?;
            Ok(buf.get_u64())
        }
        _ => Err(ProtoError::Malformed("expected unsigned integer")),
    }
}

fn read_value(buf: &mut &[u8]) -> Result<PropertyValue, ProtoError> {
    need(buf, 1)?;
    let tag = buf.chunk()[0];
    match tag {
        0xc2 | 0xc3 => {
            buf.advance(1);
            Ok(PropertyValue::Bool(tag == 0xc3))
        }
        0x00..=0x7f | 0xcc | 0xcd | 0xce | 0xcf => {
            let v = read_uint(buf)?;
            let v = i64::try_from(v)
                .map_err(|_| ProtoError::Malformed("property integer out of range"))?;
            Ok(PropertyValue::Int(v))
        }
        0xe0..=0xff => {
            buf.advance(1);
            Ok(PropertyValue::Int(i64::from(tag as i8)))
        }
        0xd0 => {
            buf.advance(1);
            need(buf, 1)?;
            Ok(PropertyValue::Int(i64::from(buf.get_i8())))
        }
        0xd1 => {
            buf.advance(1);
            need(buf, 2)?;
            Ok(PropertyValue::Int(i64::from(buf.get_i16())))
        }
        0xd2 => {
            buf.advance(1);
            need(buf, 4)?;
            Ok(PropertyValue::Int(i64::from(buf.get_i32())))
        }
        0xd3 => {
            buf.advance(1);
            need(buf, 8)?;
            Ok(PropertyValue::Int(buf.get_i64()))
        }
        0xa0..=0xbf | 0xd9 | 0xda | 0xdb => Ok(PropertyValue::Str(read_str(buf)?)),
        0xc4 | 0xc5 | 0xc6 => {
            buf.advance(1);
            Ok(PropertyValue::Bytes(read_bin(buf, tag)?))
        }
        _ => Err(ProtoError::Malformed("property value is not a scalar")),
    }
}

fn read_body(buf: &mut &[u8]) -> Result<Vec<u8>, ProtoError> {
    let tag = take_u8(buf)?;
    if tag == 0xc0 {
        return Ok(Vec::new());
    }
    read_bin(buf, tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{msgtype, PROTO_SHELL};

    fn sample() -> ProtoMsg {
        let mut msg = ProtoMsg::shell(msgtype::SHELL);
        msg.header.session_id = "8b6fd04c-2b84-4c6f-9651-3cb9d8d2f1a0".to_string();
        msg.header
            .properties
            .insert("user_id".to_string(), PropertyValue::from("user-1"));
        msg.header
            .properties
            .insert("terminal_width".to_string(), PropertyValue::Int(80));
        msg.body = b"ls -la\n".to_vec();
        msg
    }

    #[test]
    fn round_trip_full_message() {
        let msg = sample();
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_minimal_message() {
        let msg = ProtoMsg::shell(msgtype::PING);
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_all_scalar_kinds() {
        let mut msg = ProtoMsg::shell(msgtype::NEW);
        msg.header.session_id = "s".to_string();
        msg.header
            .properties
            .insert("b".to_string(), PropertyValue::Bool(true));
        msg.header
            .properties
            .insert("neg".to_string(), PropertyValue::Int(-70000));
        msg.header
            .properties
            .insert("big".to_string(), PropertyValue::Int(1 << 40));
        msg.header
            .properties
            .insert("raw".to_string(), PropertyValue::Bytes(vec![0, 1, 2]));
        msg.header.properties.insert(
            "long".to_string(),
            PropertyValue::Str("x".repeat(300)),
        );
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn stop_shell_carries_session_and_user() {
        let msg = ProtoMsg::stop_shell("sess-1", "user-1");
        assert_eq!(msg.header.proto, PROTO_SHELL);
        assert_eq!(msg.header.msg_type, msgtype::STOP);
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded.header.session_id, "sess-1");
        assert_eq!(
            decoded.header.properties.get("user_id"),
            Some(&PropertyValue::from("user-1"))
        );
    }

    #[test]
    fn truncated_input_is_malformed() {
        let encoded = encode(&sample());
        for cut in 0..encoded.len() {
            let err = decode(&encoded[..cut]).unwrap_err();
            assert!(matches!(err, ProtoError::Malformed(_)), "cut at {cut}");
        }
    }

    #[test]
    fn unknown_header_field_is_malformed() {
        let mut buf = bytes::BytesMut::new();
        super::write_array_len(&mut buf, 2);
        super::write_map_len(&mut buf, 3);
        super::write_str(&mut buf, "proto");
        super::write_uint(&mut buf, 1);
        super::write_str(&mut buf, "msg_type");
        super::write_str(&mut buf, "shell");
        super::write_str(&mut buf, "bogus");
        super::write_str(&mut buf, "value");
        buf.put_u8(0xc0);
        assert_eq!(
            decode(&buf),
            Err(ProtoError::Malformed("unknown header field"))
        );
    }

    #[test]
    fn non_scalar_property_is_malformed() {
        let mut buf = bytes::BytesMut::new();
        super::write_array_len(&mut buf, 2);
        super::write_map_len(&mut buf, 3);
        super::write_str(&mut buf, "proto");
        super::write_uint(&mut buf, 1);
        super::write_str(&mut buf, "msg_type");
        super::write_str(&mut buf, "shell");
        super::write_str(&mut buf, "properties");
        super::write_map_len(&mut buf, 1);
        super::write_str(&mut buf, "nested");
        super::write_map_len(&mut buf, 0); // map where a scalar belongs
        buf.put_u8(0xc0);
        assert_eq!(
            decode(&buf),
            Err(ProtoError::Malformed("property value is not a scalar"))
        );
    }

    #[test]
    fn missing_required_fields_is_malformed() {
        let mut buf = bytes::BytesMut::new();
        super::write_array_len(&mut buf, 2);
        super::write_map_len(&mut buf, 1);
        super::write_str(&mut buf, "proto");
        super::write_uint(&mut buf, 1);
        buf.put_u8(0xc0);
        assert_eq!(
            decode(&buf),
            Err(ProtoError::Malformed("header missing proto or msg_type"))
        );
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut encoded = encode(&sample()).to_vec();
        encoded.push(0x00);
        assert_eq!(
            decode(&encoded),
            Err(ProtoError::Malformed("trailing bytes after frame"))
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(decode(&[]).is_err());
    }
}
