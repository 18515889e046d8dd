//! Protocol message encoding

use super::constants::{frontend, SSL_REQUEST_CODE};
use super::message::FrontendMessage;
use bytes::{BufMut, BytesMut};

/// Encode a frontend message into bytes
pub fn encode_message(msg: &FrontendMessage) -> BytesMut {
    let mut buf = BytesMut::new();

    match msg {
        FrontendMessage::Startup { version, params } => frame(&mut buf, None, |buf| {
            buf.put_i32(*version);
            for (key, value) in params {
                put_cstr(buf, key);
                put_cstr(buf, value);
            }
            buf.put_u8(0);
        }),
        FrontendMessage::SslRequest => frame(&mut buf, None, |buf| {
            buf.put_i32(SSL_REQUEST_CODE);
        }),
        FrontendMessage::Password(password) => {
            frame(&mut buf, Some(frontend::PASSWORD), |buf| put_cstr(buf, password))
        }
        FrontendMessage::SaslInitialResponse { mechanism, data } => {
            frame(&mut buf, Some(frontend::PASSWORD), |buf| {
                put_cstr(buf, mechanism);
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            })
        }
        FrontendMessage::SaslResponse { data } => {
            frame(&mut buf, Some(frontend::PASSWORD), |buf| buf.put_slice(data))
        }
        FrontendMessage::Query(query) => {
            frame(&mut buf, Some(frontend::QUERY), |buf| put_cstr(buf, query))
        }
        FrontendMessage::Terminate => frame(&mut buf, Some(frontend::TERMINATE), |_| {}),
    }

    buf
}

/// Write an optional tag, a length placeholder, the body, then patch the length.
///
/// The length counts itself but not the tag.
fn frame(buf: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let len_pos = buf.len();
    buf.put_i32(0);

    body(buf);

    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
