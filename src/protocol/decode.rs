//! Protocol message decoding

use super::constants::{auth, tags, MAX_MESSAGE_LENGTH};
use super::message::{AuthenticationMessage, BackendMessage, ErrorFields, FieldDescription};
use bytes::Bytes;
use std::io;

/// Decode one backend message from the front of `data`.
///
/// # Returns
/// * `Ok(Some((msg, consumed)))` - a complete message; the caller advances its buffer by `consumed`
/// * `Ok(None)` - the buffer does not yet hold a complete message
/// * `Err(e)` - the frame is malformed (`InvalidData`) or uses an unsupported feature
pub fn decode_message(data: &[u8]) -> io::Result<Option<(BackendMessage, usize)>> {
    if data.len() < 5 {
        return Ok(None);
    }

    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);

    if len < 4 {
        return Err(invalid(format!("message length {} is shorter than its header", len)));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_LENGTH {
        return Err(invalid(format!(
            "message length {} exceeds maximum allowed {}",
            len, MAX_MESSAGE_LENGTH
        )));
    }

    if data.len() < len + 1 {
        return Ok(None);
    }

    let mut body = Cursor::new(&data[5..len + 1]);

    let msg = match tag {
        tags::AUTHENTICATION => decode_authentication(&mut body)?,
        tags::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
            process_id: body.i32("process id")?,
            secret_key: body.i32("secret key")?,
        },
        tags::COMMAND_COMPLETE => BackendMessage::CommandComplete(body.cstr("command tag")?),
        tags::DATA_ROW => decode_data_row(&mut body)?,
        tags::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        tags::ERROR_RESPONSE => BackendMessage::ErrorResponse(decode_error_fields(&mut body)?),
        tags::NOTICE_RESPONSE => BackendMessage::NoticeResponse(decode_error_fields(&mut body)?),
        tags::PARAMETER_STATUS => BackendMessage::ParameterStatus {
            name: body.cstr("parameter name")?,
            value: body.cstr("parameter value")?,
        },
        tags::READY_FOR_QUERY => BackendMessage::ReadyForQuery {
            status: body.u8("transaction status")?,
        },
        tags::ROW_DESCRIPTION => decode_row_description(&mut body)?,
        _ => {
            return Err(invalid(format!(
                "unknown message tag: 0x{:02X} ('{}')",
                tag,
                tag.escape_ascii()
            )))
        }
    };

    Ok(Some((msg, len + 1)))
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Bounds-checked reader over a message body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize, what: &str) -> io::Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(invalid(format!("truncated message: {}", what)));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> io::Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn i16(&mut self, what: &str) -> io::Result<i16> {
        let b = self.take(2, what)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self, what: &str) -> io::Result<i32> {
        let b = self.take(4, what)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self, what: &str) -> io::Result<String> {
        let rest = self.remaining();
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| invalid(format!("missing null terminator in {}", what)))?;
        self.pos += end + 1;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}

fn decode_authentication(body: &mut Cursor<'_>) -> io::Result<BackendMessage> {
    let auth_type = body.i32("auth type")?;

    let auth_msg = match auth_type {
        auth::OK => AuthenticationMessage::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
        auth::MD5_PASSWORD => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(body.take(4, "md5 salt")?);
            AuthenticationMessage::Md5Password { salt }
        }
        auth::SASL => {
            let mut mechanisms = Vec::new();
            while !body.is_empty() {
                let mechanism = body.cstr("SASL mechanism")?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthenticationMessage::Sasl { mechanisms }
        }
        auth::SASL_CONTINUE => AuthenticationMessage::SaslContinue {
            data: body.remaining().to_vec(),
        },
        auth::SASL_FINAL => AuthenticationMessage::SaslFinal {
            data: body.remaining().to_vec(),
        },
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported auth type: {}", auth_type),
            ))
        }
    };

    Ok(BackendMessage::Authentication(auth_msg))
}

fn decode_data_row(body: &mut Cursor<'_>) -> io::Result<BackendMessage> {
    let field_count = body.i16("field count")?.max(0) as usize;
    let mut fields = Vec::with_capacity(field_count);

    for _ in 0..field_count {
        let field_len = body.i32("field length")?;
        let field = if field_len < 0 {
            None
        } else {
            Some(Bytes::copy_from_slice(
                body.take(field_len as usize, "field data")?,
            ))
        };
        fields.push(field);
    }

    Ok(BackendMessage::DataRow(fields))
}

fn decode_error_fields(body: &mut Cursor<'_>) -> io::Result<ErrorFields> {
    let mut fields = ErrorFields::default();

    while !body.is_empty() {
        let field_type = body.u8("error field type")?;
        if field_type == 0 {
            break;
        }
        let value = body.cstr("error field")?;

        match field_type {
            b'S' => fields.severity = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            b'P' => fields.position = Some(value),
            _ => {}
        }
    }

    Ok(fields)
}

fn decode_row_description(body: &mut Cursor<'_>) -> io::Result<BackendMessage> {
    let field_count = body.i16("field count")?.max(0) as usize;
    let mut fields = Vec::with_capacity(field_count);

    for _ in 0..field_count {
        fields.push(FieldDescription {
            name: body.cstr("field name")?,
            table_oid: body.i32("table oid")?,
            column_attr: body.i16("column attribute")?,
            type_oid: body.i32("type oid")? as u32,
            type_size: body.i16("type size")?,
            type_modifier: body.i32("type modifier")?,
            format_code: body.i16("format code")?,
        });
    }

    Ok(BackendMessage::RowDescription(fields))
}
