//! Binary framing for request and response files.
//!
//! A frame is a magic tag, a version byte, a record kind, and a
//! length-prefixed field sequence in fixed order. Decoders read the
//! fields they know and skip unknown trailing fields, so newer writers
//! can append fields without breaking older readers.

use super::{Headers, Method, ProtocolError, ProtocolResult, RpcRequest, RpcResponse, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use syftbox_types::SyftUrl;
use uuid::Uuid;

const MAGIC: &[u8; 4] = b"SYRF";
const VERSION: u8 = 1;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

/// Fields both record kinds carry, in wire order.
const FIELD_COUNT: u16 = 8;

/// Encode a request record into a frame.
pub fn encode_request(req: &RpcRequest) -> ProtocolResult<Vec<u8>> {
    let mut buf = BytesMut::new();
    put_preamble(&mut buf, KIND_REQUEST);
    put_field(&mut buf, req.id.as_bytes());
    put_field(&mut buf, req.sender.as_bytes());
    put_field(&mut buf, req.url.to_string().as_bytes());
    put_field(&mut buf, req.method.as_str().as_bytes());
    put_field(&mut buf, &encode_headers(&req.headers));
    put_field(&mut buf, &req.body);
    put_field(&mut buf, &req.created.timestamp_millis().to_be_bytes());
    put_field(&mut buf, &req.expires.timestamp_millis().to_be_bytes());
    Ok(buf.to_vec())
}

/// Decode a request frame.
pub fn decode_request(data: &[u8]) -> ProtocolResult<RpcRequest> {
    let mut buf = Bytes::copy_from_slice(data);
    let field_count = take_preamble(&mut buf, KIND_REQUEST)?;

    let id = take_uuid(&mut buf)?;
    let sender = take_string(&mut buf, "sender")?;
    let url = take_url(&mut buf)?;
    let method: Method = take_string(&mut buf, "method")?
        .parse()
        .map_err(|e| ProtocolError::Decode(format!("{e}")))?;
    let headers = decode_headers(&take_field(&mut buf)?)?;
    let body = take_field(&mut buf)?.to_vec();
    let created = take_timestamp(&mut buf)?;
    let expires = take_timestamp(&mut buf)?;

    skip_unknown_fields(&mut buf, field_count)?;

    Ok(RpcRequest {
        id,
        sender,
        url,
        method,
        headers,
        body,
        created,
        expires,
    })
}

/// Encode a response record into a frame.
pub fn encode_response(resp: &RpcResponse) -> ProtocolResult<Vec<u8>> {
    let mut buf = BytesMut::new();
    put_preamble(&mut buf, KIND_RESPONSE);
    put_field(&mut buf, resp.id.as_bytes());
    put_field(&mut buf, resp.sender.as_bytes());
    put_field(&mut buf, resp.url.to_string().as_bytes());
    put_field(&mut buf, &resp.status.code().to_be_bytes());
    put_field(&mut buf, &encode_headers(&resp.headers));
    put_field(&mut buf, &resp.body);
    put_field(&mut buf, &resp.created.timestamp_millis().to_be_bytes());
    put_field(&mut buf, &resp.expires.timestamp_millis().to_be_bytes());
    Ok(buf.to_vec())
}

/// Decode a response frame.
pub fn decode_response(data: &[u8]) -> ProtocolResult<RpcResponse> {
    let mut buf = Bytes::copy_from_slice(data);
    let field_count = take_preamble(&mut buf, KIND_RESPONSE)?;

    let id = take_uuid(&mut buf)?;
    let sender = take_string(&mut buf, "sender")?;
    let url = take_url(&mut buf)?;
    let status_field = take_field(&mut buf)?;
    if status_field.len() != 2 {
        return Err(ProtocolError::Decode(format!(
            "status field has {} bytes, expected 2",
            status_field.len()
        )));
    }
    let code = u16::from_be_bytes([status_field[0], status_field[1]]);
    let status = Status::from_code(code)
        .ok_or_else(|| ProtocolError::Decode(format!("unknown status code {code}")))?;
    let headers = decode_headers(&take_field(&mut buf)?)?;
    let body = take_field(&mut buf)?.to_vec();
    let created = take_timestamp(&mut buf)?;
    let expires = take_timestamp(&mut buf)?;

    skip_unknown_fields(&mut buf, field_count)?;

    Ok(RpcResponse {
        id,
        sender,
        url,
        status,
        headers,
        body,
        created,
        expires,
    })
}

fn put_preamble(buf: &mut BytesMut, kind: u8) {
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(kind);
    buf.put_u16(FIELD_COUNT);
}

fn put_field(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn take_preamble(buf: &mut Bytes, expected_kind: u8) -> ProtocolResult<u16> {
    if buf.remaining() < MAGIC.len() + 4 {
        return Err(ProtocolError::Decode("frame too short".to_string()));
    }
    let magic = buf.copy_to_bytes(MAGIC.len());
    if magic.as_ref() != MAGIC {
        return Err(ProtocolError::Decode("bad magic".to_string()));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(ProtocolError::Decode(format!(
            "unsupported frame version {version}"
        )));
    }
    let kind = buf.get_u8();
    if kind != expected_kind {
        return Err(ProtocolError::Decode(format!(
            "wrong record kind {kind}, expected {expected_kind}"
        )));
    }
    let field_count = buf.get_u16();
    if field_count < FIELD_COUNT {
        return Err(ProtocolError::Decode(format!(
            "frame has {field_count} fields, need at least {FIELD_COUNT}"
        )));
    }
    Ok(field_count)
}

fn take_field(buf: &mut Bytes) -> ProtocolResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Decode("truncated field length".to_string()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Decode(format!(
            "truncated field: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

fn take_string(buf: &mut Bytes, what: &str) -> ProtocolResult<String> {
    let field = take_field(buf)?;
    String::from_utf8(field.to_vec())
        .map_err(|e| ProtocolError::Decode(format!("{what} is not UTF-8: {e}")))
}

fn take_uuid(buf: &mut Bytes) -> ProtocolResult<Uuid> {
    let field = take_field(buf)?;
    let bytes: [u8; 16] = field
        .as_ref()
        .try_into()
        .map_err(|_| ProtocolError::Decode(format!("id field has {} bytes", field.len())))?;
    Ok(Uuid::from_bytes(bytes))
}

fn take_url(buf: &mut Bytes) -> ProtocolResult<SyftUrl> {
    let s = take_string(buf, "url")?;
    SyftUrl::parse(&s).map_err(|e| ProtocolError::Decode(e.to_string()))
}

fn take_timestamp(buf: &mut Bytes) -> ProtocolResult<DateTime<Utc>> {
    let field = take_field(buf)?;
    let bytes: [u8; 8] = field
        .as_ref()
        .try_into()
        .map_err(|_| ProtocolError::Decode(format!("timestamp field has {} bytes", field.len())))?;
    let millis = i64::from_be_bytes(bytes);
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ProtocolError::Decode(format!("timestamp {millis} out of range")))
}

fn skip_unknown_fields(buf: &mut Bytes, field_count: u16) -> ProtocolResult<()> {
    for _ in FIELD_COUNT..field_count {
        take_field(buf)?;
    }
    Ok(())
}

fn encode_headers(headers: &Headers) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(headers.len() as u32);
    for (name, value) in headers.iter() {
        put_field(&mut buf, name.as_bytes());
        put_field(&mut buf, value.as_bytes());
    }
    buf.to_vec()
}

fn decode_headers(data: &[u8]) -> ProtocolResult<Headers> {
    let mut buf = Bytes::copy_from_slice(data);
    if buf.remaining() < 4 {
        return Err(ProtocolError::Decode("truncated header count".to_string()));
    }
    let count = buf.get_u32();
    let mut headers = Headers::new();
    for _ in 0..count {
        let name = take_string(&mut buf, "header name")?;
        let value = take_string(&mut buf, "header value")?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::now_ms;
    use chrono::Duration;

    fn sample_request() -> RpcRequest {
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/json");
        headers.append("X-Tag", "a");
        headers.append("X-Tag", "b");
        let created = now_ms();
        RpcRequest {
            id: Uuid::now_v7(),
            sender: "alice@example.com".to_string(),
            url: SyftUrl::parse("syft://bob@x.org/app_data/ping/rpc/ping").unwrap(),
            method: Method::Post,
            headers,
            body: br#"{"msg":"hi"}"#.to_vec(),
            created,
            expires: created + Duration::seconds(30),
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let req = sample_request();
        let encoded = encode_request(&req).unwrap();
        let decoded = decode_request(&encoded).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_roundtrip() {
        let req = sample_request();
        let created = now_ms();
        let resp = RpcResponse {
            id: req.id,
            sender: "bob@x.org".to_string(),
            url: req.url.clone(),
            status: Status::Completed,
            headers: Headers::new(),
            body: b"ok".to_vec(),
            created,
            expires: created + Duration::seconds(30),
        };
        let encoded = encode_response(&resp).unwrap();
        let decoded = decode_response(&encoded).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_decoder_skips_unknown_trailing_fields() {
        let req = sample_request();
        let mut encoded = encode_request(&req).unwrap();
        // Append one unknown field and bump the count: a future writer.
        let extra = b"future-field";
        encoded.extend_from_slice(&(extra.len() as u32).to_be_bytes());
        encoded.extend_from_slice(extra);
        let count_offset = MAGIC.len() + 2;
        encoded[count_offset..count_offset + 2].copy_from_slice(&(FIELD_COUNT + 1).to_be_bytes());

        let decoded = decode_request(&encoded).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_request(b"").is_err());
        assert!(decode_request(b"not a frame at all").is_err());
        let req = sample_request();
        let encoded = encode_request(&req).unwrap();
        // Truncated frame
        assert!(decode_request(&encoded[..encoded.len() / 2]).is_err());
        // Response decoder refuses request frames
        assert!(decode_response(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let req = sample_request();
        let mut encoded = encode_request(&req).unwrap();
        encoded[4] = 9;
        assert!(decode_request(&encoded).is_err());
    }

    #[test]
    fn test_empty_body_and_headers() {
        let created = now_ms();
        let req = RpcRequest {
            id: Uuid::now_v7(),
            sender: "alice@example.com".to_string(),
            url: SyftUrl::parse("syft://bob@x.org/app_data/a/rpc/e").unwrap(),
            method: Method::Get,
            headers: Headers::new(),
            body: Vec::new(),
            created,
            expires: created + Duration::seconds(1),
        };
        let decoded = decode_request(&encode_request(&req).unwrap()).unwrap();
        assert_eq!(decoded, req);
    }
}
