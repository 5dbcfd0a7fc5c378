//! Wire codec for the framed binary RPC dialect (bolt).
//!
//! Requests carry a fixed 22-byte big-endian header followed by the class
//! name, the serialized header map and the content payload. Responses
//! carry a 20-byte header whose status field is mapped into the dense RPC
//! status histogram.

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const PROTOCOL_CODE_V1: u8 = 1;
pub const TYPE_RESPONSE: u8 = 0;
pub const TYPE_REQUEST: u8 = 1;
pub const CMD_RPC_REQUEST: u16 = 1;
pub const CMD_RPC_RESPONSE: u16 = 2;
pub const CODEC_HESSIAN2: u8 = 1;

pub const REQUEST_HEADER_LEN: usize = 22;
pub const RESPONSE_HEADER_LEN: usize = 20;

/// Response status codes, straight from the bolt protocol table.
pub mod status {
    pub const SUCCESS: u16 = 0;
    pub const ERROR: u16 = 1;
    pub const SERVER_EXCEPTION: u16 = 2;
    pub const UNKNOWN: u16 = 3;
    pub const SERVER_THREADPOOL_BUSY: u16 = 4;
    pub const ERROR_COMM: u16 = 5;
    pub const NO_PROCESSOR: u16 = 6;
    pub const TIMEOUT: u16 = 7;
    pub const CLIENT_SEND_ERROR: u16 = 8;
    pub const CODEC_EXCEPTION: u16 = 9;
    pub const CONNECTION_CLOSED: u16 = 16;
    pub const SERVER_SERIAL_EXCEPTION: u16 = 17;
    pub const SERVER_DESERIAL_EXCEPTION: u16 = 18;
}

/// Request fixture: class name, header map, timeout and payload carried
/// by every generated frame. Defaults target the stock sofa echo
/// service; all fields are overridable from the CLI.
#[derive(Debug, Clone)]
pub struct BoltFixture {
    pub class_name: String,
    pub header: String,
    pub content: Bytes,
    pub timeout_ms: u32,
}

impl Default for BoltFixture {
    fn default() -> Self {
        Self {
            class_name: "com.alipay.sofa.rpc.core.request.SofaRequest".to_string(),
            header: "service:com.alipay.test.TestService:1.0".to_string(),
            content: default_content(),
            timeout_ms: 5000,
        }
    }
}

/// Deterministic filler payload sized like a typical echo-service
/// request body.
fn default_content() -> Bytes {
    let mut buf = BytesMut::with_capacity(1314);
    for i in 0..1314usize {
        buf.put_u8(b'0' + (i % 10) as u8);
    }
    buf.freeze()
}

/// Serialize a `key:value[,key:value...]` header string into the wire
/// map: a big-endian u32 length before every key and value.
pub fn serialize_header_map(header: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + 16);
    for entry in header.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = match entry.split_once(':') {
            Some((k, v)) => (k, v),
            None => (entry, ""),
        };
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Encode one request frame: the 22-byte header, then class name, header
/// map and content.
pub fn encode_request(fixture: &BoltFixture, request_id: u32) -> Bytes {
    let header_map = serialize_header_map(&fixture.header);
    let class = fixture.class_name.as_bytes();

    let mut buf =
        BytesMut::with_capacity(REQUEST_HEADER_LEN + class.len() + header_map.len() + fixture.content.len());
    buf.put_u8(PROTOCOL_CODE_V1);
    buf.put_u8(TYPE_REQUEST);
    buf.put_u16(CMD_RPC_REQUEST);
    buf.put_u8(1); // version
    buf.put_u32(request_id);
    buf.put_u8(CODEC_HESSIAN2);
    buf.put_u32(fixture.timeout_ms);
    buf.put_u16(class.len() as u16);
    buf.put_u16(header_map.len() as u16);
    buf.put_u32(fixture.content.len() as u32);

    buf.put_slice(class);
    buf.put_slice(&header_map);
    buf.put_slice(&fixture.content);
    buf.freeze()
}

/// Decoded response header. The body sections that follow are
/// `class_len + header_len + content_len` bytes and are skipped by the
/// session adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub request_id: u32,
    pub status: u16,
    pub class_len: u16,
    pub header_len: u16,
    pub content_len: u32,
}

impl ResponseHead {
    pub fn body_len(&self) -> usize {
        self.class_len as usize + self.header_len as usize + self.content_len as usize
    }
}

pub fn decode_response_head(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<ResponseHead> {
    if buf[0] != PROTOCOL_CODE_V1 {
        bail!("bad bolt protocol byte: {:#x}", buf[0]);
    }
    if buf[1] != TYPE_RESPONSE {
        bail!("unexpected bolt frame type: {:#x}", buf[1]);
    }

    let request_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    let status = u16::from_be_bytes([buf[10], buf[11]]);
    let class_len = u16::from_be_bytes([buf[12], buf[13]]);
    let header_len = u16::from_be_bytes([buf[14], buf[15]]);
    let content_len = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);

    Ok(ResponseHead {
        request_id,
        status,
        class_len,
        header_len,
        content_len,
    })
}

/// Encode a response header; the tool itself only decodes responses, but
/// the loopback test server needs to produce them.
pub fn encode_response_head(request_id: u32, status: u16, content_len: u32) -> [u8; RESPONSE_HEADER_LEN] {
    let mut buf = [0u8; RESPONSE_HEADER_LEN];
    buf[0] = PROTOCOL_CODE_V1;
    buf[1] = TYPE_RESPONSE;
    buf[2..4].copy_from_slice(&CMD_RPC_RESPONSE.to_be_bytes());
    buf[4] = 1;
    buf[5..9].copy_from_slice(&request_id.to_be_bytes());
    buf[9] = CODEC_HESSIAN2;
    buf[10..12].copy_from_slice(&status.to_be_bytes());
    // class/header sections empty
    buf[16..20].copy_from_slice(&content_len.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let fixture = BoltFixture::default();
        let frame = encode_request(&fixture, 7);
        let header_map = serialize_header_map(&fixture.header);

        assert_eq!(frame[0], PROTOCOL_CODE_V1);
        assert_eq!(frame[1], TYPE_REQUEST);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), CMD_RPC_REQUEST);
        assert_eq!(frame[4], 1);
        assert_eq!(u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]), 7);
        assert_eq!(frame[9], CODEC_HESSIAN2);
        assert_eq!(
            u32::from_be_bytes([frame[10], frame[11], frame[12], frame[13]]),
            5000
        );
        assert_eq!(
            u16::from_be_bytes([frame[14], frame[15]]) as usize,
            fixture.class_name.len()
        );
        assert_eq!(
            u16::from_be_bytes([frame[16], frame[17]]) as usize,
            header_map.len()
        );
        assert_eq!(
            u32::from_be_bytes([frame[18], frame[19], frame[20], frame[21]]) as usize,
            fixture.content.len()
        );
        assert_eq!(
            frame.len(),
            REQUEST_HEADER_LEN + fixture.class_name.len() + header_map.len() + fixture.content.len()
        );
        assert_eq!(
            &frame[REQUEST_HEADER_LEN..REQUEST_HEADER_LEN + fixture.class_name.len()],
            fixture.class_name.as_bytes()
        );
    }

    #[test]
    fn default_content_has_expected_length() {
        assert_eq!(BoltFixture::default().content.len(), 1314);
    }

    #[test]
    fn response_head_decoding() {
        let wire = encode_response_head(99, status::SUCCESS, 12);
        let head = decode_response_head(&wire).unwrap();
        assert_eq!(head.request_id, 99);
        assert_eq!(head.status, status::SUCCESS);
        assert_eq!(head.body_len(), 12);

        let busy = encode_response_head(1, status::SERVER_THREADPOOL_BUSY, 0);
        assert_eq!(decode_response_head(&busy).unwrap().status, 4);
    }

    #[test]
    fn response_head_rejects_wrong_protocol() {
        let mut wire = encode_response_head(1, status::SUCCESS, 0);
        wire[0] = 0x7f;
        assert!(decode_response_head(&wire).is_err());
    }

    #[test]
    fn header_map_serialization() {
        let map = serialize_header_map("service:com.alipay.test.TestService:1.0");
        assert_eq!(&map[0..4], &7u32.to_be_bytes());
        assert_eq!(&map[4..11], b"service");
        let vlen = u32::from_be_bytes([map[11], map[12], map[13], map[14]]) as usize;
        assert_eq!(&map[15..15 + vlen], b"com.alipay.test.TestService:1.0");
        assert_eq!(map.len(), 15 + vlen);
    }
}
