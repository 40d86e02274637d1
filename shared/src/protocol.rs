//! Wire types for Backhaul <-> reverse proxy communication.
//!
//! The same JSON payloads travel over both transports: as HTTP bodies in
//! polling mode and as `{"event": ..., "data": ...}` text frames on the
//! duplex WebSocket. Bodies on the duplex connection travel as binary
//! [`StreamFrame`]s.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Identifier the proxy assigns to each pending request.
pub type TransferId = String;

/// Maximum encoded frame size accepted from the proxy (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Payload size used when chunking outbound bodies into frames
pub const FRAME_CHUNK_SIZE: usize = 64 * 1024;

/// Frame header: kind byte + id length
const FRAME_HEADER_LEN: usize = 3;

/// Ordered header pairs. Repeated names stay separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawHeaders")]
pub struct HeaderList(pub Vec<(String, String)>);

/// Headers as the proxy may send them: `[[name, value], ...]` or the
/// flat `[name, value, name, value, ...]` raw form.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawHeaders {
    Pairs(Vec<(String, String)>),
    Flat(Vec<String>),
}

impl TryFrom<RawHeaders> for HeaderList {
    type Error = Error;

    fn try_from(raw: RawHeaders) -> Result<Self> {
        match raw {
            RawHeaders::Pairs(pairs) => Ok(HeaderList(pairs)),
            RawHeaders::Flat(flat) => {
                if flat.len() % 2 != 0 {
                    return Err(Error::InvalidHeaders(format!(
                        "flat header list has odd length {}",
                        flat.len()
                    )));
                }
                let mut pairs = Vec::with_capacity(flat.len() / 2);
                let mut iter = flat.into_iter();
                while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
                    pairs.push((name, value));
                }
                Ok(HeaderList(pairs))
            }
        }
    }
}

impl Serialize for HeaderList {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl HeaderList {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First value for `name`, compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

impl From<Vec<(String, String)>> for HeaderList {
    fn from(pairs: Vec<(String, String)>) -> Self {
        HeaderList(pairs)
    }
}

/// Discovery answer. `{}` (or an empty id) means no work is pending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub id: Option<TransferId>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HeaderList,
}

impl TransferDescriptor {
    /// Request metadata, if the proxy actually handed out work.
    pub fn into_request(self) -> Option<TransferRequest> {
        let id = self.id?;
        Some(TransferRequest {
            id,
            path: self.path,
            method: self.method,
            headers: self.headers,
        })
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Metadata of one pending request held by the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub id: TransferId,
    pub path: String,
    pub method: String,
    pub headers: HeaderList,
}

/// `req-h` poll sent on the duplex connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    pub backend_id: String,
}

/// Addresses one transfer of one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferKey {
    pub backend_id: String,
    pub id: TransferId,
}

/// Proxy acknowledgement of `res-h` / `res-b`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub id: TransferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Backend response status line and headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeaders {
    /// Omitted in polling mode, where the backend id is in the URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub id: TransferId,
    pub status_code: u16,
    pub status_message: String,
    pub headers: HeaderList,
}

/// Fail-fast notice for a transfer the agent could not complete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TransferId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_timeout: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FailureReport {
    /// Attach the duplex addressing fields
    pub fn addressed(mut self, backend_id: &str, id: &str) -> Self {
        self.backend_id = Some(backend_id.to_string());
        self.id = Some(id.to_string());
        self
    }
}

/// Events the agent emits on the duplex connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum AgentEvent {
    #[serde(rename = "req-h")]
    RequestHeaders(PollRequest),
    #[serde(rename = "req-b")]
    RequestBody(TransferKey),
    #[serde(rename = "res-h")]
    ResponseHeaders(ResponseHeaders),
    /// Announces the `res-b` binary stream that follows
    #[serde(rename = "res-b")]
    ResponseBody(TransferKey),
    #[serde(rename = "transfer-err")]
    TransferError(FailureReport),
}

/// Events the proxy emits on the duplex connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ProxyEvent {
    #[serde(rename = "req-h")]
    RequestHeaders(TransferDescriptor),
    /// Announces the `req-b` binary stream that follows
    #[serde(rename = "req-b")]
    RequestBody(TransferKey),
    #[serde(rename = "res-h")]
    ResponseHeaders(TransferAck),
    #[serde(rename = "res-b")]
    ResponseBody(TransferAck),
    #[serde(rename = "transfer-err")]
    TransferError(FailureReport),
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::RequestHeaders(_) => "req-h",
            AgentEvent::RequestBody(_) => "req-b",
            AgentEvent::ResponseHeaders(_) => "res-h",
            AgentEvent::ResponseBody(_) => "res-b",
            AgentEvent::TransferError(_) => "transfer-err",
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ProxyEvent {
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Stream frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Body chunk
    Data = 0,
    /// Stream finished normally
    End = 1,
    /// Stream finished with an error; payload is a UTF-8 reason
    Abort = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::End),
            2 => Ok(FrameKind::Abort),
            other => Err(Error::InvalidFrame(format!("unknown frame kind {}", other))),
        }
    }
}

/// One binary frame of a body stream.
///
/// Layout: `[kind: u8][id_len: u16 BE][id][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub kind: FrameKind,
    pub id: TransferId,
    pub payload: Bytes,
}

impl StreamFrame {
    pub fn data(id: impl Into<TransferId>, payload: Bytes) -> Self {
        Self { kind: FrameKind::Data, id: id.into(), payload }
    }

    pub fn end(id: impl Into<TransferId>) -> Self {
        Self { kind: FrameKind::End, id: id.into(), payload: Bytes::new() }
    }

    pub fn abort(id: impl Into<TransferId>, reason: &str) -> Self {
        Self {
            kind: FrameKind::Abort,
            id: id.into(),
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let id_len = u16::try_from(self.id.len())
            .map_err(|_| Error::InvalidFrame(format!("transfer id too long ({} bytes)", self.id.len())))?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.id.len() + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u16(id_len);
        buf.put_slice(self.id.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(Error::InvalidFrame(format!("frame of {} bytes exceeds limit", data.len())));
        }
        if data.len() < FRAME_HEADER_LEN {
            return Err(Error::InvalidFrame("truncated frame header".into()));
        }
        let kind = FrameKind::try_from(data[0])?;
        let id_len = u16::from_be_bytes([data[1], data[2]]) as usize;
        let id_end = FRAME_HEADER_LEN + id_len;
        if data.len() < id_end {
            return Err(Error::InvalidFrame("truncated transfer id".into()));
        }
        let id = std::str::from_utf8(&data[FRAME_HEADER_LEN..id_end])
            .map_err(|_| Error::InvalidFrame("transfer id is not UTF-8".into()))?
            .to_string();
        Ok(Self {
            kind,
            id,
            payload: Bytes::copy_from_slice(&data[id_end..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_without_work() {
        let d: TransferDescriptor = serde_json::from_str("{}").unwrap();
        assert!(d.into_request().is_none());

        let d: TransferDescriptor = serde_json::from_str(r#"{"id": ""}"#).unwrap();
        assert!(d.into_request().is_none());
    }

    #[test]
    fn test_descriptor_flat_headers() {
        let json = r#"{
            "id": "t1", "path": "/x", "method": "GET",
            "headers": ["date", "2019-03-18", "date", "2020-12-12", "server", "nodejs"]
        }"#;
        let req = serde_json::from_str::<TransferDescriptor>(json)
            .unwrap()
            .into_request()
            .unwrap();
        assert_eq!(req.id, "t1");
        assert_eq!(
            req.headers.0,
            vec![
                ("date".to_string(), "2019-03-18".to_string()),
                ("date".to_string(), "2020-12-12".to_string()),
                ("server".to_string(), "nodejs".to_string()),
            ]
        );
    }

    #[test]
    fn test_descriptor_pair_headers() {
        let json = r#"{"id": "t2", "path": "/", "method": "POST",
            "headers": [["Content-Type", "text/plain"], ["X-A", "1"]]}"#;
        let req = serde_json::from_str::<TransferDescriptor>(json)
            .unwrap()
            .into_request()
            .unwrap();
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.headers.get("content-type"), Some("text/plain"));
    }

    #[test]
    fn test_odd_flat_headers_rejected() {
        let json = r#"{"id": "t3", "headers": ["host"]}"#;
        assert!(serde_json::from_str::<TransferDescriptor>(json).is_err());
    }

    #[test]
    fn test_agent_event_shape() {
        let ev = AgentEvent::RequestBody(TransferKey {
            backend_id: "b1".into(),
            id: "t1".into(),
        });
        let v: serde_json::Value = serde_json::from_str(&ev.to_text().unwrap()).unwrap();
        assert_eq!(v["event"], "req-b");
        assert_eq!(v["data"]["backendId"], "b1");
        assert_eq!(v["data"]["id"], "t1");
    }

    #[test]
    fn test_response_headers_shape() {
        let rh = ResponseHeaders {
            backend_id: None,
            id: "t1".into(),
            status_code: 200,
            status_message: "OK".into(),
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())].into(),
        };
        let v = serde_json::to_value(&rh).unwrap();
        assert!(v.get("backendId").is_none());
        assert_eq!(v["statusCode"], 200);
        assert_eq!(v["headers"], serde_json::json!([["Content-Type", "text/plain"]]));
    }

    #[test]
    fn test_proxy_ack_parse() {
        let ev = ProxyEvent::from_text(r#"{"event": "res-b", "data": {"id": "t1"}}"#).unwrap();
        match ev {
            ProxyEvent::ResponseBody(ack) => {
                assert_eq!(ack.id, "t1");
                assert!(ack.error.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_failure_report_skips_absent_fields() {
        let report = FailureReport {
            remote_timeout: Some(true),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&report).unwrap(), r#"{"remoteTimeout":true}"#);
    }

    #[test]
    fn test_frame_decode() {
        let frame = StreamFrame::data("t1", Bytes::from_static(b"ok"));
        let decoded = StreamFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);

        assert!(StreamFrame::decode(&[0, 0]).is_err());
        assert!(StreamFrame::decode(&[0, 0, 5, b'a']).is_err());
        assert!(StreamFrame::decode(&[9, 0, 0]).is_err());
    }
}
