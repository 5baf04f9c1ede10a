use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version carried in the `v` field of every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Value of the HTTP `Upgrade` header used by the tunnel handshake
pub const UPGRADE_PROTOCOL: &str = "hookrelay/1";

/// Opaque token linking a response frame to the request frame it answers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh, random correlation id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered header multimap
///
/// Each entry keeps the name as it was first appended together with every
/// value seen for it, in arrival order. Name matching is ASCII
/// case-insensitive. On the wire this is a JSON array of
/// `[name, [value, ...]]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, Vec<String>)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, extending an existing entry with the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .0
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some((_, values)) => values.push(value),
            None => self.0.push((name, vec![value])),
        }
    }

    /// All values recorded for `name`
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// First value recorded for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Remove every value for `name`
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    }

    /// Iterate over `(name, value)` pairs, one per value
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// Number of distinct header names
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// Inbound HTTP request snapshotted for transport to the tunnel client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// Correlation id the response must echo back
    pub id: CorrelationId,
    /// HTTP method
    pub method: String,
    /// Path and query of the inbound request
    #[serde(default)]
    pub uri: String,
    /// Request headers
    #[serde(default)]
    pub headers: Headers,
    /// Request body (base64 on the wire)
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

/// Response produced by the tunnel client for one forwarded request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    /// Correlation id of the originating request
    pub id: CorrelationId,
    /// HTTP status code (100-599)
    pub status: u16,
    /// Response headers
    #[serde(default)]
    pub headers: Headers,
    /// Response body (base64 on the wire)
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

/// One unit on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Relay -> client
    ForwardRequest(ForwardRequest),
    /// Client -> relay
    ForwardResponse(ForwardResponse),
}

impl Frame {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Frame::ForwardRequest(req) => &req.id,
            Frame::ForwardResponse(resp) => &resp.id,
        }
    }

    /// Wire name of the frame kind
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::ForwardRequest(_) => "forward_request",
            Frame::ForwardResponse(_) => "forward_response",
        }
    }
}

impl From<ForwardRequest> for Frame {
    fn from(req: ForwardRequest) -> Self {
        Frame::ForwardRequest(req)
    }
}

impl From<ForwardResponse> for Frame {
    fn from(resp: ForwardResponse) -> Self {
        Frame::ForwardResponse(resp)
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
