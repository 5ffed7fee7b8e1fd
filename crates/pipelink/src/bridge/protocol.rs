//! Wire-level identifiers shared by every pipeline node.
//!
//! A frame on the node-to-node stream carries no type tag: the same frame is the
//! forwarded request on the way down and the resolved result on the way back,
//! matched purely by its request id.

use serde::{Deserialize, Serialize};

/// Width of a serialized request id (hyphenated UUID text form).
pub const REQUEST_ID_LEN: usize = 36;

/// Correlation id linking a forwarded request to its eventual result.
///
/// UUID v4, generated once per ingress call. On the wire it is always the
/// 36-byte ASCII hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }

    /// Parse the fixed-width wire form. Anything but exactly 36 bytes of
    /// hyphenated ASCII is rejected.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != REQUEST_ID_LEN {
            return None;
        }
        let text = std::str::from_utf8(bytes).ok()?;
        uuid::Uuid::try_parse(text).ok().map(Self)
    }

    pub fn to_wire(&self) -> [u8; REQUEST_ID_LEN] {
        let mut buf = [0u8; REQUEST_ID_LEN];
        self.0.hyphenated().encode_lower(&mut buf);
        buf
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_is_36_ascii_bytes() {
        let id = RequestId::new();
        let wire = id.to_wire();
        assert_eq!(wire.len(), REQUEST_ID_LEN);
        assert!(wire.is_ascii());
        assert_eq!(std::str::from_utf8(&wire).unwrap(), id.to_string());
    }

    #[test]
    fn from_wire_roundtrips() {
        let id = RequestId::new();
        assert_eq!(RequestId::from_wire(&id.to_wire()), Some(id));
    }

    #[test]
    fn from_wire_rejects_wrong_width_and_garbage() {
        assert!(RequestId::from_wire(b"too-short").is_none());
        assert!(RequestId::from_wire(&[b'z'; REQUEST_ID_LEN]).is_none());
        // simple (unhyphenated) form is 32 bytes and never valid on the wire
        let simple = uuid::Uuid::new_v4().simple().to_string();
        assert!(RequestId::from_wire(simple.as_bytes()).is_none());
    }

    #[test]
    fn serializes_transparently() {
        let id = RequestId::parse("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        insta::assert_json_snapshot!(id, @r#""67e55044-10b1-426f-9247-bb680e5fe0c8""#);
    }
}
