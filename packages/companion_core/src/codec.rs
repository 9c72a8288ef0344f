//! Optional transformation of the `payload` field (e.g. end-to-end encryption).
//!
//! The codec runs beneath request correlation: outbound payloads are encoded
//! just before the frame is written and inbound payloads are decoded right
//! after a frame is parsed. The `authenticate` handshake is never encoded.

use serde_json::Value;

pub trait PayloadCodec: Send + Sync {
    fn encode(&self, payload: Value) -> Result<Value, String>;
    fn decode(&self, payload: Value) -> Result<Value, String>;
}

/// Identity codec, used when no encryption is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCodec;

impl PayloadCodec for PlainCodec {
    fn encode(&self, payload: Value) -> Result<Value, String> {
        Ok(payload)
    }

    fn decode(&self, payload: Value) -> Result<Value, String> {
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_codec_is_identity() {
        let payload = json!({"sessionId": "s1", "limit": 50});
        assert_eq!(PlainCodec.encode(payload.clone()).unwrap(), payload);
        assert_eq!(PlainCodec.decode(payload.clone()).unwrap(), payload);
    }
}
