//! Per-method serialization codecs (spec §1 "Out of scope" and §9 "Dynamic
//! dispatch on handler codec").
//!
//! Each registered method carries a [`Codec`] tag selecting how its
//! arguments are decoded and its result encoded. `Raw` and `Json` are
//! fully implemented; `Marshal`/`Pickle`/`MsgPack` name real wire formats
//! this crate treats as external collaborators (spec §1's serialization
//! codecs are explicitly out of scope) and are represented as
//! byte-passthrough variants so the tag space stays complete for
//! interoperating with a peer that does implement them.

use serde_json::Value as JsonValue;

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Raw,
    Json,
    Marshal,
    Pickle,
    MsgPack,
}

/// A decoded method argument or result, generic over the handful of codecs
/// this crate understands structurally.
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl Payload {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Bytes(b) => b,
            Payload::Json(v) => serde_json::to_vec(&v).unwrap_or_default(),
        }
    }
}

impl Codec {
    /// Decode wire bytes into a [`Payload`] per this codec.
    pub fn decode(self, bytes: &[u8]) -> Result<Payload, ChannelError> {
        match self {
            Codec::Raw | Codec::Marshal | Codec::Pickle | Codec::MsgPack => {
                Ok(Payload::Bytes(bytes.to_vec()))
            }
            Codec::Json => {
                let value: JsonValue = serde_json::from_slice(bytes).map_err(|e| {
                    ChannelError::MalformedFrame(format!("invalid json payload: {e}"))
                })?;
                Ok(Payload::Json(value))
            }
        }
    }

    /// Encode a [`Payload`] to wire bytes per this codec.
    pub fn encode(self, payload: &Payload) -> Result<Vec<u8>, ChannelError> {
        match self {
            Codec::Raw | Codec::Marshal | Codec::Pickle | Codec::MsgPack => match payload {
                Payload::Bytes(b) => Ok(b.clone()),
                Payload::Json(v) => Ok(serde_json::to_vec(v).unwrap_or_default()),
            },
            Codec::Json => match payload {
                Payload::Json(v) => serde_json::to_vec(v).map_err(|e| {
                    ChannelError::MalformedFrame(format!("failed to encode json payload: {e}"))
                }),
                Payload::Bytes(b) => Ok(b.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_echo_round_trips_arbitrary_bytes() {
        let bytes = b"blah".to_vec();
        let payload = Codec::Raw.decode(&bytes).unwrap();
        let encoded = Codec::Raw.encode(&payload).unwrap();
        assert_eq!(encoded, bytes);
    }

    #[test]
    fn json_echo_round_trips_structurally_equal_value() {
        let value = serde_json::json!({"a": 1, "b": [1, 2, 3]});
        let bytes = serde_json::to_vec(&value).unwrap();
        let payload = Codec::Json.decode(&bytes).unwrap();
        let encoded = Codec::Json.encode(&payload).unwrap();
        let decoded_back: JsonValue = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded_back, value);
    }

    #[test]
    fn opaque_codec_passes_bytes_through_unchanged() {
        let bytes = b"whatever-the-peer-expects".to_vec();
        for codec in [Codec::Marshal, Codec::Pickle, Codec::MsgPack] {
            let payload = codec.decode(&bytes).unwrap();
            assert_eq!(codec.encode(&payload).unwrap(), bytes);
        }
    }
}
