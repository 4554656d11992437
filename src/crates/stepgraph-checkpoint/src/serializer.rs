//! Serialization protocol for checkpoint payloads
//!
//! Two layers: [`SerializerProtocol`] is the pluggable codec stores use to
//! turn checkpoints into bytes (JSON by default, bincode for compactness);
//! [`WireValue`] is an explicit, versioned tagged union for the payload
//! shapes the engine must round-trip: primitives, nested sequences/maps,
//! and opaque binary blobs with a type discriminator. Anything outside the
//! closed set needs an explicit adapter; there is deliberately no
//! reconstruct-arbitrary-type-by-name path.

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol for serializing and deserializing checkpoint data
///
/// Implementations can provide custom serialization strategies
/// (JSON, bincode, compressed variants, etc.)
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;

    /// Serialize to JSON value (for compatibility)
    fn dumps_json<T: Serialize>(&self, value: &T) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Deserialize from JSON value (for compatibility)
    fn loads_json<T: for<'de> Deserialize<'de>>(&self, value: &serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// JSON-based serializer (default)
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Binary serializer using bincode
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Current wire format version accepted by [`WireEnvelope`]
pub const WIRE_VERSION: u32 = 1;

/// Tagged wire value - the closed set of payload shapes the engine
/// round-trips through checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Opaque binary blob, preserved byte-for-byte
    Bytes(Vec<u8>),
    Seq(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
}

impl WireValue {
    /// Convert a JSON value into the wire representation.
    ///
    /// Every JSON shape has a wire counterpart, so this cannot fail;
    /// numbers outside i64 become floats.
    pub fn from_json(value: &serde_json::Value) -> WireValue {
        match value {
            serde_json::Value::Null => WireValue::Null,
            serde_json::Value::Bool(b) => WireValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    WireValue::Int(i)
                } else {
                    WireValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => WireValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                WireValue::Seq(items.iter().map(WireValue::from_json).collect())
            }
            serde_json::Value::Object(map) => WireValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), WireValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON.
    ///
    /// Fails for [`WireValue::Bytes`], which has no lossless JSON shape -
    /// binary payloads only travel through the wire codec itself.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            WireValue::Null => serde_json::Value::Null,
            WireValue::Bool(b) => serde_json::Value::Bool(*b),
            WireValue::Int(i) => serde_json::json!(i),
            WireValue::Float(f) => serde_json::json!(f),
            WireValue::Text(s) => serde_json::Value::String(s.clone()),
            WireValue::Bytes(_) => {
                return Err(CheckpointError::InvalidUpdate(
                    "binary wire values have no JSON representation".to_string(),
                ))
            }
            WireValue::Seq(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(WireValue::to_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            WireValue::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(out)
            }
        })
    }
}

/// Versioned envelope around a [`WireValue`].
///
/// `loads` rejects envelopes written by a future format version instead of
/// guessing at their layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub v: u32,
    pub data: WireValue,
}

impl WireEnvelope {
    pub fn new(data: WireValue) -> Self {
        Self {
            v: WIRE_VERSION,
            data,
        }
    }

    /// Encode with the given serializer
    pub fn dumps<S: SerializerProtocol>(&self, serializer: &S) -> Result<Vec<u8>> {
        serializer.dumps(self)
    }

    /// Decode with the given serializer, rejecting unknown versions
    pub fn loads<S: SerializerProtocol>(serializer: &S, data: &[u8]) -> Result<Self> {
        let envelope: WireEnvelope = serializer.loads(data)?;
        if envelope.v > WIRE_VERSION {
            return Err(CheckpointError::Storage(format!(
                "unsupported wire version {} (max {})",
                envelope.v, WIRE_VERSION
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn test_json_serializer() {
        let serializer = JsonSerializer::new();
        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        let bytes = serializer.dumps(&data).unwrap();
        let restored: TestData = serializer.loads(&bytes).unwrap();

        assert_eq!(data, restored);
    }

    #[test]
    fn test_bincode_serializer() {
        let serializer = BincodeSerializer::new();
        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        let bytes = serializer.dumps(&data).unwrap();
        let restored: TestData = serializer.loads(&bytes).unwrap();

        assert_eq!(data, restored);
    }

    #[test]
    fn test_wire_value_json_round_trip() {
        let json = serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}],
            "count": 3,
            "ratio": 0.5,
            "done": false,
            "missing": null
        });

        let wire = WireValue::from_json(&json);
        assert_eq!(wire.to_json().unwrap(), json);
    }

    #[test]
    fn test_wire_value_bytes_round_trip() {
        let blob: Vec<u8> = (0u8..=255).collect();
        let mut map = BTreeMap::new();
        map.insert("payload".to_string(), WireValue::Bytes(blob.clone()));
        map.insert("tag".to_string(), WireValue::Text("image".to_string()));
        let envelope = WireEnvelope::new(WireValue::Map(map));

        let json_codec = JsonSerializer::new();
        let bytes = envelope.dumps(&json_codec).unwrap();
        let restored = WireEnvelope::loads(&json_codec, &bytes).unwrap();
        assert_eq!(restored, envelope);

        let bin_codec = BincodeSerializer::new();
        let bytes = envelope.dumps(&bin_codec).unwrap();
        let restored = WireEnvelope::loads(&bin_codec, &bytes).unwrap();
        assert_eq!(restored, envelope);

        if let WireValue::Map(map) = restored.data {
            assert_eq!(map["payload"], WireValue::Bytes(blob));
        } else {
            panic!("expected map");
        }
    }

    #[test]
    fn test_wire_bytes_reject_json_conversion() {
        let wire = WireValue::Bytes(vec![1, 2, 3]);
        assert!(wire.to_json().is_err());
    }

    mod wire_properties {
        use super::*;
        use proptest::prelude::*;

        fn wire_value_strategy() -> impl Strategy<Value = WireValue> {
            let leaf = prop_oneof![
                Just(WireValue::Null),
                any::<bool>().prop_map(WireValue::Bool),
                any::<i64>().prop_map(WireValue::Int),
                "[a-z0-9 ]{0,16}".prop_map(WireValue::Text),
                proptest::collection::vec(any::<u8>(), 0..64).prop_map(WireValue::Bytes),
            ];
            leaf.prop_recursive(3, 32, 8, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..4).prop_map(WireValue::Seq),
                    proptest::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                        .prop_map(WireValue::Map),
                ]
            })
        }

        proptest! {
            #[test]
            fn wire_round_trips_through_both_codecs(value in wire_value_strategy()) {
                let envelope = WireEnvelope::new(value);

                let json_codec = JsonSerializer::new();
                let bytes = envelope.dumps(&json_codec).unwrap();
                prop_assert_eq!(&WireEnvelope::loads(&json_codec, &bytes).unwrap(), &envelope);

                let bin_codec = BincodeSerializer::new();
                let bytes = envelope.dumps(&bin_codec).unwrap();
                prop_assert_eq!(&WireEnvelope::loads(&bin_codec, &bytes).unwrap(), &envelope);
            }
        }
    }

    #[test]
    fn test_wire_envelope_rejects_future_version() {
        let codec = JsonSerializer::new();
        let mut envelope = WireEnvelope::new(WireValue::Null);
        envelope.v = WIRE_VERSION + 1;
        let bytes = codec.dumps(&envelope).unwrap();

        let result = WireEnvelope::loads(&codec, &bytes);
        assert!(matches!(result, Err(CheckpointError::Storage(_))));
    }
}
