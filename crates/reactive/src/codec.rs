use std::hash::Hash;

use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::error::{CodecResult, DecodeSnafu, EncodeSnafu};

/// Converts a store mapping to and from the string kept in durable storage.
pub trait StoreCodec<K, V>: Send + Sync {
    fn encode(&self, entries: &IndexMap<K, V>) -> CodecResult<String>;
    fn decode(&self, raw: &str) -> CodecResult<IndexMap<K, V>>;
}

/// JSON array of `[key, value]` pairs, in insertion order.
///
/// Duplicate keys in stored data keep their first position and last value.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPairsCodec;

impl<K, V> StoreCodec<K, V> for JsonPairsCodec
where
    K: Serialize + DeserializeOwned + Hash + Eq,
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, entries: &IndexMap<K, V>) -> CodecResult<String> {
        let pairs = entries.iter().collect::<Vec<(&K, &V)>>();
        serde_json::to_string(&pairs).context(EncodeSnafu {
            stage: "json-pairs-encode",
        })
    }

    fn decode(&self, raw: &str) -> CodecResult<IndexMap<K, V>> {
        let pairs: Vec<(K, V)> = serde_json::from_str(raw).context(DecodeSnafu {
            stage: "json-pairs-decode",
        })?;
        Ok(pairs.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn encodes_pairs_in_insertion_order() {
        let mut entries = IndexMap::new();
        entries.insert("b".to_string(), 2);
        entries.insert("a".to_string(), 1);

        let encoded = JsonPairsCodec.encode(&entries).unwrap();
        assert_eq!(encoded, r#"[["b",2],["a",1]]"#);

        let decoded: IndexMap<String, i32> = JsonPairsCodec.decode(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn rejects_non_pair_payloads() {
        for raw in ["", "{}", r#"[["a"]]"#, "not json"] {
            let decoded: CodecResult<IndexMap<String, i32>> = JsonPairsCodec.decode(raw);
            assert!(decoded.is_err(), "{raw:?} should not decode");
        }
    }
}
