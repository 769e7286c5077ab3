//! Serde helpers for byte fields
//!
//! Byte payloads travel as `0x`-prefixed hex strings inside JSON so that
//! encoded reports stay readable and byte-for-byte reproducible.

/// `Vec<u8>` as a `0x`-prefixed hex string
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(serde::de::Error::custom)
    }

    /// Decode a hex string with or without `0x` prefix
    ///
    /// # Errors
    ///
    /// Returns error if the string is not valid hex
    pub fn decode(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(s.strip_prefix("0x").unwrap_or(s))
    }
}

/// `Vec<Vec<u8>>` as a list of `0x`-prefixed hex strings
pub mod hex_bytes_list {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&format!("0x{}", hex::encode(item)))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| super::hex_bytes::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::hex_bytes")]
        single: Vec<u8>,
        #[serde(with = "super::hex_bytes_list")]
        many: Vec<Vec<u8>>,
    }

    #[test]
    fn encodes_as_prefixed_hex() {
        let sample = Sample {
            single: vec![0xde, 0xad],
            many: vec![vec![0x01], vec![]],
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["single"], "0xdead");
        assert_eq!(json["many"][1], "0x");
    }

    #[test]
    fn accepts_unprefixed_hex() {
        let sample: Sample =
            serde_json::from_str(r#"{"single":"beef","many":["0x02"]}"#).unwrap();
        assert_eq!(sample.single, vec![0xbe, 0xef]);
        assert_eq!(sample.many, vec![vec![0x02]]);
    }
}
