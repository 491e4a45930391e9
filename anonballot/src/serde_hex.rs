//! Hex encodings for `#[serde(with = "...")]` on big integer fields.

/// A `BigUint` as big-endian hex
pub mod biguint_hex {
    use num_bigint_dig::BigUint;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        hex::serialize(value.to_bytes_be(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let bytes: Vec<u8> = hex::deserialize(deserializer)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use num_bigint_dig::BigUint;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Holder {
        #[serde(with = "super::biguint_hex")]
        value: BigUint,
    }

    #[test]
    fn test_biguint_hex_json() {
        let holder = Holder {
            value: BigUint::from(0xdead_beefu32),
        };
        let json = serde_json::to_string(&holder).unwrap();
        assert_eq!(json, r#"{"value":"deadbeef"}"#);
        let back: Holder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, holder);
    }
}
