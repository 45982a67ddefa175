use crate::error::MixerError;
use alloy::primitives::U256;

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Merkle address bits for the prover: the leaf index in binary, zero-padded
/// to `depth`, least significant bit first.
pub fn leaf_address_bits(leaf_index: &U256, depth: usize) -> Result<String, MixerError> {
    if leaf_index.bit_len() > depth {
        return Err(MixerError::InvalidState(format!(
            "leaf index {leaf_index} does not fit a depth-{depth} tree"
        )));
    }
    Ok((0..depth)
        .map(|i| if leaf_index.bit(i) { '1' } else { '0' })
        .collect())
}

/// Serde adapter storing 256-bit integers as decimal strings.
pub mod u256_dec {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&n.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        let s = String::deserialize(d)?;
        U256::from_str_radix(s.trim(), 10)
            .map_err(|_| serde::de::Error::custom("expected decimal integer string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_bits_are_lsb_first() {
        // 7 = 0b111, 6 = 0b110
        assert_eq!(leaf_address_bits(&U256::from(7u64), 5).unwrap(), "11100");
        assert_eq!(leaf_address_bits(&U256::from(6u64), 4).unwrap(), "0110");
        assert_eq!(leaf_address_bits(&U256::ZERO, 3).unwrap(), "000");
        assert!(leaf_address_bits(&U256::from(8u64), 3).is_err());
    }

    #[test]
    fn decimal_adapter_rejects_hex() {
        #[derive(serde::Deserialize)]
        struct W {
            #[serde(with = "u256_dec")]
            n: U256,
        }
        let w: W = serde_json::from_str(r#"{"n":"12345"}"#).unwrap();
        assert_eq!(w.n, U256::from(12345u64));
        assert!(serde_json::from_str::<W>(r#"{"n":"0x10"}"#).is_err());
    }
}
