//! Shared record + API types.
//!
//! `Commitment` is the persisted record; `CommitmentView` is what leaves the
//! process over HTTP (never the secret).

use crate::constants::SCALAR_FIELD_MODULUS;
use crate::error::AppError;
use crate::validation::{ensure_address_len, ensure_pool_id};
use alloy::primitives::{Address, U256};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type CommitmentId = String;

/// Uniform draw below the scalar field modulus (rejection sampling).
pub fn random_secret() -> U256 {
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        // modulus < 2^254
        bytes[0] &= 0x3f;
        let n = U256::from_be_bytes(bytes);
        if n < SCALAR_FIELD_MODULUS {
            return n;
        }
    }
}

/// Persisted deposit/withdrawal record.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commitment {
    pub id: CommitmentId,
    pub pool_id: String,
    #[serde(default)]
    pub origin: Option<Address>,
    pub destination: Address,
    #[serde(with = "crate::utils::u256_dec")]
    pub secret: U256,
    #[serde(default)]
    pub leaf_index: Option<String>,

    // commit phase
    #[serde(default)]
    pub commit_requested: bool,
    #[serde(default)]
    pub commit_tx_hash: Option<String>,
    #[serde(default)]
    pub commit_block_number: Option<u64>,
    #[serde(default)]
    pub commit_succeeded: Option<bool>,
    #[serde(default)]
    pub commit_relay_failed: bool,

    // funding + anonymity set
    #[serde(default)]
    pub funding_block_number: Option<u64>,
    #[serde(default)]
    pub last_scanned_block: Option<u64>,
    #[serde(default)]
    pub subsequent_deposit_count: u64,

    // withdrawal phase
    #[serde(default)]
    pub withdraw_requested: bool,
    #[serde(default)]
    pub withdraw_tx_hash: Option<String>,
    #[serde(default)]
    pub withdraw_block_number: Option<u64>,
    #[serde(default)]
    pub withdraw_confirmed_ts_ms: Option<u64>,
    #[serde(default)]
    pub withdraw_succeeded: Option<bool>,
    #[serde(default)]
    pub withdraw_relay_failed: bool,
    #[serde(default)]
    pub withdraw_proof_failed: bool,
    #[serde(default)]
    pub proof_computed: bool,

    #[serde(default)]
    pub last_error: Option<String>,
    pub created_ts_ms: u64,
}

impl Commitment {
    /// Fresh record with a uniformly random secret below the scalar field modulus.
    pub fn new(pool_id: &str, destination: Address, origin: Option<Address>) -> Self {
        Self::with_secret(pool_id, destination, origin, random_secret())
    }

    pub fn with_secret(
        pool_id: &str,
        destination: Address,
        origin: Option<Address>,
        secret: U256,
    ) -> Self {
        Commitment {
            id: uuid::Uuid::new_v4().to_string(),
            pool_id: pool_id.to_string(),
            origin,
            destination,
            secret,
            leaf_index: None,
            commit_requested: false,
            commit_tx_hash: None,
            commit_block_number: None,
            commit_succeeded: None,
            commit_relay_failed: false,
            funding_block_number: None,
            last_scanned_block: None,
            subsequent_deposit_count: 0,
            withdraw_requested: false,
            withdraw_tx_hash: None,
            withdraw_block_number: None,
            withdraw_confirmed_ts_ms: None,
            withdraw_succeeded: None,
            withdraw_relay_failed: false,
            withdraw_proof_failed: false,
            proof_computed: false,
            last_error: None,
            created_ts_ms: crate::utils::now_ms(),
        }
    }

    pub fn is_funded(&self) -> bool {
        self.funding_block_number.is_some() && self.leaf_index.is_some()
    }

    pub fn leaf_index_value(&self) -> Option<U256> {
        self.leaf_index
            .as_deref()
            .and_then(|s| U256::from_str_radix(s, 10).ok())
    }
}

// The secret stays out of Debug output so it can't leak through logs.
impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commitment")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("destination", &self.destination)
            .field("leaf_index", &self.leaf_index)
            .field("funding_block_number", &self.funding_block_number)
            .field("withdraw_requested", &self.withdraw_requested)
            .field("withdraw_tx_hash", &self.withdraw_tx_hash)
            .field("withdraw_confirmed_ts_ms", &self.withdraw_confirmed_ts_ms)
            .finish_non_exhaustive()
    }
}

/// API representation of a commitment.
#[derive(Debug, Clone, Serialize)]
pub struct CommitmentView {
    pub id: CommitmentId,
    pub pool_id: String,
    pub state: &'static str,
    pub origin: Option<Address>,
    pub destination: Address,
    pub leaf_index: Option<String>,
    pub commit_requested: bool,
    pub commit_tx_hash: Option<String>,
    pub commit_block_number: Option<u64>,
    pub commit_succeeded: Option<bool>,
    pub commit_relay_failed: bool,
    pub funding_block_number: Option<u64>,
    pub last_scanned_block: Option<u64>,
    pub subsequent_deposit_count: u64,
    pub withdraw_requested: bool,
    pub withdraw_tx_hash: Option<String>,
    pub withdraw_block_number: Option<u64>,
    pub withdraw_confirmed_ts_ms: Option<u64>,
    pub withdraw_succeeded: Option<bool>,
    pub withdraw_relay_failed: bool,
    pub withdraw_proof_failed: bool,
    pub proof_computed: bool,
    pub last_error: Option<String>,
    pub created_ts_ms: u64,
}

impl CommitmentView {
    pub fn new(c: &Commitment, state: &'static str) -> Self {
        CommitmentView {
            id: c.id.clone(),
            pool_id: c.pool_id.clone(),
            state,
            origin: c.origin,
            destination: c.destination,
            leaf_index: c.leaf_index.clone(),
            commit_requested: c.commit_requested,
            commit_tx_hash: c.commit_tx_hash.clone(),
            commit_block_number: c.commit_block_number,
            commit_succeeded: c.commit_succeeded,
            commit_relay_failed: c.commit_relay_failed,
            funding_block_number: c.funding_block_number,
            last_scanned_block: c.last_scanned_block,
            subsequent_deposit_count: c.subsequent_deposit_count,
            withdraw_requested: c.withdraw_requested,
            withdraw_tx_hash: c.withdraw_tx_hash.clone(),
            withdraw_block_number: c.withdraw_block_number,
            withdraw_confirmed_ts_ms: c.withdraw_confirmed_ts_ms,
            withdraw_succeeded: c.withdraw_succeeded,
            withdraw_relay_failed: c.withdraw_relay_failed,
            withdraw_proof_failed: c.withdraw_proof_failed,
            proof_computed: c.proof_computed,
            last_error: c.last_error.clone(),
            created_ts_ms: c.created_ts_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCommitmentRequest {
    pub pool_id: String,
    /// Withdrawal recipient (0x-hex, 20 bytes).
    pub destination: String,
    /// Funder address; only needed for pools with a commit phase.
    #[serde(default)]
    pub origin: Option<String>,
}

impl CreateCommitmentRequest {
    pub fn validate(&self) -> Result<(Address, Option<Address>), AppError> {
        ensure_pool_id(&self.pool_id)?;
        ensure_address_len("destination", &self.destination)?;
        let destination: Address = self
            .destination
            .parse()
            .map_err(|e| AppError::BadRequest(format!("Invalid destination: {e}")))?;
        let origin = match self.origin.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => {
                ensure_address_len("origin", s)?;
                Some(
                    s.parse::<Address>()
                        .map_err(|e| AppError::BadRequest(format!("Invalid origin: {e}")))?,
                )
            }
            _ => None,
        };
        Ok((destination, origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn dest() -> Address {
        address!("1111111111111111111111111111111111111111")
    }

    #[test]
    fn new_secret_is_below_modulus_and_distinct() {
        let a = Commitment::new("ropsten", dest(), None);
        let b = Commitment::new("ropsten", dest(), None);
        assert!(a.secret < SCALAR_FIELD_MODULUS);
        assert_ne!(a.secret, b.secret);
        assert_ne!(a.id, b.id);
        assert!(!a.is_funded());
        assert!((0..256).all(|_| random_secret() < SCALAR_FIELD_MODULUS));
    }

    #[test]
    fn record_round_trips_through_json_with_decimal_secret() {
        let c = Commitment::with_secret("ropsten", dest(), None, U256::from(12345u64));
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["secret"], "12345");
        let back: Commitment = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn leaf_index_parses_decimal() {
        let mut c = Commitment::with_secret("ropsten", dest(), None, U256::from(1u64));
        assert_eq!(c.leaf_index_value(), None);
        c.leaf_index = Some("7".into());
        assert_eq!(c.leaf_index_value(), Some(U256::from(7u64)));
        c.leaf_index = Some("0x7".into());
        assert_eq!(c.leaf_index_value(), None);
    }

    #[test]
    fn debug_output_hides_secret() {
        let c = Commitment::with_secret("ropsten", dest(), None, U256::from(987654321u64));
        assert!(!format!("{c:?}").contains("987654321"));
    }

    #[test]
    fn create_request_parses_addresses() {
        let req = CreateCommitmentRequest {
            pool_id: "ropsten".into(),
            destination: "not-an-address".into(),
            origin: None,
        };
        assert!(req.validate().is_err());

        let req = CreateCommitmentRequest {
            pool_id: "ropsten".into(),
            destination: "0x1111111111111111111111111111111111111111".into(),
            origin: Some(" ".into()),
        };
        assert_eq!(req.validate().unwrap(), (dest(), None));
    }
}
