// Centralized constants (kept out of the orchestrator and adapters).

use alloy::primitives::{uint, U256};

// ---------------------------------------------------------------------
// Field / circuit parameters
// ---------------------------------------------------------------------
/// BN254 scalar field modulus; secrets are drawn uniformly below it.
pub const SCALAR_FIELD_MODULUS: U256 =
    uint!(0x30644e72e131a029b85045b68181585d2833e84879b9709143e1f593f0000001_U256);
/// Merkle tree depth the circuit was compiled for; `getMerklePath` returns this many nodes.
pub const MERKLE_TREE_DEPTH: usize = 29;
/// Number of uint256 words in a flattened Groth16 proof (A ++ B0 ++ B1 ++ C).
pub const FLAT_PROOF_WORDS: usize = 8;

// ---------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------
/// Gas limits handed to the relay (the relay owns pricing).
pub const COMMIT_GAS_LIMIT: u64 = 100_000;
pub const WITHDRAW_GAS_LIMIT: u64 = 1_000_000;

// ---------------------------------------------------------------------
// Runtime defaults
// ---------------------------------------------------------------------
pub const DEFAULT_START_BLOCK: u64 = 5_500_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_RECEIPT_POLL_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_API_BIND: &str = "127.0.0.1:8383";
pub const DEFAULT_STORE_PATH: &str = "./commitments.json";
pub const DEFAULT_PROVER_BIN: &str = "/usr/local/bin/mixer_cli";
pub const MIN_API_TOKEN_LEN: usize = 16;

// ---------------------------------------------------------------------
// Input validation limits
// ---------------------------------------------------------------------
pub const MAX_POOL_ID_LEN: usize = 64;
pub const MAX_ADDRESS_STR_LEN: usize = 2 + 40;
pub const MAX_DEPLOYMENTS_JSON_BYTES: u64 = 256 * 1024;
