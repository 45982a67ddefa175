//! Leaf and nullifier hash primitives, as an input/output contract.
//!
//! The leaf is `sha256(secret_be32 || destination_be32)` with the top 4 bits
//! cleared so it fits the scalar field. The nullifier is delegated to a
//! `NullifierSource`; both can fall back to the contract's view functions,
//! which means handing the secret to the RPC node.

use crate::chain::ChainClient;
use crate::config::{LeafSource, NullifierConfig};
use crate::error::{MixerError, MixerResult};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tokio::task;

pub fn local_leaf_hash(secret: &U256, destination: &Address) -> U256 {
    let mut h = Sha256::new();
    h.update(secret.to_be_bytes::<32>());
    h.update(destination.into_word());
    let mut digest: [u8; 32] = h.finalize().into();
    digest[0] &= 0x0f;
    U256::from_be_bytes(digest)
}

#[async_trait]
pub trait NullifierSource: Send + Sync {
    async fn nullifier_hash(&self, secret: &U256, chain: &dyn ChainClient) -> MixerResult<U256>;
}

/// Dedicated executable: reads the decimal secret on stdin and prints the
/// decimal nullifier on stdout. The secret never appears in argv.
pub struct CommandNullifier {
    bin: PathBuf,
}

impl CommandNullifier {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

pub(crate) fn parse_nullifier_output(stdout: &str) -> MixerResult<U256> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| MixerError::ProofGeneration("nullifier command printed nothing".into()))?;
    U256::from_str_radix(line, 10)
        .map_err(|_| MixerError::ProofGeneration(format!("nullifier output not decimal: {line:?}")))
}

fn run_with_stdin(bin: &Path, input: &str) -> Result<std::process::Output, String> {
    let mut child = Command::new(bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("spawn {} failed: {e}", bin.display()))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .map_err(|e| format!("write secret to {}: {e}", bin.display()))?;
    }
    child
        .wait_with_output()
        .map_err(|e| format!("wait for {}: {e}", bin.display()))
}

#[async_trait]
impl NullifierSource for CommandNullifier {
    async fn nullifier_hash(&self, secret: &U256, _chain: &dyn ChainClient) -> MixerResult<U256> {
        let bin = self.bin.clone();
        let secret = secret.to_string();
        let out = task::spawn_blocking(move || run_with_stdin(&bin, &secret))
            .await
            .map_err(|e| MixerError::ProofGeneration(format!("nullifier task panicked: {e}")))?
            .map_err(MixerError::ProofGeneration)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(MixerError::ProofGeneration(format!(
                "nullifier command failed (code={:?}). stderr='{stderr}'",
                out.status.code()
            )));
        }
        parse_nullifier_output(&String::from_utf8_lossy(&out.stdout))
    }
}

pub struct ContractNullifier;

#[async_trait]
impl NullifierSource for ContractNullifier {
    async fn nullifier_hash(&self, secret: &U256, chain: &dyn ChainClient) -> MixerResult<U256> {
        chain.make_nullifier_hash(secret).await
    }
}

pub struct CommitmentHasher {
    leaf_source: LeafSource,
    nullifiers: Arc<dyn NullifierSource>,
}

impl CommitmentHasher {
    pub fn new(leaf_source: LeafSource, nullifiers: Arc<dyn NullifierSource>) -> Self {
        Self {
            leaf_source,
            nullifiers,
        }
    }

    pub fn from_config(leaf_source: LeafSource, nullifier: &NullifierConfig) -> Self {
        let nullifiers: Arc<dyn NullifierSource> = match nullifier {
            NullifierConfig::Command { bin } => Arc::new(CommandNullifier::new(bin.clone())),
            NullifierConfig::Contract => Arc::new(ContractNullifier),
        };
        Self::new(leaf_source, nullifiers)
    }

    pub async fn leaf_hash(
        &self,
        secret: &U256,
        destination: &Address,
        chain: &dyn ChainClient,
    ) -> MixerResult<U256> {
        match self.leaf_source {
            LeafSource::Local => Ok(local_leaf_hash(secret, destination)),
            LeafSource::Contract => chain.make_leaf_hash(secret, destination).await,
        }
    }

    pub async fn nullifier_hash(
        &self,
        secret: &U256,
        chain: &dyn ChainClient,
    ) -> MixerResult<U256> {
        self.nullifiers.nullifier_hash(secret, chain).await
    }
}
