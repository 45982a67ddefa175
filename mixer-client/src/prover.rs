//! Withdrawal proof construction via the external prover CLI.
//!
//! Invocation:
//!   `<bin> prove <pk> <proof.json> <root> <wallet> <nullifier> <secret> <address-bits> <path...>`
//!   `<bin> verify <vk> <proof.json>` (only when a verifying key is configured)

use crate::config::ProverConfig;
use crate::constants::FLAT_PROOF_WORDS;
use crate::error::{MixerError, MixerResult};
use crate::utils::leaf_address_bits;
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::Builder;
use tokio::task;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ProofRequest {
    pub root: U256,
    pub destination: Address,
    pub nullifier: U256,
    pub secret: U256,
    pub leaf_index: U256,
    pub merkle_path: Vec<U256>,
}

/// Groth16 proof flattened as `A ++ B[0] ++ B[1] ++ C`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof(pub [U256; FLAT_PROOF_WORDS]);

#[async_trait]
pub trait ProofService: Send + Sync {
    async fn build_proof(&self, req: ProofRequest) -> MixerResult<Proof>;
}

#[derive(Debug, Deserialize)]
struct ProofJson {
    #[serde(rename = "A")]
    a: Vec<String>,
    #[serde(rename = "B")]
    b: Vec<Vec<String>>,
    #[serde(rename = "C")]
    c: Vec<String>,
}

fn parse_word(s: &str) -> MixerResult<U256> {
    let t = s.trim();
    let n = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(t, 10),
    };
    n.map_err(|_| MixerError::ProofGeneration(format!("invalid proof element: {t:?}")))
}

pub fn flatten_proof_json(raw: &str) -> MixerResult<Proof> {
    let p: ProofJson = serde_json::from_str(raw)
        .map_err(|e| MixerError::ProofGeneration(format!("proof.json parse failed: {e}")))?;
    if p.a.len() != 2 || p.c.len() != 2 || p.b.len() != 2 || p.b.iter().any(|row| row.len() != 2) {
        return Err(MixerError::ProofGeneration(
            "proof.json must have A[2], B[2][2], C[2]".into(),
        ));
    }
    let flat: Vec<U256> = p
        .a
        .iter()
        .chain(p.b[0].iter())
        .chain(p.b[1].iter())
        .chain(p.c.iter())
        .map(|s| parse_word(s))
        .collect::<MixerResult<_>>()?;
    let words: [U256; FLAT_PROOF_WORDS] = flat
        .try_into()
        .map_err(|_| MixerError::ProofGeneration("flattened proof has wrong length".into()))?;
    Ok(Proof(words))
}

pub struct CommandProver {
    cfg: ProverConfig,
    tmp_root: PathBuf,
}

impl CommandProver {
    pub fn new(cfg: ProverConfig) -> Self {
        Self {
            cfg,
            tmp_root: std::env::temp_dir(),
        }
    }

    pub fn with_tmp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_root = dir.into();
        self
    }

    pub fn prove_args(&self, req: &ProofRequest, proof_path: &Path) -> MixerResult<Vec<String>> {
        if req.merkle_path.len() != self.cfg.tree_depth {
            return Err(MixerError::ProofGeneration(format!(
                "merkle path has {} nodes, tree depth is {}",
                req.merkle_path.len(),
                self.cfg.tree_depth
            )));
        }
        let bits = leaf_address_bits(&req.leaf_index, self.cfg.tree_depth)
            .map_err(|e| MixerError::ProofGeneration(e.to_string()))?;
        let mut args = vec![
            "prove".to_string(),
            self.cfg.proving_key.display().to_string(),
            proof_path.display().to_string(),
            req.root.to_string(),
            U256::from_be_slice(req.destination.as_slice()).to_string(),
            req.nullifier.to_string(),
            req.secret.to_string(),
            bits,
        ];
        args.extend(req.merkle_path.iter().map(U256::to_string));
        Ok(args)
    }
}

fn run_checked(bin: &Path, args: &[String], what: &str) -> Result<(), String> {
    let out = std::process::Command::new(bin)
        .args(args)
        .output()
        .map_err(|e| format!("{what}: spawn {} failed: {e}", bin.display()))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
        return Err(format!(
            "{what} failed (code={:?}). stderr='{stderr}' stdout='{stdout}'",
            out.status.code()
        ));
    }
    Ok(())
}

#[async_trait]
impl ProofService for CommandProver {
    async fn build_proof(&self, req: ProofRequest) -> MixerResult<Proof> {
        let dir = Builder::new()
            .prefix("mixer_withdraw_prove")
            .tempdir_in(&self.tmp_root)
            .map_err(|e| MixerError::ProofGeneration(format!("tempdir: {e}")))?;
        let proof_path = dir.path().join("proof.json");
        let prove_args = self.prove_args(&req, &proof_path)?;
        let verify_args = self.cfg.verifying_key.as_ref().map(|vk| {
            vec![
                "verify".to_string(),
                vk.display().to_string(),
                proof_path.display().to_string(),
            ]
        });
        let bin = self.cfg.bin.clone();
        let proof_path_run = proof_path.clone();

        // The prover is CPU-bound for seconds; keep it off the async workers.
        let raw = task::spawn_blocking(move || -> Result<String, String> {
            let t = Instant::now();
            run_checked(&bin, &prove_args, "prove")?;
            if let Some(args) = verify_args {
                run_checked(&bin, &args, "verify")?;
            }
            let raw = std::fs::read_to_string(&proof_path_run)
                .map_err(|e| format!("read proof.json: {e}"))?;
            debug!(elapsed_ms = t.elapsed().as_millis() as u64, "prover finished");
            Ok(raw)
        })
        .await
        .map_err(|e| MixerError::ProofGeneration(format!("prover task panicked: {e}")))?
        .map_err(MixerError::ProofGeneration)?;

        // `dir` lives until here so the proof file survives the blocking task.
        drop(dir);
        flatten_proof_json(&raw)
    }
}
