//! Environment-driven configuration for `mixer-client`.
//!
//! Everything process-wide comes from env vars; per-pool settings come from a
//! JSON deployments file (`MIXER_DEPLOYMENTS_PATH`).

use crate::constants::{
    DEFAULT_API_BIND, DEFAULT_POLL_INTERVAL_MS, DEFAULT_PROVER_BIN,
    DEFAULT_RECEIPT_POLL_INTERVAL_MS, DEFAULT_START_BLOCK, DEFAULT_STORE_PATH,
    MAX_DEPLOYMENTS_JSON_BYTES, MERKLE_TREE_DEPTH, MIN_API_TOKEN_LEN,
};
use crate::validation::ensure_pool_id;
use alloy::primitives::Address;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use url::Url;

/// One mixer contract and the services that front it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub rpc_url: Url,
    pub contract_address: Address,
    pub relayer_endpoint: Url,
    pub chain_id: u64,
    /// First block worth scanning when no commit block is known.
    pub start_block: u64,
    /// Deployment expects a `commit(leaf, funder)` call before funding.
    pub commit_phase: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeployment {
    rpc_url: String,
    contract_address: String,
    relayer_endpoint: String,
    chain_id: u64,
    #[serde(default)]
    start_block: Option<u64>,
    #[serde(default)]
    commit_phase: bool,
}

#[derive(Debug, Deserialize)]
struct RawDeploymentsFile {
    deployments: HashMap<String, RawDeployment>,
}

#[derive(Debug, Clone)]
pub struct ProverConfig {
    pub bin: PathBuf,
    pub proving_key: PathBuf,
    /// When set, every proof is verified locally before it is relayed.
    pub verifying_key: Option<PathBuf>,
    pub tree_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafSource {
    /// sha256 over the secret and destination, computed in-process.
    Local,
    /// `makeLeafHash` view call. Sends the secret to the RPC node.
    Contract,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NullifierConfig {
    /// Local executable: reads the decimal secret on stdin, prints the decimal hash.
    Command { bin: PathBuf },
    /// `makeNullifierHash` view call. Sends the secret to the RPC node.
    Contract,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Token gating every endpoint but `/health`.
    ///
    /// Send via `Authorization: Bearer <token>` (or `x-api-token`).
    pub api_token: String,
    /// Axum bind address, host:port.
    pub api_bind: String,
    pub deployments: HashMap<String, Deployment>,
    /// JSON snapshot of all commitments.
    pub store_path: PathBuf,
    pub prover: ProverConfig,
    pub leaf_source: LeafSource,
    pub nullifier: NullifierConfig,
    pub poll_interval_ms: u64,
    pub receipt_poll_interval_ms: u64,
}

fn env_required(key: &str) -> anyhow::Result<String> {
    let v = env::var(key).with_context(|| format!("Missing env var: {key}"))?;
    let v = v.trim().to_string();
    if v.is_empty() {
        anyhow::bail!("{key} must be non-empty");
    }
    Ok(v)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_lowercase();
            matches!(s.as_str(), "1" | "true" | "yes" | "y" | "on")
        })
        .unwrap_or(default)
}

fn validate_http_url(field: &str, raw: &str) -> anyhow::Result<Url> {
    let u = Url::parse(raw.trim()).with_context(|| format!("Invalid {field}: {raw}"))?;
    if !matches!(u.scheme(), "http" | "https") {
        anyhow::bail!("{field} must use http or https: {raw}");
    }
    if u.host_str().is_none() {
        anyhow::bail!("{field} missing host: {raw}");
    }
    Ok(u)
}

pub fn parse_deployments(json: &str) -> anyhow::Result<HashMap<String, Deployment>> {
    let raw: RawDeploymentsFile =
        serde_json::from_str(json).context("Invalid deployments JSON")?;
    let mut out = HashMap::with_capacity(raw.deployments.len());
    for (pool_id, d) in raw.deployments {
        ensure_pool_id(&pool_id).map_err(|e| anyhow::anyhow!("deployment {pool_id:?}: {e}"))?;
        let contract_address: Address = d
            .contract_address
            .parse()
            .map_err(|e| anyhow::anyhow!("deployment {pool_id}: contractAddress: {e}"))?;
        let deployment = Deployment {
            rpc_url: validate_http_url(&format!("{pool_id}.rpcUrl"), &d.rpc_url)?,
            contract_address,
            relayer_endpoint: validate_http_url(
                &format!("{pool_id}.relayerEndpoint"),
                &d.relayer_endpoint,
            )?,
            chain_id: d.chain_id,
            start_block: d.start_block.unwrap_or(DEFAULT_START_BLOCK),
            commit_phase: d.commit_phase,
        };
        out.insert(pool_id, deployment);
    }
    if out.is_empty() {
        anyhow::bail!("deployments file lists no pools");
    }
    Ok(out)
}

pub fn load_deployments(path: &Path) -> anyhow::Result<HashMap<String, Deployment>> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Cannot stat deployments file {}", path.display()))?;
    if meta.len() > MAX_DEPLOYMENTS_JSON_BYTES {
        anyhow::bail!(
            "deployments file {} too large ({} bytes)",
            path.display(),
            meta.len()
        );
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read deployments file {}", path.display()))?;
    parse_deployments(&raw)
}

fn nullifier_config(
    source: Option<&str>,
    bin: Option<&str>,
    allow_remote: bool,
    prover_bin: &Path,
) -> anyhow::Result<NullifierConfig> {
    match source.unwrap_or("command").trim().to_lowercase().as_str() {
        "command" => {
            let bin = bin
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .context("NULLIFIER_SOURCE=command requires NULLIFIER_BIN")?;
            // The prover has no nullifier mode; pointing at it fails every withdrawal.
            if bin == prover_bin {
                anyhow::bail!(
                    "NULLIFIER_BIN must be a dedicated executable, not PROVER_BIN ({})",
                    prover_bin.display()
                );
            }
            Ok(NullifierConfig::Command { bin })
        }
        "contract" => {
            if !allow_remote {
                anyhow::bail!(
                    "NULLIFIER_SOURCE=contract sends secrets to the RPC node; set ALLOW_REMOTE_HASHING=true to accept that"
                );
            }
            tracing::warn!("nullifier hashes will be computed by the RPC node (secret leaves this host)");
            Ok(NullifierConfig::Contract)
        }
        other => anyhow::bail!("NULLIFIER_SOURCE must be 'command' or 'contract', got {other:?}"),
    }
}

fn load_leaf_source() -> anyhow::Result<LeafSource> {
    let source = env::var("LEAF_SOURCE").unwrap_or_else(|_| "local".to_string());
    match source.trim().to_lowercase().as_str() {
        "local" => Ok(LeafSource::Local),
        "contract" => {
            if !env_bool("ALLOW_REMOTE_HASHING", false) {
                anyhow::bail!(
                    "LEAF_SOURCE=contract sends secrets to the RPC node; set ALLOW_REMOTE_HASHING=true to accept that"
                );
            }
            tracing::warn!("leaf hashes will be computed by the RPC node (secret leaves this host)");
            Ok(LeafSource::Contract)
        }
        other => anyhow::bail!("LEAF_SOURCE must be 'local' or 'contract', got {other:?}"),
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    let api_token = env_required("API_TOKEN")?;
    if api_token.len() < MIN_API_TOKEN_LEN {
        anyhow::bail!("API_TOKEN must be at least {MIN_API_TOKEN_LEN} characters");
    }

    // Loopback unless explicitly configured.
    let api_bind = env::var("API_BIND").unwrap_or_else(|_| DEFAULT_API_BIND.to_string());

    let deployments_path = PathBuf::from(env_required("MIXER_DEPLOYMENTS_PATH")?);
    let deployments = load_deployments(&deployments_path)?;

    let store_path = env::var("STORE_PATH")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));

    let prover_bin = env::var("PROVER_BIN")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROVER_BIN));
    let proving_key = PathBuf::from(env_required("PROVING_KEY_PATH")?);
    let verifying_key = env::var("VERIFYING_KEY_PATH")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from);

    let leaf_source = load_leaf_source()?;
    let nullifier = nullifier_config(
        env::var("NULLIFIER_SOURCE").ok().as_deref(),
        env::var("NULLIFIER_BIN").ok().as_deref(),
        env_bool("ALLOW_REMOTE_HASHING", false),
        &prover_bin,
    )?;

    Ok(Config {
        api_token,
        api_bind,
        deployments,
        store_path,
        prover: ProverConfig {
            bin: prover_bin,
            proving_key,
            verifying_key,
            tree_depth: MERKLE_TREE_DEPTH,
        },
        leaf_source,
        nullifier,
        poll_interval_ms: env_u64("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS).max(50),
        receipt_poll_interval_ms: env_u64(
            "RECEIPT_POLL_INTERVAL_MS",
            DEFAULT_RECEIPT_POLL_INTERVAL_MS,
        )
        .max(50),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "deployments": {
            "ropsten": {
                "rpcUrl": "https://ropsten.example.org/v3/key",
                "contractAddress": "0x1111111111111111111111111111111111111111",
                "relayerEndpoint": "http://127.0.0.1:8545",
                "chainId": 3
            },
            "devnet": {
                "rpcUrl": "http://localhost:8545",
                "contractAddress": "2222222222222222222222222222222222222222",
                "relayerEndpoint": "http://localhost:9000/rpc",
                "chainId": 1337,
                "startBlock": 0,
                "commitPhase": true
            }
        }
    }"#;

    #[test]
    fn parses_deployments_with_defaults() {
        let d = parse_deployments(SAMPLE).unwrap();
        let ropsten = &d["ropsten"];
        assert_eq!(ropsten.chain_id, 3);
        assert_eq!(ropsten.start_block, DEFAULT_START_BLOCK);
        assert!(!ropsten.commit_phase);
        let devnet = &d["devnet"];
        assert_eq!(devnet.start_block, 0);
        assert!(devnet.commit_phase);
        assert_eq!(
            devnet.contract_address.to_string(),
            "0x2222222222222222222222222222222222222222"
        );
    }

    #[test]
    fn rejects_bad_urls_and_addresses() {
        let bad_scheme = SAMPLE.replace("https://ropsten", "ftp://ropsten");
        assert!(parse_deployments(&bad_scheme).is_err());
        let bad_addr = SAMPLE.replace("0x1111111111111111111111111111111111111111", "0x11");
        assert!(parse_deployments(&bad_addr).is_err());
        assert!(parse_deployments(r#"{"deployments":{}}"#).is_err());
    }

    #[test]
    fn loads_deployments_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployments.json");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(load_deployments(&path).unwrap().len(), 2);
        assert!(load_deployments(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn nullifier_command_needs_its_own_binary() {
        let prover = Path::new("/usr/local/bin/mixer_cli");
        assert!(nullifier_config(None, None, false, prover).is_err());
        assert!(nullifier_config(Some("command"), Some("  "), false, prover).is_err());
        assert!(nullifier_config(None, Some("/usr/local/bin/mixer_cli"), false, prover).is_err());
        assert_eq!(
            nullifier_config(Some(" Command "), Some("/opt/nullifier"), false, prover).unwrap(),
            NullifierConfig::Command {
                bin: PathBuf::from("/opt/nullifier")
            }
        );
    }

    #[test]
    fn contract_nullifier_needs_remote_opt_in() {
        let prover = Path::new("/usr/local/bin/mixer_cli");
        assert!(nullifier_config(Some("contract"), None, false, prover).is_err());
        assert_eq!(
            nullifier_config(Some("contract"), None, true, prover).unwrap(),
            NullifierConfig::Contract
        );
        assert!(nullifier_config(Some("rpc"), None, true, prover).is_err());
    }
}
