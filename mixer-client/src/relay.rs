//! Relay submission and mined-transaction tracking.
//!
//! The relay is an external JSON-RPC signer: we hand it `{to, data, gas}` via
//! `eth_sendTransaction` and get a transaction hash back. Receipts are read
//! from the pool's chain client, not from the relay.

use crate::chain::{ChainClient, JsonRpcChainClient};
use crate::config::Deployment;
use crate::error::{MixerError, MixerResult, RelaySubmissionError};
use crate::watcher::{EventFilter, EventWatcher};
use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCall {
    pub to: Address,
    pub data: Bytes,
    pub gas_limit: u64,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send_transaction(&self, call: &RelayCall) -> Result<String, RelaySubmissionError>;
}

#[derive(Debug, Deserialize)]
struct RelayErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RelayErrorObject>,
}

pub struct HttpRelayTransport {
    http: reqwest::Client,
    endpoint: Url,
    next_id: AtomicU64,
}

impl HttpRelayTransport {
    pub fn new(endpoint: Url) -> MixerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MixerError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn request_body(&self, call: &RelayCall) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_sendTransaction",
            "params": [{
                "to": call.to,
                "data": call.data,
                "gas": format!("{:#x}", call.gas_limit),
            }],
        })
    }
}

/// Map a relay HTTP response onto a tx hash or a submission error.
pub(crate) fn interpret_relay_response(
    status: u16,
    body: &str,
) -> Result<String, RelaySubmissionError> {
    let parsed: Option<RelayResponse> = serde_json::from_str(body).ok();
    if let Some(err) = parsed.as_ref().and_then(|p| p.error.as_ref()) {
        return Err(RelaySubmissionError::Rejected {
            code: err.code,
            message: err.message.clone(),
        });
    }
    if !(200..300).contains(&status) {
        let snippet: String = body.chars().take(256).collect();
        return Err(RelaySubmissionError::Rejected {
            code: status as i64,
            message: format!("HTTP {status}: {snippet}"),
        });
    }
    let parsed = parsed
        .ok_or_else(|| RelaySubmissionError::Unreachable("relay returned a non-JSON body".into()))?;
    match parsed.result {
        Some(Value::String(hash)) if !hash.trim().is_empty() => Ok(hash.trim().to_string()),
        _ => Err(RelaySubmissionError::Unreachable(
            "relay response carries no transaction hash".into(),
        )),
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn send_transaction(&self, call: &RelayCall) -> Result<String, RelaySubmissionError> {
        let body = self.request_body(call);
        let resp = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| RelaySubmissionError::Unreachable(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| RelaySubmissionError::Unreachable(format!("read body: {e}")))?;
        interpret_relay_response(status, &text)
    }
}

/// Event that proves the intended effect happened even if our own tx reverted
/// (someone else's identical submission won the race).
#[derive(Debug, Clone)]
pub struct CompletionCheck {
    pub filter: EventFilter,
    pub from_block: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinedOutcome {
    pub succeeded: bool,
    pub block_number: u64,
}

pub struct RelayClient {
    transport: Arc<dyn RelayTransport>,
    watcher: Arc<EventWatcher>,
    target: Address,
    receipt_poll: Duration,
}

impl RelayClient {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        watcher: Arc<EventWatcher>,
        target: Address,
        receipt_poll: Duration,
    ) -> Self {
        Self {
            transport,
            watcher,
            target,
            receipt_poll,
        }
    }

    pub async fn submit(&self, data: Bytes, gas_limit: u64) -> Result<String, RelaySubmissionError> {
        let call = RelayCall {
            to: self.target,
            data,
            gas_limit,
        };
        let tx_hash = self.transport.send_transaction(&call).await?;
        info!(target_contract = %self.target, %tx_hash, gas_limit, "relay accepted transaction");
        Ok(tx_hash)
    }

    /// Poll for the receipt of `tx_hash`. A reverted receipt is rechecked once
    /// against `completion` before it is reported as a failure.
    pub async fn watch_mined<F>(
        &self,
        tx_hash: &str,
        completion: Option<&CompletionCheck>,
        keep_watching: F,
    ) -> MixerResult<MinedOutcome>
    where
        F: Fn() -> bool,
    {
        let chain = self.watcher.chain();
        loop {
            if !keep_watching() {
                return Err(MixerError::Cancelled);
            }
            match chain.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.succeeded => {
                    return Ok(MinedOutcome {
                        succeeded: true,
                        block_number: receipt.block_number,
                    });
                }
                Ok(Some(receipt)) => {
                    let Some(check) = completion else {
                        return Ok(MinedOutcome {
                            succeeded: false,
                            block_number: receipt.block_number,
                        });
                    };
                    match self.watcher.scan_once(&check.filter, check.from_block).await {
                        Ok(ev) => {
                            info!(%tx_hash, block = ev.block_number, "tx reverted but completion event present");
                            return Ok(MinedOutcome {
                                succeeded: true,
                                block_number: ev.block_number,
                            });
                        }
                        Err(MixerError::NotFound) => {
                            return Ok(MinedOutcome {
                                succeeded: false,
                                block_number: receipt.block_number,
                            });
                        }
                        Err(e) if e.is_transient() => {
                            warn!(%tx_hash, "completion recheck failed, retrying: {e}");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    crate::metrics::inc_chain_poll_errors();
                    warn!(%tx_hash, "receipt poll failed, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.receipt_poll).await;
        }
    }
}

/// Everything the orchestrator needs to talk to one deployment.
pub struct PoolHandle {
    pub pool_id: String,
    pub deployment: Deployment,
    pub chain: Arc<dyn ChainClient>,
    pub watcher: Arc<EventWatcher>,
    pub relay: RelayClient,
}

pub trait PoolConnector: Send + Sync {
    fn connect(&self, pool_id: &str, deployment: &Deployment) -> MixerResult<PoolHandle>;
}

/// Builds JSON-RPC backed pool handles.
pub struct HttpPoolConnector {
    pub poll_interval: Duration,
    pub receipt_poll_interval: Duration,
}

impl PoolConnector for HttpPoolConnector {
    fn connect(&self, pool_id: &str, deployment: &Deployment) -> MixerResult<PoolHandle> {
        let chain: Arc<dyn ChainClient> = Arc::new(JsonRpcChainClient::new(
            deployment.rpc_url.clone(),
            deployment.contract_address,
        ));
        let watcher = Arc::new(EventWatcher::new(chain.clone(), self.poll_interval));
        let transport = Arc::new(HttpRelayTransport::new(deployment.relayer_endpoint.clone())?);
        let relay = RelayClient::new(
            transport,
            watcher.clone(),
            deployment.contract_address,
            self.receipt_poll_interval,
        );
        Ok(PoolHandle {
            pool_id: pool_id.to_string(),
            deployment: deployment.clone(),
            chain,
            watcher,
            relay,
        })
    }
}

/// Pool id -> connected handle, created once and reused.
pub struct PoolRegistry {
    deployments: HashMap<String, Deployment>,
    connector: Arc<dyn PoolConnector>,
    pools: Mutex<HashMap<String, Arc<PoolHandle>>>,
}

impl PoolRegistry {
    pub fn new(deployments: HashMap<String, Deployment>, connector: Arc<dyn PoolConnector>) -> Self {
        Self {
            deployments,
            connector,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn deployment(&self, pool_id: &str) -> MixerResult<&Deployment> {
        self.deployments
            .get(pool_id)
            .ok_or_else(|| MixerError::Configuration(format!("unknown pool: {pool_id}")))
    }

    pub fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.deployments.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, pool_id: &str) -> MixerResult<Arc<PoolHandle>> {
        let deployment = self.deployment(pool_id)?;
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| MixerError::Store("pool registry lock poisoned".into()))?;
        if let Some(h) = pools.get(pool_id) {
            return Ok(h.clone());
        }
        let handle = Arc::new(self.connector.connect(pool_id, deployment)?);
        pools.insert(pool_id.to_string(), handle.clone());
        info!(pool = pool_id, chain_id = deployment.chain_id, "pool connected");
        Ok(handle)
    }
}
