//! In-memory doubles for the chain, relay, prover and pool wiring.

use crate::chain::{ChainClient, ChainEvent, EventKind, TxReceipt};
use crate::config::Deployment;
use crate::error::{MixerError, MixerResult, RelaySubmissionError};
use crate::hasher::local_leaf_hash;
use crate::prover::{Proof, ProofRequest, ProofService};
use crate::relay::{PoolConnector, PoolHandle, RelayCall, RelayClient, RelayTransport};
use crate::watcher::EventWatcher;
use alloy::primitives::{address, Address, U256};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const TEST_DEPTH: usize = 4;

pub fn sample_deployment() -> Deployment {
    Deployment {
        rpc_url: Url::parse("http://127.0.0.1:8545").unwrap(),
        contract_address: address!("00000000000000000000000000000000000000cc"),
        relayer_endpoint: Url::parse("http://127.0.0.1:9000").unwrap(),
        chain_id: 3,
        start_block: 90,
        commit_phase: false,
    }
}

pub struct FakeChain {
    height: AtomicU64,
    advance: AtomicU64,
    fail_polls: AtomicU64,
    events: Mutex<Vec<ChainEvent>>,
    receipts: Mutex<HashMap<String, TxReceipt>>,
    ranges: Mutex<Vec<(u64, u64)>>,
    pub root: U256,
}

impl FakeChain {
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            advance: AtomicU64::new(0),
            fail_polls: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            ranges: Mutex::new(Vec::new()),
            root: U256::from(999u64),
        }
    }

    pub fn fake_nullifier(secret: &U256) -> U256 {
        *secret * U256::from(3u64) + U256::from(1u64)
    }

    pub fn set_height(&self, h: u64) {
        self.height.store(h, Ordering::SeqCst);
    }

    pub fn advance_per_poll(&self, n: u64) {
        self.advance.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_polls(&self, n: u64) {
        self.fail_polls.store(n, Ordering::SeqCst);
    }

    pub fn push_leaf(&self, block: u64, leaf: U256, index: u64) {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("_leaf", leaf);
        fields.insert("_leafIndex", U256::from(index));
        self.events.lock().unwrap().push(ChainEvent {
            kind: EventKind::LeafAdded,
            block_number: block,
            tx_hash: None,
            fields,
        });
    }

    pub fn push_withdrawn(&self, block: u64, nullifier: U256) {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("_nullifier", nullifier);
        self.events.lock().unwrap().push(ChainEvent {
            kind: EventKind::DepositWithdrawn,
            block_number: block,
            tx_hash: None,
            fields,
        });
    }

    pub fn set_receipt(&self, tx: &str, r: TxReceipt) {
        self.receipts.lock().unwrap().insert(tx.to_string(), r);
    }

    pub fn log_ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn block_number(&self) -> MixerResult<u64> {
        let pending = self.fail_polls.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_polls.store(pending - 1, Ordering::SeqCst);
            return Err(MixerError::ChainQuery("connection reset".into()));
        }
        let adv = self.advance.load(Ordering::SeqCst);
        Ok(self.height.fetch_add(adv, Ordering::SeqCst))
    }

    async fn get_root(&self) -> MixerResult<U256> {
        Ok(self.root)
    }

    async fn get_merkle_path(&self, _leaf_index: &U256) -> MixerResult<Vec<U256>> {
        Ok((0..TEST_DEPTH as u64).map(U256::from).collect())
    }

    async fn make_nullifier_hash(&self, secret: &U256) -> MixerResult<U256> {
        Ok(Self::fake_nullifier(secret))
    }

    async fn make_leaf_hash(&self, secret: &U256, destination: &Address) -> MixerResult<U256> {
        Ok(local_leaf_hash(secret, destination))
    }

    async fn get_logs(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> MixerResult<Vec<ChainEvent>> {
        self.ranges.lock().unwrap().push((from_block, to_block));
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind && e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> MixerResult<Option<TxReceipt>> {
        Ok(self.receipts.lock().unwrap().get(tx_hash).copied())
    }
}

/// Relay double: scripted responses (default `0xaa`), optional auto-mining.
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<VecDeque<Result<String, RelaySubmissionError>>>,
    calls: Mutex<Vec<RelayCall>>,
    mine: Mutex<Option<(Arc<FakeChain>, TxReceipt)>>,
}

impl FakeTransport {
    pub fn push_response(&self, r: Result<String, RelaySubmissionError>) {
        self.responses.lock().unwrap().push_back(r);
    }

    /// Every accepted transaction gets `receipt` on `chain`.
    pub fn mine_on(&self, chain: Arc<FakeChain>, receipt: TxReceipt) {
        *self.mine.lock().unwrap() = Some((chain, receipt));
    }

    pub fn calls(&self) -> Vec<RelayCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayTransport for FakeTransport {
    async fn send_transaction(&self, call: &RelayCall) -> Result<String, RelaySubmissionError> {
        self.calls.lock().unwrap().push(call.clone());
        let r = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("0xaa".to_string()));
        if let (Ok(hash), Some((chain, receipt))) = (&r, self.mine.lock().unwrap().as_ref()) {
            chain.set_receipt(hash, *receipt);
        }
        r
    }
}

#[derive(Default)]
pub struct FakeProver {
    pub fail: AtomicBool,
    pub delay_ms: AtomicU64,
    requests: Mutex<Vec<ProofRequest>>,
}

impl FakeProver {
    pub fn requests(&self) -> Vec<ProofRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProofService for FakeProver {
    async fn build_proof(&self, req: ProofRequest) -> MixerResult<Proof> {
        self.requests.lock().unwrap().push(req);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(MixerError::ProofGeneration("constraint not satisfied".into()));
        }
        Ok(Proof(std::array::from_fn(|i| U256::from(i as u64 + 1))))
    }
}

pub struct FakeConnector {
    pub chain: Arc<FakeChain>,
    pub transport: Arc<FakeTransport>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(chain: Arc<FakeChain>) -> Self {
        Self {
            chain,
            transport: Arc::new(FakeTransport::default()),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl PoolConnector for FakeConnector {
    fn connect(&self, pool_id: &str, deployment: &Deployment) -> MixerResult<PoolHandle> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let chain: Arc<dyn ChainClient> = self.chain.clone();
        let watcher = Arc::new(EventWatcher::new(chain.clone(), Duration::from_millis(1)));
        let relay = RelayClient::new(
            self.transport.clone(),
            watcher.clone(),
            deployment.contract_address,
            Duration::from_millis(1),
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
