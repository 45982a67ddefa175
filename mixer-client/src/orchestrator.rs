//! Commitment lifecycle state machine.
//!
//! Every commitment is driven by at most one task at a time. The task derives
//! the current state from persisted fields, runs the single action that state
//! calls for, writes the result back, and re-evaluates until there is nothing
//! left to do. Nothing is cached between steps, so a restart resumes from the
//! store alone.

use crate::chain::EventKind;
use crate::constants::{COMMIT_GAS_LIMIT, WITHDRAW_GAS_LIMIT};
use crate::contract::Mixer;
use crate::error::{MixerError, MixerResult};
use crate::hasher::CommitmentHasher;
use crate::metrics;
use crate::prover::{Proof, ProofRequest, ProofService};
use crate::relay::{CompletionCheck, PoolHandle, PoolRegistry};
use crate::store::{CommitmentStore, StoreEvent};
use crate::types::{Commitment, CommitmentId, CommitmentView};
use crate::utils::now_ms;
use crate::watcher::{EventFilter, ScanBatch};
use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    AwaitingCommit,
    AwaitingCommitRequest,
    AwaitingFunding,
    AwaitingWithdrawRequest,
    Withdrawing,
    Done,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::AwaitingCommit,
        LifecycleState::AwaitingCommitRequest,
        LifecycleState::AwaitingFunding,
        LifecycleState::AwaitingWithdrawRequest,
        LifecycleState::Withdrawing,
        LifecycleState::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::AwaitingCommit => "awaiting_commit",
            LifecycleState::AwaitingCommitRequest => "awaiting_commit_request",
            LifecycleState::AwaitingFunding => "awaiting_funding",
            LifecycleState::AwaitingWithdrawRequest => "awaiting_withdraw_request",
            LifecycleState::Withdrawing => "withdrawing",
            LifecycleState::Done => "done",
        }
    }

    pub fn action(self) -> Option<Action> {
        match self {
            LifecycleState::AwaitingCommit => Some(Action::Commit),
            LifecycleState::AwaitingFunding => Some(Action::WatchFundingEvent),
            LifecycleState::AwaitingWithdrawRequest => Some(Action::WatchSubsequentFundingEvents),
            LifecycleState::Withdrawing => Some(Action::Withdraw),
            LifecycleState::AwaitingCommitRequest | LifecycleState::Done => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Commit,
    WatchFundingEvent,
    WatchSubsequentFundingEvents,
    Withdraw,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Commit => "commit",
            Action::WatchFundingEvent => "watch_funding",
            Action::WatchSubsequentFundingEvents => "watch_subsequent_funding",
            Action::Withdraw => "withdraw",
        }
    }
}

pub fn derive_state(c: &Commitment, commit_phase: bool) -> LifecycleState {
    if c.withdraw_confirmed_ts_ms.is_some() {
        return LifecycleState::Done;
    }
    if commit_phase && c.commit_block_number.is_none() && !c.is_funded() {
        return if c.commit_requested {
            LifecycleState::AwaitingCommit
        } else {
            LifecycleState::AwaitingCommitRequest
        };
    }
    if !c.is_funded() {
        return LifecycleState::AwaitingFunding;
    }
    if c.withdraw_requested {
        LifecycleState::Withdrawing
    } else {
        LifecycleState::AwaitingWithdrawRequest
    }
}

/// What a trigger did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Spawned,
    /// A task was already running; it will re-evaluate before exiting.
    Coalesced,
    /// Nothing to do in the current state.
    Idle,
}

enum Step {
    Continue,
    Idle,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Back-off before re-running a step that failed on a transient chain error.
    pub retry_delay: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(crate::constants::DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

pub struct Orchestrator {
    store: Arc<CommitmentStore>,
    pools: Arc<PoolRegistry>,
    prover: Arc<dyn ProofService>,
    hasher: Arc<CommitmentHasher>,
    settings: OrchestratorSettings,
    /// id -> "re-evaluate once more" mark.
    in_flight: Mutex<HashMap<CommitmentId, bool>>,
    tasks_spawned: AtomicU64,
    shutdown: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<CommitmentStore>,
        pools: Arc<PoolRegistry>,
        prover: Arc<dyn ProofService>,
        hasher: Arc<CommitmentHasher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            pools,
            prover,
            hasher,
            settings,
            in_flight: Mutex::new(HashMap::new()),
            tasks_spawned: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<CommitmentStore> {
        &self.store
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop all watches at their next poll; running tasks exit after their current step.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn tasks_spawned(&self) -> u64 {
        self.tasks_spawned.load(Ordering::Relaxed)
    }

    fn commit_phase(&self, pool_id: &str) -> bool {
        self.pools
            .deployment(pool_id)
            .map(|d| d.commit_phase)
            .unwrap_or(false)
    }

    pub fn state_of(&self, c: &Commitment) -> LifecycleState {
        derive_state(c, self.commit_phase(&c.pool_id))
    }

    pub fn view(&self, c: &Commitment) -> CommitmentView {
        CommitmentView::new(c, self.state_of(c).as_str())
    }

    /// Resume every persisted commitment (newest first) and follow the store
    /// for new ones.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.store.subscribe();
        let existing = self.store.list();
        info!(commitments = existing.len(), "orchestrator starting");
        for c in &existing {
            self.on_commitment_created(&c.id);
        }
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(StoreEvent::Created(id)) => {
                        this.on_commitment_created(&id);
                    }
                    Ok(StoreEvent::Updated(_)) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "store events lagged; re-evaluating all commitments");
                        for c in this.store.list() {
                            this.on_commitment_created(&c.id);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
                if this.is_shutdown() {
                    break;
                }
            }
        })
    }

    pub fn on_commitment_created(self: &Arc<Self>, id: &str) -> Dispatch {
        self.trigger(id)
    }

    fn trigger(self: &Arc<Self>, id: &str) -> Dispatch {
        if self.is_shutdown() {
            return Dispatch::Idle;
        }
        let Some(c) = self.store.get(id) else {
            warn!(commitment = id, "trigger for unknown commitment");
            return Dispatch::Idle;
        };
        {
            let Ok(mut g) = self.in_flight.lock() else {
                return Dispatch::Idle;
            };
            if let Some(dirty) = g.get_mut(id) {
                *dirty = true;
                metrics::inc_coalesced_triggers();
                return Dispatch::Coalesced;
            }
            if self.state_of(&c).action().is_none() {
                return Dispatch::Idle;
            }
            g.insert(id.to_string(), false);
        }
        self.tasks_spawned.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move { this.drive(id).await });
        Dispatch::Spawned
    }

    async fn drive(self: Arc<Self>, id: CommitmentId) {
        loop {
            if !self.is_shutdown() {
                match self.step(&id).await {
                    Ok(Step::Continue) => continue,
                    Ok(Step::Idle) => {}
                    Err(MixerError::Cancelled) => {
                        debug!(commitment = %id, "watch cancelled");
                    }
                    Err(e) if e.is_transient() => {
                        warn!(commitment = %id, "step failed, retrying: {e}");
                        tokio::time::sleep(self.settings.retry_delay).await;
                        continue;
                    }
                    Err(e) => {
                        error!(commitment = %id, "step failed: {e}");
                        let msg = e.to_string();
                        let _ = self
                            .store
                            .update(&id, |r| r.last_error = Some(msg))
                            .await;
                    }
                }
            }
            let again = match self.in_flight.lock() {
                Ok(mut g) => match g.get_mut(&id) {
                    Some(dirty) if *dirty && !self.is_shutdown() => {
                        *dirty = false;
                        true
                    }
                    _ => {
                        g.remove(&id);
                        false
                    }
                },
                Err(_) => false,
            };
            if !again {
                break;
            }
        }
    }

    async fn step(&self, id: &str) -> MixerResult<Step> {
        let c = self
            .store
            .get(id)
            .ok_or_else(|| MixerError::UnknownCommitment(id.to_string()))?;
        let pool = self.pools.get(&c.pool_id)?;
        let state = derive_state(&c, pool.deployment.commit_phase);
        let Some(action) = state.action() else {
            return Ok(Step::Idle);
        };
        metrics::inc_action(action.as_str());
        debug!(commitment = %c.id, pool = %c.pool_id, state = state.as_str(), action = action.as_str(), "dispatch");
        match action {
            Action::Commit => self.commit(&c, &pool).await?,
            Action::WatchFundingEvent => self.watch_funding(&c, &pool).await?,
            Action::WatchSubsequentFundingEvents => self.watch_subsequent(&c, &pool).await?,
            Action::Withdraw => self.withdraw(&c, &pool).await?,
        }
        Ok(Step::Continue)
    }

    async fn commit(&self, c: &Commitment, pool: &PoolHandle) -> MixerResult<()> {
        let tx_hash = match c.commit_tx_hash.clone() {
            Some(h) => {
                info!(commitment = %c.id, tx = %h, "resuming commit confirmation");
                h
            }
            None => {
                let funder = c.origin.ok_or_else(|| {
                    MixerError::InvalidState(format!("{}: commit needs an origin address", c.id))
                })?;
                let leaf = self
                    .hasher
                    .leaf_hash(&c.secret, &c.destination, pool.chain.as_ref())
                    .await?;
                let data = Mixer::commitCall {
                    leaf,
                    fundedBy: funder,
                }
                .abi_encode();
                match pool.relay.submit(data.into(), COMMIT_GAS_LIMIT).await {
                    Ok(h) => {
                        metrics::inc_relay_submission("commit", "accepted");
                        let hc = h.clone();
                        self.store
                            .update(&c.id, |r| r.commit_tx_hash = Some(hc))
                            .await?;
                        h
                    }
                    Err(e) => {
                        metrics::inc_relay_submission("commit", "failed");
                        error!(commitment = %c.id, pool = %c.pool_id, "commit relay failed: {e}");
                        let msg = e.to_string();
                        self.store
                            .update(&c.id, |r| {
                                r.commit_requested = false;
                                r.commit_relay_failed = true;
                                r.last_error = Some(msg);
                            })
                            .await?;
                        return Ok(());
                    }
                }
            }
        };

        let outcome = pool
            .relay
            .watch_mined(&tx_hash, None, || !self.is_shutdown())
            .await?;
        info!(commitment = %c.id, tx = %tx_hash, succeeded = outcome.succeeded, block = outcome.block_number, "commit mined");
        self.store
            .update(&c.id, |r| {
                r.commit_requested = false;
                r.commit_succeeded = Some(outcome.succeeded);
                if outcome.succeeded {
                    r.commit_block_number = Some(outcome.block_number);
                } else {
                    r.last_error = Some(format!("commit transaction {tx_hash} reverted"));
                }
            })
            .await?;
        Ok(())
    }

    async fn watch_funding(&self, c: &Commitment, pool: &PoolHandle) -> MixerResult<()> {
        let leaf = self
            .hasher
            .leaf_hash(&c.secret, &c.destination, pool.chain.as_ref())
            .await?;
        let from = c.commit_block_number.unwrap_or(pool.deployment.start_block);
        let filter = EventFilter::new(EventKind::LeafAdded).field_eq("_leaf", leaf);
        debug!(commitment = %c.id, from, "watching for funding event");
        let ev = pool
            .watcher
            .watch_once(&filter, from, || !self.is_shutdown())
            .await?;
        let index = ev
            .field("_leafIndex")
            .copied()
            .ok_or_else(|| MixerError::UnexpectedData("LeafAdded without _leafIndex".into()))?;
        info!(commitment = %c.id, pool = %c.pool_id, block = ev.block_number, leaf_index = %index, "commitment funded");
        self.store
            .update(&c.id, |r| {
                if r.leaf_index.is_none() {
                    r.leaf_index = Some(index.to_string());
                    r.funding_block_number = Some(ev.block_number);
                }
            })
            .await?;
        Ok(())
    }

    async fn watch_subsequent(&self, c: &Commitment, pool: &PoolHandle) -> MixerResult<()> {
        let from = c
            .last_scanned_block
            .or(c.funding_block_number)
            .map(|b| b + 1)
            .ok_or_else(|| MixerError::InvalidState(format!("{}: not funded", c.id)))?;
        let filter = EventFilter::new(EventKind::LeafAdded);
        let store = self.store.clone();
        let id = c.id.clone();
        let keep_watching = || {
            !self.is_shutdown()
                && store
                    .get(&id)
                    .map(|r| !r.withdraw_requested && r.withdraw_confirmed_ts_ms.is_none())
                    .unwrap_or(false)
        };
        let on_batch = |batch: ScanBatch| {
            let store = store.clone();
            let id = id.clone();
            async move {
                let n = batch.events.len() as u64;
                let hi = batch.to_block;
                store
                    .update(&id, |r| {
                        r.subsequent_deposit_count += n;
                        r.last_scanned_block = Some(r.last_scanned_block.map_or(hi, |b| b.max(hi)));
                    })
                    .await?;
                debug!(commitment = %id, new_deposits = n, through = hi, "anonymity set grew");
                Ok::<(), MixerError>(())
            }
        };
        pool.watcher
            .watch_while(&filter, from, keep_watching, on_batch)
            .await?;
        Ok(())
    }

    async fn withdraw(&self, c: &Commitment, pool: &PoolHandle) -> MixerResult<()> {
        // Fresh read: a retry or another step may have moved the record.
        let c = self
            .store
            .get(&c.id)
            .ok_or_else(|| MixerError::UnknownCommitment(c.id.clone()))?;
        if derive_state(&c, pool.deployment.commit_phase) != LifecycleState::Withdrawing {
            return Ok(());
        }
        let funding_block = c
            .funding_block_number
            .ok_or_else(|| MixerError::InvalidState(format!("{}: not funded", c.id)))?;
        let leaf_index = c
            .leaf_index_value()
            .ok_or_else(|| MixerError::InvalidState(format!("{}: bad leaf index", c.id)))?;

        let nullifier = match self.hasher.nullifier_hash(&c.secret, pool.chain.as_ref()).await {
            Ok(n) => n,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.record_proof_failure(&c, e).await,
        };
        let completion = CompletionCheck {
            filter: EventFilter::new(EventKind::DepositWithdrawn)
                .field_eq("_nullifier", nullifier),
            from_block: funding_block,
        };

        if let Some(tx_hash) = c.withdraw_tx_hash.clone() {
            info!(commitment = %c.id, tx = %tx_hash, "resuming withdrawal confirmation");
            return self.confirm_withdrawal(&c, pool, &tx_hash, &completion).await;
        }

        // The relay may have accepted an earlier attempt whose hash never got persisted.
        match pool.watcher.scan_once(&completion.filter, funding_block).await {
            Ok(ev) => {
                warn!(commitment = %c.id, block = ev.block_number, "nullifier already spent on-chain; recording withdrawal");
                self.store
                    .update(&c.id, |r| {
                        r.withdraw_requested = false;
                        r.withdraw_confirmed_ts_ms = Some(now_ms());
                        r.withdraw_succeeded = Some(true);
                        r.withdraw_block_number = Some(ev.block_number);
                        r.withdraw_tx_hash = r.withdraw_tx_hash.take().or(ev.tx_hash.clone());
                        r.last_error = None;
                    })
                    .await?;
                return Ok(());
            }
            Err(MixerError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let root = pool.chain.get_root().await?;
        let merkle_path = pool.chain.get_merkle_path(&leaf_index).await?;

        let started = Instant::now();
        let proof = match self
            .prover
            .build_proof(ProofRequest {
                root,
                destination: c.destination,
                nullifier,
                secret: c.secret,
                leaf_index,
                merkle_path,
            })
            .await
        {
            Ok(p) => p,
            Err(e) => return self.record_proof_failure(&c, e).await,
        };
        metrics::observe_proof_ms(started.elapsed().as_millis() as u64);
        self.store
            .update(&c.id, |r| r.proof_computed = true)
            .await?;

        let data = withdraw_calldata(c.destination, nullifier, proof);
        let tx_hash = match pool.relay.submit(data, WITHDRAW_GAS_LIMIT).await {
            Ok(h) => h,
            Err(e) => {
                metrics::inc_relay_submission("withdraw", "failed");
                error!(commitment = %c.id, pool = %c.pool_id, "withdraw relay failed: {e}");
                let msg = e.to_string();
                self.store
                    .update(&c.id, |r| {
                        r.withdraw_requested = false;
                        r.withdraw_relay_failed = true;
                        r.last_error = Some(msg);
                    })
                    .await?;
                return Ok(());
            }
        };
        metrics::inc_relay_submission("withdraw", "accepted");
        let hc = tx_hash.clone();
        self.store
            .update(&c.id, |r| r.withdraw_tx_hash = Some(hc))
            .await?;

        self.confirm_withdrawal(&c, pool, &tx_hash, &completion).await
    }

    async fn confirm_withdrawal(
        &self,
        c: &Commitment,
        pool: &PoolHandle,
        tx_hash: &str,
        completion: &CompletionCheck,
    ) -> MixerResult<()> {
        let outcome = pool
            .relay
            .watch_mined(tx_hash, Some(completion), || !self.is_shutdown())
            .await?;
        info!(commitment = %c.id, pool = %c.pool_id, tx = %tx_hash, succeeded = outcome.succeeded, block = outcome.block_number, "withdrawal mined");
        self.store
            .update(&c.id, |r| {
                r.withdraw_requested = false;
                r.withdraw_confirmed_ts_ms = Some(now_ms());
                r.withdraw_succeeded = Some(outcome.succeeded);
                r.withdraw_block_number = Some(outcome.block_number);
                r.last_error = if outcome.succeeded {
                    None
                } else {
                    Some(format!("withdrawal transaction {tx_hash} reverted"))
                };
            })
            .await?;
        Ok(())
    }

    async fn record_proof_failure(&self, c: &Commitment, e: MixerError) -> MixerResult<()> {
        metrics::inc_proof_failures();
        error!(commitment = %c.id, pool = %c.pool_id, "proof generation failed: {e}");
        let msg = e.to_string();
        self.store
            .update(&c.id, |r| {
                r.withdraw_requested = false;
                r.withdraw_proof_failed = true;
                r.last_error = Some(msg);
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // User entry points
    // -----------------------------------------------------------------

    pub async fn create_commitment(
        self: &Arc<Self>,
        pool_id: &str,
        destination: Address,
        origin: Option<Address>,
    ) -> MixerResult<Commitment> {
        self.pools.deployment(pool_id)?;
        let c = Commitment::new(pool_id, destination, origin);
        self.store.insert(c.clone()).await?;
        info!(commitment = %c.id, pool = pool_id, "commitment created");
        Ok(c)
    }

    /// Only a successful withdrawal is final: a confirmed but reverted one
    /// may be requested again as a fresh attempt.
    pub async fn request_withdrawal(self: &Arc<Self>, id: &str) -> MixerResult<Commitment> {
        let mut underway = false;
        let updated = self
            .store
            .try_update(id, |r| {
                if r.withdraw_confirmed_ts_ms.is_some() && r.withdraw_succeeded == Some(true) {
                    return Err(MixerError::InvalidState(format!("{id} is already withdrawn")));
                }
                if r.withdraw_requested && r.withdraw_confirmed_ts_ms.is_none() {
                    // A second request must not reset a submitted attempt.
                    underway = true;
                    return Ok(());
                }
                r.withdraw_requested = true;
                r.withdraw_tx_hash = None;
                r.withdraw_confirmed_ts_ms = None;
                r.withdraw_succeeded = None;
                r.withdraw_block_number = None;
                r.withdraw_relay_failed = false;
                r.withdraw_proof_failed = false;
                r.proof_computed = false;
                r.last_error = None;
                Ok(())
            })
            .await?;
        if !underway {
            info!(commitment = id, pool = %updated.pool_id, "withdrawal requested");
        }
        self.trigger(id);
        Ok(updated)
    }

    pub async fn request_commit(self: &Arc<Self>, id: &str) -> MixerResult<Commitment> {
        let mut underway = false;
        let updated = self
            .store
            .try_update(id, |r| {
                if !self.pools.deployment(&r.pool_id)?.commit_phase {
                    return Err(MixerError::InvalidState(format!(
                        "pool {} has no commit phase",
                        r.pool_id
                    )));
                }
                if r.commit_block_number.is_some() {
                    return Err(MixerError::InvalidState(format!("{id} is already committed")));
                }
                if r.origin.is_none() {
                    return Err(MixerError::InvalidState(format!(
                        "{id} has no origin address to commit from"
                    )));
                }
                if r.commit_requested && r.commit_tx_hash.is_some() {
                    underway = true;
                    return Ok(());
                }
                r.commit_requested = true;
                r.commit_tx_hash = None;
                r.commit_succeeded = None;
                r.commit_relay_failed = false;
                r.last_error = None;
                Ok(())
            })
            .await?;
        if !underway {
            info!(commitment = id, pool = %updated.pool_id, "commit requested");
        }
        self.trigger(id);
        Ok(updated)
    }
}

fn withdraw_calldata(destination: Address, nullifier: U256, proof: Proof) -> Bytes {
    Mixer::withdrawCall {
        withdrawTo: destination,
        nullifier,
        proof: proof.0,
    }
    .abi_encode()
    .into()
}
