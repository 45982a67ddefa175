use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::orchestrator::LifecycleState;
use crate::state::AppState;

#[derive(Debug, Clone, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ActionLabel {
    pub action: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct RelayLabel {
    pub phase: &'static str,   // "commit" | "withdraw"
    pub outcome: &'static str, // "accepted" | "failed"
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct StateLabel {
    pub state: &'static str,
}

pub struct Metrics {
    registry: Registry,
    pub commitments: Family<StateLabel, Gauge<i64>>,
    pub tasks_in_flight: Gauge<i64>,
    pub actions_total: Family<ActionLabel, Counter>,
    pub coalesced_triggers_total: Counter,
    pub chain_poll_errors_total: Counter,
    pub relay_submissions_total: Family<RelayLabel, Counter>,
    pub proof_failures_total: Counter,
    pub proof_ms: Histogram,
    pub proof_last_ms: Gauge<i64>,
}

fn buckets_ms() -> Vec<f64> {
    vec![
        100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10_000.0, 20_000.0, 45_000.0, 90_000.0,
        180_000.0, 300_000.0,
    ]
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let mut registry = Registry::default();

        let commitments: Family<StateLabel, Gauge<i64>> = Family::default();
        registry.register(
            "mixer_commitments",
            "Commitments by lifecycle state",
            commitments.clone(),
        );
        let tasks_in_flight = Gauge::<i64>::default();
        registry.register(
            "mixer_tasks_in_flight",
            "Commitments with a running lifecycle task",
            tasks_in_flight.clone(),
        );

        let actions_total: Family<ActionLabel, Counter> = Family::default();
        registry.register(
            "mixer_actions_total",
            "Lifecycle actions dispatched",
            actions_total.clone(),
        );
        let coalesced_triggers_total = Counter::default();
        registry.register(
            "mixer_coalesced_triggers_total",
            "Triggers folded into an already running task",
            coalesced_triggers_total.clone(),
        );
        let chain_poll_errors_total = Counter::default();
        registry.register(
            "mixer_chain_poll_errors_total",
            "Transient chain errors swallowed by polling loops",
            chain_poll_errors_total.clone(),
        );
        let relay_submissions_total: Family<RelayLabel, Counter> = Family::default();
        registry.register(
            "mixer_relay_submissions_total",
            "Relay submissions by phase and outcome",
            relay_submissions_total.clone(),
        );
        let proof_failures_total = Counter::default();
        registry.register(
            "mixer_proof_failures_total",
            "Withdrawal attempts abandoned because the proof could not be built",
            proof_failures_total.clone(),
        );

        let proof_ms = Histogram::new(buckets_ms().into_iter());
        registry.register(
            "mixer_proof_ms",
            "Withdrawal proof generation time (ms)",
            proof_ms.clone(),
        );
        let proof_last_ms = Gauge::<i64>::default();
        registry.register(
            "mixer_proof_last_ms",
            "Last observed proof generation time (ms)",
            proof_last_ms.clone(),
        );

        Metrics {
            registry,
            commitments,
            tasks_in_flight,
            actions_total,
            coalesced_triggers_total,
            chain_poll_errors_total,
            relay_submissions_total,
            proof_failures_total,
            proof_ms,
            proof_last_ms,
        }
    })
}

pub fn inc_action(action: &'static str) {
    metrics()
        .actions_total
        .get_or_create(&ActionLabel { action })
        .inc();
}

pub fn inc_coalesced_triggers() {
    metrics().coalesced_triggers_total.inc();
}

pub fn inc_chain_poll_errors() {
    metrics().chain_poll_errors_total.inc();
}

pub fn inc_relay_submission(phase: &'static str, outcome: &'static str) {
    metrics()
        .relay_submissions_total
        .get_or_create(&RelayLabel { phase, outcome })
        .inc();
}

pub fn inc_proof_failures() {
    metrics().proof_failures_total.inc();
}

pub fn observe_proof_ms(ms: u64) {
    let m = metrics();
    m.proof_ms.observe(ms as f64);
    m.proof_last_ms.set(ms as i64);
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Gauges are recomputed from the store on every scrape.
    let mut by_state: HashMap<LifecycleState, i64> = HashMap::new();
    for c in state.orchestrator.store().list() {
        *by_state.entry(state.orchestrator.state_of(&c)).or_default() += 1;
    }
    let m = metrics();
    for s in LifecycleState::ALL {
        m.commitments
            .get_or_create(&StateLabel { state: s.as_str() })
            .set(by_state.get(&s).copied().unwrap_or(0));
    }
    m.tasks_in_flight.set(state.orchestrator.in_flight() as i64);

    let mut out = String::new();
    if let Err(e) = encode(&mut out, &m.registry) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode metrics failed: {e}"),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
        .into_response()
}
