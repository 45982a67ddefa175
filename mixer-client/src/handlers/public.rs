use crate::error::AppResult;
use crate::state::AppState;
use axum::extract::State;
use axum::Json as AxumJson;
use std::sync::Arc;

pub async fn health(State(state): State<Arc<AppState>>) -> AppResult<AxumJson<serde_json::Value>> {
    let o = &state.orchestrator;
    Ok(AxumJson(serde_json::json!({
        "ok": state.is_accepting(),
        "pools": o.pools().pool_ids(),
        "commitments": o.store().len(),
        "in_flight": o.in_flight(),
    })))
}
