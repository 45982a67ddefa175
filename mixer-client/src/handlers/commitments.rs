use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::types::{CommitmentView, CreateCommitmentRequest};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json as AxumJson;
use std::sync::Arc;

fn ensure_accepting(state: &AppState) -> AppResult<()> {
    if state.is_accepting() {
        Ok(())
    } else {
        Err(AppError::Conflict("shutting down".into()))
    }
}

pub async fn create_commitment(
    State(state): State<Arc<AppState>>,
    AxumJson(req): AxumJson<CreateCommitmentRequest>,
) -> AppResult<(StatusCode, AxumJson<CommitmentView>)> {
    ensure_accepting(&state)?;
    let (destination, origin) = req.validate()?;
    let c = state
        .orchestrator
        .create_commitment(req.pool_id.trim(), destination, origin)
        .await?;
    Ok((StatusCode::CREATED, AxumJson(state.orchestrator.view(&c))))
}

pub async fn list_commitments(
    State(state): State<Arc<AppState>>,
) -> AppResult<AxumJson<Vec<CommitmentView>>> {
    let o = &state.orchestrator;
    Ok(AxumJson(o.store().list().iter().map(|c| o.view(c)).collect()))
}

pub async fn get_commitment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<CommitmentView>> {
    let c = state
        .orchestrator
        .store()
        .get(&id)
        .ok_or_else(|| AppError::NotFound("unknown commitment id".into()))?;
    Ok(AxumJson(state.orchestrator.view(&c)))
}

pub async fn request_withdrawal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<CommitmentView>> {
    ensure_accepting(&state)?;
    let c = state.orchestrator.request_withdrawal(&id).await?;
    Ok(AxumJson(state.orchestrator.view(&c)))
}

pub async fn request_commit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<CommitmentView>> {
    ensure_accepting(&state)?;
    let c = state.orchestrator.request_commit(&id).await?;
    Ok(AxumJson(state.orchestrator.view(&c)))
}
