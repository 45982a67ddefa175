use crate::auth;
use crate::handlers;
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public_routes = Router::new().route("/health", get(handlers::public::health));

    let api_routes = Router::new()
        .route(
            "/commitments",
            get(handlers::commitments::list_commitments)
                .post(handlers::commitments::create_commitment),
        )
        .route("/commitments/:id", get(handlers::commitments::get_commitment))
        .route(
            "/commitments/:id/withdraw",
            post(handlers::commitments::request_withdrawal),
        )
        .route(
            "/commitments/:id/commit",
            post(handlers::commitments::request_commit),
        )
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_token,
        ));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeafSource;
    use crate::hasher::{CommitmentHasher, ContractNullifier};
    use crate::orchestrator::{Orchestrator, OrchestratorSettings};
    use crate::relay::PoolRegistry;
    use crate::store::CommitmentStore;
    use crate::testing::{sample_deployment, FakeChain, FakeConnector, FakeProver};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use tower::ServiceExt;

    const TOKEN: &str = "0123456789abcdef";

    fn app(stopped: bool) -> (Router, Arc<AppState>) {
        let chain = Arc::new(FakeChain::new(100));
        let registry = Arc::new(PoolRegistry::new(
            HashMap::from([("ropsten".to_string(), sample_deployment())]),
            Arc::new(FakeConnector::new(chain)),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(CommitmentStore::in_memory()),
            registry,
            Arc::new(FakeProver::default()),
            Arc::new(CommitmentHasher::new(LeafSource::Local, Arc::new(ContractNullifier))),
            OrchestratorSettings::default(),
        ));
        if stopped {
            orchestrator.shutdown();
        }
        let state = Arc::new(AppState::new(orchestrator, TOKEN));
        (build(state.clone()), state)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public_and_api_needs_token() {
        let (app, _) = app(false);
        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["pools"][0], "ropsten");

        let resp = app
            .clone()
            .oneshot(Request::get("/commitments").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(body_json(resp).await["error"].is_string());

        let resp = app
            .oneshot(
                Request::get("/metrics")
                    .header("authorization", format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_and_withdraw_existing_commitment() {
        let (app, state) = app(true);
        let d = "0x00000000000000000000000000000000000000dd".parse().unwrap();
        let mut c = crate::types::Commitment::new("ropsten", d, None);
        c.funding_block_number = Some(100);
        c.leaf_index = Some("7".into());
        state.orchestrator.store().insert(c.clone()).await.unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/commitments/{}", c.id))
                    .header("x-api-token", TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["state"], "awaiting_withdraw_request");
        assert!(v.get("secret").is_none());

        // shut down orchestrators refuse new work
        let resp = app
            .clone()
            .oneshot(
                Request::post(format!("/commitments/{}/withdraw", c.id))
                    .header("x-api-token", TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .oneshot(
                Request::get("/commitments/nope")
                    .header("x-api-token", TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    fn create_req(body: &'static str) -> Request<Body> {
        Request::post("/commitments")
            .header("x-api-token", TOKEN)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn create_validates_input() {
        let (app, state) = app(false);
        let resp = app
            .clone()
            .oneshot(create_req(r#"{"pool_id":"ropsten","destination":"0x12"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(create_req(
                r#"{"pool_id":"mainnet","destination":"0x00000000000000000000000000000000000000dd"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(create_req(
                r#"{"pool_id":"ropsten","destination":"0x00000000000000000000000000000000000000dd"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let v = body_json(resp).await;
        assert_eq!(v["state"], "awaiting_funding");
        assert_eq!(state.orchestrator.store().len(), 1);
    }
}
