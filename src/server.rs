//! HTTP server for search and answer synthesis

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    AnswerError, AnswerMode, AnswerResult, Bookmind, CancellationToken, QueryContext, Scope,
    SearchError, SearchResult, SourceType,
};

/// Search request body
#[derive(Debug, Deserialize)]
pub struct SearchRequestHttp {
    pub query: String,
    pub user_id: String,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    #[serde(default)]
    pub source_types: Vec<SourceType>,
    #[serde(default)]
    pub has_history: bool,
}

impl SearchRequestHttp {
    fn scope(&self) -> Scope {
        Scope {
            user_id: self.user_id.clone(),
            document_ids: self.document_ids.clone(),
            source_types: self.source_types.clone(),
        }
    }

    fn context(&self) -> QueryContext {
        QueryContext {
            has_history: self.has_history,
        }
    }
}

/// Answer request body: a search request plus the answer mode
#[derive(Debug, Deserialize)]
pub struct AnswerRequestHttp {
    #[serde(flatten)]
    pub search: SearchRequestHttp,
    #[serde(default = "default_mode")]
    pub mode: AnswerMode,
}

fn default_mode() -> AnswerMode {
    AnswerMode::Short
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub user_id: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BreakerHealth {
    pub service: String,
    pub state: crate::CircuitState,
    pub consecutive_failures: u32,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub breakers: Vec<BreakerHealth>,
    pub store_permits_available: usize,
}

type HttpError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, error: &str, details: impl ToString) -> HttpError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            details: Some(details.to_string()),
        }),
    )
}

fn search_error(e: SearchError) -> HttpError {
    match e {
        SearchError::InvalidQuery(reason) => error_response(StatusCode::BAD_REQUEST, "invalid query", reason),
        SearchError::TotalRetrievalFailure { .. } => {
            error!("Search failed: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, "search unavailable", e)
        }
        // The client went away; nobody reads this
        SearchError::Cancelled => error_response(StatusCode::REQUEST_TIMEOUT, "cancelled", e),
    }
}

fn user_required(user_id: &str) -> Result<(), HttpError> {
    if user_id.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "invalid request", "user_id is required"));
    }
    Ok(())
}

/// Cancels the request token when the handler future is dropped
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn search_handler(
    State(engine): State<Arc<Bookmind>>,
    Json(req): Json<SearchRequestHttp>,
) -> Result<Json<SearchResult>, HttpError> {
    info!("Received search request: user_id='{}', query='{}'", req.user_id, req.query);
    user_required(&req.user_id)?;
    let guard = CancelOnDrop(CancellationToken::new());

    let result = engine
        .search(&req.query, &req.scope(), &req.context(), &guard.0)
        .await
        .map_err(search_error)?;
    if result.metadata.degraded {
        warn!("Search degraded: {:?}", result.metadata.degradations);
    }
    Ok(Json(result))
}

async fn answer_handler(
    State(engine): State<Arc<Bookmind>>,
    Json(req): Json<AnswerRequestHttp>,
) -> Result<Json<AnswerResult>, HttpError> {
    info!(
        "Received answer request: user_id='{}', mode={}, query='{}'",
        req.search.user_id,
        req.mode.as_str(),
        req.search.query
    );
    user_required(&req.search.user_id)?;
    let guard = CancelOnDrop(CancellationToken::new());

    match engine
        .answer(&req.search.query, &req.search.scope(), req.mode, &req.search.context(), &guard.0)
        .await
    {
        Ok(result) => Ok(Json(result)),
        Err(AnswerError::Search(e)) => Err(search_error(e)),
        Err(e @ AnswerError::Cancelled) => Err(error_response(StatusCode::REQUEST_TIMEOUT, "cancelled", e)),
    }
}

async fn invalidate_handler(
    State(engine): State<Arc<Bookmind>>,
    Json(req): Json<InvalidateRequest>,
) -> Result<StatusCode, HttpError> {
    user_required(&req.user_id)?;
    engine.invalidate_user(&req.user_id).await;
    info!("Invalidated cache for user '{}'", req.user_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Health check handler
async fn health_handler(State(engine): State<Arc<Bookmind>>) -> Json<HealthResponse> {
    let breakers: Vec<BreakerHealth> = engine
        .breakers()
        .into_iter()
        .map(|(service, snapshot)| BreakerHealth {
            service: service.to_string(),
            state: snapshot.state,
            consecutive_failures: snapshot.consecutive_failures,
        })
        .collect();
    let status = if breakers.iter().any(|b| b.state != crate::CircuitState::Closed) {
        "degraded"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        service: "bookmind".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        breakers,
        store_permits_available: engine.store_permits_available(),
    })
}

/// Create and configure the HTTP server
pub fn create_router(engine: Arc<Bookmind>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/search", post(search_handler))
        .route("/answer", post(answer_handler))
        .route("/cache/invalidate", post(invalidate_handler))
        .with_state(engine)
}

/// Run the HTTP server
pub async fn run_server(engine: Arc<Bookmind>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting Bookmind server on {}", addr);

    let app = create_router(engine);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_request_defaults_to_short() {
        let req: AnswerRequestHttp =
            serde_json::from_str(r#"{"query": "what is solitude", "user_id": "u1"}"#).unwrap();
        assert_eq!(req.mode, AnswerMode::Short);
        assert!(!req.search.has_history);
        assert_eq!(req.search.scope(), Scope::for_user("u1"));
    }

    #[test]
    fn test_total_failure_maps_to_503() {
        let (status, body) = search_error(SearchError::TotalRetrievalFailure { failures: vec![] });
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.0.error, "search unavailable");

        let (status, _) = search_error(SearchError::InvalidQuery("query is empty".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_dropping_guard_cancels() {
        let token = CancellationToken::new();
        drop(CancelOnDrop(token.clone()));
        assert!(token.is_cancelled());
        tokio_test::assert_ready!(tokio_test::task::spawn(token.cancelled()).poll());
    }
}
