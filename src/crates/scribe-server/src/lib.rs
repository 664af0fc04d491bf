//! # scribe-server - HTTP and SSE surface over the scribe engine
//!
//! A thin axum layer around [`RunManager`]: JSON endpoints for run
//! lifecycle and an SSE channel per run for the live event stream.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | POST | `/api/generate-story` | start a creative-writing run |
//! | POST | `/api/generate-report` | start a report run |
//! | GET | `/api/status/:run_id` | status + progress |
//! | GET | `/api/result/:run_id` | final artifact |
//! | GET | `/api/task-graph/:run_id` | hierarchical graph snapshot |
//! | GET | `/api/workspace/:run_id` | current running article |
//! | GET | `/api/events/:run_id` | SSE event stream (live + replay) |
//! | POST | `/api/stop-task/:run_id` | request cancellation |
//! | DELETE | `/api/delete-task/:run_id` | remove run and its files |
//! | GET | `/api/history` | list runs |

pub mod error;
pub mod handlers;

pub use error::{Result, ServerError};

use axum::routing::{delete, get, post};
use axum::Router;
use scribe_core::RunManager;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RunManager>,
}

/// Build the application router.
pub fn router(manager: Arc<RunManager>) -> Router {
    let state = AppState { manager };
    Router::new()
        .route("/api/generate-story", post(handlers::generate_story))
        .route("/api/generate-report", post(handlers::generate_report))
        .route("/api/status/:run_id", get(handlers::status))
        .route("/api/result/:run_id", get(handlers::result))
        .route("/api/task-graph/:run_id", get(handlers::task_graph))
        .route("/api/workspace/:run_id", get(handlers::workspace))
        .route("/api/events/:run_id", get(handlers::events))
        .route("/api/stop-task/:run_id", post(handlers::stop_task))
        .route("/api/delete-task/:run_id", delete(handlers::delete_task))
        .route("/api/history", get(handlers::history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(manager: Arc<RunManager>, addr: &str) -> anyhow::Result<()> {
    let app = router(manager);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
