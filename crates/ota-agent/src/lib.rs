//! OTA Agent
//!
//! Device-side module upgrade agent. Reports module versions to the IoT
//! platform, requests upgrade packages, downloads and verifies them, and
//! reports the outcome of every upgrade cycle exactly once.

pub mod config;
pub mod controller;
pub mod cycle;
pub mod fetcher;
pub mod handlers;
pub mod history;
pub mod mock_platform;
pub mod transport;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::AgentConfig;
pub use controller::{handle_ack, OtaController, OtaHandle};
pub use cycle::{CyclePhase, UpgradeCycle};
pub use fetcher::{HttpFetcher, PackageFetcher, SignMethod};
pub use handlers::AppState;
pub use history::{CycleHistory, HistoryStats};
pub use mock_platform::{MockOffer, MockPlatform};
pub use transport::{MessageId, TopicKind, Transport, TransportEvent};

/// Create the status API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/cycles", get(handlers::list_cycles_handler))
        .route("/api/modules/{module}", get(handlers::get_module_handler))
        .route(
            "/api/modules/{module}/check",
            post(handlers::check_module_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
