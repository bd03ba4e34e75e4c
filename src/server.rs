//! # HTTP Server
//!
//! Builds the Axum router over [`crate::throttler::Throttler`] and runs it
//! with the teacher's graceful-shutdown idiom: race `Ctrl+C` against
//! `SIGTERM`, let in-flight requests finish, then tear the throttler down
//! through [`Throttler::close`].

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers::{self, SharedState};
use crate::throttler::Throttler;

pub struct Server {
    app: Router,
    bind_address: String,
    throttler: Arc<Throttler>,
}

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/v1/:bucket_type/:key/take", post(handlers::take))
        .route("/v1/:bucket_type/:key/wait", post(handlers::wait))
        .route("/v1/:bucket_type/:key/put", post(handlers::put))
        .route("/v1/:bucket_type/:key", get(handlers::get))
        .route("/v1/admin/reset-all", post(handlers::reset_all))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let bind_address = config.bind_address.clone();
        let throttler = Arc::new(Throttler::connect(&config).await?);
        let app = create_app(throttler.clone());
        Ok(Self { app, bind_address, throttler })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        tracing::info!(address = %self.bind_address, "ratewarden listening");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        match Arc::try_unwrap(self.throttler) {
            Ok(mut throttler) => {
                if let Err(e) = throttler.close().await {
                    tracing::warn!(error = %e, "error while closing throttler");
                }
            }
            Err(_) => tracing::warn!("throttler still has live references at shutdown, skipping close"),
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received terminate signal, shutting down"),
    }
}
