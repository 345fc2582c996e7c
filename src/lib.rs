pub mod api;
pub mod auth;
pub mod cleanup;
pub mod cli;
pub mod clock;
pub mod db;
pub mod gateway;
pub mod jwt;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod verification;

use api::{AuthState, create_api_router};
use axum::{Router, middleware};
use clock::Clock;
use db::Database;
use jwt::{TokenCodec, TokenSettings};
use rate_limit::{RateLimitPolicies, RateLimitState, RateLimiter, rate_limit_api};
use session::SessionService;
use std::net::SocketAddr;
use std::sync::Arc;
use store::{FailurePolicy, Store};
use tokio::net::TcpListener;
use verification::{Mailer, VerificationCodes};

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// Shared store for refresh tokens, revocations, rate-limit logs and verification codes
    pub store: Arc<dyn Store>,
    /// Time source for token issuance, TTLs and rate-limit windows
    pub clock: Arc<dyn Clock>,
    /// Token secrets and lifetimes
    pub tokens: TokenSettings,
    pub rate_limits: RateLimitPolicies,
    /// What to do when the store cannot answer a revocation or rate-limit check
    pub failure_policy: FailurePolicy,
    /// Delivery of verification codes
    pub mailer: Arc<dyn Mailer>,
    /// IP extraction strategy (requires running behind a proxy)
    pub ip_extractor: Option<cli::IpExtractor>,
    /// Whether new account registration is disabled
    pub no_signup: bool,
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Router {
    let codec = TokenCodec::with_clock(&config.tokens, config.clock.clone());

    let sessions = Arc::new(SessionService::new(
        codec,
        config.store.clone(),
        Arc::new(config.db.clone()),
        config.failure_policy,
    ));

    let limiter = Arc::new(RateLimiter::new(
        config.store.clone(),
        config.clock.clone(),
        config.rate_limits.clone(),
        config.failure_policy,
    ));

    let rate_limits = RateLimitState {
        limiter: limiter.clone(),
        sessions: sessions.clone(),
        ip_extractor: config.ip_extractor.clone(),
    };

    let auth_state = AuthState {
        sessions,
        limiter,
        codes: VerificationCodes::new(config.store.clone()),
        mailer: config.mailer.clone(),
        ip_extractor: config.ip_extractor.clone(),
        no_signup: config.no_signup,
    };

    create_api_router(auth_state, rate_limits.clone())
        .layer(middleware::from_fn_with_state(rate_limits, rate_limit_api))
}

/// Run cleanup tasks and spawn background scheduler.
/// Call this before starting the server.
pub async fn init_cleanup(store: Arc<dyn Store>) {
    cleanup::run_cleanup(store.as_ref()).await;
    cleanup::spawn_cleanup_scheduler(store);
}

/// Run the server on the given listener. This function blocks until the server exits.
/// Call `init_cleanup` before this to run cleanup on startup.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    let app = create_app(&config);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}

/// Start the server on the given port in a background task. Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
/// Note: For production use, prefer `run_server` directly in main.
pub async fn start_server(
    config: ServerConfig,
    port: u16,
) -> std::io::Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
    init_cleanup(config.store.clone()).await;

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let local_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = run_server(config, listener).await {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok((handle, local_addr))
}
