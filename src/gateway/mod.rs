//! Client-side request gateway with single-flight token refresh.
//!
//! Every outbound call goes through [`RequestGateway::execute`], which attaches
//! the current access token. When the server answers 401 `TOKEN_EXPIRED`, the
//! first caller starts a refresh and every caller that hits the same expiry
//! while it runs waits for that one refresh instead of starting its own:
//!
//! ```text
//! Idle --(401 TOKEN_EXPIRED)--> Refreshing(waiters) --(settled)--> Idle
//! ```
//!
//! New tokens are stored before any waiter is woken, so no replay uses a
//! stale token. A failed or timed-out refresh clears the session, fails every
//! waiter and publishes exactly one [`SessionEvent::LoggedOut`].

mod transport;

pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport, TransportError};

use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::api::ErrorCode;
use crate::clock::{Clock, SystemClock};
use crate::jwt::expires_within;
use crate::session::{Principal, TokenPair};

/// Why the local session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The server rejected the refresh token
    RefreshRejected,
    /// The refresh did not settle within the configured timeout
    RefreshTimedOut,
    /// The server rejected the access token for a reason refreshing cannot fix
    InvalidToken,
    /// [`RequestGateway::logout`] was called
    UserRequested,
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            LogoutReason::RefreshRejected => "refresh rejected",
            LogoutReason::RefreshTimedOut => "refresh timed out",
            LogoutReason::InvalidToken => "invalid access token",
            LogoutReason::UserRequested => "logged out",
        };
        f.write_str(reason)
    }
}

/// Published on every session transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    Refreshed,
    LoggedOut { reason: LogoutReason },
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The session ended; the user has to log in again.
    #[error("session ended: {0}")]
    SessionEnded(LogoutReason),
    /// 401 that refreshing cannot fix.
    #[error("unauthorized: {0:?}")]
    Unauthorized(Option<ErrorCode>),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on a refresh call; waiters fail once it passes
    pub refresh_timeout: Duration,
    /// Refresh before sending when the access token expires within this window
    pub proactive_refresh: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: Duration::from_secs(10),
            proactive_refresh: None,
        }
    }
}

type RefreshOutcome = Result<String, LogoutReason>;

enum Phase {
    Idle,
    Refreshing(Vec<oneshot::Sender<RefreshOutcome>>),
}

struct SessionState {
    tokens: Option<TokenPair>,
    phase: Phase,
    /// Bumped on login and logout so a refresh that outlives its session is discarded
    generation: u64,
}

struct Shared<T> {
    transport: T,
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Cloneable handle; clones share one session and one refresh slot.
pub struct RequestGateway<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for RequestGateway<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    user: Principal,
}

impl<T: Transport> RequestGateway<T> {
    pub fn new(transport: T, config: GatewayConfig) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    pub fn with_clock(transport: T, config: GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                clock,
                state: Mutex::new(SessionState {
                    tokens: None,
                    phase: Phase::Idle,
                    generation: 0,
                }),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn tokens(&self) -> Option<TokenPair> {
        self.shared.state.lock().await.tokens.clone()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.shared.state.lock().await.tokens.is_some()
    }

    /// Install tokens obtained elsewhere (e.g. restored from disk).
    pub async fn set_tokens(&self, tokens: TokenPair) {
        let mut state = self.shared.state.lock().await;
        state.tokens = Some(tokens);
        state.generation += 1;
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Principal, GatewayError> {
        let request = ApiRequest::post(
            "auth/login",
            json!({ "email": email, "password": password }),
        );
        let response = self.shared.transport.send(&request, None).await?;
        if !response.status.is_success() {
            return Err(TransportError::Rejected {
                status: response.status,
                code: response.error_code(),
            }
            .into());
        }

        let login: LoginResponse = response
            .json()
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        self.set_tokens(TokenPair {
            access_token: login.access_token,
            refresh_token: login.refresh_token,
        })
        .await;
        let _ = self.shared.events.send(SessionEvent::LoggedIn);
        info!(principal_id = %login.user.id, "Logged in");
        Ok(login.user)
    }

    /// Ask the server to revoke the session, then clear local state regardless of the outcome.
    pub async fn logout(&self) {
        let access = self.tokens().await.map(|t| t.access_token);
        if let Some(token) = access.as_deref() {
            let request = ApiRequest::new(reqwest::Method::POST, "auth/logout");
            match self.shared.transport.send(&request, Some(token)).await {
                Ok(response) if response.status.is_success() => {}
                Ok(response) => debug!(status = %response.status, "Server-side logout failed"),
                Err(e) => debug!(error = %e, "Server-side logout failed"),
            }
        }
        self.end_session(None, LogoutReason::UserRequested).await;
    }

    /// Send `request` with the current access token, refreshing once on expiry.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, GatewayError> {
        let mut token = self.tokens().await.map(|t| t.access_token);

        if let Some(threshold) = self.shared.config.proactive_refresh {
            if let Some(current) = token.clone() {
                if expires_within(&current, threshold, self.shared.clock.now_secs()) {
                    token = Some(self.await_refresh(&current).await?);
                }
            }
        }

        let response = self
            .shared
            .transport
            .send(request, token.as_deref())
            .await?;
        if response.status != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let code = response.error_code();
        let Some(used) = token else {
            return Err(GatewayError::Unauthorized(code));
        };

        if code == Some(ErrorCode::TokenExpired) {
            let fresh = self.await_refresh(&used).await?;
            // Replayed once; a second 401 goes back to the caller as is
            return Ok(self.shared.transport.send(request, Some(&fresh)).await?);
        }

        // Malformed, forged or revoked: refreshing cannot help
        self.end_session(Some(&used), LogoutReason::InvalidToken).await;
        Err(GatewayError::Unauthorized(code))
    }

    /// Wait for a refresh that replaces `stale`, starting one if none is running.
    async fn await_refresh(&self, stale: &str) -> Result<String, GatewayError> {
        let receiver = {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;

            let Some(tokens) = &state.tokens else {
                return Err(GatewayError::SessionEnded(LogoutReason::RefreshRejected));
            };
            if tokens.access_token != stale {
                // Another caller already refreshed
                return Ok(tokens.access_token.clone());
            }

            let (sender, receiver) = oneshot::channel();
            match &mut state.phase {
                Phase::Refreshing(waiters) => waiters.push(sender),
                Phase::Idle => {
                    let refresh_token = tokens.refresh_token.clone();
                    state.phase = Phase::Refreshing(vec![sender]);
                    self.spawn_refresh(refresh_token, state.generation);
                }
            }
            receiver
        };

        match receiver.await {
            Ok(Ok(access)) => Ok(access),
            Ok(Err(reason)) => Err(GatewayError::SessionEnded(reason)),
            Err(_) => Err(GatewayError::SessionEnded(LogoutReason::RefreshRejected)),
        }
    }

    /// The refresh runs detached so a caller dropping its future cannot strand the other waiters.
    ///
    /// The transport call gets a task of its own; the outer task settles even
    /// when that one panics.
    fn spawn_refresh(&self, refresh_token: String, generation: u64) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            debug!("Refreshing access token");
            let call = {
                let shared = shared.clone();
                tokio::spawn(async move {
                    tokio::time::timeout(
                        shared.config.refresh_timeout,
                        shared.transport.refresh(&refresh_token),
                    )
                    .await
                })
            };
            let result = match call.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Token refresh task failed");
                    Ok(Err(TransportError::Network(e.to_string())))
                }
            };
            shared.settle(result, generation).await;
        });
    }

    /// Clear the session if `token` is still current (or unconditionally for `None`).
    async fn end_session(&self, token: Option<&str>, reason: LogoutReason) {
        let ended = {
            let mut state = self.shared.state.lock().await;
            let current = state.tokens.as_ref().map(|t| t.access_token.as_str());
            let matches = match token {
                Some(token) => current == Some(token),
                None => current.is_some(),
            };
            if matches {
                state.tokens = None;
                state.generation += 1;
            }
            matches
        };

        if ended {
            warn!(reason = %reason, "Session ended");
            let _ = self.shared.events.send(SessionEvent::LoggedOut { reason });
        }
    }
}

impl<T: Transport> Shared<T> {
    async fn settle(
        &self,
        result: Result<Result<TokenPair, TransportError>, tokio::time::error::Elapsed>,
        generation: u64,
    ) {
        let (waiters, outcome, event) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let waiters = match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::Refreshing(waiters) => waiters,
                Phase::Idle => Vec::new(),
            };

            let (outcome, event) = if state.generation != generation {
                // Logged out (or in again) while refreshing; the result belongs to a dead session
                (Err(LogoutReason::UserRequested), None)
            } else {
                match result {
                    Ok(Ok(tokens)) => {
                        let access = tokens.access_token.clone();
                        state.tokens = Some(tokens);
                        (Ok(access), Some(SessionEvent::Refreshed))
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Token refresh failed");
                        state.tokens = None;
                        state.generation += 1;
                        let reason = LogoutReason::RefreshRejected;
                        (Err(reason), Some(SessionEvent::LoggedOut { reason }))
                    }
                    Err(_) => {
                        warn!(
                            timeout_ms = self.config.refresh_timeout.as_millis() as u64,
                            "Token refresh timed out"
                        );
                        state.tokens = None;
                        state.generation += 1;
                        let reason = LogoutReason::RefreshTimedOut;
                        (Err(reason), Some(SessionEvent::LoggedOut { reason }))
                    }
                }
            };
            (waiters, outcome, event)
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}
