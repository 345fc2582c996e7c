//! Tests for the client request gateway.
//!
//! Tests cover:
//! - Single-flight refresh under concurrent expiry
//! - Refresh failure, timeout, panic and logout while refreshing
//! - Tokens that refreshing cannot fix
//! - Proactive refresh before expiry
//! - The gateway against a live server over HTTP

mod common;

use async_trait::async_trait;
use common::{create_user, test_config};
use inkpost::{
    api::ErrorCode,
    clock::{Clock, ManualClock},
    db::{Database, UserRole},
    gateway::{
        ApiRequest, ApiResponse, GatewayConfig, GatewayError, HttpTransport, LogoutReason,
        RequestGateway, SessionEvent, Transport, TransportError,
    },
    jwt::{TokenCodec, TokenSettings},
    session::{Principal, TokenPair},
    start_server,
    store::MemoryStore,
};
use reqwest::StatusCode;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

// =============================================================================
// Scripted transport
// =============================================================================

/// Accepts exactly one access token; any other token that looks issued is expired.
struct MockServer {
    access: Mutex<String>,
    refresh: Mutex<String>,
    refresh_calls: AtomicUsize,
    refresh_delay: Duration,
    reject_refresh: AtomicBool,
    /// Hand out access tokens the server will not accept
    issue_stale: AtomicBool,
    /// The refresh call panics instead of answering
    crash_refresh: AtomicBool,
    seen_tokens: Mutex<Vec<Option<String>>>,
}

#[derive(Clone)]
struct MockTransport(Arc<MockServer>);

impl MockTransport {
    fn new(refresh_delay: Duration) -> Self {
        Self(Arc::new(MockServer {
            access: Mutex::new("access-0".into()),
            refresh: Mutex::new("refresh-0".into()),
            refresh_calls: AtomicUsize::new(0),
            refresh_delay,
            reject_refresh: AtomicBool::new(false),
            issue_stale: AtomicBool::new(false),
            crash_refresh: AtomicBool::new(false),
            seen_tokens: Mutex::new(Vec::new()),
        }))
    }

    fn initial_tokens() -> TokenPair {
        TokenPair {
            access_token: "access-0".into(),
            refresh_token: "refresh-0".into(),
        }
    }

    /// The client's current access token starts answering TOKEN_EXPIRED.
    fn expire_access(&self) {
        *self.0.access.lock().unwrap() = "access-expired".into();
    }

    fn set_session(&self, access: &str, refresh: &str) {
        *self.0.access.lock().unwrap() = access.into();
        *self.0.refresh.lock().unwrap() = refresh.into();
    }

    fn refresh_calls(&self) -> usize {
        self.0.refresh_calls.load(Ordering::SeqCst)
    }

    fn seen_tokens(&self) -> Vec<Option<String>> {
        self.0.seen_tokens.lock().unwrap().clone()
    }
}

fn error_response(status: StatusCode, code: &str) -> ApiResponse {
    ApiResponse {
        status,
        body: json!({ "success": false, "error": { "code": code, "message": code } }).to_string(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.0
            .seen_tokens
            .lock()
            .unwrap()
            .push(access_token.map(str::to_string));

        match request.path.as_str() {
            "auth/login" => {
                let body = json!({
                    "success": true,
                    "accessToken": *self.0.access.lock().unwrap(),
                    "refreshToken": *self.0.refresh.lock().unwrap(),
                    "expiresIn": 1800,
                    "user": { "id": "p-1", "email": "alice@example.com", "role": "user" },
                });
                return Ok(ApiResponse {
                    status: StatusCode::OK,
                    body: body.to_string(),
                });
            }
            "auth/logout" => {
                return Ok(ApiResponse {
                    status: StatusCode::OK,
                    body: r#"{"success":true}"#.into(),
                });
            }
            _ => {}
        }

        let current = self.0.access.lock().unwrap().clone();
        Ok(match access_token {
            None => error_response(StatusCode::UNAUTHORIZED, "NO_TOKEN"),
            Some(token) if token == current => ApiResponse {
                status: StatusCode::OK,
                body: json!({ "path": request.path, "token": token }).to_string(),
            },
            Some(token) if token.starts_with("access-") => {
                error_response(StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED")
            }
            Some(_) => error_response(StatusCode::UNAUTHORIZED, "INVALID_TOKEN"),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, TransportError> {
        tokio::time::sleep(self.0.refresh_delay).await;
        let n = self.0.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.0.crash_refresh.load(Ordering::SeqCst) {
            panic!("refresh handler crashed");
        }

        let rejected = TransportError::Rejected {
            status: StatusCode::UNAUTHORIZED,
            code: Some(ErrorCode::InvalidRefresh),
        };
        if self.0.reject_refresh.load(Ordering::SeqCst) {
            return Err(rejected);
        }
        if *self.0.refresh.lock().unwrap() != refresh_token {
            return Err(rejected);
        }

        let pair = TokenPair {
            access_token: format!("access-{}", n),
            refresh_token: format!("refresh-{}", n),
        };
        *self.0.refresh.lock().unwrap() = pair.refresh_token.clone();
        if self.0.issue_stale.load(Ordering::SeqCst) {
            *self.0.access.lock().unwrap() = "access-expired".into();
        } else {
            *self.0.access.lock().unwrap() = pair.access_token.clone();
        }
        Ok(pair)
    }
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn gateway(transport: &MockTransport, config: GatewayConfig) -> RequestGateway<MockTransport> {
    let gateway = RequestGateway::new(transport.clone(), config);
    gateway.set_tokens(MockTransport::initial_tokens()).await;
    gateway
}

// =============================================================================
// Single-flight refresh
// =============================================================================

#[tokio::test]
async fn test_valid_token_passes_through() {
    let transport = MockTransport::new(Duration::ZERO);
    let gateway = gateway(&transport, GatewayConfig::default()).await;

    let response = gateway.execute(&ApiRequest::get("posts")).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(transport.refresh_calls(), 0);
    assert_eq!(transport.seen_tokens(), vec![Some("access-0".to_string())]);
}

#[tokio::test]
async fn test_concurrent_expiry_triggers_one_refresh() {
    let transport = MockTransport::new(Duration::from_millis(50));
    let gateway = gateway(&transport, GatewayConfig::default()).await;
    let mut events = gateway.subscribe();
    transport.expire_access();

    let calls: Vec<_> = (0..10)
        .map(|i| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.execute(&ApiRequest::get(format!("posts/{}", i))).await })
        })
        .collect();

    for call in calls {
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    assert_eq!(transport.refresh_calls(), 1);
    assert_eq!(drain(&mut events), vec![SessionEvent::Refreshed]);
    assert_eq!(
        gateway.tokens().await.unwrap().access_token,
        "access-1".to_string()
    );
    // Every replay carried the new token
    let replays = transport
        .seen_tokens()
        .into_iter()
        .filter(|t| t.as_deref() == Some("access-1"))
        .count();
    assert_eq!(replays, 10);
}

#[tokio::test]
async fn test_sequential_expiries_refresh_each_time() {
    let transport = MockTransport::new(Duration::ZERO);
    let gateway = gateway(&transport, GatewayConfig::default()).await;

    transport.expire_access();
    gateway.execute(&ApiRequest::get("posts")).await.unwrap();
    transport.expire_access();
    gateway.execute(&ApiRequest::get("posts")).await.unwrap();

    assert_eq!(transport.refresh_calls(), 2);
    assert_eq!(gateway.tokens().await.unwrap().refresh_token, "refresh-2");
}

#[tokio::test]
async fn test_replay_happens_once() {
    let transport = MockTransport::new(Duration::ZERO);
    transport.0.issue_stale.store(true, Ordering::SeqCst);
    let gateway = gateway(&transport, GatewayConfig::default()).await;
    transport.expire_access();

    let response = gateway.execute(&ApiRequest::get("posts")).await.unwrap();

    // The replay's 401 is handed back instead of refreshing again
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.error_code(), Some(ErrorCode::TokenExpired));
    assert_eq!(transport.refresh_calls(), 1);
    assert_eq!(transport.seen_tokens().len(), 2);
}

#[tokio::test]
async fn test_dropped_caller_does_not_strand_waiters() {
    let transport = MockTransport::new(Duration::from_millis(100));
    let gateway = gateway(&transport, GatewayConfig::default()).await;
    transport.expire_access();

    let first = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.execute(&ApiRequest::get("posts")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.execute(&ApiRequest::get("posts")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.abort();

    let response = second.await.unwrap().unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(transport.refresh_calls(), 1);
}

// =============================================================================
// Session end
// =============================================================================

#[tokio::test]
async fn test_refresh_failure_logs_out_once() {
    let transport = MockTransport::new(Duration::from_millis(50));
    transport.0.reject_refresh.store(true, Ordering::SeqCst);
    let gateway = gateway(&transport, GatewayConfig::default()).await;
    let mut events = gateway.subscribe();
    transport.expire_access();

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.execute(&ApiRequest::get("posts")).await })
        })
        .collect();

    for call in calls {
        let result = call.await.unwrap();
        assert!(
            matches!(
                result,
                Err(GatewayError::SessionEnded(LogoutReason::RefreshRejected))
            ),
            "unexpected {:?}",
            result
        );
    }

    assert_eq!(transport.refresh_calls(), 1);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::LoggedOut {
            reason: LogoutReason::RefreshRejected
        }]
    );
    assert!(!gateway.is_logged_in().await);
}

#[tokio::test]
async fn test_refresh_timeout_logs_out() {
    let transport = MockTransport::new(Duration::from_secs(5));
    let config = GatewayConfig {
        refresh_timeout: Duration::from_millis(50),
        ..GatewayConfig::default()
    };
    let gateway = gateway(&transport, config).await;
    let mut events = gateway.subscribe();
    transport.expire_access();

    let result = gateway.execute(&ApiRequest::get("posts")).await;

    assert!(matches!(
        result,
        Err(GatewayError::SessionEnded(LogoutReason::RefreshTimedOut))
    ));
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::LoggedOut {
            reason: LogoutReason::RefreshTimedOut
        }]
    );
    assert!(gateway.tokens().await.is_none());
}

#[tokio::test]
async fn test_panicking_refresh_still_settles() {
    let transport = MockTransport::new(Duration::ZERO);
    transport.0.crash_refresh.store(true, Ordering::SeqCst);
    let gateway = gateway(&transport, GatewayConfig::default()).await;
    let mut events = gateway.subscribe();
    transport.expire_access();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        gateway.execute(&ApiRequest::get("posts")),
    )
    .await
    .expect("waiter left hanging");
    assert!(matches!(
        result,
        Err(GatewayError::SessionEnded(LogoutReason::RefreshRejected))
    ));
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::LoggedOut {
            reason: LogoutReason::RefreshRejected
        }]
    );

    // The refresh slot is free again
    transport.0.crash_refresh.store(false, Ordering::SeqCst);
    gateway.set_tokens(MockTransport::initial_tokens()).await;
    let response = tokio::time::timeout(
        Duration::from_secs(1),
        gateway.execute(&ApiRequest::get("posts")),
    )
    .await
    .expect("second refresh never ran")
    .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(transport.refresh_calls(), 2);
}

#[tokio::test]
async fn test_invalid_token_bypasses_refresh() {
    let transport = MockTransport::new(Duration::ZERO);
    let gateway = RequestGateway::new(transport.clone(), GatewayConfig::default());
    gateway
        .set_tokens(TokenPair {
            access_token: "forged".into(),
            refresh_token: "refresh-0".into(),
        })
        .await;
    let mut events = gateway.subscribe();

    let result = gateway.execute(&ApiRequest::get("posts")).await;

    assert!(matches!(
        result,
        Err(GatewayError::Unauthorized(Some(ErrorCode::InvalidToken)))
    ));
    assert_eq!(transport.refresh_calls(), 0);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::LoggedOut {
            reason: LogoutReason::InvalidToken
        }]
    );
    assert!(!gateway.is_logged_in().await);
}

#[tokio::test]
async fn test_no_session_is_unauthorized() {
    let transport = MockTransport::new(Duration::ZERO);
    let gateway = RequestGateway::new(transport.clone(), GatewayConfig::default());

    let result = gateway.execute(&ApiRequest::get("posts")).await;

    assert!(matches!(
        result,
        Err(GatewayError::Unauthorized(Some(ErrorCode::NoToken)))
    ));
    assert_eq!(transport.refresh_calls(), 0);
}

#[tokio::test]
async fn test_logout_during_refresh_discards_result() {
    let transport = MockTransport::new(Duration::from_millis(100));
    let gateway = gateway(&transport, GatewayConfig::default()).await;
    let mut events = gateway.subscribe();
    transport.expire_access();

    let pending = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.execute(&ApiRequest::get("posts")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    gateway.logout().await;

    let result = pending.await.unwrap();

    assert!(matches!(result, Err(GatewayError::SessionEnded(_))));
    assert_eq!(transport.refresh_calls(), 1);
    // The refreshed pair is not reinstated
    assert!(gateway.tokens().await.is_none());
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::LoggedOut {
            reason: LogoutReason::UserRequested
        }]
    );
}

// =============================================================================
// Login and proactive refresh
// =============================================================================

#[tokio::test]
async fn test_login_stores_tokens() {
    let transport = MockTransport::new(Duration::ZERO);
    let gateway = RequestGateway::new(transport.clone(), GatewayConfig::default());
    let mut events = gateway.subscribe();

    let principal = gateway.login("alice@example.com", "hunter22").await.unwrap();

    assert_eq!(principal.id, "p-1");
    assert_eq!(principal.role, UserRole::User);
    assert_eq!(gateway.tokens().await, Some(MockTransport::initial_tokens()));
    assert_eq!(drain(&mut events), vec![SessionEvent::LoggedIn]);
}

#[tokio::test]
async fn test_proactive_refresh_before_expiry() {
    let clock = ManualClock::starting_now();
    let codec = TokenCodec::with_clock(
        &TokenSettings::new(common::ACCESS_SECRET, common::REFRESH_SECRET),
        Arc::new(clock.clone()),
    );
    let principal = Principal {
        id: "p-1".into(),
        email: "alice@example.com".into(),
        role: UserRole::User,
    };
    let access = codec.issue_access(&principal).unwrap().token;

    let transport = MockTransport::new(Duration::ZERO);
    transport.set_session(&access, "refresh-0");
    let config = GatewayConfig {
        proactive_refresh: Some(Duration::from_secs(5 * 60)),
        ..GatewayConfig::default()
    };
    let gateway = RequestGateway::with_clock(transport.clone(), config, Arc::new(clock.clone()));
    gateway
        .set_tokens(TokenPair {
            access_token: access.clone(),
            refresh_token: "refresh-0".into(),
        })
        .await;

    // Far from expiry: sent as is
    gateway.execute(&ApiRequest::get("posts")).await.unwrap();
    assert_eq!(transport.refresh_calls(), 0);

    clock.advance(Duration::from_secs(26 * 60));
    let response = gateway.execute(&ApiRequest::get("posts")).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(transport.refresh_calls(), 1);
    assert_eq!(
        transport.seen_tokens(),
        vec![Some(access), Some("access-1".to_string())]
    );
}

// =============================================================================
// Against a live server
// =============================================================================

async fn live_gateway() -> (RequestGateway<HttpTransport>, ManualClock) {
    let db = Database::open(":memory:").await.unwrap();
    create_user(&db, "alice@example.com", "correct-horse").await;

    let clock = ManualClock::starting_now();
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let config = test_config(db, clock.clone(), store);
    let (_handle, addr) = start_server(config, 0).await.unwrap();

    let base = url::Url::parse(&format!("http://{}/", addr)).unwrap();
    let transport = HttpTransport::new(base, Duration::from_secs(5)).unwrap();
    let gateway = RequestGateway::with_clock(
        transport,
        GatewayConfig::default(),
        Arc::new(clock.clone()) as Arc<dyn Clock>,
    );
    (gateway, clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_refresh_after_expiry() {
    let (gateway, clock) = live_gateway().await;
    let mut events = gateway.subscribe();

    let principal = gateway.login("alice@example.com", "correct-horse").await.unwrap();
    assert_eq!(principal.email, "alice@example.com");

    let response = gateway.execute(&ApiRequest::get("auth/me")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);

    clock.advance(Duration::from_secs(31 * 60));
    let calls: Vec<_> = (0..5)
        .map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.execute(&ApiRequest::get("auth/me")).await })
        })
        .collect();
    for call in calls {
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    }

    // A second refresh with the rotated-out token would have ended the session
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::LoggedIn, SessionEvent::Refreshed]
    );
    assert!(gateway.is_logged_in().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_logout_revokes_server_side() {
    let (gateway, _clock) = live_gateway().await;
    gateway.login("alice@example.com", "correct-horse").await.unwrap();
    let tokens = gateway.tokens().await.unwrap();

    gateway.logout().await;
    assert!(!gateway.is_logged_in().await);

    // Reinstalling the old pair does not bring the session back
    gateway.set_tokens(tokens).await;
    let result = gateway.execute(&ApiRequest::get("auth/me")).await;

    assert!(matches!(
        result,
        Err(GatewayError::Unauthorized(Some(ErrorCode::TokenRevoked)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_logout_after_idle_revokes_refresh_token() {
    let (gateway, clock) = live_gateway().await;
    gateway.login("alice@example.com", "correct-horse").await.unwrap();
    let tokens = gateway.tokens().await.unwrap();

    clock.advance(Duration::from_secs(31 * 60));
    gateway.logout().await;

    // The expired access token triggers a refresh, which the server refuses
    gateway.set_tokens(tokens).await;
    let result = gateway.execute(&ApiRequest::get("auth/me")).await;

    assert!(matches!(
        result,
        Err(GatewayError::SessionEnded(LogoutReason::RefreshRejected))
    ));
    assert!(!gateway.is_logged_in().await);
}
