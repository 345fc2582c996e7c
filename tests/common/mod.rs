#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Method, Request, StatusCode},
};
use inkpost::{
    ServerConfig, create_app,
    clock::ManualClock,
    db::{Database, UserRole},
    jwt::TokenSettings,
    rate_limit::RateLimitPolicies,
    session::{AccountDirectory, Principal},
    store::{FailurePolicy, MemoryStore, Store, StoreError},
    verification::Mailer,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

pub const ACCESS_SECRET: &[u8] = b"access-secret-for-integration-tests";
pub const REFRESH_SECRET: &[u8] = b"refresh-secret-for-integration-tests";

// =============================================================================
// Store and mailer doubles
// =============================================================================

/// MemoryStore that can be switched into an outage.
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            inner: MemoryStore::with_clock(Arc::new(clock)),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.compare_and_set(key, expected, new, ttl).await
    }

    async fn list_append(&self, key: &str, value: u64) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.list_append(key, value).await
    }

    async fn list_range(&self, key: &str) -> Result<Vec<u64>, StoreError> {
        self.check()?;
        self.inner.list_range(key).await
    }

    async fn list_prune(&self, key: &str, older_than: u64) -> Result<Vec<u64>, StoreError> {
        self.check()?;
        self.inner.list_prune(key, older_than).await
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), StoreError> {
        self.check()?;
        self.inner.list_trim(key, max_len).await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.purge_expired().await
    }
}

/// Keeps every code it is asked to send.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMailer {
    pub fn last_code(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, code)| code.clone())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_verification_code(&self, email: &str, code: &str) -> Result<(), String> {
        self.sent
            .lock()
            .unwrap()
            .push((email.to_string(), code.to_string()));
        Ok(())
    }
}

// =============================================================================
// App construction
// =============================================================================

pub struct TestApp {
    pub app: Router,
    pub db: Database,
    pub clock: ManualClock,
    pub store: Arc<FlakyStore>,
    pub mailer: Arc<RecordingMailer>,
}

pub fn test_config(db: Database, clock: ManualClock, store: Arc<dyn Store>) -> ServerConfig {
    ServerConfig {
        db,
        store,
        clock: Arc::new(clock),
        tokens: TokenSettings::new(ACCESS_SECRET, REFRESH_SECRET),
        rate_limits: RateLimitPolicies::default(),
        failure_policy: FailurePolicy::Open,
        mailer: Arc::new(RecordingMailer::default()),
        ip_extractor: None,
        no_signup: false,
    }
}

pub async fn test_app() -> TestApp {
    test_app_with(|_| {}).await
}

/// Build an app after letting the caller adjust the configuration.
pub async fn test_app_with(configure: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    let clock = ManualClock::starting_now();
    let store = Arc::new(FlakyStore::new(clock.clone()));
    let mailer = Arc::new(RecordingMailer::default());

    let mut config = test_config(db.clone(), clock.clone(), store.clone());
    config.mailer = mailer.clone();
    configure(&mut config);

    TestApp {
        app: create_app(&config),
        db,
        clock,
        store,
        mailer,
    }
}

pub async fn create_user(db: &Database, email: &str, password: &str) -> Principal {
    db.create_account(email, password, UserRole::User)
        .await
        .expect("Failed to create user")
}

// =============================================================================
// Requests
// =============================================================================

pub fn client_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}

pub fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    request_from(client_addr(), method, uri, token, body)
}

pub fn request_from(
    addr: SocketAddr,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(addr));
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).unwrap()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn error_code(&self) -> &str {
        self.body["error"]["code"].as_str().unwrap_or("")
    }

    pub fn str(&self, field: &str) -> String {
        self.body[field].as_str().unwrap_or_default().to_string()
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn post_login(app: &Router, email: &str, password: &str) -> TestResponse {
    send(
        app,
        request(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": email, "password": password })),
        ),
    )
    .await
}

/// Log in and return (access, refresh).
pub async fn login(app: &Router, email: &str, password: &str) -> (String, String) {
    let response = post_login(app, email, password).await;
    assert_eq!(response.status, StatusCode::OK, "login failed: {}", response.body);
    (response.str("accessToken"), response.str("refreshToken"))
}

pub async fn post_refresh(app: &Router, refresh_token: &str) -> TestResponse {
    send(
        app,
        request(
            Method::POST,
            "/auth/refresh",
            None,
            Some(json!({ "refreshToken": refresh_token })),
        ),
    )
    .await
}

pub async fn get_me(app: &Router, token: Option<&str>) -> TestResponse {
    send(app, request(Method::GET, "/auth/me", token, None)).await
}
