//! Sliding-window rate limiting for authentication and API endpoints.
//!
//! Each (tier, key) pair owns a log of request timestamps in the shared
//! [`Store`], so limits hold across every server instance using that store.
//! Pruning, appending and trimming are separate store calls: two requests on
//! the same key racing at the window boundary can both be admitted.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::api::ApiError;
use crate::auth::{bearer_token, extract_client_ip};
use crate::cli::IpExtractor;
use crate::clock::Clock;
use crate::session::SessionService;
use crate::store::{FailurePolicy, Store, StoreError};

/// Traffic class with its own window and limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Login attempts, keyed by email (IP when no email was sent)
    Login,
    /// Account creation, keyed by IP
    Register,
    /// One verification code per email per minute
    VerificationCodeBurst,
    /// Verification codes per email per hour
    VerificationCodeHourly,
    /// Verification codes per IP per hour
    VerificationCodeIp,
    /// Anonymous API traffic, keyed by IP
    Api,
    /// Authenticated API traffic, keyed by principal ID
    ApiAuthenticated,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Login => "login",
            Tier::Register => "register",
            Tier::VerificationCodeBurst => "verify-burst",
            Tier::VerificationCodeHourly => "verify-hourly",
            Tier::VerificationCodeIp => "verify-ip",
            Tier::Api => "api",
            Tier::ApiAuthenticated => "api-auth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub window: Duration,
    pub max_requests: usize,
}

impl WindowPolicy {
    pub const fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Independent policy per tier.
#[derive(Debug, Clone)]
pub struct RateLimitPolicies {
    pub login: WindowPolicy,
    pub register: WindowPolicy,
    pub verification_code_burst: WindowPolicy,
    pub verification_code_hourly: WindowPolicy,
    pub verification_code_ip: WindowPolicy,
    pub api: WindowPolicy,
    pub api_authenticated: WindowPolicy,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self {
            login: WindowPolicy::new(MINUTE, 5),
            register: WindowPolicy::new(HOUR, 3),
            verification_code_burst: WindowPolicy::new(MINUTE, 1),
            verification_code_hourly: WindowPolicy::new(HOUR, 5),
            verification_code_ip: WindowPolicy::new(HOUR, 10),
            api: WindowPolicy::new(MINUTE, 100),
            api_authenticated: WindowPolicy::new(MINUTE, 1000),
        }
    }
}

impl RateLimitPolicies {
    pub fn get(&self, tier: Tier) -> WindowPolicy {
        match tier {
            Tier::Login => self.login,
            Tier::Register => self.register,
            Tier::VerificationCodeBurst => self.verification_code_burst,
            Tier::VerificationCodeHourly => self.verification_code_hourly,
            Tier::VerificationCodeIp => self.verification_code_ip,
            Tier::Api => self.api,
            Tier::ApiAuthenticated => self.api_authenticated,
        }
    }
}

/// Outcome of a check. `retry_after` is in whole seconds and zero when allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after: u64,
}

impl RateLimitDecision {
    const ALLOWED: Self = Self {
        allowed: true,
        retry_after: 0,
    };

    fn limited(retry_after: u64) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    policies: RateLimitPolicies,
    failure_policy: FailurePolicy,
}

fn log_key(tier: Tier, key: &str) -> String {
    format!("rate:{}:{}", tier.as_str(), key)
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        policies: RateLimitPolicies,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            store,
            clock,
            policies,
            failure_policy,
        }
    }

    /// Prune the log and decide whether one more request fits in the window.
    pub async fn check(&self, tier: Tier, key: &str) -> Result<RateLimitDecision, StoreError> {
        let policy = self.policies.get(tier);
        let window_ms = policy.window.as_millis() as u64;
        let now = self.clock.now_millis();

        // Entries exactly one window old have left it, matching the key TTL
        let live = self
            .store
            .list_prune(&log_key(tier, key), (now + 1).saturating_sub(window_ms))
            .await?;

        if live.len() < policy.max_requests {
            return Ok(RateLimitDecision::ALLOWED);
        }

        let oldest = live.first().copied().unwrap_or(now);
        let wait_ms = (oldest + window_ms).saturating_sub(now);
        Ok(RateLimitDecision::limited(wait_ms.div_ceil(1000).max(1)))
    }

    /// Append the current instant, bound the log and refresh its expiry.
    pub async fn record(&self, tier: Tier, key: &str) -> Result<(), StoreError> {
        let policy = self.policies.get(tier);
        let key = log_key(tier, key);

        self.store.list_append(&key, self.clock.now_millis()).await?;
        self.store.list_trim(&key, policy.max_requests).await?;
        self.store.expire(&key, policy.window).await?;
        Ok(())
    }

    /// Check and, when allowed, record.
    pub async fn hit(&self, tier: Tier, key: &str) -> Result<RateLimitDecision, StoreError> {
        self.hit_all(&[(tier, key)]).await
    }

    /// Check every tier first and record in all of them only if all allow.
    ///
    /// When several tiers reject, the longest wait is reported.
    pub async fn hit_all(&self, checks: &[(Tier, &str)]) -> Result<RateLimitDecision, StoreError> {
        let mut retry_after = 0;
        for (tier, key) in checks {
            let decision = self.check(*tier, key).await?;
            if !decision.allowed {
                retry_after = retry_after.max(decision.retry_after);
            }
        }
        if retry_after > 0 {
            return Ok(RateLimitDecision::limited(retry_after));
        }

        for (tier, key) in checks {
            self.record(*tier, key).await?;
        }
        Ok(RateLimitDecision::ALLOWED)
    }

    /// [`Self::hit_all`] with the failure policy applied and HTTP errors out.
    pub async fn enforce(&self, checks: &[(Tier, &str)]) -> Result<(), ApiError> {
        match self.hit_all(checks).await {
            Ok(decision) if decision.allowed => Ok(()),
            Ok(decision) => Err(ApiError::RateLimited {
                retry_after: decision.retry_after,
            }),
            Err(e) => match self.failure_policy {
                FailurePolicy::Open => {
                    warn!(error = %e, "Rate limit store unavailable, admitting request");
                    Ok(())
                }
                FailurePolicy::Closed => Err(ApiError::unavailable(
                    "Rate limiting is temporarily unavailable",
                )),
            },
        }
    }
}

/// State shared by the rate-limit middleware.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub sessions: Arc<SessionService>,
    pub ip_extractor: Option<IpExtractor>,
}

impl RateLimitState {
    fn client_ip(&self, request: &Request) -> Result<String, Response> {
        extract_client_ip(request, self.ip_extractor.as_ref())
            .map_err(|_| ApiError::forbidden("Unable to determine client IP.").into_response())
    }
}

/// Middleware for rate limiting account creation per IP.
pub async fn rate_limit_register(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = match state.client_ip(&request) {
        Ok(ip) => ip,
        Err(response) => return response,
    };

    match state.limiter.enforce(&[(Tier::Register, &ip)]).await {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Middleware for the generic API tier.
///
/// Requests with a valid, unrevoked access token are counted per principal
/// under the authenticated limit; everything else is counted per IP.
pub async fn rate_limit_api(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let principal = match bearer_token(request.headers()) {
        Ok(token) => state.sessions.authenticate(token).await.ok().map(|claims| claims.sub),
        Err(_) => None,
    };

    let (tier, key) = match principal {
        Some(sub) => (Tier::ApiAuthenticated, format!("user:{}", sub)),
        None => match state.client_ip(&request) {
            Ok(ip) => (Tier::Api, format!("ip:{}", ip)),
            Err(response) => return response,
        },
    };

    match state.limiter.enforce(&[(tier, &key)]).await {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
