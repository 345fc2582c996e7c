//! Session API endpoints.
//!
//! - POST `/login` - Exchange email and password for a token pair
//! - POST `/refresh` - Rotate a refresh token into a new pair
//! - POST `/logout` - Revoke the presented access token and the refresh token
//! - PUT `/password` - Change password and log out everywhere
//! - GET `/me` - Principal behind the presented access token
//! - POST `/verification-code` - Send a registration code to an email address
//! - POST `/register` - Create an account with a verification code

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    middleware,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use super::error::{ApiError, ErrorCode, ResultExt, validate_email, validate_password};
use crate::auth::{ApiAuthError, Auth, AuthErrorKind, ClientIp, HasIpExtractor, bearer_token};
use crate::cli::IpExtractor;
use crate::impl_has_auth_backend;
use crate::rate_limit::{RateLimitState, RateLimiter, Tier, rate_limit_register};
use crate::session::{Principal, Session, SessionService};
use crate::verification::{Mailer, VerificationCodes};

#[derive(Clone)]
pub struct AuthState {
    pub sessions: Arc<SessionService>,
    pub limiter: Arc<RateLimiter>,
    pub codes: VerificationCodes,
    pub mailer: Arc<dyn Mailer>,
    pub ip_extractor: Option<IpExtractor>,
    pub no_signup: bool,
}

impl_has_auth_backend!(AuthState);

impl HasIpExtractor for AuthState {
    fn ip_extractor(&self) -> Option<&IpExtractor> {
        self.ip_extractor.as_ref()
    }
}

pub fn router(state: AuthState, rate_limits: RateLimitState) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/password", put(change_password))
        .route("/me", get(me))
        .route("/verification-code", post(send_verification_code))
        .route(
            "/register",
            post(register).route_layer(middleware::from_fn_with_state(
                rate_limits,
                rate_limit_register,
            )),
        )
        .with_state(state)
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

#[derive(Deserialize)]
struct VerificationCodeRequest {
    email: String,
}

#[derive(Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    code: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    success: bool,
    access_token: String,
    refresh_token: String,
    /// Access token lifetime in seconds
    expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<Principal>,
}

impl SessionResponse {
    fn with_user(session: Session) -> Self {
        Self {
            success: true,
            access_token: session.tokens.access_token,
            refresh_token: session.tokens.refresh_token,
            expires_in: session.expires_in,
            user: Some(session.principal),
        }
    }

    fn tokens_only(session: Session) -> Self {
        Self {
            user: None,
            ..Self::with_user(session)
        }
    }
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

const OK: Json<SuccessResponse> = Json(SuccessResponse { success: true });

#[derive(Serialize)]
struct MeResponse {
    success: bool,
    user: Principal,
}

/// Rate limited per email, or per IP when no email was sent.
async fn login(
    State(state): State<AuthState>,
    ClientIp(ip): ClientIp,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let email = payload.email.trim().to_lowercase();

    let key = if email.is_empty() {
        ip.ok_or_else(|| ApiError::forbidden("Unable to determine client IP."))?
    } else {
        email.clone()
    };
    state.limiter.enforce(&[(Tier::Login, &key)]).await?;

    if email.is_empty() || payload.password.is_empty() {
        return Err(ApiError::bad_request("Email and password are required"));
    }

    let session = state.sessions.login(&email, &payload.password).await?;
    Ok(Json(SessionResponse::with_user(session)))
}

async fn refresh(
    State(state): State<AuthState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.sessions.refresh(&payload.refresh_token).await?;
    Ok(Json(SessionResponse::tokens_only(session)))
}

/// Takes the raw bearer token rather than [`Auth`] so that a client idle past
/// the access token's expiry can still revoke its refresh token.
async fn logout(
    State(state): State<AuthState>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, ApiAuthError> {
    let token = bearer_token(&headers)?;
    state
        .sessions
        .logout(token)
        .await
        .map_err(AuthErrorKind::from)?;
    Ok(OK)
}

async fn change_password(
    State(state): State<AuthState>,
    Auth(auth): Auth,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    validate_password(&payload.new_password)?;

    state
        .sessions
        .change_password(
            auth.id(),
            &payload.old_password,
            &payload.new_password,
            Some(&auth.token),
        )
        .await?;

    Ok(OK)
}

async fn me(Auth(auth): Auth) -> Json<MeResponse> {
    Json(MeResponse {
        success: true,
        user: Principal {
            id: auth.claims.sub,
            email: auth.claims.email,
            role: auth.claims.role,
        },
    })
}

/// Limited per email (burst and hourly) and per IP.
async fn send_verification_code(
    State(state): State<AuthState>,
    ClientIp(ip): ClientIp,
    Json(payload): Json<VerificationCodeRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if state.no_signup {
        return Err(ApiError::forbidden("Signups are disabled"));
    }

    let email = validate_email(&payload.email)?;
    let ip = ip.ok_or_else(|| ApiError::forbidden("Unable to determine client IP."))?;

    state
        .limiter
        .enforce(&[
            (Tier::VerificationCodeBurst, &email),
            (Tier::VerificationCodeHourly, &email),
            (Tier::VerificationCodeIp, &ip),
        ])
        .await?;

    let code = state
        .codes
        .issue(&email)
        .await
        .store_err("Failed to store verification code")?;

    state
        .mailer
        .send_verification_code(&email, &code)
        .await
        .map_err(|e| {
            error!(email = %email, error = %e, "Failed to send verification code");
            ApiError::internal("Failed to send verification code")
        })?;

    Ok(OK)
}

async fn register(
    State(state): State<AuthState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if state.no_signup {
        return Err(ApiError::forbidden("Signups are disabled"));
    }

    let email = validate_email(&payload.email)?;
    validate_password(&payload.password)?;

    let valid = state
        .codes
        .consume(&email, payload.code.trim())
        .await
        .store_err("Failed to check verification code")?;
    if !valid {
        return Err(ApiError::BadRequest(
            ErrorCode::InvalidVerificationCode,
            "Verification code is invalid or has expired".into(),
        ));
    }

    let session = state.sessions.register(&email, &payload.password).await?;
    info!(email = %email, "Registration completed");
    Ok(Json(SessionResponse::with_user(session)))
}
