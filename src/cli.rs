//! CLI argument parsing, validation, and startup helpers.

use crate::ServerConfig;
use crate::clock::{Clock, SystemClock};
use crate::db::{Database, UserRole};
use crate::jwt::TokenSettings;
use crate::rate_limit::RateLimitPolicies;
use crate::session::AccountDirectory;
use crate::store::{FailurePolicy, MemoryStore, Store};
use crate::verification::LogMailer;
use clap::Parser;
use rand::{Rng, distr::Alphanumeric};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const MIN_SECRET_LENGTH: usize = 32;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Where sessions, revocations and rate-limit logs are kept.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// Tables in the SQLite database
    #[default]
    Sqlite,
    /// Process memory, lost on restart
    Memory,
    /// Shared Redis instance (requires the `redis` feature)
    Redis,
}

/// Proxy header carrying the client IP.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientIpHeader {
    /// Last entry of X-Forwarded-For (the address the proxy saw)
    XForwardedFor,
    XRealIp,
    CfConnectingIp,
}

/// Reads the client IP from a trusted proxy header.
#[derive(Clone, Debug)]
pub struct IpExtractor {
    pub header_name: &'static str,
    parse: fn(&str) -> Result<String, &'static str>,
}

impl IpExtractor {
    pub fn extract(&self, header_value: &str) -> Result<String, &'static str> {
        (self.parse)(header_value)
    }
}

fn parse_single_ip(value: &str) -> Result<String, &'static str> {
    value
        .trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| "IP header does not contain a valid address")
}

fn parse_forwarded_for(value: &str) -> Result<String, &'static str> {
    let last = value
        .rsplit(',')
        .next()
        .ok_or("IP header is empty")?;
    parse_single_ip(last)
}

impl From<ClientIpHeader> for IpExtractor {
    fn from(header: ClientIpHeader) -> Self {
        match header {
            ClientIpHeader::XForwardedFor => IpExtractor {
                header_name: "x-forwarded-for",
                parse: parse_forwarded_for,
            },
            ClientIpHeader::XRealIp => IpExtractor {
                header_name: "x-real-ip",
                parse: parse_single_ip,
            },
            ClientIpHeader::CfConnectingIp => IpExtractor {
                header_name: "cf-connecting-ip",
                parse: parse_single_ip,
            },
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "inkpost",
    about = "Blog CMS session and admission-control server"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "7291")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, default_value = "inkpost.db")]
    pub database: String,

    /// Backend for refresh tokens, the revocation list and rate-limit logs
    #[arg(long, value_enum, default_value = "sqlite")]
    pub store: StoreBackend,

    /// Redis connection URL, used with --store redis
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Maximum Redis connections
    #[arg(long, default_value = "16")]
    pub redis_pool_size: usize,

    /// Store operation timeout in milliseconds
    #[arg(long, default_value = "2000")]
    pub store_timeout_ms: u64,

    /// Path to file containing the access token secret. Prefer the ACCESS_TOKEN_SECRET env var
    #[arg(long)]
    pub access_secret_file: Option<String>,

    /// Path to file containing the refresh token secret. Prefer the REFRESH_TOKEN_SECRET env var
    #[arg(long)]
    pub refresh_secret_file: Option<String>,

    /// Access token lifetime in seconds
    #[arg(long, default_value = "1800")]
    pub access_ttl: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, default_value = "604800")]
    pub refresh_ttl: u64,

    /// Reject requests with 503 when the store cannot answer revocation or rate-limit checks
    #[arg(long)]
    pub fail_closed: bool,

    /// Disable new account registration (admin creation via --create-admin still works)
    #[arg(long)]
    pub no_signup: bool,

    /// Read the client IP from this proxy header instead of the socket address
    #[arg(long, value_enum)]
    pub client_ip_header: Option<ClientIpHeader>,

    /// Create an admin account with this email (or promote an existing one) and exit
    #[arg(long)]
    pub create_admin: Option<String>,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load one secret from an environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
fn load_secret(env_var: &str, file: Option<&str>, flag: &str) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var(env_var) {
        // SAFETY: called during single-threaded startup before the runtime spawns
        // tasks that could read the environment.
        unsafe { std::env::remove_var(env_var) };
        secret
    } else if let Some(path) = file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read secret file");
                return None;
            }
        }
    } else {
        error!(
            "{} is required. Set the environment variable (recommended) or use {}",
            env_var, flag
        );
        return None;
    };

    Some(secret)
}

/// Secrets must be long enough and must not be shared between token kinds.
pub fn validate_secrets(access: &str, refresh: &str) -> Result<(), String> {
    if access.len() < MIN_SECRET_LENGTH || refresh.len() < MIN_SECRET_LENGTH {
        return Err(format!(
            "Token secrets must be at least {} characters",
            MIN_SECRET_LENGTH
        ));
    }
    if access == refresh {
        return Err("Access and refresh token secrets must differ".to_string());
    }
    Ok(())
}

/// Load both token secrets, logging what went wrong on failure.
pub fn load_secrets(args: &Args) -> Option<(String, String)> {
    let access = load_secret(
        "ACCESS_TOKEN_SECRET",
        args.access_secret_file.as_deref(),
        "--access-secret-file",
    )?;
    let refresh = load_secret(
        "REFRESH_TOKEN_SECRET",
        args.refresh_secret_file.as_deref(),
        "--refresh-secret-file",
    )?;

    if let Err(e) = validate_secrets(&access, &refresh) {
        error!("{}", e);
        return None;
    }
    Some((access, refresh))
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}

/// Open the configured store backend.
pub async fn open_store(args: &Args, db: &Database, clock: Arc<dyn Clock>) -> Option<Arc<dyn Store>> {
    match args.store {
        StoreBackend::Sqlite => Some(Arc::new(db.store_with_clock(clock))),
        StoreBackend::Memory => {
            warn!("Using in-memory store; sessions are lost on restart and not shared between instances");
            Some(Arc::new(MemoryStore::with_clock(clock)))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let timeout = Duration::from_millis(args.store_timeout_ms);
            match crate::store::redis::RedisStore::connect(
                &args.redis_url,
                args.redis_pool_size,
                timeout,
            )
            .await
            {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    error!(error = %e, "Failed to connect to Redis");
                    None
                }
            }
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            error!("This build does not include Redis support (enable the `redis` feature)");
            None
        }
    }
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Handle --create-admin: create a new admin or promote an existing account.
pub async fn handle_create_admin(db: &Database, email: &str) -> Result<(), String> {
    let email = email.trim().to_lowercase();

    let existing = db
        .users()
        .get_by_email(&email)
        .await
        .map_err(|e| format!("Failed to look up account: {}", e))?;

    if let Some(user) = existing {
        db.users()
            .set_role(&user.uuid, UserRole::Admin)
            .await
            .map_err(|e| format!("Failed to promote account: {}", e))?;
        println!();
        println!("Existing account promoted to admin: {}", email);
        println!();
        return Ok(());
    }

    let password = generate_password();
    db.create_account(&email, &password, UserRole::Admin)
        .await
        .map_err(|e| format!("Failed to create admin account: {}", e))?;

    println!();
    println!("Admin account created: {}", email);
    println!("Password: {}", password);
    println!();
    Ok(())
}

/// Build ServerConfig from validated arguments.
pub fn build_config(
    args: &Args,
    db: Database,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    access_secret: String,
    refresh_secret: String,
) -> ServerConfig {
    let mut tokens = TokenSettings::new(access_secret.as_bytes(), refresh_secret.as_bytes());
    tokens.access_ttl = Duration::from_secs(args.access_ttl);
    tokens.refresh_ttl = Duration::from_secs(args.refresh_ttl);

    ServerConfig {
        db,
        store,
        clock,
        tokens,
        rate_limits: RateLimitPolicies::default(),
        failure_policy: if args.fail_closed {
            FailurePolicy::Closed
        } else {
            FailurePolicy::Open
        },
        mailer: Arc::new(LogMailer),
        ip_extractor: args.client_ip_header.map(IpExtractor::from),
        no_signup: args.no_signup,
    }
}

/// The wall clock used by the server binary.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
