//! Bearer-token authentication.
//!
//! Access tokens arrive in the `Authorization` header and are checked for
//! format, signature, expiry and revocation, in that order.

mod bearer;
mod errors;
mod extractors;
mod ip;
mod state;
mod types;

pub use bearer::bearer_token;
pub use errors::{ApiAuthError, AuthErrorKind};
pub use extractors::Auth;
pub use ip::{ClientIp, HasIpExtractor, extract_client_ip};
pub use state::HasAuthBackend;
pub use types::AuthenticatedPrincipal;
