//! Authentication state trait and macro.

use crate::session::SessionService;

/// Trait for state types that can authenticate bearer tokens.
pub trait HasAuthBackend {
    fn sessions(&self) -> &SessionService;
}

/// Macro to implement `HasAuthBackend` for state structs with a `sessions` field.
///
/// # Example
/// ```ignore
/// use crate::impl_has_auth_backend;
///
/// #[derive(Clone)]
/// pub struct MyState {
///     pub sessions: Arc<SessionService>,
///     // ... other fields
/// }
///
/// impl_has_auth_backend!(MyState);
/// ```
#[macro_export]
macro_rules! impl_has_auth_backend {
    ($state_type:ty) => {
        impl $crate::auth::HasAuthBackend for $state_type {
            fn sessions(&self) -> &$crate::session::SessionService {
                &self.sessions
            }
        }
    };
}
