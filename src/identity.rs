use crate::{
    error::{AppError, AppResult},
    models::UserId,
};

/// Source of the caller's identity
///
/// Credential issuance lives elsewhere; the services only need a stable
/// user id or a refusal.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> AppResult<UserId>;
}

/// Identity fixed at construction, e.g. resolved once per request
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<UserId>,
}

impl StaticIdentity {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> AppResult<UserId> {
        self.user_id.clone().ok_or(AppError::Unauthenticated)
    }
}

/// Fails unless the caller is `user_id`
pub fn require_user(identity: &dyn IdentityProvider, user_id: &UserId) -> AppResult<()> {
    let current = identity.current_user_id()?;
    if &current != user_id {
        return Err(AppError::PermissionDenied(format!(
            "user {} cannot access the watchlist of {}",
            current, user_id
        )));
    }
    Ok(())
}
