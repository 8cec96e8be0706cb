use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::convert::Infallible;

use crate::{
    error::{AppError, AppResult},
    identity::IdentityProvider,
    models::UserId,
};

/// Header the upstream auth layer fills with the verified user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity taken from the request headers
///
/// Extraction never fails; an absent or unusable header yields an
/// anonymous caller and the services answer `Unauthenticated`.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    user_id: Option<UserId>,
}

impl IdentityProvider for HeaderIdentity {
    fn current_user_id(&self) -> AppResult<UserId> {
        self.user_id.clone().ok_or(AppError::Unauthenticated)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for HeaderIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| UserId::new(s.trim()).ok());

        Ok(Self { user_id })
    }
}
