// [[AVIARY]]/apps/control-plane/src/auth.rs
// Purpose: Identity extraction from the authenticating façade's headers.
// Architecture: API Guard Layer
// Dependencies: Axum

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};
use uuid::Uuid;

use crate::error::ControlError;

// The façade terminates JWTs and forwards the verified identity in these
// headers. The control plane never sees raw tokens.
pub const USER_HEADER: &str = "x-aviary-user-id";
pub const ADMIN_HEADER: &str = "x-aviary-admin";

pub struct AuthSession {
    pub user_id: Uuid,
    pub admin: bool,
}

impl AuthSession {
    pub fn can_manage(&self, owner_id: Uuid) -> bool {
        self.admin || self.user_id == owner_id
    }

    pub fn require_owner(&self, owner_id: Uuid) -> Result<(), ControlError> {
        if self.can_manage(owner_id) {
            Ok(())
        } else {
            Err(ControlError::PermissionDenied)
        }
    }

    pub fn require_admin(&self) -> Result<(), ControlError> {
        if self.admin {
            Ok(())
        } else {
            Err(ControlError::PermissionDenied)
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthSession
where
    S: Send + Sync,
{
    type Rejection = ControlError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or(ControlError::Unauthorized)?;

        let admin = parts
            .headers
            .get(ADMIN_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(AuthSession { user_id, admin })
    }
}
