use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::errors::ServiceError;

pub mod carrier_webhooks;
pub mod gateway_callbacks;
pub mod health;
pub mod orders;
pub mod outbox_admin;
pub mod shipments;
pub mod stock;

/// Header carrying the authenticated caller's id, set by the edge proxy.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the caller's role. Absent means `customer`.
pub const USER_ROLE_HEADER: &str = "x-user-role";

const ROLE_ADMIN: &str = "admin";
const ROLE_CUSTOMER: &str = "customer";

/// Caller identity as relayed by the gateway in front of this service.
///
/// The proxy strips these headers from external traffic and re-adds them
/// after authentication, so the values are trusted as-is here. A request
/// without an `x-user-id` header is anonymous; most endpoints reject it,
/// webhooks and health checks ignore it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub role: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case(ROLE_ADMIN)
    }

    pub fn require_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "This endpoint requires the admin role".to_string(),
            ))
        }
    }

    pub fn require_user_id(&self) -> Result<Uuid, ServiceError> {
        self.user_id.ok_or_else(|| {
            ServiceError::Unauthorized(format!("An {} header is required", USER_ID_HEADER))
        })
    }

    /// Admins see every order; customers only their own.
    pub fn authorize_order(&self, customer_id: Uuid) -> Result<(), ServiceError> {
        if self.is_admin() {
            return Ok(());
        }
        let user_id = self.require_user_id()?;
        if user_id == customer_id {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "Order belongs to another customer".to_string(),
            ))
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = match parts.headers.get(USER_ID_HEADER) {
            Some(value) => {
                let raw = value.to_str().map_err(|_| {
                    ServiceError::Unauthorized(format!(
                        "The {} header is not valid UTF-8",
                        USER_ID_HEADER
                    ))
                })?;
                let parsed = Uuid::parse_str(raw).map_err(|_| {
                    ServiceError::Unauthorized(format!(
                        "The {} header is not a valid UUID",
                        USER_ID_HEADER
                    ))
                })?;
                Some(parsed)
            }
            None => None,
        };

        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|role| role.trim().to_ascii_lowercase())
            .filter(|role| !role.is_empty())
            .unwrap_or_else(|| ROLE_CUSTOMER.to_string());

        Ok(Identity { user_id, role })
    }
}
