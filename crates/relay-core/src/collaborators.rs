//! Boundaries to external collaborators.
//!
//! Identity, authorization and error reporting live outside the connection
//! layer. These traits let the host supply them without the core depending
//! on any particular session store or policy engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::{ConnectionId, Principal};
use crate::error::RelayError;

/// Access requirement attached to a call registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclRequirement {
    /// Any authenticated principal.
    Authenticated,
    /// Only connections without a principal.
    Anonymous,
    /// A principal in at least one of the listed groups.
    Groups(Vec<String>),
}

/// Re-validates a principal before it is used for a call or route.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Return the current view of `principal`, or an error if it is no
    /// longer valid.
    async fn refresh(&self, principal: &Principal) -> Result<Principal, RelayError>;
}

/// Decides whether a principal satisfies a requirement.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize(
        &self,
        principal: Option<&Principal>,
        requirement: &AclRequirement,
    ) -> Result<bool, RelayError>;
}

/// A failed handler invocation, as seen by an [`ErrorReporter`].
#[derive(Debug, Clone)]
pub struct CallFault {
    pub path: String,
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    pub message: String,
}

/// Optional hook told about every handler fault.
///
/// Returning a payload sends it to the caller as the correlated reply;
/// returning `None` keeps the failure silent.
#[async_trait]
pub trait ErrorReporter: Send + Sync + 'static {
    async fn report(&self, fault: &CallFault) -> Option<Value>;
}

/// Identity provider that trusts the principal captured at connect time.
#[derive(Debug, Default, Clone)]
pub struct PassthroughIdentity;

#[async_trait]
impl IdentityProvider for PassthroughIdentity {
    async fn refresh(&self, principal: &Principal) -> Result<Principal, RelayError> {
        Ok(principal.clone())
    }
}

/// Authorizer that evaluates requirements against principal groups.
#[derive(Debug, Default, Clone)]
pub struct GroupAuthorizer;

#[async_trait]
impl Authorizer for GroupAuthorizer {
    async fn authorize(
        &self,
        principal: Option<&Principal>,
        requirement: &AclRequirement,
    ) -> Result<bool, RelayError> {
        Ok(match (requirement, principal) {
            (AclRequirement::Authenticated, principal) => principal.is_some(),
            (AclRequirement::Anonymous, principal) => principal.is_none(),
            (AclRequirement::Groups(groups), Some(principal)) => {
                groups.iter().any(|g| principal.in_group(g))
            }
            (AclRequirement::Groups(_), None) => false,
        })
    }
}

/// Error reporter that replies with a generic error object.
#[derive(Debug, Default, Clone)]
pub struct ReplyingErrorReporter;

#[async_trait]
impl ErrorReporter for ReplyingErrorReporter {
    async fn report(&self, fault: &CallFault) -> Option<Value> {
        Some(serde_json::json!({
            "error": {
                "path": fault.path,
                "message": "internal error",
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_authorizer() {
        let authorizer = GroupAuthorizer;
        let admin = Principal::new("alice").with_groups(["admin"]);
        let guest = Principal::new("bob");

        let admins = AclRequirement::Groups(vec!["admin".into(), "owner".into()]);
        assert!(authorizer.authorize(Some(&admin), &admins).await.unwrap());
        assert!(!authorizer.authorize(Some(&guest), &admins).await.unwrap());
        assert!(!authorizer.authorize(None, &admins).await.unwrap());

        let authenticated = AclRequirement::Authenticated;
        assert!(authorizer.authorize(Some(&guest), &authenticated).await.unwrap());
        assert!(!authorizer.authorize(None, &authenticated).await.unwrap());

        let anonymous = AclRequirement::Anonymous;
        assert!(authorizer.authorize(None, &anonymous).await.unwrap());
        assert!(!authorizer.authorize(Some(&guest), &anonymous).await.unwrap());
    }

    #[tokio::test]
    async fn test_passthrough_identity() {
        let principal = Principal::new("carol").with_groups(["staff"]);
        let refreshed = PassthroughIdentity.refresh(&principal).await.unwrap();
        assert_eq!(refreshed, principal);
    }
}
