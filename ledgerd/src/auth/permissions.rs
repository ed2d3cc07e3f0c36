//! Role-based authorization for API handlers.
//!
//! Handlers declare the permission they need through the [`RequiresPermission`]
//! extractor, which authenticates the request (via [`CurrentUser`]) and then
//! checks the user's roles against the declared resource/operation pair:
//!
//! ```rust,ignore
//! pub async fn grant_credits(
//!     State(state): State<AppState>,
//!     _perm: RequiresPermission<resource::Credits, operation::CreateAll>,
//!     ...
//! ) -> Result<Json<EntryResponse>> { ... }
//! ```
//!
//! The extractor derefs to the authenticated [`CurrentUser`], so handlers that
//! need the caller's identity can use it directly. Handlers that serve both
//! "own" and "all" scopes declare the weaker `*Own` permission and widen with
//! [`can_read_all_resources`] / [`has_permission`] at runtime.

use std::marker::PhantomData;
use std::ops::Deref;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::AppState;
use crate::api::models::users::{CurrentUser, Role};
use crate::errors::Error;
use crate::types::{Operation, Permission, Resource};

/// Marker types for the resources declared in handler signatures.
pub mod resource {
    pub struct Users;
    pub struct Credits;
    pub struct Plans;
    pub struct ReferralCodes;
    pub struct Jobs;
    pub struct System;
}

/// Marker types for the operations declared in handler signatures.
pub mod operation {
    pub struct CreateAll;
    pub struct CreateOwn;
    pub struct ReadAll;
    pub struct ReadOwn;
    pub struct UpdateAll;
    pub struct UpdateOwn;
    pub struct DeleteAll;
    pub struct DeleteOwn;
    pub struct SystemAccess;
}

/// Maps a marker type from [`resource`] to its [`Resource`] value.
pub trait ResourceMarker {
    const RESOURCE: Resource;
}

/// Maps a marker type from [`operation`] to its [`Operation`] value.
pub trait OperationMarker {
    const OPERATION: Operation;
}

macro_rules! resource_marker {
    ($($marker:ident => $value:ident),* $(,)?) => {
        $(impl ResourceMarker for resource::$marker {
            const RESOURCE: Resource = Resource::$value;
        })*
    };
}

macro_rules! operation_marker {
    ($($marker:ident),* $(,)?) => {
        $(impl OperationMarker for operation::$marker {
            const OPERATION: Operation = Operation::$marker;
        })*
    };
}

resource_marker! {
    Users => Users,
    Credits => Credits,
    Plans => Plans,
    ReferralCodes => ReferralCodes,
    Jobs => Jobs,
    System => System,
}

operation_marker! {
    CreateAll, CreateOwn, ReadAll, ReadOwn,
    UpdateAll, UpdateOwn, DeleteAll, DeleteOwn,
    SystemAccess,
}

impl<R: ResourceMarker> From<R> for Resource {
    fn from(_: R) -> Resource {
        R::RESOURCE
    }
}

impl<O: OperationMarker> From<O> for Operation {
    fn from(_: O) -> Operation {
        O::OPERATION
    }
}

/// Extractor that authenticates the caller and requires a specific permission.
///
/// Rejects with 401 if no authentication method succeeds and 403 if the
/// authenticated user's roles do not grant the declared permission.
pub struct RequiresPermission<R, O> {
    user: CurrentUser,
    _marker: PhantomData<(R, O)>,
}

impl<R, O> Deref for RequiresPermission<R, O> {
    type Target = CurrentUser;

    fn deref(&self) -> &CurrentUser {
        &self.user
    }
}

impl<R, O> FromRequestParts<AppState> for RequiresPermission<R, O>
where
    R: ResourceMarker + Send,
    O: OperationMarker + Send,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;

        if !has_permission(&user, R::RESOURCE, O::OPERATION) {
            return Err(Error::InsufficientPermissions {
                required: Permission::Allow(R::RESOURCE, O::OPERATION),
                action: O::OPERATION,
                resource: format!("{:?}", R::RESOURCE),
            });
        }

        Ok(Self {
            user,
            _marker: PhantomData,
        })
    }
}

/// Returns true if any of the user's roles grants `operation` on `resource`.
///
/// Admin accounts bypass the role table entirely.
pub fn has_permission(user: &CurrentUser, resource: Resource, operation: Operation) -> bool {
    if user.is_admin {
        return true;
    }
    user.roles.iter().any(|role| role_allows(*role, resource, operation))
}

/// Shorthand for the common "can this user see everyone's rows?" check used
/// by list endpoints that serve both admin and self-service scopes.
pub fn can_read_all_resources(user: &CurrentUser, resource: Resource) -> bool {
    has_permission(user, resource, Operation::ReadAll)
}

// The static role table. Kept as a single match so a reviewer can audit the
// whole policy in one place.
fn role_allows(role: Role, resource: Resource, operation: Operation) -> bool {
    use Operation::*;
    use Resource::*;

    match role {
        // Full control over every surface, including reconciliation.
        Role::PlatformManager => true,

        // Owns the billing domain: ledger, plans and referral programs, plus
        // read access to the users they belong to. System surfaces stay with
        // platform managers.
        Role::BillingManager => match resource {
            Credits | Plans | ReferralCodes => true,
            Users | Jobs => matches!(operation, ReadAll | ReadOwn),
            System => false,
        },

        // Read-only view for support staff. No system surfaces.
        Role::SupportViewer => match resource {
            System => false,
            _ => matches!(operation, ReadAll | ReadOwn),
        },

        // Self-service: a standard user manages their own credits, jobs and
        // referral redemptions, and can see their own plan.
        Role::StandardUser => matches!(
            (resource, operation),
            (Credits, ReadOwn | CreateOwn)
                | (Plans, ReadOwn)
                | (Jobs, CreateOwn | ReadOwn | UpdateOwn)
                | (ReferralCodes, ReadOwn | UpdateOwn)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user_with_roles(roles: Vec<Role>) -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            username: "test".to_string(),
            email: "test@example.com".to_string(),
            is_admin: false,
            roles,
            display_name: None,
            avatar_url: None,
        }
    }

    #[test]
    fn admin_flag_bypasses_roles() {
        let mut user = user_with_roles(vec![]);
        user.is_admin = true;
        assert!(has_permission(&user, Resource::System, Operation::SystemAccess));
        assert!(has_permission(&user, Resource::Credits, Operation::CreateAll));
    }

    #[test]
    fn standard_user_is_scoped_to_own_resources() {
        let user = user_with_roles(vec![Role::StandardUser]);
        assert!(has_permission(&user, Resource::Credits, Operation::ReadOwn));
        assert!(has_permission(&user, Resource::Jobs, Operation::CreateOwn));
        assert!(!has_permission(&user, Resource::Credits, Operation::ReadAll));
        assert!(!has_permission(&user, Resource::Credits, Operation::CreateAll));
        assert!(!has_permission(&user, Resource::Users, Operation::ReadAll));
        assert!(!has_permission(&user, Resource::System, Operation::SystemAccess));
    }

    #[test]
    fn billing_manager_owns_ledger_but_not_user_admin() {
        let user = user_with_roles(vec![Role::BillingManager]);
        assert!(has_permission(&user, Resource::Credits, Operation::CreateAll));
        assert!(has_permission(&user, Resource::Plans, Operation::UpdateAll));
        assert!(has_permission(&user, Resource::ReferralCodes, Operation::CreateAll));
        assert!(has_permission(&user, Resource::Users, Operation::ReadAll));
        assert!(!has_permission(&user, Resource::System, Operation::SystemAccess));
        assert!(!has_permission(&user, Resource::Users, Operation::UpdateAll));
        assert!(!has_permission(&user, Resource::Jobs, Operation::UpdateAll));
    }

    #[test]
    fn support_viewer_is_read_only() {
        let user = user_with_roles(vec![Role::SupportViewer]);
        assert!(has_permission(&user, Resource::Credits, Operation::ReadAll));
        assert!(has_permission(&user, Resource::Jobs, Operation::ReadAll));
        assert!(!has_permission(&user, Resource::Credits, Operation::CreateAll));
        assert!(!has_permission(&user, Resource::System, Operation::SystemAccess));
    }

    #[test]
    fn roles_accumulate() {
        let user = user_with_roles(vec![Role::StandardUser, Role::SupportViewer]);
        assert!(has_permission(&user, Resource::Jobs, Operation::CreateOwn));
        assert!(has_permission(&user, Resource::Users, Operation::ReadAll));
    }

}
