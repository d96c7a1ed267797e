use crate::claims::Claims;
use crate::Error;

/// Permissions gating the casting-agency API's operations.
pub mod casting {
    pub const GET_ACTORS: &str = "get:actors";
    pub const GET_MOVIES: &str = "get:movies";
    pub const ADD_ACTOR: &str = "add:actor";
    pub const ADD_MOVIE: &str = "add:movie";
    pub const UPDATE_ACTOR: &str = "update:actor";
    pub const UPDATE_MOVIE: &str = "update:movie";
    pub const DELETE_ACTOR: &str = "delete:actor";
    pub const DELETE_MOVIE: &str = "delete:movie";
}

/// A validated token that does not carry a required permission.
///
/// Names only the missing permission and the subject, for audit logging. What the subject does hold is not exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDenied {
    pub permission: String,
    pub subject: String,
}

impl From<PermissionDenied> for Error {
    fn from(denied: PermissionDenied) -> Self {
        Error::InsufficientPermission {
            permission: denied.permission,
            subject: denied.subject,
        }
    }
}

/// Checks that `claims` grant `required_permission`.
///
/// A token without any permissions is valid but authorizes nothing.
pub fn enforce(claims: &Claims, required_permission: &str) -> Result<(), PermissionDenied> {
    if claims.has_permission(required_permission) {
        Ok(())
    } else {
        Err(PermissionDenied {
            permission: required_permission.to_string(),
            subject: claims.subject().to_string(),
        })
    }
}
