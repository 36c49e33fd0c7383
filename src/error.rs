use thiserror::Error;
use uuid::Uuid;

/// Errors from resolving a session into a tenant context.
///
/// These are recoverable by re-authentication (or an explicit organization
/// selection) and surface to callers as "forbidden".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("session has no resolvable organization")]
    NoOrganization,

    #[error("user belongs to {count} organizations; explicit selection required")]
    AmbiguousOrganization { count: usize },

    #[error("selected organization {0} is not among the session's memberships")]
    NotAMember(Uuid),
}

/// Errors from the isolation core itself.
///
/// `Binding` and `PolicyGap` abort the whole unit of work before any
/// tenant-scoped statement runs. They must never be downgraded to an empty
/// result set by callers.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to bind session org: {0}")]
    Binding(#[source] sqlx::Error),

    #[error("tenant-scoped table '{table}' has no active row policy")]
    PolicyGap { table: String },

    #[error("isolation violation on '{table}': {detail}")]
    Violation { table: String, detail: String },

    #[error("not a tenant-scoped table: {0}")]
    UnknownTable(String),

    #[error("query error: {0}")]
    Query(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl IsolationError {
    /// True for errors that must gate a release rather than be retried.
    pub fn is_release_blocking(&self) -> bool {
        matches!(
            self,
            IsolationError::PolicyGap { .. } | IsolationError::Violation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_gap_and_violation_block_release() {
        let gap = IsolationError::PolicyGap { table: "customers".into() };
        let violation = IsolationError::Violation {
            table: "jobs".into(),
            detail: "3 rows visible under empty binding".into(),
        };
        assert!(gap.is_release_blocking());
        assert!(violation.is_release_blocking());
        assert!(!IsolationError::Auth(AuthError::NoOrganization).is_release_blocking());
    }

    #[test]
    fn auth_errors_render_for_callers() {
        let err = AuthError::AmbiguousOrganization { count: 3 };
        assert_eq!(
            err.to_string(),
            "user belongs to 3 organizations; explicit selection required"
        );
    }
}
