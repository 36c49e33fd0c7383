use uuid::Uuid;

use crate::error::AuthError;

/// Verified session state handed in by the authentication layer.
///
/// Credential verification happens upstream; by the time a `Session` exists
/// the user is authenticated and `memberships` lists every organization the
/// user is a verified member of. `selected_org` is only populated when the
/// caller made an explicit organization selection (e.g. an org switcher).
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Uuid,
    pub memberships: Vec<Uuid>,
    pub selected_org: Option<Uuid>,
}

impl Session {
    pub fn new(user_id: Uuid, memberships: Vec<Uuid>) -> Self {
        Self { user_id, memberships, selected_org: None }
    }

    pub fn with_selected_org(mut self, org_id: Uuid) -> Self {
        self.selected_org = Some(org_id);
        self
    }
}

/// Immutable per-request tenant context.
///
/// Constructed exactly once per unit of work via [`TenantContext::resolve`]
/// and passed explicitly through every call boundary. The fields are private
/// so nothing downstream can overwrite the org after construction, and there
/// is deliberately no `Default` and no way to build one from request input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    org_id: Uuid,
    user_id: Uuid,
}

impl TenantContext {
    /// Resolve a verified session to exactly one organization.
    ///
    /// A user with several memberships must have made an explicit selection;
    /// no default organization is ever inferred.
    pub fn resolve(session: &Session) -> Result<Self, AuthError> {
        if session.memberships.is_empty() {
            return Err(AuthError::NoOrganization);
        }

        let org_id = match (session.selected_org, session.memberships.len()) {
            (Some(selected), _) => {
                if !session.memberships.contains(&selected) {
                    return Err(AuthError::NotAMember(selected));
                }
                selected
            }
            (None, 1) => session.memberships[0],
            (None, count) => return Err(AuthError::AmbiguousOrganization { count }),
        };

        Ok(Self { org_id, user_id: session.user_id })
    }

    pub fn org_id(&self) -> Uuid {
        self.org_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn resolves_single_membership_without_selection() {
        let org = uid();
        let session = Session::new(uid(), vec![org]);
        let ctx = TenantContext::resolve(&session).unwrap();
        assert_eq!(ctx.org_id(), org);
        assert_eq!(ctx.user_id(), session.user_id);
    }

    #[test]
    fn empty_memberships_is_no_organization() {
        let session = Session::new(uid(), vec![]);
        assert_eq!(TenantContext::resolve(&session), Err(AuthError::NoOrganization));
    }

    #[test]
    fn multiple_memberships_require_explicit_selection() {
        let session = Session::new(uid(), vec![uid(), uid(), uid()]);
        assert_eq!(
            TenantContext::resolve(&session),
            Err(AuthError::AmbiguousOrganization { count: 3 })
        );
    }

    #[test]
    fn explicit_selection_picks_among_memberships() {
        let a = uid();
        let b = uid();
        let session = Session::new(uid(), vec![a, b]).with_selected_org(b);
        assert_eq!(TenantContext::resolve(&session).unwrap().org_id(), b);
    }

    #[test]
    fn selection_outside_memberships_is_rejected() {
        let outsider = uid();
        let session = Session::new(uid(), vec![uid()]).with_selected_org(outsider);
        assert_eq!(
            TenantContext::resolve(&session),
            Err(AuthError::NotAMember(outsider))
        );
    }

    #[test]
    fn selection_outside_memberships_rejected_even_with_one_membership_empty() {
        // A forged selection with zero memberships still fails closed.
        let session = Session::new(uid(), vec![]).with_selected_org(uid());
        assert_eq!(TenantContext::resolve(&session), Err(AuthError::NoOrganization));
    }
}
