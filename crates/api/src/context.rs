use jobforge_core::{OrganizationId, UserId};

/// Organization context for a request.
///
/// This is immutable and must be present for all job routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OrgContext {
    organization_id: OrganizationId,
}

impl OrgContext {
    pub fn new(organization_id: OrganizationId) -> Self {
        Self { organization_id }
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }
}

/// Principal context for a request (authenticated identity).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    user_id: UserId,
}

impl PrincipalContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
