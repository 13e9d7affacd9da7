//! The security principal accompanying every operation. Contexts are created
//! per-request by the transport and flow through all calls; they are never
//! mutated after construction.

use errors::ErrorMetadata;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub auth_token: Option<String>,
    pub user: Option<String>,
    pub tenant: Option<String>,
    pub roles: Vec<String>,
    pub is_admin: bool,
    pub read_only: bool,
    show_deleted: bool,
}

impl RequestContext {
    /// Identity confirmed by the upstream auth filter. The `Admin` role
    /// elevates `is_admin`.
    pub fn from_confirmed_identity(
        auth_token: String,
        user: Option<String>,
        tenant: Option<String>,
        roles: Vec<String>,
    ) -> Self {
        let is_admin = roles.iter().any(|r| r.eq_ignore_ascii_case(ADMIN_ROLE));
        Self {
            auth_token: Some(auth_token),
            user,
            tenant,
            roles,
            is_admin,
            read_only: false,
            show_deleted: false,
        }
    }

    /// A token was presented but the auth filter did not confirm it.
    pub fn unconfirmed_identity() -> anyhow::Result<Self> {
        anyhow::bail!(ErrorMetadata::unauthenticated(
            "IdentityNotConfirmed",
            "An auth token was supplied but its identity status is not confirmed",
        ))
    }

    /// No auth token at all: an un-gated deployment. Everything is permitted.
    pub fn anonymous() -> Self {
        Self {
            auth_token: None,
            user: None,
            tenant: None,
            roles: Vec::new(),
            is_admin: true,
            read_only: false,
            show_deleted: false,
        }
    }

    pub fn with_show_deleted(mut self, show_deleted: bool) -> Self {
        self.show_deleted = show_deleted;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// The owner to correlate with an image.
    pub fn owner(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Admins can see deleted by default.
    pub fn show_deleted(&self) -> bool {
        self.show_deleted || self.is_admin
    }

    /// Whether this context explicitly asked for deleted rows, ignoring the
    /// admin default. Listing filters use this to distinguish "admin who
    /// didn't ask" from "caller who did".
    pub fn requested_show_deleted(&self) -> bool {
        self.show_deleted
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn for_tenant(tenant: impl Into<String>) -> Self {
        let tenant = tenant.into();
        Self {
            auth_token: Some(format!("token-{tenant}")),
            user: Some(tenant.clone()),
            tenant: Some(tenant),
            roles: vec!["member".to_owned()],
            is_admin: false,
            read_only: false,
            show_deleted: false,
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn admin() -> Self {
        Self {
            auth_token: Some("token-admin".to_owned()),
            user: Some("admin".to_owned()),
            tenant: Some("admin-tenant".to_owned()),
            roles: vec![ADMIN_ROLE.to_owned()],
            is_admin: true,
            read_only: false,
            show_deleted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RequestContext;

    #[test]
    fn test_admin_role_elevates() {
        let ctx = RequestContext::from_confirmed_identity(
            "tok".to_owned(),
            Some("joe".to_owned()),
            Some("froggy".to_owned()),
            vec!["Member".to_owned(), "Admin".to_owned()],
        );
        assert!(ctx.is_admin);
        assert!(ctx.show_deleted());
        assert!(!ctx.requested_show_deleted());
    }

    #[test]
    fn test_owner_is_tenant() {
        let ctx = RequestContext::for_tenant("pattieblack");
        assert_eq!(ctx.owner(), Some("pattieblack"));
        assert!(!ctx.show_deleted());
    }
}
