//! Authorization seam consulted by the query lifecycle.

use std::collections::HashSet;

/// Decides whether a principal may read the given datasources.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, principal: &str, datasources: &HashSet<String>) -> bool;
}

/// Authorization disabled: everything is allowed. The lifecycle still routes
/// through AUTHORIZING so the state trace stays uniform.
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn authorize(&self, _principal: &str, _datasources: &HashSet<String>) -> bool {
        true
    }
}

/// Static allowlist keyed by principal.
pub struct StaticAuthorizer {
    grants: std::collections::HashMap<String, HashSet<String>>,
}

impl StaticAuthorizer {
    pub fn new(grants: std::collections::HashMap<String, HashSet<String>>) -> StaticAuthorizer {
        StaticAuthorizer { grants }
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, principal: &str, datasources: &HashSet<String>) -> bool {
        match self.grants.get(principal) {
            Some(allowed) => datasources.is_subset(allowed),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_authorizer() {
        let grants = [(
            "alice".to_string(),
            ["events".to_string()].into_iter().collect(),
        )]
        .into_iter()
        .collect();
        let auth = StaticAuthorizer::new(grants);
        let wants: HashSet<String> = ["events".to_string()].into_iter().collect();
        assert!(auth.authorize("alice", &wants));
        assert!(!auth.authorize("bob", &wants));
    }
}
