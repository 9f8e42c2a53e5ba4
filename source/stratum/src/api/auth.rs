use std::path::Path;

use stratum_model::Labels;

/// What the authenticator decided about one request. The engine surfaces
/// `Unauthenticated` and `PermissionDenied` verbatim and never partially
/// applies a denied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Unauthenticated,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy)]
pub enum AuthAction<'a> {
    Get {
        root_path: &'a Path,
        document: &'a str,
        labels: &'a Labels,
    },
    Update {
        root_path: &'a Path,
    },
    Watch {
        root_path: &'a Path,
        document: &'a str,
        labels: &'a Labels,
    },
    Trace {
        root_path: &'a Path,
    },
    RunGc,
}

/// Policy seam. Token formats and policy files live outside the core; the
/// engine only consumes the decision.
pub trait Authenticator: Send + Sync {
    fn check(&self, token: Option<&str>, action: AuthAction<'_>) -> AuthDecision;
}

/// Default authenticator for deployments that fence the endpoint some other
/// way.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn check(&self, _token: Option<&str>, _action: AuthAction<'_>) -> AuthDecision {
        AuthDecision::Allow
    }
}
