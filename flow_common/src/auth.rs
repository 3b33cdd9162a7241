//! The auth mediator (C2): maps pipeline operations to capability
//! grants/revocations over input/output repos.

use crate::prelude::*;

/// The scope an operator must hold on a repo.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    /// Read-only access.
    Reader,
    /// Read-write access.
    Writer,
    /// Full ownership (includes delete).
    Owner,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Reader => "READER",
            Scope::Writer => "WRITER",
            Scope::Owner => "OWNER",
        };
        s.fmt(f)
    }
}

/// The operation a caller is attempting, used to decide what to check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Creating a new pipeline.
    Create,
    /// Updating an existing pipeline.
    Update,
    /// Deleting a pipeline.
    Delete,
    /// Listing a job's datums.
    ListDatum,
    /// Reading logs.
    GetLogs,
}

/// Does `caller` hold cluster-admin rights? Unlike per-repo scopes, this
/// isn't tied to any particular repo — it gates whole-cluster operations
/// like `DeleteAll`.
pub fn require_cluster_admin(auth: &dyn AuthBackend, caller: &str) -> Result<()> {
    if !auth.is_active()? {
        return Ok(());
    }
    if auth.is_cluster_admin(caller)? {
        Ok(())
    } else {
        Err(CoreError::NotAuthorized {
            repo: "*".to_owned(),
            scope: "CLUSTER-ADMIN".to_owned(),
        }
        .into())
    }
}

/// A capability token: a revocable credential granting a pipeline the
/// union of its operator's read/write rights to input/output repos.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CapabilityToken(pub String);

/// The external auth service.
///
/// If auth is inactive, every [`AuthBackend`] method must succeed
/// unconditionally — that's what [`NoAuth`] does.
pub trait AuthBackend: Send + Sync {
    /// Is the auth service active? If not, callers must skip every other
    /// check and proceed.
    fn is_active(&self) -> Result<bool>;

    /// Does the caller hold at least `scope` on `repo`?
    fn check_scope(&self, caller: &str, repo: &str, scope: Scope) -> Result<bool>;

    /// Mint a fresh capability token representing `caller`'s rights.
    fn authorize(&self, caller: &str) -> Result<CapabilityToken>;

    /// Revoke a previously minted token. Implementations should treat
    /// revoking an already-revoked or unknown token as success, the same
    /// way an inactive auth service would swallow the request.
    fn revoke(&self, token: &CapabilityToken) -> Result<()>;

    /// Does `caller` hold cluster-admin rights, independent of any
    /// per-repo scope? Gates whole-cluster operations like `DeleteAll`.
    fn is_cluster_admin(&self, caller: &str) -> Result<bool>;
}

/// Run the full authorization check for a pipeline operation: probe
/// whether auth is active; if so, assert reader scope on every atom
/// repo, then the operation-specific scope on the output repo.
pub fn authorize_pipeline_operation(
    auth: &dyn AuthBackend,
    caller: &str,
    operation: Operation,
    atom_repos: &[String],
    output_repo_exists: bool,
    output_repo: &str,
) -> Result<()> {
    if !auth.is_active()? {
        return Ok(());
    }

    for repo in atom_repos {
        if !auth.check_scope(caller, repo, Scope::Reader)? {
            return Err(CoreError::NotAuthorized {
                repo: repo.clone(),
                scope: Scope::Reader.to_string(),
            }
            .into());
        }
    }

    match operation {
        Operation::Create => {
            if output_repo_exists {
                return Err(CoreError::NotAuthorized {
                    repo: output_repo.to_owned(),
                    scope: "output repo must not already exist".to_owned(),
                }
                .into());
            }
        }
        Operation::Update => require_scope(auth, caller, output_repo, Scope::Writer)?,
        Operation::Delete => require_scope(auth, caller, output_repo, Scope::Owner)?,
        Operation::ListDatum | Operation::GetLogs => {
            require_scope(auth, caller, output_repo, Scope::Reader)?
        }
    }
    Ok(())
}

fn require_scope(
    auth: &dyn AuthBackend,
    caller: &str,
    repo: &str,
    scope: Scope,
) -> Result<()> {
    if auth.check_scope(caller, repo, scope)? {
        Ok(())
    } else {
        Err(CoreError::NotAuthorized {
            repo: repo.to_owned(),
            scope: scope.to_string(),
        }
        .into())
    }
}

/// An [`AuthBackend`] that is always inactive — the default for
/// deployments that haven't turned on authorization.
#[derive(Default)]
pub struct NoAuth;

impl AuthBackend for NoAuth {
    fn is_active(&self) -> Result<bool> {
        Ok(false)
    }

    fn check_scope(&self, _caller: &str, _repo: &str, _scope: Scope) -> Result<bool> {
        Ok(true)
    }

    fn authorize(&self, _caller: &str) -> Result<CapabilityToken> {
        Ok(CapabilityToken("no-auth".to_owned()))
    }

    fn revoke(&self, _token: &CapabilityToken) -> Result<()> {
        Ok(())
    }

    fn is_cluster_admin(&self, _caller: &str) -> Result<bool> {
        Ok(true)
    }
}

/// A reference, in-memory `AuthBackend` used by tests that want to
/// exercise the active-auth code paths.
pub struct StubAuth {
    grants: std::sync::Mutex<HashMap<(String, String), Scope>>,
    cluster_admins: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl StubAuth {
    /// Create a new, empty stub with auth active.
    pub fn new() -> Self {
        StubAuth {
            grants: std::sync::Mutex::new(HashMap::new()),
            cluster_admins: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Grant `caller` at least `scope` on `repo`.
    pub fn grant(&self, caller: &str, repo: &str, scope: Scope) {
        self.grants
            .lock()
            .unwrap()
            .insert((caller.to_owned(), repo.to_owned()), scope);
    }

    /// Grant `caller` cluster-admin rights.
    pub fn grant_cluster_admin(&self, caller: &str) {
        self.cluster_admins.lock().unwrap().insert(caller.to_owned());
    }
}

impl Default for StubAuth {
    fn default() -> Self {
        StubAuth::new()
    }
}

fn scope_satisfies(held: Scope, required: Scope) -> bool {
    fn rank(s: Scope) -> u8 {
        match s {
            Scope::Reader => 0,
            Scope::Writer => 1,
            Scope::Owner => 2,
        }
    }
    rank(held) >= rank(required)
}

impl AuthBackend for StubAuth {
    fn is_active(&self) -> Result<bool> {
        Ok(true)
    }

    fn check_scope(&self, caller: &str, repo: &str, scope: Scope) -> Result<bool> {
        let grants = self.grants.lock().unwrap();
        Ok(grants
            .get(&(caller.to_owned(), repo.to_owned()))
            .map(|held| scope_satisfies(*held, scope))
            .unwrap_or(false))
    }

    fn authorize(&self, caller: &str) -> Result<CapabilityToken> {
        Ok(CapabilityToken(format!("token-for-{}-{}", caller, Uuid::new_v4())))
    }

    fn revoke(&self, _token: &CapabilityToken) -> Result<()> {
        Ok(())
    }

    fn is_cluster_admin(&self, caller: &str) -> Result<bool> {
        Ok(self.cluster_admins.lock().unwrap().contains(caller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_auth_always_succeeds() {
        let auth = NoAuth;
        let result = authorize_pipeline_operation(
            &auth,
            "alice",
            Operation::Create,
            &["input-repo".to_owned()],
            true, // even an output repo that already exists
            "output-repo",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn create_fails_when_caller_lacks_reader_on_input() {
        let auth = StubAuth::new();
        let result = authorize_pipeline_operation(
            &auth,
            "alice",
            Operation::Create,
            &["input-repo".to_owned()],
            false,
            "output-repo",
        );
        assert!(result.is_err());
    }

    #[test]
    fn create_fails_when_output_repo_already_exists() {
        let auth = StubAuth::new();
        auth.grant("alice", "input-repo", Scope::Reader);
        let result = authorize_pipeline_operation(
            &auth,
            "alice",
            Operation::Create,
            &["input-repo".to_owned()],
            true,
            "output-repo",
        );
        assert!(result.is_err());
    }

    #[test]
    fn update_requires_writer_on_output() {
        let auth = StubAuth::new();
        auth.grant("alice", "input-repo", Scope::Reader);
        auth.grant("alice", "output-repo", Scope::Reader);
        let result = authorize_pipeline_operation(
            &auth,
            "alice",
            Operation::Update,
            &["input-repo".to_owned()],
            true,
            "output-repo",
        );
        assert!(result.is_err());

        auth.grant("alice", "output-repo", Scope::Writer);
        let result = authorize_pipeline_operation(
            &auth,
            "alice",
            Operation::Update,
            &["input-repo".to_owned()],
            true,
            "output-repo",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn cluster_admin_check_passes_under_no_auth() {
        assert!(require_cluster_admin(&NoAuth, "anyone").is_ok());
    }

    #[test]
    fn cluster_admin_check_rejects_a_caller_without_the_grant() {
        let auth = StubAuth::new();
        assert!(require_cluster_admin(&auth, "alice").is_err());
        auth.grant_cluster_admin("alice");
        assert!(require_cluster_admin(&auth, "alice").is_ok());
        assert!(require_cluster_admin(&auth, "bob").is_err());
    }
}
