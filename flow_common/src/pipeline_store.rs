//! The pipeline store (C3): dual-write pipeline spec (TX-KV pointer + CAFS
//! spec-commit), update/delete/inspect/list, and the start/stop/hard-stop
//! state transitions.

use std::sync::Arc;

use crate::auth::{authorize_pipeline_operation, AuthBackend, Operation};
use crate::cafs::CafsClient;
use crate::cor::CorClient;
use crate::job_store::JobStore;
use crate::models::pipeline::{SPEC_FILE, SPEC_REPO};
use crate::prelude::*;

/// The pipeline store. Bundles the collaborators C3 needs beyond
/// Postgres: CAFS (spec commits, input/output repos), COR (to resolve
/// the git-webhook URL on Inspect and to delete worker deployments on
/// Delete), and the auth mediator (C2).
pub struct PipelineStore {
    cafs: Arc<dyn CafsClient>,
    /// `cafs`, switched to the PPS capability token. Every write to or
    /// delete from the spec repo goes through this handle instead of
    /// `cafs`, since ordinary callers have no access to it.
    pps_cafs: Arc<dyn CafsClient>,
    cor: Arc<dyn CorClient>,
    auth: Arc<dyn AuthBackend>,
}

impl PipelineStore {
    /// Build a pipeline store backed by `cafs`/`cor`/`auth`. `pps_token`
    /// is read once (by the caller, via [`crate::kv::read_pps_token`])
    /// and cached here for the store's entire lifetime.
    pub fn new(
        cafs: Arc<dyn CafsClient>,
        pps_token: &str,
        cor: Arc<dyn CorClient>,
        auth: Arc<dyn AuthBackend>,
    ) -> Self {
        let pps_cafs = cafs.as_capability(pps_token);
        PipelineStore { cafs, pps_cafs, cor, auth }
    }

    fn authorize(
        &self,
        caller: &str,
        operation: Operation,
        input: &Input,
        output_repo_exists: bool,
        output_repo: &str,
    ) -> Result<()> {
        let atom_repos: Vec<String> = input.atom_repos().into_iter().map(|(repo, _)| repo).collect();
        authorize_pipeline_operation(
            self.auth.as_ref(),
            caller,
            operation,
            &atom_repos,
            output_repo_exists,
            output_repo,
        )
    }

    /// Create a new pipeline.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn create(&self, caller: &str, spec: PipelineSpec, conn: &mut PgConnection) -> Result<PipelineInfo> {
        let mut spec = spec.defaulted();
        spec.validate_shape(false)?;
        spec.validate_against_cafs(false, self.cafs.as_ref())?;

        for (repo, branch) in spec.input.cron_and_git_branches() {
            self.cafs.create_repo(&repo)?;
            self.cafs.create_branch(&repo, &branch)?;
        }

        let output_repo_exists = self.cafs.repo_exists(&spec.name)?;
        self.authorize(caller, Operation::Create, &spec.input, output_repo_exists, &spec.name)?;

        let capability = self.auth.authorize(caller)?;

        spec.version = 1;
        if spec.salt.is_empty() {
            spec.salt = Uuid::new_v4().to_string();
        }

        let spec_commit_id = self.write_spec_commit(&spec, true)?;

        let pointer = NewPipelinePointer {
            name: spec.name.clone(),
            state: PipelineState::Starting,
            spec_commit_id: spec_commit_id.clone(),
            capability_token: capability.0,
            job_counts: serde_json::json!({}),
        };
        let pointer = match pointer.insert(conn) {
            Ok(pointer) => pointer,
            Err(err) => {
                // Roll back the spec commit: delete the branch we just
                // created so a retried Create starts clean.
                let _ = self.pps_cafs.delete_branch(SPEC_REPO, &spec.name);
                return Err(err);
            }
        };

        self.cafs.create_repo(&spec.name)?;
        self.cafs.create_branch(&spec.name, &spec.output_branch)?;
        self.cafs
            .set_branch_provenance(&spec.name, &spec.output_branch, &self.full_provenance(&spec))?;

        Ok(self.assemble_info(pointer, spec))
    }

    /// Update an existing pipeline, bumping its version.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn update(
        &self,
        caller: &str,
        name: &str,
        mut new_spec: PipelineSpec,
        reprocess: bool,
        conn: &mut PgConnection,
    ) -> Result<PipelineInfo> {
        new_spec = new_spec.defaulted();
        new_spec.validate_shape(false)?;
        new_spec.validate_against_cafs(false, self.cafs.as_ref())?;

        if let Some(head) = self.cafs.branch_head(SPEC_REPO, name)? {
            if self.cafs.is_commit_open(&head)? {
                return Err(CoreError::Validation {
                    message: format!(
                        "pipeline {:?}'s spec branch has an open HEAD from a prior crashed \
                         write; wait for it to finish or run update-pipeline --clean",
                        name,
                    ),
                }
                .into());
            }
        }

        self.authorize(caller, Operation::Update, &new_spec.input, true, name)?;
        self.hard_stop(name, conn)?;

        let (old_pointer, old_spec) = self.load(name, conn)?;
        new_spec.name = name.to_owned();
        new_spec.version = old_spec.version + 1;
        new_spec.salt = if reprocess {
            Uuid::new_v4().to_string()
        } else {
            old_spec.salt.clone()
        };

        let spec_commit_id = self.write_spec_commit(&new_spec, false)?;
        let capability = self.auth.authorize(caller)?;

        let pointer: PipelinePointer = {
            use crate::schema::pipelines;
            diesel::update(pipelines::table.find(name))
                .set((
                    pipelines::spec_commit_id.eq(&spec_commit_id),
                    pipelines::capability_token.eq(&capability.0),
                    pipelines::updated_at.eq(Utc::now().naive_utc()),
                ))
                .get_result(conn)
                .context("could not update pipeline pointer")?
        };

        let old_capability = crate::auth::CapabilityToken(old_pointer.capability_token.clone());
        if let Err(err) = self.auth.revoke(&old_capability) {
            tracing::warn!(pipeline = name, error = %err, "could not revoke prior capability token");
        }

        Ok(self.assemble_info(pointer, new_spec))
    }

    /// Resolve a pipeline's pointer and its authoritative spec.
    #[tracing::instrument(skip(conn), level = "trace")]
    fn load(&self, name: &str, conn: &mut PgConnection) -> Result<(PipelinePointer, PipelineSpec)> {
        use crate::schema::pipelines;
        let pointer: PipelinePointer = pipelines::table
            .find(name)
            .first(conn)
            .optional()
            .context("could not load pipeline pointer")?
            .ok_or_else(|| CoreError::PipelineNotFound { name: name.to_owned() })?;
        let bytes = self.cafs.get_file(&pointer.spec_commit_id, SPEC_FILE)?;
        let spec: PipelineSpec =
            serde_json::from_slice(&bytes).context("could not parse pipeline spec from CAFS")?;
        Ok((pointer, spec))
    }

    /// Inspect a pipeline.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn inspect(&self, name: &str, conn: &mut PgConnection) -> Result<PipelineInfo> {
        let (pointer, mut spec) = self.load(name, conn)?;
        if has_git_input(&spec.input) {
            match self.cor.get_githook_service(name) {
                Ok(Some(address)) => spec.githook_url = Some(address),
                Ok(None) => spec.githook_url = Some("pending".to_owned()),
                Err(err) => {
                    tracing::warn!(pipeline = name, error = %err, "could not resolve githook service");
                    spec.githook_url = Some("pending".to_owned());
                }
            }
        }
        Ok(self.assemble_info(pointer, spec))
    }

    /// List every pipeline. Resolution failures propagate —
    /// unlike Inspect's githook lookup, a spec that fails to resolve here
    /// is a real error, not a best-effort extra.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn list(&self, conn: &mut PgConnection) -> Result<Vec<PipelineInfo>> {
        use crate::schema::pipelines;
        let pointers: Vec<PipelinePointer> = pipelines::table
            .order_by(pipelines::name)
            .load(conn)
            .context("could not list pipelines")?;
        pointers
            .into_iter()
            .map(|pointer| {
                let bytes = self.cafs.get_file(&pointer.spec_commit_id, SPEC_FILE)?;
                let spec: PipelineSpec = serde_json::from_slice(&bytes)
                    .context("could not parse pipeline spec from CAFS")?;
                Ok(self.assemble_info(pointer, spec))
            })
            .collect()
    }

    /// Compare-and-set the pointer's lifecycle state.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn set_state(&self, name: &str, state: PipelineState, conn: &mut PgConnection) -> Result<()> {
        use crate::schema::pipelines;
        let updated = diesel::update(pipelines::table.find(name))
            .set((
                pipelines::state.eq(state),
                pipelines::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)
            .context("could not set pipeline state")?;
        if updated == 0 {
            return Err(CoreError::PipelineNotFound { name: name.to_owned() }.into());
        }
        Ok(())
    }

    /// Resume a paused pipeline.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn start(&self, caller: &str, name: &str, conn: &mut PgConnection) -> Result<()> {
        let (_, spec) = self.load(name, conn)?;
        self.authorize(caller, Operation::Update, &spec.input, true, name)?;
        self.cafs
            .set_branch_provenance(&spec.name, &spec.output_branch, &self.full_provenance(&spec))?;
        self.set_state(name, PipelineState::Running, conn)
    }

    /// Pause a running pipeline, clearing its input-side provenance while
    /// keeping the spec-branch provenance present.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn stop(&self, caller: &str, name: &str, conn: &mut PgConnection) -> Result<()> {
        let (_, spec) = self.load(name, conn)?;
        self.authorize(caller, Operation::Update, &spec.input, true, name)?;
        self.cafs.set_branch_provenance(
            &spec.name,
            &spec.output_branch,
            &[format!("{}@{}", SPEC_REPO, spec.name)],
        )?;
        self.set_state(name, PipelineState::Paused, conn)
    }

    /// Delete a pipeline, including the half-state cleanup path for a
    /// pointer that was never written after its spec commit.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn delete(
        &self,
        caller: &str,
        name: &str,
        job_store: &JobStore,
        conn: &mut PgConnection,
    ) -> Result<()> {
        use crate::schema::pipelines;
        let pointer_exists = pipelines::table
            .find(name)
            .first::<PipelinePointer>(conn)
            .optional()
            .context("could not check for pipeline pointer")?;

        let pointer = match pointer_exists {
            None => {
                // Half-state recovery: no pointer, but a spec branch may
                // exist with an empty HEAD. Clean it up and return,
                // without requiring authorization.
                if let Some(head) = self.cafs.branch_head(SPEC_REPO, name)? {
                    if self.cafs.is_commit_open(&head)? {
                        self.pps_cafs.delete_branch(SPEC_REPO, name)?;
                    }
                }
                return Ok(());
            }
            Some(pointer) => pointer,
        };

        let bytes = self.cafs.get_file(&pointer.spec_commit_id, SPEC_FILE)?;
        let spec: PipelineSpec =
            serde_json::from_slice(&bytes).context("could not parse pipeline spec from CAFS")?;

        self.authorize(caller, Operation::Delete, &spec.input, true, name)?;
        self.hard_stop(name, conn)?;

        if let Err(err) = self.cor.delete_workers_for_pipeline(&spec.rc_name()) {
            tracing::warn!(pipeline = name, error = %err, "could not delete worker deployment");
        }

        let capability = crate::auth::CapabilityToken(pointer.capability_token.clone());
        if let Err(err) = self.auth.revoke(&capability) {
            tracing::warn!(pipeline = name, error = %err, "could not revoke capability token");
        }

        job_store.delete_all_for_pipeline(name, conn)?;

        self.pps_cafs.delete_branch(SPEC_REPO, name)?;
        diesel::delete(pipelines::table.find(name))
            .execute(conn)
            .context("could not delete pipeline pointer")?;
        self.cafs.delete_repo(&spec.name)?;
        for (repo, _) in spec.input.cron_and_git_branches() {
            self.cafs.delete_repo(&repo)?;
        }
        Ok(())
    }

    /// The spec-commit write protocol: switch to the PPS capability
    /// token, start a commit on the spec branch, replace `SPEC_FILE`'s
    /// contents, finish the commit.
    fn write_spec_commit(&self, spec: &PipelineSpec, is_create: bool) -> Result<String> {
        let cafs = self.pps_cafs.as_ref();
        if is_create {
            if cafs.branch_exists(SPEC_REPO, &spec.name)? {
                return Err(CoreError::PipelineAlreadyExists { name: spec.name.clone() }.into());
            }
            cafs.create_repo(SPEC_REPO)?;
            cafs.create_branch(SPEC_REPO, &spec.name)?;
        }

        let commit_id = cafs.start_commit(SPEC_REPO, &spec.name)?;
        match cafs.delete_file(&commit_id, SPEC_FILE) {
            Ok(()) => {}
            Err(err) if CoreError::is_idempotent_cafs_error(&err) => {}
            Err(err) => return Err(err),
        }
        let bytes = serde_json::to_vec(spec).context("could not serialize pipeline spec")?;
        cafs.put_file(&commit_id, SPEC_FILE, &bytes)?;
        cafs.finish_commit(&commit_id)?;
        Ok(commit_id)
    }

    /// Hard-stop: clear the output branch's provenance, then finish
    /// every still-open commit on the output branch, newest first.
    fn hard_stop(&self, name: &str, conn: &mut PgConnection) -> Result<()> {
        let (_, spec) = self.load(name, conn)?;
        self.cafs.clear_branch_provenance(&spec.name, &spec.output_branch)?;
        for commit_id in self.cafs.list_commits(&spec.name, &spec.output_branch)? {
            if self.cafs.is_commit_open(&commit_id)? {
                self.cafs.finish_commit_with_empty_tree(&commit_id)?;
            }
        }
        Ok(())
    }

    /// The union of every input branch (atom/cron/git) plus the spec
    /// branch — the output branch's full provenance at Create/Start time.
    fn full_provenance(&self, spec: &PipelineSpec) -> Vec<String> {
        let mut provenance: Vec<String> = spec
            .input
            .all_branches()
            .into_iter()
            .map(|(repo, branch)| format!("{}@{}", repo, branch))
            .collect();
        provenance.push(format!("{}@{}", SPEC_REPO, spec.name));
        provenance
    }

    fn assemble_info(&self, pointer: PipelinePointer, spec: PipelineSpec) -> PipelineInfo {
        PipelineInfo {
            job_counts: pointer.job_counts_map(),
            state: pointer.state,
            spec_commit_id: pointer.spec_commit_id.clone(),
            spec,
        }
    }
}

fn has_git_input(input: &Input) -> bool {
    match input {
        Input::Git { .. } => true,
        Input::Union(children) | Input::Cross(children) => children.iter().any(has_git_input),
        Input::Atom { .. } | Input::Cron { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuth;
    use crate::cafs::InMemoryCafs;
    use crate::cor::{CorClient, Pod};

    struct NoopCor;

    impl CorClient for NoopCor {
        fn deploy(&self, _manifest: &str) -> Result<()> {
            Ok(())
        }
        fn undeploy(&self, _manifest: &str) -> Result<()> {
            Ok(())
        }
        fn resource_exists(&self, _resource_id: &str) -> Result<bool> {
            Ok(false)
        }
        fn delete_resource(&self, _resource_id: &str) -> Result<()> {
            Ok(())
        }
        fn rc_pods(&self, _rc_name: &str) -> Result<Vec<Pod>> {
            Ok(Vec::new())
        }
        fn pod_logs(&self, _pod_name: &str, _container: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn validate_kube(&self) -> Result<()> {
            Ok(())
        }
        fn get_githook_service(&self, _namespace: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn delete_workers_for_pipeline(&self, _rc_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn sample_spec(name: &str, input_repo: &str) -> PipelineSpec {
        PipelineSpec {
            name: name.to_owned(),
            version: 0,
            transform: Transform {
                cmd: vec!["echo".to_owned(), "hi".to_owned()],
                image: String::new(),
                env: HashMap::new(),
                secrets: Vec::new(),
            },
            input: Input::Atom {
                name: None,
                repo: input_repo.to_owned(),
                branch: None,
                glob: "/*".to_owned(),
                commit_id: None,
            },
            output_branch: String::new(),
            parallelism_spec: ParallelismSpec::default(),
            resource_requests: None,
            resource_limits: None,
            cache_size: String::new(),
            incremental: false,
            enable_stats: false,
            salt: String::new(),
            max_queue_size: 0,
            service: None,
            chunk_spec: None,
            datum_timeout: None,
            job_timeout: None,
            created_at: Utc::now(),
            githook_url: None,
        }
    }

    fn new_store() -> (PipelineStore, Arc<InMemoryCafs>) {
        let cafs = Arc::new(InMemoryCafs::new());
        let store = PipelineStore::new(cafs.clone(), "test-pps-token", Arc::new(NoopCor), Arc::new(NoAuth));
        (store, cafs)
    }

    #[test]
    fn full_provenance_includes_spec_branch_and_every_input_branch() {
        let (store, _cafs) = new_store();
        let mut spec = sample_spec("p1", "inputs");
        spec.input = Input::Cross(vec![
            Input::Atom {
                name: None,
                repo: "a".to_owned(),
                branch: Some("master".to_owned()),
                glob: "/*".to_owned(),
                commit_id: None,
            },
            Input::Atom {
                name: None,
                repo: "b".to_owned(),
                branch: Some("dev".to_owned()),
                glob: "/*".to_owned(),
                commit_id: None,
            },
        ]);

        let provenance = store.full_provenance(&spec);
        assert!(provenance.contains(&"a@master".to_owned()));
        assert!(provenance.contains(&"b@dev".to_owned()));
        assert!(provenance.contains(&"__pipeline_specs__@p1".to_owned()));
        assert_eq!(provenance.len(), 3);
    }

    #[test]
    fn has_git_input_detects_git_nested_inside_a_union() {
        let git = Input::Git {
            name: None,
            url: "https://example.com/repo.git".to_owned(),
            branch: Some("master".to_owned()),
        };
        let atom = Input::Atom {
            name: None,
            repo: "a".to_owned(),
            branch: Some("master".to_owned()),
            glob: "/*".to_owned(),
            commit_id: None,
        };
        assert!(has_git_input(&Input::Union(vec![atom.clone(), git])));
        assert!(!has_git_input(&Input::Union(vec![atom])));
    }

    #[test]
    fn write_spec_commit_create_rejects_a_name_already_in_use() {
        let (store, _cafs) = new_store();
        let spec = sample_spec("p1", "inputs");
        store.write_spec_commit(&spec, true).unwrap();
        let err = store.write_spec_commit(&spec, true).unwrap_err();
        assert!(format!("{:#}", err).contains("already exists"));
    }

    #[test]
    fn write_spec_commit_round_trips_the_spec_through_cafs() {
        let (store, cafs) = new_store();
        let spec = sample_spec("p1", "inputs");
        let commit_id = store.write_spec_commit(&spec, true).unwrap();

        let bytes = cafs.get_file(&commit_id, SPEC_FILE).unwrap();
        let round_tripped: PipelineSpec = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round_tripped.name, "p1");
        assert!(!cafs.is_commit_open(&commit_id).unwrap());
    }

    #[test]
    fn write_spec_commit_update_replaces_a_prior_spec_file() {
        let (store, cafs) = new_store();
        let mut spec = sample_spec("p1", "inputs");
        store.write_spec_commit(&spec, true).unwrap();

        spec.version = 2;
        let commit_id = store.write_spec_commit(&spec, false).unwrap();
        let bytes = cafs.get_file(&commit_id, SPEC_FILE).unwrap();
        let round_tripped: PipelineSpec = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round_tripped.version, 2);
    }

    #[test]
    fn authorize_allows_any_caller_under_no_auth() {
        let (store, _cafs) = new_store();
        let spec = sample_spec("p1", "inputs");
        assert!(store
            .authorize("anyone", Operation::Create, &spec.input, false, &spec.name)
            .is_ok());
    }
}
