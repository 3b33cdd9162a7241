//! Pipeline specs, the input tree, and the durable pipeline pointer.
//!
//! This is where C1 (shape validation/defaulting) lives, alongside the
//! types C3 (the pipeline store) persists.

use std::collections::HashSet;
use std::str::FromStr;

use crate::cafs::CafsClient;
use crate::prelude::*;
use crate::secret::Secret;

/// The well-known CAFS repo holding one branch per pipeline, each
/// branch's HEAD commit carrying that pipeline's current `PipelineSpec`.
pub const SPEC_REPO: &str = "__pipeline_specs__";

/// The single file inside a spec-branch commit holding the marshalled
/// `PipelineSpec`.
pub const SPEC_FILE: &str = "/spec.json";

/// A Kubernetes-style resource quantity, e.g. `"64M"` or `"500m"`. We don't
/// interpret these beyond checking they parse; the worker pool does the
/// actual unit conversion.
fn parse_byte_quantity(s: &str) -> Result<()> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation {
            message: "byte quantity must not be empty".to_owned(),
        }
        .into());
    }
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    if digits_end == 0 {
        return Err(CoreError::Validation {
            message: format!("{:?} does not start with a number", s),
        }
        .into());
    }
    let (number, suffix) = trimmed.split_at(digits_end);
    number
        .parse::<f64>()
        .map_err(|_| CoreError::Validation {
            message: format!("{:?} is not a valid quantity", s),
        })?;
    const VALID_SUFFIXES: &[&str] = &["", "K", "Ki", "M", "Mi", "G", "Gi", "T", "Ti"];
    if !VALID_SUFFIXES.contains(&suffix) {
        return Err(CoreError::Validation {
            message: format!("{:?} has an unrecognized unit suffix {:?}", s, suffix),
        }
        .into());
    }
    Ok(())
}

/// Parse a human-readable duration like `"5m"` or `"30s"`, same format as
/// published to the worker pool.
fn parse_duration(s: &str) -> Result<std::time::Duration> {
    humantime_serde::re::humantime::parse_duration(s)
        .map_err(|err| CoreError::Validation {
            message: format!("invalid duration {:?}: {}", s, err),
        }
        .into())
}

/// The command and image a job's workers should run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Transform {
    /// The command to run, as an argv array.
    pub cmd: Vec<String>,
    /// The container image to run it in. Defaults to `ubuntu:16.04`.
    #[serde(default)]
    pub image: String,
    /// Extra environment variables to set.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Secrets to mount or expose as environment variables.
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

/// How many workers to run for a pipeline.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct ParallelismSpec {
    /// Run exactly this many workers.
    pub constant: Option<u32>,
    /// Run `coefficient * number_of_nodes` workers.
    pub coefficient: Option<f64>,
}

/// Resource requests or limits.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ResourceSpec {
    /// Memory, as a byte quantity.
    pub memory: Option<String>,
    /// CPU, in Kubernetes-style millicores or cores.
    pub cpu: Option<String>,
}

/// A service exposed by a pipeline instead of (or in addition to) writing
/// an output commit.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceSpec {
    /// The port the worker listens on.
    pub internal_port: u16,
    /// The port to expose externally.
    pub external_port: u16,
}

/// How datums should be grouped into chunks before being handed to workers.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ChunkSpec {
    /// A fixed number of datums per chunk.
    pub number: Option<u64>,
    /// A target number of bytes per chunk.
    pub size_bytes: Option<u64>,
}

/// One leaf or branch of the recursive input tree.
///
/// Exactly one variant is ever live for a given node — that's enforced by
/// the Rust type system itself, which is simpler than the builder-time
/// checks the design notes call for in a language without sum types.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Input {
    /// A glob over files on a branch of a repo.
    Atom {
        /// The name this input is bound to inside the job's working
        /// directory. Defaults to `repo` if omitted.
        #[serde(default)]
        name: Option<String>,
        /// The repo to read from.
        repo: String,
        /// The branch to read from. Required for pipelines; optional for
        /// jobs, which may instead pin a `commit_id`.
        #[serde(default)]
        branch: Option<String>,
        /// The glob pattern selecting files within the branch.
        glob: String,
        /// A pinned commit, used only when validating a job-level input.
        #[serde(default)]
        commit_id: Option<String>,
    },
    /// A repo populated on a schedule.
    Cron {
        /// The name this input is bound to.
        #[serde(default)]
        name: Option<String>,
        /// A cron expression.
        spec: String,
        /// The repo that receives scheduled commits. Defaults to
        /// `<pipeline>_<name>`.
        #[serde(default)]
        repo: Option<String>,
        /// When the schedule should start. Defaults to now.
        #[serde(default)]
        start: Option<chrono::DateTime<Utc>>,
    },
    /// A mirror of an external git repository.
    Git {
        /// The name this input is bound to. Defaults to the last path
        /// segment of `url`, with any trailing `.git` stripped.
        #[serde(default)]
        name: Option<String>,
        /// The URL to clone.
        url: String,
        /// The branch to track. Defaults to `master`.
        #[serde(default)]
        branch: Option<String>,
    },
    /// A group of inputs whose names may collide with each other, but not
    /// with anything crossed against the union as a whole.
    Union(Vec<Input>),
    /// A group of inputs whose names must all be globally distinct.
    Cross(Vec<Input>),
}

impl Input {
    /// The effective (possibly still-undefaulted) name of a leaf node. Only
    /// meaningful after defaulting for non-leaf nodes, which have no name
    /// of their own.
    fn leaf_name(&self) -> Option<&str> {
        match self {
            Input::Atom { name, repo, .. } => {
                name.as_deref().or(Some(repo.as_str()))
            }
            Input::Cron { name, .. } => name.as_deref(),
            Input::Git { name, url, .. } => name.as_deref().or(Some(url.as_str())),
            Input::Union(_) | Input::Cross(_) => None,
        }
    }

    /// Walk the tree once, enforcing node-level shape rules and the
    /// union-local name-scoping rule.
    ///
    /// `as_job` relaxes the atom `branch` requirement in favor of allowing a
    /// pinned `commit_id`.
    fn validate_node(&self, as_job: bool, names: &mut HashSet<String>) -> Result<()> {
        match self {
            Input::Atom {
                name,
                repo,
                branch,
                glob,
                commit_id,
            } => {
                let name = name.as_deref().unwrap_or(repo);
                check_name(name)?;
                if repo.is_empty() {
                    return Err(validation("atom input is missing a repo"));
                }
                if glob.is_empty() {
                    return Err(validation("atom input is missing a glob"));
                }
                if branch.is_none() && !(as_job && commit_id.is_some()) {
                    return Err(validation(
                        "atom input needs a branch (or, for a job, a pinned commit)",
                    ));
                }
                insert_name(names, name)
            }
            Input::Cron { name, spec, .. } => {
                let name = name.as_deref().unwrap_or("cron");
                check_name(name)?;
                cron::Schedule::from_str(spec).map_err(|err| {
                    validation(&format!("invalid cron expression {:?}: {}", spec, err))
                })?;
                insert_name(names, name)
            }
            Input::Git { name, url, .. } => {
                let default_name;
                let name = match name.as_deref() {
                    Some(n) => n,
                    None => {
                        default_name = git_name_from_url(url)?;
                        &default_name
                    }
                };
                check_name(name)?;
                url::Url::parse(url)
                    .map_err(|err| validation(&format!("invalid git URL {:?}: {}", url, err)))?;
                insert_name(names, name)
            }
            Input::Union(children) => {
                // Each child gets a clone of the ambient set, and
                // contributes its own names back into the parent scope once
                // it's done — so union siblings can collide with each
                // other, but a name introduced by the union as a whole
                // still "occupies" that name for any `Cross` sibling.
                let mut merged = names.clone();
                for child in children {
                    let mut child_names = names.clone();
                    child.validate_node(as_job, &mut child_names)?;
                    merged.extend(child_names);
                }
                *names = merged;
                Ok(())
            }
            Input::Cross(children) => {
                for child in children {
                    child.validate_node(as_job, names)?;
                }
                Ok(())
            }
        }
    }

    /// Apply default values, recursively.
    fn defaulted(self, pipeline_name: &str) -> Input {
        match self {
            Input::Atom {
                name,
                repo,
                branch,
                glob,
                commit_id,
            } => Input::Atom {
                name: Some(name.unwrap_or_else(|| repo.clone())),
                branch: Some(branch.unwrap_or_else(|| "master".to_owned())),
                repo,
                glob,
                commit_id,
            },
            Input::Cron { name, spec, repo, start } => {
                let name = name.unwrap_or_else(|| "cron".to_owned());
                let repo = repo.unwrap_or_else(|| format!("{}_{}", pipeline_name, name));
                let start = Some(start.unwrap_or_else(Utc::now));
                Input::Cron {
                    name: Some(name),
                    spec,
                    repo: Some(repo),
                    start,
                }
            }
            Input::Git { name, url, branch } => {
                let name = match name {
                    Some(name) => name,
                    None => git_name_from_url(&url).unwrap_or_else(|_| url.clone()),
                };
                Input::Git {
                    name: Some(name),
                    url,
                    branch: Some(branch.unwrap_or_else(|| "master".to_owned())),
                }
            }
            Input::Union(children) => {
                let mut children: Vec<Input> = children
                    .into_iter()
                    .map(|c| c.defaulted(pipeline_name))
                    .collect();
                children.sort_by(|a, b| a.leaf_name().cmp(&b.leaf_name()));
                Input::Union(children)
            }
            Input::Cross(children) => {
                let mut children: Vec<Input> = children
                    .into_iter()
                    .map(|c| c.defaulted(pipeline_name))
                    .collect();
                children.sort_by(|a, b| a.leaf_name().cmp(&b.leaf_name()));
                Input::Cross(children)
            }
        }
    }

    /// Collect every atom input's `(repo, branch)` pair in this tree. Used
    /// for both authorization and incremental provenance checking.
    pub fn atom_repos(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.collect_atom_repos(&mut out);
        out
    }

    fn collect_atom_repos(&self, out: &mut Vec<(String, String)>) {
        match self {
            Input::Atom { repo, branch, .. } => {
                out.push((repo.clone(), branch.clone().unwrap_or_default()));
            }
            Input::Union(children) | Input::Cross(children) => {
                for child in children {
                    child.collect_atom_repos(out);
                }
            }
            Input::Cron { .. } | Input::Git { .. } => {}
        }
    }

    /// Every `(repo, branch)` pair this tree depends on — atoms, cron
    /// schedules, and git mirrors alike. Used to compute the output
    /// branch's full provenance set at Create/Start time.
    pub fn all_branches(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.collect_all_branches(&mut out);
        out
    }

    fn collect_all_branches(&self, out: &mut Vec<(String, String)>) {
        match self {
            Input::Atom { repo, branch, .. } => {
                if let Some(branch) = branch {
                    out.push((repo.clone(), branch.clone()));
                }
            }
            Input::Cron { repo, .. } => {
                if let Some(repo) = repo {
                    out.push((repo.clone(), "master".to_owned()));
                }
            }
            Input::Git { name, branch, .. } => {
                if let (Some(name), Some(branch)) = (name, branch) {
                    out.push((name.clone(), branch.clone()));
                }
            }
            Input::Union(children) | Input::Cross(children) => {
                for child in children {
                    child.collect_all_branches(out);
                }
            }
        }
    }

    /// Every `(repo, branch)` pair for this tree's Cron and Git nodes —
    /// the ones whose repos the pipeline store itself provisions, as
    /// opposed to Atom repos, which must already exist.
    pub fn cron_and_git_branches(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.collect_cron_and_git_branches(&mut out);
        out
    }

    fn collect_cron_and_git_branches(&self, out: &mut Vec<(String, String)>) {
        match self {
            Input::Cron { repo, .. } => {
                if let Some(repo) = repo {
                    out.push((repo.clone(), "master".to_owned()));
                }
            }
            Input::Git { name, branch, .. } => {
                if let (Some(name), Some(branch)) = (name, branch) {
                    out.push((name.clone(), branch.clone()));
                }
            }
            Input::Atom { .. } => {}
            Input::Union(children) | Input::Cross(children) => {
                for child in children {
                    child.collect_cron_and_git_branches(out);
                }
            }
        }
    }
}

fn git_name_from_url(url: &str) -> Result<String> {
    let last = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .ok_or_else(|| validation(&format!("cannot derive a name from git URL {:?}", url)))?;
    Ok(last.strip_suffix(".git").unwrap_or(last).to_owned())
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(validation("input name must not be empty"));
    }
    if name == "out" {
        return Err(validation("input name must not be \"out\""));
    }
    Ok(())
}

fn insert_name(names: &mut HashSet<String>, name: &str) -> Result<()> {
    if !names.insert(name.to_owned()) {
        return Err(validation(&format!(
            "input name {:?} is used more than once outside of a union",
            name
        )));
    }
    Ok(())
}

fn validation(message: &str) -> Error {
    CoreError::Validation {
        message: message.to_owned(),
    }
    .into()
}

/// The full, versioned specification of a pipeline.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PipelineSpec {
    /// The pipeline's unique name.
    pub name: String,
    /// Monotonically increasing version, starting at 1.
    pub version: u32,
    /// What to run.
    pub transform: Transform,
    /// What to run it on.
    pub input: Input,
    /// The branch of the output repo to commit results to.
    #[serde(default)]
    pub output_branch: String,
    /// How many workers to run.
    #[serde(default)]
    pub parallelism_spec: ParallelismSpec,
    /// Requested resources per worker.
    #[serde(default)]
    pub resource_requests: Option<ResourceSpec>,
    /// Resource limits per worker.
    #[serde(default)]
    pub resource_limits: Option<ResourceSpec>,
    /// How much local disk to reserve for the datum cache.
    #[serde(default)]
    pub cache_size: String,
    /// Only reprocess datums whose inputs changed since the last commit.
    #[serde(default)]
    pub incremental: bool,
    /// Record per-datum stats commits.
    #[serde(default)]
    pub enable_stats: bool,
    /// Stable across versions unless a reprocess is requested.
    #[serde(default)]
    pub salt: String,
    /// Maximum number of datums to queue at once. Floored to 1.
    #[serde(default)]
    pub max_queue_size: u32,
    /// An optional exposed service, instead of / in addition to an output
    /// commit.
    #[serde(default)]
    pub service: Option<ServiceSpec>,
    /// How to batch datums into chunks.
    #[serde(default)]
    pub chunk_spec: Option<ChunkSpec>,
    /// Per-datum timeout, published to the worker pool (not enforced here).
    #[serde(default)]
    pub datum_timeout: Option<String>,
    /// Per-job timeout, published to the worker pool (not enforced here).
    #[serde(default)]
    pub job_timeout: Option<String>,
    /// When this version of the spec was created.
    #[serde(default = "Utc::now")]
    pub created_at: chrono::DateTime<Utc>,
    /// Resolved lazily from C8; `"pending"` until resolved.
    #[serde(default)]
    pub githook_url: Option<String>,
}

impl PipelineSpec {
    /// Traverse the input tree exactly once, enforcing every node-level
    /// and whole-tree rule except the CAFS-backed existence/provenance
    /// checks, which need a `CafsClient`.
    pub fn validate_shape(&self, as_job: bool) -> Result<()> {
        if self.transform.cmd.is_empty() {
            return Err(validation("transform command must not be empty"));
        }
        let (constant, coefficient) = (
            self.parallelism_spec.constant,
            self.parallelism_spec.coefficient,
        );
        if constant.is_some() && coefficient.is_some() {
            return Err(validation(
                "parallelism_spec.constant and .coefficient are mutually exclusive",
            ));
        }
        if self.service.is_some() && constant != Some(1) {
            return Err(validation(
                "a pipeline with a service must have parallelism_spec.constant == 1",
            ));
        }
        if coefficient.map_or(false, |c| c < 0.0) {
            return Err(validation("parallelism_spec.coefficient must be >= 0"));
        }
        if !self.cache_size.is_empty() {
            parse_byte_quantity(&self.cache_size)?;
        }
        if let Some(timeout) = &self.datum_timeout {
            parse_duration(timeout)?;
        }
        if let Some(timeout) = &self.job_timeout {
            parse_duration(timeout)?;
        }

        let mut names = HashSet::new();
        self.input.validate_node(as_job, &mut names)
    }

    /// Validate the existence of every atom repo/commit referenced by this
    /// spec, and (for incremental pipelines) the no-shared-provenance rule.
    pub fn validate_against_cafs(&self, as_job: bool, cafs: &dyn CafsClient) -> Result<()> {
        for (repo, branch) in self.input.atom_repos() {
            if as_job {
                // Job-level atoms may instead pin a commit; existence of
                // that commit was already checked by the caller, which
                // resolved it.
                if !branch.is_empty() && !cafs.repo_exists(&repo)? {
                    return Err(validation(&format!("repo {:?} does not exist", repo)));
                }
            } else if !cafs.repo_exists(&repo)? {
                return Err(validation(&format!("repo {:?} does not exist", repo)));
            }
        }

        if self.incremental {
            let mut seen = HashSet::new();
            for (repo, branch) in self.input.atom_repos() {
                let mut provenance = cafs.branch_provenance(&repo, &branch)?;
                provenance.push(format!("{}@{}", repo, branch));
                for branch_id in provenance {
                    if !seen.insert(branch_id.clone()) {
                        return Err(CoreError::ParentInputsMismatch { parent: branch_id }.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Fill in every default, then canonically sort the input tree so
    /// that semantically equal specs hash identically.
    pub fn defaulted(mut self) -> PipelineSpec {
        if self.transform.image.is_empty() {
            self.transform.image = "ubuntu:16.04".to_owned();
        }
        self.input = self.input.defaulted(&self.name);
        if self.output_branch.is_empty() {
            self.output_branch = "master".to_owned();
        }
        if self.cache_size.is_empty() {
            self.cache_size = "64M".to_owned();
        }
        if self.resource_requests.is_none() {
            self.resource_requests = Some(ResourceSpec {
                memory: Some(self.cache_size.clone()),
                cpu: None,
            });
        }
        if self.max_queue_size < 1 {
            self.max_queue_size = 1;
        }
        self
    }

    /// The name of this pipeline's worker pool / replication controller.
    pub fn rc_name(&self) -> String {
        format!("{}-v{}", self.name, self.version)
    }

    /// The prefix for every datum-cache tag this pipeline's jobs create,
    /// namespaced by salt so a `Reprocess` update (which mints a fresh
    /// salt) starts GC with no live tags under the old prefix.
    pub fn datum_tag_prefix(&self) -> String {
        format!("datum/{}/", self.salt)
    }
}

/// The durable TX-KV record for a pipeline. The authoritative spec lives in
/// CAFS at `spec_commit_id`; this row is a pointer plus cached aggregates.
#[derive(Debug, Deserialize, Identifiable, Queryable, Serialize)]
#[diesel(primary_key(name), table_name = crate::schema::pipelines)]
pub struct PipelinePointer {
    /// The pipeline's unique name.
    pub name: String,
    /// When this pointer was first created.
    pub created_at: NaiveDateTime,
    /// When this pointer was last updated.
    pub updated_at: NaiveDateTime,
    /// The pipeline's current lifecycle state.
    pub state: PipelineState,
    /// The CAFS commit holding the authoritative `PipelineSpec`.
    pub spec_commit_id: String,
    /// This pipeline's capability token.
    pub capability_token: String,
    /// `job_counts[state]` is the number of jobs in that state, maintained
    /// incrementally by C4.
    pub job_counts: serde_json::Value,
}

impl PipelinePointer {
    /// Find a pipeline pointer by name.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn find(name: &str, conn: &mut PgConnection) -> Result<PipelinePointer> {
        use crate::schema::pipelines;
        pipelines::table
            .find(name)
            .first(conn)
            .optional()
            .context("could not load pipeline pointer")?
            .ok_or_else(|| CoreError::PipelineNotFound { name: name.to_owned() }.into())
    }

    /// Read `job_counts` as a typed map, defaulting absent states to zero.
    pub fn job_counts_map(&self) -> HashMap<JobState, i64> {
        serde_json::from_value(self.job_counts.clone()).unwrap_or_default()
    }
}

/// Data required to create a new `PipelinePointer`.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::pipelines)]
pub struct NewPipelinePointer {
    /// The pipeline's unique name.
    pub name: String,
    /// The initial lifecycle state (always `Starting`).
    pub state: PipelineState,
    /// The CAFS commit holding the authoritative `PipelineSpec`.
    pub spec_commit_id: String,
    /// This pipeline's capability token.
    pub capability_token: String,
    /// Always empty at creation time.
    pub job_counts: serde_json::Value,
}

impl NewPipelinePointer {
    /// Insert a new pipeline pointer. Returns `CoreError::PipelineAlreadyExists`
    /// (wrapped) if a row with this name already exists.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn insert(&self, conn: &mut PgConnection) -> Result<PipelinePointer> {
        use crate::schema::pipelines;
        diesel::insert_into(pipelines::table)
            .values(self)
            .get_result(conn)
            .map_err(|err| match err {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => CoreError::PipelineAlreadyExists {
                    name: self.name.clone(),
                }
                .into(),
                other => Error::from(other).context("error inserting pipeline pointer"),
            })
    }
}

/// The fully assembled, read-only view of a pipeline returned by
/// `InspectPipeline`/`ListPipeline` — the durable pointer's state joined
/// with the `PipelineSpec` at `spec_commit_id`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PipelineInfo {
    /// The versioned spec resolved from CAFS.
    #[serde(flatten)]
    pub spec: PipelineSpec,
    /// The pipeline's current lifecycle state.
    pub state: PipelineState,
    /// Job counts by state, maintained incrementally by C4.
    pub job_counts: HashMap<JobState, i64>,
    /// The CAFS commit this view was resolved from.
    pub spec_commit_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transform() -> Transform {
        Transform {
            cmd: vec!["echo".to_owned(), "hi".to_owned()],
            image: String::new(),
            env: HashMap::new(),
            secrets: Vec::new(),
        }
    }

    fn sample_spec() -> PipelineSpec {
        PipelineSpec {
            name: "p1".to_owned(),
            version: 1,
            transform: sample_transform(),
            input: Input::Atom {
                name: None,
                repo: "input-repo".to_owned(),
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
            salt: "abc".to_owned(),
            max_queue_size: 0,
            service: None,
            chunk_spec: None,
            datum_timeout: None,
            job_timeout: None,
            created_at: Utc::now(),
            githook_url: None,
        }
    }

    #[test]
    fn defaulting_fills_atom_branch_and_name() {
        let spec = sample_spec().defaulted();
        match spec.input {
            Input::Atom { name, branch, .. } => {
                assert_eq!(name.as_deref(), Some("input-repo"));
                assert_eq!(branch.as_deref(), Some("master"));
            }
            _ => panic!("expected an atom"),
        }
        assert_eq!(spec.output_branch, "master");
        assert_eq!(spec.cache_size, "64M");
        assert_eq!(spec.max_queue_size, 1);
        assert_eq!(spec.transform.image, "ubuntu:16.04");
    }

    #[test]
    fn name_must_not_be_out() {
        let mut spec = sample_spec();
        spec.input = Input::Atom {
            name: Some("out".to_owned()),
            repo: "r".to_owned(),
            branch: Some("master".to_owned()),
            glob: "/*".to_owned(),
            commit_id: None,
        };
        assert!(spec.validate_shape(false).is_err());
    }

    #[test]
    fn name_clash_under_cross_of_union_is_rejected() {
        // Cross(Union(Atom(name=X,repo=A), Atom(name=X,repo=B)), Atom(name=X,repo=C))
        let spec = PipelineSpec {
            input: Input::Cross(vec![
                Input::Union(vec![
                    Input::Atom {
                        name: Some("x".to_owned()),
                        repo: "a".to_owned(),
                        branch: Some("master".to_owned()),
                        glob: "/*".to_owned(),
                        commit_id: None,
                    },
                    Input::Atom {
                        name: Some("x".to_owned()),
                        repo: "b".to_owned(),
                        branch: Some("master".to_owned()),
                        glob: "/*".to_owned(),
                        commit_id: None,
                    },
                ]),
                Input::Atom {
                    name: Some("x".to_owned()),
                    repo: "c".to_owned(),
                    branch: Some("master".to_owned()),
                    glob: "/*".to_owned(),
                    commit_id: None,
                },
            ]),
            ..sample_spec()
        };
        assert!(spec.validate_shape(false).is_err());
    }

    #[test]
    fn union_siblings_may_share_a_name() {
        let spec = PipelineSpec {
            input: Input::Union(vec![
                Input::Atom {
                    name: Some("x".to_owned()),
                    repo: "a".to_owned(),
                    branch: Some("master".to_owned()),
                    glob: "/*".to_owned(),
                    commit_id: None,
                },
                Input::Atom {
                    name: Some("x".to_owned()),
                    repo: "b".to_owned(),
                    branch: Some("master".to_owned()),
                    glob: "/*".to_owned(),
                    commit_id: None,
                },
            ]),
            ..sample_spec()
        };
        assert!(spec.validate_shape(false).is_ok());
    }

    #[test]
    fn parallelism_constant_and_coefficient_are_exclusive() {
        let mut spec = sample_spec();
        spec.parallelism_spec = ParallelismSpec {
            constant: Some(1),
            coefficient: Some(0.5),
        };
        assert!(spec.validate_shape(false).is_err());
    }

    #[test]
    fn service_pipeline_requires_constant_one() {
        let mut spec = sample_spec();
        spec.service = Some(ServiceSpec {
            internal_port: 80,
            external_port: 8080,
        });
        spec.parallelism_spec = ParallelismSpec {
            constant: Some(2),
            coefficient: None,
        };
        assert!(spec.validate_shape(false).is_err());
    }

    #[test]
    fn service_pipeline_with_no_constant_set_is_rejected() {
        let mut spec = sample_spec();
        spec.service = Some(ServiceSpec {
            internal_port: 80,
            external_port: 8080,
        });
        spec.parallelism_spec = ParallelismSpec {
            constant: None,
            coefficient: Some(0.5),
        };
        assert!(spec.validate_shape(false).is_err());

        spec.parallelism_spec = ParallelismSpec {
            constant: None,
            coefficient: None,
        };
        assert!(spec.validate_shape(false).is_err());
    }

    #[test]
    fn job_level_atom_may_omit_branch_if_commit_pinned() {
        let mut spec = sample_spec();
        spec.input = Input::Atom {
            name: None,
            repo: "input-repo".to_owned(),
            branch: None,
            glob: "/*".to_owned(),
            commit_id: Some("deadbeef".to_owned()),
        };
        assert!(spec.validate_shape(true).is_ok());
        assert!(spec.validate_shape(false).is_err());
    }

    #[test]
    fn rc_name_includes_version() {
        let spec = sample_spec();
        assert_eq!(spec.rc_name(), "p1-v1");
    }
}
