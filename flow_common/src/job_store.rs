//! The job store (C4): per-job metadata, state transitions, pipeline-side
//! job-counter maintenance, and the two secondary-index list paths.

use std::sync::Arc;
use std::time::Duration;

use crate::cafs::CafsClient;
use crate::kv;
use crate::models::pipeline::SPEC_REPO;
use crate::prelude::*;

/// How long to sleep between polls while blocking on a terminal state.
/// TX-KV's real per-key watch feed isn't modeled here; this poll loop
/// observes the same terminal condition with bounded latency instead.
const BLOCK_STATE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The job store. Bundles just the collaborator this component needs
/// beyond Postgres: CAFS, to resolve a job's provenance spec-commit and
/// output-commit timing.
pub struct JobStore {
    cafs: Arc<dyn CafsClient>,
}

impl JobStore {
    /// Build a job store backed by `cafs`.
    pub fn new(cafs: Arc<dyn CafsClient>) -> Self {
        JobStore { cafs }
    }

    /// Create a job for `pipeline`, writing to the already-opened
    /// `output_commit`. Generates an opaque id and maintains the
    /// pipeline's `job_counts` invariant in the same transaction.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn create(
        &self,
        pipeline: &PipelinePointer,
        output_commit: String,
        input_commits: HashMap<String, String>,
        conn: &mut PgConnection,
    ) -> Result<JobPointer> {
        NewJobPointer {
            pipeline_name: pipeline.name.clone(),
            state: JobState::Starting,
            output_commit,
            capability_token: Some(pipeline.capability_token.clone()),
            input_commits: serde_json::to_value(&input_commits)
                .context("could not serialize input_commits")?,
        }
        .insert(conn)
    }

    /// Stop a job: transition it to `KILLED`.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn stop(&self, id: Uuid, conn: &mut PgConnection) -> Result<JobPointer> {
        let mut job = JobPointer::find(id, conn)?;
        job.transition_state(
            JobState::Killed,
            Some("stopped by operator".to_owned()),
            conn,
        )?;
        Ok(job)
    }

    /// Delete a job's TX-KV pointer. Does not touch its CAFS output
    /// commit or adjust pipeline job counts — a killed/finished job's
    /// counts stay put; only the pointer itself goes away.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn delete(&self, id: Uuid, conn: &mut PgConnection) -> Result<()> {
        use crate::schema::jobs;
        let deleted = diesel::delete(jobs::table.find(id))
            .execute(conn)
            .context("could not delete job")?;
        if deleted == 0 {
            return Err(CoreError::JobNotFound { id }.into());
        }
        Ok(())
    }

    /// Delete every job belonging to `pipeline_name` (invoked by
    /// `DeletePipeline`).
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn delete_all_for_pipeline(
        &self,
        pipeline_name: &str,
        conn: &mut PgConnection,
    ) -> Result<()> {
        for job in JobPointer::find_by_pipeline(pipeline_name, conn)? {
            self.delete(job.id, conn)?;
        }
        Ok(())
    }

    /// Post a cancellation record for `data_filters` under the job's
    /// worker-pool key.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn restart_datum(
        &self,
        id: Uuid,
        data_filters: &[String],
        conn: &mut PgConnection,
    ) -> Result<()> {
        let job = JobPointer::find(id, conn)?;
        let spec = self.load_spec(&job)?;
        kv::post_cancellation(&spec.rc_name(), id, data_filters, conn)
    }

    /// Inspect a job, optionally blocking until it reaches a terminal
    /// state. `block_timeout` bounds how long we'll block before giving
    /// up with [`CoreError::TransientRpc`]; it's ignored when
    /// `block_state` is `false`.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn inspect(
        &self,
        id: Uuid,
        block_state: bool,
        block_timeout: Duration,
        conn: &mut PgConnection,
    ) -> Result<JobInfo> {
        if block_state {
            self.block_until_terminal(id, block_timeout, conn)
        } else {
            let job = JobPointer::find(id, conn)?;
            self.build_info(job, conn)
        }
    }

    fn block_until_terminal(
        &self,
        id: Uuid,
        timeout: Duration,
        conn: &mut PgConnection,
    ) -> Result<JobInfo> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match JobPointer::find(id, conn) {
                Ok(job) if job.state.is_terminal() => return self.build_info(job, conn),
                Ok(_) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(CoreError::TransientRpc {
                            subsystem: "TX-KV".to_owned(),
                            message: format!(
                                "job {} did not reach a terminal state within {:?}",
                                id, timeout
                            ),
                        }
                        .into());
                    }
                    std::thread::sleep(BLOCK_STATE_POLL_INTERVAL);
                }
                Err(err) => {
                    if matches!(
                        err.downcast_ref::<CoreError>(),
                        Some(CoreError::JobNotFound { .. })
                    ) {
                        return Err(Error::msg("job deleted"));
                    }
                    return Err(err);
                }
            }
        }
    }

    /// List jobs, choosing a secondary index when `pipeline` or
    /// `output_commit` is set, else a full scan; then apply the
    /// `inputCommits` filter.
    #[tracing::instrument(skip(self, conn), level = "debug")]
    pub fn list(
        &self,
        pipeline: Option<&str>,
        output_commit: Option<&str>,
        input_commits: &[String],
        conn: &mut PgConnection,
    ) -> Result<Vec<JobInfo>> {
        let pointers = match (pipeline, output_commit) {
            (Some(pipeline), _) => JobPointer::find_by_pipeline(pipeline, conn)?,
            (None, Some(commit)) => JobPointer::find_by_output_commit(commit, conn)?,
            (None, None) => JobPointer::list(conn)?,
        };

        let mut infos = Vec::with_capacity(pointers.len());
        for job in pointers {
            let info = self.build_info(job, conn)?;
            if input_commits.is_empty() || info.matches_input_commits(input_commits) {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    /// Resolve the worker pool / replication controller name a running
    /// job's datums are processed by. Used by the babysitter reconciliation
    /// loop to check whether a job's worker pool has vanished.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn rc_name_for_job(&self, job: &JobPointer) -> Result<String> {
        Ok(self.load_spec(job)?.rc_name())
    }

    /// Resolve the job's own copy of the pipeline spec by walking its
    /// output commit's provenance back to the spec-repo commit it
    /// descends from.
    fn load_spec(&self, job: &JobPointer) -> Result<PipelineSpec> {
        let commit = self.cafs.commit_metadata(&job.output_commit)?;
        let spec_commit_id = commit
            .provenance
            .iter()
            .find_map(|candidate| {
                self.cafs
                    .commit_metadata(candidate)
                    .ok()
                    .filter(|meta| meta.repo == SPEC_REPO)
                    .map(|_| candidate.clone())
            })
            .ok_or_else(|| {
                CoreError::Invariant {
                    message: format!(
                        "job {}'s output commit has no spec-commit provenance",
                        job.id
                    ),
                }
            })?;
        let bytes = self
            .cafs
            .get_file(&spec_commit_id, crate::models::pipeline::SPEC_FILE)?;
        serde_json::from_slice(&bytes).context("could not parse pipeline spec from CAFS")
    }

    fn build_info(&self, job: JobPointer, conn: &mut PgConnection) -> Result<JobInfo> {
        let commit = self.cafs.commit_metadata(&job.output_commit)?;
        let spec = self.load_spec(&job)?;

        // A missing worker pool must not fail Inspect/List.
        let worker_status = if job.state == JobState::Running {
            kv::worker_status_for_job(&spec.rc_name(), job.id, conn)
        } else {
            Vec::new()
        };

        Ok(JobInfo {
            id: job.id,
            pipeline_name: job.pipeline_name.clone(),
            pipeline_version: spec.version,
            state: job.state,
            reason: job.reason.clone(),
            transform: spec.transform,
            input: spec.input,
            parallelism_spec: spec.parallelism_spec,
            salt: spec.salt,
            output_commit: job.output_commit.clone(),
            stats_commit: job.stats_commit.clone(),
            started_at: Some(commit.started_at),
            finished_at: commit.finished_at,
            processed: job.processed,
            skipped: job.skipped,
            total: job.total,
            failed: job.failed,
            stats: job.stats.clone(),
            worker_status,
            input_commits: job.input_commits_map(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_input_commits_requires_every_requested_commit_present() {
        let mut commits = HashMap::new();
        commits.insert("a".to_owned(), "commit-a".to_owned());
        commits.insert("b".to_owned(), "commit-b".to_owned());
        let info = JobInfo {
            id: Uuid::new_v4(),
            pipeline_name: "p".to_owned(),
            pipeline_version: 1,
            state: JobState::Success,
            reason: None,
            transform: Transform {
                cmd: vec!["true".to_owned()],
                image: "ubuntu:16.04".to_owned(),
                env: HashMap::new(),
                secrets: Vec::new(),
            },
            input: Input::Atom {
                name: None,
                repo: "r".to_owned(),
                branch: Some("master".to_owned()),
                glob: "/*".to_owned(),
                commit_id: None,
            },
            parallelism_spec: ParallelismSpec::default(),
            salt: "salt".to_owned(),
            output_commit: "oc".to_owned(),
            stats_commit: None,
            started_at: None,
            finished_at: None,
            processed: 0,
            skipped: 0,
            total: 0,
            failed: 0,
            stats: None,
            worker_status: Vec::new(),
            input_commits: commits,
        };

        assert!(info.matches_input_commits(&["commit-a".to_owned()]));
        assert!(info.matches_input_commits(&["commit-a".to_owned(), "commit-b".to_owned()]));
        assert!(!info.matches_input_commits(&["commit-c".to_owned()]));
        assert!(info.matches_input_commits(&[]));
    }
}
