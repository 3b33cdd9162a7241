//! The durable job pointer and the value types assembled around it.

use crate::prelude::*;

/// The durable TX-KV record for a job. Everything else in a `JobInfo` is
/// reconstructed on read by joining this row with CAFS and (for `RUNNING`
/// jobs) worker status records.
#[derive(Clone, Debug, Deserialize, Identifiable, Queryable, Serialize)]
#[diesel(table_name = crate::schema::jobs)]
pub struct JobPointer {
    /// The job's opaque id.
    pub id: Uuid,
    /// When this job was created.
    pub created_at: NaiveDateTime,
    /// When this job was last updated.
    pub updated_at: NaiveDateTime,
    /// The job's current lifecycle state.
    pub state: JobState,
    /// A human-readable reason for the current state (set on failure/kill).
    pub reason: Option<String>,
    /// The pipeline this job belongs to.
    pub pipeline_name: String,
    /// The CAFS output commit this job is writing to.
    pub output_commit: String,
    /// The CAFS stats commit, present only once stats have been enabled and
    /// recorded.
    pub stats_commit: Option<String>,
    /// How many times this job has been restarted.
    pub restart_count: i32,
    /// Datums successfully processed so far.
    pub processed: i64,
    /// Datums skipped (incremental reprocessing).
    pub skipped: i64,
    /// Total datums in this job.
    pub total: i64,
    /// Datums that failed.
    pub failed: i64,
    /// Free-form processing stats, published by the worker pool.
    pub stats: Option<serde_json::Value>,
    /// This job's capability token, inherited from the pipeline at
    /// creation time.
    pub capability_token: Option<String>,
    /// The exact commit id each named Atom input resolved to for this
    /// job, keyed by input name. Used by `ListJob`'s `inputCommits`
    /// filter.
    pub input_commits: serde_json::Value,
}

impl JobPointer {
    /// Read `input_commits` as a typed map.
    pub fn input_commits_map(&self) -> HashMap<String, String> {
        serde_json::from_value(self.input_commits.clone()).unwrap_or_default()
    }

    /// Find a job by id.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn find(id: Uuid, conn: &mut PgConnection) -> Result<JobPointer> {
        use crate::schema::jobs;
        jobs::table
            .find(id)
            .first(conn)
            .map_err(|err| classify_not_found(err, id))
    }

    /// Find every job belonging to `pipeline`, via the `by-pipeline`
    /// secondary index (a plain b-tree index on `pipeline_name`).
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn find_by_pipeline(pipeline: &str, conn: &mut PgConnection) -> Result<Vec<JobPointer>> {
        use crate::schema::jobs;
        jobs::table
            .filter(jobs::pipeline_name.eq(pipeline))
            .order_by(jobs::created_at.desc())
            .load(conn)
            .with_context(|| format!("could not load jobs for pipeline {:?}", pipeline))
    }

    /// Find every job writing to `output_commit`, via the
    /// `by-output-commit` secondary index.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn find_by_output_commit(
        output_commit: &str,
        conn: &mut PgConnection,
    ) -> Result<Vec<JobPointer>> {
        use crate::schema::jobs;
        jobs::table
            .filter(jobs::output_commit.eq(output_commit))
            .order_by(jobs::created_at.desc())
            .load(conn)
            .with_context(|| format!("could not load jobs for output commit {:?}", output_commit))
    }

    /// A full scan of every job, newest first.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn list(conn: &mut PgConnection) -> Result<Vec<JobPointer>> {
        use crate::schema::jobs;
        jobs::table
            .order_by(jobs::created_at.desc())
            .load(conn)
            .context("could not list jobs")
    }

    /// Lock the underlying row with `SELECT FOR UPDATE`. Must be called
    /// from within a transaction.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn lock_for_update(&mut self, conn: &mut PgConnection) -> Result<()> {
        use crate::schema::jobs;
        *self = jobs::table
            .find(self.id)
            .for_update()
            .first(conn)
            .map_err(|err| classify_not_found(err, self.id))?;
        Ok(())
    }

    /// Transition this job to `new_state`, maintaining the pipeline's
    /// `job_counts` invariant in the same transaction: decrement the old
    /// state's count (floored at zero), increment the new one.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn transition_state(
        &mut self,
        new_state: JobState,
        reason: Option<String>,
        conn: &mut PgConnection,
    ) -> Result<()> {
        use crate::schema::{jobs, pipelines};

        conn.transaction(|conn| {
            self.lock_for_update(conn)?;
            let old_state = self.state;
            if old_state == new_state {
                return Ok(());
            }

            let pointer: PipelinePointer = pipelines::table
                .find(&self.pipeline_name)
                .for_update()
                .first(conn)
                .with_context(|| format!("could not load pipeline {:?}", self.pipeline_name))?;
            let mut counts = pointer.job_counts_map();
            let old_count = counts.entry(old_state).or_insert(0);
            *old_count = (*old_count - 1).max(0);
            *counts.entry(new_state).or_insert(0) += 1;
            let counts_json = serde_json::to_value(&counts)
                .context("could not serialize job_counts")?;

            diesel::update(pipelines::table.find(&self.pipeline_name))
                .set((
                    pipelines::job_counts.eq(counts_json),
                    pipelines::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)
                .context("could not update pipeline job counts")?;

            *self = diesel::update(jobs::table.find(self.id))
                .set((
                    jobs::state.eq(new_state),
                    jobs::reason.eq(&reason),
                    jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .get_result(conn)
                .context("could not update job state")?;
            Ok(())
        })
    }

    /// Generate a sample value for testing.
    pub fn factory(pipeline_name: &str) -> Self {
        let now = Utc::now().naive_utc();
        JobPointer {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            state: JobState::Starting,
            reason: None,
            pipeline_name: pipeline_name.to_owned(),
            output_commit: format!("commit-{}", Uuid::new_v4()),
            stats_commit: None,
            restart_count: 0,
            processed: 0,
            skipped: 0,
            total: 0,
            failed: 0,
            stats: None,
            capability_token: None,
            input_commits: serde_json::json!({}),
        }
    }
}

fn classify_not_found(err: diesel::result::Error, id: Uuid) -> Error {
    match err {
        diesel::result::Error::NotFound => CoreError::JobNotFound { id }.into(),
        other => Error::from(other).context(format!("could not load job {}", id)),
    }
}

/// Data required to create a new `JobPointer`.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::jobs)]
pub struct NewJobPointer {
    /// The pipeline this job belongs to.
    pub pipeline_name: String,
    /// The initial lifecycle state (always `Starting`).
    pub state: JobState,
    /// The CAFS output commit this job writes to.
    pub output_commit: String,
    /// This job's capability token, inherited from the pipeline.
    pub capability_token: Option<String>,
    /// The exact commit id each named Atom input resolved to.
    pub input_commits: serde_json::Value,
}

impl NewJobPointer {
    /// Insert a new job, then fold it into the pipeline's `job_counts`
    /// in the same transaction.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn insert(&self, conn: &mut PgConnection) -> Result<JobPointer> {
        use crate::schema::{jobs, pipelines};

        conn.transaction(|conn| {
            let job: JobPointer = diesel::insert_into(jobs::table)
                .values(self)
                .get_result(conn)
                .context("error inserting job")?;

            let pointer: PipelinePointer = pipelines::table
                .find(&self.pipeline_name)
                .for_update()
                .first(conn)
                .with_context(|| format!("could not load pipeline {:?}", self.pipeline_name))?;
            let mut counts = pointer.job_counts_map();
            *counts.entry(JobState::Starting).or_insert(0) += 1;
            let counts_json =
                serde_json::to_value(&counts).context("could not serialize job_counts")?;
            diesel::update(pipelines::table.find(&self.pipeline_name))
                .set((
                    pipelines::job_counts.eq(counts_json),
                    pipelines::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)
                .context("could not update pipeline job counts")?;

            Ok(job)
        })
    }
}

/// The fully assembled, read-only view of a job returned by `InspectJob`
/// and `ListJob`. Joins the durable [`JobPointer`] with CAFS commit
/// metadata and the pipeline spec at the job's provenance spec-commit.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobInfo {
    /// The job's opaque id.
    pub id: Uuid,
    /// The pipeline this job belongs to.
    pub pipeline_name: String,
    /// The pipeline's version at the time this job was created.
    pub pipeline_version: u32,
    /// The job's current lifecycle state.
    pub state: JobState,
    /// A human-readable reason for the current state, if any.
    pub reason: Option<String>,
    /// The transform that was run.
    pub transform: Transform,
    /// The input tree this job resolves datums against, inherited from
    /// its provenance spec-commit. Used by the datum view (C5) to
    /// synthesize datums when no stats commit exists yet.
    pub input: Input,
    /// The parallelism spec in effect for this job.
    pub parallelism_spec: ParallelismSpec,
    /// The salt in effect for this job.
    pub salt: String,
    /// The CAFS output commit this job wrote to.
    pub output_commit: String,
    /// The CAFS stats commit, if stats are enabled and recorded.
    pub stats_commit: Option<String>,
    /// When the output commit was opened.
    pub started_at: Option<chrono::DateTime<Utc>>,
    /// When the output commit was finished.
    pub finished_at: Option<chrono::DateTime<Utc>>,
    /// Datum progress counters.
    pub processed: i64,
    /// See [`JobPointer::skipped`].
    pub skipped: i64,
    /// See [`JobPointer::total`].
    pub total: i64,
    /// See [`JobPointer::failed`].
    pub failed: i64,
    /// Free-form processing stats, if published.
    pub stats: Option<serde_json::Value>,
    /// Live worker status entries whose `job_id` matches this job, if any
    /// were found. Only populated for a non-blocking inspect of a
    /// `RUNNING` job; a missing worker pool is not an error.
    pub worker_status: Vec<serde_json::Value>,
    /// The exact commit id each named Atom input resolved to for this
    /// job, keyed by input name.
    pub input_commits: HashMap<String, String>,
}

impl JobInfo {
    /// Does this job satisfy the `inputCommits` list-filter: for every
    /// requested commit id, at least one of this job's Atom inputs
    /// resolved to it.
    pub fn matches_input_commits(&self, requested: &[String]) -> bool {
        requested
            .iter()
            .all(|commit| self.input_commits.values().any(|resolved| resolved == commit))
    }
}
