//! Database and domain models for the control plane.

use diesel::backend::Backend;
use diesel::{deserialize, pg::Pg, serialize};

use crate::prelude::*;

pub mod datum;
pub mod job;
pub mod pipeline;

pub use self::datum::*;
pub use self::job::*;
pub use self::pipeline::*;

/// Custom SQL types, used by `schema.rs`'s `table!` macros.
pub mod sql_types {
    /// A job-state enumeration type for use in Diesel's `table!` macro.
    #[derive(QueryId, SqlType)]
    #[diesel(postgres_type(name = "job_state"))]
    pub struct JobState;

    /// A pipeline-state enumeration type for use in Diesel's `table!` macro.
    #[derive(QueryId, SqlType)]
    #[diesel(postgres_type(name = "pipeline_state"))]
    pub struct PipelineState;
}

/// The lifecycle state of a job. Every job progresses
/// `Starting -> Running -> {Success, Failure, Killed}`; the three final
/// states are absorbing.
#[derive(
    AsExpression,
    Debug,
    Deserialize,
    Clone,
    Copy,
    Eq,
    FromSqlRow,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[diesel(sql_type = sql_types::JobState)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// The job has been created but has not yet started running datums.
    Starting,
    /// The job is actively processing datums.
    Running,
    /// The job finished and every datum succeeded.
    Success,
    /// The job finished and at least one datum failed beyond recovery.
    Failure,
    /// The job was explicitly stopped.
    Killed,
}

impl JobState {
    /// Is this one of the three terminal states?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Killed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Killed => "killed",
        };
        s.fmt(f)
    }
}

impl ::diesel::serialize::ToSql<sql_types::JobState, Pg> for JobState {
    fn to_sql(&self, out: &mut serialize::Output<'_, '_, Pg>) -> serialize::Result {
        let s = match *self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Killed => "killed",
        };
        out.write_all(s.as_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl ::diesel::deserialize::FromSql<sql_types::JobState, Pg> for JobState {
    fn from_sql(bytes: <Pg as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        match String::from_sql(bytes)?.as_str() {
            "starting" => Ok(JobState::Starting),
            "running" => Ok(JobState::Running),
            "success" => Ok(JobState::Success),
            "failure" => Ok(JobState::Failure),
            "killed" => Ok(JobState::Killed),
            val => Err(format!("unrecognized job_state value from database: {}", val).into()),
        }
    }
}

/// The lifecycle state of a pipeline.
#[derive(
    AsExpression,
    Debug,
    Deserialize,
    Clone,
    Copy,
    Eq,
    FromSqlRow,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[diesel(sql_type = sql_types::PipelineState)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// The pipeline is being created; its worker pool is starting up.
    Starting,
    /// The pipeline is actively consuming input commits.
    Running,
    /// The pipeline has been stopped by the operator.
    Paused,
    /// The pipeline's worker pool failed irrecoverably.
    Failure,
}

impl PipelineState {
    /// `pipelineStopped(state) ≡ state ∈ {PAUSED, FAILURE}`.
    pub fn is_stopped(self) -> bool {
        matches!(self, PipelineState::Paused | PipelineState::Failure)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Paused => "paused",
            PipelineState::Failure => "failure",
        };
        s.fmt(f)
    }
}

impl ::diesel::serialize::ToSql<sql_types::PipelineState, Pg> for PipelineState {
    fn to_sql(&self, out: &mut serialize::Output<'_, '_, Pg>) -> serialize::Result {
        let s = match *self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Paused => "paused",
            PipelineState::Failure => "failure",
        };
        out.write_all(s.as_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl ::diesel::deserialize::FromSql<sql_types::PipelineState, Pg> for PipelineState {
    fn from_sql(bytes: <Pg as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        match String::from_sql(bytes)?.as_str() {
            "starting" => Ok(PipelineState::Starting),
            "running" => Ok(PipelineState::Running),
            "paused" => Ok(PipelineState::Paused),
            "failure" => Ok(PipelineState::Failure),
            val => Err(format!("unrecognized pipeline_state value from database: {}", val).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_terminal_classification() {
        assert!(!JobState::Starting.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failure.is_terminal());
        assert!(JobState::Killed.is_terminal());
    }

    #[test]
    fn pipeline_state_stopped_classification() {
        assert!(!PipelineState::Starting.is_stopped());
        assert!(!PipelineState::Running.is_stopped());
        assert!(PipelineState::Paused.is_stopped());
        assert!(PipelineState::Failure.is_stopped());
    }
}
