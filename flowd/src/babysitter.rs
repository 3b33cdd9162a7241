//! A background process which tries to keep an eye on running jobs.
//!
//! We only store state in Postgres, and we assume that:
//!
//! 1. Any process can fail at any time, and
//! 2. **More than one copy of the babysitter will normally be running.**
//!
//! Using PostgreSQL to store state is one of the simplest ways to build a
//! medium-reliability, small-scale distributed control plane.
//!
//! The PPS master reconciliation loop that actually spawns and deletes
//! worker deployments lives outside this crate; this babysitter only
//! detects the state drift it leaves behind when a worker pool vanishes
//! without reporting a terminal job state.

use std::sync::Arc;
use std::{panic::catch_unwind, process, thread, time::Duration};

use flow_common::cafs::CafsClient;
use flow_common::chrono;
use flow_common::cor::CorClient;
use flow_common::db::{self, ConnectVia};
use flow_common::job_store::JobStore;
use flow_common::prelude::*;

/// How often to sweep for running jobs whose worker pool has vanished.
const POLL_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// How long a job may run with no corresponding worker pods before we
/// assume the pool was deleted out from under it (rather than just slow
/// to start).
const VANISHED_POOL_CUTOFF_MINUTES: i64 = 15;

/// Spawn a thread and run the babysitter in it. This should run
/// indefinitely.
#[tracing::instrument(skip(cafs, cor), level = "trace")]
pub fn start_babysitter(
    cafs: Arc<dyn CafsClient>,
    cor: Arc<dyn CorClient>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("babysitter".to_owned())
        .spawn(move || run_babysitter_wrapper(cafs, cor))
        .context("could not create babysitter thread")
}

/// Run the babysitter, and abort the process if we catch any panics.
fn run_babysitter_wrapper(cafs: Arc<dyn CafsClient>, cor: Arc<dyn CorClient>) {
    // If this thread panics, attempt to shut down the entire process,
    // forcing Kubernetes to make noise and restart `flowd`. The last
    // thing we want is for the babysitter to silently stop working.
    let result = catch_unwind(move || run_babysitter(cafs, cor));
    if let Err(err) = result {
        let msg: &str = if let Some(msg) = err.downcast_ref::<&str>() {
            msg
        } else if let Some(msg) = err.downcast_ref::<String>() {
            msg
        } else {
            "an unknown panic occurred"
        };
        tracing::error!("babysitter panicked, aborting: {}", msg);
        eprintln!("babysitter panicked, aborting: {}", msg);
        process::abort();
    }
}

/// Actually run the babysitter.
fn run_babysitter(cafs: Arc<dyn CafsClient>, cor: Arc<dyn CorClient>) {
    let job_store = JobStore::new(cafs);
    loop {
        // We always want to retry all errors. This way, if PostgreSQL is
        // still starting up, or someone restarted it, we'll eventually
        // recover.
        if let Err(err) = check_running_jobs(&job_store, cor.as_ref()) {
            tracing::error!(
                error = %err.display_causes_and_backtrace(),
                "error checking running jobs (will retry later)",
            );
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Check every running job for a worker pool that's vanished without
/// reporting a terminal state.
#[tracing::instrument(skip(job_store, cor), level = "debug")]
fn check_running_jobs(job_store: &JobStore, cor: &dyn CorClient) -> Result<()> {
    let mut conn = db::connect(ConnectVia::Cluster)?;
    let running: Vec<JobPointer> = JobPointer::list(&mut conn)?
        .into_iter()
        .filter(|job| job.state == JobState::Running)
        .collect();

    let cutoff = Utc::now().naive_utc() - chrono::Duration::minutes(VANISHED_POOL_CUTOFF_MINUTES);
    for mut job in running {
        if job.created_at >= cutoff {
            continue;
        }
        let rc_name = match job_store.rc_name_for_job(&job) {
            Ok(rc_name) => rc_name,
            Err(err) => {
                tracing::warn!(job = %job.id, error = %err, "could not resolve worker pool name");
                continue;
            }
        };
        let pods = match cor.rc_pods(&rc_name) {
            Ok(pods) => pods,
            Err(err) => {
                tracing::warn!(job = %job.id, rc_name, error = %err, "could not list worker pods");
                continue;
            }
        };
        if pods.is_empty() {
            tracing::warn!(
                job = %job.id,
                rc_name,
                "job has been running since before the cutoff with no worker pods; marking as failed",
            );
            job.transition_state(
                JobState::Failure,
                Some("worker pool disappeared while job was running".to_owned()),
                &mut conn,
            )?;
        }
    }
    Ok(())
}
