//! A thin key-value layer over `control_plane_kv`, realizing the TX-KV
//! slots that aren't already modeled as their own tables: the PPS
//! capability token, the GC generation counter, and worker records
//! (status/cancellation) under a pipeline's RC key.

use crate::prelude::*;

const PPS_TOKEN_KEY: &str = "pps-token";
const GC_GENERATION_KEY: &str = "gc-generation";

/// Read a single key, or `None` if it's unset.
#[tracing::instrument(skip(conn), level = "trace")]
pub fn get(key: &str, conn: &mut PgConnection) -> Result<Option<String>> {
    use crate::schema::control_plane_kv;
    control_plane_kv::table
        .find(key)
        .select(control_plane_kv::value)
        .first(conn)
        .optional()
        .with_context(|| format!("could not read key {:?}", key))
}

/// Upsert a single key.
#[tracing::instrument(skip(conn), level = "trace")]
pub fn set(key: &str, value: &str, conn: &mut PgConnection) -> Result<()> {
    use crate::schema::control_plane_kv;
    diesel::insert_into(control_plane_kv::table)
        .values((
            control_plane_kv::key.eq(key),
            control_plane_kv::value.eq(value),
        ))
        .on_conflict(control_plane_kv::key)
        .do_update()
        .set(control_plane_kv::value.eq(value))
        .execute(conn)
        .with_context(|| format!("could not write key {:?}", key))?;
    Ok(())
}

/// Read the PPS capability token. Read once and cached for the process
/// lifetime by the caller; a missing token is a fatal misconfiguration —
/// the control plane cannot function without one.
#[tracing::instrument(skip(conn), level = "trace")]
pub fn read_pps_token(conn: &mut PgConnection) -> Result<String> {
    get(PPS_TOKEN_KEY, conn)?.ok_or_else(|| {
        Error::msg("no PPS capability token is set at control_plane_kv[\"pps-token\"]")
    })
}

/// Increment the GC generation counter, creating it at `1` if absent.
/// Returns the new value.
#[tracing::instrument(skip(conn), level = "trace")]
pub fn bump_gc_generation(conn: &mut PgConnection) -> Result<u64> {
    conn.transaction(|conn| {
        let current: u64 = get(GC_GENERATION_KEY, conn)?
            .map(|v| v.parse())
            .transpose()
            .context("gc-generation value is not a valid integer")?
            .unwrap_or(0);
        let next = current + 1;
        set(GC_GENERATION_KEY, &next.to_string(), conn)?;
        Ok(next)
    })
}

/// A worker-status or cancellation record posted under a pipeline's RC
/// key. The control plane only ever writes `Cancellation` records and
/// reads `Status` records — it never calls workers directly.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum WorkerRecordKind {
    /// Published by a worker reporting progress on a job.
    Status,
    /// Posted by `RestartDatum` to cancel in-flight work.
    Cancellation,
}

impl WorkerRecordKind {
    fn as_str(&self) -> &'static str {
        match self {
            WorkerRecordKind::Status => "status",
            WorkerRecordKind::Cancellation => "cancellation",
        }
    }
}

/// Post a cancellation record scoped to `job_id` and an optional set of
/// data filters, under `rc_name`'s worker key. Used by `RestartDatum`.
#[tracing::instrument(skip(conn), level = "trace")]
pub fn post_cancellation(
    rc_name: &str,
    job_id: Uuid,
    data_filters: &[String],
    conn: &mut PgConnection,
) -> Result<()> {
    use crate::schema::worker_records;
    diesel::insert_into(worker_records::table)
        .values((
            worker_records::pipeline_rc.eq(rc_name),
            worker_records::job_id.eq(job_id),
            worker_records::kind.eq(WorkerRecordKind::Cancellation.as_str()),
            worker_records::data_filters.eq(serde_json::to_value(data_filters)?),
            worker_records::payload.eq(serde_json::json!({})),
        ))
        .execute(conn)
        .context("could not post cancellation record")?;
    Ok(())
}

/// Best-effort fetch of the most recent status records for `job_id`
/// under `rc_name`'s worker key. A missing worker pool must not fail
/// the caller — errors are logged and an empty vec returned.
#[tracing::instrument(skip(conn), level = "trace")]
pub fn worker_status_for_job(
    rc_name: &str,
    job_id: Uuid,
    conn: &mut PgConnection,
) -> Vec<serde_json::Value> {
    use crate::schema::worker_records;
    let result = worker_records::table
        .filter(worker_records::pipeline_rc.eq(rc_name))
        .filter(worker_records::job_id.eq(job_id))
        .filter(worker_records::kind.eq(WorkerRecordKind::Status.as_str()))
        .select(worker_records::payload)
        .load::<serde_json::Value>(conn);
    match result {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!(
                rc_name,
                %job_id,
                error = %err,
                "could not read worker status; proceeding without it",
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_record_kind_round_trips_as_str() {
        assert_eq!(WorkerRecordKind::Status.as_str(), "status");
        assert_eq!(WorkerRecordKind::Cancellation.as_str(), "cancellation");
    }
}
