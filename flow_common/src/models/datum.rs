//! Value types for a single datum.
//!
//! Datums are never stored as their own TX-KV rows: a job's progress
//! counters (`processed`/`skipped`/`total`/`failed`) are the only durable
//! trace of how many there were. `DatumInfo`/`DatumDetail` are assembled on
//! read from whatever the worker pool has published plus CAFS provenance,
//! with no backing table of their own.

use crate::prelude::*;

/// The three-valued outcome of processing a single datum, ordered
/// failed, then skipped, then success.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatumOutcome {
    /// Processing failed.
    Failed,
    /// Processing was skipped (the datum's inputs were unchanged from a
    /// prior incremental run).
    Skipped,
    /// Processing succeeded.
    Success,
}

impl fmt::Display for DatumOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatumOutcome::Failed => "failed",
            DatumOutcome::Skipped => "skipped",
            DatumOutcome::Success => "success",
        };
        s.fmt(f)
    }
}

/// The summary row returned by `ListDatum`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DatumInfo {
    /// A content hash of this datum's input file set, stable across jobs
    /// that see the same inputs (used to detect incremental reuse).
    pub datum_id: String,
    /// The job this datum belongs to.
    pub job_id: Uuid,
    /// How processing this datum turned out.
    pub outcome: DatumOutcome,
    /// When processing of this datum finished.
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

/// The full detail returned by `InspectDatum`: everything in
/// [`DatumInfo`] plus the input files, processing time, and the worker
/// that ran it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DatumDetail {
    /// The summary fields.
    #[serde(flatten)]
    pub info: DatumInfo,
    /// The CAFS paths making up this datum's inputs.
    pub input_files: Vec<String>,
    /// An error message, present only when `outcome` is `Failed`.
    pub error_message: Option<String>,
    /// The Kubernetes node the datum ran on, if the worker reported one.
    pub node_name: Option<String>,
    /// The Kubernetes pod that ran this datum, if the worker reported one.
    pub pod_name: Option<String>,
}

/// Is `other_datum` an aggregate sibling of `datum` — same datum id,
/// different job — that `ListDatum` should skip under the
/// aggregate-sibling rule (only the newest job's view of a shared datum
/// id is shown)?
pub fn is_aggregate_sibling(datum: &DatumInfo, other_datum: &DatumInfo) -> bool {
    datum.datum_id == other_datum.datum_id && datum.job_id != other_datum.job_id
}

/// Sort a page of datums by `(outcome, datum_id)`: failed first, then
/// skipped, then success, ties broken by datum id.
pub fn sort_datums(datums: &mut [DatumInfo]) {
    datums.sort_by(|a, b| (a.outcome, &a.datum_id).cmp(&(b.outcome, &b.datum_id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datum(id: &str, job: Uuid, outcome: DatumOutcome) -> DatumInfo {
        DatumInfo {
            datum_id: id.to_owned(),
            job_id: job,
            outcome,
            finished_at: None,
        }
    }

    #[test]
    fn outcomes_sort_failed_then_skipped_then_success() {
        let job = Uuid::new_v4();
        let mut datums = vec![
            datum("c", job, DatumOutcome::Success),
            datum("a", job, DatumOutcome::Failed),
            datum("b", job, DatumOutcome::Skipped),
        ];
        sort_datums(&mut datums);
        let outcomes: Vec<_> = datums.iter().map(|d| d.outcome).collect();
        assert_eq!(
            outcomes,
            vec![DatumOutcome::Failed, DatumOutcome::Skipped, DatumOutcome::Success]
        );
    }

    #[test]
    fn aggregate_siblings_share_datum_id_but_differ_by_job() {
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let d1 = datum("shared", job_a, DatumOutcome::Success);
        let d2 = datum("shared", job_b, DatumOutcome::Skipped);
        let d3 = datum("other", job_b, DatumOutcome::Success);
        assert!(is_aggregate_sibling(&d1, &d2));
        assert!(!is_aggregate_sibling(&d1, &d3));
        assert!(!is_aggregate_sibling(&d1, &d1));
    }
}
