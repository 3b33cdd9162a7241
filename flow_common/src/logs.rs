//! The log aggregator (C6): multiplex worker-pod or stats-commit logs into
//! a single filtered stream, fanning a pod-tailing thread out per worker
//! pod rather than per child-process stream.

use std::sync::{Arc, Mutex};

use rayon::prelude::*;

use crate::cafs::CafsClient;
use crate::config::concurrency::STATS_LOG_FETCH;
use crate::cor::{is_pod_initializing, CorClient, Pod};
use crate::prelude::*;

/// A single log line, either parsed from a worker's structured JSON output
/// or wrapping a control-plane pod's opaque text.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogMessage {
    /// The pipeline that produced this line, if it's a worker log.
    #[serde(default, rename = "pipelineName")]
    pub pipeline_name: Option<String>,
    /// The job that produced this line, if it's a worker log.
    #[serde(default, rename = "jobID")]
    pub job_id: Option<Uuid>,
    /// The datum that produced this line, if any.
    #[serde(default, rename = "datumID")]
    pub datum_id: Option<String>,
    /// The data filter values attached to this line, if any.
    #[serde(default)]
    pub data: Vec<String>,
    /// Was this line emitted by the pipeline's master process?
    #[serde(default)]
    pub master: bool,
    /// The raw text of this line.
    pub message: String,
    /// When this line was emitted, if known.
    #[serde(default)]
    pub ts: Option<chrono::DateTime<Utc>>,
}

/// The pod/container name of the control plane's own deployment, used
/// when `GetLogs` is called with no pipeline/job named.
const CONTROL_PLANE_POD: &str = "flow-control-plane";
const CONTROL_PLANE_CONTAINER: &str = "flowd";

fn control_plane_message(line: &str) -> LogMessage {
    LogMessage {
        pipeline_name: None,
        job_id: None,
        datum_id: None,
        data: Vec::new(),
        master: false,
        message: format!("{}\n", line),
        ts: None,
    }
}

fn parse_worker_line(line: &str) -> Option<LogMessage> {
    serde_json::from_str(line).ok()
}

/// A request to stream logs.
#[derive(Clone, Debug, Default)]
pub struct LogRequest {
    /// Restrict to this pipeline's logs.
    pub pipeline: Option<String>,
    /// Restrict to this job's logs.
    pub job: Option<Uuid>,
    /// Restrict to this datum's logs.
    pub datum: Option<String>,
    /// Restrict to lines emitted by the pipeline's master process.
    pub master_only: bool,
    /// Restrict to lines whose `data` contains every one of these values.
    pub data_filters: Vec<String>,
    /// Tail pods concurrently instead of processing them in pod-name
    /// order.
    pub follow: bool,
}

impl LogRequest {
    fn matches(&self, msg: &LogMessage) -> bool {
        if let Some(pipeline) = &self.pipeline {
            if msg.pipeline_name.as_deref() != Some(pipeline.as_str()) {
                return false;
            }
        }
        if let Some(job) = self.job {
            if msg.job_id != Some(job) {
                return false;
            }
        }
        if let Some(datum) = &self.datum {
            if msg.datum_id.as_deref() != Some(datum.as_str()) {
                return false;
            }
        }
        if self.master_only && !msg.master {
            return false;
        }
        self.data_filters
            .iter()
            .all(|filter| msg.data.iter().any(|d| d == filter))
    }
}

/// A log line sink. Must be `Send` since follow-mode feeds it from
/// multiple pod-tailing threads behind a `Mutex`.
pub type LogSink<'a> = dyn FnMut(LogMessage) + Send + 'a;

/// The log aggregator. Bundles COR (live pod logs) and CAFS (stats-commit
/// logs).
pub struct LogAggregator {
    cor: Arc<dyn CorClient>,
    cafs: Arc<dyn CafsClient>,
}

impl LogAggregator {
    /// Build a log aggregator backed by `cor`/`cafs`.
    pub fn new(cor: Arc<dyn CorClient>, cafs: Arc<dyn CafsClient>) -> Self {
        LogAggregator { cor, cafs }
    }

    /// Stream logs matching `request` to `sink`.
    ///
    /// Authorization is the caller's job: `GetLogs` against a given
    /// pipeline/job requires `authorize_pipeline_operation(..., GetLogs,
    /// ...)`, which needs the resolved pipeline spec the caller already
    /// has in hand; when no pipeline/job is named this reads the control
    /// plane's own logs and needs no authorization.
    ///
    /// `rc_name` identifies the worker pool to tail (`None` ⇒ read the
    /// control-plane pod's logs instead). `stats_commit`, when present,
    /// switches to stats mode regardless of `rc_name`.
    #[tracing::instrument(skip(self, sink), level = "debug")]
    pub fn get_logs(
        &self,
        request: &LogRequest,
        rc_name: Option<&str>,
        stats_commit: Option<&str>,
        sink: &mut LogSink,
    ) -> Result<()> {
        match stats_commit {
            Some(stats_commit) => self.stream_from_stats(request, stats_commit, sink),
            None => self.stream_live(request, rc_name, sink),
        }
    }

    fn stream_live(
        &self,
        request: &LogRequest,
        rc_name: Option<&str>,
        sink: &mut LogSink,
    ) -> Result<()> {
        let rc_name = match rc_name {
            None => return self.stream_control_plane(request, sink),
            Some(rc_name) => rc_name,
        };

        let pods = self.cor.rc_pods(rc_name)?;
        if pods.is_empty() {
            return Err(Error::msg(format!(
                "no worker pods found for replication controller {:?}",
                rc_name
            )));
        }

        let sink = Mutex::new(sink);
        if request.follow {
            crossbeam::scope(|scope| -> Result<()> {
                let handles: Vec<_> = pods
                    .iter()
                    .map(|pod| scope.spawn(|_| self.tail_pod(pod, "worker", request, &sink)))
                    .collect();
                for handle in handles {
                    handle.join().expect("log-tailing thread panicked")?;
                }
                Ok(())
            })
            .map_err(|_| Error::msg("a log-tailing thread panicked"))?
        } else {
            for pod in &pods {
                self.tail_pod(pod, "worker", request, &sink)?;
            }
            Ok(())
        }
    }

    fn stream_control_plane(&self, request: &LogRequest, sink: &mut LogSink) -> Result<()> {
        let lines = match self.cor.pod_logs(CONTROL_PLANE_POD, CONTROL_PLANE_CONTAINER) {
            Ok(lines) => lines,
            Err(err) if is_pod_initializing(&err) => return Ok(()),
            Err(err) => return Err(err),
        };
        for line in lines {
            let msg = control_plane_message(&line);
            if request.matches(&msg) {
                sink(msg);
            }
        }
        Ok(())
    }

    fn tail_pod(
        &self,
        pod: &Pod,
        container: &str,
        request: &LogRequest,
        sink: &Mutex<&mut LogSink>,
    ) -> Result<()> {
        let lines = match self.cor.pod_logs(&pod.name, container) {
            Ok(lines) => lines,
            Err(err) if is_pod_initializing(&err) => return Ok(()),
            Err(err) => return Err(err),
        };
        for line in lines {
            if let Some(msg) = parse_worker_line(&line) {
                if request.matches(&msg) {
                    (sink.lock().expect("log sink mutex poisoned"))(msg);
                }
            }
        }
        Ok(())
    }

    fn stream_from_stats(
        &self,
        request: &LogRequest,
        stats_commit: &str,
        sink: &mut LogSink,
    ) -> Result<()> {
        let log_files = self.cafs.glob_files(stats_commit, "*/logs")?;
        let sink = Mutex::new(sink);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(STATS_LOG_FETCH.min(log_files.len().max(1)))
            .build()
            .context("could not build stats-log thread pool")?;
        pool.install(|| {
            log_files.par_iter().try_for_each(|path| -> Result<()> {
                let bytes = self.cafs.get_file(stats_commit, path)?;
                for line in String::from_utf8_lossy(&bytes).lines() {
                    if let Some(msg) = parse_worker_line(line) {
                        if request.matches(&msg) {
                            (sink.lock().expect("log sink mutex poisoned"))(msg);
                        }
                    }
                }
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_msg(pipeline: &str, job: Uuid, master: bool) -> LogMessage {
        LogMessage {
            pipeline_name: Some(pipeline.to_owned()),
            job_id: Some(job),
            datum_id: None,
            data: Vec::new(),
            master,
            message: "hello".to_owned(),
            ts: None,
        }
    }

    #[test]
    fn request_filters_by_pipeline_and_master_flag() {
        let job = Uuid::new_v4();
        let request = LogRequest {
            pipeline: Some("p1".to_owned()),
            master_only: true,
            ..Default::default()
        };
        assert!(!request.matches(&worker_msg("p1", job, false)));
        assert!(request.matches(&worker_msg("p1", job, true)));
        assert!(!request.matches(&worker_msg("p2", job, true)));
    }

    #[test]
    fn parse_worker_line_drops_malformed_json_silently() {
        assert!(parse_worker_line("not json").is_none());
        assert!(parse_worker_line(r#"{"message":"hi"}"#).is_some());
    }

    #[test]
    fn control_plane_messages_carry_raw_text_with_trailing_newline() {
        let msg = control_plane_message("boot complete");
        assert_eq!(msg.message, "boot complete\n");
        assert!(msg.pipeline_name.is_none());
    }
}
