//! The RPC surface client: a thin HTTP client `flowctl` uses to talk to
//! `flowd`'s `axum` server.

use reqwest;
use serde::de::DeserializeOwned;
use std::usize;
use url::Url;

use crate::db::{self, ConnectVia};
use crate::logs::{LogMessage, LogRequest};
use crate::models::datum::{DatumDetail, DatumInfo};
use crate::models::job::JobInfo;
use crate::models::pipeline::{PipelineInfo, PipelineSpec};
use crate::prelude::*;

/// Body for `POST /jobs`.
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateJobRequest {
    /// The pipeline to run this job under.
    pub pipeline_name: String,
    /// Commit IDs this job's atom inputs should resolve to, keyed by atom
    /// name. Left empty to resolve against each input's current branch
    /// HEAD.
    #[serde(default)]
    pub input_commits: HashMap<String, String>,
}

/// Body for `POST /jobs/:id/restart_datum`.
#[derive(Debug, Deserialize, Serialize)]
pub struct RestartDatumRequest {
    /// Only cancel in-flight processing of datums matching every one of
    /// these data filters.
    #[serde(default)]
    pub data_filters: Vec<String>,
}

/// Body for `POST /pipelines` and `PATCH /pipelines/:name`.
#[derive(Debug, Deserialize, Serialize)]
pub struct UpsertPipelineRequest {
    /// The pipeline spec as supplied by the caller, pre-defaulting.
    pub spec: PipelineSpec,
    /// For Update only: mint a fresh salt, discarding incremental cache
    /// reuse.
    #[serde(default)]
    pub reprocess: bool,
}

/// Query parameters for `GET /jobs`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ListJobQuery {
    /// Restrict to this pipeline's jobs.
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Restrict to jobs writing to this output commit.
    #[serde(default)]
    pub output_commit: Option<String>,
    /// Restrict to jobs whose inputs resolved every one of these commits.
    #[serde(default)]
    pub input_commits: Vec<String>,
}

/// Query parameters for `GET /jobs/:id/datums`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ListDatumQuery {
    /// Zero-indexed page number.
    #[serde(default)]
    pub page: i64,
    /// Datums per page. Zero or negative returns every datum.
    #[serde(default)]
    pub page_size: i64,
}

/// A client for talking to `flowd`.
pub struct Client {
    via: ConnectVia,
    url: Url,
    username: String,
    password: String,
    client: reqwest::blocking::Client,
}

impl Client {
    /// Create a new client, connecting to `flowd` as specified.
    pub fn new(via: ConnectVia) -> Result<Client> {
        let url = match via {
            ConnectVia::Cluster => "http://flowd:8089/",
            ConnectVia::Proxy => "http://localhost:8089/",
        }
        .parse()
        .expect("could not parse URL in source code");

        // For now, we reuse our database password for API access, too.
        let username = "flow".to_owned();
        let password = db::postgres_password(via)?;

        let max_idle = match via {
            // On the cluster, connection startup is cheap but we may have
            // hundreds of inbound connections, so drop connections fast.
            ConnectVia::Cluster => 0,
            ConnectVia::Proxy => usize::MAX,
        };

        let client = reqwest::blocking::Client::builder()
            .max_idle_per_host(max_idle)
            .build()
            .context("cannot build HTTP client")?;

        Ok(Client {
            via,
            url,
            username,
            password,
            client,
        })
    }

    /// Create a pipeline.
    ///
    /// `POST /pipelines`
    pub fn create_pipeline(&self, spec: &PipelineSpec) -> Result<PipelineInfo> {
        let url = self.url.join("pipelines")?;
        let body = UpsertPipelineRequest {
            spec: spec.clone(),
            reprocess: false,
        };
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .with_context(|| format!("error posting {}", url))?;
        self.handle_json_response(&url, resp)
    }

    /// Update a pipeline, optionally reprocessing.
    ///
    /// `PATCH /pipelines/:name`
    pub fn update_pipeline(
        &self,
        name: &str,
        spec: &PipelineSpec,
        reprocess: bool,
    ) -> Result<PipelineInfo> {
        let url = self.url.join(&format!("pipelines/{}", name))?;
        let body = UpsertPipelineRequest {
            spec: spec.clone(),
            reprocess,
        };
        let resp = self
            .client
            .patch(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .with_context(|| format!("error patching {}", url))?;
        self.handle_json_response(&url, resp)
    }

    /// Inspect a pipeline by name.
    ///
    /// `GET /pipelines/:name`
    pub fn pipeline(&self, name: &str) -> Result<PipelineInfo> {
        let url = self.url.join(&format!("pipelines/{}", name))?;
        self.via.retry_if_appropriate(|| {
            let resp = self
                .client
                .get(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .with_context(|| format!("error getting {}", url))?;
            self.handle_json_response(&url, resp)
        })
    }

    /// List every pipeline.
    ///
    /// `GET /pipelines`
    pub fn pipelines(&self) -> Result<Vec<PipelineInfo>> {
        let url = self.url.join("pipelines")?;
        self.via.retry_if_appropriate(|| {
            let resp = self
                .client
                .get(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .with_context(|| format!("error getting {}", url))?;
            self.handle_json_response(&url, resp)
        })
    }

    /// Delete a pipeline.
    ///
    /// `DELETE /pipelines/:name`
    pub fn delete_pipeline(&self, name: &str) -> Result<()> {
        let url = self.url.join(&format!("pipelines/{}", name))?;
        let resp = self
            .client
            .delete(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error deleting {}", url))?;
        self.handle_empty_response(&url, resp)
    }

    /// Resume a paused pipeline.
    ///
    /// `POST /pipelines/:name/start`
    pub fn start_pipeline(&self, name: &str) -> Result<()> {
        let url = self.url.join(&format!("pipelines/{}/start", name))?;
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error posting {}", url))?;
        self.handle_empty_response(&url, resp)
    }

    /// Pause a running pipeline.
    ///
    /// `POST /pipelines/:name/stop`
    pub fn stop_pipeline(&self, name: &str) -> Result<()> {
        let url = self.url.join(&format!("pipelines/{}/stop", name))?;
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error posting {}", url))?;
        self.handle_empty_response(&url, resp)
    }

    /// Always fails: reserved for a future re-run feature.
    ///
    /// `POST /pipelines/:name/rerun`
    pub fn rerun_pipeline(&self, name: &str) -> Result<()> {
        let url = self.url.join(&format!("pipelines/{}/rerun", name))?;
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error posting {}", url))?;
        self.handle_empty_response(&url, resp)
    }

    /// Create a job.
    ///
    /// `POST /jobs`
    pub fn create_job(&self, request: &CreateJobRequest) -> Result<JobInfo> {
        let url = self.url.join("jobs")?;
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .json(request)
            .send()
            .with_context(|| format!("error posting {}", url))?;
        self.handle_json_response(&url, resp)
    }

    /// Fetch a job by ID, optionally blocking until it reaches a
    /// terminal state.
    ///
    /// `GET /jobs/:id?block=true`
    pub fn job(&self, id: Uuid, block_state: bool) -> Result<JobInfo> {
        let mut url = self.url.join(&format!("jobs/{}", id))?;
        if block_state {
            url.query_pairs_mut().append_pair("block", "true").finish();
        }
        self.via.retry_if_appropriate(|| {
            let resp = self
                .client
                .get(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .with_context(|| format!("error getting {}", url))?;
            self.handle_json_response(&url, resp)
        })
    }

    /// List jobs matching `query`.
    ///
    /// `GET /jobs`
    pub fn jobs(&self, query: &ListJobQuery) -> Result<Vec<JobInfo>> {
        let mut url = self.url.join("jobs")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(pipeline) = &query.pipeline {
                pairs.append_pair("pipeline", pipeline);
            }
            if let Some(output_commit) = &query.output_commit {
                pairs.append_pair("output_commit", output_commit);
            }
            if !query.input_commits.is_empty() {
                pairs.append_pair("input_commit", &query.input_commits.join(","));
            }
        }
        self.via.retry_if_appropriate(|| {
            let resp = self
                .client
                .get(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .with_context(|| format!("error getting {}", url))?;
            self.handle_json_response(&url, resp)
        })
    }

    /// Delete a job.
    ///
    /// `DELETE /jobs/:id`
    pub fn delete_job(&self, id: Uuid) -> Result<()> {
        let url = self.url.join(&format!("jobs/{}", id))?;
        let resp = self
            .client
            .delete(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error deleting {}", url))?;
        self.handle_empty_response(&url, resp)
    }

    /// Stop a job.
    ///
    /// `POST /jobs/:id/stop`
    pub fn stop_job(&self, id: Uuid) -> Result<JobInfo> {
        let url = self.url.join(&format!("jobs/{}/stop", id))?;
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error posting {}", url))?;
        self.handle_json_response(&url, resp)
    }

    /// Cancel in-flight processing of datums matching `data_filters`.
    ///
    /// `POST /jobs/:id/restart_datum`
    pub fn restart_datum(&self, id: Uuid, data_filters: &[String]) -> Result<()> {
        let url = self.url.join(&format!("jobs/{}/restart_datum", id))?;
        let body = RestartDatumRequest {
            data_filters: data_filters.to_vec(),
        };
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .with_context(|| format!("error posting {}", url))?;
        self.handle_empty_response(&url, resp)
    }

    /// List a job's datums.
    ///
    /// `GET /jobs/:id/datums`
    pub fn datums(&self, job_id: Uuid, query: &ListDatumQuery) -> Result<Vec<DatumInfo>> {
        let mut url = self.url.join(&format!("jobs/{}/datums", job_id))?;
        url.query_pairs_mut()
            .append_pair("page", &query.page.to_string())
            .append_pair("page_size", &query.page_size.to_string())
            .finish();
        self.via.retry_if_appropriate(|| {
            let resp = self
                .client
                .get(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .with_context(|| format!("error getting {}", url))?;
            self.handle_json_response(&url, resp)
        })
    }

    /// Inspect a single datum.
    ///
    /// `GET /jobs/:id/datums/:datum_id`
    pub fn datum(&self, job_id: Uuid, datum_id: &str) -> Result<DatumDetail> {
        let url = self
            .url
            .join(&format!("jobs/{}/datums/{}", job_id, datum_id))?;
        self.via.retry_if_appropriate(|| {
            let resp = self
                .client
                .get(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .with_context(|| format!("error getting {}", url))?;
            self.handle_json_response(&url, resp)
        })
    }

    /// Stream a job's logs, invoking `on_message` for each line received.
    ///
    /// `GET /jobs/:id/logs`
    ///
    /// Issues a single request and parses the response body as
    /// newline-delimited JSON once the full response has arrived.
    pub fn logs(
        &self,
        job_id: Uuid,
        request: &LogRequest,
        mut on_message: impl FnMut(LogMessage),
    ) -> Result<()> {
        let mut url = self.url.join(&format!("jobs/{}/logs", job_id))?;
        {
            let mut pairs = url.query_pairs_mut();
            if request.master_only {
                pairs.append_pair("master", "true");
            }
            if let Some(datum) = &request.datum {
                pairs.append_pair("datum", datum);
            }
            if !request.data_filters.is_empty() {
                pairs.append_pair("data", &request.data_filters.join(","));
            }
            if request.follow {
                pairs.append_pair("follow", "true");
            }
        }
        let resp = self
            .client
            .get(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error getting {}", url))?;
        if !resp.status().is_success() {
            return Err(self.handle_error_response(&url, resp));
        }
        let body = resp.text().with_context(|| format!("error reading {}", url))?;
        for line in body.lines() {
            if line.is_empty() {
                continue;
            }
            let msg: LogMessage = serde_json::from_str(line)
                .with_context(|| format!("error parsing log line from {}", url))?;
            on_message(msg);
        }
        Ok(())
    }

    /// Run a garbage-collection pass.
    ///
    /// `POST /gc`
    pub fn garbage_collect(&self) -> Result<crate::gc::GcReport> {
        let url = self.url.join("gc")?;
        let resp = self
            .client
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error posting {}", url))?;
        self.handle_json_response(&url, resp)
    }

    /// Delete every pipeline and job. Requires cluster-admin.
    ///
    /// `DELETE /all`
    pub fn delete_all(&self) -> Result<()> {
        let url = self.url.join("all")?;
        let resp = self
            .client
            .delete(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("error deleting {}", url))?;
        self.handle_empty_response(&url, resp)
    }

    /// Check the HTTP status code and parse a JSON response.
    fn handle_json_response<T>(&self, url: &Url, resp: reqwest::blocking::Response) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if resp.status().is_success() {
            resp.json().with_context(|| format!("error parsing {}", url))
        } else {
            Err(self.handle_error_response(url, resp))
        }
    }

    /// Check the HTTP status code of a response with no body.
    fn handle_empty_response(&self, url: &Url, resp: reqwest::blocking::Response) -> Result<()> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.handle_error_response(url, resp))
        }
    }

    /// Extract an error from an HTTP response payload.
    fn handle_error_response(&self, url: &Url, resp: reqwest::blocking::Response) -> Error {
        let status = resp.status();
        match resp.text() {
            Ok(body) => Error::msg(format!(
                "unexpected HTTP status {} for {}:\n{}",
                status, url, body,
            )),
            Err(err) => err.into(),
        }
    }
}
