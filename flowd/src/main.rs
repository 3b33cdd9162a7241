//! The control plane's HTTP server: the RPC surface wired up over
//! `axum`.

mod babysitter;

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use headers::{authorization::Basic, Authorization, HeaderMapExt};
use tower_http::trace::TraceLayer;

use flow_common::auth::{self, AuthBackend, NoAuth};
use flow_common::cafs::{CafsClient, InMemoryCafs};
use flow_common::config::ServerConfig;
use flow_common::cor::{CorClient, KubectlCor};
use flow_common::datum_view::{CafsDatumFactory, DatumFactory, DatumView};
use flow_common::db::{self, ConnectVia};
use flow_common::gc::{GarbageCollector, GcReport};
use flow_common::job_store::JobStore;
use flow_common::logs::{LogAggregator, LogMessage, LogRequest};
use flow_common::pipeline_store::PipelineStore;
use flow_common::prelude::*;
use flow_common::rest_api::{
    CreateJobRequest, ListJobQuery, RestartDatumRequest, UpsertPipelineRequest,
};

/// The server's shared, process-wide state. Every collaborator here is
/// cheap to clone the `Arc` of, so handlers just hold an `Arc<AppState>`.
struct AppState {
    cafs: Arc<dyn CafsClient>,
    auth: Arc<dyn AuthBackend>,
    pipeline_store: PipelineStore,
    job_store: JobStore,
    datum_view: DatumView,
    log_aggregator: LogAggregator,
    gc: GarbageCollector,
    config: ServerConfig,
}

impl AppState {
    fn block_inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.block_inspect_timeout_secs)
    }
}

/// Run `f` (which does blocking Postgres/CAFS/COR I/O) on a blocking
/// worker thread, keeping the async runtime's reactor free.
async fn blocking<F, T>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(AppError),
        Err(join_err) => Err(AppError(Error::msg(format!(
            "worker thread panicked: {}",
            join_err
        )))),
    }
}

/// The caller identity used for authorization checks, read from HTTP
/// basic auth. Under [`NoAuth`] (the production default) this value
/// is never actually checked, but we still thread it through so swapping
/// in an active `AuthBackend` doesn't require touching every handler.
fn caller_from_headers(headers: &HeaderMap) -> String {
    headers
        .typed_get::<Authorization<Basic>>()
        .map(|auth| auth.username().to_owned())
        .unwrap_or_else(|| "anonymous".to_owned())
}

fn connect() -> Result<PgConnection> {
    db::connect(ConnectVia::Cluster)
}

/// Wraps any error this server produces, mapping it to an HTTP status
/// and a small JSON body.
struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for_error(&self.0);
        let body = Json(serde_json::json!({
            "error": format!("{:#}", self.0),
        }));
        (status, body).into_response()
    }
}

fn status_for_error(err: &Error) -> StatusCode {
    match err.downcast_ref::<CoreError>() {
        Some(CoreError::PipelineNotFound { .. }) | Some(CoreError::JobNotFound { .. }) => {
            StatusCode::NOT_FOUND
        }
        Some(CoreError::PipelineAlreadyExists { .. }) => StatusCode::CONFLICT,
        Some(CoreError::NotAuthorized { .. }) => StatusCode::FORBIDDEN,
        Some(CoreError::Validation { .. })
        | Some(CoreError::EmptyInput { .. })
        | Some(CoreError::ParentInputsMismatch { .. }) => StatusCode::BAD_REQUEST,
        Some(CoreError::TransientRpc { .. }) | Some(CoreError::Unavailable { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Some(CoreError::Unimplemented { .. }) => StatusCode::NOT_IMPLEMENTED,
        Some(CoreError::Invariant { .. }) | None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// This build's version string.
async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

async fn create_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpsertPipelineRequest>,
) -> Result<Json<PipelineInfo>, AppError> {
    let caller = caller_from_headers(&headers);
    let info = blocking(move || {
        let mut conn = connect()?;
        state.pipeline_store.create(&caller, body.spec, &mut conn)
    })
    .await?;
    Ok(Json(info))
}

async fn update_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpsertPipelineRequest>,
) -> Result<Json<PipelineInfo>, AppError> {
    let caller = caller_from_headers(&headers);
    let info = blocking(move || {
        let mut conn = connect()?;
        state
            .pipeline_store
            .update(&caller, &name, body.spec, body.reprocess, &mut conn)
    })
    .await?;
    Ok(Json(info))
}

async fn inspect_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<PipelineInfo>, AppError> {
    let info = blocking(move || {
        let mut conn = connect()?;
        state.pipeline_store.inspect(&name, &mut conn)
    })
    .await?;
    Ok(Json(info))
}

async fn list_pipelines(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PipelineInfo>>, AppError> {
    let infos = blocking(move || {
        let mut conn = connect()?;
        state.pipeline_store.list(&mut conn)
    })
    .await?;
    Ok(Json(infos))
}

async fn delete_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let caller = caller_from_headers(&headers);
    blocking(move || {
        let mut conn = connect()?;
        state
            .pipeline_store
            .delete(&caller, &name, &state.job_store, &mut conn)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let caller = caller_from_headers(&headers);
    blocking(move || {
        let mut conn = connect()?;
        state.pipeline_store.start(&caller, &name, &mut conn)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let caller = caller_from_headers(&headers);
    blocking(move || {
        let mut conn = connect()?;
        state.pipeline_store.stop(&caller, &name, &mut conn)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reserved for a future re-run feature; always fails.
async fn rerun_pipeline(Path(_name): Path<String>) -> AppError {
    AppError(
        CoreError::Unimplemented {
            operation: "RerunPipeline".to_owned(),
        }
        .into(),
    )
}

/// Resolve every Atom leaf of `input` to its branch HEAD, keyed by the
/// input's (already-defaulted) name. Used by `CreateJob` when the caller
/// didn't pin specific input commits.
fn resolve_default_input_commits(
    input: &Input,
    cafs: &dyn CafsClient,
) -> Result<HashMap<String, String>> {
    let mut resolved = HashMap::new();
    collect_default_input_commits(input, cafs, &mut resolved)?;
    Ok(resolved)
}

fn collect_default_input_commits(
    input: &Input,
    cafs: &dyn CafsClient,
    out: &mut HashMap<String, String>,
) -> Result<()> {
    match input {
        Input::Atom {
            name, repo, branch, ..
        } => {
            let name = name.clone().unwrap_or_else(|| repo.clone());
            let branch = branch.as_deref().unwrap_or("master");
            if let Some(commit) = cafs.branch_head(repo, branch)? {
                out.insert(name, commit);
            }
            Ok(())
        }
        Input::Cron { .. } | Input::Git { .. } => Ok(()),
        Input::Union(children) | Input::Cross(children) => {
            for child in children {
                collect_default_input_commits(child, cafs, out)?;
            }
            Ok(())
        }
    }
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobRequest>,
) -> Result<Json<JobInfo>, AppError> {
    let info = blocking(move || {
        let mut conn = connect()?;
        let pointer = PipelinePointer::find(&body.pipeline_name, &mut conn)?;
        let bytes = state.cafs.get_file(&pointer.spec_commit_id, SPEC_FILE)?;
        let spec: PipelineSpec =
            serde_json::from_slice(&bytes).context("could not parse pipeline spec from CAFS")?;

        let input_commits = if body.input_commits.is_empty() {
            resolve_default_input_commits(&spec.input, state.cafs.as_ref())?
        } else {
            body.input_commits
        };

        let output_commit = state.cafs.start_commit(&spec.name, &spec.output_branch)?;
        let mut provenance: Vec<String> = input_commits.values().cloned().collect();
        provenance.push(pointer.spec_commit_id.clone());
        state.cafs.set_commit_provenance(&output_commit, &provenance)?;

        let job = state
            .job_store
            .create(&pointer, output_commit, input_commits, &mut conn)?;
        state
            .job_store
            .inspect(job.id, false, Duration::ZERO, &mut conn)
    })
    .await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct InspectJobParams {
    #[serde(default)]
    block: bool,
}

async fn inspect_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<InspectJobParams>,
) -> Result<Json<JobInfo>, AppError> {
    let timeout = state.block_inspect_timeout();
    let info = blocking(move || {
        let mut conn = connect()?;
        state.job_store.inspect(id, params.block, timeout, &mut conn)
    })
    .await?;
    Ok(Json(info))
}

#[derive(Debug, Default, Deserialize)]
struct ListJobParams {
    #[serde(default)]
    pipeline: Option<String>,
    #[serde(default)]
    output_commit: Option<String>,
    #[serde(default)]
    input_commit: Option<String>,
}

impl From<ListJobParams> for ListJobQuery {
    fn from(params: ListJobParams) -> Self {
        ListJobQuery {
            pipeline: params.pipeline,
            output_commit: params.output_commit,
            input_commits: params
                .input_commit
                .map(|s| s.split(',').map(str::to_owned).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        }
    }
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobParams>,
) -> Result<Json<Vec<JobInfo>>, AppError> {
    let query: ListJobQuery = params.into();
    let infos = blocking(move || {
        let mut conn = connect()?;
        state.job_store.list(
            query.pipeline.as_deref(),
            query.output_commit.as_deref(),
            &query.input_commits,
            &mut conn,
        )
    })
    .await?;
    Ok(Json(infos))
}

async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    blocking(move || {
        let mut conn = connect()?;
        state.job_store.delete(id, &mut conn)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobInfo>, AppError> {
    let job = blocking(move || {
        let mut conn = connect()?;
        state.job_store.stop(id, &mut conn)?;
        state.job_store.inspect(id, false, Duration::ZERO, &mut conn)
    })
    .await?;
    Ok(Json(job))
}

async fn restart_datum(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<RestartDatumRequest>,
) -> Result<StatusCode, AppError> {
    blocking(move || {
        let mut conn = connect()?;
        state.job_store.restart_datum(id, &body.data_filters, &mut conn)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct ListDatumParams {
    #[serde(default)]
    page: i64,
    #[serde(default)]
    page_size: i64,
}

async fn list_datums(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<ListDatumParams>,
) -> Result<Json<Vec<DatumInfo>>, AppError> {
    let page_size = if params.page_size == 0 {
        state.config.default_page_size
    } else {
        params.page_size
    };
    let infos = blocking(move || {
        let mut conn = connect()?;
        let job = state.job_store.inspect(id, false, Duration::ZERO, &mut conn)?;
        state.datum_view.list(&job, params.page, page_size)
    })
    .await?;
    Ok(Json(infos))
}

async fn inspect_datum(
    State(state): State<Arc<AppState>>,
    Path((id, datum_id)): Path<(Uuid, String)>,
) -> Result<Json<DatumDetail>, AppError> {
    let detail = blocking(move || {
        let mut conn = connect()?;
        let job = state.job_store.inspect(id, false, Duration::ZERO, &mut conn)?;
        let stats_commit = job
            .stats_commit
            .clone()
            .ok_or_else(|| Error::msg("job has no stats commit"))?;
        state.datum_view.inspect(&job, &stats_commit, &datum_id)
    })
    .await?;
    Ok(Json(detail))
}

#[derive(Debug, Default, Deserialize)]
struct GetLogsParams {
    #[serde(default)]
    pipeline: Option<String>,
    #[serde(default)]
    datum: Option<String>,
    #[serde(default, rename = "master")]
    master_only: bool,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    follow: bool,
}

async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<GetLogsParams>,
) -> Result<String, AppError> {
    let request = LogRequest {
        pipeline: params.pipeline,
        job: Some(id),
        datum: params.datum,
        master_only: params.master_only,
        data_filters: params
            .data
            .map(|s| s.split(',').map(str::to_owned).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default(),
        follow: params.follow,
    };

    let lines: Vec<String> = blocking(move || -> Result<Vec<String>> {
        let mut conn = connect()?;
        let pointer = JobPointer::find(id, &mut conn)?;
        let job = state.job_store.inspect(id, false, Duration::ZERO, &mut conn)?;
        let rc_name = state.job_store.rc_name_for_job(&pointer)?;

        let mut lines = Vec::new();
        let mut sink = |msg: LogMessage| {
            if let Ok(line) = serde_json::to_string(&msg) {
                lines.push(line);
            }
        };
        state.log_aggregator.get_logs(
            &request,
            Some(rc_name.as_str()),
            job.stats_commit.as_deref(),
            &mut sink,
        )?;
        Ok(lines)
    })
    .await?;

    Ok(lines.join("\n") + if lines.is_empty() { "" } else { "\n" })
}

async fn garbage_collect(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GcReport>, AppError> {
    let report = blocking(move || {
        let mut conn = connect()?;
        state.gc.collect(&mut conn)
    })
    .await?;
    Ok(Json(report))
}

async fn delete_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let caller = caller_from_headers(&headers);
    blocking(move || -> Result<()> {
        auth::require_cluster_admin(state.auth.as_ref(), &caller)?;
        let mut conn = connect()?;
        let pipelines = state.pipeline_store.list(&mut conn)?;
        for pipeline in pipelines {
            state
                .pipeline_store
                .delete("cluster-admin", &pipeline.spec.name, &state.job_store, &mut conn)?;
        }
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/pipelines", post(create_pipeline).get(list_pipelines))
        .route(
            "/pipelines/:name",
            get(inspect_pipeline)
                .patch(update_pipeline)
                .delete(delete_pipeline),
        )
        .route("/pipelines/:name/start", post(start_pipeline))
        .route("/pipelines/:name/stop", post(stop_pipeline))
        .route("/pipelines/:name/rerun", post(rerun_pipeline))
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/:id", get(inspect_job).delete(delete_job))
        .route("/jobs/:id/stop", post(stop_job))
        .route("/jobs/:id/restart_datum", post(restart_datum))
        .route("/jobs/:id/datums", get(list_datums))
        .route("/jobs/:id/datums/:datum_id", get(inspect_datum))
        .route("/jobs/:id/logs", get(get_logs))
        .route("/gc", post(garbage_collect))
        .route("/all", axum::routing::delete(delete_all))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    flow_common::tracing_support::initialize_tracing();
    openssl_probe::init_ssl_cert_env_vars();

    let config = ServerConfig::from_env();
    let namespace = env::var("FLOW_NAMESPACE").unwrap_or_else(|_| "default".to_owned());

    // No real CAFS deployment exists for this exercise; `InMemoryCafs` is
    // the only `CafsClient` we have, so it's what development and (for
    // now) production both wire up.
    let cafs: Arc<dyn CafsClient> = Arc::new(InMemoryCafs::new());
    let cor: Arc<dyn CorClient> = Arc::new(KubectlCor::new(namespace));

    // Non-essential: a failed cluster-access check is logged and
    // ignored, not fatal.
    if let Err(err) = cor.validate_kube() {
        tracing::warn!(error = %err, "cluster access validation failed; continuing anyway");
    }

    let auth = Arc::new(NoAuth);
    let factory: Arc<dyn DatumFactory> = Arc::new(CafsDatumFactory::new(cafs.clone()));

    // Read the PPS capability token once at startup and cache it for the
    // rest of the process's life; every spec-repo write switches to it
    // rather than using whatever identity the ordinary `cafs` handle was
    // built with.
    let pps_token = {
        let mut conn = connect()?;
        flow_common::kv::read_pps_token(&mut conn)?
    };

    let state = Arc::new(AppState {
        cafs: cafs.clone(),
        auth: auth.clone(),
        pipeline_store: PipelineStore::new(cafs.clone(), &pps_token, cor.clone(), auth.clone()),
        job_store: JobStore::new(cafs.clone()),
        datum_view: DatumView::new(cafs.clone(), factory),
        log_aggregator: LogAggregator::new(cor.clone(), cafs.clone()),
        gc: GarbageCollector::new(cafs.clone()),
        config: config.clone(),
    });

    babysitter::start_babysitter(cafs, cor)?;

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "flowd listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .context("error running HTTP server")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_common::cafs::InMemoryCafs;
    use headers::HeaderMapExt;

    #[test]
    fn status_for_error_maps_every_core_error_variant() {
        assert_eq!(
            status_for_error(&CoreError::PipelineNotFound { name: "p".to_owned() }.into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for_error(&CoreError::JobNotFound { id: Uuid::new_v4() }.into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for_error(&CoreError::PipelineAlreadyExists { name: "p".to_owned() }.into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for_error(
                &CoreError::NotAuthorized {
                    repo: "r".to_owned(),
                    scope: "WRITER".to_owned(),
                }
                .into()
            ),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for_error(&CoreError::Validation { message: "bad".to_owned() }.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for_error(
                &CoreError::TransientRpc {
                    subsystem: "TX-KV".to_owned(),
                    message: "timed out".to_owned(),
                }
                .into()
            ),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for_error(&CoreError::Unimplemented { operation: "RerunPipeline".to_owned() }.into()),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            status_for_error(&CoreError::Invariant { message: "oops".to_owned() }.into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for_error(&Error::msg("some unrelated failure")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn caller_from_headers_falls_back_to_anonymous() {
        let headers = HeaderMap::new();
        assert_eq!(caller_from_headers(&headers), "anonymous");
    }

    #[test]
    fn caller_from_headers_reads_basic_auth_username() {
        let mut headers = HeaderMap::new();
        headers.typed_insert(Authorization::basic("alice", "hunter2"));
        assert_eq!(caller_from_headers(&headers), "alice");
    }

    #[test]
    fn list_job_params_splits_comma_joined_input_commits() {
        let params = ListJobParams {
            pipeline: Some("p".to_owned()),
            output_commit: None,
            input_commit: Some("c1,c2,,c3".to_owned()),
        };
        let query: ListJobQuery = params.into();
        assert_eq!(query.pipeline.as_deref(), Some("p"));
        assert_eq!(query.input_commits, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn list_job_params_defaults_to_no_input_commit_filter() {
        let query: ListJobQuery = ListJobParams::default().into();
        assert!(query.input_commits.is_empty());
    }

    #[test]
    fn resolve_default_input_commits_reads_every_atom_branch_head() {
        let cafs = InMemoryCafs::new();
        cafs.create_repo("a").unwrap();
        cafs.create_branch("a", "master").unwrap();
        let commit = cafs.start_commit("a", "master").unwrap();
        cafs.put_file(&commit, "/f", b"x").unwrap();
        cafs.finish_commit(&commit).unwrap();

        let input = Input::Union(vec![Input::Atom {
            name: Some("a".to_owned()),
            repo: "a".to_owned(),
            branch: Some("master".to_owned()),
            glob: "/*".to_owned(),
            commit_id: None,
        }]);
        let resolved = resolve_default_input_commits(&input, &cafs).unwrap();
        assert_eq!(resolved.get("a"), Some(&commit));
    }

    #[test]
    fn resolve_default_input_commits_skips_atoms_with_no_branch_head_yet() {
        let cafs = InMemoryCafs::new();
        cafs.create_repo("a").unwrap();
        cafs.create_branch("a", "master").unwrap();

        let input = Input::Atom {
            name: None,
            repo: "a".to_owned(),
            branch: Some("master".to_owned()),
            glob: "/*".to_owned(),
            commit_id: None,
        };
        let resolved = resolve_default_input_commits(&input, &cafs).unwrap();
        assert!(resolved.is_empty());
    }
}
