//! JSON read API over the run store.
//!
//! Handlers take the aggregator's read lock only for the duration of a copy
//! of the requested suffix, never across an await point.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parser::record::CounterInfos;
use crate::store::aggregator::SharedAggregator;
use crate::store::instance::SeriesInstance;
use crate::store::run::{Run, RunId, RunMetadata};
use crate::store::series::SamplePoint;
use crate::store::tasks::TaskSpan;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("run {0} not found")]
    RunNotFound(RunId),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::RunNotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunsResponse {
    pub current: Option<RunId>,
    pub last_finalized: Option<RunId>,
    pub runs: Vec<RunMetadata>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CounterEntry {
    pub name: String,
    pub instances: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountersResponse {
    pub counters: Vec<CounterEntry>,
    pub descriptions: CounterInfos,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolEntry {
    pub pool: Option<String>,
    pub workers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocalityEntry {
    pub locality: String,
    pub worker_count: usize,
    pub pools: Vec<PoolEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    pub name: String,
    /// `locality/pool/worker` (`-` for no pool) or a raw instance path,
    /// optionally written `raw:<path>`.
    pub instance: String,
    #[serde(default)]
    pub from: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SeriesResponse {
    pub name: String,
    pub instance: String,
    pub from: usize,
    /// Index to resume from on the next poll.
    pub next: usize,
    pub points: Vec<SamplePoint>,
}

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    pub locality: String,
    pub worker: String,
    #[serde(default)]
    pub from: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TasksResponse {
    pub locality: String,
    pub worker: String,
    pub from: usize,
    pub next: usize,
    pub tasks: Vec<TaskSpan>,
}

/// Routes of the read API, ready to merge into the health server.
pub fn router(store: SharedAggregator) -> Router {
    Router::new()
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/counters", get(get_counters))
        .route("/api/runs/{id}/localities", get(get_localities))
        .route("/api/runs/{id}/series", get(get_series))
        .route("/api/runs/{id}/tasks", get(get_tasks))
        .with_state(store)
}

fn with_run<T>(
    store: &SharedAggregator,
    id: RunId,
    f: impl FnOnce(&Run) -> T,
) -> Result<T, ApiError> {
    let guard = store.read();
    guard.run(id).map(f).ok_or(ApiError::RunNotFound(id))
}

/// GET /api/runs
pub async fn list_runs(State(store): State<SharedAggregator>) -> Json<RunsResponse> {
    let guard = store.read();
    Json(RunsResponse {
        current: guard.current_run().map(Run::id),
        last_finalized: guard.last_finalized_run().map(Run::id),
        runs: guard.list_runs().iter().map(Run::metadata).collect(),
    })
}

/// GET /api/runs/{id}
pub async fn get_run(
    State(store): State<SharedAggregator>,
    Path(id): Path<RunId>,
) -> Result<Json<RunMetadata>, ApiError> {
    with_run(&store, id, Run::metadata).map(Json)
}

/// GET /api/runs/{id}/counters
pub async fn get_counters(
    State(store): State<SharedAggregator>,
    Path(id): Path<RunId>,
) -> Result<Json<CountersResponse>, ApiError> {
    with_run(&store, id, |run| CountersResponse {
        counters: run
            .list_counter_names()
            .iter()
            .map(|name| CounterEntry {
                name: name.clone(),
                instances: run
                    .series()
                    .list_instances(name)
                    .into_iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect(),
        descriptions: run.counter_descriptions().clone(),
    })
    .map(Json)
}

/// GET /api/runs/{id}/localities
pub async fn get_localities(
    State(store): State<SharedAggregator>,
    Path(id): Path<RunId>,
) -> Result<Json<Vec<LocalityEntry>>, ApiError> {
    with_run(&store, id, |run| {
        run.list_localities()
            .into_iter()
            .map(|locality| LocalityEntry {
                locality: locality.to_string(),
                worker_count: run.worker_count(locality),
                pools: run
                    .list_pools(locality)
                    .into_iter()
                    .map(|pool| PoolEntry {
                        pool: pool.map(str::to_string),
                        workers: run
                            .list_workers(locality, pool)
                            .into_iter()
                            .map(str::to_string)
                            .collect(),
                    })
                    .collect(),
            })
            .collect()
    })
    .map(Json)
}

/// GET /api/runs/{id}/series?name=..&instance=..&from=..
pub async fn get_series(
    State(store): State<SharedAggregator>,
    Path(id): Path<RunId>,
    Query(q): Query<SeriesQuery>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let points = with_run(&store, id, |run| {
        let instance = resolve_instance(run, &q.name, &q.instance);
        run.get_series(&q.name, &instance, q.from).to_vec()
    })?;

    Ok(Json(SeriesResponse {
        next: q.from + points.len(),
        name: q.name,
        instance: q.instance,
        from: q.from,
        points,
    }))
}

/// Instance a series query key names in `run`. A key shaped like an
/// instance id with no such series may still be a raw path.
fn resolve_instance(run: &Run, name: &str, key: &str) -> SeriesInstance {
    let instance = SeriesInstance::from_key(key);
    if instance.as_id().is_some() && run.series().series_index(name, &instance).is_none() {
        return SeriesInstance::Raw(key.to_string());
    }
    instance
}

/// GET /api/runs/{id}/tasks?locality=..&worker=..&from=..
pub async fn get_tasks(
    State(store): State<SharedAggregator>,
    Path(id): Path<RunId>,
    Query(q): Query<TasksQuery>,
) -> Result<Json<TasksResponse>, ApiError> {
    let tasks = with_run(&store, id, |run| {
        run.get_task_events(&q.locality, &q.worker, q.from).to_vec()
    })?;

    Ok(Json(TasksResponse {
        next: q.from + tasks.len(),
        locality: q.locality,
        worker: q.worker,
        from: q.from,
        tasks,
    }))
}
