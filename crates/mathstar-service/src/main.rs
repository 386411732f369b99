use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use mathstar_core::{
    AnswerInput, AnswerOutcome, AnswerRecord, CollectionSummary, DrawOutcome, RewardError,
    RewardLedger, RewardPolicy, RewardSummary, StreakState, StreakUpdate, StudentId, StudentStats,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::UtcOffset;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod api;

use api::RewardApi;

const SERVICE_CONTRACT_VERSION: &str = "mathstar.v1";
const DEFAULT_LOG_FILTER: &str = "mathstar_service=info,mathstar_store_sqlite=info,tower_http=info";
const READ_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
struct ServiceState {
    api: RewardApi,
    student: StudentId,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecentAnswersQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    student_id: StudentId,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    degraded_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    insufficient_funds_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    inconsistent_state_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    degraded_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    insufficient_funds_total: u64,
    storage_unavailable_total: u64,
    inconsistent_state_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "mathstar-service")]
#[command(about = "Local HTTP service for Mathstar rewards")]
struct Args {
    #[arg(long, env = "MATHSTAR_DB", default_value = "./mathstar.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "MATHSTAR_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "MATHSTAR_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "MATHSTAR_STUDENT_ID", default_value_t = 1)]
    student: i64,
    #[arg(long, env = "MATHSTAR_STARS_PER_CORRECT", default_value_t = 1)]
    stars_per_correct: u32,
    #[arg(long, env = "MATHSTAR_GACHA_COST", default_value_t = 10)]
    gacha_cost: u32,
    #[arg(
        long,
        env = "MATHSTAR_UTC_OFFSET_HOURS",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    utc_offset_hours: i8,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn invalid_query_with_telemetry(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
            None,
        )
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn classify_api_error(
        &self,
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let diagnostic = format!("{err:#}");

        if let Some(reward_error) = err.downcast_ref::<RewardError>() {
            return match reward_error {
                RewardError::InsufficientFunds { balance, required } => Self::failure(
                    StatusCode::CONFLICT,
                    "insufficient_funds",
                    message,
                    Some(json!({ "current_stars": balance, "required": required })),
                ),
                RewardError::Validation(_) => {
                    Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
                }
                RewardError::NotFound(_) => {
                    Self::failure(StatusCode::NOT_FOUND, "not_found", message, None)
                }
                RewardError::InconsistentState(_) => {
                    tracing::error!(error = %diagnostic, "inconsistent reward state");
                    Self::failure(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "inconsistent_state",
                        message,
                        None,
                    )
                }
                RewardError::Configuration(_) => {
                    tracing::error!(error = %diagnostic, "reward configuration error");
                    Self::failure(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        message,
                        None,
                    )
                }
                RewardError::DeadlineExceeded(_) => {
                    tracing::warn!(error = %diagnostic, "write rolled back at deadline");
                    Self::failure(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "timeout",
                        message,
                        Some(json!({ "timeout_ms": self.timeout_ms() })),
                    )
                }
            };
        }

        let normalized = diagnostic.to_ascii_lowercase();
        if normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("schema")
        {
            tracing::error!(error = %diagnostic, "storage failure");
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                message,
                None,
            );
        }

        tracing::error!(error = %diagnostic, code = default_code, "request failed");
        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(RewardApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let timeout_ms = self.timeout_ms();
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                tracing::warn!(operation = operation_label, timeout_ms, "operation timed out");
                Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "timeout",
                    format!("{operation_label} timed out after {timeout_ms} ms"),
                    Some(json!({ "timeout_ms": timeout_ms })),
                )
            })?;

        self.finish(join_result, default_status, default_code, operation_label)
    }

    /// Runs a write to completion. The store rolls the transaction back once
    /// the operation timeout has elapsed, so the response always reflects
    /// what was committed.
    async fn run_write<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(RewardApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self
            .api
            .with_deadline(Instant::now() + self.operation_timeout);
        let join_result = tokio::task::spawn_blocking(move || op(api)).await;
        self.finish(join_result, default_status, default_code, operation_label)
    }

    fn finish<T>(
        &self,
        join_result: Result<anyhow::Result<T>, tokio::task::JoinError>,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
    ) -> Result<T, ServiceFailure> {
        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            tracing::error!(operation = operation_label, error = %err, "blocking task failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = self.classify_api_error(&err, default_status, default_code);
                self.telemetry
                    .record_failure(failure.code, failure.code == "timeout");
                Err(failure)
            }
        }
    }

    /// Runs a read, retrying once on server-side failure and then falling back
    /// to `fallback` flagged as degraded.
    async fn read_or_degrade<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
        fallback: T,
    ) -> Result<Json<ServiceEnvelope<T>>, ServiceFailure>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(RewardApi) -> anyhow::Result<T> + Clone + Send + 'static,
    {
        for attempt in 1..=READ_ATTEMPTS {
            match self
                .run_blocking(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage_unavailable",
                    operation_label,
                    op.clone(),
                )
                .await
            {
                Ok(value) => return Ok(Json(envelope(value))),
                Err(failure) if failure.status.is_server_error() => {
                    tracing::warn!(
                        operation = operation_label,
                        attempt,
                        code = failure.code,
                        "read failed"
                    );
                }
                Err(failure) => return Err(failure),
            }
        }

        self.telemetry.degraded_total.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            operation = operation_label,
            student_id = self.student.0,
            "serving zero default after failed reads"
        );
        Ok(Json(degraded(fallback)))
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "timeout" => return,
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "insufficient_funds" => &self.insufficient_funds_total,
            "storage_unavailable" => &self.storage_unavailable_total,
            "inconsistent_state" => &self.inconsistent_state_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            degraded_total: self.degraded_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            insufficient_funds_total: self.insufficient_funds_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            inconsistent_state_total: self.inconsistent_state_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
        degraded: false,
    }
}

fn degraded<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        degraded: true,
        ..envelope(data)
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/answers", post(answers_record))
        .route("/v1/answers/recent", get(answers_recent))
        .route("/v1/rewards", get(rewards_show))
        .route("/v1/streak", get(streak_show).post(streak_record))
        .route("/v1/gacha/draw", post(gacha_draw))
        .route("/v1/gacha/collection", get(gacha_collection))
        .route("/v1/gacha/catalog", get(gacha_catalog))
        .route("/v1/stats", get(stats_show))
        .with_state(state)
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let utc_offset = UtcOffset::from_hms(args.utc_offset_hours, 0, 0)
        .with_context(|| format!("invalid --utc-offset-hours value: {}", args.utc_offset_hours))?;
    let policy = RewardPolicy {
        stars_per_correct: args.stars_per_correct,
        gacha_cost: args.gacha_cost,
    };
    let api = RewardApi::new(args.db.clone(), policy, utc_offset)?;

    let migrate_api = api.clone();
    tokio::task::spawn_blocking(move || migrate_api.migrate())
        .await
        .context("migration task failed")??;
    tracing::info!(db = %args.db.display(), "database schema ready");

    let state = ServiceState {
        api,
        student: StudentId(args.student),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(addr = %args.bind, student_id = args.student, "starting server");
    axum::serve(listener, app(state).layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        student_id: state.student,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn answers_record(
    State(state): State<ServiceState>,
    payload: Result<Json<AnswerInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AnswerOutcome>>, ServiceFailure> {
    let Json(input) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let student = state.student;
    let result = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "record_answer",
            move |api| api.record_answer(student, &input),
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn answers_recent(
    State(state): State<ServiceState>,
    query: Result<Query<RecentAnswersQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<AnswerRecord>>>, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let student = state.student;
    let answers = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            "recent_answers",
            move |api| api.recent_answers(student, query.limit),
        )
        .await?;
    Ok(Json(envelope(answers)))
}

async fn rewards_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<RewardSummary>>, ServiceFailure> {
    let student = state.student;
    state
        .read_or_degrade(
            "get_rewards",
            move |api| api.rewards(student),
            RewardLedger::empty(student).summary(),
        )
        .await
}

async fn streak_record(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<StreakUpdate>>, ServiceFailure> {
    let student = state.student;
    let update = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "record_practice",
            move |api| api.record_practice(student),
        )
        .await?;
    Ok(Json(envelope(update)))
}

async fn streak_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<StreakState>>, ServiceFailure> {
    let student = state.student;
    state
        .read_or_degrade(
            "get_streak",
            move |api| api.streak(student),
            StreakState::empty(student),
        )
        .await
}

async fn gacha_draw(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<DrawOutcome>>, ServiceFailure> {
    let student = state.student;
    let outcome = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "gacha_draw",
            move |api| api.draw(student),
        )
        .await?;
    Ok(Json(envelope(outcome)))
}

async fn gacha_collection(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CollectionSummary>>, ServiceFailure> {
    let student = state.student;
    let fallback = CollectionSummary {
        collections: Vec::new(),
        progress: state.api.catalog().progress(std::iter::empty()),
    };
    state
        .read_or_degrade(
            "get_collection",
            move |api| api.collection(student),
            fallback,
        )
        .await
}

async fn stats_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<StudentStats>>, ServiceFailure> {
    let student = state.student;
    state
        .read_or_degrade(
            "get_stats",
            move |api| api.stats(student),
            StudentStats::empty(student),
        )
        .await
}

async fn gacha_catalog(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceFailure> {
    let view = state.api.catalog().view(state.api.policy());
    let value = serde_json::to_value(view).map_err(|err| {
        state.telemetry.record_failure("internal_error", false);
        tracing::error!(error = %err, "failed to serialize catalog");
        ServiceState::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("failed to serialize catalog: {err}"),
            None,
        )
    })?;
    Ok(Json(envelope(value)))
}
