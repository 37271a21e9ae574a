use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use calculadora_core::{
    compute, evaluate, CalcError, HistoryEntry, HistoryRecorder, InMemoryHistory,
    NewHistoryEntry, OperationRequest, OperationResult, Operator,
};
use calculadora_store_sqlite::SqliteHistoryStore;
use clap::{Parser, ValueEnum};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const METHOD_NOT_ALLOWED_MESSAGE: &str = "Método não permitido";

#[derive(Clone)]
struct ServiceState {
    history: Arc<dyn HistoryRecorder>,
    operation_timeout: Duration,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HistoryMode {
    Memory,
    Sqlite,
}

#[derive(Debug, Parser)]
#[command(name = "calculadora")]
#[command(about = "HTTP calculator with operation history")]
struct Args {
    #[arg(long, default_value = "./historico_calculadora.db")]
    db: PathBuf,
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
    #[arg(long, value_enum, default_value_t = HistoryMode::Sqlite)]
    history: HistoryMode,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, status = %self.status, "{}", self.message);
        } else {
            warn!(code = self.code, status = %self.status, "{}", self.message);
        }
        (self.status, self.message).into_response()
    }
}

impl ServiceState {
    fn new(history: Arc<dyn HistoryRecorder>, operation_timeout: Duration) -> Self {
        Self { history, operation_timeout }
    }

    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into() }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("Erro: corpo JSON inválido: {}", rejection.body_text()),
        )
    }

    fn calc_failure(err: &CalcError) -> ServiceFailure {
        let code = match err {
            CalcError::DivisionByZero => "division_by_zero",
            CalcError::InvalidOperator(_) => "invalid_operator",
        };
        Self::failure(StatusCode::BAD_REQUEST, code, err.to_string())
    }

    fn spawn_history<T, F>(&self, op: F) -> JoinHandle<anyhow::Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn HistoryRecorder>) -> anyhow::Result<T> + Send + 'static,
    {
        let history = Arc::clone(&self.history);
        tokio::task::spawn_blocking(move || op(history))
    }

    /// Runs a blocking history read, failing with `default_status` once the
    /// operation timeout elapses.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn HistoryRecorder>) -> anyhow::Result<T> + Send + 'static,
    {
        let handle = self.spawn_history(op);
        let join_result = tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
            Self::failure(
                default_status,
                default_code,
                format!(
                    "{operation_label} timed out after {} ms",
                    self.operation_timeout.as_millis()
                ),
            )
        })?;
        Self::settle(default_status, default_code, operation_label, join_result)
    }

    /// Runs a blocking history write to completion. A write is never reported
    /// as failed once it has committed, so no timeout applies here.
    async fn run_blocking_to_completion<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn HistoryRecorder>) -> anyhow::Result<T> + Send + 'static,
    {
        let join_result = self.spawn_history(op).await;
        Self::settle(default_status, default_code, operation_label, join_result)
    }

    fn settle<T>(
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        join_result: Result<anyhow::Result<T>, JoinError>,
    ) -> Result<T, ServiceFailure> {
        let op_result = join_result.map_err(|err| {
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
            )
        })?;

        op_result.map_err(|err| {
            Self::failure(
                default_status,
                default_code,
                format!("{operation_label} failed: {err:#}"),
            )
        })
    }

    async fn record(
        &self,
        request: &OperationRequest,
        operator: Operator,
        result: OperationResult,
    ) -> Result<HistoryEntry, ServiceFailure> {
        let entry = NewHistoryEntry::from_computation(
            request.operando1,
            request.operando2,
            operator,
            result,
        );
        self.run_blocking_to_completion(
            StatusCode::INTERNAL_SERVER_ERROR,
            "history_write_failed",
            "record_history",
            move |history| history.record(&entry),
        )
        .await
    }
}

fn open_history(mode: HistoryMode, db: &Path) -> Result<Arc<dyn HistoryRecorder>> {
    match mode {
        HistoryMode::Memory => Ok(Arc::new(InMemoryHistory::new())),
        HistoryMode::Sqlite => {
            let store = SqliteHistoryStore::open_and_migrate(db)
                .with_context(|| format!("failed to prepare history database {}", db.display()))?;
            Ok(Arc::new(store))
        }
    }
}

fn compute_route<H, T>(handler: H) -> MethodRouter<ServiceState>
where
    H: axum::handler::Handler<T, ServiceState>,
    T: 'static,
{
    post(handler).fallback(method_not_allowed)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/soma", compute_route(soma))
        .route("/subtracao", compute_route(subtracao))
        .route("/multiplicacao", compute_route(multiplicacao))
        .route("/divisao", compute_route(divisao))
        .route("/calcular", compute_route(calcular))
        .route("/historico", get(historico).fallback(method_not_allowed))
        .with_state(state)
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("calculadora=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let history = open_history(args.history, &args.db)?;
    let state = ServiceState::new(history, Duration::from_millis(args.operation_timeout_ms));

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        history = ?args.history,
        db = %args.db.display(),
        "calculadora listening"
    );

    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    info!("calculadora stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn method_not_allowed() -> ServiceFailure {
    ServiceState::failure(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        METHOD_NOT_ALLOWED_MESSAGE,
    )
}

async fn compute_fixed(
    state: &ServiceState,
    operator: Operator,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Json<OperationResult>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| ServiceState::invalid_json(&rejection))?;
    let resultado = compute(request.operando1, request.operando2, operator)
        .map_err(|err| ServiceState::calc_failure(&err))?;
    let result = OperationResult { resultado };
    state.record(&request, operator, result).await?;
    debug!(
        operando1 = request.operando1,
        operando2 = request.operando2,
        operacao = operator.symbol(),
        resultado,
        "computed"
    );
    Ok(Json(result))
}

async fn soma(
    State(state): State<ServiceState>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Json<OperationResult>, ServiceFailure> {
    compute_fixed(&state, Operator::Add, payload).await
}

async fn subtracao(
    State(state): State<ServiceState>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Json<OperationResult>, ServiceFailure> {
    compute_fixed(&state, Operator::Subtract, payload).await
}

async fn multiplicacao(
    State(state): State<ServiceState>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Json<OperationResult>, ServiceFailure> {
    compute_fixed(&state, Operator::Multiply, payload).await
}

async fn divisao(
    State(state): State<ServiceState>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Json<OperationResult>, ServiceFailure> {
    compute_fixed(&state, Operator::Divide, payload).await
}

async fn calcular(
    State(state): State<ServiceState>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Json<OperationResult>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| ServiceState::invalid_json(&rejection))?;
    let (operator, result) =
        evaluate(&request).map_err(|err| ServiceState::calc_failure(&err))?;
    state.record(&request, operator, result).await?;
    debug!(operacao = operator.symbol(), resultado = result.resultado, "computed");
    Ok(Json(result))
}

async fn historico(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<HistoryEntry>>, ServiceFailure> {
    let entries = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "history_read_failed",
            "list_history",
            |history| history.list(),
        )
        .await?;
    Ok(Json(entries))
}
