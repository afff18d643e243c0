use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use component_rules_api::{
    CategoriesView, CheckRulesRequest, ComponentRulesApi, FormulaEvalRequest, FormulaEvalResult,
    RuleCheckResult, ValidateRequest, ValidationRun, API_CONTRACT_VERSION,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: Arc<ComponentRulesApi>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    categories_version: String,
}

#[derive(Debug, Parser)]
#[command(name = "component-rules-service")]
#[command(about = "Local HTTP service for component rule validation")]
struct Args {
    /// Category table YAML; defaults to the table built into the engine.
    #[arg(long)]
    categories: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/categories", get(categories))
        .route("/v1/validate", post(validate))
        .route("/v1/rules/check", post(rules_check))
        .route("/v1/formula/eval", post(formula_eval))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "component_rules_service=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let api = match &args.categories {
        Some(path) => ComponentRulesApi::from_categories_file(path)?,
        None => ComponentRulesApi::with_builtin_categories()?,
    };
    tracing::info!(categories_version = api.categories().version(), "category table loaded");

    let state = ServiceState { api: Arc::new(api) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "component rules service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        categories_version: state.api.categories().version().to_string(),
    }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn categories(State(state): State<ServiceState>) -> Json<ServiceEnvelope<CategoriesView>> {
    Json(envelope(state.api.categories_view()))
}

async fn validate(
    State(state): State<ServiceState>,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<ServiceEnvelope<ValidationRun>>, ServiceError> {
    let run = state.api.validate(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(run)))
}

async fn rules_check(
    State(state): State<ServiceState>,
    Json(request): Json<CheckRulesRequest>,
) -> Result<Json<ServiceEnvelope<RuleCheckResult>>, ServiceError> {
    let result =
        state.api.check_rules(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn formula_eval(
    State(state): State<ServiceState>,
    Json(request): Json<FormulaEvalRequest>,
) -> Json<ServiceEnvelope<FormulaEvalResult>> {
    Json(envelope(state.api.evaluate_formula(request)))
}
