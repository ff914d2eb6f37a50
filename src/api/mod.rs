use axum::{
    Router,
    extract::{
        Json, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::core::{
    DEFAULT_GOAL, DEFAULT_SIMULATIONS, EngineError, ReturnModel, RiskTolerance,
    SimulationParameters, SimulationReport, SolveConfig, SolveError, SolveResult, run,
    run_with_seed, solve_required_contribution,
};

const INDEX_HTML: &str = "<h1>Welcome to the Capital Forecast Simulator API</h1>";
const DEFAULT_MAX_SIMULATIONS: u32 = 1_000_000;
const MAX_RETIREMENT_AGE: u32 = 150;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliRiskTolerance {
    Conservative,
    Moderate,
    Aggressive,
}

impl From<CliRiskTolerance> for RiskTolerance {
    fn from(value: CliRiskTolerance) -> Self {
        match value {
            CliRiskTolerance::Conservative => RiskTolerance::Conservative,
            CliRiskTolerance::Moderate => RiskTolerance::Moderate,
            CliRiskTolerance::Aggressive => RiskTolerance::Aggressive,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliReturnModel {
    LogNormal,
    Normal,
}

impl From<CliReturnModel> for ReturnModel {
    fn from(value: CliReturnModel) -> Self {
        match value {
            CliReturnModel::LogNormal => ReturnModel::LogNormal,
            CliReturnModel::Normal => ReturnModel::Normal,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ApiRiskTolerance {
    Conservative,
    Moderate,
    Aggressive,
}

impl From<ApiRiskTolerance> for CliRiskTolerance {
    fn from(value: ApiRiskTolerance) -> Self {
        match value {
            ApiRiskTolerance::Conservative => CliRiskTolerance::Conservative,
            ApiRiskTolerance::Moderate => CliRiskTolerance::Moderate,
            ApiRiskTolerance::Aggressive => CliRiskTolerance::Aggressive,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiReturnModel {
    #[serde(alias = "lognormal", alias = "log_normal", alias = "logNormal")]
    LogNormal,
    Normal,
}

impl From<ApiReturnModel> for CliReturnModel {
    fn from(value: ApiReturnModel) -> Self {
        match value {
            ApiReturnModel::LogNormal => CliReturnModel::LogNormal,
            ApiReturnModel::Normal => CliReturnModel::Normal,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SimulatePayload {
    age: Option<u32>,
    retirement_age: Option<u32>,
    savings: Option<f64>,
    return_rate: Option<f64>,
    volatility: Option<f64>,
    contribution: Option<f64>,
    risk_tolerance: Option<ApiRiskTolerance>,
    inflation_rate: Option<f64>,
    #[serde(alias = "wealth_goal")]
    goal: Option<f64>,
    num_simulations: Option<u32>,
    seed: Option<u64>,
    return_model: Option<ApiReturnModel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SolvePayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    target_probability: Option<f64>,
    search_min: Option<f64>,
    search_max: Option<f64>,
    tolerance: Option<f64>,
    max_iterations: Option<u32>,
    simulations_per_iteration: Option<u32>,
    final_simulations: Option<u32>,
}

#[derive(Parser, Debug)]
#[command(
    name = "forecast",
    about = "Monte Carlo retirement portfolio forecaster (risk metrics + yearly wealth bands)"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API over HTTP.
    Serve(ServeArgs),
    /// Run one simulation and print the report as JSON.
    Simulate(SimulateArgs),
    /// Find the contribution needed to reach the goal with a target probability.
    Solve(SolveArgs),
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_SIMULATIONS,
        help = "Largest num_simulations a single request may ask for"
    )]
    max_simulations: u32,
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    #[arg(long)]
    age: u32,
    #[arg(long)]
    retirement_age: u32,
    #[arg(long, help = "Current savings balance")]
    savings: f64,
    #[arg(long, help = "Expected annual return as a fraction, e.g. 0.07")]
    return_rate: f64,
    #[arg(long, help = "Annual return volatility as a fraction, e.g. 0.15")]
    volatility: f64,
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Annual contribution; negative values model withdrawals"
    )]
    contribution: f64,
    #[arg(long, value_enum, default_value_t = CliRiskTolerance::Moderate)]
    risk_tolerance: CliRiskTolerance,
    #[arg(long, help = "Annual inflation rate as a fraction, e.g. 0.02")]
    inflation_rate: f64,
    #[arg(long, visible_alias = "wealth-goal", default_value_t = DEFAULT_GOAL)]
    goal: f64,
    #[arg(long, default_value_t = DEFAULT_SIMULATIONS)]
    num_simulations: u32,
    #[arg(long, help = "Base seed; omit for a fresh random run")]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = CliReturnModel::LogNormal)]
    return_model: CliReturnModel,
}

#[derive(Args, Debug, Clone)]
struct SolveArgs {
    #[command(flatten)]
    simulation: SimulateArgs,
    #[arg(long, default_value_t = 0.9, help = "Required goal probability, 0 to 1")]
    target_probability: f64,
    #[arg(long, default_value_t = 0.0)]
    search_min: f64,
    #[arg(long, default_value_t = 200_000.0)]
    search_max: f64,
    #[arg(long, default_value_t = 50.0)]
    tolerance: f64,
    #[arg(long, default_value_t = 32)]
    max_iterations: u32,
    #[arg(long, default_value_t = 2_000)]
    simulations_per_iteration: u32,
    #[arg(long, default_value_t = 10_000)]
    final_simulations: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub max_simulations: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_simulations: DEFAULT_MAX_SIMULATIONS,
        }
    }
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            addr: SocketAddr::new(args.host, args.port),
            max_simulations: args.max_simulations,
        }
    }
}

#[derive(Debug)]
struct ApiRequest {
    params: SimulationParameters,
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Dispatches a parsed command line. Report output goes to stdout.
pub async fn run_cli(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Serve(args) => run_http_server(args.into())
            .await
            .map_err(|e| format!("Server error: {e}")),
        Command::Simulate(args) => {
            let request = api_request_from_args(&args, u32::MAX)?;
            let report = simulate_request(&request).map_err(|e| e.to_string())?;
            print_json(&report)
        }
        Command::Solve(args) => {
            let params = build_parameters(&args.simulation, u32::MAX)?;
            let result = solve_required_contribution(&params, build_solve_config(&args))
                .map_err(|e| e.to_string())?;
            print_json(&result)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

fn build_parameters(
    args: &SimulateArgs,
    max_simulations: u32,
) -> Result<SimulationParameters, String> {
    let numbers = [
        ("savings", args.savings),
        ("return_rate", args.return_rate),
        ("volatility", args.volatility),
        ("contribution", args.contribution),
        ("inflation_rate", args.inflation_rate),
        ("goal", args.goal),
    ];
    if let Some((name, _)) = numbers.iter().find(|(_, v)| !v.is_finite()) {
        return Err(format!("{name} must be a finite number"));
    }

    for (name, value) in [
        ("return_rate", args.return_rate),
        ("volatility", args.volatility),
        ("inflation_rate", args.inflation_rate),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(format!("{name} must be between 0 and 1"));
        }
    }

    if args.retirement_age <= args.age {
        return Err("retirement_age must be greater than age".to_string());
    }
    if args.retirement_age > MAX_RETIREMENT_AGE {
        return Err(format!("retirement_age must be <= {MAX_RETIREMENT_AGE}"));
    }
    if args.savings < 0.0 {
        return Err("savings must be >= 0".to_string());
    }
    if args.goal < 0.0 {
        return Err("goal must be >= 0".to_string());
    }
    if args.num_simulations == 0 {
        return Err("num_simulations must be > 0".to_string());
    }
    if args.num_simulations > max_simulations {
        return Err(format!("num_simulations must be <= {max_simulations}"));
    }

    Ok(SimulationParameters {
        current_age: args.age,
        retirement_age: args.retirement_age,
        initial_savings: args.savings,
        expected_return: args.return_rate,
        volatility: args.volatility,
        inflation_rate: args.inflation_rate,
        annual_contribution: args.contribution,
        risk_tolerance: args.risk_tolerance.into(),
        goal: args.goal,
        num_simulations: args.num_simulations,
        return_model: args.return_model.into(),
    })
}

fn build_solve_config(args: &SolveArgs) -> SolveConfig {
    SolveConfig {
        target_probability: args.target_probability,
        search_min: args.search_min,
        search_max: args.search_max,
        tolerance: args.tolerance,
        max_iterations: args.max_iterations,
        simulations_per_iteration: args.simulations_per_iteration,
        final_simulations: args.final_simulations,
        seed: args.simulation.seed.unwrap_or(SolveConfig::default().seed),
    }
}

fn api_request_from_args(
    args: &SimulateArgs,
    max_simulations: u32,
) -> Result<ApiRequest, String> {
    Ok(ApiRequest {
        params: build_parameters(args, max_simulations)?,
        seed: args.seed,
    })
}

fn simulate_args_from_payload(payload: &SimulatePayload) -> Result<SimulateArgs, String> {
    match (
        payload.age,
        payload.retirement_age,
        payload.savings,
        payload.return_rate,
        payload.volatility,
        payload.contribution,
        payload.risk_tolerance,
        payload.inflation_rate,
    ) {
        (
            Some(age),
            Some(retirement_age),
            Some(savings),
            Some(return_rate),
            Some(volatility),
            Some(contribution),
            Some(risk_tolerance),
            Some(inflation_rate),
        ) => Ok(SimulateArgs {
            age,
            retirement_age,
            savings,
            return_rate,
            volatility,
            contribution,
            risk_tolerance: risk_tolerance.into(),
            inflation_rate,
            goal: payload.goal.unwrap_or(DEFAULT_GOAL),
            num_simulations: payload.num_simulations.unwrap_or(DEFAULT_SIMULATIONS),
            seed: payload.seed,
            return_model: payload
                .return_model
                .map(CliReturnModel::from)
                .unwrap_or(CliReturnModel::LogNormal),
        }),
        _ => Err(missing_fields_message(payload)),
    }
}

fn missing_fields_message(payload: &SimulatePayload) -> String {
    let presence = [
        ("age", payload.age.is_some()),
        ("retirement_age", payload.retirement_age.is_some()),
        ("savings", payload.savings.is_some()),
        ("return_rate", payload.return_rate.is_some()),
        ("volatility", payload.volatility.is_some()),
        ("contribution", payload.contribution.is_some()),
        ("risk_tolerance", payload.risk_tolerance.is_some()),
        ("inflation_rate", payload.inflation_rate.is_some()),
    ];
    let missing = presence
        .iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
    format!("Missing required fields: {}", missing.join(", "))
}

fn api_request_from_payload(
    payload: &SimulatePayload,
    max_simulations: u32,
) -> Result<ApiRequest, String> {
    let args = simulate_args_from_payload(payload)?;
    api_request_from_args(&args, max_simulations)
}

fn solve_args_from_payload(payload: &SolvePayload) -> Result<SolveArgs, String> {
    let defaults = SolveConfig::default();
    Ok(SolveArgs {
        simulation: simulate_args_from_payload(&payload.simulation)?,
        target_probability: payload
            .target_probability
            .unwrap_or(defaults.target_probability),
        search_min: payload.search_min.unwrap_or(defaults.search_min),
        search_max: payload.search_max.unwrap_or(defaults.search_max),
        tolerance: payload.tolerance.unwrap_or(defaults.tolerance),
        max_iterations: payload.max_iterations.unwrap_or(defaults.max_iterations),
        simulations_per_iteration: payload
            .simulations_per_iteration
            .unwrap_or(defaults.simulations_per_iteration),
        final_simulations: payload
            .final_simulations
            .unwrap_or(defaults.final_simulations),
    })
}

fn simulate_request(request: &ApiRequest) -> Result<SimulationReport, EngineError> {
    let result = match request.seed {
        Some(seed) => run_with_seed(&request.params, seed)?,
        None => run(&request.params, &mut rand::thread_rng())?,
    };
    Ok(SimulationReport::from_result(&result))
}

pub fn router(config: ServerConfig) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/simulate", post(simulate_post_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/solve", post(solve_handler))
        .fallback(not_found_handler)
        .with_state(config)
}

pub async fn run_http_server(config: ServerConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.addr).await?;
    info!(
        addr = %config.addr,
        max_simulations = config.max_simulations,
        "capital forecast API listening"
    );
    axum::serve(listener, router(config)).await
}

async fn index_handler() -> impl IntoResponse {
    Html(INDEX_HTML)
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(
    State(config): State<ServerConfig>,
    payload: Result<Query<SimulatePayload>, QueryRejection>,
) -> Response {
    match payload {
        Ok(Query(payload)) => simulate_handler_impl(config, payload).await,
        Err(rejection) => malformed_request(rejection.body_text()),
    }
}

async fn simulate_post_handler(
    State(config): State<ServerConfig>,
    payload: Result<Json<SimulatePayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => simulate_handler_impl(config, payload).await,
        Err(rejection) => malformed_request(rejection.body_text()),
    }
}

fn malformed_request(detail: String) -> Response {
    warn!(error = %detail, "rejected malformed request");
    error_response(StatusCode::BAD_REQUEST, &detail)
}

async fn simulate_handler_impl(config: ServerConfig, payload: SimulatePayload) -> Response {
    let request = match api_request_from_payload(&payload, config.max_simulations) {
        Ok(request) => request,
        Err(msg) => {
            warn!(error = %msg, "rejected simulation request");
            return error_response(StatusCode::BAD_REQUEST, &msg);
        }
    };

    let trials = request.params.num_simulations;
    match tokio::task::spawn_blocking(move || simulate_request(&request)).await {
        Ok(Ok(report)) => {
            debug!(trials, years = report.metadata.years, "simulation served");
            json_response(StatusCode::OK, report)
        }
        Ok(Err(err)) => {
            warn!(error = %err, "simulation failed");
            error_response(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string())
        }
        Err(err) => {
            error!(error = %err, "simulation task panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Simulation failed")
        }
    }
}

async fn solve_handler(
    State(config): State<ServerConfig>,
    payload: Result<Json<SolvePayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return malformed_request(rejection.body_text()),
    };
    let args = match solve_args_from_payload(&payload) {
        Ok(args) => args,
        Err(msg) => {
            warn!(error = %msg, "rejected solve request");
            return error_response(StatusCode::BAD_REQUEST, &msg);
        }
    };
    let params = match build_parameters(&args.simulation, config.max_simulations) {
        Ok(params) => params,
        Err(msg) => {
            warn!(error = %msg, "rejected solve request");
            return error_response(StatusCode::BAD_REQUEST, &msg);
        }
    };
    let solve_config = build_solve_config(&args);
    if solve_config
        .simulations_per_iteration
        .max(solve_config.final_simulations)
        > config.max_simulations
    {
        let msg = format!("solver simulations must be <= {}", config.max_simulations);
        return error_response(StatusCode::BAD_REQUEST, &msg);
    }

    let outcome =
        tokio::task::spawn_blocking(move || solve_required_contribution(&params, solve_config))
            .await;
    match outcome {
        Ok(Ok(result)) => json_response::<SolveResult>(StatusCode::OK, result),
        Ok(Err(SolveError::InvalidConfig(msg))) => error_response(StatusCode::BAD_REQUEST, &msg),
        Ok(Err(err)) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string()),
        Err(err) => {
            error!(error = %err, "solver task panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Solver failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(&payload, DEFAULT_MAX_SIMULATIONS)
}
