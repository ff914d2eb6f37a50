mod engine;
mod error;
mod report;
mod solver;
mod stats;
mod types;

pub use engine::{MAX_PATH_CELLS, market_assumptions, max_drawdown, run, run_with_seed};
pub use error::EngineError;
pub use report::{BandReport, MetadataReport, SimulationReport, SummaryReport, YearlyBands};
pub use solver::{
    SolveConfig, SolveError, SolveIteration, SolveResult, solve_required_contribution,
};
pub use stats::{conditional_var, mean, percentile, population_std_dev};
pub use types::{
    DEFAULT_GOAL, DEFAULT_SIMULATIONS, MarketAssumptions, PercentileBand, ReturnModel,
    RiskTolerance, SimulationMetadata, SimulationParameters, SimulationResult, SummaryStatistics,
};
