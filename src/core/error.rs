use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("retirement_age ({retirement_age}) must be greater than current_age ({current_age})")]
    NoSimulationYears {
        current_age: u32,
        retirement_age: u32,
    },
    #[error("num_simulations must be at least 1")]
    NoTrials,
    #[error("{field} must be finite")]
    NonFiniteInput { field: &'static str },
    #[error(
        "{trials} trials over {years} years need more than {limit} path cells; \
         reduce num_simulations or the horizon"
    )]
    RunTooLarge { trials: u32, years: u32, limit: usize },
    #[error("initial_savings must be >= 0, got {0}")]
    NegativeSavings(f64),
    #[error("volatility after risk adjustment must be >= 0, got {0}")]
    NegativeVolatility(f64),
    #[error(
        "effective real return {0} is at or below -100%; log-normal growth factor is undefined"
    )]
    NonPositiveGrowthFactor(f64),
    #[error("{0} distribution rejected the market assumptions")]
    Distribution(&'static str),
    #[error("simulation produced a non-finite {0}; inputs are outside the representable range")]
    NonFiniteResult(&'static str),
}
