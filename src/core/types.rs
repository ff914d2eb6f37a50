pub const DEFAULT_GOAL: f64 = 1_000_000.0;
pub const DEFAULT_SIMULATIONS: u32 = 10_000;

/// Absolute shift applied to the expected return by a non-moderate risk profile.
pub const RISK_RETURN_OFFSET: f64 = 0.01;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RiskTolerance {
    Conservative,
    #[default]
    Moderate,
    Aggressive,
}

impl RiskTolerance {
    /// Returns the `(expected_return, volatility)` pair scaled for this profile.
    pub fn adjust(self, expected_return: f64, volatility: f64) -> (f64, f64) {
        match self {
            RiskTolerance::Conservative => {
                (expected_return - RISK_RETURN_OFFSET, volatility * 0.75)
            }
            RiskTolerance::Moderate => (expected_return, volatility),
            RiskTolerance::Aggressive => (expected_return + RISK_RETURN_OFFSET, volatility * 1.25),
        }
    }
}

/// How yearly returns are drawn.
///
/// `LogNormal` samples a strictly positive growth factor, so a single year can never lose more
/// than the whole balance. `Normal` samples an additive rate that may fall below -100%, which
/// can push balances negative; it is kept for comparison with additive models and is never the
/// default.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ReturnModel {
    #[default]
    LogNormal,
    Normal,
}

impl ReturnModel {
    pub fn label(self) -> &'static str {
        match self {
            ReturnModel::LogNormal => "log-normal",
            ReturnModel::Normal => "normal",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParameters {
    pub current_age: u32,
    pub retirement_age: u32,
    pub initial_savings: f64,
    pub expected_return: f64,
    pub volatility: f64,
    pub inflation_rate: f64,
    pub annual_contribution: f64,
    pub risk_tolerance: RiskTolerance,
    pub goal: f64,
    pub num_simulations: u32,
    pub return_model: ReturnModel,
}

impl SimulationParameters {
    /// Number of annual steps, or `None` when retirement is not after the current age.
    pub fn years(&self) -> Option<u32> {
        self.retirement_age
            .checked_sub(self.current_age)
            .filter(|years| *years >= 1)
    }
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            current_age: 30,
            retirement_age: 65,
            initial_savings: 10_000.0,
            expected_return: 0.07,
            volatility: 0.15,
            inflation_rate: 0.02,
            annual_contribution: 5_000.0,
            risk_tolerance: RiskTolerance::Moderate,
            goal: DEFAULT_GOAL,
            num_simulations: DEFAULT_SIMULATIONS,
            return_model: ReturnModel::LogNormal,
        }
    }
}

/// Real (inflation-adjusted), risk-adjusted assumptions shared by every trial of a run.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MarketAssumptions {
    pub real_return: f64,
    pub volatility: f64,
    pub model: ReturnModel,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SummaryStatistics {
    pub median: f64,
    pub percentile_10: f64,
    pub percentile_90: f64,
    pub var_5: f64,
    pub cvar_5: f64,
    pub volatility: f64,
    pub goal_probability: f64,
    pub max_drawdown: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PercentileBand {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SimulationMetadata {
    pub num_simulations: u32,
    pub years: u32,
}

/// Full-precision outcome of a run. Rounding happens in [`super::SimulationReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    pub summary: SummaryStatistics,
    /// One band per year index `0..=years`.
    pub wealth_percentiles: Vec<PercentileBand>,
    pub metadata: SimulationMetadata,
}
