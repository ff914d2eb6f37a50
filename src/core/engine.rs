use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, LogNormal, Normal};
use rayon::prelude::*;
use tracing::debug;

use super::error::EngineError;
use super::stats::{conditional_var, mean, percentile_sorted, population_std_dev};
use super::types::{
    MarketAssumptions, PercentileBand, ReturnModel, SimulationMetadata, SimulationParameters,
    SimulationResult, SummaryStatistics,
};

/// Upper bound on `trials * (years + 1)` balances held by one run (512 MiB of `f64`).
pub const MAX_PATH_CELLS: usize = 64 * 1024 * 1024;

/// Runs a simulation, drawing the base seed from an injected random source.
pub fn run<R: RngCore + ?Sized>(
    params: &SimulationParameters,
    rng: &mut R,
) -> Result<SimulationResult, EngineError> {
    run_with_seed(params, rng.next_u64())
}

/// Runs `params.num_simulations` independent trials and aggregates them.
///
/// Trial `i` owns a private generator seeded from `derive_seed(seed, i)`, so the result is
/// bit-identical for a given seed no matter how rayon schedules the trials.
pub fn run_with_seed(
    params: &SimulationParameters,
    seed: u64,
) -> Result<SimulationResult, EngineError> {
    let years = validate_parameters(params)?;
    let market = market_assumptions(params)?;
    let sampler = YearlySampler::new(market)?;

    let trials = params.num_simulations as usize;
    let width = years as usize + 1;
    let cells = trials
        .checked_mul(width)
        .filter(|cells| *cells <= MAX_PATH_CELLS)
        .ok_or(EngineError::RunTooLarge {
            trials: params.num_simulations,
            years,
            limit: MAX_PATH_CELLS,
        })?;
    debug!(
        trials,
        years,
        model = market.model.label(),
        real_return = market.real_return,
        volatility = market.volatility,
        "starting simulation run"
    );

    let mut paths = vec![0.0; cells];
    let mut drawdowns = vec![0.0; trials];
    paths
        .par_chunks_mut(width)
        .zip(drawdowns.par_iter_mut())
        .enumerate()
        .for_each(|(trial, (path, drawdown))| {
            let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, trial as u64));
            simulate_path(
                params.initial_savings,
                params.annual_contribution,
                &sampler,
                &mut rng,
                path,
            );
            *drawdown = max_drawdown(path);
        });

    let metadata = SimulationMetadata {
        num_simulations: params.num_simulations,
        years,
    };
    let result = aggregate(&paths, width, &drawdowns, params.goal, metadata);
    ensure_finite(&result)?;

    debug!(
        median = result.summary.median,
        goal_probability = result.summary.goal_probability,
        "simulation run complete"
    );
    Ok(result)
}

/// Applies the risk profile and inflation once per run.
pub fn market_assumptions(
    params: &SimulationParameters,
) -> Result<MarketAssumptions, EngineError> {
    let (expected_return, volatility) = params
        .risk_tolerance
        .adjust(params.expected_return, params.volatility);
    let real_return = expected_return - params.inflation_rate;

    if volatility < 0.0 {
        return Err(EngineError::NegativeVolatility(volatility));
    }
    if params.return_model == ReturnModel::LogNormal && 1.0 + real_return <= 0.0 {
        return Err(EngineError::NonPositiveGrowthFactor(real_return));
    }

    Ok(MarketAssumptions {
        real_return,
        volatility,
        model: params.return_model,
    })
}

fn validate_parameters(params: &SimulationParameters) -> Result<u32, EngineError> {
    let years = params.years().ok_or(EngineError::NoSimulationYears {
        current_age: params.current_age,
        retirement_age: params.retirement_age,
    })?;
    if params.num_simulations == 0 {
        return Err(EngineError::NoTrials);
    }

    let fields = [
        ("initial_savings", params.initial_savings),
        ("expected_return", params.expected_return),
        ("volatility", params.volatility),
        ("inflation_rate", params.inflation_rate),
        ("annual_contribution", params.annual_contribution),
        ("goal", params.goal),
    ];
    if let Some((field, _)) = fields.iter().find(|(_, v)| !v.is_finite()) {
        return Err(EngineError::NonFiniteInput { field: *field });
    }
    if params.initial_savings < 0.0 {
        return Err(EngineError::NegativeSavings(params.initial_savings));
    }

    Ok(years)
}

/// Draws one year's growth factor (`balance_t = balance_{t-1} * factor + contribution`).
#[derive(Debug, Clone, Copy)]
pub(crate) enum YearlySampler {
    LogNormal(LogNormal<f64>),
    /// Additive rate; the factor is `1 + r` and may be negative.
    Normal(Normal<f64>),
}

impl YearlySampler {
    pub(crate) fn new(market: MarketAssumptions) -> Result<Self, EngineError> {
        match market.model {
            ReturnModel::LogNormal => {
                let mu = (1.0 + market.real_return).ln() - 0.5 * market.volatility.powi(2);
                LogNormal::new(mu, market.volatility)
                    .map(YearlySampler::LogNormal)
                    .map_err(|_| EngineError::Distribution(market.model.label()))
            }
            ReturnModel::Normal => Normal::new(market.real_return, market.volatility)
                .map(YearlySampler::Normal)
                .map_err(|_| EngineError::Distribution(market.model.label())),
        }
    }

    fn growth_factor<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            YearlySampler::LogNormal(dist) => dist.sample(rng),
            YearlySampler::Normal(dist) => 1.0 + dist.sample(rng),
        }
    }
}

/// Fills `path` with one trial: `path[0]` is the starting balance, each later slot one year.
pub(crate) fn simulate_path<R: Rng + ?Sized>(
    initial_savings: f64,
    contribution: f64,
    sampler: &YearlySampler,
    rng: &mut R,
    path: &mut [f64],
) {
    let Some((first, rest)) = path.split_first_mut() else {
        return;
    };
    *first = initial_savings;

    let mut balance = initial_savings;
    for slot in rest {
        balance = balance * sampler.growth_factor(rng) + contribution;
        *slot = balance;
    }
}

/// Largest peak-to-trough decline along `path` as a fraction of the running peak.
///
/// Points where the peak is not positive contribute 0.
pub fn max_drawdown(path: &[f64]) -> f64 {
    let Some(&first) = path.first() else {
        return 0.0;
    };

    let mut peak = first;
    let mut worst = 0.0_f64;
    for &value in path {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            worst = worst.max((peak - value) / peak);
        }
    }
    worst
}

fn aggregate(
    paths: &[f64],
    width: usize,
    drawdowns: &[f64],
    goal: f64,
    metadata: SimulationMetadata,
) -> SimulationResult {
    let trials = drawdowns.len();

    let mut terminal = paths
        .chunks_exact(width)
        .map(|path| path[width - 1])
        .collect::<Vec<_>>();
    let reached_goal = terminal.iter().filter(|balance| **balance >= goal).count();
    let volatility = population_std_dev(&terminal);
    terminal.sort_by(|a, b| a.total_cmp(b));

    let var_5 = percentile_sorted(&terminal, 5.0);
    let summary = SummaryStatistics {
        median: percentile_sorted(&terminal, 50.0),
        percentile_10: percentile_sorted(&terminal, 10.0),
        percentile_90: percentile_sorted(&terminal, 90.0),
        var_5,
        cvar_5: conditional_var(&terminal, var_5),
        volatility,
        goal_probability: reached_goal as f64 / trials as f64,
        max_drawdown: mean(drawdowns),
    };

    let wealth_percentiles = (0..width)
        .into_par_iter()
        .map(|year| {
            let mut column = paths
                .iter()
                .skip(year)
                .step_by(width)
                .copied()
                .collect::<Vec<_>>();
            column.sort_by(|a, b| a.total_cmp(b));
            PercentileBand {
                p10: percentile_sorted(&column, 10.0),
                p50: percentile_sorted(&column, 50.0),
                p90: percentile_sorted(&column, 90.0),
            }
        })
        .collect();

    SimulationResult {
        summary,
        wealth_percentiles,
        metadata,
    }
}

fn ensure_finite(result: &SimulationResult) -> Result<(), EngineError> {
    let s = &result.summary;
    let summary_fields = [
        ("median", s.median),
        ("percentile_10", s.percentile_10),
        ("percentile_90", s.percentile_90),
        ("var_5", s.var_5),
        ("cvar_5", s.cvar_5),
        ("volatility", s.volatility),
        ("goal_probability", s.goal_probability),
        ("max_drawdown", s.max_drawdown),
    ];
    if let Some((field, _)) = summary_fields.iter().find(|(_, v)| !v.is_finite()) {
        return Err(EngineError::NonFiniteResult(*field));
    }

    let bands_finite = result
        .wealth_percentiles
        .iter()
        .all(|band| band.p10.is_finite() && band.p50.is_finite() && band.p90.is_finite());
    if !bands_finite {
        return Err(EngineError::NonFiniteResult("wealth percentile"));
    }
    Ok(())
}

pub(crate) fn derive_seed(base_seed: u64, trial: u64) -> u64 {
    splitmix64(base_seed ^ splitmix64(trial))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RiskTolerance;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_relative(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol * expected.abs().max(1.0),
            "expected {expected}, got {actual}, relative tolerance {tol}"
        );
    }

    fn sample_params() -> SimulationParameters {
        SimulationParameters {
            current_age: 30,
            retirement_age: 65,
            initial_savings: 10_000.0,
            expected_return: 0.07,
            volatility: 0.15,
            inflation_rate: 0.02,
            annual_contribution: 5_000.0,
            risk_tolerance: RiskTolerance::Moderate,
            goal: 500_000.0,
            num_simulations: 400,
            return_model: ReturnModel::LogNormal,
        }
    }

    fn deterministic_params() -> SimulationParameters {
        SimulationParameters {
            volatility: 0.0,
            inflation_rate: 0.0,
            num_simulations: 100,
            ..sample_params()
        }
    }

    fn compound(savings: f64, rate: f64, contribution: f64, years: u32) -> f64 {
        (0..years).fold(savings, |balance, _| balance * (1.0 + rate) + contribution)
    }

    #[test]
    fn zero_volatility_run_matches_deterministic_compounding() {
        let params = deterministic_params();
        let result = run_with_seed(&params, 7).expect("valid params");
        let expected = compound(10_000.0, 0.07, 5_000.0, 35);

        assert_eq!(result.metadata.years, 35);
        assert_eq!(result.metadata.num_simulations, 100);
        assert_eq!(result.wealth_percentiles.len(), 36);
        assert_relative(result.summary.median, expected, 1e-9);
        assert_relative(result.summary.percentile_10, expected, 1e-9);
        assert_relative(result.summary.percentile_90, expected, 1e-9);
        assert_relative(result.summary.var_5, expected, 1e-9);
        assert_relative(result.summary.cvar_5, expected, 1e-9);
        assert_eq!(result.summary.max_drawdown, 0.0);
        assert_eq!(result.summary.goal_probability, 1.0);
        assert!(result.summary.volatility < 1e-6);
        assert_approx(result.wealth_percentiles[0].p50, 10_000.0);
    }

    #[test]
    fn zero_volatility_goal_out_of_reach_has_zero_probability() {
        let params = SimulationParameters {
            goal: 10_000_000.0,
            ..deterministic_params()
        };
        let result = run_with_seed(&params, 7).expect("valid params");
        assert_eq!(result.summary.goal_probability, 0.0);
    }

    #[test]
    fn zero_years_is_rejected() {
        let params = SimulationParameters {
            retirement_age: 30,
            ..sample_params()
        };
        let err = run_with_seed(&params, 1).expect_err("must reject empty horizon");
        assert_eq!(
            err,
            EngineError::NoSimulationYears {
                current_age: 30,
                retirement_age: 30
            }
        );

        let params = SimulationParameters {
            retirement_age: 25,
            ..sample_params()
        };
        assert!(run_with_seed(&params, 1).is_err());
    }

    #[test]
    fn zero_trials_is_rejected() {
        let params = SimulationParameters {
            num_simulations: 0,
            ..sample_params()
        };
        assert_eq!(run_with_seed(&params, 1), Err(EngineError::NoTrials));
    }

    #[test]
    fn oversized_run_is_rejected_before_allocating() {
        let params = SimulationParameters {
            current_age: 0,
            retirement_age: 4_000_000_000,
            num_simulations: 1_000,
            ..sample_params()
        };
        assert_eq!(
            run_with_seed(&params, 1),
            Err(EngineError::RunTooLarge {
                trials: 1_000,
                years: 4_000_000_000,
                limit: MAX_PATH_CELLS,
            })
        );

        let params = SimulationParameters {
            current_age: 0,
            retirement_age: u32::MAX,
            num_simulations: u32::MAX,
            ..sample_params()
        };
        assert!(matches!(
            run_with_seed(&params, 1),
            Err(EngineError::RunTooLarge { .. })
        ));
    }

    #[test]
    fn non_finite_inputs_are_rejected() {
        let params = SimulationParameters {
            annual_contribution: f64::NAN,
            ..sample_params()
        };
        assert_eq!(
            run_with_seed(&params, 1),
            Err(EngineError::NonFiniteInput {
                field: "annual_contribution"
            })
        );
    }

    #[test]
    fn negative_savings_is_rejected() {
        let params = SimulationParameters {
            initial_savings: -1.0,
            ..sample_params()
        };
        assert_eq!(
            run_with_seed(&params, 1),
            Err(EngineError::NegativeSavings(-1.0))
        );
    }

    #[test]
    fn single_trial_statistics_collapse_to_the_trial() {
        let params = SimulationParameters {
            num_simulations: 1,
            ..sample_params()
        };
        let result = run_with_seed(&params, 99).expect("valid params");
        let s = result.summary;
        assert_eq!(s.cvar_5, s.var_5);
        assert_eq!(s.var_5, s.median);
        assert_eq!(s.percentile_10, s.median);
        assert_eq!(s.percentile_90, s.median);
        assert_eq!(s.volatility, 0.0);
        assert!(s.goal_probability == 0.0 || s.goal_probability == 1.0);
    }

    #[test]
    fn fixed_seed_reruns_are_identical() {
        let params = sample_params();
        let a = run_with_seed(&params, 123).expect("valid params");
        let b = run_with_seed(&params, 123).expect("valid params");
        assert_eq!(a, b);

        let c = run_with_seed(&params, 124).expect("valid params");
        assert_ne!(a.summary.median, c.summary.median);
    }

    #[test]
    fn injected_random_source_is_reproducible() {
        let params = sample_params();
        let mut rng_a = ChaCha8Rng::seed_from_u64(5);
        let mut rng_b = ChaCha8Rng::seed_from_u64(5);
        assert_eq!(
            run(&params, &mut rng_a).expect("valid params"),
            run(&params, &mut rng_b).expect("valid params")
        );
    }

    #[test]
    fn result_does_not_depend_on_worker_count() {
        let params = sample_params();
        let parallel = run_with_seed(&params, 31).expect("valid params");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .expect("single-thread pool");
        let serial = pool
            .install(|| run_with_seed(&params, 31))
            .expect("valid params");
        assert_eq!(parallel, serial);
    }

    #[test]
    fn goal_probability_counts_terminal_balances_at_or_above_goal() {
        let params = SimulationParameters {
            num_simulations: 50,
            ..sample_params()
        };
        let result = run_with_seed(&params, 17).expect("valid params");

        let market = market_assumptions(&params).expect("valid market");
        let sampler = YearlySampler::new(market).expect("valid sampler");
        let mut path = vec![0.0; 36];
        let mut reached = 0;
        for trial in 0..50 {
            let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(17, trial));
            simulate_path(10_000.0, 5_000.0, &sampler, &mut rng, &mut path);
            if path[35] >= params.goal {
                reached += 1;
            }
        }
        assert_eq!(result.summary.goal_probability, reached as f64 / 50.0);
    }

    #[test]
    fn risk_profile_adjusts_market_assumptions() {
        let params = sample_params();
        let moderate = market_assumptions(&params).expect("valid");
        assert_approx(moderate.real_return, 0.05);
        assert_approx(moderate.volatility, 0.15);

        let conservative = market_assumptions(&SimulationParameters {
            risk_tolerance: RiskTolerance::Conservative,
            ..params.clone()
        })
        .expect("valid");
        assert_approx(conservative.real_return, 0.04);
        assert_approx(conservative.volatility, 0.1125);

        let aggressive = market_assumptions(&SimulationParameters {
            risk_tolerance: RiskTolerance::Aggressive,
            ..params
        })
        .expect("valid");
        assert_approx(aggressive.real_return, 0.06);
        assert_approx(aggressive.volatility, 0.1875);
    }

    #[test]
    fn log_normal_rejects_total_loss_real_return_but_normal_accepts_it() {
        let params = SimulationParameters {
            expected_return: 0.0,
            inflation_rate: 1.0,
            risk_tolerance: RiskTolerance::Conservative,
            ..sample_params()
        };
        assert!(matches!(
            market_assumptions(&params),
            Err(EngineError::NonPositiveGrowthFactor(_))
        ));

        let normal = SimulationParameters {
            return_model: ReturnModel::Normal,
            ..params
        };
        assert!(market_assumptions(&normal).is_ok());
    }

    #[test]
    fn normal_model_can_drive_balance_negative() {
        let sampler = YearlySampler::Normal(Normal::new(-1.5, 0.0).expect("valid normal"));
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut path = vec![0.0; 2];
        simulate_path(100.0, 0.0, &sampler, &mut rng, &mut path);
        assert_approx(path[1], -50.0);
    }

    #[test]
    fn simulate_path_starts_at_savings_and_fills_every_year() {
        let market = market_assumptions(&sample_params()).expect("valid");
        let sampler = YearlySampler::new(market).expect("valid sampler");
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut path = vec![f64::NAN; 11];
        simulate_path(2_500.0, 100.0, &sampler, &mut rng, &mut path);
        assert_eq!(path[0], 2_500.0);
        assert!(path.iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn max_drawdown_tracks_running_peak() {
        assert_approx(max_drawdown(&[100.0, 150.0, 75.0, 120.0]), 0.5);
        assert_approx(max_drawdown(&[100.0, 90.0, 200.0, 150.0]), 0.25);
        assert_eq!(max_drawdown(&[1.0, 2.0, 3.0, 3.0, 4.0]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn max_drawdown_is_zero_while_peak_is_zero() {
        assert_eq!(max_drawdown(&[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(max_drawdown(&[0.0, -10.0, -20.0]), 0.0);
        assert_approx(max_drawdown(&[0.0, 10.0, 5.0]), 0.5);
    }

    #[test]
    fn zero_savings_and_contribution_stays_finite() {
        let params = SimulationParameters {
            initial_savings: 0.0,
            annual_contribution: 0.0,
            num_simulations: 20,
            ..sample_params()
        };
        let result = run_with_seed(&params, 2).expect("valid params");
        assert_eq!(result.summary.median, 0.0);
        assert_eq!(result.summary.max_drawdown, 0.0);
        assert_eq!(result.summary.goal_probability, 0.0);
    }

    #[test]
    fn derive_seed_changes_per_trial_and_base() {
        assert_ne!(derive_seed(42, 0), derive_seed(42, 1));
        assert_ne!(derive_seed(42, 0), derive_seed(43, 0));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_run_outputs_respect_shape_and_ordering(
            seed in any::<u64>(),
            current_age in 18u32..70,
            span in 1u32..45,
            simulations in 1u32..64,
            savings in 0u32..2_000_000,
            contribution in 0u32..60_000,
            return_bp in 0u32..2_000,
            vol_bp in 0u32..4_000,
            inflation_bp in 0u32..800,
            risk in 0u8..3,
            goal in 0u32..5_000_000,
        ) {
            let params = SimulationParameters {
                current_age,
                retirement_age: current_age + span,
                initial_savings: savings as f64,
                expected_return: return_bp as f64 / 10_000.0,
                volatility: vol_bp as f64 / 10_000.0,
                inflation_rate: inflation_bp as f64 / 10_000.0,
                annual_contribution: contribution as f64,
                risk_tolerance: match risk {
                    0 => RiskTolerance::Conservative,
                    1 => RiskTolerance::Moderate,
                    _ => RiskTolerance::Aggressive,
                },
                goal: goal as f64,
                num_simulations: simulations,
                return_model: ReturnModel::LogNormal,
            };
            let result = run_with_seed(&params, seed).expect("valid params");
            let s = result.summary;

            prop_assert_eq!(result.wealth_percentiles.len(), span as usize + 1);
            for band in &result.wealth_percentiles {
                prop_assert!(band.p10 <= band.p50 && band.p50 <= band.p90);
            }
            prop_assert_eq!(result.wealth_percentiles[0].p50, savings as f64);
            prop_assert!(s.percentile_10 <= s.median && s.median <= s.percentile_90);
            prop_assert!(s.cvar_5 <= s.var_5 + 1e-9 * s.var_5.abs().max(1.0));
            prop_assert!((0.0..=1.0).contains(&s.goal_probability));
            prop_assert!((0.0..=1.0).contains(&s.max_drawdown));
            prop_assert!(s.volatility >= 0.0);
        }

        #[test]
        fn prop_max_drawdown_is_zero_for_non_decreasing_paths(
            start in 0u32..1_000_000,
            steps in proptest::collection::vec(0u32..10_000, 0..40),
        ) {
            let mut path = vec![start as f64];
            for step in steps {
                let last = path[path.len() - 1];
                path.push(last + step as f64);
            }
            prop_assert_eq!(max_drawdown(&path), 0.0);
        }
    }
}
