use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::engine::run_with_seed;
use super::error::EngineError;
use super::types::SimulationParameters;

/// Slack when comparing a sampled probability against the target.
const PROBABILITY_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveConfig {
    pub target_probability: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub simulations_per_iteration: u32,
    pub final_simulations: u32,
    pub seed: u64,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            target_probability: 0.9,
            search_min: 0.0,
            search_max: 200_000.0,
            tolerance: 50.0,
            max_iterations: 32,
            simulations_per_iteration: 2_000,
            final_simulations: 10_000,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_contribution: f64,
    pub goal_probability: f64,
    pub probability_ci_half_width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolveResult {
    pub target_probability: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub simulations_per_iteration: u32,
    pub final_simulations: u32,
    pub required_contribution: Option<f64>,
    pub achieved_probability: Option<f64>,
    pub achieved_ci_half_width: Option<f64>,
    pub iterations: Vec<SolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("invalid solver config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    goal_probability: f64,
    ci_half_width: f64,
}

/// Finds the smallest annual contribution whose goal probability reaches the target.
///
/// Every candidate is simulated from the same seed, so the probability only moves because the
/// contribution moved.
pub fn solve_required_contribution(
    params: &SimulationParameters,
    config: SolveConfig,
) -> Result<SolveResult, SolveError> {
    validate_config(config)?;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let per_iteration = config.simulations_per_iteration;
    let low_eval = evaluate_candidate(params, config, config.search_min, per_iteration)?;

    let mut solved = None;
    let mut converged = false;
    let feasible;
    let message;

    if meets_target(low_eval, config) {
        solved = Some(config.search_min);
        converged = true;
        feasible = true;
        message = "Goal already met at the lower contribution bound.".to_string();
    } else if !meets_target(
        evaluate_candidate(params, config, config.search_max, per_iteration)?,
        config,
    ) {
        feasible = false;
        message = "No contribution within the search bounds reaches the target.".to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        for it in 1..=config.max_iterations {
            let mid = (lo + hi) * 0.5;
            let eval = evaluate_candidate(params, config, mid, per_iteration)?;
            iterations.push(SolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_contribution: mid,
                goal_probability: eval.goal_probability,
                probability_ci_half_width: eval.ci_half_width,
            });
            debug!(iteration = it, mid, p = eval.goal_probability, "solver step");

            if meets_target(eval, config) {
                hi = mid;
            } else {
                lo = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved = Some(hi);
        feasible = true;
        message = if converged {
            "Solved required contribution.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let mut achieved_probability = None;
    let mut achieved_ci_half_width = None;
    if let Some(value) = solved {
        let final_eval = evaluate_candidate(params, config, value, config.final_simulations)?;
        achieved_probability = Some(final_eval.goal_probability);
        achieved_ci_half_width = Some(final_eval.ci_half_width);
    }

    Ok(SolveResult {
        target_probability: config.target_probability,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        simulations_per_iteration: config.simulations_per_iteration,
        final_simulations: config.final_simulations,
        required_contribution: solved,
        achieved_probability,
        achieved_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

fn meets_target(eval: CandidateEval, config: SolveConfig) -> bool {
    eval.goal_probability + PROBABILITY_EPS >= config.target_probability
}

fn evaluate_candidate(
    base: &SimulationParameters,
    config: SolveConfig,
    contribution: f64,
    simulations: u32,
) -> Result<CandidateEval, EngineError> {
    let params = SimulationParameters {
        annual_contribution: contribution,
        num_simulations: simulations.max(1),
        ..base.clone()
    };
    let result = run_with_seed(&params, config.seed)?;
    let p = result.summary.goal_probability;
    Ok(CandidateEval {
        goal_probability: p,
        ci_half_width: binomial_ci_half_width(p, params.num_simulations),
    })
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_config(config: SolveConfig) -> Result<(), SolveError> {
    let invalid =
        |msg: &str| -> Result<(), SolveError> { Err(SolveError::InvalidConfig(msg.to_string())) };

    if !(0.0..=1.0).contains(&config.target_probability) {
        return invalid("target_probability must be between 0 and 1");
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return invalid("search bounds must be finite");
    }
    if config.search_max <= config.search_min {
        return invalid("search_max must be greater than search_min");
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return invalid("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return invalid("max_iterations must be > 0");
    }
    if config.simulations_per_iteration == 0 {
        return invalid("simulations_per_iteration must be > 0");
    }
    if config.final_simulations == 0 {
        return invalid("final_simulations must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ReturnModel, RiskTolerance};

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn deterministic_params() -> SimulationParameters {
        SimulationParameters {
            current_age: 30,
            retirement_age: 31,
            initial_savings: 0.0,
            expected_return: 0.0,
            volatility: 0.0,
            inflation_rate: 0.0,
            annual_contribution: 1.0,
            risk_tolerance: RiskTolerance::Moderate,
            goal: 100.0,
            num_simulations: 1,
            return_model: ReturnModel::LogNormal,
        }
    }

    fn deterministic_config() -> SolveConfig {
        SolveConfig {
            target_probability: 1.0,
            search_min: 0.0,
            search_max: 200.0,
            tolerance: 0.5,
            max_iterations: 24,
            simulations_per_iteration: 1,
            final_simulations: 1,
            seed: 7,
        }
    }

    #[test]
    fn finds_deterministic_required_contribution() {
        let config = deterministic_config();
        let result =
            solve_required_contribution(&deterministic_params(), config).expect("must solve");
        assert!(result.feasible);
        assert!(result.converged);
        assert_close(
            result.required_contribution.expect("value expected"),
            100.0,
            config.tolerance,
        );
        assert!(result.required_contribution.expect("value expected") >= 100.0);
        assert_close(result.achieved_probability.expect("rate expected"), 1.0, 1e-9);
        assert!(!result.iterations.is_empty());
    }

    #[test]
    fn reports_infeasible_when_bounds_too_low() {
        let config = SolveConfig {
            search_max: 50.0,
            ..deterministic_config()
        };
        let result =
            solve_required_contribution(&deterministic_params(), config).expect("must return");
        assert!(!result.feasible);
        assert!(result.required_contribution.is_none());
        assert!(result.achieved_probability.is_none());
    }

    #[test]
    fn lower_bound_is_returned_when_goal_already_met() {
        let params = SimulationParameters {
            goal: 0.0,
            ..deterministic_params()
        };
        let result =
            solve_required_contribution(&params, deterministic_config()).expect("must solve");
        assert!(result.feasible);
        assert_eq!(result.required_contribution, Some(0.0));
        assert!(result.iterations.is_empty());
    }

    #[test]
    fn stochastic_solution_reaches_target_probability() {
        let params = SimulationParameters {
            goal: 400_000.0,
            ..SimulationParameters::default()
        };
        let config = SolveConfig {
            target_probability: 0.75,
            search_max: 50_000.0,
            tolerance: 100.0,
            simulations_per_iteration: 300,
            final_simulations: 300,
            ..SolveConfig::default()
        };
        let result = solve_required_contribution(&params, config).expect("must solve");
        assert!(result.feasible);
        assert!(result.achieved_probability.expect("rate expected") >= 0.75);
    }

    #[test]
    fn rejects_invalid_config() {
        let params = deterministic_params();
        for config in [
            SolveConfig {
                target_probability: 1.5,
                ..deterministic_config()
            },
            SolveConfig {
                search_max: -1.0,
                ..deterministic_config()
            },
            SolveConfig {
                tolerance: 0.0,
                ..deterministic_config()
            },
            SolveConfig {
                max_iterations: 0,
                ..deterministic_config()
            },
            SolveConfig {
                final_simulations: 0,
                ..deterministic_config()
            },
        ] {
            assert!(matches!(
                solve_required_contribution(&params, config),
                Err(SolveError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn engine_errors_propagate() {
        let params = SimulationParameters {
            retirement_age: 30,
            ..deterministic_params()
        };
        assert!(matches!(
            solve_required_contribution(&params, deterministic_config()),
            Err(SolveError::Engine(EngineError::NoSimulationYears { .. }))
        ));
    }

    #[test]
    fn ci_half_width_shrinks_with_samples() {
        assert_eq!(binomial_ci_half_width(1.0, 100), 0.0);
        assert!(binomial_ci_half_width(0.5, 10_000) < binomial_ci_half_width(0.5, 100));
    }
}
