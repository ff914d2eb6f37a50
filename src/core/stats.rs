/// Linear-interpolated percentile between order statistics. `p` is in `[0, 100]`.
///
/// Sorts `values` in place, so callers that need several percentiles of the same sample pay for
/// one sort.
pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(values, p)
}

/// Same as [`percentile`] for input that is already ascending.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return sorted[0];
    }

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let w = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * w
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with divisor `n`.
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Expected shortfall: mean of every value at or below `cutoff`.
///
/// Ties at the cutoff are all included. Falls back to the cutoff itself when nothing qualifies.
pub fn conditional_var(sorted: &[f64], cutoff: f64) -> f64 {
    let tail = sorted.partition_point(|v| *v <= cutoff);
    if tail == 0 {
        return cutoff;
    }
    mean(&sorted[..tail])
}
