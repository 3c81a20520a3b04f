use crate::error::{Degeneracy, DegeneracyKind};
use crate::utils::{quantile, sort_f64, Timer};
use rayon::prelude::*;

/// Time-varying thresholds from bootstrap no-drift streams
///
/// `stat(b, t)` is the statistic of bootstrap stream `b` at window position
/// `t`. At each position the threshold is the `(1 - fpr)` quantile over the
/// streams that have not yet crossed an earlier threshold, so the per-step
/// false positive rate is `fpr` conditional on no earlier alarm. When fewer
/// than two streams survive, the previous threshold is reused.
pub(crate) fn conditional_thresholds<F>(
    n_bootstraps: usize,
    window_size: usize,
    fpr: f64,
    stat: F,
) -> (Vec<f64>, Vec<Degeneracy>)
where
    F: Fn(usize, usize) -> f64 + Sync,
{
    let timer = Timer::start();
    let mut alive: Vec<usize> = (0..n_bootstraps).collect();
    let mut thresholds = Vec::with_capacity(window_size);
    let mut warnings = Vec::new();

    for t in 0..window_size {
        if alive.len() < 2 {
            if warnings.is_empty() {
                warnings.push(Degeneracy::new(
                    DegeneracyKind::ExhaustedBootstraps,
                    format!(
                        "{} bootstrap streams left at window position {}, reusing the previous threshold",
                        alive.len(),
                        t
                    ),
                ));
            }
            let last = thresholds.last().copied().unwrap_or(f64::INFINITY);
            thresholds.push(last);
            continue;
        }
        let values: Vec<f64> = alive.par_iter().map(|&b| stat(b, t)).collect();
        let mut sorted = values.clone();
        sort_f64(&mut sorted);
        let threshold = quantile(&sorted, 1.0 - fpr);
        alive = alive
            .iter()
            .zip(values.iter())
            .filter(|&(_, &v)| v < threshold)
            .map(|(&b, _)| b)
            .collect();
        thresholds.push(threshold);
    }

    tracing::debug!(
        n_bootstraps = n_bootstraps,
        window_size = window_size,
        fpr = fpr,
        survivors = alive.len(),
        elapsed_ms = timer.elapsed_ms(),
        "Simulated online thresholds"
    );
    (thresholds, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_follow_quantiles() {
        // Stream b has the constant statistic b
        let (thresholds, warnings) = conditional_thresholds(101, 3, 0.1, |b, _| b as f64);
        assert!(warnings.is_empty());
        assert!((thresholds[0] - 90.0).abs() < 1e-9);
        // Streams 90..=100 are removed, the quantile is taken over 0..90
        assert!((thresholds[1] - 0.9 * 89.0).abs() < 1e-9);
        assert!(thresholds[2] < thresholds[1]);
    }

    #[test]
    fn test_exhausted_bootstraps_reuse_last_threshold() {
        let (thresholds, warnings) = conditional_thresholds(2, 4, 0.5, |b, _| b as f64);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, DegeneracyKind::ExhaustedBootstraps);
        assert_eq!(thresholds.len(), 4);
        assert_eq!(thresholds[1], thresholds[0]);
        assert_eq!(thresholds[3], thresholds[0]);
    }
}
