//! Multiple-testing correction for per-feature tests

use crate::error::{DriftError, Result};
use serde::{Deserialize, Serialize};

/// Rule combining per-feature p-values into one decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correction {
    /// Family-wise error control: reject when any `p < α/m`
    #[default]
    Bonferroni,
    /// Benjamini-Hochberg false discovery rate control
    Fdr,
}

/// Aggregated decision over `m` per-feature tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionOutcome {
    pub drift_detected: bool,
    /// Corrected p-value bar that was applied
    pub threshold: f64,
    /// Per-feature rejection, in input order
    pub rejected: Vec<bool>,
}

/// Combine `p_values` at level `alpha` under `rule`
///
/// With a single p-value both rules reduce to `p < α` (Bonferroni) or
/// `p ≤ α` (FDR).
pub fn aggregate(p_values: &[f64], alpha: f64, rule: Correction) -> Result<CorrectionOutcome> {
    if p_values.is_empty() {
        return Err(DriftError::InvalidInput("no p-values to correct".to_string()));
    }
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(DriftError::InvalidConfiguration(format!(
            "alpha must be in (0, 1), got {}",
            alpha
        )));
    }
    if let Some(p) = p_values.iter().find(|p| p.is_nan()) {
        return Err(DriftError::InvalidInput(format!("p-value {} is not a number", p)));
    }

    let m = p_values.len() as f64;
    let outcome = match rule {
        Correction::Bonferroni => {
            let threshold = alpha / m;
            let rejected: Vec<bool> = p_values.iter().map(|&p| p < threshold).collect();
            CorrectionOutcome {
                drift_detected: rejected.iter().any(|&r| r),
                threshold,
                rejected,
            }
        }
        Correction::Fdr => {
            let mut order: Vec<usize> = (0..p_values.len()).collect();
            order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));
            // Largest rank k with p(k) <= k * alpha / m
            let k = order
                .iter()
                .enumerate()
                .rev()
                .find(|&(rank, &i)| p_values[i] <= (rank as f64 + 1.0) * alpha / m)
                .map(|(rank, _)| rank + 1);

            let mut rejected = vec![false; p_values.len()];
            let threshold = match k {
                Some(k) => {
                    for &i in &order[..k] {
                        rejected[i] = true;
                    }
                    k as f64 * alpha / m
                }
                None => alpha / m,
            };
            CorrectionOutcome {
                drift_detected: k.is_some(),
                threshold,
                rejected,
            }
        }
    };
    Ok(outcome)
}
