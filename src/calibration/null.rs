use crate::statistic::Alternative;
use crate::stats::{chi_squared_sf, kolmogorov_sf, ks_effective_n, ks_one_sided_p_value, ks_two_sided_p_value, normal_sf};
use crate::utils::{quantile, sort_f64};
use serde::{Deserialize, Serialize};

/// Sorted statistics simulated under the null hypothesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalNull {
    sorted: Vec<f64>,
}

impl EmpiricalNull {
    pub fn from_values(mut values: Vec<f64>) -> Self {
        sort_f64(&mut values);
        Self { sorted: values }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Simulated statistics in ascending order
    pub fn values(&self) -> &[f64] {
        &self.sorted
    }

    /// Fraction of simulated statistics at or above `observed`
    ///
    /// Ties count as exceeding the observed value.
    pub fn p_value(&self, observed: f64) -> f64 {
        if self.sorted.is_empty() {
            return 1.0;
        }
        let below = self.sorted.partition_point(|&v| v < observed);
        (self.sorted.len() - below) as f64 / self.sorted.len() as f64
    }

    /// The (1 - α) quantile
    pub fn threshold(&self, alpha: f64) -> f64 {
        quantile(&self.sorted, 1.0 - alpha)
    }
}

/// Null distribution of a statistic, simulated or asymptotic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NullDistribution {
    /// Resampled statistics
    Empirical(EmpiricalNull),
    /// Asymptotic distribution of the two-sample KS distance
    Kolmogorov {
        n_reference: usize,
        n_test: usize,
        alternative: Alternative,
    },
    /// Chi-squared with `dof` degrees of freedom
    ChiSquared { dof: usize },
    /// Zero-mean normal with standard deviation `std`
    Normal { std: f64 },
}

/// Invert a decreasing function `f` on `[lo, hi]` by bisection
fn bisect_decreasing(f: impl Fn(f64) -> f64, target: f64, mut lo: f64, mut hi: f64) -> f64 {
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if f(mid) > target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

impl NullDistribution {
    pub fn is_asymptotic(&self) -> bool {
        !matches!(self, NullDistribution::Empirical(_))
    }

    pub fn p_value(&self, statistic: f64) -> f64 {
        match self {
            NullDistribution::Empirical(null) => null.p_value(statistic),
            NullDistribution::Kolmogorov {
                n_reference,
                n_test,
                alternative,
            } => match alternative {
                Alternative::TwoSided => ks_two_sided_p_value(statistic, *n_reference, *n_test),
                _ => ks_one_sided_p_value(statistic, *n_reference, *n_test),
            },
            NullDistribution::ChiSquared { dof } => chi_squared_sf(statistic, *dof),
            NullDistribution::Normal { std } => {
                if *std > 0.0 {
                    normal_sf(statistic / std)
                } else if statistic > 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }

    /// Statistic value whose p-value equals `alpha`
    pub fn threshold(&self, alpha: f64) -> f64 {
        match self {
            NullDistribution::Empirical(null) => null.threshold(alpha),
            NullDistribution::Kolmogorov {
                n_reference,
                n_test,
                alternative,
            } => {
                let en = ks_effective_n(*n_reference, *n_test);
                if en <= 0.0 {
                    return f64::INFINITY;
                }
                match alternative {
                    Alternative::TwoSided => {
                        let lambda = bisect_decreasing(kolmogorov_sf, alpha, 0.0, 10.0);
                        let root = en.sqrt();
                        lambda / (root + 0.12 + 0.11 / root)
                    }
                    _ => (-alpha.ln() / (2.0 * en)).sqrt(),
                }
            }
            NullDistribution::ChiSquared { dof } => {
                if *dof == 0 {
                    return f64::INFINITY;
                }
                let mut hi = (*dof as f64).max(1.0);
                while chi_squared_sf(hi, *dof) > alpha && hi < 1e12 {
                    hi *= 2.0;
                }
                bisect_decreasing(|x| chi_squared_sf(x, *dof), alpha, 0.0, hi)
            }
            NullDistribution::Normal { std } => {
                let z = bisect_decreasing(normal_sf, alpha, -10.0, 10.0);
                std * z
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empirical_p_value_counts_ties() {
        let null = EmpiricalNull::from_values(vec![3.0, 1.0, 2.0, 2.0]);
        assert_eq!(null.values(), &[1.0, 2.0, 2.0, 3.0]);
        assert_eq!(null.p_value(2.0), 0.75);
        assert_eq!(null.p_value(3.5), 0.0);
        assert_eq!(null.p_value(0.0), 1.0);
    }

    #[test]
    fn test_empirical_threshold() {
        let null = EmpiricalNull::from_values((0..=100).map(f64::from).collect());
        assert!((null.threshold(0.05) - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_chi_squared_threshold_inverts_p_value() {
        let null = NullDistribution::ChiSquared { dof: 3 };
        let t = null.threshold(0.05);
        assert!((t - 7.815).abs() < 1e-2);
        assert!((null.p_value(t) - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_kolmogorov_threshold_inverts_p_value() {
        let null = NullDistribution::Kolmogorov {
            n_reference: 500,
            n_test: 300,
            alternative: Alternative::TwoSided,
        };
        let t = null.threshold(0.05);
        assert!((null.p_value(t) - 0.05).abs() < 1e-6);

        let one_sided = NullDistribution::Kolmogorov {
            n_reference: 500,
            n_test: 300,
            alternative: Alternative::Greater,
        };
        let t = one_sided.threshold(0.05);
        assert!((one_sided.p_value(t) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_normal_threshold() {
        let null = NullDistribution::Normal { std: 2.0 };
        assert!((null.threshold(0.05) - 2.0 * 1.645).abs() < 1e-2);
        assert!(null.is_asymptotic());
    }
}
