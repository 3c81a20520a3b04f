//! Asymptotic null distributions
//!
//! Survival functions used by the parametric p-value paths: Kolmogorov
//! (two-sample KS), Smirnov (one-sided KS), chi-squared, binomial and the
//! standard normal.

use std::f64::consts::{PI, SQRT_2};

/// Error function approximation (Abramowitz and Stegun 7.1.26)
pub fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

/// Standard normal CDF
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

/// Upper tail of the standard normal
pub fn normal_sf(x: f64) -> f64 {
    (1.0 - normal_cdf(x)).clamp(0.0, 1.0)
}

/// Natural log of the gamma function (Lanczos, g = 7)
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection formula
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut a = COEFFS[0];
    let t = x + 7.5;
    for (i, &c) in COEFFS.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

/// Regularised upper incomplete gamma function Q(a, x)
pub fn gamma_q(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    if a <= 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        1.0 - gamma_p_series(a, x)
    } else {
        gamma_q_continued_fraction(a, x)
    }
}

fn gamma_p_series(a: f64, x: f64) -> f64 {
    let mut ap = a;
    let mut sum = 1.0 / a;
    let mut del = sum;
    for _ in 0..1000 {
        ap += 1.0;
        del *= x / ap;
        sum += del;
        if del.abs() < sum.abs() * 1e-15 {
            break;
        }
    }
    (sum * (-x + a * x.ln() - ln_gamma(a)).exp()).clamp(0.0, 1.0)
}

fn gamma_q_continued_fraction(a: f64, x: f64) -> f64 {
    const FPMIN: f64 = 1e-300;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..1000 {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = b + an / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < 1e-15 {
            break;
        }
    }
    ((-x + a * x.ln() - ln_gamma(a)).exp() * h).clamp(0.0, 1.0)
}

/// Upper tail of the chi-squared distribution with `dof` degrees of freedom
pub fn chi_squared_sf(statistic: f64, dof: usize) -> f64 {
    if dof == 0 || statistic <= 0.0 {
        return 1.0;
    }
    gamma_q(dof as f64 / 2.0, statistic / 2.0)
}

/// Kolmogorov distribution survival function Q_KS(λ)
pub fn kolmogorov_sf(lambda: f64) -> f64 {
    if lambda < 0.2 {
        return 1.0;
    }
    let mut sum = 0.0;
    let mut previous_term = 0.0f64;
    for k in 1..=100 {
        let sign = if k % 2 == 1 { 1.0 } else { -1.0 };
        let term = sign * (-2.0 * (k as f64).powi(2) * lambda * lambda).exp();
        sum += term;
        if term.abs() <= 1e-12 * sum.abs() || term.abs() <= 1e-3 * previous_term.abs() {
            return (2.0 * sum).clamp(0.0, 1.0);
        }
        previous_term = term;
    }
    1.0
}

/// Effective sample size used by the two-sample KS approximations
pub fn ks_effective_n(n: usize, m: usize) -> f64 {
    (n as f64 * m as f64) / (n + m) as f64
}

/// Two-sided two-sample KS p-value with Stephens' small-sample correction
pub fn ks_two_sided_p_value(d: f64, n: usize, m: usize) -> f64 {
    if n == 0 || m == 0 {
        return 1.0;
    }
    let en = ks_effective_n(n, m).sqrt();
    kolmogorov_sf((en + 0.12 + 0.11 / en) * d)
}

/// One-sided two-sample KS p-value (Smirnov asymptotic)
pub fn ks_one_sided_p_value(d_plus: f64, n: usize, m: usize) -> f64 {
    if n == 0 || m == 0 || d_plus <= 0.0 {
        return 1.0;
    }
    (-2.0 * ks_effective_n(n, m) * d_plus * d_plus).exp().clamp(0.0, 1.0)
}

/// P(X >= k) for X ~ Binomial(n, p)
pub fn binomial_sf(k: usize, n: usize, p: f64) -> f64 {
    if k == 0 {
        return 1.0;
    }
    if k > n {
        return 0.0;
    }
    if p <= 0.0 {
        return 0.0;
    }
    if p >= 1.0 {
        return 1.0;
    }
    let ln_p = p.ln();
    let ln_q = (1.0 - p).ln();
    let ln_n_fact = ln_gamma(n as f64 + 1.0);
    let total: f64 = (k..=n)
        .map(|i| {
            let ln_choose = ln_n_fact - ln_gamma(i as f64 + 1.0) - ln_gamma((n - i) as f64 + 1.0);
            (ln_choose + i as f64 * ln_p + (n - i) as f64 * ln_q).exp()
        })
        .sum();
    total.clamp(0.0, 1.0)
}

/// Smallest `k` with `P(X >= k) < alpha` for X ~ Binomial(n, p), `n + 1` if none
///
/// Accumulates the upper tail once, from `n` downwards.
pub fn binomial_critical_value(n: usize, p: f64, alpha: f64) -> usize {
    if p <= 0.0 {
        return 1;
    }
    if p >= 1.0 {
        return n + 1;
    }
    let ln_p = p.ln();
    let ln_q = (1.0 - p).ln();
    let ln_n_fact = ln_gamma(n as f64 + 1.0);
    let mut tail = 0.0;
    let mut k = n + 1;
    for i in (1..=n).rev() {
        let ln_choose = ln_n_fact - ln_gamma(i as f64 + 1.0) - ln_gamma((n - i) as f64 + 1.0);
        tail += (ln_choose + i as f64 * ln_p + (n - i) as f64 * ln_q).exp();
        if tail >= alpha {
            break;
        }
        k = i;
    }
    k
}
