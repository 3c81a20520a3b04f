//! Per-feature Kolmogorov-Smirnov and chi-squared tests

use super::SplitStatistic;
use crate::error::{Degeneracy, DegeneracyKind, DriftError, Result};
use crate::sample::Sample;
use crate::utils::sort_f64;
use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Alternative hypothesis for the KS test
///
/// `Greater` tests whether the reference ECDF lies above the test ECDF
/// (test values shifted upwards), `Less` the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alternative {
    #[default]
    TwoSided,
    Less,
    Greater,
}

/// How a feature is tested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Two-sample Kolmogorov-Smirnov
    Continuous,
    /// Chi-squared test of homogeneity over integer category codes
    Categorical,
}

/// KS distance between two ascending samples
pub fn ks_statistic(a: &[f64], b: &[f64], alternative: Alternative) -> f64 {
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return 0.0;
    }
    let (mut i, mut j) = (0, 0);
    let mut d_plus = 0.0f64;
    let mut d_minus = 0.0f64;
    while i < n && j < m {
        let v = a[i].min(b[j]);
        while i < n && a[i] <= v {
            i += 1;
        }
        while j < m && b[j] <= v {
            j += 1;
        }
        let diff = i as f64 / n as f64 - j as f64 / m as f64;
        d_plus = d_plus.max(diff);
        d_minus = d_minus.max(-diff);
    }
    match alternative {
        Alternative::TwoSided => d_plus.max(d_minus),
        Alternative::Greater => d_plus,
        Alternative::Less => d_minus,
    }
}

/// Chi-squared statistic of a 2×K contingency table and its degrees of freedom
pub fn chi_squared_statistic(
    reference: &BTreeMap<i64, usize>,
    test: &BTreeMap<i64, usize>,
) -> (f64, usize) {
    let n_ref: usize = reference.values().sum();
    let n_test: usize = test.values().sum();
    let total = (n_ref + n_test) as f64;
    if n_ref == 0 || n_test == 0 {
        return (0.0, 0);
    }

    let mut categories: Vec<i64> = reference.keys().chain(test.keys()).copied().collect();
    categories.sort_unstable();
    categories.dedup();

    let statistic = categories
        .iter()
        .map(|c| {
            let o_ref = *reference.get(c).unwrap_or(&0) as f64;
            let o_test = *test.get(c).unwrap_or(&0) as f64;
            let col = o_ref + o_test;
            let e_ref = n_ref as f64 * col / total;
            let e_test = n_test as f64 * col / total;
            (o_ref - e_ref).powi(2) / e_ref + (o_test - e_test).powi(2) / e_test
        })
        .sum();
    (statistic, categories.len().saturating_sub(1))
}

fn count_codes(values: impl Iterator<Item = f64>) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for v in values {
        *counts.entry(v as i64).or_insert(0) += 1;
    }
    counts
}

fn sorted(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut v: Vec<f64> = values.collect();
    sort_f64(&mut v);
    v
}

/// Independent per-feature tests fitted to a reference sample
#[derive(Debug, Clone)]
pub struct UnivariateStatistic {
    reference: Sample,
    kinds: Vec<FeatureKind>,
    alternative: Alternative,
    sorted_reference: Vec<Vec<f64>>,
    reference_counts: Vec<BTreeMap<i64, usize>>,
    constant: Vec<bool>,
}

impl UnivariateStatistic {
    pub fn fit(reference: &Sample, kinds: Vec<FeatureKind>, alternative: Alternative) -> Result<Self> {
        if kinds.len() != reference.n_features() {
            return Err(DriftError::shape(
                format!("{} feature kinds", reference.n_features()),
                format!("{} feature kinds", kinds.len()),
            ));
        }
        let stat = Self {
            reference: reference.clone(),
            sorted_reference: Vec::new(),
            reference_counts: Vec::new(),
            constant: Vec::new(),
            kinds,
            alternative,
        };
        stat.check_categories(reference)?;

        let mut sorted_reference = Vec::with_capacity(stat.kinds.len());
        let mut reference_counts = Vec::with_capacity(stat.kinds.len());
        let mut constant = Vec::with_capacity(stat.kinds.len());
        for (j, kind) in stat.kinds.iter().enumerate() {
            let column = reference.column(j);
            match kind {
                FeatureKind::Continuous => {
                    let s = sorted(column.iter().copied());
                    constant.push(s.first() == s.last());
                    sorted_reference.push(s);
                    reference_counts.push(BTreeMap::new());
                }
                FeatureKind::Categorical => {
                    let counts = count_codes(column.iter().copied());
                    constant.push(counts.len() <= 1);
                    sorted_reference.push(Vec::new());
                    reference_counts.push(counts);
                }
            }
        }
        Ok(Self {
            sorted_reference,
            reference_counts,
            constant,
            ..stat
        })
    }

    /// Continuous KS tests on every feature
    pub fn continuous(reference: &Sample, alternative: Alternative) -> Result<Self> {
        Self::fit(reference, vec![FeatureKind::Continuous; reference.n_features()], alternative)
    }

    /// Chi-squared tests on every feature
    pub fn categorical(reference: &Sample) -> Result<Self> {
        Self::fit(reference, vec![FeatureKind::Categorical; reference.n_features()], Alternative::TwoSided)
    }

    /// Mixed tabular data: the listed features are categorical, the rest continuous
    pub fn tabular(reference: &Sample, categorical: &[usize], alternative: Alternative) -> Result<Self> {
        let d = reference.n_features();
        if let Some(&bad) = categorical.iter().find(|&&j| j >= d) {
            return Err(DriftError::InvalidConfiguration(format!(
                "categorical feature index {} out of range for {} features",
                bad, d
            )));
        }
        let kinds = (0..d)
            .map(|j| {
                if categorical.contains(&j) {
                    FeatureKind::Categorical
                } else {
                    FeatureKind::Continuous
                }
            })
            .collect();
        Self::fit(reference, kinds, alternative)
    }

    pub fn kinds(&self) -> &[FeatureKind] {
        &self.kinds
    }

    pub fn alternative(&self) -> Alternative {
        self.alternative
    }

    pub fn n_features(&self) -> usize {
        self.kinds.len()
    }

    /// Features whose reference holds a single value or category
    pub fn constant_features(&self) -> &[bool] {
        &self.constant
    }

    /// Warnings for features that can give no drift signal
    pub fn degeneracies(&self) -> Vec<Degeneracy> {
        self.constant
            .iter()
            .zip(self.kinds.iter())
            .enumerate()
            .filter(|(_, (c, _))| **c)
            .map(|(j, (_, kind))| match kind {
                FeatureKind::Continuous => Degeneracy::for_feature(
                    DegeneracyKind::ZeroVariance,
                    j,
                    "reference feature is constant, p-value set to 1",
                ),
                FeatureKind::Categorical => Degeneracy::for_feature(
                    DegeneracyKind::SingleCategory,
                    j,
                    "reference feature has a single category, p-value set to 1",
                ),
            })
            .collect()
    }

    /// Reject non-integral values in categorical features
    pub fn check_categories(&self, sample: &Sample) -> Result<()> {
        for (j, kind) in self.kinds.iter().enumerate() {
            if *kind == FeatureKind::Categorical {
                if let Some(v) = sample.column(j).iter().find(|v| v.fract() != 0.0) {
                    return Err(DriftError::InvalidInput(format!(
                        "categorical feature {} has non-integral value {}",
                        j, v
                    )));
                }
            }
        }
        Ok(())
    }

    /// Observed per-feature statistics and chi-squared degrees of freedom
    pub fn compute(&self, test: &Sample) -> Result<(Vec<f64>, Vec<usize>)> {
        test.check_features(self.n_features())?;
        self.check_categories(test)?;
        let mut statistics = Vec::with_capacity(self.n_features());
        let mut dofs = Vec::with_capacity(self.n_features());
        for (j, kind) in self.kinds.iter().enumerate() {
            let column = test.column(j);
            match kind {
                FeatureKind::Continuous => {
                    let t = sorted(column.iter().copied());
                    statistics.push(ks_statistic(&self.sorted_reference[j], &t, self.alternative));
                    dofs.push(0);
                }
                FeatureKind::Categorical => {
                    let counts = count_codes(column.iter().copied());
                    let (stat, dof) = chi_squared_statistic(&self.reference_counts[j], &counts);
                    statistics.push(stat);
                    dofs.push(dof);
                }
            }
        }
        Ok((statistics, dofs))
    }

    pub fn pooled(&self, test: &Sample) -> Result<ColumnSplit<'_>> {
        let data = concatenate(Axis(0), &[self.reference.view(), test.view()])?;
        Ok(ColumnSplit { data, stat: self })
    }

    pub fn reference_split(&self) -> ColumnSplit<'_> {
        ColumnSplit {
            data: self.reference.as_array().clone(),
            stat: self,
        }
    }
}

/// Pooled columns evaluated on index splits
#[derive(Debug, Clone)]
pub struct ColumnSplit<'a> {
    data: Array2<f64>,
    stat: &'a UnivariateStatistic,
}

impl SplitStatistic for ColumnSplit<'_> {
    fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    fn n_outputs(&self) -> usize {
        self.stat.n_features()
    }

    fn evaluate(&self, x: &[usize], y: &[usize]) -> Vec<f64> {
        self.stat
            .kinds
            .iter()
            .enumerate()
            .map(|(j, kind)| {
                let column = self.data.column(j);
                match kind {
                    FeatureKind::Continuous => {
                        let a = sorted(x.iter().map(|&i| column[i]));
                        let b = sorted(y.iter().map(|&i| column[i]));
                        ks_statistic(&a, &b, self.stat.alternative)
                    }
                    FeatureKind::Categorical => {
                        let a = count_codes(x.iter().map(|&i| column[i]));
                        let b = count_codes(y.iter().map(|&i| column[i]));
                        chi_squared_statistic(&a, &b).0
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ks_statistic_disjoint() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        assert_eq!(ks_statistic(&a, &b, Alternative::TwoSided), 1.0);
        assert_eq!(ks_statistic(&a, &b, Alternative::Greater), 1.0);
        assert_eq!(ks_statistic(&a, &b, Alternative::Less), 0.0);
    }

    #[test]
    fn test_ks_statistic_ties() {
        let a = [1.0, 1.0, 2.0, 2.0];
        let b = [1.0, 1.0, 2.0, 2.0];
        assert_eq!(ks_statistic(&a, &b, Alternative::TwoSided), 0.0);
        let c = [1.0, 2.0, 2.0, 2.0];
        assert!((ks_statistic(&a, &c, Alternative::TwoSided) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_chi_squared_homogeneous() {
        let r = BTreeMap::from([(0, 50), (1, 50)]);
        let t = BTreeMap::from([(0, 25), (1, 25)]);
        let (stat, dof) = chi_squared_statistic(&r, &t);
        assert!(stat.abs() < 1e-12);
        assert_eq!(dof, 1);
    }

    #[test]
    fn test_chi_squared_new_category() {
        let r = BTreeMap::from([(0, 10)]);
        let t = BTreeMap::from([(0, 5), (1, 5)]);
        let (stat, dof) = chi_squared_statistic(&r, &t);
        assert!(stat > 0.0);
        assert_eq!(dof, 1);
    }

    #[test]
    fn test_constant_feature_flagged() {
        let reference = Sample::from_rows(&[vec![5.0, 1.0], vec![5.0, 2.0], vec![5.0, 3.0]]).unwrap();
        let stat = UnivariateStatistic::continuous(&reference, Alternative::TwoSided).unwrap();
        assert_eq!(stat.constant_features(), &[true, false]);
        assert_eq!(stat.degeneracies().len(), 1);
        let test = Sample::from_rows(&[vec![6.0, 1.0], vec![7.0, 2.0]]).unwrap();
        let (stats, _) = stat.compute(&test).unwrap();
        assert_eq!(stats[0], 1.0);
    }

    #[test]
    fn test_single_category_flagged() {
        let reference = Sample::from_rows(&[vec![3.0, 0.0], vec![3.0, 1.0], vec![3.0, 1.0]]).unwrap();
        let stat = UnivariateStatistic::categorical(&reference).unwrap();
        assert_eq!(stat.constant_features(), &[true, false]);
        let warnings = stat.degeneracies();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, DegeneracyKind::SingleCategory);
        assert_eq!(warnings[0].feature, Some(0));
    }

    #[test]
    fn test_non_integral_category_rejected() {
        let reference = Sample::from_rows(&[vec![0.0, 1.5], vec![1.0, 2.5]]).unwrap();
        let err = UnivariateStatistic::tabular(&reference, &[1], Alternative::TwoSided).unwrap_err();
        assert!(matches!(err, DriftError::InvalidInput(_)));
    }

    #[test]
    fn test_split_matches_compute() {
        let reference = Sample::from_rows(&[vec![0.1, 0.0], vec![0.4, 1.0], vec![0.2, 1.0]]).unwrap();
        let test = Sample::from_rows(&[vec![0.9, 0.0], vec![0.8, 2.0]]).unwrap();
        let stat = UnivariateStatistic::tabular(&reference, &[1], Alternative::TwoSided).unwrap();
        let split = stat.pooled(&test).unwrap();
        let via_split = split.evaluate(&[0, 1, 2], &[3, 4]);
        let (direct, dofs) = stat.compute(&test).unwrap();
        assert_eq!(via_split.len(), 2);
        for (a, b) in via_split.iter().zip(direct.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        assert_eq!(dofs, vec![0, 2]);
    }
}
