//! Persisted detector state
//!
//! A snapshot carries everything needed to rebuild a detector without
//! re-running calibration: the configuration, the processed reference, the
//! resolved kernel or LSDD parameters and any cached null distributions.
//! Caller-supplied code (preprocessors, classifier factories) is not
//! serialised; attach it to `snapshot.config` before restoring.

use crate::calibration::EmpiricalNull;
use crate::config::{DetectorConfig, OnlineConfig};
use crate::error::{Degeneracy, DriftError, Result};
use crate::kernel::GaussianRbf;
use crate::sample::Sample;
use crate::statistic::LsddModel;
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Fitted parameters of an offline statistic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FittedStatistic {
    Mmd { kernel: GaussianRbf },
    /// Reference rows left after drawing the kernel centres
    Lsdd { model: LsddModel, reference: Sample },
    /// Per-feature tests refit cheaply from the stored reference
    Univariate,
    /// Classifier and learned-kernel tests train at evaluation time
    Trained,
}

/// Reference-only null cached for one test-batch size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedNull {
    pub n_test: usize,
    pub nulls: Vec<EmpiricalNull>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSnapshot {
    pub version: u32,
    pub config: DetectorConfig,
    /// Reference after preprocessing and sub-sampling
    pub reference: Sample,
    /// Rows observed so far, for reservoir updates
    pub n_seen: usize,
    /// `None` when the detector was awaiting recalibration
    pub fitted: Option<FittedStatistic>,
    pub warnings: Vec<Degeneracy>,
    pub reference_nulls: Vec<CachedNull>,
}

/// Fitted parameters of an online statistic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnlineFitted {
    Mmd { kernel: GaussianRbf },
    /// `reference` holds the rows left after the kernel centres were drawn
    Lsdd { model: LsddModel, reference: Sample },
}

/// Online detector state; the test window is not persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineSnapshot {
    pub version: u32,
    pub config: OnlineConfig,
    pub reference: Sample,
    pub fitted: OnlineFitted,
    pub thresholds: Vec<f64>,
    pub warnings: Vec<Degeneracy>,
    /// Resets performed so far; seeds the next reference subset
    pub reset_count: u64,
}

fn check_version(version: u32) -> Result<()> {
    if version != SNAPSHOT_VERSION {
        return Err(DriftError::Serialization(format!(
            "unsupported snapshot version {} (expected {})",
            version, SNAPSHOT_VERSION
        )));
    }
    Ok(())
}

impl DetectorSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        check_version(snapshot.version)?;
        Ok(snapshot)
    }
}

impl OnlineSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        check_version(snapshot.version)?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_is_rejected() {
        let snapshot = DetectorSnapshot {
            version: SNAPSHOT_VERSION + 1,
            config: DetectorConfig::default(),
            reference: Sample::from_column(&[1.0, 2.0]).unwrap(),
            n_seen: 2,
            fitted: None,
            warnings: Vec::new(),
            reference_nulls: Vec::new(),
        };
        let json = snapshot.to_json().unwrap();
        let err = DetectorSnapshot::from_json(&json).unwrap_err();
        assert!(matches!(err, DriftError::Serialization(_)));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            OnlineSnapshot::from_json("{not json"),
            Err(DriftError::Serialization(_))
        ));
    }
}
