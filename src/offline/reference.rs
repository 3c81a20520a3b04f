//! Reference maintenance for offline detectors

use crate::config::{DetectorConfig, ReferenceUpdate};
use crate::error::{DriftError, Result};
use crate::sample::Sample;
use crate::utils::stream_rng;
use ndarray::{stack, Array1, Axis};
use rand::Rng;

/// Seed stream for the construction-time sub-sample
pub(crate) const SUBSAMPLE_STREAM: u64 = 0;
/// Seed stream for reservoir replacement draws
pub(crate) const RESERVOIR_STREAM: u64 = 3;

/// Preprocess a raw reference and sub-sample it to the configured size
pub(crate) fn prepare_reference(config: &DetectorConfig, raw: &Sample) -> Result<Sample> {
    if raw.is_empty() {
        return Err(DriftError::EmptyReference);
    }
    let processed = match &config.preprocessor {
        Some(p) => p.transform(raw)?,
        None => raw.clone(),
    };
    if processed.is_empty() {
        return Err(DriftError::EmptyReference);
    }
    match config.max_reference_size {
        Some(max) if processed.n_samples() > max => {
            let mut rng = stream_rng(config.seed, SUBSAMPLE_STREAM);
            tracing::debug!(from = processed.n_samples(), to = max, "Sub-sampling reference");
            Ok(processed.subsample(max, &mut rng))
        }
        _ => Ok(processed),
    }
}

/// Reservoir sampling (algorithm R) of `batch` into `reference`
///
/// `n_seen` counts every row offered so far, including the current reference.
pub(crate) fn reservoir_update<R: Rng>(
    reference: &Sample,
    batch: &Sample,
    capacity: usize,
    n_seen: usize,
    rng: &mut R,
) -> Result<Sample> {
    let mut rows: Vec<Array1<f64>> = reference.view().rows().into_iter().map(|r| r.to_owned()).collect();
    let mut seen = n_seen;
    for row in batch.view().rows() {
        seen += 1;
        if rows.len() < capacity {
            rows.push(row.to_owned());
        } else {
            let j = rng.gen_range(0..seen);
            if j < capacity {
                rows[j] = row.to_owned();
            }
        }
    }
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    Sample::new(stack(Axis(0), &views)?)
}

/// New reference after folding in `batch` under `policy`; `None` leaves it unchanged
pub(crate) fn apply_update<R: Rng>(
    policy: ReferenceUpdate,
    reference: &Sample,
    batch: &Sample,
    n_seen: usize,
    rng: &mut R,
) -> Result<Option<Sample>> {
    match policy {
        ReferenceUpdate::None => Ok(None),
        ReferenceUpdate::Last(n) => Ok(Some(reference.concat(batch)?.tail(n))),
        ReferenceUpdate::Reservoir(n) => reservoir_update(reference, batch, n, n_seen, rng).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::seeded_rng;

    #[test]
    fn test_last_keeps_most_recent_rows() {
        let reference = Sample::from_column(&[1.0, 2.0, 3.0]).unwrap();
        let batch = Sample::from_column(&[4.0, 5.0]).unwrap();
        let mut rng = seeded_rng(0);
        let updated = apply_update(ReferenceUpdate::Last(4), &reference, &batch, 3, &mut rng)
            .unwrap()
            .unwrap();
        assert_eq!(updated.column(0).to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_reservoir_fills_then_holds_capacity() {
        let reference = Sample::from_column(&[0.0, 1.0]).unwrap();
        let batch = Sample::from_column(&(2..50).map(f64::from).collect::<Vec<_>>()).unwrap();
        let mut rng = seeded_rng(1);
        let updated = reservoir_update(&reference, &batch, 10, 2, &mut rng).unwrap();
        assert_eq!(updated.n_samples(), 10);
        assert!(updated.column(0).iter().any(|&v| v >= 10.0));
    }

    #[test]
    fn test_none_policy_is_noop() {
        let reference = Sample::from_column(&[1.0]).unwrap();
        let mut rng = seeded_rng(0);
        let updated = apply_update(ReferenceUpdate::None, &reference, &reference, 1, &mut rng).unwrap();
        assert!(updated.is_none());
    }

    #[test]
    fn test_prepare_reference_subsamples() {
        let raw = Sample::from_column(&(0..100).map(f64::from).collect::<Vec<_>>()).unwrap();
        let config = DetectorConfig::default().with_max_reference_size(25).with_seed(3);
        let a = prepare_reference(&config, &raw).unwrap();
        let b = prepare_reference(&config, &raw).unwrap();
        assert_eq!(a.n_samples(), 25);
        assert_eq!(a, b);
    }
}
