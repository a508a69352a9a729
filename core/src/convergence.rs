//! Residual bookkeeping for the iterative solvers.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{Result, SolverError};

/// Residual magnitude above which an iteration is considered divergent.
pub const DIVERGENCE_THRESHOLD: f64 = 100.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Criterion {
    Energy,
    Density,
    OrbitalGradient,
    Cumulant,
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Criterion::Energy => "energy",
            Criterion::Density => "density",
            Criterion::OrbitalGradient => "orbital gradient",
            Criterion::Cumulant => "cumulant residual",
        };
        f.write_str(name)
    }
}

/// How a criterion compares against its threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CriterionKind {
    /// `|latest| < threshold`. Subject to the divergence bound.
    Value,
    /// `|latest - previous| < threshold`. Needs two records.
    Delta,
}

#[derive(Debug)]
struct Track {
    kind: CriterionKind,
    threshold: f64,
    latest: Option<f64>,
    delta: Option<f64>,
    records: usize,
    since_checked: Cell<usize>,
}

/// Tracks scalar residuals for several named criteria.
#[derive(Debug)]
pub struct ConvergenceTracker {
    tracks: BTreeMap<Criterion, Track>,
    divergence_threshold: f64,
}

impl Default for ConvergenceTracker {
    fn default() -> Self {
        Self::new(DIVERGENCE_THRESHOLD)
    }
}

impl ConvergenceTracker {
    pub fn new(divergence_threshold: f64) -> Self {
        Self {
            tracks: BTreeMap::new(),
            divergence_threshold,
        }
    }

    pub fn with(mut self, criterion: Criterion, kind: CriterionKind, threshold: f64) -> Self {
        self.track(criterion, kind, threshold);
        self
    }

    /// Starts tracking `criterion`, discarding any earlier history.
    pub fn track(&mut self, criterion: Criterion, kind: CriterionKind, threshold: f64) {
        self.tracks.insert(
            criterion,
            Track {
                kind,
                threshold,
                latest: None,
                delta: None,
                records: 0,
                since_checked: Cell::new(0),
            },
        );
    }

    pub fn set_threshold(&mut self, criterion: Criterion, threshold: f64) {
        if let Some(track) = self.tracks.get_mut(&criterion) {
            track.threshold = threshold;
        }
    }

    pub fn divergence_threshold(&self) -> f64 {
        self.divergence_threshold
    }

    /// Appends a value. A value criterion above the divergence bound (or NaN)
    /// returns [`SolverError::Divergence`].
    pub fn record(&mut self, criterion: Criterion, value: f64) -> Result<()> {
        let bound = self.divergence_threshold;
        let track = self.tracks.get_mut(&criterion).ok_or_else(|| {
            SolverError::configuration(format!("convergence criterion {criterion} is not tracked"))
        })?;

        track.delta = track.latest.map(|previous| value - previous);
        track.latest = Some(value);
        track.records += 1;
        track.since_checked.set(track.since_checked.get() + 1);

        if track.kind == CriterionKind::Value && (value.is_nan() || value.abs() > bound) {
            return Err(SolverError::Divergence {
                quantity: criterion.to_string(),
                value,
                bound,
            });
        }
        Ok(())
    }

    pub fn is_converged(&self, criterion: Criterion) -> bool {
        let Some(track) = self.tracks.get(&criterion) else {
            return false;
        };
        track.since_checked.set(0);

        match track.kind {
            CriterionKind::Value => track.latest.is_some_and(|v| v.abs() < track.threshold),
            CriterionKind::Delta => track.delta.is_some_and(|d| d.abs() < track.threshold),
        }
    }

    pub fn all_converged(&self, criteria: &[Criterion]) -> bool {
        // evaluate every criterion so each check counter is reset
        criteria
            .iter()
            .map(|&c| self.is_converged(c))
            .fold(true, |acc, converged| acc && converged)
    }

    pub fn latest(&self, criterion: Criterion) -> Option<f64> {
        self.tracks.get(&criterion).and_then(|t| t.latest)
    }

    pub fn delta(&self, criterion: Criterion) -> Option<f64> {
        self.tracks.get(&criterion).and_then(|t| t.delta)
    }

    pub fn records(&self, criterion: Criterion) -> usize {
        self.tracks.get(&criterion).map_or(0, |t| t.records)
    }

    /// Records appended since the criterion was last checked.
    pub fn since_checked(&self, criterion: Criterion) -> usize {
        self.tracks
            .get(&criterion)
            .map_or(0, |t| t.since_checked.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ConvergenceTracker {
        ConvergenceTracker::default()
            .with(Criterion::Energy, CriterionKind::Delta, 1e-6)
            .with(Criterion::OrbitalGradient, CriterionKind::Value, 1e-5)
    }

    #[test]
    fn delta_needs_two_records() {
        let mut tracker = tracker();
        tracker.record(Criterion::Energy, -1.0).unwrap();
        assert!(!tracker.is_converged(Criterion::Energy));

        tracker.record(Criterion::Energy, -1.0 + 1e-8).unwrap();
        assert!(tracker.is_converged(Criterion::Energy));
    }

    #[test]
    fn threshold_is_strict() {
        let mut tracker = tracker();
        tracker.record(Criterion::OrbitalGradient, 1e-5).unwrap();
        assert!(!tracker.is_converged(Criterion::OrbitalGradient));
    }

    #[test]
    fn converged_value_stays_converged() {
        let mut tracker = tracker();
        let value = 1e-5 * (1.0 - f64::EPSILON);
        for _ in 0..10 {
            tracker.record(Criterion::OrbitalGradient, value).unwrap();
            assert!(tracker.is_converged(Criterion::OrbitalGradient));
        }
    }

    #[test]
    fn all_converged_is_conjunction() {
        let mut tracker = tracker();
        tracker.record(Criterion::Energy, -2.0).unwrap();
        tracker.record(Criterion::Energy, -2.0).unwrap();
        tracker.record(Criterion::OrbitalGradient, 1e-3).unwrap();

        assert!(!tracker.all_converged(&[Criterion::Energy, Criterion::OrbitalGradient]));

        tracker.record(Criterion::OrbitalGradient, 1e-7).unwrap();
        assert!(tracker.all_converged(&[Criterion::Energy, Criterion::OrbitalGradient]));
    }

    #[test]
    fn growing_residual_diverges() {
        let mut tracker = tracker();
        let mut outcome = Ok(());
        let mut steps = 0;
        while outcome.is_ok() && steps < 20 {
            let value = 10f64.powi(steps - 2);
            outcome = tracker.record(Criterion::OrbitalGradient, value);
            steps += 1;
        }

        match outcome {
            Err(SolverError::Divergence { value, bound, .. }) => {
                assert!(value > bound);
                assert_eq!(bound, DIVERGENCE_THRESHOLD);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
        // 1e-2 .. 1e2 pass, 1e3 trips the bound
        assert_eq!(steps, 6);
    }

    #[test]
    fn energies_are_not_bounded() {
        let mut tracker = tracker();
        assert!(tracker.record(Criterion::Energy, -1500.0).is_ok());
    }

    #[test]
    fn counter_resets_on_check() {
        let mut tracker = tracker();
        tracker.record(Criterion::OrbitalGradient, 1.0).unwrap();
        tracker.record(Criterion::OrbitalGradient, 0.5).unwrap();
        assert_eq!(tracker.since_checked(Criterion::OrbitalGradient), 2);

        tracker.is_converged(Criterion::OrbitalGradient);
        assert_eq!(tracker.since_checked(Criterion::OrbitalGradient), 0);
    }

    #[test]
    fn untracked_criterion_is_rejected() {
        let mut tracker = tracker();
        assert!(matches!(
            tracker.record(Criterion::Cumulant, 0.1),
            Err(SolverError::Configuration(_))
        ));
    }
}
