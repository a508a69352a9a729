//! Structured per-iteration progress, rendered outside the numerical code.

use std::fmt;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Single-level SCF iteration.
    Scf,
    /// Cumulant update at fixed orbitals.
    Cumulant,
    /// Orbital update at fixed cumulant.
    Orbital,
    /// Joint orbital and cumulant update.
    Simultaneous,
    /// Newton step over orbitals and cumulant.
    Newton,
}

/// What the DIIS subspace did in an iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiisStatus {
    pub stored: bool,
    pub extrapolated: bool,
    pub size: usize,
}

impl fmt::Display for DiisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.stored, self.extrapolated) {
            (true, true) => f.write_str("S/E"),
            (true, false) => f.write_str("S"),
            (false, true) => f.write_str("/E"),
            (false, false) => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StepFlags {
    pub mom: bool,
    pub damping: bool,
    pub frac: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct IterationRecord {
    pub phase: Phase,
    /// Outer iteration, equal to `micro_iteration` for single-level loops.
    pub macro_iteration: usize,
    pub micro_iteration: usize,
    pub energy: f64,
    pub delta_energy: f64,
    pub orbital_residual: Option<f64>,
    pub cumulant_residual: Option<f64>,
    pub density_residual: Option<f64>,
    pub diis: DiisStatus,
    pub flags: StepFlags,
}

impl IterationRecord {
    pub fn new(phase: Phase, macro_iteration: usize, micro_iteration: usize) -> Self {
        Self {
            phase,
            macro_iteration,
            micro_iteration,
            energy: 0.0,
            delta_energy: 0.0,
            orbital_residual: None,
            cumulant_residual: None,
            density_residual: None,
            diis: DiisStatus::default(),
            flags: StepFlags::default(),
        }
    }

    fn status(&self) -> String {
        let mut parts = Vec::new();
        let diis = self.diis.to_string();
        if self.diis.extrapolated {
            parts.push("DIIS".to_string());
        } else if !diis.is_empty() {
            parts.push(diis);
        }
        if self.flags.mom {
            parts.push("MOM".into());
        }
        if self.flags.damping {
            parts.push("DAMP".into());
        }
        if self.flags.frac {
            parts.push("FRAC".into());
        }
        parts.join("/")
    }
}

pub trait IterationObserver {
    fn on_iteration(&mut self, record: &IterationRecord);
}

/// Renders records through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

fn residual(value: Option<f64>) -> String {
    value.map_or_else(|| format!("{:>12}", "-"), |v| format!("{v:12.3e}"))
}

impl IterationObserver for LogObserver {
    fn on_iteration(&mut self, record: &IterationRecord) {
        match record.phase {
            Phase::Scf => log::info!(
                "iter {:3}: {:20.14} {:12.5e} {:<11.5e} {}",
                record.micro_iteration,
                record.energy,
                record.delta_energy,
                record.orbital_residual.unwrap_or_default(),
                record.status(),
            ),
            phase => log::info!(
                "{:?} {:>3}.{:<3} {} {} {} {:12.3e} {:21.15} {}",
                phase,
                record.macro_iteration,
                record.micro_iteration,
                residual(record.orbital_residual),
                residual(record.cumulant_residual),
                residual(record.density_residual),
                record.delta_energy,
                record.energy,
                record.status(),
            ),
        }
    }
}

/// Keeps every record, e.g. to dump an iteration history.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub records: Vec<IterationRecord>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &IterationRecord> {
        self.records.iter().filter(move |r| r.phase == phase)
    }
}

impl IterationObserver for RecordingObserver {
    fn on_iteration(&mut self, record: &IterationRecord) {
        self.records.push(record.clone());
    }
}

/// Forwards to two observers.
pub struct Tee<'a, A: ?Sized, B: ?Sized>(pub &'a mut A, pub &'a mut B);

impl<A: IterationObserver + ?Sized, B: IterationObserver + ?Sized> IterationObserver
    for Tee<'_, A, B>
{
    fn on_iteration(&mut self, record: &IterationRecord) {
        self.0.on_iteration(record);
        self.1.on_iteration(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mirrors_iteration_flags() {
        let mut record = IterationRecord::new(Phase::Scf, 3, 3);
        assert_eq!(record.status(), "");

        record.diis = DiisStatus {
            stored: true,
            extrapolated: false,
            size: 1,
        };
        record.flags.damping = true;
        assert_eq!(record.status(), "S/DAMP");

        record.diis.extrapolated = true;
        record.flags.mom = true;
        assert_eq!(record.status(), "DIIS/MOM/DAMP");
    }

    #[test]
    fn recording_observer_filters_by_phase() {
        let mut observer = RecordingObserver::new();
        observer.on_iteration(&IterationRecord::new(Phase::Cumulant, 1, 1));
        observer.on_iteration(&IterationRecord::new(Phase::Orbital, 1, 1));
        observer.on_iteration(&IterationRecord::new(Phase::Cumulant, 2, 1));

        assert_eq!(observer.phase(Phase::Cumulant).count(), 2);
    }
}
