//! Which orbitals hold the electrons: aufbau, fixed DOCC/SOCC, maximum overlap
//! (MOM) and fractional occupation.

use std::cmp::Ordering;

use crate::config::{ReferenceKind, ScfOptions};
use crate::error::{Result, SolverError};
use crate::linalg::{BlockedMatrix, BlockedVector, Dimension};
use crate::report::StepFlags;

use super::orbitals::{OrbitalSet, SpinChannel, SpinOrbitals};

/// Occupied counts per irrep for the `n` lowest orbital energies.
pub fn aufbau(energies: &BlockedVector, n: usize) -> Dimension {
    let mut ranked: Vec<(usize, f64)> = energies.iter().map(|(h, _, e)| (h, e)).collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut noccpi: Dimension = (0..energies.nirrep()).map(|_| 0).collect();
    for (h, _) in ranked.into_iter().take(n) {
        noccpi[h] += 1;
    }
    noccpi
}

/// `(irrep, index)` of every orbital, lowest energy first.
fn energy_ranking(energies: &BlockedVector) -> Vec<(usize, usize)> {
    let mut ranked: Vec<(usize, usize, f64)> = energies.iter().collect();
    ranked.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(Ordering::Equal));
    ranked.into_iter().map(|(h, i, _)| (h, i)).collect()
}

/// Puts the orbitals flagged in `occupied` first in every irrep, each group
/// keeping its current order, and occupies them.
fn occupy_selected(orbitals: &mut SpinOrbitals, occupied: &[Vec<bool>]) {
    let mut noccpi = Dimension::new();
    for (h, flags) in occupied.iter().enumerate() {
        let (occ, vir): (Vec<usize>, Vec<usize>) = (0..flags.len()).partition(|&i| flags[i]);
        noccpi.push(occ.len());
        let order: Vec<usize> = occ.into_iter().chain(vir).collect();
        orbitals.reorder(h, &order);
    }
    orbitals.occupy(&noccpi);
}

/// Keeps, in every irrep, the orbitals that overlap most with the occupied
/// space of `previous`.
pub fn maximum_overlap(orbitals: &mut SpinOrbitals, previous: &SpinOrbitals, overlap: &BlockedMatrix) {
    let mut selected = Vec::with_capacity(overlap.nirrep());
    for h in 0..overlap.nirrep() {
        let nocc = previous.noccpi()[h];
        let old = previous.coefficients().block(h).columns(0, nocc);
        let projection = old.transpose() * overlap.block(h) * orbitals.coefficients().block(h);

        let nmo = projection.ncols();
        let mut ranked: Vec<usize> = (0..nmo).collect();
        ranked.sort_by(|&a, &b| {
            let pa = projection.column(a).norm_squared();
            let pb = projection.column(b).norm_squared();
            pb.total_cmp(&pa)
        });

        let mut flags = vec![false; nmo];
        for &i in ranked.iter().take(nocc) {
            flags[i] = true;
        }
        selected.push(flags);
    }
    occupy_selected(orbitals, &selected);
}

/// Moves electrons out of the `from` orbitals into the `to` orbitals, both given
/// as 0-based positions in the energy ordering.
pub fn excite(orbitals: &mut SpinOrbitals, from: &[usize], to: &[usize]) -> Result<()> {
    let ranking = energy_ranking(orbitals.energies());
    let noccpi = orbitals.noccpi().clone();
    let mut flags: Vec<Vec<bool>> = orbitals
        .nmopi()
        .iter()
        .zip(&noccpi)
        .map(|(&nmo, &nocc)| (0..nmo).map(|i| i < nocc).collect())
        .collect();

    let locate = |index: usize| {
        ranking.get(index).copied().ok_or_else(|| {
            SolverError::configuration(format!("orbital {} does not exist", index + 1))
        })
    };

    for (&hole, &particle) in from.iter().zip(to) {
        let (h, i) = locate(hole)?;
        let (g, a) = locate(particle)?;
        if !flags[h][i] || flags[g][a] {
            return Err(SolverError::configuration(format!(
                "cannot excite from orbital {} to orbital {}",
                hole + 1,
                particle + 1
            )));
        }
        flags[h][i] = false;
        flags[g][a] = true;
    }
    occupy_selected(orbitals, &flags);
    Ok(())
}

/// Sets the occupation of the orbital at 0-based energy position `index`.
fn set_fractional(orbitals: &mut SpinOrbitals, index: usize, value: f64) -> Result<()> {
    let ranking = energy_ranking(orbitals.energies());
    let Some(&(h, i)) = ranking.get(index) else {
        return Err(SolverError::configuration(format!("orbital {} does not exist", index + 1)));
    };
    if i >= orbitals.noccpi()[h] {
        return Err(SolverError::configuration(format!(
            "fractionally occupied orbital {} is not occupied",
            index + 1
        )));
    }
    orbitals.set_occupation(h, i, value);
    Ok(())
}

/// Splits signed 1-based orbital indices into 0-based alpha and beta lists.
fn by_spin(indices: &[i64]) -> impl Iterator<Item = (usize, SpinChannel, usize)> + '_ {
    indices.iter().enumerate().map(|(k, &index)| {
        let spin = if index > 0 {
            SpinChannel::Alpha
        } else {
            SpinChannel::Beta
        };
        (k, spin, index.unsigned_abs() as usize - 1)
    })
}

/// Decides the occupation after every diagonalization.
#[derive(Clone, Debug)]
pub struct OccupationPolicy {
    reference: ReferenceKind,
    nalpha: usize,
    nbeta: usize,
    fixed: Option<(Dimension, Dimension)>,
    locked: bool,
    mom_start: usize,
    mom_occ: Vec<i64>,
    mom_vir: Vec<i64>,
    frac_start: usize,
    frac_occ: Vec<i64>,
    frac_val: Vec<f64>,
}

impl OccupationPolicy {
    pub fn new(options: &ScfOptions, nalpha: usize, nbeta: usize, nmopi: &[usize]) -> Result<Self> {
        if options.reference == ReferenceKind::Rhf && nalpha != nbeta {
            return Err(SolverError::configuration(format!(
                "RHF needs a closed shell, got {nalpha} alpha and {nbeta} beta electrons"
            )));
        }

        let fixed = match (&options.docc, &options.socc) {
            (None, None) => None,
            (docc, socc) => {
                let zeros = vec![0; nmopi.len()];
                let docc = docc.as_deref().unwrap_or(&zeros);
                let socc = socc.as_deref().unwrap_or(&zeros);
                if docc.len() != nmopi.len() || socc.len() != nmopi.len() {
                    return Err(SolverError::configuration(format!(
                        "DOCC and SOCC need one entry per irrep ({})",
                        nmopi.len()
                    )));
                }
                let alpha: Dimension = docc.iter().zip(socc).map(|(d, s)| d + s).collect();
                let beta: Dimension = docc.iter().copied().collect();
                if alpha.iter().sum::<usize>() != nalpha || beta.iter().sum::<usize>() != nbeta {
                    return Err(SolverError::configuration(
                        "DOCC and SOCC do not match the electron counts",
                    ));
                }
                if alpha.iter().zip(nmopi).any(|(a, n)| a > n) {
                    return Err(SolverError::configuration("DOCC + SOCC exceeds the orbitals of an irrep"));
                }
                if options.reference == ReferenceKind::Rhf && socc.iter().any(|&s| s > 0) {
                    return Err(SolverError::configuration("RHF cannot have singly occupied orbitals"));
                }
                Some((alpha, beta))
            }
        };

        Ok(Self {
            reference: options.reference,
            nalpha,
            nbeta,
            fixed,
            locked: false,
            mom_start: options.mom_start,
            mom_occ: options.mom_occ.clone(),
            mom_vir: options.mom_vir.clone(),
            frac_start: options.frac_start,
            frac_occ: options.frac_occ.clone(),
            frac_val: options.frac_val.clone(),
        })
    }

    /// Keep whatever occupation the orbitals come with.
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn nalpha(&self) -> usize {
        self.nalpha
    }

    pub fn nbeta(&self) -> usize {
        self.nbeta
    }

    /// An excited MOM or fractional occupation was requested but has not started.
    pub fn pending(&self, iteration: usize) -> bool {
        (!self.mom_occ.is_empty() && iteration < self.mom_start)
            || (!self.frac_occ.is_empty() && iteration < self.frac_start)
    }

    fn mom_active(&self, iteration: usize) -> bool {
        self.mom_start > 0 && iteration >= self.mom_start
    }

    fn frac_active(&self, iteration: usize) -> bool {
        self.frac_start > 0 && iteration >= self.frac_start
    }

    /// The occupation of a guess or otherwise fresh set of orbitals.
    pub fn initial(&self, orbitals: &mut OrbitalSet) {
        let (alpha, beta) = match &self.fixed {
            Some((alpha, beta)) => (alpha.clone(), beta.clone()),
            None => (
                aufbau(orbitals.alpha.energies(), self.nalpha),
                aufbau(orbitals.beta.energies(), self.nbeta),
            ),
        };
        orbitals.alpha.occupy(&alpha);
        orbitals.beta.occupy(&beta);
    }

    /// Occupies freshly diagonalized `orbitals` at SCF iteration `iteration`.
    ///
    /// `previous` holds the orbitals of the last iteration with their
    /// occupation. The returned flags tell which special treatment applied.
    pub fn apply(
        &self,
        iteration: usize,
        orbitals: &mut OrbitalSet,
        previous: &OrbitalSet,
        overlap: &BlockedMatrix,
    ) -> Result<StepFlags> {
        let mut flags = StepFlags::default();

        if self.locked {
            orbitals.alpha.occupy(previous.alpha.noccpi());
            orbitals.beta.occupy(previous.beta.noccpi());
        } else if self.mom_active(iteration) && iteration > self.mom_start {
            flags.mom = true;
            maximum_overlap(&mut orbitals.alpha, &previous.alpha, overlap);
            if self.reference == ReferenceKind::Uhf {
                maximum_overlap(&mut orbitals.beta, &previous.beta, overlap);
            } else {
                orbitals.beta.copy_from(&orbitals.alpha);
                orbitals.beta.occupy(&self.beta_counts(&orbitals.alpha, previous));
            }
        } else {
            self.initial(orbitals);
            if self.mom_active(iteration) {
                flags.mom = true;
                self.excite(orbitals)?;
            }
        }

        if self.frac_active(iteration) {
            flags.frac = true;
            self.fractional(orbitals)?;
        }
        Ok(flags)
    }

    /// Beta counts of a restricted-orbital reference follow the lowest alpha
    /// orbitals that beta occupied before.
    fn beta_counts(&self, alpha: &SpinOrbitals, previous: &OrbitalSet) -> Dimension {
        alpha
            .noccpi()
            .iter()
            .zip(previous.beta.noccpi())
            .map(|(&a, &b)| a.min(b))
            .collect()
    }

    fn excite(&self, orbitals: &mut OrbitalSet) -> Result<()> {
        for spin in SpinChannel::BOTH {
            let (from, to): (Vec<usize>, Vec<usize>) = by_spin(&self.mom_occ)
                .filter(|&(_, s, _)| s == spin)
                .map(|(k, _, hole)| {
                    let particle = self.mom_vir[k].unsigned_abs() as usize - 1;
                    (hole, particle)
                })
                .unzip();
            if from.is_empty() {
                continue;
            }
            log::info!("MOM excitation of {} {spin:?} electron(s)", from.len());
            excite(orbitals.spin_mut(spin), &from, &to)?;
        }
        if self.reference == ReferenceKind::Rhf {
            let alpha = orbitals.alpha.clone();
            orbitals.beta.copy_from(&alpha);
        }
        Ok(())
    }

    fn fractional(&self, orbitals: &mut OrbitalSet) -> Result<()> {
        for (k, spin, index) in by_spin(&self.frac_occ) {
            set_fractional(orbitals.spin_mut(spin), index, self.frac_val[k])?;
            if self.reference == ReferenceKind::Rhf {
                set_fractional(&mut orbitals.beta, index, self.frac_val[k])?;
            }
        }
        Ok(())
    }
}
