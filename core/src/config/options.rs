use serde::{Deserialize, Serialize};

use crate::convergence::DIVERGENCE_THRESHOLD;
use crate::diis::{DiisConfig, RemovalPolicy};
use crate::error::{Result, SolverError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceKind {
    #[default]
    Rhf,
    Uhf,
    Rohf,
}

/// How the two-electron contribution to the Fock matrix is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JkAlgorithm {
    /// Precomputed supermatrix.
    #[default]
    Pk,
    /// Contraction of the electron tensor on every build.
    Direct,
    /// Density fitting.
    Df,
    /// Disk-based integrals.
    OutOfCore,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuessType {
    #[default]
    Core,
    Gwh,
    Sad,
    Read,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Orthogonalization {
    #[default]
    Symmetric,
    Canonical,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DcftAlgorithm {
    #[default]
    #[serde(rename = "TWOSTEP")]
    TwoStep,
    Simultaneous,
    Qc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DcftFunctional {
    #[default]
    #[serde(rename = "DC-06")]
    Dc06,
    #[serde(rename = "DC-12")]
    Dc12,
    #[serde(rename = "CEPA0")]
    Cepa0,
}

impl std::fmt::Display for DcftFunctional {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DcftFunctional::Dc06 => "DC-06",
            DcftFunctional::Dc12 => "DC-12",
            DcftFunctional::Cepa0 => "CEPA0",
        })
    }
}

/// Where the two-electron part of the tau contribution is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AoBasis {
    /// MO-basis contraction with the transformed integrals.
    #[default]
    None,
    /// Tau is back-transformed, persisted and contracted through the Fock builder.
    Disk,
}

/// Options of the single-level SCF solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScfOptions {
    pub reference: ReferenceKind,
    pub scf_type: JkAlgorithm,
    pub guess: GuessType,
    pub maxiter: usize,
    /// Whether reaching `maxiter` is an error.
    pub fail_on_maxiter: bool,
    pub e_convergence: f64,
    /// Threshold on the RMS orbital gradient.
    pub d_convergence: f64,
    pub diis: bool,
    pub diis_min_vecs: usize,
    pub diis_max_vecs: usize,
    /// First iteration that stores DIIS vectors.
    pub diis_start: usize,
    /// Orbital gradient below which DIIS vectors are stored.
    pub diis_start_threshold: f64,
    pub diis_removal: RemovalPolicy,
    /// Percentage of the previous density mixed into the new one.
    pub damping_percentage: Option<f64>,
    /// Damping stops once the density change drops below this.
    pub damping_convergence: f64,
    pub s_orthogonalization: Orthogonalization,
    /// Overlap eigenvalues below this switch to canonical orthogonalization.
    pub s_tolerance: f64,
    pub docc: Option<Vec<usize>>,
    pub socc: Option<Vec<usize>>,
    /// First iteration with maximum-overlap selection, zero disables it.
    pub mom_start: usize,
    /// Absolute orbitals to occupy in an excited MOM state, 1-based in energy
    /// order. Negative indices select beta orbitals.
    pub mom_occ: Vec<i64>,
    /// Orbitals vacated by `mom_occ`, same convention.
    pub mom_vir: Vec<i64>,
    /// First iteration with fractional occupation, zero disables it.
    pub frac_start: usize,
    /// Orbitals with fractional occupation, same convention as `mom_occ`.
    pub frac_occ: Vec<i64>,
    /// Occupation of each entry of `frac_occ`.
    pub frac_val: Vec<f64>,
    /// Renormalize the fractionally occupied orbitals to the integer electron count at the end.
    pub frac_renormalize: bool,
    pub divergence_threshold: f64,
}

impl Default for ScfOptions {
    fn default() -> Self {
        Self {
            reference: ReferenceKind::Rhf,
            scf_type: JkAlgorithm::Pk,
            guess: GuessType::Core,
            maxiter: 100,
            fail_on_maxiter: true,
            e_convergence: 1e-6,
            d_convergence: 1e-6,
            diis: true,
            diis_min_vecs: 2,
            diis_max_vecs: 10,
            diis_start: 1,
            diis_start_threshold: 1.0,
            diis_removal: RemovalPolicy::OldestAdded,
            damping_percentage: None,
            damping_convergence: 1e-18,
            s_orthogonalization: Orthogonalization::Symmetric,
            s_tolerance: 1e-7,
            docc: None,
            socc: None,
            mom_start: 0,
            mom_occ: Vec::new(),
            mom_vir: Vec::new(),
            frac_start: 0,
            frac_occ: Vec::new(),
            frac_val: Vec::new(),
            frac_renormalize: true,
            divergence_threshold: DIVERGENCE_THRESHOLD,
        }
    }
}

impl ScfOptions {
    pub fn validate(&self) -> Result<()> {
        if self.maxiter == 0 {
            return Err(SolverError::configuration("MAXITER must be positive"));
        }
        if let Some(percentage) = self.damping_percentage {
            if !(0.0..=100.0).contains(&percentage) {
                return Err(SolverError::configuration(format!(
                    "DAMPING_PERCENTAGE must be between 0 and 100, got {percentage}"
                )));
            }
        }
        if self.diis && self.diis_max_vecs < self.diis_min_vecs {
            return Err(SolverError::configuration(format!(
                "DIIS_MAX_VECS ({}) is smaller than DIIS_MIN_VECS ({})",
                self.diis_max_vecs, self.diis_min_vecs
            )));
        }
        if self.frac_occ.len() != self.frac_val.len() {
            return Err(SolverError::configuration(
                "FRAC_OCC and FRAC_VAL must have the same length",
            ));
        }
        if self.frac_val.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(SolverError::configuration("FRAC_VAL entries must lie in [0, 1]"));
        }
        if self.frac_start > 0 && self.frac_occ.is_empty() {
            return Err(SolverError::configuration("FRAC_START is set but FRAC_OCC is empty"));
        }
        if !self.frac_occ.is_empty() && self.frac_start == 0 {
            return Err(SolverError::configuration("FRAC_OCC requires FRAC_START"));
        }
        if self.mom_occ.len() != self.mom_vir.len() {
            return Err(SolverError::configuration(
                "MOM_OCC and MOM_VIR must have the same length",
            ));
        }
        if !self.mom_occ.is_empty() && self.mom_start == 0 {
            return Err(SolverError::configuration("MOM_OCC requires MOM_START"));
        }
        if self
            .mom_occ
            .iter()
            .chain(&self.mom_vir)
            .chain(&self.frac_occ)
            .any(|&i| i == 0)
        {
            return Err(SolverError::configuration("orbital indices are 1-based, 0 is not valid"));
        }
        if self.reference == ReferenceKind::Rhf
            && self
                .mom_occ
                .iter()
                .chain(&self.mom_vir)
                .chain(&self.frac_occ)
                .any(|&i| i < 0)
        {
            return Err(SolverError::configuration(
                "beta orbital indices need an unrestricted reference",
            ));
        }
        if self.divergence_threshold <= 0.0 {
            return Err(SolverError::configuration("the divergence threshold must be positive"));
        }
        Ok(())
    }

    /// DIIS is only useful with at least two vectors to combine.
    pub fn diis_enabled(&self) -> bool {
        self.diis && self.diis_max_vecs >= 2 && self.diis_min_vecs >= 1
    }

    pub fn diis_config(&self) -> DiisConfig {
        DiisConfig {
            max_vectors: self.diis_max_vecs,
            min_vectors: self.diis_min_vecs.max(1),
            removal: self.diis_removal,
        }
    }
}

/// Options of the coupled orbital and cumulant solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcftOptions {
    pub algorithm: DcftAlgorithm,
    pub dcft_functional: DcftFunctional,
    pub ao_basis: AoBasis,
    /// Macro iterations.
    pub maxiter: usize,
    /// Cumulant iterations per macro iteration of the two-step algorithm.
    pub lambda_maxiter: usize,
    /// Orbital iterations per macro iteration of the two-step algorithm.
    pub scf_maxiter: usize,
    pub r_convergence: f64,
    /// Falls back to `r_convergence`.
    pub lambda_convergence: Option<f64>,
    /// Falls back to `r_convergence`.
    pub scf_convergence: Option<f64>,
    pub diis: bool,
    pub diis_min_vecs: usize,
    pub diis_max_vecs: usize,
    /// Residual below which DIIS vectors are stored.
    pub diis_start_thresh: f64,
    /// Run the cumulant loop on the first macro iteration with the guess orbitals.
    pub relax_guess_orbitals: bool,
    /// Rebuild tau from the current cumulant inside the cumulant loop.
    pub relax_tau: bool,
    /// Optimize the orbitals at all.
    pub mo_relax: bool,
    /// Keep the reference occupation per irrep instead of aufbau.
    pub lock_occupation: bool,
    pub qc_cg_maxiter: usize,
    pub qc_cg_convergence: f64,
    /// Step of the forward finite-difference Jacobian.
    pub qc_fd_step: f64,
    pub stability_check: bool,
    pub stability_nroots: usize,
    pub fail_on_maxiter: bool,
    pub energy_convergence: f64,
    /// Residual magnitude that aborts the DCFT iterations.
    pub divergence_threshold: f64,
    /// The SCF reference that supplies the guess orbitals.
    pub reference: ScfOptions,
}

impl Default for DcftOptions {
    fn default() -> Self {
        Self {
            algorithm: DcftAlgorithm::TwoStep,
            dcft_functional: DcftFunctional::Dc06,
            ao_basis: AoBasis::None,
            maxiter: 40,
            lambda_maxiter: 50,
            scf_maxiter: 50,
            r_convergence: 1e-10,
            lambda_convergence: None,
            scf_convergence: None,
            diis: true,
            diis_min_vecs: 3,
            diis_max_vecs: 6,
            diis_start_thresh: 1e-3,
            relax_guess_orbitals: false,
            relax_tau: true,
            mo_relax: true,
            lock_occupation: true,
            qc_cg_maxiter: 50,
            qc_cg_convergence: 1e-8,
            qc_fd_step: 1e-6,
            stability_check: false,
            stability_nroots: 3,
            fail_on_maxiter: true,
            energy_convergence: 1e-10,
            divergence_threshold: DIVERGENCE_THRESHOLD,
            reference: ScfOptions {
                reference: ReferenceKind::Uhf,
                ..ScfOptions::default()
            },
        }
    }
}

impl DcftOptions {
    pub fn lambda_threshold(&self) -> f64 {
        self.lambda_convergence.unwrap_or(self.r_convergence)
    }

    pub fn orbital_threshold(&self) -> f64 {
        self.scf_convergence.unwrap_or(self.r_convergence)
    }

    pub fn diis_config(&self) -> DiisConfig {
        DiisConfig {
            max_vectors: self.diis_max_vecs,
            min_vectors: self.diis_min_vecs,
            removal: RemovalPolicy::LargestError,
        }
    }

    pub fn diis_enabled(&self) -> bool {
        self.diis && self.diis_max_vecs > 0
    }

    pub fn validate(&self) -> Result<()> {
        self.reference.validate()?;

        if self.dcft_functional == DcftFunctional::Cepa0 {
            let unsupported = match (self.algorithm, self.ao_basis) {
                (DcftAlgorithm::Simultaneous, _) => Some("ALGORITHM = SIMULTANEOUS"),
                (DcftAlgorithm::Qc, _) => Some("ALGORITHM = QC"),
                (_, AoBasis::Disk) => Some("AO_BASIS = DISK"),
                _ => None,
            };
            if let Some(combination) = unsupported {
                return Err(SolverError::not_implemented("CEPA0", combination));
            }
        }
        if self.maxiter == 0 || self.lambda_maxiter == 0 || self.scf_maxiter == 0 {
            return Err(SolverError::configuration("DCFT iteration limits must be positive"));
        }
        if self.divergence_threshold <= 0.0 {
            return Err(SolverError::configuration("the divergence threshold must be positive"));
        }
        if self.qc_fd_step <= 0.0 {
            return Err(SolverError::configuration("QC_FD_STEP must be positive"));
        }
        if self.reference.damping_percentage.is_some() {
            log::warn!("damping is ignored by the DCFT orbital update");
        }
        Ok(())
    }
}
