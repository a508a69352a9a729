use nalgebra::DMatrix;

use crate::checkpoint::Persistence;
use crate::config::GuessType;
use crate::error::Result;
use crate::linalg::{utils, BlockedMatrix};
use crate::system::IntegralSystem;

use super::occupation::OccupationPolicy;
use super::orbitals::OrbitalSet;
use super::orthogonalize::Orthogonalizer;

/// Starting point of an SCF.
#[derive(Clone, Debug)]
pub struct Guess {
    /// Occupied starting orbitals.
    pub orbitals: OrbitalSet,
    /// Alpha and beta densities when they do not follow from `orbitals`, as for SAD.
    pub densities: Option<(BlockedMatrix, BlockedMatrix)>,
    /// The guess type that was actually used after fallbacks.
    pub kind: GuessType,
}

impl Guess {
    pub fn densities(&self) -> (BlockedMatrix, BlockedMatrix) {
        self.densities
            .clone()
            .unwrap_or_else(|| self.orbitals.densities())
    }
}

fn from_fock(fock: &BlockedMatrix, x: &Orthogonalizer, policy: &OccupationPolicy) -> OrbitalSet {
    let alpha = x.diagonalize(fock);
    let mut orbitals = OrbitalSet {
        beta: alpha.clone(),
        alpha,
    };
    policy.initial(&mut orbitals);
    orbitals
}

/// Generalized Wolfsberg-Helmholz: `F_ij = 0.875 S_ij (H_ii + H_jj)`, `F_ii = H_ii`.
fn gwh_fock(system: &IntegralSystem) -> BlockedMatrix {
    let h = system.core_hamiltonian();
    let s = system.overlap();
    let blocks = h
        .blocks()
        .iter()
        .zip(s.blocks())
        .map(|(h, s)| {
            utils::symmetric_matrix(h.nrows(), |i, j| {
                if i == j {
                    h[(i, i)]
                } else {
                    0.875 * s[(i, j)] * (h[(i, i)] + h[(j, j)])
                }
            })
        })
        .collect();
    BlockedMatrix::from_blocks(blocks)
}

/// Superposition of atomic densities, one spin-averaged core guess per atom in
/// the atom's own functions, scaled to the electron counts.
fn sad_densities(system: &IntegralSystem, tolerance: f64) -> Option<(BlockedMatrix, BlockedMatrix)> {
    let atoms = system.atoms();
    if atoms.is_empty() || atoms.iter().any(|a| a.functions().is_empty()) {
        return None;
    }

    let nso = system.nso();
    let h = system.core_hamiltonian().to_dense();
    let s = system.overlap().to_dense();
    let mut total = DMatrix::zeros(nso, nso);

    for atom in atoms {
        let functions = atom.functions();
        let n = functions.len();
        let h_atom = DMatrix::from_fn(n, n, |i, j| h[(functions[i], functions[j])]);
        let s_atom = DMatrix::from_fn(n, n, |i, j| s[(functions[i], functions[j])]);

        let (u, sigma) = utils::sorted_eigs(s_atom);
        let kept: Vec<usize> = (0..n).filter(|&k| sigma[k] >= tolerance).collect();
        let x = DMatrix::from_fn(n, kept.len(), |i, k| u[(i, kept[k])] / sigma[kept[k]].sqrt());
        let (c_prime, _) = utils::sorted_eigs(x.transpose() * h_atom * &x);
        let c = x * c_prime;

        // half the nuclear charge per spin, the last orbital possibly fractional
        let mut remaining = 0.5 * atom.nuclear_charge();
        let mut density = DMatrix::zeros(n, n);
        for k in 0..c.ncols() {
            if remaining <= 0.0 {
                break;
            }
            let occupation = remaining.min(1.0);
            remaining -= occupation;
            let column = c.column(k).into_owned();
            density += occupation * &column * column.transpose();
        }
        for (i, j) in itertools::iproduct!(0..n, 0..n) {
            total[(functions[i], functions[j])] += density[(i, j)];
        }
    }

    let electrons = (&total * &s).trace();
    if electrons <= 0.0 {
        return None;
    }

    let nsopi = system.nsopi();
    let scaled = |n: usize| {
        let dense = &total * (n as f64 / electrons);
        BlockedMatrix::from_dense(&dense, nsopi, nsopi)
    };
    Some((scaled(system.nalpha()), scaled(system.nbeta())))
}

fn guess_energy(system: &IntegralSystem, density: &(BlockedMatrix, BlockedMatrix), fock: &BlockedMatrix) -> f64 {
    let h = system.core_hamiltonian();
    let one_plus_f = h.add(fock);
    system.nuclear_repulsion() + 0.5 * (density.0.dot(&one_plus_f) + density.1.dot(&one_plus_f))
}

/// Builds the starting orbitals, falling back READ -> SAD -> CORE when the
/// requested guess has nothing to work with.
pub fn compute_guess(
    requested: GuessType,
    system: &IntegralSystem,
    x: &Orthogonalizer,
    policy: &OccupationPolicy,
    store: &mut dyn Persistence,
    s_tolerance: f64,
) -> Result<Guess> {
    let core = || {
        let fock = system.core_hamiltonian();
        let orbitals = from_fock(fock, x, policy);
        let energy = guess_energy(system, &orbitals.densities(), fock);
        log::info!("CORE guess energy: {energy:.12}");
        Guess {
            orbitals,
            densities: None,
            kind: GuessType::Core,
        }
    };

    let sad = || {
        let Some(densities) = sad_densities(system, s_tolerance) else {
            log::warn!("no atom partition of the basis, SAD guess falls back to CORE");
            return core();
        };
        log::info!("SAD guess from {} atoms", system.atoms().len());
        Guess {
            orbitals: from_fock(system.core_hamiltonian(), x, policy),
            densities: Some(densities),
            kind: GuessType::Sad,
        }
    };

    let guess = match requested {
        GuessType::Core => core(),
        GuessType::Gwh => {
            let fock = gwh_fock(system);
            let orbitals = from_fock(&fock, x, policy);
            let energy = guess_energy(system, &orbitals.densities(), &fock);
            log::info!("GWH guess energy: {energy:.12}");
            Guess {
                orbitals,
                densities: None,
                kind: GuessType::Gwh,
            }
        }
        GuessType::Sad => sad(),
        GuessType::Read => match OrbitalSet::load(store, system.nsopi())? {
            Some(mut orbitals) if orbitals.alpha.nmopi() == x.nmopi() => {
                log::info!("orbitals read from the checkpoint");
                policy.initial(&mut orbitals);
                Guess {
                    orbitals,
                    densities: None,
                    kind: GuessType::Read,
                }
            }
            _ => {
                log::warn!("no orbitals to read, READ guess falls back to SAD");
                sad()
            }
        },
    };
    Ok(guess)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::checkpoint::MemoryStore;
    use crate::config::{Orthogonalization, ScfOptions};
    use crate::testing;

    fn setup(system: &IntegralSystem) -> (Orthogonalizer, OccupationPolicy) {
        let x = Orthogonalizer::new(system.overlap(), Orthogonalization::Symmetric, 1e-7).unwrap();
        let policy = OccupationPolicy::new(
            &ScfOptions::default(),
            system.nalpha(),
            system.nbeta(),
            &x.nmopi(),
        )
        .unwrap();
        (x, policy)
    }

    #[test]
    fn core_guess_occupies_lowest_orbitals() {
        let system = testing::model_system(&[4, 2], 2, 2).unwrap();
        let (x, policy) = setup(&system);
        let guess = compute_guess(GuessType::Core, &system, &x, &policy, &mut MemoryStore::new(), 1e-7).unwrap();

        assert_eq!(guess.kind, GuessType::Core);
        assert_eq!(guess.orbitals.alpha.nocc(), 2);
        let (da, _) = guess.densities();
        assert_relative_eq!(da.dot(system.overlap()), 2.0, epsilon = 1e-10);
    }

    #[test]
    fn sad_density_has_right_electron_count() {
        let system = testing::model_system(&[6], 3, 2).unwrap();
        let x = Orthogonalizer::new(system.overlap(), Orthogonalization::Symmetric, 1e-7).unwrap();
        let policy = OccupationPolicy::new(
            &ScfOptions {
                reference: crate::config::ReferenceKind::Uhf,
                ..Default::default()
            },
            3,
            2,
            &x.nmopi(),
        )
        .unwrap();
        let guess = compute_guess(GuessType::Sad, &system, &x, &policy, &mut MemoryStore::new(), 1e-7).unwrap();

        assert_eq!(guess.kind, GuessType::Sad);
        let (da, db) = guess.densities();
        assert_relative_eq!(da.dot(system.overlap()), 3.0, epsilon = 1e-10);
        assert_relative_eq!(db.dot(system.overlap()), 2.0, epsilon = 1e-10);
    }

    #[test]
    fn read_without_checkpoint_falls_back() {
        let system = testing::core_only(-1.5, 0.5).unwrap();
        let (x, policy) = setup(&system);
        let guess = compute_guess(GuessType::Read, &system, &x, &policy, &mut MemoryStore::new(), 1e-7).unwrap();
        // no atom partition either
        assert_eq!(guess.kind, GuessType::Core);
    }

    #[test]
    fn read_uses_stored_orbitals() {
        let system = testing::model_system(&[4, 2], 2, 2).unwrap();
        let (x, policy) = setup(&system);
        let mut store = MemoryStore::new();
        let gwh = compute_guess(GuessType::Gwh, &system, &x, &policy, &mut store, 1e-7).unwrap();
        gwh.orbitals.save(&mut store).unwrap();

        let read = compute_guess(GuessType::Read, &system, &x, &policy, &mut store, 1e-7).unwrap();
        assert_eq!(read.kind, GuessType::Read);
        assert_eq!(read.orbitals, gwh.orbitals);
    }
}
