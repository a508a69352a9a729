use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::atom::{self, Atom};
use crate::error::SolverError;
use crate::integrals::ElectronTensor;
use crate::linalg::BlockedMatrix;
use crate::system::IntegralSystem;

/// The integral input of a calculation, as read from a JSON file.
///
/// The one-electron matrices are given per irrep, row by row. ERIs are the
/// unique `(pq|rs)` in the SO numbering that runs irrep after irrep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigSystem {
    #[serde(default)]
    pub name: String,
    /// Irrep labels, `A`, `B`, ... when absent.
    #[serde(default)]
    pub irreps: Vec<String>,
    pub nsopi: Vec<usize>,
    pub nalpha: usize,
    pub nbeta: usize,
    /// Computed from `atoms` when absent.
    #[serde(default)]
    pub nuclear_repulsion: Option<f64>,
    #[serde(default)]
    pub atoms: Vec<ConfigAtom>,
    pub overlap: Vec<Vec<Vec<f64>>>,
    pub core_hamiltonian: Vec<Vec<Vec<f64>>>,
    pub eri: Vec<([usize; 4], f64)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigAtom {
    pub charge: f64,
    pub position: Vec<f64>,
    #[serde(default)]
    pub functions: Vec<usize>,
}

fn blocked(name: &str, rows: Vec<Vec<Vec<f64>>>, nsopi: &[usize]) -> Result<BlockedMatrix, SolverError> {
    if rows.len() != nsopi.len() {
        return Err(SolverError::configuration(format!(
            "{name} has {} blocks for {} irreps",
            rows.len(),
            nsopi.len()
        )));
    }

    let mut blocks = Vec::with_capacity(rows.len());
    for (h, (block, &n)) in rows.into_iter().zip(nsopi).enumerate() {
        if block.len() != n || block.iter().any(|row| row.len() != n) {
            return Err(SolverError::configuration(format!(
                "{name} block {h} is not {n}x{n}"
            )));
        }
        let matrix = DMatrix::from_row_iterator(n, n, block.into_iter().flatten());
        if (&matrix - matrix.transpose()).amax() > 1e-10 {
            return Err(SolverError::configuration(format!("{name} block {h} is not symmetric")));
        }
        blocks.push(matrix);
    }
    Ok(BlockedMatrix::from_blocks(blocks))
}

impl TryFrom<ConfigSystem> for IntegralSystem {
    type Error = SolverError;

    fn try_from(value: ConfigSystem) -> Result<Self, Self::Error> {
        let ConfigSystem {
            name,
            irreps,
            nsopi,
            nalpha,
            nbeta,
            nuclear_repulsion,
            atoms: config_atoms,
            overlap,
            core_hamiltonian,
            eri,
        } = value;

        let nso: usize = nsopi.iter().sum();
        let irrep_labels = if irreps.is_empty() {
            (0..nsopi.len())
                .map(|h| char::from(b'A' + (h % 26) as u8).to_string())
                .collect()
        } else if irreps.len() == nsopi.len() {
            irreps
        } else {
            return Err(SolverError::configuration(format!(
                "{} irrep labels for {} irreps",
                irreps.len(),
                nsopi.len()
            )));
        };

        let mut atoms = Vec::with_capacity(config_atoms.len());
        for atom in config_atoms {
            let &[x, y, z] = atom.position.as_slice() else {
                return Err(SolverError::configuration("atom positions need x, y, z coordinates"));
            };
            if atom.functions.iter().any(|&f| f >= nso) {
                return Err(SolverError::configuration(format!(
                    "atom basis function index outside the {nso} SO functions"
                )));
            }
            atoms.push(Atom::new(atom.charge, Vector3::new(x, y, z), atom.functions));
        }

        let nuclear_repulsion = nuclear_repulsion.unwrap_or_else(|| atom::nuclear_repulsion(&atoms));
        log::debug!("nuclear repulsion energy: {nuclear_repulsion}");

        if nalpha < nbeta {
            return Err(SolverError::configuration("nalpha must not be smaller than nbeta"));
        }
        if nalpha > nso {
            return Err(SolverError::configuration(format!(
                "{nalpha} alpha electrons do not fit in {nso} functions"
            )));
        }

        Ok(Self {
            name,
            irrep_labels,
            nsopi: nsopi.iter().copied().collect(),
            nalpha,
            nbeta,
            nuclear_repulsion,
            atoms,
            overlap: blocked("overlap", overlap, &nsopi)?,
            core_hamiltonian: blocked("core hamiltonian", core_hamiltonian, &nsopi)?,
            eri: ElectronTensor::from_unique(nso, eri)?,
        })
    }
}
