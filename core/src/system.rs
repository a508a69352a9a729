use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::atom::Atom;
use crate::config::ConfigSystem;
use crate::error::Result;
use crate::integrals::ElectronTensor;
use crate::linalg::{offsets, BlockedMatrix, Dimension};

/// Everything the solvers need to know about a molecule: the SO-basis
/// one-electron matrices, the electron repulsion integrals and the electron counts.
#[derive(Clone, Debug)]
pub struct IntegralSystem {
    pub(crate) name: String,
    pub(crate) irrep_labels: Vec<String>,
    pub(crate) nsopi: Dimension,
    pub(crate) nalpha: usize,
    pub(crate) nbeta: usize,
    pub(crate) nuclear_repulsion: f64,
    pub(crate) atoms: Vec<Atom>,
    pub(crate) overlap: BlockedMatrix,
    pub(crate) core_hamiltonian: BlockedMatrix,
    pub(crate) eri: ElectronTensor,
}

impl IntegralSystem {
    /// Reads a [`ConfigSystem`] JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: ConfigSystem = serde_json::from_reader(reader)?;
        config.try_into()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn irrep_labels(&self) -> &[String] {
        &self.irrep_labels
    }

    pub fn nirrep(&self) -> usize {
        self.nsopi.len()
    }

    pub fn nsopi(&self) -> &Dimension {
        &self.nsopi
    }

    pub fn nso(&self) -> usize {
        self.nsopi.iter().sum()
    }

    pub fn nalpha(&self) -> usize {
        self.nalpha
    }

    pub fn nbeta(&self) -> usize {
        self.nbeta
    }

    pub fn nuclear_repulsion(&self) -> f64 {
        self.nuclear_repulsion
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn overlap(&self) -> &BlockedMatrix {
        &self.overlap
    }

    pub fn core_hamiltonian(&self) -> &BlockedMatrix {
        &self.core_hamiltonian
    }

    pub fn eri(&self) -> &ElectronTensor {
        &self.eri
    }

    /// `(irrep, index within irrep)` of an absolute SO index.
    pub(crate) fn locate(&self, so: usize) -> Option<(usize, usize)> {
        let starts = offsets(&self.nsopi);
        (0..self.nirrep())
            .find(|&h| so >= starts[h] && so < starts[h] + self.nsopi[h])
            .map(|h| (h, so - starts[h]))
    }
}
