use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A nucleus of the system and the basis functions centred on it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub(crate) charge: f64,
    pub(crate) position: Vector3<f64>,
    /// Indices of the SO functions that belong to this atom, used by the SAD guess.
    pub(crate) functions: Vec<usize>,
}

impl Atom {
    pub fn new(charge: f64, position: Vector3<f64>, functions: Vec<usize>) -> Self {
        Self {
            charge,
            position,
            functions,
        }
    }

    /// Returns the charge of this nucleus
    pub fn nuclear_charge(&self) -> f64 {
        self.charge
    }

    pub fn position(&self) -> &Vector3<f64> {
        &self.position
    }

    pub fn functions(&self) -> &[usize] {
        &self.functions
    }
}

pub(crate) fn nuclear_repulsion(atoms: &[Atom]) -> f64 {
    let n_atoms = atoms.len();

    let mut potential = 0.0;
    for atom_a in 0..n_atoms {
        for atom_b in atom_a + 1..n_atoms {
            potential += atoms[atom_a].nuclear_charge() * atoms[atom_b].nuclear_charge()
                / (atoms[atom_b].position - atoms[atom_a].position).norm()
        }
    }
    potential
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn hydrogen_molecule_repulsion() {
        let atoms = [
            Atom::new(1.0, Vector3::new(0.0, 0.0, 0.0), vec![0]),
            Atom::new(1.0, Vector3::new(0.0, 0.0, 1.4), vec![1]),
        ];
        assert_relative_eq!(nuclear_repulsion(&atoms), 1.0 / 1.4);
    }
}
