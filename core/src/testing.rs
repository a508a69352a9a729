//! Small deterministic integral systems for tests, benchmarks and trying out the CLI.

use std::{error::Error, fs::File, path::Path};

use crate::config::{ConfigAtom, ConfigSystem};
use crate::error::Result;
use crate::system::IntegralSystem;

/// Rank of the auxiliary expansion beyond the number of functions.
const EXTRA_AUXILIARY: usize = 2;

fn irrep_of(nsopi: &[usize]) -> Vec<usize> {
    nsopi
        .iter()
        .enumerate()
        .flat_map(|(h, &n)| std::iter::repeat(h).take(n))
        .collect()
}

/// Factor `B_P[pq]` of the model integrals `(pq|rs) = Σ_P B_P[pq] B_P[rs]`.
fn factor(aux: usize, p: usize, q: usize) -> f64 {
    let (p, q) = (p.min(q), p.max(q));
    let base = 0.15 * (1.3 * aux as f64 + 0.7 * (p + q) as f64 + 0.37 * (p * q) as f64).sin();
    let diagonal = if p == q && aux == p { 0.3 } else { 0.0 };
    (base + diagonal) / (1.0 + (q - p) as f64)
}

/// A model molecule with `nsopi` functions.
///
/// The two-electron integrals are a positive semidefinite factorization that
/// only couples functions of the same irrep, so every Fock matrix stays block
/// diagonal. Core levels sit far enough apart that the aufbau occupation of
/// every small system is stable under the mean-field repulsion. The basis is
/// split over two atoms that share the electrons.
pub fn model_config(nsopi: &[usize], nalpha: usize, nbeta: usize) -> ConfigSystem {
    let irreps = irrep_of(nsopi);
    let nso = irreps.len();
    let naux = nso + EXTRA_AUXILIARY;
    let same = |p: usize, q: usize| irreps[p] == irreps[q];

    let b: Vec<Vec<Vec<f64>>> = (0..naux)
        .map(|aux| {
            (0..nso)
                .map(|p| {
                    (0..nso)
                        .map(|q| if same(p, q) { factor(aux, p, q) } else { 0.0 })
                        .collect()
                })
                .collect()
        })
        .collect();

    let mut eri = Vec::new();
    for i in 0..nso {
        for j in 0..=i {
            for k in 0..=i {
                let l_max = if k == i { j } else { k };
                for l in 0..=l_max {
                    let value: f64 = b.iter().map(|bp| bp[i][j] * bp[k][l]).sum();
                    if value != 0.0 {
                        eri.push(([i, j, k, l], value));
                    }
                }
            }
        }
    }

    let starts = crate::linalg::offsets(nsopi);
    let block = |func: &dyn Fn(usize, usize) -> f64| -> Vec<Vec<Vec<f64>>> {
        nsopi
            .iter()
            .zip(&starts)
            .map(|(&n, &start)| {
                (0..n)
                    .map(|i| (0..n).map(|j| func(start + i, start + j)).collect())
                    .collect()
            })
            .collect()
    };
    let core_hamiltonian = block(&|p, q| {
        if p == q {
            -2.0 + 0.9 * p as f64
        } else {
            -0.12 / (1.0 + p.abs_diff(q) as f64)
        }
    });
    let overlap = block(&|p, q| {
        if p == q {
            1.0
        } else {
            0.06 / (1.0 + p.abs_diff(q) as f64)
        }
    });

    let electrons = (nalpha + nbeta) as f64;
    let half = nso / 2;
    let atoms = vec![
        ConfigAtom {
            charge: (electrons / 2.0).ceil(),
            position: vec![0.0, 0.0, 0.0],
            functions: (0..half.max(1).min(nso)).collect(),
        },
        ConfigAtom {
            charge: (electrons / 2.0).floor(),
            position: vec![0.0, 0.0, 1.6],
            functions: (half.max(1).min(nso)..nso).collect(),
        },
    ]
    .into_iter()
    .filter(|atom| !atom.functions.is_empty())
    .collect();

    ConfigSystem {
        name: format!("model {nso}"),
        irreps: Vec::new(),
        nsopi: nsopi.to_vec(),
        nalpha,
        nbeta,
        nuclear_repulsion: None,
        atoms,
        overlap,
        core_hamiltonian,
        eri,
    }
}

pub fn model_system(nsopi: &[usize], nalpha: usize, nbeta: usize) -> Result<IntegralSystem> {
    IntegralSystem::try_from(model_config(nsopi, nalpha, nbeta))
}

/// Two orthonormal functions without electron repulsion and one electron pair.
pub fn core_only(e0: f64, e1: f64) -> Result<IntegralSystem> {
    let config = ConfigSystem {
        name: "core only".into(),
        irreps: Vec::new(),
        nsopi: vec![2],
        nalpha: 1,
        nbeta: 1,
        nuclear_repulsion: Some(0.0),
        atoms: Vec::new(),
        overlap: vec![vec![vec![1.0, 0.0], vec![0.0, 1.0]]],
        core_hamiltonian: vec![vec![vec![e0, 0.0], vec![0.0, e1]]],
        eri: Vec::new(),
    };
    IntegralSystem::try_from(config)
}

pub fn save(config: &ConfigSystem, path: impl AsRef<Path>) -> std::result::Result<(), Box<dyn Error>> {
    Ok(serde_json::to_writer(
        File::options()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?,
        config,
    )?)
}
