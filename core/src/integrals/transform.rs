//! Four-index transformation of the electron repulsion integrals.

use nalgebra::DMatrix;

use crate::linalg::Tensor4;

use super::ElectronTensor;

/// Dense `(pq|rs)` over all SO functions.
pub fn dense_so(eri: &ElectronTensor) -> Tensor4 {
    let n = eri.size();
    Tensor4::from_fn([n; 4], |p, q, r, s| eri[(p, q, r, s)])
}

/// Transforms the first index and rotates it to the back:
/// `out[j,k,l,p] = Σ_i a[i,j,k,l] c[i,p]`.
fn rotate_transform(a: &Tensor4, c: &DMatrix<f64>) -> Tensor4 {
    let [n0, n1, n2, n3] = a.dims();
    let rest = n1 * n2 * n3;
    let np = c.ncols();

    let matrix = DMatrix::from_row_slice(n0, rest, a.as_slice());
    let product = matrix.tr_mul(c);

    let mut out = Tensor4::zeros([n1, n2, n3, np]);
    out.as_mut_slice()
        .copy_from_slice(product.transpose().as_slice());
    out
}

/// `(pq|rs)` in the orbital spaces spanned by the four coefficient matrices.
pub fn transform_chemist(so: &Tensor4, c: [&DMatrix<f64>; 4]) -> Tensor4 {
    c.iter().fold(so.clone(), |acc, c| rotate_transform(&acc, c))
}

/// Occupied and virtual coefficients of one spin, dense over all irreps.
#[derive(Clone, Debug)]
pub struct OrbitalSpaces {
    pub occupied: DMatrix<f64>,
    pub virtuals: DMatrix<f64>,
}

impl OrbitalSpaces {
    pub fn nocc(&self) -> usize {
        self.occupied.ncols()
    }

    pub fn nvir(&self) -> usize {
        self.virtuals.ncols()
    }
}

/// A quantity resolved into the three spin cases of a pair.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SpinCases<T> {
    pub aa: T,
    pub ab: T,
    pub bb: T,
}

impl<T> SpinCases<T> {
    pub fn map<U>(&self, mut func: impl FnMut(&T) -> U) -> SpinCases<U> {
        SpinCases {
            aa: func(&self.aa),
            ab: func(&self.ab),
            bb: func(&self.bb),
        }
    }
}

/// Antisymmetrized MO integrals in physicists' notation. The same-spin cases hold
/// `<pq||rs>`, the mixed case `<pQ|rS>`.
#[derive(Clone, Debug)]
pub struct MoIntegrals {
    pub oovv: SpinCases<Tensor4>,
    pub oooo: SpinCases<Tensor4>,
    pub vvvv: SpinCases<Tensor4>,
}

/// `<pq|rs> - <pq|sr>` from `x = (pr|qs)` laid out as `[p,r,q,s]`,
/// or `<pq|rs>` alone when `antisymmetrize` is false.
fn physicist(x: &Tensor4, antisymmetrize: bool) -> Tensor4 {
    let [np, nr, nq, ns] = x.dims();
    Tensor4::from_fn([np, nq, nr, ns], |p, q, r, s| {
        let direct = x[(p, r, q, s)];
        if antisymmetrize {
            direct - x[(p, s, q, r)]
        } else {
            direct
        }
    })
}

impl MoIntegrals {
    pub fn new(so: &Tensor4, alpha: &OrbitalSpaces, beta: &OrbitalSpaces) -> Self {
        let (oa, va) = (&alpha.occupied, &alpha.virtuals);
        let (ob, vb) = (&beta.occupied, &beta.virtuals);

        let block = |c: [&DMatrix<f64>; 4], antisymmetrize: bool| {
            physicist(&transform_chemist(so, c), antisymmetrize)
        };

        Self {
            oovv: SpinCases {
                aa: block([oa, va, oa, va], true),
                ab: block([oa, va, ob, vb], false),
                bb: block([ob, vb, ob, vb], true),
            },
            oooo: SpinCases {
                aa: block([oa, oa, oa, oa], true),
                ab: block([oa, oa, ob, ob], false),
                bb: block([ob, ob, ob, ob], true),
            },
            vvvv: SpinCases {
                aa: block([va, va, va, va], true),
                ab: block([va, va, vb, vb], false),
                bb: block([vb, vb, vb, vb], true),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn eri() -> ElectronTensor {
        ElectronTensor::from_fn(3, |i, j, k, l| {
            0.2 / (1.0 + (i + j) as f64) / (1.0 + (k + l) as f64) + 0.05 * ((i * j + k * l) % 3) as f64
        })
    }

    #[test]
    fn identity_transform_keeps_integrals() {
        let eri = eri();
        let so = dense_so(&eri);
        let identity = DMatrix::identity(3, 3);
        let mo = transform_chemist(&so, [&identity; 4]);
        assert_eq!(mo, so);
    }

    #[test]
    fn transform_matches_explicit_sum() {
        let eri = eri();
        let so = dense_so(&eri);
        let c = DMatrix::from_row_slice(3, 2, &[0.8, 0.1, 0.3, -0.6, 0.1, 0.7]);
        let d = DMatrix::from_row_slice(3, 1, &[0.5, 0.5, -0.2]);
        let mo = transform_chemist(&so, [&c, &d, &c, &d]);

        let mut expected = 0.0;
        for (m, n, l, s) in itertools::iproduct!(0..3, 0..3, 0..3, 0..3) {
            expected += c[(m, 1)] * d[(n, 0)] * c[(l, 0)] * d[(s, 0)] * so[(m, n, l, s)];
        }
        assert_relative_eq!(mo[(1, 0, 0, 0)], expected, epsilon = 1e-12);
    }

    #[test]
    fn same_spin_integrals_are_antisymmetric() {
        let eri = eri();
        let so = dense_so(&eri);
        let spaces = OrbitalSpaces {
            occupied: DMatrix::from_fn(3, 2, |i, j| if i == j { 1.0 } else { 0.0 }),
            virtuals: DMatrix::from_fn(3, 1, |i, _| if i == 2 { 1.0 } else { 0.0 }),
        };
        let mo = MoIntegrals::new(&so, &spaces, &spaces);

        assert_relative_eq!(mo.oooo.aa[(0, 1, 0, 1)], -mo.oooo.aa[(1, 0, 0, 1)]);
        assert_eq!(mo.oovv.aa[(0, 0, 0, 0)], 0.0);
        assert_relative_eq!(mo.oovv.ab[(0, 1, 0, 0)], so[(0, 2, 1, 2)]);
    }
}
