//! The DIIS-facing view of one sector of a fixed-point problem.

use crate::diis::{DiisSubspace, SlotMut, SlotRef, SlotShape};
use crate::error::Result;
use crate::report::DiisStatus;

/// A sector whose iterate can be stored in and extrapolated by a [`DiisSubspace`].
///
/// The concrete update methods live on the implementors, this trait only
/// exposes what acceleration needs.
pub trait FixedPointStep {
    fn error_slots(&self) -> Vec<SlotRef<'_>>;

    fn solution_slots(&self) -> Vec<SlotRef<'_>>;

    fn solution_slots_mut(&mut self) -> Vec<SlotMut<'_>>;

    /// RMS of the current error.
    fn residual_norm(&self) -> f64;

    fn error_layout(&self) -> Vec<SlotShape> {
        self.error_slots().iter().map(SlotRef::shape).collect()
    }

    fn solution_layout(&self) -> Vec<SlotShape> {
        self.solution_slots().iter().map(SlotRef::shape).collect()
    }
}

/// Two steps accelerated as one composite vector.
pub struct Joint<'a, A: ?Sized, B: ?Sized>(pub &'a mut A, pub &'a mut B);

impl<A: FixedPointStep + ?Sized, B: FixedPointStep + ?Sized> FixedPointStep for Joint<'_, A, B> {
    fn error_slots(&self) -> Vec<SlotRef<'_>> {
        let mut slots = self.0.error_slots();
        slots.extend(self.1.error_slots());
        slots
    }

    fn solution_slots(&self) -> Vec<SlotRef<'_>> {
        let mut slots = self.0.solution_slots();
        slots.extend(self.1.solution_slots());
        slots
    }

    fn solution_slots_mut(&mut self) -> Vec<SlotMut<'_>> {
        let Joint(a, b) = self;
        let mut slots = a.solution_slots_mut();
        slots.extend(b.solution_slots_mut());
        slots
    }

    fn residual_norm(&self) -> f64 {
        self.0.residual_norm().max(self.1.residual_norm())
    }
}

/// Stores the current iterate when `store` is set, then overwrites the solution
/// with the extrapolated one once the subspace holds at least `extrapolate_from`
/// entries.
///
/// The subspace layout is declared from `step` on first use.
pub fn accelerate<S: FixedPointStep + ?Sized>(
    step: &mut S,
    diis: &mut DiisSubspace,
    store: bool,
    extrapolate_from: usize,
) -> Result<DiisStatus> {
    if !diis.has_layout() {
        diis.set_vector_slots(step.error_layout(), step.solution_layout());
    }

    let mut status = DiisStatus::default();
    if store {
        status.stored = diis.add_entry(&step.error_slots(), &step.solution_slots())?;
    }
    if diis.subspace_size() > 0 && diis.subspace_size() >= extrapolate_from {
        let info = diis.extrapolate(&mut step.solution_slots_mut())?;
        status.extrapolated = !info.coefficients.is_empty();
    }
    status.size = diis.subspace_size();
    Ok(status)
}

#[cfg(test)]
pub(crate) mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::diis::DiisConfig;
    use crate::linalg::Tensor4;

    /// `x <- A x + b` on a small vector, stored as a 1x1x1xN tensor.
    pub(crate) struct LinearMap {
        pub x: Tensor4,
        pub error: Tensor4,
        a: Vec<Vec<f64>>,
        b: Vec<f64>,
    }

    impl LinearMap {
        pub(crate) fn new(a: Vec<Vec<f64>>, b: Vec<f64>) -> Self {
            let n = b.len();
            Self {
                x: Tensor4::zeros([1, 1, 1, n]),
                error: Tensor4::zeros([1, 1, 1, n]),
                a,
                b,
            }
        }

        pub(crate) fn iterate(&mut self) {
            let x = self.x.as_slice().to_vec();
            let next: Vec<f64> = self
                .a
                .iter()
                .zip(&self.b)
                .map(|(row, b)| row.iter().zip(&x).map(|(a, x)| a * x).sum::<f64>() + b)
                .collect();
            for (k, value) in next.iter().enumerate() {
                self.error[(0, 0, 0, k)] = value - x[k];
                self.x[(0, 0, 0, k)] = *value;
            }
        }
    }

    impl FixedPointStep for LinearMap {
        fn error_slots(&self) -> Vec<SlotRef<'_>> {
            vec![SlotRef::Tensor(&self.error)]
        }

        fn solution_slots(&self) -> Vec<SlotRef<'_>> {
            vec![SlotRef::Tensor(&self.x)]
        }

        fn solution_slots_mut(&mut self) -> Vec<SlotMut<'_>> {
            vec![SlotMut::Tensor(&mut self.x)]
        }

        fn residual_norm(&self) -> f64 {
            self.error.rms()
        }
    }

    fn slow_map() -> LinearMap {
        LinearMap::new(
            vec![vec![0.9, 0.05, 0.0], vec![0.05, 0.8, 0.1], vec![0.0, 0.1, 0.85]],
            vec![1.0, -0.5, 0.25],
        )
    }

    #[test]
    fn diis_accelerates_linear_fixed_point() {
        let mut plain = slow_map();
        for _ in 0..8 {
            plain.iterate();
        }

        let mut accelerated = slow_map();
        let mut diis = DiisSubspace::in_core("linear", DiisConfig::default());
        for _ in 0..8 {
            accelerated.iterate();
            accelerate(&mut accelerated, &mut diis, true, 2).unwrap();
        }
        accelerated.iterate();

        assert!(accelerated.residual_norm() < 1e-8);
        assert!(plain.residual_norm() > 1e-3);
    }

    #[test]
    fn nothing_extrapolated_below_minimum() {
        let mut step = slow_map();
        let mut diis = DiisSubspace::in_core("linear", DiisConfig::default());
        step.iterate();
        let before = step.x.clone();

        let status = accelerate(&mut step, &mut diis, true, 2).unwrap();
        assert!(status.stored);
        assert!(!status.extrapolated);
        assert_eq!(status.size, 1);
        assert_eq!(step.x, before);
    }

    #[test]
    fn joint_concatenates_slots() {
        let mut a = slow_map();
        let mut b = LinearMap::new(vec![vec![0.5]], vec![1.0]);
        a.iterate();
        b.iterate();

        let mut joint = Joint(&mut a, &mut b);
        assert_eq!(joint.error_layout().len(), 2);
        assert_eq!(joint.solution_slots_mut().len(), 2);
        assert_relative_eq!(joint.residual_norm(), 1.0);
    }
}
