//! Small dense matrix helpers on top of `ndarray`

use ndarray::{Array1, Array2, ArrayView1};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use specializer_core::{CoreError, Result};

/// He-scaled Gaussian matrix of shape `(rows, cols)`; `cols` is the fan-in
pub fn he_normal(rows: usize, cols: usize, rng: &mut dyn RngCore) -> Array2<f64> {
    let std = (2.0 / cols.max(1) as f64).sqrt();
    Array2::from_shape_simple_fn((rows, cols), || {
        let z: f64 = StandardNormal.sample(&mut *rng);
        z * std
    })
}

/// `a ⊗ b`, shape `(a.len(), b.len())`
pub fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    let col = a.view().insert_axis(ndarray::Axis(1));
    let row = b.view().insert_axis(ndarray::Axis(0));
    &col * &row
}

pub fn relu(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|v| v.max(0.0))
}

/// `[x > 0]`
pub fn relu_derivative(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
}

/// Mean squared error over the output slots
pub fn mse(prediction: &Array1<f64>, target: ArrayView1<f64>) -> f64 {
    let n = prediction.len().max(1) as f64;
    prediction
        .iter()
        .zip(target.iter())
        .map(|(p, t)| (p - t) * (p - t))
        .sum::<f64>()
        / n
}

pub fn all_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().all(|v| v.is_finite())
}

/// Fail with `DimensionMismatch` unless `actual == expected`
pub fn check_dim(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CoreError::dimension_mismatch(expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use specializer_core::seeded_rng;

    #[test]
    fn test_outer() {
        let m = outer(&array![1.0, 2.0], &array![3.0, 4.0, 5.0]);
        assert_eq!(m, array![[3.0, 4.0, 5.0], [6.0, 8.0, 10.0]]);
    }

    #[test]
    fn test_relu_and_derivative() {
        let x = array![-1.0, 0.0, 2.0];
        assert_eq!(relu(&x), array![0.0, 0.0, 2.0]);
        assert_eq!(relu_derivative(&x), array![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_he_normal_scale() {
        let mut rng = seeded_rng(1);
        let w = he_normal(200, 50, &mut rng);
        let var = w.iter().map(|v| v * v).sum::<f64>() / w.len() as f64;
        assert!((var - 2.0 / 50.0).abs() < 0.01);
    }

    #[test]
    fn test_he_normal_is_seeded() {
        let a = he_normal(8, 4, &mut seeded_rng(3));
        let b = he_normal(8, 4, &mut seeded_rng(3));
        assert_eq!(a, b);
        let mean = a.iter().sum::<f64>() / a.len() as f64;
        assert!(mean.abs() < 0.5);
    }

    #[test]
    fn test_mse() {
        let p = array![1.0, 3.0];
        let t = array![1.0, 1.0];
        assert_eq!(mse(&p, t.view()), 2.0);
        assert!(check_dim(3, 2).is_err());
    }
}
