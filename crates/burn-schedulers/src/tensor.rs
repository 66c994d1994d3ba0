//! Tensor helpers used by the step formulas
//!
//! Every update rule is a linear combination of a few same-shaped tensors.
//! Coefficients are computed in `f64` on the host and converted to the
//! backend element type once per term.

use burn::prelude::*;

use crate::error::{Result, SchedulerError};

/// Check that two tensors have identical shapes (no broadcasting)
pub fn ensure_same_shape<B: Backend, const D: usize>(
    expected: &Tensor<B, D>,
    actual: &Tensor<B, D>,
) -> Result<()> {
    let (expected, actual) = (expected.dims(), actual.dims());
    if expected != actual {
        return Err(SchedulerError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

/// Compute `sum_i weights[i] * tensors[i]`
///
/// Requires at least two terms, one weight per tensor, and identical shapes.
///
/// Only the coefficients are `f64`. Products and partial sums stay in the
/// backend float type, so on an `f32` backend each term contributes one
/// rounding of `|weight * value|` relative size. Terms that nearly cancel
/// lose precision accordingly.
pub fn weighted_sum<B: Backend, const D: usize>(
    tensors: &[Tensor<B, D>],
    weights: &[f64],
) -> Result<Tensor<B, D>> {
    if tensors.len() != weights.len() || tensors.len() < 2 {
        return Err(SchedulerError::WeightCount {
            tensors: tensors.len(),
            weights: weights.len(),
        });
    }

    let first = &tensors[0];
    for tensor in &tensors[1..] {
        ensure_same_shape(first, tensor)?;
    }

    let mut acc = first.clone().mul_scalar(weights[0]);
    for (tensor, &weight) in tensors[1..].iter().zip(&weights[1..]) {
        if weight == 0.0 {
            continue;
        }
        acc = acc + tensor.clone().mul_scalar(weight);
    }
    Ok(acc)
}

/// Read a tensor back to the host as `f32` values
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SchedulerError::TensorData(format!("{e:?}")))
}
