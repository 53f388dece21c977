//! Parameter initialization
//!
//! Recurrent weight matrices are orthogonal, every other weight matrix is
//! Xavier-uniform and every bias starts at zero. Draws are seeded and visit
//! parameters in name order, so a given seed always yields the same network.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

use crate::error::{ForecastError, Result};

/// How a named parameter gets initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitScheme {
    Orthogonal,
    XavierUniform,
    Zeros,
}

/// Pick the scheme for a parameter from its name
pub fn scheme_for(name: &str) -> InitScheme {
    let leaf = name.rsplit('.').next().unwrap_or(name);
    if leaf.starts_with("bias") {
        InitScheme::Zeros
    } else if leaf.starts_with("weight_ih") || leaf.starts_with("weight_hh") {
        InitScheme::Orthogonal
    } else {
        InitScheme::XavierUniform
    }
}

/// Re-initialize every variable in `varmap` in place
pub fn initialize(varmap: &VarMap, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let vars = varmap
        .data()
        .lock()
        .map_err(|e| ForecastError::config(format!("parameter map lock poisoned: {e}")))?;

    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    for name in names {
        let var = &vars[name];
        let dims = var.dims().to_vec();
        let device = var.device().clone();
        let value = match (scheme_for(name), dims.as_slice()) {
            (InitScheme::Zeros, _) => var.zeros_like()?,
            (InitScheme::Orthogonal, &[rows, cols]) => orthogonal(rows, cols, &mut rng, &device)?,
            (InitScheme::XavierUniform, &[fan_out, fan_in]) => {
                xavier_uniform(fan_out, fan_in, &mut rng, &device)?
            }
            (scheme, shape) => {
                return Err(ForecastError::config(format!(
                    "cannot apply {scheme:?} to parameter {name} of shape {shape:?}"
                )))
            }
        };
        var.set(&value)?;
    }
    debug!(parameters = vars.len(), seed = seed, "Initialized parameters");
    Ok(())
}

/// A (rows, cols) matrix with orthonormal rows or columns, whichever is shorter
pub fn orthogonal(rows: usize, cols: usize, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let (tall, short) = if rows >= cols { (rows, cols) } else { (cols, rows) };

    // columns[j] is the j-th column of a (tall, short) gaussian matrix
    let mut columns: Vec<Vec<f64>> = (0..short)
        .map(|_| (0..tall).map(|_| rng.sample::<f64, _>(StandardNormal)).collect())
        .collect();

    // modified Gram-Schmidt
    for j in 0..short {
        for k in 0..j {
            let (done, rest) = columns.split_at_mut(j);
            let proj: f64 = done[k].iter().zip(&rest[0]).map(|(a, b)| a * b).sum();
            rest[0].iter_mut().zip(&done[k]).for_each(|(v, q)| *v -= proj * q);
        }
        let norm = columns[j].iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > f64::EPSILON {
            columns[j].iter_mut().for_each(|v| *v /= norm);
        }
    }

    let mut values = vec![0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            values[r * cols + c] = if rows >= cols {
                columns[c][r] as f32
            } else {
                columns[r][c] as f32
            };
        }
    }
    Ok(Tensor::from_vec(values, (rows, cols), device)?)
}

pub fn xavier_uniform(fan_out: usize, fan_in: usize, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    let values: Vec<f32> = (0..fan_out * fan_in)
        .map(|_| rng.gen_range(-bound..bound) as f32)
        .collect();
    Ok(Tensor::from_vec(values, (fan_out, fan_in), device)?)
}
