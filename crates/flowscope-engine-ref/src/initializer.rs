//! Host-side variable initializers.

use anyhow::{ensure, Result};
use flowscope::checkpoint::{read_snapshot_file, variable_id};
use flowscope::variable::{Initializer, VariableConf};
use flowscope::{HostTensor, Shape};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Value a freshly created variable starts with: its snapshot when it has one, otherwise its
/// initializer, otherwise zeros.
pub fn initial_value(conf: &VariableConf) -> Result<HostTensor> {
    if let Some(snapshot) = &conf.snapshot {
        let tensor = read_snapshot_file(&snapshot.file_path(), &conf.name)?;
        ensure!(
            tensor.shape() == &conf.shape,
            "snapshot of '{}' has shape {} but the variable has shape {}",
            conf.name,
            tensor.shape(),
            conf.shape
        );
        return Ok(tensor);
    }
    let initializer = match &conf.initializer {
        Some(initializer) => initializer,
        None => return Ok(HostTensor::zeros(conf.shape.clone(), conf.dtype)),
    };
    let mut rng = StdRng::seed_from_u64(seed_for(conf));
    let values = fill(initializer, &conf.shape, &mut rng);
    HostTensor::from_vec(conf.shape.clone(), conf.dtype, values)
}

/// Explicit seed, else one derived from the variable name so reruns are reproducible.
fn seed_for(conf: &VariableConf) -> u64 {
    conf.random_seed
        .unwrap_or_else(|| variable_id(&conf.name) as u64)
}

fn fill(initializer: &Initializer, shape: &Shape, rng: &mut impl Rng) -> Vec<f32> {
    let len = shape.num_elements();
    match *initializer {
        Initializer::Constant { value } => vec![value; len],
        Initializer::Zeros => vec![0.0; len],
        Initializer::Ones => vec![1.0; len],
        Initializer::RandomUniform { min, max } => {
            if min >= max {
                return vec![min; len];
            }
            (0..len).map(|_| rng.gen_range(min..max)).collect()
        }
        Initializer::RandomNormal { mean, std } => normal(len, mean, std, None, rng),
        Initializer::TruncatedNormal { mean, std } => normal(len, mean, std, Some(2.0), rng),
    }
}

/// Box-Muller sampling; with `truncate`, draws farther than `truncate * std` from the mean
/// are rejected.
fn normal(len: usize, mean: f32, std: f32, truncate: Option<f32>, rng: &mut impl Rng) -> Vec<f32> {
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
        let u2: f32 = rng.gen::<f32>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        for z in [r * theta.cos(), r * theta.sin()] {
            if values.len() == len {
                break;
            }
            if truncate.is_some_and(|limit| z.abs() > limit) {
                continue;
            }
            values.push(mean + z * std);
        }
    }
    values
}
