mod compat;
pub mod convert;
mod legacy;
mod native;
mod replacement;

pub use legacy::CustomLayerLoad;
pub use native::NativeLoad;
pub use replacement::SyntheticReplacementLayer;

use ndarray::Array4;
use shared::LoadStrategyKind;
use std::collections::HashMap;
use std::path::Path;
use tch::{Device, Kind, TchError, Tensor, nn};

use super::loader::{LoadError, LoadStrategy};
use super::network::NetworkError;
use crate::config::ModelConfig;

pub fn strategies(config: &ModelConfig) -> Vec<Box<dyn LoadStrategy>> {
    let device = select_device(&config.device);
    log::info!("Torch runtime device: {:?}", device);
    vec![
        Box::new(NativeLoad::new(device)),
        Box::new(CustomLayerLoad::new(device, config.legacy.clone())),
        Box::new(SyntheticReplacementLayer::new(device, config.legacy.clone())),
    ]
}

/// `cpu`, `cuda`, or anything else for CUDA when available.
pub fn select_device(name: &str) -> Device {
    match name {
        "cpu" => Device::Cpu,
        "cuda" => Device::Cuda(0),
        _ => Device::cuda_if_available(),
    }
}

/// NHWC ndarray batch to a tensor on `device`.
fn to_tensor(input: &Array4<f32>, device: Device) -> Result<Tensor, NetworkError> {
    let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = input.iter().copied().collect();
    Tensor::from_slice(&data)
        .f_reshape(shape.as_slice())
        .and_then(|t| t.f_to_device(device))
        .map_err(|e| NetworkError::InvalidInput(e.to_string()))
}

fn to_vec(output: &Tensor) -> Result<Vec<f32>, NetworkError> {
    let flat = output
        .f_to_kind(Kind::Float)
        .and_then(|t| t.f_view([-1]))
        .and_then(|t| t.f_to_device(Device::Cpu))
        .map_err(|e| NetworkError::Forward(e.to_string()))?;
    Vec::<f32>::try_from(&flat).map_err(|e| NetworkError::Forward(e.to_string()))
}

fn strategy_failed(strategy: LoadStrategyKind, e: impl std::fmt::Display) -> LoadError {
    LoadError::StrategyFailed {
        strategy,
        reason: e.to_string(),
    }
}

fn read_named_tensors(path: &Path) -> Result<HashMap<String, Tensor>, TchError> {
    let tensors = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path)?,
        _ => Tensor::load_multi(path)?,
    };
    Ok(tensors.into_iter().collect())
}

/// Copies artifact weights into `vs`.
///
/// Every variable present in both must agree on shape; a disagreement is a
/// `ShapeMismatch`. Variables absent from the artifact are an error unless their
/// name starts with one of `fresh_prefixes`, in which case they keep their
/// initialization and are returned.
fn load_weights(
    vs: &nn::VarStore,
    path: &Path,
    strategy: LoadStrategyKind,
    fresh_prefixes: &[&str],
) -> Result<Vec<String>, LoadError> {
    let stored = read_named_tensors(path).map_err(|e| strategy_failed(strategy, e))?;
    let variables = vs.variables();

    let mut mismatched = Vec::new();
    let mut missing = Vec::new();
    for (name, var) in &variables {
        match stored.get(name) {
            Some(src) if src.size() != var.size() => mismatched.push(format!(
                "{}: artifact {:?} vs layer {:?}",
                name,
                src.size(),
                var.size()
            )),
            Some(_) => {}
            None => missing.push(name.clone()),
        }
    }

    if !mismatched.is_empty() {
        mismatched.sort();
        return Err(LoadError::ShapeMismatch {
            strategy,
            reason: mismatched.join("; "),
        });
    }
    missing.sort();
    if let Some(name) = missing
        .iter()
        .find(|name| !fresh_prefixes.iter().any(|p| name.starts_with(p)))
    {
        return Err(strategy_failed(
            strategy,
            format!("variable {} not found in {}", name, path.display()),
        ));
    }

    tch::no_grad(|| -> Result<(), TchError> {
        for (name, mut var) in variables {
            if let Some(src) = stored.get(&name) {
                var.f_copy_(&src.f_to_device(var.device())?)?;
            }
        }
        Ok(())
    })
    .map_err(|e| strategy_failed(strategy, e))?;

    Ok(missing)
}

fn parameter_count(vs: &nn::VarStore) -> u64 {
    vs.variables().values().map(|t| t.numel() as u64).sum()
}
