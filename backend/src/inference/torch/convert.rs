//! Offline conversion of weights-only legacy artifacts into self-contained
//! TorchScript modules that `NativeLoad` accepts without custom layers.

use ndarray::Array4;
use shared::{DiseaseLabel, LoadStrategyKind, ModelProvenance};
use std::path::{Path, PathBuf};
use strum::EnumCount;
use tch::{CModule, Device, TchError, Tensor};

use super::legacy::{LegacyNet, load_legacy};
use super::replacement::load_replacement;
use super::{read_named_tensors, to_tensor, to_vec};
use crate::config::LegacyArchitectureConfig;
use crate::inference::loader::LoadError;
use crate::inference::network::{DegradationCounter, NetworkError};
use crate::inference::preprocess::INPUT_SHAPE;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Torch error: {0}")]
    Torch(#[from] TchError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("{0}")]
    Network(#[from] NetworkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact only loads with replacement attention ({0}); pass --allow-degraded to convert anyway")]
    DegradedRefused(String),
    #[error("converted network produced {actual} outputs, expected {expected}")]
    OutputMismatch { expected: usize, actual: usize },
    #[error("saved module disagrees with the source network by {0}")]
    Diverged(f32),
}

/// One named tensor stored in an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<i64>,
    pub attention: bool,
}

/// Lists every tensor in a weights archive or TorchScript module, sorted by name.
pub fn inspect(path: &Path) -> Result<Vec<TensorEntry>, ConvertError> {
    let named: Vec<(String, Tensor)> = match read_named_tensors(path) {
        Ok(tensors) => tensors.into_iter().collect(),
        Err(archive) => match CModule::load(path).and_then(|m| m.named_parameters()) {
            Ok(params) => params,
            Err(_) => return Err(archive.into()),
        },
    };

    let mut entries: Vec<TensorEntry> = named
        .into_iter()
        .map(|(name, tensor)| TensorEntry {
            attention: name.to_lowercase().contains("attention"),
            shape: tensor.size(),
            name,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub device: Device,
    pub architecture: LegacyArchitectureConfig,
    /// Fall back to replacement attention when the artifact's attention
    /// weights do not fit the legacy layer.
    pub allow_degraded: bool,
}

#[derive(Debug, Clone)]
pub struct ConvertReport {
    pub target: PathBuf,
    pub strategy: LoadStrategyKind,
    pub provenance: ModelProvenance,
    /// Scores for an all-zero image, as produced by the saved module.
    pub zero_input_scores: Vec<f32>,
    pub pass_throughs: u64,
}

/// Rebuilds `source` in code, traces it and saves the TorchScript module to `target`.
///
/// The saved module is reloaded and must reproduce the source network's
/// output on an all-zero image.
pub fn convert(
    source: &Path,
    target: &Path,
    options: &ConvertOptions,
) -> Result<ConvertReport, ConvertError> {
    let degradation = DegradationCounter::new();
    let (strategy, provenance, (_vs, net)) =
        match load_legacy(options.device, &options.architecture, source) {
            Ok(built) => (
                LoadStrategyKind::CustomLayerLoad,
                ModelProvenance::Trained,
                built,
            ),
            Err(e) if e.is_shape_mismatch() => {
                if !options.allow_degraded {
                    return Err(ConvertError::DegradedRefused(e.to_string()));
                }
                log::warn!("{}; rebuilding with replacement attention", e);
                let built =
                    load_replacement(options.device, &options.architecture, source, &degradation)?;
                (
                    LoadStrategyKind::SyntheticReplacementLayer,
                    ModelProvenance::Degraded,
                    built,
                )
            }
            Err(e) => return Err(e.into()),
        };
    log::info!("Rebuilt {} with {}", source.display(), strategy);

    let zeros = to_tensor(&Array4::zeros(INPUT_SHAPE), options.device)?;
    let expected = tch::no_grad(|| net.forward(&zeros))?;
    let expected = to_vec(&expected)?;
    if expected.len() != DiseaseLabel::COUNT {
        return Err(ConvertError::OutputMismatch {
            expected: DiseaseLabel::COUNT,
            actual: expected.len(),
        });
    }

    let module = trace(&net, zeros.shallow_clone())?;
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    module.save(target)?;
    log::info!("Saved TorchScript module to {}", target.display());

    let mut reloaded = CModule::load_on_device(target, options.device)?;
    reloaded.set_eval();
    let actual = to_vec(&tch::no_grad(|| reloaded.forward_ts(&[zeros]))?)?;
    if actual.len() != expected.len() {
        return Err(ConvertError::OutputMismatch {
            expected: expected.len(),
            actual: actual.len(),
        });
    }
    let drift = expected
        .iter()
        .zip(&actual)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    if drift > 1e-4 {
        return Err(ConvertError::Diverged(drift));
    }

    let pass_throughs = degradation.count();
    if pass_throughs > 0 {
        log::warn!(
            "Replacement attention passed its input through {} times while tracing; the saved module skips attention",
            pass_throughs
        );
    }

    Ok(ConvertReport {
        target: target.to_path_buf(),
        strategy,
        provenance,
        zero_input_scores: actual,
        pass_throughs,
    })
}

fn trace(net: &LegacyNet, example: Tensor) -> Result<CModule, ConvertError> {
    let mut failure = None;
    let traced = CModule::create_by_tracing("HairScanNet", "forward", &[example], &mut |inputs| {
        match inputs.first().map(|xs| net.forward(xs)) {
            Some(Ok(ys)) => vec![ys],
            Some(Err(e)) => {
                failure = Some(e);
                Vec::new()
            }
            None => Vec::new(),
        }
    });
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(traced?),
    }
}
