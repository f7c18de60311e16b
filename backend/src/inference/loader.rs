use chrono::{DateTime, Utc};
use ndarray::Array4;
use shared::{DiseaseLabel, LoadStrategyKind, ModelInfo, ModelProvenance, StrategyFailure};
use std::path::{Path, PathBuf};
use strum::EnumCount;

use super::fallback::FreshFallbackNetwork;
use super::network::{DegradationCounter, Network, NetworkError};
use super::preprocess::INPUT_SHAPE;
use crate::artifact::{ModelResolver, file_sha256};
use crate::config::ModelConfig;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{strategy} failed: {reason}")]
    StrategyFailed {
        strategy: LoadStrategyKind,
        reason: String,
    },
    #[error("{strategy} failed with a parameter shape mismatch: {reason}")]
    ShapeMismatch {
        strategy: LoadStrategyKind,
        reason: String,
    },
    #[error("{strategy} skipped: {reason}")]
    NotApplicable {
        strategy: LoadStrategyKind,
        reason: String,
    },
    #[error("{strategy} unavailable: built without the torch runtime")]
    RuntimeUnavailable { strategy: LoadStrategyKind },
    #[error("{strategy} produced an unusable network: {reason}")]
    ProbeFailed {
        strategy: LoadStrategyKind,
        reason: String,
    },
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
}

impl LoadError {
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, LoadError::ShapeMismatch { .. })
    }
}

/// A network produced by one strategy, before probing.
pub struct LoadedNetwork {
    pub network: Box<dyn Network>,
    pub provenance: ModelProvenance,
    pub degradation: DegradationCounter,
}

impl LoadedNetwork {
    pub fn new(network: Box<dyn Network>, provenance: ModelProvenance) -> Self {
        Self {
            network,
            provenance,
            degradation: DegradationCounter::new(),
        }
    }

    pub fn with_degradation(mut self, degradation: DegradationCounter) -> Self {
        self.degradation = degradation;
        self
    }
}

/// One way of turning an artifact into a network. `previous` is the failure of
/// the strategy tried just before, if any.
pub trait LoadStrategy: Send + Sync {
    fn kind(&self) -> LoadStrategyKind;

    fn attempt(
        &self,
        artifact: Option<&Path>,
        previous: Option<&LoadError>,
    ) -> Result<LoadedNetwork, LoadError>;
}

/// Placeholder for artifact strategies when libtorch is not compiled in.
#[cfg_attr(feature = "torch", allow(dead_code))]
pub struct RuntimeUnavailable(pub LoadStrategyKind);

impl LoadStrategy for RuntimeUnavailable {
    fn kind(&self) -> LoadStrategyKind {
        self.0
    }

    fn attempt(
        &self,
        _artifact: Option<&Path>,
        _previous: Option<&LoadError>,
    ) -> Result<LoadedNetwork, LoadError> {
        Err(LoadError::RuntimeUnavailable { strategy: self.0 })
    }
}

#[cfg(feature = "torch")]
fn artifact_strategies(config: &ModelConfig) -> Vec<Box<dyn LoadStrategy>> {
    super::torch::strategies(config)
}

#[cfg(not(feature = "torch"))]
fn artifact_strategies(_config: &ModelConfig) -> Vec<Box<dyn LoadStrategy>> {
    vec![
        Box::new(RuntimeUnavailable(LoadStrategyKind::NativeLoad)),
        Box::new(RuntimeUnavailable(LoadStrategyKind::CustomLayerLoad)),
        Box::new(RuntimeUnavailable(LoadStrategyKind::SyntheticReplacementLayer)),
    ]
}

/// The active network plus how it came to be. Immutable once built.
pub struct LoadedModel {
    network: Box<dyn Network>,
    strategy: LoadStrategyKind,
    provenance: ModelProvenance,
    artifact: Option<PathBuf>,
    artifact_sha256: Option<String>,
    loaded_at: DateTime<Utc>,
    failures: Vec<StrategyFailure>,
    degradation: DegradationCounter,
}

impl LoadedModel {
    fn new(
        loaded: LoadedNetwork,
        strategy: LoadStrategyKind,
        artifact: Option<PathBuf>,
        failures: Vec<StrategyFailure>,
    ) -> Self {
        let artifact_sha256 = artifact.as_deref().and_then(|path| match file_sha256(path) {
            Ok(digest) => Some(digest),
            Err(e) => {
                log::warn!("Could not hash artifact {}: {}", path.display(), e);
                None
            }
        });
        Self {
            network: loaded.network,
            strategy,
            provenance: loaded.provenance,
            artifact,
            artifact_sha256,
            loaded_at: Utc::now(),
            failures,
            degradation: loaded.degradation,
        }
    }

    /// Wraps an already constructed network without going through the strategy chain.
    pub fn from_network(
        network: Box<dyn Network>,
        strategy: LoadStrategyKind,
        provenance: ModelProvenance,
    ) -> Self {
        Self::new(LoadedNetwork::new(network, provenance), strategy, None, Vec::new())
    }

    pub fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, NetworkError> {
        self.network.forward(input)
    }

    pub fn strategy(&self) -> LoadStrategyKind {
        self.strategy
    }

    pub fn provenance(&self) -> ModelProvenance {
        self.provenance
    }

    pub fn failures(&self) -> &[StrategyFailure] {
        &self.failures
    }

    pub fn summary(&self) -> ModelInfo {
        ModelInfo {
            input_shape: INPUT_SHAPE,
            num_classes: DiseaseLabel::COUNT,
            class_labels: DiseaseLabel::names(),
            parameter_count: self.network.parameter_count(),
            strategy: self.strategy,
            provenance: self.provenance,
            artifact_path: self.artifact.as_ref().map(|p| p.display().to_string()),
            artifact_sha256: self.artifact_sha256.clone(),
            loaded_at: self.loaded_at.to_rfc3339(),
            strategy_failures: self.failures.clone(),
            attention_passthrough_count: self.degradation.count(),
        }
    }
}

/// Runs the resolver and then the strategies in order until one yields a usable network.
pub struct ModelLoader {
    resolver: ModelResolver,
    strategies: Vec<Box<dyn LoadStrategy>>,
    fallback: Box<dyn LoadStrategy>,
}

impl ModelLoader {
    pub fn new(
        resolver: ModelResolver,
        strategies: Vec<Box<dyn LoadStrategy>>,
        fallback: Box<dyn LoadStrategy>,
    ) -> Self {
        Self {
            resolver,
            strategies,
            fallback,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(
            ModelResolver::from_config(config),
            artifact_strategies(config),
            Box::new(FreshFallbackNetwork::new(config.fallback_seed)),
        )
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    pub fn load(&self) -> Result<LoadedModel, LoadError> {
        let mut failures = Vec::new();
        let mut previous: Option<LoadError> = None;

        match self.resolver.resolve() {
            Ok(artifact) => {
                for strategy in &self.strategies {
                    let kind = strategy.kind();
                    log::info!("Loading {} with strategy {}", artifact.display(), kind);
                    let attempt = strategy
                        .attempt(Some(&artifact), previous.as_ref())
                        .and_then(|loaded| probe(kind, loaded));
                    match attempt {
                        Ok(loaded) => {
                            match loaded.provenance {
                                ModelProvenance::Trained => {
                                    log::info!("Model loaded with strategy {}", kind)
                                }
                                _ => log::warn!(
                                    "Model loaded with strategy {} ({}); accuracy may be reduced",
                                    kind,
                                    loaded.provenance
                                ),
                            }
                            return Ok(LoadedModel::new(loaded, kind, Some(artifact), failures));
                        }
                        Err(e) => {
                            log::warn!("{}", e);
                            failures.push(StrategyFailure {
                                strategy: kind,
                                reason: e.to_string(),
                            });
                            previous = Some(e);
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("{}; skipping artifact strategies", e);
            }
        }

        let kind = self.fallback.kind();
        match self
            .fallback
            .attempt(None, previous.as_ref())
            .and_then(|loaded| probe(kind, loaded))
        {
            Ok(loaded) => {
                log::warn!(
                    "Serving {} network from strategy {}; predictions carry no trained label information",
                    loaded.provenance,
                    kind
                );
                Ok(LoadedModel::new(loaded, kind, None, failures))
            }
            Err(e) => {
                log::error!("Fallback network could not be built: {}", e);
                Err(LoadError::ModelUnavailable(e.to_string()))
            }
        }
    }
}

/// One forward pass on a zero batch; the network must answer with one score per label.
fn probe(kind: LoadStrategyKind, loaded: LoadedNetwork) -> Result<LoadedNetwork, LoadError> {
    let input = Array4::<f32>::zeros(INPUT_SHAPE);
    let output = loaded
        .network
        .forward(&input)
        .map_err(|e| LoadError::ProbeFailed {
            strategy: kind,
            reason: e.to_string(),
        })?;
    if output.len() != DiseaseLabel::COUNT {
        return Err(LoadError::ProbeFailed {
            strategy: kind,
            reason: format!(
                "output has {} values, expected {}",
                output.len(),
                DiseaseLabel::COUNT
            ),
        });
    }
    Ok(loaded)
}
