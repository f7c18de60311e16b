use shared::{LoadStrategyKind, ModelProvenance};
use std::path::Path;
use tch::{Device, TchError, Tensor, nn};

use super::legacy::{FEATURES, LegacyNet, LegacyNetwork, SequenceAttention};
use super::{compat, load_weights};
use crate::config::LegacyArchitectureConfig;
use crate::inference::loader::{LoadError, LoadStrategy, LoadedNetwork};
use crate::inference::network::DegradationCounter;

const HEADS: i64 = 8;
const KEY_DIM: i64 = 64;
const PREFIX: &str = "attention_replacement";

/// Stand-in for the legacy multi-head attention layer.
///
/// Takes the legacy constructor arguments so configs stay interchangeable, but
/// always runs standard multi-head attention with fixed heads and key width.
/// A failing forward pass returns the input unchanged and is recorded.
pub(super) struct ReplacementAttention {
    query: nn::Linear,
    key: nn::Linear,
    value: nn::Linear,
    output: nn::Linear,
    degradation: DegradationCounter,
}

impl ReplacementAttention {
    pub(super) fn new(
        p: nn::Path,
        features: i64,
        head_num: i64,
        units: i64,
        degradation: DegradationCounter,
    ) -> Self {
        log::debug!(
            "Replacement attention ignores head_num={} units={}, using {} heads of width {}",
            head_num,
            units,
            HEADS,
            KEY_DIM
        );
        let inner = HEADS * KEY_DIM;
        Self {
            query: nn::linear(&p / "query", features, inner, Default::default()),
            key: nn::linear(&p / "key", features, inner, Default::default()),
            value: nn::linear(&p / "value", features, inner, Default::default()),
            output: nn::linear(&p / "output", inner, features, Default::default()),
            degradation,
        }
    }

    fn project(&self, layer: &nn::Linear, xs: &Tensor) -> Result<Tensor, TchError> {
        let (batch, steps, _) = xs.size3()?;
        let x = xs.f_linear(&layer.ws, layer.bs.as_ref())?;
        let x = compat::reshape(&x, &[batch, steps, HEADS, KEY_DIM])?;
        compat::permute_dimensions(&x, &[0, 2, 1, 3])
    }

    fn attend(&self, xs: &Tensor) -> Result<Tensor, TchError> {
        let (batch, steps, _) = xs.size3()?;
        let q = self.project(&self.query, xs)?;
        let k = self.project(&self.key, xs)?;
        let v = self.project(&self.value, xs)?;

        // libtorch's fused kernel; scale defaults to 1/sqrt(KEY_DIM).
        let y = Tensor::f_scaled_dot_product_attention(
            &q,
            &k,
            &v,
            None::<&Tensor>,
            0.0,
            false,
            None,
            false,
        )?;
        let y = compat::permute_dimensions(&y, &[0, 2, 1, 3])?;
        let y = compat::reshape(&y, &[batch, steps, HEADS * KEY_DIM])?;
        y.f_linear(&self.output.ws, self.output.bs.as_ref())
    }
}

impl SequenceAttention for ReplacementAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, TchError> {
        match self.attend(xs) {
            Ok(ys) => Ok(ys),
            Err(e) => {
                self.degradation.record(PREFIX, &e.to_string());
                Ok(xs.shallow_clone())
            }
        }
    }
}

/// The legacy architecture with its multi-head attention swapped for
/// `ReplacementAttention`. Only tried after a parameter shape mismatch.
pub struct SyntheticReplacementLayer {
    device: Device,
    config: LegacyArchitectureConfig,
}

impl SyntheticReplacementLayer {
    pub fn new(device: Device, config: LegacyArchitectureConfig) -> Self {
        Self { device, config }
    }
}

/// Builds the legacy architecture around `ReplacementAttention` and fills
/// everything but the attention projections from `path`.
pub(super) fn load_replacement(
    device: Device,
    config: &LegacyArchitectureConfig,
    path: &Path,
    degradation: &DegradationCounter,
) -> Result<(nn::VarStore, LegacyNet), LoadError> {
    let kind = LoadStrategyKind::SyntheticReplacementLayer;
    let vs = nn::VarStore::new(device);
    let net = LegacyNet::new(&vs.root(), config, |root| {
        Box::new(ReplacementAttention::new(
            root / PREFIX,
            FEATURES,
            config.head_num,
            config.attention_units,
            degradation.clone(),
        ))
    });

    let fresh = load_weights(&vs, path, kind, &[PREFIX])?;
    if !fresh.is_empty() {
        log::warn!(
            "{} kept {} variables at their initial values: {}",
            kind,
            fresh.len(),
            fresh.join(", ")
        );
    }
    Ok((vs, net))
}

impl LoadStrategy for SyntheticReplacementLayer {
    fn kind(&self) -> LoadStrategyKind {
        LoadStrategyKind::SyntheticReplacementLayer
    }

    fn attempt(
        &self,
        artifact: Option<&Path>,
        previous: Option<&LoadError>,
    ) -> Result<LoadedNetwork, LoadError> {
        let kind = self.kind();
        if !previous.is_some_and(LoadError::is_shape_mismatch) {
            return Err(LoadError::NotApplicable {
                strategy: kind,
                reason: "previous failure was not a parameter shape mismatch".into(),
            });
        }
        let path = artifact.ok_or_else(|| LoadError::NotApplicable {
            strategy: kind,
            reason: "no artifact".into(),
        })?;

        let degradation = DegradationCounter::new();
        let (vs, net) = load_replacement(self.device, &self.config, path, &degradation)?;
        Ok(
            LoadedNetwork::new(Box::new(LegacyNetwork::new(vs, net)), ModelProvenance::Degraded)
                .with_degradation(degradation),
        )
    }
}
