//! The legacy architecture: a convolutional backbone whose spatial features
//! are treated as a sequence and passed through two attention layers that are
//! not part of the standard layer library.

use ndarray::Array4;
use shared::{LoadStrategyKind, ModelProvenance};
use std::path::Path;
use std::sync::Mutex;
use tch::{Device, TchError, Tensor, nn};

use super::compat;
use super::{load_weights, parameter_count, strategy_failed, to_tensor, to_vec};
use crate::config::LegacyArchitectureConfig;
use crate::inference::loader::{LoadError, LoadStrategy, LoadedNetwork};
use crate::inference::network::{Network, NetworkError};
use shared::DiseaseLabel;
use strum::EnumCount;

const BACKBONE_FILTERS: [i64; 3] = [32, 64, 128];
pub(super) const FEATURES: i64 = 128;

fn weight_init() -> nn::Init {
    nn::Init::Uniform { lo: -0.05, up: 0.05 }
}

/// Attention over a `[batch, time, features]` sequence.
pub(super) trait SequenceAttention: Send {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, TchError>;
}

/// Additive self-attention: `softmax(Wa . tanh(x Wt + x Wx + bh) + ba) x`.
struct SeqSelfAttention {
    wt: Tensor,
    wx: Tensor,
    bh: Tensor,
    wa: Tensor,
    ba: Tensor,
}

impl SeqSelfAttention {
    fn new(p: nn::Path, features: i64, units: i64) -> Self {
        Self {
            wt: p.var("Wt", &[features, units], weight_init()),
            wx: p.var("Wx", &[features, units], weight_init()),
            bh: p.var("bh", &[units], nn::Init::Const(0.0)),
            wa: p.var("Wa", &[units, 1], weight_init()),
            ba: p.var("ba", &[1], nn::Init::Const(0.0)),
        }
    }
}

impl SequenceAttention for SeqSelfAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, TchError> {
        let (batch, steps, _) = xs.size3()?;
        let q = compat::expand_dims(&compat::dot(xs, &self.wt)?, 2)?;
        let k = compat::expand_dims(&compat::dot(xs, &self.wx)?, 1)?;
        let h = q.f_add(&k)?.f_add(&self.bh)?.f_tanh()?;
        let e = compat::dot(&h, &self.wa)?.f_add(&self.ba)?;
        let e = compat::reshape(&e, &[batch, steps, steps])?;
        let a = compat::softmax(&e, -1)?;
        compat::batch_dot(&a, xs)
    }
}

/// Scaled dot-product multi-head self-attention with square projections.
struct LegacyMultiHeadAttention {
    head_num: i64,
    wq: Tensor,
    bq: Tensor,
    wk: Tensor,
    bk: Tensor,
    wv: Tensor,
    bv: Tensor,
    wo: Tensor,
    bo: Tensor,
}

impl LegacyMultiHeadAttention {
    fn new(p: nn::Path, features: i64, head_num: i64) -> Self {
        let square = |name: &str| p.var(name, &[features, features], weight_init());
        let bias = |name: &str| p.var(name, &[features], nn::Init::Const(0.0));
        Self {
            head_num,
            wq: square("Wq"),
            bq: bias("bq"),
            wk: square("Wk"),
            bk: bias("bk"),
            wv: square("Wv"),
            bv: bias("bv"),
            wo: square("Wo"),
            bo: bias("bo"),
        }
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor, TchError> {
        let (batch, steps, features) = x.size3()?;
        let depth = features / self.head_num;
        let x = compat::reshape(x, &[batch, steps, self.head_num, depth])?;
        let x = compat::permute_dimensions(&x, &[0, 2, 1, 3])?;
        compat::reshape(&x, &[batch * self.head_num, steps, depth])
    }

    fn merge_heads(&self, x: &Tensor, batch: i64) -> Result<Tensor, TchError> {
        let (_, steps, depth) = x.size3()?;
        let x = compat::reshape(x, &[batch, self.head_num, steps, depth])?;
        let x = compat::permute_dimensions(&x, &[0, 2, 1, 3])?;
        compat::reshape(&x, &[batch, steps, self.head_num * depth])
    }
}

impl SequenceAttention for LegacyMultiHeadAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, TchError> {
        let (batch, _, features) = xs.size3()?;
        let q = self.split_heads(&compat::dot(xs, &self.wq)?.f_add(&self.bq)?)?;
        let k = self.split_heads(&compat::dot(xs, &self.wk)?.f_add(&self.bk)?)?;
        let v = self.split_heads(&compat::dot(xs, &self.wv)?.f_add(&self.bv)?)?;

        let depth = (features / self.head_num) as f64;
        let scores = compat::batch_dot(&q, &compat::permute_dimensions(&k, &[0, 2, 1])?)?
            .f_div_scalar(depth.sqrt())?;
        let weights = compat::softmax(&scores, -1)?;
        let y = self.merge_heads(&compat::batch_dot(&weights, &v)?, batch)?;
        compat::dot(&y, &self.wo)?.f_add(&self.bo)
    }
}

/// Conv backbone, then sequence self-attention and a second attention layer
/// chosen by the caller, then mean pooling and a dense softmax head.
pub(super) struct LegacyNet {
    convs: Vec<nn::Conv2D>,
    self_attention: SeqSelfAttention,
    attention: Box<dyn SequenceAttention>,
    head: nn::Linear,
}

impl LegacyNet {
    pub(super) fn new<F>(root: &nn::Path, config: &LegacyArchitectureConfig, attention: F) -> Self
    where
        F: FnOnce(&nn::Path) -> Box<dyn SequenceAttention>,
    {
        let mut convs = Vec::with_capacity(BACKBONE_FILTERS.len());
        let mut in_channels = 3;
        for (i, &filters) in BACKBONE_FILTERS.iter().enumerate() {
            convs.push(nn::conv2d(
                root / format!("conv{}", i + 1),
                in_channels,
                filters,
                3,
                Default::default(),
            ));
            in_channels = filters;
        }
        Self {
            convs,
            self_attention: SeqSelfAttention::new(
                root / "seq_self_attention",
                FEATURES,
                config.attention_units,
            ),
            attention: attention(root),
            head: nn::linear(
                root / "head",
                FEATURES,
                DiseaseLabel::COUNT as i64,
                Default::default(),
            ),
        }
    }

    /// NHWC batch in, class probabilities out.
    pub(super) fn forward(&self, xs: &Tensor) -> Result<Tensor, TchError> {
        let mut x = compat::permute_dimensions(xs, &[0, 3, 1, 2])?;
        for conv in &self.convs {
            x = x
                .f_conv2d(&conv.ws, conv.bs.as_ref(), [1, 1], [0, 0], [1, 1], 1)?
                .f_relu()?
                .f_max_pool2d([2, 2], [2, 2], [0, 0], [1, 1], false)?;
        }
        let batch = x.size()[0];
        let x = compat::permute_dimensions(&x, &[0, 2, 3, 1])?;
        let x = compat::reshape(&x, &[batch, -1, FEATURES])?;

        let x = self.self_attention.forward(&x)?;
        let x = self.attention.forward(&x)?;
        let pooled = compat::mean(&x, 1, false)?;
        let logits = pooled.f_linear(&self.head.ws, self.head.bs.as_ref())?;
        compat::softmax(&logits, -1)
    }
}

/// A `LegacyNet` together with the variable store that owns its weights.
pub(super) struct LegacyNetwork {
    _vs: nn::VarStore,
    net: Mutex<LegacyNet>,
    device: Device,
    parameters: u64,
}

impl LegacyNetwork {
    pub(super) fn new(vs: nn::VarStore, net: LegacyNet) -> Self {
        let parameters = parameter_count(&vs);
        let device = vs.device();
        Self {
            _vs: vs,
            net: Mutex::new(net),
            device,
            parameters,
        }
    }
}

impl Network for LegacyNetwork {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, NetworkError> {
        let tensor = to_tensor(input, self.device)?;
        let net = self
            .net
            .lock()
            .map_err(|_| NetworkError::Forward("model lock poisoned".into()))?;
        let output =
            tch::no_grad(|| net.forward(&tensor)).map_err(|e| NetworkError::Forward(e.to_string()))?;
        to_vec(&output)
    }

    fn parameter_count(&self) -> u64 {
        self.parameters
    }
}

fn check_heads(
    strategy: LoadStrategyKind,
    config: &LegacyArchitectureConfig,
) -> Result<(), LoadError> {
    if FEATURES % config.head_num != 0 {
        return Err(strategy_failed(
            strategy,
            format!(
                "head_num {} does not divide the feature width {}",
                config.head_num, FEATURES
            ),
        ));
    }
    Ok(())
}

/// Loads a weights-only artifact into the legacy architecture built in code.
pub struct CustomLayerLoad {
    device: Device,
    config: LegacyArchitectureConfig,
}

impl CustomLayerLoad {
    pub fn new(device: Device, config: LegacyArchitectureConfig) -> Self {
        Self { device, config }
    }
}

/// Builds the legacy architecture on `device` and fills it from `path`.
pub(super) fn load_legacy(
    device: Device,
    config: &LegacyArchitectureConfig,
    path: &Path,
) -> Result<(nn::VarStore, LegacyNet), LoadError> {
    let kind = LoadStrategyKind::CustomLayerLoad;
    check_heads(kind, config)?;

    let vs = nn::VarStore::new(device);
    let net = legacy_net(&vs.root(), config);
    load_weights(&vs, path, kind, &[])?;
    Ok((vs, net))
}

/// The legacy architecture with its own multi-head attention, freshly initialized.
pub(super) fn legacy_net(root: &nn::Path, config: &LegacyArchitectureConfig) -> LegacyNet {
    LegacyNet::new(root, config, |root| {
        Box::new(LegacyMultiHeadAttention::new(
            root / "multi_head_attention",
            FEATURES,
            config.head_num,
        ))
    })
}

impl LoadStrategy for CustomLayerLoad {
    fn kind(&self) -> LoadStrategyKind {
        LoadStrategyKind::CustomLayerLoad
    }

    fn attempt(
        &self,
        artifact: Option<&Path>,
        _previous: Option<&LoadError>,
    ) -> Result<LoadedNetwork, LoadError> {
        let path = artifact.ok_or_else(|| LoadError::NotApplicable {
            strategy: self.kind(),
            reason: "no artifact".into(),
        })?;

        let (vs, net) = load_legacy(self.device, &self.config, path)?;
        Ok(LoadedNetwork::new(
            Box::new(LegacyNetwork::new(vs, net)),
            ModelProvenance::Trained,
        ))
    }
}
