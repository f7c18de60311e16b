//! Untrained replacement network.
//!
//! Built when no artifact can be loaded so the service keeps answering. Its
//! weights are random, so its predictions are structurally valid but carry no
//! label information.

use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

use super::loader::{LoadError, LoadStrategy, LoadedNetwork};
use super::network::{Network, NetworkError};
use super::postprocess::softmax;
use super::preprocess::{CHANNELS, INPUT_SIZE};
use shared::{DiseaseLabel, LoadStrategyKind, ModelProvenance};
use strum::EnumCount;

const KERNEL: usize = 3;
const CONV_FILTERS: [usize; 4] = [32, 64, 128, 128];
const HIDDEN_UNITS: usize = 512;

/// 3x3 valid convolution stored in im2col layout: `[KERNEL * KERNEL * in, out]`.
struct Conv2d {
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

impl Conv2d {
    fn new(rng: &mut StdRng, in_channels: usize, out_channels: usize) -> Self {
        let fan_in = KERNEL * KERNEL * in_channels;
        Self {
            kernel: glorot_uniform(rng, fan_in, out_channels),
            bias: Array1::zeros(out_channels),
        }
    }

    fn parameter_count(&self) -> usize {
        self.kernel.len() + self.bias.len()
    }

    /// HWC in, HWC out, followed by ReLU.
    fn forward(&self, input: ArrayView3<f32>) -> Result<Array3<f32>, NetworkError> {
        let (h, w, c) = input.dim();
        if h < KERNEL || w < KERNEL {
            return Err(NetworkError::InvalidInput(format!(
                "feature map {h}x{w} smaller than kernel"
            )));
        }
        let (oh, ow) = (h - KERNEL + 1, w - KERNEL + 1);

        let mut cols = Array2::<f32>::zeros((oh * ow, KERNEL * KERNEL * c));
        for y in 0..oh {
            for x in 0..ow {
                let mut row = cols.row_mut(y * ow + x);
                for ky in 0..KERNEL {
                    for kx in 0..KERNEL {
                        let offset = (ky * KERNEL + kx) * c;
                        row.slice_mut(s![offset..offset + c])
                            .assign(&input.slice(s![y + ky, x + kx, ..]));
                    }
                }
            }
        }

        let mut out = cols.dot(&self.kernel) + &self.bias;
        out.mapv_inplace(|v| v.max(0.0));
        let out_channels = self.kernel.ncols();
        out.into_shape_with_order((oh, ow, out_channels))
            .map_err(|e| NetworkError::Forward(e.to_string()))
    }
}

struct Dense {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl Dense {
    fn new(rng: &mut StdRng, inputs: usize, outputs: usize) -> Self {
        Self {
            weights: glorot_uniform(rng, inputs, outputs),
            bias: Array1::zeros(outputs),
        }
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    fn forward(&self, input: &Array1<f32>) -> Array1<f32> {
        input.dot(&self.weights) + &self.bias
    }
}

fn glorot_uniform(rng: &mut StdRng, fan_in: usize, fan_out: usize) -> Array2<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Array2::from_shape_simple_fn((fan_in, fan_out), || rng.random_range(-limit..limit))
}

/// 2x2 max pooling with stride 2; odd trailing rows/columns are dropped.
fn max_pool(input: &Array3<f32>) -> Array3<f32> {
    let (h, w, c) = input.dim();
    let (oh, ow) = (h / 2, w / 2);
    Array3::from_shape_fn((oh, ow, c), |(y, x, ch)| {
        let (y0, x0) = (y * 2, x * 2);
        input[[y0, x0, ch]]
            .max(input[[y0, x0 + 1, ch]])
            .max(input[[y0 + 1, x0, ch]])
            .max(input[[y0 + 1, x0 + 1, ch]])
    })
}

/// Conv32-Pool-Conv64-Pool-Conv128-Pool-Conv128-Pool-Flatten-Dense512-Dense10-softmax.
/// Dropout layers of the trained topology are identity at inference time.
pub struct FallbackCnn {
    convs: Vec<Conv2d>,
    hidden: Dense,
    output: Dense,
}

impl FallbackCnn {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut convs = Vec::with_capacity(CONV_FILTERS.len());
        let mut in_channels = CHANNELS;
        let mut side = INPUT_SIZE as usize;
        for &filters in &CONV_FILTERS {
            convs.push(Conv2d::new(&mut rng, in_channels, filters));
            in_channels = filters;
            side = (side - KERNEL + 1) / 2;
        }

        let flattened = side * side * in_channels;
        let hidden = Dense::new(&mut rng, flattened, HIDDEN_UNITS);
        let output = Dense::new(&mut rng, HIDDEN_UNITS, DiseaseLabel::COUNT);
        Self {
            convs,
            hidden,
            output,
        }
    }

    fn forward_one(&self, image: ArrayView3<f32>) -> Result<Vec<f32>, NetworkError> {
        let mut features = max_pool(&self.convs[0].forward(image)?);
        for conv in &self.convs[1..] {
            features = max_pool(&conv.forward(features.view())?);
        }

        let flat = Array1::from_iter(features.iter().copied());
        if flat.len() != self.hidden.weights.nrows() {
            return Err(NetworkError::InvalidInput(format!(
                "flattened features have {} values, expected {}",
                flat.len(),
                self.hidden.weights.nrows()
            )));
        }
        let hidden = self.hidden.forward(&flat).mapv(|v| v.max(0.0));
        let logits = self.output.forward(&hidden).to_vec();
        Ok(softmax(&logits))
    }
}

impl Network for FallbackCnn {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, NetworkError> {
        let (batch, h, w, c) = input.dim();
        if c != CHANNELS {
            return Err(NetworkError::InvalidInput(format!(
                "expected {CHANNELS} channels, got {c}"
            )));
        }
        if h != INPUT_SIZE as usize || w != INPUT_SIZE as usize {
            return Err(NetworkError::InvalidInput(format!(
                "expected {INPUT_SIZE}x{INPUT_SIZE} input, got {h}x{w}"
            )));
        }

        let mut output = Vec::with_capacity(batch * DiseaseLabel::COUNT);
        for image in input.outer_iter() {
            output.extend(self.forward_one(image)?);
        }
        Ok(output)
    }

    fn parameter_count(&self) -> u64 {
        let convs: usize = self.convs.iter().map(Conv2d::parameter_count).sum();
        (convs + self.hidden.parameter_count() + self.output.parameter_count()) as u64
    }
}

/// Last link of the loading chain.
pub struct FreshFallbackNetwork {
    seed: u64,
}

impl FreshFallbackNetwork {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl LoadStrategy for FreshFallbackNetwork {
    fn kind(&self) -> LoadStrategyKind {
        LoadStrategyKind::FreshFallbackNetwork
    }

    fn attempt(
        &self,
        _artifact: Option<&Path>,
        _previous: Option<&LoadError>,
    ) -> Result<LoadedNetwork, LoadError> {
        Ok(LoadedNetwork::new(
            Box::new(FallbackCnn::new(self.seed)),
            ModelProvenance::Untrained,
        ))
    }
}
