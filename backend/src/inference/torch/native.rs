use ndarray::Array4;
use shared::{LoadStrategyKind, ModelProvenance};
use std::path::Path;
use std::sync::Mutex;
use tch::{CModule, Device};

use super::{strategy_failed, to_tensor, to_vec};
use crate::inference::loader::{LoadError, LoadStrategy, LoadedNetwork};
use crate::inference::network::{Network, NetworkError};

/// A TorchScript module: architecture and weights in one file.
pub struct TorchScriptNetwork {
    module: Mutex<CModule>,
    device: Device,
    parameters: u64,
}

impl Network for TorchScriptNetwork {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, NetworkError> {
        let tensor = to_tensor(input, self.device)?;
        let module = self
            .module
            .lock()
            .map_err(|_| NetworkError::Forward("model lock poisoned".into()))?;
        let output = tch::no_grad(|| module.forward_ts(&[tensor]))
            .map_err(|e| NetworkError::Forward(e.to_string()))?;
        to_vec(&output)
    }

    fn parameter_count(&self) -> u64 {
        self.parameters
    }
}

/// Loads the artifact as TorchScript with no custom layer definitions.
pub struct NativeLoad {
    device: Device,
}

impl NativeLoad {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl LoadStrategy for NativeLoad {
    fn kind(&self) -> LoadStrategyKind {
        LoadStrategyKind::NativeLoad
    }

    fn attempt(
        &self,
        artifact: Option<&Path>,
        _previous: Option<&LoadError>,
    ) -> Result<LoadedNetwork, LoadError> {
        let kind = self.kind();
        let path = artifact.ok_or_else(|| LoadError::NotApplicable {
            strategy: kind,
            reason: "no artifact".into(),
        })?;

        let mut module =
            CModule::load_on_device(path, self.device).map_err(|e| strategy_failed(kind, e))?;
        module.set_eval();
        let parameters = module
            .named_parameters()
            .map(|params| params.iter().map(|(_, t)| t.numel() as u64).sum())
            .unwrap_or(0);

        let network = TorchScriptNetwork {
            module: Mutex::new(module),
            device: self.device,
            parameters,
        };
        Ok(LoadedNetwork::new(Box::new(network), ModelProvenance::Trained))
    }
}
