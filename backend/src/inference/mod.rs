pub mod fallback;
pub mod handle;
pub mod loader;
pub mod network;
pub mod postprocess;
pub mod preprocess;
pub mod service;
#[cfg(feature = "torch")]
pub mod torch;

pub use handle::ModelHandle;
pub use loader::{LoadError, LoadedModel, ModelLoader};
pub use service::{InferenceError, InferenceService, PredictionResult};
