use actix_web::web;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::loader::{LoadedModel, ModelLoader};
use crate::artifact::ArtifactDownloader;

/// Load-once access to the active model, shared by every worker through `web::Data`.
///
/// The first caller runs the loader; concurrent callers wait for that same load.
/// `None` inside the cell means every strategy, including the fallback, failed.
#[derive(Clone)]
pub struct ModelHandle {
    cell: Arc<OnceCell<Option<Arc<LoadedModel>>>>,
    loader: Option<Arc<ModelLoader>>,
    downloader: Option<ArtifactDownloader>,
}

impl ModelHandle {
    pub fn new(loader: ModelLoader, downloader: Option<ArtifactDownloader>) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            loader: Some(Arc::new(loader)),
            downloader,
        }
    }

    pub fn from_model(model: LoadedModel) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(Some(Arc::new(model))))),
            loader: None,
            downloader: None,
        }
    }

    /// A handle whose model is permanently disabled.
    pub fn unavailable() -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(None))),
            loader: None,
            downloader: None,
        }
    }

    /// The model, loading it first if nobody has yet.
    ///
    /// The load runs in a detached task, so a caller that gives up (client
    /// disconnect, timeout) leaves it running for the next caller to join
    /// instead of restarting it.
    pub async fn get(&self) -> Option<Arc<LoadedModel>> {
        if let Some(model) = self.cell.get() {
            return model.clone();
        }

        let cell = self.cell.clone();
        let loader = self.loader.clone();
        let downloader = self.downloader.clone();
        let task = actix_web::rt::spawn(async move {
            cell.get_or_init(|| initialize(loader, downloader))
                .await
                .clone()
        });
        match task.await {
            Ok(model) => model,
            Err(e) => {
                log::error!("Model loading task was aborted: {}", e);
                None
            }
        }
    }

    /// The model if loading already finished, without triggering a load.
    pub fn loaded(&self) -> Option<Arc<LoadedModel>> {
        self.cell.get().cloned().flatten()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

async fn initialize(
    loader: Option<Arc<ModelLoader>>,
    downloader: Option<ArtifactDownloader>,
) -> Option<Arc<LoadedModel>> {
    let loader = loader?;

    if let Some(downloader) = &downloader {
        let resolver = loader.resolver();
        if resolver.resolve().is_err() {
            if let Err(e) = downloader.ensure(resolver.compatible_path()).await {
                log::error!("Model download failed: {}", e);
            }
        }
    }

    match web::block(move || loader.load()).await {
        Ok(Ok(model)) => Some(Arc::new(model)),
        Ok(Err(e)) => {
            log::error!("{}; inference is disabled for this process", e);
            None
        }
        Err(e) => {
            log::error!("Model loading task failed: {}", e);
            None
        }
    }
}
