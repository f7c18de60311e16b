use std::path::PathBuf;

use crate::config::ModelConfig;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No model artifact found (checked: {})", display_paths(.checked))]
    ArtifactNotFound { checked: Vec<PathBuf> },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Picks the artifact to load: the compatible export first, then legacy files in order.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    compatible: PathBuf,
    legacy: Vec<PathBuf>,
}

impl ModelResolver {
    pub fn new(compatible: PathBuf, legacy: Vec<PathBuf>) -> Self {
        Self { compatible, legacy }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.compatible_path.clone(), config.legacy_paths.clone())
    }

    pub fn compatible_path(&self) -> &PathBuf {
        &self.compatible
    }

    pub fn candidates(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.compatible).chain(self.legacy.iter())
    }

    pub fn resolve(&self) -> Result<PathBuf, ResolveError> {
        for (i, candidate) in self.candidates().enumerate() {
            if candidate.is_file() {
                if i == 0 {
                    log::info!("Using compatible model {}", candidate.display());
                } else {
                    log::warn!(
                        "Compatible model not found, using legacy model {}",
                        candidate.display()
                    );
                }
                return Ok(candidate.clone());
            }
        }
        Err(ResolveError::ArtifactNotFound {
            checked: self.candidates().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_compatible_over_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let compatible = dir.path().join("model-compatible.pt");
        let legacy = dir.path().join("model.safetensors");
        std::fs::write(&compatible, b"x").unwrap();
        std::fs::write(&legacy, b"y").unwrap();

        let resolver = ModelResolver::new(compatible.clone(), vec![legacy]);
        assert_eq!(resolver.resolve().unwrap(), compatible);
    }

    #[test]
    fn falls_through_legacy_paths_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.safetensors");
        let second = dir.path().join("second.safetensors");
        let third = dir.path().join("third.safetensors");
        std::fs::write(&second, b"y").unwrap();
        std::fs::write(&third, b"z").unwrap();

        let resolver = ModelResolver::new(
            dir.path().join("model-compatible.pt"),
            vec![missing, second.clone(), third],
        );
        assert_eq!(resolver.resolve().unwrap(), second);
    }

    #[test]
    fn directories_do_not_count_as_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf(), vec![]);
        assert!(resolver.resolve().is_err());
    }

    #[test]
    fn reports_every_checked_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pt");
        let b = dir.path().join("b.safetensors");
        let resolver = ModelResolver::new(a.clone(), vec![b.clone()]);

        let ResolveError::ArtifactNotFound { checked } = resolver.resolve().unwrap_err();
        assert_eq!(checked, vec![a, b]);
    }
}
