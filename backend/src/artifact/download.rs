use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {0} from model server")]
    Status(reqwest::StatusCode),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fetches a missing artifact into place before resolution.
#[derive(Clone)]
pub struct ArtifactDownloader {
    client: reqwest::Client,
    url: String,
}

impl ArtifactDownloader {
    /// `timeout` bounds the whole transfer; connecting is additionally capped at ten seconds.
    pub fn new(url: String, timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, url })
    }

    /// Downloads to `target` unless it already exists. The body is streamed to a
    /// sibling `.part` file that is renamed on completion.
    pub async fn ensure(&self, target: &Path) -> Result<bool, DownloadError> {
        if tokio::fs::try_exists(target).await? {
            log::info!("Model already exists at {}", target.display());
            return Ok(false);
        }
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        log::info!("Downloading model from {}", self.url);
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }

        let partial = partial_path(target);
        let result = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut stream = response.bytes_stream();
            let mut written = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len();
            }
            file.flush().await?;
            Ok::<usize, DownloadError>(written)
        }
        .await;

        match result {
            Ok(written) => {
                tokio::fs::rename(&partial, target).await?;
                log::info!("Downloaded {} bytes to {}", written, target.display());
                Ok(true)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_sits_next_to_target() {
        assert_eq!(
            partial_path(Path::new("required_files/model.pt")),
            PathBuf::from("required_files/model.pt.part")
        );
    }

    #[actix_web::test]
    async fn existing_target_is_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("model.pt");
        std::fs::write(&target, b"weights").unwrap();

        let downloader =
            ArtifactDownloader::new("http://127.0.0.1:9/unreachable".into(), Duration::from_secs(1))
                .unwrap();
        assert!(!downloader.ensure(&target).await.unwrap());
        assert_eq!(std::fs::read(&target).unwrap(), b"weights");
    }

    #[actix_web::test]
    async fn silent_server_times_out_instead_of_hanging() {
        // Accepts connections into the backlog but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/model.pt", listener.local_addr().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("model.pt");
        let downloader = ArtifactDownloader::new(url, Duration::from_millis(200)).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), downloader.ensure(&target))
            .await
            .expect("download should give up on its own");
        assert!(matches!(result, Err(DownloadError::Http(_))));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }
}
