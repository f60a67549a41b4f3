use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::models::BackboneInfo;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Backbone not downloaded: {0}")]
    NotDownloaded(String),
    #[error("No weights source configured for {name}: set {variable}; {hint}")]
    SourceNotConfigured {
        name: String,
        variable: &'static str,
        hint: &'static str,
    },
    #[error("Download error: {0}")]
    DownloadError(#[from] reqwest::Error),
    #[error("Download of {url} failed with HTTP status {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Backbone verification failed")]
    VerificationFailed,
    #[error("Hash mismatch: expected {expected}, got {actual} for {name} weights")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

/// Local cache of pretrained backbone weights.
#[derive(Clone, Debug)]
pub struct ModelManager {
    models_dir: PathBuf,
    download_lock: Arc<Mutex<()>>,
}

impl ModelManager {
    /// Creates a new ModelManager with the default models directory
    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::get_default_models_dir())
    }

    /// Returns the default models directory path
    pub fn get_default_models_dir() -> PathBuf {
        // 1. Check environment variable
        if let Ok(path) = env::var("FINETUNE_CACHE") {
            return PathBuf::from(path).join("models");
        }

        // 2. Use platform-specific cache directory
        if let Some(cache_dir) = dirs::cache_dir() {
            return cache_dir.join("finetune").join("models");
        }

        // 3. Fallback to user's home directory
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".cache").join("finetune").join("models");
        }

        // 4. If all else fails, use system temp directory
        env::temp_dir().join("finetune").join("models")
    }

    pub fn new<P: AsRef<Path>>(models_dir: P) -> io::Result<Self> {
        let models_dir = models_dir.as_ref().to_path_buf();
        fs::create_dir_all(&models_dir)?;
        Ok(Self {
            models_dir,
            download_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get_model_path(&self, name: &str) -> PathBuf {
        self.models_dir.join(name).join("model.onnx")
    }

    pub fn is_backbone_downloaded(&self, name: &str) -> bool {
        let model_path = self.get_model_path(name);
        log::debug!("Backbone path: {:?} (exists: {})", model_path, model_path.exists());
        model_path.exists()
    }

    /// Downloads the backbone weights, reusing an existing file that passes
    /// verification. A failed download leaves no partial file behind.
    pub async fn download_backbone(&self, info: &BackboneInfo) -> Result<(), FetchError> {
        let _lock = self.download_lock.lock().await;

        let model_dir = self.models_dir.join(&info.name);
        log::info!("Creating backbone directory at {:?}", model_dir);
        fs::create_dir_all(&model_dir)?;

        let result = self.reuse_or_download(info).await;

        if let Err(e) = &result {
            log::error!("Failed to set up weights for '{}': {}", info.name, e);
            if let Err(cleanup) = self.remove_download(&info.name) {
                log::warn!(
                    "Could not remove partial weights for '{}' at {:?}: {}",
                    info.name,
                    self.get_model_path(&info.name),
                    cleanup
                );
            }
        }
        result
    }

    async fn reuse_or_download(&self, info: &BackboneInfo) -> Result<(), FetchError> {
        let model_path = self.get_model_path(&info.name);
        if !model_path.exists() {
            log::info!("Weights file does not exist, downloading...");
            return self.download_and_verify_file(info, &model_path).await;
        }
        log::info!("Weights file exists at {:?}, verifying...", model_path);
        if self.verify_file(&model_path, info.model_hash.as_deref())? {
            log::info!("Existing weights file verified successfully");
            Ok(())
        } else {
            log::warn!("Weights file verification failed, redownloading");
            self.download_and_verify_file(info, &model_path).await
        }
    }

    fn verify_file(&self, path: &Path, expected_hash: Option<&str>) -> Result<bool, FetchError> {
        let Some(expected_hash) = expected_hash else {
            log::warn!("No checksum recorded for {:?}; skipping verification", path);
            return Ok(true);
        };
        let bytes = fs::read(path)?;
        let hash = sha256_hex(&bytes);
        log::debug!("Calculated hash: {} (expected {})", hash, expected_hash);
        Ok(hash == normalise_hex(expected_hash))
    }

    pub fn verify_backbone(&self, info: &BackboneInfo) -> Result<bool, FetchError> {
        let model_path = self.get_model_path(&info.name);
        if !model_path.exists() {
            log::info!("Weights file {:?} does not exist", model_path);
            return Ok(false);
        }
        self.verify_file(&model_path, info.model_hash.as_deref())
    }

    async fn download_and_verify_file(&self, info: &BackboneInfo, path: &Path) -> Result<(), FetchError> {
        log::info!("Downloading {} weights from {} to {:?}", info.name, info.model_url, path);
        let response = reqwest::get(&info.model_url).await?;
        let status = response.status();
        log::info!("Download response status: {}", status);
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: info.model_url.clone(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await?;
        log::info!("Downloaded {} bytes", bytes.len());

        if let Some(expected) = info.model_hash.as_deref() {
            let hash = sha256_hex(&bytes);
            if hash != normalise_hex(expected) {
                log::error!("{} hash mismatch: expected {}, got {}", info.name, expected, hash);
                return Err(FetchError::HashMismatch {
                    name: info.name.clone(),
                    expected: expected.to_string(),
                    actual: hash,
                });
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &bytes)?;

        if !self.verify_file(path, info.model_hash.as_deref())? {
            return Err(FetchError::VerificationFailed);
        }

        log::info!("{} weights downloaded and verified successfully", info.name);
        Ok(())
    }

    pub fn remove_download(&self, name: &str) -> Result<(), FetchError> {
        let model_path = self.get_model_path(name);
        if model_path.exists() {
            fs::remove_file(&model_path)?;
        }
        Ok(())
    }

    /// Ensures that the backbone weights are downloaded and verified.
    /// If they don't exist, they will be downloaded.
    /// If verification fails, they will be re-downloaded.
    pub async fn ensure_backbone_downloaded(&self, info: &BackboneInfo) -> Result<(), FetchError> {
        log::info!("Checking if backbone '{}' is downloaded...", info.name);
        if !self.is_backbone_downloaded(&info.name) {
            self.download_backbone(info).await?;
        } else if !self.verify_backbone(info)? {
            log::info!("Backbone verification failed, re-downloading...");
            self.remove_download(&info.name)?;
            self.download_backbone(info).await?;
        }
        Ok(())
    }

    /// Returns the weights path, failing if they have not been fetched yet.
    pub fn require_backbone(&self, name: &str) -> Result<PathBuf, FetchError> {
        if self.is_backbone_downloaded(name) {
            Ok(self.get_model_path(name))
        } else {
            Err(FetchError::NotDownloaded(name.to_string()))
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn normalise_hex(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, hash: Option<&str>) -> BackboneInfo {
        BackboneInfo {
            name: name.to_string(),
            model_url: "http://127.0.0.1:9/model.onnx".to_string(),
            model_hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn test_default_models_dir() {
        // Test with environment variable
        env::set_var("FINETUNE_CACHE", "/tmp/finetune-test-cache");
        let path = ModelManager::get_default_models_dir();
        assert!(path.to_str().unwrap().contains("/tmp/finetune-test-cache/models"));
        env::remove_var("FINETUNE_CACHE");

        // Test without environment variable
        let path = ModelManager::get_default_models_dir();
        assert!(path.to_str().unwrap().contains("finetune"));
    }

    #[test]
    fn test_verify_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path()).unwrap();
        let path = manager.get_model_path("tiny");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"weights").unwrap();

        let good = sha256_hex(b"weights").to_uppercase();
        assert!(manager.verify_backbone(&info("tiny", Some(&good))).unwrap());
        assert!(!manager.verify_backbone(&info("tiny", Some("deadbeef"))).unwrap());
        assert!(manager.verify_backbone(&info("tiny", None)).unwrap());
    }

    #[test]
    fn test_failed_download_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path()).unwrap();
        let result = tokio_test::block_on(manager.download_backbone(&info("unreachable", None)));
        assert!(result.is_err());
        assert!(!manager.is_backbone_downloaded("unreachable"));
        assert!(matches!(manager.require_backbone("unreachable"), Err(FetchError::NotDownloaded(_))));
    }

    #[test]
    fn test_failed_cleanup_keeps_original_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path()).unwrap();
        // A directory where the weights file should be: reading it fails and so
        // does removing it as a file
        let path = manager.get_model_path("blocked");
        fs::create_dir_all(&path).unwrap();

        let result = tokio_test::block_on(manager.download_backbone(&info("blocked", Some("00"))));
        assert!(matches!(result, Err(FetchError::IoError(_))));
        assert!(path.exists());
    }
}
