use crate::detector::DEFAULT_DETECTION_SIZE;
use crate::extractor::{EngineSlot, OnnxExtractor};
use crate::types::{Metric, DEFAULT_COSINE_THRESHOLD, DEFAULT_EUCLIDEAN_THRESHOLD};
use faceprint_store::{FsObjectStore, StoreError, UrlSigner};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings shared by the daemon, the worker and the CLI.
///
/// Loaded from an optional TOML file, then overridden by `FACEPRINT_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// SCRFD input size (square, multiple of 32).
    pub det_size: usize,
    /// Root directory of the filesystem object store.
    pub store_root: PathBuf,
    /// Base URL prepended to signed object links.
    pub public_url: String,
    /// Secret for signed URLs. A random per-process secret is used when unset.
    pub signing_secret: Option<String>,
    pub signed_url_ttl_secs: u64,
    /// SQLite task queue database.
    pub queue_path: PathBuf,
    pub bind_addr: String,
    /// Upper bound on request bodies (multipart uploads included).
    pub max_body_bytes: usize,
    pub poll_interval_ms: u64,
    /// Running tasks older than this are assumed abandoned.
    pub stale_after_secs: u64,
    pub max_attempts: u32,
    pub cosine_threshold: f32,
    pub euclidean_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            model_dir: default_model_dir(),
            det_size: DEFAULT_DETECTION_SIZE,
            store_root: data_dir.join("objects"),
            public_url: "http://127.0.0.1:8080".to_string(),
            signing_secret: None,
            signed_url_ttl_secs: 3600,
            queue_path: data_dir.join("queue.db"),
            bind_addr: "127.0.0.1:8080".to_string(),
            max_body_bytes: 32 * 1024 * 1024,
            poll_interval_ms: 1000,
            stale_after_secs: 15 * 60,
            max_attempts: 3,
            cosine_threshold: DEFAULT_COSINE_THRESHOLD,
            euclidean_threshold: DEFAULT_EUCLIDEAN_THRESHOLD,
        }
    }
}

impl Config {
    /// Load from `path`, else from `$FACEPRINT_CONFIG`, else defaults; then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FACEPRINT_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `FACEPRINT_*` overrides read through `lookup`. Unparseable
    /// values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);
        env.path("FACEPRINT_MODEL_DIR", &mut self.model_dir);
        env.parsed("FACEPRINT_DET_SIZE", &mut self.det_size);
        env.path("FACEPRINT_STORE_ROOT", &mut self.store_root);
        env.string("FACEPRINT_PUBLIC_URL", &mut self.public_url);
        if let Some(secret) = lookup("FACEPRINT_SIGNING_SECRET") {
            self.signing_secret = Some(secret);
        }
        env.parsed("FACEPRINT_SIGNED_URL_TTL_SECS", &mut self.signed_url_ttl_secs);
        env.path("FACEPRINT_QUEUE_PATH", &mut self.queue_path);
        env.string("FACEPRINT_BIND_ADDR", &mut self.bind_addr);
        env.parsed("FACEPRINT_MAX_BODY_BYTES", &mut self.max_body_bytes);
        env.parsed("FACEPRINT_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        env.parsed("FACEPRINT_STALE_AFTER_SECS", &mut self.stale_after_secs);
        env.parsed("FACEPRINT_MAX_ATTEMPTS", &mut self.max_attempts);
        env.parsed("FACEPRINT_COSINE_THRESHOLD", &mut self.cosine_threshold);
        env.parsed("FACEPRINT_EUCLIDEAN_THRESHOLD", &mut self.euclidean_threshold);
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    pub fn url_signer(&self) -> UrlSigner {
        match &self.signing_secret {
            Some(secret) => UrlSigner::new(
                secret.clone().into_bytes(),
                &self.public_url,
                self.signed_url_ttl_secs,
            ),
            None => UrlSigner::ephemeral(&self.public_url, self.signed_url_ttl_secs),
        }
    }

    pub fn open_store(&self) -> Result<FsObjectStore, StoreError> {
        FsObjectStore::open(&self.store_root, self.url_signer())
    }

    /// Engine slot that loads the configured SCRFD and ArcFace models on
    /// first use.
    pub fn engine_slot(&self) -> EngineSlot<OnnxExtractor> {
        let detector = self.scrfd_model_path();
        let recognizer = self.arcface_model_path();
        let det_size = self.det_size;
        EngineSlot::new(move || OnnxExtractor::load(&detector, &recognizer, det_size))
    }

    /// Configured default threshold for `metric`.
    pub fn threshold_for(&self, metric: Metric) -> f32 {
        match metric {
            Metric::Cosine => self.cosine_threshold,
            Metric::Euclidean => self.euclidean_threshold,
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, slot: &mut String) {
        if let Some(v) = (self.0)(key) {
            *slot = v;
        }
    }

    fn path(&self, key: &str, slot: &mut PathBuf) {
        if let Some(v) = (self.0)(key) {
            *slot = PathBuf::from(v);
        }
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, slot: &mut T) {
        if let Some(v) = (self.0)(key) {
            match v.parse() {
                Ok(parsed) => *slot = parsed,
                Err(_) => tracing::warn!(key, value = v, "ignoring unparseable override"),
            }
        }
    }
}

/// `$XDG_DATA_HOME/faceprint`, falling back to `~/.local/share/faceprint`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceprint")
}

pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}
