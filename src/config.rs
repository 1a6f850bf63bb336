//! Engine configuration.
//!
//! [`EngineConfig`] gathers the process-wide knobs: which device runs layer
//! kernels, which strategy performs matrix products, how many rayon threads
//! to use and the default log filter. It deserializes from JSON (every field
//! optional) and can be overridden from the environment:
//!
//! | variable        | field    | example        |
//! |-----------------|----------|----------------|
//! | `BRINY_DEVICE`  | `device` | `cpu`, `wgpu`  |
//! | `BRINY_GEMM`    | `gemm`   | `naive`, `blas`, `expr` |
//! | `BRINY_THREADS` | `threads`| `8`            |
//!
//! ```rust
//! use briny_nn::config::EngineConfig;
//! use briny_nn::backend::GemmBackend;
//!
//! let cfg = EngineConfig::from_json_str(r#"{ "gemm": "naive", "threads": 2 }"#).unwrap();
//! assert_eq!(cfg.gemm, GemmBackend::Naive);
//! assert_eq!(cfg.threads, Some(2));
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::{self, Backend, GemmBackend};
use crate::error::{Error, Result};

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Device for layer kernels.
    pub device: Backend,
    /// Matrix product strategy.
    pub gemm: GemmBackend,
    /// Size of the rayon global pool; rayon's default when `None`.
    pub threads: Option<usize>,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { device: Backend::Cpu, gemm: GemmBackend::Naive, threads: None, log_filter: "info".to_owned() }
    }
}

impl EngineConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    /// [`Error::Config`] on malformed JSON or unknown backend names.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    /// [`Error::Io`] if the file cannot be read, [`Error::Config`] if it
    /// does not parse.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&text)
    }

    /// Applies `BRINY_DEVICE`, `BRINY_GEMM` and `BRINY_THREADS` if set.
    ///
    /// # Errors
    /// [`Error::Config`] if a variable is set to an unparsable value.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("BRINY_DEVICE") {
            self.device = v.parse().map_err(Error::Config)?;
        }
        if let Some(v) = lookup("BRINY_GEMM") {
            self.gemm = v.parse().map_err(Error::Config)?;
        }
        if let Some(v) = lookup("BRINY_THREADS") {
            let n = v
                .trim()
                .parse::<usize>()
                .map_err(|e| Error::Config(format!("BRINY_THREADS='{v}': {e}")))?;
            self.threads = (n > 0).then_some(n);
        }
        Ok(self)
    }

    /// Confirms the selected device can run kernels.
    ///
    /// [`install`](Self::install) tolerates a missing accelerator; call this
    /// first to fail fast instead.
    ///
    /// # Errors
    /// [`Error::Device`] if `device` is `Wgpu` and no accelerator is usable.
    pub fn check_device(&self) -> Result<()> {
        match self.device {
            Backend::Cpu => Ok(()),
            Backend::Wgpu => crate::ops::accelerator_ready(),
        }
    }

    /// Makes these settings current for the whole process.
    ///
    /// Backends missing from this build are still recorded (dispatch falls
    /// back to the CPU paths) but produce a warning. The rayon pool can only
    /// be sized once per process; later attempts are logged and ignored.
    pub fn install(&self) {
        if !self.device.is_available() {
            tracing::warn!(device = %self.device, "device backend not compiled in, kernels will run on the CPU");
        }
        if !self.gemm.is_available() {
            tracing::warn!(gemm = %self.gemm, "gemm backend not compiled in, using the naive kernel");
        }
        backend::set_backend(self.device);
        backend::set_gemm_backend(self.gemm);

        if let Some(threads) = self.threads {
            if let Err(err) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
                tracing::warn!(threads, error = %err, "rayon pool already initialised");
            }
        }

        tracing::info!(device = %self.device, gemm = %self.gemm, threads = ?self.threads, "engine configured");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "device": "tpu" }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn serializes_lowercase_names() {
        let cfg = EngineConfig { device: Backend::Wgpu, gemm: GemmBackend::Expr, ..Default::default() };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains(r#""device":"wgpu""#));
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), cfg);
    }

    #[test]
    fn overrides_replace_fields() {
        let cfg = EngineConfig::default()
            .with_overrides(|key| match key {
                "BRINY_GEMM" => Some("ndarray".into()),
                "BRINY_THREADS" => Some("3".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.gemm, GemmBackend::Expr);
        assert_eq!(cfg.threads, Some(3));
        assert_eq!(cfg.device, Backend::Cpu);
    }

    #[test]
    fn cpu_device_always_checks_out() {
        assert!(EngineConfig::default().check_device().is_ok());
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn missing_accelerator_is_a_device_error() {
        let cfg = EngineConfig { device: Backend::Wgpu, ..Default::default() };
        assert!(matches!(cfg.check_device(), Err(Error::Device(_))));
    }

    #[test]
    fn bad_thread_count_is_rejected() {
        let err = EngineConfig::default()
            .with_overrides(|key| (key == "BRINY_THREADS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
