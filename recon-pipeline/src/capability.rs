//! Backend and accelerator detection.

use crate::config::PipelineConfig;
use crate::process::{ToolError, ToolInvocation, ToolRunner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tool family used for model training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Reference gaussian-splatting trainer (Python, CUDA).
    Primary,
    /// Standalone splat trainer binary.
    Secondary,
    /// No external tools at all; placeholder artifacts only.
    Simulated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Primary => write!(f, "primary"),
            BackendKind::Secondary => write!(f, "secondary"),
            BackendKind::Simulated => write!(f, "simulated"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(BackendKind::Primary),
            "secondary" => Ok(BackendKind::Secondary),
            "simulated" | "mock" => Ok(BackendKind::Simulated),
            other => Err(format!(
                "unknown backend '{other}', expected primary, secondary or simulated"
            )),
        }
    }
}

/// Why a backend is not usable. Only ever logged.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("entry script {} not found", path.display())]
    MissingEntryScript { path: PathBuf },

    #[error("probe of {program} failed: {source}")]
    Tool {
        program: String,
        #[source]
        source: ToolError,
    },
}

pub struct CapabilityDetector {
    runner: Arc<dyn ToolRunner>,
    config: PipelineConfig,
}

impl CapabilityDetector {
    pub fn new(runner: Arc<dyn ToolRunner>, config: &PipelineConfig) -> Self {
        Self {
            runner,
            config: config.clone(),
        }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.config.probe_timeout_ms)
    }

    /// Entry script of the primary trainer.
    pub fn primary_entry_script(&self) -> PathBuf {
        self.config.primary_trainer_dir.join("train.py")
    }

    pub async fn probe_primary(&self) -> Result<BackendKind, ProbeError> {
        let path = self.primary_entry_script();
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(BackendKind::Primary),
            _ => Err(ProbeError::MissingEntryScript { path }),
        }
    }

    pub async fn probe_secondary(&self) -> Result<BackendKind, ProbeError> {
        let program = &self.config.secondary_trainer;
        let invocation = ToolInvocation::new(program.as_str())
            .arg("--help")
            .timeout(self.probe_timeout());
        self.runner
            .run(&invocation, None)
            .await
            .map(|_| BackendKind::Secondary)
            .map_err(|source| ProbeError::Tool {
                program: program.clone(),
                source,
            })
    }

    /// Resolve the training backend.
    ///
    /// A configured override is returned as-is without probing. Otherwise
    /// Primary, then Secondary, then Simulated.
    #[tracing::instrument(skip_all)]
    pub async fn detect_backend(&self) -> BackendKind {
        if let Some(forced) = self.config.backend {
            info!("Backend forced by configuration: {}", forced);
            return forced;
        }

        match self.probe_primary().await {
            Ok(kind) => {
                info!("Detected backend: {}", kind);
                return kind;
            }
            Err(e) => debug!("Primary backend unavailable: {}", e),
        }
        match self.probe_secondary().await {
            Ok(kind) => {
                info!("Detected backend: {}", kind);
                return kind;
            }
            Err(e) => debug!("Secondary backend unavailable: {}", e),
        }

        warn!("No training backend found, falling back to simulated mode");
        BackendKind::Simulated
    }

    /// Whether GPU flags should be passed to tools.
    ///
    /// A configured value wins. Probe failures mean `false`.
    #[tracing::instrument(skip_all)]
    pub async fn has_accelerated_compute(&self) -> bool {
        if let Some(forced) = self.config.use_acceleration {
            return forced;
        }
        let invocation = ToolInvocation::new(self.config.accel_probe_binary.as_str())
            .arg("-L")
            .timeout(self.probe_timeout());
        match self.runner.run(&invocation, None).await {
            Ok(_) => {
                info!("Accelerated compute available");
                true
            }
            Err(e) => {
                debug!("No accelerated compute: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Records invocations; succeeds only for programs in `available`.
    struct SpyRunner {
        available: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl SpyRunner {
        fn new(available: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                available,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolRunner for SpyRunner {
        async fn run(
            &self,
            invocation: &ToolInvocation,
            _lines: Option<mpsc::Sender<String>>,
        ) -> Result<ProcessOutput, ToolError> {
            self.calls.lock().unwrap().push(invocation.display());
            if self.available.contains(&invocation.program.as_str()) {
                Ok(ProcessOutput::default())
            } else {
                Err(ToolError::Spawn {
                    tool: invocation.tool_name(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
        }
    }

    fn config_without_primary() -> PipelineConfig {
        PipelineConfig {
            primary_trainer_dir: PathBuf::from("/nonexistent/recon-trainer"),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_override_wins_without_probing() {
        for forced in [
            BackendKind::Primary,
            BackendKind::Secondary,
            BackendKind::Simulated,
        ] {
            let spy = SpyRunner::new(vec!["opensplat"]);
            let config = PipelineConfig {
                backend: Some(forced),
                ..config_without_primary()
            };
            let detector = CapabilityDetector::new(spy.clone(), &config);
            assert_eq!(detector.detect_backend().await, forced);
            assert!(spy.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_primary_found_by_entry_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.py"), "# trainer").unwrap();
        let spy = SpyRunner::new(vec![]);
        let config = PipelineConfig {
            primary_trainer_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let detector = CapabilityDetector::new(spy.clone(), &config);
        assert_eq!(detector.detect_backend().await, BackendKind::Primary);
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_to_secondary_then_simulated() {
        let spy = SpyRunner::new(vec!["opensplat"]);
        let detector = CapabilityDetector::new(spy.clone(), &config_without_primary());
        assert_eq!(detector.detect_backend().await, BackendKind::Secondary);
        assert_eq!(spy.calls(), ["opensplat --help"]);

        let spy = SpyRunner::new(vec![]);
        let detector = CapabilityDetector::new(spy, &config_without_primary());
        assert_eq!(detector.detect_backend().await, BackendKind::Simulated);
    }

    #[tokio::test]
    async fn test_acceleration_probe_failure_is_false() {
        let spy = SpyRunner::new(vec![]);
        let detector = CapabilityDetector::new(spy.clone(), &PipelineConfig::default());
        assert!(!detector.has_accelerated_compute().await);
        assert_eq!(spy.calls(), ["nvidia-smi -L"]);

        let spy = SpyRunner::new(vec!["nvidia-smi"]);
        let detector = CapabilityDetector::new(spy, &PipelineConfig::default());
        assert!(detector.has_accelerated_compute().await);
    }

    #[tokio::test]
    async fn test_forced_acceleration_skips_probe() {
        let spy = SpyRunner::new(vec!["nvidia-smi"]);
        let config = PipelineConfig {
            use_acceleration: Some(false),
            ..PipelineConfig::default()
        };
        let detector = CapabilityDetector::new(spy.clone(), &config);
        assert!(!detector.has_accelerated_compute().await);
        assert!(spy.calls().is_empty());
    }

    #[test]
    fn test_backend_parse_and_display() {
        for kind in [
            BackendKind::Primary,
            BackendKind::Secondary,
            BackendKind::Simulated,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>(), Ok(kind));
        }
        assert!("gpu".parse::<BackendKind>().is_err());
    }
}
