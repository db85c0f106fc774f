//! One reconstruction run from input images to published artifacts.

use crate::capability::{BackendKind, CapabilityDetector};
use crate::config::{Branch, PipelineConfig};
use crate::error::PipelineError;
use crate::layout::RunLayout;
use crate::process::{SystemRunner, ToolRunner};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::sequencer::{StageSequencer, build_stages};
use crate::stage::{ExecutionMode, RunEnv, list_input_images};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

/// Events buffered between the run and its consumer before the run blocks.
const EVENT_BUFFER: usize = 16;

/// Stage name carried by the final 100% event.
pub const COMPLETE_STAGE: &str = "complete";

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub branch: Branch,
    /// Training backend, for the splat branch.
    pub trainer: Option<BackendKind>,
    pub mode: ExecutionMode,
    /// Textual scene description, the primary artifact.
    pub scene: PathBuf,
    pub artifacts: Vec<PathBuf>,
}

pub struct Orchestrator {
    layout: RunLayout,
    config: PipelineConfig,
    runner: Arc<dyn ToolRunner>,
}

impl Orchestrator {
    pub fn new(
        run_id: impl Into<String>,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            layout: RunLayout::new(run_id, input_dir, output_dir),
            config,
            runner: Arc::new(SystemRunner),
        }
    }

    /// Replace the process runner, e.g. with a recording one in tests.
    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Start the run on the current tokio runtime.
    ///
    /// Consumes the orchestrator: each run needs a fresh one.
    pub fn run(self) -> RunHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = info_span!("run", run_id = %self.layout.run_id);
        let task = tokio::spawn(self.execute(tx).instrument(span));
        RunHandle {
            events: rx,
            task: Some(task),
        }
    }

    async fn resolve_mode(&self, detector: &CapabilityDetector) -> (BackendKind, ExecutionMode) {
        match self.config.branch {
            Branch::Splat => {
                let backend = detector.detect_backend().await;
                if backend == BackendKind::Simulated {
                    if self.config.backend.is_none() {
                        warn!(
                            "Splat branch running in simulated mode; artifacts are placeholders"
                        );
                    }
                    (backend, ExecutionMode::Simulated)
                } else {
                    (backend, ExecutionMode::Real)
                }
            }
            // No trainer is involved, so only an explicit override simulates.
            Branch::Mesh => match self.config.backend {
                Some(BackendKind::Simulated) => (BackendKind::Simulated, ExecutionMode::Simulated),
                _ => (BackendKind::Primary, ExecutionMode::Real),
            },
        }
    }

    async fn execute(self, tx: mpsc::Sender<ProgressEvent>) -> Result<RunOutcome, PipelineError> {
        let result = self.execute_stages(tx).await;
        match &result {
            Ok(outcome) => info!("Run complete: {}", outcome.scene.display()),
            Err(PipelineError::Cancelled) => warn!("Run cancelled"),
            Err(e) => error!("Run failed: {}", e),
        }
        result
    }

    async fn execute_stages(
        self,
        tx: mpsc::Sender<ProgressEvent>,
    ) -> Result<RunOutcome, PipelineError> {
        let mut sink = ProgressSink::new(tx);
        let layout = self.layout.clone();
        layout.create_dirs()?;

        let has_images = match list_input_images(&layout.input_dir) {
            Ok(images) => !images.is_empty(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !has_images {
            return Err(PipelineError::NoInputImages {
                dir: layout.input_dir.clone(),
            });
        }

        let detector = CapabilityDetector::new(Arc::clone(&self.runner), &self.config);
        let (backend, mode) = self.resolve_mode(&detector).await;
        let accelerated = match mode {
            ExecutionMode::Simulated => false,
            ExecutionMode::Real => detector.has_accelerated_compute().await,
        };
        info!(
            "Branch {}, backend {}, mode {:?}, acceleration {}",
            self.config.branch, backend, mode, accelerated
        );

        let env = RunEnv {
            layout,
            config: self.config,
            runner: self.runner,
            mode,
            backend,
            accelerated,
        };
        let sequencer = StageSequencer::new(build_stages(&env));
        sequencer.run(&env, &mut sink).await?;

        let artifacts = env.layout.declared_artifacts(env.config.emit_binary_scene);
        verify_artifacts(&artifacts)?;

        sink.emit(100, COMPLETE_STAGE, "Model ready")
            .await
            .map_err(|_| PipelineError::Cancelled)?;

        Ok(RunOutcome {
            run_id: env.layout.run_id.clone(),
            branch: env.config.branch,
            trainer: (env.config.branch == Branch::Splat).then_some(backend),
            mode,
            scene: env.layout.scene_path(),
            artifacts,
        })
    }
}

/// Every declared artifact must be a regular file once the last stage ends.
fn verify_artifacts(artifacts: &[PathBuf]) -> Result<(), PipelineError> {
    match artifacts.iter().find(|path| !path.is_file()) {
        Some(path) => Err(PipelineError::OutputMissing { path: path.clone() }),
        None => Ok(()),
    }
}

/// Consumer side of a running pipeline.
///
/// Dropping the handle aborts the run; a tool that is still running is killed.
pub struct RunHandle {
    events: mpsc::Receiver<ProgressEvent>,
    task: Option<JoinHandle<Result<RunOutcome, PipelineError>>>,
}

impl RunHandle {
    /// Next progress event, or `None` once the run has ended.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Discard remaining events and wait for the result.
    pub async fn finish(mut self) -> Result<RunOutcome, PipelineError> {
        while self.events.recv().await.is_some() {}
        self.join().await
    }

    /// Collect every remaining event, then the result.
    pub async fn wait(mut self) -> (Vec<ProgressEvent>, Result<RunOutcome, PipelineError>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let result = self.join().await;
        (events, result)
    }

    async fn join(&mut self) -> Result<RunOutcome, PipelineError> {
        let Some(task) = self.task.take() else {
            return Err(PipelineError::Cancelled);
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(PipelineError::Cancelled),
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
