//! Pipeline stages.
//!
//! A stage is one bounded unit of work that owns a slice of overall
//! progress. External tools go through [`ToolStage`]; work done in-process
//! (image normalization, point transplant, format export) has its own stage
//! type.

mod export;
mod inputs;
mod tool;
mod training;
mod transplant;

pub use export::{MeshExport, ModelExport};
pub use inputs::{InputManifest, InputView, PrepareInputs, list_input_images};
pub use tool::{Placeholder, PostStep, ToolStage, nest_dense_model};
pub use training::{ModelTraining, trained_model_path};
pub use transplant::DenseTransplant;

use crate::capability::BackendKind;
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::layout::RunLayout;
use crate::process::{ProcessOutput, ToolInvocation, ToolRunner};
use crate::progress::{ProgressParser, ProgressWindow, StageProgress};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Synthetic progress ticks per simulated tool invocation.
pub const SIMULATED_TICKS: u32 = 4;

/// Whether external tools are really invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Real,
    /// Tools are replaced by a sleep plus placeholder outputs.
    Simulated,
}

/// Everything a run resolves once, shared read-only by its stages.
pub struct RunEnv {
    pub layout: RunLayout,
    pub config: PipelineConfig,
    pub runner: Arc<dyn ToolRunner>,
    pub mode: ExecutionMode,
    pub backend: BackendKind,
    pub accelerated: bool,
}

pub struct StageContext<'a> {
    pub env: &'a RunEnv,
    pub progress: StageProgress<'a>,
}

impl StageContext<'_> {
    pub fn layout(&self) -> &RunLayout {
        &self.env.layout
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.env.config
    }

    pub fn is_simulated(&self) -> bool {
        self.env.mode == ExecutionMode::Simulated
    }

    /// Stand-in for a tool run: fixed sleeps with evenly spaced progress.
    pub async fn simulate(&mut self, what: &str) -> Result<(), StageError> {
        let step = Duration::from_millis(self.env.config.simulated_step_ms);
        for tick in 1..=SIMULATED_TICKS {
            tokio::time::sleep(step).await;
            let internal = (tick * 100 / SIMULATED_TICKS) as u8;
            self.progress
                .report(internal, format!("{what} (simulated)"))
                .await?;
        }
        Ok(())
    }

    /// Run a tool, turning its output into progress with `parser`.
    ///
    /// Returning early (cancellation, a failed event send) drops the run
    /// future, which kills the child.
    pub async fn run_tool(
        &mut self,
        invocation: &ToolInvocation,
        parser: Option<&dyn ProgressParser>,
    ) -> Result<ProcessOutput, StageError> {
        let runner = Arc::clone(&self.env.runner);
        let Some(parser) = parser else {
            return Ok(runner.run(invocation, None).await?);
        };

        let tool = invocation.tool_name();
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let run = runner.run(invocation, Some(tx));
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(line) = rx.recv() => {
                    if let Some(p) = parser.parse_progress(&line) {
                        self.progress.report(p, format!("{tool}: {p}%")).await?;
                    }
                }
            }
        };
        while let Ok(line) = rx.try_recv() {
            if let Some(p) = parser.parse_progress(&line) {
                self.progress.report(p, format!("{tool}: {p}%")).await?;
            }
        }
        Ok(result?)
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError>;
}

/// A named stage with its progress window and start message.
pub struct StageDescriptor {
    pub name: &'static str,
    pub label: &'static str,
    pub window: ProgressWindow,
    pub stage: Box<dyn Stage>,
}

impl StageDescriptor {
    pub fn new(
        name: &'static str,
        label: &'static str,
        window: ProgressWindow,
        stage: impl Stage + 'static,
    ) -> Self {
        Self {
            name,
            label,
            window,
            stage: Box::new(stage),
        }
    }
}

impl std::fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("window", &self.window)
            .finish()
    }
}
