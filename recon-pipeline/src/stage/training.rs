//! Splat model training through whichever backend was resolved.

use crate::capability::BackendKind;
use crate::error::StageError;
use crate::layout::RunLayout;
use crate::process::{ToolInvocation, require_output};
use crate::progress::{IterationParser, PercentParser, ProgressParser};
use crate::stage::tool::Placeholder;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Gaussians written by the simulated trainer.
const SIMULATED_SPLATS: usize = 2048;

/// Where `backend` leaves the trained model.
pub fn trained_model_path(layout: &RunLayout, backend: BackendKind, iterations: u32) -> PathBuf {
    match backend {
        BackendKind::Primary => layout
            .training_dir()
            .join("point_cloud")
            .join(format!("iteration_{iterations}"))
            .join("point_cloud.ply"),
        BackendKind::Secondary | BackendKind::Simulated => layout.training_dir().join("splat.ply"),
    }
}

pub struct ModelTraining {
    backend: BackendKind,
    invocation: Option<ToolInvocation>,
    output: PathBuf,
    iterations: u32,
}

impl ModelTraining {
    /// Build the trainer command for `backend`. Simulated training has none.
    pub fn new(
        backend: BackendKind,
        layout: &RunLayout,
        python: &str,
        primary_dir: &std::path::Path,
        secondary: &str,
        iterations: u32,
    ) -> Self {
        let output = trained_model_path(layout, backend, iterations);
        let invocation = match backend {
            BackendKind::Primary => Some(
                ToolInvocation::new(python)
                    .path_arg(primary_dir.join("train.py"))
                    .arg("-s")
                    .path_arg(layout.dense_dir())
                    .arg("-m")
                    .path_arg(layout.training_dir())
                    .flag("--iterations", iterations)
                    .flag("--save_iterations", iterations)
                    .current_dir(primary_dir),
            ),
            BackendKind::Secondary => Some(
                ToolInvocation::new(secondary)
                    .path_arg(layout.dense_dir())
                    .flag("-n", iterations)
                    .arg("-o")
                    .path_arg(&output),
            ),
            BackendKind::Simulated => None,
        };
        Self {
            backend,
            invocation,
            output,
            iterations,
        }
    }

    pub fn invocation(&self) -> Option<&ToolInvocation> {
        self.invocation.as_ref()
    }

    fn parser(&self) -> Box<dyn ProgressParser> {
        match self.backend {
            BackendKind::Secondary => Box::new(IterationParser::new(self.iterations)),
            _ => Box::new(PercentParser),
        }
    }
}

#[async_trait]
impl Stage for ModelTraining {
    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        info!(
            "Training with {} backend for {} iterations",
            self.backend, self.iterations
        );
        match &self.invocation {
            Some(invocation) if !ctx.is_simulated() => {
                let parser = self.parser();
                ctx.run_tool(invocation, Some(parser.as_ref())).await?;
                require_output(&invocation.tool_name(), &self.output)?;
            }
            _ => {
                ctx.simulate("training").await?;
                Placeholder::Splat {
                    path: self.output.clone(),
                    points: SIMULATED_SPLATS,
                }
                .materialize()?;
            }
        }
        Ok(())
    }
}
