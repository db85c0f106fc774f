//! Subcommand implementations.

use crate::RunArgs;
use recon_data::{PlyError, read_point_cloud, types::bounds};
use recon_pipeline::{
    CapabilityDetector, ConfigError, JobError, JobRegistry, PipelineConfig, PipelineError,
    ProgressEvent, SystemRunner,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("{}: {source}", path.display())]
    Ply {
        path: std::path::PathBuf,
        #[source]
        source: PlyError,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Environment first, then command-line overrides.
fn run_config(args: &RunArgs) -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(branch) = args.branch {
        config.branch = branch;
    }
    if let Some(backend) = args.backend {
        config.backend = Some(backend);
    }
    if args.fast {
        config.fast_mode = true;
    }
    if let Some(cap) = args.point_cap {
        config.point_cap = cap;
    }
    if let Some(dim) = args.max_dimension {
        config.max_image_dimension = dim;
    }
    if let Some(cap) = args.feature_cap {
        config.feature_cap = cap;
    }
    if args.no_acceleration {
        config.use_acceleration = Some(false);
    }
    Ok(config)
}

fn print_event(event: &ProgressEvent, json: bool) -> Result<(), AppError> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("[{:>3}%] {:<20} {}", event.percentage, event.stage, event.message);
    }
    Ok(())
}

pub async fn run(args: RunArgs) -> Result<(), AppError> {
    let config = run_config(&args)?;
    let registry = JobRegistry::new();
    let job = registry.create(&args.input, &args.output_root);
    info!("Job {} writing to {}", job.id, job.output_dir.display());

    registry.start(job.id)?;
    let mut handle = registry.orchestrator(&job, config).run();

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => {
                    if let Err(e) = registry.apply_progress(job.id, &event) {
                        registry.fail(job.id, e.to_string())?;
                        return Err(e.into());
                    }
                    print_event(&event, args.json)?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                // Dropping the handle on return kills any running tool.
                warn!("Interrupted, stopping the run");
                registry.fail(job.id, PipelineError::Cancelled.to_string())?;
                return Err(PipelineError::Cancelled.into());
            }
        }
    }

    let outcome = match handle.finish().await {
        Ok(outcome) => outcome,
        Err(e) => {
            registry.fail(job.id, e.to_string())?;
            return Err(e.into());
        }
    };
    let done = registry.complete(job.id, outcome.scene.clone())?;

    if args.json {
        println!("{}", serde_json::to_string(&done)?);
    } else {
        println!("Scene: {}", outcome.scene.display());
        for artifact in &outcome.artifacts {
            println!("  {}", artifact.display());
        }
    }
    Ok(())
}

pub async fn probe() -> Result<(), AppError> {
    let config = PipelineConfig::from_env()?;
    let detector = CapabilityDetector::new(Arc::new(SystemRunner), &config);
    let backend = detector.detect_backend().await;
    let accelerated = detector.has_accelerated_compute().await;
    println!("backend:      {}", backend);
    println!("acceleration: {}", if accelerated { "yes" } else { "no" });
    Ok(())
}

pub fn inspect(path: &Path) -> Result<(), AppError> {
    let ply_error = |source: PlyError| AppError::Ply {
        path: path.to_path_buf(),
        source,
    };
    let cloud = read_point_cloud(path).map_err(ply_error)?;
    let positions = cloud.positions().map_err(ply_error)?;

    println!("points: {}", cloud.len());
    println!("fields: {}", cloud.field_names().collect::<Vec<_>>().join(" "));
    match bounds(&positions) {
        Some((min, max)) => println!("bounds: {:?} .. {:?}", min.to_array(), max.to_array()),
        None => println!("bounds: (empty)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_data::{PlyField, synthetic::synthetic_point_cloud, write_points};

    #[test]
    fn test_inspect_synthetic_cloud() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.ply");
        write_points(&synthetic_point_cloud(64), PlyField::FULL, &path).unwrap();
        assert!(inspect(&path).is_ok());
    }

    #[test]
    fn test_inspect_missing_file() {
        let err = inspect(Path::new("/nonexistent/cloud.ply")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cloud.ply"));
    }
}
