//! Stage lists per branch and their strictly sequential execution.

use crate::config::{Branch, PipelineConfig};
use crate::error::{PipelineError, StageError};
use crate::layout::RunLayout;
use crate::process::ToolInvocation;
use crate::progress::{FractionParser, ProgressSink, StageProgress};
use crate::stage::{
    DenseTransplant, MeshExport, ModelExport, ModelTraining, Placeholder, PrepareInputs, RunEnv,
    StageContext, StageDescriptor, ToolStage, nest_dense_model, trained_model_path,
};
use tracing::{Instrument, info, info_span};

/// Points in the simulated fused cloud.
const SIMULATED_DENSE_POINTS: usize = 4096;

pub mod windows {
    use crate::progress::ProgressWindow;

    pub const PREPARE_INPUTS: ProgressWindow = ProgressWindow::new(0, 4);
    pub const FEATURE_EXTRACTION: ProgressWindow = ProgressWindow::new(5, 14);
    pub const FEATURE_MATCHING: ProgressWindow = ProgressWindow::new(15, 24);
    pub const POSE_RECOVERY: ProgressWindow = ProgressWindow::new(25, 36);
    pub const UNDISTORTION: ProgressWindow = ProgressWindow::new(37, 41);
    pub const DENSE_DEPTH: ProgressWindow = ProgressWindow::new(42, 61);
    pub const FUSION: ProgressWindow = ProgressWindow::new(62, 68);

    pub const MESH_GENERATION: ProgressWindow = ProgressWindow::new(69, 86);
    pub const MESH_EXPORT: ProgressWindow = ProgressWindow::new(87, 97);

    pub const DENSE_TRANSPLANT: ProgressWindow = ProgressWindow::new(69, 72);
    pub const MODEL_TRAINING: ProgressWindow = ProgressWindow::new(73, 93);
    pub const MODEL_EXPORT: ProgressWindow = ProgressWindow::new(94, 98);
}

fn gpu_flag(accelerated: bool) -> &'static str {
    if accelerated { "1" } else { "0" }
}

fn sfm(config: &PipelineConfig, command: &str) -> ToolInvocation {
    ToolInvocation::new(config.sfm_binary.as_str()).arg(command)
}

/// Stages shared by both branches: inputs through stereo fusion.
fn reconstruction_stages(
    layout: &RunLayout,
    config: &PipelineConfig,
    accelerated: bool,
) -> Vec<StageDescriptor> {
    let threads = config.num_threads;
    vec![
        StageDescriptor::new(
            "prepare-inputs",
            "Preparing images",
            windows::PREPARE_INPUTS,
            PrepareInputs,
        ),
        StageDescriptor::new(
            "feature-extraction",
            "Extracting features",
            windows::FEATURE_EXTRACTION,
            ToolStage::new(
                sfm(config, "feature_extractor")
                    .arg("--database_path")
                    .path_arg(layout.database_path())
                    .arg("--image_path")
                    .path_arg(layout.images_dir())
                    .flag("--ImageReader.single_camera", 1)
                    .flag("--SiftExtraction.use_gpu", gpu_flag(accelerated))
                    .flag("--SiftExtraction.max_num_features", config.feature_cap)
                    .flag("--SiftExtraction.num_threads", threads),
            )
            .parser(FractionParser)
            .output(layout.database_path())
            .placeholder(Placeholder::File(layout.database_path())),
        ),
        StageDescriptor::new(
            "feature-matching",
            "Matching features",
            windows::FEATURE_MATCHING,
            ToolStage::new(
                sfm(config, "exhaustive_matcher")
                    .arg("--database_path")
                    .path_arg(layout.database_path())
                    .flag("--SiftMatching.use_gpu", gpu_flag(accelerated))
                    .flag("--SiftMatching.num_threads", threads),
            )
            .parser(FractionParser)
            .output(layout.database_path()),
        ),
        StageDescriptor::new(
            "pose-recovery",
            "Recovering camera poses",
            windows::POSE_RECOVERY,
            ToolStage::new(
                sfm(config, "mapper")
                    .arg("--database_path")
                    .path_arg(layout.database_path())
                    .arg("--image_path")
                    .path_arg(layout.images_dir())
                    .arg("--output_path")
                    .path_arg(layout.sparse_dir())
                    .flag("--Mapper.num_threads", threads),
            )
            .output(layout.sparse_model_dir())
            .placeholder(Placeholder::Directory(layout.sparse_model_dir())),
        ),
        StageDescriptor::new(
            "undistortion",
            "Undistorting images",
            windows::UNDISTORTION,
            ToolStage::new(
                sfm(config, "image_undistorter")
                    .arg("--image_path")
                    .path_arg(layout.images_dir())
                    .arg("--input_path")
                    .path_arg(layout.sparse_model_dir())
                    .arg("--output_path")
                    .path_arg(layout.dense_dir())
                    .flag("--output_type", "COLMAP"),
            )
            .post(nest_dense_model)
            .output(layout.dense_sparse_dir())
            .placeholder(Placeholder::Directory(layout.dense_dir().join("images")))
            .placeholder(Placeholder::Directory(layout.dense_sparse_dir())),
        ),
        StageDescriptor::new(
            "dense-depth",
            "Computing depth maps",
            windows::DENSE_DEPTH,
            ToolStage::new(
                sfm(config, "patch_match_stereo")
                    .arg("--workspace_path")
                    .path_arg(layout.dense_dir())
                    .flag("--workspace_format", "COLMAP")
                    .flag("--PatchMatchStereo.geom_consistency", "true")
                    .flag("--PatchMatchStereo.window_radius", config.stereo_window_radius())
                    .flag("--PatchMatchStereo.num_iterations", config.stereo_iterations())
                    .flag("--PatchMatchStereo.gpu_index", if accelerated { "0" } else { "-1" }),
            )
            .parser(FractionParser)
            .placeholder(Placeholder::Directory(
                layout.dense_dir().join("stereo").join("depth_maps"),
            )),
        ),
        StageDescriptor::new(
            "fusion",
            "Fusing depth maps",
            windows::FUSION,
            ToolStage::new(
                sfm(config, "stereo_fusion")
                    .arg("--workspace_path")
                    .path_arg(layout.dense_dir())
                    .flag("--workspace_format", "COLMAP")
                    .flag("--input_type", "geometric")
                    .arg("--output_path")
                    .path_arg(layout.fused_cloud_path())
                    .flag("--StereoFusion.num_threads", threads),
            )
            .parser(FractionParser)
            .output(layout.fused_cloud_path())
            .placeholder(Placeholder::PointCloud {
                path: layout.fused_cloud_path(),
                points: SIMULATED_DENSE_POINTS,
            }),
        ),
    ]
}

/// The ordered stage list for the run's branch.
pub fn build_stages(env: &RunEnv) -> Vec<StageDescriptor> {
    let layout = &env.layout;
    let config = &env.config;
    let mut stages = reconstruction_stages(layout, config, env.accelerated);

    match config.branch {
        Branch::Mesh => {
            stages.push(StageDescriptor::new(
                "mesh-generation",
                "Generating mesh",
                windows::MESH_GENERATION,
                ToolStage::new(
                    sfm(config, "poisson_mesher")
                        .arg("--input_path")
                        .path_arg(layout.fused_cloud_path())
                        .arg("--output_path")
                        .path_arg(layout.mesh_path())
                        .flag("--PoissonMeshing.depth", config.poisson_depth())
                        .flag("--PoissonMeshing.num_threads", config.num_threads),
                )
                .output(layout.mesh_path())
                .placeholder(Placeholder::Mesh(layout.mesh_path())),
            ));
            stages.push(StageDescriptor::new(
                "mesh-export",
                "Exporting mesh",
                windows::MESH_EXPORT,
                MeshExport,
            ));
        }
        Branch::Splat => {
            let iterations = config.training_iterations();
            stages.push(StageDescriptor::new(
                "dense-transplant",
                "Transplanting dense points",
                windows::DENSE_TRANSPLANT,
                DenseTransplant,
            ));
            stages.push(StageDescriptor::new(
                "model-training",
                "Training model",
                windows::MODEL_TRAINING,
                ModelTraining::new(
                    env.backend,
                    layout,
                    &config.python_binary,
                    &config.primary_trainer_dir,
                    &config.secondary_trainer,
                    iterations,
                ),
            ));
            stages.push(StageDescriptor::new(
                "model-export",
                "Exporting model",
                windows::MODEL_EXPORT,
                ModelExport::new(trained_model_path(layout, env.backend, iterations)),
            ));
        }
    }
    stages
}

/// Runs stages one at a time, in order, stopping at the first failure.
#[derive(Debug)]
pub struct StageSequencer {
    stages: Vec<StageDescriptor>,
}

impl StageSequencer {
    pub fn new(stages: Vec<StageDescriptor>) -> Self {
        debug_assert!(windows_are_ordered(&stages));
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Every stage emits a start event, its own sub-progress, then an end event.
    pub async fn run(&self, env: &RunEnv, sink: &mut ProgressSink) -> Result<(), PipelineError> {
        for descriptor in &self.stages {
            let name = descriptor.name;
            let span = info_span!("stage", name);
            async {
                info!("Starting {}", name);
                let mut ctx = StageContext {
                    env,
                    progress: StageProgress::new(sink, name, descriptor.window),
                };
                ctx.progress.started(descriptor.label).await?;
                descriptor.stage.execute(&mut ctx).await?;
                ctx.progress.finished(format!("{} done", descriptor.label)).await?;
                info!("Finished {}", name);
                Ok::<(), StageError>(())
            }
            .instrument(span)
            .await
            .map_err(|e| PipelineError::from_stage(name, e))?;
        }
        Ok(())
    }
}

/// Windows are well-formed and each starts after the previous one ends.
pub fn windows_are_ordered(stages: &[StageDescriptor]) -> bool {
    stages.iter().all(|s| s.window.start <= s.window.end && s.window.end < 100)
        && stages
            .windows(2)
            .all(|pair| pair[0].window.end < pair[1].window.start)
}
