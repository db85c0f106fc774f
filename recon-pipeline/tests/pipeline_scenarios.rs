use async_trait::async_trait;
use recon_data::synthetic::{synthetic_mesh, synthetic_point_cloud, synthetic_splat_columns};
use recon_data::{
    PlyField, load_mesh_from_ply, read_point_cloud, write_columns, write_mesh_ply, write_points,
};
use recon_pipeline::orchestrator::COMPLETE_STAGE;
use recon_pipeline::sequencer::windows;
use recon_pipeline::{
    BackendKind, Branch, ExecutionMode, JobError, JobRegistry, JobStatus, Orchestrator,
    PipelineConfig, PipelineError, ProcessOutput, ProgressEvent, ProgressWindow, ToolError,
    ToolInvocation, ToolRunner,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Counts invocations and pretends every tool succeeded.
#[derive(Default)]
struct SpyRunner {
    calls: AtomicUsize,
}

#[async_trait]
impl ToolRunner for SpyRunner {
    async fn run(
        &self,
        _invocation: &ToolInvocation,
        _lines: Option<mpsc::Sender<String>>,
    ) -> Result<ProcessOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessOutput::default())
    }
}

/// Stands in for the photogrammetry and training tools: prints progress the
/// way they do and leaves behind the files each command produces.
#[derive(Default)]
struct FakeTools {
    commands: Mutex<Vec<String>>,
}

fn value_after<'a>(invocation: &'a ToolInvocation, flag: &str) -> &'a str {
    let at = invocation.args.iter().position(|a| a == flag).unwrap();
    &invocation.args[at + 1]
}

fn arg_after(invocation: &ToolInvocation, flag: &str) -> PathBuf {
    PathBuf::from(value_after(invocation, flag))
}

fn failure(invocation: &ToolInvocation, line: &str) -> ToolError {
    ToolError::Failed {
        tool: invocation.tool_name(),
        args: invocation.args.clone(),
        exit_code: Some(1),
        tail: vec![line.to_string()],
    }
}

/// The stereo tools read the flat model directly under the workspace.
fn require_stereo_model(invocation: &ToolInvocation) -> Result<(), ToolError> {
    let workspace = arg_after(invocation, "--workspace_path");
    if workspace.join("sparse").join("cameras.bin").is_file() {
        Ok(())
    } else {
        Err(failure(invocation, "no sparse model in workspace"))
    }
}

fn counter(label: &str, total: u32) -> Vec<String> {
    (1..=total).map(|i| format!("{label} [{i}/{total}]")).collect()
}

impl FakeTools {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn produce(&self, invocation: &ToolInvocation) -> Result<Vec<String>, ToolError> {
        let command = invocation.args.first().map(String::as_str).unwrap_or_default();
        let lines = match command {
            "feature_extractor" => {
                std::fs::write(arg_after(invocation, "--database_path"), b"db").unwrap();
                counter("Processed file", 4)
            }
            "exhaustive_matcher" => counter("Matching block", 3),
            "mapper" => {
                let model = arg_after(invocation, "--output_path").join("0");
                std::fs::create_dir_all(&model).unwrap();
                for name in ["cameras.bin", "images.bin", "points3D.bin"] {
                    std::fs::write(model.join(name), name).unwrap();
                }
                vec!["Registering image #4".to_string()]
            }
            "image_undistorter" => {
                let dense = arg_after(invocation, "--output_path");
                std::fs::create_dir_all(dense.join("images")).unwrap();
                std::fs::create_dir_all(dense.join("sparse")).unwrap();
                for name in ["cameras.bin", "images.bin", "points3D.bin"] {
                    std::fs::write(dense.join("sparse").join(name), name).unwrap();
                }
                Vec::new()
            }
            "patch_match_stereo" => {
                require_stereo_model(invocation)?;
                let workspace = arg_after(invocation, "--workspace_path");
                std::fs::create_dir_all(workspace.join("stereo").join("depth_maps")).unwrap();
                (1..=4)
                    .map(|i| format!("Processing view {i} / 4 for image_{i:03}.jpg"))
                    .collect()
            }
            "stereo_fusion" => {
                require_stereo_model(invocation)?;
                let fused = arg_after(invocation, "--output_path");
                write_points(&synthetic_point_cloud(512), PlyField::FULL, &fused).unwrap();
                counter("Fusing image", 2)
            }
            "poisson_mesher" => {
                let mesh = arg_after(invocation, "--output_path");
                std::fs::create_dir_all(mesh.parent().unwrap()).unwrap();
                write_mesh_ply(&synthetic_mesh(), &mesh).unwrap();
                Vec::new()
            }
            // Splat trainer: `<dense> -n <iterations> -o <model>`.
            _ => {
                let iterations: u32 = value_after(invocation, "-n").parse().unwrap();
                let model = arg_after(invocation, "-o");
                std::fs::create_dir_all(model.parent().unwrap()).unwrap();
                write_columns(&synthetic_splat_columns(256), &model).unwrap();
                (1..=4)
                    .map(|i| format!("Step {}: 0.0{i}", iterations * i / 4))
                    .collect()
            }
        };
        Ok(lines)
    }
}

#[async_trait]
impl ToolRunner for FakeTools {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        lines: Option<mpsc::Sender<String>>,
    ) -> Result<ProcessOutput, ToolError> {
        self.commands.lock().unwrap().push(invocation.tool_name());
        let output = self.produce(invocation)?;
        if let Some(lines) = lines {
            for line in &output {
                lines.send(line.clone()).await.unwrap();
            }
        }
        Ok(ProcessOutput {
            exit_code: 0,
            tail: output,
        })
    }
}

fn stage_window(stage: &str) -> ProgressWindow {
    match stage {
        "prepare-inputs" => windows::PREPARE_INPUTS,
        "feature-extraction" => windows::FEATURE_EXTRACTION,
        "feature-matching" => windows::FEATURE_MATCHING,
        "pose-recovery" => windows::POSE_RECOVERY,
        "undistortion" => windows::UNDISTORTION,
        "dense-depth" => windows::DENSE_DEPTH,
        "fusion" => windows::FUSION,
        "mesh-generation" => windows::MESH_GENERATION,
        "mesh-export" => windows::MESH_EXPORT,
        "dense-transplant" => windows::DENSE_TRANSPLANT,
        "model-training" => windows::MODEL_TRAINING,
        "model-export" => windows::MODEL_EXPORT,
        other => panic!("unexpected stage {other}"),
    }
}

/// Every event before the final one lies inside its stage's window.
fn assert_inside_windows(events: &[ProgressEvent]) {
    for event in events.iter().filter(|e| e.stage != COMPLETE_STAGE) {
        let window = stage_window(event.stage);
        assert!(
            (window.start..=window.end).contains(&event.percentage),
            "{}% outside {:?} for {}",
            event.percentage,
            window,
            event.stage
        );
    }
}

/// Events parsed from a tool's output: strictly inside the stage window.
fn tool_progress<'a>(events: &'a [ProgressEvent], stage: &str) -> Vec<&'a ProgressEvent> {
    let window = stage_window(stage);
    events
        .iter()
        .filter(|e| e.stage == stage && e.percentage > window.start && e.percentage < window.end)
        .collect()
}

fn real_config(branch: Branch) -> PipelineConfig {
    PipelineConfig {
        branch,
        backend: Some(BackendKind::Secondary),
        use_acceleration: Some(false),
        fast_mode: true,
        ..PipelineConfig::default()
    }
}

fn write_photos(dir: &Path, count: usize) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        let img = image::RgbImage::from_fn(64, 48, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 5) as u8, (i * 20) as u8])
        });
        img.save(dir.join(format!("IMG_{i:04}.png"))).unwrap();
    }
}

fn simulated_config(branch: Branch) -> PipelineConfig {
    PipelineConfig {
        branch,
        fast_mode: true,
        simulated_step_ms: 1,
        ..PipelineConfig::simulated()
    }
}

fn assert_well_formed(events: &[ProgressEvent]) {
    assert!(
        events.windows(2).all(|w| w[0].percentage < w[1].percentage),
        "percentages must strictly increase: {:?}",
        events.iter().map(|e| e.percentage).collect::<Vec<_>>()
    );
    let last = events.last().expect("at least one event");
    assert_eq!(last.percentage, 100);
    assert_eq!(last.stage, COMPLETE_STAGE);
    assert!(events[..events.len() - 1].iter().all(|e| e.percentage < 100));
}

fn non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

#[tokio::test]
async fn test_simulated_splat_run_publishes_artifacts() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 12);

    let spy = Arc::new(SpyRunner::default());
    let orchestrator = Orchestrator::new(
        "sim-splat",
        &input,
        tmp.path().join("out"),
        simulated_config(Branch::Splat),
    )
    .with_runner(spy.clone());
    let layout = orchestrator.layout().clone();

    let (events, result) = orchestrator.run().wait().await;
    let outcome = result.unwrap();

    assert_well_formed(&events);
    let stages: BTreeSet<_> = events.iter().map(|e| e.stage).collect();
    assert!(stages.len() >= 8, "stages seen: {stages:?}");
    assert!(stages.contains("model-training"));

    assert_eq!(outcome.mode, ExecutionMode::Simulated);
    assert_eq!(outcome.trainer, Some(BackendKind::Simulated));
    assert_eq!(outcome.scene, layout.scene_path());
    for artifact in &outcome.artifacts {
        assert!(non_empty(artifact), "{} is empty", artifact.display());
    }
    assert!(non_empty(&layout.binary_scene_path()));
    assert!(!read_point_cloud(layout.point_cloud_path()).unwrap().is_empty());

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(layout.manifest_path()).unwrap()).unwrap();
    assert_eq!(manifest["views"].as_array().unwrap().len(), 12);

    assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_simulated_mesh_run_exports_mesh() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 5);

    let spy = Arc::new(SpyRunner::default());
    let orchestrator = Orchestrator::new(
        "sim-mesh",
        &input,
        tmp.path().join("out"),
        simulated_config(Branch::Mesh),
    )
    .with_runner(spy.clone());
    let layout = orchestrator.layout().clone();

    let (events, result) = orchestrator.run().wait().await;
    let outcome = result.unwrap();

    assert_well_formed(&events);
    assert!(events.iter().any(|e| e.stage == "mesh-generation"));
    assert!(events.iter().all(|e| e.stage != "model-training"));
    assert_eq!(outcome.branch, Branch::Mesh);
    assert_eq!(outcome.trainer, None);

    let mesh = load_mesh_from_ply(layout.point_cloud_path()).unwrap();
    assert!(mesh.triangle_count() > 0);
    assert!(non_empty(&layout.scene_path()));
    assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_input_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    std::fs::create_dir_all(&input).unwrap();
    std::fs::write(input.join("notes.txt"), "not an image").unwrap();

    let (events, result) = Orchestrator::new(
        "empty",
        &input,
        tmp.path().join("out"),
        simulated_config(Branch::Splat),
    )
    .run()
    .wait()
    .await;

    assert!(matches!(result, Err(PipelineError::NoInputImages { .. })));
    assert!(events.iter().all(|e| e.percentage < 100));
}

#[tokio::test]
async fn test_too_few_images_fail_in_prepare_inputs() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 2);

    let (_, result) = Orchestrator::new(
        "few",
        &input,
        tmp.path().join("out"),
        simulated_config(Branch::Splat),
    )
    .run()
    .wait()
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.stage(), Some("prepare-inputs"));
}

#[tokio::test]
async fn test_override_skips_probing() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 4);

    // Secondary is forced, so neither the trainer nor the accelerator is probed;
    // the spy stands in for every tool the real run invokes.
    let spy = Arc::new(SpyRunner::default());
    let config = PipelineConfig {
        backend: Some(BackendKind::Secondary),
        use_acceleration: Some(false),
        ..PipelineConfig::default()
    };
    let (_, result) = Orchestrator::new("forced", &input, tmp.path().join("out"), config)
        .with_runner(spy.clone())
        .run()
        .wait()
        .await;

    // The spy creates nothing, so the first declared tool output is missing.
    let err = result.unwrap_err();
    assert_eq!(err.stage(), Some("feature-extraction"));
    assert!(err.to_string().contains("database.db"), "{err}");
    assert_eq!(spy.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_real_splat_run_reports_tool_progress() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 4);

    let tools = Arc::new(FakeTools::default());
    let orchestrator = Orchestrator::new(
        "real-splat",
        &input,
        tmp.path().join("out"),
        real_config(Branch::Splat),
    )
    .with_runner(tools.clone());
    let layout = orchestrator.layout().clone();

    let (events, result) = orchestrator.run().wait().await;
    let outcome = result.unwrap();

    assert_well_formed(&events);
    assert_inside_windows(&events);
    for stage in ["feature-extraction", "feature-matching", "dense-depth", "fusion"] {
        assert!(
            !tool_progress(&events, stage).is_empty(),
            "no tool progress for {stage}"
        );
    }
    let training = tool_progress(&events, "model-training");
    assert!(!training.is_empty());
    assert!(training.iter().all(|e| e.message.starts_with("opensplat:")));

    assert_eq!(
        tools.commands(),
        [
            "colmap feature_extractor",
            "colmap exhaustive_matcher",
            "colmap mapper",
            "colmap image_undistorter",
            "colmap patch_match_stereo",
            "colmap stereo_fusion",
            "opensplat",
        ]
    );
    assert_eq!(outcome.mode, ExecutionMode::Real);
    assert_eq!(outcome.trainer, Some(BackendKind::Secondary));
    for artifact in &outcome.artifacts {
        assert!(non_empty(artifact), "{} is empty", artifact.display());
    }
    assert!(layout.dense_dir().join("sparse").join("cameras.bin").is_file());
    assert!(layout.dense_sparse_dir().join("cameras.bin").is_file());
    assert!(!read_point_cloud(layout.init_points_path()).unwrap().is_empty());
}

#[tokio::test]
async fn test_real_mesh_run_reports_tool_progress() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 4);

    let tools = Arc::new(FakeTools::default());
    let orchestrator = Orchestrator::new(
        "real-mesh",
        &input,
        tmp.path().join("out"),
        real_config(Branch::Mesh),
    )
    .with_runner(tools.clone());
    let layout = orchestrator.layout().clone();

    let (events, result) = orchestrator.run().wait().await;
    let outcome = result.unwrap();

    assert_well_formed(&events);
    assert_inside_windows(&events);
    assert!(!tool_progress(&events, "dense-depth").is_empty());
    assert_eq!(tools.commands().last().unwrap(), "colmap poisson_mesher");
    assert_eq!(outcome.mode, ExecutionMode::Real);
    assert_eq!(outcome.trainer, None);
    assert!(load_mesh_from_ply(layout.point_cloud_path()).unwrap().triangle_count() > 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_tool_reports_stage_and_output() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 4);

    let script = tmp.path().join("fake-sfm");
    std::fs::write(
        &script,
        "#!/bin/sh\n\
         echo \"starting $1\"\n\
         echo 'no usable features in image_000.jpg' >&2\n\
         exit 1\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = PipelineConfig {
        backend: Some(BackendKind::Primary),
        use_acceleration: Some(false),
        sfm_binary: script.display().to_string(),
        ..PipelineConfig::default()
    };
    let (events, result) = Orchestrator::new("failing", &input, tmp.path().join("out"), config)
        .run()
        .wait()
        .await;

    let err = result.unwrap_err();
    let message = err.to_string();
    assert_eq!(err.stage(), Some("feature-extraction"));
    assert!(message.contains("feature-extraction"), "{message}");
    assert!(message.contains("no usable features"), "{message}");
    assert!(message.contains("exit code 1"), "{message}");

    // Prepare-inputs completed before the failure; nothing reached 100.
    assert!(events.iter().any(|e| e.stage == "prepare-inputs"));
    assert!(events.iter().all(|e| e.percentage < 100));
}

#[tokio::test]
async fn test_dropping_handle_cancels_run() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 4);

    let config = PipelineConfig {
        simulated_step_ms: 50,
        ..simulated_config(Branch::Splat)
    };
    let orchestrator = Orchestrator::new("dropped", &input, tmp.path().join("out"), config);
    let layout = orchestrator.layout().clone();
    let mut handle = orchestrator.run();
    assert!(handle.next_event().await.is_some());
    drop(handle);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(!layout.scene_path().exists());
}

#[tokio::test]
async fn test_job_registry_follows_run() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 6);

    let registry = JobRegistry::new();
    let job = registry.create(&input, &tmp.path().join("results"));
    let orchestrator = registry.orchestrator(&job, simulated_config(Branch::Splat));

    let done = registry.drive(job.id, orchestrator).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(
        done.output_artifact.as_deref(),
        Some(job.output_dir.join("model.gltf").as_path())
    );
}

#[tokio::test]
async fn test_job_registry_records_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    std::fs::create_dir_all(&input).unwrap();

    let registry = JobRegistry::new();
    let job = registry.create(&input, &tmp.path().join("results"));
    let orchestrator = registry.orchestrator(&job, simulated_config(Branch::Splat));

    let failed = registry.drive(job.id, orchestrator).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error_message.unwrap().contains("no input images"));
}

#[tokio::test]
async fn test_job_registry_fails_job_on_rejected_event() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photos");
    write_photos(&input, 4);

    let registry = JobRegistry::new();
    let job = registry.create(&input, &tmp.path().join("results"));
    let config = PipelineConfig {
        simulated_step_ms: 20,
        ..simulated_config(Branch::Splat)
    };
    let orchestrator = registry.orchestrator(&job, config);

    // The record is moved ahead of the run, so its next event regresses.
    let jump_ahead = async {
        while registry.get(job.id).unwrap().status != JobStatus::Processing {
            tokio::task::yield_now().await;
        }
        let ahead = ProgressEvent {
            percentage: 99,
            stage: "model-export",
            message: "ahead".to_string(),
        };
        registry.apply_progress(job.id, &ahead).unwrap();
    };
    let (result, ()) = tokio::join!(registry.drive(job.id, orchestrator), jump_ahead);

    assert!(matches!(
        result,
        Err(JobError::ProgressRegression { from: 99, .. })
    ));
    let failed = registry.get(job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error_message.unwrap().contains("99"));
    assert!(!job.output_dir.join("model.gltf").exists());
}
