//! On-disk layout of a single run.
//!
//! Output filenames are a stable contract: registries and viewers locate
//! results by these names.

use std::path::PathBuf;

pub const POINT_CLOUD_FILE: &str = "model.ply";
pub const SCENE_FILE: &str = "model.gltf";
pub const SCENE_BUFFER_FILE: &str = "model.bin";
pub const BINARY_SCENE_FILE: &str = "model.glb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub run_id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl RunLayout {
    pub fn new(
        run_id: impl Into<String>,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Scratch space for tools.
    pub fn work_dir(&self) -> PathBuf {
        self.output_dir.join("work")
    }

    /// Normalized input images.
    pub fn images_dir(&self) -> PathBuf {
        self.work_dir().join("images")
    }

    pub fn database_path(&self) -> PathBuf {
        self.work_dir().join("database.db")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir().join("inputs.json")
    }

    /// Mapper output root; the reconstruction lands in `sparse/0`.
    pub fn sparse_dir(&self) -> PathBuf {
        self.work_dir().join("sparse")
    }

    pub fn sparse_model_dir(&self) -> PathBuf {
        self.sparse_dir().join("0")
    }

    /// Undistorted workspace used by stereo and by the trainers.
    pub fn dense_dir(&self) -> PathBuf {
        self.work_dir().join("dense")
    }

    /// Camera model inside the dense workspace, in the `sparse/0` layout trainers expect.
    pub fn dense_sparse_dir(&self) -> PathBuf {
        self.dense_dir().join("sparse").join("0")
    }

    pub fn fused_cloud_path(&self) -> PathBuf {
        self.dense_dir().join("fused.ply")
    }

    /// Trainer initialization points, replaced by the dense transplant.
    pub fn init_points_path(&self) -> PathBuf {
        self.dense_sparse_dir().join("points3D.ply")
    }

    pub fn mesh_dir(&self) -> PathBuf {
        self.work_dir().join("mesh")
    }

    pub fn mesh_path(&self) -> PathBuf {
        self.mesh_dir().join("meshed-poisson.ply")
    }

    pub fn training_dir(&self) -> PathBuf {
        self.work_dir().join("training")
    }

    pub fn point_cloud_path(&self) -> PathBuf {
        self.output_dir.join(POINT_CLOUD_FILE)
    }

    pub fn scene_path(&self) -> PathBuf {
        self.output_dir.join(SCENE_FILE)
    }

    pub fn scene_buffer_path(&self) -> PathBuf {
        self.output_dir.join(SCENE_BUFFER_FILE)
    }

    pub fn binary_scene_path(&self) -> PathBuf {
        self.output_dir.join(BINARY_SCENE_FILE)
    }

    /// Artifacts a successful run guarantees.
    pub fn declared_artifacts(&self, binary_scene: bool) -> Vec<PathBuf> {
        let mut artifacts = vec![
            self.scene_path(),
            self.scene_buffer_path(),
            self.point_cloud_path(),
        ];
        if binary_scene {
            artifacts.push(self.binary_scene_path());
        }
        artifacts
    }

    /// Create every directory of the layout. Safe to call repeatedly.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.output_dir.clone(),
            self.images_dir(),
            self.sparse_dir(),
            self.dense_dir(),
            self.mesh_dir(),
            self.training_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
