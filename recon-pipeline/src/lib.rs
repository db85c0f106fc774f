//! Recon Pipeline Crate
//!
//! Turns a directory of photographs into a textured point model or a mesh by
//! driving external photogrammetry and training tools in a fixed sequence.
//!
//! ## Modules
//!
//! - [`process`]: Spawning tools, streaming their output, bounded error tails
//! - [`progress`]: Progress events, stage windows and output-line parsers
//! - [`capability`]: Trainer backend and accelerator detection
//! - [`stage`]: The individual stages and their execution context
//! - [`sequencer`]: Per-branch stage lists, run strictly in order
//! - [`orchestrator`]: A single run from input images to published artifacts
//! - [`job`]: Job records driven by orchestrator events

pub mod capability;
pub mod config;
pub mod error;
pub mod job;
pub mod layout;
pub mod orchestrator;
pub mod process;
pub mod progress;
pub mod sequencer;
pub mod stage;

pub use capability::{BackendKind, CapabilityDetector};
pub use config::{Branch, ConfigError, PipelineConfig};
pub use error::{PipelineError, StageError};
pub use job::{Job, JobError, JobRegistry, JobStatus};
pub use layout::RunLayout;
pub use orchestrator::{Orchestrator, RunHandle, RunOutcome};
pub use process::{ProcessOutput, SystemRunner, ToolError, ToolInvocation, ToolRunner};
pub use progress::{ProgressEvent, ProgressWindow};
pub use stage::ExecutionMode;
