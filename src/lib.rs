// Library exports for the CLI host and for embedding in a desktop shell
pub mod cli;
pub mod config_file;
pub mod enhancement;
pub mod image_processing;
pub mod json_output;
pub mod pipeline;
pub mod queue;
pub mod remote;
pub mod utils;

// Re-export commonly used types
pub use config_file::AppConfig;
pub use enhancement::{EnhancementConfig, Intensity, Upscale, Variant};
pub use image_processing::{CropEngine, FramingConstants};
pub use json_output::{JsonLinesObserver, JsonMessage};
pub use pipeline::{Pipeline, PipelineError};
pub use queue::{
    Job, JobRunner, JobStatus, OutputPaths, QueueEvent, QueueObserver, QueueStatus, QueueStore, Scheduler,
    SchedulerSettings,
};
pub use remote::{HttpTransport, RemoteClient, RemoteError, RemoteSettings};
