pub mod capture;
pub mod config;
pub mod control;
pub mod convert;
pub mod error;
pub mod overlay;
pub mod pipeline;
pub mod sink;

pub use capture::{Frame, PackagedFrame, PixelFormat, TargetEncoding};
pub use config::Config;
pub use pipeline::{Lifecycle, LifecycleState, Pipeline, PipelineReport};
