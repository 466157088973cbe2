//! Upload an image, classify it, and get three social-media captions back.

pub mod classifier;
pub mod config;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod routes;
pub mod telemetry;
pub mod upload;

pub use error::AppError;
pub use pipeline::{CaptionPipeline, CaptionResult, PipelineOptions};
pub use routes::{router, AppState};
