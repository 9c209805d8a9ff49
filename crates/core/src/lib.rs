pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{RateLimitSpec, Settings};
pub use error::AppError;
