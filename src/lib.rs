pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod limiter;
pub mod scan;
pub mod uploader;

pub use config::AppConfig;
pub use errors::{AppError, AppResult};
pub use limiter::RateLimiter;
pub use uploader::Uploader;
