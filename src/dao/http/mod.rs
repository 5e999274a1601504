mod client;
mod config;
mod error;

pub use client::HttpAssessmentApi;
pub use config::ApiConfig;
pub use error::{HttpApiError, HttpResult};
