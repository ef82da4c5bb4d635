pub mod api;
pub mod config;
pub mod error;
pub mod loadtest;
pub mod logging;
pub mod logs;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod ratelimit;
pub mod storage;
pub mod stream;
pub mod utils;
pub mod warehouse;

pub use error::{PulseError, Result};
