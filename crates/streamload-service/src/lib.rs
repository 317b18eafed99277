#[macro_use]
pub mod metrics;

pub mod admission;
pub mod caching;
pub mod config;
pub mod download;
pub mod error;
pub mod intention;
pub mod loader;
pub mod loading;
pub mod logging;
pub mod utils;
