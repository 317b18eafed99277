// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod caching;
pub mod cancellation;
pub mod fallback;
pub mod http;
pub mod panic;
pub mod utils;

pub use utils::*;
