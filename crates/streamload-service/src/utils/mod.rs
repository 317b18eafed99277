pub mod defer;
pub mod futures;
pub mod pool;
pub mod sentry;
