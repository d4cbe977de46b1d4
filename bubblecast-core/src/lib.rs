pub mod config;
pub mod consumer;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod provider;
pub mod providers;
pub mod rate_limit;
pub mod server;
pub mod sse;
pub mod stream;
pub mod telemetry;
#[cfg(test)]
pub mod test_util;
