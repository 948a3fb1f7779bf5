pub mod config;
pub mod decoder;
pub mod error;
pub mod http_client;
pub mod model;
pub mod provider;
pub mod providers;
pub mod store;
pub mod stream;
pub mod telemetry;
