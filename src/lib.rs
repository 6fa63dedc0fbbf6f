pub mod bootstrap;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod extract;
pub mod hls;
pub mod manifest;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod token;
