//! CarScout Backend Library
//!
//! Exposes the pipeline core for the `carscout` binary and the integration
//! tests: the stage handlers, the durable queue, the state store, and the
//! capability interfaces for blobs, LLM, and messaging.

pub mod alerts;
pub mod blob;
pub mod catalog;
pub mod config;
pub mod delivery;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod scrape;
pub mod similarity;
pub mod store;

// Re-export the state bundle most callers need
pub use config::Config;
pub use pipeline::AppState;
pub use store::Store;
