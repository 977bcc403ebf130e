//! HTTP/UI wrapper around the external PatchCore anomaly-detection
//! pipeline: checkpoint management, a model cache serializing access to
//! the collaborator, and REST + browser transports over one orchestrator.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod server;
pub mod ui;
