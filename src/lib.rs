// ===============================
// src/lib.rs
// ===============================
//
// Strategy-to-order decision pipeline:
//   feed -> indicators -> strategies -> risk -> positions -> gateway
//
pub mod config;
pub mod domain;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod indicators;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod positions;
pub mod recorder;
pub mod risk;
pub mod store;
pub mod strategy;

pub use error::PipelineError;
