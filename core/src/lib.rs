//! Real-time card fraud detection pipeline.
//!
//! generator -> stream broker -> consumer group workers -> feature window
//! -> scoring engine -> SQLite store + relationship graph + alert stream.

pub mod config;
pub mod consumer;
pub mod error;
pub mod fake;
pub mod features;
pub mod generator;
pub mod graph;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod producer;
pub mod rng;
pub mod scoring;
pub mod store;
pub mod stream;
pub mod transaction;
pub mod types;
