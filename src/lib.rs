//! Event-driven campaign delivery engine.
//!
//! A batch-requested event fans a campaign out over its segment audience in
//! fixed-size batches, per-recipient outcomes roll up into campaign counters,
//! and the campaign completes exactly once however often the stream replays.
//! The same router also purges delivery logs and segment memberships, stores
//! activity events and turns insight requests into narrative reports.

pub mod aggregator;
pub mod audience;
pub mod broker;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod generator;
pub mod insights;
pub mod metrics;
pub mod models;
pub mod notifier;
pub mod pipeline;
pub mod planner;
pub mod router;
pub mod store;
pub mod template;
