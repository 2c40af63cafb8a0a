//! Prometheus exporter for Azure Monitor metrics.
//!
//! Each scrape of `/metrics` resolves the configured resources, fetches
//! their latest metric values through the Azure batch API and republishes
//! them as gauges.

pub mod azure;
pub mod collector;
pub mod config;
pub mod export;
pub mod resource;
