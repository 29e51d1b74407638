//! Devgate - one local HTTP endpoint for a folder of serverless services
//!
//! This library provides a development gateway that:
//! - Discovers service directories and reads their `serverless.yml` definitions
//! - Assigns every service its own local port, in discovery order
//! - Runs one local runtime process per service and relays its output
//! - Routes requests by method and path template to the owning service
//! - Broadcasts termination signals to every runtime on shutdown

pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod routing;
pub mod serverless;
pub mod supervisor;
pub mod upstream;

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
