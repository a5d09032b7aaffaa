//! Vortex Proxy Engine
//!
//! The main Tokio async engine that manages socket binding, connection pooling, and request pipelining.

#![deny(missing_docs)]

use std::sync::Arc;

use vortex_core;
use vortex_core::domain::routing::RoutingTable;
use vortex_filters;
use vortex_admin;

mod health_check;
mod server;

/// The primary entrypoint for the Vortex reverse proxy.
///
/// This initializes the multi-threaded Tokio runtime, loads the configuration,
/// and begins listening for incoming TCP connections.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    tracing::info!("starting vortex proxy engine");

    // Initialize core structural components
    vortex_core::core_init();
    vortex_filters::filters_init();
    vortex_admin::admin_init();

    // No configuration loader exists yet, so the routing table starts
    // empty; the health-check subsystem simply has nothing to probe until
    // backends are registered onto it.
    let routing_table = Arc::new(RoutingTable::new(Vec::new()));
    health_check::spawn_health_checker(routing_table);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));

    // Start the server (this will block until failure or shutdown)
    if let Err(e) = server::start_server(addr).await {
        tracing::error!(error = %e, "server failed");
    }

    tracing::info!("shutting down gracefully");
    Ok(())
}
