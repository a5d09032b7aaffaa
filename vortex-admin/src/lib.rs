//! Vortex Admin Control Plane
//!
//! Handles Unix socket connections and ProtoBuf deserialization for dynamic configuration.

/// Initializes the Unix socket admin control plane.
pub fn admin_init() {
    println!("vortex-admin initialized");
}
