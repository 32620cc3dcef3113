//! Reverse Proxy Control
//!
//! Renders the nginx stream config that routes MySQL clients to the
//! active staging replica, and reloads the proxy container.

mod nginx;
mod writer;

pub use nginx::ProxyRoute;
pub use writer::{ProxyConfigWriter, ProxySettings};
