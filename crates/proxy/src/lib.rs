//! Haven front-end proxy.
//!
//! TCP listeners that terminate TLS once (SNI-aware, hot-reloaded
//! certificates), route by Host header to the in-process site apps, pass
//! WebSocket upgrades through as raw tunnels and count probes against
//! unmatched hosts.

pub mod forward;
pub mod host;
pub mod server;
pub mod tls;

pub use forward::Forwarder;
pub use host::{is_private_ip, Backend, HostTable};
pub use server::ProxyServer;
pub use tls::CertBundle;
