//! splitroute - selective VPN routing for home routers
//!
//! Routes chosen services (by domain and network) and chosen LAN devices (by
//! address) through one of several VPN tunnels while everything else goes
//! direct. A small declarative model is compiled into nftables set contents,
//! per-device firewall rules, dnsmasq directives and a VPN client config, and
//! pushed to the system on demand.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `model`: Services, devices, tunnels, groups, subscriptions, routes
//! - `normalize`: Domain and network canonicalisation
//! - `store`: Snapshot-based state store with per-entity JSON documents
//! - `compiler`: Pure state to rule set compilation
//! - `outbound`: VPN client config rendering
//! - `apply`: Serialised application of a rule set (nft, dnsmasq, client)
//! - `platform`: Firewall, policy routing and service control (Linux)
//! - `health`: Concurrent tunnel probing and auto group selection
//! - `import`: Share links, subscriptions, source lists, DHCP leases
//! - `controller`: The operation surface used by the CLI and RPC layers
//!
//! # Usage
//!
//! ```bash
//! splitroute service enable youtube
//! splitroute import 'vless://...#main'
//! splitroute active main
//! splitroute apply
//! ```

pub mod apply;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod import;
pub mod model;
pub mod normalize;
pub mod outbound;
pub mod platform;
pub mod store;

pub use config::Config;
pub use controller::{Controller, Outcome};
pub use error::CoreError;
