//! Importers: share links, subscriptions, service source lists and DHCP leases

pub mod leases;
pub mod link;
pub mod sources;
pub mod subscription;

pub use leases::{Lease, read_leases};
pub use link::{LinkError, dedupe_tags, parse_link};
pub use sources::{SourceContent, SourceError, fetch_source, parse_source};
pub use subscription::{SubscriptionError, fetch_subscription, parse_subscription};
