//! The manager set (spec §4): independent event-driven components sharing
//! only the kernel bus, the data store, and the in-memory node/interface
//! caches. Each manager owns a `tokio::spawn`ed task reading its own
//! subscription; nothing here reaches across a manager boundary except by
//! publishing an `Event` or calling another manager's narrow, synchronous
//! service methods (certificate attachment, signing) the way the original's
//! managers call each other's public methods directly when a reply can't
//! wait for a bus round trip.

pub mod application;
pub mod data;
pub mod forwarding;
pub mod node;
pub mod protocol;
pub mod security;
