//! PRoPHET delivery-predictability table, aging, transitive update, and
//! delegate-selection strategies (spec §4.8 "Forwarding Manager"). Usable
//! standalone, without the daemon around it.

pub mod forwarder;
pub mod rib;
pub mod strategy;

pub use forwarder::{Delegate, Forwarder, ForwarderEmpty, ForwarderProphet, RoutingMetric};
pub use rib::{Metric, Rib, AGING_UNIT, BETA, GAMMA, P_ENCOUNTER};
pub use strategy::{ForwardingStrategy, Grtr, Gtmx};
