//! Event types exchanged on the kernel's bus (spec §4.1 "Kernel & Event
//! Loop").
//!
//! The original splits events into *public* (broadcast to every manager
//! that registered interest) and *private* (a point-to-point reply to
//! whichever call triggered it, typically a data-store query). Here both
//! shapes travel as `Event` values on the same bus: a public event is
//! published once and fanned out to every subscriber of its `EventKind` in
//! registration order (spec §8's ordering invariant); a "private" reply is
//! just an `Event` variant that only the manager holding the matching
//! `request_id` acts on, everyone else ignores it on arrival.

use std::sync::Arc;

use haggle_core::DataObject;

/// The two-phase shutdown plus the steady-state phase every manager walks
/// through in lockstep (spec §4.1 "Lifecycle phases").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Startup,
    Running,
    PrepareShutdown,
    Shutdown,
    Done,
}

/// Discriminant used to key a manager's subscription. Kept separate from
/// `Event` itself (rather than deriving from `Event` via `mem::discriminant`)
/// so a manager can subscribe before the first event of that kind has ever
/// been constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    NeighbourUp,
    NeighbourDown,
    NodeUpdated,
    NodeDescriptionSend,
    NodeContactNew,
    NodeContactEnd,
    DataObjectIncoming,
    DataObjectReceived,
    DataObjectVerified,
    DataObjectNew,
    SendRequest,
    DataObjectSent,
    DataObjectSendFailure,
    Forwarding,
    AgingTick,
    PeriodicForwardingQuery,
    DelayedForwardingQuery,
    NodeDescriptionRetry,
    PrepareShutdown,
    Shutdown,
    ReadyForShutdown,
}

/// A failure kind carried by an event rather than thrown, per spec §7's
/// error-handling design: every recoverable failure surfaces as data on an
/// event, never as a panic or a propagated `Result` crossing a manager
/// boundary.
#[derive(Clone, Debug)]
pub enum FailureKind {
    SocketWouldBlock,
    PeerClosed,
    PeerRejected,
    PeerTerminated,
    AckMissing,
    VerifyBad,
    StoreBusy,
    RegistrationInUse,
    FilterParseFailure,
}

/// Events flowing through the kernel's bus.
#[derive(Clone, Debug)]
pub enum Event {
    /// A node became reachable over at least one up interface.
    NeighbourUp { node_id: String, interface_id: String },
    /// A node's last up interface went down.
    NeighbourDown { node_id: String },
    /// A node record changed (new or merged description).
    NodeUpdated { node_id: String },
    /// Raised whenever interests change significantly; the node manager
    /// pushes its description to every current neighbour in response.
    NodeDescriptionSend,
    /// A previously-unseen node became a neighbour.
    NodeContactNew { node_id: String },
    /// A neighbour stopped being reachable.
    NodeContactEnd { node_id: String },
    /// A connection's metadata header finished parsing; before any payload
    /// is accepted.
    DataObjectIncoming { object: Arc<DataObject>, from_interface: String },
    /// A connection finished receiving an object end to end.
    DataObjectReceived {
        object: Arc<DataObject>,
        from_node: Option<String>,
        local_interface: String,
    },
    /// Security manager cleared (or bypassed) signature verification.
    DataObjectVerified { object: Arc<DataObject>, from_node: Option<String> },
    /// Data manager finished inserting a non-duplicate object.
    DataObjectNew { object: Arc<DataObject> },
    /// A manager asks the protocol engine to deliver `object` to `node_id`.
    /// The sole producer-consumer pair is "any manager" → Protocol Manager;
    /// the eventual outcome arrives as `DataObjectSent`/`DataObjectSendFailure`.
    SendRequest { object: Arc<DataObject>, node_id: String },
    /// Protocol engine finished sending an object to a node.
    DataObjectSent { object_id: [u8; 20], node_id: String },
    /// Protocol engine failed to deliver an object to a node.
    DataObjectSendFailure {
        object_id: [u8; 20],
        node_id: String,
        reason: FailureKind,
    },
    /// Routing-information object addressed to the forwarder (`Forwarding=*`
    /// filter match, spec §4.6).
    Forwarding { object: Arc<DataObject> },
    /// Periodic aging tick (spec §4.5, default 60s).
    AgingTick,
    /// Periodic per-neighbour re-query tick (spec §4.6, default 300s).
    PeriodicForwardingQuery,
    /// A coalesced, delayed per-neighbour data-object query fired.
    DelayedForwardingQuery { node_id: String },
    /// A node-description push is due for retry.
    NodeDescriptionRetry {
        node_id: String,
        object: Arc<DataObject>,
        attempt: u32,
    },
    /// Kernel entered the quiescing phase of shutdown.
    PrepareShutdown,
    /// Kernel entered the resource-release phase of shutdown.
    Shutdown,
    /// A manager signals it has finished the current shutdown phase.
    ReadyForShutdown { manager: &'static str, phase: Phase },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NeighbourUp { .. } => EventKind::NeighbourUp,
            Event::NeighbourDown { .. } => EventKind::NeighbourDown,
            Event::NodeUpdated { .. } => EventKind::NodeUpdated,
            Event::NodeDescriptionSend => EventKind::NodeDescriptionSend,
            Event::NodeContactNew { .. } => EventKind::NodeContactNew,
            Event::NodeContactEnd { .. } => EventKind::NodeContactEnd,
            Event::DataObjectIncoming { .. } => EventKind::DataObjectIncoming,
            Event::DataObjectReceived { .. } => EventKind::DataObjectReceived,
            Event::DataObjectVerified { .. } => EventKind::DataObjectVerified,
            Event::DataObjectNew { .. } => EventKind::DataObjectNew,
            Event::SendRequest { .. } => EventKind::SendRequest,
            Event::DataObjectSent { .. } => EventKind::DataObjectSent,
            Event::DataObjectSendFailure { .. } => EventKind::DataObjectSendFailure,
            Event::Forwarding { .. } => EventKind::Forwarding,
            Event::AgingTick => EventKind::AgingTick,
            Event::PeriodicForwardingQuery => EventKind::PeriodicForwardingQuery,
            Event::DelayedForwardingQuery { .. } => EventKind::DelayedForwardingQuery,
            Event::NodeDescriptionRetry { .. } => EventKind::NodeDescriptionRetry,
            Event::PrepareShutdown => EventKind::PrepareShutdown,
            Event::Shutdown => EventKind::Shutdown,
            Event::ReadyForShutdown { .. } => EventKind::ReadyForShutdown,
        }
    }
}

/// Node-description-shaped event payload used by the application manager to
/// hand an app a neighbour list, interest list, or shutdown notice (spec §6
/// "Event notifications to apps"). Kept distinct from `Event` itself: these
/// become `DataObject`s addressed to a specific application, not entries on
/// the kernel bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppEventType {
    Shutdown = 0,
    NeighbourUpdate = 1,
    NewDataObject = 2,
    InterestList = 3,
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
