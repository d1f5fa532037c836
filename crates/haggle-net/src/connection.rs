//! Connection state machine (spec §4.7 "Protocol Engine").
//!
//! A connection walks through `Idle -> Connecting -> Connected ->
//! (Sending | Receiving) -> Idle -> Done | Garbage`. `Sending`/`Receiving`
//! return to `Idle` once the current object transfer completes; `Done` is
//! reached on a clean `Terminate`, `Garbage` on anything else (I/O error,
//! protocol violation) and marks the connection for reclamation by whatever
//! owns it.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::framing::Frame;
use crate::peer::PeerId;

/// Bounded channel capacity backing every connection's outbound queue.
/// A slow peer applies backpressure to its sender instead of this daemon
/// buffering unboundedly on its behalf.
pub const SEND_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Sending,
    Receiving,
    Done,
    Garbage,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Sending => "sending",
            ConnectionState::Receiving => "receiving",
            ConnectionState::Done => "done",
            ConnectionState::Garbage => "garbage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: ConnectionState, event: &'static str },
    #[error("connection is closed")]
    Closed,
    #[error("send queue full")]
    Backpressure,
}

/// Events that drive the connection FSM forward. Named after what caused
/// them, not the state they produce, so the transition table stays the
/// single source of truth for "what state does this lead to".
#[derive(Debug)]
pub enum ConnectionEvent {
    DialSucceeded,
    DialFailed,
    AcceptedIncoming,
    BeginSend,
    BeginReceive,
    TransferComplete,
    TerminateReceived,
    Error,
}

impl ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::DialSucceeded => "dial-succeeded",
            ConnectionEvent::DialFailed => "dial-failed",
            ConnectionEvent::AcceptedIncoming => "accepted-incoming",
            ConnectionEvent::BeginSend => "begin-send",
            ConnectionEvent::BeginReceive => "begin-receive",
            ConnectionEvent::TransferComplete => "transfer-complete",
            ConnectionEvent::TerminateReceived => "terminate-received",
            ConnectionEvent::Error => "error",
        }
    }
}

/// A single peer connection: its FSM state plus the bounded outbound queue
/// that applies backpressure to anything trying to send faster than the
/// wire can carry.
pub struct Connection {
    pub peer: PeerId,
    state: ConnectionState,
    tx: mpsc::Sender<Frame>,
}

impl Connection {
    /// Construct a connection already in `Idle`, paired with the receiver
    /// half the I/O task drains to write frames to the wire.
    pub fn new(peer: PeerId) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        (
            Self {
                peer,
                state: ConnectionState::Idle,
                tx,
            },
            rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply an event to the FSM, or reject it if it doesn't apply from the
    /// current state.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState, ConnectionError> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self.state, &event) {
            (S::Idle, E::DialSucceeded) => S::Connected,
            (S::Idle, E::AcceptedIncoming) => S::Connected,
            (S::Idle, E::DialFailed) => S::Garbage,
            (S::Connecting, E::DialSucceeded) => S::Connected,
            (S::Connecting, E::DialFailed) => S::Garbage,
            (S::Connected, E::BeginSend) => S::Sending,
            (S::Connected, E::BeginReceive) => S::Receiving,
            (S::Connected, E::TerminateReceived) => S::Done,
            (S::Sending, E::TransferComplete) => S::Idle,
            (S::Receiving, E::TransferComplete) => S::Idle,
            (S::Idle, E::TerminateReceived) => S::Done,
            (_, E::Error) => S::Garbage,
            _ => {
                return Err(ConnectionError::InvalidTransition {
                    from: self.state,
                    event: event.name(),
                })
            }
        };
        self.state = next;
        Ok(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ConnectionState::Done | ConnectionState::Garbage)
    }

    /// Queue a frame for the I/O task to write. Returns `Backpressure`
    /// immediately rather than blocking if the queue is full — callers
    /// decide whether to retry later or drop the peer.
    pub fn try_send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.is_terminal() {
            return Err(ConnectionError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }
}
