//! State enums for connections and listeners.
//!
//! Connection states come in "do"/"complete" pairs. The driver moves to the
//! `*Complete` state before the awaited operation resolves, so the state seen
//! from outside while an operation is pending is always the `*Complete` one.

use std::sync::atomic::{AtomicU8, Ordering};

/// State of a server-side connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerConnectionState {
    /// About to read the application preamble.
    ReadPreamble = 0,
    /// Waiting for preamble bytes.
    ReadPreambleComplete,
    /// About to write the preamble reply.
    WritePreambleReply,
    /// Waiting for the preamble reply to be written.
    WritePreambleReplyComplete,
    /// About to start the handshake.
    Handshake,
    /// Waiting for the handshake.
    HandshakeComplete,
    /// About to read a frame.
    ReadFrame,
    /// Waiting for frame bytes.
    ReadFrameComplete,
    /// Terminal.
    Closed,
}

impl ServerConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::ReadPreamble,
            1 => Self::ReadPreambleComplete,
            2 => Self::WritePreambleReply,
            3 => Self::WritePreambleReplyComplete,
            4 => Self::Handshake,
            5 => Self::HandshakeComplete,
            6 => Self::ReadFrame,
            7 => Self::ReadFrameComplete,
            _ => Self::Closed,
        }
    }
}

impl Default for ServerConnectionState {
    fn default() -> Self {
        Self::ReadPreamble
    }
}

impl std::fmt::Display for ServerConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadPreamble => write!(f, "ReadPreamble"),
            Self::ReadPreambleComplete => write!(f, "ReadPreambleComplete"),
            Self::WritePreambleReply => write!(f, "WritePreambleReply"),
            Self::WritePreambleReplyComplete => write!(f, "WritePreambleReplyComplete"),
            Self::Handshake => write!(f, "Handshake"),
            Self::HandshakeComplete => write!(f, "HandshakeComplete"),
            Self::ReadFrame => write!(f, "ReadFrame"),
            Self::ReadFrameComplete => write!(f, "ReadFrameComplete"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// State of a client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientConnectionState {
    /// About to resolve the host.
    ResolveHost = 0,
    /// Waiting for DNS.
    ResolveHostComplete,
    /// About to connect.
    TransportConnect,
    /// Waiting for the TCP connect.
    TransportConnectComplete,
    /// About to start the handshake.
    Handshake,
    /// Waiting for the handshake.
    HandshakeComplete,
    /// About to read a frame.
    ReadFrame,
    /// Waiting for frame bytes.
    ReadFrameComplete,
    /// Terminal.
    Closed,
}

impl ClientConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::ResolveHost,
            1 => Self::ResolveHostComplete,
            2 => Self::TransportConnect,
            3 => Self::TransportConnectComplete,
            4 => Self::Handshake,
            5 => Self::HandshakeComplete,
            6 => Self::ReadFrame,
            7 => Self::ReadFrameComplete,
            _ => Self::Closed,
        }
    }
}

impl Default for ClientConnectionState {
    fn default() -> Self {
        Self::ResolveHost
    }
}

impl std::fmt::Display for ClientConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolveHost => write!(f, "ResolveHost"),
            Self::ResolveHostComplete => write!(f, "ResolveHostComplete"),
            Self::TransportConnect => write!(f, "TransportConnect"),
            Self::TransportConnectComplete => write!(f, "TransportConnectComplete"),
            Self::Handshake => write!(f, "Handshake"),
            Self::HandshakeComplete => write!(f, "HandshakeComplete"),
            Self::ReadFrame => write!(f, "ReadFrame"),
            Self::ReadFrameComplete => write!(f, "ReadFrameComplete"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Current state of a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpServerState {
    /// Not accepting.
    Stopped,
    /// Accepting connections.
    Listening,
    /// Shutting down.
    Stopping,
}

impl Default for TcpServerState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for TcpServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Listening => write!(f, "Listening"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// A state enum stored in an atomic so it can be read from any thread.
#[derive(Debug)]
pub(crate) struct AtomicState<S> {
    raw: AtomicU8,
    _marker: std::marker::PhantomData<S>,
}

pub(crate) trait StateRepr: Copy {
    fn to_u8(self) -> u8;
    fn from_raw(raw: u8) -> Self;
}

impl StateRepr for ServerConnectionState {
    fn to_u8(self) -> u8 {
        self as u8
    }
    fn from_raw(raw: u8) -> Self {
        Self::from_u8(raw)
    }
}

impl StateRepr for ClientConnectionState {
    fn to_u8(self) -> u8 {
        self as u8
    }
    fn from_raw(raw: u8) -> Self {
        Self::from_u8(raw)
    }
}

impl<S: StateRepr> AtomicState<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self {
            raw: AtomicU8::new(initial.to_u8()),
            _marker: std::marker::PhantomData,
        }
    }

    pub(crate) fn get(&self) -> S {
        S::from_raw(self.raw.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: S) {
        self.raw.store(state.to_u8(), Ordering::Release);
    }
}
