//! # Driven Ports (Outbound SPI)
//!
//! What the bridge requires from a bus transport. One transport is one live
//! connection; it is owned exclusively by the dispatch loop of a single
//! [`BusHandle`](crate::BusHandle).

use crate::domain::{InboundMessage, MethodCall, SenderMatching};
use async_trait::async_trait;
use quadro_types::{BusKind, ConnectionError};
use thiserror::Error;

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is gone.
    #[error("transport closed")]
    Closed,

    /// Socket-level failure.
    #[error("transport I/O error: {0}")]
    Io(String),

    /// An outgoing message could not be encoded. The connection stays usable.
    #[error("cannot encode message: {0}")]
    Encode(String),

    /// An incoming message could not be decoded. The connection stays usable.
    #[error("cannot decode message: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the error invalidates the connection for good.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}

/// One live connection to a bus.
///
/// # Example Implementation
///
/// ```rust,ignore
/// struct LoopbackTransport {
///     queue: VecDeque<InboundMessage>,
/// }
///
/// #[async_trait]
/// impl BusTransport for LoopbackTransport {
///     async fn send(&mut self, call: MethodCall) -> Result<(), TransportError> {
///         self.queue.push_back(InboundMessage::MethodReturn {
///             reply_to: call.id,
///             body: call.args,
///         });
///         Ok(())
///     }
///
///     async fn recv(&mut self) -> Option<Result<InboundMessage, TransportError>> {
///         self.queue.pop_front().map(Ok)
///     }
/// }
/// ```
#[async_trait]
pub trait BusTransport: Send {
    /// Send a method call. Replies come back through [`BusTransport::recv`]
    /// carrying `call.id`.
    async fn send(&mut self, call: MethodCall) -> Result<(), TransportError>;

    /// Next inbound message, or `None` once the connection has ended.
    ///
    /// Must be cancel-safe: the dispatch loop polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<InboundMessage, TransportError>>;

    /// How signal senders relate to subscribed service names on this bus.
    fn sender_matching(&self) -> SenderMatching {
        SenderMatching::Exact
    }
}

/// Opens transports to the host or session bus.
///
/// `connect` runs on the dispatch thread of the handle being built, inside
/// the runtime that will drive the returned transport.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Establish a connection. Fails when the socket cannot be opened or the
    /// daemon does not answer.
    async fn connect(&self, kind: BusKind) -> Result<Box<dyn BusTransport>, ConnectionError>;
}
