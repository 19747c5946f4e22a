use bytestring::ByteString;

pub type Error = anyhow::Error;
pub type Result<T, E = Error> = anyhow::Result<T, E>;

/// Broker error taxonomy. Errors raised while serving a client close that
/// client's connection; none of them take the broker down.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// Malformed or out-of-order control packet.
    #[error("protocol error: {0}")]
    Protocol(ByteString),

    /// CONNECT credentials rejected by the authenticator.
    #[error("authentication failed")]
    AuthenticationDenied,

    /// Unacceptable protocol level in CONNECT.
    #[error("unacceptable protocol version")]
    UnacceptableProtocolVersion,

    /// Client identifier rejected (empty without clean session, or too long).
    #[error("client identifier rejected")]
    IdentifierRejected,

    /// The broker cannot take the session right now.
    #[error("service unavailable")]
    ServiceUnavailable,

    /// The underlying connection failed mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// No control packet arrived within 1.5x the negotiated keep-alive.
    #[error("keep alive timeout")]
    KeepAliveTimeout,

    /// The peer closed the connection without DISCONNECT.
    #[error("connection closed by remote peer")]
    RemoteClose,

    /// All 65535 packet identifiers are awaiting acknowledgement.
    #[error("packet identifiers exhausted")]
    PacketIdExhausted,

    /// The session mailbox was dropped while the connection was live.
    #[error("session mailbox closed")]
    MailboxClosed,
}
