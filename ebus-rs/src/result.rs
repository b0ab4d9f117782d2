//! Result codes shared by the library and the daemon.
//!
//! Every bus-level operation reports one of these kinds. The bus handler
//! decides per kind whether to retry, notify or reset; the control surface
//! converts them to user-visible strings via `Display`.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds of the bus protocol and its surroundings.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No observable activity on the bus.
    #[error("no signal")]
    NoSignal,
    /// The expected symbol did not arrive within the state's deadline.
    #[error("read timeout")]
    Timeout,
    /// A SYN symbol interrupted an in-flight frame.
    #[error("SYN received")]
    Syn,
    /// Another master won the arbitration.
    #[error("arbitration lost")]
    BusLost,
    /// The device failed to write a symbol.
    #[error("send error")]
    Send,
    /// The underlying device failed or could not be opened.
    #[error("device error")]
    Device,
    /// CRC mismatch on a received frame.
    #[error("CRC error")]
    Crc,
    /// An unexpected symbol arrived where ACK/NAK was required.
    #[error("ACK error")]
    Ack,
    /// The peer answered with NAK.
    #[error("NAK received")]
    Nak,
    /// An invalid escape sequence was received.
    #[error("invalid escape sequence")]
    Escape,
    /// A frame grew beyond the maximum the bus allows.
    #[error("frame too long")]
    Overflow,
    #[error("invalid argument")]
    InvalidArg,
    #[error("invalid address")]
    InvalidAddr,
    #[error("invalid numeric argument")]
    InvalidNum,
    #[error("invalid hex string")]
    InvalidHex,
    #[error("element not found")]
    NotFound,
    #[error("no matching element")]
    Empty,
    #[error("end of input reached")]
    Eof,
}
