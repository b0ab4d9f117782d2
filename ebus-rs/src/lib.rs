//! eBUS protocol primitives.
//!
//! The eBUS is a half-duplex two-wire serial bus used by home heating
//! equipment, running at 2400 Bd with a single synchronization symbol and a
//! byte-escape convention. This crate provides the pieces a bus participant
//! needs below the daemon level:
//!
//! - wire constants, address arithmetic and the CRC-8 of the bus
//!   ([`symbol`], [`address`])
//! - [`symbol::SymbolBuffer`], a growable byte buffer that escapes or
//!   unescapes symbols on the fly and keeps a running CRC
//! - the [`device::Device`] abstraction over the physical byte channel,
//!   with a [`device::SerialDevice`] implementation for local tty ports
//! - the [`message::Message`]/[`message::MessageCatalog`] seam towards the
//!   message codec, together with the built-in identification ("scan")
//!   message

pub mod address;
pub mod device;
pub mod message;
pub mod result;
pub mod symbol;

pub use result::{Error, Result};
pub use symbol::{SymbolBuffer, ACK, BROADCAST, ESC, NAK, SYN};
