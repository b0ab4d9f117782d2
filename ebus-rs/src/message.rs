//! The seam towards the message codec.
//!
//! The bus handler treats the codec as opaque: it resolves frames to
//! [`Message`] values through a [`MessageCatalog`] and asks the message to
//! prepare wire frames or to store and decode received data. Concrete
//! catalogs (CSV-driven configurations, say) live behind these traits.
//!
//! The crate ships the one message every participant must know, the
//! standardized identification read (`PB 0x07 / SB 0x04`, called the *scan*
//! message), and [`SimpleCatalog`], a small in-memory catalog that is
//! sufficient to run the daemon and its tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::address;
use crate::result::{Error, Result};
use crate::symbol::{SymbolBuffer, SYN};

/// The two data-carrying parts of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePart {
    MasterData,
    SlaveData,
}

/// One named, typed message of the bus.
pub trait Message: Send + Sync {
    /// The circuit this message belongs to.
    fn circuit(&self) -> &str;

    /// The message name within its circuit.
    fn name(&self) -> &str;

    fn is_write(&self) -> bool {
        false
    }

    fn is_passive(&self) -> bool {
        false
    }

    /// The number of chained parts (1 for plain messages).
    fn count(&self) -> usize {
        1
    }

    /// The source address template, `SYN` for any.
    fn src_address(&self) -> u8 {
        SYN
    }

    /// The destination address template, `SYN` for any.
    fn dst_address(&self) -> u8 {
        SYN
    }

    fn primary_command(&self) -> u8;

    fn secondary_command(&self) -> u8;

    /// Builds the escaped master frame for part `index`, sealed with CRC.
    fn prepare_master(&self, src: u8, dst: u8, input: &str, index: usize) -> Result<SymbolBuffer>;

    /// Builds the escaped slave response frame from textual `input`.
    fn prepare_slave(&self, input: &str) -> Result<SymbolBuffer>;

    /// Stores received data of part `index` in the last-value cache.
    fn store_last_data(&self, part: FramePart, frame: &SymbolBuffer, index: usize) -> Result<()>;

    /// Decodes the last-value cache to text.
    fn decode_last_data(&self, verbose: bool) -> Result<String>;

    /// When the slave data was last stored.
    fn last_update(&self) -> Option<Instant>;

    /// Drops the last-value cache.
    fn invalidate(&self) {}
}

/// The catalog of all known messages.
pub trait MessageCatalog: Send + Sync {
    /// Resolves a master frame to a message. `any_destination` ignores the
    /// destination template; the three `with_*` flags select directions.
    fn find(
        &self,
        frame: &SymbolBuffer,
        any_destination: bool,
        with_read: bool,
        with_write: bool,
        with_passive: bool,
    ) -> Option<Arc<dyn Message>>;

    /// Resolves a message by circuit and name.
    fn find_by_name(
        &self,
        circuit: &str,
        name: &str,
        is_write: bool,
        is_passive: bool,
    ) -> Option<Arc<dyn Message>>;

    /// All messages of a circuit (all circuits for an empty `circuit`).
    fn find_all(&self, circuit: &str, name: &str) -> Vec<Arc<dyn Message>>;

    /// The identification message; with `dst` the per-destination clone
    /// carrying that slave's own cache (created on first use).
    fn scan_message(&self, dst: Option<u8>) -> Option<Arc<dyn Message>>;

    /// The next message due for polling, or `None`.
    fn next_poll(&self) -> Option<Arc<dyn Message>>;

    /// Registers a message for periodic polling.
    fn add_poll_message(&self, message: Arc<dyn Message>, priority: u32);

    /// Drops the cached last value of `message`.
    fn invalidate_cache(&self, message: &dyn Message);
}

/// Manufacturer codes seen in identification responses.
static MANUFACTURERS: &[(u8, &str)] = &[(0xb5, "Vaillant"), (0xfd, "ebusd.eu")];

fn manufacturer_name(code: u8) -> String {
    for (known, name) in MANUFACTURERS {
        if *known == code {
            return (*name).to_string();
        }
    }
    format!("{code:02x}")
}

fn manufacturer_code(name: &str) -> Result<u8> {
    for (code, known) in MANUFACTURERS {
        if known.eq_ignore_ascii_case(name) {
            return Ok(*code);
        }
    }
    u8::from_str_radix(name, 16).map_err(|_| Error::InvalidArg)
}

/// Parses up to four BCD digits into two bytes, left-padded with zeros.
fn parse_bcd_version(text: &str) -> Result<[u8; 2]> {
    if text.is_empty() || text.len() > 4 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidNum);
    }
    let padded = format!("{text:0>4}");
    let high = u8::from_str_radix(&padded[0..2], 16).map_err(|_| Error::InvalidNum)?;
    let low = u8::from_str_radix(&padded[2..4], 16).map_err(|_| Error::InvalidNum)?;
    Ok([high, low])
}

#[derive(Default)]
struct LastData {
    master: Option<SymbolBuffer>,
    slave: Option<SymbolBuffer>,
    updated: Option<Instant>,
}

/// The built-in identification read.
///
/// Master data is empty; the 10-byte slave payload is manufacturer code,
/// five ASCII id bytes, and two BCD version pairs (software, hardware).
pub struct ScanMessage {
    dst: u8,
    last: Mutex<LastData>,
}

/// Primary command of the identification message.
pub const SCAN_PRIMARY: u8 = 0x07;
/// Secondary command of the identification message.
pub const SCAN_SECONDARY: u8 = 0x04;

const SCAN_DATA_LEN: usize = 10;
const SCAN_ID_LEN: usize = 5;

impl ScanMessage {
    /// Creates the generic instance (`dst` = any).
    pub fn new() -> Self {
        Self::for_destination(SYN)
    }

    /// Creates the per-destination clone for one slave.
    pub fn for_destination(dst: u8) -> Self {
        ScanMessage {
            dst,
            last: Mutex::new(LastData::default()),
        }
    }
}

impl Default for ScanMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl Message for ScanMessage {
    fn circuit(&self) -> &str {
        "scan"
    }

    fn name(&self) -> &str {
        "id"
    }

    fn dst_address(&self) -> u8 {
        self.dst
    }

    fn primary_command(&self) -> u8 {
        SCAN_PRIMARY
    }

    fn secondary_command(&self) -> u8 {
        SCAN_SECONDARY
    }

    fn prepare_master(&self, src: u8, dst: u8, _input: &str, _index: usize) -> Result<SymbolBuffer> {
        if !address::is_master(src) {
            return Err(Error::InvalidAddr);
        }
        if !address::is_valid(dst, true) {
            return Err(Error::InvalidAddr);
        }
        let mut frame = SymbolBuffer::new(true);
        for header in [src, dst, SCAN_PRIMARY, SCAN_SECONDARY, 0x00] {
            frame.push(header, true, true)?;
        }
        let crc = frame.crc();
        frame.push(crc, false, false)?;
        Ok(frame)
    }

    fn prepare_slave(&self, input: &str) -> Result<SymbolBuffer> {
        let fields: Vec<&str> = input.split(';').collect();
        if fields.len() != 4 {
            return Err(Error::InvalidArg);
        }
        let manufacturer = manufacturer_code(fields[0])?;
        let id = fields[1];
        if id.is_empty() || id.len() > SCAN_ID_LEN || !id.is_ascii() {
            return Err(Error::InvalidArg);
        }
        let software = parse_bcd_version(fields[2])?;
        let hardware = parse_bcd_version(fields[3])?;

        let mut frame = SymbolBuffer::new(true);
        frame.push(SCAN_DATA_LEN as u8, false, true)?;
        frame.push(manufacturer, false, true)?;
        let mut id_bytes = [b' '; SCAN_ID_LEN];
        id_bytes[..id.len()].copy_from_slice(id.as_bytes());
        for byte in id_bytes {
            frame.push(byte, false, true)?;
        }
        for byte in software.into_iter().chain(hardware) {
            frame.push(byte, false, true)?;
        }
        let crc = frame.crc();
        frame.push(crc, false, false)?;
        Ok(frame)
    }

    fn store_last_data(&self, part: FramePart, frame: &SymbolBuffer, _index: usize) -> Result<()> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match part {
            FramePart::MasterData => last.master = Some(frame.clone()),
            FramePart::SlaveData => {
                if frame.is_empty() || frame.len() < 2 + frame[0] as usize {
                    return Err(Error::InvalidArg);
                }
                last.slave = Some(frame.clone());
                last.updated = Some(Instant::now());
            }
        }
        Ok(())
    }

    fn decode_last_data(&self, verbose: bool) -> Result<String> {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let slave = last.slave.as_ref().ok_or(Error::NotFound)?;
        if slave[0] as usize != SCAN_DATA_LEN {
            return Err(Error::InvalidArg);
        }
        let data = &slave.symbols()[1..1 + SCAN_DATA_LEN];
        let manufacturer = manufacturer_name(data[0]);
        let id: String = data[1..1 + SCAN_ID_LEN]
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect();
        let software = format!("{:02x}{:02x}", data[6], data[7]);
        let hardware = format!("{:02x}{:02x}", data[8], data[9]);
        if verbose {
            Ok(format!(
                "manufacturer={manufacturer};id={id};software={software};hardware={hardware}"
            ))
        } else {
            Ok(format!("{manufacturer};{id};{software};{hardware}"))
        }
    }

    fn last_update(&self) -> Option<Instant> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).updated
    }

    fn invalidate(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.slave = None;
        last.updated = None;
    }
}

struct PollSlot {
    message: Arc<dyn Message>,
    priority: u32,
    last_poll: Option<Instant>,
}

/// A small in-memory [`MessageCatalog`].
pub struct SimpleCatalog {
    scan: Arc<ScanMessage>,
    scan_clones: Mutex<HashMap<u8, Arc<ScanMessage>>>,
    messages: Mutex<Vec<Arc<dyn Message>>>,
    polls: Mutex<Vec<PollSlot>>,
}

impl SimpleCatalog {
    pub fn new() -> Self {
        SimpleCatalog {
            scan: Arc::new(ScanMessage::new()),
            scan_clones: Mutex::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
            polls: Mutex::new(Vec::new()),
        }
    }

    /// Registers a message for lookup.
    pub fn add_message(&self, message: Arc<dyn Message>) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    /// The general lookup set: registered messages plus the canonical scan
    /// message. Per-destination scan clones only hold caches and must never
    /// shadow the canonical instance during resolution.
    fn candidates(&self) -> Vec<Arc<dyn Message>> {
        let mut all: Vec<Arc<dyn Message>> = self
            .messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        all.push(self.scan.clone());
        all
    }
}

impl Default for SimpleCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCatalog for SimpleCatalog {
    fn find(
        &self,
        frame: &SymbolBuffer,
        any_destination: bool,
        with_read: bool,
        with_write: bool,
        with_passive: bool,
    ) -> Option<Arc<dyn Message>> {
        if frame.len() < 4 {
            return None;
        }
        let src = frame[0];
        let dst = frame[1];
        let primary = frame[2];
        let secondary = frame[3];
        // an identification read always resolves to the canonical scan
        // message, no matter which per-destination clones exist
        if primary == SCAN_PRIMARY && secondary == SCAN_SECONDARY && with_read {
            return Some(self.scan.clone());
        }
        self.candidates().into_iter().find(|m| {
            if m.primary_command() != primary || m.secondary_command() != secondary {
                return false;
            }
            let direction_ok = if m.is_passive() {
                with_passive
            } else if m.is_write() {
                with_write
            } else {
                with_read
            };
            if !direction_ok {
                return false;
            }
            if !any_destination && m.dst_address() != SYN && m.dst_address() != dst {
                return false;
            }
            m.src_address() == SYN || m.src_address() == src
        })
    }

    fn find_by_name(
        &self,
        circuit: &str,
        name: &str,
        is_write: bool,
        is_passive: bool,
    ) -> Option<Arc<dyn Message>> {
        self.candidates().into_iter().find(|m| {
            m.circuit().eq_ignore_ascii_case(circuit)
                && m.name().eq_ignore_ascii_case(name)
                && m.is_write() == is_write
                && m.is_passive() == is_passive
        })
    }

    fn find_all(&self, circuit: &str, name: &str) -> Vec<Arc<dyn Message>> {
        self.candidates()
            .into_iter()
            .filter(|m| {
                (circuit.is_empty() || m.circuit().eq_ignore_ascii_case(circuit))
                    && (name.is_empty() || m.name().eq_ignore_ascii_case(name))
            })
            .collect()
    }

    fn scan_message(&self, dst: Option<u8>) -> Option<Arc<dyn Message>> {
        match dst {
            None => Some(self.scan.clone()),
            Some(dst) => {
                let mut clones = self.scan_clones.lock().unwrap_or_else(|e| e.into_inner());
                let clone = clones
                    .entry(dst)
                    .or_insert_with(|| Arc::new(ScanMessage::for_destination(dst)));
                Some(clone.clone())
            }
        }
    }

    fn next_poll(&self) -> Option<Arc<dyn Message>> {
        let mut polls = self.polls.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut best: Option<(usize, u64)> = None;
        for (index, slot) in polls.iter().enumerate() {
            if slot.priority == 0 {
                continue;
            }
            // integer weight keeps the ordering total and reproducible
            let elapsed = slot
                .last_poll
                .map(|t| now.duration_since(t).as_millis() as u64)
                .unwrap_or(u64::MAX / 16);
            let weight = elapsed / slot.priority as u64;
            if best.map_or(true, |(_, w)| weight > w) {
                best = Some((index, weight));
            }
        }
        let (index, _) = best?;
        let slot = &mut polls[index];
        slot.last_poll = Some(now);
        Some(slot.message.clone())
    }

    fn add_poll_message(&self, message: Arc<dyn Message>, priority: u32) {
        let mut polls = self.polls.lock().unwrap_or_else(|e| e.into_inner());
        if polls.iter().any(|s| Arc::ptr_eq(&s.message, &message)) {
            return;
        }
        polls.push(PollSlot {
            message,
            priority,
            last_poll: None,
        });
    }

    fn invalidate_cache(&self, message: &dyn Message) {
        message.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_master_frame() {
        let scan = ScanMessage::new();
        let frame = scan.prepare_master(0x31, 0x08, "", 0).unwrap();
        assert_eq!(frame.symbols(), &[0x31, 0x08, 0x07, 0x04, 0x00, 0xd1]);
    }

    #[test]
    fn scan_master_rejects_bad_addresses() {
        let scan = ScanMessage::new();
        assert_eq!(
            scan.prepare_master(0x08, 0x31, "", 0).unwrap_err(),
            Error::InvalidAddr
        );
        assert_eq!(
            scan.prepare_master(0x31, 0xaa, "", 0).unwrap_err(),
            Error::InvalidAddr
        );
    }

    #[test]
    fn scan_answer_encodes_the_identification_payload() {
        let scan = ScanMessage::new();
        let frame = scan.prepare_slave("ebusd.eu;ebusg;0100;100").unwrap();
        assert_eq!(
            frame.symbols(),
            &[0x0a, 0xfd, 0x65, 0x62, 0x75, 0x73, 0x67, 0x01, 0x00, 0x01, 0x00, 0xda]
        );
    }

    #[test]
    fn scan_decode_round_trip() {
        let scan = ScanMessage::new();
        let mut slave = SymbolBuffer::new(false);
        for byte in [
            0x0a, 0xb5, 0x42, 0x41, 0x49, 0x30, 0x30, 0x01, 0x04, 0x78, 0x03, 0x05,
        ] {
            slave.push(byte, false, true).unwrap();
        }
        scan.store_last_data(FramePart::SlaveData, &slave, 0).unwrap();
        assert_eq!(scan.decode_last_data(false).unwrap(), "Vaillant;BAI00;0104;7803");
        assert!(scan.last_update().is_some());
        scan.invalidate();
        assert_eq!(scan.decode_last_data(false).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn catalog_resolves_scan_by_frame() {
        let catalog = SimpleCatalog::new();
        let mut frame = SymbolBuffer::new(false);
        for byte in [0x31, 0x08, 0x07, 0x04, 0x00] {
            frame.push(byte, false, true).unwrap();
        }
        let found = catalog.find(&frame, false, true, true, true).unwrap();
        assert_eq!(found.primary_command(), SCAN_PRIMARY);
        assert!(catalog.find(&frame, false, false, true, true).is_none());
    }

    #[test]
    fn identification_read_resolves_to_the_canonical_scan_message() {
        let catalog = SimpleCatalog::new();
        let generic = catalog.scan_message(None).unwrap();
        // a cached per-destination clone must not shadow the canonical
        // message during resolution
        let _clone = catalog.scan_message(Some(0x36)).unwrap();
        let mut frame = SymbolBuffer::new(false);
        for byte in [0x10, 0x36, 0x07, 0x04, 0x00] {
            frame.push(byte, false, true).unwrap();
        }
        let found = catalog.find(&frame, false, true, true, true).unwrap();
        assert!(Arc::ptr_eq(&found, &generic));
        let by_name = catalog.find_by_name("scan", "id", false, false).unwrap();
        assert!(Arc::ptr_eq(&by_name, &generic));
    }

    #[test]
    fn catalog_clones_scan_per_destination() {
        let catalog = SimpleCatalog::new();
        let generic = catalog.scan_message(None).unwrap();
        let for_08 = catalog.scan_message(Some(0x08)).unwrap();
        let again = catalog.scan_message(Some(0x08)).unwrap();
        assert!(!Arc::ptr_eq(&generic, &for_08));
        assert!(Arc::ptr_eq(&for_08, &again));
        assert_eq!(for_08.dst_address(), 0x08);
    }

    #[test]
    fn poll_rotation_prefers_never_polled_messages() {
        let catalog = SimpleCatalog::new();
        assert!(catalog.next_poll().is_none());
        let scan = catalog.scan_message(Some(0x08)).unwrap();
        catalog.add_poll_message(scan.clone(), 1);
        let first = catalog.next_poll().unwrap();
        assert!(Arc::ptr_eq(&first, &scan));
        // freshly polled: weight drops until time passes again
        let second = catalog.next_poll().unwrap();
        assert!(Arc::ptr_eq(&second, &scan));
    }

    #[test]
    fn bcd_versions() {
        assert_eq!(parse_bcd_version("100").unwrap(), [0x01, 0x00]);
        assert_eq!(parse_bcd_version("7803").unwrap(), [0x78, 0x03]);
        assert_eq!(parse_bcd_version("12345").unwrap_err(), Error::InvalidNum);
        assert_eq!(parse_bcd_version("1a").unwrap_err(), Error::InvalidNum);
    }
}
