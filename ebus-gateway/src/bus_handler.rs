//! Symbol-level handling of the bus.
//!
//! One bus thread owns the device and the state machine. Every loop
//! iteration either sends one symbol (verifying it against the echo the
//! half-duplex line produces) or receives one symbol within the deadline of
//! the current state. Client threads never touch the machine; they talk to
//! it through the pending/finished queues and the [`BusShared`] record.
//!
//! ```text
//! active read:   Ready --QQ--> SendCmd --..CRC--> RecvCmdAck --ACK-->
//!                RecvRes --..CRC--> SendResAck --ACK--> SendSyn --> Skip
//! passive read:  Ready --QQ--> RecvCmd --..CRC--> RecvCmdAck --ACK-->
//!                RecvRes --..CRC--> RecvResAck --ACK--> Skip
//! answering:     RecvCmd --..CRC--> SendCmdAck --ACK--> SendRes -->
//!                RecvResAck --> Skip
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ebus_rs::address;
use ebus_rs::device::Device;
use ebus_rs::message::{FramePart, Message, MessageCatalog};
use ebus_rs::result::{Error, Result};
use ebus_rs::{SymbolBuffer, ACK, BROADCAST, ESC, NAK, SYN};
use log::{debug, error, info};

use crate::config::GatewayConfig;
use crate::queue::RequestQueue;
use crate::request::Request;

/// The default time for retrieving a symbol from an addressed slave.
pub const SLAVE_RECV_TIMEOUT: Duration = Duration::from_micros(15_000);

/// The maximum allowed time for retrieving the AUTO-SYN symbol
/// (45 ms + 2*1.2% + 1 symbol).
pub const SYN_TIMEOUT: Duration = Duration::from_micros(50_800);

/// The time for determining bus signal availability (5 * SYN timeout).
pub const SIGNAL_TIMEOUT: Duration = Duration::from_micros(254_000);

/// The maximum duration of a single symbol
/// (start + 8 bit + stop + extra at 2400 Bd - 2*1.2%).
pub const SYMBOL_DURATION: Duration = Duration::from_micros(4_700);

/// The maximum allowed time for retrieving back a sent symbol.
pub const SEND_TIMEOUT: Duration = Duration::from_micros(9_400);

/// Answer payload for the identification request when acting as a slave.
pub const SCAN_ANSWER: &str = "ebusd.eu;ebusg;0100;100";

/// Seen-table bit: address observed on the bus.
pub const SEEN: u8 = 0x01;
/// Seen-table bit: scan initiated.
pub const SCAN_INIT: u8 = 0x02;
/// Seen-table bit: scan finished.
pub const SCAN_DONE: u8 = 0x04;
/// Seen-table bit: configuration loading initiated.
pub const LOAD_INIT: u8 = 0x08;
/// Seen-table bit: configuration loaded.
pub const LOAD_DONE: u8 = 0x10;

/// The possible bus states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// No signal on the bus.
    NoSignal,
    /// Skip all symbols until the next SYN.
    Skip,
    /// Ready for the next master (after SYN, send/receive QQ).
    Ready,
    /// Receive command (ZZ, PB SB, master data).
    RecvCmd,
    /// Receive command ACK/NAK.
    RecvCmdAck,
    /// Receive response (slave data).
    RecvRes,
    /// Receive response ACK/NAK.
    RecvResAck,
    /// Send command (ZZ, PB SB, master data).
    SendCmd,
    /// Send response ACK/NAK.
    SendResAck,
    /// Send command ACK/NAK.
    SendCmdAck,
    /// Send response (slave data).
    SendRes,
    /// Send SYN for a completed transfer.
    SendSyn,
}

impl BusState {
    fn name(self) -> &'static str {
        match self {
            BusState::NoSignal => "no signal",
            BusState::Skip => "skip",
            BusState::Ready => "ready",
            BusState::RecvCmd => "receive command",
            BusState::RecvCmdAck => "receive command ACK",
            BusState::RecvRes => "receive response",
            BusState::RecvResAck => "receive response ACK",
            BusState::SendCmd => "send command",
            BusState::SendResAck => "send response ACK",
            BusState::SendCmdAck => "send command ACK",
            BusState::SendRes => "send response",
            BusState::SendSyn => "send SYN",
        }
    }
}

impl std::fmt::Display for BusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What to capture of passively received frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabMode {
    None,
    Unknown,
    All,
}

struct GrabState {
    mode: GrabMode,
    /// Captured frames keyed by their header prefix
    /// (QQ ZZ PB SB NN plus up to 4 data bytes).
    grabbed: BTreeMap<String, String>,
}

/// State shared between the bus thread and client threads.
///
/// The queues use mutex + condvar; the tables are guarded by short mutexes
/// taken only at record boundaries; counters and flags are atomics.
pub struct BusShared {
    /// Requests awaiting the bus.
    pub pending: RequestQueue,
    /// Completed requests awaiting their caller.
    pub finished: RequestQueue,
    seen: Mutex<[u8; 256]>,
    scan_results: Mutex<BTreeMap<u8, String>>,
    loaded_files: Mutex<BTreeMap<u8, String>>,
    grab: Mutex<GrabState>,
    running_scans: AtomicU32,
    master_count: AtomicU32,
    sym_per_sec: AtomicU32,
    max_sym_per_sec: AtomicU32,
    signal: AtomicBool,
    stop: AtomicBool,
}

impl BusShared {
    pub fn new() -> Arc<BusShared> {
        Arc::new(BusShared {
            pending: RequestQueue::new(),
            finished: RequestQueue::new(),
            seen: Mutex::new([0; 256]),
            scan_results: Mutex::new(BTreeMap::new()),
            loaded_files: Mutex::new(BTreeMap::new()),
            grab: Mutex::new(GrabState {
                mode: GrabMode::All,
                grabbed: BTreeMap::new(),
            }),
            running_scans: AtomicU32::new(0),
            master_count: AtomicU32::new(1),
            sym_per_sec: AtomicU32::new(0),
            max_sym_per_sec: AtomicU32::new(0),
            signal: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        })
    }

    /// The seen flags of one address.
    pub fn seen_flags(&self, address: u8) -> u8 {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())[address as usize]
    }

    /// Sets seen-table flags for one address.
    pub fn or_seen_flags(&self, address: u8, flags: u8) {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())[address as usize] |= flags;
    }

    pub(crate) fn seen_snapshot(&self) -> [u8; 256] {
        *self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the scan result text for a scanned slave; an empty text only
    /// marks the scan as initiated.
    pub fn set_scan_result(&self, dst_address: u8, text: String) {
        self.or_seen_flags(dst_address, SCAN_INIT);
        if !text.is_empty() {
            self.or_seen_flags(dst_address, SCAN_DONE);
            info!("scan {dst_address:02x}: {text}");
            self.scan_results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(dst_address, text);
        }
    }

    /// The recorded scan result of one slave.
    pub fn scan_result(&self, dst_address: u8) -> Option<String> {
        self.scan_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&dst_address)
            .cloned()
    }

    pub(crate) fn scan_results_snapshot(&self) -> BTreeMap<u8, String> {
        self.scan_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Called by a scan request upon completion.
    pub fn scan_finished(&self) {
        let _ = self
            .running_scans
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn running_scans(&self) -> u32 {
        self.running_scans.load(Ordering::SeqCst)
    }

    pub(crate) fn scan_started(&self) {
        self.running_scans.fetch_add(1, Ordering::SeqCst);
    }

    /// Switches the grab mode; returns whether it changed. The captured map
    /// resets when grabbing is re-enabled after being off.
    pub fn enable_grab(&self, enable: bool, all: bool) -> bool {
        let mode = match (enable, all) {
            (false, _) => GrabMode::None,
            (true, false) => GrabMode::Unknown,
            (true, true) => GrabMode::All,
        };
        let mut grab = self.grab.lock().unwrap_or_else(|e| e.into_inner());
        if grab.mode == mode {
            return false;
        }
        if grab.mode == GrabMode::None {
            grab.grabbed.clear();
        }
        grab.mode = mode;
        true
    }

    pub fn grab_mode(&self) -> GrabMode {
        self.grab.lock().unwrap_or_else(|e| e.into_inner()).mode
    }

    fn record_grab(&self, known: bool, key: String, data: String) {
        let mut grab = self.grab.lock().unwrap_or_else(|e| e.into_inner());
        match grab.mode {
            GrabMode::All => {}
            GrabMode::Unknown if !known => {}
            _ => return,
        }
        grab.grabbed.insert(key, data);
    }

    pub(crate) fn grab_snapshot(&self) -> (GrabMode, BTreeMap<String, String>) {
        let grab = self.grab.lock().unwrap_or_else(|e| e.into_inner());
        (grab.mode, grab.grabbed.clone())
    }

    /// Marks configuration loading of a slave; a file name also marks it
    /// as loaded.
    pub fn set_scan_config_loaded(&self, address: u8, file: Option<&str>) {
        self.or_seen_flags(address, LOAD_INIT);
        if let Some(file) = file {
            self.or_seen_flags(address, LOAD_DONE);
            self.loaded_files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(address, file.to_string());
        }
    }

    pub(crate) fn loaded_file(&self, address: u8) -> Option<String> {
        self.loaded_files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .cloned()
    }

    /// Drops all stored observations (seen table, master count, scan
    /// results).
    pub fn clear(&self) {
        *self.seen.lock().unwrap_or_else(|e| e.into_inner()) = [0; 256];
        self.master_count.store(1, Ordering::SeqCst);
        self.scan_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// True when a signal on the bus is available.
    pub fn has_signal(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    /// The number of received symbols in the last second.
    pub fn symbol_rate(&self) -> u32 {
        self.sym_per_sec.load(Ordering::SeqCst)
    }

    /// The maximum number of received symbols per second ever seen.
    pub fn max_symbol_rate(&self) -> u32 {
        self.max_sym_per_sec.load(Ordering::SeqCst)
    }

    /// The number of masters seen so far (including this one).
    pub fn master_count(&self) -> u32 {
        self.master_count.load(Ordering::SeqCst)
    }

    /// Asks the bus thread to stop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Handles input from and output to the bus.
pub struct BusHandler {
    device: Box<dyn Device>,
    catalog: Arc<dyn MessageCatalog>,
    shared: Arc<BusShared>,

    own_master_address: u8,
    own_slave_address: u8,
    answer: bool,
    bus_lost_retries: u32,
    transfer_latency: Duration,
    bus_acquire_timeout: Duration,
    slave_recv_timeout: Duration,
    auto_lock_count: bool,
    lock_count: u32,
    remain_lock_count: u32,
    generate_syn_interval: Duration,
    poll_interval: Duration,

    state: BusState,
    current_request: Option<Request>,
    /// The unescaped received command.
    command: SymbolBuffer,
    command_crc_valid: bool,
    /// The unescaped received response, or the escaped response to send.
    response: SymbolBuffer,
    response_crc_valid: bool,
    next_send_pos: usize,
    /// Whether the current message part is being repeated.
    repeat: bool,
    last_receive: Option<Instant>,
    last_poll: Option<Instant>,
}

impl BusHandler {
    pub fn new(
        device: Box<dyn Device>,
        catalog: Arc<dyn MessageCatalog>,
        config: &GatewayConfig,
        shared: Arc<BusShared>,
    ) -> Self {
        let auto_lock_count = config.lock_count == 0;
        let generate_syn_interval = if config.generate_syn {
            SYN_TIMEOUT * u32::from(address::master_number(config.own_address)) + SYMBOL_DURATION
        } else {
            Duration::ZERO
        };
        let transfer_latency = Duration::from_micros(config.transfer_latency_us) + device.latency();
        BusHandler {
            device,
            catalog,
            shared,
            own_master_address: config.own_address,
            own_slave_address: address::slave_address(config.own_address),
            answer: config.answer,
            bus_lost_retries: config.bus_lost_retries,
            transfer_latency,
            bus_acquire_timeout: Duration::from_micros(config.bus_acquire_timeout_us),
            slave_recv_timeout: Duration::from_micros(config.slave_recv_timeout_us),
            auto_lock_count,
            lock_count: config.lock_count.max(3),
            remain_lock_count: u32::from(auto_lock_count),
            generate_syn_interval,
            poll_interval: Duration::from_secs(config.poll_interval_s),
            state: BusState::NoSignal,
            current_request: None,
            command: SymbolBuffer::new(false),
            command_crc_valid: false,
            response: SymbolBuffer::new(false),
            response_crc_valid: false,
            next_send_pos: 0,
            repeat: false,
            last_receive: None,
            last_poll: None,
        }
    }

    /// The current state (for status reporting).
    pub fn state(&self) -> BusState {
        self.state
    }

    /// Main bus thread entry: handles symbols until stop is requested, then
    /// drains all pending requests with a no-signal notification.
    pub fn run(&mut self) {
        let mut sym_count: u32 = 0;
        let mut last_time = Instant::now();
        while !self.shared.stop_requested() {
            if self.device.is_valid() {
                let result = self.handle_symbol();
                if result != Err(Error::Timeout) {
                    sym_count += 1;
                }
                let elapsed = last_time.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    let rate = sym_count / elapsed.as_secs().max(1) as u32;
                    self.shared.sym_per_sec.store(rate, Ordering::SeqCst);
                    if rate > self.shared.max_sym_per_sec.load(Ordering::SeqCst) {
                        self.shared.max_sym_per_sec.store(rate, Ordering::SeqCst);
                        if rate > 100 {
                            info!("max. symbols per second: {rate}");
                        }
                    }
                    last_time = Instant::now();
                    sym_count = 0;
                }
            } else {
                std::thread::sleep(Duration::from_millis(10));
                if self.shared.stop_requested() {
                    break;
                }
                match self.device.open() {
                    Ok(()) => info!("re-opened {}", self.device.name()),
                    Err(err) => {
                        error!("unable to open {}: {}", self.device.name(), err);
                        let _ = self.set_state(BusState::NoSignal, Err(err), false);
                    }
                }
                sym_count = 0;
            }
        }
        let _ = self.set_state(BusState::NoSignal, Err(Error::NoSignal), false);
    }

    /// Handles the next symbol on the bus: sends at most one symbol and
    /// consumes exactly one received symbol or its timeout.
    pub fn handle_symbol(&mut self) -> Result<()> {
        let mut timeout = SYN_TIMEOUT;
        let mut send_symbol = ESC;
        let mut sending = false;
        let mut start_id: Option<u64> = None;

        // determine whether a symbol has to be sent and the receive timeout
        match self.state {
            BusState::NoSignal => {
                timeout = if self.generate_syn_interval > Duration::ZERO {
                    self.generate_syn_interval
                } else {
                    SIGNAL_TIMEOUT
                };
            }
            BusState::Skip => timeout = SYN_TIMEOUT,
            BusState::Ready => {
                if self.current_request.is_some() {
                    // make sure a stale request is cleaned up
                    let _ = self.set_state(BusState::Ready, Err(Error::Timeout), false);
                }
                if self.remain_lock_count == 0 && self.current_request.is_none() {
                    start_id = self.shared.pending.peek_id();
                    if start_id.is_none() && self.poll_interval > Duration::ZERO {
                        let due = self
                            .last_poll
                            .map_or(true, |t| t.elapsed() > self.poll_interval);
                        if due {
                            if let Some(message) = self.catalog.next_poll() {
                                self.last_poll = Some(Instant::now());
                                match Request::poll(message, self.own_master_address) {
                                    Ok(request) => {
                                        start_id = Some(request.id());
                                        self.shared.pending.push(request);
                                    }
                                    Err(err) => error!("prepare poll message: {err}"),
                                }
                            }
                        }
                    }
                    if start_id.is_some() {
                        // initiate arbitration
                        send_symbol = self.own_master_address;
                        sending = true;
                    }
                }
            }
            BusState::RecvCmd | BusState::RecvCmdAck => timeout = self.slave_recv_timeout,
            BusState::RecvRes => {
                timeout = if !self.response.is_empty() || self.slave_recv_timeout > SYN_TIMEOUT {
                    self.slave_recv_timeout
                } else {
                    SYN_TIMEOUT
                };
            }
            BusState::RecvResAck => timeout = self.slave_recv_timeout + self.transfer_latency,
            BusState::SendCmd => {
                if let Some(request) = &self.current_request {
                    send_symbol = request.master[self.next_send_pos];
                    sending = true;
                }
            }
            BusState::SendResAck => {
                if self.current_request.is_some() {
                    send_symbol = if self.response_crc_valid { ACK } else { NAK };
                    sending = true;
                }
            }
            BusState::SendCmdAck => {
                if self.answer {
                    send_symbol = if self.command_crc_valid { ACK } else { NAK };
                    sending = true;
                }
            }
            BusState::SendRes => {
                if self.answer {
                    send_symbol = self.response[self.next_send_pos];
                    sending = true;
                }
            }
            BusState::SendSyn => {
                send_symbol = SYN;
                sending = true;
            }
        }

        // send if necessary
        if sending {
            match self.device.send(send_symbol) {
                Ok(()) => {
                    timeout = if self.state == BusState::Ready {
                        self.transfer_latency + self.bus_acquire_timeout
                    } else {
                        self.transfer_latency + SEND_TIMEOUT
                    };
                }
                Err(err) => {
                    sending = false;
                    timeout = SYN_TIMEOUT;
                    self.claim_start_request(start_id.take());
                    let _ = self.set_state(BusState::Skip, Err(err), false);
                }
            }
        }

        // receive next symbol, optionally verifying the echo of the sent one
        let received = self.device.recv(timeout + self.transfer_latency);

        if !sending
            && received == Err(Error::Timeout)
            && self.generate_syn_interval > Duration::ZERO
            && timeout >= self.generate_syn_interval
            && (self.state == BusState::NoSignal || self.state == BusState::Skip)
        {
            return self.generate_syn();
        }

        let symbol = match received {
            Ok(symbol) => symbol,
            Err(err) => {
                if sending {
                    self.claim_start_request(start_id.take());
                }
                let grace_passed = self
                    .last_receive
                    .map_or(true, |t| t.elapsed() > Duration::from_secs(1));
                if (self.generate_syn_interval != SYN_TIMEOUT && grace_passed)
                    || self.state == BusState::NoSignal
                {
                    return self.set_state(BusState::NoSignal, Err(err), false);
                }
                return self.set_state(BusState::Skip, Err(err), false);
            }
        };

        self.last_receive = Some(Instant::now());
        if symbol == SYN && self.state != BusState::SendSyn {
            if !sending && self.remain_lock_count > 0 && self.command.len() != 1 {
                self.remain_lock_count -= 1;
            } else if !sending && self.remain_lock_count == 0 && self.command.len() == 1 {
                // SYN / address / SYN: bus is locked for its own priority
                self.remain_lock_count = 1;
            }
            let result = if self.state == BusState::Skip {
                Ok(())
            } else {
                Err(Error::Syn)
            };
            return self.set_state(BusState::Ready, result, false);
        }

        match self.state {
            BusState::NoSignal => self.set_state(BusState::Skip, Ok(()), false),

            BusState::Skip => Ok(()),

            BusState::Ready => {
                if sending {
                    if let Some(id) = start_id {
                        let request = match self.shared.pending.remove(id, false) {
                            Some(request) => request,
                            // request removed meanwhile (e.g. client timeout)
                            None => return self.set_state(BusState::Skip, Err(Error::Timeout), false),
                        };
                        self.current_request = Some(request);
                        if symbol == send_symbol {
                            // arbitration successful
                            self.next_send_pos = 1;
                            self.repeat = false;
                            return self.set_state(BusState::SendCmd, Ok(()), false);
                        }
                        // arbitration lost; number of SYN to wait before the
                        // next attempt
                        self.remain_lock_count = if address::is_master(symbol) { 2 } else { 1 };
                        if (symbol & 0x0f) != (send_symbol & 0x0f)
                            && self.lock_count > self.remain_lock_count
                        {
                            // different priority class: wait the full lock
                            self.remain_lock_count = self.lock_count;
                        }
                        let _ = self.set_state(BusState::Ready, Err(Error::BusLost), false);
                    }
                }
                // the received symbol is the winning master's address
                if let Err(err) = self.command.push(symbol, false, true) {
                    return self.set_state(BusState::Skip, Err(err), false);
                }
                self.repeat = false;
                self.set_state(BusState::RecvCmd, Ok(()), false)
            }

            BusState::RecvCmd => {
                let header_len = 4usize;
                let crc_pos = if self.command.len() > header_len {
                    header_len + 1 + self.command[header_len] as usize
                } else {
                    usize::MAX
                };
                let within_crc = self.command.len() < crc_pos;
                match self.command.push(symbol, true, within_crc) {
                    Err(err) => self.set_state(BusState::Skip, Err(err), false),
                    Ok(ebus_rs::symbol::Push::Pending) => Ok(()),
                    Ok(ebus_rs::symbol::Push::Done) => {
                        if crc_pos == usize::MAX || self.command.len() != crc_pos + 1 {
                            return Ok(());
                        }
                        // CRC received
                        let dst_address = self.command[1];
                        self.command_crc_valid = self.command[crc_pos] == self.command.crc();
                        if self.command_crc_valid {
                            if dst_address == BROADCAST {
                                self.receive_completed();
                                return self.set_state(BusState::Skip, Ok(()), false);
                            }
                            self.add_seen_address(self.command[0]);
                            if self.answer
                                && (dst_address == self.own_master_address
                                    || dst_address == self.own_slave_address)
                            {
                                return self.set_state(BusState::SendCmdAck, Ok(()), false);
                            }
                            return self.set_state(BusState::RecvCmdAck, Ok(()), false);
                        }
                        if dst_address == BROADCAST {
                            return self.set_state(BusState::Skip, Err(Error::Crc), false);
                        }
                        if self.answer
                            && (dst_address == self.own_master_address
                                || dst_address == self.own_slave_address)
                        {
                            return self.set_state(BusState::SendCmdAck, Err(Error::Crc), false);
                        }
                        if self.repeat {
                            return self.set_state(BusState::Skip, Err(Error::Crc), false);
                        }
                        self.set_state(BusState::RecvCmdAck, Err(Error::Crc), false)
                    }
                }
            }

            BusState::RecvCmdAck => {
                if symbol == ACK {
                    if !self.command_crc_valid {
                        return self.set_state(BusState::Skip, Err(Error::Ack), false);
                    }
                    if let Some(request) = &self.current_request {
                        if address::is_master(request.master[1]) {
                            // master-to-master: done after the ACK
                            return self.set_state(BusState::SendSyn, Ok(()), false);
                        }
                    } else if address::is_master(self.command[1]) {
                        self.receive_completed();
                        return self.set_state(BusState::Skip, Ok(()), false);
                    }
                    self.repeat = false;
                    return self.set_state(BusState::RecvRes, Ok(()), false);
                }
                if symbol == NAK {
                    if !self.repeat {
                        self.repeat = true;
                        self.next_send_pos = 0;
                        self.command.clear(false);
                        if self.current_request.is_some() {
                            return self.set_state(BusState::SendCmd, Err(Error::Nak), true);
                        }
                        return self.set_state(BusState::RecvCmd, Err(Error::Nak), false);
                    }
                    return self.set_state(BusState::Skip, Err(Error::Nak), false);
                }
                self.set_state(BusState::Skip, Err(Error::Ack), false)
            }

            BusState::RecvRes => {
                let crc_pos = if !self.response.is_empty() {
                    1 + self.response[0] as usize
                } else {
                    usize::MAX
                };
                let within_crc = self.response.len() < crc_pos;
                match self.response.push(symbol, true, within_crc) {
                    Err(err) => self.set_state(BusState::Skip, Err(err), false),
                    Ok(ebus_rs::symbol::Push::Pending) => Ok(()),
                    Ok(ebus_rs::symbol::Push::Done) => {
                        if crc_pos == usize::MAX || self.response.len() != crc_pos + 1 {
                            return Ok(());
                        }
                        // CRC received
                        self.response_crc_valid = self.response[crc_pos] == self.response.crc();
                        if self.response_crc_valid {
                            if self.current_request.is_some() {
                                return self.set_state(BusState::SendResAck, Ok(()), false);
                            }
                            return self.set_state(BusState::RecvResAck, Ok(()), false);
                        }
                        if self.repeat {
                            if self.current_request.is_some() {
                                return self.set_state(BusState::SendSyn, Err(Error::Crc), false);
                            }
                            return self.set_state(BusState::Skip, Err(Error::Crc), false);
                        }
                        if self.current_request.is_some() {
                            return self.set_state(BusState::SendResAck, Err(Error::Crc), false);
                        }
                        self.set_state(BusState::RecvResAck, Err(Error::Crc), false)
                    }
                }
            }

            BusState::RecvResAck => {
                if symbol == ACK {
                    if !self.response_crc_valid {
                        return self.set_state(BusState::Skip, Err(Error::Ack), false);
                    }
                    self.receive_completed();
                    return self.set_state(BusState::Skip, Ok(()), false);
                }
                if symbol == NAK {
                    if !self.repeat {
                        self.repeat = true;
                        self.response.clear(false);
                        return self.set_state(BusState::RecvRes, Err(Error::Nak), true);
                    }
                    return self.set_state(BusState::Skip, Err(Error::Nak), false);
                }
                self.set_state(BusState::Skip, Err(Error::Ack), false)
            }

            BusState::SendCmd => {
                let (master_len, dst_address) = match &self.current_request {
                    Some(request) if sending && symbol == send_symbol => {
                        (request.master.len(), request.master[1])
                    }
                    _ => return self.set_state(BusState::Skip, Err(Error::InvalidArg), false),
                };
                self.next_send_pos += 1;
                if self.next_send_pos >= master_len {
                    // master data completely sent
                    if dst_address == BROADCAST {
                        return self.set_state(BusState::SendSyn, Ok(()), false);
                    }
                    self.command_crc_valid = true;
                    return self.set_state(BusState::RecvCmdAck, Ok(()), false);
                }
                Ok(())
            }

            BusState::SendResAck => {
                if self.current_request.is_some() && sending && symbol == send_symbol {
                    if !self.response_crc_valid {
                        if !self.repeat {
                            self.repeat = true;
                            self.response.clear(false);
                            return self.set_state(BusState::RecvRes, Err(Error::Nak), true);
                        }
                        return self.set_state(BusState::SendSyn, Err(Error::Ack), false);
                    }
                    return self.set_state(BusState::SendSyn, Ok(()), false);
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }

            BusState::SendCmdAck => {
                if sending && self.answer && symbol == send_symbol {
                    if !self.command_crc_valid {
                        if !self.repeat {
                            self.repeat = true;
                            self.command.clear(false);
                            return self.set_state(BusState::RecvCmd, Err(Error::Nak), true);
                        }
                        return self.set_state(BusState::Skip, Err(Error::Ack), false);
                    }
                    if address::is_master(self.command[1]) {
                        self.receive_completed();
                        return self.set_state(BusState::Skip, Ok(()), false);
                    }
                    self.next_send_pos = 0;
                    self.repeat = false;
                    return self.prepare_answer();
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }

            BusState::SendRes => {
                if sending && self.answer && symbol == send_symbol {
                    self.next_send_pos += 1;
                    if self.next_send_pos >= self.response.len() {
                        // response data completely sent
                        return self.set_state(BusState::RecvResAck, Ok(()), false);
                    }
                    return Ok(());
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }

            BusState::SendSyn => {
                if sending && symbol == send_symbol {
                    return self.set_state(BusState::Skip, Ok(()), false);
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }
        }
    }

    /// Attempts to act as the AUTO-SYN generator after a silent period.
    fn generate_syn(&mut self) -> Result<()> {
        match self.device.send(SYN) {
            Ok(()) => match self.device.recv(SEND_TIMEOUT) {
                Err(Error::Timeout) => self.set_state(BusState::NoSignal, Err(Error::Timeout), false),
                Err(err) => {
                    error!("unable to receive sent AUTO-SYN symbol: {err}");
                    self.set_state(BusState::Skip, Err(err), false)
                }
                Ok(symbol) if symbol != SYN => {
                    error!("received {symbol:02x} instead of AUTO-SYN symbol");
                    self.set_state(BusState::Skip, Ok(()), false)
                }
                Ok(_) => {
                    if self.generate_syn_interval != SYN_TIMEOUT {
                        // received the own AUTO-SYN symbol back again
                        self.generate_syn_interval = SYN_TIMEOUT;
                        info!("acting as AUTO-SYN generator");
                    }
                    self.remain_lock_count = 0;
                    self.set_state(BusState::Ready, Ok(()), false)
                }
            },
            Err(err) => self.set_state(BusState::Skip, Err(err), false),
        }
    }

    /// Pulls a failed start request out of the pending queue so it gets
    /// notified instead of silently lingering.
    fn claim_start_request(&mut self, start_id: Option<u64>) {
        if let Some(id) = start_id {
            if let Some(request) = self.shared.pending.remove(id, false) {
                self.current_request = Some(request);
            }
        }
    }

    /// Resolves the received command to a message and prepares the slave
    /// response for sending.
    fn prepare_answer(&mut self) -> Result<()> {
        let message = self
            .catalog
            .find(&self.command, false, true, true, true)
            .or_else(|| {
                self.catalog
                    .find(&self.command, true, true, true, true)
                    .filter(|m| m.src_address() == SYN)
            });
        let message = match message {
            Some(message) if !message.is_write() => message,
            // unknown request or wrong direction: deny
            _ => return self.set_state(BusState::Skip, Err(Error::InvalidArg), false),
        };
        // compare by circuit and name so per-destination clones of the
        // identification message are served the same answer
        let is_scan = self.catalog.scan_message(None).map_or(false, |scan| {
            message.circuit() == scan.circuit() && message.name() == scan.name()
        });
        let input = if is_scan { SCAN_ANSWER } else { "" };
        self.response.clear(true); // escape while sending
        match message.prepare_slave(input) {
            Ok(response) => self.response = response,
            Err(err) => return self.set_state(BusState::Skip, Err(err), false),
        }
        self.set_state(BusState::SendRes, Ok(()), false)
    }

    /// Applies a state transition, handling request retry, notification and
    /// queue draining on the way.
    fn set_state(&mut self, state: BusState, result: Result<()>, first_repetition: bool) -> Result<()> {
        if let Some(mut request) = self.current_request.take() {
            if result == Err(Error::BusLost) && request.bus_lost_retries < self.bus_lost_retries {
                debug!("{} during {}, retry", Error::BusLost, self.state);
                request.bus_lost_retries += 1;
                self.shared.pending.push(request);
            } else if state == BusState::SendSyn || (result.is_err() && !first_repetition) {
                match result {
                    Ok(()) => debug!("notify request: done"),
                    Err(err) => debug!("notify request: {err}"),
                }
                if result.is_ok() {
                    let dst_address = request.master[1];
                    self.add_seen_address(dst_address);
                }
                // a SYN while waiting for the slave counts as its timeout
                let normalized = match result {
                    Err(Error::Syn)
                        if self.state == BusState::RecvCmdAck
                            || self.state == BusState::RecvRes =>
                    {
                        Err(Error::Timeout)
                    }
                    other => other,
                };
                let restart = request.notify(normalized, &self.response, self.own_master_address);
                if restart {
                    request.bus_lost_retries = 0;
                    self.shared.pending.push(request);
                } else if !request.delete_on_finish {
                    self.shared.finished.push(request);
                }
            } else {
                self.current_request = Some(request);
            }
        }

        if state == BusState::NoSignal {
            // notify all pending requests
            self.response.clear(false);
            while let Some(mut request) = self.shared.pending.pop(None) {
                let restart = request.notify(Err(Error::NoSignal), &self.response, self.own_master_address);
                if restart {
                    request.bus_lost_retries = 0;
                    self.shared.pending.push(request);
                } else if !request.delete_on_finish {
                    self.shared.finished.push(request);
                }
            }
        }

        if state == self.state {
            return result;
        }

        match &result {
            Err(err) => debug!("{err} during {}, switching to {}", self.state, state),
            Ok(()) => {
                if self.current_request.is_some()
                    || state == BusState::SendCmd
                    || state == BusState::SendResAck
                    || state == BusState::SendSyn
                {
                    debug!("switching from {} to {}", self.state, state);
                }
            }
        }

        if state == BusState::NoSignal {
            error!("signal lost");
        } else if self.state == BusState::NoSignal {
            info!("signal acquired");
        }

        self.state = state;
        self.shared
            .signal
            .store(state != BusState::NoSignal, Ordering::SeqCst);

        if state == BusState::Ready || state == BusState::Skip {
            self.command.clear(false);
            self.command_crc_valid = false;
            self.response.clear(false); // unescape while receiving
            self.response_crc_valid = false;
            self.next_send_pos = 0;
        }

        result
    }

    /// Records a bus address in the seen table; slaves contribute to their
    /// derived master, new masters raise the master count and possibly the
    /// auto-detected lock count.
    fn add_seen_address(&mut self, address_in: u8) {
        if !address::is_valid(address_in, false) {
            return;
        }
        let mut address_in = address_in;
        if !address::is_master(address_in) {
            self.shared.or_seen_flags(address_in, SEEN);
            match address::master_address(address_in) {
                Some(master) => address_in = master,
                None => return,
            }
        }
        if self.shared.seen_flags(address_in) & SEEN == 0 {
            if !self.answer || address_in != self.own_master_address {
                let count = self.shared.master_count.fetch_add(1, Ordering::SeqCst) + 1;
                if self.auto_lock_count && count > self.lock_count {
                    self.lock_count = count;
                }
                info!("new master {address_in:02x}, master count {count}");
            }
            self.shared.or_seen_flags(address_in, SEEN);
        }
    }

    /// Dispatches a successfully completed passive reception: seen table,
    /// grab capture, catalog decode.
    fn receive_completed(&mut self) {
        let src_address = self.command[0];
        let dst_address = self.command[1];
        if src_address == dst_address {
            error!("invalid self-addressed message from {src_address:02x}");
            return;
        }
        self.add_seen_address(src_address);
        self.add_seen_address(dst_address);

        let master_dst = address::is_master(dst_address);
        let command_str = self.command.to_hex(true, true);
        let response_str = self.response.to_hex(true, true);
        if dst_address == BROADCAST {
            info!("update BC cmd: {command_str}");
        } else if master_dst {
            info!("update MM cmd: {command_str}");
        } else {
            info!("update MS cmd: {command_str} / {response_str}");
        }

        let message = self.catalog.find(&self.command, false, true, true, true);

        if self.shared.grab_mode() != GrabMode::None {
            let mut key = command_str.clone();
            // QQ ZZ PB SB NN plus up to 4 data bytes
            key.truncate(2 * (1 + 1 + 2 + 1 + 4));
            let mut data = command_str.clone();
            if dst_address != BROADCAST && !master_dst {
                data.push_str(" / ");
                data.push_str(&response_str);
            }
            if let Some(message) = &message {
                data.push_str(&format!(" = {} {}", message.circuit(), message.name()));
            }
            self.shared.record_grab(message.is_some(), key, data);
        }

        let message = match message {
            None => {
                if dst_address == BROADCAST {
                    info!("unknown BC cmd: {command_str}");
                } else if master_dst {
                    info!("unknown MM cmd: {command_str}");
                } else {
                    info!("unknown MS cmd: {command_str} / {response_str}");
                }
                return;
            }
            Some(message) => message,
        };

        self.catalog.invalidate_cache(&*message);
        let circuit = message.circuit().to_string();
        let name = message.name().to_string();
        let stored = message
            .store_last_data(FramePart::MasterData, &self.command, 0)
            .and_then(|_| message.store_last_data(FramePart::SlaveData, &self.response, 0));
        match stored.and_then(|_| message.decode_last_data(false)) {
            Err(err) => error!(
                "unable to parse {circuit} {name} from {command_str} / {response_str}: {err}"
            ),
            Ok(data) => {
                let own = if master_dst {
                    self.own_master_address
                } else {
                    self.own_slave_address
                };
                if self.answer && dst_address == own {
                    info!("self-update {circuit} {name} QQ={src_address:02x}: {data}");
                } else if message.dst_address() == SYN {
                    if message.src_address() == SYN {
                        info!(
                            "update {circuit} {name} QQ={src_address:02x} ZZ={dst_address:02x}: {data}"
                        );
                    } else {
                        info!("update {circuit} {name} ZZ={dst_address:02x}: {data}");
                    }
                } else if message.src_address() == SYN {
                    info!("update {circuit} {name} QQ={src_address:02x}: {data}");
                } else {
                    info!("update {circuit} {name}: {data}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebus_rs::message::SimpleCatalog;

    struct NullDevice;

    impl Device for NullDevice {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_valid(&self) -> bool {
            true
        }
        fn send(&mut self, _symbol: u8) -> Result<()> {
            Ok(())
        }
        fn recv(&mut self, _timeout: Duration) -> Result<u8> {
            Err(Error::Timeout)
        }
        fn name(&self) -> &str {
            "null"
        }
    }

    fn handler() -> (BusHandler, Arc<BusShared>) {
        let shared = BusShared::new();
        let catalog = Arc::new(SimpleCatalog::new());
        let config = GatewayConfig::default();
        let handler = BusHandler::new(Box::new(NullDevice), catalog, &config, shared.clone());
        (handler, shared)
    }

    #[test]
    fn seen_slave_contributes_to_its_master() {
        let (mut handler, shared) = handler();
        handler.add_seen_address(0x08);
        assert_eq!(shared.seen_flags(0x08) & SEEN, SEEN);
        assert_eq!(shared.seen_flags(0x03) & SEEN, SEEN);
        assert_eq!(shared.master_count(), 2);
    }

    #[test]
    fn auto_lock_count_follows_master_count() {
        let (mut handler, shared) = handler();
        assert_eq!(handler.lock_count, 3);
        for master in [0x00u8, 0x10, 0x30, 0x70] {
            handler.add_seen_address(master);
        }
        assert_eq!(shared.master_count(), 5);
        assert_eq!(handler.lock_count, 5);
    }

    #[test]
    fn invalid_addresses_are_not_recorded() {
        let (mut handler, shared) = handler();
        handler.add_seen_address(SYN);
        handler.add_seen_address(BROADCAST);
        assert_eq!(shared.seen_flags(SYN), 0);
        assert_eq!(shared.seen_flags(BROADCAST), 0);
        assert_eq!(shared.master_count(), 1);
    }

    #[test]
    fn seen_bits_are_set_for_valid_addresses_only() {
        let (mut handler, shared) = handler();
        for address_in in 0u16..256 {
            handler.add_seen_address(address_in as u8);
        }
        let seen = shared.seen_snapshot();
        for (address_in, flags) in seen.iter().enumerate() {
            let address_in = address_in as u8;
            if flags & SEEN != 0 {
                assert!(address::is_valid(address_in, false), "{address_in:#04x}");
            }
            if address::is_master(address_in) {
                assert_eq!(flags & SEEN, SEEN, "{address_in:#04x}");
            }
        }
    }
}
