//! Requests travelling between client threads and the bus thread.
//!
//! Every request carries the escaped master frame to send and receives
//! exactly one terminal notification. The notification may ask for a
//! re-enqueue (multi-part polls, multi-target scans); active requests never
//! restart and instead carry their result back to the waiting caller
//! through the finished queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ebus_rs::message::{FramePart, Message, MessageCatalog};
use ebus_rs::result::{Error, Result};
use ebus_rs::SymbolBuffer;
use log::{debug, error, info};

use crate::bus_handler::BusShared;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A unit of bus work with its continuation state.
pub struct Request {
    id: u64,
    /// The escaped master frame to send.
    pub master: SymbolBuffer,
    /// How often this request was already restarted after lost arbitration.
    pub bus_lost_retries: u32,
    /// Whether the bus thread destroys the request on completion instead of
    /// handing it to the finished queue.
    pub delete_on_finish: bool,
    kind: RequestKind,
}

enum RequestKind {
    Poll(PollState),
    Scan(ScanState),
    Active(ActiveState),
}

struct PollState {
    message: Arc<dyn Message>,
    index: usize,
}

struct ScanState {
    catalog: Arc<dyn MessageCatalog>,
    shared: Arc<BusShared>,
    message: Arc<dyn Message>,
    index: usize,
    all_messages: VecDeque<Arc<dyn Message>>,
    messages: VecDeque<Arc<dyn Message>>,
    slaves: VecDeque<u8>,
    result_text: String,
}

struct ActiveState {
    result: Result<()>,
    slave: SymbolBuffer,
}

impl Request {
    /// A client-initiated request that is waited for on the finished queue.
    pub fn active(master: SymbolBuffer) -> Request {
        Request {
            id: next_id(),
            master,
            bus_lost_retries: 0,
            delete_on_finish: false,
            kind: RequestKind::Active(ActiveState {
                result: Err(Error::NoSignal),
                slave: SymbolBuffer::new(false),
            }),
        }
    }

    /// A periodic poll of one catalog message.
    pub fn poll(message: Arc<dyn Message>, own_address: u8) -> Result<Request> {
        let master = message.prepare_master(own_address, message.dst_address(), "", 0)?;
        info!("poll cmd: {}", master.to_hex(true, true));
        Ok(Request {
            id: next_id(),
            master,
            bus_lost_retries: 0,
            delete_on_finish: true,
            kind: RequestKind::Poll(PollState { message, index: 0 }),
        })
    }

    /// A multi-target scan driving `messages` across `slaves`, starting with
    /// the first message of the deque.
    pub fn scan(
        catalog: Arc<dyn MessageCatalog>,
        shared: Arc<BusShared>,
        messages: VecDeque<Arc<dyn Message>>,
        slaves: VecDeque<u8>,
        own_address: u8,
    ) -> Result<Request> {
        let all_messages = messages.clone();
        let mut messages = messages;
        let message = messages.pop_front().ok_or(Error::Eof)?;
        let mut state = ScanState {
            catalog,
            shared,
            message,
            index: 0,
            all_messages,
            messages,
            slaves,
            result_text: String::new(),
        };
        let master = prepare_scan(&mut state, own_address)?;
        Ok(Request {
            id: next_id(),
            master,
            bus_lost_retries: 0,
            delete_on_finish: true,
            kind: RequestKind::Scan(state),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Consumes an active request, yielding its terminal result and the raw
    /// slave frame.
    pub fn into_active_result(self) -> (Result<()>, SymbolBuffer) {
        match self.kind {
            RequestKind::Active(state) => (state.result, state.slave),
            _ => (Err(Error::InvalidArg), SymbolBuffer::new(false)),
        }
    }

    /// Delivers the terminal notification. Returns `true` when the request
    /// wants to be re-enqueued with the (re-prepared) master frame.
    pub fn notify(&mut self, result: Result<()>, slave: &SymbolBuffer, own_address: u8) -> bool {
        let restart = match &mut self.kind {
            RequestKind::Active(state) => notify_active(state, result, slave),
            RequestKind::Poll(state) => notify_poll(state, result, slave, own_address),
            RequestKind::Scan(state) => notify_scan(state, result, slave, own_address, &self.master),
        };
        match restart {
            Some(master) => {
                self.master = master;
                true
            }
            None => false,
        }
    }
}

fn notify_active(state: &mut ActiveState, result: Result<()>, slave: &SymbolBuffer) -> Option<SymbolBuffer> {
    if result.is_ok() {
        debug!("read res: {}", slave.to_hex(true, true));
    }
    state.result = result;
    state.slave = slave.clone();
    None
}

fn notify_poll(
    state: &mut PollState,
    result: Result<()>,
    slave: &SymbolBuffer,
    own_address: u8,
) -> Option<SymbolBuffer> {
    let mut result = result;
    if result.is_ok() {
        result = state
            .message
            .store_last_data(FramePart::SlaveData, slave, state.index);
        if result.is_ok() && state.index + 1 < state.message.count() {
            state.index += 1;
            match state
                .message
                .prepare_master(own_address, state.message.dst_address(), "", state.index)
            {
                Ok(master) => {
                    info!("poll cmd: {}", master.to_hex(true, true));
                    return Some(master);
                }
                Err(err) => result = Err(err),
            }
        }
    }
    let decoded = result.and_then(|_| state.message.decode_last_data(false));
    match decoded {
        Ok(output) => info!(
            "poll {} {}: {}",
            state.message.circuit(),
            state.message.name(),
            output
        ),
        Err(err) => error!(
            "poll {} {} failed: {}",
            state.message.circuit(),
            state.message.name(),
            err
        ),
    }
    None
}

fn notify_scan(
    state: &mut ScanState,
    result: Result<()>,
    slave: &SymbolBuffer,
    own_address: u8,
    master: &SymbolBuffer,
) -> Option<SymbolBuffer> {
    let dst = master[1];
    let mut result = result;
    if result.is_ok() {
        // swap in the per-destination clone once the primary read succeeded
        if let Some(generic) = state.catalog.scan_message(None) {
            if Arc::ptr_eq(&state.message, &generic) {
                if let Some(clone) = state.catalog.scan_message(Some(dst)) {
                    state.message = clone;
                    let _ = state
                        .message
                        .store_last_data(FramePart::MasterData, master, state.index);
                }
            }
        }
        result = state
            .message
            .store_last_data(FramePart::SlaveData, slave, state.index);
        if result.is_ok() && state.index + 1 < state.message.count() {
            state.index += 1;
            match prepare_scan(state, own_address) {
                Ok(master) => return Some(master),
                Err(err) => result = Err(err),
            }
        }
        if result.is_ok() {
            match state.message.decode_last_data(false) {
                Ok(text) => state.result_text.push_str(&text),
                Err(err) => result = Err(err),
            }
        }
    }
    match result {
        Err(err) => {
            state.slaves.pop_front();
            if err == Error::Timeout {
                info!("scan {:02x} timed out ({} slaves left)", dst, state.slaves.len());
            } else {
                error!(
                    "scan {:02x} failed ({} slaves left): {}",
                    dst,
                    state.slaves.len(),
                    err
                );
            }
            state.messages.clear(); // skip remaining secondary messages
        }
        Ok(()) => {
            if state.messages.is_empty() {
                state.slaves.pop_front();
                info!("scan {:02x} completed ({} slaves left)", dst, state.slaves.len());
            }
        }
    }
    if state.messages.is_empty() {
        // last message for this address
        state.shared.set_scan_result(dst, state.result_text.clone());
    }
    if state.slaves.is_empty() {
        info!("scan finished");
        state.shared.scan_finished();
        return None;
    }
    if state.messages.is_empty() {
        state.messages = state.all_messages.clone();
        state.result_text.clear();
    }
    state.index = 0;
    state.message = match state.messages.pop_front() {
        Some(message) => message,
        None => {
            state.shared.scan_finished();
            return None;
        }
    };
    match prepare_scan(state, own_address) {
        Ok(master) => Some(master),
        Err(_) => {
            state.shared.scan_finished();
            None // give up
        }
    }
}

fn prepare_scan(state: &mut ScanState, own_address: u8) -> Result<SymbolBuffer> {
    let dst = match state.slaves.front() {
        Some(dst) => *dst,
        None => return Err(Error::Eof),
    };
    if state.index == 0 && state.messages.len() + 1 == state.all_messages.len() {
        // first message for this address
        state.shared.set_scan_result(dst, String::new());
    }
    let master = state.message.prepare_master(own_address, dst, "", state.index)?;
    info!("scan {:02x} cmd: {}", dst, master.to_hex(true, true));
    Ok(master)
}
