#![allow(dead_code)]

//! Scripted in-memory bus device for driving the handler without hardware.
//!
//! Received bytes come from a queue; every sent byte is recorded and echoed
//! back (the half-duplex line behavior), unless an override replaces the
//! echo (lost arbitration). Feeds append further bytes to the receive queue
//! once the total sent count reaches their trigger, which keeps multi-step
//! exchanges ordered relative to our own transmissions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ebus_rs::device::Device;
use ebus_rs::result::{Error, Result};
use ebus_rs::{SymbolBuffer, SYN};

#[derive(Default)]
pub struct MockState {
    /// Bytes the handler will receive, in order.
    pub rx: VecDeque<u8>,
    /// Every byte the handler sent.
    pub sent: Vec<u8>,
    /// Deliver SYN instead of timing out on an empty receive queue,
    /// imitating a foreign AUTO-SYN generator.
    pub idle_syn: bool,
    /// Replaces the echo of the n-th sent byte (0-based).
    pub echo_overrides: HashMap<usize, u8>,
    /// Once `sent.len()` reaches the trigger, the bytes are appended to
    /// the receive queue.
    pub feeds: Vec<(usize, Vec<u8>)>,
    /// Fail this many upcoming send calls.
    pub fail_sends: u32,
    pub valid: bool,
}

pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new() -> (MockDevice, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState {
            valid: true,
            ..MockState::default()
        }));
        (
            MockDevice {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Device for MockDevice {
    fn open(&mut self) -> Result<()> {
        self.state.lock().unwrap().valid = true;
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.state.lock().unwrap().valid
    }

    fn send(&mut self, symbol: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(Error::Send);
        }
        let index = state.sent.len();
        state.sent.push(symbol);
        let echo = state.echo_overrides.remove(&index).unwrap_or(symbol);
        state.rx.push_back(echo);
        let reached = state.sent.len();
        let mut i = 0;
        while i < state.feeds.len() {
            if state.feeds[i].0 == reached {
                let (_, bytes) = state.feeds.remove(i);
                state.rx.extend(bytes);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<u8> {
        let mut state = self.state.lock().unwrap();
        match state.rx.pop_front() {
            Some(symbol) => Ok(symbol),
            None if state.idle_syn => Ok(SYN),
            None => Err(Error::Timeout),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Builds an escaped master frame from unescaped hex, sealing it with CRC.
pub fn master_frame(hex: &str) -> SymbolBuffer {
    let mut frame = SymbolBuffer::new(true);
    frame.parse_hex(hex, false).expect("valid hex frame");
    frame
}
