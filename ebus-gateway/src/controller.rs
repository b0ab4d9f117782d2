//! The client-facing control surface.
//!
//! A [`BusController`] is the facade client threads use: it owns nothing of
//! the state machine, only the shared queues and tables, so any number of
//! clones can be used concurrently with the single bus thread.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use ebus_rs::address;
use ebus_rs::message::{FramePart, Message, MessageCatalog, SCAN_PRIMARY, SCAN_SECONDARY};
use ebus_rs::result::{Error, Result};
use ebus_rs::SymbolBuffer;
use log::{error, info};

use crate::bus_handler::{BusShared, GrabMode, LOAD_INIT, SCAN_DONE, SCAN_INIT, SEEN};
use crate::config::GatewayConfig;
use crate::request::Request;

/// Client-side handle to the bus.
#[derive(Clone)]
pub struct BusController {
    shared: Arc<BusShared>,
    catalog: Arc<dyn MessageCatalog>,
    own_master_address: u8,
    own_slave_address: u8,
    answer: bool,
    failed_send_retries: u32,
}

impl BusController {
    pub fn new(
        shared: Arc<BusShared>,
        catalog: Arc<dyn MessageCatalog>,
        config: &GatewayConfig,
    ) -> Self {
        BusController {
            shared,
            catalog,
            own_master_address: config.own_address,
            own_slave_address: address::slave_address(config.own_address),
            answer: config.answer,
            failed_send_retries: config.failed_send_retries,
        }
    }

    pub fn shared(&self) -> &Arc<BusShared> {
        &self.shared
    }

    /// Sends a prepared master frame and waits for the slave's answer,
    /// retrying failed sends up to the configured count.
    pub fn send_and_wait(&self, master: &SymbolBuffer) -> Result<SymbolBuffer> {
        let dst_address = if master.len() > 1 {
            master[1]
        } else {
            return Err(Error::InvalidArg);
        };
        info!("send message: {}", master.to_hex(true, true));
        let mut result = Err(Error::NoSignal);
        for send_retries in (0..=self.failed_send_retries).rev() {
            let request = Request::active(master.clone());
            let id = request.id();
            self.shared.pending.push(request);
            let finished = self.shared.finished.remove(id, true);
            result = match finished {
                None => Err(Error::Timeout),
                Some(request) => {
                    let (result, slave) = request.into_active_result();
                    result.map(|_| slave)
                }
            };
            match &result {
                Ok(_) => {
                    if let Some(message) = self.catalog.find(master, false, true, true, true) {
                        self.catalog.invalidate_cache(&*message);
                    }
                    break;
                }
                Err(err @ (Error::NoSignal | Error::Send | Error::Device)) => {
                    error!("send to {dst_address:02x}: {err}, give up");
                    break;
                }
                Err(err) => {
                    let retry = if send_retries > 0 { ", retry" } else { "" };
                    error!("send to {dst_address:02x}: {err}{retry}");
                }
            }
        }
        result
    }

    /// Initiates a scan of the slave addresses: all valid slaves for a
    /// `full` scan, otherwise only those whose master (or who themselves)
    /// have been seen.
    pub fn start_scan(&self, full: bool) -> Result<()> {
        let mut messages: VecDeque<Arc<dyn Message>> = self
            .catalog
            .find_all("scan", "")
            .into_iter()
            // the identification message is queried exactly once, up front
            .filter(|m| {
                !(m.primary_command() == SCAN_PRIMARY && m.secondary_command() == SCAN_SECONDARY)
            })
            .collect();
        let scan = self.catalog.scan_message(None).ok_or(Error::NotFound)?;
        messages.push_front(scan);

        let seen = self.shared.seen_snapshot();
        let mut slaves = VecDeque::new();
        for candidate in 1..=255u8 {
            if !address::is_valid(candidate, false) || address::is_master(candidate) {
                continue;
            }
            if !full && seen[candidate as usize] & SEEN == 0 {
                match address::master_address(candidate) {
                    Some(master) if seen[master as usize] & SEEN != 0 => {}
                    _ => continue,
                }
            }
            slaves.push_back(candidate);
        }

        let request = Request::scan(
            self.catalog.clone(),
            self.shared.clone(),
            messages,
            slaves,
            self.own_master_address,
        )
        .map_err(|err| if err == Error::Eof { Error::Empty } else { err })?;
        self.shared.scan_started();
        self.shared.pending.push(request);
        Ok(())
    }

    /// One-shot scan of a single slave; records the decoded identification
    /// in the scan-result table and the catalog cache.
    pub fn scan_and_wait(&self, dst_address: u8) -> Result<SymbolBuffer> {
        if !address::is_valid(dst_address, false) || address::is_master(dst_address) {
            return Err(Error::InvalidAddr);
        }
        self.shared.or_seen_flags(dst_address, SCAN_INIT);
        let scan = self.catalog.scan_message(None).ok_or(Error::NotFound)?;
        let master = scan.prepare_master(self.own_master_address, dst_address, "", 0)?;
        let result = self.send_and_wait(&master);
        let slave = match result {
            Ok(slave) => {
                self.shared.or_seen_flags(dst_address, SCAN_DONE);
                slave
            }
            Err(err) => {
                if err != Error::NoSignal {
                    self.shared.or_seen_flags(dst_address, SCAN_DONE);
                }
                return Err(err);
            }
        };
        let mut scan = scan;
        if let Some(clone) = self.catalog.scan_message(Some(dst_address)) {
            if !Arc::ptr_eq(&clone, &scan) {
                scan = clone;
                let _ = scan.store_last_data(FramePart::MasterData, &master, 0);
            }
        }
        scan.store_last_data(FramePart::SlaveData, &slave, 0)?;
        if let Ok(text) = scan.decode_last_data(false) {
            self.shared.set_scan_result(dst_address, text);
        }
        Ok(slave)
    }

    /// Starts or stops grabbing passive frames. Returns whether the mode
    /// changed.
    pub fn enable_grab(&self, enable: bool, all: bool) -> bool {
        self.shared.enable_grab(enable, all)
    }

    /// The scan results in ascending address order, falling back to the
    /// catalog's cached identifications.
    pub fn format_scan_result(&self) -> String {
        let mut output = String::new();
        let running = self.shared.running_scans();
        if running > 0 {
            let _ = writeln!(output, "{running} scan(s) still running");
        }
        let results = self.shared.scan_results_snapshot();
        let mut first = true;
        for (slave, text) in &results {
            if !first {
                output.push('\n');
            }
            first = false;
            let _ = write!(output, "{slave:02x}{text}");
        }
        if first {
            // fall back to identifications gathered outside explicit scans
            let seen = self.shared.seen_snapshot();
            for slave in 1..=255u8 {
                if !address::is_valid(slave, false)
                    || address::is_master(slave)
                    || seen[slave as usize] & SCAN_DONE == 0
                {
                    continue;
                }
                let message = match self.catalog.scan_message(Some(slave)) {
                    Some(message) => message,
                    None => continue,
                };
                if message.last_update().is_none() {
                    continue;
                }
                if let Ok(text) = message.decode_last_data(true) {
                    if !first {
                        output.push('\n');
                    }
                    first = false;
                    let _ = write!(output, "{slave:02x}{text}");
                }
            }
        }
        output
    }

    /// Information about all seen participants, one line per address.
    pub fn format_seen_info(&self) -> String {
        let mut output = String::new();
        let seen = self.shared.seen_snapshot();
        for address_in in 0..=255u8 {
            let flags = seen[address_in as usize];
            let own = address_in == self.own_master_address || address_in == self.own_slave_address;
            if !address::is_valid(address_in, false) || (flags & SEEN == 0 && !own) {
                continue;
            }
            let _ = write!(output, "\naddress {address_in:02x}");
            let master = if address::is_master(address_in) {
                output.push_str(": master");
                Some(address_in)
            } else {
                output.push_str(": slave");
                address::master_address(address_in)
            };
            if let Some(master) = master {
                let _ = write!(output, " #{}", address::master_number(master));
            }
            if address_in == self.own_master_address
                || (self.answer && address_in == self.own_slave_address)
            {
                output.push_str(", ebus-gateway");
                if self.answer {
                    output.push_str(" (answering)");
                }
                if flags & SEEN != 0 {
                    output.push_str(", conflict");
                }
            }
            if flags & SCAN_DONE != 0 {
                output.push_str(", scanned");
                if let Some(message) = self.catalog.scan_message(Some(address_in)) {
                    if message.last_update().is_some() {
                        match message.decode_last_data(true) {
                            Ok(text) => {
                                let _ = write!(output, " \"{text}\"");
                            }
                            Err(err) => {
                                let _ = write!(output, " \"\" error: {err}");
                            }
                        }
                    }
                }
            }
            if let Some(file) = self.shared.loaded_file(address_in) {
                let _ = write!(output, ", loaded {file}");
            }
        }
        output
    }

    /// The grabbed frames, one line each, in key order.
    pub fn format_grab_result(&self) -> String {
        let (mode, grabbed) = self.shared.grab_snapshot();
        if mode == GrabMode::None {
            return "grab disabled".to_string();
        }
        let mut output = String::new();
        let mut first = true;
        for data in grabbed.values() {
            if !first {
                output.push('\n');
            }
            first = false;
            output.push_str(data);
        }
        output
    }

    /// The next slave that has been seen but whose configuration has not
    /// been loaded, or whose master has been seen. The flag tells whether
    /// that slave was already scanned.
    pub fn next_scan_address(&self, last_address: u8) -> Option<(u8, bool)> {
        let seen = self.shared.seen_snapshot();
        let mut candidate = last_address;
        while candidate < 255 {
            candidate += 1;
            if !address::is_valid(candidate, false) || address::is_master(candidate) {
                continue;
            }
            let flags = seen[candidate as usize];
            if flags & (SEEN | LOAD_INIT) == SEEN {
                return Some((candidate, flags & SCAN_INIT != 0));
            }
            if let Some(master) = address::master_address(candidate) {
                if seen[master as usize] & SEEN != 0 && flags & LOAD_INIT == 0 {
                    return Some((candidate, flags & SCAN_INIT != 0));
                }
            }
        }
        None
    }

    /// Marks a slave's configuration as loading/loaded.
    pub fn set_scan_config_loaded(&self, address_in: u8, file: Option<&str>) {
        self.shared.set_scan_config_loaded(address_in, file);
    }

    /// Drops all stored observations.
    pub fn clear(&self) {
        self.shared.clear();
    }

    pub fn has_signal(&self) -> bool {
        self.shared.has_signal()
    }

    pub fn symbol_rate(&self) -> u32 {
        self.shared.symbol_rate()
    }

    pub fn max_symbol_rate(&self) -> u32 {
        self.shared.max_symbol_rate()
    }

    pub fn master_count(&self) -> u32 {
        self.shared.master_count()
    }

    /// Builds a master frame towards `dst_address` for a named message and
    /// sends it.
    pub fn read_by_name(&self, circuit: &str, name: &str, dst_address: u8) -> Result<String> {
        let message = self
            .catalog
            .find_by_name(circuit, name, false, false)
            .ok_or(Error::NotFound)?;
        let master = message.prepare_master(self.own_master_address, dst_address, "", 0)?;
        let slave = self.send_and_wait(&master)?;
        message.store_last_data(FramePart::SlaveData, &slave, 0)?;
        message.decode_last_data(false)
    }

    /// Asks the bus thread to stop and drains the pending queue.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebus_rs::message::SimpleCatalog;
    use ebus_rs::SYN;

    fn controller() -> BusController {
        let shared = BusShared::new();
        let catalog = Arc::new(SimpleCatalog::new());
        BusController::new(shared, catalog, &GatewayConfig::default())
    }

    #[test]
    fn scan_and_wait_rejects_master_addresses() {
        let controller = controller();
        assert_eq!(controller.scan_and_wait(0x31).unwrap_err(), Error::InvalidAddr);
        assert_eq!(controller.scan_and_wait(SYN).unwrap_err(), Error::InvalidAddr);
    }

    #[test]
    fn seen_info_lists_own_addresses() {
        let controller = controller();
        let output = controller.format_seen_info();
        assert!(output.contains("address 31: master"), "{output}");
        assert!(output.contains("ebus-gateway"), "{output}");
        // the own slave address is listed, but not marked as ours unless
        // answering
        assert!(output.contains("address 36: slave"), "{output}");
        assert!(!output.contains("(answering)"), "{output}");
    }

    #[test]
    fn next_scan_address_walks_seen_slaves() {
        let controller = controller();
        assert_eq!(controller.next_scan_address(0), None);
        controller.shared().or_seen_flags(0x08, SEEN);
        assert_eq!(controller.next_scan_address(0), Some((0x08, false)));
        controller.shared().or_seen_flags(0x08, SCAN_INIT);
        assert_eq!(controller.next_scan_address(0), Some((0x08, true)));
        controller.shared().or_seen_flags(0x08, LOAD_INIT);
        assert_eq!(controller.next_scan_address(0), None);
        // a seen master offers all of its unloaded slaves
        controller.shared().or_seen_flags(0x31, SEEN);
        assert_eq!(controller.next_scan_address(0), Some((0x36, false)));
        assert_eq!(controller.next_scan_address(0x36), None);
    }

    #[test]
    fn grab_toggling() {
        let controller = controller();
        // capture starts in "all" mode
        assert!(!controller.enable_grab(true, true));
        assert!(controller.enable_grab(false, false));
        assert_eq!(controller.format_grab_result(), "grab disabled");
        assert!(controller.enable_grab(true, false));
        assert_eq!(controller.format_grab_result(), "");
    }

    #[test]
    fn scan_result_formatting() {
        let controller = controller();
        assert_eq!(controller.format_scan_result(), "");
        controller
            .shared()
            .set_scan_result(0x08, "Vaillant;BAI00;0104;7803".to_string());
        controller
            .shared()
            .set_scan_result(0x04, "Vaillant;EHP00;0327;7201".to_string());
        assert_eq!(
            controller.format_scan_result(),
            "04Vaillant;EHP00;0327;7201\n08Vaillant;BAI00;0104;7803"
        );
    }
}
