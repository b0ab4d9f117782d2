//! End-to-end exercises of the bus handler against the scripted device.
//!
//! Own master address is 0x31 (slave 0x36) throughout.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{master_frame, MockDevice, MockState};
use ebus_rs::message::{Message, MessageCatalog, SimpleCatalog};
use ebus_rs::result::Error;
use ebus_rs::{ACK, NAK, SYN};

use ebus_gateway::bus_handler::{
    BusHandler, BusShared, BusState, SCAN_DONE, SCAN_INIT, SEEN,
};
use ebus_gateway::config::GatewayConfig;
use ebus_gateway::controller::BusController;
use ebus_gateway::request::Request;

fn test_config() -> GatewayConfig {
    GatewayConfig {
        device: "mock".to_string(),
        poll_interval_s: 0,
        ..GatewayConfig::default()
    }
}

struct Fixture {
    handler: BusHandler,
    shared: Arc<BusShared>,
    catalog: Arc<SimpleCatalog>,
    device: Arc<Mutex<MockState>>,
}

fn fixture(config: GatewayConfig) -> Fixture {
    let (device, state) = MockDevice::new();
    let shared = BusShared::new();
    let catalog = Arc::new(SimpleCatalog::new());
    let handler = BusHandler::new(Box::new(device), catalog.clone(), &config, shared.clone());
    Fixture {
        handler,
        shared,
        catalog,
        device: state,
    }
}

/// Drives the handler until the request with `id` lands on the finished
/// queue, with an iteration bound instead of wall-clock time.
fn run_until_finished(fixture: &mut Fixture, id: u64, max_iterations: usize) -> Option<Request> {
    for _ in 0..max_iterations {
        let _ = fixture.handler.handle_symbol();
        if let Some(request) = fixture.shared.finished.remove(id, false) {
            return Some(request);
        }
    }
    None
}

#[test]
fn active_read_succeeds_and_records_the_slave() {
    let mut fx = fixture(test_config());
    {
        let mut device = fx.device.lock().unwrap();
        device.rx.push_back(SYN);
        // after the full master frame: slave ACKs and answers
        device
            .feeds
            .push((7, vec![ACK, 0x03, 0x00, 0x01, 0x02, 0x7b]));
    }

    let request = Request::active(master_frame("3108b5110101"));
    let id = request.id();
    fx.shared.pending.push(request);

    let finished = run_until_finished(&mut fx, id, 100).expect("request must finish");
    let (result, slave) = finished.into_active_result();
    assert_eq!(result, Ok(()));
    assert_eq!(slave.symbols(), &[0x03, 0x00, 0x01, 0x02, 0x7b]);

    // the transfer is closed with our ACK and a SYN
    let _ = fx.handler.handle_symbol();
    let device = fx.device.lock().unwrap();
    assert_eq!(
        device.sent,
        vec![0x31, 0x08, 0xb5, 0x11, 0x01, 0x01, 0x26, ACK, SYN]
    );
    assert_eq!(fx.shared.seen_flags(0x08) & SEEN, SEEN);
    assert_eq!(fx.shared.master_count(), 2);
}

#[test]
fn lost_arbitration_is_retried_with_exactly_one_notification() {
    let mut fx = fixture(test_config());
    {
        let mut device = fx.device.lock().unwrap();
        device.rx.push_back(SYN);
        // another master (0x03, different priority class) wins the first try
        device.echo_overrides.insert(0, 0x03);
        device.feeds.push((1, vec![SYN, SYN, SYN, SYN]));
        device
            .feeds
            .push((8, vec![ACK, 0x03, 0x00, 0x01, 0x02, 0x7b]));
    }

    let request = Request::active(master_frame("3108b5110101"));
    let id = request.id();
    fx.shared.pending.push(request);

    let finished = run_until_finished(&mut fx, id, 100).expect("request must finish");
    let (result, slave) = finished.into_active_result();
    assert_eq!(result, Ok(()));
    assert_eq!(slave.symbols(), &[0x03, 0x00, 0x01, 0x02, 0x7b]);

    // exactly one terminal notification: nothing else finishes
    for _ in 0..20 {
        let _ = fx.handler.handle_symbol();
    }
    assert!(fx.shared.finished.is_empty());
    assert!(fx.shared.pending.is_empty());
    // both arbitration attempts are on the wire
    let device = fx.device.lock().unwrap();
    assert_eq!(device.sent[0], 0x31);
    assert_eq!(device.sent[1], 0x31);
}

#[test]
fn broadcast_write_completes_without_slave_response() {
    let mut fx = fixture(test_config());
    fx.device.lock().unwrap().rx.push_back(SYN);

    let request = Request::active(master_frame("31feb5040107"));
    let id = request.id();
    fx.shared.pending.push(request);

    let finished = run_until_finished(&mut fx, id, 100).expect("request must finish");
    let (result, slave) = finished.into_active_result();
    assert_eq!(result, Ok(()));
    assert!(slave.is_empty());

    let _ = fx.handler.handle_symbol();
    let device = fx.device.lock().unwrap();
    assert_eq!(device.sent, vec![0x31, 0xfe, 0xb5, 0x04, 0x01, 0x07, 0x0c, SYN]);
}

#[test]
fn master_to_master_send_ends_after_the_ack() {
    let mut fx = fixture(test_config());
    {
        let mut device = fx.device.lock().unwrap();
        device.rx.push_back(SYN);
        device.feeds.push((7, vec![ACK]));
    }

    let request = Request::active(master_frame("3110b5040107"));
    let id = request.id();
    fx.shared.pending.push(request);

    let finished = run_until_finished(&mut fx, id, 100).expect("request must finish");
    let (result, slave) = finished.into_active_result();
    assert_eq!(result, Ok(()));
    assert!(slave.is_empty());
    assert_eq!(fx.shared.seen_flags(0x10) & SEEN, SEEN);
}

#[test]
fn slave_nak_is_retried_once_then_surfaced() {
    let mut fx = fixture(test_config());
    {
        let mut device = fx.device.lock().unwrap();
        device.rx.push_back(SYN);
        device.feeds.push((7, vec![NAK]));
        // the repetition re-sends the whole frame, then NAK again
        device.feeds.push((14, vec![NAK]));
    }

    let request = Request::active(master_frame("3108b5110101"));
    let id = request.id();
    fx.shared.pending.push(request);

    let finished = run_until_finished(&mut fx, id, 100).expect("request must finish");
    let (result, _) = finished.into_active_result();
    assert_eq!(result, Err(Error::Nak));

    let device = fx.device.lock().unwrap();
    // 7 symbols per attempt: both attempts on the wire
    assert_eq!(device.sent.len(), 14);
    assert_eq!(&device.sent[7..], &device.sent[0..7]);
}

#[test]
fn passive_crc_error_is_nak_repeated_and_then_grabbed() {
    let mut fx = fixture(test_config());
    {
        let mut device = fx.device.lock().unwrap();
        // foreign master 0x10 reads slave 0x08; first try carries a bad CRC,
        // the slave NAKs, the repetition succeeds
        device.rx.extend([
            SYN,
            0x10, 0x08, 0xb5, 0x11, 0x01, 0x01, 0x88, // bad CRC (0x89 is valid)
            NAK,
            0x10, 0x08, 0xb5, 0x11, 0x01, 0x01, 0x89,
            ACK,
            0x03, 0x00, 0x01, 0x02, 0x7b,
            ACK,
        ]);
    }

    for _ in 0..30 {
        let _ = fx.handler.handle_symbol();
    }

    assert_eq!(fx.handler.state(), BusState::Skip);
    assert!(fx.device.lock().unwrap().sent.is_empty());
    assert!(fx.shared.finished.is_empty());
    assert_eq!(fx.shared.seen_flags(0x10) & SEEN, SEEN);
    assert_eq!(fx.shared.seen_flags(0x08) & SEEN, SEEN);
    // 0x10 plus the master derived from slave 0x08, plus ourselves
    assert_eq!(fx.shared.master_count(), 3);

    // the unknown frame was captured under its header prefix
    let controller = BusController::new(fx.shared.clone(), fx.catalog.clone(), &test_config());
    assert_eq!(
        controller.format_grab_result(),
        "1008b5110101 / 03000102"
    );
}

#[test]
fn scan_of_a_single_slave_populates_the_scan_table() {
    let config = test_config();
    let (device, state) = MockDevice::new();
    {
        let mut device = state.lock().unwrap();
        device.idle_syn = true;
        device.feeds.push((
            6,
            vec![ACK, 0x0a, 0xb5, 0x42, 0x41, 0x49, 0x30, 0x30, 0x01, 0x04, 0x78, 0x03, 0x05],
        ));
        // second read via read_by_name
        device.feeds.push((
            14,
            vec![ACK, 0x0a, 0xb5, 0x42, 0x41, 0x49, 0x30, 0x30, 0x01, 0x04, 0x78, 0x03, 0x05],
        ));
    }
    let shared = BusShared::new();
    let catalog: Arc<SimpleCatalog> = Arc::new(SimpleCatalog::new());
    let controller = BusController::new(shared.clone(), catalog.clone(), &config);
    let mut handler = BusHandler::new(Box::new(device), catalog.clone(), &config, shared.clone());
    let bus_thread = thread::spawn(move || handler.run());

    let slave = controller.scan_and_wait(0x08).expect("scan must succeed");
    assert_eq!(
        slave.symbols(),
        &[0x0a, 0xb5, 0x42, 0x41, 0x49, 0x30, 0x30, 0x01, 0x04, 0x78, 0x03, 0x05]
    );
    assert_eq!(
        shared.scan_result(0x08).as_deref(),
        Some("Vaillant;BAI00;0104;7803")
    );
    let flags = shared.seen_flags(0x08);
    assert_eq!(flags & (SCAN_INIT | SCAN_DONE), SCAN_INIT | SCAN_DONE);
    assert_eq!(
        controller.format_scan_result(),
        "08Vaillant;BAI00;0104;7803"
    );

    // the identification is also readable by name
    let decoded = controller
        .read_by_name("scan", "id", 0x08)
        .expect("read must succeed");
    assert_eq!(decoded, "Vaillant;BAI00;0104;7803");

    controller.request_stop();
    bus_thread.join().unwrap();
}

#[test]
fn auto_syn_generator_acquires_the_bus() {
    let mut config = test_config();
    config.generate_syn = true;
    let mut fx = fixture(config);

    assert!(!fx.shared.has_signal());
    let _ = fx.handler.handle_symbol();

    assert!(fx.shared.has_signal());
    assert_eq!(fx.handler.state(), BusState::Ready);
    assert_eq!(fx.device.lock().unwrap().sent, vec![SYN]);
}

#[test]
fn answers_the_scan_request_when_answering_is_enabled() {
    let mut config = test_config();
    config.answer = true;
    let mut fx = fixture(config);
    {
        let mut device = fx.device.lock().unwrap();
        // foreign master 0x10 scans our own slave address 0x36
        device.rx.extend([SYN, 0x10, 0x36, 0x07, 0x04, 0x00, 0x40]);
        // requester acknowledges our response (ACK + 13 response symbols)
        device.feeds.push((13, vec![ACK]));
    }

    for _ in 0..40 {
        let _ = fx.handler.handle_symbol();
    }

    let device = fx.device.lock().unwrap();
    assert_eq!(
        device.sent,
        vec![
            ACK, // command ACK
            0x0a, 0xfd, 0x65, 0x62, 0x75, 0x73, 0x67, 0x01, 0x00, 0x01, 0x00, 0xda,
        ]
    );
    assert_eq!(fx.shared.seen_flags(0x10) & SEEN, SEEN);
}

#[test]
fn answers_the_scan_request_despite_a_cached_scan_clone() {
    let mut config = test_config();
    config.answer = true;
    let mut fx = fixture(config);
    // a prior full scan leaves a per-destination clone for the own slave
    // address; it must not hijack the answer path
    let _ = fx.catalog.scan_message(Some(0x36));
    {
        let mut device = fx.device.lock().unwrap();
        device.rx.extend([SYN, 0x10, 0x36, 0x07, 0x04, 0x00, 0x40]);
        device.feeds.push((13, vec![ACK]));
    }

    for _ in 0..40 {
        let _ = fx.handler.handle_symbol();
    }

    let device = fx.device.lock().unwrap();
    assert_eq!(
        device.sent,
        vec![
            ACK,
            0x0a, 0xfd, 0x65, 0x62, 0x75, 0x73, 0x67, 0x01, 0x00, 0x01, 0x00, 0xda,
        ]
    );
}

#[test]
fn no_signal_drains_pending_requests() {
    let mut fx = fixture(test_config());

    let request = Request::active(master_frame("3108b5110101"));
    let id = request.id();
    fx.shared.pending.push(request);

    // nothing on the wire at all
    let finished = run_until_finished(&mut fx, id, 5).expect("request must be drained");
    let (result, _) = finished.into_active_result();
    assert_eq!(result, Err(Error::NoSignal));
    assert!(!fx.shared.has_signal());
}

#[test]
fn device_send_failure_surfaces_without_retry() {
    let mut fx = fixture(test_config());
    {
        let mut device = fx.device.lock().unwrap();
        device.rx.push_back(SYN);
        device.fail_sends = 1;
    }

    let request = Request::active(master_frame("3108b5110101"));
    let id = request.id();
    fx.shared.pending.push(request);

    let finished = run_until_finished(&mut fx, id, 10).expect("request must finish");
    let (result, _) = finished.into_active_result();
    assert_eq!(result, Err(Error::Send));
}

#[test]
fn poll_messages_are_injected_when_the_queue_is_idle() {
    let mut config = test_config();
    config.poll_interval_s = 1;
    let mut fx = fixture(config);
    {
        let mut device = fx.device.lock().unwrap();
        device.rx.push_back(SYN);
        device.feeds.push((
            6,
            vec![ACK, 0x0a, 0xb5, 0x42, 0x41, 0x49, 0x30, 0x30, 0x01, 0x04, 0x78, 0x03, 0x05],
        ));
    }
    let message = fx.catalog.scan_message(Some(0x08)).unwrap();
    fx.catalog.add_poll_message(message.clone(), 1);

    for _ in 0..60 {
        let _ = fx.handler.handle_symbol();
        if message.last_update().is_some() {
            break;
        }
    }

    assert!(message.last_update().is_some());
    assert_eq!(
        message.decode_last_data(false).unwrap(),
        "Vaillant;BAI00;0104;7803"
    );
    // poll requests are single-use and never reach the finished queue
    assert!(fx.shared.finished.is_empty());
    assert!(fx.shared.pending.is_empty());
}

#[test]
fn start_scan_walks_all_seen_slaves() {
    let config = test_config();
    let (device, state) = MockDevice::new();
    {
        let mut device = state.lock().unwrap();
        device.idle_syn = true;
        // identification answers for slaves 0x08 and 0x14
        device.feeds.push((
            6,
            vec![ACK, 0x0a, 0xb5, 0x42, 0x41, 0x49, 0x30, 0x30, 0x01, 0x04, 0x78, 0x03, 0x05],
        ));
        device.feeds.push((
            14,
            vec![ACK, 0x0a, 0xfd, 0x65, 0x62, 0x75, 0x73, 0x67, 0x01, 0x00, 0x01, 0x00, 0xda],
        ));
    }
    let shared = BusShared::new();
    let catalog: Arc<SimpleCatalog> = Arc::new(SimpleCatalog::new());
    let controller = BusController::new(shared.clone(), catalog.clone(), &config);

    // masters 0x03 and 0x0f were seen, so their slaves are candidates
    shared.or_seen_flags(0x03, SEEN);
    shared.or_seen_flags(0x0f, SEEN);
    controller.start_scan(false).expect("scan must start");
    assert_eq!(shared.running_scans(), 1);

    let mut handler = BusHandler::new(Box::new(device), catalog, &config, shared.clone());
    let bus_thread = thread::spawn(move || handler.run());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while shared.running_scans() > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    controller.request_stop();
    bus_thread.join().unwrap();

    assert_eq!(shared.running_scans(), 0);
    assert_eq!(
        shared.scan_result(0x08).as_deref(),
        Some("Vaillant;BAI00;0104;7803")
    );
    assert_eq!(
        shared.scan_result(0x14).as_deref(),
        Some("ebusd.eu;ebusg;0100;0100")
    );
    assert_eq!(
        shared.seen_flags(0x08) & (SCAN_INIT | SCAN_DONE),
        SCAN_INIT | SCAN_DONE
    );
}
