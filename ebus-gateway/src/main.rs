//! Binary entry point: CLI, wiring, bus thread, status loop.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use ebus_rs::address;
use ebus_rs::device::SerialDevice;
use ebus_rs::message::SimpleCatalog;
use log::{info, warn};

use ebus_gateway::bus_handler::{BusHandler, BusShared};
use ebus_gateway::config::GatewayConfig;
use ebus_gateway::controller::BusController;

#[derive(Parser, Debug)]
#[command(name = "ebus-gateway", about = "Daemon for the eBUS heating bus", version)]
struct Args {
    /// Serial device connected to the bus
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    device: String,

    /// Own bus address (hex master address)
    #[arg(short = 'a', long, default_value = "31", value_parser = parse_address)]
    address: u8,

    /// Actively answer requests from other masters
    #[arg(long)]
    answer: bool,

    /// Repeat sends after lost arbitration this many times
    #[arg(long, default_value_t = 3)]
    acquire_retries: u32,

    /// Repeat failed sends this many times
    #[arg(long, default_value_t = 2)]
    send_retries: u32,

    /// Transfer latency in microseconds (0 for USB, ~10000 for IP)
    #[arg(long, default_value_t = 0)]
    latency: u64,

    /// Stop bus acquisition after this many microseconds
    #[arg(long, default_value_t = 9400)]
    acquire_timeout: u64,

    /// Expect a slave to answer within this many microseconds
    #[arg(long, default_value_t = 15000)]
    receive_timeout: u64,

    /// AUTO-SYN symbols to wait after lost arbitration (0 = auto)
    #[arg(long, default_value_t = 0)]
    lock_count: u32,

    /// Enable AUTO-SYN symbol generation
    #[arg(long)]
    generate_syn: bool,

    /// Poll for data every this many seconds (0 = disable)
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
}

fn parse_address(text: &str) -> Result<u8, String> {
    let address = u8::from_str_radix(text, 16).map_err(|e| e.to_string())?;
    if !address::is_master(address) {
        return Err(format!("{address:#04x} is not a master address"));
    }
    Ok(address)
}

impl Args {
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            device: self.device,
            own_address: self.address,
            answer: self.answer,
            bus_lost_retries: self.acquire_retries,
            failed_send_retries: self.send_retries,
            transfer_latency_us: self.latency,
            bus_acquire_timeout_us: self.acquire_timeout,
            slave_recv_timeout_us: self.receive_timeout,
            lock_count: self.lock_count,
            generate_syn: self.generate_syn,
            poll_interval_s: self.poll_interval,
            ..GatewayConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    info!("ebus-gateway starting");
    info!("  device: {}", config.device);
    info!(
        "  own address: {:02x}/{:02x}{}",
        config.own_address,
        address::slave_address(config.own_address),
        if config.answer { " (answering)" } else { "" }
    );

    let mut device = SerialDevice::new(&config.device, config.baud_rate);
    if let Err(err) = ebus_rs::device::Device::open(&mut device) {
        warn!("unable to open {}: {} (will keep trying)", config.device, err);
    }

    let catalog = Arc::new(SimpleCatalog::new());
    let shared = BusShared::new();
    let controller = BusController::new(shared.clone(), catalog.clone(), &config);

    let mut handler = BusHandler::new(Box::new(device), catalog, &config, shared.clone());
    let bus_thread = thread::Builder::new()
        .name("bus".to_string())
        .spawn(move || handler.run())?;

    info!("gateway running");

    let mut last_rate = 0u32;
    let mut last_masters = 1u32;
    let mut had_signal = false;
    loop {
        thread::sleep(Duration::from_secs(1));
        if shared.stop_requested() {
            break;
        }

        let signal = controller.has_signal();
        if signal != had_signal {
            had_signal = signal;
            if !signal {
                warn!("bus signal lost");
            }
        }
        let rate = controller.symbol_rate();
        let masters = controller.master_count();
        if masters != last_masters {
            last_masters = masters;
            info!("masters on the bus: {masters}");
        }
        if rate != last_rate && rate > 0 {
            last_rate = rate;
            log::debug!("symbol rate: {rate}/s (max {})", controller.max_symbol_rate());
        }
    }

    controller.request_stop();
    bus_thread
        .join()
        .map_err(|_| anyhow::anyhow!("bus thread panicked"))?;
    Ok(())
}
