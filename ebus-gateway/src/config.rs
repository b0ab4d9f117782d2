//! Daemon configuration.
//!
//! Every handler-recognized setting with its documented default. The CLI
//! in `main.rs` maps flags onto this struct; library users (and the tests)
//! start from `GatewayConfig::default()` and adjust fields directly.

/// Gateway configuration settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Serial device path.
    pub device: String,
    /// Serial baud rate.
    pub baud_rate: u32,

    /// The own master address (must satisfy the master predicate).
    pub own_address: u8,
    /// Whether to answer requests addressed to the own master/slave address.
    pub answer: bool,

    /// How often a send is repeated after lost arbitration.
    pub bus_lost_retries: u32,
    /// How often a failed send is repeated (other than lost arbitration).
    pub failed_send_retries: u32,

    /// Transfer latency of the device in microseconds, added to every
    /// receive deadline.
    pub transfer_latency_us: u64,
    /// Maximum time for bus acquisition in microseconds.
    pub bus_acquire_timeout_us: u64,
    /// Maximum time an addressed slave may take to answer, in microseconds.
    pub slave_recv_timeout_us: u64,

    /// AUTO-SYN symbols to wait after lost arbitration, 0 for auto
    /// detection from the observed master count.
    pub lock_count: u32,
    /// Whether to generate AUTO-SYN symbols on a silent bus.
    pub generate_syn: bool,

    /// Interval of periodic poll messages in seconds, 0 to disable.
    pub poll_interval_s: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 2400, // the bus symbol rate

            own_address: 0x31,
            answer: false,

            bus_lost_retries: 3,
            failed_send_retries: 2,

            transfer_latency_us: 0,       // 0 for USB, ~10000 for IP bridges
            bus_acquire_timeout_us: 9400, // two symbol durations
            slave_recv_timeout_us: 15000,

            lock_count: 0, // auto detection
            generate_syn: false,

            poll_interval_s: 5,
        }
    }
}
