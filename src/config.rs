use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use std::collections::{HashMap, HashSet};

pub const MIN_POLL_INTERVAL: u64 = 5;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverters: Vec<Inverter>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Inverter {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_port")]
    pub port: u16,
    #[serde_as(as = "DisplayFromStr")]
    pub datalog: Serial,
    #[serde_as(as = "DisplayFromStr")]
    pub serial: Serial,

    /// seconds
    #[serde(default = "Config::default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "Config::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// seconds
    #[serde(default = "Config::default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "Config::default_retry_budget")]
    pub retry_budget: u32,
    /// seconds
    #[serde(default = "Config::default_reconnect_delay_max")]
    pub reconnect_delay_max: u64,
    /// seconds
    #[serde(default = "Config::default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    #[serde(default = "Config::default_enabled")]
    pub respond_to_heartbeats: bool,
    #[serde(default = "Config::default_enabled")]
    pub use_tcp_nodelay: bool,
    #[serde(default = "Config::default_register_block_size")]
    pub register_block_size: u16,
    #[serde(default = "Config::default_merge_gap")]
    pub merge_gap: u16,
    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub wire: WireFormat,

    #[serde(default)]
    pub bindings: Vec<RegisterBinding>,
    #[serde(default)]
    pub switches: Vec<SwitchBinding>,
}

impl Inverter {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn datalog(&self) -> Serial {
        self.datalog
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Time between poll cycles, never less than 5s.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(MIN_POLL_INTERVAL))
    }

    /// How long one exchange waits for its reply.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Bound on the TCP connect, not the handshake.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Consecutive timeouts tolerated before the session is dropped. Also the
    /// number of attempts a bank gets when its replies fail validation.
    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Ceiling for the reconnect backoff.
    pub fn reconnect_delay_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_max)
    }

    /// Silence after the last heartbeat that counts as a dead link.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn respond_to_heartbeats(&self) -> bool {
        self.respond_to_heartbeats
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay
    }

    /// Largest bank the planner may request.
    pub fn register_block_size(&self) -> u16 {
        self.register_block_size
    }

    /// Unused registers the planner will read to join two banks.
    pub fn merge_gap(&self) -> u16 {
        self.merge_gap
    }

    /// When set, every write is refused before touching the wire.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Byte order and checksum used on the wire.
    pub fn wire(&self) -> &WireFormat {
        &self.wire
    }

    pub fn bindings(&self) -> &[RegisterBinding] {
        &self.bindings
    }

    pub fn switches(&self) -> &[SwitchBinding] {
        &self.switches
    }

    /// Looks up a switch binding by slot name.
    pub fn switch(&self, slot: &str) -> Option<&SwitchBinding> {
        self.switches.iter().find(|s| s.slot == slot)
    }

    fn validate(&self, i: usize) -> Result<()> {
        let path = format!("inverters[{}]", i);

        if self.port == 0 {
            bail!("{}.port must be between 1 and 65535", path);
        }
        if self.host.is_empty() {
            bail!("{}.host cannot be empty", path);
        }
        if self.read_timeout_ms == 0 {
            bail!("{}.read_timeout_ms must be non-zero", path);
        }
        if self.connect_timeout == 0 {
            bail!("{}.connect_timeout must be non-zero", path);
        }
        if self.heartbeat_timeout == 0 {
            bail!("{}.heartbeat_timeout must be non-zero", path);
        }
        if self.reconnect_delay_max == 0 {
            bail!("{}.reconnect_delay_max must be non-zero", path);
        }
        if !(2..=lxp::packet::MAX_REGISTERS_PER_READ).contains(&self.register_block_size) {
            bail!(
                "{}.register_block_size must be between 2 and {}",
                path,
                lxp::packet::MAX_REGISTERS_PER_READ
            );
        }

        let mut slots = HashSet::new();

        for (j, binding) in self.bindings.iter().enumerate() {
            let path = format!("{}.bindings[{}]", path, j);

            if !slots.insert(binding.slot.as_str()) {
                bail!("{}: duplicate slot {}", path, binding.slot);
            }
            if !(1..=2).contains(&binding.word_span) {
                bail!("{}.word_span must be 1 or 2", path);
            }
            if binding.end() > u16::MAX as u32 + 1 {
                bail!("{}: registers run past the end of the address space", path);
            }
            if let Some(scale) = binding.scale {
                if !scale.is_finite() || scale <= 0.0 {
                    bail!("{}.scale must be a positive number", path);
                }
            }
            match binding.decode {
                DecodeKind::FloatDivN if binding.scale.is_none() => {
                    bail!("{}: float_div_n needs a scale", path)
                }
                DecodeKind::Bitmask if binding.mask.unwrap_or_default() == 0 => {
                    bail!("{}: bitmask needs a non-zero mask", path)
                }
                _ => {}
            }
        }

        let mut masks: HashMap<u16, u16> = HashMap::new();

        for (j, switch) in self.switches.iter().enumerate() {
            let path = format!("{}.switches[{}]", path, j);

            if !slots.insert(switch.slot.as_str()) {
                bail!("{}: duplicate slot {}", path, switch.slot);
            }
            if switch.mask == 0 {
                bail!("{}.mask must be non-zero", path);
            }

            let used = masks.entry(switch.address).or_default();
            if *used & switch.mask != 0 {
                bail!(
                    "{}: mask {:#06x} overlaps another switch on register {}",
                    path,
                    switch.mask,
                    switch.address
                );
            }
            *used |= switch.mask;
        }

        Ok(())
    }
} // }}}

impl Config {
    /// Reads and validates the YAML config at `file`.
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    /// Parses and validates config held in memory.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    pub fn inverters(&self) -> &[Inverter] {
        &self.inverters
    }

    pub fn enabled_inverters(&self) -> impl Iterator<Item = &Inverter> {
        self.inverters.iter().filter(|i| i.enabled())
    }

    /// Finds the enabled inverter reached through dongle `datalog`.
    pub fn enabled_inverter_with_datalog(&self, datalog: Serial) -> Option<&Inverter> {
        self.enabled_inverters().find(|i| i.datalog() == datalog)
    }

    /// Logs one line per inverter at startup.
    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!(
            "  Inverters: {} configured, {} enabled",
            self.inverters.len(),
            self.enabled_inverters().count()
        );
        for (i, inv) in self.inverters.iter().enumerate() {
            info!("    Inverter[{}]:", i);
            info!("      Enabled: {}", inv.enabled);
            info!("      Address: {}:{}", inv.host, inv.port);
            info!("      Datalog: {}", inv.datalog);
            info!("      Serial: {}", inv.serial);
            info!("      Poll Interval: {}s", inv.poll_interval().as_secs());
            info!("      Read Timeout: {}ms", inv.read_timeout_ms);
            info!("      Retry Budget: {}", inv.retry_budget);
            info!("      TCP NoDelay: {}", inv.use_tcp_nodelay);
            info!("      Register Block Size: {}", inv.register_block_size);
            info!("      Wire: {:?} / {:?}", inv.wire.byte_order, inv.wire.checksum);
            info!("      Bindings: {}, Switches: {}", inv.bindings.len(), inv.switches.len());
            info!("      Read Only: {}", inv.read_only);
        }
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        let mut datalogs = HashSet::new();

        for (i, inv) in self.inverters.iter().enumerate() {
            if !datalogs.insert(inv.datalog) {
                bail!("inverters[{}]: duplicate datalog {}", i, inv.datalog);
            }
            inv.validate(i)?;
        }

        Ok(())
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_port() -> u16 {
        8000
    }

    fn default_poll_interval() -> u64 {
        20
    }

    fn default_read_timeout_ms() -> u64 {
        5000
    }

    fn default_connect_timeout() -> u64 {
        10
    }

    fn default_retry_budget() -> u32 {
        3
    }

    fn default_reconnect_delay_max() -> u64 {
        60
    }

    fn default_heartbeat_timeout() -> u64 {
        90
    }

    fn default_register_block_size() -> u16 {
        40
    }

    fn default_merge_gap() -> u16 {
        8
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
