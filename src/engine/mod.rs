use crate::prelude::*;

pub mod commands;
pub mod gate;

use commands::{read_bank::ReadBank, set_hold::SetHold, update_hold::UpdateHold};
use gate::{Gate, Link};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const RESTART_REGISTER: u16 = 11;
const RESTART_VALUE: u16 = 128;

/// Where an engine is in its connection lifecycle. Published on a `watch`
/// channel; the sink only hears about connect and disconnect.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Disconnected,
    Connecting,
    Ready,
    Polling,
    Writing,
}

/// Traffic counters for one inverter, printed at shutdown.
#[derive(Clone, Debug, Default)]
pub struct PacketStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub heartbeats_received: u64,
    pub heartbeats_sent: u64,
    pub frame_errors: u64,
    pub timeouts: u64,
    pub connections: u64,
    pub disconnections: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub last_error: Option<String>,
}

impl PacketStats {
    pub fn print_summary(&self, datalog: Serial) {
        info!("Packet Statistics for {}:", datalog);
        info!("  Total packets sent: {}", self.packets_sent);
        info!("  Total packets received: {}", self.packets_received);
        info!("  Heartbeats:");
        info!("    Received: {}", self.heartbeats_received);
        info!("    Sent: {}", self.heartbeats_sent);
        info!("  Errors:");
        info!("    Frame errors: {}", self.frame_errors);
        info!("    Timeouts: {}", self.timeouts);
        info!("  Connection Stats:");
        info!("    Connections: {}", self.connections);
        info!("    Disconnections: {}", self.disconnections);
        info!("  Writes: {} ({} failed)", self.writes, self.write_errors);
        if let Some(last_error) = &self.last_error {
            info!("  Last error: {}", last_error);
        }
    }
}

/// What one poll cycle achieved.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PollReport {
    pub banks_read: usize,
    pub banks_failed: usize,
    pub values_published: usize,
}

struct Inner {
    config: config::Inverter,
    banks: Vec<Bank>,
    gate: Gate,
    cache: RegisterCache,
    values: Mutex<HashMap<String, Value>>,
    state: watch::Sender<EngineState>,
    sink: Arc<dyn Sink>,
    stats: Arc<Mutex<PacketStats>>,
    shutdown: CancellationToken,
}

/// The protocol engine for one inverter. Cheap to clone; every clone drives
/// the same connection.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Plans the banks for `config`. Fails when a binding cannot fit in one
    /// bank. Nothing is connected until `connect` or `start`.
    pub fn new(config: config::Inverter, sink: Arc<dyn Sink>) -> Result<Self> {
        let planner = BankPlanner::new(config.merge_gap(), config.register_block_size());
        let banks = planner.plan_bindings(config.bindings(), config.switches());

        if banks.iter().any(|b| b.count > planner.max_count()) {
            bail!(
                "inverter {}: a binding spans more registers than register_block_size",
                config.datalog()
            );
        }

        let (state, _) = watch::channel(EngineState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                banks,
                gate: Gate::new(),
                cache: RegisterCache::new(),
                values: Mutex::new(HashMap::new()),
                state,
                sink,
                stats: Arc::new(Mutex::new(PacketStats::default())),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &config::Inverter {
        &self.inner.config
    }

    pub fn datalog(&self) -> Serial {
        self.inner.config.datalog()
    }

    /// Banks read on every poll, holding registers first.
    pub fn banks(&self) -> &[Bank] {
        &self.inner.banks
    }

    pub fn cache(&self) -> &RegisterCache {
        &self.inner.cache
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Receiver that sees every state change, including polling and writing.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// True while a session is open.
    pub fn is_connected(&self) -> bool {
        !matches!(
            self.state(),
            EngineState::Disconnected | EngineState::Connecting
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Snapshot of the packet counters.
    pub fn stats(&self) -> PacketStats {
        self.stats_lock().clone()
    }

    /// Last value published for `slot`, if it has been read yet.
    pub fn last_value(&self, slot: &str) -> Option<Value> {
        self.values().get(slot).cloned()
    }

    /// Last known state of switch `slot`. `None` for unknown slots and
    /// switches not yet polled.
    pub fn switch_state(&self, slot: &str) -> Option<bool> {
        self.inner.config.switch(slot)?;
        self.last_value(slot).and_then(|v| v.as_bool())
    }

    /// Opens a session and runs the handshake read. A no-op when already
    /// connected.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut link = self.inner.gate.lock_for_poll().await;
        if link.session.is_some() {
            return Ok(());
        }
        if self.is_stopped() {
            return Err(ConnectError::Cancelled);
        }

        self.set_state(EngineState::Connecting);

        let mut session = match Session::connect(
            &self.inner.config,
            self.inner.shutdown.clone(),
            self.inner.stats.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.record_error(&e);
                self.set_state(EngineState::Disconnected);
                return Err(e);
            }
        };

        // the first exchange proves both serials are the ones we expect
        let handshake = self
            .inner
            .banks
            .first()
            .map(|b| Bank::new(b.kind, b.start, 1))
            .unwrap_or_else(|| Bank::new(RegisterKind::Hold, 0, 1));

        match ReadBank::new(handshake)
            .run(&mut session, self.inner.config.read_timeout())
            .await
        {
            Ok(reading) => self.inner.cache.store_bank(&reading),
            Err(e) => {
                warn!("inverter {}: handshake failed: {}", self.datalog(), e);
                session.close().await;
                let e = ConnectError::Handshake(e);
                self.record_error(&e);
                self.set_state(EngineState::Disconnected);
                return Err(e);
            }
        }

        link.session = Some(session);
        link.failures = 0;
        self.stats_lock().connections += 1;
        self.set_state(EngineState::Ready);

        info!("inverter {}: ready, polling {} banks", self.datalog(), self.inner.banks.len());

        Ok(())
    }

    /// Reads every planned bank once and publishes what it decodes. Banks
    /// read before a connection failure are still published.
    ///
    /// A bank whose replies keep failing validation is skipped for this
    /// cycle and the session is kept. Only timeouts past `retry_budget` or a
    /// lost connection tear it down.
    pub async fn poll_once(&self) -> Result<PollReport, ExchangeError> {
        let mut guard = self.inner.gate.lock_for_poll().await;
        let link = &mut *guard;

        if link.session.is_none() {
            return Err(ExchangeError::ConnectionLost("not connected".into()));
        }

        self.set_state(EngineState::Polling);

        let timeout = self.inner.config.read_timeout();
        let retry_budget = self.inner.config.retry_budget().max(1);
        let mut report = PollReport::default();

        for bank in &self.inner.banks {
            let mut attempts = 0;

            let result = loop {
                let Some(session) = link.session.as_mut() else {
                    break Err(ExchangeError::ConnectionLost("not connected".into()));
                };

                attempts += 1;
                match ReadBank::new(*bank).run(session, timeout).await {
                    Ok(reading) => break Ok(reading),
                    Err(e) if e.is_connection_fatal() => break Err(e),
                    // the link answered, so only this bank is spent
                    Err(ExchangeError::Frame(e)) => {
                        warn!(
                            "inverter {}: bad reply reading {} ({}/{}): {}",
                            self.datalog(),
                            bank,
                            attempts,
                            retry_budget,
                            e
                        );
                        self.record_error(&e);

                        let refused = matches!(e, FrameError::DeviceException { .. });
                        if refused || attempts >= retry_budget {
                            break Err(ExchangeError::Frame(e));
                        }
                    }
                    Err(e) => {
                        link.failures += 1;
                        warn!(
                            "inverter {}: reading {} failed ({}/{}): {}",
                            self.datalog(),
                            bank,
                            link.failures,
                            retry_budget,
                            e
                        );
                        self.record_error(&e);

                        if link.failures >= retry_budget {
                            break Err(e);
                        }
                    }
                }
            };

            match result {
                Ok(reading) => {
                    link.failures = 0;
                    report.banks_read += 1;
                    report.values_published += self.publish(&reading);
                }
                Err(ExchangeError::Frame(e)) => {
                    report.banks_failed += 1;
                    warn!("inverter {}: skipping {} this cycle: {}", self.datalog(), bank, e);
                }
                Err(e) => {
                    report.banks_failed += 1;
                    self.teardown(link, &e).await;
                    return Err(e);
                }
            }
        }

        self.set_state(EngineState::Ready);

        debug!(
            "inverter {}: poll complete, {} banks, {} values",
            self.datalog(),
            report.banks_read,
            report.values_published
        );

        Ok(report)
    }

    /// Sets or clears the bits of switch `slot`. Never retried; on failure
    /// the switch state is unknown until the next poll.
    pub async fn toggle_switch(&self, slot: &str, desired: bool) -> Result<bool, WriteError> {
        let switch = self
            .inner
            .config
            .switch(slot)
            .cloned()
            .ok_or_else(|| WriteError::UnknownSwitch(slot.to_owned()))?;

        if self.inner.config.read_only() {
            return Err(WriteError::ReadOnly);
        }

        let mut link = self.inner.gate.lock_for_write().await;
        let timeout = self.inner.config.read_timeout();

        let result = match link.session.as_mut() {
            Some(session) => {
                self.set_state(EngineState::Writing);
                UpdateHold::new(switch.address, switch.mask, desired)
                    .run(session, timeout)
                    .await
            }
            None => Err(not_connected()),
        };

        match result {
            Ok(new_value) => {
                link.failures = 0;
                self.stats_lock().writes += 1;
                self.set_state(EngineState::Ready);
                self.after_write(switch.address, new_value);
                self.inner.sink.on_switch_result(slot, true, desired);

                info!("inverter {}: {} is now {}", self.datalog(), slot, on_off(desired));

                Ok(desired)
            }
            Err(e) => {
                self.write_failed(&mut link, &e).await;

                // report the last state we know of; the next poll corrects it
                let state = self.switch_state(slot).unwrap_or(!desired);
                self.inner.sink.on_switch_result(slot, false, state);

                warn!("inverter {}: toggling {} failed: {}", self.datalog(), slot, e);

                Err(e)
            }
        }
    }

    /// Unmasked write of a whole holding register.
    pub async fn write_register(&self, register: u16, value: u16) -> Result<(), WriteError> {
        if self.inner.config.read_only() {
            return Err(WriteError::ReadOnly);
        }

        let mut link = self.inner.gate.lock_for_write().await;
        let timeout = self.inner.config.read_timeout();

        let result = match link.session.as_mut() {
            Some(session) => {
                self.set_state(EngineState::Writing);
                SetHold::new(register, value).run(session, timeout).await
            }
            None => Err(not_connected()),
        };

        match result {
            Ok(()) => {
                link.failures = 0;
                self.stats_lock().writes += 1;
                self.set_state(EngineState::Ready);
                self.after_write(register, value);
                Ok(())
            }
            Err(e) => {
                self.write_failed(&mut link, &e).await;
                Err(e)
            }
        }
    }

    /// Asks the inverter to restart (128 into holding register 11).
    pub async fn restart_inverter(&self) -> Result<(), WriteError> {
        info!("inverter {}: requesting restart", self.datalog());
        self.write_register(RESTART_REGISTER, RESTART_VALUE).await
    }

    /// Closes the session after any queued writes. The engine can connect
    /// again afterwards.
    pub async fn disconnect(&self) {
        let mut link = self.inner.gate.lock_for_write().await;
        if let Some(session) = link.session.take() {
            info!("inverter {}: disconnecting", self.datalog());
            session.close().await;
            self.stats_lock().disconnections += 1;
            self.set_state(EngineState::Disconnected);
        }
        link.failures = 0;
    }

    /// Cancels any in-flight exchange and stops the scheduler.
    pub fn stop(&self) {
        info!("inverter {}: stopping", self.datalog());
        self.inner.shutdown.cancel();
    }

    /// Runs the poll scheduler until `stop` is called.
    pub async fn start(&self) -> Result<()> {
        crate::scheduler::Scheduler::new(self.clone()).start().await
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.config.poll_interval()
    }

    fn publish(&self, reading: &BankReading) -> usize {
        self.inner.cache.store_bank(reading);

        let mut published = 0;

        for binding in self.inner.config.bindings() {
            if let Some(value) = reading.value_for(binding) {
                self.set_value(&binding.slot, value);
                published += 1;
            }
        }

        for switch in self.inner.config.switches() {
            if let Some(raw) = reading.register(RegisterKind::Hold, switch.address) {
                self.set_value(&switch.slot, Value::Bool(switch.is_on(raw)));
                published += 1;
            }
        }

        published
    }

    // refresh everything decoded from a register we just wrote
    fn after_write(&self, register: u16, value: u16) {
        self.inner.cache.set(RegisterKind::Hold, register, value);

        let reading = BankReading {
            kind: RegisterKind::Hold,
            start: register,
            words: vec![value],
        };

        for binding in self.inner.config.bindings() {
            if binding.word_span == 1 {
                if let Some(value) = reading.value_for(binding) {
                    self.set_value(&binding.slot, value);
                }
            }
        }

        for switch in self.inner.config.switches() {
            if switch.address == register {
                self.set_value(&switch.slot, Value::Bool(switch.is_on(value)));
            }
        }
    }

    fn set_value(&self, slot: &str, value: Value) {
        self.inner.sink.on_value(slot, &value);
        self.values().insert(slot.to_owned(), value);
    }

    async fn write_failed(&self, link: &mut Link, err: &WriteError) {
        {
            let mut stats = self.stats_lock();
            stats.write_errors += 1;
            stats.last_error = Some(err.to_string());
        }

        if link.session.is_none() {
            return;
        }

        match err {
            WriteError::Unreachable(e) if e.is_connection_fatal() => self.teardown(link, e).await,
            WriteError::Unreachable(e @ ExchangeError::Timeout(_)) => {
                link.failures += 1;
                if link.failures >= self.inner.config.retry_budget().max(1) {
                    self.teardown(link, e).await;
                } else {
                    self.set_state(EngineState::Ready);
                }
            }
            // rejected or unreadable replies still came over a working link
            _ => self.set_state(EngineState::Ready),
        }
    }

    async fn teardown(&self, link: &mut Link, err: &ExchangeError) {
        warn!("inverter {}: dropping connection: {}", self.datalog(), err);

        if let Some(session) = link.session.take() {
            session.close().await;
        }
        link.failures = 0;

        {
            let mut stats = self.stats_lock();
            stats.disconnections += 1;
            stats.last_error = Some(err.to_string());
        }

        self.set_state(EngineState::Disconnected);
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.inner.state.send_replace(state);
        if previous == state {
            return;
        }

        debug!("inverter {}: {:?} -> {:?}", self.datalog(), previous, state);

        let reported = match state {
            EngineState::Connecting => Some(ConnectionState::Connecting),
            EngineState::Ready if matches!(previous, EngineState::Connecting) => {
                Some(ConnectionState::Ready)
            }
            EngineState::Disconnected => Some(ConnectionState::Disconnected),
            _ => None,
        };

        if let Some(state) = reported {
            self.inner.sink.on_connection_state(state);
        }
    }

    fn record_error(&self, err: &impl std::fmt::Display) {
        self.stats_lock().last_error = Some(err.to_string());
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.inner.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats_lock(&self) -> std::sync::MutexGuard<'_, PacketStats> {
        self.inner.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn not_connected() -> WriteError {
    WriteError::Unreachable(ExchangeError::ConnectionLost("not connected".into()))
}

fn on_off(state: bool) -> &'static str {
    if state {
        "ON"
    } else {
        "OFF"
    }
}
