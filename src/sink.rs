use crate::prelude::*;

use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Disconnected,
}

/// Receives everything an engine publishes. Called from the engine's own
/// tasks, so implementations must not block.
pub trait Sink: Send + Sync {
    fn on_value(&self, slot: &str, value: &Value);
    fn on_connection_state(&self, state: ConnectionState);
    fn on_switch_result(&self, slot: &str, success: bool, new_state: bool);
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEvent {
    Value {
        datalog: Serial,
        slot: String,
        value: Value,
    },
    ConnectionState {
        datalog: Serial,
        state: ConnectionState,
    },
    SwitchResult {
        datalog: Serial,
        slot: String,
        success: bool,
        new_state: bool,
    },
}

impl SinkEvent {
    pub fn datalog(&self) -> Serial {
        match self {
            Self::Value { datalog, .. }
            | Self::ConnectionState { datalog, .. }
            | Self::SwitchResult { datalog, .. } => *datalog,
        }
    }
}

impl std::fmt::Display for SinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value {
                datalog,
                slot,
                value,
            } => write!(f, "{} {} = {}", datalog, slot, value),
            Self::ConnectionState { datalog, state } => write!(f, "{} {:?}", datalog, state),
            Self::SwitchResult {
                datalog,
                slot,
                success,
                new_state,
            } => {
                let outcome = if *success { "ok" } else { "failed" };
                let state = if *new_state { "ON" } else { "OFF" };
                write!(f, "{} {} -> {} ({})", datalog, slot, state, outcome)
            }
        }
    }
}

/// Forwards every event into a broadcast channel, tagged with the datalog
/// it came from. Events are dropped when nobody is subscribed.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    datalog: Serial,
    tx: broadcast::Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(datalog: Serial, tx: broadcast::Sender<SinkEvent>) -> Self {
        Self { datalog, tx }
    }

    pub fn channel() -> broadcast::Sender<SinkEvent> {
        broadcast::channel(2048).0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            trace!("inverter {}: no sink subscribers", self.datalog);
        }
    }
}

impl Sink for ChannelSink {
    fn on_value(&self, slot: &str, value: &Value) {
        self.send(SinkEvent::Value {
            datalog: self.datalog,
            slot: slot.to_owned(),
            value: value.clone(),
        });
    }

    fn on_connection_state(&self, state: ConnectionState) {
        self.send(SinkEvent::ConnectionState {
            datalog: self.datalog,
            state,
        });
    }

    fn on_switch_result(&self, slot: &str, success: bool, new_state: bool) {
        self.send(SinkEvent::SwitchResult {
            datalog: self.datalog,
            slot: slot.to_owned(),
            success,
            new_state,
        });
    }
}
