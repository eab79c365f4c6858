#![allow(dead_code)]

pub use lux_engine::prelude::*;

use bytes::BytesMut;
use lux_engine::lxp::packet::Parser;
use lux_engine::lxp::packet_decoder::PacketDecoder;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Decoder;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;
impl Factory {
    pub fn datalog() -> Serial {
        Serial::from_str("2222222222").unwrap()
    }

    pub fn serial() -> Serial {
        Serial::from_str("5555555555").unwrap()
    }

    /// Battery voltage at 20, the AC charge bit in 21.
    pub fn inverter_yaml(port: u16) -> String {
        format!(
            r#"
inverters:
  - host: 127.0.0.1
    port: {port}
    datalog: "2222222222"
    serial: "5555555555"
    poll_interval: 10
    read_timeout_ms: 300
    connect_timeout: 1
    retry_budget: 3
    bindings:
      - slot: battery_voltage
        address: 20
        decode: float_div10
    switches:
      - slot: ac_charge_enable
        address: 21
        mask: 128
"#
        )
    }

    pub fn config(port: u16) -> Config {
        Config::from_yaml(&Self::inverter_yaml(port)).unwrap()
    }

    pub fn inverter(port: u16) -> config::Inverter {
        Self::config(port).inverters[0].clone()
    }

    pub fn engine(inverter: config::Inverter) -> (Engine, broadcast::Receiver<SinkEvent>) {
        let tx = ChannelSink::channel();
        let rx = tx.subscribe();
        let sink = ChannelSink::new(inverter.datalog(), tx);
        let engine = Engine::new(inverter, Arc::new(sink)).unwrap();
        (engine, rx)
    }
}

pub fn drain_events(rx: &mut broadcast::Receiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn value_event(slot: &str, value: Value) -> SinkEvent {
    SinkEvent::Value {
        datalog: Factory::datalog(),
        slot: slot.to_owned(),
        value,
    }
}

#[derive(Default)]
pub struct DongleState {
    pub hold: HashMap<u16, u16>,
    pub input: HashMap<u16, u16>,
    pub requests: Vec<TranslatedData>,
    pub connections: usize,
    pub heartbeats_echoed: usize,

    // misbehaviour switches
    pub reject_writes: bool,
    pub reject_input_reads: bool,
    pub silent: bool,
    pub corrupt_replies: bool,
    pub drop_after: Option<usize>,
    pub heartbeat_first: bool,
    pub reply_serial: Option<Serial>,
    pub reply_delay: Option<Duration>,
}

/// Speaks the dongle side of the protocol on a loopback port.
pub struct FakeDongle {
    pub port: u16,
    state: Arc<Mutex<DongleState>>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeDongle {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(DongleState::default()));

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.lock().unwrap().connections += 1;
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self {
            port,
            state,
            handle,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, DongleState> {
        self.state.lock().unwrap()
    }

    pub fn set_hold(&self, register: u16, value: u16) {
        self.state().hold.insert(register, value);
    }

    pub fn hold(&self, register: u16) -> Option<u16> {
        self.state().hold.get(&register).copied()
    }

    pub fn set_input(&self, register: u16, value: u16) {
        self.state().input.insert(register, value);
    }

    pub fn requests(&self) -> Vec<TranslatedData> {
        self.state().requests.clone()
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.requests()
            .into_iter()
            .filter(|r| r.device_function == DeviceFunction::WriteSingle)
            .map(|r| (r.register, r.values[0]))
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.state().connections
    }
}

impl Drop for FakeDongle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<DongleState>>) {
    let wire = WireFormat::default();
    let mut decoder = PacketDecoder::new(wire.byte_order);
    let mut buf = BytesMut::with_capacity(1024);
    let mut replies = 0;

    let heartbeat_first = state.lock().unwrap().heartbeat_first;
    if heartbeat_first {
        let heartbeat = Packet::Heartbeat(Heartbeat {
            datalog: Factory::datalog(),
        });
        let bytes = TcpFrameFactory::build(&heartbeat, &wire);
        if stream.write_all(&bytes).await.is_err() {
            return;
        }
    }

    loop {
        while let Ok(Some(frame)) = decoder.decode(&mut buf) {
            let request = match Parser::parse(&frame, &wire) {
                Ok(Packet::TranslatedData(td)) => td,
                Ok(Packet::Heartbeat(_)) => {
                    state.lock().unwrap().heartbeats_echoed += 1;
                    continue;
                }
                Err(_) => continue,
            };

            let (reply, delay) = {
                let mut state = state.lock().unwrap();
                state.requests.push(request.clone());
                if state.drop_after == Some(replies) {
                    return;
                }
                (respond(&mut state, &request, &wire), state.reply_delay)
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(bytes) = reply {
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
                replies += 1;
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn respond(state: &mut DongleState, request: &TranslatedData, wire: &WireFormat) -> Option<Vec<u8>> {
    if state.silent {
        return None;
    }

    let mut reply = request.clone();
    if let Some(serial) = state.reply_serial {
        reply.inverter = serial;
    }

    match request.device_function {
        DeviceFunction::ReadInput if state.reject_input_reads => {
            reply.values = Vec::new();
            reply.exception = Some(2);
        }
        DeviceFunction::ReadHold | DeviceFunction::ReadInput => {
            let registers = match request.device_function {
                DeviceFunction::ReadHold => &state.hold,
                _ => &state.input,
            };
            let count = request.values[0];
            reply.values = (request.register..request.register + count)
                .map(|r| registers.get(&r).copied().unwrap_or_default())
                .collect();
        }
        DeviceFunction::WriteSingle if state.reject_writes => {
            reply.values = Vec::new();
            reply.exception = Some(2);
        }
        DeviceFunction::WriteSingle => {
            state.hold.insert(request.register, request.values[0]);
        }
        DeviceFunction::WriteMulti => return None,
    }

    let mut bytes = TcpFrameFactory::build_reply(&reply, wire);
    if state.corrupt_replies {
        bytes[25] ^= 0x40;
    }
    Some(bytes)
}
