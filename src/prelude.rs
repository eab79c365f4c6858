pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use std::str::FromStr;
pub use std::time::Duration;

pub use tokio::sync::{broadcast, watch};

pub use crate::{
    config::{self, Config},
    engine::{Engine, EngineState, PacketStats},
    error::{ConnectError, ExchangeError, FrameError, WriteError},
    lxp::{
        self,
        inverter::{Serial, Session},
        packet::{
            ByteOrder, Checksum, DeviceFunction, Heartbeat, Packet, PacketCommon, RegisterKind,
            TcpFrameFactory, TcpFunction, TranslatedData, WireFormat,
        },
    },
    options::Options,
    planner::{Bank, BankPlanner},
    register::{BankReading, DecodeKind, RegisterBinding, SwitchBinding, Value, WordOrder},
    register_cache::RegisterCache,
    sink::{ChannelSink, ConnectionState, Sink, SinkEvent},
};
