use crate::prelude::*;
use crate::lxp::{packet::Parser, packet_decoder::PacketDecoder};

use {
    bytes::BytesMut,
    net2::TcpStreamExt,
    serde::{Serialize, Serializer},
    std::sync::{Arc, Mutex},
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::TcpStream,
    tokio::time::Instant,
    tokio_util::{codec::Decoder, sync::CancellationToken},
};

// Serial {{{
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serial([u8; 10]);

impl Serial {
    pub fn new(input: &[u8]) -> Result<Self> {
        let data: [u8; 10] = input.try_into()?;
        if !data.iter().all(|b| b.is_ascii_graphic()) {
            bail!("{:?} is not printable ASCII", data);
        }
        Ok(Self(data))
    }

    pub fn data(&self) -> [u8; 10] {
        self.0
    }
}

// straight off the wire, authenticated later against the configured serials
impl From<[u8; 10]> for Serial {
    fn from(data: [u8; 10]) -> Self {
        Self(data)
    }
}

impl Serialize for Serial {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::str::FromStr for Serial {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 10 {
            return Err(anyhow!("{} must be exactly 10 characters", s));
        }

        Self::new(s.as_bytes())
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
} // }}}

const TCP_KEEPALIVE_SECS: u64 = 60;
const MAX_BUFFER_SIZE: usize = 65536;

/// One live TCP connection to a dongle. Never reused after an error; the
/// engine drops it and connects a fresh one.
pub struct Session {
    stream: TcpStream,
    buf: BytesMut,
    decoder: PacketDecoder,
    datalog: Serial,
    serial: Serial,
    wire: WireFormat,
    respond_to_heartbeats: bool,
    heartbeat_timeout: Duration,
    last_heartbeat: Option<Instant>,
    sequence: u64,
    shutdown: CancellationToken,
    stats: Arc<Mutex<PacketStats>>,
}

impl Session {
    pub async fn connect(
        inverter: &config::Inverter,
        shutdown: CancellationToken,
        stats: Arc<Mutex<PacketStats>>,
    ) -> Result<Self, ConnectError> {
        let target = format!("{}:{}", inverter.host(), inverter.port());
        let connect_timeout = inverter.connect_timeout();

        info!("inverter {}: connecting to {}", inverter.datalog(), target);

        let stream = tokio::select! {
            res = tokio::time::timeout(
                connect_timeout,
                TcpStream::connect((inverter.host(), inverter.port())),
            ) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(ConnectError::from_io(&target, e)),
                Err(_) => return Err(ConnectError::Timeout(connect_timeout)),
            },
            _ = shutdown.cancelled() => return Err(ConnectError::Cancelled),
        };

        let std_stream = stream
            .into_std()
            .map_err(|e| ConnectError::from_io(&target, e))?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
            warn!("inverter {}: failed to set TCP keepalive: {}", inverter.datalog(), e);
        }
        let stream = TcpStream::from_std(std_stream).map_err(|e| ConnectError::from_io(&target, e))?;

        if inverter.use_tcp_nodelay() {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("inverter {}: failed to set TCP_NODELAY: {}", inverter.datalog(), e);
            }
        }

        info!("inverter {}: connected!", inverter.datalog());

        let wire = *inverter.wire();

        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(1024),
            decoder: PacketDecoder::new(wire.byte_order),
            datalog: inverter.datalog(),
            serial: inverter.serial(),
            wire,
            respond_to_heartbeats: inverter.respond_to_heartbeats(),
            heartbeat_timeout: inverter.heartbeat_timeout(),
            last_heartbeat: None,
            sequence: 0,
            shutdown,
            stats,
        })
    }

    pub fn datalog(&self) -> Serial {
        self.datalog
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Sends `request` and waits up to `timeout` for the frame answering it.
    /// Heartbeats and replies to other requests that arrive meanwhile are
    /// handled or skipped; a frame that fails validation ends the exchange.
    pub async fn exchange(
        &mut self,
        request: &TranslatedData,
        timeout: Duration,
    ) -> Result<TranslatedData, ExchangeError> {
        let shutdown = self.shutdown.clone();

        tokio::select! {
            res = self.send_and_wait(request, timeout) => res,
            _ = shutdown.cancelled() => Err(ExchangeError::Cancelled),
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("inverter {}: error closing socket: {}", self.datalog, e);
        }
    }

    async fn send_and_wait(
        &mut self,
        request: &TranslatedData,
        timeout: Duration,
    ) -> Result<TranslatedData, ExchangeError> {
        let deadline = Instant::now() + timeout;

        // anything already buffered is a heartbeat or a late reply to an
        // earlier request; deal with it before it can be mistaken for ours
        self.drain_pending(deadline, timeout).await?;
        self.check_heartbeat()?;

        self.sequence += 1;
        let bytes = TcpFrameFactory::build(&Packet::TranslatedData(request.clone()), &self.wire);
        debug!(
            "inverter {}: TX #{} {:?} register {} {:?}",
            self.datalog, self.sequence, request.device_function, request.register, bytes
        );
        self.write_frame(&bytes, deadline, timeout).await?;
        self.stats().packets_sent += 1;

        loop {
            let frame = match tokio::time::timeout_at(deadline, self.next_frame()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    self.stats().timeouts += 1;
                    return Err(ExchangeError::Timeout(timeout));
                }
            };

            match Parser::parse(&frame, &self.wire) {
                Ok(Packet::Heartbeat(heartbeat)) => {
                    self.on_heartbeat(heartbeat, deadline, timeout).await?
                }
                Ok(Packet::TranslatedData(reply)) => {
                    if let Err(e) = reply.authenticate(self.datalog, self.serial) {
                        self.stats().frame_errors += 1;
                        return Err(e.into());
                    }

                    if !reply.answers(request) {
                        debug!(
                            "inverter {}: skipping {:?} reply for register {} while waiting on #{}",
                            self.datalog, reply.device_function, reply.register, self.sequence
                        );
                        continue;
                    }

                    if let Some(code) = reply.exception {
                        return Err(FrameError::DeviceException {
                            function: reply.device_function.into(),
                            code,
                        }
                        .into());
                    }

                    debug!(
                        "inverter {}: RX #{} {:?} register {} {:?}",
                        self.datalog, self.sequence, reply.device_function, reply.register, reply.values
                    );
                    return Ok(reply);
                }
                Err(e) => {
                    self.stats().frame_errors += 1;
                    return Err(e.into());
                }
            }
        }
    }

    async fn drain_pending(&mut self, deadline: Instant, timeout: Duration) -> Result<(), ExchangeError> {
        loop {
            match self.stream.try_read_buf(&mut self.buf) {
                Ok(0) => return Err(ExchangeError::ConnectionLost("connection closed by peer".into())),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ExchangeError::ConnectionLost(format!("read failed: {}", e))),
            }
        }

        while let Some(frame) = self.decode_buffered()? {
            match Parser::parse(&frame, &self.wire) {
                Ok(Packet::Heartbeat(heartbeat)) => {
                    self.on_heartbeat(heartbeat, deadline, timeout).await?
                }
                Ok(Packet::TranslatedData(td)) => debug!(
                    "inverter {}: discarding stale {:?} reply for register {}",
                    self.datalog, td.device_function, td.register
                ),
                Err(e) => {
                    self.stats().frame_errors += 1;
                    debug!("inverter {}: discarding stale frame: {}", self.datalog, e);
                }
            }
        }

        Ok(())
    }

    fn check_heartbeat(&self) -> Result<(), ExchangeError> {
        match self.last_heartbeat {
            Some(last) if last.elapsed() > self.heartbeat_timeout => {
                Err(ExchangeError::ConnectionLost(format!(
                    "no heartbeat for {}s",
                    last.elapsed().as_secs()
                )))
            }
            _ => Ok(()),
        }
    }

    async fn write_frame(
        &mut self,
        bytes: &[u8],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ExchangeError> {
        match tokio::time::timeout_at(deadline, self.stream.write_all(bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ExchangeError::ConnectionLost(format!("write failed: {}", e))),
            Err(_) => return Err(ExchangeError::Timeout(timeout)),
        }

        self.stream
            .flush()
            .await
            .map_err(|e| ExchangeError::ConnectionLost(format!("flush failed: {}", e)))
    }

    async fn next_frame(&mut self) -> Result<Vec<u8>, ExchangeError> {
        loop {
            if let Some(frame) = self.decode_buffered()? {
                return Ok(frame);
            }

            if self.buf.len() >= MAX_BUFFER_SIZE {
                return Err(ExchangeError::ConnectionLost(format!(
                    "receive buffer exceeded {} bytes",
                    MAX_BUFFER_SIZE
                )));
            }

            let len = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| ExchangeError::ConnectionLost(format!("read failed: {}", e)))?;
            if len == 0 {
                return Err(ExchangeError::ConnectionLost("connection closed by peer".into()));
            }
        }
    }

    fn decode_buffered(&mut self) -> Result<Option<Vec<u8>>, ExchangeError> {
        let frame = self
            .decoder
            .decode(&mut self.buf)
            .map_err(|e| ExchangeError::ConnectionLost(e.to_string()))?;
        if frame.is_some() {
            self.stats().packets_received += 1;
        }
        Ok(frame)
    }

    async fn on_heartbeat(
        &mut self,
        heartbeat: Heartbeat,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ExchangeError> {
        self.stats().heartbeats_received += 1;
        self.last_heartbeat = Some(Instant::now());
        trace!("inverter {}: heartbeat", self.datalog);

        if self.respond_to_heartbeats {
            let bytes = TcpFrameFactory::build(&Packet::Heartbeat(heartbeat), &self.wire);
            self.write_frame(&bytes, deadline, timeout).await?;
            self.stats().heartbeats_sent += 1;
        }

        Ok(())
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, PacketStats> {
        // counters only, a poisoned lock still holds usable numbers
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}
