use crate::prelude::*;

use enum_dispatch::*;
use nom::{
    bytes::complete::take,
    number::{
        complete::{u16 as nom_u16, u8 as nom_u8},
        Endianness,
    },
    IResult,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

pub const FRAME_PREFIX: [u8; 2] = [0xA1, 0x1A];
pub const HEADER_LEN: usize = 18;
/// Unit byte at offset 6, always 1 in both directions.
pub const FRAME_UNIT: u8 = 1;

// the reply carries a one-byte value length, so 254 bytes of values at most
pub const MAX_REGISTERS_PER_READ: u16 = 127;

// header + data length + address/function/serial/register + checksum
const MIN_TRANSLATED_DATA_LEN: usize = HEADER_LEN + 2 + 14 + 2;

const EXCEPTION_BIT: u8 = 0x80;

// {{{ ByteOrder
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    pub fn bytes(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    /// Panics if `input` has fewer than `offset + 2` bytes.
    pub fn read(self, input: &[u8], offset: usize) -> u16 {
        let pair = [input[offset], input[offset + 1]];
        match self {
            Self::Little => u16::from_le_bytes(pair),
            Self::Big => u16::from_be_bytes(pair),
        }
    }

    fn endianness(self) -> Endianness {
        match self {
            Self::Little => Endianness::Little,
            Self::Big => Endianness::Big,
        }
    }
}
// }}}

// {{{ Checksum
pub trait ChecksumStrategy {
    fn compute(&self, data: &[u8]) -> u16;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum {
    #[default]
    Crc16Modbus,
    Additive,
}

impl ChecksumStrategy for Checksum {
    fn compute(&self, data: &[u8]) -> u16 {
        match self {
            Self::Crc16Modbus => crc16::State::<crc16::MODBUS>::calculate(data),
            Self::Additive => data
                .iter()
                .fold(0u16, |acc, byte| acc.wrapping_add(*byte as u16)),
        }
    }
}
// }}}

/// Device-specific framing constants. Every multi-byte field, the checksum
/// included, follows `byte_order`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct WireFormat {
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub checksum: Checksum,
}

impl WireFormat {
    fn checksum_bytes(&self, data: &[u8]) -> [u8; 2] {
        self.byte_order.bytes(self.checksum.compute(data))
    }
}

// {{{ TcpFunction
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TcpFunction {
    Heartbeat = 193,
    TranslatedData = 194,
    ReadParam = 195,
    WriteParam = 196,
}
// }}}

// {{{ DeviceFunction
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceFunction {
    ReadHold = 3,
    ReadInput = 4,
    WriteSingle = 6,
    WriteMulti = 16,
}
// }}}

// {{{ RegisterKind
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    #[default]
    Hold,
    Input,
}

impl RegisterKind {
    pub fn read_function(self) -> DeviceFunction {
        match self {
            Self::Hold => DeviceFunction::ReadHold,
            Self::Input => DeviceFunction::ReadInput,
        }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => write!(f, "hold"),
            Self::Input => write!(f, "input"),
        }
    }
}
// }}}

#[enum_dispatch]
pub trait PacketCommon {
    fn datalog(&self) -> Serial;
    fn protocol(&self) -> u16;
    fn tcp_function(&self) -> TcpFunction;
    fn bytes(&self, wire: &WireFormat) -> Vec<u8>;
}

pub struct TcpFrameFactory;
impl TcpFrameFactory {
    pub fn build(packet: &Packet, wire: &WireFormat) -> Vec<u8> {
        Self::frame(
            packet.protocol(),
            packet.tcp_function(),
            packet.datalog(),
            &packet.bytes(wire),
            wire,
        )
    }

    /// Frames `reply` the way the dongle does when answering a request.
    pub fn build_reply(reply: &TranslatedData, wire: &WireFormat) -> Vec<u8> {
        let protocol = 2;
        Self::frame(
            protocol,
            TcpFunction::TranslatedData,
            reply.datalog,
            &reply.data_bytes(PacketSource::Inverter, protocol, wire),
            wire,
        )
    }

    fn frame(
        protocol: u16,
        tcp_function: TcpFunction,
        datalog: Serial,
        data_bytes: &[u8],
        wire: &WireFormat,
    ) -> Vec<u8> {
        let frame_length = (HEADER_LEN + data_bytes.len()) as u16;
        let order = wire.byte_order;

        let mut r = vec![0; frame_length as usize];

        r[0..2].copy_from_slice(&FRAME_PREFIX);
        r[2..4].copy_from_slice(&order.bytes(protocol));
        r[4..6].copy_from_slice(&order.bytes(frame_length - 6));
        r[6] = FRAME_UNIT;
        r[7] = tcp_function.into();
        r[8..18].copy_from_slice(&datalog.data());
        r[18..].copy_from_slice(data_bytes);

        r
    }
}

#[enum_dispatch(PacketCommon)]
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Packet {
    Heartbeat(Heartbeat),
    TranslatedData(TranslatedData),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketSource {
    Inverter,
    Client,
}

fn serial_at(input: &[u8], offset: usize) -> Serial {
    let mut r = [0; 10];
    r.copy_from_slice(&input[offset..offset + 10]);
    Serial::from(r)
}

/////////////
//
// HEARTBEATS
//
/////////////

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Heartbeat {
    pub datalog: Serial,
}
impl Heartbeat {
    fn decode(input: &[u8]) -> Result<Self, FrameError> {
        if input.len() < HEADER_LEN + 1 {
            return Err(FrameError::Truncated {
                expected: HEADER_LEN + 1,
                actual: input.len(),
            });
        }

        Ok(Self {
            datalog: serial_at(input, 8),
        })
    }
}

impl PacketCommon for Heartbeat {
    fn protocol(&self) -> u16 {
        2
    }

    fn datalog(&self) -> Serial {
        self.datalog
    }

    fn tcp_function(&self) -> TcpFunction {
        TcpFunction::Heartbeat
    }

    fn bytes(&self, _wire: &WireFormat) -> Vec<u8> {
        vec![0]
    }
}

/////////////
//
// TRANSLATED DATA
//
/////////////

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct TranslatedData {
    pub datalog: Serial,
    pub device_function: DeviceFunction,
    pub inverter: Serial,
    pub register: u16,
    // for read requests this is the single register count
    pub values: Vec<u16>,
    pub exception: Option<u8>,
}

impl TranslatedData {
    pub fn read(
        kind: RegisterKind,
        datalog: Serial,
        inverter: Serial,
        register: u16,
        count: u16,
    ) -> Self {
        Self {
            datalog,
            device_function: kind.read_function(),
            inverter,
            register,
            values: vec![count],
            exception: None,
        }
    }

    pub fn write_single(datalog: Serial, inverter: Serial, register: u16, value: u16) -> Self {
        Self {
            datalog,
            device_function: DeviceFunction::WriteSingle,
            inverter,
            register,
            values: vec![value],
            exception: None,
        }
    }

    pub fn pairs(&self) -> Vec<(u16, u16)> {
        self.values
            .iter()
            .enumerate()
            .map(|(pos, value)| (self.register.wrapping_add(pos as u16), *value))
            .collect()
    }

    pub fn value(&self) -> Option<u16> {
        self.values.first().copied()
    }

    /// Whether this frame is the reply to `request`. The protocol carries no
    /// sequence number, so function code and register are all there is.
    pub fn answers(&self, request: &TranslatedData) -> bool {
        self.datalog == request.datalog
            && self.device_function == request.device_function
            && self.register == request.register
    }

    pub fn authenticate(&self, datalog: Serial, inverter: Serial) -> Result<(), FrameError> {
        if self.datalog != datalog {
            return Err(FrameError::SerialMismatch {
                expected: datalog,
                received: self.datalog,
            });
        }
        if self.inverter != inverter {
            return Err(FrameError::SerialMismatch {
                expected: inverter,
                received: self.inverter,
            });
        }
        Ok(())
    }

    fn decode(input: &[u8], protocol: u16, wire: &WireFormat) -> Result<Self, FrameError> {
        let len = input.len();
        if len < MIN_TRANSLATED_DATA_LEN {
            return Err(FrameError::Truncated {
                expected: MIN_TRANSLATED_DATA_LEN,
                actual: len,
            });
        }

        let order = wire.byte_order;
        let datalog = serial_at(input, 8);

        // counts itself and the data section, not the checksum
        let declared = order.read(input, 18) as usize;
        if declared != len - 20 {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: len - 20,
            });
        }

        // skip the data length, the checksum covers everything after it
        let data = &input[20..len - 2];

        let received = order.read(input, len - 2);
        let expected = wire.checksum.compute(data);
        if received != expected {
            return Err(FrameError::ChecksumMismatch { expected, received });
        }

        // data[0] is the address byte, 0 from the client and 1 from the inverter
        let raw_function = data[1];
        let device_function = DeviceFunction::try_from(raw_function & !EXCEPTION_BIT)
            .map_err(|_| FrameError::UnexpectedFunctionCode(raw_function))?;
        let inverter = serial_at(data, 2);
        let register = order.read(data, 12);

        if raw_function & EXCEPTION_BIT != 0 {
            return Ok(Self {
                datalog,
                device_function,
                inverter,
                register,
                values: Vec::new(),
                exception: Some(data.get(14).copied().unwrap_or_default()),
            });
        }

        let mut value_len = 2;
        let mut value_offset = 14;

        if Self::has_value_length_byte(PacketSource::Inverter, protocol, device_function) {
            value_len = *data.get(value_offset).ok_or(FrameError::Truncated {
                expected: len + 1,
                actual: len,
            })? as usize;
            value_offset += 1;
        }

        let raw = &data[value_offset.min(data.len())..];
        if raw.len() != value_len || value_len % 2 != 0 {
            return Err(FrameError::Truncated {
                expected: value_len,
                actual: raw.len(),
            });
        }

        let values = raw.chunks_exact(2).map(|pair| order.read(pair, 0)).collect();

        Ok(Self {
            datalog,
            device_function,
            inverter,
            register,
            values,
            exception: None,
        })
    }

    fn has_value_length_byte(
        source: PacketSource,
        protocol: u16,
        device_function: DeviceFunction,
    ) -> bool {
        use DeviceFunction::*;

        let p1 = protocol == 1;
        let psi = source == PacketSource::Inverter;
        match device_function {
            ReadHold | ReadInput => !p1 && psi,
            WriteSingle => false,
            WriteMulti => !p1 && !psi,
        }
    }

    fn data_bytes(&self, source: PacketSource, protocol: u16, wire: &WireFormat) -> Vec<u8> {
        let order = wire.byte_order;
        let mut data = vec![0; 16];

        data[2] = match source {
            PacketSource::Client => 0,
            PacketSource::Inverter => 1,
        };
        let function: u8 = self.device_function.into();
        data[3] = match self.exception {
            Some(_) => function | EXCEPTION_BIT,
            None => function,
        };
        data[4..14].copy_from_slice(&self.inverter.data());
        data[14..16].copy_from_slice(&order.bytes(self.register));

        if let Some(code) = self.exception {
            data.push(code);
        } else {
            if self.device_function == DeviceFunction::WriteMulti {
                data.extend_from_slice(&order.bytes(self.values.len() as u16));
            }

            if Self::has_value_length_byte(source, protocol, self.device_function) {
                data.push((self.values.len() * 2) as u8);
            }

            for value in &self.values {
                data.extend_from_slice(&order.bytes(*value));
            }
        }

        // the first two bytes are the data length, excluding checksum which we'll add next
        let data_length = data.len() as u16;
        data[0..2].copy_from_slice(&order.bytes(data_length));

        // checksum does not include the first two bytes (data length)
        let checksum = wire.checksum_bytes(&data[2..]);
        data.extend_from_slice(&checksum);

        data
    }
}

impl PacketCommon for TranslatedData {
    fn protocol(&self) -> u16 {
        if self.device_function == DeviceFunction::WriteMulti {
            2
        } else {
            1
        }
    }

    fn datalog(&self) -> Serial {
        self.datalog
    }

    fn tcp_function(&self) -> TcpFunction {
        TcpFunction::TranslatedData
    }

    fn bytes(&self, wire: &WireFormat) -> Vec<u8> {
        self.data_bytes(PacketSource::Client, self.protocol(), wire)
    }
}

struct Header {
    prefix: [u8; 2],
    protocol: u16,
    frame_length: u16,
    unit: u8,
    tcp_function: u8,
}

fn header(input: &[u8], endianness: Endianness) -> IResult<&[u8], Header> {
    let (input, prefix) = take(2usize)(input)?;
    let (input, protocol) = nom_u16(endianness)(input)?;
    let (input, frame_length) = nom_u16(endianness)(input)?;
    let (input, unit) = nom_u8(input)?;
    let (input, tcp_function) = nom_u8(input)?;

    Ok((
        input,
        Header {
            prefix: [prefix[0], prefix[1]],
            protocol,
            frame_length,
            unit,
            tcp_function,
        },
    ))
}

pub struct Parser;
impl Parser {
    pub fn parse(input: &[u8], wire: &WireFormat) -> Result<Packet, FrameError> {
        let truncated = FrameError::Truncated {
            expected: HEADER_LEN,
            actual: input.len(),
        };
        if input.len() < HEADER_LEN {
            return Err(truncated);
        }

        let (_, header) = header(input, wire.byte_order.endianness()).map_err(|_| truncated)?;

        if header.prefix != FRAME_PREFIX {
            return Err(FrameError::BadPrefix(header.prefix));
        }
        if header.unit != FRAME_UNIT {
            return Err(FrameError::BadUnit(header.unit));
        }

        let frame_len = header.frame_length as usize + 6;
        if input.len() < frame_len {
            return Err(FrameError::Truncated {
                expected: frame_len,
                actual: input.len(),
            });
        }
        let input = &input[..frame_len];

        match TcpFunction::try_from(header.tcp_function) {
            Ok(TcpFunction::Heartbeat) => Heartbeat::decode(input).map(Packet::Heartbeat),
            Ok(TcpFunction::TranslatedData) => {
                TranslatedData::decode(input, header.protocol, wire).map(Packet::TranslatedData)
            }
            // dongle parameter frames are not ours to answer
            _ => Err(FrameError::UnexpectedFunctionCode(header.tcp_function)),
        }
    }
}

/// Frame requesting `count` registers of `kind` starting at `start`.
pub fn encode_read_request(
    wire: &WireFormat,
    datalog: Serial,
    inverter: Serial,
    kind: RegisterKind,
    start: u16,
    count: u16,
) -> Vec<u8> {
    let request = TranslatedData::read(kind, datalog, inverter, start, count);
    TcpFrameFactory::build(&Packet::TranslatedData(request), wire)
}

pub fn encode_write_request(
    wire: &WireFormat,
    datalog: Serial,
    inverter: Serial,
    register: u16,
    value: u16,
) -> Vec<u8> {
    let request = TranslatedData::write_single(datalog, inverter, register, value);
    TcpFrameFactory::build(&Packet::TranslatedData(request), wire)
}

/// Parses one complete frame and checks it was sent by the expected dongle
/// and inverter.
pub fn decode_response(
    wire: &WireFormat,
    input: &[u8],
    datalog: Serial,
    inverter: Serial,
) -> Result<TranslatedData, FrameError> {
    match Parser::parse(input, wire)? {
        Packet::TranslatedData(td) => {
            td.authenticate(datalog, inverter)?;
            Ok(td)
        }
        other => Err(FrameError::UnexpectedFunctionCode(
            other.tcp_function().into(),
        )),
    }
}
