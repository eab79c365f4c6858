use crate::prelude::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UNKNOWN: &str = "unknown";

// {{{ DecodeKind
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeKind {
    #[serde(rename = "uint16")]
    UInt16,
    #[serde(rename = "int16_signed")]
    Int16Signed,
    #[serde(rename = "float_div10")]
    FloatDiv10,
    #[serde(rename = "float_div_n")]
    FloatDivN,
    Bitmask,
    FirmwareVersion,
    ModelCode,
    MinutesOfDay,
    // low byte hour, high byte minute
    HourMinute,
    Status,
    WarningCode,
    FaultCode,
}
// }}}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    #[default]
    HighFirst,
    LowFirst,
}

// {{{ Value
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Unsigned(u32),
    Signed(i32),
    Float(f64),
    Bool(bool),
    Text(String),
    MinutesOfDay(u16),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "{}", v),
            Self::Signed(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(true) => write!(f, "ON"),
            Self::Bool(false) => write!(f, "OFF"),
            Self::Text(v) => write!(f, "{}", v),
            Self::MinutesOfDay(v) => write!(f, "{:02}:{:02}", v / 60, v % 60),
        }
    }
}
// }}}

// {{{ RegisterBinding
/// One decoded output: which register(s) to read, how to interpret them and
/// which slot the result is published under.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RegisterBinding {
    pub slot: String,
    pub address: u16,
    #[serde(default)]
    pub register: RegisterKind,
    pub decode: DecodeKind,

    pub scale: Option<f64>,
    pub mask: Option<u16>,

    #[serde(default = "RegisterBinding::default_word_span")]
    pub word_span: u16,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default)]
    pub signed: bool,

    /// numeric code to name, used by `model_code`
    #[serde(default)]
    pub labels: BTreeMap<u32, String>,
}

impl RegisterBinding {
    pub fn new(slot: &str, address: u16, decode: DecodeKind) -> Self {
        Self {
            slot: slot.to_owned(),
            address,
            register: RegisterKind::Hold,
            decode,
            scale: None,
            mask: None,
            word_span: Self::default_word_span(),
            word_order: WordOrder::default(),
            signed: false,
            labels: BTreeMap::new(),
        }
    }

    pub fn input(mut self) -> Self {
        self.register = RegisterKind::Input;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_mask(mut self, mask: u16) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_word_span(mut self, word_span: u16, word_order: WordOrder) -> Self {
        self.word_span = word_span;
        self.word_order = word_order;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn with_label(mut self, code: u32, name: &str) -> Self {
        self.labels.insert(code, name.to_owned());
        self
    }

    fn default_word_span() -> u16 {
        1
    }

    pub fn divisor(&self) -> f64 {
        match self.decode {
            DecodeKind::FloatDiv10 => 10.0,
            DecodeKind::FloatDivN => self.scale.unwrap_or(10.0),
            _ => 1.0,
        }
    }

    /// Exclusive end of the registers this binding reads.
    pub fn end(&self) -> u32 {
        self.address as u32 + self.word_span as u32
    }

    /// `words` holds `word_span` registers starting at `address`.
    pub fn decode(&self, words: &[u16]) -> Value {
        let first = words.first().copied().unwrap_or_default();
        let raw = self.combine(words);

        match self.decode {
            DecodeKind::UInt16 => Value::Unsigned(raw),
            DecodeKind::Int16Signed => Value::Signed(self.as_signed(raw)),
            DecodeKind::FloatDiv10 | DecodeKind::FloatDivN => {
                let numerator = if self.signed {
                    self.as_signed(raw) as f64
                } else {
                    raw as f64
                };
                Value::Float(numerator / self.divisor())
            }
            DecodeKind::Bitmask => {
                Value::Bool((raw & self.mask.unwrap_or_default() as u32) != 0)
            }
            DecodeKind::FirmwareVersion => Value::Text(ascii_text(words)),
            // labelled codes first, otherwise the raw ASCII model ("FAAB")
            DecodeKind::ModelCode => Value::Text(
                self.labels
                    .get(&raw)
                    .cloned()
                    .unwrap_or_else(|| ascii_text(words)),
            ),
            DecodeKind::MinutesOfDay => Value::MinutesOfDay(first),
            DecodeKind::HourMinute => {
                let hour = first & 0xff;
                let minute = first >> 8;
                if hour < 24 && minute < 60 {
                    Value::MinutesOfDay(hour * 60 + minute)
                } else {
                    Value::Text(UNKNOWN.to_owned())
                }
            }
            DecodeKind::Status => Value::Text(StatusString::from_value(first).to_owned()),
            DecodeKind::WarningCode => Value::Text(WarningCodeString::from_value(raw).to_owned()),
            DecodeKind::FaultCode => Value::Text(FaultCodeString::from_value(raw).to_owned()),
        }
    }

    fn combine(&self, words: &[u16]) -> u32 {
        let first = words.first().copied().unwrap_or_default() as u32;
        if self.word_span < 2 {
            return first;
        }

        let second = words.get(1).copied().unwrap_or_default() as u32;
        match self.word_order {
            WordOrder::HighFirst => (first << 16) | second,
            WordOrder::LowFirst => (second << 16) | first,
        }
    }

    fn as_signed(&self, raw: u32) -> i32 {
        if self.word_span < 2 {
            raw as u16 as i16 as i32
        } else {
            raw as i32
        }
    }
} // }}}

fn ascii_text(words: &[u16]) -> String {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();

    if !bytes.is_empty() && bytes.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        UNKNOWN.to_owned()
    }
}

// {{{ SwitchBinding
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct SwitchBinding {
    pub slot: String,
    pub address: u16,
    pub mask: u16,
}

impl SwitchBinding {
    pub fn new(slot: &str, address: u16, mask: u16) -> Self {
        Self {
            slot: slot.to_owned(),
            address,
            mask,
        }
    }

    /// A bit-group switch is only on when every bit in it is set.
    pub fn is_on(&self, raw: u16) -> bool {
        raw & self.mask == self.mask
    }
} // }}}

/// Raw words from one bank reply. Lives for one poll cycle at most.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BankReading {
    pub kind: RegisterKind,
    pub start: u16,
    pub words: Vec<u16>,
}

impl BankReading {
    pub fn words(&self, kind: RegisterKind, address: u16, count: u16) -> Option<&[u16]> {
        if kind != self.kind || address < self.start {
            return None;
        }

        let offset = (address - self.start) as usize;
        self.words.get(offset..offset + count as usize)
    }

    pub fn register(&self, kind: RegisterKind, address: u16) -> Option<u16> {
        self.words(kind, address, 1).map(|w| w[0])
    }

    /// The binding's value, if all of its registers are in this reading.
    pub fn value_for(&self, binding: &RegisterBinding) -> Option<Value> {
        self.words(binding.register, binding.address, binding.word_span)
            .map(|words| binding.decode(words))
    }
}

pub struct StatusString;
impl StatusString {
    pub fn from_value(status: u16) -> &'static str {
        match status {
            0x00 => "Standby",
            0x02 => "FW Updating",
            0x04 => "PV On-grid",
            0x08 => "PV Charge",
            0x0C => "PV Charge On-grid",
            0x10 => "Battery On-grid",
            0x11 => "Bypass",
            0x14 => "PV & Battery On-grid",
            0x19 => "PV Charge + Bypass",
            0x20 => "AC Charge",
            0x28 => "PV & AC Charge",
            0x40 => "Battery Off-grid",
            0x80 => "PV Off-grid",
            0xC0 => "PV & Battery Off-grid",
            0x88 => "PV Charge Off-grid",

            _ => "Unknown",
        }
    }
}

pub struct WarningCodeString;
impl WarningCodeString {
    pub fn from_value(value: u32) -> &'static str {
        match value.trailing_zeros() {
            32 => "OK",
            bit => Self::from_bit(bit),
        }
    }

    fn from_bit(bit: u32) -> &'static str {
        match bit {
            0 => "W000: Battery communication failure",
            1 => "W001: AFCI communication failure",
            2 => "W002: AFCI high",
            3 => "W003: Meter communication failure",
            4 => "W004: Both charge and discharge forbidden by battery",
            5 => "W005: Auto test failed",
            7 => "W007: LCD communication failure",
            8 => "W008: FW version mismatch",
            9 => "W009: Fan stuck",
            11 => "W011: Parallel number out of range",
            12 => "W012: Bat On Mos",
            13 => "W013: Overtemperature (NTC reading is too high)",
            15 => "W015: Battery reverse connection",
            16 => "W016: Grid power outage",
            17 => "W017: Grid voltage out of range",
            18 => "W018: Grid frequency out of range",
            20 => "W020: PV insulation low",
            21 => "W021: Leakage current high",
            22 => "W022: DCI high",
            23 => "W023: PV short",
            25 => "W025: Battery voltage high",
            26 => "W026: Battery voltage low",
            27 => "W027: Battery open circuit",
            28 => "W028: EPS overload",
            29 => "W029: EPS voltage high",
            30 => "W030: Meter reverse connection",
            31 => "W031: DCV high",
            _ => "Reserved warning",
        }
    }
}

pub struct FaultCodeString;
impl FaultCodeString {
    pub fn from_value(value: u32) -> &'static str {
        match value.trailing_zeros() {
            32 => "OK",
            bit => Self::from_bit(bit),
        }
    }

    fn from_bit(bit: u32) -> &'static str {
        match bit {
            0 => "E000: Internal communication fault 1",
            1 => "E001: Model fault",
            2 => "E002: BatOnMosFail",
            3 => "E003: CT Fail",
            8 => "E008: CAN communication error in parallel system",
            9 => "E009: master lost in parallel system",
            10 => "E010: multiple master units in parallel system",
            11 => "E011: AC input inconsistent in parallel system",
            12 => "E012: UPS short",
            13 => "E013: Reverse current on UPS output",
            14 => "E014: Bus short",
            15 => "E015: Phase error in three phase system",
            16 => "E016: Relay check fault",
            17 => "E017: Internal communication fault 2",
            18 => "E018: Internal communication fault 3",
            19 => "E019: Bus voltage high",
            20 => "E020: EPS connection fault",
            21 => "E021: PV voltage high",
            22 => "E022: Over current protection",
            23 => "E023: Neutral fault",
            24 => "E024: PV short",
            25 => "E025: Radiator temperature over range",
            26 => "E026: Internal fault",
            27 => "E027: Sample inconsistent between Main CPU and redundant CPU",
            31 => "E031: Internal communication fault 4",
            _ => "Reserved fault",
        }
    }
}
