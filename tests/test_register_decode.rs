mod common;
use common::*;

#[test]
fn float_div10() {
    let binding = RegisterBinding::new("battery_voltage", 20, DecodeKind::FloatDiv10);
    assert_eq!(binding.decode(&[1234]), Value::Float(123.4));
    assert_eq!(binding.decode(&[512]), Value::Float(51.2));
}

#[test]
fn float_div_n_signed() {
    let binding = RegisterBinding::new("battery_current", 98, DecodeKind::FloatDivN)
        .with_scale(100.0)
        .signed();
    assert_eq!(binding.decode(&[0xfffe]), Value::Float(-0.02));
    assert_eq!(binding.decode(&[250]), Value::Float(2.5));
}

#[test]
fn integers() {
    let unsigned = RegisterBinding::new("u", 0, DecodeKind::UInt16);
    let signed = RegisterBinding::new("s", 0, DecodeKind::Int16Signed);

    assert_eq!(unsigned.decode(&[0xffff]), Value::Unsigned(65535));
    assert_eq!(signed.decode(&[0xffff]), Value::Signed(-1));
    assert_eq!(signed.decode(&[0x7fff]), Value::Signed(32767));
}

#[test]
fn bitmask() {
    let binding = RegisterBinding::new("ac_charge", 21, DecodeKind::Bitmask).with_mask(0x0080);
    assert_eq!(binding.decode(&[0x0080]), Value::Bool(true));
    assert_eq!(binding.decode(&[0x0000]), Value::Bool(false));
    assert_eq!(binding.decode(&[0xff7f]), Value::Bool(false));
}

#[test]
fn two_word_values() {
    let high_first = RegisterBinding::new("e", 0, DecodeKind::UInt16)
        .with_word_span(2, WordOrder::HighFirst);
    let low_first = RegisterBinding::new("e", 0, DecodeKind::FloatDiv10)
        .with_word_span(2, WordOrder::LowFirst);

    assert_eq!(high_first.decode(&[0x0001, 0x0002]), Value::Unsigned(0x0001_0002));
    assert_eq!(low_first.decode(&[0x0002, 0x0001]), Value::Float(6553.8));
}

#[test]
fn firmware_version() {
    let binding = RegisterBinding::new("firmware", 7, DecodeKind::FirmwareVersion)
        .with_word_span(2, WordOrder::HighFirst);

    assert_eq!(
        binding.decode(&[u16::from_be_bytes(*b"fA"), u16::from_be_bytes(*b"AA")]),
        Value::Text("fAAA".to_owned())
    );
    assert_eq!(binding.decode(&[0x0000, 0x4141]), Value::Text("unknown".to_owned()));
}

#[test]
fn model_code() {
    let binding = RegisterBinding::new("model", 2, DecodeKind::ModelCode).with_label(0x0906, "18kPV");

    assert_eq!(binding.decode(&[0x0906]), Value::Text("18kPV".to_owned()));
    assert_eq!(binding.decode(&[0x0001]), Value::Text("unknown".to_owned()));
}

#[test]
fn model_code_falls_back_to_ascii() {
    let binding = RegisterBinding::new("model", 7, DecodeKind::ModelCode)
        .with_word_span(2, WordOrder::HighFirst);

    assert_eq!(binding.decode(&[0x4641, 0x4142]), Value::Text("FAAB".to_owned()));
    assert_eq!(binding.decode(&[0x4541, 0x4142]), Value::Text("EAAB".to_owned()));

    // a label still wins over the ASCII text
    let labelled = binding.with_label(0x4641_4142, "18kPV");
    assert_eq!(labelled.decode(&[0x4641, 0x4142]), Value::Text("18kPV".to_owned()));
}

#[test]
fn minutes_of_day() {
    let minutes = RegisterBinding::new("m", 0, DecodeKind::MinutesOfDay);
    assert_eq!(minutes.decode(&[390]), Value::MinutesOfDay(390));
    assert_eq!(minutes.decode(&[390]).to_string(), "06:30");

    // hour in the low byte, minute in the high byte
    let hour_minute = RegisterBinding::new("ac_charge_start", 68, DecodeKind::HourMinute);
    assert_eq!(hour_minute.decode(&[0x1e17]), Value::MinutesOfDay(23 * 60 + 30));
    assert_eq!(hour_minute.decode(&[0x0019]), Value::Text("unknown".to_owned()));
}

#[test]
fn status_and_fault_text() {
    let status = RegisterBinding::new("status", 0, DecodeKind::Status).input();
    let fault = RegisterBinding::new("fault", 60, DecodeKind::FaultCode)
        .input()
        .with_word_span(2, WordOrder::LowFirst);

    assert_eq!(status.register, RegisterKind::Input);
    assert_eq!(status.decode(&[0x0c]), Value::Text("PV Charge On-grid".to_owned()));
    assert_eq!(status.decode(&[0x99]), Value::Text("Unknown".to_owned()));
    assert_eq!(fault.decode(&[0, 0]), Value::Text("OK".to_owned()));
    assert_eq!(
        fault.decode(&[0, 0x0010]),
        Value::Text("E020: EPS connection fault".to_owned())
    );
}

#[test]
fn switch_bit_groups() {
    let single = SwitchBinding::new("ac_charge_enable", 21, 0x0080);
    let group = SwitchBinding::new("both", 21, 0x0003);

    assert!(single.is_on(0x0081));
    assert!(!single.is_on(0x0001));
    assert!(group.is_on(0x0003));
    assert!(!group.is_on(0x0001));
}

#[test]
fn bank_reading_lookup() {
    let reading = BankReading {
        kind: RegisterKind::Hold,
        start: 20,
        words: vec![512, 0x0080, 7],
    };

    let voltage = RegisterBinding::new("battery_voltage", 20, DecodeKind::FloatDiv10);
    let spanning = RegisterBinding::new("x", 22, DecodeKind::UInt16)
        .with_word_span(2, WordOrder::HighFirst);

    assert_eq!(reading.value_for(&voltage), Some(Value::Float(51.2)));
    assert_eq!(reading.value_for(&voltage.clone().input()), None);
    assert_eq!(reading.value_for(&spanning), None);
    assert_eq!(reading.register(RegisterKind::Hold, 21), Some(0x0080));
    assert_eq!(reading.register(RegisterKind::Hold, 19), None);
}

#[test]
fn values_serialize_plainly() {
    assert_eq!(serde_json::to_string(&Value::Float(51.2)).unwrap(), "51.2");
    assert_eq!(serde_json::to_string(&Value::Bool(true)).unwrap(), "true");
    assert_eq!(serde_json::to_string(&Value::Text("OK".into())).unwrap(), "\"OK\"");
}
