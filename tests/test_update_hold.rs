mod common;
use common::*;

use lux_engine::engine::commands::update_hold::{masked_value, UpdateHold};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

async fn session(dongle: &FakeDongle) -> Session {
    Session::connect(
        &Factory::inverter(dongle.port),
        CancellationToken::new(),
        Arc::new(Mutex::new(PacketStats::default())),
    )
    .await
    .unwrap()
}

const TIMEOUT: Duration = Duration::from_millis(300);

#[test]
fn clears_one_bit() {
    assert_eq!(masked_value(0xffff, 0x0010, false), 0xffef);
    assert_eq!(masked_value(0x0000, 0x0010, true), 0x0010);
    assert_eq!(masked_value(0x0080, 0x0080, true), 0x0080);
}

proptest! {
    #[test]
    fn bits_outside_mask_are_preserved(old in any::<u16>(), mask in any::<u16>(), enable in any::<bool>()) {
        let new = masked_value(old, mask, enable);

        prop_assert_eq!(new & !mask, old & !mask);
        if enable {
            prop_assert_eq!(new & mask, mask);
        } else {
            prop_assert_eq!(new & mask, 0);
        }
    }
}

#[tokio::test]
async fn happy_path() {
    common_setup();

    let dongle = FakeDongle::start().await;
    dongle.set_hold(21, 2);
    let mut session = session(&dongle).await;

    let written = UpdateHold::new(21, 0x0080, true)
        .run(&mut session, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(written, 130); // 128 + 2
    assert_eq!(dongle.hold(21), Some(130));

    let requests = dongle.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].device_function, DeviceFunction::ReadHold);
    assert_eq!(requests[0].register, 21);
    assert_eq!(requests[0].values, vec![1]);
    assert_eq!(dongle.writes(), vec![(21, 130)]);
}

#[tokio::test]
async fn rejected_write() {
    common_setup();

    let dongle = FakeDongle::start().await;
    dongle.set_hold(21, 0x0080);
    dongle.state().reject_writes = true;
    let mut session = session(&dongle).await;

    let err = UpdateHold::new(21, 0x0080, false)
        .run(&mut session, TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, WriteError::Rejected(_)), "{:?}", err);
    assert_eq!(dongle.hold(21), Some(0x0080));
}

#[tokio::test]
async fn no_reply() {
    common_setup();

    let dongle = FakeDongle::start().await;
    dongle.state().silent = true;
    let mut session = session(&dongle).await;

    let err = UpdateHold::new(21, 0x0080, true)
        .run(&mut session, TIMEOUT)
        .await
        .unwrap_err();

    assert_eq!(err, WriteError::Unreachable(ExchangeError::Timeout(TIMEOUT)));
    // never written without a fresh read
    assert!(dongle.writes().is_empty());
}

#[tokio::test]
async fn corrupt_read_is_stale() {
    common_setup();

    let dongle = FakeDongle::start().await;
    dongle.state().corrupt_replies = true;
    let mut session = session(&dongle).await;

    let err = UpdateHold::new(21, 0x0080, true)
        .run(&mut session, TIMEOUT)
        .await
        .unwrap_err();

    assert!(
        matches!(err, WriteError::Stale(FrameError::ChecksumMismatch { .. })),
        "{:?}",
        err
    );
    assert!(dongle.writes().is_empty());
}
