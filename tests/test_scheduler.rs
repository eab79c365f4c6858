mod common;
use common::*;

use lux_engine::scheduler::{Backoff, Scheduler};

async fn next_matching<F>(events: &mut broadcast::Receiver<SinkEvent>, wanted: F) -> SinkEvent
where
    F: Fn(&SinkEvent) -> bool,
{
    let wait = async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    };

    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for event")
}

#[test]
fn backoff_doubles_up_to_max() {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

    let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_secs(1));
}

#[tokio::test]
async fn polls_then_stops() {
    common_setup();

    let dongle = FakeDongle::start().await;
    dongle.set_hold(20, 532);
    let (engine, mut events) = Factory::engine(Factory::inverter(dongle.port));

    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { Scheduler::new(engine).start().await })
    };

    // the first tick fires straight away
    let event = next_matching(&mut events, |e| matches!(e, SinkEvent::Value { .. })).await;
    assert_eq!(event, value_event("battery_voltage", Value::Float(53.2)));

    engine.stop();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(engine.state(), EngineState::Disconnected);
    assert!(engine.is_stopped());
}

#[tokio::test]
async fn reconnects_after_the_line_drops() {
    common_setup();

    let dongle = FakeDongle::start().await;
    dongle.set_hold(20, 100);
    // handshake only, the first poll finds the connection gone
    dongle.state().drop_after = Some(1);

    let (engine, mut events) = Factory::engine(Factory::inverter(dongle.port));
    let task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start().await }
    });

    next_matching(&mut events, |e| {
        matches!(
            e,
            SinkEvent::ConnectionState {
                state: ConnectionState::Disconnected,
                ..
            }
        )
    })
    .await;
    dongle.state().drop_after = None;

    let event = next_matching(&mut events, |e| matches!(e, SinkEvent::Value { .. })).await;
    assert_eq!(event, value_event("battery_voltage", Value::Float(10.0)));
    assert_eq!(dongle.connections(), 2);

    engine.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_interrupts_reconnect_backoff() {
    common_setup();

    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let (engine, mut events) = Factory::engine(Factory::inverter(port));
    let task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start().await }
    });

    next_matching(&mut events, |e| {
        matches!(
            e,
            SinkEvent::ConnectionState {
                state: ConnectionState::Disconnected,
                ..
            }
        )
    })
    .await;

    engine.stop();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
