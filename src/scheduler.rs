use crate::prelude::*;

use tokio::time::MissedTickBehavior;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delays: 1s, 2s, 4s, ... up to `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

pub struct Scheduler {
    engine: Engine,
}

impl Scheduler {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Connects, polls on the configured interval and reconnects with
    /// backoff whenever the session is torn down. Returns once the engine
    /// is stopped.
    pub async fn start(&self) -> Result<()> {
        let engine = &self.engine;
        let datalog = engine.datalog();
        let shutdown = engine.shutdown_token();
        let mut backoff = Backoff::new(INITIAL_BACKOFF, engine.config().reconnect_delay_max());

        info!(
            "inverter {}: scheduler starting, polling every {}s",
            datalog,
            engine.poll_interval().as_secs()
        );

        'outer: while !shutdown.is_cancelled() {
            match engine.connect().await {
                Ok(()) => backoff.reset(),
                Err(ConnectError::Cancelled) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "inverter {}: connect failed: {}, retrying in {}s",
                        datalog,
                        e,
                        delay.as_secs()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.cancelled() => break,
                    }
                }
            }

            let mut interval = tokio::time::interval(engine.poll_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => break 'outer,
                }

                match engine.poll_once().await {
                    Ok(report) => trace!("inverter {}: {:?}", datalog, report),
                    Err(e) if !engine.is_connected() => {
                        warn!("inverter {}: poll aborted: {}", datalog, e);
                        break;
                    }
                    Err(e) => warn!("inverter {}: poll failed: {}", datalog, e),
                }
            }

            let delay = backoff.next_delay();
            info!("inverter {}: reconnecting in {}s", datalog, delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        engine.disconnect().await;
        info!("inverter {}: scheduler stopped", datalog);

        Ok(())
    }
}
