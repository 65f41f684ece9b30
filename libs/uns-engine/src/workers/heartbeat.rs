use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, SubsecRound, Timelike};
use tokio::time::{Instant, MissedTickBehavior};

use uns_api::topic::{TIMER_1H, TIMER_1M, TIMER_1S, TIMER_5S, TIMER_15S};
use uns_api::{MessageBus, UnsError, Worker};

/// Timer topics due at wall-clock time `now`.
///
/// `timers/1s` always; `5s` on multiples of five seconds; `15s` on multiples
/// of fifteen; `1m` at second zero; `1h` at second zero of minute zero.
pub fn cascade_topics<T: Timelike>(now: &T) -> Vec<&'static str> {
    let mut topics = vec![TIMER_1S];
    let second = now.second();
    if second % 5 == 0 {
        topics.push(TIMER_5S);
        if second % 15 == 0 {
            topics.push(TIMER_15S);
            if second == 0 {
                topics.push(TIMER_1M);
                if now.minute() == 0 {
                    topics.push(TIMER_1H);
                }
            }
        }
    }
    topics
}

/// Ticks land this far past the wall-clock second they stand for.
const TICK_SLACK: Duration = Duration::from_millis(5);

/// Delay from `now` to just past the next whole second.
pub fn until_next_second<T: Timelike>(now: &T) -> Duration {
    // nanosecond() exceeds 1e9 during a leap second.
    let into_second = u64::from(now.nanosecond() % 1_000_000_000);
    Duration::from_nanos(1_000_000_000 - into_second) + TICK_SLACK
}

/// Publishes the timer cascade once per second. Payload: `{"now": <local time>}`.
pub struct HeartbeatWorker {
    name: String,
    bus: Arc<dyn MessageBus>,
}

impl HeartbeatWorker {
    pub fn new(name: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            name: name.into(),
            bus,
        }
    }

    async fn tick(&self) {
        let now = Local::now();
        let payload = serde_json::json!({ "now": now });
        // Rounded so scheduler jitter around the boundary cannot repeat or skip a second.
        for topic in cascade_topics(&now.round_subsecs(0)) {
            if let Err(e) = self.bus.publish(topic, payload.clone(), false).await {
                tracing::error!(worker = %self.name, topic, error = %e, "heartbeat publish failed");
            }
        }
    }
}

impl Worker for HeartbeatWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            self.bus.connect().await?;
            tracing::info!(worker = %self.name, "heartbeat started");

            let first = Instant::now() + until_next_second(&Local::now());
            let mut ticker = tokio::time::interval_at(first, Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testing::RecordingBus;
    use chrono::NaiveTime;

    fn at(h: u32, m: u32, s: u32) -> Vec<&'static str> {
        cascade_topics(&NaiveTime::from_hms_opt(h, m, s).unwrap())
    }

    #[test]
    fn quarter_minute_fires_up_to_15s() {
        assert_eq!(at(12, 0, 15), vec![TIMER_1S, TIMER_5S, TIMER_15S]);
    }

    #[test]
    fn top_of_minute_and_hour() {
        assert_eq!(at(12, 0, 0), vec![TIMER_1S, TIMER_5S, TIMER_15S, TIMER_1M, TIMER_1H]);
        assert_eq!(at(13, 0, 0), vec![TIMER_1S, TIMER_5S, TIMER_15S, TIMER_1M, TIMER_1H]);
        assert_eq!(at(13, 7, 0), vec![TIMER_1S, TIMER_5S, TIMER_15S, TIMER_1M]);
    }

    #[test]
    fn plain_seconds() {
        assert_eq!(at(9, 30, 7), vec![TIMER_1S]);
        assert_eq!(at(9, 30, 10), vec![TIMER_1S, TIMER_5S]);
    }

    #[test]
    fn ticks_align_to_whole_seconds() {
        let t = NaiveTime::from_hms_milli_opt(12, 0, 14, 250).unwrap();
        assert_eq!(until_next_second(&t), Duration::from_millis(750) + TICK_SLACK);
        let t = NaiveTime::from_hms_opt(12, 0, 14).unwrap();
        assert_eq!(until_next_second(&t), Duration::from_secs(1) + TICK_SLACK);

        // A tick that fires a little late or early still counts for its second.
        let late = NaiveTime::from_hms_milli_opt(12, 59, 59, 996).unwrap();
        assert_eq!(cascade_topics(&late.round_subsecs(0)).len(), 5);
        let on_time = NaiveTime::from_hms_milli_opt(13, 0, 0, 5).unwrap();
        assert_eq!(cascade_topics(&on_time.round_subsecs(0)).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_every_second_and_survives_publish_errors() {
        let bus = Arc::new(RecordingBus::default());
        *bus.fail_publish.lock().unwrap() = true;
        let worker = Arc::new(HeartbeatWorker::new("heartbeat", bus.clone()));

        let w = worker.clone();
        let task = tokio::spawn(async move { w.run().await });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(bus.published.lock().unwrap().is_empty());

        *bus.fail_publish.lock().unwrap() = false;
        tokio::time::sleep(Duration::from_secs(3)).await;
        task.abort();

        let published = bus.published.lock().unwrap();
        let ones = published.iter().filter(|(t, _, _)| t == TIMER_1S).count();
        assert_eq!(ones, 3);
        assert!(published.iter().all(|(_, payload, retain)| payload.get("now").is_some() && !retain));
    }
}
