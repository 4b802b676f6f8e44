//! # Alarms
//!
//! Device supervision reports failures through an [`AlarmSink`] rather
//! than logging directly, so hosts can route them to MQTT, shell hooks
//! or monitoring. The default sink is silent, which keeps tests free of
//! mocks: a recording sink observes everything.
//!
//! Emission is throttled to once per minute per distinct alarm context.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The alarm taxonomy of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alarm {
    SpecifiedDeviceNotFound,
    DeviceFailure,
    DeviceInactivity,
    RegularResetFailure,
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Alarm::SpecifiedDeviceNotFound => "SpecifiedDeviceNotFound",
            Alarm::DeviceFailure => "DeviceFailure",
            Alarm::DeviceInactivity => "DeviceInactivity",
            Alarm::RegularResetFailure => "RegularResetFailure",
        };
        write!(f, "{s}")
    }
}

/// External alarm destination. All methods default to silence.
pub trait AlarmSink: Send + Sync {
    fn alarm(&self, _alarm: Alarm, _message: &str) {}
}

/// The default do-nothing sink.
#[derive(Debug, Default)]
pub struct SilentAlarmSink;

impl AlarmSink for SilentAlarmSink {}

/// Test/diagnostic sink that records everything it sees.
#[derive(Debug, Default)]
pub struct RecordingAlarmSink {
    pub alarms: Mutex<Vec<(Alarm, String)>>,
}

impl RecordingAlarmSink {
    pub fn new() -> Self {
        RecordingAlarmSink::default()
    }

    pub fn recorded(&self) -> Vec<(Alarm, String)> {
        self.alarms.lock().unwrap().clone()
    }
}

impl AlarmSink for RecordingAlarmSink {
    fn alarm(&self, alarm: Alarm, message: &str) {
        self.alarms.lock().unwrap().push((alarm, message.to_string()));
    }
}

const ALARM_THROTTLE: Duration = Duration::from_secs(60);

/// Wraps a sink with per-context rate limiting and logging.
pub struct AlarmDispatcher {
    sink: Arc<dyn AlarmSink>,
    last_sent: Mutex<HashMap<(Alarm, String), Instant>>,
}

impl AlarmDispatcher {
    pub fn new(sink: Arc<dyn AlarmSink>) -> Self {
        AlarmDispatcher {
            sink,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Emit an alarm, at most once per minute per (alarm, context).
    pub fn log_alarm(&self, alarm: Alarm, context: &str, message: &str) {
        let key = (alarm, context.to_string());
        let now = Instant::now();
        let mut last = self.last_sent.lock().unwrap();
        if let Some(prev) = last.get(&key) {
            if now.duration_since(*prev) < ALARM_THROTTLE {
                return;
            }
        }
        last.insert(key, now);
        drop(last);

        log::warn!("[ALARM {alarm}] {message}");
        self.sink.alarm(alarm, message);
    }
}
