//! # Event-Threshold Controller
//!
//! A hysteresis breaker against state-change storms. Once per
//! [`THRESHOLD_TICK`] the events counted since the previous tick are compared
//! with the configured ceiling. `repeat` consecutive overloaded ticks trip the
//! breaker; recovery happens [`COOL_DOWN`] after tripping, whatever the rate
//! is by then.
//!
//! The controller only decides. Swapping subscriptions and notifying listeners
//! is done by the router when [`EventThreshold::tick`] returns an action.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::configs::ThresholdSettings;

pub const THRESHOLD_TICK: Duration = Duration::from_secs(1);
pub const TRIP_DEBOUNCE: Duration = Duration::from_millis(100);
pub const COOL_DOWN: Duration = Duration::from_secs(60);
/// The only state namespace still delivered while tripped.
pub const COARSE_PATTERN: &str = "system.adapter.*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdAction {
    None,
    Trip,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdSnapshot {
    pub active: bool,
    pub count: u64,
    pub overloaded_ticks: u32,
    pub value: u64,
    pub repeat_seconds: u32,
}

#[derive(Debug)]
pub struct EventThreshold {
    enabled: bool,
    value: u64,
    repeat: u32,
    count: u64,
    overloaded_ticks: u32,
    active: bool,
    activated_at: Option<Instant>,
}

impl EventThreshold {
    pub fn new(settings: &ThresholdSettings) -> Self {
        Self {
            enabled: settings.enabled,
            value: settings.value,
            repeat: settings.repeat_seconds.max(1),
            count: 0,
            overloaded_ticks: 0,
            active: false,
            activated_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn record_event(&mut self) {
        if self.enabled && !self.active {
            self.count += 1;
        }
    }

    pub fn tick(&mut self, now: Instant) -> ThresholdAction {
        if !self.enabled {
            return ThresholdAction::None;
        }

        if self.active {
            let elapsed = self.activated_at.map_or(COOL_DOWN, |at| now.saturating_duration_since(at));
            if elapsed >= COOL_DOWN {
                self.reset();
                return ThresholdAction::Restore;
            }
            return ThresholdAction::None;
        }

        let overloaded = self.count > self.value;
        self.count = 0;
        if !overloaded {
            self.overloaded_ticks = 0;
            return ThresholdAction::None;
        }

        self.overloaded_ticks += 1;
        if self.overloaded_ticks >= self.repeat {
            self.active = true;
            self.activated_at = Some(now);
            self.overloaded_ticks = 0;
            return ThresholdAction::Trip;
        }
        ThresholdAction::None
    }

    /// Trips immediately. Returns `Trip` unless already active.
    pub fn force_enable(&mut self, now: Instant) -> ThresholdAction {
        if self.active {
            return ThresholdAction::None;
        }
        self.active = true;
        self.activated_at = Some(now);
        self.count = 0;
        self.overloaded_ticks = 0;
        ThresholdAction::Trip
    }

    pub fn force_disable(&mut self) -> ThresholdAction {
        if !self.active {
            return ThresholdAction::None;
        }
        self.reset();
        ThresholdAction::Restore
    }

    fn reset(&mut self) {
        self.active = false;
        self.activated_at = None;
        self.count = 0;
        self.overloaded_ticks = 0;
    }

    pub fn snapshot(&self) -> ThresholdSnapshot {
        ThresholdSnapshot {
            active: self.active,
            count: self.count,
            overloaded_ticks: self.overloaded_ticks,
            value: self.value,
            repeat_seconds: self.repeat,
        }
    }
}
