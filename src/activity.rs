//! Idle/active tracking for one engine
//!
//! The engine is active while tasks keep arriving and goes idle once nothing
//! has happened for `idle_timeout`. Each active period is summarised when it
//! ends, after which the completed-task counter starts over.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Idle,
    Active,
}

/// Throughput of an active period that just ended
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePeriod {
    /// Seconds spent active, not counting the trailing idle timeout
    pub processing_time: f64,
    pub tasks_completed: u64,
    /// `None` when the period was too short to measure
    pub tasks_per_second: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    BecameActive { wakeup_time: f64 },
    WentIdle(ActivePeriod),
}

#[derive(Debug, Clone)]
pub struct ActivityTracker {
    idle_timeout: Duration,
    created_at: f64,
    state: ActivityState,
    last_action_time: Option<f64>,
    sleep_time: f64,
    wakeup_time: Option<f64>,
    tasks_completed: u64,
}

impl ActivityTracker {
    /// Start out idle, as if the last action was a full timeout ago
    pub fn new(now: f64, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            created_at: now,
            state: ActivityState::Idle,
            last_action_time: None,
            sleep_time: now,
            wakeup_time: None,
            tasks_completed: 0,
        }
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed
    }

    pub fn wakeup_time(&self) -> Option<f64> {
        self.wakeup_time
    }

    pub fn sleep_time(&self) -> f64 {
        self.sleep_time
    }

    pub fn last_action_time(&self) -> f64 {
        self.last_action_time
            .unwrap_or(self.created_at - self.idle_timeout.as_secs_f64())
    }

    /// A task was picked up
    pub fn record_action(&mut self, now: f64) {
        self.last_action_time = Some(now);
    }

    /// `count` handler invocations finished successfully
    pub fn record_completed(&mut self, count: u64, now: f64) {
        self.tasks_completed += count;
        self.last_action_time = Some(now);
    }

    /// Re-evaluate the state; returns the transition if one happened
    pub fn check(&mut self, now: f64) -> Option<Transition> {
        let idle = match self.last_action_time {
            Some(last) => now - last > self.idle_timeout.as_secs_f64(),
            None => true,
        };
        let new_state = if idle {
            ActivityState::Idle
        } else {
            ActivityState::Active
        };
        if new_state == self.state {
            return None;
        }
        self.state = new_state;

        match new_state {
            ActivityState::Active => {
                self.wakeup_time = Some(now);
                Some(Transition::BecameActive { wakeup_time: now })
            }
            ActivityState::Idle => {
                self.sleep_time = now;
                let wakeup = self.wakeup_time.unwrap_or(now);
                let processing_time = (now - wakeup) - self.idle_timeout.as_secs_f64();
                let tasks_per_second = (processing_time > 0.0)
                    .then(|| self.tasks_completed as f64 / processing_time);

                let period = ActivePeriod {
                    processing_time,
                    tasks_completed: self.tasks_completed,
                    tasks_per_second,
                };
                self.tasks_completed = 0;
                Some(Transition::WentIdle(period))
            }
        }
    }
}
