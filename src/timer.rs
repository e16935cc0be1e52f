use std::time::{Duration, Instant};

use crate::error::{Chip8Error, Result};

pub type TimerCallback = Box<dyn FnMut(u32) + Send>;

/// A countdown that loses one count per elapsed `period`.
///
/// Repeating timers never stop: when the count reaches zero they are reloaded
/// with one, so they fire once every period. One-shot timers hold at zero until
/// [`Timer::set_remaining`] gives them a new count, and the first decrement after
/// that comes one full period later.
pub struct Timer {
    period: Duration,
    repeat: bool,
    remaining: u32,
    last_tick: Option<Instant>,
    callbacks: Vec<TimerCallback>,
}

impl Timer {
    pub fn new(period: Duration, repeat: bool, initial_count: u32) -> Result<Self> {
        if period.is_zero() {
            return Err(Chip8Error::InvalidTimerPeriod);
        }
        let remaining = if repeat { initial_count.max(1) } else { initial_count };

        Ok(Timer {
            period,
            repeat,
            remaining,
            last_tick: None,
            callbacks: Vec::new(),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn set_remaining(&mut self, count: u32) {
        self.set_remaining_at(count, Instant::now());
    }

    /// Loads a new count and restarts the period at `now`.
    pub fn set_remaining_at(&mut self, count: u32, now: Instant) {
        self.remaining = count;
        self.last_tick = Some(now);
    }

    pub fn register_callback(&mut self, callback: TimerCallback) {
        self.callbacks.push(callback);
    }

    pub fn tick(&mut self, now: Instant) {
        if self.remaining == 0 {
            return;
        }
        if let Some(last) = self.last_tick {
            if now.saturating_duration_since(last) < self.period {
                return;
            }
        }

        self.last_tick = Some(now);
        self.remaining -= 1;
        for callback in &mut self.callbacks {
            callback(self.remaining);
        }

        if self.remaining == 0 && self.repeat {
            self.remaining = 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Drives a set of timers from one clock read per tick.
#[derive(Default)]
pub struct TimerManager {
    timers: Vec<(TimerId, Timer)>,
    next_id: u64,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_timer(&mut self, period: Duration, repeat: bool, initial_count: u32) -> Result<TimerId> {
        let timer = Timer::new(period, repeat, initial_count)?;
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.push((id, timer));
        Ok(id)
    }

    /// Handles stay unique after removal, so a stale id never aliases a newer timer.
    pub fn remove_timer(&mut self, id: TimerId) -> Option<Timer> {
        let position = self.timers.iter().position(|(timer_id, _)| *timer_id == id)?;
        Some(self.timers.remove(position).1)
    }

    pub fn get(&self, id: TimerId) -> Option<&Timer> {
        self.timers
            .iter()
            .find(|(timer_id, _)| *timer_id == id)
            .map(|(_, timer)| timer)
    }

    pub fn get_mut(&mut self, id: TimerId) -> Option<&mut Timer> {
        self.timers
            .iter_mut()
            .find(|(timer_id, _)| *timer_id == id)
            .map(|(_, timer)| timer)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        for (_, timer) in &mut self.timers {
            timer.tick(now);
        }
    }
}
