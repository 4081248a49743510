//! Per-file progress coalescing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::events::{EventBus, JobEvent};

#[derive(Debug)]
struct Slot {
    last_emit: Option<Instant>,
    pending: Option<JobEvent>,
}

/// Coalesces progress updates so each file emits at most one update per
/// interval. A 100% update always goes out immediately.
#[derive(Debug)]
pub struct ProgressThrottler {
    interval: Duration,
    bus: EventBus,
    slots: HashMap<u32, Slot>,
    closed: bool,
}

impl ProgressThrottler {
    /// Creates a throttler publishing on `bus`.
    #[must_use]
    pub fn new(bus: EventBus, interval: Duration) -> Self {
        Self {
            interval,
            bus,
            slots: HashMap::new(),
            closed: false,
        }
    }

    /// Offers a progress update for file `index`.
    pub fn update(&mut self, index: u32, name: Option<String>, size: Option<u64>, percentage: u8) {
        self.update_at(Instant::now(), index, name, size, percentage);
    }

    /// Same as [`update`](Self::update) with an explicit clock reading.
    pub fn update_at(
        &mut self,
        now: Instant,
        index: u32,
        name: Option<String>,
        size: Option<u64>,
        percentage: u8,
    ) {
        if self.closed {
            return;
        }
        let event = JobEvent::Progress {
            index,
            name,
            size,
            percentage: percentage.min(100),
        };
        let slot = self.slots.entry(index).or_insert(Slot {
            last_emit: None,
            pending: None,
        });
        let due = slot
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if percentage >= 100 || due {
            slot.pending = None;
            slot.last_emit = Some(now);
            self.bus.emit(event);
        } else {
            slot.pending = Some(event);
        }
    }

    /// Drops the pending update of `index`, once the file has failed.
    pub fn discard(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.pending = None;
        }
    }

    /// Emits pending updates whose interval has elapsed.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Same as [`tick`](Self::tick) with an explicit clock reading.
    pub fn tick_at(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        for slot in self.slots.values_mut() {
            let due = slot
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= self.interval);
            if due && let Some(event) = slot.pending.take() {
                slot.last_emit = Some(now);
                self.bus.emit(event);
            }
        }
    }

    /// Emits every pending update and stops accepting new ones. Later calls
    /// do nothing.
    pub fn flush(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut indices: Vec<u32> = self.slots.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            if let Some(event) = self.slots.get_mut(&index).and_then(|s| s.pending.take()) {
                self.bus.emit(event);
            }
        }
    }
}

impl Drop for ProgressThrottler {
    fn drop(&mut self) {
        self.flush();
    }
}
