use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Default)]
struct LimiterState {
    in_use: usize,
    next_ticket: u64,
    /// FIFO of suspended callers, oldest first.
    waiting: VecDeque<u64>,
    /// Tickets whose slot has been handed over by a releaser.
    granted: VecDeque<u64>,
}

/// Bounds the number of simultaneously running executor subprocesses.
/// A freed slot is transferred directly to the longest-waiting caller,
/// so the in-use count never dips below the true demand while waiters
/// exist.
#[derive(Debug)]
pub struct SlotLimiter {
    max: usize,
    state: Mutex<LimiterState>,
    available: Condvar,
}

impl SlotLimiter {
    pub fn new(max: usize) -> Arc<SlotLimiter> {
        Arc::new(SlotLimiter {
            max: max.max(1),
            state: Mutex::new(LimiterState::default()),
            available: Condvar::new(),
        })
    }

    /// Blocks until a slot is free; FIFO among waiters.
    pub fn acquire(self: &Arc<Self>) -> SlotPermit {
        let mut state = self.state.lock().expect("limiter poisoned");
        if state.waiting.is_empty() && state.in_use < self.max {
            state.in_use += 1;
            return SlotPermit {
                limiter: Arc::clone(self),
            };
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push_back(ticket);

        loop {
            if let Some(position) = state.granted.iter().position(|&t| t == ticket) {
                state.granted.remove(position);
                return SlotPermit {
                    limiter: Arc::clone(self),
                };
            }
            state = self.available.wait(state).expect("limiter poisoned");
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("limiter poisoned");
        if let Some(ticket) = state.waiting.pop_front() {
            // Direct handoff: in_use is unchanged, the slot moves owner.
            state.granted.push_back(ticket);
            self.available.notify_all();
        } else {
            state.in_use = state.in_use.saturating_sub(1);
        }
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().expect("limiter poisoned").in_use
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().expect("limiter poisoned").waiting.len()
    }
}

/// RAII slot; dropping it releases or hands the slot to the next waiter.
#[derive(Debug)]
pub struct SlotPermit {
    limiter: Arc<SlotLimiter>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
