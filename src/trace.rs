// Bounded history of controller state transitions, kept for diagnostics.

use crate::ota::OtaState;

/// Fixed-size ring that overwrites its oldest entry once full.
pub struct Ring<T, const N: usize> {
    slots: [T; N],
    head: usize,
    len: usize,
}

impl<T: Default + Copy, const N: usize> Ring<T, N> {
    pub fn new() -> Self {
        Self {
            slots: [T::default(); N],
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        self.slots[self.head] = value;
        self.head = (self.head + 1) % N;
        if self.len < N {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let start = if self.len < N { 0 } else { self.head };
        (0..self.len).map(move |i| &self.slots[(start + i) % N])
    }

    pub fn last(&self) -> Option<&T> {
        if self.len == 0 {
            None
        } else {
            Some(&self.slots[(self.head + N - 1) % N])
        }
    }
}

impl<T: Default + Copy, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transition {
    pub seq: u32,
    pub from: OtaState,
    pub to: OtaState,
}

pub const TRACE_DEPTH: usize = 32;

#[derive(Default)]
pub struct TransitionTrace {
    ring: Ring<Transition, TRACE_DEPTH>,
    next_seq: u32,
}

impl TransitionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, from: OtaState, to: OtaState) {
        self.ring.push(Transition {
            seq: self.next_seq,
            from,
            to,
        });
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transition> + '_ {
        self.ring.iter()
    }

    /// Target states in the order they were entered
    pub fn states(&self) -> Vec<OtaState> {
        self.ring.iter().map(|t| t.to).collect()
    }

    pub fn last(&self) -> Option<&Transition> {
        self.ring.last()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
