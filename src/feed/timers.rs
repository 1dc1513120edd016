//! Timer slots owned by the state machine
//!
//! One slot per timer kind. Arming an occupied slot always cancels the
//! previous timer first, so two timers of the same kind can never be
//! outstanding. Each armed timer gets a fresh token; a fire carrying any
//! other token is stale and must be ignored.

use std::time::Duration;

/// Kinds of scheduled callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ProbeTimeout,
    ConnectTimeout,
    Reconnect,
    Ping,
    SyntheticTick,
}

impl TimerKind {
    pub const COUNT: usize = 5;

    pub const ALL: [TimerKind; Self::COUNT] = [
        TimerKind::ProbeTimeout,
        TimerKind::ConnectTimeout,
        TimerKind::Reconnect,
        TimerKind::Ping,
        TimerKind::SyntheticTick,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Identity of one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Instruction for whoever actually runs the clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    Arm {
        kind: TimerKind,
        token: TimerToken,
        after: Duration,
    },
    Cancel { kind: TimerKind },
}

/// Per-kind outstanding timer registry
#[derive(Debug, Default)]
pub struct TimerSlots {
    slots: [Option<TimerToken>; TimerKind::COUNT],
    next_token: u64,
}

impl TimerSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire after `after`, cancelling any outstanding timer
    /// of the same kind.
    pub fn replace(&mut self, kind: TimerKind, after: Duration, ops: &mut Vec<TimerOp>) {
        self.cancel(kind, ops);
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.slots[kind.index()] = Some(token);
        ops.push(TimerOp::Arm { kind, token, after });
    }

    /// Cancel `kind` if outstanding
    pub fn cancel(&mut self, kind: TimerKind, ops: &mut Vec<TimerOp>) {
        if self.slots[kind.index()].take().is_some() {
            ops.push(TimerOp::Cancel { kind });
        }
    }

    /// Cancel every outstanding timer
    pub fn cancel_all(&mut self, ops: &mut Vec<TimerOp>) {
        for kind in TimerKind::ALL {
            self.cancel(kind, ops);
        }
    }

    /// Consume a fire. Returns `true` if `token` is the live timer of `kind`;
    /// the slot is then empty.
    pub fn fire(&mut self, kind: TimerKind, token: TimerToken) -> bool {
        let slot = &mut self.slots[kind.index()];
        if *slot == Some(token) {
            *slot = None;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    /// Number of outstanding timers
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
