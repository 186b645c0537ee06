//! Hierarchical timer wheel
//!
//! O(1) scheduling and firing for very large timer populations
//! (per-connection timeouts, per-service metrics commits). Eight levels of
//! 256 slots cover the full 64-bit tick range; events sit in a slab and
//! slots hold doubly-linked lists of slab indices, so relinking on cascade
//! or reschedule never allocates.
//!
//! The wheel is advanced synchronously by its owning core; fired values are
//! handed back to the caller, which owns all side effects.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Levels in the hierarchy
pub const WHEEL_LEVELS: usize = 8;

/// Slots per level (one byte of the tick per level)
pub const WHEEL_SLOTS: usize = 256;

const NIL: u32 = u32::MAX;

/// Stable handle to a scheduled event.
///
/// Tokens are invalidated when the event fires or is cancelled; a stale
/// token is rejected by generation check rather than touching a reused
/// slab entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    idx: u32,
    gen: u32,
}

struct Node<T> {
    value: Option<T>,
    deadline: u64,
    gen: u32,
    prev: u32,
    next: u32,
    level: u8,
    slot: u8,
    linked: bool,
}

/// Hierarchical timer wheel over values of type `T`
pub struct TimerWheel<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    slots: Box<[[u32; WHEEL_SLOTS]]>,
    now: u64,
    len: usize,
    rng: SmallRng,
}

impl<T> TimerWheel<T> {
    /// Create an empty wheel at tick zero
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Create a wheel with a deterministic jitter seed (tests)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            slots: vec![[NIL; WHEEL_SLOTS]; WHEEL_LEVELS].into_boxed_slice(),
            now: 0,
            len: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Current tick
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Scheduled events
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Level and slot a deadline belongs to, seen from the current tick
    fn position(&self, deadline: u64) -> (usize, usize) {
        let delta = deadline.saturating_sub(self.now).max(1) as u128;
        for level in 0..WHEEL_LEVELS {
            if delta < 1u128 << (8 * (level + 1)) {
                let slot = ((deadline >> (8 * level)) & 0xFF) as usize;
                return (level, slot);
            }
        }
        (WHEEL_LEVELS - 1, ((deadline >> 56) & 0xFF) as usize)
    }

    fn link(&mut self, idx: u32) {
        let deadline = self.nodes[idx as usize].deadline;
        let (level, slot) = self.position(deadline);
        let head = self.slots[level][slot];
        {
            let n = &mut self.nodes[idx as usize];
            n.prev = NIL;
            n.next = head;
            n.level = level as u8;
            n.slot = slot as u8;
            n.linked = true;
        }
        if head != NIL {
            self.nodes[head as usize].prev = idx;
        }
        self.slots[level][slot] = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next, level, slot, linked) = {
            let n = &self.nodes[idx as usize];
            (n.prev, n.next, n.level as usize, n.slot as usize, n.linked)
        };
        if !linked {
            return;
        }
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.slots[level][slot] = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        }
        let n = &mut self.nodes[idx as usize];
        n.prev = NIL;
        n.next = NIL;
        n.linked = false;
    }

    fn alloc(&mut self, value: T, deadline: u64) -> TimerToken {
        let idx = match self.free.pop() {
            Some(idx) => {
                let n = &mut self.nodes[idx as usize];
                n.value = Some(value);
                n.deadline = deadline;
                idx
            }
            None => {
                let idx = self.nodes.len() as u32;
                self.nodes.push(Node {
                    value: Some(value),
                    deadline,
                    gen: 0,
                    prev: NIL,
                    next: NIL,
                    level: 0,
                    slot: 0,
                    linked: false,
                });
                idx
            }
        };
        TimerToken {
            idx,
            gen: self.nodes[idx as usize].gen,
        }
    }

    fn token_node(&self, token: TimerToken) -> Option<usize> {
        let idx = token.idx as usize;
        let n = self.nodes.get(idx)?;
        if n.gen == token.gen && n.value.is_some() {
            Some(idx)
        } else {
            None
        }
    }

    /// Schedule `value` to fire after `delta` ticks (clamped to at least 1)
    pub fn schedule(&mut self, value: T, delta: u64) -> TimerToken {
        let deadline = self.now + delta.max(1);
        let token = self.alloc(value, deadline);
        self.link(token.idx);
        self.len += 1;
        token
    }

    /// Schedule `value` for an arbitrary tick within `[min, max]` ticks
    /// from now. The jitter spreads simultaneous timeouts so they do not
    /// all expire on the same tick.
    pub fn schedule_in_range(&mut self, value: T, min: u64, max: u64) -> TimerToken {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let delta = if lo == hi {
            lo
        } else {
            self.rng.gen_range(lo..=hi)
        };
        self.schedule(value, delta)
    }

    /// Move an already-scheduled event to a new deadline.
    /// Returns false for a stale token.
    pub fn reschedule(&mut self, token: TimerToken, delta: u64) -> bool {
        let Some(idx) = self.token_node(token) else {
            return false;
        };
        self.unlink(idx as u32);
        self.nodes[idx].deadline = self.now + delta.max(1);
        self.link(idx as u32);
        true
    }

    /// Jittered variant of [`TimerWheel::reschedule`]
    pub fn reschedule_in_range(&mut self, token: TimerToken, min: u64, max: u64) -> bool {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let delta = if lo == hi {
            lo
        } else {
            self.rng.gen_range(lo..=hi)
        };
        self.reschedule(token, delta)
    }

    /// Remove a scheduled event, returning its value
    pub fn cancel(&mut self, token: TimerToken) -> Option<T> {
        let idx = self.token_node(token)?;
        self.unlink(idx as u32);
        let n = &mut self.nodes[idx];
        let value = n.value.take();
        n.gen = n.gen.wrapping_add(1);
        self.free.push(idx as u32);
        self.len -= 1;
        value
    }

    /// Advance the wheel by `ticks`, collecting every fired value in tick
    /// order
    pub fn advance(&mut self, ticks: u64) -> Vec<T> {
        let mut fired = Vec::new();
        for _ in 0..ticks {
            self.tick(&mut fired);
        }
        fired
    }

    fn tick(&mut self, fired: &mut Vec<T>) {
        self.now += 1;
        let idx0 = (self.now & 0xFF) as usize;
        if idx0 == 0 {
            for level in 1..WHEEL_LEVELS {
                let idx = ((self.now >> (8 * level)) & 0xFF) as usize;
                self.cascade(level, idx);
                if idx != 0 {
                    break;
                }
            }
        }

        let mut cur = self.slots[0][idx0];
        self.slots[0][idx0] = NIL;
        while cur != NIL {
            let next = self.nodes[cur as usize].next;
            let n = &mut self.nodes[cur as usize];
            debug_assert_eq!(n.deadline, self.now);
            n.prev = NIL;
            n.next = NIL;
            n.linked = false;
            if let Some(v) = n.value.take() {
                fired.push(v);
            }
            n.gen = n.gen.wrapping_add(1);
            self.free.push(cur);
            self.len -= 1;
            cur = next;
        }
    }

    /// Relink every event in a higher-level slot one level down
    fn cascade(&mut self, level: usize, slot: usize) {
        let mut cur = self.slots[level][slot];
        self.slots[level][slot] = NIL;
        while cur != NIL {
            let next = self.nodes[cur as usize].next;
            self.link(cur);
            cur = next;
        }
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}
