#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

/// Lazily-updated model of the platter's angular position and the number of
/// completed revolutions. The counter is only valid at `last_update`; callers
/// must advance it before reading. A stopped motor accumulates nothing.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct RotationalModel {
    cycles_per_rotation: u32,
    counter: u32,
    rotations: u32,
    last_update: u64,
}

impl RotationalModel {
    pub fn new(cycles_per_rotation: u32) -> Self {
        debug_assert!(cycles_per_rotation > 0);
        RotationalModel {
            cycles_per_rotation,
            counter: 0,
            rotations: 0,
            last_update: 0,
        }
    }

    pub fn cycles_per_rotation(&self) -> u32 {
        self.cycles_per_rotation
    }

    /// Cycles into the current revolution, valid as of the last advance.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Completed revolutions since reset. Wraps are tolerated; only deltas
    /// are meaningful.
    pub fn rotations(&self) -> u32 {
        self.rotations
    }

    /// Catch the counter up to `now`. With the motor stopped the platter
    /// does not turn, so only the timestamp moves.
    pub fn advance_to(&mut self, now: u64, motor_on: bool) {
        let elapsed = now.saturating_sub(self.last_update);
        self.last_update = self.last_update.max(now);

        if !motor_on || elapsed == 0 {
            return;
        }

        // 64-bit accumulation: after a long idle period the elapsed delta
        // can exceed what a u32 product would hold.
        let total = self.counter as u64 + elapsed;
        let period = self.cycles_per_rotation as u64;
        self.counter = (total % period) as u32;
        self.rotations = self.rotations.wrapping_add((total / period) as u32);
    }

    /// Non-mutating variant of `advance_to`: the (counter, rotations) pair
    /// as they would read at `now`.
    pub fn snapshot(&self, now: u64, motor_on: bool) -> (u32, u32) {
        let elapsed = now.saturating_sub(self.last_update);
        if !motor_on || elapsed == 0 {
            return (self.counter, self.rotations);
        }
        let total = self.counter as u64 + elapsed;
        let period = self.cycles_per_rotation as u64;
        (
            (total % period) as u32,
            self.rotations.wrapping_add((total / period) as u32),
        )
    }

    /// Advance the angular position as if `cycles` had elapsed, without any
    /// scheduler time passing. This is the fast-mode half of the
    /// warp-or-delay split: the final rotational outcome matches the
    /// accurate path, only the elapsed scheduler time differs.
    pub fn warp(&mut self, cycles: u64) {
        let total = self.counter as u64 + cycles;
        let period = self.cycles_per_rotation as u64;
        self.counter = (total % period) as u32;
        self.rotations = self.rotations.wrapping_add((total / period) as u32);
    }

    /// Swap in a new rotation period, preserving the angular fraction.
    pub fn set_cycles_per_rotation(&mut self, cycles_per_rotation: u32) {
        debug_assert!(cycles_per_rotation > 0);
        if cycles_per_rotation == self.cycles_per_rotation {
            return;
        }
        self.counter = (self.counter as u64 * cycles_per_rotation as u64
            / self.cycles_per_rotation as u64) as u32;
        self.cycles_per_rotation = cycles_per_rotation;
    }

    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter % self.cycles_per_rotation;
    }

    /// Angular position as a fraction of a revolution, for save-states.
    pub fn position_fraction(&self) -> f32 {
        self.counter as f32 / self.cycles_per_rotation as f32
    }

    pub fn set_position_fraction(&mut self, fraction: f32) {
        let f = fraction.clamp(0.0, 1.0);
        self.counter =
            ((f as f64 * self.cycles_per_rotation as f64) as u32) % self.cycles_per_rotation;
    }

    pub fn resync(&mut self, now: u64) {
        self.last_update = now;
    }
}
