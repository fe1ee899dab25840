use thiserror::Error;

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

/// Ten minutes of machine cycles. No firmware idle timer runs anywhere near
/// this long; a larger value marks the blob as corrupt.
pub const MAX_IDLE_TIMER_CYCLES: u64 = 1_073_863_500;

pub const MAX_TRACK: u32 = 65_535;

/// Saved-state integrity failures. The load path refuses the whole blob
/// rather than guessing at clamped values.
#[derive(Error, Debug, PartialEq)]
pub enum SaveStateError {
    #[error("implausible idle timer in saved state ({0} cycles)")]
    InvalidIdleTimer(u64),
    #[error("implausible track number in saved state ({0})")]
    InvalidTrack(u32),
    #[error("rotational position out of range ({0})")]
    InvalidRotationalPosition(f32),
    #[error("unknown active command 0x{0:02X} in saved state")]
    UnknownCommand(u8),
    #[error("unknown command state {1} for command 0x{0:02X} in saved state")]
    UnknownCommandState(u8, u8),
}

/// Mid-command checkpoint: enough to rebuild the typed state-machine value.
/// `state` uses the firmware's numbered-checkpoint convention.
#[derive(Clone, PartialEq, Debug, Default)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct ActiveCommandState {
    pub command: u8,
    pub state: u8,
    pub sector: u16,
    pub attempt: u8,
    pub high_speed: bool,
    pub selected_phys: Option<u32>,
    pub fdc_status: u8,
    /// Command-family scratch: format track counter, vendor RAM address.
    pub progress: u16,
    pub data: Vec<u8>,
}

/// Everything a drive unit needs persisted to resume, including mid-command.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct DriveSaveState {
    pub idle_timer_remaining: Option<u64>,
    pub active_command: Option<ActiveCommandState>,
    /// Rotational position normalized to a fraction of one revolution.
    pub rotational_fraction: f32,
    pub rotations: u32,
    pub current_track: u32,
    pub buffered_track: i32,
    pub last_read_sector: u16,
    pub buffering_enabled: bool,
    pub last_op_error: bool,
    pub fdc_status: u8,
    pub weak_lfsr: u32,
    pub phantom_counters: Vec<u8>,
}

impl DriveSaveState {
    pub fn validate(&self) -> Result<(), SaveStateError> {
        if let Some(t) = self.idle_timer_remaining {
            if t >= MAX_IDLE_TIMER_CYCLES {
                return Err(SaveStateError::InvalidIdleTimer(t));
            }
        }
        if self.current_track >= MAX_TRACK {
            return Err(SaveStateError::InvalidTrack(self.current_track));
        }
        if !(0.0..1.0).contains(&self.rotational_fraction)
            || !self.rotational_fraction.is_finite()
        {
            return Err(SaveStateError::InvalidRotationalPosition(
                self.rotational_fraction,
            ));
        }
        Ok(())
    }
}
