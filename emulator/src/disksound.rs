#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

// Mechanical cue burst cap; a full-stroke recalibrate on an 80-track
// mechanism is the longest real sequence.
const MAX_STEP_CUES: u32 = 160;

/// Mechanical sound events emitted by the drive. Sample playback belongs to
/// the external audio mixer; the core only decides what happens and when.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub enum DriveSoundCue {
    MotorStart,
    MotorStop,
    Step,
}

/// Audio mixer collaborator: queue a cue to play `delay_cycles` from now.
pub trait AudioMixer {
    fn queue_cue(&mut self, cue: DriveSoundCue, delay_cycles: u32);
}

/// Mixer stub for configurations without audio.
pub struct NullMixer;

impl AudioMixer for NullMixer {
    fn queue_cue(&mut self, _cue: DriveSoundCue, _delay_cycles: u32) {}
}

/// Per-unit drive sound state: an enable flag plus the step/motor cue
/// emission rules.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct DriveSounds {
    enabled: bool,
}

impl DriveSounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, flag: bool) {
        self.enabled = flag;
    }

    pub fn motor_changed(&self, mixer: &mut dyn AudioMixer, running: bool) {
        if !self.enabled {
            return;
        }
        mixer.queue_cue(
            if running {
                DriveSoundCue::MotorStart
            } else {
                DriveSoundCue::MotorStop
            },
            0,
        );
    }

    /// One step click per track moved, spaced by the mechanism's step time.
    pub fn step_burst(
        &self,
        mixer: &mut dyn AudioMixer,
        steps: u32,
        cycles_per_step: u32,
        start_delay: u32,
    ) {
        if !self.enabled {
            return;
        }
        for i in 0..steps.min(MAX_STEP_CUES) {
            mixer.queue_cue(DriveSoundCue::Step, start_delay + i * cycles_per_step);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct CueLog {
        cues: Vec<(DriveSoundCue, u32)>,
    }

    impl AudioMixer for CueLog {
        fn queue_cue(&mut self, cue: DriveSoundCue, delay_cycles: u32) {
            self.cues.push((cue, delay_cycles));
        }
    }

    #[test]
    fn step_burst_spaces_cues_by_step_time() {
        let mut sounds = DriveSounds::new();
        sounds.set_enabled(true);
        let mut mixer = CueLog::default();

        sounds.step_burst(&mut mixer, 3, 9486, 100);
        assert_eq!(mixer.cues.len(), 3);
        assert_eq!(mixer.cues[0], (DriveSoundCue::Step, 100));
        assert_eq!(mixer.cues[1], (DriveSoundCue::Step, 100 + 9486));
        assert_eq!(mixer.cues[2], (DriveSoundCue::Step, 100 + 2 * 9486));
    }

    #[test]
    fn disabled_sounds_emit_nothing() {
        let sounds = DriveSounds::new();
        let mut mixer = CueLog::default();
        sounds.step_burst(&mut mixer, 5, 1000, 0);
        sounds.motor_changed(&mut mixer, true);
        assert!(mixer.cues.is_empty());
    }

    #[test]
    fn motor_cues_follow_state() {
        let mut sounds = DriveSounds::new();
        sounds.set_enabled(true);
        let mut mixer = CueLog::default();
        sounds.motor_changed(&mut mixer, true);
        sounds.motor_changed(&mut mixer, false);
        assert_eq!(mixer.cues[0].0, DriveSoundCue::MotorStart);
        assert_eq!(mixer.cues[1].0, DriveSoundCue::MotorStop);
    }
}
