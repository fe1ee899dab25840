use std::sync::LazyLock;

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

// Machine cycles/second. This is only correct for NTSC, but it's close
// enough for PAL for disk emulation purposes.
pub const CYCLES_PER_SECOND: f64 = 7_159_090.0 / 4.0;

// Delay from end of ACK byte until the FDC command is issued.
// 810: ~1608 cycles @ 500KHz = ~5756 machine cycles.
pub const CYCLES_FDC_COMMAND_DELAY: u32 = 5756;

// Cycles for a fake rotation as seen by the FDC. Neither the 810 nor the
// 1050 use the real index pulse; they fake it with the RIOT.
pub const CYCLES_PER_FAKE_ROT_810: u32 = ((1_789_772u64 * 522 + 5000) / 10000) as u32;
pub const CYCLES_PER_FAKE_ROT_1050: u32 = ((1_789_772u64 * 236 + 5000) / 10000) as u32;

// Time from end of sector read to start of the Complete byte (FDC reset
// and checksum):
//  810: ~2568 cycles @ 500KHz = 9192 cycles
//  1050: ~270 cycles @ 1MHz = 483 cycles
pub const CYCLES_POST_READ_810: u32 = 9192;
pub const CYCLES_POST_READ_1050: u32 = 483;

// Indus GT high-speed firmware rates, courtesy of the GT ROM disassembly:
// 104 T-states/bit for Synchromesh, 58 T-states/bit for SuperSynchromesh.
const CYCLES_PER_SIO_BIT_INDUSGT_SYNCHROMESH: u32 = 47;
const CYCLES_PER_SIO_BIT_INDUSGT_SUPERSYNCHROMESH: u32 = 26;
const CYCLES_PER_SIO_BYTE_INDUSGT_SYNCHROMESH: u32 = 520;
const CYCLES_PER_SIO_BYTE_INDUSGT_SUPERSYNCHROMESH: u32 = 268;

const fn us_to_cycles_f(us: f64) -> u32 {
    (us * (CYCLES_PER_SECOND / 1_000_000.0) + 0.5) as u32
}

fn us(v: f64) -> u32 {
    us_to_cycles_f(v)
}

fn ms(v: f64) -> u32 {
    us_to_cycles_f(v * 1_000.0)
}

fn sec(v: f64) -> u32 {
    us_to_cycles_f(v * 1_000_000.0)
}

/// Emulated drive model. Each variant selects one column of the
/// hardware-measured timing table below.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub enum DiskEmulationMode {
    Generic,
    Generic57600,
    FastestPossible,
    Drive810,
    Happy810,
    Drive1050,
    UsDoubler,
    Speedy1050,
    Happy1050,
    Turbo1050,
    Xf551,
    IndusGt,
}

pub const MODE_COUNT: usize = 12;

pub const ALL_MODES: [DiskEmulationMode; MODE_COUNT] = [
    DiskEmulationMode::Generic,
    DiskEmulationMode::Generic57600,
    DiskEmulationMode::FastestPossible,
    DiskEmulationMode::Drive810,
    DiskEmulationMode::Happy810,
    DiskEmulationMode::Drive1050,
    DiskEmulationMode::UsDoubler,
    DiskEmulationMode::Speedy1050,
    DiskEmulationMode::Happy1050,
    DiskEmulationMode::Turbo1050,
    DiskEmulationMode::Xf551,
    DiskEmulationMode::IndusGt,
];

/// Immutable timing/capability descriptor for one drive model. All timing
/// fields are machine cycles derived from the per-model measurement column;
/// none are mutated after `finalize()`.
#[derive(Clone, PartialEq, Debug)]
pub struct DriveProfile {
    // capabilities
    pub supports_not_ready: bool,
    pub supports_cmd_high_speed: bool,
    pub supports_cmd_frame_high_speed: bool,
    pub supports_cmd_percom: bool,
    pub supports_cmd_format_skewed: bool,
    pub supports_cmd_format_boot: bool,
    pub supports_cmd_get_high_speed_index: bool,
    pub supports_enhanced_density: bool,
    pub vendor_happy: bool,
    pub vendor_indus: bool,

    // speed parameters
    pub high_speed_index: u8,
    pub high_speed_cmd_frame_rate_lo: u32,
    pub high_speed_cmd_frame_rate_hi: u32,
    pub cycles_per_sio_byte: u32,
    pub cycles_per_sio_bit: u32,
    pub cycles_per_sio_byte_high_speed: u32,
    pub cycles_per_sio_bit_high_speed: u32,
    pub cycles_per_sio_bit_high_speed_f: f32,

    // timing constants (machine cycles)
    pub cycles_to_ack_sent: u32,
    pub cycles_to_fdc_command: u32,
    pub cycles_to_nak_from_frame_end: u32,
    pub cycles_to_nak_from_cmd_deassert: u32,
    pub cycles_per_disk_rotation: u32,
    pub cycles_per_fake_rotation: u32,
    pub cycles_per_track_step: u32,
    pub cycles_for_head_settle: u32,
    pub cycles_post_read_to_complete: u32,
    pub cycles_ce_to_data_frame: u32,
    pub cycles_ce_to_data_frame_pb_div256: u32,
    pub cycles_ce_to_data_frame_high_speed: u32,
    pub cycles_ce_to_data_frame_high_speed_pb_div256: u32,
    pub cycles_ack_stop_bit_to_status_complete: u32,
    pub cycles_ack_stop_bit_to_read_percom_complete: u32,
    pub cycles_to_motor_off: u32,

    // behavior
    pub seek_half_tracks: bool,
    pub retry_mode_1050: bool,
    pub reverse_on_forward_seeks: bool,
    pub wait_for_long_sectors: bool,
    pub write_percom_changes_density: bool,
    pub buffer_track_reads: bool,
    pub buffer_read_errors: bool,
    pub buffer_sector1: bool,
    pub power_on_fdc_status: u8,
}

impl DriveProfile {
    // Column order:
    //   Generic, Generic57600, FastestPossible, 810, Happy810, 1050,
    //   USDoubler, Speedy1050, Happy1050, 1050Turbo, XF551, IndusGT
    fn build(mode: DiskEmulationMode) -> DriveProfile {
        let i = mode as usize;

        macro_rules! col {
            ($($v:expr),* $(,)?) => {{
                let table = [$($v),*];
                table[i]
            }};
        }

        let rpm: u32 = col![288, 288, 288, 288, 288, 288, 288, 288, 288, 288, 300, 288];
        let bit_hs_us: f64 = col![25.2, 17.4, 7.8, 0.0, 19.0, 0.0, 19.0, 18.0, 19.0, 14.0, 25.2, 26.0];
        let bit_hs_f = (bit_hs_us * (CYCLES_PER_SECOND / 1_000_000.0)) as f32;

        let mut p = DriveProfile {
            supports_not_ready: col![true, true, true, false, false, true, true, true, true, true, false, true],
            supports_cmd_high_speed: col![true, true, true, false, false, false, false, false, false, false, true, true],
            supports_cmd_frame_high_speed: col![false, true, true, false, false, false, true, true, true, false, false, false],
            supports_cmd_percom: col![true, true, true, false, false, false, true, true, true, true, true, true],
            supports_cmd_format_skewed: col![true, true, true, false, false, false, true, false, false, false, false, false],
            supports_cmd_format_boot: false,
            supports_cmd_get_high_speed_index: col![false, true, true, false, false, false, true, true, true, false, false, false],
            supports_enhanced_density: col![true, true, true, false, false, true, true, true, true, true, true, true],
            vendor_happy: col![false, false, false, false, true, false, false, false, true, false, false, false],
            vendor_indus: col![false, false, false, false, false, false, false, false, false, false, false, true],

            high_speed_index: col![16, 8, 0, 0, 0, 0, 10, 9, 10, 6, 16, 0],
            high_speed_cmd_frame_rate_lo: 0,
            high_speed_cmd_frame_rate_hi: 0,
            cycles_per_sio_byte: us(col![530.0, 530.0, 530.0, 530.0, 540.0, 549.0, 534.0, 525.0, 540.0, 520.0, 522.0, 559.3]),
            cycles_per_sio_bit: us(col![52.0, 52.0, 52.0, 52.0, 53.0, 51.0, 53.0, 52.0, 53.0, 52.0, 52.2, 52.3]),
            cycles_per_sio_byte_high_speed: us(col![252.0, 173.6, 78.2, 0.0, 220.0, 0.0, 220.0, 214.0, 220.0, 151.0, 252.0, 290.8]),
            cycles_per_sio_bit_high_speed: (0.5 + bit_hs_f) as u32,
            cycles_per_sio_bit_high_speed_f: bit_hs_f,

            // Delay from command line deasserting to end of ACK byte.
            // 810: ~294 cycles @ 500KHz = ~1053 cycles.
            cycles_to_ack_sent: us(col![588.0, 588.0, 588.0, 588.0, 588.0, 279.0, 279.0, 279.0, 279.0, 279.0, 279.0, 279.0]),
            cycles_to_fdc_command: 0,

            // Delay from the command frame / command line to the leading
            // edge of the NAK byte; the firmware honors whichever deadline
            // lands later.
            cycles_to_nak_from_frame_end: us(col![700.0, 700.0, 700.0, 700.0, 700.0, 237.0, 237.0, 237.0, 237.0, 237.0, 237.0, 237.0]),
            cycles_to_nak_from_cmd_deassert: us(col![120.0, 120.0, 120.0, 120.0, 120.0, 184.0, 184.0, 184.0, 184.0, 184.0, 184.0, 184.0]),

            cycles_per_disk_rotation: us_to_cycles_f(60.0 / rpm as f64 * 1_000_000.0),
            cycles_per_fake_rotation: col![
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_810,
                CYCLES_PER_FAKE_ROT_810,
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_1050,
                CYCLES_PER_FAKE_ROT_1050
            ],

            // 810: 5.3ms step rate. 1050: 20.12ms (two half steps at
            // ~18012 cycles). Indus GT: 20ms. XF551: 6ms.
            cycles_per_track_step: ms(col![5.3, 5.3, 3.0, 5.3, 5.3, 20.12, 20.12, 8.0, 20.12, 20.12, 6.0, 20.0]),
            cycles_for_head_settle: ms(col![10.0, 10.0, 10.0, 10.0, 10.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0]),
            cycles_post_read_to_complete: col![
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_810,
                CYCLES_POST_READ_810,
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_1050,
                CYCLES_POST_READ_1050
            ],

            // The US Doubler needs 74 cycles @ 1MHz between the end of the
            // Complete byte and the start of the data frame at high speed;
            // the 1050 Turbo V3.5 firmware needs 409 cycles @ 1MHz. The
            // XF551 and Synchromesh have no such delay.
            cycles_ce_to_data_frame: 0,
            cycles_ce_to_data_frame_pb_div256: 0,
            cycles_ce_to_data_frame_high_speed: us(col![0.0, 73.8, 73.8, 0.0, 73.8, 0.0, 73.8, 73.8, 73.8, 409.0, 0.0, 0.0]),
            cycles_ce_to_data_frame_high_speed_pb_div256: 0,

            // For the baseline, use the 1050's status value and the US
            // Doubler's read-PERCOM value.
            cycles_ack_stop_bit_to_status_complete: us(col![410.0, 410.0, 410.0, 410.0, 410.0, 290.0, 250.0, 440.0, 510.0, 790.0, 1110.0, 650.0]),
            cycles_ack_stop_bit_to_read_percom_complete: us(col![440.0, 440.0, 440.0, 440.0, 440.0, 440.0, 440.0, 400.0, 620.0, 890.0, 1160.0, 630.0]),

            // Time for the motor to shut off while idling in the main loop.
            // 810: guesstimate of ~3 seconds. 1050: 6.8M cycles @ 1MHz.
            cycles_to_motor_off: sec(col![3.06, 3.06, 3.06, 3.06, 3.06, 6.8, 6.8, 6.8, 6.8, 6.8, 6.8, 6.8]),

            seek_half_tracks: col![false, false, false, false, false, true, true, true, true, true, false, true],
            retry_mode_1050: col![false, false, false, false, false, true, true, true, true, true, true, true],
            reverse_on_forward_seeks: col![false, false, false, false, false, true, true, true, true, true, true, false],
            wait_for_long_sectors: col![false, false, false, false, false, true, true, true, true, true, true, true],
            write_percom_changes_density: col![false, false, false, false, false, false, false, false, false, false, true, false],
            buffer_track_reads: col![false, false, false, false, true, false, false, true, true, true, false, false],
            buffer_read_errors: col![false, false, false, false, true, false, false, false, true, false, false, false],
            buffer_sector1: col![false, false, false, false, false, false, false, true, false, true, false, false],
            power_on_fdc_status: 0xFF,
        };

        p.finalize();
        p
    }

    fn finalize(&mut self) {
        self.cycles_to_fdc_command = self.cycles_to_ack_sent + CYCLES_FDC_COMMAND_DELAY;

        self.high_speed_cmd_frame_rate_lo = 0;
        self.high_speed_cmd_frame_rate_hi = 0;

        if self.supports_cmd_frame_high_speed {
            // Permitted rate divisors are within +/-5% of the actual bit
            // transmission rate. Beyond that, POKEY skews more than one half
            // bit from the start to stop bit and won't receive reliably.
            let min_divisor = (self.cycles_per_sio_bit_high_speed_f * 0.95).ceil() as u32;
            let max_divisor = (self.cycles_per_sio_bit_high_speed_f * 1.05).floor() as u32;

            self.high_speed_cmd_frame_rate_lo = min_divisor;
            self.high_speed_cmd_frame_rate_hi = max_divisor;

            let nominal = self.high_speed_index as u32 * 2 + 14;
            debug_assert!(
                nominal >= self.high_speed_cmd_frame_rate_lo
                    && nominal <= self.high_speed_cmd_frame_rate_hi
            );
        }
    }
}

static PROFILES: LazyLock<[DriveProfile; MODE_COUNT]> =
    LazyLock::new(|| ALL_MODES.map(DriveProfile::build));

/// Look up the immutable profile for an emulation mode. Never fails; the
/// table is built once on first use.
pub fn get_profile(mode: DiskEmulationMode) -> &'static DriveProfile {
    &PROFILES[mode as usize]
}

static INDUSGT_SYNCHROMESH: LazyLock<DriveProfile> = LazyLock::new(|| {
    let mut p = DriveProfile::build(DiskEmulationMode::IndusGt);
    p.supports_cmd_format_boot = true;
    p.high_speed_index = 10;
    p.cycles_per_sio_byte_high_speed = CYCLES_PER_SIO_BYTE_INDUSGT_SYNCHROMESH;
    p.cycles_per_sio_bit_high_speed = CYCLES_PER_SIO_BIT_INDUSGT_SYNCHROMESH;
    p.cycles_per_sio_bit_high_speed_f = CYCLES_PER_SIO_BIT_INDUSGT_SYNCHROMESH as f32;
    p.finalize();
    p
});

static INDUSGT_SUPERSYNCHROMESH: LazyLock<DriveProfile> = LazyLock::new(|| {
    let mut p = DriveProfile::build(DiskEmulationMode::IndusGt);
    p.supports_cmd_format_boot = true;
    p.high_speed_index = 6;
    p.cycles_per_sio_byte_high_speed = CYCLES_PER_SIO_BYTE_INDUSGT_SUPERSYNCHROMESH;
    p.cycles_per_sio_bit_high_speed = CYCLES_PER_SIO_BIT_INDUSGT_SUPERSYNCHROMESH;
    p.cycles_per_sio_bit_high_speed_f = CYCLES_PER_SIO_BIT_INDUSGT_SUPERSYNCHROMESH as f32;
    // SuperSynchromesh spends 5500/9724 T-cycles @ 4MHz computing checksums
    // between C/E and the data frame.
    p.cycles_ce_to_data_frame_high_speed = 571;
    p.cycles_ce_to_data_frame_high_speed_pb_div256 = 3780;
    p.finalize();
    p
});

/// Synchromesh firmware variant, selected after an Indus GT firmware upload
/// is recognized.
pub fn indus_gt_synchromesh_profile() -> &'static DriveProfile {
    &INDUSGT_SYNCHROMESH
}

/// SuperSynchromesh firmware variant.
pub fn indus_gt_super_synchromesh_profile() -> &'static DriveProfile {
    &INDUSGT_SUPERSYNCHROMESH
}
