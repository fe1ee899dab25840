use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::disksound::{AudioMixer, DriveSounds};
use crate::image::{DiskGeometry, DiskInterface};
use crate::percom::{PERCOM_BLOCK_LEN, PercomBlock};
use crate::profile::{
    self, CYCLES_PER_SECOND, DiskEmulationMode, DriveProfile, get_profile,
};
use crate::rotation::RotationalModel;
use crate::savestate::{ActiveCommandState, DriveSaveState, SaveStateError};
use crate::scheduler::{EventHandle, Scheduler};
use crate::sector::{SectorSelection, WeakBitLfsr, select_physical};
use crate::sio::{CmdResponse, CommandFrame, SioTransport};

// SIO command bytes (normalized, high-speed bit stripped).
const CMD_STATUS: u8 = 0x53;
const CMD_READ: u8 = 0x52;
const CMD_PUT: u8 = 0x50;
const CMD_WRITE: u8 = 0x57;
const CMD_FORMAT: u8 = 0x21;
const CMD_FORMAT_MEDIUM: u8 = 0x22;
const CMD_FORMAT_SKEWED: u8 = 0x66;
const CMD_FORMAT_BOOT: u8 = 0x67;
const CMD_READ_PERCOM: u8 = 0x4E;
const CMD_WRITE_PERCOM: u8 = 0x4F;
const CMD_GET_HIGH_SPEED_INDEX: u8 = 0x3F;
const CMD_HAPPY_RAM_TEST: u8 = 0x48;
const CMD_HAPPY_HEAD_TEST: u8 = 0x49;
const CMD_HAPPY_RPM_TEST: u8 = 0x4A;
const CMD_HAPPY_QUIET: u8 = 0x51;
const CMD_INDUS_EXECUTE: u8 = 0x58;

/// Scheduler token for the idle motor-off timer.
pub const EVENT_MOTOR_OFF: u32 = 1;

// Rotational/mechanical delay actually forwarded to the scheduler when
// accurate sector timing is off; the rest is warped.
const CYCLES_ROTATIONAL_DELAY_FAST: u32 = 2000;
const CYCLES_MECH_DELAY_FAST: u32 = 1000;

// Post-read delay when the sector came out of the drive's track buffer.
const CYCLES_POST_READ_BUFFERED: u32 = 1000;

// Motor spin-up charged when a seek starts from a stopped spindle. No
// hardware measurement exists for this; two revolutions approximates the
// spin-up ramp.
const SPINUP_ROTATIONS: u32 = 2;

// Raw track capacity in sector-data bytes per revolution, used to scale a
// sector's pass-under-the-head time.
const TRACK_BYTE_CAPACITY_FM: u32 = 3255;
const TRACK_BYTE_CAPACITY_MFM: u32 = 6510;

// Happy drives map an 8K RAM buffer over sector numbers >= 0x8000.
const HAPPY_RAM_SIZE: usize = 8192;
const HAPPY_RAM_WINDOW: u16 = 0x8000;
const HAPPY_RAM_PAGE: usize = 128;

// Highest sector a drive will hunt for on an empty spindle; the boot range
// of the largest supported layout.
const MAX_NO_DISK_SECTOR: u16 = 720;

bitflags! {
    /// Inverted FDC status register: a cleared bit is an active condition,
    /// 0xFF is fully clean.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FdcStatus: u8 {
        const NOT_READY = 0x80;
        const WRITE_PROTECT = 0x40;
        const RECORD_TYPE = 0x20;
        const RECORD_NOT_FOUND = 0x10;
        const CRC_ERROR = 0x08;
        const LOST_DATA = 0x04;
        const DATA_REQUEST = 0x02;
        const BUSY = 0x01;
    }
}

/// Collaborators handed into every drive entry point. The drive never owns
/// its scheduler, transport, image layer or mixer; they are threaded through
/// each call.
pub struct DriveContext<'a> {
    pub scheduler: &'a mut Scheduler,
    pub sio: &'a mut dyn SioTransport,
    pub disk: &'a mut dyn DiskInterface,
    pub mixer: &'a mut dyn AudioMixer,
}

/// Command-source contract the drive presents to the SIO manager.
pub trait SioDevice {
    fn on_serial_begin_command(
        &mut self,
        ctx: &mut DriveContext<'_>,
        frame: &CommandFrame,
    ) -> CmdResponse;
    fn on_serial_abort_command(&mut self, ctx: &mut DriveContext<'_>);
    fn on_serial_receive_complete(
        &mut self,
        ctx: &mut DriveContext<'_>,
        id: u32,
        data: &[u8],
        checksum_ok: bool,
    );
    fn on_serial_fence(&mut self, ctx: &mut DriveContext<'_>, id: u32);
    fn on_scheduled_event(&mut self, ctx: &mut DriveContext<'_>, token: u32);
}

/// Accelerated (burst) command request: the host OS hook bypasses bus
/// timing and expects an SIO completion code back immediately.
pub enum AccelRequest<'a> {
    Status { out: &'a mut [u8; 4] },
    Read { sector: u16, out: &'a mut [u8] },
    Write { sector: u16, data: &'a [u8] },
}

// SIO completion codes returned by the accelerated path.
pub const SIO_SUCCESS: u8 = 0x01;
pub const SIO_TIMEOUT: u8 = 0x8A;
pub const SIO_DEVICE_NAK: u8 = 0x8B;
pub const SIO_CHECKSUM_ERROR: u8 = 0x8F;
pub const SIO_DEVICE_ERROR: u8 = 0x90;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RwSub {
    /// ACK on the wire, fence pending.
    Ack,
    /// Write: data frame incoming.
    Receive,
    /// Write: data-frame ACK on the wire.
    DataAck,
    /// Mechanical seek issued; rotational search runs on the fence.
    Search,
    /// Rotational wait + media transfer charged; outcome next.
    PostRead,
    /// C/E (+ payload) on the wire; command ends on the fence.
    Respond,
}

#[derive(Clone, Debug)]
struct RwCommand {
    sub: RwSub,
    sector: u16,
    attempt: u8,
    high_speed: bool,
    write_verify: bool,
    ram_window: bool,
    no_disk: bool,
    buffered: bool,
    selected: Option<u32>,
    fdc_status: u8,
    data: Vec<u8>,
}

impl RwCommand {
    fn new(sector: u16, high_speed: bool) -> Self {
        RwCommand {
            sub: RwSub::Ack,
            sector,
            attempt: 0,
            high_speed,
            write_verify: false,
            ram_window: false,
            no_disk: false,
            buffered: false,
            selected: None,
            fdc_status: FdcStatus::all().bits(),
            data: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SimpleSub {
    Ack,
    Respond,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum VendorSub {
    Ack,
    Receive,
    DataAck,
    Respond,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FormatKind {
    Standard,
    Medium,
    Skewed,
    Boot,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FormatSub {
    Ack,
    Receive,
    DataAck,
    Track,
    Respond,
}

#[derive(Clone, Debug)]
struct FormatCommand {
    kind: FormatKind,
    sub: FormatSub,
    high_speed: bool,
    track: u16,
    track_limit: u16,
    ok: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum HappyDiagKind {
    RamTest,
    HeadPosTest,
    RpmTest,
    Quiet,
}

#[derive(Clone, Debug)]
enum ActiveCommand {
    None,
    Status {
        sub: SimpleSub,
        high_speed: bool,
    },
    Read(RwCommand),
    Write(RwCommand),
    Format(FormatCommand),
    ReadPercom {
        sub: SimpleSub,
        high_speed: bool,
    },
    WritePercom {
        sub: VendorSub,
        high_speed: bool,
        accepted: bool,
    },
    GetHighSpeedIndex {
        sub: SimpleSub,
    },
    HappyDiag {
        kind: HappyDiagKind,
        sub: SimpleSub,
        aux: u16,
    },
    IndusExecute {
        sub: VendorSub,
    },
}

impl ActiveCommand {
    fn is_none(&self) -> bool {
        matches!(self, ActiveCommand::None)
    }
}

/// One emulated disk drive unit: profile pointer, mechanical and rotational
/// state, the in-flight command, and the lifecycle/control surface.
#[cfg_attr(feature = "serde_support", derive(educe::Educe))]
#[cfg_attr(feature = "serde_support", educe(Debug))]
pub struct DriveEmulator {
    unit: u8,
    enabled: bool,
    mode: DiskEmulationMode,
    profile: &'static DriveProfile,

    rotation: RotationalModel,
    current_track: u32,

    // geometry cache, re-derived from the disk interface
    attached: bool,
    sector_size: u16,
    boot_sector_count: u8,
    total_sector_count: u16,
    sectors_per_track: u32,
    track_count: u32,
    side_count: u8,
    mfm: bool,
    high_density: bool,

    percom: PercomBlock,
    fdc_status: u8,
    last_op_error: bool,

    active: ActiveCommand,
    waiting: bool,
    expected_fence: u32,
    expected_receive: Option<u32>,
    fence_seq: u32,
    receive_seq: u32,
    pending_receive: Option<(Vec<u8>, bool)>,
    command_start: u64,
    motor_started_this_command: bool,
    stat_last_attempts: u8,

    motor_off_event: Option<EventHandle>,
    motor_suspended: Option<u64>,

    // runtime toggles mirrored from the disk interface
    write_enabled: bool,
    format_enabled: bool,
    accurate_timing: bool,
    buffering_enabled: bool,

    sounds: DriveSounds,

    #[cfg_attr(feature = "serde_support", educe(Debug(ignore)))]
    phantom_counters: Vec<u8>,
    #[cfg_attr(feature = "serde_support", educe(Debug(ignore)))]
    forced_phantom: Vec<Option<u8>>,
    weak_lfsr: WeakBitLfsr,

    buffered_track: i32,
    last_read_sector: u16,

    #[cfg_attr(feature = "serde_support", educe(Debug(ignore)))]
    happy_ram: Vec<u8>,

    rng: fastrand::Rng,
}

impl DriveEmulator {
    pub fn new(unit: u8) -> Self {
        let mode = DiskEmulationMode::Generic;
        let prof = get_profile(mode);
        DriveEmulator {
            unit,
            enabled: true,
            mode,
            profile: prof,
            rotation: RotationalModel::new(prof.cycles_per_disk_rotation),
            current_track: 0,
            attached: false,
            sector_size: 128,
            boot_sector_count: 3,
            total_sector_count: 0,
            sectors_per_track: 18,
            track_count: 40,
            side_count: 1,
            mfm: false,
            high_density: false,
            percom: PercomBlock::single_density(),
            fdc_status: prof.power_on_fdc_status,
            last_op_error: false,
            active: ActiveCommand::None,
            waiting: false,
            expected_fence: 0,
            expected_receive: None,
            fence_seq: 1,
            receive_seq: 1,
            pending_receive: None,
            command_start: 0,
            motor_started_this_command: false,
            stat_last_attempts: 0,
            motor_off_event: None,
            motor_suspended: None,
            write_enabled: false,
            format_enabled: false,
            accurate_timing: true,
            buffering_enabled: true,
            sounds: DriveSounds::new(),
            phantom_counters: Vec::new(),
            forced_phantom: Vec::new(),
            weak_lfsr: WeakBitLfsr::new(0x5EED_1DEA),
            buffered_track: -1,
            last_read_sector: 0,
            happy_ram: vec![0; HAPPY_RAM_SIZE],
            rng: fastrand::Rng::with_seed(0x0529_1977 ^ unit as u64),
        }
    }

    /// Wire up collaborators and bring the unit to power-on state.
    pub fn init(&mut self, ctx: &mut DriveContext<'_>) {
        self.reset(ctx);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_randomization_seed(&mut self, seed: u64) {
        self.rng = fastrand::Rng::with_seed(seed ^ self.unit as u64);
    }

    pub fn set_buffering_enabled(&mut self, on: bool) {
        self.buffering_enabled = on;
        if !on {
            self.buffered_track = -1;
        }
    }

    pub fn emulation_mode(&self) -> DiskEmulationMode {
        self.mode
    }

    pub fn profile(&self) -> &'static DriveProfile {
        self.profile
    }

    /// Swap the active profile. Density/profile lookups change immediately;
    /// mechanical state changes land on the next reset or command.
    pub fn set_emulation_mode(&mut self, mode: DiskEmulationMode) {
        self.mode = mode;
        self.profile = get_profile(mode);
        self.rotation
            .set_cycles_per_rotation(self.profile.cycles_per_disk_rotation);
        debug!("disk {}: emulation mode {:?}", self.unit + 1, mode);
    }

    pub fn fdc_status(&self) -> u8 {
        self.fdc_status
    }

    pub fn last_op_error(&self) -> bool {
        self.last_op_error
    }

    pub fn current_track(&self) -> u32 {
        self.current_track
    }

    pub fn percom(&self) -> &PercomBlock {
        &self.percom
    }

    pub fn rotation(&self) -> &RotationalModel {
        &self.rotation
    }

    pub fn is_command_active(&self) -> bool {
        !self.active.is_none()
    }

    /// Sector-search attempts spent by the most recent read/write.
    pub fn last_attempt_count(&self) -> u8 {
        self.stat_last_attempts
    }

    pub fn is_motor_running(&self) -> bool {
        self.motor_off_event.is_some() || self.motor_suspended.is_some()
    }

    /// Test/debug hook: force which physical copy answers a logical sector.
    pub fn set_forced_phantom(&mut self, sector: u16, copy: Option<u8>) {
        let idx = (sector - 1) as usize;
        if idx < self.forced_phantom.len() {
            self.forced_phantom[idx] = copy;
        }
    }

    pub fn reset(&mut self, ctx: &mut DriveContext<'_>) {
        if !self.active.is_none() {
            ctx.sio.flush_queue();
        }
        self.active = ActiveCommand::None;
        self.waiting = false;
        self.expected_receive = None;
        self.pending_receive = None;

        ctx.scheduler.unschedule_opt(&mut self.motor_off_event);
        self.motor_suspended = None;
        ctx.disk.set_motor_indicator(false);
        ctx.disk.set_activity(false);

        // Cold-boot rotational phase is random but reproducible for a given
        // randomization seed.
        let period = self.rotation.cycles_per_rotation();
        self.rotation.set_counter(self.rng.u32(0..period));
        self.rotation.resync(ctx.scheduler.now());

        self.fdc_status = self.profile.power_on_fdc_status;
        self.last_op_error = false;
        self.buffered_track = -1;
        self.last_read_sector = 0;
        self.stat_last_attempts = 0;

        self.refresh_from_disk(ctx.disk);

        // 810-style mechanisms park at end of travel on power-up; the
        // half-track steppers home to track 0.
        self.current_track = if self.profile.retry_mode_1050 {
            0
        } else {
            self.track_count.saturating_sub(1)
        };

        for c in &mut self.phantom_counters {
            *c = 0;
        }
        for f in &mut self.forced_phantom {
            *f = None;
        }
        debug!("disk {}: reset ({:?})", self.unit + 1, self.mode);
    }

    pub fn on_disk_changed(&mut self, disk: &mut dyn DiskInterface) {
        self.refresh_from_disk(disk);
        self.buffered_track = -1;

        // A sector selected against the previous disk must not survive the
        // swap: the read/write completes as a miss instead.
        match &mut self.active {
            ActiveCommand::Read(rw) | ActiveCommand::Write(rw) => {
                rw.selected = None;
            }
            _ => {}
        }
    }

    pub fn on_write_mode_changed(&mut self, disk: &mut dyn DiskInterface) {
        self.write_enabled = disk.is_write_enabled();
        self.format_enabled = disk.is_format_enabled();
    }

    pub fn on_timing_mode_changed(&mut self, disk: &mut dyn DiskInterface) {
        self.accurate_timing = disk.is_accurate_timing_enabled();
    }

    pub fn on_audio_mode_changed(&mut self, disk: &mut dyn DiskInterface) {
        self.sounds.set_enabled(disk.are_drive_sounds_enabled());
    }

    pub fn is_image_supported(&self, geometry: &DiskGeometry) -> bool {
        matches!(geometry.sector_size, 128 | 256 | 512 | 8192)
            && geometry.side_count >= 1
            && geometry.side_count <= 2
    }

    fn refresh_from_disk(&mut self, disk: &mut dyn DiskInterface) {
        self.attached = disk.image_attached();
        if self.attached {
            let g = disk.geometry();
            self.sector_size = g.sector_size;
            self.boot_sector_count = g.boot_sector_count;
            self.total_sector_count = g.total_sector_count;
            self.sectors_per_track = g.sectors_per_track.max(1) as u32;
            self.track_count = g.track_count.max(1) as u32;
            self.side_count = g.side_count;
            self.mfm = g.mfm;
            self.high_density = g.high_density;
            self.percom = g.to_percom();
        } else {
            self.sector_size = 128;
            self.boot_sector_count = 3;
            self.total_sector_count = 0;
            self.sectors_per_track = 18;
            self.track_count = 40;
            self.side_count = 1;
            self.mfm = false;
            self.high_density = false;
            self.percom = PercomBlock::single_density();
        }
        let n = self.total_sector_count as usize;
        self.phantom_counters = vec![0; n];
        self.forced_phantom = vec![None; n];

        self.write_enabled = disk.is_write_enabled();
        self.format_enabled = disk.is_format_enabled();
        self.accurate_timing = disk.is_accurate_timing_enabled();
        self.sounds.set_enabled(disk.are_drive_sounds_enabled());
    }

    // ---- PERCOM -----------------------------------------------------------

    /// Apply a received PERCOM block. Returns false (mutating nothing) when
    /// the geometry is rejected; the XF551 path never rejects, it
    /// normalizes onto a supported geometry instead.
    pub fn set_percom_data(&mut self, data: &[u8]) -> bool {
        let Some(decoded) = PercomBlock::decode(data) else {
            return false;
        };
        let block = if self.mode == DiskEmulationMode::Xf551 {
            decoded.normalize_xf551()
        } else {
            decoded
        };
        if !block.validate() {
            return false;
        }
        self.percom = block;
        if self.profile.write_percom_changes_density {
            self.mfm = block.mfm;
            self.sectors_per_track = block.sectors_per_track.max(1) as u32;
            self.high_density = block.sectors_per_track >= 26;
            self.sector_size = block.bytes_per_sector;
        }
        true
    }

    // ---- motor ------------------------------------------------------------

    fn turn_on_motor(&mut self, ctx: &mut DriveContext<'_>) -> bool {
        let was_off = !self.is_motor_running();
        if was_off {
            self.rotation.resync(ctx.scheduler.now());
            self.sounds.motor_changed(ctx.mixer, true);
            ctx.disk.set_motor_indicator(true);
            trace!("disk {}: motor on", self.unit + 1);
        }
        was_off
    }

    fn suspend_motor_timer(&mut self, ctx: &mut DriveContext<'_>) {
        let remaining = match self.motor_off_event.take() {
            Some(h) => {
                let r = ctx
                    .scheduler
                    .ticks_to_event(h)
                    .unwrap_or(self.profile.cycles_to_motor_off as u64);
                ctx.scheduler.unschedule(h);
                r
            }
            None => self.profile.cycles_to_motor_off as u64,
        };
        self.motor_suspended = Some(remaining);
    }

    fn arm_motor_timer(&mut self, ctx: &mut DriveContext<'_>, delay: u64) {
        ctx.scheduler.unschedule_opt(&mut self.motor_off_event);
        self.motor_suspended = None;
        self.motor_off_event = Some(ctx.scheduler.schedule(delay, EVENT_MOTOR_OFF));
    }

    fn handle_motor_off(&mut self, ctx: &mut DriveContext<'_>) {
        self.motor_off_event = None;

        // The idle timer cannot be serviced while a command is busy; if one
        // slipped through, park it as suspended until the command ends.
        if !self.active.is_none() {
            self.motor_suspended = Some(0);
            return;
        }
        self.rotation.advance_to(ctx.scheduler.now(), true);
        self.sounds.motor_changed(ctx.mixer, false);
        ctx.disk.set_motor_indicator(false);
        trace!("disk {}: motor off", self.unit + 1);
    }

    pub fn extend_motor_timeout_by(&mut self, ctx: &mut DriveContext<'_>, cycles: u64) {
        if let Some(h) = self.motor_off_event.take() {
            let remaining = ctx.scheduler.ticks_to_event(h).unwrap_or(0);
            ctx.scheduler.unschedule(h);
            self.motor_off_event =
                Some(ctx.scheduler.schedule(remaining + cycles, EVENT_MOTOR_OFF));
        }
    }

    // ---- transfer helpers -------------------------------------------------

    fn setup_transfer_speed(&mut self, ctx: &mut DriveContext<'_>, high_speed: bool) {
        let p = self.profile;
        let (bit, byte) = if high_speed {
            (
                p.cycles_per_sio_bit_high_speed.max(1),
                p.cycles_per_sio_byte_high_speed.max(1),
            )
        } else {
            (p.cycles_per_sio_bit, p.cycles_per_sio_byte)
        };
        ctx.sio.set_transfer_rate(bit, byte);
    }

    fn byte_cycles(&self, high_speed: bool) -> u32 {
        let p = self.profile;
        if high_speed {
            p.cycles_per_sio_byte_high_speed.max(1)
        } else {
            p.cycles_per_sio_byte
        }
    }

    fn begin_ack(&mut self, ctx: &mut DriveContext<'_>, high_speed: bool) {
        self.setup_transfer_speed(ctx, high_speed);
        let delay = self
            .profile
            .cycles_to_ack_sent
            .saturating_sub(self.byte_cycles(high_speed))
            .max(1);
        ctx.sio.delay(delay);
        ctx.sio.send_ack();
    }

    /// Firmware NAKs only after both the byte-level frame has finished and
    /// the command line has been released, whichever lands later.
    fn begin_transfer_nak_command(&mut self, ctx: &mut DriveContext<'_>) {
        let p = self.profile;
        let now = ctx.scheduler.now();
        let frame_deadline =
            ctx.sio.command_frame_end_time() + p.cycles_to_nak_from_frame_end as u64;
        let cmd_deadline =
            ctx.sio.command_deassert_time() + p.cycles_to_nak_from_cmd_deassert as u64;
        let deadline = frame_deadline.max(cmd_deadline);
        let delay = deadline.saturating_sub(now).max(1).min(u32::MAX as u64) as u32;

        self.setup_transfer_speed(ctx, false);
        ctx.sio.delay(delay);
        ctx.sio.send_nak();
    }

    /// Emit Complete/Error, the profile's C/E-to-data-frame gap, and the
    /// payload (with checksum) when there is one.
    fn send_result(
        &mut self,
        ctx: &mut DriveContext<'_>,
        success: bool,
        data: &[u8],
        high_speed: bool,
    ) {
        self.setup_transfer_speed(ctx, high_speed);
        if success {
            ctx.sio.send_complete();
        } else {
            ctx.sio.send_error();
        }
        if !data.is_empty() {
            let p = self.profile;
            let len = data.len() as u32;
            let gap = if high_speed {
                p.cycles_ce_to_data_frame_high_speed
                    + p.cycles_ce_to_data_frame_high_speed_pb_div256 * len / 256
            } else {
                p.cycles_ce_to_data_frame + p.cycles_ce_to_data_frame_pb_div256 * len / 256
            };
            if gap > 0 {
                ctx.sio.delay(gap);
            }
            ctx.sio.send_data(data, true);
        }
    }

    fn warp_or_delay(&mut self, ctx: &mut DriveContext<'_>, cycles: u32, min_cycles: u32) {
        if self.accurate_timing {
            if cycles > 0 {
                ctx.sio.delay(cycles);
            }
        } else {
            let forwarded = min_cycles.min(cycles);
            self.rotation.warp((cycles - forwarded) as u64);
            if forwarded > 0 {
                ctx.sio.delay(forwarded);
            }
        }
    }

    /// A delay specified from the start of the stop bit: firmware starts
    /// post-processing there, one bit time before the byte fully clears.
    fn warp_or_delay_from_stop_bit(
        &mut self,
        ctx: &mut DriveContext<'_>,
        cycles: u32,
        min_cycles: u32,
    ) {
        let adjusted = cycles.saturating_sub(ctx.sio.transfer_rate_bit()).max(1);
        self.warp_or_delay(ctx, adjusted, min_cycles);
    }

    fn delay_from_stop_bit(&mut self, ctx: &mut DriveContext<'_>, cycles: u32) {
        let adjusted = cycles.saturating_sub(ctx.sio.transfer_rate_bit()).max(1);
        ctx.sio.delay(adjusted);
    }

    fn next_fence(&mut self) -> u32 {
        let id = self.fence_seq;
        self.fence_seq += 1;
        id
    }

    fn wait(&mut self, ctx: &mut DriveContext<'_>) {
        let id = self.next_fence();
        self.expected_fence = id;
        self.waiting = true;
        ctx.sio.insert_fence(id);
    }

    fn request_receive(&mut self, ctx: &mut DriveContext<'_>, len: usize) {
        let id = self.receive_seq;
        self.receive_seq += 1;
        self.expected_receive = Some(id);
        self.waiting = true;
        ctx.sio.receive_data(id, len, true);
    }

    fn finish_command(&mut self, ctx: &mut DriveContext<'_>) {
        self.active = ActiveCommand::None;
        self.waiting = false;
        self.expected_receive = None;
        ctx.sio.end_command();
        ctx.disk.set_activity(false);
        self.arm_motor_timer(ctx, self.profile.cycles_to_motor_off as u64);
    }

    fn begin_command(&mut self, ctx: &mut DriveContext<'_>) {
        self.command_start = ctx.scheduler.now();
        self.motor_started_this_command = self.turn_on_motor(ctx);
        self.suspend_motor_timer(ctx);
        ctx.disk.set_activity(true);

        // runtime toggles can have changed since the last command
        self.write_enabled = ctx.disk.is_write_enabled();
        self.format_enabled = ctx.disk.is_format_enabled();
        self.accurate_timing = ctx.disk.is_accurate_timing_enabled();
        self.sounds.set_enabled(ctx.disk.are_drive_sounds_enabled());
    }

    fn process_unsupported_command(&mut self, ctx: &mut DriveContext<'_>, code: u8) {
        debug!(
            "disk {}: unsupported command {code:02X} for {:?}, NAKing",
            self.unit + 1,
            self.mode
        );
        self.last_op_error = true;
        self.begin_transfer_nak_command(ctx);
        self.finish_command(ctx);
    }

    fn nak_and_finish(&mut self, ctx: &mut DriveContext<'_>, why: &str) {
        debug!("disk {}: {}", self.unit + 1, why);
        self.last_op_error = true;
        self.begin_transfer_nak_command(ctx);
        self.finish_command(ctx);
    }

    // ---- status bytes -----------------------------------------------------

    fn drive_status_byte(&self) -> u8 {
        let mut v: u8 = if self.sector_size > 128 { 0x30 } else { 0x10 };
        if self.last_op_error {
            v |= 0x04;
        }
        if !self.write_enabled {
            v |= 0x08;
        }
        if self.high_density {
            v |= 0x80;
        }
        if self.side_count == 2 {
            v |= 0x40;
        }
        v
    }

    fn fdc_status_byte(&self) -> u8 {
        if self.attached {
            self.fdc_status
        } else if self.profile.supports_not_ready {
            self.profile.power_on_fdc_status & !FdcStatus::NOT_READY.bits()
        } else {
            self.profile.power_on_fdc_status
        }
    }

    fn status_frame(&self) -> [u8; 4] {
        [self.drive_status_byte(), self.fdc_status_byte(), 0xE0, 0x00]
    }

    fn sector_transfer_cycles(&self, size: u16) -> u32 {
        let capacity = if self.mfm {
            TRACK_BYTE_CAPACITY_MFM
        } else {
            TRACK_BYTE_CAPACITY_FM
        };
        (self.rotation.cycles_per_rotation() as u64 * size as u64 / capacity as u64) as u32
    }

    // ---- command dispatch -------------------------------------------------

    fn classify_rate(&self, cycles_per_bit: u32) -> Option<bool> {
        let p = self.profile;
        let std = p.cycles_per_sio_bit;
        let lo = std as f32 * 0.95;
        let hi = std as f32 * 1.05;
        if (cycles_per_bit as f32) >= lo && (cycles_per_bit as f32) <= hi {
            return Some(false);
        }
        if p.supports_cmd_frame_high_speed
            && cycles_per_bit >= p.high_speed_cmd_frame_rate_lo
            && cycles_per_bit <= p.high_speed_cmd_frame_rate_hi
        {
            return Some(true);
        }
        None
    }

    fn dispatch_command(
        &mut self,
        ctx: &mut DriveContext<'_>,
        code: u8,
        frame: &CommandFrame,
        high_speed: bool,
    ) {
        let p = self.profile;
        match code {
            CMD_STATUS => {
                self.active = ActiveCommand::Status {
                    sub: SimpleSub::Ack,
                    high_speed,
                };
                self.begin_ack(ctx, high_speed);
                self.wait(ctx);
            }
            CMD_READ => self.begin_read(ctx, frame, high_speed),
            CMD_PUT | CMD_WRITE => {
                self.begin_write(ctx, frame, high_speed, code == CMD_WRITE)
            }
            CMD_FORMAT => self.begin_format(ctx, FormatKind::Standard, high_speed),
            CMD_FORMAT_MEDIUM if p.supports_enhanced_density => {
                self.begin_format(ctx, FormatKind::Medium, high_speed)
            }
            CMD_FORMAT_SKEWED if p.supports_cmd_format_skewed => {
                self.begin_format(ctx, FormatKind::Skewed, high_speed)
            }
            CMD_FORMAT_BOOT if p.supports_cmd_format_boot => {
                self.begin_format(ctx, FormatKind::Boot, high_speed)
            }
            CMD_READ_PERCOM if p.supports_cmd_percom => {
                self.active = ActiveCommand::ReadPercom {
                    sub: SimpleSub::Ack,
                    high_speed,
                };
                self.begin_ack(ctx, high_speed);
                self.wait(ctx);
            }
            CMD_WRITE_PERCOM if p.supports_cmd_percom => {
                self.active = ActiveCommand::WritePercom {
                    sub: VendorSub::Ack,
                    high_speed,
                    accepted: false,
                };
                self.begin_ack(ctx, high_speed);
                self.wait(ctx);
            }
            CMD_GET_HIGH_SPEED_INDEX if p.supports_cmd_get_high_speed_index => {
                self.active = ActiveCommand::GetHighSpeedIndex {
                    sub: SimpleSub::Ack,
                };
                self.begin_ack(ctx, high_speed);
                self.wait(ctx);
            }
            CMD_HAPPY_RAM_TEST | CMD_HAPPY_HEAD_TEST | CMD_HAPPY_RPM_TEST | CMD_HAPPY_QUIET
                if p.vendor_happy =>
            {
                let kind = match code {
                    CMD_HAPPY_RAM_TEST => HappyDiagKind::RamTest,
                    CMD_HAPPY_HEAD_TEST => HappyDiagKind::HeadPosTest,
                    CMD_HAPPY_RPM_TEST => HappyDiagKind::RpmTest,
                    _ => HappyDiagKind::Quiet,
                };
                self.active = ActiveCommand::HappyDiag {
                    kind,
                    sub: SimpleSub::Ack,
                    aux: frame.aux(),
                };
                self.begin_ack(ctx, high_speed);
                self.wait(ctx);
            }
            CMD_INDUS_EXECUTE if p.vendor_indus => {
                self.active = ActiveCommand::IndusExecute {
                    sub: VendorSub::Ack,
                };
                self.begin_ack(ctx, high_speed);
                self.wait(ctx);
            }
            _ => self.process_unsupported_command(ctx, code),
        }
    }

    fn begin_read(&mut self, ctx: &mut DriveContext<'_>, frame: &CommandFrame, high_speed: bool) {
        let sector = frame.aux();
        if ctx.disk.sector_breakpoint() == Some(sector) {
            debug!("disk {}: sector breakpoint hit on read {sector}", self.unit + 1);
        }

        if self.profile.vendor_happy && sector >= HAPPY_RAM_WINDOW {
            let mut rw = RwCommand::new(sector, high_speed);
            rw.ram_window = true;
            self.active = ActiveCommand::Read(rw);
            self.begin_ack(ctx, high_speed);
            self.wait(ctx);
            return;
        }

        if !self.attached {
            if (1..=MAX_NO_DISK_SECTOR).contains(&sector) {
                // An empty spindle still spins the FDC search: report the
                // miss only after the usual give-up time.
                let mut rw = RwCommand::new(sector, high_speed);
                rw.no_disk = true;
                self.active = ActiveCommand::Read(rw);
                self.begin_ack(ctx, high_speed);
                self.wait(ctx);
            } else {
                self.nak_and_finish(ctx, "read with no disk and sector out of boot range");
            }
            return;
        }

        if sector == 0 || sector > self.total_sector_count {
            self.nak_and_finish(ctx, "read sector out of range");
            return;
        }

        self.active = ActiveCommand::Read(RwCommand::new(sector, high_speed));
        self.begin_ack(ctx, high_speed);
        self.wait(ctx);
    }

    fn begin_write(
        &mut self,
        ctx: &mut DriveContext<'_>,
        frame: &CommandFrame,
        high_speed: bool,
        verify: bool,
    ) {
        let sector = frame.aux();
        if ctx.disk.sector_breakpoint() == Some(sector) {
            debug!("disk {}: sector breakpoint hit on write {sector}", self.unit + 1);
        }

        if self.profile.vendor_happy && sector >= HAPPY_RAM_WINDOW {
            let mut rw = RwCommand::new(sector, high_speed);
            rw.ram_window = true;
            rw.write_verify = verify;
            self.active = ActiveCommand::Write(rw);
            self.begin_ack(ctx, high_speed);
            self.wait(ctx);
            return;
        }

        if sector == 0 || sector > self.total_sector_count {
            self.nak_and_finish(ctx, "write sector out of range");
            return;
        }

        let mut rw = RwCommand::new(sector, high_speed);
        rw.write_verify = verify;
        self.active = ActiveCommand::Write(rw);
        self.begin_ack(ctx, high_speed);
        self.wait(ctx);
    }

    fn begin_format(&mut self, ctx: &mut DriveContext<'_>, kind: FormatKind, high_speed: bool) {
        if !self.write_enabled || !self.format_enabled {
            self.nak_and_finish(ctx, "format rejected: write/format disabled");
            return;
        }
        self.active = ActiveCommand::Format(FormatCommand {
            kind,
            sub: FormatSub::Ack,
            high_speed,
            track: 0,
            track_limit: 0,
            ok: true,
        });
        self.begin_ack(ctx, high_speed);
        self.wait(ctx);
    }

    // ---- shared read/write path ------------------------------------------

    /// Seek decision: target track, mechanical delay, track-buffer check.
    fn enter_seek(&mut self, ctx: &mut DriveContext<'_>, rw: &mut RwCommand, is_read: bool) {
        let p = self.profile;
        let spt = self.sectors_per_track.max(1);
        let track = ((rw.sector.max(1) - 1) as u32) / spt;
        let delta = track.abs_diff(self.current_track);

        rw.buffered = is_read
            && !rw.no_disk
            && p.buffer_track_reads
            && self.buffering_enabled
            && self.buffered_track == track as i32;

        let mut delay = p.cycles_to_fdc_command;
        if !rw.buffered {
            if self.motor_started_this_command {
                self.motor_started_this_command = false;
                delay += SPINUP_ROTATIONS * p.cycles_per_disk_rotation;
            }
            if delta > 0 {
                let mut steps = delta;
                // half-track steppers overshoot forward seeks by one step and
                // settle back
                if p.reverse_on_forward_seeks && track > self.current_track {
                    steps += 1;
                }
                delay += steps * p.cycles_per_track_step + p.cycles_for_head_settle;
                self.sounds
                    .step_burst(ctx.mixer, steps, p.cycles_per_track_step, 0);
            }
        }

        self.current_track = track;
        rw.sub = RwSub::Search;
        self.warp_or_delay(ctx, delay, CYCLES_MECH_DELAY_FAST);
    }

    /// One rotational search attempt (firmware states 13-16). Sets up either
    /// a retry or the transition into the outcome state.
    fn run_search(&mut self, ctx: &mut DriveContext<'_>, rw: &mut RwCommand, for_write: bool) {
        let p = self.profile;
        rw.attempt += 1;
        self.rotation.advance_to(ctx.scheduler.now(), true);

        let sel = if rw.no_disk || !self.attached {
            let mut status = FdcStatus::all().bits() & !FdcStatus::RECORD_NOT_FOUND.bits();
            if p.supports_not_ready {
                status &= !FdcStatus::NOT_READY.bits();
            }
            SectorSelection {
                phys: None,
                fdc_status: status,
                rotational_delay: 0,
                address_crc_only: false,
            }
        } else {
            let idx = (rw.sector - 1) as usize;
            let counter = self.rotation.counter();
            let period = self.rotation.cycles_per_rotation();
            let forced = self.forced_phantom.get(idx).copied().flatten();
            select_physical(
                &*ctx.disk,
                idx as u32,
                counter,
                period,
                self.accurate_timing,
                self.mfm,
                for_write,
                &mut self.phantom_counters[idx],
                forced,
            )
        };

        let mut status = sel.fdc_status;
        if let Some(phys) = sel.phys {
            let psi = ctx.disk.phys_sector_info(phys);
            if psi.weak_data_offset.is_some() && p.wait_for_long_sectors {
                // A long (weak) sector leaves the FDC hanging in the data
                // transfer; the 810 exposes that as DRQ, the 1050 as lost
                // data.
                status &= if p.retry_mode_1050 {
                    !FdcStatus::LOST_DATA.bits()
                } else {
                    !FdcStatus::DATA_REQUEST.bits()
                };
            }
        }

        rw.selected = sel.phys;
        rw.fdc_status = status;
        self.stat_last_attempts = rw.attempt;

        let failed = sel.phys.is_none() || status != FdcStatus::all().bits();
        let budget: u8 = if p.retry_mode_1050 { 2 } else { 4 };

        if failed && rw.attempt < budget {
            // Retry: burn another revolution; a record-not-found also
            // recalibrates the head out to track 0 and back.
            let mut delay = match sel.phys {
                Some(_) => sel.rotational_delay + self.rotation.cycles_per_rotation(),
                None => 2 * p.cycles_per_fake_rotation,
            };
            if sel.phys.is_none() && self.current_track > 0 {
                let steps = self.current_track;
                delay += 2 * steps * p.cycles_per_track_step + p.cycles_for_head_settle;
                self.sounds
                    .step_burst(ctx.mixer, steps * 2, p.cycles_per_track_step, 0);
            }
            trace!(
                "disk {}: sector {} search attempt {} failed (fdc {:02X}), retrying",
                self.unit + 1,
                rw.sector,
                rw.attempt,
                status
            );
            rw.sub = RwSub::Search;
            self.warp_or_delay(ctx, delay, CYCLES_ROTATIONAL_DELAY_FAST);
            return;
        }

        // Outcome: charge the rotational wait to the sector plus its pass
        // under the head, then the firmware's post-read turnaround. The
        // firmware clock starts at the stop bit of the last byte it handled.
        let delay = if rw.buffered {
            CYCLES_POST_READ_BUFFERED
        } else {
            match sel.phys {
                Some(phys) => {
                    let size = ctx.disk.phys_sector_info(phys).size;
                    sel.rotational_delay
                        + self.sector_transfer_cycles(size)
                        + p.cycles_post_read_to_complete
                }
                None => 2 * p.cycles_per_fake_rotation,
            }
        };
        rw.sub = RwSub::PostRead;
        self.warp_or_delay_from_stop_bit(ctx, delay, CYCLES_ROTATIONAL_DELAY_FAST);
    }

    fn finish_read(&mut self, ctx: &mut DriveContext<'_>, rw: &mut RwCommand) {
        self.rotation.advance_to(ctx.scheduler.now(), true);
        let high_speed = rw.high_speed;

        let Some(phys) = rw.selected else {
            // Missing sector: the FDC buffer goes out anyway, zero-filled,
            // behind an Error.
            self.fdc_status = rw.fdc_status;
            self.last_op_error = true;
            let data = vec![0u8; 128];
            self.send_result(ctx, false, &data, high_speed);
            rw.data = data;
            debug!(
                "disk {}: reporting missing sector {} (fdc {:02X})",
                self.unit + 1,
                rw.sector,
                rw.fdc_status
            );
            rw.sub = RwSub::Respond;
            self.wait(ctx);
            return;
        };

        let psi = ctx.disk.phys_sector_info(phys);
        let mut status = rw.fdc_status;
        let mut buf = vec![0u8; psi.size as usize];

        match ctx.disk.read_phys_sector(phys, &mut buf) {
            Ok(_) => {}
            Err(e) => {
                // storage faults surface as a CRC error, never as a host
                // failure
                warn!(
                    "disk {}: storage error reading psec {phys}: {e}",
                    self.unit + 1
                );
                status &= !FdcStatus::CRC_ERROR.bits();
                buf.fill(0);
            }
        }

        if let Some(offset) = psi.weak_data_offset {
            self.weak_lfsr.corrupt(&mut buf, offset as usize);
        }

        // Boot sectors answer with 128 bytes no matter what is recorded.
        let len = if rw.sector as u32 <= self.boot_sector_count as u32 {
            128
        } else {
            psi.size as usize
        };
        buf.resize(len, 0);

        if !rw.buffered && self.profile.buffer_track_reads {
            self.buffered_track = self.current_track as i32;
        }
        self.last_read_sector = rw.sector;

        rw.fdc_status = status;
        self.fdc_status = status;
        let success = status == FdcStatus::all().bits();
        self.last_op_error = !success;

        // Data goes out even on a CRC error; protections read it.
        self.send_result(ctx, success, &buf, high_speed);
        trace!(
            "disk {}: read vsec={} psec={} fdc={:02X} rot={:.2}",
            self.unit + 1,
            rw.sector,
            phys,
            status,
            self.rotation.position_fraction()
        );
        rw.data = buf;
        rw.sub = RwSub::Respond;
        self.wait(ctx);
    }

    fn commit_write(&mut self, ctx: &mut DriveContext<'_>, rw: &mut RwCommand) {
        self.rotation.advance_to(ctx.scheduler.now(), true);
        let p = self.profile;
        let high_speed = rw.high_speed;
        let all = FdcStatus::all().bits();

        let status = if !self.attached {
            let mut s = all & !FdcStatus::RECORD_NOT_FOUND.bits();
            if p.supports_not_ready {
                s &= !FdcStatus::NOT_READY.bits();
            }
            s
        } else if !self.write_enabled {
            all & !FdcStatus::WRITE_PROTECT.bits()
        } else if let Some(phys) = rw.selected {
            match ctx.disk.write_phys_sector(phys, &rw.data) {
                Ok(()) => {
                    // RAM-buffered tracks are stale once the media changes
                    self.buffered_track = -1;
                    all
                }
                Err(e) => {
                    warn!(
                        "disk {}: storage error writing psec {phys}: {e}",
                        self.unit + 1
                    );
                    all & !FdcStatus::CRC_ERROR.bits()
                }
            }
        } else {
            rw.fdc_status
        };

        rw.fdc_status = status;
        self.fdc_status = status;
        let success = status == all;
        self.last_op_error = !success;

        if success && rw.write_verify {
            // verify re-reads the sector on the next pass
            self.warp_or_delay(
                ctx,
                self.rotation.cycles_per_rotation(),
                CYCLES_ROTATIONAL_DELAY_FAST,
            );
        }

        self.send_result(ctx, success, &[], high_speed);
        debug!(
            "disk {}: write vsec={} fdc={:02X}{}",
            self.unit + 1,
            rw.sector,
            status,
            if rw.write_verify { " (verify)" } else { "" }
        );
        rw.sub = RwSub::Respond;
        self.wait(ctx);
    }

    // ---- per-command steps ------------------------------------------------

    fn step_status(&mut self, ctx: &mut DriveContext<'_>, sub: SimpleSub, high_speed: bool) {
        match sub {
            SimpleSub::Ack => {
                self.delay_from_stop_bit(ctx, self.profile.cycles_ack_stop_bit_to_status_complete);
                let frame = self.status_frame();
                self.send_result(ctx, true, &frame, high_speed);
                self.active = ActiveCommand::Status {
                    sub: SimpleSub::Respond,
                    high_speed,
                };
                self.wait(ctx);
            }
            SimpleSub::Respond => {
                self.finish_command(ctx);
            }
        }
    }

    fn step_read(&mut self, ctx: &mut DriveContext<'_>, mut rw: RwCommand) {
        match rw.sub {
            RwSub::Ack => {
                if rw.ram_window {
                    let base = ((rw.sector - HAPPY_RAM_WINDOW) as usize * HAPPY_RAM_PAGE)
                        % HAPPY_RAM_SIZE;
                    let data: Vec<u8> = self.happy_ram[base..base + HAPPY_RAM_PAGE].to_vec();
                    let hs = rw.high_speed;
                    self.delay_from_stop_bit(
                        ctx,
                        self.profile.cycles_ack_stop_bit_to_status_complete,
                    );
                    self.send_result(ctx, true, &data, hs);
                    rw.data = data;
                    rw.sub = RwSub::Respond;
                    self.active = ActiveCommand::Read(rw);
                    self.wait(ctx);
                } else {
                    self.enter_seek(ctx, &mut rw, true);
                    self.active = ActiveCommand::Read(rw);
                    self.wait(ctx);
                }
            }
            RwSub::Search => {
                self.run_search(ctx, &mut rw, false);
                self.active = ActiveCommand::Read(rw);
                self.wait(ctx);
            }
            RwSub::PostRead => {
                self.finish_read(ctx, &mut rw);
                self.active = ActiveCommand::Read(rw);
            }
            RwSub::Respond => {
                self.finish_command(ctx);
            }
            RwSub::Receive | RwSub::DataAck => {
                // read commands have no receive phase; treat as corrupt
                warn!("disk {}: read command in receive state", self.unit + 1);
                self.finish_command(ctx);
            }
        }
    }

    fn expected_write_len(&self, rw: &RwCommand) -> usize {
        if rw.ram_window {
            HAPPY_RAM_PAGE
        } else if rw.sector as u32 <= self.boot_sector_count as u32 {
            128
        } else {
            self.sector_size as usize
        }
    }

    fn step_write(&mut self, ctx: &mut DriveContext<'_>, mut rw: RwCommand) {
        match rw.sub {
            RwSub::Ack => {
                let len = self.expected_write_len(&rw);
                rw.sub = RwSub::Receive;
                self.active = ActiveCommand::Write(rw);
                self.request_receive(ctx, len);
            }
            RwSub::Receive => {
                let Some((data, checksum_ok)) = self.pending_receive.take() else {
                    warn!("disk {}: write receive with no data", self.unit + 1);
                    self.finish_command(ctx);
                    return;
                };
                if !checksum_ok {
                    debug!(
                        "disk {}: data frame checksum error on write, NAKing",
                        self.unit + 1
                    );
                    self.last_op_error = true;
                    self.setup_transfer_speed(ctx, rw.high_speed);
                    ctx.sio.send_nak();
                    self.finish_command(ctx);
                    return;
                }
                rw.data = data;
                let hs = rw.high_speed;
                self.begin_ack(ctx, hs);
                rw.sub = RwSub::DataAck;
                self.active = ActiveCommand::Write(rw);
                self.wait(ctx);
            }
            RwSub::DataAck => {
                if rw.ram_window {
                    // custom-firmware upload into drive RAM
                    let base = ((rw.sector - HAPPY_RAM_WINDOW) as usize * HAPPY_RAM_PAGE)
                        % HAPPY_RAM_SIZE;
                    let n = rw.data.len().min(HAPPY_RAM_PAGE);
                    self.happy_ram[base..base + n].copy_from_slice(&rw.data[..n]);
                    let hs = rw.high_speed;
                    self.delay_from_stop_bit(
                        ctx,
                        self.profile.cycles_ack_stop_bit_to_status_complete,
                    );
                    self.send_result(ctx, true, &[], hs);
                    rw.sub = RwSub::Respond;
                    self.active = ActiveCommand::Write(rw);
                    self.wait(ctx);
                } else {
                    self.enter_seek(ctx, &mut rw, false);
                    self.active = ActiveCommand::Write(rw);
                    self.wait(ctx);
                }
            }
            RwSub::Search => {
                self.run_search(ctx, &mut rw, true);
                self.active = ActiveCommand::Write(rw);
                self.wait(ctx);
            }
            RwSub::PostRead => {
                self.commit_write(ctx, &mut rw);
                self.active = ActiveCommand::Write(rw);
            }
            RwSub::Respond => {
                self.finish_command(ctx);
            }
        }
    }

    fn format_geometry(&mut self, kind: FormatKind, received: Option<&[u8]>) -> Option<DiskGeometry> {
        let mut percom = match kind {
            FormatKind::Standard => {
                if self.profile.supports_cmd_percom {
                    self.percom
                } else {
                    PercomBlock::single_density()
                }
            }
            FormatKind::Medium => PercomBlock::enhanced_density(),
            FormatKind::Skewed => match received.and_then(PercomBlock::decode) {
                Some(p) => p,
                None => return None,
            },
            FormatKind::Boot => self.percom,
        };

        if self.mode == DiskEmulationMode::Xf551 {
            percom = percom.normalize_xf551();
        }
        if !percom.validate() {
            return None;
        }
        self.percom = percom;
        Some(DiskGeometry::from_percom(&percom))
    }

    fn step_format(&mut self, ctx: &mut DriveContext<'_>, mut fmt: FormatCommand) {
        let p = self.profile;
        match fmt.sub {
            FormatSub::Ack => {
                if fmt.kind == FormatKind::Skewed {
                    // PERCOM block plus sector skew table in one data frame
                    fmt.sub = FormatSub::Receive;
                    self.active = ActiveCommand::Format(fmt);
                    self.request_receive(ctx, 128);
                } else {
                    self.start_format_pass(ctx, fmt, None);
                }
            }
            FormatSub::Receive => {
                let Some((data, checksum_ok)) = self.pending_receive.take() else {
                    self.finish_command(ctx);
                    return;
                };
                if !checksum_ok {
                    self.last_op_error = true;
                    self.setup_transfer_speed(ctx, fmt.high_speed);
                    ctx.sio.send_nak();
                    self.finish_command(ctx);
                    return;
                }
                let hs = fmt.high_speed;
                self.begin_ack(ctx, hs);
                fmt.sub = FormatSub::DataAck;
                fmt.ok = true;
                self.active = ActiveCommand::Format(fmt);
                // stash the received block through the fence
                self.pending_receive = Some((data, true));
                self.wait(ctx);
            }
            FormatSub::DataAck => {
                let received = self.pending_receive.take().map(|(d, _)| d);
                self.start_format_pass(ctx, fmt, received.as_deref());
            }
            FormatSub::Track => {
                fmt.track += 1;
                if fmt.track < fmt.track_limit {
                    let delay = p.cycles_per_track_step + p.cycles_for_head_settle;
                    self.sounds.step_burst(ctx.mixer, 1, p.cycles_per_track_step, 0);
                    fmt.sub = FormatSub::Track;
                    self.active = ActiveCommand::Format(fmt);
                    self.warp_or_delay(ctx, delay, CYCLES_MECH_DELAY_FAST);
                    self.wait(ctx);
                } else {
                    // every sector formatted clean: all-0xFF map back to the
                    // host
                    let data = vec![0xFF; self.sector_size as usize];
                    let success = fmt.ok;
                    let hs = fmt.high_speed;
                    self.fdc_status = FdcStatus::all().bits();
                    self.last_op_error = !success;
                    self.send_result(ctx, success, &data, hs);
                    fmt.sub = FormatSub::Respond;
                    self.active = ActiveCommand::Format(fmt);
                    self.wait(ctx);
                }
            }
            FormatSub::Respond => {
                self.finish_command(ctx);
            }
        }
    }

    fn start_format_pass(
        &mut self,
        ctx: &mut DriveContext<'_>,
        mut fmt: FormatCommand,
        received: Option<&[u8]>,
    ) {
        let p = self.profile;
        match self.format_geometry(fmt.kind, received) {
            Some(geometry) => {
                let result = if fmt.kind == FormatKind::Boot {
                    // boot-track format rewrites only the boot area
                    let spt = self.sectors_per_track.max(1);
                    let zeros = vec![0u8; self.sector_size as usize];
                    let mut r = Ok(());
                    for vsec in 0..(3 * spt).min(self.total_sector_count as u32) {
                        let vsi = ctx.disk.virt_sector_info(vsec);
                        if vsi.num_phys > 0 {
                            if let Err(e) = ctx.disk.write_phys_sector(vsi.start_phys, &zeros) {
                                r = Err(e);
                                break;
                            }
                        }
                    }
                    r
                } else {
                    ctx.disk.format(&geometry)
                };

                match result {
                    Ok(()) => {
                        if fmt.kind != FormatKind::Boot {
                            self.refresh_from_disk(ctx.disk);
                        }
                        self.buffered_track = -1;
                        fmt.track = 0;
                        fmt.track_limit = if fmt.kind == FormatKind::Boot {
                            3
                        } else {
                            self.track_count.max(1) as u16
                        };
                        fmt.sub = FormatSub::Track;
                        fmt.ok = true;
                        debug!(
                            "disk {}: formatting {} tracks ({:?})",
                            self.unit + 1,
                            fmt.track_limit,
                            fmt.kind
                        );
                        self.active = ActiveCommand::Format(fmt);
                        let delay = p.cycles_per_track_step + p.cycles_for_head_settle;
                        self.warp_or_delay(ctx, delay, CYCLES_MECH_DELAY_FAST);
                        self.wait(ctx);
                    }
                    Err(e) => {
                        warn!("disk {}: format failed: {e}", self.unit + 1);
                        let hs = fmt.high_speed;
                        self.last_op_error = true;
                        let data = vec![0xFF; self.sector_size as usize];
                        self.send_result(ctx, false, &data, hs);
                        fmt.sub = FormatSub::Respond;
                        fmt.ok = false;
                        self.active = ActiveCommand::Format(fmt);
                        self.wait(ctx);
                    }
                }
            }
            None => {
                let hs = fmt.high_speed;
                self.last_op_error = true;
                let data = vec![0xFF; self.sector_size as usize];
                self.send_result(ctx, false, &data, hs);
                fmt.sub = FormatSub::Respond;
                fmt.ok = false;
                self.active = ActiveCommand::Format(fmt);
                self.wait(ctx);
            }
        }
    }

    fn step_read_percom(&mut self, ctx: &mut DriveContext<'_>, sub: SimpleSub, high_speed: bool) {
        match sub {
            SimpleSub::Ack => {
                self.delay_from_stop_bit(
                    ctx,
                    self.profile.cycles_ack_stop_bit_to_read_percom_complete,
                );
                let block = self.percom.encode();
                self.send_result(ctx, true, &block, high_speed);
                self.active = ActiveCommand::ReadPercom {
                    sub: SimpleSub::Respond,
                    high_speed,
                };
                self.wait(ctx);
            }
            SimpleSub::Respond => {
                self.finish_command(ctx);
            }
        }
    }

    fn step_write_percom(
        &mut self,
        ctx: &mut DriveContext<'_>,
        sub: VendorSub,
        high_speed: bool,
        accepted: bool,
    ) {
        match sub {
            VendorSub::Ack => {
                self.active = ActiveCommand::WritePercom {
                    sub: VendorSub::Receive,
                    high_speed,
                    accepted,
                };
                self.request_receive(ctx, PERCOM_BLOCK_LEN);
            }
            VendorSub::Receive => {
                let Some((data, checksum_ok)) = self.pending_receive.take() else {
                    self.finish_command(ctx);
                    return;
                };
                if !checksum_ok {
                    self.last_op_error = true;
                    self.setup_transfer_speed(ctx, high_speed);
                    ctx.sio.send_nak();
                    self.finish_command(ctx);
                    return;
                }
                let ok = self.set_percom_data(&data);
                self.begin_ack(ctx, high_speed);
                self.active = ActiveCommand::WritePercom {
                    sub: VendorSub::DataAck,
                    high_speed,
                    accepted: ok,
                };
                self.wait(ctx);
            }
            VendorSub::DataAck => {
                self.delay_from_stop_bit(
                    ctx,
                    self.profile.cycles_ack_stop_bit_to_read_percom_complete,
                );
                self.last_op_error = !accepted;
                self.send_result(ctx, accepted, &[], high_speed);
                self.active = ActiveCommand::WritePercom {
                    sub: VendorSub::Respond,
                    high_speed,
                    accepted,
                };
                self.wait(ctx);
            }
            VendorSub::Respond => {
                self.finish_command(ctx);
            }
        }
    }

    fn step_get_high_speed_index(&mut self, ctx: &mut DriveContext<'_>, sub: SimpleSub) {
        match sub {
            SimpleSub::Ack => {
                self.delay_from_stop_bit(ctx, self.profile.cycles_ack_stop_bit_to_status_complete);
                let data = [self.profile.high_speed_index];
                self.send_result(ctx, true, &data, false);
                self.active = ActiveCommand::GetHighSpeedIndex {
                    sub: SimpleSub::Respond,
                };
                self.wait(ctx);
            }
            SimpleSub::Respond => {
                self.finish_command(ctx);
            }
        }
    }

    fn step_happy_diag(
        &mut self,
        ctx: &mut DriveContext<'_>,
        kind: HappyDiagKind,
        sub: SimpleSub,
        aux: u16,
    ) {
        match sub {
            SimpleSub::Ack => {
                let data: Vec<u8> = match kind {
                    HappyDiagKind::RamTest => vec![0u8; 128],
                    HappyDiagKind::HeadPosTest => {
                        let mut d = vec![0u8; 128];
                        d[0] = self.current_track.min(255) as u8;
                        d
                    }
                    HappyDiagKind::RpmTest => {
                        let ms = (self.rotation.cycles_per_rotation() as f64
                            / (CYCLES_PER_SECOND / 1000.0)) as u16;
                        let mut d = vec![0u8; 128];
                        d[0..2].copy_from_slice(&ms.to_le_bytes());
                        d
                    }
                    HappyDiagKind::Quiet => {
                        self.sounds.set_enabled(aux == 0);
                        Vec::new()
                    }
                };
                self.delay_from_stop_bit(ctx, self.profile.cycles_ack_stop_bit_to_status_complete);
                self.send_result(ctx, true, &data, false);
                self.active = ActiveCommand::HappyDiag {
                    kind,
                    sub: SimpleSub::Respond,
                    aux,
                };
                self.wait(ctx);
            }
            SimpleSub::Respond => {
                self.finish_command(ctx);
            }
        }
    }

    fn step_indus_execute(&mut self, ctx: &mut DriveContext<'_>, sub: VendorSub) {
        match sub {
            VendorSub::Ack => {
                self.active = ActiveCommand::IndusExecute {
                    sub: VendorSub::Receive,
                };
                self.request_receive(ctx, 128);
            }
            VendorSub::Receive => {
                let Some((data, checksum_ok)) = self.pending_receive.take() else {
                    self.finish_command(ctx);
                    return;
                };
                if !checksum_ok {
                    self.last_op_error = true;
                    self.setup_transfer_speed(ctx, false);
                    ctx.sio.send_nak();
                    self.finish_command(ctx);
                    return;
                }
                // Loader blocks tagged by the firmware family they install.
                if data.starts_with(b"SM") {
                    self.profile = profile::indus_gt_synchromesh_profile();
                    debug!("disk {}: Synchromesh firmware recognized", self.unit + 1);
                } else if data.starts_with(b"S2") {
                    self.profile = profile::indus_gt_super_synchromesh_profile();
                    debug!(
                        "disk {}: SuperSynchromesh firmware recognized",
                        self.unit + 1
                    );
                }
                self.begin_ack(ctx, false);
                self.active = ActiveCommand::IndusExecute {
                    sub: VendorSub::DataAck,
                };
                self.wait(ctx);
            }
            VendorSub::DataAck => {
                self.delay_from_stop_bit(ctx, self.profile.cycles_ack_stop_bit_to_status_complete);
                self.send_result(ctx, true, &[], false);
                self.active = ActiveCommand::IndusExecute {
                    sub: VendorSub::Respond,
                };
                self.wait(ctx);
            }
            VendorSub::Respond => {
                self.finish_command(ctx);
            }
        }
    }

    fn resume(&mut self, ctx: &mut DriveContext<'_>) {
        let cmd = std::mem::replace(&mut self.active, ActiveCommand::None);
        match cmd {
            ActiveCommand::None => {}
            ActiveCommand::Status { sub, high_speed } => self.step_status(ctx, sub, high_speed),
            ActiveCommand::Read(rw) => self.step_read(ctx, rw),
            ActiveCommand::Write(rw) => self.step_write(ctx, rw),
            ActiveCommand::Format(fmt) => self.step_format(ctx, fmt),
            ActiveCommand::ReadPercom { sub, high_speed } => {
                self.step_read_percom(ctx, sub, high_speed)
            }
            ActiveCommand::WritePercom {
                sub,
                high_speed,
                accepted,
            } => self.step_write_percom(ctx, sub, high_speed, accepted),
            ActiveCommand::GetHighSpeedIndex { sub } => self.step_get_high_speed_index(ctx, sub),
            ActiveCommand::HappyDiag { kind, sub, aux } => {
                self.step_happy_diag(ctx, kind, sub, aux)
            }
            ActiveCommand::IndusExecute { sub } => self.step_indus_execute(ctx, sub),
        }
    }

    /// Re-enter a command restored by `load_state`: executes the pending
    /// checkpoint exactly as its fence would have.
    pub fn resume_loaded_command(&mut self, ctx: &mut DriveContext<'_>) {
        if !self.active.is_none() {
            self.waiting = false;
            self.resume(ctx);
        }
    }

    // ---- save / load ------------------------------------------------------

    pub fn save_state(&self, scheduler: &Scheduler) -> DriveSaveState {
        let idle = match self.motor_off_event {
            Some(h) => scheduler.ticks_to_event(h),
            None => self.motor_suspended,
        };
        // The rotational counter is lazily updated; persist its value as of
        // now, not as of the last advance.
        let (counter, rotations) =
            self.rotation.snapshot(scheduler.now(), self.is_motor_running());
        let fraction = counter as f32 / self.rotation.cycles_per_rotation() as f32;
        DriveSaveState {
            idle_timer_remaining: idle,
            active_command: self.save_active_command(),
            rotational_fraction: fraction.clamp(0.0, 0.9999999),
            rotations,
            current_track: self.current_track,
            buffered_track: self.buffered_track,
            last_read_sector: self.last_read_sector,
            buffering_enabled: self.buffering_enabled,
            last_op_error: self.last_op_error,
            fdc_status: self.fdc_status,
            weak_lfsr: self.weak_lfsr.state(),
            phantom_counters: self.phantom_counters.clone(),
        }
    }

    fn save_active_command(&self) -> Option<ActiveCommandState> {
        fn rw_state(sub: RwSub) -> u8 {
            match sub {
                RwSub::Ack => 0,
                RwSub::Receive => 2,
                RwSub::DataAck => 3,
                RwSub::Search => 13,
                RwSub::PostRead => 20,
                RwSub::Respond => 21,
            }
        }
        fn rw_flags(rw: &RwCommand) -> u16 {
            let mut f = 0;
            if rw.ram_window {
                f |= 1;
            }
            if rw.no_disk {
                f |= 2;
            }
            if rw.buffered {
                f |= 4;
            }
            f
        }

        match &self.active {
            ActiveCommand::None => None,
            ActiveCommand::Status { sub, high_speed } => Some(ActiveCommandState {
                command: CMD_STATUS,
                state: if *sub == SimpleSub::Ack { 0 } else { 21 },
                high_speed: *high_speed,
                ..Default::default()
            }),
            ActiveCommand::Read(rw) => Some(ActiveCommandState {
                command: CMD_READ,
                state: rw_state(rw.sub),
                sector: rw.sector,
                attempt: rw.attempt,
                high_speed: rw.high_speed,
                selected_phys: rw.selected,
                fdc_status: rw.fdc_status,
                progress: rw_flags(rw),
                data: rw.data.clone(),
            }),
            ActiveCommand::Write(rw) => Some(ActiveCommandState {
                command: if rw.write_verify { CMD_WRITE } else { CMD_PUT },
                state: rw_state(rw.sub),
                sector: rw.sector,
                attempt: rw.attempt,
                high_speed: rw.high_speed,
                selected_phys: rw.selected,
                fdc_status: rw.fdc_status,
                progress: rw_flags(rw),
                data: rw.data.clone(),
            }),
            ActiveCommand::Format(fmt) => Some(ActiveCommandState {
                command: match fmt.kind {
                    FormatKind::Standard => CMD_FORMAT,
                    FormatKind::Medium => CMD_FORMAT_MEDIUM,
                    FormatKind::Skewed => CMD_FORMAT_SKEWED,
                    FormatKind::Boot => CMD_FORMAT_BOOT,
                },
                state: match fmt.sub {
                    FormatSub::Ack => 0,
                    FormatSub::Receive => 2,
                    FormatSub::DataAck => 3,
                    FormatSub::Track => 4,
                    FormatSub::Respond => 5,
                },
                high_speed: fmt.high_speed,
                progress: fmt.track | ((fmt.ok as u16) << 15),
                ..Default::default()
            }),
            ActiveCommand::ReadPercom { sub, high_speed } => Some(ActiveCommandState {
                command: CMD_READ_PERCOM,
                state: if *sub == SimpleSub::Ack { 0 } else { 21 },
                high_speed: *high_speed,
                ..Default::default()
            }),
            ActiveCommand::WritePercom {
                sub,
                high_speed,
                accepted,
            } => Some(ActiveCommandState {
                command: CMD_WRITE_PERCOM,
                state: match sub {
                    VendorSub::Ack => 0,
                    VendorSub::Receive => 2,
                    VendorSub::DataAck => 3,
                    VendorSub::Respond => 21,
                },
                high_speed: *high_speed,
                progress: *accepted as u16,
                ..Default::default()
            }),
            ActiveCommand::GetHighSpeedIndex { sub } => Some(ActiveCommandState {
                command: CMD_GET_HIGH_SPEED_INDEX,
                state: if *sub == SimpleSub::Ack { 0 } else { 21 },
                ..Default::default()
            }),
            ActiveCommand::HappyDiag { kind, sub, aux } => Some(ActiveCommandState {
                command: match kind {
                    HappyDiagKind::RamTest => CMD_HAPPY_RAM_TEST,
                    HappyDiagKind::HeadPosTest => CMD_HAPPY_HEAD_TEST,
                    HappyDiagKind::RpmTest => CMD_HAPPY_RPM_TEST,
                    HappyDiagKind::Quiet => CMD_HAPPY_QUIET,
                },
                state: if *sub == SimpleSub::Ack { 0 } else { 21 },
                progress: *aux,
                ..Default::default()
            }),
            ActiveCommand::IndusExecute { sub } => Some(ActiveCommandState {
                command: CMD_INDUS_EXECUTE,
                state: match sub {
                    VendorSub::Ack => 0,
                    VendorSub::Receive => 2,
                    VendorSub::DataAck => 3,
                    VendorSub::Respond => 21,
                },
                ..Default::default()
            }),
        }
    }

    pub fn load_state(
        &mut self,
        scheduler: &mut Scheduler,
        disk: &mut dyn DiskInterface,
        state: &DriveSaveState,
    ) -> Result<(), SaveStateError> {
        state.validate()?;

        let active = match &state.active_command {
            None => ActiveCommand::None,
            Some(st) => Self::restore_active_command(st)?,
        };

        self.refresh_from_disk(disk);

        self.active = active;
        self.waiting = false;
        self.expected_receive = None;
        self.pending_receive = None;

        self.rotation.set_position_fraction(state.rotational_fraction);
        self.rotation.resync(scheduler.now());
        self.current_track = state.current_track;
        self.buffered_track = state.buffered_track;
        self.last_read_sector = state.last_read_sector;
        self.buffering_enabled = state.buffering_enabled;
        self.last_op_error = state.last_op_error;
        self.fdc_status = state.fdc_status;
        self.weak_lfsr.set_state(state.weak_lfsr);

        for (i, c) in self.phantom_counters.iter_mut().enumerate() {
            *c = state.phantom_counters.get(i).copied().unwrap_or(0);
        }

        scheduler.unschedule_opt(&mut self.motor_off_event);
        self.motor_suspended = None;
        if let Some(idle) = state.idle_timer_remaining {
            if self.active.is_none() {
                self.motor_off_event = Some(scheduler.schedule(idle, EVENT_MOTOR_OFF));
            } else {
                self.motor_suspended = Some(idle);
            }
        }
        Ok(())
    }

    fn restore_active_command(st: &ActiveCommandState) -> Result<ActiveCommand, SaveStateError> {
        fn rw_sub(state: u8) -> Option<RwSub> {
            Some(match state {
                0 => RwSub::Ack,
                2 => RwSub::Receive,
                3 => RwSub::DataAck,
                13..=16 => RwSub::Search,
                20 => RwSub::PostRead,
                21 => RwSub::Respond,
                _ => return None,
            })
        }
        fn simple_sub(state: u8) -> Option<SimpleSub> {
            Some(match state {
                0 => SimpleSub::Ack,
                21 => SimpleSub::Respond,
                _ => return None,
            })
        }
        fn vendor_sub(state: u8) -> Option<VendorSub> {
            Some(match state {
                0 => VendorSub::Ack,
                2 => VendorSub::Receive,
                3 => VendorSub::DataAck,
                21 => VendorSub::Respond,
                _ => return None,
            })
        }

        let bad = || SaveStateError::UnknownCommandState(st.command, st.state);

        let restore_rw = |verify: bool| -> Result<RwCommand, SaveStateError> {
            Ok(RwCommand {
                sub: rw_sub(st.state).ok_or_else(bad)?,
                sector: st.sector,
                attempt: st.attempt,
                high_speed: st.high_speed,
                write_verify: verify,
                ram_window: st.progress & 1 != 0,
                no_disk: st.progress & 2 != 0,
                buffered: st.progress & 4 != 0,
                selected: st.selected_phys,
                fdc_status: st.fdc_status,
                data: st.data.clone(),
            })
        };

        Ok(match st.command {
            CMD_STATUS => ActiveCommand::Status {
                sub: simple_sub(st.state).ok_or_else(bad)?,
                high_speed: st.high_speed,
            },
            CMD_READ => ActiveCommand::Read(restore_rw(false)?),
            CMD_PUT => ActiveCommand::Write(restore_rw(false)?),
            CMD_WRITE => ActiveCommand::Write(restore_rw(true)?),
            CMD_FORMAT | CMD_FORMAT_MEDIUM | CMD_FORMAT_SKEWED | CMD_FORMAT_BOOT => {
                let kind = match st.command {
                    CMD_FORMAT => FormatKind::Standard,
                    CMD_FORMAT_MEDIUM => FormatKind::Medium,
                    CMD_FORMAT_SKEWED => FormatKind::Skewed,
                    _ => FormatKind::Boot,
                };
                let sub = match st.state {
                    0 => FormatSub::Ack,
                    2 => FormatSub::Receive,
                    3 => FormatSub::DataAck,
                    4 => FormatSub::Track,
                    5 => FormatSub::Respond,
                    _ => return Err(bad()),
                };
                ActiveCommand::Format(FormatCommand {
                    kind,
                    sub,
                    high_speed: st.high_speed,
                    track: st.progress & 0x7FFF,
                    track_limit: 0,
                    ok: st.progress & 0x8000 != 0,
                })
            }
            CMD_READ_PERCOM => ActiveCommand::ReadPercom {
                sub: simple_sub(st.state).ok_or_else(bad)?,
                high_speed: st.high_speed,
            },
            CMD_WRITE_PERCOM => ActiveCommand::WritePercom {
                sub: vendor_sub(st.state).ok_or_else(bad)?,
                high_speed: st.high_speed,
                accepted: st.progress != 0,
            },
            CMD_GET_HIGH_SPEED_INDEX => ActiveCommand::GetHighSpeedIndex {
                sub: simple_sub(st.state).ok_or_else(bad)?,
            },
            CMD_HAPPY_RAM_TEST | CMD_HAPPY_HEAD_TEST | CMD_HAPPY_RPM_TEST | CMD_HAPPY_QUIET => {
                let kind = match st.command {
                    CMD_HAPPY_RAM_TEST => HappyDiagKind::RamTest,
                    CMD_HAPPY_HEAD_TEST => HappyDiagKind::HeadPosTest,
                    CMD_HAPPY_RPM_TEST => HappyDiagKind::RpmTest,
                    _ => HappyDiagKind::Quiet,
                };
                ActiveCommand::HappyDiag {
                    kind,
                    sub: simple_sub(st.state).ok_or_else(bad)?,
                    aux: st.progress,
                }
            }
            CMD_INDUS_EXECUTE => ActiveCommand::IndusExecute {
                sub: vendor_sub(st.state).ok_or_else(bad)?,
            },
            other => return Err(SaveStateError::UnknownCommand(other)),
        })
    }

    // ---- accelerated path -------------------------------------------------

    /// Host-OS acceleration hook: execute a command synchronously, bypassing
    /// bus timing, and return the SIO completion code.
    pub fn on_serial_accel_command(
        &mut self,
        ctx: &mut DriveContext<'_>,
        req: AccelRequest<'_>,
    ) -> u8 {
        match req {
            AccelRequest::Status { out } => {
                *out = self.status_frame();
                SIO_SUCCESS
            }
            AccelRequest::Read { sector, out } => self.accel_read(ctx, sector, out),
            AccelRequest::Write { sector, data } => self.accel_write(ctx, sector, data),
        }
    }

    fn accel_read(&mut self, ctx: &mut DriveContext<'_>, sector: u16, out: &mut [u8]) -> u8 {
        if sector == 0 || sector > self.total_sector_count {
            return SIO_DEVICE_NAK;
        }
        let motor_on = self.is_motor_running();
        self.rotation.advance_to(ctx.scheduler.now(), motor_on);

        // command overhead: five frame bytes plus processing
        self.rotation
            .warp(self.profile.cycles_per_sio_byte as u64 * 5 + 1000);

        let idx = (sector - 1) as usize;
        let counter = self.rotation.counter();
        let period = self.rotation.cycles_per_rotation();
        let forced = self.forced_phantom.get(idx).copied().flatten();
        let sel = select_physical(
            &*ctx.disk,
            idx as u32,
            counter,
            period,
            false,
            self.mfm,
            false,
            &mut self.phantom_counters[idx],
            forced,
        );

        let Some(phys) = sel.phys else {
            self.fdc_status = sel.fdc_status;
            self.last_op_error = true;
            return SIO_DEVICE_ERROR;
        };

        let psi = ctx.disk.phys_sector_info(phys);
        let mut buf = vec![0u8; psi.size as usize];
        let mut status = sel.fdc_status;
        if ctx.disk.read_phys_sector(phys, &mut buf).is_err() {
            status &= !FdcStatus::CRC_ERROR.bits();
            buf.fill(0);
        }
        if let Some(offset) = psi.weak_data_offset {
            self.weak_lfsr.corrupt(&mut buf, offset as usize);
        }

        self.rotation
            .warp(sel.rotational_delay as u64 + self.sector_transfer_cycles(psi.size) as u64);
        self.fdc_status = status;
        self.last_op_error = status != FdcStatus::all().bits();

        let n = buf.len().min(out.len());
        out[..n].copy_from_slice(&buf[..n]);

        if status != FdcStatus::all().bits() {
            SIO_DEVICE_ERROR
        } else if out.len() > buf.len() {
            // short sector against a long request: the host times out
            // waiting for the rest
            SIO_TIMEOUT
        } else if out.len() < buf.len() {
            // extra bytes get mistaken for the checksum
            SIO_CHECKSUM_ERROR
        } else {
            SIO_SUCCESS
        }
    }

    fn accel_write(&mut self, ctx: &mut DriveContext<'_>, sector: u16, data: &[u8]) -> u8 {
        if !self.write_enabled {
            return SIO_DEVICE_NAK;
        }
        if sector == 0 || sector > self.total_sector_count {
            return SIO_DEVICE_NAK;
        }

        let idx = (sector - 1) as usize;
        let vsi = ctx.disk.virt_sector_info(idx as u32);
        if vsi.num_phys == 0 {
            return SIO_DEVICE_ERROR;
        }
        let psi = ctx.disk.phys_sector_info(vsi.start_phys);
        if data.len() > psi.size as usize {
            return SIO_TIMEOUT;
        }
        if data.len() < psi.size as usize {
            return SIO_CHECKSUM_ERROR;
        }
        match ctx.disk.write_phys_sector(vsi.start_phys, data) {
            Ok(()) => {
                self.buffered_track = -1;
                self.fdc_status = FdcStatus::all().bits();
                self.last_op_error = false;
                SIO_SUCCESS
            }
            Err(_) => {
                self.fdc_status = FdcStatus::all().bits() & !FdcStatus::CRC_ERROR.bits();
                self.last_op_error = true;
                SIO_DEVICE_ERROR
            }
        }
    }
}

impl SioDevice for DriveEmulator {
    fn on_serial_begin_command(
        &mut self,
        ctx: &mut DriveContext<'_>,
        frame: &CommandFrame,
    ) -> CmdResponse {
        if !self.enabled {
            return CmdResponse::NotHandled;
        }
        if frame.device != 0x31 + self.unit {
            return CmdResponse::NotHandled;
        }

        // A frame at a rate this firmware cannot decode never registers.
        let Some(frame_high_speed) = self.classify_rate(frame.cycles_per_bit) else {
            trace!(
                "disk {}: command frame at undecodable rate {}",
                self.unit + 1,
                frame.cycles_per_bit
            );
            return CmdResponse::NotHandled;
        };

        let mut high_speed = frame_high_speed;
        let mut code = frame.command;
        if self.profile.supports_cmd_high_speed && code & 0x80 != 0 {
            code &= 0x7F;
            high_speed = true;
        }

        if !self.active.is_none() {
            warn!(
                "disk {}: command {:02X} while busy, dropping previous",
                self.unit + 1,
                code
            );
            ctx.sio.flush_queue();
            self.active = ActiveCommand::None;
            self.waiting = false;
        }

        debug!(
            "disk {}: command {:02X} aux={:04X}{}",
            self.unit + 1,
            code,
            frame.aux(),
            if high_speed { " (high speed)" } else { "" }
        );

        self.begin_command(ctx);
        self.dispatch_command(ctx, code, frame, high_speed);
        CmdResponse::Start
    }

    fn on_serial_abort_command(&mut self, ctx: &mut DriveContext<'_>) {
        if self.active.is_none() {
            return;
        }
        debug!("disk {}: command aborted by transport", self.unit + 1);
        self.active = ActiveCommand::None;
        self.waiting = false;
        self.expected_receive = None;
        self.pending_receive = None;
        ctx.sio.flush_queue();
        ctx.disk.set_activity(false);

        // The firmware could not service its idle timer while busy: push
        // the deadline out by however long the command ran.
        let elapsed = ctx.scheduler.now().saturating_sub(self.command_start);
        let remaining = self
            .motor_suspended
            .take()
            .unwrap_or(self.profile.cycles_to_motor_off as u64);
        self.arm_motor_timer(ctx, remaining + elapsed);
    }

    fn on_serial_receive_complete(
        &mut self,
        ctx: &mut DriveContext<'_>,
        id: u32,
        data: &[u8],
        checksum_ok: bool,
    ) {
        if self.active.is_none() || self.expected_receive != Some(id) {
            trace!("disk {}: stale receive {id} ignored", self.unit + 1);
            return;
        }
        self.expected_receive = None;
        self.waiting = false;
        self.pending_receive = Some((data.to_vec(), checksum_ok));
        self.resume(ctx);
    }

    fn on_serial_fence(&mut self, ctx: &mut DriveContext<'_>, id: u32) {
        // Stale fences from an aborted command carry an old id and fall
        // through here; state checks stand in for a cancellation token.
        if self.active.is_none() || !self.waiting || id != self.expected_fence {
            trace!("disk {}: stale fence {id} ignored", self.unit + 1);
            return;
        }
        self.waiting = false;
        self.resume(ctx);
    }

    fn on_scheduled_event(&mut self, ctx: &mut DriveContext<'_>, token: u32) {
        if token == EVENT_MOTOR_OFF {
            self.handle_motor_off(ctx);
        }
    }
}

// ---- single-threaded harness ---------------------------------------------

use crate::sio::{SioCallback, SioQueue};

/// Offer a command frame to the drive, stamping the frame-end/deassert
/// times the NAK rule needs.
pub fn send_command(
    drive: &mut DriveEmulator,
    scheduler: &mut Scheduler,
    sio: &mut SioQueue,
    disk: &mut dyn DiskInterface,
    mixer: &mut dyn AudioMixer,
    frame: CommandFrame,
) -> CmdResponse {
    sio.open_command(scheduler.now(), scheduler.now());
    let mut ctx = DriveContext {
        scheduler,
        sio,
        disk,
        mixer,
    };
    drive.on_serial_begin_command(&mut ctx, &frame)
}

/// Drain the transport queue, routing fences and receive completions back
/// into the drive until the bus goes idle.
pub fn pump(
    drive: &mut DriveEmulator,
    scheduler: &mut Scheduler,
    sio: &mut SioQueue,
    disk: &mut dyn DiskInterface,
    mixer: &mut dyn AudioMixer,
) {
    loop {
        match sio.step(scheduler) {
            Some(SioCallback::Fence(id)) => {
                let mut ctx = DriveContext {
                    scheduler: &mut *scheduler,
                    sio: &mut *sio,
                    disk: &mut *disk,
                    mixer: &mut *mixer,
                };
                drive.on_serial_fence(&mut ctx, id);
            }
            Some(SioCallback::ReceiveComplete {
                id,
                data,
                checksum_ok,
            }) => {
                let mut ctx = DriveContext {
                    scheduler: &mut *scheduler,
                    sio: &mut *sio,
                    disk: &mut *disk,
                    mixer: &mut *mixer,
                };
                drive.on_serial_receive_complete(&mut ctx, id, &data, checksum_ok);
            }
            None => break,
        }
    }
}

/// Fire pending scheduler events (motor-off) up to `until`, then advance
/// the clock there.
pub fn run_events_until(
    drive: &mut DriveEmulator,
    scheduler: &mut Scheduler,
    sio: &mut SioQueue,
    disk: &mut dyn DiskInterface,
    mixer: &mut dyn AudioMixer,
    until: u64,
) {
    while let Some((_, token)) = scheduler.pop_due(until) {
        let mut ctx = DriveContext {
            scheduler: &mut *scheduler,
            sio: &mut *sio,
            disk: &mut *disk,
            mixer: &mut *mixer,
        };
        drive.on_scheduled_event(&mut ctx, token);
    }
    scheduler.advance_to(until);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disksound::{DriveSoundCue, NullMixer};
    use crate::image::{DiskGeometry, RamDiskImage};
    use crate::sio::WireEvent;

    fn rig(
        mode: DiskEmulationMode,
        img: &mut RamDiskImage,
    ) -> (DriveEmulator, Scheduler, SioQueue) {
        let mut drive = DriveEmulator::new(0);
        drive.set_emulation_mode(mode);
        drive.set_randomization_seed(42);
        let mut sched = Scheduler::new();
        let mut sio = SioQueue::new();
        let mut mixer = NullMixer;
        {
            let mut ctx = DriveContext {
                scheduler: &mut sched,
                sio: &mut sio,
                disk: img,
                mixer: &mut mixer,
            };
            drive.init(&mut ctx);
        }
        (drive, sched, sio)
    }

    fn frame_for(drive: &DriveEmulator, command: u8, aux: u16) -> CommandFrame {
        CommandFrame {
            device: 0x31,
            command,
            aux1: (aux & 0xFF) as u8,
            aux2: (aux >> 8) as u8,
            cycles_per_bit: drive.profile().cycles_per_sio_bit,
        }
    }

    fn run_command(
        drive: &mut DriveEmulator,
        sched: &mut Scheduler,
        sio: &mut SioQueue,
        img: &mut RamDiskImage,
        command: u8,
        aux: u16,
    ) -> CmdResponse {
        let frame = frame_for(drive, command, aux);
        let mut mixer = NullMixer;
        let resp = send_command(drive, sched, sio, img, &mut mixer, frame);
        if resp == CmdResponse::Start {
            pump(drive, sched, sio, img, &mut mixer);
        }
        resp
    }

    #[test]
    fn scenario_a_status_with_no_disk() {
        let mut img = RamDiskImage::detached();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        let resp = run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x53, 0);
        assert_eq!(resp, CmdResponse::Start);

        assert_eq!(
            sio.control_bytes(),
            vec![WireEvent::Ack, WireEvent::Complete]
        );
        let frames = sio.data_frames();
        assert_eq!(frames.len(), 1);
        // not-ready masking applies: the 1050 reports the spindle empty
        let expected = [0x10u8, 0x7F, 0xE0, 0x00];
        assert_eq!(&frames[0][..4], &expected);
        assert_eq!(frames[0][4], crate::sio::sio_checksum(&expected));

        // response timing: ACK at its profile deadline, Complete a status
        // delay later
        let p = drive.profile();
        let ack_end = p.cycles_to_ack_sent.saturating_sub(p.cycles_per_sio_byte).max(1) as u64
            + p.cycles_per_sio_byte as u64;
        let complete_gap = (p.cycles_ack_stop_bit_to_status_complete - p.cycles_per_sio_bit
            + p.cycles_per_sio_byte) as u64;
        let ack_time = sio.wire[0].0;
        let complete_time = sio.wire[1].0;
        assert_eq!(ack_time, ack_end);
        assert_eq!(complete_time - ack_time, complete_gap);
    }

    #[test]
    fn scenario_b_read_sector_1_on_810() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(1, 0x41);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive810, &mut img);

        // 810 mechanisms park at end of travel; this read seeks back in
        assert_eq!(drive.current_track(), 39);

        let resp = run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 1);
        assert_eq!(resp, CmdResponse::Start);
        assert_eq!(
            sio.control_bytes(),
            vec![WireEvent::Ack, WireEvent::Complete]
        );

        let frames = sio.data_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 129);
        assert!(frames[0][..128].iter().all(|&b| b == 0x41));
        assert_eq!(drive.fdc_status(), 0xFF);
        assert_eq!(drive.last_attempt_count(), 1);
        assert_eq!(drive.current_track(), 0);
        assert!(!drive.is_command_active());
    }

    #[test]
    fn scenario_c_write_protect_reports_error_without_writing() {
        let mut img = RamDiskImage::single_density();
        img.set_write_enabled(false);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        sio.push_host_frame(vec![0xAA; 128], true);
        let resp = run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x50, 5);
        assert_eq!(resp, CmdResponse::Start);

        assert_eq!(
            sio.control_bytes(),
            vec![WireEvent::Ack, WireEvent::Ack, WireEvent::Error]
        );
        assert_eq!(drive.fdc_status(), 0xBF, "write-protect bit must drop");

        // the payload never reached the media
        img.set_write_enabled(true);
        let mut buf = [0u8; 128];
        let start = img.virt_sector_info(4).start_phys;
        img.read_phys_sector(start, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn scenario_d_xf551_format_forces_single_density() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Xf551, &mut img);

        // host asks for 26 sectors/track; the XF551 has no enhanced density
        assert!(drive.set_percom_data(&PercomBlock::enhanced_density().encode()));
        assert_eq!(*drive.percom(), PercomBlock::single_density());

        let resp = run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x21, 0);
        assert_eq!(resp, CmdResponse::Start);

        let last = sio.control_bytes().pop().unwrap();
        assert_eq!(last, WireEvent::Complete);
        assert_eq!(*drive.percom(), PercomBlock::single_density());
        assert_eq!(img.geometry().total_sector_count, 720);
        assert_eq!(img.geometry().sectors_per_track, 18);

        let frames = sio.data_frames();
        assert!(frames.last().unwrap()[..128].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn fast_and_accurate_reads_agree_on_outcome() {
        let run = |accurate: bool| {
            let mut img = RamDiskImage::single_density();
            img.fill_sector(30, 0x77);
            img.set_accurate_timing(accurate);
            let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);
            let t0 = sched.now();
            run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 30);
            (sio.data_frames(), drive.fdc_status(), sched.now() - t0)
        };

        let (acc_frames, acc_fdc, acc_elapsed) = run(true);
        let (fast_frames, fast_fdc, fast_elapsed) = run(false);

        assert_eq!(acc_frames, fast_frames);
        assert_eq!(acc_fdc, fast_fdc);
        assert!(
            fast_elapsed <= acc_elapsed,
            "fast mode took {fast_elapsed}, accurate {acc_elapsed}"
        );
    }

    #[test]
    fn phantom_copies_cycle_in_fast_mode() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(5, 0x01);
        img.add_phantom_copy(5, 0.3, 0xFF);
        img.add_phantom_copy(5, 0.6, 0xFF);
        // adding a copy relocates the span; address the live copies
        let vsi = img.virt_sector_info(4);
        img.sector_data_mut(vsi.start_phys + 1).fill(0x02);
        img.sector_data_mut(vsi.start_phys + 2).fill(0x03);
        img.set_accurate_timing(false);

        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        let mut seen = Vec::new();
        for _ in 0..4 {
            run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 5);
            seen.push(sio.data_frames().last().unwrap()[0]);
        }

        let mut first_three = seen[..3].to_vec();
        first_three.sort_unstable();
        assert_eq!(first_three, vec![0x01, 0x02, 0x03], "each copy seen once");
        assert_eq!(seen[3], seen[0], "cycle repeats");
    }

    #[test]
    fn retry_budget_1050_vs_810() {
        for (mode, expected_attempts) in [
            (DiskEmulationMode::Drive1050, 2),
            (DiskEmulationMode::Drive810, 4),
        ] {
            let mut img = RamDiskImage::single_density();
            img.remove_all_copies(3);
            let (mut drive, mut sched, mut sio) = rig(mode, &mut img);

            run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 3);

            assert_eq!(
                drive.last_attempt_count(),
                expected_attempts,
                "{mode:?} retry budget"
            );
            assert_eq!(sio.control_bytes(), vec![WireEvent::Ack, WireEvent::Error]);
            assert_eq!(drive.fdc_status(), 0xEF, "record not found");
        }
    }

    #[test]
    fn unsupported_commands_nak_without_ack() {
        // format-skewed on an 810, PERCOM on an 810, vendor commands on a
        // 1050: all rejected with a NAK
        for (mode, cmd) in [
            (DiskEmulationMode::Drive810, 0x66u8),
            (DiskEmulationMode::Drive810, 0x4E),
            (DiskEmulationMode::Drive1050, 0x48),
            (DiskEmulationMode::Drive1050, 0x3F),
        ] {
            let mut img = RamDiskImage::single_density();
            let (mut drive, mut sched, mut sio) = rig(mode, &mut img);
            let resp = run_command(&mut drive, &mut sched, &mut sio, &mut img, cmd, 0);
            assert_eq!(resp, CmdResponse::Start);
            assert_eq!(
                sio.control_bytes(),
                vec![WireEvent::Nak],
                "{mode:?} cmd {cmd:02X}"
            );
        }
    }

    #[test]
    fn nak_deadline_honors_both_clocks() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive810, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x66, 0);
        let p = drive.profile();
        // frame end and deassert were both stamped at t=0
        let nak_time = sio.wire[0].0;
        let deadline = p
            .cycles_to_nak_from_frame_end
            .max(p.cycles_to_nak_from_cmd_deassert) as u64;
        assert_eq!(nak_time, deadline + p.cycles_per_sio_byte as u64);
    }

    #[test]
    fn percom_validation_rejects_without_mutation() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, _sched, _sio) = rig(DiskEmulationMode::UsDoubler, &mut img);

        let before = *drive.percom();
        let mut bad = PercomBlock::single_density();
        bad.tracks = 0;
        assert!(!drive.set_percom_data(&bad.encode()));
        assert_eq!(*drive.percom(), before);

        let mut bad_size = PercomBlock::single_density();
        bad_size.bytes_per_sector = 64;
        assert!(!drive.set_percom_data(&bad_size.encode()));
        assert_eq!(*drive.percom(), before);

        assert!(drive.set_percom_data(&PercomBlock::double_density().encode()));
        assert_eq!(*drive.percom(), PercomBlock::double_density());
    }

    #[test]
    fn percom_read_command_returns_block() {
        let mut img = RamDiskImage::new(DiskGeometry::enhanced_density());
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::UsDoubler, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x4E, 0);

        let frames = sio.data_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..12], &drive.percom().encode());
        assert_eq!(drive.percom().sectors_per_track, 26);
    }

    #[test]
    fn write_percom_command_applies_block() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Speedy1050, &mut img);

        sio.push_host_frame(PercomBlock::double_density().encode().to_vec(), true);
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x4F, 0);

        assert_eq!(
            sio.control_bytes(),
            vec![WireEvent::Ack, WireEvent::Ack, WireEvent::Complete]
        );
        assert_eq!(*drive.percom(), PercomBlock::double_density());
    }

    #[test]
    fn write_command_commits_data() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        sio.push_host_frame(vec![0xA5; 128], true);
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x57, 10);

        assert_eq!(
            sio.control_bytes(),
            vec![WireEvent::Ack, WireEvent::Ack, WireEvent::Complete]
        );
        assert_eq!(drive.fdc_status(), 0xFF);

        let start = img.virt_sector_info(9).start_phys;
        let mut buf = [0u8; 128];
        img.read_phys_sector(start, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn write_data_checksum_failure_naks_data_frame() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        sio.push_host_frame(vec![0xA5; 128], false);
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x50, 10);

        assert_eq!(sio.control_bytes(), vec![WireEvent::Ack, WireEvent::Nak]);
        let start = img.virt_sector_info(9).start_phys;
        let mut buf = [0u8; 128];
        img.read_phys_sector(start, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn storage_error_surfaces_as_crc_failure() {
        let mut img = RamDiskImage::single_density();
        img.fail_next_read();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive810, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 1);

        assert_eq!(sio.control_bytes(), vec![WireEvent::Ack, WireEvent::Error]);
        assert_eq!(drive.fdc_status(), 0xFF & !0x08);
        // the zeroed FDC buffer still goes out
        assert_eq!(sio.data_frames()[0].len(), 129);
    }

    #[test]
    fn weak_sector_corrupts_tail_and_reports_long_sector() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(9, 0x55);
        let start = img.virt_sector_info(8).start_phys;
        img.phys_sector_mut(start).weak_data_offset = Some(64);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 9);

        // the 1050 exposes a hung long-sector read as lost data
        assert_eq!(drive.fdc_status(), 0xFF & !0x04);
        let frames = sio.data_frames();
        let data = &frames.last().unwrap()[..128];
        assert!(data[..64].iter().all(|&b| b == 0x55));
        assert!(data[64..].iter().any(|&b| b != 0x55));
    }

    #[test]
    fn weak_reads_differ_between_passes() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(9, 0x55);
        let start = img.virt_sector_info(8).start_phys;
        img.phys_sector_mut(start).weak_data_offset = Some(0);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive810, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 9);
        let first = sio.data_frames().last().unwrap().clone();
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 9);
        let second = sio.data_frames().last().unwrap().clone();
        assert_ne!(first, second, "LFSR state must evolve across reads");
    }

    #[test]
    fn no_disk_read_in_boot_range_reports_missing_sector() {
        let mut img = RamDiskImage::detached();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        let resp = run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 1);
        assert_eq!(resp, CmdResponse::Start);
        assert_eq!(sio.control_bytes(), vec![WireEvent::Ack, WireEvent::Error]);

        // out of boot range: NAK instead
        let mut sio2 = SioQueue::new();
        let resp = run_command(&mut drive, &mut sched, &mut sio2, &mut img, 0x52, 721);
        assert_eq!(resp, CmdResponse::Start);
        assert_eq!(sio2.control_bytes(), vec![WireEvent::Nak]);
    }

    #[test]
    fn format_medium_rebuilds_enhanced_density() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x22, 0);

        assert_eq!(sio.control_bytes().last(), Some(&WireEvent::Complete));
        assert_eq!(img.geometry().total_sector_count, 1040);
        assert_eq!(drive.percom().sectors_per_track, 26);
        assert!(img.geometry().mfm);
    }

    #[test]
    fn format_skewed_takes_percom_data_frame() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::UsDoubler, &mut img);

        let mut payload = vec![0u8; 128];
        payload[..12].copy_from_slice(&PercomBlock::enhanced_density().encode());
        sio.push_host_frame(payload, true);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x66, 0);

        assert_eq!(sio.control_bytes().last(), Some(&WireEvent::Complete));
        assert_eq!(img.geometry().total_sector_count, 1040);
    }

    #[test]
    fn format_rejected_when_write_protected() {
        let mut img = RamDiskImage::single_density();
        img.set_write_enabled(false);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x21, 0);
        assert_eq!(sio.control_bytes(), vec![WireEvent::Nak]);
    }

    #[test]
    fn high_speed_command_bit_is_honored() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(2, 0x22);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Xf551, &mut img);

        // bit 7 set: XF551 native high-speed read
        let resp = run_command(&mut drive, &mut sched, &mut sio, &mut img, 0xD2, 2);
        assert_eq!(resp, CmdResponse::Start);
        assert_eq!(
            sio.control_bytes(),
            vec![WireEvent::Ack, WireEvent::Complete]
        );
        assert!(sio.data_frames()[0][..128].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn wrong_rate_command_frame_is_not_handled() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        let mut frame = frame_for(&drive, 0x53, 0);
        frame.cycles_per_bit = 34; // US Doubler high-speed rate
        let mut mixer = NullMixer;
        let resp = send_command(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer, frame);
        assert_eq!(resp, CmdResponse::NotHandled);

        // the US Doubler accepts the same frame
        let (mut usd, mut sched2, mut sio2) = rig(DiskEmulationMode::UsDoubler, &mut img);
        let mut frame2 = frame_for(&usd, 0x53, 0);
        frame2.cycles_per_bit = 34;
        let resp2 = send_command(&mut usd, &mut sched2, &mut sio2, &mut img, &mut mixer, frame2);
        assert_eq!(resp2, CmdResponse::Start);
    }

    #[test]
    fn other_device_ids_are_ignored() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        let mut frame = frame_for(&drive, 0x53, 0);
        frame.device = 0x32; // drive 2
        let mut mixer = NullMixer;
        let resp = send_command(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer, frame);
        assert_eq!(resp, CmdResponse::NotHandled);
        assert_eq!(sio.pending_ops(), 0);
    }

    #[test]
    fn motor_spins_down_after_idle_timeout() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x53, 0);
        assert!(drive.is_motor_running());

        let mut mixer = NullMixer;
        let deadline = sched.now() + drive.profile().cycles_to_motor_off as u64 + 1;
        run_events_until(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer, deadline);
        assert!(!drive.is_motor_running());
        assert!(!img.motor_indicator);
    }

    #[test]
    fn abort_extends_motor_timeout_and_clears_command() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        let frame = frame_for(&drive, 0x52, 1);
        let mut mixer = NullMixer;
        send_command(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer, frame);
        assert!(drive.is_command_active());

        // transport kills the command mid-flight
        {
            let mut ctx = DriveContext {
                scheduler: &mut sched,
                sio: &mut sio,
                disk: &mut img,
                mixer: &mut mixer,
            };
            drive.on_serial_abort_command(&mut ctx);
        }
        assert!(!drive.is_command_active());
        assert!(drive.is_motor_running(), "timer re-armed, not dropped");
        assert_eq!(sio.pending_ops(), 0, "pending transfers flushed");
    }

    #[test]
    fn seek_emits_step_sounds_when_enabled() {
        #[derive(Default)]
        struct RecMixer(Vec<DriveSoundCue>);
        impl AudioMixer for RecMixer {
            fn queue_cue(&mut self, cue: DriveSoundCue, _delay: u32) {
                self.0.push(cue);
            }
        }

        let mut img = RamDiskImage::single_density();
        img.set_drive_sounds(true);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        let mut mixer = RecMixer::default();
        // sector 100 sits on track 5; the head starts at track 0
        let frame = frame_for(&drive, 0x52, 100);
        send_command(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer, frame);
        pump(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer);

        let steps = mixer
            .0
            .iter()
            .filter(|c| **c == DriveSoundCue::Step)
            .count();
        assert!(steps >= 5, "expected a step burst, saw {steps}");
    }

    #[test]
    fn track_buffering_skips_mechanical_delay_on_rereads() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(40, 0x11);
        img.fill_sector(41, 0x22);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Happy1050, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 40);
        let t0 = sched.now();
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 41);
        let buffered_elapsed = sched.now() - t0;

        // a buffered re-read of the same track beats one disk rotation
        assert!(
            buffered_elapsed < drive.profile().cycles_per_disk_rotation as u64,
            "buffered read took {buffered_elapsed}"
        );
        assert!(sio.data_frames()[1][..128].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn indus_gt_firmware_upload_switches_profile() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::IndusGt, &mut img);
        assert!(!drive.profile().supports_cmd_format_boot);

        let mut block = vec![0u8; 128];
        block[..2].copy_from_slice(b"SM");
        sio.push_host_frame(block, true);
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x58, 0);

        assert!(drive.profile().supports_cmd_format_boot);
        assert_eq!(drive.profile().high_speed_index, 10);
        assert_eq!(drive.profile().cycles_per_sio_bit_high_speed, 47);
    }

    #[test]
    fn happy_ram_window_round_trips() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Happy810, &mut img);

        sio.push_host_frame(vec![0x5C; 128], true);
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x50, 0x8002);
        assert_eq!(sio.control_bytes().last(), Some(&WireEvent::Complete));

        let mut sio2 = SioQueue::new();
        run_command(&mut drive, &mut sched, &mut sio2, &mut img, 0x52, 0x8002);
        assert!(sio2.data_frames()[0][..128].iter().all(|&b| b == 0x5C));
    }

    #[test]
    fn forced_phantom_override_wins() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(5, 0x01);
        let p2 = img.add_phantom_copy(5, 0.3, 0xFF);
        img.sector_data_mut(p2).fill(0x02);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        drive.set_forced_phantom(5, Some(1));
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x52, 5);
        assert_eq!(sio.data_frames()[0][0], 0x02);
    }

    #[test]
    fn save_load_resumes_mid_command_identically() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(12, 0x5A);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        // warm the motor so the restored run needs no spin-up bookkeeping
        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x53, 0);
        sio.wire.clear();

        let frame = frame_for(&drive, 0x52, 12);
        let mut mixer = NullMixer;
        send_command(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer, frame);

        // stop at the ACK fence: the transport queue is empty here
        let cb = sio.step(&mut sched);
        let Some(SioCallback::Fence(fence_id)) = cb else {
            panic!("expected ACK fence, got {cb:?}");
        };
        assert_eq!(sio.pending_ops(), 0);

        let saved = drive.save_state(&sched);
        let t_resume = sched.now();

        // original timeline
        {
            let mut ctx = DriveContext {
                scheduler: &mut sched,
                sio: &mut sio,
                disk: &mut img,
                mixer: &mut mixer,
            };
            drive.on_serial_fence(&mut ctx, fence_id);
        }
        pump(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer);
        let orig_fdc = drive.fdc_status();
        let orig_wire: Vec<(u64, WireEvent)> = sio
            .wire
            .iter()
            .skip(1) // the ACK predates the save point
            .map(|(t, e)| (t - t_resume, e.clone()))
            .collect();

        // restored timeline
        let mut drive2 = DriveEmulator::new(0);
        drive2.set_emulation_mode(DiskEmulationMode::Drive1050);
        let mut sched2 = Scheduler::new();
        let mut sio2 = SioQueue::new();
        drive2.load_state(&mut sched2, &mut img, &saved).unwrap();
        {
            let mut ctx = DriveContext {
                scheduler: &mut sched2,
                sio: &mut sio2,
                disk: &mut img,
                mixer: &mut mixer,
            };
            drive2.resume_loaded_command(&mut ctx);
        }
        pump(&mut drive2, &mut sched2, &mut sio2, &mut img, &mut mixer);

        assert_eq!(drive2.fdc_status(), orig_fdc);
        let restored_wire: Vec<(u64, WireEvent)> = sio2.wire.to_vec();
        assert_eq!(restored_wire.len(), orig_wire.len());
        for ((t1, e1), (t2, e2)) in orig_wire.iter().zip(&restored_wire) {
            assert_eq!(e1, e2);
            // the rotational fraction is stored as f32; allow a cycle or
            // two of quantization
            assert!(t1.abs_diff(*t2) <= 4, "event at {t1} vs {t2}");
        }
    }

    #[test]
    fn load_state_rejects_corrupt_blobs() {
        let mut img = RamDiskImage::single_density();
        let (drive, sched, _sio) = rig(DiskEmulationMode::Drive1050, &mut img);

        let mut st = drive.save_state(&sched);
        st.idle_timer_remaining = Some(u64::MAX);

        let mut drive2 = DriveEmulator::new(0);
        let mut sched2 = Scheduler::new();
        assert!(matches!(
            drive2.load_state(&mut sched2, &mut img, &st),
            Err(SaveStateError::InvalidIdleTimer(_))
        ));
    }

    #[test]
    fn accel_path_reads_and_writes_synchronously() {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(7, 0x99);
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Drive810, &mut img);
        let mut mixer = NullMixer;

        let mut buf = [0u8; 128];
        let mut ctx = DriveContext {
            scheduler: &mut sched,
            sio: &mut sio,
            disk: &mut img,
            mixer: &mut mixer,
        };
        let status = drive.on_serial_accel_command(
            &mut ctx,
            AccelRequest::Read {
                sector: 7,
                out: &mut buf,
            },
        );
        assert_eq!(status, SIO_SUCCESS);
        assert!(buf.iter().all(|&b| b == 0x99));

        let status = drive.on_serial_accel_command(
            &mut ctx,
            AccelRequest::Read {
                sector: 0,
                out: &mut buf,
            },
        );
        assert_eq!(status, SIO_DEVICE_NAK);

        let status = drive.on_serial_accel_command(
            &mut ctx,
            AccelRequest::Write {
                sector: 8,
                data: &[0x42; 128],
            },
        );
        assert_eq!(status, SIO_SUCCESS);

        let status = drive.on_serial_accel_command(
            &mut ctx,
            AccelRequest::Write {
                sector: 8,
                data: &[0x42; 64],
            },
        );
        assert_eq!(status, SIO_CHECKSUM_ERROR);
    }

    #[test]
    fn get_high_speed_index_reports_profile_divisor() {
        let mut img = RamDiskImage::single_density();
        let (mut drive, mut sched, mut sio) = rig(DiskEmulationMode::Speedy1050, &mut img);

        run_command(&mut drive, &mut sched, &mut sio, &mut img, 0x3F, 0);
        let frames = sio.data_frames();
        assert_eq!(frames[0][0], 9);
    }
}
