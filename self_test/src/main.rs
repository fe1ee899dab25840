use emusio::disksound::NullMixer;
use emusio::drive::{DriveContext, DriveEmulator, pump, run_events_until, send_command};
use emusio::image::{DiskInterface, RamDiskImage};
use emusio::percom::PercomBlock;
use emusio::profile::{ALL_MODES, DiskEmulationMode, get_profile};
use emusio::scheduler::Scheduler;
use emusio::sio::{CmdResponse, CommandFrame, SioQueue, WireEvent};
use std::error::Error;
use std::io::{self, Write};

struct Rig {
    drive: DriveEmulator,
    sched: Scheduler,
    sio: SioQueue,
    img: RamDiskImage,
    mixer: NullMixer,
}

impl Rig {
    fn new(mode: DiskEmulationMode, img: RamDiskImage) -> Self {
        let mut rig = Rig {
            drive: DriveEmulator::new(0),
            sched: Scheduler::new(),
            sio: SioQueue::new(),
            img,
            mixer: NullMixer,
        };
        rig.drive.set_emulation_mode(mode);
        rig.drive.set_randomization_seed(7);
        let mut ctx = DriveContext {
            scheduler: &mut rig.sched,
            sio: &mut rig.sio,
            disk: &mut rig.img,
            mixer: &mut rig.mixer,
        };
        rig.drive.init(&mut ctx);
        rig
    }

    fn command(&mut self, command: u8, aux: u16) -> CmdResponse {
        let frame = CommandFrame {
            device: 0x31,
            command,
            aux1: (aux & 0xFF) as u8,
            aux2: (aux >> 8) as u8,
            cycles_per_bit: self.drive.profile().cycles_per_sio_bit,
        };
        let resp = send_command(
            &mut self.drive,
            &mut self.sched,
            &mut self.sio,
            &mut self.img,
            &mut self.mixer,
            frame,
        );
        if resp == CmdResponse::Start {
            pump(
                &mut self.drive,
                &mut self.sched,
                &mut self.sio,
                &mut self.img,
                &mut self.mixer,
            );
        }
        resp
    }

    fn settle_motor(&mut self) {
        let deadline = self.sched.now() + self.drive.profile().cycles_to_motor_off as u64 + 1;
        run_events_until(
            &mut self.drive,
            &mut self.sched,
            &mut self.sio,
            &mut self.img,
            &mut self.mixer,
            deadline,
        );
    }
}

fn check(name: &str, ok: bool, failures: &mut u32) {
    let mut out = io::stderr();
    let _ = writeln!(out, "  [{}] {name}", if ok { "PASS" } else { "FAIL" });
    if !ok {
        *failures += 1;
    }
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();
    let mut out = io::stderr();
    let mut failures = 0u32;
    let started = std::time::Instant::now();

    writeln!(out, "profile table:")?;
    for mode in ALL_MODES {
        let p = get_profile(mode);
        let ok = p.cycles_to_fdc_command == p.cycles_to_ack_sent + 5756;
        check(&format!("{mode:?} FDC command delay"), ok, &mut failures);
    }

    writeln!(out, "scenario A: status, 1050, no disk:")?;
    {
        let mut rig = Rig::new(DiskEmulationMode::Drive1050, RamDiskImage::detached());
        let resp = rig.command(0x53, 0);
        check("start accepted", resp == CmdResponse::Start, &mut failures);
        let frames = rig.sio.data_frames();
        check(
            "status bytes",
            frames.len() == 1 && frames[0][1] == 0x7F && frames[0][2] == 0xE0,
            &mut failures,
        );
    }

    writeln!(out, "scenario B: read sector 1, 810, accurate:")?;
    {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(1, 0x41);
        let mut rig = Rig::new(DiskEmulationMode::Drive810, img);
        let t0 = rig.sched.now();
        rig.command(0x52, 1);
        let elapsed = rig.sched.now() - t0;
        check("fdc clean", rig.drive.fdc_status() == 0xFF, &mut failures);
        check(
            "payload",
            rig.sio.data_frames()[0][..128].iter().all(|&b| b == 0x41),
            &mut failures,
        );
        writeln!(out, "    accurate read elapsed: {elapsed:>9} cycles")?;
        rig.settle_motor();
        check("motor idled down", !rig.drive.is_motor_running(), &mut failures);
    }

    writeln!(out, "scenario C: write-protected write:")?;
    {
        let mut img = RamDiskImage::single_density();
        img.set_write_enabled(false);
        let mut rig = Rig::new(DiskEmulationMode::Drive1050, img);
        rig.sio.push_host_frame(vec![0xAA; 128], true);
        rig.command(0x50, 5);
        check("fdc write protect", rig.drive.fdc_status() == 0xBF, &mut failures);
        check(
            "error byte",
            rig.sio.control_bytes().last() == Some(&WireEvent::Error),
            &mut failures,
        );
    }

    writeln!(out, "scenario D: XF551 format override:")?;
    {
        let mut rig = Rig::new(DiskEmulationMode::Xf551, RamDiskImage::single_density());
        rig.drive
            .set_percom_data(&PercomBlock::enhanced_density().encode());
        rig.command(0x21, 0);
        check(
            "forced single density",
            *rig.drive.percom() == PercomBlock::single_density(),
            &mut failures,
        );
    }

    writeln!(out, "retry budgets:")?;
    for (mode, want) in [
        (DiskEmulationMode::Drive1050, 2u8),
        (DiskEmulationMode::Drive810, 4u8),
    ] {
        let mut img = RamDiskImage::single_density();
        img.remove_all_copies(3);
        let mut rig = Rig::new(mode, img);
        rig.command(0x52, 3);
        check(
            &format!("{mode:?} attempts {want}"),
            rig.drive.last_attempt_count() == want,
            &mut failures,
        );
    }

    writeln!(out, "phantom cycling (fast mode):")?;
    {
        let mut img = RamDiskImage::single_density();
        img.fill_sector(5, 0x01);
        img.add_phantom_copy(5, 0.4, 0xFF);
        let vsi = img.virt_sector_info(4);
        img.sector_data_mut(vsi.start_phys + 1).fill(0x02);
        img.set_accurate_timing(false);
        let mut rig = Rig::new(DiskEmulationMode::Drive1050, img);
        rig.command(0x52, 5);
        rig.command(0x52, 5);
        rig.command(0x52, 5);
        let frames = rig.sio.data_frames();
        let seq: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        check(
            "copies alternate",
            seq.len() == 3 && seq[0] != seq[1] && seq[2] == seq[0],
            &mut failures,
        );
    }

    let elapsed = started.elapsed().as_millis();
    writeln!(out, "Elapsed time: {elapsed:>6} ms")?;
    writeln!(out, "Failures:     {failures:>6}")?;

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
