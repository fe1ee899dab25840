use criterion::{Criterion, criterion_group, criterion_main};
use emusio::disksound::NullMixer;
use emusio::drive::{DriveContext, DriveEmulator, pump, send_command};
use emusio::image::RamDiskImage;
use emusio::profile::DiskEmulationMode;
use emusio::rotation::RotationalModel;
use emusio::scheduler::Scheduler;
use emusio::sio::{CommandFrame, SioQueue};
use std::time::Duration;

fn bench_disk(c: &mut Criterion) {
    let mut group = c.benchmark_group("emusio");
    let significance_level = 0.05;
    let duration = 10;
    let sample_size = 200;
    group
        .significance_level(significance_level)
        .confidence_level(1.0 - significance_level)
        .measurement_time(Duration::new(duration, 0))
        .sample_size(sample_size);

    group.bench_function("rotation_advance", |b| {
        b.iter(|| {
            let mut r = RotationalModel::new(372_869);
            let mut t = 0u64;
            for _ in 0..10_000 {
                t += 1234;
                r.advance_to(t, true);
            }
            r.counter()
        })
    });

    group.bench_function("read_sector_accurate", |b| {
        b.iter(|| {
            let mut img = RamDiskImage::single_density();
            img.fill_sector(100, 0x42);
            let mut drive = DriveEmulator::new(0);
            drive.set_emulation_mode(DiskEmulationMode::Drive1050);
            let mut sched = Scheduler::new();
            let mut sio = SioQueue::new();
            let mut mixer = NullMixer;
            {
                let mut ctx = DriveContext {
                    scheduler: &mut sched,
                    sio: &mut sio,
                    disk: &mut img,
                    mixer: &mut mixer,
                };
                drive.init(&mut ctx);
            }
            let frame = CommandFrame {
                device: 0x31,
                command: 0x52,
                aux1: 100,
                aux2: 0,
                cycles_per_bit: drive.profile().cycles_per_sio_bit,
            };
            send_command(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer, frame);
            pump(&mut drive, &mut sched, &mut sio, &mut img, &mut mixer);
            drive.fdc_status()
        })
    });
}

criterion_group!(benches, bench_disk);

criterion_main!(benches);
