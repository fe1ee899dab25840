use thiserror::Error;

use crate::percom::PercomBlock;

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

/// Backing-store failure from the image layer. The command state machine
/// maps any of these to a CRC-error FDC status; they never escape it.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("physical sector {0} out of range")]
    SectorOutOfRange(u32),
    #[error("backing store is read-only")]
    ReadOnly,
    #[error("backing store I/O failure: {0}")]
    Io(String),
}

/// Mounted-image geometry, recomputed whenever the image changes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct DiskGeometry {
    pub sector_size: u16,
    pub boot_sector_count: u8,
    pub total_sector_count: u16,
    pub sectors_per_track: u16,
    pub track_count: u16,
    pub side_count: u8,
    pub mfm: bool,
    /// 26 sectors/track enhanced-density layout.
    pub high_density: bool,
}

impl DiskGeometry {
    pub fn single_density() -> Self {
        DiskGeometry {
            sector_size: 128,
            boot_sector_count: 3,
            total_sector_count: 720,
            sectors_per_track: 18,
            track_count: 40,
            side_count: 1,
            mfm: false,
            high_density: false,
        }
    }

    pub fn enhanced_density() -> Self {
        DiskGeometry {
            sector_size: 128,
            boot_sector_count: 3,
            total_sector_count: 1040,
            sectors_per_track: 26,
            track_count: 40,
            side_count: 1,
            mfm: true,
            high_density: true,
        }
    }

    pub fn double_density() -> Self {
        DiskGeometry {
            sector_size: 256,
            boot_sector_count: 3,
            total_sector_count: 720,
            sectors_per_track: 18,
            track_count: 40,
            side_count: 1,
            mfm: true,
            high_density: false,
        }
    }

    pub fn from_percom(p: &PercomBlock) -> Self {
        let total = p.total_sectors().min(65_535) as u16;
        DiskGeometry {
            sector_size: p.bytes_per_sector,
            boot_sector_count: if p.bytes_per_sector <= 256 { 3 } else { 0 },
            total_sector_count: total,
            sectors_per_track: p.sectors_per_track,
            track_count: p.tracks as u16,
            side_count: p.side_count,
            mfm: p.mfm,
            high_density: p.sectors_per_track >= 26,
        }
    }

    pub fn to_percom(&self) -> PercomBlock {
        PercomBlock {
            tracks: self.track_count.min(255) as u8,
            step_rate: 1,
            sectors_per_track: self.sectors_per_track,
            side_count: self.side_count,
            mfm: self.mfm,
            bytes_per_sector: self.sector_size,
            online: true,
        }
    }
}

/// One logical (virtual) sector: the span of physical recordings answering
/// to its address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VirtSectorInfo {
    pub start_phys: u32,
    pub num_phys: u32,
}

/// One physical recording of a sector.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PhysSectorInfo {
    pub size: u16,
    /// Inverted FDC status byte as recorded in the image; 0xFF is clean.
    pub fdc_status: u8,
    /// Angular position as a fraction of a rotation.
    pub rot_pos: f32,
    pub mfm: bool,
    /// Address field present but no data field (readable address, missing
    /// record).
    pub missing_data: bool,
    /// Address field unreadable; such copies only contribute an address-CRC
    /// classification, never data.
    pub address_invalid: bool,
    /// Byte offset past which reads pick up weak-bit noise.
    pub weak_data_offset: Option<u16>,
}

/// Contract presented by the disk image/filesystem layer. The drive core
/// only ever references the mounted image through this trait.
pub trait DiskInterface {
    fn image_attached(&self) -> bool;
    fn geometry(&self) -> DiskGeometry;
    /// `index` is the zero-based virtual sector number (sector 1 is index 0).
    fn virt_sector_info(&self, index: u32) -> VirtSectorInfo;
    fn phys_sector_info(&self, index: u32) -> PhysSectorInfo;
    fn read_phys_sector(&mut self, index: u32, buf: &mut [u8]) -> Result<usize, StorageError>;
    fn write_phys_sector(&mut self, index: u32, data: &[u8]) -> Result<(), StorageError>;
    fn format(&mut self, geometry: &DiskGeometry) -> Result<(), StorageError>;

    fn is_write_enabled(&self) -> bool;
    fn is_format_enabled(&self) -> bool;
    fn is_accurate_timing_enabled(&self) -> bool;
    fn are_drive_sounds_enabled(&self) -> bool;

    fn sector_breakpoint(&self) -> Option<u16> {
        None
    }
    fn set_activity(&mut self, _on: bool) {}
    fn set_motor_indicator(&mut self, _on: bool) {}
}

// Classic sector interleave orders; rotational positions of a freshly
// formatted track follow these.
pub const TRACK_INTERLEAVE_18: [u16; 18] =
    [17, 8, 16, 7, 15, 6, 14, 5, 13, 4, 12, 3, 11, 2, 10, 1, 9, 0];

pub const TRACK_INTERLEAVE_DD: [u16; 18] =
    [15, 12, 9, 6, 3, 0, 16, 13, 10, 7, 4, 1, 17, 14, 11, 8, 5, 2];

pub const TRACK_INTERLEAVE_26: [u16; 26] = [
    0, 13, 1, 14, 2, 15, 3, 16, 4, 17, 5, 18, 6, 19, 7, 20, 8, 21, 9, 22, 10, 23, 11, 24, 12, 25,
];

fn interleave_pos(geometry: &DiskGeometry, index: u32) -> f32 {
    let spt = geometry.sectors_per_track as u32;
    let slot = (index % spt) as usize;
    if geometry.high_density {
        TRACK_INTERLEAVE_26[slot] as f32 / 26.0
    } else if geometry.sector_size >= 256 {
        TRACK_INTERLEAVE_DD[slot] as f32 / 18.0
    } else {
        TRACK_INTERLEAVE_18[slot] as f32 / 18.0
    }
}

/// Memory-backed disk image with phantom-copy and weak-bit injection hooks.
/// Serves as the concrete image layer for tests and the self-test binary.
pub struct RamDiskImage {
    attached: bool,
    geometry: DiskGeometry,
    virt: Vec<VirtSectorInfo>,
    phys: Vec<PhysSectorInfo>,
    data: Vec<Vec<u8>>,
    write_enabled: bool,
    format_enabled: bool,
    accurate_timing: bool,
    drive_sounds: bool,
    breakpoint: Option<u16>,
    fail_next_read: bool,
    pub activity: bool,
    pub motor_indicator: bool,
}

impl RamDiskImage {
    pub fn new(geometry: DiskGeometry) -> Self {
        let mut img = RamDiskImage {
            attached: true,
            geometry,
            virt: Vec::new(),
            phys: Vec::new(),
            data: Vec::new(),
            write_enabled: true,
            format_enabled: true,
            accurate_timing: true,
            drive_sounds: false,
            breakpoint: None,
            fail_next_read: false,
            activity: false,
            motor_indicator: false,
        };
        img.build_sector_tables();
        img
    }

    pub fn single_density() -> Self {
        Self::new(DiskGeometry::single_density())
    }

    pub fn detached() -> Self {
        let mut img = Self::new(DiskGeometry::single_density());
        img.attached = false;
        img.virt.clear();
        img.phys.clear();
        img.data.clear();
        img
    }

    fn build_sector_tables(&mut self) {
        let g = self.geometry;
        let total = g.total_sector_count as u32;
        self.virt.clear();
        self.phys.clear();
        self.data.clear();

        for i in 0..total {
            let size = if i < g.boot_sector_count as u32 {
                128
            } else {
                g.sector_size
            };
            self.virt.push(VirtSectorInfo {
                start_phys: i,
                num_phys: 1,
            });
            self.phys.push(PhysSectorInfo {
                size,
                fdc_status: 0xFF,
                rot_pos: interleave_pos(&g, i),
                mfm: g.mfm,
                missing_data: false,
                address_invalid: false,
                weak_data_offset: None,
            });
            self.data.push(vec![0u8; size as usize]);
        }
    }

    /// Append a phantom copy of a virtual sector at a distinct angular
    /// position. Copies must be added in descending virtual-sector order or
    /// to the highest sector only if contiguity is to be preserved; tests
    /// use it on arbitrary sectors by relocating the span to the end.
    pub fn add_phantom_copy(&mut self, sector: u16, rot_pos: f32, fdc_status: u8) -> u32 {
        let vidx = (sector - 1) as usize;
        let vsi = self.virt[vidx];

        // Relocate the copy span to the end of the physical table so it
        // stays contiguous.
        let mut span: Vec<(PhysSectorInfo, Vec<u8>)> = Vec::new();
        for i in 0..vsi.num_phys {
            let p = (vsi.start_phys + i) as usize;
            span.push((self.phys[p], self.data[p].clone()));
        }

        let new_start = self.phys.len() as u32;
        for (info, bytes) in &span {
            self.phys.push(*info);
            self.data.push(bytes.clone());
        }

        let size = span[0].0.size;
        self.phys.push(PhysSectorInfo {
            size,
            fdc_status,
            rot_pos,
            mfm: self.geometry.mfm,
            missing_data: false,
            address_invalid: false,
            weak_data_offset: None,
        });
        self.data.push(vec![0u8; size as usize]);

        self.virt[vidx] = VirtSectorInfo {
            start_phys: new_start,
            num_phys: vsi.num_phys + 1,
        };
        new_start + vsi.num_phys
    }

    pub fn remove_all_copies(&mut self, sector: u16) {
        let vidx = (sector - 1) as usize;
        self.virt[vidx].num_phys = 0;
    }

    pub fn phys_sector_mut(&mut self, index: u32) -> &mut PhysSectorInfo {
        &mut self.phys[index as usize]
    }

    pub fn sector_data_mut(&mut self, index: u32) -> &mut Vec<u8> {
        &mut self.data[index as usize]
    }

    pub fn fill_sector(&mut self, sector: u16, value: u8) {
        let start = self.virt[(sector - 1) as usize].start_phys as usize;
        for b in self.data[start].iter_mut() {
            *b = value;
        }
    }

    pub fn set_write_enabled(&mut self, on: bool) {
        self.write_enabled = on;
    }

    pub fn set_format_enabled(&mut self, on: bool) {
        self.format_enabled = on;
    }

    pub fn set_accurate_timing(&mut self, on: bool) {
        self.accurate_timing = on;
    }

    pub fn set_drive_sounds(&mut self, on: bool) {
        self.drive_sounds = on;
    }

    pub fn set_breakpoint(&mut self, sector: Option<u16>) {
        self.breakpoint = sector;
    }

    pub fn fail_next_read(&mut self) {
        self.fail_next_read = true;
    }
}

impl DiskInterface for RamDiskImage {
    fn image_attached(&self) -> bool {
        self.attached
    }

    fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    fn virt_sector_info(&self, index: u32) -> VirtSectorInfo {
        self.virt
            .get(index as usize)
            .copied()
            .unwrap_or(VirtSectorInfo {
                start_phys: 0,
                num_phys: 0,
            })
    }

    fn phys_sector_info(&self, index: u32) -> PhysSectorInfo {
        self.phys[index as usize]
    }

    fn read_phys_sector(&mut self, index: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        if self.fail_next_read {
            self.fail_next_read = false;
            return Err(StorageError::Io("injected read failure".into()));
        }
        let data = self
            .data
            .get(index as usize)
            .ok_or(StorageError::SectorOutOfRange(index))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn write_phys_sector(&mut self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        if !self.write_enabled {
            return Err(StorageError::ReadOnly);
        }
        let dst = self
            .data
            .get_mut(index as usize)
            .ok_or(StorageError::SectorOutOfRange(index))?;
        let n = dst.len().min(data.len());
        dst[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn format(&mut self, geometry: &DiskGeometry) -> Result<(), StorageError> {
        if !self.format_enabled {
            return Err(StorageError::ReadOnly);
        }
        self.attached = true;
        self.geometry = *geometry;
        self.build_sector_tables();
        Ok(())
    }

    fn is_write_enabled(&self) -> bool {
        self.write_enabled
    }

    fn is_format_enabled(&self) -> bool {
        self.format_enabled
    }

    fn is_accurate_timing_enabled(&self) -> bool {
        self.accurate_timing
    }

    fn are_drive_sounds_enabled(&self) -> bool {
        self.drive_sounds
    }

    fn sector_breakpoint(&self) -> Option<u16> {
        self.breakpoint
    }

    fn set_activity(&mut self, on: bool) {
        self.activity = on;
    }

    fn set_motor_indicator(&mut self, on: bool) {
        self.motor_indicator = on;
    }
}
