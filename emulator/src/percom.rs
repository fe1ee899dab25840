#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

pub const PERCOM_BLOCK_LEN: usize = 12;

/// 12-byte disk geometry descriptor exchanged over the read/write PERCOM
/// commands: tracks, step rate, sectors/track, sides, FM/MFM encoding and
/// bytes/sector, plus a drive-online marker.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct PercomBlock {
    pub tracks: u8,
    pub step_rate: u8,
    pub sectors_per_track: u16,
    /// Encoded as sides-1 on the wire.
    pub side_count: u8,
    pub mfm: bool,
    pub bytes_per_sector: u16,
    pub online: bool,
}

impl PercomBlock {
    /// 40 track x 18 sector x 128 byte FM single density.
    pub fn single_density() -> Self {
        PercomBlock {
            tracks: 40,
            step_rate: 1,
            sectors_per_track: 18,
            side_count: 1,
            mfm: false,
            bytes_per_sector: 128,
            online: true,
        }
    }

    /// 40 track x 26 sector x 128 byte MFM enhanced (medium) density.
    pub fn enhanced_density() -> Self {
        PercomBlock {
            tracks: 40,
            step_rate: 1,
            sectors_per_track: 26,
            side_count: 1,
            mfm: true,
            bytes_per_sector: 128,
            online: true,
        }
    }

    /// 40 track x 18 sector x 256 byte MFM double density.
    pub fn double_density() -> Self {
        PercomBlock {
            tracks: 40,
            step_rate: 1,
            sectors_per_track: 18,
            side_count: 1,
            mfm: true,
            bytes_per_sector: 256,
            online: true,
        }
    }

    /// XF551 double-sided double density (1440 sectors).
    pub fn xf551_dsdd() -> Self {
        PercomBlock {
            side_count: 2,
            ..Self::double_density()
        }
    }

    pub fn total_sectors(&self) -> u32 {
        self.tracks as u32 * self.sectors_per_track as u32 * self.side_count as u32
    }

    pub fn encode(&self) -> [u8; PERCOM_BLOCK_LEN] {
        [
            self.tracks,
            self.step_rate,
            (self.sectors_per_track >> 8) as u8,
            (self.sectors_per_track & 0xFF) as u8,
            self.side_count.saturating_sub(1),
            if self.mfm { 0x04 } else { 0x00 },
            (self.bytes_per_sector >> 8) as u8,
            (self.bytes_per_sector & 0xFF) as u8,
            if self.online { 0xFF } else { 0x00 },
            0,
            0,
            0,
        ]
    }

    pub fn decode(data: &[u8]) -> Option<PercomBlock> {
        if data.len() < PERCOM_BLOCK_LEN {
            return None;
        }
        Some(PercomBlock {
            tracks: data[0],
            step_rate: data[1],
            sectors_per_track: ((data[2] as u16) << 8) | data[3] as u16,
            side_count: data[4].wrapping_add(1),
            mfm: data[5] & 0x04 != 0,
            bytes_per_sector: ((data[6] as u16) << 8) | data[7] as u16,
            online: data[8] != 0,
        })
    }

    /// Strict geometry validation applied by most PERCOM-capable firmwares.
    pub fn validate(&self) -> bool {
        if self.tracks == 0 || self.sectors_per_track == 0 {
            return false;
        }
        // wire encoding is sides-1, and only 0/1 are representable
        if self.side_count == 0 || self.side_count > 2 {
            return false;
        }
        if self.total_sectors() > 65_535 {
            return false;
        }
        matches!(self.bytes_per_sector, 128 | 256 | 512 | 8192)
    }

    /// XF551 firmware never rejects a PERCOM block; it pattern-matches the
    /// request onto one of the drive's three supported geometries. An
    /// enhanced-density request is forced back to single density.
    pub fn normalize_xf551(&self) -> PercomBlock {
        if self.bytes_per_sector >= 256 {
            if self.side_count >= 2 {
                Self::xf551_dsdd()
            } else {
                Self::double_density()
            }
        } else {
            Self::single_density()
        }
    }
}

impl Default for PercomBlock {
    fn default() -> Self {
        Self::single_density()
    }
}
