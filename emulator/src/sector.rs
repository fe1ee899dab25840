use crate::image::DiskInterface;

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

// Inverted FDC status byte values produced when no physical copy answers.
const FDC_RECORD_NOT_FOUND: u8 = 0xEF;
const FDC_ADDRESS_CRC: u8 = 0xF7;

/// Outcome of resolving a logical sector to one physical recording.
#[derive(Clone, Copy, Debug)]
pub struct SectorSelection {
    /// Physical sector index, or `None` when the FDC gives up.
    pub phys: Option<u32>,
    /// Inverted FDC status for the selection (clean copies report 0xFF).
    pub fdc_status: u8,
    /// Cycles of rotational wait from the post-seek position to the chosen
    /// copy's address mark. Zero when nothing was found.
    pub rotational_delay: u32,
    /// Every copy had an unreadable address field.
    pub address_crc_only: bool,
}

/// Pick the physical copy of virtual sector `index` that answers this read
/// or write attempt.
///
/// Accurate mode models the FDC search: among density-matched copies with a
/// readable address (and, for reads, a present data field), the one with
/// the least rotational wait from `post_seek_counter` wins; the first
/// minimum found is kept on exact ties. Fast mode cycles deterministically
/// through the copies instead. Either way the per-sector phantom counter
/// advances afterward, so the next access sees the next copy.
#[allow(clippy::too_many_arguments)]
pub fn select_physical(
    disk: &dyn DiskInterface,
    index: u32,
    post_seek_counter: u32,
    cycles_per_rotation: u32,
    accurate: bool,
    mfm: bool,
    for_write: bool,
    phantom_counter: &mut u8,
    forced_order: Option<u8>,
) -> SectorSelection {
    let vsi = disk.virt_sector_info(index);

    if vsi.num_phys == 0 {
        return SectorSelection {
            phys: None,
            fdc_status: FDC_RECORD_NOT_FOUND,
            rotational_delay: 0,
            address_crc_only: false,
        };
    }

    let advance = |ctr: &mut u8| {
        *ctr = (*ctr + 1) % vsi.num_phys.max(1) as u8;
    };

    let delay_to = |rot_pos: f32| -> u32 {
        let time = (rot_pos * cycles_per_rotation as f32 + 0.5) as u32 % cycles_per_rotation;
        if time < post_seek_counter {
            time + cycles_per_rotation - post_seek_counter
        } else {
            time - post_seek_counter
        }
    };

    let mut best: Option<(u32, u32, u8)> = None; // (delay, phys, status)
    let mut usable_copies = 0u32;
    let mut invalid_address_copies = 0u32;

    for i in 0..vsi.num_phys {
        let phys = vsi.start_phys + i;
        let psi = disk.phys_sector_info(phys);

        if psi.mfm != mfm {
            continue;
        }
        if psi.address_invalid {
            invalid_address_copies += 1;
            continue;
        }
        if for_write && psi.missing_data {
            // address match is all a write needs
        } else if psi.missing_data {
            continue;
        }

        usable_copies += 1;

        if forced_order == Some(i as u8) {
            advance(phantom_counter);
            return SectorSelection {
                phys: Some(phys),
                fdc_status: psi.fdc_status,
                rotational_delay: delay_to(psi.rot_pos),
                address_crc_only: false,
            };
        }

        if accurate {
            let delay = delay_to(psi.rot_pos);
            if best.is_none_or(|(d, _, _)| delay < d) {
                best = Some((delay, phys, psi.fdc_status));
            }
        }
    }

    if usable_copies == 0 {
        advance(phantom_counter);
        // All copies density-mismatched or unreadable. If every one of them
        // had a bad address field, the FDC reports a CRC error in the
        // address, not a plain record-not-found.
        let all_bad_address = invalid_address_copies == vsi.num_phys;
        return SectorSelection {
            phys: None,
            fdc_status: if all_bad_address {
                FDC_ADDRESS_CRC
            } else {
                FDC_RECORD_NOT_FOUND
            },
            rotational_delay: 0,
            address_crc_only: all_bad_address,
        };
    }

    if accurate {
        let (delay, phys, status) = best.unwrap();
        advance(phantom_counter);
        SectorSelection {
            phys: Some(phys),
            fdc_status: status,
            rotational_delay: delay,
            address_crc_only: false,
        }
    } else {
        // Fast mode: rotate through the copies so successive reads of a
        // phantom sector return successive recordings.
        let pick = (*phantom_counter as u32) % vsi.num_phys;
        advance(phantom_counter);
        let phys = vsi.start_phys + pick;
        let psi = disk.phys_sector_info(phys);
        SectorSelection {
            phys: Some(phys),
            fdc_status: psi.fdc_status,
            rotational_delay: delay_to(psi.rot_pos),
            address_crc_only: false,
        }
    }
}

/// 32-bit weak-bit noise generator with taps at bits 31 and 3, clocked a
/// byte at a time. One instance lives per drive unit; its state persists
/// and evolves across reads, so repeated reads of a weak region differ
/// deterministically.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct WeakBitLfsr {
    state: u32,
}

impl WeakBitLfsr {
    pub fn new(seed: u32) -> Self {
        WeakBitLfsr {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    pub fn next_byte(&mut self) -> u8 {
        let mut out = 0u8;
        for _ in 0..8 {
            let bit = ((self.state >> 31) ^ (self.state >> 3)) & 1;
            self.state = (self.state << 1) | bit;
            out = (out << 1) | bit as u8;
        }
        out
    }

    /// XOR weak-bit noise over everything at and past `offset`.
    pub fn corrupt(&mut self, buf: &mut [u8], offset: usize) {
        if offset >= buf.len() {
            return;
        }
        for b in &mut buf[offset..] {
            *b ^= self.next_byte();
        }
    }

    pub fn state(&self) -> u32 {
        self.state
    }

    pub fn set_state(&mut self, state: u32) {
        self.state = if state == 0 { 1 } else { state };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::RamDiskImage;

    const PERIOD: u32 = 372_869;

    fn select(
        img: &RamDiskImage,
        sector: u16,
        counter: &mut u8,
        accurate: bool,
        post_seek: u32,
    ) -> SectorSelection {
        select_physical(
            img,
            (sector - 1) as u32,
            post_seek,
            PERIOD,
            accurate,
            false,
            false,
            counter,
            None,
        )
    }

    #[test]
    fn fast_mode_cycles_through_all_copies() {
        let mut img = RamDiskImage::single_density();
        img.add_phantom_copy(5, 0.2, 0xFF);
        img.add_phantom_copy(5, 0.7, 0xFF);

        let mut ctr = 0u8;
        let mut seen = Vec::new();
        for _ in 0..6 {
            let sel = select(&img, 5, &mut ctr, false, 0);
            seen.push(sel.phys.unwrap());
        }
        // three copies, visited cyclically, each exactly once per period
        assert_eq!(seen[0..3].to_vec(), {
            let mut v = seen[0..3].to_vec();
            v.sort_unstable();
            v.dedup();
            v
        });
        assert_eq!(seen[0], seen[3]);
        assert_eq!(seen[1], seen[4]);
        assert_eq!(seen[2], seen[5]);
    }

    #[test]
    fn accurate_mode_picks_minimum_wait() {
        let mut img = RamDiskImage::single_density();
        // original copy of sector 5 sits at interleave slot 15/18
        let near = img.add_phantom_copy(5, 0.5, 0xFF);
        img.add_phantom_copy(5, 0.9, 0xFF);

        // head just before 0.5 of a rotation: the 0.5 copy is closest
        let post_seek = (0.45 * PERIOD as f32) as u32;
        let mut ctr = 0u8;
        let sel = select(&img, 5, &mut ctr, true, post_seek);
        assert_eq!(sel.phys, Some(near));
        let expected = (0.5 * PERIOD as f32 + 0.5) as u32 - post_seek;
        assert!(sel.rotational_delay.abs_diff(expected) <= 1);
    }

    #[test]
    fn forced_order_overrides_selection() {
        let mut img = RamDiskImage::single_density();
        let far = img.add_phantom_copy(5, 0.9, 0xFF);

        let mut ctr = 0u8;
        let sel = select_physical(
            &img,
            4,
            0,
            PERIOD,
            true,
            false,
            false,
            &mut ctr,
            Some(1),
        );
        assert_eq!(sel.phys, Some(far));
    }

    #[test]
    fn missing_copies_classify_record_not_found() {
        let mut img = RamDiskImage::single_density();
        img.remove_all_copies(7);
        let mut ctr = 0u8;
        let sel = select(&img, 7, &mut ctr, true, 0);
        assert_eq!(sel.phys, None);
        assert_eq!(sel.fdc_status, 0xEF);
        assert!(!sel.address_crc_only);
    }

    #[test]
    fn all_invalid_addresses_classify_address_crc() {
        let mut img = RamDiskImage::single_density();
        let vsi = img.virt_sector_info(6);
        img.phys_sector_mut(vsi.start_phys).address_invalid = true;

        let mut ctr = 0u8;
        let sel = select(&img, 7, &mut ctr, true, 0);
        assert_eq!(sel.phys, None);
        assert_eq!(sel.fdc_status, 0xF7);
        assert!(sel.address_crc_only);
    }

    #[test]
    fn missing_data_field_blocks_reads_not_writes() {
        let mut img = RamDiskImage::single_density();
        let vsi = img.virt_sector_info(8);
        img.phys_sector_mut(vsi.start_phys).missing_data = true;

        let mut ctr = 0u8;
        let read = select_physical(&img, 8, 0, PERIOD, true, false, false, &mut ctr, None);
        assert_eq!(read.phys, None);

        let write = select_physical(&img, 8, 0, PERIOD, true, false, true, &mut ctr, None);
        assert_eq!(write.phys, Some(vsi.start_phys));
    }

    #[test]
    fn density_mismatch_treated_as_not_found() {
        let img = RamDiskImage::single_density();
        let mut ctr = 0u8;
        // drive searching in MFM over an FM image
        let sel = select_physical(&img, 0, 0, PERIOD, true, true, false, &mut ctr, None);
        assert_eq!(sel.phys, None);
        assert_eq!(sel.fdc_status, 0xEF);
    }

    #[test]
    fn lfsr_is_deterministic_and_stateful() {
        let mut a = WeakBitLfsr::new(0x1234_5678);
        let mut b = WeakBitLfsr::new(0x1234_5678);
        let s1: Vec<u8> = (0..16).map(|_| a.next_byte()).collect();
        let s2: Vec<u8> = (0..16).map(|_| b.next_byte()).collect();
        assert_eq!(s1, s2);

        // the state evolves: a second stretch differs from the first
        let s3: Vec<u8> = (0..16).map(|_| a.next_byte()).collect();
        assert_ne!(s1, s3);
    }

    #[test]
    fn lfsr_corrupt_only_touches_tail() {
        let mut l = WeakBitLfsr::new(0xDEAD_BEEF);
        let mut buf = [0u8; 128];
        l.corrupt(&mut buf, 64);
        assert!(buf[..64].iter().all(|&b| b == 0));
        assert!(buf[64..].iter().any(|&b| b != 0));
    }

    #[test]
    fn lfsr_rejects_dead_state() {
        let mut l = WeakBitLfsr::new(0);
        assert_ne!(l.state(), 0);
        l.next_byte();
        assert_ne!(l.state(), 0);
    }
}
