//! Reconciliation: pick the chosen drive, diff every present slot's
//! recorded numbering and state against its superblock, and (when the
//! policy calls for it) write the patched superblock back to that one
//! drive.

use anyhow::Context;

use crate::device::{reopen_for_write, CandidateDevice};
use crate::logger::Logger;
use crate::quorum::AvailabilityVector;
use crate::slot_map::SlotMap;
use crate::superblock::{self, DiskState, Superblock, MAX_SLOTS};

/// `change` bit: a slot's recorded (major, minor) disagreed with the
/// device's own record and was patched.
const RENUMBER: u32 = 1;
/// `change` bit: a slot's state was overwritten to its desired value.
const STATE: u32 = 2;

pub struct ReconcileResult {
    /// Index (into `candidates`/`superblocks`) of the drive whose superblock
    /// is taken as authoritative and, if written, carries the patch.
    pub chosen_drive: usize,
    pub working_disks: u32,
    pub failed_disks: u32,
    pub spare_disks: u32,
    pub clean: bool,
}

/// Reconcile the array's membership against the chosen drive's superblock.
///
/// Picks the first up-to-date available slot as the chosen drive, reloads
/// its superblock fresh from disk, and patches it slot by slot: disagreeing
/// (major, minor) pairs are renumbered, state mismatches are resolved under
/// `force` or else just warned about. The patched superblock is written
/// back only if `force` produced a state change, or (on the legacy driver
/// path) a renumber happened — matching the original tool's write-back
/// gate exactly.
pub fn reconcile(
    level: i32,
    raid_disks: u32,
    slots: &SlotMap,
    candidates: &mut [CandidateDevice],
    superblocks: &mut [Superblock],
    avail: &AvailabilityVector,
    sparecnt: u32,
    most_recent_events: u64,
    force: bool,
    legacy_kernel_path: bool,
    logger: &mut Logger,
) -> anyhow::Result<ReconcileResult>
{
    let raid_disks_usize = raid_disks as usize;

    let chosen_drive = (0..raid_disks_usize)
        .filter(|&slot| avail.get(slot))
        .filter_map(|slot| slots.get(slot))
        .find(|&idx| candidates[idx].uptodate)
        .ok_or_else(|| anyhow::anyhow!("no available drive to reconcile the array from"))?;

    let working_disks = (0..raid_disks_usize).filter(|&slot| avail.get(slot)).count() as u32;
    let failed_disks = raid_disks - working_disks;

    // A RAID4/5 array missing exactly one disk is fully reconstructible
    // from parity and doesn't need a resync to come up clean.
    let mut clean = failed_disks == 0 || ((level == 4 || level == 5) && failed_disks == 1);

    let mut file = reopen_for_write(&candidates[chosen_drive].path)?;
    let mut sb = superblock::load(&mut file, candidates[chosen_drive].device_size)
        .with_context(|| format!("reloading chosen drive {}", candidates[chosen_drive].path.display()))?;

    let mut change = 0u32;

    for slot in 0..slots.len() {
        let Some(idx) = slots.get(slot) else { continue };
        if slot >= MAX_SLOTS {
            continue;
        }

        let desired_state = if slot < raid_disks_usize { DiskState::active_sync() } else { DiskState::default() };
        let candidate = &candidates[idx];
        let entry = &mut sb.disks.0[slot];

        if candidate.oldmajor != entry.major || candidate.oldminor != entry.minor {
            entry.major = candidate.oldmajor;
            entry.minor = candidate.oldminor;
            change |= RENUMBER;
        }

        if candidate.uptodate && entry.state != desired_state {
            if force {
                entry.state = desired_state;
                change |= STATE;
            } else {
                logger.warn(&format!(
                    "{}: slot {} state does not match the reconciled view, not forcing",
                    candidate.path.display(),
                    slot
                ));
            }
        }

        if !candidate.uptodate && !entry.state.is_faulty() {
            logger.warn(&format!(
                "{}: slot {} is not up-to-date and not marked faulty",
                candidate.path.display(),
                slot
            ));
        }
    }

    if force && (level == 4 || level == 5) && working_disks == raid_disks - 1 {
        sb.set_clean();
        change |= STATE;
        clean = true;
    }

    if (force && change & STATE != 0) || (legacy_kernel_path && change & RENUMBER != 0) {
        sb.sb_csum = superblock::checksum(&sb);
        superblock::store(&mut file, &sb, candidates[chosen_drive].device_size)
            .with_context(|| format!("writing reconciled superblock to {}", candidates[chosen_drive].path.display()))?;
        logger.info(&format!("reconciled superblock written to {}", candidates[chosen_drive].path.display()));
    }

    superblocks[chosen_drive] = sb;
    candidates[chosen_drive].events = most_recent_events;

    Ok(ReconcileResult {
        chosen_drive,
        working_disks,
        failed_disks,
        spare_disks: sparecnt,
        clean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;
    use crate::device::CandidateDevice;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    const DEV_SIZE: u64 = 1024 * 1024;

    fn backed_candidate(events: u64) -> (NamedTempFile, CandidateDevice)
    {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(DEV_SIZE).unwrap();

        let mut sb = Superblock::default();
        sb.raid_disks = 2;
        sb.disks = Array([Default::default(); crate::superblock::MAX_SLOTS]);
        superblock::set_event_counter(&mut sb, events);
        sb.sb_csum = superblock::checksum(&sb);
        let mut file = tmp.as_file().try_clone().unwrap();
        superblock::store(&mut file, &sb, DEV_SIZE).unwrap();
        file.flush().unwrap();

        let candidate = CandidateDevice {
            path: tmp.path().to_path_buf(),
            device_size: DEV_SIZE,
            major: 0,
            minor: 0,
            oldmajor: 0,
            oldminor: 0,
            events,
            utime: 0,
            raid_disk: 0,
            state: DiskState::active_sync(),
            uptodate: true,
        };
        (tmp, candidate)
    }

    fn backed_candidate_with_numbering(events: u64, oldmajor: u32, oldminor: u32) -> (NamedTempFile, CandidateDevice)
    {
        let (tmp, mut candidate) = backed_candidate(events);
        candidate.oldmajor = oldmajor;
        candidate.oldminor = oldminor;
        (tmp, candidate)
    }

    #[test]
    fn reconcile_picks_first_uptodate_slot_as_chosen_drive()
    {
        let (tmp_a, cand_a) = backed_candidate(10);
        let (tmp_b, cand_b) = backed_candidate(10);
        let mut candidates = vec![cand_a, cand_b];
        let mut superblocks = vec![
            superblock::load(&mut tmp_a.as_file().try_clone().unwrap(), DEV_SIZE).unwrap(),
            superblock::load(&mut tmp_b.as_file().try_clone().unwrap(), DEV_SIZE).unwrap(),
        ];

        let mut slots = SlotMap::new();
        let events = |i: usize| [10u64, 10][i];
        slots.offer(0, 0, events);
        slots.offer(1, 1, events);

        let mut avail = AvailabilityVector::new(2);
        avail.set(0);
        avail.set(1);

        let mut logger = Logger::new(false, None);
        let result = reconcile(5, 2, &slots, &mut candidates, &mut superblocks, &avail, 0, 10, false, false, &mut logger).unwrap();

        assert_eq!(result.chosen_drive, 0);
        assert_eq!(result.working_disks, 2);
        assert_eq!(result.failed_disks, 0);
        assert!(result.clean);
    }

    #[test]
    fn renumber_is_patched_and_written_back_on_the_legacy_path()
    {
        let (tmp_a, cand_a) = backed_candidate_with_numbering(10, 8, 1);
        let (tmp_b, cand_b) = backed_candidate(10);
        let mut candidates = vec![cand_a, cand_b];
        let mut superblocks = vec![
            superblock::load(&mut tmp_a.as_file().try_clone().unwrap(), DEV_SIZE).unwrap(),
            superblock::load(&mut tmp_b.as_file().try_clone().unwrap(), DEV_SIZE).unwrap(),
        ];

        let mut slots = SlotMap::new();
        let events = |i: usize| [10u64, 10][i];
        slots.offer(0, 0, events);
        slots.offer(1, 1, events);

        let mut avail = AvailabilityVector::new(2);
        avail.set(0);
        avail.set(1);

        let mut logger = Logger::new(false, None);
        let result = reconcile(5, 2, &slots, &mut candidates, &mut superblocks, &avail, 0, 10, false, true, &mut logger).unwrap();
        assert_eq!(result.chosen_drive, 0);

        let reread = superblock::load(&mut tmp_a.as_file().try_clone().unwrap(), DEV_SIZE).unwrap();
        assert_eq!(reread.disks.0[0].major, 8);
        assert_eq!(reread.disks.0[0].minor, 1);
    }

    #[test]
    fn renumber_alone_does_not_write_back_on_the_modern_path()
    {
        let (tmp_a, cand_a) = backed_candidate_with_numbering(10, 8, 1);
        let mut candidates = vec![cand_a];
        let mut superblocks = vec![superblock::load(&mut tmp_a.as_file().try_clone().unwrap(), DEV_SIZE).unwrap()];

        let mut slots = SlotMap::new();
        let events = |i: usize| [10u64][i];
        slots.offer(0, 0, events);

        let mut avail = AvailabilityVector::new(1);
        avail.set(0);

        let mut logger = Logger::new(false, None);
        reconcile(1, 1, &slots, &mut candidates, &mut superblocks, &avail, 0, 10, false, false, &mut logger).unwrap();

        let reread = superblock::load(&mut tmp_a.as_file().try_clone().unwrap(), DEV_SIZE).unwrap();
        assert_eq!(reread.disks.0[0].major, 0);
        assert_eq!(reread.disks.0[0].minor, 0);
    }

    #[test]
    fn force_overwrites_slot_state_and_writes_back()
    {
        let (tmp_a, cand_a) = backed_candidate(10);
        let mut candidates = vec![cand_a];
        let mut superblocks = vec![superblock::load(&mut tmp_a.as_file().try_clone().unwrap(), DEV_SIZE).unwrap()];

        let mut slots = SlotMap::new();
        let events = |i: usize| [10u64][i];
        slots.offer(0, 0, events);

        let mut avail = AvailabilityVector::new(1);
        avail.set(0);

        let mut logger = Logger::new(false, None);
        let result = reconcile(1, 1, &slots, &mut candidates, &mut superblocks, &avail, 0, 10, true, false, &mut logger).unwrap();
        assert!(result.clean);

        let reread = superblock::load(&mut tmp_a.as_file().try_clone().unwrap(), DEV_SIZE).unwrap();
        assert_eq!(reread.disks.0[0].state, DiskState::active_sync());
    }

    #[test]
    fn raid5_one_missing_is_still_clean()
    {
        let failed_disks = 1u32;
        let level = 5;
        let clean = failed_disks == 0 || ((level == 4 || level == 5) && failed_disks == 1);
        assert!(clean);
    }

    #[test]
    fn raid1_one_missing_is_not_clean()
    {
        let failed_disks = 1u32;
        let level = 1;
        let clean = failed_disks == 0 || ((level == 4 || level == 5) && failed_disks == 1);
        assert!(!clean);
    }
}
