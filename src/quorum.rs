//! Availability accounting, the `enough()` quorum predicate, and the force
//! loop that rewrites stale superblocks to reach quorum under `--force`.

use crate::bitmap::Bitmap;
use crate::device::{reopen_for_write, CandidateDevice};
use crate::logger::Logger;
use crate::slot_map::SlotMap;
use crate::superblock::{self, Superblock};

/// A bit per RAID-data slot, set when that slot has a healthy up-to-date
/// candidate. Length is always `raid_disks`.
#[derive(Clone, Debug)]
pub struct AvailabilityVector {
    bits: Bitmap,
    len: usize,
}

impl AvailabilityVector {
    pub fn new(raid_disks: usize) -> Self
    {
        Self { bits: Bitmap::zeroed(raid_disks.max(1)), len: raid_disks }
    }

    pub fn set(&mut self, slot: usize)
    {
        if slot < self.len {
            self.bits.set_bit(slot);
        }
    }

    pub fn get(&self, slot: usize) -> bool
    {
        slot < self.len && self.bits.check_bit(slot)
    }

    pub fn len(&self) -> usize
    {
        self.len
    }

    pub fn missing(&self) -> usize
    {
        (0..self.len).filter(|&i| !self.get(i)).count()
    }

    pub fn any_available(&self) -> bool
    {
        (0..self.len).any(|i| self.get(i))
    }
}

/// The quorum predicate: does `avail` support running the array at `level`?
pub fn enough(level: i32, raid_disks: u32, layout: u32, avail: &AvailabilityVector, okcnt: u32) -> bool
{
    let _ = okcnt; // kept in the signature for parity with the original call shape
    match level {
        0 => avail.missing() == 0,
        1 => avail.any_available(),
        4 | 5 => avail.missing() <= 1,
        6 => avail.missing() <= 2,
        10 => enough_raid10(raid_disks, layout, avail),
        -4 => avail.any_available(),
        -1 => avail.missing() == 0,
        _ => avail.missing() == 0,
    }
}

/// RAID-10: with near-copies layout (the common case), slots pair up as
/// (0,1), (2,3), ... and a mirror is lost only if *both* of a pair are
/// missing.
fn enough_raid10(raid_disks: u32, layout: u32, avail: &AvailabilityVector) -> bool
{
    let copies = (layout & 0xff).max(1) as usize;
    let raid_disks = raid_disks as usize;

    let mut slot = 0;
    while slot < raid_disks {
        let group_end = (slot + copies).min(raid_disks);
        if !(slot..group_end).any(|i| avail.get(i)) {
            return false;
        }
        slot = group_end;
    }
    true
}

/// Result of the up-to-date pass over every slot.
pub struct Availability {
    pub avail: AvailabilityVector,
    pub okcnt: u32,
    pub sparecnt: u32,
}

/// For every slot in the SlotMap, decide whether its candidate is
/// up-to-date and tally `okcnt`/`sparecnt`. Mutates `candidates[*].uptodate`.
pub fn compute_availability(
    level: i32,
    raid_disks: u32,
    force: bool,
    slots: &SlotMap,
    candidates: &mut [CandidateDevice],
    most_recent_events: u64,
) -> Availability
{
    let event_margin: u64 = if force { 0 } else { 1 };
    let mut avail = AvailabilityVector::new(raid_disks as usize);
    let mut okcnt = 0u32;
    let mut sparecnt = 0u32;

    for slot in 0..slots.len() {
        let Some(idx) = slots.get(slot) else { continue };

        if level != -4 && !candidates[idx].state.is_sync() {
            if !candidates[idx].state.is_faulty() {
                sparecnt += 1;
            }
            continue;
        }

        if candidates[idx].events + event_margin >= most_recent_events {
            candidates[idx].uptodate = true;
            if slot < raid_disks as usize {
                okcnt += 1;
                avail.set(slot);
            } else {
                sparecnt += 1;
            }
        }
    }

    Availability { avail, okcnt, sparecnt }
}

/// Run the force loop: repeatedly rewrite the newest stale candidate's
/// superblock to the most-recent event count until quorum is reached or no
/// stale candidate remains. Mutates `candidates` and `superblocks` (parallel
/// arrays, same indexing as `slots`) and `avail`/`okcnt` in place.
pub fn force_loop(
    level: i32,
    raid_disks: u32,
    layout: u32,
    slots: &SlotMap,
    candidates: &mut [CandidateDevice],
    superblocks: &mut [Superblock],
    most_recent_events: u64,
    avail: &mut AvailabilityVector,
    okcnt: &mut u32,
    logger: &mut Logger,
) -> anyhow::Result<()>
{
    while !enough(level, raid_disks, layout, avail, *okcnt) {
        let mut chosen: Option<usize> = None;
        for i in 0..raid_disks as usize {
            let Some(idx) = slots.get(i) else { continue };
            if candidates[idx].uptodate || candidates[idx].events == 0 {
                continue;
            }
            let better = match chosen {
                None => true,
                Some(best) => candidates[idx].events > candidates[best].events,
            };
            if better {
                chosen = Some(idx);
            }
        }

        let Some(idx) = chosen else { break };

        // slot is recovered for avail bookkeeping below; the loop above
        // discarded it once it filtered down to candidate indices.
        let slot = (0..raid_disks as usize)
            .find(|&i| slots.get(i) == Some(idx))
            .expect("chosen candidate came from a slot in range");

        logger.warn(&format!(
            "forcing event count in {} from {} up to {}",
            candidates[idx].path.display(),
            candidates[idx].events,
            most_recent_events
        ));

        match rewrite_for_force(&candidates[idx], &mut superblocks[idx], level, most_recent_events) {
            Ok(()) => {
                candidates[idx].events = most_recent_events;
                candidates[idx].uptodate = true;
                avail.set(slot);
                *okcnt += 1;
            }
            Err(e) => {
                logger.warn(&format!(
                    "could not rewrite superblock on {}: {}",
                    candidates[idx].path.display(),
                    e
                ));
                candidates[idx].events = 0;
            }
        }
    }

    Ok(())
}

fn rewrite_for_force(
    candidate: &CandidateDevice,
    sb: &mut Superblock,
    level: i32,
    most_recent_events: u64,
) -> anyhow::Result<()>
{
    let mut file = reopen_for_write(&candidate.path)?;
    let mut fresh = superblock::load(&mut file, candidate.device_size)?;

    superblock::set_event_counter(&mut fresh, most_recent_events);
    if level == 4 || level == 5 {
        fresh.set_clean();
    }
    fresh.sb_csum = superblock::checksum(&fresh);
    superblock::store(&mut file, &fresh, candidate.device_size)?;

    *sb = fresh;
    Ok(())
}
