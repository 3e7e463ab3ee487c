//! The orchestrator: probe every candidate device, reconcile them against
//! each other, and drive the kernel to bring the array up.

use std::path::PathBuf;

use crate::config::RunStop;
use crate::device::{probe_device, reopen_for_write, CandidateDevice, ProbeOutcome};
use crate::driver::{self, ArrayInfo, DiskInfo, IoctlArrayControl, RunOutcome, RunPolicy};
use crate::identity::ArrayIdentity;
use crate::logger::Logger;
use crate::quorum::{compute_availability, enough, force_loop, AvailabilityVector};
use crate::reconcile::reconcile;
use crate::slot_map::SlotMap;
use crate::superblock::{self, DiskState, Superblock, NO_SLOT};
use crate::update::UpdateMode;

pub struct AssembleRequest {
    pub array_device: PathBuf,
    pub identity: ArrayIdentity,
    pub device_paths: Vec<PathBuf>,
    /// True when `device_paths` came from an explicit command-line list
    /// rather than a config-file scan; governs how noisy rejections are and
    /// whether a bad superblock on the sole named device is fatal.
    pub explicit: bool,
    pub force: bool,
    pub runstop: RunStop,
    pub update: Option<UpdateMode>,
}

#[derive(Debug, PartialEq)]
pub enum AssembleOutcome {
    Assembled { working: u32, failed: u32, spares: u32, degraded: bool, started: bool },
    InsufficientDrives { available: u32, needed: u32 },
    NoSuperblocksFound,
    Aborted(String),
}

pub fn assemble(req: &AssembleRequest, logger: &mut Logger) -> anyhow::Result<AssembleOutcome>
{
    // An explicitly-named device is the sole candidate only when it's the
    // only one given on the command line; a bad superblock on it then has
    // no other candidate to fall back to, so probing treats it as fatal.
    let sole_device = req.explicit && req.device_paths.len() == 1;

    let mut candidates: Vec<CandidateDevice> = Vec::new();
    let mut superblocks: Vec<Superblock> = Vec::new();

    for path in &req.device_paths {
        match probe_device(path, &req.identity, req.explicit, sole_device, logger) {
            ProbeOutcome::Committed { device, superblock } => {
                candidates.push(device);
                superblocks.push(superblock);
            }
            ProbeOutcome::Skipped { .. } => {}
            ProbeOutcome::Fatal { path, reason } => {
                return Ok(AssembleOutcome::Aborted(format!("{}: {}", path.display(), reason)));
            }
        }
    }

    if candidates.is_empty() {
        return Ok(AssembleOutcome::NoSuperblocksFound);
    }

    // Only now, once there's something to assemble, is the array device
    // control handle opened and checked for idempotence/kernel capability.
    let mut ctrl = IoctlArrayControl::open(&req.array_device)?;
    driver::check_not_active(&mut ctrl)?;
    let modern = driver::detect_modern(&mut ctrl, logger);

    // Establish the reference superblock (the array's identity) and drop
    // any candidate that, despite passing the per-field identity filter,
    // doesn't structurally match it.
    let reference = superblocks[0].clone();
    let mut kept_candidates = Vec::with_capacity(candidates.len());
    let mut kept_superblocks = Vec::with_capacity(superblocks.len());
    for (device, sb) in candidates.into_iter().zip(superblocks.into_iter()) {
        if superblock::compare(&reference, &sb) {
            kept_candidates.push(device);
            kept_superblocks.push(sb);
        } else if req.explicit {
            return Ok(AssembleOutcome::Aborted(format!(
                "{} does not belong to this array",
                device.path.display()
            )));
        } else {
            logger.warn(&format!("{} does not belong to this array, skipping", device.path.display()));
        }
    }
    let mut candidates = kept_candidates;
    let mut superblocks = kept_superblocks;

    if let Some(mode) = req.update {
        for sb in superblocks.iter_mut() {
            crate::update::apply(mode, sb);
            sb.sb_csum = superblock::checksum(sb);
        }
        for (device, sb) in candidates.iter().zip(superblocks.iter()) {
            let mut file = reopen_for_write(&device.path)?;
            superblock::store(&mut file, sb, device.device_size)?;
        }
    }

    let level = reference.level;
    let layout = reference.layout;
    let raid_disks = reference.raid_disks;

    let mut slots = SlotMap::new();
    for (idx, device) in candidates.iter().enumerate() {
        // Multipath arrays don't carry a meaningful raid_disk; members are
        // packed in arrival order instead. Everywhere else, a raid_disk at
        // or above NO_SLOT means "no slot" and the candidate is ignored.
        let key = if level == -4 {
            Some(idx)
        } else if device.raid_disk >= NO_SLOT {
            None
        } else {
            Some(device.raid_disk as usize)
        };
        if let Some(key) = key {
            let events = |j: usize| candidates[j].events;
            slots.offer(key, idx, events);
        }
    }

    let most_recent_events = candidates.iter().map(|c| c.events).max().unwrap_or(0);

    let availability = compute_availability(level, raid_disks, req.force, &slots, &mut candidates, most_recent_events);
    let mut avail = availability.avail;
    let mut okcnt = availability.okcnt;
    let sparecnt = availability.sparecnt;

    if req.force && !enough(level, raid_disks, layout, &avail, okcnt) {
        force_loop(level, raid_disks, layout, &slots, &mut candidates, &mut superblocks, most_recent_events, &mut avail, &mut okcnt, logger)?;
    }

    if !avail.any_available() {
        return Ok(AssembleOutcome::InsufficientDrives { available: okcnt, needed: raid_disks });
    }

    let result = reconcile(
        level,
        raid_disks,
        &slots,
        &mut candidates,
        &mut superblocks,
        &avail,
        sparecnt,
        most_recent_events,
        req.force,
        !modern,
        logger,
    )?;

    let req_cnt = reference
        .disks
        .0
        .iter()
        .filter(|d| d.state.is_active() && d.state.is_sync() && !d.state.is_faulty())
        .count() as u32;
    let start_partial_ok = req.force || !req.explicit;
    let policy = RunPolicy {
        runstop: req.runstop,
        req_cnt,
        start_partial_ok,
        enough: enough(level, raid_disks, layout, &avail, okcnt),
    };

    let (array_info, disks) = build_plan(&reference, &slots, &candidates, &avail, raid_disks, result.chosen_drive);

    let outcome = driver::run(&mut ctrl, &array_info, &disks, modern, okcnt, sparecnt, &policy, logger)?;

    match outcome {
        RunOutcome::Started { okcnt, sparecnt } => Ok(AssembleOutcome::Assembled {
            working: okcnt,
            failed: raid_disks - okcnt,
            spares: sparecnt,
            degraded: !result.clean,
            started: true,
        }),
        RunOutcome::NotStarted { okcnt, sparecnt } => Ok(AssembleOutcome::Assembled {
            working: okcnt,
            failed: raid_disks - okcnt,
            spares: sparecnt,
            degraded: !result.clean,
            started: false,
        }),
        RunOutcome::InsufficientQuorum { okcnt, .. } => {
            Ok(AssembleOutcome::InsufficientDrives { available: okcnt, needed: raid_disks })
        }
    }
}

/// Build the `SET_ARRAY_INFO` payload and the `ADD_NEW_DISK` list, with the
/// chosen drive ordered last, per the one ordering guarantee the driver
/// plan executor has to respect.
fn build_plan(
    reference: &Superblock,
    slots: &SlotMap,
    candidates: &[CandidateDevice],
    avail: &AvailabilityVector,
    raid_disks: u32,
    chosen_drive: usize,
) -> (ArrayInfo, Vec<DiskInfo>)
{
    let array_info = ArrayInfo {
        major_version: reference.major_version as i32,
        minor_version: reference.minor_version as i32,
        patch_version: reference.patch_version as i32,
        ctime: reference.ctime,
        level: reference.level,
        size: reference.size,
        nr_disks: reference.nr_disks,
        raid_disks: reference.raid_disks,
        md_minor: reference.md_minor,
        not_persistent: reference.not_persistent,
        utime: reference.utime,
        state: reference.state,
        active_disks: reference.active_disks,
        working_disks: reference.working_disks,
        failed_disks: reference.failed_disks,
        spare_disks: reference.spare_disks,
        layout: reference.layout,
        chunk_size: reference.chunk_size,
    };

    let raid_disks = raid_disks as usize;
    let mut disks: Vec<DiskInfo> = Vec::new();
    let mut chosen_disk: Option<DiskInfo> = None;

    for slot in 0..slots.len() {
        let Some(idx) = slots.get(slot) else { continue };

        let state = if slot < raid_disks && avail.get(slot) { DiskState::active_sync().0 } else { 0 };
        let disk = DiskInfo {
            number: slot as i32,
            major: candidates[idx].major as i32,
            minor: candidates[idx].minor as i32,
            raid_disk: slot as i32,
            state: state as i32,
        };

        if idx == chosen_drive {
            chosen_disk = Some(disk);
        } else {
            disks.push(disk);
        }
    }
    if let Some(disk) = chosen_disk {
        disks.push(disk);
    }

    (array_info, disks)
}
