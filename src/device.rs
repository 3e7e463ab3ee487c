//! Device probing: opening a candidate path, checking it is a block device,
//! loading its superblock, and folding the result into the identity filter
//! in one pass — mirroring the single scanning loop the original tool used.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::identity::{match_oneof, ArrayIdentity};
use crate::logger::Logger;
use crate::superblock::{self, DiskState, Superblock};

/// A device that passed probing, identity filtering, and (if the identity
/// filter committed to it) is now part of this assembly.
#[derive(Clone, Debug)]
pub struct CandidateDevice {
    pub path: PathBuf,
    pub device_size: u64,
    pub major: u32,
    pub minor: u32,
    pub oldmajor: u32,
    pub oldminor: u32,
    pub events: u64,
    pub utime: u32,
    pub raid_disk: u32,
    pub state: DiskState,
    pub uptodate: bool,
}

/// What happened when a single candidate path was examined.
pub enum ProbeOutcome {
    /// Not part of this assembly; not an error. `reason` is logged at the
    /// caller's discretion (verbosely if the path was named explicitly).
    Skipped { path: PathBuf, reason: String },
    /// Passed every identity check; now part of this assembly.
    Committed {
        device: CandidateDevice,
        superblock: Superblock,
    },
    /// Committed devices only: the superblock disappeared or doesn't match
    /// the reference. Assembly must abort.
    Fatal { path: PathBuf, reason: String },
}

/// Probe one candidate device path against `identity`.
///
/// `explicit` is true when the path came from an explicit device list on
/// the command line rather than from scanning the config file — it governs
/// whether pre-commit rejections are logged verbosely or silently, per the
/// original tool's `inargv || verbose` convention. `sole_device` is true
/// when this is the only device named explicitly, in which case a bad
/// superblock has no other candidate to fall back to and is fatal rather
/// than a skip.
pub fn probe_device(
    path: &Path,
    identity: &ArrayIdentity,
    explicit: bool,
    sole_device: bool,
    logger: &mut Logger,
) -> ProbeOutcome
{
    if let Some(patterns) = &identity.devices {
        if !match_oneof(patterns, &path.to_string_lossy()) {
            if explicit {
                logger.warn(&format!("{} is not one of the listed devices", path.display()));
            }
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: "not in device whitelist".into(),
            };
        }
    }

    let file = match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_EXCL)
        .open(path)
    {
        Ok(f) => f,
        Err(e) => {
            if explicit {
                logger.warn(&format!("cannot open device {}: {}", path.display(), e));
            } else {
                logger.info(&format!("cannot open device {}: {}", path.display(), e));
            }
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: format!("open failed: {e}"),
            };
        }
    };

    let meta = match file.metadata() {
        Ok(m) => m,
        Err(e) => {
            logger.warn(&format!("fstat failed for {}: {}", path.display(), e));
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: format!("fstat failed: {e}"),
            };
        }
    };

    if !meta.file_type().is_block_device() {
        logger.warn(&format!("{} is not a block device", path.display()));
        return ProbeOutcome::Skipped {
            path: path.to_path_buf(),
            reason: "not a block device".into(),
        };
    }

    let device_size = match block_device_size(&file) {
        Ok(sz) => sz,
        Err(e) => {
            logger.warn(&format!("could not determine size of {}: {}", path.display(), e));
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: format!("BLKGETSIZE64 failed: {e}"),
            };
        }
    };

    let mut file = file;
    let sb = match superblock::load(&mut file, device_size) {
        Ok(sb) => sb,
        Err(e) => {
            if explicit && sole_device {
                return ProbeOutcome::Fatal {
                    path: path.to_path_buf(),
                    reason: format!("no RAID superblock: {e}"),
                };
            }
            if explicit {
                logger.warn(&format!("no RAID superblock on {}: {}", path.display(), e));
            } else {
                logger.info(&format!("no RAID superblock on {}: {}", path.display(), e));
            }
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: format!("no superblock: {e}"),
            };
        }
    };

    if let Some(uuid) = identity.uuid {
        if superblock::uuid_of(&sb) != uuid {
            if explicit {
                logger.warn(&format!("{} has wrong uuid", path.display()));
            }
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: "uuid mismatch".into(),
            };
        }
    }
    if let Some(super_minor) = identity.super_minor {
        if sb.md_minor != super_minor {
            if explicit {
                logger.warn(&format!("{} has wrong super-minor", path.display()));
            }
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: "super-minor mismatch".into(),
            };
        }
    }
    if let Some(level) = identity.level {
        if sb.level != level {
            if explicit {
                logger.warn(&format!("{} has wrong raid level", path.display()));
            }
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: "level mismatch".into(),
            };
        }
    }
    if let Some(raid_disks) = identity.raid_disks {
        if sb.raid_disks != raid_disks {
            if explicit {
                logger.warn(&format!("{} requires wrong number of drives", path.display()));
            }
            return ProbeOutcome::Skipped {
                path: path.to_path_buf(),
                reason: "raid_disks mismatch".into(),
            };
        }
    }

    // Committed: from here on, any further problem with this device is fatal.
    let rdev = meta.rdev();
    let device = CandidateDevice {
        path: path.to_path_buf(),
        device_size,
        major: unsafe { libc::major(rdev) },
        minor: unsafe { libc::minor(rdev) },
        oldmajor: sb.this_disk.major,
        oldminor: sb.this_disk.minor,
        events: superblock::event_counter(&sb),
        utime: sb.utime,
        raid_disk: sb.this_disk.raid_disk,
        state: sb.this_disk.state,
        uptodate: false,
    };

    logger.info(&format!(
        "{} is identified as a member, slot {}",
        path.display(),
        device.raid_disk
    ));

    ProbeOutcome::Committed { device, superblock: sb }
}

fn block_device_size(file: &File) -> std::io::Result<u64>
{
    let mut size: u64 = 0;
    let ret = unsafe { ioctl_blkgetsize64(file.as_raw_fd(), &mut size) };
    match ret {
        Ok(_) => Ok(size),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

nix::ioctl_read!(ioctl_blkgetsize64, 0x12, 114, u64);

/// Reopen `path` read-write, exclusively, for a metadata update.
pub fn reopen_for_write(path: &Path) -> anyhow::Result<File>
{
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_EXCL)
        .open(path)
        .with_context(|| format!("opening {} for write", path.display()))
}
