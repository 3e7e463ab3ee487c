//! The kernel control surface: MD ioctl bindings and the modern/legacy plan
//! executor that drives a reconciled array up.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::Context;

use crate::config::RunStop;
use crate::logger::Logger;
use crate::superblock::DiskState;

const MD_MAJOR: u8 = 0x09;

/// Mirrors `mdu_array_info_t` from `<linux/raid/md_u.h>`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ArrayInfo {
    pub major_version: i32,
    pub minor_version: i32,
    pub patch_version: i32,
    pub ctime: u32,
    pub level: i32,
    pub size: u32,
    pub nr_disks: u32,
    pub raid_disks: u32,
    pub md_minor: u32,
    pub not_persistent: u32,

    pub utime: u32,
    pub state: u32,
    pub active_disks: u32,
    pub working_disks: u32,
    pub failed_disks: u32,
    pub spare_disks: u32,

    pub layout: u32,
    pub chunk_size: u32,
}

/// Mirrors `mdu_disk_info_t`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskInfo {
    pub number: i32,
    pub major: i32,
    pub minor: i32,
    pub raid_disk: i32,
    pub state: i32,
}

/// Mirrors `mdu_version_t`: the packed kernel RAID driver version.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VersionInfo {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

impl VersionInfo {
    /// Packed as `major*10000 + minor*100 + patch`, the same scheme mdadm
    /// compares against the 0.90.0 (9000) gate.
    pub fn packed(&self) -> i32
    {
        self.major * 10000 + self.minor * 100 + self.patch
    }
}

/// The packed version gate below which the modern `SET_ARRAY_INFO` ioctl
/// sequence isn't supported.
pub const MIN_MODERN_VERSION: i32 = 9000;

nix::ioctl_read!(ioctl_raid_version, MD_MAJOR, 0x10, VersionInfo);
nix::ioctl_write_ptr!(ioctl_set_array_info, MD_MAJOR, 0x23, ArrayInfo);
nix::ioctl_write_ptr!(ioctl_add_new_disk, MD_MAJOR, 0x21, DiskInfo);
nix::ioctl_read!(ioctl_get_array_info, MD_MAJOR, 0x11, ArrayInfo);
nix::ioctl_none!(ioctl_run_array, MD_MAJOR, 0x30);
nix::ioctl_none!(ioctl_start_array, MD_MAJOR, 0x31);
nix::ioctl_none!(ioctl_stop_array, MD_MAJOR, 0x32);

/// The control handle mdadm holds open on `/dev/mdN` while assembling it.
pub trait ArrayControl {
    fn get_version(&mut self) -> anyhow::Result<VersionInfo>;
    fn get_array_info(&mut self) -> anyhow::Result<ArrayInfo>;
    fn set_array_info(&mut self, info: &ArrayInfo) -> anyhow::Result<()>;
    fn add_new_disk(&mut self, disk: &DiskInfo) -> anyhow::Result<()>;
    fn run_array(&mut self) -> anyhow::Result<()>;
    /// Legacy pre-2.4 path: no per-disk ioctls, the kernel reads the
    /// superblocks off the devices itself.
    fn start_array(&mut self) -> anyhow::Result<()>;
    /// Issued defensively before every assembly attempt, to clear any
    /// stale partially-started state; failure (there was nothing running)
    /// is expected and not an error.
    fn stop_array(&mut self) -> anyhow::Result<()>;
}

pub struct IoctlArrayControl {
    file: File,
}

impl IoctlArrayControl {
    pub fn open(path: &Path) -> anyhow::Result<Self>
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening array device {}", path.display()))?;
        Ok(Self { file })
    }
}

impl ArrayControl for IoctlArrayControl {
    fn get_version(&mut self) -> anyhow::Result<VersionInfo>
    {
        let mut version = VersionInfo::default();
        unsafe { ioctl_raid_version(self.file.as_raw_fd(), &mut version) }.context("RAID_VERSION")?;
        Ok(version)
    }

    fn get_array_info(&mut self) -> anyhow::Result<ArrayInfo>
    {
        let mut info = ArrayInfo::default();
        unsafe { ioctl_get_array_info(self.file.as_raw_fd(), &mut info) }.context("GET_ARRAY_INFO")?;
        Ok(info)
    }

    fn set_array_info(&mut self, info: &ArrayInfo) -> anyhow::Result<()>
    {
        unsafe { ioctl_set_array_info(self.file.as_raw_fd(), info) }
            .context("SET_ARRAY_INFO")
            .map(|_| ())
    }

    fn add_new_disk(&mut self, disk: &DiskInfo) -> anyhow::Result<()>
    {
        unsafe { ioctl_add_new_disk(self.file.as_raw_fd(), disk) }
            .context("ADD_NEW_DISK")
            .map(|_| ())
    }

    fn run_array(&mut self) -> anyhow::Result<()>
    {
        unsafe { ioctl_run_array(self.file.as_raw_fd()) }
            .context("RUN_ARRAY")
            .map(|_| ())
    }

    fn start_array(&mut self) -> anyhow::Result<()>
    {
        unsafe { ioctl_start_array(self.file.as_raw_fd()) }
            .context("START_ARRAY")
            .map(|_| ())
    }

    fn stop_array(&mut self) -> anyhow::Result<()>
    {
        unsafe { ioctl_stop_array(self.file.as_raw_fd()) }
            .context("STOP_ARRAY")
            .map(|_| ())
    }
}

/// Detect whether the kernel's RAID driver is modern enough for the
/// `SET_ARRAY_INFO`/`ADD_NEW_DISK`/`RUN_ARRAY` sequence. A failed version
/// query is treated as modern, on the assumption that a kernel too old to
/// answer `RAID_VERSION` at all is vanishingly unlikely in practice.
pub fn detect_modern(ctrl: &mut dyn ArrayControl, logger: &mut Logger) -> bool
{
    match ctrl.get_version() {
        Ok(v) => v.packed() >= MIN_MODERN_VERSION,
        Err(e) => {
            logger.warn(&format!("RAID_VERSION failed ({e}), assuming a modern kernel"));
            true
        }
    }
}

/// Idempotence guard: `GET_ARRAY_INFO` succeeding means the array is
/// already active, in which case assembling it again is refused outright.
pub fn check_not_active(ctrl: &mut dyn ArrayControl) -> anyhow::Result<()>
{
    if ctrl.get_array_info().is_ok() {
        anyhow::bail!("device is already active - cannot assemble it");
    }
    Ok(())
}

/// What the run-policy branch in [`run`] decided to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Started { okcnt: u32, sparecnt: u32 },
    NotStarted { okcnt: u32, sparecnt: u32 },
    InsufficientQuorum { okcnt: u32, sparecnt: u32 },
}

/// Inputs to the three-way `RUN_ARRAY` policy decision.
pub struct RunPolicy {
    pub runstop: RunStop,
    /// Number of slots the reference superblock records as
    /// `ACTIVE & SYNC & !FAULTY`.
    pub req_cnt: u32,
    /// `force` was given, or no explicit device list was supplied.
    pub start_partial_ok: bool,
    /// Whether the quorum predicate holds for the current availability.
    pub enough: bool,
}

/// Drive a reconciled array up. Issues a defensive `STOP_ARRAY` first (no
/// harm if nothing was running), and either runs the modern
/// `SET_ARRAY_INFO` + `ADD_NEW_DISK`* + `RUN_ARRAY` sequence or falls back
/// to the legacy `START_ARRAY` ioctl (which asks the kernel to read the
/// member superblocks itself) when the kernel predates 0.90.0 support, or
/// when `SET_ARRAY_INFO` is rejected despite a modern-looking version.
///
/// Callers are expected to have already checked [`check_not_active`] and
/// computed `modern` via [`detect_modern`] before building the reconciled
/// plan, since the reconciler's own write-back decision also needs to know
/// whether this is the legacy path.
pub fn run(
    ctrl: &mut dyn ArrayControl,
    array_info: &ArrayInfo,
    disks: &[DiskInfo],
    modern: bool,
    mut okcnt: u32,
    mut sparecnt: u32,
    policy: &RunPolicy,
    logger: &mut Logger,
) -> anyhow::Result<RunOutcome>
{
    let _ = ctrl.stop_array();

    if !modern {
        logger.warn("kernel predates 0.90 RAID support, using legacy START_ARRAY");
        ctrl.start_array()?;
        return Ok(RunOutcome::Started { okcnt, sparecnt });
    }

    match ctrl.set_array_info(array_info) {
        Ok(()) => {
            for disk in disks {
                if let Err(e) = ctrl.add_new_disk(disk) {
                    logger.warn(&format!("failed to add disk {} to array: {}", disk.number, e));
                    if disk.state & (DiskState::ACTIVE as i32) != 0 {
                        okcnt = okcnt.saturating_sub(1);
                    } else {
                        sparecnt = sparecnt.saturating_sub(1);
                    }
                }
            }

            match policy.runstop {
                RunStop::Run => {
                    ctrl.run_array()?;
                    Ok(RunOutcome::Started { okcnt, sparecnt })
                }
                RunStop::NoDegraded => Ok(RunOutcome::NotStarted { okcnt, sparecnt }),
                RunStop::Default => {
                    if policy.enough && (okcnt >= policy.req_cnt || policy.start_partial_ok) {
                        ctrl.run_array()?;
                        Ok(RunOutcome::Started { okcnt, sparecnt })
                    } else {
                        Ok(RunOutcome::InsufficientQuorum { okcnt, sparecnt })
                    }
                }
            }
        }
        Err(e) => {
            logger.warn(&format!("SET_ARRAY_INFO not supported ({e}), falling back to legacy START_ARRAY"));
            ctrl.start_array()?;
            Ok(RunOutcome::Started { okcnt, sparecnt })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MockControl {
        version: VersionInfo,
        set_array_info_result: Option<anyhow::Error>,
        add_new_disk_failures: u32,
        calls: RefCell<Vec<&'static str>>,
    }

    impl Default for MockControl {
        fn default() -> Self
        {
            Self {
                version: VersionInfo { major: 0, minor: 90, patch: 0 },
                set_array_info_result: None,
                add_new_disk_failures: 0,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ArrayControl for MockControl {
        fn get_version(&mut self) -> anyhow::Result<VersionInfo>
        {
            self.calls.borrow_mut().push("get_version");
            Ok(self.version)
        }

        fn get_array_info(&mut self) -> anyhow::Result<ArrayInfo>
        {
            self.calls.borrow_mut().push("get_array_info");
            Ok(ArrayInfo::default())
        }

        fn set_array_info(&mut self, _info: &ArrayInfo) -> anyhow::Result<()>
        {
            self.calls.borrow_mut().push("set_array_info");
            match self.set_array_info_result.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn add_new_disk(&mut self, _disk: &DiskInfo) -> anyhow::Result<()>
        {
            self.calls.borrow_mut().push("add_new_disk");
            if self.add_new_disk_failures > 0 {
                self.add_new_disk_failures -= 1;
                return Err(anyhow::anyhow!("EBUSY"));
            }
            Ok(())
        }

        fn run_array(&mut self) -> anyhow::Result<()>
        {
            self.calls.borrow_mut().push("run_array");
            Ok(())
        }

        fn start_array(&mut self) -> anyhow::Result<()>
        {
            self.calls.borrow_mut().push("start_array");
            Ok(())
        }

        fn stop_array(&mut self) -> anyhow::Result<()>
        {
            self.calls.borrow_mut().push("stop_array");
            Ok(())
        }
    }

    fn default_policy() -> RunPolicy
    {
        RunPolicy { runstop: RunStop::Default, req_cnt: 0, start_partial_ok: true, enough: true }
    }

    #[test]
    fn detect_modern_reads_the_version_gate()
    {
        let mut logger = Logger::new(false, None);
        let mut ctrl = MockControl::default();
        assert!(detect_modern(&mut ctrl, &mut logger));

        let mut old = MockControl { version: VersionInfo { major: 0, minor: 36, patch: 0 }, ..Default::default() };
        assert!(!detect_modern(&mut old, &mut logger));
    }

    #[test]
    fn check_not_active_bails_when_get_array_info_succeeds()
    {
        let mut ctrl = MockControl::default();
        assert!(check_not_active(&mut ctrl).is_err());
    }

    #[test]
    fn modern_path_adds_every_disk_then_runs()
    {
        let mut ctrl = MockControl::default();
        let mut logger = Logger::new(false, None);
        let disks = vec![DiskInfo::default(), DiskInfo::default()];
        let policy = RunPolicy { req_cnt: 2, ..default_policy() };

        let outcome = run(&mut ctrl, &ArrayInfo::default(), &disks, true, 2, 0, &policy, &mut logger).unwrap();

        assert_eq!(
            *ctrl.calls.borrow(),
            vec!["stop_array", "set_array_info", "add_new_disk", "add_new_disk", "run_array"]
        );
        assert_eq!(outcome, RunOutcome::Started { okcnt: 2, sparecnt: 0 });
    }

    #[test]
    fn falls_back_to_legacy_start_array_when_set_array_info_rejected()
    {
        let mut ctrl = MockControl {
            set_array_info_result: Some(anyhow::anyhow!("ENOTTY")),
            ..Default::default()
        };
        let mut logger = Logger::new(false, None);

        run(&mut ctrl, &ArrayInfo::default(), &[], true, 0, 0, &default_policy(), &mut logger).unwrap();

        assert_eq!(*ctrl.calls.borrow(), vec!["stop_array", "set_array_info", "start_array"]);
    }

    #[test]
    fn legacy_kernel_skips_straight_to_start_array()
    {
        let mut ctrl = MockControl::default();
        let mut logger = Logger::new(false, None);

        let outcome = run(&mut ctrl, &ArrayInfo::default(), &[], false, 1, 0, &default_policy(), &mut logger).unwrap();

        assert_eq!(*ctrl.calls.borrow(), vec!["stop_array", "start_array"]);
        assert_eq!(outcome, RunOutcome::Started { okcnt: 1, sparecnt: 0 });
    }

    #[test]
    fn runstop_run_always_runs_even_if_not_enough()
    {
        let mut ctrl = MockControl::default();
        let mut logger = Logger::new(false, None);
        let policy = RunPolicy { runstop: RunStop::Run, enough: false, ..default_policy() };

        let outcome = run(&mut ctrl, &ArrayInfo::default(), &[], true, 0, 0, &policy, &mut logger).unwrap();

        assert!(ctrl.calls.borrow().contains(&"run_array"));
        assert_eq!(outcome, RunOutcome::Started { okcnt: 0, sparecnt: 0 });
    }

    #[test]
    fn runstop_no_degraded_never_runs()
    {
        let mut ctrl = MockControl::default();
        let mut logger = Logger::new(false, None);
        let policy = RunPolicy { runstop: RunStop::NoDegraded, ..default_policy() };

        let outcome = run(&mut ctrl, &ArrayInfo::default(), &[], true, 2, 0, &policy, &mut logger).unwrap();

        assert!(!ctrl.calls.borrow().contains(&"run_array"));
        assert_eq!(outcome, RunOutcome::NotStarted { okcnt: 2, sparecnt: 0 });
    }

    #[test]
    fn default_runstop_reports_insufficient_quorum_without_running()
    {
        let mut ctrl = MockControl::default();
        let mut logger = Logger::new(false, None);
        let policy = RunPolicy { req_cnt: 3, start_partial_ok: false, enough: false, ..default_policy() };

        let outcome = run(&mut ctrl, &ArrayInfo::default(), &[], true, 1, 0, &policy, &mut logger).unwrap();

        assert!(!ctrl.calls.borrow().contains(&"run_array"));
        assert_eq!(outcome, RunOutcome::InsufficientQuorum { okcnt: 1, sparecnt: 0 });
    }

    #[test]
    fn failed_add_new_disk_decrements_the_right_counter()
    {
        let mut ctrl = MockControl::default();
        ctrl.add_new_disk_failures = 1;
        let mut logger = Logger::new(false, None);
        let active = DiskInfo { state: DiskState::active_sync().0 as i32, ..DiskInfo::default() };
        let policy = RunPolicy { req_cnt: 0, start_partial_ok: true, ..default_policy() };

        let outcome = run(&mut ctrl, &ArrayInfo::default(), &[active], true, 1, 0, &policy, &mut logger).unwrap();

        assert_eq!(outcome, RunOutcome::Started { okcnt: 0, sparecnt: 0 });
    }
}
