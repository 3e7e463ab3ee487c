//! Metadata update modes: superblock rewrites requested explicitly by the
//! caller rather than derived from quorum/reconciliation.

use crate::superblock::{self, DiskState, Superblock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Recompute the checksum using the old sparc64 2.2-kernel formula,
    /// for superblocks written by that buggy kernel.
    Sparc22,
    /// Rehome the array onto a different `/dev/mdN` minor number.
    SuperMinor(u32),
    /// Recompute `active_disks`/`working_disks`/`failed_disks`/`spare_disks`
    /// from the disk table, discarding whatever the superblock currently
    /// claims.
    Summaries,
    /// Force a full resync on next start: clear the clean bit and reset the
    /// recovery checkpoint.
    Resync,
}

impl UpdateMode {
    pub fn parse(name: &str, new_minor: Option<u32>) -> anyhow::Result<Self>
    {
        match name {
            "sparc2.2" => Ok(Self::Sparc22),
            "super-minor" => {
                let minor = new_minor.ok_or_else(|| anyhow::anyhow!("super-minor update requires a minor number"))?;
                Ok(Self::SuperMinor(minor))
            }
            "summaries" => Ok(Self::Summaries),
            "resync" => Ok(Self::Resync),
            other => Err(anyhow::anyhow!("unknown update mode {other:?}")),
        }
    }
}

pub fn apply(mode: UpdateMode, sb: &mut Superblock)
{
    match mode {
        UpdateMode::Sparc22 => {
            *sb = sparc22_shift(sb);
            sb.sb_csum = superblock::checksum(sb);
        }
        UpdateMode::SuperMinor(minor) => {
            sb.md_minor = minor;
            sb.this_disk.minor = minor;
        }
        UpdateMode::Summaries => {
            recompute_summaries(sb);
        }
        UpdateMode::Resync => {
            sb.clear_clean();
            sb.recovery_cp = 0;
        }
    }
}

/// A buggy sparc64 2.2-kernel MD driver wrote one legacy generic-section
/// field that later kernels don't expect, leaving everything after it
/// shifted one word late. Correct it by shifting the tail of the generic
/// section up by one word, starting right after the field that's missing
/// on every other architecture; the final word is left untouched (nothing
/// shifts into it).
fn sparc22_shift(sb: &Superblock) -> Superblock
{
    let mut words = superblock::to_words(sb);
    let start = superblock::MD_SB_GENERIC_CONSTANT_WORDS + 7;

    for i in start..words.len() - 1 {
        words[i] = words[i + 1];
    }

    superblock::from_words(&words).expect("shifted superblock words still decode")
}

fn recompute_summaries(sb: &mut Superblock)
{
    let mut active = 0u32;
    let mut working = 0u32;
    let mut failed = 0u32;
    let mut spare = 0u32;

    for disk in sb.disks.0.iter() {
        if disk.state == DiskState::default() && disk.major == 0 && disk.minor == 0 {
            continue;
        }
        if disk.state.is_faulty() {
            failed += 1;
            continue;
        }
        working += 1;
        if disk.state.is_active() && disk.state.is_sync() {
            active += 1;
        } else {
            spare += 1;
        }
    }

    sb.active_disks = active;
    sb.working_disks = working;
    sb.failed_disks = failed;
    sb.spare_disks = spare;
    sb.nr_disks = active + failed + spare;
}
