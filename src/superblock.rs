#![allow(dead_code)]
//! The version-0.90 MD superblock: the fixed on-disk record every member
//! device of a classic Linux software RAID array carries.
//!
//! Field layout follows the shape of `<linux/raid/md_p.h>`; this module is
//! both the reader and the writer, so internal consistency (not byte-for-byte
//! agreement with a particular kernel header revision) is what matters here.

use std::convert::TryInto;
use std::fs::File;
use std::io::{Seek, SeekFrom};

use anyhow::{bail, Context};
use bincode::{DefaultOptions, Options};
use serde::{Deserialize, Serialize};

use crate::array::Array;
use crate::hilo;

/// Number of per-device slots the 0.90 layout reserves, data and spare alike.
pub const MAX_SLOTS: usize = 28;

/// Identifies a version-0.90 superblock.
pub const MD_SB_MAGIC: u32 = 0xa92b4efc;

/// Words making up the "generic constant" prefix. Used as the shift origin
/// for the `sparc2.2` update mode's one-word tail correction.
pub const MD_SB_GENERIC_CONSTANT_WORDS: usize = 32;

/// `state` bit: the array was cleanly stopped (no resync owed).
pub const MD_SB_CLEAN: u32 = 1 << 0;

/// A `this_disk.raid_disk`/`disks[i].raid_disk` value at or above this is the
/// sentinel for "not currently in a slot".
pub const NO_SLOT: u32 = 10000;

/// Per-slot device state bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskState(pub u32);

impl DiskState {
    pub const FAULTY: u32 = 1 << 0;
    pub const ACTIVE: u32 = 1 << 1;
    pub const SYNC: u32 = 1 << 2;
    pub const REMOVED: u32 = 1 << 3;

    pub const fn active_sync() -> Self
    {
        Self(Self::ACTIVE | Self::SYNC)
    }

    pub fn is_faulty(&self) -> bool { self.0 & Self::FAULTY != 0 }
    pub fn is_active(&self) -> bool { self.0 & Self::ACTIVE != 0 }
    pub fn is_sync(&self) -> bool { self.0 & Self::SYNC != 0 }
    pub fn is_removed(&self) -> bool { self.0 & Self::REMOVED != 0 }
}

/// A single slot's record: which device occupies it and its state, as the
/// superblock on some (possibly different) device describes it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub number: u32,
    pub major: u32,
    pub minor: u32,
    pub raid_disk: u32,
    pub state: DiskState,
}

/// The version-0.90 MD superblock.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Superblock {
    // --- generic constant section (MD_SB_GENERIC_CONSTANT_WORDS) ---
    pub md_magic: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    pub gvalid_words: u32,
    pub set_uuid0: u32,
    pub ctime: u32,
    pub level: i32,
    pub size: u32,
    pub raid_disks: u32,
    pub md_minor: u32,
    pub not_persistent: u32,
    pub set_uuid1: u32,
    pub set_uuid2: u32,
    pub set_uuid3: u32,
    pub chunk_size: u32,
    // --- generic state section ---
    pub utime: u32,
    pub state: u32,
    pub active_disks: u32,
    pub working_disks: u32,
    pub failed_disks: u32,
    pub spare_disks: u32,
    pub nr_disks: u32,
    pub sb_csum: u32,
    pub events_hi: u32,
    pub events_lo: u32,
    pub recovery_cp: u32,
    pub layout: u32,
    // --- this device, and the table of all slots ---
    pub this_disk: DiskDescriptor,
    pub disks: Array<DiskDescriptor, MAX_SLOTS>,
}

impl Default for Superblock {
    fn default() -> Self
    {
        Self {
            md_magic: MD_SB_MAGIC,
            major_version: 0,
            minor_version: 90,
            patch_version: 0,
            gvalid_words: 0,
            set_uuid0: 0,
            ctime: 0,
            level: 0,
            size: 0,
            raid_disks: 0,
            md_minor: 0,
            not_persistent: 0,
            set_uuid1: 0,
            set_uuid2: 0,
            set_uuid3: 0,
            chunk_size: 0,
            utime: 0,
            state: 0,
            active_disks: 0,
            working_disks: 0,
            failed_disks: 0,
            spare_disks: 0,
            nr_disks: 0,
            sb_csum: 0,
            events_hi: 0,
            events_lo: 0,
            recovery_cp: 0,
            layout: 0,
            this_disk: DiskDescriptor::default(),
            disks: Array::default(),
        }
    }
}

impl Superblock {
    pub fn is_clean(&self) -> bool { self.state & MD_SB_CLEAN != 0 }

    pub fn set_clean(&mut self) { self.state |= MD_SB_CLEAN; }

    pub fn clear_clean(&mut self) { self.state &= !MD_SB_CLEAN; }
}

fn bincode_opts() -> impl Options
{
    DefaultOptions::new().with_fixint_encoding().allow_trailing_bytes()
}

/// Classic MD reserves the superblock in the last 64K-aligned block of the
/// device, sized relative to the device's own length.
pub const MD_RESERVED_BYTES: u64 = 64 * 1024;

/// Byte offset of the superblock on a device of the given size.
pub fn superblock_offset(device_size: u64) -> u64
{
    let usable = device_size & !(MD_RESERVED_BYTES - 1);
    usable.saturating_sub(MD_RESERVED_BYTES)
}

/// Load a superblock from `file`, which must be positioned anywhere (this
/// seeks itself) and whose total size is `device_size`.
pub fn load(file: &mut File, device_size: u64) -> anyhow::Result<Superblock>
{
    file.seek(SeekFrom::Start(superblock_offset(device_size)))
        .context("seeking to superblock offset")?;

    let sb: Superblock = bincode_opts()
        .deserialize_from(&mut *file)
        .context("decoding superblock")?;

    if sb.md_magic != MD_SB_MAGIC {
        bail!("bad magic: {:#x}", sb.md_magic);
    }
    if checksum(&sb) != sb.sb_csum {
        bail!("bad superblock checksum");
    }

    Ok(sb)
}

/// Write `sb` back to `file` at the superblock offset for `device_size`.
/// Does not recompute `sb_csum` — callers update fields and call
/// [`checksum`] themselves, exactly as the force loop and reconciler do, so
/// that a caller who wants to inspect the pre-checksum state still can.
pub fn store(file: &mut File, sb: &Superblock, device_size: u64) -> anyhow::Result<()>
{
    file.seek(SeekFrom::Start(superblock_offset(device_size)))
        .context("seeking to superblock offset")?;

    bincode_opts()
        .serialize_into(&mut *file, sb)
        .context("encoding superblock")?;

    Ok(())
}

/// The classic MD checksum: sum of the record's 32-bit words, with `sb_csum`
/// itself treated as zero, using wrapping arithmetic.
pub fn checksum(sb: &Superblock) -> u32
{
    let mut tmp = *sb;
    tmp.sb_csum = 0;

    let bytes = bincode_opts()
        .serialize(&tmp)
        .expect("a fixed-layout superblock always serializes");

    let mut sum: u32 = 0;
    for word in bytes.chunks(4) {
        if word.len() == 4 {
            sum = sum.wrapping_add(u32::from_le_bytes(word.try_into().unwrap()));
        } else {
            let mut padded = [0u8; 4];
            padded[..word.len()].copy_from_slice(word);
            sum = sum.wrapping_add(u32::from_le_bytes(padded));
        }
    }

    sum
}

/// Structural equality of the generic-constant prefix: magic, set UUID,
/// level, raid_disks, layout, size, chunk size, ctime. Returns `true` when
/// the two superblocks describe the same array.
pub fn compare(reference: &Superblock, candidate: &Superblock) -> bool
{
    reference.md_magic == candidate.md_magic
        && uuid_of(reference) == uuid_of(candidate)
        && reference.level == candidate.level
        && reference.raid_disks == candidate.raid_disks
        && reference.layout == candidate.layout
        && reference.size == candidate.size
        && reference.chunk_size == candidate.chunk_size
        && reference.ctime == candidate.ctime
}

/// The 128-bit set UUID, assembled from the four `set_uuid*` words.
pub fn uuid_of(sb: &Superblock) -> u128
{
    ((sb.set_uuid0 as u128) << 96)
        | ((sb.set_uuid1 as u128) << 64)
        | ((sb.set_uuid2 as u128) << 32)
        | (sb.set_uuid3 as u128)
}

/// The 64-bit event counter, combined from the hi/lo halves.
pub fn event_counter(sb: &Superblock) -> u64
{
    hilo!(sb.events_hi, sb.events_lo)
}

/// Split a 64-bit event counter back into the hi/lo halves and store them.
pub fn set_event_counter(sb: &mut Superblock, events: u64)
{
    sb.events_hi = (events >> 32) as u32;
    sb.events_lo = events as u32;
}

/// Decompose a superblock into its raw 32-bit words, in on-disk order.
/// Used by the `sparc2.2` update mode, which operates on the record at the
/// word level rather than through named fields.
pub(crate) fn to_words(sb: &Superblock) -> Vec<u32>
{
    let bytes = bincode_opts()
        .serialize(sb)
        .expect("a fixed-layout superblock always serializes");

    bytes
        .chunks(4)
        .map(|word| u32::from_le_bytes(word.try_into().expect("superblock size is word-aligned")))
        .collect()
}

/// Rebuild a superblock from raw 32-bit words produced by [`to_words`].
pub(crate) fn from_words(words: &[u32]) -> anyhow::Result<Superblock>
{
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }

    bincode_opts()
        .deserialize(&bytes)
        .context("decoding superblock from shifted words")
}
