//! A minimal reader for the `mdadm.conf`-style config file: `DEVICE` and
//! `ARRAY` lines, `#` comments, blank lines skipped, anything else ignored.

use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::identity;

/// One `ARRAY` line: the identity it names plus the device glob(s) that
/// line itself may restrict the search to.
#[derive(Clone, Debug, Default)]
pub struct ArrayLine {
    pub devices: Option<Vec<String>>,
    pub uuid: Option<u128>,
    pub super_minor: Option<u32>,
    pub level: Option<i32>,
    pub raid_disks: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigFile {
    /// Device globs collected from every `DEVICE` line, in file order.
    pub device_globs: Vec<String>,
    pub arrays: Vec<ArrayLine>,
}

pub fn read(path: &Path) -> anyhow::Result<ConfigFile>
{
    let text = fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
    parse(&text)
}

pub fn parse(text: &str) -> anyhow::Result<ConfigFile>
{
    let mut config = ConfigFile::default();

    for raw_line in text.lines() {
        let line = match raw_line.find('#') {
            Some(idx) => &raw_line[..idx],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else { continue };

        match keyword {
            "DEVICE" => config.device_globs.extend(words.map(str::to_string)),
            "ARRAY" => config.arrays.push(parse_array_line(words)?),
            _ => {} // unknown keyword, ignored
        }
    }

    Ok(config)
}

fn parse_array_line<'a>(words: impl Iterator<Item = &'a str>) -> anyhow::Result<ArrayLine>
{
    let mut line = ArrayLine::default();

    for word in words {
        if let Some(value) = word.strip_prefix("uuid=") {
            line.uuid = Some(identity::parse_uuid(value)?);
        } else if let Some(value) = word.strip_prefix("super-minor=") {
            line.super_minor = Some(value.parse().with_context(|| format!("invalid super-minor {value:?}"))?);
        } else if let Some(value) = word.strip_prefix("level=") {
            line.level = Some(parse_level(value)?);
        } else if let Some(value) = word.strip_prefix("raid-disks=") {
            line.raid_disks = Some(value.parse().with_context(|| format!("invalid raid-disks {value:?}"))?);
        } else if word.starts_with("/dev/") || word.contains('*') {
            line.devices.get_or_insert_with(Vec::new).push(word.to_string());
        }
        // anything else (name=, spares=, auto=, ...) is accepted but unused
    }

    Ok(line)
}

fn parse_level(value: &str) -> anyhow::Result<i32>
{
    match value {
        "linear" => Ok(-1),
        "multipath" => Ok(-4),
        "raid0" | "0" => Ok(0),
        "raid1" | "1" => Ok(1),
        "raid4" | "4" => Ok(4),
        "raid5" | "5" => Ok(5),
        "raid6" | "6" => Ok(6),
        "raid10" | "10" => Ok(10),
        other => other.parse().with_context(|| format!("unrecognized level {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lines_accumulate_across_the_file()
    {
        let cfg = parse("DEVICE /dev/sd[a-z]1\nDEVICE /dev/hd*\n").unwrap();
        assert_eq!(cfg.device_globs, vec!["/dev/sd[a-z]1", "/dev/hd*"]);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored()
    {
        let cfg = parse("# a comment\n\nDEVICE /dev/sda1 # trailing comment\n").unwrap();
        assert_eq!(cfg.device_globs, vec!["/dev/sda1"]);
    }

    #[test]
    fn array_line_parses_uuid_and_level()
    {
        let cfg = parse("ARRAY /dev/md0 level=raid5 raid-disks=3 uuid=12345678:9abcdef0:00000000:00000000\n").unwrap();
        assert_eq!(cfg.arrays.len(), 1);
        let a = &cfg.arrays[0];
        assert_eq!(a.level, Some(5));
        assert_eq!(a.raid_disks, Some(3));
        assert!(a.uuid.is_some());
        assert_eq!(a.devices, Some(vec!["/dev/md0".to_string()]));
    }

    #[test]
    fn unknown_keywords_are_ignored()
    {
        let cfg = parse("MAILADDR root@localhost\nDEVICE /dev/sda1\n").unwrap();
        assert_eq!(cfg.device_globs, vec!["/dev/sda1"]);
        assert!(cfg.arrays.is_empty());
    }
}
