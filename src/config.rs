//! Command-line argument parsing and the `Config` it's distilled into,
//! mirroring the `Args`/`Config` split the original CLI entry point used.

use std::path::PathBuf;

use clap::Parser;

use crate::identity::{self, ArrayIdentity};
use crate::update::UpdateMode;

#[derive(Debug, Parser)]
#[clap(name = "mdassemble", about = "Assemble a Linux software RAID array")]
pub struct Args {
    /// Array device to assemble onto, e.g. /dev/md0
    #[clap(parse(from_os_str), value_name = "ARRAY_DEVICE")]
    array_device: PathBuf,

    /// Explicit member device paths; when omitted, devices are taken from
    /// the config file's DEVICE lines
    #[clap(parse(from_os_str), value_name = "DEVICE")]
    devices: Vec<PathBuf>,

    /// Configuration file to scan when no devices were given explicitly
    #[clap(long, parse(from_os_str), value_name = "PATH", default_value = "/etc/mdadm.conf")]
    config: PathBuf,

    /// Restrict to a specific array UUID (as 32 hex digits, optionally
    /// separated by `:` or `-`)
    #[clap(long, value_name = "UUID")]
    uuid: Option<String>,

    /// Restrict to a specific array minor number
    #[clap(long, value_name = "N")]
    super_minor: Option<u32>,

    /// Restrict to a specific RAID level
    #[clap(long, value_name = "LEVEL")]
    level: Option<i32>,

    /// Restrict to a specific number of raid disks
    #[clap(long, value_name = "N")]
    raid_devices: Option<u32>,

    /// Open member devices read-only; still probes and reports, but never
    /// rewrites a superblock or issues a kernel control call
    #[clap(long)]
    readonly: bool,

    /// Override stale event counts to reach quorum rather than fail
    #[clap(long)]
    force: bool,

    /// Log informational messages, not just warnings
    #[clap(short, long)]
    verbose: bool,

    /// Start the array even if degraded
    #[clap(long)]
    run: bool,

    /// Refuse to start a degraded array
    #[clap(long = "no-degraded")]
    no_degraded: bool,

    /// Rewrite superblocks under one of the recognized update modes
    #[clap(long, value_name = "MODE")]
    update: Option<String>,

    /// New minor number for the super-minor update mode
    #[clap(long, value_name = "N")]
    update_minor: Option<u32>,

    /// Tee diagnostics into this file in addition to stderr
    #[clap(long, parse(from_os_str), value_name = "PATH")]
    log_file: Option<PathBuf>,
}

/// How aggressively to start the array once quorum is decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStop {
    /// `--run`: start even if degraded.
    Run,
    /// `--no-degraded`: refuse to start a degraded array.
    NoDegraded,
    /// Neither flag given: start unless quorum itself fails.
    Default,
}

#[derive(Debug)]
pub struct Config {
    pub array_device: PathBuf,
    pub devices: Vec<PathBuf>,
    pub config_file: PathBuf,
    pub identity: ArrayIdentity,
    pub readonly: bool,
    pub force: bool,
    pub verbose: bool,
    pub runstop: RunStop,
    pub update: Option<UpdateMode>,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn from_args(args: Args) -> anyhow::Result<Self>
    {
        let uuid = args
            .uuid
            .as_deref()
            .map(identity::parse_uuid)
            .transpose()?;

        let update = args
            .update
            .as_deref()
            .map(|name| UpdateMode::parse(name, args.update_minor))
            .transpose()?;

        let runstop = match (args.run, args.no_degraded) {
            (true, true) => anyhow::bail!("--run and --no-degraded are mutually exclusive"),
            (true, false) => RunStop::Run,
            (false, true) => RunStop::NoDegraded,
            (false, false) => RunStop::Default,
        };

        Ok(Self {
            array_device: args.array_device,
            devices: args.devices,
            config_file: args.config,
            identity: ArrayIdentity {
                uuid,
                super_minor: args.super_minor,
                level: args.level,
                raid_disks: args.raid_devices,
                devices: None,
            },
            readonly: args.readonly,
            force: args.force,
            verbose: args.verbose,
            runstop,
            update,
            log_file: args.log_file,
        })
    }
}
