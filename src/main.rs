use std::fs::OpenOptions;
use std::process::ExitCode;

use clap::Parser;

mod array;
mod assemble;
mod bitmap;
mod config;
mod config_file;
mod device;
mod driver;
mod identity;
mod logger;
mod quorum;
mod reconcile;
mod slot_map;
mod superblock;
mod update;
mod util;

use assemble::{assemble, AssembleOutcome, AssembleRequest};
use config::Config;
use logger::Logger;

fn main() -> ExitCode
{
    let args = config::Args::parse();
    let cfg = match Config::from_args(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("mdassemble: error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_file = match &cfg.log_file {
        Some(path) => match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("mdassemble: error: {}: {}", path.display(), e);
                None
            }
        },
        None => None,
    };

    let mut logger = Logger::new(cfg.verbose, log_file);

    let (device_paths, identity, explicit) = match resolve_devices(&cfg, &mut logger) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("mdassemble: error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let request = AssembleRequest {
        array_device: cfg.array_device.clone(),
        identity,
        device_paths,
        explicit,
        force: cfg.force,
        runstop: cfg.runstop,
        update: cfg.update,
    };

    match assemble(&request, &mut logger) {
        Ok(outcome) => report(&cfg, outcome, &mut logger),
        Err(e) => {
            eprintln!("mdassemble: error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve the device list to probe: the explicit CLI list if given,
/// otherwise every `DEVICE` glob from the config file, plus whatever
/// identity fields the matching `ARRAY` line (if any) contributes.
fn resolve_devices(cfg: &Config, logger: &mut Logger) -> anyhow::Result<(Vec<std::path::PathBuf>, identity::ArrayIdentity, bool)>
{
    if !cfg.devices.is_empty() {
        return Ok((cfg.devices.clone(), cfg.identity.clone(), true));
    }

    let file = config_file::read(&cfg.config_file)?;

    let mut identity = cfg.identity.clone();
    if identity.is_empty() {
        let array_path = cfg.array_device.to_string_lossy();
        if let Some(line) = file.arrays.iter().find(|a| {
            a.devices.as_ref().map_or(false, |d| d.iter().any(|p| p == array_path.as_ref()))
        }) {
            identity.uuid = identity.uuid.or(line.uuid);
            identity.super_minor = identity.super_minor.or(line.super_minor);
            identity.level = identity.level.or(line.level);
            identity.raid_disks = identity.raid_disks.or(line.raid_disks);
        }
    }

    if file.device_globs.is_empty() {
        logger.warn(&format!("no DEVICE lines found in {}", cfg.config_file.display()));
    }

    let mut device_paths = Vec::new();
    for pattern in &file.device_globs {
        let mut matched_any = false;
        match glob::glob(pattern) {
            Ok(paths) => {
                for entry in paths {
                    match entry {
                        Ok(path) => {
                            matched_any = true;
                            device_paths.push(path);
                        }
                        Err(e) => logger.warn(&format!("error reading glob entry for {pattern}: {e}")),
                    }
                }
            }
            Err(e) => {
                logger.warn(&format!("bad DEVICE pattern {pattern}: {e}"));
                continue;
            }
        }
        if !matched_any {
            // A DEVICE line with no special glob characters names a device
            // that just doesn't exist yet (e.g. hot-plug); take it literally
            // so probing can report the real reason it's unusable.
            if !pattern.contains(['*', '?', '[']) {
                device_paths.push(std::path::PathBuf::from(pattern));
            } else {
                logger.info(&format!("{pattern} does not match any device"));
            }
        }
    }
    Ok((device_paths, identity, false))
}

fn report(cfg: &Config, outcome: AssembleOutcome, logger: &mut Logger) -> ExitCode
{
    match outcome {
        AssembleOutcome::Assembled { working, failed, spares, degraded, started } => {
            logger.info(&format!(
                "{} assembled from {} working, {} failed, {} spare device(s){}{}",
                cfg.array_device.display(),
                working,
                failed,
                spares,
                if degraded { " (degraded)" } else { "" },
                if started { "" } else { ", but not started" }
            ));
            ExitCode::SUCCESS
        }
        AssembleOutcome::InsufficientDrives { available, needed } => {
            eprintln!(
                "mdassemble: error: {} needs {} devices, only {} available",
                cfg.array_device.display(),
                needed,
                available
            );
            ExitCode::FAILURE
        }
        AssembleOutcome::NoSuperblocksFound => {
            eprintln!("mdassemble: error: no RAID superblocks found for {}", cfg.array_device.display());
            ExitCode::FAILURE
        }
        AssembleOutcome::Aborted(reason) => {
            eprintln!("mdassemble: error: {reason}");
            ExitCode::FAILURE
        }
    }
}
