//! smrdb Tool - Disk administration
//!
//! This binary formats, inspects and defragments smrdb zoned disks.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use smrdb_common::DiskConfig;
use smrdb_storage::{Disk, SmrFs};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "smrdb-tool")]
#[command(about = "smrdb zoned disk administration")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/smrdb/disk.toml")]
    config: String,

    /// Device or image path (overrides the config file)
    #[arg(short, long, env = "SMRDB_DISK")]
    disk: Option<PathBuf>,

    /// Zone size in MiB (overrides the config file)
    #[arg(long)]
    zone_size_mib: Option<u64>,

    /// Number of zones (overrides the config file)
    #[arg(long)]
    zones: Option<u32>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Erase all metadata and write fresh superblocks
    Format,
    /// Print disk metadata as JSON
    Info,
    /// Print the zone usage report
    Usage,
    /// Compact fragmented zones of a level
    Defrag {
        #[arg(short, long, default_value = "0")]
        level: usize,
    },
    /// Verify superblocks and zone accounting
    Check,
    /// Copy a local file into a disk file
    Write {
        /// Disk file name, e.g. 000001.sst
        name: String,
        /// Local input file (stdin when absent)
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long, default_value = "0")]
        level: usize,
    },
    /// Copy a disk file out
    Read {
        name: String,
        /// Local output file (stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List files on the disk
    Ls,
    /// Delete a disk file
    Rm { name: String },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    disk: Option<DiskConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    toml::from_str(&text).with_context(|| format!("parsing {path}"))
}

/// Merge CLI flags over the config file (CLI takes precedence)
fn disk_config(args: &Args, config: Option<DiskConfig>) -> Result<DiskConfig> {
    let mut cfg = match (config, &args.disk) {
        (Some(mut cfg), Some(path)) => {
            cfg.path.clone_from(path);
            cfg
        }
        (Some(cfg), None) => cfg,
        (None, Some(path)) => DiskConfig::new(path),
        (None, None) => bail!("no disk given: use --disk or a [disk] section in {}", args.config),
    };
    if let Some(mib) = args.zone_size_mib {
        cfg = cfg.with_zone_size(mib * 1024 * 1024);
    }
    if let Some(zones) = args.zones {
        cfg = cfg.with_num_zones(zones);
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let log_level = if args.log_level == "warn" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut cfg = disk_config(&args, config.disk)?;
    if matches!(args.command, Commands::Check) {
        // never format over a damaged disk while checking it
        cfg = cfg.with_create_if_missing(false);
    }
    info!("opening {}", cfg.path.display());
    let disk = Disk::open(cfg).context("opening disk")?;
    run(&args.command, &disk)?;
    disk.shutdown();
    Ok(())
}

fn run(command: &Commands, disk: &Arc<Disk>) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match command {
        Commands::Format => {
            disk.clear()?;
            writeln!(out, "formatted {} zones", disk.geometry().num_zones)?;
        }
        Commands::Info => {
            serde_json::to_writer_pretty(&mut out, &disk.info())?;
            writeln!(out)?;
        }
        Commands::Usage => {
            write!(out, "{}", disk.zone_usage_report()?)?;
        }
        Commands::Defrag { level } => match disk.defragment(*level) {
            Ok(()) => writeln!(out, "level {level} defragmented")?,
            Err(e) if e.is_not_attempted() => writeln!(out, "level {level}: {e}")?,
            Err(e) => return Err(e.into()),
        },
        Commands::Check => {
            let good = disk.good_superblocks();
            if good < 2 {
                warn!("only {good} good superblocks");
            }
            disk.verify_zone_accounting()?;
            writeln!(out, "ok: {good} good superblocks, zone accounting consistent")?;
        }
        Commands::Write { name, input, level } => {
            let data = match input {
                Some(path) => {
                    std::fs::read(path).with_context(|| format!("reading {}", path.display()))?
                }
                None => {
                    let mut data = Vec::new();
                    std::io::stdin().read_to_end(&mut data)?;
                    data
                }
            };
            let fs = SmrFs::new(Arc::clone(disk));
            let file = fs.new_writable_file(name, *level)?;
            file.append(&data)?;
            file.close()?;
            writeln!(out, "wrote {} bytes to {name}", data.len())?;
        }
        Commands::Read { name, output } => {
            let fs = SmrFs::new(Arc::clone(disk));
            let reader = fs.new_sequential_file(name)?;
            let mut sink: Box<dyn Write> = match output {
                Some(path) => Box::new(
                    std::fs::File::create(path)
                        .with_context(|| format!("creating {}", path.display()))?,
                ),
                None => Box::new(std::io::stdout()),
            };
            let mut buf = vec![0u8; 1024 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buf[..n])?;
            }
            sink.flush()?;
        }
        Commands::Ls => {
            let fs = SmrFs::new(Arc::clone(disk));
            let mut names = fs.children();
            names.sort();
            for name in names {
                writeln!(out, "{name:<20} {}", fs.get_file_size(&name)?)?;
            }
        }
        Commands::Rm { name } => {
            SmrFs::new(Arc::clone(disk)).delete_file(name)?;
            disk.sync()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["smrdb-tool", "--config", "/nonexistent/disk.toml"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = args(&["--disk", "/tmp/other.img", "--zones", "100", "info"]);
        let file: Config = toml::from_str(
            r#"
            [disk]
            path = "/tmp/disk.img"
            zone_size = 1048576
            "#,
        )
        .unwrap();
        let cfg = disk_config(&args, file.disk).unwrap();
        assert_eq!(cfg.path, PathBuf::from("/tmp/other.img"));
        assert_eq!(cfg.zone_size, 1024 * 1024);
        assert_eq!(cfg.num_zones, Some(100));
    }

    #[test]
    fn test_missing_disk_is_an_error() {
        let args = args(&["usage"]);
        assert!(disk_config(&args, None).is_err());
        assert_eq!(load_config("/nonexistent/disk.toml").unwrap().logging.level, "warn");
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        let input = dir.path().join("in.bin");
        let output = dir.path().join("out.bin");
        std::fs::write(&input, b"hello zoned world").unwrap();

        let base = vec!["--disk", image.to_str().unwrap(), "--zone-size-mib", "1", "--zones", "96"];
        let mut argv = base.clone();
        argv.extend(["write", "000001.sst", "--input", input.to_str().unwrap()]);
        let write = args(&argv);
        let disk = Disk::open(disk_config(&write, None).unwrap()).unwrap();
        run(&write.command, &disk).unwrap();
        disk.shutdown();
        drop(disk);

        let mut argv = base;
        argv.extend(["read", "000001.sst", "--output", output.to_str().unwrap()]);
        let read = args(&argv);
        let disk = Disk::open(disk_config(&read, None).unwrap()).unwrap();
        run(&read.command, &disk).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"hello zoned world");
        run(&Commands::Check, &disk).unwrap();
    }
}
