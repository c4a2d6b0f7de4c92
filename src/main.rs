//! Command-line frontend over the backup engine: scan for backups,
//! inspect one, list its virtual files, extract a file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mobilesync::discover::{is_valid_backup_item, scan_backups};
use mobilesync::index::{ArchiveIndex, LoadOptions, ManifestKind};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Read and inspect iOS backup archives (Manifest.mbdb and Manifest.db)"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a directory (or MobileSync container) for backups
    List {
        /// Directory to scan
        root: PathBuf,
    },
    /// Validate one backup directory and show its metadata
    Info {
        /// Backup directory
        backup: PathBuf,
    },
    /// List the virtual paths inside a backup
    Ls {
        /// Backup directory
        backup: PathBuf,
        /// Restrict to one backup domain (e.g. AppDomain-com.tencent.xin)
        #[arg(short, long)]
        domain: Option<String>,
        /// Include directory and symlink rows, not just files
        #[arg(short, long)]
        all: bool,
    },
    /// Copy one virtual file out of a backup
    Extract {
        /// Backup directory
        backup: PathBuf,
        /// Virtual path inside the backup (domain-relative)
        virtual_path: String,
        /// Destination file
        dest: PathBuf,
        /// Restrict the index pass to one backup domain
        #[arg(short, long)]
        domain: Option<String>,
        /// Replace the destination if it already exists
        #[arg(long)]
        overwrite: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::List { root } => list(root),
        Command::Info { backup } => info(backup),
        Command::Ls {
            backup,
            domain,
            all,
        } => ls(backup, domain, all),
        Command::Extract {
            backup,
            virtual_path,
            dest,
            domain,
            overwrite,
        } => extract(backup, &virtual_path, dest, domain, overwrite),
    }
}

fn list(root: PathBuf) -> Result<()> {
    let scan = scan_backups(&root);
    for line in &scan.log {
        eprintln!("{line}");
    }
    if scan.backups.is_empty() {
        bail!("no backups found under {}", root.display());
    }
    for b in &scan.backups {
        let when = b
            .backup_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown time".to_string());
        let lock = if b.encrypted { " [encrypted]" } else { "" };
        println!(
            "{}  {}  iOS {}{}  {}",
            when,
            b.device_name,
            b.ios_version,
            lock,
            b.path.display()
        );
    }
    Ok(())
}

fn info(backup: PathBuf) -> Result<()> {
    let mut log = Vec::new();
    let valid = is_valid_backup_item(&backup, &mut log);
    for line in &log {
        eprintln!("{line}");
    }
    if !valid {
        bail!("{} is not a usable backup", backup.display());
    }
    let scan = scan_backups(&backup);
    let Some(b) = scan.backups.first() else {
        bail!("{}: unreadable backup metadata", backup.display());
    };
    println!("Device:   {} ({})", b.device_name, b.display_name);
    println!("iOS:      {} ({})", b.ios_version, b.build_version);
    println!("iTunes:   {}", b.itunes_version);
    if let Some(t) = b.backup_time {
        println!("Taken:    {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("Encrypted: {}", if b.encrypted { "yes" } else { "no" });

    let index = open_index(&backup, None, true)?;
    let kind = match index.kind() {
        ManifestKind::Mbdb => "Manifest.mbdb (binary)",
        ManifestKind::Sqlite => "Manifest.db (SQLite)",
    };
    println!("Manifest: {kind}, {} files", index.len());
    Ok(())
}

fn ls(backup: PathBuf, domain: Option<String>, all: bool) -> Result<()> {
    let index = open_index(&backup, domain.as_deref(), !all)?;
    for rec in index.records() {
        println!("{}\t{}\t{}", rec.domain, rec.relative_path, rec.file_id);
    }
    Ok(())
}

fn extract(
    backup: PathBuf,
    virtual_path: &str,
    dest: PathBuf,
    domain: Option<String>,
    overwrite: bool,
) -> Result<()> {
    let index = open_index(&backup, domain.as_deref(), true)?;
    if !index.copy_file(virtual_path, &dest, overwrite) {
        bail!("could not extract {virtual_path}");
    }
    println!("{} -> {}", virtual_path, dest.display());
    Ok(())
}

fn open_index(backup: &std::path::Path, domain: Option<&str>, only_files: bool) -> Result<ArchiveIndex> {
    ArchiveIndex::load(
        backup,
        &LoadOptions {
            domain,
            only_files,
            keep: None,
        },
    )
    .with_context(|| format!("loading manifest from {}", backup.display()))
}
