//! CLI dispatch for `btrdedup` (`spec.md` §6): `scan-vol`, `dedup-vol`,
//! `show-vols`, `forget-vol`. Argument parsing here is deliberately manual,
//! matching the rest of this workspace's command binaries rather than
//! pulling in a parsing crate for four subcommands.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;

use btrdedup::catalog::Catalog;
use btrdedup::config::DEFAULT_SIZE_CUTOFF;
use btrdedup::fsprimitives::LinuxFs;
use btrdedup::mount_inventory::{LinuxMountInventory, MountInventory};
use btrdedup::orchestrator::Orchestrator;
use btrdedup::progress::StderrProgressSink;

/// Writes an error to stderr, then exits with status 1.
fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  btrdedup scan-vol <path> [--size-cutoff BYTES]");
    eprintln!("  btrdedup dedup-vol <path>...");
    eprintln!("  btrdedup show-vols");
    eprintln!("  btrdedup forget-vol <path>");
}

/// Where the catalog database lives. Overridable for testing/packaging via
/// `BTRDEDUP_CATALOG`; otherwise a single host-wide file under `/var/lib`,
/// matching the "one catalog database per host" contract of `spec.md` §6.
fn catalog_path() -> PathBuf {
    env::var_os("BTRDEDUP_CATALOG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib/btrdedup/catalog.db"))
}

fn open_catalog() -> Catalog {
    let path = catalog_path();
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error("btrdedup", format_args!("cannot create {}: {e}", parent.display()));
        }
    }
    Catalog::open(&path).unwrap_or_else(|e| {
        error("btrdedup", format_args!("cannot open catalog at {}: {e}", path.display()))
    })
}

fn main() {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage();
        exit(1);
    };

    match cmd.as_str() {
        "scan-vol" => cmd_scan_vol(args),
        "dedup-vol" => cmd_dedup_vol(args),
        "show-vols" => cmd_show_vols(),
        "forget-vol" => cmd_forget_vol(args),
        "-h" | "--help" | "help" => {
            print_usage();
        }
        other => {
            eprintln!("btrdedup: unknown command `{other}`");
            print_usage();
            exit(1);
        }
    }
}

fn cmd_scan_vol(mut args: impl Iterator<Item = String>) {
    let mut path = None;
    let mut size_cutoff = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--size-cutoff" => {
                let value = args
                    .next()
                    .unwrap_or_else(|| error("btrdedup", "--size-cutoff requires a value"));
                size_cutoff = Some(value.parse::<u64>().unwrap_or_else(|_| {
                    error("btrdedup", format_args!("invalid --size-cutoff value `{value}`"))
                }));
            }
            _ if path.is_none() => path = Some(PathBuf::from(arg)),
            _ => error("btrdedup", "scan-vol takes exactly one path"),
        }
    }
    let Some(path) = path else {
        print_usage();
        exit(1);
    };

    let catalog = open_catalog();
    let orchestrator = Orchestrator::new(LinuxFs, Default::default());
    let mut progress = StderrProgressSink::new(0);
    orchestrator
        .scan_vol(&catalog, &path, size_cutoff, &mut progress)
        .unwrap_or_else(|e| error("btrdedup", e));
}

fn cmd_dedup_vol(args: impl Iterator<Item = String>) {
    let paths: Vec<PathBuf> = args.map(PathBuf::from).collect();
    if paths.is_empty() {
        print_usage();
        exit(1);
    }

    let mut catalog = open_catalog();
    let orchestrator = Orchestrator::new(LinuxFs, Default::default());
    let mut progress = StderrProgressSink::new(0);
    let summary = orchestrator
        .dedup_vols(&mut catalog, &paths, &mut progress)
        .unwrap_or_else(|e| error("btrdedup", e));

    println!("{} extent clone(s) performed", summary.clones_performed);
    if !summary.skipped.is_empty() {
        println!("{} candidate(s) deferred to the next run", summary.skipped.len());
    }
}

fn cmd_show_vols() {
    let catalog = open_catalog();
    let inventory = LinuxMountInventory;
    let mpoints_by_dev = inventory.btrfs_mount_points().unwrap_or_default();
    let blkid_entries = inventory.blkid_btrfs_devices().unwrap_or_default();

    let mut seen_fs_ids = Vec::new();
    for entry in &blkid_entries {
        if let Some(label) = &entry.label {
            println!("{}\n  Label: {label} UUID: {}", entry.device.display(), entry.uuid);
        } else {
            println!("{}\n  UUID: {}", entry.device.display(), entry.uuid);
        }

        let Ok(uuid) = entry.uuid.parse::<uuid::Uuid>() else {
            continue;
        };
        let Some(fs) = catalog
            .list_filesystems()
            .unwrap_or_default()
            .into_iter()
            .find(|f| f.uuid == uuid)
        else {
            continue;
        };
        seen_fs_ids.push(fs.id);
        show_fs(&catalog, fs.id, mpoints_by_dev.get(&entry.device));
    }

    for fs in catalog.list_filesystems().unwrap_or_default() {
        if seen_fs_ids.contains(&fs.id) {
            continue;
        }
        println!("<device unavailable>\n  UUID: {}", fs.uuid);
        show_fs(&catalog, fs.id, None);
    }
}

fn show_fs(
    catalog: &Catalog,
    fs_id: i64,
    mount_points: Option<&Vec<btrdedup::mount_inventory::BtrfsMountPoint>>,
) {
    for vol in catalog.list_volumes(fs_id).unwrap_or_default() {
        println!(
            "    Volume {} last tracked generation {} size cutoff {}",
            vol.root_id, vol.last_tracked_generation, vol.size_cutoff
        );
        let count = catalog.inode_count(vol.id).unwrap_or(0);
        println!("      {count} inodes tracked");
        if let Some(mpoints) = mount_points {
            for m in mpoints {
                println!("      Mounted on {}", m.mount_point.display());
            }
        } else if let Ok(history) = catalog.path_history(vol.id) {
            if let Some(last) = history.last() {
                println!("      Last mounted on {last}");
            }
        }
    }
}

fn cmd_forget_vol(mut args: impl Iterator<Item = String>) {
    let Some(path) = args.next() else {
        print_usage();
        exit(1);
    };
    let path = PathBuf::from(path);

    let catalog = open_catalog();
    let orchestrator = Orchestrator::new(LinuxFs, Default::default());
    let vol = orchestrator
        .open_volume(&catalog, &path, DEFAULT_SIZE_CUTOFF)
        .unwrap_or_else(|e| error("btrdedup", e));
    catalog
        .forget_volume(vol.id)
        .unwrap_or_else(|e| error("btrdedup", e));
    println!("forgot tracked inodes for volume {}", path.display());
}
