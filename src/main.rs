// Policy engine CLI binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::{debug, info, warn};

use robin_policy::attrs::{AttrMask, EntryAttributes, EntryStatus, EntryType};
use robin_policy::backend::Backend;
use robin_policy::catalog::{Catalog, CmpOp, Filter, IterOptions, Predicate, Table};
use robin_policy::changelog::{ChangelogSource, FileChangelogSource};
use robin_policy::config::{Config, FsKeyKind};
use robin_policy::constants::{FS_KEY_VAR, FS_PATH_VAR};
use robin_policy::fsaccess::{self, FsAccess, FsIdentity, StatResult};
use robin_policy::id::EntryId;
use robin_policy::idconstraint::IdConstraint;
use robin_policy::pipeline::{stage, FetchFlags, Pipeline, PipelineContext, PipelineOp, StageName};
use robin_policy::scrubber::Scrubber;

#[derive(Parser)]
#[command(name = "robin-policy")]
#[command(about = "Policy engine for a large parallel filesystem", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file. Defaults to `policy.toml` in the
    /// current directory, falling back to the platform config directory
    /// (e.g. `~/.config/robin-policy/policy.toml`) if that isn't present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let cwd_default = PathBuf::from("policy.toml");
    if cwd_default.exists() {
        return cwd_default;
    }
    if let Some(dirs) = ProjectDirs::from("", "", "robin-policy") {
        let candidate = dirs.config_dir().join("policy.toml");
        if candidate.exists() {
            return candidate;
        }
    }
    cwd_default
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the monitored filesystem and feed discovered entries into the pipeline.
    Scan {
        /// Subtree to scan; defaults to the configured fs_path.
        path: Option<PathBuf>,
    },
    /// Apply a change-log file's records through the pipeline, acking as they complete.
    ApplyChangelog {
        /// Newline-delimited JSON change-log file.
        path: PathBuf,
    },
    /// Print an entry's catalog status.
    Status {
        /// Primary key (as printed by `scan`/`apply-changelog`), in hex.
        primary_key: String,
    },
    /// Walk the catalog from its roots, removing entries the current generation never touched.
    Sweep,
    /// Archive one entry immediately, bypassing the pipeline.
    Archive {
        /// Path of the entry to archive.
        path: PathBuf,
    },
    /// Recover one entry from the backend into the filesystem.
    Recover {
        /// Path to restore into.
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);
    let config = Config::from_file(&config_path).with_context(|| format!("loading {}", config_path.display()))?;

    let host = hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "unknown-host".to_string());
    debug!("robin-policy starting on {}", host);

    match cli.command {
        Commands::Scan { path } => cmd_scan(&config, path),
        Commands::ApplyChangelog { path } => cmd_apply_changelog(&config, &path),
        Commands::Status { primary_key } => cmd_status(&config, &primary_key),
        Commands::Sweep => cmd_sweep(&config),
        Commands::Archive { path } => cmd_archive(&config, &path),
        Commands::Recover { path } => cmd_recover(&config, &path),
    }
}

/// Establishes the process-wide fs identity once, from the configured mount,
/// and cross-checks it against the catalog's persisted `FS_path`/`FS_key`
/// vars (spec.md §6: "Mismatch on restart is fatal").
fn init_identity(config: &Config, catalog: &Catalog) -> Result<()> {
    let expected_type = config.fs_type.as_str();
    let mount = FsAccess::check_fs_info(&config.fs_path, expected_type, config.check_mounted)
        .with_context(|| format!("checking {}", config.fs_path.display()))?;

    let fs_key = match config.fs_key {
        FsKeyKind::Fsname => mount.fs_name.clone(),
        FsKeyKind::Fsid => format!("fsid:{:x}", mount.dev_id),
        FsKeyKind::Devid => format!("dev:{:x}", mount.dev_id),
    };
    let fs_path = config.fs_path.to_string_lossy().into_owned();

    match catalog.get_var(FS_PATH_VAR)? {
        Some(stored) if stored != fs_path => {
            anyhow::bail!("FS_path mismatch: catalog has '{}', configured root is '{}'", stored, fs_path);
        }
        Some(_) => {}
        None => catalog.set_var(FS_PATH_VAR, &fs_path)?,
    }
    match catalog.get_var(FS_KEY_VAR)? {
        Some(stored) if stored != fs_key => {
            anyhow::bail!("FS_key mismatch: catalog has '{}', this mount resolves to '{}'", stored, fs_key);
        }
        Some(_) => {}
        None => catalog.set_var(FS_KEY_VAR, &fs_key)?,
    }

    fsaccess::init_fs_identity(FsIdentity {
        fs_name: fs_key,
        mount_point: mount.mount_point.clone(),
        dev_id: mount.dev_id,
        fsid: mount.dev_id,
    });
    Ok(())
}

fn open_catalog(config: &Config) -> Result<Arc<Catalog>> {
    Ok(Arc::new(Catalog::open(&config.catalog_path)?))
}

fn open_backend(config: &Config) -> Arc<Backend> {
    Arc::new(Backend::new(config.root.clone(), config.fs_path.clone(), config.copy_timeout, config.action_cmd.clone()))
}

fn start_pipeline(config: &Config, catalog: Arc<Catalog>, backend: Arc<Backend>) -> Pipeline {
    let ctx = PipelineContext { catalog, backend };
    let id_constraint = Arc::new(IdConstraint::new());
    Pipeline::start(ctx, id_constraint, config.pipeline.stage_workers, config.pipeline.queue_high_water_mark)
}

fn cmd_scan(config: &Config, path: Option<PathBuf>) -> Result<()> {
    let catalog = open_catalog(config)?;
    init_identity(config, &catalog)?;
    let backend = open_backend(config);
    let pipeline = start_pipeline(config, Arc::clone(&catalog), backend);

    // A fresh token per scan, recorded so a later `sweep` can tell which
    // entries this run actually touched versus stale leftovers from an
    // earlier generation.
    let generation = uuid::Uuid::new_v4().to_string();
    catalog.set_var("last_scan_generation", &generation)?;
    catalog.set_var("last_scan_started_at", &chrono::Utc::now().to_rfc3339())?;
    info!("scan: generation {}", generation);

    let root = path.unwrap_or_else(|| config.fs_path.clone());
    let mut submitted = 0u64;

    for entry in walkdir::WalkDir::new(&root).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("scan: skipping unreadable entry: {}", e);
                continue;
            }
        };
        let fullpath = entry.path().to_string_lossy().into_owned();
        let attrs = EntryAttributes {
            fullpath: Some(fullpath),
            generation: Some(generation.clone()),
            ..Default::default()
        };
        let mut op = PipelineOp::new(None, attrs);
        op.fetch = FetchFlags { getstripe_needed: true, getattr_needed: true, getpath_needed: false, getstatus_needed: true };
        if pipeline.submit(op).is_err() {
            break;
        }
        submitted += 1;
    }

    drain_completions(&pipeline, submitted, None);
    pipeline.shutdown();
    info!("scan: submitted {} entries", submitted);
    Ok(())
}

fn cmd_apply_changelog(config: &Config, path: &std::path::Path) -> Result<()> {
    let catalog = open_catalog(config)?;
    init_identity(config, &catalog)?;
    let backend = open_backend(config);
    let pipeline = start_pipeline(config, Arc::clone(&catalog), backend);

    let mut source = FileChangelogSource::open(path)?;
    let mut submitted = 0u64;

    while let Some(record) = source.next_record()? {
        let attrs = EntryAttributes { fullpath: record.fullpath.clone(), ..Default::default() };
        let mut op = PipelineOp::new(Some(record.id), attrs)
            .with_changelog_record(record.record_id)
            .with_changelog_event(record.event);
        op.fetch.getstatus_needed = true;
        if pipeline.submit(op).is_err() {
            break;
        }
        submitted += 1;
    }

    drain_completions(&pipeline, submitted, Some(&mut source));
    pipeline.shutdown();
    info!("apply-changelog: applied up to record {}", source.last_acked());
    Ok(())
}

fn drain_completions(pipeline: &Pipeline, expected: u64, mut source: Option<&mut FileChangelogSource>) {
    for _ in 0..expected {
        match pipeline.recv_completion() {
            Some(Some(record_id)) => {
                if let Some(source) = source.as_deref_mut() {
                    if let Err(e) = source.ack(record_id) {
                        warn!("failed to ack change-log record {}: {}", record_id, e);
                    }
                }
            }
            Some(None) => {}
            None => break,
        }
    }
}

fn cmd_status(config: &Config, primary_key: &str) -> Result<()> {
    let catalog = open_catalog(config)?;
    let pk = u64::from_str_radix(primary_key.trim_start_matches("0x"), 16)
        .with_context(|| format!("parsing primary key {}", primary_key))?;

    // Status is looked up by primary key directly: a legacy id's primary key
    // is a hash of (device, inode), so round-tripping through `EntryId`
    // isn't possible here; a real deployment would keep the id itself
    // around rather than reconstructing it from a printed pk.
    let filter = Filter {
        predicates: vec![Predicate {
            table: Table::Main,
            column: "id",
            op: CmpOp::Eq,
            value: rusqlite::types::Value::Integer(pk as i64),
        }],
        dir_filter: None,
    };
    let matches = catalog.iterator(&filter, None, &IterOptions { limit: Some(1) })?;
    if matches.is_empty() {
        println!("no entry with primary key {:#x}", pk);
        return Ok(());
    }

    // Re-fetch via a synthetic native id carrying the same primary key, so
    // `Catalog::get` can be reused unchanged.
    let synthetic = EntryId::Native { fid: pk as u128, generation: 0 };
    if let Some(attrs) = catalog.get(&synthetic, AttrMask::all())? {
        print_attrs(pk, &attrs);
    } else {
        println!("no entry with primary key {:#x}", pk);
    }
    Ok(())
}

fn format_epoch(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

fn print_attrs(pk: u64, attrs: &EntryAttributes) {
    println!("entry {:#x}", pk);
    if let Some(path) = &attrs.fullpath {
        println!("  path:        {}", path);
    }
    if let Some(t) = attrs.entry_type {
        println!("  type:        {:?}", t);
    }
    if let Some(status) = attrs.status {
        println!("  status:      {:?}", status);
    }
    if let Some(size) = attrs.size {
        println!("  size:        {}", size);
    }
    if let Some(last_mod) = attrs.last_mod {
        println!("  last_mod:    {}", format_epoch(last_mod));
    }
    if let Some(backendpath) = &attrs.backendpath {
        println!("  backendpath: {}", backendpath);
    }
}

fn cmd_sweep(config: &Config) -> Result<()> {
    let catalog = open_catalog(config)?;
    let backend = open_backend(config);
    let ctx = PipelineContext { catalog: Arc::clone(&catalog), backend };

    // Roots: entries with no parent.
    let root_filter = Filter {
        predicates: vec![Predicate {
            table: Table::Main,
            column: "parent_id",
            op: CmpOp::Eq,
            value: rusqlite::types::Value::Null,
        }],
        dir_filter: None,
    };
    let roots = catalog.iterator(&root_filter, None, &IterOptions { limit: None })?;

    let scrubber = Scrubber::new(&catalog, config.pipeline.scrubber_batch_size);
    let mut visited = 0u64;
    scrubber.walk(roots, |batch| {
        visited += batch.len() as u64;
        debug!("sweep: visited {} entries so far", visited);
        true
    })?;
    info!("sweep: visited {} catalog entries", visited);

    let generation = match catalog.get_var("last_scan_generation")? {
        Some(generation) => generation,
        None => {
            warn!("sweep: no prior scan recorded, skipping generation-based cleanup");
            return Ok(());
        }
    };

    let stale = catalog.stale_ids(&generation)?;
    info!("sweep: {} entries untouched by scan generation {}", stale.len(), generation);

    let mut removed = 0u64;
    for pk in stale {
        // Same synthetic-id reconstruction `cmd_status`/`cmd_recover` use:
        // RM_OLD_ENTRIES only needs a primary key to delete by.
        let synthetic = EntryId::Native { fid: pk as u128, generation: 0 };
        let mut op = PipelineOp::new(Some(synthetic), EntryAttributes::default());
        match stage::step(&ctx, StageName::RmOldEntries, &mut op) {
            Ok(_) => removed += 1,
            Err(e) => warn!("sweep: failed to remove stale entry {:#x}: {}", pk, e),
        }
    }
    info!("sweep: removed {} stale entries", removed);
    Ok(())
}

fn cmd_archive(config: &Config, path: &std::path::Path) -> Result<()> {
    let catalog = open_catalog(config)?;
    init_identity(config, &catalog)?;
    let backend = open_backend(config);

    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let st = FsAccess::lstat(&canonical)?;
    let id = EntryId::Legacy { device: st.dev, inode: st.ino, validator: st.creation_time };
    let attrs = EntryAttributes {
        fullpath: Some(canonical.to_string_lossy().into_owned()),
        entry_type: Some(st.entry_type),
        size: Some(st.size),
        last_mod: Some(st.last_mod),
        status: Some(EntryStatus::New),
        ..Default::default()
    };

    let (status, backendpath) = backend.archive(&id, &attrs, None)?;
    println!("archived {} -> {} ({:?})", canonical.display(), backendpath, status);
    Ok(())
}

fn cmd_recover(config: &Config, path: &std::path::Path) -> Result<()> {
    let catalog = open_catalog(config)?;
    init_identity(config, &catalog)?;
    let backend = open_backend(config);

    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let st = FsAccess::lstat(&canonical).unwrap_or_else(|_| {
        // Path doesn't exist yet: recovery is the case that creates it.
        StatResult {
            entry_type: EntryType::File,
            size: 0,
            blocks: 0,
            blksize: 4096,
            owner: 0,
            group: 0,
            nlink: 0,
            last_access: 0,
            last_mod: 0,
            creation_time: 0,
            dev: 0,
            ino: 0,
        }
    });
    let new_id = EntryId::Legacy { device: st.dev, inode: st.ino, validator: st.creation_time };

    let filter = Filter {
        predicates: vec![Predicate {
            table: Table::Main,
            column: "fullpath",
            op: CmpOp::Eq,
            value: rusqlite::types::Value::Text(canonical.to_string_lossy().into_owned()),
        }],
        dir_filter: None,
    };
    let matches = catalog.iterator(&filter, None, &IterOptions { limit: Some(1) })?;
    let pk = *matches.first().context("no catalog entry for that path")?;
    let old_id = EntryId::Native { fid: pk as u128, generation: 0 };
    let old_attrs = catalog.get(&old_id, AttrMask::all())?.context("catalog row vanished")?;

    let status = backend.recover(&old_id, &old_attrs, &new_id, &canonical)?;
    println!("recovered {} ({:?})", canonical.display(), status);
    Ok(())
}
