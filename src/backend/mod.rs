// Backend: the archive/release/recover state machine (spec.md §4.3),
// grounded in original_source/src/backend_ext/backend_basic.c
// (`entry2backend_path`, `rbhext_get_status`, `rbhext_archive`,
// `rbhext_remove`, `rbhext_recover`, `rbhext_rebind`).

pub mod purge;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use regex::Regex;

use crate::action::{run_action, ActionOutcome, ActionVerb};
use crate::attrs::{EntryAttributes, EntryStatus, EntryType};
use crate::constants::{ORPHAN_DIR, UNKNOWN_NAME, UNKNOWN_PATH_DIR, XFER_SUFFIX};
use crate::error::{PolicyError, Result};
use crate::fsaccess::FsAccess;
use crate::id::EntryId;
use purge::PurgeCapable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathPurpose {
    /// Looking up an entry that may already be archived: prefer the
    /// catalog's recorded `backendpath` when present.
    Lookup,
    /// Computing the destination for a fresh copy: always derive from the
    /// current namespace path, appending a disambiguating suffix.
    NewCopy,
}

pub struct Backend {
    pub root: PathBuf,
    pub fs_root: PathBuf,
    pub copy_timeout_secs: i64,
    pub action_cmd: String,
    purge: Option<Box<dyn PurgeCapable>>,
}

static UNSAFE_RUN: OnceLock<Regex> = OnceLock::new();

/// Collapses any run of shell-unsafe characters to a single underscore,
/// so `a;;rm -rf` and `a;rm -rf` don't collide under the backend root.
fn sanitize(component: &str) -> String {
    let re = UNSAFE_RUN.get_or_init(|| Regex::new(r#"[\x00-\x1f'"`$;|&<>]+"#).unwrap());
    re.replace_all(component, "_").into_owned()
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

impl Backend {
    pub fn new(root: PathBuf, fs_root: PathBuf, copy_timeout_secs: i64, action_cmd: String) -> Self {
        Backend { root, fs_root, copy_timeout_secs, action_cmd, purge: None }
    }

    /// Plugs in a purge-capable sub-backend hook; `get_status` and `recover`
    /// consult it before falling back to the plain marker/copy logic.
    pub fn with_purge(mut self, purge: Box<dyn PurgeCapable>) -> Self {
        self.purge = Some(purge);
        self
    }

    /// `entry2backend_path`: maps an entry's fs path to its location under
    /// the backend root, falling back to `__unknown_path/__unknown_name`
    /// when the fullpath is absent or unrelated to `fs_root`.
    fn backend_path(&self, id: &EntryId, attrs: &EntryAttributes, purpose: PathPurpose) -> Result<PathBuf> {
        if purpose == PathPurpose::Lookup {
            if let Some(known) = &attrs.backendpath {
                return Ok(PathBuf::from(known));
            }
        }

        let rel = attrs
            .fullpath
            .as_deref()
            .map(Path::new)
            .and_then(|full| FsAccess::relative_path(full, &self.fs_root).ok());

        let mut path = match rel {
            Some(rel) => {
                let sanitized: PathBuf = rel.components().map(|c| sanitize(&c.as_os_str().to_string_lossy())).collect();
                self.root.join(sanitized)
            }
            None => {
                let name = attrs.name.as_deref().unwrap_or(UNKNOWN_NAME);
                self.root.join(UNKNOWN_PATH_DIR).join(sanitize(name))
            }
        };

        if purpose == PathPurpose::NewCopy {
            let mut file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            file_name.push_str("__");
            file_name.push_str(&id.short());
            path.set_file_name(file_name);
        }

        Ok(path)
    }

    /// Whether another process currently holds an in-flight `.xfer` marker
    /// for `backend_path`. A marker older than `copy_timeout_secs` is
    /// considered abandoned, not running.
    fn check_running_copy(&self, backend_path: &Path) -> Result<bool> {
        let xfer_path = xfer_marker_path(backend_path);
        match fs::metadata(&xfer_path) {
            Ok(meta) => {
                let age = now_secs() - meta.modified().ok().and_then(|t| t.duration_since(UNIX_EPOCH).ok()).map(|d| d.as_secs() as i64).unwrap_or(0);
                if age < self.copy_timeout_secs {
                    return Ok(true);
                }
                warn!("transfer marker {} is {}s old, treating as abandoned", xfer_path.display(), age);
                match FsAccess::unlink(&xfer_path) {
                    Ok(()) | Err(PolicyError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                Ok(false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Quarantines a backend entry whose on-disk type no longer matches
    /// what the catalog expects, instead of silently overwriting it.
    fn move_to_orphan(&self, backend_path: &Path) -> Result<()> {
        let orphan_dir = self.root.join(ORPHAN_DIR);
        FsAccess::recursive_mkdir(&orphan_dir, 0o750, None)?;
        let name = backend_path.file_name().map(|n| n.to_owned()).unwrap_or_default();
        let dest = orphan_dir.join(name);
        warn!("moving unexpected backend entry {} to {}", backend_path.display(), dest.display());
        FsAccess::rename(backend_path, &dest)
    }

    /// `rbhext_get_status`: compares the catalog's view of an entry against
    /// what is actually in the backend, returning the status that view
    /// implies. Requires `attrs.last_mod` and `attrs.entry_type`.
    pub fn get_status(&self, id: &EntryId, attrs: &EntryAttributes) -> Result<(EntryStatus, Option<String>)> {
        let entry_type = attrs.entry_type.ok_or_else(|| PolicyError::InvalidInput("missing entry_type".into()))?;
        if attrs.last_mod.is_none() {
            return Err(PolicyError::InvalidInput("missing last_mod".into()));
        }
        if !entry_type.is_backend_tracked() || entry_type == EntryType::Dir {
            return Err(PolicyError::Unsupported(format!("entry type {:?} is not backend-tracked", entry_type)));
        }

        let bkpath = self.backend_path(id, attrs, PathPurpose::Lookup)?;

        if let (Some(purge), Some(fullpath)) = (&self.purge, &attrs.fullpath) {
            if let Some(status) = purge.status(id, Path::new(fullpath))? {
                if status != EntryStatus::Synchro {
                    debug!("purge-capable sub-backend reports {:?} for {}", status, id.short());
                    return Ok((status, attrs.backendpath.clone()));
                }
            }
        }

        if entry_type == EntryType::File && self.check_running_copy(&bkpath)? {
            return Ok((EntryStatus::ArchiveRunning, None));
        }

        let bk_meta = match fs::symlink_metadata(&bkpath) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((EntryStatus::New, None));
            }
            Err(e) => return Err(e.into()),
        };

        match entry_type {
            EntryType::File => {
                if !bk_meta.is_file() {
                    self.move_to_orphan(&bkpath)?;
                    return Ok((EntryStatus::New, None));
                }
                use std::os::unix::fs::MetadataExt;
                let mtime_matches = attrs.last_mod == Some(bk_meta.mtime());
                let size_matches = attrs.size == Some(bk_meta.len());
                let path_str = bkpath.to_string_lossy().into_owned();
                if mtime_matches && size_matches {
                    Ok((EntryStatus::Synchro, Some(path_str)))
                } else {
                    if let Some(last_mod) = attrs.last_mod {
                        if last_mod < bk_meta.mtime() {
                            warn!("mtime in filesystem < mtime in backend for {}", bkpath.display());
                        }
                    }
                    Ok((EntryStatus::Modified, Some(path_str)))
                }
            }
            EntryType::Symlink => {
                if !bk_meta.file_type().is_symlink() {
                    self.move_to_orphan(&bkpath)?;
                    return Ok((EntryStatus::New, None));
                }
                Ok((EntryStatus::Synchro, Some(bkpath.to_string_lossy().into_owned())))
            }
            _ => unreachable!("checked above"),
        }
    }

    /// `rbhext_archive`: three-phase write -- stage into a `.xfer` tmp file
    /// via the external action command, then rename into place. `attrs`
    /// must carry `status` (New, Modified, or ArchiveRunning -- the latter
    /// for a resumed/timed-out copy) and `fullpath`.
    pub fn archive(&self, id: &EntryId, attrs: &EntryAttributes, hint: Option<&str>) -> Result<(EntryStatus, String)> {
        let entry_type = attrs.entry_type.ok_or_else(|| PolicyError::InvalidInput("missing entry_type".into()))?;
        if !matches!(entry_type, EntryType::File | EntryType::Symlink) {
            return Err(PolicyError::Unsupported(format!("cannot archive entry type {:?}", entry_type)));
        }
        let status = attrs.status.ok_or_else(|| PolicyError::InvalidInput("missing status".into()))?;

        let bkpath = self.backend_path(id, attrs, PathPurpose::NewCopy)?;

        match status {
            EntryStatus::New => {
                if bkpath.exists() {
                    return Err(PolicyError::AlreadyExists(bkpath.display().to_string()));
                }
            }
            EntryStatus::Modified | EntryStatus::ArchiveRunning => {
                if self.check_running_copy(&bkpath)? {
                    return Err(PolicyError::AlreadyInProgress(id.short()));
                }
            }
            other => return Err(PolicyError::InvalidInput(format!("unexpected status {:?} for archive", other))),
        }

        let dest_dir = bkpath.parent().unwrap_or(&self.root).to_path_buf();
        FsAccess::recursive_mkdir(&dest_dir, 0o750, Some(&self.fs_root))?;

        let fs_path = attrs
            .fullpath
            .as_ref()
            .ok_or_else(|| PolicyError::InvalidInput("fullpath is mandatory for archive".into()))?;

        if entry_type == EntryType::Symlink {
            let target = FsAccess::readlink(Path::new(fs_path))?;
            FsAccess::symlink(&target, &bkpath)?;
            return Ok((EntryStatus::Synchro, bkpath.to_string_lossy().into_owned()));
        }

        let tmp_path = xfer_marker_path(&bkpath);
        let outcome = run_action(&self.action_cmd, ActionVerb::Archive, Path::new(fs_path), &tmp_path, hint);

        match outcome {
            Ok(ActionOutcome::Success) => {
                // stamp the staged copy with the source's own mtime/atime --
                // the action command only moves bytes, so get_status's later
                // mtime comparison needs it set ourselves before the rename
                // makes the copy visible.
                if let (Some(last_access), Some(last_mod)) = (attrs.last_access, attrs.last_mod) {
                    FsAccess::set_times(&tmp_path, last_access, last_mod)?;
                }
                FsAccess::rename(&tmp_path, &bkpath)?;
                info!("archived {} to {}", fs_path, bkpath.display());

                if let Some(previous) = &attrs.backendpath {
                    let previous_path = PathBuf::from(previous);
                    if previous_path != bkpath {
                        match FsAccess::unlink(&previous_path) {
                            Ok(()) | Err(PolicyError::NotFound(_)) => {}
                            Err(e) => warn!(
                                "failed to remove stale backend copy {}: {}",
                                previous_path.display(),
                                e
                            ),
                        }
                    }
                }

                // the source may have been written to again while the copy
                // was in flight; re-check it against what we archived.
                let final_status = match FsAccess::lstat(Path::new(fs_path)) {
                    Ok(post) if attrs.last_mod == Some(post.last_mod) && attrs.size == Some(post.size) => {
                        EntryStatus::Synchro
                    }
                    Ok(_) => {
                        warn!("{} changed while being archived, marking Modified", fs_path);
                        EntryStatus::Modified
                    }
                    Err(_) => EntryStatus::Synchro,
                };

                Ok((final_status, bkpath.to_string_lossy().into_owned()))
            }
            Ok(other) => {
                let _ = fs::remove_file(&tmp_path);
                warn!("archive action for {} did not succeed: {:?}", id.short(), other);
                Err(PolicyError::Other(format!("archive action failed: {:?}", other)))
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    /// `rbhext_remove`: deletes the backend copy. A missing backend file is
    /// logged and treated as success -- there is nothing left to remove.
    pub fn remove(&self, id: &EntryId, attrs: &EntryAttributes) -> Result<()> {
        let bkpath = self.backend_path(id, attrs, PathPurpose::Lookup)?;
        match FsAccess::unlink(&bkpath) {
            Ok(()) => Ok(()),
            Err(PolicyError::NotFound(_)) => {
                debug!("backend copy {} already absent", bkpath.display());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `rbhext_recover`: restores file data (or a symlink target) from the
    /// backend into the filesystem at `fs_path`, then rebinds the backend
    /// copy to `new_id` if it differs from the entry the copy was
    /// originally archived under.
    pub fn recover(&self, old_id: &EntryId, old_attrs: &EntryAttributes, new_id: &EntryId, fs_path: &Path) -> Result<EntryStatus> {
        let bkpath = self.backend_path(old_id, old_attrs, PathPurpose::Lookup)?;
        let bk_meta = fs::symlink_metadata(&bkpath).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PolicyError::NoBackup(old_id.short())
            } else {
                e.into()
            }
        })?;

        if let Some(parent) = fs_path.parent() {
            // the namespace may have been recreated from scratch before
            // recover runs; mirror mode/ownership from the backend tree,
            // which already shadows the fs hierarchy (see `archive`).
            FsAccess::recursive_mkdir(parent, 0o755, Some(&self.root))?;
        }

        let metadata_only = match &self.purge {
            Some(purge) => purge.is_released(old_id, &bkpath)?,
            None => false,
        };

        use std::os::unix::fs::MetadataExt;

        if metadata_only {
            debug!(
                "purge-capable sub-backend already holds {} released, restoring metadata only",
                old_id.short()
            );
        } else if bk_meta.file_type().is_symlink() {
            let target = FsAccess::readlink(&bkpath)?;
            FsAccess::symlink(&target, fs_path)?;
        } else {
            let outcome = run_action(&self.action_cmd, ActionVerb::Restore, &bkpath, fs_path, None)?;
            if outcome != ActionOutcome::Success {
                return Err(PolicyError::Other(format!("restore action failed: {:?}", outcome)));
            }
        }

        if !bk_meta.file_type().is_symlink() {
            FsAccess::set_times(fs_path, bk_meta.atime(), bk_meta.mtime())?;
            FsAccess::chown(fs_path, bk_meta.uid(), bk_meta.gid())?;
            FsAccess::set_mode(fs_path, bk_meta.mode())?;
        }

        if !metadata_only {
            if let Ok(restored) = fs::symlink_metadata(fs_path) {
                if !restored.file_type().is_symlink() && restored.len() != bk_meta.len() {
                    return Err(PolicyError::Delta(
                        old_id.short(),
                        format!("restored size {} does not match backend size {}", restored.len(), bk_meta.len()),
                    ));
                }
            }
        }

        if old_id != new_id {
            self.rebind(old_attrs, new_id, fs_path)?;
        }

        Ok(EntryStatus::Synchro)
    }

    /// `rbhext_rebind`: an entry recovered under a new id keeps its backend
    /// copy but the copy's path must track the new id's suffix, so a
    /// second `archive()` for this entry can find it again.
    pub fn rebind(&self, old_attrs: &EntryAttributes, new_id: &EntryId, fs_path: &Path) -> Result<PathBuf> {
        // Lookup paths never depend on the id argument (they prefer
        // attrs.backendpath, or derive from attrs.fullpath) -- new_id is
        // passed only because the signature requires one.
        let old_path = self.backend_path(new_id, old_attrs, PathPurpose::Lookup)?;

        let mut new_attrs = old_attrs.clone();
        new_attrs.fullpath = Some(fs_path.to_string_lossy().into_owned());
        let new_path = self.backend_path(new_id, &new_attrs, PathPurpose::NewCopy)?;

        if old_path != new_path {
            FsAccess::rename(&old_path, &new_path)?;
            info!("rebound backend copy {} -> {}", old_path.display(), new_path.display());
        }
        Ok(new_path)
    }
}

fn xfer_marker_path(backend_path: &Path) -> PathBuf {
    let mut s = backend_path.as_os_str().to_owned();
    s.push(XFER_SUFFIX);
    PathBuf::from(s)
}
