// FsAccess: a thin wrapper over the host filesystem.
//
// Grounded in spec.md §4.6. Exposes only what the catalog, backend, and
// pipeline need: stat/lstat, readlink, symlink, rename, unlink, chown/utime,
// recursive mkdir, mount-table lookup, and fs identity (name/id/devid).

pub mod mount;

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use filetime::FileTime;

use crate::attrs::EntryType;
use crate::error::{PolicyError, Result};

pub use mount::MountEntry;

/// Process-wide filesystem identity, initialized once at startup and handed
/// to components by reference -- never an ambient mutable global (redesign
/// note: "Global FS identity").
#[derive(Debug, Clone)]
pub struct FsIdentity {
    pub fs_name: String,
    pub mount_point: PathBuf,
    pub dev_id: u64,
    pub fsid: u64,
}

static FS_IDENTITY: OnceLock<FsIdentity> = OnceLock::new();

/// Initialize the process-wide fs identity. Called once at startup; a
/// second call with a different identity is a logic error in the caller,
/// not handled here.
pub fn init_fs_identity(identity: FsIdentity) {
    let _ = FS_IDENTITY.set(identity);
}

pub fn fs_identity() -> Option<&'static FsIdentity> {
    FS_IDENTITY.get()
}

pub struct FsAccess;

#[derive(Debug, Clone, Copy)]
pub struct StatResult {
    pub entry_type: EntryType,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub owner: u32,
    pub group: u32,
    pub nlink: u32,
    pub last_access: i64,
    pub last_mod: i64,
    pub creation_time: i64,
    pub dev: u64,
    pub ino: u64,
}

fn entry_type_from_metadata(meta: &fs::Metadata) -> EntryType {
    let ft = meta.file_type();
    if ft.is_dir() {
        EntryType::Dir
    } else if ft.is_symlink() {
        EntryType::Symlink
    } else if ft.is_file() {
        EntryType::File
    } else {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_block_device() {
            EntryType::Block
        } else if ft.is_char_device() {
            EntryType::Char
        } else if ft.is_fifo() {
            EntryType::Fifo
        } else if ft.is_socket() {
            EntryType::Socket
        } else {
            EntryType::File
        }
    }
}

impl FsAccess {
    /// lstat: does not follow a terminal symlink.
    pub fn lstat(path: &Path) -> Result<StatResult> {
        let meta = fs::symlink_metadata(path)?;
        Ok(StatResult {
            entry_type: entry_type_from_metadata(&meta),
            size: meta.len(),
            blocks: meta.blocks(),
            blksize: meta.blksize() as u32,
            owner: meta.uid(),
            group: meta.gid(),
            nlink: meta.nlink() as u32,
            last_access: meta.atime(),
            last_mod: meta.mtime(),
            creation_time: meta.ctime(),
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// stat: follows symlinks.
    pub fn stat(path: &Path) -> Result<StatResult> {
        let meta = fs::metadata(path)?;
        Ok(StatResult {
            entry_type: entry_type_from_metadata(&meta),
            size: meta.len(),
            blocks: meta.blocks(),
            blksize: meta.blksize() as u32,
            owner: meta.uid(),
            group: meta.gid(),
            nlink: meta.nlink() as u32,
            last_access: meta.atime(),
            last_mod: meta.mtime(),
            creation_time: meta.ctime(),
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    pub fn readlink(path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(path)?)
    }

    pub fn symlink(target: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link)?;
        Ok(())
    }

    pub fn rename(from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    pub fn unlink(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PolicyError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
        // std has no safe chown; go through libc directly, matching the
        // teacher's reach for `libc` wherever std doesn't cover POSIX ground.
        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|e| PolicyError::InvalidInput(e.to_string()))?;
        let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn set_times(path: &Path, atime_secs: i64, mtime_secs: i64) -> Result<()> {
        let atime = FileTime::from_unix_time(atime_secs, 0);
        let mtime = FileTime::from_unix_time(mtime_secs, 0);
        filetime::set_file_times(path, atime, mtime)?;
        Ok(())
    }

    /// Restores the low 12 permission bits. Used by recover to put the
    /// filesystem copy's mode back the way it was before it was released.
    pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    /// Idempotent recursive mkdir. For each intermediate component, copies
    /// mode/uid/gid from the identically-relative directory on `mirror_of`
    /// when present, so the backend mirrors the FS hierarchy's ownership
    /// (spec.md §4.6).
    pub fn recursive_mkdir(path: &Path, default_mode: u32, mirror_of: Option<&Path>) -> Result<()> {
        let mut built = PathBuf::new();
        for component in path.components() {
            built.push(component);
            if built.exists() {
                continue;
            }
            fs::create_dir(&built).or_else(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;

            if let Some(mirror_root) = mirror_of {
                if let Ok(rel) = built.strip_prefix(path.ancestors().last().unwrap_or(path)) {
                    let mirror_path = mirror_root.join(rel);
                    if let Ok(meta) = fs::metadata(&mirror_path) {
                        let mode = meta.mode() & 0o7777;
                        let _ = fs::set_permissions(&built, fs::Permissions::from_mode(mode));
                        let _ = Self::chown(&built, meta.uid(), meta.gid());
                        continue;
                    }
                }
            }
            let _ = fs::set_permissions(&built, fs::Permissions::from_mode(default_mode));
        }
        Ok(())
    }

    /// Errors if `full` is not under `root`. A root ending in `/` strips
    /// exactly one separator (spec.md §8 boundary case).
    pub fn relative_path(full: &Path, root: &Path) -> Result<PathBuf> {
        let root_str = root.to_string_lossy();
        let root_trimmed = root_str.trim_end_matches('/');
        let full_str = full.to_string_lossy();
        if full_str == root_trimmed {
            return Ok(PathBuf::new());
        }
        let prefix_with_slash = format!("{}/", root_trimmed);
        match full_str.strip_prefix(&prefix_with_slash) {
            Some(rel) => Ok(PathBuf::from(rel)),
            None => Err(PolicyError::InvalidInput(format!(
                "{} is not under {}",
                full.display(),
                root.display()
            ))),
        }
    }

    /// Resolves the mount entry with the longest prefix match of the
    /// canonicalized path; rejects non-mounted roots when `check_mounted`.
    pub fn check_fs_info(
        path: &Path,
        expected_type: &str,
        check_mounted: bool,
    ) -> Result<MountEntry> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let entries = mount::read_mount_table()?;
        let best = mount::longest_prefix_match(&entries, &canonical);

        match best {
            Some(entry) => {
                if entry.fs_type != expected_type && check_mounted {
                    return Err(PolicyError::InvalidInput(format!(
                        "{} is mounted as '{}', expected '{}'",
                        path.display(),
                        entry.fs_type,
                        expected_type
                    )));
                }
                Ok(entry)
            }
            None if check_mounted => Err(PolicyError::InvalidInput(format!(
                "{} is not under any mounted filesystem",
                path.display()
            ))),
            None => Ok(MountEntry {
                mount_point: canonical,
                fs_type: expected_type.to_string(),
                dev_id: 0,
                fs_name: "unknown".to_string(),
            }),
        }
    }
}
