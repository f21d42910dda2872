// Optional purge-capable sub-backend hook (spec.md §4.3, supplemented from
// the original's `#ifdef HAVE_PURGE_POLICY` branch in backend_basic.c --
// not every backend supports releasing file data while keeping metadata,
// so it is a trait a `Backend` can be built with rather than baked in).

use std::path::Path;

use crate::attrs::EntryStatus;
use crate::error::Result;
use crate::id::EntryId;

pub trait PurgeCapable: Send + Sync {
    /// Releases the on-filesystem data for `id`, leaving a stub the kernel
    /// or a stub-aware fs can later fault in via `recover`.
    fn release(&self, id: &EntryId, fs_path: &Path) -> Result<()>;

    /// Whether `id`'s data is currently released (a stub on disk).
    fn is_released(&self, id: &EntryId, fs_path: &Path) -> Result<bool>;

    /// Status as seen by the purge-capable sub-backend, if it has an
    /// opinion beyond plain released/not-released -- `get_status` adopts
    /// this over its own marker probe when it returns anything but
    /// `Synchro`. Default implementation derives it from `is_released`.
    fn status(&self, id: &EntryId, fs_path: &Path) -> Result<Option<EntryStatus>> {
        Ok(if self.is_released(id, fs_path)? {
            Some(EntryStatus::Released)
        } else {
            None
        })
    }
}

/// Default hook for backends without release support: `release` always
/// fails with `Unsupported`, `is_released` is always false.
pub struct NoPurge;

impl PurgeCapable for NoPurge {
    fn release(&self, id: &EntryId, _fs_path: &Path) -> Result<()> {
        Err(crate::error::PolicyError::Unsupported(format!(
            "backend has no purge support (entry {})",
            id.short()
        )))
    }

    fn is_released(&self, _id: &EntryId, _fs_path: &Path) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_purge_release_is_unsupported() {
        let id = EntryId::Legacy { device: 1, inode: 1, validator: 0 };
        let result = NoPurge.release(&id, Path::new("/mnt/fs/a"));
        assert!(result.is_err());
    }

    #[test]
    fn no_purge_reports_never_released() {
        let id = EntryId::Legacy { device: 1, inode: 1, validator: 0 };
        assert!(!NoPurge.is_released(&id, Path::new("/mnt/fs/a")).unwrap());
    }

    #[test]
    fn no_purge_has_no_status_opinion() {
        let id = EntryId::Legacy { device: 1, inode: 1, validator: 0 };
        assert_eq!(NoPurge.status(&id, Path::new("/mnt/fs/a")).unwrap(), None);
    }
}
