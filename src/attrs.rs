// Entry attributes: a partial record, one field per recognized attribute.
//
// The original implementation tracks present/absent via a bitmask beside a
// fixed struct. Per the redesign notes, each field here is its own
// `Option<T>` -- no mask-plus-struct bit layout. `AttrMask` still exists,
// but only as a *selector* passed to `Catalog::get` / iterator filters, not
// as the storage representation.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::id::EntryId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrMask: u32 {
        const FULLPATH       = 1 << 0;
        const NAME           = 1 << 1;
        const PARENT_ID      = 1 << 2;
        const TYPE           = 1 << 3;
        const OWNER          = 1 << 4;
        const GROUP          = 1 << 5;
        const SIZE           = 1 << 6;
        const BLOCKS         = 1 << 7;
        const BLKSIZE        = 1 << 8;
        const NLINK          = 1 << 9;
        const LAST_ACCESS    = 1 << 10;
        const LAST_MOD       = 1 << 11;
        const CREATION_TIME  = 1 << 12;
        const DEPTH          = 1 << 13;
        const DIRCOUNT       = 1 << 14;
        const AVGSIZE        = 1 << 15;
        const STRIPE_INFO    = 1 << 16;
        const STRIPE_ITEMS   = 1 << 17;
        const STATUS         = 1 << 18;
        const BACKENDPATH    = 1 << 19;
        const LAST_ARCHIVE   = 1 << 20;
        const SCAN_GENERATION = 1 << 21;

        /// Attributes fetched from a POSIX stat() call.
        const POSIX = Self::SIZE.bits() | Self::BLOCKS.bits() | Self::BLKSIZE.bits()
            | Self::OWNER.bits() | Self::GROUP.bits() | Self::LAST_ACCESS.bits()
            | Self::LAST_MOD.bits() | Self::NLINK.bits() | Self::TYPE.bits();

        /// Attributes requiring a path lookup (readdir/namespace walk).
        const PATH = Self::FULLPATH.bits() | Self::NAME.bits() | Self::DEPTH.bits();

        const STRIPE = Self::STRIPE_INFO.bits() | Self::STRIPE_ITEMS.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Block,
    Char,
    Fifo,
    Socket,
}

impl EntryType {
    /// Entries of these types are tracked by the backend archiver; spec.md
    /// "Entries of type != {file, symlink, dir} are not tracked by the backend."
    pub fn is_backend_tracked(&self) -> bool {
        matches!(self, EntryType::File | EntryType::Symlink | EntryType::Dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Unknown,
    New,
    Modified,
    ArchiveRunning,
    Synchro,
    ReleasePending,
    RestoreRunning,
    Released,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeInfo {
    pub validator: i64,
    pub stripe_count: u32,
    pub stripe_size: u64,
    pub pool_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeItem {
    pub stripe_index: u32,
    pub ostidx: u32,
    pub details: Vec<u8>,
}

/// A partial snapshot of an entry's attributes. Every field is
/// present-or-absent on its own; there is no shared bitmask.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryAttributes {
    pub fullpath: Option<String>,
    pub name: Option<String>,
    pub parent_id: Option<EntryIdKey>,
    pub entry_type: Option<EntryType>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub size: Option<u64>,
    pub blocks: Option<u64>,
    pub blksize: Option<u32>,
    pub nlink: Option<u32>,
    pub last_access: Option<i64>,
    pub last_mod: Option<i64>,
    pub creation_time: Option<i64>,
    pub depth: Option<u32>,
    pub dircount: Option<u64>,
    pub avgsize: Option<f64>,
    pub stripe_info: Option<StripeInfo>,
    pub stripe_items: Option<Vec<StripeItem>>,
    pub status: Option<EntryStatus>,
    pub backendpath: Option<String>,
    pub last_archive: Option<i64>,
    /// The scan generation token (`cmd_scan`'s per-run UUID) that last wrote
    /// this row, used by the sweep to find entries the current generation
    /// never touched (spec.md §4.5).
    pub generation: Option<String>,
}

/// Wraps a primary key for storage in `EntryAttributes::parent_id`. We keep
/// only the 64-bit catalog primary key here, not a full `EntryId`, since
/// that's what `parent_id` references in `MAIN`.
pub type EntryIdKey = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    CreationAfterModification,
    CreationAfterAccess,
    StripeIndexOutOfRange { index: u32, stripe_count: u32 },
}

impl EntryAttributes {
    /// Checks the ordering invariants of spec.md §3. Stripe-count mismatches
    /// are reported but intentionally never block a write (spec.md:
    /// "violations are logged but tolerated"); timestamp ordering is
    /// reported for the same reason -- the caller decides whether to refuse
    /// the write.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        if let (Some(creation), Some(last_mod)) = (self.creation_time, self.last_mod) {
            if creation > last_mod {
                violations.push(InvariantViolation::CreationAfterModification);
            }
        }
        if let (Some(creation), Some(last_access)) = (self.creation_time, self.last_access) {
            if creation > last_access {
                violations.push(InvariantViolation::CreationAfterAccess);
            }
        }
        if let Some(items) = &self.stripe_items {
            if let Some(info) = &self.stripe_info {
                for item in items {
                    if item.stripe_index >= info.stripe_count {
                        violations.push(InvariantViolation::StripeIndexOutOfRange {
                            index: item.stripe_index,
                            stripe_count: info.stripe_count,
                        });
                    }
                }
            }
        }
        violations
    }

    /// Attributes present in this record, as a mask -- used to decide which
    /// fetches a pipeline op still needs (`AttrMask::POSIX` etc.), not to
    /// store the record itself.
    pub fn present_mask(&self) -> AttrMask {
        let mut mask = AttrMask::empty();
        macro_rules! set_if_some {
            ($field:expr, $flag:expr) => {
                if $field.is_some() {
                    mask |= $flag;
                }
            };
        }
        set_if_some!(self.fullpath, AttrMask::FULLPATH);
        set_if_some!(self.name, AttrMask::NAME);
        set_if_some!(self.parent_id, AttrMask::PARENT_ID);
        set_if_some!(self.entry_type, AttrMask::TYPE);
        set_if_some!(self.owner, AttrMask::OWNER);
        set_if_some!(self.group, AttrMask::GROUP);
        set_if_some!(self.size, AttrMask::SIZE);
        set_if_some!(self.blocks, AttrMask::BLOCKS);
        set_if_some!(self.blksize, AttrMask::BLKSIZE);
        set_if_some!(self.nlink, AttrMask::NLINK);
        set_if_some!(self.last_access, AttrMask::LAST_ACCESS);
        set_if_some!(self.last_mod, AttrMask::LAST_MOD);
        set_if_some!(self.creation_time, AttrMask::CREATION_TIME);
        set_if_some!(self.depth, AttrMask::DEPTH);
        set_if_some!(self.dircount, AttrMask::DIRCOUNT);
        set_if_some!(self.avgsize, AttrMask::AVGSIZE);
        set_if_some!(self.stripe_info, AttrMask::STRIPE_INFO);
        set_if_some!(self.stripe_items, AttrMask::STRIPE_ITEMS);
        set_if_some!(self.status, AttrMask::STATUS);
        set_if_some!(self.backendpath, AttrMask::BACKENDPATH);
        set_if_some!(self.last_archive, AttrMask::LAST_ARCHIVE);
        set_if_some!(self.generation, AttrMask::SCAN_GENERATION);
        mask
    }

    /// `depth` is derived from `fullpath` rather than persisted -- computed
    /// client-side after fetch, per spec.md §4.1 "Schema points".
    pub fn derive_depth(&mut self, fs_root: &str) {
        if self.depth.is_some() {
            return;
        }
        if let Some(path) = &self.fullpath {
            let rel = path.strip_prefix(fs_root).unwrap_or(path);
            self.depth = Some(rel.trim_matches('/').split('/').filter(|s| !s.is_empty()).count() as u32);
        }
    }
}

#[allow(dead_code)]
pub fn parent_key(id: &EntryId) -> EntryIdKey {
    id.primary_key()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_has_empty_mask() {
        let attrs = EntryAttributes::default();
        assert!(attrs.present_mask().is_empty());
    }

    #[test]
    fn mask_reflects_present_fields() {
        let attrs = EntryAttributes {
            size: Some(1024),
            last_mod: Some(100),
            ..Default::default()
        };
        let mask = attrs.present_mask();
        assert!(mask.contains(AttrMask::SIZE));
        assert!(mask.contains(AttrMask::LAST_MOD));
        assert!(!mask.contains(AttrMask::OWNER));
    }

    #[test]
    fn creation_after_mod_is_flagged() {
        let attrs = EntryAttributes {
            creation_time: Some(200),
            last_mod: Some(100),
            ..Default::default()
        };
        let violations = attrs.check_invariants();
        assert!(violations.contains(&InvariantViolation::CreationAfterModification));
    }

    #[test]
    fn stripe_index_out_of_range_is_flagged_but_not_blocking() {
        let attrs = EntryAttributes {
            stripe_info: Some(StripeInfo {
                validator: 1,
                stripe_count: 2,
                stripe_size: 1 << 20,
                pool_name: "pool0".into(),
            }),
            stripe_items: Some(vec![StripeItem { stripe_index: 5, ostidx: 0, details: vec![] }]),
            ..Default::default()
        };
        let violations = attrs.check_invariants();
        assert_eq!(
            violations,
            vec![InvariantViolation::StripeIndexOutOfRange { index: 5, stripe_count: 2 }]
        );
    }

    #[test]
    fn derive_depth_strips_one_separator() {
        let mut attrs = EntryAttributes {
            fullpath: Some("/mnt/fs/a/b/c.dat".to_string()),
            ..Default::default()
        };
        attrs.derive_depth("/mnt/fs");
        assert_eq!(attrs.depth, Some(3));
    }
}
