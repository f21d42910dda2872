// EntryId: a stable identifier for a filesystem entry across renames.
//
// Equality considers the full identity (including the validator/generation
// that disambiguates inode reuse); the primary-key hash used for catalog
// lookups and the id-constraint map intentionally ignores it, so two
// generations of the same inode still bucket together.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryId {
    /// Legacy filesystem: device + inode + a monotonic validator (typically
    /// ctime at creation) that detects id reuse after unlink.
    Legacy {
        device: u64,
        inode: u64,
        validator: i64,
    },
    /// Modern parallel filesystem: an opaque 128-bit identifier plus a
    /// generation field.
    Native { fid: u128, generation: u64 },
}

impl EntryId {
    /// 64-bit primary key used by the catalog: the raw filesystem id for
    /// native filesystems, or a hash of (device, inode) otherwise.
    pub fn primary_key(&self) -> u64 {
        match self {
            EntryId::Legacy { device, inode, .. } => hash_device_inode(*device, *inode),
            EntryId::Native { fid, .. } => (*fid as u64) ^ ((*fid >> 64) as u64),
        }
    }

    pub fn short(&self) -> String {
        match self {
            EntryId::Legacy { device, inode, validator } => {
                format!("{:x}:{:x}:{:x}", device, inode, validator)
            }
            EntryId::Native { fid, generation } => format!("{:032x}:{:x}", fid, generation),
        }
    }
}

fn hash_device_inode(device: u64, inode: u64) -> u64 {
    // FNV-1a, chosen for determinism across runs (no random seed), matching
    // the original's plain arithmetic hash of (device, inode).
    let mut h: u64 = 0xcbf29ce484222325;
    for byte in device.to_le_bytes().iter().chain(inode.to_le_bytes().iter()) {
        h ^= *byte as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Hashing for use as a map key bucket: device+inode (or fid) only, per
/// spec.md's "primary-key hashing uses device+inode only" invariant. Two
/// `EntryId`s with the same bucket but different validators are unequal
/// under `Eq`, but collide in a `HashMap` and must be compared after
/// lookup.
impl Hash for EntryId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            EntryId::Legacy { device, inode, .. } => {
                0u8.hash(state);
                device.hash(state);
                inode.hash(state);
            }
            EntryId::Native { fid, .. } => {
                1u8.hash(state);
                fid.hash(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_considers_validator() {
        let a = EntryId::Legacy { device: 1, inode: 2, validator: 100 };
        let b = EntryId::Legacy { device: 1, inode: 2, validator: 101 };
        assert_ne!(a, b);
        assert_eq!(a.primary_key(), b.primary_key());
    }

    #[test]
    fn hash_ignores_validator_so_buckets_collide() {
        use std::collections::hash_map::DefaultHasher;
        let a = EntryId::Legacy { device: 1, inode: 2, validator: 100 };
        let b = EntryId::Legacy { device: 1, inode: 2, validator: 101 };
        let h = |id: &EntryId| {
            let mut hasher = DefaultHasher::new();
            id.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(h(&a), h(&b));
    }

    #[test]
    fn native_ids_are_stable() {
        let a = EntryId::Native { fid: 0xdead_beef, generation: 1 };
        let b = EntryId::Native { fid: 0xdead_beef, generation: 2 };
        assert_ne!(a, b);
        assert_eq!(a.primary_key(), b.primary_key());
    }
}
