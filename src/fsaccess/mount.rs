// Mount table lookup: parses /proc/mounts and picks the entry whose mount
// point is the longest prefix match of a canonicalized path.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub dev_id: u64,
    pub fs_name: String,
}

pub fn read_mount_table() -> Result<Vec<MountEntry>> {
    let text = fs::read_to_string("/proc/mounts")?;
    Ok(parse_mount_table(&text))
}

fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let fs_name = match fields.next() {
            Some(f) => f,
            None => continue,
        };
        let mount_point = match fields.next() {
            Some(f) => f,
            None => continue,
        };
        let fs_type = match fields.next() {
            Some(f) => f,
            None => continue,
        };

        let dev_id = fs::metadata(mount_point).map(|m| m.dev()).unwrap_or(0);

        entries.push(MountEntry {
            mount_point: PathBuf::from(unescape_octal(mount_point)),
            fs_type: fs_type.to_string(),
            dev_id,
            fs_name: fs_name.to_string(),
        });
    }
    entries
}

/// /proc/mounts escapes spaces and a few other characters as \NNN octal.
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(code) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or(""), 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

pub fn longest_prefix_match(entries: &[MountEntry], path: &Path) -> Option<MountEntry> {
    entries
        .iter()
        .filter(|e| path.starts_with(&e.mount_point))
        .max_by_key(|e| e.mount_point.as_os_str().len())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_longest_matching_mount_point() {
        let entries = vec![
            MountEntry { mount_point: PathBuf::from("/"), fs_type: "ext4".into(), dev_id: 1, fs_name: "root".into() },
            MountEntry { mount_point: PathBuf::from("/mnt/fs"), fs_type: "lustre".into(), dev_id: 2, fs_name: "lfs".into() },
        ];
        let best = longest_prefix_match(&entries, Path::new("/mnt/fs/a/b")).unwrap();
        assert_eq!(best.fs_type, "lustre");
    }

    #[test]
    fn unescapes_spaces() {
        assert_eq!(unescape_octal(r"/mnt/my\040disk"), "/mnt/my disk");
    }

    #[test]
    fn parses_well_formed_lines() {
        let text = "/dev/sda1 / ext4 rw,relatime 0 0\n/dev/sdb1 /mnt/fs lustre rw 0 0\n";
        let entries = parse_mount_table(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].fs_type, "lustre");
    }
}
