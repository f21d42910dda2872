// Row <-> struct mapping and low-level CRUD against `main`, `annex`,
// `stripe_info`, `stripe_items`, `vars`. `Catalog` (mod.rs) composes these
// into the operations of spec.md §4.1.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::attrs::{EntryAttributes, EntryStatus, EntryType, StripeInfo, StripeItem};
use crate::error::Result;

pub fn entry_type_to_str(t: EntryType) -> &'static str {
    match t {
        EntryType::File => "file",
        EntryType::Dir => "dir",
        EntryType::Symlink => "symlink",
        EntryType::Block => "block",
        EntryType::Char => "char",
        EntryType::Fifo => "fifo",
        EntryType::Socket => "socket",
    }
}

pub fn entry_type_from_str(s: &str) -> Option<EntryType> {
    Some(match s {
        "file" => EntryType::File,
        "dir" => EntryType::Dir,
        "symlink" => EntryType::Symlink,
        "block" => EntryType::Block,
        "char" => EntryType::Char,
        "fifo" => EntryType::Fifo,
        "socket" => EntryType::Socket,
        _ => return None,
    })
}

pub fn status_to_str(s: EntryStatus) -> &'static str {
    match s {
        EntryStatus::Unknown => "unknown",
        EntryStatus::New => "new",
        EntryStatus::Modified => "modified",
        EntryStatus::ArchiveRunning => "archive_running",
        EntryStatus::Synchro => "synchro",
        EntryStatus::ReleasePending => "release_pending",
        EntryStatus::RestoreRunning => "restore_running",
        EntryStatus::Released => "released",
        EntryStatus::Removed => "removed",
    }
}

pub fn status_from_str(s: &str) -> EntryStatus {
    match s {
        "new" => EntryStatus::New,
        "modified" => EntryStatus::Modified,
        "archive_running" => EntryStatus::ArchiveRunning,
        "synchro" => EntryStatus::Synchro,
        "release_pending" => EntryStatus::ReleasePending,
        "restore_running" => EntryStatus::RestoreRunning,
        "released" => EntryStatus::Released,
        "removed" => EntryStatus::Removed,
        _ => EntryStatus::Unknown,
    }
}

/// Columns fetched from `main` for a given primary key, in this fixed order.
pub const MAIN_COLUMNS: &str = "id, owner, group_id, size, blocks, blksize, nlink, \
    last_access, last_mod, creation_time, type, parent_id, name, fullpath, \
    backendpath, status, last_archive, scan_generation";

pub fn row_to_attrs(row: &Row) -> rusqlite::Result<EntryAttributes> {
    let type_str: Option<String> = row.get(10)?;
    let status_str: String = row.get(15)?;
    Ok(EntryAttributes {
        owner: row.get(1)?,
        group: row.get(2)?,
        size: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        blocks: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        blksize: row.get(5)?,
        nlink: row.get(6)?,
        last_access: row.get(7)?,
        last_mod: row.get(8)?,
        creation_time: row.get(9)?,
        entry_type: type_str.as_deref().and_then(entry_type_from_str),
        parent_id: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        name: row.get(12)?,
        fullpath: row.get(13)?,
        backendpath: row.get(14)?,
        status: Some(status_from_str(&status_str)),
        last_archive: row.get(16)?,
        generation: row.get(17)?,
        depth: None,
        dircount: None,
        avgsize: None,
        stripe_info: None,
        stripe_items: None,
    })
}

pub fn exists(conn: &Connection, pk: u64) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM main WHERE id = ?1",
        params![pk as i64],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn get_main(conn: &Connection, pk: u64) -> Result<Option<EntryAttributes>> {
    let sql = format!("SELECT {} FROM main WHERE id = ?1", MAIN_COLUMNS);
    let attrs = conn
        .query_row(&sql, params![pk as i64], |row| row_to_attrs(row))
        .optional()?;
    Ok(attrs)
}

pub fn get_stripe_info(conn: &Connection, pk: u64) -> Result<Option<StripeInfo>> {
    let info = conn
        .query_row(
            "SELECT validator, stripe_count, stripe_size, pool_name FROM stripe_info WHERE id = ?1",
            params![pk as i64],
            |row| {
                Ok(StripeInfo {
                    validator: row.get(0)?,
                    stripe_count: row.get::<_, i64>(1)? as u32,
                    stripe_size: row.get::<_, i64>(2)? as u64,
                    pool_name: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

pub fn get_stripe_items(conn: &Connection, pk: u64) -> Result<Vec<StripeItem>> {
    let mut stmt = conn.prepare(
        "SELECT stripe_index, ostidx, details FROM stripe_items WHERE id = ?1 ORDER BY stripe_index",
    )?;
    let items = stmt
        .query_map(params![pk as i64], |row| {
            Ok(StripeItem {
                stripe_index: row.get::<_, i64>(0)? as u32,
                ostidx: row.get::<_, i64>(1)? as u32,
                details: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Insert a new row into `main`. Fails silently on conflicting id -- callers
/// use `upsert_main` when the row may already exist.
pub fn insert_main(conn: &Connection, pk: u64, attrs: &EntryAttributes) -> Result<()> {
    conn.execute(
        "INSERT INTO main (id, owner, group_id, size, blocks, blksize, nlink, last_access, \
         last_mod, creation_time, type, parent_id, name, fullpath, backendpath, status, last_archive, scan_generation) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            pk as i64,
            attrs.owner,
            attrs.group,
            attrs.size.map(|v| v as i64),
            attrs.blocks.map(|v| v as i64),
            attrs.blksize,
            attrs.nlink,
            attrs.last_access,
            attrs.last_mod,
            attrs.creation_time,
            attrs.entry_type.map(entry_type_to_str),
            attrs.parent_id.map(|v| v as i64),
            attrs.name,
            attrs.fullpath,
            attrs.backendpath,
            attrs.status.map(status_to_str).unwrap_or("unknown"),
            attrs.last_archive,
            attrs.generation,
        ],
    )?;
    Ok(())
}

/// Update-or-insert semantics for `main`, expressed as one idempotent
/// statement rather than a select-then-branch retry loop (redesign note:
/// "Retry loops" -> explicit upsert).
pub fn upsert_main(conn: &Connection, pk: u64, attrs: &EntryAttributes) -> Result<()> {
    conn.execute(
        "INSERT INTO main (id, owner, group_id, size, blocks, blksize, nlink, last_access, \
         last_mod, creation_time, type, parent_id, name, fullpath, backendpath, status, last_archive, scan_generation) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
         ON CONFLICT(id) DO UPDATE SET \
            owner = excluded.owner, group_id = excluded.group_id, size = excluded.size, \
            blocks = excluded.blocks, blksize = excluded.blksize, nlink = excluded.nlink, \
            last_access = excluded.last_access, last_mod = excluded.last_mod, \
            creation_time = excluded.creation_time, type = excluded.type, \
            parent_id = excluded.parent_id, name = excluded.name, fullpath = excluded.fullpath, \
            backendpath = excluded.backendpath, status = excluded.status, \
            last_archive = excluded.last_archive, \
            scan_generation = COALESCE(excluded.scan_generation, main.scan_generation)",
        params![
            pk as i64,
            attrs.owner,
            attrs.group,
            attrs.size.map(|v| v as i64),
            attrs.blocks.map(|v| v as i64),
            attrs.blksize,
            attrs.nlink,
            attrs.last_access,
            attrs.last_mod,
            attrs.creation_time,
            attrs.entry_type.map(entry_type_to_str),
            attrs.parent_id.map(|v| v as i64),
            attrs.name,
            attrs.fullpath,
            attrs.backendpath,
            attrs.status.map(status_to_str).unwrap_or("unknown"),
            attrs.last_archive,
            attrs.generation,
        ],
    )?;
    Ok(())
}

pub fn update_main_if_exists(conn: &Connection, pk: u64, attrs: &EntryAttributes) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE main SET owner = ?2, group_id = ?3, size = ?4, blocks = ?5, blksize = ?6, \
         nlink = ?7, last_access = ?8, last_mod = ?9, creation_time = ?10, type = ?11, \
         parent_id = ?12, name = ?13, fullpath = ?14, backendpath = ?15, status = ?16, \
         last_archive = ?17, scan_generation = COALESCE(?18, scan_generation) WHERE id = ?1",
        params![
            pk as i64,
            attrs.owner,
            attrs.group,
            attrs.size.map(|v| v as i64),
            attrs.blocks.map(|v| v as i64),
            attrs.blksize,
            attrs.nlink,
            attrs.last_access,
            attrs.last_mod,
            attrs.creation_time,
            attrs.entry_type.map(entry_type_to_str),
            attrs.parent_id.map(|v| v as i64),
            attrs.name,
            attrs.fullpath,
            attrs.backendpath,
            attrs.status.map(status_to_str).unwrap_or("unknown"),
            attrs.last_archive,
            attrs.generation,
        ],
    )?;
    Ok(rows > 0)
}

pub fn delete_main(conn: &Connection, pk: u64) -> Result<()> {
    conn.execute("DELETE FROM main WHERE id = ?1", params![pk as i64])?;
    Ok(())
}

/// Replace stripe rows atomically: delete then insert, inside the caller's
/// transaction (spec.md: "Stripe rows are replaced atomically on any
/// stripe-info update").
pub fn replace_stripe(
    conn: &Connection,
    pk: u64,
    info: &StripeInfo,
    items: &[StripeItem],
) -> Result<()> {
    conn.execute("DELETE FROM stripe_items WHERE id = ?1", params![pk as i64])?;
    conn.execute(
        "INSERT INTO stripe_info (id, validator, stripe_count, stripe_size, pool_name) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(id) DO UPDATE SET validator = excluded.validator, \
            stripe_count = excluded.stripe_count, stripe_size = excluded.stripe_size, \
            pool_name = excluded.pool_name",
        params![pk as i64, info.validator, info.stripe_count, info.stripe_size as i64, info.pool_name],
    )?;
    for item in items {
        conn.execute(
            "INSERT INTO stripe_items (id, stripe_index, ostidx, details) VALUES (?1, ?2, ?3, ?4)",
            params![pk as i64, item.stripe_index, item.ostidx, item.details],
        )?;
    }
    Ok(())
}

pub fn get_var(conn: &Connection, name: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM vars WHERE name = ?1", params![name], |row| row.get(0))
        .optional()?;
    Ok(value)
}

pub fn set_var(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO vars (name, value) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}
