// Catalog: the relational persistence layer (spec.md §4.1).
//
// Wraps a single `rusqlite::Connection` behind a `Mutex`, matching the
// teacher's `db` module's one-connection-per-handle shape. All multi-
// statement operations (stripe replace, batch insert) run inside an
// explicit transaction so a crash mid-write never leaves `stripe_info`
// and `stripe_items` out of sync.

pub mod migrations;
pub mod query;
mod schema;

use std::path::Path;
use std::sync::Mutex;

use log::{debug, info, warn};
use rusqlite::Connection;

use crate::attrs::{AttrMask, EntryAttributes, StripeInfo, StripeItem};
use crate::error::{PolicyError, Result};
use crate::id::EntryId;

pub use query::{BuiltQuery, CmpOp, DirAggregate, DirFilter, Filter, IterOptions, Predicate, Sort, SortKey, Table};

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Opens (creating if absent) the catalog at `path`, applying any
    /// migrations not yet recorded.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::run_migrations(&conn)?;
        info!("catalog opened at {}", path.display());
        Ok(Catalog { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::run_migrations(&conn)?;
        Ok(Catalog { conn: Mutex::new(conn) })
    }

    pub fn exists(&self, id: &EntryId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        schema::exists(&conn, id.primary_key())
    }

    /// Fetches an entry's attributes. `mask` selects which optional fetches
    /// (stripe rows) run beyond the always-cheap `main` row; `dircount`/
    /// `avgsize`/`depth` are never filled here -- callers ask for those via
    /// `get_dir_attrs` or `EntryAttributes::derive_depth`.
    pub fn get(&self, id: &EntryId, mask: AttrMask) -> Result<Option<EntryAttributes>> {
        let conn = self.conn.lock().unwrap();
        let pk = id.primary_key();
        let mut attrs = match schema::get_main(&conn, pk)? {
            Some(a) => a,
            None => return Ok(None),
        };

        if mask.intersects(AttrMask::STRIPE) {
            attrs.stripe_info = schema::get_stripe_info(&conn, pk)?;
            attrs.stripe_items = Some(schema::get_stripe_items(&conn, pk)?);
        }

        Ok(Some(attrs))
    }

    /// Inserts a brand-new entry. Returns `AlreadyExists` if the primary key
    /// is already present -- callers that want update-or-insert use `upsert`.
    pub fn insert(&self, id: &EntryId, attrs: &EntryAttributes) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let pk = id.primary_key();
        if schema::exists(&conn, pk)? {
            return Err(PolicyError::AlreadyExists(id.short()));
        }
        schema::insert_main(&conn, pk, attrs)?;
        debug!("inserted entry {}", id.short());
        Ok(())
    }

    /// Update-or-insert. The catalog's normal write path: a scan or pipeline
    /// stage rarely knows in advance whether an entry is already tracked.
    pub fn upsert(&self, id: &EntryId, attrs: &EntryAttributes) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        schema::upsert_main(&conn, id.primary_key(), attrs)?;
        Ok(())
    }

    /// Updates an existing row only; reports whether one matched.
    pub fn update_if_exists(&self, id: &EntryId, attrs: &EntryAttributes) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        schema::update_main_if_exists(&conn, id.primary_key(), attrs)
    }

    pub fn delete(&self, id: &EntryId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        schema::delete_main(&conn, id.primary_key())?;
        Ok(())
    }

    /// Replaces an entry's stripe layout atomically alongside its `main` row.
    /// Invariant violations (out-of-range stripe index) are logged, never
    /// blocking -- spec.md §3: "violations are logged but tolerated".
    pub fn upsert_with_stripe(
        &self,
        id: &EntryId,
        attrs: &EntryAttributes,
        info: &StripeInfo,
        items: &[StripeItem],
    ) -> Result<()> {
        for violation in attrs.check_invariants() {
            warn!("entry {} has invariant violation: {:?}", id.short(), violation);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let pk = id.primary_key();
        schema::upsert_main(&tx, pk, attrs)?;
        schema::replace_stripe(&tx, pk, info, items)?;
        tx.commit()?;
        Ok(())
    }

    /// Batch-inserts entries discovered during a scan, each with its stripe
    /// layout, in one transaction (spec.md §4.1 `BatchInsertStripe`).
    pub fn batch_insert_stripe(
        &self,
        entries: &[(EntryId, EntryAttributes, StripeInfo, Vec<StripeItem>)],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (id, attrs, info, items) in entries {
            let pk = id.primary_key();
            schema::upsert_main(&tx, pk, attrs)?;
            schema::replace_stripe(&tx, pk, info, items)?;
        }
        tx.commit()?;
        debug!("batch inserted {} entries with stripe info", entries.len());
        Ok(())
    }

    pub fn get_var(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        schema::get_var(&conn, name)
    }

    pub fn set_var(&self, name: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        schema::set_var(&conn, name, value)
    }

    /// Runs a planned query and returns the matching primary keys, in
    /// whatever order the planner's ORDER BY produced.
    pub fn iterator(&self, filter: &Filter, sort: Option<&Sort>, options: &IterOptions) -> Result<Vec<u64>> {
        let built = query::build_iterator_query(filter, sort, options);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&built.sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(built.params.iter()), |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|v| v as u64).collect())
    }

    /// Children of `parent_pk`, optionally narrowed by `filter`, capped at
    /// `limit` rows -- the primitive the scrubber's BFS walk drives.
    pub fn get_child(&self, parent_pk: u64, filter: Option<&Filter>, limit: u64) -> Result<Vec<u64>> {
        let mut predicates = vec![Predicate {
            table: Table::Main,
            column: "parent_id",
            op: CmpOp::Eq,
            value: rusqlite::types::Value::Integer(parent_pk as i64),
        }];
        if let Some(f) = filter {
            predicates.extend(f.predicates.clone());
        }
        let combined = Filter { predicates, dir_filter: filter.and_then(|f| f.dir_filter.clone()) };
        self.iterator(&combined, None, &IterOptions { limit: Some(limit) })
    }

    /// Primary keys of every row not stamped with `current_generation` --
    /// either untouched by any scan, or last touched by an earlier one.
    /// Drives the end-of-scan `RM_OLD_ENTRIES` sweep (spec.md §4.5).
    pub fn stale_ids(&self, current_generation: &str) -> Result<Vec<u64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM main WHERE scan_generation IS NULL OR scan_generation != ?1",
        )?;
        let ids = stmt
            .query_map(rusqlite::params![current_generation], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(|v| v as u64).collect())
    }

    /// Computes the directory aggregates (`dircount`, `avgsize`) over
    /// `parent_pk`'s direct children.
    pub fn get_dir_attrs(&self, parent_pk: u64) -> Result<(u64, f64)> {
        let conn = self.conn.lock().unwrap();
        let dircount: i64 = conn.query_row(
            "SELECT COUNT(*) FROM main WHERE parent_id = ?1",
            rusqlite::params![parent_pk as i64],
            |row| row.get(0),
        )?;
        let avgsize: Option<f64> = conn.query_row(
            "SELECT AVG(size) FROM main WHERE parent_id = ?1",
            rusqlite::params![parent_pk as i64],
            |row| row.get(0),
        )?;
        Ok((dircount as u64, avgsize.unwrap_or(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{EntryStatus, EntryType};

    fn sample(fullpath: &str) -> EntryAttributes {
        EntryAttributes {
            size: Some(10),
            entry_type: Some(EntryType::File),
            fullpath: Some(fullpath.to_string()),
            status: Some(EntryStatus::New),
            ..Default::default()
        }
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let cat = Catalog::open_in_memory().unwrap();
        let id = EntryId::Legacy { device: 1, inode: 2, validator: 1 };
        cat.insert(&id, &sample("/mnt/fs/a")).unwrap();
        assert!(cat.insert(&id, &sample("/mnt/fs/a")).is_err());
    }

    #[test]
    fn upsert_then_get_roundtrips() {
        let cat = Catalog::open_in_memory().unwrap();
        let id = EntryId::Native { fid: 7, generation: 1 };
        cat.upsert(&id, &sample("/mnt/fs/b")).unwrap();
        let fetched = cat.get(&id, AttrMask::empty()).unwrap().unwrap();
        assert_eq!(fetched.fullpath.as_deref(), Some("/mnt/fs/b"));
    }

    #[test]
    fn get_with_stripe_mask_fetches_stripe_rows() {
        let cat = Catalog::open_in_memory().unwrap();
        let id = EntryId::Native { fid: 9, generation: 1 };
        let info = StripeInfo { validator: 1, stripe_count: 1, stripe_size: 1 << 20, pool_name: "p0".into() };
        let items = vec![StripeItem { stripe_index: 0, ostidx: 0, details: vec![] }];
        cat.upsert_with_stripe(&id, &sample("/mnt/fs/c"), &info, &items).unwrap();

        let without = cat.get(&id, AttrMask::empty()).unwrap().unwrap();
        assert!(without.stripe_info.is_none());

        let with = cat.get(&id, AttrMask::STRIPE).unwrap().unwrap();
        assert_eq!(with.stripe_info.unwrap().pool_name, "p0");
        assert_eq!(with.stripe_items.unwrap().len(), 1);
    }

    #[test]
    fn get_child_filters_by_parent() {
        let cat = Catalog::open_in_memory().unwrap();
        let parent = EntryId::Native { fid: 1, generation: 1 };
        cat.upsert(&parent, &sample("/mnt/fs/dir")).unwrap();

        let child_a = EntryId::Native { fid: 2, generation: 1 };
        let mut a = sample("/mnt/fs/dir/a");
        a.parent_id = Some(parent.primary_key());
        cat.upsert(&child_a, &a).unwrap();

        let child_b = EntryId::Native { fid: 3, generation: 1 };
        let mut b = sample("/mnt/fs/dir/b");
        b.parent_id = Some(parent.primary_key());
        cat.upsert(&child_b, &b).unwrap();

        let other = EntryId::Native { fid: 4, generation: 1 };
        cat.upsert(&other, &sample("/mnt/fs/other")).unwrap();

        let children = cat.get_child(parent.primary_key(), None, 50).unwrap();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn get_dir_attrs_computes_count_and_average() {
        let cat = Catalog::open_in_memory().unwrap();
        let parent = EntryId::Native { fid: 10, generation: 1 };
        cat.upsert(&parent, &sample("/mnt/fs/dir")).unwrap();

        for (fid, size) in [(11u128, 10u64), (12, 20)] {
            let child = EntryId::Native { fid, generation: 1 };
            let mut attrs = sample("/mnt/fs/dir/x");
            attrs.parent_id = Some(parent.primary_key());
            attrs.size = Some(size);
            cat.upsert(&child, &attrs).unwrap();
        }

        let (count, avg) = cat.get_dir_attrs(parent.primary_key()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(avg, 15.0);
    }

    #[test]
    fn stale_ids_excludes_current_generation() {
        let cat = Catalog::open_in_memory().unwrap();
        let fresh = EntryId::Native { fid: 20, generation: 1 };
        let mut fresh_attrs = sample("/mnt/fs/fresh");
        fresh_attrs.generation = Some("gen-2".into());
        cat.upsert(&fresh, &fresh_attrs).unwrap();

        let stale = EntryId::Native { fid: 21, generation: 1 };
        let mut stale_attrs = sample("/mnt/fs/stale");
        stale_attrs.generation = Some("gen-1".into());
        cat.upsert(&stale, &stale_attrs).unwrap();

        let untouched = EntryId::Native { fid: 22, generation: 1 };
        cat.upsert(&untouched, &sample("/mnt/fs/untouched")).unwrap();

        let ids = cat.stale_ids("gen-2").unwrap();
        assert!(ids.contains(&stale.primary_key()));
        assert!(ids.contains(&untouched.primary_key()));
        assert!(!ids.contains(&fresh.primary_key()));
    }

    #[test]
    fn upsert_preserves_generation_when_not_supplied() {
        let cat = Catalog::open_in_memory().unwrap();
        let id = EntryId::Native { fid: 23, generation: 1 };
        let mut first = sample("/mnt/fs/a");
        first.generation = Some("gen-1".into());
        cat.upsert(&id, &first).unwrap();

        // A change-log-driven write carries no generation; it must not
        // blank out the value a scan previously stamped.
        let second = sample("/mnt/fs/a-renamed");
        cat.upsert(&id, &second).unwrap();

        let fetched = cat.get(&id, AttrMask::empty()).unwrap().unwrap();
        assert_eq!(fetched.generation.as_deref(), Some("gen-1"));
    }

    #[test]
    fn vars_roundtrip_through_catalog() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.set_var("FS_key", "fsname").unwrap();
        assert_eq!(cat.get_var("FS_key").unwrap(), Some("fsname".to_string()));
    }
}
