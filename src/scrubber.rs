// Scrubber: breadth-first catalog walk (spec.md §4.5).
//
// Maintains a stack of pending parent ids, growing by powers of two (a
// plain `Vec` already does this); new children are pushed so each batch
// pops the most recently discovered level first, making traversal LIFO
// within a level and bounding the number of directories held open at
// once. The same driver also powers the end-of-scan `RM_OLD_ENTRIES`
// sweep (spec.md §4.4) over a generation's stale entries.

use log::debug;

use crate::attrs::EntryType;
use crate::catalog::{Catalog, CmpOp, Filter, Predicate, Table};
use crate::error::Result;

pub struct Scrubber<'a> {
    catalog: &'a Catalog,
    batch_size: usize,
}

impl<'a> Scrubber<'a> {
    pub fn new(catalog: &'a Catalog, batch_size: usize) -> Self {
        Scrubber { catalog, batch_size: batch_size.max(1) }
    }

    /// Walks the catalog breadth-first starting at `roots`, invoking
    /// `on_batch` with each batch of directory children discovered.
    /// Terminates once the pending stack is empty or `on_batch` returns
    /// false.
    pub fn walk(&self, roots: Vec<u64>, mut on_batch: impl FnMut(&[u64]) -> bool) -> Result<()> {
        let mut pending = roots;

        while !pending.is_empty() {
            let take = self.batch_size.min(pending.len());
            let batch: Vec<u64> = pending.split_off(pending.len() - take);
            debug!("scrubber: processing batch of {} parents, {} pending", batch.len(), pending.len());

            let mut discovered = Vec::new();
            for parent in &batch {
                let filter = Filter {
                    predicates: vec![Predicate {
                        table: Table::Main,
                        column: "type",
                        op: CmpOp::Eq,
                        value: rusqlite::types::Value::Text("dir".to_string()),
                    }],
                    dir_filter: None,
                };
                let children = self.catalog.get_child(*parent, Some(&filter), u64::MAX)?;
                discovered.extend(children);
            }

            if !on_batch(&discovered) {
                break;
            }

            // Push so the next iteration drains this level before any
            // earlier level's leftover siblings -- LIFO within a level.
            pending.extend(discovered);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{EntryAttributes, EntryStatus};
    use crate::id::EntryId;

    fn dir_attrs(name: &str, parent: Option<u64>) -> EntryAttributes {
        EntryAttributes {
            entry_type: Some(EntryType::Dir),
            name: Some(name.to_string()),
            parent_id: parent,
            status: Some(EntryStatus::Synchro),
            ..Default::default()
        }
    }

    #[test]
    fn empty_root_list_terminates_immediately() {
        let catalog = Catalog::open_in_memory().unwrap();
        let scrubber = Scrubber::new(&catalog, 50);
        let mut batches = 0;
        scrubber.walk(vec![], |_| { batches += 1; true }).unwrap();
        assert_eq!(batches, 0);
    }

    #[test]
    fn walk_discovers_two_levels() {
        let catalog = Catalog::open_in_memory().unwrap();

        let root = EntryId::Native { fid: 1, generation: 1 };
        catalog.upsert(&root, &dir_attrs("root", None)).unwrap();

        let child_a = EntryId::Native { fid: 2, generation: 1 };
        let mut a = dir_attrs("a", Some(root.primary_key()));
        catalog.upsert(&child_a, &a).unwrap();

        let child_b = EntryId::Native { fid: 3, generation: 1 };
        a.name = Some("b".into());
        catalog.upsert(&child_b, &a).unwrap();

        let grandchild = EntryId::Native { fid: 4, generation: 1 };
        let gc = dir_attrs("c", Some(child_a.primary_key()));
        catalog.upsert(&grandchild, &gc).unwrap();

        let scrubber = Scrubber::new(&catalog, 50);
        let mut seen = Vec::new();
        scrubber
            .walk(vec![root.primary_key()], |batch| {
                seen.extend_from_slice(batch);
                true
            })
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&child_a.primary_key()));
        assert!(seen.contains(&child_b.primary_key()));
        assert!(seen.contains(&grandchild.primary_key()));
    }

    #[test]
    fn callback_returning_false_stops_the_walk() {
        let catalog = Catalog::open_in_memory().unwrap();
        let root = EntryId::Native { fid: 10, generation: 1 };
        catalog.upsert(&root, &dir_attrs("root", None)).unwrap();
        let child = EntryId::Native { fid: 11, generation: 1 };
        catalog.upsert(&child, &dir_attrs("child", Some(root.primary_key()))).unwrap();

        let scrubber = Scrubber::new(&catalog, 50);
        let mut batches = 0;
        scrubber
            .walk(vec![root.primary_key()], |_| {
                batches += 1;
                false
            })
            .unwrap();
        assert_eq!(batches, 1);
    }

    #[test]
    fn batches_are_capped_at_batch_size() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut roots = Vec::new();
        for i in 0..5u128 {
            let id = EntryId::Native { fid: 100 + i, generation: 1 };
            catalog.upsert(&id, &dir_attrs("d", None)).unwrap();
            roots.push(id.primary_key());
        }

        let scrubber = Scrubber::new(&catalog, 2);
        let mut batch_sizes = Vec::new();
        scrubber
            .walk(roots, |batch| {
                batch_sizes.push(batch.len());
                true
            })
            .unwrap();
        // 5 roots at batch size 2: three batches of parents (2, 2, 1),
        // each yielding zero children since none of these dirs have any.
        assert_eq!(batch_sizes, vec![0, 0, 0]);
    }
}
