use super::*;
use crate::attrs::EntryAttributes;
use std::path::PathBuf;

    fn test_ctx() -> PipelineContext {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let backend = Arc::new(Backend::new(PathBuf::from("/backend"), PathBuf::from("/mnt/fs"), 7200, "/bin/true".into()));
        PipelineContext { catalog, backend }
    }

    #[test]
    fn get_fid_passes_through_when_id_already_known() {
        let id = EntryId::Native { fid: 1, generation: 1 };
        let mut op = PipelineOp::new(Some(id), EntryAttributes::default());
        let outcome = get_fid(&mut op).unwrap();
        assert_eq!(outcome, StageOutcome::Next);
    }

    #[test]
    fn get_fid_drops_when_path_is_gone() {
        let mut op = PipelineOp::new(
            None,
            EntryAttributes { fullpath: Some("/nonexistent/path/xyz".into()), ..Default::default() },
        );
        let outcome = get_fid(&mut op).unwrap();
        assert_eq!(outcome, StageOutcome::Drop);
    }

    #[test]
    fn db_apply_persists_attrs() {
        let ctx = test_ctx();
        let id = EntryId::Native { fid: 5, generation: 1 };
        let mut op = PipelineOp::new(
            Some(id),
            EntryAttributes { fullpath: Some("/mnt/fs/a".into()), ..Default::default() },
        );
        let outcome = db_apply(&ctx, &mut op).unwrap();
        assert_eq!(outcome, StageOutcome::Next);
        assert!(ctx.catalog.exists(&id).unwrap());
    }

    #[test]
    fn get_info_fs_passes_through_unlink_events_without_statting() {
        let ctx = test_ctx();
        let mut op = PipelineOp::new(
            Some(EntryId::Native { fid: 70, generation: 1 }),
            EntryAttributes { fullpath: Some("/nonexistent/gone".into()), ..Default::default() },
        )
        .with_changelog_event(crate::changelog::ChangelogEvent::Unlink);
        let outcome = get_info_fs(&ctx, &mut op).unwrap();
        assert_eq!(outcome, StageOutcome::Next);
    }

    #[test]
    fn db_apply_deletes_on_unlink_event_instead_of_upserting() {
        let ctx = test_ctx();
        let id = EntryId::Native { fid: 55, generation: 1 };
        ctx.catalog.upsert(&id, &EntryAttributes::default()).unwrap();

        let mut op = PipelineOp::new(Some(id), EntryAttributes { fullpath: Some("/mnt/fs/gone".into()), ..Default::default() })
            .with_changelog_event(crate::changelog::ChangelogEvent::Unlink);
        let outcome = db_apply(&ctx, &mut op).unwrap();
        assert_eq!(outcome, StageOutcome::Next);
        assert!(!ctx.catalog.exists(&id).unwrap());
    }

    #[test]
    fn rm_old_entries_deletes_catalog_row() {
        let ctx = test_ctx();
        let id = EntryId::Native { fid: 6, generation: 1 };
        ctx.catalog.upsert(&id, &EntryAttributes::default()).unwrap();
        let mut op = PipelineOp::new(Some(id), EntryAttributes::default());
        rm_old_entries(&ctx, &mut op).unwrap();
        assert!(!ctx.catalog.exists(&id).unwrap());
    }

    #[test]
    fn merge_missing_fills_only_absent_fields() {
        let mut into = EntryAttributes { size: Some(10), ..Default::default() };
        let from = EntryAttributes { size: Some(999), owner: Some(42), ..Default::default() };
        merge_missing(&mut into, from);
        assert_eq!(into.size, Some(10));
        assert_eq!(into.owner, Some(42));
    }
