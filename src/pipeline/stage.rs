// Pipeline stage dispatch: the seven fixed stages of spec.md §4.4,
// `GET_FID -> GET_INFO_DB -> GET_INFO_FS -> REPORTING -> DB_APPLY ->
// CHGLOG_CLR -> RM_OLD_ENTRIES`, grounded in
// original_source/src/include/hsmlite_pipeline.h's stage constants.
//
// `RM_OLD_ENTRIES` is not part of the six-stage chain `Pipeline::start`
// wires per op -- every scanned or change-log-driven entry would otherwise
// be deleted the instant `DB_APPLY` wrote it. It is dispatched directly via
// `step` by the end-of-scan sweep, once per id the current scan generation
// never touched.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::attrs::AttrMask;
use crate::backend::Backend;
use crate::catalog::Catalog;
use crate::changelog::ChangelogEvent;
use crate::fsaccess::FsAccess;
use crate::id::EntryId;

use super::op::{PipelineOp, StageOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    GetFid,
    GetInfoDb,
    GetInfoFs,
    Reporting,
    DbApply,
    ChglogClr,
    /// Only driven at end-of-scan, by the scrubber's stale-entry sweep --
    /// deliberately absent from `ORDER`, see the module comment above.
    RmOldEntries,
}

impl StageName {
    /// The six stages every submitted op flows through in sequence.
    /// `RmOldEntries` is driven separately (see module comment).
    pub const ORDER: [StageName; 6] = [
        StageName::GetFid,
        StageName::GetInfoDb,
        StageName::GetInfoFs,
        StageName::Reporting,
        StageName::DbApply,
        StageName::ChglogClr,
    ];

    /// Whether operations on the same id must enter this stage in arrival
    /// order (spec.md §4.4).
    pub fn ordered(&self) -> bool {
        matches!(self, StageName::GetFid | StageName::DbApply | StageName::ChglogClr)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StageName::GetFid => "GET_FID",
            StageName::GetInfoDb => "GET_INFO_DB",
            StageName::GetInfoFs => "GET_INFO_FS",
            StageName::Reporting => "REPORTING",
            StageName::DbApply => "DB_APPLY",
            StageName::ChglogClr => "CHGLOG_CLR",
            StageName::RmOldEntries => "RM_OLD_ENTRIES",
        }
    }
}

/// Shared, read-mostly handles every stage needs. Cheap to clone (all
/// fields are `Arc`s or small values).
#[derive(Clone)]
pub struct PipelineContext {
    pub catalog: Arc<Catalog>,
    pub backend: Arc<Backend>,
}

/// Runs one stage for `op`, mutating it in place.
pub fn step(ctx: &PipelineContext, stage: StageName, op: &mut PipelineOp) -> crate::error::Result<StageOutcome> {
    match stage {
        StageName::GetFid => get_fid(op),
        StageName::GetInfoDb => get_info_db(ctx, op),
        StageName::GetInfoFs => get_info_fs(ctx, op),
        StageName::Reporting => reporting(op),
        StageName::DbApply => db_apply(ctx, op),
        StageName::ChglogClr => chglog_clr(op),
        StageName::RmOldEntries => rm_old_entries(ctx, op),
    }
}

/// Resolves `op.id` when a producer didn't already supply one (e.g. a
/// change-log record naming only a path). Once the id is known the op can
/// be registered with `IdConstraint` and flow through ordered stages.
fn get_fid(op: &mut PipelineOp) -> crate::error::Result<StageOutcome> {
    if op.id.is_some() {
        return Ok(StageOutcome::Next);
    }
    let path = match &op.attrs.fullpath {
        Some(p) => p.clone(),
        None => {
            warn!("GET_FID: op has neither id nor fullpath, dropping");
            return Ok(StageOutcome::Drop);
        }
    };
    match FsAccess::lstat(Path::new(&path)) {
        Ok(st) => {
            op.id = Some(EntryId::Legacy { device: st.dev, inode: st.ino, validator: st.creation_time });
            Ok(StageOutcome::Next)
        }
        Err(e) => {
            debug!("GET_FID: {} vanished before fid resolution: {}", path, e);
            Ok(StageOutcome::Drop)
        }
    }
}

/// Merges the catalog's existing view into `op.attrs`, filling only fields
/// not already populated by a more recent source (e.g. a fresh `lstat`).
fn get_info_db(ctx: &PipelineContext, op: &mut PipelineOp) -> crate::error::Result<StageOutcome> {
    let id = op.id.as_ref().expect("id resolved by GET_FID");
    if let Some(existing) = ctx.catalog.get(id, AttrMask::STRIPE)? {
        merge_missing(&mut op.attrs, existing);
    }
    Ok(StageOutcome::Next)
}

fn merge_missing(into: &mut crate::attrs::EntryAttributes, from: crate::attrs::EntryAttributes) {
    macro_rules! fill { ($field:ident) => { if into.$field.is_none() { into.$field = from.$field; } }; }
    fill!(fullpath);
    fill!(name);
    fill!(parent_id);
    fill!(entry_type);
    fill!(owner);
    fill!(group);
    fill!(size);
    fill!(blocks);
    fill!(blksize);
    fill!(nlink);
    fill!(last_access);
    fill!(last_mod);
    fill!(creation_time);
    fill!(status);
    fill!(backendpath);
    fill!(last_archive);
    fill!(stripe_info);
    fill!(stripe_items);
}

/// Refreshes POSIX attributes from the live filesystem and, if requested,
/// the entry's backend status (`Backend::get_status`).
fn get_info_fs(ctx: &PipelineContext, op: &mut PipelineOp) -> crate::error::Result<StageOutcome> {
    if op.changelog_event == Some(ChangelogEvent::Unlink) {
        // the entry is already gone from the namespace; there is nothing to
        // stat, and DB_APPLY will delete the row rather than upsert it.
        return Ok(StageOutcome::Next);
    }

    if let Some(path) = op.attrs.fullpath.clone() {
        match FsAccess::lstat(Path::new(&path)) {
            Ok(st) => {
                op.attrs.size = Some(st.size);
                op.attrs.blocks = Some(st.blocks);
                op.attrs.blksize = Some(st.blksize);
                op.attrs.nlink = Some(st.nlink);
                op.attrs.owner = Some(st.owner);
                op.attrs.group = Some(st.group);
                op.attrs.last_access = Some(st.last_access);
                op.attrs.last_mod = Some(st.last_mod);
                op.attrs.creation_time = Some(st.creation_time);
                op.attrs.entry_type = Some(st.entry_type);
            }
            Err(e) => {
                debug!("GET_INFO_FS: {} vanished: {}", path, e);
                return Ok(StageOutcome::Drop);
            }
        }
    }

    if op.fetch.getstatus_needed {
        let id = op.id.as_ref().expect("id resolved by GET_FID");
        if op.attrs.entry_type.map(|t| t.is_backend_tracked()).unwrap_or(false)
            && op.attrs.entry_type != Some(crate::attrs::EntryType::Dir)
        {
            match ctx.backend.get_status(id, &op.attrs) {
                Ok((status, backendpath)) => {
                    op.attrs.status = Some(status);
                    if backendpath.is_some() {
                        op.attrs.backendpath = backendpath;
                    }
                }
                Err(e) => warn!("GET_INFO_FS: get_status failed for {}: {}", id.short(), e),
            }
        }
        op.fetch.getstatus_needed = false;
    }

    Ok(StageOutcome::Next)
}

/// Audit/metrics hook. Spec.md leaves REPORTING's output unspecified beyond
/// "reports"; this logs at info level so a deployment can grep/forward it.
fn reporting(op: &mut PipelineOp) -> crate::error::Result<StageOutcome> {
    if let Some(id) = &op.id {
        info!(
            "{} status={:?} size={:?}",
            id.short(),
            op.attrs.status,
            op.attrs.size
        );
    }
    Ok(StageOutcome::Next)
}

/// Persists `op.attrs` to the catalog, replacing stripe rows when present.
/// A change-log-driven `Unlink` means the entry is gone from the
/// filesystem; there is nothing to upsert, just a row to remove.
fn db_apply(ctx: &PipelineContext, op: &mut PipelineOp) -> crate::error::Result<StageOutcome> {
    let id = op.id.as_ref().expect("id resolved by GET_FID");

    if op.changelog_event == Some(ChangelogEvent::Unlink) {
        ctx.catalog.delete(id)?;
        return Ok(StageOutcome::Next);
    }

    match (&op.attrs.stripe_info, &op.attrs.stripe_items) {
        (Some(info), Some(items)) => {
            ctx.catalog.upsert_with_stripe(id, &op.attrs, info, items)?;
        }
        _ => {
            ctx.catalog.upsert(id, &op.attrs)?;
        }
    }
    Ok(StageOutcome::Next)
}

/// Acking happens in the pipeline driver (it owns the `ChangelogSource`);
/// this stage only marks that the record is ready to be acked.
fn chglog_clr(_op: &mut PipelineOp) -> crate::error::Result<StageOutcome> {
    Ok(StageOutcome::Next)
}

/// End-of-scan cleanup: `op.id` names a catalog entry the scan generation
/// never touched, so it is deleted.
fn rm_old_entries(ctx: &PipelineContext, op: &mut PipelineOp) -> crate::error::Result<StageOutcome> {
    let id = op.id.as_ref().expect("rm_old_entries always carries an id");
    ctx.catalog.delete(id)?;
    debug!("RM_OLD_ENTRIES: removed stale entry {}", id.short());
    Ok(StageOutcome::Next)
}


#[cfg(test)]
#[path = "tests.rs"]
mod tests;
