// PipelineOp: the unit of work threaded through the pipeline's stages
// (spec.md §4.4).

use std::time::Instant;

use crate::attrs::EntryAttributes;
use crate::changelog::ChangelogEvent;
use crate::id::EntryId;
use crate::idconstraint::OpHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Proceed to the next stage.
    Next,
    /// Re-run this same stage later (a constraint wasn't satisfied yet, or
    /// a transient error occurred).
    Again,
    /// Stop processing this op; it is discarded (either intentionally, e.g.
    /// a rename raced an unlink, or because of a permanent error).
    Drop,
}

/// What each stage still needs to fetch before it can act. Set by earlier
/// stages, cleared by the stage that satisfies them (spec.md §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchFlags {
    pub getstripe_needed: bool,
    pub getattr_needed: bool,
    pub getpath_needed: bool,
    pub getstatus_needed: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineOp {
    pub id: Option<EntryId>,
    pub attrs: EntryAttributes,
    pub fetch: FetchFlags,
    pub changelog_record_id: Option<u64>,
    /// The change-log event that produced this op, if any -- `DB_APPLY`
    /// branches on `ChangelogEvent::Unlink` to delete rather than upsert.
    pub changelog_event: Option<ChangelogEvent>,
    pub id_constraint_handle: Option<OpHandle>,
    /// Retry bookkeeping for the `Again` outcome's exponential backoff.
    pub attempt: u32,
    pub retry_after: Option<Instant>,
}

impl PipelineOp {
    pub fn new(id: Option<EntryId>, attrs: EntryAttributes) -> Self {
        PipelineOp {
            id,
            attrs,
            fetch: FetchFlags::default(),
            changelog_record_id: None,
            changelog_event: None,
            id_constraint_handle: None,
            attempt: 0,
            retry_after: None,
        }
    }

    pub fn with_changelog_record(mut self, record_id: u64) -> Self {
        self.changelog_record_id = Some(record_id);
        self
    }

    pub fn with_changelog_event(mut self, event: ChangelogEvent) -> Self {
        self.changelog_event = Some(event);
        self
    }
}
