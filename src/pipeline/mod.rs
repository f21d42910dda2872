// Pipeline: thread-per-stage execution of the fixed stage sequence
// (spec.md §4.4), wired with bounded channels for backpressure and an
// `IdConstraint` for per-id ordering -- grounded in the teacher's
// `jobs::worker` thread-spawn idiom (`std::thread::Builder`, panic-
// isolated stage bodies).
//
// `StageName::ORDER` covers the six per-op stages only; `RM_OLD_ENTRIES`
// runs outside this chain, driven directly by the end-of-scan sweep
// (see `stage`'s module comment).

pub mod op;
pub mod stage;

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::constants::{STAGE_RETRY_BASE_BACKOFF_MS, STAGE_RETRY_MAX_ATTEMPTS, STAGE_RETRY_MAX_BACKOFF_MS};
use crate::idconstraint::IdConstraint;

pub use op::{FetchFlags, PipelineOp, StageOutcome};
pub use stage::{PipelineContext, StageName};

struct StageChannel {
    sender: SyncSender<PipelineOp>,
    receiver: Arc<Mutex<Receiver<PipelineOp>>>,
}

fn channel(capacity: usize) -> StageChannel {
    let (tx, rx) = sync_channel(capacity);
    StageChannel { sender: tx, receiver: Arc::new(Mutex::new(rx)) }
}

/// Runs the pipeline's fixed stage sequence over a pool of worker threads,
/// one pool per stage.
pub struct Pipeline {
    stages: Vec<StageChannel>,
    /// Completed (or dropped) ops' changelog record ids, for the driver to
    /// ack against its `ChangelogSource`.
    completions: Arc<Mutex<Receiver<Option<u64>>>>,
    completions_tx: SyncSender<Option<u64>>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns `workers_per_stage` threads for each of the seven stages and
    /// wires their bounded inter-stage channels. Call `submit` to push work
    /// in and drain `recv_completion` (or just drop the pipeline once all
    /// producers are done, which joins every worker).
    pub fn start(ctx: PipelineContext, id_constraint: Arc<IdConstraint>, workers_per_stage: usize, queue_capacity: usize) -> Self {
        let mut stages: Vec<StageChannel> = StageName::ORDER.iter().map(|_| channel(queue_capacity)).collect();
        let (completions_tx, completions_rx) = sync_channel(queue_capacity.max(1));
        let mut handles = Vec::new();

        for (idx, stage_name) in StageName::ORDER.iter().enumerate() {
            let receiver = stages[idx].receiver.clone();
            let next_sender = stages.get(idx + 1).map(|s| s.sender.clone());
            let self_sender = stages[idx].sender.clone();
            let ctx = ctx.clone();
            let id_constraint = Arc::clone(&id_constraint);
            let completions_tx = completions_tx.clone();
            let stage_name = *stage_name;

            for worker in 0..workers_per_stage.max(1) {
                let receiver = receiver.clone();
                let next_sender = next_sender.clone();
                let self_sender = self_sender.clone();
                let ctx = ctx.clone();
                let id_constraint = Arc::clone(&id_constraint);
                let completions_tx = completions_tx.clone();

                let handle = thread::Builder::new()
                    .name(format!("pipeline-{}-{}", stage_name.name(), worker))
                    .spawn(move || {
                        stage_worker_loop(stage_name, &ctx, &id_constraint, &receiver, next_sender.as_ref(), &self_sender, &completions_tx);
                    })
                    .expect("failed to spawn pipeline worker thread");
                handles.push(handle);
            }
        }

        Pipeline { stages, completions: Arc::new(Mutex::new(completions_rx)), completions_tx, handles }
    }

    /// Pushes a new op into the first stage (`GET_FID`). Blocks if that
    /// stage's queue is at its high-water mark (spec.md §4.4 backpressure).
    pub fn submit(&self, op: PipelineOp) -> Result<(), std::sync::mpsc::SendError<PipelineOp>> {
        self.stages[0].sender.send(op)
    }

    /// Blocks for the next op to fall out the far end of the pipeline
    /// (dropped or completed `CHGLOG_CLR`), returning its changelog record
    /// id if it had one, so the driver can ack it.
    pub fn recv_completion(&self) -> Option<Option<u64>> {
        self.completions.lock().unwrap().recv().ok()
    }

    /// Closes the entry channel and joins every worker thread. Safe to call
    /// once all producers have finished `submit`-ting work.
    pub fn shutdown(mut self) {
        self.stages.truncate(0); // drop all senders, closing every channel in turn
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let ms = STAGE_RETRY_BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(10));
    Duration::from_millis(ms.min(STAGE_RETRY_MAX_BACKOFF_MS))
}

#[allow(clippy::too_many_arguments)]
fn stage_worker_loop(
    stage_name: StageName,
    ctx: &PipelineContext,
    id_constraint: &Arc<IdConstraint>,
    receiver: &Arc<Mutex<Receiver<PipelineOp>>>,
    next_sender: Option<&SyncSender<PipelineOp>>,
    self_sender: &SyncSender<PipelineOp>,
    completions_tx: &SyncSender<Option<u64>>,
) {
    loop {
        let mut op = {
            let rx = receiver.lock().unwrap();
            match rx.recv() {
                Ok(op) => op,
                Err(_) => return, // channel closed: upstream is done
            }
        };

        if let Some(deadline) = op.retry_after {
            let now = Instant::now();
            if now < deadline {
                thread::sleep(deadline - now);
            }
        }

        if stage_name.ordered() {
            if let Some(id) = op.id {
                if op.id_constraint_handle.is_none() {
                    op.id_constraint_handle = Some(id_constraint.register(&id));
                }
                let handle = op.id_constraint_handle.unwrap();
                if !id_constraint.is_current(&id, handle) {
                    // Not our turn yet; requeue without counting as a retry
                    // attempt (this is ordering, not failure).
                    op.retry_after = Some(Instant::now() + Duration::from_millis(20));
                    if self_sender.send(op).is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| stage::step(ctx, stage_name, &mut op)));

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_transient() && op.attempt < STAGE_RETRY_MAX_ATTEMPTS => {
                op.attempt += 1;
                op.retry_after = Some(Instant::now() + backoff_for(op.attempt));
                warn!("{}: transient error, retry {}/{}: {}", stage_name.name(), op.attempt, STAGE_RETRY_MAX_ATTEMPTS, e);
                if self_sender.send(op).is_err() {
                    return;
                }
                continue;
            }
            Ok(Err(e)) => {
                error!("{}: permanent error, dropping op: {}", stage_name.name(), e);
                StageOutcome::Drop
            }
            Err(_) => {
                error!("{}: worker panicked (recovered), dropping op", stage_name.name());
                StageOutcome::Drop
            }
        };

        match outcome {
            StageOutcome::Next => {
                if let Some(next) = next_sender {
                    if next.send(op).is_err() {
                        return;
                    }
                } else {
                    finish(&mut op, id_constraint, completions_tx);
                }
            }
            StageOutcome::Again => {
                op.attempt += 1;
                op.retry_after = Some(Instant::now() + backoff_for(op.attempt));
                if self_sender.send(op).is_err() {
                    return;
                }
            }
            StageOutcome::Drop => {
                finish(&mut op, id_constraint, completions_tx);
            }
        }
    }
}

/// Common teardown for an op leaving the pipeline, whether it ran to
/// completion or was dropped: unregister from `IdConstraint` and report the
/// changelog record id for acking (spec.md: "the change-log record, if
/// any, is still acknowledged to avoid replay storms").
fn finish(op: &mut PipelineOp, id_constraint: &Arc<IdConstraint>, completions_tx: &SyncSender<Option<u64>>) {
    if let (Some(id), Some(handle)) = (op.id, op.id_constraint_handle) {
        id_constraint.unregister(&id, handle);
    }
    let _ = completions_tx.send(op.changelog_record_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::EntryAttributes;
    use crate::backend::Backend;
    use crate::catalog::Catalog;
    use crate::id::EntryId;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_ctx() -> PipelineContext {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let backend = Arc::new(Backend::new(PathBuf::from("/backend"), PathBuf::from("/mnt/fs"), 7200, "/bin/true".into()));
        PipelineContext { catalog, backend }
    }

    #[test]
    fn an_op_flows_end_to_end_and_lands_in_the_catalog() {
        let ctx = test_ctx();
        let catalog = Arc::clone(&ctx.catalog);
        let id_constraint = Arc::new(IdConstraint::new());
        let pipeline = Pipeline::start(ctx, id_constraint, 2, 16);

        let id = EntryId::Native { fid: 42, generation: 1 };
        let attrs = EntryAttributes { fullpath: Some("/mnt/fs/a".into()), ..Default::default() };
        pipeline.submit(PipelineOp::new(Some(id), attrs).with_changelog_record(7)).unwrap();

        let completion = pipeline.recv_completion().unwrap();
        assert_eq!(completion, Some(7));
        assert!(catalog.exists(&id).unwrap());

        pipeline.shutdown();
    }

    #[test]
    fn an_op_with_no_path_and_no_id_is_dropped_without_panicking() {
        let ctx = test_ctx();
        let id_constraint = Arc::new(IdConstraint::new());
        let pipeline = Pipeline::start(ctx, id_constraint, 1, 4);

        pipeline.submit(PipelineOp::new(None, EntryAttributes::default())).unwrap();
        let completion = pipeline.recv_completion().unwrap();
        assert_eq!(completion, None);

        pipeline.shutdown();
    }
}
