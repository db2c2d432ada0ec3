use crate::fence::FenceTracker;
use crate::logging::{self, LogLevel};
use crate::measurement::core::{
    BlockWindow, DetachReason, DispatchSlot, GroupOp, MeasurementId, SlotOutcome,
};
use crate::tag::{TagBlock, TagKind};
use crate::telemetry::TelemetryStore;
use crossbeam_queue::SegQueue;
use std::sync::Arc;
use std::time::Instant;

/// Mutation of the attached-measurement list, posted by client threads and
/// drained by the dispatcher between blocks.
pub(crate) enum Command {
    Attach {
        slot: Arc<dyn DispatchSlot>,
    },
    Detach {
        id: MeasurementId,
    },
    Synchronized {
        ids: Vec<MeasurementId>,
        op: GroupOp,
    },
}

/// Single-threaded fan-out stage. Owns the ordered list of attached
/// measurements and routes every block through them in registration order,
/// merging virtual-channel output into the working set as it goes.
pub(crate) struct Dispatcher {
    slots: Vec<Arc<dyn DispatchSlot>>,
    commands: Arc<SegQueue<Command>>,
    fences: Arc<FenceTracker>,
    telemetry: Arc<TelemetryStore>,
}

impl Dispatcher {
    pub(crate) fn new(
        commands: Arc<SegQueue<Command>>,
        fences: Arc<FenceTracker>,
        telemetry: Arc<TelemetryStore>,
    ) -> Self {
        Self {
            slots: Vec::new(),
            commands,
            fences,
            telemetry,
        }
    }

    /// Applies queued attach/detach/synchronized operations. Runs between
    /// blocks so every mutation lands on a block boundary.
    pub(crate) fn drain_commands(&mut self) {
        while let Some(command) = self.commands.pop() {
            match command {
                Command::Attach { slot } => self.slots.push(slot),
                Command::Detach { id } => {
                    if let Some(pos) = self.slots.iter().position(|s| s.id() == id) {
                        let slot = self.slots.remove(pos);
                        slot.mark_detached();
                    }
                }
                Command::Synchronized { ids, op } => {
                    for id in ids {
                        if let Some(slot) = self.slots.iter().find(|s| s.id() == id) {
                            slot.apply(op);
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn dispatch(&mut self, block: TagBlock) {
        self.drain_commands();

        if block.tags.iter().any(|t| t.kind == TagKind::Error) {
            logging::log(
                LogLevel::Warning,
                "error tag in stream, global time reference invalid until the next fence",
            );
        }

        let window = BlockWindow {
            begin: block.begin,
            end: block.end,
            fence: block.fence,
        };
        let mut tags = block.tags;
        let mut detached = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let started = Instant::now();
            match slot.deliver(&mut tags, window) {
                SlotOutcome::Skipped => {}
                SlotOutcome::Delivered {
                    modified,
                    tags_seen,
                } => {
                    if modified {
                        // Stable by-time sort keeps emission order of
                        // simultaneous tags, so consumers registered after
                        // the producer observe its output.
                        tags.sort_by_key(|t| t.time);
                    }
                    self.telemetry
                        .record(slot.id(), slot.label(), tags_seen, started.elapsed());
                }
                SlotOutcome::Detach(reason) => {
                    match reason {
                        DetachReason::Aborted => logging::log(
                            LogLevel::Info,
                            &format!("measurement {} aborted, detaching", slot.id()),
                        ),
                        DetachReason::Failed(message) => logging::log(
                            LogLevel::Error,
                            &format!("measurement {} failed: {message}", slot.id()),
                        ),
                    }
                    detached.push(index);
                }
            }
        }
        for index in detached.into_iter().rev() {
            let slot = self.slots.remove(index);
            slot.mark_detached();
        }

        // Observed only after the fan-out: a satisfied fence wait implies
        // every consumer has processed every preceding tag.
        self.fences.observe(window.fence);
        self.drain_commands();
    }

    /// End of stream: every attached measurement receives `on_stop` and the
    /// list is dropped so destructors do not block on a drained engine.
    pub(crate) fn finish(&mut self) {
        self.drain_commands();
        for slot in self.slots.drain(..) {
            slot.finish_stream();
            slot.mark_detached();
        }
    }
}
