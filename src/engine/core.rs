use crate::channel::{ChannelRegistry, ChannelScheme, VirtualChannelAllocator};
use crate::config::{self, ConfigError};
use crate::engine::dispatcher::{Command, Dispatcher};
use crate::fence::FenceTracker;
use crate::measurement::core::{DispatchSlot, MeasurementId, SlotStatus};
use crate::source::core::{Pull, Source};
use crate::telemetry::{MeasurementTelemetry, TelemetryStore};
use crossbeam_queue::SegQueue;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Engine-level knobs. The block-size policy lives with the source.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Numbering scheme to freeze for the process; `None` keeps the
    /// environment-driven default.
    pub channel_scheme: Option<ChannelScheme>,
    /// Heartbeat of the dispatcher loop; bounds the latency of attach and
    /// detach requests while the stream is idle.
    pub pull_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_scheme: None,
            pull_timeout: Duration::from_millis(10),
        }
    }
}

/// Shared engine state reachable from client threads and handles.
pub(crate) struct EngineCore {
    fences: Arc<FenceTracker>,
    allocator: Arc<VirtualChannelAllocator>,
    registry: Arc<ChannelRegistry>,
    commands: Arc<SegQueue<Command>>,
    telemetry: Arc<TelemetryStore>,
    source: Arc<dyn Source>,
    next_id: AtomicU64,
    dispatcher_alive: AtomicBool,
    stop_requested: AtomicBool,
    slots: Mutex<BTreeMap<MeasurementId, Weak<dyn DispatchSlot>>>,
}

impl EngineCore {
    pub(crate) fn allocate_id(&self) -> MeasurementId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn fences(&self) -> &Arc<FenceTracker> {
        &self.fences
    }

    pub(crate) fn allocator(&self) -> &Arc<VirtualChannelAllocator> {
        &self.allocator
    }

    pub(crate) fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub(crate) fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub(crate) fn dispatcher_alive(&self) -> bool {
        self.dispatcher_alive.load(Ordering::Acquire)
    }

    pub(crate) fn reconfigure_source(&self) {
        self.source.configure_channels(&self.registry.transported());
    }

    /// Allocates a fence and publishes it at the source stage.
    pub(crate) fn publish_fence(&self) -> u32 {
        let fence = self.fences.request();
        self.source.inject_config_fence(fence);
        fence
    }

    pub(crate) fn request_attach(&self, slot: Arc<dyn DispatchSlot>) {
        self.commands.push(Command::Attach { slot });
    }

    pub(crate) fn request_detach(&self, id: MeasurementId) {
        if self.dispatcher_alive() {
            self.commands.push(Command::Detach { id });
        }
    }

    pub(crate) fn push_synchronized(&self, ids: Vec<MeasurementId>, op: crate::measurement::core::GroupOp) {
        self.commands.push(Command::Synchronized { ids, op });
    }

    pub(crate) fn index_slot(&self, slot: Arc<dyn DispatchSlot>) {
        self.slots
            .lock()
            .unwrap()
            .insert(slot.id(), Arc::downgrade(&slot));
    }

    pub(crate) fn forget_slot(&self, id: MeasurementId) {
        self.slots.lock().unwrap().remove(&id);
        self.telemetry.forget(id);
    }

    fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.slots
            .lock()
            .unwrap()
            .values()
            .filter_map(|weak| weak.upgrade())
            .map(|slot| slot.status())
            .collect()
    }
}

#[derive(Serialize)]
struct ConfigurationReport {
    channel_scheme: ChannelScheme,
    fence_requested: u32,
    fence_observed: u32,
    measurements: Vec<SlotStatus>,
}

/// Owns the dispatcher thread of one live pipeline.
///
/// Three thread roles cooperate per pipeline: the producer inside the
/// source, the dispatcher spawned here, and the client threads calling the
/// public measurement and engine methods.
pub struct StreamEngine {
    core: Arc<EngineCore>,
    worker: Option<JoinHandle<()>>,
}

impl StreamEngine {
    /// Freezes the process configuration and starts draining the source.
    pub fn start(config: EngineConfig, source: Arc<dyn Source>) -> Result<Self, ConfigError> {
        if let Some(scheme) = config.channel_scheme {
            config::set_channel_scheme(scheme)?;
        }
        // Opening the first source freezes the numbering scheme.
        let _ = config::channel_scheme();

        let core = Arc::new(EngineCore {
            fences: Arc::new(FenceTracker::new()),
            allocator: Arc::new(VirtualChannelAllocator::new()),
            registry: Arc::new(ChannelRegistry::new()),
            commands: Arc::new(SegQueue::new()),
            telemetry: Arc::new(TelemetryStore::new()),
            source,
            next_id: AtomicU64::new(1),
            dispatcher_alive: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            slots: Mutex::new(BTreeMap::new()),
        });

        let worker_core = core.clone();
        let pull_timeout = config.pull_timeout;
        let worker = std::thread::Builder::new()
            .name("tagstream-dispatch".into())
            .spawn(move || {
                let mut dispatcher = Dispatcher::new(
                    worker_core.commands.clone(),
                    worker_core.fences.clone(),
                    worker_core.telemetry.clone(),
                );
                loop {
                    if worker_core.stop_requested.load(Ordering::Acquire) {
                        break;
                    }
                    match worker_core.source.pull(pull_timeout) {
                        Pull::Block(block) => dispatcher.dispatch(block),
                        Pull::Idle => dispatcher.drain_commands(),
                        Pull::EndOfStream => break,
                    }
                }
                dispatcher.finish();
                worker_core.dispatcher_alive.store(false, Ordering::Release);
            })
            .expect("spawning the dispatcher thread");

        Ok(Self {
            core,
            worker: Some(worker),
        })
    }

    pub(crate) fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// Allocates a fence validating the current configuration and time.
    pub fn fence(&self) -> u32 {
        self.core.publish_fence()
    }

    /// Waits until a block carrying `fence` or later has been dispatched.
    pub fn wait_for_fence(&self, fence: u32, timeout_ms: i64) -> bool {
        self.core.fences.wait(fence, timeout_ms)
    }

    /// `fence` followed by `wait_for_fence`: all started measurements and
    /// their registered channels are ready afterwards.
    pub fn sync(&self, timeout_ms: i64) -> bool {
        let fence = self.fence();
        self.wait_for_fence(fence, timeout_ms)
    }

    /// Blocks until the source reported end of stream and every measurement
    /// received `on_stop`. Returns false on timeout.
    pub fn wait_drained(&self, timeout_ms: i64) -> bool {
        let budget = crate::fence::WaitBudget::new(timeout_ms);
        loop {
            if !self.core.dispatcher_alive() {
                return true;
            }
            match budget.remaining() {
                crate::fence::Remaining::Expired => return false,
                _ => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    pub fn telemetry(&self) -> Vec<MeasurementTelemetry> {
        self.core.telemetry.snapshot()
    }

    /// JSON snapshot of the engine configuration and measurement states.
    pub fn configuration(&self) -> String {
        let report = ConfigurationReport {
            channel_scheme: config::channel_scheme(),
            fence_requested: self.core.fences.latest(),
            fence_observed: self.core.fences.observed(),
            measurements: self.core.slot_statuses(),
        };
        serde_json::to_string(&report).unwrap_or_else(|_| "{}".into())
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.core.stop_requested.store(true, Ordering::Release);
        self.core.source.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
