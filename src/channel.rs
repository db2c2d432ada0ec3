use crate::config::ConfigError;
use crate::tag::ChannelId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

/// Sentinel for "no channel configured" under the `One` numbering scheme.
///
/// The value is far outside the physical range so it cannot alias a falling
/// edge id, which are negative under this scheme.
pub const UNUSED_CHANNEL: ChannelId = -134_217_728;

/// Legacy sentinel used by the `Zero` numbering scheme, where falling edges
/// occupy the upper half of the positive range and -1 is free.
pub const UNUSED_CHANNEL_LEGACY: ChannelId = -1;

/// First identifier handed out for virtual producers. Physical edges of all
/// supported devices stay well below this value under both schemes.
pub const VIRTUAL_CHANNEL_BASE: ChannelId = 4096;

/// Process-wide channel numbering scheme.
///
/// `Zero` numbers rising edges 0..N and falling edges N..2N. `One` numbers
/// rising edges 1..=N and falling edges -1..=-N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelScheme {
    Zero,
    One,
}

/// Sentinel encoding "unused channel" for the given scheme.
pub fn unused_channel(scheme: ChannelScheme) -> ChannelId {
    match scheme {
        ChannelScheme::Zero => UNUSED_CHANNEL_LEGACY,
        ChannelScheme::One => UNUSED_CHANNEL,
    }
}

/// Compares a channel against the scheme's sentinel. Under `One` the legacy
/// sentinel is still accepted for configurations written against `Zero`.
pub fn is_unused(scheme: ChannelScheme, channel: ChannelId) -> bool {
    match scheme {
        ChannelScheme::Zero => channel == UNUSED_CHANNEL_LEGACY,
        ChannelScheme::One => channel == UNUSED_CHANNEL || channel == UNUSED_CHANNEL_LEGACY,
    }
}

pub fn is_virtual(channel: ChannelId) -> bool {
    channel >= VIRTUAL_CHANNEL_BASE
}

/// Hands out unique virtual channel identifiers and tracks how many holders
/// still reference each one. An id returns to the free pool only when its
/// count reaches zero, so producers can outlive the allocating measurement
/// until every dependent consumer has detached.
#[derive(Debug, Default)]
pub struct VirtualChannelAllocator {
    inner: Mutex<AllocState>,
}

#[derive(Debug)]
struct AllocState {
    next: ChannelId,
    free: Vec<ChannelId>,
    refs: HashMap<ChannelId, u32>,
}

impl Default for AllocState {
    fn default() -> Self {
        Self {
            next: VIRTUAL_CHANNEL_BASE,
            free: Vec::new(),
            refs: HashMap::new(),
        }
    }
}

impl VirtualChannelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id with a reference count of one.
    pub fn allocate(&self) -> ChannelId {
        let mut state = self.inner.lock().unwrap();
        let id = state.free.pop().unwrap_or_else(|| {
            let id = state.next;
            state.next += 1;
            id
        });
        state.refs.insert(id, 1);
        id
    }

    /// Adds a holder for an already allocated id.
    pub fn retain(&self, channel: ChannelId) {
        let mut state = self.inner.lock().unwrap();
        if let Some(count) = state.refs.get_mut(&channel) {
            *count += 1;
        }
    }

    /// Drops a holder; the id is recycled once the last holder releases it.
    pub fn release(&self, channel: ChannelId) {
        let mut state = self.inner.lock().unwrap();
        if let Some(count) = state.refs.get_mut(&channel) {
            *count -= 1;
            if *count == 0 {
                state.refs.remove(&channel);
                state.free.push(channel);
            }
        }
    }

    pub fn active(&self) -> usize {
        self.inner.lock().unwrap().refs.len()
    }
}

/// Reference-counted set of channels the source must transport.
///
/// Measurements register their inputs on attach and unregister on detach;
/// the source is reconfigured with the effective set whenever it changes.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    counts: Mutex<BTreeMap<ChannelId, u32>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the channel was not transported before.
    pub fn register(&self, channel: ChannelId) -> bool {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(channel).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the channel is no longer transported.
    pub fn unregister(&self, channel: ChannelId) -> bool {
        let mut counts = self.counts.lock().unwrap();
        match counts.get_mut(&channel) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(&channel);
                true
            }
            None => false,
        }
    }

    /// Physical channels with a nonzero count, the set a source transports.
    pub fn transported(&self) -> BTreeSet<ChannelId> {
        self.counts
            .lock()
            .unwrap()
            .keys()
            .copied()
            .filter(|ch| !is_virtual(*ch))
            .collect()
    }
}

/// Validates a user supplied input channel id.
pub fn validate_input(channel: ChannelId, what: &'static str) -> Result<ChannelId, ConfigError> {
    let scheme = crate::config::channel_scheme();
    if is_unused(scheme, channel) {
        return Err(ConfigError::InvalidChannel { channel, what });
    }
    Ok(channel)
}
