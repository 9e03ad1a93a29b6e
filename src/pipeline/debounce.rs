//! Per-entity coalescing of bursty property updates.
//!
//! A multi-sensor typically reports one physical sample as several messages
//! (one per measurement cluster). Updates arriving within the entity's
//! `debounce` window are merged into one pending buffer and flushed together
//! when the window, measured from the first update, elapses.
//!
//! Properties listed in `debounce_ignore` are never silently overwritten: if
//! an update carries a different value for one of them than the pending
//! buffer, the buffer is flushed first and a new one starts with the update.

use super::timer::Timer;
use super::{Downstream, outbound};
use crate::options::DeviceOptions;
use crate::state::merge::{self, Properties};
use crate::state::StateCache;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Change reason recorded in the cache for coalesced flushes.
pub const REASON_DEBOUNCE: &str = "publishDebounce";
/// Change reason for updates of entities without a window.
pub const REASON_DIRECT: &str = "publish";
/// Change reason when a freshness read consumes the buffer.
pub const REASON_PUBLISH_NOW: &str = "publishNow";

struct PendingBuffer {
    generation: u64,
    patch: Properties,
    created: Instant,
    timer: Timer,
}

struct Inner {
    buffers: Mutex<HashMap<String, PendingBuffer>>,
    generation: AtomicU64,
    state: Arc<StateCache>,
    options: Arc<DeviceOptions>,
    downstream: Arc<dyn Downstream>,
    cache_state: bool,
}

impl Inner {
    /// Commit a patch to the cache and hand the result downstream.
    /// Callers hold the buffer lock so flushes of one entity never interleave.
    fn flush(&self, entity: &str, patch: &Properties, reason: &str) {
        let merged = self.state.set(entity, patch, Some(reason));
        self.downstream
            .forward(entity, outbound(self.cache_state, merged, patch));
    }

    fn start(
        self: &Arc<Self>,
        entity: &str,
        patch: Properties,
        window: Duration,
    ) -> PendingBuffer {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let key = entity.to_string();
        let timer = Timer::after(window, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire(&key, generation);
            }
        });

        PendingBuffer {
            generation,
            patch,
            created: Instant::now(),
            timer,
        }
    }

    fn expire(&self, entity: &str, generation: u64) {
        let mut buffers = self.buffers.lock();
        if buffers.get(entity).map(|b| b.generation) != Some(generation) {
            debug!("[Debounce] Stale timer for {} ignored", entity);
            return;
        }
        let Some(PendingBuffer {
            patch,
            created,
            timer,
            ..
        }) = buffers.remove(entity)
        else {
            return;
        };
        timer.disarm();

        debug!(
            "[Debounce] Flushing {} after {}ms",
            entity,
            created.elapsed().as_millis()
        );
        self.flush(entity, &patch, REASON_DEBOUNCE);
    }
}

/// Whether a divergence key has a different value in `patch` than pending.
fn diverges(pending: &Properties, patch: &Properties, keys: &[String]) -> Option<String> {
    keys.iter()
        .find(|key| {
            matches!(
                (pending.get(*key), patch.get(*key)),
                (Some(old), Some(new)) if old != new
            )
        })
        .cloned()
}

/// The coalescing buffer stage.
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl Debouncer {
    pub fn new(
        state: Arc<StateCache>,
        options: Arc<DeviceOptions>,
        downstream: Arc<dyn Downstream>,
        cache_state: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                state,
                options,
                downstream,
                cache_state,
            }),
        }
    }

    /// Buffer an update, flushing whatever the window rules require.
    pub fn update(&self, entity: &str, patch: Properties) {
        let settings = self.inner.options.get(entity);
        let mut buffers = self.inner.buffers.lock();

        if settings.debounce.is_zero() {
            // A window switched off at runtime may still hold an older buffer
            let patch = match buffers.remove(entity) {
                Some(pending) => {
                    let mut combined = pending.patch;
                    merge::merge_patch(&mut combined, &patch);
                    combined
                }
                None => patch,
            };
            self.inner.flush(entity, &patch, REASON_DIRECT);
            return;
        }

        if let Some(buffer) = buffers.get_mut(entity) {
            match diverges(&buffer.patch, &patch, &settings.debounce_ignore) {
                None => {
                    merge::merge_patch(&mut buffer.patch, &patch);
                    return;
                }
                Some(key) => {
                    debug!("[Debounce] {} changed '{}', flushing early", entity, key);
                    if let Some(previous) = buffers.remove(entity) {
                        self.inner.flush(entity, &previous.patch, REASON_DEBOUNCE);
                    }
                }
            }
        }

        let buffer = self.inner.start(entity, patch, settings.debounce);
        buffers.insert(entity.to_string(), buffer);
    }

    /// Cached state with the pending buffer applied on top.
    pub fn effective_state(&self, entity: &str) -> Properties {
        let buffers = self.inner.buffers.lock();
        let state = self.inner.state.get(entity);
        match buffers.get(entity) {
            Some(buffer) => merge::applied(&state, &buffer.patch),
            None => state,
        }
    }

    /// Commit the pending buffer to the cache without forwarding it, and
    /// return the freshest unfiltered state.
    pub fn take_fresh(&self, entity: &str) -> Properties {
        let mut buffers = self.inner.buffers.lock();
        match buffers.remove(entity) {
            Some(buffer) => self
                .inner
                .state
                .set(entity, &buffer.patch, Some(REASON_PUBLISH_NOW)),
            None => self.inner.state.get(entity),
        }
    }

    /// Flush the pending buffer of one entity now. No-op without a buffer.
    pub fn flush_now(&self, entity: &str) -> bool {
        let mut buffers = self.inner.buffers.lock();
        match buffers.remove(entity) {
            Some(buffer) => {
                self.inner.flush(entity, &buffer.patch, REASON_DEBOUNCE);
                true
            }
            None => false,
        }
    }

    /// Flush every pending buffer. Returns how many were flushed.
    pub fn flush_all(&self) -> usize {
        let mut buffers = self.inner.buffers.lock();
        let pending: Vec<(String, PendingBuffer)> = buffers.drain().collect();
        for (entity, buffer) in &pending {
            self.inner.flush(entity, &buffer.patch, REASON_DEBOUNCE);
        }
        pending.len()
    }

    /// Discard the pending buffer without flushing it.
    pub fn cancel(&self, entity: &str) -> bool {
        self.inner.buffers.lock().remove(entity).is_some()
    }

    pub fn is_pending(&self, entity: &str) -> bool {
        self.inner.buffers.lock().contains_key(entity)
    }
}
