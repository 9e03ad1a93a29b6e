//! Per-entity publish rate limiting with a leading and a trailing edge.
//!
//! The first message of an entity passes immediately and opens a window.
//! Messages inside the window collapse into one trailing message emitted when
//! the window ends, which re-opens it. A window ending with nothing pending
//! closes.
//!
//! Full-state messages replace the held one outright. Patch messages are
//! folded into it with tombstones kept, so a removal inside the window is
//! still published.

use super::Downstream;
use super::timer::Timer;
use crate::options::DeviceOptions;
use crate::state::merge::{self, Properties};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Window {
    generation: u64,
    trailing: Option<Properties>,
    timer: Timer,
}

struct Inner {
    windows: Mutex<HashMap<String, Window>>,
    generation: AtomicU64,
    options: Arc<DeviceOptions>,
    downstream: Arc<dyn Downstream>,
    /// Messages carry the whole entity state rather than a patch
    full_state: bool,
}

impl Inner {
    fn open(self: &Arc<Self>, entity: &str, period: Duration) -> Window {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let key = entity.to_string();
        let timer = Timer::after(period, move || {
            if let Some(inner) = weak.upgrade() {
                inner.window_end(&key, generation);
            }
        });

        Window {
            generation,
            trailing: None,
            timer,
        }
    }

    fn window_end(self: &Arc<Self>, entity: &str, generation: u64) {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(entity) else {
            return;
        };
        if window.generation != generation {
            debug!("[Throttle] Stale window end for {} ignored", entity);
            return;
        }

        let Some(trailing) = window.trailing.take() else {
            if let Some(closed) = windows.remove(entity) {
                closed.timer.disarm();
            }
            return;
        };

        let period = self.options.get(entity).throttle;
        let ended = if period.is_zero() {
            windows.remove(entity)
        } else {
            windows.insert(entity.to_string(), self.open(entity, period))
        };
        if let Some(ended) = ended {
            ended.timer.disarm();
        }

        debug!("[Throttle] Trailing message for {}", entity);
        self.downstream.forward(entity, trailing);
    }
}

pub struct ThrottleGate {
    inner: Arc<Inner>,
}

impl ThrottleGate {
    pub fn new(
        options: Arc<DeviceOptions>,
        downstream: Arc<dyn Downstream>,
        full_state: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                windows: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                options,
                downstream,
                full_state,
            }),
        }
    }

    /// Pass a message on now or hold it for the end of the open window.
    pub fn publish(&self, entity: &str, message: Properties) {
        let period = self.inner.options.get(entity).throttle;
        if period.is_zero() {
            self.inner.downstream.forward(entity, message);
            return;
        }

        let mut windows = self.inner.windows.lock();
        match windows.get_mut(entity) {
            Some(window) if self.inner.full_state => {
                window.trailing = Some(message);
            }
            Some(window) => {
                let trailing = window.trailing.get_or_insert_with(Properties::new);
                merge::merge_patch(trailing, &message);
            }
            None => {
                windows.insert(entity.to_string(), self.inner.open(entity, period));
                self.inner.downstream.forward(entity, message);
            }
        }
    }

    /// Take the held trailing message out; the window stays open.
    pub fn supersede(&self, entity: &str) -> Option<Properties> {
        self.inner
            .windows
            .lock()
            .get_mut(entity)
            .and_then(|w| w.trailing.take())
    }

    /// Close the window and drop whatever it holds.
    pub fn cancel(&self, entity: &str) -> bool {
        self.inner.windows.lock().remove(entity).is_some()
    }

    /// Close every window, emitting held trailing messages. Returns how many
    /// were emitted.
    pub fn drain(&self) -> usize {
        let mut windows = self.inner.windows.lock();
        let mut emitted = 0;
        for (entity, window) in windows.drain() {
            if let Some(trailing) = window.trailing {
                self.inner.downstream.forward(&entity, trailing);
                emitted += 1;
            }
        }
        emitted
    }

    pub fn is_open(&self, entity: &str) -> bool {
        self.inner.windows.lock().contains_key(entity)
    }
}

impl Downstream for ThrottleGate {
    fn forward(&self, entity: &str, message: Properties) {
        self.publish(entity, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EntityOptions;
    use crate::pipeline::Recorder;
    use serde_json::{Value, json};

    fn props(value: Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    fn gate_with(throttle: f64, full_state: bool) -> (ThrottleGate, Arc<Recorder>) {
        let options = Arc::new(DeviceOptions::default());
        options.set_entity(
            "plug",
            EntityOptions {
                throttle: Some(throttle),
                ..Default::default()
            },
        );
        let recorder = Arc::new(Recorder::default());
        (ThrottleGate::new(options, recorder.clone(), full_state), recorder)
    }

    fn gate(throttle: f64) -> (ThrottleGate, Arc<Recorder>) {
        gate_with(throttle, true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_leading_and_trailing_edges() {
        let (gate, recorder) = gate(1.0);

        gate.publish("plug", props(json!({"v": 1})));
        assert_eq!(recorder.values(), vec![json!({"v": 1})]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        gate.publish("plug", props(json!({"v": 2})));
        tokio::time::sleep(Duration::from_millis(300)).await;
        gate.publish("plug", props(json!({"v": 3})));
        assert_eq!(recorder.len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(recorder.values(), vec![json!({"v": 1}), json!({"v": 3})]);
        assert!(gate.is_open("plug"));

        // Re-armed window ends empty and closes
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!gate.is_open("plug"));
        gate.publish("plug", props(json!({"v": 4})));
        assert_eq!(recorder.values()[2], json!({"v": 4}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_patches_merge_last_writer_wins() {
        let (gate, recorder) = gate_with(1.0, false);

        gate.publish("plug", props(json!({"power": 1})));
        gate.publish("plug", props(json!({"power": 2, "voltage": 230})));
        gate.publish("plug", props(json!({"power": 3})));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(recorder.values()[1], json!({"power": 3, "voltage": 230}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_trailing_is_newest_message() {
        let (gate, recorder) = gate(1.0);

        gate.publish("plug", props(json!({"a": 1, "b": 2})));
        gate.publish("plug", props(json!({"a": 2, "b": 2})));
        // `b` was removed by a later update
        gate.publish("plug", props(json!({"a": 2})));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(
            recorder.values(),
            vec![json!({"a": 1, "b": 2}), json!({"a": 2})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_patch_keeps_tombstone() {
        let (gate, recorder) = gate_with(1.0, false);

        gate.publish("plug", props(json!({"a": 1, "b": 2})));
        gate.publish("plug", props(json!({"a": 2})));
        gate.publish("plug", props(json!({"b": null})));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(recorder.values()[1], json!({"a": 2, "b": null}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_passes_through() {
        let (gate, recorder) = gate(0.0);
        for v in 0..5 {
            gate.publish("plug", props(json!({"v": v})));
        }
        assert_eq!(recorder.len(), 5);
        assert!(!gate.is_open("plug"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersede_drops_trailing() {
        let (gate, recorder) = gate(1.0);

        gate.publish("plug", props(json!({"v": 1})));
        gate.publish("plug", props(json!({"v": 2})));
        assert_eq!(gate.supersede("plug"), Some(props(json!({"v": 2}))));
        assert_eq!(gate.supersede("plug"), None);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(recorder.values(), vec![json!({"v": 1})]);
        assert!(!gate.is_open("plug"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_emits_trailing() {
        let (gate, recorder) = gate(10.0);

        gate.publish("plug", props(json!({"v": 1})));
        gate.publish("plug", props(json!({"v": 2})));
        assert_eq!(gate.drain(), 1);
        assert_eq!(gate.drain(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(recorder.values(), vec![json!({"v": 1}), json!({"v": 2})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_window_end_is_noop() {
        let (gate, recorder) = gate(1.0);

        gate.publish("plug", props(json!({"v": 1})));
        gate.publish("plug", props(json!({"v": 2})));
        gate.inner.window_end("plug", 999);
        assert_eq!(recorder.len(), 1);
        assert!(gate.is_open("plug"));
    }
}
