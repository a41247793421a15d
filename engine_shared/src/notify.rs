//! Notification batching.
//!
//! During a tick with more than one substep, backend events are buffered and replayed
//! once, in emission order, when the tick retires. Single-substep ticks forward events
//! straight through. The application callback is never invoked concurrently with itself.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::physics::{same_callback, EventCallback, PhysicsBackend, SimEvent};

#[derive(Default)]
struct BatchState {
    batching: bool,
    buffer: Vec<SimEvent>,
    application: Option<EventCallback>,
}

/// Collects events while batching and delivers them to the application callback.
#[derive(Default)]
pub struct NotificationBatcher {
    state: Mutex<BatchState>,
    delivery: Mutex<()>,
}

impl NotificationBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_application(&self, callback: Option<EventCallback>) {
        self.state.lock().application = callback;
    }

    pub fn application(&self) -> Option<EventCallback> {
        self.state.lock().application.clone()
    }

    pub fn is_batching(&self) -> bool {
        self.state.lock().batching
    }

    /// Buffered events not yet delivered.
    pub fn pending(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn begin_tick(&self, batch: bool) {
        let mut state = self.state.lock();
        debug_assert!(state.buffer.is_empty(), "batched events leaked across ticks");
        state.batching = batch;
    }

    /// Buffers the event when batching, otherwise forwards it synchronously.
    ///
    /// Events arriving with no application callback installed are discarded.
    pub fn record(&self, event: &SimEvent) {
        let app = {
            let mut state = self.state.lock();
            let Some(app) = state.application.clone() else {
                return;
            };
            if state.batching {
                state.buffer.push(event.clone());
                return;
            }
            app
        };
        let _serial = self.delivery.lock();
        app(event);
    }

    /// Replays buffered events in order and returns to pass-through mode.
    /// Returns the number of events delivered.
    pub fn end_tick(&self) -> usize {
        let (app, events) = {
            let mut state = self.state.lock();
            let was_batching = state.batching;
            state.batching = false;
            if !was_batching {
                debug_assert!(state.buffer.is_empty());
                return 0;
            }
            (state.application.clone(), std::mem::take(&mut state.buffer))
        };

        let Some(app) = app else {
            return 0;
        };
        let _serial = self.delivery.lock();
        for event in &events {
            app(event);
        }
        trace!(count = events.len(), "Replayed batched notifications");
        events.len()
    }
}

/// The callback the scheduler puts into the backend's notification slot.
///
/// Installed at tick start, taken back out at retire so the application's own callback
/// occupies the slot between ticks.
pub struct BatchingShim {
    batcher: Arc<NotificationBatcher>,
    callback: EventCallback,
}

impl BatchingShim {
    pub fn new(batcher: Arc<NotificationBatcher>) -> Self {
        let target = Arc::clone(&batcher);
        let callback: EventCallback = Arc::new(move |event: &SimEvent| target.record(event));
        Self { batcher, callback }
    }

    pub fn batcher(&self) -> &Arc<NotificationBatcher> {
        &self.batcher
    }

    fn is_self(&self, slot: Option<&EventCallback>) -> bool {
        slot.is_some_and(|cb| same_callback(cb, &self.callback))
    }

    /// Wraps whatever callback the backend currently holds and starts a tick.
    pub fn install<B: PhysicsBackend>(&self, backend: &mut B, batch: bool) {
        let current = backend.event_callback();
        if !self.is_self(current.as_ref()) {
            self.batcher.set_application(current);
            backend.set_event_callback(Some(Arc::clone(&self.callback)));
        }
        self.batcher.begin_tick(batch);
    }

    /// Puts the application callback back into the slot.
    pub fn restore<B: PhysicsBackend>(&self, backend: &mut B) {
        if self.is_self(backend.event_callback().as_ref()) {
            backend.set_event_callback(self.batcher.application());
        }
    }
}
