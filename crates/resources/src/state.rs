//! Resource lifecycle state and single-fire completion events.
//!
//! # Overview
//!
//! - [`ResourceState`] is the per-resource stage, stored in an
//!   [`AtomicResourceState`] so loader threads and the render thread can read
//!   and advance it without a lock
//! - [`OneShot`] is a completion event that fires at most once; subscribers
//!   registered after it fired are called immediately with the stored value
//!
//! ```text
//! Registered -> Loading -> Loaded -> QueuedForUpload -> OnGpu
//!                  \
//!                   -> Failed
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Stage of a resource in the load and upload pipeline.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Known to the registry, nothing loaded yet.
    #[default]
    Registered = 0,
    /// CPU-side parsing in progress.
    Loading = 1,
    /// CPU data ready, not yet queued.
    Loaded = 2,
    /// Waiting in the upload queue or on an upload worker.
    QueuedForUpload = 3,
    /// GPU objects created; the resource can be drawn.
    OnGpu = 4,
    /// CPU-side load failed. The resource never reaches the GPU.
    Failed = 5,
}

impl ResourceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ResourceState::Loading,
            2 => ResourceState::Loaded,
            3 => ResourceState::QueuedForUpload,
            4 => ResourceState::OnGpu,
            5 => ResourceState::Failed,
            _ => ResourceState::Registered,
        }
    }

    /// Returns true if `self -> next` is a legal step.
    ///
    /// `OnGpu -> QueuedForUpload` is taken when a resource uploaded without a
    /// device has to be uploaded again for a real one.
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        matches!(
            (self, next),
            (ResourceState::Registered, ResourceState::Loading)
                | (ResourceState::Registered, ResourceState::Loaded)
                | (ResourceState::Loading, ResourceState::Loaded)
                | (ResourceState::Loading, ResourceState::Failed)
                | (ResourceState::Loaded, ResourceState::QueuedForUpload)
                | (ResourceState::QueuedForUpload, ResourceState::OnGpu)
                | (ResourceState::OnGpu, ResourceState::QueuedForUpload)
        )
    }

    /// CPU data is available (the resource may or may not be on the GPU yet).
    #[inline]
    pub fn is_loaded(self) -> bool {
        matches!(
            self,
            ResourceState::Loaded | ResourceState::QueuedForUpload | ResourceState::OnGpu
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceState::Registered => "registered",
            ResourceState::Loading => "loading",
            ResourceState::Loaded => "loaded",
            ResourceState::QueuedForUpload => "queued for upload",
            ResourceState::OnGpu => "on GPU",
            ResourceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lock-free cell holding a [`ResourceState`].
#[derive(Debug, Default)]
pub struct AtomicResourceState(AtomicU8);

impl AtomicResourceState {
    pub fn new(state: ResourceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> ResourceState {
        ResourceState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to` if the current state is `from` and the step
    /// is legal. Returns whether the state changed.
    pub fn transition(&self, from: ResourceState, to: ResourceState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

type Subscriber<T> = Box<dyn FnOnce(T) + Send>;

struct OneShotInner<T> {
    value: Option<T>,
    subscribers: Vec<Subscriber<T>>,
}

/// Event that fires once and replays its value to late subscribers.
///
/// # Example
///
/// ```
/// use ember_resources::OneShot;
///
/// let event = OneShot::new();
/// assert!(event.fire(7));
/// assert!(!event.fire(8));
///
/// event.subscribe(|value| assert_eq!(value, 7));
/// assert_eq!(event.wait(), 7);
/// ```
pub struct OneShot<T> {
    inner: Mutex<OneShotInner<T>>,
    fired: Condvar,
}

impl<T: Clone + Send + 'static> OneShot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OneShotInner {
                value: None,
                subscribers: Vec::new(),
            }),
            fired: Condvar::new(),
        }
    }

    /// Stores `value`, wakes waiters and runs every pending subscriber.
    ///
    /// Returns false (and drops `value`) if the event already fired.
    pub fn fire(&self, value: T) -> bool {
        let subscribers = {
            let mut inner = self.inner.lock();
            if inner.value.is_some() {
                return false;
            }
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.subscribers)
        };
        self.fired.notify_all();

        // Run outside the lock so a callback may subscribe or read again.
        for subscriber in subscribers {
            subscriber(value.clone());
        }
        true
    }

    /// Runs `f` once with the fired value, immediately if already fired.
    pub fn subscribe(&self, f: impl FnOnce(T) + Send + 'static) {
        let value = {
            let mut inner = self.inner.lock();
            match &inner.value {
                Some(value) => value.clone(),
                None => {
                    inner.subscribers.push(Box::new(f));
                    return;
                }
            }
        };
        f(value);
    }

    /// Returns the value if the event fired.
    pub fn get(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    #[inline]
    pub fn is_fired(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// Blocks until the event fires.
    pub fn wait(&self) -> T {
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = &inner.value {
                return value.clone();
            }
            self.fired.wait(&mut inner);
        }
    }

    /// Blocks until the event fires or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.value.is_none() {
            self.fired
                .wait_while_for(&mut inner, |inner| inner.value.is_none(), timeout);
        }
        inner.value.clone()
    }
}

impl<T: Clone + Send + 'static> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for OneShot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OneShot")
            .field("value", &inner.value)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    #[test]
    fn test_state_round_trips_through_atomic() {
        let state = AtomicResourceState::new(ResourceState::Registered);
        assert!(state.transition(ResourceState::Registered, ResourceState::Loading));
        assert!(state.transition(ResourceState::Loading, ResourceState::Loaded));
        assert!(state.transition(ResourceState::Loaded, ResourceState::QueuedForUpload));
        assert!(state.transition(ResourceState::QueuedForUpload, ResourceState::OnGpu));
        assert_eq!(state.get(), ResourceState::OnGpu);
    }

    #[test]
    fn test_transition_rejects_wrong_source_and_illegal_steps() {
        let state = AtomicResourceState::new(ResourceState::Loading);
        assert!(!state.transition(ResourceState::Registered, ResourceState::Loading));
        assert!(!state.transition(ResourceState::Loading, ResourceState::OnGpu));
        assert_eq!(state.get(), ResourceState::Loading);

        assert!(state.transition(ResourceState::Loading, ResourceState::Failed));
        assert!(!state.transition(ResourceState::Failed, ResourceState::Loaded));
    }

    #[test]
    fn test_on_gpu_can_only_go_back_to_the_queue() {
        assert!(ResourceState::OnGpu.can_transition_to(ResourceState::QueuedForUpload));
        assert!(!ResourceState::OnGpu.can_transition_to(ResourceState::Loaded));
        assert!(!ResourceState::OnGpu.can_transition_to(ResourceState::Loading));
    }

    #[test]
    fn test_is_loaded() {
        assert!(!ResourceState::Registered.is_loaded());
        assert!(!ResourceState::Loading.is_loaded());
        assert!(ResourceState::Loaded.is_loaded());
        assert!(ResourceState::OnGpu.is_loaded());
        assert!(!ResourceState::Failed.is_loaded());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let event = OneShot::new();
        assert!(!event.is_fired());
        assert!(event.fire(1));
        assert!(!event.fire(2));
        assert_eq!(event.get(), Some(1));
    }

    #[test]
    fn test_one_shot_runs_pending_and_late_subscribers() {
        let event = OneShot::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let early = calls.clone();
        event.subscribe(move |v: u32| {
            assert_eq!(v, 5);
            early.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        event.fire(5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = calls.clone();
        event.subscribe(move |v| {
            assert_eq!(v, 5);
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_one_shot_wait_across_threads() {
        let event = Arc::new(OneShot::new());
        let firer = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            firer.fire("done".to_string());
        });
        assert_eq!(event.wait(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_one_shot_wait_timeout_expires() {
        let event: OneShot<bool> = OneShot::new();
        assert_eq!(event.wait_timeout(Duration::from_millis(10)), None);
        event.fire(true);
        assert_eq!(event.wait_timeout(Duration::from_millis(10)), Some(true));
    }
}
