//! Cross-thread mailbox and the active-surface registry.
//!
//! A [`Mailbox`] moves owned values from one thread to another: `post`
//! transfers ownership into the queue, `drain` hands every pending value
//! to the receiver exactly once. Neither side blocks the other for
//! longer than a `VecDeque` push or swap.
//!
//! The UI layer registers the surface that should receive session
//! events with a [`SurfaceRegistry`]. The session thread never holds a
//! reference to the surface itself; it calls
//! [`deliver`](SurfaceRegistry::deliver), which resolves the active
//! surface under the registry lock and is a no-op if it has gone away.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

// ── Mailbox ──────────────────────────────────────────────────────

/// Mutex-guarded FIFO with a condvar for receivers that want to wait.
#[derive(Debug)]
pub struct Mailbox<T> {
    pending: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfer `item` to the receiving side.
    pub fn post(&self, item: T) {
        self.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Take every pending item in post order.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    /// Like [`drain`](Self::drain), but waits up to `timeout` for the
    /// first item. Returns an empty vector on timeout.
    pub fn drain_timeout(&self, timeout: Duration) -> Vec<T> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.lock();
        while pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            pending = match self.ready.wait_timeout(pending, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── SurfaceRegistry ──────────────────────────────────────────────

/// Opaque id of a registered UI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

struct RegistryInner<T> {
    next_id: u64,
    active: Option<(SurfaceId, Arc<Mailbox<T>>)>,
}

/// Thread-safe table holding the one surface that receives events.
///
/// Registering a new surface replaces the previous one.
pub struct SurfaceRegistry<T> {
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T> Clone for SurfaceRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SurfaceRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 1,
                active: None,
            })),
        }
    }
}

impl<T> fmt::Debug for SurfaceRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceRegistry")
            .field("active", &self.active())
            .finish()
    }
}

impl<T> SurfaceRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a surface and make it the active one.
    pub fn register(&self) -> SurfaceHandle<T> {
        let mailbox = Arc::new(Mailbox::new());
        let mut inner = lock(&self.inner);
        let id = SurfaceId(inner.next_id);
        inner.next_id += 1;
        if let Some((old, _)) = inner.active.replace((id, Arc::clone(&mailbox))) {
            trace!(%old, new = %id, "surface replaced");
        }
        SurfaceHandle {
            id,
            mailbox,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Post `event` to the active surface.
    ///
    /// Returns `false` when no surface is registered; the event is
    /// dropped.
    pub fn deliver(&self, event: T) -> bool {
        let inner = lock(&self.inner);
        match &inner.active {
            Some((_, mailbox)) => {
                mailbox.post(event);
                true
            }
            None => false,
        }
    }

    /// Whether `id` is still the active surface.
    pub fn contains(&self, id: SurfaceId) -> bool {
        lock(&self.inner)
            .active
            .as_ref()
            .is_some_and(|(active, _)| *active == id)
    }

    pub fn active(&self) -> Option<SurfaceId> {
        lock(&self.inner).active.as_ref().map(|(id, _)| *id)
    }
}

fn lock<T>(inner: &Mutex<RegistryInner<T>>) -> MutexGuard<'_, RegistryInner<T>> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// A registered surface. Unregisters itself on drop.
pub struct SurfaceHandle<T> {
    id: SurfaceId,
    mailbox: Arc<Mailbox<T>>,
    registry: Weak<Mutex<RegistryInner<T>>>,
}

impl<T> SurfaceHandle<T> {
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Take every event delivered so far.
    pub fn drain(&self) -> Vec<T> {
        self.mailbox.drain()
    }

    pub fn drain_timeout(&self, timeout: Duration) -> Vec<T> {
        self.mailbox.drain_timeout(timeout)
    }

    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }
}

impl<T> fmt::Debug for SurfaceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceHandle").field("id", &self.id).finish()
    }
}

impl<T> Drop for SurfaceHandle<T> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut inner = lock(&registry);
        // A newer surface may already have replaced this one.
        if inner.active.as_ref().is_some_and(|(id, _)| *id == self.id) {
            inner.active = None;
            trace!(id = %self.id, "surface unregistered");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
