//! Priority buckets with value deduplication.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::domain::entities::{ImageRequest, Priority, RequestId, RequestKey, StopAction};
use crate::domain::ports::{ClientHandle, ClientId};

use super::events::LoaderEvent;

/// Pending requests of one loader.
///
/// Not synchronized. The loader keeps it behind its own mutex so that a pop
/// and the bookkeeping that follows happen in one critical section.
pub struct RequestQueue {
    buckets: [VecDeque<ImageRequest>; Priority::COUNT],
    unique: HashSet<RequestKey>,
    active: HashMap<RequestId, (ClientId, Priority)>,
    events: mpsc::UnboundedSender<LoaderEvent>,
}

impl RequestQueue {
    /// Creates an empty queue that reports cancellations on `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<LoaderEvent>) -> Self {
        Self {
            buckets: std::array::from_fn(|_| VecDeque::new()),
            unique: HashSet::new(),
            active: HashMap::new(),
            events,
        }
    }

    /// Enqueues `request` unless an equal one is already pending.
    ///
    /// A rejected duplicate is dropped here.
    pub fn add_request(&mut self, request: ImageRequest) -> bool {
        let key = request.key();
        if self.unique.contains(&key) {
            trace!(file = %request.identity(), "Discarding duplicate queued request");
            return false;
        }
        self.unique.insert(key);
        if let Some(client) = request.client() {
            self.active
                .insert(request.id(), (client.id(), request.priority()));
        }
        self.buckets[request.priority().index()].push_back(request);
        true
    }

    /// Takes the oldest request of the highest non-empty priority.
    ///
    /// Requests that are no longer needed are dropped on the way and their
    /// clients get a cancellation event. With the queue empty and `exiting`
    /// set, returns the exit sentinel.
    pub fn pop_next(&mut self, exiting: bool) -> Option<ImageRequest> {
        for bucket in (0..Priority::COUNT).rev() {
            while let Some(mut request) = self.buckets[bucket].pop_front() {
                self.unique.remove(&request.key());
                if request.still_needed() {
                    return Some(request);
                }
                debug!(file = %request.identity(), "Skipping request that is no longer needed");
                self.active.remove(&request.id());
                request.set_loaded_ok(false);
                self.notify_canceled(request);
            }
        }
        exiting.then(ImageRequest::exit)
    }

    /// Cancels requests of `client` covered by `action`.
    ///
    /// Queued requests are dropped. Requests already handed to a worker lose
    /// their active mark so their result is discarded on delivery.
    pub fn cancel_requests(&mut self, client: &ClientHandle, action: StopAction) {
        let id = client.id();
        let mut dropped = 0usize;
        for bucket in &mut self.buckets {
            bucket.retain(|request| {
                let hit = request.belongs_to(id) && action.covers(request.priority());
                if hit {
                    self.unique.remove(&request.key());
                    dropped += 1;
                }
                !hit
            });
        }
        let before = self.active.len();
        self.active
            .retain(|_, (owner, priority)| !(*owner == id && action.covers(*priority)));
        debug!(
            client = ?id,
            ?action,
            queued = dropped,
            in_flight = before - self.active.len(),
            "Cancelled client requests"
        );
    }

    /// Returns true if the request's client still wants its result.
    #[must_use]
    pub fn is_request_still_valid(&self, request: &ImageRequest) -> bool {
        self.is_active(request.id())
    }

    /// Returns true if the request with `id` has not been cancelled.
    #[must_use]
    pub fn is_active(&self, id: RequestId) -> bool {
        self.active.contains_key(&id)
    }

    /// Forgets a request whose result has been delivered.
    pub fn remove_request(&mut self, request: &ImageRequest) {
        self.active.remove(&request.id());
        let key = request.key();
        // A value-equal twin may have been queued after this one was popped.
        let twin_queued = self.buckets[request.priority().index()]
            .iter()
            .any(|queued| queued.key() == key);
        if !twin_queued {
            self.unique.remove(&key);
        }
    }

    /// Drops every queued request, notifying their clients.
    ///
    /// Returns how many were dropped.
    pub fn clear_pending(&mut self) -> usize {
        let mut count = 0;
        for bucket in 0..Priority::COUNT {
            while let Some(mut request) = self.buckets[bucket].pop_front() {
                self.unique.remove(&request.key());
                self.active.remove(&request.id());
                request.set_loaded_ok(false);
                self.notify_canceled(request);
                count += 1;
            }
        }
        count
    }

    /// Returns the number of queued requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    fn notify_canceled(&self, request: ImageRequest) {
        if request.client().is_some() && self.events.send(LoaderEvent::Canceled(request)).is_err()
        {
            trace!("Loader event receiver gone, dropping cancellation");
        }
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("queued", &self.len())
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
