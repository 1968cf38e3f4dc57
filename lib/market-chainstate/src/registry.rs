//! In-memory projection of every storage request seen on chain.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::types::{Address, BlockNumber, RequestId, RequestState, StorageRequest};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The same request was created twice, the event source delivered duplicates.
    #[error("request {0} already exists")]
    DuplicateRequest(RequestId),
}

/// Hosts assigned to the slots of a single request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RequestHosts {
    /// Slot index to the host currently storing it.
    current: BTreeMap<u64, Address>,
    /// Every slot index that has been filled at least once.
    ///
    /// Always a superset of the keys in `current`.
    ever_filled: BTreeSet<u64>,
}

impl RequestHosts {
    /// Assigns `host` to `slot_index`, returning the host it replaced, if any.
    pub fn fill(&mut self, slot_index: u64, host: Address) -> Option<Address> {
        self.ever_filled.insert(slot_index);
        self.current.insert(slot_index, host)
    }

    /// Clears `slot_index`, returning the host that was storing it.
    ///
    /// The slot is still reported by [`RequestHosts::was_ever_filled`].
    pub fn free(&mut self, slot_index: u64) -> Option<Address> {
        self.current.remove(&slot_index)
    }

    pub fn is_filled(&self, slot_index: u64) -> bool {
        self.current.contains_key(&slot_index)
    }

    pub fn was_ever_filled(&self, slot_index: u64) -> bool {
        self.ever_filled.contains(&slot_index)
    }

    pub fn host(&self, slot_index: u64) -> Option<&Address> {
        self.current.get(&slot_index)
    }

    pub fn current(&self) -> &BTreeMap<u64, Address> {
        &self.current
    }
}

/// A request as tracked by the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedRequest {
    pub request: Arc<StorageRequest>,
    pub state: RequestState,
    pub created_block: BlockNumber,
    pub created_at: DateTime<Utc>,
    pub hosts: RequestHosts,
}

impl TrackedRequest {
    /// The moment a started request is finished: its creation time plus the ask duration.
    pub fn finish_time(&self) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(self.request.ask.storage_duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn view(&self) -> RequestView {
        RequestView {
            request: self.request.clone(),
            state: self.state,
            created_block: self.created_block,
            created_at: self.created_at,
            hosts: self.hosts.clone(),
        }
    }
}

/// Owned, read-only snapshot of a [`TrackedRequest`] at a given point of the replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestView {
    pub request: Arc<StorageRequest>,
    pub state: RequestState,
    pub created_block: BlockNumber,
    pub created_at: DateTime<Utc>,
    pub hosts: RequestHosts,
}

impl RequestView {
    pub fn id(&self) -> &RequestId {
        &self.request.id
    }

    pub fn finish_time(&self) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(self.request.ask.storage_duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.request.expiry
    }
}

/// Started requests, keyed by the moment they finish.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinishQueue {
    map: BTreeMap<DateTime<Utc>, BTreeSet<RequestId>>,
}

impl FinishQueue {
    pub fn schedule(&mut self, at: DateTime<Utc>, id: RequestId) {
        self.map.entry(at).or_default().insert(id);
    }

    /// Removes `id` from the queue; a no-op when it was never scheduled at `at`.
    pub fn cancel(&mut self, at: DateTime<Utc>, id: &RequestId) {
        if let Some(ids) = self.map.get_mut(&at) {
            ids.remove(id);
            if ids.is_empty() {
                self.map.remove(&at);
            }
        }
    }

    /// Pops every request finishing at or before `until`, earliest first.
    pub fn pop_until(&mut self, until: DateTime<Utc>) -> Vec<RequestId> {
        self.pop_while(|at| at <= until)
    }

    /// Pops every request finishing strictly before `until`, earliest first.
    pub fn pop_before(&mut self, until: DateTime<Utc>) -> Vec<RequestId> {
        self.pop_while(|at| at < until)
    }

    fn pop_while<P>(&mut self, due: P) -> Vec<RequestId>
    where
        P: Fn(DateTime<Utc>) -> bool,
    {
        let mut popped = Vec::new();
        while let Some(entry) = self.map.first_entry() {
            if !due(*entry.key()) {
                break;
            }
            popped.extend(entry.remove());
        }
        popped
    }

    pub fn len(&self) -> usize {
        self.map.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Requests as they were before the first change since [`RequestRegistry::begin`].
#[derive(Clone, Debug, PartialEq, Eq)]
struct UndoLog {
    /// Number of requests at the start; later ones were created since.
    len: usize,
    /// `None` for requests that did not exist yet.
    originals: HashMap<RequestId, Option<TrackedRequest>>,
}

/// Every request seen since the owning chain state started observing, in creation order.
///
/// Requests are never evicted. Events referencing unknown requests are expected (the
/// observation may start after their creation) and are logged and ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestRegistry {
    requests: IndexMap<RequestId, TrackedRequest>,
    finish_queue: FinishQueue,
    undo: Option<UndoLog>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording changes, to be kept with [`RequestRegistry::commit`] or reverted
    /// with [`RequestRegistry::rollback`]. Only the requests that change are copied.
    pub(crate) fn begin(&mut self) {
        self.undo = Some(UndoLog {
            len: self.requests.len(),
            originals: HashMap::new(),
        });
    }

    pub(crate) fn commit(&mut self) {
        self.undo = None;
    }

    /// Reverts every change made since [`RequestRegistry::begin`].
    pub(crate) fn rollback(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };

        for (id, original) in undo.originals {
            // The finish queue holds exactly the started requests
            if let Some(current) = self.requests.get(&id) {
                if current.state == RequestState::Started {
                    self.finish_queue.cancel(current.finish_time(), &id);
                }
            }
            if let Some(original) = original {
                if original.state == RequestState::Started {
                    self.finish_queue.schedule(original.finish_time(), id);
                }
                // Replacing an existing key keeps its position
                self.requests.insert(id, original);
            }
        }
        self.requests.truncate(undo.len);
    }

    fn record(&mut self, id: &RequestId) {
        if let Some(undo) = &mut self.undo {
            undo.originals
                .entry(*id)
                .or_insert_with(|| self.requests.get(id).cloned());
        }
    }

    /// Inserts a new request in the [`RequestState::New`] state.
    pub fn create(
        &mut self,
        request: StorageRequest,
        block: BlockNumber,
        created_at: DateTime<Utc>,
    ) -> Result<RequestView, RegistryError> {
        if self.requests.contains_key(&request.id) {
            return Err(RegistryError::DuplicateRequest(request.id));
        }
        tracing::debug!(request_id = %request.id, block, "new request");
        self.record(&request.id);

        let tracked = TrackedRequest {
            request: Arc::new(request),
            state: RequestState::New,
            created_block: block,
            created_at,
            hosts: RequestHosts::default(),
        };
        let view = tracked.view();
        self.requests.insert(tracked.request.id, tracked);
        Ok(view)
    }

    /// Moves a request to `new_state`, returning its updated view.
    ///
    /// Returns `None` (and logs) when the request is unknown or the transition is illegal.
    pub fn transition(
        &mut self,
        id: &RequestId,
        new_state: RequestState,
        block: BlockNumber,
    ) -> Option<RequestView> {
        self.record(id);
        let Some(tracked) = self.requests.get_mut(id) else {
            tracing::debug!(
                request_id = %id,
                block,
                %new_state,
                "transition for unknown request, ignoring"
            );
            return None;
        };

        let old_state = tracked.state;
        if !old_state.can_transition_to(new_state) {
            tracing::warn!(
                request_id = %id,
                block,
                %old_state,
                %new_state,
                "illegal request transition, ignoring"
            );
            return None;
        }
        tracked.state = new_state;
        tracing::debug!(request_id = %id, block, %old_state, %new_state, "request transition");

        let finish_time = tracked.finish_time();
        let view = tracked.view();
        match (old_state, new_state) {
            (_, RequestState::Started) => self.finish_queue.schedule(finish_time, *id),
            (RequestState::Started, _) => self.finish_queue.cancel(finish_time, id),
            _ => {}
        }
        Some(view)
    }

    /// Assigns `host` to a slot of the request, returning the updated view.
    pub fn fill_slot(
        &mut self,
        id: &RequestId,
        slot_index: u64,
        host: Address,
    ) -> Option<RequestView> {
        self.record(id);
        let Some(tracked) = self.requests.get_mut(id) else {
            tracing::debug!(request_id = %id, slot_index, "slot filled for unknown request, ignoring");
            return None;
        };
        if slot_index >= tracked.request.ask.slots {
            tracing::warn!(
                request_id = %id,
                slot_index,
                slots = tracked.request.ask.slots,
                "slot index out of range, ignoring"
            );
            return None;
        }

        if let Some(previous) = tracked.hosts.fill(slot_index, host) {
            tracing::warn!(
                request_id = %id,
                slot_index,
                %previous,
                %host,
                "slot filled while still assigned"
            );
        }
        Some(tracked.view())
    }

    /// Frees a slot of the request, returning the updated view and the host that left.
    pub fn free_slot(
        &mut self,
        id: &RequestId,
        slot_index: u64,
    ) -> Option<(RequestView, Option<Address>)> {
        self.record(id);
        let Some(tracked) = self.requests.get_mut(id) else {
            tracing::debug!(request_id = %id, slot_index, "slot freed for unknown request, ignoring");
            return None;
        };

        let previous = tracked.hosts.free(slot_index);
        if previous.is_none() {
            tracing::debug!(request_id = %id, slot_index, "freed slot was not filled");
        }
        Some((tracked.view(), previous))
    }

    /// Finishes every started request whose finish time is at or before `now`.
    pub fn finish_due(&mut self, now: DateTime<Utc>, block: BlockNumber) -> Vec<RequestView> {
        let due = self.finish_queue.pop_until(now);
        self.finish(due, block)
    }

    /// Finishes every started request whose finish time is strictly before `now`.
    pub fn finish_before(&mut self, now: DateTime<Utc>, block: BlockNumber) -> Vec<RequestView> {
        let due = self.finish_queue.pop_before(now);
        self.finish(due, block)
    }

    fn finish(&mut self, due: Vec<RequestId>, block: BlockNumber) -> Vec<RequestView> {
        let mut finished = Vec::new();
        for id in due {
            self.record(&id);
            let Some(tracked) = self.requests.get_mut(&id) else {
                continue;
            };
            // The queue only ever holds started requests
            debug_assert_eq!(tracked.state, RequestState::Started);
            tracked.state = RequestState::Finished;
            tracing::debug!(request_id = %id, block, "request finished");
            finished.push(tracked.view());
        }
        finished
    }

    pub fn find(&self, id: &RequestId) -> Option<&TrackedRequest> {
        self.requests.get(id)
    }

    pub fn is_filled(&self, id: &RequestId, slot_index: u64) -> bool {
        self.requests
            .get(id)
            .is_some_and(|tracked| tracked.hosts.is_filled(slot_index))
    }

    pub fn was_ever_filled(&self, id: &RequestId, slot_index: u64) -> bool {
        self.requests
            .get(id)
            .is_some_and(|tracked| tracked.hosts.was_ever_filled(slot_index))
    }

    pub fn current_hosts(&self, id: &RequestId) -> Option<&BTreeMap<u64, Address>> {
        self.requests.get(id).map(|tracked| tracked.hosts.current())
    }

    /// Iterates all requests in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedRequest> + Send + '_ {
        self.requests.values()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn pending_finishes(&self) -> usize {
        self.finish_queue.len()
    }
}
