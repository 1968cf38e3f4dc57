use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    events::ChainEvent,
    fetcher::{ChainEventFetcher, FetchError},
    handler::{BoxedHandler, ChainStateChange, ChainStateChangeHandler},
    period::{OracleError, PeriodCursor, PeriodMonitor, PeriodReport},
    registry::{RegistryError, RequestRegistry, RequestView},
    timeline::{ChainEventTimeline, TimelineError},
    types::{BlockInterval, BlockNumber, RangeError, RequestId, RequestState, TimeRange},
};

#[derive(Debug, thiserror::Error)]
pub enum ChainStateError {
    #[error("update to {requested} is before the high-water mark {high_water_mark}")]
    NonAdvancingUpdate {
        requested: DateTime<Utc>,
        high_water_mark: DateTime<Utc>,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Oracle(#[from] OracleError),
}

impl ChainStateError {
    /// I/O failures can be retried, everything else is a bug in the caller or the fetcher.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ChainStateError::Fetch(FetchError::Decode(_)) => false,
            ChainStateError::Fetch(_) | ChainStateError::Oracle(_) => true,
            _ => false,
        }
    }
}

/// What a single [`ChainState::update`] replayed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub range: TimeRange,
    pub blocks: Option<BlockInterval>,
    pub events: usize,
    pub changes: usize,
    pub reports: usize,
}

/// Storage marketplace state, rebuilt by replaying chain events.
///
/// The state covers everything from its start time up to the high-water mark and is
/// extended by calling [`ChainState::update`] with increasing target times. Every update
/// either applies completely (registry, high-water mark, period reports and notifications)
/// or not at all, so a failed update can be retried with the same target.
pub struct ChainState<F> {
    fetcher: F,
    handler: BoxedHandler,
    registry: RequestRegistry,
    high_water_mark: DateTime<Utc>,
    latest_block: Option<BlockNumber>,
    period_monitor: Option<PeriodMonitor>,
}

impl<F> ChainState<F>
where
    F: ChainEventFetcher,
{
    /// Creates an empty state that starts observing right after `start`.
    pub fn new<H>(fetcher: F, handler: H, start: DateTime<Utc>) -> Self
    where
        H: ChainStateChangeHandler + Send + 'static,
    {
        Self {
            fetcher,
            handler: Box::new(handler),
            registry: RequestRegistry::new(),
            high_water_mark: start,
            latest_block: None,
            period_monitor: None,
        }
    }

    /// Creates a state covering the fixed historical `range`.
    pub async fn with_history<H>(
        fetcher: F,
        handler: H,
        range: TimeRange,
    ) -> Result<Self, ChainStateError>
    where
        H: ChainStateChangeHandler + Send + 'static,
    {
        let mut state = Self::new(fetcher, handler, range.from());
        state.update(range.to()).await?;
        Ok(state)
    }

    /// Attaches a period monitor, observed once per replayed block.
    pub fn with_period_monitor(mut self, monitor: PeriodMonitor) -> Self {
        self.period_monitor = Some(monitor);
        self
    }

    /// Latest moment up to which every event has been replayed.
    pub fn high_water_mark(&self) -> DateTime<Utc> {
        self.high_water_mark
    }

    /// Last block replayed, if any.
    pub fn latest_block(&self) -> Option<BlockNumber> {
        self.latest_block
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn period_monitor(&self) -> Option<&PeriodMonitor> {
        self.period_monitor.as_ref()
    }

    pub fn find(&self, id: &RequestId) -> Option<RequestView> {
        self.registry.find(id).map(|tracked| tracked.view())
    }

    /// Snapshot of every tracked request, in creation order.
    pub fn requests(&self) -> Vec<RequestView> {
        self.registry.iter().map(|tracked| tracked.view()).collect()
    }

    pub fn requests_in_state(&self, state: RequestState) -> Vec<RequestView> {
        self.registry
            .iter()
            .filter(|tracked| tracked.state == state)
            .map(|tracked| tracked.view())
            .collect()
    }

    /// Replays every event between the high-water mark and `to_utc`.
    #[tracing::instrument(skip(self), fields(from = %self.high_water_mark))]
    pub async fn update(&mut self, to_utc: DateTime<Utc>) -> Result<UpdateSummary, ChainStateError> {
        if to_utc < self.high_water_mark {
            return Err(ChainStateError::NonAdvancingUpdate {
                requested: to_utc,
                high_water_mark: self.high_water_mark,
            });
        }
        let range = TimeRange::new(self.high_water_mark, to_utc)?;

        let events = self.fetcher.fetch_events(range).await?;
        let timeline = ChainEventTimeline::build(events, Some(self.high_water_mark))?;

        let latest_block = timeline.last_block().or(self.latest_block);

        // An update future dropped mid-replay leaves its changes behind
        self.registry.rollback();
        self.registry.begin();
        let mut replay = Replay {
            registry: &mut self.registry,
            cursor: self.period_monitor.as_ref().and_then(PeriodMonitor::cursor),
            changes: Vec::new(),
            reports: Vec::new(),
        };
        let replayed = replay
            .run(self.period_monitor.as_ref(), &timeline, to_utc, latest_block)
            .await;
        let Replay {
            cursor,
            changes,
            reports,
            ..
        } = replay;
        if let Err(err) = replayed {
            self.registry.rollback();
            return Err(err);
        }

        // Nothing below can fail, commit the replay
        self.registry.commit();

        let summary = UpdateSummary {
            range,
            blocks: timeline.span().map(|span| span.blocks),
            events: timeline.event_count(),
            changes: changes.len(),
            reports: reports.len(),
        };

        self.high_water_mark = to_utc;
        self.latest_block = latest_block;
        if let Some(monitor) = &mut self.period_monitor {
            monitor.commit(cursor, reports).await;
        }
        for change in &changes {
            self.notify(change);
        }

        tracing::debug!(
            blocks = ?summary.blocks,
            events = summary.events,
            changes = summary.changes,
            reports = summary.reports,
            "chain state updated"
        );
        Ok(summary)
    }

    fn notify(&mut self, change: &ChainStateChange) {
        if let Err(err) = change.dispatch(self.handler.as_mut()) {
            tracing::error!(
                callback = change.name(),
                request_id = %change.request().id(),
                %err,
                "change handler failed"
            );
        }
    }
}

/// Staged result of an update, committed only once the whole update succeeded.
///
/// Registry changes are made in place and rolled back by the caller on error.
struct Replay<'a> {
    registry: &'a mut RequestRegistry,
    cursor: Option<PeriodCursor>,
    changes: Vec<ChainStateChange>,
    reports: Vec<PeriodReport>,
}

impl Replay<'_> {
    async fn run(
        &mut self,
        monitor: Option<&PeriodMonitor>,
        timeline: &ChainEventTimeline,
        to_utc: DateTime<Utc>,
        latest_block: Option<BlockNumber>,
    ) -> Result<(), ChainStateError> {
        for block in timeline.blocks() {
            // The monitor sees the state as of the end of the previous block
            if let Some(monitor) = monitor {
                let reports = monitor
                    .step(
                        &mut self.cursor,
                        block.number,
                        block.timestamp,
                        self.registry.iter(),
                    )
                    .await?;
                self.reports.extend(reports);
            }

            // Finished between the previous block and this one
            self.finish_before(block.timestamp, block.number);
            for event in block.events {
                self.apply(event, block.number, block.timestamp)?;
            }
            self.finish_due(block.timestamp, block.number);
        }

        if let Some(block) = latest_block {
            // Requests finishing between the last block and the target time
            self.finish_due(to_utc, block);
        }
        Ok(())
    }

    fn apply(
        &mut self,
        event: &ChainEvent,
        block: BlockNumber,
        timestamp: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        match event {
            ChainEvent::StorageRequested(e) => {
                let view = self.registry.create(e.request.clone(), block, timestamp)?;
                self.changes.push(ChainStateChange::NewRequest(view));
            }
            ChainEvent::RequestFulfilled(e) => self.transition(
                &e.request_id,
                RequestState::Started,
                block,
                ChainStateChange::RequestFulfilled,
            ),
            ChainEvent::RequestCancelled(e) => self.transition(
                &e.request_id,
                RequestState::Cancelled,
                block,
                ChainStateChange::RequestCancelled,
            ),
            ChainEvent::RequestFailed(e) => self.transition(
                &e.request_id,
                RequestState::Failed,
                block,
                ChainStateChange::RequestFailed,
            ),
            ChainEvent::SlotFilled(e) => {
                if let Some(request) = self.registry.fill_slot(&e.request_id, e.slot_index, e.host)
                {
                    self.changes.push(ChainStateChange::SlotFilled {
                        request,
                        slot_index: e.slot_index,
                        host: e.host,
                    });
                }
            }
            ChainEvent::SlotFreed(e) => {
                if let Some((request, previous_host)) =
                    self.registry.free_slot(&e.request_id, e.slot_index)
                {
                    self.changes.push(ChainStateChange::SlotFreed {
                        request,
                        slot_index: e.slot_index,
                        previous_host,
                    });
                }
            }
        }
        Ok(())
    }

    fn transition(
        &mut self,
        id: &RequestId,
        state: RequestState,
        block: BlockNumber,
        change: fn(RequestView) -> ChainStateChange,
    ) {
        if let Some(view) = self.registry.transition(id, state, block) {
            self.changes.push(change(view));
        }
    }

    fn finish_due(&mut self, now: DateTime<Utc>, block: BlockNumber) {
        let finished = self.registry.finish_due(now, block);
        self.changes
            .extend(finished.into_iter().map(ChainStateChange::RequestFinished));
    }

    fn finish_before(&mut self, now: DateTime<Utc>, block: BlockNumber) {
        let finished = self.registry.finish_before(now, block);
        self.changes
            .extend(finished.into_iter().map(ChainStateChange::RequestFinished));
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        events::{
            BlockSpan, ChainEvents, RequestCancelled, RequestFailed, RequestFulfilled, SlotFilled,
            StorageRequested,
        },
        handler::{HandlerResult, NoopHandler},
        test_utils::{address, at, request, request_id},
    };

    /// Fetcher serving a fixed list of `(block, timestamp)` pairs and their events.
    struct StaticFetcher {
        blocks: Vec<(BlockNumber, i64)>,
        events: Vec<ChainEvent>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ChainEventFetcher for StaticFetcher {
        async fn fetch_events(&self, range: TimeRange) -> Result<ChainEvents, FetchError> {
            if self.fail {
                return Err(FetchError::Unavailable("node is syncing".to_string()));
            }
            let inside = self
                .blocks
                .iter()
                .filter(|(_, seconds)| at(*seconds) > range.from() && at(*seconds) <= range.to())
                .collect::<Vec<_>>();
            let (Some(first), Some(last)) = (inside.first(), inside.last()) else {
                return Ok(ChainEvents::empty(range));
            };
            let span = BlockSpan {
                blocks: BlockInterval::new(first.0, last.0).unwrap(),
                times: TimeRange::new(at(first.1), at(last.1)).unwrap(),
            };
            let events = self
                .events
                .iter()
                .filter(|event| span.blocks.contains(event.block()))
                .cloned();
            Ok(ChainEvents::from_events(range, Some(span), events))
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn push(&self, entry: String) -> HandlerResult {
            self.log.lock().unwrap().push(entry);
            Ok(())
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl ChainStateChangeHandler for Recorder {
        fn on_new_request(&mut self, request: &RequestView) -> HandlerResult {
            self.push(format!("new {}", request.id().0[0]))
        }

        fn on_request_fulfilled(&mut self, request: &RequestView) -> HandlerResult {
            self.push(format!("fulfilled {}", request.id().0[0]))
        }

        fn on_request_cancelled(&mut self, request: &RequestView) -> HandlerResult {
            self.push(format!("cancelled {}", request.id().0[0]))
        }

        fn on_request_finished(&mut self, request: &RequestView) -> HandlerResult {
            self.push(format!("finished {}", request.id().0[0]))
        }

        fn on_slot_filled(
            &mut self,
            request: &RequestView,
            slot_index: u64,
            _host: &crate::types::Address,
        ) -> HandlerResult {
            self.push(format!("filled {} {}", request.id().0[0], slot_index))
        }
    }

    fn scenario_fetcher() -> StaticFetcher {
        StaticFetcher {
            blocks: vec![(100, 1000), (101, 1010), (102, 5000)],
            events: vec![
                ChainEvent::StorageRequested(StorageRequested {
                    block: 100,
                    request: request(1, 2, 3600),
                }),
                ChainEvent::SlotFilled(SlotFilled {
                    block: 101,
                    request_id: request_id(1),
                    slot_index: 0,
                    host: address(0xa),
                }),
                ChainEvent::RequestFulfilled(RequestFulfilled {
                    block: 101,
                    request_id: request_id(1),
                }),
            ],
            fail: false,
        }
    }

    #[tokio::test]
    async fn request_starts_and_finishes() {
        let recorder = Recorder::default();
        let mut state = ChainState::new(scenario_fetcher(), recorder.clone(), at(990));

        state.update(at(1000 + 3601)).await.unwrap();

        let view = state.find(&request_id(1)).unwrap();
        assert_eq!(view.state, RequestState::Finished);
        assert!(view.hosts.is_filled(0));
        assert!(!view.hosts.is_filled(1));
        assert_eq!(
            recorder.entries(),
            vec!["new 1", "fulfilled 1", "filled 1 0", "finished 1"]
        );
        assert_eq!(state.high_water_mark(), at(4601));
        assert_eq!(state.latest_block(), Some(101));
    }

    #[tokio::test]
    async fn incremental_updates_match_a_single_update() {
        let mut single = ChainState::new(scenario_fetcher(), NoopHandler, at(990));
        single.update(at(6000)).await.unwrap();

        let mut stepped = ChainState::new(scenario_fetcher(), NoopHandler, at(990));
        for target in [1000, 1005, 1010, 3000, 4600, 6000] {
            stepped.update(at(target)).await.unwrap();
        }

        assert_eq!(single.requests(), stepped.requests());
        assert_eq!(single.latest_block(), Some(102));
    }

    #[tokio::test]
    async fn requests_due_before_a_block_finish_before_its_events() {
        // Finishes at 4600, block 102 fails it at 5000
        let mut fetcher = scenario_fetcher();
        fetcher.events.push(ChainEvent::RequestFailed(RequestFailed {
            block: 102,
            request_id: request_id(1),
        }));

        let mut single = ChainState::new(fetcher, NoopHandler, at(990));
        single.update(at(6000)).await.unwrap();
        assert_eq!(
            single.find(&request_id(1)).unwrap().state,
            RequestState::Finished
        );

        let mut fetcher = scenario_fetcher();
        fetcher.events.push(ChainEvent::RequestFailed(RequestFailed {
            block: 102,
            request_id: request_id(1),
        }));
        let mut stepped = ChainState::new(fetcher, NoopHandler, at(990));
        stepped.update(at(4700)).await.unwrap();
        stepped.update(at(6000)).await.unwrap();
        assert_eq!(single.requests(), stepped.requests());
    }

    #[tokio::test]
    async fn non_advancing_update_is_rejected() {
        let mut state = ChainState::new(scenario_fetcher(), NoopHandler, at(990));
        state.update(at(1010)).await.unwrap();
        let before = state.requests();

        let err = state.update(at(1005)).await.unwrap_err();
        assert!(matches!(
            err,
            ChainStateError::NonAdvancingUpdate { requested, high_water_mark }
                if requested == at(1005) && high_water_mark == at(1010)
        ));
        assert!(!err.is_recoverable());
        assert_eq!(state.high_water_mark(), at(1010));
        assert_eq!(state.requests(), before);
    }

    #[test]
    fn only_decode_failures_are_unrecoverable() {
        let decode = ChainStateError::Fetch(FetchError::Decode("unknown event topic".to_string()));
        assert!(!decode.is_recoverable());
        let unavailable = ChainStateError::Fetch(FetchError::Unavailable("timeout".to_string()));
        assert!(unavailable.is_recoverable());
        let oracle = ChainStateError::Oracle(OracleError::Unavailable("timeout".to_string()));
        assert!(oracle.is_recoverable());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_the_state_untouched() {
        let mut fetcher = scenario_fetcher();
        fetcher.fail = true;
        let mut state = ChainState::new(fetcher, NoopHandler, at(990));

        let err = state.update(at(2000)).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(state.high_water_mark(), at(990));
        assert!(state.registry().is_empty());
    }

    #[tokio::test]
    async fn duplicate_creation_discards_the_whole_update() {
        let mut fetcher = scenario_fetcher();
        fetcher.events.push(ChainEvent::StorageRequested(StorageRequested {
            block: 101,
            request: request(1, 2, 3600),
        }));
        let recorder = Recorder::default();
        let mut state = ChainState::new(fetcher, recorder.clone(), at(990));

        let err = state.update(at(2000)).await.unwrap_err();
        assert!(matches!(
            err,
            ChainStateError::Registry(RegistryError::DuplicateRequest(id)) if id == request_id(1)
        ));
        assert!(state.registry().is_empty());
        assert_eq!(state.high_water_mark(), at(990));
        assert!(recorder.entries().is_empty());
    }

    #[tokio::test]
    async fn events_for_unobserved_requests_are_skipped() {
        let fetcher = StaticFetcher {
            blocks: vec![(10, 100), (11, 110)],
            events: vec![
                ChainEvent::RequestCancelled(RequestCancelled {
                    block: 10,
                    request_id: request_id(4),
                }),
                ChainEvent::StorageRequested(StorageRequested {
                    block: 11,
                    request: request(5, 1, 60),
                }),
            ],
            fail: false,
        };
        let recorder = Recorder::default();
        let mut state = ChainState::new(fetcher, recorder.clone(), at(0));

        let summary = state.update(at(120)).await.unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.changes, 1);
        assert_eq!(recorder.entries(), vec!["new 5"]);
    }

    #[tokio::test]
    async fn with_history_covers_the_range() {
        let state = ChainState::with_history(
            scenario_fetcher(),
            NoopHandler,
            TimeRange::new(at(990), at(1010)).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(state.high_water_mark(), at(1010));
        assert_eq!(state.requests_in_state(RequestState::Started).len(), 1);
        assert!(state.requests_in_state(RequestState::Finished).is_empty());
    }
}
