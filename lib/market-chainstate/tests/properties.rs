use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeDelta, Utc};
use market_chainstate::{
    events::{
        RequestCancelled, RequestFailed, RequestFulfilled, SlotFilled, SlotFreed,
        StorageRequested,
    },
    recorded::{ChainRecording, RecordedBlock, RecordedChain},
    types::{Address, Ask, BlockNumber, RequestId, RequestState, StorageRequest},
    ChainEvent, ChainState, ChainStateChangeHandler, HandlerResult, RequestView,
};
use proptest::prelude::*;
use tokio::runtime::Runtime;

const REQUESTS: u8 = 4;
const LAST_BLOCK: BlockNumber = 30;

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(seconds, 0).unwrap()
}

fn block_time(number: BlockNumber) -> DateTime<Utc> {
    at(1_000 + 10 * number as i64)
}

fn end() -> DateTime<Utc> {
    block_time(LAST_BLOCK) + TimeDelta::seconds(200)
}

fn request_id(n: u8) -> RequestId {
    RequestId([n + 1; 32])
}

fn request(n: u8, duration: u64) -> StorageRequest {
    StorageRequest {
        id: request_id(n),
        client: Address([0xcc; 20]),
        ask: Ask {
            slots: 2,
            slot_size: 1 << 20,
            duration,
            proof_probability: 3,
            price_per_byte_per_second: 1,
            collateral_per_byte: 1,
            max_slot_loss: 1,
        },
        content_cid: "zDvZRwzmAkhzDRPH5EW242gJBNZ2T7aoH2v1fVH66FxXL4kSbvyM".to_string(),
        expiry: at(100_000),
    }
}

/// An event about an existing or unknown request, `kind` picks the event type.
#[derive(Clone, Debug)]
struct Mutation {
    block: BlockNumber,
    kind: u8,
    request: u8,
    slot_index: u64,
}

impl Mutation {
    fn into_event(self) -> ChainEvent {
        let request_id = request_id(self.request);
        let block = self.block;
        match self.kind {
            0 => ChainEvent::RequestFulfilled(RequestFulfilled { block, request_id }),
            1 => ChainEvent::RequestCancelled(RequestCancelled { block, request_id }),
            2 => ChainEvent::RequestFailed(RequestFailed { block, request_id }),
            3 => ChainEvent::SlotFilled(SlotFilled {
                block,
                request_id,
                slot_index: self.slot_index,
                host: Address([self.block as u8; 20]),
            }),
            _ => ChainEvent::SlotFreed(SlotFreed {
                block,
                request_id,
                slot_index: self.slot_index,
            }),
        }
    }
}

fn mutation() -> impl Strategy<Value = Mutation> {
    (1..=LAST_BLOCK, 0u8..5, 0..REQUESTS + 1, 0u64..3).prop_map(
        |(block, kind, request, slot_index)| Mutation {
            block,
            kind,
            request,
            slot_index,
        },
    )
}

/// Creation block and duration of each request; `None` never creates it.
fn creations() -> impl Strategy<Value = Vec<Option<(BlockNumber, u64)>>> {
    prop::collection::vec(prop::option::of((1..=LAST_BLOCK, 10u64..250)), REQUESTS as usize)
}

fn recording(creations: &[Option<(BlockNumber, u64)>], mutations: &[Mutation]) -> ChainRecording {
    // Creations go last, the timeline has to move them ahead within their block
    let events = mutations
        .iter()
        .cloned()
        .map(Mutation::into_event)
        .chain(creations.iter().enumerate().filter_map(|(n, creation)| {
            let (block, duration) = (*creation)?;
            Some(ChainEvent::StorageRequested(StorageRequested {
                block,
                request: request(n as u8, duration),
            }))
        }))
        .collect();

    ChainRecording {
        period_seconds: 100,
        blocks: (1..=LAST_BLOCK)
            .map(|number| RecordedBlock {
                number,
                timestamp: block_time(number),
            })
            .collect(),
        events,
        proofs: Vec::new(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Notice {
    New,
    Fulfilled,
    Cancelled,
    Failed,
    Finished,
    SlotFilled,
    SlotFreed,
}

/// Every notification, with the request state it carried.
#[derive(Clone, Default)]
struct Observed {
    notices: Arc<Mutex<Vec<(RequestId, Notice, RequestState)>>>,
}

impl Observed {
    fn push(&self, request: &RequestView, notice: Notice) -> HandlerResult {
        self.notices
            .lock()
            .unwrap()
            .push((*request.id(), notice, request.state));
        Ok(())
    }

    fn notices(&self) -> Vec<(RequestId, Notice, RequestState)> {
        self.notices.lock().unwrap().clone()
    }
}

impl ChainStateChangeHandler for Observed {
    fn on_new_request(&mut self, request: &RequestView) -> HandlerResult {
        self.push(request, Notice::New)
    }

    fn on_request_fulfilled(&mut self, request: &RequestView) -> HandlerResult {
        self.push(request, Notice::Fulfilled)
    }

    fn on_request_cancelled(&mut self, request: &RequestView) -> HandlerResult {
        self.push(request, Notice::Cancelled)
    }

    fn on_request_failed(&mut self, request: &RequestView) -> HandlerResult {
        self.push(request, Notice::Failed)
    }

    fn on_request_finished(&mut self, request: &RequestView) -> HandlerResult {
        self.push(request, Notice::Finished)
    }

    fn on_slot_filled(
        &mut self,
        request: &RequestView,
        _slot_index: u64,
        _host: &Address,
    ) -> HandlerResult {
        self.push(request, Notice::SlotFilled)
    }

    fn on_slot_freed(
        &mut self,
        request: &RequestView,
        _slot_index: u64,
        _previous_host: Option<&Address>,
    ) -> HandlerResult {
        self.push(request, Notice::SlotFreed)
    }
}

/// Replays `chain` up to [`end`], moving forward by `steps` seconds at a time.
async fn replay(
    chain: &Arc<RecordedChain>,
    steps: &[i64],
) -> (Vec<RequestView>, Vec<(RequestId, Notice, RequestState)>) {
    let observed = Observed::default();
    let mut state = ChainState::new(chain.clone(), observed.clone(), chain.start());
    for step in steps {
        let target = (state.high_water_mark() + TimeDelta::seconds(*step)).min(end());
        state.update(target).await.unwrap();
    }
    state.update(end()).await.unwrap();
    (state.requests(), observed.notices())
}

const LEGAL_PATHS: [&[RequestState]; 4] = [
    &[RequestState::New, RequestState::Started, RequestState::Finished],
    &[RequestState::New, RequestState::Started, RequestState::Failed],
    &[RequestState::New, RequestState::Cancelled],
    &[RequestState::New, RequestState::Failed],
];

fn check_notices(notices: &[(RequestId, Notice, RequestState)]) -> Result<(), TestCaseError> {
    let mut paths: HashMap<RequestId, Vec<RequestState>> = HashMap::new();
    for (id, notice, state) in notices {
        if *notice == Notice::New {
            prop_assert!(!paths.contains_key(id), "request {} created twice", id);
            prop_assert_eq!(*state, RequestState::New);
            paths.insert(*id, vec![RequestState::New]);
            continue;
        }

        let Some(path) = paths.get_mut(id) else {
            return Err(TestCaseError::fail(format!(
                "{notice:?} for {id} before its creation"
            )));
        };
        match notice {
            Notice::SlotFilled | Notice::SlotFreed => {
                prop_assert_eq!(Some(state), path.last());
            }
            _ => path.push(*state),
        }
    }

    for (id, path) in paths {
        prop_assert!(
            LEGAL_PATHS
                .iter()
                .any(|legal| legal.starts_with(&path)),
            "illegal path {:?} for {}",
            path,
            id
        );
    }
    Ok(())
}

proptest! {
    #[test]
    fn replay_notifies_in_a_legal_order(
        creations in creations(),
        mutations in prop::collection::vec(mutation(), 0..60),
        steps in prop::collection::vec(1i64..120, 0..12),
    ) {
        let chain = Arc::new(RecordedChain::try_from(recording(&creations, &mutations)).unwrap());
        let rt = Runtime::new().unwrap();

        let (single_requests, single_notices) = rt.block_on(replay(&chain, &[]));
        check_notices(&single_notices)?;

        let (stepped_requests, stepped_notices) = rt.block_on(replay(&chain, &steps));
        check_notices(&stepped_notices)?;

        prop_assert_eq!(single_requests, stepped_requests);
        prop_assert_eq!(single_notices, stepped_notices);
    }
}
