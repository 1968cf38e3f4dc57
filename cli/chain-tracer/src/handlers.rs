use std::sync::{Arc, Mutex, PoisonError};

use market_chainstate::{types::Address, ChainStateChangeHandler, HandlerResult, RequestView};
use serde::Serialize;

/// Logs every change at info level.
pub(crate) struct LoggingHandler;

impl ChainStateChangeHandler for LoggingHandler {
    fn on_new_request(&mut self, request: &RequestView) -> HandlerResult {
        tracing::info!(
            request_id = %request.id(),
            slots = request.request.ask.slots,
            finish = %request.finish_time(),
            "new storage request"
        );
        Ok(())
    }

    fn on_request_fulfilled(&mut self, request: &RequestView) -> HandlerResult {
        tracing::info!(request_id = %request.id(), "storage request started");
        Ok(())
    }

    fn on_request_cancelled(&mut self, request: &RequestView) -> HandlerResult {
        tracing::info!(request_id = %request.id(), "storage request cancelled");
        Ok(())
    }

    fn on_request_failed(&mut self, request: &RequestView) -> HandlerResult {
        tracing::warn!(request_id = %request.id(), "storage request failed");
        Ok(())
    }

    fn on_request_finished(&mut self, request: &RequestView) -> HandlerResult {
        tracing::info!(request_id = %request.id(), "storage request finished");
        Ok(())
    }

    fn on_slot_filled(
        &mut self,
        request: &RequestView,
        slot_index: u64,
        host: &Address,
    ) -> HandlerResult {
        tracing::info!(request_id = %request.id(), slot_index, %host, "slot filled");
        Ok(())
    }

    fn on_slot_freed(
        &mut self,
        request: &RequestView,
        slot_index: u64,
        previous_host: Option<&Address>,
    ) -> HandlerResult {
        tracing::info!(
            request_id = %request.id(),
            slot_index,
            previous_host = ?previous_host,
            "slot freed"
        );
        Ok(())
    }
}

/// Number of notifications received, per kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ChangeCount {
    pub new_requests: u64,
    pub fulfilled: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub finished: u64,
    pub slots_filled: u64,
    pub slots_freed: u64,
}

/// Counts notifications; clones share the same counts.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChangeCounter {
    count: Arc<Mutex<ChangeCount>>,
}

impl ChangeCounter {
    pub fn snapshot(&self) -> ChangeCount {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, field: fn(&mut ChangeCount) -> &mut u64) -> HandlerResult {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *field(&mut count) += 1;
        Ok(())
    }
}

impl ChainStateChangeHandler for ChangeCounter {
    fn on_new_request(&mut self, _request: &RequestView) -> HandlerResult {
        self.bump(|count| &mut count.new_requests)
    }

    fn on_request_fulfilled(&mut self, _request: &RequestView) -> HandlerResult {
        self.bump(|count| &mut count.fulfilled)
    }

    fn on_request_cancelled(&mut self, _request: &RequestView) -> HandlerResult {
        self.bump(|count| &mut count.cancelled)
    }

    fn on_request_failed(&mut self, _request: &RequestView) -> HandlerResult {
        self.bump(|count| &mut count.failed)
    }

    fn on_request_finished(&mut self, _request: &RequestView) -> HandlerResult {
        self.bump(|count| &mut count.finished)
    }

    fn on_slot_filled(
        &mut self,
        _request: &RequestView,
        _slot_index: u64,
        _host: &Address,
    ) -> HandlerResult {
        self.bump(|count| &mut count.slots_filled)
    }

    fn on_slot_freed(
        &mut self,
        _request: &RequestView,
        _slot_index: u64,
        _previous_host: Option<&Address>,
    ) -> HandlerResult {
        self.bump(|count| &mut count.slots_freed)
    }
}
