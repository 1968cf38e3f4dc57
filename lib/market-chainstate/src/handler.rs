use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::{registry::RequestView, types::Address};

/// Result of a single notification; errors are reported but never stop the replay.
pub type HandlerResult = Result<(), anyhow::Error>;

/// Observer of the chain state, notified once per transition.
///
/// Every callback has a no-op default so implementors only override what they track.
pub trait ChainStateChangeHandler {
    fn on_new_request(&mut self, _request: &RequestView) -> HandlerResult {
        Ok(())
    }

    fn on_request_fulfilled(&mut self, _request: &RequestView) -> HandlerResult {
        Ok(())
    }

    fn on_request_cancelled(&mut self, _request: &RequestView) -> HandlerResult {
        Ok(())
    }

    fn on_request_failed(&mut self, _request: &RequestView) -> HandlerResult {
        Ok(())
    }

    fn on_request_finished(&mut self, _request: &RequestView) -> HandlerResult {
        Ok(())
    }

    fn on_slot_filled(
        &mut self,
        _request: &RequestView,
        _slot_index: u64,
        _host: &Address,
    ) -> HandlerResult {
        Ok(())
    }

    fn on_slot_freed(
        &mut self,
        _request: &RequestView,
        _slot_index: u64,
        _previous_host: Option<&Address>,
    ) -> HandlerResult {
        Ok(())
    }
}

/// Handler that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ChainStateChangeHandler for NoopHandler {}

/// A single state change, as produced by the replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainStateChange {
    NewRequest(RequestView),
    RequestFulfilled(RequestView),
    RequestCancelled(RequestView),
    RequestFailed(RequestView),
    RequestFinished(RequestView),
    SlotFilled {
        request: RequestView,
        slot_index: u64,
        host: Address,
    },
    SlotFreed {
        request: RequestView,
        slot_index: u64,
        previous_host: Option<Address>,
    },
}

impl ChainStateChange {
    pub fn request(&self) -> &RequestView {
        match self {
            ChainStateChange::NewRequest(request)
            | ChainStateChange::RequestFulfilled(request)
            | ChainStateChange::RequestCancelled(request)
            | ChainStateChange::RequestFailed(request)
            | ChainStateChange::RequestFinished(request)
            | ChainStateChange::SlotFilled { request, .. }
            | ChainStateChange::SlotFreed { request, .. } => request,
        }
    }

    /// Name of the matching callback, used when reporting failures.
    pub fn name(&self) -> &'static str {
        match self {
            ChainStateChange::NewRequest(_) => "on_new_request",
            ChainStateChange::RequestFulfilled(_) => "on_request_fulfilled",
            ChainStateChange::RequestCancelled(_) => "on_request_cancelled",
            ChainStateChange::RequestFailed(_) => "on_request_failed",
            ChainStateChange::RequestFinished(_) => "on_request_finished",
            ChainStateChange::SlotFilled { .. } => "on_slot_filled",
            ChainStateChange::SlotFreed { .. } => "on_slot_freed",
        }
    }

    /// Calls the callback of `handler` matching this change.
    pub fn dispatch<H>(&self, handler: &mut H) -> HandlerResult
    where
        H: ChainStateChangeHandler + ?Sized,
    {
        match self {
            ChainStateChange::NewRequest(request) => handler.on_new_request(request),
            ChainStateChange::RequestFulfilled(request) => handler.on_request_fulfilled(request),
            ChainStateChange::RequestCancelled(request) => handler.on_request_cancelled(request),
            ChainStateChange::RequestFailed(request) => handler.on_request_failed(request),
            ChainStateChange::RequestFinished(request) => handler.on_request_finished(request),
            ChainStateChange::SlotFilled {
                request,
                slot_index,
                host,
            } => handler.on_slot_filled(request, *slot_index, host),
            ChainStateChange::SlotFreed {
                request,
                slot_index,
                previous_host,
            } => handler.on_slot_freed(request, *slot_index, previous_host.as_ref()),
        }
    }
}

/// Boxed handler, as stored by [`ChangeHandlerMux`] and [`ChainState`](crate::ChainState).
pub type BoxedHandler = Box<dyn ChainStateChangeHandler + Send>;

/// Forwards every notification to all registered handlers, in registration order.
///
/// A handler returning an error, or panicking, does not prevent the remaining handlers from
/// being notified; the failure is logged and counted against that handler.
#[derive(Default)]
pub struct ChangeHandlerMux {
    handlers: Vec<BoxedHandler>,
    failures: Vec<u64>,
}

impl ChangeHandlerMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H>(&mut self, handler: H)
    where
        H: ChainStateChangeHandler + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
        self.failures.push(0);
    }

    pub fn with<H>(mut self, handler: H) -> Self
    where
        H: ChainStateChangeHandler + Send + 'static,
    {
        self.add(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Number of failed notifications, per handler, in registration order.
    pub fn failures(&self) -> &[u64] {
        &self.failures
    }

    fn fan_out(&mut self, change: &ChainStateChange) -> HandlerResult {
        for (index, handler) in self.handlers.iter_mut().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| change.dispatch(handler.as_mut())));
            let failed = match result {
                Ok(Ok(())) => false,
                Ok(Err(err)) => {
                    tracing::error!(
                        handler = index,
                        callback = change.name(),
                        request_id = %change.request().id(),
                        %err,
                        "change handler failed"
                    );
                    true
                }
                Err(_) => {
                    tracing::error!(
                        handler = index,
                        callback = change.name(),
                        request_id = %change.request().id(),
                        "change handler panicked"
                    );
                    true
                }
            };
            if failed {
                self.failures[index] += 1;
            }
        }
        // Failures were isolated above
        Ok(())
    }
}

impl ChainStateChangeHandler for ChangeHandlerMux {
    fn on_new_request(&mut self, request: &RequestView) -> HandlerResult {
        self.fan_out(&ChainStateChange::NewRequest(request.clone()))
    }

    fn on_request_fulfilled(&mut self, request: &RequestView) -> HandlerResult {
        self.fan_out(&ChainStateChange::RequestFulfilled(request.clone()))
    }

    fn on_request_cancelled(&mut self, request: &RequestView) -> HandlerResult {
        self.fan_out(&ChainStateChange::RequestCancelled(request.clone()))
    }

    fn on_request_failed(&mut self, request: &RequestView) -> HandlerResult {
        self.fan_out(&ChainStateChange::RequestFailed(request.clone()))
    }

    fn on_request_finished(&mut self, request: &RequestView) -> HandlerResult {
        self.fan_out(&ChainStateChange::RequestFinished(request.clone()))
    }

    fn on_slot_filled(
        &mut self,
        request: &RequestView,
        slot_index: u64,
        host: &Address,
    ) -> HandlerResult {
        self.fan_out(&ChainStateChange::SlotFilled {
            request: request.clone(),
            slot_index,
            host: *host,
        })
    }

    fn on_slot_freed(
        &mut self,
        request: &RequestView,
        slot_index: u64,
        previous_host: Option<&Address>,
    ) -> HandlerResult {
        self.fan_out(&ChainStateChange::SlotFreed {
            request: request.clone(),
            slot_index,
            previous_host: previous_host.copied(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        registry::RequestRegistry,
        test_utils::{address, at, request},
    };

    /// Records the callbacks it receives under a name.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ChainStateChangeHandler for Recorder {
        fn on_new_request(&mut self, request: &RequestView) -> HandlerResult {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:new:{}", self.name, request.id()));
            Ok(())
        }

        fn on_slot_filled(
            &mut self,
            _request: &RequestView,
            slot_index: u64,
            _host: &Address,
        ) -> HandlerResult {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:filled:{}", self.name, slot_index));
            Ok(())
        }
    }

    struct Failing;

    impl ChainStateChangeHandler for Failing {
        fn on_new_request(&mut self, _request: &RequestView) -> HandlerResult {
            anyhow::bail!("database is gone")
        }

        fn on_slot_filled(
            &mut self,
            _request: &RequestView,
            _slot_index: u64,
            _host: &Address,
        ) -> HandlerResult {
            panic!("unexpected slot")
        }
    }

    fn view() -> RequestView {
        let mut registry = RequestRegistry::new();
        registry.create(request(1, 2, 60), 1, at(10)).unwrap()
    }

    #[test]
    fn forwards_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mux = ChangeHandlerMux::new()
            .with(Recorder {
                name: "a",
                log: log.clone(),
            })
            .with(Recorder {
                name: "b",
                log: log.clone(),
            });

        let view = view();
        mux.on_new_request(&view).unwrap();
        mux.on_slot_filled(&view, 1, &address(3)).unwrap();

        let id = view.id().to_string();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                format!("a:new:{id}"),
                format!("b:new:{id}"),
                "a:filled:1".to_string(),
                "b:filled:1".to_string(),
            ]
        );
    }

    #[test]
    fn failing_handlers_do_not_stop_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mux = ChangeHandlerMux::new().with(Failing).with(Recorder {
            name: "after",
            log: log.clone(),
        });

        let view = view();
        assert!(mux.on_new_request(&view).is_ok());
        assert!(mux.on_slot_filled(&view, 0, &address(3)).is_ok());

        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(mux.failures(), &[2, 0]);
    }

    #[test]
    fn dispatch_calls_the_matching_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut recorder = Recorder {
            name: "r",
            log: log.clone(),
        };
        let change = ChainStateChange::SlotFilled {
            request: view(),
            slot_index: 1,
            host: address(9),
        };
        change.dispatch(&mut recorder).unwrap();
        // Callbacks without an override are no-ops
        ChainStateChange::RequestFinished(view())
            .dispatch(&mut recorder)
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["r:filled:1".to_string()]);
    }
}
