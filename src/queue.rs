//! Calls made before the client exists
//!
//! Applications often start recording before the channel has been
//! configured. A [`PreInitQueue`] holds those calls, in order, and replays
//! them exactly once against the client handed to
//! [`PreInitQueue::initialize`]. Afterwards calls go straight to the client.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::client::TelemetryClient;
use crate::diagnostics::MessageId;
use crate::error::{Error, Result};

/// Default number of calls held before initialization
pub const DEFAULT_PRE_INIT_CAPACITY: usize = 100;

pub type DeferredCall = Box<dyn FnOnce(&TelemetryClient) + Send>;

#[derive(Default)]
struct QueueState {
    client: Option<Arc<TelemetryClient>>,
    calls: VecDeque<DeferredCall>,
    draining: bool,
    rejected: usize,
}

pub struct PreInitQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl Default for PreInitQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PRE_INIT_CAPACITY)
    }
}

impl PreInitQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `call` against the client, or hold it until there is one
    pub fn call(&self, call: impl FnOnce(&TelemetryClient) + Send + 'static) -> Result<()> {
        let mut state = self.state();

        if let (Some(client), false) = (&state.client, state.draining) {
            let client = client.clone();
            drop(state);
            call(&client);
            return Ok(());
        }

        if state.calls.len() >= self.capacity {
            state.rejected += 1;
            tracing::warn!(capacity = self.capacity, "pre-init queue full, dropping call");
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }
        state.calls.push_back(Box::new(call));
        Ok(())
    }

    /// Hand over the client and replay held calls in order
    pub fn initialize(&self, client: Arc<TelemetryClient>) -> Result<()> {
        let rejected = {
            let mut state = self.state();
            if state.client.is_some() {
                return Err(Error::AlreadyInitialized);
            }
            state.client = Some(client.clone());
            state.draining = true;
            std::mem::take(&mut state.rejected)
        };

        if rejected > 0 {
            client.pipeline().logger.warn(
                MessageId::PreInitQueueFull,
                format!("{rejected} calls made before initialization were dropped"),
            );
        }

        // Calls arriving while draining are appended and replayed here too
        loop {
            let next = {
                let mut state = self.state();
                let next = state.calls.pop_front();
                if next.is_none() {
                    state.draining = false;
                }
                next
            };
            let Some(call) = next else {
                break;
            };
            call(&client);
        }

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state().client.is_some()
    }

    /// Calls waiting for initialization
    pub fn len(&self) -> usize {
        self.state().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn client(&self) -> Option<Arc<TelemetryClient>> {
        self.state().client.clone()
    }

    /// Client or [`Error::NotInitialized`]
    pub fn require_client(&self) -> Result<Arc<TelemetryClient>> {
        self.client().ok_or(Error::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::envelope::TelemetryItem;
    use crate::transport::{Transport, TransportKind, TransportRequest, TransportResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sink;

    #[async_trait]
    impl Transport for Sink {
        fn kind(&self) -> TransportKind {
            TransportKind::Xhr
        }

        async fn send(&self, _request: TransportRequest) -> Result<TransportResponse> {
            Ok(TransportResponse::Completed {
                status: 200,
                body: None,
                retry_after: None,
            })
        }
    }

    fn client() -> Arc<TelemetryClient> {
        Arc::new(
            TelemetryClient::builder()
                .config(ChannelConfig::default())
                .transports(vec![Arc::new(Sink) as Arc<dyn Transport>])
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn calls_replay_in_order_once() {
        let queue = PreInitQueue::new(10);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            queue
                .call(move |client| {
                    order.lock().unwrap().push(i);
                    client.track(TelemetryItem::event(format!("e{i}")));
                })
                .unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert!(queue.require_client().is_err());

        let client = client();
        queue.initialize(client.clone()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(client.buffer_len(), 3);
        assert!(queue.is_empty());

        // Direct delegation afterwards
        let direct = Arc::new(AtomicUsize::new(0));
        let counter = direct.clone();
        queue
            .call(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(direct.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn second_initialization_is_rejected() {
        let queue = PreInitQueue::default();
        queue.initialize(client()).unwrap();
        assert!(matches!(
            queue.initialize(client()),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn full_queue_rejects_and_reports() {
        let queue = PreInitQueue::new(1);
        queue.call(|_| {}).unwrap();
        assert!(matches!(
            queue.call(|_| {}),
            Err(Error::QueueFull { capacity: 1 })
        ));

        let client = client();
        queue.initialize(client.clone()).unwrap();
        assert!(client.pipeline().logger.has_message(MessageId::PreInitQueueFull));
    }
}
