use crate::coordinator::{
    CommandApi, CommandOutcome, MutationCoordinator, PendingCommand, SuggestionAction,
};
use crate::engine::{ConnectionState, FetchDisposition, ReadModel, ReconciliationEngine};
use crate::error::{MutationError, SubscriptionError};
use crate::fetch::{fetch_region, FetchCompletion, Region, RequestSequencer, SnapshotFetcher};
use crate::subscription::{subscribe_dashboard_handlers, PushDelivery, PushRouter, Subscription};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const HOST_QUEUE_CAPACITY: usize = 256;

/// Everything that completes off the host task and must be merged on it.
#[derive(Debug)]
pub enum HostEvent {
    Fetched(FetchCompletion),
    Push(PushDelivery),
    PushConnected,
    PushDisconnected(Option<SubscriptionError>),
    CommandFinished(CommandOutcome),
}

/// What a single [`DashboardSession::handle`] call did.
#[derive(Debug, Default)]
pub struct SessionUpdate {
    pub view_changed: bool,
    pub fetch: Option<FetchDisposition>,
    pub command: Option<Result<PendingCommand, MutationError>>,
}

/// Host-side merge point: owns the engine, the coordinator's in-flight state,
/// and the push subscriptions, and spawns fetches and commands as tasks.
pub struct DashboardSession<B> {
    backend: Arc<B>,
    engine: ReconciliationEngine,
    coordinator: MutationCoordinator,
    router: PushRouter,
    subscriptions: Vec<Subscription>,
    sequencer: RequestSequencer,
    host_tx: mpsc::Sender<HostEvent>,
    host_rx: mpsc::Receiver<HostEvent>,
    refresh_tx: mpsc::UnboundedSender<Region>,
    refresh_rx: mpsc::UnboundedReceiver<Region>,
    poll_interval: Duration,
}

impl<B> DashboardSession<B>
where
    B: SnapshotFetcher + CommandApi,
{
    pub fn new(backend: Arc<B>, poll_interval: Duration) -> Self {
        let (host_tx, host_rx) = mpsc::channel(HOST_QUEUE_CAPACITY);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            engine: ReconciliationEngine::new(),
            coordinator: MutationCoordinator::new(refresh_tx.clone()),
            router: PushRouter::new(),
            subscriptions: Vec::new(),
            sequencer: RequestSequencer::default(),
            host_tx,
            host_rx,
            refresh_tx,
            refresh_rx,
            poll_interval,
        }
    }

    pub fn view(&self) -> &ReadModel {
        self.engine.current_view()
    }

    /// Sender handed to the push transport.
    pub fn host_sender(&self) -> mpsc::Sender<HostEvent> {
        self.host_tx.clone()
    }

    pub fn is_attached(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    pub fn push_handler_count(&self) -> usize {
        self.router.handler_count()
    }

    pub fn attach(&mut self) {
        if self.is_attached() {
            return;
        }
        self.subscriptions = subscribe_dashboard_handlers(&self.router, self.refresh_tx.clone());
        info!(event = "session_attached", handlers = self.subscriptions.len());
    }

    pub fn detach(&mut self) {
        if !self.is_attached() {
            return;
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        info!(event = "session_detached");
    }

    pub fn refresh(&mut self, region: Region) {
        let ticket = self.sequencer.issue(region);
        let backend = Arc::clone(&self.backend);
        let tx = self.host_tx.clone();
        debug!(event = "fetch_start", region = %region, seq = ticket.seq);
        tokio::spawn(async move {
            let result = fetch_region(backend.as_ref(), region).await;
            let _ = tx
                .send(HostEvent::Fetched(FetchCompletion { ticket, result }))
                .await;
        });
    }

    pub fn refresh_all(&mut self) {
        for region in Region::ALL {
            self.refresh(region);
        }
    }

    /// Validates and submits a suggestion command in the background. The
    /// outcome comes back as [`HostEvent::CommandFinished`].
    pub fn request(
        &mut self,
        action: SuggestionAction,
        suggestion_id: &str,
    ) -> Result<(), MutationError> {
        let command = self
            .coordinator
            .begin(self.engine.current_view(), action, suggestion_id)?;
        let backend = Arc::clone(&self.backend);
        let tx = self.host_tx.clone();
        tokio::spawn(async move {
            let outcome = command.submit(backend.as_ref()).await;
            let _ = tx.send(HostEvent::CommandFinished(outcome)).await;
        });
        Ok(())
    }

    pub fn handle(&mut self, event: HostEvent) -> SessionUpdate {
        let revision = self.view().revision();
        let mut update = SessionUpdate::default();
        match event {
            HostEvent::Fetched(completion) => {
                update.fetch = Some(self.engine.apply_fetch(completion));
            }
            HostEvent::Push(delivery) => {
                if self.is_attached() {
                    self.router.dispatch(&mut self.engine, &delivery);
                }
            }
            HostEvent::PushConnected => {
                self.engine.set_connection(ConnectionState::Connected);
            }
            HostEvent::PushDisconnected(reason) => {
                if let Some(err) = reason {
                    warn!(event = "push_disconnected", error = %err);
                }
                self.engine.set_connection(ConnectionState::Disconnected);
            }
            HostEvent::CommandFinished(outcome) => {
                let result = self.coordinator.complete(outcome);
                if let Err(err) = &result {
                    self.engine.set_status_note(err.to_string());
                }
                update.command = Some(result);
            }
        }
        update.view_changed = self.view().revision() != revision;
        update
    }

    /// Starts any refreshes requested by commands or push events.
    pub fn drain_refresh_requests(&mut self) -> usize {
        let mut started = 0;
        while let Ok(region) = self.refresh_rx.try_recv() {
            self.refresh(region);
            started += 1;
        }
        started
    }

    /// Polls every region on the configured interval and merges completions
    /// until `shutdown` resolves. Push handlers are detached on exit.
    pub async fn run<S, R>(&mut self, shutdown: S, mut on_change: R)
    where
        S: Future<Output = ()>,
        R: FnMut(&ReadModel),
    {
        self.attach();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.refresh_all();
                }
                Some(region) = self.refresh_rx.recv() => {
                    self.refresh(region);
                }
                Some(event) = self.host_rx.recv() => {
                    let update = self.handle(event);
                    if update.view_changed {
                        on_change(self.engine.current_view());
                    }
                }
            }
        }

        self.detach();
    }
}
