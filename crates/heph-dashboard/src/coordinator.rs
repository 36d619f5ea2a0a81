use crate::engine::ReadModel;
use crate::error::{CommandError, MutationError, StaleStateError};
use crate::fetch::Region;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuggestionAction {
    Approve,
    Reject,
}

impl SuggestionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionAction::Approve => "approve",
            SuggestionAction::Reject => "reject",
        }
    }
}

impl fmt::Display for SuggestionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write side of the backend: one state-transition request per call.
pub trait CommandApi: Send + Sync + 'static {
    fn submit_command(
        &self,
        action: SuggestionAction,
        suggestion_id: &str,
    ) -> impl Future<Output = Result<(), CommandError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub action: SuggestionAction,
    pub suggestion_id: String,
    pub request_id: u64,
}

impl PendingCommand {
    pub async fn submit<C: CommandApi>(self, api: &C) -> CommandOutcome {
        let result = api.submit_command(self.action, &self.suggestion_id).await;
        CommandOutcome {
            command: self,
            result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: PendingCommand,
    pub result: Result<(), CommandError>,
}

/// Issues approve/reject commands without touching the read model.
///
/// An accepted command only invalidates the affected regions; the next fetch
/// carries the authoritative status.
#[derive(Debug)]
pub struct MutationCoordinator {
    in_flight: HashMap<String, PendingCommand>,
    refresh_tx: mpsc::UnboundedSender<Region>,
    next_request_id: u64,
}

impl MutationCoordinator {
    pub fn new(refresh_tx: mpsc::UnboundedSender<Region>) -> Self {
        Self {
            in_flight: HashMap::new(),
            refresh_tx,
            next_request_id: 0,
        }
    }

    pub fn is_in_flight(&self, suggestion_id: &str) -> bool {
        self.in_flight.contains_key(suggestion_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Validates the action against the locally known status and reserves the
    /// suggestion. Nothing is sent until the returned command is submitted.
    pub fn begin(
        &mut self,
        view: &ReadModel,
        action: SuggestionAction,
        suggestion_id: &str,
    ) -> Result<PendingCommand, MutationError> {
        let Some(suggestion) = view.suggestion(suggestion_id) else {
            return Err(MutationError::UnknownSuggestion(suggestion_id.to_string()));
        };
        if suggestion.status.is_terminal() {
            warn!(
                event = "command_stale",
                action = %action,
                suggestion_id,
                status = %suggestion.status
            );
            return Err(StaleStateError {
                suggestion_id: suggestion_id.to_string(),
                status: suggestion.status,
            }
            .into());
        }
        if self.in_flight.contains_key(suggestion_id) {
            return Err(MutationError::InFlight(suggestion_id.to_string()));
        }

        self.next_request_id = self.next_request_id.saturating_add(1);
        let command = PendingCommand {
            action,
            suggestion_id: suggestion_id.to_string(),
            request_id: self.next_request_id,
        };
        self.in_flight
            .insert(command.suggestion_id.clone(), command.clone());
        debug!(
            event = "command_begin",
            action = %action,
            suggestion_id,
            request_id = command.request_id
        );
        Ok(command)
    }

    /// Releases the reservation. On success the suggestions and stats regions
    /// are invalidated; on failure the error is returned and nothing changes.
    pub fn complete(&mut self, outcome: CommandOutcome) -> Result<PendingCommand, MutationError> {
        let CommandOutcome { command, result } = outcome;
        let tracked = self
            .in_flight
            .get(&command.suggestion_id)
            .map(|pending| pending.request_id == command.request_id)
            .unwrap_or(false);
        if tracked {
            self.in_flight.remove(&command.suggestion_id);
        }

        match result {
            Ok(()) => {
                info!(
                    event = "command_accepted",
                    action = %command.action,
                    suggestion_id = %command.suggestion_id
                );
                self.invalidate(Region::Suggestions);
                self.invalidate(Region::DashboardStats);
                Ok(command)
            }
            Err(err) => {
                warn!(
                    event = "command_failed",
                    action = %command.action,
                    suggestion_id = %command.suggestion_id,
                    error = %err
                );
                Err(err.into())
            }
        }
    }

    pub async fn approve<C: CommandApi>(
        &mut self,
        api: &C,
        view: &ReadModel,
        suggestion_id: &str,
    ) -> Result<(), MutationError> {
        self.run(api, view, SuggestionAction::Approve, suggestion_id)
            .await
    }

    pub async fn reject<C: CommandApi>(
        &mut self,
        api: &C,
        view: &ReadModel,
        suggestion_id: &str,
    ) -> Result<(), MutationError> {
        self.run(api, view, SuggestionAction::Reject, suggestion_id)
            .await
    }

    async fn run<C: CommandApi>(
        &mut self,
        api: &C,
        view: &ReadModel,
        action: SuggestionAction,
        suggestion_id: &str,
    ) -> Result<(), MutationError> {
        let command = self.begin(view, action, suggestion_id)?;
        let outcome = command.submit(api).await;
        self.complete(outcome).map(|_| ())
    }

    fn invalidate(&self, region: Region) {
        if self.refresh_tx.send(region).is_err() {
            debug!(event = "refresh_dropped", region = %region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReconciliationEngine;
    use heph_core::{Suggestion, SuggestionStatus};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedApi {
        calls: Mutex<Vec<(SuggestionAction, String)>>,
        results: Mutex<VecDeque<Result<(), CommandError>>>,
    }

    impl ScriptedApi {
        fn with_results(results: Vec<Result<(), CommandError>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                results: Mutex::new(results.into()),
            }
        }

        fn calls(&self) -> Vec<(SuggestionAction, String)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl CommandApi for ScriptedApi {
        async fn submit_command(
            &self,
            action: SuggestionAction,
            suggestion_id: &str,
        ) -> Result<(), CommandError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((action, suggestion_id.to_string()));
            self.results
                .lock()
                .expect("results lock")
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    fn suggestion(id: &str, status: SuggestionStatus) -> Suggestion {
        Suggestion {
            id: id.to_string(),
            phase_id: "phase-2".to_string(),
            suggestion_text: "Split the review phase".to_string(),
            reasoning: "Review queue is the bottleneck".to_string(),
            status,
        }
    }

    fn engine_with(suggestions: Vec<Suggestion>) -> ReconciliationEngine {
        let mut engine = ReconciliationEngine::new();
        engine.apply_suggestions(suggestions);
        engine
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Region>) -> Vec<Region> {
        let mut regions = Vec::new();
        while let Ok(region) = rx.try_recv() {
            regions.push(region);
        }
        regions
    }

    #[tokio::test]
    async fn terminal_suggestion_fails_stale_without_command() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut coordinator = MutationCoordinator::new(tx);
        let api = ScriptedApi::default();
        let engine = engine_with(vec![
            suggestion("sugg-1", SuggestionStatus::Approved),
            suggestion("sugg-2", SuggestionStatus::Rejected),
        ]);

        let approve = coordinator
            .approve(&api, engine.current_view(), "sugg-1")
            .await;
        let reject = coordinator
            .reject(&api, engine.current_view(), "sugg-2")
            .await;

        assert_eq!(
            approve,
            Err(MutationError::Stale(StaleStateError {
                suggestion_id: "sugg-1".to_string(),
                status: SuggestionStatus::Approved,
            }))
        );
        assert!(matches!(reject, Err(MutationError::Stale(_))));
        assert!(api.calls().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn accepted_command_invalidates_without_local_flip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut coordinator = MutationCoordinator::new(tx);
        let api = ScriptedApi::default();
        let engine = engine_with(vec![suggestion("sugg-1", SuggestionStatus::Pending)]);

        coordinator
            .approve(&api, engine.current_view(), "sugg-1")
            .await
            .expect("approve accepted");

        assert_eq!(
            api.calls(),
            vec![(SuggestionAction::Approve, "sugg-1".to_string())]
        );
        assert_eq!(
            engine.current_view().suggestion("sugg-1").map(|s| s.status),
            Some(SuggestionStatus::Pending)
        );
        assert_eq!(
            drain(&mut rx),
            vec![Region::Suggestions, Region::DashboardStats]
        );
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn poll_still_pending_after_approve_shows_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut coordinator = MutationCoordinator::new(tx);
        let api = ScriptedApi::default();
        let mut engine = engine_with(vec![suggestion("sugg-1", SuggestionStatus::Pending)]);

        coordinator
            .approve(&api, engine.current_view(), "sugg-1")
            .await
            .expect("approve accepted");
        engine.apply_suggestions(vec![suggestion("sugg-1", SuggestionStatus::Pending)]);

        assert_eq!(
            engine.current_view().suggestion("sugg-1").map(|s| s.status),
            Some(SuggestionStatus::Pending)
        );
    }

    #[tokio::test]
    async fn failed_command_is_surfaced_and_retryable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut coordinator = MutationCoordinator::new(tx);
        let api = ScriptedApi::with_results(vec![Err(CommandError::Transport {
            action: SuggestionAction::Reject,
            suggestion_id: "sugg-1".to_string(),
            reason: "connection reset".to_string(),
        })]);
        let engine = engine_with(vec![suggestion("sugg-1", SuggestionStatus::Pending)]);

        let first = coordinator
            .reject(&api, engine.current_view(), "sugg-1")
            .await;
        assert!(matches!(
            first,
            Err(MutationError::Command(CommandError::Transport { .. }))
        ));
        assert!(drain(&mut rx).is_empty());
        assert!(!coordinator.is_in_flight("sugg-1"));
        assert_eq!(
            engine.current_view().suggestion("sugg-1").map(|s| s.status),
            Some(SuggestionStatus::Pending)
        );

        coordinator
            .reject(&api, engine.current_view(), "sugg-1")
            .await
            .expect("retry accepted");
        assert_eq!(api.calls().len(), 2);
    }

    #[test]
    fn second_begin_while_in_flight_is_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut coordinator = MutationCoordinator::new(tx);
        let engine = engine_with(vec![suggestion("sugg-1", SuggestionStatus::Pending)]);

        let first = coordinator
            .begin(engine.current_view(), SuggestionAction::Approve, "sugg-1")
            .expect("first begin");
        let second = coordinator.begin(engine.current_view(), SuggestionAction::Reject, "sugg-1");

        assert_eq!(second, Err(MutationError::InFlight("sugg-1".to_string())));
        assert_eq!(first.request_id, 1);
        assert!(coordinator.is_in_flight("sugg-1"));
    }

    #[test]
    fn unknown_suggestion_is_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut coordinator = MutationCoordinator::new(tx);
        let engine = ReconciliationEngine::new();

        let result = coordinator.begin(engine.current_view(), SuggestionAction::Approve, "ghost");
        assert_eq!(result, Err(MutationError::UnknownSuggestion("ghost".to_string())));
    }
}
