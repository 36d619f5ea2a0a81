use crate::fetch::{FetchCompletion, FetchedRegion, Region};
use heph_core::{
    ActivityRecord, BlockedTask, StatCounters, StatsDelta, StatsSnapshot, Suggestion,
    SuggestionStatus, ACTIVITY_LOG_CAP,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardKpis {
    pub active_agents: u64,
    pub running_tasks: u64,
    pub queued_tasks: u64,
    pub blocked_tasks: u64,
    pub total_memories: u64,
    pub stuck_agents: u64,
}

/// Merged, read-only dashboard state. Only [`ReconciliationEngine`] writes it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadModel {
    stats: Option<StatCounters>,
    activity: VecDeque<ActivityRecord>,
    blocked_tasks: Option<Vec<BlockedTask>>,
    suggestions: Option<Vec<Suggestion>>,
    load_state: LoadState,
    connection: ConnectionState,
    status_note: Option<String>,
    revision: u64,
}

impl ReadModel {
    pub fn stats(&self) -> Option<&StatCounters> {
        self.stats.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.stats.is_some()
    }

    /// Newest first.
    pub fn activity(&self) -> impl Iterator<Item = &ActivityRecord> {
        self.activity.iter()
    }

    pub fn activity_len(&self) -> usize {
        self.activity.len()
    }

    pub fn activity_ids(&self) -> Vec<&str> {
        self.activity.iter().map(|record| record.id.as_str()).collect()
    }

    pub fn blocked_tasks(&self) -> &[BlockedTask] {
        self.blocked_tasks.as_deref().unwrap_or_default()
    }

    pub fn suggestions(&self) -> &[Suggestion] {
        self.suggestions.as_deref().unwrap_or_default()
    }

    pub fn suggestion(&self, suggestion_id: &str) -> Option<&Suggestion> {
        self.suggestions().iter().find(|s| s.id == suggestion_id)
    }

    pub fn pending_suggestions(&self) -> impl Iterator<Item = &Suggestion> {
        self.suggestions()
            .iter()
            .filter(|s| s.status == SuggestionStatus::Pending)
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn status_note(&self) -> Option<&str> {
        self.status_note.as_deref()
    }

    /// Bumped on every visible change; lets renderers skip identical frames.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn kpis(&self) -> DashboardKpis {
        let stats = self.stats.unwrap_or_default();
        DashboardKpis {
            active_agents: stats.active_agents,
            running_tasks: stats.running_tasks,
            queued_tasks: stats.queued_tasks,
            blocked_tasks: self.blocked_tasks().len() as u64,
            total_memories: stats.total_memories,
            stuck_agents: stats.stuck_agents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    Applied,
    /// A newer response for the same region was already applied.
    Stale,
    /// Failure swallowed; the last-known-good view stays in place.
    Absorbed,
    FirstLoadFailed,
}

/// Single owner of the dashboard read model.
///
/// All mutation is serial: callers run these methods from one task, so every
/// method leaves the view fully consistent before returning.
#[derive(Debug, Default)]
pub struct ReconciliationEngine {
    view: ReadModel,
    activity_seeded: bool,
    last_applied: BTreeMap<Region, u64>,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_view(&self) -> &ReadModel {
        &self.view
    }

    /// Replaces the counters. The activity log is seeded from the snapshot
    /// only once; afterwards it is driven by pushed events so that locally
    /// observed records are not discarded by a lagging server list.
    pub fn apply_snapshot(&mut self, snapshot: StatsSnapshot) {
        self.view.stats = Some(snapshot.counters);
        if !self.activity_seeded {
            for record in snapshot.recent_activity {
                if self.view.activity.len() >= ACTIVITY_LOG_CAP {
                    break;
                }
                if self.contains_activity(&record.id) {
                    continue;
                }
                self.view.activity.push_back(record);
            }
            self.activity_seeded = true;
            info!(
                event = "activity_seeded",
                records = self.view.activity.len()
            );
        }
        if self.view.load_state != LoadState::Ready {
            self.view.load_state = LoadState::Ready;
        }
        self.touch();
    }

    /// Field-wise overwrite-if-present. Deltas that arrive before the first
    /// snapshot are dropped, not buffered.
    pub fn apply_delta(&mut self, delta: StatsDelta) -> bool {
        let Some(stats) = self.view.stats.as_mut() else {
            debug!(event = "delta_dropped", reason = "no_snapshot");
            return false;
        };
        let changed = delta.apply_to(stats);
        if changed {
            self.touch();
        }
        changed
    }

    /// Prepends a record, evicting from the tail past the cap. A record whose
    /// id is already in the log is ignored.
    pub fn record_activity(&mut self, record: ActivityRecord) -> bool {
        if self.contains_activity(&record.id) {
            debug!(event = "activity_duplicate", id = %record.id);
            return false;
        }
        self.view.activity.push_front(record);
        self.view.activity.truncate(ACTIVITY_LOG_CAP);
        self.touch();
        true
    }

    pub fn apply_blocked_tasks(&mut self, tasks: Vec<BlockedTask>) {
        self.view.blocked_tasks = Some(tasks);
        self.touch();
    }

    /// Replaces the suggestion list. A suggestion already seen in a terminal
    /// state keeps it even if the incoming list still reports `pending`.
    pub fn apply_suggestions(&mut self, mut suggestions: Vec<Suggestion>) {
        let known: HashMap<String, SuggestionStatus> = self
            .view
            .suggestions()
            .iter()
            .filter(|s| s.status.is_terminal())
            .map(|s| (s.id.clone(), s.status))
            .collect();
        for suggestion in &mut suggestions {
            if suggestion.status.is_terminal() {
                continue;
            }
            if let Some(status) = known.get(&suggestion.id) {
                debug!(
                    event = "suggestion_status_held",
                    id = %suggestion.id,
                    held = %status
                );
                suggestion.status = *status;
            }
        }
        self.view.suggestions = Some(suggestions);
        self.touch();
    }

    /// Applies a fetch result unless a newer one for the same region already
    /// landed. Failures never clear data that was previously loaded.
    pub fn apply_fetch(&mut self, completion: FetchCompletion) -> FetchDisposition {
        let region = completion.ticket.region;
        let seq = completion.ticket.seq;
        let last = self.last_applied.get(&region).copied().unwrap_or(0);
        if seq <= last {
            debug!(event = "fetch_stale", region = %region, seq, last_applied = last);
            return FetchDisposition::Stale;
        }

        match completion.result {
            Ok(fetched) => {
                self.last_applied.insert(fetched.region(), seq);
                match fetched {
                    FetchedRegion::DashboardStats(snapshot) => self.apply_snapshot(snapshot),
                    FetchedRegion::BlockedTasks(tasks) => self.apply_blocked_tasks(tasks),
                    FetchedRegion::Suggestions(suggestions) => self.apply_suggestions(suggestions),
                }
                FetchDisposition::Applied
            }
            Err(err) if region == Region::DashboardStats && !self.view.is_loaded() => {
                warn!(event = "first_load_failed", region = %region, error = %err);
                self.view.load_state = LoadState::Failed(err.to_string());
                self.touch();
                FetchDisposition::FirstLoadFailed
            }
            Err(err) => {
                warn!(event = "fetch_absorbed", region = %region, seq, error = %err);
                FetchDisposition::Absorbed
            }
        }
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        if self.view.connection == state {
            return;
        }
        self.view.connection = state;
        self.view.status_note = match state {
            ConnectionState::Connecting => None,
            ConnectionState::Connected => Some("live updates connected".to_string()),
            ConnectionState::Disconnected if self.view.is_loaded() => {
                Some("live updates reconnecting; polling only".to_string())
            }
            ConnectionState::Disconnected => {
                Some("live updates offline; waiting for first snapshot".to_string())
            }
        };
        self.touch();
    }

    pub fn set_status_note(&mut self, note: impl Into<String>) {
        self.view.status_note = Some(note.into());
        self.touch();
    }

    fn contains_activity(&self, id: &str) -> bool {
        self.view.activity.iter().any(|record| record.id == id)
    }

    fn touch(&mut self) {
        self.view.revision = self.view.revision.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::FetchTicket;
    use chrono::{TimeZone, Utc};
    use heph_core::ActivityKind;

    fn record(id: &str) -> ActivityRecord {
        ActivityRecord {
            id: id.to_string(),
            kind: ActivityKind::TaskCreated,
            message: format!("record {id}"),
            timestamp: Utc.timestamp_millis_opt(1_707_335_222_222).single().expect("ts"),
            origin_agent_id: None,
        }
    }

    fn snapshot(active_agents: u64, running_tasks: u64) -> StatsSnapshot {
        StatsSnapshot {
            counters: StatCounters {
                active_agents,
                running_tasks,
                queued_tasks: 2,
                total_memories: 40,
                stuck_agents: 1,
            },
            recent_activity: Vec::new(),
        }
    }

    fn suggestion(id: &str, status: SuggestionStatus) -> Suggestion {
        Suggestion {
            id: id.to_string(),
            phase_id: "phase-1".to_string(),
            suggestion_text: "Run tests before review".to_string(),
            reasoning: "Two tasks bounced from review".to_string(),
            status,
        }
    }

    fn completion(
        region: Region,
        seq: u64,
        result: Result<FetchedRegion, FetchError>,
    ) -> FetchCompletion {
        FetchCompletion {
            ticket: FetchTicket { region, seq },
            result,
        }
    }

    #[test]
    fn delta_patches_only_mentioned_fields() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_snapshot(snapshot(3, 5));
        engine.apply_delta(StatsDelta {
            active_agents: Some(4),
            ..StatsDelta::default()
        });

        let stats = engine.current_view().stats().copied().expect("stats");
        assert_eq!(stats.active_agents, 4);
        assert_eq!(stats.running_tasks, 5);
    }

    #[test]
    fn unmentioned_fields_survive_many_deltas() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_snapshot(snapshot(3, 5));
        for value in 0..20 {
            engine.apply_delta(StatsDelta {
                active_agents: Some(value),
                total_memories: Some(100 + value),
                ..StatsDelta::default()
            });
        }

        let stats = engine.current_view().stats().copied().expect("stats");
        assert_eq!(stats.active_agents, 19);
        assert_eq!(stats.total_memories, 119);
        assert_eq!(stats.running_tasks, 5);
        assert_eq!(stats.queued_tasks, 2);
        assert_eq!(stats.stuck_agents, 1);
    }

    #[test]
    fn delta_before_snapshot_is_dropped_and_not_replayed() {
        let mut engine = ReconciliationEngine::new();
        let revision = engine.current_view().revision();
        assert!(!engine.apply_delta(StatsDelta {
            active_agents: Some(9),
            ..StatsDelta::default()
        }));
        assert!(engine.current_view().stats().is_none());
        assert_eq!(engine.current_view().revision(), revision);

        engine.apply_snapshot(snapshot(3, 5));
        assert_eq!(engine.current_view().stats().map(|s| s.active_agents), Some(3));
    }

    #[test]
    fn activity_log_evicts_oldest_past_cap() {
        let mut engine = ReconciliationEngine::new();
        for idx in 0..10 {
            engine.record_activity(record(&format!("r{idx}")));
        }
        assert_eq!(engine.current_view().activity_ids()[0], "r9");

        engine.record_activity(record("r10"));

        let ids = engine.current_view().activity_ids();
        let expected: Vec<String> = (1..=10).rev().map(|idx| format!("r{idx}")).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(!ids.contains(&"r0"));
    }

    #[test]
    fn activity_log_never_exceeds_cap() {
        let mut engine = ReconciliationEngine::new();
        for idx in 0..35 {
            engine.record_activity(record(&format!("r{idx}")));
            assert!(engine.current_view().activity_len() <= ACTIVITY_LOG_CAP);
        }
    }

    #[test]
    fn duplicate_activity_id_is_ignored() {
        let mut engine = ReconciliationEngine::new();
        assert!(engine.record_activity(record("a")));
        assert!(engine.record_activity(record("b")));
        let before = engine.current_view().activity_ids().join(",");
        let revision = engine.current_view().revision();

        assert!(!engine.record_activity(record("a")));

        assert_eq!(engine.current_view().activity_ids().join(","), before);
        assert_eq!(engine.current_view().revision(), revision);
    }

    #[test]
    fn first_snapshot_seeds_activity_and_later_ones_do_not() {
        let mut engine = ReconciliationEngine::new();
        let mut first = snapshot(1, 1);
        first.recent_activity = vec![record("s2"), record("s1")];
        engine.apply_snapshot(first);
        engine.record_activity(record("live-1"));

        let mut second = snapshot(2, 2);
        second.recent_activity = vec![record("s4"), record("s3")];
        engine.apply_snapshot(second);

        assert_eq!(engine.current_view().activity_ids(), vec!["live-1", "s2", "s1"]);
        assert_eq!(engine.current_view().stats().map(|s| s.active_agents), Some(2));
    }

    #[test]
    fn seeding_keeps_records_pushed_before_first_snapshot() {
        let mut engine = ReconciliationEngine::new();
        engine.record_activity(record("s2"));
        let mut first = snapshot(1, 1);
        first.recent_activity = (0..12).rev().map(|idx| record(&format!("s{idx}"))).collect();
        engine.apply_snapshot(first);

        let ids = engine.current_view().activity_ids();
        assert_eq!(ids.len(), ACTIVITY_LOG_CAP);
        assert_eq!(ids[0], "s2");
        assert_eq!(ids.iter().filter(|id| **id == "s2").count(), 1);
        assert_eq!(ids[1], "s11");
    }

    #[test]
    fn stale_fetch_does_not_overwrite_newer_state() {
        let mut engine = ReconciliationEngine::new();
        let newer = engine.apply_fetch(completion(
            Region::DashboardStats,
            7,
            Ok(FetchedRegion::DashboardStats(snapshot(8, 8))),
        ));
        let older = engine.apply_fetch(completion(
            Region::DashboardStats,
            3,
            Ok(FetchedRegion::DashboardStats(snapshot(1, 1))),
        ));

        assert_eq!(newer, FetchDisposition::Applied);
        assert_eq!(older, FetchDisposition::Stale);
        assert_eq!(engine.current_view().stats().map(|s| s.active_agents), Some(8));
    }

    #[test]
    fn staleness_is_tracked_per_region() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_fetch(completion(
            Region::Suggestions,
            9,
            Ok(FetchedRegion::Suggestions(vec![])),
        ));
        let blocked = engine.apply_fetch(completion(
            Region::BlockedTasks,
            4,
            Ok(FetchedRegion::BlockedTasks(vec![BlockedTask {
                id: "t-1".to_string(),
                extra: Default::default(),
            }])),
        ));
        assert_eq!(blocked, FetchDisposition::Applied);
        assert_eq!(engine.current_view().kpis().blocked_tasks, 1);
    }

    #[test]
    fn first_load_failure_is_visible_then_cleared() {
        let mut engine = ReconciliationEngine::new();
        let failed = engine.apply_fetch(completion(
            Region::DashboardStats,
            1,
            Err(FetchError::Status {
                region: Region::DashboardStats,
                status: 503,
            }),
        ));
        assert_eq!(failed, FetchDisposition::FirstLoadFailed);
        assert!(matches!(
            engine.current_view().load_state(),
            LoadState::Failed(reason) if reason.contains("503")
        ));

        engine.apply_fetch(completion(
            Region::DashboardStats,
            2,
            Ok(FetchedRegion::DashboardStats(snapshot(3, 5))),
        ));
        assert_eq!(engine.current_view().load_state(), &LoadState::Ready);
    }

    #[test]
    fn later_failures_keep_last_known_good_view() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_fetch(completion(
            Region::DashboardStats,
            1,
            Ok(FetchedRegion::DashboardStats(snapshot(3, 5))),
        ));
        engine.apply_fetch(completion(
            Region::Suggestions,
            2,
            Ok(FetchedRegion::Suggestions(vec![suggestion("sugg-1", SuggestionStatus::Pending)])),
        ));
        let revision = engine.current_view().revision();

        let stats_failure = engine.apply_fetch(completion(
            Region::DashboardStats,
            3,
            Err(FetchError::Transport {
                region: Region::DashboardStats,
                reason: "connection refused".to_string(),
            }),
        ));
        let suggestions_failure = engine.apply_fetch(completion(
            Region::Suggestions,
            4,
            Err(FetchError::Decode {
                region: Region::Suggestions,
                reason: "eof".to_string(),
            }),
        ));

        assert_eq!(stats_failure, FetchDisposition::Absorbed);
        assert_eq!(suggestions_failure, FetchDisposition::Absorbed);
        assert_eq!(engine.current_view().revision(), revision);
        assert_eq!(engine.current_view().load_state(), &LoadState::Ready);
        assert_eq!(engine.current_view().stats().map(|s| s.running_tasks), Some(5));
        assert_eq!(engine.current_view().suggestions().len(), 1);
    }

    #[test]
    fn terminal_suggestion_status_is_never_reverted() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_suggestions(vec![
            suggestion("sugg-1", SuggestionStatus::Approved),
            suggestion("sugg-2", SuggestionStatus::Pending),
        ]);
        engine.apply_suggestions(vec![
            suggestion("sugg-1", SuggestionStatus::Pending),
            suggestion("sugg-2", SuggestionStatus::Rejected),
        ]);

        let view = engine.current_view();
        assert_eq!(view.suggestion("sugg-1").map(|s| s.status), Some(SuggestionStatus::Approved));
        assert_eq!(view.suggestion("sugg-2").map(|s| s.status), Some(SuggestionStatus::Rejected));
        assert_eq!(view.pending_suggestions().count(), 0);
    }

    #[test]
    fn kpis_default_to_zero_before_load() {
        let engine = ReconciliationEngine::new();
        assert_eq!(engine.current_view().kpis(), DashboardKpis::default());
        assert_eq!(engine.current_view().load_state(), &LoadState::Loading);
    }

    #[test]
    fn disconnect_note_depends_on_loaded_data() {
        let mut engine = ReconciliationEngine::new();
        engine.set_connection(ConnectionState::Disconnected);
        assert!(engine.current_view().status_note().unwrap_or_default().contains("offline"));

        engine.apply_snapshot(snapshot(1, 1));
        engine.set_connection(ConnectionState::Connected);
        engine.set_connection(ConnectionState::Disconnected);
        assert!(engine.current_view().status_note().unwrap_or_default().contains("reconnecting"));
        assert_eq!(engine.current_view().connection(), ConnectionState::Disconnected);
    }
}
