use crate::error::FetchError;
use heph_core::{BlockedTask, StatsSnapshot, Suggestion};
use std::fmt;
use std::future::Future;

/// One independently fetched slice of the read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    DashboardStats,
    BlockedTasks,
    Suggestions,
}

impl Region {
    pub const ALL: [Region; 3] = [
        Region::DashboardStats,
        Region::BlockedTasks,
        Region::Suggestions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::DashboardStats => "dashboard_stats",
            Region::BlockedTasks => "blocked_tasks",
            Region::Suggestions => "suggestions",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pull side of the backend. Implementations must be cheap to share across tasks.
pub trait SnapshotFetcher: Send + Sync + 'static {
    fn fetch_dashboard_stats(
        &self,
    ) -> impl Future<Output = Result<StatsSnapshot, FetchError>> + Send;

    fn fetch_blocked_tasks(
        &self,
    ) -> impl Future<Output = Result<Vec<BlockedTask>, FetchError>> + Send;

    fn fetch_suggestions(&self) -> impl Future<Output = Result<Vec<Suggestion>, FetchError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub region: Region,
    pub seq: u64,
}

/// Hands out strictly increasing request sequence numbers.
#[derive(Debug, Default)]
pub struct RequestSequencer {
    last_seq: u64,
}

impl RequestSequencer {
    pub fn issue(&mut self, region: Region) -> FetchTicket {
        self.last_seq = self.last_seq.saturating_add(1);
        FetchTicket {
            region,
            seq: self.last_seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchedRegion {
    DashboardStats(StatsSnapshot),
    BlockedTasks(Vec<BlockedTask>),
    Suggestions(Vec<Suggestion>),
}

impl FetchedRegion {
    pub fn region(&self) -> Region {
        match self {
            FetchedRegion::DashboardStats(_) => Region::DashboardStats,
            FetchedRegion::BlockedTasks(_) => Region::BlockedTasks,
            FetchedRegion::Suggestions(_) => Region::Suggestions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchCompletion {
    pub ticket: FetchTicket,
    pub result: Result<FetchedRegion, FetchError>,
}

pub async fn fetch_region<F: SnapshotFetcher>(
    fetcher: &F,
    region: Region,
) -> Result<FetchedRegion, FetchError> {
    match region {
        Region::DashboardStats => fetcher
            .fetch_dashboard_stats()
            .await
            .map(FetchedRegion::DashboardStats),
        Region::BlockedTasks => fetcher
            .fetch_blocked_tasks()
            .await
            .map(FetchedRegion::BlockedTasks),
        Region::Suggestions => fetcher
            .fetch_suggestions()
            .await
            .map(FetchedRegion::Suggestions),
    }
}
