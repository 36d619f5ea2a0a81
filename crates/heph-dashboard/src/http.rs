use crate::coordinator::{CommandApi, SuggestionAction};
use crate::error::{CommandError, FetchError};
use crate::fetch::{Region, SnapshotFetcher};
use heph_core::{truncate_chars, BlockedTask, StatsSnapshot, Suggestion};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// Query and command API over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(base: Url, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| format!("{} cannot carry a path", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        region: Region,
        segments: &[&str],
    ) -> Result<T, FetchError> {
        let url = self
            .endpoint(segments)
            .map_err(|reason| FetchError::Transport { region, reason })?;
        debug!(event = "http_get", region = %region, url = %url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport {
                region,
                reason: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                region,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(|err| FetchError::Transport {
            region,
            reason: err.to_string(),
        })?;
        serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
            region,
            reason: err.to_string(),
        })
    }
}

impl SnapshotFetcher for HttpBackend {
    async fn fetch_dashboard_stats(&self) -> Result<StatsSnapshot, FetchError> {
        self.get_json(Region::DashboardStats, &["api", "dashboard", "stats"])
            .await
    }

    async fn fetch_blocked_tasks(&self) -> Result<Vec<BlockedTask>, FetchError> {
        self.get_json(Region::BlockedTasks, &["api", "tasks", "blocked"])
            .await
    }

    async fn fetch_suggestions(&self) -> Result<Vec<Suggestion>, FetchError> {
        self.get_json(Region::Suggestions, &["api", "suggestions"])
            .await
    }
}

impl CommandApi for HttpBackend {
    async fn submit_command(
        &self,
        action: SuggestionAction,
        suggestion_id: &str,
    ) -> Result<(), CommandError> {
        let transport = |reason: String| CommandError::Transport {
            action,
            suggestion_id: suggestion_id.to_string(),
            reason,
        };
        let url = self
            .endpoint(&["api", "suggestions", suggestion_id, action.as_str()])
            .map_err(transport)?;
        debug!(event = "http_post", action = %action, suggestion_id, url = %url);
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|err| transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("no response body")
                .to_string()
        } else {
            truncate_chars(body.trim(), ERROR_BODY_PREVIEW_CHARS)
        };
        if status == StatusCode::CONFLICT {
            return Err(CommandError::Conflict {
                action,
                suggestion_id: suggestion_id.to_string(),
                message,
            });
        }
        Err(CommandError::Rejected {
            action,
            suggestion_id: suggestion_id.to_string(),
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(Url::parse(base).expect("url"), Duration::from_secs(1)).expect("client")
    }

    #[test]
    fn endpoint_joins_segments_under_base_path() {
        let http = backend("http://127.0.0.1:8000/");
        assert_eq!(
            http.endpoint(&["api", "dashboard", "stats"]).expect("endpoint").as_str(),
            "http://127.0.0.1:8000/api/dashboard/stats"
        );

        let prefixed = backend("https://ops.example.com/heph/");
        assert_eq!(
            prefixed.endpoint(&["api", "suggestions"]).expect("endpoint").as_str(),
            "https://ops.example.com/heph/api/suggestions"
        );
    }

    #[test]
    fn endpoint_escapes_suggestion_ids() {
        let http = backend("http://127.0.0.1:8000");
        let url = http
            .endpoint(&["api", "suggestions", "a/b c", "approve"])
            .expect("endpoint");
        assert_eq!(url.path(), "/api/suggestions/a%2Fb%20c/approve");
    }
}
