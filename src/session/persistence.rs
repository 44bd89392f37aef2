//! Persistence collaborator.
//!
//! The session never waits on the store. Writes are spawned with
//! [`fire_and_forget`], failures are logged, and local state stays the source
//! of truth for the rest of the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use super::calls::{BadgeAward, MasteryRecord, ProfileDelta, SessionSummary, StruggleRecord};
use crate::errors::{TutorError, TutorResult};

/// Default request timeout for [`HttpPersistence`].
pub const DEFAULT_PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// External store for session outcomes.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a struggle record.
    async fn record_struggle(&self, record: &StruggleRecord) -> TutorResult<()>;

    /// Merge learner preferences into the profile.
    async fn merge_profile(&self, delta: &ProfileDelta) -> TutorResult<()>;

    /// Mark a lesson task complete.
    async fn mark_task_complete(&self, task_id: &str) -> TutorResult<()>;

    /// Store the end-of-session summary.
    async fn record_session_summary(&self, summary: &SessionSummary) -> TutorResult<()>;

    /// Add active practice time.
    async fn save_practice_time(&self, seconds: u64) -> TutorResult<()>;

    /// Record a mastered review item.
    async fn mark_item_mastered(&self, record: &MasteryRecord) -> TutorResult<()>;

    /// Record an awarded badge.
    async fn award_badge(&self, badge: &BadgeAward) -> TutorResult<()>;
}

/// One write, detached from the session.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistRequest {
    /// [`Persistence::record_struggle`]
    Struggle(StruggleRecord),
    /// [`Persistence::merge_profile`]
    Profile(ProfileDelta),
    /// [`Persistence::mark_task_complete`]
    TaskComplete {
        /// Canonical task id
        task_id: String,
    },
    /// [`Persistence::record_session_summary`]
    Summary(SessionSummary),
    /// [`Persistence::save_practice_time`]
    PracticeTime {
        /// Whole seconds
        seconds: u64,
    },
    /// [`Persistence::mark_item_mastered`]
    Mastery(MasteryRecord),
    /// [`Persistence::award_badge`]
    Badge(BadgeAward),
}

impl PersistRequest {
    /// Operation name, for logs.
    pub fn op(&self) -> &'static str {
        match self {
            PersistRequest::Struggle(_) => "record_struggle",
            PersistRequest::Profile(_) => "merge_profile",
            PersistRequest::TaskComplete { .. } => "mark_task_complete",
            PersistRequest::Summary(_) => "record_session_summary",
            PersistRequest::PracticeTime { .. } => "save_practice_time",
            PersistRequest::Mastery(_) => "mark_item_mastered",
            PersistRequest::Badge(_) => "award_badge",
        }
    }

    /// Carry out the write.
    pub async fn apply(&self, store: &dyn Persistence) -> TutorResult<()> {
        match self {
            PersistRequest::Struggle(record) => store.record_struggle(record).await,
            PersistRequest::Profile(delta) => store.merge_profile(delta).await,
            PersistRequest::TaskComplete { task_id } => store.mark_task_complete(task_id).await,
            PersistRequest::Summary(summary) => store.record_session_summary(summary).await,
            PersistRequest::PracticeTime { seconds } => store.save_practice_time(*seconds).await,
            PersistRequest::Mastery(record) => store.mark_item_mastered(record).await,
            PersistRequest::Badge(badge) => store.award_badge(badge).await,
        }
    }
}

/// Spawn a write and forget about it. Failures are logged.
pub fn fire_and_forget(store: Arc<dyn Persistence>, request: PersistRequest) {
    tokio::spawn(async move {
        let op = request.op();
        match request.apply(store.as_ref()).await {
            Ok(()) => debug!(op, "Persisted"),
            Err(e) => warn!(op, error = %e, "Persistence write failed; keeping local state"),
        }
    });
}

// =============================================================================
// HTTP
// =============================================================================

/// JSON-over-HTTP store.
///
/// Each operation is a `POST` under the base URL:
///
/// | Operation | Path |
/// |---|---|
/// | record_struggle | `struggles` |
/// | merge_profile | `profile` |
/// | mark_task_complete | `tasks/complete` |
/// | record_session_summary | `sessions/summary` |
/// | save_practice_time | `sessions/practice-time` |
/// | mark_item_mastered | `review/mastered` |
/// | award_badge | `badges` |
///
/// Every body carries `session_id`, plus `user_id` and `lesson_id` when set.
pub struct HttpPersistence {
    base_url: Url,
    session_id: String,
    user_id: Option<String>,
    lesson_id: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpPersistence {
    /// Store rooted at `base_url`.
    pub fn new(base_url: &str) -> TutorResult<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            TutorError::InvalidConfiguration(format!("Invalid persistence URL '{base_url}': {e}"))
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(TutorError::InvalidConfiguration(format!(
                "Persistence URL must be http or https, got '{}'",
                base_url.scheme()
            )));
        }
        // Url::join replaces the last segment unless the path ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            lesson_id: None,
            api_key: None,
            timeout: DEFAULT_PERSISTENCE_TIMEOUT,
            client: reqwest::Client::new(),
        })
    }

    /// Attach the learner's id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the lesson id.
    pub fn with_lesson(mut self, lesson_id: impl Into<String>) -> Self {
        self.lesson_id = Some(lesson_id.into());
        self
    }

    /// Override the generated session id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Send a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Session id sent with every write.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn post(&self, path: &str, payload: serde_json::Value) -> TutorResult<()> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| TutorError::Internal(format!("Invalid persistence path '{path}': {e}")))?;

        let mut body = json!({ "session_id": self.session_id });
        if let Some(user_id) = &self.user_id {
            body["user_id"] = json!(user_id);
        }
        if let Some(lesson_id) = &self.lesson_id {
            body["lesson_id"] = json!(lesson_id);
        }
        body["data"] = payload;

        let mut request = self.client.post(url.clone()).timeout(self.timeout).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        debug!(url = %url, "Persistence POST");
        let response = request
            .send()
            .await
            .map_err(|e| TutorError::Persistence(format!("POST {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(TutorError::Persistence(format!(
                "POST {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn to_value<T: Serialize>(value: &T) -> TutorResult<serde_json::Value> {
    serde_json::to_value(value).map_err(TutorError::from)
}

#[async_trait]
impl Persistence for HttpPersistence {
    async fn record_struggle(&self, record: &StruggleRecord) -> TutorResult<()> {
        self.post("struggles", to_value(record)?).await
    }

    async fn merge_profile(&self, delta: &ProfileDelta) -> TutorResult<()> {
        self.post("profile", to_value(delta)?).await
    }

    async fn mark_task_complete(&self, task_id: &str) -> TutorResult<()> {
        self.post("tasks/complete", json!({ "task_id": task_id }))
            .await
    }

    async fn record_session_summary(&self, summary: &SessionSummary) -> TutorResult<()> {
        self.post("sessions/summary", to_value(summary)?).await
    }

    async fn save_practice_time(&self, seconds: u64) -> TutorResult<()> {
        self.post("sessions/practice-time", json!({ "seconds": seconds }))
            .await
    }

    async fn mark_item_mastered(&self, record: &MasteryRecord) -> TutorResult<()> {
        self.post("review/mastered", to_value(record)?).await
    }

    async fn award_badge(&self, badge: &BadgeAward) -> TutorResult<()> {
        self.post("badges", to_value(badge)?).await
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Store that records every write. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    writes: Arc<Mutex<Vec<PersistRequest>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryPersistence {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects every write, after recording it.
    pub fn failing() -> Self {
        let store = Self::default();
        store.failing.store(true, Ordering::SeqCst);
        store
    }

    /// Writes so far, in arrival order.
    pub fn writes(&self) -> Vec<PersistRequest> {
        self.writes.lock().clone()
    }

    fn record(&self, request: PersistRequest) -> TutorResult<()> {
        self.writes.lock().push(request);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TutorError::Persistence("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn record_struggle(&self, record: &StruggleRecord) -> TutorResult<()> {
        self.record(PersistRequest::Struggle(record.clone()))
    }

    async fn merge_profile(&self, delta: &ProfileDelta) -> TutorResult<()> {
        self.record(PersistRequest::Profile(delta.clone()))
    }

    async fn mark_task_complete(&self, task_id: &str) -> TutorResult<()> {
        self.record(PersistRequest::TaskComplete {
            task_id: task_id.to_string(),
        })
    }

    async fn record_session_summary(&self, summary: &SessionSummary) -> TutorResult<()> {
        self.record(PersistRequest::Summary(summary.clone()))
    }

    async fn save_practice_time(&self, seconds: u64) -> TutorResult<()> {
        self.record(PersistRequest::PracticeTime { seconds })
    }

    async fn mark_item_mastered(&self, record: &MasteryRecord) -> TutorResult<()> {
        self.record(PersistRequest::Mastery(record.clone()))
    }

    async fn award_badge(&self, badge: &BadgeAward) -> TutorResult<()> {
        self.record(PersistRequest::Badge(badge.clone()))
    }
}

/// Store that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

#[async_trait]
impl Persistence for NoopPersistence {
    async fn record_struggle(&self, _record: &StruggleRecord) -> TutorResult<()> {
        Ok(())
    }

    async fn merge_profile(&self, _delta: &ProfileDelta) -> TutorResult<()> {
        Ok(())
    }

    async fn mark_task_complete(&self, _task_id: &str) -> TutorResult<()> {
        Ok(())
    }

    async fn record_session_summary(&self, _summary: &SessionSummary) -> TutorResult<()> {
        Ok(())
    }

    async fn save_practice_time(&self, _seconds: u64) -> TutorResult<()> {
        Ok(())
    }

    async fn mark_item_mastered(&self, _record: &MasteryRecord) -> TutorResult<()> {
        Ok(())
    }

    async fn award_badge(&self, _badge: &BadgeAward) -> TutorResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn summary() -> SessionSummary {
        SessionSummary {
            did_well: vec!["greeting".to_string()],
            work_on: vec!["past tense".to_string()],
            stars: 4,
            summary_text: "Good job!".to_string(),
        }
    }

    #[test]
    fn test_http_rejects_bad_urls() {
        assert!(matches!(
            HttpPersistence::new("not a url"),
            Err(TutorError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            HttpPersistence::new("ftp://example.com"),
            Err(TutorError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_http_posts_summary_under_base_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/summary"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "session_id": "s-1",
                "user_id": "u-1",
                "data": {"stars": 4}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpPersistence::new(&format!("{}/api", server.uri()))
            .unwrap()
            .with_session_id("s-1")
            .with_user("u-1")
            .with_api_key("secret");

        store.record_session_summary(&summary()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_status_is_persistence_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks/complete"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = HttpPersistence::new(&server.uri()).unwrap();
        let result = store.mark_task_complete("task-1").await;
        assert!(matches!(result, Err(TutorError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_memory_records_in_order() {
        let store = MemoryPersistence::new();
        let shared: Arc<dyn Persistence> = Arc::new(store.clone());

        PersistRequest::TaskComplete {
            task_id: "task-1".to_string(),
        }
        .apply(shared.as_ref())
        .await
        .unwrap();
        PersistRequest::PracticeTime { seconds: 90 }
            .apply(shared.as_ref())
            .await
            .unwrap();

        let ops: Vec<&str> = store.writes().iter().map(PersistRequest::op).collect();
        assert_eq!(ops, vec!["mark_task_complete", "save_practice_time"]);
    }

    #[tokio::test]
    async fn test_fire_and_forget_swallows_failures() {
        let store = MemoryPersistence::failing();
        fire_and_forget(Arc::new(store.clone()), PersistRequest::Summary(summary()));

        for _ in 0..10 {
            if !store.writes().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.writes().len(), 1);
    }
}
