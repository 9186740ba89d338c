use std::time::Duration;

use tapedeck_protocol::{ProjectKey, UserId};

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub project_key: ProjectKey,
    pub user_id: Option<UserId>,
    pub endpoint: String,
    pub flush_interval: Duration,
    /// 20 Hz.
    pub pointer_sample_period: Duration,
    /// 10 Hz.
    pub scroll_sample_period: Duration,
}

impl CaptureConfig {
    pub fn new(project_key: impl Into<ProjectKey>) -> Self {
        Self {
            project_key: project_key.into(),
            user_id: None,
            endpoint: "http://localhost:3001/ingest".to_owned(),
            flush_interval: Duration::from_secs(5),
            pointer_sample_period: Duration::from_millis(50),
            scroll_sample_period: Duration::from_millis(100),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_sample_periods(mut self, pointer: Duration, scroll: Duration) -> Self {
        self.pointer_sample_period = pointer;
        self.scroll_sample_period = scroll;
        self
    }
}
