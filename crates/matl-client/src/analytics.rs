//! Best-effort usage analytics.
//!
//! Events are posted as JSON to the endpoint configured in
//! `ClientConfig::analytics_url`. Nothing is sent when no endpoint is
//! configured. Sending never blocks the caller and failures are only logged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Fired when the server acknowledges a submission.
pub const JOB_SUBMITTED: (&str, &str, &str) = ("general", "workflow", "Job Submitted");

/// Fired when a submission is not acknowledged in time.
pub const SUBMIT_FAILED: (&str, &str, &str) = ("errors", "error", "Submit failed");

/// A categorised analytics event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub category: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl AnalyticsEvent {
    /// Create a new analytics event with the current timestamp.
    pub fn new(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            action: action.into(),
            label: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Build an event from one of the `(category, action, label)` constants.
    pub fn from_triple((category, action, label): (&str, &str, &str)) -> Self {
        Self::new(category, action).with_label(label)
    }

    /// `category/action/label`, as used in logs.
    pub fn path(&self) -> String {
        match &self.label {
            Some(label) => format!("{}/{}/{}", self.category, self.action, label),
            None => format!("{}/{}", self.category, self.action),
        }
    }
}

/// Payload sent to the analytics server.
#[derive(Debug, Serialize)]
struct AnalyticsPayload {
    client: &'static str,
    events: Vec<AnalyticsEvent>,
}

/// Sender for analytics events.
#[derive(Debug, Clone, Default)]
pub struct Analytics {
    endpoint: Option<Url>,
}

impl Analytics {
    pub fn new(endpoint: Option<Url>) -> Self {
        Self { endpoint }
    }

    /// An analytics sink that drops everything.
    pub fn disabled() -> Self {
        Self { endpoint: None }
    }

    /// Parse the configured endpoint. An invalid URL disables analytics.
    pub fn from_config(analytics_url: Option<&str>) -> Self {
        let endpoint = analytics_url.and_then(|raw| match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                log::warn!("Ignoring invalid analytics URL {:?}: {}", raw, e);
                None
            }
        });
        Self { endpoint }
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Send analytics events to the server.
    ///
    /// Fire-and-forget: returns immediately and sends in the background.
    pub fn send_events(&self, events: Vec<AnalyticsEvent>) {
        if events.is_empty() {
            return;
        }

        for event in &events {
            log::debug!("[analytics] {}", event.path());
        }

        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("Analytics skipped (no async runtime)");
            return;
        };

        let payload = AnalyticsPayload {
            client: concat!("matl-client/", env!("CARGO_PKG_VERSION")),
            events,
        };

        runtime.spawn(async move {
            send_payload(endpoint, payload).await;
        });
    }

    /// Send a single event (convenience wrapper).
    pub fn send_event(&self, event: AnalyticsEvent) {
        self.send_events(vec![event]);
    }
}

async fn send_payload(endpoint: Url, payload: AnalyticsPayload) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            log::debug!("Failed to create HTTP client for analytics: {}", e);
            return;
        }
    };

    match client.post(endpoint).json(&payload).send().await {
        Ok(response) => {
            if response.status().is_success() {
                log::debug!("Analytics sent successfully");
            } else {
                log::debug!("Analytics server returned {}", response.status());
            }
        }
        Err(e) => {
            // Expected when offline
            log::debug!("Failed to send analytics: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analytics_event_new() {
        let event = AnalyticsEvent::new("general", "workflow");
        assert_eq!(event.category, "general");
        assert!(event.timestamp.is_some());
        assert!(event.label.is_none());
        assert_eq!(event.path(), "general/workflow");
    }

    #[test]
    fn test_event_paths() {
        assert_eq!(
            AnalyticsEvent::from_triple(JOB_SUBMITTED).path(),
            "general/workflow/Job Submitted"
        );
        assert_eq!(
            AnalyticsEvent::from_triple(SUBMIT_FAILED).path(),
            "errors/error/Submit failed"
        );
    }

    #[test]
    fn test_from_config() {
        assert!(!Analytics::from_config(None).is_enabled());
        assert!(!Analytics::from_config(Some("::nope")).is_enabled());
        assert!(Analytics::from_config(Some("http://localhost:1/events")).is_enabled());
    }

    #[test]
    fn test_disabled_send_outside_runtime_is_noop() {
        Analytics::disabled().send_event(AnalyticsEvent::new("a", "b"));
        Analytics::from_config(Some("http://localhost:1/events"))
            .send_event(AnalyticsEvent::new("a", "b"));
    }
}
