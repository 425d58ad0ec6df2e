//! Notification hook for finished login attempts.

use tracing::{info, warn};

use crate::model::{ActionHistory, ActionStatus, Site};

/// Receives every finalized [`ActionHistory`] written by the scheduler.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, site: &Site, history: &ActionHistory);
}

/// Reports attempts through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, site: &Site, history: &ActionHistory) {
        let summary = history
            .failure
            .map(|f| f.describe())
            .unwrap_or("Login successful");
        match history.status {
            ActionStatus::Success => info!(
                site_id = site.id,
                site = %site.name,
                history_id = history.id,
                next = ?site.next_schedule,
                "{summary}"
            ),
            _ => warn!(
                site_id = site.id,
                site = %site.name,
                history_id = history.id,
                failure = ?history.failure,
                message = history.message.as_deref().unwrap_or(""),
                screenshot = history.screenshot_id.as_deref().unwrap_or(""),
                "{summary}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Credentials, LoginStatus};
    use crate::policy::SchedulePolicy;
    use chrono::Utc;

    #[tokio::test]
    async fn test_log_notifier_accepts_both_outcomes() {
        let site = Site {
            id: 1,
            name: "forum".into(),
            url: "https://forum.example/login".into(),
            success_url: "https://forum.example/".into(),
            credentials: Credentials::new("alice", "pw"),
            take_screenshot: false,
            paused: false,
            custom_script: None,
            policy: SchedulePolicy::every_days(1),
            next_schedule: None,
            added_at: Utc::now(),
        };
        let mut history = ActionHistory {
            id: 1,
            site_id: 1,
            execution_started: Utc::now(),
            execution_ended: Some(Utc::now()),
            status: ActionStatus::Success,
            failure: None,
            message: None,
            screenshot_id: None,
        };
        LogNotifier.notify(&site, &history).await;

        history.status = ActionStatus::Failed;
        history.failure = Some(LoginStatus::SubmitButtonNotFound);
        LogNotifier.notify(&site, &history).await;
    }
}
