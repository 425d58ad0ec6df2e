//! Domain records shared by the store, the login engine and the scheduler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::policy::SchedulePolicy;

pub type SiteId = i64;
pub type HistoryId = i64;

/// Login credentials for one site. The password is wiped from memory on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// A configured login target.
#[derive(Debug, Clone, Serialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub url: String,
    pub success_url: String,
    #[serde(skip)]
    pub credentials: Credentials,
    pub take_screenshot: bool,
    pub paused: bool,
    pub custom_script: Option<String>,
    pub policy: SchedulePolicy,
    pub next_schedule: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
}

/// Input for creating a site.
#[derive(Debug, Clone)]
pub struct NewSite {
    pub name: String,
    pub url: String,
    pub success_url: String,
    pub credentials: Credentials,
    pub take_screenshot: bool,
    pub paused: bool,
    pub custom_script: Option<String>,
    pub policy: SchedulePolicy,
}

/// Partial edit of a site. `None` leaves a field untouched; the script uses
/// a nested option so it can be cleared.
#[derive(Debug, Clone, Default)]
pub struct SiteUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub success_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub take_screenshot: Option<bool>,
    pub custom_script: Option<Option<String>>,
    pub policy: Option<SchedulePolicy>,
}

/// Lifecycle state of one login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    InProgress,
    Success,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::InProgress => "IN_PROGRESS",
            ActionStatus::Success => "SUCCESS",
            ActionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "IN_PROGRESS" => Some(ActionStatus::InProgress),
            "SUCCESS" => Some(ActionStatus::Success),
            "FAILED" => Some(ActionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionStatus::InProgress)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome classification of a login attempt.
///
/// Everything except `Success` doubles as the failure detail code stored on
/// a FAILED history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginStatus {
    Success,
    AutomaticFormDetectionFailed,
    UsernameFieldNotFound,
    PasswordFieldNotFound,
    PinFieldNotFound,
    SubmitButtonNotFound,
    ButtonNotFound,
    TextFieldNotFound,
    SuccessUrlDidNotMatch,
    UnknownExecutionError,
}

impl LoginStatus {
    pub const ALL: [LoginStatus; 10] = [
        LoginStatus::Success,
        LoginStatus::AutomaticFormDetectionFailed,
        LoginStatus::UsernameFieldNotFound,
        LoginStatus::PasswordFieldNotFound,
        LoginStatus::PinFieldNotFound,
        LoginStatus::SubmitButtonNotFound,
        LoginStatus::ButtonNotFound,
        LoginStatus::TextFieldNotFound,
        LoginStatus::SuccessUrlDidNotMatch,
        LoginStatus::UnknownExecutionError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoginStatus::Success => "SUCCESS",
            LoginStatus::AutomaticFormDetectionFailed => "AUTOMATIC_FORM_DETECTION_FAILED",
            LoginStatus::UsernameFieldNotFound => "USERNAME_FIELD_NOT_FOUND",
            LoginStatus::PasswordFieldNotFound => "PASSWORD_FIELD_NOT_FOUND",
            LoginStatus::PinFieldNotFound => "PIN_FIELD_NOT_FOUND",
            LoginStatus::SubmitButtonNotFound => "SUBMIT_BUTTON_NOT_FOUND",
            LoginStatus::ButtonNotFound => "BUTTON_NOT_FOUND",
            LoginStatus::TextFieldNotFound => "TEXT_FIELD_NOT_FOUND",
            LoginStatus::SuccessUrlDidNotMatch => "SUCCESS_URL_DID_NOT_MATCH",
            LoginStatus::UnknownExecutionError => "UNKNOWN_EXECUTION_ERROR",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == code)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LoginStatus::Success)
    }

    /// Human readable explanation, used in notifications and CLI output.
    pub fn describe(&self) -> &'static str {
        match self {
            LoginStatus::Success => "Login successful",
            LoginStatus::AutomaticFormDetectionFailed => "Automatic form detection failed",
            LoginStatus::UsernameFieldNotFound => "Username field not found",
            LoginStatus::PasswordFieldNotFound => "Password field not found",
            LoginStatus::PinFieldNotFound => "PIN field not found",
            LoginStatus::SubmitButtonNotFound => "Submit button not found",
            LoginStatus::ButtonNotFound => "Button not found",
            LoginStatus::TextFieldNotFound => "Text field not found",
            LoginStatus::SuccessUrlDidNotMatch => {
                "The success url did not match after login attempt"
            }
            LoginStatus::UnknownExecutionError => "An unknown error occurred while executing task",
        }
    }
}

impl fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight or terminal record of a login attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionHistory {
    pub id: HistoryId,
    pub site_id: SiteId,
    pub execution_started: DateTime<Utc>,
    pub execution_ended: Option<DateTime<Utc>>,
    pub status: ActionStatus,
    pub failure: Option<LoginStatus>,
    pub message: Option<String>,
    pub screenshot_id: Option<String>,
}

/// Message recorded on history rows entered by the operator.
pub const MANUAL_LOGIN: &str = "Logged in manually";

/// A history row to insert.
#[derive(Debug, Clone)]
pub struct NewHistory {
    pub execution_started: DateTime<Utc>,
    pub execution_ended: Option<DateTime<Utc>>,
    pub status: ActionStatus,
    pub failure: Option<LoginStatus>,
    pub message: Option<String>,
    pub screenshot_id: Option<String>,
}

impl NewHistory {
    /// A scheduler-created row at the start of an attempt.
    pub fn in_progress(started: DateTime<Utc>, screenshot_id: Option<String>) -> Self {
        Self {
            execution_started: started,
            execution_ended: None,
            status: ActionStatus::InProgress,
            failure: None,
            message: None,
            screenshot_id,
        }
    }

    /// A terminal row for an attempt that never got its own record.
    /// The operator logged in by hand.
    pub fn manual(now: DateTime<Utc>) -> Self {
        Self {
            execution_started: now,
            execution_ended: Some(now),
            status: ActionStatus::Success,
            failure: None,
            message: Some(MANUAL_LOGIN.to_string()),
            screenshot_id: None,
        }
    }

    pub fn crashed(started: DateTime<Utc>, ended: DateTime<Utc>, message: Option<String>) -> Self {
        Self {
            execution_started: started,
            execution_ended: Some(ended),
            status: ActionStatus::Failed,
            failure: Some(LoginStatus::UnknownExecutionError),
            message,
            screenshot_id: None,
        }
    }
}

/// Terminal state written onto an IN_PROGRESS row.
#[derive(Debug, Clone)]
pub struct FinishHistory {
    pub status: ActionStatus,
    pub failure: Option<LoginStatus>,
    pub message: Option<String>,
    pub screenshot_id: Option<String>,
}

impl FinishHistory {
    pub fn from_outcome(status: LoginStatus, message: Option<String>, screenshot_id: Option<String>) -> Self {
        if status.is_success() {
            Self {
                status: ActionStatus::Success,
                failure: None,
                message,
                screenshot_id,
            }
        } else {
            Self {
                status: ActionStatus::Failed,
                failure: Some(status),
                message,
                screenshot_id,
            }
        }
    }
}

/// Which login form field a locator or failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Username,
    Password,
    SubmitButton,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Username, Field::Password, Field::SubmitButton];

    pub fn not_found_status(&self) -> LoginStatus {
        match self {
            Field::Username => LoginStatus::UsernameFieldNotFound,
            Field::Password => LoginStatus::PasswordFieldNotFound,
            Field::SubmitButton => LoginStatus::SubmitButtonNotFound,
        }
    }
}

/// Independently optional locators for the three login fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locators {
    pub username: Option<String>,
    pub password: Option<String>,
    pub submit_button: Option<String>,
}

impl Locators {
    pub fn get(&self, field: Field) -> Option<&str> {
        match field {
            Field::Username => self.username.as_deref(),
            Field::Password => self.password.as_deref(),
            Field::SubmitButton => self.submit_button.as_deref(),
        }
    }

    pub fn set(&mut self, field: Field, locator: Option<String>) {
        match field {
            Field::Username => self.username = locator,
            Field::Password => self.password = locator,
            Field::SubmitButton => self.submit_button = locator,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.first_missing().is_none()
    }

    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_none())
    }

    /// First field without a locator, in username, password, submit order.
    pub fn first_missing(&self) -> Option<Field> {
        Field::ALL.into_iter().find(|f| self.get(*f).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip_through_text() {
        for status in LoginStatus::ALL {
            assert_eq!(LoginStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LoginStatus::parse("NOPE"), None);
        assert_eq!(ActionStatus::parse("IN_PROGRESS"), Some(ActionStatus::InProgress));
    }

    #[test]
    fn test_serde_uses_screaming_codes() {
        let json = serde_json::to_string(&LoginStatus::SuccessUrlDidNotMatch).unwrap();
        assert_eq!(json, "\"SUCCESS_URL_DID_NOT_MATCH\"");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter2");
        let dbg = format!("{:?}", creds);
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_finish_from_outcome() {
        let ok = FinishHistory::from_outcome(LoginStatus::Success, None, None);
        assert_eq!(ok.status, ActionStatus::Success);
        assert!(ok.failure.is_none());

        let failed = FinishHistory::from_outcome(LoginStatus::ButtonNotFound, Some("x".into()), None);
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(failed.failure, Some(LoginStatus::ButtonNotFound));
    }

    #[test]
    fn test_locators_first_missing_order() {
        let mut locators = Locators::default();
        assert!(locators.is_empty());
        assert_eq!(locators.first_missing(), Some(Field::Username));

        locators.set(Field::Username, Some("/html/body/input".into()));
        assert_eq!(locators.first_missing(), Some(Field::Password));

        locators.set(Field::Password, Some("/html/body/input[2]".into()));
        locators.set(Field::SubmitButton, Some("/html/body/button".into()));
        assert!(locators.is_complete());
    }
}
