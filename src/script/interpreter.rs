//! Sequential executor for parsed scripts.
//!
//! Commands run strictly in order and the first failure stops the script.
//! Only the [`CapabilityDriver`] contract is used, never a concrete browser.

use std::time::Duration;

use thiserror::Error;

use super::{Command, Script};
use crate::driver::{CapabilityDriver, DriverError};
use crate::model::{Credentials, Field, Locators, LoginStatus};

/// Pause after each fill or click so the page can react.
pub const DEFAULT_SETTLE_MS: u64 = 500;

/// Default cap on a single script `wait`.
pub const DEFAULT_MAX_WAIT_MS: u64 = 60_000;

/// Why a script did not run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script stopped: {status}")]
pub struct ScriptStopped {
    pub status: LoginStatus,
    pub message: Option<String>,
}

impl ScriptStopped {
    pub fn new(status: LoginStatus, message: Option<String>) -> Self {
        Self { status, message }
    }

    fn unknown() -> Self {
        Self::new(LoginStatus::UnknownExecutionError, None)
    }
}

pub struct Interpreter<'a> {
    driver: &'a dyn CapabilityDriver,
    locators: &'a Locators,
    credentials: &'a Credentials,
    settle: Duration,
    max_wait_ms: u64,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        driver: &'a dyn CapabilityDriver,
        locators: &'a Locators,
        credentials: &'a Credentials,
    ) -> Self {
        Self {
            driver,
            locators,
            credentials,
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Longer `wait` commands are shortened to `max`.
    pub fn with_max_wait(mut self, max: Duration) -> Self {
        self.max_wait_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Parse and run `source`. A script that does not parse stops with an
    /// unknown execution error carrying the diagnostic.
    pub async fn execute_source(&self, source: &str) -> Result<(), ScriptStopped> {
        let script = Script::parse(source).map_err(|e| {
            tracing::warn!(error = %e, "stored login script does not parse");
            ScriptStopped::new(LoginStatus::UnknownExecutionError, Some(e.to_string()))
        })?;
        self.execute(&script).await
    }

    pub async fn execute(&self, script: &Script) -> Result<(), ScriptStopped> {
        for (step, command) in script.commands().iter().enumerate() {
            tracing::debug!(step, command = %command, "running script command");
            self.run(command).await?;
        }
        Ok(())
    }

    async fn run(&self, command: &Command) -> Result<(), ScriptStopped> {
        if let Some((field, explicit)) = command.default_field() {
            let locator = explicit
                .or_else(|| self.locators.get(field))
                .ok_or_else(|| ScriptStopped::new(field.not_found_status(), None))?;
            let result = match field {
                Field::Username => self.driver.fill_text(locator, &self.credentials.username).await,
                Field::Password => self.driver.fill_text(locator, &self.credentials.password).await,
                Field::SubmitButton => self.driver.click_button(locator).await,
            };
            return self.settled(result, locator, field.not_found_status()).await;
        }

        match command {
            Command::FillText { locator, value } => {
                let result = self.driver.fill_text(locator, value).await;
                self.settled(result, locator, LoginStatus::TextFieldNotFound).await
            }
            Command::ClickButton { locator } => {
                let result = self.driver.click_button(locator).await;
                self.settled(result, locator, LoginStatus::ButtonNotFound).await
            }
            Command::OpenUrl { url } => self.driver.open_url(url).await.map_err(unexpected),
            Command::Wait { ms } => {
                if *ms > self.max_wait_ms {
                    tracing::warn!(requested = *ms, max = self.max_wait_ms, "script wait shortened");
                }
                self.driver
                    .wait((*ms).min(self.max_wait_ms))
                    .await
                    .map_err(unexpected)
            }
            Command::FillUsername { .. }
            | Command::FillPassword { .. }
            | Command::ClickSubmitButton { .. } => Ok(()),
        }
    }

    async fn settled(
        &self,
        result: Result<(), DriverError>,
        locator: &str,
        not_found: LoginStatus,
    ) -> Result<(), ScriptStopped> {
        match result {
            Ok(()) => {
                tokio::time::sleep(self.settle).await;
                Ok(())
            }
            Err(e) if e.is_locator_failure() => {
                tracing::debug!(%locator, error = %e, "script command could not reach element");
                Err(ScriptStopped::new(
                    not_found,
                    Some(format!("XPath \"{locator}\" not found on page.")),
                ))
            }
            Err(e) => Err(unexpected(e)),
        }
    }
}

fn unexpected(e: DriverError) -> ScriptStopped {
    tracing::warn!(error = %e, "script command failed");
    ScriptStopped::unknown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, StaticPageDriver};

    const PAGE: &str = r#"<form>
        <input name="user"><input name="pass" type="password"><button>Go</button>
    </form>"#;

    fn locators() -> Locators {
        Locators {
            username: Some("//input[@name='user']".into()),
            password: Some("//input[@name='pass']".into()),
            submit_button: Some("//button".into()),
        }
    }

    async fn run(driver: &StaticPageDriver, locators: &Locators, source: &str) -> Result<(), ScriptStopped> {
        let creds = Credentials::new("alice", "hunter2");
        driver.open_url("https://site/login").await.unwrap();
        Interpreter::new(driver, locators, &creds)
            .with_settle(Duration::ZERO)
            .execute_source(source)
            .await
    }

    fn after_open(journal: Vec<DriverCall>) -> Vec<DriverCall> {
        journal.into_iter().skip(1).collect()
    }

    #[tokio::test]
    async fn test_default_commands_in_order() {
        let driver = StaticPageDriver::new(PAGE);
        run(&driver, &locators(), "fillUsername()fillPassword()clickSubmitButton()")
            .await
            .unwrap();

        assert_eq!(
            after_open(driver.journal().await),
            vec![
                DriverCall::FillText {
                    locator: "//input[@name='user']".into(),
                    value: "alice".into()
                },
                DriverCall::FillText {
                    locator: "//input[@name='pass']".into(),
                    value: "hunter2".into()
                },
                DriverCall::ClickButton("//button".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_commands() {
        let driver = StaticPageDriver::new(PAGE).with_missing("//input[@name='pass']");
        let err = run(&driver, &locators(), "fillUsername() fillPassword() clickSubmitButton() wait(5)")
            .await
            .unwrap_err();

        assert_eq!(err.status, LoginStatus::PasswordFieldNotFound);
        assert_eq!(
            err.message.as_deref(),
            Some(r#"XPath "//input[@name='pass']" not found on page."#)
        );
        let journal = after_open(driver.journal().await);
        assert_eq!(journal.len(), 2);
        assert!(!journal.iter().any(|c| matches!(c, DriverCall::ClickButton(_) | DriverCall::Wait(_))));
    }

    #[tokio::test]
    async fn test_missing_default_locator_never_reaches_driver() {
        let driver = StaticPageDriver::new(PAGE);
        let partial = Locators {
            submit_button: None,
            ..locators()
        };
        let err = run(&driver, &partial, "clickSubmitButton()").await.unwrap_err();
        assert_eq!(err, ScriptStopped::new(LoginStatus::SubmitButtonNotFound, None));
        assert!(after_open(driver.journal().await).is_empty());
    }

    #[tokio::test]
    async fn test_explicit_locator_overrides_default() {
        let driver = StaticPageDriver::new(PAGE);
        run(&driver, &Locators::default(), "fillUsername(\"//input[1]\")")
            .await
            .unwrap();
        assert_eq!(driver.value_of("//input[1]").await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_generic_commands_map_their_own_statuses() {
        let driver = StaticPageDriver::new(PAGE);
        let err = run(&driver, &locators(), "fillText('//textarea', 'x')").await.unwrap_err();
        assert_eq!(err.status, LoginStatus::TextFieldNotFound);

        let err = run(&driver, &locators(), "wait(10) clickButton('//a')").await.unwrap_err();
        assert_eq!(err.status, LoginStatus::ButtonNotFound);
    }

    #[tokio::test]
    async fn test_session_errors_are_unknown_without_message() {
        let driver = StaticPageDriver::new(PAGE).with_broken("//button");
        let err = run(&driver, &locators(), "clickSubmitButton()").await.unwrap_err();
        assert_eq!(err, ScriptStopped::new(LoginStatus::UnknownExecutionError, None));
    }

    #[tokio::test]
    async fn test_long_waits_are_capped() {
        let driver = StaticPageDriver::new(PAGE);
        let creds = Credentials::new("alice", "hunter2");
        Interpreter::new(&driver, &locators(), &creds)
            .with_settle(Duration::ZERO)
            .with_max_wait(Duration::from_millis(250))
            .execute_source("wait(3600000)\nwait(40)")
            .await
            .unwrap();

        assert_eq!(
            driver.journal().await,
            [DriverCall::Wait(250), DriverCall::Wait(40)]
        );
    }

    #[tokio::test]
    async fn test_unparsable_script_carries_diagnostic() {
        let driver = StaticPageDriver::new(PAGE);
        let err = run(&driver, &locators(), "fillUsername(").await.unwrap_err();
        assert_eq!(err.status, LoginStatus::UnknownExecutionError);
        assert!(err.message.unwrap().contains("line 1"));
    }
}
