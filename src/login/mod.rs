//! One end-to-end login attempt.
//!
//! [`LoginRunner::run`] opens a driver session, fills the form (found
//! automatically or described by a custom script), then checks that the
//! browser ends up on the success URL. Every outcome, including driver
//! errors and panics, is classified into a [`LoginOutcome`]; nothing
//! escapes, and the session is disconnected on every path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::LoginConfig;
use crate::driver::{CapabilityDriver, DriverError, DriverFactory};
use crate::finder::LoginFormFinder;
use crate::model::{Credentials, Locators, LoginStatus, Site};
use crate::script::{Interpreter, Script, ScriptStopped, DEFAULT_LOGIN_SCRIPT};

/// Bounds for every wait inside an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginTiming {
    pub discovery_timeout: Duration,
    pub discovery_interval: Duration,
    pub success_timeout: Duration,
    pub success_poll: Duration,
    pub settle: Duration,
    /// Upper bound on any single script `wait`.
    pub max_wait: Duration,
}

impl Default for LoginTiming {
    fn default() -> Self {
        Self::from(&LoginConfig::default())
    }
}

impl From<&LoginConfig> for LoginTiming {
    fn from(config: &LoginConfig) -> Self {
        Self {
            discovery_timeout: Duration::from_secs(config.discovery_timeout_secs),
            discovery_interval: Duration::from_secs(config.discovery_interval_secs),
            success_timeout: Duration::from_secs(config.success_timeout_secs),
            success_poll: Duration::from_millis(config.success_poll_ms),
            settle: Duration::from_millis(config.settle_ms),
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }
}

/// What to log into.
#[derive(Debug, Clone, Copy)]
pub struct LoginRequest<'a> {
    pub url: &'a str,
    pub success_url: &'a str,
    pub credentials: &'a Credentials,
    pub custom_script: Option<&'a str>,
    /// Capture a screenshot under this id before classifying.
    pub screenshot_id: Option<&'a str>,
}

impl<'a> LoginRequest<'a> {
    pub fn for_site(site: &'a Site, screenshot_id: Option<&'a str>) -> Self {
        Self {
            url: &site.url,
            success_url: &site.success_url,
            credentials: &site.credentials,
            custom_script: site.custom_script.as_deref(),
            screenshot_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginOutcome {
    pub status: LoginStatus,
    pub message: Option<String>,
}

impl LoginOutcome {
    pub fn new(status: LoginStatus, message: Option<String>) -> Self {
        Self { status, message }
    }

    pub fn unknown() -> Self {
        Self::new(LoginStatus::UnknownExecutionError, None)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl From<ScriptStopped> for LoginOutcome {
    fn from(stop: ScriptStopped) -> Self {
        Self::new(stop.status, stop.message)
    }
}

/// True when the URLs are equal or differ by exactly one trailing slash.
pub fn urls_match(a: &str, b: &str) -> bool {
    a == b || a.strip_suffix('/') == Some(b) || b.strip_suffix('/') == Some(a)
}

/// Runs login attempts against sessions from a [`DriverFactory`].
#[derive(Clone)]
pub struct LoginRunner {
    drivers: Arc<dyn DriverFactory>,
    timing: LoginTiming,
}

impl LoginRunner {
    pub fn new(drivers: Arc<dyn DriverFactory>, timing: LoginTiming) -> Self {
        Self { drivers, timing }
    }

    pub fn timing(&self) -> &LoginTiming {
        &self.timing
    }

    pub async fn run(&self, request: &LoginRequest<'_>) -> LoginOutcome {
        let driver = match self.drivers.connect().await {
            Ok(driver) => driver,
            Err(e) => {
                tracing::warn!(url = %request.url, error = %e, "could not open a browser session");
                return LoginOutcome::unknown();
            }
        };

        let attempt = AssertUnwindSafe(self.attempt(driver.as_ref(), request))
            .catch_unwind()
            .await;
        let outcome = match attempt {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(url = %request.url, error = %e, "login attempt failed unexpectedly");
                LoginOutcome::unknown()
            }
            Err(_) => {
                tracing::error!(url = %request.url, "login attempt panicked");
                LoginOutcome::unknown()
            }
        };

        if let Err(e) = driver.disconnect().await {
            tracing::warn!(error = %e, "failed to disconnect browser session");
        }
        tracing::info!(url = %request.url, status = %outcome.status, "login attempt finished");
        outcome
    }

    async fn attempt(
        &self,
        driver: &dyn CapabilityDriver,
        request: &LoginRequest<'_>,
    ) -> Result<LoginOutcome, DriverError> {
        driver.open_url(request.url).await?;
        dismiss_challenge(driver).await;

        let stopped = match request.custom_script {
            None => {
                let locators = match self.discover(driver).await? {
                    Ok(locators) => locators,
                    Err(status) => {
                        return Ok(self.classify(driver, request, LoginOutcome::new(status, None)).await)
                    }
                };
                self.interpreter(driver, &locators, request)
                    .execute_source(DEFAULT_LOGIN_SCRIPT)
                    .await
            }
            Some(source) => {
                let script = match Script::parse(source) {
                    Ok(script) => script,
                    Err(e) => {
                        tracing::warn!(url = %request.url, error = %e, "custom login script does not parse");
                        let outcome =
                            LoginOutcome::new(LoginStatus::UnknownExecutionError, Some(e.to_string()));
                        return Ok(self.classify(driver, request, outcome).await);
                    }
                };
                let locators = if script.needs_automatic_locators() {
                    LoginFormFinder::new(driver).find().await?
                } else {
                    Locators::default()
                };
                self.interpreter(driver, &locators, request).execute(&script).await
            }
        };
        if let Err(stop) = stopped {
            return Ok(self.classify(driver, request, stop.into()).await);
        }

        driver.open_url(request.success_url).await?;
        let deadline = Instant::now() + self.timing.success_timeout;
        let mut current = driver.get_current_url().await?;
        while !urls_match(&current, request.success_url) {
            if Instant::now() >= deadline {
                let message = format!(
                    "Expected URL \"{}\" but the browser stayed on \"{}\".",
                    request.success_url, current
                );
                let outcome = LoginOutcome::new(LoginStatus::SuccessUrlDidNotMatch, Some(message));
                return Ok(self.classify(driver, request, outcome).await);
            }
            tokio::time::sleep(self.timing.success_poll).await;
            dismiss_challenge(driver).await;
            current = driver.get_current_url().await?;
        }

        let outcome = LoginOutcome::new(LoginStatus::Success, None);
        Ok(self.classify(driver, request, outcome).await)
    }

    fn interpreter<'d>(
        &self,
        driver: &'d dyn CapabilityDriver,
        locators: &'d Locators,
        request: &LoginRequest<'d>,
    ) -> Interpreter<'d> {
        Interpreter::new(driver, locators, request.credentials)
            .with_settle(self.timing.settle)
            .with_max_wait(self.timing.max_wait)
    }

    /// Poll the finder until every field is visible or the timeout passes.
    /// On timeout the status names the first field still missing, or
    /// reports that nothing resembling a login form was found at all.
    async fn discover(
        &self,
        driver: &dyn CapabilityDriver,
    ) -> Result<Result<Locators, LoginStatus>, DriverError> {
        let deadline = Instant::now() + self.timing.discovery_timeout;
        loop {
            let locators = LoginFormFinder::new(driver).find().await?;
            if locators.is_complete() {
                return Ok(Ok(locators));
            }
            if Instant::now() >= deadline {
                let status = match locators.first_missing() {
                    Some(field) if !locators.is_empty() => field.not_found_status(),
                    _ => LoginStatus::AutomaticFormDetectionFailed,
                };
                tracing::info!(?locators, %status, "login form not found in time");
                return Ok(Err(status));
            }
            tokio::time::sleep(self.timing.discovery_interval).await;
            dismiss_challenge(driver).await;
        }
    }

    async fn classify(
        &self,
        driver: &dyn CapabilityDriver,
        request: &LoginRequest<'_>,
        outcome: LoginOutcome,
    ) -> LoginOutcome {
        if let Some(id) = request.screenshot_id {
            if let Err(e) = driver.save_screenshot(id).await {
                tracing::warn!(screenshot_id = %id, error = %e, "failed to capture screenshot");
            }
        }
        outcome
    }
}

async fn dismiss_challenge(driver: &dyn CapabilityDriver) {
    if let Err(e) = driver.solve_captcha().await {
        tracing::debug!(error = %e, "challenge dismissal did not succeed");
    }
}
