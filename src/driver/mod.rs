//! Browser capability contract.
//!
//! The script interpreter, the form finder and the login orchestrator only
//! ever talk to a [`CapabilityDriver`]. Concrete backends live in the
//! submodules: [`webdriver`] drives a real browser through a W3C WebDriver
//! endpoint, [`page`] serves parsed markup in-process.

pub mod page;
pub mod webdriver;

use thiserror::Error;

pub use self::page::{DriverCall, StaticPageDriver};
pub use self::webdriver::{WebDriverClient, WebDriverFactory};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("element {locator:?} not found on page")]
    ElementNotFound { locator: String },

    #[error("element {locator:?} is not interactable")]
    NotInteractable { locator: String },

    #[error("invalid locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("browser session error: {0}")]
    Session(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    /// True when the failure is about the element a locator points at, as
    /// opposed to the browser session itself.
    pub fn is_locator_failure(&self) -> bool {
        matches!(
            self,
            DriverError::ElementNotFound { .. }
                | DriverError::NotInteractable { .. }
                | DriverError::InvalidLocator { .. }
        )
    }
}

/// One connected browser session.
#[async_trait::async_trait]
pub trait CapabilityDriver: Send + Sync {
    async fn fill_text(&self, locator: &str, value: &str) -> Result<(), DriverError>;

    async fn click_button(&self, locator: &str) -> Result<(), DriverError>;

    async fn open_url(&self, url: &str) -> Result<(), DriverError>;

    /// Pause for `ms` milliseconds.
    async fn wait(&self, ms: u64) -> Result<(), DriverError>;

    async fn get_current_url(&self) -> Result<String, DriverError>;

    async fn get_page_html(&self) -> Result<String, DriverError>;

    /// Visibility needs layout, so only the backend can answer it.
    async fn is_element_visible(&self, locator: &str) -> Result<bool, DriverError>;

    async fn find_element(&self, locator: &str) -> Result<bool, DriverError>;

    async fn save_screenshot(&self, screenshot_id: &str) -> Result<(), DriverError>;

    /// Best-effort attempt to get past an anti-automation challenge.
    async fn solve_captcha(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError>;
}

/// Opens new driver sessions; one session per login attempt.
#[async_trait::async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn CapabilityDriver>, DriverError>;
}
