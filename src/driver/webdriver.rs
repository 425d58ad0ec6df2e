//! W3C WebDriver backend (geckodriver, chromedriver).
//!
//! Each [`WebDriverClient`] owns one remote session. Elements are always
//! located by XPath; screenshots are decoded from base64 and written as PNG
//! files named after the screenshot id.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use reqwest::{Client, Method};
use serde_json::{json, Value};

use super::{CapabilityDriver, DriverError, DriverFactory};
use crate::config::DriverConfig;

/// Key under which a WebDriver element reference is returned.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// A failed wire exchange, before it is attributed to a locator.
#[derive(Debug)]
enum WireFailure {
    Protocol { error: String, message: String },
    Transport(anyhow::Error),
}

impl WireFailure {
    fn into_driver_error(self, locator: Option<&str>) -> DriverError {
        match (self, locator) {
            (WireFailure::Transport(e), _) => DriverError::Other(e),
            (WireFailure::Protocol { error, message }, Some(locator)) => match error.as_str() {
                "no such element" | "stale element reference" => DriverError::ElementNotFound {
                    locator: locator.to_string(),
                },
                "element not interactable" | "element click intercepted" => {
                    DriverError::NotInteractable {
                        locator: locator.to_string(),
                    }
                }
                "invalid selector" => DriverError::InvalidLocator {
                    locator: locator.to_string(),
                    reason: message,
                },
                _ => DriverError::Session(format!("{error}: {message}")),
            },
            (WireFailure::Protocol { error, message }, None) => {
                DriverError::Session(format!("{error}: {message}"))
            }
        }
    }
}

async fn exchange(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, WireFailure> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("WebDriver request to {url} failed"))
        .map_err(WireFailure::Transport)?;
    let ok = response.status().is_success();
    let payload: Value = response
        .json()
        .await
        .context("WebDriver returned a non-JSON body")
        .map_err(WireFailure::Transport)?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if ok {
        return Ok(value);
    }
    Err(WireFailure::Protocol {
        error: value["error"].as_str().unwrap_or("unknown error").to_string(),
        message: value["message"].as_str().unwrap_or_default().to_string(),
    })
}

fn capabilities(browser: &str, headless: bool) -> Value {
    let mut caps = json!({ "browserName": browser });
    if headless {
        let (key, flag) = match browser {
            "chrome" | "chromium" => ("goog:chromeOptions", "--headless=new"),
            _ => ("moz:firefoxOptions", "-headless"),
        };
        caps[key] = json!({ "args": [flag] });
    }
    json!({ "capabilities": { "alwaysMatch": caps } })
}

/// Opens one WebDriver session per login attempt.
#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    client: Client,
    endpoint: String,
    browser: String,
    headless: bool,
    screenshot_dir: PathBuf,
}

impl WebDriverFactory {
    pub fn new(config: &DriverConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build WebDriver HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.webdriver_url.trim_end_matches('/').to_string(),
            browser: config.browser.clone(),
            headless: config.headless,
            screenshot_dir: config.screenshot_dir.clone(),
        })
    }
}

#[async_trait::async_trait]
impl DriverFactory for WebDriverFactory {
    async fn connect(&self) -> Result<Box<dyn CapabilityDriver>, DriverError> {
        let url = format!("{}/session", self.endpoint);
        let value = exchange(
            &self.client,
            Method::POST,
            &url,
            Some(capabilities(&self.browser, self.headless)),
        )
        .await
        .map_err(|f| f.into_driver_error(None))?;

        let session_id = value["sessionId"]
            .as_str()
            .ok_or_else(|| DriverError::Session("new session response carried no id".into()))?;
        tracing::debug!(%session_id, browser = %self.browser, "WebDriver session opened");

        Ok(Box::new(WebDriverClient {
            client: self.client.clone(),
            base: format!("{url}/{session_id}"),
            screenshot_dir: self.screenshot_dir.clone(),
        }))
    }
}

/// One live WebDriver session.
#[derive(Debug)]
pub struct WebDriverClient {
    client: Client,
    base: String,
    screenshot_dir: PathBuf,
}

impl WebDriverClient {
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, WireFailure> {
        exchange(&self.client, method, &format!("{}{}", self.base, path), body).await
    }

    async fn element(&self, locator: &str) -> Result<String, DriverError> {
        let value = self
            .call(
                Method::POST,
                "/element",
                Some(json!({ "using": "xpath", "value": locator })),
            )
            .await
            .map_err(|f| f.into_driver_error(Some(locator)))?;
        value[ELEMENT_KEY]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::ElementNotFound {
                locator: locator.to_string(),
            })
    }

    async fn elements(&self, locator: &str) -> Result<Vec<String>, DriverError> {
        let value = self
            .call(
                Method::POST,
                "/elements",
                Some(json!({ "using": "xpath", "value": locator })),
            )
            .await
            .map_err(|f| f.into_driver_error(Some(locator)))?;
        Ok(value
            .as_array()
            .map(|found| {
                found
                    .iter()
                    .filter_map(|e| e[ELEMENT_KEY].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn on_element(&self, locator: &str, action: &str, body: Value) -> Result<Value, DriverError> {
        let id = self.element(locator).await?;
        self.call(Method::POST, &format!("/element/{id}/{action}"), Some(body))
            .await
            .map_err(|f| f.into_driver_error(Some(locator)))
    }
}

#[async_trait::async_trait]
impl CapabilityDriver for WebDriverClient {
    async fn fill_text(&self, locator: &str, value: &str) -> Result<(), DriverError> {
        self.on_element(locator, "clear", json!({})).await?;
        self.on_element(locator, "value", json!({ "text": value })).await?;
        Ok(())
    }

    async fn click_button(&self, locator: &str) -> Result<(), DriverError> {
        self.on_element(locator, "click", json!({})).await?;
        Ok(())
    }

    async fn open_url(&self, url: &str) -> Result<(), DriverError> {
        self.call(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map_err(|f| f.into_driver_error(None))?;
        Ok(())
    }

    async fn wait(&self, ms: u64) -> Result<(), DriverError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn get_current_url(&self) -> Result<String, DriverError> {
        let value = self
            .call(Method::GET, "/url", None)
            .await
            .map_err(|f| f.into_driver_error(None))?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn get_page_html(&self) -> Result<String, DriverError> {
        let value = self
            .call(Method::GET, "/source", None)
            .await
            .map_err(|f| f.into_driver_error(None))?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn is_element_visible(&self, locator: &str) -> Result<bool, DriverError> {
        let Some(id) = self.elements(locator).await?.into_iter().next() else {
            return Ok(false);
        };
        let shown = self
            .call(Method::GET, &format!("/element/{id}/displayed"), None)
            .await
            .map_err(|f| f.into_driver_error(Some(locator)))?;
        Ok(shown.as_bool().unwrap_or(false))
    }

    async fn find_element(&self, locator: &str) -> Result<bool, DriverError> {
        Ok(!self.elements(locator).await?.is_empty())
    }

    async fn save_screenshot(&self, screenshot_id: &str) -> Result<(), DriverError> {
        let value = self
            .call(Method::GET, "/screenshot", None)
            .await
            .map_err(|f| f.into_driver_error(None))?;
        let png = base64::engine::general_purpose::STANDARD
            .decode(value.as_str().unwrap_or_default())
            .context("screenshot payload is not base64")?;

        tokio::fs::create_dir_all(&self.screenshot_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.screenshot_dir.display()))?;
        let path = self.screenshot_dir.join(format!("{screenshot_id}.png"));
        tokio::fs::write(&path, png)
            .await
            .with_context(|| format!("Failed to write screenshot {}", path.display()))?;
        tracing::debug!(path = %path.display(), "screenshot saved");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.call(Method::DELETE, "", None)
            .await
            .map_err(|f| f.into_driver_error(None))?;
        tracing::debug!(session = %self.base, "WebDriver session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(error: &str) -> WireFailure {
        WireFailure::Protocol {
            error: error.to_string(),
            message: "details".to_string(),
        }
    }

    #[test]
    fn test_element_errors_become_locator_failures() {
        let err = protocol("no such element").into_driver_error(Some("//input"));
        assert!(matches!(err, DriverError::ElementNotFound { ref locator } if locator == "//input"));

        let err = protocol("element not interactable").into_driver_error(Some("//input"));
        assert!(matches!(err, DriverError::NotInteractable { .. }));

        let err = protocol("invalid selector").into_driver_error(Some("//input["));
        assert!(err.is_locator_failure());
    }

    #[test]
    fn test_session_errors_are_not_locator_failures() {
        let err = protocol("invalid session id").into_driver_error(Some("//input"));
        assert!(matches!(err, DriverError::Session(_)));
        assert!(!protocol("no such element").into_driver_error(None).is_locator_failure());
    }

    #[test]
    fn test_headless_capabilities() {
        let caps = capabilities("firefox", true);
        assert_eq!(
            caps["capabilities"]["alwaysMatch"]["moz:firefoxOptions"]["args"][0],
            "-headless"
        );

        let caps = capabilities("chrome", false);
        assert_eq!(caps["capabilities"]["alwaysMatch"]["browserName"], "chrome");
        assert!(caps["capabilities"]["alwaysMatch"].get("goog:chromeOptions").is_none());
    }
}
