//! The login scripting language.
//!
//! A script is a flat list of commands, executed in order with no branches,
//! loops or variables:
//!
//! ```text
//! openUrl("https://example.com/login")
//! fillUsername()
//! fillPassword("//input[@id='pw']")
//! fillText('//input[@name="otp"]', '000000')
//! wait(1500)
//! clickSubmitButton()
//! ```
//!
//! `fillUsername`, `fillPassword` and `clickSubmitButton` may omit their
//! locator, in which case the automatically discovered one is used.

pub mod interpreter;
pub mod parser;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::model::Field;

pub use self::interpreter::{Interpreter, ScriptStopped, DEFAULT_MAX_WAIT_MS, DEFAULT_SETTLE_MS};
pub use self::parser::{check_syntax, SyntaxError, MAX_WAIT_MS};

/// Script run when a site has no custom script.
pub const DEFAULT_LOGIN_SCRIPT: &str = "fillUsername()\nfillPassword()\nclickSubmitButton()";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    ClickSubmitButton { locator: Option<String> },
    FillUsername { locator: Option<String> },
    FillPassword { locator: Option<String> },
    FillText { locator: String, value: String },
    ClickButton { locator: String },
    OpenUrl { url: String },
    Wait { ms: u64 },
}

impl Command {
    /// The login field whose automatic locator this command falls back to,
    /// and the explicit locator it was given.
    pub fn default_field(&self) -> Option<(Field, Option<&str>)> {
        match self {
            Command::FillUsername { locator } => Some((Field::Username, locator.as_deref())),
            Command::FillPassword { locator } => Some((Field::Password, locator.as_deref())),
            Command::ClickSubmitButton { locator } => {
                Some((Field::SubmitButton, locator.as_deref()))
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::ClickSubmitButton { .. } => "clickSubmitButton",
            Command::FillUsername { .. } => "fillUsername",
            Command::FillPassword { .. } => "fillPassword",
            Command::FillText { .. } => "fillText",
            Command::ClickButton { .. } => "clickButton",
            Command::OpenUrl { .. } => "openUrl",
            Command::Wait { .. } => "wait",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ClickSubmitButton { locator }
            | Command::FillUsername { locator }
            | Command::FillPassword { locator } => match locator {
                Some(l) => write!(f, "{}({:?})", self.name(), l),
                None => write!(f, "{}()", self.name()),
            },
            Command::FillText { locator, .. } => write!(f, "fillText({locator:?}, ...)"),
            Command::ClickButton { locator } => write!(f, "clickButton({locator:?})"),
            Command::OpenUrl { url } => write!(f, "openUrl({url:?})"),
            Command::Wait { ms } => write!(f, "wait({ms})"),
        }
    }
}

/// A parsed script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Script {
    commands: Vec<Command>,
}

impl Script {
    pub fn parse(source: &str) -> Result<Self, SyntaxError> {
        parser::parse(source).map(|commands| Self { commands })
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// True when some command relies on an automatically found locator.
    pub fn needs_automatic_locators(&self) -> bool {
        self.commands
            .iter()
            .any(|c| matches!(c.default_field(), Some((_, None))))
    }
}

impl FromStr for Script {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Script::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_script_uses_automatic_locators() {
        let script = Script::parse(DEFAULT_LOGIN_SCRIPT).unwrap();
        assert_eq!(script.commands().len(), 3);
        assert!(script.needs_automatic_locators());
    }

    #[test]
    fn test_explicit_locators_need_no_discovery() {
        let script = Script::parse(
            r#"fillUsername("//input[1]") fillPassword("//input[2]") clickButton("//button")"#,
        )
        .unwrap();
        assert!(!script.needs_automatic_locators());
    }

    #[test]
    fn test_display_hides_typed_values() {
        let cmd = Command::FillText {
            locator: "//input".into(),
            value: "secret".into(),
        };
        assert_eq!(cmd.to_string(), r#"fillText("//input", ...)"#);
        assert_eq!(Command::Wait { ms: 5 }.to_string(), "wait(5)");
    }
}
