//! Tokenizer and recursive-descent parser for login scripts.
//!
//! Strings take single or double quotes with Python-style escapes: `\\`,
//! quotes, `\n \t \r \a \b \f \v`, octal `\ooo`, `\xhh`, `\uhhhh` and
//! `\Uhhhhhhhh`. Named `\N{...}` escapes and line continuations inside a
//! string are rejected. Any other escape is kept as written.

use thiserror::Error;

use super::Command;

/// Where and why a script failed to parse. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Longest `wait` a script may ask for, in milliseconds.
pub const MAX_WAIT_MS: u64 = 3_600_000;

const COMMAND_NAMES: &[&str] = &[
    "clickSubmitButton",
    "fillUsername",
    "fillPassword",
    "fillText",
    "clickButton",
    "openUrl",
    "wait",
];

/// Parse-only validation. Returns a human readable diagnostic for an
/// invalid script and `None` for a valid one.
pub fn check_syntax(source: &str) -> Option<String> {
    parse(source).err().map(|e| e.to_string())
}

pub(crate) fn parse(source: &str) -> Result<Vec<Command>, SyntaxError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser {
        source,
        tokens,
        pos: 0,
    }
    .script()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    LParen,
    RParen,
    Comma,
    Str(String),
    Int(u64),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("`{name}`"),
            Token::LParen => "`(`".to_string(),
            Token::RParen => "`)`".to_string(),
            Token::Comma => "`,`".to_string(),
            Token::Str(_) => "a string".to_string(),
            Token::Int(_) => "an integer".to_string(),
        }
    }
}

fn position(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rsplit('\n')
        .next()
        .map(|l| l.chars().count())
        .unwrap_or(0)
        + 1;
    (line, column)
}

fn error_at(source: &str, offset: usize, message: impl Into<String>) -> SyntaxError {
    let (line, column) = position(source, offset);
    SyntaxError {
        line,
        column,
        message: message.into(),
    }
}

struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, SyntaxError> {
        let mut tokens = Vec::new();
        while let Some(&(offset, c)) = self.chars.peek() {
            let token = match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                    continue;
                }
                '(' => {
                    self.chars.next();
                    Token::LParen
                }
                ')' => {
                    self.chars.next();
                    Token::RParen
                }
                ',' => {
                    self.chars.next();
                    Token::Comma
                }
                '\'' | '"' => Token::Str(self.string(offset, c)?),
                c if c.is_ascii_digit() => Token::Int(self.integer(offset)?),
                c if c.is_alphabetic() || c == '_' => Token::Ident(self.ident()),
                other => {
                    return Err(error_at(self.source, offset, format!("unexpected character {other:?}")))
                }
            };
            tokens.push((offset, token));
        }
        Ok(tokens)
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if !keep(c) {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }

    fn ident(&mut self) -> String {
        self.take_while(|c| c.is_alphanumeric() || c == '_')
    }

    fn integer(&mut self, offset: usize) -> Result<u64, SyntaxError> {
        let digits = self.take_while(|c| c.is_ascii_digit());
        digits
            .parse()
            .map_err(|_| error_at(self.source, offset, format!("integer {digits} is out of range")))
    }

    fn string(&mut self, offset: usize, quote: char) -> Result<String, SyntaxError> {
        self.chars.next();
        let mut out = String::new();
        loop {
            let Some((at, c)) = self.chars.next() else {
                return Err(error_at(self.source, offset, "unterminated string"));
            };
            match c {
                '\n' => return Err(error_at(self.source, offset, "unterminated string")),
                c if c == quote => return Ok(out),
                '\\' => self.escape(at, &mut out)?,
                c => out.push(c),
            }
        }
    }

    fn escape(&mut self, at: usize, out: &mut String) -> Result<(), SyntaxError> {
        let Some((_, c)) = self.chars.next() else {
            return Err(error_at(self.source, at, "unterminated string"));
        };
        match c {
            '\\' | '\'' | '"' => out.push(c),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'v' => out.push('\u{0b}'),
            '0'..='7' => {
                let mut value = c.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.chars.next_if(|(_, d)| d.is_digit(8)) {
                        Some((_, d)) => value = value * 8 + d.to_digit(8).unwrap_or(0),
                        None => break,
                    }
                }
                // At most 0o777, always a valid scalar value.
                out.extend(char::from_u32(value));
            }
            'x' | 'u' | 'U' => {
                let width = match c {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let mut hex = String::new();
                for _ in 0..width {
                    match self.chars.next_if(|(_, h)| h.is_ascii_hexdigit()) {
                        Some((_, h)) => hex.push(h),
                        None => break,
                    }
                }
                let decoded = (hex.len() == width)
                    .then(|| u32::from_str_radix(&hex, 16).ok())
                    .flatten()
                    .and_then(char::from_u32)
                    .ok_or_else(|| error_at(self.source, at, format!("invalid \\{c} escape")))?;
                out.push(decoded);
            }
            'N' => {
                return Err(error_at(
                    self.source,
                    at,
                    "named \\N{...} escapes are not supported",
                ))
            }
            '\n' => return Err(error_at(self.source, at, "unterminated string")),
            // Unknown escapes are kept verbatim.
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser<'_> {
    fn script(mut self) -> Result<Vec<Command>, SyntaxError> {
        let mut commands = Vec::new();
        while let Some((offset, token)) = self.next() {
            match token {
                Token::Ident(name) => commands.push(self.command(offset, &name)?),
                other => {
                    return Err(self.error(offset, format!("expected a command, found {}", other.describe())))
                }
            }
        }
        Ok(commands)
    }

    fn command(&mut self, offset: usize, name: &str) -> Result<Command, SyntaxError> {
        if !COMMAND_NAMES.contains(&name) {
            return Err(self.error(
                offset,
                format!("unknown command `{name}`, expected one of {}", COMMAND_NAMES.join(", ")),
            ));
        }
        self.expect(Token::LParen)?;
        let command = match name {
            "clickSubmitButton" => Command::ClickSubmitButton {
                locator: self.optional_string(),
            },
            "fillUsername" => Command::FillUsername {
                locator: self.optional_string(),
            },
            "fillPassword" => Command::FillPassword {
                locator: self.optional_string(),
            },
            "fillText" => {
                let locator = self.string()?;
                self.expect(Token::Comma)?;
                let value = self.string()?;
                Command::FillText { locator, value }
            }
            "clickButton" => Command::ClickButton {
                locator: self.string()?,
            },
            "openUrl" => Command::OpenUrl { url: self.string()? },
            _ => {
                let at = self.offset();
                let ms = self.integer()?;
                if ms > MAX_WAIT_MS {
                    return Err(self.error(
                        at,
                        format!("wait of {ms} ms exceeds the {MAX_WAIT_MS} ms limit"),
                    ));
                }
                Command::Wait { ms }
            }
        };
        self.expect(Token::RParen)?;
        Ok(command)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.source.len(), |(offset, _)| *offset)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn error(&self, offset: usize, message: String) -> SyntaxError {
        error_at(self.source, offset, message)
    }

    fn unexpected(&mut self, wanted: &str) -> SyntaxError {
        match self.next() {
            Some((offset, token)) => {
                self.error(offset, format!("expected {wanted}, found {}", token.describe()))
            }
            None => self.error(self.source.len(), format!("expected {wanted}, found end of script")),
        }
    }

    fn expect(&mut self, wanted: Token) -> Result<(), SyntaxError> {
        if self.peek() == Some(&wanted) {
            self.pos += 1;
            return Ok(());
        }
        Err(self.unexpected(&wanted.describe()))
    }

    fn optional_string(&mut self) -> Option<String> {
        match self.peek() {
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Some(s)
            }
            _ => None,
        }
    }

    fn string(&mut self) -> Result<String, SyntaxError> {
        self.optional_string()
            .ok_or_else(|| self.unexpected("a string argument"))
    }

    fn integer(&mut self) -> Result<u64, SyntaxError> {
        match self.peek() {
            Some(Token::Int(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.unexpected("an integer argument")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(source: &str) -> Command {
        let mut commands = parse(source).unwrap();
        assert_eq!(commands.len(), 1);
        commands.remove(0)
    }

    #[test]
    fn test_valid_scripts_pass() {
        for script in [
            "",
            "  \n\t",
            "fillUsername()",
            "fillUsername()fillPassword()clickSubmitButton()",
            "fillText('//input[@name=\"otp\"]', \"123\")\nwait(250)",
            "openUrl(\"https://example.com\")  clickButton( '//a' )",
            "clickSubmitButton(\"//button\")",
            "wait(007)",
            "wait(3600000)",
        ] {
            assert_eq!(check_syntax(script), None, "{script:?}");
        }
    }

    #[test]
    fn test_invalid_scripts_are_diagnosed() {
        for script in [
            "login()",
            "fillUsername(",
            "fillUsername())",
            "fillUsername('a'",
            "wait('10')",
            "wait(1.5)",
            "wait(-1)",
            "wait()",
            "fillText('//input')",
            "fillText('//input',)",
            "clickButton()",
            "openUrl()",
            "fillUsername('unterminated)",
            "fillUsername('a', 'b')",
            "fillUsername() ; fillPassword()",
            "(",
        ] {
            assert!(check_syntax(script).is_some(), "{script:?} should be rejected");
        }
    }

    #[test]
    fn test_diagnostic_points_at_the_problem() {
        let err = parse("fillUsername()\n  frobnicate()").unwrap_err();
        assert_eq!((err.line, err.column), (2, 3));
        assert!(err.message.contains("frobnicate"));

        let err = parse("wait(").unwrap_err();
        assert!(err.to_string().contains("end of script"));
    }

    #[test]
    fn test_wait_is_bounded() {
        let err = parse("fillUsername()\nwait( 3600001)").unwrap_err();
        assert_eq!((err.line, err.column), (2, 7));
        assert!(err.message.contains("exceeds"));

        assert!(check_syntax("wait(18446744073709551615)").is_some());
        assert!(check_syntax("wait(99999999999999999999999)").is_some());
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(
            single(r#"fillUsername('"')"#),
            Command::FillUsername { locator: Some("\"".into()) }
        );
        assert_eq!(
            single(r#"fillUsername("'")"#),
            Command::FillUsername { locator: Some("'".into()) }
        );
        assert_eq!(
            single(r#"fillUsername('\'')"#),
            Command::FillUsername { locator: Some("'".into()) }
        );
        assert_eq!(
            single(r#"fillUsername("\"")"#),
            Command::FillUsername { locator: Some("\"".into()) }
        );
    }

    #[test]
    fn test_other_escapes() {
        assert_eq!(
            single(r#"fillText('a\\b', 'tab\there \x41é \q')"#),
            Command::FillText {
                locator: "a\\b".into(),
                value: "tab\there Aé \\q".into(),
            }
        );
        assert!(check_syntax(r#"fillText('a', '\xZ1')"#).is_some());
    }

    #[test]
    fn test_octal_and_wide_escapes() {
        assert_eq!(
            single(r#"fillText('a', '\0|\012|\101\1012|\U0001F600|\v')"#),
            Command::FillText {
                locator: "a".into(),
                value: "\0|\n|AA2|\u{1F600}|\u{0b}".into(),
            }
        );
        assert!(check_syntax(r#"fillText('a', '\U0011FFFF')"#).is_some());
        assert!(check_syntax(r#"fillText('a', '\N{BULLET}')"#).is_some());
    }

    #[test]
    fn test_commands_keep_source_order() {
        let commands = parse("wait(1) openUrl('u') clickSubmitButton() wait(2)").unwrap();
        let names: Vec<_> = commands.iter().map(Command::name).collect();
        assert_eq!(names, ["wait", "openUrl", "clickSubmitButton", "wait"]);
        assert_eq!(commands[2], Command::ClickSubmitButton { locator: None });
    }
}
