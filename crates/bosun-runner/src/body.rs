//! The plan body mini-language.
//!
//! A plan body is one expression: a call to a named script, optionally
//! through a method, with literal arguments or `args.<name>` parameter
//! references, followed by attribute projections on the produced result.
//! A leading `return` is accepted and ignored. Examples:
//!
//! ```text
//! deploy()
//! return deploy("myapp").stdout
//! return configure.render(args.domain, 8080).exitCode
//! ```
//!
//! This covers every plan the orchestrator emits; anything else is rejected
//! with a code-2 error before any script runs.

use serde_json::Value;

use bosun_types::AgentError;

/// One call argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Literal(Value),
    /// `args.<name>`, resolved against the plan's `Parameters` at run time.
    Parameter(String),
}

/// The parsed body expression.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyExpr {
    /// Script to invoke.
    pub script: String,
    /// Named function on the script's executor, when called as
    /// `script.method(...)`.
    pub method: Option<String>,
    pub args: Vec<Argument>,
    /// Attribute accesses applied to the call result, in order.
    pub projections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Open,
    Close,
    Comma,
    Dot,
}

fn bad_body(detail: impl Into<String>) -> AgentError {
    AgentError::format(2, format!("unsupported plan body: {}", detail.into()))
}

fn tokenize(body: &str) -> Result<Vec<Token>, AgentError> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => return Err(bad_body("unterminated string literal")),
                        },
                        Some(c) if c == quote => break,
                        Some(c) => text.push(c),
                        None => return Err(bad_body("unterminated string literal")),
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = if let Ok(int) = text.parse::<i64>() {
                    Value::from(int)
                } else if let Ok(float) = text.parse::<f64>() {
                    Value::from(float)
                } else {
                    return Err(bad_body(format!("invalid number literal {text}")));
                };
                tokens.push(Token::Literal(number));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match text.as_str() {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    "null" | "None" => tokens.push(Token::Literal(Value::Null)),
                    _ => tokens.push(Token::Ident(text)),
                }
            }
            other => return Err(bad_body(format!("unexpected character {other:?}"))),
        }
    }

    Ok(tokens)
}

/// Parse a plan body. An empty (or whitespace-only) body parses to `None`.
pub fn parse_body(body: &str) -> Result<Option<BodyExpr>, AgentError> {
    let mut tokens = tokenize(body)?.into_iter().peekable();
    if tokens.peek().is_none() {
        return Ok(None);
    }

    // Optional `return` keyword.
    if tokens.peek() == Some(&Token::Ident("return".to_string())) {
        tokens.next();
    }

    let script = match tokens.next() {
        Some(Token::Ident(name)) => name,
        _ => return Err(bad_body("expected a script name")),
    };

    // Either `script(` or `script.method(`.
    let method = match tokens.next() {
        Some(Token::Open) => None,
        Some(Token::Dot) => {
            let method = match tokens.next() {
                Some(Token::Ident(name)) => name,
                _ => return Err(bad_body("expected a method name after '.'")),
            };
            if tokens.next() != Some(Token::Open) {
                return Err(bad_body("expected '(' after the method name"));
            }
            Some(method)
        }
        _ => return Err(bad_body("expected a call")),
    };

    let mut args = Vec::new();
    if tokens.peek() == Some(&Token::Close) {
        tokens.next();
    } else {
        loop {
            let arg = match tokens.next() {
                Some(Token::Literal(value)) => Argument::Literal(value),
                Some(Token::Ident(name)) if name == "args" => {
                    if tokens.next() != Some(Token::Dot) {
                        return Err(bad_body("expected '.' after args"));
                    }
                    match tokens.next() {
                        Some(Token::Ident(parameter)) => Argument::Parameter(parameter),
                        _ => return Err(bad_body("expected a parameter name after args.")),
                    }
                }
                _ => return Err(bad_body("arguments must be literals or args.<name>")),
            };
            args.push(arg);

            match tokens.next() {
                Some(Token::Comma) => {}
                Some(Token::Close) => break,
                _ => return Err(bad_body("expected ',' or ')' in the argument list")),
            }
        }
    }

    // Trailing `.attribute` projections on the result.
    let mut projections = Vec::new();
    while let Some(token) = tokens.next() {
        if token != Token::Dot {
            return Err(bad_body("only attribute access may follow the call"));
        }
        match tokens.next() {
            Some(Token::Ident(attribute)) => projections.push(attribute),
            _ => return Err(bad_body("expected an attribute name after '.'")),
        }
        if tokens.peek() == Some(&Token::Open) {
            return Err(bad_body("chained calls are not supported"));
        }
    }

    Ok(Some(BodyExpr {
        script,
        method,
        args,
        projections,
    }))
}
