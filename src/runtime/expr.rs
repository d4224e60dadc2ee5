//! Sandboxed boolean expression evaluator.
//!
//! Custom connection conditions and custom node conditions run through this
//! restricted grammar instead of any host-language evaluation: comparisons,
//! boolean connectives, parentheses, literals, and dotted field paths
//! resolved against a JSON scope. Untrusted expression text can never
//! execute code.
//!
//! Grammar:
//!   expr    := or
//!   or      := and ("||" and)*
//!   and     := unary ("&&" unary)*
//!   unary   := "!" unary | cmp
//!   cmp     := operand (("==" | "!=" | ">=" | "<=" | ">" | "<") operand)?
//!   operand := number | string | "true" | "false" | "null" | path | "(" expr ")"

use crate::error::{EngineError, EngineResult};
use crate::runtime::context::lookup_path;
use serde_json::Value;

/// Evaluate a restricted boolean expression against a JSON scope
pub fn evaluate(expression: &str, scope: &Value) -> EngineResult<bool> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        scope,
    };
    let value = parser.parse_or()?;
    if parser.position != parser.tokens.len() {
        return Err(EngineError::Expression(format!(
            "unexpected trailing input in expression: {expression}"
        )));
    }
    Ok(truthy(&value))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Path(String),
    True,
    False,
    Null,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(EngineError::Expression("unterminated string".to_string()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| EngineError::Expression(format!("invalid number: {text}")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Path(word),
                });
            }
            other => {
                return Err(EngineError::Expression(format!(
                    "unexpected character '{other}' in expression"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    scope: &'a Value,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_or(&mut self) -> EngineResult<Value> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EngineResult<Value> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> EngineResult<Value> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let value = self.parse_unary()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> EngineResult<Value> {
        let left = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Eq) => Some(Token::Eq),
            Some(Token::Ne) => Some(Token::Ne),
            Some(Token::Gt) => Some(Token::Gt),
            Some(Token::Ge) => Some(Token::Ge),
            Some(Token::Lt) => Some(Token::Lt),
            Some(Token::Le) => Some(Token::Le),
            _ => None,
        };

        let Some(op) = op else {
            return Ok(left);
        };
        self.advance();

        let right = self.parse_operand()?;
        Ok(Value::Bool(compare(&op, &left, &right)))
    }

    fn parse_operand(&mut self) -> EngineResult<Value> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(serde_json::json!(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Path(path)) => Ok(lookup_path(self.scope, &path).unwrap_or(Value::Null)),
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                if self.advance() != Some(Token::RParen) {
                    return Err(EngineError::Expression("expected ')'".to_string()));
                }
                Ok(value)
            }
            other => Err(EngineError::Expression(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }
}

/// Numbers coerce from strings so contact properties stored as text still
/// compare numerically ("10" > 5 is true).
pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(op: &Token, left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return match op {
            Token::Eq => l == r,
            Token::Ne => l != r,
            Token::Gt => l > r,
            Token::Ge => l >= r,
            Token::Lt => l < r,
            Token::Le => l <= r,
            _ => false,
        };
    }

    match op {
        Token::Eq => left == right,
        Token::Ne => left != right,
        // Ordering over non-numbers falls back to string comparison
        Token::Gt | Token::Ge | Token::Lt | Token::Le => {
            let l = value_as_string(left);
            let r = value_as_string(right);
            match op {
                Token::Gt => l > r,
                Token::Ge => l >= r,
                Token::Lt => l < r,
                Token::Le => l <= r,
                _ => false,
            }
        }
        _ => false,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "contact": {"engaged": true, "score": "10", "plan": "pro"},
            "steps": {"n2": {"condition_met": false}},
        })
    }

    #[test]
    fn bare_path_truthiness() {
        assert!(evaluate("contact.engaged", &scope()).unwrap());
        assert!(!evaluate("contact.missing", &scope()).unwrap());
    }

    #[test]
    fn string_number_coercion() {
        assert!(evaluate("contact.score > 5", &scope()).unwrap());
        assert!(!evaluate("contact.score > 50", &scope()).unwrap());
        assert!(evaluate("contact.score == 10", &scope()).unwrap());
    }

    #[test]
    fn connectives_and_grouping() {
        assert!(evaluate("contact.engaged && contact.plan == 'pro'", &scope()).unwrap());
        assert!(evaluate("!steps.n2.condition_met || false", &scope()).unwrap());
        assert!(evaluate("(contact.score < 5) || (contact.plan == 'pro' && true)", &scope()).unwrap());
    }

    #[test]
    fn comparison_against_null() {
        assert!(evaluate("contact.missing == null", &scope()).unwrap());
        assert!(evaluate("contact.plan != null", &scope()).unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        assert!(evaluate("contact.engaged &&", &scope()).is_err());
        assert!(evaluate("(contact.engaged", &scope()).is_err());
        assert!(evaluate("contact.engaged @ 1", &scope()).is_err());
    }
}
