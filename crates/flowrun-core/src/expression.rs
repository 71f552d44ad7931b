//! Boolean condition expressions
//!
//! The conditional node accepts either a literal expression string or a
//! structured form that is compiled into one. The grammar is closed:
//!
//! ```text
//! expr       := and_expr ( "||" and_expr )*
//! and_expr   := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := operand ( cmp operand | "contains" operand | "exists" )?
//! operand    := "(" expr ")" | number | string | true | false | null | path
//! cmp        := "==" | "!=" | ">=" | "<=" | ">" | "<"
//! ```
//!
//! Paths (`data.age`) resolve against the evaluation scope; a bare operand is
//! judged by truthiness. Comparisons are numeric when both sides coerce to
//! numbers, otherwise string equality; ordering on non-numbers falls back to
//! lexicographic comparison of strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutorError;
use crate::value::{get_path, to_display_string};

/// Comparison operators of the structured form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    Exists,
}

impl ComparisonOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Contains => "contains",
            Self::Exists => "exists",
        }
    }
}

/// Logical joiner of the structured form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOp {
    And,
    Or,
}

/// One row of the structured condition form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub left: String,
    pub operator: ComparisonOp,
    #[serde(default)]
    pub right: Option<Value>,
}

/// Compile the structured form into an expression string.
pub fn compile(conditions: &[ConditionSpec], logical: LogicalOp) -> String {
    let joiner = match logical {
        LogicalOp::And => " && ",
        LogicalOp::Or => " || ",
    };
    conditions
        .iter()
        .map(|c| match c.operator {
            ComparisonOp::Exists => format!("{} exists", c.left),
            op => format!(
                "{} {} {}",
                c.left,
                op.symbol(),
                format_operand(c.right.as_ref().unwrap_or(&Value::Null))
            ),
        })
        .collect::<Vec<_>>()
        .join(joiner)
}

/// Format a right-hand value as an expression operand.
///
/// Numbers and booleans pass through; strings that already look like a field
/// reference, a quoted string, a number, or a boolean pass through; anything
/// else becomes a quoted string literal.
fn format_operand(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::String(s) => {
            let t = s.trim();
            let quoted = (t.starts_with('"') && t.ends_with('"') && t.len() >= 2)
                || (t.starts_with('\'') && t.ends_with('\'') && t.len() >= 2);
            if quoted
                || t.parse::<f64>().is_ok()
                || t == "true"
                || t == "false"
                || t == "null"
                || is_path(t)
            {
                t.to_string()
            } else {
                format!("\"{}\"", t.replace('"', "\\\""))
            }
        }
        other => format!("\"{}\"", other.to_string().replace('"', "\\\"")),
    }
}

fn is_path(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .enumerate()
                    .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
        })
}

/// Evaluate an expression against a scope value.
pub fn evaluate(expression: &str, scope: &Value) -> Result<bool, ExecutorError> {
    let tokens = lex(expression)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        scope,
    };
    let result = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(ExecutorError::Expression(format!(
            "unexpected trailing input in expression: {expression:?}"
        )));
    }
    Ok(truthy(&result))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    And,
    Or,
    Not,
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    Exists,
    LParen,
    RParen,
}

fn lex(input: &str) -> Result<Vec<Token>, ExecutorError> {
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
                tokens.push(Token::Neq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Gte);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Lte);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == '\\' && chars.get(i + 1) == Some(&quote) {
                        s.push(quote);
                        i += 2;
                    } else if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    } else {
                        s.push(chars[i]);
                        i += 1;
                    }
                }
                if !closed {
                    return Err(ExecutorError::Expression(format!(
                        "unterminated string literal in expression: {input:?}"
                    )));
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    ExecutorError::Expression(format!("invalid number: {text:?}"))
                })?;
                tokens.push(Token::Number(n));
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
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "contains" => Token::Contains,
                    "exists" => Token::Exists,
                    _ => Token::Path(word),
                });
            }
            other => {
                return Err(ExecutorError::Expression(format!(
                    "unexpected character {other:?} in expression"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    scope: &'a Value,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> Result<Value, ExecutorError> {
        let mut left = truthy(&self.and_expr()?);
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = truthy(&self.and_expr()?);
            left = left || right;
        }
        Ok(Value::Bool(left))
    }

    fn and_expr(&mut self) -> Result<Value, ExecutorError> {
        let mut left = truthy(&self.unary()?);
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = truthy(&self.unary()?);
            left = left && right;
        }
        Ok(Value::Bool(left))
    }

    fn unary(&mut self) -> Result<Value, ExecutorError> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let v = self.unary()?;
            return Ok(Value::Bool(!truthy(&v)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, ExecutorError> {
        // `exists` applies to the raw path, not its resolved value
        if let Some(Token::Path(path)) = self.peek() {
            let path = path.clone();
            if self.tokens.get(self.pos + 1) == Some(&Token::Exists) {
                self.pos += 2;
                let present = get_path(self.scope, &path).is_some_and(|v| !v.is_null());
                return Ok(Value::Bool(present));
            }
        }

        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => ComparisonOp::Eq,
            Some(Token::Neq) => ComparisonOp::Neq,
            Some(Token::Gt) => ComparisonOp::Gt,
            Some(Token::Lt) => ComparisonOp::Lt,
            Some(Token::Gte) => ComparisonOp::Gte,
            Some(Token::Lte) => ComparisonOp::Lte,
            Some(Token::Contains) => ComparisonOp::Contains,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.operand()?;
        compare(op, &left, &right).map(Value::Bool)
    }

    fn operand(&mut self) -> Result<Value, ExecutorError> {
        match self.bump().cloned() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExecutorError::Expression(
                        "missing closing parenthesis".to_string(),
                    )),
                }
            }
            Some(Token::Number(n)) => Ok(serde_json::json!(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Path(p)) => {
                Ok(get_path(self.scope, &p).cloned().unwrap_or(Value::Null))
            }
            other => Err(ExecutorError::Expression(format!(
                "expected operand, found {other:?}"
            ))),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn compare(op: ComparisonOp, left: &Value, right: &Value) -> Result<bool, ExecutorError> {
    match op {
        ComparisonOp::Eq | ComparisonOp::Neq => {
            let eq = match (as_number(left), as_number(right)) {
                (Some(l), Some(r)) => l == r,
                _ => to_display_string(left) == to_display_string(right),
            };
            Ok(if op == ComparisonOp::Eq { eq } else { !eq })
        }
        ComparisonOp::Gt | ComparisonOp::Lt | ComparisonOp::Gte | ComparisonOp::Lte => {
            let ordering = match (as_number(left), as_number(right)) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => Some(to_display_string(left).cmp(&to_display_string(right))),
            }
            .ok_or_else(|| {
                ExecutorError::Expression("values are not comparable".to_string())
            })?;
            Ok(match op {
                ComparisonOp::Gt => ordering.is_gt(),
                ComparisonOp::Lt => ordering.is_lt(),
                ComparisonOp::Gte => ordering.is_ge(),
                ComparisonOp::Lte => ordering.is_le(),
                _ => unreachable!(),
            })
        }
        ComparisonOp::Contains => Ok(match left {
            Value::String(s) => s.contains(&to_display_string(right)),
            Value::Array(items) => items.iter().any(|item| {
                compare(ComparisonOp::Eq, item, right).unwrap_or(false)
            }),
            Value::Object(map) => match right {
                Value::String(key) => map.contains_key(key),
                _ => false,
            },
            _ => false,
        }),
        ComparisonOp::Exists => Ok(!left.is_null()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "data": {"age": 30, "name": "John", "tags": ["vip", "beta"], "active": true},
            "count": 0,
            "note": ""
        })
    }

    #[test]
    fn test_comparisons() {
        let s = scope();
        assert!(evaluate("data.age >= 18", &s).unwrap());
        assert!(evaluate("data.age < 31", &s).unwrap());
        assert!(!evaluate("data.age == 29", &s).unwrap());
        assert!(evaluate("data.name == \"John\"", &s).unwrap());
        assert!(evaluate("data.name != 'Jane'", &s).unwrap());
    }

    #[test]
    fn test_logical_operators_and_grouping() {
        let s = scope();
        assert!(evaluate("data.age > 18 && data.active == true", &s).unwrap());
        assert!(evaluate("data.age > 100 || data.name == \"John\"", &s).unwrap());
        assert!(!evaluate("data.age > 100 && data.name == \"John\"", &s).unwrap());
        assert!(evaluate("(data.age > 100 || data.active) && data.name == \"John\"", &s).unwrap());
        assert!(evaluate("!(data.age > 100)", &s).unwrap());
    }

    #[test]
    fn test_truthiness_of_bare_operands() {
        let s = scope();
        assert!(evaluate("data.active", &s).unwrap());
        assert!(!evaluate("count", &s).unwrap());
        assert!(!evaluate("note", &s).unwrap());
        assert!(!evaluate("missing.path", &s).unwrap());
    }

    #[test]
    fn test_contains_and_exists() {
        let s = scope();
        assert!(evaluate("data.name contains \"oh\"", &s).unwrap());
        assert!(evaluate("data.tags contains \"vip\"", &s).unwrap());
        assert!(!evaluate("data.tags contains \"gold\"", &s).unwrap());
        assert!(evaluate("data.age exists", &s).unwrap());
        assert!(!evaluate("data.ghost exists", &s).unwrap());
    }

    #[test]
    fn test_numeric_string_coercion() {
        let s = json!({"data": {"version": "42"}});
        assert!(evaluate("data.version == 42", &s).unwrap());
        assert!(evaluate("data.version > 40", &s).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        let s = scope();
        assert!(evaluate("data.age >", &s).is_err());
        assert!(evaluate("data.age == \"unterminated", &s).is_err());
        assert!(evaluate("(data.age > 1", &s).is_err());
        assert!(evaluate("data.age @ 3", &s).is_err());
    }

    #[test]
    fn test_compile_structured_form() {
        let conditions = vec![
            ConditionSpec {
                left: "data.age".to_string(),
                operator: ComparisonOp::Gte,
                right: Some(json!(18)),
            },
            ConditionSpec {
                left: "data.status".to_string(),
                operator: ComparisonOp::Eq,
                right: Some(json!("active user")),
            },
        ];
        let expr = compile(&conditions, LogicalOp::And);
        assert_eq!(expr, "data.age >= 18 && data.status == \"active user\"");

        let s = json!({"data": {"age": 21, "status": "active user"}});
        assert!(evaluate(&expr, &s).unwrap());
    }

    #[test]
    fn test_compile_operand_classification() {
        // Field references, quoted strings, numbers, and booleans pass through
        for (raw, expected) in [
            ("data.other", "data.other"),
            ("\"already quoted\"", "\"already quoted\""),
            ("12.5", "12.5"),
            ("true", "true"),
            ("plain words", "\"plain words\""),
        ] {
            assert_eq!(format_operand(&json!(raw)), expected, "for {raw:?}");
        }
        assert_eq!(format_operand(&json!(7)), "7");
        assert_eq!(format_operand(&json!(false)), "false");
    }

    #[test]
    fn test_compile_exists_has_no_rhs() {
        let conditions = vec![ConditionSpec {
            left: "data.email".to_string(),
            operator: ComparisonOp::Exists,
            right: None,
        }];
        let expr = compile(&conditions, LogicalOp::Or);
        assert_eq!(expr, "data.email exists");
    }
}
