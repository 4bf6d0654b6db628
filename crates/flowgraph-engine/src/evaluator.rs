use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use flowgraph_core::error::{FlowError, Result};

use crate::context::FlowContext;
use crate::traits::Evaluator;

/// Languages [`SimpleEvaluator`] accepts besides untagged code.
const LANGS: &[&str] = &["simple", "expr"];

/// Comparison operators, checked in this order.
const OPERATORS: &[&str] = &[" contains ", "==", "!=", ">=", "<=", ">", "<"];

/// Small expression evaluator for inline conditions and tasks.
///
/// Conditions:
/// - `a == b`, `a != b`, `a > b`, `a >= b`, `a < b`, `a <= b`
/// - `a contains b` (substring, array element, or object key)
/// - `x && y`, `x || y`, `!x`, and a bare operand for truthiness
///
/// Operands are quoted strings, numbers, `true`/`false`/`null`, or variable
/// names with optional dotted paths (`order.total`). Unknown variables are
/// `null`.
///
/// Tasks are statements separated by `;` or newlines:
/// `name = operand`, `name += operand`, `name -= number`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEvaluator;

impl SimpleEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for SimpleEvaluator {
    fn run_test(&self, ctx: &FlowContext, code: &str) -> Result<bool> {
        let code = code.trim();
        if code.is_empty() {
            return Err(FlowError::Evaluation("empty condition".to_string()));
        }
        eval_or(ctx, code)
    }

    fn run_task(&self, ctx: &mut FlowContext, code: &str) -> Result<()> {
        for statement in split_outside_quotes(code, &[";", "\n"]) {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            run_statement(ctx, statement)?;
        }
        Ok(())
    }

    fn supports(&self, lang: Option<&str>) -> bool {
        match lang {
            None => true,
            Some(lang) => LANGS.iter().any(|l| l.eq_ignore_ascii_case(lang.trim())),
        }
    }
}

fn eval_or(ctx: &FlowContext, expr: &str) -> Result<bool> {
    for part in split_outside_quotes(expr, &["||"]) {
        if eval_and(ctx, part)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn eval_and(ctx: &FlowContext, expr: &str) -> Result<bool> {
    for part in split_outside_quotes(expr, &["&&"]) {
        if !eval_comparison(ctx, part)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_comparison(ctx: &FlowContext, expr: &str) -> Result<bool> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(FlowError::Evaluation("empty operand in condition".to_string()));
    }

    for op in OPERATORS {
        if let Some((lhs, rhs)) = parse_operator(expr, op) {
            let lhs = operand(ctx, lhs)?;
            let rhs = operand(ctx, rhs)?;
            return Ok(compare(&lhs, op.trim(), &rhs));
        }
    }

    if let Some(inner) = expr.strip_prefix('!') {
        return Ok(!eval_comparison(ctx, inner)?);
    }

    Ok(truthy(&operand(ctx, expr)?))
}

/// Split `lhs OP rhs` at the first `op` outside quotes.
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let idx = find_outside_quotes(expr, op)?;
    let lhs = expr[..idx].trim();
    let rhs = expr[idx + op.len()..].trim();
    if lhs.is_empty() || rhs.is_empty() {
        return None;
    }
    Some((lhs, rhs))
}

fn compare(lhs: &Value, op: &str, rhs: &Value) -> bool {
    match op {
        "==" => values_equal(lhs, rhs),
        "!=" => !values_equal(lhs, rhs),
        "contains" => contains(lhs, rhs),
        _ => {
            let Some(ord) = order(lhs, rhs) else {
                return false;
            };
            match op {
                ">" => ord == Ordering::Greater,
                ">=" => ord != Ordering::Less,
                "<" => ord == Ordering::Less,
                "<=" => ord != Ordering::Greater,
                _ => false,
            }
        }
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn order(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            other => s.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
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

/// Resolve a literal or a variable reference.
fn operand(ctx: &FlowContext, raw: &str) -> Result<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FlowError::Evaluation("missing operand".to_string()));
    }

    if let Some(s) = unquote(raw) {
        return Ok(Value::from(s));
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Ok(Value::from(f));
    }

    if !variable_re()?.is_match(raw) {
        return Err(FlowError::Evaluation(format!("invalid operand '{}'", raw)));
    }
    Ok(lookup(ctx, raw))
}

/// Follow a dotted path through objects and arrays.
fn lookup(ctx: &FlowContext, path: &str) -> Value {
    let mut parts = path.split('.');
    let Some(mut current) = parts.next().and_then(|first| ctx.get(first)) else {
        return Value::Null;
    };
    for part in parts {
        let next = match current {
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            other => other.get(part),
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn unquote(raw: &str) -> Option<&str> {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some(&raw[1..raw.len() - 1]);
        }
    }
    None
}

fn run_statement(ctx: &mut FlowContext, statement: &str) -> Result<()> {
    let caps = statement_re()?
        .captures(statement)
        .ok_or_else(|| FlowError::Evaluation(format!("cannot parse statement '{}'", statement)))?;
    let name = &caps[1];
    let op = &caps[2];
    let value = operand(ctx, &caps[3])?;

    let next = match op {
        "=" => value,
        "+=" => add(ctx.get(name), &value).ok_or_else(|| {
            FlowError::Evaluation(format!("cannot add {} to '{}'", value, name))
        })?,
        "-=" => {
            let current = ctx.get(name).cloned().unwrap_or(Value::from(0));
            subtract(&current, &value).ok_or_else(|| {
                FlowError::Evaluation(format!("cannot subtract {} from '{}'", value, name))
            })?
        }
        other => {
            return Err(FlowError::Evaluation(format!(
                "unsupported assignment operator '{}'",
                other
            )))
        }
    };
    ctx.put(name, next);
    Ok(())
}

fn add(current: Option<&Value>, value: &Value) -> Option<Value> {
    match (current, value) {
        (None | Some(Value::Null), v) => Some(v.clone()),
        (Some(Value::Number(a)), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.checked_add(b).map(Value::from),
            _ => Some(Value::from(a.as_f64()? + b.as_f64()?)),
        },
        (Some(Value::String(a)), Value::String(b)) => Some(Value::from(format!("{}{}", a, b))),
        (Some(Value::String(a)), other) => Some(Value::from(format!("{}{}", a, other))),
        (Some(Value::Array(items)), v) => {
            let mut items = items.clone();
            items.push(v.clone());
            Some(Value::Array(items))
        }
        _ => None,
    }
}

fn subtract(current: &Value, value: &Value) -> Option<Value> {
    match (current, value) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.checked_sub(b).map(Value::from),
            _ => Some(Value::from(a.as_f64()? - b.as_f64()?)),
        },
        _ => None,
    }
}

fn statement_re() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    compiled(RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(\+=|-=|=)\s*(.+?)\s*$")
    }))
}

fn variable_re() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    compiled(RE.get_or_init(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z0-9_$]+)*$")))
}

fn compiled(re: &'static std::result::Result<Regex, regex::Error>) -> Result<&'static Regex> {
    re.as_ref()
        .map_err(|e| FlowError::Evaluation(format!("invalid pattern: {}", e)))
}

/// Byte offset of the first `needle` not inside a quoted string.
fn find_outside_quotes(haystack: &str, needle: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, ch) in haystack.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if haystack[idx..].starts_with(needle) => return Some(idx),
            None => {}
        }
    }
    None
}

/// Split on any of `separators` outside quoted strings.
fn split_outside_quotes<'a>(text: &'a str, separators: &[&str]) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut rest = text;
    loop {
        let next = separators
            .iter()
            .filter_map(|sep| find_outside_quotes(rest, sep).map(|idx| (idx, sep.len())))
            .min_by_key(|(idx, _)| *idx);
        match next {
            Some((idx, len)) => {
                parts.push(&rest[..idx]);
                rest = &rest[idx + len..];
            }
            None => {
                parts.push(rest);
                return parts;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FlowContext {
        let mut ctx = FlowContext::new("eval");
        ctx.put("status", "success");
        ctx.put("score", 72);
        ctx.put("ratio", 0.5);
        ctx.put("tags", serde_json::json!(["a", "b"]));
        ctx.put("order", serde_json::json!({"total": 120, "items": [{"sku": "x1"}]}));
        ctx
    }

    #[test]
    fn test_equality() {
        let ctx = ctx();
        let eval = SimpleEvaluator;
        assert!(eval.run_test(&ctx, r#"status == "success""#).unwrap());
        assert!(!eval.run_test(&ctx, r#"status == "failure""#).unwrap());
        assert!(eval.run_test(&ctx, r#"status != 'failure'"#).unwrap());
        assert!(eval.run_test(&ctx, "score == 72.0").unwrap());
        assert!(eval.run_test(&ctx, "missing == null").unwrap());
    }

    #[test]
    fn test_ordering() {
        let ctx = ctx();
        let eval = SimpleEvaluator;
        assert!(eval.run_test(&ctx, "score >= 60").unwrap());
        assert!(eval.run_test(&ctx, "score > 71").unwrap());
        assert!(!eval.run_test(&ctx, "score < 72").unwrap());
        assert!(eval.run_test(&ctx, "score <= 72").unwrap());
        assert!(eval.run_test(&ctx, "ratio < 1").unwrap());
        assert!(!eval.run_test(&ctx, "status > 3").unwrap());
    }

    #[test]
    fn test_contains() {
        let ctx = ctx();
        let eval = SimpleEvaluator;
        assert!(eval.run_test(&ctx, r#"status contains "succ""#).unwrap());
        assert!(eval.run_test(&ctx, r#"tags contains "b""#).unwrap());
        assert!(!eval.run_test(&ctx, r#"tags contains "z""#).unwrap());
        assert!(eval.run_test(&ctx, r#"order contains "total""#).unwrap());
    }

    #[test]
    fn test_logic_and_paths() {
        let ctx = ctx();
        let eval = SimpleEvaluator;
        assert!(eval.run_test(&ctx, "order.total > 100 && score >= 60").unwrap());
        assert!(eval.run_test(&ctx, "score < 10 || status == 'success'").unwrap());
        assert!(!eval.run_test(&ctx, "score < 10 && status == 'success'").unwrap());
        assert!(eval.run_test(&ctx, r#"order.items.0.sku == "x1""#).unwrap());
        assert!(eval.run_test(&ctx, "!missing").unwrap());
        assert!(eval.run_test(&ctx, "tags").unwrap());
    }

    #[test]
    fn test_operators_inside_quotes_are_literal() {
        let mut ctx = ctx();
        ctx.put("expr", "a || b");
        let eval = SimpleEvaluator;
        assert!(eval.run_test(&ctx, r#"expr == "a || b""#).unwrap());
    }

    #[test]
    fn test_invalid_condition() {
        let ctx = ctx();
        let eval = SimpleEvaluator;
        assert!(matches!(
            eval.run_test(&ctx, "   "),
            Err(FlowError::Evaluation(_))
        ));
        assert!(eval.run_test(&ctx, "this is not valid").is_err());
    }

    #[test]
    fn test_task_statements() {
        let mut ctx = ctx();
        let eval = SimpleEvaluator;
        eval.run_task(&mut ctx, "count = 1; count += 2\nlabel = 'x'; label += \"y\"")
            .unwrap();
        assert_eq!(ctx.get_i64("count"), Some(3));
        assert_eq!(ctx.get_str("label"), Some("xy"));

        eval.run_task(&mut ctx, "count -= 5; copy = status; log += 'a'")
            .unwrap();
        assert_eq!(ctx.get_i64("count"), Some(-2));
        assert_eq!(ctx.get_str("copy"), Some("success"));
        assert_eq!(ctx.get_str("log"), Some("a"));

        eval.run_task(&mut ctx, "tags += 'c'").unwrap();
        assert_eq!(ctx.get("tags"), Some(&serde_json::json!(["a", "b", "c"])));
    }

    #[test]
    fn test_patterns_compile() {
        assert!(statement_re().unwrap().is_match("a += 1"));
        assert!(variable_re().unwrap().is_match("order.items.0"));
        assert!(!variable_re().unwrap().is_match("1abc"));
    }

    #[test]
    fn test_task_errors() {
        let mut ctx = ctx();
        let eval = SimpleEvaluator;
        assert!(eval.run_task(&mut ctx, "just words").is_err());
        assert!(eval.run_task(&mut ctx, "status -= 1").is_err());
        // Empty bodies are fine.
        assert!(eval.run_task(&mut ctx, " ; \n").is_ok());
    }

    #[test]
    fn test_supported_langs() {
        let eval = SimpleEvaluator;
        assert!(eval.supports(None));
        assert!(eval.supports(Some("simple")));
        assert!(eval.supports(Some("EXPR")));
        assert!(!eval.supports(Some("python")));
    }
}
