//! Predicate grammar for route rules:
//!
//! ```text
//! expr   := clause ('&&' clause)*
//! clause := kind-glob | field op literal
//! op     := == | != | > | >= | < | <=
//! ```
//!
//! A bare clause like `session.*` matches the event kind; `*` as the final
//! segment matches any remainder. Literals are numbers, quoted or bare
//! strings, or durations (`30s`, `5m`, `2h`, `1d`) which normalize to
//! seconds.

use std::fmt;
use std::str::FromStr;

use marshal_core::event::WorkerEvent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    #[error("empty predicate")]
    Empty,
    #[error("empty clause in predicate")]
    EmptyClause,
    #[error("missing field before operator in clause: {0}")]
    MissingField(String),
    #[error("missing literal after operator in clause: {0}")]
    MissingLiteral(String),
    #[error("event-kind pattern contains invalid character: {0}")]
    BadPattern(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Literal {
    Number(f64),
    Str(String),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Clause {
    KindGlob(String),
    Compare {
        path: String,
        op: CmpOp,
        value: Literal,
    },
}

/// A parsed, reusable predicate. All clauses must hold for a match.
#[derive(Clone, Debug)]
pub struct Predicate {
    source: String,
    clauses: Vec<Clause>,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        if source.trim().is_empty() {
            return Err(PredicateError::Empty);
        }
        let clauses = source
            .split("&&")
            .map(parse_clause)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { source: source.trim().to_string(), clauses })
    }

    pub fn matches(&self, event: &WorkerEvent) -> bool {
        self.clauses.iter().all(|clause| eval_clause(clause, event))
    }
}

impl FromStr for Predicate {
    type Err = PredicateError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_clause(raw: &str) -> Result<Clause, PredicateError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PredicateError::EmptyClause);
    }
    // Two-char operators first so `>=` is not read as `>` + `=...`
    for (token, op) in [
        ("==", CmpOp::Eq),
        ("!=", CmpOp::Ne),
        (">=", CmpOp::Ge),
        ("<=", CmpOp::Le),
        (">", CmpOp::Gt),
        ("<", CmpOp::Lt),
    ] {
        if let Some(pos) = raw.find(token) {
            let path = raw[..pos].trim();
            let rhs = raw[pos + token.len()..].trim();
            if path.is_empty() {
                return Err(PredicateError::MissingField(raw.to_string()));
            }
            if rhs.is_empty() {
                return Err(PredicateError::MissingLiteral(raw.to_string()));
            }
            return Ok(Clause::Compare {
                path: path.to_string(),
                op,
                value: parse_literal(rhs),
            });
        }
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '*'))
    {
        return Err(PredicateError::BadPattern(raw.to_string()));
    }
    Ok(Clause::KindGlob(raw.to_string()))
}

fn parse_literal(raw: &str) -> Literal {
    let raw = raw.trim();
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Literal::Str(raw[1..raw.len() - 1].to_string());
    }
    if let Some(seconds) = parse_duration_secs(raw) {
        return Literal::Number(seconds);
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Literal::Number(n);
    }
    Literal::Str(raw.to_string())
}

fn parse_duration_secs(raw: &str) -> Option<f64> {
    const UNITS: [(&str, f64); 4] = [("s", 1.0), ("m", 60.0), ("h", 3600.0), ("d", 86400.0)];
    // strip_suffix keeps this safe for literals ending in multi-byte chars
    let (digits, factor) = UNITS
        .iter()
        .find_map(|(unit, factor)| raw.strip_suffix(unit).map(|digits| (digits, *factor)))?;
    let value: f64 = digits.parse().ok()?;
    Some(value * factor)
}

fn eval_clause(clause: &Clause, event: &WorkerEvent) -> bool {
    match clause {
        Clause::KindGlob(pattern) => kind_matches(pattern, &event.kind),
        Clause::Compare { path, op, value } => {
            // `type` / `kind` compare against the event kind itself
            if path == "type" || path == "kind" {
                let Literal::Str(expected) = value else { return false };
                return match op {
                    CmpOp::Eq => &event.kind == expected,
                    CmpOp::Ne => &event.kind != expected,
                    _ => false,
                };
            }
            let Some(actual) = event.field(path) else {
                return false;
            };
            match value {
                Literal::Number(expected) => {
                    let Some(actual) = actual.as_f64() else { return false };
                    match op {
                        CmpOp::Eq => actual == *expected,
                        CmpOp::Ne => actual != *expected,
                        CmpOp::Gt => actual > *expected,
                        CmpOp::Ge => actual >= *expected,
                        CmpOp::Lt => actual < *expected,
                        CmpOp::Le => actual <= *expected,
                    }
                }
                Literal::Str(expected) => {
                    let Some(actual) = actual.as_str() else { return false };
                    match op {
                        CmpOp::Eq => actual == expected,
                        CmpOp::Ne => actual != expected,
                        _ => false,
                    }
                }
            }
        }
    }
}

fn kind_matches(pattern: &str, kind: &str) -> bool {
    let mut pat = pattern.split('.').peekable();
    let mut actual = kind.split('.').peekable();
    loop {
        match (pat.next(), actual.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) if pat.peek().is_none() => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(a)) if p == a => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marshal_core::ids::{EventId, NodeId, SessionId};
    use serde_json::json;

    fn event(kind: &str, fields: serde_json::Value) -> WorkerEvent {
        WorkerEvent {
            event_id: EventId::new(),
            node_id: NodeId::from_raw("node_1"),
            session_id: Some(SessionId::from_raw("sess_1")),
            kind: kind.to_string(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn exact_kind_match() {
        let p = Predicate::parse("session.idle").unwrap();
        assert!(p.matches(&event("session.idle", json!({}))));
        assert!(!p.matches(&event("session.error", json!({}))));
    }

    #[test]
    fn trailing_glob_matches_remainder() {
        let p = Predicate::parse("session.*").unwrap();
        assert!(p.matches(&event("session.idle", json!({}))));
        assert!(p.matches(&event("session.tool.exec", json!({}))));
        assert!(!p.matches(&event("node.offline", json!({}))));
        assert!(!p.matches(&event("session", json!({}))));
    }

    #[test]
    fn numeric_comparison() {
        let p = Predicate::parse("cost.daily > 20").unwrap();
        assert!(p.matches(&event("cost.report", json!({"cost": {"daily": 21.5}}))));
        assert!(!p.matches(&event("cost.report", json!({"cost": {"daily": 19.0}}))));
        // Missing field is simply no match
        assert!(!p.matches(&event("cost.report", json!({}))));
    }

    #[test]
    fn conjunction_with_duration_literal() {
        let p = Predicate::parse("session.idle && stuck > 5m").unwrap();
        assert!(p.matches(&event("session.idle", json!({"stuck": 320}))));
        assert!(!p.matches(&event("session.idle", json!({"stuck": 100}))));
        assert!(!p.matches(&event("session.error", json!({"stuck": 320}))));
    }

    #[test]
    fn string_equality_and_inequality() {
        let p = Predicate::parse("project == 'api'").unwrap();
        assert!(p.matches(&event("session.idle", json!({"project": "api"}))));
        assert!(!p.matches(&event("session.idle", json!({"project": "web"}))));

        let p = Predicate::parse("project != api").unwrap();
        assert!(p.matches(&event("session.idle", json!({"project": "web"}))));
    }

    #[test]
    fn non_ascii_bare_literal_parses_as_string() {
        let p = Predicate::parse("project == café").unwrap();
        assert!(p.matches(&event("session.idle", json!({"project": "café"}))));
        assert!(!p.matches(&event("session.idle", json!({"project": "cafe"}))));
    }

    #[test]
    fn kind_pseudo_field() {
        let p = Predicate::parse("type == 'session.error'").unwrap();
        assert!(p.matches(&event("session.error", json!({}))));
        assert!(!p.matches(&event("session.idle", json!({}))));
    }

    #[test]
    fn ordering_on_string_field_is_false_not_error() {
        let p = Predicate::parse("project > 5").unwrap();
        assert!(!p.matches(&event("session.idle", json!({"project": "api"}))));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(Predicate::parse("   "), Err(PredicateError::Empty)));
        assert!(matches!(Predicate::parse("a && "), Err(PredicateError::EmptyClause)));
        assert!(matches!(Predicate::parse(">= 5"), Err(PredicateError::MissingField(_))));
        assert!(matches!(Predicate::parse("stuck >"), Err(PredicateError::MissingLiteral(_))));
        assert!(matches!(Predicate::parse("bad clause"), Err(PredicateError::BadPattern(_))));
    }

    #[test]
    fn display_preserves_source() {
        let p = Predicate::parse(" session.idle && stuck > 5m ").unwrap();
        assert_eq!(p.to_string(), "session.idle && stuck > 5m");
    }
}
