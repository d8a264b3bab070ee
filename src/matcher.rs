//! Request matching logic.
//!
//! Matches incoming requests against the ordered rules of a [`RuleSet`].
//! Rules are tried top to bottom and the first one whose URL, method and
//! body constraints all pass wins.
//!
//! [`RuleSet`]: crate::config::RuleSet

use crate::config::{Rule, PATH_DELIMITER, WILDCARD};
use serde_json::Value;
use std::cell::OnceCell;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::{debug, trace};

/// The parts of a request that rules are matched against.
#[derive(Debug, Clone, Copy)]
pub struct MatchRequest<'a> {
    /// HTTP method as sent by the client
    pub method: &'a str,
    /// Request path, without query string
    pub path: &'a str,
    /// Raw body, only read for requests that carry one
    pub body: Option<&'a [u8]>,
}

impl<'a> MatchRequest<'a> {
    pub fn new(method: &'a str, path: &'a str, body: Option<&'a [u8]>) -> Self {
        Self { method, path, body }
    }

    /// Path with leading and trailing slashes removed.
    pub fn normalized_path(&self) -> &'a str {
        self.path.trim_matches('/')
    }

    /// Whether body constraints apply to this request.
    pub fn carries_body(&self) -> bool {
        carries_body(self.method)
    }
}

/// Only POST bodies are inspected.
pub fn carries_body(method: &str) -> bool {
    method.eq_ignore_ascii_case("POST")
}

/// No rule in the set accepted the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no matching mock rule found")]
pub struct NoMatch;

/// Result of matching a request against the rules.
#[derive(Debug)]
pub struct MatchResult<'a> {
    /// Position of the rule in the rule set
    pub index: usize,
    /// The matched rule
    pub rule: &'a Rule,
}

/// Why a rule was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection<'r> {
    Url,
    Method,
    UndecodableBody,
    MissingField(&'r str),
    FieldMismatch(&'r str),
}

/// Request matcher engine over one rule set.
pub struct Matcher<'a> {
    rules: &'a [Rule],
    /// One entry per rule, in rule order
    compiled: Vec<CompiledRule>,
}

struct CompiledRule {
    /// Lowercased URL pattern without surrounding slashes; `None` matches any path
    url: Option<String>,
    /// Lowercased method; `None` matches any method
    method: Option<String>,
    constraints: Vec<BodyConstraint>,
}

struct BodyConstraint {
    expression: String,
    segments: Vec<String>,
    expected: Value,
}

impl CompiledRule {
    fn compile(rule: &Rule) -> Self {
        let pattern = rule.url_pattern.as_str();
        let url = (!pattern.is_empty() && pattern != WILDCARD)
            .then(|| pattern.trim_matches('/').to_lowercase());
        let method = (!rule.method.is_empty()).then(|| rule.method.to_lowercase());
        let constraints = rule
            .constraints()
            .map(|(expression, expected)| BodyConstraint {
                expression: expression.clone(),
                segments: split_path(expression),
                expected: expected.clone(),
            })
            .collect();

        Self {
            url,
            method,
            constraints,
        }
    }
}

impl<'a> Matcher<'a> {
    /// Create a new matcher from rule definitions.
    pub fn new(rules: &'a [Rule]) -> Self {
        Self {
            rules,
            compiled: rules.iter().map(CompiledRule::compile).collect(),
        }
    }

    /// Find the first rule that accepts the request.
    pub fn find_match(&self, request: &MatchRequest<'_>) -> Result<MatchResult<'a>, NoMatch> {
        let path = request.normalized_path().to_lowercase();
        let method = request.method.to_lowercase();
        // Decoded at most once, and only if some rule needs it.
        let body = OnceCell::new();

        let rules = self.rules;
        for (index, (rule, compiled)) in rules.iter().zip(&self.compiled).enumerate() {
            match self.check_rule(compiled, request, &path, &method, &body) {
                Ok(()) => {
                    debug!(rule = index, "Rule matched");
                    return Ok(MatchResult { index, rule });
                }
                Err(reason) => {
                    debug!(rule = index, reason = ?reason, "Rule skipped");
                }
            }
        }

        Err(NoMatch)
    }

    fn check_rule<'r>(
        &self,
        rule: &'r CompiledRule,
        request: &MatchRequest<'_>,
        path: &str,
        method: &str,
        body: &OnceCell<Option<Value>>,
    ) -> Result<(), Rejection<'r>> {
        if let Some(url) = &rule.url {
            if url != path {
                return Err(Rejection::Url);
            }
        }

        if let Some(expected) = &rule.method {
            if expected != method {
                return Err(Rejection::Method);
            }
        }

        if request.carries_body() && !rule.constraints.is_empty() {
            let decoded = body.get_or_init(|| decode_body(request.body));
            let Some(decoded) = decoded else {
                return Err(Rejection::UndecodableBody);
            };
            self.check_constraints(&rule.constraints, decoded)?;
        }

        Ok(())
    }

    fn check_constraints<'r>(
        &self,
        constraints: &'r [BodyConstraint],
        body: &Value,
    ) -> Result<(), Rejection<'r>> {
        for constraint in constraints {
            let actual = match resolve_path(body, &constraint.segments[..]) {
                None | Some(Value::Null) => {
                    return Err(Rejection::MissingField(&constraint.expression))
                }
                Some(actual) => actual,
            };

            if !values_equal(&constraint.expected, actual) {
                trace!(
                    field = %constraint.expression,
                    expected = %constraint.expected,
                    actual = %actual,
                    "Body field differs"
                );
                return Err(Rejection::FieldMismatch(&constraint.expression));
            }
        }
        Ok(())
    }
}

fn decode_body(body: Option<&[u8]>) -> Option<Value> {
    let bytes = body.unwrap_or_default();
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(
                error = %e,
                body = %String::from_utf8_lossy(bytes),
                "Request body is not valid JSON"
            );
            None
        }
    }
}

/// Split a path expression such as `user->id` into its segments.
pub fn split_path(expression: &str) -> Vec<String> {
    expression.split(PATH_DELIMITER).map(String::from).collect()
}

/// Resolve `segments` against nested JSON objects.
///
/// Returns `None` for an empty path, a missing key, or when any value on the
/// way (the root included) is not an object. A present `null` is returned as
/// `Some(&Value::Null)`.
pub fn resolve_path<'a, S: AsRef<str>>(root: &'a Value, segments: &[S]) -> Option<&'a Value> {
    let (last, parents) = segments.split_last()?;
    let mut current = root;
    for segment in parents {
        current = current.as_object()?.get(segment.as_ref())?;
    }
    current.as_object()?.get(last.as_ref())
}

/// Dynamic kind of a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Bool,
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }
}

/// Compare an expected value with the value found in the request.
///
/// Values of different kinds never match, so `1` and `"1"` differ. Values
/// of the same kind match when their [`canonical_text`] is identical.
pub fn values_equal(expected: &Value, actual: &Value) -> bool {
    JsonKind::of(expected) == JsonKind::of(actual)
        && canonical_text(expected) == canonical_text(actual)
}

/// Render a value in the canonical form used for comparison.
///
/// Strings render without quotes, numbers through their `f64` value (so `5`
/// and `5.0` agree), arrays as `[a b]` and objects as `map[k:v]` with keys
/// sorted.
pub fn canonical_text(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{}", b);
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) => {
                let _ = write!(out, "{}", f);
            }
            None => {
                let _ = write!(out, "{}", n);
            }
        },
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push_str("map[");
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push(']');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn make_rule(url: &str, method: &str, resp: Value) -> Rule {
        Rule {
            url_pattern: url.to_string(),
            method: method.to_string(),
            body_constraints: None,
            response: resp,
        }
    }

    fn with_body(mut rule: Rule, constraints: Value) -> Rule {
        let map: BTreeMap<String, Value> = serde_json::from_value(constraints).unwrap();
        rule.body_constraints = Some(map);
        rule
    }

    fn find<'a>(rules: &'a [Rule], method: &str, path: &str, body: Option<&[u8]>) -> Option<&'a Value> {
        let matcher = Matcher::new(rules);
        matcher
            .find_match(&MatchRequest::new(method, path, body))
            .ok()
            .map(|m| &m.rule.response)
    }

    #[test]
    fn test_resolve_nested() {
        let doc = json!({"user": {"profile": {"id": 7, "nick": null}}});
        assert_eq!(resolve_path(&doc, &["user", "profile", "id"]), Some(&json!(7)));
        assert_eq!(resolve_path(&doc, &["user", "profile", "nick"]), Some(&Value::Null));
        assert_eq!(resolve_path(&doc, &["user"]), Some(&json!({"profile": {"id": 7, "nick": null}})));
        assert_eq!(resolve_path(&doc, &["user", "missing"]), None);
    }

    #[test]
    fn test_resolve_empty_path() {
        let doc = json!({"": 1});
        let empty: [&str; 0] = [];
        assert_eq!(resolve_path(&doc, &empty), None);
    }

    #[test]
    fn test_resolve_through_non_object() {
        let doc = json!({"a": 1, "b": [{"c": 2}], "d": "text", "e": null});
        assert_eq!(resolve_path(&doc, &["a", "x"]), None);
        assert_eq!(resolve_path(&doc, &["b", "c"]), None);
        assert_eq!(resolve_path(&doc, &["b", "0", "c"]), None);
        assert_eq!(resolve_path(&doc, &["d", "x"]), None);
        assert_eq!(resolve_path(&doc, &["e", "x"]), None);

        for root in [json!(1), json!("s"), json!([1, 2]), Value::Null, json!(true)] {
            assert_eq!(resolve_path(&root, &["a"]), None);
        }
    }

    #[test]
    fn test_resolve_deep_nesting() {
        let depth = 2_000;
        let mut doc = json!(42);
        for _ in 0..depth {
            let mut map = serde_json::Map::new();
            map.insert("n".to_string(), doc);
            doc = Value::Object(map);
        }
        let segments = vec!["n"; depth];
        assert_eq!(resolve_path(&doc, &segments[..]), Some(&json!(42)));
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("user->id"), vec!["user", "id"]);
        assert_eq!(split_path("id"), vec!["id"]);
        assert_eq!(split_path("a->b->c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_kind_mismatch_never_equal() {
        assert!(!values_equal(&json!(1), &json!("1")));
        assert!(!values_equal(&json!("true"), &json!(true)));
        assert!(!values_equal(&json!("null"), &Value::Null));
        assert!(!values_equal(&json!([1]), &json!({"0": 1})));
        assert_eq!(canonical_text(&json!(1)), canonical_text(&json!("1")));
    }

    #[test]
    fn test_same_kind_comparison() {
        assert!(values_equal(&json!(5), &json!(5)));
        assert!(values_equal(&json!(5), &json!(5.0)));
        assert!(!values_equal(&json!(5), &json!(6)));
        assert!(values_equal(&json!("abc"), &json!("abc")));
        assert!(!values_equal(&json!("abc"), &json!("ABC")));
        assert!(values_equal(&json!(false), &json!(false)));
        assert!(values_equal(&json!([1, "a"]), &json!([1, "a"])));
        assert!(!values_equal(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn test_object_comparison_ignores_key_order() {
        let expected: Value = serde_json::from_str(r#"{"b": 2, "a": {"y": 1, "x": 0}}"#).unwrap();
        let actual: Value = serde_json::from_str(r#"{"a": {"x": 0, "y": 1}, "b": 2}"#).unwrap();
        assert!(values_equal(&expected, &actual));
        assert_eq!(canonical_text(&actual), "map[a:map[x:0 y:1] b:2]");
    }

    #[test]
    fn test_scenario_get_ping() {
        let rules = vec![make_rule("ping", "GET", json!("pong"))];
        assert_eq!(find(&rules, "GET", "/ping", None), Some(&json!("pong")));
        assert_eq!(find(&rules, "get", "ping/", None), Some(&json!("pong")));
        assert_eq!(find(&rules, "GET", "/PING", None), Some(&json!("pong")));
        assert_eq!(find(&rules, "POST", "/ping", None), None);
        assert_eq!(find(&rules, "GET", "/pong", None), None);
    }

    #[test]
    fn test_scenario_post_body_constraint() {
        let rules = vec![with_body(
            make_rule("*", "POST", json!({"ok": true})),
            json!({"user->id": 5}),
        )];
        assert_eq!(
            find(&rules, "POST", "/anything", Some(&br#"{"user":{"id":5}}"#[..])),
            Some(&json!({"ok": true}))
        );
        assert_eq!(find(&rules, "POST", "/anything", Some(&br#"{"user":{"id":"5"}}"#[..])), None);
        assert_eq!(find(&rules, "POST", "/anything", Some(&br#"{"user":{"id":6}}"#[..])), None);
        assert_eq!(find(&rules, "POST", "/anything", Some(&br#"{"user":5}"#[..])), None);
    }

    #[test]
    fn test_scenario_empty_rule_set() {
        let rules: Vec<Rule> = vec![];
        let matcher = Matcher::new(&rules);
        let err = matcher
            .find_match(&MatchRequest::new("GET", "/x", None))
            .unwrap_err();
        assert_eq!(err, NoMatch);
    }

    #[test]
    fn test_catch_all_matches_everything() {
        let rules = vec![make_rule("", "", json!("any"))];
        let requests: [(&str, &str, Option<&[u8]>); 5] = [
            ("GET", "/", None),
            ("DELETE", "/a/b/c", None),
            ("POST", "/x", Some(&b"not json"[..])),
            ("POST", "/x", None),
            ("PUT", "/y", Some(&b"{}"[..])),
        ];
        for (method, path, body) in requests {
            assert_eq!(find(&rules, method, path, body), Some(&json!("any")));
        }
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            make_rule("users", "", json!("first")),
            make_rule("*", "GET", json!("second")),
            make_rule("", "", json!("third")),
        ];
        assert_eq!(find(&rules, "GET", "/users", None), Some(&json!("first")));
        assert_eq!(find(&rules, "GET", "/other", None), Some(&json!("second")));
        assert_eq!(find(&rules, "PUT", "/other", None), Some(&json!("third")));

        let matcher = Matcher::new(&rules);
        let result = matcher
            .find_match(&MatchRequest::new("GET", "/other", None))
            .unwrap();
        assert_eq!(result.index, 1);
    }

    #[test]
    fn test_matching_is_idempotent() {
        let rules = vec![
            with_body(make_rule("", "POST", json!(1)), json!({"a": "x"})),
            make_rule("", "POST", json!(2)),
        ];
        let matcher = Matcher::new(&rules);
        let request = MatchRequest::new("POST", "/p", Some(&br#"{"a":"x"}"#[..]));
        let first = matcher.find_match(&request).unwrap().index;
        let second = matcher.find_match(&request).unwrap().index;
        assert_eq!(first, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_body_only_fails_constrained_rules() {
        let rules = vec![
            with_body(make_rule("", "POST", json!("constrained")), json!({"a": 1})),
            make_rule("", "POST", json!("open")),
        ];
        assert_eq!(find(&rules, "POST", "/", Some(&b"{broken"[..])), Some(&json!("open")));
        assert_eq!(find(&rules, "POST", "/", Some(&b""[..])), Some(&json!("open")));
        assert_eq!(find(&rules, "POST", "/", None), Some(&json!("open")));
        assert_eq!(find(&rules, "POST", "/", Some(&br#"{"a":1}"#[..])), Some(&json!("constrained")));
    }

    #[test]
    fn test_body_constraints_ignored_without_post() {
        let rules = vec![with_body(make_rule("", "", json!("hit")), json!({"a": 1}))];
        assert_eq!(find(&rules, "GET", "/", None), Some(&json!("hit")));
        assert_eq!(find(&rules, "PUT", "/", Some(&br#"{"a":2}"#[..])), Some(&json!("hit")));
        assert_eq!(find(&rules, "POST", "/", Some(&br#"{"a":2}"#[..])), None);
    }

    #[test]
    fn test_null_actual_never_matches() {
        let rules = vec![with_body(make_rule("", "", json!("hit")), json!({"a": null}))];
        assert_eq!(find(&rules, "POST", "/", Some(&br#"{"a":null}"#[..])), None);
        assert_eq!(find(&rules, "POST", "/", Some(&br#"{}"#[..])), None);
    }

    #[test]
    fn test_all_constraints_must_pass() {
        let rules = vec![with_body(
            make_rule("order", "post", json!("ok")),
            json!({"order->id": "A1", "order->qty": 2, "order->tags": ["x", "y"]}),
        )];
        let good = br#"{"order":{"id":"A1","qty":2,"tags":["x","y"]}}"#;
        let bad = br#"{"order":{"id":"A1","qty":3,"tags":["x","y"]}}"#;
        assert_eq!(find(&rules, "POST", "/order", Some(good)), Some(&json!("ok")));
        assert_eq!(find(&rules, "POST", "/order", Some(bad)), None);
    }

    #[test]
    fn test_url_pattern_slashes_trimmed() {
        let rules = vec![make_rule("/api/users/", "", json!("users"))];
        assert_eq!(find(&rules, "GET", "/api/users", None), Some(&json!("users")));
        assert_eq!(find(&rules, "GET", "/api", None), None);
    }

    #[test]
    fn test_root_path() {
        let rules = vec![make_rule("ping", "", json!(1)), make_rule("*", "", json!(2))];
        assert_eq!(find(&rules, "GET", "/", None), Some(&json!(2)));
    }

    #[test]
    fn test_slash_pattern_matches_only_root() {
        for pattern in ["/", "//"] {
            let rules = vec![
                make_rule(pattern, "", json!("root")),
                make_rule("orders", "", json!("orders")),
            ];
            assert_eq!(find(&rules, "GET", "/", None), Some(&json!("root")));
            assert_eq!(find(&rules, "GET", "", None), Some(&json!("root")));
            assert_eq!(find(&rules, "GET", "/orders", None), Some(&json!("orders")));
            assert_eq!(find(&rules, "GET", "/other", None), None);
        }
    }
}
