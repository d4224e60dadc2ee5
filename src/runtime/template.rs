//! `{{path.to.field}}` variable substitution for message content.
//!
//! Paths resolve against the execution context scope. Unresolved paths are
//! left as the literal token so a broken template is visible in the delivered
//! message instead of silently dropping content.

use crate::runtime::context::lookup_path;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("placeholder regex")
    })
}

/// Render a template against a JSON scope
pub fn render(template: &str, scope: &Value) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            match lookup_path(scope, path) {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => caps[0].to_string(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_resolved_paths() {
        let scope = json!({"contact": {"first_name": "Ada", "visits": 3}});
        assert_eq!(
            render("Hi {{contact.first_name}}, visit #{{contact.visits}}!", &scope),
            "Hi Ada, visit #3!"
        );
    }

    #[test]
    fn unresolved_paths_stay_literal() {
        let scope = json!({"contact": {}});
        assert_eq!(
            render("Hi {{contact.first_name}}!", &scope),
            "Hi {{contact.first_name}}!"
        );
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let scope = json!({"variables": {"promo": "SPRING"}});
        assert_eq!(render("Code: {{ variables.promo }}", &scope), "Code: SPRING");
    }
}
