use minijinja::Environment;
use minijinja::value::Value;

/// Template environment for webhook payloads. minijinja is sandboxed: no
/// file access or code execution from template content. Beyond the built-in
/// expression operators (`==`, `and`, `or`, `not`, `in`) and filters
/// (`lower`, `upper`, `trim`), two helper functions are registered:
///
/// - `eq(a, b)`: scalar equality
/// - `contains(haystack, needle)`: substring test on strings, membership
///   test on sequences
fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Chainable);
    env.add_function("eq", fn_eq);
    env.add_function("contains", fn_contains);
    env
}

fn fn_eq(a: Value, b: Value) -> bool {
    a == b
}

fn fn_contains(haystack: Value, needle: Value) -> bool {
    if let Some(s) = haystack.as_str() {
        return needle.as_str().is_some_and(|n| s.contains(n));
    }
    if let Ok(iter) = haystack.try_iter() {
        return iter.into_iter().any(|v| v == needle);
    }
    false
}

/// Parse a template without executing it. Used at webhook create/update
/// time; a syntax error rejects the webhook.
pub fn validate(source: &str) -> Result<(), minijinja::Error> {
    environment().template_from_str(source).map(|_| ())
}

/// Render a template over the raw JSON payload.
pub fn render(source: &str, payload: &serde_json::Value) -> Result<String, minijinja::Error> {
    let env = environment();
    let tmpl = env.template_from_str(source)?;
    tmpl.render(payload)
}

/// Truthiness of a rendered general predicate: case-insensitive
/// `true`/`1`/`yes` matches, everything else (including empty) does not.
pub fn is_truthy(rendered: &str) -> bool {
    matches!(
        rendered.trim().to_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> serde_json::Value {
        serde_json::json!({
            "action": "opened",
            "repository": { "full_name": "acme/widgets" },
            "pull_request": { "number": 42, "labels": [{"name": "bug"}] },
            "sender": { "login": "alice" },
        })
    }

    #[test]
    fn render_field_access() {
        let out = render("{{ repository.full_name }}#{{ pull_request.number }}", &payload()).unwrap();
        assert_eq!(out, "acme/widgets#42");
    }

    #[test]
    fn render_missing_field_is_empty() {
        let out = render("{{ missing.field }}", &payload()).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn predicate_expression() {
        let out = render("{{ action == 'opened' }}", &payload()).unwrap();
        assert!(is_truthy(&out));
        let out = render("{{ action == 'closed' }}", &payload()).unwrap();
        assert!(!is_truthy(&out));
    }

    #[test]
    fn eq_helper() {
        let out = render("{{ eq(sender.login, 'alice') }}", &payload()).unwrap();
        assert!(is_truthy(&out));
    }

    #[test]
    fn contains_helper_on_string() {
        let out = render("{{ contains(repository.full_name, 'acme/') }}", &payload()).unwrap();
        assert!(is_truthy(&out));
        let out = render("{{ contains(repository.full_name, 'evil/') }}", &payload()).unwrap();
        assert!(!is_truthy(&out));
    }

    #[test]
    fn contains_helper_on_sequence() {
        let p = serde_json::json!({ "tags": ["a", "b"] });
        assert!(is_truthy(&render("{{ contains(tags, 'b') }}", &p).unwrap()));
        assert!(!is_truthy(&render("{{ contains(tags, 'z') }}", &p).unwrap()));
    }

    #[test]
    fn validate_catches_syntax_errors() {
        assert!(validate("{{ action }").is_err());
        assert!(validate("{% if %}").is_err());
        assert!(validate("{{ action == 'opened' }}").is_ok());
        assert!(validate("plain text, no templates").is_ok());
    }

    #[test]
    fn truthiness_table() {
        for s in ["true", "TRUE", " yes ", "1"] {
            assert!(is_truthy(s), "{s}");
        }
        for s in ["", "false", "0", "no", "maybe", "2"] {
            assert!(!is_truthy(s), "{s:?}");
        }
    }
}
