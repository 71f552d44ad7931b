//! Message and URL templating
//!
//! Two closed template modes:
//!
//! - **simple**: `{{path.to.field}}` interpolation against a JSON scope. Used
//!   for HTTP URLs, headers, and bodies; URL contexts additionally
//!   percent-encode each substituted value (and only the substitutions).
//! - **rich**: minijinja with ranges, conditionals, and the `upper`/`lower`/
//!   `json` pipes. Used by email and slack messages.
//!
//! [`render_message`] auto-selects: block tags, pipes, or dotted paths inside
//! the braces pick the rich mode. Render errors never lose the message; they
//! log and fall back to the raw template string.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;
use tracing::{debug, warn};

use crate::value::{get_path, to_display_string};

/// Query-component encode set: everything except unreserved characters.
const QUERY_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?')
    .add(b'/')
    .add(b':')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'^')
    .add(b'`');

/// Interpolate `{{path}}` placeholders against the scope.
///
/// Unresolvable placeholders are left verbatim.
pub fn render_simple(template: &str, scope: &Value) -> String {
    interpolate(template, scope, false)
}

/// Like [`render_simple`] but percent-encodes each substituted value for use
/// in URL query components. The literal parts of the template pass through
/// untouched.
pub fn render_simple_url(template: &str, scope: &Value) -> String {
    interpolate(template, scope, true)
}

fn interpolate(template: &str, scope: &Value, url_encode: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let raw = &after_open[..close];
                let path = raw.trim();
                match get_path(scope, path) {
                    Some(value) => {
                        let rendered = to_display_string(value);
                        if url_encode {
                            out.push_str(
                                &utf8_percent_encode(&rendered, QUERY_ENCODE).to_string(),
                            );
                        } else {
                            out.push_str(&rendered);
                        }
                    }
                    None => {
                        debug!(path, "template path not found, leaving placeholder");
                        out.push_str("{{");
                        out.push_str(raw);
                        out.push_str("}}");
                    }
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unbalanced braces: emit the rest verbatim
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Whether a template needs the rich mode: block tags, pipes, or dotted
/// paths inside the braces.
pub fn uses_rich_syntax(template: &str) -> bool {
    if template.contains("{%") {
        return true;
    }
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let inner = &after[..close];
                if inner.contains('|') || inner.trim().contains('.') {
                    return true;
                }
                rest = &after[close + 2..];
            }
            None => return false,
        }
    }
    false
}

/// Render an email/slack message template, auto-selecting the mode.
pub fn render_message(template: &str, scope: &Value) -> String {
    if uses_rich_syntax(template) {
        match render_rich(template, scope) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(%err, "rich template render failed, falling back to raw template");
                template.to_string()
            }
        }
    } else {
        render_simple(template, scope)
    }
}

fn render_rich(template: &str, scope: &Value) -> Result<String, minijinja::Error> {
    let mut env = minijinja::Environment::new();
    env.add_filter("json", |value: minijinja::Value| -> Result<String, minijinja::Error> {
        serde_json::to_string(&value).map_err(|e| {
            minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
        })
    });
    env.render_str(template, minijinja::Value::from_serialize(scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "user": {"name": "John Doe", "email": "john@example.com"},
            "count": 3,
            "items": [{"sku": "a-1"}, {"sku": "b-2"}]
        })
    }

    #[test]
    fn test_simple_interpolation() {
        let out = render_simple("Hello {{user.name}}, you have {{count}} items", &scope());
        assert_eq!(out, "Hello John Doe, you have 3 items");
    }

    #[test]
    fn test_missing_path_left_verbatim() {
        let out = render_simple("value: {{not.there}}", &scope());
        assert_eq!(out, "value: {{not.there}}");
    }

    #[test]
    fn test_url_encoding_applies_to_substitutions_only() {
        let out = render_simple_url(
            "https://api.example.com/search?q={{user.name}}",
            &scope(),
        );
        assert_eq!(out, "https://api.example.com/search?q=John%20Doe");
    }

    #[test]
    fn test_unbalanced_braces_pass_through() {
        let out = render_simple("broken {{user.name", &scope());
        assert_eq!(out, "broken {{user.name");
    }

    #[test]
    fn test_rich_detection() {
        assert!(uses_rich_syntax("{% for i in items %}{{ i }}{% endfor %}"));
        assert!(uses_rich_syntax("{{ name|upper }}"));
        assert!(uses_rich_syntax("{{ user.name }}"));
        assert!(!uses_rich_syntax("Hello {{name}}"));
        assert!(!uses_rich_syntax("no templates here"));
    }

    #[test]
    fn test_rich_render_pipes() {
        let out = render_message("{{ user.name | upper }}", &scope());
        assert_eq!(out, "JOHN DOE");

        let out = render_message("{{ user | json }}", &scope());
        assert!(out.contains("\"email\":\"john@example.com\""));
    }

    #[test]
    fn test_rich_render_range() {
        let out = render_message(
            "{% for item in items %}[{{ item.sku }}]{% endfor %}",
            &scope(),
        );
        assert_eq!(out, "[a-1][b-2]");
    }

    #[test]
    fn test_rich_render_conditional() {
        let out = render_message(
            "{% if count > 1 %}many{% else %}one{% endif %}",
            &scope(),
        );
        assert_eq!(out, "many");
    }

    #[test]
    fn test_render_error_falls_back_to_raw() {
        let raw = "{% for x in %}broken{% endfor %}";
        assert_eq!(render_message(raw, &scope()), raw);
    }

    #[test]
    fn test_simple_mode_for_flat_names() {
        let s = json!({"name": "Ada"});
        assert_eq!(render_message("Hi {{name}}!", &s), "Hi Ada!");
    }
}
