//! Prompt template rendering.
//!
//! Templates are plain text with `{{ dotted.path }}` interpolation markers.
//! Paths are looked up in the JSON form of the rendering context; a missing
//! path renders as the empty string. Array indexing is supported with
//! numeric segments (`labels.0`).
//!
//! The dispatcher treats this as a pure function: the full normalized event
//! (including its `raw` payload) is the rendering context for prompts.

use serde_json::Value;

/// Renders a template against a JSON context.
///
/// Unterminated `{{` markers are emitted literally.
pub fn render(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut remaining = template;

    while let Some(start) = remaining.find("{{") {
        out.push_str(&remaining[..start]);
        let after_open = &remaining[start + 2..];

        match after_open.find("}}") {
            Some(end) => {
                let path = after_open[..end].trim();
                out.push_str(&lookup(context, path));
                remaining = &after_open[end + 2..];
            }
            None => {
                // No closing marker: emit the rest verbatim.
                out.push_str(&remaining[start..]);
                remaining = "";
            }
        }
    }

    out.push_str(remaining);
    out
}

/// Looks up a dotted path in a JSON value, rendering scalars as bare text.
fn lookup(context: &Value, path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return String::new(),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return String::new(),
            },
            _ => return String::new(),
        };
    }

    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let ctx = json!({});
        assert_eq!(render("no markers here", &ctx), "no markers here");
    }

    #[test]
    fn interpolates_string_fields() {
        let ctx = json!({"resource": {"title": "Fix the flaky test"}});
        assert_eq!(
            render("Issue: {{ resource.title }}", &ctx),
            "Issue: Fix the flaky test"
        );
    }

    #[test]
    fn interpolates_numbers_without_quotes() {
        let ctx = json!({"resource": {"number": 42}});
        assert_eq!(render("#{{resource.number}}", &ctx), "#42");
    }

    #[test]
    fn missing_path_renders_empty() {
        let ctx = json!({"a": {"b": 1}});
        assert_eq!(render("[{{ a.missing.deep }}]", &ctx), "[]");
    }

    #[test]
    fn null_renders_empty() {
        let ctx = json!({"description": null});
        assert_eq!(render("[{{ description }}]", &ctx), "[]");
    }

    #[test]
    fn array_index_segments() {
        let ctx = json!({"labels": ["bug", "urgent"]});
        assert_eq!(render("{{ labels.1 }}", &ctx), "urgent");
        assert_eq!(render("{{ labels.7 }}", &ctx), "");
    }

    #[test]
    fn multiple_markers_and_literal_text() {
        let ctx = json!({"provider": "github", "actor": {"username": "alice"}});
        assert_eq!(
            render("{{ actor.username }} via {{ provider }}!", &ctx),
            "alice via github!"
        );
    }

    #[test]
    fn unterminated_marker_is_literal() {
        let ctx = json!({"a": 1});
        assert_eq!(render("oops {{ a", &ctx), "oops {{ a");
    }

    #[test]
    fn whitespace_in_markers_is_tolerated() {
        let ctx = json!({"id": "x"});
        assert_eq!(render("{{id}} {{ id }} {{  id  }}", &ctx), "x x x");
    }

    #[test]
    fn objects_render_as_json() {
        let ctx = json!({"raw": {"action": "created"}});
        assert_eq!(render("{{ raw }}", &ctx), r#"{"action":"created"}"#);
    }
}
