//! Transcript markup helpers.
//!
//! Tools render their calls as self-describing tags (`<codiner-write
//! path="...">body</codiner-write>`) so the UI can show rich cards instead of
//! raw JSON. Attribute values and bodies are escaped here.

use serde_json::Value;

/// Escape a string for use inside a double-quoted XML attribute.
pub fn escape_xml_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a string for use as element content.
pub fn escape_xml_content(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Build `<tag a="..." b="...">` (or a self-closing tag when `self_closing`).
pub fn open_tag(tag: &str, attrs: &[(&str, &str)], self_closing: bool) -> String {
    let mut out = format!("<{tag}");
    for (name, value) in attrs {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_xml_attr(value));
        out.push('"');
    }
    out.push_str(if self_closing { " />" } else { ">" });
    out
}

/// Build a full element. `body` is inserted as-is; escape it first if needed.
pub fn element(tag: &str, attrs: &[(&str, &str)], body: &str) -> String {
    format!("{}{body}</{tag}>", open_tag(tag, attrs, false))
}

/// The record emitted when a tool call fails.
pub fn tool_error_markup(tool: &str, message: &str) -> String {
    element(
        "codiner-output",
        &[
            ("type", "error"),
            ("message", &format!("Tool '{tool}' failed: {message}")),
        ],
        &escape_xml_content(message),
    )
}

/// Read a string argument, tolerating missing keys and non-strings.
pub fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

// ─── Partial JSON ───────────────────────────────────────────────────────────

/// Best-effort parse of tool arguments that are still streaming in.
///
/// Tries the raw text, then closes a dangling string and object. Returns
/// `None` when nothing usable can be recovered yet.
pub fn parse_partial_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    for suffix in ["", "\"}", "}", "\"]}", "]}"] {
        let candidate = format!("{trimmed}{suffix}");
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&candidate) {
            return Some(value);
        }
    }
    None
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_escape_attr() {
        assert_eq!(
            escape_xml_attr(r#"a "b" <c> & 'd'"#),
            "a &quot;b&quot; &lt;c&gt; &amp; &apos;d&apos;"
        );
    }

    #[test]
    fn test_escape_content_keeps_quotes() {
        assert_eq!(escape_xml_content(r#"x < "y""#), r#"x &lt; "y""#);
    }

    #[test]
    fn test_open_tag_escapes_attrs() {
        assert_eq!(
            open_tag("codiner-rename", &[("from", "a\"b"), ("to", "c")], false),
            r#"<codiner-rename from="a&quot;b" to="c">"#
        );
        assert_eq!(
            open_tag("codiner-sub-agent-spawn", &[("task", "t")], true),
            r#"<codiner-sub-agent-spawn task="t" />"#
        );
    }

    #[test]
    fn test_tool_error_markup() {
        let out = tool_error_markup("write_file", "disk <full>");
        assert_eq!(
            out,
            r#"<codiner-output type="error" message="Tool 'write_file' failed: disk &lt;full&gt;">disk &lt;full&gt;</codiner-output>"#
        );
    }

    #[test]
    fn test_partial_json_complete() {
        assert_eq!(parse_partial_json(r#"{"path":"a"}"#), Some(json!({"path": "a"})));
    }

    #[test]
    fn test_partial_json_dangling_string() {
        assert_eq!(
            parse_partial_json(r#"{"path":"src/ma"#),
            Some(json!({"path": "src/ma"}))
        );
    }

    #[test]
    fn test_partial_json_dangling_object() {
        assert_eq!(parse_partial_json(r#"{"a":1"#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_partial_json_unrecoverable() {
        assert_eq!(parse_partial_json(""), None);
        assert_eq!(parse_partial_json(r#"{"pa"#), None);
    }

    #[test]
    fn test_str_arg() {
        let args = json!({"path": "x", "n": 3});
        assert_eq!(str_arg(&args, "path"), Some("x"));
        assert_eq!(str_arg(&args, "n"), None);
        assert_eq!(str_arg(&args, "missing"), None);
    }
}
