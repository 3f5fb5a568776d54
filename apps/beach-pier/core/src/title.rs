use serde_json::Value;
use thiserror::Error;

use crate::peer::TitleVariables;

pub const DEFAULT_TITLE_FORMAT: &str = "{{ .command }}@{{ .hostname }}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TitleError {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
    #[error("placeholder `{0}` must reference a variable as `.name`")]
    InvalidPlaceholder(String),
}

/// Renders a window title format such as `{{ .command }}@{{ .hostname }}`.
///
/// Unknown variables render as an empty string. String values are inserted verbatim;
/// any other JSON value uses its JSON text.
pub fn render_title(format: &str, variables: &TitleVariables) -> Result<String, TitleError> {
    let mut rendered = String::with_capacity(format.len());
    let mut rest = format;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(TitleError::Unterminated(offset + start))?;
        let placeholder = after_open[..end].trim();
        let name = placeholder
            .strip_prefix('.')
            .filter(|name| !name.is_empty())
            .ok_or_else(|| TitleError::InvalidPlaceholder(placeholder.to_string()))?;

        match variables.get(name) {
            Some(Value::String(text)) => rendered.push_str(text),
            Some(Value::Null) | None => {}
            Some(other) => rendered.push_str(&other.to_string()),
        }

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    rendered.push_str(rest);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> TitleVariables {
        let mut vars = TitleVariables::new();
        vars.insert("command".into(), json!("bash"));
        vars.insert("hostname".into(), json!("sandbar"));
        vars.insert("pid".into(), json!(4242));
        vars
    }

    #[test]
    fn renders_default_format() {
        assert_eq!(
            render_title(DEFAULT_TITLE_FORMAT, &vars()).expect("render"),
            "bash@sandbar"
        );
    }

    #[test]
    fn non_string_values_use_json_text_and_unknown_names_are_empty() {
        assert_eq!(
            render_title("{{.pid}} [{{ .missing }}]", &vars()).expect("render"),
            "4242 []"
        );
        assert_eq!(render_title("plain", &vars()).expect("render"), "plain");
    }

    #[test]
    fn reports_template_errors() {
        assert_eq!(
            render_title("ok {{ .command", &vars()),
            Err(TitleError::Unterminated(3))
        );
        assert_eq!(
            render_title("{{ command }}", &vars()),
            Err(TitleError::InvalidPlaceholder("command".into()))
        );
    }
}
