//! Model name mapping for converted requests.

/// Native model identifiers and their chat-completions counterparts.
const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-3-5-sonnet-20241022", "gpt-4o"),
    ("claude-sonnet-4-5", "gpt-4o"),
    ("claude-sonnet-4-5-thinking", "gpt-4o"),
    ("claude-3-opus-20240229", "gpt-4-turbo"),
    ("claude-3-sonnet-20240229", "gpt-4"),
    ("claude-3-haiku-20240307", "gpt-3.5-turbo"),
];

/// Target for native identifiers missing from the table.
pub const DEFAULT_MODEL: &str = "gpt-4o";

pub fn is_native_model(model: &str) -> bool {
    model.starts_with("claude")
}

/// Map a model name for a chat-completions backend.
///
/// Native identifiers go through the table with a `gpt-4o` fallback. Anything
/// else, such as a backend's own model override, is passed through unchanged.
pub fn map_model(model: &str) -> String {
    if !is_native_model(model) {
        return model.to_string();
    }
    MODEL_MAP
        .iter()
        .find(|(native, _)| *native == model)
        .map(|(_, foreign)| *foreign)
        .unwrap_or(DEFAULT_MODEL)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_native_models() {
        assert_eq!(map_model("claude-3-opus-20240229"), "gpt-4-turbo");
        assert_eq!(map_model("claude-3-haiku-20240307"), "gpt-3.5-turbo");
        assert_eq!(map_model("claude-sonnet-4-5"), "gpt-4o");
    }

    #[test]
    fn unknown_native_model_falls_back() {
        assert_eq!(map_model("claude-opus-9"), DEFAULT_MODEL);
    }

    #[test]
    fn foreign_names_pass_through() {
        assert_eq!(map_model("deepseek-chat"), "deepseek-chat");
        assert_eq!(map_model("gpt-4o-mini"), "gpt-4o-mini");
    }
}
