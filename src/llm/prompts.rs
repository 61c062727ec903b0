/// System message used when the config does not provide one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Answer the user's questions directly and concisely.";

/// Build the user turn that is actually sent and stored.
///
/// Non-empty reference text is stuffed ahead of the question; otherwise the
/// prompt is passed through untouched.
pub fn compose_prompt(context: Option<&str>, user_text: &str) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => {
            format!("Context:\n{ctx}\n\nUser Question:\n{user_text}")
        }
        _ => user_text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_context_passes_prompt_through() {
        assert_eq!(compose_prompt(None, "X"), "X");
        assert_eq!(compose_prompt(Some(""), "X"), "X");
    }

    #[test]
    fn context_is_prepended() {
        assert_eq!(
            compose_prompt(Some("C"), "X"),
            "Context:\nC\n\nUser Question:\nX"
        );
    }

    #[test]
    fn context_is_kept_verbatim() {
        let ctx = "  line one\n\nline two  ";
        let prompt = compose_prompt(Some(ctx), "why?");
        assert!(prompt.starts_with("Context:\n  line one\n\nline two  \n\n"));
        assert!(prompt.ends_with("User Question:\nwhy?"));
    }
}
