/// Reference text (usually extracted from a document) stuffed into prompts.
///
/// `None` means nothing is loaded; `Some("")` is an explicitly blank context.
/// Either way nothing is prepended to the prompt.
#[derive(Debug, Default, Clone)]
pub struct ContextHolder {
    text: Option<String>,
}

impl ContextHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held text wholesale.
    pub fn set(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    pub fn get(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn clear(&mut self) {
        self.text = None;
    }

    /// True when there is non-empty text to prepend.
    pub fn is_loaded(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_absent() {
        let ctx = ContextHolder::new();
        assert_eq!(ctx.get(), None);
        assert!(!ctx.is_loaded());
    }

    #[test]
    fn set_replaces_previous_text() {
        let mut ctx = ContextHolder::new();
        ctx.set("first document");
        ctx.set("second document");
        assert_eq!(ctx.get(), Some("second document"));
        assert!(ctx.is_loaded());
    }

    #[test]
    fn empty_is_distinct_from_absent() {
        let mut ctx = ContextHolder::new();
        ctx.set("");
        assert_eq!(ctx.get(), Some(""));
        assert!(!ctx.is_loaded());

        ctx.clear();
        assert_eq!(ctx.get(), None);
    }
}
