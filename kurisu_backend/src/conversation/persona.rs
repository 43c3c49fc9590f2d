use std::fs;
use std::path::Path;

use regex_lite::Regex;

use crate::error::TemplateRenderError;

const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

/// Persona text with `{{ context }}`, `{{ user_name }}` and `{{ assistant_name }}` slots.
#[derive(Debug, Clone)]
pub struct PersonaTemplate {
    source: String,
    user_name: String,
    assistant_name: String,
    placeholder: Regex,
}

impl PersonaTemplate {
    pub fn load(
        path: &Path,
        user_name: impl Into<String>,
        assistant_name: impl Into<String>,
    ) -> Result<Self, TemplateRenderError> {
        let source = fs::read_to_string(path).map_err(|source| TemplateRenderError::Io {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!("Loaded persona template from {:?}", path);
        Self::from_source(source, user_name, assistant_name)
    }

    pub fn from_source(
        source: impl Into<String>,
        user_name: impl Into<String>,
        assistant_name: impl Into<String>,
    ) -> Result<Self, TemplateRenderError> {
        let placeholder =
            Regex::new(PLACEHOLDER).map_err(|e| TemplateRenderError::Pattern(e.to_string()))?;
        Ok(Self {
            source: source.into(),
            user_name: user_name.into(),
            assistant_name: assistant_name.into(),
            placeholder,
        })
    }

    /// The template text as loaded, before any slot is filled.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fill the slots. An empty `context` renders the base persona.
    pub fn render(&self, context: &str) -> Result<String, TemplateRenderError> {
        let mut rendered = String::with_capacity(self.source.len() + context.len());
        let mut last = 0;

        for captures in self.placeholder.captures_iter(&self.source) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let value = match name.as_str() {
                "context" => context,
                "user_name" => self.user_name.as_str(),
                "assistant_name" => self.assistant_name.as_str(),
                other => return Err(TemplateRenderError::UnknownPlaceholder(other.to_string())),
            };
            rendered.push_str(&self.source[last..whole.start()]);
            rendered.push_str(value);
            last = whole.end();
        }
        rendered.push_str(&self.source[last..]);

        Ok(rendered.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_names_and_context() {
        let template = PersonaTemplate::from_source(
            "You are {{assistant_name}}, talking to {{ user_name }}.\n{{ context }}",
            "Okabe",
            "Kurisu",
        )
        .unwrap();

        assert_eq!(
            template.render("").unwrap(),
            "You are Kurisu, talking to Okabe."
        );
        assert_eq!(
            template.render("Okabe: hi sent at 2024-01-01 00:00:00").unwrap(),
            "You are Kurisu, talking to Okabe.\nOkabe: hi sent at 2024-01-01 00:00:00"
        );
    }

    #[test]
    fn plain_text_passes_through() {
        let template = PersonaTemplate::from_source("You are Assistant.", "User", "Assistant").unwrap();
        assert_eq!(template.render("ignored").unwrap(), "You are Assistant.");
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let template =
            PersonaTemplate::from_source("Hello {{ mood }}", "User", "Assistant").unwrap();
        let err = template.render("").unwrap_err();
        assert!(matches!(err, TemplateRenderError::UnknownPlaceholder(name) if name == "mood"));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.txt");
        std::fs::write(&path, "I am {{ assistant_name }}.").unwrap();

        let template = PersonaTemplate::load(&path, "User", "Kurisu").unwrap();
        assert_eq!(template.render("").unwrap(), "I am Kurisu.");

        let missing = PersonaTemplate::load(&dir.path().join("missing.txt"), "User", "Kurisu");
        assert!(matches!(missing, Err(TemplateRenderError::Io { .. })));
    }
}
