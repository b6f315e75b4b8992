//! Prompt templates with named placeholders.

use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::path::Path;

enum Segment {
    Text(String),
    Placeholder(String),
}

/// A plain-text template whose `{name}` placeholders are filled by exact name.
///
/// `{{` and `}}` render as literal braces. Values that the template does not
/// reference are ignored; a referenced placeholder without a value is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn segments(&self) -> CoreResult<Vec<Segment>> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = self.source.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(CoreError::MalformedTemplate(format!(
                            "unclosed placeholder '{{{}'",
                            name
                        )));
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Placeholder(name.trim().to_string()));
                }
                '}' => {
                    return Err(CoreError::MalformedTemplate(
                        "single '}' encountered".to_string(),
                    ));
                }
                other => text.push(other),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(segments)
    }

    /// Placeholder names in order of first use.
    pub fn placeholders(&self) -> CoreResult<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for segment in self.segments()? {
            if let Segment::Placeholder(name) = segment {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Fails on the first placeholder that is not in `available`, so a
    /// template can be rejected before any value exists to render it with.
    pub fn check_placeholders(&self, available: &[&str]) -> CoreResult<()> {
        match self
            .placeholders()?
            .into_iter()
            .find(|name| !available.contains(&name.as_str()))
        {
            Some(missing) => Err(CoreError::MissingPlaceholder(missing)),
            None => Ok(()),
        }
    }

    pub fn render(&self, values: &HashMap<&str, String>) -> CoreResult<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in self.segments()? {
            match segment {
                Segment::Text(text) => out.push_str(&text),
                Segment::Placeholder(name) => {
                    let value = values
                        .get(name.as_str())
                        .ok_or_else(|| CoreError::MissingPlaceholder(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Templates keyed by file stem, loaded from a prompts directory.
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptLibrary {
    /// Reads every `.md` or `.txt` file in `dir`.
    pub fn load(dir: &Path) -> CoreResult<Self> {
        let mut templates = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_prompt = matches!(
                path.extension().and_then(|s| s.to_str()),
                Some("md") | Some("txt")
            );
            if !path.is_file() || !is_prompt {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let content = std::fs::read_to_string(&path)?;
                templates.insert(stem.to_string(), PromptTemplate::new(content));
            }
        }
        Ok(Self { templates })
    }

    pub fn insert(&mut self, name: impl Into<String>, template: PromptTemplate) {
        self.templates.insert(name.into(), template);
    }

    pub fn get(&self, name: &str) -> CoreResult<PromptTemplate> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::MissingTemplate(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
