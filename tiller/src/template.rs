//! Prompt templates for agent system prompts.
//!
//! Templates are plain strings with `{placeholder}` slots. The registry
//! is read-mostly and shared across agents; rendering an unregistered
//! name is a validation error.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Default system template registered under `"system"`.
const SYSTEM_TEMPLATE: &str = "\
You are a helpful AI assistant that can use tools to accomplish tasks.

Available tools:
{tools}

When you need to use a tool, respond with a tool call. When you have the
final answer, reply with plain text.

Think step by step about what you need to do to accomplish the task.";

/// Values substituted into a template's `{placeholder}` slots.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
}

impl TemplateVars {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a substitution.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Add a substitution in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Look up a substitution.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Substitute `{key}` slots in `body`. Unknown placeholders are left
/// verbatim so a template can carry literal braces for downstream
/// consumers.
#[must_use]
pub fn render_str(body: &str, vars: &TemplateVars) -> String {
    let mut rendered = body.to_string();
    for (key, value) in &vars.vars {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

/// Named prompt templates. Read-mostly; cheap to share behind an `Arc`.
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TemplateRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry carrying the built-in `"system"` template.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("system", SYSTEM_TEMPLATE);
        registry
    }

    /// Register a template, replacing any previous one with the same
    /// name.
    pub fn register(&self, name: impl Into<String>, body: impl Into<String>) {
        self.templates
            .write()
            .expect("template registry poisoned")
            .insert(name.into(), body.into());
    }

    /// Returns `true` if a template with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.templates
            .read()
            .expect("template registry poisoned")
            .contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .expect("template registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Render a registered template.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown template names.
    pub fn render(&self, name: &str, vars: &TemplateVars) -> Result<String> {
        let body = self
            .templates
            .read()
            .expect("template registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown template '{name}'")))?;
        Ok(render_str(&body, vars))
    }
}
