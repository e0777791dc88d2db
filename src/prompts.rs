//! YAML prompt registry.
//!
//! One file holds named prompts, each with `required_vars`, a system
//! template, and a user template. Missing required variables fail before
//! any LLM call is made.

use crate::error::{Result, TableRagError};
use handlebars::Handlebars;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct PromptEntry {
    pub required_vars: Vec<String>,
    pub system_template: String,
    pub user_template: String,
}

#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct PromptRegistry {
    dir: PathBuf,
}

impl PromptRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load `<dir>/<file>.yml`, pick `name`, validate required vars, and
    /// render both templates.
    pub fn get(
        &self,
        file: &str,
        name: &str,
        vars: &HashMap<String, serde_json::Value>,
    ) -> Result<RenderedPrompt> {
        let path = self.dir.join(format!("{file}.yml"));
        let content = std::fs::read_to_string(&path).map_err(|e| TableRagError::Config {
            message: format!("failed to read prompt file {}: {}", path.display(), e),
        })?;
        let entries: HashMap<String, PromptEntry> = serde_yaml::from_str(&content)?;
        let entry = entries.get(name).ok_or_else(|| TableRagError::Config {
            message: format!("prompt '{}' not found in {}", name, path.display()),
        })?;

        let missing: Vec<&String> = entry
            .required_vars
            .iter()
            .filter(|v| !vars.contains_key(*v))
            .collect();
        if !missing.is_empty() {
            return Err(TableRagError::Validation {
                message: format!("missing prompt variables: {:?}", missing),
            });
        }

        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);
        let render = |template: &str| -> Result<String> {
            hb.render_template(template, vars)
                .map_err(|e| TableRagError::Config {
                    message: format!("prompt render failed: {}", e),
                })
        };
        Ok(RenderedPrompt {
            system: render(&entry.system_template)?,
            user: render(&entry.user_template)?,
        })
    }
}
