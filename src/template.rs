//! Prompt template resolution
//!
//! Each agent has one template with `{{name}}` placeholders. Rendering is a
//! pure substitution over a variable bag assembled by the state machine:
//! submission text, question metadata, and the responses of every completed
//! prerequisite step keyed by that step's agent id. Same inputs always render
//! the same prompt.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").unwrap());

/// Variables available to a template render
pub type VariableBag = HashMap<String, String>;

/// Template resolution errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("No template registered for agent '{0}'")]
    UnknownAgent(String),
    #[error("Template for agent '{agent_id}' references unresolved variable '{placeholder}'")]
    MissingVariable { agent_id: String, placeholder: String },
}

/// Holds one prompt template per agent id and renders them against a
/// variable bag.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplateResolver {
    templates: HashMap<String, String>,
}

impl PromptTemplateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the template for an agent
    pub fn register<S: Into<String>, T: Into<String>>(&mut self, agent_id: S, template: T) {
        self.templates.insert(agent_id.into(), template.into());
    }

    /// Render the template for `agent_id`, failing on the first placeholder
    /// (in scan order) with no value in the bag.
    pub fn render(&self, agent_id: &str, variables: &VariableBag) -> Result<String, TemplateError> {
        let template = self
            .templates
            .get(agent_id)
            .ok_or_else(|| TemplateError::UnknownAgent(agent_id.to_string()))?;

        let mut rendered = String::with_capacity(template.len());
        let mut last_end = 0;
        for capture in PLACEHOLDER.captures_iter(template) {
            let whole = capture.get(0).unwrap();
            let name = &capture[1];
            let value = variables.get(name).ok_or_else(|| {
                TemplateError::MissingVariable {
                    agent_id: agent_id.to_string(),
                    placeholder: name.to_string(),
                }
            })?;
            rendered.push_str(&template[last_end..whole.start()]);
            rendered.push_str(value);
            last_end = whole.end();
        }
        rendered.push_str(&template[last_end..]);
        Ok(rendered)
    }

    /// Placeholder names referenced by an agent's template, in scan order
    pub fn placeholders(&self, agent_id: &str) -> Result<Vec<String>, TemplateError> {
        let template = self
            .templates
            .get(agent_id)
            .ok_or_else(|| TemplateError::UnknownAgent(agent_id.to_string()))?;
        Ok(PLACEHOLDER
            .captures_iter(template)
            .map(|c| c[1].to_string())
            .collect())
    }

    /// Templates for the stock manual-correction agents. The text itself is
    /// product copy; only the placeholder names matter to the pipeline.
    pub fn manual_correction() -> Self {
        let mut resolver = Self::new();
        resolver.register(
            "grammar-analysis",
            "You are a grammar reviewer for student submissions.\n\
             Question: {{question_title}}\n{{question_statement}}\n\n\
             Submission:\n{{submission_text}}\n\n\
             List every grammatical and orthographic issue you find.",
        );
        resolver.register(
            "cohesion-analysis",
            "You are a cohesion reviewer for student submissions.\n\
             Question: {{question_title}}\n\n\
             Submission:\n{{submission_text}}\n\n\
             Grammar findings from the previous reviewer:\n{{grammar-analysis}}\n\n\
             Evaluate the cohesion and flow of the text.",
        );
        resolver.register(
            "theme-analysis",
            "You are a theme reviewer for student submissions.\n\
             Question: {{question_title}}\n{{question_statement}}\n\n\
             Submission:\n{{submission_text}}\n\n\
             Cohesion findings:\n{{cohesion-analysis}}\n\n\
             Assess how well the submission addresses the assigned theme.",
        );
        resolver.register(
            "final-feedback",
            "You are the lead grader consolidating reviewer findings.\n\
             Question: {{question_title}}\n\n\
             Submission:\n{{submission_text}}\n\n\
             Grammar analysis:\n{{grammar-analysis}}\n\n\
             Cohesion analysis:\n{{cohesion-analysis}}\n\n\
             Theme analysis:\n{{theme-analysis}}\n\n\
             Write the final feedback for the student.",
        );
        resolver
    }
}
