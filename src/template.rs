//! Self-descriptions published by connectors, filters, transformers and
//! triggers. A template lists the properties an [`EntityDefinition`] of that
//! type accepts.
//!
//! [`EntityDefinition`]: crate::models::EntityDefinition

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentKind {
    String,
    Password,
    Temporal,
    Bool,
    Choice,
    Periodical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Argument {
    pub name: String,
    pub label: String,
    pub kind: ArgumentKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

impl Argument {
    pub fn new(name: &str, label: &str, kind: ArgumentKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind,
            required: false,
            default: None,
            choices: Vec::new(),
        }
    }

    pub fn string(name: &str, label: &str) -> Self {
        Self::new(name, label, ArgumentKind::String)
    }

    pub fn bool(name: &str, label: &str, default: bool) -> Self {
        Self::new(name, label, ArgumentKind::Bool).with_default(default.to_string())
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UiTemplate {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub label: String,
    pub arguments: Vec<Argument>,
}

impl UiTemplate {
    pub fn new(entity_type: &str, label: &str, arguments: Vec<Argument>) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            label: label.to_string(),
            arguments,
        }
    }
}

impl fmt::Display for UiTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<10} {}", self.entity_type, self.label)?;
        for arg in &self.arguments {
            write!(f, "    {:<24} {:?}", arg.name, arg.kind)?;
            if arg.required {
                write!(f, " (required)")?;
            }
            if let Some(default) = &arg.default {
                write!(f, " [default: {}]", default)?;
            }
            writeln!(f, "  {}", arg.label)?;
        }
        Ok(())
    }
}

/// Credential and robots arguments shared by the HTTP based connectors.
pub fn http_arguments() -> Vec<Argument> {
    vec![
        Argument::string(crate::definition::P_CRED_USERNAME, "User name"),
        Argument::new(
            crate::definition::P_CRED_PASSWORD,
            "Password",
            ArgumentKind::Password,
        ),
        Argument::string(crate::definition::P_BOTS_AGENT, "Robots.txt user agent"),
        Argument::bool(crate::definition::P_BOTS_ENABLED, "Use robots.txt", true),
        Argument::bool(
            crate::definition::P_BOTS_OVERRIDE,
            "Override robots.txt crawl delay",
            false,
        ),
        Argument::new(crate::definition::P_BOTS_MODE, "Robots.txt mode", ArgumentKind::Choice)
            .with_choices(&["inherit", "always", "never"])
            .with_default("inherit"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_arguments() {
        let t = UiTemplate::new(
            "UNC",
            "UNC folder",
            vec![Argument::string("unc-root-folder", "Root folder").required()],
        );
        let text = t.to_string();
        assert!(text.starts_with("UNC"));
        assert!(text.contains("unc-root-folder"));
        assert!(text.contains("(required)"));
    }
}
