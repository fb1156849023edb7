//! Typed views over [`EntityDefinition`] property bags.
//!
//! Connectors read their configuration through a [`DefinitionAdaptor`],
//! which checks the definition type and offers typed accessors. Shared
//! property groups (credentials, robots.txt behaviour) have their own
//! readers so every HTTP connector spells them the same way.

use crate::error::{HarvestError, Result};
use crate::models::EntityDefinition;
use crate::robots::BotsMode;
use crate::scrambler;
use std::collections::BTreeMap;

pub const P_CRED_USERNAME: &str = "cred-username";
pub const P_CRED_PASSWORD: &str = "cred-password";

pub const P_BOTS_AGENT: &str = "bots.config.agent";
pub const P_BOTS_ENABLED: &str = "bots.config.enabled";
pub const P_BOTS_OVERRIDE: &str = "bots.config.override";
pub const P_BOTS_MODE: &str = "bots.mode";

#[derive(Debug, Clone)]
pub struct DefinitionAdaptor {
    def: EntityDefinition,
}

impl DefinitionAdaptor {
    /// Wrap `def`, filling an empty type with `expected` and rejecting a
    /// definition of another type.
    pub fn new(def: &EntityDefinition, expected: &str) -> Result<Self> {
        let mut def = def.clone();
        require_type(&mut def, expected)?;
        Ok(Self { def })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.def
            .get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            HarvestError::invalid(format!(
                "{}: missing required property '{}'",
                self.def.entity_type, key
            ))
        })
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => v.eq_ignore_ascii_case("true"),
            None => default,
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.def.properties.insert(key.to_string(), value.into());
    }

    /// Override properties with matching task parameters.
    pub fn consume(&mut self, params: &BTreeMap<String, String>) {
        for (key, value) in params {
            if self.def.properties.contains_key(key) {
                self.def.properties.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::read(&self.def)
    }

    pub fn bots(&self) -> BotsSettings {
        BotsSettings::read(&self.def)
    }

    pub fn entity_definition(&self) -> &EntityDefinition {
        &self.def
    }

    pub fn into_inner(self) -> EntityDefinition {
        self.def
    }
}

/// Fill an empty type or reject a mismatching one.
pub fn require_type(def: &mut EntityDefinition, expected: &str) -> Result<()> {
    if def.entity_type.is_empty() {
        def.entity_type = expected.to_string();
        return Ok(());
    }
    if def.entity_type != expected {
        return Err(HarvestError::invalid(format!(
            "broker definition type '{}' does not match connector '{}'",
            def.entity_type, expected
        )));
    }
    Ok(())
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials exist when a user name is set. Scrambled passwords are
    /// unscrambled; other values are used verbatim.
    pub fn read(def: &EntityDefinition) -> Option<Self> {
        let username = def.get(P_CRED_USERNAME).map(str::trim).unwrap_or("");
        if username.is_empty() {
            return None;
        }
        let stored = def.get(P_CRED_PASSWORD).unwrap_or("");
        let password = scrambler::decode(stored).unwrap_or_else(|| stored.to_string());
        Some(Self::new(username, password))
    }

    /// Store into `def`, scrambling the password.
    pub fn write(&self, def: &mut EntityDefinition) {
        def.properties
            .insert(P_CRED_USERNAME.to_string(), self.username.clone());
        def.properties.insert(
            P_CRED_PASSWORD.to_string(),
            scrambler::encode(&self.password),
        );
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotsSettings {
    pub agent: Option<String>,
    pub enabled: bool,
    /// Ignore the crawl delay requested by robots.txt.
    pub override_delay: bool,
    pub mode: BotsMode,
}

impl Default for BotsSettings {
    fn default() -> Self {
        Self {
            agent: None,
            enabled: true,
            override_delay: false,
            mode: BotsMode::Inherit,
        }
    }
}

impl BotsSettings {
    pub fn read(def: &EntityDefinition) -> Self {
        let flag = |key: &str, default: bool| match def.get(key).map(str::trim) {
            Some(v) if !v.is_empty() => v.eq_ignore_ascii_case("true"),
            _ => default,
        };
        Self {
            agent: def
                .get(P_BOTS_AGENT)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from),
            enabled: flag(P_BOTS_ENABLED, true),
            override_delay: flag(P_BOTS_OVERRIDE, false),
            mode: def
                .get(P_BOTS_MODE)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }
    }

    /// Whether robots.txt applies to a task with the given
    /// `ignoreRobotsTxt` flag.
    pub fn applies(&self, ignore_robots_txt: bool) -> bool {
        self.enabled && self.mode.applies(ignore_robots_txt)
    }
}
