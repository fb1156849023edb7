//! REGEX filter: passes records whose source URI matches a pattern.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::definition::DefinitionAdaptor;
use crate::error::{HarvestError, Result};
use crate::models::{DataReference, EntityDefinition};
use crate::template::{Argument, UiTemplate};
use crate::traits::{Descriptor, Filter, FilterInstance};

pub const TYPE: &str = "REGEX";
pub const P_PATTERN: &str = "f-regex-pattern";

/// Longest pattern accepted from a definition.
pub const MAX_PATTERN_LENGTH: usize = 500;
/// Compiled program size limit, in bytes.
const SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Default)]
pub struct RegexFilter;

impl Descriptor for RegexFilter {
    fn entity_type(&self) -> &str {
        TYPE
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(
            TYPE,
            "Regular expression filter",
            vec![Argument::string(P_PATTERN, "Pattern").required()],
        )
    }
}

impl Filter for RegexFilter {
    fn create_instance(&self, def: &EntityDefinition) -> Result<Box<dyn FilterInstance>> {
        let adaptor = DefinitionAdaptor::new(def, TYPE)?;
        let pattern = compile(adaptor.require(P_PATTERN)?)?;
        Ok(Box::new(RegexFilterInstance { adaptor, pattern }))
    }
}

/// Compile an untrusted pattern anchored to match the whole input.
pub fn compile(pattern: &str) -> Result<Regex> {
    if pattern.len() > MAX_PATTERN_LENGTH {
        return Err(HarvestError::invalid(format!(
            "pattern too long: {} characters (limit {})",
            pattern.len(),
            MAX_PATTERN_LENGTH
        )));
    }
    // the bare pattern must stand on its own before it is wrapped
    build(pattern)
        .and_then(|_| build(&format!("^(?:{})$", pattern)))
        .map_err(|e| HarvestError::invalid(format!("invalid pattern '{}': {}", pattern, e)))
}

fn build(source: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(source)
        .size_limit(SIZE_LIMIT)
        .dfa_size_limit(SIZE_LIMIT)
        .build()
}

struct RegexFilterInstance {
    adaptor: DefinitionAdaptor,
    pattern: Regex,
}

#[async_trait]
impl FilterInstance for RegexFilterInstance {
    fn entity_definition(&self) -> &EntityDefinition {
        self.adaptor.entity_definition()
    }

    fn test(&self, data: &DataReference) -> bool {
        let uri = data.source_uri.as_str();
        let matched = self.pattern.is_match(uri);
        if !matched {
            debug!(source_uri = uri, pattern = %self.pattern, "source URI does not match");
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn data(uri: &str) -> DataReference {
        DataReference::new(uri, Url::parse(uri).unwrap(), "WAF:http://host/", vec![])
    }

    fn filter(pattern: &str) -> Result<Box<dyn FilterInstance>> {
        RegexFilter.create_instance(&EntityDefinition::new(TYPE).with(P_PATTERN, pattern))
    }

    #[test]
    fn whole_uri_must_match() {
        let f = filter(r".*/iso/.*\.xml").unwrap();
        assert!(f.test(&data("http://host/iso/a.xml")));
        assert!(!f.test(&data("http://host/fgdc/a.xml")));

        let partial = filter("iso").unwrap();
        assert!(!partial.test(&data("http://host/iso/a.xml")));
    }

    #[test]
    fn alternation_is_anchored_as_a_whole() {
        let f = filter("http://a/x|http://b/y").unwrap();
        assert!(f.test(&data("http://b/y")));
        assert!(!f.test(&data("http://b/y/z")));
    }

    #[test]
    fn unbalanced_groups_cannot_escape_the_anchors() {
        for pattern in ["x)|(.*", ").*(", "a)(b"] {
            assert!(
                matches!(filter(pattern), Err(HarvestError::InvalidDefinition(_))),
                "{} accepted",
                pattern
            );
        }
        assert!(compile("(a)|(b)").unwrap().is_match("b"));
    }

    #[test]
    fn bad_patterns_are_invalid_definitions() {
        assert!(matches!(
            filter("(unclosed"),
            Err(HarvestError::InvalidDefinition(_))
        ));
        assert!(matches!(
            filter(&"a".repeat(MAX_PATTERN_LENGTH + 1)),
            Err(HarvestError::InvalidDefinition(_))
        ));
        assert!(filter(&"a".repeat(MAX_PATTERN_LENGTH)).is_ok());
        assert!(RegexFilter.create_instance(&EntityDefinition::new(TYPE)).is_err());
    }

    #[test]
    fn oversized_programs_are_rejected() {
        assert!(filter(r"(\w{100}){100}").is_err());
    }
}
