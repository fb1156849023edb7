//! robots.txt parsing and matching.
//!
//! A robots.txt file is split into groups of consecutive `User-agent` lines
//! followed by their rules. [`Bots::select`] picks the group for an agent
//! (case-insensitive substring match, falling back to `*`), and
//! [`Rules::is_allowed`] applies the longest matching `Allow`/`Disallow`
//! pattern, with `*` wildcards and a trailing `$` end anchor.

use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// How robots.txt is honoured by a broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotsMode {
    /// Follow the task's `ignoreRobotsTxt` flag.
    #[default]
    Inherit,
    Always,
    Never,
}

impl BotsMode {
    pub fn applies(self, ignore_robots_txt: bool) -> bool {
        match self {
            BotsMode::Inherit => !ignore_robots_txt,
            BotsMode::Always => true,
            BotsMode::Never => false,
        }
    }
}

impl FromStr for BotsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inherit" => Ok(BotsMode::Inherit),
            "always" => Ok(BotsMode::Always),
            "never" => Ok(BotsMode::Never),
            other => Err(format!("unknown bots mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Access {
    pattern: String,
    allow: bool,
}

#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    accesses: Vec<Access>,
    crawl_delay: Option<Duration>,
}

impl Group {
    fn is_wildcard(&self) -> bool {
        self.agents.iter().any(|a| a == "*")
    }

    fn matches(&self, agent: &str) -> bool {
        let agent = agent.to_ascii_lowercase();
        self.agents
            .iter()
            .filter(|a| a.as_str() != "*")
            .any(|a| agent.contains(a.as_str()))
    }
}

/// A parsed robots.txt file.
#[derive(Debug, Clone, Default)]
pub struct Bots {
    groups: Vec<Group>,
    pub host: Option<String>,
    pub sitemaps: Vec<String>,
}

impl Bots {
    pub fn parse(text: &str) -> Self {
        let mut bots = Bots::default();
        let mut current: Option<Group> = None;
        let mut in_rules = false;

        for raw in text.lines() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    if in_rules || current.is_none() {
                        if let Some(group) = current.take() {
                            bots.groups.push(group);
                        }
                        current = Some(Group::default());
                        in_rules = false;
                    }
                    if let Some(group) = current.as_mut() {
                        group.agents.push(value.to_ascii_lowercase());
                    }
                }
                "allow" | "disallow" => {
                    in_rules = true;
                    let allow = key.trim().eq_ignore_ascii_case("allow");
                    // An empty Disallow permits everything.
                    if value.is_empty() {
                        continue;
                    }
                    if let Some(group) = current.as_mut() {
                        group.accesses.push(Access {
                            pattern: value.to_string(),
                            allow,
                        });
                    }
                }
                "crawl-delay" => {
                    in_rules = true;
                    if let (Some(group), Ok(secs)) = (current.as_mut(), value.parse::<f64>()) {
                        // negative, NaN and out of range values are ignored
                        if let Ok(delay) = Duration::try_from_secs_f64(secs) {
                            group.crawl_delay = Some(delay);
                        }
                    }
                }
                "host" => bots.host = Some(value.to_string()),
                "sitemap" => bots.sitemaps.push(value.to_string()),
                _ => {}
            }
        }
        if let Some(group) = current {
            bots.groups.push(group);
        }
        bots
    }

    /// Rules applying to `agent`, or `None` when no group matches.
    pub fn select(&self, agent: &str) -> Option<Rules> {
        self.groups
            .iter()
            .find(|g| g.matches(agent))
            .or_else(|| self.groups.iter().find(|g| g.is_wildcard()))
            .map(|g| Rules {
                accesses: g.accesses.clone(),
                crawl_delay: g.crawl_delay,
            })
    }
}

/// The rules of one robots.txt group.
#[derive(Debug, Clone, Default)]
pub struct Rules {
    accesses: Vec<Access>,
    pub crawl_delay: Option<Duration>,
}

impl Rules {
    /// Check a path (with optional query) against the rules.
    pub fn is_allowed(&self, path: &str) -> bool {
        let path = if path.is_empty() { "/" } else { path };
        let mut best: Option<(usize, bool)> = None;
        for access in &self.accesses {
            if !pattern_matches(&access.pattern, path) {
                continue;
            }
            let len = access.pattern.len();
            best = match best {
                Some((best_len, best_allow)) if best_len > len => Some((best_len, best_allow)),
                Some((best_len, best_allow)) if best_len == len => {
                    Some((best_len, best_allow || access.allow))
                }
                _ => Some((len, access.allow)),
            };
        }
        best.map(|(_, allow)| allow).unwrap_or(true)
    }

    pub fn is_url_allowed(&self, url: &reqwest::Url) -> bool {
        match url.query() {
            Some(q) => self.is_allowed(&format!("{}?{}", url.path(), q)),
            None => self.is_allowed(url.path()),
        }
    }
}

/// Prefix match with `*` matching any run of characters and a trailing `$`
/// anchoring at the end of the path.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let mut parts = pattern.split('*');
    let prefix = parts.next().unwrap_or_default();
    let Some(rest) = path.strip_prefix(prefix) else {
        return false;
    };
    if !pattern.contains('*') {
        return !anchored || rest.is_empty();
    }
    let anchored = anchored && !pattern.ends_with('*');
    // consecutive stars collapse into one
    let segments: Vec<&str> = parts.filter(|part| !part.is_empty()).collect();
    if segments.is_empty() {
        return true;
    }
    match_parts(&segments, rest, anchored)
}

fn match_parts(parts: &[&str], path: &str, anchored: bool) -> bool {
    let Some((first, tail)) = parts.split_first() else {
        return true;
    };
    if tail.is_empty() {
        // last segment after a '*'
        return if anchored {
            path.ends_with(first)
        } else {
            path.contains(first)
        };
    }
    let mut from = 0;
    while let Some(pos) = path.get(from..).and_then(|rest| rest.find(first)) {
        let end = from + pos + first.len();
        if match_parts(tail, &path[end..], anchored) {
            return true;
        }
        from += pos + 1;
        while from < path.len() && !path.is_char_boundary(from) {
            from += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
# sample
User-agent: *
Disallow: /private/
Allow: /private/public/
Disallow: /*.pdf$
Crawl-delay: 2

User-agent: GoodBot
User-agent: OtherBot
Disallow:

Sitemap: http://example.com/sitemap.xml
Host: example.com
";

    #[test]
    fn wildcard_group_applies_to_unknown_agents() {
        let rules = Bots::parse(ROBOTS).select("SomeCrawler/1.0").unwrap();
        assert!(!rules.is_allowed("/private/data.xml"));
        assert!(rules.is_allowed("/private/public/data.xml"));
        assert!(rules.is_allowed("/open/data.xml"));
        assert_eq!(rules.crawl_delay, Some(Duration::from_secs(2)));
    }

    #[test]
    fn named_group_wins_by_substring() {
        let bots = Bots::parse(ROBOTS);
        let rules = bots.select("Mozilla/5.0 (compatible; goodbot)").unwrap();
        assert!(rules.is_allowed("/private/data.xml"));
        assert_eq!(rules.crawl_delay, None);
        assert_eq!(bots.host.as_deref(), Some("example.com"));
        assert_eq!(bots.sitemaps.len(), 1);
    }

    #[test]
    fn end_anchor_and_wildcards() {
        let rules = Bots::parse(ROBOTS).select("x").unwrap();
        assert!(!rules.is_allowed("/docs/report.pdf"));
        assert!(rules.is_allowed("/docs/report.pdf.xml"));
        assert!(pattern_matches("/a*/c", "/abb/cdef"));
        assert!(!pattern_matches("/a*/c$", "/abb/cdef"));
    }

    #[test]
    fn repeated_stars_act_as_one() {
        let rules = Bots::parse("User-agent: *\nDisallow: /**.pdf\nDisallow: /a***b*$\n")
            .select("x")
            .unwrap();
        assert!(rules.is_allowed("/docs/a.txt"));
        assert!(!rules.is_allowed("/docs/a.pdf"));
        assert!(!rules.is_allowed("/archive/b"));
        assert!(!rules.is_allowed("/abc"));
        assert!(rules.is_allowed("/ccc"));
        assert!(pattern_matches("/**", "/"));
        assert!(!pattern_matches("/x**y", "/xz"));
        assert!(pattern_matches("/ü**ß", "/üäöß"));
    }

    #[test]
    fn anchor_with_several_wildcards() {
        assert!(pattern_matches("/*/x*.xml$", "/data/x-1.xml"));
        assert!(!pattern_matches("/*/x*.xml$", "/data/x-1.xml.bak"));
        assert!(!pattern_matches("/*/x*.xml$", "/data/y-1.xml"));
        assert!(pattern_matches("/*ab*b$", "/xabb"));
        assert!(!pattern_matches("/*ab*b$", "/ab"));
        assert!(pattern_matches("/a*$", "/anything/at/all"));
    }

    #[test]
    fn unusable_crawl_delay_is_ignored() {
        for value in ["1e30", "-1", "NaN", "inf", "abc"] {
            let text = format!("User-agent: *\nCrawl-delay: {}\nDisallow: /x\n", value);
            let rules = Bots::parse(&text).select("x").unwrap();
            assert_eq!(rules.crawl_delay, None, "crawl-delay {}", value);
            assert!(!rules.is_allowed("/x"));
        }
        let rules = Bots::parse("User-agent: *\nCrawl-delay: 0.5\n").select("x").unwrap();
        assert_eq!(rules.crawl_delay, Some(Duration::from_millis(500)));
    }

    #[test]
    fn ties_go_to_allow() {
        let rules = Bots::parse("User-agent: *\nDisallow: /x\nAllow: /x\n")
            .select("a")
            .unwrap();
        assert!(rules.is_allowed("/x/y"));
    }

    #[test]
    fn no_group_means_no_rules() {
        assert!(Bots::parse("User-agent: only\nDisallow: /\n").select("other").is_none());
    }

    #[test]
    fn bots_mode_parsing() {
        assert_eq!("ALWAYS".parse::<BotsMode>().unwrap(), BotsMode::Always);
        assert!("sometimes".parse::<BotsMode>().is_err());
        assert!(BotsMode::Always.applies(true));
        assert!(!BotsMode::Inherit.applies(true));
    }
}
