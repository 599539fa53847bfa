//! Loading `match` directives from an nmap-service-probes style file and
//! matching banners against them.

use crate::template::{self, Field, VersionInfo};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use regex::bytes::{Regex, RegexBuilder};
use std::path::Path;

pub const DEFAULT_PROBES_PATH: &str = "/usr/share/nmap/nmap-service-probes";

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("line {line}: match directive without a service name")]
    MissingService { line: usize },
    #[error("line {line}: expected `m<delim>pattern<delim>`")]
    MissingPattern { line: usize },
    #[error("line {line}: pattern is not closed by `{delim}`")]
    UnterminatedPattern { line: usize, delim: char },
    #[error("line {line}: invalid pattern: {source}")]
    Regex {
        line: usize,
        #[source]
        source: regex::Error,
    },
    #[error("line {line}: version field `{key}` is not terminated")]
    UnterminatedField { line: usize, key: String },
}

/// One `match` directive.
#[derive(Debug, Clone)]
pub struct Rule {
    pub service: String,
    pattern: Regex,
    fields: Vec<Field>,
    /// 1-based line in the source file.
    pub line: usize,
}

impl Rule {
    /// Parse the text of a `match` line (without the `match` keyword).
    pub fn parse(text: &str, line: usize) -> Result<Rule, RuleError> {
        let text = text.trim_start();
        let service_end = text.find(char::is_whitespace).unwrap_or(text.len());
        let service = &text[..service_end];
        if service.is_empty() {
            return Err(RuleError::MissingService { line });
        }
        let rest = text[service_end..].trim_start();
        let mut chars = rest.strip_prefix('m').ok_or(RuleError::MissingPattern { line })?.chars();
        let delim = match chars.next() {
            Some(d) if !d.is_whitespace() && !d.is_ascii_alphanumeric() => d,
            _ => return Err(RuleError::MissingPattern { line }),
        };
        let body = chars.as_str();
        let close = body.find(delim).ok_or(RuleError::UnterminatedPattern { line, delim })?;
        let source = &body[..close];
        let mut tail = &body[close + delim.len_utf8()..];

        let (mut case_insensitive, mut dot_all) = (false, false);
        loop {
            let mut it = tail.chars();
            let flag = it.next();
            let after = it.next();
            // A flag letter is followed by whitespace, another letter or nothing;
            // `i/.../` right after the pattern is a field.
            let is_flag = after.map_or(true, |c| c.is_whitespace() || c.is_ascii_alphabetic());
            match flag {
                Some('i') if is_flag => case_insensitive = true,
                Some('s') if is_flag => dot_all = true,
                _ => break,
            }
            tail = &tail[1..];
        }

        let pattern = RegexBuilder::new(&format!(r"\A(?:{})", translate(source)))
            .unicode(false)
            .case_insensitive(case_insensitive)
            .dot_matches_new_line(dot_all)
            .build()
            .map_err(|source| RuleError::Regex { line, source })?;
        let fields = template::parse_fields(tail).map_err(|key| RuleError::UnterminatedField { line, key })?;
        Ok(Rule { service: service.to_string(), pattern, fields, line })
    }

    /// Version info when the banner matches from its first byte.
    pub fn matches(&self, banner: &[u8]) -> Option<VersionInfo> {
        let caps = self.pattern.captures(banner)?;
        Some(VersionInfo::from_fields(&self.fields, &caps))
    }
}

/// Rewrite the pattern dialect used by probe files into `regex` syntax.
///
/// `\0` and `\0NN` become hex escapes, `\Z` becomes `\z`, a literal `[` inside a
/// class is escaped, and `$` outside a class also accepts one trailing newline.
/// Backreferences are left alone so that they fail to compile.
fn translate(source: &str) -> String {
    let mut out = String::with_capacity(source.len() + 16);
    let mut chars = source.chars().peekable();
    // Some(n): inside a class, n = items seen since the opening bracket.
    let mut class: Option<usize> = None;
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('0') => {
                    let mut value = 0u32;
                    for _ in 0..2 {
                        match chars.peek().and_then(|d| d.to_digit(8)) {
                            Some(d) => {
                                value = value * 8 + d;
                                chars.next();
                            }
                            None => break,
                        }
                    }
                    out.push_str(&format!("\\x{:02x}", value));
                }
                Some('Z') if class.is_none() => out.push_str("\\z"),
                Some(e) => {
                    out.push('\\');
                    out.push(e);
                }
                None => out.push('\\'),
            },
            '[' if class.is_none() => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                class = Some(0);
                continue;
            }
            '[' => out.push_str("\\["),
            ']' if class.map_or(false, |n| n > 0) => {
                out.push(']');
                class = None;
                continue;
            }
            '$' if class.is_none() => out.push_str(r"(?:\n?\z)"),
            _ => out.push(c),
        }
        if let Some(n) = class.as_mut() {
            *n += 1;
        }
    }
    out
}

/// A banner recognised by some rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMatch {
    pub service: String,
    pub info: VersionInfo,
}

/// Ordered rules of the first probe section.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn parse(text: &str) -> Result<RuleSet> {
        let mut rules = Vec::new();
        let (mut in_section, mut skipped) = (false, 0usize);
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (directive, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            match directive {
                "Probe" => {
                    if in_section || !rules.is_empty() || skipped > 0 {
                        debug!("rule section ends at line {}", idx + 1);
                        break;
                    }
                    in_section = true;
                }
                "match" => match Rule::parse(rest, idx + 1) {
                    Ok(rule) => rules.push(rule),
                    Err(e) => {
                        warn!("skipping probe rule: {}", e);
                        skipped += 1;
                    }
                },
                _ => {}
            }
        }
        if rules.is_empty() && skipped > 0 {
            bail!("no usable match rules ({} malformed)", skipped);
        }
        info!("loaded {} service rules ({} skipped)", rules.len(), skipped);
        Ok(RuleSet { rules })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<RuleSet> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("read probe definitions {}", path.display()))?;
        RuleSet::parse(&String::from_utf8_lossy(&bytes))
            .with_context(|| format!("parse probe definitions {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First rule in file order whose pattern matches the banner.
    pub fn identify(&self, banner: &[u8]) -> Option<ServiceMatch> {
        self.rules.iter().find_map(|rule| {
            let info = rule.matches(banner)?;
            debug!("banner matched {} rule at line {}", rule.service, rule.line);
            Some(ServiceMatch { service: rule.service.clone(), info })
        })
    }
}
