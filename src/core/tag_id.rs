//! Traceability identifiers of the form `@TYPE:DOMAIN-NNN`.

use crate::core::error::TagError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Closed set of identifier types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagType {
    Spec,
    Test,
    Code,
    Doc,
}

impl TagType {
    pub const ALL: [TagType; 4] = [TagType::Spec, TagType::Test, TagType::Code, TagType::Doc];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagType::Spec => "SPEC",
            TagType::Test => "TEST",
            TagType::Code => "CODE",
            TagType::Doc => "DOC",
        }
    }
}

impl FromStr for TagType {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SPEC" => Ok(TagType::Spec),
            "TEST" => Ok(TagType::Test),
            "CODE" => Ok(TagType::Code),
            "DOC" => Ok(TagType::Doc),
            other => Err(TagError::ValidationError(format!(
                "unknown TAG type '{}' (expected SPEC, TEST, CODE or DOC)",
                other
            ))),
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DOMAIN_RE: &str = r"[A-Z][A-Z0-9]*(?:-[A-Z][A-Z0-9]*)*";

/// Pattern matching an identifier anywhere inside a line of text.
pub fn occurrence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"@(SPEC|TEST|CODE|DOC):({})-([0-9]{{3,}})\b",
            DOMAIN_RE
        ))
        .expect("static TAG regex")
    })
}

fn exact_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"^@?(SPEC|TEST|CODE|DOC):({})-([0-9]{{3,}})$", DOMAIN_RE))
            .expect("static TAG regex")
    })
}

/// A parsed identifier. `number` keeps its original digits so that
/// `@SPEC:AUTH-0001` and `@SPEC:AUTH-001` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId {
    pub tag_type: TagType,
    pub domain: String,
    pub number: String,
}

impl TagId {
    pub fn new(tag_type: TagType, domain: &str, number: u64, width: usize) -> Self {
        Self {
            tag_type,
            domain: domain.to_string(),
            number: format!("{:0width$}", number, width = width.max(3)),
        }
    }

    /// `TYPE:DOMAIN-NNN`, the grouping key for duplicate detection.
    pub fn key(&self) -> String {
        format!("{}:{}-{}", self.tag_type, self.domain, self.number)
    }

    /// `TYPE:DOMAIN`, the numbering bucket.
    pub fn bucket(&self) -> String {
        format!("{}:{}", self.tag_type, self.domain)
    }

    /// Numeric value of the NNN part, or `None` when it does not fit in a u64.
    pub fn numeric(&self) -> Option<u64> {
        self.number.parse().ok()
    }

    /// Returns every identifier found in `line`, in order of appearance.
    pub fn find_all(line: &str) -> Vec<TagId> {
        occurrence_regex()
            .captures_iter(line)
            .filter_map(|caps| {
                Some(TagId {
                    tag_type: caps.get(1)?.as_str().parse().ok()?,
                    domain: caps.get(2)?.as_str().to_string(),
                    number: caps.get(3)?.as_str().to_string(),
                })
            })
            .collect()
    }
}

impl FromStr for TagId {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = exact_regex()
            .captures(s.trim())
            .ok_or_else(|| TagError::ValidationError(format!("invalid TAG identifier '{}'", s)))?;
        Ok(TagId {
            tag_type: caps[1].parse()?,
            domain: caps[2].to_string(),
            number: caps[3].to_string(),
        })
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}:{}-{}", self.tag_type, self.domain, self.number)
    }
}
