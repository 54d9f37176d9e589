//! In-body directive extraction (`##From:`, `##CC:`).
//!
//! Senders can embed line-anchored markers in the message body to override
//! the apparent requester (`##From:`) or to add watchers (`##CC:`):
//!
//! ```text
//! ##From: Doe, Jane
//! ##From: Doe, Jane <jane.doe@example.com>
//! ##CC: Smith, John
//! ##CC: Support Team
//! ```
//!
//! Parsing and resolution are separate steps: parsing is a pure function
//! of the body text, resolution runs each parsed directive against the
//! host directory. Resolution is best-effort throughout — zero or
//! ambiguous matches skip the directive, they never fail processing.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::HostError;
use crate::host::{Directory, Lookup};

static FROM_LINE_REGEX: OnceLock<Regex> = OnceLock::new();
static CC_LINE_REGEX: OnceLock<Regex> = OnceLock::new();
static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
static NAME_PAIR_REGEX: OnceLock<Regex> = OnceLock::new();

fn from_line_regex() -> &'static Regex {
    FROM_LINE_REGEX.get_or_init(|| {
        Regex::new(r"(?mi)^\s*##From\s*:\s*(?P<rest>.+?)\s*$").expect("invalid ##From regex")
    })
}

fn cc_line_regex() -> &'static Regex {
    CC_LINE_REGEX.get_or_init(|| {
        Regex::new(r"(?mi)^\s*##CC\s*:\s*(?P<rest>.+?)\s*$").expect("invalid ##CC regex")
    })
}

fn email_regex() -> &'static Regex {
    EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"(?P<email>[\w.+-]+@[\w-]+\.[\w.-]+)").expect("invalid email regex")
    })
}

/// `Last, First` with both parts limited to name characters. Quotes around
/// the full name are tolerated.
fn name_pair_regex() -> &'static Regex {
    NAME_PAIR_REGEX.get_or_init(|| {
        Regex::new(r#"^["']?(?P<last>[\w.\-' ]+?)\s*,\s*(?P<first>[\w.\-' ]+?)["']?$"#)
            .expect("invalid name pair regex")
    })
}

/// Identity named by a `##From:` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromDirective {
    Email(String),
    Name { last: String, first: String },
}

/// Target named by a `##CC:` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CcDirective {
    User { last: String, first: String },
    Group(String),
}

/// All directives found in one message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    /// First `##From:` wins; later ones are ignored.
    pub from: Option<FromDirective>,
    pub cc: Vec<CcDirective>,
}

/// Watchers resolved from `##CC:` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedWatchers {
    pub users: Vec<i64>,
    pub groups: Vec<i64>,
}

/// Parse the directive lines out of a plain-text body.
pub fn parse_directives(body: &str) -> Directives {
    let mut directives = Directives::default();

    if let Some(caps) = from_line_regex().captures(body) {
        let rest = caps.name("rest").map(|m| m.as_str()).unwrap_or_default();
        directives.from = parse_from_rest(rest);
    }

    for caps in cc_line_regex().captures_iter(body) {
        let rest = caps.name("rest").map(|m| m.as_str()).unwrap_or_default();
        if let Some(cc) = parse_cc_rest(rest) {
            directives.cc.push(cc);
        }
    }

    directives
}

/// An embedded email address takes precedence over the name pair; a name
/// pair requires the `Last, First` shape.
fn parse_from_rest(rest: &str) -> Option<FromDirective> {
    if let Some(caps) = email_regex().captures(rest) {
        return Some(FromDirective::Email(caps["email"].to_lowercase()));
    }
    name_pair_regex().captures(rest).map(|caps| FromDirective::Name {
        last: caps["last"].trim().to_string(),
        first: caps["first"].trim().to_string(),
    })
}

/// A comma means `Last, First` (a user); anything else is a group name.
fn parse_cc_rest(rest: &str) -> Option<CcDirective> {
    if let Some(caps) = name_pair_regex().captures(rest) {
        return Some(CcDirective::User {
            last: caps["last"].trim().to_string(),
            first: caps["first"].trim().to_string(),
        });
    }
    let name = rest.trim().trim_matches(&['"', '\''][..]).to_string();
    if name.is_empty() {
        None
    } else {
        Some(CcDirective::Group(name))
    }
}

/// Resolve a `##From:` directive to a user id. None when the directive is
/// absent, unmatched or ambiguous.
pub fn resolve_requester_override<D: Directory>(
    directives: &Directives,
    directory: &D,
) -> Result<Option<i64>, HostError> {
    let Some(from) = &directives.from else {
        return Ok(None);
    };

    let lookup = match from {
        FromDirective::Email(email) => directory.user_by_email(email)?,
        FromDirective::Name { last, first } => directory.user_by_name(last, first)?,
    };

    match lookup {
        Lookup::Unique(id) => Ok(Some(id)),
        Lookup::NotFound => {
            log::debug!("##From directive {:?} matched no user, ignoring", from);
            Ok(None)
        }
        Lookup::Ambiguous => {
            log::debug!("##From directive {:?} is ambiguous, ignoring", from);
            Ok(None)
        }
    }
}

/// Resolve `##CC:` directives to watcher ids, skipping unmatched or
/// ambiguous entries.
pub fn resolve_watchers<D: Directory>(
    directives: &Directives,
    directory: &D,
) -> Result<ResolvedWatchers, HostError> {
    let mut watchers = ResolvedWatchers::default();

    for cc in &directives.cc {
        let lookup = match cc {
            CcDirective::User { last, first } => directory.user_by_name(last, first)?,
            CcDirective::Group(name) => directory.group_by_name(name)?,
        };

        match (cc, lookup) {
            (CcDirective::User { .. }, Lookup::Unique(id)) => watchers.users.push(id),
            (CcDirective::Group(_), Lookup::Unique(id)) => watchers.groups.push(id),
            (_, Lookup::NotFound) => {
                log::debug!("##CC directive {:?} matched nothing, ignoring", cc)
            }
            (_, Lookup::Ambiguous) => {
                log::debug!("##CC directive {:?} is ambiguous, ignoring", cc)
            }
        }
    }

    Ok(watchers)
}
