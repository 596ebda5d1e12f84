//! Directory Filters
//!
//! Parser and evaluator for RFC 4515 string filters such as
//! `(&(objectClass=posixGroup)(uniqueMember=*))`.
//!
//! Attribute names and values compare case-insensitively. Ordering
//! comparisons (`>=`, `<=`) are numeric when both sides are integers and
//! lexicographic otherwise. Approximate match (`~=`) is evaluated as
//! case-insensitive equality.

use std::fmt;
use std::str::FromStr;

use super::DirectoryObject;
use crate::error::{Error, Result};

/// Parsed filter expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(&...)` - every child matches
    And(Vec<Filter>),
    /// `(|...)` - at least one child matches
    Or(Vec<Filter>),
    /// `(!...)`
    Not(Box<Filter>),
    /// `(attr=*)`
    Present(String),
    /// `(attr=value)`
    Equal(String, String),
    /// `(attr~=value)`
    Approx(String, String),
    /// `(attr>=value)`
    GreaterOrEqual(String, String),
    /// `(attr<=value)`
    LessOrEqual(String, String),
    /// `(attr=ini*any*fin)`
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

impl Filter {
    /// Parse a filter string
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidFilter {
                filter: input.to_string(),
                offset: 0,
                reason: "empty filter".to_string(),
            });
        }

        let mut parser = Parser::new(trimmed);
        let filter = if trimmed.starts_with('(') {
            parser.filter()?
        } else {
            // Bare item, as commonly written in configuration files
            parser.item(trimmed.len())?
        };

        if parser.pos != trimmed.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    /// Evaluate the filter against a directory object
    pub fn matches(&self, obj: &DirectoryObject) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|f| f.matches(obj)),
            Filter::Or(children) => children.iter().any(|f| f.matches(obj)),
            Filter::Not(inner) => !inner.matches(obj),
            Filter::Present(attr) => obj.has(attr),
            Filter::Equal(attr, value) | Filter::Approx(attr, value) => {
                let wanted = fold(value);
                obj.values(attr).iter().any(|v| fold(v) == wanted)
            }
            Filter::GreaterOrEqual(attr, value) => obj
                .values(attr)
                .iter()
                .any(|v| compare(v, value) != std::cmp::Ordering::Less),
            Filter::LessOrEqual(attr, value) => obj
                .values(attr)
                .iter()
                .any(|v| compare(v, value) != std::cmp::Ordering::Greater),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => obj
                .values(attr)
                .iter()
                .any(|v| substring_match(&fold(v), initial, any, last)),
        }
    }

    /// Attribute names referenced anywhere in the filter (lower-cased, sorted)
    pub fn attributes(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_attributes(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_attributes(&self, out: &mut Vec<String>) {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                for child in children {
                    child.collect_attributes(out);
                }
            }
            Filter::Not(inner) => inner.collect_attributes(out),
            Filter::Present(attr)
            | Filter::Equal(attr, _)
            | Filter::Approx(attr, _)
            | Filter::GreaterOrEqual(attr, _)
            | Filter::LessOrEqual(attr, _)
            | Filter::Substring { attr, .. } => out.push(attr.to_ascii_lowercase()),
        }
    }
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

/// Canonical rendering: lower-cased attribute names, re-escaped values.
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                write!(f, "(&")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(|")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Present(attr) => write!(f, "({}=*)", attr.to_ascii_lowercase()),
            Filter::Equal(attr, value) => {
                write!(f, "({}={})", attr.to_ascii_lowercase(), escape(value))
            }
            Filter::Approx(attr, value) => {
                write!(f, "({}~={})", attr.to_ascii_lowercase(), escape(value))
            }
            Filter::GreaterOrEqual(attr, value) => {
                write!(f, "({}>={})", attr.to_ascii_lowercase(), escape(value))
            }
            Filter::LessOrEqual(attr, value) => {
                write!(f, "({}<={})", attr.to_ascii_lowercase(), escape(value))
            }
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr.to_ascii_lowercase())?;
                if let Some(initial) = initial {
                    write!(f, "{}", escape(initial))?;
                }
                write!(f, "*")?;
                for part in any {
                    write!(f, "{}*", escape(part))?;
                }
                if let Some(last) = last {
                    write!(f, "{}", escape(last))?;
                }
                write!(f, ")")
            }
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, reason: &str) -> Error {
        Error::InvalidFilter {
            filter: self.input.to_string(),
            offset: self.pos,
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    /// `"(" filtercomp ")"`
    fn filter(&mut self) -> Result<Filter> {
        self.skip_whitespace();
        self.expect(b'(')?;
        self.skip_whitespace();
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => {
                let end = self.closing_paren()?;
                self.item(end)?
            }
            None => return Err(self.error("unexpected end of filter")),
        };
        self.skip_whitespace();
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut children = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'(') => children.push(self.filter()?),
                _ => break,
            }
        }
        if children.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(children)
    }

    /// Offset of the `)` that terminates the current item
    fn closing_paren(&self) -> Result<usize> {
        self.bytes[self.pos..]
            .iter()
            .position(|&b| b == b')')
            .map(|rel| self.pos + rel)
            .ok_or_else(|| self.error("unterminated item"))
    }

    /// `attr op value`, spanning `self.pos..end`
    fn item(&mut self, end: usize) -> Result<Filter> {
        let raw = &self.input[self.pos..end];
        let eq = raw
            .find('=')
            .ok_or_else(|| self.error("missing '=' in item"))?;

        let (attr, op) = match raw[..eq].chars().last() {
            Some('~') => (&raw[..eq - 1], "~="),
            Some('>') => (&raw[..eq - 1], ">="),
            Some('<') => (&raw[..eq - 1], "<="),
            _ => (&raw[..eq], "="),
        };
        let attr = attr.trim();
        if attr.is_empty() || !attr.chars().all(is_attr_char) {
            return Err(self.error("invalid attribute description"));
        }
        let attr = attr.to_string();
        let value_raw = &raw[eq + 1..];

        let filter = match op {
            "~=" => Filter::Approx(attr, self.unescape(value_raw)?),
            ">=" => Filter::GreaterOrEqual(attr, self.unescape(value_raw)?),
            "<=" => Filter::LessOrEqual(attr, self.unescape(value_raw)?),
            _ if value_raw == "*" => Filter::Present(attr),
            _ => {
                let parts = split_unescaped_stars(value_raw);
                if parts.len() == 1 {
                    Filter::Equal(attr, self.unescape(value_raw)?)
                } else {
                    let mut decoded = Vec::with_capacity(parts.len());
                    for part in &parts {
                        decoded.push(self.unescape(part)?);
                    }
                    let last_idx = decoded.len() - 1;
                    let initial = Some(decoded[0].clone()).filter(|s| !s.is_empty());
                    let last = Some(decoded[last_idx].clone()).filter(|s| !s.is_empty());
                    let any = decoded[1..last_idx]
                        .iter()
                        .filter(|s| !s.is_empty())
                        .cloned()
                        .collect();
                    Filter::Substring {
                        attr,
                        initial,
                        any,
                        last,
                    }
                }
            }
        };

        self.pos = end;
        Ok(filter)
    }

    /// Decode `\XX` escapes. A backslash before a non-hex pair keeps the
    /// following character literally.
    fn unescape(&self, raw: &str) -> Result<String> {
        let bytes = raw.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .filter(|pair| pair.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => match bytes.get(i + 1) {
                        Some(&next) => {
                            out.push(next);
                            i += 2;
                        }
                        None => return Err(self.error("dangling escape")),
                    },
                }
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(out).map_err(|_| self.error("escaped value is not valid UTF-8"))
    }
}

fn is_attr_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == ';' || c == '.' || c == '_'
}

fn split_unescaped_stars(raw: &str) -> Vec<&str> {
    let bytes = raw.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b'*' => {
                parts.push(&raw[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

// =============================================================================
// Evaluation helpers
// =============================================================================

fn fold(value: &str) -> String {
    value.to_lowercase()
}

fn compare(actual: &str, wanted: &str) -> std::cmp::Ordering {
    match (actual.trim().parse::<i64>(), wanted.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => fold(actual).cmp(&fold(wanted)),
    }
}

fn substring_match(
    value: &str,
    initial: &Option<String>,
    any: &[String],
    last: &Option<String>,
) -> bool {
    let mut rest = value;

    if let Some(initial) = initial {
        let initial = fold(initial);
        match rest.strip_prefix(initial.as_str()) {
            Some(tail) => rest = tail,
            None => return false,
        }
    }

    for part in any {
        let part = fold(part);
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }

    match last {
        Some(last) => rest.ends_with(fold(last).as_str()),
        None => true,
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn group() -> DirectoryObject {
        DirectoryObject::new("cn=grp1,cn=groups,dc=example")
            .attr("objectClass", ["top", "posixGroup", "univentionGroup"])
            .attr("cn", ["grp1"])
            .attr("gidNumber", ["5001"])
            .attr("memberUid", ["alice", "bob"])
    }

    #[test]
    fn test_parse_equality_and_presence() {
        assert_eq!(
            Filter::parse("(objectClass=posixGroup)").unwrap(),
            Filter::Equal("objectClass".into(), "posixGroup".into())
        );
        assert_eq!(
            Filter::parse("(uniqueMember=*)").unwrap(),
            Filter::Present("uniqueMember".into())
        );
    }

    #[test]
    fn test_parse_bare_item() {
        let filter = Filter::parse("objectClass=posixGroup").unwrap();
        assert!(filter.matches(&group()));
    }

    #[test]
    fn test_parse_nested_composites() {
        let filter =
            Filter::parse("(&(objectClass=posixGroup)(|(cn=grp1)(cn=grp2))(!(cn=admins)))")
                .unwrap();
        assert_matches!(&filter, Filter::And(children) if children.len() == 3);
        assert!(filter.matches(&group()));
    }

    #[test]
    fn test_case_insensitive_matching() {
        let filter = Filter::parse("(OBJECTCLASS=POSIXGROUP)").unwrap();
        assert!(filter.matches(&group()));
    }

    #[test]
    fn test_substring() {
        assert!(Filter::parse("(cn=gr*)").unwrap().matches(&group()));
        assert!(Filter::parse("(cn=*p1)").unwrap().matches(&group()));
        assert!(Filter::parse("(cn=g*r*1)").unwrap().matches(&group()));
        assert!(!Filter::parse("(cn=x*)").unwrap().matches(&group()));
        assert!(!Filter::parse("(cn=g*1*p)").unwrap().matches(&group()));
    }

    #[test]
    fn test_ordering_numeric() {
        assert!(Filter::parse("(gidNumber>=5000)").unwrap().matches(&group()));
        assert!(!Filter::parse("(gidNumber<=999)").unwrap().matches(&group()));
        // Lexicographic would say "5001" < "999"
        assert!(Filter::parse("(gidNumber>=999)").unwrap().matches(&group()));
    }

    #[test]
    fn test_escapes() {
        let obj = DirectoryObject::new("cn=x").attr("description", ["a*b(c)"]);
        let filter = Filter::parse(r"(description=a\2ab\28c\29)").unwrap();
        assert_eq!(filter, Filter::Equal("description".into(), "a*b(c)".into()));
        assert!(filter.matches(&obj));
    }

    #[test]
    fn test_canonical_display() {
        let filter = Filter::parse("( & (objectClass=posixGroup) (memberUid=*) )").unwrap();
        assert_eq!(filter.to_string(), "(&(objectclass=posixGroup)(memberuid=*))");

        let again = Filter::parse(&filter.to_string()).unwrap();
        assert_eq!(again, filter);
    }

    #[test]
    fn test_attributes() {
        let filter = Filter::parse("(&(objectClass=a)(|(memberUid=*)(objectclass=b)))").unwrap();
        assert_eq!(filter.attributes(), vec!["memberuid", "objectclass"]);
    }

    #[test]
    fn test_invalid_filters() {
        assert_matches!(Filter::parse(""), Err(Error::InvalidFilter { .. }));
        assert_matches!(Filter::parse("(cn=x"), Err(Error::InvalidFilter { .. }));
        assert_matches!(Filter::parse("(&)"), Err(Error::InvalidFilter { .. }));
        assert_matches!(Filter::parse("(novalue)"), Err(Error::InvalidFilter { .. }));
        assert_matches!(Filter::parse("(cn=x)(cn=y)"), Err(Error::InvalidFilter { .. }));
        assert_matches!(Filter::parse("(=x)"), Err(Error::InvalidFilter { .. }));
    }
}
