//! Frontmatter protocol.
//!
//! A document optionally starts with a `---` line, a run of `key: value`
//! lines and a closing `---` line. Values are quoted or bare strings, inline
//! `[a, b]` lists, or YAML block lists. A malformed or missing block parses
//! as an empty map with the whole text as body; callers default missing keys.

use regex::Regex;

/// A frontmatter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::List(_) => None,
        }
    }

    /// Lists as is; a non-empty scalar as a one-item list.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.clone(),
            Self::Text(s) if s.trim().is_empty() => Vec::new(),
            Self::Text(s) => vec![s.clone()],
        }
    }
}

/// Ordered key-value metadata block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frontmatter {
    fields: Vec<(String, FieldValue)>,
}

impl Frontmatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Non-empty trimmed text value.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(FieldValue::as_text)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key).map(FieldValue::to_list).unwrap_or_default()
    }

    /// Insert or replace, keeping the original position of an existing key.
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn insert_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, FieldValue::Text(value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A parsed document: metadata plus free-text body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub frontmatter: Frontmatter,
    pub body: String,
}

impl Document {
    /// Parse a document. Never fails.
    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        match split_block(text) {
            Some((block, body)) => match parse_block(block) {
                Some(frontmatter) => Self {
                    frontmatter,
                    body: body.to_string(),
                },
                None => Self::without_frontmatter(text),
            },
            None => Self::without_frontmatter(text),
        }
    }

    fn without_frontmatter(text: &str) -> Self {
        Self {
            frontmatter: Frontmatter::new(),
            body: text.to_string(),
        }
    }

    /// Serialize back to text. Text values are always double-quoted.
    pub fn render(&self) -> String {
        if self.frontmatter.is_empty() {
            return self.body.clone();
        }
        let mut out = String::from("---\n");
        for (key, value) in self.frontmatter.iter() {
            out.push_str(key);
            out.push_str(": ");
            match value {
                FieldValue::Text(s) => out.push_str(&quote(s)),
                FieldValue::List(items) => {
                    let quoted: Vec<String> = items.iter().map(|i| quote(i)).collect();
                    out.push('[');
                    out.push_str(&quoted.join(", "));
                    out.push(']');
                }
            }
            out.push('\n');
        }
        out.push_str("---");
        if !self.body.starts_with('\n') && !self.body.starts_with("\r\n") {
            out.push('\n');
        }
        out.push_str(&self.body);
        out
    }
}

fn is_delimiter(line: &str) -> bool {
    line.trim_end() == "---"
}

/// Split `text` into the raw block between delimiters and the body after the
/// closing delimiter line (its newline excluded).
fn split_block(text: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    let mut lines = text.split_inclusive('\n');

    let first = lines.next()?;
    if !is_delimiter(first) {
        return None;
    }
    offset += first.len();
    let block_start = offset;

    for line in lines {
        if is_delimiter(line) {
            let block = &text[block_start..offset];
            let without_newline = line.trim_end_matches(['\n', '\r']);
            let body_start = offset + without_newline.len();
            return Some((block, &text[body_start..]));
        }
        offset += line.len();
    }
    None
}

fn parse_block(block: &str) -> Option<Frontmatter> {
    let mut frontmatter = Frontmatter::new();
    // Key whose value is being collected as a YAML block list.
    let mut open_list: Option<String> = None;

    for raw in block.lines() {
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(item) = trimmed.strip_prefix('-').filter(|_| trimmed != "---") {
            let key = open_list.as_ref()?;
            if !item.is_empty() && !item.starts_with(' ') {
                return None;
            }
            let value = parse_scalar(item.trim())?;
            let mut items = frontmatter.list(key);
            items.push(value);
            frontmatter.insert(key.clone(), FieldValue::List(items));
            continue;
        }

        if line.starts_with(char::is_whitespace) {
            return None;
        }

        let (key, value) = line.split_once(':')?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || "_-.".contains(c)) {
            return None;
        }

        let value = value.trim();
        if value.is_empty() {
            frontmatter.insert_text(key, "");
            open_list = Some(key.to_string());
        } else {
            frontmatter.insert(key, parse_value(value)?);
            open_list = None;
        }
    }

    Some(frontmatter)
}

fn parse_value(raw: &str) -> Option<FieldValue> {
    if let Some(inner) = raw.strip_prefix('[') {
        let inner = strip_comment(inner).trim_end().strip_suffix(']')?;
        return split_list(inner).map(FieldValue::List);
    }
    parse_scalar(raw).map(FieldValue::Text)
}

/// Parse a quoted or bare scalar, dropping a trailing ` # comment`.
fn parse_scalar(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.starts_with('"') || raw.starts_with('\'') {
        let (value, rest) = take_quoted(raw)?;
        let rest = rest.trim();
        if !rest.is_empty() && !rest.starts_with('#') {
            return None;
        }
        return Some(value);
    }
    Some(strip_comment(raw).trim().to_string())
}

fn strip_comment(raw: &str) -> &str {
    match raw.find(" #") {
        Some(idx) => &raw[..idx],
        None => raw,
    }
}

/// Read one quoted string from the front of `raw`; returns it and the rest.
fn take_quoted(raw: &str) -> Option<(String, &str)> {
    let mut chars = raw.char_indices();
    let (_, quote_char) = chars.next()?;
    let mut value = String::new();

    while let Some((idx, c)) = chars.next() {
        match (quote_char, c) {
            ('"', '\\') => {
                let (_, escaped) = chars.next()?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            }
            ('\'', '\'') => {
                // '' is an escaped single quote
                if raw[idx + 1..].starts_with('\'') {
                    chars.next();
                    value.push('\'');
                } else {
                    return Some((value, &raw[idx + 1..]));
                }
            }
            ('"', '"') => return Some((value, &raw[idx + 1..])),
            _ => value.push(c),
        }
    }
    None
}

fn split_list(inner: &str) -> Option<Vec<String>> {
    let mut items = Vec::new();
    let mut rest = inner.trim();
    while !rest.is_empty() {
        let (item, tail) = if rest.starts_with('"') || rest.starts_with('\'') {
            let (value, tail) = take_quoted(rest)?;
            (value, tail.trim_start())
        } else {
            match rest.find(',') {
                Some(idx) => (rest[..idx].trim().to_string(), &rest[idx..]),
                None => (rest.trim().to_string(), ""),
            }
        };
        items.push(item);
        rest = match tail.strip_prefix(',') {
            Some(t) => t.trim_start(),
            None if tail.is_empty() => tail,
            None => return None,
        };
    }
    Some(items)
}

fn quote(s: &str) -> String {
    let escaped = s
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{escaped}\"")
}

/// A markdown ATX heading: level and title.
fn heading(line: &str) -> Option<(usize, &str)> {
    let line = line.trim_end_matches('\r');
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    Some((level, title))
}

/// Collect the section under the first heading whose title satisfies
/// `matches`. Stops at a heading of equal or higher level or a bare `---`
/// line; deeper headings inside the section are dropped.
fn find_section(body: &str, matches: impl Fn(&str) -> bool) -> Option<String> {
    let mut lines = body.lines();
    let level = loop {
        let line = lines.next()?;
        match heading(line) {
            Some((level, title)) if matches(title) => break level,
            _ => {}
        }
    };

    let mut kept = Vec::new();
    for line in lines {
        if line.trim_end() == "---" {
            break;
        }
        if let Some((inner, _)) = heading(line) {
            if inner <= level {
                break;
            }
            continue;
        }
        kept.push(line.trim_end_matches('\r'));
    }
    Some(kept.join("\n").trim().to_string())
}

/// Text under the heading titled `name` (case-insensitive), trimmed.
/// Empty if the heading is absent.
pub fn extract_section(body: &str, name: &str) -> String {
    let wanted = name.trim().trim_end_matches(':');
    find_section(body, |title| {
        title.trim_end_matches(':').trim().eq_ignore_ascii_case(wanted)
    })
    .unwrap_or_default()
}

/// Text under the first `Action <n>: <kind>` heading. Empty if absent.
pub fn extract_action_section(body: &str, kind: &str) -> String {
    let pattern = format!(r"(?i)^action\s*\d+\s*:\s*{}\b", regex::escape(kind.trim()));
    let Ok(re) = Regex::new(&pattern) else {
        return String::new();
    };
    find_section(body, |title| re.is_match(title)).unwrap_or_default()
}
