//! # Lexical Matching
//!
//! Pure helpers behind the search index: tokenizing, relevance tiers,
//! snippet extraction, FTS query building and pattern translation.
//!
//! ## Relevance Tiers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Query: "customer"                                                      │
//! │                                                                         │
//! │  EXACT      field equals the query (case-insensitive)     "Customer"   │
//! │  SUBSTRING  field contains the query                      "CustomersV3"│
//! │  PREFIX     every query term prefixes (or stems to) a     "CustTable   │
//! │             token of the field                             Customers"  │
//! │                                                                         │
//! │  EXACT > SUBSTRING > PREFIX, then field weight:                        │
//! │  name > public_name > collection_name > label_text > category          │
//! │  then record name, then kind (deterministic order)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::types::RecordKind;

/// Characters of context kept on each side of a match in a snippet.
pub const SNIPPET_RADIUS: usize = 24;

// =============================================================================
// Match Tier and Hits
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Prefix = 1,
    Substring = 2,
    Exact = 3,
}

/// The best match of a query against a record's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMatch {
    pub tier: MatchTier,
    /// Index of the matched field in weight order (0 = name).
    pub field_rank: usize,
    pub field: &'static str,
}

impl FieldMatch {
    /// Numeric relevance: the tier plus a bonus for heavier fields.
    pub fn relevance(&self) -> f64 {
        let bonus = (5usize.saturating_sub(self.field_rank)) as f64 / 10.0;
        self.tier as u8 as f64 + bonus
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub kind: RecordKind,
    pub name: String,
    pub relevance: f64,
    pub tier: MatchTier,
    /// Field the best match was found in.
    pub field: String,
    pub snippet: String,
}

/// Sorts hits by relevance (descending), then name, then kind.
pub fn rank_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.kind.cmp(&b.kind))
    });
}

// =============================================================================
// Tokenizing
// =============================================================================

/// Splits text into lowercase tokens on non-alphanumeric characters and
/// camel-case boundaries: `"CustTableV3"` → `["cust", "table", "v3"]`.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;

    for ch in text.chars() {
        if !ch.is_alphanumeric() {
            flush(&mut current, &mut tokens);
            prev = None;
            continue;
        }
        if let Some(p) = prev {
            let camel = p.is_lowercase() && ch.is_uppercase();
            let digit_to_alpha = p.is_ascii_digit() && ch.is_alphabetic();
            if camel || digit_to_alpha {
                flush(&mut current, &mut tokens);
            }
        }
        current.extend(ch.to_lowercase());
        prev = Some(ch);
    }
    flush(&mut current, &mut tokens);
    tokens
}

fn flush(current: &mut String, tokens: &mut Vec<String>) {
    if !current.is_empty() {
        tokens.push(std::mem::take(current));
    }
}

/// Very small suffix stemmer, enough to match plural/verb forms of names.
pub fn stem(word: &str) -> String {
    let word = word.to_lowercase();
    if word.len() <= 4 {
        return word;
    }
    for (suffix, replacement) in [("ies", "y"), ("ing", ""), ("es", ""), ("ed", ""), ("s", "")] {
        if let Some(root) = word.strip_suffix(suffix) {
            if root.len() >= 3 {
                return format!("{root}{replacement}");
            }
        }
    }
    word
}

/// Query terms: alphanumeric runs, lowercased, deduplicated in order.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Extra index text for a record: camel-case tokens and their stems, so the
/// FTS tokenizer sees `cust table v3` inside `CustTableV3`.
pub fn index_terms<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut out: Vec<String> = Vec::new();
    for field in fields {
        for token in tokenize(field) {
            let stemmed = stem(&token);
            if !out.contains(&token) {
                out.push(token.clone());
            }
            if stemmed != token && !out.contains(&stemmed) {
                out.push(stemmed);
            }
        }
    }
    out.join(" ")
}

// =============================================================================
// Scoring
// =============================================================================

/// Scores a query against fields given in weight order.
///
/// Returns `None` when no field matches at any tier.
pub fn score_fields(query: &str, fields: &[(&'static str, &str)]) -> Option<FieldMatch> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let terms = query_terms(&needle);

    let mut best: Option<FieldMatch> = None;
    for (rank, (field, value)) in fields.iter().enumerate() {
        let Some(tier) = tier_for(&needle, &terms, value) else {
            continue;
        };
        let candidate = FieldMatch {
            tier,
            field_rank: rank,
            field: *field,
        };
        best = match best {
            Some(current) if current.tier >= candidate.tier => Some(current),
            _ => Some(candidate),
        };
    }
    best
}

fn tier_for(needle: &str, terms: &[String], value: &str) -> Option<MatchTier> {
    let haystack = value.to_lowercase();
    if haystack == needle {
        return Some(MatchTier::Exact);
    }
    if haystack.contains(needle) {
        return Some(MatchTier::Substring);
    }
    if terms.is_empty() {
        return None;
    }
    let tokens = tokenize(value);
    let all_terms_match = terms.iter().all(|term| {
        let term_stem = stem(term);
        tokens
            .iter()
            .any(|token| token.starts_with(term.as_str()) || stem(token) == term_stem)
    });
    all_terms_match.then_some(MatchTier::Prefix)
}

// =============================================================================
// Snippets
// =============================================================================

/// Extracts a window of `radius` characters around the first occurrence of
/// the query (or of its first matching term) in `text`.
pub fn snippet(text: &str, query: &str, radius: usize) -> String {
    let lower = text.to_lowercase();
    let needle = query.trim().to_lowercase();

    let hit = std::iter::once(needle.clone())
        .chain(query_terms(&needle))
        .filter(|n| !n.is_empty())
        .find_map(|n| lower.find(&n).map(|pos| (pos, n.len())));

    let chars: Vec<char> = text.chars().collect();
    let Some((byte_pos, byte_len)) = hit else {
        return chars.iter().take(radius * 2).collect();
    };

    // Lowercasing can change byte lengths; work in characters of the lowercase form.
    let start_char = lower[..byte_pos].chars().count();
    let match_chars = lower[byte_pos..byte_pos + byte_len].chars().count();
    let from = start_char.saturating_sub(radius);
    let to = (start_char + match_chars + radius).min(chars.len());
    let from = from.min(to);

    let mut out = String::new();
    if from > 0 {
        out.push('…');
    }
    out.extend(chars[from..to].iter());
    if to < chars.len() {
        out.push('…');
    }
    out
}

// =============================================================================
// Query Translation
// =============================================================================

/// Builds an FTS5 MATCH expression requiring every term as a prefix.
///
/// Returns `None` when the text has no searchable terms. Terms are
/// alphanumeric only, so no FTS syntax can leak in.
pub fn fts_match_expression(text: &str) -> Option<String> {
    let terms = query_terms(text);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{t}\"*"))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Translates a wildcard / simple regex pattern to a SQL `LIKE` pattern
/// using `\` as the escape character.
///
/// `*` and `.*` become `%`, `?` and a lone `.` become `_`, `^`/`$` anchor
/// the match; an unanchored pattern without wildcards matches anywhere.
/// Other regex metacharacters are treated as `%`.
pub fn pattern_to_like(pattern: &str) -> String {
    let trimmed = pattern.trim();
    let anchored_start = trimmed.starts_with('^');
    let anchored_end = trimmed.ends_with('$') && trimmed.len() > 1;
    let body = trimmed.trim_start_matches('^');
    let body = if anchored_end {
        &body[..body.len() - 1]
    } else {
        body
    };

    let mut out = String::new();
    let mut wildcard = false;
    let mut chars = body.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '.' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push('%');
                wildcard = true;
            }
            '*' => {
                out.push('%');
                wildcard = true;
            }
            '.' | '?' => {
                out.push('_');
                wildcard = true;
            }
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            '+' | '(' | ')' | '[' | ']' | '|' | '{' | '}' => {
                if !out.ends_with('%') {
                    out.push('%');
                }
                wildcard = true;
            }
            other => out.push(other),
        }
    }

    let open_start = !anchored_start && !wildcard;
    let open_end = !anchored_end && !wildcard;
    format!(
        "{}{}{}",
        if open_start { "%" } else { "" },
        out,
        if open_end { "%" } else { "" }
    )
}

/// Terms worth retrying through lexical search when a pattern matched nothing.
///
/// `"^Cust.*Group$"` → `["cust", "group"]`. Single characters are dropped.
pub fn salient_terms(pattern: &str) -> Vec<String> {
    query_terms(pattern)
        .into_iter()
        .filter(|t| t.chars().count() > 1)
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
