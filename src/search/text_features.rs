//! Locale-aware text features for mixed Japanese/English business text.
//!
//! [`TextFeatureExtractor`] is compiled once from a [`TextFeatureConfig`] and
//! is a pure function of its input afterwards. The semantic index uses its
//! keywords and business terms, the facet index its amounts and entities, and
//! query handling its expansion and locale flags.
//!
//! # Processing
//!
//! 1. **NFKC + lowercase** - full-width Latin/digits fold to ASCII, half-width
//!    katakana to full-width.
//! 2. **Script segmentation** - runs break at separators and at transitions
//!    between Latin/digits, kanji, hiragana and katakana.
//! 3. **Keywords** - runs of at least two characters that are not purely
//!    numeric. Kanji/katakana compounds also emit character bigrams so that
//!    `売上` matches `売上高`. Short hiragana runs are particles and dropped.
//! 4. **Business terms** - organizations, currency units, fiscal periods,
//!    departments and a business vocabulary, all configurable.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::config::ConfigError;

/// Shortest run accepted as a keyword.
pub const MIN_KEYWORD_CHARS: usize = 2;

/// Hiragana runs shorter than this are treated as particles/okurigana.
const MIN_HIRAGANA_KEYWORD_CHARS: usize = 3;

static QUARTER_JA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^第\s*([1-4一二三四])\s*四半期$").expect("quarter regex"));
static QUARTER_EN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:q([1-4])|([1-4])q)$").expect("quarter regex"));
static FISCAL_YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:fy\s*(\d{4}|\d{2})|(\d{4})年度)$").expect("fiscal year regex")
});
static FOREIGN_AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[$¥€£]\s?(\d[\d,]*(?:\.\d+)?)(?:\s*(thousand|million|billion|k|m|b)\b)?")
        .expect("foreign amount regex")
});

static DEFAULT_EXTRACTOR: Lazy<TextFeatureExtractor> = Lazy::new(|| {
    TextFeatureExtractor::new(&TextFeatureConfig::default())
        .expect("default text feature patterns compile")
});

/// Extractor compiled from [`TextFeatureConfig::default`].
pub fn default_extractor() -> &'static TextFeatureExtractor {
    &DEFAULT_EXTRACTOR
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LexicalCategory {
    Business,
    General,
}

impl LexicalCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            LexicalCategory::Business => "business",
            LexicalCategory::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleFlags {
    pub has_japanese: bool,
    pub has_latin: bool,
    /// More than one of Latin, kanji, hiragana, katakana present.
    pub mixed_script: bool,
    pub has_numbers: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextFeatures {
    pub keywords: Vec<String>,
    pub business_terms: Vec<String>,
    pub locale: LocaleFlags,
    pub category: LexicalCategory,
}

/// Pattern lists and vocabularies behind the extractor.
///
/// The defaults are hand-tuned for Japanese corporate reports; every list can
/// be replaced from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextFeatureConfig {
    /// Regexes matched against normalized (NFKC, lowercase) text.
    pub organization_patterns: Vec<String>,
    /// Currency unit → multiplier in base units.
    pub currency_units: BTreeMap<String, f64>,
    /// Regexes for fiscal periods. Capture group 1, when present, is the term.
    pub fiscal_patterns: Vec<String>,
    pub department_suffixes: Vec<String>,
    pub business_keywords: Vec<String>,
    pub synonyms: BTreeMap<String, Vec<String>>,
    pub japanese_qualifier: String,
    pub english_qualifier: String,
    pub max_expansions: usize,
}

impl Default for TextFeatureConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let currency_units = [
            ("兆円", 1e12),
            ("億円", 1e8),
            ("千万円", 1e7),
            ("百万円", 1e6),
            ("万円", 1e4),
            ("千円", 1e3),
            ("円", 1.0),
        ]
        .into_iter()
        .map(|(unit, mult)| (unit.to_string(), mult))
        .collect();
        let synonyms = [
            ("sales", &["revenue"][..]),
            ("revenue", &["sales"][..]),
            ("profit", &["earnings"][..]),
            ("budget", &["予算"][..]),
            ("manager", &["部長"][..]),
            ("売上", &["売上高", "販売"][..]),
            ("利益", &["収益"][..]),
            ("予算", &["budget"][..]),
            ("会議", &["ミーティング"][..]),
        ]
        .into_iter()
        .map(|(term, alts)| (term.to_string(), strings(alts)))
        .collect();

        Self {
            organization_patterns: strings(&[
                r"(?:株式会社|有限会社|合同会社)\s?[\p{Han}\p{Katakana}ー\p{Latin}0-9&]+",
                r"[\p{Han}\p{Katakana}ー\p{Latin}0-9&]+\s?(?:株式会社|有限会社|\(株\))",
                r"[a-z][a-z0-9&]*(?:\s[a-z][a-z0-9&]*)?\s(?:inc|corp|corporation|ltd|llc)\b\.?",
            ]),
            currency_units,
            fiscal_patterns: strings(&[
                r"第\s*[1-4一二三四]\s*四半期",
                r"(?:^|[^a-z0-9])(q[1-4])(?:$|[^a-z0-9])",
                r"(?:^|[^a-z0-9])([1-4]q)(?:$|[^a-z0-9])",
                r"(?:^|[^a-z0-9])(fy\s?(?:\d{4}|\d{2}))(?:$|[^0-9])",
                r"\d{4}年度",
                r"上半期|下半期|上期|下期|通期|年度末|期末|期首",
            ]),
            department_suffixes: strings(&["本部", "事業部", "部", "課", "室", "グループ", "チーム"]),
            business_keywords: strings(&[
                "sales", "revenue", "profit", "earnings", "budget", "forecast", "fiscal",
                "quarter", "margin", "cost", "customer", "contract", "invoice", "manager",
                "director", "department", "kpi", "売上", "売上高", "利益", "営業利益",
                "経常利益", "予算", "決算", "顧客", "契約", "請求", "原価", "部長", "課長",
                "社長", "会議", "取引",
            ]),
            synonyms,
            japanese_qualifier: "業務".to_string(),
            english_qualifier: "business".to_string(),
            max_expansions: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Alnum,
    Kanji,
    Hiragana,
    Katakana,
    Separator,
}

fn classify(c: char) -> Script {
    match c {
        '・' | '゠' => Script::Separator,
        '々' | '〆' => Script::Kanji,
        '\u{3040}'..='\u{309F}' => Script::Hiragana,
        '\u{30A0}'..='\u{30FF}' | '\u{31F0}'..='\u{31FF}' => Script::Katakana,
        '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}' => {
            Script::Kanji
        }
        c if c.is_alphanumeric() => Script::Alnum,
        _ => Script::Separator,
    }
}

/// NFKC-normalize and lowercase.
pub fn normalize_text(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

fn segment(normalized: &str) -> Vec<(Script, String)> {
    let mut runs: Vec<(Script, String)> = Vec::new();
    for c in normalized.chars() {
        let script = classify(c);
        if script == Script::Separator {
            continue_separator(&mut runs);
            continue;
        }
        match runs.last_mut() {
            Some((last, run)) if *last == script && !run.is_empty() => run.push(c),
            _ => runs.push((script, c.to_string())),
        }
    }
    runs.retain(|(script, run)| *script != Script::Separator && !run.is_empty());
    runs
}

// Separators close the current run so the next char starts a fresh one.
fn continue_separator(runs: &mut Vec<(Script, String)>) {
    if !matches!(runs.last(), Some((Script::Separator, _))) {
        runs.push((Script::Separator, String::new()));
    }
}

fn keywords_from_segments(segments: &[(Script, String)]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |term: String| {
        if seen.insert(term.clone()) {
            out.push(term);
        }
    };
    for (script, run) in segments {
        let chars: Vec<char> = run.chars().collect();
        match script {
            Script::Alnum => {
                if chars.len() >= MIN_KEYWORD_CHARS && !chars.iter().all(|c| c.is_numeric()) {
                    push(run.clone());
                }
            }
            Script::Kanji | Script::Katakana => {
                if chars.len() >= MIN_KEYWORD_CHARS {
                    push(run.clone());
                }
                if chars.len() > MIN_KEYWORD_CHARS {
                    for pair in chars.windows(2) {
                        push(pair.iter().collect());
                    }
                }
            }
            Script::Hiragana => {
                if chars.len() >= MIN_HIRAGANA_KEYWORD_CHARS {
                    push(run.clone());
                }
            }
            Script::Separator => {}
        }
    }
    out
}

/// Keywords of `text` without business-term recognition.
///
/// Used by the hash embedder, which only needs stable tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    keywords_from_segments(&segment(&normalize_text(text)))
}

/// Script and digit flags of `text`.
pub fn detect_locale(text: &str) -> LocaleFlags {
    locale_flags(&normalize_text(text))
}

fn locale_flags(normalized: &str) -> LocaleFlags {
    let (mut latin, mut kanji, mut hiragana, mut katakana, mut numbers) =
        (false, false, false, false, false);
    for c in normalized.chars() {
        match classify(c) {
            Script::Kanji => kanji = true,
            Script::Hiragana => hiragana = true,
            Script::Katakana => katakana = true,
            Script::Alnum if c.is_numeric() => numbers = true,
            Script::Alnum if c.is_alphabetic() => latin = true,
            _ => {}
        }
    }
    let scripts = [latin, kanji, hiragana, katakana]
        .iter()
        .filter(|present| **present)
        .count();
    LocaleFlags {
        has_japanese: kanji || hiragana || katakana,
        has_latin: latin,
        mixed_script: scripts > 1,
        has_numbers: numbers,
    }
}

/// Canonical spelling for a matched fiscal-period marker: quarters become
/// `q1`..`q4`, fiscal years `fy2024`.
pub fn canonical_period(raw: &str) -> String {
    let compact: String = raw.split_whitespace().collect();
    if let Some(caps) = QUARTER_JA_RE.captures(&compact) {
        let n = match &caps[1] {
            "一" => "1",
            "二" => "2",
            "三" => "3",
            "四" => "4",
            digit => digit,
        };
        return format!("q{n}");
    }
    if let Some(caps) = QUARTER_EN_RE.captures(&compact)
        && let Some(n) = caps.get(1).or_else(|| caps.get(2))
    {
        return format!("q{}", n.as_str());
    }
    if let Some(caps) = FISCAL_YEAR_RE.captures(&compact)
        && let Some(year) = caps.get(1).or_else(|| caps.get(2))
    {
        let year = year.as_str();
        return if year.len() == 2 {
            format!("fy20{year}")
        } else {
            format!("fy{year}")
        };
    }
    compact
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn clean_term(raw: &str) -> String {
    raw.trim()
        .trim_end_matches('.')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct TextFeatureExtractor {
    config: TextFeatureConfig,
    organizations: Vec<Regex>,
    currency: Option<Regex>,
    fiscal: Vec<Regex>,
    departments: Option<Regex>,
}

impl TextFeatureExtractor {
    pub fn new(config: &TextFeatureConfig) -> Result<Self, ConfigError> {
        let organizations = config
            .organization_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let fiscal = config
            .fiscal_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        // Longest unit first: the regex engine prefers the leftmost alternative.
        let mut units: Vec<&String> = config.currency_units.keys().collect();
        units.sort_by_key(|unit| std::cmp::Reverse(unit.chars().count()));
        let currency = if units.is_empty() {
            None
        } else {
            let alternation = units
                .iter()
                .map(|u| regex::escape(u))
                .collect::<Vec<_>>()
                .join("|");
            Some(compile(&format!(r"(\d[\d,]*(?:\.\d+)?)\s*({alternation})"))?)
        };

        let mut suffixes: Vec<&String> = config.department_suffixes.iter().collect();
        suffixes.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));
        let departments = if suffixes.is_empty() {
            None
        } else {
            let alternation = suffixes
                .iter()
                .map(|s| regex::escape(s))
                .collect::<Vec<_>>()
                .join("|");
            Some(compile(&format!(
                r"[\p{{Han}}\p{{Katakana}}ー]{{2,10}}?(?:{alternation})"
            ))?)
        };

        if config.max_expansions == 0 {
            return Err(ConfigError::InvalidValue {
                name: "text.max_expansions",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            config: config.clone(),
            organizations,
            currency,
            fiscal,
            departments,
        })
    }

    pub fn config(&self) -> &TextFeatureConfig {
        &self.config
    }

    pub fn extract(&self, text: &str) -> TextFeatures {
        let normalized = normalize_text(text);
        let keywords = keywords_from_segments(&segment(&normalized));
        let business_terms = self.business_terms_normalized(&normalized, &keywords);
        let category = if business_terms.is_empty() {
            LexicalCategory::General
        } else {
            LexicalCategory::Business
        };
        TextFeatures {
            keywords,
            business_terms,
            locale: locale_flags(&normalized),
            category,
        }
    }

    fn business_terms_normalized(&self, normalized: &str, keywords: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut terms = Vec::new();
        let mut push = |term: String| {
            if !term.is_empty() && seen.insert(term.clone()) {
                terms.push(term);
            }
        };

        for org in self.organizations_normalized(normalized) {
            push(org);
        }
        if let Some(re) = &self.currency {
            for caps in re.captures_iter(normalized) {
                if let Some(unit) = caps.get(2) {
                    push(unit.as_str().to_string());
                }
            }
        }
        for re in &self.fiscal {
            for caps in re.captures_iter(normalized) {
                if let Some(m) = caps.get(1).or_else(|| caps.get(0)) {
                    push(canonical_period(m.as_str()));
                }
            }
        }
        for dept in self.departments_normalized(normalized) {
            push(dept);
        }

        let keyword_set: HashSet<&str> = keywords.iter().map(String::as_str).collect();
        for kw in &self.config.business_keywords {
            let kw = kw.to_lowercase();
            let present = if kw.is_ascii() {
                keyword_set.contains(kw.as_str())
            } else {
                normalized.contains(&kw)
            };
            if present {
                push(kw);
            }
        }
        terms
    }

    fn organizations_normalized(&self, normalized: &str) -> Vec<String> {
        let mut out = Vec::new();
        for re in &self.organizations {
            for m in re.find_iter(normalized) {
                let term = clean_term(m.as_str());
                if !term.is_empty() && !out.contains(&term) {
                    out.push(term);
                }
            }
        }
        out
    }

    fn departments_normalized(&self, normalized: &str) -> Vec<String> {
        let Some(re) = &self.departments else {
            return Vec::new();
        };
        let mut out: Vec<String> = Vec::new();
        for m in re.find_iter(normalized) {
            let term = m.as_str().to_string();
            if !out.contains(&term) {
                out.push(term);
            }
        }
        out
    }

    /// Organization names found in `text`, normalized.
    pub fn organizations(&self, text: &str) -> Vec<String> {
        self.organizations_normalized(&normalize_text(text))
    }

    /// Department names (`営業部`, `開発本部`, ...) found in `text`.
    pub fn departments(&self, text: &str) -> Vec<String> {
        self.departments_normalized(&normalize_text(text))
    }

    /// Monetary amounts in base currency units, using the configured
    /// multipliers (`3億円` → 3e8) and `$1.2 million`-style amounts.
    pub fn monetary_amounts(&self, text: &str) -> Vec<f64> {
        let normalized = normalize_text(text);
        let mut amounts = Vec::new();
        if let Some(re) = &self.currency {
            for caps in re.captures_iter(&normalized) {
                let Some(value) = caps.get(1).and_then(|m| parse_number(m.as_str())) else {
                    continue;
                };
                let multiplier = caps
                    .get(2)
                    .and_then(|unit| self.config.currency_units.get(unit.as_str()))
                    .copied()
                    .unwrap_or(1.0);
                amounts.push(value * multiplier);
            }
        }
        for caps in FOREIGN_AMOUNT_RE.captures_iter(&normalized) {
            let Some(value) = caps.get(1).and_then(|m| parse_number(m.as_str())) else {
                continue;
            };
            let multiplier = match caps.get(2).map(|m| m.as_str()) {
                Some("thousand" | "k") => 1e3,
                Some("million" | "m") => 1e6,
                Some("billion" | "b") => 1e9,
                _ => 1.0,
            };
            amounts.push(value * multiplier);
        }
        amounts
    }

    /// Alternate phrasings of `query`: the query itself first, then synonym
    /// substitutions, then every phrasing with a domain qualifier appended.
    ///
    /// Single pass. Substitutions combine across all synonym terms found in
    /// the query, a synonym already present is never substituted in, and a
    /// trailing qualifier is set aside and re-applied, so every expansion of
    /// an expansion is already in the original expansion set.
    pub fn expand_query(&self, query: &str) -> Vec<String> {
        let base = normalize_text(query.trim());
        if base.is_empty() {
            return Vec::new();
        }
        let qualifiers = [
            self.config.japanese_qualifier.to_lowercase(),
            self.config.english_qualifier.to_lowercase(),
        ];
        let (core, trailing_qualifier) = match qualifiers.iter().find_map(|q| {
            base.strip_suffix(q.as_str())
                .filter(|rest| !q.is_empty() && rest.ends_with(char::is_whitespace))
                .map(|rest| rest.trim_end().to_string())
        }) {
            Some(core) if !core.is_empty() => (core, true),
            _ => (base.clone(), false),
        };

        let vocabulary: Vec<String> = self
            .config
            .synonyms
            .iter()
            .flat_map(|(term, alternates)| std::iter::once(term).chain(alternates))
            .map(|s| s.to_lowercase())
            .collect();

        let mut variants = vec![core.clone()];
        for (term, alternates) in &self.config.synonyms {
            if !contains_term(&core, term, &vocabulary) {
                continue;
            }
            let mut added = Vec::new();
            for variant in &variants {
                if !contains_term(variant, term, &vocabulary) {
                    continue;
                }
                for alt in alternates {
                    if contains_term(variant, alt, &vocabulary) {
                        continue;
                    }
                    let candidate = substitute(variant, term, alt, &vocabulary);
                    if !variants.contains(&candidate) && !added.contains(&candidate) {
                        added.push(candidate);
                    }
                }
            }
            variants.extend(added);
        }

        let mut out = vec![base.clone()];
        let mut push = |candidate: String| {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        };
        if !trailing_qualifier {
            for variant in &variants {
                push(variant.clone());
            }
        }

        let qualified_elsewhere = !trailing_qualifier
            && qualifiers
                .iter()
                .any(|q| !q.is_empty() && contains_term(&core, q, &vocabulary));
        let business = self.extract(&core).category == LexicalCategory::Business;
        if (business || trailing_qualifier) && !qualified_elsewhere {
            for variant in &variants {
                let qualifier = if detect_locale(variant).has_japanese {
                    &qualifiers[0]
                } else {
                    &qualifiers[1]
                };
                if !qualifier.is_empty() {
                    push(format!("{variant} {qualifier}"));
                }
            }
        }

        out.truncate(self.config.max_expansions);
        out
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

fn contains_term(normalized: &str, term: &str, vocabulary: &[String]) -> bool {
    let term = term.to_lowercase();
    if term.is_ascii() {
        normalized
            .split_whitespace()
            .any(|word| word.trim_matches(|c: char| !c.is_alphanumeric()) == term)
    } else {
        !free_occurrences(normalized, &term, vocabulary).is_empty()
    }
}

/// Byte ranges of `term` in `text` that do not sit inside a longer
/// vocabulary entry (`売上` inside `売上高` is not an occurrence of `売上`).
fn free_occurrences(text: &str, term: &str, vocabulary: &[String]) -> Vec<(usize, usize)> {
    let covering: Vec<(usize, usize)> = vocabulary
        .iter()
        .filter(|entry| entry.len() > term.len() && entry.contains(term))
        .flat_map(|entry| {
            text.match_indices(entry.as_str())
                .map(|(start, m)| (start, start + m.len()))
        })
        .collect();
    text.match_indices(term)
        .map(|(start, m)| (start, start + m.len()))
        .filter(|&(start, end)| !covering.iter().any(|&(cs, ce)| cs <= start && end <= ce))
        .collect()
}

fn substitute(normalized: &str, term: &str, alt: &str, vocabulary: &[String]) -> String {
    let term = term.to_lowercase();
    if term.is_ascii() {
        normalized
            .split_whitespace()
            .map(|word| {
                if word.trim_matches(|c: char| !c.is_alphanumeric()) == term {
                    word.replacen(term.as_str(), alt, 1)
                } else {
                    word.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        let mut out = String::with_capacity(normalized.len());
        let mut cursor = 0;
        for (start, end) in free_occurrences(normalized, &term, vocabulary) {
            out.push_str(&normalized[cursor..start]);
            out.push_str(alt);
            cursor = end;
        }
        out.push_str(&normalized[cursor..]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> &'static TextFeatureExtractor {
        default_extractor()
    }

    #[test]
    fn keywords_skip_numbers_and_short_tokens() {
        let features = extractor().extract("Sales rose 15% in Q3, a 2x jump");
        assert!(features.keywords.contains(&"sales".to_string()));
        assert!(features.keywords.contains(&"rose".to_string()));
        assert!(features.keywords.contains(&"q3".to_string()));
        assert!(features.keywords.contains(&"2x".to_string()));
        assert!(!features.keywords.contains(&"15".to_string()));
        assert!(!features.keywords.iter().any(|k| k == "a" || k == "%"));
    }

    #[test]
    fn japanese_compounds_emit_bigrams() {
        let keywords = tokenize("売上高が増加しました");
        assert!(keywords.contains(&"売上高".to_string()));
        assert!(keywords.contains(&"売上".to_string()));
        assert!(keywords.contains(&"増加".to_string()));
        // Single hiragana particle.
        assert!(!keywords.contains(&"が".to_string()));
        assert!(keywords.contains(&"しました".to_string()));
    }

    #[test]
    fn full_width_text_is_folded() {
        let keywords = tokenize("ＳＡＬＥＳ　ｒｅｐｏｒｔ");
        assert_eq!(keywords, vec!["sales".to_string(), "report".to_string()]);
    }

    #[test]
    fn business_terms_cover_each_pattern_family() {
        let features =
            extractor().extract("株式会社山田商事の営業部は第3四半期に売上5億円を達成");
        let terms = &features.business_terms;
        assert!(terms.iter().any(|t| t.starts_with("株式会社山田商事")), "{terms:?}");
        assert!(terms.contains(&"億円".to_string()), "{terms:?}");
        assert!(terms.contains(&"q3".to_string()), "{terms:?}");
        assert!(terms.contains(&"営業部".to_string()), "{terms:?}");
        assert!(terms.contains(&"売上".to_string()), "{terms:?}");
        assert_eq!(features.category, LexicalCategory::Business);
    }

    #[test]
    fn english_business_terms_and_periods() {
        let features = extractor().extract("Acme Corp. revenue for FY24 beat Q2 forecast");
        let terms = &features.business_terms;
        assert!(terms.contains(&"acme corp".to_string()), "{terms:?}");
        assert!(terms.contains(&"fy2024".to_string()), "{terms:?}");
        assert!(terms.contains(&"q2".to_string()), "{terms:?}");
        assert!(terms.contains(&"revenue".to_string()), "{terms:?}");
    }

    #[test]
    fn general_text_has_no_business_terms() {
        let features = extractor().extract("system latency improved 30%");
        assert!(features.business_terms.is_empty());
        assert_eq!(features.category, LexicalCategory::General);
        assert!(features.locale.has_numbers);
        assert!(features.locale.has_latin);
        assert!(!features.locale.has_japanese);
        assert!(!features.locale.mixed_script);
    }

    #[test]
    fn locale_flags_detect_mixed_scripts() {
        let flags = extractor().extract("KPIレポートを確認").locale;
        assert!(flags.has_japanese);
        assert!(flags.has_latin);
        assert!(flags.mixed_script);
        assert!(!flags.has_numbers);
    }

    #[test]
    fn canonical_period_forms() {
        assert_eq!(canonical_period("第 二 四半期"), "q2");
        assert_eq!(canonical_period("3q"), "q3");
        assert_eq!(canonical_period("fy 23"), "fy2023");
        assert_eq!(canonical_period("2024年度"), "fy2024");
        assert_eq!(canonical_period("上半期"), "上半期");
    }

    #[test]
    fn monetary_amounts_apply_multipliers() {
        let amounts = extractor().monetary_amounts("売上は1,200万円、利益は3億円、海外は$2.5 million");
        assert_eq!(amounts.len(), 3);
        assert!((amounts[0] - 12_000_000.0).abs() < 1e-6);
        assert!((amounts[1] - 300_000_000.0).abs() < 1e-6);
        assert!((amounts[2] - 2_500_000.0).abs() < 1e-6);
    }

    #[test]
    fn unit_prefers_longest_alternative() {
        let amounts = extractor().monetary_amounts("5百万円");
        assert_eq!(amounts, vec![5_000_000.0]);
    }

    #[test]
    fn expansion_adds_synonyms_and_qualifier() {
        let expansions = extractor().expand_query("sales");
        assert_eq!(expansions[0], "sales");
        assert!(expansions.contains(&"revenue".to_string()));
        assert!(expansions.contains(&"sales business".to_string()));
    }

    #[test]
    fn expansion_is_stable_on_expanded_input() {
        for query in ["売上", "sales", "予算", "売上高の推移", "sales budget", "売上 業務"] {
            let first = extractor().expand_query(query);
            for expanded in &first {
                let again = extractor().expand_query(expanded);
                assert_eq!(again[0], *expanded);
                for candidate in &again {
                    assert!(
                        first.contains(candidate),
                        "`{expanded}` expanded to `{candidate}`, outside {first:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn synonym_inside_longer_term_is_not_rewritten() {
        let expansions = extractor().expand_query("売上高");
        assert!(!expansions.iter().any(|e| e.contains("販売")), "{expansions:?}");
        assert_eq!(expansions[0], "売上高");

        let first = extractor().expand_query("売上");
        assert!(first.contains(&"売上高".to_string()), "{first:?}");
        assert!(first.contains(&"販売".to_string()), "{first:?}");
        assert!(first.contains(&"売上 業務".to_string()), "{first:?}");
    }

    #[test]
    fn expansion_respects_cap_and_empty_input() {
        assert!(extractor().expand_query("   ").is_empty());
        let config = TextFeatureConfig {
            max_expansions: 1,
            ..TextFeatureConfig::default()
        };
        let extractor = TextFeatureExtractor::new(&config).unwrap();
        assert_eq!(extractor.expand_query("sales"), vec!["sales".to_string()]);
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let config = TextFeatureConfig {
            organization_patterns: vec!["(unclosed".to_string()],
            ..TextFeatureConfig::default()
        };
        let err = TextFeatureExtractor::new(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
