//! Facet index: categorical, numerical-range, temporal and entity dimensions.
//!
//! Each dimension is a two-level map `facet -> value -> positions`. A fragment
//! can carry any number of values in any facet. Filtering ANDs constraints and
//! ORs the values inside one constraint; an empty constraint list matches
//! nothing.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::model::types::ContentFragment;
use crate::search::text_features::{TextFeatureExtractor, normalize_text, tokenize};

pub const CONTENT_TYPE_FACET: &str = "content_type";
pub const CATEGORY_FACET: &str = "category";
pub const TOPIC_FACET: &str = "topic";
pub const AMOUNT_RANGE_FACET: &str = "amount_range";
pub const QUARTER_FACET: &str = "quarter";
pub const HALF_FACET: &str = "half";
pub const FISCAL_YEAR_FACET: &str = "fiscal_year";
pub const YEAR_FACET: &str = "year";
pub const MONTH_FACET: &str = "month";
pub const ORGANIZATION_FACET: &str = "organization";
pub const DEPARTMENT_FACET: &str = "department";
pub const ROLE_FACET: &str = "role";

// Neighbours are checked in `standalone`, so adjacent matches do not
// compete for a shared delimiter.
static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:19|20)\d{2}").expect("year regex"));
static MONTH_JA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:1[0-2]|0?[1-9])月").expect("month regex"));
static MONTH_EN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\b",
    )
    .expect("month regex")
});
// `may` counts as a month only next to a day or year.
static MAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:may\s+\d{1,4}|\d{1,2}(?:st|nd|rd|th)?\s+may)\b").expect("may regex")
});
static HALF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"上半期|上期|下半期|下期|\bh[12]\b|\b(?:first|second) half\b").expect("half regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacetDimension {
    Categorical,
    Numerical,
    Temporal,
    Entity,
}

impl FacetDimension {
    pub const ALL: [FacetDimension; 4] = [
        FacetDimension::Categorical,
        FacetDimension::Numerical,
        FacetDimension::Temporal,
        FacetDimension::Entity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FacetDimension::Categorical => "categorical",
            FacetDimension::Numerical => "numerical",
            FacetDimension::Temporal => "temporal",
            FacetDimension::Entity => "entity",
        }
    }
}

impl fmt::Display for FacetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FacetDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "categorical" | "category" => Ok(FacetDimension::Categorical),
            "numerical" | "numeric" => Ok(FacetDimension::Numerical),
            "temporal" | "time" => Ok(FacetDimension::Temporal),
            "entity" => Ok(FacetDimension::Entity),
            other => Err(format!("unknown facet dimension: {other}")),
        }
    }
}

/// Classification rules for the facet index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacetRules {
    /// Facets with more distinct values keep only the most populated ones.
    pub max_values: usize,
    /// Amounts below this are `small`.
    pub small_amount_max: f64,
    /// Amounts at or above this are `large`; everything between is `medium`.
    pub large_amount_min: f64,
    /// Topic name -> keywords that put a fragment in it.
    pub topics: BTreeMap<String, Vec<String>>,
    pub roles: Vec<String>,
    /// Fragment metadata keys copied verbatim into categorical facets.
    pub metadata_keys: Vec<String>,
}

impl Default for FacetRules {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let topics = [
            (
                "finance",
                &[
                    "sales", "revenue", "profit", "budget", "cost", "margin", "earnings", "売上",
                    "利益", "予算", "原価", "決算", "収益",
                ][..],
            ),
            (
                "hr",
                &[
                    "hiring", "employee", "staff", "manager", "announcement", "人事", "採用",
                    "社員", "異動",
                ][..],
            ),
            (
                "technology",
                &[
                    "system", "latency", "server", "software", "engineering", "api", "システム",
                    "開発", "サーバー",
                ][..],
            ),
            (
                "operations",
                &["logistics", "inventory", "supply", "shipping", "在庫", "物流", "出荷"][..],
            ),
        ]
        .into_iter()
        .map(|(topic, words)| (topic.to_string(), strings(words)))
        .collect();

        Self {
            max_values: 100,
            small_amount_max: 1_000_000.0,
            large_amount_min: 100_000_000.0,
            topics,
            roles: strings(&[
                "ceo", "cfo", "cto", "director", "manager", "engineer", "社長", "取締役", "部長",
                "課長", "担当者",
            ]),
            metadata_keys: strings(&["sheet_name", "section"]),
        }
    }
}

impl FacetRules {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_values == 0 {
            return Err(ConfigError::InvalidValue {
                name: "facet.max_values",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !self.small_amount_max.is_finite()
            || !self.large_amount_min.is_finite()
            || self.small_amount_max < 0.0
            || self.small_amount_max > self.large_amount_min
        {
            return Err(ConfigError::InvalidValue {
                name: "facet.small_amount_max",
                reason: format!(
                    "need 0 <= small_amount_max ({}) <= large_amount_min ({})",
                    self.small_amount_max, self.large_amount_min
                ),
            });
        }
        Ok(())
    }

    pub fn amount_bucket(&self, amount: f64) -> &'static str {
        if amount < self.small_amount_max {
            "small"
        } else if amount >= self.large_amount_min {
            "large"
        } else {
            "medium"
        }
    }
}

/// One classified facet value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FacetValue {
    pub dimension: FacetDimension,
    pub facet: String,
    pub value: String,
}

impl FacetValue {
    fn new(dimension: FacetDimension, facet: &str, value: impl Into<String>) -> Self {
        Self {
            dimension,
            facet: facet.to_string(),
            value: value.into(),
        }
    }
}

/// `dimension:facet=value[,value...]`, e.g. `temporal:quarter=q3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FacetConstraint {
    pub dimension: FacetDimension,
    pub facet: String,
    pub values: Vec<String>,
}

impl FacetConstraint {
    pub fn new(
        dimension: FacetDimension,
        facet: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            dimension,
            facet: facet.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl FromStr for FacetConstraint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (dimension, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("expected dimension:facet=value, got `{s}`"))?;
        let (facet, values) = rest
            .split_once('=')
            .ok_or_else(|| format!("expected dimension:facet=value, got `{s}`"))?;
        let values: Vec<String> = values
            .split(',')
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect();
        if facet.trim().is_empty() || values.is_empty() {
            return Err(format!("facet name and at least one value are required in `{s}`"));
        }
        Ok(Self {
            dimension: dimension.parse()?,
            facet: facet.trim().to_string(),
            values,
        })
    }
}

/// Applies [`FacetRules`] and the text extractor to fragments and queries.
#[derive(Debug, Clone, Copy)]
pub struct FacetClassifier<'a> {
    rules: &'a FacetRules,
    extractor: &'a TextFeatureExtractor,
}

fn has_keyword(normalized: &str, tokens: &HashSet<String>, keyword: &str) -> bool {
    let keyword = keyword.to_lowercase();
    if keyword.is_ascii() {
        tokens.contains(&keyword)
    } else {
        normalized.contains(&keyword)
    }
}

impl<'a> FacetClassifier<'a> {
    pub fn new(rules: &'a FacetRules, extractor: &'a TextFeatureExtractor) -> Self {
        Self { rules, extractor }
    }

    /// All facet values of a fragment, deduplicated and sorted.
    pub fn classify_fragment(&self, fragment: &ContentFragment) -> Vec<FacetValue> {
        let mut values = self.classify_text(&fragment.text);
        values.push(FacetValue::new(
            FacetDimension::Categorical,
            CONTENT_TYPE_FACET,
            fragment.kind.to_lowercase(),
        ));
        let category = self.extractor.extract(&fragment.text).category;
        values.push(FacetValue::new(
            FacetDimension::Categorical,
            CATEGORY_FACET,
            category.as_str(),
        ));
        for key in &self.rules.metadata_keys {
            if let Some(value) = fragment.metadata.get(key)
                && !value.trim().is_empty()
            {
                values.push(FacetValue::new(
                    FacetDimension::Categorical,
                    key,
                    value.trim().to_lowercase(),
                ));
            }
        }
        values.sort();
        values.dedup();
        values
    }

    /// Facet values implied by free text: topics, amount ranges, periods and
    /// entities. Fragment-only facets (content type, category, metadata) are
    /// not derived.
    pub fn classify_text(&self, text: &str) -> Vec<FacetValue> {
        let normalized = normalize_text(text);
        let tokens: HashSet<String> = tokenize(text).into_iter().collect();
        let mut values = Vec::new();

        for (topic, keywords) in &self.rules.topics {
            if keywords.iter().any(|kw| has_keyword(&normalized, &tokens, kw)) {
                values.push(FacetValue::new(FacetDimension::Categorical, TOPIC_FACET, topic));
            }
        }

        for amount in self.extractor.monetary_amounts(text) {
            values.push(FacetValue::new(
                FacetDimension::Numerical,
                AMOUNT_RANGE_FACET,
                self.rules.amount_bucket(amount),
            ));
        }

        self.temporal_values(&normalized, &mut values);

        for org in self.extractor.organizations(text) {
            values.push(FacetValue::new(FacetDimension::Entity, ORGANIZATION_FACET, org));
        }
        for dept in self.extractor.departments(text) {
            values.push(FacetValue::new(FacetDimension::Entity, DEPARTMENT_FACET, dept));
        }
        for role in &self.rules.roles {
            if has_keyword(&normalized, &tokens, role) {
                values.push(FacetValue::new(
                    FacetDimension::Entity,
                    ROLE_FACET,
                    role.to_lowercase(),
                ));
            }
        }

        values.sort();
        values.dedup();
        values
    }

    fn temporal_values(&self, normalized: &str, values: &mut Vec<FacetValue>) {
        for term in self.extractor.extract(normalized).business_terms {
            let is_quarter = term.len() == 2
                && term.starts_with('q')
                && term[1..].chars().all(|c| ('1'..='4').contains(&c));
            if is_quarter {
                values.push(FacetValue::new(FacetDimension::Temporal, QUARTER_FACET, term));
            } else if term.starts_with("fy") && term[2..].chars().all(|c| c.is_ascii_digit()) {
                values.push(FacetValue::new(FacetDimension::Temporal, FISCAL_YEAR_FACET, term));
            }
        }
        for m in HALF_RE.find_iter(normalized) {
            let half = match m.as_str() {
                "上半期" | "上期" | "h1" | "first half" => "h1",
                _ => "h2",
            };
            values.push(FacetValue::new(FacetDimension::Temporal, HALF_FACET, half));
        }
        let years = standalone(&YEAR_RE, normalized, |c| c.is_ascii_alphanumeric(), |c| {
            c.is_ascii_digit()
        });
        for year in years {
            values.push(FacetValue::new(FacetDimension::Temporal, YEAR_FACET, year));
        }
        for month in standalone(&MONTH_JA_RE, normalized, |c| c.is_ascii_digit(), |_| false) {
            if let Ok(month) = month.trim_end_matches('月').parse::<u8>() {
                values.push(FacetValue::new(
                    FacetDimension::Temporal,
                    MONTH_FACET,
                    format!("{month:02}"),
                ));
            }
        }
        if MAY_RE.is_match(normalized) {
            values.push(FacetValue::new(FacetDimension::Temporal, MONTH_FACET, "05"));
        }
        for caps in MONTH_EN_RE.captures_iter(normalized) {
            let Some(name) = caps.get(1) else { continue };
            let month = match &name.as_str()[..3] {
                "jan" => 1,
                "feb" => 2,
                "mar" => 3,
                "apr" => 4,
                "jun" => 6,
                "jul" => 7,
                "aug" => 8,
                "sep" => 9,
                "oct" => 10,
                "nov" => 11,
                _ => 12,
            };
            values.push(FacetValue::new(
                FacetDimension::Temporal,
                MONTH_FACET,
                format!("{month:02}"),
            ));
        }
    }
}

/// Matches of `re` whose neighbouring characters are not rejected by
/// `before` / `after`.
fn standalone<'t>(
    re: &Regex,
    text: &'t str,
    before: impl Fn(char) -> bool,
    after: impl Fn(char) -> bool,
) -> Vec<&'t str> {
    re.find_iter(text)
        .filter(|m| {
            !text[..m.start()].chars().next_back().is_some_and(&before)
                && !text[m.end()..].chars().next().is_some_and(&after)
        })
        .map(|m| m.as_str())
        .collect()
}

type FacetMap = BTreeMap<String, BTreeMap<String, BTreeSet<u32>>>;

/// One fragment scored by query-derived facet overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacetHit {
    pub position: u32,
    /// Fraction of the derived facet values the fragment carries.
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetIndex {
    categorical: FacetMap,
    numerical: FacetMap,
    temporal: FacetMap,
    entity: FacetMap,
    fragment_count: usize,
}

impl FacetIndex {
    /// Classify every fragment (in parallel) and index the values by position.
    pub fn build(fragments: &[ContentFragment], classifier: &FacetClassifier<'_>) -> Self {
        let classified: Vec<Vec<FacetValue>> = fragments
            .par_iter()
            .map(|fragment| classifier.classify_fragment(fragment))
            .collect();

        let mut index = Self {
            fragment_count: fragments.len(),
            ..Self::default()
        };
        for (position, values) in classified.into_iter().enumerate() {
            let position = position as u32;
            for value in values {
                index
                    .dimension_mut(value.dimension)
                    .entry(value.facet)
                    .or_default()
                    .entry(value.value)
                    .or_default()
                    .insert(position);
            }
        }
        index.cap_values(classifier.rules.max_values);
        index
    }

    fn cap_values(&mut self, max_values: usize) {
        for dimension in FacetDimension::ALL {
            for (facet, values) in self.dimension_mut(dimension).iter_mut() {
                if values.len() <= max_values {
                    continue;
                }
                let mut ranked: Vec<(String, usize)> =
                    values.iter().map(|(v, set)| (v.clone(), set.len())).collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                let keep: HashSet<String> =
                    ranked.into_iter().take(max_values).map(|(v, _)| v).collect();
                let before = values.len();
                values.retain(|value, _| keep.contains(value));
                tracing::debug!(
                    dimension = dimension.as_str(),
                    facet = facet.as_str(),
                    before,
                    after = values.len(),
                    "capped facet values"
                );
            }
        }
    }

    fn dimension_map(&self, dimension: FacetDimension) -> &FacetMap {
        match dimension {
            FacetDimension::Categorical => &self.categorical,
            FacetDimension::Numerical => &self.numerical,
            FacetDimension::Temporal => &self.temporal,
            FacetDimension::Entity => &self.entity,
        }
    }

    fn dimension_mut(&mut self, dimension: FacetDimension) -> &mut FacetMap {
        match dimension {
            FacetDimension::Categorical => &mut self.categorical,
            FacetDimension::Numerical => &mut self.numerical,
            FacetDimension::Temporal => &mut self.temporal,
            FacetDimension::Entity => &mut self.entity,
        }
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    /// Value -> positions for one facet.
    pub fn facet(
        &self,
        dimension: FacetDimension,
        facet: &str,
    ) -> Option<&BTreeMap<String, BTreeSet<u32>>> {
        self.dimension_map(dimension).get(facet)
    }

    /// `(dimension, facet, distinct values)` for every facet.
    pub fn summary(&self) -> Vec<(FacetDimension, String, usize)> {
        FacetDimension::ALL
            .iter()
            .flat_map(|dim| {
                self.dimension_map(*dim)
                    .iter()
                    .map(move |(facet, values)| (*dim, facet.clone(), values.len()))
            })
            .collect()
    }

    /// Positions matching any of the constraint's values.
    pub fn matching(&self, constraint: &FacetConstraint) -> BTreeSet<u32> {
        let Some(values) = self.facet(constraint.dimension, &constraint.facet) else {
            return BTreeSet::new();
        };
        constraint
            .values
            .iter()
            .filter_map(|value| values.get(value))
            .flat_map(|set| set.iter().copied())
            .collect()
    }

    /// Positions satisfying every constraint. No constraints match nothing.
    pub fn filter(&self, constraints: &[FacetConstraint]) -> BTreeSet<u32> {
        let Some((first, rest)) = constraints.split_first() else {
            return BTreeSet::new();
        };
        self.filter_within(&self.matching(first), rest)
    }

    /// Narrow `candidates` by further constraints; with none, `candidates`
    /// come back unchanged.
    pub fn filter_within(
        &self,
        candidates: &BTreeSet<u32>,
        constraints: &[FacetConstraint],
    ) -> BTreeSet<u32> {
        let mut current = candidates.clone();
        for constraint in constraints {
            if current.is_empty() {
                break;
            }
            let matching = self.matching(constraint);
            current.retain(|pos| matching.contains(pos));
        }
        current
    }

    /// Score fragments by the fraction of `derived` values they carry.
    pub fn search_derived(&self, derived: &[FacetValue], k: usize) -> Vec<FacetHit> {
        if derived.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for value in derived {
            let Some(positions) = self
                .facet(value.dimension, &value.facet)
                .and_then(|values| values.get(&value.value))
            else {
                continue;
            };
            for pos in positions {
                *counts.entry(*pos).or_default() += 1;
            }
        }
        let total = derived.len() as f32;
        let mut hits: Vec<FacetHit> = counts
            .into_iter()
            .map(|(position, count)| FacetHit {
                position,
                score: count as f32 / total,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.position.cmp(&b.position))
        });
        hits.truncate(k);
        hits
    }
}
