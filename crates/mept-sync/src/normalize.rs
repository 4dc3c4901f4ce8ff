//! Listing name normalization, spec extraction and identity.
//!
//! Extraction is table driven: each table is an ordered list of
//! [`ExtractionRule`]s and the first rule that yields a value wins, so the
//! more specific patterns sit above the generic ones.

use lazy_static::lazy_static;
use mept_core::{Category, SpecAttributes};
use regex::{Captures, Regex};

/// Store-presentation words that never distinguish one model from another.
pub const DEFAULT_NOISE_WORDS: &[&str] = &[
    "apple",
    "samsung",
    "google",
    "new",
    "brand",
    "official",
    "genuine",
    "unlocked",
    "smartphone",
];

/// Non-alphanumeric characters that survive normalization (`s24+`).
pub const DEFAULT_RETAINED_SYMBOLS: &[char] = &['+'];

#[derive(Debug, Clone)]
pub struct Normalizer {
    noise_words: Vec<String>,
    retained_symbols: Vec<char>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_NOISE_WORDS.iter().copied(), DEFAULT_RETAINED_SYMBOLS)
    }
}

impl Normalizer {
    pub fn new<I, S>(noise_words: I, retained_symbols: &[char]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            noise_words: noise_words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
            retained_symbols: retained_symbols.to_vec(),
        }
    }

    /// Lowercase, replace anything outside the retained set with spaces,
    /// collapse whitespace and drop noise tokens. Idempotent and total.
    pub fn normalize(&self, raw: &str) -> String {
        raw.to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || self.retained_symbols.contains(&c) {
                    c
                } else {
                    ' '
                }
            })
            .collect::<String>()
            .split_whitespace()
            .filter(|token| !self.noise_words.iter().any(|w| w == token))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn normalize_opt(&self, raw: Option<&str>) -> String {
        raw.map(|r| self.normalize(r)).unwrap_or_default()
    }
}

/// Normalize with the default noise words and retained symbols.
pub fn normalize(raw: &str) -> String {
    Normalizer::default().normalize(raw)
}

/// Lowercase ASCII alphanumeric runs joined by `_`. A retained `+` becomes
/// its own `plus` run so `s24+` and `s24` stay distinct.
pub fn slug(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .replace('+', " plus ")
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Stable listing id: a pure function of store and canonical name. Slugs never
/// contain `__`, so it separates the two parts unambiguously.
pub fn listing_id(store: &str, canonical_name: &str) -> String {
    format!("{}__{}", slug(store), slug(canonical_name))
}

/// One row of an extraction table.
pub struct ExtractionRule<T> {
    pub name: &'static str,
    pub pattern: Regex,
    pub extract: fn(&Regex, &str) -> Option<T>,
}

impl<T> ExtractionRule<T> {
    fn new(name: &'static str, pattern: &str, extract: fn(&Regex, &str) -> Option<T>) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).expect("extraction rule pattern compiles"),
            extract,
        }
    }

    pub fn apply(&self, text: &str) -> Option<T> {
        (self.extract)(&self.pattern, text)
    }
}

/// Evaluate `rules` in order; the first one producing a value wins.
pub fn first_match<T>(rules: &[ExtractionRule<T>], text: &str) -> Option<(&'static str, T)> {
    rules
        .iter()
        .find_map(|rule| rule.apply(text).map(|value| (rule.name, value)))
}

lazy_static! {
    static ref CHIP: Regex = Regex::new(r"\bm([1-5])(?:\s?(pro|max))?\b").unwrap();
    static ref CASE_MM: Regex = Regex::new(r"\b(\d{2})\s?mm\b").unwrap();

    pub static ref MODEL_RULES: Vec<ExtractionRule<String>> = vec![
        ExtractionRule::new(
            "iphone",
            r"\biphone\s?(\d{1,2}|se|xr|xs|x)(?:\s?(pro\s?max|pro|plus|max|mini|e))?\b",
            iphone_key,
        ),
        ExtractionRule::new(
            "ipad",
            r"\bipad(?:\s(pro|air|mini))?(?:\s(\d{1,2})(?:st|nd|rd|th)?(?:\s?gen(?:eration)?)?)?\b",
            ipad_key,
        ),
        ExtractionRule::new(
            "macbook",
            r"\bmacbook\s(air|pro)(?:\s(1[3-6]))?\b",
            macbook_key,
        ),
        ExtractionRule::new(
            "apple-watch",
            r"\bwatch\s(?:series\s?(\d{1,2})|(ultra)(?:\s?(\d))?|(se))\b",
            watch_key,
        ),
        ExtractionRule::new(
            "airpods",
            r"\bairpods(?:\s(pro|max))?(?:\s(\d)(?:st|nd|rd|th)?(?:\s?gen(?:eration)?)?)?\b",
            airpods_key,
        ),
        ExtractionRule::new(
            "galaxy-foldable",
            r"\bgalaxy\sz\s?(fold|flip)\s?(\d)\b",
            galaxy_foldable_key,
        ),
        ExtractionRule::new(
            "galaxy-tab",
            r"\bgalaxy\stab\s([sa])\s?(\d{1,2})(?:(\+)|\s?(ultra|plus|fe|lite)\b|\b)",
            galaxy_tab_key,
        ),
        ExtractionRule::new(
            "galaxy",
            r"\bgalaxy\s([saf])\s?(\d{1,3})(?:(\+)|\s?(ultra|plus|fe)\b|\b)",
            galaxy_key,
        ),
        ExtractionRule::new(
            "pixel",
            r"\bpixel\s?(\d{1,2})(?:\s?(pro\s?xl|pro\s?fold|pro|a)\b|\b)",
            pixel_key,
        ),
    ];

    pub static ref STORAGE_RULES: Vec<ExtractionRule<u32>> = vec![
        ExtractionRule::new(
            "labelled-storage",
            r"\b(\d{1,4})\s?(gb|tb)\s(?:ssd|storage|flash|rom)\b",
            labelled_storage,
        ),
        ExtractionRule::new("first-capacity", r"\b(\d{1,4})\s?(gb|tb)\b", first_capacity),
    ];

    pub static ref CATEGORY_RULES: Vec<ExtractionRule<Category>> = vec![
        ExtractionRule::new("iphone", r"iphone", |re, t| re.is_match(t).then_some(Category::IPhone)),
        ExtractionRule::new("macbook", r"macbook|\bi?mac\b", |re, t| re.is_match(t).then_some(Category::MacBook)),
        ExtractionRule::new("ipad", r"ipad", |re, t| re.is_match(t).then_some(Category::IPad)),
        ExtractionRule::new("watch", r"watch", |re, t| re.is_match(t).then_some(Category::AppleWatch)),
        ExtractionRule::new("airpods", r"airpods", |re, t| re.is_match(t).then_some(Category::AirPods)),
        ExtractionRule::new("samsung", r"samsung|galaxy", |re, t| re.is_match(t).then_some(Category::Samsung)),
        ExtractionRule::new("pixel", r"pixel", |re, t| re.is_match(t).then_some(Category::GooglePixel)),
        ExtractionRule::new("laptop", r"laptop|notebook", |re, t| re.is_match(t).then_some(Category::Laptop)),
        ExtractionRule::new("tablet", r"tablet", |re, t| re.is_match(t).then_some(Category::Tablet)),
        ExtractionRule::new("audio", r"headphone|earbud|airpod", |re, t| re.is_match(t).then_some(Category::Audio)),
    ];
}

fn group<'t>(caps: &Captures<'t>, i: usize) -> &'t str {
    caps.get(i).map(|m| m.as_str()).unwrap_or_default()
}

fn squash(s: &str) -> String {
    s.split_whitespace().collect()
}

fn chip_suffix(text: &str) -> String {
    CHIP.captures(text)
        .map(|c| format!("m{}{}", group(&c, 1), group(&c, 2)))
        .unwrap_or_default()
}

fn iphone_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    Some(format!("iphone{}{}", group(&caps, 1), squash(group(&caps, 2))))
}

fn ipad_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    Some(format!(
        "ipad{}{}{}",
        group(&caps, 1),
        group(&caps, 2),
        chip_suffix(text)
    ))
}

fn macbook_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    Some(format!(
        "macbook{}{}{}",
        group(&caps, 1),
        group(&caps, 2),
        chip_suffix(text)
    ))
}

fn watch_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    let line = if let Some(series) = caps.get(1) {
        format!("s{}", series.as_str())
    } else if caps.get(2).is_some() {
        format!("ultra{}", group(&caps, 3))
    } else {
        "se".to_string()
    };
    let case = CASE_MM
        .captures(text)
        .map(|c| format!("{}mm", group(&c, 1)))
        .unwrap_or_default();
    Some(format!("watch{line}{case}"))
}

fn airpods_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    Some(format!("airpods{}{}", group(&caps, 1), group(&caps, 2)))
}

fn galaxy_foldable_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    Some(format!("galaxyz{}{}", group(&caps, 1), group(&caps, 2)))
}

fn galaxy_tier(caps: &Captures<'_>, plus_group: usize, word_group: usize) -> String {
    if caps.get(plus_group).is_some() {
        "plus".to_string()
    } else {
        group(caps, word_group).to_string()
    }
}

fn galaxy_tab_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    Some(format!(
        "galaxytab{}{}{}",
        group(&caps, 1),
        group(&caps, 2),
        galaxy_tier(&caps, 3, 4)
    ))
}

fn galaxy_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    Some(format!(
        "galaxy{}{}{}",
        group(&caps, 1),
        group(&caps, 2),
        galaxy_tier(&caps, 3, 4)
    ))
}

fn pixel_key(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    Some(format!("pixel{}{}", group(&caps, 1), squash(group(&caps, 2))))
}

fn capacity_gb(amount: &str, unit: &str) -> Option<u32> {
    let amount: u32 = amount.parse().ok()?;
    let gb = if unit == "tb" { amount.checked_mul(1024)? } else { amount };
    (gb > 0).then_some(gb)
}

fn labelled_storage(re: &Regex, text: &str) -> Option<u32> {
    let caps = re.captures(text)?;
    capacity_gb(group(&caps, 1), group(&caps, 2))
}

/// First capacity that is not immediately labelled as memory.
fn first_capacity(re: &Regex, text: &str) -> Option<u32> {
    re.captures_iter(text).find_map(|caps| {
        let end = caps.get(0)?.end();
        let following = text[end..].trim_start();
        if ["ram", "memory", "unified"].iter().any(|w| following.starts_with(w)) {
            return None;
        }
        capacity_gb(group(&caps, 1), group(&caps, 2))
    })
}

/// Pull model key and storage out of a canonical name. Fails open: when no
/// model rule matches the result is empty and the listing stays unclustered.
pub fn extract_spec(canonical_name: &str) -> SpecAttributes {
    let Some((_, model_key)) = first_match(MODEL_RULES.as_slice(), canonical_name) else {
        return SpecAttributes::default();
    };
    SpecAttributes {
        storage_gb: first_match(STORAGE_RULES.as_slice(), canonical_name).map(|(_, gb)| gb),
        model_key: Some(model_key),
    }
}

pub fn detect_category(canonical_name: &str) -> Category {
    first_match(CATEGORY_RULES.as_slice(), canonical_name)
        .map(|(_, category)| category)
        .unwrap_or_default()
}
