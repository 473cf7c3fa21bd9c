//! Fixed category → canonical tag taxonomy.
//!
//! Source tags are mapped through aliases onto canonical tags, and only tags
//! that belong to the event's category survive. Nothing is ever invented.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{normalize_key, slugify};

/// Category every event falls back to. It carries no tags.
pub const FALLBACK_CATEGORY: &str = "other";

const BUILTIN_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "music",
        &[
            "rock", "indie", "hip-hop", "electronic", "jazz", "blues", "folk", "country", "metal",
            "punk", "pop", "classical", "r-and-b", "soul", "latin", "live-music", "dj",
        ],
    ),
    ("comedy", &["stand-up", "improv", "sketch", "open-mic"]),
    (
        "theatre",
        &["musical", "drama", "opera", "dance", "ballet", "cabaret", "burlesque"],
    ),
    (
        "sports",
        &["basketball", "football", "soccer", "baseball", "hockey", "running", "wrestling"],
    ),
    (
        "arts",
        &["gallery", "exhibition", "workshop", "film", "poetry", "literary", "photography"],
    ),
    (
        "food-drink",
        &["beer", "wine", "cocktails", "tasting", "food-festival", "brunch"],
    ),
    (
        "community",
        &["market", "festival", "fundraiser", "meetup", "family", "outdoors", "lgbtq"],
    ),
    (FALLBACK_CATEGORY, &[]),
];

const BUILTIN_TAG_ALIASES: &[(&str, &str)] = &[
    ("hip hop", "hip-hop"),
    ("rap", "hip-hop"),
    ("edm", "electronic"),
    ("house", "electronic"),
    ("techno", "electronic"),
    ("dance electronic", "electronic"),
    ("r b", "r-and-b"),
    ("rnb", "r-and-b"),
    ("alternative", "indie"),
    ("singer songwriter", "folk"),
    ("americana", "folk"),
    ("live music", "live-music"),
    ("concert", "live-music"),
    ("dj set", "dj"),
    ("standup", "stand-up"),
    ("stand up", "stand-up"),
    ("comedy club", "stand-up"),
    ("broadway", "musical"),
    ("musicals", "musical"),
    ("plays", "drama"),
    ("play", "drama"),
    ("nba", "basketball"),
    ("wnba", "basketball"),
    ("nfl", "football"),
    ("ncaa football", "football"),
    ("mls", "soccer"),
    ("nwsl", "soccer"),
    ("mlb", "baseball"),
    ("nhl", "hockey"),
    ("art", "gallery"),
    ("art gallery", "gallery"),
    ("movies", "film"),
    ("cinema", "film"),
    ("craft beer", "beer"),
    ("brewery", "beer"),
    ("farmers market", "market"),
    ("kids", "family"),
    ("family friendly", "family"),
    ("all ages", "family"),
    ("pride", "lgbtq"),
];

/// Ordered keyword → category rules; the first keyword contained in the label wins.
const BUILTIN_CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("comedy", "comedy"),
    ("stand up", "comedy"),
    ("improv", "comedy"),
    ("theatre", "theatre"),
    ("theater", "theatre"),
    ("broadway", "theatre"),
    ("opera", "theatre"),
    ("ballet", "theatre"),
    ("dance performance", "theatre"),
    ("music", "music"),
    ("concert", "music"),
    ("band", "music"),
    ("dj", "music"),
    ("festival", "community"),
    ("sport", "sports"),
    ("nba", "sports"),
    ("nfl", "sports"),
    ("mlb", "sports"),
    ("nhl", "sports"),
    ("mls", "sports"),
    ("game", "sports"),
    ("film", "arts"),
    ("art", "arts"),
    ("exhibit", "arts"),
    ("gallery", "arts"),
    ("food", "food-drink"),
    ("drink", "food-drink"),
    ("beer", "food-drink"),
    ("wine", "food-drink"),
    ("family", "community"),
    ("community", "community"),
    ("market", "community"),
];

/// On-disk override shape (`rules/taxonomy.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxonomyFile {
    #[serde(default)]
    pub version: u32,
    pub categories: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tag_aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub category_keywords: Vec<CategoryKeyword>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryKeyword {
    pub keyword: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Taxonomy {
    categories: BTreeMap<String, BTreeSet<String>>,
    tag_aliases: BTreeMap<String, String>,
    category_keywords: Vec<(String, String)>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Taxonomy {
    pub fn builtin() -> Self {
        Self {
            categories: BUILTIN_CATEGORIES
                .iter()
                .map(|(category, tags)| {
                    (
                        category.to_string(),
                        tags.iter().map(|t| t.to_string()).collect(),
                    )
                })
                .collect(),
            tag_aliases: BUILTIN_TAG_ALIASES
                .iter()
                .map(|(alias, tag)| (normalize_key(alias), tag.to_string()))
                .collect(),
            category_keywords: BUILTIN_CATEGORY_KEYWORDS
                .iter()
                .map(|(k, c)| (normalize_key(k), c.to_string()))
                .collect(),
        }
    }

    /// Build from an override file. The fallback category is always present and
    /// aliases pointing at tags no category owns are discarded.
    pub fn from_file(file: TaxonomyFile) -> Self {
        let mut categories: BTreeMap<String, BTreeSet<String>> = file
            .categories
            .into_iter()
            .map(|(category, tags)| (slugify(&category), tags.iter().map(|t| slugify(t)).collect()))
            .collect();
        categories.entry(FALLBACK_CATEGORY.to_string()).or_default();

        let known: BTreeSet<&String> = categories.values().flatten().collect();
        let tag_aliases = file
            .tag_aliases
            .into_iter()
            .map(|(alias, tag)| (normalize_key(&alias), slugify(&tag)))
            .filter(|(_, tag)| known.contains(tag))
            .collect();
        let category_keywords = if file.category_keywords.is_empty() {
            Self::builtin()
                .category_keywords
                .into_iter()
                .filter(|(_, c)| categories.contains_key(c))
                .collect()
        } else {
            file.category_keywords
                .into_iter()
                .map(|k| (normalize_key(&k.keyword), slugify(&k.category)))
                .filter(|(_, c)| categories.contains_key(c))
                .collect()
        };

        Self {
            categories,
            tag_aliases,
            category_keywords,
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn tags_for(&self, category: &str) -> Option<&BTreeSet<String>> {
        self.categories.get(category)
    }

    pub fn is_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    pub fn allows(&self, category: &str, tag: &str) -> bool {
        self.categories
            .get(category)
            .is_some_and(|tags| tags.contains(tag))
    }

    /// Map a free-text source tag to a canonical tag, whatever its category.
    pub fn canonical_tag(&self, raw: &str) -> Option<String> {
        let key = normalize_key(raw);
        if key.is_empty() {
            return None;
        }
        if let Some(tag) = self.tag_aliases.get(&key) {
            return Some(tag.clone());
        }
        let slug = slugify(&key);
        self.categories
            .values()
            .any(|tags| tags.contains(&slug))
            .then_some(slug)
    }

    /// Canonical tags of `category` found among `raw`. Unmapped tags are dropped.
    pub fn normalize_tags<'a, I>(&self, category: &str, raw: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        raw.into_iter()
            .filter_map(|t| self.canonical_tag(t))
            .filter(|t| self.allows(category, t))
            .collect()
    }

    /// Infer a category from free-text labels, most specific label first.
    pub fn infer_category<'a, I>(&self, labels: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        for label in labels {
            let key = normalize_key(label);
            if key.is_empty() {
                continue;
            }
            let slug = slugify(&key);
            if slug != FALLBACK_CATEGORY && self.categories.contains_key(&slug) {
                return slug;
            }
            let padded = format!(" {key} ");
            for (keyword, category) in &self.category_keywords {
                // Short keywords must match a whole word; longer ones may match inside one.
                let whole_word = padded.contains(&format!(" {keyword} "));
                if whole_word || (keyword.len() > 4 && key.contains(keyword.as_str())) {
                    return category.clone();
                }
            }
        }
        FALLBACK_CATEGORY.to_string()
    }
}
