//! Year 7 curriculum document: topic catalog, scaffolds, glossary and
//! refusal templates. Loaded from JSON with an embedded default so the
//! server always has a curriculum to gate against.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

const EMBEDDED_CURRICULUM: &str = include_str!("../curriculum/year7_nsw.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Curriculum {
    pub meta: CurriculumMeta,
    pub topic_catalog: Vec<TopicEntry>,
    pub system_rules: Vec<String>,
    pub style_guidelines: StyleGuidelines,
    #[serde(default)]
    pub common_misconceptions: Vec<Misconception>,
    #[serde(default)]
    pub scaffolds: BTreeMap<String, Vec<String>>,
    pub glossary: Glossary,
    pub refusal_messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumMeta {
    pub version: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub year_level: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicEntry {
    pub topic: String,
    pub subtopics: Vec<String>,
    pub allowed_verbs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleGuidelines {
    pub tone: String,
    pub format: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Misconception {
    pub topic: String,
    pub pattern: String,
    pub fix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Glossary {
    pub verbs: Vec<GlossaryVerb>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlossaryVerb {
    pub term: String,
    #[serde(default)]
    pub meaning: Option<String>,
}

impl Curriculum {
    /// Load the curriculum from `path` if given, otherwise the embedded
    /// Year 7 NSW document.
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read curriculum from {}", path))?;
                let curriculum: Curriculum = serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse curriculum JSON at {}", path))?;
                tracing::info!(
                    "Loaded curriculum v{} with {} topics from {}",
                    curriculum.meta.version,
                    curriculum.topic_catalog.len(),
                    path
                );
                Ok(curriculum)
            }
            None => Self::embedded(),
        }
    }

    /// The curriculum compiled into the binary.
    pub fn embedded() -> Result<Self> {
        serde_json::from_str(EMBEDDED_CURRICULUM).context("Embedded curriculum is invalid JSON")
    }

    /// Find the catalog entry whose topic name contains the query, or whose
    /// subtopic is contained in the query (both lowercased).
    pub fn find_topic(&self, topic: &str) -> Option<&TopicEntry> {
        let needle = topic.to_lowercase();
        self.topic_catalog.iter().find(|entry| {
            entry.topic.to_lowercase().contains(&needle)
                || entry
                    .subtopics
                    .iter()
                    .any(|sub| needle.contains(&sub.to_lowercase()))
        })
    }

    /// True when the topic (or one of its subtopics) exists in the catalog.
    pub fn topic_in_scope(&self, topic: &str) -> bool {
        self.find_topic(topic).is_some()
    }

    /// Short context line injected into the message history when a topic is
    /// first loaded: `Y7 {topic}: sub1, sub2, sub3`.
    pub fn context_line(&self, topic: &str) -> Option<String> {
        let entry = self
            .topic_catalog
            .iter()
            .find(|entry| entry.topic.to_lowercase().contains(&topic.to_lowercase()))?;
        let subtopics = entry
            .subtopics
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("Y7 {}: {}", entry.topic, subtopics))
    }

    /// The misconception warning for a topic, if one is recorded.
    pub fn misconception_for(&self, topic: &str) -> Option<&Misconception> {
        self.common_misconceptions
            .iter()
            .find(|m| topic.contains(&m.topic))
    }

    /// Refusal text with the template placeholders filled in.
    pub fn refusal_text(&self, prerequisite: &str, suggestion: &str) -> String {
        self.refusal_messages
            .first()
            .map(|template| {
                template
                    .replace("<prerequisite>", prerequisite)
                    .replace("<suggestion>", suggestion)
            })
            .unwrap_or_else(|| {
                format!(
                    "That's beyond Year 7 for now. Let's look at {} instead!",
                    suggestion
                )
            })
    }

    /// All glossary verb terms, used by the definition-request check.
    pub fn glossary_terms(&self) -> impl Iterator<Item = &str> {
        self.glossary.verbs.iter().map(|verb| verb.term.as_str())
    }
}
