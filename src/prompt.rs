//! Assembles the tutoring system prompt and the outgoing message history:
//! curriculum rules, scaffold steps, misconception warnings, and the
//! summarize-then-window policy for long conversations.

use crate::curriculum::{Curriculum, TopicEntry};
use crate::llm_client::Message;
use crate::store::{ConversationRecord, StoredMessage};

/// Outgoing history longer than this gets its head summarized away.
const MAX_WIRE_MESSAGES: usize = 14;
/// How many recent messages survive the windowing.
const KEEP_RECENT_MESSAGES: usize = 10;
/// At most this many scaffolds are spelled out per prompt.
const MAX_SCAFFOLDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ScaffoldPriority {
    Low,
    Medium,
    High,
}

/// Direct keyword routes into the scaffold table, checked against the
/// resolved topic label.
const SCAFFOLD_KEYWORDS: &[(&str, &[&str], ScaffoldPriority)] = &[
    (
        "fractions_to_decimals",
        &[
            "fraction to decimal",
            "convert fraction",
            "decimal conversion",
            "turn fraction into decimal",
        ],
        ScaffoldPriority::High,
    ),
    (
        "fractions_add_sub",
        &[
            "add fraction",
            "subtract fraction",
            "fraction addition",
            "fraction subtraction",
        ],
        ScaffoldPriority::High,
    ),
    (
        "two_step_equations",
        &["solve equation", "two step", "equation with", "find x"],
        ScaffoldPriority::High,
    ),
    (
        "percent_of_quantity",
        &["percent of", "percentage of", "% of", "find percentage"],
        ScaffoldPriority::High,
    ),
    (
        "area_rectangle",
        &["area rectangle", "rectangle area", "length width"],
        ScaffoldPriority::Medium,
    ),
    (
        "area_triangle",
        &["area triangle", "triangle area", "base height"],
        ScaffoldPriority::Medium,
    ),
    (
        "area_parallelogram",
        &["area parallelogram", "parallelogram area"],
        ScaffoldPriority::Medium,
    ),
    (
        "area_trapezium",
        &["area trapezium", "trapezium area", "parallel sides"],
        ScaffoldPriority::Medium,
    ),
    (
        "angles_with_parallel_lines",
        &["parallel lines", "corresponding angle", "alternate angle"],
        ScaffoldPriority::Medium,
    ),
    (
        "solving_proportions",
        &["proportion", "ratio problem", "cross multiply"],
        ScaffoldPriority::Medium,
    ),
];

/// Build the full system prompt for a topic: persona, core rules, style,
/// topic scope, scaffold steps and misconception warning.
pub fn build_system_prompt(topic: &str, curriculum: &Curriculum) -> String {
    let topic_entry = curriculum.find_topic(topic);

    let core_rules = curriculum.system_rules.join(" ");
    let style_guide = format!(
        "{}, {}",
        curriculum.style_guidelines.tone,
        curriculum.style_guidelines.format.join(" then ")
    );

    let mut topic_context = String::new();
    let mut scaffold_instructions = String::new();

    if let Some(entry) = topic_entry {
        topic_context.push_str(&format!("\nTOPIC: {}", entry.topic));
        topic_context.push_str(&format!(
            "\nSCOPE: {}",
            entry.subtopics.iter().take(4).cloned().collect::<Vec<_>>().join(", ")
        ));
        topic_context.push_str(&format!("\nALLOWED: {}", entry.allowed_verbs.join(", ")));

        let scaffolds = relevant_scaffolds(curriculum, entry, topic);
        if !scaffolds.is_empty() {
            scaffold_instructions.push_str(
                "\n\nCRITICAL SCAFFOLD STEPS - YOU MUST GUIDE STUDENTS THROUGH THESE EXACT STEPS:",
            );
            for (key, steps) in &scaffolds {
                scaffold_instructions
                    .push_str(&format!("\n\nFor {} problems:", key.replace('_', " ")));
                for (index, step) in steps.iter().enumerate() {
                    scaffold_instructions.push_str(&format!("\n  Step {}: {}", index + 1, step));
                }
                scaffold_instructions.push_str("\n  Ask questions to guide students through EACH step");
                scaffold_instructions.push_str("\n  Do NOT skip steps or give direct answers");
            }
            scaffold_instructions.push_str(
                "\n\nWhen a problem matches a scaffold, identify it, ask a question leading to Step 1, and only move on after the student engages.",
            );
        }

        if let Some(misconception) = curriculum.misconception_for(&entry.topic) {
            topic_context.push_str(&format!(
                "\nWATCH: {} - fix: {}",
                misconception.pattern, misconception.fix
            ));
        }
    }

    format!(
        "You are StudyBuddy, NSW Year 7 mathematics tutor.\n\n\
         CORE RULES: {}\n\
         STYLE: {}{}{}\n\n\
         CRITICAL: Use Socratic method ONLY - ask guiding questions, NEVER give direct answers or final results.\n\
         Never use emojis. Ask ONE question at a time. Guide discovery step by step.\n\
         When teaching procedures, ask questions that lead students through the exact scaffold steps.\n\
         ALWAYS follow the scaffold steps when they apply to the student's question.",
        core_rules, style_guide, topic_context, scaffold_instructions
    )
}

/// Select up to three scaffolds for a topic: direct keyword matches first
/// (highest priority wins), topic/subtopic matches only when nothing
/// matched directly.
fn relevant_scaffolds<'a>(
    curriculum: &'a Curriculum,
    entry: &TopicEntry,
    topic: &str,
) -> Vec<(String, &'a Vec<String>)> {
    let topic_lower = topic.to_lowercase();
    let mut matched: Vec<(String, &Vec<String>, ScaffoldPriority)> = Vec::new();

    for (key, keywords, priority) in SCAFFOLD_KEYWORDS {
        if keywords.iter().any(|keyword| topic_lower.contains(keyword)) {
            if let Some(steps) = curriculum.scaffolds.get(*key) {
                matched.push((key.to_string(), steps, *priority));
            }
        }
    }

    if matched.is_empty() {
        for (key, steps) in &curriculum.scaffolds {
            let scaffold_topic = key.replace('_', " ").to_lowercase();
            let relevant = entry.topic.to_lowercase().contains(&scaffold_topic)
                || entry.subtopics.iter().any(|sub| {
                    let sub = sub.to_lowercase();
                    sub.contains(&scaffold_topic) || scaffold_topic.contains(&sub)
                });
            if relevant {
                matched.push((key.clone(), steps, ScaffoldPriority::Low));
            }
        }
    }

    matched.sort_by(|a, b| b.2.cmp(&a.2));
    matched.dedup_by(|a, b| a.0 == b.0);
    matched
        .into_iter()
        .take(MAX_SCAFFOLDS)
        .map(|(key, steps, _)| (key, steps))
        .collect()
}

/// Compress old turns into a one-line recap kept as leading context.
pub fn summarize_old_context(messages: &[StoredMessage]) -> String {
    let important = messages
        .iter()
        .filter(|m| m.role == "assistant" || (m.role == "user" && m.content.len() > 10))
        .take(4)
        .map(|m| {
            let excerpt: String = m.content.chars().take(40).collect();
            if m.role == "user" {
                format!("Student asked: {}", excerpt)
            } else {
                format!("I guided: {}", excerpt)
            }
        })
        .collect::<Vec<_>>()
        .join(". ");

    if important.is_empty() {
        String::new()
    } else {
        format!("Earlier in our conversation: {}...", important)
    }
}

/// Build the wire-format history for a turn.
///
/// Injects the curriculum context line when the record hasn't loaded it for
/// the current topic, windows long histories down to the recent tail plus a
/// summary, and folds system-role entries into `[Context: ...]` user
/// messages for the completion call.
pub fn prepare_history(
    record: &ConversationRecord,
    detected_topic: &str,
    curriculum: &Curriculum,
) -> Vec<Message> {
    let mut outgoing: Vec<(String, String)> = record
        .messages
        .iter()
        .map(|m| (m.role.clone(), m.content.clone()))
        .collect();

    let needs_context = !record.curriculum_loaded
        || record.last_curriculum_topic.as_deref() != Some(detected_topic);
    if needs_context {
        if let Some(context) = curriculum.context_line(detected_topic) {
            tracing::debug!("Added curriculum context: {}", context);
            outgoing.insert(0, ("system".to_string(), format!("[{}]", context)));
        }
    }

    if outgoing.len() > MAX_WIRE_MESSAGES {
        let split = outgoing.len() - KEEP_RECENT_MESSAGES;
        let old: Vec<StoredMessage> = outgoing[..split]
            .iter()
            .map(|(role, content)| StoredMessage {
                role: role.clone(),
                content: content.clone(),
                timestamp: record.created_at,
            })
            .collect();
        let summary = summarize_old_context(&old);
        outgoing = outgoing.split_off(split);
        if !summary.is_empty() {
            outgoing.insert(0, ("system".to_string(), summary));
        }
        tracing::debug!(
            "Summarized {} old messages, keeping {} recent ones",
            old.len(),
            outgoing.len()
        );
    }

    outgoing
        .into_iter()
        .map(|(role, content)| {
            if role == "system" {
                Message::user(format!("[Context: {}]", content))
            } else {
                Message {
                    role,
                    content,
                }
            }
        })
        .collect()
}
