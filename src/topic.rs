//! Topic routing: maps a raw student message to a curriculum topic label,
//! gates it against the Year 7 scope, and recognises short follow-ups that
//! should stay on the current topic.

use crate::curriculum::Curriculum;

/// Label used when nothing matches and for brand-new conversations.
pub const DEFAULT_TOPIC: &str = "Mathematics";

/// Surface patterns that mark a message as a follow-up to the current
/// conversation rather than a new question.
const FOLLOW_UP_PATTERNS: &[&str] = &[
    r"^\d+$",
    r"^(yes|no|ok|right|correct|wrong)$",
    r"^(we|do|can|should|will|then|next|now|it|this|that)",
    r"^[+\-*/=().\d\s]+$",
    r"^(not sure|don't know|confused|help|what|how)",
    r"^(i think|maybe|perhaps|could it be)",
];

/// Legacy keyword table used when no catalog entry matches. Scanned in
/// declaration order; the highest substring-hit count wins and ties keep
/// the earlier entry.
const FALLBACK_TOPICS: &[(&str, &[&str])] = &[
    (
        "Algebra & Equations",
        &[
            "equation",
            "solve",
            "x",
            "y",
            "variable",
            "algebra",
            "=",
            "unknown",
            "coefficient",
            "term",
            "constant",
        ],
    ),
    (
        "Geometry",
        &[
            "angle",
            "triangle",
            "area",
            "perimeter",
            "shape",
            "circle",
            "rectangle",
        ],
    ),
    (
        "Fractions & Percentages",
        &["fraction", "decimal", "percentage", "/", "percent", "ratio"],
    ),
    (
        "Number Operations",
        &[
            "add",
            "subtract",
            "multiply",
            "divide",
            "division",
            "multiplication",
            "times",
            "plus",
            "minus",
        ],
    ),
    (
        "Indices",
        &["power", "exponent", "square", "cube", "^", "index", "indices"],
    ),
    (
        "Analysing Data",
        &["data", "graph", "mean", "median", "average", "mode", "range"],
    ),
    (
        "Number Theory",
        &["prime", "factor", "multiple", "divisible", "remainder"],
    ),
];

/// Year 7 vocabulary accepted by the definition-request check, in addition
/// to the curriculum glossary verbs.
const YEAR7_TERMS: &[&str] = &[
    "coefficient",
    "variable",
    "constant",
    "term",
    "expression",
    "equation",
    "factor",
    "multiple",
    "prime",
    "fraction",
    "decimal",
    "percentage",
    "ratio",
    "area",
    "perimeter",
    "angle",
    "parallel",
    "perpendicular",
    "mean",
    "median",
    "mode",
    "range",
    "probability",
];

const DEFINITION_KEYWORDS: &[&str] = &["what is", "define", "meaning of", "explain", "definition"];

/// Result of the curriculum scope gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeCheck {
    pub in_scope: bool,
    pub refusal: Option<String>,
    pub definition_request: Option<String>,
}

impl ScopeCheck {
    fn in_scope() -> Self {
        Self {
            in_scope: true,
            refusal: None,
            definition_request: None,
        }
    }
}

/// A canned Socratic definition for a Year 7 algebra term.
#[derive(Debug, Clone)]
pub struct Definition {
    pub socratic: &'static str,
    pub context: &'static str,
}

/// Rough token estimate: characters / 4, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 + 3) / 4
}

/// True when the message reads as a continuation of the current exchange:
/// bare numerals, acknowledgements, arithmetic-only strings, leading
/// follow-up words, or anything under 20 characters.
pub fn is_follow_up(message: &str) -> bool {
    let msg = message.trim().to_lowercase();
    if msg.len() < 20 {
        return true;
    }
    for pattern in FOLLOW_UP_PATTERNS {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            if re.is_match(&msg) {
                return true;
            }
        }
    }
    false
}

/// Resolve the topic for a message.
///
/// Order of precedence:
/// 1. Follow-up heuristic: keep the prior conversation's topic.
/// 2. Curriculum catalog scan, first match in catalog order.
/// 3. Legacy fallback table, best substring-hit count.
/// 4. `DEFAULT_TOPIC`.
pub fn resolve_topic(message: &str, prior_subject: Option<&str>, curriculum: &Curriculum) -> String {
    let msg = message.to_lowercase();

    if let Some(subject) = prior_subject {
        if subject != DEFAULT_TOPIC && is_follow_up(&msg) {
            tracing::debug!("Follow-up detected, keeping topic: {}", subject);
            return subject.to_string();
        }
    }

    // First-match wins over the catalog: a topic's keyword set is its
    // subtopics, allowed verbs and its own name.
    for entry in &curriculum.topic_catalog {
        let mut keywords = entry
            .subtopics
            .iter()
            .chain(entry.allowed_verbs.iter())
            .map(|k| k.to_lowercase())
            .chain(std::iter::once(entry.topic.to_lowercase()));
        if keywords.any(|keyword| msg.contains(&keyword)) {
            tracing::debug!("Curriculum match: {}", entry.topic);
            return entry.topic.clone();
        }
    }

    // Best-score over the legacy table; only a strictly higher score
    // displaces the current best.
    let mut best_topic = DEFAULT_TOPIC;
    let mut best_score = 0usize;
    for (topic, keywords) in FALLBACK_TOPICS {
        let score = keywords.iter().filter(|k| msg.contains(**k)).count();
        if score > best_score {
            best_score = score;
            best_topic = topic;
        }
    }

    best_topic.to_string()
}

/// Gate a message and its resolved topic against the Year 7 curriculum.
///
/// Definition requests for known Year 7 terms pass regardless of the topic
/// gate and carry the matched term back to the caller.
pub fn check_scope(message: &str, topic: &str, curriculum: &Curriculum) -> ScopeCheck {
    let msg = message.to_lowercase();

    let is_definition_request = DEFINITION_KEYWORDS.iter().any(|k| msg.contains(k));
    if is_definition_request {
        let term = curriculum
            .glossary_terms()
            .chain(YEAR7_TERMS.iter().copied())
            .find(|term| msg.contains(&term.to_lowercase()));
        if let Some(term) = term {
            tracing::debug!("Definition request for Year 7 term: {}", term);
            return ScopeCheck {
                in_scope: true,
                refusal: None,
                definition_request: Some(term.to_string()),
            };
        }
    }

    if !curriculum.topic_in_scope(topic) {
        return ScopeCheck {
            in_scope: false,
            refusal: Some(
                curriculum
                    .refusal_text("basic Year 7 concepts", "a Year 7 topic like fractions or basic algebra"),
            ),
            definition_request: None,
        };
    }

    ScopeCheck::in_scope()
}

/// Secondary keyword filter: is this message plausibly about mathematics?
pub fn is_on_topic(message: &str) -> bool {
    let msg = message.to_lowercase();

    // Always allow homework help requests
    let homework_help = [
        "help with homework",
        "homework help",
        "need help with",
        "stuck on homework",
    ];
    if homework_help.iter().any(|p| msg.contains(p)) {
        return true;
    }

    // Block obviously off-topic content
    let off_topic = [
        "religion",
        "politics",
        "dating",
        "video games",
        "movies",
        "do my homework for me",
    ];
    if off_topic.iter().any(|k| msg.contains(k)) {
        return false;
    }

    let math_keywords = [
        "math", "equation", "solve", "calculate", "find", "answer", "result", "x", "y", "z", "n",
        "+", "-", "=", "*", "/", "^", "formula", "problem", "number", "digit", "value", "solution",
        "add", "subtract", "multiply", "divide", "division", "multiplication", "addition",
        "subtraction", "fraction", "decimal", "percent", "ratio", "proportion", "area",
        "perimeter", "angle", "triangle", "square", "circle", "graph", "plot", "data", "mean",
        "median", "mode", "algebra", "geometry", "statistics", "probability", "factor",
        "multiple", "prime", "how", "what", "why", "when", "where", "which", "can you", "help",
        "stuck", "confused", "understand", "explain", "show", "work out",
    ];
    if math_keywords.iter().any(|k| msg.contains(k)) {
        return true;
    }

    if msg.chars().any(|c| c.is_ascii_digit()) || msg.chars().any(|c| "+-*/=^()".contains(c)) {
        return true;
    }

    // Short messages like "we divide it?" are treated as follow-ups in an
    // ongoing conversation.
    if msg.len() < 20 {
        let follow_up_words = [
            "it", "this", "that", "we", "do", "can", "should", "will", "then", "next", "now",
        ];
        if follow_up_words.iter().any(|w| msg.contains(w)) {
            return true;
        }
    }

    false
}

/// Canned Socratic definitions for common Year 7 algebra terms.
pub fn definition_for(term: &str) -> Option<Definition> {
    let definition = match term.to_lowercase().as_str() {
        "coefficient" => Definition {
            socratic: "Great question! Look at this expression: 3x + 5. What number do you see in front of the x? What do you think that number might be called?",
            context: "In algebra, it's the number that multiplies the variable",
        },
        "variable" => Definition {
            socratic: "Think about this: if you have x apples and I don't tell you how many x is, what would you call x? What makes it different from a regular number?",
            context: "It's a letter that represents an unknown number that can change",
        },
        "constant" => Definition {
            socratic: "In the expression 2x + 7, one part changes when x changes, but what about the 7? What stays the same no matter what x equals?",
            context: "It's a number that doesn't change in an expression",
        },
        "term" => Definition {
            socratic: "If I write 3x + 5 - 2y, I can break this into separate pieces. How many separate pieces do you see? What would you call each piece?",
            context: "Each separate part of an expression, connected by + or - signs",
        },
        "factor" => Definition {
            socratic: "What numbers can you multiply together to get 12? What would you call those numbers that multiply to make 12?",
            context: "Numbers that multiply together to give another number",
        },
        "multiple" => Definition {
            socratic: "If you count by 3s: 3, 6, 9, 12... what would you call these numbers in relation to 3?",
            context: "Numbers you get when you multiply by whole numbers",
        },
        _ => return None,
    };
    Some(definition)
}

/// Detect a "convert a/b to a decimal" request and extract the fraction.
pub fn fraction_to_decimal_request(message: &str) -> Option<String> {
    let patterns = [
        r"(?i)convert.*?(\d+/\d+).*?decimal",
        r"(?i)(\d+/\d+).*?to.*?decimal",
        r"(?i)change.*?(\d+/\d+).*?decimal",
        r"(?i)turn.*?(\d+/\d+).*?decimal",
        r"(?i)(\d+/\d+).*?as.*?decimal",
        r"(?i)decimal.*?form.*?(\d+/\d+)",
    ];

    for pattern in &patterns {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            if let Some(captures) = re.captures(message) {
                if let Some(fraction) = captures.get(1) {
                    return Some(fraction.as_str().to_string());
                }
            }
        }
    }
    None
}

/// Pick the Socratic question for the fraction-to-decimal scaffold, keyed
/// off the student's most recent answer.
pub fn fraction_scaffold_question(fraction: &str, last_user_message: Option<&str>) -> String {
    let (numerator, denominator) = match fraction.split_once('/') {
        Some((n, d)) => (n, d),
        None => (fraction, "10"),
    };

    let last = last_user_message.unwrap_or("").to_lowercase();
    if last.contains("division") || last.contains("divide") {
        return format!(
            "Since {} is bigger than {}, we can't divide yet. What should we do to the {} to make it bigger so we can divide by {}?",
            denominator, numerator, numerator, denominator
        );
    }
    if last.contains("carry") || last.contains("remainder") {
        return format!(
            "Good! Now what do we do with that remainder? What happens when we bring down the next zero and divide by {} again?",
            denominator
        );
    }
    if last.contains("pattern") || last.contains("repeat") {
        return "You're discovering a pattern! What do you think will happen if we keep dividing? What does this tell us about the decimal?".to_string();
    }

    format!(
        "Let's convert {} to a decimal! First, can you try multiplying the denominator {} by something to make it 10, 100, or 1000? What happens when you try?",
        fraction, denominator
    )
}
