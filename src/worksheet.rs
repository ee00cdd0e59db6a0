//! Worksheet question generation: LaTeX `enumerate` lists from the LLM,
//! with a deterministic offline sample, plus plain-text conversion.

use anyhow::Result;
use regex_lite::Regex;

use crate::curriculum::Curriculum;
use crate::llm_client::{LlmClient, Message};

/// Generate a LaTeX worksheet for a topic. Without an LLM client this
/// emits a fixed set of two-step equations so the endpoint still works
/// offline.
pub async fn generate_worksheet(
    llm: Option<&LlmClient>,
    curriculum: &Curriculum,
    topic: &str,
    difficulty: &str,
    question_count: usize,
    year_level: u16,
) -> Result<String> {
    let Some(client) = llm else {
        return Ok(sample_worksheet(question_count));
    };

    let guidance = curriculum
        .find_topic(topic)
        .map(|entry| {
            format!(
                "Focus on: {}. Use verbs: {}.",
                entry.subtopics.iter().take(3).cloned().collect::<Vec<_>>().join(", "),
                entry.allowed_verbs.iter().take(4).cloned().collect::<Vec<_>>().join(", ")
            )
        })
        .unwrap_or_default();

    let prompt = format!(
        "Create {question_count} {difficulty} {topic} questions for NSW Year {year_level} curriculum.\n\
         {guidance}\n\
         Return ONLY valid LaTeX using enumerate environment like:\n\n\
         \\begin{{enumerate}}\n\
         \x20 \\item Solve for $x$: $2x + 5 = 15$\n\
         \x20 \\item Find the area of a rectangle with length $8$ cm and width $5$ cm\n\
         \x20 \\item Simplify: $\\frac{{3}}{{4}} + \\frac{{1}}{{8}}$\n\
         \x20 \\item Calculate: $\\sqrt{{144}} + 3^2$\n\
         \\end{{enumerate}}\n\n\
         Rules:\n\
         - Use proper LaTeX math notation with $ for inline math\n\
         - Keep questions curriculum-appropriate for Year {year_level}\n\
         - Use \\item for each question\n\
         - No answers, just questions\n\
         - Use proper LaTeX: \\frac{{a}}{{b}}, \\sqrt{{x}}, x^2, \\cdot for multiplication"
    );

    let completion = client
        .generate(
            "You write mathematics worksheets as LaTeX enumerate lists.",
            vec![Message::user(prompt)],
        )
        .await?;
    Ok(completion.text.trim().to_string())
}

fn sample_worksheet(question_count: usize) -> String {
    let items: Vec<String> = (0..question_count)
        .map(|i| format!("\\item Solve for $x$: $2x + {} = {}$", i + 3, i + 13))
        .collect();
    format!("\\begin{{enumerate}}\n{}\n\\end{{enumerate}}", items.join("\n"))
}

/// Convert a LaTeX `enumerate` block into one plain-text question per
/// `\item`, rewriting the common math commands students will see.
pub fn latex_to_plain_text(latex: &str) -> Vec<String> {
    latex
        .split("\\item")
        .filter_map(|item| {
            let content = rewrite(item.trim(), r"\\begin\{enumerate\}|\\end\{enumerate\}", "");
            let content = rewrite(content.trim(), r"\\frac\{([^}]+)\}\{([^}]+)\}", "($1)/($2)");
            let content = rewrite(&content, r"\\sqrt\{([^}]+)\}", "sqrt($1)");
            let content = rewrite(&content, r"\$([^$]+)\$", "$1");
            let content = content
                .replace("\\cdot", "×")
                .replace("\\times", "×")
                .replace("\\div", "÷")
                .replace("\\degrees", "°")
                .replace("\\pi", "π");
            let content = content.trim().to_string();
            if content.is_empty() {
                None
            } else {
                Some(content)
            }
        })
        .collect()
}

fn rewrite(content: &str, pattern: &str, replacement: &str) -> String {
    match Regex::new(pattern) {
        Ok(re) => re.replace_all(content, replacement).into_owned(),
        Err(_) => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_sample_has_requested_question_count() {
        let curriculum = Curriculum::embedded().unwrap();
        let latex = generate_worksheet(None, &curriculum, "Algebra", "easy", 5, 7)
            .await
            .unwrap();
        assert!(latex.starts_with("\\begin{enumerate}"));
        assert_eq!(latex.matches("\\item").count(), 5);
        assert!(latex.contains("$2x + 3 = 13$"));
    }

    #[test]
    fn plain_text_splits_items_and_strips_enumerate() {
        let questions = latex_to_plain_text(
            "\\begin{enumerate}\n\\item Solve for $x$: $2x + 5 = 15$\n\\item Calculate: $\\sqrt{144} + 3^2$\n\\end{enumerate}",
        );
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0], "Solve for x: 2x + 5 = 15");
        assert_eq!(questions[1], "Calculate: sqrt(144) + 3^2");
    }

    #[test]
    fn plain_text_rewrites_fractions_and_operators() {
        let questions =
            latex_to_plain_text("\\item Simplify: $\\frac{3}{4} \\cdot \\frac{1}{8} \\div 2$");
        assert_eq!(questions, vec!["Simplify: (3)/(4) × (1)/(8) ÷ 2"]);
    }

    #[test]
    fn empty_input_yields_no_questions() {
        assert!(latex_to_plain_text("").is_empty());
        assert!(latex_to_plain_text("\\begin{enumerate}\\end{enumerate}").is_empty());
    }
}
