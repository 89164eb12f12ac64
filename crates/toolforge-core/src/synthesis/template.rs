//! Offline synthesizer backed by keyword-matched source templates.

use async_trait::async_trait;
use tracing::debug;

use super::{strip_code_fences, SynthesisError, SynthesisSpec, Synthesizer};
use crate::registry::tokenize;

struct Template {
    /// The template matches when every word of any one group is present.
    keywords: &'static [&'static [&'static str]],
    source: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        keywords: &[&["sum"], &["total"], &["add", "number"]],
        source: r#"def sum_list(numbers: list) -> int:
    """Return the sum of a list of numbers."""
    total = 0
    for value in numbers:
        total += value
    return total
"#,
    },
    Template {
        keywords: &[&["average"], &["mean"]],
        source: r#"def average(numbers: list) -> float:
    """Return the arithmetic mean of a list of numbers."""
    if not numbers:
        return 0.0
    return sum(numbers) / len(numbers)
"#,
    },
    Template {
        keywords: &[&["max"], &["maximum"], &["largest"]],
        source: r#"def find_max(numbers: list) -> float:
    """Return the largest value in a list."""
    return max(numbers)
"#,
    },
    Template {
        keywords: &[&["min"], &["minimum"], &["smallest"]],
        source: r#"def find_min(numbers: list) -> float:
    """Return the smallest value in a list."""
    return min(numbers)
"#,
    },
    Template {
        keywords: &[&["reverse"]],
        source: r#"def reverse_string(text: str) -> str:
    """Return the text reversed."""
    return text[::-1]
"#,
    },
    Template {
        keywords: &[&["palindrome"]],
        source: r#"def is_palindrome(text: str) -> bool:
    """Whether the text reads the same in both directions, ignoring case and spaces."""
    cleaned = "".join(ch.lower() for ch in text if ch.isalnum())
    return cleaned == cleaned[::-1]
"#,
    },
    Template {
        keywords: &[&["count", "word"], &["word", "count"]],
        source: r#"def word_count(text: str) -> int:
    """Return the number of whitespace-separated words."""
    return len(text.split())
"#,
    },
    Template {
        keywords: &[&["uppercase"], &["upper"]],
        source: r#"def to_upper(text: str) -> str:
    """Return the text in upper case."""
    return text.upper()
"#,
    },
    Template {
        keywords: &[&["sort"]],
        source: r#"def sort_list(items: list) -> list:
    """Return the items in ascending order."""
    return sorted(items)
"#,
    },
    Template {
        keywords: &[&["factorial"]],
        source: r#"def factorial(n: int) -> int:
    """Return n factorial."""
    result = 1
    for k in range(2, n + 1):
        result *= k
    return result
"#,
    },
    Template {
        keywords: &[&["fibonacci"]],
        source: r#"def fibonacci(n: int) -> int:
    """Return the n-th Fibonacci number."""
    a, b = 0, 1
    for _ in range(n):
        a, b = b, a + b
    return a
"#,
    },
    Template {
        keywords: &[&["unique"], &["deduplicate"], &["distinct"]],
        source: r#"def unique_items(items: list) -> list:
    """Return the items with duplicates removed, keeping first occurrences."""
    seen = []
    for item in items:
        if item not in seen:
            seen.append(item)
    return seen
"#,
    },
];

/// Matches the task description against built-in templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateSynthesizer;

impl TemplateSynthesizer {
    pub fn new() -> Self {
        Self
    }

    fn find(description: &str) -> Option<&'static Template> {
        let words = tokenize(description);
        TEMPLATES.iter().find(|t| {
            t.keywords
                .iter()
                .any(|group| group.iter().all(|k| words.iter().any(|w| w == k)))
        })
    }
}

#[async_trait]
impl Synthesizer for TemplateSynthesizer {
    fn name(&self) -> &str {
        "template"
    }

    async fn synthesize(&self, spec: &SynthesisSpec) -> Result<String, SynthesisError> {
        let template = Self::find(&spec.task_description)
            .ok_or_else(|| SynthesisError::Unsupported(spec.task_description.clone()))?;
        debug!(
            strategy = ?spec.strategy,
            repairing = spec.repair_feedback.is_some(),
            "template matched"
        );
        Ok(strip_code_fences(template.source))
    }
}
