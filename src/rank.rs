//! Relevance ranking of extracted elements.
//!
//! Actionable roles always survive. Everything else is scored and only
//! positive scores are kept, highest first, until the budget runs out.

use crate::rules;
use crate::types::ElementRecord;

pub const ACTIONABLE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "searchbox",
    "checkbox",
    "radio",
    "radiogroup",
    "combobox",
    "listitem",
    "menuitem",
    "tab",
    "option",
    "article",
    "row",
    "list",
    "listbox",
    "treeitem",
    "cell",
    "input",
    "textarea",
    "select",
    "switch",
];

const GENERIC_ROLES: &[&str] = &["", "generic", "none", "presentation", "div", "span"];

pub fn is_actionable(role: &str) -> bool {
    let role = role.to_ascii_lowercase();
    ACTIONABLE_ROLES.contains(&role.as_str())
}

#[derive(Debug, Clone)]
pub struct Ranker {
    /// Upper bound on returned elements.
    pub max_elements: usize,
    /// Upper bound on non-actionable elements, applied inside `max_elements`.
    pub non_actionable_budget: usize,
    /// Lowercased task terms that mark content as relevant.
    pub focus_terms: Vec<String>,
}

impl Ranker {
    pub fn new(max_elements: usize, non_actionable_budget: usize) -> Self {
        Self {
            max_elements,
            non_actionable_budget,
            focus_terms: Vec::new(),
        }
    }

    /// Words from the task description longer than three characters.
    pub fn with_task(mut self, task: &str) -> Self {
        self.focus_terms = task
            .split(|c: char| !c.is_alphanumeric() && c != '@')
            .filter(|w| w.chars().count() > 3)
            .map(|w| w.to_lowercase())
            .collect();
        self
    }

    pub fn score(&self, el: &ElementRecord) -> i32 {
        let mut score = 0;
        let role = el.role.to_ascii_lowercase();
        let generic = GENERIC_ROLES.contains(&role.as_str());
        if !generic {
            score += 5;
        }

        let len = el.text.chars().count();
        if el.has_text() {
            score += 3;
            if (10..=200).contains(&len) {
                score += 2;
            }
        } else if generic {
            score -= 5;
        }
        if len > 500 {
            score -= 3;
        }

        if el.text.contains('@') {
            score += 3;
        }
        if rules::looks_like_message_row(el) {
            score += 5;
        }
        if !self.focus_terms.is_empty() {
            let text = el.text.to_lowercase();
            if self.focus_terms.iter().any(|t| text.contains(t.as_str())) {
                score += 10;
            }
        }

        if el.attr_value("data-testid").is_some() {
            score += 3;
        }
        if el.attr_value("aria-label").is_some() {
            score += 2;
        }
        score
    }

    /// Filters and reindexes. Output indices are `1..=K` in output order.
    pub fn rank(&self, elements: Vec<ElementRecord>) -> Vec<ElementRecord> {
        let (mut actionable, rest): (Vec<_>, Vec<_>) =
            elements.into_iter().partition(|el| is_actionable(&el.role));

        let budget = self
            .max_elements
            .saturating_sub(actionable.len())
            .min(self.non_actionable_budget);

        let mut scored: Vec<(i32, ElementRecord)> = rest
            .into_iter()
            .map(|el| (self.score(&el), el))
            .filter(|(s, _)| *s > 0)
            .collect();
        // sort_by is stable, so equal scores keep extraction order
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        actionable.extend(scored.into_iter().take(budget).map(|(_, el)| el));
        for (i, el) in actionable.iter_mut().enumerate() {
            el.index = i + 1;
        }
        actionable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(role: &str, text: &str) -> ElementRecord {
        ElementRecord {
            role: role.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    #[test]
    fn actionable_survive_even_over_budget() {
        let elements: Vec<_> = (0..10).map(|i| el("button", &format!("b{i}"))).collect();
        let out = Ranker::new(5, 50).rank(elements);
        assert_eq!(out.len(), 10);
        let idx: Vec<_> = out.iter().map(|e| e.index).collect();
        assert_eq!(idx, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn non_actionable_sorted_and_truncated() {
        let elements = vec![
            el("generic", ""),
            el("heading", "Short"),
            el("heading", "A readable heading text"),
            el("button", "Go"),
            el("generic", "From: user@example.com"),
        ];
        let out = Ranker::new(3, 50).rank(elements);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text, "Go");
        assert_eq!(out[1].text, "From: user@example.com");
        assert_eq!(out[2].text, "A readable heading text");
    }

    #[test]
    fn equal_scores_keep_original_order() {
        let elements = vec![el("heading", "first"), el("heading", "secnd")];
        let out = Ranker::new(10, 10).rank(elements);
        assert_eq!(out[0].text, "first");
        assert_eq!(out[1].text, "secnd");
    }

    #[test]
    fn focus_terms_boost() {
        let r = Ranker::new(10, 10).with_task("find the invoice from ACME");
        assert!(r.score(&el("heading", "Invoice #42")) > r.score(&el("heading", "Receipt #42")));
    }

    #[test]
    fn empty_generic_is_dropped() {
        let out = Ranker::new(10, 10).rank(vec![el("generic", "  ")]);
        assert!(out.is_empty());
    }
}
