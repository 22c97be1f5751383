use tracing::warn;

use crate::config::LoopLimits;
use crate::errors::AgentError;
use crate::types::HistoryItem;

/// Repetition detector keyed by (action, target, url).
///
/// Looks at the tail of the history: synthetic observations and rejected
/// decisions are skipped, anything else with a different key ends the run.
#[derive(Debug, Clone, Default)]
pub struct LoopGuard {
    limits: LoopLimits,
}

impl LoopGuard {
    pub fn new(limits: LoopLimits) -> Self {
        Self { limits }
    }

    /// Consecutive trailing attempts of the same (action, target, url).
    pub fn repeats(history: &[HistoryItem], action: &str, target: &str, url: &str) -> usize {
        history
            .iter()
            .rev()
            .filter(|h| h.outcome.is_executed())
            .take_while(|h| h.action == action && h.target == target && h.url == url)
            .count()
    }

    /// `Err` when issuing this action once more would exceed its limit.
    pub fn check(
        &self,
        history: &[HistoryItem],
        action: &str,
        target: &str,
        url: &str,
    ) -> Result<(), AgentError> {
        let Some(limit) = self.limits.limit_for(action) else {
            return Ok(());
        };
        let seen = Self::repeats(history, action, target, url);
        if seen >= limit {
            warn!(action, target, url, seen, limit, "loop-guard tripped");
            return Err(AgentError::RepeatedAction {
                action: action.to_string(),
                limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;

    fn item(action: &str, target: &str, outcome: Outcome) -> HistoryItem {
        let mut h = HistoryItem::new(0, action, "https://a.test/");
        h.target = target.into();
        h.outcome = outcome;
        h
    }

    #[test]
    fn trips_after_threshold() {
        let guard = LoopGuard::default();
        let mut history = Vec::new();
        for _ in 0..3 {
            assert!(guard
                .check(&history, "click_selector", "#go", "https://a.test/")
                .is_ok());
            history.push(item("click_selector", "#go", Outcome::Failed));
        }
        let err = guard
            .check(&history, "click_selector", "#go", "https://a.test/")
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::RepeatedAction {
                action: "click_selector".into(),
                limit: 3
            }
        );
    }

    #[test]
    fn different_target_or_url_resets() {
        let guard = LoopGuard::default();
        let history = vec![
            item("click_selector", "#go", Outcome::Failed),
            item("click_selector", "#go", Outcome::Failed),
            item("click_selector", "#other", Outcome::Failed),
        ];
        assert!(guard
            .check(&history, "click_selector", "#go", "https://a.test/")
            .is_ok());
        assert!(guard
            .check(&history, "click_selector", "#go", "https://b.test/")
            .is_ok());
    }

    #[test]
    fn observations_do_not_break_the_run() {
        let history = vec![
            item("scroll_page", "down", Outcome::Success),
            HistoryItem::observation(1, "https://a.test/", "nothing new"),
            item("scroll_page", "down", Outcome::Success),
        ];
        assert_eq!(
            LoopGuard::repeats(&history, "scroll_page", "down", "https://a.test/"),
            2
        );
    }

    #[test]
    fn index_clicks_have_tighter_limit_and_user_input_none() {
        let guard = LoopGuard::default();
        let history = vec![
            item("click_by_index", "#send", Outcome::Success),
            item("click_by_index", "#send", Outcome::Success),
        ];
        assert!(guard
            .check(&history, "click_by_index", "#send", "https://a.test/")
            .is_err());

        let asks: Vec<_> = (0..50)
            .map(|_| item("request_user_input", "code?", Outcome::Success))
            .collect();
        assert!(guard
            .check(&asks, "request_user_input", "code?", "https://a.test/")
            .is_ok());
    }
}
