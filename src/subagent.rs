//! Task specialists.
//!
//! A [`SubAgent`] claims tasks by keyword and then shapes each step of
//! them: a wait before the page is observed, extra rules and hints for the
//! decision service, and a veto on actions that are known to be pointless
//! on the current page. The orchestrator consults at most one per task.

use std::cmp::Reverse;
use std::fmt::Write as _;

use crate::resolver::EMAIL_WAIT;
use crate::toolbox::DriverCall;
use crate::tools::Action;
use crate::types::{ElementRecord, HistoryItem, PageState};

pub trait SubAgent: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, task: &str) -> bool;

    /// A call to run before the step's observation. `last` is the page the
    /// previous step saw, `None` on the first step.
    fn prepare(&self, last: Option<&PageState>) -> Option<DriverCall> {
        let _ = last;
        None
    }

    /// Rules appended to the decision service's system prompt.
    fn instructions(&self) -> &str;

    /// Hints for this step, shown next to the page-derived ones.
    fn guidance(&self, task: &str, state: &PageState, history: &[HistoryItem]) -> Vec<String> {
        let _ = (task, state, history);
        Vec::new()
    }

    /// Why `action` should be recorded as skipped instead of run.
    /// `element` is the element it resolved to, if any.
    fn skip_reason(
        &self,
        action: &Action,
        element: Option<&ElementRecord>,
        state: &PageState,
    ) -> Option<String> {
        let _ = (action, element, state);
        None
    }
}

fn contains_any(hay: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| hay.contains(n))
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}...")
    }
}

// ---------------------------------------------------------------------------
// Mail

const TASK_KEYWORDS: &[&str] = &[
    "письм", "email", "e-mail", "mail", "почт", "спам", "spam", "inbox", "входящ",
];

const MAIL_PAGE_MARKERS: &[&str] = &["mail", "почт"];
const MESSAGE_OPEN_URL: &[&str] = &["/message/", "#/message/"];
const MESSAGE_OPEN_TITLE: &[&str] = &["Письмо"];

const SENDER_SUBJECT: &[&str] = &["@", "от:", "from:", "тема", "subject"];
const ROW_ATTRS: &[&str] = &["data-uid", "data-subject", "data-sender"];
const ROW_ROLES: &[&str] = &["row", "listitem", "article"];
const LOOSE_ROW_ROLES: &[&str] = &["listitem", "article", "row", "option", "menuitem"];
const TESTID_ROW_WORDS: &[&str] = &["message", "mail", "item", "letter"];
const MAIL_WORDS: &[&str] = &[
    "@", "subject", "тема", "от:", "from:", "to:", "кому:", "дата", "date", "время", "time",
    "письм", "mail", "message", "letter",
];
const ROW_SELECTOR_WORDS: &[&str] = &["mail", "message", "letter", "item", "row", "listitem"];
const LAYOUT_PARTS: &[&str] = &["-header", "-footer"];

const DELETE_WORDS: &[&str] = &["удалить", "delete", "trash"];
const BACK_WORDS: &[&str] = &["назад", "back", "входящие", "inbox"];

/// A mail folder and how to tell that it is the open one.
struct Folder {
    name: &'static str,
    url_markers: &'static [&'static str],
    title_markers: &'static [&'static str],
    labels: &'static [&'static str],
}

const FOLDERS: &[Folder] = &[
    Folder {
        name: "Spam",
        url_markers: &["#spam", "/spam"],
        title_markers: &["спам", "spam"],
        labels: &["спам", "spam"],
    },
    Folder {
        name: "Inbox",
        url_markers: &["#inbox", "#/tabs/relevant"],
        title_markers: &["входящие", "inbox"],
        labels: &["входящие", "inbox"],
    },
];

/// Folder links carry a short label, maybe with a counter.
const FOLDER_LABEL_MAX: usize = 40;

const MAIL_INSTRUCTIONS: &str = r#"MAIL CLIENT RULES:
- Message lists often live in iframes or virtual lists. Check the interactive elements first; if no message rows are listed, use collect_texts("[data-testid*='message']"), collect_texts("[role='option']") or read_page instead of scrolling again.
- Prefer click_by_index with an index from the element list. Items returned by collect_texts are clicked with click_selector and their selector.
- To open a message, click its subject or sender. To delete one, use the delete button (trash icon, "Delete", "Удалить").
- Do not click the folder you are already in. Stay in the folder the task names; do not open Spam when the task is about the Inbox.
- wait_for_emails waits for the list to render after navigation or a folder switch.
- Finish with a summary of what was read and what was deleted."#;

/// Folder the page shows, judged by URL and title.
fn active_folder(state: &PageState) -> Option<&'static Folder> {
    let url = state.url.to_lowercase();
    let title = state.title.to_lowercase();
    FOLDERS
        .iter()
        .find(|f| contains_any(&url, f.url_markers) || contains_any(&title, f.title_markers))
}

fn on_mail_page(state: &PageState) -> bool {
    let url = state.url.to_lowercase();
    let title = state.title.to_lowercase();
    contains_any(&url, MAIL_PAGE_MARKERS) || contains_any(&title, MAIL_PAGE_MARKERS)
}

fn is_blank(state: &PageState) -> bool {
    let url = state.url.trim();
    url.is_empty() || url == "about:blank"
}

fn message_open(state: &PageState) -> bool {
    contains_any(&state.url, MESSAGE_OPEN_URL) || contains_any(&state.title, MESSAGE_OPEN_TITLE)
}

/// Whether an element looks like one message in a mail list.
pub fn is_email_row(el: &ElementRecord) -> bool {
    let text = el.text.to_lowercase();
    let role = el.role.to_lowercase();
    let sel = el.selector.to_lowercase();
    let attr = el.attr.to_lowercase();
    let text_len = el.text.chars().count();

    if contains_any(&sel, LAYOUT_PARTS) || (sel.contains("-layout") && !sel.contains("content")) {
        return false;
    }
    if sel.contains("data-testid") && contains_any(&sel, TESTID_ROW_WORDS) && text_len > 10 {
        return true;
    }
    if ROW_ROLES.contains(&role.as_str())
        && (contains_any(&text, SENDER_SUBJECT) || contains_any(&attr, ROW_ATTRS) || text_len > 30)
    {
        return true;
    }
    if attr.contains("aria-label")
        && (contains_any(&text, SENDER_SUBJECT) || text.contains("письм") || text.contains("mail"))
    {
        return true;
    }
    contains_any(&text, MAIL_WORDS)
        || (LOOSE_ROW_ROLES.contains(&role.as_str()) && text_len > 10)
        || contains_any(&sel, ROW_SELECTOR_WORDS)
        || contains_any(&attr, ROW_SELECTOR_WORDS)
        || contains_any(&attr, &["data-subject", "data-sender", "data-id"])
}

/// Ranking weight: sender and subject markers first, then list roles,
/// then action buttons, then folder links.
fn row_score(el: &ElementRecord) -> u32 {
    let text = el.text.to_lowercase();
    let role = el.role.to_lowercase();
    let attr = el.attr.to_lowercase();
    let mut score = 0;
    if text.contains('@') {
        score += 10;
    }
    if contains_any(&text, &["от:", "from:"]) {
        score += 8;
    }
    if contains_any(&text, &["тема", "subject"]) {
        score += 8;
    }
    if contains_any(&attr, &["data-subject", "data-sender"]) {
        score += 7;
    }
    if ROW_ROLES.contains(&role.as_str()) {
        score += 5;
        if text.chars().count() > 20 {
            score += 2;
        }
    }
    if contains_any(&text, &["удалить", "delete"]) {
        score += 6;
    }
    if contains_any(&text, &["спам", "spam"]) {
        score += 6;
    }
    if contains_any(&text, &["входящие", "inbox"]) {
        score += 3;
    }
    score
}

/// Mail rows of a snapshot, best first.
pub fn email_rows(state: &PageState) -> Vec<&ElementRecord> {
    let mut rows: Vec<&ElementRecord> = state.elements.iter().filter(|e| is_email_row(e)).collect();
    rows.sort_by_key(|e| Reverse(row_score(e)));
    rows
}

fn find_labeled<'a>(state: &'a PageState, words: &[&str]) -> Option<&'a ElementRecord> {
    state
        .elements
        .iter()
        .find(|e| contains_any(&e.text.to_lowercase(), words))
}

/// Specialist for webmail: reading, sorting and deleting messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailAgent;

impl EmailAgent {
    fn folder_hints(&self, state: &PageState, hints: &mut Vec<String>) {
        match active_folder(state).map(|f| f.name) {
            Some("Spam") => hints.push(
                "You are already in the Spam folder. Do not click Spam again. If the task is about the Inbox, go back to the Inbox."
                    .to_string(),
            ),
            Some(name) => hints.push(format!("You are in the {name} folder.")),
            None => {}
        }
    }

    fn open_message_hints(&self, state: &PageState, hints: &mut Vec<String>) {
        hints.push(
            "A single message is open, not the list. If it is spam, delete it; otherwise go back to the list for the next one. Do not click the message body again."
                .to_string(),
        );
        match find_labeled(state, DELETE_WORDS) {
            Some(el) => hints.push(format!(
                "Delete button: [{}] {}:\"{}\".",
                el.index,
                el.role,
                first_line(&el.text, 30)
            )),
            None => hints.push(
                "No delete button in the element list; use read_page or look for a button labelled \"Удалить\"/\"Delete\"."
                    .to_string(),
            ),
        }
        if let Some(el) = find_labeled(state, BACK_WORDS) {
            hints.push(format!(
                "Back to the list: [{}] {}:\"{}\".",
                el.index,
                el.role,
                first_line(&el.text, 30)
            ));
        }
    }

    fn list_hints(&self, state: &PageState, history: &[HistoryItem], hints: &mut Vec<String>) {
        let rows = email_rows(state);
        if !rows.is_empty() {
            let mut line = format!("{} mail row(s) on the page:", rows.len());
            for el in rows.iter().take(10) {
                let _ = write!(line, " [{}] {}:\"{}\";", el.index, el.role, first_line(&el.text, 50));
            }
            line.push_str(" Open one with click_by_index and an index from this list.");
            hints.push(line);
            return;
        }

        let recent = &history[history.len().saturating_sub(5)..];
        let scrolls = recent.iter().filter(|h| h.action == "scroll_page").count();
        let stuck = recent
            .iter()
            .any(|h| h.action == "observation" && h.result.contains("scrolling did not change"));
        if scrolls >= 2 || stuck {
            hints.push(format!(
                "No mail rows found after {scrolls} scroll(s). Stop scrolling: the list is likely inside a frame. Use collect_texts(\"[data-testid*='message']\"), collect_texts(\"[role='option']\") or read_page now."
            ));
        } else {
            hints.push(
                "No mail rows in the element list; the list may be inside a frame. Try wait_for_emails, then collect_texts(\"[data-testid*='message']\") or read_page."
                    .to_string(),
            );
        }
        let collected = history
            .iter()
            .rev()
            .take(3)
            .any(|h| h.action == "collect_texts" && h.result.contains("item(s)"));
        if collected {
            hints.push(
                "collect_texts returned items: click one with click_selector and the selector printed next to it."
                    .to_string(),
            );
        }
        if state.elements.is_empty() {
            hints.push("The element list is empty; use read_page to see the page.".to_string());
        }
    }
}

impl SubAgent for EmailAgent {
    fn name(&self) -> &str {
        "email"
    }

    fn can_handle(&self, task: &str) -> bool {
        contains_any(&task.to_lowercase(), TASK_KEYWORDS)
    }

    /// Waits for the message list when the last page was a mail client
    /// that had not rendered one yet.
    fn prepare(&self, last: Option<&PageState>) -> Option<DriverCall> {
        let last = last.filter(|s| !is_blank(s))?;
        if !on_mail_page(last) || message_open(last) || !email_rows(last).is_empty() {
            return None;
        }
        Some(DriverCall::WaitForEmails {
            timeout: EMAIL_WAIT,
        })
    }

    fn instructions(&self) -> &str {
        MAIL_INSTRUCTIONS
    }

    fn guidance(&self, _task: &str, state: &PageState, history: &[HistoryItem]) -> Vec<String> {
        if is_blank(state) {
            return Vec::new();
        }
        let mut hints = Vec::new();
        self.folder_hints(state, &mut hints);
        let opened = history
            .iter()
            .filter(|h| contains_any(&h.url, MESSAGE_OPEN_URL))
            .map(|h| h.url.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        if opened > 0 {
            hints.push(format!("Messages opened so far: {opened}."));
        }
        if message_open(state) {
            self.open_message_hints(state, &mut hints);
        } else {
            self.list_hints(state, history, &mut hints);
        }
        hints
    }

    /// Clicking the folder that is already open only reloads it.
    fn skip_reason(
        &self,
        action: &Action,
        element: Option<&ElementRecord>,
        state: &PageState,
    ) -> Option<String> {
        if !action.is_click() {
            return None;
        }
        let folder = active_folder(state)?;
        let short_label = element
            .map(|e| e.text.trim())
            .filter(|t| !t.is_empty() && t.chars().count() <= FOLDER_LABEL_MAX)
            .map(str::to_lowercase);
        let target = action.target().to_lowercase();
        let hits = short_label
            .iter()
            .map(String::as_str)
            .chain(element.map(|e| e.selector.as_str()))
            .chain(Some(target.as_str()).filter(|t| t.chars().count() <= FOLDER_LABEL_MAX))
            .any(|t| contains_any(&t.to_lowercase(), folder.labels));
        hits.then(|| format!("already in the {} folder, don't click on it again", folder.name))
    }
}
