//! The line-regex accessibility-snapshot parser.
//!
//! Deliberately brittle, deliberately literal: downstream clients match the
//! `[eN]` markers this produces and rely on the exact skip rules below. Do
//! not "improve" the heuristic — any behavior change here is observable to
//! callers holding stale refs.

use regex::Regex;
use std::sync::OnceLock;
use tabd_types::{RefId, RefTable};

const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "checkbox",
    "radio",
    "menuitem",
    "tab",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
];

const MAX_ACCEPTED_REFS: usize = 500;

fn candidate_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^(\s*)-\s*([A-Za-z][A-Za-z0-9_-]*)(?:\s+"([^"]*)")?"#).unwrap())
}

fn excluded_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)date|calendar|picker|datepicker").unwrap())
}

struct Candidate {
    role_lower: String,
    name: String,
}

fn parse_candidate(line: &str) -> Option<Candidate> {
    let caps = candidate_line_re().captures(line)?;
    let role = caps.get(2)?.as_str().to_string();
    let name = caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default();
    Some(Candidate {
        role_lower: role.to_ascii_lowercase(),
        name,
    })
}

fn is_accepted(candidate: &Candidate) -> bool {
    if candidate.role_lower == "combobox" {
        return false;
    }
    if excluded_name_re().is_match(&candidate.name) {
        return false;
    }
    INTERACTIVE_ROLES.contains(&candidate.role_lower.as_str())
}

/// Result of one pass over a raw aria snapshot: the ref table built from it,
/// and the same text with `[eN]` markers inserted after each eligible
/// line's name token.
pub struct AnnotatedSnapshot {
    pub table: RefTable,
    pub annotated_text: String,
}

/// Walk `raw` line by line, assigning `refId`s to eligible nodes and
/// producing the annotated text in the same pass so the two can never
/// drift out of sync with each other.
pub fn build_annotated_snapshot(raw: &str) -> AnnotatedSnapshot {
    let mut table = RefTable::new();
    let mut nth_counts: std::collections::HashMap<(String, String), usize> = std::collections::HashMap::new();
    let mut accepted = 0usize;
    let mut out_lines = Vec::with_capacity(raw.lines().count());

    for line in raw.lines() {
        let Some(candidate) = parse_candidate(line) else {
            out_lines.push(line.to_string());
            continue;
        };
        if accepted >= MAX_ACCEPTED_REFS || !is_accepted(&candidate) {
            out_lines.push(line.to_string());
            continue;
        }

        let key = (candidate.role_lower.clone(), candidate.name.clone());
        let nth = *nth_counts.get(&key).unwrap_or(&0);
        nth_counts.insert(key, nth + 1);

        let ref_id = table.assign(candidate.role_lower, candidate.name, nth);
        out_lines.push(annotate_line(line, &ref_id));
        accepted += 1;
    }

    AnnotatedSnapshot {
        table,
        annotated_text: out_lines.join("\n"),
    }
}

/// Insert `[eN]` right after the line's name token (or right after the role
/// token, for nameless nodes like a bare `- button`).
fn annotate_line(line: &str, ref_id: &RefId) -> String {
    let caps = candidate_line_re().captures(line).expect("line already matched as a candidate");
    let insert_at = caps
        .get(3)
        .map(|m| m.end())
        .unwrap_or_else(|| caps.get(2).unwrap().end());
    let (head, tail) = line.split_at(insert_at);
    format!("{head} [{ref_id}]{tail}")
}

#[derive(Debug, Clone)]
pub struct SnapshotWindow {
    pub text: String,
    pub truncated: bool,
    pub total_chars: usize,
    pub offset: usize,
    pub has_more: bool,
    pub next_offset: Option<usize>,
}

/// Truncate `annotated` to `max_chars`, keeping the final `tail_chars` intact
/// so pagination refs at the bottom of long pages stay addressable from any
/// window.
pub fn window_snapshot(annotated: &str, offset: usize, max_chars: usize, tail_chars: usize) -> SnapshotWindow {
    let total = annotated.chars().count();
    if total <= max_chars {
        return SnapshotWindow {
            text: annotated.to_string(),
            truncated: false,
            total_chars: total,
            offset,
            has_more: false,
            next_offset: None,
        };
    }

    let tail = tail_chars.min(total);
    let content_budget = (max_chars.saturating_sub(tail).saturating_sub(200)).max(100);
    let clamped_offset = offset.min(total.saturating_sub(tail));

    let chars: Vec<char> = annotated.chars().collect();
    let window_end = (clamped_offset + content_budget).min(total);
    let head: String = chars[clamped_offset..window_end].iter().collect();
    let tail_text: String = chars[total - tail..].iter().collect();

    let has_more = window_end < total - tail;
    let marker = if has_more {
        format!("\n...[truncated at char {window_end} of {total}; next offset = {window_end}]...\n")
    } else {
        String::new()
    };

    SnapshotWindow {
        text: format!("{head}{marker}{tail_text}"),
        truncated: true,
        total_chars: total,
        offset: clamped_offset,
        has_more,
        next_offset: has_more.then_some(window_end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_interactive_roles_and_skips_others() {
        let raw = "- button \"Submit\"\n- combobox \"Country\"\n- generic \"Footer\"";
        let result = build_annotated_snapshot(raw);
        assert_eq!(result.table.len(), 1);
        assert!(result.annotated_text.contains("[e1]"));
        assert!(!result.annotated_text.contains("[e2]"));
    }

    #[test]
    fn skips_date_calendar_picker_names() {
        let raw = "- textbox \"Date of birth\"\n- button \"Open calendar\"\n- link \"Pick a theme\"";
        let result = build_annotated_snapshot(raw);
        assert_eq!(result.table.len(), 0);
    }

    #[test]
    fn assigns_increasing_nth_for_repeated_role_name_pairs() {
        let raw = "- link \"More\"\n- link \"More\"\n- link \"More\"";
        let result = build_annotated_snapshot(raw);
        assert_eq!(result.table.len(), 3);
        let info0 = result.table.resolve(&RefId::parse("e1").unwrap()).unwrap();
        let info1 = result.table.resolve(&RefId::parse("e2").unwrap()).unwrap();
        let info2 = result.table.resolve(&RefId::parse("e3").unwrap()).unwrap();
        assert_eq!((info0.nth, info1.nth, info2.nth), (0, 1, 2));
    }

    #[test]
    fn stops_after_500_accepted_nodes() {
        let raw = (0..600).map(|i| format!("- button \"b{i}\"")).collect::<Vec<_>>().join("\n");
        let result = build_annotated_snapshot(&raw);
        assert_eq!(result.table.len(), 500);
    }

    #[test]
    fn window_keeps_tail_intact_and_reports_next_offset() {
        let body = "x".repeat(1000);
        let window = window_snapshot(&body, 0, 300, 50);
        assert!(window.truncated);
        assert!(window.text.ends_with(&"x".repeat(50)));
        assert!(window.next_offset.is_some());
        assert!(window.text.len() as isize <= 300 + 100); // generous bound incl. marker
    }

    #[test]
    fn window_is_a_no_op_under_the_budget() {
        let body = "short snapshot";
        let window = window_snapshot(body, 0, 80_000, 5_000);
        assert!(!window.truncated);
        assert_eq!(window.text, body);
    }
}
