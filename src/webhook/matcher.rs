use std::collections::BTreeSet;

use regex::Regex;

use super::template;
use super::{Trigger, TriggerConditions};

// ---------------------------------------------------------------------------
// Extracted GitHub event
// ---------------------------------------------------------------------------

/// Structured fields pulled out of a GitHub delivery, alongside the raw
/// payload for templates and the general predicate.
#[derive(Debug, Clone)]
pub struct GitHubEvent {
    pub event: String,
    pub action: Option<String>,
    pub repo_full_name: Option<String>,
    pub sender: Option<String>,
    /// push: `ref` minus `refs/heads/`; pull_request: head ref;
    /// create/delete: `ref`.
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub draft: Option<bool>,
    pub labels: Vec<String>,
    /// push only: added+modified+removed across commits, deduped.
    pub changed_paths: Vec<String>,
    pub raw: serde_json::Value,
}

impl GitHubEvent {
    pub fn from_payload(event: &str, raw: serde_json::Value) -> Self {
        let action = str_at(&raw, &["action"]);
        let repo_full_name = str_at(&raw, &["repository", "full_name"]);
        let sender = str_at(&raw, &["sender", "login"]);

        let branch = match event {
            "push" => str_at(&raw, &["ref"])
                .map(|r| r.strip_prefix("refs/heads/").unwrap_or(&r).to_owned()),
            "pull_request" => str_at(&raw, &["pull_request", "head", "ref"]),
            "create" | "delete" => str_at(&raw, &["ref"]),
            _ => None,
        };

        let base_branch = str_at(&raw, &["pull_request", "base", "ref"]);
        let draft = raw
            .pointer("/pull_request/draft")
            .and_then(serde_json::Value::as_bool);

        let labels = label_names(&raw, "/pull_request/labels")
            .or_else(|| label_names(&raw, "/issue/labels"))
            .unwrap_or_default();

        let changed_paths = if event == "push" {
            collect_changed_paths(&raw)
        } else {
            Vec::new()
        };

        Self {
            event: event.to_owned(),
            action,
            repo_full_name,
            sender,
            branch,
            base_branch,
            draft,
            labels,
            changed_paths,
            raw,
        }
    }
}

fn str_at(value: &serde_json::Value, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str().map(str::to_owned)
}

fn label_names(value: &serde_json::Value, pointer: &str) -> Option<Vec<String>> {
    let labels = value.pointer(pointer)?.as_array()?;
    Some(
        labels
            .iter()
            .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
            .map(str::to_owned)
            .collect(),
    )
}

fn collect_changed_paths(raw: &serde_json::Value) -> Vec<String> {
    let mut paths = BTreeSet::new();
    if let Some(commits) = raw.get("commits").and_then(|c| c.as_array()) {
        for commit in commits {
            for kind in ["added", "modified", "removed"] {
                if let Some(files) = commit.get(kind).and_then(|f| f.as_array()) {
                    for file in files {
                        if let Some(path) = file.as_str() {
                            paths.insert(path.to_owned());
                        }
                    }
                }
            }
        }
    }
    paths.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Trigger selection
// ---------------------------------------------------------------------------

/// Stable ascending priority order: sort is stable, so equal priorities
/// keep their list order.
fn by_priority(triggers: &[Trigger]) -> Vec<&Trigger> {
    let mut ordered: Vec<&Trigger> = triggers.iter().collect();
    ordered.sort_by_key(|t| t.priority);
    ordered
}

/// First enabled trigger whose GitHub conditions all hold.
pub fn match_github<'a>(triggers: &'a [Trigger], event: &GitHubEvent) -> Option<&'a Trigger> {
    for trigger in by_priority(triggers) {
        if !trigger.enabled {
            continue;
        }
        if github_conditions_hold(&trigger.conditions, event) {
            return Some(trigger);
        }
    }
    None
}

/// Custom path: only the general template predicate applies, and a
/// non-matching trigger with `stop_on_match` ends evaluation early.
pub fn match_custom<'a>(
    triggers: &'a [Trigger],
    payload: &serde_json::Value,
) -> Option<&'a Trigger> {
    for trigger in by_priority(triggers) {
        if !trigger.enabled {
            continue;
        }
        if template_predicate_holds(trigger.conditions.template.as_deref(), payload) {
            return Some(trigger);
        }
        if trigger.stop_on_match {
            return None;
        }
    }
    None
}

fn github_conditions_hold(c: &TriggerConditions, ev: &GitHubEvent) -> bool {
    if !c.events.is_empty() && !c.events.contains(&ev.event) {
        return false;
    }
    if !c.actions.is_empty()
        && !ev.action.as_ref().is_some_and(|a| c.actions.contains(a))
    {
        return false;
    }
    if !c.repositories.is_empty() {
        let Some(ref full_name) = ev.repo_full_name else {
            return false;
        };
        if !c.repositories.iter().any(|p| repo_pattern_matches(p, full_name)) {
            return false;
        }
    }
    if !c.branches.is_empty() {
        let Some(ref branch) = ev.branch else {
            return false;
        };
        if !c.branches.iter().any(|g| glob_match(g, branch)) {
            return false;
        }
    }
    // Base branch only constrains pull requests; non-PR events pass.
    if !c.base_branches.is_empty()
        && let Some(ref base) = ev.base_branch
        && !c.base_branches.iter().any(|g| glob_match(g, base))
    {
        return false;
    }
    if let Some(want_draft) = c.draft
        && ev.draft != Some(want_draft)
    {
        return false;
    }
    if !c.labels.is_empty() && !c.labels.iter().any(|l| ev.labels.contains(l)) {
        return false;
    }
    if !c.senders.is_empty()
        && !ev.sender.as_ref().is_some_and(|s| c.senders.contains(s))
    {
        return false;
    }
    if !c.paths.is_empty()
        && !ev
            .changed_paths
            .iter()
            .any(|p| c.paths.iter().any(|g| path_glob_match(g, p)))
    {
        return false;
    }
    template_predicate_holds(c.template.as_deref(), &ev.raw)
}

fn template_predicate_holds(source: Option<&str>, payload: &serde_json::Value) -> bool {
    let Some(source) = source else {
        return true;
    };
    match template::render(source, payload) {
        Ok(rendered) => template::is_truthy(&rendered),
        Err(e) => {
            tracing::warn!(error = %e, "trigger template evaluation failed");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// `owner/name` exact match, or `owner/*` matching any repository of the
/// owner.
pub fn repo_pattern_matches(pattern: &str, full_name: &str) -> bool {
    if let Some(owner) = pattern.strip_suffix("/*") {
        return full_name.split('/').next() == Some(owner);
    }
    pattern == full_name
}

/// Branch glob: `*` and `?` match across the whole name.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).is_ok_and(|r| r.is_match(value))
}

/// Path glob: `*`/`?` stay within one segment; a `**` segment matches any
/// tail slice, tested position by position.
pub fn path_glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let segments: Vec<&str> = path.split('/').collect();
    match_segments(&pat, &segments)
}

fn match_segments(pat: &[&str], path: &[&str]) -> bool {
    match pat.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|i| match_segments(rest, &path[i..])),
        Some((&seg, rest)) => match path.split_first() {
            Some((&head, tail)) => segment_match(seg, head) && match_segments(rest, tail),
            None => false,
        },
    }
}

fn segment_match(pattern: &str, value: &str) -> bool {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).is_ok_and(|r| r.is_match(value))
}
