use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Health of a live worker, derived without capturing the entire session
/// output: a bounded tail of the log plus parseable tool-event markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tool_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    pub lines_written: usize,
    pub files_modified: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_for_secs: Option<i64>,
}

/// Markers a worker emits into its log so the manager can derive health
/// without re-parsing full output: `TOOL_EVENT {"tool":"edit","file":"a.rs"}`.
pub fn extract_heartbeat(log_tail: &str, running_for_secs: Option<i64>) -> Heartbeat {
    let marker = Regex::new(r"TOOL_EVENT\s+(\{.*\})").expect("valid regex");
    let mut last_tool = None;
    let mut last_file = None;
    let mut last_activity = None;
    let mut files_modified: BTreeSet<String> = BTreeSet::new();

    for line in log_tail.lines() {
        if let Some(captures) = marker.captures(line) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&captures[1]) {
                if let Some(tool) = value.get("tool").and_then(|v| v.as_str()) {
                    last_tool = Some(tool.to_string());
                }
                if let Some(file) = value.get("file").and_then(|v| v.as_str()) {
                    last_file = Some(file.to_string());
                    files_modified.insert(file.to_string());
                }
                last_activity = Some(line.to_string());
            }
        }
    }

    Heartbeat {
        status: "running".to_string(),
        last_tool_used: last_tool,
        last_file,
        last_activity,
        lines_written: log_tail.lines().count(),
        files_modified: files_modified.into_iter().collect(),
        running_for_secs,
    }
}

/// A predicted, purely advisory conflict between two ready features, based
/// on overlapping target paths or keywords in their descriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureConflict {
    pub a: String,
    pub b: String,
    pub reason: String,
}

pub fn analyze_feature_conflicts(features: &[(String, String)]) -> Vec<FeatureConflict> {
    let mut conflicts = Vec::new();
    for i in 0..features.len() {
        for j in (i + 1)..features.len() {
            let (id_a, desc_a) = &features[i];
            let (id_b, desc_b) = &features[j];
            if let Some(reason) = overlap_reason(desc_a, desc_b) {
                conflicts.push(FeatureConflict {
                    a: id_a.clone(),
                    b: id_b.clone(),
                    reason,
                });
            }
        }
    }
    conflicts
}

fn overlap_reason(desc_a: &str, desc_b: &str) -> Option<String> {
    let paths_a = extract_path_like_tokens(desc_a);
    let paths_b = extract_path_like_tokens(desc_b);
    let shared_paths: Vec<&String> = paths_a.iter().filter(|p| paths_b.contains(p)).collect();
    if !shared_paths.is_empty() {
        return Some(format!(
            "overlapping target path(s): {}",
            shared_paths
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    let words_a = significant_words(desc_a);
    let words_b = significant_words(desc_b);
    let shared_words: Vec<&String> = words_a.iter().filter(|w| words_b.contains(w)).collect();
    if shared_words.len() >= 2 {
        return Some(format!(
            "overlapping keywords: {}",
            shared_words
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    None
}

fn extract_path_like_tokens(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .filter(|token| token.contains('/') || token.contains('.'))
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.').to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

fn significant_words(text: &str) -> BTreeSet<String> {
    const STOPWORDS: &[&str] = &["the", "a", "an", "to", "of", "and", "for", "in", "on", "with"];
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_heartbeat_picks_up_last_tool_event() {
        let log = "some noise\nTOOL_EVENT {\"tool\":\"edit\",\"file\":\"src/a.rs\"}\nmore\nTOOL_EVENT {\"tool\":\"edit\",\"file\":\"src/b.rs\"}";
        let hb = extract_heartbeat(log, Some(10));
        assert_eq!(hb.last_tool_used.as_deref(), Some("edit"));
        assert_eq!(hb.last_file.as_deref(), Some("src/b.rs"));
        assert_eq!(hb.files_modified, vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn conflicts_detect_shared_path() {
        let features = vec![
            ("f-1".to_string(), "update src/auth.rs to add login".to_string()),
            ("f-2".to_string(), "refactor src/auth.rs session handling".to_string()),
        ];
        let conflicts = analyze_feature_conflicts(&features);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].a, "f-1");
    }

    #[test]
    fn unrelated_features_have_no_conflict() {
        let features = vec![
            ("f-1".to_string(), "add a login page".to_string()),
            ("f-2".to_string(), "write release notes".to_string()),
        ];
        assert!(analyze_feature_conflicts(&features).is_empty());
    }
}
