use chrono::{DateTime, Datelike, Timelike, Utc};
use loom_types::{
    BehavioralRule, ConstraintRule, FileAccessRule, OutputFormatRule, ResourceRule, SideEffectRule,
    TemporalRule, ToolRestrictionRule,
};

use crate::pattern::{any_match, matches};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Read,
    Write,
}

/// The operation under evaluation: a tool invocation, a file access, or a
/// worker's finished output, scoped to one feature in one project.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub feature_id: Option<String>,
    pub file_path: Option<String>,
    pub file_op: Option<FileOp>,
    pub file_size_bytes: Option<u64>,
    pub project_path: Option<String>,
    pub task: Option<String>,
    pub environment: Option<String>,
    pub tool: Option<String>,
    pub host: Option<String>,
    pub command: Option<String>,
    pub output: Option<String>,
    pub calls_in_last_minute: u32,
    pub calls_in_last_hour: u32,
    pub seconds_since_last_call: Option<u64>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub passed: bool,
    pub reason: Option<String>,
}

impl EvalOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }
    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Dispatches a single constraint rule against a context. Pure function:
/// same inputs always produce the same outcome.
pub fn evaluate(rule: &ConstraintRule, ctx: &EvalContext) -> EvalOutcome {
    match rule {
        ConstraintRule::ToolRestriction(r) => evaluate_tool_restriction(r, ctx),
        ConstraintRule::FileAccess(r) => evaluate_file_access(r, ctx),
        ConstraintRule::OutputFormat(r) => evaluate_output_format(r, ctx),
        ConstraintRule::Behavioral(r) => evaluate_behavioral(r, ctx),
        ConstraintRule::Temporal(r) => evaluate_temporal(r, ctx),
        ConstraintRule::Resource(r) => evaluate_resource(r, ctx),
        ConstraintRule::SideEffect(r) => evaluate_side_effect(r, ctx),
    }
}

/// Ordering: deniedTools -> toolPatterns (deny) -> allowedTools (must be
/// present or allowed-by-pattern) -> requireApproval. Deny always wins (P8).
pub fn evaluate_tool_restriction(rule: &ToolRestrictionRule, ctx: &EvalContext) -> EvalOutcome {
    let Some(tool) = ctx.tool.as_deref() else {
        return EvalOutcome::pass();
    };
    if rule.denied_tools.iter().any(|t| t == tool) {
        return EvalOutcome::fail(format!("tool `{tool}` is explicitly denied"));
    }
    if rule
        .tool_patterns
        .iter()
        .any(|p| p.starts_with('!') && matches(p, tool))
    {
        return EvalOutcome::fail(format!("tool `{tool}` matches a deny pattern"));
    }
    let allow_patterns: Vec<String> = rule
        .tool_patterns
        .iter()
        .filter(|p| !p.starts_with('!'))
        .cloned()
        .collect();
    if !rule.allowed_tools.is_empty() || !allow_patterns.is_empty() {
        let explicitly_allowed =
            rule.allowed_tools.iter().any(|t| t == tool) || any_match(&allow_patterns, tool);
        if !explicitly_allowed {
            return EvalOutcome::fail(format!("tool `{tool}` is not in the allow-list"));
        }
    }
    if rule.require_approval.iter().any(|t| t == tool) {
        return EvalOutcome::fail(format!("tool `{tool}` requires approval"));
    }
    EvalOutcome::pass()
}

/// Ordering: deniedPaths -> deniedExtensions -> allowedPaths ->
/// allowedExtensions -> readOnly/writeOnly (per operation) -> maxFileSize.
pub fn evaluate_file_access(rule: &FileAccessRule, ctx: &EvalContext) -> EvalOutcome {
    let Some(path) = ctx.file_path.as_deref() else {
        return EvalOutcome::pass();
    };
    if any_match(&rule.denied_paths, path) {
        return EvalOutcome::fail(format!("path `{path}` is explicitly denied"));
    }
    if let Some(ext) = extension_of(path) {
        if rule.denied_extensions.iter().any(|e| e == &ext) {
            return EvalOutcome::fail(format!("extension `.{ext}` is denied"));
        }
    }
    if !rule.allowed_paths.is_empty() && !any_match(&rule.allowed_paths, path) {
        return EvalOutcome::fail(format!("path `{path}` is not in the allow-list"));
    }
    if !rule.allowed_extensions.is_empty() {
        let ext = extension_of(path);
        if ext.as_deref().map(|e| rule.allowed_extensions.iter().any(|a| a == e)) != Some(true) {
            return EvalOutcome::fail(format!("path `{path}` extension is not allowed"));
        }
    }
    if let Some(op) = &ctx.file_op {
        if *op == FileOp::Write && any_match(&rule.read_only, path) {
            return EvalOutcome::fail(format!("path `{path}` is read-only"));
        }
        if *op == FileOp::Read && any_match(&rule.write_only, path) {
            return EvalOutcome::fail(format!("path `{path}` is write-only"));
        }
    }
    if let (Some(max), Some(size)) = (rule.max_file_size, ctx.file_size_bytes) {
        if size > max {
            return EvalOutcome::fail(format!("file size {size} exceeds max {max}"));
        }
    }
    EvalOutcome::pass()
}

/// Ordering: maxLength -> format match -> requiredFields -> forbiddenPatterns
/// -> requiredPatterns -> JSON-schema-shape (object-and-non-null only).
pub fn evaluate_output_format(rule: &OutputFormatRule, ctx: &EvalContext) -> EvalOutcome {
    let Some(output) = ctx.output.as_deref() else {
        return EvalOutcome::pass();
    };
    if let Some(max) = rule.max_length {
        if output.len() > max {
            return EvalOutcome::fail(format!("output length {} exceeds max {max}", output.len()));
        }
    }
    let parsed: Option<serde_json::Value> = serde_json::from_str(output).ok();
    if let Some(format) = rule.format.as_deref() {
        if format.eq_ignore_ascii_case("json") && parsed.is_none() {
            return EvalOutcome::fail("output is not valid JSON");
        }
    }
    if !rule.required_fields.is_empty() {
        let obj = parsed.as_ref().and_then(|v| v.as_object());
        let missing: Vec<&String> = rule
            .required_fields
            .iter()
            .filter(|f| obj.map(|o| o.contains_key(f.as_str())) != Some(true))
            .collect();
        if !missing.is_empty() {
            return EvalOutcome::fail(format!(
                "output is missing required field(s): {}",
                missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
    }
    if rule.forbidden_patterns.iter().any(|p| matches(p, output)) {
        return EvalOutcome::fail("output matches a forbidden pattern");
    }
    if !rule.required_patterns.is_empty() && !rule.required_patterns.iter().all(|p| matches(p, output)) {
        return EvalOutcome::fail("output is missing a required pattern");
    }
    if rule.json_schema.is_some() {
        let is_object_and_non_null = parsed.as_ref().map(|v| v.is_object()) == Some(true);
        if !is_object_and_non_null {
            return EvalOutcome::fail("output does not match the advisory JSON schema shape");
        }
    }
    EvalOutcome::pass()
}

pub fn evaluate_behavioral(rule: &BehavioralRule, ctx: &EvalContext) -> EvalOutcome {
    if let Some(tool) = ctx.tool.as_deref() {
        if rule.forbidden_actions.iter().any(|a| a == tool) {
            return EvalOutcome::fail(format!("action `{tool}` is forbidden"));
        }
    }
    EvalOutcome::pass()
}

/// Ordering: rate-limit-minute -> rate-limit-hour -> cooldown ->
/// validFrom/Until -> allowedHours -> allowedDays. `>` means "exceeds",
/// `>=` means "reached limit" — the distinction is deliberate.
pub fn evaluate_temporal(rule: &TemporalRule, ctx: &EvalContext) -> EvalOutcome {
    if let Some(limit) = rule.rate_limit_per_minute {
        if ctx.calls_in_last_minute >= limit {
            return EvalOutcome::fail(format!(
                "rate limit reached: {} calls in the last minute (limit {limit})",
                ctx.calls_in_last_minute
            ));
        }
    }
    if let Some(limit) = rule.rate_limit_per_hour {
        if ctx.calls_in_last_hour >= limit {
            return EvalOutcome::fail(format!(
                "rate limit reached: {} calls in the last hour (limit {limit})",
                ctx.calls_in_last_hour
            ));
        }
    }
    if let Some(cooldown) = rule.cooldown_seconds {
        if let Some(elapsed) = ctx.seconds_since_last_call {
            if elapsed < cooldown {
                return EvalOutcome::fail(format!("cooldown active: {elapsed}s < {cooldown}s"));
            }
        }
    }
    if let Some(from) = rule.valid_from {
        if ctx.now < from {
            return EvalOutcome::fail(format!("not yet valid (validFrom {from})"));
        }
    }
    if let Some(until) = rule.valid_until {
        if ctx.now > until {
            return EvalOutcome::fail(format!("no longer valid (validUntil {until})"));
        }
    }
    if let Some(hours) = &rule.allowed_hours {
        let hour = ctx.now.hour() as u8;
        if !hours.contains(&hour) {
            return EvalOutcome::fail(format!("hour {hour} is outside allowed hours"));
        }
    }
    if let Some(days) = &rule.allowed_days {
        let weekday = ctx.now.weekday().number_from_monday() as u8;
        if !days.contains(&weekday) {
            return EvalOutcome::fail(format!("weekday {weekday} is outside allowed days"));
        }
    }
    EvalOutcome::pass()
}

pub fn evaluate_resource(rule: &ResourceRule, ctx: &EvalContext) -> EvalOutcome {
    if let Some(max) = rule.max_concurrent_workers {
        if ctx.calls_in_last_minute > max {
            return EvalOutcome::fail(format!(
                "concurrent worker count {} exceeds max {max}",
                ctx.calls_in_last_minute
            ));
        }
    }
    EvalOutcome::pass()
}

pub fn evaluate_side_effect(rule: &SideEffectRule, ctx: &EvalContext) -> EvalOutcome {
    if let Some(host) = ctx.host.as_deref() {
        if any_match(&rule.denied_hosts, host) {
            return EvalOutcome::fail(format!("host `{host}` is denied"));
        }
        if !rule.allowed_hosts.is_empty() && !any_match(&rule.allowed_hosts, host) {
            return EvalOutcome::fail(format!("host `{host}` is not in the allow-list"));
        }
    }
    if let Some(command) = ctx.command.as_deref() {
        if rule.denied_commands.iter().any(|c| c == command) {
            return EvalOutcome::fail(format!("command `{command}` is denied"));
        }
        if !rule.allowed_commands.is_empty() && !rule.allowed_commands.iter().any(|c| c == command) {
            return EvalOutcome::fail(format!("command `{command}` is not in the allow-list"));
        }
    }
    EvalOutcome::pass()
}

fn extension_of(path: &str) -> Option<String> {
    path.rsplit('.').next().map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvalContext {
        EvalContext {
            now: Utc::now(),
            ..Default::default()
        }
    }

    #[test]
    fn deny_takes_priority_over_allow_for_tools() {
        let rule = ToolRestrictionRule {
            denied_tools: vec!["danger".to_string()],
            allowed_tools: vec!["danger".to_string()],
            ..Default::default()
        };
        let mut c = ctx();
        c.tool = Some("danger".to_string());
        assert!(!evaluate_tool_restriction(&rule, &c).passed);
    }

    #[test]
    fn deny_takes_priority_over_allow_for_paths() {
        let rule = FileAccessRule {
            denied_paths: vec!["secrets/*".to_string()],
            allowed_paths: vec!["secrets/*".to_string()],
            ..Default::default()
        };
        let mut c = ctx();
        c.file_path = Some("secrets/key.pem".to_string());
        assert!(!evaluate_file_access(&rule, &c).passed);
    }

    #[test]
    fn rate_limit_uses_reached_semantics_not_exceeds() {
        let rule = TemporalRule {
            rate_limit_per_minute: Some(5),
            ..Default::default()
        };
        let mut c = ctx();
        c.calls_in_last_minute = 5;
        assert!(!evaluate_temporal(&rule, &c).passed);
        c.calls_in_last_minute = 4;
        assert!(evaluate_temporal(&rule, &c).passed);
    }

    #[test]
    fn allowed_tools_without_pattern_blocks_unlisted_tool() {
        let rule = ToolRestrictionRule {
            allowed_tools: vec!["read".to_string()],
            ..Default::default()
        };
        let mut c = ctx();
        c.tool = Some("bash".to_string());
        assert!(!evaluate_tool_restriction(&rule, &c).passed);
    }
}
