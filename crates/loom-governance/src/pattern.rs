use regex::Regex;

/// Matches `value` against `pattern`, which is either a `/regex/` literal or
/// a glob (`*` as wildcard, matched in full). A leading `!` negates the
/// match result — used by tool deny-patterns.
pub fn matches(pattern: &str, value: &str) -> bool {
    let (negate, pattern) = match pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let result = if let Some(inner) = pattern.strip_prefix('/').and_then(|p| p.strip_suffix('/')) {
        Regex::new(inner).map(|re| re.is_match(value)).unwrap_or(false)
    } else {
        glob_match(pattern, value)
    };
    if negate {
        !result
    } else {
        result
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut remaining = value;
    let mut first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            continue;
        }
        if first {
            match remaining.strip_prefix(part) {
                Some(rest) => remaining = rest,
                None => return false,
            }
            first = false;
            continue;
        }
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}

pub fn any_match(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| matches(p, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_wildcard_matches_prefix_and_suffix() {
        assert!(matches("src/*.rs", "src/main.rs"));
        assert!(!matches("src/*.rs", "src/main.py"));
    }

    #[test]
    fn regex_literal_matches() {
        assert!(matches("/^danger.*/", "dangerous"));
    }

    #[test]
    fn negated_pattern_inverts_result() {
        assert!(matches("!danger", "safe"));
        assert!(!matches("!danger", "danger"));
    }
}
