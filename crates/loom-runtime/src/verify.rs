use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

/// Commands the verification primitive is willing to run (spec.md §6). Each
/// entry is the leading argv prefix that counts as a match; `cargo test
/// --release` matches the `cargo test` entry, for example.
const ALLOWED_PREFIXES: &[&[&str]] = &[
    &["npm", "test"],
    &["npm", "run", "test"],
    &["pytest"],
    &["cargo", "test"],
    &["go", "test"],
    &["make", "test"],
    &["eslint"],
    &["tsc"],
];

const SHELL_METACHARACTERS: &[&str] = &[";", "&&", "||", "|", "`", "$(", "<", ">"];

/// Outcome of one bounded verification run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub exit_code: Option<i32>,
    pub output: String,
    pub truncated: bool,
    pub timed_out: bool,
}

/// True if `argv` begins with one of the allow-listed command prefixes.
pub fn is_allowed(argv: &[String]) -> bool {
    ALLOWED_PREFIXES
        .iter()
        .any(|prefix| prefix.len() <= argv.len() && prefix.iter().zip(argv.iter()).all(|(want, got)| want == got))
}

/// Returns the first disallowed shell metacharacter found in any argument,
/// if any. Since commands are always argv-form, this is a defence against a
/// caller smuggling a metacharacter inside a single argument rather than an
/// actual shell-injection surface.
pub fn find_metacharacter(argv: &[String]) -> Option<String> {
    for arg in argv {
        for needle in SHELL_METACHARACTERS {
            if arg.contains(needle) {
                return Some((*needle).to_string());
            }
        }
    }
    None
}

/// Runs `argv` under `cwd`, refusing anything off the allow-list or carrying
/// a shell metacharacter, bounded by `timeout_secs` and `output_cap_bytes`.
/// A timeout does not error: it is reported as `timed_out=true` so the
/// caller can surface it the same way a failing exit code would be.
pub async fn run_verification(cwd: &Path, argv: &[String], timeout_secs: u64, output_cap_bytes: usize) -> Result<VerificationOutcome> {
    if argv.is_empty() {
        bail!("verification command must not be empty");
    }
    if let Some(found) = find_metacharacter(argv) {
        bail!("verification command argument contains disallowed shell metacharacter `{found}`");
    }
    if !is_allowed(argv) {
        bail!("verification command `{}` is not on the allow-list", argv.join(" "));
    }

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn()?;
    match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            let truncated = combined.len() > output_cap_bytes;
            if truncated {
                let boundary = combined
                    .char_indices()
                    .map(|(i, _)| i)
                    .take_while(|i| *i <= output_cap_bytes)
                    .last()
                    .unwrap_or(0);
                combined.truncate(boundary);
            }
            Ok(VerificationOutcome {
                exit_code: output.status.code(),
                output: combined,
                truncated,
                timed_out: false,
            })
        }
        Ok(Err(err)) => bail!("verification command failed to run: {err}"),
        Err(_) => {
            warn!(command = %argv.join(" "), timeout_secs, "verification command timed out");
            Ok(VerificationOutcome {
                exit_code: None,
                output: String::new(),
                truncated: false,
                timed_out: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_known_prefixes_only() {
        assert!(is_allowed(&["cargo".to_string(), "test".to_string(), "--release".to_string()]));
        assert!(is_allowed(&["npm".to_string(), "run".to_string(), "test".to_string()]));
        assert!(!is_allowed(&["rm".to_string(), "-rf".to_string(), "/".to_string()]));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert_eq!(
            find_metacharacter(&["cargo".to_string(), "test".to_string(), "; rm -rf /".to_string()]),
            Some(";".to_string())
        );
        assert_eq!(find_metacharacter(&["cargo".to_string(), "test".to_string()]), None);
    }

    #[tokio::test]
    async fn rejects_a_command_off_the_allow_list() {
        let dir = std::env::temp_dir();
        let err = run_verification(&dir, &["rm".to_string(), "-rf".to_string(), "/".to_string()], 5, 1024)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("allow-list"));
    }

    #[tokio::test]
    async fn rejects_a_metacharacter_before_spawning_anything() {
        let dir = std::env::temp_dir();
        let err = run_verification(&dir, &["cargo".to_string(), "test".to_string(), "&&".to_string(), "rm".to_string()], 5, 1024)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("metacharacter"));
    }
}
