use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::RwLock;

/// Output captured per session is bounded so a runaway worker cannot exhaust
/// memory; oldest bytes are dropped once the hard cap is reached.
const OUTPUT_HARD_CAP_BYTES: usize = 200_000;
const OUTPUT_TRIM_TO_BYTES: usize = 100_000;

struct TerminalSession {
    child: Child,
    stdin: ChildStdin,
    output: Arc<RwLock<String>>,
    started_at: chrono::DateTime<Utc>,
}

/// Abstracts the terminal-multiplexer operations behind a narrow capability
/// surface. The core never constructs shell strings; commands are always
/// argv-form, so there is no shell-injection surface to defend here.
#[derive(Clone, Default)]
pub struct ProcessAdapter {
    sessions: Arc<RwLock<HashMap<String, TerminalSession>>>,
}

impl ProcessAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn_session(&self, name: &str, cwd: &PathBuf, argv: &[String]) -> Result<()> {
        if argv.is_empty() {
            bail!("argv must not be empty");
        }
        if self.sessions.read().await.contains_key(name) {
            bail!("session already exists: {name}");
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| anyhow!("failed to spawn session {name}: {err}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("child has no stdin"))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let output = Arc::new(RwLock::new(String::new()));
        if let Some(stdout) = stdout {
            spawn_reader(stdout, output.clone());
        }
        if let Some(stderr) = stderr {
            spawn_reader(stderr, output.clone());
        }

        self.sessions.write().await.insert(
            name.to_string(),
            TerminalSession {
                child,
                stdin,
                output,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub async fn session_exists(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    pub async fn send_keys(&self, name: &str, text: &str, press_enter: bool) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| anyhow!("no such session: {name}"))?;
        session.stdin.write_all(text.as_bytes()).await?;
        if press_enter {
            session.stdin.write_all(b"\n").await?;
        }
        session.stdin.flush().await?;
        Ok(())
    }

    pub async fn capture(&self, name: &str, last_n_lines: usize) -> Result<String> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(name)
            .ok_or_else(|| anyhow!("no such session: {name}"))?;
        let output = session.output.read().await;
        Ok(tail_lines(&output, last_n_lines))
    }

    pub async fn started_at(&self, name: &str) -> Option<chrono::DateTime<Utc>> {
        self.sessions.read().await.get(name).map(|s| s.started_at)
    }

    pub async fn kill(&self, name: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .remove(name)
            .ok_or_else(|| anyhow!("no such session: {name}"))?;
        let mut child = session.child;
        let _ = child.start_kill();
        Ok(())
    }

    pub async fn list(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// True if the process backing `name` has exited but the adapter still
    /// has a handle on it — used by the completion monitor to detect a
    /// crashed worker without needing a `.done` side-file.
    pub async fn has_exited(&self, name: &str) -> Option<bool> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(name)?;
        Some(matches!(session.child.try_wait(), Ok(Some(_))))
    }
}

fn spawn_reader<R>(mut reader: R, output: Arc<RwLock<String>>)
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    let mut guard = output.write().await;
                    guard.push_str(&chunk);
                    if guard.len() > OUTPUT_HARD_CAP_BYTES {
                        let drop_to = guard.len() - OUTPUT_TRIM_TO_BYTES;
                        let boundary = guard
                            .char_indices()
                            .map(|(i, _)| i)
                            .find(|i| *i >= drop_to)
                            .unwrap_or(guard.len());
                        guard.replace_range(..boundary, "");
                    }
                }
                Err(_) => break,
            }
        }
    });
}

fn tail_lines(text: &str, last_n: usize) -> String {
    if last_n == 0 {
        return String::new();
    }
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(last_n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_capture_kill_roundtrip() {
        let adapter = ProcessAdapter::new();
        let cwd = std::env::temp_dir();
        adapter
            .spawn_session(
                "s1",
                &cwd,
                &["/bin/sh".to_string(), "-c".to_string(), "echo hello".to_string()],
            )
            .await
            .unwrap();
        assert!(adapter.session_exists("s1").await);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let captured = adapter.capture("s1", 10).await.unwrap();
        assert!(captured.contains("hello"));
        adapter.kill("s1").await.unwrap();
        assert!(!adapter.session_exists("s1").await);
    }

    #[tokio::test]
    async fn send_keys_to_missing_session_errors_without_mutation() {
        let adapter = ProcessAdapter::new();
        let err = adapter.send_keys("missing", "hi", true).await.unwrap_err();
        assert!(err.to_string().contains("no such session"));
        assert!(adapter.list().await.is_empty());
    }

    #[test]
    fn tail_lines_returns_only_requested_suffix() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), "c\nd");
    }
}
