//! Observation of the workspace a session claims to have changed.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);
const TEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Directories never scanned for documentation.
const SKIPPED_DIRS: [&str; 4] = ["target", "node_modules", ".git", "vendor"];

static PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("static regex"));
static FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("static regex"));

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: u64,
    pub failed: u64,
}

impl TestResults {
    pub fn total(&self) -> u64 {
        self.passed + self.failed
    }

    /// Sum every `N passed` / `N failed` occurrence. Runners that report per
    /// binary print several summary lines.
    pub fn parse(output: &str) -> Self {
        let sum = |re: &Regex| {
            re.captures_iter(output)
                .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
                .sum()
        };
        Self {
            passed: sum(&PASSED_RE),
            failed: sum(&FAILED_RE),
        }
    }
}

/// Read access to the workspace plus the one write reality fixes need.
/// `None` means "cannot be observed here", not "zero".
#[async_trait]
pub trait WorkspaceProbe: Send + Sync {
    async fn exists(&self, path: &str) -> bool;
    /// Markdown documents relative to the workspace root, sorted.
    async fn list_docs(&self) -> Vec<String>;
    async fn count_lines(&self, path: &str) -> Option<u64>;
    async fn modified(&self, path: &str) -> Option<DateTime<Utc>>;
    /// Paths with uncommitted changes. `None` outside version control.
    async fn uncommitted_changes(&self) -> Option<Vec<String>>;
    /// Lines added since the last commit.
    async fn added_lines(&self) -> Option<u64>;
    async fn test_results(&self) -> Option<TestResults>;
    async fn commit(&self, paths: &[String], message: &str) -> Result<(), String>;
}

/// Probe backed by the local filesystem, `git` and an optional test command.
pub struct FsProbe {
    root: PathBuf,
    test_command: Option<String>,
}

impl FsProbe {
    pub fn new(root: impl Into<PathBuf>, test_command: Option<String>) -> Self {
        Self {
            root: root.into(),
            test_command,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspace-relative path to an absolute one. Absolute paths and
    /// paths that climb out of the root resolve to `None`.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        let inside = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !inside {
            debug!(path, "path outside the workspace ignored");
            return None;
        }
        Some(self.root.join(relative))
    }

    /// Run git in the workspace. `None` on failure, timeout or non-zero exit.
    async fn git(&self, args: &[&str]) -> Option<String> {
        let output = tokio::time::timeout(
            GIT_TIMEOUT,
            tokio::process::Command::new("git")
                .args(args)
                .current_dir(&self.root)
                .output(),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() {
            debug!(?args, stderr = %String::from_utf8_lossy(&output.stderr), "git command failed");
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

}

fn is_skipped(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components().any(|c| {
                SKIPPED_DIRS
                    .iter()
                    .any(|skip| c.as_os_str() == std::ffi::OsStr::new(skip))
            })
        })
        .unwrap_or(true)
}

/// Blocking walk for `*.md` under `root`.
fn find_docs(root: &Path) -> Vec<String> {
    let pattern = format!("{}/**/*.md", glob::Pattern::escape(&root.to_string_lossy()));
    let Ok(entries) = glob::glob(&pattern) else {
        warn!(%pattern, "invalid documentation glob");
        return Vec::new();
    };
    let mut docs: Vec<String> = entries
        .flatten()
        .filter(|p| p.is_file() && !is_skipped(root, p))
        .filter_map(|p| {
            p.strip_prefix(root)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    docs.sort();
    docs
}

/// Paths from `git status --porcelain -z`. Renames and copies carry the
/// original path as an extra field, which is skipped.
fn parse_porcelain(out: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut fields = out.split('\0');
    while let Some(entry) = fields.next() {
        let (Some(status), Some(path)) = (entry.get(..2), entry.get(3..)) else {
            continue;
        };
        if status.contains(['R', 'C']) {
            fields.next();
        }
        if !path.is_empty() {
            paths.push(path.to_string());
        }
    }
    paths
}

#[async_trait]
impl WorkspaceProbe for FsProbe {
    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Some(full) => tokio::fs::try_exists(full).await.unwrap_or(false),
            None => false,
        }
    }

    async fn list_docs(&self) -> Vec<String> {
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || find_docs(&root)).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(error = %e, "documentation scan failed");
                Vec::new()
            }
        }
    }

    async fn count_lines(&self, path: &str) -> Option<u64> {
        let content = tokio::fs::read_to_string(self.resolve(path)?).await.ok()?;
        Some(content.lines().count() as u64)
    }

    async fn modified(&self, path: &str) -> Option<DateTime<Utc>> {
        let meta = tokio::fs::metadata(self.resolve(path)?).await.ok()?;
        meta.modified().ok().map(DateTime::<Utc>::from)
    }

    async fn uncommitted_changes(&self) -> Option<Vec<String>> {
        let out = self.git(&["status", "--porcelain", "-z"]).await?;
        Some(parse_porcelain(&out))
    }

    async fn added_lines(&self) -> Option<u64> {
        let out = self.git(&["diff", "--numstat", "HEAD"]).await?;
        Some(
            out.lines()
                .filter_map(|line| line.split_whitespace().next())
                .filter_map(|added| added.parse::<u64>().ok())
                .sum(),
        )
    }

    async fn test_results(&self) -> Option<TestResults> {
        let command = self.test_command.as_deref()?;
        let output = match tokio::time::timeout(
            TEST_TIMEOUT,
            tokio::process::Command::new("bash")
                .arg("-c")
                .arg(command)
                .current_dir(&self.root)
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(command, error = %e, "failed to run test command");
                return None;
            }
            Err(_) => {
                warn!(command, timeout_secs = TEST_TIMEOUT.as_secs(), "test command timed out");
                return None;
            }
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Some(TestResults::parse(&text))
    }

    async fn commit(&self, paths: &[String], message: &str) -> Result<(), String> {
        if paths.is_empty() {
            return Err("nothing to commit".into());
        }
        if let Some(outside) = paths.iter().find(|p| self.resolve(p).is_none()) {
            return Err(format!("{outside} is outside the workspace"));
        }
        let mut add: Vec<&str> = vec!["add", "--"];
        add.extend(paths.iter().map(String::as_str));
        self.git(&add)
            .await
            .ok_or_else(|| "git add failed".to_string())?;
        self.git(&["commit", "-m", message])
            .await
            .ok_or_else(|| "git commit failed".to_string())?;
        Ok(())
    }
}
