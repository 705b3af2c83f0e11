//! Self-update from git with a delayed service restart.
//!
//! The running revision comes from the local checkout, the latest one from
//! a commits API (`GET {api_url}/{branch}` answering `{sha, commit:
//! {message}}`). Updates are fast-forward pulls; the service restarts
//! after a delay so clients can show the result first.

use serde::Deserialize;
use shared_wasm::event::{StatusMessage, UpdateCheckResult};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },
    #[error("Failed to query latest revision: {0}")]
    Http(String),
    #[error("Invalid {field} '{value}'")]
    InvalidArgument { field: &'static str, value: String },
    #[error("An update is already in progress")]
    InProgress,
    #[error("Update task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// What happens when the restart delay expires.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartStrategy {
    /// Exit the process and let the service manager start it again
    Exit,
    /// Run a command, e.g. `systemctl restart scope-server`
    Command(Vec<String>),
    /// Only log; for development and tests
    Disabled,
}

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// The git checkout this server runs from
    pub repo_dir: PathBuf,
    /// Commits endpoint, the branch name is appended
    pub api_url: String,
    pub default_remote: String,
    pub default_branch: String,
    pub restart_delay: Duration,
    pub restart: RestartStrategy,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("."),
            api_url: String::new(),
            default_remote: "origin".to_string(),
            default_branch: "main".to_string(),
            restart_delay: Duration::from_secs(5),
            restart: RestartStrategy::Exit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
}

/// A revision on the update server.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub sha: String,
    /// First line of the commit message
    pub summary: String,
}

fn short(sha: &str) -> String {
    sha.chars().take(7).collect()
}

/// Reject values git would parse as options.
fn check_ref(field: &'static str, value: &str) -> Result<(), UpdateError> {
    if value.is_empty() || value.starts_with('-') || value.chars().any(char::is_whitespace) {
        return Err(UpdateError::InvalidArgument {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn git(repo: &Path, args: &[&str]) -> Result<String, UpdateError> {
    let failed = |message: String| UpdateError::Git {
        command: args.first().unwrap_or(&"").to_string(),
        message,
    };
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .map_err(|e| failed(e.to_string()))?;
    if !output.status.success() {
        return Err(failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn fetch_latest(url: &str) -> Result<Revision, UpdateError> {
    let mut response = ureq::get(url)
        .header("User-Agent", "scope-server")
        .header("Accept", "application/json")
        .call()
        .map_err(|e| UpdateError::Http(e.to_string()))?;
    let commit: CommitResponse = response
        .body_mut()
        .read_json()
        .map_err(|e| UpdateError::Http(format!("invalid response: {e}")))?;
    Ok(Revision {
        summary: commit.commit.message.lines().next().unwrap_or("").to_string(),
        sha: commit.sha,
    })
}

/// Scheduled restart; dropping it cancels the restart.
pub struct PendingRestart {
    handle: JoinHandle<()>,
    pub delay: Duration,
}

impl Drop for PendingRestart {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct Updater {
    config: UpdateConfig,
    in_progress: AtomicBool,
    pending: Mutex<Option<PendingRestart>>,
}

impl Updater {
    pub fn new(config: UpdateConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            in_progress: AtomicBool::new(false),
            pending: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub async fn current_revision(&self) -> Result<String, UpdateError> {
        let repo = self.config.repo_dir.clone();
        tokio::task::spawn_blocking(move || git(&repo, &["rev-parse", "HEAD"])).await?
    }

    pub async fn latest_revision(&self, branch: Option<&str>) -> Result<Revision, UpdateError> {
        let branch = branch.unwrap_or(&self.config.default_branch);
        check_ref("branch", branch)?;
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), branch);
        tokio::task::spawn_blocking(move || fetch_latest(&url)).await?
    }

    /// Compare the running revision with the latest published one.
    pub async fn check(&self) -> Result<UpdateCheckResult, UpdateError> {
        let current = self.current_revision().await?;
        let latest = self.latest_revision(None).await?;
        let update_available = current != latest.sha;
        tracing::info!(
            "Running {}, latest {}{}",
            short(&current),
            short(&latest.sha),
            if update_available { " (update available)" } else { "" }
        );
        Ok(UpdateCheckResult {
            success: true,
            current_version: Some(short(&current)),
            latest_version: Some(short(&latest.sha)),
            update_available,
            latest_message: Some(latest.summary),
            error: None,
        })
    }

    /// Fast-forward the checkout from `source`/`branch`.
    ///
    /// Returns true when the running revision changed. `on_status` receives
    /// progress notices.
    pub async fn apply(
        &self,
        source: Option<String>,
        branch: Option<String>,
        on_status: impl Fn(StatusMessage),
    ) -> Result<bool, UpdateError> {
        let source = source.unwrap_or_else(|| self.config.default_remote.clone());
        let branch = branch.unwrap_or_else(|| self.config.default_branch.clone());
        check_ref("source", &source)?;
        check_ref("branch", &branch)?;

        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(UpdateError::InProgress);
        }
        let result = self.pull(&source, &branch, &on_status).await;
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn pull(
        &self,
        source: &str,
        branch: &str,
        on_status: &impl Fn(StatusMessage),
    ) -> Result<bool, UpdateError> {
        let before = self.current_revision().await?;
        on_status(StatusMessage::new(
            "updating",
            format!("Pulling {branch} from {source}"),
        ));

        let repo = self.config.repo_dir.clone();
        let (source, branch) = (source.to_string(), branch.to_string());
        let output = tokio::task::spawn_blocking(move || {
            git(&repo, &["pull", "--ff-only", &source, &branch])
        })
        .await??;
        tracing::info!("git pull: {output}");

        let after = self.current_revision().await?;
        let changed = before != after;
        on_status(StatusMessage::new(
            "updated",
            if changed {
                format!("Updated {} -> {}", short(&before), short(&after))
            } else {
                "Already up to date".to_string()
            },
        ));
        Ok(changed)
    }

    /// Restart the service after the configured delay. Replaces any
    /// restart already scheduled. Returns the delay in seconds.
    pub fn schedule_restart(&self) -> u64 {
        let delay = self.config.restart_delay;
        let strategy = self.config.restart.clone();
        tracing::warn!("Service restart in {}s", delay.as_secs());

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            restart(&strategy);
        });
        if let Some(previous) = self.pending.lock().unwrap().replace(PendingRestart { handle, delay }) {
            previous.handle.abort();
        }
        delay.as_secs()
    }

    pub fn restart_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Drop a scheduled restart that has not fired yet.
    pub fn cancel_restart(&self) {
        if let Some(pending) = self.pending.lock().unwrap().take() {
            if !pending.handle.is_finished() {
                pending.handle.abort();
                tracing::info!("Scheduled restart cancelled");
            }
        }
    }
}

fn restart(strategy: &RestartStrategy) {
    match strategy {
        RestartStrategy::Exit => {
            tracing::info!("Restarting: exiting for the service manager");
            std::process::exit(0);
        }
        RestartStrategy::Command(argv) => {
            let Some((program, args)) = argv.split_first() else {
                tracing::error!("Empty restart command");
                return;
            };
            tracing::info!("Restarting via {}", argv.join(" "));
            if let Err(e) = Command::new(program).args(args).spawn() {
                tracing::error!("Failed to run restart command: {e}");
                std::process::exit(0);
            }
        }
        RestartStrategy::Disabled => tracing::info!("Restart disabled, not restarting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn updater(api_url: String) -> Arc<Updater> {
        let tmp = std::env::temp_dir();
        Updater::new(UpdateConfig {
            repo_dir: tmp,
            api_url,
            restart_delay: Duration::from_millis(50),
            restart: RestartStrategy::Disabled,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_latest_revision_from_api() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/lab/scope/commits/main"))
            .and(header("User-Agent", "scope-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "0123456789abcdef",
                "commit": {"message": "Faster stitching\n\nDetails"}
            })))
            .mount(&server)
            .await;

        let updater = updater(format!("{}/repos/lab/scope/commits", server.uri()));
        let latest = updater.latest_revision(None).await.unwrap();
        assert_eq!(latest.sha, "0123456789abcdef");
        assert_eq!(latest.summary, "Faster stitching");
        assert_eq!(short(&latest.sha), "0123456");
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let updater = updater(server.uri());
        assert!(matches!(
            updater.latest_revision(Some("dev")).await,
            Err(UpdateError::Http(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_option_like_refs() {
        let updater = updater("http://localhost:1".into());
        for (source, branch) in [("--upload-pack=x", "main"), ("origin", "-b"), ("origin", "a b")] {
            assert!(matches!(
                updater
                    .apply(Some(source.into()), Some(branch.into()), |_| {})
                    .await,
                Err(UpdateError::InvalidArgument { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_cancelled_restart_never_runs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let marker = tmp.path().join("restarted");
        let updater = Updater::new(UpdateConfig {
            repo_dir: tmp.path().to_path_buf(),
            restart_delay: Duration::from_millis(50),
            restart: RestartStrategy::Command(vec![
                "touch".to_string(),
                marker.to_string_lossy().into_owned(),
            ]),
            ..Default::default()
        });

        updater.schedule_restart();
        updater.cancel_restart();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!marker.exists());

        // A second schedule replaces the first; only one restart fires
        updater.schedule_restart();
        updater.schedule_restart();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_restart_can_be_cancelled() {
        let updater = updater("http://localhost:1".into());
        assert_eq!(updater.schedule_restart(), 0);
        assert!(updater.restart_pending());
        updater.cancel_restart();
        assert!(!updater.restart_pending());

        updater.schedule_restart();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!updater.restart_pending());
    }
}
