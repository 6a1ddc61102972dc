//! Conversion service backed by the aria MPS command line tool.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::config::{AriaConfig, EXECUTABLE_CANDIDATES, EXECUTABLE_ENV_VAR};
use super::error::ConversionError;
use super::output_parser::{classify_failure, masked_command, parse_line};
use super::traits::ConversionService;
use super::types::{ConversionRequest, FetchedOutputs, RemoteStatus, StageProgress};
use crate::cache::output_dir_for;
use crate::job::{JobId, JobStage};

/// Which command line the executable understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliFlavor {
    /// `aria_mps single -i <input>`, writes `mps_<stem>_vrs` next to the input.
    Mps,
    /// `aria-cli --Input <input> --Output <dir>`, writes straight into `dir`.
    Legacy,
}

impl CliFlavor {
    pub fn of(executable: &Path) -> Self {
        let stem = executable
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if stem == "aria_mps" {
            Self::Mps
        } else {
            Self::Legacy
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CliExit {
    Success,
    Failed { code: Option<i32>, output: String },
    Killed,
}

/// What the running CLI has reported so far.
#[derive(Debug, Clone, Default)]
struct CliState {
    stage: Option<JobStage>,
    percent: Option<f64>,
    message: Option<String>,
    exit: Option<CliExit>,
}

struct CliSession {
    state: watch::Receiver<CliState>,
    kill: CancellationToken,
    /// Where the CLI writes its outputs.
    source_dir: PathBuf,
}

/// Runs one aria CLI process per job and maps its output onto job stages.
///
/// The CLI performs every stage in one invocation, so the first stage call
/// starts the process and later calls observe it. Process start-up is
/// serialized through an auth lock held for `auth_settle_ms` so that
/// concurrent instances do not race their logins.
pub struct AriaCliService {
    config: AriaConfig,
    sessions: DashMap<JobId, Arc<CliSession>>,
    auth_lock: Mutex<()>,
}

impl AriaCliService {
    pub fn new(config: AriaConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            auth_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AriaConfig {
        &self.config
    }

    /// Finds the CLI: configured path, then `ARIA_CLI_PATH`, then `PATH`.
    pub fn resolve_executable(&self) -> Result<PathBuf, ConversionError> {
        if let Some(path) = &self.config.executable {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(ConversionError::ExecutableNotFound {
                searched: path.display().to_string(),
            });
        }

        if let Some(env_path) = std::env::var_os(EXECUTABLE_ENV_VAR) {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Some(path_var) = std::env::var_os("PATH") {
            let dirs: Vec<PathBuf> = std::env::split_paths(&path_var).collect();
            for name in EXECUTABLE_CANDIDATES {
                if let Some(found) = dirs.iter().map(|d| d.join(name)).find(|c| c.is_file()) {
                    return Ok(found);
                }
            }
        }

        Err(ConversionError::ExecutableNotFound {
            searched: format!(
                "{}, PATH for {}",
                EXECUTABLE_ENV_VAR,
                EXECUTABLE_CANDIDATES.join(", ")
            ),
        })
    }

    fn build_args(&self, flavor: CliFlavor, request: &ConversionRequest) -> Vec<String> {
        let input = request.input_path.to_string_lossy().to_string();
        let mut args: Vec<String> = match flavor {
            CliFlavor::Mps => vec![
                "single".into(),
                "-i".into(),
                input,
                "--username".into(),
                self.config.username.clone(),
                "--password".into(),
                self.config.password.clone(),
                "--no-ui".into(),
                "--no-save-token".into(),
            ],
            CliFlavor::Legacy => vec![
                "--username".into(),
                self.config.username.clone(),
                "--password".into(),
                self.config.password.clone(),
                "--Input".into(),
                input,
                "--Output".into(),
                request.output_dir.to_string_lossy().to_string(),
            ],
        };
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Returns the job's session, starting the CLI if none exists.
    async fn session(&self, request: &ConversionRequest) -> Result<Arc<CliSession>, ConversionError> {
        if let Some(existing) = self.sessions.get(&request.job_id) {
            return Ok(Arc::clone(existing.value()));
        }
        self.start_session(request).await
    }

    async fn start_session(
        &self,
        request: &ConversionRequest,
    ) -> Result<Arc<CliSession>, ConversionError> {
        if !request.input_path.is_file() {
            return Err(ConversionError::InputNotFound {
                path: request.input_path.clone(),
            });
        }

        let executable = self.resolve_executable()?;
        let flavor = CliFlavor::of(&executable);
        let args = self.build_args(flavor, request);
        let source_dir = match flavor {
            CliFlavor::Mps => output_dir_for(&request.input_path, None),
            CliFlavor::Legacy => {
                tokio::fs::create_dir_all(&request.output_dir).await?;
                request.output_dir.clone()
            }
        };

        info!(
            job_id = %request.job_id,
            "Executing aria CLI: {}",
            masked_command(&executable.to_string_lossy(), &args)
        );
        debug!(job_id = %request.job_id, source_dir = %source_dir.display(), "Expected CLI output directory");

        let auth_guard = self.auth_lock.lock().await;

        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ConversionError::ExecutableNotFound {
                        searched: executable.display().to_string(),
                    }
                } else {
                    ConversionError::Spawn {
                        reason: e.to_string(),
                    }
                }
            })?;

        let (state_tx, state_rx) = watch::channel(CliState::default());
        let kill = CancellationToken::new();
        let (line_tx, line_rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        tokio::spawn(drive_session(
            child,
            line_rx,
            state_tx,
            kill.clone(),
            request.job_id.clone(),
            self.config.output_tail_lines.max(1),
        ));

        let session = Arc::new(CliSession {
            state: state_rx,
            kill,
            source_dir,
        });
        // Registered before the settle delay so a cancelled caller still
        // leaves the process reachable by `release`.
        self.sessions
            .insert(request.job_id.clone(), Arc::clone(&session));

        if self.config.auth_settle_ms > 0 {
            sleep(Duration::from_millis(self.config.auth_settle_ms)).await;
        }
        drop(auth_guard);
        debug!(job_id = %request.job_id, "Authentication lock released");

        Ok(session)
    }

    /// Moves the CLI's output directory into place and counts its contents.
    async fn materialize(
        &self,
        source: &Path,
        dest: &Path,
    ) -> Result<FetchedOutputs, ConversionError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(ConversionError::OutputMissing {
                path: source.to_path_buf(),
            });
        }

        if !same_path(source, dest).await {
            if tokio::fs::try_exists(dest).await.unwrap_or(false) {
                info!(path = %dest.display(), "Removing existing output directory");
                tokio::fs::remove_dir_all(dest).await?;
            }
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            info!(from = %source.display(), to = %dest.display(), "Moving conversion output");
            if let Err(e) = tokio::fs::rename(source, dest).await {
                warn!(error = %e, "Rename failed, copying output instead");
                let (from, to) = (source.to_path_buf(), dest.to_path_buf());
                tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                    .await
                    .map_err(|e| ConversionError::Io(std::io::Error::other(e)))??;
                tokio::fs::remove_dir_all(source).await?;
            }
        } else {
            debug!(path = %dest.display(), "Output already in place");
        }

        let dir = dest.to_path_buf();
        let (files, bytes) = tokio::task::spawn_blocking(move || count_files(&dir))
            .await
            .map_err(|e| ConversionError::Io(std::io::Error::other(e)))?;
        info!(path = %dest.display(), files, bytes, "Conversion output ready");

        Ok(FetchedOutputs {
            output_dir: dest.to_path_buf(),
            files,
            bytes,
        })
    }
}

#[async_trait]
impl ConversionService for AriaCliService {
    fn name(&self) -> &str {
        "aria_cli"
    }

    async fn validate(&self) -> Result<(), ConversionError> {
        let executable = self.resolve_executable()?;
        if !self.config.has_credentials() {
            return Err(ConversionError::AuthenticationFailed {
                reason: "aria username and password are not configured".to_string(),
            });
        }
        info!(executable = %executable.display(), flavor = ?CliFlavor::of(&executable), "Aria CLI available");
        Ok(())
    }

    async fn run_stage(
        &self,
        request: &ConversionRequest,
        stage: JobStage,
        progress_tx: mpsc::Sender<StageProgress>,
    ) -> Result<(), ConversionError> {
        if !matches!(
            stage,
            JobStage::Hashing
                | JobStage::HealthCheck
                | JobStage::Encrypting
                | JobStage::UploadingToService
        ) {
            return Err(ConversionError::UnsupportedStage {
                stage: stage.to_string(),
            });
        }

        let session = self.session(request).await?;
        let mut state_rx = session.state.clone();

        loop {
            let state = state_rx.borrow_and_update().clone();
            forward(&state, stage, &progress_tx);
            if let Some(outcome) = stage_outcome(&state, stage) {
                return outcome;
            }
            if state_rx.changed().await.is_err() {
                let state = state_rx.borrow().clone();
                return stage_outcome(&state, stage).unwrap_or_else(|| Err(session_vanished()));
            }
        }
    }

    async fn poll_status(
        &self,
        request: &ConversionRequest,
    ) -> Result<RemoteStatus, ConversionError> {
        let session = self.session(request).await?;
        let state = session.state.borrow().clone();

        match &state.exit {
            Some(CliExit::Success) => return Ok(RemoteStatus::Ready),
            Some(CliExit::Failed { code, output }) => return Err(classify_failure(*code, output)),
            Some(CliExit::Killed) => return Err(ConversionError::Cancelled),
            None => {}
        }
        if state.stage >= Some(JobStage::FetchingOutputs) {
            return Ok(RemoteStatus::Ready);
        }
        Ok(RemoteStatus::Processing {
            percent: None,
            message: state.message,
        })
    }

    async fn fetch_outputs(
        &self,
        request: &ConversionRequest,
        progress_tx: mpsc::Sender<StageProgress>,
    ) -> Result<FetchedOutputs, ConversionError> {
        let session = self.session(request).await?;
        let mut state_rx = session.state.clone();

        loop {
            let state = state_rx.borrow_and_update().clone();
            forward(&state, JobStage::FetchingOutputs, &progress_tx);
            match &state.exit {
                Some(CliExit::Success) => break,
                Some(CliExit::Failed { code, output }) => {
                    return Err(classify_failure(*code, output))
                }
                Some(CliExit::Killed) => return Err(ConversionError::Cancelled),
                None => {}
            }
            if state_rx.changed().await.is_err()
                && !matches!(state_rx.borrow().exit, Some(CliExit::Success))
            {
                return Err(session_vanished());
            }
        }

        self.materialize(&session.source_dir, &request.output_dir)
            .await
    }

    async fn release(&self, request: &ConversionRequest) {
        if let Some((_, session)) = self.sessions.remove(&request.job_id) {
            if session.state.borrow().exit.is_none() {
                info!(job_id = %request.job_id, "Stopping aria CLI session");
            }
            session.kill.cancel();
        }
    }
}

fn forward(state: &CliState, stage: JobStage, progress_tx: &mpsc::Sender<StageProgress>) {
    if state.stage == Some(stage) && (state.percent.is_some() || state.message.is_some()) {
        // Progress is best effort; a full channel drops the report.
        let _ = progress_tx.try_send(StageProgress {
            stage,
            percent: state.percent,
            message: state.message.clone(),
        });
    }
}

/// `Some` once the CLI has finished `stage` or can no longer finish it.
fn stage_outcome(state: &CliState, stage: JobStage) -> Option<Result<(), ConversionError>> {
    let passed = state.stage.is_some_and(|s| s > stage)
        || (state.stage == Some(stage) && state.percent.is_some_and(|p| p >= 100.0));
    match &state.exit {
        Some(CliExit::Success) => Some(Ok(())),
        _ if passed => Some(Ok(())),
        Some(CliExit::Failed { code, output }) => Some(Err(classify_failure(*code, output))),
        Some(CliExit::Killed) => Some(Err(ConversionError::Cancelled)),
        None => None,
    }
}

fn session_vanished() -> ConversionError {
    ConversionError::process_failed(None, "CLI session ended without an exit status", true)
}

async fn forward_lines<R>(reader: R, line_tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line_tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Owns the child process: folds its output into `state_tx` until it exits
/// or `kill` fires.
async fn drive_session(
    mut child: Child,
    mut line_rx: mpsc::Receiver<String>,
    state_tx: watch::Sender<CliState>,
    kill: CancellationToken,
    job_id: JobId,
    tail_lines: usize,
) {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(tail_lines);

    loop {
        tokio::select! {
            _ = kill.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(job_id = %job_id, error = %e, "Failed to kill aria CLI");
                }
                state_tx.send_modify(|s| s.exit = Some(CliExit::Killed));
                return;
            }
            line = line_rx.recv() => match line {
                Some(line) => {
                    debug!(job_id = %job_id, "  {}", line);
                    if tail.len() == tail_lines {
                        tail.pop_front();
                    }
                    apply_line(&state_tx, &line);
                    tail.push_back(line);
                }
                None => break,
            }
        }
    }

    let exit = tokio::select! {
        _ = kill.cancelled() => {
            let _ = child.kill().await;
            CliExit::Killed
        }
        status = child.wait() => match status {
            Ok(status) if status.success() => CliExit::Success,
            Ok(status) => CliExit::Failed {
                code: status.code(),
                output: tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            },
            Err(e) => CliExit::Failed {
                code: None,
                output: e.to_string(),
            },
        }
    };

    match &exit {
        CliExit::Success => info!(job_id = %job_id, "Aria CLI finished"),
        CliExit::Failed { code, output } => {
            error!(job_id = %job_id, code = ?code, "Aria CLI failed, last output:\n{}", output)
        }
        CliExit::Killed => info!(job_id = %job_id, "Aria CLI stopped"),
    }
    state_tx.send_modify(|s| s.exit = Some(exit));
}

fn apply_line(state_tx: &watch::Sender<CliState>, line: &str) {
    let parsed = parse_line(line);
    state_tx.send_modify(|state| {
        let mut current_stage_line = true;
        if let Some(stage) = parsed.stage {
            match state.stage {
                Some(current) if stage < current => current_stage_line = false,
                Some(current) if stage == current => {}
                _ => {
                    state.stage = Some(stage);
                    state.percent = None;
                }
            }
        }
        if let Some(percent) = parsed.percent.filter(|_| current_stage_line) {
            state.percent = Some(percent);
            state.message = Some(parsed.message.clone());
        } else if parsed.is_error {
            state.message = Some(parsed.message.clone());
        }
    });
}

async fn same_path(a: &Path, b: &Path) -> bool {
    match (
        tokio::fs::canonicalize(a).await,
        tokio::fs::canonicalize(b).await,
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), ConversionError> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| ConversionError::Io(std::io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| ConversionError::Io(std::io::Error::other(e)))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn count_files(dir: &Path) -> (usize, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(files, bytes), e| {
            (files + 1, bytes + e.metadata().map(|m| m.len()).unwrap_or(0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheProbe, OutputLayout};
    use crate::testing::fixtures::write_complete_output;
    use tempfile::TempDir;

    fn request(input: &Path, output_dir: &Path) -> ConversionRequest {
        ConversionRequest {
            job_id: JobId::from_path(input),
            input_path: input.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    #[test]
    fn test_flavor_from_executable_name() {
        assert_eq!(CliFlavor::of(Path::new("/usr/bin/aria_mps")), CliFlavor::Mps);
        assert_eq!(CliFlavor::of(Path::new("C:/bin/ARIA_MPS.exe")), CliFlavor::Mps);
        assert_eq!(CliFlavor::of(Path::new("/usr/bin/aria-cli")), CliFlavor::Legacy);
    }

    #[test]
    fn test_mps_args() {
        let service = AriaCliService::new(AriaConfig::default().with_credentials("me", "secret"));
        let req = request(Path::new("/d/a.vrs"), Path::new("/out/mps_a_vrs"));
        let args = service.build_args(CliFlavor::Mps, &req);
        assert_eq!(
            args,
            vec![
                "single", "-i", "/d/a.vrs", "--username", "me", "--password", "secret",
                "--no-ui", "--no-save-token"
            ]
        );
    }

    #[test]
    fn test_legacy_args() {
        let service = AriaCliService::new(AriaConfig::default().with_credentials("me", "secret"));
        let req = request(Path::new("/d/a.vrs"), Path::new("/out/mps_a_vrs"));
        let args = service.build_args(CliFlavor::Legacy, &req);
        assert_eq!(&args[4..], &["--Input", "/d/a.vrs", "--Output", "/out/mps_a_vrs"]);
    }

    #[test]
    fn test_missing_configured_executable() {
        let service =
            AriaCliService::new(AriaConfig::default().with_executable("/nonexistent/aria_mps"));
        let err = service.resolve_executable().unwrap_err();
        assert!(matches!(err, ConversionError::ExecutableNotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_stage_outcome() {
        let mut state = CliState {
            stage: Some(JobStage::Encrypting),
            percent: Some(40.0),
            ..Default::default()
        };
        assert!(stage_outcome(&state, JobStage::Hashing).unwrap().is_ok());
        assert!(stage_outcome(&state, JobStage::Encrypting).is_none());

        state.percent = Some(100.0);
        assert!(stage_outcome(&state, JobStage::Encrypting).unwrap().is_ok());
        assert!(stage_outcome(&state, JobStage::UploadingToService).is_none());

        state.exit = Some(CliExit::Failed {
            code: Some(1),
            output: "ERROR: connection reset".to_string(),
        });
        let err = stage_outcome(&state, JobStage::UploadingToService)
            .unwrap()
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_apply_line_keeps_stage_forward() {
        let (tx, rx) = watch::channel(CliState::default());
        apply_line(&tx, "Encrypting 50%");
        apply_line(&tx, "Hashing 10%");
        let state = rx.borrow().clone();
        assert_eq!(state.stage, Some(JobStage::Encrypting));
        assert_eq!(state.percent, Some(50.0));

        apply_line(&tx, "Uploading with chunk_size 8.00 MB | 3.219%");
        let state = rx.borrow().clone();
        assert_eq!(state.stage, Some(JobStage::UploadingToService));
        assert_eq!(state.percent, Some(3.21));
        assert_eq!(state.message.as_deref(), Some("Uploading: 3.21%"));
    }

    #[tokio::test]
    async fn test_materialize_moves_and_replaces() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("rec/mps_a_vrs");
        let dest = temp.path().join("out/mps_a_vrs");
        write_complete_output(&source, &OutputLayout::default());
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), b"old").unwrap();

        let service = AriaCliService::new(AriaConfig::default());
        let fetched = service.materialize(&source, &dest).await.unwrap();

        assert_eq!(fetched.files, 5);
        assert!(!source.exists());
        assert!(!dest.join("stale.txt").exists());
        assert!(CacheProbe::default().probe_dir(&dest).hit);
    }

    #[tokio::test]
    async fn test_materialize_missing_source() {
        let temp = TempDir::new().unwrap();
        let service = AriaCliService::new(AriaConfig::default());
        let err = service
            .materialize(&temp.path().join("nope"), &temp.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::OutputMissing { .. }));
    }

    #[cfg(unix)]
    fn fake_cli(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("aria_mps");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_full_run_with_fake_cli() {
        let temp = TempDir::new().unwrap();
        let script = r#"#!/bin/sh
input="$3"
out="$(dirname "$input")/mps_$(basename "$input" .vrs)_vrs"
echo "2026-02-12 15:57:22,438 [1] [INFO] [hash:1] - [vrs:$input] Hashing 50%"
echo "Hashing 100%"
echo "Health check passed"
echo "Encrypting 100%" 1>&2
echo "Uploading with chunk_size 8.00 MB | 100%"
mkdir -p "$out/eye_gaze" "$out/hand_tracking" "$out/slam"
echo "t,x" > "$out/eye_gaze/general_eye_gaze.csv"
echo "t,x" > "$out/hand_tracking/hand_tracking_results.csv"
echo "t,x" > "$out/slam/closed_loop_trajectory.csv"
echo "gz" > "$out/slam/semidense_points.csv.gz"
echo '{"status":"ok"}' > "$out/slam/summary.json"
echo "Downloaded 5 files"
exit 0
"#;
        let executable = fake_cli(temp.path(), script);
        let input = temp.path().join("rec.vrs");
        std::fs::write(&input, b"VRS").unwrap();
        let output_dir = temp.path().join("out/mps_rec_vrs");

        let service = AriaCliService::new(
            AriaConfig::default()
                .with_executable(executable)
                .with_credentials("me", "secret")
                .with_auth_settle_ms(0),
        );
        service.validate().await.unwrap();
        let req = request(&input, &output_dir);
        let (tx, _rx) = mpsc::channel(64);

        for stage in [
            JobStage::Hashing,
            JobStage::HealthCheck,
            JobStage::Encrypting,
            JobStage::UploadingToService,
        ] {
            service.run_stage(&req, stage, tx.clone()).await.unwrap();
        }

        let status = loop {
            match service.poll_status(&req).await.unwrap() {
                RemoteStatus::Ready => break RemoteStatus::Ready,
                RemoteStatus::Processing { .. } => sleep(Duration::from_millis(10)).await,
            }
        };
        assert_eq!(status, RemoteStatus::Ready);

        let fetched = service.fetch_outputs(&req, tx).await.unwrap();
        assert_eq!(fetched.output_dir, output_dir);
        assert!(CacheProbe::default().probe_dir(&output_dir).hit);
        assert!(!temp.path().join("mps_rec_vrs").exists());

        service.release(&req).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_cli_is_classified() {
        let temp = TempDir::new().unwrap();
        let executable = fake_cli(
            temp.path(),
            "#!/bin/sh\necho \"Hashing 10%\"\necho \"ERROR: Connection reset by peer\" 1>&2\nexit 1\n",
        );
        let input = temp.path().join("rec.vrs");
        std::fs::write(&input, b"VRS").unwrap();

        let service = AriaCliService::new(
            AriaConfig::default()
                .with_executable(executable)
                .with_auth_settle_ms(0),
        );
        let req = request(&input, &temp.path().join("out"));
        let (tx, _rx) = mpsc::channel(64);

        let err = service
            .run_stage(&req, JobStage::Encrypting, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Network { .. }), "{:?}", err);
        assert!(err.is_retryable());

        // The failed session stays until released, then a new one can start.
        assert!(matches!(
            service.poll_status(&req).await,
            Err(ConversionError::Network { .. })
        ));
        service.release(&req).await;
        assert!(service.sessions.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_release_kills_running_cli() {
        let temp = TempDir::new().unwrap();
        let executable = fake_cli(temp.path(), "#!/bin/sh\necho \"Hashing 1%\"\nsleep 30\n");
        let input = temp.path().join("rec.vrs");
        std::fs::write(&input, b"VRS").unwrap();

        let service = Arc::new(AriaCliService::new(
            AriaConfig::default()
                .with_executable(executable)
                .with_auth_settle_ms(0),
        ));
        let req = request(&input, &temp.path().join("out"));

        let waiter = {
            let service = Arc::clone(&service);
            let req = req.clone();
            tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(64);
                service.run_stage(&req, JobStage::Hashing, tx).await
            })
        };

        sleep(Duration::from_millis(100)).await;
        service.release(&req).await;

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("stage should end once the CLI is killed")
            .unwrap();
        assert!(matches!(result, Err(ConversionError::Cancelled)));
    }
}
