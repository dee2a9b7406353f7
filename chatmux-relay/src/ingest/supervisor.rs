//! Harvester process supervision
//!
//! Each chat URL gets its own task running `bin args... <url>`. Stdout lines are
//! decoded as JSON objects and delivered to the sink; stderr lines are logged.
//! When the child exits the task waits out the backoff delay and starts it again,
//! until the source is stopped or the supervisor shuts down.

use crate::ingest::backoff::Backoff;
use crate::Result;
use async_trait::async_trait;
use chatmux_common::config::IngestConfig;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest slice of an undecodable line that ends up in the log
const MAX_LOGGED_LINE_CHARS: usize = 240;

/// Consumer of decoded harvester lines
#[async_trait]
pub trait LineSink: Send + Sync + 'static {
    /// `url` is the chat URL the harvester was started for
    async fn deliver(&self, url: &str, line: Value) -> Result<()>;
}

/// Lifecycle notifications for one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Started { url: String, pid: Option<u32> },
    SpawnFailed { url: String, error: String },
    Exited { url: String, code: Option<i32>, healthy: bool },
    BackingOff { url: String, delay: Duration },
    Stopped { url: String },
}

#[derive(Debug, Clone)]
struct HarvesterCommand {
    bin: String,
    args: Vec<String>,
    backoff_base: Duration,
    backoff_max: Duration,
    healthy_after: Duration,
}

struct SourceHandle {
    cancel: CancellationToken,
    restart: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct IngestSupervisor {
    command: Arc<HarvesterCommand>,
    sink: Arc<dyn LineSink>,
    events: Option<mpsc::UnboundedSender<SourceEvent>>,
    shutdown: CancellationToken,
    sources: Mutex<HashMap<String, SourceHandle>>,
}

impl IngestSupervisor {
    /// Sources started later are cancelled together with `shutdown`
    pub fn new(config: &IngestConfig, sink: Arc<dyn LineSink>, shutdown: CancellationToken) -> Self {
        Self {
            command: Arc::new(HarvesterCommand {
                bin: config.bin.clone(),
                args: config.args.clone(),
                backoff_base: config.backoff_base(),
                backoff_max: config.backoff_max(),
                healthy_after: config.healthy_after(),
            }),
            sink,
            events: None,
            shutdown,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Report lifecycle events on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SourceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Start supervising `url`; `false` if it is already running
    pub fn spawn_source(&self, url: &str) -> bool {
        let url = url.trim();
        if url.is_empty() {
            return false;
        }

        let mut sources = self.lock();
        if sources.get(url).is_some_and(|handle| !handle.task.is_finished()) {
            warn!(url, "Source already supervised, ignoring duplicate");
            return false;
        }

        let cancel = self.shutdown.child_token();
        let restart = Arc::new(Notify::new());
        let worker = SourceWorker {
            url: url.to_string(),
            command: self.command.clone(),
            sink: self.sink.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            restart: restart.clone(),
        };
        let task = tokio::spawn(worker.run());

        info!(url, bin = %self.command.bin, "Supervising harvester");
        sources.insert(url.to_string(), SourceHandle { cancel, restart, task });
        true
    }

    /// Start every URL in `urls`, returning how many were new
    pub fn spawn_all<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        urls.into_iter().filter(|url| self.spawn_source(url.as_ref())).count()
    }

    /// Kill the running harvester for `url` so it starts again right away
    pub fn restart_source(&self, url: &str) -> bool {
        match self.lock().get(url) {
            Some(handle) => {
                info!(url, "Harvester restart requested");
                handle.restart.notify_one();
                true
            }
            None => false,
        }
    }

    /// Stop supervising `url` and wait for its task to finish
    pub async fn stop_source(&self, url: &str) -> bool {
        let handle = self.lock().remove(url);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                if let Err(e) = handle.task.await {
                    warn!(url, error = %e, "Harvester task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    /// URLs currently under supervision, sorted
    pub fn sources(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.lock().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Cancel every source and wait up to `grace` for their tasks; stragglers are aborted
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<(String, SourceHandle)> = self.lock().drain().collect();
        if handles.is_empty() {
            return;
        }

        info!("Stopping {} harvester(s)", handles.len());
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + grace;
        for (url, handle) in handles {
            let abort = handle.task.abort_handle();
            match tokio::time::timeout_at(deadline, handle.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(url, error = %e, "Harvester task ended abnormally"),
                Err(_) => {
                    warn!(url, "Harvester did not stop within grace period, aborting");
                    abort.abort();
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SourceHandle>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum RunOutcome {
    Cancelled,
    SpawnFailed(String),
    Exited { code: Option<i32>, delivered: u64 },
}

struct SourceWorker {
    url: String,
    command: Arc<HarvesterCommand>,
    sink: Arc<dyn LineSink>,
    events: Option<mpsc::UnboundedSender<SourceEvent>>,
    cancel: CancellationToken,
    restart: Arc<Notify>,
}

impl SourceWorker {
    async fn run(self) {
        let mut backoff = Backoff::new(self.command.backoff_base, self.command.backoff_max);

        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            match self.run_once().await {
                RunOutcome::Cancelled => break,
                RunOutcome::SpawnFailed(error) => {
                    warn!(url = %self.url, bin = %self.command.bin, error = %error, "Failed to start harvester");
                    self.emit(SourceEvent::SpawnFailed { url: self.url.clone(), error });
                }
                RunOutcome::Exited { code, delivered } => {
                    let healthy = delivered > 0 || started.elapsed() >= self.command.healthy_after;
                    if healthy {
                        backoff.reset();
                    }
                    warn!(url = %self.url, code, delivered, "Harvester exited");
                    self.emit(SourceEvent::Exited { url: self.url.clone(), code, healthy });
                }
            }

            let delay = backoff.next_delay();
            info!(url = %self.url, delay_ms = delay.as_millis() as u64, "Restarting harvester after delay");
            self.emit(SourceEvent::BackingOff { url: self.url.clone(), delay });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.restart.notified() => {
                    debug!(url = %self.url, "Restart requested during backoff");
                }
            }
        }

        info!(url = %self.url, "Harvester supervision stopped");
        self.emit(SourceEvent::Stopped { url: self.url.clone() });
    }

    async fn run_once(&self) -> RunOutcome {
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => return RunOutcome::SpawnFailed(e.to_string()),
        };
        let pid = child.id();
        info!(url = %self.url, pid, "Harvester started");
        self.emit(SourceEvent::Started { url: self.url.clone(), pid });

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill().await;
                return RunOutcome::SpawnFailed("harvester pipes unavailable".to_string());
            }
        };
        // Raw segments: a line that is not UTF-8 is just another undecodable line
        let mut stdout = BufReader::new(stdout).split(b'\n');
        let mut stderr = BufReader::new(stderr).split(b'\n');
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut delivered = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return RunOutcome::Cancelled;
                }
                _ = self.restart.notified() => {
                    info!(url = %self.url, "Killing harvester for restart");
                    let _ = child.start_kill();
                }
                line = stdout.next_segment(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if self.handle_line(&line).await {
                            delivered += 1;
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!(url = %self.url, error = %e, "Harvester stdout read failed");
                        stdout_open = false;
                    }
                },
                line = stderr.next_segment(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        warn!(url = %self.url, "harvester: {}", String::from_utf8_lossy(&line).trim_end());
                    }
                    Ok(None) | Err(_) => stderr_open = false,
                },
                status = child.wait(), if !stdout_open && !stderr_open => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!(url = %self.url, error = %e, "Failed to reap harvester");
                            None
                        }
                    };
                    return RunOutcome::Exited { code, delivered };
                }
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.command.bin)
            .args(&self.command.args)
            .arg(&self.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Decode and deliver one stdout line; `true` if it was a JSON object
    async fn handle_line(&self, line: &[u8]) -> bool {
        if line.iter().all(u8::is_ascii_whitespace) {
            return false;
        }

        match serde_json::from_slice::<Map<String, Value>>(line) {
            Ok(object) => {
                if let Err(e) = self.sink.deliver(&self.url, Value::Object(object)).await {
                    warn!(url = %self.url, error = %e, "Failed to deliver harvester line");
                }
                true
            }
            Err(e) => {
                let excerpt: String = String::from_utf8_lossy(line)
                    .trim()
                    .chars()
                    .take(MAX_LOGGED_LINE_CHARS)
                    .collect();
                warn!(url = %self.url, error = %e, line = %excerpt, "Dropping undecodable harvester line");
                false
            }
        }
    }

    fn emit(&self, event: SourceEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct CollectingSink {
        lines: AsyncMutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl LineSink for CollectingSink {
        async fn deliver(&self, url: &str, line: Value) -> Result<()> {
            self.lines.lock().await.push((url.to_string(), line));
            Ok(())
        }
    }

    fn shell_config(script: &str, base_ms: u64, max_ms: u64) -> IngestConfig {
        IngestConfig {
            bin: "sh".to_string(),
            // `sh -c script name url`: the url lands in $0
            args: vec!["-c".to_string(), script.to_string()],
            backoff_base_ms: base_ms,
            backoff_max_ms: max_ms,
            healthy_after_ms: 60_000,
            ..Default::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SourceEvent>) -> SourceEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_crashing_harvester_backs_off_exponentially() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(CollectingSink::default());
        let supervisor = IngestSupervisor::new(
            &shell_config("exit 3", 10, 40),
            sink,
            CancellationToken::new(),
        )
        .with_events(tx);

        assert!(supervisor.spawn_source("https://twitch.tv/demo"));
        assert!(!supervisor.spawn_source("https://twitch.tv/demo"));

        let mut delays = Vec::new();
        while delays.len() < 4 {
            match next_event(&mut rx).await {
                SourceEvent::Exited { code, healthy, .. } => {
                    assert_eq!(code, Some(3));
                    assert!(!healthy);
                }
                SourceEvent::BackingOff { delay, .. } => delays.push(delay.as_millis() as u64),
                _ => {}
            }
        }
        assert_eq!(delays, vec![10, 20, 40, 40]);

        assert!(supervisor.stop_source("https://twitch.tv/demo").await);
        assert!(supervisor.sources().is_empty());
    }

    #[tokio::test]
    async fn test_lines_are_decoded_and_delivered() {
        let script = r#"echo '{"author":"a","message":"hi"}'; echo 'not json'; echo '[1,2]'; echo '{"n":2}'"#;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(CollectingSink::default());
        let supervisor = IngestSupervisor::new(
            &shell_config(script, 10_000, 10_000),
            sink.clone(),
            CancellationToken::new(),
        )
        .with_events(tx);

        supervisor.spawn_source("https://kick.com/demo");
        loop {
            if let SourceEvent::Exited { healthy, .. } = next_event(&mut rx).await {
                assert!(healthy);
                break;
            }
        }

        let lines = sink.lines.lock().await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, "https://kick.com/demo");
        assert_eq!(lines[0].1["message"], "hi");
        assert_eq!(lines[1].1["n"], 2);
        drop(lines);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_stop_reading() {
        let script = r#"printf '\377\376\n'; echo '{"n":1}'; printf '{"n":2}\r\n'"#;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(CollectingSink::default());
        let supervisor = IngestSupervisor::new(
            &shell_config(script, 10_000, 10_000),
            sink.clone(),
            CancellationToken::new(),
        )
        .with_events(tx);

        supervisor.spawn_source("https://twitch.tv/bytes");
        loop {
            if let SourceEvent::Exited { code, healthy, .. } = next_event(&mut rx).await {
                assert_eq!(code, Some(0));
                assert!(healthy);
                break;
            }
        }

        let lines = sink.lines.lock().await;
        let numbers: Vec<i64> = lines.iter().filter_map(|(_, line)| line["n"].as_i64()).collect();
        assert_eq!(numbers, vec![1, 2]);
        drop(lines);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_missing_binary_reports_spawn_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = shell_config("", 10, 10);
        config.bin = "/nonexistent/chatmux-harvester".to_string();
        let supervisor =
            IngestSupervisor::new(&config, Arc::new(CollectingSink::default()), CancellationToken::new())
                .with_events(tx);

        supervisor.spawn_source("https://youtube.com/watch?v=x");
        loop {
            if let SourceEvent::SpawnFailed { url, .. } = next_event(&mut rx).await {
                assert_eq!(url, "https://youtube.com/watch?v=x");
                break;
            }
        }
        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_kills_long_running_harvester() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let supervisor = IngestSupervisor::new(
            &shell_config("exec sleep 30", 10, 10),
            Arc::new(CollectingSink::default()),
            shutdown.clone(),
        )
        .with_events(tx);

        supervisor.spawn_source("https://twitch.tv/a");
        assert!(matches!(next_event(&mut rx).await, SourceEvent::Started { .. }));

        shutdown.cancel();
        supervisor.shutdown(Duration::from_secs(5)).await;
        loop {
            if let SourceEvent::Stopped { url } = next_event(&mut rx).await {
                assert_eq!(url, "https://twitch.tv/a");
                break;
            }
        }
        assert!(supervisor.sources().is_empty());
    }

    #[tokio::test]
    async fn test_restart_kills_running_harvester() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = IngestSupervisor::new(
            &shell_config("exec sleep 30", 10, 10),
            Arc::new(CollectingSink::default()),
            CancellationToken::new(),
        )
        .with_events(tx);

        supervisor.spawn_source("https://twitch.tv/b");
        assert!(matches!(next_event(&mut rx).await, SourceEvent::Started { .. }));
        assert!(supervisor.restart_source("https://twitch.tv/b"));
        assert!(!supervisor.restart_source("https://twitch.tv/missing"));

        loop {
            if let SourceEvent::Exited { code, .. } = next_event(&mut rx).await {
                // Killed by signal: no exit code
                assert_eq!(code, None);
                break;
            }
        }
        loop {
            if let SourceEvent::Started { .. } = next_event(&mut rx).await {
                break;
            }
        }
        supervisor.shutdown(Duration::from_secs(5)).await;
    }
}
