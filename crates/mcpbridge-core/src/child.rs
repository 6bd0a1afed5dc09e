//! The Supervisor and the Child it owns.
//!
//! The Supervisor is the sole owner of Child lifecycle and stdio handles.
//! Session references to Children elsewhere in the crate are non-owning
//! lookups by key.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::operation::OperationTracker;
use crate::serializer::{Serializer, DEFAULT_QUEUE_DEPTH};

const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies a Child: its configured server name, plus a session id for
/// session-scoped children (`None` for global children).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChildKey {
    pub name: String,
    pub session_id: Option<String>,
}

impl ChildKey {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session_id: None,
        }
    }

    pub fn session_scoped(name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session_id: Some(session_id.into()),
        }
    }
}

impl std::fmt::Display for ChildKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.session_id {
            Some(sid) => write!(f, "{}/{sid}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A supervised child process for a named server.
pub struct Child {
    pub key: ChildKey,
    config: ServerConfig,
    process: Arc<tokio::sync::Mutex<Option<tokio::process::Child>>>,
    serializer: Serializer,
    pub operations: Arc<OperationTracker>,
    generation: u64,
}

impl Child {
    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Monotonically increasing generation number, bumped on every
    /// restart. Used to invalidate stale lookups race-free.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn is_alive(&self) -> bool {
        let mut guard = self.process.lock().await;
        match guard.as_mut() {
            Some(proc) => matches!(proc.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Brings children from "configured" to "running", keeps them running,
/// and tears them down cleanly.
pub struct Supervisor {
    children: DashMap<ChildKey, Arc<Child>>,
    generation_counter: AtomicU64,
    queue_depth: usize,
    session_root: RwLock<String>,
}

impl Supervisor {
    pub fn new(queue_depth: usize, session_root: impl Into<String>) -> Self {
        Self {
            children: DashMap::new(),
            generation_counter: AtomicU64::new(0),
            queue_depth,
            session_root: RwLock::new(session_root.into()),
        }
    }

    pub fn with_default_queue_depth(session_root: impl Into<String>) -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH, session_root)
    }

    pub fn get(&self, key: &ChildKey) -> Option<Arc<Child>> {
        self.children.get(key).map(|c| c.clone())
    }

    pub fn keys(&self) -> Vec<ChildKey> {
        self.children.iter().map(|e| e.key().clone()).collect()
    }

    /// Start a global child for `name` using `config` as-is (no template
    /// substitution).
    pub async fn start(&self, name: &str, config: ServerConfig) -> BridgeResult<Arc<Child>> {
        let key = ChildKey::global(name);
        self.spawn_and_register(key, config, None).await
    }

    /// Start a session-scoped child: `{SESSION_ID}`/`{SERVER_NAME}`
    /// placeholders in args and env values are expanded, and the child's
    /// working directory is set to an idempotently-created
    /// `<root>/<sessionID>/{data,cache,temp}` tree.
    pub async fn start_for_session(
        &self,
        session_id: &str,
        name: &str,
        config: ServerConfig,
    ) -> BridgeResult<Arc<Child>> {
        let key = ChildKey::session_scoped(name, session_id);
        let expanded = expand_template(&config, session_id, name);
        let workdir = self.prepare_session_dir(session_id)?;
        self.spawn_and_register(key, expanded, Some(workdir)).await
    }

    fn prepare_session_dir(&self, session_id: &str) -> BridgeResult<String> {
        let root = self.session_root.read().clone();
        let base = std::path::Path::new(&root).join(session_id);
        for sub in ["data", "cache", "temp"] {
            std::fs::create_dir_all(base.join(sub))
                .map_err(|e| BridgeError::Supervisor(format!("failed to prepare session dir: {e}")))?;
        }
        Ok(base.display().to_string())
    }

    /// Remove a session's working directory once its connection ends.
    pub fn cleanup_session_dir(&self, session_id: &str) {
        let root = self.session_root.read().clone();
        let base = std::path::Path::new(&root).join(session_id);
        if let Err(e) = std::fs::remove_dir_all(&base) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to clean up session dir {}: {e}", base.display());
            }
        }
    }

    async fn spawn_and_register(
        &self,
        key: ChildKey,
        config: ServerConfig,
        workdir: Option<String>,
    ) -> BridgeResult<Arc<Child>> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in &config.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &workdir {
            cmd.current_dir(dir);
        }

        let mut process = cmd.spawn().map_err(|e| {
            error!("failed to spawn child '{key}': {e}");
            BridgeError::Supervisor(format!("spawn failed: {e}"))
        })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Supervisor("failed to acquire child stdin".into()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Supervisor("failed to acquire child stdout".into()))?;

        let serializer = Serializer::spawn(stdin, stdout, self.queue_depth);
        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst);

        let child = Arc::new(Child {
            key: key.clone(),
            config,
            process: Arc::new(tokio::sync::Mutex::new(Some(process))),
            serializer,
            operations: Arc::new(OperationTracker::new()),
            generation,
        });

        self.children.insert(key.clone(), child.clone());
        info!("started child '{key}' (generation {generation})");
        Ok(child)
    }

    /// Stop `key` gracefully: close stdin, wait up to the graceful
    /// period, then kill and wait again. Idempotent under concurrent
    /// callers — a second `stop` on an already-removed key is a no-op.
    pub async fn stop(&self, key: &ChildKey) -> BridgeResult<()> {
        let Some((_, child)) = self.children.remove(key) else {
            return Ok(());
        };
        Self::stop_child(&child).await
    }

    async fn stop_child(child: &Child) -> BridgeResult<()> {
        // The real stdin handle was moved into the Serializer at spawn
        // time, so closing it means asking the Serializer to drop its
        // writer, not touching `process.stdin` (which is already `None`).
        // This also fails any ticket still queued or in flight, so a
        // caller blocked on `send_and_receive` observes a restart-tagged
        // error instead of hanging on a pipe nobody is reading anymore.
        child
            .serializer
            .shutdown(BridgeError::Restarted(format!(
                "child '{}' was torn down while this request was in flight",
                child.key
            )))
            .await;

        let mut guard = child.process.lock().await;
        let Some(mut process) = guard.take() else {
            return Ok(());
        };

        match timeout(GRACEFUL_STOP_TIMEOUT, process.wait()).await {
            Ok(Ok(status)) => {
                info!("child '{}' exited gracefully: {status}", child.key);
            }
            Ok(Err(e)) => {
                warn!("error waiting for child '{}' to exit: {e}", child.key);
            }
            Err(_) => {
                warn!("child '{}' did not exit gracefully, killing", child.key);
                if let Err(e) = process.start_kill() {
                    warn!("failed to send kill signal to '{}': {e}", child.key);
                }
                let _ = timeout(KILL_WAIT_TIMEOUT, process.wait()).await;
            }
        }
        Ok(())
    }

    /// Atomic stop-then-start for a global child, or the equivalent for
    /// the same (session, server) pair. Any Request Tickets queued
    /// against the old child fail with a `Restarted` error because their
    /// serializer's worker is gone; callers must re-dispatch against the
    /// freshly-returned `Child`.
    pub async fn restart(&self, key: &ChildKey, config: ServerConfig) -> BridgeResult<Arc<Child>> {
        self.stop(key).await?;
        match &key.session_id {
            Some(session_id) => self.start_for_session(session_id, &key.name, config).await,
            None => self.start(&key.name, config).await,
        }
    }
}

/// Replace `{SESSION_ID}` and `{SERVER_NAME}` placeholders in args and
/// env values.
fn expand_template(config: &ServerConfig, session_id: &str, server_name: &str) -> ServerConfig {
    let sub = |s: &str| {
        s.replace("{SESSION_ID}", session_id)
            .replace("{SERVER_NAME}", server_name)
    };
    ServerConfig {
        command: sub(&config.command),
        args: config.args.iter().map(|a| sub(a)).collect(),
        env: config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), sub(v)))
            .collect::<HashMap<_, _>>(),
        session_scoped: config.session_scoped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_config() -> ServerConfig {
        ServerConfig {
            command: "cat".into(),
            args: vec![],
            env: HashMap::new(),
            session_scoped: false,
        }
    }

    #[tokio::test]
    async fn start_then_stop_is_idempotent_under_repeated_calls() {
        let sup = Supervisor::with_default_queue_depth("/tmp/mcpbridge-test-sessions");
        let child = sup.start("echo", echo_config()).await.unwrap();
        assert!(child.is_alive().await);

        let key = ChildKey::global("echo");
        sup.stop(&key).await.unwrap();
        sup.stop(&key).await.unwrap(); // second stop is a no-op
        assert!(sup.get(&key).is_none());
    }

    #[tokio::test]
    async fn restart_fails_in_flight_requests_with_restarted_error() {
        let sup = Supervisor::with_default_queue_depth("/tmp/mcpbridge-test-sessions");
        let hang_config = ServerConfig {
            command: "sleep".into(),
            args: vec!["5".into()],
            env: HashMap::new(),
            session_scoped: false,
        };
        let child = sup.start("hang", hang_config.clone()).await.unwrap();
        let key = ChildKey::global("hang");

        let mut handles = Vec::new();
        for i in 0..2u32 {
            let s = child.serializer().clone();
            handles.push(tokio::spawn(async move {
                s.send_and_receive(
                    format!("{{\"n\":{i}}}").into_bytes(),
                    crate::serializer::deadline_in(5000),
                    tokio_util::sync::CancellationToken::new(),
                )
                .await
            }));
        }
        // Give the worker a moment to dispatch the first ticket and queue
        // the second behind it before the restart tears the child down.
        tokio::time::sleep(Duration::from_millis(50)).await;

        sup.restart(&key, hang_config).await.unwrap();

        for h in handles {
            let res = h.await.unwrap();
            assert!(matches!(res, Err(BridgeError::Restarted(_))));
        }
        assert!(sup.get(&key).is_some());
    }

    #[tokio::test]
    async fn restart_bumps_generation_and_replaces_child() {
        let sup = Supervisor::with_default_queue_depth("/tmp/mcpbridge-test-sessions");
        let first = sup.start("echo", echo_config()).await.unwrap();
        let key = ChildKey::global("echo");

        let second = sup.restart(&key, echo_config()).await.unwrap();
        assert_ne!(first.generation(), second.generation());
        assert!(sup.get(&key).is_some());
    }

    #[test]
    fn template_substitution_replaces_both_placeholders() {
        let cfg = ServerConfig {
            command: "run".into(),
            args: vec!["--session={SESSION_ID}".into(), "--name={SERVER_NAME}".into()],
            env: HashMap::from([("SID".to_string(), "{SESSION_ID}".to_string())]),
            session_scoped: true,
        };
        let expanded = expand_template(&cfg, "sess-42", "echo");
        assert_eq!(expanded.args[0], "--session=sess-42");
        assert_eq!(expanded.args[1], "--name=echo");
        assert_eq!(expanded.env.get("SID").unwrap(), "sess-42");
    }

    #[tokio::test]
    async fn session_scoped_start_creates_conventional_subdirs() {
        let root = format!("/tmp/mcpbridge-test-{}", uuid::Uuid::new_v4());
        let sup = Supervisor::with_default_queue_depth(root.clone());
        let _child = sup
            .start_for_session("sess-1", "echo", echo_config())
            .await
            .unwrap();

        for sub in ["data", "cache", "temp"] {
            assert!(std::path::Path::new(&root).join("sess-1").join(sub).is_dir());
        }
        sup.cleanup_session_dir("sess-1");
        assert!(!std::path::Path::new(&root).join("sess-1").exists());
    }
}
