//! Per-child FIFO serializer.
//!
//! Each [`Serializer`] owns exactly one worker task that dequeues a
//! [`RequestTicket`], writes its payload followed by a newline to the
//! child's stdin, reads one line from the child's stdout, and resolves
//! the ticket's single-shot response channel. This is the only place a
//! line is ever read from or written to a given child, which is what
//! keeps a line-delimited stdio stream free of response interleaving
//! under concurrent callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{BridgeError, BridgeResult};

/// Default bounded depth of a child's request queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// One enqueued request awaiting a single response line from the child.
struct RequestTicket {
    payload: Vec<u8>,
    deadline: Instant,
    cancel: CancellationToken,
    respond_to: oneshot::Sender<BridgeResult<Vec<u8>>>,
}

/// Shared state a `shutdown` call hands to the worker: the error every
/// queued/in-flight ticket should fail with, and an ack the worker fires
/// once it has drained the queue and dropped its stdin writer.
struct ShutdownState {
    reason: Mutex<Option<BridgeError>>,
    ack: Mutex<Option<oneshot::Sender<()>>>,
}

impl ShutdownState {
    fn new() -> Self {
        Self {
            reason: Mutex::new(None),
            ack: Mutex::new(None),
        }
    }

    fn take_reason(&self) -> BridgeError {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| BridgeError::Communication("serializer shutting down".into()))
    }

    fn ack(&self) {
        if let Some(tx) = self.ack.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// The per-child FIFO queue and its single worker.
///
/// Cloning a `Serializer` is cheap; all clones share the same queue and
/// therefore the same total order of dispatch.
#[derive(Clone)]
pub struct Serializer {
    tx: mpsc::Sender<RequestTicket>,
    poisoned: Arc<AtomicBool>,
    shutdown: CancellationToken,
    shutdown_state: Arc<ShutdownState>,
}

impl Serializer {
    /// Start a serializer bound to one child's stdio handles. Spawns the
    /// single dispatch worker; the worker exits when the sender side of
    /// the queue is dropped (the child is being torn down) or when
    /// `shutdown` is called.
    pub fn spawn(stdin: ChildStdin, stdout: ChildStdout, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let poisoned = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let shutdown_state = Arc::new(ShutdownState::new());

        let reader: Lines<BufReader<ChildStdout>> = BufReader::new(stdout).lines();
        let reader = Arc::new(TokioMutex::new(reader));
        let writer = BufWriter::new(stdin);

        tokio::spawn(worker_loop(
            rx,
            writer,
            reader,
            poisoned.clone(),
            shutdown.clone(),
            shutdown_state.clone(),
        ));

        Self {
            tx,
            poisoned,
            shutdown,
            shutdown_state,
        }
    }

    /// Close the child's real stdin pipe and fail every ticket still
    /// queued or in flight with `reason`. Idempotent: a second call on an
    /// already-shut-down serializer returns immediately.
    ///
    /// Resolves once the worker has actually dropped its `BufWriter`, so
    /// a caller that waits for the child to exit afterward observes the
    /// pipe closed rather than racing the worker task.
    pub async fn shutdown(&self, reason: BridgeError) {
        self.poisoned.store(true, Ordering::Release);
        if self.shutdown.is_cancelled() {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        *self.shutdown_state.reason.lock() = Some(reason);
        *self.shutdown_state.ack.lock() = Some(ack_tx);
        self.shutdown.cancel();
        let _ = ack_rx.await;
    }

    /// Enqueue `payload` and await its response, or a cancellation/timeout
    /// failure, whichever comes first.
    ///
    /// If `cancel` fires before the ticket reaches the worker, the ticket
    /// is dropped without writing anything to the child. If it fires
    /// after the write but before a response line arrives, this call
    /// returns a `Timeout` error while the worker keeps reading the
    /// response line in the background so the stream stays in sync.
    pub async fn send_and_receive(
        &self,
        payload: Vec<u8>,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> BridgeResult<Vec<u8>> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(BridgeError::Communication(
                "child is unavailable after a prior communication failure".into(),
            ));
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let ticket = RequestTicket {
            payload,
            deadline,
            cancel: cancel.clone(),
            respond_to: resp_tx,
        };

        if self.tx.send(ticket).await.is_err() {
            return Err(BridgeError::Communication("serializer worker exited".into()));
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                Err(BridgeError::Timeout("request cancelled".into()))
            }
            result = resp_rx => {
                result.map_err(|_| BridgeError::Communication("ticket dropped without a response".into()))?
            }
        }
    }

    /// Whether this child's serializer has been poisoned by a prior
    /// write/read failure and is draining with a communication error
    /// until a restart replaces it.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<RequestTicket>,
    mut writer: BufWriter<ChildStdin>,
    reader: Arc<TokioMutex<Lines<BufReader<ChildStdout>>>>,
    poisoned: Arc<AtomicBool>,
    shutdown: CancellationToken,
    shutdown_state: Arc<ShutdownState>,
) {
    'outer: loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break 'outer,
            maybe_ticket = rx.recv() => {
                let Some(ticket) = maybe_ticket else { break 'outer };

                if ticket.cancel.is_cancelled() {
                    trace!("ticket cancelled before dispatch, dropping without side effect");
                    continue;
                }

                if poisoned.load(Ordering::Acquire) {
                    let _ = ticket.respond_to.send(Err(BridgeError::Communication(
                        "child unavailable, queue draining until restart".into(),
                    )));
                    continue;
                }

                if let Err(e) = write_line(&mut writer, &ticket.payload).await {
                    warn!("write to child stdin failed: {e}");
                    poisoned.store(true, Ordering::Release);
                    let _ = ticket
                        .respond_to
                        .send(Err(BridgeError::Communication(e.to_string())));
                    continue;
                }

                let reader = reader.clone();
                let read_task = tokio::spawn(async move { read_one_line(reader).await });
                tokio::pin!(read_task);

                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        let _ = ticket.respond_to.send(Err(shutdown_state.take_reason()));
                        break 'outer;
                    }
                    () = ticket.cancel.cancelled() => {
                        let _ = ticket.respond_to.send(Err(BridgeError::Timeout("request cancelled".into())));
                        // Keep reading the in-flight line so the next ticket's
                        // read doesn't pick up a stale response.
                        let _ = read_task.await;
                    }
                    () = tokio::time::sleep_until(ticket.deadline) => {
                        let _ = ticket.respond_to.send(Err(BridgeError::Timeout("deadline exceeded".into())));
                        let _ = read_task.await;
                    }
                    joined = &mut read_task => {
                        match joined {
                            Ok(Ok(Some(line))) => {
                                let _ = ticket.respond_to.send(Ok(line.into_bytes()));
                            }
                            Ok(Ok(None)) => {
                                warn!("child stdout closed (EOF)");
                                poisoned.store(true, Ordering::Release);
                                let _ = ticket.respond_to.send(Err(BridgeError::Communication(
                                    "child stdout closed".into(),
                                )));
                            }
                            Ok(Err(e)) => {
                                warn!("read from child stdout failed: {e}");
                                poisoned.store(true, Ordering::Release);
                                let _ = ticket.respond_to.send(Err(BridgeError::Communication(e.to_string())));
                            }
                            Err(join_err) => {
                                warn!("reader task panicked: {join_err}");
                                poisoned.store(true, Ordering::Release);
                                let _ = ticket.respond_to.send(Err(BridgeError::Communication(
                                    "reader task failed".into(),
                                )));
                            }
                        }
                    }
                }
            }
        }
    }

    if shutdown.is_cancelled() {
        let reason = shutdown_state.take_reason();
        rx.close();
        while let Ok(ticket) = rx.try_recv() {
            let _ = ticket.respond_to.send(Err(reason.clone()));
        }
    }
    // Dropping the writer here, rather than at the top of this function,
    // is what actually closes the child's stdin pipe once every queued
    // ticket has been failed.
    drop(writer);
    shutdown_state.ack();
    debug!("serializer worker exiting");
}

async fn write_line(writer: &mut BufWriter<ChildStdin>, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_one_line(
    reader: Arc<TokioMutex<Lines<BufReader<ChildStdout>>>>,
) -> std::io::Result<Option<String>> {
    let mut guard = reader.lock().await;
    guard.next_line().await
}

/// Convenience: build a deadline `Instant` this many milliseconds from now.
pub fn deadline_in(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_echo_child() -> tokio::process::Child {
        Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("cat must be available for this test")
    }

    #[tokio::test]
    async fn fifo_pairs_responses_in_request_order() {
        let mut child = spawn_echo_child();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let serializer = Serializer::spawn(stdin, stdout, DEFAULT_QUEUE_DEPTH);

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let s = serializer.clone();
            handles.push(tokio::spawn(async move {
                let payload = format!("{{\"n\":{i}}}").into_bytes();
                let resp = s
                    .send_and_receive(payload.clone(), deadline_in(2000), CancellationToken::new())
                    .await
                    .unwrap();
                assert_eq!(resp, payload);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(8))]
        #[test]
        fn fifo_pairs_each_concurrent_request_with_its_own_payload(ns in proptest::collection::vec(0u32..10_000, 1..24)) {
            tokio::runtime::Runtime::new().unwrap().block_on(async {
                let mut child = spawn_echo_child();
                let stdin = child.stdin.take().unwrap();
                let stdout = child.stdout.take().unwrap();
                let serializer = Serializer::spawn(stdin, stdout, DEFAULT_QUEUE_DEPTH);

                let mut handles = Vec::new();
                for n in ns {
                    let s = serializer.clone();
                    handles.push(tokio::spawn(async move {
                        let payload = format!("{{\"n\":{n}}}").into_bytes();
                        let resp = s
                            .send_and_receive(payload.clone(), deadline_in(2000), CancellationToken::new())
                            .await
                            .unwrap();
                        assert_eq!(resp, payload);
                    }));
                }
                for h in handles {
                    h.await.unwrap();
                }
            });
        }
    }

    #[tokio::test]
    async fn cancellation_before_dispatch_drops_ticket_silently() {
        let mut child = spawn_echo_child();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let serializer = Serializer::spawn(stdin, stdout, DEFAULT_QUEUE_DEPTH);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = serializer
            .send_and_receive(b"{}".to_vec(), deadline_in(1000), cancel)
            .await;
        assert!(matches!(res, Err(BridgeError::Timeout(_))));
    }

    #[tokio::test]
    async fn shutdown_closes_stdin_and_fails_queued_and_in_flight_tickets() {
        let mut child = Command::new("sleep")
            .arg("5")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let serializer = Serializer::spawn(stdin, stdout, DEFAULT_QUEUE_DEPTH);

        let mut handles = Vec::new();
        for i in 0..2u32 {
            let s = serializer.clone();
            handles.push(tokio::spawn(async move {
                s.send_and_receive(
                    format!("{{\"n\":{i}}}").into_bytes(),
                    deadline_in(5000),
                    CancellationToken::new(),
                )
                .await
            }));
        }
        // Give the worker a moment to dequeue the first ticket and start
        // waiting on a response that `sleep` will never send.
        tokio::time::sleep(Duration::from_millis(50)).await;

        serializer
            .shutdown(BridgeError::Restarted("child restarted".into()))
            .await;

        for h in handles {
            let res = h.await.unwrap();
            assert!(matches!(res, Err(BridgeError::Restarted(_))));
        }
        assert!(serializer.is_poisoned());
    }

    #[tokio::test]
    async fn timeout_against_silent_child_returns_promptly() {
        // `sleep`'s stdin is piped but it never echoes, simulating a hung child.
        let mut child = Command::new("sleep")
            .arg("5")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let serializer = Serializer::spawn(stdin, stdout, DEFAULT_QUEUE_DEPTH);

        let started = std::time::Instant::now();
        let res = serializer
            .send_and_receive(b"{}".to_vec(), deadline_in(100), CancellationToken::new())
            .await;
        assert!(matches!(res, Err(BridgeError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
