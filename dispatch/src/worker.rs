//! The worker: fetch parts from the master, solve them, send results back.
//!
//! One connection, re-established with a 1 s → 4 s doubling back-off after
//! any failure. The same back-off paces polling while the queue is empty.
//! Solver work runs on the blocking pool (rayon fans out inside); the
//! socket stays on the async side. A patch in flight survives a
//! reconnection: the worker finishes it and sends PUT_PARTS, and the
//! master drops the payload if the part was reassigned meanwhile.

use crate::host::HostInfo;
use crate::protocol::{Command, ProtocolError};
use crate::transport::Connection;
use momfbd::{JobContext, MomfbdError, PatchData, Step};
use shared::{JobCfg, Record, Writer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Back-off floor.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
/// Back-off ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(4);

/// A part the worker has solved but not yet delivered.
struct PendingResult {
    job_id: u64,
    patch: PatchData,
}

/// Worker state: job contexts by id plus the delivery queue.
pub struct Worker {
    master_addr: String,
    info: HostInfo,
    contexts: HashMap<u64, JobContext>,
    pending: Option<PendingResult>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    /// Worker that will connect to `master_addr`.
    pub fn new(master_addr: String, n_threads: u16, cancel: Arc<AtomicBool>) -> Self {
        Self {
            master_addr,
            info: HostInfo::local(n_threads),
            contexts: HashMap::new(),
            pending: None,
            cancel,
        }
    }

    /// Run until cancelled.
    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        let mut backoff = BACKOFF_MIN;
        while !self.cancelled() {
            match self.connect().await {
                Err(e) => {
                    warn!(error = %e, "connect failed, backing off {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Ok(mut conn) => {
                    info!(master = %self.master_addr, "connected");
                    backoff = BACKOFF_MIN;
                    if let Err(e) = self.work_loop(&mut conn).await {
                        if self.cancelled() {
                            break;
                        }
                        warn!(error = %e, "connection lost, reconnecting");
                    }
                }
            }
        }
        info!("worker stopping");
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<Connection, ProtocolError> {
        let stream = TcpStream::connect(&self.master_addr).await?;
        let mut conn = Connection::new(stream);
        conn.handshake_worker(&self.info.to_bytes()).await?;
        Ok(conn)
    }

    /// Fetch/solve/deliver until the connection breaks or we are cancelled.
    async fn work_loop(&mut self, conn: &mut Connection) -> Result<(), ProtocolError> {
        let mut idle_backoff = BACKOFF_MIN;
        loop {
            if self.cancelled() {
                conn.send(Command::Disconnect, &[]).await.ok();
                return Ok(());
            }

            // A result held over from before a reconnection goes first.
            if let Some(pending) = self.pending.take() {
                self.deliver(conn, pending).await?;
            }

            conn.send(Command::GetWork, &[]).await?;
            let reply = conn.recv().await?;
            match reply.command {
                Command::Ok if reply.payload.is_empty() => {
                    debug!("queue empty, backing off {:?}", idle_backoff);
                    tokio::time::sleep(idle_backoff).await;
                    idle_backoff = (idle_backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
                Command::Ok => {
                    idle_backoff = BACKOFF_MIN;
                    let mut r = conn.reader(&reply);
                    let job_id = r.get_u64()?;
                    let patch = PatchData::from_bytes(&reply.payload[8..], conn.swap)?;
                    self.ensure_context(conn, job_id).await?;
                    let result = self.solve(job_id, patch).await;
                    match result {
                        Some(pending) => self.deliver(conn, pending).await?,
                        None => return Ok(()), // cancelled mid-solve
                    }
                }
                Command::Err => {
                    return Err(ProtocolError::PeerError(
                        String::from_utf8_lossy(&reply.payload).into_owned(),
                    ));
                }
                other => return Err(ProtocolError::UnexpectedCommand(other)),
            }
        }
    }

    /// Make sure the job's configuration has been fetched and expanded.
    async fn ensure_context(
        &mut self,
        conn: &mut Connection,
        job_id: u64,
    ) -> Result<(), ProtocolError> {
        if self.contexts.contains_key(&job_id) {
            return Ok(());
        }
        let mut w = Writer::new();
        w.put_u64(job_id);
        conn.send(Command::SlvCfg, &w.into_inner()).await?;
        let reply = conn.recv().await?;
        if reply.command != Command::Ok {
            return Err(ProtocolError::PeerError("master refused SLV_CFG".into()));
        }
        let cfg: JobCfg = conn.decode(&reply)?;
        let context = tokio::task::spawn_blocking(move || JobContext::build(cfg))
            .await
            .map_err(|e| {
                ProtocolError::Io(std::io::Error::other(format!("context build failed: {e}")))
            })?
            .map_err(|e| ProtocolError::PeerError(format!("bad job configuration: {e}")))?;
        info!(job = job_id, "job context built");
        self.contexts.insert(job_id, context);
        Ok(())
    }

    /// Solve one patch on the blocking pool. `None` means cancelled.
    async fn solve(&mut self, job_id: u64, mut patch: PatchData) -> Option<PendingResult> {
        let mut context = self.contexts.remove(&job_id)?;
        let cancel = Arc::clone(&self.cancel);
        let part_id = patch.id;
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = context.process_patch(&mut patch, Some(cancel));
            (context, patch, outcome)
        });
        let (context, patch, outcome) = handle.await.ok()?;
        self.contexts.insert(job_id, context);
        match outcome {
            Ok(summary) => {
                info!(
                    job = job_id,
                    part = part_id,
                    iterations = summary.iterations,
                    metric = summary.metric,
                    "patch solved"
                );
            }
            Err(MomfbdError::Cancelled) => {
                debug!(job = job_id, part = part_id, "patch cancelled");
                return None;
            }
            Err(e) => {
                warn!(job = job_id, part = part_id, error = %e, "patch failed");
            }
        }
        Some(PendingResult {
            job_id,
            patch: patch.results_only(),
        })
    }

    /// Send one result; on failure it is parked for the next connection.
    async fn deliver(
        &mut self,
        conn: &mut Connection,
        pending: PendingResult,
    ) -> Result<(), ProtocolError> {
        let mut w = Writer::new();
        w.put_u64(pending.job_id);
        pending.patch.pack(&mut w);
        let bytes = w.into_inner();
        let send_result = async {
            conn.send(Command::PutParts, &bytes).await?;
            let ack = conn.recv().await?;
            match ack.command {
                Command::Ok => Ok(()),
                Command::Err => Err(ProtocolError::PeerError(
                    String::from_utf8_lossy(&ack.payload).into_owned(),
                )),
                other => Err(ProtocolError::UnexpectedCommand(other)),
            }
        }
        .await;
        match send_result {
            Ok(()) => {
                debug!(job = pending.job_id, part = pending.patch.id, "result delivered");
                Ok(())
            }
            Err(e) => {
                // A broken link keeps the finished work for the next
                // connection; the master reconciles duplicates. An explicit
                // refusal drops it.
                if matches!(e, ProtocolError::Io(_)) && pending.patch.step != Step::Err {
                    self.pending = Some(pending);
                }
                Err(e)
            }
        }
    }
}
