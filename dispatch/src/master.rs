//! The master daemon: accepts workers, owns the job table, hands out
//! parts and assembles the output containers.
//!
//! One task per connected socket; the job queue itself is guarded by each
//! job's mutex plus the master's job-table mutex. A connection that drops
//! with outstanding parts puts them back on the queue.

use crate::host::HostInfo;
use crate::protocol::{Command, ProtocolError};
use crate::transport::Connection;
use momfbd::{Container, FrameSource, MomfbdError, MomfbdJob, PatchData, Step};
use shared::{JobCfg, Record, SaveFlags, Writer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Opens the frame data behind a job configuration; the file-format layer
/// is outside the core.
pub trait SourceFactory: Send + Sync + 'static {
    /// A frame source for one job.
    fn open(&self, cfg: &JobCfg) -> Result<Box<dyn FrameSource + Send>, MomfbdError>;
}

impl<F> SourceFactory for F
where
    F: Fn(&JobCfg) -> Result<Box<dyn FrameSource + Send>, MomfbdError> + Send + Sync + 'static,
{
    fn open(&self, cfg: &JobCfg) -> Result<Box<dyn FrameSource + Send>, MomfbdError> {
        self(cfg)
    }
}

struct WorkerSlot {
    info: HostInfo,
    outstanding: HashSet<(u64, u64)>,
}

/// Master state shared across connection tasks.
pub struct Master {
    jobs: Mutex<BTreeMap<u64, Arc<MomfbdJob>>>,
    workers: Mutex<HashMap<u64, WorkerSlot>>,
    next_job_id: AtomicU64,
    next_conn_id: AtomicU64,
    factory: Box<dyn SourceFactory>,
    info: HostInfo,
    out_dir: PathBuf,
    shutdown: tokio::sync::Notify,
}

impl Master {
    /// New master writing containers into `out_dir`.
    pub fn new(factory: Box<dyn SourceFactory>, out_dir: PathBuf, n_threads: u16) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(BTreeMap::new()),
            workers: Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
            next_conn_id: AtomicU64::new(1),
            factory,
            info: HostInfo::local(n_threads),
            out_dir,
            shutdown: tokio::sync::Notify::new(),
        })
    }

    /// Submit and preprocess a job; returns its id.
    ///
    /// Runs on the blocking pool: preprocessing loads and calibrates every
    /// frame stack.
    pub async fn add_job(self: &Arc<Self>, cfg: JobCfg) -> Result<u64, MomfbdError> {
        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let master = Arc::clone(self);
        let job = tokio::task::spawn_blocking(move || -> Result<MomfbdJob, MomfbdError> {
            let mut job = MomfbdJob::new(id, cfg);
            job.submit()?;
            let mut source = master.factory.open(&job.cfg)?;
            job.preprocess(source.as_mut())?;
            Ok(job)
        })
        .await
        .map_err(|e| MomfbdError::Resource(format!("preprocess task failed: {e}")))?;

        match job {
            Ok(job) => {
                info!(job = id, "job queued");
                self.jobs.lock().expect("job table poisoned").insert(id, Arc::new(job));
                Ok(id)
            }
            Err(e) => {
                error!(job = id, error = %e, "job rejected");
                Err(e)
            }
        }
    }

    fn job(&self, id: u64) -> Option<Arc<MomfbdJob>> {
        self.jobs.lock().expect("job table poisoned").get(&id).cloned()
    }

    /// Current step of a job, for observers.
    pub fn job_step(&self, id: u64) -> Option<Step> {
        self.job(id).map(|j| j.step())
    }

    /// Part steps of a job, for observers.
    pub fn job_part_steps(&self, id: u64) -> Option<Vec<(u64, Step)>> {
        self.job(id).map(|j| j.part_steps())
    }

    /// One queued part from any runnable job, with its job id.
    pub fn next_part(&self) -> Option<(u64, PatchData)> {
        let jobs: Vec<Arc<MomfbdJob>> = self
            .jobs
            .lock()
            .expect("job table poisoned")
            .values()
            .cloned()
            .collect();
        for job in jobs {
            if matches!(job.step(), Step::Queued | Step::Running) {
                if let Some(part) = job.get_work(true) {
                    return Some((job.id, part));
                }
            }
        }
        None
    }

    /// Accept loop; runs until DIE.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "master listening");
        let maintenance = {
            let master = Arc::clone(&self);
            tokio::spawn(async move { master.maintenance_loop().await })
        };
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "connection accepted");
                    let master = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = master.handle_connection(stream).await {
                            debug!(%peer, error = %e, "connection closed");
                        }
                    });
                }
                _ = self.shutdown.notified() => {
                    info!("master shutting down");
                    break;
                }
            }
        }
        maintenance.abort();
        Ok(())
    }

    /// Write finished jobs' containers out and complete their parts.
    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
        loop {
            ticker.tick().await;
            // Jobs with parts awaiting write-out; an ERR job still gets its
            // partial outputs written.
            let ready: Vec<Arc<MomfbdJob>> = self
                .jobs
                .lock()
                .expect("job table poisoned")
                .values()
                .filter(|j| {
                    matches!(j.step(), Step::Postprocess | Step::Err)
                        && j.part_steps().iter().any(|&(_, s)| s == Step::Postprocess)
                })
                .cloned()
                .collect();
            for job in ready {
                let out_dir = self.out_dir.clone();
                let result =
                    tokio::task::spawn_blocking(move || postprocess_job(&job, &out_dir)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "postprocess failed"),
                    Err(e) => error!(error = %e, "postprocess task panicked"),
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), ProtocolError> {
        let mut conn = Connection::new(stream);
        let first = conn.recv().await?;
        let info_bytes = conn
            .handshake_master(&self.info.to_bytes(), first)
            .await?;
        let worker_info = HostInfo::from_bytes(&info_bytes, conn.swap)
            .unwrap_or_else(|_| HostInfo::local(0));
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        info!(conn = conn_id, host = %worker_info.name, threads = worker_info.n_threads, "peer registered");
        self.workers.lock().expect("worker table poisoned").insert(
            conn_id,
            WorkerSlot {
                info: worker_info,
                outstanding: HashSet::new(),
            },
        );

        let result = self.connection_loop(&mut conn, conn_id).await;

        // Connection gone: re-queue whatever this worker still held.
        let slot = self
            .workers
            .lock()
            .expect("worker table poisoned")
            .remove(&conn_id);
        if let Some(slot) = slot {
            for (job_id, part_id) in slot.outstanding {
                if let Some(job) = self.job(job_id) {
                    warn!(conn = conn_id, job = job_id, part = part_id, "re-queueing lost part");
                    job.unget_work(&[part_id]);
                }
            }
        }
        result
    }

    async fn connection_loop(
        self: &Arc<Self>,
        conn: &mut Connection,
        conn_id: u64,
    ) -> Result<(), ProtocolError> {
        loop {
            let frame = conn.recv().await?;
            match frame.command {
                Command::GetWork => match self.next_part() {
                    Some((job_id, part)) => {
                        if let Some(slot) = self
                            .workers
                            .lock()
                            .expect("worker table poisoned")
                            .get_mut(&conn_id)
                        {
                            slot.outstanding.insert((job_id, part.id));
                        }
                        let mut w = Writer::new();
                        w.put_u64(job_id);
                        part.pack(&mut w);
                        conn.send(Command::Ok, &w.into_inner()).await?;
                    }
                    None => conn.send(Command::Ok, &[]).await?,
                },

                Command::PutParts => {
                    let mut r = conn.reader(&frame);
                    let job_id = r.get_u64()?;
                    let part = PatchData::from_bytes(&frame.payload[8..], conn.swap)?;
                    let part_id = part.id;
                    match self.job(job_id) {
                        Some(job) => match job.return_results(part) {
                            Ok(()) => {
                                if let Some(slot) = self
                                    .workers
                                    .lock()
                                    .expect("worker table poisoned")
                                    .get_mut(&conn_id)
                                {
                                    slot.outstanding.remove(&(job_id, part_id));
                                }
                                conn.send(Command::Ok, &[]).await?;
                            }
                            Err(e) => conn.send(Command::Err, e.to_string().as_bytes()).await?,
                        },
                        None => conn.send(Command::Err, b"unknown job").await?,
                    }
                }

                Command::SlvCfg => {
                    let mut r = conn.reader(&frame);
                    let job_id = r.get_u64()?;
                    match self.job(job_id) {
                        Some(job) => conn.send_record(Command::Ok, &job.cfg).await?,
                        None => conn.send(Command::Err, b"unknown job").await?,
                    }
                }

                Command::SlvRej => {
                    let mut r = conn.reader(&frame);
                    let job_id = r.get_u64()?;
                    let part_id = r.get_u64()?;
                    if let Some(job) = self.job(job_id) {
                        job.unget_work(&[part_id]);
                    }
                    if let Some(slot) = self
                        .workers
                        .lock()
                        .expect("worker table poisoned")
                        .get_mut(&conn_id)
                    {
                        slot.outstanding.remove(&(job_id, part_id));
                    }
                    conn.send(Command::Ok, &[]).await?;
                }

                Command::AddJob => {
                    let cfg: JobCfg = conn.decode(&frame)?;
                    match self.add_job(cfg).await {
                        Ok(id) => {
                            let mut w = Writer::new();
                            w.put_u64(id);
                            conn.send(Command::Ok, &w.into_inner()).await?;
                        }
                        Err(e) => conn.send(Command::Err, e.to_string().as_bytes()).await?,
                    }
                }

                Command::DelJob => {
                    let mut r = conn.reader(&frame);
                    let job_id = r.get_u64()?;
                    let removed = self
                        .jobs
                        .lock()
                        .expect("job table poisoned")
                        .remove(&job_id)
                        .is_some();
                    if removed {
                        conn.send(Command::Ok, &[]).await?;
                    } else {
                        conn.send(Command::Err, b"unknown job").await?;
                    }
                }

                Command::GetJoblist | Command::Jstat => {
                    let w = {
                        let jobs = self.jobs.lock().expect("job table poisoned");
                        let mut w = Writer::new();
                        w.put_u64(jobs.len() as u64);
                        for (id, job) in jobs.iter() {
                            w.put_u64(*id);
                            w.put_u8(job.step().bits());
                        }
                        w
                    };
                    conn.send(Command::Ok, &w.into_inner()).await?;
                }

                Command::Pstat => {
                    let mut r = conn.reader(&frame);
                    let job_id = r.get_u64()?;
                    match self.job(job_id) {
                        Some(job) => {
                            let steps = job.part_steps();
                            let mut w = Writer::new();
                            w.put_u64(steps.len() as u64);
                            for (id, step) in steps {
                                w.put_u64(id);
                                w.put_u8(step.bits());
                            }
                            conn.send(Command::Ok, &w.into_inner()).await?;
                        }
                        None => conn.send(Command::Err, b"unknown job").await?,
                    }
                }

                Command::Stat => {
                    let w = {
                        let workers = self.workers.lock().expect("worker table poisoned");
                        let mut w = Writer::new();
                        w.put_u64(workers.len() as u64);
                        for slot in workers.values() {
                            slot.info.pack(&mut w);
                        }
                        w
                    };
                    conn.send(Command::Ok, &w.into_inner()).await?;
                }

                Command::Reset => {
                    {
                        let mut jobs = self.jobs.lock().expect("job table poisoned");
                        jobs.retain(|_, job| {
                            !matches!(job.step(), Step::Completed | Step::Err)
                        });
                    }
                    conn.send(Command::Ok, &[]).await?;
                }

                Command::Die => {
                    conn.send(Command::Ok, &[]).await?;
                    // notify_one stores a permit, so the accept loop sees
                    // the shutdown even if it is mid-accept.
                    self.shutdown.notify_one();
                    return Ok(());
                }

                Command::Disconnect | Command::DelSlv => {
                    return Ok(());
                }

                Command::LogConnect => conn.send(Command::Ok, &[]).await?,

                Command::Auth => {
                    conn.send(Command::Err, b"authentication not available").await?
                }

                Command::ModJob | Command::SlvIo | Command::SlvRes => {
                    conn.send(Command::Err, b"not supported").await?
                }

                other => {
                    warn!(conn = conn_id, ?other, "unexpected command, closing");
                    conn.send(Command::Err, b"unexpected command").await?;
                    return Err(ProtocolError::UnexpectedCommand(other));
                }
            }
        }
    }
}

/// Assemble and write the containers of a job in POSTPROCESS, then mark its
/// parts completed.
fn postprocess_job(job: &Arc<MomfbdJob>, out_dir: &std::path::Path) -> Result<(), MomfbdError> {
    let patches = job.completed_patches();
    let include_modes = job
        .cfg
        .objects
        .iter()
        .any(|o| o.cfg.save_flags.contains(SaveFlags::MODES));
    for (oi, object) in job.objects.iter().enumerate() {
        let container = Container::assemble(
            object,
            oi,
            &patches,
            concat!("momfbd ", env!("CARGO_PKG_VERSION")),
            &job.cfg.global.date_obs,
            &job.cfg.global.time_obs,
            include_modes,
        );
        let name = object
            .cfg
            .derive_output_file(&object.channels[0].cfg)
            .unwrap_or_else(|| format!("object_{oi}"));
        let path = out_dir.join(format!("{name}.momfbd"));
        if path.exists() && !job.cfg.global.run_flags.contains(shared::RunFlags::OVERWRITE) {
            return Err(MomfbdError::Io(format!(
                "{} exists and OVERWRITE is not set",
                path.display()
            )));
        }
        std::fs::create_dir_all(out_dir)
            .and_then(|_| std::fs::write(&path, container.write()))
            .map_err(|e| MomfbdError::Io(format!("writing {}: {e}", path.display())))?;
        info!(job = job.id, path = %path.display(), "container written");
    }
    for (part_id, _) in job.part_steps() {
        job.part_written(part_id);
    }
    Ok(())
}
