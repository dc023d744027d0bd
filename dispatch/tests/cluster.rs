//! End-to-end master/worker tests over loopback sockets.

use dispatch::{Command, Connection, Master, Worker};
use momfbd::{ChannelInput, FrameSource, MomfbdError, PatchData, Step};
use ndarray::Array3;
use shared::{ChannelCfg, GlobalCfg, JobCfg, ObjectCfg, ObjectSetup, Record, SaveFlags, Writer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

struct SyntheticSource;

impl FrameSource for SyntheticSource {
    fn channel_input(&mut self, _o: usize, _c: usize) -> Result<ChannelInput, MomfbdError> {
        let frames = Array3::from_shape_fn((2, 96, 96), |(f, y, x)| {
            500.0 + ((f * 13 + y * 7 + x * 3) % 23) as f32
        });
        Ok(ChannelInput {
            frames,
            ..Default::default()
        })
    }
}

fn small_cfg() -> JobCfg {
    let channel = ChannelCfg {
        arcsec_per_pixel: 0.03,
        pixel_size: 16e-6,
        weight: 1.0,
        max_local_shift: 2,
        image_numbers: vec![1, 2],
        wavefront_indices: vec![1, 2],
        ..Default::default()
    };
    let object = ObjectCfg {
        patch_size: 32,
        pupil_pixels: 16,
        wavelength: 500e-9,
        save_flags: SaveFlags::ALPHA,
        output_file: "cluster_test".into(),
        ..Default::default()
    };
    JobCfg {
        global: GlobalCfg {
            telescope_d: 1.0,
            mode_numbers: vec![2, 3, 4],
            mode_start: 3,
            minimum_overlap: 4,
            min_iterations: 1,
            max_iterations: 5,
            ftol: 1e-4,
            object_defaults: object.clone(),
            ..Default::default()
        },
        objects: vec![ObjectSetup {
            cfg: object,
            channels: vec![channel],
        }],
    }
}

fn test_out_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("momfbd_{tag}_{}", std::process::id()))
}

async fn start_master(tag: &str) -> (Arc<Master>, std::net::SocketAddr, PathBuf) {
    let out_dir = test_out_dir(tag);
    let factory = |_cfg: &JobCfg| -> Result<Box<dyn FrameSource + Send>, MomfbdError> {
        Ok(Box::new(SyntheticSource))
    };
    let master = Master::new(Box::new(factory), out_dir.clone(), 2);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let master = Arc::clone(&master);
        tokio::spawn(async move {
            let _ = master.serve(listener).await;
        });
    }
    (master, addr, out_dir)
}

async fn wait_for_step(master: &Arc<Master>, job: u64, step: Step, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if master.job_step(job) == Some(step) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job never reached {step}, currently {:?}",
            master.job_step(job)
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_runs_end_to_end() {
    let (master, addr, out_dir) = start_master("e2e").await;
    let job = master.add_job(small_cfg()).await.unwrap();
    assert_eq!(master.job_step(job), Some(Step::Queued));

    let cancel = Arc::new(AtomicBool::new(false));
    let worker_task = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            let mut worker = Worker::new(addr.to_string(), 2, cancel);
            let _ = worker.run().await;
        })
    };

    wait_for_step(&master, job, Step::Completed, Duration::from_secs(120)).await;
    cancel.store(true, Ordering::Relaxed);
    worker_task.abort();

    // The container landed on disk.
    let container = out_dir.join("cluster_test.momfbd");
    let bytes = std::fs::read(&container).expect("container written");
    let parsed = momfbd::Container::read(&bytes).unwrap();
    assert!(!parsed.patches.is_empty());
    std::fs::remove_dir_all(&out_dir).ok();
}

/// A bare protocol client for failure-injection tests.
async fn raw_client(addr: std::net::SocketAddr) -> Connection {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut conn = Connection::new(stream);
    let info = dispatch::HostInfo::local(1);
    conn.handshake_worker(&info.to_bytes()).await.unwrap();
    conn
}

async fn fetch_part(conn: &mut Connection) -> Option<(u64, PatchData)> {
    conn.send(Command::GetWork, &[]).await.unwrap();
    let reply = conn.recv().await.unwrap();
    assert_eq!(reply.command, Command::Ok);
    if reply.payload.is_empty() {
        return None;
    }
    let mut r = conn.reader(&reply);
    let job_id = r.get_u64().unwrap();
    let part = PatchData::from_bytes(&reply.payload[8..], conn.swap).unwrap();
    Some((job_id, part))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_worker_part_reverts_to_queued() {
    let (master, addr, _out) = start_master("loss").await;
    let job = master.add_job(small_cfg()).await.unwrap();

    // First client takes a part and vanishes.
    let mut first = raw_client(addr).await;
    let (got_job, part) = fetch_part(&mut first).await.expect("work available");
    assert_eq!(got_job, job);
    drop(first);

    // The master notices the closed socket and re-queues the part.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let steps = master.job_part_steps(job).unwrap();
        let this = steps.iter().find(|&&(id, _)| id == part.id).unwrap().1;
        if this == Step::Queued {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "part stayed {this} after its worker died"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // A second client receives the very same part.
    let mut second = raw_client(addr).await;
    let (_, again) = fetch_part(&mut second).await.expect("work available");
    assert_eq!(again.id, part.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_put_parts_is_acknowledged_and_dropped() {
    let (master, addr, _out) = start_master("dup").await;
    let job = master.add_job(small_cfg()).await.unwrap();

    let mut conn_a = raw_client(addr).await;
    let mut conn_b = raw_client(addr).await;
    let (job_id, part) = fetch_part(&mut conn_a).await.expect("work available");

    let send_result = |metric: f64| {
        let mut result = part.results_only();
        result.step = Step::Postprocess;
        result.final_metric = metric;
        let mut w = Writer::new();
        w.put_u64(job_id);
        result.pack(&mut w);
        w.into_inner()
    };

    // Both clients report the same part; both are answered OK.
    conn_b
        .send(Command::PutParts, &send_result(1.0))
        .await
        .unwrap();
    assert_eq!(conn_b.recv().await.unwrap().command, Command::Ok);
    conn_a
        .send(Command::PutParts, &send_result(99.0))
        .await
        .unwrap();
    assert_eq!(conn_a.recv().await.unwrap().command, Command::Ok);

    // The first payload won.
    let steps = master.job_part_steps(job).unwrap();
    let this = steps.iter().find(|&&(id, _)| id == part.id).unwrap().1;
    assert!(matches!(this, Step::Postprocess | Step::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_job_is_rejected_over_the_wire() {
    let (_master, addr, _out) = start_master("badjob").await;
    let mut conn = raw_client(addr).await;
    let mut cfg = small_cfg();
    cfg.global.run_flags = shared::RunFlags::CALIBRATE | shared::RunFlags::FLATFIELD;
    conn.send_record(Command::AddJob, &cfg).await.unwrap();
    let reply = conn.recv().await.unwrap();
    assert_eq!(reply.command, Command::Err);
    let message = String::from_utf8_lossy(&reply.payload).into_owned();
    assert!(message.contains("mutually exclusive"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_commands_report_jobs_and_parts() {
    let (master, addr, _out) = start_master("stat").await;
    let job = master.add_job(small_cfg()).await.unwrap();
    let mut conn = raw_client(addr).await;

    conn.send(Command::Jstat, &[]).await.unwrap();
    let reply = conn.recv().await.unwrap();
    assert_eq!(reply.command, Command::Ok);
    let mut r = conn.reader(&reply);
    assert_eq!(r.get_u64().unwrap(), 1);
    assert_eq!(r.get_u64().unwrap(), job);
    assert_eq!(r.get_u8().unwrap(), Step::Queued.bits());

    let mut w = Writer::new();
    w.put_u64(job);
    conn.send(Command::Pstat, &w.into_inner()).await.unwrap();
    let reply = conn.recv().await.unwrap();
    assert_eq!(reply.command, Command::Ok);
    let mut r = conn.reader(&reply);
    let n = r.get_u64().unwrap();
    assert!(n > 0);
}
