//! The restoration job: validation, preprocessing, the part queue and the
//! step state machine.
//!
//! The job `step` is an atomic; multi-step transitions and every queue
//! operation (`get_work`, `unget_work`, `return_results`, `check_parts`)
//! hold the job mutex. Patches are independent once the constraints are
//! built, so no cross-patch ordering is promised.

use crate::channel::{Channel, ChannelInput};
use crate::constraints::Constraints;
use crate::data::PatchData;
use crate::error::MomfbdError;
use crate::object::Object;
use crate::patch;
use crate::solver::{SolveSummary, Solver};
use crate::step::Step;
use shared::{JobCfg, RunFlags};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Supplies raw frame stacks and calibration data; the file-format layer
/// behind this trait is outside the core.
pub trait FrameSource {
    /// Inputs for one channel of one object.
    fn channel_input(
        &mut self,
        object: usize,
        channel: usize,
    ) -> Result<ChannelInput, MomfbdError>;
}

struct JobInner {
    patches: Vec<PatchData>,
    messages: Vec<String>,
}

/// Master-side job: configuration, objects, constraints and the part queue.
pub struct MomfbdJob {
    /// Job id assigned at submission.
    pub id: u64,
    /// The full configuration record.
    pub cfg: JobCfg,
    /// Restoration objects, built during preprocess.
    pub objects: Vec<Object>,
    /// The constraint system, built during preprocess.
    pub constraints: Option<Constraints>,
    /// Clipped image geometry shared by every object.
    pub image_size: (u16, u16),
    step: AtomicU8,
    inner: Mutex<JobInner>,
}

impl MomfbdJob {
    /// Accept a job. The configuration is validated on `submit`.
    pub fn new(id: u64, cfg: JobCfg) -> Self {
        Self {
            id,
            cfg,
            objects: Vec::new(),
            constraints: None,
            image_size: (0, 0),
            step: AtomicU8::new(Step::None.bits()),
            inner: Mutex::new(JobInner {
                patches: Vec::new(),
                messages: Vec::new(),
            }),
        }
    }

    /// Current job step.
    pub fn step(&self) -> Step {
        Step::from_bits(self.step.load(Ordering::SeqCst)).unwrap_or(Step::Err)
    }

    fn set_step(&self, step: Step) {
        self.step.store(step.bits(), Ordering::SeqCst);
    }

    /// Failure messages accumulated so far.
    pub fn messages(&self) -> Vec<String> {
        self.inner.lock().expect("job queue poisoned").messages.clone()
    }

    fn fail(&self, messages: Vec<String>) -> MomfbdError {
        error!(job = self.id, ?messages, "job failed");
        self.set_step(Step::Err);
        let mut inner = self.inner.lock().expect("job queue poisoned");
        inner.messages.extend(messages.iter().cloned());
        MomfbdError::Config(messages)
    }

    /// Record a non-config failure and move the job to ERR.
    fn fail_with(&self, e: MomfbdError) -> MomfbdError {
        error!(job = self.id, error = %e, "job failed");
        self.set_step(Step::Err);
        let mut inner = self.inner.lock().expect("job queue poisoned");
        inner.messages.push(e.to_string());
        e
    }

    /// Validate the configuration; NONE → SUBMIT.
    ///
    /// All failure causes are reported together and the job goes to ERR
    /// before any data is touched.
    pub fn submit(&mut self) -> Result<(), MomfbdError> {
        let mut problems = self.cfg.validate();
        // Image-scale reconciliation needs the per-channel plate scales.
        for (oi, obj) in self.cfg.objects.iter_mut().enumerate() {
            for (ci, ch) in obj.channels.iter_mut().enumerate() {
                let mut telescope_f = self.cfg.global.telescope_f;
                match shared::GlobalCfg::check_image_scale(
                    &mut telescope_f,
                    &mut ch.arcsec_per_pixel,
                    &mut ch.pixel_size,
                ) {
                    Ok(Some(message)) => warn!(job = self.id, "{message}"),
                    Ok(None) => {}
                    Err(message) => {
                        problems.push(format!("object {oi} channel {ci}: {message}"))
                    }
                }
                self.cfg.global.telescope_f = telescope_f;
            }
        }
        if !problems.is_empty() {
            return Err(self.fail(problems));
        }
        self.set_step(Step::Submit);
        Ok(())
    }

    /// SUBMIT → PREPROCESS → QUEUED: load and calibrate every channel, build
    /// objects, constraints and the patch queue.
    pub fn preprocess(&mut self, source: &mut dyn FrameSource) -> Result<(), MomfbdError> {
        if self.step() != Step::Submit {
            return Err(MomfbdError::config(format!(
                "preprocess called in step {}",
                self.step()
            )));
        }
        self.set_step(Step::Preprocess);

        let mode_numbers = full_mode_list(&self.cfg);
        let mut image_size: Option<(u16, u16)> = None;
        let mut objects = Vec::new();
        for (oi, obj_setup) in self.cfg.objects.iter().enumerate() {
            let mut channels = Vec::new();
            for (ci, ch_cfg) in obj_setup.channels.iter().enumerate() {
                let input = source
                    .channel_input(oi, ci)
                    .map_err(|e| self.fail_with(e))?;
                let channel = Channel::preprocess(
                    ch_cfg.clone(),
                    input,
                    self.cfg.global.run_flags,
                    self.cfg.global.badpixel_threshold,
                )
                .map_err(|e| self.fail_with(e))?;
                let (rows, cols) = channel.frame_size();
                let this = (rows as u16, cols as u16);
                match image_size {
                    None => image_size = Some(this),
                    Some(expected) if expected != this => {
                        return Err(self.fail(vec![format!(
                            "clipped images have different sizes: object {oi} channel {ci} \
                             is {this:?}, expected {expected:?}; verify the ALIGN_CLIP values"
                        )]));
                    }
                    Some(_) => {}
                }
                channels.push(channel);
            }
            let object = Object::init_processing(
                obj_setup.cfg.clone(),
                channels,
                &self.cfg.global,
                &mode_numbers,
            )
            .map_err(|e| self.fail(vec![e.to_string()]))?;
            objects.push(object);
        }
        let image_size = image_size.ok_or_else(|| self.fail(vec!["job has no channels".into()]))?;

        let constraints =
            build_constraints(&self.cfg, &objects).map_err(|e| self.fail(vec![e.to_string()]))?;
        if let Some(previous) = &self.constraints {
            previous
                .verify_rebuild(&constraints)
                .map_err(|e| self.fail_with(e))?;
        }

        let mut patches = patch::split_patches(&self.cfg.global, image_size.0, image_size.1)
            .map_err(|e| self.fail(vec![e.to_string()]))?;
        for p in &mut patches {
            patch::materialize(p, &objects)?;
        }
        info!(
            job = self.id,
            n_patches = patches.len(),
            n_parameters = constraints.n_parameters,
            n_free = constraints.n_free_parameters,
            "preprocess finished"
        );

        self.objects = objects;
        self.constraints = Some(constraints);
        self.image_size = image_size;
        {
            let mut inner = self.inner.lock().expect("job queue poisoned");
            inner.patches = patches;
        }
        self.set_step(Step::Queued);
        Ok(())
    }

    /// Hand out at most one part.
    ///
    /// A local (master-side) caller gets POSTPROCESS parts for write-out; a
    /// remote worker gets a QUEUED part, which turns RUNNING.
    pub fn get_work(&self, remote: bool) -> Option<PatchData> {
        let mut inner = self.inner.lock().expect("job queue poisoned");
        if self.step() == Step::Queued {
            self.set_step(Step::Running);
        }
        if !remote {
            if let Some(p) = inner
                .patches
                .iter()
                .find(|p| p.step == Step::Postprocess)
            {
                return Some(p.clone());
            }
            return None;
        }
        let patch = inner.patches.iter_mut().find(|p| p.step == Step::Queued)?;
        patch.step = Step::Running;
        debug!(job = self.id, patch = patch.id, "part handed out");
        Some(patch.clone())
    }

    /// Re-queue parts whose worker disappeared.
    pub fn unget_work(&self, part_ids: &[u64]) {
        let mut inner = self.inner.lock().expect("job queue poisoned");
        for p in inner.patches.iter_mut() {
            if part_ids.contains(&p.id) && p.step == Step::Running {
                p.step = Step::Queued;
                debug!(job = self.id, patch = p.id, "part re-queued");
            }
        }
        drop(inner);
        self.check_parts();
    }

    /// Copy a worker's result back into the queue.
    ///
    /// A duplicate result for a part that already moved past RUNNING is
    /// answered OK and dropped; the first payload wins.
    pub fn return_results(&self, result: PatchData) -> Result<(), MomfbdError> {
        {
            let mut inner = self.inner.lock().expect("job queue poisoned");
            let Some(existing) = inner.patches.iter_mut().find(|p| p.id == result.id) else {
                return Err(MomfbdError::Numeric(format!(
                    "results for unknown part {}",
                    result.id
                )));
            };
            match existing.step {
                Step::Postprocess | Step::Completed => {
                    debug!(
                        job = self.id,
                        patch = result.id,
                        "duplicate result dropped"
                    );
                    return Ok(());
                }
                _ => {}
            }
            match result.step {
                Step::Err => {
                    if existing.n_retries < self.cfg.global.max_patch_retries {
                        existing.n_retries += 1;
                        existing.step = Step::Queued;
                        warn!(
                            job = self.id,
                            patch = existing.id,
                            retry = existing.n_retries,
                            "part failed, re-queued"
                        );
                    } else {
                        existing.step = Step::Err;
                        warn!(
                            job = self.id,
                            patch = existing.id,
                            "part failed permanently"
                        );
                    }
                }
                _ => {
                    existing.results = result.results;
                    existing.final_metric = result.final_metric;
                    existing.step = Step::Postprocess;
                }
            }
        }
        self.check_parts();
        Ok(())
    }

    /// Mark a part written out: POSTPROCESS → COMPLETED.
    pub fn part_written(&self, part_id: u64) {
        {
            let mut inner = self.inner.lock().expect("job queue poisoned");
            if let Some(p) = inner.patches.iter_mut().find(|p| p.id == part_id) {
                if p.step == Step::Postprocess {
                    p.step = Step::Completed;
                }
            }
        }
        self.check_parts();
    }

    /// OR-reduce the part steps; promote the job when all parts agree.
    pub fn check_parts(&self) {
        let inner = self.inner.lock().expect("job queue poisoned");
        let mask = Step::reduce(inner.patches.iter().map(|p| p.step));
        drop(inner);
        match Step::unanimous(mask) {
            Some(Step::Postprocess) => self.set_step(Step::Postprocess),
            Some(Step::Completed) => {
                if self.step() != Step::Completed {
                    info!(job = self.id, "all parts completed");
                }
                self.set_step(Step::Completed);
            }
            Some(Step::Err) => self.set_step(Step::Err),
            _ => {
                // Mixed sets containing only terminal steps mean the job is
                // done but some parts failed for good.
                let terminal = Step::Completed.bits() | Step::Err.bits();
                if mask != 0 && mask & !terminal == 0 {
                    warn!(job = self.id, "job completed with failed parts");
                    self.set_step(Step::Err);
                }
            }
        }
    }

    /// Steps of all parts, for status reporting.
    pub fn part_steps(&self) -> Vec<(u64, Step)> {
        let inner = self.inner.lock().expect("job queue poisoned");
        inner.patches.iter().map(|p| (p.id, p.step)).collect()
    }

    /// Completed patches, cloned for output assembly.
    pub fn completed_patches(&self) -> Vec<PatchData> {
        let inner = self.inner.lock().expect("job queue poisoned");
        inner
            .patches
            .iter()
            .filter(|p| matches!(p.step, Step::Postprocess | Step::Completed))
            .cloned()
            .collect()
    }
}

/// The complete mode list after the progression schedule is honored.
pub fn full_mode_list(cfg: &JobCfg) -> Vec<u16> {
    let explicit = &cfg.global.mode_numbers;
    if !explicit.is_empty() {
        return explicit.clone();
    }
    // No explicit list: enough Noll modes to cover one progression round
    // past MODE_START.
    let count = (cfg.global.mode_start + cfg.global.mode_step).max(cfg.global.mode_start);
    (2..2 + count).collect()
}

/// Build the constraint system for every image of every object.
pub fn build_constraints(cfg: &JobCfg, objects: &[Object]) -> Result<Constraints, MomfbdError> {
    let n_modes = objects
        .first()
        .map(|o| o.modes.len())
        .ok_or_else(|| MomfbdError::config("job without objects"))?;

    let mut wavefront_ids = Vec::new();
    for object in objects {
        for channel in &object.channels {
            let n = channel.n_frames();
            for f in 0..n {
                let id = channel
                    .cfg
                    .wavefront_indices
                    .get(f)
                    .copied()
                    .or_else(|| channel.cfg.image_numbers.get(f).copied())
                    .unwrap_or(f as u32);
                wavefront_ids.push(id);
            }
        }
    }
    let n_images = wavefront_ids.len();

    if cfg.global.run_flags.contains(RunFlags::NO_CONSTRAINTS) {
        return Constraints::unconstrained((n_images * n_modes) as u32);
    }
    if cfg.global.run_flags.contains(RunFlags::CALIBRATE) {
        let free_modes: Vec<usize> = objects
            .first()
            .map(|o| {
                [o.modes.x_tilt_index, o.modes.y_tilt_index]
                    .into_iter()
                    .flatten()
                    .collect()
            })
            .unwrap_or_default();
        return Constraints::tie_to_zero(n_modes, n_images, &free_modes);
    }
    Constraints::frame_pairs(n_modes, &wavefront_ids)
}

/// Worker-side job context: objects rebuilt from the configuration alone.
pub struct JobContext {
    /// The job configuration received over the wire.
    pub cfg: JobCfg,
    /// Objects with stub channels (no frame stacks).
    pub objects: Vec<Object>,
    /// The constraint system, rebuilt locally.
    pub constraints: Constraints,
}

impl JobContext {
    /// Rebuild the processing context from a received configuration.
    pub fn build(cfg: JobCfg) -> Result<Self, MomfbdError> {
        let mode_numbers = full_mode_list(&cfg);
        let mut objects = Vec::new();
        for obj_setup in &cfg.objects {
            let channels = obj_setup
                .channels
                .iter()
                .map(|c| Channel::stub(c.clone()))
                .collect();
            objects.push(Object::init_processing(
                obj_setup.cfg.clone(),
                channels,
                &cfg.global,
                &mode_numbers,
            )?);
        }
        let constraints = build_constraints(&cfg, &objects)?;
        Ok(Self {
            cfg,
            objects,
            constraints,
        })
    }

    /// Solve one patch in place: plane fit, optimize, collect results.
    ///
    /// On success the patch moves to POSTPROCESS; numeric failures mark it
    /// ERR; cancellation leaves it untouched.
    pub fn process_patch(
        &mut self,
        patch: &mut PatchData,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<SolveSummary, MomfbdError> {
        let max_local_shift = self
            .cfg
            .global
            .object_defaults
            .channel_defaults
            .max_local_shift as usize;
        for (oi, object) in self.objects.iter_mut().enumerate() {
            if let Some(obj_patch) = patch.objects.get_mut(oi) {
                object.fit_avg_plane(obj_patch, self.cfg.global.run_flags, max_local_shift);
            }
        }
        let mut solver = Solver::new(
            &self.cfg.global,
            &self.objects,
            &self.constraints,
            patch,
            cancel,
        )?;
        match solver.run(patch) {
            Ok(summary) => {
                patch.step = Step::Postprocess;
                Ok(summary)
            }
            Err(MomfbdError::Cancelled) => Err(MomfbdError::Cancelled),
            Err(e) => {
                patch.step = Step::Err;
                Err(e)
            }
        }
    }
}
