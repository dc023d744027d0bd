//! Full-pipeline test: submit → preprocess → solve every patch through a
//! worker-style context → collect results → assemble the output container.

use momfbd::{
    ChannelInput, Container, FrameSource, JobContext, MomfbdError, MomfbdJob, Step,
};
use ndarray::Array3;
use shared::{
    ChannelCfg, GlobalCfg, JobCfg, ObjectCfg, ObjectSetup, Record, RunFlags, SaveFlags,
};

struct GradientScene;

impl FrameSource for GradientScene {
    fn channel_input(&mut self, _o: usize, _c: usize) -> Result<ChannelInput, MomfbdError> {
        let frames = Array3::from_shape_fn((2, 96, 96), |(f, y, x)| {
            800.0 + ((f * 11 + y * 5 + x * 2) % 19) as f32 + 0.05 * y as f32
        });
        Ok(ChannelInput {
            frames,
            ..Default::default()
        })
    }
}

fn pipeline_cfg() -> JobCfg {
    let channel = ChannelCfg {
        arcsec_per_pixel: 0.03,
        pixel_size: 16e-6,
        weight: 1.0,
        max_local_shift: 2,
        image_numbers: vec![7, 8],
        wavefront_indices: vec![7, 8],
        image_template: "camXXV.%07d".into(),
        ..Default::default()
    };
    let object = ObjectCfg {
        patch_size: 32,
        pupil_pixels: 16,
        wavelength: 630e-9,
        save_flags: SaveFlags::ALPHA | SaveFlags::PSF_AVG,
        ..Default::default()
    };
    JobCfg {
        global: GlobalCfg {
            telescope_d: 1.0,
            mode_numbers: vec![2, 3, 4],
            mode_start: 3,
            minimum_overlap: 4,
            min_iterations: 1,
            max_iterations: 4,
            ftol: 1e-4,
            run_flags: RunFlags::FIT_PLANE,
            date_obs: "2024-05-11".into(),
            time_obs: "09:15:31".into(),
            ..Default::default()
        },
        objects: vec![ObjectSetup {
            cfg: object,
            channels: vec![channel],
        }],
    }
}

#[test]
fn job_flows_from_submit_to_container() {
    let mut job = MomfbdJob::new(1, pipeline_cfg());
    assert_eq!(job.step(), Step::None);
    job.submit().unwrap();
    assert_eq!(job.step(), Step::Submit);

    let mut source = GradientScene;
    job.preprocess(&mut source).unwrap();
    assert_eq!(job.step(), Step::Queued);
    let n_parts = job.part_steps().len();
    assert!(n_parts > 0);

    // A worker-style context solves every part.
    let mut context = JobContext::build(job.cfg.clone()).unwrap();
    let mut solved = 0;
    while let Some(mut part) = job.get_work(true) {
        context.process_patch(&mut part, None).unwrap();
        assert_eq!(part.step, Step::Postprocess);
        job.return_results(part.results_only()).unwrap();
        solved += 1;
    }
    assert_eq!(solved, n_parts);
    assert_eq!(job.step(), Step::Postprocess);

    // Local write-out completes the job.
    let patches = job.completed_patches();
    assert_eq!(patches.len(), n_parts);
    let container = Container::assemble(
        &job.objects[0],
        0,
        &patches,
        "momfbd test",
        &job.cfg.global.date_obs,
        &job.cfg.global.time_obs,
        false,
    );
    assert_eq!(container.patches.len(), n_parts);
    // Every patch produced a restored image and the requested products.
    for patch in &container.patches {
        assert_eq!(patch.result.img.dim(), (32, 32));
        let psf = patch.result.psf.as_ref().expect("PSF_AVG requested");
        assert_eq!(psf.dim().0, 1);
        assert!(patch.result.alpha.is_some());
    }
    let bytes = container.write();
    let parsed = Container::read(&bytes).unwrap();
    assert_eq!(parsed, container);

    for (id, _) in job.part_steps() {
        job.part_written(id);
    }
    assert_eq!(job.step(), Step::Completed);
}

#[test]
fn patch_survives_wire_roundtrip_mid_pipeline() {
    let mut job = MomfbdJob::new(2, pipeline_cfg());
    job.submit().unwrap();
    job.preprocess(&mut GradientScene).unwrap();

    // Simulate the master → worker hop: pack the assignment, unpack it on
    // the other side, solve, and hop the result back.
    let part = job.get_work(true).unwrap();
    let assignment = momfbd::PatchData::from_bytes(&part.to_bytes(), false).unwrap();
    assert_eq!(assignment, part);

    let mut context = JobContext::build(job.cfg.clone()).unwrap();
    let mut solved = assignment;
    context.process_patch(&mut solved, None).unwrap();

    let result = solved.results_only();
    let returned = momfbd::PatchData::from_bytes(&result.to_bytes(), false).unwrap();
    job.return_results(returned).unwrap();

    let steps = job.part_steps();
    let this = steps.iter().find(|&&(id, _)| id == part.id).unwrap().1;
    assert_eq!(this, Step::Postprocess);
}
