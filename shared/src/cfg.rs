//! Configuration records consumed by the restoration core.
//!
//! The key/value tree parser lives outside the core; what arrives here is a
//! fully-populated record per level. The old config-class hierarchy
//! (Channel ⊂ Object ⊂ Global) is flattened: each level is a plain struct and
//! inheritance is the explicit [`ChannelCfg::or_defaults`] /
//! [`ObjectCfg::or_defaults`] step applied once, at build time.

use crate::wire::{seq_size, str_size, Reader, Record, WireError, Writer};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Wavefront mode basis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeBasis {
    /// Zernike polynomials with Noll ordering.
    #[default]
    Zernike,
    /// Karhunen-Loève modes built from the Kolmogorov covariance.
    KarhunenLoeve,
}

impl ModeBasis {
    fn from_tag(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Zernike),
            1 => Ok(Self::KarhunenLoeve),
            _ => Err(WireError::BadTag {
                value: v as u64,
                type_name: "ModeBasis",
            }),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Zernike => 0,
            Self::KarhunenLoeve => 1,
        }
    }
}

/// Bad-pixel fill strategy (FPMETHOD).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillPixMethod {
    /// 3x3 median of valid neighbours.
    #[default]
    Median,
    /// Inverse-distance weighting over the surrounding valid pixels.
    InvDistWeight,
    /// Horizontal interpolation between the nearest valid pixels on the row.
    HorizontalInterpolation,
}

impl FillPixMethod {
    fn from_tag(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Median),
            1 => Ok(Self::InvDistWeight),
            2 => Ok(Self::HorizontalInterpolation),
            _ => Err(WireError::BadTag {
                value: v as u64,
                type_name: "FillPixMethod",
            }),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Median => 0,
            Self::InvDistWeight => 1,
            Self::HorizontalInterpolation => 2,
        }
    }
}

/// Gradient evaluation method (GRADIENT).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradientMethod {
    /// Finite differences on α, step = EPS · max(1, |αₖ|).
    Difference,
    /// Closed-form Fourier-domain gradient (Vogel).
    #[default]
    Vogel,
}

impl GradientMethod {
    fn from_tag(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Difference),
            1 => Ok(Self::Vogel),
            _ => Err(WireError::BadTag {
                value: v as u64,
                type_name: "GradientMethod",
            }),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Difference => 0,
            Self::Vogel => 1,
        }
    }
}

/// Line-search / step strategy (GETSTEP).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepMethod {
    /// Steepest descent with Armijo backtracking.
    SteepestDescent,
    /// Polak-Ribière conjugate gradient.
    #[default]
    ConjugateGradient,
    /// Dense BFGS Hessian update.
    Bfgs,
    /// Dense inverse-BFGS update.
    BfgsInverse,
}

impl StepMethod {
    fn from_tag(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::SteepestDescent),
            1 => Ok(Self::ConjugateGradient),
            2 => Ok(Self::Bfgs),
            3 => Ok(Self::BfgsInverse),
            _ => Err(WireError::BadTag {
                value: v as u64,
                type_name: "StepMethod",
            }),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::SteepestDescent => 0,
            Self::ConjugateGradient => 1,
            Self::Bfgs => 2,
            Self::BfgsInverse => 3,
        }
    }
}

/// Sample type of the output images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputDataType {
    /// IEEE-754 binary32 samples.
    #[default]
    Float32,
    /// Signed 16-bit samples.
    Int16,
}

impl OutputDataType {
    fn from_tag(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Float32),
            1 => Ok(Self::Int16),
            _ => Err(WireError::BadTag {
                value: v as u64,
                type_name: "OutputDataType",
            }),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Float32 => 0,
            Self::Int16 => 1,
        }
    }
}

bitflags! {
    /// Job-level run flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RunFlags: u32 {
        /// Calibration run: constraints tie each mode to zero.
        const CALIBRATE = 1 << 0;
        /// Fit and subtract an average plane before solving.
        const FIT_PLANE = 1 << 1;
        /// Apply dark/gain flat-fielding during preprocess.
        const FLATFIELD = 1 << 2;
        /// Use one noise estimate for all images of an object.
        const GLOBAL_NOISE = 1 << 3;
        /// Build the frame-pair constraint system.
        const NEW_CONSTRAINTS = 1 << 4;
        /// Skip ALIGN_CLIP trimming.
        const NO_CLIP = 1 << 5;
        /// Run without any constraint coupling.
        const NO_CONSTRAINTS = 1 << 6;
        /// Skip the noise filter on the restored object.
        const NO_FILTER = 1 << 7;
        /// Overwrite existing output files.
        const OVERWRITE = 1 << 8;
        /// Byte-swap stored calibration data.
        const SWAP = 1 << 9;
    }
}

bitflags! {
    /// Per-object output selection.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SaveFlags: u32 {
        /// Store the fitted mode coefficients.
        const ALPHA = 1 << 0;
        /// Store per-frame convolved objects.
        const COBJ = 1 << 1;
        /// Store per-channel diversity phases.
        const DIVERSITY = 1 << 2;
        /// Store the mode basis used.
        const MODES = 1 << 3;
        /// Store per-frame PSFs.
        const PSF = 1 << 4;
        /// Store the frame-averaged PSF only.
        const PSF_AVG = 1 << 5;
        /// Store per-frame residuals.
        const RESIDUAL = 1 << 6;
        /// Store the flat-fielded input data.
        const FFDATA = 1 << 7;
    }
}

/// Per-detector configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelCfg {
    /// Plate scale in arc-seconds per pixel.
    pub arcsec_per_pixel: f64,
    /// Detector pixel pitch in meters.
    pub pixel_size: f64,
    /// Rotation of this detector w.r.t. the reference channel, radians.
    pub rotation_angle: f64,
    /// Pixels trimmed from every edge before processing.
    pub border_clip: u16,
    /// Largest per-patch alignment shift, pixels.
    pub max_local_shift: u16,
    /// Template for the input frame paths.
    pub image_template: String,
    /// Template for the dark frame paths; empty when no dark correction.
    pub dark_template: String,
    /// Gain table path; empty when no gain correction.
    pub gain_file: String,
    /// Detector response correction path.
    pub response_file: String,
    /// Back-scatter gain path (descatter pair with `psf_file`).
    pub back_gain_file: String,
    /// Back-scatter PSF path.
    pub psf_file: String,
    /// Polarimetric modulation matrix path.
    pub modulation_file: String,
    /// Integer x-offset map path.
    pub x_offset_file: String,
    /// Integer y-offset map path.
    pub y_offset_file: String,
    /// Frame numbers substituted into `image_template`.
    pub image_numbers: Vec<u32>,
    /// Frame numbers substituted into `dark_template`.
    pub dark_numbers: Vec<u32>,
    /// Wavefront identity per frame; frames sharing a value share a wavefront.
    pub wavefront_indices: Vec<u32>,
    /// Relative weight of this channel in the metric.
    pub weight: f64,
    /// Fixed phase-diversity coefficients, one per mode.
    pub diversity: Vec<f64>,
    /// ALIGN_CLIP rectangle (x1, x2, y1, y2); reversed endpoints flip that axis.
    pub align_clip: Vec<i32>,
    /// Bad-pixel fill strategy.
    pub fillpix_method: FillPixMethod,
}

impl ChannelCfg {
    /// Fill unset fields from the object-level defaults.
    pub fn or_defaults(mut self, parent: &ChannelCfg) -> Self {
        if self.arcsec_per_pixel == 0.0 {
            self.arcsec_per_pixel = parent.arcsec_per_pixel;
        }
        if self.pixel_size == 0.0 {
            self.pixel_size = parent.pixel_size;
        }
        if self.rotation_angle == 0.0 {
            self.rotation_angle = parent.rotation_angle;
        }
        if self.border_clip == 0 {
            self.border_clip = parent.border_clip;
        }
        if self.max_local_shift == 0 {
            self.max_local_shift = parent.max_local_shift;
        }
        if self.image_template.is_empty() {
            self.image_template = parent.image_template.clone();
        }
        if self.dark_template.is_empty() {
            self.dark_template = parent.dark_template.clone();
        }
        if self.gain_file.is_empty() {
            self.gain_file = parent.gain_file.clone();
        }
        if self.response_file.is_empty() {
            self.response_file = parent.response_file.clone();
        }
        if self.image_numbers.is_empty() {
            self.image_numbers = parent.image_numbers.clone();
        }
        if self.dark_numbers.is_empty() {
            self.dark_numbers = parent.dark_numbers.clone();
        }
        if self.wavefront_indices.is_empty() {
            self.wavefront_indices = parent.wavefront_indices.clone();
        }
        if self.weight == 0.0 {
            self.weight = parent.weight;
        }
        if self.diversity.is_empty() {
            self.diversity = parent.diversity.clone();
        }
        self
    }

    /// Validation messages for this channel; empty when the channel is sound.
    pub fn validate(&self, label: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if self.image_numbers.is_empty() {
            problems.push(format!("{label}: no image numbers specified"));
        }
        if !self.dark_template.is_empty() && self.dark_numbers.is_empty() {
            problems.push(format!(
                "{label}: dark template specified but no dark numbers"
            ));
        }
        if self.dark_template.is_empty() && !self.dark_numbers.is_empty() {
            problems.push(format!(
                "{label}: dark numbers specified but no dark template"
            ));
        }
        if !self.gain_file.is_empty() && self.dark_template.is_empty() {
            problems.push(format!("{label}: gain file given without a dark field"));
        }
        if !self.response_file.is_empty() && self.gain_file.is_empty() {
            problems.push(format!(
                "{label}: response correction requires a gain file"
            ));
        }
        if self.back_gain_file.is_empty() != self.psf_file.is_empty() {
            problems.push(format!(
                "{label}: descatter needs both a back-gain and a psf file"
            ));
        }
        if !self.align_clip.is_empty() && self.align_clip.len() != 4 {
            problems.push(format!(
                "{label}: ALIGN_CLIP must hold exactly 4 values, got {}",
                self.align_clip.len()
            ));
        }
        if !self.wavefront_indices.is_empty()
            && self.wavefront_indices.len() != self.image_numbers.len()
        {
            problems.push(format!(
                "{label}: {} wavefront indices for {} images",
                self.wavefront_indices.len(),
                self.image_numbers.len()
            ));
        }
        problems
    }
}

impl Record for ChannelCfg {
    fn wire_size(&self) -> u64 {
        // arcsec, pixel size, rotation, weight.
        8 * 4
            + 2 * 2
            + str_size(&self.image_template)
            + str_size(&self.dark_template)
            + str_size(&self.gain_file)
            + str_size(&self.response_file)
            + str_size(&self.back_gain_file)
            + str_size(&self.psf_file)
            + str_size(&self.modulation_file)
            + str_size(&self.x_offset_file)
            + str_size(&self.y_offset_file)
            + seq_size(self.image_numbers.len(), 4)
            + seq_size(self.dark_numbers.len(), 4)
            + seq_size(self.wavefront_indices.len(), 4)
            + seq_size(self.diversity.len(), 8)
            + seq_size(self.align_clip.len(), 4)
            + 1
    }

    fn pack(&self, w: &mut Writer) {
        w.put_f64(self.arcsec_per_pixel);
        w.put_f64(self.pixel_size);
        w.put_f64(self.rotation_angle);
        w.put_u16(self.border_clip);
        w.put_u16(self.max_local_shift);
        w.put_str(&self.image_template);
        w.put_str(&self.dark_template);
        w.put_str(&self.gain_file);
        w.put_str(&self.response_file);
        w.put_str(&self.back_gain_file);
        w.put_str(&self.psf_file);
        w.put_str(&self.modulation_file);
        w.put_str(&self.x_offset_file);
        w.put_str(&self.y_offset_file);
        w.put_u32_seq(&self.image_numbers);
        w.put_u32_seq(&self.dark_numbers);
        w.put_u32_seq(&self.wavefront_indices);
        w.put_f64(self.weight);
        w.put_f64_seq(&self.diversity);
        w.put_u64(self.align_clip.len() as u64);
        for &v in &self.align_clip {
            w.put_i32(v);
        }
        w.put_u8(self.fillpix_method.tag());
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let arcsec_per_pixel = r.get_f64()?;
        let pixel_size = r.get_f64()?;
        let rotation_angle = r.get_f64()?;
        let border_clip = r.get_u16()?;
        let max_local_shift = r.get_u16()?;
        let image_template = r.get_str()?;
        let dark_template = r.get_str()?;
        let gain_file = r.get_str()?;
        let response_file = r.get_str()?;
        let back_gain_file = r.get_str()?;
        let psf_file = r.get_str()?;
        let modulation_file = r.get_str()?;
        let x_offset_file = r.get_str()?;
        let y_offset_file = r.get_str()?;
        let image_numbers = r.get_u32_seq()?;
        let dark_numbers = r.get_u32_seq()?;
        let wavefront_indices = r.get_u32_seq()?;
        let weight = r.get_f64()?;
        let diversity = r.get_f64_seq()?;
        let n_clip = r.get_u64()? as usize;
        let mut align_clip = Vec::with_capacity(n_clip.min(4));
        for _ in 0..n_clip {
            align_clip.push(r.get_i32()?);
        }
        let fillpix_method = FillPixMethod::from_tag(r.get_u8()?)?;
        Ok(Self {
            arcsec_per_pixel,
            pixel_size,
            rotation_angle,
            border_clip,
            max_local_shift,
            image_template,
            dark_template,
            gain_file,
            response_file,
            back_gain_file,
            psf_file,
            modulation_file,
            x_offset_file,
            y_offset_file,
            image_numbers,
            dark_numbers,
            wavefront_indices,
            weight,
            diversity,
            align_clip,
            fillpix_method,
        })
    }
}

/// Per-object configuration. One object groups the channels observing the
/// same target at one wavelength.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectCfg {
    /// Patch side in pixels (NUM_POINTS).
    pub patch_size: u16,
    /// Pupil grid side in pixels (PUPIL_POINTS).
    pub pupil_pixels: u16,
    /// Observation wavelength in meters.
    pub wavelength: f64,
    /// Output file name; derived from the image template when empty.
    pub output_file: String,
    /// Pupil file; a soft-edged disk is generated when empty.
    pub pupil_file: String,
    /// Output products to keep for this object.
    pub save_flags: SaveFlags,
    /// Defaults handed down to every channel of this object.
    pub channel_defaults: ChannelCfg,
}

impl ObjectCfg {
    /// Fill unset fields from the global defaults.
    pub fn or_defaults(mut self, parent: &ObjectCfg) -> Self {
        if self.patch_size == 0 {
            self.patch_size = parent.patch_size;
        }
        if self.pupil_pixels == 0 {
            self.pupil_pixels = parent.pupil_pixels;
        }
        if self.wavelength == 0.0 {
            self.wavelength = parent.wavelength;
        }
        if self.pupil_file.is_empty() {
            self.pupil_file = parent.pupil_file.clone();
        }
        if self.save_flags.is_empty() {
            self.save_flags = parent.save_flags;
        }
        self.channel_defaults = self
            .channel_defaults
            .or_defaults(&parent.channel_defaults);
        self
    }

    /// Derive the output file name from the first channel's template and its
    /// first/last image numbers, as `prefix.<first>..<last>`.
    pub fn derive_output_file(&self, first_channel: &ChannelCfg) -> Option<String> {
        if !self.output_file.is_empty() {
            return Some(self.output_file.clone());
        }
        let template = &first_channel.image_template;
        let pos = template.find('%')?;
        let first = first_channel.image_numbers.first()?;
        let last = first_channel.image_numbers.last()?;
        let prefix = template[..pos].trim_end_matches('.');
        Some(format!("{prefix}.{first}..{last}"))
    }
}

impl Record for ObjectCfg {
    fn wire_size(&self) -> u64 {
        2 + 2
            + 8
            + str_size(&self.output_file)
            + str_size(&self.pupil_file)
            + 4
            + self.channel_defaults.wire_size()
    }

    fn pack(&self, w: &mut Writer) {
        w.put_u16(self.patch_size);
        w.put_u16(self.pupil_pixels);
        w.put_f64(self.wavelength);
        w.put_str(&self.output_file);
        w.put_str(&self.pupil_file);
        w.put_u32(self.save_flags.bits());
        self.channel_defaults.pack(w);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            patch_size: r.get_u16()?,
            pupil_pixels: r.get_u16()?,
            wavelength: r.get_f64()?,
            output_file: r.get_str()?,
            pupil_file: r.get_str()?,
            save_flags: SaveFlags::from_bits_truncate(r.get_u32()?),
            channel_defaults: ChannelCfg::unpack(r)?,
        })
    }
}

/// Job-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalCfg {
    /// Wavefront basis.
    pub basis: ModeBasis,
    /// First Zernike mode entering the KL expansion.
    pub kl_min_mode: u16,
    /// Last Zernike mode entering the KL expansion.
    pub kl_max_mode: u16,
    /// Singular-value cutoff for the KL construction (SVD_REG).
    pub kl_cutoff: f64,
    /// Modes enabled when the progression starts (MODE_START).
    pub mode_start: u16,
    /// Modes added per progression round (MODE_STEP).
    pub mode_step: u16,
    /// Explicit mode-number list; filled from `mode_start`.. when empty.
    pub mode_numbers: Vec<u16>,
    /// Telescope aperture in meters.
    pub telescope_d: f64,
    /// Telescope focal length in meters; derivable, see `check_image_scale`.
    pub telescope_f: f64,
    /// Lower iteration bound before FTOL may stop a round.
    pub min_iterations: u16,
    /// Hard iteration bound per round.
    pub max_iterations: u16,
    /// Relative metric-decrease tolerance.
    pub ftol: f64,
    /// Finite-difference step scale.
    pub eps: f64,
    /// Regularization strength γ.
    pub reg_gamma: f64,
    /// Gradient evaluation method.
    pub gradient_method: GradientMethod,
    /// Step selection method.
    pub getstep_method: StepMethod,
    /// Gain-table threshold below which a pixel counts as bad.
    pub badpixel_threshold: f64,
    /// Smallest patch overlap accepted by the splitter.
    pub minimum_overlap: u16,
    /// Patch centre columns (SIM_X); generated when empty.
    pub sim_x: Vec<u16>,
    /// Patch centre rows (SIM_Y); generated when empty.
    pub sim_y: Vec<u16>,
    /// Output container selection bitmask.
    pub output_file_type: u32,
    /// Output sample type.
    pub output_data_type: OutputDataType,
    /// Observation sequence number.
    pub sequence_number: u32,
    /// Observation date, ISO `YYYY-MM-DD`.
    pub date_obs: String,
    /// Observation time, `HH:MM:SS`.
    pub time_obs: String,
    /// Run flag bitmask.
    pub run_flags: RunFlags,
    /// Emit per-patch diagnostic dumps through the debug log.
    pub trace_output: bool,
    /// Retries granted to a patch that returns ERR.
    pub max_patch_retries: u16,
    /// Defaults handed down to every object.
    pub object_defaults: ObjectCfg,
}

impl Default for GlobalCfg {
    fn default() -> Self {
        Self {
            basis: ModeBasis::Zernike,
            kl_min_mode: 2,
            kl_max_mode: 2000,
            kl_cutoff: 1e-3,
            mode_start: 5,
            mode_step: 5,
            mode_numbers: Vec::new(),
            telescope_d: 0.0,
            telescope_f: 0.0,
            min_iterations: 5,
            max_iterations: 500,
            ftol: 1e-3,
            eps: 1e-10,
            reg_gamma: 0.0,
            gradient_method: GradientMethod::Vogel,
            getstep_method: StepMethod::ConjugateGradient,
            badpixel_threshold: 1e-5,
            minimum_overlap: 16,
            sim_x: Vec::new(),
            sim_y: Vec::new(),
            output_file_type: 0,
            output_data_type: OutputDataType::Float32,
            sequence_number: 0,
            date_obs: String::new(),
            time_obs: String::new(),
            run_flags: RunFlags::empty(),
            trace_output: false,
            max_patch_retries: 2,
            object_defaults: ObjectCfg::default(),
        }
    }
}

const RAD_TO_ARCSEC: f64 = 180.0 * 3600.0 / std::f64::consts::PI;

impl GlobalCfg {
    /// Reconcile TELESCOPE_F, ARCSECPERPIX and PIXELSIZE.
    ///
    /// Any two determine the third; all three given means F is replaced by
    /// the computed value (with a warning message returned); fewer than two
    /// is a configuration failure.
    pub fn check_image_scale(
        telescope_f: &mut f64,
        arcsec_per_pixel: &mut f64,
        pixel_size: &mut f64,
    ) -> Result<Option<String>, String> {
        let given = [*telescope_f, *arcsec_per_pixel, *pixel_size]
            .iter()
            .filter(|&&v| v > 0.0)
            .count();
        match given {
            3 => {
                let computed = *pixel_size * RAD_TO_ARCSEC / *arcsec_per_pixel;
                let msg = format!(
                    "too many image-scale parameters: replacing telescope focal length {} with computed value {}",
                    *telescope_f, computed
                );
                *telescope_f = computed;
                Ok(Some(msg))
            }
            2 => {
                if *telescope_f <= 0.0 {
                    *telescope_f = *pixel_size * RAD_TO_ARCSEC / *arcsec_per_pixel;
                } else if *arcsec_per_pixel <= 0.0 {
                    *arcsec_per_pixel = *pixel_size * RAD_TO_ARCSEC / *telescope_f;
                } else {
                    *pixel_size = *arcsec_per_pixel * *telescope_f / RAD_TO_ARCSEC;
                }
                Ok(None)
            }
            _ => Err(
                "at least two of TELESCOPE_F, ARCSECPERPIX and PIXELSIZE must be provided"
                    .to_string(),
            ),
        }
    }

    /// The modes the solver will progressively enable.
    ///
    /// The explicit MODES list wins; otherwise Noll indices 2..=n where n
    /// covers `mode_start` plus enough `mode_step` rounds to reach at least
    /// `mode_start` modes (callers extend as they see fit).
    pub fn effective_mode_numbers(&self) -> Vec<u16> {
        if !self.mode_numbers.is_empty() {
            return self.mode_numbers.clone();
        }
        (2..2 + self.mode_start).collect()
    }

    /// All validation failures for this job configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self
            .run_flags
            .contains(RunFlags::CALIBRATE | RunFlags::FLATFIELD)
        {
            problems.push("CALIBRATE and FLATFIELD are mutually exclusive".to_string());
        }
        if self.object_defaults.patch_size == 0 {
            problems.push("NUM_POINTS (patch size) must be set".to_string());
        }
        if self.object_defaults.pupil_pixels == 0 {
            problems.push("PUPIL_POINTS must be set".to_string());
        } else if self.object_defaults.patch_size != 2 * self.object_defaults.pupil_pixels {
            problems.push(format!(
                "NUM_POINTS ({}) must be twice PUPIL_POINTS ({}): image FTs and OTFs share one grid",
                self.object_defaults.patch_size, self.object_defaults.pupil_pixels
            ));
        }
        if self.telescope_d <= 0.0 {
            problems.push("TELESCOPE_D must be positive".to_string());
        }
        if self.max_iterations < self.min_iterations {
            problems.push(format!(
                "MAX_ITER ({}) below MIN_ITER ({})",
                self.max_iterations, self.min_iterations
            ));
        }
        if self.basis == ModeBasis::KarhunenLoeve && self.kl_min_mode >= self.kl_max_mode {
            problems.push(format!(
                "KL mode range is empty: [{}, {}]",
                self.kl_min_mode, self.kl_max_mode
            ));
        }
        if self.ftol <= 0.0 {
            problems.push("FTOL must be positive".to_string());
        }
        problems
    }
}

impl Record for GlobalCfg {
    fn wire_size(&self) -> u64 {
        1 + 2 * 2
            + 8
            + 2 * 2
            + seq_size(self.mode_numbers.len(), 2)
            + 8 * 2
            + 2 * 2
            + 8 * 3
            + 1
            + 1
            + 8
            + 2
            + seq_size(self.sim_x.len(), 2)
            + seq_size(self.sim_y.len(), 2)
            + 4
            + 1
            + 4
            + str_size(&self.date_obs)
            + str_size(&self.time_obs)
            + 4
            + 1
            + 2
            + self.object_defaults.wire_size()
    }

    fn pack(&self, w: &mut Writer) {
        w.put_u8(self.basis.tag());
        w.put_u16(self.kl_min_mode);
        w.put_u16(self.kl_max_mode);
        w.put_f64(self.kl_cutoff);
        w.put_u16(self.mode_start);
        w.put_u16(self.mode_step);
        w.put_u64(self.mode_numbers.len() as u64);
        for &m in &self.mode_numbers {
            w.put_u16(m);
        }
        w.put_f64(self.telescope_d);
        w.put_f64(self.telescope_f);
        w.put_u16(self.min_iterations);
        w.put_u16(self.max_iterations);
        w.put_f64(self.ftol);
        w.put_f64(self.eps);
        w.put_f64(self.reg_gamma);
        w.put_u8(self.gradient_method.tag());
        w.put_u8(self.getstep_method.tag());
        w.put_f64(self.badpixel_threshold);
        w.put_u16(self.minimum_overlap);
        w.put_u64(self.sim_x.len() as u64);
        for &v in &self.sim_x {
            w.put_u16(v);
        }
        w.put_u64(self.sim_y.len() as u64);
        for &v in &self.sim_y {
            w.put_u16(v);
        }
        w.put_u32(self.output_file_type);
        w.put_u8(self.output_data_type.tag());
        w.put_u32(self.sequence_number);
        w.put_str(&self.date_obs);
        w.put_str(&self.time_obs);
        w.put_u32(self.run_flags.bits());
        w.put_u8(self.trace_output as u8);
        w.put_u16(self.max_patch_retries);
        self.object_defaults.pack(w);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let basis = ModeBasis::from_tag(r.get_u8()?)?;
        let kl_min_mode = r.get_u16()?;
        let kl_max_mode = r.get_u16()?;
        let kl_cutoff = r.get_f64()?;
        let mode_start = r.get_u16()?;
        let mode_step = r.get_u16()?;
        let n_modes = r.get_u64()? as usize;
        let mut mode_numbers = Vec::with_capacity(n_modes.min(4096));
        for _ in 0..n_modes {
            mode_numbers.push(r.get_u16()?);
        }
        let telescope_d = r.get_f64()?;
        let telescope_f = r.get_f64()?;
        let min_iterations = r.get_u16()?;
        let max_iterations = r.get_u16()?;
        let ftol = r.get_f64()?;
        let eps = r.get_f64()?;
        let reg_gamma = r.get_f64()?;
        let gradient_method = GradientMethod::from_tag(r.get_u8()?)?;
        let getstep_method = StepMethod::from_tag(r.get_u8()?)?;
        let badpixel_threshold = r.get_f64()?;
        let minimum_overlap = r.get_u16()?;
        let n_x = r.get_u64()? as usize;
        let mut sim_x = Vec::with_capacity(n_x.min(4096));
        for _ in 0..n_x {
            sim_x.push(r.get_u16()?);
        }
        let n_y = r.get_u64()? as usize;
        let mut sim_y = Vec::with_capacity(n_y.min(4096));
        for _ in 0..n_y {
            sim_y.push(r.get_u16()?);
        }
        let output_file_type = r.get_u32()?;
        let output_data_type = OutputDataType::from_tag(r.get_u8()?)?;
        let sequence_number = r.get_u32()?;
        let date_obs = r.get_str()?;
        let time_obs = r.get_str()?;
        let run_flags = RunFlags::from_bits_truncate(r.get_u32()?);
        let trace_output = r.get_u8()? != 0;
        let max_patch_retries = r.get_u16()?;
        let object_defaults = ObjectCfg::unpack(r)?;
        Ok(Self {
            basis,
            kl_min_mode,
            kl_max_mode,
            kl_cutoff,
            mode_start,
            mode_step,
            mode_numbers,
            telescope_d,
            telescope_f,
            min_iterations,
            max_iterations,
            ftol,
            eps,
            reg_gamma,
            gradient_method,
            getstep_method,
            badpixel_threshold,
            minimum_overlap,
            sim_x,
            sim_y,
            output_file_type,
            output_data_type,
            sequence_number,
            date_obs,
            time_obs,
            run_flags,
            trace_output,
            max_patch_retries,
            object_defaults,
        })
    }
}

/// One object with its channels, after defaulting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSetup {
    /// Object-level settings.
    pub cfg: ObjectCfg,
    /// Channel settings, already run through `or_defaults`.
    pub channels: Vec<ChannelCfg>,
}

impl Record for ObjectSetup {
    fn wire_size(&self) -> u64 {
        self.cfg.wire_size()
            + 8
            + self.channels.iter().map(|c| c.wire_size()).sum::<u64>()
    }

    fn pack(&self, w: &mut Writer) {
        self.cfg.pack(w);
        w.put_u64(self.channels.len() as u64);
        for ch in &self.channels {
            ch.pack(w);
        }
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let cfg = ObjectCfg::unpack(r)?;
        let n = r.get_u64()? as usize;
        let mut channels = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            channels.push(ChannelCfg::unpack(r)?);
        }
        Ok(Self { cfg, channels })
    }
}

/// Fully-populated job configuration: the record the core consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCfg {
    /// Job-level settings.
    pub global: GlobalCfg,
    /// Objects with their channels.
    pub objects: Vec<ObjectSetup>,
}

impl JobCfg {
    /// All validation failures across the job; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.global.validate();
        if self.objects.is_empty() {
            problems.push("a job needs at least one object".to_string());
        }
        for (oi, obj) in self.objects.iter().enumerate() {
            if obj.channels.is_empty() {
                problems.push(format!("object {oi}: at least one channel required"));
            }
            if obj.cfg.wavelength <= 0.0 {
                problems.push(format!("object {oi}: WAVELENGTH must be positive"));
            }
            for (ci, ch) in obj.channels.iter().enumerate() {
                problems.extend(ch.validate(&format!("object {oi} channel {ci}")));
            }
            if obj.cfg.output_file.is_empty()
                && obj
                    .channels
                    .first()
                    .map(|ch| obj.cfg.derive_output_file(ch).is_none())
                    .unwrap_or(false)
            {
                problems.push(format!(
                    "object {oi}: output file not set and not derivable from the image template"
                ));
            }
        }
        problems
    }
}

impl Record for JobCfg {
    fn wire_size(&self) -> u64 {
        self.global.wire_size()
            + 8
            + self.objects.iter().map(|o| o.wire_size()).sum::<u64>()
    }

    fn pack(&self, w: &mut Writer) {
        self.global.pack(w);
        w.put_u64(self.objects.len() as u64);
        for obj in &self.objects {
            obj.pack(w);
        }
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let global = GlobalCfg::unpack(r)?;
        let n = r.get_u64()? as usize;
        let mut objects = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            objects.push(ObjectSetup::unpack(r)?);
        }
        Ok(Self { global, objects })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_channel() -> ChannelCfg {
        ChannelCfg {
            arcsec_per_pixel: 0.059,
            pixel_size: 16e-6,
            max_local_shift: 5,
            image_template: "camXIX.%07d".to_string(),
            image_numbers: vec![10, 11, 12],
            wavefront_indices: vec![10, 11, 12],
            weight: 1.0,
            fillpix_method: FillPixMethod::InvDistWeight,
            ..Default::default()
        }
    }

    fn sample_job() -> JobCfg {
        let channel = sample_channel();
        let object = ObjectCfg {
            patch_size: 128,
            pupil_pixels: 64,
            wavelength: 630.2e-9,
            save_flags: SaveFlags::PSF | SaveFlags::ALPHA,
            ..Default::default()
        };
        JobCfg {
            global: GlobalCfg {
                telescope_d: 0.97,
                telescope_f: 45.84,
                mode_numbers: vec![2, 3, 4, 5, 6],
                object_defaults: object.clone(),
                ..Default::default()
            },
            objects: vec![ObjectSetup {
                cfg: object,
                channels: vec![channel],
            }],
        }
    }

    #[test]
    fn sample_job_is_valid() {
        assert!(sample_job().validate().is_empty());
    }

    #[test]
    fn calibrate_and_flatfield_conflict() {
        let mut job = sample_job();
        job.global.run_flags = RunFlags::CALIBRATE | RunFlags::FLATFIELD;
        let problems = job.validate();
        assert!(problems.iter().any(|p| p.contains("mutually exclusive")));
    }

    #[test]
    fn dark_template_without_numbers_is_rejected() {
        let mut job = sample_job();
        job.objects[0].channels[0].dark_template = "dark.%07d".to_string();
        let problems = job.validate();
        assert!(problems.iter().any(|p| p.contains("no dark numbers")));
    }

    #[test]
    fn image_scale_derives_missing_focal_length() {
        let mut f = 0.0;
        let mut a = 0.059;
        let mut p = 16e-6;
        let warning = GlobalCfg::check_image_scale(&mut f, &mut a, &mut p).unwrap();
        assert!(warning.is_none());
        assert_relative_eq!(f, 16e-6 * RAD_TO_ARCSEC / 0.059, epsilon = 1e-9);
    }

    #[test]
    fn image_scale_overdetermined_replaces_f() {
        let mut f = 1.0;
        let mut a = 0.059;
        let mut p = 16e-6;
        let warning = GlobalCfg::check_image_scale(&mut f, &mut a, &mut p).unwrap();
        assert!(warning.is_some());
        assert_relative_eq!(f, 16e-6 * RAD_TO_ARCSEC / 0.059, epsilon = 1e-9);
    }

    #[test]
    fn image_scale_underdetermined_fails() {
        let mut f = 0.0;
        let mut a = 0.059;
        let mut p = 0.0;
        assert!(GlobalCfg::check_image_scale(&mut f, &mut a, &mut p).is_err());
    }

    #[test]
    fn channel_defaulting_fills_empty_fields() {
        let defaults = sample_channel();
        let sparse = ChannelCfg {
            rotation_angle: 0.5,
            ..Default::default()
        };
        let merged = sparse.or_defaults(&defaults);
        assert_eq!(merged.image_numbers, defaults.image_numbers);
        assert_relative_eq!(merged.weight, 1.0);
        assert_relative_eq!(merged.rotation_angle, 0.5);
    }

    #[test]
    fn output_file_derived_from_template() {
        let object = ObjectCfg::default();
        let channel = sample_channel();
        assert_eq!(
            object.derive_output_file(&channel).unwrap(),
            "camXIX.10..12"
        );
    }

    #[test]
    fn job_cfg_survives_json() {
        // Submission tools serialize configs as JSON before they reach the
        // wire codec.
        let job = sample_job();
        let text = serde_json::to_string(&job).unwrap();
        let back: JobCfg = serde_json::from_str(&text).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn job_cfg_roundtrips_byte_exact() {
        let job = sample_job();
        let bytes = job.to_bytes();
        assert_eq!(bytes.len() as u64, job.wire_size());
        let back = JobCfg::from_bytes(&bytes, false).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.to_bytes(), bytes);
    }

    #[test]
    fn job_cfg_roundtrips_through_swapped_wire() {
        let job = sample_job();
        let mut w = Writer::with_swap();
        job.pack(&mut w);
        let swapped = w.into_inner();
        let back = JobCfg::from_bytes(&swapped, true).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.to_bytes(), job.to_bytes());
    }
}
