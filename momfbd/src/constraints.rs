//! Linear equality constraints tying mode coefficients across frames.
//!
//! Rows of the sparse matrix C couple the α-parameters (one column per
//! (frame, mode) pair). Connected rows are grouped, each group gets an
//! orthonormal null-space basis from a rank-revealing SVD, and the global
//! mapping (β, α) → value is assembled from the group blocks plus identity
//! entries for unconstrained columns. `apply`/`reverse` are the only bridge
//! between solver state (β) and per-subimage state (α).

use crate::error::MomfbdError;
use nalgebra::DMatrix;
use once_cell::sync::Lazy;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Singular values below this fraction of the largest count as zero.
const RANK_TOLERANCE: f64 = 1e-12;

/// How the constraint system is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Pairs of frames sharing a wavefront are tied difference-to-zero.
    FramePairs,
    /// Calibration: every non-exempt coefficient is tied to zero directly.
    TieToZero,
}

/// One row of C: sparse ±1 entries keyed by global α-column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    /// Column index → ±1.
    pub entries: BTreeMap<u32, i8>,
}

impl Constraint {
    fn pair(plus: u32, minus: u32) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(plus, 1);
        entries.insert(minus, -1);
        Self { entries }
    }

    fn single(col: u32) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(col, 1);
        Self { entries }
    }

    fn first_entry(&self) -> u32 {
        *self.entries.keys().next().expect("constraint rows are never empty")
    }
}

/// Orthonormal null-space basis of one group, cached by structural hash.
#[derive(Debug)]
pub struct NullSpace {
    /// The group's constraint entries in local numbering, for hash
    /// verification.
    pub c_entries: Vec<(u32, u32, i8)>,
    /// Structural hash of (entries, n_parameters, n_constraints).
    pub entries_hash: u64,
    /// Columns of the group's C.
    pub n_parameters: u32,
    /// Rows of the group's C.
    pub n_constraints: u32,
    /// Free parameters: n_parameters − rank.
    pub n_free: u32,
    /// (β row, α col) → value in local numbering.
    pub ns_entries: Vec<(u32, u32, f64)>,
}

impl NullSpace {
    fn calculate(
        c_entries: Vec<(u32, u32, i8)>,
        n_parameters: u32,
        n_constraints: u32,
    ) -> Result<Self, MomfbdError> {
        let entries_hash = structural_hash(&c_entries, n_parameters, n_constraints);
        let mut c = DMatrix::<f64>::zeros(n_constraints as usize, n_parameters as usize);
        for &(row, col, v) in &c_entries {
            c[(row as usize, col as usize)] = v as f64;
        }

        let svd = c.svd(false, true);
        let v_t = svd
            .v_t
            .as_ref()
            .expect("svd computed with v_t requested");
        let largest = svd.singular_values.iter().cloned().fold(0.0, f64::max);
        let rank = svd
            .singular_values
            .iter()
            .filter(|&&s| s > RANK_TOLERANCE * largest.max(1.0))
            .count();
        if rank > n_parameters as usize {
            return Err(MomfbdError::Numeric(format!(
                "constraint group rank {rank} exceeds its {n_parameters} columns"
            )));
        }
        let n_free = n_parameters as usize - rank;

        // Rows of Vᵀ beyond the rank span null(C) and are orthonormal.
        let mut ns_entries = Vec::new();
        for beta in 0..n_free {
            let row = rank + beta;
            for alpha in 0..n_parameters as usize {
                let v = v_t[(row, alpha)];
                if v.abs() > RANK_TOLERANCE {
                    ns_entries.push((beta as u32, alpha as u32, v));
                }
            }
        }

        Ok(Self {
            c_entries,
            entries_hash,
            n_parameters,
            n_constraints,
            n_free: n_free as u32,
            ns_entries,
        })
    }

    /// True when this block was built from the same structure.
    fn matches(&self, c_entries: &[(u32, u32, i8)], n_parameters: u32, n_constraints: u32) -> bool {
        self.n_parameters == n_parameters
            && self.n_constraints == n_constraints
            && self.c_entries == c_entries
    }
}

fn structural_hash(entries: &[(u32, u32, i8)], n_parameters: u32, n_constraints: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    entries.hash(&mut hasher);
    n_parameters.hash(&mut hasher);
    n_constraints.hash(&mut hasher);
    hasher.finish()
}

static NULLSPACE_CACHE: Lazy<Mutex<HashMap<u64, Arc<NullSpace>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Fetch or build the null-space block for a group structure.
///
/// Concurrent misses collapse to a single build: the whole lookup+build is
/// under the cache lock, and a hash hit is verified against the structure
/// before reuse.
fn cached_nullspace(
    c_entries: Vec<(u32, u32, i8)>,
    n_parameters: u32,
    n_constraints: u32,
) -> Result<Arc<NullSpace>, MomfbdError> {
    let hash = structural_hash(&c_entries, n_parameters, n_constraints);
    let mut cache = NULLSPACE_CACHE.lock().expect("nullspace cache poisoned");
    if let Some(existing) = cache.get(&hash) {
        if existing.matches(&c_entries, n_parameters, n_constraints) {
            trace!(hash, "nullspace cache hit");
            return Ok(Arc::clone(existing));
        }
    }
    let built = Arc::new(NullSpace::calculate(c_entries, n_parameters, n_constraints)?);
    cache.insert(hash, Arc::clone(&built));
    Ok(built)
}

/// Connected constraints plus their shared null-space block.
#[derive(Debug)]
pub struct Group {
    /// Indices into `Constraints::constraints`.
    pub members: Vec<usize>,
    /// Global α-columns this group touches, in local-column order.
    pub columns: Vec<u32>,
    /// First β index assigned to this group.
    pub beta_offset: u32,
    /// The cached null-space block.
    pub nullspace: Arc<NullSpace>,
}

/// One (β, α, value) entry of the assembled global null-space map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NsEntry {
    /// Free-parameter index.
    pub beta: u32,
    /// Constrained-parameter index.
    pub alpha: u32,
    /// Matrix value.
    pub value: f64,
}

/// The full constraint system for a job.
#[derive(Debug)]
pub struct Constraints {
    /// How the rows were generated.
    pub kind: ConstraintKind,
    /// All rows of C.
    pub constraints: Vec<Constraint>,
    /// Connected groups with their null-space blocks.
    pub groups: Vec<Group>,
    /// Global α count.
    pub n_parameters: u32,
    /// Global β count.
    pub n_free_parameters: u32,
    /// Assembled (β, α) → value map, groups offset into global numbering.
    pub ns_entries: Vec<NsEntry>,
}

impl Constraints {
    /// Build the frame-pair system: every frame is tied to the first frame
    /// sharing its wavefront index, mode by mode.
    ///
    /// `wavefront_ids` carries one id per image in global image order;
    /// `n_modes` is the per-image mode count, so α has
    /// `images · n_modes` columns.
    pub fn frame_pairs(n_modes: usize, wavefront_ids: &[u32]) -> Result<Self, MomfbdError> {
        let n_parameters = (wavefront_ids.len() * n_modes) as u32;
        let mut first_with: HashMap<u32, usize> = HashMap::new();
        let mut constraints = Vec::new();
        for (img, &wf) in wavefront_ids.iter().enumerate() {
            match first_with.get(&wf) {
                None => {
                    first_with.insert(wf, img);
                }
                Some(&anchor) => {
                    for mode in 0..n_modes {
                        let plus = (anchor * n_modes + mode) as u32;
                        let minus = (img * n_modes + mode) as u32;
                        constraints.push(Constraint::pair(plus, minus));
                    }
                }
            }
        }
        Self::assemble(ConstraintKind::FramePairs, constraints, n_parameters)
    }

    /// Build the calibration system: every coefficient outside `free_modes`
    /// is tied to zero.
    pub fn tie_to_zero(
        n_modes: usize,
        n_images: usize,
        free_modes: &[usize],
    ) -> Result<Self, MomfbdError> {
        let n_parameters = (n_images * n_modes) as u32;
        let mut constraints = Vec::new();
        for img in 0..n_images {
            for mode in 0..n_modes {
                if !free_modes.contains(&mode) {
                    constraints.push(Constraint::single((img * n_modes + mode) as u32));
                }
            }
        }
        Self::assemble(ConstraintKind::TieToZero, constraints, n_parameters)
    }

    /// No coupling: every α is free (NO_CONSTRAINTS runs).
    pub fn unconstrained(n_parameters: u32) -> Result<Self, MomfbdError> {
        Self::assemble(ConstraintKind::FramePairs, Vec::new(), n_parameters)
    }

    fn assemble(
        kind: ConstraintKind,
        constraints: Vec<Constraint>,
        n_parameters: u32,
    ) -> Result<Self, MomfbdError> {
        let groups_members = group_connected(&constraints);

        let mut groups = Vec::new();
        let mut ns_entries = Vec::new();
        let mut constrained_columns = BTreeSet::new();
        let mut beta_offset = 0u32;

        for members in groups_members {
            // Local column ordering: first appearance row-wise, which
            // clusters identical row patterns into blocks.
            let mut columns: Vec<u32> = Vec::new();
            let mut seen = BTreeSet::new();
            let mut sorted_members = members.clone();
            sorted_members.sort_by_key(|&ci| constraints[ci].first_entry());
            for &ci in &sorted_members {
                for (&col, _) in &constraints[ci].entries {
                    if seen.insert(col) {
                        columns.push(col);
                    }
                }
            }
            let local_of: HashMap<u32, u32> = columns
                .iter()
                .enumerate()
                .map(|(local, &col)| (col, local as u32))
                .collect();

            let mut c_entries = Vec::new();
            for (row, &ci) in sorted_members.iter().enumerate() {
                for (&col, &v) in &constraints[ci].entries {
                    c_entries.push((row as u32, local_of[&col], v));
                }
            }
            let n_local = columns.len() as u32;
            let n_rows = sorted_members.len() as u32;
            let nullspace = cached_nullspace(c_entries, n_local, n_rows)?;

            for &(beta, alpha, value) in &nullspace.ns_entries {
                ns_entries.push(NsEntry {
                    beta: beta_offset + beta,
                    alpha: columns[alpha as usize],
                    value,
                });
            }
            constrained_columns.extend(columns.iter().copied());
            groups.push(Group {
                members: sorted_members,
                columns,
                beta_offset,
                nullspace: Arc::clone(&nullspace),
            });
            beta_offset += nullspace.n_free;
        }

        // Columns no constraint touches stay free: identity entries.
        for alpha in 0..n_parameters {
            if !constrained_columns.contains(&alpha) {
                ns_entries.push(NsEntry {
                    beta: beta_offset,
                    alpha,
                    value: 1.0,
                });
                beta_offset += 1;
            }
        }

        debug!(
            n_parameters,
            n_free = beta_offset,
            n_groups = groups.len(),
            n_rows = constraints.len(),
            "constraint system assembled"
        );

        Ok(Self {
            kind,
            constraints,
            groups,
            n_parameters,
            n_free_parameters: beta_offset,
            ns_entries,
        })
    }

    /// Fail unless a rebuild produced the same global α count.
    pub fn verify_rebuild(&self, other: &Constraints) -> Result<(), MomfbdError> {
        if self.n_parameters != other.n_parameters {
            return Err(MomfbdError::Numeric(format!(
                "global parameter count changed across runs: {} -> {}",
                self.n_parameters, other.n_parameters
            )));
        }
        Ok(())
    }

    /// β ← Nᵀ α.
    pub fn apply(&self, alpha: &[f64], beta: &mut [f64]) {
        debug_assert_eq!(alpha.len(), self.n_parameters as usize);
        debug_assert_eq!(beta.len(), self.n_free_parameters as usize);
        beta.fill(0.0);
        for e in &self.ns_entries {
            beta[e.beta as usize] += e.value * alpha[e.alpha as usize];
        }
    }

    /// α ← N β.
    pub fn reverse(&self, beta: &[f64], alpha: &mut [f64]) {
        debug_assert_eq!(alpha.len(), self.n_parameters as usize);
        debug_assert_eq!(beta.len(), self.n_free_parameters as usize);
        alpha.fill(0.0);
        for e in &self.ns_entries {
            alpha[e.alpha as usize] += e.value * beta[e.beta as usize];
        }
    }

    /// Dense copy of C, for inspection and tests.
    pub fn matrix(&self) -> DMatrix<f64> {
        let mut c = DMatrix::zeros(self.constraints.len(), self.n_parameters as usize);
        for (row, constraint) in self.constraints.iter().enumerate() {
            for (&col, &v) in &constraint.entries {
                c[(row, col as usize)] = v as f64;
            }
        }
        c
    }

    /// Dense copy of N (α rows, β columns), for inspection and tests.
    pub fn null_matrix(&self) -> DMatrix<f64> {
        let mut n = DMatrix::zeros(
            self.n_parameters as usize,
            self.n_free_parameters as usize,
        );
        for e in &self.ns_entries {
            n[(e.alpha as usize, e.beta as usize)] = e.value;
        }
        n
    }
}

impl shared::Record for Constraints {
    fn wire_size(&self) -> u64 {
        let rows: u64 = self
            .constraints
            .iter()
            .map(|c| 8 + c.entries.len() as u64 * 5)
            .sum();
        1 + 4 + 4 + 8 + rows + 8 + self.ns_entries.len() as u64 * 16
    }

    fn pack(&self, w: &mut shared::Writer) {
        w.put_u8(match self.kind {
            ConstraintKind::FramePairs => 0,
            ConstraintKind::TieToZero => 1,
        });
        w.put_u32(self.n_parameters);
        w.put_u32(self.n_free_parameters);
        w.put_u64(self.constraints.len() as u64);
        for row in &self.constraints {
            w.put_u64(row.entries.len() as u64);
            for (&col, &v) in &row.entries {
                w.put_u32(col);
                w.put_i8(v);
            }
        }
        w.put_u64(self.ns_entries.len() as u64);
        for e in &self.ns_entries {
            w.put_u32(e.beta);
            w.put_u32(e.alpha);
            w.put_f64(e.value);
        }
    }

    /// The receiver gets the assembled system; group structure stays on the
    /// side that built it.
    fn unpack(r: &mut shared::Reader<'_>) -> Result<Self, shared::WireError> {
        let kind = match r.get_u8()? {
            0 => ConstraintKind::FramePairs,
            1 => ConstraintKind::TieToZero,
            other => {
                return Err(shared::WireError::BadTag {
                    value: other as u64,
                    type_name: "ConstraintKind",
                })
            }
        };
        let n_parameters = r.get_u32()?;
        let n_free_parameters = r.get_u32()?;
        let n_rows = r.get_u64()? as usize;
        let mut constraints = Vec::with_capacity(n_rows.min(65_536));
        for _ in 0..n_rows {
            let n_entries = r.get_u64()? as usize;
            let mut entries = BTreeMap::new();
            for _ in 0..n_entries {
                let col = r.get_u32()?;
                let v = r.get_i8()?;
                entries.insert(col, v);
            }
            constraints.push(Constraint { entries });
        }
        let n_ns = r.get_u64()? as usize;
        let mut ns_entries = Vec::with_capacity(n_ns.min(1 << 20));
        for _ in 0..n_ns {
            ns_entries.push(NsEntry {
                beta: r.get_u32()?,
                alpha: r.get_u32()?,
                value: r.get_f64()?,
            });
        }
        Ok(Self {
            kind,
            constraints,
            groups: Vec::new(),
            n_parameters,
            n_free_parameters,
            ns_entries,
        })
    }
}

/// Union-find over rows that share columns.
fn group_connected(constraints: &[Constraint]) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..constraints.len()).collect();

    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        let mut root = i;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cur = i;
        while parent[cur] != root {
            let next = parent[cur];
            parent[cur] = root;
            cur = next;
        }
        root
    }

    let mut owner_of_column: HashMap<u32, usize> = HashMap::new();
    for (ci, constraint) in constraints.iter().enumerate() {
        for (&col, _) in &constraint.entries {
            match owner_of_column.get(&col) {
                None => {
                    owner_of_column.insert(col, ci);
                }
                Some(&other) => {
                    let ra = find(&mut parent, ci);
                    let rb = find(&mut parent, other);
                    if ra != rb {
                        parent[ra] = rb;
                    }
                }
            }
        }
    }

    let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for ci in 0..constraints.len() {
        let root = find(&mut parent, ci);
        by_root.entry(root).or_default().push(ci);
    }
    by_root.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn two_frames_one_shared_mode() {
        // Two frames, each with a single mode, sharing wavefront 7.
        let system = Constraints::frame_pairs(1, &[7, 7]).unwrap();
        assert_eq!(system.constraints.len(), 1);
        let c = system.matrix();
        assert_relative_eq!(c[(0, 0)], 1.0);
        assert_relative_eq!(c[(0, 1)], -1.0);

        // The null space is the symmetric combination: both α entries at
        // magnitude 1/√2, equal sign.
        assert_eq!(system.n_free_parameters, 1);
        assert_eq!(system.ns_entries.len(), 2);
        let inv_sqrt2 = 1.0 / 2.0f64.sqrt();
        for e in &system.ns_entries {
            assert_relative_eq!(e.value.abs(), inv_sqrt2, epsilon = 1e-12);
        }
        assert_relative_eq!(
            system.ns_entries[0].value,
            system.ns_entries[1].value,
            epsilon = 1e-12
        );
    }

    #[test]
    fn apply_reverse_is_identity_on_beta() {
        // Three frames on one wavefront, one lone frame, three modes each.
        let system = Constraints::frame_pairs(3, &[1, 1, 1, 9]).unwrap();
        let n_beta = system.n_free_parameters as usize;
        let n_alpha = system.n_parameters as usize;
        assert_eq!(n_alpha, 12);
        // Two tied frames remove 2 β per mode: 12 − 6 = 6 free.
        assert_eq!(n_beta, 6);

        let beta: Vec<f64> = (0..n_beta).map(|i| (i as f64 + 1.0) * 0.37).collect();
        let mut alpha = vec![0.0; n_alpha];
        let mut back = vec![0.0; n_beta];
        system.reverse(&beta, &mut alpha);
        system.apply(&alpha, &mut back);
        for (a, b) in beta.iter().zip(back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn reverse_apply_projects_onto_constraint_surface() {
        let system = Constraints::frame_pairs(2, &[4, 4]).unwrap();
        let n_alpha = system.n_parameters as usize;
        let n_beta = system.n_free_parameters as usize;

        // Project an arbitrary α twice: idempotent, and the projection
        // satisfies C·α = 0.
        let alpha0: Vec<f64> = vec![1.0, -0.5, 0.25, 2.0];
        let mut beta = vec![0.0; n_beta];
        let mut alpha1 = vec![0.0; n_alpha];
        system.apply(&alpha0, &mut beta);
        system.reverse(&beta, &mut alpha1);

        let mut beta2 = vec![0.0; n_beta];
        let mut alpha2 = vec![0.0; n_alpha];
        system.apply(&alpha1, &mut beta2);
        system.reverse(&beta2, &mut alpha2);
        for (a, b) in alpha1.iter().zip(alpha2.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }

        let c = system.matrix();
        let alpha_vec = nalgebra::DVector::from_vec(alpha1.clone());
        let residual = &c * &alpha_vec;
        for v in residual.iter() {
            assert_relative_eq!(*v, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn null_matrix_columns_are_orthonormal() {
        let system = Constraints::frame_pairs(2, &[1, 1, 2, 2, 2]).unwrap();
        let n = system.null_matrix();
        let gram = n.transpose() * &n;
        for r in 0..gram.nrows() {
            for c in 0..gram.ncols() {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert_relative_eq!(gram[(r, c)], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn disconnected_wavefronts_form_separate_groups() {
        let system = Constraints::frame_pairs(1, &[1, 1, 2, 2]).unwrap();
        assert_eq!(system.groups.len(), 2);
        let cols_a: Vec<u32> = system.groups[0].columns.clone();
        let cols_b: Vec<u32> = system.groups[1].columns.clone();
        assert!(cols_a.iter().all(|c| !cols_b.contains(c)));
    }

    #[test]
    fn nullspace_blocks_are_cached_by_structure() {
        // Two groups with identical structure share one cached block.
        let system = Constraints::frame_pairs(1, &[1, 1, 2, 2]).unwrap();
        assert!(Arc::ptr_eq(
            &system.groups[0].nullspace,
            &system.groups[1].nullspace
        ));
    }

    #[test]
    fn tie_to_zero_frees_only_exempt_modes() {
        // 2 images, 3 modes, modes 0 and 1 exempt (the tilts).
        let system = Constraints::tie_to_zero(3, 2, &[0, 1]).unwrap();
        // Mode 2 of both images is pinned; 4 freedoms remain.
        assert_eq!(system.n_free_parameters, 4);
        let n_alpha = system.n_parameters as usize;
        let beta: Vec<f64> = (0..4).map(|i| i as f64 + 1.0).collect();
        let mut alpha = vec![0.0; n_alpha];
        system.reverse(&beta, &mut alpha);
        // Pinned columns are 2 and 5.
        assert_relative_eq!(alpha[2], 0.0, epsilon = 1e-12);
        assert_relative_eq!(alpha[5], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn unconstrained_system_is_identity() {
        let system = Constraints::unconstrained(5).unwrap();
        assert_eq!(system.n_free_parameters, 5);
        let beta = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let mut alpha = vec![0.0; 5];
        system.reverse(&beta, &mut alpha);
        assert_eq!(alpha, beta);
    }

    #[test]
    fn constraints_roundtrip_byte_exact() {
        use shared::Record;
        let system = Constraints::frame_pairs(2, &[1, 1, 2, 2, 2, 9]).unwrap();
        let bytes = system.to_bytes();
        assert_eq!(bytes.len() as u64, system.wire_size());
        let back = Constraints::from_bytes(&bytes, false).unwrap();
        assert_eq!(back.to_bytes(), bytes);
        // The received system applies identically.
        let beta: Vec<f64> = (0..system.n_free_parameters as usize)
            .map(|i| i as f64 * 0.1)
            .collect();
        let mut a1 = vec![0.0; system.n_parameters as usize];
        let mut a2 = a1.clone();
        system.reverse(&beta, &mut a1);
        back.reverse(&beta, &mut a2);
        assert_eq!(a1, a2);

        // Cross-endian round-trip restores the same bytes too.
        let mut w = shared::Writer::with_swap();
        system.pack(&mut w);
        let swapped = w.into_inner();
        let again = Constraints::from_bytes(&swapped, true).unwrap();
        assert_eq!(again.to_bytes(), bytes);
    }

    #[test]
    fn rebuild_with_changed_parameter_count_fails() {
        let a = Constraints::frame_pairs(2, &[1, 1]).unwrap();
        let b = Constraints::frame_pairs(2, &[1, 1, 1]).unwrap();
        assert!(a.verify_rebuild(&b).is_err());
        assert!(a.verify_rebuild(&a).is_ok());
    }
}
