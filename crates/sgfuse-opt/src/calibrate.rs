//! Calibration pipeline for quantization.
//!
//! Runs a float graph on representative batches, observes every tensor the
//! layer filter selects, and freezes the observations into a
//! [`CalibrationTable`] of per-tensor ranges. Two modes are supported:
//! running min/max (`naive`) and a KL-divergence threshold over a histogram
//! of magnitudes (`entropy`).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use sgfuse_exec::{Executor, Feeds, ParamSet, Tensor};
use sgfuse_ir::{CalibRange, ComputeGraph};

use crate::config::{CalibMode, QuantizeConfig};
use crate::error::CalibrationError;

/// Batches of graph inputs used for calibration.
#[derive(Clone, Debug, Default)]
pub struct CalibrationDataset {
    /// One feed map per batch.
    pub batches: Vec<Feeds>,
    /// The directory these batches were loaded from, if any.
    pub source_dir: PathBuf,
}

impl CalibrationDataset {
    /// Create a dataset from in-memory batches.
    pub fn from_batches(batches: Vec<Feeds>) -> Self {
        Self {
            batches,
            source_dir: PathBuf::new(),
        }
    }

    /// Load one batch per `.bin` file in `dir`, fed to graph input `input`.
    ///
    /// Each file must contain exactly `shape.product()` little-endian f32
    /// values. Files are sorted by name for deterministic ordering.
    pub fn load_from_dir(dir: &Path, input: &str, shape: &[usize]) -> Result<Self, CalibrationError> {
        let mut bin_files: Vec<PathBuf> = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|e| CalibrationError::IoError {
            path: dir.to_path_buf(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| CalibrationError::IoError {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "bin") {
                bin_files.push(path);
            }
        }
        bin_files.sort();

        if bin_files.is_empty() {
            return Err(CalibrationError::NoSamples(dir.to_path_buf()));
        }

        let expected = shape.iter().product::<usize>() * 4;
        let mut batches = Vec::with_capacity(bin_files.len());
        for path in &bin_files {
            let data = std::fs::read(path).map_err(|e| CalibrationError::IoError {
                path: path.clone(),
                source: e,
            })?;
            if data.len() != expected {
                return Err(CalibrationError::InvalidFileSize {
                    path: path.clone(),
                    size: data.len(),
                    expected,
                });
            }
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            let batch = ArrayD::from_shape_vec(IxDyn(shape), floats)?;
            batches.push(Feeds::from([(input.to_string(), batch)]));
        }

        log::debug!("loaded {} calibration batches from {}", batches.len(), dir.display());
        Ok(Self {
            batches,
            source_dir: dir.to_path_buf(),
        })
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Histogram of absolute values over `[0, limit]`.
///
/// The range starts empty and widens whenever a larger magnitude arrives;
/// existing counts are folded into the wider bins by their centers.
#[derive(Clone, Debug)]
pub struct MagnitudeHistogram {
    limit: f32,
    bins: Vec<u64>,
}

/// Default number of histogram bins.
pub const DEFAULT_NUM_BINS: usize = 2048;

/// Number of quantization levels the entropy threshold targets.
const TARGET_BINS: usize = 128;

impl MagnitudeHistogram {
    pub fn new(num_bins: usize) -> Self {
        Self {
            limit: 0.0,
            bins: vec![0; num_bins.max(1)],
        }
    }

    /// Largest magnitude covered.
    pub fn limit(&self) -> f32 {
        self.limit
    }

    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }

    /// Count the magnitudes of the finite entries of `values`.
    pub fn add(&mut self, values: impl IntoIterator<Item = f32>) {
        let magnitudes: Vec<f32> = values
            .into_iter()
            .filter(|v| v.is_finite())
            .map(f32::abs)
            .collect();
        let Some(peak) = magnitudes.iter().copied().reduce(f32::max) else {
            return;
        };
        if peak > self.limit {
            self.widen(peak);
        }
        for m in magnitudes {
            let idx = self.bin_of(m);
            self.bins[idx] += 1;
        }
    }

    fn bin_of(&self, magnitude: f32) -> usize {
        let n = self.bins.len();
        if self.limit <= 0.0 {
            return 0;
        }
        ((magnitude / self.limit * n as f32) as usize).min(n - 1)
    }

    fn widen(&mut self, limit: f32) {
        let n = self.bins.len();
        let old_width = self.limit / n as f32;
        let old = std::mem::replace(&mut self.bins, vec![0; n]);
        self.limit = limit;
        for (i, count) in old.into_iter().enumerate().filter(|&(_, c)| c > 0) {
            let idx = self.bin_of((i as f32 + 0.5) * old_width);
            self.bins[idx] += count;
        }
    }

    /// Clipping threshold minimizing the KL divergence between the observed
    /// distribution and its 128-level quantization.
    ///
    /// Falls back to the full limit when there are too few bins to search.
    pub fn entropy_threshold(&self) -> f32 {
        let n = self.bins.len();
        let total = self.total();
        if n < TARGET_BINS || total == 0 {
            return self.limit;
        }
        let reference: Vec<f64> = self.bins.iter().map(|&c| c as f64 / total as f64).collect();

        let mut best = (f64::INFINITY, n);
        for cut in TARGET_BINS..=n {
            // Outlier mass folds into the last kept bin.
            let mut clipped = reference[..cut].to_vec();
            clipped[cut - 1] += reference[cut..].iter().sum::<f64>();

            let per_level = cut as f64 / TARGET_BINS as f64;
            let mut expanded = vec![0.0f64; cut];
            for level in 0..TARGET_BINS {
                let lo = (level as f64 * per_level) as usize;
                let hi = (((level + 1) as f64 * per_level) as usize).min(cut);
                let span = &clipped[lo..hi];
                let occupied = span.iter().filter(|&&p| p > 1e-12).count();
                if occupied == 0 {
                    continue;
                }
                let share = span.iter().sum::<f64>() / occupied as f64;
                for (slot, &p) in expanded[lo..hi].iter_mut().zip(span) {
                    if p > 1e-12 {
                        *slot = share;
                    }
                }
            }

            let divergence = kl_divergence(&clipped, &expanded);
            if divergence < best.0 {
                best = (divergence, cut);
            }
        }
        best.1 as f32 * self.limit / n as f32
    }
}

/// KL divergence `sum p * ln(p / q)`, skipping bins where either side is
/// near zero.
fn kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    p.iter()
        .zip(q)
        .filter(|&(&pi, &qi)| pi >= 1e-12 && qi >= 1e-12)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum()
}

/// Running observations for one tensor.
#[derive(Clone, Debug)]
struct RangeRecord {
    min: f32,
    max: f32,
    /// Number of non-NaN values seen.
    count: u64,
    saw_nan: bool,
    /// Histogram of finite magnitudes, entropy mode only.
    histogram: Option<MagnitudeHistogram>,
}

impl RangeRecord {
    fn new() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            count: 0,
            saw_nan: false,
            histogram: None,
        }
    }

    fn observe(&mut self, values: &ArrayD<f32>, mode: CalibMode) {
        for &v in values {
            if v.is_nan() {
                self.saw_nan = true;
                continue;
            }
            if v < self.min {
                self.min = v;
            }
            if v > self.max {
                self.max = v;
            }
            self.count += 1;
        }
        if mode == CalibMode::Entropy {
            self.histogram
                .get_or_insert_with(|| MagnitudeHistogram::new(DEFAULT_NUM_BINS))
                .add(values.iter().copied());
        }
    }

    /// `None` when nothing was observed. A NaN observation poisons the range
    /// so that later stages reject it instead of quantizing garbage.
    fn freeze(&self, mode: CalibMode) -> Option<CalibRange> {
        if self.saw_nan {
            return Some(CalibRange::new(f32::NAN, f32::NAN));
        }
        if self.count == 0 {
            return None;
        }
        let observed = CalibRange::new(self.min, self.max);
        match (mode, &self.histogram) {
            (CalibMode::Entropy, Some(hist)) if observed.is_representable() => {
                let t = hist.entropy_threshold();
                Some(CalibRange::new(self.min.max(-t), self.max.min(t)))
            }
            _ => Some(observed),
        }
    }
}

/// Frozen calibration ranges, keyed by tensor (edge) name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrationTable {
    pub ranges: BTreeMap<String, CalibRange>,
    /// The mode the ranges were computed with.
    pub mode: CalibMode,
    /// Number of batches observed.
    pub num_batches: usize,
}

impl CalibrationTable {
    pub fn get(&self, name: &str) -> Option<CalibRange> {
        self.ranges.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, range: CalibRange) {
        self.ranges.insert(name.into(), range);
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CalibRange)> {
        self.ranges.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Print a summary of calibration results to the log.
    pub fn log_summary(&self) {
        log::info!(
            "Calibration results ({} tensors, {} batches, {} mode):",
            self.ranges.len(),
            self.num_batches,
            self.mode.as_str()
        );
        for (name, range) in &self.ranges {
            log::info!("  {name}: min={:.6}, max={:.6}", range.min, range.max);
        }
    }
}

/// Observes tensors while the executor runs calibration batches.
#[derive(Debug, Default)]
pub struct CalibrationCollector {
    records: BTreeMap<String, RangeRecord>,
    batches: usize,
}

impl CalibrationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run up to `config.num_calib_examples` batches of `dataset` through
    /// `executor` and freeze the observed ranges.
    ///
    /// Records every tensor whose name passes `config.calib_layer` and whose
    /// producer is not in `config.excluded_names`. Batches run one after
    /// another; min/max accumulation is order independent.
    pub fn collect(
        graph: &ComputeGraph,
        params: &ParamSet,
        executor: &dyn Executor,
        dataset: &CalibrationDataset,
        config: &QuantizeConfig,
    ) -> Result<CalibrationTable, CalibrationError> {
        if dataset.is_empty() {
            log::warn!("calibration dataset is empty, every tensor stays in float");
            return Ok(CalibrationTable {
                mode: config.calib_mode,
                ..Default::default()
            });
        }

        let skipped: HashSet<String> = graph
            .nodes
            .iter()
            .filter(|n| config.is_excluded(&n.name))
            .flat_map(|n| n.outputs.iter().map(|&e| graph.edge_name(e).to_string()))
            .collect();
        let limit = config.num_calib_examples.unwrap_or(usize::MAX);

        let mut collector = Self::new();
        for batch in dataset.batches.iter().take(limit) {
            executor.run_observed(graph, params, batch, &mut |name, value| {
                if !skipped.contains(name) && config.calib_layer.matches(name) {
                    collector.observe(name, value, config.calib_mode);
                }
            })?;
            collector.batches += 1;
        }

        log::debug!(
            "{}: observed {} tensors over {} batches",
            executor.name(),
            collector.records.len(),
            collector.batches
        );
        Ok(collector.freeze(config.calib_mode))
    }

    /// Fold one observed value into the record for `name`.
    pub fn observe(&mut self, name: &str, value: &Tensor, mode: CalibMode) {
        let values = value.to_f32();
        self.records
            .entry(name.to_string())
            .or_insert_with(RangeRecord::new)
            .observe(&values, mode);
    }

    pub fn freeze(&self, mode: CalibMode) -> CalibrationTable {
        let ranges = self
            .records
            .iter()
            .filter_map(|(name, record)| record.freeze(mode).map(|r| (name.clone(), r)))
            .collect();
        CalibrationTable {
            ranges,
            mode,
            num_batches: self.batches,
        }
    }
}
