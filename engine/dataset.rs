//! # Sparse training datasets
//!
//! A [`Dataset`] accumulates labeled sparse instances for one partition and
//! then freezes them for numerical use. Feature names are interned into
//! dense 1-based indices in order of first appearance. Every dataset owns
//! its interning table; tables are never shared between partitions.
//!
//! Three row encodings are supported. Real rows store `(index, value)`
//! pairs. Binary rows store only sorted indices, every value being an
//! implicit 1.0, and may use 16-bit indices when the feature space is small.
//! The objective's inner loops are written once against [`SparseRow`] and
//! monomorphised per encoding, so binary rows never multiply by a value.

use ahash::{AHashMap, AHashSet};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use thiserror::Error;

use crate::model::INTERCEPT_NAME;

/// Largest feature index representable in a short-index binary dataset.
pub const SHORT_INDEX_LIMIT: usize = i16::MAX as usize;

/// Marks the bias slot until `finish` knows the final feature count.
const BIAS_PLACEHOLDER: u32 = 0;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset is already finished; it cannot be modified or finished again")]
    AlreadyFinished,

    #[error("dataset is not finished yet")]
    NotFinished,

    #[error("instance {instance}: label {label} is outside {{-1, 0, 1}}")]
    InvalidLabel { instance: usize, label: i64 },

    #[error("instance {instance}: weight {weight} must be finite and non-negative")]
    InvalidWeight { instance: usize, weight: f64 },

    #[error(
        "instance {instance}: feature indices must be strictly increasing, found {current} after {previous}"
    )]
    UnsortedFeatures {
        instance: usize,
        previous: u64,
        current: u64,
    },

    #[error("instance {instance}: feature '{name}' appears more than once")]
    DuplicateFeature { instance: usize, name: String },

    #[error("instance {instance}: feature '{name}' has non-finite value {value}")]
    NonFiniteValue {
        instance: usize,
        name: String,
        value: f64,
    },

    #[error("instance {instance}: binary feature '{name}' has value {value}; only 1 is allowed")]
    NonBinaryValue {
        instance: usize,
        name: String,
        value: f64,
    },

    #[error("feature name '{0}' is reserved for the intercept")]
    ReservedFeatureName(String),

    #[error("feature count {count} exceeds the short index limit of {limit}")]
    TooManyFeaturesForShortIndex { count: usize, limit: usize },

    #[error("bias must be 0 or 1 for binary datasets, got {0}")]
    InvalidBias(f64),

    #[error("line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },

    #[error("{what} has length {found}, expected {expected}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("sanity check failed: {0}")]
    SanityCheck(String),
}

/// How feature rows are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FeatureEncoding {
    #[default]
    Real,
    Binary,
    BinaryShort,
}

/// Strictness of [`Dataset::sanity_check`]. Each level includes the ones
/// before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SanityLevel {
    /// Parallel arrays agree in length.
    Dimensions,
    /// The name to index table is a bijection onto `1..=n`.
    Names,
    /// Every row is sorted, in bounds, and carries a valid label and weight.
    Records,
}

/// Canonical in-memory training example, before interning.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub label: i32,
    pub weight: f64,
    pub offset: f64,
    pub features: Vec<(String, f64)>,
}

impl Instance {
    pub fn new(label: i32, features: Vec<(String, f64)>) -> Self {
        Self {
            label,
            weight: 1.0,
            offset: 0.0,
            features,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }
}

/// A stored `(index, value)` entry of a real-valued row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Feature {
    pub index: u32,
    pub value: f64,
}

/// Row kernels used by the objective. Indices are 1-based; vectors are
/// 0-based, so entry `i` touches slot `i - 1`.
pub trait SparseRow {
    fn dot(&self, v: &ArrayView1<f64>) -> f64;
    fn scatter(&self, alpha: f64, out: &mut ArrayViewMut1<f64>);
    fn accumulate_squares(&self, scale: f64, diagonal: &mut Array1<f64>);
    fn accumulate_lower(&self, scale: f64, hessian: &mut Array2<f64>);
}

impl SparseRow for [Feature] {
    fn dot(&self, v: &ArrayView1<f64>) -> f64 {
        self.iter()
            .map(|f| v[f.index as usize - 1] * f.value)
            .sum()
    }

    fn scatter(&self, alpha: f64, out: &mut ArrayViewMut1<f64>) {
        for f in self {
            out[f.index as usize - 1] += alpha * f.value;
        }
    }

    fn accumulate_squares(&self, scale: f64, diagonal: &mut Array1<f64>) {
        for f in self {
            diagonal[f.index as usize - 1] += scale * f.value * f.value;
        }
    }

    fn accumulate_lower(&self, scale: f64, hessian: &mut Array2<f64>) {
        for (pos, row) in self.iter().enumerate() {
            let r = row.index as usize - 1;
            let scaled = scale * row.value;
            for col in &self[..=pos] {
                hessian[[r, col.index as usize - 1]] += scaled * col.value;
            }
        }
    }
}

macro_rules! binary_row {
    ($index:ty) => {
        impl SparseRow for [$index] {
            fn dot(&self, v: &ArrayView1<f64>) -> f64 {
                self.iter().map(|&i| v[i as usize - 1]).sum()
            }

            fn scatter(&self, alpha: f64, out: &mut ArrayViewMut1<f64>) {
                for &i in self {
                    out[i as usize - 1] += alpha;
                }
            }

            fn accumulate_squares(&self, scale: f64, diagonal: &mut Array1<f64>) {
                for &i in self {
                    diagonal[i as usize - 1] += scale;
                }
            }

            fn accumulate_lower(&self, scale: f64, hessian: &mut Array2<f64>) {
                for (pos, &row) in self.iter().enumerate() {
                    let r = row as usize - 1;
                    for &col in &self[..=pos] {
                        hessian[[r, col as usize - 1]] += scale;
                    }
                }
            }
        }
    };
}

binary_row!(u32);
binary_row!(u16);

#[derive(Debug, Clone)]
enum FeatureRows {
    Real(Vec<Box<[Feature]>>),
    Binary(Vec<Box<[u32]>>),
    BinaryShort(Vec<Box<[u16]>>),
}

macro_rules! each_encoding {
    ($rows:expr, $bound:ident => $body:expr) => {
        match $rows {
            FeatureRows::Real($bound) => $body,
            FeatureRows::Binary($bound) => $body,
            FeatureRows::BinaryShort($bound) => $body,
        }
    };
}

fn product_rows<R: SparseRow + ?Sized>(rows: &[Box<R>], v: &ArrayView1<f64>, out: &mut Array1<f64>) {
    for (slot, row) in out.iter_mut().zip(rows) {
        *slot = row.dot(v);
    }
}

fn transpose_rows<R: SparseRow + ?Sized>(
    rows: &[Box<R>],
    coefficients: &Array1<f64>,
    out: &mut ArrayViewMut1<f64>,
) {
    for (&alpha, row) in coefficients.iter().zip(rows) {
        if alpha != 0.0 {
            row.scatter(alpha, out);
        }
    }
}

fn square_rows<R: SparseRow + ?Sized>(
    rows: &[Box<R>],
    scales: &Array1<f64>,
    diagonal: &mut Array1<f64>,
) {
    for (&scale, row) in scales.iter().zip(rows) {
        row.accumulate_squares(scale, diagonal);
    }
}

fn outer_rows<R: SparseRow + ?Sized>(rows: &[Box<R>], scales: &Array1<f64>, hessian: &mut Array2<f64>) {
    for (&scale, row) in scales.iter().zip(rows) {
        row.accumulate_lower(scale, hessian);
    }
}

impl FeatureRows {
    fn empty(encoding: FeatureEncoding) -> Self {
        match encoding {
            FeatureEncoding::Real => Self::Real(Vec::new()),
            FeatureEncoding::Binary => Self::Binary(Vec::new()),
            FeatureEncoding::BinaryShort => Self::BinaryShort(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        each_encoding!(self, rows => rows.len())
    }

    fn row_indices(&self, row: usize) -> Vec<u32> {
        match self {
            Self::Real(rows) => rows[row].iter().map(|f| f.index).collect(),
            Self::Binary(rows) => rows[row].to_vec(),
            Self::BinaryShort(rows) => rows[row].iter().map(|&i| u32::from(i)).collect(),
        }
    }

    fn resolve_bias(&mut self, bias_index: u32) {
        match self {
            Self::Real(rows) => {
                for row in rows.iter_mut() {
                    if let Some(last) = row.last_mut().filter(|f| f.index == BIAS_PLACEHOLDER) {
                        last.index = bias_index;
                    }
                }
            }
            Self::Binary(rows) => {
                for row in rows.iter_mut() {
                    if let Some(last) = row.last_mut().filter(|i| **i == BIAS_PLACEHOLDER) {
                        *last = bias_index;
                    }
                }
            }
            Self::BinaryShort(rows) => {
                // Short encodings are bounded by SHORT_INDEX_LIMIT at insertion.
                let short = bias_index as u16;
                for row in rows.iter_mut() {
                    if let Some(last) = row.last_mut().filter(|i| u32::from(**i) == BIAS_PLACEHOLDER)
                    {
                        *last = short;
                    }
                }
            }
        }
    }
}

/// Frozen per-instance arrays, available after [`Dataset::finish`].
#[derive(Debug, Clone)]
pub struct FrozenArrays {
    /// Labels in `{-1, +1}`.
    pub y: Array1<f64>,
    pub weight: Array1<f64>,
    pub offset: Array1<f64>,
}

#[derive(Debug, Clone)]
enum Phase {
    Building {
        labels: Vec<f64>,
        weights: Vec<f64>,
        offsets: Vec<f64>,
    },
    Finished(FrozenArrays),
}

#[derive(Debug, Clone)]
pub struct Dataset {
    bias: f64,
    encoding: FeatureEncoding,
    index: AHashMap<String, u32>,
    names: Vec<String>,
    rows: FeatureRows,
    phase: Phase,
    n_features: usize,
}

impl Dataset {
    /// Creates an empty real-valued dataset. A positive `bias` appends a
    /// synthetic feature of that value to every instance.
    pub fn new(bias: f64) -> Self {
        Self {
            bias: bias.max(0.0),
            encoding: FeatureEncoding::Real,
            index: AHashMap::new(),
            names: Vec::new(),
            rows: FeatureRows::empty(FeatureEncoding::Real),
            phase: Phase::Building {
                labels: Vec::new(),
                weights: Vec::new(),
                offsets: Vec::new(),
            },
            n_features: 0,
        }
    }

    /// Creates an empty binary dataset; `bias` must be 0 or 1.
    pub fn binary(bias: f64, short_index: bool) -> Result<Self, DatasetError> {
        if bias != 0.0 && bias != 1.0 {
            return Err(DatasetError::InvalidBias(bias));
        }
        let encoding = if short_index {
            FeatureEncoding::BinaryShort
        } else {
            FeatureEncoding::Binary
        };
        let mut dataset = Self::new(bias);
        dataset.encoding = encoding;
        dataset.rows = FeatureRows::empty(encoding);
        Ok(dataset)
    }

    pub fn encoding(&self) -> FeatureEncoding {
        self.encoding
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn has_bias(&self) -> bool {
        self.bias > 0.0
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished(_))
    }

    pub fn n_instances(&self) -> usize {
        self.rows.len()
    }

    /// Feature count including the bias slot. Fixed once finished; before
    /// that it reflects the names interned so far.
    pub fn n_features(&self) -> usize {
        if self.is_finished() {
            self.n_features
        } else {
            self.names.len() + usize::from(self.has_bias())
        }
    }

    /// 1-based index of `name`, or `None` when the name was never seen.
    /// After `finish`, a biased dataset also resolves [`INTERCEPT_NAME`] to
    /// the bias slot.
    pub fn feature_index(&self, name: &str) -> Option<usize> {
        if name == INTERCEPT_NAME {
            return (self.is_finished() && self.has_bias()).then_some(self.n_features);
        }
        self.index.get(name).map(|&i| i as usize)
    }

    /// Name for a 1-based index.
    pub fn feature_name(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    /// Names in index order (bias slot last when finished with a bias).
    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Arrays frozen by `finish`.
    pub fn arrays(&self) -> Result<&FrozenArrays, DatasetError> {
        match &self.phase {
            Phase::Finished(arrays) => Ok(arrays),
            Phase::Building { .. } => Err(DatasetError::NotFinished),
        }
    }

    /// Counts of `(positive, negative)` instances.
    pub fn class_counts(&self) -> (usize, usize) {
        let labels: &[f64] = match &self.phase {
            Phase::Building { labels, .. } => labels.as_slice(),
            Phase::Finished(arrays) => arrays.y.as_slice().unwrap_or(&[]),
        };
        let positive = labels.iter().filter(|&&y| y > 0.0).count();
        (positive, labels.len() - positive)
    }

    /// Appends one instance. Label 0 is read as -1.
    pub fn add_instance(&mut self, instance: &Instance) -> Result<(), DatasetError> {
        let row = self.n_instances();
        let Phase::Building { .. } = self.phase else {
            return Err(DatasetError::AlreadyFinished);
        };
        let label = match instance.label {
            1 => 1.0,
            0 | -1 => -1.0,
            other => {
                return Err(DatasetError::InvalidLabel {
                    instance: row,
                    label: i64::from(other),
                });
            }
        };
        if !(instance.weight.is_finite() && instance.weight >= 0.0) {
            return Err(DatasetError::InvalidWeight {
                instance: row,
                weight: instance.weight,
            });
        }

        self.check_features(row, &instance.features)?;

        // Interning is the only step that grows the name table; roll it back
        // if it fails part way.
        let known = self.names.len();
        let mut entries = Vec::with_capacity(instance.features.len() + 1);
        for (name, value) in &instance.features {
            match self.intern(name) {
                Ok(index) => entries.push((index, *value)),
                Err(e) => {
                    for name in self.names.drain(known..) {
                        self.index.remove(&name);
                    }
                    return Err(e);
                }
            }
        }
        entries.sort_unstable_by_key(|&(index, _)| index);
        self.push_row(entries);

        if let Phase::Building {
            labels,
            weights,
            offsets,
        } = &mut self.phase
        {
            labels.push(label);
            weights.push(instance.weight);
            offsets.push(instance.offset);
        }
        Ok(())
    }

    /// Parses and appends a `label idx:value ...` line. Indices must be
    /// strictly increasing positive integers; they are interned by their
    /// decimal text.
    pub fn add_libsvm_line(&mut self, line: &str, line_number: usize) -> Result<(), DatasetError> {
        let malformed = |reason: String| DatasetError::MalformedLine {
            line: line_number,
            reason,
        };
        let mut tokens = line.split_whitespace();
        let label_token = tokens
            .next()
            .ok_or_else(|| malformed("empty line".to_string()))?;
        let label = label_token
            .parse::<f64>()
            .map_err(|e| malformed(format!("bad label '{label_token}': {e}")))?;

        let mut features = Vec::new();
        let mut previous = 0_u64;
        for token in tokens {
            let (index_text, value_text) = token
                .split_once(':')
                .ok_or_else(|| malformed(format!("expected index:value, got '{token}'")))?;
            let index = index_text
                .parse::<u64>()
                .map_err(|e| malformed(format!("bad index '{index_text}': {e}")))?;
            let value = value_text
                .parse::<f64>()
                .map_err(|e| malformed(format!("bad value '{value_text}': {e}")))?;
            if index <= previous {
                return Err(DatasetError::UnsortedFeatures {
                    instance: self.n_instances(),
                    previous,
                    current: index,
                });
            }
            previous = index;
            features.push((index_text.to_string(), value));
        }

        let label = match label {
            l if l == 1.0 => 1,
            l if l == 0.0 => 0,
            l if l == -1.0 => -1,
            other => {
                return Err(DatasetError::InvalidLabel {
                    instance: self.n_instances(),
                    label: other as i64,
                });
            }
        };
        self.add_instance(&Instance::new(label, features))
    }

    /// Drops every accumulated instance and interned name.
    pub fn reset(&mut self) -> Result<(), DatasetError> {
        if self.is_finished() {
            return Err(DatasetError::AlreadyFinished);
        }
        *self = match self.encoding {
            FeatureEncoding::Real => Self::new(self.bias),
            FeatureEncoding::Binary => Self::binary(self.bias, false)?,
            FeatureEncoding::BinaryShort => Self::binary(self.bias, true)?,
        };
        Ok(())
    }

    /// Freezes the dataset and resolves the bias slot to `n`.
    pub fn finish(&mut self) -> Result<(), DatasetError> {
        let Phase::Building {
            labels,
            weights,
            offsets,
        } = &mut self.phase
        else {
            return Err(DatasetError::AlreadyFinished);
        };
        let arrays = FrozenArrays {
            y: Array1::from(std::mem::take(labels)),
            weight: Array1::from(std::mem::take(weights)),
            offset: Array1::from(std::mem::take(offsets)),
        };
        self.n_features = self.names.len();
        if self.has_bias() {
            self.n_features += 1;
            self.rows.resolve_bias(self.n_features as u32);
            self.names.push(INTERCEPT_NAME.to_string());
        }
        self.phase = Phase::Finished(arrays);
        self.sanity_check(SanityLevel::Names)?;
        log::debug!(
            "Finished dataset: {} instances, {} features ({:?} encoding)",
            self.n_instances(),
            self.n_features,
            self.encoding
        );
        Ok(())
    }

    pub fn sanity_check(&self, level: SanityLevel) -> Result<(), DatasetError> {
        let rows = self.rows.len();
        let (labels, weights, offsets): (&[f64], &[f64], &[f64]) = match &self.phase {
            Phase::Building {
                labels,
                weights,
                offsets,
            } => (labels.as_slice(), weights.as_slice(), offsets.as_slice()),
            Phase::Finished(arrays) => (
                arrays.y.as_slice().unwrap_or(&[]),
                arrays.weight.as_slice().unwrap_or(&[]),
                arrays.offset.as_slice().unwrap_or(&[]),
            ),
        };
        for (what, found) in [
            ("label array", labels.len()),
            ("weight array", weights.len()),
            ("offset array", offsets.len()),
        ] {
            if found != rows {
                return Err(DatasetError::LengthMismatch {
                    what,
                    expected: rows,
                    found,
                });
            }
        }
        if level == SanityLevel::Dimensions {
            return Ok(());
        }

        let user_features = self.index.len();
        let expected_names = user_features + usize::from(self.is_finished() && self.has_bias());
        if self.names.len() != expected_names {
            return Err(DatasetError::SanityCheck(format!(
                "{} names for {} interned features",
                self.names.len(),
                expected_names
            )));
        }
        for (name, &index) in &self.index {
            if self.feature_name(index as usize) != Some(name.as_str()) {
                return Err(DatasetError::SanityCheck(format!(
                    "feature '{name}' maps to index {index}, which names something else"
                )));
            }
        }
        if level == SanityLevel::Names {
            return Ok(());
        }

        let bound = self.n_features() as u32;
        for row in 0..rows {
            let indices = self.rows.row_indices(row);
            let mut previous = 0_u32;
            for &index in &indices {
                let placeholder = index == BIAS_PLACEHOLDER && !self.is_finished();
                if !placeholder && (index <= previous || index > bound) {
                    return Err(DatasetError::SanityCheck(format!(
                        "instance {row}: index {index} out of order or outside 1..={bound}"
                    )));
                }
                previous = previous.max(index);
            }
            if labels[row] != 1.0 && labels[row] != -1.0 {
                return Err(DatasetError::SanityCheck(format!(
                    "instance {row}: label {} is not +1 or -1",
                    labels[row]
                )));
            }
            if !(weights[row] >= 0.0) {
                return Err(DatasetError::SanityCheck(format!(
                    "instance {row}: weight {} is negative",
                    weights[row]
                )));
            }
        }
        Ok(())
    }

    /// `out[i] = x_i . v` for every instance.
    pub fn product(&self, v: &ArrayView1<f64>, out: &mut Array1<f64>) {
        each_encoding!(&self.rows, rows => product_rows(rows, v, out))
    }

    /// `out += sum_i coefficients[i] * x_i`.
    pub fn transpose_product(&self, coefficients: &Array1<f64>, out: &mut ArrayViewMut1<f64>) {
        each_encoding!(&self.rows, rows => transpose_rows(rows, coefficients, out))
    }

    /// `diagonal[k] += sum_i scales[i] * x_ik^2`.
    pub fn accumulate_squares(&self, scales: &Array1<f64>, diagonal: &mut Array1<f64>) {
        each_encoding!(&self.rows, rows => square_rows(rows, scales, diagonal))
    }

    /// Lower triangle of `sum_i scales[i] * x_i x_i^T`.
    pub fn accumulate_lower(&self, scales: &Array1<f64>, hessian: &mut Array2<f64>) {
        each_encoding!(&self.rows, rows => outer_rows(rows, scales, hessian))
    }

    /// Rejects an instance's features before any of them is interned.
    fn check_features(&self, row: usize, features: &[(String, f64)]) -> Result<(), DatasetError> {
        let binary = self.encoding != FeatureEncoding::Real;
        let mut seen = AHashSet::with_capacity(features.len());
        for (name, value) in features {
            if name == INTERCEPT_NAME {
                return Err(DatasetError::ReservedFeatureName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(DatasetError::DuplicateFeature {
                    instance: row,
                    name: name.clone(),
                });
            }
            if !value.is_finite() {
                return Err(DatasetError::NonFiniteValue {
                    instance: row,
                    name: name.clone(),
                    value: *value,
                });
            }
            if binary && *value != 1.0 {
                return Err(DatasetError::NonBinaryValue {
                    instance: row,
                    name: name.clone(),
                    value: *value,
                });
            }
        }
        Ok(())
    }

    fn intern(&mut self, name: &str) -> Result<u32, DatasetError> {
        if name == INTERCEPT_NAME {
            return Err(DatasetError::ReservedFeatureName(name.to_string()));
        }
        if let Some(&index) = self.index.get(name) {
            return Ok(index);
        }
        let count = self.names.len() + 1;
        if self.encoding == FeatureEncoding::BinaryShort
            && count + usize::from(self.has_bias()) > SHORT_INDEX_LIMIT
        {
            return Err(DatasetError::TooManyFeaturesForShortIndex {
                count,
                limit: SHORT_INDEX_LIMIT,
            });
        }
        let index = count as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), index);
        Ok(index)
    }

    fn push_row(&mut self, entries: Vec<(u32, f64)>) {
        let with_bias = self.has_bias();
        match &mut self.rows {
            FeatureRows::Real(rows) => {
                let mut features: Vec<Feature> = entries
                    .into_iter()
                    .map(|(index, value)| Feature { index, value })
                    .collect();
                if with_bias {
                    features.push(Feature {
                        index: BIAS_PLACEHOLDER,
                        value: self.bias,
                    });
                }
                rows.push(features.into_boxed_slice());
            }
            FeatureRows::Binary(rows) => {
                let mut indices: Vec<u32> = entries.into_iter().map(|(index, _)| index).collect();
                if with_bias {
                    indices.push(BIAS_PLACEHOLDER);
                }
                rows.push(indices.into_boxed_slice());
            }
            FeatureRows::BinaryShort(rows) => {
                let mut indices: Vec<u16> = entries.into_iter().map(|(index, _)| index as u16).collect();
                if with_bias {
                    indices.push(BIAS_PLACEHOLDER as u16);
                }
                rows.push(indices.into_boxed_slice());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    #[test]
    fn finish_twice_is_a_state_error() -> Result<(), DatasetError> {
        let mut dataset = Dataset::new(1.0);
        dataset.add_instance(&Instance::new(1, features(&[("a", 1.0)])))?;
        dataset.finish()?;
        assert!(matches!(dataset.finish(), Err(DatasetError::AlreadyFinished)));
        assert!(matches!(
            dataset.add_instance(&Instance::new(1, features(&[("a", 1.0)]))),
            Err(DatasetError::AlreadyFinished)
        ));
        assert!(matches!(dataset.reset(), Err(DatasetError::AlreadyFinished)));
        Ok(())
    }

    #[test]
    fn feature_count_includes_bias_slot() -> Result<(), DatasetError> {
        for (bias, extra) in [(1.0, 1), (0.0, 0)] {
            let mut dataset = Dataset::new(bias);
            dataset.add_instance(&Instance::new(1, features(&[("b", 2.0), ("a", 1.0)])))?;
            dataset.add_instance(&Instance::new(0, features(&[("c", 1.0), ("a", 3.0)])))?;
            dataset.finish()?;
            assert_eq!(dataset.n_features(), 3 + extra);
            assert_eq!(dataset.feature_index("b"), Some(1));
            assert_eq!(dataset.feature_index("zzz"), None);
            assert_eq!(dataset.feature_index(INTERCEPT_NAME).is_some(), bias > 0.0);
        }
        Ok(())
    }

    #[test]
    fn bias_slot_resolves_to_last_index() -> Result<(), DatasetError> {
        let mut dataset = Dataset::new(1.0);
        dataset.add_instance(&Instance::new(1, features(&[("x", 2.0)])))?;
        dataset.add_instance(&Instance::new(-1, features(&[("y", 1.0)])))?;
        dataset.finish()?;
        dataset.sanity_check(SanityLevel::Records)?;
        assert_eq!(dataset.feature_name(3), Some(INTERCEPT_NAME));
        let w = Array1::from(vec![0.0, 0.0, 5.0]);
        let mut scores = Array1::zeros(2);
        dataset.product(&w.view(), &mut scores);
        assert_eq!(scores.to_vec(), vec![5.0, 5.0]);
        Ok(())
    }

    #[test]
    fn labels_are_normalised_and_validated() -> Result<(), DatasetError> {
        let mut dataset = Dataset::new(0.0);
        dataset.add_instance(&Instance::new(0, features(&[("a", 1.0)])))?;
        assert!(matches!(
            dataset.add_instance(&Instance::new(2, features(&[("a", 1.0)]))),
            Err(DatasetError::InvalidLabel { label: 2, .. })
        ));
        assert!(matches!(
            dataset.add_instance(&Instance::new(1, vec![]).with_weight(-1.0)),
            Err(DatasetError::InvalidWeight { .. })
        ));
        dataset.finish()?;
        assert_eq!(dataset.arrays()?.y.to_vec(), vec![-1.0]);
        assert_eq!(dataset.class_counts(), (0, 1));
        Ok(())
    }

    #[test]
    fn rejects_duplicates_and_reserved_names() {
        let mut dataset = Dataset::new(0.0);
        assert!(matches!(
            dataset.add_instance(&Instance::new(1, features(&[("a", 1.0), ("a", 2.0)]))),
            Err(DatasetError::DuplicateFeature { .. })
        ));
        assert!(matches!(
            dataset.add_instance(&Instance::new(1, features(&[(INTERCEPT_NAME, 1.0)]))),
            Err(DatasetError::ReservedFeatureName(_))
        ));
    }

    #[test]
    fn failed_instance_leaves_the_name_table_alone() -> Result<(), DatasetError> {
        let mut dataset = Dataset::new(1.0);
        dataset.add_instance(&Instance::new(1, features(&[("a", 1.0)])))?;
        let before = dataset.n_features();
        assert!(matches!(
            dataset.add_instance(&Instance::new(1, features(&[("ghost", 1.0), ("a", 1.0), ("a", 2.0)]))),
            Err(DatasetError::DuplicateFeature { instance: 1, .. })
        ));
        assert_eq!(dataset.n_features(), before);
        assert_eq!(dataset.feature_index("ghost"), None);
        assert_eq!(dataset.n_instances(), 1);
        Ok(())
    }

    #[test]
    fn non_finite_values_are_rejected() -> Result<(), DatasetError> {
        let mut dataset = Dataset::new(0.0);
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                dataset.add_instance(&Instance::new(1, features(&[("a", 1.0), ("b", value)]))),
                Err(DatasetError::NonFiniteValue { instance: 0, ref name, .. }) if name == "b"
            ));
        }
        assert_eq!(dataset.n_features(), 0);
        assert!(matches!(
            dataset.add_libsvm_line("1 1:inf", 1),
            Err(DatasetError::NonFiniteValue { .. })
        ));
        dataset.add_instance(&Instance::new(1, features(&[("a", 1.0)])))?;
        dataset.finish()?;
        dataset.sanity_check(SanityLevel::Records)?;
        Ok(())
    }

    #[test]
    fn binary_rows_reject_non_unit_values() -> Result<(), DatasetError> {
        let mut dataset = Dataset::binary(1.0, false)?;
        assert!(matches!(
            dataset.add_instance(&Instance::new(1, features(&[("a", 0.5)]))),
            Err(DatasetError::NonBinaryValue { .. })
        ));
        assert!(matches!(Dataset::binary(2.0, false), Err(DatasetError::InvalidBias(_))));
        Ok(())
    }

    #[test]
    fn short_index_overflow_is_reported() -> Result<(), DatasetError> {
        let mut dataset = Dataset::binary(1.0, true)?;
        let names: Vec<(String, f64)> = (0..SHORT_INDEX_LIMIT)
            .map(|i| (format!("f{i}"), 1.0))
            .collect();
        assert!(matches!(
            dataset.add_instance(&Instance::new(1, names)),
            Err(DatasetError::TooManyFeaturesForShortIndex { .. })
        ));
        Ok(())
    }

    #[test]
    fn libsvm_lines_parse_and_enforce_order() -> Result<(), DatasetError> {
        let mut dataset = Dataset::new(1.0);
        dataset.add_libsvm_line("+1 3:0.5 10:1", 1)?;
        dataset.add_libsvm_line("0 1:2", 2)?;
        assert!(matches!(
            dataset.add_libsvm_line("-1 5:1 2:1", 3),
            Err(DatasetError::UnsortedFeatures { .. })
        ));
        assert!(matches!(
            dataset.add_libsvm_line("1 a:b", 4),
            Err(DatasetError::MalformedLine { line: 4, .. })
        ));
        assert!(matches!(
            dataset.add_libsvm_line("2 1:1", 5),
            Err(DatasetError::InvalidLabel { instance: 2, label: 2 })
        ));
        assert!(matches!(
            dataset.add_libsvm_line("0.5 1:1", 6),
            Err(DatasetError::InvalidLabel { .. })
        ));
        dataset.finish()?;
        assert_eq!(dataset.n_instances(), 2);
        assert_eq!(dataset.feature_index("10"), Some(2));
        assert_eq!(dataset.class_counts(), (1, 1));
        Ok(())
    }

    #[test]
    fn reset_discards_instances() -> Result<(), DatasetError> {
        let mut dataset = Dataset::binary(0.0, false)?;
        dataset.add_instance(&Instance::new(1, features(&[("a", 1.0)])))?;
        dataset.reset()?;
        assert_eq!(dataset.n_instances(), 0);
        assert_eq!(dataset.n_features(), 0);
        assert_eq!(dataset.encoding(), FeatureEncoding::Binary);
        Ok(())
    }

    #[test]
    fn unfinished_dataset_has_no_arrays() {
        let dataset = Dataset::new(1.0);
        assert!(matches!(dataset.arrays(), Err(DatasetError::NotFinished)));
    }
}
