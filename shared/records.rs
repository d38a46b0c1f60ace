//! Record shapes exchanged with the outside world, and their readers and
//! writers.
//!
//! Records are JSON lines, gzip-compressed when the path ends in `.gz`.
//! The single-block fit command also reads and writes flat `key=value`
//! text maps.

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::consensus::evaluate::TrajectoryRow;
use crate::dataset::Instance;
use crate::model::{
    FeatureTriple, FormatError, INTERCEPT_NAME, LinearModel, feature_key, split_feature_key,
};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}:{line}: {source}", path.display())]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("{}:{line}: {source}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        #[source]
        source: FormatError,
    },

    #[error("{}:{line}: expected key=value, got '{text}'", path.display())]
    MalformedPair {
        path: PathBuf,
        line: usize,
        text: String,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl RecordError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> RecordError + '_ {
        move |source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// One training or test example on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Partition key, or an item key for grouped data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub response: i32,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub offset: f64,
    pub features: Vec<FeatureTriple>,
}

impl InstanceRecord {
    /// Canonical instance; with `binary` every feature value reads as 1.
    pub fn to_instance(&self, binary: bool) -> Instance {
        let features = self
            .features
            .iter()
            .map(|triple| (triple.key(), if binary { 1.0 } else { triple.value }))
            .collect();
        Instance::new(self.response, features)
            .with_weight(self.weight)
            .with_offset(self.offset)
    }

    pub fn from_instance(key: Option<String>, instance: &Instance) -> Self {
        let features = instance
            .features
            .iter()
            .map(|(feature, value)| {
                let (name, term) = split_feature_key(feature);
                FeatureTriple::new(name, term, *value)
            })
            .collect();
        Self {
            key,
            response: instance.label,
            weight: instance.weight,
            offset: instance.offset,
            features,
        }
    }
}

/// A named model in triple-list form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub key: String,
    pub model: Vec<FeatureTriple>,
}

impl ModelRecord {
    pub fn new(key: impl Into<String>, model: &LinearModel) -> Self {
        Self {
            key: key.into(),
            model: model.to_triples(INTERCEPT_NAME),
        }
    }

    pub fn to_model(&self) -> Result<LinearModel, FormatError> {
        LinearModel::from_triples(INTERCEPT_NAME, &self.model)
    }
}

/// A per-item model with its optional posterior variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemModelRecord {
    pub key: String,
    pub model: Vec<FeatureTriple>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub posterior_var: Vec<FeatureTriple>,
}

impl ItemModelRecord {
    pub fn new(key: impl Into<String>, model: &LinearModel, variance: Option<&LinearModel>) -> Self {
        Self {
            key: key.into(),
            model: model.to_triples(INTERCEPT_NAME),
            posterior_var: variance.map_or_else(Vec::new, |v| v.to_triples(INTERCEPT_NAME)),
        }
    }
}

/// Scores of one test record, per grid label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub key: String,
    pub response: i32,
    pub weight: f64,
    pub pred: BTreeMap<String, f64>,
}

/// Mean log-likelihood of one model label over a test set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoglikRecord {
    pub key: String,
    pub test_loglik: f64,
    pub count: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambdaRho {
    pub lambda: f64,
    pub rho: f64,
}

/// A feature-specific lambda.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaOverride {
    pub name: String,
    #[serde(default)]
    pub term: String,
    pub lambda: f64,
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Opens a text file, decompressing `.gz` transparently.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead + Send>, RecordError> {
    let file = File::open(path).map_err(RecordError::io(path))?;
    if is_gzip(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Text output, gzip-compressed or plain. Call [`TextWriter::finish`] so
/// buffer and gzip trailer errors surface instead of being lost in `Drop`.
pub enum TextWriter {
    Plain(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
}

impl TextWriter {
    /// Flushes the buffer and, for gzip output, writes the trailer.
    pub fn finish(self) -> io::Result<()> {
        match self {
            TextWriter::Plain(mut writer) => writer.flush(),
            TextWriter::Gzip(writer) => {
                let encoder = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
                encoder.finish()?.flush()
            }
        }
    }
}

impl Write for TextWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TextWriter::Plain(writer) => writer.write(buf),
            TextWriter::Gzip(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TextWriter::Plain(writer) => writer.flush(),
            TextWriter::Gzip(writer) => writer.flush(),
        }
    }
}

/// Creates a text file (and its parent directories), compressing when the
/// path ends in `.gz`.
pub fn create_text(path: &Path) -> Result<TextWriter, RecordError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(RecordError::io(parent))?;
    }
    let file = File::create(path).map_err(RecordError::io(path))?;
    if is_gzip(path) {
        Ok(TextWriter::Gzip(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(TextWriter::Plain(BufWriter::new(file)))
    }
}

/// Reads every record of a JSON-lines file. Blank lines are skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, RecordError> {
    let reader = open_text(path)?;
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(RecordError::io(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| RecordError::Json {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

pub fn write_jsonl<'a, T, I>(path: &Path, records: I) -> Result<(), RecordError>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut writer = create_text(path)?;
    for (index, record) in records.into_iter().enumerate() {
        serde_json::to_writer(&mut writer, record).map_err(|source| RecordError::Json {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        writer.write_all(b"\n").map_err(RecordError::io(path))?;
    }
    writer.finish().map_err(RecordError::io(path))
}

/// Reads model records and parses each into a [`LinearModel`].
pub fn read_models(path: &Path) -> Result<Vec<(String, LinearModel)>, RecordError> {
    read_jsonl::<ModelRecord>(path)?
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let model = record.to_model().map_err(|source| RecordError::Format {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
            Ok((record.key, model))
        })
        .collect()
}

/// Reads item model records; the posterior variances are not needed to
/// score and are dropped.
pub fn read_item_models(path: &Path) -> Result<HashMap<String, LinearModel>, RecordError> {
    read_jsonl::<ItemModelRecord>(path)?
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let model =
                LinearModel::from_triples(INTERCEPT_NAME, &record.model).map_err(|source| RecordError::Format {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source,
                })?;
            Ok((record.key, model))
        })
        .collect()
}

/// Reads a lambda-override file into a map keyed by feature key.
pub fn read_lambda_overrides(path: &Path) -> Result<HashMap<String, f64>, RecordError> {
    Ok(read_jsonl::<LambdaOverride>(path)?
        .into_iter()
        .map(|entry| (feature_key(&entry.name, &entry.term), entry.lambda))
        .collect())
}

/// Reads a `key=value` map. Blank lines and `#` comments are skipped.
pub fn read_pairs(path: &Path) -> Result<HashMap<String, f64>, RecordError> {
    let reader = open_text(path)?;
    let mut pairs = HashMap::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(RecordError::io(path))?;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let parsed = text
            .rsplit_once('=')
            .and_then(|(key, value)| Some((key, value.trim().parse::<f64>().ok()?)));
        match parsed {
            Some((key, value)) if !key.is_empty() => {
                pairs.insert(key.to_string(), value);
            }
            _ => {
                return Err(RecordError::MalformedPair {
                    path: path.to_path_buf(),
                    line: index + 1,
                    text: text.to_string(),
                });
            }
        }
    }
    Ok(pairs)
}

/// Writes `key=value` lines in key order.
pub fn write_pairs<K, I>(path: &Path, pairs: I) -> Result<(), RecordError>
where
    K: AsRef<str>,
    I: IntoIterator<Item = (K, f64)>,
{
    let mut sorted: Vec<(K, f64)> = pairs.into_iter().collect();
    sorted.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));
    let mut writer = create_text(path)?;
    for (key, value) in sorted {
        writeln!(writer, "{}={value}", key.as_ref()).map_err(RecordError::io(path))?;
    }
    writer.finish().map_err(RecordError::io(path))
}

/// Writes the per-iteration trajectory as a tab-separated table.
pub fn write_trajectory(path: &Path, rows: &[TrajectoryRow]) -> Result<(), RecordError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(create_text(path)?);
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| RecordError::Io {
            path: path.to_path_buf(),
            source: e.into_error(),
        })?
        .finish()
        .map_err(RecordError::io(path))
}
