//! # Sparse affine models
//!
//! A [`LinearModel`] is an intercept plus a sparse map from feature key to
//! coefficient. Feature keys are composite: either a bare `name`, or `name`
//! and `term` joined by [`TERM_SEPARATOR`], a byte that cannot occur in
//! legitimate names or terms.
//!
//! Models travel between processes as lists of `(name, term, value)`
//! triples. The intercept rides along in that list under a caller-chosen
//! sentinel key, but inside a `LinearModel` it is always held separately and
//! never appears among the coefficients.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Joins a feature name and its term into one coefficient key.
pub const TERM_SEPARATOR: char = '\u{1}';

/// Sentinel key under which the intercept is exchanged.
pub const INTERCEPT_NAME: &str = "(INTERCEPT)";

#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("model has no intercept entry under key '{0}'")]
    MissingIntercept(String),

    #[error("entry {index} of the model has an empty feature name")]
    EmptyName { index: usize },

    #[error("feature '{key}' has a non-finite value ({value})")]
    NonFiniteValue { key: String, value: f64 },

    #[error("feature '{key}' appears more than once in the model")]
    DuplicateKey { key: String },
}

/// One coefficient in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTriple {
    pub name: String,
    #[serde(default)]
    pub term: String,
    pub value: f64,
}

impl FeatureTriple {
    pub fn new(name: impl Into<String>, term: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            term: term.into(),
            value,
        }
    }

    /// The composite coefficient key for this triple.
    pub fn key(&self) -> String {
        feature_key(&self.name, &self.term)
    }
}

/// Builds the composite key for a `(name, term)` pair.
pub fn feature_key(name: &str, term: &str) -> String {
    if term.is_empty() {
        name.to_string()
    } else {
        let mut key = String::with_capacity(name.len() + term.len() + 1);
        key.push_str(name);
        key.push(TERM_SEPARATOR);
        key.push_str(term);
        key
    }
}

/// Splits a composite key back into `(name, term)`.
pub fn split_feature_key(key: &str) -> (&str, &str) {
    key.split_once(TERM_SEPARATOR).unwrap_or((key, ""))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearModel {
    intercept: f64,
    coefficients: HashMap<String, f64>,
}

impl LinearModel {
    /// A model with the given intercept and no coefficients.
    pub fn new(intercept: f64) -> Self {
        Self {
            intercept,
            coefficients: HashMap::new(),
        }
    }

    /// Builds a model from an intercept and a coefficient map. An entry
    /// stored under [`INTERCEPT_NAME`] is dropped from the coefficients.
    pub fn with_coefficients(intercept: f64, mut coefficients: HashMap<String, f64>) -> Self {
        coefficients.remove(INTERCEPT_NAME);
        Self {
            intercept,
            coefficients,
        }
    }

    /// Builds a model from a flat map that carries the intercept under
    /// `intercept_key`.
    pub fn from_map(
        intercept_key: &str,
        map: &HashMap<String, f64>,
    ) -> Result<Self, FormatError> {
        let intercept = *map
            .get(intercept_key)
            .ok_or_else(|| FormatError::MissingIntercept(intercept_key.to_string()))?;
        let coefficients = map
            .iter()
            .filter(|(key, _)| key.as_str() != intercept_key)
            .map(|(key, value)| (key.clone(), *value))
            .collect();
        Ok(Self {
            intercept,
            coefficients,
        })
    }

    /// Parses the wire form. The list must contain exactly one intercept
    /// entry, every name must be non-empty, every value finite, and no key
    /// may repeat.
    pub fn from_triples(
        intercept_key: &str,
        triples: &[FeatureTriple],
    ) -> Result<Self, FormatError> {
        let mut intercept = None;
        let mut coefficients = HashMap::with_capacity(triples.len());
        for (index, triple) in triples.iter().enumerate() {
            if triple.name.is_empty() {
                return Err(FormatError::EmptyName { index });
            }
            let key = triple.key();
            if !triple.value.is_finite() {
                return Err(FormatError::NonFiniteValue {
                    key,
                    value: triple.value,
                });
            }
            if key == intercept_key {
                if intercept.replace(triple.value).is_some() {
                    return Err(FormatError::DuplicateKey { key });
                }
            } else if coefficients.insert(key.clone(), triple.value).is_some() {
                return Err(FormatError::DuplicateKey { key });
            }
        }
        let intercept =
            intercept.ok_or_else(|| FormatError::MissingIntercept(intercept_key.to_string()))?;
        Ok(Self {
            intercept,
            coefficients,
        })
    }

    /// Wire form: the intercept first, then coefficients in key order.
    pub fn to_triples(&self, intercept_key: &str) -> Vec<FeatureTriple> {
        let (name, term) = split_feature_key(intercept_key);
        let mut triples = Vec::with_capacity(self.coefficients.len() + 1);
        triples.push(FeatureTriple::new(name, term, self.intercept));
        let mut keys: Vec<&String> = self.coefficients.keys().collect();
        keys.sort();
        for key in keys {
            let (name, term) = split_feature_key(key);
            triples.push(FeatureTriple::new(name, term, self.coefficients[key]));
        }
        triples
    }

    /// Flat map form, with the intercept stored under `intercept_key`.
    pub fn to_map(&self, intercept_key: &str) -> HashMap<String, f64> {
        let mut map = self.coefficients.clone();
        map.insert(intercept_key.to_string(), self.intercept);
        map
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn set_intercept(&mut self, intercept: f64) {
        self.intercept = intercept;
    }

    pub fn coefficients(&self) -> &HashMap<String, f64> {
        &self.coefficients
    }

    /// Coefficient for `key`; absent keys read as zero.
    pub fn coefficient(&self, key: &str) -> f64 {
        self.coefficients.get(key).copied().unwrap_or(0.0)
    }

    pub fn set_coefficient(&mut self, key: impl Into<String>, value: f64) {
        self.coefficients.insert(key.into(), value);
    }

    /// Number of stored coefficients, excluding the intercept.
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Applies `f` to every coefficient, then drops the ones it maps to zero.
    pub fn shrink_coefficients<F>(&mut self, mut f: F)
    where
        F: FnMut(&str, f64) -> f64,
    {
        self.coefficients.retain(|key, value| {
            *value = f(key, *value);
            *value != 0.0
        });
    }

    /// `intercept *= a` and every coefficient `*= a`.
    pub fn rescale(&mut self, a: f64) {
        self.intercept *= a;
        for value in self.coefficients.values_mut() {
            *value *= a;
        }
    }

    /// `self := a * self + b * other` over the union of keys.
    pub fn linear_combine(&mut self, a: f64, b: f64, other: &LinearModel) {
        self.combine(a, b, other, |_| None);
    }

    /// Like [`linear_combine`](Self::linear_combine), but a key present in
    /// `per_key_b` uses that multiplier instead of `b`. The intercept always
    /// uses `b`.
    pub fn linear_combine_weighted(
        &mut self,
        a: f64,
        b: f64,
        other: &LinearModel,
        per_key_b: &HashMap<String, f64>,
    ) {
        self.combine(a, b, other, |key| per_key_b.get(key).copied());
    }

    fn combine<F>(&mut self, a: f64, b: f64, other: &LinearModel, per_key: F)
    where
        F: Fn(&str) -> Option<f64>,
    {
        self.intercept = a * self.intercept + b * other.intercept;
        for (key, value) in self.coefficients.iter_mut() {
            let weight = per_key(key).unwrap_or(b);
            *value = a * *value + weight * other.coefficient(key);
        }
        for (key, value) in &other.coefficients {
            if self.coefficients.contains_key(key) {
                continue;
            }
            let weight = per_key(key).unwrap_or(b);
            if weight != 0.0 {
                self.coefficients.insert(key.clone(), weight * value);
            }
        }
    }

    /// Intercept with the click-replication bias removed.
    ///
    /// When every positive instance was replicated `r` times before fitting,
    /// the fitted intercept overstates the log-odds; the corrected value is
    /// `-ln(r - 1 + r * exp(-intercept))`, which equals the intercept at `r = 1`.
    pub fn corrected_intercept(&self, click_replicates: u32) -> f64 {
        if click_replicates <= 1 {
            return self.intercept;
        }
        let r = f64::from(click_replicates);
        -((r - 1.0) + r * (-self.intercept).exp()).ln()
    }

    /// Linear predictor `intercept' + sum(coefficient[k] * value[k])`.
    pub fn eval<'a, I>(&self, features: I, click_replicates: u32) -> f64
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        features
            .into_iter()
            .fold(self.corrected_intercept(click_replicates), |acc, (key, value)| {
                acc + self.coefficient(key) * value
            })
    }

    /// `max(|intercept|, max |coefficient|)`.
    pub fn max_abs_value(&self) -> f64 {
        self.coefficients
            .values()
            .fold(self.intercept.abs(), |acc, value| acc.max(value.abs()))
    }

    /// Removes every coefficient whose key contains `substring`.
    pub fn filter_out(&mut self, substring: &str) {
        self.coefficients.retain(|key, _| !key.contains(substring));
    }

    /// Resets to the zero model.
    pub fn clear(&mut self) {
        self.intercept = 0.0;
        self.coefficients.clear();
    }
}

impl fmt::Display for LinearModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{INTERCEPT_NAME}={}", self.intercept)?;
        let mut keys: Vec<&String> = self.coefficients.keys().collect();
        keys.sort();
        for key in keys {
            write!(f, " {}={}", key.replace(TERM_SEPARATOR, ":"), self.coefficients[key])?;
        }
        Ok(())
    }
}
