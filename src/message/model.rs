//! Model state exchanged with the participants.
//!
//! A [`ModelState`] is a versioned, named collection of typed parameters.
//! Only [`Parameter::Float`] parameters take part in weighted aggregation;
//! [`Parameter::Index`] parameters (_e.g._ embedding indices) are carried
//! over unchanged.

use std::collections::{btree_map, BTreeMap};

use derive_more::Display;
use thiserror::Error;

/// The schema version of the [`ModelState`] produced by this crate.
pub const MODEL_STATE_VERSION: u16 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors related to an invalid model state.
pub enum ModelStateError {
    #[error("unsupported model state version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("parameter shape {shape:?} requires {expected} values, got {found}")]
    InvalidShape {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },
    #[error("parameter shape {0:?} has too many elements")]
    ShapeOverflow(Vec<usize>),
}

/// The kind of a [`Parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ParameterKind {
    #[display(fmt = "float")]
    Float,
    #[display(fmt = "index")]
    Index,
}

/// A named tensor of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Parameter {
    /// A floating point tensor, subject to aggregation.
    Float { shape: Vec<usize>, values: Vec<f64> },
    /// An integer tensor, never aggregated.
    Index { shape: Vec<usize>, values: Vec<i64> },
}

impl Parameter {
    /// Create a floating point parameter.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the shape.
    pub fn float(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, ModelStateError> {
        check_shape(&shape, values.len())?;
        Ok(Self::Float { shape, values })
    }

    /// Create an integer parameter.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the shape.
    pub fn index(shape: Vec<usize>, values: Vec<i64>) -> Result<Self, ModelStateError> {
        check_shape(&shape, values.len())?;
        Ok(Self::Index { shape, values })
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float { shape, .. } | Self::Index { shape, .. } => shape,
        }
    }

    pub fn kind(&self) -> ParameterKind {
        match self {
            Self::Float { .. } => ParameterKind::Float,
            Self::Index { .. } => ParameterKind::Index,
        }
    }

    /// Check that the number of values matches the shape.
    pub fn check(&self) -> Result<(), ModelStateError> {
        match self {
            Self::Float { shape, values } => check_shape(shape, values.len()),
            Self::Index { shape, values } => check_shape(shape, values.len()),
        }
    }
}

fn check_shape(shape: &[usize], found: usize) -> Result<(), ModelStateError> {
    let expected = shape
        .iter()
        .try_fold(1_usize, |len, dim| len.checked_mul(*dim))
        .ok_or_else(|| ModelStateError::ShapeOverflow(shape.to_vec()))?;
    if expected != found {
        return Err(ModelStateError::InvalidShape {
            shape: shape.to_vec(),
            expected,
            found,
        });
    }
    Ok(())
}

/// A versioned collection of named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    version: u16,
    parameters: BTreeMap<String, Parameter>,
}

impl Default for ModelState {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelState {
    /// Create an empty model state with the current schema version.
    pub fn new() -> Self {
        Self {
            version: MODEL_STATE_VERSION,
            parameters: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Insert a parameter, returning the parameter previously stored
    /// under the same name.
    pub fn insert(&mut self, name: impl Into<String>, parameter: Parameter) -> Option<Parameter> {
        self.parameters.insert(name.into(), parameter)
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Parameter> {
        self.parameters.iter()
    }

    /// Check that this state was produced with a supported schema and that
    /// all its parameters are well formed.
    pub fn validate(&self) -> Result<(), ModelStateError> {
        if self.version != MODEL_STATE_VERSION {
            return Err(ModelStateError::UnsupportedVersion {
                found: self.version,
                expected: MODEL_STATE_VERSION,
            });
        }
        self.parameters.values().try_for_each(Parameter::check)
    }
}
