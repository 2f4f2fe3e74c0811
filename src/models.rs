//! Data types and associated functions and methods

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::ReductionError;
use crate::operation::Element;

/// Supported numerical data types
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    /// [i32]
    Int32,
    /// [i64]
    Int64,
    /// [u32]
    Uint32,
    /// [u64]
    Uint64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
}

impl DType {
    /// Returns the size of the associated type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Int32 => std::mem::size_of::<i32>(),
            Self::Int64 => std::mem::size_of::<i64>(),
            Self::Uint32 => std::mem::size_of::<u32>(),
            Self::Uint64 => std::mem::size_of::<u64>(),
            Self::Float32 => std::mem::size_of::<f32>(),
            Self::Float64 => std::mem::size_of::<f64>(),
        }
    }
}

/// A named dimension of an array.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Dimension {
    /// Dimension name, e.g. "time"
    pub name: String,
    /// Number of elements along the dimension
    pub size: usize,
}

impl Dimension {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// How NaN elements of floating point data are treated by a reduction.
///
/// Integer data never contains NaN, so the policy has no effect on it.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NanPolicy {
    /// NaNs are excluded from the reduction, like declared missing values.
    #[default]
    Ignore,
    /// Any NaN contributing to an output cell makes that cell NaN.
    Propagate,
}

/// Built-in reduction operators.
///
/// These are the operators a worker process knows how to run. The library accepts any
/// [Reducer](crate::operation::Reducer) on the thread backend.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    #[default]
    Max,
    Min,
    Sum,
}

impl Operation {
    /// Look up a built-in operator by its reducer name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            "sum" => Some(Self::Sum),
            _ => None,
        }
    }
}

/// Partial result of reducing one chunk.
///
/// Values are stored as native-endian bytes alongside the number of non-missing elements that
/// contributed to each output cell. A cell with a count of zero has no value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PartialResult {
    /// Id of the chunk this result was computed from
    pub chunk: usize,
    /// Data type of the values
    pub dtype: DType,
    /// Shape of the result
    pub shape: Vec<usize>,
    /// Values, one per cell in row-major order
    pub body: Bytes,
    /// Number of non-missing elements operated on, one per cell
    pub counts: Vec<i64>,
}

impl PartialResult {
    /// Build a PartialResult from an array of (value, count) cells.
    pub fn from_cells<T: Element>(
        chunk: usize,
        dtype: DType,
        cells: &ndarray::ArrayD<(T, i64)>,
    ) -> Self {
        let values = cells.iter().map(|(value, _)| *value).collect::<Vec<T>>();
        let counts = cells.iter().map(|(_, count)| *count).collect::<Vec<i64>>();
        PartialResult {
            chunk,
            dtype,
            shape: cells.shape().to_vec(),
            body: Bytes::copy_from_slice(zerocopy::AsBytes::as_bytes(values.as_slice())),
            counts,
        }
    }

    /// Decode the values into a typed `Vec`.
    ///
    /// The body carries no alignment guarantee once it has crossed a process boundary, so values
    /// are read out element by element.
    pub fn values<T: Element>(&self) -> Result<Vec<T>, ReductionError> {
        let size = std::mem::size_of::<T>();
        if self.body.len() % size != 0 || self.body.len() / size != self.counts.len() {
            return Err(ReductionError::FromBytes {
                type_name: std::any::type_name::<T>(),
            });
        }
        self.body
            .chunks_exact(size)
            .map(|bytes| {
                <T as zerocopy::FromBytes>::read_from(bytes).ok_or(ReductionError::FromBytes {
                    type_name: std::any::type_name::<T>(),
                })
            })
            .collect()
    }

    /// Decode into an array of (value, count) cells.
    pub fn to_cells<T: Element>(&self) -> Result<ndarray::ArrayD<(T, i64)>, ReductionError> {
        let values = self.values::<T>()?;
        let cells = values.into_iter().zip(self.counts.iter().copied()).collect();
        Ok(ndarray::ArrayD::from_shape_vec(self.shape.clone(), cells)?)
    }
}
