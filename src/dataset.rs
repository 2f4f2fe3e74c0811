//! Logical datasets built from several array files.
//!
//! The files are virtually concatenated along one shared dimension. Every file must agree with
//! the first on the variable, data type, dimension names and order, and the size of every other
//! dimension.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ReductionError;
use crate::format::{read_header, ArrayHeader};
use crate::models::{DType, Dimension};
use crate::types::{ByteOrder, DValue, Missing};

/// One file's contribution to a [LogicalDataset].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileSpan {
    /// Path of the file
    pub path: PathBuf,
    /// Offset of the file's first element along the concatenation dimension
    pub start: usize,
    /// Number of elements along the concatenation dimension
    pub length: usize,
    /// Byte offset of the element data
    pub data_offset: u64,
    /// Byte order of the element data
    pub byte_order: ByteOrder,
    /// The file's "history" attribute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<String>,
}

/// An ordered set of array files concatenated along one dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct LogicalDataset {
    variable: String,
    dtype: DType,
    /// Dimensions of the whole dataset. The concatenation dimension has the total length.
    dimensions: Vec<Dimension>,
    concat_axis: usize,
    missing: Option<Missing<DValue>>,
    attributes: BTreeMap<String, String>,
    spans: Vec<FileSpan>,
}

impl LogicalDataset {
    /// Read the headers of `paths` and build a dataset from them.
    ///
    /// # Arguments
    ///
    /// * `paths`: Array files, in concatenation order
    /// * `concat_dim`: Name of the concatenation dimension. Defaults to the first dimension of the
    ///   first file.
    pub fn open(paths: &[PathBuf], concat_dim: Option<&str>) -> Result<Self, ReductionError> {
        let headers = paths
            .iter()
            .map(|path| {
                let (header, data_offset) = read_header(path)?;
                Ok((path.clone(), header, data_offset))
            })
            .collect::<Result<Vec<_>, ReductionError>>()?;
        Self::from_headers(headers, concat_dim)
    }

    /// Build a dataset from headers that have already been read.
    ///
    /// Each entry holds a path, its header and the byte offset of its data.
    pub fn from_headers(
        headers: Vec<(PathBuf, ArrayHeader, u64)>,
        concat_dim: Option<&str>,
    ) -> Result<Self, ReductionError> {
        let Some((first_path, first, _)) = headers.first() else {
            return Err(ReductionError::EmptyDataset);
        };
        let concat_axis = match concat_dim {
            Some(name) => first.axis_of(name).ok_or_else(|| {
                schema_mismatch(first_path, format!("no dimension named {}", name))
            })?,
            None => 0,
        };
        let mut spans = Vec::with_capacity(headers.len());
        let mut start = 0;
        for (path, header, data_offset) in &headers {
            check_schema(first, header, concat_axis)
                .map_err(|reason| schema_mismatch(path, reason))?;
            let length = header.dimensions[concat_axis].size;
            spans.push(FileSpan {
                path: path.clone(),
                start,
                length,
                data_offset: *data_offset,
                byte_order: header.byte_order,
                history: header.attributes.get("history").cloned(),
            });
            start += length;
        }
        let mut dimensions = first.dimensions.clone();
        dimensions[concat_axis].size = start;
        Ok(Self {
            variable: first.variable.clone(),
            dtype: first.dtype,
            dimensions,
            concat_axis,
            missing: first.missing.clone(),
            attributes: first.attributes.clone(),
            spans,
        })
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Extent of each dimension of the whole dataset.
    pub fn shape(&self) -> Vec<usize> {
        self.dimensions.iter().map(|d| d.size).collect()
    }

    pub fn concat_axis(&self) -> usize {
        self.concat_axis
    }

    pub fn concat_dim(&self) -> &str {
        &self.dimensions[self.concat_axis].name
    }

    /// Missing data descriptor of the first file.
    pub fn missing(&self) -> Option<&Missing<DValue>> {
        self.missing.as_ref()
    }

    /// Attributes of the first file.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn spans(&self) -> &[FileSpan] {
        &self.spans
    }

    /// Total length along the concatenation dimension.
    pub fn len(&self) -> usize {
        self.dimensions[self.concat_axis].size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes of one slice along the concatenation dimension.
    pub fn slice_size(&self) -> usize {
        let elements: usize = self
            .dimensions
            .iter()
            .enumerate()
            .filter(|(axis, _)| *axis != self.concat_axis)
            .map(|(_, d)| d.size)
            .product();
        elements * self.dtype.size_of()
    }

    /// Resolve dimension names to axes, in increasing order.
    ///
    /// No names means every dimension.
    pub fn axes_of(&self, names: &[String]) -> Result<Vec<usize>, ReductionError> {
        if names.is_empty() {
            return Ok((0..self.dimensions.len()).collect());
        }
        let mut axes = names
            .iter()
            .map(|name| {
                self.dimensions
                    .iter()
                    .position(|d| &d.name == name)
                    .ok_or_else(|| ReductionError::UnknownDimension { name: name.clone() })
            })
            .collect::<Result<Vec<usize>, _>>()?;
        axes.sort_unstable();
        axes.dedup();
        Ok(axes)
    }
}

fn schema_mismatch(path: &Path, reason: String) -> ReductionError {
    ReductionError::SchemaMismatch {
        path: path.to_path_buf(),
        reason,
    }
}

/// Compare a header with the first header of the dataset.
fn check_schema(
    first: &ArrayHeader,
    header: &ArrayHeader,
    concat_axis: usize,
) -> Result<(), String> {
    if header.variable != first.variable {
        return Err(format!(
            "variable {} differs from {}",
            header.variable, first.variable
        ));
    }
    if header.dtype != first.dtype {
        return Err(format!("dtype {} differs from {}", header.dtype, first.dtype));
    }
    let names = |h: &ArrayHeader| h.dimensions.iter().map(|d| d.name.clone()).collect::<Vec<_>>();
    if names(header) != names(first) {
        return Err(format!(
            "dimensions {:?} differ from {:?}",
            names(header),
            names(first)
        ));
    }
    for (axis, (dim, first_dim)) in header.dimensions.iter().zip(&first.dimensions).enumerate() {
        if axis != concat_axis && dim.size != first_dim.size {
            return Err(format!(
                "dimension {} has size {}, expected {}",
                dim.name, dim.size, first_dim.size
            ));
        }
    }
    Ok(())
}
