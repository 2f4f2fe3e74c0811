//! Array file format.
//!
//! An array file holds one variable: an 8 byte magic, the header length as a little endian `u64`,
//! a JSON [ArrayHeader], zero padding up to a multiple of 8 bytes, then the element data in C
//! order and in the byte order declared by the header.
//!
//! Data starts on an 8 byte boundary, so any element range can be read without knowing about the
//! header, given the data offset.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::ReductionError;
use crate::models::{DType, Dimension};
use crate::operation::Element;
use crate::types::{ByteOrder, DValue, Missing};

/// Magic bytes at the start of every array file.
pub const MAGIC: &[u8; 8] = b"CHRDARR1";

/// Size of the magic plus the header length.
const PREAMBLE_SIZE: u64 = 16;

/// Headers larger than this are assumed to be garbage.
const MAX_HEADER_SIZE: u64 = 16 * 1024 * 1024;

/// Header of an array file
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_header"))]
pub struct ArrayHeader {
    /// Name of the variable, e.g. "tas"
    #[validate(length(min = 1, message = "variable must not be empty"))]
    pub variable: String,
    /// Data type of the elements
    pub dtype: DType,
    /// Byte order of the elements
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Dimensions, outermost first
    #[validate(
        length(min = 1, message = "dimensions must not be empty"),
        custom = "validate_dimensions"
    )]
    pub dimensions: Vec<Dimension>,
    /// Missing data descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Missing<DValue>>,
    /// Free form string attributes, e.g. "units" or "history"
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// Validate dimension names
fn validate_dimensions(dimensions: &[Dimension]) -> Result<(), ValidationError> {
    for (index, dimension) in dimensions.iter().enumerate() {
        if dimension.name.is_empty() {
            return Err(ValidationError::new("dimension names must not be empty"));
        }
        if dimensions[..index].iter().any(|d| d.name == dimension.name) {
            let mut error = ValidationError::new("dimension names must be unique");
            error.add_param("name".into(), &dimension.name);
            return Err(error);
        }
    }
    Ok(())
}

/// Validate the header as a whole
fn validate_header(header: &ArrayHeader) -> Result<(), ValidationError> {
    if let Some(missing) = &header.missing {
        missing.validate(header.dtype)?;
    }
    Ok(())
}

impl ArrayHeader {
    /// Return a native byte order header without missing data or attributes.
    pub fn new(variable: impl Into<String>, dtype: DType, dimensions: Vec<Dimension>) -> Self {
        Self {
            variable: variable.into(),
            dtype,
            byte_order: crate::types::byte_order::NATIVE_BYTE_ORDER,
            dimensions,
            missing: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_missing(mut self, missing: Missing<DValue>) -> Self {
        self.missing = Some(missing);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Extent of each dimension.
    pub fn shape(&self) -> Vec<usize> {
        self.dimensions.iter().map(|d| d.size).collect()
    }

    /// Number of elements in the array.
    pub fn num_elements(&self) -> usize {
        self.dimensions.iter().map(|d| d.size).product()
    }

    /// Index of the dimension called `name`.
    pub fn axis_of(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d.name == name)
    }
}

/// Offset of the element data for a header of `header_len` bytes.
fn data_offset(header_len: u64) -> u64 {
    (PREAMBLE_SIZE + header_len).next_multiple_of(8)
}

/// Read and validate the header of an array file.
///
/// Returns the header and the byte offset of the element data. The data itself is not read, so a
/// truncated data section is only detected when the affected range is loaded.
pub fn read_header(path: &Path) -> Result<(ArrayHeader, u64), ReductionError> {
    let mut file = File::open(path).map_err(|err| ReductionError::io(path, 0, 0, err))?;
    let mut preamble = [0_u8; PREAMBLE_SIZE as usize];
    match file.read_exact(&mut preamble) {
        Ok(()) => (),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(ReductionError::NotAnArrayFile {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(ReductionError::io(path, 0, PREAMBLE_SIZE, err)),
    }
    if &preamble[..8] != MAGIC {
        return Err(ReductionError::NotAnArrayFile {
            path: path.to_path_buf(),
        });
    }
    let mut header_len = [0_u8; 8];
    header_len.copy_from_slice(&preamble[8..]);
    let header_len = u64::from_le_bytes(header_len);
    if header_len > MAX_HEADER_SIZE {
        return Err(ReductionError::NotAnArrayFile {
            path: path.to_path_buf(),
        });
    }
    let mut json = vec![0_u8; usize::try_from(header_len)?];
    file.read_exact(&mut json)
        .map_err(|err| ReductionError::io(path, PREAMBLE_SIZE, header_len, err))?;
    let header: ArrayHeader =
        serde_json::from_slice(&json).map_err(|source| ReductionError::HeaderDecode {
            path: path.to_path_buf(),
            source,
        })?;
    header
        .validate()
        .map_err(|source| ReductionError::InvalidHeader {
            path: path.to_path_buf(),
            source,
        })?;
    Ok((header, data_offset(header_len)))
}

/// Write an array file.
///
/// `data` holds the elements in C order and native byte order. They are written in the byte
/// order of the header.
pub fn write_array_file<T: Element>(
    path: &Path,
    header: &ArrayHeader,
    data: &[T],
) -> Result<(), ReductionError> {
    header
        .validate()
        .map_err(|source| ReductionError::InvalidHeader {
            path: path.to_path_buf(),
            source,
        })?;
    if std::mem::size_of::<T>() != header.dtype.size_of() {
        return Err(ReductionError::FromBytes {
            type_name: std::any::type_name::<T>(),
        });
    }
    if data.len() != header.num_elements() {
        return Err(ReductionError::ShapeInvalid(ndarray::ShapeError::from_kind(
            ndarray::ErrorKind::IncompatibleShape,
        )));
    }
    let json = serde_json::to_vec(header)?;
    let header_len = u64::try_from(json.len())?;
    let offset = data_offset(header_len);
    let padding = usize::try_from(offset - PREAMBLE_SIZE - header_len)?;
    let swapped;
    let data = if header.byte_order.is_native() {
        data
    } else {
        swapped = data.iter().map(|x| x.swap_bytes()).collect::<Vec<T>>();
        &swapped[..]
    };
    let body = zerocopy::AsBytes::as_bytes(data);
    let total = offset + u64::try_from(body.len())?;
    let write = || -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&header_len.to_le_bytes())?;
        writer.write_all(&json)?;
        writer.write_all(&[0_u8; 8][..padding])?;
        writer.write_all(body)?;
        writer.flush()
    };
    write().map_err(|err| ReductionError::io(path, 0, total, err))
}
