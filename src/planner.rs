//! Chunk planning.
//!
//! The logical dataset is split along its concatenation dimension into consecutive chunks of a
//! fixed length. A chunk may cover part of a file or several files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dataset::LogicalDataset;
use crate::error::ReductionError;
use crate::types::ByteOrder;

/// The part of one file covered by a chunk.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChunkPiece {
    /// Index of the file in the dataset
    pub span: usize,
    /// Path of the file
    pub path: PathBuf,
    /// First element along the concatenation dimension, relative to the file
    pub local_start: usize,
    /// Number of elements along the concatenation dimension
    pub length: usize,
    /// Offset of this piece within the chunk
    pub chunk_offset: usize,
    /// Length of the whole file along the concatenation dimension
    pub file_length: usize,
    /// Byte offset of the file's element data
    pub data_offset: u64,
    /// Byte order of the file's element data
    pub byte_order: ByteOrder,
}

/// A contiguous range of the logical dataset, reduced by one task.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChunkDescriptor {
    /// Position of the chunk in the plan
    pub id: usize,
    /// First element along the concatenation dimension
    pub start: usize,
    /// Number of elements along the concatenation dimension
    pub length: usize,
    /// File ranges making up the chunk, in order
    pub pieces: Vec<ChunkPiece>,
}

/// Partition a dataset into chunks of `chunk_size` elements along its concatenation dimension.
///
/// The last chunk may be shorter. Chunks are ordered by start and numbered from zero. A dataset
/// with no elements along the concatenation dimension has no chunks.
pub fn plan(
    dataset: &LogicalDataset,
    chunk_size: usize,
) -> Result<Vec<ChunkDescriptor>, ReductionError> {
    if chunk_size == 0 {
        return Err(ReductionError::InvalidChunkSize);
    }
    let total = dataset.len();
    let descriptors = (0..total)
        .step_by(chunk_size)
        .enumerate()
        .map(|(id, start)| {
            let length = chunk_size.min(total - start);
            ChunkDescriptor {
                id,
                start,
                length,
                pieces: pieces(dataset, start, length),
            }
        })
        .collect();
    Ok(descriptors)
}

/// Intersect the range `[start, start + length)` with the files of the dataset.
fn pieces(dataset: &LogicalDataset, start: usize, length: usize) -> Vec<ChunkPiece> {
    let end = start + length;
    dataset
        .spans()
        .iter()
        .enumerate()
        .filter_map(|(index, span)| {
            let lo = start.max(span.start);
            let hi = end.min(span.start + span.length);
            (lo < hi).then(|| ChunkPiece {
                span: index,
                path: span.path.clone(),
                local_start: lo - span.start,
                length: hi - lo,
                chunk_offset: lo - start,
                file_length: span.length,
                data_offset: span.data_offset,
                byte_order: span.byte_order,
            })
        })
        .collect()
}
