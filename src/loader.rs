//! Chunk loading.
//!
//! A chunk is read with one contiguous read per file piece and per index of the dimensions
//! outside the concatenation dimension. Only the files and byte ranges the chunk covers are read.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use zerocopy::AsBytes;

use crate::dataset::LogicalDataset;
use crate::error::ReductionError;
use crate::models::DType;
use crate::operation::Element;
use crate::planner::{ChunkDescriptor, ChunkPiece};

/// What a task needs to know about the dataset to load a chunk.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BlockLayout {
    /// Data type of the elements
    pub dtype: DType,
    /// Shape of the whole dataset
    pub shape: Vec<usize>,
    /// Index of the concatenation dimension
    pub concat_axis: usize,
}

impl BlockLayout {
    pub fn of(dataset: &LogicalDataset) -> Self {
        Self {
            dtype: dataset.dtype(),
            shape: dataset.shape(),
            concat_axis: dataset.concat_axis(),
        }
    }

    /// Shape of a block of `length` elements along the concatenation dimension.
    pub fn block_shape(&self, length: usize) -> Vec<usize> {
        let mut shape = self.shape.clone();
        shape[self.concat_axis] = length;
        shape
    }

    /// Size in bytes of a block of `length` elements along the concatenation dimension.
    pub fn block_size(&self, length: usize) -> usize {
        self.block_shape(length).iter().product::<usize>() * self.dtype.size_of()
    }

    /// Number of elements before and after the concatenation axis in C order.
    fn strides(&self) -> (usize, usize) {
        let outer = self.shape[..self.concat_axis].iter().product();
        let inner = self.shape[self.concat_axis + 1..].iter().product();
        (outer, inner)
    }
}

/// The data of one chunk.
#[derive(Debug)]
pub struct Block<T> {
    /// Id of the chunk
    pub chunk: usize,
    /// Elements, in native byte order
    pub array: ArrayD<T>,
    /// Axes still to be reduced over
    pub axes: Vec<usize>,
}

/// Load the data of a chunk.
///
/// # Arguments
///
/// * `layout`: Layout of the dataset
/// * `descriptor`: The chunk to load
/// * `axes`: Axes the block will be reduced over
#[tracing::instrument(level = "DEBUG", skip_all, fields(chunk = descriptor.id))]
pub fn load<T: Element>(
    layout: &BlockLayout,
    descriptor: &ChunkDescriptor,
    axes: &[usize],
) -> Result<Block<T>, ReductionError> {
    if std::mem::size_of::<T>() != layout.dtype.size_of() {
        return Err(ReductionError::FromBytes {
            type_name: std::any::type_name::<T>(),
        });
    }
    let (outer, inner) = layout.strides();
    let mut data = vec![T::zero(); outer * descriptor.length * inner];
    for piece in &descriptor.pieces {
        read_piece(piece, descriptor.length, outer, inner, &mut data)
            .map_err(|err| err.in_chunk(descriptor.id))?;
    }
    let array = ArrayD::from_shape_vec(layout.block_shape(descriptor.length), data)?;
    Ok(Block {
        chunk: descriptor.id,
        array,
        axes: axes.to_vec(),
    })
}

/// Read one file piece into its place in the chunk's data.
fn read_piece<T: Element>(
    piece: &ChunkPiece,
    chunk_length: usize,
    outer: usize,
    inner: usize,
    data: &mut [T],
) -> Result<(), ReductionError> {
    let element_size = std::mem::size_of::<T>() as u64;
    let size = (piece.length * inner) as u64 * element_size;
    let mut file = File::open(&piece.path)
        .map_err(|err| ReductionError::io(&piece.path, piece.data_offset, size, err))?;
    for index in 0..outer {
        let offset =
            piece.data_offset + ((index * piece.file_length + piece.local_start) * inner) as u64
                * element_size;
        let dest_start = (index * chunk_length + piece.chunk_offset) * inner;
        let dest = &mut data[dest_start..dest_start + piece.length * inner];
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(dest.as_bytes_mut()))
            .map_err(|err| ReductionError::io(&piece.path, offset, size, err))?;
        if !piece.byte_order.is_native() {
            dest.iter_mut().for_each(|x| *x = x.swap_bytes());
        }
    }
    tracing::trace!(path = %piece.path.display(), length = piece.length, "read piece");
    Ok(())
}
