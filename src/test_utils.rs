use std::path::{Path, PathBuf};

use crate::format::{write_array_file, ArrayHeader};
use crate::models::{DType, Dimension};
use crate::operation::Element;

const GRID_NAMES: [&str; 3] = ["lat", "lon", "lev"];

/// The DType matching a primitive element type.
pub(crate) fn dtype_of<T: Element>() -> DType {
    match std::any::type_name::<T>() {
        "i32" => DType::Int32,
        "i64" => DType::Int64,
        "u32" => DType::Uint32,
        "u64" => DType::Uint64,
        "f32" => DType::Float32,
        "f64" => DType::Float64,
        name => panic!("no dtype for {}", name),
    }
}

/// Write one array file per entry of `lengths`, concatenated along a leading "time" dimension.
///
/// Each file has a `grid` of trailing dimensions. Element values are `value(i)` where `i` is the
/// C order index of the element in the concatenated dataset.
pub(crate) fn write_dataset<T: Element>(
    dir: &Path,
    lengths: &[usize],
    grid: &[usize],
    value: impl Fn(usize) -> T,
) -> Vec<PathBuf> {
    let grid_size: usize = grid.iter().product();
    let mut offset = 0;
    lengths
        .iter()
        .enumerate()
        .map(|(i, length)| {
            let mut dimensions = vec![Dimension::new("time", *length)];
            dimensions.extend(
                grid.iter()
                    .zip(GRID_NAMES)
                    .map(|(size, name)| Dimension::new(name, *size)),
            );
            let header = ArrayHeader::new("tas", dtype_of::<T>(), dimensions)
                .with_attribute("history", format!("file {}", i));
            let count = length * grid_size;
            let data: Vec<T> = (offset..offset + count).map(&value).collect();
            offset += count;
            let path = dir.join(format!("tas_{}.arr", i));
            write_array_file(&path, &header, &data).unwrap();
            path
        })
        .collect()
}
