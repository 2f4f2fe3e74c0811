//! Pipeline driver.
//!
//! Opens a dataset, plans its chunks, runs the scheduler and packages the result with its
//! metadata.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ndarray::ArrayD;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::dataset::LogicalDataset;
use crate::error::ReductionError;
use crate::loader::BlockLayout;
use crate::models::{DType, NanPolicy, PartialResult};
use crate::operation::{Element, NumDispatch, Reducer};
use crate::planner::plan;
use crate::provenance;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::types::{DValue, Missing};
use crate::worker::TaskSpec;

/// Pipeline configuration
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct PipelineConfig {
    /// Dimension the files are concatenated along. Defaults to the first dimension.
    pub concat_dim: Option<String>,
    /// Elements per chunk along the concatenation dimension
    pub chunk_size: usize,
    /// NaN handling
    pub nan_policy: NanPolicy,
    /// Missing data descriptor, replacing the one in the files
    pub missing: Option<Missing<DValue>>,
    /// Scheduler configuration
    #[validate]
    pub scheduler: SchedulerConfig,
    /// Command line recorded in the history attribute
    pub command: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concat_dim: None,
            chunk_size: 100,
            nan_policy: NanPolicy::default(),
            missing: None,
            scheduler: SchedulerConfig::default(),
            command: std::env::args().collect(),
        }
    }
}

/// Result of reducing a dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct Reduction {
    /// Name of the variable
    pub variable: String,
    /// Name of the operator
    pub operation: String,
    /// Data type of the values
    pub dtype: DType,
    /// Names of the dimensions that were not reduced
    pub dimensions: Vec<String>,
    /// Shape of the result. Empty for a scalar.
    pub shape: Vec<usize>,
    /// Values in native byte order and C order
    pub body: Bytes,
    /// Number of non-missing elements behind each value. Values with a count of zero are undefined.
    pub counts: Vec<i64>,
    /// Attributes of the first input file, with a new history record
    pub attributes: BTreeMap<String, String>,
    /// Wall clock time of the reduction
    pub elapsed: Duration,
}

impl Reduction {
    fn partial(&self) -> PartialResult {
        PartialResult {
            chunk: 0,
            dtype: self.dtype,
            shape: self.shape.clone(),
            body: self.body.clone(),
            counts: self.counts.clone(),
        }
    }

    /// Decode the values into a typed `Vec`.
    pub fn values<T: Element>(&self) -> Result<Vec<T>, ReductionError> {
        self.partial().values()
    }

    /// Decode the values into an array of the result's shape.
    pub fn as_array<T: Element>(&self) -> Result<ArrayD<T>, ReductionError> {
        Ok(ArrayD::from_shape_vec(self.shape.clone(), self.values()?)?)
    }

    /// Values as JSON, with `null` where no element contributed.
    pub fn json_values(&self) -> Result<Vec<serde_json::Value>, ReductionError> {
        JsonValues { reduction: self }.run(self.dtype)
    }

    /// JSON document describing the result.
    pub fn to_json(&self) -> Result<serde_json::Value, ReductionError> {
        let output = ReductionOutput {
            variable: &self.variable,
            operation: &self.operation,
            dtype: self.dtype,
            dimensions: &self.dimensions,
            shape: &self.shape,
            values: self.json_values()?,
            counts: &self.counts,
            attributes: &self.attributes,
            elapsed_secs: self.elapsed.as_secs_f64(),
        };
        Ok(serde_json::to_value(output)?)
    }

    /// One line summary, e.g. "max: 5.0 took 1.23 sec".
    pub fn summary(&self) -> Result<String, ReductionError> {
        let value = if self.shape.is_empty() {
            self.json_values()?
                .first()
                .map(|value| value.to_string())
                .unwrap_or_default()
        } else {
            format!("array of shape {:?}", self.shape)
        };
        Ok(format!(
            "{}: {} took {:.2} sec",
            self.operation,
            value,
            self.elapsed.as_secs_f64()
        ))
    }
}

#[derive(Serialize)]
struct ReductionOutput<'a> {
    variable: &'a str,
    operation: &'a str,
    dtype: DType,
    dimensions: &'a [String],
    shape: &'a [usize],
    values: Vec<serde_json::Value>,
    counts: &'a [i64],
    attributes: &'a BTreeMap<String, String>,
    elapsed_secs: f64,
}

struct JsonValues<'a> {
    reduction: &'a Reduction,
}

impl<'a> NumDispatch for JsonValues<'a> {
    type Output = Vec<serde_json::Value>;

    fn run_t<T: Element>(self) -> Result<Self::Output, ReductionError> {
        self.reduction
            .values::<T>()?
            .into_iter()
            .zip(&self.reduction.counts)
            .map(|(value, count)| match count {
                0 => Ok(serde_json::Value::Null),
                _ => Ok(serde_json::to_value(value)?),
            })
            .collect()
    }
}

/// Reduce a multi-file dataset with operator `R`.
///
/// # Arguments
///
/// * `paths`: Array files, in concatenation order
/// * `dims`: Names of the dimensions to reduce over. Empty means all dimensions.
/// * `config`: Pipeline configuration
pub async fn reduce_dataset<R: Reducer>(
    paths: &[PathBuf],
    dims: &[String],
    config: &PipelineConfig,
) -> Result<Reduction, ReductionError> {
    let span = tracing::info_span!(
        "reduce_dataset",
        run_id = %Uuid::new_v4(),
        operation = R::NAME,
        files = paths.len()
    );
    run::<R>(paths, dims, config).instrument(span).await
}

async fn run<R: Reducer>(
    paths: &[PathBuf],
    dims: &[String],
    config: &PipelineConfig,
) -> Result<Reduction, ReductionError> {
    let start = Instant::now();
    config.validate()?;
    let scheduler = Scheduler::new(config.scheduler.clone())?;

    let dataset = LogicalDataset::open(paths, config.concat_dim.as_deref())?;
    let axes = dataset.axes_of(dims)?;
    let missing = match &config.missing {
        Some(missing) => {
            missing.validate(dataset.dtype()).map_err(|error| {
                let mut errors = ValidationErrors::new();
                errors.add("missing", error);
                ReductionError::Validation(errors)
            })?;
            Some(missing.clone())
        }
        None => dataset.missing().cloned(),
    };
    let descriptors = plan(&dataset, config.chunk_size)?;
    tracing::info!(
        variable = dataset.variable(),
        concat_dim = dataset.concat_dim(),
        length = dataset.len(),
        chunks = descriptors.len(),
        "planned dataset"
    );

    let spec = TaskSpec::new::<R>(
        BlockLayout::of(&dataset),
        axes.clone(),
        missing,
        config.nan_policy,
    );
    let result = scheduler.execute::<R>(spec, descriptors).await?;
    if result.shape.is_empty() && result.counts.iter().all(|count| *count == 0) {
        return Err(ReductionError::EmptyArray { operation: R::NAME });
    }

    let inputs: Vec<_> = dataset
        .spans()
        .iter()
        .map(|span| (span.path.clone(), span.history.clone()))
        .collect();
    let mut attributes = dataset.attributes().clone();
    attributes.insert(
        "history".to_string(),
        provenance::new_log(&config.command, &inputs)?,
    );
    let dimensions = dataset
        .dimensions()
        .iter()
        .enumerate()
        .filter(|(axis, _)| !axes.contains(axis))
        .map(|(_, d)| d.name.clone())
        .collect();
    let elapsed = start.elapsed();
    tracing::info!(
        elapsed_secs = elapsed.as_secs_f64(),
        dispatched = scheduler.stats().dispatched(),
        "reduction complete"
    );
    Ok(Reduction {
        variable: dataset.variable().to_string(),
        operation: R::NAME.to_string(),
        dtype: result.dtype,
        dimensions,
        shape: result.shape,
        body: result.body,
        counts: result.counts,
        attributes,
        elapsed,
    })
}

/// Reduce with a built-in operator chosen at runtime.
pub async fn reduce_dataset_with(
    operation: crate::models::Operation,
    paths: &[PathBuf],
    dims: &[String],
    config: &PipelineConfig,
) -> Result<Reduction, ReductionError> {
    use crate::models::Operation;
    use crate::operations::{Max, Min, Sum};
    match operation {
        Operation::Max => reduce_dataset::<Max>(paths, dims, config).await,
        Operation::Min => reduce_dataset::<Min>(paths, dims, config).await,
        Operation::Sum => reduce_dataset::<Sum>(paths, dims, config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use crate::format::{write_array_file, ArrayHeader};
    use crate::models::Dimension;
    use crate::operations::{Max, Min, Sum};
    use crate::test_utils::write_dataset;

    fn config(chunk_size: usize, worker_count: usize) -> PipelineConfig {
        PipelineConfig {
            chunk_size,
            scheduler: SchedulerConfig {
                worker_count,
                ..Default::default()
            },
            command: vec!["chunkreduce".to_string(), "test".to_string()],
            ..Default::default()
        }
    }

    // 3 files of 100 time steps on a 10x10 grid, all zero except one 5.0 at step 150.
    fn spike_dataset(dir: &Path) -> Vec<PathBuf> {
        write_dataset(dir, &[100, 100, 100], &[10, 10], |i| {
            if i == 150 * 100 + 37 {
                5.0_f32
            } else {
                0.0
            }
        })
    }

    #[tokio::test]
    async fn spike_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let paths = spike_dataset(dir.path());
        let reduction = reduce_dataset::<Max>(&paths, &[], &config(100, 4))
            .await
            .unwrap();
        assert!(reduction.shape.is_empty());
        assert_eq!(vec![5.0_f32], reduction.values::<f32>().unwrap());
        assert_eq!(vec![30000], reduction.counts);
        assert_eq!("max: 5.0 took", &reduction.summary().unwrap()[..13]);
    }

    #[tokio::test]
    async fn chunk_size_invariance() {
        let dir = tempfile::tempdir().unwrap();
        let paths = spike_dataset(dir.path());
        let small = reduce_dataset::<Max>(&paths, &[], &config(1, 3)).await.unwrap();
        let large = reduce_dataset::<Max>(&paths, &[], &config(1000, 3)).await.unwrap();
        assert_eq!(small.body, large.body);
        assert_eq!(small.counts, large.counts);
        assert_eq!(vec![5.0_f32], large.values::<f32>().unwrap());
    }

    #[tokio::test]
    async fn chunked_equals_single_block() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[7, 5, 9], &[3, 4], |i| {
            ((i * 7919) % 1013) as i64 - 500
        });
        let dims = vec!["time".to_string(), "lon".to_string()];
        let whole = reduce_dataset::<Min>(&paths, &dims, &config(21, 1))
            .await
            .unwrap();
        for chunk_size in [1, 2, 4, 6, 20] {
            let chunked = reduce_dataset::<Min>(&paths, &dims, &config(chunk_size, 3))
                .await
                .unwrap();
            assert_eq!(whole.as_array::<i64>().unwrap(), chunked.as_array::<i64>().unwrap());
        }
        assert_eq!(vec!["lat".to_string()], whole.dimensions);
        assert_eq!(vec![3], whole.shape);
    }

    #[tokio::test]
    async fn idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[4, 4], &[2], |i| (i as f64).sin());
        let first = reduce_dataset::<Sum>(&paths, &["time".to_string()], &config(3, 2))
            .await
            .unwrap();
        let second = reduce_dataset::<Sum>(&paths, &["time".to_string()], &config(3, 2))
            .await
            .unwrap();
        assert_eq!(first.shape, second.shape);
        assert_eq!(first.counts, second.counts);
        let (a, b) = (first.values::<f64>().unwrap(), second.values::<f64>().unwrap());
        for (a, b) in a.iter().zip(&b) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn no_files() {
        assert!(matches!(
            reduce_dataset::<Max>(&[], &[], &config(10, 1)).await.unwrap_err(),
            ReductionError::EmptyDataset
        ));
    }

    #[tokio::test]
    async fn zero_length_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[0, 0], &[2], |i| i as u32);
        assert!(matches!(
            reduce_dataset::<Max>(&paths, &[], &config(10, 1)).await.unwrap_err(),
            ReductionError::EmptyDataset
        ));
    }

    #[tokio::test]
    async fn schema_mismatch_before_chunk_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = write_dataset(dir.path(), &[2], &[3], |i| i as f32);
        // A file with a different grid and no data at all.
        let path = dir.path().join("odd.arr");
        let header = ArrayHeader::new(
            "tas",
            DType::Float32,
            vec![Dimension::new("time", 2), Dimension::new("lat", 4)],
        );
        write_array_file(&path, &header, &[0.0_f32; 8]).unwrap();
        let (_, data_offset) = crate::format::read_header(&path).unwrap();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(data_offset)
            .unwrap();
        paths.push(path.clone());
        match reduce_dataset::<Max>(&paths, &[], &config(10, 1)).await.unwrap_err() {
            ReductionError::SchemaMismatch { path: p, .. } => assert_eq!(path, p),
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[tokio::test]
    async fn integer_sum_overflow_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[1, 1], &[], |_| i64::MAX);
        match reduce_dataset::<Sum>(&paths, &[], &config(1, 1)).await.unwrap_err() {
            ReductionError::Overflow { operator, chunk } => {
                assert_eq!("sum", operator);
                assert!(chunk.is_some());
            }
            err => panic!("unexpected error {:?}", err),
        }
        // The same data in one chunk overflows inside the task.
        assert!(matches!(
            reduce_dataset::<Sum>(&paths, &[], &config(2, 1)).await.unwrap_err(),
            ReductionError::Overflow { chunk: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn unknown_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[2], &[3], |i| i as f32);
        match reduce_dataset::<Max>(&paths, &["depth".to_string()], &config(10, 1))
            .await
            .unwrap_err()
        {
            ReductionError::UnknownDimension { name } => assert_eq!("depth", name),
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[tokio::test]
    async fn zero_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[2], &[3], |i| i as f32);
        assert!(matches!(
            reduce_dataset::<Max>(&paths, &[], &config(0, 1)).await.unwrap_err(),
            ReductionError::InvalidChunkSize
        ));
    }

    #[tokio::test]
    async fn all_missing_is_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[3], &[2], |_| f32::NAN);
        match reduce_dataset::<Max>(&paths, &[], &config(2, 1)).await.unwrap_err() {
            ReductionError::EmptyArray { operation } => assert_eq!("max", operation),
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[tokio::test]
    async fn nan_policy() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[2, 2], &[], |i| {
            [1.0, f64::NAN, 3.0, 2.0][i]
        });
        let ignore = reduce_dataset::<Max>(&paths, &[], &config(1, 2)).await.unwrap();
        assert_eq!(vec![3.0], ignore.values::<f64>().unwrap());
        assert_eq!(vec![3], ignore.counts);
        let propagate = PipelineConfig {
            nan_policy: NanPolicy::Propagate,
            ..config(1, 2)
        };
        let result = reduce_dataset::<Max>(&paths, &[], &propagate).await.unwrap();
        assert!(result.values::<f64>().unwrap()[0].is_nan());
        assert_eq!(vec![4], result.counts);
    }

    #[tokio::test]
    async fn missing_from_header_and_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pr.arr");
        let header = ArrayHeader::new("pr", DType::Int32, vec![Dimension::new("time", 4)])
            .with_missing(Missing::MissingValue(99.into()));
        write_array_file(&path, &header, &[1_i32, 99, 7, 3]).unwrap();
        let paths = vec![path];
        let from_header = reduce_dataset::<Max>(&paths, &[], &config(2, 1)).await.unwrap();
        assert_eq!(vec![7], from_header.values::<i32>().unwrap());
        let overridden = PipelineConfig {
            missing: Some(Missing::ValidMax(5.into())),
            ..config(2, 1)
        };
        let result = reduce_dataset::<Max>(&paths, &[], &overridden).await.unwrap();
        assert_eq!(vec![3], result.values::<i32>().unwrap());
        assert_eq!(vec![2], result.counts);
    }

    #[tokio::test]
    async fn invalid_missing_override() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[2], &[], |i| i as u32);
        let config = PipelineConfig {
            missing: Some(Missing::MissingValue((-1).into())),
            ..config(2, 1)
        };
        assert!(matches!(
            reduce_dataset::<Max>(&paths, &[], &config).await.unwrap_err(),
            ReductionError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn attributes_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[2, 1], &[2], |i| [4, 0, 6, 1, 2, 9][i] as i64);
        let reduction = reduce_dataset::<Max>(&paths, &["time".to_string()], &config(2, 2))
            .await
            .unwrap();
        let history = &reduction.attributes["history"];
        assert!(history.contains(": chunkreduce test"));
        assert!(history.contains("History of"));
        assert!(history.contains("file 1"));
        let json = reduction.to_json().unwrap();
        assert_eq!(serde_json::json!([6, 9]), json["values"]);
        assert_eq!(serde_json::json!(["lat"]), json["dimensions"]);
        assert_eq!(serde_json::json!("tas"), json["variable"]);
    }

    #[tokio::test]
    async fn json_null_for_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[2], &[2], |i| {
            [1.0, f32::NAN, 2.0, f32::NAN][i]
        });
        let reduction = reduce_dataset::<Sum>(&paths, &["time".to_string()], &config(1, 1))
            .await
            .unwrap();
        assert_eq!(vec![2, 0], reduction.counts);
        assert_eq!(
            vec![serde_json::json!(3.0), serde_json::Value::Null],
            reduction.json_values().unwrap()
        );
    }

    #[tokio::test]
    async fn builtin_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_dataset(dir.path(), &[3], &[], |i| i as i64 + 1);
        let reduction =
            reduce_dataset_with(crate::models::Operation::Sum, &paths, &[], &config(2, 1))
                .await
                .unwrap();
        assert_eq!("sum", reduction.operation);
        assert_eq!(vec![6], reduction.values::<i64>().unwrap());
    }
}
