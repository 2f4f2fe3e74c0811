//! Missing data descriptors
//!
//! Array files can declare missing data which is excluded from every reduction. Supported
//! descriptions follow the NetCDF/CF attribute conventions:
//!
//! * A single missing value (`_FillValue` or `missing_value`)
//! * Multiple missing values
//! * A valid minimum value
//! * A valid maximum value
//! * A valid range of values

use serde::{Deserialize, Serialize};
use validator::ValidationError;

use crate::error::ReductionError;
use crate::models::DType;
use crate::operation::Element;
use crate::types::dvalue::TryFromDValue;
use crate::types::DValue;

/// Missing data
///
/// Generic over the type of the values:
/// 1. T = [DValue] in array file headers and configuration, where the element type is only known
///    at runtime.
/// 2. T = a primitive numeric type inside a chunk task, once the [DType] has been dispatched.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Missing<T> {
    /// A single missing value
    MissingValue(T),
    /// Multple missing values
    MissingValues(Vec<T>),
    /// Valid minimum
    ValidMin(T),
    /// Valid maxiumum
    ValidMax(T),
    /// Valid range
    ValidRange(T, T),
}

impl Missing<DValue> {
    /// Validate a [`Missing<DValue>`](crate::types::Missing) object for a given [DType].
    pub fn validate(&self, dtype: DType) -> Result<(), ValidationError> {
        match dtype {
            DType::Int32 => Missing::<i32>::validate_dvalue(self),
            DType::Int64 => Missing::<i64>::validate_dvalue(self),
            DType::Uint32 => Missing::<u32>::validate_dvalue(self),
            DType::Uint64 => Missing::<u64>::validate_dvalue(self),
            DType::Float32 => Missing::<f32>::validate_dvalue(self),
            DType::Float64 => Missing::<f64>::validate_dvalue(self),
        }
    }
}

impl<T: PartialOrd + Serialize + TryFromDValue> Missing<T> {
    fn validate_dvalue(missing: &Missing<DValue>) -> Result<(), ValidationError> {
        let missing_primitive = Self::try_from(missing).map_err(|err| {
            let mut error = ValidationError::new("Missing data descriptor is invalid");
            error.add_param("error".into(), &err.to_string());
            error
        })?;
        if let Missing::ValidRange(min, max) = missing_primitive {
            if min >= max {
                let mut error =
                    ValidationError::new("Missing data valid range min must be less than max");
                error.add_param("min".into(), &min);
                error.add_param("max".into(), &max);
                return Err(error);
            };
        };
        Ok(())
    }
}

impl<T: TryFromDValue> TryFrom<&Missing<DValue>> for Missing<T> {
    type Error = ReductionError;

    fn try_from(missing: &Missing<DValue>) -> Result<Self, Self::Error> {
        let convert = |value: &DValue| T::try_from_dvalue(value.clone());
        let result = match missing {
            Missing::MissingValue(value) => Missing::MissingValue(convert(value)?),
            Missing::MissingValues(values) => Missing::MissingValues(
                values.iter().map(convert).collect::<Result<Vec<T>, _>>()?,
            ),
            Missing::ValidMin(min) => Missing::ValidMin(convert(min)?),
            Missing::ValidMax(max) => Missing::ValidMax(convert(max)?),
            Missing::ValidRange(min, max) => Missing::ValidRange(convert(min)?, convert(max)?),
        };
        Ok(result)
    }
}

impl<T: Element> Missing<T> {
    /// Whether the provided value is a 'missing' value
    pub fn is_missing(&self, x: &T) -> bool {
        match self {
            Missing::MissingValue(value) => x == value,
            Missing::MissingValues(values) => values.contains(x),
            Missing::ValidMin(min) => x < min,
            Missing::ValidMax(max) => x > max,
            Missing::ValidRange(min, max) => x < min || x > max,
        }
    }
}
