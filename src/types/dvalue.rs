//! Data value representing a value of any [DType](crate::models::DType)

use crate::error::ReductionError;

/// A value of any DType, as written in an array file header.
///
/// This is an alias of the Number type from serde_json, an enum over i64, u64 and f64 with the
/// additional constraint that floating point numbers must be finite. NaN can therefore never be
/// declared as a missing value; NaN handling is controlled by
/// [NanPolicy](crate::models::NanPolicy) instead.
pub type DValue = serde_json::Number;

/// Attempt to convert from a [DValue] to a specific numeric type.
// This trait exists because we can't implement TryFrom<DValue> for numeric types because the trait
// and type are in external crates.
pub trait TryFromDValue: Sized {
    /// Try to convert from a [DValue] to a numeric type.
    fn try_from_dvalue(value: DValue) -> Result<Self, ReductionError>;
}

fn incompatible(value: &DValue) -> ReductionError {
    ReductionError::IncompatibleMissing(value.clone())
}

// Integers go through the widest integer of the same signedness, then a checked narrowing.
macro_rules! impl_try_from_dvalue_int {
    ($as_wide:ident => $($t:ty),*) => {
        $(
            impl TryFromDValue for $t {
                fn try_from_dvalue(value: DValue) -> Result<Self, ReductionError> {
                    let wide = value.$as_wide().ok_or_else(|| incompatible(&value))?;
                    <$t>::try_from(wide).map_err(|_| incompatible(&value))
                }
            }
        )*
    };
}

impl_try_from_dvalue_int!(as_i64 => i32, i64);
impl_try_from_dvalue_int!(as_u64 => u32, u64);

impl TryFromDValue for f32 {
    fn try_from_dvalue(value: DValue) -> Result<Self, ReductionError> {
        let wide = value.as_f64().ok_or_else(|| incompatible(&value))?;
        // Values beyond the f32 range become infinite in this cast.
        let narrow = wide as f32;
        if narrow.is_finite() {
            Ok(narrow)
        } else {
            Err(incompatible(&value))
        }
    }
}

impl TryFromDValue for f64 {
    fn try_from_dvalue(value: DValue) -> Result<Self, ReductionError> {
        value.as_f64().ok_or_else(|| incompatible(&value))
    }
}
