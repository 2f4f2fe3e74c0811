use crate::error::ReductionError;
use crate::models::DType;
use crate::types::dvalue::TryFromDValue;
use crate::types::SwapBytes;

/// Trait for array elements.
pub trait Element:
    Clone
    + Copy
    + PartialOrd
    + Send
    + Sync
    + 'static
    + num_traits::Zero
    + std::fmt::Debug
    + std::ops::Add<Output = Self>
    + CheckedSum
    + serde::Serialize
    + SwapBytes
    + TryFromDValue
    + zerocopy::AsBytes
    + zerocopy::FromBytes
{
}

/// Blanket implementation of Element.
impl<T> Element for T where
    T: Clone
        + Copy
        + PartialOrd
        + Send
        + Sync
        + 'static
        + num_traits::Zero
        + std::fmt::Debug
        + std::ops::Add<Output = Self>
        + CheckedSum
        + serde::Serialize
        + SwapBytes
        + TryFromDValue
        + zerocopy::AsBytes
        + zerocopy::FromBytes
{
}

/// Addition that reports integer overflow.
pub trait CheckedSum: Sized {
    /// `self + other`, or `None` if an integer result does not fit. Floats never overflow.
    fn checked_sum(self, other: Self) -> Option<Self>;
}

macro_rules! impl_checked_sum_int {
    ($($t:ty),*) => {
        $(
            impl CheckedSum for $t {
                fn checked_sum(self, other: Self) -> Option<Self> {
                    self.checked_add(other)
                }
            }
        )*
    };
}

impl_checked_sum_int!(i32, i64, u32, u64);

macro_rules! impl_checked_sum_float {
    ($($t:ty),*) => {
        $(
            impl CheckedSum for $t {
                fn checked_sum(self, other: Self) -> Option<Self> {
                    Some(self + other)
                }
            }
        )*
    };
}

impl_checked_sum_float!(f32, f64);

/// Whether a value is NaN. Always false for integer types.
#[allow(clippy::eq_op)]
pub fn is_nan<T: Element>(x: &T) -> bool {
    x != x
}

/// A reduction operator.
///
/// Chunks are reduced independently and their partial results are combined in whatever order
/// they complete, so `combine` must be associative and commutative. Implementations declare this
/// through [Reducer::ASSOCIATIVE_COMMUTATIVE] and the scheduler refuses to run an operator that
/// does not.
///
/// `combine` is never called with NaN operands; NaN and missing data are handled by the caller
/// according to the configured [NanPolicy](crate::models::NanPolicy).
pub trait Reducer: Send + Sync + 'static {
    /// Operator name, used in logs, errors and to select a built-in operator in worker processes.
    const NAME: &'static str;

    /// Whether `combine` is associative and commutative.
    const ASSOCIATIVE_COMMUTATIVE: bool = true;

    /// Combine two values.
    fn combine<T: Element>(a: T, b: T) -> T;

    /// Combine two values, or `None` if the result does not fit in `T`.
    ///
    /// This is what reductions call. Operators that can overflow override it.
    fn try_combine<T: Element>(a: T, b: T) -> Option<T> {
        Some(Self::combine(a, b))
    }

    /// The identity element of `combine`, if it has one for `T`.
    fn identity<T: Element>() -> Option<T> {
        None
    }
}

/// Trait for code that is generic over the element type.
///
/// This provides an entry point into the type system based on a runtime `dtype` value.
pub trait NumDispatch {
    type Output;

    fn run_t<T: Element>(self) -> Result<Self::Output, ReductionError>;

    /// Run `run_t` with the concrete type for `dtype`.
    fn run(self, dtype: DType) -> Result<Self::Output, ReductionError>
    where
        Self: Sized,
    {
        // Convert runtime data type into concrete types.
        match dtype {
            DType::Int32 => self.run_t::<i32>(),
            DType::Int64 => self.run_t::<i64>(),
            DType::Uint32 => self.run_t::<u32>(),
            DType::Uint64 => self.run_t::<u64>(),
            DType::Float32 => self.run_t::<f32>(),
            DType::Float64 => self.run_t::<f64>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TypeName {}

    impl NumDispatch for TypeName {
        type Output = &'static str;

        fn run_t<T: Element>(self) -> Result<Self::Output, ReductionError> {
            Ok(std::any::type_name::<T>())
        }
    }

    #[test]
    fn dispatch_i64() {
        assert_eq!("i64", TypeName {}.run(DType::Int64).unwrap());
    }

    #[test]
    fn dispatch_f32() {
        assert_eq!("f32", TypeName {}.run(DType::Float32).unwrap());
    }

    #[test]
    fn nan_detection() {
        assert!(is_nan(&f32::NAN));
        assert!(is_nan(&f64::NAN));
        assert!(!is_nan(&1.0_f64));
        assert!(!is_nan(&i32::MIN));
    }

    struct First {}

    impl Reducer for First {
        const NAME: &'static str = "first";
        const ASSOCIATIVE_COMMUTATIVE: bool = false;

        fn combine<T: Element>(a: T, _b: T) -> T {
            a
        }
    }

    #[test]
    fn reducer_defaults() {
        assert!(!First::ASSOCIATIVE_COMMUTATIVE);
        assert_eq!(None, First::identity::<u32>());
        assert_eq!(3, First::combine(3, 4));
        assert_eq!(Some(3), First::try_combine(3, 4));
    }

    #[test]
    fn checked_sum() {
        assert_eq!(Some(5), 2_i32.checked_sum(3));
        assert_eq!(None, i64::MAX.checked_sum(1));
        assert_eq!(None, u32::MAX.checked_sum(1));
        assert_eq!(Some(f64::INFINITY), f64::MAX.checked_sum(f64::MAX));
    }
}
