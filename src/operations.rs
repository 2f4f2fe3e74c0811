//! Numerical operations.
//!
//! Each operator is a struct implementing [Reducer](crate::operation::Reducer). The functions in
//! this module apply an operator to an in-memory block and combine the resulting partial results.
//! All of them work on arrays of `(value, count)` cells, where `count` is the number of
//! non-missing elements that contributed to `value`. A cell with a count of zero has no value,
//! which removes the need for an identity element when combining.

use ndarray::{ArrayD, ArrayViewD, Axis, Zip};

use crate::error::ReductionError;
use crate::models::NanPolicy;
use crate::operation::{is_nan, Element, Reducer};
use crate::types::Missing;

/// Return the maximum of the elements.
pub struct Max {}

impl Reducer for Max {
    const NAME: &'static str = "max";

    fn combine<T: Element>(a: T, b: T) -> T {
        if b > a {
            b
        } else {
            a
        }
    }
}

/// Return the minimum of the elements.
pub struct Min {}

impl Reducer for Min {
    const NAME: &'static str = "min";

    fn combine<T: Element>(a: T, b: T) -> T {
        if b < a {
            b
        } else {
            a
        }
    }
}

/// Return the sum of the elements.
///
/// Integer sums that overflow fail with [ReductionError::Overflow]. Floating point sums are only
/// associative up to rounding, so results may differ in the last bits between chunkings.
pub struct Sum {}

impl Reducer for Sum {
    const NAME: &'static str = "sum";

    fn combine<T: Element>(a: T, b: T) -> T {
        a + b
    }

    fn try_combine<T: Element>(a: T, b: T) -> Option<T> {
        a.checked_sum(b)
    }

    fn identity<T: Element>() -> Option<T> {
        Some(T::zero())
    }
}

/// Decides which elements take part in a reduction.
#[derive(Clone, Debug)]
pub struct ValueFilter<T> {
    missing: Option<Missing<T>>,
    nan_policy: NanPolicy,
}

impl<T: Element> ValueFilter<T> {
    pub fn new(missing: Option<Missing<T>>, nan_policy: NanPolicy) -> Self {
        Self {
            missing,
            nan_policy,
        }
    }

    /// Whether `x` contributes to the reduction.
    pub fn is_valid(&self, x: &T) -> bool {
        if is_nan(x) {
            return self.nan_policy == NanPolicy::Propagate;
        }
        match &self.missing {
            Some(missing) => !missing.is_missing(x),
            None => true,
        }
    }
}

impl<T: Element> Default for ValueFilter<T> {
    fn default() -> Self {
        Self::new(None, NanPolicy::default())
    }
}

/// Combine two values, letting a NaN operand win.
fn combine_nan<R: Reducer, T: Element>(a: T, b: T) -> Option<T> {
    if is_nan(&a) {
        Some(a)
    } else if is_nan(&b) {
        Some(b)
    } else {
        R::try_combine(a, b)
    }
}

/// Merge two `(value, count)` cells.
///
/// Returns `None` if the combined value does not fit in `T`.
pub fn merge_cells<R: Reducer, T: Element>(a: (T, i64), b: (T, i64)) -> Option<(T, i64)> {
    match (a.1, b.1) {
        (0, _) => Some(b),
        (_, 0) => Some(a),
        _ => Some((combine_nan::<R, T>(a.0, b.0)?, a.1 + b.1)),
    }
}

fn overflow<R: Reducer>() -> ReductionError {
    ReductionError::Overflow {
        operator: R::NAME.to_string(),
        chunk: None,
    }
}

/// Merge two cells inside an infallible fold, recording an overflow in `overflowed`.
fn merge_or_flag<R: Reducer, T: Element>(
    a: (T, i64),
    b: (T, i64),
    overflowed: &mut bool,
) -> (T, i64) {
    merge_cells::<R, T>(a, b).unwrap_or_else(|| {
        *overflowed = true;
        a
    })
}

/// Fold one element into a `(value, count)` cell.
fn accumulate<R: Reducer, T: Element>(
    cell: &(T, i64),
    x: &T,
    filter: &ValueFilter<T>,
    overflowed: &mut bool,
) -> (T, i64) {
    if filter.is_valid(x) {
        merge_or_flag::<R, T>(*cell, (*x, 1), overflowed)
    } else {
        *cell
    }
}

/// Reduce an array over the given axes.
///
/// Returns an array of `(value, count)` cells with the reduced axes removed. Reducing over no
/// axes returns one cell per element.
///
/// # Arguments
///
/// * `array`: The array to reduce
/// * `axes`: Axes to reduce over, in any order. Duplicates are ignored.
/// * `filter`: Missing data and NaN handling
pub fn reduce_block<R: Reducer, T: Element>(
    array: ArrayViewD<T>,
    axes: &[usize],
    filter: &ValueFilter<T>,
) -> Result<ArrayD<(T, i64)>, ReductionError> {
    let mut axes = axes.to_vec();
    axes.sort_unstable();
    axes.dedup();
    if let Some(axis) = axes.iter().find(|axis| **axis >= array.ndim()) {
        return Err(ReductionError::AxisOutOfBounds {
            axis: *axis,
            ndim: array.ndim(),
        });
    }
    let mut overflowed = false;
    // Fold the highest axis first so that the remaining axis indices stay valid.
    let Some((last, rest)) = axes.split_last() else {
        // Emulate numpy semantics of axis = () being a 'reduction over no axes'.
        return Ok(array.map(|x| {
            accumulate::<R, T>(&(T::zero(), 0), x, filter, &mut overflowed)
        }));
    };
    let mut result = array
        .fold_axis(Axis(*last), (T::zero(), 0), |cell, x| {
            accumulate::<R, T>(cell, x, filter, &mut overflowed)
        })
        .into_dyn();
    for axis in rest.iter().rev() {
        result = result
            .fold_axis(Axis(*axis), (T::zero(), 0), |total, cell| {
                merge_or_flag::<R, T>(*total, *cell, &mut overflowed)
            })
            .into_dyn();
    }
    if overflowed {
        return Err(overflow::<R>());
    }
    Ok(result)
}

/// Fold a partial result into an accumulator of the same shape.
pub fn combine_into<R: Reducer, T: Element>(
    accumulator: &mut ArrayD<(T, i64)>,
    partial: ArrayViewD<(T, i64)>,
) -> Result<(), ReductionError> {
    if accumulator.shape() != partial.shape() {
        return Err(ReductionError::IncompatibleShapes {
            expected: accumulator.shape().to_vec(),
            actual: partial.shape().to_vec(),
        });
    }
    let mut overflowed = false;
    Zip::from(accumulator)
        .and(&partial)
        .for_each(|total, cell| {
            *total = merge_or_flag::<R, T>(*total, *cell, &mut overflowed);
        });
    if overflowed {
        return Err(overflow::<R>());
    }
    Ok(())
}

/// Check a sample of partial values for order dependence.
///
/// The cells are folded front to back and back to front, and every adjacent pair is combined in
/// both orders. Any difference means the operator is not associative and commutative for this
/// data.
pub fn verify_contract<R: Reducer, T: Element>(
    samples: &[(T, i64)],
) -> Result<(), ReductionError> {
    let same = |a: &(T, i64), b: &(T, i64)| {
        a.1 == b.1 && (a.0 == b.0 || (is_nan(&a.0) && is_nan(&b.0)))
    };
    let violation = |detail: String| ReductionError::OperatorContractViolation {
        operator: R::NAME.to_string(),
        detail,
    };
    let merge = |a: (T, i64), b: (T, i64)| merge_cells::<R, T>(a, b).ok_or_else(overflow::<R>);
    let empty = (T::zero(), 0);
    let forward = samples
        .iter()
        .try_fold(empty, |total, cell| merge(total, *cell))?;
    let backward = samples
        .iter()
        .rev()
        .try_fold(empty, |total, cell| merge(total, *cell))?;
    if !same(&forward, &backward) {
        return Err(violation(format!(
            "folding {} partial results forwards gives {:?}, backwards gives {:?}",
            samples.len(),
            forward.0,
            backward.0
        )));
    }
    for pair in samples.windows(2) {
        let ab = merge(pair[0], pair[1])?;
        let ba = merge(pair[1], pair[0])?;
        if !same(&ab, &ba) {
            return Err(violation(format!(
                "combining {:?} and {:?} depends on their order",
                pair[0].0, pair[1].0
            )));
        }
    }
    Ok(())
}
