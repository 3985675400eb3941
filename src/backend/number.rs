// src/backend/number.rs

use ndarray::ScalarOperand;
use std::cmp::{PartialEq, PartialOrd};
use std::default::Default;
use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

// Import cudarc traits only when the cuda feature is enabled
#[cfg(feature = "cuda")]
use cudarc::driver::{DeviceRepr, ValidAsZeroBits};

/// Floating-point element trait for every buffer in this crate.
/// Covers the arithmetic, comparison and conversion surface the
/// normalization math needs; implemented for `f32` and `f64` only —
/// statistics and gradients are meaningless for integer activations.
pub trait NormoxF:
    Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> + Div<Output = Self>
    + Sum<Self> + for<'a> Sum<&'a Self>
    + AddAssign + SubAssign + MulAssign + DivAssign
    + Neg<Output = Self>
    + PartialOrd + PartialEq
    + Clone + Copy + Debug + Display + Default
    + Send + Sync
    + ScalarOperand
    + 'static
{
    /// Neutral element for addition (zero)
    fn zero() -> Self;

    /// Neutral element for multiplication (one)
    fn one() -> Self;

    /// Absolute value
    fn abs(self) -> Self;

    /// Square root
    fn sqrt(self) -> Self;

    /// Power with floating-point exponent
    fn powf(self, exp: Self) -> Self;

    /// Power with integer exponent
    fn powi(self, exp: i32) -> Self;

    fn max(self, other: Self) -> Self {
        if self >= other { self } else { other }
    }

    fn min(self, other: Self) -> Self {
        if self <= other { self } else { other }
    }

    /// Checks if it's NaN
    fn is_nan(self) -> bool;

    /// Checks if it's infinite
    fn is_infinite(self) -> bool;

    /// Checks if it's finite
    fn is_finite(self) -> bool;

    /// Converts to f64 for operations that require full precision
    fn to_f64(self) -> f64;

    /// Converts from f64 (fails when the value does not fit the element type)
    fn from_f64(value: f64) -> Option<Self>;

    /// Converts from f32
    fn from_f32(value: f32) -> Option<Self>;

    /// Converts an element count (batch*spatial divisors and the like)
    fn from_usize(value: usize) -> Option<Self>;

    /// ε applied *after* a square root: `x / (sqrt(v) + ε)`.
    fn norm_epsilon() -> Self {
        Self::from_f64(crate::backend::EPSILON).expect("epsilon must fit the element type")
    }

    /// ε applied *before* a square root or power: `(v + ε)^p`.
    fn variance_epsilon() -> Self {
        Self::from_f64(crate::backend::VARIANCE_EPSILON).expect("epsilon must fit the element type")
    }
}

// ============= GPU TRAIT DEFINITIONS =============

/// CUDA-compatible element trait: adds the cudarc device-representation
/// bounds so values can cross the host/device boundary.
#[cfg(feature = "cuda")]
pub trait NormoxCudaF: NormoxF + DeviceRepr + ValidAsZeroBits + Unpin {}

/// Without the cuda feature this is a plain alias for NormoxF, so generic
/// code can bound on it unconditionally.
#[cfg(not(feature = "cuda"))]
pub trait NormoxCudaF: NormoxF {}

#[cfg(feature = "cuda")]
impl<T: NormoxF + DeviceRepr + ValidAsZeroBits + Unpin> NormoxCudaF for T {}

#[cfg(not(feature = "cuda"))]
impl<T: NormoxF> NormoxCudaF for T {}

// ============= IMPLEMENTATIONS =============

impl NormoxF for f64 {
    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn abs(self) -> Self {
        self.abs()
    }

    fn sqrt(self) -> Self {
        self.sqrt()
    }

    fn powf(self, exp: Self) -> Self {
        self.powf(exp)
    }

    fn powi(self, exp: i32) -> Self {
        self.powi(exp)
    }

    fn is_nan(self) -> bool {
        self.is_nan()
    }

    fn is_infinite(self) -> bool {
        self.is_infinite()
    }

    fn is_finite(self) -> bool {
        self.is_finite()
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Option<Self> {
        Some(value)
    }

    fn from_f32(value: f32) -> Option<Self> {
        Some(value as f64)
    }

    fn from_usize(value: usize) -> Option<Self> {
        Some(value as f64)
    }
}

impl NormoxF for f32 {
    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn abs(self) -> Self {
        self.abs()
    }

    fn sqrt(self) -> Self {
        self.sqrt()
    }

    fn powf(self, exp: Self) -> Self {
        self.powf(exp)
    }

    fn powi(self, exp: i32) -> Self {
        self.powi(exp)
    }

    fn is_nan(self) -> bool {
        self.is_nan()
    }

    fn is_infinite(self) -> bool {
        self.is_infinite()
    }

    fn is_finite(self) -> bool {
        self.is_finite()
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Option<Self> {
        if value.is_finite() && value >= f32::MIN as f64 && value <= f32::MAX as f64 {
            Some(value as f32)
        } else {
            None
        }
    }

    fn from_f32(value: f32) -> Option<Self> {
        Some(value)
    }

    fn from_usize(value: usize) -> Option<Self> {
        Some(value as f32)
    }
}
