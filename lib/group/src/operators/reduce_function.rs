// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reduce functions.
//!
//! A reduce function folds the values collected at one tree node into one.
//! Children arrive in no guaranteed order, so a function must be
//! associative and commutative.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GroupError;

pub trait ReduceFunction<T>: Send + Sync {
    /// Fold `values` into one. Empty input is [`GroupError::EmptyReduction`].
    fn reduce(&self, values: Vec<T>) -> Result<T, GroupError>;
}

impl<T, F> ReduceFunction<T> for F
where
    F: Fn(Vec<T>) -> Result<T, GroupError> + Send + Sync,
{
    fn reduce(&self, values: Vec<T>) -> Result<T, GroupError> {
        self(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceFunctionKind {
    Sum,
    Max,
    Min,
}

impl fmt::Display for ReduceFunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceFunctionKind::Sum => write!(f, "sum"),
            ReduceFunctionKind::Max => write!(f, "max"),
            ReduceFunctionKind::Min => write!(f, "min"),
        }
    }
}

pub struct Sum<T>(PhantomData<fn() -> T>);

pub type IntegerSum = Sum<i64>;
pub type DoubleSum = Sum<f64>;

impl<T> Sum<T> {
    pub fn new() -> Self {
        Sum(PhantomData)
    }
}

impl<T> Default for Sum<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Addition used by [`Sum`]. Integers report overflow instead of wrapping.
pub trait Summable: Sized {
    fn try_add(self, other: Self) -> Option<Self>;
}

macro_rules! checked_summable {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Summable for $ty {
                fn try_add(self, other: Self) -> Option<Self> {
                    self.checked_add(other)
                }
            }
        )*
    };
}

macro_rules! float_summable {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Summable for $ty {
                fn try_add(self, other: Self) -> Option<Self> {
                    Some(self + other)
                }
            }
        )*
    };
}

checked_summable!(i32, i64, u32, u64);
float_summable!(f32, f64);

impl<T: Summable> ReduceFunction<T> for Sum<T> {
    fn reduce(&self, values: Vec<T>) -> Result<T, GroupError> {
        let mut values = values.into_iter();
        let first = values.next().ok_or(GroupError::EmptyReduction)?;
        values.try_fold(first, |total, v| {
            total.try_add(v).ok_or(GroupError::ReductionOverflow)
        })
    }
}

pub struct Max<T>(PhantomData<fn() -> T>);

impl<T> Max<T> {
    pub fn new() -> Self {
        Max(PhantomData)
    }
}

impl<T> Default for Max<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialOrd> ReduceFunction<T> for Max<T> {
    fn reduce(&self, values: Vec<T>) -> Result<T, GroupError> {
        values
            .into_iter()
            .reduce(|best, v| if v > best { v } else { best })
            .ok_or(GroupError::EmptyReduction)
    }
}

pub struct Min<T>(PhantomData<fn() -> T>);

impl<T> Min<T> {
    pub fn new() -> Self {
        Min(PhantomData)
    }
}

impl<T> Default for Min<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialOrd> ReduceFunction<T> for Min<T> {
    fn reduce(&self, values: Vec<T>) -> Result<T, GroupError> {
        values
            .into_iter()
            .reduce(|best, v| if v < best { v } else { best })
            .ok_or(GroupError::EmptyReduction)
    }
}

/// Types with a built-in reduce function for every [`ReduceFunctionKind`].
pub trait Reducible: Sized + Send + Sync + 'static {
    fn reduce_function(kind: ReduceFunctionKind) -> Arc<dyn ReduceFunction<Self>>;
}

macro_rules! numeric_reducible {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Reducible for $ty {
                fn reduce_function(kind: ReduceFunctionKind) -> Arc<dyn ReduceFunction<Self>> {
                    match kind {
                        ReduceFunctionKind::Sum => Arc::new(Sum::<$ty>::new()),
                        ReduceFunctionKind::Max => Arc::new(Max::<$ty>::new()),
                        ReduceFunctionKind::Min => Arc::new(Min::<$ty>::new()),
                    }
                }
            }
        )*
    };
}

numeric_reducible!(i32, i64, u32, u64, f32, f64);
