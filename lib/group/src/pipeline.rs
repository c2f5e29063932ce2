// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pipelining: splitting one logical value into an ordered chunk sequence
//! and reassembling it on the other side.
//!
//! Chunks of one sequence are numbered from 0 and exactly one of them, the
//! final one, carries `is_last`. Transport FIFO ordering per link is what
//! keeps them in order; reassembly only verifies it.

use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use canopy_runtime::Payload;
use serde::{Deserialize, Serialize};

use crate::error::GroupError;
use crate::operators::PipelineSpec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMessage<T> {
    pub index: u64,
    pub is_last: bool,
    pub data: T,
}

impl<T> PipelineMessage<T> {
    pub fn new(index: u64, is_last: bool, data: T) -> Self {
        Self {
            index,
            is_last,
            data,
        }
    }
}

pub trait PipelineDataConverter<T>: Send + Sync {
    fn to_pipeline(&self, value: T) -> Vec<PipelineMessage<T>>;

    fn from_pipeline(&self, chunks: Vec<PipelineMessage<T>>) -> Result<T, GroupError>;
}

/// Sends every value as a single final chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPipelineDataConverter;

impl<T: Send + Sync> PipelineDataConverter<T> for DefaultPipelineDataConverter {
    fn to_pipeline(&self, value: T) -> Vec<PipelineMessage<T>> {
        vec![PipelineMessage::new(0, true, value)]
    }

    fn from_pipeline(&self, chunks: Vec<PipelineMessage<T>>) -> Result<T, GroupError> {
        let mut assembler = ChunkAssembler::new();
        let mut value = None;
        for chunk in chunks {
            assembler.accept(chunk.index, chunk.is_last)?;
            value = Some(chunk.data);
        }
        assembler.finish()?;
        value.ok_or(GroupError::OutOfOrderChunk {
            expected: Some(0),
            actual: None,
        })
    }
}

/// Splits a `Vec<E>` into chunks of at most `chunk_size` elements.
#[derive(Debug)]
pub struct ChunkingConverter<E> {
    chunk_size: NonZeroUsize,
    _marker: PhantomData<fn() -> E>,
}

impl<E> ChunkingConverter<E> {
    pub fn new(chunk_size: NonZeroUsize) -> Self {
        Self {
            chunk_size,
            _marker: PhantomData,
        }
    }

    pub fn chunk_size(&self) -> NonZeroUsize {
        self.chunk_size
    }
}

impl<E> Clone for ChunkingConverter<E> {
    fn clone(&self) -> Self {
        Self::new(self.chunk_size)
    }
}

impl<E: Send + Sync> PipelineDataConverter<Vec<E>> for ChunkingConverter<E> {
    fn to_pipeline(&self, value: Vec<E>) -> Vec<PipelineMessage<Vec<E>>> {
        split_into_chunks(value, self.chunk_size)
    }

    fn from_pipeline(&self, chunks: Vec<PipelineMessage<Vec<E>>>) -> Result<Vec<E>, GroupError> {
        from_pipeline(chunks)
    }
}

/// Cut `data` into consecutive chunks of at most `chunk_size` elements.
///
/// Empty input yields a single empty final chunk so the receiver still sees
/// a terminated sequence.
pub fn to_pipeline<E: Clone>(data: &[E], chunk_size: NonZeroUsize) -> Vec<PipelineMessage<Vec<E>>> {
    split_into_chunks(data.to_vec(), chunk_size)
}

fn split_into_chunks<E>(data: Vec<E>, chunk_size: NonZeroUsize) -> Vec<PipelineMessage<Vec<E>>> {
    if data.is_empty() {
        return vec![PipelineMessage::new(0, true, Vec::new())];
    }

    let total = data.len().div_ceil(chunk_size.get());
    let mut chunks = Vec::with_capacity(total);
    let mut remaining = data.into_iter();
    for index in 0..total {
        let data: Vec<E> = remaining.by_ref().take(chunk_size.get()).collect();
        chunks.push(PipelineMessage::new(index as u64, index + 1 == total, data));
    }
    chunks
}

/// Concatenate a chunk sequence in index order.
pub fn from_pipeline<E>(chunks: Vec<PipelineMessage<Vec<E>>>) -> Result<Vec<E>, GroupError> {
    let mut assembler = ChunkAssembler::new();
    let mut data = Vec::new();
    for chunk in chunks {
        assembler.accept(chunk.index, chunk.is_last)?;
        data.extend(chunk.data);
    }
    assembler.finish()?;
    Ok(data)
}

/// Incremental validator for one chunk sequence.
#[derive(Debug, Default, Clone)]
pub struct ChunkAssembler {
    next: u64,
    complete: bool,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next chunk header. Returns `true` once the final chunk
    /// has been seen.
    pub fn accept(&mut self, index: u64, is_last: bool) -> Result<bool, GroupError> {
        if self.complete {
            return Err(GroupError::OutOfOrderChunk {
                expected: None,
                actual: Some(index),
            });
        }
        if index != self.next {
            return Err(GroupError::OutOfOrderChunk {
                expected: Some(self.next),
                actual: Some(index),
            });
        }
        self.next += 1;
        self.complete = is_last;
        Ok(is_last)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn finish(&self) -> Result<(), GroupError> {
        if self.complete {
            Ok(())
        } else {
            Err(GroupError::OutOfOrderChunk {
                expected: Some(self.next),
                actual: None,
            })
        }
    }
}

/// Values an operator can carry: encodable with a [`Payload`] codec and
/// convertible to a chunk sequence for a given [`PipelineSpec`].
pub trait GroupData: Payload + Clone {
    fn converter(spec: PipelineSpec) -> Arc<dyn PipelineDataConverter<Self>>;
}

macro_rules! whole_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl GroupData for $ty {
                fn converter(spec: PipelineSpec) -> Arc<dyn PipelineDataConverter<Self>> {
                    if let PipelineSpec::Chunked { chunk_size } = spec {
                        tracing::debug!(
                            chunk_size = chunk_size.get(),
                            "{} cannot be chunked; sending whole values",
                            std::any::type_name::<$ty>()
                        );
                    }
                    Arc::new(DefaultPipelineDataConverter)
                }
            }
        )*
    };
}

whole_value!(i32, i64, u32, u64, f32, f64, bool, String, Bytes);

impl<E> GroupData for Vec<E>
where
    E: Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn converter(spec: PipelineSpec) -> Arc<dyn PipelineDataConverter<Self>> {
        match spec {
            PipelineSpec::Whole => Arc::new(DefaultPipelineDataConverter),
            PipelineSpec::Chunked { chunk_size } => Arc::new(ChunkingConverter::<E>::new(chunk_size)),
        }
    }
}
