//! 对象批次存储。
//!
//! 每个批次是一个固定容量的 `Vec<T>`，首批容量为 `initial_batch`，之后为 `batch_size`；
//! 对象没有溢出去处，超过 `max_in_memory` 条即以 `BufferSizeExceeded` 失败。

use std::collections::VecDeque;

use spark_buffer::PoolError;

use super::{BufferStore, RetainedUnits, check_visit_start};
use crate::error::{Result, StreamingError};

struct Batch<T> {
    start: u64,
    items: Vec<T>,
}

impl<T> Batch<T> {
    fn end(&self) -> u64 {
        self.start + self.items.len() as u64
    }

    fn room(&self) -> usize {
        self.items.capacity() - self.items.len()
    }
}

pub(crate) struct ObjectStore<T> {
    batches: VecDeque<Batch<T>>,
    base: u64,
    end: u64,
    in_memory: u64,
    initial_batch: usize,
    batch_size: usize,
    max_in_memory: u64,
}

impl<T> ObjectStore<T> {
    pub(crate) fn new(initial_batch: usize, batch_size: usize, max_in_memory: u64) -> Self {
        Self {
            batches: VecDeque::new(),
            base: 0,
            end: 0,
            in_memory: 0,
            initial_batch: initial_batch.max(1),
            batch_size: batch_size.max(1),
            max_in_memory,
        }
    }

    fn allocate(&self, capacity: usize) -> Result<Vec<T>> {
        let mut items = Vec::new();
        items.try_reserve_exact(capacity).map_err(|_| {
            StreamingError::ResourceExhausted(PoolError::Exhausted {
                requested: capacity.saturating_mul(std::mem::size_of::<T>()),
                resident: (self.in_memory as usize).saturating_mul(std::mem::size_of::<T>()),
                limit: None,
            })
        })?;
        Ok(items)
    }
}

impl<T: Clone + Send + Sync> BufferStore<T> for ObjectStore<T> {
    fn append(&mut self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let len = items.len() as u64;
        if self.in_memory + len > self.max_in_memory {
            return Err(StreamingError::BufferSizeExceeded {
                limit: self.max_in_memory,
                retained: self.in_memory,
                requested: len,
            });
        }

        let tail_room = self.batches.back().map_or(0, Batch::room);
        let mut fresh = Vec::new();
        let mut covered = tail_room;
        while covered < items.len() {
            let capacity = if self.end == 0 && fresh.is_empty() {
                self.initial_batch
            } else {
                self.batch_size
            };
            let batch = self.allocate(capacity)?;
            covered += batch.capacity();
            fresh.push(batch);
        }

        let mut rest = items;
        if let Some(tail) = self.batches.back_mut() {
            let take = tail.room().min(rest.len());
            tail.items.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        let mut start = self.end + (items.len() - rest.len()) as u64;
        for mut batch in fresh {
            let take = batch.capacity().min(rest.len());
            batch.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            self.batches.push_back(Batch {
                start,
                items: batch,
            });
            start += take as u64;
        }
        self.in_memory += len;
        self.end += len;
        Ok(())
    }

    fn visit(&self, pos: u64, max: usize, visitor: &mut dyn FnMut(&[T])) -> Result<usize> {
        check_visit_start(pos, self.base)?;
        let mut pos = pos;
        let mut visited = 0usize;
        let mut index = self.batches.partition_point(|batch| batch.end() <= pos);
        while visited < max && pos < self.end {
            let Some(batch) = self.batches.get(index) else {
                break;
            };
            let offset = (pos - batch.start) as usize;
            let take = (batch.items.len() - offset).min(max - visited);
            visitor(&batch.items[offset..offset + take]);
            visited += take;
            pos += take as u64;
            index += 1;
        }
        Ok(visited)
    }

    fn release_before(&mut self, pos: u64) {
        while self.batches.front().is_some_and(|batch| batch.end() <= pos) {
            if let Some(batch) = self.batches.pop_front() {
                self.in_memory -= batch.items.len() as u64;
            }
        }
        self.base = self.batches.front().map_or(self.end, |batch| batch.start);
    }

    fn first_release_boundary(&self) -> Option<u64> {
        self.batches.front().map(Batch::end)
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn end(&self) -> u64 {
        self.end
    }

    fn retained(&self) -> RetainedUnits {
        RetainedUnits {
            base: self.base,
            frontier: self.end,
            in_memory: self.in_memory,
            extents: self.batches.len(),
            ..RetainedUnits::default()
        }
    }

    fn clear(&mut self) {
        self.batches.clear();
        self.in_memory = 0;
        self.base = self.end;
    }
}
