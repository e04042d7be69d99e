//! # store 模块说明
//!
//! ## 角色定位（Why）
//! - 提供者把“已经从源拉取、仍可能被游标读取”的数据交给存储；存储只关心逻辑位置区间
//!   `[base, end)`，不感知游标；
//! - 三种实现对应三种缓冲形态：池化字节段（可溢出）、对象批次、源自带的完整块。
//!
//! ## 契约（What）
//! - `append` 要么完整写入，要么不改变任何状态（失败时已租借的段全部归还）；
//! - `visit` 从 `pos` 起至多访问 `max` 个单元，可能跨越多个区段，返回实际访问的数量；
//! - `release_before(pos)` 只释放完全位于 `pos` 之前的整段区段，因此 `base <= pos`；
//! - `clear` 释放全部资源并把 `base` 推进到 `end`。

mod batched;
mod segmented;

pub(crate) use self::batched::ObjectStore;
pub(crate) use self::segmented::{ByteStore, ByteStoreSettings};

use serde::Serialize;

use crate::error::{Result, StreamingError};

/// 提供者当前保留的数据量快照。
///
/// `in_memory` 与 `overflowed` 的单位与提供者一致（字节或条目）；
/// `materialized` 统计由源直接交出的完整块，它不占用段池。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RetainedUnits {
    pub base: u64,
    pub frontier: u64,
    pub in_memory: u64,
    pub overflowed: u64,
    pub materialized: u64,
    pub extents: usize,
}

impl RetainedUnits {
    /// 内存与溢出合计保留的单元数。
    pub fn total(&self) -> u64 {
        self.in_memory + self.overflowed
    }
}

/// 单个提供者的缓冲存储。
pub(crate) trait BufferStore<T>: Send + Sync {
    fn append(&mut self, items: &[T]) -> Result<()>;

    fn visit(&self, pos: u64, max: usize, visitor: &mut dyn FnMut(&[T])) -> Result<usize>;

    fn release_before(&mut self, pos: u64);

    /// 第一个区段的结束位置；游标最小位置越过它时才值得获取写锁释放。
    fn first_release_boundary(&self) -> Option<u64>;

    fn base(&self) -> u64;

    fn end(&self) -> u64;

    fn retained(&self) -> RetainedUnits;

    fn clear(&mut self);
}

pub(crate) fn check_visit_start(pos: u64, base: u64) -> Result<()> {
    if pos < base {
        return Err(StreamingError::SeekOutOfRange {
            requested: pos,
            oldest: base,
        });
    }
    Ok(())
}

/// 直接在源交出的完整块上服务读取。
pub(crate) struct MaterializedStore<C> {
    chunk: Option<C>,
    len: u64,
}

impl<C> MaterializedStore<C> {
    pub(crate) fn new(chunk: C, len: usize) -> Self {
        Self {
            chunk: Some(chunk),
            len: len as u64,
        }
    }
}

impl<T, C> BufferStore<T> for MaterializedStore<C>
where
    C: AsRef<[T]> + Send + Sync,
{
    fn append(&mut self, items: &[T]) -> Result<()> {
        debug_assert!(items.is_empty(), "materialized sources never pull");
        Ok(())
    }

    fn visit(&self, pos: u64, max: usize, visitor: &mut dyn FnMut(&[T])) -> Result<usize> {
        let Some(chunk) = self.chunk.as_ref() else {
            return check_visit_start(pos, self.len).map(|_| 0);
        };
        let items = chunk.as_ref();
        if pos >= self.len || max == 0 {
            return Ok(0);
        }
        let start = pos as usize;
        let end = start + max.min(items.len() - start);
        visitor(&items[start..end]);
        Ok(end - start)
    }

    fn release_before(&mut self, _pos: u64) {}

    fn first_release_boundary(&self) -> Option<u64> {
        None
    }

    fn base(&self) -> u64 {
        if self.chunk.is_some() { 0 } else { self.len }
    }

    fn end(&self) -> u64 {
        self.len
    }

    fn retained(&self) -> RetainedUnits {
        let held = if self.chunk.is_some() { self.len } else { 0 };
        RetainedUnits {
            base: self.base(),
            frontier: self.len,
            materialized: held,
            extents: usize::from(self.chunk.is_some()),
            ..RetainedUnits::default()
        }
    }

    fn clear(&mut self) {
        self.chunk = None;
    }
}
