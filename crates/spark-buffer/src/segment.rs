use std::{fmt, mem, sync::Arc};

/// `SegmentRecycler` 描述段在生命周期结束时的回收入口。
///
/// # 设计初衷（Why）
/// - 段的持有者（游标提供者）只关心“读写字节”，不应关心段如何回到池中；
/// - 将回收逻辑集中到 `Segment` 的 `Drop` 中，调用方即便忘记显式归还，也不会让池统计失真。
///
/// # 契约定义（What）
/// - **前置条件**：实现必须线程安全，且 `reclaim` 不得 panic，否则 `Drop` 路径上的 panic
///   会导致进程异常终止；
/// - **后置条件**：调用结束后，池应已记录该容量的可用性，或者明确释放了这块内存。
pub trait SegmentRecycler: Send + Sync + 'static {
    /// 通知池回收一块段内存。
    fn reclaim(&self, reclaimed: ReclaimedSegment);
}

/// 一次回收动作携带的上下文。
///
/// - `class`：段所属的容量等级下标；
/// - `buffer`：段的底层内存，长度已清零，容量不小于等级容量。
#[derive(Debug)]
pub struct ReclaimedSegment {
    class: usize,
    capacity: usize,
    buffer: Vec<u8>,
}

impl ReclaimedSegment {
    /// 返回容量等级下标。
    pub fn class(&self) -> usize {
        self.class
    }

    /// 返回段的逻辑容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 消耗结构并返回底层内存。
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// `Segment` 是一块定长的连续内存，记录已使用长度。
///
/// # 设计动机（Why）
/// - 游标提供者按需追加段来保存从单次数据源拉取的字节；段容量固定，追加永不触发重新分配或拷贝，
///   已交给游标读取的偏移因此保持稳定；
/// - 段只能被移动、不能被克隆，保证任意时刻只有一个提供者拥有它。
///
/// # 契约说明（What）
/// - `capacity()` 为等级容量，`len()` 为已写入长度，`append` 只会写满剩余空间而不会扩容；
/// - `Drop` 时若段来自池，则恰好触发一次 [`SegmentRecycler::reclaim`]。
pub struct Segment {
    buffer: Vec<u8>,
    capacity: usize,
    class: usize,
    recycler: Option<Arc<dyn SegmentRecycler>>,
}

impl Segment {
    /// 使用已分配的内存与回收句柄构造段。
    ///
    /// # 前置条件
    /// - `buffer.capacity() >= capacity`，且 `buffer` 未被其它段共享；
    ///
    /// # 后置条件
    /// - 返回的段长度为 0；`Drop` 时 `recycler` 会收到 `class` 与内存。
    pub fn new(
        mut buffer: Vec<u8>,
        capacity: usize,
        class: usize,
        recycler: Arc<dyn SegmentRecycler>,
    ) -> Self {
        buffer.clear();
        debug_assert!(buffer.capacity() >= capacity);
        Self {
            buffer,
            capacity,
            class,
            recycler: Some(recycler),
        }
    }

    /// 构造不属于任何池的段，主要用于测试与直通场景。
    pub fn detached(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            class: 0,
            recycler: None,
        }
    }

    /// 段的逻辑容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 已写入的字节数。
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// 剩余可写空间。
    pub fn remaining_mut(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    pub fn is_full(&self) -> bool {
        self.remaining_mut() == 0
    }

    /// 容量等级下标。
    pub fn class(&self) -> usize {
        self.class
    }

    /// 已写入内容的只读视图。
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// 追加字节，最多写满剩余空间，返回实际写入的字节数。
    pub fn append(&mut self, src: &[u8]) -> usize {
        let take = src.len().min(self.remaining_mut());
        self.buffer.extend_from_slice(&src[..take]);
        take
    }

    /// 将已使用长度截断为 `len`，用于回滚失败的追加。
    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
    }

    /// 清空已使用长度，保留容量。
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("len", &self.buffer.len())
            .field("capacity", &self.capacity)
            .field("class", &self.class)
            .field("pooled", &self.recycler.is_some())
            .finish()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Some(recycler) = self.recycler.take() {
            let mut buffer = mem::take(&mut self.buffer);
            buffer.clear();
            recycler.reclaim(ReclaimedSegment {
                class: self.class,
                capacity: self.capacity,
                buffer,
            });
        }
    }
}
