//! # source 模块说明
//!
//! ## 角色定位（Why）
//! - [`ReadOnce`] 抽象“只能顺序读取一次”的数据源：网络连接、文件句柄、惰性迭代器；
//! - 提供者在前沿处以块为单位拉取数据，块类型由源自行决定，避免不必要的复制。
//!
//! ## 契约（What）
//! - `next_chunk(max)` 返回至多 `max` 个单元；`Ok(None)` 表示源已耗尽，之后不会再被调用；
//! - 返回空块等价于“暂无进展”，提供者会立即再次拉取；
//! - `ErrorKind::Interrupted` 会被重试，其余错误视为硬失败；
//! - `take_materialized` 返回 `Some` 表示源已把全部数据放在内存中，提供者将直接在该块上服务读取，
//!   不再调用 `next_chunk`。

use std::io::{self, Read};

use bytes::Bytes;

/// 可被缓冲的单元类型：字节或任意可克隆、可跨线程共享的对象。
pub trait StreamItem: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> StreamItem for T {}

/// 单次读取的数据源。
///
/// # 教案式说明
/// - **意图 (Why)**：把传输层的各种“读一次”接口统一成块拉取模型，供提供者在单写者锁下调用；
/// - **契约 (What)**：实现只会被一个线程在同一时刻调用；返回的块会被复制进缓冲或直接保留；
/// - **风险 (Trade-offs)**：`size_hint` 仅作为首段尺寸与策略选择的参考，实际长度超出提示时
///   提供者仍然按常规路径增长，不会截断。
pub trait ReadOnce: Send + 'static {
    /// 单元类型；字节流为 `u8`。
    type Item: StreamItem;
    /// 一次拉取返回的块。
    type Chunk: AsRef<[Self::Item]> + Send + Sync + 'static;

    /// 拉取至多 `max_len` 个单元。
    fn next_chunk(&mut self, max_len: usize) -> io::Result<Option<Self::Chunk>>;

    /// 剩余单元数量的提示。
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// 若源已完全驻留内存，一次性交出全部数据。
    fn take_materialized(&mut self) -> Option<Self::Chunk> {
        None
    }
}

/// 把任意 [`Read`] 适配为字节源。
pub struct ReaderSource<R> {
    reader: R,
    size_hint: Option<u64>,
}

impl<R: Read + Send + 'static> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            size_hint: None,
        }
    }

    /// 附带长度提示，例如来自 `Content-Length`。
    pub fn with_size_hint(mut self, hint: u64) -> Self {
        self.size_hint = Some(hint);
        self
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Send + 'static> ReadOnce for ReaderSource<R> {
    type Item = u8;
    type Chunk = Bytes;

    fn next_chunk(&mut self, max_len: usize) -> io::Result<Option<Bytes>> {
        let mut buf = vec![0u8; max_len.max(1)];
        let read = self.reader.read(&mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        if let Some(hint) = self.size_hint.as_mut() {
            *hint = hint.saturating_sub(read as u64);
        }
        Ok(Some(Bytes::from(buf)))
    }

    fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }
}

/// 已完全驻留内存的字节负载。
#[derive(Clone, Debug, Default)]
pub struct BytesSource {
    bytes: Bytes,
}

impl BytesSource {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl ReadOnce for BytesSource {
    type Item = u8;
    type Chunk = Bytes;

    fn next_chunk(&mut self, max_len: usize) -> io::Result<Option<Bytes>> {
        if self.bytes.is_empty() {
            return Ok(None);
        }
        let take = max_len.max(1).min(self.bytes.len());
        Ok(Some(self.bytes.split_to(take)))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }

    fn take_materialized(&mut self) -> Option<Bytes> {
        Some(std::mem::take(&mut self.bytes))
    }
}

/// 把惰性迭代器适配为对象源。
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: StreamItem,
{
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I> ReadOnce for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: StreamItem,
{
    type Item = I::Item;
    type Chunk = Vec<I::Item>;

    fn next_chunk(&mut self, max_len: usize) -> io::Result<Option<Vec<I::Item>>> {
        let chunk: Vec<_> = self.iter.by_ref().take(max_len.max(1)).collect();
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn size_hint(&self) -> Option<u64> {
        match self.iter.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower as u64),
            _ => None,
        }
    }
}

/// 已完全驻留内存的对象集合。
pub struct VecSource<T> {
    items: std::vec::IntoIter<T>,
}

impl<T: StreamItem> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<T: StreamItem> ReadOnce for VecSource<T> {
    type Item = T;
    type Chunk = Vec<T>;

    fn next_chunk(&mut self, max_len: usize) -> io::Result<Option<Vec<T>>> {
        let chunk: Vec<_> = self.items.by_ref().take(max_len.max(1)).collect();
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.items.len() as u64)
    }

    fn take_materialized(&mut self) -> Option<Vec<T>> {
        Some(self.items.by_ref().collect())
    }
}
