//! # cursor 模块说明
//!
//! ## 角色定位（Why）
//! - [`Cursor`] 是提供者之上的独立读取位置，多个游标互不影响；
//! - 字节游标实现 `std::io::Read` 与 `std::io::Seek`，可直接交给任何基于 `Read` 的解析器。
//!
//! ## 契约（What）
//! - 游标只能移动、不能克隆；关闭幂等，丢弃未关闭的游标等价于关闭并（受管时）上报泄漏；
//! - 关闭后的任何读取、定位都返回 `ClosedHandle`；所属作用域终止导致的关闭返回 `ScopeTerminated`；
//! - 读取返回 0 表示已到数据末尾，此后源不会再被轮询。

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    error::Result,
    ids::{CursorId, ProviderId},
    provider::{CursorState, ProviderCore},
    source::ReadOnce,
    telemetry,
};

/// 提供者之上的一个读取位置。
pub struct Cursor<S: ReadOnce> {
    core: Arc<ProviderCore<S>>,
    id: CursorId,
    position: u64,
    state: Arc<CursorState>,
    /// 迭代器已遇到末尾或不可恢复的错误。
    fused: bool,
}

impl<S: ReadOnce> Cursor<S> {
    pub(crate) fn new(
        core: Arc<ProviderCore<S>>,
        id: CursorId,
        position: u64,
        state: Arc<CursorState>,
    ) -> Self {
        Self {
            core,
            id,
            position,
            state,
            fused: false,
        }
    }

    pub fn id(&self) -> CursorId {
        self.id
    }

    pub fn provider_id(&self) -> ProviderId {
        self.core.id()
    }

    /// 下一次读取的逻辑位置。
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// 读取至多 `max` 个单元并交给 `visitor`，返回读取的数量。
    ///
    /// - `visitor` 可能被调用多次（数据跨越多个区段时），每次收到一段连续的数据；
    /// - 位于已缓冲区间内的读取不会触碰源；位于前沿的读取拉取一块后返回；
    /// - 返回 `Ok(0)` 表示到达末尾或 `max == 0`。
    pub fn read_with<F>(&mut self, max: usize, mut visitor: F) -> Result<usize>
    where
        F: FnMut(&[S::Item]),
    {
        let read = self
            .core
            .read_at(self.id, &self.state, self.position, max, &mut visitor)?;
        if read > 0 {
            self.position += read as u64;
            self.core.record_position(self.id, self.position);
        }
        Ok(read)
    }

    /// 读取至多 `max` 个对象；在填满之前遇到错误时返回已读到的部分。
    pub fn next_batch(&mut self, max: usize) -> Result<Vec<S::Item>> {
        let mut batch = Vec::new();
        while batch.len() < max {
            let remaining = max - batch.len();
            match self.read_with(remaining, |items| batch.extend_from_slice(items)) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if batch.is_empty() => return Err(err),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    /// 定位到逻辑位置 `position`。
    ///
    /// 早于最旧保留位置的目标返回 `SeekOutOfRange`；超出当前前沿的目标是合法的，
    /// 之后的读取会先把前沿推进到该位置。
    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.core.seek_cursor(self.id, &self.state, position)?;
        self.position = position;
        self.fused = false;
        Ok(())
    }

    /// 关闭游标；返回本次调用是否真正执行了关闭。
    pub fn close(&mut self) -> bool {
        let closed = self.core.release_cursor(self.id, &self.state);
        if closed {
            debug!(
                target: telemetry::CURSOR,
                provider_id = %self.core.id(),
                cursor_id = %self.id,
                position = self.position,
                "cursor closed"
            );
        }
        closed
    }
}

impl<S: ReadOnce<Item = u8>> Cursor<S> {
    /// 读取至多 `max` 字节；在填满之前遇到末尾或错误时返回已读到的部分。
    pub fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(max.min(64 * 1024));
        while buf.len() < max {
            let remaining = max - buf.len();
            match self.read_with(remaining, |bytes| buf.extend_from_slice(bytes)) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if buf.is_empty() => return Err(err),
                Err(_) => break,
            }
        }
        Ok(Bytes::from(buf))
    }
}

impl<S: ReadOnce<Item = u8>> Read for Cursor<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0usize;
        let read = self.read_with(buf.len(), |bytes| {
            buf[filled..filled + bytes.len()].copy_from_slice(bytes);
            filled += bytes.len();
        })?;
        Ok(read)
    }
}

impl<S: ReadOnce<Item = u8>> Seek for Cursor<S> {
    /// `SeekFrom::End` 只有在源已耗尽、总长度已知时才受支持。
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                if !self.core.is_exhausted() {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "length of a single-pass source is unknown until it is exhausted",
                    ));
                }
                self.core.frontier().checked_add_signed(delta)
            }
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            ));
        };
        Cursor::seek(self, target)?;
        Ok(target)
    }
}

impl<S: ReadOnce> Iterator for Cursor<S> {
    type Item = Result<S::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        let mut item = None;
        match self.read_with(1, |items| item = items.first().cloned()) {
            Ok(0) => {
                self.fused = true;
                None
            }
            Ok(_) => item.map(Ok),
            Err(err) => {
                self.fused = !err.is_recoverable();
                Some(Err(err))
            }
        }
    }
}

impl<S: ReadOnce> fmt::Debug for Cursor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("provider_id", &self.core.id())
            .field("position", &self.position)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<S: ReadOnce> Drop for Cursor<S> {
    fn drop(&mut self) {
        if !self.state.is_closed() {
            self.core.reclaim_cursor(self.id, &self.state, self.position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ObjectStreamingConfig, RetentionPolicy},
        provider::CursorProvider,
        source::IterSource,
    };

    #[test]
    fn iterator_yields_items_then_fuses() {
        let provider = CursorProvider::objects(
            IterSource::new(["a", "b"].into_iter()),
            &ObjectStreamingConfig::default(),
        );
        let cursor = provider.open_cursor().expect("打开游标失败");
        let items: Vec<_> = cursor.map(|item| item.expect("读取失败")).collect();
        assert_eq!(items, vec!["a", "b"]);
    }

    #[test]
    fn seek_resets_iteration_under_full_retention() {
        let config = ObjectStreamingConfig::default().with_retention(RetentionPolicy::Full);
        let provider = CursorProvider::objects(IterSource::new(0..5u32), &config);
        let mut cursor = provider.open_cursor().expect("打开游标失败");
        assert_eq!(cursor.next_batch(10).expect("读取失败"), vec![0, 1, 2, 3, 4]);
        assert!(cursor.next().is_none());
        cursor.seek(3).expect("定位失败");
        assert_eq!(cursor.next().map(|item| item.expect("读取失败")), Some(3));
    }

    #[test]
    fn close_is_idempotent() {
        let provider =
            CursorProvider::objects(IterSource::new(0..3u8), &ObjectStreamingConfig::default());
        let mut cursor = provider.open_cursor().expect("打开游标失败");
        assert!(cursor.close());
        assert!(!cursor.close());
        let err = cursor.seek(0).expect_err("关闭后不可定位");
        assert_eq!(err.code(), crate::codes::CLOSED_HANDLE);
    }
}
