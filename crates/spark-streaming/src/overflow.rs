//! # overflow 模块说明
//!
//! ## 角色定位（Why）
//! - 字节提供者的内存缓冲达到上限后，后续数据写入溢出汇，游标读取时再按需回读；
//! - 溢出对游标透明：游标只看到连续的逻辑位置。
//!
//! ## 契约（What）
//! - `write` 追加一段字节并返回令牌，令牌在 `release` 之前始终可读；
//! - `read(token, offset, len)` 必须返回恰好 `len` 字节，否则视为 I/O 失败；
//! - 共享汇可能被多个提供者并发使用，实现必须是 `Send + Sync`。

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::telemetry;

/// 溢出汇中一段数据的句柄。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OverflowToken {
    key: u64,
    len: u64,
}

impl OverflowToken {
    /// 由汇实现构造令牌；`key` 的含义由实现自行解释（文件偏移、映射键……）。
    pub fn new(key: u64, len: u64) -> Self {
        Self { key, len }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_range(&self, offset: u64, length: usize) -> io::Result<()> {
        let end = offset.checked_add(length as u64);
        match end {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {offset}+{length} outside overflow extent of {} bytes",
                    self.len
                ),
            )),
        }
    }
}

/// 溢出存储。
pub trait OverflowSink: Send + Sync {
    /// 追加一段字节。
    fn write(&self, bytes: &[u8]) -> io::Result<OverflowToken>;

    /// 回读令牌内 `[offset, offset + length)` 的字节。
    fn read(&self, token: OverflowToken, offset: u64, length: usize) -> io::Result<Bytes>;

    /// 令牌不再被需要；默认实现什么也不做。
    fn release(&self, token: OverflowToken) {
        let _ = token;
    }

    /// 当前仍被令牌引用的字节数。
    fn stored_bytes(&self) -> u64;
}

/// 配置中注入的共享溢出汇；比较时按指针判等。
#[derive(Clone)]
pub struct SharedOverflowSink(Arc<dyn OverflowSink>);

impl SharedOverflowSink {
    pub fn new(sink: Arc<dyn OverflowSink>) -> Self {
        Self(sink)
    }

    pub fn sink(&self) -> &Arc<dyn OverflowSink> {
        &self.0
    }
}

impl fmt::Debug for SharedOverflowSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedOverflowSink")
            .field("stored_bytes", &self.0.stored_bytes())
            .finish()
    }
}

impl PartialEq for SharedOverflowSink {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// 基于匿名临时文件的溢出汇。
///
/// # 教案式说明
/// - **意图 (Why)**：超大负载落盘，内存占用与负载大小解耦；
/// - **契约 (What)**：`release` 把区间还给空闲表，相邻空闲区间合并，后续写入优先复用首个
///   放得下的空闲区间；文件尾部空闲时截断，因此文件长度只随存活数据增长；
///   文件由 `tempfile` 创建，进程退出或汇被丢弃时由操作系统删除；
/// - **风险 (Trade-offs)**：
///   - 读写共用一把锁并通过 `seek` 定位，同一汇上的并发回读会串行化；
///   - 空闲表按首次适配分配，长期交错释放时中部可能留下碎片，直到两侧区间也被释放。
pub struct FileOverflowSink {
    state: Mutex<FileState>,
    stored: AtomicU64,
}

struct FileState {
    file: File,
    /// 逻辑文件长度，其后没有存活区间。
    end: u64,
    /// 存活区间：偏移 → 长度。
    live: HashMap<u64, u64>,
    /// 空闲区间：偏移 → 长度，互不相邻。
    free: BTreeMap<u64, u64>,
}

impl FileState {
    /// 首次适配：取第一个放得下的空闲区间，多余部分留在空闲表里。
    fn allocate(&mut self, len: u64) -> u64 {
        if len == 0 {
            return self.end;
        }
        let fit = self
            .free
            .iter()
            .find(|(_, free_len)| **free_len >= len)
            .map(|(offset, free_len)| (*offset, *free_len));
        match fit {
            Some((offset, free_len)) => {
                self.free.remove(&offset);
                if free_len > len {
                    self.free.insert(offset + len, free_len - len);
                }
                offset
            }
            None => {
                let offset = self.end;
                self.end += len;
                offset
            }
        }
    }

    /// 归还区间并与两侧空闲区间合并；返回文件是否因此缩短。
    fn reclaim(&mut self, mut offset: u64, mut len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let before = self
            .free
            .range(..offset)
            .next_back()
            .map(|(start, free_len)| (*start, *free_len));
        if let Some((start, free_len)) = before {
            if start + free_len == offset {
                self.free.remove(&start);
                offset = start;
                len += free_len;
            }
        }
        if let Some(after) = self.free.remove(&(offset + len)) {
            len += after;
        }
        if offset + len == self.end {
            self.end = offset;
            true
        } else {
            self.free.insert(offset, len);
            false
        }
    }
}

impl FileOverflowSink {
    /// 在系统临时目录中创建。
    pub fn new() -> io::Result<Self> {
        Ok(Self::from_file(tempfile::tempfile()?))
    }

    /// 在指定目录中创建。
    pub fn create_in(directory: impl AsRef<Path>) -> io::Result<Self> {
        let directory = directory.as_ref();
        let file = tempfile::tempfile_in(directory)?;
        debug!(
            target: telemetry::OVERFLOW,
            directory = %directory.display(),
            "overflow file created"
        );
        Ok(Self::from_file(file))
    }

    fn from_file(file: File) -> Self {
        Self {
            state: Mutex::new(FileState {
                file,
                end: 0,
                live: HashMap::new(),
                free: BTreeMap::new(),
            }),
            stored: AtomicU64::new(0),
        }
    }

    /// 磁盘上文件的实际长度。
    pub fn file_len(&self) -> io::Result<u64> {
        Ok(self.state.lock().file.metadata()?.len())
    }
}

impl OverflowSink for FileOverflowSink {
    fn write(&self, bytes: &[u8]) -> io::Result<OverflowToken> {
        let len = bytes.len() as u64;
        let mut state = self.state.lock();
        let offset = state.allocate(len);
        let written = state
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| state.file.write_all(bytes));
        if let Err(err) = written {
            state.reclaim(offset, len);
            return Err(err);
        }
        if len > 0 {
            state.live.insert(offset, len);
        }
        self.stored.fetch_add(len, Ordering::Relaxed);
        Ok(OverflowToken::new(offset, len))
    }

    fn read(&self, token: OverflowToken, offset: u64, length: usize) -> io::Result<Bytes> {
        token.check_range(offset, length)?;
        let mut buf = vec![0u8; length];
        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(token.key() + offset))?;
        state.file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn release(&self, token: OverflowToken) {
        let mut state = self.state.lock();
        if state.live.remove(&token.key()).is_none() {
            return;
        }
        self.stored.fetch_sub(token.len(), Ordering::Relaxed);
        if state.reclaim(token.key(), token.len()) {
            let end = state.end;
            if let Err(err) = state.file.set_len(end) {
                debug!(
                    target: telemetry::OVERFLOW,
                    length = end,
                    error = %err,
                    "overflow file truncation failed"
                );
            }
        }
    }

    fn stored_bytes(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }
}

/// 内存中的溢出汇，适合测试或把“溢出”交给另一级内存配额的场景。
#[derive(Default)]
pub struct MemoryOverflowSink {
    extents: Mutex<HashMap<u64, Bytes>>,
    next_key: AtomicU64,
    stored: AtomicU64,
    writes: AtomicU64,
}

impl MemoryOverflowSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累计写入次数。
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// 当前存活的令牌数量。
    pub fn live_extents(&self) -> usize {
        self.extents.lock().len()
    }
}

impl OverflowSink for MemoryOverflowSink {
    fn write(&self, bytes: &[u8]) -> io::Result<OverflowToken> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.extents.lock().insert(key, Bytes::copy_from_slice(bytes));
        self.stored.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(OverflowToken::new(key, bytes.len() as u64))
    }

    fn read(&self, token: OverflowToken, offset: u64, length: usize) -> io::Result<Bytes> {
        token.check_range(offset, length)?;
        let extents = self.extents.lock();
        let extent = extents.get(&token.key()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("overflow extent {} already released", token.key()),
            )
        })?;
        let start = offset as usize;
        Ok(extent.slice(start..start + length))
    }

    fn release(&self, token: OverflowToken) {
        if self.extents.lock().remove(&token.key()).is_some() {
            self.stored.fetch_sub(token.len(), Ordering::Relaxed);
        }
    }

    fn stored_bytes(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_reads_back_written_ranges() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let sink = FileOverflowSink::create_in(dir.path()).expect("创建溢出文件失败");
        let first = sink.write(b"hello ").expect("写入失败");
        let second = sink.write(b"world").expect("写入失败");
        assert_eq!(sink.stored_bytes(), 11);
        assert_eq!(&sink.read(second, 1, 3).expect("回读失败")[..], b"orl");
        assert_eq!(&sink.read(first, 0, 6).expect("回读失败")[..], b"hello ");

        sink.release(first);
        assert_eq!(sink.stored_bytes(), 5);
    }

    #[test]
    fn file_sink_reuses_released_ranges() {
        let sink = FileOverflowSink::new().expect("创建溢出文件失败");
        let first = sink.write(&[1u8; 100]).expect("写入失败");
        let second = sink.write(&[2u8; 100]).expect("写入失败");
        sink.release(first);
        let third = sink.write(&[3u8; 50]).expect("写入失败");
        assert_eq!(third.key(), 0, "复用首个放得下的空闲区间");
        assert_eq!(sink.file_len().expect("读取文件长度失败"), 200);
        assert_eq!(&sink.read(second, 0, 4).expect("回读失败")[..], &[2u8; 4]);

        sink.release(second);
        assert_eq!(sink.file_len().expect("读取文件长度失败"), 50, "尾部空闲区间被截断");
        sink.release(second);
        assert_eq!(sink.stored_bytes(), 50, "重复释放不影响计数");
        sink.release(third);
        assert_eq!(sink.file_len().expect("读取文件长度失败"), 0);
        assert_eq!(sink.stored_bytes(), 0);
    }

    #[test]
    fn file_length_is_bounded_by_live_data() {
        let sink = FileOverflowSink::new().expect("创建溢出文件失败");
        let mut previous = sink.write(&[0u8; 1024]).expect("写入失败");
        for round in 1..64u8 {
            let next = sink.write(&[round; 1024]).expect("写入失败");
            sink.release(previous);
            previous = next;
            assert!(
                sink.file_len().expect("读取文件长度失败") <= 2048,
                "第 {round} 轮后文件长度超过存活数据的两倍"
            );
        }
        assert_eq!(&sink.read(previous, 1020, 4).expect("回读失败")[..], &[63u8; 4]);
    }

    #[test]
    fn reads_outside_extent_are_rejected() {
        let sink = MemoryOverflowSink::new();
        let token = sink.write(b"abc").expect("写入失败");
        let err = sink.read(token, 2, 2).expect_err("越界读取必须失败");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn memory_sink_release_is_idempotent() {
        let sink = MemoryOverflowSink::new();
        let token = sink.write(b"abcdef").expect("写入失败");
        sink.release(token);
        sink.release(token);
        assert_eq!(sink.stored_bytes(), 0);
        assert_eq!(sink.live_extents(), 0);
        assert_eq!(sink.writes(), 1);
    }
}
