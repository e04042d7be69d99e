//! # provider 模块说明
//!
//! ## 角色定位（Why）
//! - [`CursorProvider`] 独占一个单次数据源，把拉取到的数据放进缓冲，并向任意数量的游标提供
//!   彼此独立的读取位置；
//! - 缓冲只保留最慢游标之后的数据（[`RetentionPolicy::TrailingCursors`]），
//!   或在 [`RetentionPolicy::Full`] 下保留全部数据直到关闭。
//!
//! ## 并发模型（How）
//! - 源锁：前沿拉取的单写者锁，保证每个逻辑位置至多从源读取一次；拉取本身不持有存储锁，
//!   其他游标可以同时读取已缓冲的数据；
//! - 登记表锁：游标打开、推进、关闭与保留区释放在此串行；
//! - 存储读写锁：读者共享，追加与释放独占；
//! - 加锁顺序固定为 源 → 登记表 → 存储，任何路径都不逆序获取。
//!
//! ## 风险提示（Trade-offs）
//! - 前沿读取期间其他到达前沿的游标会在源锁上等待，源的阻塞时间直接传导给它们；
//! - `read_with` 的访问闭包在存储读锁内执行，闭包不应回调同一提供者的写路径。

use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use spark_buffer::SegmentPool;
use tracing::{debug, warn};

use crate::{
    config::{ByteStreamingConfig, ObjectStreamingConfig, RetentionPolicy},
    cursor::Cursor,
    error::{Result, StreamingError},
    ids::{CursorId, ProviderId, ScopeId},
    manager::{LeakNotice, ManagedLink, TrackedProvider},
    source::ReadOnce,
    store::{
        BufferStore, ByteStore, ByteStoreSettings, MaterializedStore, ObjectStore, RetainedUnits,
    },
    telemetry,
};

/// 提供者在构造时选定的缓冲策略。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum BufferStrategy {
    /// 源已完全驻留内存，游标直接读取源交出的块。
    PassThrough,
    /// 数据保存在段池段或对象批次中，超过上限即失败。
    InMemory,
    /// 超过内存上限的字节写入溢出汇。
    Overflowable,
}

/// 关闭原因，决定后续操作返回的错误与日志字段。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CloseReason {
    Explicit,
    ScopeTerminated,
    Reclaimed,
}

struct SourceSlot<S: ReadOnce> {
    source: Option<S>,
    /// 已从源读出但因缓冲失败尚未写入的块；下次前沿读取优先写入它。
    pending: Option<S::Chunk>,
    failure: Option<(io::ErrorKind, String)>,
}

pub(crate) struct CursorState {
    closed: AtomicBool,
    counted: bool,
}

impl CursorState {
    fn new(counted: bool) -> Self {
        Self {
            closed: AtomicBool::new(false),
            counted,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 首次调用返回 `true`。
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

struct CursorEntry {
    position: u64,
    state: Arc<CursorState>,
}

pub(crate) struct ProviderCore<S: ReadOnce> {
    id: ProviderId,
    strategy: BufferStrategy,
    retention: RetentionPolicy,
    pull_size: usize,
    close_reason: OnceLock<CloseReason>,
    exhausted: AtomicBool,
    source: Mutex<SourceSlot<S>>,
    registry: Mutex<HashMap<CursorId, CursorEntry>>,
    store: RwLock<Box<dyn BufferStore<S::Item>>>,
    pub(crate) link: OnceLock<Arc<ManagedLink>>,
}

/// 游标提供者：单次数据源之上的可重复读取视图。
///
/// # 教案式说明
/// - **意图 (Why)**：让多个消费者以各自的节奏读取同一份只能读一次的数据，而源只被读取一次；
/// - **契约 (What)**：
///   - 克隆得到的是同一提供者的另一个句柄，[`CursorProvider::ptr_eq`] 可判定同一性；
///   - [`CursorProvider::close`] 幂等，关闭后所有游标立即失效，缓冲归还段池，溢出令牌被释放；
///   - 最后一个句柄与游标都被丢弃时，未关闭的提供者在析构中关闭；受管提供者还会上报泄漏通知；
/// - **风险 (Trade-offs)**：游标持有提供者的强引用，未关闭的游标会让提供者一直存活，
///   直到作用域终止或游标被丢弃。
pub struct CursorProvider<S: ReadOnce> {
    core: Arc<ProviderCore<S>>,
}

impl<S: ReadOnce> Clone for CursorProvider<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: ReadOnce> fmt::Debug for CursorProvider<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorProvider")
            .field("id", &self.core.id)
            .field("strategy", &self.core.strategy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<S: ReadOnce<Item = u8>> CursorProvider<S> {
    /// 以字节缓冲构造提供者；已完全驻留内存的源走直通策略。
    pub fn bytes(mut source: S, config: &ByteStreamingConfig, pool: &SegmentPool) -> Self {
        let id = ProviderId::next();
        if let Some(chunk) = source.take_materialized() {
            return Self::materialized(id, chunk, config.retention);
        }
        let settings = ByteStoreSettings::resolve(config, pool, source.size_hint());
        let strategy = settings.strategy();
        let pull_size = settings.segment_size;
        let store = ByteStore::new(id, pool.clone(), settings);
        Self::assemble(
            id,
            Some(source),
            strategy,
            config.retention,
            pull_size,
            Box::new(store),
        )
    }
}

impl<S: ReadOnce> CursorProvider<S> {
    /// 以对象批次构造提供者；已完全驻留内存的源走直通策略。
    pub fn objects(mut source: S, config: &ObjectStreamingConfig) -> Self {
        let id = ProviderId::next();
        if let Some(chunk) = source.take_materialized() {
            return Self::materialized(id, chunk, config.retention);
        }
        let store = ObjectStore::<S::Item>::new(
            config.initial_buffer_size,
            config.buffer_size_increment,
            config.max_in_memory_instances as u64,
        );
        Self::assemble(
            id,
            Some(source),
            BufferStrategy::InMemory,
            config.retention,
            config.buffer_size_increment.max(1),
            Box::new(store),
        )
    }

    fn materialized(id: ProviderId, chunk: S::Chunk, retention: RetentionPolicy) -> Self {
        let len = chunk.as_ref().len();
        let provider = Self::assemble(
            id,
            None,
            BufferStrategy::PassThrough,
            retention,
            1,
            Box::new(MaterializedStore::new(chunk, len)),
        );
        provider.core.exhausted.store(true, Ordering::Release);
        provider
    }

    fn assemble(
        id: ProviderId,
        source: Option<S>,
        strategy: BufferStrategy,
        retention: RetentionPolicy,
        pull_size: usize,
        store: Box<dyn BufferStore<S::Item>>,
    ) -> Self {
        debug!(
            target: telemetry::PROVIDER,
            provider_id = %id,
            strategy = ?strategy,
            retention = ?retention,
            "cursor provider created"
        );
        Self {
            core: Arc::new(ProviderCore {
                id,
                strategy,
                retention,
                pull_size,
                close_reason: OnceLock::new(),
                exhausted: AtomicBool::new(false),
                source: Mutex::new(SourceSlot {
                    source,
                    pending: None,
                    failure: None,
                }),
                registry: Mutex::new(HashMap::new()),
                store: RwLock::new(store),
                link: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> ProviderId {
        self.core.id
    }

    pub fn strategy(&self) -> BufferStrategy {
        self.core.strategy
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.core.retention
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// 是否已登记到某个管理器。
    pub fn is_managed(&self) -> bool {
        self.core.link.get().is_some()
    }

    /// 源是否已经读到末尾。
    pub fn is_exhausted(&self) -> bool {
        self.core.is_exhausted()
    }

    /// 已从源拉取的单元总数。
    pub fn frontier(&self) -> u64 {
        self.core.frontier()
    }

    /// 当前保留的数据量。
    pub fn retained(&self) -> RetainedUnits {
        self.core.store.read().retained()
    }

    /// 当前打开的游标数量。
    pub fn open_cursors(&self) -> usize {
        self.core.registry.lock().len()
    }

    /// 两个句柄是否指向同一提供者。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// 打开一个新游标，起点为仍被保留的最旧位置。
    pub fn open_cursor(&self) -> Result<Cursor<S>> {
        let core = &self.core;
        let id = CursorId::next();
        let (start, state) = {
            let mut registry = core.registry.lock();
            if core.is_closed() {
                return Err(core.closed_error("open_cursor"));
            }
            let start = core.store.read().base();
            let link = core.link.get().filter(|link| link.is_active());
            let state = Arc::new(CursorState::new(link.is_some()));
            if let Some(link) = link {
                link.cursor_opened();
            }
            registry.insert(
                id,
                CursorEntry {
                    position: start,
                    state: Arc::clone(&state),
                },
            );
            (start, state)
        };
        debug!(
            target: telemetry::CURSOR,
            provider_id = %core.id,
            cursor_id = %id,
            position = start,
            "cursor opened"
        );
        Ok(Cursor::new(Arc::clone(core), id, start, state))
    }

    /// 关闭提供者及其全部游标；返回本次调用是否真正执行了关闭。
    pub fn close(&self) -> bool {
        self.core.shutdown(CloseReason::Explicit)
    }

    pub(crate) fn core(&self) -> &Arc<ProviderCore<S>> {
        &self.core
    }
}

impl<S: ReadOnce> ProviderCore<S> {
    pub(crate) fn id(&self) -> ProviderId {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_reason.get().is_some()
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub(crate) fn frontier(&self) -> u64 {
        self.store.read().end()
    }

    /// 挂接管理器链接并计入打开的提供者。
    ///
    /// 在登记表锁下完成，与 `open_cursor` 和关闭互斥：此后打开的游标一定被计数。
    /// 已挂接过时返回先前的作用域。
    pub(crate) fn attach(&self, link: &Arc<ManagedLink>) -> Result<Option<ScopeId>> {
        let _registry = self.registry.lock();
        if self.link.set(Arc::clone(link)).is_err() {
            return Ok(self.link.get().map(|existing| existing.scope()));
        }
        if self.is_closed() {
            return Err(self.closed_error("manage"));
        }
        link.activate();
        Ok(None)
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error(operation));
        }
        Ok(())
    }

    /// 作用域终止导致的关闭报告为 `ScopeTerminated`，其余报告为 `ClosedHandle`。
    pub(crate) fn closed_error(&self, operation: &'static str) -> StreamingError {
        debug!(
            target: telemetry::PROVIDER,
            provider_id = %self.id,
            operation,
            "operation on closed cursor provider"
        );
        match (self.close_reason.get(), self.link.get()) {
            (Some(CloseReason::ScopeTerminated), Some(link)) => StreamingError::ScopeTerminated {
                scope: link.scope(),
            },
            _ => StreamingError::closed_provider(self.id.get()),
        }
    }

    fn check_cursor(&self, cursor: CursorId, state: &CursorState) -> Result<()> {
        if !state.is_closed() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(self.closed_error("cursor"));
        }
        debug!(
            target: telemetry::CURSOR,
            provider_id = %self.id,
            cursor_id = %cursor,
            "operation on closed cursor"
        );
        Err(StreamingError::closed_cursor(cursor.get()))
    }

    /// 从 `position` 起读取至多 `max` 个单元；返回 0 表示已到数据末尾。
    pub(crate) fn read_at(
        &self,
        cursor: CursorId,
        state: &CursorState,
        position: u64,
        max: usize,
        visitor: &mut dyn FnMut(&[S::Item]),
    ) -> Result<usize> {
        loop {
            self.check_cursor(cursor, state)?;
            if max == 0 {
                return Ok(0);
            }
            let visited = {
                let store = self.store.read();
                self.ensure_open("read")?;
                if position < store.end() {
                    store.visit(position, max, visitor)?
                } else {
                    0
                }
            };
            if visited > 0 {
                return Ok(visited);
            }
            if !self.pull_frontier(position)? {
                return Ok(0);
            }
            // 越过前沿的定位会让新拉取的区段整体落在所有游标之后。
            let registry = self.registry.lock();
            self.release_behind(&registry);
        }
    }

    /// 在源锁下把前沿推进一块；返回 `false` 表示源已耗尽。
    fn pull_frontier(&self, wanted: u64) -> Result<bool> {
        let mut slot = self.source.lock();
        self.ensure_open("read")?;
        if self.store.read().end() > wanted {
            return Ok(true);
        }
        if let Some((kind, message)) = &slot.failure {
            return Err(StreamingError::SourceReadFailure(io::Error::new(
                *kind,
                message.clone(),
            )));
        }

        let chunk = match slot.pending.take() {
            Some(chunk) => chunk,
            None => {
                let Some(source) = slot.source.as_mut() else {
                    return Ok(false);
                };
                match next_non_empty(source, self.pull_size) {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        slot.source = None;
                        self.exhausted.store(true, Ordering::Release);
                        debug!(
                            target: telemetry::PROVIDER,
                            provider_id = %self.id,
                            frontier = wanted,
                            "single-pass source exhausted"
                        );
                        return Ok(false);
                    }
                    Err(err) => {
                        warn!(
                            target: telemetry::PROVIDER,
                            provider_id = %self.id,
                            frontier = wanted,
                            error = %err,
                            "single-pass source failed"
                        );
                        slot.failure = Some((err.kind(), err.to_string()));
                        slot.source = None;
                        return Err(StreamingError::SourceReadFailure(err));
                    }
                }
            }
        };

        let appended = self.store.write().append(chunk.as_ref());
        match appended {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!(
                    target: telemetry::PROVIDER,
                    provider_id = %self.id,
                    code = err.code(),
                    "buffer growth failed, chunk kept for retry"
                );
                slot.pending = Some(chunk);
                Err(err)
            }
        }
    }

    pub(crate) fn record_position(&self, cursor: CursorId, position: u64) {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.get_mut(&cursor) {
            entry.position = position;
        }
        self.release_behind(&registry);
    }

    pub(crate) fn seek_cursor(
        &self,
        cursor: CursorId,
        state: &CursorState,
        target: u64,
    ) -> Result<()> {
        self.check_cursor(cursor, state)?;
        let mut registry = self.registry.lock();
        self.ensure_open("seek")?;
        let oldest = self.store.read().base();
        if target < oldest {
            return Err(StreamingError::SeekOutOfRange {
                requested: target,
                oldest,
            });
        }
        if let Some(entry) = registry.get_mut(&cursor) {
            entry.position = target;
        }
        self.release_behind(&registry);
        Ok(())
    }

    /// 释放所有游标都已越过的整段区段。
    fn release_behind(&self, registry: &HashMap<CursorId, CursorEntry>) {
        if self.retention == RetentionPolicy::Full {
            return;
        }
        let Some(min) = registry.values().map(|entry| entry.position).min() else {
            return;
        };
        let due = self
            .store
            .read()
            .first_release_boundary()
            .is_some_and(|boundary| boundary <= min);
        if due {
            self.store.write().release_before(min);
        }
    }

    /// 关闭单个游标；返回本次调用是否真正执行了关闭。
    pub(crate) fn release_cursor(&self, cursor: CursorId, state: &CursorState) -> bool {
        {
            let mut registry = self.registry.lock();
            if !state.mark_closed() {
                return false;
            }
            registry.remove(&cursor);
            self.release_behind(&registry);
        }
        if state.counted {
            if let Some(link) = self.link.get() {
                link.cursor_closed();
            }
        }
        true
    }

    /// 游标被丢弃而未关闭：关闭它，受管时上报泄漏。
    pub(crate) fn reclaim_cursor(&self, cursor: CursorId, state: &CursorState, position: u64) {
        if !self.release_cursor(cursor, state) {
            return;
        }
        if let Some(link) = self.link.get() {
            link.report_leak(LeakNotice::cursor(cursor, self.id, link.scope(), position));
        }
    }

    /// 关闭提供者；只有第一次调用生效。
    pub(crate) fn shutdown(&self, reason: CloseReason) -> bool {
        let cursors: Vec<Arc<CursorState>> = {
            let mut registry = self.registry.lock();
            if self.close_reason.set(reason).is_err() {
                return false;
            }
            registry.drain().map(|(_, entry)| entry.state).collect()
        };

        let link = self.link.get();
        let mut closed_cursors = 0usize;
        for state in cursors {
            if state.mark_closed() {
                closed_cursors += 1;
                if state.counted {
                    if let Some(link) = link {
                        link.cursor_closed();
                    }
                }
            }
        }

        {
            let mut slot = self.source.lock();
            slot.source = None;
            slot.pending = None;
        }
        self.store.write().clear();

        if let Some(link) = link {
            link.release_provider(self.id);
        }
        debug!(
            target: telemetry::PROVIDER,
            provider_id = %self.id,
            reason = ?reason,
            closed_cursors,
            "cursor provider closed"
        );
        true
    }
}

fn next_non_empty<S: ReadOnce>(source: &mut S, max_len: usize) -> io::Result<Option<S::Chunk>> {
    loop {
        match source.next_chunk(max_len) {
            Ok(Some(chunk)) if chunk.as_ref().is_empty() => continue,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

impl<S: ReadOnce> TrackedProvider for ProviderCore<S> {
    fn provider_id(&self) -> ProviderId {
        self.id
    }

    fn force_close(&self) -> bool {
        self.shutdown(CloseReason::ScopeTerminated)
    }
}

impl<S: ReadOnce> Drop for ProviderCore<S> {
    fn drop(&mut self) {
        let frontier = self.store.read().end();
        if self.shutdown(CloseReason::Reclaimed) {
            if let Some(link) = self.link.get() {
                link.report_leak(LeakNotice::provider(self.id, link.scope(), frontier));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ByteSize,
        source::{BytesSource, ReaderSource, VecSource},
    };
    use spark_buffer::PoolConfig;

    fn pool() -> SegmentPool {
        SegmentPool::new(PoolConfig {
            min_segment_size: 8,
            max_segment_size: 64,
            ..PoolConfig::default()
        })
    }

    fn small_config() -> ByteStreamingConfig {
        ByteStreamingConfig {
            initial_buffer_size: ByteSize::bytes(8),
            buffer_size_increment: ByteSize::bytes(8),
            max_in_memory_size: ByteSize::bytes(1024),
            ..ByteStreamingConfig::default()
        }
        .in_memory()
    }

    fn reader(len: usize) -> ReaderSource<io::Cursor<Vec<u8>>> {
        ReaderSource::new(io::Cursor::new((0..len).map(|i| i as u8).collect()))
    }

    #[test]
    fn materialized_sources_use_pass_through() {
        let provider = CursorProvider::bytes(BytesSource::new(&b"abc"[..]), &small_config(), &pool());
        assert_eq!(provider.strategy(), BufferStrategy::PassThrough);
        assert!(provider.is_exhausted());
        assert_eq!(provider.frontier(), 3);

        let objects = CursorProvider::objects(
            VecSource::new(vec![1, 2, 3]),
            &ObjectStreamingConfig::default(),
        );
        assert_eq!(objects.strategy(), BufferStrategy::PassThrough);
    }

    #[test]
    fn trailing_release_follows_slowest_cursor() {
        let pool = pool();
        let provider = CursorProvider::bytes(reader(64), &small_config(), &pool);
        let mut fast = provider.open_cursor().expect("打开游标失败");
        let mut slow = provider.open_cursor().expect("打开游标失败");

        assert_eq!(fast.read_chunk(32).expect("读取失败").len(), 32);
        assert_eq!(provider.retained().in_memory, 32, "慢游标仍在 0，不得释放");

        assert_eq!(slow.read_chunk(20).expect("读取失败").len(), 20);
        let retained = provider.retained();
        assert_eq!(retained.base, 16);
        assert_eq!(retained.in_memory, 16);

        let late = provider.open_cursor().expect("打开游标失败");
        assert_eq!(late.position(), 16, "新游标从最旧保留位置开始");
        drop((fast, slow, late));
        assert!(provider.close());
        assert_eq!(pool.statistics().active_leases, 0);
    }

    #[test]
    fn close_invalidates_cursors_and_is_idempotent() {
        let provider = CursorProvider::bytes(reader(16), &small_config(), &pool());
        let mut cursor = provider.open_cursor().expect("打开游标失败");
        assert!(provider.close());
        assert!(!provider.close());
        assert!(cursor.is_closed());
        let err = cursor.read_chunk(4).expect_err("已关闭提供者的游标不可读");
        assert_eq!(err.code(), crate::codes::CLOSED_HANDLE);
        let err = provider.open_cursor().expect_err("已关闭提供者不可打开游标");
        assert_eq!(err.code(), crate::codes::CLOSED_HANDLE);
        assert_eq!(provider.open_cursors(), 0);
    }
}
