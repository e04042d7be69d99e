//! # manager 模块说明
//!
//! ## 角色定位（Why）
//! - [`CursorManager`] 把提供者绑定到事件作用域：作用域终止时强制关闭其下所有仍打开的提供者；
//! - 维护打开句柄的计数，并处理“丢弃而未关闭”的句柄（泄漏）的回收记录。
//!
//! ## 回收模型（How）
//! - 游标与提供者都是只能移动的所有者，析构函数总会执行关闭逻辑，资源不依赖回收线程释放；
//! - 受管句柄被丢弃而未关闭时，析构函数额外向回收队列投递一条 [`LeakNotice`]；
//! - 回收流程（后台线程或 [`CursorManager::run_reclamation`]）消费通知：记录告警、
//!   从作用域跟踪条目中剔除失效提供者、累加回收计数；它从不向应用代码返回错误。
//!
//! ## 风险提示（Trade-offs）
//! - 跟踪条目只持有提供者的弱引用，作用域终止时已被回收的提供者会被直接跳过；
//! - 作用域的跟踪条目在终止前一直存在，即使其下的提供者已全部关闭。

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, warn};

use crate::{
    config::ReclamationConfig,
    error::{HandleKind, Result, StreamingError},
    ids::{CursorId, ProviderId, ScopeId},
    provider::CursorProvider,
    scope::EventScope,
    source::ReadOnce,
    statistics::{StatsCounters, StreamingStatistics},
    telemetry,
};

/// 跟踪条目对提供者的类型擦除视图。
pub(crate) trait TrackedProvider: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    /// 以“作用域终止”为原因关闭；返回本次调用是否真正执行了关闭。
    fn force_close(&self) -> bool;
}

/// 句柄被丢弃而未关闭的记录。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeakNotice {
    pub kind: HandleKind,
    pub provider: ProviderId,
    pub cursor: Option<CursorId>,
    pub scope: ScopeId,
    /// 游标泄漏时为游标位置，提供者泄漏时为前沿。
    pub position: u64,
}

impl LeakNotice {
    pub(crate) fn cursor(
        cursor: CursorId,
        provider: ProviderId,
        scope: ScopeId,
        position: u64,
    ) -> Self {
        Self {
            kind: HandleKind::Cursor,
            provider,
            cursor: Some(cursor),
            scope,
            position,
        }
    }

    pub(crate) fn provider(provider: ProviderId, scope: ScopeId, frontier: u64) -> Self {
        Self {
            kind: HandleKind::Provider,
            provider,
            cursor: None,
            scope,
            position: frontier,
        }
    }
}

enum ReclaimMessage {
    Leak(LeakNotice),
    Shutdown,
}

#[derive(Default)]
struct TrackingEntry {
    providers: HashMap<ProviderId, Weak<dyn TrackedProvider>>,
    terminated: bool,
}

/// 管理器的共享状态，被提供者的 [`ManagedLink`] 与回收线程共同持有。
pub(crate) struct ManagerShared {
    stats: StatsCounters,
    scopes: DashMap<ScopeId, TrackingEntry>,
    notices: Sender<ReclaimMessage>,
    inbox: Receiver<ReclaimMessage>,
}

impl ManagerShared {
    fn new() -> Arc<Self> {
        let (notices, inbox) = unbounded();
        Arc::new(Self {
            stats: StatsCounters::default(),
            scopes: DashMap::new(),
            notices,
            inbox,
        })
    }

    pub(crate) fn statistics(&self) -> StreamingStatistics {
        self.stats.snapshot(self.scopes.len())
    }

    /// 把提供者登记到作用域；已登记的提供者原样返回。
    pub(crate) fn manage<S: ReadOnce>(
        self: &Arc<Self>,
        provider: CursorProvider<S>,
        scope: &dyn EventScope,
    ) -> Result<ManagedCursorProvider<S>> {
        let core = Arc::clone(provider.core());
        if let Some(link) = core.link.get() {
            return Ok(ManagedCursorProvider::new(provider, link.scope()));
        }

        let scope_id = scope.id();
        if scope.is_terminated() {
            provider.close();
            return Err(StreamingError::ScopeTerminated { scope: scope_id });
        }

        let link = Arc::new(ManagedLink::new(Arc::clone(self), scope_id));
        if let Some(existing) = core.attach(&link)? {
            return Ok(ManagedCursorProvider::new(provider, existing));
        }

        let weak: Weak<dyn TrackedProvider> = Arc::downgrade(&core) as Weak<dyn TrackedProvider>;
        let (fresh, rejected) = match self.scopes.entry(scope_id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.terminated {
                    (false, true)
                } else {
                    entry.providers.insert(core.id(), weak);
                    (false, false)
                }
            }
            Entry::Vacant(vacant) => {
                let mut entry = TrackingEntry::default();
                entry.providers.insert(core.id(), weak);
                vacant.insert(entry);
                (true, false)
            }
        };

        if rejected {
            core.force_close();
            return Err(StreamingError::ScopeTerminated { scope: scope_id });
        }
        if fresh {
            let shared = Arc::downgrade(self);
            scope.on_termination(Box::new(move |terminated| {
                if let Some(shared) = shared.upgrade() {
                    shared.terminate(terminated);
                }
            }));
        }
        if scope.is_terminated() {
            self.terminate(scope_id);
            return Err(StreamingError::ScopeTerminated { scope: scope_id });
        }

        debug!(
            target: telemetry::MANAGER,
            provider_id = %core.id(),
            scope_id = %scope_id,
            "cursor provider managed"
        );
        Ok(ManagedCursorProvider::new(provider, scope_id))
    }

    /// 作用域终止：标记条目、关闭全部存活提供者并移除条目；返回关闭的提供者数量。
    pub(crate) fn terminate(&self, scope: ScopeId) -> usize {
        let providers: Vec<Weak<dyn TrackedProvider>> = match self.scopes.get_mut(&scope) {
            Some(mut entry) => {
                entry.terminated = true;
                entry.providers.drain().map(|(_, weak)| weak).collect()
            }
            None => return 0,
        };

        let mut closed = 0usize;
        for weak in providers {
            let Some(provider) = weak.upgrade() else {
                continue;
            };
            if provider.force_close() {
                debug!(
                    target: telemetry::MANAGER,
                    provider_id = %provider.provider_id(),
                    scope_id = %scope,
                    "managed provider closed by scope termination"
                );
                closed += 1;
            }
        }
        self.scopes.remove(&scope);
        debug!(
            target: telemetry::MANAGER,
            scope_id = %scope,
            closed_providers = closed,
            "event scope terminated, managed providers closed"
        );
        closed
    }

    fn forget(&self, scope: ScopeId, provider: ProviderId) {
        if let Some(mut entry) = self.scopes.get_mut(&scope) {
            entry.providers.remove(&provider);
        }
    }

    fn post(&self, notice: LeakNotice) {
        // 接收端由自身持有，发送只会在进程退出阶段失败。
        let _ = self.notices.send(ReclaimMessage::Leak(notice));
    }

    fn handle(&self, notice: LeakNotice) {
        match notice.kind {
            HandleKind::Cursor => self.stats.cursor_reclaimed(),
            HandleKind::Provider => {
                self.stats.provider_reclaimed();
                self.forget(notice.scope, notice.provider);
            }
        }
        warn!(
            target: telemetry::RECLAIM,
            kind = %notice.kind,
            provider_id = %notice.provider,
            cursor_id = ?notice.cursor.map(CursorId::get),
            scope_id = %notice.scope,
            position = notice.position,
            "streaming handle dropped without being closed; resources reclaimed"
        );
    }

    /// 处理队列中已有的全部通知。
    fn drain(&self) -> usize {
        let mut handled = 0usize;
        while let Ok(message) = self.inbox.try_recv() {
            if let ReclaimMessage::Leak(notice) = message {
                self.handle(notice);
                handled += 1;
            }
        }
        handled
    }
}

/// 提供者与管理器之间的绑定，由提供者持有。
pub(crate) struct ManagedLink {
    shared: Arc<ManagerShared>,
    scope: ScopeId,
    active: AtomicBool,
}

impl ManagedLink {
    fn new(shared: Arc<ManagerShared>, scope: ScopeId) -> Self {
        Self {
            shared,
            scope,
            active: AtomicBool::new(false),
        }
    }

    pub(crate) fn scope(&self) -> ScopeId {
        self.scope
    }

    /// 是否仍计入 `open_providers`。
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn activate(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            self.shared.stats.provider_opened();
        }
    }

    pub(crate) fn cursor_opened(&self) {
        self.shared.stats.cursor_opened();
    }

    pub(crate) fn cursor_closed(&self) {
        self.shared.stats.cursor_closed();
    }

    /// 提供者关闭：计数恰好递减一次，并从跟踪条目中剔除。
    pub(crate) fn release_provider(&self, provider: ProviderId) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.shared.stats.provider_closed();
            self.shared.forget(self.scope, provider);
        }
    }

    pub(crate) fn report_leak(&self, notice: LeakNotice) {
        self.shared.post(notice);
    }
}

/// 已登记到事件作用域的提供者。
///
/// 解引用为 [`CursorProvider`]，因此可以直接调用 `open_cursor`、`close` 等方法。
pub struct ManagedCursorProvider<S: ReadOnce> {
    provider: CursorProvider<S>,
    scope: ScopeId,
}

impl<S: ReadOnce> ManagedCursorProvider<S> {
    pub(crate) fn new(provider: CursorProvider<S>, scope: ScopeId) -> Self {
        Self { provider, scope }
    }

    /// 所属事件作用域。
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn provider(&self) -> &CursorProvider<S> {
        &self.provider
    }

    pub fn into_inner(self) -> CursorProvider<S> {
        self.provider
    }
}

impl<S: ReadOnce> std::ops::Deref for ManagedCursorProvider<S> {
    type Target = CursorProvider<S>;

    fn deref(&self) -> &Self::Target {
        &self.provider
    }
}

impl<S: ReadOnce> Clone for ManagedCursorProvider<S> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            scope: self.scope,
        }
    }
}

impl<S: ReadOnce> fmt::Debug for ManagedCursorProvider<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCursorProvider")
            .field("provider", &self.provider)
            .field("scope", &self.scope)
            .finish()
    }
}

/// 游标管理器。
///
/// # 教案式说明
/// - **意图 (Why)**：集中负责“作用域结束即释放”与“忘记关闭也不泄漏”两件事，
///   让读取方只需关心读取本身；
/// - **契约 (What)**：
///   - [`CursorManager::manage`] 幂等；作用域已终止时立即关闭提供者并返回 `ScopeTerminated`；
///   - 受管提供者上打开的游标计入 `open_cursors`，任意路径的关闭都恰好递减一次；
///   - 丢弃管理器会停止并等待后台回收线程，已登记的提供者不受影响；
/// - **风险 (Trade-offs)**：后台线程不可用（例如线程创建失败）时退化为手动模式，
///   通知会一直留在队列中直到调用 `run_reclamation`。
pub struct CursorManager {
    shared: Arc<ManagerShared>,
    reclaimer: Option<JoinHandle<()>>,
}

impl CursorManager {
    pub fn new(config: &ReclamationConfig) -> Result<Self> {
        config.validate()?;
        let shared = ManagerShared::new();
        let reclaimer = if config.background {
            spawn_reclaimer(&shared, &config.thread_name)
        } else {
            None
        };
        Ok(Self { shared, reclaimer })
    }

    pub fn manage<S: ReadOnce>(
        &self,
        provider: CursorProvider<S>,
        scope: &dyn EventScope,
    ) -> Result<ManagedCursorProvider<S>> {
        self.shared.manage(provider, scope)
    }

    /// 同步处理一轮回收队列，返回处理的通知数量。
    pub fn run_reclamation(&self) -> usize {
        self.shared.drain()
    }

    pub fn statistics(&self) -> StreamingStatistics {
        self.shared.statistics()
    }

    /// 是否运行着后台回收线程。
    pub fn has_background_reclaimer(&self) -> bool {
        self.reclaimer.is_some()
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }
}

impl fmt::Debug for CursorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorManager")
            .field("statistics", &self.statistics())
            .field("background", &self.reclaimer.is_some())
            .finish()
    }
}

impl Drop for CursorManager {
    fn drop(&mut self) {
        if let Some(handle) = self.reclaimer.take() {
            let _ = self.shared.notices.send(ReclaimMessage::Shutdown);
            if handle.join().is_err() {
                warn!(target: telemetry::RECLAIM, "reclamation thread panicked");
            }
        }
    }
}

fn spawn_reclaimer(shared: &Arc<ManagerShared>, name: &str) -> Option<JoinHandle<()>> {
    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            while let Ok(ReclaimMessage::Leak(notice)) = worker.inbox.recv() {
                worker.handle(notice);
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(
                target: telemetry::RECLAIM,
                error = %err,
                "failed to start reclamation thread, falling back to manual reclamation"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ObjectStreamingConfig, scope::ManualScope, source::IterSource};

    fn provider() -> CursorProvider<IterSource<std::ops::Range<u32>>> {
        CursorProvider::objects(IterSource::new(0..16), &ObjectStreamingConfig::default())
    }

    #[test]
    fn manage_is_idempotent_and_counts_once() {
        let manager = CursorManager::new(&ReclamationConfig::manual()).expect("创建管理器失败");
        let scope = ManualScope::new();
        let managed = manager.manage(provider(), &scope).expect("登记失败");
        let again = manager
            .manage(managed.provider().clone(), &scope)
            .expect("重复登记应成功");
        assert!(managed.ptr_eq(&again));
        assert_eq!(manager.statistics().open_providers, 1);
        assert_eq!(manager.statistics().tracked_scopes, 1);

        assert!(managed.close());
        assert_eq!(manager.statistics().open_providers, 0);
    }

    #[test]
    fn terminated_scope_rejects_and_closes_provider() {
        let manager = CursorManager::new(&ReclamationConfig::manual()).expect("创建管理器失败");
        let scope = ManualScope::new();
        scope.terminate();
        let provider = provider();
        let err = manager
            .manage(provider.clone(), &scope)
            .expect_err("已终止作用域必须拒绝");
        assert_eq!(err.code(), crate::codes::SCOPE_TERMINATED);
        assert!(provider.is_closed());
        assert_eq!(manager.statistics().open_providers, 0);
    }

    #[test]
    fn termination_reports_scope_error_to_cursors() {
        let manager = CursorManager::new(&ReclamationConfig::manual()).expect("创建管理器失败");
        let scope = ManualScope::new();
        let managed = manager.manage(provider(), &scope).expect("登记失败");
        let mut cursor = managed.open_cursor().expect("打开游标失败");
        assert_eq!(manager.statistics().open_cursors, 1);

        scope.terminate();
        let err = cursor.next_batch(4).expect_err("作用域终止后不可读");
        assert!(matches!(err, StreamingError::ScopeTerminated { scope: id } if id == scope.id()));
        let stats = manager.statistics();
        assert_eq!(stats.open_cursors, 0);
        assert_eq!(stats.open_providers, 0);
        assert_eq!(stats.tracked_scopes, 0);
    }

    #[test]
    #[tracing_test::traced_test]
    fn dropped_handles_are_reclaimed_with_warning() {
        let manager = CursorManager::new(&ReclamationConfig::manual()).expect("创建管理器失败");
        let scope = ManualScope::new();
        let managed = manager.manage(provider(), &scope).expect("登记失败");
        let mut cursor = managed.open_cursor().expect("打开游标失败");
        cursor.next_batch(3).expect("读取失败");
        drop(cursor);

        assert_eq!(manager.statistics().open_cursors, 0, "析构即关闭");
        assert_eq!(manager.run_reclamation(), 1);
        assert!(logs_contain("dropped without being closed"));
        assert_eq!(manager.statistics().reclaimed_cursors, 1);

        drop(managed);
        assert_eq!(manager.run_reclamation(), 1);
        let stats = manager.statistics();
        assert_eq!(stats.open_providers, 0);
        assert_eq!(stats.reclaimed_providers, 1);
        assert_eq!(manager.run_reclamation(), 0, "通知只处理一次");
    }

    #[test]
    fn background_thread_stops_with_manager() {
        let manager = CursorManager::new(&ReclamationConfig::default()).expect("创建管理器失败");
        assert!(manager.has_background_reclaimer());
        drop(manager);
    }
}
