//! # scope 模块说明
//!
//! ## 角色定位（Why）
//! - 事件作用域界定一次事件处理中所有流式资源的寿命：作用域终止时，其下仍打开的提供者与游标
//!   由管理器强制关闭；
//! - 作用域本身由外部协作者（事件运行时）实现，本模块只定义最小接口并提供一个手动实现。
//!
//! ## 契约（What）
//! - `on_termination` 注册的回调在终止时恰好执行一次；终止之后注册的回调立即执行；
//! - 回调可能在任意线程上执行，因此必须是 `Send`。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{ids::ScopeId, telemetry};

/// 终止回调。
pub type TerminationCallback = Box<dyn FnOnce(ScopeId) + Send + 'static>;

/// 事件作用域。
pub trait EventScope: Send + Sync {
    /// 作用域标识，在其生命周期内保持不变。
    fn id(&self) -> ScopeId;

    /// 订阅终止通知。
    fn on_termination(&self, callback: TerminationCallback);

    /// 作用域是否已经终止。
    fn is_terminated(&self) -> bool;
}

/// 由调用方显式终止的作用域；克隆共享同一状态。
///
/// # 教案式说明
/// - **意图 (Why)**：测试与简单宿主无需实现完整的事件运行时即可驱动作用域回收；
/// - **契约 (What)**：[`ManualScope::terminate`] 幂等，只有第一次调用会执行回调；
///   回调在锁外执行，回调内部可以安全地再次访问本作用域；
/// - **风险 (Trade-offs)**：回调在调用 `terminate` 的线程上同步执行，耗时回调会拉长终止调用本身。
#[derive(Clone)]
pub struct ManualScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    id: ScopeId,
    terminated: AtomicBool,
    callbacks: Mutex<Option<Vec<TerminationCallback>>>,
}

impl ManualScope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: ScopeId::next(),
                terminated: AtomicBool::new(false),
                callbacks: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// 终止作用域并执行全部回调；返回本次调用是否真正触发了终止。
    pub fn terminate(&self) -> bool {
        let callbacks = {
            let mut guard = self.inner.callbacks.lock();
            let Some(callbacks) = guard.take() else {
                return false;
            };
            self.inner.terminated.store(true, Ordering::Release);
            callbacks
        };
        debug!(
            target: telemetry::MANAGER,
            scope_id = %self.inner.id,
            callbacks = callbacks.len(),
            "event scope terminated"
        );
        for callback in callbacks {
            callback(self.inner.id);
        }
        true
    }
}

impl Default for ManualScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScope")
            .field("id", &self.inner.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl EventScope for ManualScope {
    fn id(&self) -> ScopeId {
        self.inner.id
    }

    fn on_termination(&self, callback: TerminationCallback) {
        let late = {
            let mut guard = self.inner.callbacks.lock();
            match guard.as_mut() {
                Some(callbacks) => {
                    callbacks.push(callback);
                    None
                }
                None => Some(callback),
            }
        };
        if let Some(callback) = late {
            callback(self.inner.id);
        }
    }

    fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callbacks_fire_once_and_late_subscribers_fire_immediately() {
        let scope = ManualScope::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        scope.on_termination(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(scope.terminate());
        assert!(!scope.terminate(), "重复终止不应再次触发");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&fired);
        let id = scope.id();
        scope.on_termination(Box::new(move |scope_id| {
            assert_eq!(scope_id, id);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(scope.is_terminated());
    }

    #[test]
    fn clones_share_termination_state() {
        let scope = ManualScope::new();
        let clone = scope.clone();
        clone.terminate();
        assert!(scope.is_terminated());
        assert_eq!(scope.id(), clone.id());
    }
}
