//! 流式管理统计。
//!
//! 计数器由提供者与游标的生命周期事件驱动，每个句柄的打开与关闭各计一次，
//! 关闭无论经由显式调用、作用域终止还是析构回收都只计一次。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// 统计快照。
///
/// - `open_providers` / `open_cursors`：当前仍打开的受管句柄数量；
/// - `reclaimed_providers` / `reclaimed_cursors`：因被丢弃而未关闭、由回收流程处理过的句柄累计数；
/// - `tracked_scopes`：仍有跟踪条目的事件作用域数量。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StreamingStatistics {
    pub open_providers: usize,
    pub open_cursors: usize,
    pub reclaimed_providers: u64,
    pub reclaimed_cursors: u64,
    pub tracked_scopes: usize,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    open_providers: AtomicUsize,
    open_cursors: AtomicUsize,
    reclaimed_providers: AtomicU64,
    reclaimed_cursors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn provider_opened(&self) {
        self.open_providers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn provider_closed(&self) {
        decrement(&self.open_providers);
    }

    pub(crate) fn cursor_opened(&self) {
        self.open_cursors.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn cursor_closed(&self) {
        decrement(&self.open_cursors);
    }

    pub(crate) fn provider_reclaimed(&self) {
        self.reclaimed_providers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cursor_reclaimed(&self) {
        self.reclaimed_cursors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, tracked_scopes: usize) -> StreamingStatistics {
        StreamingStatistics {
            open_providers: self.open_providers.load(Ordering::Acquire),
            open_cursors: self.open_cursors.load(Ordering::Acquire),
            reclaimed_providers: self.reclaimed_providers.load(Ordering::Relaxed),
            reclaimed_cursors: self.reclaimed_cursors.load(Ordering::Relaxed),
            tracked_scopes,
        }
    }
}

/// 饱和递减：计数归零后再收到关闭事件说明记账有缺陷，不让它回绕成巨大的数值。
fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        Some(value.saturating_sub(1))
    });
}
