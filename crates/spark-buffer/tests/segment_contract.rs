//! `segment_contract` 集成测试：聚焦 `Segment` 生命周期与回收器之间的协作协议。
//!
//! # 测试总览（Why）
//! - 校验段在 `Drop` 时恰好通知一次回收器，且交回的内存已清零；
//! - 以 `RecordingRecycler` 观察回收事件，验证自定义池实现也能复用 `Segment`。

use std::sync::{Arc, Mutex};

use spark_buffer::{ReclaimedSegment, Segment, SegmentRecycler};

/// `RecordingRecycler`：测试场景下用于捕获回收事件的探针实现。
///
/// - 利用 `Mutex<Vec<(usize, usize, usize)>>` 保存每次回收的等级、容量与交回内存的长度；
/// - `take_events` 在断言前清空事件队列，确保各个测试相互独立。
#[derive(Default)]
struct RecordingRecycler {
    events: Mutex<Vec<(usize, usize, usize)>>,
}

impl RecordingRecycler {
    fn take_events(&self) -> Vec<(usize, usize, usize)> {
        self.events
            .lock()
            .expect("mutex poisoned")
            .drain(..)
            .collect()
    }
}

impl SegmentRecycler for RecordingRecycler {
    fn reclaim(&self, reclaimed: ReclaimedSegment) {
        let class = reclaimed.class();
        let capacity = reclaimed.capacity();
        let len = reclaimed.into_buffer().len();
        self.events
            .lock()
            .expect("mutex poisoned")
            .push((class, capacity, len));
    }
}

/// 段被丢弃时应通知一次回收器，并交回已清零的内存。
#[test]
fn drop_notifies_recycler_exactly_once() {
    let recycler = Arc::new(RecordingRecycler::default());
    let mut segment = Segment::new(Vec::with_capacity(16), 16, 2, recycler.clone());
    assert_eq!(segment.append(b"payload"), 7);
    drop(segment);
    assert_eq!(recycler.take_events(), vec![(2, 16, 0)]);
    assert!(recycler.take_events().is_empty(), "回收只能发生一次");
}

/// 游离段不属于任何池，丢弃时不应触发回收。
#[test]
fn detached_segment_has_no_recycler() {
    let mut segment = Segment::detached(8);
    segment.append(b"12345678");
    assert!(segment.is_full());
    assert_eq!(segment.remaining_mut(), 0);
    drop(segment);
}

/// 构造时传入的脏内存会被清零，避免把上一租约的数据暴露给新持有者。
#[test]
fn new_segment_starts_empty_even_with_dirty_buffer() {
    let recycler = Arc::new(RecordingRecycler::default());
    let mut dirty = Vec::with_capacity(8);
    dirty.extend_from_slice(b"stale");
    let segment = Segment::new(dirty, 8, 0, recycler.clone());
    assert!(segment.is_empty());
    assert_eq!(segment.remaining_mut(), 8);
    drop(segment);
    assert_eq!(recycler.take_events().len(), 1);
}
