use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use spin::Mutex;

use crate::{
    config::PoolConfig,
    error::{PoolError, Result},
    segment::{ReclaimedSegment, Segment, SegmentRecycler},
};

/// `SegmentPool` 提供按容量等级分桶的段池实现，
/// 专注在**高并发、低延迟**场景下复用定长内存段，以减少堆分配次数。
///
/// # 模块角色（Why）
/// - 为游标提供者提供统一的内存来源：提供者只在缓冲需要增长时租借段，在游标越过段后归还；
/// - 借助 `Segment` 的生命周期钩子，在 `Drop` 阶段自动回收内存，避免调用方关注回收细节。
///
/// # 核心机制（How）
/// - 每个 2 的幂容量等级维护一个 `spin::Mutex<Vec<Vec<u8>>>` 自由链表，锁只在 push/pop 期间持有；
///   不同等级之间没有共享锁，全局竞争点只剩各桶的短临界区；
/// - `PoolMetrics` 通过原子计数跟踪常驻、可用、租借等指标，常驻字节同时充当配额闸门：
///   新分配先用 CAS 预留配额，失败则快速返回 [`PoolError::Exhausted`]；
/// - 分配使用 `Vec::try_reserve_exact`，分配器拒绝时同样转化为 `Exhausted` 而不是中止进程。
///
/// # 契约说明（What）
/// - **线程安全**：所有共享状态均通过分桶锁与原子计数保护，满足 `Send + Sync + 'static`；
/// - **后置条件**：`acquire(n)` 返回的段容量为不小于 `n` 的最小等级容量；失败路径不修改池状态
///   （仅递增 `failed_acquisitions`）；
/// - `release` 从不收缩或拷贝内存，只清零已用长度并放回对应等级。
#[derive(Clone)]
pub struct SegmentPool {
    inner: Arc<PoolInner>,
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl SegmentPool {
    /// 按配置创建空池。
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(config)),
        }
    }

    /// 租借一个容量不小于 `min_capacity` 的段。
    ///
    /// # 实现策略
    /// 1. 将请求映射到容量等级，超出最大等级时返回 `CapacityTooLarge`；
    /// 2. 优先弹出该等级自由链表中的空闲段（命中）；
    /// 3. 未命中时预留常驻配额并向分配器申请，两者任一失败都返回 `Exhausted`。
    pub fn acquire(&self, min_capacity: usize) -> Result<Segment> {
        let (class, buffer) = self.inner.acquire_buffer(min_capacity)?;
        let capacity = self.inner.buckets[class].capacity;
        let recycler: Arc<dyn SegmentRecycler> = self.inner.clone();
        Ok(Segment::new(buffer, capacity, class, recycler))
    }

    /// 显式归还段。
    ///
    /// 段总是回到租借它的池；该方法等价于 `drop(segment)`，保留它是为了让调用点显式表达归还意图。
    pub fn release(&self, segment: Segment) {
        drop(segment);
    }

    /// 计算 `min_capacity` 对应的等级容量，不产生任何分配。
    pub fn class_capacity(&self, min_capacity: usize) -> Result<usize> {
        let class = self.inner.class_index(min_capacity)?;
        Ok(self.inner.buckets[class].capacity)
    }

    /// 最大等级容量。
    pub fn max_segment_capacity(&self) -> usize {
        self.inner.config.max_class_capacity()
    }

    /// 释放所有缓存的空闲段，返回释放的字节数；租借中的段不受影响。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_lists()
    }

    /// 读取池统计快照。
    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }

    /// 返回池配置。
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.snapshot())
            .finish()
    }
}

/// 段池统计快照。
///
/// - `allocated_bytes`：累计向分配器申请的字节数（单调递增）；
/// - `resident_bytes`：当前由池持有的字节（租借中 + 缓存中）；
/// - `available_bytes`：缓存于自由链表、可立即复用的字节；
/// - `active_leases`：尚未归还的段数量。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub allocated_bytes: usize,
    pub resident_bytes: usize,
    pub available_bytes: usize,
    pub active_leases: usize,
    pub failed_acquisitions: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub recycled: u64,
    pub classes: Vec<ClassOccupancy>,
}

/// 单个容量等级的空闲段数量。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClassOccupancy {
    pub capacity: usize,
    pub free_segments: usize,
}

struct Bucket {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

struct PoolInner {
    config: PoolConfig,
    min_shift: u32,
    buckets: Box<[Bucket]>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new(config: PoolConfig) -> Self {
        let min = config.min_class_capacity();
        let buckets = (0..config.class_count())
            .map(|index| Bucket {
                capacity: min << index,
                free: Mutex::new(Vec::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            min_shift: min.trailing_zeros(),
            buckets,
            metrics: PoolMetrics::default(),
            config,
        }
    }

    fn class_index(&self, min_capacity: usize) -> Result<usize> {
        let max = self.config.max_class_capacity();
        if min_capacity > max {
            return Err(PoolError::CapacityTooLarge {
                requested: min_capacity,
                max,
            });
        }
        let rounded = min_capacity
            .max(self.config.min_class_capacity())
            .next_power_of_two();
        Ok((rounded.trailing_zeros() - self.min_shift) as usize)
    }

    /// 从自由链表或分配器获取一块满足等级容量的内存。
    fn acquire_buffer(&self, min_capacity: usize) -> Result<(usize, Vec<u8>)> {
        let class = self.class_index(min_capacity)?;
        let bucket = &self.buckets[class];

        let reused = bucket.free.lock().pop();
        if let Some(buffer) = reused {
            self.metrics.decrease_available(bucket.capacity);
            self.metrics.pool_hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.increase_active_leases();
            return Ok((class, buffer));
        }

        let limit = self.config.max_resident_bytes;
        if let Err(resident) = self.metrics.try_reserve_resident(bucket.capacity, limit) {
            self.metrics.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::Exhausted {
                requested: bucket.capacity,
                resident,
                limit,
            });
        }

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(bucket.capacity).is_err() {
            let resident = self.metrics.release_resident(bucket.capacity);
            self.metrics.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::Exhausted {
                requested: bucket.capacity,
                resident,
                limit,
            });
        }

        self.metrics
            .allocated_bytes
            .fetch_add(bucket.capacity, Ordering::Relaxed);
        self.metrics.pool_misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.increase_active_leases();
        Ok((class, buffer))
    }

    fn shrink_free_lists(&self) -> usize {
        let mut reclaimed = 0;
        for bucket in self.buckets.iter() {
            let drained = core::mem::take(&mut *bucket.free.lock());
            let bytes = drained.len() * bucket.capacity;
            drop(drained);
            self.metrics.decrease_available(bytes);
            self.metrics.release_resident(bytes);
            reclaimed += bytes;
        }
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let classes = self
            .buckets
            .iter()
            .map(|bucket| ClassOccupancy {
                capacity: bucket.capacity,
                free_segments: bucket.free.lock().len(),
            })
            .collect();
        PoolStats {
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            resident_bytes: self.metrics.resident_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            failed_acquisitions: self.metrics.failed_acquisitions.load(Ordering::Relaxed),
            pool_hits: self.metrics.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.metrics.pool_misses.load(Ordering::Relaxed),
            recycled: self.metrics.recycled.load(Ordering::Relaxed),
            classes,
        }
    }
}

impl SegmentRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedSegment) {
        self.metrics.decrease_active_leases();
        let Some(bucket) = self.buckets.get(reclaimed.class()) else {
            self.metrics.release_resident(reclaimed.capacity());
            return;
        };
        let mut buffer = reclaimed.into_buffer();
        buffer.clear();
        if buffer.capacity() < bucket.capacity {
            self.metrics.release_resident(bucket.capacity);
            return;
        }

        let cached = {
            let mut free = bucket.free.lock();
            if free.len() < self.config.max_cached_per_class {
                free.push(buffer);
                None
            } else {
                Some(buffer)
            }
        };
        match cached {
            None => {
                self.metrics.increase_available(bucket.capacity);
                self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
            }
            Some(surplus) => {
                drop(surplus);
                self.metrics.release_resident(bucket.capacity);
            }
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    resident_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
    failed_acquisitions: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    recycled: AtomicU64,
}

impl PoolMetrics {
    /// 预留常驻配额；超出配额时返回当前常驻字节。
    fn try_reserve_resident(
        &self,
        capacity: usize,
        limit: Option<usize>,
    ) -> core::result::Result<usize, usize> {
        self.resident_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(capacity)?;
                match limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
    }

    /// 释放常驻配额，返回释放后的常驻字节。
    fn release_resident(&self, capacity: usize) -> usize {
        saturating_sub(&self.resident_bytes, capacity)
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }

    fn increase_active_leases(&self) {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_active_leases(&self) {
        saturating_sub(&self.active_leases, 1);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) -> usize {
    let previous = target
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_sub(value))
        })
        .unwrap_or_else(|current| current);
    previous.saturating_sub(value)
}
