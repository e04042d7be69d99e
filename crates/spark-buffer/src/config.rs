use serde::Deserialize;

use crate::error::PoolError;

/// 最小容量等级的默认值：4 KiB。
const DEFAULT_MIN_SEGMENT_SIZE: usize = 4 * 1024;
/// 最大容量等级的默认值：4 MiB。
const DEFAULT_MAX_SEGMENT_SIZE: usize = 4 * 1024 * 1024;
/// 每个等级缓存的空闲段上限。
const DEFAULT_MAX_CACHED_PER_CLASS: usize = 64;

/// `PoolConfig` 描述段池的容量等级与内存配额。
///
/// # 设计背景（Why）
/// - 按 2 的幂分级可以把碎片控制在 50% 以内，同时让归还操作只需一次 push；
/// - 配额（`max_resident_bytes`）给出整个进程流式缓冲的硬上限，超出时快速失败而不是阻塞。
///
/// # 契约说明（What）
/// - `min_segment_size`/`max_segment_size` 会被向上取整到 2 的幂，且要求 `min <= max`；
/// - `max_cached_per_class` 为 0 时池不缓存任何空闲段，每次归还都直接释放；
/// - `max_resident_bytes` 为 `None` 表示只受分配器约束。
///
/// 结构体实现 `Deserialize` 并对全部字段提供默认值，宿主可以从任意配置格式加载。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_segment_size: usize,
    pub max_segment_size: usize,
    pub max_cached_per_class: usize,
    pub max_resident_bytes: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_cached_per_class: DEFAULT_MAX_CACHED_PER_CLASS,
            max_resident_bytes: None,
        }
    }
}

impl PoolConfig {
    /// 以常驻配额构造配置，其余字段使用默认值。
    pub fn with_resident_limit(limit: usize) -> Self {
        Self {
            max_resident_bytes: Some(limit),
            ..Self::default()
        }
    }

    /// 最小容量等级（已取整到 2 的幂）。
    pub fn min_class_capacity(&self) -> usize {
        self.min_segment_size.max(1).next_power_of_two()
    }

    /// 最大容量等级（已取整到 2 的幂，且不小于最小等级）。
    pub fn max_class_capacity(&self) -> usize {
        self.max_segment_size
            .max(1)
            .next_power_of_two()
            .max(self.min_class_capacity())
    }

    /// 等级数量。
    pub fn class_count(&self) -> usize {
        let min = self.min_class_capacity().trailing_zeros();
        let max = self.max_class_capacity().trailing_zeros();
        (max - min) as usize + 1
    }

    /// 校验配置的一致性。
    ///
    /// - **前置条件**：无；
    /// - **后置条件**：返回 `Ok(())` 时，`SegmentPool::new` 不会因为配置产生意外等级划分；
    ///   `min_segment_size > max_segment_size` 或配额小于最小等级时返回 `CapacityTooLarge`。
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_segment_size > self.max_segment_size {
            return Err(PoolError::CapacityTooLarge {
                requested: self.min_segment_size,
                max: self.max_segment_size,
            });
        }
        if let Some(limit) = self.max_resident_bytes {
            if limit < self.min_class_capacity() {
                return Err(PoolError::CapacityTooLarge {
                    requested: self.min_class_capacity(),
                    max: limit,
                });
            }
        }
        Ok(())
    }
}
