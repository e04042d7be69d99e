//! 池化字节段存储，可选溢出到 [`OverflowSink`]。
//!
//! 区段按逻辑位置首尾相接：内存区段持有一个租借的 [`Segment`]，溢出区段持有一枚令牌。
//! 内存中的已用字节数不超过 `max_in_memory`；超过时整块写入溢出汇，
//! 内存因游标推进而回落后，后续数据重新进入内存。

use std::{collections::VecDeque, io, path::PathBuf, sync::Arc};

use spark_buffer::{Segment, SegmentPool};
use tracing::debug;

use super::{BufferStore, RetainedUnits, check_visit_start};
use crate::{
    config::{ByteStreamingConfig, OverflowMode},
    error::{Result, StreamingError},
    ids::ProviderId,
    overflow::{FileOverflowSink, OverflowSink, OverflowToken},
    provider::BufferStrategy,
    telemetry,
};

/// 溢出去处的生命周期：未配置、首次溢出时创建临时文件、已就绪。
pub(crate) enum OverflowSlot {
    Disabled,
    Lazy(Option<PathBuf>),
    Ready(Arc<dyn OverflowSink>),
}

/// 由配置、段池与源的长度提示推导出的存储参数。
pub(crate) struct ByteStoreSettings {
    pub(crate) initial_segment: usize,
    pub(crate) segment_size: usize,
    pub(crate) max_in_memory: u64,
    pub(crate) overflow: OverflowSlot,
    /// 长度提示表明数据可以完整驻留内存。
    pub(crate) expected_in_memory: bool,
}

impl ByteStoreSettings {
    /// 段尺寸截断到段池最大等级。
    ///
    /// 长度提示不超过内存上限时策略报告为内存，但配置的溢出去处仍然保留：
    /// 提示偏小时数据照常溢出，临时文件也只在第一次溢出时才创建。
    pub(crate) fn resolve(
        config: &ByteStreamingConfig,
        pool: &SegmentPool,
        size_hint: Option<u64>,
    ) -> Self {
        let max_segment = pool.max_segment_capacity();
        let clamp =
            |bytes: u64| usize::try_from(bytes).unwrap_or(usize::MAX).clamp(1, max_segment);

        let mut initial_segment = clamp(config.initial_buffer_size.to_bytes());
        if let Some(hint) = size_hint {
            initial_segment = initial_segment.min(clamp(hint));
        }
        let max_in_memory = config.max_in_memory_size.to_bytes();

        let overflow = if let Some(shared) = &config.overflow_sink {
            OverflowSlot::Ready(Arc::clone(shared.sink()))
        } else {
            match &config.overflow {
                OverflowMode::Disabled => OverflowSlot::Disabled,
                OverflowMode::TempFile { directory } => OverflowSlot::Lazy(directory.clone()),
            }
        };

        Self {
            initial_segment,
            segment_size: clamp(config.buffer_size_increment.to_bytes()),
            max_in_memory,
            overflow,
            expected_in_memory: size_hint.is_some_and(|hint| hint <= max_in_memory),
        }
    }

    pub(crate) fn strategy(&self) -> BufferStrategy {
        match self.overflow {
            OverflowSlot::Disabled => BufferStrategy::InMemory,
            _ if self.expected_in_memory => BufferStrategy::InMemory,
            _ => BufferStrategy::Overflowable,
        }
    }
}

enum Extent {
    Memory { start: u64, segment: Segment },
    Spilled { start: u64, token: OverflowToken },
}

impl Extent {
    fn start(&self) -> u64 {
        match self {
            Extent::Memory { start, .. } | Extent::Spilled { start, .. } => *start,
        }
    }

    fn len(&self) -> u64 {
        match self {
            Extent::Memory { segment, .. } => segment.len() as u64,
            Extent::Spilled { token, .. } => token.len(),
        }
    }

    fn end(&self) -> u64 {
        self.start() + self.len()
    }
}

pub(crate) struct ByteStore {
    provider: ProviderId,
    pool: SegmentPool,
    extents: VecDeque<Extent>,
    base: u64,
    end: u64,
    in_memory: u64,
    overflowed: u64,
    initial_segment: usize,
    segment_size: usize,
    max_in_memory: u64,
    overflow: OverflowSlot,
    grown: bool,
}

impl ByteStore {
    pub(crate) fn new(provider: ProviderId, pool: SegmentPool, settings: ByteStoreSettings) -> Self {
        Self {
            provider,
            pool,
            extents: VecDeque::new(),
            base: 0,
            end: 0,
            in_memory: 0,
            overflowed: 0,
            initial_segment: settings.initial_segment,
            segment_size: settings.segment_size,
            max_in_memory: settings.max_in_memory,
            overflow: settings.overflow,
            grown: false,
        }
    }

    /// 先租齐所需的全部段再写入，租借失败时已租到的段随 `fresh` 一起归还。
    fn append_in_memory(&mut self, items: &[u8]) -> Result<()> {
        let tail_room = match self.extents.back() {
            Some(Extent::Memory { segment, .. }) => segment.remaining_mut(),
            _ => 0,
        };

        let mut fresh = Vec::new();
        let mut covered = tail_room;
        while covered < items.len() {
            let size = if self.grown || !fresh.is_empty() {
                self.segment_size
            } else {
                self.initial_segment
            };
            let segment = self.pool.acquire(size)?;
            covered += segment.capacity();
            fresh.push(segment);
        }

        let mut rest = items;
        if tail_room > 0 {
            if let Some(Extent::Memory { segment, .. }) = self.extents.back_mut() {
                let written = segment.append(rest);
                rest = &rest[written..];
            }
        }
        let mut start = self.end + (items.len() - rest.len()) as u64;
        for mut segment in fresh {
            let written = segment.append(rest);
            rest = &rest[written..];
            self.extents.push_back(Extent::Memory { start, segment });
            start += written as u64;
            self.grown = true;
        }
        debug_assert!(rest.is_empty());
        Ok(())
    }

    fn open_sink(&mut self) -> Result<Option<Arc<dyn OverflowSink>>> {
        let sink: Arc<dyn OverflowSink> = match &self.overflow {
            OverflowSlot::Disabled => return Ok(None),
            OverflowSlot::Ready(sink) => return Ok(Some(Arc::clone(sink))),
            OverflowSlot::Lazy(directory) => {
                let created = match directory {
                    Some(directory) => FileOverflowSink::create_in(directory),
                    None => FileOverflowSink::new(),
                };
                Arc::new(created.map_err(StreamingError::Overflow)?)
            }
        };
        debug!(
            target: telemetry::OVERFLOW,
            provider_id = %self.provider,
            retained = self.in_memory,
            "in-memory limit reached, spilling to temporary file"
        );
        self.overflow = OverflowSlot::Ready(Arc::clone(&sink));
        Ok(Some(sink))
    }

    fn ready_sink(&self) -> Result<&Arc<dyn OverflowSink>> {
        match &self.overflow {
            OverflowSlot::Ready(sink) => Ok(sink),
            _ => Err(StreamingError::Overflow(io::Error::other(
                "spilled extent without an open overflow sink",
            ))),
        }
    }

    fn discard(&mut self, extent: Extent) {
        match extent {
            Extent::Memory { segment, .. } => {
                self.in_memory -= segment.len() as u64;
                self.pool.release(segment);
            }
            Extent::Spilled { token, .. } => {
                self.overflowed -= token.len();
                if let OverflowSlot::Ready(sink) = &self.overflow {
                    sink.release(token);
                }
            }
        }
    }
}

impl BufferStore<u8> for ByteStore {
    fn append(&mut self, items: &[u8]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let len = items.len() as u64;
        if self.in_memory + len <= self.max_in_memory {
            self.append_in_memory(items)?;
            self.in_memory += len;
        } else {
            let Some(sink) = self.open_sink()? else {
                return Err(StreamingError::BufferSizeExceeded {
                    limit: self.max_in_memory,
                    retained: self.in_memory,
                    requested: len,
                });
            };
            let token = sink.write(items).map_err(StreamingError::Overflow)?;
            self.extents.push_back(Extent::Spilled {
                start: self.end,
                token,
            });
            self.overflowed += len;
        }
        self.end += len;
        Ok(())
    }

    fn visit(&self, pos: u64, max: usize, visitor: &mut dyn FnMut(&[u8])) -> Result<usize> {
        check_visit_start(pos, self.base)?;
        let mut pos = pos;
        let mut visited = 0usize;
        let mut index = self.extents.partition_point(|extent| extent.end() <= pos);
        while visited < max && pos < self.end {
            let Some(extent) = self.extents.get(index) else {
                break;
            };
            let offset = pos - extent.start();
            let take = (extent.len() - offset).min((max - visited) as u64) as usize;
            match extent {
                Extent::Memory { segment, .. } => {
                    let offset = offset as usize;
                    visitor(&segment.as_slice()[offset..offset + take]);
                }
                Extent::Spilled { token, .. } => {
                    let bytes = self
                        .ready_sink()?
                        .read(*token, offset, take)
                        .map_err(StreamingError::Overflow)?;
                    visitor(&bytes);
                }
            }
            visited += take;
            pos += take as u64;
            index += 1;
        }
        Ok(visited)
    }

    fn release_before(&mut self, pos: u64) {
        while self
            .extents
            .front()
            .is_some_and(|extent| extent.end() <= pos)
        {
            if let Some(extent) = self.extents.pop_front() {
                self.discard(extent);
            }
        }
        self.base = self.extents.front().map_or(self.end, Extent::start);
    }

    fn first_release_boundary(&self) -> Option<u64> {
        self.extents.front().map(Extent::end)
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn end(&self) -> u64 {
        self.end
    }

    fn retained(&self) -> RetainedUnits {
        RetainedUnits {
            base: self.base,
            frontier: self.end,
            in_memory: self.in_memory,
            overflowed: self.overflowed,
            materialized: 0,
            extents: self.extents.len(),
        }
    }

    fn clear(&mut self) {
        while let Some(extent) = self.extents.pop_front() {
            self.discard(extent);
        }
        self.base = self.end;
        self.overflow = OverflowSlot::Disabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ByteSize, overflow::MemoryOverflowSink};
    use spark_buffer::PoolConfig;

    fn small_pool(limit: Option<usize>) -> SegmentPool {
        SegmentPool::new(PoolConfig {
            min_segment_size: 16,
            max_segment_size: 64,
            max_cached_per_class: 8,
            max_resident_bytes: limit,
        })
    }

    fn settings(max_in_memory: u64, overflow: OverflowSlot) -> ByteStoreSettings {
        ByteStoreSettings {
            initial_segment: 16,
            segment_size: 32,
            max_in_memory,
            overflow,
            expected_in_memory: false,
        }
    }

    fn collect(store: &ByteStore, pos: u64, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        store
            .visit(pos, max, &mut |bytes: &[u8]| out.extend_from_slice(bytes))
            .expect("访问失败");
        out
    }

    #[test]
    fn appends_span_segments_and_visit_crosses_them() {
        let mut store = ByteStore::new(
            ProviderId::next(),
            small_pool(None),
            settings(1024, OverflowSlot::Disabled),
        );
        let payload: Vec<u8> = (0..70u8).collect();
        store.append(&payload[..10]).expect("追加失败");
        store.append(&payload[10..]).expect("追加失败");
        assert_eq!(store.end(), 70);
        assert_eq!(collect(&store, 5, 50), payload[5..55].to_vec());
        let retained = store.retained();
        assert_eq!(retained.in_memory, 70);
        assert_eq!(retained.extents, 3, "16 + 32 + 32 字节段");
    }

    #[test]
    fn release_before_only_drops_whole_extents() {
        let pool = small_pool(None);
        let mut store = ByteStore::new(
            ProviderId::next(),
            pool.clone(),
            settings(1024, OverflowSlot::Disabled),
        );
        store.append(&[1u8; 48]).expect("追加失败");
        store.release_before(20);
        assert_eq!(store.base(), 16, "首段 [0,16) 已整体越过");
        assert_eq!(store.retained().in_memory, 32);

        let err = store
            .visit(10, 4, &mut |_: &[u8]| {})
            .expect_err("已释放位置不可访问");
        assert_eq!(err.code(), crate::codes::SEEK_OUT_OF_RANGE);

        store.clear();
        assert_eq!(pool.statistics().active_leases, 0);
    }

    #[test]
    fn spills_past_memory_limit_and_reads_back() {
        let sink = Arc::new(MemoryOverflowSink::new());
        let mut store = ByteStore::new(
            ProviderId::next(),
            small_pool(None),
            settings(32, OverflowSlot::Ready(sink.clone())),
        );
        store.append(&[7u8; 32]).expect("追加失败");
        store.append(&[9u8; 20]).expect("溢出追加失败");
        assert_eq!(store.retained().overflowed, 20);
        assert_eq!(sink.stored_bytes(), 20);

        let bytes = collect(&store, 30, 6);
        assert_eq!(bytes, vec![7, 7, 9, 9, 9, 9]);

        store.release_before(52);
        assert_eq!(sink.stored_bytes(), 0);
        assert_eq!(store.retained().total(), 0);
    }

    #[test]
    fn exceeding_limit_without_sink_is_recoverable() {
        let mut store = ByteStore::new(
            ProviderId::next(),
            small_pool(None),
            settings(16, OverflowSlot::Disabled),
        );
        store.append(&[1u8; 16]).expect("追加失败");
        let err = store.append(&[2u8; 1]).expect_err("超过上限必须失败");
        assert!(matches!(
            err,
            StreamingError::BufferSizeExceeded {
                limit: 16,
                retained: 16,
                requested: 1
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(store.end(), 16);
    }

    #[test]
    fn pool_exhaustion_leaks_no_segments() {
        let pool = small_pool(Some(64));
        let mut store = ByteStore::new(
            ProviderId::next(),
            pool.clone(),
            settings(1024, OverflowSlot::Disabled),
        );
        let err = store.append(&[0u8; 100]).expect_err("配额不足必须失败");
        assert_eq!(err.code(), crate::codes::RESOURCE_EXHAUSTED);
        assert_eq!(pool.statistics().active_leases, 0);
        assert_eq!(store.end(), 0);
        assert_eq!(store.retained().extents, 0);
    }

    #[test]
    fn size_hint_under_threshold_keeps_overflow_as_fallback() {
        let pool = small_pool(None);
        let config = ByteStreamingConfig {
            initial_buffer_size: ByteSize::bytes(48),
            max_in_memory_size: ByteSize::bytes(256),
            ..ByteStreamingConfig::default()
        };
        let fits = ByteStoreSettings::resolve(&config, &pool, Some(20));
        assert_eq!(fits.strategy(), BufferStrategy::InMemory);
        assert_eq!(fits.initial_segment, 20);
        assert!(
            matches!(fits.overflow, OverflowSlot::Lazy(_)),
            "提示只影响策略报告，溢出去处仍按配置保留"
        );

        let unknown = ByteStoreSettings::resolve(&config, &pool, None);
        assert_eq!(unknown.strategy(), BufferStrategy::Overflowable);
        assert_eq!(unknown.initial_segment, 48);
        assert_eq!(unknown.segment_size, 64, "截断到段池最大等级");

        let disabled = ByteStoreSettings::resolve(&config.clone().in_memory(), &pool, None);
        assert_eq!(disabled.strategy(), BufferStrategy::InMemory);
    }

    #[test]
    fn understated_hint_still_spills() {
        let sink = Arc::new(MemoryOverflowSink::new());
        let mut fallback = settings(32, OverflowSlot::Ready(sink.clone()));
        fallback.expected_in_memory = true;
        assert_eq!(fallback.strategy(), BufferStrategy::InMemory);

        let mut store = ByteStore::new(ProviderId::next(), small_pool(None), fallback);
        store.append(&[1u8; 32]).expect("追加失败");
        store.append(&[2u8; 40]).expect("提示偏小时仍可溢出");
        assert_eq!(store.end(), 72);
        assert_eq!(sink.stored_bytes(), 40);
    }
}
