//! # facade 模块说明
//!
//! ## 角色定位（Why）
//! - 协作者只面向 [`StreamingManager`] 这一个入口：按数据类型取得子管理器，再由子管理器产出工厂；
//! - 默认实现持有段池与游标管理器；空实现（见 `null` 模块）在禁用流式缓冲时替换它。
//!
//! ## 契约（What）
//! - 子管理器与工厂都是廉价克隆的值，共享同一个段池与同一个管理器状态；
//! - 工厂在创建时校验配置，之后的 `create` 不再因配置失败；
//! - 管理器被丢弃后，已登记的提供者依旧可用，只是后台回收线程随之停止。

use std::{fmt, sync::Arc};

use spark_buffer::SegmentPool;
use tracing::debug;

use crate::{
    config::{ByteStreamingConfig, ObjectStreamingConfig, StreamingConfig},
    error::Result,
    factory::{ByteCursorProviderFactory, CursorProviderFactory, ObjectCursorProviderFactory},
    manager::{CursorManager, ManagedCursorProvider, ManagerShared},
    provider::CursorProvider,
    scope::EventScope,
    source::{ReadOnce, StreamItem},
    statistics::StreamingStatistics,
    telemetry,
};

/// 流式缓冲的顶层入口。
pub trait StreamingManager: Send + Sync {
    type Bytes: ByteStreamingManager;
    type Objects: ObjectStreamingManager;

    fn for_bytes(&self) -> Self::Bytes;

    fn for_objects(&self) -> Self::Objects;

    /// 把调用方自行构造的提供者登记到作用域；幂等。
    fn manage<S: ReadOnce>(
        &self,
        provider: CursorProvider<S>,
        scope: &dyn EventScope,
    ) -> Result<ManagedCursorProvider<S>>;

    fn statistics(&self) -> StreamingStatistics;
}

/// 字节流子管理器。
pub trait ByteStreamingManager: Send + Sync {
    type Factory: CursorProviderFactory<Item = u8>;

    fn cursor_provider_factory(&self, config: ByteStreamingConfig) -> Result<Self::Factory>;

    /// 使用管理器配置中的字节流默认值。
    fn default_factory(&self) -> Self::Factory;

    /// 不溢出的工厂：超过内存上限的追加直接失败。
    fn in_memory_factory(&self, config: ByteStreamingConfig) -> Result<Self::Factory>;

    /// 从不缓冲的工厂。
    fn non_repeatable_factory(&self) -> Self::Factory;
}

/// 对象流子管理器。
pub trait ObjectStreamingManager: Send + Sync {
    type Factory<T: StreamItem>: CursorProviderFactory<Item = T>;

    fn cursor_provider_factory<T: StreamItem>(
        &self,
        config: ObjectStreamingConfig,
    ) -> Result<Self::Factory<T>>;

    fn default_factory<T: StreamItem>(&self) -> Self::Factory<T>;

    fn non_repeatable_factory<T: StreamItem>(&self) -> Self::Factory<T>;
}

/// 默认流式管理器。
///
/// # 教案式说明
/// - **意图 (Why)**：把段池、游标管理器与配置默认值装配在一起，宿主只需构造一次；
/// - **契约 (What)**：[`DefaultStreamingManager::new`] 先整体校验配置，任何字段非法都返回
///   `InvalidConfig` 且不启动回收线程；
/// - **风险 (Trade-offs)**：子管理器克隆的是共享状态而非管理器本身，管理器丢弃后它们仍可产出
///   提供者，但泄漏通知只能等到下一次（不会再有的）回收轮询。
pub struct DefaultStreamingManager {
    pool: SegmentPool,
    manager: CursorManager,
    config: StreamingConfig,
}

impl DefaultStreamingManager {
    pub fn new(config: StreamingConfig) -> Result<Self> {
        config.validate()?;
        let pool = SegmentPool::new(config.pool.clone());
        let manager = CursorManager::new(&config.reclamation)?;
        debug!(
            target: telemetry::MANAGER,
            background_reclaimer = manager.has_background_reclaimer(),
            max_in_memory_bytes = config.bytes.max_in_memory_size.to_bytes(),
            max_in_memory_instances = config.objects.max_in_memory_instances,
            "streaming manager started"
        );
        Ok(Self {
            pool,
            manager,
            config,
        })
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub fn cursor_manager(&self) -> &CursorManager {
        &self.manager
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// 同步处理一轮泄漏通知。
    pub fn run_reclamation(&self) -> usize {
        self.manager.run_reclamation()
    }
}

impl fmt::Debug for DefaultStreamingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultStreamingManager")
            .field("manager", &self.manager)
            .field("pool", &self.pool.statistics())
            .finish()
    }
}

impl StreamingManager for DefaultStreamingManager {
    type Bytes = DefaultByteStreamingManager;
    type Objects = DefaultObjectStreamingManager;

    fn for_bytes(&self) -> DefaultByteStreamingManager {
        DefaultByteStreamingManager {
            pool: self.pool.clone(),
            shared: Arc::clone(self.manager.shared()),
            defaults: self.config.bytes.clone(),
        }
    }

    fn for_objects(&self) -> DefaultObjectStreamingManager {
        DefaultObjectStreamingManager {
            shared: Arc::clone(self.manager.shared()),
            defaults: self.config.objects.clone(),
        }
    }

    fn manage<S: ReadOnce>(
        &self,
        provider: CursorProvider<S>,
        scope: &dyn EventScope,
    ) -> Result<ManagedCursorProvider<S>> {
        self.manager.manage(provider, scope)
    }

    fn statistics(&self) -> StreamingStatistics {
        self.manager.statistics()
    }
}

/// 默认字节流子管理器。
#[derive(Clone)]
pub struct DefaultByteStreamingManager {
    pool: SegmentPool,
    shared: Arc<ManagerShared>,
    defaults: ByteStreamingConfig,
}

impl DefaultByteStreamingManager {
    pub fn defaults(&self) -> &ByteStreamingConfig {
        &self.defaults
    }
}

impl fmt::Debug for DefaultByteStreamingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultByteStreamingManager")
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl ByteStreamingManager for DefaultByteStreamingManager {
    type Factory = ByteCursorProviderFactory;

    fn cursor_provider_factory(
        &self,
        config: ByteStreamingConfig,
    ) -> Result<ByteCursorProviderFactory> {
        config.validate()?;
        Ok(ByteCursorProviderFactory::buffered(
            config,
            self.pool.clone(),
            Arc::clone(&self.shared),
        ))
    }

    fn default_factory(&self) -> ByteCursorProviderFactory {
        ByteCursorProviderFactory::buffered(
            self.defaults.clone(),
            self.pool.clone(),
            Arc::clone(&self.shared),
        )
    }

    fn in_memory_factory(&self, config: ByteStreamingConfig) -> Result<ByteCursorProviderFactory> {
        self.cursor_provider_factory(config.in_memory())
    }

    fn non_repeatable_factory(&self) -> ByteCursorProviderFactory {
        ByteCursorProviderFactory::non_repeatable()
    }
}

/// 默认对象流子管理器。
#[derive(Clone)]
pub struct DefaultObjectStreamingManager {
    shared: Arc<ManagerShared>,
    defaults: ObjectStreamingConfig,
}

impl DefaultObjectStreamingManager {
    pub fn defaults(&self) -> &ObjectStreamingConfig {
        &self.defaults
    }
}

impl fmt::Debug for DefaultObjectStreamingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultObjectStreamingManager")
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl ObjectStreamingManager for DefaultObjectStreamingManager {
    type Factory<T: StreamItem> = ObjectCursorProviderFactory<T>;

    fn cursor_provider_factory<T: StreamItem>(
        &self,
        config: ObjectStreamingConfig,
    ) -> Result<ObjectCursorProviderFactory<T>> {
        config.validate()?;
        Ok(ObjectCursorProviderFactory::buffered(
            config,
            Arc::clone(&self.shared),
        ))
    }

    fn default_factory<T: StreamItem>(&self) -> ObjectCursorProviderFactory<T> {
        ObjectCursorProviderFactory::buffered(self.defaults.clone(), Arc::clone(&self.shared))
    }

    fn non_repeatable_factory<T: StreamItem>(&self) -> ObjectCursorProviderFactory<T> {
        ObjectCursorProviderFactory::non_repeatable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BufferStrategy,
        config::{ByteSize, ReclamationConfig},
        error::StreamingError,
        scope::ManualScope,
        source::{IterSource, ReaderSource},
    };

    fn manager() -> DefaultStreamingManager {
        DefaultStreamingManager::new(StreamingConfig {
            reclamation: ReclamationConfig::manual(),
            ..StreamingConfig::default()
        })
        .expect("默认配置必须合法")
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = StreamingConfig::default();
        config.objects.max_in_memory_instances = 0;
        let err = DefaultStreamingManager::new(config).expect_err("非法配置必须被拒绝");
        assert!(matches!(err, StreamingError::InvalidConfig(_)));
    }

    #[test]
    fn byte_factory_registers_provider_with_scope() {
        let manager = manager();
        let scope = ManualScope::new();
        let factory = manager.for_bytes().default_factory();
        let source = ReaderSource::new(std::io::Cursor::new(vec![7u8; 64]));
        assert!(factory.accepts(&source));

        let provider = factory
            .create(&scope, source)
            .expect("创建失败")
            .into_provider()
            .expect("默认工厂必须缓冲");
        assert_eq!(provider.scope(), scope.id());
        assert_eq!(manager.statistics().open_providers, 1);

        scope.terminate();
        assert!(provider.is_closed());
        assert_eq!(manager.statistics().open_providers, 0);
    }

    #[test]
    fn in_memory_factory_never_overflows() {
        let manager = manager();
        let config = ByteStreamingConfig {
            initial_buffer_size: ByteSize::bytes(1024),
            buffer_size_increment: ByteSize::bytes(1024),
            max_in_memory_size: ByteSize::bytes(4096),
            ..ByteStreamingConfig::default()
        };
        let factory = manager
            .for_bytes()
            .in_memory_factory(config)
            .expect("配置合法");
        assert!(factory.config().is_some_and(|config| !config.overflow_enabled()));

        let provider = factory
            .create(
                &ManualScope::new(),
                ReaderSource::new(std::io::Cursor::new(vec![0u8; 16])),
            )
            .expect("创建失败")
            .into_provider()
            .expect("必须缓冲");
        assert_ne!(provider.strategy(), BufferStrategy::Overflowable);
    }

    #[test]
    fn object_factory_replays_items() {
        let manager = manager();
        let scope = ManualScope::new();
        let provider = manager
            .for_objects()
            .default_factory::<String>()
            .create(
                &scope,
                IterSource::new(["a", "b", "c"].into_iter().map(String::from)),
            )
            .expect("创建失败")
            .into_provider()
            .expect("必须缓冲");

        let mut first = provider.open_cursor().expect("打开游标失败");
        let mut second = provider.open_cursor().expect("打开游标失败");
        assert_eq!(first.next_batch(3).expect("读取失败"), ["a", "b", "c"]);
        assert_eq!(second.next_batch(3).expect("读取失败"), ["a", "b", "c"]);
        first.close();
        second.close();
        provider.close();
        let stats = manager.statistics();
        assert_eq!((stats.open_providers, stats.open_cursors), (0, 0));
        assert_eq!(stats.tracked_scopes, 1, "作用域条目保留到终止为止");
    }
}
