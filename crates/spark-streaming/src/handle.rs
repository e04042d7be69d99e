//! # handle 模块说明
//!
//! ## 角色定位（Why）
//! - 宿主在启动时根据 `StreamingConfig::enabled` 决定使用默认实现还是空实现，
//!   之后的调用方不应关心具体是哪一个；
//! - 以枚举而非 trait 对象承载选择：`StreamingManager` 带有泛型方法，无法做成 `dyn`。
//!
//! ## 契约（What）
//! - 每一层句柄（管理器、子管理器、工厂）都只是把调用转发给所选实现；
//! - `Null` 分支的所有操作都不会失败。

use tracing::debug;

use crate::{
    config::{ByteStreamingConfig, ObjectStreamingConfig, StreamingConfig},
    error::Result,
    facade::{
        ByteStreamingManager, DefaultByteStreamingManager, DefaultObjectStreamingManager,
        DefaultStreamingManager, ObjectStreamingManager, StreamingManager,
    },
    factory::{
        ByteCursorProviderFactory, CursorProviderFactory, ObjectCursorProviderFactory,
        PassThroughFactory, Repeatable,
    },
    manager::ManagedCursorProvider,
    null::{NullByteStreamingManager, NullObjectStreamingManager, NullStreamingManager},
    provider::CursorProvider,
    scope::EventScope,
    source::{ReadOnce, StreamItem},
    statistics::StreamingStatistics,
    telemetry,
};

/// 按配置选定的流式管理器。
#[derive(Debug)]
pub enum StreamingManagerHandle {
    Default(DefaultStreamingManager),
    Null(NullStreamingManager),
}

impl StreamingManagerHandle {
    /// `enabled = false` 时选择空实现，且不校验其余字段。
    pub fn from_config(config: StreamingConfig) -> Result<Self> {
        if !config.enabled {
            debug!(
                target: telemetry::MANAGER,
                "streaming disabled, using null streaming manager"
            );
            return Ok(Self::Null(NullStreamingManager));
        }
        DefaultStreamingManager::new(config).map(Self::Default)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Default(_))
    }

    /// 同步处理一轮泄漏通知；空实现返回 0。
    pub fn run_reclamation(&self) -> usize {
        match self {
            Self::Default(manager) => manager.run_reclamation(),
            Self::Null(_) => 0,
        }
    }
}

impl StreamingManager for StreamingManagerHandle {
    type Bytes = ByteStreamingManagerHandle;
    type Objects = ObjectStreamingManagerHandle;

    fn for_bytes(&self) -> ByteStreamingManagerHandle {
        match self {
            Self::Default(manager) => ByteStreamingManagerHandle::Default(manager.for_bytes()),
            Self::Null(manager) => ByteStreamingManagerHandle::Null(manager.for_bytes()),
        }
    }

    fn for_objects(&self) -> ObjectStreamingManagerHandle {
        match self {
            Self::Default(manager) => ObjectStreamingManagerHandle::Default(manager.for_objects()),
            Self::Null(manager) => ObjectStreamingManagerHandle::Null(manager.for_objects()),
        }
    }

    fn manage<S: ReadOnce>(
        &self,
        provider: CursorProvider<S>,
        scope: &dyn EventScope,
    ) -> Result<ManagedCursorProvider<S>> {
        match self {
            Self::Default(manager) => manager.manage(provider, scope),
            Self::Null(manager) => manager.manage(provider, scope),
        }
    }

    fn statistics(&self) -> StreamingStatistics {
        match self {
            Self::Default(manager) => manager.statistics(),
            Self::Null(manager) => manager.statistics(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ByteStreamingManagerHandle {
    Default(DefaultByteStreamingManager),
    Null(NullByteStreamingManager),
}

impl ByteStreamingManager for ByteStreamingManagerHandle {
    type Factory = CursorProviderFactoryHandle<ByteCursorProviderFactory, PassThroughFactory<u8>>;

    fn cursor_provider_factory(&self, config: ByteStreamingConfig) -> Result<Self::Factory> {
        match self {
            Self::Default(manager) => manager
                .cursor_provider_factory(config)
                .map(CursorProviderFactoryHandle::Default),
            Self::Null(manager) => manager
                .cursor_provider_factory(config)
                .map(CursorProviderFactoryHandle::Null),
        }
    }

    fn default_factory(&self) -> Self::Factory {
        match self {
            Self::Default(manager) => CursorProviderFactoryHandle::Default(manager.default_factory()),
            Self::Null(manager) => CursorProviderFactoryHandle::Null(manager.default_factory()),
        }
    }

    fn in_memory_factory(&self, config: ByteStreamingConfig) -> Result<Self::Factory> {
        match self {
            Self::Default(manager) => manager
                .in_memory_factory(config)
                .map(CursorProviderFactoryHandle::Default),
            Self::Null(manager) => manager
                .in_memory_factory(config)
                .map(CursorProviderFactoryHandle::Null),
        }
    }

    fn non_repeatable_factory(&self) -> Self::Factory {
        match self {
            Self::Default(manager) => {
                CursorProviderFactoryHandle::Default(manager.non_repeatable_factory())
            }
            Self::Null(manager) => CursorProviderFactoryHandle::Null(manager.non_repeatable_factory()),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ObjectStreamingManagerHandle {
    Default(DefaultObjectStreamingManager),
    Null(NullObjectStreamingManager),
}

impl ObjectStreamingManager for ObjectStreamingManagerHandle {
    type Factory<T: StreamItem> =
        CursorProviderFactoryHandle<ObjectCursorProviderFactory<T>, PassThroughFactory<T>>;

    fn cursor_provider_factory<T: StreamItem>(
        &self,
        config: ObjectStreamingConfig,
    ) -> Result<Self::Factory<T>> {
        match self {
            Self::Default(manager) => manager
                .cursor_provider_factory(config)
                .map(CursorProviderFactoryHandle::Default),
            Self::Null(manager) => manager
                .cursor_provider_factory(config)
                .map(CursorProviderFactoryHandle::Null),
        }
    }

    fn default_factory<T: StreamItem>(&self) -> Self::Factory<T> {
        match self {
            Self::Default(manager) => CursorProviderFactoryHandle::Default(manager.default_factory()),
            Self::Null(manager) => CursorProviderFactoryHandle::Null(manager.default_factory()),
        }
    }

    fn non_repeatable_factory<T: StreamItem>(&self) -> Self::Factory<T> {
        match self {
            Self::Default(manager) => {
                CursorProviderFactoryHandle::Default(manager.non_repeatable_factory())
            }
            Self::Null(manager) => CursorProviderFactoryHandle::Null(manager.non_repeatable_factory()),
        }
    }
}

/// 两种工厂实现之一。
#[derive(Clone, Debug)]
pub enum CursorProviderFactoryHandle<A, B> {
    Default(A),
    Null(B),
}

impl<A, B> CursorProviderFactory for CursorProviderFactoryHandle<A, B>
where
    A: CursorProviderFactory,
    B: CursorProviderFactory<Item = A::Item>,
{
    type Item = A::Item;

    fn create<S>(&self, scope: &dyn EventScope, source: S) -> Result<Repeatable<S>>
    where
        S: ReadOnce<Item = Self::Item>,
    {
        match self {
            Self::Default(factory) => factory.create(scope, source),
            Self::Null(factory) => factory.create(scope, source),
        }
    }

    fn accepts<S>(&self, source: &S) -> bool
    where
        S: ReadOnce<Item = Self::Item>,
    {
        match self {
            Self::Default(factory) => factory.accepts(source),
            Self::Null(factory) => factory.accepts(source),
        }
    }
}
