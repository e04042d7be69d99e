//! 禁用流式缓冲时使用的空实现：不池化、不跟踪，工厂原样交回源。

use crate::{
    config::{ByteStreamingConfig, ObjectStreamingConfig},
    error::Result,
    facade::{ByteStreamingManager, ObjectStreamingManager, StreamingManager},
    factory::PassThroughFactory,
    manager::ManagedCursorProvider,
    provider::CursorProvider,
    scope::EventScope,
    source::{ReadOnce, StreamItem},
    statistics::StreamingStatistics,
};

/// 无状态的空流式管理器。
///
/// `manage` 返回的受管提供者与传入的提供者指向同一实例，但不会被登记：
/// 作用域终止不会关闭它，统计始终为零。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NullStreamingManager;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NullByteStreamingManager;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NullObjectStreamingManager;

impl StreamingManager for NullStreamingManager {
    type Bytes = NullByteStreamingManager;
    type Objects = NullObjectStreamingManager;

    fn for_bytes(&self) -> NullByteStreamingManager {
        NullByteStreamingManager
    }

    fn for_objects(&self) -> NullObjectStreamingManager {
        NullObjectStreamingManager
    }

    fn manage<S: ReadOnce>(
        &self,
        provider: CursorProvider<S>,
        scope: &dyn EventScope,
    ) -> Result<ManagedCursorProvider<S>> {
        Ok(ManagedCursorProvider::new(provider, scope.id()))
    }

    fn statistics(&self) -> StreamingStatistics {
        StreamingStatistics::default()
    }
}

impl ByteStreamingManager for NullByteStreamingManager {
    type Factory = PassThroughFactory<u8>;

    fn cursor_provider_factory(&self, _config: ByteStreamingConfig) -> Result<Self::Factory> {
        Ok(PassThroughFactory::new())
    }

    fn default_factory(&self) -> Self::Factory {
        PassThroughFactory::new()
    }

    fn in_memory_factory(&self, _config: ByteStreamingConfig) -> Result<Self::Factory> {
        Ok(PassThroughFactory::new())
    }

    fn non_repeatable_factory(&self) -> Self::Factory {
        PassThroughFactory::new()
    }
}

impl ObjectStreamingManager for NullObjectStreamingManager {
    type Factory<T: StreamItem> = PassThroughFactory<T>;

    fn cursor_provider_factory<T: StreamItem>(
        &self,
        _config: ObjectStreamingConfig,
    ) -> Result<PassThroughFactory<T>> {
        Ok(PassThroughFactory::new())
    }

    fn default_factory<T: StreamItem>(&self) -> PassThroughFactory<T> {
        PassThroughFactory::new()
    }

    fn non_repeatable_factory<T: StreamItem>(&self) -> PassThroughFactory<T> {
        PassThroughFactory::new()
    }
}
