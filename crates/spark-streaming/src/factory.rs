//! # factory 模块说明
//!
//! ## 角色定位（Why）
//! - 协作者拿到一个单次数据源后，通过工厂决定是否把它包装成可重复读取的提供者；
//! - 工厂创建的提供者总是登记到调用方给出的事件作用域，作用域终止即被回收。
//!
//! ## 契约（What）
//! - [`CursorProviderFactory::create`] 返回 [`Repeatable::Provider`]（已登记的提供者）或
//!   [`Repeatable::PassThrough`]（工厂拒绝缓冲，源原样交回）；
//! - [`CursorProviderFactory::accepts`] 只是提示，`create` 的结果才是最终决定。

use std::{fmt, marker::PhantomData, sync::Arc};

use spark_buffer::SegmentPool;

use crate::{
    config::{ByteStreamingConfig, ObjectStreamingConfig},
    error::Result,
    manager::{ManagedCursorProvider, ManagerShared},
    provider::CursorProvider,
    scope::EventScope,
    source::{ReadOnce, StreamItem},
};

/// 工厂的产物：可重复读取的受管提供者，或未经包装的原始源。
pub enum Repeatable<S: ReadOnce> {
    Provider(ManagedCursorProvider<S>),
    PassThrough(S),
}

impl<S: ReadOnce> Repeatable<S> {
    pub fn is_repeatable(&self) -> bool {
        matches!(self, Repeatable::Provider(_))
    }

    pub fn provider(&self) -> Option<&ManagedCursorProvider<S>> {
        match self {
            Repeatable::Provider(provider) => Some(provider),
            Repeatable::PassThrough(_) => None,
        }
    }

    pub fn into_provider(self) -> Option<ManagedCursorProvider<S>> {
        match self {
            Repeatable::Provider(provider) => Some(provider),
            Repeatable::PassThrough(_) => None,
        }
    }

    pub fn into_source(self) -> Option<S> {
        match self {
            Repeatable::Provider(_) => None,
            Repeatable::PassThrough(source) => Some(source),
        }
    }
}

impl<S: ReadOnce> fmt::Debug for Repeatable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repeatable::Provider(provider) => f.debug_tuple("Provider").field(provider).finish(),
            Repeatable::PassThrough(_) => f.write_str("PassThrough(..)"),
        }
    }
}

/// 游标提供者工厂。
pub trait CursorProviderFactory: Send + Sync {
    /// 工厂处理的单元类型。
    type Item: StreamItem;

    /// 为 `source` 创建提供者并登记到 `scope`，或原样交回。
    fn create<S>(&self, scope: &dyn EventScope, source: S) -> Result<Repeatable<S>>
    where
        S: ReadOnce<Item = Self::Item>;

    /// 工厂是否会缓冲该源。
    fn accepts<S>(&self, source: &S) -> bool
    where
        S: ReadOnce<Item = Self::Item>,
    {
        let _ = source;
        true
    }
}

#[derive(Clone)]
enum ByteMode {
    Buffered {
        config: ByteStreamingConfig,
        pool: SegmentPool,
        shared: Arc<ManagerShared>,
    },
    NonRepeatable,
}

/// 字节流工厂：按配置缓冲，或在不可重复模式下原样交回源。
#[derive(Clone)]
pub struct ByteCursorProviderFactory {
    mode: ByteMode,
}

impl ByteCursorProviderFactory {
    pub(crate) fn buffered(
        config: ByteStreamingConfig,
        pool: SegmentPool,
        shared: Arc<ManagerShared>,
    ) -> Self {
        Self {
            mode: ByteMode::Buffered {
                config,
                pool,
                shared,
            },
        }
    }

    pub(crate) fn non_repeatable() -> Self {
        Self {
            mode: ByteMode::NonRepeatable,
        }
    }

    /// 缓冲模式下的配置。
    pub fn config(&self) -> Option<&ByteStreamingConfig> {
        match &self.mode {
            ByteMode::Buffered { config, .. } => Some(config),
            ByteMode::NonRepeatable => None,
        }
    }
}

impl fmt::Debug for ByteCursorProviderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteCursorProviderFactory")
            .field("config", &self.config())
            .finish()
    }
}

impl CursorProviderFactory for ByteCursorProviderFactory {
    type Item = u8;

    fn create<S>(&self, scope: &dyn EventScope, source: S) -> Result<Repeatable<S>>
    where
        S: ReadOnce<Item = u8>,
    {
        match &self.mode {
            ByteMode::Buffered {
                config,
                pool,
                shared,
            } => {
                let provider = CursorProvider::bytes(source, config, pool);
                shared.manage(provider, scope).map(Repeatable::Provider)
            }
            ByteMode::NonRepeatable => Ok(Repeatable::PassThrough(source)),
        }
    }

    fn accepts<S>(&self, _source: &S) -> bool
    where
        S: ReadOnce<Item = u8>,
    {
        matches!(self.mode, ByteMode::Buffered { .. })
    }
}

#[derive(Clone)]
enum ObjectMode {
    Buffered {
        config: ObjectStreamingConfig,
        shared: Arc<ManagerShared>,
    },
    NonRepeatable,
}

/// 对象流工厂。
pub struct ObjectCursorProviderFactory<T> {
    mode: ObjectMode,
    _item: PhantomData<fn() -> T>,
}

impl<T: StreamItem> ObjectCursorProviderFactory<T> {
    pub(crate) fn buffered(config: ObjectStreamingConfig, shared: Arc<ManagerShared>) -> Self {
        Self {
            mode: ObjectMode::Buffered { config, shared },
            _item: PhantomData,
        }
    }

    pub(crate) fn non_repeatable() -> Self {
        Self {
            mode: ObjectMode::NonRepeatable,
            _item: PhantomData,
        }
    }

    pub fn config(&self) -> Option<&ObjectStreamingConfig> {
        match &self.mode {
            ObjectMode::Buffered { config, .. } => Some(config),
            ObjectMode::NonRepeatable => None,
        }
    }
}

impl<T> Clone for ObjectCursorProviderFactory<T> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode.clone(),
            _item: PhantomData,
        }
    }
}

impl<T: StreamItem> fmt::Debug for ObjectCursorProviderFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCursorProviderFactory")
            .field("config", &self.config())
            .finish()
    }
}

impl<T: StreamItem> CursorProviderFactory for ObjectCursorProviderFactory<T> {
    type Item = T;

    fn create<S>(&self, scope: &dyn EventScope, source: S) -> Result<Repeatable<S>>
    where
        S: ReadOnce<Item = T>,
    {
        match &self.mode {
            ObjectMode::Buffered { config, shared } => {
                let provider = CursorProvider::objects(source, config);
                shared.manage(provider, scope).map(Repeatable::Provider)
            }
            ObjectMode::NonRepeatable => Ok(Repeatable::PassThrough(source)),
        }
    }

    fn accepts<S>(&self, _source: &S) -> bool
    where
        S: ReadOnce<Item = T>,
    {
        matches!(self.mode, ObjectMode::Buffered { .. })
    }
}

/// 从不缓冲的工厂：所有源原样交回。
pub struct PassThroughFactory<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> PassThroughFactory<T> {
    pub const fn new() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> Default for PassThroughFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PassThroughFactory<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PassThroughFactory<T> {}

impl<T> fmt::Debug for PassThroughFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PassThroughFactory")
    }
}

impl<T: StreamItem> CursorProviderFactory for PassThroughFactory<T> {
    type Item = T;

    fn create<S>(&self, _scope: &dyn EventScope, source: S) -> Result<Repeatable<S>>
    where
        S: ReadOnce<Item = T>,
    {
        Ok(Repeatable::PassThrough(source))
    }

    fn accepts<S>(&self, _source: &S) -> bool
    where
        S: ReadOnce<Item = T>,
    {
        false
    }
}
