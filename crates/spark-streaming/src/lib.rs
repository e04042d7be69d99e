//! `spark-streaming`：让单次读取的字节流或对象流可以被多个独立游标重复读取。
//!
//! # 模块定位（Why）
//! - 集成消息在流水线中会被多个分支读取（日志、转换、路由判定……），而传输层交给我们的往往是
//!   只能读一次的流；本 crate 在不把整个负载永久驻留内存、也不要求每个消费者都显式释放资源的前提下，
//!   提供“可重复读取”的能力；
//! - 资源寿命由外部的事件作用域（[`EventScope`]）界定：作用域结束时，仍未关闭的提供者与游标被强制关闭。
//!
//! # 架构概览（How）
//! - [`CursorProvider`] 持有单次数据源与按需增长的缓冲（池化段 / 对象批次 / 溢出汇），
//!   通过 [`CursorProvider::open_cursor`] 生成位置彼此独立的 [`Cursor`]；
//! - 缓冲只保留最慢游标之后的数据，内存占用与“最快游标 − 最慢游标”的跨度成正比；
//! - [`CursorManager`] 把提供者绑定到事件作用域并维护 [`StreamingStatistics`]，
//!   丢弃而未关闭的句柄由析构函数关闭，并经回收队列记录告警；
//! - [`StreamingManager`] 是外部协作者唯一的入口，[`DefaultStreamingManager`] 与
//!   [`NullStreamingManager`] 是它的两种实现。
//!
//! # 命名约定（Consistency）
//! - “提供者（provider）”“游标（cursor）”“前沿（frontier）”“水位（watermark）”在全 crate 中含义一致，
//!   见各模块文档。

mod config;
mod cursor;
mod error;
mod facade;
mod factory;
mod handle;
mod ids;
mod manager;
mod null;
mod overflow;
mod provider;
mod scope;
mod source;
mod statistics;
mod store;
mod telemetry;

pub use config::{
    ByteSize, ByteStreamingConfig, DataUnit, ObjectStreamingConfig, OverflowMode,
    ReclamationConfig, RetentionPolicy, StreamingConfig,
};
pub use cursor::Cursor;
pub use error::{HandleKind, Result, StreamingError, codes};
pub use facade::{
    ByteStreamingManager, DefaultByteStreamingManager, DefaultObjectStreamingManager,
    DefaultStreamingManager, ObjectStreamingManager, StreamingManager,
};
pub use factory::{
    ByteCursorProviderFactory, CursorProviderFactory, ObjectCursorProviderFactory,
    PassThroughFactory, Repeatable,
};
pub use handle::{
    ByteStreamingManagerHandle, CursorProviderFactoryHandle, ObjectStreamingManagerHandle,
    StreamingManagerHandle,
};
pub use ids::{CursorId, ProviderId, ScopeId};
pub use manager::{CursorManager, LeakNotice, ManagedCursorProvider};
pub use null::{NullByteStreamingManager, NullObjectStreamingManager, NullStreamingManager};
pub use overflow::{
    FileOverflowSink, MemoryOverflowSink, OverflowSink, OverflowToken, SharedOverflowSink,
};
pub use provider::{BufferStrategy, CursorProvider};
pub use scope::{EventScope, ManualScope, TerminationCallback};
pub use source::{BytesSource, IterSource, ReadOnce, ReaderSource, StreamItem, VecSource};
pub use statistics::StreamingStatistics;
pub use store::RetainedUnits;

pub use spark_buffer::{PoolConfig, PoolError, PoolStats, SegmentPool};
