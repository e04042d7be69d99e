//! `spark-buffer` 提供面向流式缓冲的定长内存段池。
//!
//! # 模块定位（Why）
//! - 可重复读取的流需要把已经从单次数据源拉取的字节保留下来，
//!   这些字节被切分为固定容量的 [`Segment`]，由 [`SegmentPool`] 统一分配与回收；
//! - 段池是整个流式子系统中唯一直接与内存分配器交互的组件，
//!   也是唯一跨提供者、跨事件作用域共享的资源。
//!
//! # 设计概要（How）
//! - `pool` 模块实现按 2 的幂分级的 `SegmentPool`，每个容量等级拥有独立的自由链表锁，
//!   避免单一全局锁在高并发流式场景下成为瓶颈；
//! - `segment` 模块实现 `Segment`，通过 [`SegmentRecycler`] 在 `Drop` 阶段把内存归还所属池，
//!   因此段不可能绕过池的统计而泄漏；
//! - `config` 模块定义可反序列化的 [`PoolConfig`]，`error` 模块定义 [`PoolError`]。
//!
//! # 命名约定（Consistency）
//! - 延续 `BufferPool` 家族的术语：租借（acquire）、归还（release）、常驻（resident）、可用（available）。

mod config;
mod error;
mod pool;
mod segment;

pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use pool::{ClassOccupancy, PoolStats, SegmentPool};
pub use segment::{ReclaimedSegment, Segment, SegmentRecycler};
