//! 日志目标常量。
//!
//! 订阅者可以按目标过滤，例如 `RUST_LOG=spark_streaming::reclaim=warn` 只保留泄漏告警。

pub(crate) const PROVIDER: &str = "spark_streaming::provider";
pub(crate) const CURSOR: &str = "spark_streaming::cursor";
pub(crate) const MANAGER: &str = "spark_streaming::manager";
pub(crate) const RECLAIM: &str = "spark_streaming::reclaim";
pub(crate) const OVERFLOW: &str = "spark_streaming::overflow";
