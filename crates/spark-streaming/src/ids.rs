//! 句柄与作用域标识。
//!
//! 标识在进程内单调递增且永不复用，日志与统计中的 `provider_id` / `cursor_id` / `scope_id`
//! 字段均来自这里。

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// 分配一个进程内唯一的新标识。
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// 原始数值，供日志字段与错误上下文使用。
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_id!(
    /// 游标提供者标识。
    ProviderId,
    NEXT_PROVIDER_ID,
    "provider"
);
define_id!(
    /// 游标标识。
    CursorId,
    NEXT_CURSOR_ID,
    "cursor"
);
define_id!(
    /// 事件作用域标识；由 [`EventScope`](crate::EventScope) 实现负责分配。
    ScopeId,
    NEXT_SCOPE_ID,
    "scope"
);
