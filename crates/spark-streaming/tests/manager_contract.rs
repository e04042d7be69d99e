//! `manager_contract` 集成测试：验证流式管理器、事件作用域与统计之间的协作契约。
//!
//! # 测试目标（Why）
//! - 关闭幂等，任何关闭路径都不会让统计重复递减；
//! - 作用域终止后，归属于它的提供者与游标全部关闭，即使应用从未显式关闭；
//! - 丢弃而未关闭的句柄在一轮回收内被计数，段归还段池；
//! - 空实现原样交回输入，统计始终为零。
//!
//! # 结构安排（How）
//! - 所有默认管理器都以手动回收模式构造，使回收时机由测试决定；
//! - 并发测试让多个线程读取同一提供者，或在作用域终止、登记的同时打开游标，验证内容与统计。

use std::{io, thread};

use spark_streaming::{
    ByteStreamingManager, CursorProvider, CursorProviderFactory, DefaultStreamingManager,
    EventScope, IterSource, ManualScope, NullStreamingManager, ObjectStreamingConfig,
    ObjectStreamingManager, ReaderSource, ReclamationConfig, StreamingConfig, StreamingError,
    StreamingManager, StreamingManagerHandle, StreamingStatistics, VecSource, codes,
};

fn manager() -> DefaultStreamingManager {
    DefaultStreamingManager::new(StreamingConfig {
        reclamation: ReclamationConfig::manual(),
        ..StreamingConfig::default()
    })
    .expect("默认配置必须合法")
}

fn reader(len: usize) -> ReaderSource<io::Cursor<Vec<u8>>> {
    ReaderSource::new(io::Cursor::new((0..len).map(|i| i as u8).collect()))
}

#[test]
fn closing_twice_never_double_decrements() {
    let manager = manager();
    let scope = ManualScope::new();
    let provider = manager
        .for_bytes()
        .default_factory()
        .create(&scope, reader(1024))
        .expect("创建失败")
        .into_provider()
        .expect("默认工厂必须缓冲");
    let mut first = provider.open_cursor().expect("打开游标失败");
    let mut second = provider.open_cursor().expect("打开游标失败");
    assert_eq!(manager.statistics().open_cursors, 2);

    assert!(first.close());
    assert!(!first.close());
    assert_eq!(manager.statistics().open_cursors, 1);

    assert!(provider.close());
    assert!(!provider.close());
    assert!(!second.close(), "提供者关闭时游标已被关闭");
    let stats = manager.statistics();
    assert_eq!(stats.open_cursors, 0);
    assert_eq!(stats.open_providers, 0);

    let err = second.read_chunk(8).expect_err("关闭后不可读");
    assert_eq!(err.code(), codes::CLOSED_HANDLE);
    assert_eq!(manager.run_reclamation(), 0, "显式关闭不产生泄漏通知");
}

#[test]
fn scope_termination_closes_everything_it_owns() {
    let manager = manager();
    let scope = ManualScope::new();
    let other = ManualScope::new();
    let factory = manager.for_bytes().default_factory();
    let provider = factory
        .create(&scope, reader(4096))
        .expect("创建失败")
        .into_provider()
        .expect("默认工厂必须缓冲");
    let survivor = factory
        .create(&other, reader(16))
        .expect("创建失败")
        .into_provider()
        .expect("默认工厂必须缓冲");
    let mut cursors: Vec<_> = (0..3)
        .map(|_| provider.open_cursor().expect("打开游标失败"))
        .collect();
    cursors[0].read_chunk(100).expect("读取失败");
    let mut other_cursor = survivor.open_cursor().expect("打开游标失败");
    other_cursor.read_chunk(4).expect("读取失败");

    let stats = manager.statistics();
    assert_eq!((stats.open_providers, stats.open_cursors), (2, 4));
    assert_eq!(stats.tracked_scopes, 2);

    assert!(scope.terminate());
    let stats = manager.statistics();
    assert_eq!((stats.open_providers, stats.open_cursors), (1, 1));
    assert_eq!(stats.tracked_scopes, 1);
    assert!(provider.is_closed());
    assert!(!survivor.is_closed());

    for cursor in &mut cursors {
        let err = cursor.read_chunk(8).expect_err("作用域终止后不可读");
        assert!(matches!(err, StreamingError::ScopeTerminated { scope: id } if id == scope.id()));
    }
    drop(cursors);
    drop(provider);
    assert_eq!(manager.run_reclamation(), 0, "被作用域关闭的句柄不算泄漏");
    assert_eq!(manager.pool().statistics().active_leases, 1, "只剩存活提供者的段");
}

#[test]
fn managing_into_a_terminated_scope_fails() {
    let manager = manager();
    let scope = ManualScope::new();
    scope.terminate();
    let err = manager
        .for_objects()
        .default_factory::<u32>()
        .create(&scope, IterSource::new(0..10u32))
        .expect_err("已终止作用域必须拒绝");
    assert_eq!(err.code(), codes::SCOPE_TERMINATED);
    assert_eq!(manager.statistics(), StreamingStatistics::default());
}

#[test]
fn dropped_handles_are_reclaimed_within_one_cycle() {
    let manager = manager();
    let scope = ManualScope::new();
    let provider = manager
        .for_bytes()
        .default_factory()
        .create(&scope, reader(10_000))
        .expect("创建失败")
        .into_provider()
        .expect("默认工厂必须缓冲");
    let mut cursor = provider.open_cursor().expect("打开游标失败");
    cursor.read_chunk(5_000).expect("读取失败");
    assert!(manager.pool().statistics().active_leases > 0);

    drop(cursor);
    assert_eq!(manager.run_reclamation(), 1);
    let stats = manager.statistics();
    assert_eq!(stats.open_cursors, 0);
    assert_eq!(stats.reclaimed_cursors, 1);

    drop(provider);
    assert_eq!(manager.run_reclamation(), 1);
    let stats = manager.statistics();
    assert_eq!(stats.open_providers, 0);
    assert_eq!(stats.reclaimed_providers, 1);
    assert_eq!(manager.pool().statistics().active_leases, 0, "段全部归还段池");
}

#[test]
fn null_manager_is_transparent() {
    let manager = NullStreamingManager;
    let scope = ManualScope::new();

    let provider = CursorProvider::objects(
        VecSource::new(vec!["x", "y"]),
        &ObjectStreamingConfig::default(),
    );
    let managed = manager.manage(provider.clone(), &scope).expect("空实现不会失败");
    assert!(managed.ptr_eq(&provider));
    assert_eq!(manager.statistics(), StreamingStatistics::default());

    let source = reader(8);
    let factory = manager.for_bytes().default_factory();
    assert!(!factory.accepts(&source));
    let passed = factory
        .create(&scope, source)
        .expect("空实现不会失败")
        .into_source()
        .expect("空实现原样交回源");
    assert_eq!(passed.into_inner().position(), 0, "源未被读取");

    let mut cursor = managed.open_cursor().expect("打开游标失败");
    assert_eq!(cursor.next_batch(2).expect("读取失败"), ["x", "y"]);
    scope.terminate();
    assert!(!managed.is_closed());
    assert_eq!(manager.statistics(), StreamingStatistics::default());
}

#[test]
fn handle_follows_enabled_flag() {
    let disabled: StreamingConfig = toml::from_str("enabled = false").expect("解析失败");
    let handle = StreamingManagerHandle::from_config(disabled).expect("禁用时总是成功");
    assert!(!handle.is_enabled());
    let result = handle
        .for_objects()
        .default_factory::<u8>()
        .create(&ManualScope::new(), VecSource::new(vec![1, 2]))
        .expect("空实现不会失败");
    assert!(!result.is_repeatable());

    let enabled: StreamingConfig = toml::from_str(
        r#"
        [reclamation]
        background = false
        "#,
    )
    .expect("解析失败");
    let handle = StreamingManagerHandle::from_config(enabled).expect("默认配置必须合法");
    assert!(handle.is_enabled());
    let result = handle
        .for_bytes()
        .default_factory()
        .create(&ManualScope::new(), reader(32))
        .expect("创建失败");
    assert!(result.is_repeatable());
    assert_eq!(handle.statistics().open_providers, 1);
}

#[test]
fn concurrent_readers_see_identical_content() {
    let manager = manager();
    let scope = ManualScope::new();
    let expected: Vec<u8> = (0..200_000usize).map(|i| i as u8).collect();
    let provider = manager
        .for_bytes()
        .default_factory()
        .create(&scope, reader(expected.len()))
        .expect("创建失败")
        .into_provider()
        .expect("默认工厂必须缓冲");

    let workers: Vec<_> = (0..4)
        .map(|index| {
            let mut cursor = provider.open_cursor().expect("打开游标失败");
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let chunk = cursor.read_chunk(1_000 + index * 777).expect("读取失败");
                    if chunk.is_empty() {
                        break;
                    }
                    seen.extend_from_slice(&chunk);
                }
                cursor.close();
                seen
            })
        })
        .collect();

    for worker in workers {
        let seen = worker.join().expect("读取线程不应崩溃");
        assert_eq!(seen, expected);
    }
    assert_eq!(manager.statistics().open_cursors, 0);
    assert_eq!(provider.retained().total(), 0, "所有游标关闭后不再保留数据");
    provider.close();
}

#[test]
fn cursors_opened_while_scope_terminates_are_all_closed() {
    for _ in 0..32 {
        let manager = manager();
        let scope = ManualScope::new();
        let provider = manager
            .for_bytes()
            .default_factory()
            .create(&scope, reader(256))
            .expect("创建失败")
            .into_provider()
            .expect("默认工厂必须缓冲");

        let opener = {
            let provider = provider.clone();
            thread::spawn(move || {
                let mut opened = Vec::new();
                loop {
                    match provider.open_cursor() {
                        Ok(cursor) => opened.push(cursor),
                        Err(err) => return (opened, err),
                    }
                }
            })
        };
        thread::yield_now();
        assert!(scope.terminate());

        let (mut opened, err) = opener.join().expect("打开线程不应崩溃");
        assert!(matches!(err, StreamingError::ScopeTerminated { scope: id } if id == scope.id()));
        for cursor in &mut opened {
            let err = cursor.read_chunk(4).expect_err("作用域终止后不可读");
            assert_eq!(err.code(), codes::SCOPE_TERMINATED);
        }
        let stats = manager.statistics();
        assert_eq!((stats.open_providers, stats.open_cursors), (0, 0));
        assert_eq!(stats.tracked_scopes, 0);
        drop(opened);
        assert_eq!(manager.run_reclamation(), 0, "被作用域关闭的游标不算泄漏");
    }
}

#[test]
fn cursors_opened_after_registration_are_always_counted() {
    for _ in 0..32 {
        let manager = manager();
        let scope = ManualScope::new();
        let provider =
            CursorProvider::objects(IterSource::new(0..64u32), &ObjectStreamingConfig::default());

        let opener = {
            let provider = provider.clone();
            thread::spawn(move || {
                let mut opened = Vec::new();
                let mut after_registration = 0usize;
                while opened.len() < 200 {
                    let registered = provider.is_managed();
                    opened.push(provider.open_cursor().expect("打开游标失败"));
                    if registered {
                        after_registration += 1;
                    }
                }
                (opened, after_registration)
            })
        };
        let managed = manager.manage(provider, &scope).expect("登记失败");

        let (opened, after_registration) = opener.join().expect("打开线程不应崩溃");
        let counted = manager.statistics().open_cursors;
        assert!(
            counted >= after_registration,
            "登记可见后打开的 {after_registration} 个游标只计入了 {counted} 个"
        );
        assert!(counted <= opened.len());

        drop(opened);
        managed.close();
        let stats = manager.statistics();
        assert_eq!((stats.open_providers, stats.open_cursors), (0, 0));
    }
}
