use criterion::{Criterion, black_box};
use spark_buffer::SegmentPool;
use std::{env, sync::Arc, thread, time::Duration};

/// 基准：单线程“租借 -> 写入 -> 归还”往返成本。
///
/// # 设计背景（Why）
/// - 段池位于每次缓冲增长的热路径上，命中自由链表时的成本应接近一次 push/pop；
/// - 该基准用于在调整分桶策略或锁实现时快速检测回归。
fn bench_acquire_release(c: &mut Criterion) {
    let pool = SegmentPool::default();
    let payload = [7u8; 1024];
    c.bench_function("segment_acquire_release", |b| {
        b.iter(|| {
            let mut segment = pool.acquire(black_box(16 * 1024)).unwrap();
            segment.append(&payload);
            black_box(segment.len());
        });
    });
}

/// 基准：四个线程在不同等级上并发租借，观察分桶锁的竞争开销。
fn bench_contended_classes(c: &mut Criterion) {
    let pool = Arc::new(SegmentPool::default());
    c.bench_function("segment_contended_classes", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|worker| {
                    let pool = Arc::clone(&pool);
                    thread::spawn(move || {
                        for _ in 0..64 {
                            let segment = pool.acquire(4096 << worker).unwrap();
                            black_box(segment.capacity());
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_acquire_release(&mut criterion);
    bench_contended_classes(&mut criterion);
    criterion.final_summary();
}
