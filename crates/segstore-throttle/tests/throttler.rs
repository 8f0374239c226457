//! `Throttler` 集成测试：覆盖“是否需要节流”、单周期、超限多周期、可中断等待与关闭语义。
//!
//! # 测试结构（What）
//! - 使用 [`ManualTimer`] 记录请求时长并手动/自动完成等待，避免真实等待数十秒；
//! - 使用 [`RecordingMetricsSink::with_hook`] 在每个周期记录后改写压力源，模拟“每周期重新度量”；
//! - 末尾用例改用 [`TokioTimer`]，验证生产定时器路径（暂停的 Tokio 时钟）以及运行时失效时的错误传播。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use segstore_throttle::test_stubs::RecordingMetricsSink;
use segstore_throttle::{
    AtomicPressureSource, MAX_DELAY_MILLIS, ManualTimer, MetricsSink, PressureSource,
    PressureSourceError, ThrottleError, Throttler, ThrottlerName, ThrottlingCalculator,
    TokioTimer, TracingMetricsSink,
};

const CONTAINER_ID: u32 = 1;
const NON_MAX_THROTTLE_MILLIS: u32 = MAX_DELAY_MILLIS - 1;
const SHORT_TIMEOUT: Duration = Duration::from_millis(50);
const TIMEOUT: Duration = Duration::from_secs(10);

fn pressure(name: ThrottlerName) -> Arc<AtomicPressureSource> {
    let source = Arc::new(AtomicPressureSource::new(name));
    source.set_throttling_required(true);
    source
}

fn throttler(
    source: &Arc<AtomicPressureSource>,
    timer: &ManualTimer,
    metrics: &Arc<RecordingMetricsSink>,
) -> Throttler {
    let dyn_source: Arc<dyn PressureSource> = source.clone();
    let calculator = ThrottlingCalculator::new([dyn_source]).expect("single source");
    let metrics: Arc<dyn MetricsSink> = metrics.clone();
    Throttler::new(CONTAINER_ID, calculator, Arc::new(timer.clone()), metrics)
}

/// 让出调度权直到条件成立；超时视为失败。
async fn await_condition(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached before timeout");
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    tokio::time::timeout(limit, future)
        .await
        .expect("future did not resolve in time")
}

#[tokio::test]
async fn throttling_required_reflects_sources_and_close_is_idempotent() {
    let source = pressure(ThrottlerName::Cache);
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::auto_complete();
    let t = throttler(&source, &timer, &metrics);

    source.set_throttling_required(false);
    assert_eq!(t.is_throttling_required(), Ok(false));
    source.set_throttling_required(true);
    assert_eq!(t.is_throttling_required(), Ok(true));
    assert!(metrics.is_empty(), "查询不得产生周期或指标");
    assert!(timer.requested().is_empty());

    assert!(!t.is_closed());
    t.close();
    assert!(t.is_closed());
    t.close();
    assert!(t.is_closed());
}

#[tokio::test]
async fn throttle_without_pressure_resolves_immediately() {
    let source = pressure(ThrottlerName::Cache);
    source.set_throttling_required(false);
    source.set_delay_millis(800);
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::new();
    let t = throttler(&source, &timer, &metrics);

    within(SHORT_TIMEOUT, t.throttle())
        .await
        .expect("no throttling needed");
    assert!(metrics.is_empty());
    assert!(timer.requested().is_empty());
}

#[tokio::test]
async fn single_non_maximum_delay_runs_one_cycle() {
    let source = pressure(ThrottlerName::Cache);
    source.set_delay_millis(NON_MAX_THROTTLE_MILLIS);
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::auto_complete();
    let t = throttler(&source, &timer, &metrics);

    within(SHORT_TIMEOUT, t.throttle()).await.expect("throttle");
    assert_eq!(metrics.delays(), vec![NON_MAX_THROTTLE_MILLIS]);
    assert_eq!(
        timer.requested(),
        vec![Duration::from_millis(u64::from(NON_MAX_THROTTLE_MILLIS))]
    );
}

#[tokio::test]
async fn maximum_delay_repeats_capped_cycles_until_pressure_drops() {
    const REPEAT_COUNT: u32 = 3;
    let source = pressure(ThrottlerName::Cache);
    let next_delay = Arc::new(Mutex::new(MAX_DELAY_MILLIS + REPEAT_COUNT - 1));
    let metrics = {
        let source = Arc::clone(&source);
        let next_delay = Arc::clone(&next_delay);
        Arc::new(RecordingMetricsSink::with_hook(move |_| {
            let mut next = next_delay.lock().expect("next delay lock");
            *next -= 1;
            source.set_delay_millis(*next);
        }))
    };
    let timer = ManualTimer::auto_complete();
    let t = throttler(&source, &timer, &metrics);

    source.set_delay_millis(*next_delay.lock().expect("next delay lock"));
    within(SHORT_TIMEOUT, t.throttle()).await.expect("throttle");

    // 原始延迟依次为 MAX+2、MAX+1、MAX：前两次超限，第三次恰好等于上限，结束循环。
    assert_eq!(
        metrics.delays(),
        vec![MAX_DELAY_MILLIS; REPEAT_COUNT as usize],
        "每个周期都应被截断到上限"
    );
}

#[tokio::test]
async fn interrupted_cache_delay() {
    interrupted_delay(ThrottlerName::Cache).await;
}

#[tokio::test]
async fn interrupted_durable_data_log_delay() {
    interrupted_delay(ThrottlerName::DurableDataLog).await;
}

async fn interrupted_delay(name: ThrottlerName) {
    let supplied = vec![5_000, 2_500, 5_000];
    let source = pressure(name);
    let upcoming = Arc::new(Mutex::new(supplied.clone().into_iter()));
    let metrics = {
        let source = Arc::clone(&source);
        let upcoming = Arc::clone(&upcoming);
        Arc::new(RecordingMetricsSink::with_hook(move |_| {
            // 0 表示压力已解除，之后不再需要节流。
            let next = upcoming.lock().expect("upcoming lock").next().unwrap_or(0);
            source.set_delay_millis(next);
        }))
    };
    let timer = ManualTimer::new();
    let t = throttler(&source, &timer, &metrics);

    let first = upcoming.lock().expect("upcoming lock").next().expect("first delay");
    source.set_delay_millis(first);
    let t1 = tokio::spawn(t.throttle());
    await_condition(|| metrics.len() == 1).await;
    assert!(!t1.is_finished(), "首个周期尚未到期");

    for i in 1..supplied.len() {
        t.notify_throttle_source_changed();
        let expected = i + 1;
        await_condition(|| metrics.len() == expected).await;
        assert!(!t1.is_finished(), "通知不得直接完成 throttle()");
        assert_eq!(timer.pending(), 1, "被放弃的等待必须已释放");
    }

    assert!(timer.complete_last());
    let outcome = within(TIMEOUT, t1).await.expect("throttle task");
    assert_eq!(outcome, Ok(()));
    assert_eq!(metrics.delays(), supplied);
}

#[tokio::test]
async fn back_to_back_notifications_abandon_only_the_current_cycle() {
    let source = pressure(ThrottlerName::Cache);
    source.set_delay_millis(1_000);
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::new();
    let t = throttler(&source, &timer, &metrics);

    let t1 = tokio::spawn(t.throttle());
    await_condition(|| metrics.len() == 1).await;

    // 第二次通知发生时新周期尚未安装，只能是空操作。
    t.notify_throttle_source_changed();
    t.notify_throttle_source_changed();
    await_condition(|| metrics.len() == 2).await;
    settle().await;
    assert_eq!(metrics.len(), 2);
    assert_eq!(timer.pending(), 1);

    assert!(timer.complete_last());
    assert_eq!(within(TIMEOUT, t1).await.expect("throttle task"), Ok(()));
}

#[tokio::test]
async fn notification_after_replacement_abandons_the_new_cycle() {
    let source = pressure(ThrottlerName::Cache);
    source.set_delay_millis(1_000);
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::new();
    let t = throttler(&source, &timer, &metrics);

    let t1 = tokio::spawn(t.throttle());
    await_condition(|| metrics.len() == 1).await;

    t.notify_throttle_source_changed();
    await_condition(|| metrics.len() == 2).await;
    // 第二次通知发生在替代周期安装之后，应放弃的是它而不是已结束的首个周期。
    t.notify_throttle_source_changed();
    await_condition(|| metrics.len() == 3).await;
    settle().await;
    assert_eq!(metrics.len(), 3);
    assert_eq!(timer.pending(), 1);
    assert!(!t1.is_finished());

    assert!(timer.complete_last());
    assert_eq!(within(TIMEOUT, t1).await.expect("throttle task"), Ok(()));
    assert_eq!(timer.requested().len(), 3);
}

#[tokio::test]
async fn notification_racing_natural_elapse_starts_exactly_one_cycle() {
    let source = pressure(ThrottlerName::DurableDataLog);
    source.set_delay_millis(1_000);
    let metrics = {
        let source = Arc::clone(&source);
        Arc::new(RecordingMetricsSink::with_hook(move |_| source.set_delay_millis(700)))
    };
    let timer = ManualTimer::new();
    let t = throttler(&source, &timer, &metrics);

    let t1 = tokio::spawn(t.throttle());
    await_condition(|| metrics.len() == 1).await;

    // 到期与通知之间不让出调度权：等待方下次被轮询时两者都已就绪，到期必须让位于通知。
    assert!(timer.complete_last());
    t.notify_throttle_source_changed();

    await_condition(|| metrics.len() == 2).await;
    settle().await;
    assert_eq!(metrics.delays(), vec![1_000, 700], "只能开启一个新周期");
    assert_eq!(timer.pending(), 1);
    assert!(!t1.is_finished(), "迟到的到期不得完成 throttle()");

    assert!(timer.complete_last());
    assert_eq!(within(TIMEOUT, t1).await.expect("throttle task"), Ok(()));
    assert_eq!(metrics.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notification_from_foreign_thread_restarts_cycle() {
    let source = pressure(ThrottlerName::DurableDataLog);
    source.set_delay_millis(4_000);
    let metrics = {
        let source = Arc::clone(&source);
        Arc::new(RecordingMetricsSink::with_hook(move |_| source.set_delay_millis(1_500)))
    };
    let timer = ManualTimer::new();
    let t = throttler(&source, &timer, &metrics);

    let t1 = tokio::spawn(t.throttle());
    await_condition(|| metrics.len() == 1).await;

    let notifier = t.clone();
    std::thread::spawn(move || notifier.notify_throttle_source_changed())
        .join()
        .expect("notifier thread");
    await_condition(|| metrics.len() == 2).await;

    await_condition(|| timer.complete_last()).await;
    assert_eq!(within(TIMEOUT, t1).await.expect("throttle task"), Ok(()));
    assert_eq!(metrics.delays(), vec![4_000, 1_500]);
}

#[tokio::test]
async fn close_fails_pending_throttle() {
    let source = pressure(ThrottlerName::Cache);
    source.set_delay_millis(MAX_DELAY_MILLIS * 2);
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::new();
    let t = throttler(&source, &timer, &metrics);

    let t1 = tokio::spawn(t.throttle());
    await_condition(|| metrics.len() == 1).await;

    t.close();
    let outcome = within(TIMEOUT, t1).await.expect("throttle task");
    assert_eq!(
        outcome,
        Err(ThrottleError::Closed {
            container_id: CONTAINER_ID
        })
    );
    assert_eq!(metrics.len(), 1, "关闭后不得再开启新周期");
    assert_eq!(timer.pending(), 0);
    assert!(!timer.complete_last());
}

#[tokio::test]
async fn throttle_after_close_fails_without_scheduling() {
    let source = pressure(ThrottlerName::Cache);
    source.set_delay_millis(100);
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::auto_complete();
    let t = throttler(&source, &timer, &metrics);

    t.close();
    let err = within(SHORT_TIMEOUT, t.throttle())
        .await
        .expect_err("closed throttler must fail");
    assert!(err.is_closed());
    assert!(metrics.is_empty());
    assert!(timer.requested().is_empty());
    // 关闭后的通知是空操作。
    t.notify_throttle_source_changed();
}

struct FaultyDelaySource;

impl PressureSource for FaultyDelaySource {
    fn name(&self) -> ThrottlerName {
        ThrottlerName::OperationLog
    }

    fn is_throttling_required(&self) -> Result<bool, PressureSourceError> {
        Ok(true)
    }

    fn delay_millis(&self) -> Result<u32, PressureSourceError> {
        Err(PressureSourceError::new(self.name(), "queue statistics unavailable"))
    }
}

#[tokio::test]
async fn source_fault_fails_throttle() {
    let faulty: Arc<dyn PressureSource> = Arc::new(FaultyDelaySource);
    let calculator = ThrottlingCalculator::new([faulty]).expect("single source");
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::auto_complete();
    let t = Throttler::new(
        CONTAINER_ID,
        calculator,
        Arc::new(timer.clone()),
        metrics.clone(),
    );

    let err = within(SHORT_TIMEOUT, t.throttle())
        .await
        .expect_err("source fault must propagate");
    assert_eq!(err.code(), "throttle.source_fault");
    assert!(matches!(
        err,
        ThrottleError::Source(PressureSourceError {
            source_name: ThrottlerName::OperationLog,
            ..
        })
    ));
    assert!(metrics.is_empty());
}

#[tokio::test]
async fn timer_failure_fails_throttle() {
    let source = pressure(ThrottlerName::Batching);
    source.set_delay_millis(20);
    let metrics = Arc::new(RecordingMetricsSink::new());
    let timer = ManualTimer::auto_complete();
    let t = throttler(&source, &timer, &metrics);

    timer.fail_next_schedule("scheduled executor is shut down");
    let err = within(SHORT_TIMEOUT, t.throttle())
        .await
        .expect_err("scheduling fault must propagate");
    assert_eq!(err.code(), "throttle.scheduling");
    assert!(metrics.is_empty(), "未能调度的周期不计入指标");

    // 故障不会让节流器失效，下一次调用照常工作。
    within(SHORT_TIMEOUT, t.throttle()).await.expect("throttle");
    assert_eq!(metrics.delays(), vec![20]);
}

#[tokio::test(start_paused = true)]
async fn tokio_timer_honours_requested_delay() {
    // `RUST_LOG=segstore_throttle=trace` 可查看周期事件。
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let source = pressure(ThrottlerName::Cache);
    source.set_delay_millis(300);
    let dyn_source: Arc<dyn PressureSource> = source.clone();
    let calculator = ThrottlingCalculator::new([dyn_source]).expect("single source");
    let timer = TokioTimer::current().expect("inside runtime");
    let t = Throttler::new(
        CONTAINER_ID,
        calculator,
        Arc::new(timer),
        Arc::new(TracingMetricsSink::new(CONTAINER_ID)),
    );

    let started = tokio::time::Instant::now();
    t.throttle().await.expect("throttle");
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[test]
fn shut_down_runtime_fails_throttle_with_scheduling_error() {
    let bound = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("bound runtime");
    let timer = TokioTimer::new(bound.handle().clone());
    drop(bound);

    let source = pressure(ThrottlerName::Cache);
    source.set_delay_millis(100);
    let dyn_source: Arc<dyn PressureSource> = source.clone();
    let calculator = ThrottlingCalculator::new([dyn_source]).expect("single source");
    let t = Throttler::new(
        CONTAINER_ID,
        calculator,
        Arc::new(timer),
        Arc::new(TracingMetricsSink::new(CONTAINER_ID)),
    );

    let caller = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("caller runtime");
    let err = caller
        .block_on(t.throttle())
        .expect_err("调度设施失效必须以错误结束而不是 panic");
    assert!(matches!(err, ThrottleError::Scheduling(_)));
    assert_eq!(err.code(), "throttle.scheduling");
    assert!(!t.is_closed(), "调度失败不影响节流器本身");
}
