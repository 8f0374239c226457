// 教案级说明：延迟调度的注入点。
//
// - **意图 (Why)**：节流周期需要“N 毫秒后完成、可被提前放弃”的等待原语；把它抽象为 trait，
//   生产环境委托给共享 Tokio 运行时，测试环境换成可手动推进的实现。
// - **契约 (What)**：放弃一个等待只需 Drop 返回的 [`Delay`]；实现者不必保证底层定时任务被物理停止，
//   节流器依靠周期退役纪律在逻辑上忽略迟到的完成。登记之后调度设施才失效时，`Delay` 以 [`TimerError`] 完成。
// - **实现提示 (How)**：`ManualTimer` 的等待状态结构沿用虚拟时钟的 waker 登记方式：先检查完成位，
//   再登记 waker，最后复查一次完成位，避免完成与登记交错时丢失唤醒。
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::TimerError;

/// `Delay` 为定时器返回的统一等待 Future 类型。
///
/// # 契约说明（What）
/// - `Ok(())` 表示请求的时长已经过去；`Err` 表示调度设施在等待期间失效（例如运行时已关闭）；
/// - Drop 即放弃，放弃后不会再唤醒任何 waker；
/// - 必须满足 `Send + 'static`，以便在任意线程上等待。
pub type Delay = Pin<Box<dyn Future<Output = Result<(), TimerError>> + Send + 'static>>;

/// 可注入的延迟调度设施。
///
/// # 设计背景（Why）
/// - 节流器不直接触碰运行时，也不在自身内部阻塞；所有挂起都发生在 `Delay` 中；
/// - 共享执行器服务于众多容器，实现必须廉价且不得阻塞调用线程。
///
/// # 接口约束（What）
/// - `schedule_delay`：登记一次等待；调度设施不可用时返回 [`TimerError`]，由节流器作为 `throttle()` 的失败传播。
pub trait Timer: Send + Sync + 'static {
    /// 登记一个在 `duration` 之后完成的等待。
    fn schedule_delay(&self, duration: Duration) -> Result<Delay, TimerError>;
}

/// 基于 Tokio 运行时的生产定时器。
///
/// # 契约说明（What）
/// - 构造时绑定运行时句柄，之后可在任意线程（包括运行时之外）登记等待；
/// - 每次登记都在绑定的运行时上派生一个计时任务，到期后经 `oneshot` 通知等待方；
/// - 运行时未启用时间驱动、已关闭或在等待期间关闭时，计时任务随之终止，`Delay` 以 [`TimerError`] 完成而不是 panic；
/// - Drop `Delay` 会中止对应的计时任务。
#[derive(Clone, Debug)]
pub struct TokioTimer {
    handle: Handle,
}

impl TokioTimer {
    /// 绑定指定的运行时句柄。
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// 绑定当前上下文中的运行时；不在运行时内调用时返回错误。
    pub fn current() -> Result<Self, TimerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| TimerError::new(err.to_string()))
    }
}

impl Timer for TokioTimer {
    fn schedule_delay(&self, duration: Duration) -> Result<Delay, TimerError> {
        let (fired, receiver) = oneshot::channel();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = fired.send(());
        });
        Ok(Box::pin(TokioDelay { receiver, task }))
    }
}

/// 计时任务的等待端：发送端在任务被运行时丢弃时随之释放，接收端据此识别调度设施失效。
struct TokioDelay {
    receiver: oneshot::Receiver<()>,
    task: JoinHandle<()>,
}

impl Future for TokioDelay {
    type Output = Result<(), TimerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver).poll(cx).map(|outcome| {
            outcome.map_err(|_| {
                TimerError::new("tokio runtime dropped the delay task before it elapsed")
            })
        })
    }
}

impl Drop for TokioDelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 手动驱动的确定性定时器。
///
/// # 设计动机（Why）
/// - 节流周期的默认上限长达数十秒，测试不能真的等待；
/// - 测试需要断言“请求了哪些时长”“哪个等待被放弃”，并在指定时刻让等待自然到期。
///
/// # 行为概览（How）
/// - 每次 `schedule_delay` 都把请求时长追加到记录表；
/// - 普通模式下等待保持挂起，直到 `complete_last`/`complete_all` 显式完成；
/// - `auto_complete` 模式下返回已完成的等待，模拟“瞬间到期”；
/// - `fail_next_schedule` 让下一次登记失败，模拟共享执行器不可用。
///
/// # 契约说明（What）
/// - 被 Drop 的等待立即从挂起列表移除，`pending()` 只统计仍可能自然到期的等待；
/// - 克隆共享同一内部状态。
#[derive(Clone, Debug, Default)]
pub struct ManualTimer {
    inner: Arc<ManualTimerInner>,
}

impl ManualTimer {
    /// 创建需要手动完成的定时器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建每次登记都立即完成的定时器。
    pub fn auto_complete() -> Self {
        Self {
            inner: Arc::new(ManualTimerInner {
                auto_complete: true,
                state: Mutex::default(),
            }),
        }
    }

    /// 迄今为止请求过的全部时长，按登记顺序排列。
    pub fn requested(&self) -> Vec<Duration> {
        self.inner.state.lock().requested.clone()
    }

    /// 仍在挂起的等待数量。
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// 让最近登记且仍挂起的等待自然到期。没有挂起等待时返回 `false`。
    pub fn complete_last(&self) -> bool {
        let entry = self.inner.state.lock().pending.pop();
        match entry {
            Some(entry) => {
                entry.finish();
                true
            }
            None => false,
        }
    }

    /// 让所有挂起的等待自然到期，返回完成的数量。
    pub fn complete_all(&self) -> usize {
        let drained: Vec<_> = self.inner.state.lock().pending.drain(..).collect();
        let count = drained.len();
        for entry in drained {
            entry.finish();
        }
        count
    }

    /// 令下一次 `schedule_delay` 以给定原因失败。
    pub fn fail_next_schedule(&self, detail: impl Into<String>) {
        self.inner.state.lock().fail_next = Some(detail.into());
    }
}

impl Timer for ManualTimer {
    fn schedule_delay(&self, duration: Duration) -> Result<Delay, TimerError> {
        let mut guard = self.inner.state.lock();
        if let Some(detail) = guard.fail_next.take() {
            return Err(TimerError::new(detail));
        }
        guard.requested.push(duration);
        if self.inner.auto_complete {
            return Ok(Box::pin(future::ready(Ok(()))));
        }

        let id = guard.next_id;
        guard.next_id += 1;
        let state = Arc::new(DelayState::new(id));
        guard.pending.push(Arc::clone(&state));
        drop(guard);

        Ok(Box::pin(ManualDelay {
            inner: Arc::clone(&self.inner),
            state,
        }))
    }
}

#[derive(Debug, Default)]
struct ManualTimerInner {
    auto_complete: bool,
    state: Mutex<ManualTimerState>,
}

#[derive(Debug, Default)]
struct ManualTimerState {
    requested: Vec<Duration>,
    pending: Vec<Arc<DelayState>>,
    fail_next: Option<String>,
    next_id: u64,
}

#[derive(Debug)]
struct DelayState {
    id: u64,
    waker: Mutex<Option<Waker>>,
    completed: AtomicBool,
}

impl DelayState {
    fn new(id: u64) -> Self {
        Self {
            id,
            waker: Mutex::new(None),
            completed: AtomicBool::new(false),
        }
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.completed.store(true, Ordering::Release);
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn store_waker(&self, waker: &Waker) {
        let mut guard = self.waker.lock();
        if guard
            .as_ref()
            .is_some_and(|existing| existing.will_wake(waker))
        {
            return;
        }
        *guard = Some(waker.clone());
    }
}

struct ManualDelay {
    inner: Arc<ManualTimerInner>,
    state: Arc<DelayState>,
}

impl Future for ManualDelay {
    type Output = Result<(), TimerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.is_completed() {
            return Poll::Ready(Ok(()));
        }
        self.state.store_waker(cx.waker());
        if self.state.is_completed() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for ManualDelay {
    fn drop(&mut self) {
        if !self.state.is_completed() {
            self.state.waker.lock().take();
            let id = self.state.id;
            self.inner.state.lock().pending.retain(|entry| entry.id != id);
        }
    }
}
