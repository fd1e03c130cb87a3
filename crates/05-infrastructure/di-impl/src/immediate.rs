//! 即时作用域管理
//!
//! 即时作用域的描述符绑定后立即在后台创建实例，解绑后销毁。
//! 后台只有一个工作线程按先进先出顺序执行任务；队列清空后等待一段时间，
//! 仍然没有新任务就退出，下次有任务时再启动新线程。

use crate::error_service::LoggingImmediateErrorHandler;
use crate::locator::ServiceLocatorImpl;
use di_abstractions::{ChangeSet, ConfigurationListener, ImmediateErrorHandler, ServiceLocator};
use infrastructure_common::{
    ActiveDescriptor, BoxError, DependencyError, DependencyResult, DescriptorId, ImmediateConfig, ImmediateState,
    LifecycleFailure, LifecyclePhase,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 执行一次创建或销毁，panic 转为对应阶段的错误
fn run_guarded<F>(descriptor: &ActiveDescriptor, phase: LifecyclePhase, job: F) -> DependencyResult<()>
where
    F: FnOnce() -> DependencyResult<()>,
{
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
        let source: BoxError = format!("panic: {}", panic_message(payload.as_ref())).into();
        let descriptor_id = descriptor.id();
        let implementation = descriptor.implementation().to_string();
        Err(match phase {
            LifecyclePhase::Create => DependencyError::ConstructionFailed {
                descriptor_id,
                implementation,
                source,
            },
            LifecyclePhase::Destroy => DependencyError::DestructionFailed {
                descriptor_id,
                implementation,
                source,
            },
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知原因".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Create(DescriptorId),
    Destroy(DescriptorId),
}

struct Entry {
    descriptor: Arc<ActiveDescriptor>,
    state: ImmediateState,
    destroy_after_create: bool,
}

#[derive(Default)]
struct WorkQueue {
    jobs: VecDeque<Job>,
    entries: HashMap<DescriptorId, Entry>,
    worker_running: bool,
    worker_thread: Option<ThreadId>,
    busy: bool,
    shutting_down: bool,
}

impl WorkQueue {
    fn schedule_create(&mut self, descriptor: &Arc<ActiveDescriptor>) -> bool {
        let id = descriptor.id();
        if self
            .entries
            .get(&id)
            .is_some_and(|entry| !entry.state.is_terminal() && entry.state != ImmediateState::Unstarted)
        {
            return false;
        }
        self.entries.insert(
            id,
            Entry {
                descriptor: descriptor.clone(),
                state: ImmediateState::QueuedCreate,
                destroy_after_create: false,
            },
        );
        self.jobs.push_back(Job::Create(id));
        true
    }

    fn schedule_destroy(&mut self, descriptor: &Arc<ActiveDescriptor>) -> bool {
        let id = descriptor.id();
        let Some(entry) = self.entries.get_mut(&id) else {
            // 从未排队过，但可能已经被查找创建过实例
            self.entries.insert(
                id,
                Entry {
                    descriptor: descriptor.clone(),
                    state: ImmediateState::QueuedDestroy,
                    destroy_after_create: false,
                },
            );
            self.jobs.push_back(Job::Destroy(id));
            return true;
        };

        match entry.state {
            ImmediateState::Unstarted => {
                entry.state = ImmediateState::Destroyed;
                false
            }
            ImmediateState::QueuedCreate => {
                entry.state = ImmediateState::Destroyed;
                self.jobs.retain(|job| *job != Job::Create(id));
                debug!("取消排队中的即时服务创建: {}", descriptor);
                false
            }
            ImmediateState::Creating => {
                entry.destroy_after_create = true;
                false
            }
            ImmediateState::Active => {
                entry.state = ImmediateState::QueuedDestroy;
                self.jobs.push_back(Job::Destroy(id));
                true
            }
            ImmediateState::QueuedDestroy
            | ImmediateState::Destroying
            | ImmediateState::Destroyed
            | ImmediateState::Failed => false,
        }
    }
}

struct Shared {
    locator: Weak<ServiceLocatorImpl>,
    queue: Mutex<WorkQueue>,
    work_ready: Condvar,
    state_changed: Condvar,
    decay: Duration,
    worker_name_prefix: String,
    error_handler: RwLock<Arc<dyn ImmediateErrorHandler>>,
    workers_spawned: AtomicUsize,
}

impl Shared {
    /// 没有工作线程时启动一个，调用方持有队列锁
    fn ensure_worker(self: &Arc<Self>, queue: &mut WorkQueue) {
        if queue.worker_running || queue.jobs.is_empty() || queue.shutting_down {
            return;
        }

        let number = self.workers_spawned.load(Ordering::SeqCst) + 1;
        let shared = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.worker_name_prefix, number))
            .spawn(move || shared.run_worker());

        match spawned {
            Ok(handle) => {
                queue.worker_running = true;
                queue.worker_thread = Some(handle.thread().id());
                self.workers_spawned.fetch_add(1, Ordering::SeqCst);
                debug!("启动即时作用域工作线程 #{}", number);
            }
            Err(error) => error!("无法启动即时作用域工作线程: {}", error),
        }
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.shutting_down {
                        Self::retire(&mut queue);
                        self.state_changed.notify_all();
                        return;
                    }
                    if let Some(job) = queue.jobs.pop_front() {
                        queue.busy = true;
                        break job;
                    }
                    let timed_out = self.work_ready.wait_for(&mut queue, self.decay).timed_out();
                    if timed_out && queue.jobs.is_empty() {
                        debug!("即时作用域工作线程空闲 {:?}，退出", self.decay);
                        Self::retire(&mut queue);
                        self.state_changed.notify_all();
                        return;
                    }
                }
            };
            self.execute(job);
        }
    }

    fn retire(queue: &mut WorkQueue) {
        queue.worker_running = false;
        queue.worker_thread = None;
    }

    fn execute(&self, job: Job) {
        let (id, phase) = match job {
            Job::Create(id) => (id, LifecyclePhase::Create),
            Job::Destroy(id) => (id, LifecyclePhase::Destroy),
        };

        let descriptor = {
            let mut guard = self.queue.lock();
            let queue = &mut *guard;
            let expected = match phase {
                LifecyclePhase::Create => ImmediateState::QueuedCreate,
                LifecyclePhase::Destroy => ImmediateState::QueuedDestroy,
            };
            match queue.entries.get_mut(&id) {
                Some(entry) if entry.state == expected => {
                    entry.state = match phase {
                        LifecyclePhase::Create => ImmediateState::Creating,
                        LifecyclePhase::Destroy => ImmediateState::Destroying,
                    };
                    self.state_changed.notify_all();
                    entry.descriptor.clone()
                }
                _ => {
                    queue.busy = false;
                    self.state_changed.notify_all();
                    return;
                }
            }
        };

        let locator = self.locator.upgrade();
        let outcome = match &locator {
            Some(locator) => run_guarded(&descriptor, phase, || match phase {
                LifecyclePhase::Create => locator.get_or_create(&descriptor).map(|_| ()),
                LifecyclePhase::Destroy => locator.release_immediate(&descriptor),
            }),
            None => Err(DependencyError::Shutdown {
                locator: "<dropped>".to_string(),
            }),
        };

        let failure = {
            let mut guard = self.queue.lock();
            let queue = &mut *guard;
            queue.busy = false;
            let mut failure = None;
            if let Some(entry) = queue.entries.get_mut(&id) {
                match (phase, outcome) {
                    (LifecyclePhase::Create, Ok(())) if entry.destroy_after_create => {
                        entry.destroy_after_create = false;
                        entry.state = ImmediateState::QueuedDestroy;
                        queue.jobs.push_back(Job::Destroy(id));
                        debug!("即时服务创建完成但已解绑，排队销毁: {}", descriptor);
                    }
                    (LifecyclePhase::Create, Ok(())) => {
                        entry.state = ImmediateState::Active;
                        info!("即时服务已启动: {}", descriptor);
                    }
                    // 注册表关闭或描述符已解绑，没有需要报告的失败
                    (
                        LifecyclePhase::Create,
                        Err(cause @ (DependencyError::Shutdown { .. } | DependencyError::DescriptorNotBound { .. })),
                    ) => {
                        entry.destroy_after_create = false;
                        entry.state = ImmediateState::Destroyed;
                        debug!("跳过即时服务创建 {}: {}", descriptor, cause);
                    }
                    (LifecyclePhase::Create, Err(cause)) => {
                        entry.state = ImmediateState::Failed;
                        failure = Some(LifecycleFailure::new(descriptor.clone(), phase, cause));
                    }
                    (LifecyclePhase::Destroy, Ok(())) => {
                        entry.state = ImmediateState::Destroyed;
                        info!("即时服务已销毁: {}", descriptor);
                    }
                    (LifecyclePhase::Destroy, Err(cause)) => {
                        entry.state = ImmediateState::Destroyed;
                        failure = Some(LifecycleFailure::new(descriptor.clone(), phase, cause));
                    }
                }
            }
            self.state_changed.notify_all();
            failure
        };

        if let Some(failure) = failure {
            self.report(&failure);
        }
        // 可能是最后一个强引用，放在状态更新之后释放
        drop(locator);
    }

    fn report(&self, failure: &LifecycleFailure) {
        let handler = self.error_handler.read().clone();
        if panic::catch_unwind(AssertUnwindSafe(|| handler.on_lifecycle_failure(failure))).is_err() {
            error!("即时作用域错误处理器 panic: {}", failure);
        }
    }
}

/// 即时作用域管理器
pub struct ImmediateScopeManager {
    shared: Arc<Shared>,
}

impl ImmediateScopeManager {
    /// 创建管理器，没有指定错误处理器时只记录日志
    pub fn new(
        locator: Weak<ServiceLocatorImpl>,
        config: &ImmediateConfig,
        handler: Option<Arc<dyn ImmediateErrorHandler>>,
    ) -> Self {
        let handler = handler.unwrap_or_else(|| Arc::new(LoggingImmediateErrorHandler));
        Self {
            shared: Arc::new(Shared {
                locator,
                queue: Mutex::new(WorkQueue::default()),
                work_ready: Condvar::new(),
                state_changed: Condvar::new(),
                decay: Duration::from_millis(config.decay_timeout_ms),
                worker_name_prefix: config.worker_name_prefix.clone(),
                error_handler: RwLock::new(handler),
                workers_spawned: AtomicUsize::new(0),
            }),
        }
    }

    /// 替换错误处理器
    pub fn set_error_handler(&self, handler: Arc<dyn ImmediateErrorHandler>) {
        *self.shared.error_handler.write() = handler;
    }

    /// 为开启前已绑定的即时描述符排队创建
    pub fn schedule_existing(&self, descriptors: &[Arc<ActiveDescriptor>]) {
        let mut guard = self.shared.queue.lock();
        let queue = &mut *guard;
        if queue.shutting_down {
            return;
        }
        let scheduled = descriptors
            .iter()
            .filter(|descriptor| descriptor.scope().is_immediate())
            .filter(|descriptor| queue.schedule_create(descriptor))
            .count();
        if scheduled > 0 {
            self.shared.ensure_worker(queue);
            self.shared.work_ready.notify_one();
            self.shared.state_changed.notify_all();
        }
    }

    /// 描述符的当前状态，未跟踪的描述符为 `Unstarted`
    pub fn state_of(&self, id: DescriptorId) -> ImmediateState {
        self.shared
            .queue
            .lock()
            .entries
            .get(&id)
            .map_or(ImmediateState::Unstarted, |entry| entry.state)
    }

    /// 等待描述符进入指定状态，超时返回 `false`
    pub fn wait_for_state(&self, id: DescriptorId, state: ImmediateState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        loop {
            let current = queue
                .entries
                .get(&id)
                .map_or(ImmediateState::Unstarted, |entry| entry.state);
            if current == state {
                return true;
            }
            if self
                .shared
                .state_changed
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return queue.entries.get(&id).is_some_and(|entry| entry.state == state);
            }
        }
    }

    /// 工作线程是否在运行
    pub fn is_worker_running(&self) -> bool {
        self.shared.queue.lock().worker_running
    }

    /// 已启动过的工作线程数量
    pub fn workers_spawned(&self) -> usize {
        self.shared.workers_spawned.load(Ordering::SeqCst)
    }

    /// 等待中的任务数量
    pub fn pending_jobs(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// 不再接受新任务，丢弃排队中的任务
    pub fn stop_accepting(&self) {
        let mut queue = self.shared.queue.lock();
        queue.shutting_down = true;
        queue.jobs.clear();
        self.shared.work_ready.notify_all();
    }

    /// 停止工作线程，同步销毁全部运行中的即时实例
    pub fn shutdown(&self, locator: &ServiceLocatorImpl) {
        let to_destroy: Vec<Arc<ActiveDescriptor>> = {
            let mut guard = self.shared.queue.lock();
            guard.shutting_down = true;
            guard.jobs.clear();
            self.shared.work_ready.notify_all();

            // 等待进行中的任务结束；在工作线程上调用时不能等自己
            let on_worker = guard.worker_thread == Some(thread::current().id());
            while guard.busy && !on_worker {
                self.shared.state_changed.wait(&mut guard);
            }

            let queue = &mut *guard;
            queue
                .entries
                .values_mut()
                .filter_map(|entry| match entry.state {
                    ImmediateState::Active | ImmediateState::QueuedDestroy => {
                        entry.state = ImmediateState::Destroying;
                        Some(entry.descriptor.clone())
                    }
                    ImmediateState::QueuedCreate => {
                        entry.state = ImmediateState::Destroyed;
                        None
                    }
                    _ => None,
                })
                .collect()
        };

        info!("关闭即时作用域，销毁 {} 个即时服务", to_destroy.len());
        for descriptor in to_destroy {
            let outcome = run_guarded(&descriptor, LifecyclePhase::Destroy, || {
                locator.release_immediate(&descriptor)
            });
            {
                let mut queue = self.shared.queue.lock();
                if let Some(entry) = queue.entries.get_mut(&descriptor.id()) {
                    entry.state = ImmediateState::Destroyed;
                }
            }
            self.shared.state_changed.notify_all();
            if let Err(cause) = outcome {
                warn!("关闭时销毁即时服务失败: {}", cause);
                self.shared
                    .report(&LifecycleFailure::new(descriptor, LifecyclePhase::Destroy, cause));
            }
        }
    }
}

impl ConfigurationListener for ImmediateScopeManager {
    fn name(&self) -> &str {
        "immediate-scope-manager"
    }

    fn configuration_changed(&self, changes: &ChangeSet) {
        let mut guard = self.shared.queue.lock();
        let queue = &mut *guard;
        if queue.shutting_down {
            return;
        }

        let mut scheduled = 0;
        for descriptor in changes.added.iter().filter(|descriptor| descriptor.scope().is_immediate()) {
            if queue.schedule_create(descriptor) {
                scheduled += 1;
            }
        }
        for descriptor in changes.removed.iter().filter(|descriptor| descriptor.scope().is_immediate()) {
            if queue.schedule_destroy(descriptor) {
                scheduled += 1;
            }
        }

        if scheduled > 0 {
            debug!("提交 #{} 产生 {} 个即时作用域任务", changes.sequence, scheduled);
            self.shared.ensure_worker(queue);
            self.shared.work_ready.notify_one();
        }
        self.shared.state_changed.notify_all();
    }
}

impl std::fmt::Debug for ImmediateScopeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateScopeManager")
            .field("decay", &self.shared.decay)
            .field("workers_spawned", &self.workers_spawned())
            .finish()
    }
}
