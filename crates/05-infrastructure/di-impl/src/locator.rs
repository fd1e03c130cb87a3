//! 服务注册表实现
//!
//! 描述符索引和描述符表由一把注册表锁保护，查找也在锁内完成；
//! 构造在锁外进行，由各作用域上下文负责并发控制。

use crate::immediate::ImmediateScopeManager;
use crate::index::{DescriptorIndex, IndexKey};
use crate::interception;
use crate::scope::{PerLookupContext, SingletonContext};
use crate::transaction::{DynamicConfiguration, PendingOperation};
use async_trait::async_trait;
use dashmap::DashMap;
use di_abstractions::{
    ChangeSet, ConfigurationListener, ConstructorInterceptor, ConstructorRef, ErrorInformation,
    ErrorService, FailureAction, FailurePhase, ImmediateErrorHandler, InterceptionService,
    ResolveContext, ScopeContext, ServiceLocator, ServiceWatcher,
};
use infrastructure_common::{
    ActiveDescriptor, Arguments, DependencyError, DependencyResult, Descriptor, DescriptorId,
    ImmediateState, Instance, Lookup, RankInvalidator, RegistryConfig, ScopeKind, ServiceCreator,
};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

static NEXT_LOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// 注册表锁保护的状态
#[derive(Default)]
struct LocatorState {
    index: DescriptorIndex,
    descriptors: BTreeMap<DescriptorId, Arc<ActiveDescriptor>>,
    identities: HashMap<Uuid, DescriptorId>,
    next_service_id: DescriptorId,
    commit_sequence: u64,
}

/// 事务内已生效的操作，用于回滚
enum Applied {
    Added(Arc<ActiveDescriptor>),
    Removed(Arc<ActiveDescriptor>),
}

impl LocatorState {
    fn owns(&self, descriptor: &ActiveDescriptor) -> bool {
        self.descriptors
            .get(&descriptor.id())
            .is_some_and(|owned| std::ptr::eq(owned.as_ref(), descriptor))
    }

    fn insert_descriptor(&mut self, descriptor: &Arc<ActiveDescriptor>) -> DependencyResult<()> {
        self.index.insert_descriptor(descriptor)?;
        self.descriptors.insert(descriptor.id(), descriptor.clone());
        self.identities.insert(descriptor.identity(), descriptor.id());
        Ok(())
    }

    fn remove_descriptor(&mut self, descriptor: &Arc<ActiveDescriptor>) -> DependencyResult<()> {
        self.index.remove_descriptor(descriptor)?;
        self.descriptors.remove(&descriptor.id());
        self.identities.remove(&descriptor.identity());
        Ok(())
    }

    /// 倒序撤销本次事务已生效的操作
    fn rollback(&mut self, applied: Vec<Applied>, next_service_id: DescriptorId) {
        for operation in applied.into_iter().rev() {
            let result = match &operation {
                Applied::Added(descriptor) => self.remove_descriptor(descriptor),
                Applied::Removed(descriptor) => self.insert_descriptor(descriptor),
            };
            if let Err(undo_error) = result {
                error!("配置事务回滚失败: {}", undo_error);
            }
        }
        self.next_service_id = next_service_id;
    }
}

/// 发布顺序凭证
///
/// 持有期间独占发布通道；释放时把发布进度推进到本次提交的序号
struct PublishTicket<'a> {
    published: MutexGuard<'a, u64>,
    turn: &'a Condvar,
    sequence: u64,
}

impl Drop for PublishTicket<'_> {
    fn drop(&mut self) {
        *self.published = self.sequence;
        self.turn.notify_all();
    }
}

/// 服务注册表
pub struct ServiceLocatorImpl {
    name: String,
    locator_id: u64,
    config: RegistryConfig,
    self_ref: Weak<ServiceLocatorImpl>,
    state: Mutex<LocatorState>,
    published: Mutex<u64>,
    publish_turn: Condvar,
    implementations: DashMap<String, Arc<dyn ServiceCreator>>,
    singletons: SingletonContext,
    immediate_instances: SingletonContext,
    per_lookup: PerLookupContext,
    custom_scopes: DashMap<String, Arc<dyn ScopeContext>>,
    interception_services: RwLock<Vec<Arc<dyn InterceptionService>>>,
    error_services: RwLock<Vec<Arc<dyn ErrorService>>>,
    listeners: RwLock<Vec<Arc<dyn ConfigurationListener>>>,
    immediate: RwLock<Option<Arc<ImmediateScopeManager>>>,
    events: broadcast::Sender<Arc<ChangeSet>>,
    shutdown: AtomicBool,
}

impl ServiceLocatorImpl {
    /// 使用指定配置创建注册表
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let locator_id = NEXT_LOCATOR_ID.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(config.events.channel_capacity.max(1));
        info!("创建服务注册表: {} (id={})", config.name, locator_id);

        Arc::new_cyclic(|self_ref| Self {
            name: config.name.clone(),
            locator_id,
            config,
            self_ref: self_ref.clone(),
            state: Mutex::new(LocatorState::default()),
            published: Mutex::new(0),
            publish_turn: Condvar::new(),
            implementations: DashMap::new(),
            singletons: SingletonContext::new(),
            immediate_instances: SingletonContext::immediate(),
            per_lookup: PerLookupContext,
            custom_scopes: DashMap::new(),
            interception_services: RwLock::new(Vec::new()),
            error_services: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            immediate: RwLock::new(None),
            events,
            shutdown: AtomicBool::new(false),
        })
    }

    /// 使用默认配置和指定名称创建注册表
    pub fn named(name: impl Into<String>) -> Arc<Self> {
        Self::new(RegistryConfig {
            name: name.into(),
            ..RegistryConfig::default()
        })
    }

    /// 注册表配置
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// 开启新的配置事务
    pub fn create_dynamic_configuration(self: &Arc<Self>) -> DynamicConfiguration {
        DynamicConfiguration::new(self.clone())
    }

    /// 一次提交绑定多个描述符，返回生效的描述符
    pub fn add_descriptors<I>(self: &Arc<Self>, records: I) -> DependencyResult<Vec<Arc<ActiveDescriptor>>>
    where
        I: IntoIterator<Item = Descriptor>,
    {
        let mut configuration = self.create_dynamic_configuration();
        configuration.bind_all(records);
        Ok(configuration.commit()?.added.clone())
    }

    /// 解绑单个描述符
    pub fn remove_descriptor(self: &Arc<Self>, descriptor: &ActiveDescriptor) -> DependencyResult<()> {
        let mut configuration = self.create_dynamic_configuration();
        configuration.unbind_descriptor(descriptor)?;
        configuration.commit().map(|_| ())
    }

    /// 按实现名称登记创建器，供没有自带创建器的描述符使用
    pub fn register_implementation(&self, implementation: impl Into<String>, creator: Arc<dyn ServiceCreator>) {
        let implementation = implementation.into();
        debug!("登记实现: {}", implementation);
        self.implementations.insert(implementation, creator);
    }

    /// 注册自定义作用域上下文，按作用域名称匹配
    pub fn register_scope_context(&self, context: Arc<dyn ScopeContext>) {
        let scope = context.scope();
        info!("注册作用域上下文: {}", scope);
        self.custom_scopes.insert(scope.name().to_string(), context);
    }

    /// 添加拦截服务
    pub fn add_interception_service(&self, service: Arc<dyn InterceptionService>) {
        self.interception_services.write().push(service);
    }

    /// 添加错误服务
    pub fn add_error_service(&self, service: Arc<dyn ErrorService>) {
        self.error_services.write().push(service);
    }

    /// 添加配置变更监听器
    pub fn add_configuration_listener(&self, listener: Arc<dyn ConfigurationListener>) {
        info!("添加配置监听器: {}", listener.name());
        self.listeners.write().push(listener);
    }

    /// 按名称移除配置变更监听器
    pub fn remove_configuration_listener(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.name() != name);
        before != listeners.len()
    }

    /// 订阅提交事件
    pub fn watch(&self) -> broadcast::Receiver<Arc<ChangeSet>> {
        self.events.subscribe()
    }

    /// 开启即时作用域
    ///
    /// 重复调用返回同一个管理器；已绑定的即时描述符会立即排队创建
    pub fn enable_immediate_scope(
        self: &Arc<Self>,
        handler: Option<Arc<dyn ImmediateErrorHandler>>,
    ) -> Arc<ImmediateScopeManager> {
        let manager = {
            let mut slot = self.immediate.write();
            if let Some(existing) = slot.as_ref() {
                if let Some(handler) = handler {
                    existing.set_error_handler(handler);
                }
                return existing.clone();
            }
            let manager = Arc::new(ImmediateScopeManager::new(
                Arc::downgrade(self),
                &self.config.immediate,
                handler,
            ));
            *slot = Some(manager.clone());
            manager
        };

        self.add_configuration_listener(manager.clone());
        let existing: Vec<Arc<ActiveDescriptor>> = self
            .state
            .lock()
            .descriptors
            .values()
            .filter(|descriptor| descriptor.scope().is_immediate())
            .cloned()
            .collect();
        manager.schedule_existing(&existing);
        info!("已开启即时作用域: {} (已有 {} 个即时描述符)", self.name, existing.len());
        manager
    }

    /// 即时作用域管理器
    pub fn immediate_scope_manager(&self) -> Option<Arc<ImmediateScopeManager>> {
        self.immediate.read().clone()
    }

    /// 已绑定的描述符数量
    pub fn descriptor_count(&self) -> usize {
        self.state.lock().descriptors.len()
    }

    /// 按 ID 获取描述符
    pub fn get_descriptor(&self, id: DescriptorId) -> Option<Arc<ActiveDescriptor>> {
        self.state.lock().descriptors.get(&id).cloned()
    }

    /// 应用事务中的全部操作
    ///
    /// 全部成功才生效；任何失败都会撤销本事务已生效的操作
    pub(crate) fn commit_operations(&self, operations: Vec<PendingOperation>) -> DependencyResult<Arc<ChangeSet>> {
        self.ensure_running()?;

        let changes = {
            let mut state = self.state.lock();
            let next_service_id = state.next_service_id;
            let mut applied = Vec::new();
            let mut added = Vec::new();
            let mut removed = Vec::new();

            for operation in operations {
                let result = match operation {
                    PendingOperation::Bind(record) => self.apply_bind(&mut state, record).map(|descriptor| {
                        applied.push(Applied::Added(descriptor.clone()));
                        added.push(descriptor);
                    }),
                    PendingOperation::Unbind(id) => self.apply_unbind(&mut state, id).map(|descriptor| {
                        if let Some(descriptor) = descriptor {
                            applied.push(Applied::Removed(descriptor.clone()));
                            removed.push(descriptor);
                        }
                    }),
                };

                if let Err(error) = result {
                    state.rollback(applied, next_service_id);
                    match &error {
                        DependencyError::IndexCorruption { .. } => error!("配置事务失败，已回滚: {}", error),
                        _ => warn!("配置事务失败，已回滚: {}", error),
                    }
                    return Err(error);
                }
            }

            state.commit_sequence += 1;
            Arc::new(ChangeSet::new(state.commit_sequence, added, removed))
        };

        info!(
            "注册表 {} 提交配置事务 #{}: 新增 {}, 移除 {}",
            self.name,
            changes.sequence,
            changes.added.len(),
            changes.removed.len()
        );

        self.publish(&changes);
        self.release_unbound(&changes.removed);
        Ok(changes)
    }

    fn apply_bind(&self, state: &mut LocatorState, record: Descriptor) -> DependencyResult<Arc<ActiveDescriptor>> {
        if state.identities.contains_key(&record.identity()) {
            return Err(DependencyError::MultiBindingConflict {
                identity: record.identity(),
                implementation: record.implementation,
            });
        }

        let id = state.next_service_id;
        state.next_service_id += 1;
        let descriptor = Arc::new(ActiveDescriptor::new(record, id, self.locator_id));
        state.insert_descriptor(&descriptor)?;

        let owner: Weak<dyn RankInvalidator> = self.self_ref.clone();
        descriptor.attach_owner(owner);
        debug!("绑定描述符: {}", descriptor);
        Ok(descriptor)
    }

    fn apply_unbind(&self, state: &mut LocatorState, id: DescriptorId) -> DependencyResult<Option<Arc<ActiveDescriptor>>> {
        let Some(descriptor) = state.descriptors.get(&id).cloned() else {
            warn!("解绑未知描述符 {}，已忽略", id);
            return Ok(None);
        };
        state.remove_descriptor(&descriptor)?;
        debug!("解绑描述符: {}", descriptor);
        Ok(Some(descriptor))
    }

    /// 按提交顺序通知监听器和订阅者
    fn publish(&self, changes: &Arc<ChangeSet>) {
        let mut published = self.published.lock();
        while *published + 1 < changes.sequence {
            self.publish_turn.wait(&mut published);
        }
        let _ticket = PublishTicket {
            published,
            turn: &self.publish_turn,
            sequence: changes.sequence,
        };

        if changes.is_empty() {
            return;
        }

        let listeners: Vec<Arc<dyn ConfigurationListener>> = self.listeners.read().clone();
        for listener in listeners.iter().filter(|listener| listener.is_enabled()) {
            debug!("通知配置监听器 {}: 提交 #{}", listener.name(), changes.sequence);
            listener.configuration_changed(changes);
        }
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(changes.clone());
    }

    /// 销毁已解绑描述符的缓存实例
    fn release_unbound(&self, removed: &[Arc<ActiveDescriptor>]) {
        let immediate_enabled = self.immediate.read().is_some();
        for descriptor in removed {
            let instance = match descriptor.scope() {
                ScopeKind::Singleton => self.singletons.destroy_one(descriptor),
                ScopeKind::Immediate if !immediate_enabled => self.immediate_instances.destroy_one(descriptor),
                ScopeKind::Custom(name) => self
                    .custom_scopes
                    .get(name)
                    .and_then(|context| context.destroy_one(descriptor)),
                ScopeKind::Immediate | ScopeKind::PerLookup => None,
            };
            if let Some(instance) = instance {
                self.dispose(descriptor, &instance);
            }
        }
    }

    /// 释放即时作用域实例，没有缓存实例时什么也不做
    pub(crate) fn release_immediate(&self, descriptor: &ActiveDescriptor) -> DependencyResult<()> {
        match self.immediate_instances.destroy_one(descriptor) {
            Some(instance) => self.destroy_instance(descriptor, &instance),
            None => Ok(()),
        }
    }

    /// 用描述符的创建器销毁实例
    pub fn destroy_instance(&self, descriptor: &ActiveDescriptor, instance: &Instance) -> DependencyResult<()> {
        let creator = self.creator_for(descriptor)?;
        creator
            .destroy(instance)
            .map_err(|source| DependencyError::DestructionFailed {
                descriptor_id: descriptor.id(),
                implementation: descriptor.implementation().to_string(),
                source,
            })?;
        debug!("已销毁实例: {}", descriptor);
        Ok(())
    }

    /// 销毁实例，失败交给错误服务
    fn dispose(&self, descriptor: &Arc<ActiveDescriptor>, instance: &Instance) {
        if let Err(error) = self.destroy_instance(descriptor, instance) {
            if let Err(error) = self.handle_failure(FailurePhase::Destroy, Some(descriptor), error) {
                error!("销毁实例失败: {}", error);
            }
        }
    }

    fn ensure_running(&self) -> DependencyResult<()> {
        if self.is_shutdown() {
            return Err(DependencyError::Shutdown {
                locator: self.name.clone(),
            });
        }
        Ok(())
    }

    /// 查找使用的桶：第一个限定符对应的桶，不存在时退回只按契约的桶
    ///
    /// 退回的桶仍按全部限定符过滤，结果与空桶相同
    fn bucket_for(&self, state: &LocatorState, lookup: &Lookup) -> IndexKey {
        if let Some(qualifier) = lookup.qualifiers.iter().next() {
            let key = IndexKey::qualified(lookup.contract.clone(), qualifier.clone());
            if state.index.contains_key(&key) {
                return key;
            }
        }
        IndexKey::contract(lookup.contract.clone())
    }

    fn find_descriptors(&self, lookup: &Lookup) -> Vec<Arc<ActiveDescriptor>> {
        let mut state = self.state.lock();
        let key = self.bucket_for(&state, lookup);
        state
            .index
            .ordered(&key)
            .into_iter()
            .filter(|descriptor| lookup.matches(descriptor))
            .collect()
    }

    fn creator_for(&self, descriptor: &ActiveDescriptor) -> DependencyResult<Arc<dyn ServiceCreator>> {
        if let Some(creator) = descriptor.creator() {
            return Ok(creator.clone());
        }
        self.implementations
            .get(descriptor.implementation())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DependencyError::ImplementationNotFound {
                implementation: descriptor.implementation().to_string(),
            })
    }

    fn interceptors_for(&self, descriptor: &ActiveDescriptor) -> Vec<Arc<dyn ConstructorInterceptor>> {
        let services: Vec<Arc<dyn InterceptionService>> = self.interception_services.read().clone();
        services
            .iter()
            .filter(|service| service.matches(descriptor))
            .flat_map(|service| service.constructor_interceptors(descriptor))
            .collect()
    }

    /// 在解析链中获取或创建实例
    fn get_or_create_in(
        &self,
        descriptor: &Arc<ActiveDescriptor>,
        context: &mut ResolveContext,
    ) -> DependencyResult<Instance> {
        if !self.is_bound(descriptor) {
            return Err(Self::not_bound(descriptor));
        }
        // 在进入创建单元之前检测循环，避免在同一个单元上自我等待
        context.push(descriptor.id(), descriptor.implementation())?;
        let result = {
            let mut create = || self.create_instance(descriptor, context);
            match descriptor.scope() {
                ScopeKind::Singleton => self.singletons.find_or_create(descriptor, &mut create),
                ScopeKind::Immediate => self.immediate_instances.find_or_create(descriptor, &mut create),
                ScopeKind::PerLookup => self.per_lookup.find_or_create(descriptor, &mut create),
                ScopeKind::Custom(name) => match self.custom_scopes.get(name).map(|entry| entry.value().clone()) {
                    Some(scope_context) => scope_context.find_or_create(descriptor, &mut create),
                    None => Err(DependencyError::ScopeNotFound { scope: name.clone() }),
                },
            }
        };
        context.pop();

        match result {
            // 创建期间被解绑：实例不再缓存，立即销毁
            Ok(instance) if !self.is_bound(descriptor) => {
                if self.reclaim_unbound(descriptor) {
                    return Err(Self::not_bound(descriptor));
                }
                Ok(instance)
            }
            Err(error @ DependencyError::DescriptorNotBound { .. }) => {
                self.dispose_orphan(descriptor);
                Err(error)
            }
            other => other,
        }
    }

    fn is_bound(&self, descriptor: &ActiveDescriptor) -> bool {
        self.state.lock().owns(descriptor)
    }

    fn not_bound(descriptor: &ActiveDescriptor) -> DependencyError {
        DependencyError::DescriptorNotBound {
            descriptor_id: descriptor.id(),
            implementation: descriptor.implementation().to_string(),
        }
    }

    /// 把已解绑描述符的缓存实例移出并销毁
    ///
    /// 返回 `false` 表示实例仍交给调用方：每次查找的实例不缓存，
    /// 正在由即时作用域工作线程创建的实例由管理器在创建完成后销毁
    fn reclaim_unbound(&self, descriptor: &Arc<ActiveDescriptor>) -> bool {
        let instance = match descriptor.scope() {
            ScopeKind::Singleton => self.singletons.destroy_one(descriptor),
            ScopeKind::Immediate => {
                let managed = self
                    .immediate
                    .read()
                    .as_ref()
                    .is_some_and(|manager| manager.state_of(descriptor.id()) == ImmediateState::Creating);
                if managed {
                    return false;
                }
                self.immediate_instances.destroy_one(descriptor)
            }
            ScopeKind::Custom(name) => self
                .custom_scopes
                .get(name)
                .map(|entry| entry.value().clone())
                .and_then(|scope_context| scope_context.destroy_one(descriptor)),
            ScopeKind::PerLookup => return false,
        };
        debug!("描述符 {} 在创建期间被解绑，回收实例", descriptor);
        if let Some(instance) = instance {
            self.dispose(descriptor, &instance);
        }
        true
    }

    /// 销毁创建单元被移出后才完成的实例
    fn dispose_orphan(&self, descriptor: &ActiveDescriptor) {
        let scope_context = match descriptor.scope() {
            ScopeKind::Singleton => &self.singletons,
            ScopeKind::Immediate => &self.immediate_instances,
            ScopeKind::PerLookup | ScopeKind::Custom(_) => return,
        };
        if let Some((descriptor, instance)) = scope_context.take_orphan(descriptor.id()) {
            self.dispose(&descriptor, &instance);
        }
    }

    fn create_instance(&self, descriptor: &Arc<ActiveDescriptor>, context: &mut ResolveContext) -> DependencyResult<Instance> {
        let creator = self.creator_for(descriptor)?;

        let mut args: Vec<Option<Instance>> = Vec::new();
        for dependency in creator.dependencies() {
            let argument = match self.find_descriptors(&dependency.lookup).into_iter().next() {
                Some(target) => Some(self.get_or_create_in(&target, context)?),
                None if dependency.optional => None,
                None => return Err(DependencyError::unsatisfied(&dependency.lookup)),
            };
            args.push(argument);
        }

        let interceptors = self.interceptors_for(descriptor);
        let constructor = ConstructorRef::of(descriptor);
        let mut terminal = |args: &Arguments| creator.create(args);

        interception::construct(&constructor, &args, &interceptors, &mut terminal).map_err(|source| {
            DependencyError::ConstructionFailed {
                descriptor_id: descriptor.id(),
                implementation: descriptor.implementation().to_string(),
                source,
            }
        })
    }

    /// 把失败交给错误服务
    ///
    /// 任一错误服务要求重新抛出，或处于严格模式时返回错误；否则记录并吞掉
    fn handle_failure(
        &self,
        phase: FailurePhase,
        descriptor: Option<&Arc<ActiveDescriptor>>,
        cause: DependencyError,
    ) -> DependencyResult<()> {
        let services: Vec<Arc<dyn ErrorService>> = self.error_services.read().clone();
        let info = ErrorInformation {
            phase,
            descriptor,
            cause: &cause,
        };

        let mut rethrow = false;
        for service in &services {
            if service.on_failure(&info) == FailureAction::Rethrow {
                rethrow = true;
            }
        }

        if rethrow || self.config.strict_mode {
            return Err(cause);
        }
        if services.is_empty() {
            warn!("{} 失败，已忽略: {}", phase, cause);
        }
        Ok(())
    }
}

impl ServiceLocator for ServiceLocatorImpl {
    fn name(&self) -> &str {
        &self.name
    }

    fn locator_id(&self) -> u64 {
        self.locator_id
    }

    fn get_best_descriptor(&self, lookup: &Lookup) -> DependencyResult<Option<Arc<ActiveDescriptor>>> {
        Ok(self.find_descriptors(lookup).into_iter().next())
    }

    fn get_all_descriptors(&self, lookup: &Lookup) -> DependencyResult<Vec<Arc<ActiveDescriptor>>> {
        Ok(self.find_descriptors(lookup))
    }

    fn get_or_create(&self, descriptor: &Arc<ActiveDescriptor>) -> DependencyResult<Instance> {
        self.ensure_running()?;
        if descriptor.locator_id() != self.locator_id {
            return Err(DependencyError::ForeignDescriptor {
                descriptor_id: descriptor.id(),
                locator_id: self.locator_id,
            });
        }
        self.get_or_create_in(descriptor, &mut ResolveContext::new())
    }

    fn get_service(&self, lookup: &Lookup) -> DependencyResult<Option<Instance>> {
        let Some(descriptor) = self.get_best_descriptor(lookup)? else {
            if self.config.strict_mode {
                return Err(DependencyError::unsatisfied(lookup));
            }
            debug!("没有匹配的服务: {}", lookup);
            return Ok(None);
        };

        match self.get_or_create(&descriptor) {
            Ok(instance) => Ok(Some(instance)),
            Err(error) => self
                .handle_failure(FailurePhase::Create, Some(&descriptor), error)
                .map(|()| None),
        }
    }

    fn get_all_services(&self, lookup: &Lookup) -> DependencyResult<Vec<Instance>> {
        let mut instances = Vec::new();
        for descriptor in self.get_all_descriptors(lookup)? {
            match self.get_or_create(&descriptor) {
                Ok(instance) => instances.push(instance),
                Err(error) => self.handle_failure(FailurePhase::Create, Some(&descriptor), error)?,
            }
        }
        Ok(instances)
    }

    fn shutdown(&self) {
        // 先让即时作用域停止取任务，再拒绝新的创建
        let manager = self.immediate.read().clone();
        if let Some(manager) = manager {
            manager.stop_accepting();
        }
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("关闭服务注册表: {}", self.name);

        let manager = self.immediate.write().take();
        if let Some(manager) = manager {
            manager.shutdown(self);
        }

        for (descriptor, instance) in self.singletons.drain() {
            self.dispose(&descriptor, &instance);
        }
        for (descriptor, instance) in self.immediate_instances.drain() {
            self.dispose(&descriptor, &instance);
        }
        let custom_scopes: Vec<Arc<dyn ScopeContext>> = self
            .custom_scopes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for scope_context in custom_scopes {
            for (descriptor, instance) in scope_context.drain() {
                self.dispose(&descriptor, &instance);
            }
        }

        let mut state = self.state.lock();
        state.index.clear();
        state.descriptors.clear();
        state.identities.clear();
        drop(state);

        self.listeners.write().clear();
        info!("服务注册表已关闭: {}", self.name);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl RankInvalidator for ServiceLocatorImpl {
    fn invalidate(&self, descriptor: &ActiveDescriptor, apply: &mut dyn FnMut()) {
        let mut state = self.state.lock();
        if state.owns(descriptor) {
            state.index.invalidate_descriptor(descriptor);
        }
        apply();
        debug!("描述符 {} 排名变更为 {}", descriptor, descriptor.rank());
    }
}

#[async_trait]
impl ServiceWatcher for ServiceLocatorImpl {
    async fn wait_for_descriptor(
        &self,
        lookup: &Lookup,
        timeout: Duration,
    ) -> DependencyResult<Option<Arc<ActiveDescriptor>>> {
        // 先订阅再查询，避免漏掉两者之间的提交
        let mut receiver = self.events.subscribe();
        if let Some(descriptor) = self.get_best_descriptor(lookup)? {
            return Ok(Some(descriptor));
        }

        let waited = tokio::time::timeout(timeout, async {
            loop {
                match receiver.recv().await {
                    Ok(changes) => {
                        if changes.added.iter().any(|descriptor| lookup.matches(descriptor)) {
                            if let Some(descriptor) = self.find_descriptors(lookup).into_iter().next() {
                                return Some(descriptor);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("事件订阅落后 {} 条，重新查询", skipped);
                        if let Some(descriptor) = self.find_descriptors(lookup).into_iter().next() {
                            return Some(descriptor);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        Ok(waited.unwrap_or(None))
    }
}

impl Drop for ServiceLocatorImpl {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ServiceLocatorImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLocatorImpl")
            .field("name", &self.name)
            .field("locator_id", &self.locator_id)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use di_abstractions::{creator_fn, FnCreator, ServiceLocatorExt};
    use infrastructure_common::{BoxError, Dependency};
    use std::sync::atomic::AtomicUsize;

    struct Greeter {
        greeting: String,
    }

    fn greeter(greeting: &'static str) -> Descriptor {
        Descriptor::new(format!("Greeter-{greeting}"))
            .to("Greeter")
            .with_creator(creator_fn(move || Greeter {
                greeting: greeting.to_string(),
            }))
    }

    fn failing(message: &'static str) -> Arc<dyn ServiceCreator> {
        FnCreator::new(move |_| Err::<Instance, BoxError>(message.into())).into_creator()
    }

    #[test]
    fn test_best_descriptor_follows_rank() {
        let locator = ServiceLocatorImpl::named("test");
        let added = locator
            .add_descriptors(vec![greeter("hello"), greeter("hi").with_rank(5), greeter("hey")])
            .unwrap();
        assert_eq!(added.iter().map(|d| d.id()).collect::<Vec<_>>(), vec![0, 1, 2]);

        let best = locator.get_best_descriptor(&Lookup::contract("Greeter")).unwrap().unwrap();
        assert_eq!(best.implementation(), "Greeter-hi");

        let all: Vec<String> = locator
            .get_all_descriptors(&Lookup::contract("Greeter"))
            .unwrap()
            .iter()
            .map(|d| d.implementation().to_string())
            .collect();
        assert_eq!(all, vec!["Greeter-hi", "Greeter-hello", "Greeter-hey"]);
    }

    #[test]
    fn test_set_rank_reorders_after_lookup() {
        let locator = ServiceLocatorImpl::named("test");
        let added = locator.add_descriptors(vec![greeter("a"), greeter("b")]).unwrap();
        let lookup = Lookup::contract("Greeter");
        assert_eq!(locator.get_best_descriptor(&lookup).unwrap().unwrap().id(), added[0].id());

        assert_eq!(added[1].set_rank(10), 0);
        assert_eq!(locator.get_best_descriptor(&lookup).unwrap().unwrap().id(), added[1].id());

        // 排名变更后仍然可以正常解绑
        locator.remove_descriptor(&added[1]).unwrap();
        assert_eq!(locator.get_best_descriptor(&lookup).unwrap().unwrap().id(), added[0].id());
    }

    #[test]
    fn test_qualified_lookup_filters_by_qualifier_and_name() {
        let locator = ServiceLocatorImpl::named("test");
        locator
            .add_descriptors(vec![
                greeter("plain"),
                greeter("formal").qualified_by("formal").named("sir"),
            ])
            .unwrap();

        let formal = locator
            .get_best_descriptor(&Lookup::contract("Greeter").with_qualifier("formal"))
            .unwrap()
            .unwrap();
        assert_eq!(formal.implementation(), "Greeter-formal");

        assert!(locator
            .get_best_descriptor(&Lookup::contract("Greeter").with_qualifier("casual"))
            .unwrap()
            .is_none());
        assert!(locator
            .get_best_descriptor(&Lookup::contract("Greeter").named("sir"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_singleton_instance_is_cached_and_destroyed_on_unbind() {
        let locator = ServiceLocatorImpl::named("test");
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let (created_counter, destroyed_counter) = (created.clone(), destroyed.clone());
        let creator = FnCreator::new(move |_| {
            created_counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Greeter {
                greeting: "once".to_string(),
            }) as Instance)
        })
        .on_destroy(move |_| {
            destroyed_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let added = locator
            .add_descriptors(vec![Descriptor::new("OnceGreeter")
                .to("Greeter")
                .in_scope(ScopeKind::Singleton)
                .with_creator(creator.into_creator())])
            .unwrap();

        let lookup = Lookup::contract("Greeter");
        let first = locator.get_service_as::<Greeter>(&lookup).unwrap().unwrap();
        let second = locator.get_service_as::<Greeter>(&lookup).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.greeting, "once");
        assert_eq!(created.load(Ordering::SeqCst), 1);

        locator.remove_descriptor(&added[0]).unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(locator.get_service(&lookup).unwrap().is_none());
    }

    fn counted_singleton(
        name: &str,
        created: &Arc<AtomicUsize>,
        destroyed: &Arc<AtomicUsize>,
    ) -> Descriptor {
        let (created, destroyed) = (created.clone(), destroyed.clone());
        let creator = FnCreator::new(move |_| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(()) as Instance)
        })
        .on_destroy(move |_| {
            destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Descriptor::new(name)
            .in_scope(ScopeKind::Singleton)
            .with_creator(creator.into_creator())
    }

    #[test]
    fn test_unbound_descriptor_is_not_recreated() {
        let locator = ServiceLocatorImpl::named("test");
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let added = locator
            .add_descriptors(vec![counted_singleton("Cache", &created, &destroyed)])
            .unwrap();

        locator.get_or_create(&added[0]).unwrap();
        locator.remove_descriptor(&added[0]).unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        let error = locator.get_or_create(&added[0]).unwrap_err();
        assert!(matches!(error, DependencyError::DescriptorNotBound { .. }));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(locator.singletons.len(), 0);
    }

    #[test]
    fn test_unbind_during_construction_destroys_new_instance() {
        let locator = ServiceLocatorImpl::named("test");
        let destroyed = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let started_tx = parking_lot::Mutex::new(started_tx);
        let release_rx = parking_lot::Mutex::new(release_rx);
        let counter = destroyed.clone();
        let creator = FnCreator::new(move |_| {
            started_tx.lock().send(()).ok();
            release_rx.lock().recv_timeout(Duration::from_secs(5)).ok();
            Ok(Arc::new(()) as Instance)
        })
        .on_destroy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let added = locator
            .add_descriptors(vec![Descriptor::new("Slow")
                .in_scope(ScopeKind::Singleton)
                .with_creator(creator.into_creator())])
            .unwrap();

        let resolver = locator.clone();
        let descriptor = added[0].clone();
        let handle = std::thread::spawn(move || resolver.get_or_create(&descriptor));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        locator.remove_descriptor(&added[0]).unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        release_tx.send(()).unwrap();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(DependencyError::DescriptorNotBound { .. })));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(locator.singletons.len(), 0);
    }

    /// 统计收到的变更
    struct CountingListener(AtomicUsize);

    impl ConfigurationListener for CountingListener {
        fn name(&self) -> &str {
            "counting"
        }

        fn configuration_changed(&self, _changes: &ChangeSet) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_removed_listener_is_not_notified() {
        let locator = ServiceLocatorImpl::named("test");
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        locator.add_configuration_listener(listener.clone());

        locator.add_descriptors(vec![greeter("one")]).unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        assert!(locator.remove_configuration_listener("counting"));
        assert!(!locator.remove_configuration_listener("counting"));
        locator.add_descriptors(vec![greeter("two")]).unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_per_lookup_creates_every_time() {
        let locator = ServiceLocatorImpl::named("test");
        locator.add_descriptors(vec![greeter("fresh")]).unwrap();
        let lookup = Lookup::contract("Greeter");

        let first = locator.require_service::<Greeter>(&lookup).unwrap();
        let second = locator.require_service::<Greeter>(&lookup).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_dependencies_are_injected() {
        let locator = ServiceLocatorImpl::named("test");
        let consumer = FnCreator::new(|args| {
            let greeter = args[0]
                .as_ref()
                .and_then(|instance| instance.downcast_ref::<Greeter>())
                .map(|greeter| greeter.greeting.clone())
                .unwrap_or_default();
            let missing = args[1].is_none();
            Ok(Arc::new(format!("{greeter}:{missing}")) as Instance)
        })
        .with_dependency(Dependency::required(Lookup::contract("Greeter")))
        .with_dependency(Dependency::optional(Lookup::contract("Clock")));

        locator
            .add_descriptors(vec![
                greeter("hello"),
                Descriptor::new("Consumer").with_creator(consumer.into_creator()),
            ])
            .unwrap();

        let value = locator
            .require_service::<String>(&Lookup::contract("Consumer"))
            .unwrap();
        assert_eq!(value.as_str(), "hello:true");
    }

    #[test]
    fn test_missing_required_dependency_is_swallowed_in_lenient_mode() {
        let locator = ServiceLocatorImpl::named("test");
        let consumer = FnCreator::new(|_| Ok(Arc::new(()) as Instance))
            .with_dependency(Dependency::required(Lookup::contract("Missing")));
        locator
            .add_descriptors(vec![Descriptor::new("Consumer").with_creator(consumer.into_creator())])
            .unwrap();

        assert!(locator.get_service(&Lookup::contract("Consumer")).unwrap().is_none());
    }

    #[test]
    fn test_strict_mode_returns_errors() {
        let locator = ServiceLocatorImpl::new(RegistryConfig {
            name: "strict".to_string(),
            strict_mode: true,
            ..RegistryConfig::default()
        });
        locator
            .add_descriptors(vec![Descriptor::new("Broken").with_creator(failing("boom"))])
            .unwrap();

        let error = locator.get_service(&Lookup::contract("Broken")).unwrap_err();
        assert!(error.is_construction_failure());
        assert!(matches!(
            locator.get_service(&Lookup::contract("Nothing")),
            Err(DependencyError::UnsatisfiedDependency { .. })
        ));
    }

    #[test]
    fn test_circular_dependency_is_detected() {
        let locator = ServiceLocatorImpl::named("test");
        let a = FnCreator::new(|_| Ok(Arc::new(1_u8) as Instance))
            .with_dependency(Dependency::required(Lookup::contract("B")));
        let b = FnCreator::new(|_| Ok(Arc::new(2_u8) as Instance))
            .with_dependency(Dependency::required(Lookup::contract("A")));
        let added = locator
            .add_descriptors(vec![
                Descriptor::new("A")
                    .in_scope(ScopeKind::Singleton)
                    .with_creator(a.into_creator()),
                Descriptor::new("B")
                    .in_scope(ScopeKind::Singleton)
                    .with_creator(b.into_creator()),
            ])
            .unwrap();

        let error = locator.get_or_create(&added[0]).unwrap_err();
        assert!(matches!(error, DependencyError::CircularDependency { .. }));
    }

    #[test]
    fn test_implementation_catalog_is_used() {
        let locator = ServiceLocatorImpl::named("test");
        locator.register_implementation("CatalogService", creator_fn(|| 99_u32));
        locator
            .add_descriptors(vec![Descriptor::new("CatalogService")])
            .unwrap();

        let value = locator
            .require_service::<u32>(&Lookup::contract("CatalogService"))
            .unwrap();
        assert_eq!(*value, 99);
    }

    #[test]
    fn test_foreign_descriptor_is_rejected() {
        let first = ServiceLocatorImpl::named("first");
        let second = ServiceLocatorImpl::named("second");
        let added = first.add_descriptors(vec![greeter("x")]).unwrap();

        assert!(matches!(
            second.get_or_create(&added[0]),
            Err(DependencyError::ForeignDescriptor { .. })
        ));
        assert!(second.remove_descriptor(&added[0]).is_err());
    }

    #[test]
    fn test_shutdown_destroys_singletons_in_reverse_order() {
        let locator = ServiceLocatorImpl::named("test");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let make = |name: &'static str| {
            let order = order.clone();
            FnCreator::new(move |_| Ok(Arc::new(name) as Instance))
                .on_destroy(move |_| {
                    order.lock().push(name);
                    Ok(())
                })
                .into_creator()
        };

        locator
            .add_descriptors(vec![
                Descriptor::new("First").in_scope(ScopeKind::Singleton).with_creator(make("first")),
                Descriptor::new("Second").in_scope(ScopeKind::Singleton).with_creator(make("second")),
            ])
            .unwrap();
        locator.get_service(&Lookup::contract("First")).unwrap();
        locator.get_service(&Lookup::contract("Second")).unwrap();

        locator.shutdown();
        assert!(locator.is_shutdown());
        assert_eq!(*order.lock(), vec!["second", "first"]);
        assert_eq!(locator.descriptor_count(), 0);
        assert!(matches!(
            locator.add_descriptors(vec![greeter("late")]),
            Err(DependencyError::Shutdown { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_descriptor() {
        let locator = ServiceLocatorImpl::named("test");
        let lookup = Lookup::contract("Greeter");

        let missing = locator
            .wait_for_descriptor(&lookup, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(missing.is_none());

        let binder = locator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            binder.add_descriptors(vec![greeter("late")]).unwrap();
        });

        let found = locator
            .wait_for_descriptor(&lookup, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found.unwrap().implementation(), "Greeter-late");
    }
}
