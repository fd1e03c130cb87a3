//! 内置作用域上下文

use dashmap::DashMap;
use di_abstractions::ScopeContext;
use infrastructure_common::{
    ActiveDescriptor, DependencyError, DependencyResult, DescriptorId, Instance, ScopeKind,
};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// 每个描述符的创建单元
///
/// 值为 (创建序号, 实例)，序号用于关闭时倒序销毁。
/// 单元被移出缓存后 `evicted` 置位；实例只能被 `claim` 取走一次，取走的一方负责销毁。
struct CreationCell {
    descriptor: Arc<ActiveDescriptor>,
    value: OnceCell<(u64, Instance)>,
    evicted: AtomicBool,
    claimed: AtomicBool,
}

impl CreationCell {
    fn new(descriptor: &Arc<ActiveDescriptor>) -> Self {
        Self {
            descriptor: descriptor.clone(),
            value: OnceCell::new(),
            evicted: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        }
    }

    fn claim(&self) -> Option<Instance> {
        let (_, instance) = self.value.get()?;
        if self.claimed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(instance.clone())
    }
}

/// 单例作用域上下文
///
/// 也用作即时作用域的实例缓存。同一描述符的并发创建会阻塞在同一个创建单元上，
/// 不同描述符之间互不影响。
pub struct SingletonContext {
    scope: ScopeKind,
    cells: DashMap<DescriptorId, Arc<CreationCell>>,
    orphans: DashMap<DescriptorId, (Arc<ActiveDescriptor>, Instance)>,
    sequence: AtomicU64,
}

impl SingletonContext {
    /// 单例作用域
    pub fn new() -> Self {
        Self::for_scope(ScopeKind::Singleton)
    }

    /// 即时作用域
    pub fn immediate() -> Self {
        Self::for_scope(ScopeKind::Immediate)
    }

    fn for_scope(scope: ScopeKind) -> Self {
        Self {
            scope,
            cells: DashMap::new(),
            orphans: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// 取走创建期间被移出缓存的实例，由调用方销毁
    pub fn take_orphan(&self, id: DescriptorId) -> Option<(Arc<ActiveDescriptor>, Instance)> {
        self.orphans.remove(&id).map(|(_, orphan)| orphan)
    }
}

impl Default for SingletonContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeContext for SingletonContext {
    fn scope(&self) -> ScopeKind {
        self.scope.clone()
    }

    fn find_or_create(
        &self,
        descriptor: &Arc<ActiveDescriptor>,
        create: &mut dyn FnMut() -> DependencyResult<Instance>,
    ) -> DependencyResult<Instance> {
        // 先把单元取出来，避免在持有分片锁时构造
        let cell = self
            .cells
            .entry(descriptor.id())
            .or_insert_with(|| Arc::new(CreationCell::new(descriptor)))
            .clone();

        let (_, instance) = cell.value.get_or_try_init(|| {
            let instance = create()?;
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("{} 作用域创建实例: {}", self.scope, descriptor);
            Ok::<_, DependencyError>((sequence, instance))
        })?;

        // 创建期间单元已被移出，实例不再属于缓存
        if cell.evicted.load(Ordering::SeqCst) {
            if let Some(orphan) = cell.claim() {
                self.orphans.insert(descriptor.id(), (descriptor.clone(), orphan));
            }
            return Err(DependencyError::DescriptorNotBound {
                descriptor_id: descriptor.id(),
                implementation: descriptor.implementation().to_string(),
            });
        }
        Ok(instance.clone())
    }

    fn contains(&self, descriptor: &ActiveDescriptor) -> bool {
        self.cells
            .get(&descriptor.id())
            .is_some_and(|cell| cell.value.get().is_some())
    }

    fn destroy_one(&self, descriptor: &ActiveDescriptor) -> Option<Instance> {
        let (_, cell) = self.cells.remove(&descriptor.id())?;
        cell.evicted.store(true, Ordering::SeqCst);
        cell.claim()
    }

    fn drain(&self) -> Vec<(Arc<ActiveDescriptor>, Instance)> {
        let ids: Vec<DescriptorId> = self.cells.iter().map(|entry| *entry.key()).collect();
        let mut created: Vec<(u64, Arc<ActiveDescriptor>, Instance)> = ids
            .into_iter()
            .filter_map(|id| self.cells.remove(&id))
            .filter_map(|(_, cell)| {
                cell.evicted.store(true, Ordering::SeqCst);
                let instance = cell.claim()?;
                let sequence = cell.value.get().map_or(0, |(sequence, _)| *sequence);
                Some((sequence, cell.descriptor.clone(), instance))
            })
            .collect();
        created.sort_by(|left, right| right.0.cmp(&left.0));
        created
            .into_iter()
            .map(|(_, descriptor, instance)| (descriptor, instance))
            .collect()
    }

    fn len(&self) -> usize {
        self.cells
            .iter()
            .filter(|entry| entry.value().value.get().is_some())
            .count()
    }
}

/// 每次查找作用域上下文，从不缓存
#[derive(Debug, Default)]
pub struct PerLookupContext;

impl ScopeContext for PerLookupContext {
    fn scope(&self) -> ScopeKind {
        ScopeKind::PerLookup
    }

    fn find_or_create(
        &self,
        _descriptor: &Arc<ActiveDescriptor>,
        create: &mut dyn FnMut() -> DependencyResult<Instance>,
    ) -> DependencyResult<Instance> {
        create()
    }

    fn contains(&self, _descriptor: &ActiveDescriptor) -> bool {
        false
    }

    fn destroy_one(&self, _descriptor: &ActiveDescriptor) -> Option<Instance> {
        None
    }

    fn drain(&self) -> Vec<(Arc<ActiveDescriptor>, Instance)> {
        Vec::new()
    }

    fn len(&self) -> usize {
        0
    }
}
