//! 描述符定义
//!
//! [`Descriptor`] 是调用方构造、尚未绑定的记录；提交后注册表为它分配 ID，
//! 生成由注册表持有的 [`ActiveDescriptor`]。

use crate::component::ServiceCreator;
use crate::lifecycle::ScopeKind;
use crate::metadata::Metadata;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// 描述符 ID，提交时由注册表按顺序分配
pub type DescriptorId = u64;

/// 描述符类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum DescriptorKind {
    /// 直接构造实现类型
    #[default]
    Class,
    /// 通过工厂产生实例
    Factory,
}

/// 描述符可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Visibility {
    /// 对所有查找可见
    #[default]
    Normal,
    /// 仅在所属注册表内可见
    Local,
}

/// 描述符记录
///
/// 克隆会保留身份标识；同一身份在一个注册表中只能绑定一次
#[derive(Clone)]
pub struct Descriptor {
    identity: Uuid,
    /// 实现名称
    pub implementation: String,
    /// 声明的契约，默认包含实现名称
    pub contracts: BTreeSet<String>,
    /// 限定符
    pub qualifiers: BTreeSet<String>,
    /// 服务名称
    pub name: Option<String>,
    /// 作用域
    pub scope: ScopeKind,
    /// 初始排名，数值越高越优先
    pub rank: i32,
    /// 元数据
    pub metadata: Metadata,
    /// 描述符类型
    pub kind: DescriptorKind,
    /// 可见性
    pub visibility: Visibility,
    /// 创建器；为空时按实现名称在注册表的实现目录中查找
    pub creator: Option<Arc<dyn ServiceCreator>>,
}

impl Descriptor {
    /// 创建新的描述符记录
    pub fn new(implementation: impl Into<String>) -> Self {
        let implementation = implementation.into();
        let mut contracts = BTreeSet::new();
        contracts.insert(implementation.clone());

        Self {
            identity: Uuid::new_v4(),
            implementation,
            contracts,
            qualifiers: BTreeSet::new(),
            name: None,
            scope: ScopeKind::default(),
            rank: 0,
            metadata: Metadata::new(),
            kind: DescriptorKind::default(),
            visibility: Visibility::default(),
            creator: None,
        }
    }

    /// 身份标识
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// 使用外部给定的身份标识（批量导入的记录）
    pub fn with_identity(mut self, identity: Uuid) -> Self {
        self.identity = identity;
        self
    }

    /// 添加契约
    pub fn to(mut self, contract: impl Into<String>) -> Self {
        self.contracts.insert(contract.into());
        self
    }

    /// 添加限定符
    pub fn qualified_by(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifiers.insert(qualifier.into());
        self
    }

    /// 设置服务名称
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 设置作用域
    pub fn in_scope(mut self, scope: ScopeKind) -> Self {
        self.scope = scope;
        self
    }

    /// 设置排名
    pub fn with_rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.add(key, value);
        self
    }

    /// 设置描述符类型
    pub fn with_kind(mut self, kind: DescriptorKind) -> Self {
        self.kind = kind;
        self
    }

    /// 设置可见性
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// 设置创建器
    pub fn with_creator(mut self, creator: Arc<dyn ServiceCreator>) -> Self {
        self.creator = Some(creator);
        self
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("identity", &self.identity)
            .field("implementation", &self.implementation)
            .field("contracts", &self.contracts)
            .field("qualifiers", &self.qualifiers)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("rank", &self.rank)
            .field("metadata", &self.metadata)
            .field("kind", &self.kind)
            .field("visibility", &self.visibility)
            .field("creator", &self.creator.as_ref().map(|_| "<creator>"))
            .finish()
    }
}

/// 排名失效回调
///
/// 由持有描述符的注册表实现：在注册表锁内把描述符所在的有序桶降级为无序，
/// 然后执行 `apply` 写入新排名
pub trait RankInvalidator: Send + Sync {
    /// 降级描述符所在的全部桶并应用新排名
    fn invalidate(&self, descriptor: &ActiveDescriptor, apply: &mut dyn FnMut());
}

/// 注册表持有的描述符
pub struct ActiveDescriptor {
    id: DescriptorId,
    locator_id: u64,
    record: Descriptor,
    rank: AtomicI32,
    owner: OnceCell<Weak<dyn RankInvalidator>>,
}

impl ActiveDescriptor {
    /// 由注册表在提交时创建
    pub fn new(record: Descriptor, id: DescriptorId, locator_id: u64) -> Self {
        let rank = AtomicI32::new(record.rank);
        Self {
            id,
            locator_id,
            record,
            rank,
            owner: OnceCell::new(),
        }
    }

    /// 关联所属注册表，只能关联一次
    pub fn attach_owner(&self, owner: Weak<dyn RankInvalidator>) -> bool {
        self.owner.set(owner).is_ok()
    }

    /// 描述符 ID
    pub fn id(&self) -> DescriptorId {
        self.id
    }

    /// 所属注册表 ID
    pub fn locator_id(&self) -> u64 {
        self.locator_id
    }

    /// 身份标识
    pub fn identity(&self) -> Uuid {
        self.record.identity
    }

    /// 原始记录
    pub fn descriptor(&self) -> &Descriptor {
        &self.record
    }

    /// 实现名称
    pub fn implementation(&self) -> &str {
        &self.record.implementation
    }

    /// 契约
    pub fn contracts(&self) -> &BTreeSet<String> {
        &self.record.contracts
    }

    /// 限定符
    pub fn qualifiers(&self) -> &BTreeSet<String> {
        &self.record.qualifiers
    }

    /// 服务名称
    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    /// 作用域
    pub fn scope(&self) -> &ScopeKind {
        &self.record.scope
    }

    /// 元数据
    pub fn metadata(&self) -> &Metadata {
        &self.record.metadata
    }

    /// 描述符类型
    pub fn kind(&self) -> DescriptorKind {
        self.record.kind
    }

    /// 可见性
    pub fn visibility(&self) -> Visibility {
        self.record.visibility
    }

    /// 创建器
    pub fn creator(&self) -> Option<&Arc<dyn ServiceCreator>> {
        self.record.creator.as_ref()
    }

    /// 当前排名
    pub fn rank(&self) -> i32 {
        self.rank.load(Ordering::SeqCst)
    }

    /// 修改排名，返回旧值
    ///
    /// 已提交的描述符会先让所属注册表降级相关的有序桶，再写入新值
    pub fn set_rank(&self, rank: i32) -> i32 {
        let mut previous = 0;
        {
            let mut apply = || previous = self.rank.swap(rank, Ordering::SeqCst);
            match self.owner.get().and_then(|owner| owner.upgrade()) {
                Some(owner) => owner.invalidate(self, &mut apply),
                None => apply(),
            }
        }
        previous
    }
}

impl PartialEq for ActiveDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.locator_id == other.locator_id && self.id == other.id
    }
}

impl Eq for ActiveDescriptor {}

impl fmt::Debug for ActiveDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveDescriptor")
            .field("id", &self.id)
            .field("locator_id", &self.locator_id)
            .field("rank", &self.rank())
            .field("record", &self.record)
            .finish()
    }
}

impl fmt::Display for ActiveDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.record.implementation, self.id)
    }
}

/// 查找条件
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Lookup {
    /// 契约
    pub contract: String,
    /// 必须全部具备的限定符
    pub qualifiers: BTreeSet<String>,
    /// 服务名称
    pub name: Option<String>,
}

impl Lookup {
    /// 按契约查找
    pub fn contract(contract: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            qualifiers: BTreeSet::new(),
            name: None,
        }
    }

    /// 追加限定符
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifiers.insert(qualifier.into());
        self
    }

    /// 限定服务名称
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 描述符是否满足条件
    pub fn matches(&self, descriptor: &ActiveDescriptor) -> bool {
        descriptor.contracts().contains(&self.contract)
            && self.qualifiers.is_subset(descriptor.qualifiers())
            && self
                .name
                .as_deref()
                .map_or(true, |name| descriptor.name() == Some(name))
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.contract)?;
        if !self.qualifiers.is_empty() {
            let qualifiers: Vec<&str> = self.qualifiers.iter().map(String::as_str).collect();
            write!(f, "[{}]", qualifiers.join(","))?;
        }
        if let Some(name) = &self.name {
            write!(f, "@{name}")?;
        }
        Ok(())
    }
}
