//! 动态配置事务
//!
//! 绑定和解绑先暂存在事务中，提交前对查找不可见；提交要么全部生效，要么全部撤销。

use crate::locator::ServiceLocatorImpl;
use di_abstractions::{ChangeSet, ServiceLocator};
use infrastructure_common::{ActiveDescriptor, DependencyError, DependencyResult, Descriptor, DescriptorId};
use std::sync::Arc;
use uuid::Uuid;

/// 暂存的操作
#[derive(Debug)]
pub(crate) enum PendingOperation {
    Bind(Descriptor),
    Unbind(DescriptorId),
}

/// 动态配置事务
pub struct DynamicConfiguration {
    locator: Arc<ServiceLocatorImpl>,
    operations: Vec<PendingOperation>,
    committed: bool,
}

impl DynamicConfiguration {
    pub(crate) fn new(locator: Arc<ServiceLocatorImpl>) -> Self {
        Self {
            locator,
            operations: Vec::new(),
            committed: false,
        }
    }

    /// 暂存绑定，返回描述符的身份标识
    pub fn bind(&mut self, descriptor: Descriptor) -> Uuid {
        let identity = descriptor.identity();
        self.operations.push(PendingOperation::Bind(descriptor));
        identity
    }

    /// 暂存一批已解析好的描述符记录
    pub fn bind_all<I>(&mut self, descriptors: I) -> Vec<Uuid>
    where
        I: IntoIterator<Item = Descriptor>,
    {
        descriptors
            .into_iter()
            .map(|descriptor| self.bind(descriptor))
            .collect()
    }

    /// 暂存解绑
    pub fn unbind(&mut self, id: DescriptorId) {
        self.operations.push(PendingOperation::Unbind(id));
    }

    /// 暂存解绑，描述符必须属于本注册表
    pub fn unbind_descriptor(&mut self, descriptor: &ActiveDescriptor) -> DependencyResult<()> {
        if descriptor.locator_id() != self.locator.locator_id() {
            return Err(DependencyError::ForeignDescriptor {
                descriptor_id: descriptor.id(),
                locator_id: self.locator.locator_id(),
            });
        }
        self.unbind(descriptor.id());
        Ok(())
    }

    /// 暂存的操作数量
    pub fn pending(&self) -> usize {
        self.operations.len()
    }

    /// 提交事务
    ///
    /// 每个事务只能提交一次；失败的提交同样算作已提交
    pub fn commit(&mut self) -> DependencyResult<Arc<ChangeSet>> {
        if self.committed {
            return Err(DependencyError::TransactionAlreadyCommitted);
        }
        self.committed = true;
        let operations = std::mem::take(&mut self.operations);
        self.locator.commit_operations(operations)
    }
}

impl std::fmt::Debug for DynamicConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicConfiguration")
            .field("locator", &self.locator.name())
            .field("operations", &self.operations)
            .field("committed", &self.committed)
            .finish()
    }
}
