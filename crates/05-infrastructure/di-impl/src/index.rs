//! 描述符索引
//!
//! 每个 `(契约, 限定符集合)` 对应一个桶。桶在插入时保持无序，第一次按顺序读取时
//! 才排序并切换为有序形态；排名变化前必须先把桶降级回无序。

use infrastructure_common::{
    ActiveDescriptor, DependencyError, DependencyResult, DescriptorId, DescriptorKind, Visibility,
};
use std::cmp::Reverse;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// 索引键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey {
    /// 契约
    pub contract: String,
    /// 限定符集合
    pub qualifiers: BTreeSet<String>,
}

impl IndexKey {
    /// 只按契约的键
    pub fn contract(contract: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            qualifiers: BTreeSet::new(),
        }
    }

    /// 契约加单个限定符的键
    pub fn qualified(contract: impl Into<String>, qualifier: impl Into<String>) -> Self {
        let mut qualifiers = BTreeSet::new();
        qualifiers.insert(qualifier.into());
        Self {
            contract: contract.into(),
            qualifiers,
        }
    }

    /// 描述符所属的全部键
    ///
    /// 每个契约 `c` 生成 `(c, ∅)`，每个限定符 `q` 再生成 `(c, {q})`
    pub fn keys_for(descriptor: &ActiveDescriptor) -> Vec<Self> {
        let mut keys = Vec::new();
        for contract in descriptor.contracts() {
            keys.push(Self::contract(contract.clone()));
            for qualifier in descriptor.qualifiers() {
                keys.push(Self::qualified(contract.clone(), qualifier.clone()));
            }
        }
        keys
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.contract)?;
        if !self.qualifiers.is_empty() {
            let qualifiers: Vec<&str> = self.qualifiers.iter().map(String::as_str).collect();
            write!(f, "[{}]", qualifiers.join(","))?;
        }
        Ok(())
    }
}

/// 排序键：排名降序，然后 ID 升序，然后类型，然后可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    rank: Reverse<i32>,
    id: DescriptorId,
    kind: DescriptorKind,
    visibility: Visibility,
}

impl SortKey {
    /// 按描述符当前排名生成
    pub fn of(descriptor: &ActiveDescriptor) -> Self {
        Self {
            rank: Reverse(descriptor.rank()),
            id: descriptor.id(),
            kind: descriptor.kind(),
            visibility: descriptor.visibility(),
        }
    }
}

/// 桶数据
#[derive(Debug)]
pub enum IndexedListData {
    /// 插入顺序
    Unsorted(Vec<Arc<ActiveDescriptor>>),
    /// 按 [`SortKey`] 排序
    Sorted(BTreeMap<SortKey, Arc<ActiveDescriptor>>),
}

impl Default for IndexedListData {
    fn default() -> Self {
        Self::Unsorted(Vec::new())
    }
}

impl IndexedListData {
    /// 添加描述符，有序形态下按排序键插入
    pub fn add(&mut self, descriptor: Arc<ActiveDescriptor>) -> DependencyResult<()> {
        match self {
            Self::Unsorted(list) => {
                list.push(descriptor);
                Ok(())
            }
            Self::Sorted(map) => match map.entry(SortKey::of(&descriptor)) {
                Entry::Vacant(slot) => {
                    slot.insert(descriptor);
                    Ok(())
                }
                Entry::Occupied(existing) => Err(DependencyError::index_corruption(format!(
                    "排序键冲突: {} 与 {}",
                    descriptor,
                    existing.get()
                ))),
            },
        }
    }

    /// 移除描述符，返回是否找到
    ///
    /// 有序形态下按排序键删除，找不到说明排名在未降级的情况下被修改
    pub fn remove(&mut self, descriptor: &ActiveDescriptor) -> DependencyResult<bool> {
        match self {
            Self::Unsorted(list) => {
                match list.iter().position(|existing| existing.as_ref() == descriptor) {
                    Some(position) => {
                        list.remove(position);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Self::Sorted(map) => match map.remove(&SortKey::of(descriptor)) {
                Some(_) => Ok(true),
                None => Err(DependencyError::index_corruption(format!(
                    "有序桶中找不到描述符 {descriptor} (排名 {})",
                    descriptor.rank()
                ))),
            },
        }
    }

    /// 按排序顺序返回全部描述符
    ///
    /// 多于一个元素的无序桶在此时排序并转为有序形态
    pub fn ordered(&mut self) -> Vec<Arc<ActiveDescriptor>> {
        if let Self::Unsorted(list) = self {
            if list.len() <= 1 {
                return list.clone();
            }
            let sorted: BTreeMap<SortKey, Arc<ActiveDescriptor>> = list
                .drain(..)
                .map(|descriptor| (SortKey::of(&descriptor), descriptor))
                .collect();
            *self = Self::Sorted(sorted);
        }

        match self {
            Self::Sorted(map) => map.values().cloned().collect(),
            Self::Unsorted(list) => list.clone(),
        }
    }

    /// 降级为无序形态
    pub fn invalidate(&mut self) {
        if let Self::Sorted(map) = self {
            let list = std::mem::take(map).into_values().collect();
            *self = Self::Unsorted(list);
        }
    }

    /// 是否处于有序形态
    pub fn is_sorted(&self) -> bool {
        matches!(self, Self::Sorted(_))
    }

    /// 元素数量
    pub fn len(&self) -> usize {
        match self {
            Self::Unsorted(list) => list.len(),
            Self::Sorted(map) => map.len(),
        }
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 描述符索引
#[derive(Debug, Default)]
pub struct DescriptorIndex {
    buckets: HashMap<IndexKey, IndexedListData>,
}

impl DescriptorIndex {
    /// 创建空索引
    pub fn new() -> Self {
        Self::default()
    }

    /// 把描述符加入指定桶
    pub fn add(&mut self, descriptor: Arc<ActiveDescriptor>, key: IndexKey) -> DependencyResult<()> {
        self.buckets.entry(key).or_default().add(descriptor)
    }

    /// 从指定桶移除描述符，桶为空时删除桶
    pub fn remove(&mut self, descriptor: &ActiveDescriptor, key: &IndexKey) -> DependencyResult<bool> {
        let Some(bucket) = self.buckets.get_mut(key) else {
            return Ok(false);
        };
        let removed = bucket.remove(descriptor)?;
        if bucket.is_empty() {
            self.buckets.remove(key);
        }
        Ok(removed)
    }

    /// 把描述符加入它所属的全部桶；失败时撤销本次已加入的桶
    pub fn insert_descriptor(&mut self, descriptor: &Arc<ActiveDescriptor>) -> DependencyResult<()> {
        let keys = IndexKey::keys_for(descriptor);
        for (position, key) in keys.iter().enumerate() {
            if let Err(error) = self.add(descriptor.clone(), key.clone()) {
                for applied in keys[..position].iter().rev() {
                    if let Err(undo_error) = self.remove(descriptor, applied) {
                        tracing::error!("撤销索引插入失败: {} ({})", applied, undo_error);
                    }
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// 从描述符所属的全部桶移除；失败时恢复本次已移除的桶
    pub fn remove_descriptor(&mut self, descriptor: &Arc<ActiveDescriptor>) -> DependencyResult<()> {
        let keys = IndexKey::keys_for(descriptor);
        let mut removed_from = Vec::new();
        for key in &keys {
            match self.remove(descriptor, key) {
                Ok(true) => removed_from.push(key),
                Ok(false) => {}
                Err(error) => {
                    for applied in removed_from.into_iter().rev() {
                        if let Err(undo_error) = self.add(descriptor.clone(), applied.clone()) {
                            tracing::error!("恢复索引条目失败: {} ({})", applied, undo_error);
                        }
                    }
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// 按顺序返回桶内全部描述符，桶不存在时为空
    pub fn ordered(&mut self, key: &IndexKey) -> Vec<Arc<ActiveDescriptor>> {
        self.buckets
            .get_mut(key)
            .map(IndexedListData::ordered)
            .unwrap_or_default()
    }

    /// 降级指定桶
    pub fn invalidate(&mut self, key: &IndexKey) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.invalidate();
        }
    }

    /// 降级描述符所属的全部桶
    pub fn invalidate_descriptor(&mut self, descriptor: &ActiveDescriptor) {
        for key in IndexKey::keys_for(descriptor) {
            self.invalidate(&key);
        }
    }

    /// 桶是否存在
    pub fn contains_key(&self, key: &IndexKey) -> bool {
        self.buckets.contains_key(key)
    }

    /// 桶是否处于有序形态
    pub fn is_sorted(&self, key: &IndexKey) -> bool {
        self.buckets.get(key).is_some_and(IndexedListData::is_sorted)
    }

    /// 桶数量
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// 全部桶中的条目总数
    pub fn len(&self) -> usize {
        self.buckets.values().map(IndexedListData::len).sum()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// 清空索引
    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infrastructure_common::Descriptor;

    fn active(id: DescriptorId, rank: i32) -> Arc<ActiveDescriptor> {
        Arc::new(ActiveDescriptor::new(
            Descriptor::new(format!("Impl{id}")).to("Store").with_rank(rank),
            id,
            0,
        ))
    }

    fn ids(list: &[Arc<ActiveDescriptor>]) -> Vec<DescriptorId> {
        list.iter().map(|descriptor| descriptor.id()).collect()
    }

    #[test]
    fn test_ordering_rank_then_id() {
        let mut index = DescriptorIndex::new();
        let key = IndexKey::contract("Store");
        for (id, rank) in [(1, 0), (2, 5), (3, 5), (4, -1)] {
            index.add(active(id, rank), key.clone()).unwrap();
        }

        assert!(!index.is_sorted(&key));
        assert_eq!(ids(&index.ordered(&key)), vec![2, 3, 1, 4]);
        assert!(index.is_sorted(&key));
    }

    #[test]
    fn test_single_element_bucket_stays_unsorted() {
        let mut index = DescriptorIndex::new();
        let key = IndexKey::contract("Store");
        index.add(active(1, 0), key.clone()).unwrap();

        assert_eq!(ids(&index.ordered(&key)), vec![1]);
        assert!(!index.is_sorted(&key));
        assert!(index.ordered(&IndexKey::contract("Missing")).is_empty());
    }

    #[test]
    fn test_add_into_sorted_bucket_keeps_order() {
        let mut index = DescriptorIndex::new();
        let key = IndexKey::contract("Store");
        index.add(active(1, 1), key.clone()).unwrap();
        index.add(active(2, 3), key.clone()).unwrap();
        index.ordered(&key);

        index.add(active(3, 2), key.clone()).unwrap();
        assert!(index.is_sorted(&key));
        assert_eq!(ids(&index.ordered(&key)), vec![2, 3, 1]);
    }

    #[test]
    fn test_rank_change_after_invalidate() {
        let mut index = DescriptorIndex::new();
        let key = IndexKey::contract("Store");
        let low = active(1, 0);
        let high = active(2, 10);
        index.add(low.clone(), key.clone()).unwrap();
        index.add(high.clone(), key.clone()).unwrap();
        assert_eq!(ids(&index.ordered(&key)), vec![2, 1]);

        index.invalidate_descriptor(&low);
        assert!(!index.is_sorted(&key));
        low.set_rank(20);

        assert_eq!(ids(&index.ordered(&key)), vec![1, 2]);
        index.remove(&low, &key).unwrap();
        assert_eq!(ids(&index.ordered(&key)), vec![2]);
    }

    #[test]
    fn test_rank_change_without_invalidate_is_corruption() {
        let mut index = DescriptorIndex::new();
        let key = IndexKey::contract("Store");
        let first = active(1, 0);
        index.add(first.clone(), key.clone()).unwrap();
        index.add(active(2, 1), key.clone()).unwrap();
        index.ordered(&key);

        first.set_rank(7);
        let error = index.remove(&first, &key).unwrap_err();
        assert!(matches!(error, DependencyError::IndexCorruption { .. }));
    }

    #[test]
    fn test_order_holds_across_mixed_operations() {
        let mut index = DescriptorIndex::new();
        let key = IndexKey::contract("Store");
        let mut live: Vec<Arc<ActiveDescriptor>> = Vec::new();
        let mut next_id = 0;
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for step in 0..300 {
            let roll = next();
            let rank = (next() % 7) as i32 - 3;
            match roll % 3 {
                0 if !live.is_empty() => {
                    let victim = live.remove((next() % live.len() as u64) as usize);
                    assert!(index.remove(&victim, &key).unwrap(), "第 {step} 步移除失败");
                }
                1 if !live.is_empty() => {
                    let target = live[(next() % live.len() as u64) as usize].clone();
                    index.invalidate_descriptor(&target);
                    target.set_rank(rank);
                }
                _ => {
                    let descriptor = active(next_id, rank);
                    next_id += 1;
                    index.add(descriptor.clone(), key.clone()).unwrap();
                    live.push(descriptor);
                }
            }

            let mut expected = live.clone();
            expected.sort_by_key(|descriptor| (std::cmp::Reverse(descriptor.rank()), descriptor.id()));
            assert_eq!(ids(&index.ordered(&key)), ids(&expected), "第 {step} 步顺序错误");
        }
    }

    #[test]
    fn test_remove_drops_empty_bucket() {
        let mut index = DescriptorIndex::new();
        let descriptor = Arc::new(ActiveDescriptor::new(
            Descriptor::new("FileStore").to("Store").qualified_by("local"),
            1,
            0,
        ));
        index.insert_descriptor(&descriptor).unwrap();

        // FileStore, FileStore[local], Store, Store[local]
        assert_eq!(index.bucket_count(), 4);
        assert!(index.contains_key(&IndexKey::qualified("Store", "local")));

        index.remove_descriptor(&descriptor).unwrap();
        assert!(index.is_empty());
        assert!(!index.remove(&descriptor, &IndexKey::contract("Store")).unwrap());
    }

    #[test]
    fn test_sorted_insert_collision_is_corruption() {
        let mut index = DescriptorIndex::new();
        let key = IndexKey::contract("Store");
        index.add(active(1, 0), key.clone()).unwrap();
        index.add(active(2, 0), key.clone()).unwrap();
        index.ordered(&key);

        let error = index.add(active(1, 0), key.clone()).unwrap_err();
        assert!(matches!(error, DependencyError::IndexCorruption { .. }));
        assert_eq!(index.len(), 2);
    }
}
