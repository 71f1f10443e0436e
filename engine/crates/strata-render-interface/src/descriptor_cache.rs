use std::collections::{BTreeMap, HashMap};

use ash::vk;

/// 一个 binding 的结构信息，不包含任何实例数据
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub name: String,
    pub size: vk::DeviceSize,
    /// 展开后的 `字段路径 -> offset`，有序
    pub field_offsets: BTreeMap<String, vk::DeviceSize>,
    pub stages: vk::ShaderStageFlags,
}

/// descriptor set 的结构指纹：按照 binding 顺序排列的 [`BindingKey`]
///
/// 相同的指纹共享同一个 descriptor set。相等和哈希都直接基于各个字段，
/// 因此不同的结构不会因为字符串拼接而碰撞。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BindingFingerprint {
    bindings: Vec<BindingKey>,
}
impl BindingFingerprint {
    #[inline]
    pub fn new(bindings: Vec<BindingKey>) -> Self {
        Self { bindings }
    }

    #[inline]
    pub fn push(&mut self, key: BindingKey) {
        self.bindings.push(key);
    }

    #[inline]
    pub fn bindings(&self) -> &[BindingKey] {
        &self.bindings
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// 确定性的序列化结果，所有变长的部分都带有长度前缀
    pub fn serialize(&self) -> Vec<u8> {
        fn put_str(out: &mut Vec<u8>, s: &str) {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }

        let mut out = Vec::new();
        out.extend_from_slice(&(self.bindings.len() as u32).to_le_bytes());
        for binding in &self.bindings {
            out.push(b'N');
            put_str(&mut out, &binding.name);
            out.push(b'S');
            out.extend_from_slice(&binding.size.to_le_bytes());
            out.push(b'F');
            out.extend_from_slice(&(binding.field_offsets.len() as u32).to_le_bytes());
            for (field, offset) in &binding.field_offsets {
                put_str(&mut out, field);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            out.push(b'V');
            out.extend_from_slice(&binding.stages.as_raw().to_le_bytes());
        }
        out
    }

    /// 序列化结果的 FNV-1a 哈希，只用于日志
    pub fn digest(&self) -> u64 {
        self.serialize()
            .iter()
            .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| (hash ^ *byte as u64).wrapping_mul(0x0100_0000_01b3))
    }
}

/// 指纹 -> descriptor set 的缓存
pub struct DescriptorSetCache<V> {
    entries: HashMap<BindingFingerprint, V>,

    hit_count: u32,
    miss_count: u32,
}
impl<V> Default for DescriptorSetCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
// new & init
impl<V> DescriptorSetCache<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hit_count: 0,
            miss_count: 0,
        }
    }
}
// getter
impl<V> DescriptorSetCache<V> {
    #[inline]
    pub fn get(&self, fingerprint: &BindingFingerprint) -> Option<&V> {
        self.entries.get(fingerprint)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    #[inline]
    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    #[inline]
    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }
}
// tools
impl<V> DescriptorSetCache<V> {
    /// 命中时直接返回缓存的值，否则调用 create 创建并插入
    ///
    /// create 失败时缓存保持不变
    pub fn get_or_try_insert_with<E>(
        &mut self,
        fingerprint: BindingFingerprint,
        create: impl FnOnce(&BindingFingerprint) -> Result<V, E>,
    ) -> Result<&V, E> {
        use std::collections::hash_map::Entry;

        match self.entries.entry(fingerprint) {
            Entry::Occupied(entry) => {
                self.hit_count += 1;
                log::debug!("descriptor set cache hit: {:016x}", entry.key().digest());
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => {
                let value = create(entry.key())?;
                self.miss_count += 1;
                log::debug!("descriptor set cache miss: {:016x}", entry.key().digest());
                Ok(entry.insert(value))
            }
        }
    }
}
