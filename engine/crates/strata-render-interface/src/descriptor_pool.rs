use std::rc::Rc;

use ash::vk;
use strata_gfx::{GfxBackend, GfxDescriptorPoolHandle, GfxDescriptorSetHandle, GfxDescriptorSetLayout, GfxError};

use crate::settings::DescriptorPoolSettings;

/// 只包含一种 descriptor type 的可扩展 descriptor pool
///
/// 当前 pool 不够时，根据历史上 set 与 descriptor 的比例创建一个新的 pool，
/// 旧的 pool 一直保留（已经分配出去的 set 还在使用），直到整个对象销毁。
pub struct ExpandableDescriptorPool {
    backend: Rc<dyn GfxBackend>,
    descriptor_type: vk::DescriptorType,

    /// 最后一个是当前使用的 pool
    pools: Vec<GfxDescriptorPoolHandle>,
    sets_available: u32,
    descriptors_available: u32,

    /// 历史上一共分配出去的 set 和 descriptor 数量
    sets_granted: u32,
    descriptors_granted: u32,

    initial: DescriptorPoolSettings,
    /// 每个 pool 的 (max_sets, descriptors)，调试用
    expansion_track: Vec<(u32, u32)>,
}
impl Drop for ExpandableDescriptorPool {
    fn drop(&mut self) {
        log::info!(
            "Destroying ExpandableDescriptorPool({:?}): {} pools, {} sets, {} descriptors granted",
            self.descriptor_type,
            self.pools.len(),
            self.sets_granted,
            self.descriptors_granted
        );
        for pool in self.pools.drain(..) {
            self.backend.destroy_descriptor_pool(pool);
        }
    }
}
// new & init
impl ExpandableDescriptorPool {
    pub fn new(
        backend: Rc<dyn GfxBackend>,
        descriptor_type: vk::DescriptorType,
        settings: &DescriptorPoolSettings,
    ) -> Result<Self, GfxError> {
        assert!(
            settings.initial_sets > 0 && settings.initial_descriptors > 0,
            "descriptor pool initial capacity must be positive"
        );

        let mut pool = Self {
            backend,
            descriptor_type,
            pools: Vec::new(),
            sets_available: 0,
            descriptors_available: 0,
            sets_granted: 0,
            descriptors_granted: 0,
            initial: *settings,
            expansion_track: Vec::new(),
        };
        pool.push_pool(settings.initial_sets, settings.initial_descriptors)?;
        Ok(pool)
    }

    fn push_pool(&mut self, max_sets: u32, descriptors: u32) -> Result<(), GfxError> {
        let handle = self.backend.create_descriptor_pool(
            max_sets,
            &[vk::DescriptorPoolSize {
                ty: self.descriptor_type,
                descriptor_count: descriptors,
            }],
        )?;
        log::info!(
            "create descriptor pool({:?}) #{}: {} sets, {} descriptors",
            self.descriptor_type,
            self.pools.len(),
            max_sets,
            descriptors
        );

        self.pools.push(handle);
        self.expansion_track.push((max_sets, descriptors));
        self.sets_available = max_sets;
        self.descriptors_available = descriptors;
        Ok(())
    }
}
// getter
impl ExpandableDescriptorPool {
    #[inline]
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        self.descriptor_type
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    pub fn sets_available(&self) -> u32 {
        self.sets_available
    }

    #[inline]
    pub fn descriptors_available(&self) -> u32 {
        self.descriptors_available
    }

    #[inline]
    pub fn sets_granted(&self) -> u32 {
        self.sets_granted
    }

    #[inline]
    pub fn descriptors_granted(&self) -> u32 {
        self.descriptors_granted
    }

    #[inline]
    pub fn expansion_track(&self) -> &[(u32, u32)] {
        &self.expansion_track
    }
}
// tools
impl ExpandableDescriptorPool {
    /// 从当前的 pool 中分配一个 set，不够时先扩展
    ///
    /// layout 中含有其它类型的 binding 时返回 `Ok(None)`
    pub fn allocate(&mut self, layout: &GfxDescriptorSetLayout) -> Result<Option<GfxDescriptorSetHandle>, GfxError> {
        if layout.bindings().iter().any(|b| b.descriptor_type != self.descriptor_type) {
            log::warn!(
                "ExpandableDescriptorPool({:?}) can not allocate a set with other descriptor types",
                self.descriptor_type
            );
            return Ok(None);
        }
        let required = layout.descriptor_total();

        if self.sets_available == 0 || self.descriptors_available < required {
            let (sets, descriptors) = self.expansion_size(required);
            self.push_pool(sets, descriptors)?;
        }

        let Some(&pool) = self.pools.last() else {
            return Err(GfxError::InvalidHandle("descriptor pool"));
        };
        let set = self.backend.allocate_descriptor_set(pool, layout.handle())?;

        self.sets_available -= 1;
        self.descriptors_available -= required;
        self.sets_granted += 1;
        self.descriptors_granted += required;
        Ok(Some(set))
    }

    /// 新 pool 的大小：(max_sets, descriptors)
    ///
    /// descriptor 数量取历史总量与本次需求的较大值，set 数量按照历史上每个 set 平均使用的 descriptor 数量推算。
    /// 还没有历史记录时，使用初始配置的比例。
    pub fn expansion_size(&self, required: u32) -> (u32, u32) {
        let (history_sets, history_descriptors) = if self.sets_granted == 0 || self.descriptors_granted == 0 {
            log::debug!(
                "descriptor pool has no allocation history, use the initial ratio {} sets / {} descriptors",
                self.initial.initial_sets,
                self.initial.initial_descriptors
            );
            (self.initial.initial_sets, self.initial.initial_descriptors)
        } else {
            (self.sets_granted, self.descriptors_granted)
        };

        let descriptors = history_descriptors.max(required);
        // ceil(descriptors / (history_descriptors / history_sets))
        let sets = (descriptors as u64 * history_sets as u64).div_ceil(history_descriptors as u64);
        let sets = u32::try_from(sets).unwrap_or(u32::MAX).max(1);
        (sets, descriptors)
    }
}

/// 每次分配都创建一个大小刚好的 pool，适用于数量很少、binding 类型混杂的 set
pub struct TrivialDescriptorPool {
    backend: Rc<dyn GfxBackend>,
    pools: Vec<GfxDescriptorPoolHandle>,
}
impl Drop for TrivialDescriptorPool {
    fn drop(&mut self) {
        for pool in self.pools.drain(..) {
            self.backend.destroy_descriptor_pool(pool);
        }
    }
}
impl TrivialDescriptorPool {
    pub fn new(backend: Rc<dyn GfxBackend>) -> Self {
        Self {
            backend,
            pools: Vec::new(),
        }
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// layout 没有任何 binding 时返回 `Ok(None)`
    pub fn allocate(&mut self, layout: &GfxDescriptorSetLayout) -> Result<Option<GfxDescriptorSetHandle>, GfxError> {
        if layout.bindings().is_empty() {
            return Ok(None);
        }

        let pool = self.backend.create_descriptor_pool(1, &layout.descriptor_counts())?;
        self.pools.push(pool);
        let set = self.backend.allocate_descriptor_set(pool, layout.handle())?;
        Ok(Some(set))
    }
}
