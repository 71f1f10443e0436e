use std::rc::Rc;

use ash::vk;
use itertools::Itertools;

use crate::backend::{GfxBackend, GfxDescriptorBinding};
use crate::error::GfxError;
use crate::handles::GfxDescriptorSetLayoutHandle;

/// 拥有一个 descriptor set layout，并记住它的 bindings，用于计算 pool 的需求
pub struct GfxDescriptorSetLayout {
    backend: Rc<dyn GfxBackend>,
    handle: GfxDescriptorSetLayoutHandle,
    bindings: Vec<GfxDescriptorBinding>,
}
impl Drop for GfxDescriptorSetLayout {
    fn drop(&mut self) {
        self.backend.destroy_descriptor_set_layout(self.handle);
    }
}
// new & init
impl GfxDescriptorSetLayout {
    pub fn new(backend: Rc<dyn GfxBackend>, bindings: Vec<GfxDescriptorBinding>) -> Result<Self, GfxError> {
        debug_assert!(
            bindings.iter().map(|b| b.binding).unique().count() == bindings.len(),
            "descriptor set layout has duplicated binding slots"
        );
        let handle = backend.create_descriptor_set_layout(&bindings)?;
        Ok(Self {
            backend,
            handle,
            bindings,
        })
    }
}
// getter
impl GfxDescriptorSetLayout {
    #[inline]
    pub fn handle(&self) -> GfxDescriptorSetLayoutHandle {
        self.handle
    }

    #[inline]
    pub fn bindings(&self) -> &[GfxDescriptorBinding] {
        &self.bindings
    }
}
// tools
impl GfxDescriptorSetLayout {
    /// 按照 descriptor type 汇总需要的 descriptor 数量，顺序为首次出现的顺序
    pub fn descriptor_counts(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += binding.count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: binding.count,
                }),
            }
        }
        sizes
    }

    /// 所有 binding 的 descriptor 总数
    #[inline]
    pub fn descriptor_total(&self) -> u32 {
        self.bindings.iter().map(|b| b.count).sum()
    }
}
