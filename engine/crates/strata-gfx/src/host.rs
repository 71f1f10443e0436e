use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use ash::vk;
use slotmap::SlotMap;

use crate::backend::{
    GfxBackend, GfxBufferDesc, GfxBufferDescriptorWrite, GfxDescriptorBinding, GfxLimits, GfxMemoryLocation,
};
use crate::error::GfxError;
use crate::handles::{GfxBufferHandle, GfxDescriptorPoolHandle, GfxDescriptorSetHandle, GfxDescriptorSetLayoutHandle};

struct HostBuffer {
    bytes: Vec<u8>,
    location: GfxMemoryLocation,
    debug_name: String,
}

struct HostDescriptorPool {
    sets_left: u32,
    descriptors_left: HashMap<vk::DescriptorType, u32>,
    max_sets: u32,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
}

struct HostDescriptorSet {
    pool: GfxDescriptorPoolHandle,
    layout: Vec<GfxDescriptorBinding>,
    /// (binding, array element) -> (buffer, offset, range)
    buffers: HashMap<(u32, u32), (GfxBufferHandle, vk::DeviceSize, vk::DeviceSize)>,
}

/// 纯内存的 backend
///
/// 不需要 GPU，用于测试以及 headless 的 demo。
/// 会像驱动一样检查 descriptor pool 的容量，并记录 upload、copy 以及 descriptor 写入，方便检查。
pub struct HostBackend {
    limits: GfxLimits,
    /// 所有存活 buffer 的总大小上限，超出时 create_buffer 返回 OutOfDeviceMemory
    memory_budget: Option<vk::DeviceSize>,

    buffers: RefCell<SlotMap<GfxBufferHandle, HostBuffer>>,
    set_layouts: RefCell<SlotMap<GfxDescriptorSetLayoutHandle, Vec<GfxDescriptorBinding>>>,
    pools: RefCell<SlotMap<GfxDescriptorPoolHandle, HostDescriptorPool>>,
    sets: RefCell<SlotMap<GfxDescriptorSetHandle, HostDescriptorSet>>,

    upload_count: Cell<u32>,
    copy_count: Cell<u32>,
    descriptor_write_count: Cell<u32>,
}
impl Default for HostBackend {
    fn default() -> Self {
        Self::new(GfxLimits::default())
    }
}
// new & init
impl HostBackend {
    pub fn new(limits: GfxLimits) -> Self {
        Self {
            limits,
            memory_budget: None,
            buffers: RefCell::new(SlotMap::with_key()),
            set_layouts: RefCell::new(SlotMap::with_key()),
            pools: RefCell::new(SlotMap::with_key()),
            sets: RefCell::new(SlotMap::with_key()),
            upload_count: Cell::new(0),
            copy_count: Cell::new(0),
            descriptor_write_count: Cell::new(0),
        }
    }
}
// inspect
impl HostBackend {
    /// 模拟显存不足
    pub fn with_memory_budget(limits: GfxLimits, memory_budget: vk::DeviceSize) -> Self {
        Self {
            memory_budget: Some(memory_budget),
            ..Self::new(limits)
        }
    }

    /// 所有存活 buffer 的总大小
    pub fn live_buffer_bytes(&self) -> vk::DeviceSize {
        self.buffers.borrow().values().map(|buffer| buffer.bytes.len() as vk::DeviceSize).sum()
    }

    /// buffer 的全部内容，不区分 memory location
    pub fn buffer_contents(&self, buffer: GfxBufferHandle) -> Vec<u8> {
        self.buffers.borrow()[buffer].bytes.clone()
    }

    #[inline]
    pub fn is_buffer_alive(&self, buffer: GfxBufferHandle) -> bool {
        self.buffers.borrow().contains_key(buffer)
    }

    #[inline]
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.borrow().len()
    }

    #[inline]
    pub fn live_pool_count(&self) -> usize {
        self.pools.borrow().len()
    }

    #[inline]
    pub fn live_set_layout_count(&self) -> usize {
        self.set_layouts.borrow().len()
    }

    #[inline]
    pub fn is_set_alive(&self, set: GfxDescriptorSetHandle) -> bool {
        self.sets.borrow().contains_key(set)
    }

    /// 创建 pool 时的 (max_sets, pool_sizes)
    pub fn pool_capacity(&self, pool: GfxDescriptorPoolHandle) -> (u32, Vec<vk::DescriptorPoolSize>) {
        let pools = self.pools.borrow();
        let pool = &pools[pool];
        (pool.max_sets, pool.pool_sizes.clone())
    }

    /// 某个 set 的 binding 当前指向的 buffer 范围
    pub fn bound_buffer(
        &self,
        set: GfxDescriptorSetHandle,
        binding: u32,
        array_element: u32,
    ) -> Option<(GfxBufferHandle, vk::DeviceSize, vk::DeviceSize)> {
        self.sets.borrow().get(set)?.buffers.get(&(binding, array_element)).copied()
    }

    #[inline]
    pub fn upload_count(&self) -> u32 {
        self.upload_count.get()
    }

    #[inline]
    pub fn copy_count(&self) -> u32 {
        self.copy_count.get()
    }

    #[inline]
    pub fn descriptor_write_count(&self) -> u32 {
        self.descriptor_write_count.get()
    }
}
impl GfxBackend for HostBackend {
    fn limits(&self) -> GfxLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> Result<GfxBufferHandle, GfxError> {
        let size = usize::try_from(desc.size).map_err(|_| GfxError::OutOfDeviceMemory)?;
        if let Some(budget) = self.memory_budget {
            if self.live_buffer_bytes() + desc.size > budget {
                return Err(GfxError::OutOfDeviceMemory);
            }
        }
        let handle = self.buffers.borrow_mut().insert(HostBuffer {
            bytes: vec![0; size],
            location: desc.location,
            debug_name: desc.debug_name.clone(),
        });
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: GfxBufferHandle) {
        self.buffers.borrow_mut().remove(buffer);
    }

    fn vk_buffer(&self, _buffer: GfxBufferHandle) -> vk::Buffer {
        vk::Buffer::null()
    }

    fn write_mapped(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) {
        let mut buffers = self.buffers.borrow_mut();
        let buffer = &mut buffers[buffer];
        assert_eq!(
            buffer.location,
            GfxMemoryLocation::HostVisible,
            "buffer '{}' is not mapped",
            buffer.debug_name
        );
        let offset = offset as usize;
        buffer.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read_mapped(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, dst: &mut [u8]) {
        let buffers = self.buffers.borrow();
        let buffer = &buffers[buffer];
        assert_eq!(
            buffer.location,
            GfxMemoryLocation::HostVisible,
            "buffer '{}' is not mapped",
            buffer.debug_name
        );
        let offset = offset as usize;
        dst.copy_from_slice(&buffer.bytes[offset..offset + dst.len()]);
    }

    fn upload(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) -> Result<(), GfxError> {
        let mut buffers = self.buffers.borrow_mut();
        let buffer = buffers.get_mut(buffer).ok_or(GfxError::InvalidHandle("buffer"))?;
        let offset = offset as usize;
        buffer.bytes[offset..offset + data.len()].copy_from_slice(data);
        self.upload_count.set(self.upload_count.get() + 1);
        Ok(())
    }

    fn copy_buffer(&self, src: GfxBufferHandle, dst: GfxBufferHandle, size: vk::DeviceSize) -> Result<(), GfxError> {
        let mut buffers = self.buffers.borrow_mut();
        let bytes = buffers.get(src).ok_or(GfxError::InvalidHandle("buffer"))?.bytes[..size as usize].to_vec();
        let dst = buffers.get_mut(dst).ok_or(GfxError::InvalidHandle("buffer"))?;
        dst.bytes[..bytes.len()].copy_from_slice(&bytes);
        self.copy_count.set(self.copy_count.get() + 1);
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[GfxDescriptorBinding],
    ) -> Result<GfxDescriptorSetLayoutHandle, GfxError> {
        Ok(self.set_layouts.borrow_mut().insert(bindings.to_vec()))
    }

    fn destroy_descriptor_set_layout(&self, layout: GfxDescriptorSetLayoutHandle) {
        self.set_layouts.borrow_mut().remove(layout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<GfxDescriptorPoolHandle, GfxError> {
        let mut descriptors_left = HashMap::new();
        for size in pool_sizes {
            *descriptors_left.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        Ok(self.pools.borrow_mut().insert(HostDescriptorPool {
            sets_left: max_sets,
            descriptors_left,
            max_sets,
            pool_sizes: pool_sizes.to_vec(),
        }))
    }

    fn destroy_descriptor_pool(&self, pool: GfxDescriptorPoolHandle) {
        if self.pools.borrow_mut().remove(pool).is_some() {
            self.sets.borrow_mut().retain(|_, set| set.pool != pool);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: GfxDescriptorPoolHandle,
        layout: GfxDescriptorSetLayoutHandle,
    ) -> Result<GfxDescriptorSetHandle, GfxError> {
        let layout = self
            .set_layouts
            .borrow()
            .get(layout)
            .cloned()
            .ok_or(GfxError::InvalidHandle("descriptor set layout"))?;

        let mut pools = self.pools.borrow_mut();
        let host_pool = pools.get_mut(pool).ok_or(GfxError::InvalidHandle("descriptor pool"))?;
        if host_pool.sets_left == 0 {
            return Err(GfxError::OutOfPoolMemory);
        }
        let mut descriptors_left = host_pool.descriptors_left.clone();
        for binding in &layout {
            let left = descriptors_left.entry(binding.descriptor_type).or_insert(0);
            if *left < binding.count {
                return Err(GfxError::OutOfPoolMemory);
            }
            *left -= binding.count;
        }
        host_pool.descriptors_left = descriptors_left;
        host_pool.sets_left -= 1;

        Ok(self.sets.borrow_mut().insert(HostDescriptorSet {
            pool,
            layout,
            buffers: HashMap::new(),
        }))
    }

    fn write_buffer_descriptors(&self, writes: &[GfxBufferDescriptorWrite]) {
        let buffers = self.buffers.borrow();
        let mut sets = self.sets.borrow_mut();
        for write in writes {
            assert!(buffers.contains_key(write.buffer), "descriptor write references a destroyed buffer");
            let set = &mut sets[write.set];
            let Some(binding) = set.layout.iter().find(|b| b.binding == write.binding) else {
                panic!("binding {} does not exist in the descriptor set layout", write.binding);
            };
            assert_eq!(binding.descriptor_type, write.descriptor_type, "binding {} type mismatch", write.binding);
            assert!(write.array_element < binding.count, "binding {} array element out of range", write.binding);

            set.buffers
                .insert((write.binding, write.array_element), (write.buffer, write.offset, write.range));
        }
        self.descriptor_write_count
            .set(self.descriptor_write_count.get() + writes.len() as u32);
    }

    fn vk_descriptor_set(&self, _set: GfxDescriptorSetHandle) -> vk::DescriptorSet {
        vk::DescriptorSet::null()
    }
}
