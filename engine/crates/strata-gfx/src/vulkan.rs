use std::cell::RefCell;
use std::ptr;

use ash::vk;
use itertools::Itertools;
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::backend::{
    GfxBackend, GfxBufferDesc, GfxBufferDescriptorWrite, GfxDescriptorBinding, GfxLimits, GfxMemoryLocation,
};
use crate::error::GfxError;
use crate::handles::{GfxBufferHandle, GfxDescriptorPoolHandle, GfxDescriptorSetHandle, GfxDescriptorSetLayoutHandle};

struct VulkanBuffer {
    handle: vk::Buffer,
    allocation: vk_mem::Allocation,
    /// 在创建时写死，HostVisible 的 buffer 一直保持映射
    map_ptr: Option<*mut u8>,
    debug_name: String,
}

struct VulkanDescriptorSet {
    handle: vk::DescriptorSet,
    pool: GfxDescriptorPoolHandle,
}

/// 基于 ash + vk-mem 的 backend
///
/// Instance 和 Device 由外部创建并保证在 backend 的生命周期内有效；
/// backend 只负责自己创建的 buffer、descriptor 相关对象，以及用于传输的 command pool。
pub struct VulkanBackend {
    device: ash::Device,
    allocator: vk_mem::Allocator,

    queue: vk::Queue,
    transfer_command_pool: vk::CommandPool,

    limits: GfxLimits,

    buffers: RefCell<SlotMap<GfxBufferHandle, VulkanBuffer>>,
    set_layouts: RefCell<SlotMap<GfxDescriptorSetLayoutHandle, vk::DescriptorSetLayout>>,
    pools: RefCell<SlotMap<GfxDescriptorPoolHandle, vk::DescriptorPool>>,
    sets: RefCell<SlotMap<GfxDescriptorSetHandle, VulkanDescriptorSet>>,
}
impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Destroying VulkanBackend");
        unsafe {
            // descriptor set 随着 pool 一起释放
            self.sets.get_mut().clear();
            for (_, pool) in self.pools.get_mut().drain() {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, layout) in self.set_layouts.get_mut().drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            let buffers = self.buffers.get_mut().drain().map(|(_, buffer)| buffer).collect_vec();
            for buffer in buffers {
                log::warn!("buffer '{}' is still alive when the backend is dropped", buffer.debug_name);
                self.release_buffer(buffer);
            }
            self.device.destroy_command_pool(self.transfer_command_pool, None);
        }
    }
}
// new & init
impl VulkanBackend {
    /// vma 需要引用 Instance 以及 Device，因此需要在它们都初始化完成之后再创建
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
    ) -> Result<Self, GfxError> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        let allocator = unsafe { vk_mem::Allocator::new(vma_ci)? };

        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = GfxLimits {
            min_uniform_buffer_offset_alignment: props.limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: props.limits.min_storage_buffer_offset_alignment,
        };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let transfer_command_pool = unsafe { device.create_command_pool(&pool_ci, None)? };

        log::info!(
            "VulkanBackend created, min ubo offset alignment: {}, min ssbo offset alignment: {}",
            limits.min_uniform_buffer_offset_alignment,
            limits.min_storage_buffer_offset_alignment
        );

        Ok(Self {
            device,
            allocator,
            queue,
            transfer_command_pool,
            limits,
            buffers: RefCell::new(SlotMap::with_key()),
            set_layouts: RefCell::new(SlotMap::with_key()),
            pools: RefCell::new(SlotMap::with_key()),
            sets: RefCell::new(SlotMap::with_key()),
        })
    }
}
// tools
impl VulkanBackend {
    fn allocate_buffer(&self, desc: &GfxBufferDesc) -> Result<VulkanBuffer, GfxError> {
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST);
        let mem_map = desc.location == GfxMemoryLocation::HostVisible;
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: if mem_map {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (handle, mut allocation) = unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci)? };

        let mut map_ptr = None;
        if mem_map {
            match unsafe { self.allocator.map_memory(&mut allocation) } {
                Ok(p) => map_ptr = Some(p),
                Err(e) => {
                    unsafe { self.allocator.destroy_buffer(handle, &mut allocation) };
                    return Err(e.into());
                }
            }
        }

        Ok(VulkanBuffer {
            handle,
            allocation,
            map_ptr,
            debug_name: desc.debug_name.clone(),
        })
    }

    fn release_buffer(&self, mut buffer: VulkanBuffer) {
        unsafe {
            if buffer.map_ptr.is_some() {
                self.allocator.unmap_memory(&mut buffer.allocation);
            }
            self.allocator.destroy_buffer(buffer.handle, &mut buffer.allocation);
        }
    }

    fn mapped_ptr(buffer: &VulkanBuffer) -> *mut u8 {
        buffer
            .map_ptr
            .unwrap_or_else(|| panic!("buffer '{}' is not mapped", buffer.debug_name))
    }

    /// 录制一个一次性的 command buffer，提交后同步等待执行完成
    fn one_time_exec(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<(), GfxError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transfer_command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info)?[0] };

        let result = self.submit_and_wait(command_buffer, record);
        unsafe {
            self.device.free_command_buffers(self.transfer_command_pool, &[command_buffer]);
        }
        result
    }

    fn submit_and_wait(
        &self,
        command_buffer: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), GfxError> {
        unsafe {
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            record(command_buffer);
            self.device.end_command_buffer(command_buffer)?;

            let fence = self.device.create_fence(&vk::FenceCreateInfo::default(), None)?;
            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            let submitted = self
                .device
                .queue_submit(self.queue, std::slice::from_ref(&submit_info), fence)
                .and_then(|_| self.device.wait_for_fences(&[fence], true, u64::MAX));
            self.device.destroy_fence(fence, None);
            submitted?;
        }
        Ok(())
    }
}
impl GfxBackend for VulkanBackend {
    fn limits(&self) -> GfxLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> Result<GfxBufferHandle, GfxError> {
        let buffer = self.allocate_buffer(desc)?;
        Ok(self.buffers.borrow_mut().insert(buffer))
    }

    fn destroy_buffer(&self, buffer: GfxBufferHandle) {
        let buffer = self.buffers.borrow_mut().remove(buffer);
        if let Some(buffer) = buffer {
            self.release_buffer(buffer);
        }
    }

    fn vk_buffer(&self, buffer: GfxBufferHandle) -> vk::Buffer {
        self.buffers.borrow()[buffer].handle
    }

    fn write_mapped(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) {
        let buffers = self.buffers.borrow();
        let buffer = &buffers[buffer];
        let dst = Self::mapped_ptr(buffer);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), dst.add(offset as usize), data.len());
            if let Err(e) = self.allocator.flush_allocation(&buffer.allocation, offset, data.len() as vk::DeviceSize)
            {
                log::error!("failed to flush buffer '{}': {e}", buffer.debug_name);
            }
        }
    }

    fn read_mapped(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, dst: &mut [u8]) {
        let buffers = self.buffers.borrow();
        let buffer = &buffers[buffer];
        let src = Self::mapped_ptr(buffer);
        unsafe {
            if let Err(e) =
                self.allocator.invalidate_allocation(&buffer.allocation, offset, dst.len() as vk::DeviceSize)
            {
                log::error!("failed to invalidate buffer '{}': {e}", buffer.debug_name);
            }
            ptr::copy_nonoverlapping(src.add(offset as usize), dst.as_mut_ptr(), dst.len());
        }
    }

    fn upload(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) -> Result<(), GfxError> {
        let _span = tracy_client::span!("VulkanBackend::upload");

        let (dst, debug_name) = {
            let buffers = self.buffers.borrow();
            let dst = buffers.get(buffer).ok_or(GfxError::InvalidHandle("buffer"))?;
            (dst.handle, dst.debug_name.clone())
        };

        let stage_buffer = self.allocate_buffer(&GfxBufferDesc {
            size: data.len() as vk::DeviceSize,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: GfxMemoryLocation::HostVisible,
            debug_name: format!("{debug_name}-stage-buffer"),
        })?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), Self::mapped_ptr(&stage_buffer), data.len());
            if let Err(e) = self.allocator.flush_allocation(&stage_buffer.allocation, 0, data.len() as vk::DeviceSize) {
                self.release_buffer(stage_buffer);
                return Err(e.into());
            }
        }

        let result = self.one_time_exec(|cmd| unsafe {
            self.device.cmd_copy_buffer(
                cmd,
                stage_buffer.handle,
                dst,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: offset,
                    size: data.len() as vk::DeviceSize,
                }],
            );
        });
        self.release_buffer(stage_buffer);
        result
    }

    fn copy_buffer(&self, src: GfxBufferHandle, dst: GfxBufferHandle, size: vk::DeviceSize) -> Result<(), GfxError> {
        let buffers = self.buffers.borrow();
        let src = buffers.get(src).ok_or(GfxError::InvalidHandle("buffer"))?;
        let dst = buffers.get(dst).ok_or(GfxError::InvalidHandle("buffer"))?;

        // 都是映射的 buffer 时直接在 CPU 侧复制
        if let (Some(src_ptr), Some(dst_ptr)) = (src.map_ptr, dst.map_ptr) {
            unsafe {
                ptr::copy_nonoverlapping(src_ptr, dst_ptr, size as usize);
                self.allocator.flush_allocation(&dst.allocation, 0, size)?;
            }
            return Ok(());
        }

        let (src, dst) = (src.handle, dst.handle);
        drop(buffers);
        self.one_time_exec(|cmd| unsafe {
            self.device.cmd_copy_buffer(
                cmd,
                src,
                dst,
                &[vk::BufferCopy {
                    size,
                    ..Default::default()
                }],
            );
        })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[GfxDescriptorBinding],
    ) -> Result<GfxDescriptorSetLayoutHandle, GfxError> {
        let vk_bindings = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stage_flags)
            })
            .collect_vec();
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_ci, None)? };
        Ok(self.set_layouts.borrow_mut().insert(layout))
    }

    fn destroy_descriptor_set_layout(&self, layout: GfxDescriptorSetLayoutHandle) {
        if let Some(layout) = self.set_layouts.borrow_mut().remove(layout) {
            unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<GfxDescriptorPoolHandle, GfxError> {
        let pool_ci = vk::DescriptorPoolCreateInfo::default().max_sets(max_sets).pool_sizes(pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_ci, None)? };
        Ok(self.pools.borrow_mut().insert(pool))
    }

    fn destroy_descriptor_pool(&self, pool: GfxDescriptorPoolHandle) {
        if let Some(vk_pool) = self.pools.borrow_mut().remove(pool) {
            self.sets.borrow_mut().retain(|_, set| set.pool != pool);
            unsafe { self.device.destroy_descriptor_pool(vk_pool, None) };
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: GfxDescriptorPoolHandle,
        layout: GfxDescriptorSetLayoutHandle,
    ) -> Result<GfxDescriptorSetHandle, GfxError> {
        let vk_pool = *self.pools.borrow().get(pool).ok_or(GfxError::InvalidHandle("descriptor pool"))?;
        let vk_layout =
            *self.set_layouts.borrow().get(layout).ok_or(GfxError::InvalidHandle("descriptor set layout"))?;

        let layouts = [vk_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk_pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };

        Ok(self.sets.borrow_mut().insert(VulkanDescriptorSet {
            handle: sets[0],
            pool,
        }))
    }

    fn write_buffer_descriptors(&self, writes: &[GfxBufferDescriptorWrite]) {
        let buffers = self.buffers.borrow();
        let sets = self.sets.borrow();

        let buffer_infos = writes
            .iter()
            .map(|w| {
                [vk::DescriptorBufferInfo {
                    buffer: buffers[w.buffer].handle,
                    offset: w.offset,
                    range: w.range,
                }]
            })
            .collect_vec();
        let vk_writes = writes
            .iter()
            .zip(&buffer_infos)
            .map(|(w, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(sets[w.set].handle)
                    .dst_binding(w.binding)
                    .dst_array_element(w.array_element)
                    .descriptor_type(w.descriptor_type)
                    .buffer_info(info)
            })
            .collect_vec();

        unsafe {
            self.device.update_descriptor_sets(&vk_writes, &[]);
        }
    }

    fn vk_descriptor_set(&self, set: GfxDescriptorSetHandle) -> vk::DescriptorSet {
        self.sets.borrow()[set].handle
    }
}
