use ash::vk;

use crate::error::GfxError;
use crate::handles::{GfxBufferHandle, GfxDescriptorPoolHandle, GfxDescriptorSetHandle, GfxDescriptorSetLayoutHandle};

/// 上层关心的设备限制
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxLimits {
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
}
impl Default for GfxLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 64,
            min_storage_buffer_offset_alignment: 16,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GfxMemoryLocation {
    /// 持久映射，CPU 可以直接写入
    HostVisible,
    /// 只能通过 stage buffer 传输
    DeviceLocal,
}

#[derive(Clone, Debug)]
pub struct GfxBufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: GfxMemoryLocation,
    pub debug_name: String,
}

/// descriptor set layout 中的一个 binding
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GfxDescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

/// 将 buffer 的一段写入到 descriptor set 的某个 binding
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxBufferDescriptorWrite {
    pub set: GfxDescriptorSetHandle,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: GfxBufferHandle,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

/// GPU 的边界
///
/// 所有原始的设备对象都由 backend 持有，上层只拿到 slotmap 句柄。
/// 以 `Rc<dyn GfxBackend>` 的形式注入到各个 buffer、arena 和 pool 中。
///
/// 句柄无效、写入未映射的 buffer、越界访问都属于调用方的错误，直接 panic；
/// 只有和设备交互时可能失败的操作才返回 [`GfxError`]。
pub trait GfxBackend {
    fn limits(&self) -> GfxLimits;

    // Buffer API
    fn create_buffer(&self, desc: &GfxBufferDesc) -> Result<GfxBufferHandle, GfxError>;
    fn destroy_buffer(&self, buffer: GfxBufferHandle);
    fn vk_buffer(&self, buffer: GfxBufferHandle) -> vk::Buffer;
    /// 写入持久映射的 buffer
    fn write_mapped(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]);
    fn read_mapped(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, dst: &mut [u8]);
    /// 通过临时的 stage buffer 写入，同步等待传输完成
    fn upload(&self, buffer: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) -> Result<(), GfxError>;
    /// 将 src 的前 size 个字节复制到 dst 的开头，同步等待完成
    fn copy_buffer(&self, src: GfxBufferHandle, dst: GfxBufferHandle, size: vk::DeviceSize) -> Result<(), GfxError>;

    // Descriptor API
    fn create_descriptor_set_layout(
        &self,
        bindings: &[GfxDescriptorBinding],
    ) -> Result<GfxDescriptorSetLayoutHandle, GfxError>;
    fn destroy_descriptor_set_layout(&self, layout: GfxDescriptorSetLayoutHandle);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<GfxDescriptorPoolHandle, GfxError>;
    /// 同时释放从该 pool 中分配的所有 descriptor set
    fn destroy_descriptor_pool(&self, pool: GfxDescriptorPoolHandle);
    fn allocate_descriptor_set(
        &self,
        pool: GfxDescriptorPoolHandle,
        layout: GfxDescriptorSetLayoutHandle,
    ) -> Result<GfxDescriptorSetHandle, GfxError>;
    fn write_buffer_descriptors(&self, writes: &[GfxBufferDescriptorWrite]);
    fn vk_descriptor_set(&self, set: GfxDescriptorSetHandle) -> vk::DescriptorSet;
}
