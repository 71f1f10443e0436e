use std::rc::Rc;

use ash::vk;

use crate::backend::{GfxBackend, GfxBufferDesc, GfxMemoryLocation};
use crate::error::GfxError;
use crate::handles::GfxBufferHandle;

/// 拥有一个 backend buffer，drop 时销毁
pub struct GfxBuffer {
    backend: Rc<dyn GfxBackend>,
    handle: GfxBufferHandle,

    size: vk::DeviceSize,

    debug_name: String,
}
impl Drop for GfxBuffer {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.handle);
    }
}
// new & init
impl GfxBuffer {
    pub fn new(backend: Rc<dyn GfxBackend>, desc: GfxBufferDesc) -> Result<Self, GfxError> {
        let handle = backend.create_buffer(&desc)?;
        Ok(Self {
            backend,
            handle,
            size: desc.size,
            debug_name: desc.debug_name,
        })
    }

    /// 持久映射的 uniform buffer
    #[inline]
    pub fn new_uniform(
        backend: Rc<dyn GfxBackend>,
        size: vk::DeviceSize,
        extra_usage: vk::BufferUsageFlags,
        debug_name: impl AsRef<str>,
    ) -> Result<Self, GfxError> {
        Self::new(
            backend,
            GfxBufferDesc {
                size,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER | extra_usage,
                location: GfxMemoryLocation::HostVisible,
                debug_name: debug_name.as_ref().to_string(),
            },
        )
    }
}
// getter
impl GfxBuffer {
    #[inline]
    pub fn handle(&self) -> GfxBufferHandle {
        self.handle
    }

    #[inline]
    pub fn vk_buffer(&self) -> vk::Buffer {
        self.backend.vk_buffer(self.handle)
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}
// tools
impl GfxBuffer {
    /// 通过 mem map 的方式写入
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) {
        self.check_range(offset, data.len());
        self.backend.write_mapped(self.handle, offset, data);
    }

    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> Vec<u8> {
        self.check_range(offset, len);
        let mut bytes = vec![0; len];
        self.backend.read_mapped(self.handle, offset, &mut bytes);
        bytes
    }

    /// 通过 stage buffer 写入，会阻塞直到传输完成
    pub fn upload(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<(), GfxError> {
        self.check_range(offset, data.len());
        self.backend.upload(self.handle, offset, data)
    }

    /// 将 src 的前 size 个字节复制到 self 的开头
    pub fn copy_from(&self, src: &GfxBuffer, size: vk::DeviceSize) -> Result<(), GfxError> {
        assert!(
            size <= src.size && size <= self.size,
            "GfxBuffer::copy_from: {size} bytes from '{}' ({}) into '{}' ({})",
            src.debug_name,
            src.size,
            self.debug_name,
            self.size
        );
        self.backend.copy_buffer(src.handle, self.handle, size)
    }

    #[inline]
    fn check_range(&self, offset: vk::DeviceSize, len: usize) {
        assert!(
            offset + len as vk::DeviceSize <= self.size,
            "buffer '{}' overflow: offset {offset} + {len} bytes > size {}",
            self.debug_name,
            self.size
        );
    }
}
