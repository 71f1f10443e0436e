pub mod backend;
pub mod buffer;
pub mod descriptor;
pub mod error;
pub mod handles;
pub mod host;
pub mod vulkan;

pub use backend::{
    GfxBackend, GfxBufferDesc, GfxBufferDescriptorWrite, GfxDescriptorBinding, GfxLimits, GfxMemoryLocation,
};
pub use buffer::GfxBuffer;
pub use descriptor::GfxDescriptorSetLayout;
pub use error::GfxError;
pub use handles::{GfxBufferHandle, GfxDescriptorPoolHandle, GfxDescriptorSetHandle, GfxDescriptorSetLayoutHandle};
pub use host::HostBackend;
pub use vulkan::VulkanBackend;
