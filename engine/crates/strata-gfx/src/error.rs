use ash::vk;

/// 设备边界上可能出现的错误
///
/// 编程错误（越界写入、句柄类型不匹配）直接 panic，不会出现在这里
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxError {
    /// 申请 buffer 时显存/内存不足
    OutOfDeviceMemory,
    /// descriptor pool 中的 set 或者 descriptor 已经用完
    OutOfPoolMemory,
    /// 句柄已经被销毁
    InvalidHandle(&'static str),
    Vulkan(vk::Result),
}
impl std::fmt::Display for GfxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GfxError::OutOfDeviceMemory => write!(f, "out of device memory"),
            GfxError::OutOfPoolMemory => write!(f, "descriptor pool is exhausted"),
            GfxError::InvalidHandle(kind) => write!(f, "invalid {kind} handle"),
            GfxError::Vulkan(e) => write!(f, "vulkan error: {e}"),
        }
    }
}
impl std::error::Error for GfxError {}
impl From<vk::Result> for GfxError {
    fn from(value: vk::Result) -> Self {
        match value {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                GfxError::OutOfDeviceMemory
            }
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => GfxError::OutOfPoolMemory,
            other => GfxError::Vulkan(other),
        }
    }
}
