use std::rc::Rc;

use ash::vk;
use strata_gfx::{GfxBackend, GfxBuffer, GfxBufferHandle, GfxError};

/// 一次 claim 的结果
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArenaChunk {
    pub offset: vk::DeviceSize,
    /// 为 true 时 arena 已经换成了新的 buffer，之前所有的绑定都已经失效，需要重新绑定
    pub did_reallocate: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UboArenaState {
    Stable,
    /// 刚刚发生了扩容，依赖 arena 的绑定还没有重新绑定
    Growing,
}

/// 可增长的 uniform buffer arena
///
/// 只向后分配，不会回收单个 chunk。空间不足时容量翻倍，旧数据复制到新 buffer 的开头，
/// 因此已经分配出去的 offset 依然有效，但绑定需要指向新的 buffer。
///
/// 被替换下来的 buffer 会等待 frames_in_flight 帧之后再销毁，保证正在执行的命令不会访问到已经释放的内存。
pub struct UboArena {
    backend: Rc<dyn GfxBackend>,
    buffer: GfxBuffer,

    alignment: vk::DeviceSize,
    capacity_in_use: vk::DeviceSize,
    state: UboArenaState,
    growth_count: u32,

    frames_in_flight: u64,
    frame_id: u64,
    // (buffer, 被替换时的帧序号)
    retired_buffers: Vec<(GfxBuffer, u64)>,

    debug_name: String,
}
impl Drop for UboArena {
    fn drop(&mut self) {
        log::info!(
            "Destroying UboArena '{}': {} / {} bytes in use, grew {} times",
            self.debug_name,
            self.capacity_in_use,
            self.buffer.size(),
            self.growth_count
        );
    }
}
// new & init
impl UboArena {
    /// - alignment: 每次 claim 的大小都必须是它的整数倍，通常为 minUniformBufferOffsetAlignment
    pub fn new(
        backend: Rc<dyn GfxBackend>,
        initial_capacity: vk::DeviceSize,
        alignment: vk::DeviceSize,
        frames_in_flight: u64,
        debug_name: impl AsRef<str>,
    ) -> Result<Self, GfxError> {
        assert!(initial_capacity > 0, "UboArena initial capacity must be positive");
        assert!(alignment.is_power_of_two(), "UboArena alignment must be a power of two, got {alignment}");

        let debug_name = debug_name.as_ref().to_string();
        let buffer = Self::create_buffer(&backend, initial_capacity, &debug_name, 0)?;
        Ok(Self {
            backend,
            buffer,
            alignment,
            capacity_in_use: 0,
            state: UboArenaState::Stable,
            growth_count: 0,
            frames_in_flight,
            frame_id: 0,
            retired_buffers: Vec::new(),
            debug_name,
        })
    }

    fn create_buffer(
        backend: &Rc<dyn GfxBackend>,
        capacity: vk::DeviceSize,
        debug_name: &str,
        generation: u32,
    ) -> Result<GfxBuffer, GfxError> {
        GfxBuffer::new_uniform(
            backend.clone(),
            capacity,
            vk::BufferUsageFlags::empty(),
            format!("{debug_name}-{generation}"),
        )
    }
}
// getter
impl UboArena {
    #[inline]
    pub fn buffer(&self) -> &GfxBuffer {
        &self.buffer
    }

    #[inline]
    pub fn buffer_handle(&self) -> GfxBufferHandle {
        self.buffer.handle()
    }

    #[inline]
    pub fn alignment(&self) -> vk::DeviceSize {
        self.alignment
    }

    #[inline]
    pub fn capacity_in_use(&self) -> vk::DeviceSize {
        self.capacity_in_use
    }

    #[inline]
    pub fn capacity_total(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    #[inline]
    pub fn state(&self) -> UboArenaState {
        self.state
    }

    #[inline]
    pub fn growth_count(&self) -> u32 {
        self.growth_count
    }

    /// 已经被替换、等待销毁的 buffer 数量
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.retired_buffers.len()
    }
}
// Arena API
impl UboArena {
    /// 分配 size 字节
    ///
    /// # Panics
    /// size 不是 alignment 的整数倍
    pub fn claim(&mut self, size: vk::DeviceSize) -> Result<ArenaChunk, GfxError> {
        assert!(
            size % self.alignment == 0,
            "UboArena '{}': claim of {size} bytes is not a multiple of the alignment {}",
            self.debug_name,
            self.alignment
        );

        let offset = self.capacity_in_use;
        let required = offset + size;
        let did_reallocate = required > self.capacity_total();
        if did_reallocate {
            self.grow(required)?;
        }

        self.capacity_in_use = required;
        Ok(ArenaChunk { offset, did_reallocate })
    }

    /// 重新绑定完成之后调用
    #[inline]
    pub fn finish_growth(&mut self) {
        self.state = UboArenaState::Stable;
    }

    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) {
        assert_eq!(
            self.state,
            UboArenaState::Stable,
            "UboArena '{}' was reallocated and its bindings have not been rebuilt",
            self.debug_name
        );
        assert!(
            offset + data.len() as vk::DeviceSize <= self.capacity_in_use,
            "UboArena '{}': write of {} bytes at {offset} exceeds the claimed {} bytes",
            self.debug_name,
            data.len(),
            self.capacity_in_use
        );
        self.buffer.write(offset, data);
    }

    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> Vec<u8> {
        self.buffer.read(offset, len)
    }

    /// 销毁已经不会再被 GPU 访问的旧 buffer
    pub fn cleanup(&mut self, current_frame_id: u64) {
        self.frame_id = current_frame_id;
        let fif = self.frames_in_flight;
        self.retired_buffers
            .retain(|(_, frame_id)| *frame_id + fif > current_frame_id);
    }

    fn grow(&mut self, required: vk::DeviceSize) -> Result<(), GfxError> {
        let _span = tracy_client::span!("UboArena::grow");

        let old_capacity = self.capacity_total();
        let mut new_capacity = old_capacity;
        while new_capacity < required {
            new_capacity *= 2;
        }

        let new_buffer = Self::create_buffer(&self.backend, new_capacity, &self.debug_name, self.growth_count + 1)?;
        new_buffer.copy_from(&self.buffer, old_capacity)?;

        let old_buffer = std::mem::replace(&mut self.buffer, new_buffer);
        self.retired_buffers.push((old_buffer, self.frame_id));
        self.growth_count += 1;
        self.state = UboArenaState::Growing;

        log::info!(
            "UboArena '{}' grow: {} -> {} bytes (required {})",
            self.debug_name,
            old_capacity,
            new_capacity,
            required
        );
        Ok(())
    }
}
