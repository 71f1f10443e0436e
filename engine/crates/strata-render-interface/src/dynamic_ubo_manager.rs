use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use slotmap::{SlotMap, new_key_type};
use strata_gfx::{
    GfxBackend, GfxBufferDescriptorWrite, GfxBufferHandle, GfxDescriptorBinding, GfxDescriptorSetHandle,
    GfxDescriptorSetLayout, GfxError,
};
use strata_layout::{FieldAccess, LayoutDescriptor, LayoutRules, round_up};

use crate::descriptor_cache::{BindingFingerprint, BindingKey, DescriptorSetCache};
use crate::descriptor_pool::ExpandableDescriptorPool;
use crate::settings::EngineSettings;
use crate::static_ubo::checked_dynamic_offset;
use crate::ubo_arena::{UboArena, UboArenaState};

new_key_type! { pub struct DescriptorSetInfoHandle; }

/// descriptor set 中的一个 dynamic uniform buffer
#[derive(Clone, Debug)]
pub struct DynamicUboBinding {
    pub name: String,
    pub layout: LayoutDescriptor,
    pub stages: vk::ShaderStageFlags,
}
impl DynamicUboBinding {
    pub fn new(name: impl Into<String>, layout: LayoutDescriptor, stages: vk::ShaderStageFlags) -> Self {
        Self {
            name: name.into(),
            layout,
            stages,
        }
    }
}

/// 一个 descriptor set 的声明，binding 序号就是在列表中的位置
#[derive(Clone, Debug, Default)]
pub struct DynamicUboSetDesc {
    pub bindings: Vec<DynamicUboBinding>,
}
impl DynamicUboSetDesc {
    pub fn with_binding(mut self, name: impl Into<String>, layout: LayoutDescriptor, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(DynamicUboBinding::new(name, layout, stages));
        self
    }
}

/// 一个 UBO 在 arena 中占据的区域
#[derive(Clone, Debug)]
pub struct UboSlot {
    pub name: String,
    pub layout: LayoutDescriptor,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// add_descriptor_set 的结果：共享的 descriptor set 加上各个 UBO 独占的 arena 区域
pub struct DescriptorSetInfo {
    fingerprint: BindingFingerprint,
    set: GfxDescriptorSetHandle,
    ubos: Vec<UboSlot>,
}
impl DescriptorSetInfo {
    #[inline]
    pub fn fingerprint(&self) -> &BindingFingerprint {
        &self.fingerprint
    }

    #[inline]
    pub fn descriptor_set(&self) -> GfxDescriptorSetHandle {
        self.set
    }

    #[inline]
    pub fn ubos(&self) -> &[UboSlot] {
        &self.ubos
    }

    /// vkCmdBindDescriptorSets 需要的 dynamic offsets，按照 binding 顺序排列
    pub fn dynamic_offsets(&self) -> Vec<u32> {
        self.ubos
            .iter()
            .map(|ubo| checked_dynamic_offset(ubo.offset, &ubo.name))
            .collect()
    }

    fn ubo(&self, ubo_name: &str) -> &UboSlot {
        match self.ubos.iter().find(|ubo| ubo.name == ubo_name) {
            Some(ubo) => ubo,
            None => panic!(
                "ubo '{ubo_name}' does not exist in this descriptor set, available: [{}]",
                self.ubos.iter().map(|ubo| ubo.name.as_str()).join(", ")
            ),
        }
    }
}

/// 被缓存的 descriptor set，所有 binding 都指向 arena 的 buffer，位置由 dynamic offset 决定
struct CachedDescriptorSet {
    set: GfxDescriptorSetHandle,
    _layout: GfxDescriptorSetLayout,
    binding_sizes: Vec<vk::DeviceSize>,
}
impl CachedDescriptorSet {
    fn descriptor_writes(&self, buffer: GfxBufferHandle) -> impl Iterator<Item = GfxBufferDescriptorWrite> + '_ {
        self.binding_sizes
            .iter()
            .enumerate()
            .map(move |(binding, size)| GfxBufferDescriptorWrite {
                set: self.set,
                binding: binding as u32,
                array_element: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                buffer,
                offset: 0,
                range: *size,
            })
    }
}

/// 所有 dynamic uniform buffer 共用一个可增长的 arena
///
/// - 结构相同的声明共享同一个 descriptor set，每次声明在 arena 中占据独立的区域
/// - arena 扩容之后，所有缓存的 descriptor set 都会立即重新绑定到新的 buffer
pub struct DynamicUboManager {
    backend: Rc<dyn GfxBackend>,

    // drop 顺序：arena -> pool（同时释放 set）-> set layouts
    arena: UboArena,
    pool: ExpandableDescriptorPool,
    set_cache: DescriptorSetCache<CachedDescriptorSet>,

    desc_infos: SlotMap<DescriptorSetInfoHandle, DescriptorSetInfo>,
    rebind_count: u32,
}
impl Drop for DynamicUboManager {
    fn drop(&mut self) {
        log::info!(
            "Destroying DynamicUboManager: {} descriptor set infos, {} cached descriptor sets, rebind {} times",
            self.desc_infos.len(),
            self.set_cache.len(),
            self.rebind_count
        );
    }
}
// new & init
impl DynamicUboManager {
    pub fn new(backend: Rc<dyn GfxBackend>, settings: &EngineSettings) -> Result<Self, GfxError> {
        let alignment = backend.limits().min_uniform_buffer_offset_alignment;
        let arena = UboArena::new(
            backend.clone(),
            settings.arena.initial_capacity,
            alignment,
            settings.frames_in_flight,
            "dynamic-ubo-arena",
        )?;
        let pool = ExpandableDescriptorPool::new(
            backend.clone(),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            &settings.descriptor_pool,
        )?;

        Ok(Self {
            backend,
            arena,
            pool,
            set_cache: DescriptorSetCache::new(),
            desc_infos: SlotMap::with_key(),
            rebind_count: 0,
        })
    }

    fn create_cached_set(
        backend: &Rc<dyn GfxBackend>,
        pool: &mut ExpandableDescriptorPool,
        desc: &DynamicUboSetDesc,
        binding_sizes: &[vk::DeviceSize],
    ) -> Result<CachedDescriptorSet, GfxError> {
        let bindings = desc
            .bindings
            .iter()
            .enumerate()
            .map(|(binding, ubo)| GfxDescriptorBinding {
                binding: binding as u32,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                count: 1,
                stage_flags: ubo.stages,
            })
            .collect_vec();
        let layout = GfxDescriptorSetLayout::new(backend.clone(), bindings)?;

        let Some(set) = pool.allocate(&layout)? else {
            unreachable!("dynamic ubo set layouts only contain UNIFORM_BUFFER_DYNAMIC bindings");
        };
        Ok(CachedDescriptorSet {
            set,
            _layout: layout,
            binding_sizes: binding_sizes.to_vec(),
        })
    }
}
// getter
impl DynamicUboManager {
    #[inline]
    pub fn arena(&self) -> &UboArena {
        &self.arena
    }

    #[inline]
    pub fn pool(&self) -> &ExpandableDescriptorPool {
        &self.pool
    }

    /// 不同结构的 descriptor set 数量
    #[inline]
    pub fn cached_set_count(&self) -> usize {
        self.set_cache.len()
    }

    #[inline]
    pub fn rebind_count(&self) -> u32 {
        self.rebind_count
    }

    #[inline]
    pub fn descriptor_set_info(&self, handle: DescriptorSetInfoHandle) -> Option<&DescriptorSetInfo> {
        self.desc_infos.get(handle)
    }

    #[inline]
    pub fn descriptor_set(&self, handle: DescriptorSetInfoHandle) -> GfxDescriptorSetHandle {
        self.info(handle).set
    }

    #[inline]
    pub fn vk_descriptor_set(&self, handle: DescriptorSetInfoHandle) -> vk::DescriptorSet {
        self.backend.vk_descriptor_set(self.info(handle).set)
    }

    #[inline]
    pub fn dynamic_offsets(&self, handle: DescriptorSetInfoHandle) -> Vec<u32> {
        self.info(handle).dynamic_offsets()
    }

    fn info(&self, handle: DescriptorSetInfoHandle) -> &DescriptorSetInfo {
        match self.desc_infos.get(handle) {
            Some(info) => info,
            None => panic!("invalid DescriptorSetInfoHandle {handle:?}"),
        }
    }
}
// Descriptor Set API
impl DynamicUboManager {
    /// 为 desc 中的每个 UBO 在 arena 中分配空间，并返回可以共享的 descriptor set
    ///
    /// 如果 arena 因此扩容，会在返回之前重新绑定所有缓存的 descriptor set
    pub fn add_descriptor_set(&mut self, desc: &DynamicUboSetDesc) -> Result<DescriptorSetInfoHandle, GfxError> {
        let _span = tracy_client::span!("DynamicUboManager::add_descriptor_set");
        assert!(!desc.bindings.is_empty(), "descriptor set declaration has no bindings");
        assert!(
            desc.bindings.iter().map(|b| &b.name).unique().count() == desc.bindings.len(),
            "descriptor set declaration has duplicated ubo names"
        );

        let alignment = self.arena.alignment();
        let binding_sizes = desc
            .bindings
            .iter()
            .map(|ubo| {
                assert_eq!(ubo.layout.rules(), LayoutRules::Std140, "ubo '{}' must use std140", ubo.name);
                round_up(ubo.layout.padded_size(), alignment)
            })
            .collect_vec();
        let fingerprint = BindingFingerprint::new(
            desc.bindings
                .iter()
                .zip(&binding_sizes)
                .map(|(ubo, size)| BindingKey {
                    name: ubo.name.clone(),
                    size: *size,
                    field_offsets: ubo.layout.field_offsets(),
                    stages: ubo.stages,
                })
                .collect(),
        );

        let backend = &self.backend;
        let pool = &mut self.pool;
        let set = self
            .set_cache
            .get_or_try_insert_with(fingerprint.clone(), |_| {
                Self::create_cached_set(backend, pool, desc, &binding_sizes)
            })?
            .set;

        // 整个 set 一次性分配：失败时 arena 保持不变
        let chunk = self.arena.claim(binding_sizes.iter().sum())?;
        let ubos = desc
            .bindings
            .iter()
            .zip(&binding_sizes)
            .scan(chunk.offset, |offset, (ubo, size)| {
                let slot = UboSlot {
                    name: ubo.name.clone(),
                    layout: ubo.layout.clone(),
                    offset: *offset,
                    size: *size,
                };
                *offset += size;
                Some(slot)
            })
            .collect_vec();

        if chunk.did_reallocate {
            self.rebind_all();
        } else {
            let buffer = self.arena.buffer_handle();
            if let Some(cached) = self.set_cache.get(&fingerprint) {
                let writes = cached.descriptor_writes(buffer).collect_vec();
                self.backend.write_buffer_descriptors(&writes);
            }
        }

        Ok(self.desc_infos.insert(DescriptorSetInfo { fingerprint, set, ubos }))
    }

    /// 将所有缓存的 descriptor set 重新绑定到 arena 当前的 buffer
    pub fn rebind_all(&mut self) {
        let _span = tracy_client::span!("DynamicUboManager::rebind_all");

        let buffer = self.arena.buffer_handle();
        let writes = self
            .set_cache
            .values()
            .flat_map(|cached| cached.descriptor_writes(buffer))
            .collect_vec();
        self.backend.write_buffer_descriptors(&writes);

        self.arena.finish_growth();
        self.rebind_count += 1;
        log::debug!(
            "rebind {} descriptor sets ({} bindings) to the new arena buffer",
            self.set_cache.len(),
            writes.len()
        );
    }

    /// 销毁已经不再被 GPU 使用的旧 arena buffer
    #[inline]
    pub fn cleanup(&mut self, current_frame_id: u64) {
        self.arena.cleanup(current_frame_id);
    }
}
// Write API
impl DynamicUboManager {
    /// 写入第 binding 个 UBO 的完整内容
    ///
    /// data 通常是 CPU 侧对应的 `#[repr(C)]` 结构体，可以比对齐之后的大小短
    pub fn copy_to_ubo(&self, handle: DescriptorSetInfoHandle, binding: usize, data: &[u8]) {
        let info = self.info(handle);
        assert!(binding < info.ubos.len(), "binding {binding} is out of range ({} ubos)", info.ubos.len());
        let ubo = &info.ubos[binding];
        assert!(
            data.len() as vk::DeviceSize <= ubo.size,
            "ubo '{}' is {} bytes, got {} bytes",
            ubo.name,
            ubo.size,
            data.len()
        );
        self.write_arena(ubo.offset, data);
    }

    /// 写入某个 UBO 中 access 指向的字段
    pub fn set(&self, handle: DescriptorSetInfoHandle, ubo_name: &str, access: &FieldAccess, data: &[u8]) {
        let ubo = self.info(handle).ubo(ubo_name);
        let range = ubo.layout.resolve(access);
        assert!(
            data.len() as vk::DeviceSize <= range.size,
            "'{ubo_name}.{access}' is {} bytes, got {} bytes",
            range.size,
            data.len()
        );
        self.write_arena(ubo.offset + range.offset, data);
    }

    /// 通过字段路径写入，例如 `set_value(handle, "light", "color", ..)`、`"faces[2]"`
    pub fn set_value(&self, handle: DescriptorSetInfoHandle, ubo_name: &str, field_path: &str, data: &[u8]) {
        let access = match FieldAccess::parse(field_path) {
            Ok(access) => access,
            Err(e) => panic!("DynamicUboManager::set_value: {e}"),
        };
        self.set(handle, ubo_name, &access, data);
    }

    #[inline]
    pub fn set_pod<T: bytemuck::Pod>(
        &self,
        handle: DescriptorSetInfoHandle,
        ubo_name: &str,
        access: &FieldAccess,
        value: &T,
    ) {
        self.set(handle, ubo_name, access, bytemuck::bytes_of(value));
    }

    /// 读回某个 UBO 的内容
    pub fn read_ubo(&self, handle: DescriptorSetInfoHandle, ubo_name: &str) -> Vec<u8> {
        let ubo = self.info(handle).ubo(ubo_name);
        self.arena.read(ubo.offset, ubo.size as usize)
    }

    fn write_arena(&self, offset: vk::DeviceSize, data: &[u8]) {
        debug_assert_eq!(self.arena.state(), UboArenaState::Stable);
        self.arena.write(offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_gfx::{GfxLimits, HostBackend};
    use strata_layout::PrimitiveKind::*;

    fn host() -> (Rc<HostBackend>, Rc<dyn GfxBackend>) {
        let host = Rc::new(HostBackend::default());
        let backend: Rc<dyn GfxBackend> = host.clone();
        (host, backend)
    }

    fn frame_ubo() -> LayoutDescriptor {
        LayoutDescriptor::std140().with(Mat4, "projectView")
    }

    fn light_ubo() -> LayoutDescriptor {
        LayoutDescriptor::std140()
            .with(Float, "intensity")
            .with(Vec3, "color")
            .with(Vec3, "direction")
    }

    fn frame_set(name: &str) -> DynamicUboSetDesc {
        DynamicUboSetDesc::default().with_binding(name, frame_ubo(), vk::ShaderStageFlags::VERTEX)
    }

    #[test]
    fn test_identical_declarations_share_descriptor_set() {
        let (_host, backend) = host();
        let mut manager = DynamicUboManager::new(backend, &EngineSettings::default()).unwrap();

        let a = manager.add_descriptor_set(&frame_set("frame")).unwrap();
        let b = manager.add_descriptor_set(&frame_set("frame")).unwrap();
        assert_eq!(manager.descriptor_set(a), manager.descriptor_set(b));
        assert_eq!(manager.cached_set_count(), 1);
        // 各自独占 arena 中的区域
        assert_eq!(manager.dynamic_offsets(a), vec![0]);
        assert_eq!(manager.dynamic_offsets(b), vec![64]);

        let fragment = DynamicUboSetDesc::default().with_binding(
            "frame",
            frame_ubo(),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        );
        let c = manager.add_descriptor_set(&fragment).unwrap();
        assert_ne!(manager.descriptor_set(a), manager.descriptor_set(c));
        assert_eq!(manager.cached_set_count(), 2);
    }

    #[test]
    fn test_binding_sizes_are_aligned() {
        let (_host, backend) = host();
        let mut manager = DynamicUboManager::new(backend, &EngineSettings::default()).unwrap();

        let desc = DynamicUboSetDesc::default()
            .with_binding("frame", frame_ubo(), vk::ShaderStageFlags::VERTEX)
            .with_binding("light", light_ubo(), vk::ShaderStageFlags::FRAGMENT);
        let handle = manager.add_descriptor_set(&desc).unwrap();

        let info = manager.descriptor_set_info(handle).unwrap();
        // light: 44 -> 48 -> 按 64 对齐
        assert_eq!(info.ubos()[1].size, 64);
        assert_eq!(info.dynamic_offsets(), vec![0, 64]);
    }

    #[test]
    fn test_growth_rebinds_every_cached_set() {
        let (host, backend) = host();
        let mut manager = DynamicUboManager::new(backend, &EngineSettings::default()).unwrap();

        let handles = (0..4)
            .map(|i| manager.add_descriptor_set(&frame_set(&format!("frame{i}"))).unwrap())
            .collect_vec();
        assert_eq!(manager.arena().capacity_total(), 256);
        assert_eq!(manager.rebind_count(), 0);

        let view = glam::Mat4::from_scale(glam::Vec3::splat(2.0));
        manager.set_pod(handles[1], "frame1", &FieldAccess::new().field("projectView"), &view);
        let old_buffer = manager.arena().buffer_handle();

        let fifth = manager.add_descriptor_set(&frame_set("frame4")).unwrap();
        assert_eq!(manager.rebind_count(), 1);
        assert_eq!(manager.arena().capacity_total(), 512);
        assert_eq!(manager.arena().state(), UboArenaState::Stable);

        let new_buffer = manager.arena().buffer_handle();
        assert_ne!(new_buffer, old_buffer);
        for handle in handles.iter().chain([&fifth]) {
            let set = manager.descriptor_set(*handle);
            assert_eq!(host.bound_buffer(set, 0, 0), Some((new_buffer, 0, 64)));
        }

        // 扩容前写入的数据依然存在
        assert_eq!(manager.read_ubo(handles[1], "frame1"), bytemuck::bytes_of(&view));
    }

    #[test]
    fn test_failed_growth_leaves_arena_untouched() {
        // 256 + 512 刚好用完，第二次扩容到 1024 会失败
        let host = Rc::new(HostBackend::with_memory_budget(GfxLimits::default(), 768));
        let mut manager = DynamicUboManager::new(host, &EngineSettings::default()).unwrap();
        let desc = DynamicUboSetDesc::default()
            .with_binding("frame", frame_ubo(), vk::ShaderStageFlags::VERTEX)
            .with_binding("light", light_ubo(), vk::ShaderStageFlags::FRAGMENT);

        let handles = (0..4).map(|_| manager.add_descriptor_set(&desc).unwrap()).collect_vec();
        assert_eq!(manager.arena().capacity_total(), 512);
        assert_eq!(manager.arena().capacity_in_use(), 512);
        assert_eq!(manager.rebind_count(), 1);

        assert_eq!(manager.add_descriptor_set(&desc), Err(GfxError::OutOfDeviceMemory));
        assert_eq!(manager.arena().capacity_in_use(), 512);
        assert_eq!(manager.arena().growth_count(), 1);
        assert_eq!(manager.arena().state(), UboArenaState::Stable);
        assert_eq!(manager.rebind_count(), 1);

        // 已有的 UBO 依然可以读写
        manager.set_value(handles[3], "light", "intensity", bytemuck::bytes_of(&2.0_f32));
        assert_eq!(&manager.read_ubo(handles[3], "light")[0..4], bytemuck::bytes_of(&2.0_f32));
        assert_eq!(manager.dynamic_offsets(handles[3]), vec![384, 448]);
    }

    #[test]
    fn test_set_value_by_path() {
        let (_host, backend) = host();
        let mut manager = DynamicUboManager::new(backend, &EngineSettings::default()).unwrap();
        let desc = DynamicUboSetDesc::default()
            .with_binding("frame", frame_ubo(), vk::ShaderStageFlags::VERTEX)
            .with_binding("light", light_ubo(), vk::ShaderStageFlags::FRAGMENT);
        let handle = manager.add_descriptor_set(&desc).unwrap();

        let direction = glam::Vec3::new(0.0, -1.0, 0.0);
        manager.set_value(handle, "light", "direction", bytemuck::bytes_of(&direction));
        manager.set_value(handle, "light", "intensity", bytemuck::bytes_of(&3.0_f32));

        let light = manager.read_ubo(handle, "light");
        assert_eq!(&light[32..44], bytemuck::bytes_of(&direction));
        assert_eq!(&light[0..4], bytemuck::bytes_of(&3.0_f32));
    }

    #[test]
    fn test_copy_to_ubo() {
        let (_host, backend) = host();
        let mut manager = DynamicUboManager::new(backend, &EngineSettings::default()).unwrap();
        let handle = manager.add_descriptor_set(&frame_set("frame")).unwrap();

        let view = glam::Mat4::IDENTITY;
        manager.copy_to_ubo(handle, 0, bytemuck::bytes_of(&view));
        assert_eq!(manager.read_ubo(handle, "frame"), bytemuck::bytes_of(&view));
    }

    #[test]
    #[should_panic(expected = "does not exist in this descriptor set")]
    fn test_unknown_ubo_name_panics() {
        let (_host, backend) = host();
        let mut manager = DynamicUboManager::new(backend, &EngineSettings::default()).unwrap();
        let handle = manager.add_descriptor_set(&frame_set("frame")).unwrap();
        manager.set_value(handle, "camera", "projectView", &[0; 64]);
    }

    #[test]
    #[should_panic(expected = "got 128 bytes")]
    fn test_copy_to_ubo_rejects_oversized_data() {
        let (_host, backend) = host();
        let mut manager = DynamicUboManager::new(backend, &EngineSettings::default()).unwrap();
        let handle = manager.add_descriptor_set(&frame_set("frame")).unwrap();
        manager.copy_to_ubo(handle, 0, &[0; 128]);
    }

    #[test]
    fn test_pool_expands_with_many_layouts() {
        let (host, backend) = host();
        let mut manager = DynamicUboManager::new(backend, &EngineSettings::default()).unwrap();
        for i in 0..12 {
            manager.add_descriptor_set(&frame_set(&format!("pass{i}"))).unwrap();
        }
        assert_eq!(manager.cached_set_count(), 12);
        assert!(manager.pool().pool_count() > 1);
        assert_eq!(manager.pool().sets_granted(), 12);

        drop(manager);
        assert_eq!(host.live_pool_count(), 0);
        assert_eq!(host.live_set_layout_count(), 0);
    }
}
