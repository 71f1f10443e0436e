use std::rc::Rc;

use ash::vk;
use strata_gfx::{GfxBackend, GfxError};
use strata_layout::FieldAccess;
use strata_render_interface::dynamic_ubo_manager::{DescriptorSetInfoHandle, DynamicUboManager, DynamicUboSetDesc};
use strata_render_interface::settings::EngineSettings;

use crate::scene_records;

#[derive(Copy, Clone, Debug)]
pub struct LightParams {
    pub intensity: f32,
    pub color: glam::Vec3,
    pub direction: glam::Vec3,
}
impl Default for LightParams {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            color: glam::Vec3::ONE,
            direction: glam::Vec3::NEG_Y,
        }
    }
}

/// 每个 pass 的相机与灯光 UBO，都放在同一个 dynamic ubo arena 中
pub struct FrameUbos {
    manager: DynamicUboManager,
    passes: Vec<DescriptorSetInfoHandle>,
}
// new & init
impl FrameUbos {
    pub fn new(backend: Rc<dyn GfxBackend>, settings: &EngineSettings) -> Result<Self, GfxError> {
        Ok(Self {
            manager: DynamicUboManager::new(backend, settings)?,
            passes: Vec::new(),
        })
    }

    fn pass_set_desc() -> DynamicUboSetDesc {
        DynamicUboSetDesc::default()
            .with_binding("frame", scene_records::frame_ubo(), vk::ShaderStageFlags::VERTEX)
            .with_binding("light", scene_records::light_ubo(), vk::ShaderStageFlags::FRAGMENT)
    }
}
// getter
impl FrameUbos {
    #[inline]
    pub fn manager(&self) -> &DynamicUboManager {
        &self.manager
    }

    #[inline]
    pub fn passes(&self) -> &[DescriptorSetInfoHandle] {
        &self.passes
    }
}
// tools
impl FrameUbos {
    /// 新增一个 pass，所有 pass 共享同一个 descriptor set，只有 dynamic offset 不同
    pub fn add_pass(&mut self) -> Result<DescriptorSetInfoHandle, GfxError> {
        let handle = self.manager.add_descriptor_set(&Self::pass_set_desc())?;
        self.passes.push(handle);
        log::info!(
            "pass {}: dynamic offsets {:?}, arena {} / {} bytes",
            self.passes.len() - 1,
            self.manager.dynamic_offsets(handle),
            self.manager.arena().capacity_in_use(),
            self.manager.arena().capacity_total()
        );
        Ok(handle)
    }

    pub fn update_pass(&self, pass: DescriptorSetInfoHandle, project_view: glam::Mat4, light: &LightParams) {
        self.manager.copy_to_ubo(pass, 0, bytemuck::bytes_of(&project_view));
        self.manager
            .set_pod(pass, "light", &FieldAccess::new().field("intensity"), &light.intensity);
        self.manager.set_value(pass, "light", "color", bytemuck::bytes_of(&light.color));
        self.manager
            .set_value(pass, "light", "direction", bytemuck::bytes_of(&light.direction));
    }

    /// 每帧开始时调用，销毁已经不再使用的旧 arena buffer
    #[inline]
    pub fn begin_frame(&mut self, frame_id: u64) {
        self.manager.cleanup(frame_id);
    }
}
