use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use strata_gfx::{
    GfxBackend, GfxBufferDescriptorWrite, GfxDescriptorBinding, GfxDescriptorSetHandle, GfxDescriptorSetLayout,
    GfxError,
};
use strata_layout::FieldAccess;
use strata_render_interface::descriptor_pool::TrivialDescriptorPool;
use strata_render_interface::static_ubo::{StaticUbo, StaticUboArray};
use strata_render_interface::storage_array::{FieldWrite, RecordWrite, StorageRecordArray};

use crate::scene_records::{self, DrawIndexedCommand};

/// 场景中的一个物体
#[derive(Clone, Debug)]
pub struct SceneObject {
    pub model: glam::Mat4,
    pub material_id: i32,
    pub mesh_id: u32,
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub bounds_min: glam::Vec3,
    pub bounds_max: glam::Vec3,
}

/// 场景的所有 buffer，以及引用它们的 descriptor set
///
/// binding 顺序：
/// 0. ObjectUBO[max_objects]
/// 1. MaterialUBO
/// 2. FrustumUBO
/// 3. DrawCommand[]
/// 4. DrawCount
/// 5. ObjectData[]
/// 6. AABB[]
pub struct SceneBuffers {
    backend: Rc<dyn GfxBackend>,

    objects: StaticUboArray,
    material: StaticUbo,
    frustum: StaticUbo,

    draw_commands: StorageRecordArray,
    draw_count: StorageRecordArray,
    object_data: StorageRecordArray,
    aabbs: StorageRecordArray,

    // pool 需要先于 layout 销毁
    descriptor_pool: TrivialDescriptorPool,
    set_layout: GfxDescriptorSetLayout,
    descriptor_set: GfxDescriptorSetHandle,

    object_count: u32,
}
// new & init
impl SceneBuffers {
    pub fn new(backend: Rc<dyn GfxBackend>, max_objects: u32) -> Result<Self, GfxError> {
        let ubo_alignment = backend.limits().min_uniform_buffer_offset_alignment;

        let objects =
            StaticUboArray::new(backend.clone(), &scene_records::object_ubo(), max_objects, ubo_alignment, "objects")?;
        let material = StaticUbo::new(backend.clone(), &scene_records::material_ubo(), "material")?;
        let frustum = StaticUbo::new(backend.clone(), &scene_records::frustum_ubo(), "frustum")?;

        let draw_commands = StorageRecordArray::new(
            backend.clone(),
            &scene_records::draw_command(),
            max_objects,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            "draw-commands",
        )?;
        let draw_count = StorageRecordArray::new(
            backend.clone(),
            &scene_records::draw_count(),
            1,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            "draw-count",
        )?;
        let object_data = StorageRecordArray::new(
            backend.clone(),
            &scene_records::object_data(),
            max_objects,
            vk::BufferUsageFlags::empty(),
            "object-data",
        )?;
        let aabbs = StorageRecordArray::new(
            backend.clone(),
            &scene_records::aabb(),
            max_objects,
            vk::BufferUsageFlags::empty(),
            "aabbs",
        )?;

        let set_layout = GfxDescriptorSetLayout::new(backend.clone(), Self::bindings(max_objects))?;
        let mut descriptor_pool = TrivialDescriptorPool::new(backend.clone());
        let Some(descriptor_set) = descriptor_pool.allocate(&set_layout)? else {
            unreachable!("scene set layout is never empty");
        };

        let scene = Self {
            backend,
            objects,
            material,
            frustum,
            draw_commands,
            draw_count,
            object_data,
            aabbs,
            descriptor_pool,
            set_layout,
            descriptor_set,
            object_count: 0,
        };
        scene.backend.write_buffer_descriptors(&scene.descriptor_writes());
        Ok(scene)
    }

    fn bindings(max_objects: u32) -> Vec<GfxDescriptorBinding> {
        let uniform = |binding, count| GfxDescriptorBinding {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count,
            stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS | vk::ShaderStageFlags::COMPUTE,
        };
        let storage = |binding| GfxDescriptorBinding {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            count: 1,
            stage_flags: vk::ShaderStageFlags::COMPUTE | vk::ShaderStageFlags::VERTEX,
        };
        vec![
            uniform(0, max_objects),
            uniform(1, 1),
            uniform(2, 1),
            storage(3),
            storage(4),
            storage(5),
            storage(6),
        ]
    }

    fn descriptor_writes(&self) -> Vec<GfxBufferDescriptorWrite> {
        let set = self.descriptor_set;
        let mut writes = self.objects.descriptor_writes(set, 0);
        writes.extend([
            self.material.descriptor_write(set, 1),
            self.frustum.descriptor_write(set, 2),
            self.draw_commands.descriptor_write(set, 3),
            self.draw_count.descriptor_write(set, 4),
            self.object_data.descriptor_write(set, 5),
            self.aabbs.descriptor_write(set, 6),
        ]);
        writes
    }
}
// getter
impl SceneBuffers {
    #[inline]
    pub fn descriptor_set(&self) -> GfxDescriptorSetHandle {
        self.descriptor_set
    }

    #[inline]
    pub fn set_layout(&self) -> &GfxDescriptorSetLayout {
        &self.set_layout
    }

    #[inline]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    #[inline]
    pub fn objects(&self) -> &StaticUboArray {
        &self.objects
    }

    #[inline]
    pub fn material(&self) -> &StaticUbo {
        &self.material
    }

    #[inline]
    pub fn draw_commands(&self) -> &StorageRecordArray {
        &self.draw_commands
    }

    #[inline]
    pub fn draw_count(&self) -> &StorageRecordArray {
        &self.draw_count
    }

    #[inline]
    pub fn object_data(&self) -> &StorageRecordArray {
        &self.object_data
    }

    #[inline]
    pub fn aabbs(&self) -> &StorageRecordArray {
        &self.aabbs
    }

    /// vkCmdDrawIndexedIndirect 的 (offset, stride)
    pub fn indirect_args(&self) -> (vk::DeviceSize, u32) {
        let whole = self.draw_commands.range_of(0, &FieldAccess::new());
        (whole.offset, whole.stride as u32)
    }
}
// tools
impl SceneBuffers {
    /// 上传所有物体，每个 SSBO 只会产生一次传输
    pub fn upload_objects(&mut self, objects: &[SceneObject]) -> Result<(), GfxError> {
        let _span = tracy_client::span!("SceneBuffers::upload_objects");
        assert!(
            objects.len() as u32 <= self.draw_commands.count(),
            "{} objects exceed the scene capacity {}",
            objects.len(),
            self.draw_commands.count()
        );

        let model = FieldAccess::new().field("model");
        let mat_id = FieldAccess::new().field("matId");
        for (instance, object) in objects.iter().enumerate() {
            self.objects.set_value(instance as u32, &model, &object.model);
            self.objects.set_value(instance as u32, &mat_id, &object.material_id);
        }

        let commands = objects
            .iter()
            .enumerate()
            .map(|(instance, object)| DrawIndexedCommand {
                index_count: object.index_count,
                instance_count: 1,
                first_index: object.first_index,
                vertex_offset: object.vertex_offset,
                first_instance: instance as u32,
            })
            .collect_vec();
        let command_writes = commands
            .iter()
            .enumerate()
            .map(|(instance, command)| RecordWrite {
                instance_id: instance as u32,
                fields: vec![FieldWrite::value(FieldAccess::new(), command)],
            })
            .collect_vec();
        self.draw_commands.write(&command_writes)?;

        let object_count = objects.len() as u32;
        self.draw_count.stage(0, &FieldAccess::new().field("count"), bytemuck::bytes_of(&object_count));
        self.draw_count.flush()?;

        let object_writes = objects
            .iter()
            .enumerate()
            .map(|(instance, object)| RecordWrite {
                instance_id: instance as u32,
                fields: vec![
                    FieldWrite::value(FieldAccess::new().field("model"), &object.model),
                    FieldWrite::value(FieldAccess::new().field("meshId"), &object.mesh_id),
                    FieldWrite::value(FieldAccess::new().field("matId"), &object.material_id),
                ],
            })
            .collect_vec();
        self.object_data.write(&object_writes)?;

        let aabb_writes = objects
            .iter()
            .enumerate()
            .map(|(instance, object)| RecordWrite {
                instance_id: instance as u32,
                fields: vec![
                    FieldWrite::value(FieldAccess::new().field("min"), &object.bounds_min),
                    FieldWrite::value(FieldAccess::new().field("max"), &object.bounds_max),
                ],
            })
            .collect_vec();
        self.aabbs.write(&aabb_writes)?;

        self.object_count = object_count;
        log::info!("upload {object_count} scene objects");
        Ok(())
    }

    pub fn set_material(&self, base_color: glam::Vec4, alpha_cutoff: f32, texture_ids: [i32; 3]) {
        self.material.set_value(&FieldAccess::new().field("cfg").field("baseColorFactor"), &base_color);
        self.material.set_value(&FieldAccess::new().field("cfg").field("alphaCutoff"), &alpha_cutoff);
        for (name, id) in ["diffuse", "normal", "mrno"].into_iter().zip(texture_ids) {
            self.material.set_value(&FieldAccess::new().field("textureIds").field(name), &id);
        }
    }

    /// 从 projection * view 矩阵中提取视锥体的 6 个平面（Gribb-Hartmann）
    pub fn set_frustum(&self, project_view: glam::Mat4) {
        let m = project_view.transpose();
        let faces = [
            m.w_axis + m.x_axis,
            m.w_axis - m.x_axis,
            m.w_axis + m.y_axis,
            m.w_axis - m.y_axis,
            m.z_axis,
            m.w_axis - m.z_axis,
        ];
        for (i, face) in faces.into_iter().enumerate() {
            let normal_len = face.truncate().length();
            let face = if normal_len > 0.0 { face / normal_len } else { face };
            self.frustum
                .set_value(&FieldAccess::new().field("frustumFaces").at(i as u32), &face);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_gfx::HostBackend;

    fn host() -> (Rc<HostBackend>, Rc<dyn GfxBackend>) {
        let host = Rc::new(HostBackend::default());
        let backend: Rc<dyn GfxBackend> = host.clone();
        (host, backend)
    }

    fn cube(i: u32) -> SceneObject {
        SceneObject {
            model: glam::Mat4::from_translation(glam::Vec3::new(i as f32, 0.0, 0.0)),
            material_id: i as i32 % 2,
            mesh_id: 0,
            index_count: 36,
            first_index: 0,
            vertex_offset: 0,
            bounds_min: glam::Vec3::splat(-0.5) + glam::Vec3::X * i as f32,
            bounds_max: glam::Vec3::splat(0.5) + glam::Vec3::X * i as f32,
        }
    }

    #[test]
    fn test_upload_objects() {
        let (host, backend) = host();
        let mut scene = SceneBuffers::new(backend, 8).unwrap();
        let objects = (0..3).map(cube).collect_vec();
        scene.upload_objects(&objects).unwrap();

        // DrawCommand / DrawCount / ObjectData / AABB 各一次
        assert_eq!(host.upload_count(), 4);
        assert_eq!(scene.object_count(), 3);

        let commands = host.buffer_contents(scene.draw_commands().buffer().handle());
        let second: DrawIndexedCommand = bytemuck::pod_read_unaligned(&commands[20..40]);
        assert_eq!(second.first_instance, 1);
        assert_eq!(second.index_count, 36);

        let count = host.buffer_contents(scene.draw_count().buffer().handle());
        assert_eq!(&count[..], bytemuck::bytes_of(&3_u32));

        let aabbs = host.buffer_contents(scene.aabbs().buffer().handle());
        assert_eq!(&aabbs[64 + 16..64 + 28], bytemuck::bytes_of(&objects[2].bounds_max));

        let mat_id = scene.objects().get(2, &FieldAccess::new().field("matId"));
        assert_eq!(mat_id, bytemuck::bytes_of(&0_i32));
    }

    #[test]
    fn test_descriptor_set_binds_every_buffer() {
        let (host, backend) = host();
        let scene = SceneBuffers::new(backend, 4).unwrap();
        let set = scene.descriptor_set();

        // ObjectUBO 数组：每个元素指向一个 record，stride 按 64 对齐
        for instance in 0..4 {
            let (buffer, offset, range) = host.bound_buffer(set, 0, instance).unwrap();
            assert_eq!(buffer, scene.objects().buffer().handle());
            assert_eq!(offset, instance as vk::DeviceSize * 128);
            assert_eq!(range, 80);
        }
        assert_eq!(
            host.bound_buffer(set, 3, 0).map(|(buffer, ..)| buffer),
            Some(scene.draw_commands().buffer().handle())
        );
        assert_eq!(scene.indirect_args(), (0, 20));
    }

    #[test]
    fn test_material_and_frustum() {
        let (_host, backend) = host();
        let scene = SceneBuffers::new(backend, 1).unwrap();
        scene.set_material(glam::Vec4::ONE, 0.5, [3, 4, 5]);
        assert_eq!(
            scene.material().get(&FieldAccess::new().field("textureIds").field("mrno")),
            bytemuck::bytes_of(&5_i32)
        );
        assert_eq!(
            scene.material().get(&FieldAccess::new().field("cfg").field("alphaCutoff")),
            bytemuck::bytes_of(&0.5_f32)
        );

        scene.set_frustum(glam::Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0));
    }

    #[test]
    #[should_panic(expected = "exceed the scene capacity")]
    fn test_too_many_objects() {
        let (_host, backend) = host();
        let mut scene = SceneBuffers::new(backend, 2).unwrap();
        let objects = (0..3).map(cube).collect_vec();
        scene.upload_objects(&objects).unwrap();
    }
}
