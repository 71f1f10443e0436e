use std::rc::Rc;

use ash::vk;
use strata_gfx::{GfxBackend, GfxBuffer, GfxBufferDescriptorWrite, GfxDescriptorSetHandle};
use strata_layout::{FieldAccess, FieldRange, LayoutDescriptor, LayoutRules, round_up};

/// 将 data 写入 record 中 access 指向的位置
///
/// data 可以比字段短（例如只写 mat4 的第一列），但不能超过字段的大小
fn write_field(buffer: &GfxBuffer, record_offset: vk::DeviceSize, range: FieldRange, access: &FieldAccess, data: &[u8]) {
    assert!(
        data.len() as vk::DeviceSize <= range.size,
        "'{access}' in '{}' is {} bytes, got {} bytes",
        buffer.debug_name(),
        range.size,
        data.len()
    );
    buffer.write(record_offset + range.offset, data);
}

/// vkCmdBindDescriptorSets 的 dynamic offset 只有 32 位
pub(crate) fn checked_dynamic_offset(offset: vk::DeviceSize, debug_name: &str) -> u32 {
    match u32::try_from(offset) {
        Ok(offset) => offset,
        Err(_) => panic!("dynamic offset {offset} in '{debug_name}' does not fit in u32"),
    }
}

/// 单个 std140 record 的 uniform buffer
///
/// 持久映射，写入立即对 GPU 可见
pub struct StaticUbo {
    layout: LayoutDescriptor,
    buffer: GfxBuffer,
}
// new & init
impl StaticUbo {
    pub fn new(
        backend: Rc<dyn GfxBackend>,
        layout: &LayoutDescriptor,
        debug_name: impl AsRef<str>,
    ) -> Result<Self, strata_gfx::GfxError> {
        assert_eq!(layout.rules(), LayoutRules::Std140, "uniform buffers use std140 layouts");
        let buffer =
            GfxBuffer::new_uniform(backend, layout.padded_size(), vk::BufferUsageFlags::empty(), debug_name)?;
        Ok(Self {
            layout: layout.clone(),
            buffer,
        })
    }
}
// getter
impl StaticUbo {
    #[inline]
    pub fn layout(&self) -> &LayoutDescriptor {
        &self.layout
    }

    #[inline]
    pub fn buffer(&self) -> &GfxBuffer {
        &self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}
// tools
impl StaticUbo {
    pub fn set(&self, access: &FieldAccess, data: &[u8]) {
        let range = self.layout.resolve(access);
        write_field(&self.buffer, 0, range, access, data);
    }

    #[inline]
    pub fn set_value<T: bytemuck::Pod>(&self, access: &FieldAccess, value: &T) {
        self.set(access, bytemuck::bytes_of(value));
    }

    /// 读回字段当前的内容
    pub fn get(&self, access: &FieldAccess) -> Vec<u8> {
        let range = self.layout.resolve(access);
        self.buffer.read(range.offset, range.size as usize)
    }

    pub fn descriptor_write(&self, set: GfxDescriptorSetHandle, binding: u32) -> GfxBufferDescriptorWrite {
        GfxBufferDescriptorWrite {
            set,
            binding,
            array_element: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            buffer: self.buffer.handle(),
            offset: 0,
            range: self.buffer.size(),
        }
    }
}

/// 多个相同布局的 std140 record 放在同一个 uniform buffer 中
///
/// 相邻 record 的间距对齐到 `min_alignment`（通常是设备的 minUniformBufferOffsetAlignment），
/// 因此每个 record 都可以单独作为一个 descriptor 或者 dynamic offset 绑定。
pub struct StaticUboArray {
    layout: LayoutDescriptor,
    buffer: GfxBuffer,

    stride: vk::DeviceSize,
    count: u32,
}
// new & init
impl StaticUboArray {
    pub fn new(
        backend: Rc<dyn GfxBackend>,
        layout: &LayoutDescriptor,
        count: u32,
        min_alignment: vk::DeviceSize,
        debug_name: impl AsRef<str>,
    ) -> Result<Self, strata_gfx::GfxError> {
        assert_eq!(layout.rules(), LayoutRules::Std140, "uniform buffers use std140 layouts");
        assert!(count > 0, "StaticUboArray requires at least one record");

        let stride = round_up(layout.padded_size(), min_alignment);
        let buffer = GfxBuffer::new_uniform(
            backend,
            stride * count as vk::DeviceSize,
            vk::BufferUsageFlags::empty(),
            debug_name,
        )?;
        Ok(Self {
            layout: layout.clone(),
            buffer,
            stride,
            count,
        })
    }
}
// getter
impl StaticUboArray {
    #[inline]
    pub fn layout(&self) -> &LayoutDescriptor {
        &self.layout
    }

    #[inline]
    pub fn buffer(&self) -> &GfxBuffer {
        &self.buffer
    }

    #[inline]
    pub fn stride(&self) -> vk::DeviceSize {
        self.stride
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }
}
// tools
impl StaticUboArray {
    /// 第 instance 个 record 中 access 指向的位置，offset 相对于 buffer 的起始位置
    ///
    /// access 为空时指向整个 record：stride 为 record 的间距（按设备对齐之后）
    pub fn range_of(&self, instance: u32, access: &FieldAccess) -> FieldRange {
        self.check_instance(instance);
        if access.is_empty() {
            return FieldRange {
                offset: self.record_offset(instance),
                stride: self.stride,
                size: self.layout.padded_size(),
            };
        }
        let range = self.layout.resolve(access);
        FieldRange {
            offset: self.record_offset(instance) + range.offset,
            ..range
        }
    }

    pub fn set(&self, instance: u32, access: &FieldAccess, data: &[u8]) {
        self.check_instance(instance);
        let range = self.layout.resolve(access);
        write_field(&self.buffer, self.record_offset(instance), range, access, data);
    }

    #[inline]
    pub fn set_value<T: bytemuck::Pod>(&self, instance: u32, access: &FieldAccess, value: &T) {
        self.set(instance, access, bytemuck::bytes_of(value));
    }

    pub fn get(&self, instance: u32, access: &FieldAccess) -> Vec<u8> {
        let range = self.range_of(instance, access);
        self.buffer.read(range.offset, range.size as usize)
    }

    /// 绑定 UNIFORM_BUFFER_DYNAMIC 时使用的 offset
    #[inline]
    pub fn dynamic_offset(&self, instance: u32) -> u32 {
        self.check_instance(instance);
        checked_dynamic_offset(self.record_offset(instance), self.buffer.debug_name())
    }

    /// 作为 descriptor 数组绑定：第 i 个元素指向第 i 个 record
    pub fn descriptor_writes(&self, set: GfxDescriptorSetHandle, binding: u32) -> Vec<GfxBufferDescriptorWrite> {
        (0..self.count)
            .map(|instance| GfxBufferDescriptorWrite {
                set,
                binding,
                array_element: instance,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                buffer: self.buffer.handle(),
                offset: self.record_offset(instance),
                range: self.layout.padded_size(),
            })
            .collect()
    }

    /// 作为单个 dynamic uniform buffer 绑定，通过 [`Self::dynamic_offset`] 选择 record
    pub fn dynamic_descriptor_write(&self, set: GfxDescriptorSetHandle, binding: u32) -> GfxBufferDescriptorWrite {
        GfxBufferDescriptorWrite {
            set,
            binding,
            array_element: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            buffer: self.buffer.handle(),
            offset: 0,
            range: self.layout.padded_size(),
        }
    }

    #[inline]
    fn record_offset(&self, instance: u32) -> vk::DeviceSize {
        instance as vk::DeviceSize * self.stride
    }

    #[inline]
    fn check_instance(&self, instance: u32) {
        assert!(
            instance < self.count,
            "instance {instance} is out of range for '{}' ({} records)",
            self.buffer.debug_name(),
            self.count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_gfx::HostBackend;
    use strata_layout::PrimitiveKind::*;

    fn object_layout() -> LayoutDescriptor {
        LayoutDescriptor::std140().with(Mat4, "model").with(Int, "matId")
    }

    fn host() -> (Rc<HostBackend>, Rc<dyn GfxBackend>) {
        let host = Rc::new(HostBackend::default());
        let backend: Rc<dyn GfxBackend> = host.clone();
        (host, backend)
    }

    #[test]
    fn test_static_ubo_size() {
        let (_host, backend) = host();
        let ubo = StaticUbo::new(backend, &object_layout(), "object").unwrap();
        assert_eq!(ubo.size(), 80);
    }

    #[test]
    fn test_static_ubo_round_trip_every_kind() {
        let (_host, backend) = host();
        let layout = LayoutDescriptor::std140()
            .with(Float, "f")
            .with(Uint, "u")
            .with(Int, "i")
            .with(Bool, "b")
            .with(Vec2, "v2")
            .with(Vec3, "v3")
            .with(Vec4, "v4")
            .with(Mat4, "m4")
            .with_array(Float, "weights", 3);
        let ubo = StaticUbo::new(backend, &layout, "all-kinds").unwrap();

        let model = glam::Mat4::from_cols_array(&std::array::from_fn(|i| i as f32));
        ubo.set_value(&FieldAccess::new().field("f"), &1.5_f32);
        ubo.set_value(&FieldAccess::new().field("u"), &7_u32);
        ubo.set_value(&FieldAccess::new().field("i"), &-3_i32);
        ubo.set_value(&FieldAccess::new().field("b"), &1_u32);
        ubo.set_value(&FieldAccess::new().field("v2"), &glam::Vec2::new(1.0, 2.0));
        ubo.set_value(&FieldAccess::new().field("v3"), &glam::Vec3::new(3.0, 4.0, 5.0));
        ubo.set_value(&FieldAccess::new().field("v4"), &glam::Vec4::new(6.0, 7.0, 8.0, 9.0));
        ubo.set_value(&FieldAccess::new().field("m4"), &model);
        ubo.set_value(&FieldAccess::new().field("weights").at(2), &0.25_f32);

        let read = |access: FieldAccess| ubo.get(&access);
        assert_eq!(read(FieldAccess::new().field("f")), bytemuck::bytes_of(&1.5_f32));
        assert_eq!(read(FieldAccess::new().field("u")), bytemuck::bytes_of(&7_u32));
        assert_eq!(read(FieldAccess::new().field("i")), bytemuck::bytes_of(&-3_i32));
        assert_eq!(read(FieldAccess::new().field("b")), bytemuck::bytes_of(&1_u32));
        assert_eq!(read(FieldAccess::new().field("v2")), bytemuck::bytes_of(&glam::Vec2::new(1.0, 2.0)));
        assert_eq!(read(FieldAccess::new().field("v3")), bytemuck::bytes_of(&glam::Vec3::new(3.0, 4.0, 5.0)));
        assert_eq!(read(FieldAccess::new().field("v4")), bytemuck::bytes_of(&glam::Vec4::new(6.0, 7.0, 8.0, 9.0)));
        assert_eq!(read(FieldAccess::new().field("m4")), bytemuck::bytes_of(&model));
        assert_eq!(read(FieldAccess::new().field("weights").at(2)), bytemuck::bytes_of(&0.25_f32));
        // 数组中其它元素没有被改动
        assert_eq!(read(FieldAccess::new().field("weights").at(1)), [0; 4]);
    }

    #[test]
    fn test_nested_write_lands_at_resolved_offset() {
        let (host, backend) = host();
        let cfg = LayoutDescriptor::std140().with(Vec4, "baseColorFactor").with(Uint, "alphaMode");
        let layout = LayoutDescriptor::std140().with(Float, "head").with_nested(&cfg, "cfg", 1);
        let ubo = StaticUbo::new(backend, &layout, "material").unwrap();

        ubo.set_value(&FieldAccess::new().field("cfg").field("alphaMode"), &2_u32);
        let bytes = host.buffer_contents(ubo.buffer().handle());
        assert_eq!(&bytes[32..36], bytemuck::bytes_of(&2_u32));
    }

    #[test]
    #[should_panic(expected = "bytes")]
    fn test_static_ubo_rejects_oversized_write() {
        let (_host, backend) = host();
        let ubo = StaticUbo::new(backend, &object_layout(), "object").unwrap();
        ubo.set_value(&FieldAccess::new().field("matId"), &[0_u32; 2]);
    }

    #[test]
    fn test_array_stride_and_instance_offsets() {
        let (host, backend) = host();
        let array = StaticUboArray::new(backend, &object_layout(), 3, 256, "objects").unwrap();
        assert_eq!(array.stride(), 256);
        assert_eq!(array.buffer().size(), 768);

        for instance in 0..3 {
            array.set_value(instance, &FieldAccess::new().field("matId"), &(instance as i32 + 10));
        }
        let bytes = host.buffer_contents(array.buffer().handle());
        for instance in 0..3_usize {
            let offset = instance * 256 + 64;
            assert_eq!(&bytes[offset..offset + 4], bytemuck::bytes_of(&(instance as i32 + 10)));
        }

        let range = array.range_of(2, &FieldAccess::new().field("matId"));
        assert_eq!(range.offset, 512 + 64);
        assert_eq!(array.dynamic_offset(1), 256);
    }

    #[test]
    fn test_array_descriptor_writes() {
        let (_host, backend) = host();
        let array = StaticUboArray::new(backend, &object_layout(), 2, 64, "objects").unwrap();
        assert_eq!(array.stride(), 128);

        let writes = array.descriptor_writes(GfxDescriptorSetHandle::default(), 1);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].offset, 128);
        assert_eq!(writes[1].range, 80);
        assert_eq!(writes[1].array_element, 1);

        let dynamic = array.dynamic_descriptor_write(GfxDescriptorSetHandle::default(), 2);
        assert_eq!(dynamic.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC);
        assert_eq!((dynamic.offset, dynamic.range), (0, 80));
        assert_eq!(dynamic.buffer, array.buffer().handle());
    }

    #[test]
    #[should_panic(expected = "does not fit in u32")]
    fn test_dynamic_offset_beyond_u32_panics() {
        checked_dynamic_offset(u32::MAX as vk::DeviceSize + 1, "objects");
    }

    #[test]
    fn test_array_range_of_whole_record() {
        let (_host, backend) = host();
        let array = StaticUboArray::new(backend, &object_layout(), 3, 256, "objects").unwrap();

        let whole = array.range_of(1, &FieldAccess::new());
        assert_eq!(whole, FieldRange { offset: 256, stride: 256, size: 80 });
        assert_eq!(whole.stride, array.stride());
        assert_eq!(array.get(1, &FieldAccess::new()).len(), 80);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_array_instance_out_of_range() {
        let (_host, backend) = host();
        let array = StaticUboArray::new(backend, &object_layout(), 2, 64, "objects").unwrap();
        array.set_value(2, &FieldAccess::new().field("matId"), &0_i32);
    }

    #[test]
    fn test_buffer_released_on_drop() {
        let (host, backend) = host();
        let ubo = StaticUbo::new(backend, &object_layout(), "object").unwrap();
        let handle = ubo.buffer().handle();
        assert!(host.is_buffer_alive(handle));
        drop(ubo);
        assert!(!host.is_buffer_alive(handle));
    }
}
