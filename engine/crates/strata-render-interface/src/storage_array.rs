use std::rc::Rc;

use ash::vk;
use strata_gfx::{
    GfxBackend, GfxBuffer, GfxBufferDesc, GfxBufferDescriptorWrite, GfxDescriptorSetHandle, GfxError, GfxMemoryLocation,
};
use strata_layout::{FieldAccess, FieldRange, LayoutDescriptor, LayoutRules};

/// 对某个字段的一次写入
#[derive(Clone, Debug)]
pub struct FieldWrite<'a> {
    pub access: FieldAccess,
    pub data: &'a [u8],
}
impl<'a> FieldWrite<'a> {
    #[inline]
    pub fn new(access: FieldAccess, data: &'a [u8]) -> Self {
        Self { access, data }
    }

    #[inline]
    pub fn value<T: bytemuck::Pod>(access: FieldAccess, value: &'a T) -> Self {
        Self {
            access,
            data: bytemuck::bytes_of(value),
        }
    }
}

/// 对第 instance_id 个 record 的一组写入
#[derive(Clone, Debug)]
pub struct RecordWrite<'a> {
    pub instance_id: u32,
    pub fields: Vec<FieldWrite<'a>>,
}

/// device local 的 std430 record 数组（SSBO）
///
/// CPU 侧保存一份完整的 staging 数据，所有写入先落到 staging 中，
/// 然后通过一次 stage buffer 传输整体写入 GPU。
/// 传输是同步的：[`Self::flush`] 返回时数据已经对 GPU 可见。
pub struct StorageRecordArray {
    layout: LayoutDescriptor,
    buffer: GfxBuffer,

    stride: vk::DeviceSize,
    count: u32,

    staging: Vec<u8>,
    dirty: bool,
}
// new & init
impl StorageRecordArray {
    /// - extra_usage: 除了 STORAGE_BUFFER 之外的用途，例如 INDIRECT_BUFFER
    pub fn new(
        backend: Rc<dyn GfxBackend>,
        layout: &LayoutDescriptor,
        count: u32,
        extra_usage: vk::BufferUsageFlags,
        debug_name: impl AsRef<str>,
    ) -> Result<Self, GfxError> {
        assert_eq!(layout.rules(), LayoutRules::Std430, "storage buffers use std430 layouts");
        assert!(count > 0, "StorageRecordArray requires at least one record");

        let stride = layout.padded_size();
        let size = stride * count as vk::DeviceSize;
        let buffer = GfxBuffer::new(
            backend,
            GfxBufferDesc {
                size,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST | extra_usage,
                location: GfxMemoryLocation::DeviceLocal,
                debug_name: debug_name.as_ref().to_string(),
            },
        )?;

        Ok(Self {
            layout: layout.clone(),
            buffer,
            stride,
            count,
            staging: vec![0; size as usize],
            dirty: false,
        })
    }
}
// getter
impl StorageRecordArray {
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

    /// staging 中是否有尚未传输的修改
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// CPU 侧的完整数据
    #[inline]
    pub fn staging(&self) -> &[u8] {
        &self.staging
    }
}
// tools
impl StorageRecordArray {
    /// 应用所有写入，然后通过一次传输写入 GPU
    pub fn write(&mut self, writes: &[RecordWrite<'_>]) -> Result<(), GfxError> {
        for record in writes {
            for field in &record.fields {
                self.stage(record.instance_id, &field.access, field.data);
            }
        }
        self.flush()
    }

    /// 只写入 staging，需要调用 [`Self::flush`] 才会传输到 GPU
    pub fn stage(&mut self, instance_id: u32, access: &FieldAccess, data: &[u8]) {
        let range = self.range_of(instance_id, access);
        assert!(
            data.len() as vk::DeviceSize <= range.size,
            "'{access}' of record {instance_id} in '{}' is {} bytes, got {} bytes",
            self.buffer.debug_name(),
            range.size,
            data.len()
        );
        let offset = range.offset as usize;
        self.staging[offset..offset + data.len()].copy_from_slice(data);
        self.dirty = true;
    }

    /// 将整个 staging 传输到 GPU
    pub fn flush(&mut self) -> Result<(), GfxError> {
        let _span = tracy_client::span!("StorageRecordArray::flush");
        if !self.dirty {
            return Ok(());
        }
        self.buffer.upload(0, &self.staging)?;
        self.dirty = false;
        Ok(())
    }

    /// 第 instance_id 个 record 中 access 指向的位置，offset 相对于 buffer 的起始位置
    ///
    /// access 为空时指向整个 record：size 为 record 的实际大小，stride 为 record 的间距。
    /// 可以直接用于 indirect draw 的 offset / stride。
    pub fn range_of(&self, instance_id: u32, access: &FieldAccess) -> FieldRange {
        assert!(
            instance_id < self.count,
            "instance {instance_id} is out of range for '{}' ({} records)",
            self.buffer.debug_name(),
            self.count
        );
        let record_offset = instance_id as vk::DeviceSize * self.stride;
        if access.is_empty() {
            return FieldRange {
                offset: record_offset,
                stride: self.stride,
                size: self.layout.total_size(),
            };
        }
        let range = self.layout.resolve(access);
        FieldRange {
            offset: record_offset + range.offset,
            ..range
        }
    }

    pub fn descriptor_write(&self, set: GfxDescriptorSetHandle, binding: u32) -> GfxBufferDescriptorWrite {
        GfxBufferDescriptorWrite {
            set,
            binding,
            array_element: 0,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            buffer: self.buffer.handle(),
            offset: 0,
            range: self.buffer.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_gfx::HostBackend;
    use strata_layout::PrimitiveKind::*;

    fn draw_command() -> LayoutDescriptor {
        LayoutDescriptor::std430()
            .with(Uint, "indexCount")
            .with(Uint, "instanceCount")
            .with(Uint, "firstIndex")
            .with(Int, "vertexOffset")
            .with(Uint, "firstInstance")
    }

    fn object_data() -> LayoutDescriptor {
        LayoutDescriptor::std430()
            .with(Mat4, "model")
            .with(Uint, "indexCount")
            .with(Uint, "firstIndex")
            .with(Int, "vertexOffset")
            .with(Uint, "pipelineVariant")
    }

    fn host() -> (Rc<HostBackend>, Rc<dyn GfxBackend>) {
        let host = Rc::new(HostBackend::default());
        let backend: Rc<dyn GfxBackend> = host.clone();
        (host, backend)
    }

    #[test]
    fn test_write_flushes_once() {
        let (host, backend) = host();
        let mut objects = StorageRecordArray::new(backend, &object_data(), 4, vk::BufferUsageFlags::empty(), "objects")
            .unwrap();
        assert_eq!(objects.stride(), 80);

        let model = glam::Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        let writes = (0..4_u32)
            .map(|i| RecordWrite {
                instance_id: i,
                fields: vec![
                    FieldWrite::value(FieldAccess::new().field("model"), &model),
                    FieldWrite::new(FieldAccess::new().field("indexCount"), bytemuck::bytes_of(&36_u32)),
                ],
            })
            .collect::<Vec<_>>();
        objects.write(&writes).unwrap();

        assert_eq!(host.upload_count(), 1);
        assert!(!objects.is_dirty());

        let bytes = host.buffer_contents(objects.buffer().handle());
        for i in 0..4_usize {
            let base = i * 80;
            assert_eq!(&bytes[base..base + 64], bytemuck::bytes_of(&model));
            assert_eq!(&bytes[base + 64..base + 68], bytemuck::bytes_of(&36_u32));
        }
    }

    #[test]
    fn test_partial_write_preserves_other_records() {
        let (host, backend) = host();
        let mut commands =
            StorageRecordArray::new(backend, &draw_command(), 3, vk::BufferUsageFlags::INDIRECT_BUFFER, "draw-cmds")
                .unwrap();
        commands.stage(0, &FieldAccess::new().field("indexCount"), bytemuck::bytes_of(&6_u32));
        commands.flush().unwrap();
        commands
            .write(&[RecordWrite {
                instance_id: 2,
                fields: vec![FieldWrite::value(FieldAccess::new().field("instanceCount"), &1_u32)],
            }])
            .unwrap();

        let bytes = host.buffer_contents(commands.buffer().handle());
        assert_eq!(&bytes[0..4], bytemuck::bytes_of(&6_u32));
        assert_eq!(&bytes[44..48], bytemuck::bytes_of(&1_u32));
        assert_eq!(host.upload_count(), 2);
    }

    #[test]
    fn test_flush_without_changes_is_skipped() {
        let (host, backend) = host();
        let mut commands =
            StorageRecordArray::new(backend, &draw_command(), 1, vk::BufferUsageFlags::empty(), "draw-cmds").unwrap();
        commands.flush().unwrap();
        assert_eq!(host.upload_count(), 0);
    }

    #[test]
    fn test_range_of_defaults_to_whole_record() {
        let (_host, backend) = host();
        let aabb = LayoutDescriptor::std430().with(Vec3, "min").with(Vec3, "max");
        let boxes = StorageRecordArray::new(backend, &aabb, 8, vk::BufferUsageFlags::empty(), "aabbs").unwrap();
        assert_eq!(boxes.stride(), 32);

        let whole = boxes.range_of(3, &FieldAccess::new());
        assert_eq!(whole, FieldRange { offset: 96, stride: 32, size: 28 });

        let max = boxes.range_of(3, &FieldAccess::new().field("max"));
        assert_eq!(max.offset, 96 + 16);
        assert_eq!(max.size, 12);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_stage_out_of_range_instance() {
        let (_host, backend) = host();
        let mut counts = StorageRecordArray::new(
            backend,
            &LayoutDescriptor::std430().with(Uint, "value"),
            1,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            "draw-count",
        )
        .unwrap();
        counts.stage(1, &FieldAccess::new().field("value"), bytemuck::bytes_of(&0_u32));
    }
}
