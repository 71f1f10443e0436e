//! 渲染器中使用的 UBO / SSBO 结构声明
//!
//! UBO 使用 std140，SSBO 使用 std430，与 shader 中的声明一一对应。

use strata_layout::LayoutDescriptor;
use strata_layout::PrimitiveKind::*;

pub const FRUSTUM_FACE_COUNT: u32 = 6;

/// ```glsl
/// layout(std140) uniform ObjectUBO { mat4 model; int matId; };
/// ```
pub fn object_ubo() -> LayoutDescriptor {
    LayoutDescriptor::std140().with(Mat4, "model").with(Int, "matId")
}

pub fn material_ubo() -> LayoutDescriptor {
    let cfg = LayoutDescriptor::std140()
        .with(Vec4, "baseColorFactor")
        .with(Vec4, "mrnoFactor")
        .with(Uint, "alphaMode")
        .with(Float, "alphaCutoff")
        .with(Uint, "flipNormal");
    let texture_ids = LayoutDescriptor::std140().with(Int, "diffuse").with(Int, "normal").with(Int, "mrno");
    let sampler_ids = LayoutDescriptor::std140().with(Int, "diffuse").with(Int, "normal").with(Int, "mrno");

    LayoutDescriptor::std140()
        .with_nested(&cfg, "cfg", 1)
        .with_nested(&texture_ids, "textureIds", 1)
        .with_nested(&sampler_ids, "samplerIds", 1)
}

/// 视锥体的 6 个平面，xyz 为法线，w 为距离
pub fn frustum_ubo() -> LayoutDescriptor {
    LayoutDescriptor::std140().with_array(Vec4, "frustumFaces", FRUSTUM_FACE_COUNT)
}

pub fn frame_ubo() -> LayoutDescriptor {
    LayoutDescriptor::std140().with(Mat4, "projectView")
}

pub fn light_ubo() -> LayoutDescriptor {
    LayoutDescriptor::std140()
        .with(Float, "intensity")
        .with(Vec3, "color")
        .with(Vec3, "direction")
}

/// 与 `VkDrawIndexedIndirectCommand` 一致
pub fn draw_command() -> LayoutDescriptor {
    LayoutDescriptor::std430()
        .with(Uint, "indexCount")
        .with(Uint, "instanceCount")
        .with(Uint, "firstIndex")
        .with(Int, "vertexOffset")
        .with(Uint, "firstInstance")
}

/// vkCmdDrawIndexedIndirectCount 的 count buffer
pub fn draw_count() -> LayoutDescriptor {
    LayoutDescriptor::std430().with(Uint, "count")
}

/// GPU culling 时每个物体的输入
pub fn object_data() -> LayoutDescriptor {
    LayoutDescriptor::std430()
        .with(Mat4, "model")
        .with(Uint, "meshId")
        .with(Int, "matId")
}

pub fn mesh_info() -> LayoutDescriptor {
    LayoutDescriptor::std430()
        .with(Uint, "indexCount")
        .with(Uint, "firstIndex")
        .with(Int, "vertexOffset")
}

pub fn aabb() -> LayoutDescriptor {
    LayoutDescriptor::std430().with(Vec3, "min").with(Vec3, "max")
}

/// CPU 侧的 indirect draw 命令，可以整体写入 [`draw_command`] 的一个 record
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawIndexedCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// 按名字列出所有的声明，用于输出
pub fn all_records() -> Vec<(&'static str, LayoutDescriptor)> {
    vec![
        ("ObjectUBO", object_ubo()),
        ("MaterialUBO", material_ubo()),
        ("FrustumUBO", frustum_ubo()),
        ("FrameUBO", frame_ubo()),
        ("LightUBO", light_ubo()),
        ("DrawCommand", draw_command()),
        ("DrawCount", draw_count()),
        ("ObjectData", object_data()),
        ("MeshInfo", mesh_info()),
        ("AABB", aabb()),
    ]
}
