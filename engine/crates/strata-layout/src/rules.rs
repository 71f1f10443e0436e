use ash::vk;

/// shader 中可以出现在 uniform / storage block 里的基础类型
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Float,
    Uint,
    Int,
    /// GLSL 的 bool 在 block 中占 4 字节
    Bool,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
}
impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 8] = [
        PrimitiveKind::Float,
        PrimitiveKind::Uint,
        PrimitiveKind::Int,
        PrimitiveKind::Bool,
        PrimitiveKind::Vec2,
        PrimitiveKind::Vec3,
        PrimitiveKind::Vec4,
        PrimitiveKind::Mat4,
    ];

    /// 单个值实际占用的字节数，不包含数组元素之间的 padding
    #[inline]
    pub const fn value_size(self) -> vk::DeviceSize {
        match self {
            PrimitiveKind::Float | PrimitiveKind::Uint | PrimitiveKind::Int | PrimitiveKind::Bool => 4,
            PrimitiveKind::Vec2 => 8,
            PrimitiveKind::Vec3 => 12,
            PrimitiveKind::Vec4 => 16,
            PrimitiveKind::Mat4 => 64,
        }
    }

    #[inline]
    pub const fn glsl_name(self) -> &'static str {
        match self {
            PrimitiveKind::Float => "float",
            PrimitiveKind::Uint => "uint",
            PrimitiveKind::Int => "int",
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Vec2 => "vec2",
            PrimitiveKind::Vec3 => "vec3",
            PrimitiveKind::Vec4 => "vec4",
            PrimitiveKind::Mat4 => "mat4",
        }
    }
}
impl std::fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.glsl_name())
    }
}

/// 布局规则
///
/// - Std140: uniform buffer 使用，数组元素以及嵌套结构体都会对齐到 16 字节
/// - Std430: storage buffer 使用，标量数组是紧密排列的
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum LayoutRules {
    #[default]
    Std140,
    Std430,
}
// rule tables
impl LayoutRules {
    /// 字段的 base alignment，`is_array` 表示 array_count > 1
    pub const fn base_alignment(self, kind: PrimitiveKind, is_array: bool) -> vk::DeviceSize {
        use PrimitiveKind::*;
        match (self, kind, is_array) {
            (LayoutRules::Std140, Float | Uint | Int | Bool, false) => 4,
            (LayoutRules::Std140, Float | Uint | Int | Bool, true) => 16,
            (LayoutRules::Std140, Vec2, false) => 8,
            (LayoutRules::Std140, Vec2, true) => 16,

            (LayoutRules::Std430, Float | Uint | Int | Bool, _) => 4,
            (LayoutRules::Std430, Vec2, _) => 8,

            (_, Vec3 | Vec4 | Mat4, _) => 16,
        }
    }

    /// 每个元素在 buffer 中占据的跨度
    ///
    /// 非数组时就是值本身的大小（vec3 为 12，后面的字段可以紧接着放）
    pub const fn element_stride(self, kind: PrimitiveKind, is_array: bool) -> vk::DeviceSize {
        use PrimitiveKind::*;
        match (self, kind, is_array) {
            (LayoutRules::Std140, Float | Uint | Int | Bool | Vec2, true) => 16,
            (_, Vec3, true) => 16,
            _ => kind.value_size(),
        }
    }

    /// 嵌套结构体作为字段时的对齐
    pub fn nested_alignment(self, child_max_alignment: vk::DeviceSize) -> vk::DeviceSize {
        match self {
            LayoutRules::Std140 => 16,
            LayoutRules::Std430 => child_max_alignment.max(4),
        }
    }

    /// 整个 struct 的对齐：std140 会向上取整到 vec4 的对齐
    pub fn struct_alignment(self, max_base_alignment: vk::DeviceSize) -> vk::DeviceSize {
        match self {
            LayoutRules::Std140 => round_up(max_base_alignment.max(1), 16),
            LayoutRules::Std430 => max_base_alignment.max(1),
        }
    }

    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            LayoutRules::Std140 => "std140",
            LayoutRules::Std430 => "std430",
        }
    }
}

/// 将 value 向上取整到 alignment 的整数倍，alignment 必须是 2 的幂
#[inline]
pub fn round_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    assert!(
        alignment.is_power_of_two(),
        "alignment must be a power of two, got {alignment}"
    );
    (value + alignment - 1) & !(alignment - 1)
}
