use std::collections::BTreeMap;

use ash::vk;
use indexmap::IndexMap;

use crate::error::LayoutError;
use crate::rules::{LayoutRules, PrimitiveKind, round_up};

/// 字段在 buffer 中的位置
///
/// - offset: 相对于 record 起始位置的偏移
/// - stride: 数组中相邻元素的间距，非数组时等于元素跨度
/// - size: 字段占据的字节数，数组时为 `stride * array_count`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FieldRange {
    pub offset: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub size: vk::DeviceSize,
}
impl FieldRange {
    #[inline]
    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldType {
    Primitive(PrimitiveKind),
    Nested(LayoutDescriptor),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutField {
    name: String,
    ty: FieldType,
    array_count: u32,
    range: FieldRange,
}
// getter
impl LayoutField {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
    #[inline]
    pub fn ty(&self) -> &FieldType {
        &self.ty
    }
    #[inline]
    pub fn array_count(&self) -> u32 {
        self.array_count
    }
    #[inline]
    pub fn is_array(&self) -> bool {
        self.array_count > 1
    }
    #[inline]
    pub fn range(&self) -> FieldRange {
        self.range
    }
}

/// 用于一次性描述整个 record 的字段声明
#[derive(Clone, Debug)]
pub struct LayoutFieldDesc {
    pub name: String,
    pub ty: FieldType,
    pub array_count: u32,
}
impl LayoutFieldDesc {
    pub fn primitive(kind: PrimitiveKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: FieldType::Primitive(kind),
            array_count: 1,
        }
    }

    pub fn nested(desc: LayoutDescriptor, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: FieldType::Nested(desc),
            array_count: 1,
        }
    }

    pub fn array(mut self, array_count: u32) -> Self {
        self.array_count = array_count;
        self
    }
}

/// 一个 GPU record（uniform block / storage struct）的布局
///
/// 按照声明顺序依次放置字段，每个字段的 offset 对齐到所选规则下的 base alignment。
/// `total_size` 是最后一个字段的结束位置，不包含结尾的 padding；
/// 作为独立的 buffer 或数组元素使用时，应该使用 [`LayoutDescriptor::padded_size`]。
///
/// 创建完成后就不再修改，各个 buffer 对象持有一份 clone。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutDescriptor {
    rules: LayoutRules,
    fields: IndexMap<String, LayoutField>,

    total_size: vk::DeviceSize,
    max_base_alignment: vk::DeviceSize,
}
impl Default for LayoutDescriptor {
    fn default() -> Self {
        Self::new(LayoutRules::default())
    }
}
// new & init
impl LayoutDescriptor {
    pub fn new(rules: LayoutRules) -> Self {
        Self {
            rules,
            fields: IndexMap::new(),
            total_size: 0,
            max_base_alignment: 0,
        }
    }

    #[inline]
    pub fn std140() -> Self {
        Self::new(LayoutRules::Std140)
    }

    #[inline]
    pub fn std430() -> Self {
        Self::new(LayoutRules::Std430)
    }

    /// 根据字段列表一次性构建，所有字段都会立即校验
    pub fn from_fields(
        rules: LayoutRules,
        fields: impl IntoIterator<Item = LayoutFieldDesc>,
    ) -> Result<Self, LayoutError> {
        let mut desc = Self::new(rules);
        for field in fields {
            desc.try_push(field.name, field.ty, field.array_count)?;
        }
        Ok(desc)
    }
}
// builder
impl LayoutDescriptor {
    /// 追加一个基础类型的字段
    ///
    /// # Panics
    /// 字段重名，或者 array_count 为 0
    pub fn add(&mut self, kind: PrimitiveKind, name: impl Into<String>, array_count: u32) -> &mut Self {
        if let Err(e) = self.try_push(name.into(), FieldType::Primitive(kind), array_count) {
            panic!("LayoutDescriptor::add: {e}");
        }
        self
    }

    /// 追加一个嵌套的结构体字段，nested 会被 clone 一份
    ///
    /// # Panics
    /// 字段重名、array_count 为 0、nested 为空，或者 nested 和自身的布局规则不同
    pub fn add_nested(&mut self, nested: &LayoutDescriptor, name: impl Into<String>, array_count: u32) -> &mut Self {
        if let Err(e) = self.try_push(name.into(), FieldType::Nested(nested.clone()), array_count) {
            panic!("LayoutDescriptor::add_nested: {e}");
        }
        self
    }

    #[inline]
    pub fn with(mut self, kind: PrimitiveKind, name: impl Into<String>) -> Self {
        self.add(kind, name, 1);
        self
    }

    #[inline]
    pub fn with_array(mut self, kind: PrimitiveKind, name: impl Into<String>, array_count: u32) -> Self {
        self.add(kind, name, array_count);
        self
    }

    #[inline]
    pub fn with_nested(mut self, nested: &LayoutDescriptor, name: impl Into<String>, array_count: u32) -> Self {
        self.add_nested(nested, name, array_count);
        self
    }

    fn try_push(&mut self, name: String, ty: FieldType, array_count: u32) -> Result<(), LayoutError> {
        if self.fields.contains_key(&name) {
            return Err(LayoutError::DuplicateField(name));
        }
        if array_count == 0 {
            return Err(LayoutError::ZeroArrayCount(name));
        }
        let is_array = array_count > 1;

        let (alignment, stride) = match &ty {
            FieldType::Primitive(kind) => {
                (self.rules.base_alignment(*kind, is_array), self.rules.element_stride(*kind, is_array))
            }
            FieldType::Nested(child) => {
                if child.rules != self.rules {
                    return Err(LayoutError::RulesMismatch {
                        field: name,
                        parent: self.rules,
                        child: child.rules,
                    });
                }
                if child.fields.is_empty() {
                    return Err(LayoutError::EmptyNested(name));
                }
                let alignment = self.rules.nested_alignment(child.max_base_alignment);
                (alignment, round_up(child.total_size, alignment))
            }
        };

        let range = FieldRange {
            offset: round_up(self.total_size, alignment),
            stride,
            size: stride * array_count as vk::DeviceSize,
        };
        self.total_size = range.end();
        self.max_base_alignment = self.max_base_alignment.max(alignment);

        self.fields.insert(
            name.clone(),
            LayoutField {
                name,
                ty,
                array_count,
                range,
            },
        );
        Ok(())
    }
}
// getter
impl LayoutDescriptor {
    #[inline]
    pub fn rules(&self) -> LayoutRules {
        self.rules
    }

    /// 最后一个字段的结束位置，不包含结尾的 padding
    #[inline]
    pub fn total_size(&self) -> vk::DeviceSize {
        self.total_size
    }

    #[inline]
    pub fn max_base_alignment(&self) -> vk::DeviceSize {
        self.max_base_alignment
    }

    /// 整个 struct 的对齐
    #[inline]
    pub fn base_alignment(&self) -> vk::DeviceSize {
        self.rules.struct_alignment(self.max_base_alignment)
    }

    /// 作为一个完整的 record 时占用的大小（包含结尾的 padding）
    #[inline]
    pub fn padded_size(&self) -> vk::DeviceSize {
        round_up(self.total_size, self.base_alignment())
    }

    #[inline]
    pub fn field(&self, name: &str) -> Option<&LayoutField> {
        self.fields.get(name)
    }

    #[inline]
    pub fn fields(&self) -> impl Iterator<Item = &LayoutField> {
        self.fields.values()
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
// tools
impl LayoutDescriptor {
    /// 展开后的 `字段路径 -> offset`，嵌套字段使用 `parent.child` 的形式，取第 0 个元素的位置
    ///
    /// 使用有序的 map，保证相同的布局总能得到相同的结果
    pub fn field_offsets(&self) -> BTreeMap<String, vk::DeviceSize> {
        let mut offsets = BTreeMap::new();
        self.collect_offsets("", 0, &mut offsets);
        offsets
    }

    fn collect_offsets(&self, prefix: &str, base: vk::DeviceSize, out: &mut BTreeMap<String, vk::DeviceSize>) {
        for field in self.fields.values() {
            let path = format!("{prefix}{}", field.name);
            let offset = base + field.range.offset;
            if let FieldType::Nested(child) = &field.ty {
                child.collect_offsets(&format!("{path}."), offset, out);
            }
            out.insert(path, offset);
        }
    }

    fn fmt_block(&self, f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result {
        let indent = "    ".repeat(depth + 1);
        for field in self.fields.values() {
            let array = if field.is_array() {
                format!("[{}]", field.array_count)
            } else {
                String::new()
            };
            match &field.ty {
                FieldType::Primitive(kind) => writeln!(
                    f,
                    "{indent}{kind} {}{array}; // offset {}, stride {}, size {}",
                    field.name, field.range.offset, field.range.stride, field.range.size
                )?,
                FieldType::Nested(child) => {
                    writeln!(f, "{indent}struct {{")?;
                    child.fmt_block(f, depth + 1)?;
                    writeln!(
                        f,
                        "{indent}}} {}{array}; // offset {}, stride {}, size {}",
                        field.name, field.range.offset, field.range.stride, field.range.size
                    )?
                }
            }
        }
        Ok(())
    }
}
impl std::fmt::Display for LayoutDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "layout({}) {{", self.rules.name())?;
        self.fmt_block(f, 0)?;
        write!(f, "}} // total {}, padded {}", self.total_size, self.padded_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PrimitiveKind::*;

    fn material_cfg() -> LayoutDescriptor {
        LayoutDescriptor::std140()
            .with(Vec4, "baseColorFactor")
            .with(Vec4, "mrnoFactor")
            .with(Uint, "alphaMode")
            .with(Float, "alphaCutoff")
            .with(Uint, "flipNormal")
    }

    #[test]
    fn test_object_record_sizes() {
        let mut desc = LayoutDescriptor::std140();
        desc.add(Mat4, "model", 1).add(Int, "matId", 1);

        assert_eq!(desc.field("model").unwrap().range().offset, 0);
        assert_eq!(desc.field("matId").unwrap().range().offset, 64);
        assert_eq!(desc.total_size(), 68);
        assert_eq!(desc.padded_size(), 80);
    }

    #[test]
    fn test_vec3_packing() {
        // vec3 后面的标量可以放进 vec3 的第四个分量
        let desc = LayoutDescriptor::std140().with(Vec3, "color").with(Float, "intensity");
        assert_eq!(desc.field("intensity").unwrap().range().offset, 12);
        assert_eq!(desc.total_size(), 16);

        let light = LayoutDescriptor::std140()
            .with(Float, "intensity")
            .with(Vec3, "color")
            .with(Vec3, "direction");
        assert_eq!(light.field("color").unwrap().range().offset, 16);
        assert_eq!(light.field("direction").unwrap().range().offset, 32);
        assert_eq!(light.total_size(), 44);
        assert_eq!(light.padded_size(), 48);
    }

    #[test]
    fn test_vec3_array_stride() {
        for rules in [LayoutRules::Std140, LayoutRules::Std430] {
            let desc = LayoutDescriptor::new(rules).with(Float, "head").with_array(Vec3, "points", 4);
            let points = desc.field("points").unwrap().range();
            assert_eq!(points.stride, 16);
            assert_eq!(points.offset, 16);
            assert_eq!(points.size, 64);
        }
    }

    #[test]
    fn test_scalar_array_rules_differ() {
        let std140 = LayoutDescriptor::std140().with_array(Float, "weights", 4);
        let std430 = LayoutDescriptor::std430().with_array(Float, "weights", 4);
        assert_eq!(std140.field("weights").unwrap().range().stride, 16);
        assert_eq!(std140.total_size(), 64);
        assert_eq!(std430.field("weights").unwrap().range().stride, 4);
        assert_eq!(std430.total_size(), 16);
    }

    #[test]
    fn test_offsets_monotonic_and_aligned() {
        for rules in [LayoutRules::Std140, LayoutRules::Std430] {
            let mut desc = LayoutDescriptor::new(rules);
            for (i, kind) in PrimitiveKind::ALL.iter().chain(PrimitiveKind::ALL.iter().rev()).enumerate() {
                desc.add(*kind, format!("single_{i}"), 1);
                desc.add(*kind, format!("array_{i}"), 3);
            }

            let mut last_offset = 0;
            for field in desc.fields() {
                let FieldType::Primitive(kind) = field.ty() else {
                    unreachable!()
                };
                let range = field.range();
                assert!(range.offset >= last_offset);
                assert_eq!(range.offset % rules.base_alignment(*kind, field.is_array()), 0);
                last_offset = range.end();
            }
            assert_eq!(desc.total_size(), last_offset);
        }
    }

    #[test]
    fn test_nested_std140() {
        let cfg = material_cfg();
        assert_eq!(cfg.total_size(), 44);

        let texture_ids = LayoutDescriptor::std140().with(Int, "diffuse").with(Int, "normal").with(Int, "mrno");
        assert_eq!(texture_ids.total_size(), 12);

        let material = LayoutDescriptor::std140()
            .with_nested(&cfg, "cfg", 1)
            .with_nested(&texture_ids, "textureIds", 1)
            .with_nested(&texture_ids, "samplerIds", 1);

        let cfg_range = material.field("cfg").unwrap().range();
        assert_eq!(cfg_range, FieldRange { offset: 0, stride: 48, size: 48 });
        assert_eq!(material.field("textureIds").unwrap().range().offset, 48);
        assert_eq!(material.field("samplerIds").unwrap().range().offset, 64);
        assert_eq!(material.total_size(), 80);
        assert_eq!(material.padded_size(), 80);
    }

    #[test]
    fn test_nested_std430_uses_child_alignment() {
        let mesh_info = LayoutDescriptor::std430().with(Uint, "firstVertex").with(Uint, "vertexCount");
        let desc = LayoutDescriptor::std430().with(Uint, "flags").with_nested(&mesh_info, "meshes", 3);
        let meshes = desc.field("meshes").unwrap().range();
        assert_eq!(meshes.offset, 4);
        assert_eq!(meshes.stride, 8);
        assert_eq!(meshes.size, 24);

        let aabb = LayoutDescriptor::std430().with(Vec3, "min").with(Vec3, "max");
        assert_eq!(aabb.total_size(), 28);
        assert_eq!(aabb.base_alignment(), 16);
        assert_eq!(aabb.padded_size(), 32);
    }

    #[test]
    fn test_draw_command_matches_vk_struct() {
        let draw_cmd = LayoutDescriptor::std430()
            .with(Uint, "indexCount")
            .with(Uint, "instanceCount")
            .with(Uint, "firstIndex")
            .with(Int, "vertexOffset")
            .with(Uint, "firstInstance");
        assert_eq!(draw_cmd.padded_size(), size_of::<vk::DrawIndexedIndirectCommand>() as vk::DeviceSize);
    }

    #[test]
    fn test_field_offsets_flattened() {
        let cfg = material_cfg();
        let material = LayoutDescriptor::std140().with(Float, "head").with_nested(&cfg, "cfg", 1);
        let offsets = material.field_offsets();
        assert_eq!(offsets["head"], 0);
        assert_eq!(offsets["cfg"], 16);
        assert_eq!(offsets["cfg.baseColorFactor"], 16);
        assert_eq!(offsets["cfg.alphaMode"], 48);
        assert_eq!(offsets.len(), 7);
    }

    #[test]
    fn test_from_fields_validation() {
        let ok = LayoutDescriptor::from_fields(
            LayoutRules::Std140,
            [LayoutFieldDesc::primitive(Vec4, "frustum_faces").array(6)],
        )
        .unwrap();
        assert_eq!(ok.total_size(), 96);

        let dup = LayoutDescriptor::from_fields(
            LayoutRules::Std140,
            [LayoutFieldDesc::primitive(Float, "a"), LayoutFieldDesc::primitive(Int, "a")],
        );
        assert_eq!(dup, Err(LayoutError::DuplicateField("a".to_string())));

        let zero =
            LayoutDescriptor::from_fields(LayoutRules::Std430, [LayoutFieldDesc::primitive(Float, "a").array(0)]);
        assert_eq!(zero, Err(LayoutError::ZeroArrayCount("a".to_string())));

        let mismatch = LayoutDescriptor::from_fields(
            LayoutRules::Std140,
            [LayoutFieldDesc::nested(LayoutDescriptor::std430().with(Float, "x"), "child")],
        );
        assert!(matches!(mismatch, Err(LayoutError::RulesMismatch { .. })));
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_add_duplicate_panics() {
        let mut desc = LayoutDescriptor::std140();
        desc.add(Float, "value", 1).add(Vec4, "value", 1);
    }

    #[test]
    fn test_display_lists_fields() {
        let desc = LayoutDescriptor::std140().with(Mat4, "model").with(Int, "matId");
        let text = desc.to_string();
        assert!(text.contains("mat4 model; // offset 0"));
        assert!(text.contains("int matId; // offset 64"));
        assert!(text.ends_with("total 68, padded 80"));
    }
}
