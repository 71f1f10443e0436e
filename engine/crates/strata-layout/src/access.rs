use ash::vk;

use crate::descriptor::{FieldRange, FieldType, LayoutDescriptor};
use crate::error::LayoutError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessStep {
    pub field_name: String,
    pub index: u32,
}

/// 指向 record 中某个字段的路径
///
/// ```ignore
/// // material.cfg.baseColorFactor
/// let access = FieldAccess::new().field("cfg").field("baseColorFactor");
/// // frustum.frustum_faces[3]
/// let access = FieldAccess::new().field("frustum_faces").at(3);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FieldAccess {
    steps: Vec<AccessStep>,
}
// new & init
impl FieldAccess {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析 `a.b[2].c` 形式的路径
    pub fn parse(path: &str) -> Result<Self, LayoutError> {
        let malformed = || LayoutError::MalformedPath(path.to_string());

        let mut access = Self::new();
        for segment in path.split('.') {
            let (name, index) = match segment.split_once('[') {
                None => (segment, None),
                Some((name, rest)) => {
                    let index = rest.strip_suffix(']').ok_or_else(malformed)?;
                    (name, Some(index.trim().parse::<u32>().map_err(|_| malformed())?))
                }
            };
            let name = name.trim();
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(malformed());
            }
            access = access.field(name);
            if let Some(index) = index {
                access = access.at(index);
            }
        }
        Ok(access)
    }
}
// builder
impl FieldAccess {
    /// 进入下一层字段，index 默认为 0
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.steps.push(AccessStep {
            field_name: name.into(),
            index: 0,
        });
        self
    }

    /// 设置最近一次 `field` 的数组下标
    ///
    /// # Panics
    /// 在任何 `field` 之前调用
    pub fn at(mut self, index: u32) -> Self {
        let Some(step) = self.steps.last_mut() else {
            panic!("FieldAccess::at({index}) called before any field()");
        };
        step.index = index;
        self
    }
}
// getter
impl FieldAccess {
    #[inline]
    pub fn steps(&self) -> &[AccessStep] {
        &self.steps
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
impl std::fmt::Display for FieldAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}[{}]", step.field_name, step.index)?;
        }
        Ok(())
    }
}

// resolve
impl LayoutDescriptor {
    /// 计算 access 指向的字段在 record 中的位置
    ///
    /// - 基础类型：size 为单个值的大小，stride 为数组的跨度
    /// - 路径停在嵌套字段上：得到该元素整体，size 和 stride 都是嵌套元素的跨度
    /// - 空路径：整个 record
    ///
    /// # Panics
    /// 字段不存在，或者数组下标越界。这些都是调用方的编程错误
    pub fn resolve(&self, access: &FieldAccess) -> FieldRange {
        match self.try_resolve(access) {
            Ok(range) => range,
            Err(e) => panic!("LayoutDescriptor::resolve({access}): {e}"),
        }
    }

    pub fn try_resolve(&self, access: &FieldAccess) -> Result<FieldRange, LayoutError> {
        if access.is_empty() {
            let size = self.padded_size();
            return Ok(FieldRange {
                offset: 0,
                stride: size,
                size,
            });
        }
        self.resolve_steps(access.steps())
    }

    fn resolve_steps(&self, steps: &[AccessStep]) -> Result<FieldRange, LayoutError> {
        let Some((step, rest)) = steps.split_first() else {
            return Err(LayoutError::MalformedPath(String::new()));
        };

        let field = self
            .field(&step.field_name)
            .ok_or_else(|| LayoutError::UnknownField(step.field_name.clone()))?;
        if step.index >= field.array_count() {
            return Err(LayoutError::IndexOutOfRange {
                field: step.field_name.clone(),
                index: step.index,
                array_count: field.array_count(),
            });
        }

        let range = field.range();
        let element_offset = range.offset + step.index as vk::DeviceSize * range.stride;

        match field.ty() {
            FieldType::Primitive(kind) => {
                if let Some(next) = rest.first() {
                    return Err(LayoutError::UnknownField(format!("{}.{}", step.field_name, next.field_name)));
                }
                Ok(FieldRange {
                    offset: element_offset,
                    stride: range.stride,
                    size: kind.value_size(),
                })
            }
            FieldType::Nested(child) => {
                if rest.is_empty() {
                    return Ok(FieldRange {
                        offset: element_offset,
                        stride: range.stride,
                        size: range.stride,
                    });
                }
                let inner = child.resolve_steps(rest)?;
                Ok(FieldRange {
                    offset: element_offset + inner.offset,
                    ..inner
                })
            }
        }
    }
}
