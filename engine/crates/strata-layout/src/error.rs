use crate::rules::LayoutRules;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    DuplicateField(String),
    ZeroArrayCount(String),
    /// 嵌套的子结构体使用了不同的布局规则
    RulesMismatch {
        field: String,
        parent: LayoutRules,
        child: LayoutRules,
    },
    EmptyNested(String),
    UnknownField(String),
    IndexOutOfRange {
        field: String,
        index: u32,
        array_count: u32,
    },
    /// `FieldAccess::parse` 无法解析的路径
    MalformedPath(String),
}
impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutError::DuplicateField(name) => write!(f, "field '{name}' is declared twice"),
            LayoutError::ZeroArrayCount(name) => write!(f, "field '{name}' has array count 0"),
            LayoutError::RulesMismatch { field, parent, child } => write!(
                f,
                "nested field '{field}' uses {} but its parent uses {}",
                child.name(),
                parent.name()
            ),
            LayoutError::EmptyNested(name) => write!(f, "nested field '{name}' has no members"),
            LayoutError::UnknownField(name) => write!(f, "field '{name}' does not exist"),
            LayoutError::IndexOutOfRange {
                field,
                index,
                array_count,
            } => write!(f, "index {index} is out of range for '{field}' (array count {array_count})"),
            LayoutError::MalformedPath(path) => write!(f, "malformed field path '{path}'"),
        }
    }
}
impl std::error::Error for LayoutError {}
