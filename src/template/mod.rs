//! 工作表模板：类型、注册表、构建器与规格加载

pub mod builder;
pub mod loader;
pub mod registry;
pub mod types;

pub use builder::{FieldBuilder, WorksheetBuilder};
pub use loader::{load_spec_file, load_spec_str, parse_spec_str, registry_from_templates, SpecFormat};
pub use registry::TemplateRegistry;
pub use types::{ActionSpec, FieldKind, FieldTemplate, FieldType, WorksheetKind, WorksheetTemplate};
