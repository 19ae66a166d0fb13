//! Fragment and field metadata handed over by the front end.
//!
//! The front end resolves names, types and attributes before this crate
//! runs; everything here is already bound. Fields participate in linking
//! under a (name, type) key, where the name may be overridden per-attribute
//! with a `name` parameter.

use rspirv::spirv::ExecutionMode;
use std::fmt;

/// Source location reported with translation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Span { line, column }
    }

    pub fn dummy() -> Self {
        Span::default()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// The pipeline stage a fragment contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FragmentKind {
    #[default]
    None,
    Vertex,
    Geometry,
    Pixel,
    Compute,
}

impl FragmentKind {
    pub fn name(&self) -> &'static str {
        match self {
            FragmentKind::None => "None",
            FragmentKind::Vertex => "Vertex",
            FragmentKind::Geometry => "Geometry",
            FragmentKind::Pixel => "Pixel",
            FragmentKind::Compute => "Compute",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i32),
    Float(f32),
    TypeName(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeParameter {
    pub name: String,
    pub value: AttributeValue,
}

impl AttributeParameter {
    pub fn string_value(&self) -> Option<&str> {
        match &self.value {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn int_value(&self) -> Option<i32> {
        match self.value {
            AttributeValue::Int(i) => Some(i),
            _ => None,
        }
    }
}

/// A resolved attribute: a name plus an ordered, typed parameter list.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderAttribute {
    pub name: String,
    pub parameters: Vec<AttributeParameter>,
}

impl ShaderAttribute {
    pub fn new(name: impl Into<String>) -> Self {
        ShaderAttribute {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_string_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(AttributeParameter {
            name: name.into(),
            value: AttributeValue::String(value.into()),
        });
        self
    }

    pub fn with_int_param(mut self, name: impl Into<String>, value: i32) -> Self {
        self.parameters.push(AttributeParameter {
            name: name.into(),
            value: AttributeValue::Int(value),
        });
        self
    }

    pub fn find_parameter(&self, name: &str) -> Option<&AttributeParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Linking key for a field: its (possibly overridden) name plus its type.
/// Two fields link only when both halves match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderFieldKey {
    pub name: String,
    pub type_name: String,
}

impl ShaderFieldKey {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ShaderFieldKey {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

impl fmt::Display for ShaderFieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.name, self.type_name)
    }
}

/// Metadata for one field of a fragment.
#[derive(Debug, Clone)]
pub struct ShaderFieldMeta {
    pub name: String,
    pub type_name: String,
    pub attributes: Vec<ShaderAttribute>,
    pub location: Span,
}

impl ShaderFieldMeta {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ShaderFieldMeta {
            name: name.into(),
            type_name: type_name.into(),
            attributes: Vec::new(),
            location: Span::dummy(),
        }
    }

    pub fn with_attribute(mut self, attribute: ShaderAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn find_attribute(&self, name: &str) -> Option<&ShaderAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.find_attribute(name).is_some()
    }

    /// The name this field links under for the given attribute. Attributes
    /// may override the declared field name with a `name` parameter.
    pub fn attribute_field_name(&self, attribute: &ShaderAttribute) -> String {
        attribute
            .find_parameter("name")
            .and_then(|p| p.string_value())
            .map(str::to_string)
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn make_field_key(&self, attribute: Option<&ShaderAttribute>) -> ShaderFieldKey {
        let name = match attribute {
            Some(attribute) => self.attribute_field_name(attribute),
            None => self.name.clone(),
        };
        ShaderFieldKey::new(name, self.type_name.clone())
    }
}

/// Input primitive topology of a geometry stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPrimitive {
    Points,
    Lines,
    LinesAdjacency,
    Triangles,
    TrianglesAdjacency,
}

impl InputPrimitive {
    /// How many vertices one input primitive carries.
    pub fn vertex_count(&self) -> u32 {
        match self {
            InputPrimitive::Points => 1,
            InputPrimitive::Lines => 2,
            InputPrimitive::LinesAdjacency => 4,
            InputPrimitive::Triangles => 3,
            InputPrimitive::TrianglesAdjacency => 6,
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        match self {
            InputPrimitive::Points => ExecutionMode::InputPoints,
            InputPrimitive::Lines => ExecutionMode::InputLines,
            InputPrimitive::LinesAdjacency => ExecutionMode::InputLinesAdjacency,
            InputPrimitive::Triangles => ExecutionMode::Triangles,
            InputPrimitive::TrianglesAdjacency => ExecutionMode::InputTrianglesAdjacency,
        }
    }
}

/// Output primitive topology of a geometry stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPrimitive {
    Points,
    LineStrip,
    TriangleStrip,
}

impl OutputPrimitive {
    pub fn execution_mode(&self) -> ExecutionMode {
        match self {
            OutputPrimitive::Points => ExecutionMode::OutputPoints,
            OutputPrimitive::LineStrip => ExecutionMode::OutputLineStrip,
            OutputPrimitive::TriangleStrip => ExecutionMode::OutputTriangleStrip,
        }
    }
}

/// Stream information a geometry fragment declares through its Main
/// signature and stage attribute.
#[derive(Debug, Clone)]
pub struct GeometryFragmentInfo {
    pub max_vertices: u32,
    pub input_primitive: InputPrimitive,
    pub output_primitive: OutputPrimitive,
    /// Name of the per-vertex struct flowing in through the input stream.
    pub input_vertex_type: String,
    /// Name of the per-vertex struct appended to the output stream.
    pub output_vertex_type: String,
}

/// Metadata for one fragment type.
#[derive(Debug, Clone)]
pub struct ShaderTypeMeta {
    pub name: String,
    pub fragment_kind: FragmentKind,
    pub fields: Vec<ShaderFieldMeta>,
    pub attributes: Vec<ShaderAttribute>,
    pub has_main: bool,
    pub geometry: Option<GeometryFragmentInfo>,
    pub location: Span,
}

impl ShaderTypeMeta {
    pub fn new(name: impl Into<String>, fragment_kind: FragmentKind) -> Self {
        ShaderTypeMeta {
            name: name.into(),
            fragment_kind,
            fields: Vec::new(),
            attributes: Vec::new(),
            has_main: true,
            geometry: None,
            location: Span::dummy(),
        }
    }

    pub fn with_field(mut self, field: ShaderFieldMeta) -> Self {
        self.fields.push(field);
        self
    }

    pub fn find_attribute(&self, name: &str) -> Option<&ShaderAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn find_field(&self, name: &str) -> Option<&ShaderFieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }
}
