//! Translation settings: attribute name table, per-stage hardware built-in
//! tables, application uniform buffers, the vertex definition, and render
//! target names.
//!
//! Settings are built once, finalized, and treated as immutable for every
//! translation run after that. Mutating a finalized settings object is an
//! error.

use crate::error::{CompilerError, Result};
use crate::meta::{FragmentKind, ShaderFieldKey, ShaderFieldMeta};
use bitflags::bitflags;
use rspirv::spirv::BuiltIn;

bitflags! {
    /// Bitmask of programmable stages, used by capability checks and
    /// uniform-buffer stage filters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StageFlags: u8 {
        const VERTEX = 1 << 0;
        const GEOMETRY = 1 << 1;
        const PIXEL = 1 << 2;
        const COMPUTE = 1 << 3;
    }
}

impl From<FragmentKind> for StageFlags {
    fn from(kind: FragmentKind) -> Self {
        match kind {
            FragmentKind::None => StageFlags::empty(),
            FragmentKind::Vertex => StageFlags::VERTEX,
            FragmentKind::Geometry => StageFlags::GEOMETRY,
            FragmentKind::Pixel => StageFlags::PIXEL,
            FragmentKind::Compute => StageFlags::COMPUTE,
        }
    }
}

/// Which stages a composite is allowed to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderCapabilities {
    pub supported_stages: StageFlags,
}

impl Default for ShaderCapabilities {
    fn default() -> Self {
        ShaderCapabilities {
            supported_stages: StageFlags::VERTEX | StageFlags::GEOMETRY | StageFlags::PIXEL,
        }
    }
}

impl ShaderCapabilities {
    pub fn with_compute() -> Self {
        ShaderCapabilities {
            supported_stages: StageFlags::all(),
        }
    }
}

/// The attribute vocabulary the front end resolves against. Kept as data so
/// a host application can rename the surface language without touching the
/// compiler.
#[derive(Debug, Clone)]
pub struct NameSettings {
    pub stage_input_attribute: String,
    pub stage_output_attribute: String,
    pub fragment_input_attribute: String,
    pub fragment_output_attribute: String,
    pub hardware_builtin_input_attribute: String,
    pub hardware_builtin_output_attribute: String,
    pub app_builtin_input_attribute: String,
    pub property_input_attribute: String,
    pub spec_constant_input_attribute: String,
    pub spec_constant_attribute: String,
    pub static_attribute: String,
    pub entry_point_attribute: String,
    pub main_function_name: String,
    pub name_override_param: String,
    pub max_vertices_param: String,
}

impl Default for NameSettings {
    fn default() -> Self {
        NameSettings {
            stage_input_attribute: "StageInput".into(),
            stage_output_attribute: "StageOutput".into(),
            fragment_input_attribute: "FragmentInput".into(),
            fragment_output_attribute: "FragmentOutput".into(),
            hardware_builtin_input_attribute: "HardwareBuiltInInput".into(),
            hardware_builtin_output_attribute: "HardwareBuiltInOutput".into(),
            app_builtin_input_attribute: "AppBuiltInInput".into(),
            property_input_attribute: "PropertyInput".into(),
            spec_constant_input_attribute: "SpecConstantInput".into(),
            spec_constant_attribute: "SpecConstant".into(),
            static_attribute: "Static".into(),
            entry_point_attribute: "EntryPoint".into(),
            main_function_name: "Main".into(),
            name_override_param: "name".into(),
            max_vertices_param: "maxVertices".into(),
        }
    }
}

/// Mangle a property-input field name with its owner type so two fragments
/// declaring the same property name never collide on the composite.
pub fn make_property_name(field_name: &str, owner_type: &str) -> String {
    format!("{}_{}", owner_type, field_name)
}

/// One hardware built-in: a fixed-function GPU value a field can bind to.
#[derive(Debug, Clone)]
pub struct BuiltInFieldMeta {
    pub name: String,
    pub type_name: String,
    pub builtin: BuiltIn,
}

impl BuiltInFieldMeta {
    pub fn key(&self) -> ShaderFieldKey {
        ShaderFieldKey::new(self.name.clone(), self.type_name.clone())
    }
}

/// A group of built-ins declared together: either one decorated interface
/// block (the whole block must be copied so adjoining stages match) or a
/// set of loose globals declared individually on first use.
#[derive(Debug, Clone, Default)]
pub struct BuiltInBlock {
    pub interface_block: bool,
    pub fields: Vec<BuiltInFieldMeta>,
}

impl BuiltInBlock {
    fn add_field(&mut self, name: &str, type_name: &str, builtin: BuiltIn) {
        self.fields.push(BuiltInFieldMeta {
            name: name.into(),
            type_name: type_name.into(),
            builtin,
        });
    }

    pub fn find_field(&self, key: &ShaderFieldKey) -> Option<&BuiltInFieldMeta> {
        self.fields.iter().find(|f| &f.key() == key)
    }
}

/// Hardware built-in tables for one stage.
#[derive(Debug, Clone, Default)]
pub struct BuiltInStageTable {
    pub input_block: BuiltInBlock,
    pub input_globals: BuiltInBlock,
    pub output_block: BuiltInBlock,
    pub output_globals: BuiltInBlock,
}

impl BuiltInStageTable {
    /// Find an input built-in by key. Returns the block it belongs to so
    /// the caller knows whether to pack it.
    pub fn find_input(&self, key: &ShaderFieldKey) -> Option<(&BuiltInBlock, &BuiltInFieldMeta)> {
        if let Some(meta) = self.input_block.find_field(key) {
            return Some((&self.input_block, meta));
        }
        self.input_globals.find_field(key).map(|m| (&self.input_globals, m))
    }

    pub fn find_output(&self, key: &ShaderFieldKey) -> Option<(&BuiltInBlock, &BuiltInFieldMeta)> {
        if let Some(meta) = self.output_block.find_field(key) {
            return Some((&self.output_block, meta));
        }
        self.output_globals.find_field(key).map(|m| (&self.output_globals, m))
    }
}

/// An application-defined uniform buffer. Buffers can target a subset of
/// stages; the whole buffer is declared at once so its layout is identical
/// everywhere it appears.
#[derive(Debug, Clone)]
pub struct UniformBufferDescription {
    pub name: String,
    pub binding_id: u32,
    pub descriptor_set_id: u32,
    pub allowed_stages: StageFlags,
    pub fields: Vec<ShaderFieldMeta>,
}

impl UniformBufferDescription {
    pub fn new(name: impl Into<String>, binding_id: u32) -> Self {
        UniformBufferDescription {
            name: name.into(),
            binding_id,
            descriptor_set_id: 0,
            allowed_stages: StageFlags::all(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: &str, type_name: &str) -> Self {
        self.fields.push(ShaderFieldMeta::new(name, type_name));
        self
    }
}

/// The fields the application streams per-vertex; their declaration order
/// fixes vertex input locations.
#[derive(Debug, Clone, Default)]
pub struct VertexDefinition {
    pub fields: Vec<ShaderFieldMeta>,
}

#[derive(Debug, Clone)]
pub struct TranslationSettings {
    pub names: NameSettings,
    pub vertex_builtins: BuiltInStageTable,
    pub geometry_builtins: BuiltInStageTable,
    pub pixel_builtins: BuiltInStageTable,
    pub compute_builtins: BuiltInStageTable,
    pub uniform_buffers: Vec<UniformBufferDescription>,
    /// Fallback buffer every loose material property lands in.
    pub default_uniform_buffer: UniformBufferDescription,
    /// When false, the default buffer's binding id is offset by the stage
    /// so vertex and pixel materials never alias.
    pub allow_material_binding_overlap: bool,
    pub vertex_definition: VertexDefinition,
    pub render_target_names: Vec<String>,
    pub render_target_type: String,
    finalized: bool,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationSettings {
    pub fn new() -> Self {
        let mut settings = TranslationSettings {
            names: NameSettings::default(),
            vertex_builtins: BuiltInStageTable::default(),
            geometry_builtins: BuiltInStageTable::default(),
            pixel_builtins: BuiltInStageTable::default(),
            compute_builtins: BuiltInStageTable::default(),
            uniform_buffers: Vec::new(),
            default_uniform_buffer: UniformBufferDescription::new("Material", 0),
            allow_material_binding_overlap: false,
            vertex_definition: VertexDefinition::default(),
            render_target_names: (0..4).map(|i| format!("Target{}", i)).collect(),
            render_target_type: "Float4".into(),
            finalized: false,
        };
        settings.initialize_builtins();
        settings
    }

    fn initialize_builtins(&mut self) {
        let vertex = &mut self.vertex_builtins;
        vertex.output_block.interface_block = true;
        vertex.output_block.add_field("Position", "Float4", BuiltIn::Position);
        vertex.output_block.add_field("PointSize", "Float", BuiltIn::PointSize);
        vertex.input_globals.add_field("VertexId", "Int", BuiltIn::VertexId);
        vertex.input_globals.add_field("InstanceId", "Int", BuiltIn::InstanceId);

        let geometry = &mut self.geometry_builtins;
        geometry.input_block.interface_block = true;
        geometry.input_block.add_field("Position", "Float4", BuiltIn::Position);
        geometry.output_block.interface_block = true;
        geometry.output_block.add_field("Position", "Float4", BuiltIn::Position);
        geometry.input_globals.add_field("PrimitiveId", "Int", BuiltIn::PrimitiveId);
        geometry.output_globals.add_field("PrimitiveId", "Int", BuiltIn::PrimitiveId);

        let pixel = &mut self.pixel_builtins;
        pixel.output_globals.add_field("FragDepth", "Float", BuiltIn::FragDepth);
        pixel.input_globals.add_field("FragCoord", "Float4", BuiltIn::FragCoord);
        pixel.input_globals.add_field("PointCoord", "Float2", BuiltIn::PointCoord);
        pixel.input_globals.add_field("FrontFacing", "Bool", BuiltIn::FrontFacing);
        pixel.input_globals.add_field("PrimitiveId", "Int", BuiltIn::PrimitiveId);

        let compute = &mut self.compute_builtins;
        compute
            .input_globals
            .add_field("GlobalInvocationId", "Int3", BuiltIn::GlobalInvocationId);
        compute
            .input_globals
            .add_field("LocalInvocationId", "Int3", BuiltIn::LocalInvocationId);
        compute
            .input_globals
            .add_field("LocalInvocationIndex", "Int", BuiltIn::LocalInvocationIndex);
        compute
            .input_globals
            .add_field("NumWorkgroups", "Int3", BuiltIn::NumWorkgroups);
        compute.input_globals.add_field("WorkgroupId", "Int3", BuiltIn::WorkgroupId);
        compute
            .input_globals
            .add_field("WorkgroupSize", "Int3", BuiltIn::WorkgroupSize);
    }

    pub fn stage_builtins(&self, kind: FragmentKind) -> &BuiltInStageTable {
        match kind {
            FragmentKind::Geometry => &self.geometry_builtins,
            FragmentKind::Pixel => &self.pixel_builtins,
            FragmentKind::Compute => &self.compute_builtins,
            _ => &self.vertex_builtins,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn check_mutable(&self) -> Result<()> {
        if self.finalized {
            return Err(CompilerError::BackendError(
                "settings cannot be modified once finalized".into(),
            ));
        }
        Ok(())
    }

    pub fn add_uniform_buffer(&mut self, description: UniformBufferDescription) -> Result<()> {
        self.check_mutable()?;
        self.uniform_buffers.push(description);
        Ok(())
    }

    pub fn add_vertex_definition_field(&mut self, name: &str, type_name: &str) -> Result<()> {
        self.check_mutable()?;
        self.vertex_definition.fields.push(ShaderFieldMeta::new(name, type_name));
        Ok(())
    }

    pub fn set_render_target_names(&mut self, names: Vec<String>) -> Result<()> {
        self.check_mutable()?;
        self.render_target_names = names;
        Ok(())
    }

    /// Find the application uniform buffer (and field) matching a key for
    /// the given stage, if any. `None` means the field belongs to the
    /// default material buffer.
    pub fn find_uniform_field(
        &self,
        key: &ShaderFieldKey,
        stage: FragmentKind,
    ) -> Option<(usize, &ShaderFieldMeta)> {
        let stage_flag = StageFlags::from(stage);
        for (index, buffer) in self.uniform_buffers.iter().enumerate() {
            if !buffer.allowed_stages.contains(stage_flag) {
                continue;
            }
            for field in &buffer.fields {
                if field.make_field_key(None) == *key {
                    return Some((index, field));
                }
            }
        }
        None
    }

    /// Freeze the tables. Validates that no built-in name maps to two
    /// different SPIR-V built-ins across stages.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(CompilerError::BackendError("settings finalized twice".into()));
        }

        let mut seen: Vec<(ShaderFieldKey, BuiltIn)> = Vec::new();
        let tables = [
            &self.vertex_builtins,
            &self.geometry_builtins,
            &self.pixel_builtins,
            &self.compute_builtins,
        ];
        for table in tables {
            let blocks = [
                &table.input_block,
                &table.input_globals,
                &table.output_block,
                &table.output_globals,
            ];
            for block in blocks {
                for field in &block.fields {
                    let key = field.key();
                    match seen.iter().find(|(k, _)| *k == key) {
                        Some((_, builtin)) if *builtin != field.builtin => {
                            return Err(CompilerError::BackendError(format!(
                                "built-in '{}' is mapped to multiple hardware values",
                                key
                            )));
                        }
                        Some(_) => {}
                        None => seen.push((key, field.builtin)),
                    }
                }
            }
        }

        self.finalized = true;
        Ok(())
    }
}
