//! Multi-fragment compositor.
//!
//! Takes a set of independently-authored fragments tagged by stage,
//! resolves where every field's value comes from (another fragment, the
//! previous stage, a built-in, a property, a specialization constant),
//! threads pass-through variables across intermediate stages, and emits
//! one composite program per active stage as source handed back to the
//! front end for lowering.

use crate::error::{CompilerError, Result};
use crate::meta::{
    FragmentKind, InputPrimitive, OutputPrimitive, ShaderAttribute, ShaderFieldKey,
    ShaderFieldMeta, ShaderTypeMeta,
};
use crate::{bail_composite, bail_composite_at, bail_link};
use crate::settings::{make_property_name, ShaderCapabilities, StageFlags, TranslationSettings};
use log::debug;
use std::fmt::Write;

/// How one fragment field was satisfied during linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkedFieldType {
    /// Unresolved: the field keeps its default value and no copy is
    /// generated. Intentional for optional inputs.
    None,
    /// Fed by an earlier fragment's output in the same stage.
    Fragment,
    /// Fed by a previous stage's output (possibly passed through).
    Stage,
    /// Fed by a mangled per-fragment property on the composite.
    Property,
    /// Fed by an application-provided uniform.
    AppBuiltIn,
    /// Fed by a fixed-function hardware value.
    HardwareBuiltIn,
    /// Fed by a specialization constant declared static on the composite.
    SpecConstant,
}

/// The composite request: fragments plus the stream vertex types geometry
/// fragments reference.
#[derive(Debug, Clone, Default)]
pub struct ShaderDefinition {
    pub shader_name: String,
    pub fragments: Vec<ShaderTypeMeta>,
    pub stream_vertex_types: Vec<ShaderTypeMeta>,
    pub extra_attributes: Vec<ShaderAttribute>,
}

#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub field_name: String,
    pub field_type: String,
    pub linked_type: LinkedFieldType,
    pub output_dependency: Option<String>,
    pub property_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FragmentDescription {
    pub fragment_name: String,
    pub fields: Vec<FieldDescription>,
}

/// One generated stage: the composite source and the reflection skeleton.
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    pub fragment_kind: FragmentKind,
    pub class_name: String,
    pub shader_code: String,
    pub fragment_descriptions: Vec<FragmentDescription>,
}

#[derive(Debug, Clone, Default)]
pub struct CompositeResult {
    pub stages: Vec<StageResult>,
}

impl CompositeResult {
    pub fn stage(&self, kind: FragmentKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.fragment_kind == kind)
    }
}

// Small ordered-map helpers; declaration order is significant everywhere
// in the compositor, so plain vectors beat hash maps here.

fn ordered_find<'a, K: PartialEq, V>(entries: &'a [(K, V)], key: &K) -> Option<&'a V> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn ordered_insert_or_override<K: PartialEq, V>(entries: &mut Vec<(K, V)>, key: K, value: V) {
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
}

fn ordered_insert_or_ignore<K: PartialEq, V>(entries: &mut Vec<(K, V)>, key: K, value: V) {
    if !entries.iter().any(|(k, _)| *k == key) {
        entries.push((key, value));
    }
}

fn set_insert(set: &mut Vec<ShaderFieldKey>, key: ShaderFieldKey) {
    if !set.contains(&key) {
        set.push(key);
    }
}

#[derive(Debug, Clone)]
struct ExpectedOutput {
    field: ShaderFieldMeta,
    /// Fragment type that declared the output; `None` for the cpu stage's
    /// vertex-definition fields.
    owner: Option<String>,
    producing_kind: FragmentKind,
}

/// A field declared on a composite struct.
#[derive(Debug, Clone, Default)]
struct ResolvedField {
    name: String,
    type_name: String,
    attributes: Vec<ShaderAttribute>,
}

impl ResolvedField {
    fn add_attribute(&mut self, name: &str) -> &mut ShaderAttribute {
        if let Some(index) = self.attributes.iter().position(|a| a.name == name) {
            return &mut self.attributes[index];
        }
        self.attributes.push(ShaderAttribute::new(name));
        let last = self.attributes.len() - 1;
        &mut self.attributes[last]
    }
}

/// An output some fragment (or built-in) actually produced: the composite
/// must copy it back after the last producer ran.
#[derive(Debug, Clone)]
struct ResolvedOutput {
    composite_field_name: String,
    /// (fragment type, field name) of the producer; `None` means
    /// pass-through or composite-provided, which needs no copy back.
    dependency: Option<(String, String)>,
}

/// Linking info for the vertex-level or primitive-level attachment of one
/// stage.
#[derive(Debug, Clone, Default)]
struct AttachmentInfo {
    expected_outputs: Vec<(ShaderFieldKey, ExpectedOutput)>,
    resolved_fields: Vec<(ShaderFieldKey, ResolvedField)>,
    inputs: Vec<ShaderFieldKey>,
    outputs: Vec<ShaderFieldKey>,
    hardware_inputs: Vec<ShaderFieldKey>,
    hardware_outputs: Vec<ShaderFieldKey>,
    resolved_outputs: Vec<(ShaderFieldKey, ResolvedOutput)>,
}

impl AttachmentInfo {
    fn create_resolved_field(&mut self, name: &str, type_name: &str) -> &mut ResolvedField {
        let key = ShaderFieldKey::new(name, type_name);
        if let Some(index) = self.resolved_fields.iter().position(|(k, _)| *k == key) {
            return &mut self.resolved_fields[index].1;
        }
        self.resolved_fields.push((
            key,
            ResolvedField {
                name: name.into(),
                type_name: type_name.into(),
                attributes: Vec::new(),
            },
        ));
        let last = self.resolved_fields.len() - 1;
        &mut self.resolved_fields[last].1
    }
}

#[derive(Debug, Clone)]
struct FieldLink {
    meta: ShaderFieldMeta,
    linked_type: LinkedFieldType,
    /// Fragment links: (producer fragment type, producer field name).
    fragment_dependency: Option<(String, String)>,
    /// Stage and built-in links: composite-side variable to copy from.
    dependency_name: Option<String>,
    /// Property and spec-constant links: mangled property name.
    property_name: Option<String>,
}

impl FieldLink {
    fn new(meta: ShaderFieldMeta) -> Self {
        FieldLink {
            meta,
            linked_type: LinkedFieldType::None,
            fragment_dependency: None,
            dependency_name: None,
            property_name: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FragmentLinking {
    fields: Vec<FieldLink>,
    non_copyable: Vec<FieldLink>,
}

/// Linking state for one pipeline slot. The cpu and gpu ends are slots
/// too, so pass-through and render-target resolution reuse the same walk.
#[derive(Debug, Clone, Default)]
struct StageInfo {
    fragment_kind: FragmentKind,
    fragment_indices: Vec<usize>,
    /// Per-vertex units linked in this stage: the fragments themselves for
    /// vertex/pixel/compute, the input stream vertex type for geometry.
    vertex_unit_metas: Vec<ShaderTypeMeta>,
    /// Units whose stage outputs feed the next stage.
    output_vertex_metas: Vec<ShaderTypeMeta>,
    /// Primitive-level units (the geometry fragment itself).
    primitive_unit_metas: Vec<ShaderTypeMeta>,
    vertex: AttachmentInfo,
    primitive: AttachmentInfo,
    fragment_links: Vec<(String, FragmentLinking)>,
}

pub struct Compositor<'a> {
    settings: &'a TranslationSettings,
}

impl<'a> Compositor<'a> {
    pub fn new(settings: &'a TranslationSettings) -> Self {
        Compositor { settings }
    }

    /// Composite the rasterization pipeline (vertex/geometry/pixel).
    pub fn composite(
        &self,
        def: &ShaderDefinition,
        capabilities: ShaderCapabilities,
    ) -> Result<CompositeResult> {
        let mut run = CompositeRun::new(self.settings, def, capabilities);
        run.collect_fragments_per_stage()?;
        run.validate_stages()?;
        run.collect_expected_outputs();
        for position in 1..run.active.len() - 1 {
            run.resolve_inputs(position);
        }
        run.resolve_gpu_stage();
        run.resolve_stage_link_order()?;

        let mut result = CompositeResult::default();
        for position in 1..run.active.len() - 1 {
            let stage_index = run.active[position];
            result.stages.push(run.generate_composite(stage_index)?);
        }
        Ok(result)
    }

    /// Composite compute fragments; the rasterization chain is not
    /// involved, so this is a dedicated cpu/compute/gpu walk.
    pub fn composite_compute(
        &self,
        def: &ShaderDefinition,
        local_size: (u32, u32, u32),
    ) -> Result<CompositeResult> {
        let mut run = CompositeRun::new(self.settings, def, ShaderCapabilities::with_compute());
        run.collect_compute_stage()?;
        run.resolve_inputs(1);

        let stage_index = run.active[1];
        let mut result = CompositeResult::default();
        result
            .stages
            .push(run.generate_compute_composite(stage_index, local_size)?);
        Ok(result)
    }
}

struct CompositeRun<'a> {
    settings: &'a TranslationSettings,
    capabilities: ShaderCapabilities,
    def: &'a ShaderDefinition,
    stages: Vec<StageInfo>,
    /// Indices into `stages`, cpu first, gpu last.
    active: Vec<usize>,
}

impl<'a> CompositeRun<'a> {
    fn new(
        settings: &'a TranslationSettings,
        def: &'a ShaderDefinition,
        capabilities: ShaderCapabilities,
    ) -> Self {
        CompositeRun {
            settings,
            capabilities,
            def,
            stages: Vec::new(),
            active: Vec::new(),
        }
    }

    fn find_stream_vertex_meta(&self, name: &str) -> Result<ShaderTypeMeta> {
        match self
            .def
            .stream_vertex_types
            .iter()
            .find(|m| m.name == name)
        {
            Some(meta) => Ok(meta.clone()),
            None => bail_composite!("stream vertex type '{}' was not provided", name),
        }
    }

    fn collect_fragments_per_stage(&mut self) -> Result<()> {
        // cpu, vertex, geometry, pixel, gpu
        self.stages = vec![StageInfo::default(); 5];
        self.stages[1].fragment_kind = FragmentKind::Vertex;
        self.stages[2].fragment_kind = FragmentKind::Geometry;
        self.stages[3].fragment_kind = FragmentKind::Pixel;

        for (index, fragment) in self.def.fragments.iter().enumerate() {
            let stage = match fragment.fragment_kind {
                FragmentKind::Vertex => 1,
                FragmentKind::Geometry => 2,
                FragmentKind::Pixel => 3,
                FragmentKind::Compute => {
                    bail_composite_at!(
                        fragment.location,
                        "compute fragment '{}' must be composited through the compute path",
                        fragment.name
                    )
                }
                FragmentKind::None => continue,
            };
            self.stages[stage].fragment_indices.push(index);
        }

        // Vertex and pixel stages operate on the fragments themselves.
        for stage in [1usize, 3] {
            let metas: Vec<ShaderTypeMeta> = self.stages[stage]
                .fragment_indices
                .iter()
                .map(|i| self.def.fragments[*i].clone())
                .collect();
            self.stages[stage].vertex_unit_metas = metas.clone();
            self.stages[stage].output_vertex_metas = metas;
        }

        // The geometry stage derives its per-vertex types from the single
        // fragment's declared stream parameter types.
        if let Some(&fragment_index) = self.stages[2].fragment_indices.first() {
            let fragment = &self.def.fragments[fragment_index];
            let geometry = match &fragment.geometry {
                Some(geometry) => geometry.clone(),
                None => bail_composite_at!(
                    fragment.location,
                    "geometry fragment '{}' declares no stream types",
                    fragment.name
                ),
            };
            self.stages[2].primitive_unit_metas = vec![fragment.clone()];
            self.stages[2].vertex_unit_metas =
                vec![self.find_stream_vertex_meta(&geometry.input_vertex_type)?];
            self.stages[2].output_vertex_metas =
                vec![self.find_stream_vertex_meta(&geometry.output_vertex_type)?];
        }

        // Cpu, vertex, pixel and gpu are always active; vertex and pixel
        // must exist (possibly auto-generated) for pass-through to work.
        self.active.push(0);
        self.active.push(1);
        if !self.stages[2].fragment_indices.is_empty() {
            self.active.push(2);
        }
        self.active.push(3);
        self.active.push(4);
        Ok(())
    }

    fn collect_compute_stage(&mut self) -> Result<()> {
        self.stages = vec![StageInfo::default(); 3];
        self.stages[1].fragment_kind = FragmentKind::Compute;
        for (index, fragment) in self.def.fragments.iter().enumerate() {
            if fragment.fragment_kind == FragmentKind::Compute {
                self.stages[1].fragment_indices.push(index);
            }
        }
        if self.stages[1].fragment_indices.is_empty() {
            bail_composite!("no compute fragments to composite");
        }
        let metas: Vec<ShaderTypeMeta> = self.stages[1]
            .fragment_indices
            .iter()
            .map(|i| self.def.fragments[*i].clone())
            .collect();
        self.stages[1].vertex_unit_metas = metas.clone();
        self.stages[1].output_vertex_metas = metas;
        self.active = vec![0, 1, 2];

        self.validate_stage_fragments(1)?;
        Ok(())
    }

    fn validate_stages(&self) -> Result<()> {
        for &stage_index in &self.active {
            let stage = &self.stages[stage_index];
            if stage.fragment_kind == FragmentKind::None {
                continue;
            }

            let supported = self
                .capabilities
                .supported_stages
                .contains(StageFlags::from(stage.fragment_kind));
            if !supported && !stage.fragment_indices.is_empty() {
                bail_composite!(
                    "the {} stage is not supported by the given capabilities",
                    stage.fragment_kind.name()
                );
            }

            self.validate_stage_fragments(stage_index)?;

            if stage.fragment_kind == FragmentKind::Geometry && stage.fragment_indices.len() > 1 {
                let fragment = &self.def.fragments[stage.fragment_indices[0]];
                bail_composite_at!(
                    fragment.location,
                    "the geometry stage only supports one fragment at a time"
                );
            }
        }
        Ok(())
    }

    fn validate_stage_fragments(&self, stage_index: usize) -> Result<()> {
        let stage = &self.stages[stage_index];
        for &fragment_index in &stage.fragment_indices {
            let fragment = &self.def.fragments[fragment_index];
            if !fragment.has_main {
                let message = if stage.fragment_kind == FragmentKind::Geometry {
                    format!(
                        "geometry fragment '{}' must have a 'Main' function of \
                         signature (InputStream, OutputStream)",
                        fragment.name
                    )
                } else {
                    format!("fragment '{}' must have a function of signature 'Main()'", fragment.name)
                };
                return Err(CompilerError::CompositeError(message, Some(fragment.location)));
            }
        }
        Ok(())
    }

    fn collect_expected_outputs(&mut self) {
        // The cpu stage's expected outputs are the application's vertex
        // definition fields; that is how a vertex input ultimately binds.
        let cpu = self.active[0];
        for field in &self.settings.vertex_definition.fields {
            let expected = ExpectedOutput {
                field: field.clone(),
                owner: None,
                producing_kind: FragmentKind::None,
            };
            ordered_insert_or_ignore(
                &mut self.stages[cpu].vertex.expected_outputs,
                field.make_field_key(None),
                expected,
            );
        }

        let output_attribute = self.settings.names.stage_output_attribute.clone();
        for &stage_index in &self.active.clone() {
            let kind = self.stages[stage_index].fragment_kind;
            let vertex_metas = self.stages[stage_index].output_vertex_metas.clone();
            Self::collect_expected_outputs_from(
                &mut self.stages[stage_index].vertex,
                &vertex_metas,
                kind,
                &output_attribute,
            );
            let primitive_metas = self.stages[stage_index].primitive_unit_metas.clone();
            Self::collect_expected_outputs_from(
                &mut self.stages[stage_index].primitive,
                &primitive_metas,
                kind,
                &output_attribute,
            );
        }

        // Copy every previous stage's expected outputs forward so a
        // downstream stage can consume a field nobody in between produced.
        for position in 1..self.active.len() - 1 {
            let previous = self.active[position - 1];
            let current = self.active[position];
            let inherited = self.stages[previous].vertex.expected_outputs.clone();
            for (key, value) in inherited {
                ordered_insert_or_ignore(
                    &mut self.stages[current].vertex.expected_outputs,
                    key,
                    value,
                );
            }
        }
    }

    fn collect_expected_outputs_from(
        attachment: &mut AttachmentInfo,
        metas: &[ShaderTypeMeta],
        kind: FragmentKind,
        output_attribute: &str,
    ) {
        for meta in metas {
            for field in &meta.fields {
                for attribute in &field.attributes {
                    if attribute.name == output_attribute {
                        let key = field.make_field_key(Some(attribute));
                        let expected = ExpectedOutput {
                            field: field.clone(),
                            owner: Some(meta.name.clone()),
                            producing_kind: kind,
                        };
                        ordered_insert_or_override(&mut attachment.expected_outputs, key, expected);
                    }
                }
            }
        }
    }

    fn resolve_inputs(&mut self, position: usize) {
        let current = self.active[position];
        let vertex_metas = self.stages[current].vertex_unit_metas.clone();
        self.link_attachment(position, &vertex_metas, false);
        let primitive_metas = self.stages[current].primitive_unit_metas.clone();
        self.link_attachment(position, &primitive_metas, true);
    }

    /// Resolve every field of every unit in one stage attachment, walking
    /// attributes in declared order so the first satisfiable attribute
    /// wins.
    fn link_attachment(&mut self, position: usize, unit_metas: &[ShaderTypeMeta], primitive: bool) {
        let current = self.active[position];
        let previous = self.active[position - 1];
        let names = self.settings.names.clone();
        let stage_kind = self.stages[current].fragment_kind;
        let previous_expected: Vec<(ShaderFieldKey, ExpectedOutput)> = if primitive {
            self.stages[previous].primitive.expected_outputs.clone()
        } else {
            self.stages[previous].vertex.expected_outputs.clone()
        };

        // Last producer per output key within this fragment walk.
        let mut fragment_outputs: Vec<(ShaderFieldKey, (String, String))> = Vec::new();

        for meta in unit_metas {
            let mut linking = FragmentLinking::default();

            for field in &meta.fields {
                // Samplers and images cannot be copied; they surface only
                // as reflection properties of the owning fragment.
                if self.is_non_copyable(&field.type_name) {
                    for attribute in &field.attributes {
                        if attribute.name == names.property_input_attribute
                            || attribute.name == names.stage_output_attribute
                        {
                            let mut link = FieldLink::new(field.clone());
                            link.linked_type = LinkedFieldType::Property;
                            link.property_name =
                                Some(make_property_name(&field.name, &meta.name));
                            linking.non_copyable.push(link);
                            break;
                        }
                    }
                    continue;
                }

                let mut link = FieldLink::new(field.clone());

                for attribute in &field.attributes {
                    if attribute.name == names.fragment_input_attribute {
                        let key = field.make_field_key(Some(attribute));
                        if let Some(producer) = ordered_find(&fragment_outputs, &key) {
                            link.linked_type = LinkedFieldType::Fragment;
                            link.fragment_dependency = Some(producer.clone());
                            break;
                        }
                    }
                    if attribute.name == names.stage_input_attribute {
                        let key = field.make_field_key(Some(attribute));
                        if let Some(expected) = ordered_find(&previous_expected, &key) {
                            let attribute_name = field.attribute_field_name(attribute);
                            let var_name = stage_variable_name(&attribute_name, &field.type_name);
                            link.linked_type = LinkedFieldType::Stage;
                            link.dependency_name = Some(var_name.clone());
                            let expected = expected.clone();
                            self.add_stage_input(
                                position,
                                primitive,
                                &expected,
                                &var_name,
                                &attribute_name,
                            );
                            break;
                        }
                    }
                    if attribute.name == names.app_builtin_input_attribute {
                        let key = field.make_field_key(Some(attribute));
                        if let Some((_, uniform_field)) =
                            self.settings.find_uniform_field(&key, stage_kind)
                        {
                            let uniform_field = uniform_field.clone();
                            link.linked_type = LinkedFieldType::AppBuiltIn;
                            link.dependency_name = Some(uniform_field.name.clone());
                            let resolved = self
                                .attachment_mut(current, primitive)
                                .create_resolved_field(
                                    &uniform_field.name,
                                    &uniform_field.type_name,
                                );
                            resolved.add_attribute(&names.app_builtin_input_attribute);
                            break;
                        }
                    }
                    if attribute.name == names.hardware_builtin_input_attribute {
                        let key = field.make_field_key(Some(attribute));
                        let table = self.settings.stage_builtins(stage_kind);
                        if let Some((_, builtin)) = table.find_input(&key) {
                            let builtin_name = builtin.name.clone();
                            let builtin_type = builtin.type_name.clone();
                            link.linked_type = LinkedFieldType::HardwareBuiltIn;
                            link.dependency_name = Some(builtin_name.clone());
                            let attachment = self.attachment_mut(current, primitive);
                            attachment
                                .create_resolved_field(&builtin_name, &builtin_type)
                                .add_attribute(&names.hardware_builtin_input_attribute);
                            set_insert(&mut attachment.hardware_inputs, key);
                            break;
                        }
                    }
                    if attribute.name == names.property_input_attribute {
                        // Properties are always resolvable.
                        let base_name = field.attribute_field_name(attribute);
                        let property_name = make_property_name(&base_name, &meta.name);
                        link.linked_type = LinkedFieldType::Property;
                        link.property_name = Some(property_name.clone());
                        self.attachment_mut(current, primitive)
                            .create_resolved_field(&property_name, &field.type_name)
                            .add_attribute(&names.property_input_attribute);
                        break;
                    }
                    if attribute.name == names.spec_constant_input_attribute {
                        // Like a property, but declared static so it lowers
                        // into a specialization constant.
                        let base_name = field.attribute_field_name(attribute);
                        let property_name = make_property_name(&base_name, &meta.name);
                        link.linked_type = LinkedFieldType::SpecConstant;
                        link.property_name = Some(property_name.clone());
                        let resolved = self
                            .attachment_mut(current, primitive)
                            .create_resolved_field(&property_name, &field.type_name);
                        resolved.add_attribute(&names.static_attribute);
                        resolved.add_attribute(&names.spec_constant_attribute);
                        break;
                    }
                }

                // Output attributes register producers; looped separately
                // because a field can both input and output.
                for attribute in &field.attributes {
                    if attribute.name == names.fragment_output_attribute {
                        let key = field.make_field_key(Some(attribute));
                        if ordered_find(&fragment_outputs, &key).is_some() {
                            debug!(
                                "fragment '{}' overrides producer of '{}' (last writer wins)",
                                meta.name, key
                            );
                        }
                        ordered_insert_or_override(
                            &mut fragment_outputs,
                            key,
                            (meta.name.clone(), field.name.clone()),
                        );
                        continue;
                    }
                    if attribute.name == names.hardware_builtin_output_attribute {
                        let key = field.make_field_key(Some(attribute));
                        let table = self.settings.stage_builtins(stage_kind);
                        if let Some((_, builtin)) = table.find_output(&key) {
                            let builtin_name = builtin.name.clone();
                            let builtin_type = builtin.type_name.clone();
                            let attachment = self.attachment_mut(current, primitive);
                            attachment
                                .create_resolved_field(&builtin_name, &builtin_type)
                                .add_attribute(&names.hardware_builtin_output_attribute);
                            set_insert(&mut attachment.hardware_outputs, key.clone());
                            ordered_insert_or_override(
                                &mut attachment.resolved_outputs,
                                key,
                                ResolvedOutput {
                                    composite_field_name: builtin_name,
                                    dependency: Some((meta.name.clone(), field.name.clone())),
                                },
                            );
                        }
                    }
                }

                linking.fields.push(link);
            }

            self.stages[current]
                .fragment_links
                .push((meta.name.clone(), linking));
        }
    }

    fn attachment_mut(&mut self, stage_index: usize, primitive: bool) -> &mut AttachmentInfo {
        if primitive {
            &mut self.stages[stage_index].primitive
        } else {
            &mut self.stages[stage_index].vertex
        }
    }

    /// Thread a stage variable from the stage that produced it down to the
    /// consuming stage, declaring matching in/out fields on every
    /// attachment in between so the value survives pass-through.
    fn add_stage_input(
        &mut self,
        consumer_position: usize,
        primitive: bool,
        expected: &ExpectedOutput,
        var_name: &str,
        attribute_name: &str,
    ) {
        let names = self.settings.names.clone();
        let mut position = consumer_position;
        let producer_attachment;
        loop {
            let current = self.active[position];
            let previous = self.active[position - 1];

            self.add_resolved_stage_field(
                previous,
                primitive,
                expected,
                var_name,
                &names.stage_output_attribute,
                attribute_name,
            );
            self.add_resolved_stage_field(
                current,
                primitive,
                expected,
                var_name,
                &names.stage_input_attribute,
                attribute_name,
            );

            if self.stages[previous].fragment_kind == expected.producing_kind || position == 1 {
                producer_attachment = previous;
                break;
            }
            position -= 1;
        }

        // Only the producing stage copies the last fragment's value out to
        // the stage variable.
        let key = ShaderFieldKey::new(attribute_name, expected.field.type_name.clone());
        let dependency = expected
            .owner
            .clone()
            .map(|owner| (owner, expected.field.name.clone()));
        ordered_insert_or_override(
            &mut self.attachment_mut(producer_attachment, primitive).resolved_outputs,
            key,
            ResolvedOutput {
                composite_field_name: var_name.into(),
                dependency,
            },
        );
    }

    fn add_resolved_stage_field(
        &mut self,
        stage_index: usize,
        primitive: bool,
        expected: &ExpectedOutput,
        var_name: &str,
        attribute_name: &str,
        name_override: &str,
    ) {
        let is_input = attribute_name == self.settings.names.stage_input_attribute;
        let name_param = self.settings.names.name_override_param.clone();
        let type_name = expected.field.type_name.clone();
        let attribute_name = attribute_name.to_string();
        let attachment = self.attachment_mut(stage_index, primitive);

        let field = attachment.create_resolved_field(var_name, &type_name);
        let attribute = field.add_attribute(&attribute_name);
        if !attribute.parameters.iter().any(|p| p.name == name_param) {
            attribute.parameters.push(crate::meta::AttributeParameter {
                name: name_param,
                value: crate::meta::AttributeValue::String(name_override.into()),
            });
        }

        let key = ShaderFieldKey::new(var_name, type_name);
        if is_input {
            set_insert(&mut attachment.inputs, key);
        } else {
            set_insert(&mut attachment.outputs, key);
        }
    }

    /// The gpu stage consumes render targets: thread a stage variable for
    /// every render-target name some previous stage produced.
    fn resolve_gpu_stage(&mut self) {
        let gpu_position = self.active.len() - 1;
        let last_programmable = self.active[gpu_position - 1];
        let target_type = self.settings.render_target_type.clone();

        for target_name in self.settings.render_target_names.clone() {
            let key = ShaderFieldKey::new(target_name.clone(), target_type.clone());
            let expected = ordered_find(
                &self.stages[last_programmable].vertex.expected_outputs,
                &key,
            )
            .cloned();
            if let Some(expected) = expected {
                let var_name = stage_variable_name(&target_name, &expected.field.type_name);
                self.add_stage_input(gpu_position, false, &expected, &var_name, &target_name);
            }
        }
    }

    /// Overwrite each upstream stage's output order with the downstream
    /// stage's input order so adjoining stages declare blocks identically.
    fn resolve_stage_link_order(&mut self) -> Result<()> {
        for position in 1..self.active.len().saturating_sub(2) {
            let current = self.active[position];
            let next = self.active[position + 1];

            let inputs = self.stages[next].vertex.inputs.clone();
            for key in &inputs {
                if !self.stages[current].vertex.outputs.contains(key) {
                    bail_link!(
                        "stage input '{}' of the {} stage is not produced by the {} stage",
                        key,
                        self.stages[next].fragment_kind.name(),
                        self.stages[current].fragment_kind.name()
                    );
                }
            }
            self.stages[current].vertex.outputs = inputs;
        }
        Ok(())
    }

    // Composite generation

    fn generate_composite(&self, stage_index: usize) -> Result<StageResult> {
        match self.stages[stage_index].fragment_kind {
            FragmentKind::Vertex | FragmentKind::Pixel => self.generate_basic_composite(stage_index),
            FragmentKind::Geometry => self.generate_geometry_composite(stage_index),
            kind => bail_composite!("cannot generate a composite for the {} stage", kind.name()),
        }
    }

    fn generate_basic_composite(&self, stage_index: usize) -> Result<StageResult> {
        let stage = &self.stages[stage_index];
        let class_name = format!("{}_{}", self.def.shader_name, stage.fragment_kind.name());
        let mut builder = CodeBuilder::new();

        builder.attribute_line(&[ShaderAttribute::new(stage.fragment_kind.name())]);
        if !self.def.extra_attributes.is_empty() {
            builder.attribute_line(&self.def.extra_attributes);
        }
        builder.line(&format!("struct {}", class_name));
        builder.begin_scope();

        // Vertex composites must preserve output order so downstream
        // interfaces match; every other stage declares inputs first.
        if stage.fragment_kind == FragmentKind::Vertex {
            self.declare_fields_in_order(&mut builder, &stage.vertex, &stage.vertex.outputs);
        } else {
            self.declare_fields_in_order(&mut builder, &stage.vertex, &stage.vertex.inputs);
        }

        builder.blank_line();
        builder.attribute_line(&[ShaderAttribute::new(
            self.settings.names.entry_point_attribute.clone(),
        )]);
        builder.line("function Main()");
        builder.begin_scope();

        for &fragment_index in &stage.fragment_indices {
            let fragment = &self.def.fragments[fragment_index];
            self.create_fragment_and_copy_inputs(&mut builder, stage, &class_name, fragment);
            builder.line(&format!("{}.Main();", fragment_variable_name(&fragment.name)));
            builder.blank_line();
        }

        self.copy_resolved_outputs(&mut builder, &stage.vertex);

        builder.end_scope();
        builder.end_scope();

        Ok(StageResult {
            fragment_kind: stage.fragment_kind,
            class_name,
            shader_code: builder.finish(),
            fragment_descriptions: self.stage_descriptions(stage_index),
        })
    }

    fn generate_geometry_composite(&self, stage_index: usize) -> Result<StageResult> {
        let stage = &self.stages[stage_index];
        let fragment = &self.def.fragments[stage.fragment_indices[0]];
        let geometry = match &fragment.geometry {
            Some(geometry) => geometry,
            None => bail_composite_at!(fragment.location, "geometry fragment lost its stream info"),
        };
        let input_vertex_meta = &stage.vertex_unit_metas[0];

        let class_name = format!("{}_{}", self.def.shader_name, stage.fragment_kind.name());
        let input_type_name = format!("{}_GeoIn", self.def.shader_name);
        let output_type_name = format!("{}_GeoOut", self.def.shader_name);
        let names = &self.settings.names;
        let mut builder = CodeBuilder::new();

        // Composite per-vertex input type: resolved stage inputs plus the
        // hardware built-ins threaded by linking.
        builder.line(&format!("struct {}", input_type_name));
        builder.begin_scope();
        self.declare_fields_with_attribute(
            &mut builder,
            &stage.vertex,
            &stage.vertex.inputs,
            &names.stage_input_attribute,
        );
        self.declare_fields_with_attribute(
            &mut builder,
            &stage.vertex,
            &stage.vertex.hardware_inputs,
            &names.hardware_builtin_input_attribute,
        );
        builder.end_scope();

        builder.line(&format!("struct {}", output_type_name));
        builder.begin_scope();
        self.declare_fields_with_attribute(
            &mut builder,
            &stage.vertex,
            &stage.vertex.outputs,
            &names.stage_output_attribute,
        );
        self.declare_fields_with_attribute(
            &mut builder,
            &stage.vertex,
            &stage.vertex.hardware_outputs,
            &names.hardware_builtin_output_attribute,
        );
        builder.end_scope();

        builder.attribute_line(&[ShaderAttribute::new("Geometry").with_int_param(
            names.max_vertices_param.clone(),
            geometry.max_vertices as i32,
        )]);
        builder.line(&format!("struct {}", class_name));
        builder.begin_scope();

        self.declare_fields_in_order(&mut builder, &stage.primitive, &[]);

        let input_stream = format!(
            "{}[{}]",
            geometry.input_primitive.stream_base_name(),
            input_type_name
        );
        let output_stream = format!(
            "{}[{}]",
            geometry.output_primitive.stream_base_name(),
            output_type_name
        );

        builder.blank_line();
        builder.attribute_line(&[ShaderAttribute::new(names.entry_point_attribute.clone())]);
        builder.line(&format!(
            "function Main(input : {}, output : {})",
            input_stream, output_stream
        ));
        builder.begin_scope();

        // Copy the composite's per-vertex inputs into the fragment's own
        // input stream type.
        let fragment_input_stream = format!(
            "{}[{}]",
            geometry.input_primitive.stream_base_name(),
            geometry.input_vertex_type
        );
        builder.line(&format!(
            "var fragmentInput = {}();",
            fragment_input_stream
        ));
        builder.line(&format!(
            "for (var i = 0; i < {}; ++i)",
            geometry.input_primitive.vertex_count()
        ));
        builder.begin_scope();
        if let Some(linking) = ordered_find(&stage.fragment_links, &input_vertex_meta.name) {
            for link in &linking.fields {
                if link.linked_type == LinkedFieldType::Stage {
                    if let Some(dependency) = &link.dependency_name {
                        builder.line(&format!(
                            "fragmentInput[i].{} = input[i].{};",
                            link.meta.name, dependency
                        ));
                    }
                }
            }
        }
        builder.end_scope();

        let fragment_output_stream = format!(
            "{}[{}]",
            geometry.output_primitive.stream_base_name(),
            geometry.output_vertex_type
        );
        builder.line(&format!("var fragmentOutput = {}();", fragment_output_stream));

        self.create_fragment_and_copy_inputs(&mut builder, stage, &class_name, fragment);
        builder.line(&format!(
            "{}.{}(fragmentInput, fragmentOutput);",
            fragment_variable_name(&fragment.name),
            names.main_function_name
        ));

        builder.end_scope();
        builder.end_scope();

        Ok(StageResult {
            fragment_kind: stage.fragment_kind,
            class_name,
            shader_code: builder.finish(),
            fragment_descriptions: self.stage_descriptions(stage_index),
        })
    }

    fn generate_compute_composite(
        &self,
        stage_index: usize,
        local_size: (u32, u32, u32),
    ) -> Result<StageResult> {
        let stage = &self.stages[stage_index];
        let class_name = format!("{}_{}", self.def.shader_name, stage.fragment_kind.name());
        let mut builder = CodeBuilder::new();

        builder.attribute_line(&[ShaderAttribute::new("Compute")
            .with_int_param("localSizeX", local_size.0 as i32)
            .with_int_param("localSizeY", local_size.1 as i32)
            .with_int_param("localSizeZ", local_size.2 as i32)]);
        builder.line(&format!("struct {}", class_name));
        builder.begin_scope();

        self.declare_fields_in_order(&mut builder, &stage.vertex, &stage.vertex.inputs);

        builder.blank_line();
        builder.attribute_line(&[ShaderAttribute::new(
            self.settings.names.entry_point_attribute.clone(),
        )]);
        builder.line("function Main()");
        builder.begin_scope();

        for &fragment_index in &stage.fragment_indices {
            let fragment = &self.def.fragments[fragment_index];
            self.create_fragment_and_copy_inputs(&mut builder, stage, &class_name, fragment);
            builder.line(&format!("{}.Main();", fragment_variable_name(&fragment.name)));
            builder.blank_line();
        }
        self.copy_resolved_outputs(&mut builder, &stage.vertex);

        builder.end_scope();
        builder.end_scope();

        Ok(StageResult {
            fragment_kind: stage.fragment_kind,
            class_name,
            shader_code: builder.finish(),
            fragment_descriptions: self.stage_descriptions(stage_index),
        })
    }

    fn create_fragment_and_copy_inputs(
        &self,
        builder: &mut CodeBuilder,
        stage: &StageInfo,
        class_name: &str,
        fragment: &ShaderTypeMeta,
    ) {
        let variable = fragment_variable_name(&fragment.name);
        builder.line(&format!("var {} = {}();", variable, fragment.name));

        let Some(linking) = ordered_find(&stage.fragment_links, &fragment.name) else {
            return;
        };
        for link in &linking.fields {
            match link.linked_type {
                LinkedFieldType::Property => {
                    if let Some(property) = &link.property_name {
                        builder.line(&format!(
                            "{}.{} = this.{};",
                            variable, link.meta.name, property
                        ));
                    }
                }
                LinkedFieldType::Fragment => {
                    if let Some((owner, field)) = &link.fragment_dependency {
                        builder.line(&format!(
                            "{}.{} = {}.{};",
                            variable,
                            link.meta.name,
                            fragment_variable_name(owner),
                            field
                        ));
                    }
                }
                LinkedFieldType::Stage
                | LinkedFieldType::AppBuiltIn
                | LinkedFieldType::HardwareBuiltIn => {
                    if let Some(dependency) = &link.dependency_name {
                        builder.line(&format!(
                            "{}.{} = this.{};",
                            variable, link.meta.name, dependency
                        ));
                    }
                }
                LinkedFieldType::SpecConstant => {
                    if let Some(property) = &link.property_name {
                        builder.line(&format!(
                            "{}.{} = {}.{};",
                            variable, link.meta.name, class_name, property
                        ));
                    }
                }
                // Unresolved inputs are intentionally not copied; the
                // fragment sees its default value.
                LinkedFieldType::None => {}
            }
        }
    }

    fn copy_resolved_outputs(&self, builder: &mut CodeBuilder, attachment: &AttachmentInfo) {
        for (_, output) in &attachment.resolved_outputs {
            // Pass-through and composite-provided outputs need no copy:
            // the composite's own field already holds the value.
            let Some((owner, field)) = &output.dependency else {
                continue;
            };
            builder.line(&format!(
                "this.{} = {}.{};",
                output.composite_field_name,
                fragment_variable_name(owner),
                field
            ));
        }
    }

    fn declare_fields_in_order(
        &self,
        builder: &mut CodeBuilder,
        attachment: &AttachmentInfo,
        order: &[ShaderFieldKey],
    ) {
        for key in order {
            if let Some(field) = ordered_find(&attachment.resolved_fields, key) {
                builder.declare_field(&field.attributes, &field.name, &field.type_name);
            }
        }
        for (key, field) in &attachment.resolved_fields {
            if order.contains(key) {
                continue;
            }
            builder.declare_field(&field.attributes, &field.name, &field.type_name);
        }
    }

    fn declare_fields_with_attribute(
        &self,
        builder: &mut CodeBuilder,
        attachment: &AttachmentInfo,
        keys: &[ShaderFieldKey],
        attribute_name: &str,
    ) {
        for key in keys {
            let Some(field) = ordered_find(&attachment.resolved_fields, key) else {
                continue;
            };
            if let Some(attribute) = field.attributes.iter().find(|a| a.name == attribute_name) {
                builder.declare_field(
                    std::slice::from_ref(attribute),
                    &field.name,
                    &field.type_name,
                );
            }
        }
    }

    fn stage_descriptions(&self, stage_index: usize) -> Vec<FragmentDescription> {
        let stage = &self.stages[stage_index];
        let mut descriptions = Vec::new();
        for &fragment_index in &stage.fragment_indices {
            let fragment = &self.def.fragments[fragment_index];
            let Some(linking) = ordered_find(&stage.fragment_links, &fragment.name) else {
                continue;
            };
            let mut fields = Vec::new();
            for link in linking.fields.iter().chain(linking.non_copyable.iter()) {
                fields.push(FieldDescription {
                    field_name: link.meta.name.clone(),
                    field_type: link.meta.type_name.clone(),
                    linked_type: link.linked_type,
                    output_dependency: link
                        .dependency_name
                        .clone()
                        .or_else(|| link.fragment_dependency.as_ref().map(|(o, f)| format!("{}.{}", o, f))),
                    property_name: link.property_name.clone(),
                });
            }
            descriptions.push(FragmentDescription {
                fragment_name: fragment.name.clone(),
                fields,
            });
        }
        descriptions
    }

    fn is_non_copyable(&self, type_name: &str) -> bool {
        matches!(
            type_name,
            "Sampler" | "Image2d" | "StorageImage2d" | "SampledImage2d"
        ) || type_name.starts_with("RuntimeArray")
    }
}

/// Stage variables are mangled with a `Stage_` prefix and their type so
/// same-named fields of different types never collide, and never collide
/// with built-ins.
fn stage_variable_name(field_name: &str, type_name: &str) -> String {
    format!("Stage_{}_{}", field_name, type_name)
}

/// Composite-local variable for one fragment: the type name with the
/// first letter lowercased.
fn fragment_variable_name(type_name: &str) -> String {
    let mut chars = type_name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

impl InputPrimitive {
    fn stream_base_name(&self) -> &'static str {
        match self {
            InputPrimitive::Points => "PointInput",
            InputPrimitive::Lines => "LineInput",
            InputPrimitive::LinesAdjacency => "LineAdjacencyInput",
            InputPrimitive::Triangles => "TriangleInput",
            InputPrimitive::TrianglesAdjacency => "TriangleAdjacencyInput",
        }
    }
}

impl OutputPrimitive {
    fn stream_base_name(&self) -> &'static str {
        match self {
            OutputPrimitive::Points => "PointOutput",
            OutputPrimitive::LineStrip => "LineOutput",
            OutputPrimitive::TriangleStrip => "TriangleOutput",
        }
    }
}

/// Indented source emission for the generated composites.
struct CodeBuilder {
    out: String,
    indent: usize,
}

impl CodeBuilder {
    fn new() -> Self {
        CodeBuilder {
            out: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        let _ = writeln!(self.out, "{}", text);
    }

    fn blank_line(&mut self) {
        self.out.push('\n');
    }

    fn begin_scope(&mut self) {
        self.line("{");
        self.indent += 1;
    }

    fn end_scope(&mut self) {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
    }

    fn attribute_line(&mut self, attributes: &[ShaderAttribute]) {
        let mut text = String::new();
        for attribute in attributes {
            text.push_str(&attribute_text(attribute));
        }
        self.line(&text);
    }

    fn declare_field(&mut self, attributes: &[ShaderAttribute], name: &str, type_name: &str) {
        let mut text = String::new();
        for attribute in attributes {
            text.push_str(&attribute_text(attribute));
        }
        if !text.is_empty() {
            text.push(' ');
        }
        let _ = write!(text, "var {} : {};", name, type_name);
        self.line(&text);
    }

    fn finish(self) -> String {
        self.out
    }
}

fn attribute_text(attribute: &ShaderAttribute) -> String {
    use crate::meta::AttributeValue;

    let mut text = format!("[{}", attribute.name);
    if !attribute.parameters.is_empty() {
        text.push('(');
        for (index, parameter) in attribute.parameters.iter().enumerate() {
            if index > 0 {
                text.push_str(", ");
            }
            let _ = write!(text, "{} : ", parameter.name);
            match &parameter.value {
                AttributeValue::String(s) => {
                    let _ = write!(text, "\"{}\"", s);
                }
                AttributeValue::Int(i) => {
                    let _ = write!(text, "{}", i);
                }
                AttributeValue::Float(f) => {
                    let _ = write!(text, "{}", f);
                }
                AttributeValue::TypeName(t) => {
                    let _ = write!(text, "{}", t);
                }
            }
        }
        text.push(')');
    }
    text.push(']');
    text
}
