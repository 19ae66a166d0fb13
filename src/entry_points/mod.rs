//! Per-stage entry-point generation.
//!
//! Given one fragment's lowered Main function, this synthesizes the full
//! stage entry point: copy-in/copy-out helpers, a wrapper main that
//! sequences globals-init, construction, copy-in, the user Main and
//! copy-out, the decorated input/output/built-in/uniform interface
//! blocks, and the stage's execution modes.

pub mod geometry;
pub mod interface;

use crate::error::{CompilerError, Result};
use crate::ir::{
    BasicBlock, FunctionId, Op, OpId, Operand, ShaderLibrary, TypeId, TypeKind,
};
use crate::meta::{FragmentKind, ShaderAttribute, ShaderFieldMeta, ShaderTypeMeta};
use crate::reflection::{ResourceReflection, StageReflection, StageResource};
use crate::settings::{make_property_name, TranslationSettings};
use interface::{
    add_offset_decorations, BuiltInGroupKey, DecorationParam, GlobalsInterface, InterfaceBlock,
    InterfaceField, InterfaceGroup, ShaderInterfaceInfo, StructInterface,
};
use log::debug;
use rspirv::spirv::{self, Capability, Decoration, ExecutionMode, StorageClass};
use std::collections::{HashMap, HashSet};

/// Everything the binary backend needs to emit one entry point.
#[derive(Debug)]
pub struct EntryPointInfo {
    pub entry_fn: FunctionId,
    pub fragment_type: TypeId,
    pub fragment_kind: FragmentKind,
    pub capabilities: Vec<Capability>,
    /// OpExecutionMode instructions.
    pub execution_modes: Vec<OpId>,
    /// OpDecorate / OpMemberDecorate instructions.
    pub decorations: Vec<OpId>,
    /// Global variables this entry point declared.
    pub variables: Vec<OpId>,
    /// The subset of globals listed in the module's entry-point interface.
    pub interface: Vec<OpId>,
    pub globals_initializer: Option<FunctionId>,
    /// Functions swapped for a specialized clone at emission time, keeping
    /// the original's identity so call sites stay valid.
    pub late_bound_functions: HashMap<FunctionId, FunctionId>,
    pub reflection: StageReflection,
}

impl EntryPointInfo {
    fn new(entry_fn: FunctionId, fragment_type: TypeId, fragment_kind: FragmentKind) -> Self {
        EntryPointInfo {
            entry_fn,
            fragment_type,
            fragment_kind,
            capabilities: Vec::new(),
            execution_modes: Vec::new(),
            decorations: Vec::new(),
            variables: Vec::new(),
            interface: Vec::new(),
            globals_initializer: None,
            late_bound_functions: HashMap::new(),
            reflection: StageReflection::default(),
        }
    }
}

/// A copy helper under construction: the function, its self parameter, and
/// the block instructions are appended to.
pub(crate) struct CopyHelper {
    pub function: FunctionId,
    pub self_param: OpId,
    pub block: BasicBlock,
}

/// Interface blocks realized for one generation call.
pub struct RealizedInterface {
    pub inputs: Option<InterfaceBlock>,
    pub outputs: Option<InterfaceBlock>,
    pub builtins: Vec<InterfaceBlock>,
    pub uniforms: Vec<InterfaceBlock>,
}

pub struct EntryPointGeneration<'a> {
    pub(crate) lib: &'a mut ShaderLibrary,
    pub(crate) settings: &'a TranslationSettings,
    used_binding_ids: HashSet<u32>,
}

impl<'a> EntryPointGeneration<'a> {
    pub fn new(lib: &'a mut ShaderLibrary, settings: &'a TranslationSettings) -> Self {
        EntryPointGeneration {
            lib,
            settings,
            used_binding_ids: HashSet::new(),
        }
    }

    pub fn declare_vertex_interface(
        &mut self,
        fragment: TypeId,
        main_fn: FunctionId,
    ) -> Result<EntryPointInfo> {
        self.used_binding_ids.clear();
        let meta = self.fragment_meta(fragment)?;

        let mut copy_inputs = self.generate_copy_helper(fragment, "CopyInputs", &meta.name)?;
        let mut copy_outputs = self.generate_copy_helper(fragment, "CopyOutputs", &meta.name)?;
        let mut entry_point = self.build_basic_entry_point(
            fragment,
            main_fn,
            &copy_inputs,
            &copy_outputs,
            &meta,
            FragmentKind::Vertex,
        )?;

        let mut info = self.collect_interface_variables(&meta, FragmentKind::Vertex)?;

        // Vertex inputs are loose globals with explicit locations so the
        // application's vertex definition binds by index.
        info.inputs.is_struct = false;
        self.add_vertex_location_decorations(&mut info.inputs);
        // Vertex outputs pack into one decorated block so the next stage's
        // input block matches member for member.
        info.outputs.is_struct = true;
        info.outputs.name = "Out".into();
        info.outputs
            .type_decorations
            .push(DecorationParam::new(Decoration::Block));
        info.outputs
            .instance_decorations
            .push(DecorationParam::with_value(Decoration::Location, 0));
        self.decorate_uniform_groups(&mut info)?;

        self.declare_stage_blocks(&info, &mut entry_point, &mut copy_inputs, &mut copy_outputs, fragment)?;
        self.finish_copy_helper(copy_inputs);
        self.finish_copy_helper(copy_outputs);

        self.decorate_resources(&meta, &mut entry_point)?;
        self.copy_reflection_to_entry_point(&mut entry_point, &info);
        Ok(entry_point)
    }

    pub fn declare_pixel_interface(
        &mut self,
        fragment: TypeId,
        main_fn: FunctionId,
    ) -> Result<EntryPointInfo> {
        self.used_binding_ids.clear();
        let meta = self.fragment_meta(fragment)?;

        let mut copy_inputs = self.generate_copy_helper(fragment, "CopyInputs", &meta.name)?;
        let mut copy_outputs = self.generate_copy_helper(fragment, "CopyOutputs", &meta.name)?;
        let mut entry_point = self.build_basic_entry_point(
            fragment,
            main_fn,
            &copy_inputs,
            &copy_outputs,
            &meta,
            FragmentKind::Pixel,
        )?;

        let mut info = self.collect_interface_variables(&meta, FragmentKind::Pixel)?;

        // Pixel inputs mirror the upstream output block.
        info.inputs.is_struct = true;
        info.inputs.name = "In".into();
        info.inputs
            .type_decorations
            .push(DecorationParam::new(Decoration::Block));
        info.inputs
            .instance_decorations
            .push(DecorationParam::with_value(Decoration::Location, 0));
        // Pixel outputs are loose render-target variables.
        info.outputs.is_struct = false;
        self.add_pixel_location_decorations(&mut info.outputs);
        self.add_flat_decorations(&mut info.inputs)?;
        self.decorate_uniform_groups(&mut info)?;

        self.declare_stage_blocks(&info, &mut entry_point, &mut copy_inputs, &mut copy_outputs, fragment)?;
        self.finish_copy_helper(copy_inputs);
        self.finish_copy_helper(copy_outputs);

        self.decorate_resources(&meta, &mut entry_point)?;
        self.copy_reflection_to_entry_point(&mut entry_point, &info);
        self.write_execution_mode(&mut entry_point, ExecutionMode::OriginUpperLeft, &[]);
        Ok(entry_point)
    }

    pub fn declare_compute_interface(
        &mut self,
        fragment: TypeId,
        main_fn: FunctionId,
        local_size: (u32, u32, u32),
    ) -> Result<EntryPointInfo> {
        self.used_binding_ids.clear();
        let meta = self.fragment_meta(fragment)?;

        let mut copy_inputs = self.generate_copy_helper(fragment, "CopyInputs", &meta.name)?;
        let mut copy_outputs = self.generate_copy_helper(fragment, "CopyOutputs", &meta.name)?;
        let mut entry_point = self.build_basic_entry_point(
            fragment,
            main_fn,
            &copy_inputs,
            &copy_outputs,
            &meta,
            FragmentKind::Compute,
        )?;

        let mut info = self.collect_interface_variables(&meta, FragmentKind::Compute)?;
        info.inputs.is_struct = true;
        info.inputs.name = "In".into();
        info.outputs.is_struct = true;
        info.outputs.name = "Out".into();
        info.outputs
            .instance_decorations
            .push(DecorationParam::with_value(Decoration::Location, 0));
        self.decorate_uniform_groups(&mut info)?;

        self.declare_stage_blocks(&info, &mut entry_point, &mut copy_inputs, &mut copy_outputs, fragment)?;
        self.finish_copy_helper(copy_inputs);
        self.finish_copy_helper(copy_outputs);

        self.decorate_resources(&meta, &mut entry_point)?;
        self.copy_reflection_to_entry_point(&mut entry_point, &info);
        self.write_execution_mode(
            &mut entry_point,
            ExecutionMode::LocalSize,
            &[local_size.0, local_size.1, local_size.2],
        );
        Ok(entry_point)
    }

    // Shared construction

    pub(crate) fn fragment_meta(&self, fragment: TypeId) -> Result<ShaderTypeMeta> {
        self.lib
            .type_ref(fragment)
            .meta
            .clone()
            .ok_or_else(|| CompilerError::BackendError("entry point type has no metadata".into()))
    }

    /// A helper function `(self) -> Void` that copies between the fragment
    /// instance and the stage interface.
    pub(crate) fn generate_copy_helper(
        &mut self,
        fragment: TypeId,
        name: &str,
        fragment_name: &str,
    ) -> Result<CopyHelper> {
        let self_pointer = self.lib.pointer_to(fragment, StorageClass::Function)?;
        let void = self.lib.void_type;
        let function = self
            .lib
            .create_function(format!("{}_{}", name, fragment_name), void, &[self_pointer]);
        let self_param = self.lib.function_ref(function).parameters[0];
        self.lib.set_debug_name(self_param, "self");
        let block = self.lib.new_block();
        Ok(CopyHelper {
            function,
            self_param,
            block,
        })
    }

    pub(crate) fn finish_copy_helper(&mut self, mut helper: CopyHelper) {
        if !helper.block.is_terminated() {
            self.lib.build_return(&mut helper.block);
        }
        self.lib.function_mut(helper.function).blocks.push(helper.block);
    }

    /// Create the globals initializer and the wrapper main that sequences
    /// globals-init, construction, copy-in, the user Main and copy-out.
    fn build_basic_entry_point(
        &mut self,
        fragment: TypeId,
        main_fn: FunctionId,
        copy_inputs: &CopyHelper,
        copy_outputs: &CopyHelper,
        meta: &ShaderTypeMeta,
        kind: FragmentKind,
    ) -> Result<EntryPointInfo> {
        let void = self.lib.void_type;
        let entry_fn = self
            .lib
            .create_function(format!("EntryPoint_Main_{}", meta.name), void, &[]);
        let mut entry_point = EntryPointInfo::new(entry_fn, fragment, kind);
        entry_point.reflection.shader_type_name = meta.name.clone();
        entry_point.reflection.fragment_kind = kind;

        let globals_init = self.create_globals_initializer(&meta.name);
        entry_point.globals_initializer = Some(globals_init);

        let mut block = self.lib.new_block();
        self.lib.build_call(&mut block, void, globals_init, &[]);

        let self_var = self.lib.make_local_variable(fragment, "self")?;
        block.local_variables.push(self_var);

        let constructor = self.lib.default_constructor(fragment).ok_or_else(|| {
            CompilerError::BackendError(format!(
                "entry point type '{}' has no default constructor",
                meta.name
            ))
        })?;
        self.lib.build_call(&mut block, void, constructor, &[self_var]);
        self.lib
            .build_call(&mut block, void, copy_inputs.function, &[self_var]);
        self.lib.build_call(&mut block, void, main_fn, &[self_var]);
        self.lib
            .build_call(&mut block, void, copy_outputs.function, &[self_var]);
        self.lib.build_return(&mut block);
        self.lib.function_mut(entry_fn).blocks.push(block);

        Ok(entry_point)
    }

    pub(crate) fn create_globals_initializer(&mut self, fragment_name: &str) -> FunctionId {
        let void = self.lib.void_type;
        let function = self
            .lib
            .create_function(format!("InitializeGlobals_{}", fragment_name), void, &[]);
        let mut block = self.lib.new_block();
        self.lib.build_return(&mut block);
        self.lib.function_mut(function).blocks.push(block);
        function
    }

    // Field classification

    pub(crate) fn collect_interface_variables(
        &mut self,
        meta: &ShaderTypeMeta,
        stage: FragmentKind,
    ) -> Result<ShaderInterfaceInfo> {
        let mut info = ShaderInterfaceInfo::new();
        let names = self.settings.names.clone();

        for field in &meta.fields {
            // Opaque resources are copied by reference through a generated
            // property, never packed into an interface or uniform group.
            if self.is_opaque_field(field) {
                continue;
            }

            if let Some(attribute) = field.find_attribute(&names.stage_input_attribute) {
                let key = field.make_field_key(Some(attribute));
                let field_info = info.inputs.find_or_create_field(&key);
                field_info.linked_fields.push(field.clone());
            }
            if let Some(attribute) = field.find_attribute(&names.hardware_builtin_input_attribute) {
                self.process_builtin(&mut info, stage, field, attribute, true)?;
            }
            if let Some(attribute) = field.find_attribute(&names.stage_output_attribute) {
                let key = field.make_field_key(Some(attribute));
                let field_info = info.outputs.find_or_create_field(&key);
                field_info.linked_fields.push(field.clone());
            }
            if let Some(attribute) = field.find_attribute(&names.hardware_builtin_output_attribute) {
                self.process_builtin(&mut info, stage, field, attribute, false)?;
            }
            for attribute in &field.attributes {
                if attribute.name == names.app_builtin_input_attribute
                    || attribute.name == names.property_input_attribute
                {
                    self.process_uniform_field(&mut info, stage, field, attribute)?;
                    break;
                }
            }
        }
        Ok(info)
    }

    fn is_opaque_field(&self, field: &ShaderFieldMeta) -> bool {
        self.lib
            .find_type(&field.type_name)
            .map(|t| self.lib.is_opaque_resource(t))
            .unwrap_or(false)
    }

    /// Route a field to its built-in group, validating it against the
    /// stage's hardware built-in table.
    fn process_builtin(
        &mut self,
        info: &mut ShaderInterfaceInfo,
        stage: FragmentKind,
        field: &ShaderFieldMeta,
        attribute: &ShaderAttribute,
        is_input: bool,
    ) -> Result<()> {
        let key = field.make_field_key(Some(attribute));
        let table = self.settings.stage_builtins(stage);
        let found = if is_input {
            table.find_input(&key)
        } else {
            table.find_output(&key)
        };
        let (block, _) = match found {
            Some(found) => found,
            None => {
                return Err(CompilerError::BuiltInError(
                    format!(
                        "'{}' is not a valid built-in for the {} stage",
                        key,
                        stage.name()
                    ),
                    Some(field.location),
                ))
            }
        };

        let group_key = BuiltInGroupKey {
            input: is_input,
            block: block.interface_block,
        };
        let block = block.clone();
        let (group, existed) = info.builtin_group(group_key);

        if block.interface_block {
            // Interface blocks are declared whole, once: every member must
            // exist so adjoining stages agree on the block layout.
            if !existed {
                group.name = if is_input { "PerVertexIn" } else { "PerVertexOut" }.into();
                group.is_struct = true;
                group.is_builtin = true;
                group
                    .type_decorations
                    .push(DecorationParam::new(Decoration::Block));
                for builtin_field in &block.fields {
                    let field_info = group
                        .push_field(ShaderFieldMeta::new(&builtin_field.name, &builtin_field.type_name));
                    field_info.decorations.push(DecorationParam::with_value(
                        Decoration::BuiltIn,
                        builtin_field.builtin as u32,
                    ));
                }
            }
        } else {
            group.is_struct = false;
            group.is_builtin = true;
            if group.find_field(&key).is_none() {
                if let Some(builtin_field) = block.find_field(&key) {
                    let builtin = builtin_field.builtin;
                    let field_info = group.find_or_create_field(&key);
                    field_info
                        .decorations
                        .push(DecorationParam::with_value(Decoration::BuiltIn, builtin as u32));
                }
            }
        }

        if let Some(index) = group.find_field(&key) {
            group.fields[index].linked_fields.push(field.clone());
        }
        Ok(())
    }

    /// Route a uniform-attributed field to its buffer group.
    fn process_uniform_field(
        &mut self,
        info: &mut ShaderInterfaceInfo,
        stage: FragmentKind,
        field: &ShaderFieldMeta,
        attribute: &ShaderAttribute,
    ) -> Result<()> {
        let key = field.make_field_key(Some(attribute));
        let buffer_index = self
            .settings
            .find_uniform_field(&key, stage)
            .map(|(index, _)| index);

        let default_buffer = &self.settings.default_uniform_buffer;
        let (description, is_default) = match buffer_index {
            Some(index) => (&self.settings.uniform_buffers[index], false),
            None => (default_buffer, true),
        };

        let mut binding_id = description.binding_id;
        if is_default && !self.settings.allow_material_binding_overlap {
            // Offset the material buffer per stage so simultaneous stages
            // never alias one binding.
            binding_id += match stage {
                FragmentKind::None => 0,
                FragmentKind::Vertex => 1,
                FragmentKind::Geometry => 2,
                FragmentKind::Pixel => 3,
                FragmentKind::Compute => 4,
            };
        }

        let description = description.clone();
        let (group, existed) = info.uniform_group(buffer_index);
        if !existed {
            group.name = description.name.clone();
            group.is_struct = true;
            group
                .instance_decorations
                .push(DecorationParam::with_value(
                    Decoration::DescriptorSet,
                    description.descriptor_set_id,
                ));
            group
                .instance_decorations
                .push(DecorationParam::with_value(Decoration::Binding, binding_id));
            group.reflection.instance_name = description.name.clone();
            group.reflection.descriptor_set = description.descriptor_set_id;
            group.reflection.binding = binding_id;

            // User-defined buffers bind whole: copy every declared field so
            // the layout matches the application's description exactly.
            if !is_default {
                for buffer_field in &description.fields {
                    group.push_field(buffer_field.clone());
                }
            }
        }
        self.used_binding_ids.insert(group.reflection.binding);

        if is_default && group.find_field(&key).is_none() {
            group.push_field(ShaderFieldMeta::new(key.name.clone(), key.type_name.clone()));
        }
        if let Some(index) = group.find_field(&key) {
            group.fields[index].linked_fields.push(field.clone());
        }
        Ok(())
    }

    // Group realization

    fn decorate_uniform_groups(&mut self, info: &mut ShaderInterfaceInfo) -> Result<()> {
        for (_, group) in &mut info.uniform_groups {
            add_offset_decorations(self.lib, group)?;
        }
        Ok(())
    }

    pub(crate) fn declare_stage_blocks(
        &mut self,
        info: &ShaderInterfaceInfo,
        entry_point: &mut EntryPointInfo,
        copy_inputs: &mut CopyHelper,
        copy_outputs: &mut CopyHelper,
        fragment: TypeId,
    ) -> Result<RealizedInterface> {
        let inputs = self.declare_block(&info.inputs, entry_point, copy_inputs, fragment)?;
        let outputs = self.declare_block(&info.outputs, entry_point, copy_outputs, fragment)?;

        let mut builtins = Vec::new();
        for (key, group) in &info.builtin_groups {
            let helper = if key.input {
                &mut *copy_inputs
            } else {
                &mut *copy_outputs
            };
            if let Some(block) = self.declare_block(group, entry_point, helper, fragment)? {
                builtins.push(block);
            }
        }

        let mut uniforms = Vec::new();
        for (_, group) in &info.uniform_groups {
            if let Some(block) = self.declare_block(group, entry_point, copy_inputs, fragment)? {
                uniforms.push(block);
            }
        }

        Ok(RealizedInterface {
            inputs,
            outputs,
            builtins,
            uniforms,
        })
    }

    pub(crate) fn declare_block(
        &mut self,
        group: &InterfaceGroup,
        entry_point: &mut EntryPointInfo,
        helper: &mut CopyHelper,
        fragment: TypeId,
    ) -> Result<Option<InterfaceBlock>> {
        if group.fields.is_empty() {
            return Ok(None);
        }
        debug!(
            "declaring interface group '{}' ({} fields, struct: {})",
            group.name,
            group.fields.len(),
            group.is_struct
        );
        let block = if group.is_struct {
            self.realize_block_struct(group, entry_point)?
        } else {
            self.realize_block_no_struct(group, entry_point)?
        };
        self.copy_block(&block, group, helper, fragment)?;
        Ok(Some(block))
    }

    /// Declare, decorate and define a group without generating copies.
    /// Geometry output interfaces are written by the specialized Append
    /// clones instead of a copy helper.
    pub(crate) fn realize_block(
        &mut self,
        group: &InterfaceGroup,
        entry_point: &mut EntryPointInfo,
    ) -> Result<Option<InterfaceBlock>> {
        if group.fields.is_empty() {
            return Ok(None);
        }
        let block = if group.is_struct {
            self.realize_block_struct(group, entry_point)?
        } else {
            self.realize_block_no_struct(group, entry_point)?
        };
        Ok(Some(block))
    }

    fn copy_block(
        &mut self,
        block: &InterfaceBlock,
        group: &InterfaceGroup,
        helper: &mut CopyHelper,
        fragment: TypeId,
    ) -> Result<()> {
        match block {
            InterfaceBlock::Struct(realized) => {
                for index in 0..realized.fields.len() {
                    let interface_ptr = realized.field_pointer(self.lib, &mut helper.block, index)?;
                    self.copy_linked_fields(
                        &realized.fields[index],
                        interface_ptr,
                        group,
                        helper,
                        fragment,
                    )?;
                }
            }
            InterfaceBlock::Globals(realized) => {
                for (index, instance) in realized.instances.iter().enumerate() {
                    self.copy_linked_fields(&realized.fields[index], *instance, group, helper, fragment)?;
                }
            }
            InterfaceBlock::StructArray(_) => {}
        }
        Ok(())
    }

    fn realize_fields(&mut self, group: &InterfaceGroup) -> Result<Vec<InterfaceField>> {
        let mut fields = Vec::with_capacity(group.fields.len());
        for (index, field) in group.fields.iter().enumerate() {
            let original_type = self.lib.find_type(&field.meta.type_name).ok_or_else(|| {
                CompilerError::LinkError(
                    format!(
                        "interface field '{}' has unknown type '{}'",
                        field.meta.name, field.meta.type_name
                    ),
                    Some(field.meta.location),
                )
            })?;
            let field_type = if group.is_builtin {
                original_type
            } else {
                self.convert_interface_type(original_type)
            };
            fields.push(InterfaceField {
                index: index as u32,
                name: field.meta.name.clone(),
                field_type,
                original_type,
                key: field.meta.make_field_key(None),
                linked_fields: field.linked_fields.clone(),
            });
        }
        Ok(fields)
    }

    /// Booleans are not valid in non-built-in interfaces; they are declared
    /// as ints and converted in the copy helpers.
    fn convert_interface_type(&self, ty: TypeId) -> TypeId {
        match self.lib.type_ref(ty).kind {
            TypeKind::Bool => self.lib.int_type,
            _ => ty,
        }
    }

    fn realize_block_struct(
        &mut self,
        group: &InterfaceGroup,
        entry_point: &mut EntryPointInfo,
    ) -> Result<InterfaceBlock> {
        let fields = self.realize_fields(group)?;
        let members: Vec<(String, TypeId)> = fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type))
            .collect();
        let struct_type = self.lib.struct_type(group.name.clone(), &members);

        for decoration in &group.type_decorations {
            self.write_decoration(entry_point, Operand::Type(struct_type), *decoration);
        }
        for (index, field) in group.fields.iter().enumerate() {
            for decoration in &field.decorations {
                self.write_member_decoration(entry_point, struct_type, index as u32, *decoration);
            }
            for decoration in &field.type_decorations {
                let member_type = fields[index].field_type;
                self.write_decoration(entry_point, Operand::Type(member_type), *decoration);
            }
        }

        let instance_name = group.name.to_ascii_lowercase();
        let instance = self
            .lib
            .make_global_variable(struct_type, group.storage_class, instance_name)?;
        for decoration in &group.instance_decorations {
            self.write_decoration(entry_point, Operand::Op(instance), *decoration);
        }
        entry_point.variables.push(instance);
        if matches!(group.storage_class, StorageClass::Input | StorageClass::Output) {
            entry_point.interface.push(instance);
        }

        Ok(InterfaceBlock::Struct(StructInterface {
            struct_type,
            instance,
            storage_class: group.storage_class,
            fields,
        }))
    }

    fn realize_block_no_struct(
        &mut self,
        group: &InterfaceGroup,
        entry_point: &mut EntryPointInfo,
    ) -> Result<InterfaceBlock> {
        let fields = self.realize_fields(group)?;
        let mut instances = Vec::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            let instance = self.lib.make_global_variable(
                field.field_type,
                group.storage_class,
                field.name.clone(),
            )?;
            for decoration in &group.fields[index].decorations {
                self.write_decoration(entry_point, Operand::Op(instance), *decoration);
            }
            for decoration in &group.fields[index].type_decorations {
                self.write_decoration(entry_point, Operand::Type(field.field_type), *decoration);
            }
            entry_point.variables.push(instance);
            if matches!(group.storage_class, StorageClass::Input | StorageClass::Output) {
                entry_point.interface.push(instance);
            }
            instances.push(instance);
        }

        Ok(InterfaceBlock::Globals(GlobalsInterface {
            storage_class: group.storage_class,
            fields,
            instances,
        }))
    }

    /// Copy one interface field to or from every fragment field linked to
    /// it. Direction follows the group's storage class: outputs load the
    /// fragment member and store the interface, everything else loads the
    /// interface and stores the fragment member.
    fn copy_linked_fields(
        &mut self,
        field: &InterfaceField,
        interface_ptr: OpId,
        group: &InterfaceGroup,
        helper: &mut CopyHelper,
        fragment: TypeId,
    ) -> Result<()> {
        for linked in &field.linked_fields {
            let member_index = self
                .lib
                .type_ref(fragment)
                .member_index(&linked.name)
                .ok_or_else(|| {
                    CompilerError::BackendError(format!(
                        "fragment member '{}' missing from its struct type",
                        linked.name
                    ))
                })?;
            let member_type = match &self.lib.type_ref(fragment).kind {
                TypeKind::Struct { members } => members[member_index as usize],
                _ => {
                    return Err(CompilerError::BackendError(
                        "entry point type is not a struct".into(),
                    ))
                }
            };
            let self_ptr = self.lib.build_access_chain(
                &mut helper.block,
                member_type,
                StorageClass::Function,
                helper.self_param,
                &[member_index],
            )?;

            if group.storage_class == StorageClass::Output {
                let value = self.lib.build_load(&mut helper.block, member_type, self_ptr);
                let value =
                    self.convert_value(&mut helper.block, value, member_type, field.field_type);
                self.lib.build_store(&mut helper.block, interface_ptr, value);
            } else {
                let value = self
                    .lib
                    .build_load(&mut helper.block, field.field_type, interface_ptr);
                let value =
                    self.convert_value(&mut helper.block, value, field.field_type, member_type);
                self.lib.build_store(&mut helper.block, self_ptr, value);
            }
        }
        Ok(())
    }

    /// Bridge the bool/int conversion between interface storage and the
    /// fragment's declared type.
    fn convert_value(
        &mut self,
        block: &mut BasicBlock,
        value: OpId,
        from: TypeId,
        to: TypeId,
    ) -> OpId {
        if from == to {
            return value;
        }
        let bool_type = self.lib.bool_type;
        let int_type = self.lib.int_type;
        if from == int_type && to == bool_type {
            let zero = self.lib.constant_int(0);
            self.lib.build_op(
                block,
                spirv::Op::INotEqual,
                Some(bool_type),
                vec![Operand::Op(value), Operand::Op(zero)],
            )
        } else if from == bool_type && to == int_type {
            let zero = self.lib.constant_int(0);
            let one = self.lib.constant_int(1);
            self.lib.build_op(
                block,
                spirv::Op::Select,
                Some(int_type),
                vec![Operand::Op(value), Operand::Op(one), Operand::Op(zero)],
            )
        } else {
            value
        }
    }

    // Decorations

    pub(crate) fn write_decoration(
        &mut self,
        entry_point: &mut EntryPointInfo,
        target: Operand,
        decoration: DecorationParam,
    ) {
        let mut operands = vec![target, Operand::Literal(decoration.decoration as u32)];
        if let Some(value) = decoration.value {
            operands.push(Operand::Literal(value));
        }
        let op = self.lib.add_op(Op::new(spirv::Op::Decorate, None, operands));
        entry_point.decorations.push(op);
    }

    fn write_member_decoration(
        &mut self,
        entry_point: &mut EntryPointInfo,
        struct_type: TypeId,
        member: u32,
        decoration: DecorationParam,
    ) {
        let mut operands = vec![
            Operand::Type(struct_type),
            Operand::Literal(member),
            Operand::Literal(decoration.decoration as u32),
        ];
        if let Some(value) = decoration.value {
            operands.push(Operand::Literal(value));
        }
        let op = self
            .lib
            .add_op(Op::new(spirv::Op::MemberDecorate, None, operands));
        entry_point.decorations.push(op);
    }

    /// Vertex inputs take their location from the application's vertex
    /// definition; fields outside it are appended after the last one.
    fn add_vertex_location_decorations(&mut self, group: &mut InterfaceGroup) {
        let definitions = &self.settings.vertex_definition.fields;
        let mut next_location = definitions.len() as u32;
        for (index, field) in group.fields.iter_mut().enumerate() {
            let key = field.meta.make_field_key(None);
            let location = match definitions
                .iter()
                .position(|d| d.make_field_key(None) == key)
            {
                Some(position) => position as u32,
                None => {
                    let location = next_location;
                    next_location += 1;
                    location
                }
            };
            field
                .decorations
                .push(DecorationParam::with_value(Decoration::Location, location));
            field.reflection.location = index as u32;
        }
    }

    /// Pixel outputs take their location from the render-target table.
    fn add_pixel_location_decorations(&mut self, group: &mut InterfaceGroup) {
        let target_type = self.settings.render_target_type.clone();
        let targets = &self.settings.render_target_names;
        let mut next_location = targets.len() as u32;
        for (index, field) in group.fields.iter_mut().enumerate() {
            let key = field.meta.make_field_key(None);
            let location = match targets
                .iter()
                .position(|name| key.name == *name && key.type_name == target_type)
            {
                Some(position) => position as u32,
                None => {
                    let location = next_location;
                    next_location += 1;
                    location
                }
            };
            field
                .decorations
                .push(DecorationParam::with_value(Decoration::Location, location));
            field.reflection.location = index as u32;
        }
    }

    /// Integer and bool inputs must use flat interpolation.
    fn add_flat_decorations(&mut self, group: &mut InterfaceGroup) -> Result<()> {
        for field in &mut group.fields {
            let Some(field_type) = self.lib.find_type(&field.meta.type_name) else {
                continue;
            };
            if self.is_integral(field_type) {
                field.decorations.push(DecorationParam::new(Decoration::Flat));
            }
        }
        Ok(())
    }

    fn is_integral(&self, ty: TypeId) -> bool {
        match &self.lib.type_ref(ty).kind {
            TypeKind::Bool | TypeKind::Int { .. } => true,
            TypeKind::Vector { component, .. } => self.is_integral(*component),
            _ => false,
        }
    }

    // Opaque resources

    /// Lowest unused binding id across everything this generation call has
    /// assigned so far.
    pub(crate) fn find_binding_id(&mut self) -> u32 {
        let mut id = 0;
        while self.used_binding_ids.contains(&id) {
            id += 1;
        }
        self.used_binding_ids.insert(id);
        id
    }

    /// Declare and decorate the fragment's opaque resources: images,
    /// samplers, sampled images, and runtime-array storage buffers. All
    /// bindings live in descriptor set 0.
    fn decorate_resources(
        &mut self,
        meta: &ShaderTypeMeta,
        entry_point: &mut EntryPointInfo,
    ) -> Result<()> {
        for field in &meta.fields {
            let Some(field_type) = self.lib.find_type(&field.type_name) else {
                continue;
            };
            if !self.lib.is_opaque_resource(field_type) {
                continue;
            }

            let resource_name = make_property_name(&field.name, &meta.name);
            let kind = self.lib.type_ref(field_type).kind.clone();
            let (storage_class, declared_type) = match kind {
                TypeKind::RuntimeArray { .. } => {
                    // Runtime arrays bind through a Block-decorated wrapper
                    // struct in storage-buffer storage.
                    let wrapper = self.lib.struct_type(
                        format!("{}_Buffer", resource_name),
                        &[("Data".to_string(), field_type)],
                    );
                    self.write_decoration(
                        entry_point,
                        Operand::Type(wrapper),
                        DecorationParam::new(Decoration::Block),
                    );
                    self.write_member_decoration(
                        entry_point,
                        wrapper,
                        0,
                        DecorationParam::with_value(Decoration::Offset, 0),
                    );
                    (StorageClass::StorageBuffer, wrapper)
                }
                _ => (StorageClass::UniformConstant, field_type),
            };

            let instance =
                self.lib
                    .make_global_variable(declared_type, storage_class, resource_name.clone())?;
            let binding = self.find_binding_id();
            self.write_decoration(
                entry_point,
                Operand::Op(instance),
                DecorationParam::with_value(Decoration::Binding, binding),
            );
            self.write_decoration(
                entry_point,
                Operand::Op(instance),
                DecorationParam::with_value(Decoration::DescriptorSet, 0),
            );
            entry_point.variables.push(instance);

            let resource = StageResource {
                reflection: ResourceReflection {
                    instance_name: resource_name,
                    type_name: field.type_name.clone(),
                    binding,
                    descriptor_set: 0,
                    location: binding,
                    ..ResourceReflection::default()
                },
                members: Vec::new(),
            };
            match kind {
                TypeKind::Image { format, .. } => {
                    if format.is_storage_image() {
                        entry_point.reflection.storage_images.push(resource);
                    } else {
                        entry_point.reflection.sampled_images.push(resource);
                    }
                }
                TypeKind::Sampler => entry_point.reflection.samplers.push(resource),
                TypeKind::SampledImage { .. } => {
                    entry_point.reflection.sampled_images.push(resource)
                }
                TypeKind::RuntimeArray { .. } => {
                    entry_point.reflection.storage_buffers.push(resource)
                }
                _ => {}
            }
        }
        Ok(())
    }

    // Reflection

    fn copy_reflection_to_entry_point(
        &mut self,
        entry_point: &mut EntryPointInfo,
        info: &ShaderInterfaceInfo,
    ) {
        for field in &info.inputs.fields {
            entry_point
                .reflection
                .stage_inputs
                .push(Self::field_resource(field));
        }
        for field in &info.outputs.fields {
            entry_point
                .reflection
                .stage_outputs
                .push(Self::field_resource(field));
        }
        for (_, group) in &info.uniform_groups {
            let mut resource = StageResource {
                reflection: group.reflection.clone(),
                members: Vec::new(),
            };
            resource.reflection.instance_name = group.name.clone();
            for field in &group.fields {
                let mut member = field.reflection.clone();
                member.instance_name = field.meta.name.clone();
                member.type_name = field.meta.type_name.clone();
                resource.members.push(member);
            }
            entry_point.reflection.uniform_buffers.push(resource);
        }
    }

    fn field_resource(field: &interface::InterfaceFieldInfo) -> StageResource {
        let mut reflection = field.reflection.clone();
        reflection.instance_name = field.meta.name.clone();
        reflection.type_name = field.meta.type_name.clone();
        StageResource {
            reflection,
            members: Vec::new(),
        }
    }

    // Execution modes

    pub(crate) fn write_execution_mode(
        &mut self,
        entry_point: &mut EntryPointInfo,
        mode: ExecutionMode,
        literals: &[u32],
    ) {
        let mut operands = vec![
            Operand::Function(entry_point.entry_fn),
            Operand::Literal(mode as u32),
        ];
        operands.extend(literals.iter().map(|l| Operand::Literal(*l)));
        let op = self
            .lib
            .add_op(Op::new(spirv::Op::ExecutionMode, None, operands));
        entry_point.execution_modes.push(op);
    }
}
