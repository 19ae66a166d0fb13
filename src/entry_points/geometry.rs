//! Geometry-stage entry points.
//!
//! Geometry shaders read an array of input vertices and append output
//! vertices to a stream, so their interface is an array-of-struct on the
//! input side and their copies split in two: the copy-in helper fills the
//! user's input stream per vertex, and a specialized clone of the stream's
//! Append function writes the output interface per emitted vertex. The
//! clone is late-bound: it replaces the generic Append at emission time
//! while keeping its identity, so a shared function is never corrupted.

use super::interface::{InterfaceBlock, InterfaceGroup, StructArrayInterface, StructInterface};
use super::{CopyHelper, EntryPointGeneration, EntryPointInfo};
use crate::error::{CompilerError, Result};
use crate::ir::{BasicBlock, FunctionId, OpId, TypeId, TypeKind};
use crate::meta::{FragmentKind, ShaderTypeMeta};
use rspirv::spirv::{self, Capability, Decoration, StorageClass};

use super::interface::DecorationParam;

impl EntryPointGeneration<'_> {
    /// Declare the full geometry-stage entry point for a fragment whose
    /// Main has the signature `(self, inputStream, outputStream)`.
    ///
    /// `append_fn` is the output stream's Append function; when present a
    /// provoking-vertex specialization is generated and registered as its
    /// late-bound replacement.
    pub fn declare_geometry_interface(
        &mut self,
        fragment: TypeId,
        main_fn: FunctionId,
        append_fn: Option<FunctionId>,
    ) -> Result<EntryPointInfo> {
        self.used_binding_ids.clear();
        let meta = self.fragment_meta(fragment)?;
        let geometry = match meta.geometry.clone() {
            Some(geometry) => geometry,
            None => {
                return Err(CompilerError::SignatureError(
                    format!("geometry fragment '{}' declares no stream types", meta.name),
                    Some(meta.location),
                ))
            }
        };

        let input_vertex = self.stream_vertex_type(&geometry.input_vertex_type, &meta)?;
        let output_vertex = self.stream_vertex_type(&geometry.output_vertex_type, &meta)?;
        let input_vertex_meta = self.fragment_meta(input_vertex)?;
        let output_vertex_meta = self.fragment_meta(output_vertex)?;
        let input_count = geometry.input_primitive.vertex_count();

        let void = self.lib.void_type;
        let input_stream_type = self.lib.fixed_array_type(input_vertex, input_count);
        let output_stream_type = self.lib.fixed_array_type(output_vertex, geometry.max_vertices);

        // Copy-in takes the input stream alongside self so it can fill the
        // user's per-vertex data.
        let self_pointer = self.lib.pointer_to(fragment, StorageClass::Function)?;
        let stream_pointer = self.lib.pointer_to(input_stream_type, StorageClass::Function)?;
        let copy_fn = self.lib.create_function(
            format!("CopyInputs_{}", meta.name),
            void,
            &[self_pointer, stream_pointer],
        );
        let self_param = self.lib.function_ref(copy_fn).parameters[0];
        let stream_param = self.lib.function_ref(copy_fn).parameters[1];
        self.lib.set_debug_name(self_param, "self");
        self.lib.set_debug_name(stream_param, "inputStream");
        let mut copy_inputs = CopyHelper {
            function: copy_fn,
            self_param,
            block: self.lib.new_block(),
        };
        let mut copy_outputs = self.generate_copy_helper(fragment, "CopyOutputs", &meta.name)?;

        let entry_fn = self
            .lib
            .create_function(format!("EntryPoint_Main_{}", meta.name), void, &[]);
        let mut entry_point = EntryPointInfo::new(entry_fn, fragment, FragmentKind::Geometry);
        entry_point.reflection.shader_type_name = meta.name.clone();
        entry_point.reflection.fragment_kind = FragmentKind::Geometry;
        let globals_init = self.create_globals_initializer(&meta.name);
        entry_point.globals_initializer = Some(globals_init);

        // Input vertex interface: one array-of-struct per group, sized by
        // the input primitive.
        let mut input_info = self.collect_interface_variables(&input_vertex_meta, FragmentKind::Geometry)?;
        input_info.inputs.is_struct = true;
        input_info.inputs.name = "In".into();
        input_info
            .inputs
            .type_decorations
            .push(DecorationParam::new(Decoration::Block));
        input_info
            .inputs
            .instance_decorations
            .push(DecorationParam::with_value(Decoration::Location, 0));

        let mut input_interfaces = Vec::new();
        let input_groups: Vec<InterfaceGroup> = {
            let mut groups = vec![input_info.inputs.clone()];
            for (key, group) in &input_info.builtin_groups {
                if key.input && key.block {
                    groups.push(group.clone());
                }
            }
            groups
        };
        for group in &input_groups {
            if let Some(interface) =
                self.declare_geometry_vertex_input(group, &mut entry_point, input_count)?
            {
                self.copy_stream_inputs(&interface, &mut copy_inputs.block, stream_param, input_vertex)?;
                input_interfaces.push(interface);
            }
        }

        // Output vertex interface: declared like the next stage expects,
        // but written by the Append clones rather than a copy helper.
        let mut output_info =
            self.collect_interface_variables(&output_vertex_meta, FragmentKind::Geometry)?;
        output_info.outputs.is_struct = true;
        output_info.outputs.name = "Out".into();
        output_info
            .outputs
            .type_decorations
            .push(DecorationParam::new(Decoration::Block));
        output_info
            .outputs
            .instance_decorations
            .push(DecorationParam::with_value(Decoration::Location, 0));

        let mut output_interfaces = Vec::new();
        if let Some(block) = self.realize_block(&output_info.outputs, &mut entry_point)? {
            output_interfaces.push(block);
        }
        let output_builtin_groups: Vec<InterfaceGroup> = output_info
            .builtin_groups
            .iter()
            .filter(|(key, _)| !key.input)
            .map(|(_, group)| group.clone())
            .collect();
        for group in &output_builtin_groups {
            if let Some(block) = self.realize_block(group, &mut entry_point)? {
                output_interfaces.push(block);
            }
        }

        // The geometry fragment's own primitive-level fields (uniforms,
        // properties, primitive built-ins) copy against self as usual.
        let mut own_info = self.collect_interface_variables(&meta, FragmentKind::Geometry)?;
        self.decorate_uniform_groups(&mut own_info)?;
        self.declare_stage_blocks(&own_info, &mut entry_point, &mut copy_inputs, &mut copy_outputs, fragment)?;

        // Late-bound Append specialization for the composited stream.
        if let Some(append) = append_fn {
            let clone = self.generate_provoking_vertex_append(
                append,
                output_vertex,
                &output_interfaces,
                &input_interfaces,
            )?;
            entry_point.late_bound_functions.insert(append, clone);
        }

        // Wrapper main: globals-init, construct self, fill the input
        // stream, hand both streams to the user Main.
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
        let input_stream_var = self.lib.make_local_variable(input_stream_type, "inputStream")?;
        let output_stream_var = self.lib.make_local_variable(output_stream_type, "outputStream")?;
        block.local_variables.push(input_stream_var);
        block.local_variables.push(output_stream_var);

        self.lib.build_call(&mut block, void, constructor, &[self_var]);
        self.lib
            .build_call(&mut block, void, copy_inputs.function, &[self_var, input_stream_var]);
        self.lib.build_call(
            &mut block,
            void,
            main_fn,
            &[self_var, input_stream_var, output_stream_var],
        );
        self.lib
            .build_call(&mut block, void, copy_outputs.function, &[self_var]);
        self.lib.build_return(&mut block);
        self.lib.function_mut(entry_fn).blocks.push(block);

        self.finish_copy_helper(copy_inputs);
        self.finish_copy_helper(copy_outputs);

        // Topology and vertex-count execution modes; exactly these three.
        self.write_execution_mode(
            &mut entry_point,
            spirv::ExecutionMode::OutputVertices,
            &[geometry.max_vertices],
        );
        self.write_execution_mode(&mut entry_point, geometry.input_primitive.execution_mode(), &[]);
        self.write_execution_mode(&mut entry_point, geometry.output_primitive.execution_mode(), &[]);
        entry_point.capabilities.push(Capability::Geometry);

        self.decorate_resources(&meta, &mut entry_point)?;
        self.copy_reflection_to_entry_point(&mut entry_point, &input_info);
        self.copy_reflection_to_entry_point(&mut entry_point, &output_info);
        self.copy_reflection_to_entry_point(&mut entry_point, &own_info);
        Ok(entry_point)
    }

    fn stream_vertex_type(&self, name: &str, meta: &ShaderTypeMeta) -> Result<TypeId> {
        self.lib.find_type(name).ok_or_else(|| {
            CompilerError::SignatureError(
                format!(
                    "geometry fragment '{}' references unknown stream vertex type '{}'",
                    meta.name, name
                ),
                Some(meta.location),
            )
        })
    }

    /// Realize one input group as an item struct wrapped in a fixed array
    /// sized by the input primitive.
    fn declare_geometry_vertex_input(
        &mut self,
        group: &InterfaceGroup,
        entry_point: &mut EntryPointInfo,
        length: u32,
    ) -> Result<Option<StructArrayInterface>> {
        if group.fields.is_empty() {
            return Ok(None);
        }
        let fields = self.realize_fields(group)?;
        let members: Vec<(String, TypeId)> = fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type))
            .collect();
        let item_type = self.lib.struct_type(group.name.clone(), &members);

        for decoration in &group.type_decorations {
            self.write_decoration(entry_point, crate::ir::Operand::Type(item_type), *decoration);
        }
        for (index, field) in group.fields.iter().enumerate() {
            for decoration in &field.decorations {
                self.write_member_decoration(entry_point, item_type, index as u32, *decoration);
            }
        }

        let array_type = self.lib.fixed_array_type(item_type, length);
        let instance = self.lib.make_global_variable(
            array_type,
            StorageClass::Input,
            group.name.to_ascii_lowercase(),
        )?;
        for decoration in &group.instance_decorations {
            self.write_decoration(entry_point, crate::ir::Operand::Op(instance), *decoration);
        }
        entry_point.variables.push(instance);
        entry_point.interface.push(instance);

        Ok(Some(StructArrayInterface {
            array_type,
            instance,
            storage_class: StorageClass::Input,
            length,
            element: StructInterface {
                struct_type: item_type,
                instance,
                storage_class: StorageClass::Input,
                fields,
            },
        }))
    }

    /// Fill the user's input stream from the interface arrays, one copy
    /// per vertex slot. Input primitives are small, so the copies unroll
    /// with constant indices.
    fn copy_stream_inputs(
        &mut self,
        interface: &StructArrayInterface,
        block: &mut BasicBlock,
        stream_param: OpId,
        vertex_struct: TypeId,
    ) -> Result<()> {
        for element in 0..interface.length {
            for (field_index, field) in interface.element.fields.iter().enumerate() {
                for linked in &field.linked_fields {
                    let Some(member_index) =
                        self.lib.type_ref(vertex_struct).member_index(&linked.name)
                    else {
                        continue;
                    };
                    let member_type = match &self.lib.type_ref(vertex_struct).kind {
                        TypeKind::Struct { members } => members[member_index as usize],
                        _ => continue,
                    };
                    let source =
                        interface.field_pointer_at(self.lib, block, element, field_index)?;
                    let destination = self.lib.build_access_chain(
                        block,
                        member_type,
                        StorageClass::Function,
                        stream_param,
                        &[element, member_index],
                    )?;
                    let value = self.lib.build_load(block, field.field_type, source);
                    let value = self.convert_value(block, value, field.field_type, member_type);
                    self.lib.build_store(block, destination, value);
                }
            }
        }
        Ok(())
    }

    /// Build the specialized Append clone for one composited output
    /// stream: copy the appended vertex's fields into the output
    /// interface, thread pass-through fields from the provoking vertex of
    /// the input stream, then emit.
    fn generate_provoking_vertex_append(
        &mut self,
        original: FunctionId,
        output_vertex: TypeId,
        output_interfaces: &[InterfaceBlock],
        input_interfaces: &[StructArrayInterface],
    ) -> Result<FunctionId> {
        let original_name = self.lib.function_ref(original).name.clone();
        let function_type = self.lib.function_ref(original).function_type;
        let parameter_types: Vec<TypeId> = match &self.lib.type_ref(function_type).kind {
            TypeKind::Function { parameters, .. } => parameters.clone(),
            _ => {
                return Err(CompilerError::BackendError(
                    "append function has a non-function type".into(),
                ))
            }
        };
        if parameter_types.len() < 2 {
            return Err(CompilerError::BackendError(format!(
                "append function '{}' must take a stream and a vertex",
                original_name
            )));
        }

        let void = self.lib.void_type;
        let return_type = self.lib.function_return_type(original)?;
        debug_assert_eq!(return_type, void);
        let clone = self
            .lib
            .create_function(original_name.clone(), return_type, &parameter_types);
        let data_param = self.lib.function_ref(clone).parameters[1];
        self.lib.set_debug_name(data_param, "appendedVertex");

        let mut block = self.lib.new_block();
        for interface in output_interfaces {
            for field_index in 0..interface.field_count() {
                let field = match interface.field_at(field_index) {
                    Some(field) => field.clone(),
                    None => continue,
                };
                let destination = interface.field_pointer(self.lib, &mut block, field_index)?;

                if let Some(member_index) =
                    self.lib.member_index_by_key(output_vertex, &field.key)
                {
                    // Declared on the appended vertex: copy it out.
                    let member_type = match &self.lib.type_ref(output_vertex).kind {
                        TypeKind::Struct { members } => members[member_index as usize],
                        _ => continue,
                    };
                    let source = self.lib.build_access_chain(
                        &mut block,
                        member_type,
                        StorageClass::Function,
                        data_param,
                        &[member_index],
                    )?;
                    let value = self.lib.build_load(&mut block, member_type, source);
                    let value = self.convert_value(&mut block, value, member_type, field.field_type);
                    self.lib.build_store(&mut block, destination, value);
                } else if let Some((input, input_index)) = input_interfaces
                    .iter()
                    .find_map(|i| i.element.fields.iter().position(|f| f.key == field.key).map(|p| (i, p)))
                {
                    // Pass-through: the provoking vertex's value survives
                    // unchanged.
                    let source =
                        input.field_pointer_at(self.lib, &mut block, 0, input_index)?;
                    let source_type = input.element.fields[input_index].field_type;
                    let value = self.lib.build_load(&mut block, source_type, source);
                    let value = self.convert_value(&mut block, value, source_type, field.field_type);
                    self.lib.build_store(&mut block, destination, value);
                }
            }
        }
        self.lib.build_op(&mut block, spirv::Op::EmitVertex, None, vec![]);
        self.lib.build_return(&mut block);
        self.lib.function_mut(clone).blocks.push(block);
        Ok(clone)
    }
}
