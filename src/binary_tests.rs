#![cfg(test)]

use crate::binary::BinaryBackend;
use crate::entry_points::EntryPointGeneration;
use crate::ir::{FunctionId, Op, Operand, ShaderLibrary, TypeId};
use crate::meta::{
    FragmentKind, GeometryFragmentInfo, InputPrimitive, OutputPrimitive, ShaderAttribute,
    ShaderFieldMeta, ShaderTypeMeta,
};
use crate::settings::TranslationSettings;
use rspirv::spirv::{self, StorageClass};

fn settings() -> TranslationSettings {
    let mut settings = TranslationSettings::new();
    settings.add_vertex_definition_field("Uv", "Float2").unwrap();
    settings
        .set_render_target_names(vec!["Color".into()])
        .unwrap();
    settings.finalize().unwrap();
    settings
}

fn register_fragment(lib: &mut ShaderLibrary, meta: &ShaderTypeMeta) -> (TypeId, FunctionId) {
    let fragment = lib.register_fragment(meta).unwrap();
    let self_pointer = lib.pointer_to(fragment, StorageClass::Function).unwrap();
    let void = lib.void_type;
    let main = lib.create_function(format!("{}_Main", meta.name), void, &[self_pointer]);
    let mut block = lib.new_block();
    lib.build_return(&mut block);
    lib.function_mut(main).blocks.push(block);
    (fragment, main)
}

fn field(name: &str, type_name: &str, attribute: &str) -> ShaderFieldMeta {
    ShaderFieldMeta::new(name, type_name).with_attribute(ShaderAttribute::new(attribute))
}

/// Split the module into (opcode, operand words) records, checking the
/// word-count framing is self-consistent.
fn instructions(words: &[u32]) -> Vec<(u16, Vec<u32>)> {
    assert!(words.len() > 5);
    let mut result = Vec::new();
    let mut index = 5;
    while index < words.len() {
        let word_count = (words[index] >> 16) as usize;
        let opcode = (words[index] & 0xffff) as u16;
        assert!(word_count >= 1, "zero-length instruction at {}", index);
        assert!(index + word_count <= words.len(), "truncated instruction");
        result.push((opcode, words[index + 1..index + word_count].to_vec()));
        index += word_count;
    }
    assert_eq!(index, words.len());
    result
}

fn pixel_module() -> crate::binary::EmitResult {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    let meta = ShaderTypeMeta::new("DiffuseFrag", FragmentKind::Pixel)
        .with_field(field("Uv", "Float2", "StageInput"))
        .with_field(field("Color", "Float4", "StageOutput"));
    let (fragment, main) = register_fragment(&mut lib, &meta);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation.declare_pixel_interface(fragment, main).unwrap();
    BinaryBackend::translate_entry_points(&mut lib, &[entry_point]).unwrap()
}

#[test]
fn module_header_is_well_formed() {
    let result = pixel_module();
    let words = &result.words;

    assert_eq!(words[0], spirv::MAGIC_NUMBER);
    assert_eq!(words[1], (1 << 16) | (4 << 8));
    assert_eq!(words[2], 0);
    let bound = words[3];
    assert!(bound > 1);
    assert_eq!(words[4], 0);

    let instructions = instructions(words);
    // Capability, memory model, entry point, execution mode and source
    // records all present, in order.
    let opcodes: Vec<u16> = instructions.iter().map(|(op, _)| *op).collect();
    let capability = opcodes
        .iter()
        .position(|op| *op == spirv::Op::Capability as u16)
        .unwrap();
    let memory_model = opcodes
        .iter()
        .position(|op| *op == spirv::Op::MemoryModel as u16)
        .unwrap();
    let entry_point = opcodes
        .iter()
        .position(|op| *op == spirv::Op::EntryPoint as u16)
        .unwrap();
    let execution_mode = opcodes
        .iter()
        .position(|op| *op == spirv::Op::ExecutionMode as u16)
        .unwrap();
    let source = opcodes
        .iter()
        .position(|op| *op == spirv::Op::Source as u16)
        .unwrap();
    assert!(capability < memory_model);
    assert!(memory_model < entry_point);
    assert!(entry_point < execution_mode);
    assert!(execution_mode < source);
}

#[test]
fn every_referenced_identity_is_nonzero_and_below_the_bound() {
    let result = pixel_module();
    let bound = result.words[3];
    let instructions = instructions(&result.words);

    for (opcode, operands) in &instructions {
        // Id-carrying slots per opcode; literals are skipped.
        let id_slots: Vec<u32> = if *opcode == spirv::Op::FunctionCall as u16 {
            operands.clone()
        } else if *opcode == spirv::Op::Load as u16 {
            operands.clone()
        } else if *opcode == spirv::Op::Store as u16 {
            operands.clone()
        } else if *opcode == spirv::Op::AccessChain as u16 {
            operands.clone()
        } else if *opcode == spirv::Op::Decorate as u16 {
            vec![operands[0]]
        } else if *opcode == spirv::Op::Variable as u16 {
            vec![operands[0], operands[1]]
        } else if *opcode == spirv::Op::Function as u16 {
            vec![operands[0], operands[1], operands[3]]
        } else {
            continue;
        };
        for id in id_slots {
            assert_ne!(id, 0, "id 0 in {:?} instruction", opcode);
            assert!(id < bound, "id {} out of bound {}", id, bound);
        }
    }
}

#[test]
fn every_call_targets_a_defined_function() {
    let result = pixel_module();
    let instructions = instructions(&result.words);

    let defined: Vec<u32> = instructions
        .iter()
        .filter(|(op, _)| *op == spirv::Op::Function as u16)
        .map(|(_, operands)| operands[1])
        .collect();
    let called: Vec<u32> = instructions
        .iter()
        .filter(|(op, _)| *op == spirv::Op::FunctionCall as u16)
        .map(|(_, operands)| operands[2])
        .collect();
    assert!(!called.is_empty());
    for target in called {
        assert!(defined.contains(&target), "call to undefined function {}", target);
    }
}

#[test]
fn late_bound_append_clone_keeps_the_original_identity() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();

    let input_vertex = ShaderTypeMeta::new("GeoVertIn", FragmentKind::None)
        .with_field(field("Uv", "Float2", "StageInput"));
    let output_vertex = ShaderTypeMeta::new("GeoVertOut", FragmentKind::None)
        .with_field(field("Uv", "Float2", "StageOutput"));
    let input_type = lib.register_fragment(&input_vertex).unwrap();
    let output_type = lib.register_fragment(&output_vertex).unwrap();

    let mut meta = ShaderTypeMeta::new("Expander", FragmentKind::Geometry);
    meta.geometry = Some(GeometryFragmentInfo {
        max_vertices: 3,
        input_primitive: InputPrimitive::Points,
        output_primitive: OutputPrimitive::TriangleStrip,
        input_vertex_type: "GeoVertIn".into(),
        output_vertex_type: "GeoVertOut".into(),
    });
    let fragment = lib.register_fragment(&meta).unwrap();

    // The generic Append the front end lowered: it will be swapped for the
    // per-stream specialization at emission time.
    let void = lib.void_type;
    let out_stream = lib.fixed_array_type(output_type, 3);
    let out_stream_pointer = lib.pointer_to(out_stream, StorageClass::Function).unwrap();
    let out_vertex_pointer = lib.pointer_to(output_type, StorageClass::Function).unwrap();
    let append = lib.create_function("Append", void, &[out_stream_pointer, out_vertex_pointer]);
    let mut append_block = lib.new_block();
    lib.build_return(&mut append_block);
    lib.function_mut(append).blocks.push(append_block);

    // The user main calls Append once per emitted vertex.
    let self_pointer = lib.pointer_to(fragment, StorageClass::Function).unwrap();
    let in_stream = lib.fixed_array_type(input_type, 1);
    let in_stream_pointer = lib.pointer_to(in_stream, StorageClass::Function).unwrap();
    let main = lib.create_function(
        "Expander_Main",
        void,
        &[self_pointer, in_stream_pointer, out_stream_pointer],
    );
    let mut main_block = lib.new_block();
    let vertex_data = lib.make_local_variable(output_type, "vertexData").unwrap();
    main_block.local_variables.push(vertex_data);
    let stream_param = lib.function_ref(main).parameters[2];
    lib.build_call(&mut main_block, void, append, &[stream_param, vertex_data]);
    lib.build_return(&mut main_block);
    lib.function_mut(main).blocks.push(main_block);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation
        .declare_geometry_interface(fragment, main, Some(append))
        .unwrap();
    assert_eq!(entry_point.late_bound_functions.len(), 1);

    let result = BinaryBackend::translate_entry_points(&mut lib, &[entry_point]).unwrap();
    let instructions = instructions(&result.words);

    // The original Append body was not emitted, yet the call site resolves
    // to a defined function: the clone took over the original's id.
    let defined: Vec<u32> = instructions
        .iter()
        .filter(|(op, _)| *op == spirv::Op::Function as u16)
        .map(|(_, operands)| operands[1])
        .collect();
    for (opcode, operands) in &instructions {
        if *opcode == spirv::Op::FunctionCall as u16 {
            assert!(defined.contains(&operands[2]));
        }
    }

    // The specialized clone ends with EmitVertex.
    let emits = instructions
        .iter()
        .filter(|(op, _)| *op == spirv::Op::EmitVertex as u16)
        .count();
    assert_eq!(emits, 1);

    // Exactly three execution modes survive into the module.
    let modes = instructions
        .iter()
        .filter(|(op, _)| *op == spirv::Op::ExecutionMode as u16)
        .count();
    assert_eq!(modes, 3);
}

#[test]
fn spec_constant_bindings_number_scalars_and_composites() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    let meta = ShaderTypeMeta::new("DebugFrag", FragmentKind::Pixel)
        .with_field(field("Color", "Float4", "StageOutput"));
    let fragment = lib.register_fragment(&meta).unwrap();

    // Two scalar specialization constants plus a composite built from
    // them, referenced from the user main so they are collected.
    let debug_mode = lib.spec_constant_int("DebugMode", 0);
    let quality = lib.spec_constant_int("Quality", 1);
    let int2 = lib.find_type("Int2").unwrap();
    let pair = lib.spec_constant_composite("Pair", int2, &[debug_mode, quality]);

    let void = lib.void_type;
    let self_pointer = lib.pointer_to(fragment, StorageClass::Function).unwrap();
    let main = lib.create_function("DebugFrag_Main", void, &[self_pointer]);
    let int_type = lib.int_type;
    let mut block = lib.new_block();
    lib.build_op(
        &mut block,
        spirv::Op::CompositeExtract,
        Some(int_type),
        vec![Operand::Op(pair), Operand::Literal(0)],
    );
    let sum = Op::new(
        spirv::Op::IAdd,
        Some(int_type),
        vec![Operand::Op(debug_mode), Operand::Op(quality)],
    );
    let sum = lib.add_op(sum);
    block.ops.push(sum);
    lib.build_return(&mut block);
    lib.function_mut(main).blocks.push(block);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation.declare_pixel_interface(fragment, main).unwrap();
    let result = BinaryBackend::translate_entry_points(&mut lib, &[entry_point]).unwrap();

    let constants = &result.reflections[0].specialization_constants;
    let debug_id = constants["DebugMode"];
    let quality_id = constants["Quality"];
    assert_ne!(debug_id, quality_id);
    assert!(debug_id >= 1 && quality_id >= 1);
    // The composite inherits its first scalar constituent's id.
    assert_eq!(constants["Pair"], debug_id);

    // Every scalar received a SpecId decoration in the module.
    let instructions = instructions(&result.words);
    let spec_decorations = instructions
        .iter()
        .filter(|(op, operands)| {
            *op == spirv::Op::Decorate as u16
                && operands.get(1) == Some(&(spirv::Decoration::SpecId as u32))
        })
        .count();
    assert_eq!(spec_decorations, 2);
}
