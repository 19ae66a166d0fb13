#![cfg(test)]

use crate::entry_points::EntryPointGeneration;
use crate::error::CompilerError;
use crate::ir::{FunctionId, Operand, ShaderLibrary, TypeId};
use crate::meta::{
    FragmentKind, GeometryFragmentInfo, InputPrimitive, OutputPrimitive, ShaderAttribute,
    ShaderFieldMeta, ShaderTypeMeta,
};
use crate::settings::TranslationSettings;
use rspirv::spirv::{self, ExecutionMode, StorageClass};

fn settings() -> TranslationSettings {
    let mut settings = TranslationSettings::new();
    settings.add_vertex_definition_field("LocalPosition", "Float3").unwrap();
    settings.add_vertex_definition_field("Uv", "Float2").unwrap();
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

#[test]
fn vertex_outputs_without_consumer_still_generate_copy_out() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    let meta = ShaderTypeMeta::new("ColorFrag", FragmentKind::Vertex)
        .with_field(field("Color", "Float4", "StageOutput"));
    let (fragment, main) = register_fragment(&mut lib, &meta);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation.declare_vertex_interface(fragment, main).unwrap();

    // The output block instance exists and is listed on the interface even
    // though nothing downstream reads it.
    assert_eq!(entry_point.variables.len(), 1);
    assert_eq!(entry_point.interface.len(), 1);

    // Wrapper main sequences globals-init, construction, copy-in, the user
    // Main, and copy-out.
    let wrapper = lib.function_ref(entry_point.entry_fn);
    let calls = wrapper.blocks[0]
        .ops
        .iter()
        .filter(|op| lib.op_ref(**op).opcode == spirv::Op::FunctionCall)
        .count();
    assert_eq!(calls, 5);

    // The copy-out helper stores the fragment's field into the interface.
    let copy_out = lib
        .functions()
        .find(|(_, f)| f.name.starts_with("CopyOutputs_"))
        .map(|(id, _)| id)
        .unwrap();
    let stores = lib
        .function_ref(copy_out)
        .blocks
        .iter()
        .flat_map(|b| b.ops.iter())
        .filter(|op| lib.op_ref(**op).opcode == spirv::Op::Store)
        .count();
    assert_eq!(stores, 1);
}

#[test]
fn uniform_layout_respects_alignment_and_never_overlaps() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    let meta = ShaderTypeMeta::new("MaterialFrag", FragmentKind::Pixel)
        .with_field(field("Scale", "Float", "PropertyInput"))
        .with_field(field("Offset", "Float2", "PropertyInput"))
        .with_field(field("Transform", "Float4x4", "PropertyInput"))
        .with_field(field("Tint", "Float4", "PropertyInput"));
    let (fragment, main) = register_fragment(&mut lib, &meta);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation.declare_pixel_interface(fragment, main).unwrap();

    let buffer = &entry_point.reflection.uniform_buffers[0];
    let members = &buffer.members;
    assert_eq!(members.len(), 4);
    assert_eq!(members[0].offset_in_bytes, 0);
    assert_eq!(members[1].offset_in_bytes, 8);
    assert_eq!(members[2].offset_in_bytes, 16);
    assert_eq!(members[2].stride, 16);
    assert_eq!(members[3].offset_in_bytes, 80);

    // Each offset is a multiple of its alignment and no members overlap.
    let alignments = [4, 8, 16, 16];
    for (member, alignment) in members.iter().zip(alignments) {
        assert_eq!(member.offset_in_bytes % alignment, 0);
    }
    for pair in members.windows(2) {
        assert!(pair[0].offset_in_bytes + pair[0].size_in_bytes <= pair[1].offset_in_bytes);
    }

    // Total size is the last member's end rounded to the widest alignment.
    assert_eq!(buffer.reflection.size_in_bytes, 96);
}

#[test]
fn resolving_the_same_builtin_twice_does_not_duplicate_the_field() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    let named = |attribute: &str, name: &str| {
        ShaderAttribute::new(attribute).with_string_param("name", name)
    };
    let meta = ShaderTypeMeta::new("CoordFrag", FragmentKind::Pixel)
        .with_field(
            ShaderFieldMeta::new("ScreenPos", "Float4")
                .with_attribute(named("HardwareBuiltInInput", "FragCoord")),
        )
        .with_field(
            ShaderFieldMeta::new("RawCoord", "Float4")
                .with_attribute(named("HardwareBuiltInInput", "FragCoord")),
        );
    lib.register_fragment(&meta).unwrap();

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let info = generation
        .collect_interface_variables(&meta, FragmentKind::Pixel)
        .unwrap();

    assert_eq!(info.builtin_groups.len(), 1);
    let group = &info.builtin_groups[0].1;
    assert_eq!(group.fields.len(), 1);
    // Both fragment fields copy from the one interface field.
    assert_eq!(group.fields[0].linked_fields.len(), 2);
}

#[test]
fn invalid_builtin_reports_the_builtin_and_the_stage() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    // FragCoord is a pixel-stage value; asking for it in a vertex fragment
    // must fail without emitting a partial interface.
    let meta = ShaderTypeMeta::new("BadFrag", FragmentKind::Vertex).with_field(field(
        "FragCoord",
        "Float4",
        "HardwareBuiltInInput",
    ));
    let (fragment, main) = register_fragment(&mut lib, &meta);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let error = generation.declare_vertex_interface(fragment, main).unwrap_err();
    match error {
        CompilerError::BuiltInError(message, _) => {
            assert!(message.contains("FragCoord"));
            assert!(message.contains("Vertex"));
        }
        other => panic!("expected a built-in error, got {:?}", other),
    }
}

#[test]
fn pixel_entry_points_declare_origin_upper_left() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    let meta = ShaderTypeMeta::new("FlatColor", FragmentKind::Pixel)
        .with_field(field("Color", "Float4", "StageOutput"));
    let (fragment, main) = register_fragment(&mut lib, &meta);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation.declare_pixel_interface(fragment, main).unwrap();

    assert_eq!(entry_point.execution_modes.len(), 1);
    let op = lib.op_ref(entry_point.execution_modes[0]);
    assert_eq!(op.opcode, spirv::Op::ExecutionMode);
    assert!(op
        .operands
        .contains(&Operand::Literal(ExecutionMode::OriginUpperLeft as u32)));
}

#[test]
fn compute_entry_points_declare_the_workgroup_size() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    let meta = ShaderTypeMeta::new("Simulate", FragmentKind::Compute)
        .with_field(field("Speed", "Float", "PropertyInput"));
    let (fragment, main) = register_fragment(&mut lib, &meta);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation
        .declare_compute_interface(fragment, main, (8, 8, 1))
        .unwrap();

    assert_eq!(entry_point.execution_modes.len(), 1);
    let op = lib.op_ref(entry_point.execution_modes[0]);
    let literals: Vec<u32> = op
        .operands
        .iter()
        .filter_map(|operand| match operand {
            Operand::Literal(value) => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(literals, vec![ExecutionMode::LocalSize as u32, 8, 8, 1]);
}

#[test]
fn opaque_resources_take_the_lowest_unused_binding() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();
    let meta = ShaderTypeMeta::new("TexturedFrag", FragmentKind::Pixel)
        .with_field(field("Albedo", "SampledImage2d", "PropertyInput"))
        .with_field(field("NormalMap", "SampledImage2d", "PropertyInput"))
        .with_field(field("Tint", "Float4", "PropertyInput"));
    let (fragment, main) = register_fragment(&mut lib, &meta);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation.declare_pixel_interface(fragment, main).unwrap();

    // The material buffer claimed its stage-offset binding; the images
    // scan up from zero and take the lowest free ids.
    let images = &entry_point.reflection.sampled_images;
    assert_eq!(images.len(), 2);
    assert_eq!(images[0].reflection.binding, 0);
    assert_eq!(images[1].reflection.binding, 1);
    assert_eq!(images[0].reflection.descriptor_set, 0);
    let material = &entry_point.reflection.uniform_buffers[0];
    assert_ne!(material.reflection.binding, images[0].reflection.binding);
    assert_ne!(material.reflection.binding, images[1].reflection.binding);
}

#[test]
fn geometry_entry_points_emit_exactly_three_execution_modes() {
    let settings = settings();
    let mut lib = ShaderLibrary::new();

    let input_vertex = ShaderTypeMeta::new("GeoVertIn", FragmentKind::None).with_field(
        ShaderFieldMeta::new("Uv", "Float2").with_attribute(ShaderAttribute::new("StageInput")),
    );
    let output_vertex = ShaderTypeMeta::new("GeoVertOut", FragmentKind::None).with_field(
        ShaderFieldMeta::new("Uv", "Float2").with_attribute(ShaderAttribute::new("StageOutput")),
    );
    lib.register_fragment(&input_vertex).unwrap();
    lib.register_fragment(&output_vertex).unwrap();

    let mut meta = ShaderTypeMeta::new("PointExpander", FragmentKind::Geometry);
    meta.geometry = Some(GeometryFragmentInfo {
        max_vertices: 3,
        input_primitive: InputPrimitive::Points,
        output_primitive: OutputPrimitive::TriangleStrip,
        input_vertex_type: "GeoVertIn".into(),
        output_vertex_type: "GeoVertOut".into(),
    });
    let (fragment, main) = register_fragment(&mut lib, &meta);

    let mut generation = EntryPointGeneration::new(&mut lib, &settings);
    let entry_point = generation
        .declare_geometry_interface(fragment, main, None)
        .unwrap();

    assert_eq!(entry_point.execution_modes.len(), 3);
    let first = lib.op_ref(entry_point.execution_modes[0]);
    assert!(first
        .operands
        .contains(&Operand::Literal(ExecutionMode::OutputVertices as u32)));
    assert!(first.operands.contains(&Operand::Literal(3)));

    let modes: Vec<u32> = entry_point.execution_modes[1..]
        .iter()
        .filter_map(|op| match lib.op_ref(*op).operands.get(1) {
            Some(Operand::Literal(value)) => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(
        modes,
        vec![
            ExecutionMode::InputPoints as u32,
            ExecutionMode::OutputTriangleStrip as u32
        ]
    );
}
