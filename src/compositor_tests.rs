#![cfg(test)]

use crate::compositor::{Compositor, LinkedFieldType, ShaderDefinition};
use crate::error::CompilerError;
use crate::meta::{
    FragmentKind, GeometryFragmentInfo, InputPrimitive, OutputPrimitive, ShaderAttribute,
    ShaderFieldMeta, ShaderTypeMeta,
};
use crate::settings::{ShaderCapabilities, TranslationSettings};

fn settings() -> TranslationSettings {
    let mut settings = TranslationSettings::new();
    settings.add_vertex_definition_field("LocalPosition", "Float3").unwrap();
    settings.add_vertex_definition_field("Uv", "Float2").unwrap();
    settings
        .set_render_target_names(vec!["Color".into(), "Normal".into()])
        .unwrap();
    settings.finalize().unwrap();
    settings
}

fn field(name: &str, type_name: &str, attribute: &str) -> ShaderFieldMeta {
    ShaderFieldMeta::new(name, type_name).with_attribute(ShaderAttribute::new(attribute))
}

fn definition(name: &str, fragments: Vec<ShaderTypeMeta>) -> ShaderDefinition {
    ShaderDefinition {
        shader_name: name.into(),
        fragments,
        stream_vertex_types: Vec::new(),
        extra_attributes: Vec::new(),
    }
}

#[test]
fn pixel_fragment_links_stage_input_and_render_target_output() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let pixel = ShaderTypeMeta::new("DiffuseFrag", FragmentKind::Pixel)
        .with_field(field("Uv", "Float2", "StageInput"))
        .with_field(field("Color", "Float4", "StageOutput"));
    let def = definition("Shader", vec![pixel]);

    let result = compositor.composite(&def, ShaderCapabilities::default()).unwrap();
    let stage = result.stage(FragmentKind::Pixel).unwrap();

    assert_eq!(stage.class_name, "Shader_Pixel");
    // Both the pass-through input and the render-target output are
    // declared on the composite.
    assert!(stage.shader_code.contains("var Stage_Uv_Float2 : Float2;"));
    assert!(stage.shader_code.contains("var Stage_Color_Float4 : Float4;"));
    assert!(stage.shader_code.contains("[StageInput(name : \"Uv\")]"));
    assert!(stage.shader_code.contains("[StageOutput(name : \"Color\")]"));
    // The fragment reads the stage variable and writes its result back.
    assert!(stage
        .shader_code
        .contains("diffuseFrag.Uv = this.Stage_Uv_Float2;"));
    assert!(stage
        .shader_code
        .contains("this.Stage_Color_Float4 = diffuseFrag.Color;"));

    // The vertex stage was auto-threaded for pass-through.
    let vertex = result.stage(FragmentKind::Vertex).unwrap();
    assert!(vertex.shader_code.contains("var Stage_Uv_Float2 : Float2;"));
    assert!(vertex.shader_code.contains("[StageOutput(name : \"Uv\")]"));

    let description = &stage.fragment_descriptions[0];
    let uv = description.fields.iter().find(|f| f.field_name == "Uv").unwrap();
    assert_eq!(uv.linked_type, LinkedFieldType::Stage);
}

#[test]
fn fragment_output_feeds_the_next_fragment_in_declaration_order() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let producer = ShaderTypeMeta::new("NormalSource", FragmentKind::Vertex)
        .with_field(field("Normal", "Float3", "FragmentOutput"));
    let consumer = ShaderTypeMeta::new("NormalUser", FragmentKind::Vertex)
        .with_field(field("Normal", "Float3", "FragmentInput"));
    let def = definition("Shader", vec![producer, consumer]);

    let result = compositor.composite(&def, ShaderCapabilities::default()).unwrap();
    let stage = result.stage(FragmentKind::Vertex).unwrap();

    // Fragment-to-fragment, not any stage path.
    assert!(stage
        .shader_code
        .contains("normalUser.Normal = normalSource.Normal;"));

    let description = stage
        .fragment_descriptions
        .iter()
        .find(|d| d.fragment_name == "NormalUser")
        .unwrap();
    let link = &description.fields[0];
    assert_eq!(link.linked_type, LinkedFieldType::Fragment);
    assert_eq!(link.output_dependency.as_deref(), Some("NormalSource.Normal"));
}

#[test]
fn duplicate_fragment_outputs_resolve_to_the_last_writer() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let first = ShaderTypeMeta::new("BaseColor", FragmentKind::Vertex)
        .with_field(field("Tint", "Float4", "FragmentOutput"));
    let second = ShaderTypeMeta::new("Recolor", FragmentKind::Vertex)
        .with_field(field("Tint", "Float4", "FragmentOutput"));
    let consumer = ShaderTypeMeta::new("TintUser", FragmentKind::Vertex)
        .with_field(field("Tint", "Float4", "FragmentInput"));
    let def = definition("Shader", vec![first, second, consumer]);

    let result = compositor.composite(&def, ShaderCapabilities::default()).unwrap();
    let stage = result.stage(FragmentKind::Vertex).unwrap();
    assert!(stage.shader_code.contains("tintUser.Tint = recolor.Tint;"));
}

#[test]
fn unresolved_optional_inputs_are_left_uncopied() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let pixel = ShaderTypeMeta::new("OptionalFrag", FragmentKind::Pixel)
        .with_field(field("MissingData", "Float4", "StageInput"));
    let def = definition("Shader", vec![pixel]);

    let result = compositor.composite(&def, ShaderCapabilities::default()).unwrap();
    let stage = result.stage(FragmentKind::Pixel).unwrap();

    // No copy was generated; the fragment keeps its default value.
    assert!(!stage.shader_code.contains("optionalFrag.MissingData ="));
    let link = &stage.fragment_descriptions[0].fields[0];
    assert_eq!(link.linked_type, LinkedFieldType::None);
}

#[test]
fn property_inputs_are_mangled_with_the_owner_type() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let a = ShaderTypeMeta::new("FragA", FragmentKind::Pixel)
        .with_field(field("Speed", "Float", "PropertyInput"));
    let b = ShaderTypeMeta::new("FragB", FragmentKind::Pixel)
        .with_field(field("Speed", "Float", "PropertyInput"));
    let def = definition("Shader", vec![a, b]);

    let result = compositor.composite(&def, ShaderCapabilities::default()).unwrap();
    let stage = result.stage(FragmentKind::Pixel).unwrap();

    // Same property name on two fragments stays distinct on the composite.
    assert!(stage.shader_code.contains("var FragA_Speed : Float;"));
    assert!(stage.shader_code.contains("var FragB_Speed : Float;"));
    assert!(stage.shader_code.contains("fragA.Speed = this.FragA_Speed;"));
    assert!(stage.shader_code.contains("fragB.Speed = this.FragB_Speed;"));
}

#[test]
fn spec_constant_inputs_declare_static_composite_fields() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let pixel = ShaderTypeMeta::new("DebugFrag", FragmentKind::Pixel)
        .with_field(field("DebugMode", "Int", "SpecConstantInput"));
    let def = definition("Shader", vec![pixel]);

    let result = compositor.composite(&def, ShaderCapabilities::default()).unwrap();
    let stage = result.stage(FragmentKind::Pixel).unwrap();

    assert!(stage
        .shader_code
        .contains("[Static][SpecConstant] var DebugFrag_DebugMode : Int;"));
    // Spec constants are read off the composite type, not the instance.
    assert!(stage
        .shader_code
        .contains("debugFrag.DebugMode = Shader_Pixel.DebugFrag_DebugMode;"));
}

#[test]
fn hardware_builtin_output_is_copied_back_from_the_producer() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let vertex = ShaderTypeMeta::new("TransformFrag", FragmentKind::Vertex).with_field(
        ShaderFieldMeta::new("ClipPosition", "Float4").with_attribute(
            ShaderAttribute::new("HardwareBuiltInOutput").with_string_param("name", "Position"),
        ),
    );
    let def = definition("Shader", vec![vertex]);

    let result = compositor.composite(&def, ShaderCapabilities::default()).unwrap();
    let stage = result.stage(FragmentKind::Vertex).unwrap();

    assert!(stage.shader_code.contains("[HardwareBuiltInOutput] var Position : Float4;"));
    assert!(stage
        .shader_code
        .contains("this.Position = transformFrag.ClipPosition;"));
}

#[test]
fn geometry_stage_rejects_more_than_one_fragment() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let geometry_info = GeometryFragmentInfo {
        max_vertices: 3,
        input_primitive: InputPrimitive::Points,
        output_primitive: OutputPrimitive::TriangleStrip,
        input_vertex_type: "GeoVertIn".into(),
        output_vertex_type: "GeoVertOut".into(),
    };
    let mut first = ShaderTypeMeta::new("GeoA", FragmentKind::Geometry);
    first.geometry = Some(geometry_info.clone());
    let mut second = ShaderTypeMeta::new("GeoB", FragmentKind::Geometry);
    second.geometry = Some(geometry_info);

    let mut def = definition("Shader", vec![first, second]);
    def.stream_vertex_types = vec![
        ShaderTypeMeta::new("GeoVertIn", FragmentKind::None),
        ShaderTypeMeta::new("GeoVertOut", FragmentKind::None),
    ];

    let error = compositor
        .composite(&def, ShaderCapabilities::default())
        .unwrap_err();
    match error {
        CompilerError::CompositeError(message, _) => {
            assert!(message.contains("one fragment"));
        }
        other => panic!("expected a composite error, got {:?}", other),
    }
}

#[test]
fn geometry_composite_declares_stream_wrapper_types() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let vertex = ShaderTypeMeta::new("VertFrag", FragmentKind::Vertex)
        .with_field(field("Uv", "Float2", "StageOutput"));
    let mut geometry = ShaderTypeMeta::new("Expander", FragmentKind::Geometry);
    geometry.geometry = Some(GeometryFragmentInfo {
        max_vertices: 4,
        input_primitive: InputPrimitive::Points,
        output_primitive: OutputPrimitive::TriangleStrip,
        input_vertex_type: "GeoVertIn".into(),
        output_vertex_type: "GeoVertOut".into(),
    });
    let pixel = ShaderTypeMeta::new("PixFrag", FragmentKind::Pixel)
        .with_field(field("Uv", "Float2", "StageInput"))
        .with_field(field("Color", "Float4", "StageOutput"));

    let geo_in = ShaderTypeMeta::new("GeoVertIn", FragmentKind::None)
        .with_field(field("Uv", "Float2", "StageInput"));
    let geo_out = ShaderTypeMeta::new("GeoVertOut", FragmentKind::None)
        .with_field(field("Uv", "Float2", "StageOutput"));

    let mut def = definition("Shader", vec![vertex, geometry, pixel]);
    def.stream_vertex_types = vec![geo_in, geo_out];

    let result = compositor.composite(&def, ShaderCapabilities::default()).unwrap();
    let stage = result.stage(FragmentKind::Geometry).unwrap();

    assert!(stage.shader_code.contains("struct Shader_GeoIn"));
    assert!(stage.shader_code.contains("struct Shader_GeoOut"));
    assert!(stage.shader_code.contains("[Geometry(maxVertices : 4)]"));
    assert!(stage
        .shader_code
        .contains("function Main(input : PointInput[Shader_GeoIn], output : TriangleOutput[Shader_GeoOut])"));
    assert!(stage
        .shader_code
        .contains("var fragmentInput = PointInput[GeoVertIn]();"));
    assert!(stage
        .shader_code
        .contains("fragmentInput[i].Uv = input[i].Stage_Uv_Float2;"));
    assert!(stage
        .shader_code
        .contains("expander.Main(fragmentInput, fragmentOutput);"));
}

#[test]
fn compute_fragments_composite_through_the_compute_path() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let compute = ShaderTypeMeta::new("Simulate", FragmentKind::Compute)
        .with_field(field("DeltaTime", "Float", "PropertyInput"));
    let def = definition("Shader", vec![compute]);

    // The rasterization path refuses compute fragments outright.
    assert!(compositor
        .composite(&def, ShaderCapabilities::default())
        .is_err());

    let result = compositor.composite_compute(&def, (8, 8, 1)).unwrap();
    let stage = result.stage(FragmentKind::Compute).unwrap();
    assert_eq!(stage.class_name, "Shader_Compute");
    assert!(stage
        .shader_code
        .contains("[Compute(localSizeX : 8, localSizeY : 8, localSizeZ : 1)]"));
    assert!(stage
        .shader_code
        .contains("simulate.DeltaTime = this.Simulate_DeltaTime;"));
}

#[test]
fn unsupported_stage_with_fragments_fails_validation() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let mut geometry = ShaderTypeMeta::new("Expander", FragmentKind::Geometry);
    geometry.geometry = Some(GeometryFragmentInfo {
        max_vertices: 3,
        input_primitive: InputPrimitive::Points,
        output_primitive: OutputPrimitive::TriangleStrip,
        input_vertex_type: "GeoVertIn".into(),
        output_vertex_type: "GeoVertOut".into(),
    });
    let mut def = definition("Shader", vec![geometry]);
    def.stream_vertex_types = vec![
        ShaderTypeMeta::new("GeoVertIn", FragmentKind::None),
        ShaderTypeMeta::new("GeoVertOut", FragmentKind::None),
    ];

    let capabilities = ShaderCapabilities {
        supported_stages: crate::settings::StageFlags::VERTEX | crate::settings::StageFlags::PIXEL,
    };
    let error = compositor.composite(&def, capabilities).unwrap_err();
    match error {
        CompilerError::CompositeError(message, _) => {
            assert!(message.contains("Geometry"));
        }
        other => panic!("expected a composite error, got {:?}", other),
    }
}

#[test]
fn fragments_missing_main_are_rejected() {
    let settings = settings();
    let compositor = Compositor::new(&settings);

    let mut pixel = ShaderTypeMeta::new("Broken", FragmentKind::Pixel);
    pixel.has_main = false;
    let def = definition("Shader", vec![pixel]);

    let error = compositor
        .composite(&def, ShaderCapabilities::default())
        .unwrap_err();
    match error {
        CompilerError::CompositeError(message, _) => {
            assert!(message.contains("Broken"));
            assert!(message.contains("Main"));
        }
        other => panic!("expected a composite error, got {:?}", other),
    }
}
