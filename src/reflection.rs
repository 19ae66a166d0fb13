//! Reflection output: what the host application needs to bind resources
//! and feed stage interfaces without re-parsing the emitted module.

use crate::meta::FragmentKind;
use std::collections::HashMap;

/// Binding and layout facts for one resource or interface member.
#[derive(Debug, Clone, Default)]
pub struct ResourceReflection {
    pub instance_name: String,
    pub type_name: String,
    pub binding: u32,
    pub descriptor_set: u32,
    pub location: u32,
    pub offset_in_bytes: u32,
    pub size_in_bytes: u32,
    pub stride: u32,
}

/// One reflected stage resource, with per-member layout for aggregates.
#[derive(Debug, Clone, Default)]
pub struct StageResource {
    pub reflection: ResourceReflection,
    pub members: Vec<ResourceReflection>,
}

/// Everything reflected for one entry point.
#[derive(Debug, Clone, Default)]
pub struct StageReflection {
    pub shader_type_name: String,
    pub fragment_kind: FragmentKind,
    pub uniform_buffers: Vec<StageResource>,
    pub sampled_images: Vec<StageResource>,
    pub storage_images: Vec<StageResource>,
    pub samplers: Vec<StageResource>,
    pub storage_buffers: Vec<StageResource>,
    pub stage_inputs: Vec<StageResource>,
    pub stage_outputs: Vec<StageResource>,
    /// Specialization-constant binding ids by debug name. Composites map to
    /// their first scalar constituent's id.
    pub specialization_constants: HashMap<String, u32>,
}
