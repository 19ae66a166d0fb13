//! Interface groups and their realized forms.
//!
//! During entry-point generation every stage-visible field is first binned
//! into an [`InterfaceGroup`] (inputs, outputs, one group per built-in
//! block, one per uniform buffer), then each group is realized as one of
//! three concrete layouts: a packed struct with a single instance, loose
//! per-field globals, or an array-of-struct for geometry streams. The
//! variant set is closed, so realization is an enum, not dispatch.

use crate::error::{CompilerError, Result};
use crate::ir::{BasicBlock, OpId, ShaderLibrary, TypeId, TypeKind};
use crate::meta::{ShaderFieldKey, ShaderFieldMeta};
use crate::reflection::ResourceReflection;
use rspirv::spirv::{Decoration, StorageClass};

/// One decoration, with an optional literal parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecorationParam {
    pub decoration: Decoration,
    pub value: Option<u32>,
}

impl DecorationParam {
    pub fn new(decoration: Decoration) -> Self {
        DecorationParam {
            decoration,
            value: None,
        }
    }

    pub fn with_value(decoration: Decoration, value: u32) -> Self {
        DecorationParam {
            decoration,
            value: Some(value),
        }
    }
}

/// A field gathered into a group. `linked_fields` are the fragment fields
/// that copy to or from this interface field; the matching is not one to
/// one because attribute name overrides let several fragment fields share
/// one interface slot.
#[derive(Debug, Clone)]
pub struct InterfaceFieldInfo {
    pub meta: ShaderFieldMeta,
    pub linked_fields: Vec<ShaderFieldMeta>,
    pub decorations: Vec<DecorationParam>,
    pub type_decorations: Vec<DecorationParam>,
    pub reflection: ResourceReflection,
}

impl InterfaceFieldInfo {
    fn new(meta: ShaderFieldMeta) -> Self {
        InterfaceFieldInfo {
            meta,
            linked_fields: Vec::new(),
            decorations: Vec::new(),
            type_decorations: Vec::new(),
            reflection: ResourceReflection::default(),
        }
    }
}

/// One packable group of fields.
#[derive(Debug, Clone)]
pub struct InterfaceGroup {
    pub name: String,
    pub is_struct: bool,
    pub is_builtin: bool,
    pub storage_class: StorageClass,
    pub fields: Vec<InterfaceFieldInfo>,
    pub type_decorations: Vec<DecorationParam>,
    pub instance_decorations: Vec<DecorationParam>,
    pub reflection: ResourceReflection,
}

impl InterfaceGroup {
    pub fn new(storage_class: StorageClass) -> Self {
        InterfaceGroup {
            name: String::new(),
            is_struct: true,
            is_builtin: false,
            storage_class,
            fields: Vec::new(),
            type_decorations: Vec::new(),
            instance_decorations: Vec::new(),
            reflection: ResourceReflection::default(),
        }
    }

    pub fn find_field(&self, key: &ShaderFieldKey) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.meta.make_field_key(None) == *key)
    }

    /// Find a field by key, creating it if absent. Resolving the same key
    /// twice yields the same field; the group never duplicates.
    pub fn find_or_create_field(&mut self, key: &ShaderFieldKey) -> &mut InterfaceFieldInfo {
        if let Some(index) = self.find_field(key) {
            return &mut self.fields[index];
        }
        let meta = ShaderFieldMeta::new(key.name.clone(), key.type_name.clone());
        self.fields.push(InterfaceFieldInfo::new(meta));
        let last = self.fields.len() - 1;
        &mut self.fields[last]
    }

    pub fn push_field(&mut self, meta: ShaderFieldMeta) -> &mut InterfaceFieldInfo {
        self.fields.push(InterfaceFieldInfo::new(meta));
        let last = self.fields.len() - 1;
        &mut self.fields[last]
    }
}

/// Identity of a built-in group within one generation call: input vs
/// output, packed interface block vs loose globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltInGroupKey {
    pub input: bool,
    pub block: bool,
}

/// All groups collected for one entry point, discarded after emission.
#[derive(Debug, Clone)]
pub struct ShaderInterfaceInfo {
    pub inputs: InterfaceGroup,
    pub outputs: InterfaceGroup,
    pub builtin_groups: Vec<(BuiltInGroupKey, InterfaceGroup)>,
    /// Keyed by uniform-buffer description index; `None` is the default
    /// material buffer.
    pub uniform_groups: Vec<(Option<usize>, InterfaceGroup)>,
}

impl ShaderInterfaceInfo {
    pub fn new() -> Self {
        ShaderInterfaceInfo {
            inputs: InterfaceGroup::new(StorageClass::Input),
            outputs: InterfaceGroup::new(StorageClass::Output),
            builtin_groups: Vec::new(),
            uniform_groups: Vec::new(),
        }
    }

    pub fn builtin_group(&mut self, key: BuiltInGroupKey) -> (&mut InterfaceGroup, bool) {
        if let Some(index) = self.builtin_groups.iter().position(|(k, _)| *k == key) {
            return (&mut self.builtin_groups[index].1, true);
        }
        let storage = if key.input {
            StorageClass::Input
        } else {
            StorageClass::Output
        };
        self.builtin_groups.push((key, InterfaceGroup::new(storage)));
        let last = self.builtin_groups.len() - 1;
        (&mut self.builtin_groups[last].1, false)
    }

    pub fn uniform_group(&mut self, key: Option<usize>) -> (&mut InterfaceGroup, bool) {
        if let Some(index) = self.uniform_groups.iter().position(|(k, _)| *k == key) {
            return (&mut self.uniform_groups[index].1, true);
        }
        self.uniform_groups
            .push((key, InterfaceGroup::new(StorageClass::Uniform)));
        let last = self.uniform_groups.len() - 1;
        (&mut self.uniform_groups[last].1, false)
    }
}

impl Default for ShaderInterfaceInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// One realized interface field.
#[derive(Debug, Clone)]
pub struct InterfaceField {
    pub index: u32,
    pub name: String,
    /// Type actually declared in the interface (bools become ints).
    pub field_type: TypeId,
    /// Type the fragment declared.
    pub original_type: TypeId,
    pub key: ShaderFieldKey,
    pub linked_fields: Vec<ShaderFieldMeta>,
}

#[derive(Debug, Clone)]
pub struct StructInterface {
    pub struct_type: TypeId,
    pub instance: OpId,
    pub storage_class: StorageClass,
    pub fields: Vec<InterfaceField>,
}

impl StructInterface {
    pub fn field_pointer(
        &self,
        lib: &mut ShaderLibrary,
        block: &mut BasicBlock,
        index: usize,
    ) -> Result<OpId> {
        let field = &self.fields[index];
        lib.build_access_chain(
            block,
            field.field_type,
            self.storage_class,
            self.instance,
            &[field.index],
        )
    }
}

#[derive(Debug, Clone)]
pub struct GlobalsInterface {
    pub storage_class: StorageClass,
    pub fields: Vec<InterfaceField>,
    pub instances: Vec<OpId>,
}

#[derive(Debug, Clone)]
pub struct StructArrayInterface {
    pub array_type: TypeId,
    pub instance: OpId,
    pub storage_class: StorageClass,
    pub length: u32,
    pub element: StructInterface,
}

impl StructArrayInterface {
    /// Pointer to one field of one array element.
    pub fn field_pointer_at(
        &self,
        lib: &mut ShaderLibrary,
        block: &mut BasicBlock,
        element_index: u32,
        field_index: usize,
    ) -> Result<OpId> {
        let field = &self.element.fields[field_index];
        lib.build_access_chain(
            block,
            field.field_type,
            self.storage_class,
            self.instance,
            &[element_index, field.index],
        )
    }

    pub fn contains_field(&self, key: &ShaderFieldKey) -> bool {
        self.element.fields.iter().any(|f| &f.key == key)
    }
}

/// The closed set of realized interface layouts.
#[derive(Debug, Clone)]
pub enum InterfaceBlock {
    Struct(StructInterface),
    Globals(GlobalsInterface),
    StructArray(StructArrayInterface),
}

impl InterfaceBlock {
    pub fn field_count(&self) -> usize {
        match self {
            InterfaceBlock::Struct(s) => s.fields.len(),
            InterfaceBlock::Globals(g) => g.fields.len(),
            InterfaceBlock::StructArray(a) => a.element.fields.len(),
        }
    }

    pub fn field_at(&self, index: usize) -> Option<&InterfaceField> {
        match self {
            InterfaceBlock::Struct(s) => s.fields.get(index),
            InterfaceBlock::Globals(g) => g.fields.get(index),
            InterfaceBlock::StructArray(a) => a.element.fields.get(index),
        }
    }

    pub fn find_field(&self, key: &ShaderFieldKey) -> Option<usize> {
        (0..self.field_count()).find(|i| match self.field_at(*i) {
            Some(f) => &f.key == key,
            None => false,
        })
    }

    /// Pointer to one field, writing access instructions into `block` as
    /// needed. Array interfaces need an element index; use
    /// [`StructArrayInterface::field_pointer_at`] instead.
    pub fn field_pointer(
        &self,
        lib: &mut ShaderLibrary,
        block: &mut BasicBlock,
        index: usize,
    ) -> Result<OpId> {
        match self {
            InterfaceBlock::Struct(s) => s.field_pointer(lib, block, index),
            InterfaceBlock::Globals(g) => g
                .instances
                .get(index)
                .copied()
                .ok_or_else(|| CompilerError::BackendError("interface field index out of range".into())),
            InterfaceBlock::StructArray(_) => Err(CompilerError::BackendError(
                "array interfaces require an element index".into(),
            )),
        }
    }
}

// Uniform buffer layout. Alignment tiers follow the GPU rules: one float
// for scalars, two for two-component vectors, four for everything wider,
// with matrices and arrays striding at 16 bytes.

pub fn round_up(offset: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return offset;
    }
    offset.div_ceil(alignment) * alignment
}

pub fn byte_alignment(lib: &ShaderLibrary, ty: TypeId) -> u32 {
    match &lib.type_ref(ty).kind {
        TypeKind::Bool | TypeKind::Int { .. } | TypeKind::Float => 4,
        TypeKind::Vector { count, .. } => {
            if *count == 2 {
                8
            } else {
                16
            }
        }
        TypeKind::Matrix { .. } | TypeKind::FixedArray { .. } | TypeKind::Struct { .. } => 16,
        _ => 4,
    }
}

pub fn byte_size(lib: &ShaderLibrary, ty: TypeId) -> u32 {
    match &lib.type_ref(ty).kind {
        TypeKind::Bool | TypeKind::Int { .. } | TypeKind::Float => 4,
        TypeKind::Vector { count, .. } => count * 4,
        TypeKind::Matrix { count, .. } => count * 16,
        TypeKind::FixedArray {
            element,
            length_value,
            ..
        } => length_value * array_stride(lib, *element),
        TypeKind::Struct { members } => {
            let mut offset = 0;
            let mut max_alignment = 0;
            for member in members {
                let alignment = byte_alignment(lib, *member);
                max_alignment = max_alignment.max(alignment);
                offset = round_up(offset, alignment) + byte_size(lib, *member);
            }
            round_up(offset, max_alignment)
        }
        _ => 4,
    }
}

/// Element stride within an array: the element size rounded up to the
/// 16-byte tier.
pub fn array_stride(lib: &ShaderLibrary, element: TypeId) -> u32 {
    round_up(byte_size(lib, element), 16)
}

fn add_member_type_decorations(
    lib: &ShaderLibrary,
    member_type: TypeId,
    field: &mut InterfaceFieldInfo,
) {
    match &lib.type_ref(member_type).kind {
        TypeKind::Matrix { .. } => {
            let stride = 16;
            field
                .decorations
                .push(DecorationParam::with_value(Decoration::MatrixStride, stride));
            field.decorations.push(DecorationParam::new(Decoration::ColMajor));
            field.reflection.stride = stride;
        }
        TypeKind::FixedArray { element, .. } => {
            let stride = array_stride(lib, *element);
            field
                .type_decorations
                .push(DecorationParam::with_value(Decoration::ArrayStride, stride));
            field.reflection.stride = stride;
            let element = *element;
            add_member_type_decorations(lib, element, field);
        }
        _ => {}
    }
}

/// Lay out a uniform group: walk fields in declaration order, rounding the
/// running offset up to each member's alignment, recording offset, size
/// and stride reflection. The group's total size is the end of the last
/// member rounded up to the widest member alignment.
pub fn add_offset_decorations(lib: &ShaderLibrary, group: &mut InterfaceGroup) -> Result<()> {
    let mut offset = 0u32;
    let mut max_alignment = 0u32;
    for field in &mut group.fields {
        let member_type = lib.find_type(&field.meta.type_name).ok_or_else(|| {
            CompilerError::LinkError(
                format!(
                    "uniform field '{}' has unknown type '{}'",
                    field.meta.name, field.meta.type_name
                ),
                Some(field.meta.location),
            )
        })?;

        let alignment = byte_alignment(lib, member_type);
        let size = byte_size(lib, member_type);
        max_alignment = max_alignment.max(alignment);
        offset = round_up(offset, alignment);

        field
            .decorations
            .push(DecorationParam::with_value(Decoration::Offset, offset));
        field.reflection.offset_in_bytes = offset;
        field.reflection.size_in_bytes = size;
        add_member_type_decorations(lib, member_type, field);

        offset += size;
    }
    group.reflection.size_in_bytes = round_up(offset, max_alignment);
    Ok(())
}
