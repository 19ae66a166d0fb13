//! Typed shader IR: types, instructions, blocks, functions, and the
//! per-run library arena that owns them all.
//!
//! Instructions reference each other through ids into the arena rather
//! than owned edges; the two back-references that would otherwise form
//! cycles (pointer type to pointee, struct member to owning struct) are
//! plain ids resolved through the library. Everything created during one
//! translation run is invalidated together when the library is dropped.

use crate::error::{CompilerError, Result};
use crate::meta::{ShaderFieldKey, ShaderTypeMeta};
use rspirv::spirv::{self, StorageClass};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportId(pub u32);

/// One operand of an instruction: a reference into the arena or a raw
/// literal word emitted in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Type(TypeId),
    Op(OpId),
    Function(FunctionId),
    Block(BlockId),
    Import(ImportId),
    Literal(u32),
}

/// An instruction. Ops are the unit of identity for binary emission: an op
/// with a result type is assigned a nonzero id, a result-less op never is.
#[derive(Debug, Clone)]
pub struct Op {
    pub opcode: spirv::Op,
    pub result_type: Option<TypeId>,
    pub operands: Vec<Operand>,
    pub debug_name: Option<String>,
}

impl Op {
    pub fn new(opcode: spirv::Op, result_type: Option<TypeId>, operands: Vec<Operand>) -> Self {
        Op {
            opcode,
            result_type,
            operands,
            debug_name: None,
        }
    }

    pub fn has_result(&self) -> bool {
        self.result_type.is_some()
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.opcode,
            spirv::Op::Return
                | spirv::Op::ReturnValue
                | spirv::Op::Branch
                | spirv::Op::BranchConditional
                | spirv::Op::Kill
                | spirv::Op::Unreachable
        )
    }
}

/// Structured-control-flow role of a block. Non-plain blocks carry the
/// merge targets the serializer turns into merge instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Plain,
    Selection { merge: BlockId },
    Loop { merge: BlockId, continue_target: BlockId },
}

/// A basic block: local variable declarations (first block of a function
/// only), then instructions, at most one of which terminates the block.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub kind: BlockKind,
    pub local_variables: Vec<OpId>,
    pub ops: Vec<OpId>,
    pub terminator: Option<OpId>,
    pub debug_name: Option<String>,
}

impl BasicBlock {
    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub function_type: TypeId,
    pub parameters: Vec<OpId>,
    pub blocks: Vec<BasicBlock>,
}

#[derive(Debug, Clone)]
pub struct ExtensionImport {
    pub name: String,
}

/// Image type facts needed for declaration and resource classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    pub dim: spirv::Dim,
    pub depth: u32,
    pub arrayed: u32,
    pub multisampled: u32,
    /// 1 = used with a sampler, 2 = storage image.
    pub sampled: u32,
    pub format: spirv::ImageFormat,
}

impl ImageFormat {
    pub fn sampled_2d() -> Self {
        ImageFormat {
            dim: spirv::Dim::Dim2D,
            depth: 0,
            arrayed: 0,
            multisampled: 0,
            sampled: 1,
            format: spirv::ImageFormat::Unknown,
        }
    }

    pub fn storage_2d() -> Self {
        ImageFormat {
            sampled: 2,
            ..ImageFormat::sampled_2d()
        }
    }

    pub fn is_storage_image(&self) -> bool {
        self.sampled == 2
    }
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Bool,
    Int { signed: bool },
    Float,
    Vector { component: TypeId, count: u32 },
    Matrix { column: TypeId, count: u32 },
    Struct { members: Vec<TypeId> },
    FixedArray { element: TypeId, length: OpId, length_value: u32 },
    RuntimeArray { element: TypeId },
    Image { sampled_type: TypeId, format: ImageFormat },
    Sampler,
    SampledImage { image: TypeId },
    Function { return_type: TypeId, parameters: Vec<TypeId> },
    Pointer { pointee: TypeId, storage_class: StorageClass },
}

#[derive(Debug, Clone)]
pub struct ShaderType {
    pub name: String,
    pub kind: TypeKind,
    /// Member names, structs only; parallel to `TypeKind::Struct::members`.
    pub member_names: Vec<String>,
    /// Fragment metadata, for types registered from the front end.
    pub meta: Option<ShaderTypeMeta>,
}

impl ShaderType {
    pub fn member_index(&self, name: &str) -> Option<u32> {
        self.member_names.iter().position(|n| n == name).map(|i| i as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantValue {
    Bool(bool),
    Int(i32),
    Uint(u32),
    /// Float bits, so the cache key stays hashable.
    Float(u32),
}

#[derive(Debug, Clone)]
pub struct GlobalVariableData {
    pub instance: OpId,
    pub initializer: Option<FunctionId>,
}

/// The per-run arena. Owns every type, op, function, constant, global and
/// import created while translating one program.
pub struct ShaderLibrary {
    types: Vec<ShaderType>,
    ops: Vec<Op>,
    functions: Vec<Function>,
    imports: Vec<ExtensionImport>,
    globals: Vec<GlobalVariableData>,
    global_lookup: HashMap<OpId, usize>,
    type_names: HashMap<String, TypeId>,
    pointer_cache: HashMap<(TypeId, u32), TypeId>,
    function_type_cache: HashMap<(TypeId, Vec<TypeId>), TypeId>,
    array_cache: HashMap<(TypeId, u32), TypeId>,
    constant_cache: HashMap<(TypeId, ConstantValue), OpId>,
    spec_constants: Vec<OpId>,
    default_constructors: HashMap<TypeId, FunctionId>,
    next_block: u32,

    pub void_type: TypeId,
    pub bool_type: TypeId,
    pub int_type: TypeId,
    pub uint_type: TypeId,
    pub float_type: TypeId,
}

impl Default for ShaderLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderLibrary {
    pub fn new() -> Self {
        let mut lib = ShaderLibrary {
            types: Vec::new(),
            ops: Vec::new(),
            functions: Vec::new(),
            imports: Vec::new(),
            globals: Vec::new(),
            global_lookup: HashMap::new(),
            type_names: HashMap::new(),
            pointer_cache: HashMap::new(),
            function_type_cache: HashMap::new(),
            array_cache: HashMap::new(),
            constant_cache: HashMap::new(),
            spec_constants: Vec::new(),
            default_constructors: HashMap::new(),
            next_block: 0,
            void_type: TypeId(0),
            bool_type: TypeId(0),
            int_type: TypeId(0),
            uint_type: TypeId(0),
            float_type: TypeId(0),
        };
        lib.register_core_types();
        lib
    }

    fn register_core_types(&mut self) {
        self.void_type = self.add_named_type("Void", TypeKind::Void);
        self.bool_type = self.add_named_type("Bool", TypeKind::Bool);
        self.int_type = self.add_named_type("Int", TypeKind::Int { signed: true });
        self.uint_type = self.add_named_type("Uint", TypeKind::Int { signed: false });
        self.float_type = self.add_named_type("Float", TypeKind::Float);

        for count in 2..=4u32 {
            let component = self.float_type;
            self.add_named_type(&format!("Float{}", count), TypeKind::Vector { component, count });
            let component = self.int_type;
            self.add_named_type(&format!("Int{}", count), TypeKind::Vector { component, count });
        }
        for count in 2..=4u32 {
            let column = self.find_type(&format!("Float{}", count)).unwrap_or(self.float_type);
            self.add_named_type(
                &format!("Float{0}x{0}", count),
                TypeKind::Matrix { column, count },
            );
        }

        let float = self.float_type;
        let image = self.add_named_type(
            "Image2d",
            TypeKind::Image {
                sampled_type: float,
                format: ImageFormat::sampled_2d(),
            },
        );
        self.add_named_type(
            "StorageImage2d",
            TypeKind::Image {
                sampled_type: float,
                format: ImageFormat::storage_2d(),
            },
        );
        self.add_named_type("Sampler", TypeKind::Sampler);
        self.add_named_type("SampledImage2d", TypeKind::SampledImage { image });
    }

    fn add_named_type(&mut self, name: &str, kind: TypeKind) -> TypeId {
        self.add_type(ShaderType {
            name: name.into(),
            kind,
            member_names: Vec::new(),
            meta: None,
        })
    }

    pub fn add_type(&mut self, ty: ShaderType) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        if !ty.name.is_empty() {
            self.type_names.entry(ty.name.clone()).or_insert(id);
        }
        self.types.push(ty);
        id
    }

    /// Name lookup, searching this library's scope list in order. A run
    /// owns exactly one library, so the scope list is currently just the
    /// core-seeded self scope.
    pub fn find_type(&self, name: &str) -> Option<TypeId> {
        self.type_names.get(name).copied()
    }

    pub fn type_ref(&self, id: TypeId) -> &ShaderType {
        &self.types[id.0 as usize]
    }

    pub fn type_name(&self, id: TypeId) -> &str {
        &self.types[id.0 as usize].name
    }

    /// The lazily-created pointer type for a value type in a storage
    /// class. A pointer's pointee is never itself a pointer.
    pub fn pointer_to(&mut self, pointee: TypeId, storage_class: StorageClass) -> Result<TypeId> {
        if let TypeKind::Pointer { .. } = self.type_ref(pointee).kind {
            return Err(CompilerError::BackendError(
                "pointer types cannot point at pointer types".into(),
            ));
        }
        let key = (pointee, storage_class as u32);
        if let Some(id) = self.pointer_cache.get(&key) {
            return Ok(*id);
        }
        let id = self.add_type(ShaderType {
            name: String::new(),
            kind: TypeKind::Pointer {
                pointee,
                storage_class,
            },
            member_names: Vec::new(),
            meta: None,
        });
        self.pointer_cache.insert(key, id);
        Ok(id)
    }

    /// Resolve a pointer type to its pointee ("dereference") type.
    pub fn dereference(&self, id: TypeId) -> Option<TypeId> {
        match self.type_ref(id).kind {
            TypeKind::Pointer { pointee, .. } => Some(pointee),
            _ => None,
        }
    }

    pub fn function_type(&mut self, return_type: TypeId, parameters: &[TypeId]) -> TypeId {
        let key = (return_type, parameters.to_vec());
        if let Some(id) = self.function_type_cache.get(&key) {
            return *id;
        }
        let id = self.add_type(ShaderType {
            name: String::new(),
            kind: TypeKind::Function {
                return_type,
                parameters: parameters.to_vec(),
            },
            member_names: Vec::new(),
            meta: None,
        });
        self.function_type_cache.insert(key, id);
        id
    }

    pub fn fixed_array_type(&mut self, element: TypeId, length: u32) -> TypeId {
        if let Some(id) = self.array_cache.get(&(element, length)) {
            return *id;
        }
        let length_const = self.constant_uint(length);
        let id = self.add_type(ShaderType {
            name: String::new(),
            kind: TypeKind::FixedArray {
                element,
                length: length_const,
                length_value: length,
            },
            member_names: Vec::new(),
            meta: None,
        });
        self.array_cache.insert((element, length), id);
        id
    }

    pub fn struct_type(&mut self, name: impl Into<String>, members: &[(String, TypeId)]) -> TypeId {
        self.add_type(ShaderType {
            name: name.into(),
            kind: TypeKind::Struct {
                members: members.iter().map(|(_, t)| *t).collect(),
            },
            member_names: members.iter().map(|(n, _)| n.clone()).collect(),
            meta: None,
        })
    }

    /// Member lookup by (name, type) key for struct types.
    pub fn member_index_by_key(&self, struct_type: TypeId, key: &ShaderFieldKey) -> Option<u32> {
        let ty = self.type_ref(struct_type);
        let members = match &ty.kind {
            TypeKind::Struct { members } => members,
            _ => return None,
        };
        ty.member_names
            .iter()
            .zip(members.iter())
            .position(|(name, member)| name == &key.name && self.type_name(*member) == key.type_name)
            .map(|i| i as u32)
    }

    /// Opaque resource types cannot be copied by value and never pack into
    /// interface or uniform structs.
    pub fn is_opaque_resource(&self, id: TypeId) -> bool {
        matches!(
            self.type_ref(id).kind,
            TypeKind::Image { .. }
                | TypeKind::Sampler
                | TypeKind::SampledImage { .. }
                | TypeKind::RuntimeArray { .. }
        )
    }

    // Constants

    fn add_constant(&mut self, result_type: TypeId, value: ConstantValue) -> OpId {
        if let Some(id) = self.constant_cache.get(&(result_type, value)) {
            return *id;
        }
        let op = match value {
            ConstantValue::Bool(true) => Op::new(spirv::Op::ConstantTrue, Some(result_type), vec![]),
            ConstantValue::Bool(false) => Op::new(spirv::Op::ConstantFalse, Some(result_type), vec![]),
            ConstantValue::Int(v) => Op::new(
                spirv::Op::Constant,
                Some(result_type),
                vec![Operand::Literal(v as u32)],
            ),
            ConstantValue::Uint(v) | ConstantValue::Float(v) => {
                Op::new(spirv::Op::Constant, Some(result_type), vec![Operand::Literal(v)])
            }
        };
        let id = self.add_op(op);
        self.constant_cache.insert((result_type, value), id);
        id
    }

    pub fn constant_bool(&mut self, value: bool) -> OpId {
        let ty = self.bool_type;
        self.add_constant(ty, ConstantValue::Bool(value))
    }

    pub fn constant_int(&mut self, value: i32) -> OpId {
        let ty = self.int_type;
        self.add_constant(ty, ConstantValue::Int(value))
    }

    pub fn constant_uint(&mut self, value: u32) -> OpId {
        let ty = self.uint_type;
        self.add_constant(ty, ConstantValue::Uint(value))
    }

    pub fn constant_float(&mut self, value: f32) -> OpId {
        let ty = self.float_type;
        self.add_constant(ty, ConstantValue::Float(value.to_bits()))
    }

    /// A scalar specialization constant. Each one receives a SpecId
    /// decoration during emission, in first-encountered order.
    pub fn spec_constant_int(&mut self, name: impl Into<String>, default: i32) -> OpId {
        let ty = self.int_type;
        let mut op = Op::new(
            spirv::Op::SpecConstant,
            Some(ty),
            vec![Operand::Literal(default as u32)],
        );
        op.debug_name = Some(name.into());
        let id = self.add_op(op);
        self.spec_constants.push(id);
        id
    }

    /// A composite specialization constant built from scalar constituents.
    pub fn spec_constant_composite(
        &mut self,
        name: impl Into<String>,
        result_type: TypeId,
        constituents: &[OpId],
    ) -> OpId {
        let mut op = Op::new(
            spirv::Op::SpecConstantComposite,
            Some(result_type),
            constituents.iter().map(|c| Operand::Op(*c)).collect(),
        );
        op.debug_name = Some(name.into());
        let id = self.add_op(op);
        self.spec_constants.push(id);
        id
    }

    pub fn is_constant_op(&self, id: OpId) -> bool {
        matches!(
            self.op_ref(id).opcode,
            spirv::Op::Constant
                | spirv::Op::ConstantTrue
                | spirv::Op::ConstantFalse
                | spirv::Op::SpecConstant
                | spirv::Op::SpecConstantTrue
                | spirv::Op::SpecConstantFalse
                | spirv::Op::SpecConstantComposite
        )
    }

    // Ops

    pub fn add_op(&mut self, op: Op) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(op);
        id
    }

    pub fn op_ref(&self, id: OpId) -> &Op {
        &self.ops[id.0 as usize]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Op {
        &mut self.ops[id.0 as usize]
    }

    pub fn set_debug_name(&mut self, id: OpId, name: impl Into<String>) {
        self.ops[id.0 as usize].debug_name = Some(name.into());
    }

    // Functions

    pub fn add_function(&mut self, function: Function) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(function);
        id
    }

    pub fn function_ref(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(index, function)| (FunctionId(index as u32), function))
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn function_return_type(&self, id: FunctionId) -> Result<TypeId> {
        match &self.type_ref(self.function_ref(id).function_type).kind {
            TypeKind::Function { return_type, .. } => Ok(*return_type),
            _ => Err(CompilerError::BackendError(
                "function has a non-function type".into(),
            )),
        }
    }

    /// Create a function with an empty body and the given signature.
    pub fn create_function(
        &mut self,
        name: impl Into<String>,
        return_type: TypeId,
        parameter_types: &[TypeId],
    ) -> FunctionId {
        let function_type = self.function_type(return_type, parameter_types);
        let parameters = parameter_types
            .iter()
            .map(|ty| {
                self.add_op(Op::new(spirv::Op::FunctionParameter, Some(*ty), vec![]))
            })
            .collect();
        self.add_function(Function {
            name: name.into(),
            function_type,
            parameters,
            blocks: Vec::new(),
        })
    }

    // Imports

    pub fn add_import(&mut self, name: &str) -> ImportId {
        if let Some(i) = self.imports.iter().position(|imp| imp.name == name) {
            return ImportId(i as u32);
        }
        let id = ImportId(self.imports.len() as u32);
        self.imports.push(ExtensionImport { name: name.into() });
        id
    }

    pub fn import_ref(&self, id: ImportId) -> &ExtensionImport {
        &self.imports[id.0 as usize]
    }

    // Globals

    pub fn add_global(&mut self, instance: OpId, initializer: Option<FunctionId>) {
        self.global_lookup.insert(instance, self.globals.len());
        self.globals.push(GlobalVariableData {
            instance,
            initializer,
        });
    }

    pub fn is_global(&self, op: OpId) -> bool {
        self.global_lookup.contains_key(&op)
    }

    pub fn global_initializer(&self, op: OpId) -> Option<FunctionId> {
        self.global_lookup
            .get(&op)
            .and_then(|i| self.globals[*i].initializer)
    }

    /// Declare a global variable of the given value type.
    pub fn make_global_variable(
        &mut self,
        value_type: TypeId,
        storage_class: StorageClass,
        name: impl Into<String>,
    ) -> Result<OpId> {
        let pointer = self.pointer_to(value_type, storage_class)?;
        let mut op = Op::new(
            spirv::Op::Variable,
            Some(pointer),
            vec![Operand::Literal(storage_class as u32)],
        );
        op.debug_name = Some(name.into());
        let id = self.add_op(op);
        self.add_global(id, None);
        Ok(id)
    }

    /// Declare a function-local variable; the caller owns placing it in the
    /// entry block's local-variable list.
    pub fn make_local_variable(
        &mut self,
        value_type: TypeId,
        name: impl Into<String>,
    ) -> Result<OpId> {
        let pointer = self.pointer_to(value_type, StorageClass::Function)?;
        let mut op = Op::new(
            spirv::Op::Variable,
            Some(pointer),
            vec![Operand::Literal(StorageClass::Function as u32)],
        );
        op.debug_name = Some(name.into());
        Ok(self.add_op(op))
    }

    // Blocks and block-building helpers

    pub fn new_block(&mut self) -> BasicBlock {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        BasicBlock {
            id,
            kind: BlockKind::Plain,
            local_variables: Vec::new(),
            ops: Vec::new(),
            terminator: None,
            debug_name: None,
        }
    }

    pub fn build_op(
        &mut self,
        block: &mut BasicBlock,
        opcode: spirv::Op,
        result_type: Option<TypeId>,
        operands: Vec<Operand>,
    ) -> OpId {
        let op = Op::new(opcode, result_type, operands);
        let terminates = op.is_terminator();
        let id = self.add_op(op);
        block.ops.push(id);
        if terminates {
            block.terminator = Some(id);
        }
        id
    }

    pub fn build_return(&mut self, block: &mut BasicBlock) -> OpId {
        self.build_op(block, spirv::Op::Return, None, vec![])
    }

    pub fn build_call(
        &mut self,
        block: &mut BasicBlock,
        return_type: TypeId,
        function: FunctionId,
        arguments: &[OpId],
    ) -> OpId {
        let mut operands = vec![Operand::Function(function)];
        operands.extend(arguments.iter().map(|a| Operand::Op(*a)));
        self.build_op(block, spirv::Op::FunctionCall, Some(return_type), operands)
    }

    pub fn build_load(&mut self, block: &mut BasicBlock, value_type: TypeId, pointer: OpId) -> OpId {
        self.build_op(
            block,
            spirv::Op::Load,
            Some(value_type),
            vec![Operand::Op(pointer)],
        )
    }

    pub fn build_store(&mut self, block: &mut BasicBlock, pointer: OpId, value: OpId) -> OpId {
        self.build_op(
            block,
            spirv::Op::Store,
            None,
            vec![Operand::Op(pointer), Operand::Op(value)],
        )
    }

    /// Access-chain into an aggregate pointer with constant integer indices.
    pub fn build_access_chain(
        &mut self,
        block: &mut BasicBlock,
        result_value_type: TypeId,
        storage_class: StorageClass,
        base: OpId,
        indices: &[u32],
    ) -> Result<OpId> {
        let result_pointer = self.pointer_to(result_value_type, storage_class)?;
        let mut operands = vec![Operand::Op(base)];
        for index in indices {
            let c = self.constant_int(*index as i32);
            operands.push(Operand::Op(c));
        }
        Ok(self.build_op(block, spirv::Op::AccessChain, Some(result_pointer), operands))
    }

    // Fragment registration

    /// Register a front-end fragment type: a struct with one member per
    /// field and an auto-generated default constructor.
    pub fn register_fragment(&mut self, meta: &ShaderTypeMeta) -> Result<TypeId> {
        let mut members = Vec::with_capacity(meta.fields.len());
        for field in &meta.fields {
            let field_type = match self.find_type(&field.type_name) {
                Some(t) => t,
                None => {
                    return Err(CompilerError::LinkError(
                        format!(
                            "field '{}' of fragment '{}' has unknown type '{}'",
                            field.name, meta.name, field.type_name
                        ),
                        Some(field.location),
                    ))
                }
            };
            members.push((field.name.clone(), field_type));
        }

        let type_id = self.struct_type(meta.name.clone(), &members);
        self.types[type_id.0 as usize].meta = Some(meta.clone());

        // Auto default constructor: the front end emits field initializer
        // stores here; an empty body is valid when every field is
        // default-initialized.
        let self_pointer = self.pointer_to(type_id, StorageClass::Function)?;
        let void = self.void_type;
        let ctor = self.create_function(
            format!("{}_DefaultConstructor", meta.name),
            void,
            &[self_pointer],
        );
        let mut block = self.new_block();
        self.build_return(&mut block);
        self.function_mut(ctor).blocks.push(block);
        self.default_constructors.insert(type_id, ctor);

        Ok(type_id)
    }

    pub fn default_constructor(&self, type_id: TypeId) -> Option<FunctionId> {
        self.default_constructors.get(&type_id).copied()
    }

    pub fn spec_constants(&self) -> &[OpId] {
        &self.spec_constants
    }
}
