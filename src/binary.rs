//! Binary module emission.
//!
//! Two passes over the IR: dependency collection walks everything
//! transitively reachable from the entry points in discovery order, then
//! identity assignment hands out sequential nonzero ids in the fixed
//! precedence imports, types, constants, globals, functions. Late-bound
//! substitutions swap a function for a specialized clone while reusing the
//! original's id, so every call site stays valid. Serialization writes the
//! module sections in the order the format requires.

use crate::entry_points::EntryPointInfo;
use crate::error::{CompilerError, Result};
use crate::ir::{
    BasicBlock, BlockId, BlockKind, FunctionId, ImportId, Op, OpId, Operand, ShaderLibrary,
    TypeId, TypeKind,
};
use crate::meta::FragmentKind;
use crate::reflection::StageReflection;
use log::debug;
use rspirv::spirv::{self, BuiltIn, Capability, Decoration, ExecutionModel};
use std::collections::{HashMap, HashSet};

/// Insertion-ordered set; discovery order decides both identity order and
/// section order in the emitted module.
struct OrderedSet<T> {
    items: Vec<T>,
    lookup: HashSet<T>,
}

impl<T: Copy + Eq + std::hash::Hash> OrderedSet<T> {
    fn new() -> Self {
        OrderedSet {
            items: Vec::new(),
            lookup: HashSet::new(),
        }
    }

    fn insert(&mut self, item: T) -> bool {
        if self.lookup.insert(item) {
            self.items.push(item);
            true
        } else {
            false
        }
    }

    fn contains(&self, item: &T) -> bool {
        self.lookup.contains(item)
    }

    fn remove(&mut self, item: &T) {
        if self.lookup.remove(item) {
            self.items.retain(|i| i != item);
        }
    }

    fn items(&self) -> &[T] {
        &self.items
    }
}

/// Types, constants and globals interleave in one module section, in the
/// order they were discovered.
#[derive(Clone, Copy)]
enum TcgItem {
    Type(TypeId),
    Constant(OpId),
    Global(OpId),
}

/// Everything transitively referenced by the entry points being emitted.
pub struct DependencyCollector {
    imports: OrderedSet<ImportId>,
    types: OrderedSet<TypeId>,
    constants: OrderedSet<OpId>,
    globals: OrderedSet<OpId>,
    functions: OrderedSet<FunctionId>,
    visited_ops: HashSet<OpId>,
    tcg: Vec<TcgItem>,
    global_initializers: OrderedSet<FunctionId>,
    capabilities: OrderedSet<u32>,
}

impl DependencyCollector {
    pub fn new() -> Self {
        DependencyCollector {
            imports: OrderedSet::new(),
            types: OrderedSet::new(),
            constants: OrderedSet::new(),
            globals: OrderedSet::new(),
            functions: OrderedSet::new(),
            visited_ops: HashSet::new(),
            tcg: Vec::new(),
            global_initializers: OrderedSet::new(),
            capabilities: OrderedSet::new(),
        }
    }

    fn add_capability(&mut self, capability: Capability) {
        self.capabilities.insert(capability as u32);
    }

    /// Dependencies are collected before the item itself so the module
    /// section declares every type before its first use.
    fn collect_type(&mut self, lib: &ShaderLibrary, ty: TypeId) {
        if self.types.contains(&ty) {
            return;
        }
        match lib.type_ref(ty).kind.clone() {
            TypeKind::Vector { component, .. } => self.collect_type(lib, component),
            TypeKind::Matrix { column, .. } => self.collect_type(lib, column),
            TypeKind::Struct { members } => {
                for member in members {
                    self.collect_type(lib, member);
                }
            }
            TypeKind::FixedArray { element, length, .. } => {
                self.collect_type(lib, element);
                self.collect_op(lib, length);
            }
            TypeKind::RuntimeArray { element } => self.collect_type(lib, element),
            TypeKind::Image { sampled_type, .. } => self.collect_type(lib, sampled_type),
            TypeKind::SampledImage { image } => self.collect_type(lib, image),
            TypeKind::Function {
                return_type,
                parameters,
            } => {
                self.collect_type(lib, return_type);
                for parameter in parameters {
                    self.collect_type(lib, parameter);
                }
            }
            TypeKind::Pointer { pointee, .. } => self.collect_type(lib, pointee),
            _ => {}
        }
        if self.types.insert(ty) {
            self.tcg.push(TcgItem::Type(ty));
        }
    }

    fn collect_op(&mut self, lib: &ShaderLibrary, op: OpId) {
        if lib.is_constant_op(op) {
            if self.constants.contains(&op) {
                return;
            }
            if let Some(result_type) = lib.op_ref(op).result_type {
                self.collect_type(lib, result_type);
            }
            for operand in lib.op_ref(op).operands.clone() {
                if let Operand::Op(constituent) = operand {
                    self.collect_op(lib, constituent);
                }
            }
            if self.constants.insert(op) {
                self.tcg.push(TcgItem::Constant(op));
            }
            return;
        }

        if lib.is_global(op) {
            if self.globals.contains(&op) {
                return;
            }
            if let Some(result_type) = lib.op_ref(op).result_type {
                self.collect_type(lib, result_type);
            }
            if self.globals.insert(op) {
                self.tcg.push(TcgItem::Global(op));
            }
            if let Some(initializer) = lib.global_initializer(op) {
                self.global_initializers.insert(initializer);
                self.collect_function(lib, initializer);
            }
            return;
        }

        if !self.visited_ops.insert(op) {
            return;
        }
        if let Some(result_type) = lib.op_ref(op).result_type {
            self.collect_type(lib, result_type);
        }
        for operand in lib.op_ref(op).operands.clone() {
            match operand {
                Operand::Op(referenced) => self.collect_op(lib, referenced),
                Operand::Function(function) => self.collect_function(lib, function),
                Operand::Type(ty) => self.collect_type(lib, ty),
                Operand::Import(import) => {
                    self.imports.insert(import);
                }
                Operand::Block(_) | Operand::Literal(_) => {}
            }
        }
    }

    pub fn collect_function(&mut self, lib: &ShaderLibrary, function: FunctionId) {
        if !self.functions.insert(function) {
            return;
        }
        let function_type = lib.function_ref(function).function_type;
        self.collect_type(lib, function_type);
        for parameter in lib.function_ref(function).parameters.clone() {
            if let Some(result_type) = lib.op_ref(parameter).result_type {
                self.collect_type(lib, result_type);
            }
        }
        let block_count = lib.function_ref(function).blocks.len();
        for block_index in 0..block_count {
            let (locals, ops) = {
                let block = &lib.function_ref(function).blocks[block_index];
                (block.local_variables.clone(), block.ops.clone())
            };
            for local in locals {
                if let Some(result_type) = lib.op_ref(local).result_type {
                    self.collect_type(lib, result_type);
                }
            }
            for op in ops {
                self.collect_op(lib, op);
            }
        }
    }
}

impl Default for DependencyCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity map for emission. Id 0 is reserved; every item referenced by a
/// written instruction must have been assigned a nonzero id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum IrKey {
    Type(TypeId),
    Op(OpId),
    Function(FunctionId),
    Block(BlockId),
    Import(ImportId),
}

struct IdContext {
    ids: HashMap<IrKey, u32>,
    next: u32,
}

impl IdContext {
    fn new() -> Self {
        IdContext {
            ids: HashMap::new(),
            next: 1,
        }
    }

    fn generate(&mut self, key: IrKey) -> u32 {
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(key, id);
        id
    }

    fn alias(&mut self, key: IrKey, id: u32) {
        self.ids.insert(key, id);
    }

    fn find(&self, key: IrKey) -> Result<u32> {
        self.ids
            .get(&key)
            .copied()
            .ok_or_else(|| CompilerError::BackendError(format!("no id assigned for {:?}", key)))
    }

    fn bound(&self) -> u32 {
        self.next
    }
}

/// Word stream with the (word-count | opcode) framing the format requires.
struct ModuleWriter {
    words: Vec<u32>,
}

impl ModuleWriter {
    fn new() -> Self {
        ModuleWriter { words: Vec::new() }
    }

    fn write(&mut self, word: u32) {
        self.words.push(word);
    }

    fn instruction(&mut self, word_count: u16, opcode: spirv::Op) {
        self.words
            .push(((word_count as u32) << 16) | (opcode as u32 & 0xffff));
    }

    /// Null-terminated UTF-8, padded to a word boundary.
    fn write_string(&mut self, text: &str) {
        let mut bytes: Vec<u8> = text.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        for chunk in bytes.chunks(4) {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.words.push(word);
        }
    }

    fn string_word_count(text: &str) -> u16 {
        ((text.len() + 1).div_ceil(4)) as u16
    }
}

#[derive(Debug, Clone)]
pub struct EmitResult {
    pub words: Vec<u32>,
    pub reflections: Vec<StageReflection>,
}

pub struct BinaryBackend;

impl BinaryBackend {
    /// Emit one module containing every given entry point plus everything
    /// they transitively reference. There is no partial-success mode:
    /// either the whole module is produced or the run fails.
    pub fn translate_entry_points(
        lib: &mut ShaderLibrary,
        entry_points: &[EntryPointInfo],
    ) -> Result<EmitResult> {
        if entry_points.is_empty() {
            return Err(CompilerError::BackendError(
                "no entry points to translate".into(),
            ));
        }

        let mut collector = DependencyCollector::new();
        for entry_point in entry_points {
            collector.collect_function(lib, entry_point.entry_fn);
            for variable in &entry_point.variables {
                collector.collect_op(lib, *variable);
            }
        }

        // Replace each entry point's globals initializer with a clone that
        // calls every collected global's initializer. The clone keeps the
        // original's identity, so repeated emission never appends twice.
        let mut extra_late_bound: HashMap<FunctionId, FunctionId> = HashMap::new();
        for entry_point in entry_points {
            let Some(original) = entry_point.globals_initializer else {
                continue;
            };
            let name = lib.function_ref(original).name.clone();
            let void = lib.void_type;
            let clone = lib.create_function(name, void, &[]);
            let mut block = lib.new_block();
            for initializer in collector.global_initializers.items().to_vec() {
                lib.build_call(&mut block, void, initializer, &[]);
            }
            lib.build_return(&mut block);
            lib.function_mut(clone).blocks.push(block);
            extra_late_bound.insert(original, clone);
        }

        let mut context = IdContext::new();
        for entry_point in entry_points {
            Self::register_late_bound(lib, &mut collector, &mut context, &entry_point.late_bound_functions);
        }
        Self::register_late_bound(lib, &mut collector, &mut context, &extra_late_bound);

        // Some built-in decorations imply capabilities.
        for entry_point in entry_points {
            for capability in &entry_point.capabilities {
                collector.add_capability(*capability);
            }
            Self::add_decoration_capabilities(lib, &mut collector, entry_point);
        }

        // Identity assignment, in the fixed precedence.
        for import in collector.imports.items().to_vec() {
            context.generate(IrKey::Import(import));
        }
        for ty in collector.types.items().to_vec() {
            context.generate(IrKey::Type(ty));
        }
        for constant in collector.constants.items().to_vec() {
            context.generate(IrKey::Op(constant));
        }
        for global in collector.globals.items().to_vec() {
            context.generate(IrKey::Op(global));
        }
        for function in collector.functions.items().to_vec() {
            Self::generate_function_ids(lib, &mut context, function);
        }

        debug!(
            "emitting {} entry point(s), id bound {}",
            entry_points.len(),
            context.bound()
        );

        let mut writer = ModuleWriter::new();
        let mut reflections: Vec<StageReflection> = entry_points
            .iter()
            .map(|ep| ep.reflection.clone())
            .collect();

        Self::write_header(lib, &collector, &context, entry_points, &mut writer)?;
        Self::write_debug_names(lib, &collector, &context, &mut writer)?;
        for entry_point in entry_points {
            for decoration in &entry_point.decorations {
                Self::write_op(lib, &context, None, *decoration, &mut writer)?;
            }
        }
        Self::write_spec_constant_bindings(lib, &collector, &context, &mut writer, &mut reflections)?;
        Self::write_types_constants_globals(lib, &collector, &context, &mut writer)?;
        for function in collector.functions.items() {
            Self::write_function(lib, &context, *function, &mut writer)?;
        }

        Ok(EmitResult {
            words: writer.words,
            reflections,
        })
    }

    /// Swap originals for their late-bound replacements, sharing one id.
    /// The replacement's own dependencies are collected before the swap.
    fn register_late_bound(
        lib: &ShaderLibrary,
        collector: &mut DependencyCollector,
        context: &mut IdContext,
        late_bound: &HashMap<FunctionId, FunctionId>,
    ) {
        for (original, replacement) in late_bound {
            if collector.functions.contains(original) {
                collector.functions.remove(original);
                collector.collect_function(lib, *replacement);
                let id = context.generate(IrKey::Function(*original));
                context.alias(IrKey::Function(*replacement), id);
            }
        }
    }

    fn add_decoration_capabilities(
        lib: &ShaderLibrary,
        collector: &mut DependencyCollector,
        entry_point: &EntryPointInfo,
    ) {
        for decoration in &entry_point.decorations {
            let op = lib.op_ref(*decoration);
            if op.opcode != spirv::Op::Decorate || op.operands.len() < 3 {
                continue;
            }
            let Operand::Literal(kind) = op.operands[1] else {
                continue;
            };
            if kind != Decoration::BuiltIn as u32 {
                continue;
            }
            let Operand::Literal(builtin) = op.operands[2] else {
                continue;
            };
            if builtin == BuiltIn::ClipDistance as u32 {
                collector.add_capability(Capability::ClipDistance);
            } else if builtin == BuiltIn::CullDistance as u32 {
                collector.add_capability(Capability::CullDistance);
            } else if builtin == BuiltIn::PrimitiveId as u32 || builtin == BuiltIn::InvocationId as u32 {
                collector.add_capability(Capability::Geometry);
            }
        }
    }

    /// Function, parameters, then per block: label, local variables, and
    /// finally every result-producing instruction. Instructions without a
    /// result never receive an identity.
    fn generate_function_ids(lib: &ShaderLibrary, context: &mut IdContext, function: FunctionId) {
        context.generate(IrKey::Function(function));
        for parameter in &lib.function_ref(function).parameters {
            context.generate(IrKey::Op(*parameter));
        }
        for block in &lib.function_ref(function).blocks {
            context.generate(IrKey::Block(block.id));
            for local in &block.local_variables {
                context.generate(IrKey::Op(*local));
            }
            for op in &block.ops {
                if lib.op_ref(*op).has_result() && context.ids.get(&IrKey::Op(*op)).is_none() {
                    context.generate(IrKey::Op(*op));
                }
            }
        }
    }

    fn execution_model(kind: FragmentKind) -> ExecutionModel {
        match kind {
            FragmentKind::Vertex => ExecutionModel::Vertex,
            FragmentKind::Geometry => ExecutionModel::Geometry,
            FragmentKind::Compute => ExecutionModel::GLCompute,
            _ => ExecutionModel::Fragment,
        }
    }

    fn write_header(
        lib: &ShaderLibrary,
        collector: &DependencyCollector,
        context: &IdContext,
        entry_points: &[EntryPointInfo],
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        writer.write(spirv::MAGIC_NUMBER);
        writer.write((1 << 16) | (4 << 8)); // version 1.4
        writer.write(0); // generator
        writer.write(context.bound());
        writer.write(0); // schema

        writer.instruction(2, spirv::Op::Capability);
        writer.write(Capability::Shader as u32);
        for capability in collector.capabilities.items() {
            if *capability == Capability::Shader as u32 {
                continue;
            }
            writer.instruction(2, spirv::Op::Capability);
            writer.write(*capability);
        }

        for import in collector.imports.items() {
            let name = lib.import_ref(*import).name.clone();
            let word_count = 2 + ModuleWriter::string_word_count(&name);
            writer.instruction(word_count, spirv::Op::ExtInstImport);
            writer.write(context.find(IrKey::Import(*import))?);
            writer.write_string(&name);
        }

        writer.instruction(3, spirv::Op::MemoryModel);
        writer.write(spirv::AddressingModel::Logical as u32);
        writer.write(spirv::MemoryModel::GLSL450 as u32);

        for entry_point in entry_points {
            let function = entry_point.entry_fn;
            let name = lib.function_ref(function).name.clone();
            let word_count =
                3 + ModuleWriter::string_word_count(&name) + entry_point.interface.len() as u16;
            writer.instruction(word_count, spirv::Op::EntryPoint);
            writer.write(Self::execution_model(entry_point.fragment_kind) as u32);
            writer.write(context.find(IrKey::Function(function))?);
            writer.write_string(&name);
            for variable in &entry_point.interface {
                writer.write(context.find(IrKey::Op(*variable))?);
            }
        }

        for entry_point in entry_points {
            for mode in &entry_point.execution_modes {
                Self::write_op(lib, context, None, *mode, writer)?;
            }
        }

        // Source language unknown, version 100.
        writer.instruction(3, spirv::Op::Source);
        writer.write(0);
        writer.write(100);
        Ok(())
    }

    fn write_name(
        writer: &mut ModuleWriter,
        id: u32,
        name: &str,
    ) {
        if name.is_empty() {
            return;
        }
        let word_count = 2 + ModuleWriter::string_word_count(name);
        writer.instruction(word_count, spirv::Op::Name);
        writer.write(id);
        writer.write_string(name);
    }

    fn write_debug_names(
        lib: &ShaderLibrary,
        collector: &DependencyCollector,
        context: &IdContext,
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        for ty in collector.types.items() {
            let shader_type = lib.type_ref(*ty);
            let id = context.find(IrKey::Type(*ty))?;
            Self::write_name(writer, id, &shader_type.name);
            for (index, member_name) in shader_type.member_names.iter().enumerate() {
                let word_count = 3 + ModuleWriter::string_word_count(member_name);
                writer.instruction(word_count, spirv::Op::MemberName);
                writer.write(id);
                writer.write(index as u32);
                writer.write_string(member_name);
            }
        }
        for global in collector.globals.items() {
            if let Some(name) = &lib.op_ref(*global).debug_name {
                let id = context.find(IrKey::Op(*global))?;
                Self::write_name(writer, id, name);
            }
        }
        for constant in collector.constants.items() {
            if let Some(name) = &lib.op_ref(*constant).debug_name {
                let id = context.find(IrKey::Op(*constant))?;
                Self::write_name(writer, id, name);
            }
        }
        for function in collector.functions.items() {
            let id = context.find(IrKey::Function(*function))?;
            let name = lib.function_ref(*function).name.clone();
            Self::write_name(writer, id, &name);
            for parameter in &lib.function_ref(*function).parameters {
                if let Some(name) = &lib.op_ref(*parameter).debug_name {
                    Self::write_name(writer, context.find(IrKey::Op(*parameter))?, name);
                }
            }
            for block in &lib.function_ref(*function).blocks {
                for local in &block.local_variables {
                    if let Some(name) = &lib.op_ref(*local).debug_name {
                        Self::write_name(writer, context.find(IrKey::Op(*local))?, name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Scalar specialization constants are numbered in first-encountered
    /// order; composites inherit their first scalar constituent's id.
    fn write_spec_constant_bindings(
        lib: &ShaderLibrary,
        collector: &DependencyCollector,
        context: &IdContext,
        writer: &mut ModuleWriter,
        reflections: &mut [StageReflection],
    ) -> Result<()> {
        let mut spec_id = 1u32;
        let mut assigned: HashMap<String, u32> = HashMap::new();
        for constant in collector.constants.items() {
            let op = lib.op_ref(*constant);
            if op.opcode == spirv::Op::SpecConstant {
                let id = context.find(IrKey::Op(*constant))?;
                writer.instruction(4, spirv::Op::Decorate);
                writer.write(id);
                writer.write(Decoration::SpecId as u32);
                writer.write(spec_id);
                if let Some(name) = &op.debug_name {
                    assigned.insert(name.clone(), spec_id);
                }
                spec_id += 1;
            } else if op.opcode == spirv::Op::SpecConstantComposite {
                let leaf = Self::find_spec_constant_leaf(lib, *constant)?;
                let leaf_name = lib.op_ref(leaf).debug_name.clone().unwrap_or_default();
                if let (Some(name), Some(leaf_id)) =
                    (op.debug_name.clone(), assigned.get(&leaf_name).copied())
                {
                    assigned.insert(name, leaf_id);
                }
            }
        }
        for reflection in reflections {
            reflection.specialization_constants = assigned.clone();
        }
        Ok(())
    }

    fn find_spec_constant_leaf(lib: &ShaderLibrary, op: OpId) -> Result<OpId> {
        if lib.op_ref(op).opcode == spirv::Op::SpecConstant {
            return Ok(op);
        }
        match lib.op_ref(op).operands.first() {
            Some(Operand::Op(constituent)) => Self::find_spec_constant_leaf(lib, *constituent),
            _ => Err(CompilerError::BackendError(
                "composite specialization constant has no scalar constituent".into(),
            )),
        }
    }

    fn write_types_constants_globals(
        lib: &ShaderLibrary,
        collector: &DependencyCollector,
        context: &IdContext,
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        for item in &collector.tcg {
            match item {
                TcgItem::Type(ty) => Self::write_type(lib, context, *ty, writer)?,
                TcgItem::Constant(constant) => Self::write_constant(lib, context, *constant, writer)?,
                TcgItem::Global(global) => Self::write_op(lib, context, None, *global, writer)?,
            }
        }
        Ok(())
    }

    fn write_type(
        lib: &ShaderLibrary,
        context: &IdContext,
        ty: TypeId,
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        let id = context.find(IrKey::Type(ty))?;
        match &lib.type_ref(ty).kind {
            TypeKind::Void => {
                writer.instruction(2, spirv::Op::TypeVoid);
                writer.write(id);
            }
            TypeKind::Bool => {
                writer.instruction(2, spirv::Op::TypeBool);
                writer.write(id);
            }
            TypeKind::Int { signed } => {
                writer.instruction(4, spirv::Op::TypeInt);
                writer.write(id);
                writer.write(32);
                writer.write(*signed as u32);
            }
            TypeKind::Float => {
                writer.instruction(3, spirv::Op::TypeFloat);
                writer.write(id);
                writer.write(32);
            }
            TypeKind::Vector { component, count } => {
                writer.instruction(4, spirv::Op::TypeVector);
                writer.write(id);
                writer.write(context.find(IrKey::Type(*component))?);
                writer.write(*count);
            }
            TypeKind::Matrix { column, count } => {
                writer.instruction(4, spirv::Op::TypeMatrix);
                writer.write(id);
                writer.write(context.find(IrKey::Type(*column))?);
                writer.write(*count);
            }
            TypeKind::Struct { members } => {
                writer.instruction(2 + members.len() as u16, spirv::Op::TypeStruct);
                writer.write(id);
                for member in members {
                    writer.write(context.find(IrKey::Type(*member))?);
                }
            }
            TypeKind::FixedArray { element, length, .. } => {
                writer.instruction(4, spirv::Op::TypeArray);
                writer.write(id);
                writer.write(context.find(IrKey::Type(*element))?);
                writer.write(context.find(IrKey::Op(*length))?);
            }
            TypeKind::RuntimeArray { element } => {
                writer.instruction(3, spirv::Op::TypeRuntimeArray);
                writer.write(id);
                writer.write(context.find(IrKey::Type(*element))?);
            }
            TypeKind::Image {
                sampled_type,
                format,
            } => {
                writer.instruction(9, spirv::Op::TypeImage);
                writer.write(id);
                writer.write(context.find(IrKey::Type(*sampled_type))?);
                writer.write(format.dim as u32);
                writer.write(format.depth);
                writer.write(format.arrayed);
                writer.write(format.multisampled);
                writer.write(format.sampled);
                writer.write(format.format as u32);
            }
            TypeKind::Sampler => {
                writer.instruction(2, spirv::Op::TypeSampler);
                writer.write(id);
            }
            TypeKind::SampledImage { image } => {
                writer.instruction(3, spirv::Op::TypeSampledImage);
                writer.write(id);
                writer.write(context.find(IrKey::Type(*image))?);
            }
            TypeKind::Function {
                return_type,
                parameters,
            } => {
                writer.instruction(3 + parameters.len() as u16, spirv::Op::TypeFunction);
                writer.write(id);
                writer.write(context.find(IrKey::Type(*return_type))?);
                for parameter in parameters {
                    writer.write(context.find(IrKey::Type(*parameter))?);
                }
            }
            TypeKind::Pointer {
                pointee,
                storage_class,
            } => {
                writer.instruction(4, spirv::Op::TypePointer);
                writer.write(id);
                writer.write(*storage_class as u32);
                writer.write(context.find(IrKey::Type(*pointee))?);
            }
        }
        Ok(())
    }

    fn write_constant(
        lib: &ShaderLibrary,
        context: &IdContext,
        constant: OpId,
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        let op = lib.op_ref(constant);
        let result_type = op.result_type.ok_or_else(|| {
            CompilerError::BackendError("constant without a result type".into())
        })?;
        let type_id = context.find(IrKey::Type(result_type))?;
        let id = context.find(IrKey::Op(constant))?;
        match op.opcode {
            spirv::Op::ConstantTrue
            | spirv::Op::ConstantFalse
            | spirv::Op::SpecConstantTrue
            | spirv::Op::SpecConstantFalse => {
                writer.instruction(3, op.opcode);
                writer.write(type_id);
                writer.write(id);
            }
            spirv::Op::Constant | spirv::Op::SpecConstant => {
                writer.instruction(3 + op.operands.len() as u16, op.opcode);
                writer.write(type_id);
                writer.write(id);
                for operand in &op.operands {
                    if let Operand::Literal(value) = operand {
                        writer.write(*value);
                    }
                }
            }
            spirv::Op::SpecConstantComposite => {
                writer.instruction(3 + op.operands.len() as u16, op.opcode);
                writer.write(type_id);
                writer.write(id);
                for operand in &op.operands {
                    if let Operand::Op(constituent) = operand {
                        writer.write(context.find(IrKey::Op(*constituent))?);
                    }
                }
            }
            _ => {
                return Err(CompilerError::BackendError(format!(
                    "unexpected constant opcode {:?}",
                    op.opcode
                )))
            }
        }
        Ok(())
    }

    fn write_function(
        lib: &ShaderLibrary,
        context: &IdContext,
        function: FunctionId,
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        let function_type = lib.function_ref(function).function_type;
        let return_type = match &lib.type_ref(function_type).kind {
            TypeKind::Function { return_type, .. } => *return_type,
            _ => {
                return Err(CompilerError::BackendError(
                    "function has a non-function type".into(),
                ))
            }
        };

        writer.instruction(5, spirv::Op::Function);
        writer.write(context.find(IrKey::Type(return_type))?);
        writer.write(context.find(IrKey::Function(function))?);
        writer.write(spirv::FunctionControl::NONE.bits());
        writer.write(context.find(IrKey::Type(function_type))?);

        for parameter in &lib.function_ref(function).parameters {
            let parameter_type = lib.op_ref(*parameter).result_type.ok_or_else(|| {
                CompilerError::BackendError("function parameter without a type".into())
            })?;
            writer.instruction(3, spirv::Op::FunctionParameter);
            writer.write(context.find(IrKey::Type(parameter_type))?);
            writer.write(context.find(IrKey::Op(*parameter))?);
        }

        for block in &lib.function_ref(function).blocks {
            Self::write_block(lib, context, block, writer)?;
        }

        writer.instruction(1, spirv::Op::FunctionEnd);
        Ok(())
    }

    fn write_block(
        lib: &ShaderLibrary,
        context: &IdContext,
        block: &BasicBlock,
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        writer.instruction(2, spirv::Op::Label);
        writer.write(context.find(IrKey::Block(block.id))?);

        // Local variables must precede every other instruction.
        for local in &block.local_variables {
            Self::write_op(lib, context, Some(block), *local, writer)?;
        }
        for op in &block.ops {
            Self::write_op(lib, context, Some(block), *op, writer)?;
        }
        Ok(())
    }

    fn write_op(
        lib: &ShaderLibrary,
        context: &IdContext,
        block: Option<&BasicBlock>,
        op_id: OpId,
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        let op = lib.op_ref(op_id);
        match op.opcode {
            // Constants never appear in the instruction stream; they were
            // already written in the module-level section.
            spirv::Op::Constant
            | spirv::Op::ConstantTrue
            | spirv::Op::ConstantFalse
            | spirv::Op::SpecConstant
            | spirv::Op::SpecConstantComposite => return Ok(()),
            spirv::Op::Branch => {
                if let Some(BlockKind::Loop {
                    merge,
                    continue_target,
                }) = block.map(|b| b.kind)
                {
                    writer.instruction(4, spirv::Op::LoopMerge);
                    writer.write(context.find(IrKey::Block(merge))?);
                    writer.write(context.find(IrKey::Block(continue_target))?);
                    writer.write(spirv::LoopControl::NONE.bits());
                }
                writer.instruction(1 + op.operands.len() as u16, spirv::Op::Branch);
                Self::write_operands(lib, context, op, writer)?;
            }
            spirv::Op::BranchConditional => {
                if let Some(BlockKind::Selection { merge }) = block.map(|b| b.kind) {
                    writer.instruction(3, spirv::Op::SelectionMerge);
                    writer.write(context.find(IrKey::Block(merge))?);
                    writer.write(spirv::SelectionControl::NONE.bits());
                }
                writer.instruction(1 + op.operands.len() as u16, spirv::Op::BranchConditional);
                Self::write_operands(lib, context, op, writer)?;
            }
            _ => {
                if let Some(result_type) = op.result_type {
                    writer.instruction(3 + op.operands.len() as u16, op.opcode);
                    writer.write(context.find(IrKey::Type(result_type))?);
                    writer.write(context.find(IrKey::Op(op_id))?);
                    Self::write_operands(lib, context, op, writer)?;
                } else {
                    writer.instruction(1 + op.operands.len() as u16, op.opcode);
                    Self::write_operands(lib, context, op, writer)?;
                }
            }
        }
        Ok(())
    }

    fn write_operands(
        _lib: &ShaderLibrary,
        context: &IdContext,
        op: &Op,
        writer: &mut ModuleWriter,
    ) -> Result<()> {
        for operand in &op.operands {
            let word = match operand {
                Operand::Literal(value) => *value,
                Operand::Type(ty) => context.find(IrKey::Type(*ty))?,
                Operand::Op(referenced) => context.find(IrKey::Op(*referenced))?,
                Operand::Function(function) => context.find(IrKey::Function(*function))?,
                Operand::Block(block) => context.find(IrKey::Block(*block))?,
                Operand::Import(import) => context.find(IrKey::Import(*import))?,
            };
            writer.write(word);
        }
        Ok(())
    }
}
