//! The assembler's program graph and image emitter.
//!
//! Types, functions, data blocks and instances form a DAG rooted at the
//! instances. Nodes are arena-indexed and interned by structural identity, so
//! two machines whose resolved function bodies and data blocks are bytewise
//! equal share one type-table entry. Instance ordering is preserved across
//! dedup.
//!
//! Emission lays out the version-2 image: header, instance table, type
//! table, per-type function tables, shared function table, static data, then
//! function bodies. All addresses are computed in a sizing pass before any
//! word is written, which is what lets function bodies carry unresolved
//! label and static references until then.

use std::collections::HashMap;

use fluxpilot_derive::Error;

use crate::machine::image::{HEADER_LEN, INSTANCE_ENTRY_LEN, PROGRAM_VERSION, TYPE_ENTRY_LEN};
use crate::machine::isa::Op;
use crate::types::words::ProgramWord;

/// Errors raised while emitting a program graph into an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The emitted image would not be addressable with program words.
    #[error("the program image would be {0} words, past the addressable range")]
    ImageTooLarge(usize),
    /// Total globals would not fit in a program word.
    #[error("the globals partition would be {0} cells, past the addressable range")]
    GlobalsTooLarge(usize),
    /// A shared function index at or past the declared count.
    #[error("shared function index {0} is out of range")]
    SharedIndexOutOfRange(ProgramWord),
    /// Two shared function bodies assigned to one index.
    #[error("shared function index {0} defined twice")]
    DuplicateSharedIndex(ProgramWord),
}

/// Handle to an interned static data block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct StaticId(usize);

/// Handle to an interned function body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FunctionId(usize);

/// Handle to an interned machine type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TypeId(usize);

/// One word of an unemitted function body.
///
/// Label and static references stay symbolic until emission, when the
/// function's entry address and the static bases are known.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum WordRef {
    /// A fully resolved word (opcode, immediate, count).
    Literal(ProgramWord),
    /// An offset from the containing function's entry point.
    LabelOffset(ProgramWord),
    /// An offset into an interned static block.
    Static(StaticId, ProgramWord),
}

/// A function slot within a type: local index plus interned body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FunctionRef {
    pub index: ProgramWord,
    pub function_id: FunctionId,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct TypeNode {
    functions: Vec<FunctionRef>,
    statics: Vec<StaticId>,
    locals_size: ProgramWord,
    function_count: ProgramWord,
}

/// Interner assigning dense ids by structural key.
struct NodeInterner<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<V>,
}

impl<K, V> NodeInterner<K, V>
where
    K: Eq + std::hash::Hash,
{
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    fn intern(&mut self, key: K, node: V) -> usize {
        if let Some(existing) = self.map.get(&key) {
            return *existing;
        }
        let id = self.nodes.len();
        self.nodes.push(node);
        self.map.insert(key, id);
        id
    }
}

/// Accumulates graph nodes during assembly; [`finish`](Self::finish) freezes
/// it into a [`ProgramGraph`].
pub struct ProgramGraphBuilder {
    shared_globals_size: ProgramWord,
    statics: NodeInterner<Vec<ProgramWord>, Vec<ProgramWord>>,
    functions: NodeInterner<Vec<WordRef>, Vec<WordRef>>,
    types: NodeInterner<TypeNode, TypeNode>,
    instances: Vec<TypeId>,
    shared_functions: HashMap<ProgramWord, FunctionId>,
    shared_function_count: ProgramWord,
}

impl ProgramGraphBuilder {
    pub fn new(shared_function_count: ProgramWord) -> Self {
        Self {
            shared_globals_size: 0,
            statics: NodeInterner::new(),
            functions: NodeInterner::new(),
            types: NodeInterner::new(),
            instances: Vec::new(),
            shared_functions: HashMap::new(),
            shared_function_count,
        }
    }

    pub fn set_shared_globals_size(&mut self, size: ProgramWord) {
        self.shared_globals_size = size;
    }

    /// Interns a static data block; identical blocks share one region.
    pub fn add_static(&mut self, data: &[ProgramWord]) -> StaticId {
        let key = data.to_vec();
        StaticId(self.statics.intern(key.clone(), key))
    }

    /// Interns a function body; identical bodies share one emission.
    pub fn add_function(&mut self, words: Vec<WordRef>) -> FunctionId {
        FunctionId(self.functions.intern(words.clone(), words))
    }

    /// Assigns a body to a shared function table slot.
    pub fn add_shared_function(
        &mut self,
        index: ProgramWord,
        words: Vec<WordRef>,
    ) -> Result<(), GraphError> {
        if index >= self.shared_function_count {
            return Err(GraphError::SharedIndexOutOfRange(index));
        }
        if self.shared_functions.contains_key(&index) {
            return Err(GraphError::DuplicateSharedIndex(index));
        }
        let id = self.add_function(words);
        self.shared_functions.insert(index, id);
        Ok(())
    }

    /// Interns a machine type by structural identity.
    pub fn add_type(
        &mut self,
        mut functions: Vec<FunctionRef>,
        statics: Vec<StaticId>,
        locals_size: ProgramWord,
        function_count: ProgramWord,
    ) -> TypeId {
        functions.sort_by_key(|func| func.index);
        let node = TypeNode {
            functions,
            statics,
            locals_size,
            function_count,
        };
        TypeId(self.types.intern(node.clone(), node))
    }

    /// Appends an instance of the given type, preserving source order.
    pub fn add_instance(&mut self, type_id: TypeId) {
        self.instances.push(type_id);
    }

    pub fn finish(self) -> ProgramGraph {
        ProgramGraph {
            shared_globals_size: self.shared_globals_size,
            statics: self.statics.nodes,
            functions: self.functions.nodes,
            types: self.types.nodes,
            instances: self.instances,
            shared_functions: self.shared_functions,
            shared_function_count: self.shared_function_count,
        }
    }
}

/// A frozen program graph, ready for emission.
pub struct ProgramGraph {
    shared_globals_size: ProgramWord,
    statics: Vec<Vec<ProgramWord>>,
    functions: Vec<Vec<WordRef>>,
    types: Vec<TypeNode>,
    instances: Vec<TypeId>,
    shared_functions: HashMap<ProgramWord, FunctionId>,
    shared_function_count: ProgramWord,
}

impl ProgramGraph {
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn shared_function_count(&self) -> ProgramWord {
        self.shared_function_count
    }

    /// Emits the version-2 program image.
    pub fn emit(&self) -> Result<Vec<ProgramWord>, GraphError> {
        let instance_table = HEADER_LEN;
        let type_table = instance_table + self.instances.len() * INSTANCE_ENTRY_LEN;
        let function_tables = type_table + self.types.len() * TYPE_ENTRY_LEN;

        // Per-type function table offsets.
        let mut type_table_offsets = Vec::with_capacity(self.types.len());
        let mut cursor = function_tables;
        for node in &self.types {
            type_table_offsets.push(cursor);
            cursor += node.function_count as usize;
        }
        let shared_table = cursor;
        cursor += self.shared_function_count as usize;

        // Static block base addresses.
        let mut static_bases = Vec::with_capacity(self.statics.len());
        for block in &self.statics {
            static_bases.push(cursor);
            cursor += block.len();
        }

        // Function body entry addresses, each unique body once.
        let mut function_entries = Vec::with_capacity(self.functions.len());
        for body in &self.functions {
            function_entries.push(cursor);
            cursor += body.len();
        }

        // Shared slots without a body share one default EXIT stub.
        let needs_default = (0..self.shared_function_count)
            .any(|index| !self.shared_functions.contains_key(&index));
        let default_entry = cursor;
        if needs_default {
            cursor += 1;
        }

        let image_len = cursor;
        if image_len > ProgramWord::MAX as usize {
            return Err(GraphError::ImageTooLarge(image_len));
        }

        // Globals layout: shared globals first, then per-instance locals.
        let mut globals_bases = Vec::with_capacity(self.instances.len());
        let mut globals_size = self.shared_globals_size as usize;
        for type_id in &self.instances {
            globals_bases.push(globals_size);
            globals_size += self.types[type_id.0].locals_size as usize;
        }
        if globals_size > ProgramWord::MAX as usize {
            return Err(GraphError::GlobalsTooLarge(globals_size));
        }

        // Second pass: write every region at its computed address.
        let mut image = Vec::with_capacity(image_len);
        image.extend_from_slice(&[
            PROGRAM_VERSION,
            self.instances.len() as ProgramWord,
            globals_size as ProgramWord,
            self.shared_function_count,
            self.types.len() as ProgramWord,
            instance_table as ProgramWord,
            type_table as ProgramWord,
            shared_table as ProgramWord,
        ]);

        for (type_id, base) in self.instances.iter().zip(&globals_bases) {
            image.push(type_id.0 as ProgramWord);
            image.push(*base as ProgramWord);
        }

        for (node, table_offset) in self.types.iter().zip(&type_table_offsets) {
            image.push(node.function_count);
            image.push(*table_offset as ProgramWord);
        }

        for node in &self.types {
            let mut table = vec![0 as ProgramWord; node.function_count as usize];
            for func in &node.functions {
                table[func.index as usize] = function_entries[func.function_id.0] as ProgramWord;
            }
            image.extend_from_slice(&table);
        }

        for index in 0..self.shared_function_count {
            let entry = match self.shared_functions.get(&index) {
                Some(id) => function_entries[id.0],
                None => default_entry,
            };
            image.push(entry as ProgramWord);
        }

        for block in &self.statics {
            image.extend_from_slice(block);
        }

        for (body, entry) in self.functions.iter().zip(&function_entries) {
            for word in body {
                image.push(resolve_word(word, *entry, &static_bases));
            }
        }

        if needs_default {
            image.push(Op::Exit.into());
        }

        debug_assert_eq!(image.len(), image_len);
        Ok(image)
    }
}

fn resolve_word(word: &WordRef, function_start: usize, static_bases: &[usize]) -> ProgramWord {
    match *word {
        WordRef::Literal(value) => value,
        WordRef::LabelOffset(offset) => function_start as ProgramWord + offset,
        WordRef::Static(id, offset) => static_bases[id.0] as ProgramWord + offset,
    }
}
