//! Assembly language parser for light machine programs.
//!
//! The source is line-oriented: directives open and close nested blocks
//! (machines, functions, data blocks and their program-scoped `shared`
//! counterparts), instruction lines append to the open function, and
//! `name:` labels mark positions in functions and data blocks. Mnemonics are
//! case-insensitive; numbers are decimal or `0x`-prefixed hex; `;` starts a
//! comment.
//!
//! Assembly is two-pass: lines build a [`ProgramGraph`] whose function words
//! may still reference labels and static blocks symbolically, and emission
//! resolves everything to absolute word offsets. Identical machine
//! definitions dedup to a single type-table entry on the way through.
//!
//! Stack-operand instructions accept an optional operand that expands to a
//! preceding `PUSH`: `CALL blink` assembles as `PUSH <index>` + `CALL`, and
//! the same holds for `CALL_SHARED`, `JUMP`, `LOAD_STATIC` and the branches.
//! `RET` takes a literal count and is not expanded.

use fluxpilot_derive::Error;

use crate::machine::graph::{
    FunctionRef, GraphError, ProgramGraph, ProgramGraphBuilder, StaticId, WordRef,
};
use crate::machine::isa::{Op, OperandKind};
use crate::types::words::ProgramWord;

/// Shared function indices reserved for the routing contract:
/// `init_program` plus the three I2C route table entry points.
pub const SHARED_FUNCTION_RESERVED_COUNT: ProgramWord = 4;

/// Shared global words reserved for the I2C routing table.
pub const I2C_ROUTING_GLOBALS: ProgramWord = 16;

const I2C_DEFAULTS_BLOCK: &str = "i2c_defaults";
const I2C_DEFAULT_LABEL_PREFIX: &str = "i2c_default_";
const INIT_PROGRAM_NAME: &str = "init_program";
const INIT_PROGRAM_INDEX: ProgramWord = 0;
const I2C_SHARED_ANCHOR: &str = "__i2c_map_last__";

const MAX_TOKENS: usize = 6;
const NAME_CAP: usize = 32;

/// An assembly failure, with the 1-based source line when known.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblerError {
    #[error("{0}")]
    Kind(AssemblerErrorKind),
    #[error("line {line}: {kind}")]
    WithLine {
        line: u32,
        kind: AssemblerErrorKind,
    },
}

impl AssemblerError {
    pub fn kind(&self) -> &AssemblerErrorKind {
        match self {
            AssemblerError::Kind(kind) => kind,
            AssemblerError::WithLine { kind, .. } => kind,
        }
    }

    fn with_line(self, line: u32) -> AssemblerError {
        match self {
            AssemblerError::Kind(kind) => AssemblerError::WithLine { line, kind },
            with_line @ AssemblerError::WithLine { .. } => with_line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblerErrorKind {
    #[error("invalid directive")]
    InvalidDirective,
    #[error("unknown mnemonic")]
    UnknownMnemonic,
    #[error("too many tokens on one line")]
    TooManyTokens,
    #[error("name is too long")]
    NameTooLong,
    #[error("number is invalid or out of range")]
    NumericOutOfRange,
    #[error("missing operand")]
    MissingOperand,
    #[error("instruction takes no operand")]
    UnexpectedOperand,
    #[error("instruction outside a function block")]
    InstructionOutsideFunction,
    #[error("data word outside a data block")]
    DataWordOutsideDataBlock,
    #[error(".shared must precede the first .machine")]
    SharedAfterMachine,
    #[error("directive not valid in this block")]
    UnexpectedDirective,
    #[error("a block was left unclosed")]
    UnclosedBlock,
    #[error("duplicate label")]
    DuplicateLabel,
    #[error("duplicate name")]
    DuplicateName,
    #[error("unknown label")]
    UnknownLabel,
    #[error("local is not declared")]
    UndeclaredLocal,
    #[error("shared global is not declared")]
    UndeclaredShared,
    #[error("frame slot is not declared")]
    UndeclaredFrameSlot,
    #[error("local index out of the declared locals range")]
    LocalIndexOutOfRange,
    #[error("shared global index out of the declared range")]
    SharedIndexOutOfRange,
    #[error("function body already defined for this declaration")]
    DuplicateBodyForDecl,
    #[error("declared function has no body")]
    MissingBodyForDecl,
    #[error("function index out of the declared range")]
    FunctionIndexOutOfRange,
    #[error("function index assigned twice")]
    DuplicateFunctionIndex,
    #[error("{0}")]
    Emit(GraphError),
}

impl From<AssemblerErrorKind> for AssemblerError {
    fn from(kind: AssemblerErrorKind) -> Self {
        AssemblerError::Kind(kind)
    }
}

/// Assembles a complete source file into a program image.
pub fn assemble_source(source: &str) -> Result<Vec<ProgramWord>, AssemblerError> {
    let graph = assemble_graph(source)?;
    graph
        .emit()
        .map_err(|err| AssemblerError::Kind(AssemblerErrorKind::Emit(err)))
}

/// Assembles a source file into its program graph.
pub fn assemble_graph(source: &str) -> Result<ProgramGraph, AssemblerError> {
    let source = inject_init_program(source)?;
    let shared_count = count_shared_functions(&source)?;
    let mut assembler = Assembler::new(shared_count);
    for line in source.lines() {
        assembler.add_line(line)?;
    }
    assembler.finish()
}

#[derive(Clone)]
struct Label {
    name: String,
    offset: ProgramWord,
}

struct Fixup {
    name: String,
    at: usize,
}

struct FuncEntry {
    name: String,
    index: ProgramWord,
    defined: bool,
}

#[derive(Clone)]
struct StaticLabel {
    id: StaticId,
    offset: ProgramWord,
    /// Program-scoped labels survive across `.machine` blocks.
    persistent: bool,
}

enum BlockKind {
    None,
    Machine,
    Function,
    Data,
    SharedFunction,
    SharedData,
}

enum Operand {
    Literal(ProgramWord),
    Label(String),
    Static(StaticId, ProgramWord),
}

/// Line-by-line assembler state machine.
pub struct Assembler {
    graph: ProgramGraphBuilder,
    block: BlockKind,
    machines_seen: bool,
    data_opened_in_machine: bool,
    line_number: u32,

    // Top scope
    shared_globals: Vec<Label>,
    shared_globals_size: ProgramWord,
    shared_funcs: Vec<FuncEntry>,
    next_shared_index: ProgramWord,
    shared_function_count: ProgramWord,
    static_labels: Vec<(String, StaticLabel)>,

    // Machine scope
    locals: Vec<Label>,
    locals_size: ProgramWord,
    function_count: ProgramWord,
    next_function_index: ProgramWord,
    funcs: Vec<FuncEntry>,
    machine_statics: Vec<StaticId>,
    machine_functions: Vec<FunctionRef>,

    // Function scope
    frame_slots: Vec<Label>,
    labels: Vec<Label>,
    fixups: Vec<Fixup>,
    words: Vec<WordRef>,
    cursor: ProgramWord,
    current_index: ProgramWord,

    // Data scope
    data: Vec<ProgramWord>,
}

impl Assembler {
    pub fn new(shared_function_count: ProgramWord) -> Self {
        Self {
            graph: ProgramGraphBuilder::new(shared_function_count),
            block: BlockKind::None,
            machines_seen: false,
            data_opened_in_machine: false,
            line_number: 0,
            shared_globals: Vec::new(),
            shared_globals_size: 0,
            shared_funcs: Vec::new(),
            next_shared_index: 0,
            shared_function_count,
            static_labels: Vec::new(),
            locals: Vec::new(),
            locals_size: 0,
            function_count: 0,
            next_function_index: 0,
            funcs: Vec::new(),
            machine_statics: Vec::new(),
            machine_functions: Vec::new(),
            frame_slots: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            words: Vec::new(),
            cursor: 0,
            current_index: 0,
            data: Vec::new(),
        }
    }

    pub fn add_line(&mut self, line: &str) -> Result<(), AssemblerError> {
        self.line_number += 1;
        let line_number = self.line_number;
        self.dispatch_line(line)
            .map_err(|err| err.with_line(line_number))
    }

    pub fn finish(mut self) -> Result<ProgramGraph, AssemblerError> {
        if !matches!(self.block, BlockKind::None) {
            return Err(AssemblerErrorKind::UnclosedBlock.into());
        }
        for entry in &self.shared_funcs {
            if !entry.defined {
                return Err(AssemblerErrorKind::MissingBodyForDecl.into());
            }
        }
        self.graph.set_shared_globals_size(self.shared_globals_size);
        Ok(self.graph.finish())
    }

    fn dispatch_line(&mut self, line: &str) -> Result<(), AssemblerError> {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            return Ok(());
        }

        let mut tokens: Vec<&str> = Vec::new();
        for token in line.split_whitespace() {
            if tokens.len() >= MAX_TOKENS {
                return Err(AssemblerErrorKind::TooManyTokens.into());
            }
            tokens.push(token);
        }

        let first = tokens[0];

        if tokens.len() == 1 && first.len() > 1 && first.ends_with(':') {
            return self.add_label(first);
        }

        if matches!(self.block, BlockKind::Data | BlockKind::SharedData) && first != ".end" {
            return self.data_line(&tokens);
        }

        if first.starts_with('.') {
            return self.directive(&tokens);
        }

        self.instruction(&tokens)
    }

    // ==================== Directives ====================

    fn directive(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        match tokens[0] {
            ".machine" => self.start_machine(tokens),
            ".func" => self.start_function(tokens),
            ".func_decl" => self.declare_function(tokens),
            ".shared_func" => self.start_shared_function(tokens),
            ".shared_func_decl" => self.declare_shared_function(tokens),
            ".local" => self.declare_local(tokens),
            ".shared" => self.declare_shared(tokens),
            ".frame" => self.declare_frame_slot(tokens),
            ".data" => self.start_data(tokens),
            ".shared_data" => self.start_shared_data(tokens),
            ".word" => Err(AssemblerErrorKind::DataWordOutsideDataBlock.into()),
            ".end" => self.end_block(),
            _ => Err(AssemblerErrorKind::InvalidDirective.into()),
        }
    }

    fn start_machine(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::None) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        // `.machine <name> locals <N> functions <M>`; `globals` is a
        // deprecated alias for `locals`.
        if tokens.len() != 6
            || !matches!(tokens[2], "locals" | "globals")
            || tokens[4] != "functions"
        {
            return Err(AssemblerErrorKind::InvalidDirective.into());
        }
        to_name(tokens[1])?;
        let locals_size = parse_word(tokens[3])?;
        let function_count = parse_word(tokens[5])?;

        self.machines_seen = true;
        self.locals.clear();
        self.locals_size = locals_size;
        self.function_count = function_count;
        self.next_function_index = 0;
        self.funcs.clear();
        self.machine_statics.clear();
        self.machine_functions.clear();
        self.static_labels.retain(|(_, label)| label.persistent);
        self.block = BlockKind::Machine;
        Ok(())
    }

    fn start_function(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::Machine) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        let (name, explicit) = parse_func_header(tokens)?;
        let index = match explicit {
            Some(index) => index,
            None => match self.funcs.iter().find(|entry| entry.name == name) {
                Some(entry) => entry.index,
                None => next_free_index(&self.funcs, &mut self.next_function_index)?,
            },
        };
        if index >= self.function_count {
            return Err(AssemblerErrorKind::FunctionIndexOutOfRange.into());
        }
        mark_defined(&mut self.funcs, &name, index)?;

        self.labels.clear();
        self.fixups.clear();
        self.frame_slots.clear();
        self.words.clear();
        self.cursor = 0;
        self.current_index = index;
        self.block = BlockKind::Function;
        Ok(())
    }

    fn start_shared_function(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::None) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        let (name, explicit) = parse_func_header(tokens)?;
        let index = match explicit {
            Some(index) => index,
            None => match self.shared_funcs.iter().find(|entry| entry.name == name) {
                Some(entry) => entry.index,
                None => next_free_index(&self.shared_funcs, &mut self.next_shared_index)?,
            },
        };
        if index >= self.shared_function_count {
            return Err(AssemblerErrorKind::FunctionIndexOutOfRange.into());
        }
        mark_defined(&mut self.shared_funcs, &name, index)?;

        self.labels.clear();
        self.fixups.clear();
        self.frame_slots.clear();
        self.words.clear();
        self.cursor = 0;
        self.current_index = index;
        self.block = BlockKind::SharedFunction;
        Ok(())
    }

    fn declare_function(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::Machine) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        let (name, explicit) = parse_func_header(tokens)?;
        let index = match explicit {
            Some(index) => index,
            None => next_free_index(&self.funcs, &mut self.next_function_index)?,
        };
        if index >= self.function_count {
            return Err(AssemblerErrorKind::FunctionIndexOutOfRange.into());
        }
        declare(&mut self.funcs, name, index)
    }

    fn declare_shared_function(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::None) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        let (name, explicit) = parse_func_header(tokens)?;
        let index = match explicit {
            Some(index) => index,
            None => next_free_index(&self.shared_funcs, &mut self.next_shared_index)?,
        };
        if index >= self.shared_function_count {
            return Err(AssemblerErrorKind::FunctionIndexOutOfRange.into());
        }
        declare(&mut self.shared_funcs, name, index)
    }

    fn declare_local(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::Machine) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        if tokens.len() != 3 {
            return Err(AssemblerErrorKind::InvalidDirective.into());
        }
        let name = to_name(tokens[1])?;
        if self.locals.iter().any(|label| label.name == name) {
            return Err(AssemblerErrorKind::DuplicateName.into());
        }
        let index = parse_word(tokens[2])?;
        if index >= self.locals_size {
            return Err(AssemblerErrorKind::LocalIndexOutOfRange.into());
        }
        self.locals.push(Label {
            name,
            offset: index,
        });
        Ok(())
    }

    fn declare_shared(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if self.machines_seen {
            return Err(AssemblerErrorKind::SharedAfterMachine.into());
        }
        if !matches!(self.block, BlockKind::None) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        if tokens.len() != 3 {
            return Err(AssemblerErrorKind::InvalidDirective.into());
        }
        let name = to_name(tokens[1])?;
        if self.shared_globals.iter().any(|label| label.name == name) {
            return Err(AssemblerErrorKind::DuplicateName.into());
        }
        let index = parse_word(tokens[2])?;
        let size = index
            .checked_add(1)
            .ok_or(AssemblerErrorKind::NumericOutOfRange)?;
        self.shared_globals_size = self.shared_globals_size.max(size);
        self.shared_globals.push(Label {
            name,
            offset: index,
        });
        Ok(())
    }

    fn declare_frame_slot(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::Function | BlockKind::SharedFunction) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        if tokens.len() != 3 {
            return Err(AssemblerErrorKind::InvalidDirective.into());
        }
        let name = to_name(tokens[1])?;
        if self.frame_slots.iter().any(|label| label.name == name) {
            return Err(AssemblerErrorKind::DuplicateName.into());
        }
        let offset = parse_word(tokens[2])?;
        self.frame_slots.push(Label { name, offset });
        Ok(())
    }

    fn start_data(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        let in_machine = match self.block {
            BlockKind::Machine => true,
            BlockKind::None => false,
            _ => return Err(AssemblerErrorKind::UnexpectedDirective.into()),
        };
        if tokens.len() != 2 {
            return Err(AssemblerErrorKind::InvalidDirective.into());
        }
        to_name(tokens[1])?;
        self.labels.clear();
        self.data.clear();
        self.cursor = 0;
        self.data_opened_in_machine = in_machine;
        self.block = BlockKind::Data;
        Ok(())
    }

    fn start_shared_data(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::None) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        if tokens.len() != 2 {
            return Err(AssemblerErrorKind::InvalidDirective.into());
        }
        to_name(tokens[1])?;
        self.labels.clear();
        self.data.clear();
        self.cursor = 0;
        self.block = BlockKind::SharedData;
        Ok(())
    }

    fn end_block(&mut self) -> Result<(), AssemblerError> {
        match self.block {
            BlockKind::Function => {
                self.resolve_fixups()?;
                let function_id = self.graph.add_function(std::mem::take(&mut self.words));
                self.machine_functions.push(FunctionRef {
                    index: self.current_index,
                    function_id,
                });
                self.block = BlockKind::Machine;
                Ok(())
            }
            BlockKind::SharedFunction => {
                self.resolve_fixups()?;
                let words = std::mem::take(&mut self.words);
                self.graph
                    .add_shared_function(self.current_index, words)
                    .map_err(|err| AssemblerError::Kind(AssemblerErrorKind::Emit(err)))?;
                self.block = BlockKind::None;
                Ok(())
            }
            BlockKind::Data | BlockKind::SharedData => {
                let persistent = matches!(self.block, BlockKind::SharedData)
                    || !self.data_opened_in_machine;
                let static_id = self.graph.add_static(&self.data);
                for label in &self.labels {
                    if self.static_labels.iter().any(|(name, _)| *name == label.name) {
                        return Err(AssemblerErrorKind::DuplicateLabel.into());
                    }
                    self.static_labels.push((
                        label.name.clone(),
                        StaticLabel {
                            id: static_id,
                            offset: label.offset,
                            persistent,
                        },
                    ));
                }
                if self.data_opened_in_machine {
                    self.machine_statics.push(static_id);
                    self.block = BlockKind::Machine;
                } else {
                    self.block = BlockKind::None;
                }
                self.data.clear();
                self.labels.clear();
                self.data_opened_in_machine = false;
                Ok(())
            }
            BlockKind::Machine => {
                for entry in &self.funcs {
                    if !entry.defined {
                        return Err(AssemblerErrorKind::MissingBodyForDecl.into());
                    }
                }
                let type_id = self.graph.add_type(
                    std::mem::take(&mut self.machine_functions),
                    std::mem::take(&mut self.machine_statics),
                    self.locals_size,
                    self.function_count,
                );
                self.graph.add_instance(type_id);
                self.block = BlockKind::None;
                Ok(())
            }
            BlockKind::None => Err(AssemblerErrorKind::UnexpectedDirective.into()),
        }
    }

    // ==================== Data and labels ====================

    fn data_line(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        let value = if tokens.len() == 2 && tokens[0] == ".word" {
            parse_word(tokens[1])?
        } else if tokens.len() == 1 {
            parse_word(tokens[0])?
        } else {
            return Err(AssemblerErrorKind::InvalidDirective.into());
        };
        self.data.push(value);
        self.cursor += 1;
        Ok(())
    }

    fn add_label(&mut self, token: &str) -> Result<(), AssemblerError> {
        if !matches!(
            self.block,
            BlockKind::Function | BlockKind::SharedFunction | BlockKind::Data | BlockKind::SharedData
        ) {
            return Err(AssemblerErrorKind::UnexpectedDirective.into());
        }
        let name = to_name(token.trim_end_matches(':'))?;
        if self.labels.iter().any(|label| label.name == name) {
            return Err(AssemblerErrorKind::DuplicateLabel.into());
        }
        self.labels.push(Label {
            name,
            offset: self.cursor,
        });
        Ok(())
    }

    // ==================== Instructions ====================

    fn instruction(&mut self, tokens: &[&str]) -> Result<(), AssemblerError> {
        if !matches!(self.block, BlockKind::Function | BlockKind::SharedFunction) {
            return Err(AssemblerErrorKind::InstructionOutsideFunction.into());
        }
        let op = Op::from_mnemonic(tokens[0]).ok_or(AssemblerErrorKind::UnknownMnemonic)?;

        match op.operand_kind() {
            OperandKind::None => {
                if tokens.len() != 1 {
                    return Err(AssemblerErrorKind::UnexpectedOperand.into());
                }
                self.emit_op(op);
                Ok(())
            }
            OperandKind::Inline => {
                if tokens.len() != 2 {
                    return Err(if tokens.len() < 2 {
                        AssemblerErrorKind::MissingOperand.into()
                    } else {
                        AssemblerErrorKind::TooManyTokens.into()
                    });
                }
                let operand = self.inline_operand(op, tokens[1])?;
                self.emit_op(op);
                self.emit_operand(operand);
                Ok(())
            }
            OperandKind::StackArg => match tokens.len() {
                1 => {
                    self.emit_op(op);
                    Ok(())
                }
                2 => {
                    let operand = self.stack_arg_operand(op, tokens[1])?;
                    self.emit_op(Op::Push);
                    self.emit_operand(operand);
                    self.emit_op(op);
                    Ok(())
                }
                _ => Err(AssemblerErrorKind::TooManyTokens.into()),
            },
        }
    }

    fn emit_op(&mut self, op: Op) {
        self.words.push(WordRef::Literal(op.into()));
        self.cursor += 1;
    }

    fn emit_operand(&mut self, operand: Operand) {
        match operand {
            Operand::Literal(value) => self.words.push(WordRef::Literal(value)),
            Operand::Static(id, offset) => self.words.push(WordRef::Static(id, offset)),
            Operand::Label(name) => {
                self.fixups.push(Fixup {
                    name,
                    at: self.words.len(),
                });
                self.words.push(WordRef::LabelOffset(0));
            }
        }
        self.cursor += 1;
    }

    /// Resolves the operand of an inline-operand instruction.
    fn inline_operand(&mut self, op: Op, token: &str) -> Result<Operand, AssemblerError> {
        match op {
            Op::LocalLoad | Op::LocalStore => self.local_operand(token),
            Op::GlobalLoad | Op::GlobalStore => self.shared_global_operand(token),
            Op::StackLoad | Op::StackStore => self.frame_operand(token),
            Op::Return => Ok(Operand::Literal(parse_word(token)?)),
            _ => self.general_operand(token),
        }
    }

    /// Resolves the optional operand of a stack-argument instruction.
    fn stack_arg_operand(&mut self, op: Op, token: &str) -> Result<Operand, AssemblerError> {
        match op {
            Op::Call => {
                if let Some(value) = try_parse_word(token)? {
                    return Ok(Operand::Literal(value));
                }
                let name = to_name(token)?;
                self.funcs
                    .iter()
                    .find(|entry| entry.name == name)
                    .map(|entry| Operand::Literal(entry.index))
                    .ok_or_else(|| AssemblerErrorKind::UnknownLabel.into())
            }
            Op::CallShared => {
                if let Some(value) = try_parse_word(token)? {
                    return Ok(Operand::Literal(value));
                }
                let name = to_name(token)?;
                self.shared_funcs
                    .iter()
                    .find(|entry| entry.name == name)
                    .map(|entry| Operand::Literal(entry.index))
                    .ok_or_else(|| AssemblerErrorKind::UnknownLabel.into())
            }
            _ => self.general_operand(token),
        }
    }

    /// Numbers, code labels, static labels, named locals and shared globals.
    fn general_operand(&mut self, token: &str) -> Result<Operand, AssemblerError> {
        if let Some(value) = try_parse_word(token)? {
            return Ok(Operand::Literal(value));
        }
        let name = to_name(token)?;
        if let Some(label) = self.labels.iter().find(|label| label.name == name) {
            return Ok(Operand::Label(label.name.clone()));
        }
        if let Some((_, label)) = self
            .static_labels
            .iter()
            .find(|(label_name, _)| *label_name == name)
        {
            return Ok(Operand::Static(label.id, label.offset));
        }
        if let Some(entry) = self.funcs.iter().find(|entry| entry.name == name) {
            return Ok(Operand::Literal(entry.index));
        }
        if let Some(label) = self.locals.iter().find(|label| label.name == name) {
            return Ok(Operand::Literal(label.offset));
        }
        if let Some(label) = self.shared_globals.iter().find(|label| label.name == name) {
            return Ok(Operand::Literal(label.offset));
        }
        // Possibly a label defined further down the function.
        Ok(Operand::Label(name))
    }

    fn local_operand(&mut self, token: &str) -> Result<Operand, AssemblerError> {
        if let Some(value) = try_parse_word(token)? {
            // Shared functions inherit the caller's mlp, so their local
            // offsets cannot be validated against any one machine.
            if matches!(self.block, BlockKind::Function) && value >= self.locals_size {
                return Err(AssemblerErrorKind::LocalIndexOutOfRange.into());
            }
            return Ok(Operand::Literal(value));
        }
        let name = to_name(token)?;
        self.locals
            .iter()
            .find(|label| label.name == name)
            .map(|label| Operand::Literal(label.offset))
            .ok_or_else(|| AssemblerErrorKind::UndeclaredLocal.into())
    }

    fn shared_global_operand(&mut self, token: &str) -> Result<Operand, AssemblerError> {
        if let Some(value) = try_parse_word(token)? {
            if value >= self.shared_globals_size {
                return Err(AssemblerErrorKind::SharedIndexOutOfRange.into());
            }
            return Ok(Operand::Literal(value));
        }
        let name = to_name(token)?;
        self.shared_globals
            .iter()
            .find(|label| label.name == name)
            .map(|label| Operand::Literal(label.offset))
            .ok_or_else(|| AssemblerErrorKind::UndeclaredShared.into())
    }

    fn frame_operand(&mut self, token: &str) -> Result<Operand, AssemblerError> {
        if let Some(value) = try_parse_word(token)? {
            return Ok(Operand::Literal(value));
        }
        let name = to_name(token)?;
        self.frame_slots
            .iter()
            .find(|label| label.name == name)
            .map(|label| Operand::Literal(label.offset))
            .ok_or_else(|| AssemblerErrorKind::UndeclaredFrameSlot.into())
    }

    fn resolve_fixups(&mut self) -> Result<(), AssemblerError> {
        while let Some(fixup) = self.fixups.pop() {
            let label = self
                .labels
                .iter()
                .find(|label| label.name == fixup.name)
                .ok_or(AssemblerErrorKind::UnknownLabel)?;
            self.words[fixup.at] = WordRef::LabelOffset(label.offset);
        }
        Ok(())
    }
}

// ==================== Token helpers ====================

fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or(line)
}

fn parse_word(token: &str) -> Result<ProgramWord, AssemblerError> {
    try_parse_word(token)?.ok_or_else(|| AssemblerErrorKind::NumericOutOfRange.into())
}

/// Parses a numeric token; `Ok(None)` when the token is a name. A token
/// that starts like a number but does not parse is an error, never a name.
fn try_parse_word(token: &str) -> Result<Option<ProgramWord>, AssemblerError> {
    if let Some(hex) = token.strip_prefix("0x") {
        let value = ProgramWord::from_str_radix(hex, 16)
            .map_err(|_| AssemblerErrorKind::NumericOutOfRange)?;
        return Ok(Some(value));
    }
    if token.starts_with(|c: char| c.is_ascii_digit()) {
        let value = token
            .parse::<ProgramWord>()
            .map_err(|_| AssemblerErrorKind::NumericOutOfRange)?;
        return Ok(Some(value));
    }
    Ok(None)
}

fn to_name(token: &str) -> Result<String, AssemblerError> {
    if token.len() > NAME_CAP || token.is_empty() {
        return Err(AssemblerErrorKind::NameTooLong.into());
    }
    Ok(token.to_string())
}

/// Parses `.func <name>` / `.func <name> index <I>` headers.
fn parse_func_header(tokens: &[&str]) -> Result<(String, Option<ProgramWord>), AssemblerError> {
    match tokens.len() {
        2 => Ok((to_name(tokens[1])?, None)),
        4 if tokens[2] == "index" => Ok((to_name(tokens[1])?, Some(parse_word(tokens[3])?))),
        _ => Err(AssemblerErrorKind::InvalidDirective.into()),
    }
}

fn next_free_index(
    entries: &[FuncEntry],
    next: &mut ProgramWord,
) -> Result<ProgramWord, AssemblerError> {
    while entries.iter().any(|entry| entry.index == *next) {
        *next = next
            .checked_add(1)
            .ok_or(AssemblerErrorKind::FunctionIndexOutOfRange)?;
    }
    let index = *next;
    *next = next
        .checked_add(1)
        .ok_or(AssemblerErrorKind::FunctionIndexOutOfRange)?;
    Ok(index)
}

fn declare(
    entries: &mut Vec<FuncEntry>,
    name: String,
    index: ProgramWord,
) -> Result<(), AssemblerError> {
    if entries.iter().any(|entry| entry.name == name) {
        return Err(AssemblerErrorKind::DuplicateName.into());
    }
    if entries.iter().any(|entry| entry.index == index) {
        return Err(AssemblerErrorKind::DuplicateFunctionIndex.into());
    }
    entries.push(FuncEntry {
        name,
        index,
        defined: false,
    });
    Ok(())
}

fn mark_defined(
    entries: &mut Vec<FuncEntry>,
    name: &str,
    index: ProgramWord,
) -> Result<(), AssemblerError> {
    if let Some(entry) = entries.iter_mut().find(|entry| entry.name == name) {
        if entry.defined {
            return Err(AssemblerErrorKind::DuplicateBodyForDecl.into());
        }
        if entry.index != index {
            return Err(AssemblerErrorKind::DuplicateFunctionIndex.into());
        }
        entry.defined = true;
        return Ok(());
    }
    if entries.iter().any(|entry| entry.index == index) {
        return Err(AssemblerErrorKind::DuplicateFunctionIndex.into());
    }
    entries.push(FuncEntry {
        name: name.to_string(),
        index,
        defined: true,
    });
    Ok(())
}

// ==================== Shared function pre-scan and injection ====================

/// Counts the shared function table size implied by the source: the highest
/// explicit or auto-assigned index plus one, with the reserved routing slots
/// as a floor.
fn count_shared_functions(source: &str) -> Result<ProgramWord, AssemblerError> {
    let mut max_index: ProgramWord = 0;
    let mut next_auto: ProgramWord = 0;
    for line in source.lines() {
        let Some(index) = shared_func_index(line, &mut next_auto)? else {
            continue;
        };
        max_index = max_index.max(index);
    }
    let count = max_index
        .checked_add(1)
        .ok_or(AssemblerErrorKind::NumericOutOfRange)?;
    Ok(count.max(SHARED_FUNCTION_RESERVED_COUNT))
}

/// Returns the index a `.shared_func`/`.shared_func_decl` line occupies, or
/// `None` for other lines.
fn shared_func_index(
    line: &str,
    next_auto: &mut ProgramWord,
) -> Result<Option<ProgramWord>, AssemblerError> {
    let line = strip_comment(line).trim();
    let mut tokens = line.split_whitespace();
    if !matches!(tokens.next(), Some(".shared_func") | Some(".shared_func_decl")) {
        return Ok(None);
    }
    let _ = tokens.next(); // name
    if tokens.next() == Some("index") {
        let token = tokens
            .next()
            .ok_or(AssemblerErrorKind::InvalidDirective)?;
        return Ok(Some(parse_word(token)?));
    }
    let index = *next_auto;
    *next_auto += 1;
    Ok(Some(index))
}

/// True when the source assigns shared function index 0 itself.
fn defines_shared_index_zero(source: &str) -> Result<bool, AssemblerError> {
    let mut next_auto: ProgramWord = 0;
    for line in source.lines() {
        if shared_func_index(line, &mut next_auto)? == Some(0) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Prepends the default `init_program` shared function when the source does
/// not define shared index 0: a generated data block of I2C routing defaults
/// plus the loop that seeds the routing globals from it.
fn inject_init_program(source: &str) -> Result<String, AssemblerError> {
    if defines_shared_index_zero(source)? {
        return Ok(source.to_string());
    }

    let mut prelude = String::new();
    prelude.push_str(&format!(
        ".shared {} {}\n",
        I2C_SHARED_ANCHOR,
        I2C_ROUTING_GLOBALS - 1
    ));
    prelude.push_str(&format!(".shared_data {}\n", I2C_DEFAULTS_BLOCK));
    for index in 0..I2C_ROUTING_GLOBALS {
        prelude.push_str(&format!("{}{}:\n", I2C_DEFAULT_LABEL_PREFIX, index));
        prelude.push_str(".word 0\n");
    }
    prelude.push_str(".end\n");
    prelude.push_str(&format!(
        ".shared_func {} index {}\n",
        INIT_PROGRAM_NAME, INIT_PROGRAM_INDEX
    ));
    for index in 0..I2C_ROUTING_GLOBALS {
        prelude.push_str(&format!(
            "LOAD_STATIC {}{}\n",
            I2C_DEFAULT_LABEL_PREFIX, index
        ));
        prelude.push_str(&format!("GSTORE {}\n", index));
    }
    prelude.push_str("EXIT\n.end\n");
    prelude.push_str(source);
    Ok(prelude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::errors::MachineError;
    use crate::machine::image::ImageReader;
    use crate::machine::vm::Program;

    fn assemble(source: &str) -> Vec<ProgramWord> {
        assemble_source(source).expect("assembly failed")
    }

    fn kind_of(source: &str) -> AssemblerErrorKind {
        assemble_source(source).expect_err("expected error").kind().clone()
    }

    const PULSE: &str = r#"
        ; Triangle-wave pulse over a 2000-tick period.
        .machine pulse locals 6 functions 3
        .local red 0
        .local green 1
        .local blue 2
        .local brightness 3
        .local tick 4
        .local level 5

        .func init index 0
            PUSH 8
            LSTORE red
            PUSH 16
            LSTORE green
            PUSH 32
            LSTORE blue
            PUSH 100
            LSTORE brightness
            EXIT
        .end

        .func start_frame index 1
            LSTORE tick
            EXIT
        .end

        .func get_color index 2
            POP                 ; led index unused
            LLOAD tick
            PUSH 2000
            MOD
            DUP
            PUSH 1000
            SWAP
            BRLT rising
            PUSH 2000
            SWAP
            SUB
        rising:
            LSTORE level
            LLOAD red
            LLOAD level
            MUL
            PUSH 1000
            DIV
            LLOAD brightness
            MUL
            PUSH 100
            DIV
            LLOAD green
            LLOAD level
            MUL
            PUSH 1000
            DIV
            LLOAD brightness
            MUL
            PUSH 100
            DIV
            LLOAD blue
            LLOAD level
            MUL
            PUSH 1000
            DIV
            LLOAD brightness
            MUL
            PUSH 100
            DIV
            EXIT
        .end
        .end
    "#;

    #[test]
    fn pulse_color_scenario() {
        let image = assemble(PULSE);
        let mut memory = [0u32; 128];
        let mut program = Program::new(&image, &mut memory).unwrap();

        program.init(0).unwrap();

        program.start_frame(0, 0).unwrap();
        assert_eq!(program.get_color(0, 0).unwrap(), (0, 0, 0));

        program.start_frame(0, 1000).unwrap();
        let (r, g, b) = program.get_color(0, 0).unwrap();
        assert_eq!((r, g, b), (8, 16, 32));

        program.start_frame(0, 2000).unwrap();
        assert_eq!(program.get_color(0, 0).unwrap(), (0, 0, 0));
    }

    #[test]
    fn identical_machines_share_one_type() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
            EXIT
            .end
            .end

            .machine beta locals 0 functions 1
            .func init index 0
            EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let reader = ImageReader::new(&image).unwrap();
        assert_eq!(reader.instance_count(), 2);
        assert_eq!(reader.type_count(), 1);
        assert_eq!(reader.instance(0).unwrap().type_id, 0);
        assert_eq!(reader.instance(1).unwrap().type_id, 0);
    }

    #[test]
    fn shared_function_reused_across_distinct_types() {
        let source = r#"
            .shared base 0
            .shared_func init_program index 0
                PUSH 42
                GSTORE base
                EXIT
            .end
            .shared_func get_base index 5
                GLOAD base
                RET 1
            .end

            .machine alpha locals 1 functions 1
            .func fetch index 0
                PUSH 0
                CALL_SHARED get_base
                EXIT
            .end
            .end

            .machine beta locals 2 functions 1
            .func fetch index 0
                PUSH 0
                CALL_SHARED get_base
                EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let reader = ImageReader::new(&image).unwrap();
        assert_eq!(reader.type_count(), 2);

        let mut memory = [0u32; 128];
        let mut program = Program::new(&image, &mut memory).unwrap();
        program.call_shared(0, &[]).unwrap();
        // Both instances read the same shared global regardless of mlp.
        assert_eq!(program.call(0, 0, &[]).unwrap(), vec![42]);
        assert_eq!(program.call(1, 0, &[]).unwrap(), vec![42]);
    }

    #[test]
    fn forward_label_references_resolve() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
                JUMP done
                PUSH 1
            done:
                EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let mut memory = [0u32; 64];
        let mut program = Program::new(&image, &mut memory).unwrap();
        assert_eq!(program.call(0, 0, &[]).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn data_labels_resolve_through_load_static() {
        let source = r#"
            .shared_data config
            lead:
            .word 7
            answer:
            .word 42
            .end

            .machine alpha locals 0 functions 1
            .func init index 0
                LOAD_STATIC answer
                EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let mut memory = [0u32; 64];
        let mut program = Program::new(&image, &mut memory).unwrap();
        assert_eq!(program.call(0, 0, &[]).unwrap(), vec![42]);
    }

    #[test]
    fn machine_data_blocks_accept_bare_numbers() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .data table
            first:
            11
            0x10
            .end
            .func init index 0
                LOAD_STATIC first
                EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let mut memory = [0u32; 64];
        let mut program = Program::new(&image, &mut memory).unwrap();
        assert_eq!(program.call(0, 0, &[]).unwrap(), vec![11]);
    }

    #[test]
    fn func_decl_reserves_index_for_forward_call() {
        let source = r#"
            .machine alpha locals 0 functions 4
            .func_decl helper index 3
            .func init index 0
                PUSH 5
                PUSH 1
                CALL helper
                EXIT
            .end
            .func helper
                SLOAD 0
                PUSH 1
                ADD
                RET 1
            .end
            .end
        "#;
        let image = assemble(source);
        let mut memory = [0u32; 64];
        let mut program = Program::new(&image, &mut memory).unwrap();
        assert_eq!(program.call(0, 0, &[]).unwrap(), vec![6]);
    }

    #[test]
    fn injected_init_program_seeds_routing_globals() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
            EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let reader = ImageReader::new(&image).unwrap();
        assert_eq!(reader.shared_function_count(), SHARED_FUNCTION_RESERVED_COUNT);
        assert_eq!(reader.globals_size(), I2C_ROUTING_GLOBALS);

        let mut memory = [0u32; 64];
        let mut program = Program::new(&image, &mut memory).unwrap();
        assert_eq!(program.call_shared(0, &[]).unwrap(), Vec::new());
    }

    #[test]
    fn user_init_program_suppresses_injection() {
        let source = r#"
            .shared_func init_program index 0
            EXIT
            .end
            .machine alpha locals 0 functions 1
            .func init index 0
            EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let reader = ImageReader::new(&image).unwrap();
        assert_eq!(reader.globals_size(), 0);
    }

    #[test]
    fn named_frame_slots_resolve_for_sload() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
            .frame arg 0
                SLOAD arg
                ADD
                EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let mut memory = [0u32; 64];
        let mut program = Program::new(&image, &mut memory).unwrap();
        assert_eq!(program.call(0, 0, &[5]).unwrap(), vec![10]);
    }

    #[test]
    fn mnemonics_are_case_insensitive() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
                push 3
                Push 4
                ADD
                exit
            .end
            .end
        "#;
        let image = assemble(source);
        let mut memory = [0u32; 64];
        let mut program = Program::new(&image, &mut memory).unwrap();
        assert_eq!(program.call(0, 0, &[]).unwrap(), vec![7]);
    }

    #[test]
    fn assembling_twice_is_deterministic() {
        assert_eq!(assemble(PULSE), assemble(PULSE));
    }

    // ==================== Errors ====================

    #[test]
    fn duplicate_body_for_decl() {
        let source = r#"
            .machine alpha locals 0 functions 2
            .func init index 0
            EXIT
            .end
            .func init
            EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::DuplicateBodyForDecl);
    }

    #[test]
    fn unknown_label() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
                JUMP nowhere
                EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::UnknownLabel);
    }

    #[test]
    fn undeclared_local() {
        let source = r#"
            .machine alpha locals 1 functions 1
            .func init index 0
                LLOAD missing
                EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::UndeclaredLocal);
    }

    #[test]
    fn undeclared_shared() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
                GLOAD missing
                EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::UndeclaredShared);
    }

    #[test]
    fn undeclared_frame_slot() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
                SLOAD missing
                EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::UndeclaredFrameSlot);
    }

    #[test]
    fn unclosed_block() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
            EXIT
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::UnclosedBlock);
    }

    #[test]
    fn numeric_out_of_range() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
                PUSH 70000
                EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::NumericOutOfRange);
    }

    #[test]
    fn instruction_outside_function() {
        let source = r#"
            .machine alpha locals 0 functions 1
            PUSH 1
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::InstructionOutsideFunction);
    }

    #[test]
    fn data_word_outside_data_block() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .word 5
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::DataWordOutsideDataBlock);
    }

    #[test]
    fn shared_after_machine() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
            EXIT
            .end
            .end
            .shared late 0
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::SharedAfterMachine);
    }

    #[test]
    fn missing_body_for_decl() {
        let source = r#"
            .machine alpha locals 0 functions 2
            .func_decl helper index 1
            .func init index 0
            EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::MissingBodyForDecl);
    }

    #[test]
    fn function_index_out_of_declared_range() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func extra index 1
            EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::FunctionIndexOutOfRange);
    }

    #[test]
    fn local_index_out_of_range() {
        let source = r#"
            .machine alpha locals 2 functions 1
            .func init index 0
                LLOAD 2
                EXIT
            .end
            .end
        "#;
        assert_eq!(kind_of(source), AssemblerErrorKind::LocalIndexOutOfRange);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let source = ".machine alpha locals 0 functions 1\n.func init index 0\nBOGUS\n";
        let err = assemble_source(source).expect_err("expected error");
        match err {
            AssemblerError::WithLine { ref kind, .. } => {
                assert_eq!(*kind, AssemblerErrorKind::UnknownMnemonic);
            }
            other => panic!("expected line info, got {other:?}"),
        }
        assert!(err.to_string().starts_with("line "));
    }

    #[test]
    fn divide_fault_surfaces_from_assembled_code() {
        let source = r#"
            .machine alpha locals 0 functions 1
            .func init index 0
                PUSH 1
                PUSH 0
                DIV
                EXIT
            .end
            .end
        "#;
        let image = assemble(source);
        let mut memory = [0u32; 64];
        let mut program = Program::new(&image, &mut memory).unwrap();
        assert!(matches!(
            program.call(0, 0, &[]),
            Err(MachineError::DivisionByZero)
        ));
    }
}
