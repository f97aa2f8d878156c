//! Core virtual machine implementation.
//!
//! The light machine is a stack machine over a read-only program image and a
//! single mutable memory buffer. The buffer is partitioned at construction
//! into globals `[0, GLOBALS_SIZE)` and the stack above them. Two pointers
//! thread through execution: the frame pointer `fp` indexes the first
//! argument of the current call, and the machine-locals pointer `mlp` indexes
//! the current instance's private globals.
//!
//! All arithmetic on stack values wraps modulo 2^32. Every memory access is
//! bounds-checked and fails with a named error; a failed run leaves the
//! machine ready to accept the next one, but the host must discard the failed
//! run's output.

use crate::machine::errors::MachineError;
use crate::machine::image::ImageReader;
use crate::machine::isa::Op;
use crate::types::words::{stack_to_program_word, stack_to_usize, ProgramWord, StackWord};

/// Host function index convention: `init` is function 0.
pub const INIT_FUNCTION: usize = 0;
/// `start_frame(tick)` is function 1.
pub const START_FRAME_FUNCTION: usize = 1;
/// `get_color(index)` is function 2.
pub const GET_COLOR_FUNCTION: usize = 2;

/// Shared function index of `init_program`.
pub const INIT_PROGRAM_SHARED_FUNCTION: usize = 0;
/// Shared function index of `get_routes`: returns the flat route list
/// `entry_count, (bus_id, address, target_count, (machine, function)*)*`.
pub const GET_ROUTES_SHARED_FUNCTION: usize = 1;
/// Shared function index of `add_route(bus_id, address, machine, function)`.
pub const ADD_ROUTE_SHARED_FUNCTION: usize = 2;
/// Shared function index of `remove_route`, same argument shape as add.
pub const REMOVE_ROUTE_SHARED_FUNCTION: usize = 3;

/// Minimum stack region required beyond the globals partition.
pub const MIN_STACK: usize = 16;

/// Instruction budget per `run` invocation. A run that has not reached
/// `EXIT` within this many instructions is aborted with `FuelExhausted`,
/// keeping every host call bounded in time.
pub const FUEL_PER_RUN: u32 = 1 << 20;

/// Words in a call frame header: `[return_pc][saved_fp][saved_mlp]`.
const FRAME_HEADER_LEN: usize = 3;

/// An executable program: a validated image plus the runtime memory buffer.
///
/// Created by the host at load time and dropped on reload. All instances of
/// the program execute through this one value, serially.
pub struct Program<'a, 'b> {
    image: ImageReader<'a>,
    memory: &'b mut [StackWord],
    globals_len: usize,
    stack_len: usize,
    fp: StackWord,
    mlp: StackWord,
}

impl<'a, 'b> Program<'a, 'b> {
    /// Validates the image and partitions the memory buffer.
    pub fn new(
        image: &'a [ProgramWord],
        memory: &'b mut [StackWord],
    ) -> Result<Self, MachineError> {
        let image = ImageReader::new(image)?;

        let globals_len = image.globals_size() as usize;
        if globals_len > memory.len() {
            return Err(MachineError::GlobalsBufferTooSmall(image.globals_size()));
        }
        if memory.len() - globals_len < MIN_STACK {
            return Err(MachineError::MemoryBufferTooSmall);
        }

        Ok(Self {
            image,
            memory,
            globals_len,
            stack_len: 0,
            fp: 0,
            mlp: 0,
        })
    }

    /// Number of machine instances in the loaded program.
    pub fn machine_count(&self) -> ProgramWord {
        self.image.instance_count()
    }

    /// Runs function 0 of the given machine with an empty stack.
    ///
    /// The stack must be empty again on `EXIT`; leftover values are a
    /// protocol violation surfaced as `ResidualStackValues`.
    pub fn init(&mut self, machine: ProgramWord) -> Result<(), MachineError> {
        let entry = self.image.function_entry(machine, INIT_FUNCTION)?;
        self.enter(machine)?;
        self.run(machine, entry)?;
        if self.stack_len != 0 {
            return Err(MachineError::ResidualStackValues(self.stack_len));
        }
        Ok(())
    }

    /// Runs function 1 of the given machine with the frame tick as argument.
    pub fn start_frame(&mut self, machine: ProgramWord, tick: StackWord) -> Result<(), MachineError> {
        let entry = self.image.function_entry(machine, START_FRAME_FUNCTION)?;
        self.enter(machine)?;
        self.push(tick)?;
        self.run(machine, entry)
    }

    /// Runs function 2 of the given machine and decodes the `(r, g, b)` result.
    ///
    /// On `EXIT` the stack must hold exactly three values, top-to-bottom
    /// blue, green, red, each at most 255.
    pub fn get_color(
        &mut self,
        machine: ProgramWord,
        led_index: u16,
    ) -> Result<(u8, u8, u8), MachineError> {
        let entry = self.image.function_entry(machine, GET_COLOR_FUNCTION)?;
        self.enter(machine)?;
        self.push(StackWord::from(led_index))?;
        self.run(machine, entry)?;

        if self.stack_len > 3 {
            return Err(MachineError::ResidualStackValues(self.stack_len));
        }
        let blue = self.pop()?;
        let green = self.pop()?;
        let red = self.pop()?;

        Ok((
            word_to_color(red)?,
            word_to_color(green)?,
            word_to_color(blue)?,
        ))
    }

    /// Runs an arbitrary function of the given machine.
    ///
    /// Arguments are pushed in order; whatever the function leaves on the
    /// stack at `EXIT` is returned to the caller as the result vector.
    pub fn call(
        &mut self,
        machine: ProgramWord,
        function: usize,
        args: &[StackWord],
    ) -> Result<Vec<StackWord>, MachineError> {
        let entry = self.image.function_entry(machine, function)?;
        self.enter(machine)?;
        for arg in args {
            self.push(*arg)?;
        }
        self.run(machine, entry)?;
        Ok(self.drain_stack())
    }

    /// Runs a shared function as if machine 0 were the caller.
    ///
    /// Shared routing code keeps its tables in machine 0's locals, so host
    /// originated shared calls borrow that instance's `mlp`. A program with
    /// no instances cannot service the call.
    pub fn call_shared(
        &mut self,
        function: usize,
        args: &[StackWord],
    ) -> Result<Vec<StackWord>, MachineError> {
        let entry = self.image.shared_function_entry(function)?;
        self.enter(0)?;
        for arg in args {
            self.push(*arg)?;
        }
        self.run(0, entry)?;
        Ok(self.drain_stack())
    }

    /// Resets the stack and pointers for a fresh host entry.
    fn enter(&mut self, machine: ProgramWord) -> Result<(), MachineError> {
        let instance = self.image.instance(machine)?;
        self.stack_len = 0;
        self.fp = 0;
        self.mlp = StackWord::from(instance.globals_base);
        Ok(())
    }

    fn drain_stack(&mut self) -> Vec<StackWord> {
        let values = self.memory[self.globals_len..self.globals_len + self.stack_len].to_vec();
        self.stack_len = 0;
        values
    }

    /// The interpreter loop: executes from `entry` until `EXIT`.
    fn run(&mut self, machine: ProgramWord, entry: usize) -> Result<(), MachineError> {
        let mut pc = entry;
        let mut fuel = FUEL_PER_RUN;

        loop {
            if fuel == 0 {
                return Err(MachineError::FuelExhausted);
            }
            fuel -= 1;

            let word = self.image.word(pc)?;
            let op = Op::try_from(word)?;
            pc = next_pc(pc)?;

            match op {
                Op::Pop => {
                    if self.stack_len == 0 {
                        return Err(MachineError::PopOnEmptyStack);
                    }
                    self.stack_len -= 1;
                }
                Op::Push => {
                    let value = self.image.word(pc)?;
                    pc = next_pc(pc)?;
                    self.push(StackWord::from(value))?;
                }
                Op::BranchLessThan => {
                    if let Some(target) = self.branch(|lhs, rhs| lhs < rhs)? {
                        pc = target;
                    }
                }
                Op::BranchLessThanEq => {
                    if let Some(target) = self.branch(|lhs, rhs| lhs <= rhs)? {
                        pc = target;
                    }
                }
                Op::BranchGreaterThan => {
                    if let Some(target) = self.branch(|lhs, rhs| lhs > rhs)? {
                        pc = target;
                    }
                }
                Op::BranchGreaterThanEq => {
                    if let Some(target) = self.branch(|lhs, rhs| lhs >= rhs)? {
                        pc = target;
                    }
                }
                Op::BranchEqual => {
                    if let Some(target) = self.branch(|lhs, rhs| lhs == rhs)? {
                        pc = target;
                    }
                }
                Op::And => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(bool_word(lhs != 0 && rhs != 0))?;
                }
                Op::Or => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(bool_word(lhs != 0 || rhs != 0))?;
                }
                Op::Xor => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(bool_word((lhs != 0) ^ (rhs != 0)))?;
                }
                Op::Not => {
                    let value = self.pop()?;
                    self.push(bool_word(value == 0))?;
                }
                Op::BitwiseAnd => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(lhs & rhs)?;
                }
                Op::BitwiseOr => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(lhs | rhs)?;
                }
                Op::BitwiseXor => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(lhs ^ rhs)?;
                }
                Op::BitwiseNot => {
                    let value = self.pop()?;
                    self.push(!value)?;
                }
                Op::Multiply => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(lhs.wrapping_mul(rhs))?;
                }
                Op::Divide => {
                    let (lhs, rhs) = self.pop2()?;
                    let result = lhs.checked_div(rhs).ok_or(MachineError::DivisionByZero)?;
                    self.push(result)?;
                }
                Op::Mod => {
                    let (lhs, rhs) = self.pop2()?;
                    let result = lhs.checked_rem(rhs).ok_or(MachineError::DivisionByZero)?;
                    self.push(result)?;
                }
                Op::Add => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(lhs.wrapping_add(rhs))?;
                }
                Op::Subtract => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(lhs.wrapping_sub(rhs))?;
                }
                Op::LocalLoad => {
                    let offset = self.image.word(pc)?;
                    pc = next_pc(pc)?;
                    let index = self.local_index(offset)?;
                    let value = self.read_global(index)?;
                    self.push(value)?;
                }
                Op::LocalStore => {
                    let offset = self.image.word(pc)?;
                    pc = next_pc(pc)?;
                    let index = self.local_index(offset)?;
                    let value = self.pop()?;
                    self.write_global(index, value)?;
                }
                Op::GlobalLoad => {
                    let address = self.image.word(pc)?;
                    pc = next_pc(pc)?;
                    let value = self.read_global(address as usize)?;
                    self.push(value)?;
                }
                Op::GlobalStore => {
                    let address = self.image.word(pc)?;
                    pc = next_pc(pc)?;
                    let value = self.pop()?;
                    self.write_global(address as usize, value)?;
                }
                Op::LoadStatic => {
                    let address = stack_to_program_word(self.pop()?)? as usize;
                    let value = self.image.word(address)?;
                    self.push(StackWord::from(value))?;
                }
                Op::Jump => {
                    pc = stack_to_program_word(self.pop()?)? as usize;
                }
                Op::Exit => {
                    return Ok(());
                }
                Op::Call | Op::CallShared => {
                    let function_index = stack_to_usize(self.pop()?)?;
                    let arg_count = stack_to_usize(self.pop()?)?;
                    let arg_start = self
                        .stack_len
                        .checked_sub(arg_count)
                        .ok_or(MachineError::TooFewArguments)?;

                    let entry = if op == Op::Call {
                        self.image.function_entry(machine, function_index)?
                    } else {
                        self.image.shared_function_entry(function_index)?
                    };

                    let return_pc = StackWord::try_from(pc)
                        .map_err(|_| MachineError::OutOfBoundsStaticRead(pc))?;
                    self.push_frame_header(arg_start, return_pc)?;
                    self.fp = StackWord::try_from(arg_start + FRAME_HEADER_LEN)
                        .map_err(|_| MachineError::StackOverflow)?;
                    // mlp is unchanged: CALL stays in the caller's type, and
                    // CALL_SHARED inherits the caller's locals base.
                    pc = entry;
                }
                Op::StackLoad => {
                    let offset = self.image.word(pc)?;
                    pc = next_pc(pc)?;
                    let index = self.frame_index(offset)?;
                    let value = self.stack_get(index)?;
                    self.push(value)?;
                }
                Op::StackStore => {
                    let offset = self.image.word(pc)?;
                    pc = next_pc(pc)?;
                    let index = self.frame_index(offset)?;
                    let value = self.stack_peek()?;
                    self.stack_set(index, value)?;
                    self.stack_len -= 1;
                }
                Op::Dup => {
                    let value = self.stack_peek()?;
                    self.push(value)?;
                }
                Op::Swap => {
                    let (lhs, rhs) = self.pop2()?;
                    self.push(rhs)?;
                    self.push(lhs)?;
                }
                Op::Return => {
                    let count = self.image.word(pc)? as usize;

                    let fp_index = stack_to_usize(self.fp)?;
                    let header = fp_index
                        .checked_sub(FRAME_HEADER_LEN)
                        .ok_or(MachineError::StackUnderflow)?;
                    let return_pc = self.stack_get(header)?;
                    let saved_fp = self.stack_get(header + 1)?;
                    let saved_mlp = self.stack_get(header + 2)?;

                    let values_start = self
                        .stack_len
                        .checked_sub(count)
                        .ok_or(MachineError::StackUnderflow)?;
                    for offset in 0..count {
                        let value = self.stack_get(values_start + offset)?;
                        self.stack_set(header + offset, value)?;
                    }

                    self.stack_len = header + count;
                    self.fp = saved_fp;
                    self.mlp = saved_mlp;
                    pc = stack_to_usize(return_pc)?;
                }
            }
        }
    }

    /// Pops a branch's operands and returns the target when it is taken.
    ///
    /// The target is an image address, so it must fit a program word even
    /// when the branch is not taken.
    fn branch<F>(&mut self, holds: F) -> Result<Option<usize>, MachineError>
    where
        F: Fn(StackWord, StackWord) -> bool,
    {
        let target = stack_to_program_word(self.pop()?)? as usize;
        let lhs = self.pop()?;
        let rhs = self.pop()?;
        Ok(if holds(lhs, rhs) { Some(target) } else { None })
    }

    /// Inserts `[return_pc][saved_fp][saved_mlp]` at `arg_start`, shifting
    /// the arguments above it.
    fn push_frame_header(
        &mut self,
        arg_start: usize,
        return_pc: StackWord,
    ) -> Result<(), MachineError> {
        if self.stack_len + FRAME_HEADER_LEN > self.stack_capacity() {
            return Err(MachineError::StackOverflow);
        }
        let base = self.globals_len;
        self.memory.copy_within(
            base + arg_start..base + self.stack_len,
            base + arg_start + FRAME_HEADER_LEN,
        );
        self.memory[base + arg_start] = return_pc;
        self.memory[base + arg_start + 1] = self.fp;
        self.memory[base + arg_start + 2] = self.mlp;
        self.stack_len += FRAME_HEADER_LEN;
        Ok(())
    }

    fn stack_capacity(&self) -> usize {
        self.memory.len() - self.globals_len
    }

    fn push(&mut self, value: StackWord) -> Result<(), MachineError> {
        if self.stack_len == self.stack_capacity() {
            return Err(MachineError::StackOverflow);
        }
        self.memory[self.globals_len + self.stack_len] = value;
        self.stack_len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<StackWord, MachineError> {
        if self.stack_len == 0 {
            return Err(MachineError::StackUnderflow);
        }
        self.stack_len -= 1;
        Ok(self.memory[self.globals_len + self.stack_len])
    }

    /// Pops the top two values as `(lhs, rhs)`, `rhs` having been on top.
    fn pop2(&mut self) -> Result<(StackWord, StackWord), MachineError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        Ok((lhs, rhs))
    }

    fn stack_peek(&self) -> Result<StackWord, MachineError> {
        if self.stack_len == 0 {
            return Err(MachineError::StackUnderflow);
        }
        Ok(self.memory[self.globals_len + self.stack_len - 1])
    }

    fn stack_get(&self, index: usize) -> Result<StackWord, MachineError> {
        if index >= self.stack_len {
            return Err(MachineError::StackUnderflow);
        }
        Ok(self.memory[self.globals_len + index])
    }

    fn stack_set(&mut self, index: usize, value: StackWord) -> Result<(), MachineError> {
        if index >= self.stack_len {
            return Err(MachineError::StackUnderflow);
        }
        self.memory[self.globals_len + index] = value;
        Ok(())
    }

    fn frame_index(&self, offset: ProgramWord) -> Result<usize, MachineError> {
        let index = self
            .fp
            .checked_add(StackWord::from(offset))
            .ok_or(MachineError::StackUnderflow)?;
        stack_to_usize(index)
    }

    fn local_index(&self, offset: ProgramWord) -> Result<usize, MachineError> {
        let index = self
            .mlp
            .checked_add(StackWord::from(offset))
            .ok_or(MachineError::OutOfBoundsGlobalsAccess(usize::MAX))?;
        stack_to_usize(index)
    }

    fn read_global(&self, index: usize) -> Result<StackWord, MachineError> {
        if index >= self.globals_len {
            return Err(MachineError::OutOfBoundsGlobalsAccess(index));
        }
        Ok(self.memory[index])
    }

    fn write_global(&mut self, index: usize, value: StackWord) -> Result<(), MachineError> {
        if index >= self.globals_len {
            return Err(MachineError::OutOfBoundsGlobalsAccess(index));
        }
        self.memory[index] = value;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pointers(&self) -> (StackWord, StackWord) {
        (self.fp, self.mlp)
    }
}

fn next_pc(pc: usize) -> Result<usize, MachineError> {
    pc.checked_add(1)
        .ok_or(MachineError::OutOfBoundsStaticRead(pc))
}

fn bool_word(value: bool) -> StackWord {
    if value {
        1
    } else {
        0
    }
}

fn word_to_color(word: StackWord) -> Result<u8, MachineError> {
    u8::try_from(word).map_err(|_| MachineError::ColorOutOfRange(word))
}
