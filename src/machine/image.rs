//! Program image layout and the read-only image reader.
//!
//! A program image is a contiguous sequence of [`ProgramWord`] cells:
//!
//! ```text
//! [0] VERSION                 = 2
//! [1] INSTANCE_COUNT
//! [2] GLOBALS_SIZE            (StackWord cells)
//! [3] SHARED_FUNCTION_COUNT
//! [4] TYPE_COUNT
//! [5] INSTANCE_TABLE_OFFSET
//! [6] TYPE_TABLE_OFFSET
//! [7] SHARED_FUNCTION_TABLE_OFFSET
//! ... tables, static data and function bodies ...
//! ```
//!
//! The instance table holds `{TYPE_ID, GLOBALS_BASE}` pairs, the type table
//! `{FUNCTION_COUNT, FUNCTION_TABLE_OFFSET}` pairs, and each function table
//! is a dense array of absolute word offsets to function bodies. The shared
//! function table is a dense array of `SHARED_FUNCTION_COUNT` offsets. All
//! offsets are absolute within the image.

use crate::machine::errors::MachineError;
use crate::types::words::ProgramWord;

/// The only supported image version.
pub const PROGRAM_VERSION: ProgramWord = 2;

pub const VERSION_OFFSET: usize = 0;
pub const INSTANCE_COUNT_OFFSET: usize = VERSION_OFFSET + 1;
pub const GLOBALS_SIZE_OFFSET: usize = INSTANCE_COUNT_OFFSET + 1;
pub const SHARED_FUNCTION_COUNT_OFFSET: usize = GLOBALS_SIZE_OFFSET + 1;
pub const TYPE_COUNT_OFFSET: usize = SHARED_FUNCTION_COUNT_OFFSET + 1;
pub const INSTANCE_TABLE_SLOT: usize = TYPE_COUNT_OFFSET + 1;
pub const TYPE_TABLE_SLOT: usize = INSTANCE_TABLE_SLOT + 1;
pub const SHARED_FUNCTION_TABLE_SLOT: usize = TYPE_TABLE_SLOT + 1;
pub const HEADER_LEN: usize = SHARED_FUNCTION_TABLE_SLOT + 1;

/// Words per instance table entry.
pub const INSTANCE_ENTRY_LEN: usize = 2;
/// Words per type table entry.
pub const TYPE_ENTRY_LEN: usize = 2;

/// One instance table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceEntry {
    /// Index into the type table.
    pub type_id: ProgramWord,
    /// First globals cell owned by this instance (its `mlp` base).
    pub globals_base: ProgramWord,
}

/// One type table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeEntry {
    /// Number of entries in this type's function table.
    pub function_count: ProgramWord,
    /// Absolute word offset of this type's function table.
    pub function_table_offset: ProgramWord,
}

/// Read-only view over a validated program image.
///
/// Construction checks the version word and that every descriptor table lies
/// inside the image, so the accessors only fail on indices that are out of
/// range for the program, never on a malformed header.
#[derive(Clone, Copy)]
pub struct ImageReader<'a> {
    words: &'a [ProgramWord],
}

impl<'a> ImageReader<'a> {
    /// Wraps an image buffer, validating the header and table bounds.
    pub fn new(words: &'a [ProgramWord]) -> Result<Self, MachineError> {
        let reader = Self { words };

        let version = reader.word(VERSION_OFFSET)?;
        if version != PROGRAM_VERSION {
            return Err(MachineError::InvalidProgramVersion(version));
        }

        // Header must be complete before the field accessors are trusted.
        reader.word(HEADER_LEN - 1)?;

        let instance_count = reader.instance_count() as usize;
        let instance_table = reader.word(INSTANCE_TABLE_SLOT)? as usize;
        reader.check_table(instance_table, instance_count * INSTANCE_ENTRY_LEN)?;

        let type_count = reader.type_count() as usize;
        let type_table = reader.word(TYPE_TABLE_SLOT)? as usize;
        reader.check_table(type_table, type_count * TYPE_ENTRY_LEN)?;

        let shared_count = reader.shared_function_count() as usize;
        let shared_table = reader.word(SHARED_FUNCTION_TABLE_SLOT)? as usize;
        reader.check_table(shared_table, shared_count)?;

        // Each type's function table must itself be in bounds, and each
        // instance must name a real type inside the globals partition.
        for type_id in 0..type_count {
            let entry = reader.type_entry(type_id as ProgramWord)?;
            reader.check_table(
                entry.function_table_offset as usize,
                entry.function_count as usize,
            )?;
        }
        for index in 0..instance_count {
            let entry = reader.instance(index as ProgramWord)?;
            if entry.type_id as usize >= type_count {
                return Err(MachineError::MachineIndexOutOfRange(entry.type_id));
            }
            if entry.globals_base > reader.globals_size() {
                return Err(MachineError::GlobalsBufferTooSmall(entry.globals_base));
            }
        }

        Ok(reader)
    }

    /// Total image length in words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of machine instances.
    pub fn instance_count(&self) -> ProgramWord {
        self.words[INSTANCE_COUNT_OFFSET]
    }

    /// Total globals partition size in StackWord cells.
    pub fn globals_size(&self) -> ProgramWord {
        self.words[GLOBALS_SIZE_OFFSET]
    }

    /// Number of shared function table entries.
    pub fn shared_function_count(&self) -> ProgramWord {
        self.words[SHARED_FUNCTION_COUNT_OFFSET]
    }

    /// Number of type table entries.
    pub fn type_count(&self) -> ProgramWord {
        self.words[TYPE_COUNT_OFFSET]
    }

    /// Reads one image cell.
    pub fn word(&self, index: usize) -> Result<ProgramWord, MachineError> {
        self.words
            .get(index)
            .copied()
            .ok_or(MachineError::OutOfBoundsStaticRead(index))
    }

    /// Looks up an instance table entry.
    pub fn instance(&self, machine: ProgramWord) -> Result<InstanceEntry, MachineError> {
        if machine >= self.instance_count() {
            return Err(MachineError::MachineIndexOutOfRange(machine));
        }
        let base =
            self.words[INSTANCE_TABLE_SLOT] as usize + machine as usize * INSTANCE_ENTRY_LEN;
        Ok(InstanceEntry {
            type_id: self.word(base)?,
            globals_base: self.word(base + 1)?,
        })
    }

    /// Looks up a type table entry.
    pub fn type_entry(&self, type_id: ProgramWord) -> Result<TypeEntry, MachineError> {
        if type_id >= self.type_count() {
            return Err(MachineError::MachineIndexOutOfRange(type_id));
        }
        let base = self.words[TYPE_TABLE_SLOT] as usize + type_id as usize * TYPE_ENTRY_LEN;
        Ok(TypeEntry {
            function_count: self.word(base)?,
            function_table_offset: self.word(base + 1)?,
        })
    }

    /// Resolves a machine-local function index to its entry offset.
    pub fn function_entry(
        &self,
        machine: ProgramWord,
        function: usize,
    ) -> Result<usize, MachineError> {
        let instance = self.instance(machine)?;
        let ty = self.type_entry(instance.type_id)?;
        if function >= ty.function_count as usize {
            return Err(MachineError::FunctionIndexOutOfRange(function as u32));
        }
        let slot = ty.function_table_offset as usize + function;
        Ok(self.word(slot)? as usize)
    }

    /// Resolves a shared function index to its entry offset.
    pub fn shared_function_entry(&self, function: usize) -> Result<usize, MachineError> {
        if function >= self.shared_function_count() as usize {
            return Err(MachineError::SharedFunctionIndexOutOfRange(function as u32));
        }
        let slot = self.words[SHARED_FUNCTION_TABLE_SLOT] as usize + function;
        Ok(self.word(slot)? as usize)
    }

    fn check_table(&self, offset: usize, len: usize) -> Result<(), MachineError> {
        let end = offset
            .checked_add(len)
            .ok_or(MachineError::OutOfBoundsStaticRead(offset))?;
        if end > self.words.len() {
            return Err(MachineError::OutOfBoundsStaticRead(end));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::machine::isa::Op;

    /// Builds a one-instance, one-type image whose single function is `body`.
    pub(crate) fn single_function_image(body: &[ProgramWord]) -> Vec<ProgramWord> {
        // header | instance table | type table | function table | body
        let instance_table = HEADER_LEN;
        let type_table = instance_table + INSTANCE_ENTRY_LEN;
        let function_table = type_table + TYPE_ENTRY_LEN;
        let body_start = function_table + 1;

        let mut image = vec![
            PROGRAM_VERSION,
            1, // instance count
            0, // globals size
            0, // shared function count
            1, // type count
            instance_table as ProgramWord,
            type_table as ProgramWord,
            0, // shared function table (empty)
        ];
        image.extend_from_slice(&[0, 0]); // instance 0: type 0, globals base 0
        image.extend_from_slice(&[1, function_table as ProgramWord]);
        image.push(body_start as ProgramWord);
        image.extend_from_slice(body);
        image
    }

    #[test]
    fn accepts_minimal_image() {
        let image = single_function_image(&[Op::Exit.into()]);
        let reader = ImageReader::new(&image).unwrap();
        assert_eq!(reader.instance_count(), 1);
        assert_eq!(reader.type_count(), 1);
        assert_eq!(reader.shared_function_count(), 0);
        assert_eq!(reader.globals_size(), 0);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut image = single_function_image(&[Op::Exit.into()]);
        image[VERSION_OFFSET] = 3;
        assert!(matches!(
            ImageReader::new(&image),
            Err(MachineError::InvalidProgramVersion(3))
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let image = [PROGRAM_VERSION, 0, 0];
        assert!(matches!(
            ImageReader::new(&image),
            Err(MachineError::OutOfBoundsStaticRead(_))
        ));
    }

    #[test]
    fn rejects_instance_table_past_end() {
        let mut image = single_function_image(&[Op::Exit.into()]);
        image[INSTANCE_TABLE_SLOT] = image.len() as ProgramWord;
        assert!(matches!(
            ImageReader::new(&image),
            Err(MachineError::OutOfBoundsStaticRead(_))
        ));
    }

    #[test]
    fn rejects_instance_with_bad_type() {
        let mut image = single_function_image(&[Op::Exit.into()]);
        image[HEADER_LEN] = 7; // instance 0 names type 7 of 1
        assert!(matches!(
            ImageReader::new(&image),
            Err(MachineError::MachineIndexOutOfRange(7))
        ));
    }

    #[test]
    fn resolves_function_entry() {
        let image = single_function_image(&[Op::Exit.into()]);
        let reader = ImageReader::new(&image).unwrap();
        let entry = reader.function_entry(0, 0).unwrap();
        assert_eq!(reader.word(entry).unwrap(), Op::Exit.into());
    }

    #[test]
    fn function_index_out_of_range() {
        let image = single_function_image(&[Op::Exit.into()]);
        let reader = ImageReader::new(&image).unwrap();
        assert!(matches!(
            reader.function_entry(0, 1),
            Err(MachineError::FunctionIndexOutOfRange(1))
        ));
    }

    #[test]
    fn machine_index_out_of_range() {
        let image = single_function_image(&[Op::Exit.into()]);
        let reader = ImageReader::new(&image).unwrap();
        assert!(matches!(
            reader.instance(1),
            Err(MachineError::MachineIndexOutOfRange(1))
        ));
    }

    #[test]
    fn shared_function_index_out_of_range() {
        let image = single_function_image(&[Op::Exit.into()]);
        let reader = ImageReader::new(&image).unwrap();
        assert!(matches!(
            reader.shared_function_entry(0),
            Err(MachineError::SharedFunctionIndexOutOfRange(0))
        ));
    }
}
