use std::io;

use thiserror::Error;

use crate::constants::{Word, DEFAULT_MEMORY_SIZE};

/// Represents errors related to memory accesses
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The address does not name a cell
    #[error("address {address} is out of bounds (0-{last})")]
    OutOfRange { address: Word, last: Word },
}

/// Holds the memory cells of the machine.
///
/// Memory is a flat array of words and knows nothing about regions or
/// privileges; the protection policy lives in the CPU.
pub struct Memory {
    cells: Vec<Word>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_SIZE)
    }
}

impl Memory {
    /// Create a zero-filled memory with the given cell count
    pub fn new(size: usize) -> Self {
        Self {
            cells: vec![0; size],
        }
    }

    /// Number of cells
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    fn index(&self, address: Word) -> Result<usize, MemoryError> {
        usize::try_from(address)
            .ok()
            .filter(|&index| index < self.cells.len())
            .ok_or(MemoryError::OutOfRange {
                address,
                last: self.cells.len() as Word - 1,
            })
    }

    /// Read the cell at an address
    ///
    /// It fails if the address is negative or past the end of memory.
    pub fn read(&self, address: Word) -> Result<Word, MemoryError> {
        self.index(address).map(|index| self.cells[index])
    }

    /// Write the cell at an address
    ///
    /// It fails if the address is negative or past the end of memory.
    pub fn write(&mut self, address: Word, value: Word) -> Result<(), MemoryError> {
        let index = self.index(address)?;
        self.cells[index] = value;
        Ok(())
    }

    /// Apply data-section entries, each an (address, value) pair
    pub fn load(&mut self, entries: &[(Word, Word)]) -> Result<(), MemoryError> {
        for &(address, value) in entries {
            self.write(address, value)?;
        }
        Ok(())
    }

    /// Write an `address:value` line for every cell in the inclusive range,
    /// clamped to the actual memory bounds
    pub fn dump_range(
        &self,
        out: &mut impl io::Write,
        start: Word,
        end: Word,
    ) -> io::Result<()> {
        let last = self.cells.len() as Word - 1;
        for address in start.max(0)..=end.min(last) {
            writeln!(out, "{}:{}", address, self.cells[address as usize])?;
        }
        Ok(())
    }
}
