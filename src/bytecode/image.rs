// This module implements the bytefile envelope reader. A bytefile starts with a fixed
// twelve-byte header of three little-endian 32-bit words (string table size, global area
// size in words, number of public symbols), followed by the public symbol table (pairs of
// 32-bit words: offset of the symbol name inside the string table, then the symbol's entry
// offset inside the code section), followed by the string table of NUL-terminated strings,
// followed by the code section which runs to the end of the file. ByteImage validates the
// declared section sizes against the actual file length up front, then provides bounds-checked
// accessors for strings, public symbols and the raw code bytes. All multi-byte values are
// little-endian. Validation failures surface as CompileError values rather than panics.

//! The bytefile envelope.

use std::path::Path;

use log::debug;

use crate::error::{CompileError, CompileResult};

/// Three 32-bit words: string table size, global area size, public symbol count.
const HEADER_SIZE: usize = 12;

/// Size of one public symbol table entry in bytes.
const PUBLIC_ENTRY_SIZE: usize = 8;

/// A parsed bytefile: header fields plus the section bytes that follow the header.
pub struct ByteImage {
    stringtab_size: usize,
    global_area_size: usize,
    public_symbols_number: usize,
    /// Everything after the header: publics, then strings, then code.
    data: Vec<u8>,
}

impl ByteImage {
    /// Validate and wrap a raw bytefile.
    pub fn parse(bytes: Vec<u8>) -> CompileResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CompileError::MalformedImage {
                reason: format!(
                    "file is {} bytes, the header alone needs {}",
                    bytes.len(),
                    HEADER_SIZE
                ),
            });
        }
        let stringtab_size = read_u32(&bytes, 0)?;
        let global_area_size = read_u32(&bytes, 4)?;
        let public_symbols_number = read_u32(&bytes, 8)?;

        let need = HEADER_SIZE + public_symbols_number * PUBLIC_ENTRY_SIZE + stringtab_size;
        if need > bytes.len() {
            return Err(CompileError::MalformedImage {
                reason: format!(
                    "declared sections need {} bytes, file has {}",
                    need,
                    bytes.len()
                ),
            });
        }

        let image = Self {
            stringtab_size,
            global_area_size,
            public_symbols_number,
            data: bytes[HEADER_SIZE..].to_vec(),
        };
        debug!(
            "parsed bytefile: {} byte string table, {} globals, {} public symbols, {} code bytes",
            image.stringtab_size,
            image.global_area_size,
            image.public_symbols_number,
            image.code().len()
        );
        Ok(image)
    }

    /// Read and parse a bytefile from disk.
    pub fn from_file(path: &Path) -> CompileResult<Self> {
        Self::parse(std::fs::read(path)?)
    }

    fn publics_end(&self) -> usize {
        self.public_symbols_number * PUBLIC_ENTRY_SIZE
    }

    fn strings_end(&self) -> usize {
        self.publics_end() + self.stringtab_size
    }

    /// The NUL-terminated string starting at `pos` in the string table.
    pub fn string_at(&self, pos: usize) -> CompileResult<&str> {
        if pos >= self.stringtab_size {
            return Err(CompileError::StringOutOfBounds {
                pos,
                size: self.stringtab_size,
            });
        }
        let table = &self.data[self.publics_end()..self.strings_end()];
        let tail = &table[pos..];
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CompileError::MalformedImage {
                reason: format!("string at table offset {pos} is not NUL-terminated"),
            })?;
        std::str::from_utf8(&tail[..end]).map_err(|_| CompileError::MalformedImage {
            reason: format!("string at table offset {pos} is not valid UTF-8"),
        })
    }

    /// Name of public symbol `index`.
    pub fn public_name(&self, index: usize) -> CompileResult<&str> {
        let pos = self.public_word(index, 0)?;
        self.string_at(pos)
    }

    /// Entry offset of public symbol `index`, checked against the code section.
    pub fn public_offset(&self, index: usize) -> CompileResult<usize> {
        let offset = self.public_word(index, 1)?;
        if offset >= self.code().len() {
            return Err(CompileError::BadPublicOffset { index, offset });
        }
        Ok(offset)
    }

    fn public_word(&self, index: usize, word: usize) -> CompileResult<usize> {
        if index >= self.public_symbols_number {
            return Err(CompileError::PublicOutOfBounds {
                index,
                count: self.public_symbols_number,
            });
        }
        read_u32(&self.data, index * PUBLIC_ENTRY_SIZE + word * 4)
    }

    /// The raw code section.
    pub fn code(&self) -> &[u8] {
        &self.data[self.strings_end()..]
    }

    /// Global area size in words.
    pub fn globals(&self) -> usize {
        self.global_area_size
    }

    /// String table size in bytes.
    pub fn stringtab_size(&self) -> usize {
        self.stringtab_size
    }

    /// Number of public symbols.
    pub fn public_count(&self) -> usize {
        self.public_symbols_number
    }
}

fn read_u32(bytes: &[u8], at: usize) -> CompileResult<usize> {
    let chunk = bytes
        .get(at..at + 4)
        .ok_or_else(|| CompileError::MalformedImage {
            reason: format!("cannot read a 32-bit word at byte {at}"),
        })?;
    Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize)
}
