//! Shared test helper: an in-memory bytefile assembler.

/// Builds bytefile images instruction by instruction.
///
/// The header and section layout match what `ByteImage` parses: three
/// little-endian words, the public symbol table, the NUL-terminated string
/// table, then the code section.
pub struct ImageBuilder {
    globals: u32,
    strings: Vec<u8>,
    publics: Vec<(u32, u32)>,
    code: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(globals: u32) -> Self {
        Self {
            globals,
            strings: Vec::new(),
            publics: Vec::new(),
            code: Vec::new(),
        }
    }

    /// Add a string to the table and return its offset.
    pub fn intern(&mut self, text: &str) -> i32 {
        let pos = self.strings.len() as i32;
        self.strings.extend_from_slice(text.as_bytes());
        self.strings.push(0);
        pos
    }

    /// Declare a public symbol. Table order must match prologue order.
    pub fn public(&mut self, name: &str, offset: i32) {
        let pos = self.intern(name);
        self.publics.push((pos as u32, offset as u32));
    }

    /// Offset the next emitted instruction will have.
    pub fn here(&self) -> i32 {
        self.code.len() as i32
    }

    /// Byte position inside the code section, for later patching.
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self
    }

    pub fn int(&mut self, value: i32) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Overwrite a previously emitted operand word.
    pub fn patch_int(&mut self, at: usize, value: i32) {
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn begin(&mut self, nargs: i32, nlocals: i32) -> &mut Self {
        self.op(0x52).int(nargs).int(nlocals)
    }

    pub fn cbegin(&mut self, nargs: i32, nlocals: i32) -> &mut Self {
        self.op(0x53).int(nargs).int(nlocals)
    }

    pub fn const_op(&mut self, value: i32) -> &mut Self {
        self.op(0x10).int(value)
    }

    pub fn jmp(&mut self, target: i32) -> &mut Self {
        self.op(0x15).int(target)
    }

    pub fn cjmpz(&mut self, target: i32) -> &mut Self {
        self.op(0x50).int(target)
    }

    pub fn end(&mut self) -> &mut Self {
        self.op(0x16)
    }

    pub fn stop(&mut self) -> &mut Self {
        self.op(0xf0)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.globals.to_le_bytes());
        bytes.extend_from_slice(&(self.publics.len() as u32).to_le_bytes());
        for &(name, offset) in &self.publics {
            bytes.extend_from_slice(&name.to_le_bytes());
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        bytes.extend_from_slice(&self.strings);
        bytes.extend_from_slice(&self.code);
        bytes
    }
}
