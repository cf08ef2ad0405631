use std::cell::Cell;
use std::rc::Rc;

use strum_macros::{Display, EnumIter, EnumString, FromRepr};

use crate::error::ChunkError;
use crate::objects::object::ObjRef;
use crate::value::{Value, ValueArray};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, FromRepr, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    Constant,
    Null,
    True,
    False,
    Pop,
    BeginScope,
    EndScope,
    GetVar,
    SetVar,
    DefineVar,
    DefineConst,
    GetProperty,
    GetPropertyOptional,
    SetProperty,
    GetThis,
    GetIndex,
    GetIndexOptional,
    SetIndex,
    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Not,
    Negate,
    Stringify,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    CallOptional,
    Invoke,
    ArgCount,
    Closure,
    Return,
    Class,
    Struct,
    Import,
    ImportModule,
    Export,
    ExportValue,
    ExportFrom,
    Private,
    Array,
    ArrayAppend,
    Map,
    MapSet,
    MapHas,
    Len,
    IsArray,
    IsMap,
    Try,
    EndTry,
    Throw,
    TryUnwrap,
    MatchEnum,
    Gc,
}

/// How the bytes following an opcode are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    /// One raw byte (argument count).
    Byte,
    /// One big-endian u16 count.
    Short,
    /// One u16 constant-pool index.
    Constant,
    /// u16 forward jump distance.
    Jump,
    /// u16 backward jump distance.
    Loop,
    /// `INVOKE name(2) argc(1)`.
    Invoke,
    /// `CLASS name(2) methodCount(2)`.
    Class,
    /// `IMPORT hasAlias(1) alias(2)`.
    Import,
    /// `MATCH_ENUM enum(2) variant(2)`.
    ConstantPair,
    /// `EXPORT_FROM count(2)` then `count` pairs of constant indices.
    ExportFrom,
}

impl OpCode {
    #[inline(always)]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OpCode::from_repr(byte)
    }

    #[inline(always)]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn byte_to_string(byte: &Option<OpCode>) -> String {
        match byte {
            Some(code) => code.to_string(),
            None => "None".to_string(),
        }
    }

    pub fn operands(self) -> Operands {
        use OpCode::*;
        match self {
            Constant | GetVar | SetVar | DefineVar | DefineConst | GetProperty | GetPropertyOptional
            | SetProperty | GetThis | Closure | Struct | Export | ExportValue | Private => Operands::Constant,
            Call | CallOptional => Operands::Byte,
            Array | Map => Operands::Short,
            Jump | JumpIfFalse | Try => Operands::Jump,
            Loop => Operands::Loop,
            Invoke => Operands::Invoke,
            Class => Operands::Class,
            Import => Operands::Import,
            MatchEnum => Operands::ConstantPair,
            ExportFrom => Operands::ExportFrom,
            _ => Operands::None,
        }
    }
}

/// Source token recorded for every byte of an instruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Token {
    pub line: u32,
    pub column: u32,
    pub lexeme: Option<Rc<str>>,
}

/// Result of a property lookup remembered at the offset of the instruction
/// that performed it. Every hit is re-validated against live handles before use.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum InlineCache {
    #[default]
    Empty,
    /// Entry `index` of the field map `map`, valid while the map's version is unchanged.
    Field { map: ObjRef, key: ObjRef, index: usize, version: u32 },
    /// Entry `index` of the methods map of `class`.
    Method { class: ObjRef, key: ObjRef, index: usize, version: u32 },
}

#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub tokens: Vec<Token>,
    pub constants: ValueArray,
    pub caches: Vec<Cell<InlineCache>>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk::default()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn write(&mut self, byte: u8, token: Token) {
        self.code.push(byte);
        self.tokens.push(token);
        self.caches.push(Cell::new(InlineCache::Empty));
    }

    pub fn add_constant(&mut self, value: Value) -> Result<u16, ChunkError> {
        if self.constants.len() > u16::MAX as usize {
            return Err(ChunkError::TooManyConstants);
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u16)
    }

    #[inline(always)]
    pub fn read_from_offset(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    pub fn read_short_from_offset(&self, offset: usize) -> Option<u16> {
        let high = self.read_from_offset(offset)? as u16;
        let low = self.read_from_offset(offset + 1)? as u16;
        Some((high << 8) | low)
    }

    pub fn token_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(offset)
    }

    #[inline(always)]
    pub fn get_constant(&self, index: usize) -> Option<Value> {
        self.constants.get(index).copied()
    }

    #[inline(always)]
    pub fn cache(&self, offset: usize) -> InlineCache {
        self.caches.get(offset).map(Cell::get).unwrap_or_default()
    }

    #[inline(always)]
    pub fn set_cache(&self, offset: usize, cache: InlineCache) {
        if let Some(slot) = self.caches.get(offset) {
            slot.set(cache);
        }
    }
}

/// Compiler-facing writer for a [`Chunk`]. Keeps the per-byte token and cache
/// arrays in step with the code.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    chunk: Chunk,
    token: Token,
}

impl ChunkBuilder {
    pub fn new() -> ChunkBuilder {
        ChunkBuilder::default()
    }

    /// Set the source token recorded for the bytes emitted from now on.
    pub fn at(&mut self, line: u32, column: u32, lexeme: Option<&str>) -> &mut Self {
        self.token = Token {
            line,
            column,
            lexeme: lexeme.map(Rc::from),
        };
        self
    }

    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.chunk.write(byte, self.token.clone());
        self
    }

    pub fn short(&mut self, value: u16) -> &mut Self {
        self.byte((value >> 8) as u8);
        self.byte((value & 0xff) as u8)
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.byte(op.to_byte())
    }

    pub fn constant(&mut self, value: Value) -> Result<u16, ChunkError> {
        self.chunk.add_constant(value)
    }

    pub fn emit_constant(&mut self, value: Value) -> Result<&mut Self, ChunkError> {
        self.op_constant(OpCode::Constant, value)
    }

    /// Emit `op` followed by the pool index of `value`.
    pub fn op_constant(&mut self, op: OpCode, value: Value) -> Result<&mut Self, ChunkError> {
        let index = self.constant(value)?;
        Ok(self.op(op).short(index))
    }

    /// Emit a forward jump with a placeholder distance. Returns the operand offset for `patch_jump`.
    pub fn emit_jump(&mut self, op: OpCode) -> usize {
        self.op(op).short(0xffff);
        self.chunk.len() - 2
    }

    pub fn patch_jump(&mut self, operand: usize) -> Result<(), ChunkError> {
        let jump = self.chunk.len() - operand - 2;
        if jump > u16::MAX as usize {
            return Err(ChunkError::JumpTooLarge);
        }
        self.chunk.code[operand] = ((jump >> 8) & 0xff) as u8;
        self.chunk.code[operand + 1] = (jump & 0xff) as u8;
        Ok(())
    }

    pub fn emit_loop(&mut self, loop_start: usize) -> Result<&mut Self, ChunkError> {
        self.op(OpCode::Loop);
        let offset = self.chunk.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(ChunkError::LoopTooLarge);
        }
        Ok(self.short(offset as u16))
    }

    /// Current end of the code, used as a loop start.
    pub fn position(&self) -> usize {
        self.chunk.len()
    }

    pub fn finish(self) -> Chunk {
        self.chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn opcode_byte_mapping() {
        assert_eq!(OpCode::from_byte(OpCode::Gc.to_byte()), Some(OpCode::Gc));
        assert_eq!(OpCode::from_byte(250), None);
        assert_eq!(OpCode::GetPropertyOptional.to_string(), "GET_PROPERTY_OPTIONAL");
        assert_eq!(OpCode::from_str("MATCH_ENUM"), Ok(OpCode::MatchEnum));
        assert_eq!(OpCode::byte_to_string(&None), "None");
    }

    #[test]
    fn parallel_arrays_stay_in_step() {
        let mut builder = ChunkBuilder::new();
        builder.at(1, 1, Some("x"));
        builder.emit_constant(Value::Number(1.0)).unwrap();
        builder.op(OpCode::Return);
        let chunk = builder.finish();
        assert_eq!(chunk.code.len(), 4);
        assert_eq!(chunk.tokens.len(), chunk.code.len());
        assert_eq!(chunk.caches.len(), chunk.code.len());
        assert_eq!(chunk.token_at(3).and_then(|t| t.lexeme.as_deref()), Some("x"));
    }

    #[test]
    fn jumps_patch_forward_and_loop_back() {
        let mut builder = ChunkBuilder::new();
        let start = builder.position();
        builder.op(OpCode::Null);
        let jump = builder.emit_jump(OpCode::JumpIfFalse);
        builder.op(OpCode::Pop);
        builder.patch_jump(jump).unwrap();
        builder.emit_loop(start).unwrap();
        let chunk = builder.finish();
        assert_eq!(chunk.read_short_from_offset(jump), Some(1));
        // LOOP operand jumps back over itself and everything before it.
        assert_eq!(chunk.read_short_from_offset(6), Some(8));
    }

    #[test]
    fn cache_slots_are_interior_mutable() {
        let mut builder = ChunkBuilder::new();
        builder.op(OpCode::GetProperty).short(0);
        let chunk = builder.finish();
        let entry = InlineCache::Field { map: ObjRef(3), key: ObjRef(4), index: 2, version: 0 };
        chunk.set_cache(0, entry);
        assert_eq!(chunk.cache(0), entry);
        assert_eq!(chunk.cache(99), InlineCache::Empty);
    }

    #[test]
    fn operand_layout_matches_encoding() {
        assert_eq!(OpCode::Invoke.operands(), Operands::Invoke);
        assert_eq!(OpCode::Try.operands(), Operands::Jump);
        assert_eq!(OpCode::Array.operands(), Operands::Short);
        assert_eq!(OpCode::ImportModule.operands(), Operands::None);
    }
}
