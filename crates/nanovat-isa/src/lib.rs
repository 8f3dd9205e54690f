//! Binary instruction format for the nanovat virtual CPU.
//!
//! Every instruction occupies exactly three 16-bit words. Word 0 packs the
//! opcode into its low byte and the two operand addressing modes (plus one
//! subtract flag per operand, used only by register-indexed operands) into the
//! high bits. Words 1 and 2 carry the operand payloads.
//!
//! Immediate operands of control-flow instructions are stored relative to the
//! instruction's own address; [`Instruction::decode`] reconstructs the
//! absolute target so callers never see the relative form.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Words occupied by a single encoded instruction.
pub const WORDS_PER_INSTRUCTION: u16 = 3;

/// Size of an organism's unified program/data/stack memory, in words.
pub const MEMORY_WORDS: u16 = 3600;

/// Number of general-purpose registers (`r0`..`r13`).
pub const REGISTER_COUNT: u16 = 14;

/// Mask selecting the opcode byte of word 0.
const OPCODE_MASK: u16 = 0x00FF;

/// Low 12 bits of a register-indexed payload hold the offset.
const INDEXED_OFFSET_MASK: u16 = 0x0FFF;

/// The 38 operations understood by the virtual CPU.
///
/// Discriminants are part of the binary format and must never be renumbered.
/// `Charge`, `Poke`, `Peek`, and `Cksum` are reserved: they keep their opcode
/// numbers for binary compatibility but execute as no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Mov = 1,
    Push = 2,
    Pop = 3,
    Call = 4,
    Ret = 5,
    Jmp = 6,
    Jl = 7,
    Jle = 8,
    Jg = 9,
    Jge = 10,
    Je = 11,
    Jne = 12,
    Js = 13,
    Jns = 14,
    Add = 15,
    Sub = 16,
    Mult = 17,
    Div = 18,
    Mod = 19,
    And = 20,
    Or = 21,
    Xor = 22,
    Cmp = 23,
    Test = 24,
    Getxy = 25,
    Energy = 26,
    Travel = 27,
    Shl = 28,
    Shr = 29,
    Sense = 30,
    Eat = 31,
    Rand = 32,
    Release = 33,
    Charge = 34,
    Poke = 35,
    Peek = 36,
    Cksum = 37,
}

/// Raised when a word group's opcode byte falls outside the ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("opcode {0:#06x} is not part of the ISA")]
pub struct UnknownOpcode(pub u16);

impl TryFrom<u16> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(raw: u16) -> Result<Self, UnknownOpcode> {
        ALL_OPCODES
            .get(raw as usize)
            .copied()
            .ok_or(UnknownOpcode(raw))
    }
}

/// Every opcode in discriminant order; index equals discriminant.
pub const ALL_OPCODES: [Opcode; 38] = [
    Opcode::Nop,
    Opcode::Mov,
    Opcode::Push,
    Opcode::Pop,
    Opcode::Call,
    Opcode::Ret,
    Opcode::Jmp,
    Opcode::Jl,
    Opcode::Jle,
    Opcode::Jg,
    Opcode::Jge,
    Opcode::Je,
    Opcode::Jne,
    Opcode::Js,
    Opcode::Jns,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mult,
    Opcode::Div,
    Opcode::Mod,
    Opcode::And,
    Opcode::Or,
    Opcode::Xor,
    Opcode::Cmp,
    Opcode::Test,
    Opcode::Getxy,
    Opcode::Energy,
    Opcode::Travel,
    Opcode::Shl,
    Opcode::Shr,
    Opcode::Sense,
    Opcode::Eat,
    Opcode::Rand,
    Opcode::Release,
    Opcode::Charge,
    Opcode::Poke,
    Opcode::Peek,
    Opcode::Cksum,
];

impl Opcode {
    /// Lowercase mnemonic matching the assembler's input grammar.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Mov => "mov",
            Self::Push => "push",
            Self::Pop => "pop",
            Self::Call => "call",
            Self::Ret => "ret",
            Self::Jmp => "jmp",
            Self::Jl => "jl",
            Self::Jle => "jle",
            Self::Jg => "jg",
            Self::Jge => "jge",
            Self::Je => "je",
            Self::Jne => "jne",
            Self::Js => "js",
            Self::Jns => "jns",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mult => "mult",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Cmp => "cmp",
            Self::Test => "test",
            Self::Getxy => "getxy",
            Self::Energy => "energy",
            Self::Travel => "travel",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::Sense => "sense",
            Self::Eat => "eat",
            Self::Rand => "rand",
            Self::Release => "release",
            Self::Charge => "charge",
            Self::Poke => "poke",
            Self::Peek => "peek",
            Self::Cksum => "cksum",
        }
    }

    /// Look up an opcode by mnemonic, case-insensitively.
    #[must_use]
    pub fn from_mnemonic(text: &str) -> Option<Self> {
        ALL_OPCODES
            .iter()
            .copied()
            .find(|op| op.mnemonic().eq_ignore_ascii_case(text))
    }

    /// Number of operands the instruction carries (0, 1, or 2).
    #[must_use]
    pub const fn operand_count(self) -> usize {
        match self {
            Self::Nop | Self::Ret | Self::Eat => 0,
            Self::Push
            | Self::Pop
            | Self::Call
            | Self::Jmp
            | Self::Jl
            | Self::Jle
            | Self::Jg
            | Self::Jge
            | Self::Je
            | Self::Jne
            | Self::Js
            | Self::Jns
            | Self::Energy
            | Self::Travel
            | Self::Sense
            | Self::Release => 1,
            _ => 2,
        }
    }

    /// Whether immediate operands are stored relative to the instruction's
    /// own address (`CALL` and every jump).
    #[must_use]
    pub const fn relative_immediates(self) -> bool {
        matches!(
            self,
            Self::Call
                | Self::Jmp
                | Self::Jl
                | Self::Jle
                | Self::Jg
                | Self::Jge
                | Self::Je
                | Self::Jne
                | Self::Js
                | Self::Jns
        )
    }
}

/// One decoded operand, tagged by addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// `[N]` — absolute address into program memory.
    Direct(u16),
    /// `rN` — general-purpose register index.
    Register(u16),
    /// Bare literal. Holds the absolute value even for control-flow targets.
    Immediate(u16),
    /// `[rN+K]` / `[rN-K]` — memory at `registers[register] ± offset`.
    ///
    /// The sign lives in a dedicated flag bit so the offset stays an unsigned
    /// 12-bit quantity next to the 4-bit register index.
    RegisterIndexed {
        register: u16,
        offset: u16,
        subtract: bool,
    },
}

impl Operand {
    /// Two-bit addressing-mode tag as stored in word 0.
    #[must_use]
    pub const fn mode(self) -> u16 {
        match self {
            Self::Direct(_) => 0,
            Self::Register(_) => 1,
            Self::Immediate(_) => 2,
            Self::RegisterIndexed { .. } => 3,
        }
    }

    /// Whether the subtract flag bit must be set for this operand.
    const fn subtract_bit(self) -> bool {
        matches!(
            self,
            Self::RegisterIndexed {
                subtract: true,
                offset: 1..,
                ..
            }
        )
    }

    /// Payload word for this operand. `relative` marks control-flow
    /// immediates, which are stored as `target - ip`.
    fn encode_payload(self, relative: bool, ip: u16) -> u16 {
        match self {
            Self::Direct(address) => address,
            Self::Register(index) => index,
            Self::Immediate(value) => {
                if relative {
                    value.wrapping_sub(ip)
                } else {
                    value
                }
            }
            Self::RegisterIndexed {
                register,
                offset,
                subtract,
            } => {
                let stored = if subtract {
                    offset.wrapping_neg() & INDEXED_OFFSET_MASK
                } else {
                    offset & INDEXED_OFFSET_MASK
                };
                (register << 12) | stored
            }
        }
    }

    /// Reconstruct an operand from its mode tag, subtract bit, and payload.
    fn decode_payload(mode: u16, subtract: bool, payload: u16, relative: bool, ip: u16) -> Self {
        match mode {
            0 => Self::Direct(payload),
            1 => Self::Register(payload),
            2 => {
                if relative {
                    Self::Immediate(ip.wrapping_add(payload))
                } else {
                    Self::Immediate(payload)
                }
            }
            _ => {
                let stored = payload & INDEXED_OFFSET_MASK;
                // A zero offset canonicalises to the positive form so that
                // encode/decode stays exactly invertible.
                let (offset, subtract) = if subtract && stored != 0 {
                    (0x1000 - stored, true)
                } else {
                    (stored, false)
                };
                Self::RegisterIndexed {
                    register: payload >> 12,
                    offset,
                    subtract,
                }
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Direct(address) => write!(f, "[{address}]"),
            Self::Register(index) => write!(f, "r{index}"),
            Self::Immediate(value) => write!(f, "{value}"),
            Self::RegisterIndexed {
                register,
                offset: 0,
                ..
            } => write!(f, "[r{register}]"),
            Self::RegisterIndexed {
                register,
                offset,
                subtract: false,
            } => write!(f, "[r{register}+{offset}]"),
            Self::RegisterIndexed {
                register,
                offset,
                subtract: true,
            } => write!(f, "[r{register}-{offset}]"),
        }
    }
}

/// A fully decoded instruction: opcode plus both operand slots.
///
/// Opcodes with fewer than two operands keep `Direct(0)` in the unused slots,
/// which encodes to zero words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub op1: Operand,
    pub op2: Operand,
}

impl Instruction {
    /// Convenience constructor filling unused operand slots.
    #[must_use]
    pub fn new(opcode: Opcode, operands: &[Operand]) -> Self {
        Self {
            opcode,
            op1: operands.first().copied().unwrap_or(Operand::Direct(0)),
            op2: operands.get(1).copied().unwrap_or(Operand::Direct(0)),
        }
    }

    /// Encode into the 3-word binary form. `ip` is the address the
    /// instruction will occupy; control-flow immediates are stored relative
    /// to it.
    #[must_use]
    pub fn encode(&self, ip: u16) -> [u16; 3] {
        let relative = self.opcode.relative_immediates();
        let mut word0 = self.opcode as u16;
        word0 |= self.op1.mode() << 14;
        word0 |= self.op2.mode() << 12;
        if self.op1.subtract_bit() {
            word0 |= 0x0800;
        }
        if self.op2.subtract_bit() {
            word0 |= 0x0400;
        }
        [
            word0,
            self.op1.encode_payload(relative, ip),
            self.op2.encode_payload(relative, ip),
        ]
    }

    /// Decode a 3-word group fetched from address `ip`.
    ///
    /// Control-flow immediates come back as absolute targets. Fails only when
    /// the opcode byte is outside the ISA; malformed operand payloads are
    /// preserved verbatim for the engine's fault policy to absorb.
    pub fn decode(words: [u16; 3], ip: u16) -> Result<Self, UnknownOpcode> {
        let opcode = Opcode::try_from(words[0] & OPCODE_MASK)?;
        let relative = opcode.relative_immediates();
        let op1 = Operand::decode_payload(
            (words[0] >> 14) & 0x3,
            (words[0] >> 11) & 0x1 == 1,
            words[1],
            relative,
            ip,
        );
        let op2 = Operand::decode_payload(
            (words[0] >> 12) & 0x3,
            (words[0] >> 10) & 0x1 == 1,
            words[2],
            relative,
            ip,
        );
        Ok(Self { opcode, op1, op2 })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode.operand_count() {
            0 => write!(f, "{}", self.opcode.mnemonic()),
            1 => write!(f, "{} {}", self.opcode.mnemonic(), self.op1),
            _ => write!(f, "{} {}, {}", self.opcode.mnemonic(), self.op1, self.op2),
        }
    }
}

/// Render the word group at `ip` in the assembler's own grammar.
///
/// Groups whose opcode byte falls outside the ISA are rendered as a raw
/// `data { .. }` directive, matching how the assembler would reproduce them.
#[must_use]
pub fn disassemble(words: [u16; 3], ip: u16) -> String {
    match Instruction::decode(words, ip) {
        Ok(instruction) => instruction.to_string(),
        Err(_) => format!("data {{ {} {} {} }}", words[0], words[1], words[2]),
    }
}
