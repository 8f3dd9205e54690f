//! Two-pass assembler for the nanovat virtual CPU.
//!
//! The source format is line-oriented: an optional `info: name, author`
//! header, `//` and `;` comments, `label:` definitions, `data { .. }`
//! directives, and one instruction per line. Forward label references are
//! legal, which forces the two-pass design: pass one only measures, recording
//! every label's address; pass two resolves references and emits bytecode
//! through [`nanovat_isa`].
//!
//! Instructions always occupy 3-word-aligned slots. Data blocks are tracked
//! with a separate data pointer so consecutive blocks pack into the same
//! 3-word reservation; a block of `n` values reserves `ceil(n/3)*3` words
//! once the data pointer catches up with the instruction pointer.

use nanovat_isa::{Instruction, MEMORY_WORDS, Opcode, Operand, REGISTER_COUNT};
use std::collections::BTreeMap;
use thiserror::Error;

/// Name used when the `info:` header is missing or incomplete.
pub const DEFAULT_NAME: &str = "UNNAMED";
/// Author used when the `info:` header is missing or incomplete.
pub const DEFAULT_AUTHOR: &str = "ANONYMOUS";

const IMAGE_WORDS: usize = MEMORY_WORDS as usize;

/// A compiled program: the full memory image plus header metadata.
#[derive(Debug, Clone)]
pub struct Program {
    /// Exactly [`MEMORY_WORDS`] words; addresses not covered by instructions
    /// or data stay zero (which executes as `nop`).
    pub image: Box<[u16; IMAGE_WORDS]>,
    /// Entrant name from the `info:` header.
    pub name: String,
    /// Author from the `info:` header.
    pub author: String,
    /// Every label and the address it resolved to.
    pub labels: BTreeMap<String, u16>,
}

/// Fatal assembly failure, pinned to its 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct CompileError {
    pub line: usize,
    pub kind: CompileErrorKind,
}

/// What went wrong on the offending line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileErrorKind {
    #[error("data directive must be followed by a brace-enclosed value list")]
    MalformedDirective,
    #[error("unresolved reference `{0}`")]
    UnresolvedReference(String),
    #[error("label `{0}` is defined more than once")]
    DuplicateLabel(String),
    #[error("program does not fit in the {IMAGE_WORDS}-word image")]
    ProgramTooLarge,
}

impl CompileError {
    fn new(line: usize, kind: CompileErrorKind) -> Self {
        Self { line, kind }
    }
}

/// Compile assembly text into a loadable program image.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let lines: Vec<&str> = source.lines().collect();
    let (name, author) = parse_header(&lines);
    let labels = collect_labels(&lines)?;
    let image = emit(&lines, &labels)?;
    Ok(Program {
        image,
        name,
        author,
        labels,
    })
}

/// Pull entrant metadata from the first `info:` line, if any.
fn parse_header(lines: &[&str]) -> (String, String) {
    for line in lines {
        let Some(rest) = line.trim().strip_prefix("info:") else {
            continue;
        };
        let mut parts = rest.splitn(2, ',');
        let name = parts.next().map(str::trim).unwrap_or_default();
        let author = parts.next().map(str::trim).unwrap_or_default();
        return (
            if name.is_empty() {
                DEFAULT_NAME.to_string()
            } else {
                name.to_string()
            },
            if author.is_empty() {
                DEFAULT_AUTHOR.to_string()
            } else {
                author.to_string()
            },
        );
    }
    (DEFAULT_NAME.to_string(), DEFAULT_AUTHOR.to_string())
}

/// Strip `//` and `;` comments, returning the significant text.
fn strip_comment(line: &str) -> &str {
    let line = line.split("//").next().unwrap_or("");
    let line = line.split(';').next().unwrap_or("");
    line.trim()
}

/// One measured source statement.
enum Statement<'a> {
    Label(&'a str),
    Data(Vec<&'a str>),
    Instruction {
        opcode: Opcode,
        operands: Vec<&'a str>,
    },
}

/// Classify one significant line. `None` for blanks and the header.
fn classify<'a>(line_no: usize, text: &'a str) -> Result<Option<Statement<'a>>, CompileError> {
    if text.is_empty() || text.starts_with("info:") {
        return Ok(None);
    }

    let (head, rest) = match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    };

    if head.eq_ignore_ascii_case("data") {
        let Some(body) = rest.strip_prefix('{').and_then(|r| r.strip_suffix('}')) else {
            return Err(CompileError::new(
                line_no,
                CompileErrorKind::MalformedDirective,
            ));
        };
        let values: Vec<&str> = body.split_whitespace().collect();
        if values.len() > IMAGE_WORDS {
            return Err(CompileError::new(line_no, CompileErrorKind::ProgramTooLarge));
        }
        return Ok(Some(Statement::Data(values)));
    }

    if rest.is_empty()
        && let Some(label) = head.strip_suffix(':')
    {
        return Ok(Some(Statement::Label(label)));
    }

    let Some(opcode) = Opcode::from_mnemonic(head) else {
        return Err(CompileError::new(
            line_no,
            CompileErrorKind::UnresolvedReference(head.to_string()),
        ));
    };
    let operands = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(',').map(str::trim).collect()
    };
    Ok(Some(Statement::Instruction { opcode, operands }))
}

/// Tracks the instruction and data pointers through the source.
///
/// Instructions land at `ip` and advance it by 3. A data block of `n` values
/// writes at `dp` (or `ip` when the two coincide), advances `dp` by `n`, and
/// advances `ip` by the block's 3-word-aligned reservation once `dp` has
/// caught up. Labels bind to whichever pointer is active.
#[derive(Default)]
struct Cursor {
    ip: u16,
    dp: u16,
}

impl Cursor {
    fn here(&self) -> u16 {
        if self.dp == self.ip { self.ip } else { self.dp }
    }

    fn advance_instruction(&mut self) -> u16 {
        let at = self.ip;
        self.ip += 3;
        self.dp = self.ip;
        at
    }

    fn advance_data(&mut self, count: u16) -> u16 {
        let at = self.here();
        let reserved = count.div_ceil(3) * 3;
        self.dp += count;
        if self.dp >= self.ip {
            self.ip += reserved;
        }
        at
    }
}

/// Pass one: measure every statement and record label addresses.
fn collect_labels(lines: &[&str]) -> Result<BTreeMap<String, u16>, CompileError> {
    let mut labels = BTreeMap::new();
    let mut cursor = Cursor::default();

    for (index, raw) in lines.iter().enumerate() {
        let line_no = index + 1;
        match classify(line_no, strip_comment(raw))? {
            None => {}
            Some(Statement::Label(label)) => {
                let key = label.to_ascii_lowercase();
                if labels.insert(key, cursor.here()).is_some() {
                    return Err(CompileError::new(
                        line_no,
                        CompileErrorKind::DuplicateLabel(label.to_string()),
                    ));
                }
            }
            Some(Statement::Data(values)) => {
                cursor.advance_data(values.len() as u16);
            }
            Some(Statement::Instruction { .. }) => {
                cursor.advance_instruction();
            }
        }
        if cursor.ip > MEMORY_WORDS || cursor.dp > MEMORY_WORDS {
            return Err(CompileError::new(line_no, CompileErrorKind::ProgramTooLarge));
        }
    }

    Ok(labels)
}

/// Pass two: resolve references and write the image.
fn emit(
    lines: &[&str],
    labels: &BTreeMap<String, u16>,
) -> Result<Box<[u16; IMAGE_WORDS]>, CompileError> {
    let mut image = Box::new([0u16; IMAGE_WORDS]);
    let mut cursor = Cursor::default();

    for (index, raw) in lines.iter().enumerate() {
        let line_no = index + 1;
        match classify(line_no, strip_comment(raw))? {
            None | Some(Statement::Label(_)) => {}
            Some(Statement::Data(values)) => {
                let at = cursor.advance_data(values.len() as u16);
                for (slot, token) in values.iter().enumerate() {
                    let word = resolve_word(line_no, token, labels)?;
                    store(&mut image, at as usize + slot, word, line_no)?;
                }
            }
            Some(Statement::Instruction { opcode, operands }) => {
                let at = cursor.advance_instruction();
                let mut resolved = Vec::with_capacity(operands.len());
                for token in &operands {
                    resolved.push(parse_operand(line_no, token, labels)?);
                }
                let words = Instruction::new(opcode, &resolved).encode(at);
                for (slot, word) in words.into_iter().enumerate() {
                    store(&mut image, at as usize + slot, word, line_no)?;
                }
            }
        }
    }

    Ok(image)
}

fn store(
    image: &mut [u16; IMAGE_WORDS],
    address: usize,
    word: u16,
    line_no: usize,
) -> Result<(), CompileError> {
    let Some(cell) = image.get_mut(address) else {
        return Err(CompileError::new(line_no, CompileErrorKind::ProgramTooLarge));
    };
    *cell = word;
    Ok(())
}

/// Resolve a bare token (decimal, `0x` hex, or label) to a word value.
fn resolve_word(
    line_no: usize,
    token: &str,
    labels: &BTreeMap<String, u16>,
) -> Result<u16, CompileError> {
    if let Some(value) = parse_literal(token) {
        return Ok(value);
    }
    if !token.starts_with(|c: char| c.is_ascii_digit())
        && let Some(&address) = labels.get(&token.to_ascii_lowercase())
    {
        return Ok(address);
    }
    Err(CompileError::new(
        line_no,
        CompileErrorKind::UnresolvedReference(token.to_string()),
    ))
}

/// Parse a decimal or `0x`-prefixed hexadecimal literal.
fn parse_literal(token: &str) -> Option<u16> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}

/// Parse an `rN` register token for `N` in `0..REGISTER_COUNT`.
fn parse_register(token: &str) -> Option<u16> {
    let digits = token.strip_prefix(['r', 'R'])?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u16 = digits.parse().ok()?;
    (index < REGISTER_COUNT).then_some(index)
}

/// Parse one operand token into its addressing mode.
fn parse_operand(
    line_no: usize,
    token: &str,
    labels: &BTreeMap<String, u16>,
) -> Result<Operand, CompileError> {
    let unresolved = || {
        CompileError::new(
            line_no,
            CompileErrorKind::UnresolvedReference(token.to_string()),
        )
    };

    if let Some(inner) = token.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or_else(unresolved)?.trim();

        // [rN+K] / [rN-K] / [rN]
        if let Some(split) = inner.find(['+', '-']) {
            let (base, tail) = inner.split_at(split);
            let register = parse_register(base.trim()).ok_or_else(unresolved)?;
            let subtract = tail.starts_with('-');
            let offset = resolve_word(line_no, tail[1..].trim(), labels)?;
            return Ok(Operand::RegisterIndexed {
                register,
                offset,
                subtract: subtract && offset != 0,
            });
        }
        if let Some(register) = parse_register(inner) {
            return Ok(Operand::RegisterIndexed {
                register,
                offset: 0,
                subtract: false,
            });
        }
        return Ok(Operand::Direct(resolve_word(line_no, inner, labels)?));
    }

    // A register token wins over a label of the same shape, as in the
    // reference grammar.
    if let Some(register) = parse_register(token) {
        return Ok(Operand::Register(register));
    }

    Ok(Operand::Immediate(resolve_word(line_no, token, labels)?))
}
