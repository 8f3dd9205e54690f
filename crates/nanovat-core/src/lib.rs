//! Execution engine and world scheduler for the nanovat simulator.
//!
//! Each organism owns a private 16-bit CPU: 14 registers, 3600 words of
//! unified program/data/stack memory, a flag register, and an energy counter.
//! The world owns everything shared: the element grid, the score ledger, the
//! seeded random stream, and the roster. Once per tick every organism with
//! positive energy executes exactly one instruction; opcodes that touch the
//! outside (movement, sensing, eating, depositing) go through the
//! [`Environment`] trait so the engine never holds a reference to world
//! internals.
//!
//! Determinism is load-bearing: a run is reproducible bit for bit from its
//! seed because the random stream is consumed in one fixed order (grid setup,
//! spawn placement, then per-tick `rand`/respawn/mutation draws in roster
//! order).

use nanovat_isa::{Instruction, MEMORY_WORDS, Opcode, Operand, REGISTER_COUNT, disassemble};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Element code for an empty grid cell.
pub const EMPTY_CELL: u16 = 0;
/// Element code for a permanent collection point.
pub const COLLECTION_POINT: u16 = 0xFFFF;
/// Energy granted by a successful `eat`.
pub const EAT_ENERGY: u16 = 2000;
/// Energy consumed by a successful `travel`; below this the attempt
/// auto-fails without consulting the world.
pub const TRAVEL_ENERGY: u16 = 10;
/// Initial stack pointer; the stack grows downward from here.
pub const STACK_TOP: u16 = MEMORY_WORDS;

const MEMORY_LEN: usize = MEMORY_WORDS as usize;
const REGISTER_LEN: usize = REGISTER_COUNT as usize;

/// Monotonic tick counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

/// Raised when a world cannot be built from its configuration.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a nanovat world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VatConfig {
    /// Grid width in cells.
    pub grid_width: u16,
    /// Grid height in cells.
    pub grid_height: u16,
    /// Number of entrant organisms running the compiled program.
    pub organism_count: u16,
    /// Number of drones running the built-in image.
    pub drone_count: u16,
    /// Number of sludge elements kept on the grid for the whole run.
    pub sludge_count: u16,
    /// Number of permanent collection points.
    pub collection_point_count: u16,
    /// Energy every organism spawns with.
    pub start_energy: u16,
    /// Run length; the simulation finishes when the tick counter reaches this.
    pub max_ticks: u64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for VatConfig {
    fn default() -> Self {
        Self {
            grid_width: 70,
            grid_height: 40,
            organism_count: 50,
            drone_count: 20,
            sludge_count: 200,
            collection_point_count: 10,
            start_energy: 10_000,
            max_ticks: 1_000_000,
            rng_seed: None,
        }
    }
}

impl VatConfig {
    /// Validates the configuration against the grid's capacity.
    ///
    /// Spawn and respawn placement both rejection-sample, so every populated
    /// layer must leave free cells behind.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(WorldError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        let cells = usize::from(self.grid_width) * usize::from(self.grid_height);
        let population = usize::from(self.organism_count) + usize::from(self.drone_count);
        if population > cells {
            return Err(WorldError::InvalidConfig(
                "organisms and drones cannot outnumber grid cells",
            ));
        }
        if population > usize::from(u16::MAX) {
            return Err(WorldError::InvalidConfig(
                "roster is limited to 65535 organisms",
            ));
        }
        let elements =
            usize::from(self.sludge_count) + usize::from(self.collection_point_count);
        if elements >= cells {
            return Err(WorldError::InvalidConfig(
                "sludge and collection points must leave at least one empty cell",
            ));
        }
        Ok(())
    }

    /// Returns the configured seed, drawing one from entropy if absent.
    fn resolve_seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }
}

/// The single shared random stream, threaded explicitly through world and
/// engine calls. Keeps its seed so snapshots can report it for replay.
#[derive(Debug, Clone)]
pub struct WorldRng {
    rng: SmallRng,
    seed: u64,
}

impl WorldRng {
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seed this stream was constructed with.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw in `[0, bound)`. A zero bound yields zero but still
    /// consumes one draw, so the stream position never depends on operand
    /// values.
    pub fn next_below(&mut self, bound: u16) -> u16 {
        let raw: u32 = self.rng.random();
        if bound == 0 {
            0
        } else {
            (raw % u32::from(bound)) as u16
        }
    }

    /// Full-width 16-bit draw, used for mutation masks.
    pub fn next_word(&mut self) -> u16 {
        self.rng.random()
    }
}

/// The 4-bit flag register. Bits are independently settable; only `cmp` and
/// `test` reset the whole register before writing their result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub success: bool,
    pub less: bool,
    pub equal: bool,
    pub greater: bool,
}

impl Flags {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Packed representation for compact display.
    #[must_use]
    pub fn bits(self) -> u8 {
        u8::from(self.success)
            | u8::from(self.less) << 1
            | u8::from(self.equal) << 2
            | u8::from(self.greater) << 3
    }
}

/// One program-memory corruption, recorded so the pre-mutation word stays
/// recoverable (`original = memory[address] ^ mask`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub address: u16,
    pub mask: u16,
}

/// What a successful `eat` consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meal {
    pub element: u16,
    pub toxic: bool,
}

/// World services consumed by the engine, one call per world-touching opcode.
///
/// Implementations must keep each call atomic with respect to the shared
/// grid; the scheduler guarantees no two organisms step concurrently.
pub trait Environment {
    /// Grid coordinates of the acting organism.
    fn position(&self) -> (u16, u16);
    /// Whether any organism stands on the cell.
    fn occupied(&self, x: u16, y: u16) -> bool;
    /// Element code at the cell; out-of-grid reads as empty.
    fn element_at(&self, x: u16, y: u16) -> u16;
    /// Move the acting organism one cell. Fails off-grid or into an occupied
    /// cell, leaving the position unchanged.
    fn attempt_move(&mut self, direction: u16) -> bool;
    /// Consume the element under the acting organism and respawn a
    /// replacement of the same type elsewhere. `None` when the cell is empty
    /// or a collection point.
    fn consume(&mut self) -> Option<Meal>;
    /// Deposit `amount` if the acting organism stands on a collection point.
    fn collect(&mut self, amount: u16) -> bool;
    /// Uniform draw in `[0, bound)` from the shared stream.
    fn next_random(&mut self, bound: u16) -> u16;
    /// Full-width draw from the shared stream.
    fn next_word(&mut self) -> u16;
}

/// Per-organism CPU state and the opcode dispatch.
#[derive(Debug, Clone)]
pub struct Cpu {
    registers: [u16; REGISTER_LEN],
    memory: Box<[u16; MEMORY_LEN]>,
    sp: u16,
    ip: u16,
    flags: Flags,
    energy: u16,
    mutation_immune: bool,
    mutations: Vec<MutationRecord>,
}

impl Cpu {
    /// Flash a program image and reset all execution state.
    #[must_use]
    pub fn new(image: &[u16; MEMORY_LEN], energy: u16, mutation_immune: bool) -> Self {
        Self {
            registers: [0; REGISTER_LEN],
            memory: Box::new(*image),
            sp: STACK_TOP,
            ip: 0,
            flags: Flags::default(),
            energy,
            mutation_immune,
            mutations: Vec::new(),
        }
    }

    #[must_use]
    pub fn energy(&self) -> u16 {
        self.energy
    }

    #[must_use]
    pub fn ip(&self) -> u16 {
        self.ip
    }

    #[must_use]
    pub fn sp(&self) -> u16 {
        self.sp
    }

    #[must_use]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    #[must_use]
    pub fn registers(&self) -> &[u16; REGISTER_LEN] {
        &self.registers
    }

    #[must_use]
    pub fn memory(&self) -> &[u16] {
        self.memory.as_slice()
    }

    #[must_use]
    pub fn mutations(&self) -> &[MutationRecord] {
        &self.mutations
    }

    /// An organism at zero energy is skipped by the scheduler.
    #[must_use]
    pub fn is_hibernating(&self) -> bool {
        self.energy == 0
    }

    /// Disassembly of the instruction the next step would execute.
    #[must_use]
    pub fn current_instruction(&self) -> String {
        let at = Self::aligned(self.ip);
        disassemble(self.fetch_at(at), at)
    }

    /// Round a miscomputed instruction pointer up to the next multiple of 3,
    /// modulo the memory size. Never traps.
    fn aligned(ip: u16) -> u16 {
        let ip = ip % MEMORY_WORDS;
        match ip % 3 {
            0 => ip,
            rem => (ip + (3 - rem)) % MEMORY_WORDS,
        }
    }

    fn fetch_at(&self, at: u16) -> [u16; 3] {
        let at = usize::from(at);
        [self.memory[at], self.memory[at + 1], self.memory[at + 2]]
    }

    /// Out-of-range register indices read as zero.
    fn register(&self, index: u16) -> u16 {
        self.registers.get(usize::from(index)).copied().unwrap_or(0)
    }

    /// Out-of-range register writes are discarded.
    fn set_register(&mut self, index: u16, value: u16) {
        if let Some(slot) = self.registers.get_mut(usize::from(index)) {
            *slot = value;
        }
    }

    /// Out-of-range memory reads as zero.
    fn mem_read(&self, address: u16) -> u16 {
        self.memory.get(usize::from(address)).copied().unwrap_or(0)
    }

    /// Out-of-range memory writes are discarded.
    fn mem_write(&mut self, address: u16, value: u16) {
        if let Some(cell) = self.memory.get_mut(usize::from(address)) {
            *cell = value;
        }
    }

    fn indexed_address(&self, register: u16, offset: u16, subtract: bool) -> u16 {
        let base = self.register(register);
        if subtract {
            base.wrapping_sub(offset)
        } else {
            base.wrapping_add(offset)
        }
    }

    fn read_operand(&self, operand: Operand) -> u16 {
        match operand {
            Operand::Direct(address) => self.mem_read(address),
            Operand::Register(index) => self.register(index),
            Operand::Immediate(value) => value,
            Operand::RegisterIndexed {
                register,
                offset,
                subtract,
            } => self.mem_read(self.indexed_address(register, offset, subtract)),
        }
    }

    /// Writes through an immediate operand have no destination and are
    /// discarded, the same policy as an out-of-range address.
    fn write_operand(&mut self, operand: Operand, value: u16) {
        match operand {
            Operand::Direct(address) => self.mem_write(address, value),
            Operand::Register(index) => self.set_register(index, value),
            Operand::Immediate(_) => {}
            Operand::RegisterIndexed {
                register,
                offset,
                subtract,
            } => self.mem_write(self.indexed_address(register, offset, subtract), value),
        }
    }

    /// A stack pointer outside `1..=3600` wraps to the top before the slot is
    /// claimed, so a runaway stack corrupts data instead of faulting.
    fn push(&mut self, value: u16) {
        if self.sp == 0 || self.sp > STACK_TOP {
            self.sp = STACK_TOP;
        }
        self.sp -= 1;
        self.memory[usize::from(self.sp)] = value;
    }

    /// Popping an empty (or out-of-range) stack yields zero and parks the
    /// pointer back at the top.
    fn pop(&mut self) -> u16 {
        if self.sp >= STACK_TOP {
            self.sp = STACK_TOP;
            return 0;
        }
        let value = self.memory[usize::from(self.sp)];
        self.sp += 1;
        value
    }

    fn mutate(&mut self, env: &mut dyn Environment) {
        let address = env.next_random(MEMORY_WORDS);
        let mask = env.next_word();
        self.memory[usize::from(address)] ^= mask;
        debug!(address, mask, "toxic meal corrupted program memory");
        self.mutations.push(MutationRecord { address, mask });
    }

    /// Execute exactly one instruction: fetch, decode, dispatch, advance,
    /// charge energy. Never fails; malformed bytecode degrades to `nop`.
    pub fn step(&mut self, env: &mut dyn Environment) {
        let at = Self::aligned(self.ip);
        let words = self.fetch_at(at);
        let mut next_ip = (at + 3) % MEMORY_WORDS;
        let mut cost: u16 = 1;

        if let Ok(instruction) = Instruction::decode(words, at) {
            let Instruction { opcode, op1, op2 } = instruction;
            match opcode {
                Opcode::Nop
                | Opcode::Charge
                | Opcode::Poke
                | Opcode::Peek
                | Opcode::Cksum => {}
                Opcode::Mov => {
                    let value = self.read_operand(op2);
                    self.write_operand(op1, value);
                }
                Opcode::Push => {
                    let value = self.read_operand(op1);
                    self.push(value);
                }
                Opcode::Pop => {
                    let value = self.pop();
                    self.write_operand(op1, value);
                }
                Opcode::Call => {
                    self.push(next_ip);
                    next_ip = self.read_operand(op1);
                }
                Opcode::Ret => {
                    next_ip = self.pop();
                }
                Opcode::Jmp
                | Opcode::Jl
                | Opcode::Jle
                | Opcode::Jg
                | Opcode::Jge
                | Opcode::Je
                | Opcode::Jne
                | Opcode::Js
                | Opcode::Jns => {
                    if self.jump_taken(opcode) {
                        next_ip = self.read_operand(op1);
                    }
                }
                Opcode::Add => self.binary_op(op1, op2, u16::wrapping_add),
                Opcode::Sub => self.binary_op(op1, op2, u16::wrapping_sub),
                Opcode::Mult => self.binary_op(op1, op2, u16::wrapping_mul),
                Opcode::Div => {
                    let divisor = self.read_operand(op2);
                    if divisor != 0 {
                        let value = self.read_operand(op1) / divisor;
                        self.write_operand(op1, value);
                    }
                }
                Opcode::Mod => {
                    let divisor = self.read_operand(op2);
                    if divisor != 0 {
                        let value = self.read_operand(op1) % divisor;
                        self.write_operand(op1, value);
                    }
                }
                Opcode::And => self.binary_op(op1, op2, |a, b| a & b),
                Opcode::Or => self.binary_op(op1, op2, |a, b| a | b),
                Opcode::Xor => self.binary_op(op1, op2, |a, b| a ^ b),
                Opcode::Shl => self.binary_op(op1, op2, shift_left),
                Opcode::Shr => self.binary_op(op1, op2, shift_right),
                Opcode::Cmp => {
                    let a = self.read_operand(op1);
                    let b = self.read_operand(op2);
                    self.flags.clear();
                    match a.cmp(&b) {
                        std::cmp::Ordering::Less => self.flags.less = true,
                        std::cmp::Ordering::Equal => self.flags.equal = true,
                        std::cmp::Ordering::Greater => self.flags.greater = true,
                    }
                }
                Opcode::Test => {
                    let a = self.read_operand(op1);
                    let b = self.read_operand(op2);
                    self.flags.clear();
                    self.flags.success = a & b == 0;
                }
                Opcode::Getxy => {
                    let (x, y) = env.position();
                    self.write_operand(op1, x);
                    self.write_operand(op2, y);
                }
                Opcode::Energy => {
                    let energy = self.energy;
                    self.write_operand(op1, energy);
                }
                Opcode::Travel => {
                    if self.energy < TRAVEL_ENERGY {
                        self.flags.success = false;
                    } else {
                        let direction = self.read_operand(op1) % 4;
                        let moved = env.attempt_move(direction);
                        self.flags.success = moved;
                        if moved {
                            cost = TRAVEL_ENERGY;
                        }
                    }
                }
                Opcode::Sense => {
                    let (x, y) = env.position();
                    let element = env.element_at(x, y);
                    self.write_operand(op1, element);
                    self.flags.success = element != EMPTY_CELL;
                }
                Opcode::Eat => {
                    if self.energy > u16::MAX - EAT_ENERGY {
                        self.flags.success = false;
                    } else if let Some(meal) = env.consume() {
                        self.energy += EAT_ENERGY;
                        self.flags.success = true;
                        if meal.toxic && !self.mutation_immune {
                            self.mutate(env);
                        }
                    } else {
                        self.flags.success = false;
                    }
                }
                Opcode::Rand => {
                    let bound = self.read_operand(op2);
                    let value = env.next_random(bound);
                    self.write_operand(op1, value);
                }
                Opcode::Release => {
                    let amount = self.read_operand(op1);
                    if amount <= self.energy && env.collect(amount) {
                        self.energy -= amount;
                        self.flags.success = true;
                    } else {
                        self.flags.success = false;
                    }
                }
            }
        }

        self.ip = next_ip;
        self.energy = self.energy.saturating_sub(cost);
    }

    fn jump_taken(&self, opcode: Opcode) -> bool {
        match opcode {
            Opcode::Jmp => true,
            Opcode::Jl => self.flags.less,
            Opcode::Jle => self.flags.less || self.flags.equal,
            Opcode::Jg => self.flags.greater,
            Opcode::Jge => self.flags.greater || self.flags.equal,
            Opcode::Je => self.flags.equal,
            Opcode::Jne => !self.flags.equal,
            Opcode::Js => self.flags.success,
            Opcode::Jns => !self.flags.success,
            _ => false,
        }
    }

    fn binary_op(&mut self, op1: Operand, op2: Operand, apply: impl Fn(u16, u16) -> u16) {
        let value = apply(self.read_operand(op1), self.read_operand(op2));
        self.write_operand(op1, value);
    }
}

/// Shifting by 16 or more clears the word rather than wrapping the shift
/// amount.
fn shift_left(value: u16, amount: u16) -> u16 {
    if amount < 16 { value << amount } else { 0 }
}

fn shift_right(value: u16, amount: u16) -> u16 {
    if amount < 16 { value >> amount } else { 0 }
}

/// Distinguishes entrant organisms from built-in drones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrganismKind {
    Standard,
    Drone,
}

impl OrganismKind {
    /// Drones shrug off toxic meals.
    #[must_use]
    pub fn mutation_immune(self) -> bool {
        matches!(self, Self::Drone)
    }
}

/// One roster entry. Position lives on the world, not here, so the engine can
/// borrow a CPU while the world answers occupancy queries.
#[derive(Debug)]
pub struct Organism {
    id: u16,
    kind: OrganismKind,
    cpu: Cpu,
}

impl Organism {
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> OrganismKind {
        self.kind
    }

    #[must_use]
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }
}

/// The shared element layer. Organisms occupy an independent layer tracked by
/// the world's position table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementGrid {
    width: u16,
    height: u16,
    cells: Vec<u16>,
}

impl ElementGrid {
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            cells: vec![EMPTY_CELL; usize::from(width) * usize::from(height)],
        }
    }

    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }

    /// Element code at the cell; out-of-grid reads as empty.
    #[must_use]
    pub fn get(&self, x: u16, y: u16) -> u16 {
        if x >= self.width || y >= self.height {
            return EMPTY_CELL;
        }
        self.cells[usize::from(y) * usize::from(self.width) + usize::from(x)]
    }

    fn set(&mut self, x: u16, y: u16, element: u16) {
        if x < self.width && y < self.height {
            self.cells[usize::from(y) * usize::from(self.width) + usize::from(x)] = element;
        }
    }

    #[must_use]
    pub fn cells(&self) -> &[u16] {
        &self.cells
    }

    /// Number of cells holding the given element code.
    #[must_use]
    pub fn count_of(&self, element: u16) -> usize {
        self.cells.iter().filter(|&&cell| cell == element).count()
    }
}

/// Program image flashed into every drone at spawn: a patrol loop that eats,
/// wanders, and guards nearby collection points.
pub const DRONE_IMAGE: [u16; 102] = [
    0x8004, 0x000F, 0x0000, 0x8004, 0x0018, 0x0000, 0x8004, 0x002A, 0x0000, 0x8004, 0x0045,
    0x0000, 0x8006, 0xFFF7, 0x0000, 0x2020, 0x0DFB, 0x0004, 0x2020, 0x0DFC, 0x000A, 0x200F,
    0x0DFC, 0x0001, 0x0005, 0x0000, 0x0000, 0x401E, 0x0002, 0x0000, 0x800E, 0x000F, 0x0000,
    0x401A, 0x0002, 0x0000, 0x6017, 0x0002, 0x2710, 0x8009, 0x0006, 0x0000, 0x001F, 0x0000,
    0x0000, 0x0005, 0x0000, 0x0000, 0x4001, 0x0000, 0x0DFB, 0x6020, 0x0001, 0x0DF8, 0x5024,
    0x0000, 0x0001, 0x800E, 0x0012, 0x0000, 0x7017, 0x0000, 0x1000, 0x800B, 0x000C, 0x0000,
    0x6020, 0x0001, 0x0E10, 0x7001, 0x0000, 0x1000, 0x1023, 0x0DFB, 0x0001, 0x0005, 0x0000,
    0x0000, 0x2017, 0x0DFC, 0x0000, 0x800B, 0x000F, 0x0000, 0x001B, 0x0DFB, 0x0000, 0x800E,
    0x0009, 0x0000, 0x2010, 0x0DFC, 0x0001, 0x0005, 0x0000, 0x0000, 0x8004, 0xFFAF, 0x0000,
    0x8006, 0xFFEB, 0x0000,
];

/// Read-only view of one organism for renderers and debuggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganismSnapshot {
    pub id: u16,
    pub kind: OrganismKind,
    pub x: u16,
    pub y: u16,
    pub energy: u16,
    pub ip: u16,
    pub sp: u16,
    pub flags: Flags,
    pub registers: [u16; REGISTER_LEN],
    pub hibernating: bool,
    pub mutations: Vec<MutationRecord>,
}

/// Read-only view of the whole simulation, sufficient for byte-for-byte
/// replay comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: Tick,
    pub score: u64,
    pub seed: u64,
    pub grid: ElementGrid,
    pub organisms: Vec<OrganismSnapshot>,
}

/// The shared world: grid, score, random stream, roster, and the tick driver.
#[derive(Debug)]
pub struct World {
    config: VatConfig,
    grid: ElementGrid,
    rng: WorldRng,
    score: u64,
    tick: Tick,
    roster: Vec<Organism>,
    positions: Vec<(u16, u16)>,
    toxic: Vec<u16>,
    sludge_types: u16,
}

impl World {
    /// Build a world and populate it. Setup draws from the random stream in a
    /// fixed order (sludge typing, toxic selection, element placement,
    /// collection points, spawns) so a seed reproduces the whole run.
    pub fn new(config: VatConfig, program: &[u16; MEMORY_LEN]) -> Result<Self, WorldError> {
        config.validate()?;
        let mut rng = WorldRng::from_seed(config.resolve_seed());
        let mut grid = ElementGrid::new(config.grid_width, config.grid_height);

        let sludge_types = (rng.next_below(255) / 8).max(5);
        let toxic: Vec<u16> = (0..sludge_types / 5)
            .map(|_| rng.next_below(sludge_types) + 1)
            .collect();

        for _ in 0..config.sludge_count {
            let element = rng.next_below(sludge_types) + 1;
            place_on_empty(&mut grid, &mut rng, element);
        }
        for _ in 0..config.collection_point_count {
            place_on_empty(&mut grid, &mut rng, COLLECTION_POINT);
        }

        let mut drone_program = [0u16; MEMORY_LEN];
        drone_program[..DRONE_IMAGE.len()].copy_from_slice(&DRONE_IMAGE);

        let population = usize::from(config.organism_count) + usize::from(config.drone_count);
        let mut roster = Vec::with_capacity(population);
        let mut positions = Vec::with_capacity(population);
        for id in 1..=population as u16 {
            let kind = if id <= config.organism_count {
                OrganismKind::Standard
            } else {
                OrganismKind::Drone
            };
            let image = match kind {
                OrganismKind::Standard => program,
                OrganismKind::Drone => &drone_program,
            };
            loop {
                let x = rng.next_below(config.grid_width);
                let y = rng.next_below(config.grid_height);
                if !positions.contains(&(x, y)) {
                    positions.push((x, y));
                    break;
                }
            }
            roster.push(Organism {
                id,
                kind,
                cpu: Cpu::new(image, config.start_energy, kind.mutation_immune()),
            });
        }

        info!(
            seed = rng.seed(),
            sludge_types,
            toxic_types = toxic.len(),
            organisms = config.organism_count,
            drones = config.drone_count,
            "world initialised"
        );

        Ok(Self {
            config,
            grid,
            rng,
            score: 0,
            tick: Tick(0),
            roster,
            positions,
            toxic,
            sludge_types,
        })
    }

    #[must_use]
    pub fn config(&self) -> &VatConfig {
        &self.config
    }

    #[must_use]
    pub fn grid(&self) -> &ElementGrid {
        &self.grid
    }

    #[must_use]
    pub fn score(&self) -> u64 {
        self.score
    }

    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    #[must_use]
    pub fn organisms(&self) -> &[Organism] {
        &self.roster
    }

    /// Number of distinct sludge type codes in play this run.
    #[must_use]
    pub fn sludge_type_count(&self) -> u16 {
        self.sludge_types
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.tick.0 >= self.config.max_ticks
    }

    /// Disassembly of the instruction the organism would execute next.
    #[must_use]
    pub fn current_disassembly(&self, index: usize) -> Option<String> {
        Some(self.roster.get(index)?.cpu.current_instruction())
    }

    /// Advance one tick: every organism with positive energy executes exactly
    /// one instruction, in roster order. Hibernating organisms are skipped
    /// without any state change.
    pub fn step(&mut self) {
        let Self {
            grid,
            rng,
            score,
            roster,
            positions,
            toxic,
            ..
        } = self;
        for index in 0..roster.len() {
            let organism = &mut roster[index];
            if organism.cpu.is_hibernating() {
                continue;
            }
            let mut env = WorldEnv {
                grid: &mut *grid,
                rng: &mut *rng,
                score: &mut *score,
                positions: &mut *positions,
                toxic: &*toxic,
                index,
            };
            organism.cpu.step(&mut env);
        }
        self.tick.0 += 1;
    }

    #[must_use]
    pub fn organism_snapshots(&self) -> Vec<OrganismSnapshot> {
        self.roster
            .iter()
            .zip(&self.positions)
            .map(|(organism, &(x, y))| OrganismSnapshot {
                id: organism.id,
                kind: organism.kind,
                x,
                y,
                energy: organism.cpu.energy,
                ip: organism.cpu.ip,
                sp: organism.cpu.sp,
                flags: organism.cpu.flags,
                registers: organism.cpu.registers,
                hibernating: organism.cpu.is_hibernating(),
                mutations: organism.cpu.mutations.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            score: self.score,
            seed: self.rng.seed(),
            grid: self.grid.clone(),
            organisms: self.organism_snapshots(),
        }
    }
}

/// Rejection-sample an empty element cell. Config validation guarantees one
/// exists.
fn place_on_empty(grid: &mut ElementGrid, rng: &mut WorldRng, element: u16) {
    loop {
        let x = rng.next_below(grid.width());
        let y = rng.next_below(grid.height());
        if grid.get(x, y) == EMPTY_CELL {
            grid.set(x, y, element);
            return;
        }
    }
}

/// [`Environment`] view the scheduler hands to one stepping organism. Borrows
/// the world's shared pieces disjointly from the acting CPU.
struct WorldEnv<'a> {
    grid: &'a mut ElementGrid,
    rng: &'a mut WorldRng,
    score: &'a mut u64,
    positions: &'a mut Vec<(u16, u16)>,
    toxic: &'a [u16],
    index: usize,
}

impl Environment for WorldEnv<'_> {
    fn position(&self) -> (u16, u16) {
        self.positions[self.index]
    }

    fn occupied(&self, x: u16, y: u16) -> bool {
        self.positions.iter().any(|&p| p == (x, y))
    }

    fn element_at(&self, x: u16, y: u16) -> u16 {
        self.grid.get(x, y)
    }

    fn attempt_move(&mut self, direction: u16) -> bool {
        let (x, y) = self.positions[self.index];
        let target = match direction % 4 {
            0 => (y > 0).then(|| (x, y - 1)),
            1 => (y + 1 < self.grid.height()).then(|| (x, y + 1)),
            2 => (x + 1 < self.grid.width()).then(|| (x + 1, y)),
            _ => (x > 0).then(|| (x - 1, y)),
        };
        let Some(target) = target else {
            return false;
        };
        if self.occupied(target.0, target.1) {
            return false;
        }
        self.positions[self.index] = target;
        true
    }

    fn consume(&mut self) -> Option<Meal> {
        let (x, y) = self.positions[self.index];
        let element = self.grid.get(x, y);
        if element == EMPTY_CELL || element == COLLECTION_POINT {
            return None;
        }
        self.grid.set(x, y, EMPTY_CELL);
        // Respawn on the element layer only; a cell under an organism is a
        // valid target, and so is the cell just vacated.
        place_on_empty(self.grid, self.rng, element);
        Some(Meal {
            element,
            toxic: self.toxic.contains(&element),
        })
    }

    fn collect(&mut self, amount: u16) -> bool {
        let (x, y) = self.positions[self.index];
        if self.grid.get(x, y) == COLLECTION_POINT {
            *self.score += u64::from(amount);
            true
        } else {
            false
        }
    }

    fn next_random(&mut self, bound: u16) -> u16 {
        self.rng.next_below(bound)
    }

    fn next_word(&mut self) -> u16 {
        self.rng.next_word()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn image_from(source: &str) -> Box<[u16; MEMORY_LEN]> {
        nanovat_asm::compile(source).expect("program compiles").image
    }

    fn cpu_running(source: &str, energy: u16) -> Cpu {
        Cpu::new(&image_from(source), energy, false)
    }

    /// Canned world services for engine tests.
    #[derive(Default)]
    struct StubEnv {
        position: (u16, u16),
        element: u16,
        toxic: bool,
        block_moves: bool,
        on_collection_point: bool,
        draws: VecDeque<u16>,
        moves_attempted: Vec<u16>,
        meals_served: usize,
        collected: u64,
    }

    impl Environment for StubEnv {
        fn position(&self) -> (u16, u16) {
            self.position
        }

        fn occupied(&self, _x: u16, _y: u16) -> bool {
            self.block_moves
        }

        fn element_at(&self, _x: u16, _y: u16) -> u16 {
            self.element
        }

        fn attempt_move(&mut self, direction: u16) -> bool {
            self.moves_attempted.push(direction);
            !self.block_moves
        }

        fn consume(&mut self) -> Option<Meal> {
            if self.element == EMPTY_CELL || self.element == COLLECTION_POINT {
                return None;
            }
            self.meals_served += 1;
            Some(Meal {
                element: self.element,
                toxic: self.toxic,
            })
        }

        fn collect(&mut self, amount: u16) -> bool {
            if self.on_collection_point {
                self.collected += u64::from(amount);
                true
            } else {
                false
            }
        }

        fn next_random(&mut self, _bound: u16) -> u16 {
            self.draws.pop_front().unwrap_or(0)
        }

        fn next_word(&mut self) -> u16 {
            self.draws.pop_front().unwrap_or(0)
        }
    }

    #[test]
    fn div_and_mod_by_zero_are_skipped_operations() {
        let mut cpu = cpu_running("mov r0, 9\ndiv r0, 0\nmod r0, 0\n", 100);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        cpu.step(&mut env);
        cpu.step(&mut env);
        assert_eq!(cpu.register(0), 9);
        assert_eq!(cpu.ip(), 9);
        assert_eq!(cpu.energy(), 97);
    }

    #[test]
    fn arithmetic_wraps_modulo_65536() {
        let mut cpu = cpu_running("mov r0, 0xFFFF\nadd r0, 2\nmov r1, 3\nmult r1, 0x8000\n", 100);
        let mut env = StubEnv::default();
        for _ in 0..4 {
            cpu.step(&mut env);
        }
        assert_eq!(cpu.register(0), 1);
        assert_eq!(cpu.register(1), 0x8000);
    }

    #[test]
    fn shifts_of_sixteen_or_more_clear_the_word() {
        let mut cpu = cpu_running("mov r0, 0xFFFF\nshl r0, 16\nmov r1, 0xFFFF\nshr r1, 20\n", 100);
        let mut env = StubEnv::default();
        for _ in 0..4 {
            cpu.step(&mut env);
        }
        assert_eq!(cpu.register(0), 0);
        assert_eq!(cpu.register(1), 0);
    }

    #[test]
    fn cmp_resets_flags_and_sets_exactly_one() {
        let mut cpu = cpu_running("cmp r0, 5\ncmp r0, r1\n", 100);
        cpu.flags.success = true;
        cpu.flags.greater = true;
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert_eq!(
            cpu.flags(),
            Flags {
                less: true,
                ..Flags::default()
            }
        );
        cpu.step(&mut env);
        assert_eq!(
            cpu.flags(),
            Flags {
                equal: true,
                ..Flags::default()
            }
        );
    }

    #[test]
    fn test_sets_success_iff_and_is_zero() {
        let mut cpu = cpu_running("mov r0, 0x0F\ntest r0, 0xF0\ntest r0, 0x01\n", 100);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        cpu.step(&mut env);
        assert!(cpu.flags().success);
        cpu.step(&mut env);
        assert!(!cpu.flags().success);
    }

    #[test]
    fn call_pushes_the_return_address_and_ret_pops_it() {
        let mut cpu = cpu_running("call routine\nnop\nroutine:\nret\n", 100);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert_eq!(cpu.ip(), 6);
        assert_eq!(cpu.sp(), STACK_TOP - 1);
        assert_eq!(cpu.memory()[usize::from(STACK_TOP - 1)], 3);
        cpu.step(&mut env);
        assert_eq!(cpu.ip(), 3);
        assert_eq!(cpu.sp(), STACK_TOP);
    }

    #[test]
    fn conditional_jumps_follow_the_flag_register() {
        let mut cpu = cpu_running("cmp r0, r1\nje target\nnop\ntarget:\nnop\n", 100);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        cpu.step(&mut env);
        assert_eq!(cpu.ip(), 9);

        let mut cpu = cpu_running("cmp r0, 1\nje target\nnop\ntarget:\nnop\n", 100);
        cpu.step(&mut env);
        cpu.step(&mut env);
        assert_eq!(cpu.ip(), 6);
    }

    #[test]
    fn push_wraps_a_runaway_stack_pointer_to_the_top() {
        let mut cpu = cpu_running("push 7\npush 8\n", 100);
        cpu.sp = 0;
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert_eq!(cpu.sp(), STACK_TOP - 1);
        assert_eq!(cpu.memory()[usize::from(STACK_TOP - 1)], 7);
        cpu.step(&mut env);
        assert_eq!(cpu.sp(), STACK_TOP - 2);
        assert_eq!(cpu.memory()[usize::from(STACK_TOP - 2)], 8);
    }

    #[test]
    fn popping_an_empty_stack_reads_zero() {
        let mut cpu = cpu_running("mov r0, 5\npop r0\n", 100);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        cpu.step(&mut env);
        assert_eq!(cpu.register(0), 0);
        assert_eq!(cpu.sp(), STACK_TOP);
    }

    #[test]
    fn misaligned_instruction_pointer_rounds_up() {
        let mut cpu = cpu_running("nop\nnop\nmov r0, 5\n", 100);
        cpu.ip = 4;
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert_eq!(cpu.register(0), 5);
        assert_eq!(cpu.ip(), 9);
    }

    #[test]
    fn out_of_range_registers_read_zero_and_discard_writes() {
        let mut image = [0u16; MEMORY_LEN];
        let read = Instruction {
            opcode: Opcode::Mov,
            op1: Operand::Register(0),
            op2: Operand::Register(20),
        }
        .encode(0);
        let write = Instruction {
            opcode: Opcode::Mov,
            op1: Operand::Register(20),
            op2: Operand::Immediate(9),
        }
        .encode(3);
        image[..3].copy_from_slice(&read);
        image[3..6].copy_from_slice(&write);

        let mut cpu = Cpu::new(&image, 100, false);
        cpu.registers[0] = 7;
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert_eq!(cpu.register(0), 0);
        cpu.step(&mut env);
        assert_eq!(cpu.registers(), &[0u16; REGISTER_LEN]);
        assert_eq!(cpu.energy(), 98);
    }

    #[test]
    fn out_of_range_memory_reads_zero_and_discards_writes() {
        let mut image = [0u16; MEMORY_LEN];
        let write = Instruction {
            opcode: Opcode::Mov,
            op1: Operand::Direct(5000),
            op2: Operand::Immediate(9),
        }
        .encode(0);
        let read = Instruction {
            opcode: Opcode::Mov,
            op1: Operand::Register(1),
            op2: Operand::Direct(5000),
        }
        .encode(3);
        image[..3].copy_from_slice(&write);
        image[3..6].copy_from_slice(&read);

        let mut cpu = Cpu::new(&image, 100, false);
        cpu.registers[1] = 7;
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        cpu.step(&mut env);
        assert_eq!(cpu.register(1), 0);
    }

    #[test]
    fn unknown_opcodes_execute_as_nop() {
        let mut image = [0u16; MEMORY_LEN];
        image[0] = 0x0030;
        let mut cpu = Cpu::new(&image, 100, false);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert_eq!(cpu.ip(), 3);
        assert_eq!(cpu.energy(), 99);
        assert_eq!(cpu.flags(), Flags::default());
    }

    #[test]
    fn reserved_opcodes_execute_as_nop() {
        let mut cpu = cpu_running(
            "charge r0, r1\npoke r0, r1\npeek r0, r1\ncksum r0, r1\n",
            100,
        );
        let mut env = StubEnv::default();
        for _ in 0..4 {
            cpu.step(&mut env);
        }
        assert_eq!(cpu.ip(), 12);
        assert_eq!(cpu.energy(), 96);
        assert_eq!(cpu.registers(), &[0u16; REGISTER_LEN]);
    }

    #[test]
    fn travel_charges_ten_on_success_and_one_on_failure() {
        let mut cpu = cpu_running("travel 2\n", 10);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert!(cpu.flags().success);
        assert_eq!(cpu.energy(), 0);
        assert_eq!(env.moves_attempted, vec![2]);

        let mut cpu = cpu_running("travel 2\n", 9);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert!(!cpu.flags().success);
        assert_eq!(cpu.energy(), 8);
        assert!(env.moves_attempted.is_empty());
    }

    #[test]
    fn blocked_travel_fails_and_charges_one() {
        let mut cpu = cpu_running("travel 1\n", 100);
        let mut env = StubEnv {
            block_moves: true,
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert!(!cpu.flags().success);
        assert_eq!(cpu.energy(), 99);
    }

    #[test]
    fn eat_grants_energy_and_fails_near_the_ceiling() {
        let ceiling = u16::MAX - EAT_ENERGY;

        let mut cpu = cpu_running("eat\n", ceiling);
        let mut env = StubEnv {
            element: 3,
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert!(cpu.flags().success);
        assert_eq!(cpu.energy(), u16::MAX - 1);
        assert_eq!(env.meals_served, 1);

        let mut cpu = cpu_running("eat\n", ceiling + 1);
        let mut env = StubEnv {
            element: 3,
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert!(!cpu.flags().success);
        assert_eq!(cpu.energy(), ceiling);
        assert_eq!(env.meals_served, 0);
    }

    #[test]
    fn eat_fails_on_empty_cells_and_collection_points() {
        for element in [EMPTY_CELL, COLLECTION_POINT] {
            let mut cpu = cpu_running("eat\n", 100);
            let mut env = StubEnv {
                element,
                ..StubEnv::default()
            };
            cpu.step(&mut env);
            assert!(!cpu.flags().success);
            assert_eq!(cpu.energy(), 99);
        }
    }

    #[test]
    fn toxic_meals_xor_one_word_and_log_the_mask() {
        let mut cpu = cpu_running("eat\n", 100);
        let before = cpu.memory()[50];
        let mut env = StubEnv {
            element: 3,
            toxic: true,
            draws: VecDeque::from([50, 0x00FF]),
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert_eq!(cpu.memory()[50], before ^ 0x00FF);
        assert_eq!(
            cpu.mutations(),
            &[MutationRecord {
                address: 50,
                mask: 0x00FF
            }]
        );
    }

    #[test]
    fn drones_are_immune_to_mutation() {
        let mut cpu = Cpu::new(&image_from("eat\n"), 100, true);
        let snapshot: Vec<u16> = cpu.memory().to_vec();
        let mut env = StubEnv {
            element: 3,
            toxic: true,
            draws: VecDeque::from([50, 0x00FF]),
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert!(cpu.flags().success);
        assert_eq!(cpu.memory(), snapshot.as_slice());
        assert!(cpu.mutations().is_empty());
        // Immunity consumes no draws.
        assert_eq!(env.draws.len(), 2);
    }

    #[test]
    fn release_needs_funds_and_a_collection_point() {
        let mut cpu = cpu_running("release 50\nrelease 200\n", 100);
        let mut env = StubEnv {
            on_collection_point: true,
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert!(cpu.flags().success);
        assert_eq!(cpu.energy(), 49);
        assert_eq!(env.collected, 50);
        cpu.step(&mut env);
        assert!(!cpu.flags().success);
        assert_eq!(cpu.energy(), 48);
        assert_eq!(env.collected, 50);

        let mut cpu = cpu_running("release 50\n", 100);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert!(!cpu.flags().success);
        assert_eq!(cpu.energy(), 99);
    }

    #[test]
    fn release_touches_only_the_success_flag() {
        let mut cpu = cpu_running("cmp r0, 1\nrelease 50\n", 100);
        let mut env = StubEnv {
            on_collection_point: true,
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        cpu.step(&mut env);
        assert_eq!(
            cpu.flags(),
            Flags {
                success: true,
                less: true,
                ..Flags::default()
            }
        );
    }

    #[test]
    fn sense_reports_the_element_under_the_organism() {
        let mut cpu = cpu_running("sense r0\n", 100);
        let mut env = StubEnv {
            element: 7,
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert_eq!(cpu.register(0), 7);
        assert!(cpu.flags().success);

        let mut cpu = cpu_running("sense r0\n", 100);
        let mut env = StubEnv::default();
        cpu.step(&mut env);
        assert_eq!(cpu.register(0), 0);
        assert!(!cpu.flags().success);
    }

    #[test]
    fn getxy_and_energy_report_observable_state() {
        let mut cpu = cpu_running("getxy r0, r1\nenergy r2\n", 100);
        let mut env = StubEnv {
            position: (12, 34),
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert_eq!(cpu.register(0), 12);
        assert_eq!(cpu.register(1), 34);
        cpu.step(&mut env);
        assert_eq!(cpu.register(2), 99);
    }

    #[test]
    fn rand_writes_the_environment_draw() {
        let mut cpu = cpu_running("rand r0, 10\n", 100);
        let mut env = StubEnv {
            draws: VecDeque::from([5]),
            ..StubEnv::default()
        };
        cpu.step(&mut env);
        assert_eq!(cpu.register(0), 5);
        assert!(env.draws.is_empty());
    }

    #[test]
    fn indexed_operands_address_through_registers() {
        let mut cpu = cpu_running(
            "mov r1, 60\nmov [r1+2], 9\nmov r0, [r1+2]\nmov r2, [r1-60]\n",
            100,
        );
        let mut env = StubEnv::default();
        for _ in 0..4 {
            cpu.step(&mut env);
        }
        assert_eq!(cpu.memory()[62], 9);
        assert_eq!(cpu.register(0), 9);
        // [r1-60] is address 0, the first word of the program itself.
        assert_eq!(cpu.register(2), cpu.memory()[0]);
    }

    #[test]
    fn world_rng_zero_bound_draws_but_yields_zero() {
        let mut a = WorldRng::from_seed(7);
        let mut b = WorldRng::from_seed(7);
        assert_eq!(a.next_below(0), 0);
        b.next_below(100);
        // Both streams advanced by one draw.
        assert_eq!(a.next_below(1000), b.next_below(1000));
    }

    #[test]
    fn config_defaults_validate() {
        VatConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn config_rejects_overpopulation() {
        let config = VatConfig {
            grid_width: 5,
            grid_height: 5,
            organism_count: 30,
            drone_count: 0,
            sludge_count: 3,
            collection_point_count: 1,
            ..VatConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WorldError::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_rejects_a_fully_paved_grid() {
        let config = VatConfig {
            grid_width: 4,
            grid_height: 4,
            organism_count: 2,
            drone_count: 0,
            sludge_count: 15,
            collection_point_count: 1,
            ..VatConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WorldError::InvalidConfig(_))
        ));
    }

    fn small_config(seed: u64) -> VatConfig {
        VatConfig {
            grid_width: 20,
            grid_height: 10,
            organism_count: 8,
            drone_count: 2,
            sludge_count: 100,
            collection_point_count: 4,
            start_energy: 10_000,
            max_ticks: 1_000,
            rng_seed: Some(seed),
        }
    }

    #[test]
    fn world_setup_places_everything_without_overlap() {
        let program = image_from("nop\n");
        let world = World::new(small_config(11), &program).expect("world builds");

        assert_eq!(world.organisms().len(), 10);
        let snapshots = world.organism_snapshots();
        let mut seen = std::collections::BTreeSet::new();
        for snapshot in &snapshots {
            assert!(seen.insert((snapshot.x, snapshot.y)), "spawns must not overlap");
        }
        assert_eq!(world.grid().count_of(COLLECTION_POINT), 4);
        let sludge: usize = world
            .grid()
            .cells()
            .iter()
            .filter(|&&cell| cell != EMPTY_CELL && cell != COLLECTION_POINT)
            .count();
        assert_eq!(sludge, 100);
        assert!(world.sludge_type_count() >= 5);
    }

    #[test]
    fn drones_run_the_built_in_image() {
        let program = image_from("nop\n");
        let world = World::new(small_config(11), &program).expect("world builds");
        let drone = world
            .organisms()
            .iter()
            .find(|organism| organism.kind() == OrganismKind::Drone)
            .expect("roster has drones");
        assert_eq!(&drone.cpu().memory()[..DRONE_IMAGE.len()], &DRONE_IMAGE);
        assert!(drone.kind().mutation_immune());
    }

    #[test]
    fn eating_keeps_per_type_resource_totals_constant() {
        let program = image_from(
            "main:\n\
             eat\n\
             rand r0, 4\n\
             travel r0\n\
             jmp main\n",
        );
        let mut world = World::new(small_config(23), &program).expect("world builds");
        let counts_by_type = |world: &World| {
            let mut counts = std::collections::BTreeMap::new();
            for &cell in world.grid().cells() {
                if cell != EMPTY_CELL && cell != COLLECTION_POINT {
                    *counts.entry(cell).or_insert(0usize) += 1;
                }
            }
            counts
        };
        let before = counts_by_type(&world);
        for _ in 0..500 {
            world.step();
        }
        assert_eq!(counts_by_type(&world), before);
        // Half the grid is sludge, so with eat-first programs some meal
        // must have happened.
        let fed = world
            .organism_snapshots()
            .iter()
            .any(|snapshot| snapshot.energy > world.config().start_energy);
        assert!(fed, "expected at least one successful eat in 500 ticks");
    }

    #[test]
    fn collection_points_survive_hungry_organisms() {
        let program = image_from(
            "main:\n\
             eat\n\
             rand r0, 4\n\
             travel r0\n\
             jmp main\n",
        );
        let mut world = World::new(small_config(31), &program).expect("world builds");
        for _ in 0..500 {
            world.step();
        }
        assert_eq!(world.grid().count_of(COLLECTION_POINT), 4);
    }

    #[test]
    fn seeded_runs_are_deterministic() {
        let program = image_from(
            "main:\n\
             sense r1\n\
             jns wander\n\
             eat\n\
             wander:\n\
             rand r0, 4\n\
             travel r0\n\
             jmp main\n",
        );
        let mut first = World::new(small_config(42), &program).expect("world builds");
        let mut second = World::new(small_config(42), &program).expect("world builds");
        for _ in 0..300 {
            first.step();
            second.step();
        }
        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn different_seeds_diverge() {
        let program = image_from("main:\nrand r0, 4\ntravel r0\njmp main\n");
        let mut first = World::new(small_config(1), &program).expect("world builds");
        let mut second = World::new(small_config(2), &program).expect("world builds");
        for _ in 0..100 {
            first.step();
            second.step();
        }
        assert_ne!(first.snapshot().grid, second.snapshot().grid);
    }

    #[test]
    fn hibernating_organisms_are_skipped_entirely() {
        let program = image_from("main:\nnop\njmp main\n");
        let config = VatConfig {
            start_energy: 0,
            ..small_config(5)
        };
        let mut world = World::new(config, &program).expect("world builds");
        for _ in 0..10 {
            world.step();
        }
        assert_eq!(world.tick(), Tick(10));
        for snapshot in world.organism_snapshots() {
            assert!(snapshot.hibernating);
            assert_eq!(snapshot.ip, 0);
            assert_eq!(snapshot.energy, 0);
        }
    }

    #[test]
    fn run_finishes_at_the_tick_limit() {
        let program = image_from("nop\n");
        let config = VatConfig {
            max_ticks: 3,
            ..small_config(5)
        };
        let mut world = World::new(config, &program).expect("world builds");
        while !world.is_finished() {
            world.step();
        }
        assert_eq!(world.tick(), Tick(3));
    }

    #[test]
    fn current_disassembly_renders_the_next_instruction() {
        let program = image_from("mov r0, 5\n");
        let world = World::new(small_config(5), &program).expect("world builds");
        let listing = world.current_disassembly(0).expect("organism exists");
        assert_eq!(listing, "mov r0, 5");
        assert!(world.current_disassembly(999).is_none());
    }

    #[test]
    fn drone_image_round_trips_through_the_assembler() {
        let mut image = [0u16; MEMORY_LEN];
        image[..DRONE_IMAGE.len()].copy_from_slice(&DRONE_IMAGE);

        let mut listing = String::new();
        for ip in (0..DRONE_IMAGE.len() as u16).step_by(3) {
            let at = usize::from(ip);
            let words = [image[at], image[at + 1], image[at + 2]];
            listing.push_str(&disassemble(words, ip));
            listing.push('\n');
        }

        let reassembled = nanovat_asm::compile(&listing).expect("listing reassembles");
        assert_eq!(&reassembled.image[..DRONE_IMAGE.len()], &DRONE_IMAGE);
    }
}
