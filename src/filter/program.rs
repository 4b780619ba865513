//! # Filter Program Builder
//!
//! Builds the classic BPF program attached to monitor-mode receive sockets.

use crate::protocol::addressing::*;

/// Accepted frames are truncated to this many bytes
pub const MAX_CAPTURE_LEN: u32 = 0x0004_0000; // 262144

/// Kernel limit on program length (`BPF_MAXINSNS`)
pub const BPF_MAXINSNS: usize = 4096;

// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// LD/LDX sizes
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

// LD/LDX modes
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xa0;

// ALU operations
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;

// JMP operations
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

// Operand source
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

// RET operand
pub const BPF_A: u16 = 0x10;

// MISC operations
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// One classic BPF instruction, laid out like the kernel's `struct sock_filter`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterInstruction {
    /// Opcode: class | size | mode (or operation | source)
    pub code: u16,
    /// Relative jump when the condition holds
    pub jt: u8,
    /// Relative jump when the condition fails
    pub jf: u8,
    /// Generic operand (constant, offset, scratch slot)
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<FilterInstruction>() == 8);

impl FilterInstruction {
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    pub const fn class(&self) -> u16 {
        self.code & 0x07
    }
}

/// Immutable, ordered sequence of filter instructions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterProgram {
    instructions: Vec<FilterInstruction>,
}

impl FilterProgram {
    /// Wrap an instruction list; see [`FilterProgram::validate`] for checks
    pub fn from_instructions(instructions: Vec<FilterInstruction>) -> Self {
        Self { instructions }
    }

    pub fn instructions(&self) -> &[FilterInstruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Instruction slots carrying per-link operands
pub const SLOT_COMM_ID: usize = 11;
pub const SLOT_DIRECTION: usize = 13;
pub const SLOT_VERSION_PORT: usize = 15;
pub const SLOT_DIRECTION_CONFIRM: usize = 17;

/// Parameters of one receiver's kernel filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFilter {
    pub comm_id: CommId,
    pub direction: Direction,
    pub port: Port,
    pub version: u8,
    pub capture_len: u32,
}

impl LinkFilter {
    /// Filter for the current protocol version and default capture cap
    pub fn new(comm_id: CommId, direction: Direction, port: Port) -> Self {
        Self {
            comm_id,
            direction,
            port,
            version: PROTOCOL_VERSION,
            capture_len: MAX_CAPTURE_LEN,
        }
    }

    /// Operand matched against the address-1 marker and direction halfword
    pub fn direction_operand(&self) -> u32 {
        ((ADDR_MARKER as u32) << 8) | self.direction.as_byte() as u32
    }

    /// Operand matched against the version and port halfword
    pub fn version_port_operand(&self) -> u32 {
        ((self.version as u32) << 8) | self.port.as_byte() as u32
    }

    /// Build the filter program
    ///
    /// Every call returns a freshly allocated program; nothing is shared
    /// between builds.
    ///
    /// ```text
    ///  [0]  ldb  [3]                  radiotap it_len, high byte
    ///  [1]  lsh  #8
    ///  [2]  tax
    ///  [3]  ldb  [2]                  radiotap it_len, low byte
    ///  [4]  or   x
    ///  [5]  st   M[0]
    ///  [6]  tax                       X = radiotap length
    ///  [7]  ldb  [x+0]                frame control
    ///  [8]  jset #0x08   jt=1 jf=0    data frame -> [10]
    ///  [9]  jset #0x80   jt=0 jf=9    beacon -> [10], else -> [19]
    ///  [10] ld   [x+6]                comm id
    ///  [11] jeq  #comm_id      jf=7
    ///  [12] ldh  [x+4]                marker + direction
    ///  [13] jeq  #0x01<dir>    jf=5
    ///  [14] ldh  [x+16]               version + port
    ///  [15] jeq  #<ver><port>  jf=3
    ///  [16] ldb  [x+18]               direction confirmation
    ///  [17] jeq  #<dir>        jf=1
    ///  [18] ret  #capture_len         accept and truncate
    ///  [19] ret  #0                   reject
    /// ```
    pub fn build(&self) -> FilterProgram {
        use FilterInstruction as I;

        let instructions = vec![
            I::stmt(BPF_LD | BPF_B | BPF_ABS, RADIOTAP_LEN_OFFSET + 1),
            I::stmt(BPF_ALU | BPF_LSH | BPF_K, 8),
            I::stmt(BPF_MISC | BPF_TAX, 0),
            I::stmt(BPF_LD | BPF_B | BPF_ABS, RADIOTAP_LEN_OFFSET),
            I::stmt(BPF_ALU | BPF_OR | BPF_X, 0),
            I::stmt(BPF_ST, 0),
            I::stmt(BPF_MISC | BPF_TAX, 0),
            I::stmt(BPF_LD | BPF_B | BPF_IND, OFFSET_FRAME_CONTROL),
            I::jump(BPF_JMP | BPF_JSET | BPF_K, FRAME_CONTROL_DATA as u32, 1, 0),
            I::jump(BPF_JMP | BPF_JSET | BPF_K, FRAME_CONTROL_BEACON as u32, 0, 9),
            I::stmt(BPF_LD | BPF_W | BPF_IND, OFFSET_COMM_ID),
            I::jump(BPF_JMP | BPF_JEQ | BPF_K, self.comm_id.as_u32(), 0, 7),
            I::stmt(BPF_LD | BPF_H | BPF_IND, OFFSET_ADDR_MARKER),
            I::jump(BPF_JMP | BPF_JEQ | BPF_K, self.direction_operand(), 0, 5),
            I::stmt(BPF_LD | BPF_H | BPF_IND, OFFSET_VERSION),
            I::jump(BPF_JMP | BPF_JEQ | BPF_K, self.version_port_operand(), 0, 3),
            I::stmt(BPF_LD | BPF_B | BPF_IND, OFFSET_DIRECTION_CONFIRM),
            I::jump(BPF_JMP | BPF_JEQ | BPF_K, self.direction.as_byte() as u32, 0, 1),
            I::stmt(BPF_RET | BPF_K, self.capture_len),
            I::stmt(BPF_RET | BPF_K, 0),
        ];

        FilterProgram::from_instructions(instructions)
    }
}

/// Build the kernel filter for one receiver
///
/// # Arguments
///
/// * `comm_id` - Communication id of the link instance
/// * `direction` - Direction of frames this receiver accepts
/// * `port` - Logical channel of the receiving module
///
/// # Examples
///
/// ```
/// use db_link::filter::build_filter;
/// use db_link::protocol::{CommId, Direction, Port};
///
/// let program = build_filter(
///     CommId::new([0xAA, 0xBB, 0xCC, 0xDD]),
///     Direction::TowardVehicle,
///     Port::CONTROLLER,
/// );
/// assert_eq!(program.len(), 20);
/// ```
pub fn build_filter(comm_id: CommId, direction: Direction, port: Port) -> FilterProgram {
    LinkFilter::new(comm_id, direction, port).build()
}
