//! # Filter Interpreter
//!
//! User-space evaluation of classic BPF programs.
//!
//! The kernel gives no feedback on which frames a socket filter drops, so the
//! only way to check a program against the wire layout is to run it here on
//! synthetic captures. Semantics follow the Linux classic BPF interpreter:
//! out-of-bounds packet loads end the program with a return value of 0, and
//! the return value caps the number of bytes delivered.

use std::io;

use super::program::*;

/// Scratch memory slots (`BPF_MEMWORDS`)
pub const BPF_MEMWORDS: usize = 16;

/// Outcome of running a filter program against one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Deliver the frame, truncated to `capture_len` bytes
    Accept { capture_len: usize },
    /// Drop the frame
    Reject,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn load(frame: &[u8], offset: u32, size: u16) -> Option<u32> {
    let start = offset as usize;
    let width = match size {
        BPF_W => 4,
        BPF_H => 2,
        BPF_B => 1,
        _ => return None,
    };
    let bytes = frame.get(start..start.checked_add(width)?)?;
    Some(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

/// Opcodes the kernel accepts in a classic socket filter
fn is_known_opcode(code: u16) -> bool {
    const FIXED: &[u16] = &[
        BPF_LD | BPF_W | BPF_ABS,
        BPF_LD | BPF_H | BPF_ABS,
        BPF_LD | BPF_B | BPF_ABS,
        BPF_LD | BPF_W | BPF_IND,
        BPF_LD | BPF_H | BPF_IND,
        BPF_LD | BPF_B | BPF_IND,
        BPF_LD | BPF_W | BPF_LEN,
        BPF_LD | BPF_IMM,
        BPF_LD | BPF_MEM,
        BPF_LDX | BPF_W | BPF_LEN,
        BPF_LDX | BPF_B | BPF_MSH,
        BPF_LDX | BPF_IMM,
        BPF_LDX | BPF_MEM,
        BPF_ST,
        BPF_STX,
        BPF_MISC | BPF_TAX,
        BPF_MISC | BPF_TXA,
        BPF_RET | BPF_K,
        BPF_RET | BPF_A,
        BPF_ALU | BPF_NEG,
        BPF_JMP | BPF_JA,
    ];

    if FIXED.contains(&code) {
        return true;
    }

    // Binary ALU operations and conditional jumps take K or X
    let op = code & 0xf0;
    match code & !(BPF_X | 0xf0) {
        BPF_ALU => matches!(
            op,
            BPF_ADD | BPF_SUB | BPF_MUL | BPF_DIV | BPF_MOD | BPF_AND | BPF_OR | BPF_XOR
                | BPF_LSH | BPF_RSH
        ),
        BPF_JMP => matches!(op, BPF_JEQ | BPF_JGT | BPF_JGE | BPF_JSET),
        _ => false,
    }
}

fn is_conditional_jump(code: u16) -> bool {
    code & 0x07 == BPF_JMP && code & 0xf0 != BPF_JA
}

impl FilterProgram {
    /// Checks the kernel applies before accepting a socket filter
    ///
    /// Loads from the ancillary area (`k >= SKF_AD_OFF`) are left to the
    /// kernel; [`FilterProgram::run`] treats them as out-of-range loads.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidInput` error if:
    /// - The program is empty or longer than `BPF_MAXINSNS`
    /// - An opcode is unknown (including `ret x`)
    /// - A constant divisor is zero or a constant shift is 32 or more
    /// - A jump lands outside the program
    /// - A scratch memory index is out of range
    /// - The last instruction is not `ret k` or `ret a`
    /// - A scratch slot may be read before anything is stored in it
    pub fn validate(&self) -> io::Result<()> {
        let insns = self.instructions();
        let len = insns.len();

        if len == 0 || len > BPF_MAXINSNS {
            return Err(invalid(format!(
                "program length {} outside 1..={}",
                len, BPF_MAXINSNS
            )));
        }

        for (pc, insn) in insns.iter().enumerate() {
            let code = insn.code;
            if !is_known_opcode(code) {
                return Err(invalid(format!("unknown opcode 0x{:02x} at {}", code, pc)));
            }

            let next = pc + 1;
            match code {
                c if c == BPF_ALU | BPF_DIV | BPF_K || c == BPF_ALU | BPF_MOD | BPF_K => {
                    if insn.k == 0 {
                        return Err(invalid(format!("division by zero at {}", pc)));
                    }
                }
                c if c == BPF_ALU | BPF_LSH | BPF_K || c == BPF_ALU | BPF_RSH | BPF_K => {
                    if insn.k >= 32 {
                        return Err(invalid(format!("shift by {} at {}", insn.k, pc)));
                    }
                }
                c if c == BPF_LD | BPF_MEM
                    || c == BPF_LDX | BPF_MEM
                    || c == BPF_ST
                    || c == BPF_STX =>
                {
                    if insn.k as usize >= BPF_MEMWORDS {
                        return Err(invalid(format!(
                            "scratch slot {} out of range at {}",
                            insn.k, pc
                        )));
                    }
                }
                c if c == BPF_JMP | BPF_JA => {
                    if insn.k as usize >= len - next {
                        return Err(invalid(format!("jump out of range at {}", pc)));
                    }
                }
                c if is_conditional_jump(c) => {
                    if next + insn.jt as usize >= len || next + insn.jf as usize >= len {
                        return Err(invalid(format!("jump out of range at {}", pc)));
                    }
                }
                _ => {}
            }
        }

        let last = insns[len - 1].code;
        if last != BPF_RET | BPF_K && last != BPF_RET | BPF_A {
            return Err(invalid("program does not end with a return".to_string()));
        }

        self.check_scratch_reads()
    }

    /// Reject reads of scratch slots that are not stored on every path
    fn check_scratch_reads(&self) -> io::Result<()> {
        let insns = self.instructions();
        let mut masks = vec![u16::MAX; insns.len()];
        let mut valid: u16 = 0;

        for (pc, insn) in insns.iter().enumerate() {
            valid &= masks[pc];
            let code = insn.code;
            let next = pc + 1;

            if code == BPF_ST || code == BPF_STX {
                valid |= 1 << insn.k;
            } else if code == BPF_LD | BPF_MEM || code == BPF_LDX | BPF_MEM {
                if valid & (1 << insn.k) == 0 {
                    return Err(invalid(format!(
                        "scratch slot {} read before store at {}",
                        insn.k, pc
                    )));
                }
            } else if code == BPF_JMP | BPF_JA {
                masks[next + insn.k as usize] &= valid;
                valid = u16::MAX;
            } else if is_conditional_jump(code) {
                masks[next + insn.jt as usize] &= valid;
                masks[next + insn.jf as usize] &= valid;
                valid = u16::MAX;
            }
        }

        Ok(())
    }

    /// Evaluate the program against one captured frame
    ///
    /// Programs that fail [`FilterProgram::validate`] always reject.
    pub fn run(&self, frame: &[u8]) -> Verdict {
        if self.validate().is_err() {
            return Verdict::Reject;
        }

        let ret = self.execute(frame).unwrap_or(0);
        if ret == 0 {
            Verdict::Reject
        } else {
            Verdict::Accept {
                capture_len: (ret as usize).min(frame.len()),
            }
        }
    }

    /// Raw return value, `None` when a load falls outside the frame
    fn execute(&self, frame: &[u8]) -> Option<u32> {
        let insns = self.instructions();
        let mut a: u32 = 0;
        let mut x: u32 = 0;
        let mut mem = [0u32; BPF_MEMWORDS];
        let mut pc = 0usize;

        loop {
            let insn = insns.get(pc)?;
            pc += 1;
            let code = insn.code;
            let k = insn.k;

            match insn.class() {
                BPF_LD => {
                    a = match code & 0xe0 {
                        BPF_ABS => load(frame, k, code & 0x18)?,
                        BPF_IND => load(frame, x.checked_add(k)?, code & 0x18)?,
                        BPF_MEM => mem[k as usize],
                        BPF_LEN => frame.len() as u32,
                        _ => k,
                    };
                }
                BPF_LDX => {
                    x = match code & 0xe0 {
                        BPF_MEM => mem[k as usize],
                        BPF_LEN => frame.len() as u32,
                        BPF_MSH => 4 * (load(frame, k, BPF_B)? & 0x0f),
                        _ => k,
                    };
                }
                BPF_ST => mem[k as usize] = a,
                BPF_STX => mem[k as usize] = x,
                BPF_ALU => {
                    let operand = if code & BPF_X != 0 { x } else { k };
                    a = match code & 0xf0 {
                        BPF_ADD => a.wrapping_add(operand),
                        BPF_SUB => a.wrapping_sub(operand),
                        BPF_MUL => a.wrapping_mul(operand),
                        // A zero X divisor ends the program with 0
                        BPF_DIV => a.checked_div(operand)?,
                        BPF_MOD => a.checked_rem(operand)?,
                        BPF_AND => a & operand,
                        BPF_OR => a | operand,
                        BPF_XOR => a ^ operand,
                        BPF_LSH => a.checked_shl(operand).unwrap_or(0),
                        BPF_RSH => a.checked_shr(operand).unwrap_or(0),
                        BPF_NEG => a.wrapping_neg(),
                        _ => return None,
                    };
                }
                BPF_JMP => {
                    let op = code & 0xf0;
                    if op == BPF_JA {
                        pc += k as usize;
                        continue;
                    }
                    let operand = if code & BPF_X != 0 { x } else { k };
                    let taken = match op {
                        BPF_JEQ => a == operand,
                        BPF_JGT => a > operand,
                        BPF_JGE => a >= operand,
                        BPF_JSET => a & operand != 0,
                        _ => return None,
                    };
                    let offset = if taken { insn.jt } else { insn.jf };
                    pc += offset as usize;
                }
                BPF_RET => {
                    return Some(if code & 0x18 == BPF_A { a } else { k });
                }
                BPF_MISC => {
                    if code & 0xf8 == BPF_TXA {
                        a = x;
                    } else {
                        x = a;
                    }
                }
                _ => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::addressing::*;
    use crate::protocol::header::test_frames::*;

    const ID: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

    fn program() -> FilterProgram {
        build_filter(CommId::new(ID), Direction::TowardVehicle, Port::CONTROLLER)
    }

    #[test]
    fn test_built_program_is_valid() {
        assert!(program().validate().is_ok());
        assert!(build_filter(CommId::new([0; 4]), Direction::TowardOperator, Port(0xFF))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_accepts_matching_data_frame() {
        let raw = frame(ID, Direction::TowardVehicle, Port::CONTROLLER, b"rc-data");
        assert_eq!(program().run(&raw), Verdict::Accept { capture_len: raw.len() });
    }

    #[test]
    fn test_accepts_matching_beacon_frame() {
        let raw = frame_with(
            TEST_RADIOTAP_LEN,
            FRAME_CONTROL_BEACON,
            ID,
            Direction::TowardVehicle.as_byte(),
            PROTOCOL_VERSION,
            Port::CONTROLLER.as_byte(),
            &[],
        );
        assert!(program().run(&raw).is_accept());
    }

    #[test]
    fn test_rejects_other_frame_types() {
        // Management frame with neither the data nor the beacon bit
        let raw = frame_with(
            TEST_RADIOTAP_LEN,
            0x40,
            ID,
            Direction::TowardVehicle.as_byte(),
            PROTOCOL_VERSION,
            Port::CONTROLLER.as_byte(),
            &[],
        );
        assert_eq!(program().run(&raw), Verdict::Reject);
    }

    #[test]
    fn test_rejects_foreign_comm_id() {
        for other in [[0u8; 4], [0xFF; 4], [0xAA, 0xBB, 0xCC, 0xDE], [0xDD, 0xCC, 0xBB, 0xAA]] {
            let raw = frame(other, Direction::TowardVehicle, Port::CONTROLLER, &[]);
            assert_eq!(program().run(&raw), Verdict::Reject, "comm id {:02x?}", other);
        }
    }

    #[test]
    fn test_rejects_wrong_direction() {
        let raw = frame(ID, Direction::TowardOperator, Port::CONTROLLER, &[]);
        assert_eq!(program().run(&raw), Verdict::Reject);
    }

    #[test]
    fn test_rejects_direction_confirm_mismatch() {
        let mut raw = frame(ID, Direction::TowardVehicle, Port::CONTROLLER, &[]);
        let confirm = TEST_RADIOTAP_LEN + OFFSET_DIRECTION_CONFIRM as usize;
        raw[confirm] = Direction::TowardOperator.as_byte();
        assert_eq!(program().run(&raw), Verdict::Reject);
    }

    #[test]
    fn test_rejects_wrong_port_or_version() {
        let raw = frame(ID, Direction::TowardVehicle, Port::TELEMETRY, &[]);
        assert_eq!(program().run(&raw), Verdict::Reject);

        let raw = frame_with(
            TEST_RADIOTAP_LEN,
            FRAME_CONTROL_DATA,
            ID,
            Direction::TowardVehicle.as_byte(),
            0x02,
            Port::CONTROLLER.as_byte(),
            &[],
        );
        assert_eq!(program().run(&raw), Verdict::Reject);
    }

    #[test]
    fn test_rejects_missing_marker() {
        let mut raw = frame(ID, Direction::TowardVehicle, Port::CONTROLLER, &[]);
        raw[TEST_RADIOTAP_LEN + OFFSET_ADDR_MARKER as usize] = 0x00;
        assert_eq!(program().run(&raw), Verdict::Reject);
    }

    #[test]
    fn test_follows_radiotap_length() {
        for rt_len in [8usize, 18, 36, 64] {
            let raw = frame_with(
                rt_len,
                FRAME_CONTROL_DATA,
                ID,
                Direction::TowardVehicle.as_byte(),
                PROTOCOL_VERSION,
                Port::CONTROLLER.as_byte(),
                &[],
            );
            assert!(program().run(&raw).is_accept(), "radiotap length {}", rt_len);
        }
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let raw = frame(ID, Direction::TowardVehicle, Port::CONTROLLER, &[]);
        let cut = TEST_RADIOTAP_LEN + OFFSET_DIRECTION_CONFIRM as usize;
        assert_eq!(program().run(&raw[..cut]), Verdict::Reject);
        assert_eq!(program().run(&[]), Verdict::Reject);
    }

    #[test]
    fn test_capture_capped_at_maximum() {
        let payload = vec![0x5Au8; MAX_CAPTURE_LEN as usize + 1000];
        let raw = frame(ID, Direction::TowardVehicle, Port::CONTROLLER, &payload);
        assert!(raw.len() > MAX_CAPTURE_LEN as usize);
        assert_eq!(
            program().run(&raw),
            Verdict::Accept { capture_len: MAX_CAPTURE_LEN as usize }
        );
    }

    #[test]
    fn test_small_capture_len_truncates() {
        let filter = LinkFilter {
            capture_len: 20,
            ..LinkFilter::new(CommId::new(ID), Direction::TowardVehicle, Port::CONTROLLER)
        };
        let raw = frame(ID, Direction::TowardVehicle, Port::CONTROLLER, &[0u8; 100]);
        assert_eq!(filter.build().run(&raw), Verdict::Accept { capture_len: 20 });
    }

    #[test]
    fn test_every_port_only_matches_itself() {
        let id = CommId::new(ID);
        for port in 0u8..=16 {
            let program = build_filter(id, Direction::TowardOperator, Port(port));
            for sent in 0u8..=16 {
                let raw = frame(ID, Direction::TowardOperator, Port(sent), &[]);
                let accepted = program.run(&raw).is_accept();
                assert_eq!(accepted, port == sent, "filter {} frame {}", port, sent);
            }
        }
    }

    #[test]
    fn test_validate_rejects_empty() {
        let program = FilterProgram::from_instructions(vec![]);
        assert!(program.validate().is_err());
        assert_eq!(program.run(&[0u8; 64]), Verdict::Reject);
    }

    #[test]
    fn test_validate_rejects_missing_return() {
        let load = FilterInstruction::stmt(BPF_LD | BPF_B | BPF_ABS, 0);
        let program = FilterProgram::from_instructions(vec![load]);
        assert_eq!(program.validate().unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_validate_rejects_jump_out_of_range() {
        let program = FilterProgram::from_instructions(vec![
            FilterInstruction::jump(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 5),
            FilterInstruction::stmt(BPF_RET | BPF_K, 0),
        ]);
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_scratch_slot() {
        let program = FilterProgram::from_instructions(vec![
            FilterInstruction::stmt(BPF_ST, 16),
            FilterInstruction::stmt(BPF_RET | BPF_K, 0),
        ]);
        assert!(program.validate().is_err());
    }

    fn ret_a() -> FilterInstruction {
        FilterInstruction::stmt(BPF_RET | BPF_A, 0)
    }

    #[test]
    fn test_validate_accepts_full_classic_set() {
        use FilterInstruction as I;

        let programs = [
            vec![I::stmt(BPF_LDX | BPF_B | BPF_MSH, 0), I::stmt(BPF_MISC | BPF_TXA, 0), ret_a()],
            vec![I::stmt(BPF_ALU | BPF_MUL | BPF_K, 2), ret_a()],
            vec![I::stmt(BPF_ALU | BPF_DIV | BPF_X, 0), ret_a()],
            vec![I::stmt(BPF_ALU | BPF_MOD | BPF_K, 7), ret_a()],
            vec![I::stmt(BPF_ALU | BPF_XOR | BPF_X, 0), ret_a()],
            vec![I::stmt(BPF_ALU | BPF_NEG, 0), ret_a()],
            vec![I::jump(BPF_JMP | BPF_JGT | BPF_X, 0, 0, 0), ret_a()],
            vec![I::stmt(BPF_LDX | BPF_W | BPF_LEN, 0), ret_a()],
            vec![I::stmt(BPF_ST, 3), I::stmt(BPF_LD | BPF_MEM, 3), ret_a()],
        ];

        for insns in programs {
            let program = FilterProgram::from_instructions(insns);
            assert!(program.validate().is_ok(), "{:?}", program);
        }
    }

    #[test]
    fn test_validate_rejects_return_x() {
        let program = FilterProgram::from_instructions(vec![FilterInstruction::stmt(
            BPF_RET | BPF_X,
            0,
        )]);
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_constant_division_by_zero() {
        for op in [BPF_DIV, BPF_MOD] {
            let program = FilterProgram::from_instructions(vec![
                FilterInstruction::stmt(BPF_ALU | op | BPF_K, 0),
                ret_a(),
            ]);
            assert!(program.validate().is_err(), "op 0x{:02x}", op);
        }
    }

    #[test]
    fn test_validate_rejects_large_constant_shift() {
        let program = FilterProgram::from_instructions(vec![
            FilterInstruction::stmt(BPF_ALU | BPF_LSH | BPF_K, 32),
            ret_a(),
        ]);
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_opcode() {
        // ALU NEG takes no X operand
        let program = FilterProgram::from_instructions(vec![
            FilterInstruction::stmt(BPF_ALU | BPF_NEG | BPF_X, 0),
            ret_a(),
        ]);
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_uninitialised_scratch_read() {
        use FilterInstruction as I;

        // Slot 2 is only stored on the taken branch
        let program = FilterProgram::from_instructions(vec![
            I::jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, 1),
            I::stmt(BPF_ST, 2),
            I::stmt(BPF_LD | BPF_MEM, 2),
            ret_a(),
        ]);
        assert!(program.validate().is_err());

        let program = FilterProgram::from_instructions(vec![
            I::stmt(BPF_ST, 2),
            I::jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, 1),
            I::stmt(BPF_ALU | BPF_ADD | BPF_K, 1),
            I::stmt(BPF_LD | BPF_MEM, 2),
            ret_a(),
        ]);
        assert!(program.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_long_unconditional_jump() {
        let program = FilterProgram::from_instructions(vec![
            FilterInstruction::stmt(BPF_JMP | BPF_JA, 1),
            ret_a(),
        ]);
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_run_ip_header_length() {
        use FilterInstruction as I;

        // Accept X = 4 * (pkt[0] & 0xf) bytes
        let program = FilterProgram::from_instructions(vec![
            I::stmt(BPF_LDX | BPF_B | BPF_MSH, 0),
            I::stmt(BPF_MISC | BPF_TXA, 0),
            ret_a(),
        ]);
        let packet = [0x45u8; 64];
        assert_eq!(program.run(&packet), Verdict::Accept { capture_len: 20 });
        assert_eq!(program.run(&[]), Verdict::Reject);
    }

    #[test]
    fn test_run_arithmetic() {
        use FilterInstruction as I;

        let program = FilterProgram::from_instructions(vec![
            I::stmt(BPF_LD | BPF_IMM, 10),
            I::stmt(BPF_ALU | BPF_MUL | BPF_K, 6),
            I::stmt(BPF_ALU | BPF_MOD | BPF_K, 7),
            I::stmt(BPF_ALU | BPF_XOR | BPF_K, 0x0c),
            ret_a(),
        ]);
        // (10 * 6) % 7 = 4, 4 ^ 12 = 8
        assert_eq!(program.run(&[0u8; 32]), Verdict::Accept { capture_len: 8 });

        let negate = FilterProgram::from_instructions(vec![
            I::stmt(BPF_LD | BPF_IMM, 1),
            I::stmt(BPF_ALU | BPF_NEG, 0),
            I::stmt(BPF_ALU | BPF_RSH | BPF_K, 28),
            ret_a(),
        ]);
        assert_eq!(negate.run(&[0u8; 32]), Verdict::Accept { capture_len: 15 });
    }

    #[test]
    fn test_run_division_by_zero_x_rejects() {
        use FilterInstruction as I;

        let program = FilterProgram::from_instructions(vec![
            I::stmt(BPF_LD | BPF_IMM, 100),
            I::stmt(BPF_LDX | BPF_IMM, 0),
            I::stmt(BPF_ALU | BPF_DIV | BPF_X, 0),
            I::stmt(BPF_RET | BPF_K, u32::MAX),
        ]);
        assert!(program.validate().is_ok());
        assert_eq!(program.run(&[0u8; 8]), Verdict::Reject);
    }

    #[test]
    fn test_accept_all_program() {
        let accept = FilterInstruction::stmt(BPF_RET | BPF_K, u32::MAX);
        let program = FilterProgram::from_instructions(vec![accept]);
        assert_eq!(program.run(&[1, 2, 3]), Verdict::Accept { capture_len: 3 });
    }
}
