//! Assembler integration tests: parsing, addressing, encoding, literal
//! pools, and the round-trip laws.

use acorn_arm2::decode;
use arm2_asm::{
    AsmConfig, DiagnosticKind, assemble_str, encode_instruction, encode_program,
    format_instruction,
};

fn assemble(source: &str) -> arm2_asm::Program {
    assemble_str(source, &AsmConfig::default()).expect("program assembles")
}

/// Encode the single instruction of a one-line program.
fn encode_one(line: &str) -> u32 {
    let program = assemble(line);
    assert_eq!(program.instructions.len(), 1, "expected one instruction");
    encode_instruction(&program.instructions[0], &program).expect("encodes")
}

#[test]
fn addresses_start_at_zero_without_org() {
    let program = assemble("MOV R0, #1\nMOV R1, #2");
    assert_eq!(program.origin, None);
    assert_eq!(program.instructions[0].addr, 0);
    assert_eq!(program.instructions[1].addr, 4);
}

#[test]
fn org_sets_section_base() {
    let program = assemble(".org 0x8000\nstart: MOV R0, #1");
    assert_eq!(program.origin, Some(0x8000));
    assert_eq!(program.instructions[0].addr, 0x8000);
    let start = program.symbols.lookup("start").expect("label defined");
    assert_eq!(start.value, 0x8000);
}

#[test]
fn known_encodings() {
    assert_eq!(encode_one("ADDEQS R0, R1, #10"), 0x0291_000A);
    assert_eq!(encode_one("MOV R0, R1, LSL #2"), 0xE1A0_0101);
    assert_eq!(encode_one("MOVS R0, R1, LSR #32"), 0xE1B0_0021);
    assert_eq!(encode_one("MOV R0, R1, RRX"), 0xE1A0_0061);
    assert_eq!(encode_one("LDR R2, [R1, #-4]!"), 0xE532_2004);
    assert_eq!(encode_one("STR R2, [R1], #4"), 0xE481_2004);
    assert_eq!(encode_one("STMFD SP!, {R0, R1, LR}"), 0xE92D_4003);
    assert_eq!(encode_one("PUSH {R0-R3}"), 0xE92D_000F);
    assert_eq!(encode_one("POP {PC}"), 0xE8BD_8000);
    assert_eq!(encode_one("MUL R0, R1, R2"), 0xE000_0291);
    assert_eq!(encode_one("MLA R2, R3, R4, R5"), 0xE022_5493);
    assert_eq!(encode_one("LDRH R0, [R1, #6]"), 0xE1D1_00B6);
    assert_eq!(encode_one("SWI 0x11"), 0xEF00_0011);
    assert_eq!(encode_one("SWI #0"), 0xEF00_0000);
    assert_eq!(encode_one("NOP"), 0xE1A0_0000);
    assert_eq!(encode_one("BX LR"), 0xE12F_FF1E);
}

#[test]
fn branch_offsets() {
    let program = assemble(".org 0\nB skip\nMOV R0, #1\nskip: MOV R1, #2");
    let opcode = encode_instruction(&program.instructions[0], &program).expect("encodes");
    // Target 8 from pc 0+8: offset 0
    assert_eq!(opcode, 0xEA00_0000);

    let program = assemble(".org 0x8000\nloop: SUBS R0, R0, #1\nBNE loop");
    let opcode = encode_instruction(&program.instructions[1], &program).expect("encodes");
    // Backwards: 0x8000 - (0x8004 + 8) = -12 = -3 words
    assert_eq!(opcode, 0x1AFF_FFFD);
}

#[test]
fn mov_mvn_complement_rewriting() {
    // #-1 does not encode; MVN R0, #0 does
    assert_eq!(encode_one("MOV R0, #-1"), 0xE3E0_0000);
    // MVN of an encodable-complement value flips back to MOV
    assert_eq!(encode_one("MVN R0, #0xFFFFFF00"), 0xE3A0_00FF);
    // ADD with a negative immediate becomes SUB
    assert_eq!(encode_one("ADD R0, R1, #-4"), 0xE241_0004);
    // CMP against an un-encodable negative becomes CMN
    assert_eq!(encode_one("CMP R0, #-1"), 0xE370_0001);
}

#[test]
fn unencodable_immediate_is_rejected() {
    let program = assemble("AND R0, R1, #0x10001\nMOV R2, #0\n");
    let err = encode_instruction(&program.instructions[0], &program).expect_err("must fail");
    assert!(
        matches!(err, arm2_asm::EncodeError::ImmediateUnencodable(0x0001_0001)),
        "got {err:?}"
    );
}

#[test]
fn encode_decode_round_trip() {
    let source = "\
.org 0x8000
entry:  MOV R0, #0
        ADDS R1, R0, R2, LSL #3
        SUBNES R3, R4, #0xFF0
        LDRB R5, [R6, #1]
        STR R7, [R8], #-8
        LDMFD SP!, {R0-R4, PC}
        STMDB SP!, {R1, LR}
        MLA R2, R3, R4, R5
        BL entry
        BX LR
        SWI 0x20
";
    let program = assemble(source);
    for instr in &program.instructions {
        let opcode = encode_instruction(instr, &program)
            .unwrap_or_else(|e| panic!("{}: {e}", instr.raw));
        let decoded = decode(opcode)
            .unwrap_or_else(|e| panic!("{}: decode failed: {e}", instr.raw));
        // The disassembly must parse back and re-encode to the same word
        let text = decoded.disassemble(instr.addr);
        let reparsed = assemble(&format!(".org {:#X}\n{}", instr.addr, text));
        let reencoded = encode_instruction(&reparsed.instructions[0], &reparsed)
            .unwrap_or_else(|e| panic!("{text}: re-encode failed: {e}"));
        assert_eq!(
            reencoded, opcode,
            "round trip diverged for '{}' -> '{text}'",
            instr.raw
        );
    }
}

#[test]
fn parse_format_parse_is_identity() {
    let source = "\
.org 0x100
        ADDEQS R0, R1, #10
        MOV R2, R3, LSL R4
        LDR R5, [R6, R7, LSL #2]
        STRB R0, [R1], #1
        LDMIA R2!, {R0, R3-R5}
        CMP R0, #255
        B 0x100
";
    let program = assemble(source);
    for instr in &program.instructions {
        let text = format_instruction(instr);
        let reparsed = assemble(&format!(".org {:#X}\n{}", instr.addr, text));
        let again = &reparsed.instructions[0];
        assert_eq!(again.mnemonic, instr.mnemonic, "for '{text}'");
        assert_eq!(again.cond, instr.cond, "for '{text}'");
        assert_eq!(again.set_flags, instr.set_flags, "for '{text}'");
        assert_eq!(again.operands, instr.operands, "for '{text}'");
    }
}

#[test]
fn literal_pool_placement_and_dedup() {
    let source = "\
.org 0x8000
        LDR R0, =0x12345678
        LDR R1, =0x12345678
        LDR R2, =255
        SWI 0x00
.ltorg
";
    let program = assemble(source);
    assert_eq!(program.pools.len(), 1);
    let pool = &program.pools[0];
    assert_eq!(pool.addr, 0x8010);
    assert_eq!(
        pool.entries.len(),
        2,
        "=0x12345678 dedups, =255 is distinct"
    );

    let words = encode_program(&program).expect("encodes");
    let find = |addr: u32| {
        words
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, w)| *w)
            .unwrap_or_else(|| panic!("no word at {addr:#X}"))
    };
    // Both far loads reference the same pool slot
    assert_eq!(find(0x8000), 0xE59F_0008, "LDR R0, [PC, #8]");
    assert_eq!(find(0x8004), 0xE59F_1004, "LDR R1, [PC, #4]");
    // =255 rewrites to MOV, leaving its slot unused
    assert_eq!(find(0x8008), 0xE3A0_20FF, "MOV R2, #255");
    assert_eq!(find(0x8010), 0x1234_5678, "pool entry value");
}

#[test]
fn pool_dedup_is_by_operand_text() {
    // Same value, different spellings: two pool entries
    let program = assemble("LDR R0, =0x11223344\nLDR R1, =287454020\n.ltorg");
    assert_eq!(program.pools[0].entries.len(), 2);
}

#[test]
fn implicit_final_pool() {
    let program = assemble(".org 0\nLDR R0, =0xCAFEBABE\nSWI 0");
    assert_eq!(program.pools.len(), 1, "a final pool is implied");
    assert_eq!(program.pools[0].addr, 8);
}

#[test]
fn undefined_symbol_is_reported() {
    let err = assemble_str("B missing", &AsmConfig::default()).expect_err("must fail");
    let first = err.first().expect("has an error");
    assert_eq!(first.kind, DiagnosticKind::UndefinedSymbol);
    assert!(first.message.contains("missing"));
}

#[test]
fn duplicate_label_is_reported() {
    let err = assemble_str("x: MOV R0, #1\nx: MOV R1, #2", &AsmConfig::default())
        .expect_err("must fail");
    assert_eq!(
        err.first().expect("has an error").kind,
        DiagnosticKind::DuplicateLabel
    );
}

#[test]
fn nv_condition_warns_but_assembles() {
    let program = assemble("MOVNV R0, #1");
    assert_eq!(program.warnings.len(), 1);
    assert!(program.warnings[0].message.contains("NV"));
}

#[test]
fn asciz_reserves_trailing_nul() {
    let program = assemble(".org 0\n.asciz \"Hi\\n\"\nmark: .word 1");
    let dir = &program.directives[1];
    assert_eq!(dir.name, "asciz");
    assert_eq!(dir.size, 4, "three bytes plus NUL");
    assert_eq!(
        program.symbols.lookup("mark").expect("defined").value,
        4
    );
}

#[test]
fn align_advances_to_power_of_two() {
    let program = assemble(".org 0\n.byte 1\n.align 2\nmark: .word 5");
    assert_eq!(program.symbols.lookup("mark").expect("defined").value, 4);
}

#[test]
fn byte_directive_takes_char_literals() {
    let program = assemble(".byte 'A', '\\n', 10 + 2");
    let dir = &program.directives[0];
    assert_eq!(dir.size, 3);
}

#[test]
fn equ_and_forward_references() {
    let source = "\
.equ BASE, 0x1000
        LDR R0, [R1, #BASE >> 8]
        B ahead
ahead:  MOV R0, #BASE - 0xFF0
";
    let program = assemble(source);
    assert_eq!(
        program.symbols.lookup("BASE").expect("defined").value,
        0x1000
    );
    // #BASE >> 8 = 16
    let opcode = encode_instruction(&program.instructions[0], &program).expect("encodes");
    assert_eq!(opcode & 0xFFF, 16);
}

#[test]
fn instructions_align_after_data() {
    let program = assemble(".org 0\n.byte 1\nMOV R0, #1");
    assert_eq!(program.instructions[0].addr, 4);
}

#[test]
fn register_list_source_order_is_irrelevant() {
    let a = encode_one("PUSH {LR, R0, R4-R6}");
    let b = encode_one("PUSH {R0, R4, R5, R6, LR}");
    assert_eq!(a, b);
}

#[test]
fn mul_register_constraints() {
    let program = assemble("MUL R0, R0, R1\nMOV R9, #0");
    let err = encode_instruction(&program.instructions[0], &program).expect_err("Rd == Rm");
    assert!(matches!(err, arm2_asm::EncodeError::RegisterDisallowed(_)));
}

#[test]
fn s_bit_write_to_pc_is_rejected() {
    let program = assemble("MOVS PC, LR");
    let err = encode_instruction(&program.instructions[0], &program).expect_err("must fail");
    assert!(matches!(err, arm2_asm::EncodeError::RegisterDisallowed(_)));
}

#[test]
fn adr_uses_pc_relative_add() {
    let program = assemble(".org 0x8000\nADR R0, target\ntarget: .word 0");
    let opcode = encode_instruction(&program.instructions[0], &program).expect("encodes");
    // target = 0x8004, pc = 0x8008: SUB R0, PC, #4
    assert_eq!(opcode, 0xE24F_0004);
}

#[test]
fn operand_forms_reject_junk() {
    assert!(assemble_str("MOV R0", &AsmConfig::default()).is_err());
    assert!(assemble_str("LDR R0, [R1", &AsmConfig::default()).is_err());
    assert!(assemble_str("PUSH {}", &AsmConfig::default()).is_err());
    assert!(assemble_str("ADD R0, R1, R16", &AsmConfig::default()).is_err());
}

#[test]
fn diagnostics_batch_is_bounded() {
    let mut source = String::new();
    for _ in 0..100 {
        source.push_str("FROB R0\n");
    }
    let err = assemble_str(&source, &AsmConfig::default()).expect_err("must fail");
    assert!(
        err.diagnostics.len() <= arm2_asm::DEFAULT_MAX_DIAGNOSTICS,
        "collected {} diagnostics",
        err.diagnostics.len()
    );
}

#[test]
fn block_comments_span_lines() {
    let program = assemble("MOV R0, #1 /* comment\nstill comment */\nMOV R1, #2");
    assert_eq!(program.instructions.len(), 2);
}

#[test]
fn operand_checks_use_operand_text() {
    // Trailing comments don't leak into the literal key
    let program = assemble("LDR R0, =0xDEADBEEF ; load it\n.ltorg");
    assert_eq!(program.pools[0].entries[0].0, "=0xDEADBEEF");
}
