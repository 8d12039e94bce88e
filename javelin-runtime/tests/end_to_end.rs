mod common;

use javelin_bytecode::{BasicType, ConstPoolEntry, MethodId};
use javelin_runtime::code::{RelocationKind, CODE_ALIGNMENT, HEADER_SIZE};
use javelin_runtime::vm::CompilerFlags;

use common::sim::STOP;
use common::{
    make_vm, make_vm_with_flags, one_class_program, sim_for, stack_top, static_method, HEAP_BASE,
};

#[test]
fn compile_trivial_add() {
    // int add(int a, int b) { return a + b; }
    let program = one_class_program(vec![static_method(
        "add",
        2,
        2,
        2,
        Some(BasicType::Int),
        vec![0x1A, 0x1B, 0x60, 0xAC],
        vec![],
    )]);
    let vm = make_vm(program);

    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let method = vm.compiled_method(code_id).unwrap();

    // no constants, no calls: the relocation table is empty
    assert_eq!(method.relocations().iter().count(), 0);
    assert!(!method.has_branch_relocs());
    assert!(!method.has_object_refs());

    // allocation granularity at the low end, code budget at the high end
    assert!(method.total_size() >= CODE_ALIGNMENT);
    assert!(
        method.total_size()
            <= javelin_runtime::mem::align_u32(
                HEADER_SIZE + method.code_len() + CODE_ALIGNMENT,
                CODE_ALIGNMENT
            )
    );

    let mut sim = sim_for(&vm);
    let result = sim.run(method.instruction_start().to_u32(), &[2, 3], stack_top());
    assert_eq!(result, 5);

    let result = sim.run(
        method.instruction_start().to_u32(),
        &[-7i32 as u32, 3],
        stack_top(),
    );
    assert_eq!(result as i32, -4);
}

#[test]
fn compile_counting_loop() {
    // int sum(int n) { int s = 0; for (int i = 0; i < n; i++) s += i; return s; }
    let code = vec![
        0x03, 0x3C, // iconst_0; istore_1
        0x03, 0x3D, // iconst_0; istore_2
        0x1C, 0x1A, // iload_2; iload_0
        0xA2, 0x00, 0x0D, // if_icmpge +13 -> 19
        0x1B, 0x1C, 0x60, 0x3C, // s += i
        0x84, 0x02, 0x01, // iinc 2, 1
        0xA7, 0xFF, 0xF4, // goto -12 -> 4
        0x1B, 0xAC, // iload_1; ireturn
    ];
    let program = one_class_program(vec![static_method(
        "sum",
        1,
        3,
        2,
        Some(BasicType::Int),
        code,
        vec![],
    )]);
    let vm = make_vm(program);

    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let entry = vm
        .compiled_method(code_id)
        .unwrap()
        .instruction_start()
        .to_u32();

    let mut sim = sim_for(&vm);
    assert_eq!(sim.run(entry, &[5], stack_top()), 10);
    assert_eq!(sim.run(entry, &[0], stack_top()), 0);
    assert_eq!(sim.run(entry, &[100], stack_top()), 4950);
}

#[test]
fn integer_division_through_runtime_entry() {
    // int div(int a, int b) { return a / b % 10; }
    let code = vec![0x1A, 0x1B, 0x6C, 0x10, 0x0A, 0x70, 0xAC];
    let program = one_class_program(vec![static_method(
        "div",
        2,
        2,
        2,
        Some(BasicType::Int),
        code,
        vec![],
    )]);
    let vm = make_vm(program);
    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let entry = vm
        .compiled_method(code_id)
        .unwrap()
        .instruction_start()
        .to_u32();

    let mut sim = sim_for(&vm);
    assert_eq!(sim.run(entry, &[1234, 7], stack_top()), 1234 / 7 % 10);
}

#[test]
fn arithmetic_mix() {
    // int mix(int a, int b) { return (a * b) ^ (a << b); }
    let code = vec![0x1A, 0x1B, 0x68, 0x1A, 0x1B, 0x78, 0x82, 0xAC];
    let program = one_class_program(vec![static_method(
        "mix",
        2,
        2,
        4,
        Some(BasicType::Int),
        code,
        vec![],
    )]);
    let vm = make_vm(program);
    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let entry = vm
        .compiled_method(code_id)
        .unwrap()
        .instruction_start()
        .to_u32();

    let mut sim = sim_for(&vm);
    for &(a, b) in &[(3i32, 4i32), (-5, 7), (123456, 13), (7, 40)] {
        let expected = a.wrapping_mul(b) ^ (a << (b & 31));
        let got = sim.run(entry, &[a as u32, b as u32], stack_top());
        assert_eq!(got as i32, expected, "mix({}, {})", a, b);
    }
}

fn long_args(a: i64, b: i64) -> [u32; 4] {
    let first = |v: i64| {
        if javelin_runtime::cpu::LONG_MSW_FIRST {
            (v >> 32) as u32
        } else {
            v as u32
        }
    };
    let second = |v: i64| {
        if javelin_runtime::cpu::LONG_MSW_FIRST {
            v as u32
        } else {
            (v >> 32) as u32
        }
    };
    [first(a), second(a), first(b), second(b)]
}

fn long_result(r0: u32, r1: u32) -> i64 {
    if javelin_runtime::cpu::LONG_MSW_FIRST {
        ((r0 as i64) << 32) | (r1 as i64 & 0xFFFF_FFFF)
    } else {
        ((r1 as i64) << 32) | (r0 as i64 & 0xFFFF_FFFF)
    }
}

#[test]
fn long_addition_with_carry() {
    // long ladd(long a, long b) { return a + b; }
    let code = vec![0x1E, 0x20, 0x61, 0xAD];
    let program = one_class_program(vec![static_method(
        "ladd",
        4,
        4,
        4,
        Some(BasicType::Long),
        code,
        vec![],
    )]);
    let vm = make_vm(program);
    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let entry = vm
        .compiled_method(code_id)
        .unwrap()
        .instruction_start()
        .to_u32();

    let mut sim = sim_for(&vm);

    for &(a, b) in &[
        (1i64, 2i64),
        (0xFFFF_FFFF, 1),
        (-1, 1),
        (0x1234_5678_9ABC_DEF0, 0x1111_1111_1111_1111),
        (i64::MIN, -1),
    ] {
        sim.run(entry, &long_args(a, b), stack_top());
        let got = long_result(sim.cpu.regs[0], sim.cpu.regs[1]);
        assert_eq!(got, a.wrapping_add(b), "ladd({:#x}, {:#x})", a, b);
    }
}

#[test]
fn long_compare_and_shift() {
    // int lcmp(long a, long b) { return Long.compare-ish via lcmp }
    let cmp_code = vec![0x1E, 0x20, 0x94, 0xAC];
    // long lshl(long a, long b) { return a << (int) b; }
    let shl_code = vec![0x1E, 0x20, 0x88, 0x79, 0xAD];
    let program = one_class_program(vec![
        static_method("lcmp", 4, 4, 4, Some(BasicType::Int), cmp_code, vec![]),
        static_method("lshl", 4, 4, 4, Some(BasicType::Long), shl_code, vec![]),
    ]);
    let vm = make_vm(program);

    let cmp_entry = {
        let id = vm.compile_method(MethodId::from(0)).unwrap();
        vm.compiled_method(id).unwrap().instruction_start().to_u32()
    };
    let shl_entry = {
        let id = vm.compile_method(MethodId::from(1)).unwrap();
        vm.compiled_method(id).unwrap().instruction_start().to_u32()
    };

    let mut sim = sim_for(&vm);

    for &(a, b) in &[
        (0i64, 0i64),
        (1, 2),
        (2, 1),
        (-1, 1),
        (i64::MIN, i64::MAX),
        (0x1_0000_0000, 0xFFFF_FFFF),
    ] {
        let expected = if a < b {
            -1
        } else if a > b {
            1
        } else {
            0
        };
        let got = sim.run(cmp_entry, &long_args(a, b), stack_top());
        assert_eq!(got as i32, expected, "lcmp({:#x}, {:#x})", a, b);
    }

    for &(a, s) in &[
        (1i64, 0i64),
        (1, 1),
        (1, 31),
        (1, 32),
        (1, 33),
        (1, 63),
        (0x1234_5678_9ABC_DEF0u64 as i64, 17),
        (-1, 40),
    ] {
        sim.run(shl_entry, &long_args(a, s), stack_top());
        let got = long_result(sim.cpu.regs[0], sim.cpu.regs[1]);
        assert_eq!(got, a << (s & 63), "lshl({:#x}, {})", a, s);
    }
}

#[test]
fn table_switch_dispatch() {
    // switch (x) { case 0: 10; case 1: 20; case 2: 30; default: -1 }
    let code = vec![
        0x1A, // 0: iload_0
        0xAA, 0x00, 0x00, // 1: tableswitch + padding to 4
        0x00, 0x00, 0x00, 0x24, // default -> 1 + 36 = 37
        0x00, 0x00, 0x00, 0x00, // low 0
        0x00, 0x00, 0x00, 0x02, // high 2
        0x00, 0x00, 0x00, 0x1B, // case 0 -> 1 + 27 = 28
        0x00, 0x00, 0x00, 0x1E, // case 1 -> 31
        0x00, 0x00, 0x00, 0x21, // case 2 -> 34
        0x10, 0x0A, 0xAC, // 28: bipush 10; ireturn
        0x10, 0x14, 0xAC, // 31: bipush 20; ireturn
        0x10, 0x1E, 0xAC, // 34: bipush 30; ireturn
        0x02, 0xAC, // 37: iconst_m1; ireturn
    ];

    let program = one_class_program(vec![static_method(
        "sw",
        1,
        1,
        1,
        Some(BasicType::Int),
        code,
        vec![],
    )]);
    let vm = make_vm(program);
    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let entry = vm
        .compiled_method(code_id)
        .unwrap()
        .instruction_start()
        .to_u32();

    let mut sim = sim_for(&vm);
    assert_eq!(sim.run(entry, &[0], stack_top()), 10);
    assert_eq!(sim.run(entry, &[1], stack_top()), 20);
    assert_eq!(sim.run(entry, &[2], stack_top()), 30);
    assert_eq!(sim.run(entry, &[5], stack_top()) as i32, -1);
    assert_eq!(sim.run(entry, &[-3i32 as u32], stack_top()) as i32, -1);
}

#[test]
fn array_load_and_bounds_check() {
    // int get(int[] a, int i) { return a[i]; }
    let code = vec![0x2A, 0x1B, 0x2E, 0xAC];
    let program = one_class_program(vec![static_method(
        "get",
        2,
        2,
        2,
        Some(BasicType::Int),
        code,
        vec![],
    )]);
    let vm = make_vm(program);
    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let entry = vm
        .compiled_method(code_id)
        .unwrap()
        .instruction_start()
        .to_u32();

    let mut sim = sim_for(&vm);

    // int[5] at the heap base: class word, length, then elements
    let array = HEAP_BASE;
    sim.cpu.mem.write_u32(array + 4, 5);
    for idx in 0..5u32 {
        sim.cpu.mem.write_u32(array + 8 + idx * 4, 100 + idx);
    }

    let throw = vm.entries.throw_array_index.to_u32();
    sim.hook(throw, |cpu| {
        cpu.regs[0] = 0xDEAD;
        cpu.regs[14] = STOP;
    });
    let npe = vm.entries.throw_null_pointer.to_u32();
    sim.hook(npe, |cpu| {
        cpu.regs[0] = 0xDEAF;
        cpu.regs[14] = STOP;
    });

    assert_eq!(sim.run(entry, &[array, 0], stack_top()), 100);
    assert_eq!(sim.run(entry, &[array, 4], stack_top()), 104);

    // out of bounds (also negative, via the unsigned compare)
    assert_eq!(sim.run(entry, &[array, 5], stack_top()), 0xDEAD);
    assert_eq!(sim.run(entry, &[array, -1i32 as u32], stack_top()), 0xDEAD);

    // null array
    assert_eq!(sim.run(entry, &[0, 0], stack_top()), 0xDEAF);
}

#[test]
fn field_store_marks_card() {
    // void set(Obj o, Obj v) { o.next = v; }  (offset 8, reference)
    let code = vec![0x2A, 0x2B, 0xB5, 0x00, 0x00, 0xB1];
    let pool = vec![ConstPoolEntry::InstanceField {
        offset: 8,
        ty: BasicType::Object,
    }];
    let program = one_class_program(vec![static_method("set", 2, 2, 2, None, code, pool)]);
    let vm = make_vm(program);
    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let entry = vm
        .compiled_method(code_id)
        .unwrap()
        .instruction_start()
        .to_u32();

    let mut sim = sim_for(&vm);

    let object = HEAP_BASE + 0x100;
    let value = HEAP_BASE + 0x200;

    // dirty byte sentinel so the barrier's card mark is observable
    let card = vm.entries.card_table.to_u32() + ((object + 8) >> javelin_runtime::cpu::CARD_SHIFT);
    sim.cpu.mem.write_u8(card, 0xFF);

    sim.run(entry, &[object, value], stack_top());

    assert_eq!(sim.cpu.mem.read_u32(object + 8), value);
    assert_eq!(sim.cpu.mem.read_u8(card), 0);
}

#[test]
fn float_arithmetic_and_compare() {
    // float fadd(float a, float b) { return a + b; }
    let fadd_code = vec![0x22, 0x23, 0x62, 0xAE];
    // int fgt(float a, float b) { return a > b ? 1 : 0; }
    let fgt_code = vec![
        0x22, 0x23, 0x95, // fload_0; fload_1; fcmpl
        0x9E, 0x00, 0x07, // ifle -> 10
        0x04, // iconst_1
        0xA7, 0x00, 0x04, // goto -> 11
        0x03, // 10: iconst_0
        0xAC, // 11: ireturn
    ];
    let program = one_class_program(vec![
        static_method("fadd", 2, 2, 2, Some(BasicType::Float), fadd_code, vec![]),
        static_method("fgt", 2, 2, 2, Some(BasicType::Int), fgt_code, vec![]),
    ]);
    let vm = make_vm(program);

    let fadd_entry = {
        let id = vm.compile_method(MethodId::from(0)).unwrap();
        vm.compiled_method(id).unwrap().instruction_start().to_u32()
    };
    let fgt_entry = {
        let id = vm.compile_method(MethodId::from(1)).unwrap();
        vm.compiled_method(id).unwrap().instruction_start().to_u32()
    };

    let mut sim = sim_for(&vm);

    let result = sim.run(
        fadd_entry,
        &[1.5f32.to_bits(), 2.25f32.to_bits()],
        stack_top(),
    );
    assert_eq!(f32::from_bits(result), 3.75);

    let gt = |sim: &mut common::sim::Sim, a: f32, b: f32| {
        sim.run(fgt_entry, &[a.to_bits(), b.to_bits()], stack_top())
    };
    assert_eq!(gt(&mut sim, 2.0, 1.0), 1);
    assert_eq!(gt(&mut sim, 1.0, 2.0), 0);
    assert_eq!(gt(&mut sim, 1.0, 1.0), 0);
    assert_eq!(gt(&mut sim, f32::NAN, 1.0), 0);
}

#[test]
fn static_call_is_direct_branch() {
    // int add(int, int); int calc(int a, int b) { return add(a, b) + 1; }
    let add_code = vec![0x1A, 0x1B, 0x60, 0xAC];
    let calc_code = vec![0x1A, 0x1B, 0xB8, 0x00, 0x00, 0x04, 0x60, 0xAC];
    let program = one_class_program(vec![
        static_method("add", 2, 2, 2, Some(BasicType::Int), add_code, vec![]),
        static_method(
            "calc",
            2,
            2,
            3,
            Some(BasicType::Int),
            calc_code,
            vec![ConstPoolEntry::Method(MethodId::from(0))],
        ),
    ]);
    let vm = make_vm(program);

    // callee first, so the caller sees a statically known entry
    vm.compile_method(MethodId::from(0)).unwrap();
    let calc_id = vm.compile_method(MethodId::from(1)).unwrap();
    let calc = vm.compiled_method(calc_id).unwrap();

    assert!(calc.has_branch_relocs());
    assert_eq!(
        calc.relocations()
            .iter()
            .filter(|&(_, kind)| kind == RelocationKind::Branch)
            .count(),
        1
    );

    let mut sim = sim_for(&vm);
    assert_eq!(
        sim.run(calc.instruction_start().to_u32(), &[2, 3], stack_top()),
        6
    );
}

#[test]
fn unresolved_call_goes_through_method_block() {
    let add_code = vec![0x1A, 0x1B, 0x60, 0xAC];
    let calc_code = vec![0x1A, 0x1B, 0xB8, 0x00, 0x00, 0x04, 0x60, 0xAC];
    let program = one_class_program(vec![
        static_method("add", 2, 2, 2, Some(BasicType::Int), add_code, vec![]),
        static_method(
            "calc",
            2,
            2,
            3,
            Some(BasicType::Int),
            calc_code,
            vec![ConstPoolEntry::Method(MethodId::from(0))],
        ),
    ]);
    let vm = make_vm(program);

    // caller only: the callee is not compiled, so the call site loads
    // the callee's method block and lands on the interpreter bridge
    let calc_id = vm.compile_method(MethodId::from(1)).unwrap();
    let calc = vm.compiled_method(calc_id).unwrap();
    assert!(!calc.has_branch_relocs());

    let mut sim = sim_for(&vm);

    // the bridge hook plays interpreter for add(a, b)
    let block_base = vm.block_space().total().start.to_u32();
    sim.hook(vm.entries.interpreter_bridge.to_u32(), move |cpu| {
        let block = cpu.regs[12];
        let method_idx = (block - block_base) / 4;
        assert_eq!(method_idx, 0, "bridge called for the wrong method");
        cpu.regs[0] = cpu.regs[0].wrapping_add(cpu.regs[1]);
    });

    assert_eq!(
        sim.run(calc.instruction_start().to_u32(), &[20, 22], stack_top()),
        43
    );
}

#[test]
fn checkpoints_are_recorded_when_enabled() {
    let program = one_class_program(vec![static_method(
        "add",
        2,
        2,
        2,
        Some(BasicType::Int),
        vec![0x1A, 0x1B, 0x60, 0xAC],
        vec![],
    )]);
    let vm = make_vm_with_flags(
        program,
        CompilerFlags {
            entry_checkpoints: true,
            ..CompilerFlags::default()
        },
    );

    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let method = vm.compiled_method(code_id).unwrap();

    assert_eq!(
        method
            .relocations()
            .iter()
            .filter(|&(_, kind)| kind == RelocationKind::Checkpoint)
            .count(),
        1
    );

    // still executes correctly (the checkpoint is a nop until patched)
    let mut sim = sim_for(&vm);
    assert_eq!(
        sim.run(method.instruction_start().to_u32(), &[2, 3], stack_top()),
        5
    );
}

#[test]
fn unsupported_bytecode_falls_back_to_interpreter() {
    // jsr is never compiled
    let program = one_class_program(vec![static_method(
        "old",
        0,
        1,
        1,
        None,
        vec![0xA8, 0x00, 0x03, 0xB1],
        vec![],
    )]);
    let vm = make_vm(program);

    let err = vm.compile_method(MethodId::from(0)).unwrap_err();
    assert!(matches!(
        err,
        javelin_runtime::compiler::CompileError::UnsupportedBytecode(_)
    ));

    // the failure is memoized
    let err = vm.compile_method(MethodId::from(0)).unwrap_err();
    assert_eq!(err, javelin_runtime::compiler::CompileError::NotCompilable);

    // and the method block still routes to the interpreter
    assert_eq!(
        vm.method_entry(MethodId::from(0)),
        vm.entries.interpreter_bridge
    );
}

#[test]
fn virtual_dispatch_through_vtable() {
    use javelin_bytecode::{ClassId, MethodData, MethodKind};

    // int get(int x) { return x + x; }  -- virtual, vtable slot 0
    let get = MethodData {
        name: "get".to_string(),
        class: ClassId::from(0),
        kind: MethodKind::Virtual { vtable_index: 0 },
        param_words: 2,
        max_locals: 2,
        max_stack: 2,
        return_type: Some(BasicType::Int),
        code: vec![0x1B, 0x1B, 0x60, 0xAC],
        const_pool: vec![],
    };
    // int call(Obj o, int x) { return o.get(x); }
    let call = static_method(
        "call",
        2,
        2,
        3,
        Some(BasicType::Int),
        vec![0x2A, 0x1B, 0xB6, 0x00, 0x00, 0xAC],
        vec![ConstPoolEntry::Method(MethodId::from(0))],
    );

    let program = one_class_program(vec![get, call]);
    let vm = make_vm(program);

    let get_entry = {
        let id = vm.compile_method(MethodId::from(0)).unwrap();
        vm.compiled_method(id).unwrap().instruction_start().to_u32()
    };
    let call_entry = {
        let id = vm.compile_method(MethodId::from(1)).unwrap();
        vm.compiled_method(id).unwrap().instruction_start().to_u32()
    };

    // virtual dispatch loads the code pointer at call time: no
    // relocation entry for the call site
    let call_id = vm.code_id_for(MethodId::from(1)).unwrap();
    assert!(!vm.compiled_method(call_id).unwrap().has_branch_relocs());

    let mut sim = sim_for(&vm);

    // receiver object: word 0 holds the vtable, whose slot 0 holds the
    // compiled entry
    let vtable = HEAP_BASE + 0x80;
    let object = HEAP_BASE + 0x10;
    sim.cpu.mem.write_u32(vtable, get_entry);
    sim.cpu.mem.write_u32(object, vtable);

    assert_eq!(sim.run(call_entry, &[object, 21], stack_top()), 42);

    let npe = vm.entries.throw_null_pointer.to_u32();
    sim.hook(npe, |cpu| {
        cpu.regs[0] = 0xDEAF;
        cpu.regs[14] = STOP;
    });
    assert_eq!(sim.run(call_entry, &[0, 21], stack_top()), 0xDEAF);
}

#[test]
fn interface_dispatch_through_lookup_helper() {
    use javelin_bytecode::{ClassId, MethodData, MethodKind};

    let imp = MethodData {
        name: "size".to_string(),
        class: ClassId::from(0),
        kind: MethodKind::Interface { itable_index: 3 },
        param_words: 1,
        max_locals: 1,
        max_stack: 1,
        return_type: Some(BasicType::Int),
        code: vec![0x10, 0x2A, 0xAC], // bipush 42; ireturn
        const_pool: vec![],
    };
    // int call(Obj o) { return o.size(); }  (invokeinterface)
    let call = static_method(
        "call",
        1,
        1,
        2,
        Some(BasicType::Int),
        vec![0x2A, 0xB9, 0x00, 0x00, 0x01, 0x00, 0xAC],
        vec![ConstPoolEntry::Method(MethodId::from(0))],
    );

    let program = one_class_program(vec![imp, call]);
    let vm = make_vm(program);

    let imp_entry = {
        let id = vm.compile_method(MethodId::from(0)).unwrap();
        vm.compiled_method(id).unwrap().instruction_start().to_u32()
    };
    let call_entry = {
        let id = vm.compile_method(MethodId::from(1)).unwrap();
        vm.compiled_method(id).unwrap().instruction_start().to_u32()
    };

    let mut sim = sim_for(&vm);

    // the lookup helper receives the receiver in r0 and the itable
    // index outside the argument registers, and answers in the scratch
    // register
    sim.hook(vm.entries.itable_lookup.to_u32(), move |cpu| {
        assert_eq!(cpu.regs[4], 3, "itable index not marshaled");
        cpu.regs[12] = imp_entry;
    });

    let object = HEAP_BASE + 0x10;
    assert_eq!(sim.run(call_entry, &[object], stack_top()), 42);
}
