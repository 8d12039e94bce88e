mod common;

use std::cell::Cell;
use std::rc::Rc;

use javelin_asm::arm::{decode_branch, Cond};
use javelin_bytecode::{BasicType, ConstPoolEntry, MethodId};
use javelin_runtime::gc::{Address, HeapAccess};

use common::{make_vm, make_vm_with_heap, one_class_program, sim_for, stack_top, static_method};

/// `ldr pc, [r12]` -- the pristine indirect-call word at a not-yet
/// patched site.
const LDR_PC_BLOCK: u32 = 0xE59C_F000;

fn call_program() -> javelin_bytecode::Program {
    // 0: int add(int, int)
    // 1: int calc(int a, int b) { return add(a, b) + 1; }
    // 2: int dummy() { return 7; }
    one_class_program(vec![
        static_method(
            "add",
            2,
            2,
            2,
            Some(BasicType::Int),
            vec![0x1A, 0x1B, 0x60, 0xAC],
            vec![],
        ),
        static_method(
            "calc",
            2,
            2,
            3,
            Some(BasicType::Int),
            vec![0x1A, 0x1B, 0xB8, 0x00, 0x00, 0x04, 0x60, 0xAC],
            vec![ConstPoolEntry::Method(MethodId::from(0))],
        ),
        static_method(
            "dummy",
            0,
            1,
            1,
            Some(BasicType::Int),
            vec![0x10, 0x07, 0xAC],
            vec![],
        ),
    ])
}

/// Run calc once with the interpreter bridge playing the callee and
/// capture the call-site address from the bridge's return address.
fn discover_call_site(vm: &javelin_runtime::vm::Vm, calc_entry: u32) -> Address {
    let mut sim = sim_for(vm);
    let site = Rc::new(Cell::new(0u32));

    let site_probe = site.clone();
    sim.hook(vm.entries.interpreter_bridge.to_u32(), move |cpu| {
        site_probe.set(cpu.regs[14] - 4);
        cpu.regs[0] = cpu.regs[0].wrapping_add(cpu.regs[1]);
    });

    assert_eq!(sim.run(calc_entry, &[2, 3], stack_top()), 6);
    assert_ne!(site.get(), 0, "bridge never reached");
    Address::from(site.get())
}

#[test]
fn patch_unpatch_roundtrip() {
    let vm = make_vm(call_program());

    let calc_id = vm.compile_method(MethodId::from(1)).unwrap();
    let calc = vm.compiled_method(calc_id).unwrap();
    let calc_entry = calc.instruction_start().to_u32();

    let site = discover_call_site(&vm, calc_entry);
    assert_eq!(vm.space().read_u32(site), LDR_PC_BLOCK);
    assert!(calc.contains(site));

    // compile the callee, then patch the discovered site
    let add_id = vm.compile_method(MethodId::from(0)).unwrap();
    let add = vm.compiled_method(add_id).unwrap();
    vm.patch_direct_call(site, MethodId::from(0));

    let word = vm.space().read_u32(site);
    let (cond, link, disp) = decode_branch(word).expect("patched site is not a branch");
    assert!(cond == Cond::Al && link);
    assert_eq!(
        (site.to_u32() as i64 + 8 + disp as i64 * 4) as u32,
        add.instruction_start().to_u32()
    );

    // patching the same pair again leaves exactly one active entry
    vm.patch_direct_call(site, MethodId::from(0));
    assert_eq!(vm.patches().active_count(), 1);

    // the patched call runs without touching the bridge
    let mut sim = sim_for(&vm);
    let bridged = Rc::new(Cell::new(false));
    let probe = bridged.clone();
    sim.hook(vm.entries.interpreter_bridge.to_u32(), move |_| {
        probe.set(true);
    });
    assert_eq!(sim.run(calc_entry, &[2, 3], stack_top()), 6);
    assert!(!bridged.get(), "patched call still went through the bridge");

    // revoking the caller restores the original word byte for byte
    vm.unpatch_caller(calc_id);
    assert_eq!(vm.patches().active_count(), 0);
    assert_eq!(vm.space().read_u32(site), LDR_PC_BLOCK);

    // and the call degrades gracefully back through the method block
    // (which meanwhile points at the compiled callee)
    let mut sim = sim_for(&vm);
    assert_eq!(sim.run(calc_entry, &[10, 20], stack_top()), 31);
}

#[test]
fn compaction_adjusts_patched_displacement() {
    let vm = make_vm(call_program());

    // layout: calc first, then dummy (the future hole), then add;
    // the call site is discovered while add is still uncompiled
    let calc_id = vm.compile_method(MethodId::from(1)).unwrap();
    let dummy_id = vm.compile_method(MethodId::from(2)).unwrap();

    let calc = vm.compiled_method(calc_id).unwrap();
    let dummy = vm.compiled_method(dummy_id).unwrap();
    let calc_entry = calc.instruction_start().to_u32();
    let caller_start = calc.object_start();
    let hole = dummy.total_size();

    let site = discover_call_site(&vm, calc_entry);

    let add_id = vm.compile_method(MethodId::from(0)).unwrap();
    let add = vm.compiled_method(add_id).unwrap();
    let callee_old_start = add.object_start();

    vm.patch_direct_call(site, MethodId::from(0));

    // discard the method between caller and callee, then compact
    vm.evict_method(dummy_id);
    vm.compact();

    // the caller did not move; the callee slid down over the hole
    assert_eq!(calc.object_start(), caller_start);
    assert_eq!(add.object_start(), callee_old_start.sub(hole));

    // the table tracks the new callee address
    {
        let patches = vm.patches();
        let entry = patches.entry_for_site(site).expect("entry dropped");
        assert_eq!(entry.callee, add.object_start());
        assert_eq!(entry.caller, caller_start);
    }

    // the encoded displacement equals one computed from scratch against
    // the callee's new address
    let word = vm.space().read_u32(site);
    let (_, _, disp) = decode_branch(word).unwrap();
    let expected_disp =
        (add.instruction_start().to_u32() as i64 - (site.to_u32() as i64 + 8)) / 4;
    assert_eq!(disp as i64, expected_disp);

    // and execution still works on the compacted layout
    let mut sim = sim_for(&vm);
    assert_eq!(sim.run(calc_entry, &[2, 3], stack_top()), 6);
}

#[test]
fn eviction_of_callee_unpatches_site() {
    let vm = make_vm(call_program());

    let calc_id = vm.compile_method(MethodId::from(1)).unwrap();
    let calc_entry = vm
        .compiled_method(calc_id)
        .unwrap()
        .instruction_start()
        .to_u32();

    let site = discover_call_site(&vm, calc_entry);
    let add_id = vm.compile_method(MethodId::from(0)).unwrap();
    vm.patch_direct_call(site, MethodId::from(0));

    vm.evict_method(add_id);

    // the site reverted to the block-indirect call, and the block
    // routes to the interpreter again
    assert_eq!(vm.space().read_u32(site), LDR_PC_BLOCK);
    assert_eq!(
        vm.method_entry(MethodId::from(0)),
        vm.entries.interpreter_bridge
    );

    let mut sim = sim_for(&vm);
    sim.hook(vm.entries.interpreter_bridge.to_u32(), |cpu| {
        cpu.regs[0] = cpu.regs[0].wrapping_add(cpu.regs[1]);
    });
    assert_eq!(sim.run(calc_entry, &[4, 5], stack_top()), 10);
}

#[test]
fn eviction_cascades_to_direct_callers() {
    let vm = make_vm(call_program());

    // callee first: calc compiles a direct branch to add
    let add_id = vm.compile_method(MethodId::from(0)).unwrap();
    let calc_id = vm.compile_method(MethodId::from(1)).unwrap();
    assert!(vm.compiled_method(calc_id).unwrap().has_branch_relocs());

    vm.evict_method(add_id);

    // calc's direct branch cannot be repaired, so calc went away too
    assert!(vm.compiled_method(calc_id).is_none());
    assert_eq!(
        vm.method_entry(MethodId::from(1)),
        vm.entries.interpreter_bridge
    );
}

struct ShiftingHeap {
    from: Address,
    to: Address,
}

impl HeapAccess for ShiftingHeap {
    fn relocate(&self, object: Address) -> Address {
        if object == self.from {
            self.to
        } else {
            object
        }
    }

    fn is_collecting(&self) -> bool {
        false
    }
}

#[test]
fn compaction_relocates_embedded_object_references() {
    // Object lit() { return "s"; } -- the string literal is an embedded
    // object reference in the literal pool
    let old_string = Address::from(common::HEAP_BASE + 0x300);
    let new_string = Address::from(common::HEAP_BASE + 0x400);

    let program = one_class_program(vec![static_method(
        "lit",
        0,
        1,
        1,
        Some(BasicType::Object),
        vec![0x12, 0x00, 0xB0],
        vec![ConstPoolEntry::String(old_string.to_u32() as usize)],
    )]);
    let vm = make_vm_with_heap(
        program,
        Box::new(ShiftingHeap {
            from: old_string,
            to: new_string,
        }),
    );

    let code_id = vm.compile_method(MethodId::from(0)).unwrap();
    let method = vm.compiled_method(code_id).unwrap();
    assert!(method.has_object_refs());

    let entry = method.instruction_start().to_u32();

    let mut sim = sim_for(&vm);
    assert_eq!(sim.run(entry, &[], stack_top()), old_string.to_u32());

    // the heap moved the string; compaction fixes the embedded word
    vm.compact();

    let mut sim = sim_for(&vm);
    assert_eq!(sim.run(entry, &[], stack_top()), new_string.to_u32());
}
