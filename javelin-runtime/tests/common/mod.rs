//! Shared harness: program construction, a `Vm` wired to test runtime
//! entries, and simulator setup over the device-memory layout.

// not every test binary uses every helper
#![allow(dead_code)]

pub mod sim;

use javelin_bytecode::{
    BasicType, ClassData, ClassId, ConstPoolEntry, MethodData, MethodKind, Program,
};
use javelin_runtime::cpu::LONG_MSW_FIRST;
use javelin_runtime::gc::{Address, FixedHeap};
use javelin_runtime::vm::{CompilerFlags, RuntimeEntries, Vm};

use sim::{Memory, Sim};

pub const ENTRY_BASE: u32 = 0xF000_0000;
pub const STACK_BASE: u32 = 0x00F0_0000;
pub const STACK_SIZE: usize = 0x4000;
pub const HEAP_BASE: u32 = 0x0020_0000;
pub const HEAP_SIZE: usize = 0x1_0000;
pub const CARD_REGION_SIZE: usize = 0x4000;

pub fn entries() -> RuntimeEntries {
    RuntimeEntries::with_base(Address::from(ENTRY_BASE))
}

pub fn make_vm(program: Program) -> Vm {
    Vm::new(
        program,
        entries(),
        Box::new(FixedHeap),
        CompilerFlags::default(),
    )
}

pub fn make_vm_with_flags(program: Program, flags: CompilerFlags) -> Vm {
    Vm::new(program, entries(), Box::new(FixedHeap), flags)
}

pub fn make_vm_with_heap(
    program: Program,
    heap: Box<dyn javelin_runtime::gc::HeapAccess>,
) -> Vm {
    Vm::new(program, entries(), heap, CompilerFlags::default())
}

pub fn static_method(
    name: &str,
    param_words: u32,
    max_locals: u32,
    max_stack: u32,
    return_type: Option<BasicType>,
    code: Vec<u8>,
    const_pool: Vec<ConstPoolEntry>,
) -> MethodData {
    MethodData {
        name: name.to_string(),
        class: ClassId::from(0),
        kind: MethodKind::Static,
        param_words,
        max_locals,
        max_stack,
        return_type,
        code,
        const_pool,
    }
}

pub fn one_class_program(methods: Vec<MethodData>) -> Program {
    Program {
        classes: vec![ClassData {
            name: "Harness".to_string(),
            instance_size: 16,
            vtable: Vec::new(),
        }],
        methods,
    }
}

pub fn stack_top() -> u32 {
    STACK_BASE + STACK_SIZE as u32
}

/// Fresh simulator over the vm's current method space and block area,
/// plus stack, heap and card-table regions.
pub fn sim_for(vm: &Vm) -> Sim {
    let mut mem = Memory::new();

    let (space_base, space_bytes) = vm.space().snapshot();
    mem.map(space_base.to_u32(), space_bytes);

    let (blocks_base, blocks_bytes) = vm.block_space().snapshot();
    mem.map(blocks_base.to_u32(), blocks_bytes);

    mem.map_zeroed(STACK_BASE, STACK_SIZE);
    mem.map_zeroed(HEAP_BASE, HEAP_SIZE);
    mem.map_zeroed(vm.entries.card_table.to_u32(), CARD_REGION_SIZE);

    let mut sim = Sim::new(mem);
    install_arith_hooks(&mut sim, &vm.entries);
    sim
}

fn long_from_pair(first: u32, second: u32) -> i64 {
    let (msw, lsw) = if LONG_MSW_FIRST {
        (first, second)
    } else {
        (second, first)
    };
    ((msw as i64) << 32) | lsw as i64 & 0xFFFF_FFFF
}

fn pair_from_long(value: i64) -> (u32, u32) {
    let msw = (value >> 32) as u32;
    let lsw = value as u32;
    if LONG_MSW_FIRST {
        (msw, lsw)
    } else {
        (lsw, msw)
    }
}

/// Hooks for the arithmetic runtime entries the compiled subset calls
/// out to (the target has no integer divider, and long multiply/divide
/// are library routines).
pub fn install_arith_hooks(sim: &mut Sim, entries: &RuntimeEntries) {
    sim.hook(entries.idiv.to_u32(), |cpu| {
        let (a, b) = (cpu.regs[0] as i32, cpu.regs[1] as i32);
        cpu.regs[0] = a.wrapping_div(b) as u32;
    });

    sim.hook(entries.irem.to_u32(), |cpu| {
        let (a, b) = (cpu.regs[0] as i32, cpu.regs[1] as i32);
        cpu.regs[0] = a.wrapping_rem(b) as u32;
    });

    sim.hook(entries.lmul.to_u32(), |cpu| {
        let a = long_from_pair(cpu.regs[0], cpu.regs[1]);
        let b = long_from_pair(cpu.regs[2], cpu.regs[3]);
        let (first, second) = pair_from_long(a.wrapping_mul(b));
        cpu.regs[0] = first;
        cpu.regs[1] = second;
    });

    sim.hook(entries.ldiv.to_u32(), |cpu| {
        let a = long_from_pair(cpu.regs[0], cpu.regs[1]);
        let b = long_from_pair(cpu.regs[2], cpu.regs[3]);
        let (first, second) = pair_from_long(a.wrapping_div(b));
        cpu.regs[0] = first;
        cpu.regs[1] = second;
    });

    sim.hook(entries.lrem.to_u32(), |cpu| {
        let a = long_from_pair(cpu.regs[0], cpu.regs[1]);
        let b = long_from_pair(cpu.regs[2], cpu.regs[3]);
        let (first, second) = pair_from_long(a.wrapping_rem(b));
        cpu.regs[0] = first;
        cpu.regs[1] = second;
    });
}
