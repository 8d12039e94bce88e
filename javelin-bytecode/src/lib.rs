pub mod data;
pub mod program;
pub mod reader;

pub use data::{BasicType, BytecodeOpcode};
pub use program::{
    ClassData, ClassId, ConstPoolEntry, MethodData, MethodId, MethodKind, Program,
    ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, OBJECT_HEADER_SIZE, VTABLE_OFFSET,
};
pub use reader::{operand_width, BytecodeReader};
