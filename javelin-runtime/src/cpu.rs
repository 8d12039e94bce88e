pub use self::arm::*;

pub mod arm;

/// A core register of the target.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub fn int(self) -> u8 {
        self.0
    }
}

/// A VFP single-precision register. A `double` value occupies an
/// even/odd pair.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct FReg(pub u8);

impl FReg {
    pub fn int(self) -> u8 {
        self.0
    }
}
