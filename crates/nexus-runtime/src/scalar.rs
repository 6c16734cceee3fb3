//! By-value kernel arguments.

use std::fmt;

use nexus_abi::ScalarArg;

/// A scalar bound to a command slot with [`Command::set_scalar`](crate::Command::set_scalar).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    /// Width of the value in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            ScalarValue::I32(_) | ScalarValue::U32(_) | ScalarValue::F32(_) => 4,
            ScalarValue::I64(_) | ScalarValue::U64(_) | ScalarValue::F64(_) => 8,
        }
    }

    /// The argument cell handed to a launch.
    pub(crate) fn to_cell(self) -> u64 {
        match self {
            ScalarValue::I32(v) => v.to_cell(),
            ScalarValue::U32(v) => v.to_cell(),
            ScalarValue::I64(v) => v.to_cell(),
            ScalarValue::U64(v) => v.to_cell(),
            ScalarValue::F32(v) => v.to_cell(),
            ScalarValue::F64(v) => v.to_cell(),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::I32(v) => write!(f, "{v}i32"),
            ScalarValue::U32(v) => write!(f, "{v}u32"),
            ScalarValue::I64(v) => write!(f, "{v}i64"),
            ScalarValue::U64(v) => write!(f, "{v}u64"),
            ScalarValue::F32(v) => write!(f, "{v}f32"),
            ScalarValue::F64(v) => write!(f, "{v}f64"),
        }
    }
}

macro_rules! scalar_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for ScalarValue {
            fn from(value: $t) -> Self {
                ScalarValue::$variant(value)
            }
        })*
    };
}

scalar_from!(i32 => I32, u32 => U32, i64 => I64, u64 => U64, f32 => F32, f64 => F64);
