use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::NexusError;

/// Element type tag carried by buffers and host regions.
///
/// The runtime only stores the tag; kernels decide how to interpret the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    I8,
    U8,
    I16,
    U16,
    I32,
    I64,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 16-bit Brain Float
    BF16,
    F32,
    F64,
    /// Opaque bytes.
    #[default]
    Undefined,
}

impl DataType {
    /// Size in bytes of a single element, or None for `Undefined`.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DataType::I8 | DataType::U8 => Some(1),
            DataType::I16 | DataType::U16 | DataType::F16 | DataType::BF16 => Some(2),
            DataType::I32 | DataType::F32 => Some(4),
            DataType::I64 | DataType::F64 => Some(8),
            DataType::Undefined => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F16 | DataType::BF16 | DataType::F32 | DataType::F64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::I8
                | DataType::U8
                | DataType::I16
                | DataType::U16
                | DataType::I32
                | DataType::I64
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::I16 => "i16",
            DataType::U16 => "u16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

impl FromStr for DataType {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "i8" => Ok(DataType::I8),
            "u8" => Ok(DataType::U8),
            "i16" => Ok(DataType::I16),
            "u16" => Ok(DataType::U16),
            "i32" => Ok(DataType::I32),
            "i64" => Ok(DataType::I64),
            "f16" => Ok(DataType::F16),
            "bf16" => Ok(DataType::BF16),
            "f32" => Ok(DataType::F32),
            "f64" => Ok(DataType::F64),
            "undefined" => Ok(DataType::Undefined),
            other => Err(NexusError::Unsupported(format!("data type '{other}'"))),
        }
    }
}

/// Host scalar types with a fixed [`DataType`] tag.
pub trait Element: bytemuck::Pod {
    const DTYPE: DataType;
}

macro_rules! element {
    ($($t:ty => $tag:ident),* $(,)?) => {
        $(impl Element for $t {
            const DTYPE: DataType = DataType::$tag;
        })*
    };
}

element!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DataType::F32.element_size(), Some(4));
        assert_eq!(DataType::BF16.element_size(), Some(2));
        assert_eq!(DataType::I64.element_size(), Some(8));
        assert_eq!(DataType::Undefined.element_size(), None);
    }

    #[test]
    fn test_categories() {
        assert!(DataType::F16.is_float());
        assert!(!DataType::F16.is_integer());
        assert!(DataType::U16.is_integer());
        assert!(!DataType::Undefined.is_float());
    }

    #[test]
    fn test_parse_roundtrip_names() {
        for dt in [DataType::I8, DataType::BF16, DataType::F64, DataType::Undefined] {
            assert_eq!(dt.to_string().parse::<DataType>().unwrap(), dt);
        }
        assert_eq!("F32".parse::<DataType>().unwrap(), DataType::F32);
        assert_eq!("q4".parse::<DataType>().unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_element_tags() {
        assert_eq!(<f32 as Element>::DTYPE, DataType::F32);
        assert_eq!(<u16 as Element>::DTYPE, DataType::U16);
    }
}
