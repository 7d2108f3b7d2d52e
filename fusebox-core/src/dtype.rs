use std::fmt::{self, Display};

use half::{bf16, f16};

/// Element type of a logical tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    Undef,
    F16,
    Bf16,
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    pub const fn size_in_bytes(&self) -> usize {
        match self {
            Self::Undef => 0,
            Self::F16 | Self::Bf16 => 2,
            Self::F32 | Self::S32 => 4,
            Self::S8 | Self::U8 => 1,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Undef => "undef",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::F32 => "f32",
            Self::S32 => "s32",
            Self::S8 => "s8",
            Self::U8 => "u8",
        }
    }

    pub const fn is_integral(&self) -> bool {
        matches!(self, Self::S32 | Self::S8 | Self::U8)
    }

    /// Decode the element at `idx` of a raw buffer.
    ///
    /// `Undef` decodes as zero.
    pub fn read(&self, bytes: &[u8], idx: usize) -> f32 {
        let size = self.size_in_bytes();
        let at = &bytes[idx * size..(idx + 1) * size];
        match self {
            Self::Undef => 0.0,
            Self::F16 => f16::from_le_bytes([at[0], at[1]]).to_f32(),
            Self::Bf16 => bf16::from_le_bytes([at[0], at[1]]).to_f32(),
            Self::F32 => f32::from_le_bytes([at[0], at[1], at[2], at[3]]),
            Self::S32 => i32::from_le_bytes([at[0], at[1], at[2], at[3]]) as f32,
            Self::S8 => at[0] as i8 as f32,
            Self::U8 => at[0] as f32,
        }
    }

    /// Encode `v` into the element at `idx`. Integral types round to nearest and saturate.
    pub fn write(&self, bytes: &mut [u8], idx: usize, v: f32) {
        let size = self.size_in_bytes();
        let at = &mut bytes[idx * size..(idx + 1) * size];
        match self {
            Self::Undef => {}
            Self::F16 => at.copy_from_slice(&f16::from_f32(v).to_le_bytes()),
            Self::Bf16 => at.copy_from_slice(&bf16::from_f32(v).to_le_bytes()),
            Self::F32 => at.copy_from_slice(&v.to_le_bytes()),
            // `as` saturates on float -> int conversions
            Self::S32 => at.copy_from_slice(&(v.round() as i32).to_le_bytes()),
            Self::S8 => at[0] = v.round() as i8 as u8,
            Self::U8 => at[0] = v.round() as u8,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
