use super::*;

/// A host type that can be stored in a device cell.
///
/// `Pod` guarantees that the value round-trips through raw bytes, which is all
/// the allocator layer ever moves between address spaces.
pub trait Element: bytemuck::Pod + std::fmt::Debug + PartialEq + 'static {
    const DTYPE: ScalarDType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl Element for $ty { const DTYPE: ScalarDType = $dtype; })*
    };
}

impl_element! {
    i8 => ScalarDType::Int8, i16 => ScalarDType::Int16, i32 => ScalarDType::Int32, i64 => ScalarDType::Int64,
    u8 => ScalarDType::UInt8, u16 => ScalarDType::UInt16, u32 => ScalarDType::UInt32, u64 => ScalarDType::UInt64,
    f32 => ScalarDType::Float32, f64 => ScalarDType::Float64,
}
