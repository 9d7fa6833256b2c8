use crate::error::WireError;
use std::mem::size_of;

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> Result<$ty, WireError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(WireError::ShortBuffer {
                    needed: size_of::<$ty>(),
                    available: self.remaining(),
                });
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads for parsing untrusted datagrams: running past the end of the buffer is
///  reported as [WireError::ShortBuffer] rather than a panic
pub trait BufExt: bytes::Buf {
    get_checked_impl!(get_u8_checked, u8, get_u8);
    get_checked_impl!(get_u16_le_checked, u16, get_u16_le);
    get_checked_impl!(get_u32_le_checked, u32, get_u32_le);
    get_checked_impl!(get_i32_le_checked, i32, get_i32_le);
    get_checked_impl!(get_u32_checked, u32, get_u32);
}

impl <T: bytes::Buf> BufExt for T {
}
