//! Little-endian field access over byte slices.
//!
//! Binary firmware structures are read and written field by field at fixed
//! byte offsets. [`FromBytes`] and [`IntoBytes`] provide bounds-checked
//! accessors for the primitive widths those structures are built from;
//! multi-byte integers are always little-endian, matching the ACPI and UEFI
//! on-disk layouts.

/// Types that can be read from a little-endian byte slice.
pub trait FromBytes: Sized {
    /// The encoded size of this type in bytes.
    const SIZE: usize;

    /// Read a value from the start of `data`.
    ///
    /// Returns `None` if `data` is shorter than [`Self::SIZE`].
    fn read_from(data: &[u8]) -> Option<Self>;

    /// Read a value at byte `offset` into `data`.
    ///
    /// Returns `None` if the field does not fit within `data`.
    fn read_at(data: &[u8], offset: usize) -> Option<Self> {
        Self::read_from(data.get(offset..)?)
    }
}

/// Types that can be written into a little-endian byte slice.
pub trait IntoBytes: Sized {
    /// The encoded size of this type in bytes.
    const SIZE: usize;

    /// Write the value at byte `offset` into `data`.
    ///
    /// Returns `None` (and leaves `data` untouched) if the field does not
    /// fit within `data`.
    fn write_at(&self, data: &mut [u8], offset: usize) -> Option<()>;
}

macro_rules! impl_int_bytes {
    ($($ty:ty),*) => {
        $(
            impl FromBytes for $ty {
                const SIZE: usize = size_of::<$ty>();

                // Qualified: these types implement both traits and each
                // declares a SIZE.
                fn read_from(data: &[u8]) -> Option<Self> {
                    let bytes = data.get(..<Self as FromBytes>::SIZE)?;
                    let mut buf = [0u8; size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    Some(<$ty>::from_le_bytes(buf))
                }
            }

            impl IntoBytes for $ty {
                const SIZE: usize = size_of::<$ty>();

                fn write_at(&self, data: &mut [u8], offset: usize) -> Option<()> {
                    let end = offset.checked_add(<Self as IntoBytes>::SIZE)?;
                    let dst = data.get_mut(offset..end)?;
                    dst.copy_from_slice(&self.to_le_bytes());
                    Some(())
                }
            }
        )*
    };
}

impl_int_bytes!(u8, u16, u32, u64);

impl<const N: usize> FromBytes for [u8; N] {
    const SIZE: usize = N;

    fn read_from(data: &[u8]) -> Option<Self> {
        let bytes = data.get(..N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Some(buf)
    }
}

impl<const N: usize> IntoBytes for [u8; N] {
    const SIZE: usize = N;

    fn write_at(&self, data: &mut [u8], offset: usize) -> Option<()> {
        let end = offset.checked_add(N)?;
        let dst = data.get_mut(offset..end)?;
        dst.copy_from_slice(self);
        Some(())
    }
}
