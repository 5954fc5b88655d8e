/// Define a plain 32-bit DM register: a newtype over the raw value with
/// its DMI address and name attached through [`DebugRegister`], plus the
/// `u32` conversions the typed read/write helpers rely on.
macro_rules! dm_register {
    ($(#[$meta:meta])* $vis:vis $name:ident @ $addr:literal, $reg_name:literal) => {
        $(#[$meta])*
        $vis struct $name(pub u32);

        impl DebugRegister for $name {
            const ADDRESS: u8 = $addr;
            const NAME: &'static str = $reg_name;
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u32 {
            fn from(register: $name) -> Self {
                register.0
            }
        }
    };
}
