//! ISO 11783 NAME field implementation (64 bits). The NAME uniquely
//! identifies a control function on the bus and is the arbitration key of
//! the address-claim procedure: the numerically lower full NAME wins.
//!
//! # Bit layout (little-endian order)
//!
//! ```text
//! Bits  0-20  (21 bits) : Identity number
//! Bits 21-31  (11 bits) : Manufacturer code
//! Bits 32-34  ( 3 bits) : ECU instance
//! Bits 35-39  ( 5 bits) : Function instance
//! Bits 40-47  ( 8 bits) : Function
//! Bit  48     ( 1 bit ) : Reserved
//! Bits 49-55  ( 7 bits) : Device class
//! Bits 56-59  ( 4 bits) : Device class instance
//! Bits 60-62  ( 3 bits) : Industry group
//! Bit  63     ( 1 bit ) : Arbitrary Address Capable
//! ```

use core::fmt;

/// Wrapper around the ISO 11783 NAME field (64 bits).
///
/// # Example
///
/// ```
/// use agribus::protocol::name::Name;
///
/// let name = Name::builder()
///     .identity_number(123456)
///     .manufacturer_code(69)
///     .function(29) // Virtual terminal
///     .device_class(0)
///     .industry_group(2) // Agriculture
///     .arbitrary_address_capable(true)
///     .build();
///
/// assert_eq!(name.identity_number(), 123456);
/// assert!(name.is_arbitrary_address_capable());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(u64);

impl Name {
    /// Build a `Name` from the raw value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the underlying `u64`, the value compared during arbitration.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Decode a NAME from the eight-byte payload of an address-claim
    /// message (little-endian, byte 0 = bits 0-7).
    #[inline]
    pub const fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// Encode the NAME as the address-claim payload.
    #[inline]
    pub const fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Create a builder to construct a `Name`.
    #[inline]
    pub const fn builder() -> NameBuilder {
        NameBuilder::new()
    }

    /// Identity number (bits 0-20, 21 bits). Distinguishes units of the
    /// same product line.
    #[inline]
    pub const fn identity_number(&self) -> u32 {
        (self.0 & 0x1F_FFFF) as u32
    }

    /// Manufacturer code (bits 21-31, 11 bits).
    #[inline]
    pub const fn manufacturer_code(&self) -> u16 {
        ((self.0 >> 21) & 0x7FF) as u16
    }

    /// ECU instance (bits 32-34, 3 bits).
    #[inline]
    pub const fn ecu_instance(&self) -> u8 {
        ((self.0 >> 32) & 0x07) as u8
    }

    /// Function instance (bits 35-39, 5 bits).
    #[inline]
    pub const fn function_instance(&self) -> u8 {
        ((self.0 >> 35) & 0x1F) as u8
    }

    /// Function code (bits 40-47, 8 bits).
    #[inline]
    pub const fn function(&self) -> u8 {
        ((self.0 >> 40) & 0xFF) as u8
    }

    /// Reserved bit (bit 48). Always transmitted as zero.
    #[inline]
    pub const fn reserved(&self) -> bool {
        ((self.0 >> 48) & 0x01) != 0
    }

    /// Device class (bits 49-55, 7 bits).
    #[inline]
    pub const fn device_class(&self) -> u8 {
        ((self.0 >> 49) & 0x7F) as u8
    }

    /// Device class instance (bits 56-59, 4 bits).
    #[inline]
    pub const fn device_class_instance(&self) -> u8 {
        ((self.0 >> 56) & 0x0F) as u8
    }

    /// Industry group (bits 60-62, 3 bits). Agricultural equipment uses `2`.
    #[inline]
    pub const fn industry_group(&self) -> u8 {
        ((self.0 >> 60) & 0x07) as u8
    }

    /// Arbitrary Address Capable bit (bit 63). A capable node may fall back
    /// to the dynamic range 128-247 when it loses arbitration.
    #[inline]
    pub const fn is_arbitrary_address_capable(&self) -> bool {
        ((self.0 >> 63) & 0x01) != 0
    }
}

impl From<u64> for Name {
    #[inline]
    fn from(raw: u64) -> Self {
        Self::from_raw(raw)
    }
}

impl From<Name> for u64 {
    #[inline]
    fn from(name: Name) -> Self {
        name.raw()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Name {{ identity: {}, mfg: {}, func: {}, class: {}, group: {}, aac: {} }}",
            self.identity_number(),
            self.manufacturer_code(),
            self.function(),
            self.device_class(),
            self.industry_group(),
            self.is_arbitrary_address_capable()
        )
    }
}

/// Fluent builder used to construct a `Name`.
#[derive(Debug, Clone, Copy)]
pub struct NameBuilder {
    raw: u64,
}

impl NameBuilder {
    /// Initialize the builder with all fields cleared.
    #[inline]
    pub const fn new() -> Self {
        Self { raw: 0 }
    }

    /// Set the identity number (bits 0-20, 21 bits).
    ///
    /// # Panics
    /// Panics when the value does not fit in 21 bits (> 0x1FFFFF).
    #[inline]
    pub const fn identity_number(mut self, value: u32) -> Self {
        assert!(value <= 0x1F_FFFF, "Identity number must fit in 21 bits");
        self.raw = (self.raw & !0x1F_FFFF) | (value as u64 & 0x1F_FFFF);
        self
    }

    /// Set the manufacturer code (bits 21-31, 11 bits).
    ///
    /// # Panics
    /// Panics when the value exceeds 11 bits (> 0x7FF).
    #[inline]
    pub const fn manufacturer_code(mut self, value: u16) -> Self {
        assert!(value <= 0x7FF, "Manufacturer code must fit in 11 bits");
        self.raw = (self.raw & !(0x7FF << 21)) | ((value as u64 & 0x7FF) << 21);
        self
    }

    /// Set the ECU instance (bits 32-34, 3 bits).
    ///
    /// # Panics
    /// Panics when the value exceeds 3 bits (> 0x07).
    #[inline]
    pub const fn ecu_instance(mut self, value: u8) -> Self {
        assert!(value <= 0x07, "ECU instance must fit in 3 bits");
        self.raw = (self.raw & !(0x07 << 32)) | ((value as u64 & 0x07) << 32);
        self
    }

    /// Set the function instance (bits 35-39, 5 bits).
    ///
    /// # Panics
    /// Panics when the value exceeds 5 bits (> 0x1F).
    #[inline]
    pub const fn function_instance(mut self, value: u8) -> Self {
        assert!(value <= 0x1F, "Function instance must fit in 5 bits");
        self.raw = (self.raw & !(0x1F << 35)) | ((value as u64 & 0x1F) << 35);
        self
    }

    /// Set the function code (bits 40-47, 8 bits).
    #[inline]
    pub const fn function(mut self, value: u8) -> Self {
        self.raw = (self.raw & !(0xFF << 40)) | ((value as u64) << 40);
        self
    }

    /// Set the device class (bits 49-55, 7 bits).
    ///
    /// # Panics
    /// Panics when the value exceeds 7 bits (> 0x7F).
    #[inline]
    pub const fn device_class(mut self, value: u8) -> Self {
        assert!(value <= 0x7F, "Device class must fit in 7 bits");
        self.raw = (self.raw & !(0x7F << 49)) | ((value as u64 & 0x7F) << 49);
        self
    }

    /// Set the device class instance (bits 56-59, 4 bits).
    ///
    /// # Panics
    /// Panics when the value exceeds 4 bits (> 0x0F).
    #[inline]
    pub const fn device_class_instance(mut self, value: u8) -> Self {
        assert!(value <= 0x0F, "Device class instance must fit in 4 bits");
        self.raw = (self.raw & !(0x0F << 56)) | ((value as u64 & 0x0F) << 56);
        self
    }

    /// Set the industry group (bits 60-62, 3 bits).
    ///
    /// # Panics
    /// Panics when the value exceeds 3 bits (> 0x07).
    #[inline]
    pub const fn industry_group(mut self, value: u8) -> Self {
        assert!(value <= 0x07, "Industry group must fit in 3 bits");
        self.raw = (self.raw & !(0x07 << 60)) | ((value as u64 & 0x07) << 60);
        self
    }

    /// Configure the Arbitrary Address Capable bit (bit 63).
    #[inline]
    pub const fn arbitrary_address_capable(mut self, value: bool) -> Self {
        self.raw = (self.raw & !(0x01 << 63)) | ((value as u64) << 63);
        self
    }

    /// Build the final `Name`.
    #[inline]
    pub const fn build(self) -> Name {
        Name(self.raw)
    }
}

impl Default for NameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//==================================================================================NAME_FILTER
/// The NAME parameter a [`NameFilter`] compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameField {
    IdentityNumber,
    ManufacturerCode,
    EcuInstance,
    FunctionInstance,
    Function,
    DeviceClass,
    DeviceClassInstance,
    IndustryGroup,
    ArbitraryAddressCapable,
}

/// Matches one parameter of a NAME against an expected value. Partner
/// control functions carry a set of these; a NAME matches the set when
/// every filter matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameFilter {
    field: NameField,
    value: u32,
}

impl NameFilter {
    /// Create a filter for one NAME parameter.
    pub const fn new(field: NameField, value: u32) -> Self {
        Self { field, value }
    }

    /// The parameter this filter inspects.
    pub const fn field(&self) -> NameField {
        self.field
    }

    /// The expected value.
    pub const fn value(&self) -> u32 {
        self.value
    }

    /// Check one NAME against this filter.
    pub fn matches(&self, name: &Name) -> bool {
        match self.field {
            NameField::IdentityNumber => name.identity_number() == self.value,
            NameField::ManufacturerCode => u32::from(name.manufacturer_code()) == self.value,
            NameField::EcuInstance => u32::from(name.ecu_instance()) == self.value,
            NameField::FunctionInstance => u32::from(name.function_instance()) == self.value,
            NameField::Function => u32::from(name.function()) == self.value,
            NameField::DeviceClass => u32::from(name.device_class()) == self.value,
            NameField::DeviceClassInstance => {
                u32::from(name.device_class_instance()) == self.value
            }
            NameField::IndustryGroup => u32::from(name.industry_group()) == self.value,
            NameField::ArbitraryAddressCapable => {
                name.is_arbitrary_address_capable() == (self.value != 0)
            }
        }
    }
}
