//! Creation and extraction of the 29-bit CAN identifiers defined by
//! SAE J1939-21 and reused by ISO 11783.
use crate::core::GLOBAL_ADDRESS;
use crate::error::CanIdBuildError;

/// PGN value reported for identifiers that do not carry one (11-bit IDs).
pub const UNDEFINED_PGN: u32 = 0xFFFF_FFFF;

/// PDU-format byte at which a PGN stops carrying a destination address.
const PDU2_FORMAT_THRESHOLD: u8 = 0xF0;

//==================================================================================CAN_ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Encapsulates a CAN identifier and exposes accessors for priority, PGN,
/// destination, and source.
///
/// Identifiers at or below `0x7FF` are treated as 11-bit standard
/// identifiers; everything larger is a 29-bit extended identifier. The
/// J1939 fields are only meaningful for extended identifiers.
pub struct CanId(pub u32);

/// Distinguishes standard (11-bit) from extended (29-bit) identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdKind {
    Standard,
    Extended,
}

impl CanId {
    /// Creates a pre-configured [`CanIdBuilder`] for a PGN and source address.
    pub fn builder(pgn: u32, source_address: u8) -> CanIdBuilder {
        CanIdBuilder::new(pgn, source_address)
    }

    /// Whether the raw value addresses the standard or the extended space.
    pub const fn kind(&self) -> IdKind {
        if self.0 <= 0x7FF {
            IdKind::Standard
        } else {
            IdKind::Extended
        }
    }

    /// Returns `true` when the raw value fits its identifier space.
    pub const fn is_valid(&self) -> bool {
        self.0 <= 0x1FFF_FFFF
    }

    /// Priority encoded in bits 26-28 (0 is highest, 7 lowest).
    /// Standard identifiers always report the highest priority.
    pub const fn priority(&self) -> u8 {
        match self.kind() {
            IdKind::Extended => ((self.0 >> 26) & 0x07) as u8,
            IdKind::Standard => 0,
        }
    }

    /// Extracts the 18-bit PGN, handling the PDU1/PDU2 distinction.
    ///
    /// PDU2 (PF >= 240): the PS byte belongs to the PGN, mask `0x3FFFF`.
    /// PDU1 (PF < 240): the PS byte is the destination, mask `0x3FF00`.
    /// Standard identifiers yield [`UNDEFINED_PGN`].
    pub const fn pgn(&self) -> u32 {
        match self.kind() {
            IdKind::Extended => {
                let pf = ((self.0 >> 16) & 0xFF) as u8;
                if pf >= PDU2_FORMAT_THRESHOLD {
                    (self.0 >> 8) & 0x3FFFF
                } else {
                    (self.0 >> 8) & 0x3FF00
                }
            }
            IdKind::Standard => UNDEFINED_PGN,
        }
    }

    /// Destination address: the PS byte for destination-specific PGNs,
    /// otherwise the global address.
    pub const fn destination_address(&self) -> u8 {
        match self.kind() {
            IdKind::Extended => {
                let pf = ((self.0 >> 16) & 0xFF) as u8;
                if pf >= PDU2_FORMAT_THRESHOLD {
                    GLOBAL_ADDRESS
                } else {
                    ((self.0 >> 8) & 0xFF) as u8
                }
            }
            IdKind::Standard => GLOBAL_ADDRESS,
        }
    }

    /// Eight-bit source address in the low byte of the identifier.
    pub const fn source_address(&self) -> u8 {
        match self.kind() {
            IdKind::Extended => (self.0 & 0xFF) as u8,
            IdKind::Standard => GLOBAL_ADDRESS,
        }
    }
}

//==================================================================================CAN_ID_BUILDER
#[derive(Debug)]
/// Fluent builder that enforces the PDU1/PDU2 rules at construction time.
pub struct CanIdBuilder {
    priority: u8,
    pgn: u32,
    source_address: u8,
    destination: Option<u8>,
}

impl CanIdBuilder {
    /// Initializes the builder for a given PGN and source address with the
    /// default priority (6).
    pub fn new(pgn: u32, source_address: u8) -> Self {
        Self {
            priority: 6,
            pgn,
            source_address,
            destination: None,
        }
    }

    /// Sets the priority (3 bits) to use during construction.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority & 0x07;
        self
    }

    /// Assigns a destination address. `0xFF` is equivalent to broadcast.
    pub fn to_destination(mut self, destination_address: u8) -> Self {
        self.destination = Some(destination_address);
        self
    }

    /// Builds the identifier while applying the J1939-21 rules:
    /// - PF >= 240 (PDU2): the PGN is broadcast-only; a non-global
    ///   destination is rejected.
    /// - PF < 240 (PDU1): the PS byte of the PGN itself must be zero; the
    ///   destination byte is the explicit target, or `0xFF` for broadcast.
    pub fn build(self) -> Result<CanId, CanIdBuildError> {
        if self.pgn > 0x3FFFF {
            return Err(CanIdBuildError::InvalidParameterGroupNumber(self.pgn));
        }

        let pf = ((self.pgn >> 8) & 0xFF) as u8;
        let ps = (self.pgn & 0xFF) as u8;
        let base = ((self.priority as u32) << 26) | (self.source_address as u32);

        let id = match self.destination {
            None | Some(GLOBAL_ADDRESS) => {
                if pf >= PDU2_FORMAT_THRESHOLD {
                    base | ((self.pgn & 0x3FFFF) << 8)
                } else {
                    if ps != 0 {
                        return Err(CanIdBuildError::PsMustBeNull);
                    }
                    base | ((self.pgn & 0x3FF00) << 8) | ((GLOBAL_ADDRESS as u32) << 8)
                }
            }
            Some(destination) => {
                if pf >= PDU2_FORMAT_THRESHOLD {
                    return Err(CanIdBuildError::InvalidForDestinationSpecific { pgn: self.pgn });
                }
                if ps != 0 {
                    return Err(CanIdBuildError::PsMustBeNull);
                }
                base | ((self.pgn & 0x3FF00) << 8) | ((destination as u32) << 8)
            }
        };

        Ok(CanId(id))
    }
}
