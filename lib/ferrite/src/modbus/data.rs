//! Data-map capabilities behind the slave engine. User code supplies its
//! own bank implementations (mapped onto hardware, usually); `ArrayBank` is
//! the default contiguous backing, sized once at construction.

use super::Exception;
use crate::error::{ErrorKind, ProtoError, ProtoResult};

/// Discrete (single-bit) access. `write` selects the direction: false reads
/// the coil into `value`, true writes `value` into the coil.
pub trait CoilBank {
    fn coil(&mut self, addr: u16, value: &mut bool, write: bool) -> Result<(), Exception>;
}

/// 16-bit register access, same shape as `CoilBank`.
pub trait RegisterBank {
    fn register(&mut self, addr: u16, value: &mut u16, write: bool) -> Result<(), Exception>;
}

/// The four Modbus data tables a slave serves.
pub struct DataMap {
    pub coils: Box<dyn CoilBank>,
    pub discrete_inputs: Box<dyn CoilBank>,
    pub holding: Box<dyn RegisterBank>,
    pub inputs: Box<dyn RegisterBank>,
}

impl DataMap {
    /// Default map backed by contiguous arrays of the given sizes.
    pub fn arrays(
        coils: usize,
        discrete_inputs: usize,
        holding: usize,
        inputs: usize,
    ) -> ProtoResult<DataMap> {
        Ok(DataMap {
            coils: Box::new(ArrayBank::coils(coils)?),
            discrete_inputs: Box::new(ArrayBank::coils(discrete_inputs)?),
            holding: Box::new(ArrayBank::registers(holding)?),
            inputs: Box::new(ArrayBank::registers(inputs)?),
        })
    }
}

/// Fixed-capacity array backing. The capacity is decided at construction
/// from configuration; nothing grows at runtime.
pub struct ArrayBank {
    coils: Vec<bool>,
    registers: Vec<u16>,
}

impl ArrayBank {
    /// Largest addressable table in the protocol.
    pub const MAX_ENTRIES: usize = 65536;

    pub fn new(coil_count: usize, register_count: usize) -> ProtoResult<ArrayBank> {
        if coil_count > Self::MAX_ENTRIES || register_count > Self::MAX_ENTRIES {
            return Err(ProtoError::Fatal(ErrorKind::IllegalDataValue));
        }

        Ok(ArrayBank {
            coils: vec![false; coil_count],
            registers: vec![0; register_count],
        })
    }

    #[inline]
    pub fn coils(count: usize) -> ProtoResult<ArrayBank> {
        Self::new(count, 0)
    }

    #[inline]
    pub fn registers(count: usize) -> ProtoResult<ArrayBank> {
        Self::new(0, count)
    }
}

impl CoilBank for ArrayBank {
    fn coil(&mut self, addr: u16, value: &mut bool, write: bool) -> Result<(), Exception> {
        let slot = self
            .coils
            .get_mut(addr as usize)
            .ok_or(Exception::IllegalDataAddress)?;

        if write {
            *slot = *value;
        } else {
            *value = *slot;
        }

        Ok(())
    }
}

impl RegisterBank for ArrayBank {
    fn register(&mut self, addr: u16, value: &mut u16, write: bool) -> Result<(), Exception> {
        let slot = self
            .registers
            .get_mut(addr as usize)
            .ok_or(Exception::IllegalDataAddress)?;

        if write {
            *slot = *value;
        } else {
            *value = *slot;
        }

        Ok(())
    }
}
