use crate::prelude::*;

use super::{read_bank::ReadBank, set_hold::SetHold};

/// Read-modify-write of the bits in `mask`, leaving every other bit of the
/// register as the device reported it.
pub struct UpdateHold {
    register: u16,
    mask: u16,
    enable: bool,
}

impl UpdateHold {
    pub fn new(register: u16, mask: u16, enable: bool) -> Self {
        Self {
            register,
            mask,
            enable,
        }
    }

    /// Returns the value written.
    pub async fn run(&self, session: &mut Session, timeout: Duration) -> Result<u16, WriteError> {
        let bank = Bank::new(RegisterKind::Hold, self.register, 1);
        let reading = ReadBank::new(bank)
            .run(session, timeout)
            .await
            .map_err(|e| match e {
                ExchangeError::Frame(e) => WriteError::Stale(e),
                e => WriteError::Unreachable(e),
            })?;

        let current = reading.words[0];
        let new_value = masked_value(current, self.mask, self.enable);

        debug!(
            "inverter {}: register {} {:#06x} -> {:#06x} (mask {:#06x})",
            session.datalog(),
            self.register,
            current,
            new_value,
            self.mask
        );

        SetHold::new(self.register, new_value)
            .run(session, timeout)
            .await?;

        Ok(new_value)
    }
}

pub fn masked_value(current: u16, mask: u16, enable: bool) -> u16 {
    if enable {
        current | mask
    } else {
        current & !mask
    }
}
