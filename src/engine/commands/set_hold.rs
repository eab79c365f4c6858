use crate::prelude::*;

pub struct SetHold {
    register: u16,
    value: u16,
}

impl SetHold {
    pub fn new(register: u16, value: u16) -> Self {
        Self { register, value }
    }

    pub async fn run(&self, session: &mut Session, timeout: Duration) -> Result<(), WriteError> {
        let request = TranslatedData::write_single(
            session.datalog(),
            session.serial(),
            self.register,
            self.value,
        );

        info!(
            "inverter {}: setting hold register {} to {}",
            session.datalog(),
            self.register,
            self.value
        );

        let reply = session
            .exchange(&request, timeout)
            .await
            .map_err(write_error)?;

        if reply.value() != Some(self.value) {
            return Err(WriteError::Rejected(format!(
                "register {} read back {:?} (wanted {})",
                self.register,
                reply.value(),
                self.value
            )));
        }

        Ok(())
    }
}

pub(crate) fn write_error(err: ExchangeError) -> WriteError {
    match err {
        ExchangeError::Frame(e) => WriteError::Rejected(e.to_string()),
        e => WriteError::Unreachable(e),
    }
}
