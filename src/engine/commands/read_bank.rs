use crate::prelude::*;

pub struct ReadBank {
    bank: Bank,
}

impl ReadBank {
    pub fn new(bank: Bank) -> Self {
        Self { bank }
    }

    pub async fn run(&self, session: &mut Session, timeout: Duration) -> Result<BankReading, ExchangeError> {
        let bank = self.bank;
        let request = TranslatedData::read(
            bank.kind,
            session.datalog(),
            session.serial(),
            bank.start,
            bank.count,
        );

        let reply = session.exchange(&request, timeout).await?;

        if reply.values.len() != bank.count as usize {
            return Err(FrameError::Truncated {
                expected: bank.count as usize * 2,
                actual: reply.values.len() * 2,
            }
            .into());
        }

        trace!("inverter {}: read {} = {:?}", session.datalog(), bank, reply.values);

        Ok(BankReading {
            kind: bank.kind,
            start: bank.start,
            words: reply.values,
        })
    }
}
