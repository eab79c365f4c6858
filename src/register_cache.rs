use crate::prelude::*;

use std::collections::HashMap;
use std::sync::Mutex;

/// Last raw value seen for every polled register, so writes and status
/// queries don't need a round trip. Not a source of truth for
/// read-modify-write; that always reads the device first.
#[derive(Default)]
pub struct RegisterCache {
    register_data: Mutex<HashMap<(RegisterKind, u16), u16>>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: RegisterKind, register: u16) -> Option<u16> {
        self.data().get(&(kind, register)).copied()
    }

    pub fn set(&self, kind: RegisterKind, register: u16, value: u16) {
        self.data().insert((kind, register), value);
    }

    pub fn store_bank(&self, reading: &BankReading) {
        let mut data = self.data();
        for (offset, value) in reading.words.iter().enumerate() {
            let register = reading.start.wrapping_add(offset as u16);
            data.insert((reading.kind, register), *value);
        }
    }

    fn data(&self) -> std::sync::MutexGuard<'_, HashMap<(RegisterKind, u16), u16>> {
        self.register_data.lock().unwrap_or_else(|e| e.into_inner())
    }
}
