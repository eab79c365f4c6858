pub mod read_bank;
pub mod set_hold;
pub mod update_hold;
