// Entry signal module
pub mod crossover;

pub use crossover::{crossover_event, detect_crossover};
