mod backend;
pub mod fake_backend;
mod fields;
pub mod mmap;
pub mod units;
mod utils;

pub use crate::{
    backend::Backend,
    fake_backend::FakeBackend,
    fields::Field,
    mmap::MmapBackend,
    utils::{Hex, ShortHex, WordDump},
};
