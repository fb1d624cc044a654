use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod augmentation;
pub mod candidates;
pub mod cells;
pub mod combinations;
pub mod common;
pub mod engine;
pub mod input;
pub mod substrate;
