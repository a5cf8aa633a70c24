pub mod canon;
pub mod compose;
pub mod config;
mod db;
mod densemap;
pub mod depfile;
pub mod engine;
pub mod graph;
mod hash;
mod pool;
pub mod progress;
pub mod run;
mod smallmap;
mod task;
mod terminal;
pub mod work;

pub use engine::{CopyMode, Engine};
pub use graph::{FileId, FileKind};

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
