mod collector;
mod heap;

pub use heap::*;
