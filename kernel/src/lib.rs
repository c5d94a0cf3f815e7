//! The MarrowOS virtual-memory core: demand paging over a fixed frame pool,
//! per-process supplemental page tables, and a bitmap-managed swap area,
//! tied together by a global second-chance eviction sweep.
//!
//! Freestanding targets build this crate without `std`; hosted builds keep
//! it so the whole core runs under `cargo test`.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod user_program;
