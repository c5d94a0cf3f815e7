pub mod tempfs;

pub use tempfs::File;
