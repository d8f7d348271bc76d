pub mod alloc;
pub mod block_io;
pub mod ops;
pub mod path;
