mod btree_page;
mod cell;
mod freelist;
mod header;
mod varint;

pub use btree_page::*;
pub use cell::*;
pub use freelist::*;
pub use header::*;
pub use varint::*;
