mod frame_header;
mod lru_k_replacer;
mod page_cache;
mod page_guard;

pub use frame_header::*;
pub use lru_k_replacer::*;
pub use page_cache::*;
pub use page_guard::{PageMut, PageRef};
