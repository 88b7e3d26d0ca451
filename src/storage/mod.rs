pub mod fixed_page;
pub mod heap_file;
pub mod heap_page;

pub use fixed_page::{FixedPage, FixedPageManager};
pub use heap_file::HeapFile;
pub use heap_page::HeapPage;
