//! Local physical operators.

pub mod filter;
pub mod projection;
pub mod root;
pub mod scan;
pub mod union;

pub use filter::Filter;
pub use projection::Project;
pub use root::{InsertRoot, SinkRoot};
pub use scan::TableScan;
pub use union::UnionAll;
