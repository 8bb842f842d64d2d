pub mod filter;
pub mod types;

pub use filter::TableFilter;
pub use types::{bytes_value, Action, Event, RowAction, RowsEvent};
