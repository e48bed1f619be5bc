pub mod aggregate_table;
pub mod controls;
pub mod debug;
pub mod selector;
