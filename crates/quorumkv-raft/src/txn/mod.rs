//! Client sessions exposed as transactions.

mod manager;

pub use manager::{Session, TransactionManager};
