//! SQLite implementations of storage interfaces.

mod event_record_store;
mod student_store;
mod transaction;

pub use event_record_store::SqliteEventRecordStore;
pub use student_store::SqliteStudentStore;
pub use transaction::WriteTransaction;
