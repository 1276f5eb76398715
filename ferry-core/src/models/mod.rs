mod file_record;
mod job;
mod transfer;

pub use file_record::{Discovery, FileDescriptor, FileRecord};
pub use job::TransferJob;
pub use transfer::{Registration, TransferDescriptor, TransferRecord, TransferStatus, UnknownStatus};
