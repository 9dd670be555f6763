pub mod memory;
pub mod traits;

pub use memory::{MemorySink, MemorySource};
pub use traits::{BatchStream, DestinationConnector, RecordStream, SourceConnector, WriteResult};
