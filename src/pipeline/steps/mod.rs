pub mod fn_stage;
pub mod record_stage;

pub use fn_stage::FnStage;
pub use record_stage::{Processor, RecordStage, DEFAULT_BATCH_SIZE};
