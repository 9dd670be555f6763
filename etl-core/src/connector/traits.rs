use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::common::error::Result;
use crate::domain::{CancellationSignal, DataSchema, Record};

pub type RecordStream = BoxStream<'static, Result<Record>>;
pub type BatchStream = BoxStream<'static, Result<Vec<Record>>>;

/// Reader side of a data connector.
///
/// A stream returned by `read` is finite and is not restartable; call `read`
/// again to reopen the source.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn read(&self, cancel: &CancellationSignal) -> Result<RecordStream>;

    /// Group the record stream into batches of at most `batch_size`.
    ///
    /// A batch containing a failed read is reported as that error. The stream
    /// ends early once `cancel` fires.
    async fn read_batch(&self, batch_size: usize, cancel: &CancellationSignal) -> Result<BatchStream> {
        let records = self.read(cancel).await?;
        let signal = cancel.clone();
        let batches = records
            .take_until(async move { signal.cancelled().await })
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.into_iter().collect::<Result<Vec<_>>>())
            .boxed();
        Ok(batches)
    }

    async fn schema(&self) -> Result<DataSchema>;

    async fn estimated_record_count(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Outcome of one `write_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub is_successful: bool,
    pub records_written: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl WriteResult {
    pub fn success(records_written: usize) -> Self {
        Self {
            is_successful: true,
            records_written,
            errors: Vec::new(),
        }
    }

    pub fn failure(records_written: usize, errors: Vec<String>) -> Self {
        Self {
            is_successful: false,
            records_written,
            errors,
        }
    }
}

/// Writer side of a data connector.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn prepare(&self, schema: Option<&DataSchema>) -> Result<()>;

    async fn write_batch(&self, records: &[Record]) -> Result<WriteResult>;

    async fn finalize(&self) -> Result<()>;
}
