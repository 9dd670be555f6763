use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::traits::{DestinationConnector, RecordStream, SourceConnector, WriteResult};
use crate::common::error::{EtlError, Result};
use crate::domain::{CancellationSignal, DataSchema, Record};

/// Source backed by a fixed list of records.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    records: Arc<Vec<Record>>,
    schema: Option<DataSchema>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(records),
            schema: None,
        }
    }

    /// Advertise an explicit schema instead of inferring one from the first record.
    pub fn with_schema(mut self, schema: DataSchema) -> Self {
        self.schema = Some(schema);
        self
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, _cancel: &CancellationSignal) -> Result<RecordStream> {
        debug!(source = %self.name, records = self.records.len(), "Opening memory source");
        let records = Arc::clone(&self.records);
        let len = records.len();
        Ok(stream::iter((0..len).map(move |i| Ok(records[i].clone()))).boxed())
    }

    async fn schema(&self) -> Result<DataSchema> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }
        Ok(self
            .records
            .first()
            .map(|sample| DataSchema::infer(&self.name, sample))
            .unwrap_or_else(|| DataSchema::new(&self.name, Vec::new())))
    }

    async fn estimated_record_count(&self) -> Result<Option<u64>> {
        Ok(Some(self.records.len() as u64))
    }
}

#[derive(Debug, Default)]
struct SinkState {
    records: Vec<Record>,
    schema: Option<DataSchema>,
    prepared: usize,
    finalized: usize,
}

/// Destination that keeps written records in memory. Clones share storage.
#[derive(Debug, Clone)]
pub struct MemorySink {
    name: String,
    state: Arc<Mutex<SinkState>>,
    reject_with: Option<String>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(SinkState::default())),
            reject_with: None,
        }
    }

    /// A sink whose writes always report failure with `message`.
    pub fn rejecting(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reject_with: Some(message.into()),
            ..Self::new(name)
        }
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self) -> Vec<Record> {
        self.state().records.clone()
    }

    pub fn schema(&self) -> Option<DataSchema> {
        self.state().schema.clone()
    }

    pub fn prepare_count(&self) -> usize {
        self.state().prepared
    }

    pub fn finalize_count(&self) -> usize {
        self.state().finalized
    }
}

#[async_trait]
impl DestinationConnector for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, schema: Option<&DataSchema>) -> Result<()> {
        let mut state = self.state();
        state.schema = schema.cloned();
        state.prepared += 1;
        Ok(())
    }

    async fn write_batch(&self, records: &[Record]) -> Result<WriteResult> {
        if let Some(message) = &self.reject_with {
            return Ok(WriteResult::failure(0, vec![message.clone()]));
        }
        let mut state = self.state();
        if state.prepared == 0 {
            return Err(EtlError::Connector {
                connector: self.name.clone(),
                message: "write before prepare".to_string(),
            });
        }
        state.records.extend_from_slice(records);
        debug!(sink = %self.name, written = records.len(), "Wrote batch to memory sink");
        Ok(WriteResult::success(records.len()))
    }

    async fn finalize(&self) -> Result<()> {
        self.state().finalized += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn people() -> Vec<Record> {
        (1..=5)
            .map(|i| Record::new().with_field("id", i).with_field("name", format!("p{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_read_batch_chunks_records() {
        let source = MemorySource::new("people", people());
        let cancel = CancellationSignal::new();
        let batches: Vec<Vec<Record>> = source.read_batch(2, &cancel).await.unwrap().try_collect().await.unwrap();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_read_batch_stops_when_cancelled() {
        let source = MemorySource::new("people", people());
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let batches: Vec<Vec<Record>> = source.read_batch(2, &cancel).await.unwrap().try_collect().await.unwrap();
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_schema_is_inferred() {
        let source = MemorySource::new("people", people());
        let schema = source.schema().await.unwrap();
        assert!(schema.contains("id"));
        assert!(schema.contains("name"));
        assert_eq!(source.estimated_record_count().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_sink_requires_prepare() {
        let sink = MemorySink::new("out");
        assert!(sink.write_batch(&people()).await.is_err());

        sink.prepare(None).await.unwrap();
        let result = sink.write_batch(&people()).await.unwrap();
        assert!(result.is_successful);
        assert_eq!(result.records_written, 5);
        sink.finalize().await.unwrap();

        let handle = sink.clone();
        assert_eq!(handle.records().len(), 5);
        assert_eq!(handle.finalize_count(), 1);
    }

    #[tokio::test]
    async fn test_rejecting_sink_reports_failure() {
        let sink = MemorySink::rejecting("out", "disk full");
        sink.prepare(None).await.unwrap();
        let result = sink.write_batch(&people()).await.unwrap();
        assert!(!result.is_successful);
        assert_eq!(result.errors, vec!["disk full".to_string()]);
    }
}
