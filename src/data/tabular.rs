//! Delimited-file reader
//!
//! Reads a header row followed by records. Each record is deserialized on
//! its own so one bad line does not abort the load.

use crate::data::RawRow;
use crate::error::AssistantError;
use crate::Result;
use csv_async::{AsyncReaderBuilder, ErrorKind, Trim};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::io::AsyncRead;
use tracing::debug;

/// Open `path` and read every row.
pub async fn read_file<R>(path: &Path, delimiter: u8) -> Result<Vec<RawRow<R>>>
where
    R: DeserializeOwned + Send + 'static,
{
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        AssistantError::SourceUnavailable(format!("cannot open {}: {}", path.display(), e))
    })?;

    read_rows(file, delimiter)
        .await
        .map_err(|e| match e {
            AssistantError::SourceUnavailable(reason) => {
                AssistantError::SourceUnavailable(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })
}

/// Read rows from any async reader.
///
/// Row numbers are the physical line a record starts on, so the first record
/// is row 2 and quoted multi-line fields do not shift later rows.
pub async fn read_rows<T, R>(reader: T, delimiter: u8) -> Result<Vec<RawRow<R>>>
where
    T: AsyncRead + Unpin + Send,
    R: DeserializeOwned + Send + 'static,
{
    let mut reader = AsyncReaderBuilder::new()
        .delimiter(delimiter)
        .trim(Trim::All)
        .flexible(true)
        .create_reader(reader);

    let headers = reader
        .headers()
        .await
        .map_err(|e| AssistantError::SourceUnavailable(format!("cannot read header row: {}", e)))?
        .clone();

    let mut records = reader.into_records();
    let mut rows = Vec::new();
    let mut index = 0usize;

    while let Some(record) = records.next().await {
        index += 1;

        match record {
            Ok(record) => {
                let row = record
                    .position()
                    .map(|pos| pos.line() as usize)
                    .unwrap_or(index + 1);

                let parsed = record.deserialize::<R>(Some(&headers)).map_err(|err| {
                    debug!(row, "Row failed to deserialize: {}", err);
                    AssistantError::MalformedRecord {
                        row,
                        reason: err.to_string(),
                    }
                });
                rows.push(RawRow { row, parsed });
            }
            Err(err) if matches!(err.kind(), ErrorKind::Io(_)) => {
                return Err(AssistantError::SourceUnavailable(format!(
                    "read failed after row {}: {}",
                    index, err
                )));
            }
            Err(err) => {
                let row = err
                    .position()
                    .map(|pos| pos.line() as usize)
                    .unwrap_or(index + 1);
                debug!(row, "Row failed to parse: {}", err);
                rows.push(RawRow {
                    row,
                    parsed: Err(AssistantError::MalformedRecord {
                        row,
                        reason: err.to_string(),
                    }),
                });
            }
        }
    }

    Ok(rows)
}
