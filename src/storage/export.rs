//! Streamed JSON export of store collections.
//!
//! Exports write a JSON array to `<path>.tmp` in batches and atomically
//! rename on success; a partial temp file is removed on error. Before
//! querying, a sample document is probed to detect whether the indexed time
//! field holds a datetime or a numeric epoch, and the range bounds are
//! converted accordingly.

use std::path::{Path, PathBuf};

use bson::{Bson, Document, doc};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc, Weekday};
use futures::stream::TryStreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::storage::datetime::{document_to_local_json, nested_value};
use crate::storage::store::DocumentStore;

const EXPORT_BATCH_SIZE: usize = 2000;

/// Period granularity for [`DocumentStore::export_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitBy {
    Year,
    Month,
    Week,
}

impl DocumentStore {
    /// Exports documents whose time field falls in `[start, end)`.
    /// Returns the written path, or `None` when the range holds no data.
    pub async fn export_by_time_range(
        &self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        directory: &Path,
        time_field: &str,
        file_prefix: &str,
        add_timestamp: bool,
        filename_override: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        let start_utc = start.with_timezone(&Utc);
        let end_utc = end.with_timezone(&Utc);

        // Peek one document to learn how the time field is stored
        let (query_start, query_end) = if self.time_field_is_numeric(time_field).await? {
            (
                Bson::Double(start_utc.timestamp() as f64),
                Bson::Double(end_utc.timestamp() as f64),
            )
        } else {
            (
                Bson::DateTime(bson::DateTime::from_chrono(start_utc)),
                Bson::DateTime(bson::DateTime::from_chrono(end_utc)),
            )
        };

        let query = doc! { time_field: { "$gte": query_start, "$lt": query_end } };

        if self.count(query.clone()).await? == 0 {
            tracing::warn!(
                collection = self.name(),
                %start,
                %end,
                "No data found in export range"
            );
            return Ok(None);
        }

        let time_str = match filename_override {
            Some(name) => name.to_string(),
            None => {
                let fmt = if start.format("%H%M").to_string() == "0000" {
                    "%Y%m%d"
                } else {
                    "%Y%m%d%H%M"
                };
                format!("{}_{}", start.format(fmt), end.format(fmt))
            }
        };
        let filepath = generate_filename(directory, file_prefix, &time_str, add_timestamp);

        let count = self.stream_to_json(query, &filepath).await?;
        tracing::info!(
            collection = self.name(),
            count,
            path = %filepath.display(),
            "Export complete"
        );
        Ok(Some(filepath))
    }

    /// Exports one calendar month.
    pub async fn export_by_month(
        &self,
        year: i32,
        month: u32,
        directory: &Path,
        time_field: &str,
        add_timestamp: bool,
    ) -> Result<Option<PathBuf>> {
        let start = local_midnight(year, month, 1)?;
        let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        let end = local_midnight(next_year, next_month, 1)?;
        let name = format!("{}_{:02}", year, month);
        self.export_by_time_range(
            start,
            end,
            directory,
            time_field,
            "monthly",
            add_timestamp,
            Some(&name),
        )
        .await
    }

    /// Exports one ISO week.
    pub async fn export_by_week(
        &self,
        year: i32,
        week: u32,
        directory: &Path,
        time_field: &str,
        add_timestamp: bool,
    ) -> Result<Option<PathBuf>> {
        let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
            .ok_or_else(|| Error::Validation(format!("Invalid ISO week {}-W{}", year, week)))?;
        let start = naive_local_midnight(monday)?;
        let end = start + ChronoDuration::weeks(1);
        let name = format!("{}_W{:02}", year, week);
        self.export_by_time_range(
            start,
            end,
            directory,
            time_field,
            "weekly",
            add_timestamp,
            Some(&name),
        )
        .await
    }

    /// Exports the whole collection, optionally split by period.
    pub async fn export_all(
        &self,
        directory: &Path,
        split_by: Option<SplitBy>,
        time_field: &str,
        add_timestamp: bool,
    ) -> Result<Vec<PathBuf>> {
        let Some(split_by) = split_by else {
            let start = local_midnight(1970, 1, 1)?;
            let end = Local::now() + ChronoDuration::days(1);
            let path = self
                .export_by_time_range(
                    start,
                    end,
                    directory,
                    time_field,
                    "all_data",
                    add_timestamp,
                    Some("full_dump"),
                )
                .await?;
            return Ok(path.into_iter().collect());
        };

        let min_doc = self
            .find_one_sorted(doc! { time_field: { "$exists": true } }, doc! { time_field: 1 })
            .await?;
        let max_doc = self
            .find_one_sorted(doc! { time_field: { "$exists": true } }, doc! { time_field: -1 })
            .await?;
        let (Some(min_doc), Some(max_doc)) = (min_doc, max_doc) else {
            tracing::warn!(collection = self.name(), "No data available to export");
            return Ok(Vec::new());
        };

        let min_date = field_as_local(&min_doc, time_field);
        let max_date = field_as_local(&max_doc, time_field);
        let (Some(min_date), Some(max_date)) = (min_date, max_date) else {
            tracing::error!(
                collection = self.name(),
                time_field,
                "Time field is neither a datetime nor an epoch value"
            );
            return Ok(Vec::new());
        };

        let mut generated = Vec::new();
        match split_by {
            SplitBy::Month => {
                let mut cursor = (min_date.year(), min_date.month());
                let last = (max_date.year(), max_date.month());
                while cursor <= last {
                    if let Some(path) = self
                        .export_by_month(cursor.0, cursor.1, directory, time_field, add_timestamp)
                        .await?
                    {
                        generated.push(path);
                    }
                    cursor = if cursor.1 == 12 { (cursor.0 + 1, 1) } else { (cursor.0, cursor.1 + 1) };
                }
            }
            SplitBy::Week => {
                let iso = min_date.date_naive().iso_week();
                let mut monday = NaiveDate::from_isoywd_opt(iso.year(), iso.week(), Weekday::Mon)
                    .ok_or_else(|| Error::Internal("ISO week computation failed".to_string()))?;
                while monday <= max_date.date_naive() {
                    let iso = monday.iso_week();
                    if let Some(path) = self
                        .export_by_week(iso.year(), iso.week(), directory, time_field, add_timestamp)
                        .await?
                    {
                        generated.push(path);
                    }
                    monday += ChronoDuration::weeks(1);
                }
            }
            SplitBy::Year => {
                for year in min_date.year()..=max_date.year() {
                    let start = local_midnight(year, 1, 1)?;
                    let end = local_midnight(year + 1, 1, 1)?;
                    let name = year.to_string();
                    if let Some(path) = self
                        .export_by_time_range(
                            start,
                            end,
                            directory,
                            time_field,
                            "yearly",
                            add_timestamp,
                            Some(&name),
                        )
                        .await?
                    {
                        generated.push(path);
                    }
                }
            }
        }

        Ok(generated)
    }

    async fn time_field_is_numeric(&self, time_field: &str) -> Result<bool> {
        let sample = self
            .collection
            .find_one(doc! { time_field: { "$exists": true } })
            .projection(doc! { time_field: 1 })
            .await?;
        Ok(sample
            .as_ref()
            .and_then(|doc| nested_value(doc, time_field))
            .map(|value| matches!(value, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_)))
            .unwrap_or(false))
    }

    /// Streams a query result into a JSON array file via `.tmp` + rename.
    async fn stream_to_json(&self, query: Document, filepath: &Path) -> Result<u64> {
        if let Some(parent) = filepath.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = filepath.with_extension("json.tmp");

        let result = self.write_batches(query, &temp_path).await;
        match result {
            Ok(count) => {
                tokio::fs::rename(&temp_path, filepath).await?;
                Ok(count)
            }
            Err(e) => {
                if tokio::fs::remove_file(&temp_path).await.is_ok() {
                    tracing::info!(path = %temp_path.display(), "Cleaned up partial export file");
                }
                Err(e)
            }
        }
    }

    async fn write_batches(&self, query: Document, temp_path: &Path) -> Result<u64> {
        let mut cursor = self.collection.find(query).batch_size(EXPORT_BATCH_SIZE as u32).await?;
        let mut file = tokio::fs::File::create(temp_path).await?;
        file.write_all(b"[").await?;

        let mut count: u64 = 0;
        let mut batch: Vec<String> = Vec::with_capacity(EXPORT_BATCH_SIZE);
        let mut first_batch = true;

        while let Some(document) = cursor.try_next().await? {
            let json = document_to_local_json(&document);
            batch.push(serde_json::to_string(&json)?);

            if batch.len() >= EXPORT_BATCH_SIZE {
                write_chunk(&mut file, &mut batch, &mut first_batch, &mut count).await?;
            }
        }
        if !batch.is_empty() {
            write_chunk(&mut file, &mut batch, &mut first_batch, &mut count).await?;
        }

        file.write_all(b"]").await?;
        file.flush().await?;
        Ok(count)
    }
}

async fn write_chunk(
    file: &mut tokio::fs::File,
    batch: &mut Vec<String>,
    first_batch: &mut bool,
    count: &mut u64,
) -> Result<()> {
    if !*first_batch {
        file.write_all(b",\n").await?;
    }
    file.write_all(batch.join(",\n").as_bytes()).await?;
    *count += batch.len() as u64;
    batch.clear();
    *first_batch = false;
    Ok(())
}

/// Format: `{directory}/{prefix}_{time_str}[_timestamp].json`
fn generate_filename(
    directory: &Path,
    prefix: &str,
    time_str: &str,
    add_timestamp: bool,
) -> PathBuf {
    let mut filename = format!("{}_{}", prefix, time_str);
    if add_timestamp {
        filename.push_str(&format!("_{}", Local::now().format("%Y%m%d%H%M%S")));
    }
    directory.join(format!("{}.json", filename))
}

fn local_midnight(year: i32, month: u32, day: u32) -> Result<DateTime<Local>> {
    Local
        .with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .ok_or_else(|| Error::Validation(format!("Invalid date {}-{}-{}", year, month, day)))
}

fn naive_local_midnight(date: NaiveDate) -> Result<DateTime<Local>> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| Error::Internal("midnight construction failed".to_string()))?;
    Local
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| Error::Internal("ambiguous local midnight".to_string()))
}

fn field_as_local(doc: &Document, time_field: &str) -> Option<DateTime<Local>> {
    match nested_value(doc, time_field)? {
        Bson::DateTime(dt) => Some(dt.to_chrono().with_timezone(&Local)),
        Bson::Double(ts) => Local.timestamp_opt(*ts as i64, 0).single(),
        Bson::Int64(ts) => Local.timestamp_opt(*ts, 0).single(),
        Bson::Int32(ts) => Local.timestamp_opt(i64::from(*ts), 0).single(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_filename_plain() {
        let path = generate_filename(Path::new("/tmp/exports"), "weekly", "2025_W07", false);
        assert_eq!(path, PathBuf::from("/tmp/exports/weekly_2025_W07.json"));
    }

    #[test]
    fn test_generate_filename_with_timestamp() {
        let path = generate_filename(Path::new("/tmp"), "monthly", "2025_02", true);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("monthly_2025_02_"));
        assert!(name.ends_with(".json"));
        // prefix + period + 14-digit timestamp + extension
        assert_eq!(name.len(), "monthly_2025_02_".len() + 14 + ".json".len());
    }

    #[test]
    fn test_field_as_local_accepts_epoch_and_datetime() {
        let instant = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let doc = doc! {
            "a": bson::DateTime::from_chrono(instant),
            "b": instant.timestamp() as f64,
            "c": "prose",
        };
        assert_eq!(
            field_as_local(&doc, "a").map(|dt| dt.with_timezone(&Utc)),
            Some(instant)
        );
        assert_eq!(
            field_as_local(&doc, "b").map(|dt| dt.with_timezone(&Utc)),
            Some(instant)
        );
        assert_eq!(field_as_local(&doc, "c"), None);
    }
}
