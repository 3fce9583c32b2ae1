use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use flate2::write::GzEncoder;

use crate::config::Compression;
use crate::date_util::to_storage_timestamp;
use crate::error::{Error, Result};
use crate::soap::transactions::TransactionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Jsonl,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Jsonl => "jsonl",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "jsonl" | "ndjson" | "json" => Ok(ExportFormat::Jsonl),
            other => Err(format!("unknown export format {other:?} (expected csv or jsonl)")),
        }
    }
}

const CSV_HEADER: &str = "record_key,transaction_id,transaction_date,transaction_type,card_number,invoice,\
location_id,location_name,location_city,location_state,location_address,location_latitude,\
location_longitude,net_total,funded_total,settle_amount,disc_amount,carrier_id,line_items";

/// Write records as CSV. Line items are embedded as a JSON column.
pub fn write_csv<W: Write>(records: &[TransactionRecord], mut out: W) -> Result<()> {
    writeln!(out, "{CSV_HEADER}")?;
    for r in records {
        let line_items = serde_json::to_string(&r.line_items).map_err(|e| Error::Other(e.to_string()))?;
        let fields = [
            csv_escape(&r.record_key),
            opt(r.transaction_id),
            r.transaction_date.as_ref().map(to_storage_timestamp).unwrap_or_default(),
            opt(r.transaction_type),
            csv_escape(r.card_number.as_deref().unwrap_or("")),
            csv_escape(r.invoice.as_deref().unwrap_or("")),
            opt(r.location_id),
            csv_escape(r.location_name.as_deref().unwrap_or("")),
            csv_escape(r.location_city.as_deref().unwrap_or("")),
            csv_escape(r.location_state.as_deref().unwrap_or("")),
            csv_escape(r.location_address.as_deref().unwrap_or("")),
            csv_escape(r.location_latitude.as_deref().unwrap_or("")),
            csv_escape(r.location_longitude.as_deref().unwrap_or("")),
            opt(r.net_total),
            opt(r.funded_total),
            opt(r.settle_amount),
            opt(r.disc_amount),
            opt(r.carrier_id),
            csv_escape(&line_items),
        ];
        writeln!(out, "{}", fields.join(","))?;
    }
    out.flush()?;
    Ok(())
}

/// Write records as JSON Lines, one object per record.
pub fn write_jsonl<W: Write>(records: &[TransactionRecord], mut out: W) -> Result<()> {
    for r in records {
        serde_json::to_writer(&mut out, r).map_err(|e| Error::Other(e.to_string()))?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Write `records` to `path`, gzip-compressed when requested. The file is
/// written to a temporary sibling and renamed into place. Returns the final
/// path, which gains a `.gz` suffix under gzip compression.
pub fn export_to_file(
    records: &[TransactionRecord],
    format: ExportFormat,
    compression: Compression,
    path: &Path,
) -> Result<PathBuf> {
    let target = match compression {
        Compression::Gzip if path.extension().and_then(|e| e.to_str()) != Some("gz") => {
            let mut name = path.as_os_str().to_owned();
            name.push(".gz");
            PathBuf::from(name)
        }
        _ => path.to_path_buf(),
    };
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = target.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let written = write_file(records, format, compression, &tmp)
        .and_then(|()| fs::rename(&tmp, &target).map_err(Error::from));
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            log::warn!("Could not remove {}: {cleanup}", tmp.display());
        }
        return Err(e);
    }

    log::info!("Exported {} record(s) to {}", records.len(), target.display());
    Ok(target)
}

fn write_file(records: &[TransactionRecord], format: ExportFormat, compression: Compression, path: &Path) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    match compression {
        Compression::None => write_records(records, format, file),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(file, flate2::Compression::default());
            write_records(records, format, &mut encoder)?;
            encoder.finish()?.flush()?;
            Ok(())
        }
    }
}

pub fn write_records<W: Write>(records: &[TransactionRecord], format: ExportFormat, out: W) -> Result<()> {
    match format {
        ExportFormat::Csv => write_csv(records, out),
        ExportFormat::Jsonl => write_jsonl(records, out),
    }
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::soap::transactions::LineItem;

    fn record(key: &str, name: Option<&str>) -> TransactionRecord {
        TransactionRecord {
            record_key: key.to_string(),
            transaction_id: Some(1),
            transaction_date: Some("2024-01-01T10:00:00Z".parse().unwrap()),
            transaction_type: None,
            card_number: Some("7083".into()),
            invoice: None,
            location_id: Some(5),
            location_name: name.map(str::to_string),
            location_city: None,
            location_state: None,
            location_address: None,
            location_latitude: None,
            location_longitude: None,
            net_total: Some(12.5),
            funded_total: None,
            settle_amount: None,
            disc_amount: None,
            carrier_id: None,
            line_items: vec![LineItem {
                line_number: Some(1),
                category: Some("ULSD".into()),
                quantity: None,
                ppu: None,
                amount: Some(12.5),
            }],
        }
    }

    #[test]
    fn test_csv_escaping() {
        let mut out = Vec::new();
        write_csv(&[record("txn:1", Some("Love's, \"Travel\""))], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row = lines.next().unwrap();
        assert!(row.starts_with("txn:1,1,2024-01-01T10:00:00.000Z,,7083,,5,\"Love's, \"\"Travel\"\"\""));
        assert!(row.contains(",12.5,"));
        assert!(row.ends_with("\"[{\"\"line_number\"\":1,\"\"category\"\":\"\"ULSD\"\",\"\"quantity\"\":null,\"\"ppu\"\":null,\"\"amount\"\":12.5}]\""));
    }

    #[test]
    fn test_jsonl_preserves_order() {
        let mut out = Vec::new();
        write_jsonl(&[record("txn:2", None), record("txn:1", None)], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let keys: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<TransactionRecord>(l).unwrap().record_key)
            .collect();
        assert_eq!(keys, vec!["txn:2", "txn:1"]);
    }

    #[test]
    fn test_gzip_export_appends_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("transactions.csv");
        let written = export_to_file(&[record("txn:1", None)], ExportFormat::Csv, Compression::Gzip, &path).unwrap();
        assert_eq!(written, dir.path().join("out").join("transactions.csv.gz"));

        let mut decoded = String::new();
        GzDecoder::new(File::open(&written).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert!(decoded.starts_with("record_key,"));
        assert!(!dir.path().join("out").join("transactions.csv.gz.tmp").exists());
    }

    #[test]
    fn test_plain_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");
        let written = export_to_file(&[record("txn:1", None)], ExportFormat::Jsonl, Compression::None, &path).unwrap();
        assert_eq!(written, path);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_failed_export_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.csv");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "occupied").unwrap();

        let result = export_to_file(&[record("txn:1", None)], ExportFormat::Csv, Compression::None, &path);
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!dir.path().join("transactions.csv.tmp").exists());
        assert!(path.join("keep").exists());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("ndjson".parse::<ExportFormat>().unwrap(), ExportFormat::Jsonl);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
