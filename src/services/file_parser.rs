use bytes::{Bytes, BytesMut};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::io::Cursor;

use crate::error::AppError;
use crate::models::{FileData, NamedDataset, Row, SheetData};

const SAMPLE_ROWS: usize = 10;
const TEXT_PREVIEW_LINES: usize = 50;
const JSON_COLUMN: &str = "JSON Object";
const TEXT_COLUMN: &str = "Content";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Csv,
    Xlsx,
    Json,
    Text,
}

impl FileKind {
    pub fn from_name(name: &str) -> Result<Self, AppError> {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(FileKind::Csv),
            "xlsx" => Ok(FileKind::Xlsx),
            "json" => Ok(FileKind::Json),
            "txt" | "log" => Ok(FileKind::Text),
            _ => Err(AppError::InvalidInput(format!(
                "Unsupported file type: '{}'. Use csv, xlsx, json, txt or log",
                name
            ))),
        }
    }

    fn label(self, name: &str) -> String {
        match self {
            FileKind::Text => name
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_else(|| "txt".to_string()),
            FileKind::Csv => "csv".to_string(),
            FileKind::Xlsx => "xlsx".to_string(),
            FileKind::Json => "json".to_string(),
        }
    }
}

/// Parses an uploaded file into prompt-sized sheet summaries plus the full
/// rows of every sheet.
pub fn parse_file(name: &str, data: &[u8], max_size: usize) -> Result<FileData, AppError> {
    if data.len() > max_size {
        return Err(too_large(name, data.len() as u64, max_size));
    }
    let kind = FileKind::from_name(name)?;
    tracing::info!("Parsing {} ({} bytes) as {:?}", name, data.len(), kind);

    let tables = match kind {
        FileKind::Xlsx => read_workbook(data)?,
        FileKind::Csv => vec![read_csv(name, &decode(data))],
        FileKind::Json => vec![read_json(name, &decode(data))],
        FileKind::Text => vec![read_text(name, &decode(data))],
    };
    if tables.is_empty() {
        return Err(AppError::FileProcessingError(format!("No data found in '{}'", name)));
    }

    let sheets = tables.iter().map(|(sheet, _)| sheet.clone()).collect();
    Ok(FileData {
        name: name.to_string(),
        file_type: kind.label(name),
        sheets,
        tables: tables.into_iter().map(|(_, dataset)| dataset).collect(),
    })
}

/// Fetches a csv or xlsx dataset over HTTP.
pub async fn fetch_file(url: &str, name: &str, max_size: usize) -> Result<FileData, AppError> {
    match FileKind::from_name(name)? {
        FileKind::Csv | FileKind::Xlsx => {}
        _ => {
            return Err(AppError::InvalidInput(
                "Only csv and xlsx files can be loaded by URL".to_string(),
            ))
        }
    }
    let data = load_file_from_url(url, max_size).await?;
    parse_file(name, &data, max_size)
}

async fn load_file_from_url(url: &str, max_size: usize) -> Result<Bytes, AppError> {
    let client = Client::new();
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AppError::FileProcessingError(format!("Failed to fetch file: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::FileProcessingError(format!(
            "Failed to fetch file. Status: {}",
            response.status()
        )));
    }
    if let Some(length) = response.content_length() {
        if length > max_size as u64 {
            return Err(too_large(url, length, max_size));
        }
    }

    read_limited(url, response.bytes_stream(), max_size).await
}

/// Collects a body stream, giving up as soon as it grows past `max_size`.
async fn read_limited<S, E>(source: &str, mut stream: S, max_size: usize) -> Result<Bytes, AppError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| AppError::FileProcessingError(format!("Failed to read response bytes: {}", e)))?;
        if body.len() + chunk.len() > max_size {
            return Err(too_large(source, (body.len() + chunk.len()) as u64, max_size));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn too_large(source: &str, size: u64, max_size: usize) -> AppError {
    AppError::FileProcessingError(format!(
        "File '{}' is {} bytes, above the {} byte limit",
        source, size, max_size
    ))
}

fn decode(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    text.strip_prefix('\u{feff}').unwrap_or(&text).to_string()
}

/// Header names made unique with `_1`, `_2` suffixes. Blank headers get a
/// positional name.
fn unique_header(raw: &str, position: usize, seen: &mut HashSet<String>) -> String {
    let trimmed = raw.trim();
    let base = if trimmed.is_empty() {
        format!("col_{}", position + 1)
    } else {
        trimmed.to_string()
    };

    let mut name = base.clone();
    let mut counter = 1;
    while !seen.insert(name.clone()) {
        name = format!("{}_{}", base, counter);
        counter += 1;
    }
    name
}

fn dedupe_headers<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .enumerate()
        .map(|(i, header)| unique_header(header, i, &mut seen))
        .collect()
}

/// Builds the sheet summary and the header-keyed rows from a grid whose
/// first row holds the headers. `None` cells are left out of the rows.
fn grid_to_table(name: &str, headers: Vec<String>, body: Vec<Vec<Option<Value>>>) -> (SheetData, NamedDataset) {
    let sample_rows = body
        .iter()
        .take(SAMPLE_ROWS)
        .map(|cells| {
            (0..headers.len())
                .map(|i| cells.get(i).cloned().flatten().unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    let rows = body
        .into_iter()
        .map(|cells| {
            headers
                .iter()
                .zip(cells)
                .filter_map(|(header, cell)| cell.map(|value| (header.clone(), value)))
                .collect::<Row>()
        })
        .filter(|row| !row.is_empty())
        .collect();

    (
        SheetData {
            name: name.to_string(),
            headers,
            sample_rows,
        },
        NamedDataset {
            name: name.to_string(),
            rows,
        },
    )
}

fn read_workbook(data: &[u8]) -> Result<Vec<(SheetData, NamedDataset)>, AppError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(data))
        .map_err(|e| AppError::FileProcessingError(format!("Failed to open Excel file: {}", e)))?;

    let sheet_names = workbook.sheet_names().to_vec();
    tracing::info!("Found {} sheets: {:?}", sheet_names.len(), sheet_names);

    let mut tables = Vec::with_capacity(sheet_names.len());
    for sheet_name in &sheet_names {
        let range = match workbook.worksheet_range(sheet_name) {
            Ok(range) => range,
            Err(e) => {
                tracing::warn!("Failed to read worksheet {}: {}", sheet_name, e);
                continue;
            }
        };
        let mut rows = range.rows();
        let Some(header_row) = rows.next() else {
            tracing::warn!("Sheet {} is empty, skipping", sheet_name);
            continue;
        };

        let header_text: Vec<String> = header_row.iter().map(|cell| cell.to_string()).collect();
        let headers = dedupe_headers(header_text.iter().map(String::as_str));
        let body = rows
            .map(|row| row.iter().map(cell_value).collect())
            .collect();
        tables.push(grid_to_table(sheet_name, headers, body));
    }
    Ok(tables)
}

/// Cell as a JSON scalar. Dates stay Excel serial numbers; the comparator
/// converts them for mapped date columns.
fn cell_value(cell: &Data) -> Option<Value> {
    match cell {
        Data::Empty => None,
        Data::Int(i) => Some(Value::from(*i)),
        Data::Float(f) => Number::from_f64(*f).map(Value::Number),
        Data::Bool(b) => Some(Value::Bool(*b)),
        Data::DateTime(dt) => Number::from_f64(dt.as_f64()).map(Value::Number),
        Data::String(s) if s.is_empty() => None,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => Some(Value::String(s.clone())),
        Data::Error(e) => Some(Value::String(e.to_string())),
    }
}

/// Reads CSV text as raw records; the first record becomes the header row.
/// Rows may have fewer or more fields than the header. Blank lines are skipped.
fn read_csv(name: &str, text: &str) -> (SheetData, NamedDataset) {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for (line, result) in reader.records().enumerate() {
        match result {
            Ok(record) => {
                if record.len() == 1 && record[0].trim().is_empty() {
                    continue;
                }
                records.push(record.iter().map(str::to_string).collect());
            }
            Err(e) => tracing::warn!("Skipping malformed record {} in {}: {}", line + 1, name, e),
        }
    }
    records_to_table(name, records)
}

fn records_to_table(name: &str, records: Vec<Vec<String>>) -> (SheetData, NamedDataset) {
    let mut records = records.into_iter();
    let headers = records
        .next()
        .map(|header| dedupe_headers(header.iter().map(String::as_str)))
        .unwrap_or_default();
    let body = records
        .map(|record| {
            record
                .into_iter()
                .map(|field| (!field.is_empty()).then(|| Value::String(field)))
                .collect()
        })
        .collect();
    grid_to_table(name, headers, body)
}

fn read_json(name: &str, text: &str) -> (SheetData, NamedDataset) {
    let parsed: Option<Vec<Map<String, Value>>> = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| match value {
            Value::Array(items) if !items.is_empty() => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            _ => None,
        });

    match parsed {
        Some(objects) => {
            let headers: Vec<String> = objects[0].keys().cloned().collect();
            let body = objects
                .into_iter()
                .map(|mut object| headers.iter().map(|h| object.remove(h)).collect())
                .collect();
            grid_to_table(name, headers, body)
        }
        None => {
            tracing::debug!("{} is not an array of objects, keeping it as one value", name);
            let body = vec![vec![Some(Value::String(text.trim().to_string()))]];
            grid_to_table(name, vec![JSON_COLUMN.to_string()], body)
        }
    }
}

fn read_text(name: &str, text: &str) -> (SheetData, NamedDataset) {
    let body = text
        .lines()
        .take(TEXT_PREVIEW_LINES)
        .map(|line| vec![Some(Value::String(line.to_string()))])
        .collect();
    let (mut sheet, dataset) = grid_to_table(name, vec![TEXT_COLUMN.to_string()], body);
    sheet.sample_rows = dataset
        .rows
        .iter()
        .filter_map(|row| row.get(TEXT_COLUMN).cloned())
        .map(|line| vec![line])
        .collect();
    (sheet, dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LIMIT: usize = 1024 * 1024;

    #[test]
    fn csv_keeps_quoted_commas_and_dedupes_headers() {
        let text = "id,amount,amount,\n1,\"1,200\",5,x\n\n2,\"say \"\"hi\"\"\",,y\n";
        let file = parse_file("orders.csv", text.as_bytes(), LIMIT).unwrap();

        let sheet = &file.sheets[0];
        assert_eq!(sheet.headers, vec!["id", "amount", "amount_1", "col_4"]);
        assert_eq!(sheet.sample_rows[0], vec![json!("1"), json!("1,200"), json!("5"), json!("x")]);

        let rows = &file.tables[0].rows;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("amount"), Some(&json!("say \"hi\"")));
        assert!(rows[1].get("amount_1").is_none());
        assert_eq!(file.file_type, "csv");
    }

    #[test]
    fn csv_keeps_quotes_inside_unquoted_fields() {
        let text = "id,size,qty\n1,5\" screen,3\n2,7\" screen,4\n";
        let file = parse_file("p.csv", text.as_bytes(), LIMIT).unwrap();
        let rows = &file.tables[0].rows;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("size"), Some(&json!("5\" screen")));
        assert_eq!(rows[1].get("qty"), Some(&json!("4")));
    }

    #[test]
    fn csv_rows_may_be_short_or_long() {
        let text = "a,b\n1\n2,3,4\n";
        let file = parse_file("ragged.csv", text.as_bytes(), LIMIT).unwrap();
        let rows = &file.tables[0].rows;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("a"), Some(&json!("1")));
        assert!(rows[0].get("b").is_none());
        assert_eq!(rows[1].get("b"), Some(&json!("3")));
    }

    #[test]
    fn csv_samples_are_capped() {
        let mut text = String::from("n\n");
        for i in 0..25 {
            text.push_str(&format!("{}\r\n", i));
        }
        let file = parse_file("numbers.csv", text.as_bytes(), LIMIT).unwrap();
        assert_eq!(file.sheets[0].sample_rows.len(), SAMPLE_ROWS);
        assert_eq!(file.tables[0].rows.len(), 25);
    }

    #[test]
    fn json_array_uses_first_object_headers() {
        let text = r#"[{"id": 1, "name": "a"}, {"id": 2, "extra": true}]"#;
        let file = parse_file("people.json", text.as_bytes(), LIMIT).unwrap();
        assert_eq!(file.sheets[0].headers, vec!["id", "name"]);
        assert_eq!(file.sheets[0].sample_rows[1], vec![json!(2), Value::Null]);
    }

    #[test]
    fn other_json_becomes_a_single_column() {
        let file = parse_file("config.json", br#"{"a": 1}"#, LIMIT).unwrap();
        assert_eq!(file.sheets[0].headers, vec![JSON_COLUMN]);
        assert_eq!(file.sheets[0].sample_rows[0], vec![json!("{\"a\": 1}")]);
    }

    #[test]
    fn text_files_keep_first_lines() {
        let text = (0..60).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let file = parse_file("app.log", text.as_bytes(), LIMIT).unwrap();
        assert_eq!(file.file_type, "log");
        assert_eq!(file.sheets[0].headers, vec![TEXT_COLUMN]);
        assert_eq!(file.sheets[0].sample_rows.len(), TEXT_PREVIEW_LINES);
        assert_eq!(file.sheets[0].sample_rows[49], vec![json!("line 49")]);
    }

    #[test]
    fn oversized_and_unknown_files_are_rejected() {
        assert!(matches!(
            parse_file("big.csv", &[b'a'; 11], 10),
            Err(AppError::FileProcessingError(_))
        ));
        assert!(matches!(
            parse_file("deck.pptx", b"x", LIMIT),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn empty_excel_cells_are_omitted() {
        assert_eq!(cell_value(&Data::Empty), None);
        assert_eq!(cell_value(&Data::Float(45932.0)), Some(json!(45932.0)));
        assert_eq!(cell_value(&Data::Int(3)), Some(json!(3)));
        assert_eq!(cell_value(&Data::String(String::new())), None);
    }

    #[test]
    fn invalid_workbook_is_a_processing_error() {
        assert!(matches!(
            parse_file("book.xlsx", b"not a zip", LIMIT),
            Err(AppError::FileProcessingError(_))
        ));
    }

    #[tokio::test]
    async fn body_reading_stops_past_the_limit() {
        let chunks = || {
            futures::stream::iter(vec![
                Ok::<_, std::io::Error>(Bytes::from_static(b"id,qty\n")),
                Ok(Bytes::from_static(b"1,2\n")),
            ])
        };
        let body = read_limited("u", chunks(), 64).await.unwrap();
        assert_eq!(&body[..], b"id,qty\n1,2\n");

        let err = read_limited("u", chunks(), 8).await.unwrap_err();
        assert!(err.to_string().contains("above the 8 byte limit"));
    }

    #[tokio::test]
    async fn body_read_errors_are_reported() {
        let chunks = vec![
            Ok(Bytes::from_static(b"id\n")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "reset")),
        ];
        let err = read_limited("u", futures::stream::iter(chunks), 64).await.unwrap_err();
        assert!(err.to_string().contains("Failed to read response bytes: reset"));
    }

    #[tokio::test]
    async fn url_loading_is_limited_to_tabular_files() {
        let result = fetch_file("http://localhost/x.json", "x.json", LIMIT).await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }
}
