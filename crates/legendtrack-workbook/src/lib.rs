//! Tracker workbook access: an in-memory cell model loaded with calamine and written back
//! with rust_xlsxwriter, row normalization into canonical records, snapshot building and
//! single-topic updates.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use calamine::{Data, Reader, Xlsx};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use legendtrack_core::{
    project_columns, topic_columns, Project, Snapshot, Topic, TopicUpdate, PROJECTS_SHEET,
    TOPICS_SHEET,
};
use rust_xlsxwriter::{Format, Formula};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "legendtrack-workbook";

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("tracker workbook not found at {}; set TRACKER_PATH to point to your workbook", .0.display())]
    WorkbookNotFound(PathBuf),
    #[error("sheet \"{0}\" not found in workbook")]
    SheetMissing(String),
    #[error("{column} column not found in {sheet} sheet")]
    ColumnMissing { sheet: String, column: String },
    #[error("topic {0} not found or no valid fields provided")]
    TopicNotFound(String),
    #[error("reading workbook: {0}")]
    Read(#[from] calamine::XlsxError),
    #[error("writing workbook: {0}")]
    Write(#[from] rust_xlsxwriter::XlsxError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkbookError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = WorkbookError> = std::result::Result<T, E>;

/// A single cell value, reduced to what the tracker cares about.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDateTime),
    Error(String),
}

static EMPTY_CELL: CellValue = CellValue::Empty;

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }

    pub fn date(year: i32, month: u32, day: u32) -> Self {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(|d| CellValue::Date(d.and_time(NaiveTime::MIN)))
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    fn from_calamine(data: &Data) -> Self {
        match data {
            Data::Empty => CellValue::Empty,
            Data::String(s) => CellValue::Text(s.clone()),
            Data::Int(i) => CellValue::Number(*i as f64),
            Data::Float(f) => CellValue::Number(*f),
            Data::Bool(b) => CellValue::Bool(*b),
            Data::DateTime(dt) => dt
                .as_datetime()
                .map(CellValue::Date)
                .unwrap_or_else(|| CellValue::Number(dt.as_f64())),
            Data::DateTimeIso(s) => parse_iso_datetime(s)
                .map(CellValue::Date)
                .unwrap_or_else(|| CellValue::Text(s.clone())),
            Data::DurationIso(s) => CellValue::Text(s.clone()),
            Data::Error(e) => CellValue::Error(e.to_string()),
        }
    }
}

fn parse_iso_datetime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Days since the 1899-12-30 epoch, the serial form Excel stores dates in.
fn excel_serial(dt: &NaiveDateTime) -> f64 {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)
        .expect("excel epoch is a valid date")
        .and_time(NaiveTime::MIN);
    (*dt - epoch).num_milliseconds() as f64 / 86_400_000.0
}

/// Header name to zero-based column index, built from a sheet's first row.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    columns: HashMap<String, usize>,
}

impl HeaderMap {
    pub fn from_row(row: &[CellValue]) -> Self {
        let mut columns = HashMap::new();
        for (idx, cell) in row.iter().enumerate() {
            let header = clean(cell);
            if header.is_empty() {
                continue;
            }
            columns.entry(header).or_insert(idx);
        }
        Self { columns }
    }

    pub fn get(&self, header: &str) -> Option<usize> {
        self.columns.get(header).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Header-keyed view over one data row.
#[derive(Debug, Clone, Copy)]
pub struct RawRow<'a> {
    headers: &'a HeaderMap,
    cells: &'a [CellValue],
}

impl<'a> RawRow<'a> {
    pub fn new(headers: &'a HeaderMap, cells: &'a [CellValue]) -> Self {
        Self { headers, cells }
    }

    pub fn cell(&self, header: &str) -> &'a CellValue {
        self.headers
            .get(header)
            .and_then(|idx| self.cells.get(idx))
            .unwrap_or(&EMPTY_CELL)
    }

    pub fn text(&self, header: &str) -> String {
        clean(self.cell(header))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    /// Zero-based (row, column) of the top-left cell of `rows`.
    pub origin: (u32, u32),
    pub rows: Vec<Vec<CellValue>>,
    /// Formula text (no leading `=`) keyed by absolute (row, column); the cell in `rows`
    /// holds its last calculated value.
    pub formulas: BTreeMap<(u32, u32), String>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            name: name.into(),
            origin: (0, 0),
            rows,
            formulas: BTreeMap::new(),
        }
    }

    fn absolute(&self, row: usize, col: usize) -> (u32, u32) {
        (self.origin.0 + row as u32, self.origin.1 + col as u32)
    }

    fn cell_at(&self, (row, col): (u32, u32)) -> &CellValue {
        match (row.checked_sub(self.origin.0), col.checked_sub(self.origin.1)) {
            (Some(r), Some(c)) => self.cell(r as usize, c as usize),
            _ => &EMPTY_CELL,
        }
    }

    /// Build a sheet from a header row and text records; `""` becomes an empty cell.
    pub fn from_records(name: impl Into<String>, headers: &[&str], records: &[Vec<&str>]) -> Self {
        let to_cell = |s: &&str| {
            if s.is_empty() {
                CellValue::Empty
            } else {
                CellValue::text(*s)
            }
        };
        let mut rows = vec![headers.iter().map(to_cell).collect::<Vec<_>>()];
        rows.extend(records.iter().map(|r| r.iter().map(to_cell).collect()));
        Self::new(name, rows)
    }

    pub fn header_map(&self) -> HeaderMap {
        self.rows
            .first()
            .map(|row| HeaderMap::from_row(row))
            .unwrap_or_default()
    }

    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY_CELL)
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: CellValue) {
        if self.rows.len() <= row {
            self.rows.resize_with(row + 1, Vec::new);
        }
        let cells = &mut self.rows[row];
        if cells.len() <= col {
            cells.resize(col + 1, CellValue::Empty);
        }
        cells[col] = value;
        let key = self.absolute(row, col);
        self.formulas.remove(&key);
    }

    pub fn formula(&self, row: usize, col: usize) -> Option<&str> {
        self.formulas.get(&self.absolute(row, col)).map(String::as_str)
    }

    /// Attach a formula to the cell at `row`/`col`, keeping its current value as the cached result.
    pub fn set_formula(&mut self, row: usize, col: usize, formula: &str) {
        let key = self.absolute(row, col);
        self.formulas
            .insert(key, formula.trim_start_matches('=').to_string());
    }

    /// Data rows (everything below the header row) paired with the header map.
    pub fn records(&self) -> (HeaderMap, &[Vec<CellValue>]) {
        let headers = self.header_map();
        let data = self.rows.get(1..).unwrap_or(&[]);
        (headers, data)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new(sheets: Vec<Sheet>) -> Self {
        Self { sheets }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let bytes = read_workbook_bytes(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut xlsx: Xlsx<_> = calamine::open_workbook_from_rs(Cursor::new(bytes))?;
        let mut sheets = Vec::new();
        for name in xlsx.sheet_names() {
            let range = xlsx.worksheet_range(&name)?;
            let origin = range.start().unwrap_or((0, 0));
            let rows = range
                .rows()
                .map(|row| row.iter().map(CellValue::from_calamine).collect())
                .collect();

            let formula_range = xlsx.worksheet_formula(&name)?;
            let (f_row0, f_col0) = formula_range.start().unwrap_or((0, 0));
            let formulas = formula_range
                .used_cells()
                .map(|(r, c, f)| ((f_row0 + r as u32, f_col0 + c as u32), f.clone()))
                .collect();
            sheets.push(Sheet {
                name,
                origin,
                rows,
                formulas,
            });
        }
        Ok(Self { sheets })
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut Sheet> {
        self.sheets.iter_mut().find(|s| s.name == name)
    }

    /// Serialize every sheet back to xlsx bytes, keeping cell positions and formulas.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut book = rust_xlsxwriter::Workbook::new();
        let date_format = Format::new().set_num_format("yyyy-mm-dd");
        let datetime_format = Format::new().set_num_format("yyyy-mm-dd hh:mm:ss");

        for sheet in &self.sheets {
            let worksheet = book.add_worksheet();
            worksheet.set_name(sheet.name.as_str())?;
            let (row0, col0) = sheet.origin;
            for (r, cells) in sheet.rows.iter().enumerate() {
                let row = row0 + r as u32;
                for (c, cell) in cells.iter().enumerate() {
                    let col = (col0 as usize + c) as u16;
                    if sheet.formulas.contains_key(&(row, u32::from(col))) {
                        continue;
                    }
                    match cell {
                        CellValue::Empty => {}
                        CellValue::Text(s) | CellValue::Error(s) => {
                            worksheet.write_string(row, col, s.as_str())?;
                        }
                        CellValue::Number(n) => {
                            worksheet.write_number(row, col, *n)?;
                        }
                        CellValue::Bool(b) => {
                            worksheet.write_boolean(row, col, *b)?;
                        }
                        CellValue::Date(dt) => {
                            let format = if dt.time() == NaiveTime::MIN {
                                &date_format
                            } else {
                                &datetime_format
                            };
                            worksheet.write_number_with_format(row, col, excel_serial(dt), format)?;
                        }
                    }
                }
            }
            for (&(row, col), formula) in &sheet.formulas {
                let cached = clean(sheet.cell_at((row, col)));
                worksheet.write_formula(row, col as u16, Formula::new(formula).set_result(cached))?;
            }
        }
        Ok(book.save_to_buffer()?)
    }

    /// Replace the file at `path` with this workbook (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        legendtrack_storage::write_atomic_blocking(path, &bytes)
            .map_err(|err| WorkbookError::io(format!("writing {}", path.display()), err))
    }
}

fn read_workbook_bytes(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(WorkbookError::WorkbookNotFound(path.to_path_buf()))
        }
        Err(err) => Err(WorkbookError::io(format!("reading {}", path.display()), err)),
    }
}

// Row normalization

/// Canonical string form of a cell: dates as `YYYY-MM-DD`, everything else trimmed.
pub fn clean(cell: &CellValue) -> String {
    match cell {
        CellValue::Empty => String::new(),
        CellValue::Text(s) | CellValue::Error(s) => s.trim().to_string(),
        CellValue::Number(n) => n.to_string(),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Date(dt) => dt.date().format("%Y-%m-%d").to_string(),
    }
}

/// Epoch number, or `None` for blanks, zero, non-numeric text and fractional values.
pub fn parse_epoch(cell: &CellValue) -> Option<i64> {
    let value = match cell {
        CellValue::Number(n) => *n,
        CellValue::Text(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !value.is_finite() || value == 0.0 || value.fract() != 0.0 {
        return None;
    }
    Some(value as i64)
}

pub fn topic_from_row(row: &RawRow<'_>) -> Option<Topic> {
    use topic_columns::*;

    let id = row.text(ID);
    if id.is_empty() {
        return None;
    }
    Some(Topic {
        id,
        epoch: parse_epoch(row.cell(EPOCH)),
        epoch_theme: row.text(EPOCH_THEME),
        track: row.text(TRACK),
        track_title: row.text(TRACK_TITLE),
        topic_name: row.text(TOPIC_NAME),
        description: row.text(DESCRIPTION),
        depth_target: row.text(DEPTH_TARGET),
        current_depth: row.text(CURRENT_DEPTH),
        status: row.text(STATUS),
        last_worked_on: row.text(LAST_WORKED_ON),
        example_project: row.text(EXAMPLE_PROJECT),
        concept_evidence: row.text(CONCEPT_EVIDENCE),
        implementation_evidence: row.text(IMPLEMENTATION_EVIDENCE),
        application_evidence: row.text(APPLICATION_EVIDENCE),
        related_topic_ids: row.text(RELATED_TOPIC_IDS),
        notes: row.text(NOTES),
        resources: row.text(RESOURCES),
    })
}

pub fn project_from_row(row: &RawRow<'_>) -> Option<Project> {
    use project_columns::*;

    let title = row.text(TITLE);
    if title.is_empty() {
        return None;
    }
    let explicit_id = row.text(ID);
    Some(Project {
        id: if explicit_id.is_empty() {
            title.clone()
        } else {
            explicit_id
        },
        title,
        summary: row.text(SUMMARY),
        topic_ids: row.text(TOPIC_IDS),
        status: row.text(STATUS),
        start_date: row.text(START_DATE),
        end_date: row.text(END_DATE),
        outcomes: row.text(OUTCOMES),
        resources: row.text(RESOURCES),
    })
}

/// Topics in sheet order; sorting happens in [`Snapshot::new`].
pub fn extract_topics(sheet: &Sheet) -> Vec<Topic> {
    let (headers, data) = sheet.records();
    data.iter()
        .filter_map(|cells| topic_from_row(&RawRow::new(&headers, cells)))
        .collect()
}

pub fn extract_projects(sheet: &Sheet) -> Vec<Project> {
    let (headers, data) = sheet.records();
    data.iter()
        .filter_map(|cells| project_from_row(&RawRow::new(&headers, cells)))
        .collect()
}

// Snapshot building

pub fn snapshot_from_workbook(workbook: &Workbook) -> Result<Snapshot> {
    let topics_sheet = workbook
        .sheet(TOPICS_SHEET)
        .ok_or_else(|| WorkbookError::SheetMissing(TOPICS_SHEET.to_string()))?;
    let topics = extract_topics(topics_sheet);
    let projects = workbook
        .sheet(PROJECTS_SHEET)
        .map(extract_projects)
        .unwrap_or_default();
    Ok(Snapshot::new(topics, projects))
}

pub fn build_snapshot(workbook_bytes: &[u8]) -> Result<Snapshot> {
    snapshot_from_workbook(&Workbook::from_bytes(workbook_bytes)?)
}

/// Read the workbook fresh from disk and build a snapshot from it.
pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let bytes = read_workbook_bytes(path)?;
    let snapshot = build_snapshot(&bytes)?;
    debug!(
        path = %path.display(),
        topics = snapshot.topics.len(),
        projects = snapshot.projects.len(),
        "snapshot built"
    );
    Ok(snapshot)
}

// Topic updates

/// Where an update landed: zero-based sheet row and the headers written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    pub row: usize,
    pub columns: Vec<&'static str>,
}

/// Write the allow-listed fields of `update` into the first `Topics` row whose `ID` matches.
pub fn apply_update_to_workbook(
    workbook: &mut Workbook,
    topic_id: &str,
    update: &TopicUpdate,
) -> Result<AppliedUpdate> {
    let sheet = workbook
        .sheet_mut(TOPICS_SHEET)
        .ok_or_else(|| WorkbookError::SheetMissing(TOPICS_SHEET.to_string()))?;
    let headers = sheet.header_map();
    let id_col = headers
        .get(topic_columns::ID)
        .ok_or_else(|| WorkbookError::ColumnMissing {
            sheet: TOPICS_SHEET.to_string(),
            column: topic_columns::ID.to_string(),
        })?;

    let Some(row) = (1..sheet.rows.len()).find(|&row| {
        let cell = sheet.cell(row, id_col);
        !cell.is_empty() && clean(cell) == topic_id
    }) else {
        return Err(WorkbookError::TopicNotFound(topic_id.to_string()));
    };

    let mut columns = Vec::new();
    for (header, value) in update.columns() {
        let (Some(col), Some(value)) = (headers.get(header), value) else {
            continue;
        };
        sheet.set_cell(row, col, CellValue::text(value));
        columns.push(header);
    }
    if columns.is_empty() {
        return Err(WorkbookError::TopicNotFound(topic_id.to_string()));
    }
    Ok(AppliedUpdate { row, columns })
}

/// Read-modify-write of one topic row in the workbook at `path`.
///
/// There is no locking: an edit made by another program between the read and the write
/// is overwritten.
pub fn apply_update(path: &Path, topic_id: &str, update: &TopicUpdate) -> Result<AppliedUpdate> {
    let mut workbook = Workbook::open(path)?;
    let applied = apply_update_to_workbook(&mut workbook, topic_id, update)?;
    workbook.save(path)?;
    info!(
        topic_id,
        row = applied.row,
        columns = ?applied.columns,
        "topic updated in workbook"
    );
    Ok(applied)
}
