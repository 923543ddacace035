use anyhow::{Context, Result};
use arrow::array::*;
use arrow::datatypes::*;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::config::OutputFormat;
use crate::error::PipelineError;
use crate::revelio::NameRow;

// Macro for creating Arrow schema fields
macro_rules! field {
    ($name:expr, $data_type:expr) => {
        Field::new($name, $data_type, true)
    };
    ($name:expr, $data_type:expr, $nullable:expr) => {
        Field::new($name, $data_type, $nullable)
    };
}

// Macro for creating schemas with less boilerplate
macro_rules! schema {
    ($($name:expr => $data_type:expr $(, $nullable:expr)?);* $(;)?) => {
        Schema::new(vec![
            $(field!($name, $data_type $(, $nullable)?),)*
        ])
    };
}

macro_rules! string_array_required {
    ($records:expr, $field:ident) => {
        Arc::new(StringArray::from_iter_values(
            $records.iter().map(|r| &r.$field),
        ))
    };
}

macro_rules! string_array_optional {
    ($records:expr, $field:ident) => {
        Arc::new(StringArray::from_iter(
            $records.iter().map(|r| r.$field.as_deref()),
        ))
    };
}

macro_rules! int64_array {
    ($records:expr, $field:ident) => {
        Arc::new(Int64Array::from_iter_values(
            $records.iter().map(|r| r.$field),
        ))
    };
}

macro_rules! int64_array_optional {
    ($records:expr, $field:ident) => {
        Arc::new(Int64Array::from_iter($records.iter().map(|r| r.$field)))
    };
}

macro_rules! bool_array_optional {
    ($records:expr, $field:ident) => {
        Arc::new(BooleanArray::from_iter($records.iter().map(|r| r.$field)))
    };
}

macro_rules! float64_array_optional {
    ($records:expr, $field:ident) => {
        Arc::new(Float64Array::from_iter($records.iter().map(|r| r.$field)))
    };
}

// Macro for creating record batches with less boilerplate
macro_rules! record_batch {
    ($schema:expr, $($array:expr),* $(,)?) => {
        RecordBatch::try_new(Arc::new($schema), vec![$($array,)*])
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// An executive position at the roster company
    CompanyConfirmed,
    NameUnique,
    NameAmbiguous,
    Unmatched,
}

impl MatchStatus {
    pub const ALL: [MatchStatus; 4] = [
        MatchStatus::CompanyConfirmed,
        MatchStatus::NameUnique,
        MatchStatus::NameAmbiguous,
        MatchStatus::Unmatched,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::CompanyConfirmed => "company_confirmed",
            MatchStatus::NameUnique => "name_unique",
            MatchStatus::NameAmbiguous => "name_ambiguous",
            MatchStatus::Unmatched => "unmatched",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_matched(self) -> bool {
        self != MatchStatus::Unmatched
    }
}

/// One row per roster entry: the roster fields joined with the chosen profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub roster_id: i64,
    pub batch: i64,
    pub first_name: String,
    pub surname: String,
    pub company: Option<String>,
    pub match_status: MatchStatus,
    pub n_candidates: i64,
    pub user_id: Option<String>,
    pub fullname: Option<String>,
    pub predicted_gender: Option<String>,
    pub predicted_ethnicity: Option<String>,
    pub location: Option<String>,
    pub n_connection: Option<i64>,
    pub prestige_score: Option<f64>,
    pub exec_title: Option<String>,
    pub exec_company: Option<String>,
    pub exec_rcid: Option<String>,
    pub exec_start_date: Option<String>,
    pub exec_end_date: Option<String>,
    pub exec_is_current: Option<bool>,
    pub n_exec_positions: i64,
    pub company_rcid: Option<String>,
    pub company_parent_rcid: Option<String>,
    pub company_parent_name: Option<String>,
    pub n_education: i64,
    pub education: Option<String>,
    pub n_skills: i64,
    pub skills: Option<String>,
}

impl EnrichedRecord {
    /// Empty strings become `None`, which is what a CSV round trip reads
    /// back, so both output formats carry the same values.
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.company,
            &mut self.user_id,
            &mut self.fullname,
            &mut self.predicted_gender,
            &mut self.predicted_ethnicity,
            &mut self.location,
            &mut self.exec_title,
            &mut self.exec_company,
            &mut self.exec_rcid,
            &mut self.exec_start_date,
            &mut self.exec_end_date,
            &mut self.company_rcid,
            &mut self.company_parent_rcid,
            &mut self.company_parent_name,
            &mut self.education,
            &mut self.skills,
        ] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
        self
    }
}

pub const ENRICHED_COLUMNS: [&str; 28] = [
    "roster_id",
    "batch",
    "first_name",
    "surname",
    "company",
    "match_status",
    "n_candidates",
    "user_id",
    "fullname",
    "predicted_gender",
    "predicted_ethnicity",
    "location",
    "n_connection",
    "prestige_score",
    "exec_title",
    "exec_company",
    "exec_rcid",
    "exec_start_date",
    "exec_end_date",
    "exec_is_current",
    "n_exec_positions",
    "company_rcid",
    "company_parent_rcid",
    "company_parent_name",
    "n_education",
    "education",
    "n_skills",
    "skills",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedRecord {
    pub roster_id: i64,
    pub batch: i64,
    pub first_name: String,
    pub surname: String,
    pub company: Option<String>,
}

impl From<&EnrichedRecord> for UnmatchedRecord {
    fn from(record: &EnrichedRecord) -> Self {
        Self {
            roster_id: record.roster_id,
            batch: record.batch,
            first_name: record.first_name.clone(),
            surname: record.surname.clone(),
            company: record.company.clone(),
        }
    }
}

// ====== PARQUET ======
pub fn create_parquet_writer(output_path: &Path, schema: Schema) -> Result<ArrowWriter<File>> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .set_max_row_group_size(1_000_000)
        .build();

    let writer = ArrowWriter::try_new(file, Arc::new(schema), Some(props))?;
    Ok(writer)
}

pub fn enriched_schema() -> Schema {
    schema! {
        "roster_id" => DataType::Int64, false;
        "batch" => DataType::Int64, false;
        "first_name" => DataType::Utf8, false;
        "surname" => DataType::Utf8, false;
        "company" => DataType::Utf8;
        "match_status" => DataType::Utf8, false;
        "n_candidates" => DataType::Int64, false;
        "user_id" => DataType::Utf8;
        "fullname" => DataType::Utf8;
        "predicted_gender" => DataType::Utf8;
        "predicted_ethnicity" => DataType::Utf8;
        "location" => DataType::Utf8;
        "n_connection" => DataType::Int64;
        "prestige_score" => DataType::Float64;
        "exec_title" => DataType::Utf8;
        "exec_company" => DataType::Utf8;
        "exec_rcid" => DataType::Utf8;
        "exec_start_date" => DataType::Utf8;
        "exec_end_date" => DataType::Utf8;
        "exec_is_current" => DataType::Boolean;
        "n_exec_positions" => DataType::Int64, false;
        "company_rcid" => DataType::Utf8;
        "company_parent_rcid" => DataType::Utf8;
        "company_parent_name" => DataType::Utf8;
        "n_education" => DataType::Int64, false;
        "education" => DataType::Utf8;
        "n_skills" => DataType::Int64, false;
        "skills" => DataType::Utf8;
    }
}

pub fn enriched_to_record_batch(records: &[EnrichedRecord]) -> Result<RecordBatch> {
    let batch = record_batch!(
        enriched_schema(),
        int64_array!(records, roster_id),
        int64_array!(records, batch),
        string_array_required!(records, first_name),
        string_array_required!(records, surname),
        string_array_optional!(records, company),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.match_status.as_str()),
        )),
        int64_array!(records, n_candidates),
        string_array_optional!(records, user_id),
        string_array_optional!(records, fullname),
        string_array_optional!(records, predicted_gender),
        string_array_optional!(records, predicted_ethnicity),
        string_array_optional!(records, location),
        int64_array_optional!(records, n_connection),
        float64_array_optional!(records, prestige_score),
        string_array_optional!(records, exec_title),
        string_array_optional!(records, exec_company),
        string_array_optional!(records, exec_rcid),
        string_array_optional!(records, exec_start_date),
        string_array_optional!(records, exec_end_date),
        bool_array_optional!(records, exec_is_current),
        int64_array!(records, n_exec_positions),
        string_array_optional!(records, company_rcid),
        string_array_optional!(records, company_parent_rcid),
        string_array_optional!(records, company_parent_name),
        int64_array!(records, n_education),
        string_array_optional!(records, education),
        int64_array!(records, n_skills),
        string_array_optional!(records, skills),
    )?;

    Ok(batch)
}

pub fn names_schema() -> Schema {
    schema! {
        "user_id" => DataType::Utf8, false;
        "fullname" => DataType::Utf8, false;
    }
}

pub fn names_to_record_batch(records: &[NameRow]) -> Result<RecordBatch> {
    let batch = record_batch!(
        names_schema(),
        string_array_required!(records, user_id),
        string_array_required!(records, fullname),
    )?;

    Ok(batch)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            PipelineError::Column {
                column: name.to_string(),
                path: path.to_path_buf(),
            }
            .into()
        })
}

fn opt_string(array: &StringArray, i: usize) -> Option<String> {
    (!array.is_null(i)).then(|| array.value(i).to_string())
}

fn opt_i64(array: &Int64Array, i: usize) -> Option<i64> {
    (!array.is_null(i)).then(|| array.value(i))
}

fn read_enriched_parquet(path: &Path) -> Result<Vec<EnrichedRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let s = |name: &str| column::<StringArray>(&batch, name, path);
        let n = |name: &str| column::<Int64Array>(&batch, name, path);

        let (roster_id, batch_no, n_candidates) = (n("roster_id")?, n("batch")?, n("n_candidates")?);
        let (first_name, surname, company) = (s("first_name")?, s("surname")?, s("company")?);
        let match_status = s("match_status")?;
        let (user_id, fullname) = (s("user_id")?, s("fullname")?);
        let (gender, ethnicity, location) =
            (s("predicted_gender")?, s("predicted_ethnicity")?, s("location")?);
        let n_connection = n("n_connection")?;
        let prestige = column::<Float64Array>(&batch, "prestige_score", path)?;
        let (exec_title, exec_company, exec_rcid) =
            (s("exec_title")?, s("exec_company")?, s("exec_rcid")?);
        let (exec_start, exec_end) = (s("exec_start_date")?, s("exec_end_date")?);
        let exec_current = column::<BooleanArray>(&batch, "exec_is_current", path)?;
        let n_exec = n("n_exec_positions")?;
        let (company_rcid, parent_rcid, parent) =
            (s("company_rcid")?, s("company_parent_rcid")?, s("company_parent_name")?);
        let (n_education, education) = (n("n_education")?, s("education")?);
        let (n_skills, skills) = (n("n_skills")?, s("skills")?);

        for i in 0..batch.num_rows() {
            let status = match_status.value(i);
            records.push(EnrichedRecord {
                roster_id: roster_id.value(i),
                batch: batch_no.value(i),
                first_name: first_name.value(i).to_string(),
                surname: surname.value(i).to_string(),
                company: opt_string(company, i),
                match_status: MatchStatus::parse(status).ok_or_else(|| PipelineError::Column {
                    column: format!("match_status ({})", status),
                    path: path.to_path_buf(),
                })?,
                n_candidates: n_candidates.value(i),
                user_id: opt_string(user_id, i),
                fullname: opt_string(fullname, i),
                predicted_gender: opt_string(gender, i),
                predicted_ethnicity: opt_string(ethnicity, i),
                location: opt_string(location, i),
                n_connection: opt_i64(n_connection, i),
                prestige_score: (!prestige.is_null(i)).then(|| prestige.value(i)),
                exec_title: opt_string(exec_title, i),
                exec_company: opt_string(exec_company, i),
                exec_rcid: opt_string(exec_rcid, i),
                exec_start_date: opt_string(exec_start, i),
                exec_end_date: opt_string(exec_end, i),
                exec_is_current: (!exec_current.is_null(i)).then(|| exec_current.value(i)),
                n_exec_positions: n_exec.value(i),
                company_rcid: opt_string(company_rcid, i),
                company_parent_rcid: opt_string(parent_rcid, i),
                company_parent_name: opt_string(parent, i),
                n_education: n_education.value(i),
                education: opt_string(education, i),
                n_skills: n_skills.value(i),
                skills: opt_string(skills, i),
            });
        }
    }
    Ok(records)
}

// ====== CSV ======
fn read_enriched_csv(path: &Path) -> Result<Vec<EnrichedRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    reader
        .deserialize::<EnrichedRecord>()
        .map(|row| row.with_context(|| format!("Malformed row in {}", path.display())))
        .collect()
}

/// Reads a per-batch or combined output, by file extension.
pub fn read_enriched(path: &Path) -> Result<Vec<EnrichedRecord>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => read_enriched_csv(path),
        Some("parquet") => read_enriched_parquet(path),
        _ => Err(PipelineError::UnsupportedFile(path.to_path_buf()).into()),
    }
}

pub fn write_unmatched(path: &Path, records: &[UnmatchedRecord]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["roster_id", "batch", "first_name", "surname", "company"])?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Streams enriched rows to CSV or Parquet; call `write` once per chunk.
pub enum EnrichedWriter {
    Csv(csv::Writer<File>),
    Parquet(ArrowWriter<File>),
}

impl EnrichedWriter {
    pub fn create(path: &Path, format: OutputFormat) -> Result<Self> {
        match format {
            OutputFormat::Csv => {
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_path(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                // header written up front so empty batches still parse
                writer.write_record(ENRICHED_COLUMNS)?;
                Ok(EnrichedWriter::Csv(writer))
            }
            OutputFormat::Parquet => Ok(EnrichedWriter::Parquet(create_parquet_writer(
                path,
                enriched_schema(),
            )?)),
        }
    }

    pub fn write(&mut self, records: &[EnrichedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        match self {
            EnrichedWriter::Csv(writer) => {
                for record in records {
                    writer.serialize(record)?;
                }
                writer.flush()?;
            }
            EnrichedWriter::Parquet(writer) => {
                writer.write(&enriched_to_record_batch(records)?)?;
                writer.flush()?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        match self {
            EnrichedWriter::Csv(mut writer) => writer.flush()?,
            EnrichedWriter::Parquet(writer) => {
                writer.close()?;
            }
        }
        Ok(())
    }
}

pub fn write_enriched(path: &Path, format: OutputFormat, records: &[EnrichedRecord]) -> Result<()> {
    let mut writer = EnrichedWriter::create(path, format)?;
    writer.write(records)?;
    writer.finish()
}

// ====== STATS FILES ======
pub fn write_key_values(path: &Path, pairs: &[(String, String)]) -> Result<()> {
    let mut text = String::new();
    for (key, value) in pairs {
        text.push_str(&format!("{}: {}\n", key, value));
    }
    std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

/// Reads `key: value` lines; anything else is ignored.
pub fn read_key_values(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(text
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect())
}

#[cfg(test)]
pub(crate) fn sample_record(roster_id: i64, batch: i64, status: MatchStatus) -> EnrichedRecord {
    let matched = status.is_matched();
    EnrichedRecord {
        roster_id,
        batch,
        first_name: format!("First{}", roster_id),
        surname: format!("Last{}", roster_id),
        company: Some("Acme, Inc.".to_string()),
        match_status: status,
        n_candidates: i64::from(matched),
        user_id: matched.then(|| format!("{}", 1000 + roster_id)),
        fullname: matched.then(|| format!("First{} Last{}", roster_id, roster_id)),
        predicted_gender: None,
        predicted_ethnicity: None,
        location: matched.then(|| "New York, NY".to_string()),
        n_connection: matched.then_some(500),
        prestige_score: matched.then_some(0.75),
        exec_title: matched.then(|| "Chief Executive Officer".to_string()),
        exec_company: matched.then(|| "Acme".to_string()),
        exec_rcid: None,
        exec_start_date: matched.then(|| "2015-01-01".to_string()),
        exec_end_date: None,
        exec_is_current: matched.then_some(true),
        n_exec_positions: i64::from(matched),
        company_rcid: None,
        company_parent_rcid: None,
        company_parent_name: None,
        n_education: 0,
        education: None,
        n_skills: 2,
        skills: matched.then(|| "leadership; strategy".to_string()),
    }
}
