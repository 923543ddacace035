use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::PipelineError;

const FIRST_NAME_COLUMNS: &[&str] = &["first_name", "firstname", "first"];
const SURNAME_COLUMNS: &[&str] = &["surname", "last_name", "lastname", "last"];
const COMPANY_COLUMNS: &[&str] = &["company", "company_name", "companyname", "conm", "firm"];
pub const ROSTER_ID_COLUMN: &str = "roster_id";

const NAME_SUFFIXES: &[&str] = &["jr.", "jr", "sr.", "sr", "iii", "ii", "iv"];

#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub roster_id: usize,
    pub first_name: String,
    pub surname: String,
    pub company: Option<String>,
    /// Original row, aligned with `Roster::headers`
    pub fields: Vec<String>,
}

impl RosterEntry {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.surname, self.first_name)
    }

    fn dedup_key(&self) -> (String, String, String) {
        (
            self.first_name.to_lowercase(),
            self.surname.to_lowercase(),
            self.company.as_deref().unwrap_or("").to_lowercase(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Roster {
    pub headers: Vec<String>,
    pub entries: Vec<RosterEntry>,
    pub skipped_blank: usize,
    pub skipped_duplicates: usize,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

struct ColumnIndices {
    first_name: usize,
    surname: usize,
    company: Option<usize>,
    roster_id: Option<usize>,
}

fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| aliases.contains(&h.trim().to_lowercase().as_str()))
}

fn resolve_columns(headers: &[String]) -> Result<ColumnIndices, PipelineError> {
    let missing = |column: &str| PipelineError::MissingColumn {
        column: column.to_string(),
        found: headers.join(", "),
    };
    Ok(ColumnIndices {
        first_name: find_column(headers, FIRST_NAME_COLUMNS).ok_or_else(|| missing("first_name"))?,
        surname: find_column(headers, SURNAME_COLUMNS).ok_or_else(|| missing("surname"))?,
        company: find_column(headers, COMPANY_COLUMNS),
        roster_id: find_column(headers, &[ROSTER_ID_COLUMN]),
    })
}

/// Decodes UTF-8 (dropping a BOM), falling back to Latin-1 byte-for-char.
pub fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text
            .strip_prefix('\u{feff}')
            .map(str::to_string)
            .unwrap_or(text),
        Err(err) => {
            warn!("Roster is not valid UTF-8, decoding as Latin-1");
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    }
}

pub fn load_roster(path: &Path) -> Result<Roster> {
    if !path.exists() {
        return Err(PipelineError::RosterNotFound(path.to_path_buf()).into());
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read roster {}", path.display()))?;
    let roster = parse_roster(&decode_text(bytes))
        .with_context(|| format!("Invalid roster {}", path.display()))?;
    info!(
        "Loaded {} entries from {} (columns: {})",
        roster.len(),
        path.display(),
        roster.headers.join(", ")
    );
    Ok(roster)
}

/// Parses a roster or a batch file. A `roster_id` column, when present, is
/// honoured and kept out of `headers`; otherwise ids follow row order.
pub fn parse_roster(text: &str) -> Result<Roster> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let raw_headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let columns = resolve_columns(&raw_headers)?;

    let keep: Vec<usize> = (0..raw_headers.len())
        .filter(|&i| Some(i) != columns.roster_id)
        .collect();
    let headers: Vec<String> = keep.iter().map(|&i| raw_headers[i].clone()).collect();

    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut skipped_blank = 0;
    let mut skipped_duplicates = 0;

    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let line = index + 2;
        let get = |i: usize| record.get(i).unwrap_or("").trim().to_string();

        let roster_id = match columns.roster_id {
            Some(i) => {
                let value = get(i);
                value
                    .parse::<usize>()
                    .map_err(|_| PipelineError::InvalidRosterId { value, line })?
            }
            None => index + 1,
        };

        let first_name = collapse_whitespace(&get(columns.first_name));
        let surname = collapse_whitespace(&get(columns.surname));
        if first_name.is_empty() || surname.is_empty() {
            warn!("Skipping line {}: blank first name or surname", line);
            skipped_blank += 1;
            continue;
        }

        let company = columns
            .company
            .map(get)
            .filter(|c| !c.is_empty());

        let entry = RosterEntry {
            roster_id,
            first_name,
            surname,
            company,
            fields: keep.iter().map(|&i| get(i)).collect(),
        };

        if !seen.insert(entry.dedup_key()) {
            warn!("Skipping line {}: duplicate of {}", line, entry.display_name());
            skipped_duplicates += 1;
            continue;
        }
        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(PipelineError::EmptyRoster.into());
    }

    debug!(
        "Parsed {} entries ({} blank, {} duplicates skipped)",
        entries.len(),
        skipped_blank,
        skipped_duplicates
    );

    Ok(Roster {
        headers,
        entries,
        skipped_blank,
        skipped_duplicates,
    })
}

/// Writes entries with a leading `roster_id` column so batch files can be
/// joined back onto the roster.
pub fn write_entries(path: &Path, headers: &[String], entries: &[RosterEntry]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header_row = vec![ROSTER_ID_COLUMN.to_string()];
    header_row.extend(headers.iter().cloned());
    writer.write_record(&header_row)?;

    for entry in entries {
        let mut row = vec![entry.roster_id.to_string()];
        row.extend(entry.fields.iter().cloned());
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapses whitespace and drops generational suffixes ("Jr.", "III", ...).
pub fn clean_name(name: &str) -> String {
    let tokens: Vec<&str> = name.split_whitespace().collect();
    if tokens.len() <= 1 {
        return tokens.join(" ");
    }
    tokens
        .into_iter()
        .filter(|token| {
            let bare = token.trim_end_matches(',').to_lowercase();
            !NAME_SUFFIXES.contains(&bare.as_str())
        })
        .map(|token| token.trim_end_matches(','))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Full-name spellings a profile might carry for this person.
pub fn name_variations(first_name: &str, surname: &str) -> Vec<String> {
    let first = clean_name(first_name);
    let last = clean_name(surname);

    let mut variations = vec![format!("{} {}", first, last), format!("{}, {}", last, first)];

    let first_parts: Vec<&str> = first.split_whitespace().collect();
    if first_parts.len() > 1 {
        variations.push(format!("{} {}", first_parts[0], last));
        variations.push(format!("{}, {}", last, first_parts[0]));
    }

    let mut seen = HashSet::new();
    variations.retain(|v| seen.insert(v.clone()));
    variations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_name_drops_suffixes_and_spacing() {
        assert_eq!(clean_name("  John   Smith Jr. "), "John Smith");
        assert_eq!(clean_name("Smith, III"), "Smith");
        assert_eq!(clean_name("Henry IV"), "Henry");
        // a suffix on its own is kept
        assert_eq!(clean_name("II"), "II");
        // substrings of names are left alone
        assert_eq!(clean_name("Ivan Srinivasan"), "Ivan Srinivasan");
    }

    #[test]
    fn variations_cover_middle_names() {
        let variations = name_variations("John Q", "Smith Jr");
        assert_eq!(
            variations,
            vec![
                "John Q Smith".to_string(),
                "Smith, John Q".to_string(),
                "John Smith".to_string(),
                "Smith, John".to_string(),
            ]
        );
        assert_eq!(name_variations("Mary", "Barra").len(), 2);
    }

    #[test]
    fn parses_aliased_columns_and_keeps_all_fields() {
        let roster = parse_roster(
            "gvkey,FirstName,Last_Name,conm\n001,Mary,Barra,General Motors\n002,Tim,Cook,Apple Inc\n",
        )
        .unwrap();
        assert_eq!(roster.headers, vec!["gvkey", "FirstName", "Last_Name", "conm"]);
        assert_eq!(roster.len(), 2);
        let first = &roster.entries[0];
        assert_eq!(first.roster_id, 1);
        assert_eq!(first.first_name, "Mary");
        assert_eq!(first.company.as_deref(), Some("General Motors"));
        assert_eq!(first.fields[0], "001");
    }

    #[test]
    fn skips_blank_and_duplicate_rows() {
        let roster = parse_roster(
            "first_name,surname,company\nMary,Barra,GM\n,Nobody,X\nmary,barra,gm\nTim,Cook,Apple\n",
        )
        .unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.skipped_blank, 1);
        assert_eq!(roster.skipped_duplicates, 1);
        // ids keep input row positions
        assert_eq!(roster.entries[1].roster_id, 4);
    }

    #[test]
    fn missing_surname_column_is_an_error() {
        let err = parse_roster("first_name,company\nMary,GM\n").unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert!(matches!(err, PipelineError::MissingColumn { ref column, .. } if column == "surname"));
    }

    #[test]
    fn header_only_roster_is_empty() {
        let err = parse_roster("first_name,surname\n").unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::EmptyRoster
        ));
    }

    #[test]
    fn latin1_bytes_are_decoded() {
        let bytes = b"first_name,surname\nJos\xe9,Mu\xf1oz\n".to_vec();
        let roster = parse_roster(&decode_text(bytes)).unwrap();
        assert_eq!(roster.entries[0].first_name, "José");
        assert_eq!(roster.entries[0].surname, "Muñoz");
    }

    #[test]
    fn utf8_bom_does_not_hide_the_first_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("excel_export.csv");
        std::fs::write(&path, "\u{feff}First_Name,Surname,Company\nAna,Ruiz,Acme\n").unwrap();

        assert!(decode_text(b"\xef\xbb\xbfa,b".to_vec()).starts_with("a,b"));
        let roster = load_roster(&path).unwrap();
        assert_eq!(roster.headers[0], "First_Name");
        assert_eq!(roster.entries[0].first_name, "Ana");
        assert_eq!(roster.entries[0].company.as_deref(), Some("Acme"));
    }

    #[test]
    fn batch_files_keep_roster_ids() {
        let dir = tempfile::tempdir().unwrap();
        let roster = parse_roster("first_name,surname\nA,One\nB,Two\nC,Three\n").unwrap();
        let path = dir.path().join("batch.csv");
        write_entries(&path, &roster.headers, &roster.entries[1..]).unwrap();

        let reloaded = load_roster(&path).unwrap();
        assert_eq!(reloaded.headers, roster.headers);
        assert_eq!(reloaded.entries, roster.entries[1..].to_vec());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_roster(Path::new("/definitely/not/here.csv")).unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::RosterNotFound(_)
        ));
    }
}
