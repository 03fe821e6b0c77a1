//! CSV input formats: the bindings list read by export and the pattern list
//! read by import.

use std::borrow::Cow;
use std::io::Read;

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Deserialize;

use crate::synth::SearchTask;
use crate::{parse_hex_i64, parse_number, Address, SigError};

/// Raw bindings row: `name,address,size`
#[derive(Debug, Deserialize)]
struct BindingRecord {
    name: String,
    address: String,
    size: String,
}

/// Raw pattern row: `offset,name,pattern`
#[derive(Debug, Deserialize)]
struct PatternRecord {
    offset: String,
    name: String,
    pattern: String,
}

/// One signature to relocate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternRow {
    /// Address of the symbol in the build the pattern was made from
    pub offset: Address,
    /// Symbol name
    pub name: String,
    /// Pattern text, parsed when it is scanned
    pub pattern: String,
}

/// Quote a field for an output line when it holds a separator, a quote or a
/// newline. Inner quotes are doubled, so the readers below get it back intact.
pub fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains(&[',', '"', '\n', '\r'][..]) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map_or(0, |p| p.line())
}

/// Read the bindings list into search tasks.
///
/// The first line is a header and is skipped. Addresses and sizes are decimal
/// or `0x`-prefixed hexadecimal. Any malformed row fails the whole read.
pub fn read_bindings<R: Read>(reader: R) -> Result<Vec<SearchTask>, SigError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut tasks = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let line = line_of(&record);
        let invalid = |reason: String| SigError::InvalidBinding { line, reason };

        let row: BindingRecord = record.deserialize(None).map_err(|e| invalid(e.to_string()))?;
        let address = parse_number(&row.address).map_err(|e| invalid(e.to_string()))?;
        let size = parse_number(&row.size).map_err(|e| invalid(e.to_string()))?;
        let size = usize::try_from(size).map_err(|e| invalid(e.to_string()))?;

        tasks.push(SearchTask::new(row.name, address, size));
    }

    log::debug!("Read {} bindings", tasks.len());
    Ok(tasks)
}

/// Read the pattern list produced by export.
///
/// There is no header. Rows without exactly three fields, or with an offset
/// that is not hexadecimal, are reported and skipped.
pub fn read_patterns<R: Read>(reader: R) -> Vec<PatternRow> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Invalid line: {}", e);
                continue;
            }
        };
        let line = line_of(&record);

        if record.len() != 3 {
            log::warn!("Invalid line {}: expected 3 fields, got {}", line, record.len());
            continue;
        }

        let row: PatternRecord = match record.deserialize(None) {
            Ok(row) => row,
            Err(e) => {
                log::warn!("Invalid line {}: {}", line, e);
                continue;
            }
        };

        match parse_hex_i64(&row.offset) {
            Ok(offset) => rows.push(PatternRow {
                offset: offset as Address,
                name: row.name,
                pattern: row.pattern,
            }),
            Err(e) => log::warn!("Invalid line {}: {}", line, e),
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_read_bindings() {
        let input = "name,address,size\nmain,4096,128\nhelper,0x2000,0x40\n";
        let tasks = read_bindings(input.as_bytes()).unwrap();
        assert_eq!(
            tasks,
            vec![
                SearchTask::new("main", 4096, 128),
                SearchTask::new("helper", 0x2000, 0x40),
            ]
        );
    }

    #[test]
    fn test_read_bindings_header_only() {
        assert!(read_bindings("name,address,size\n".as_bytes()).unwrap().is_empty());
    }

    #[rstest]
    #[case("name,address,size\nmain\n")]
    #[case("name,address,size\nmain,zz,4\n")]
    #[case("name,address,size\nmain,16,-1\n")]
    fn test_read_bindings_rejects_bad_row(#[case] input: &str) {
        let err = read_bindings(input.as_bytes()).unwrap_err();
        assert!(matches!(err, SigError::InvalidBinding { line: 2, .. }), "{}", err);
    }

    #[test]
    fn test_read_patterns() {
        let input = "0x1400,main,48 8B 05\n0x2000,\"a,b\",C3 ? 90\n";
        let rows = read_patterns(input.as_bytes());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].offset, 0x1400);
        assert_eq!(rows[0].pattern, "48 8B 05");
        assert_eq!(rows[1].name, "a,b");
    }

    #[rstest]
    #[case("main", "main")]
    #[case("ns::f(int, int)", "\"ns::f(int, int)\"")]
    #[case("operator\"\"_x", "\"operator\"\"\"\"_x\"")]
    #[case("a\nb", "\"a\nb\"")]
    fn test_escape_field(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(escape_field(name), expected);

        // Whatever gets quoted reads back as the same name
        let line = format!("0x10,{},90\n", escape_field(name));
        let rows = read_patterns(line.as_bytes());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, name);
    }

    #[test]
    fn test_read_patterns_skips_bad_rows() {
        let input = "0x10,only-two\nnothex,f,90\n0x20,g,90,extra\n1F,h,C3\n";
        let rows = read_patterns(input.as_bytes());
        assert_eq!(
            rows,
            vec![PatternRow {
                offset: 0x1F,
                name: "h".to_string(),
                pattern: "C3".to_string(),
            }]
        );
    }
}
