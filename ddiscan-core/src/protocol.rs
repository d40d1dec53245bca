//! Serial line protocol: line reassembly and record parsing.
//!
//! The sensor writes one ASCII record per line:
//!
//! ```text
//! <amplitude>,<tof_microseconds>\n
//! ```
//!
//! There is no framing beyond the newline, no checksum and no escaping.
//! Reads from the link return arbitrary slices of this stream, so a record
//! may arrive split over any number of chunks.

use crate::error::ParseError;

/// Record delimiter
pub const LINE_DELIMITER: u8 = b'\n';

/// Separator between the two fields of a record
pub const FIELD_SEPARATOR: char = ',';

/// Number of fields in a record
pub const FIELD_COUNT: usize = 2;

// =============================================================================
// Line Assembly
// =============================================================================

/// Reassembles newline-delimited lines from arbitrary chunk boundaries.
///
/// Bytes that do not yet form a complete line stay buffered until a later
/// chunk supplies the delimiter. Nothing else ever clears the buffer, and no
/// length limit is imposed.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and iterate over every line it completes.
    ///
    /// Lines are trimmed of surrounding whitespace (so `\r\n` endings work).
    /// The consumed prefix, delimiter included, is removed from the buffer
    /// when the returned iterator is dropped; lines not pulled from it are
    /// still there on the next call.
    pub fn feed<'a>(&'a mut self, chunk: &[u8]) -> Lines<'a> {
        self.buffer.extend_from_slice(chunk);
        Lines {
            buffer: &mut self.buffer,
            consumed: 0,
        }
    }

    /// Bytes of the trailing partial line
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Lazy iterator over the complete lines in a [`LineAssembler`].
pub struct Lines<'a> {
    buffer: &'a mut Vec<u8>,
    consumed: usize,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let rest = &self.buffer[self.consumed..];
        let idx = rest.iter().position(|&b| b == LINE_DELIMITER)?;
        let line = String::from_utf8_lossy(&rest[..idx]).trim().to_string();
        self.consumed += idx + 1;
        Some(line)
    }
}

impl Drop for Lines<'_> {
    fn drop(&mut self) {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
        }
    }
}

// =============================================================================
// Record Parsing
// =============================================================================

/// One validated sensor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    /// Echo amplitude (ADC counts)
    pub amplitude: f32,
    /// Round-trip time of flight in microseconds
    pub tof_us: f32,
}

/// Parse one reassembled line into a [`Record`].
///
/// Exactly two comma-separated fields, each a finite decimal number
/// (sign, fraction and exponent allowed, surrounding spaces ignored).
/// Anything else is rejected as a whole; there is no partial record.
pub fn parse_record(line: &str) -> Result<Record, ParseError> {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if fields.len() != FIELD_COUNT {
        return Err(ParseError::FieldCount(fields.len()));
    }

    let amplitude = parse_field(fields[0], 0)?;
    let tof_us = parse_field(fields[1], 1)?;

    Ok(Record { amplitude, tof_us })
}

fn parse_field(text: &str, index: usize) -> Result<f32, ParseError> {
    let value: f32 = text
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidNumber {
            index,
            text: text.to_string(),
        })?;
    if !value.is_finite() {
        return Err(ParseError::NonFinite { index });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(assembler: &mut LineAssembler, chunk: &[u8]) -> Vec<String> {
        assembler.feed(chunk).collect()
    }

    #[test]
    fn test_whole_line_in_one_chunk() {
        let mut assembler = LineAssembler::new();
        assert_eq!(collect(&mut assembler, b"12.5,2000\n"), vec!["12.5,2000"]);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut assembler = LineAssembler::new();
        assert!(collect(&mut assembler, b"12.5,20").is_empty());
        assert_eq!(assembler.pending(), b"12.5,20");

        assert_eq!(collect(&mut assembler, b"00\n"), vec!["12.5,2000"]);
        assert!(assembler.pending().is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut assembler = LineAssembler::new();
        let mut lines = Vec::new();
        for b in b"1,2\n3,4\n" {
            lines.extend(collect(&mut assembler, std::slice::from_ref(b)));
        }
        assert_eq!(lines, vec!["1,2", "3,4"]);
    }

    #[test]
    fn test_several_lines_and_trailing_partial() {
        let mut assembler = LineAssembler::new();
        let lines = collect(&mut assembler, b"1,2\r\n  3,4  \n5,");
        assert_eq!(lines, vec!["1,2", "3,4"]);
        assert_eq!(assembler.pending(), b"5,");
    }

    #[test]
    fn test_empty_lines_are_yielded() {
        let mut assembler = LineAssembler::new();
        assert_eq!(collect(&mut assembler, b"\n\n"), vec!["", ""]);
    }

    #[test]
    fn test_unconsumed_lines_survive_to_next_feed() {
        let mut assembler = LineAssembler::new();
        {
            let mut lines = assembler.feed(b"a\nb\n");
            assert_eq!(lines.next().as_deref(), Some("a"));
        }
        assert_eq!(assembler.pending(), b"b\n");
        assert_eq!(collect(&mut assembler, b"c\n"), vec!["b", "c"]);
    }

    #[test]
    fn test_no_length_limit() {
        let mut assembler = LineAssembler::new();
        let long = vec![b'7'; 100_000];
        assert!(collect(&mut assembler, &long).is_empty());
        assert_eq!(assembler.pending_len(), 100_000);
        let lines = collect(&mut assembler, b"\n");
        assert_eq!(lines[0].len(), 100_000);
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_fatal() {
        let mut assembler = LineAssembler::new();
        let lines = collect(&mut assembler, b"\xff,1\n2,3\n");
        assert_eq!(lines.len(), 2);
        assert!(parse_record(&lines[0]).is_err());
        assert!(parse_record(&lines[1]).is_ok());
    }

    #[test]
    fn test_parse_valid_record() {
        let record = parse_record("12.5,2000").unwrap();
        assert_eq!(
            record,
            Record {
                amplitude: 12.5,
                tof_us: 2000.0
            }
        );
    }

    #[test]
    fn test_parse_signs_fractions_and_spaces() {
        let record = parse_record("-3.25, +1500.5").unwrap();
        assert_eq!(record.amplitude, -3.25);
        assert_eq!(record.tof_us, 1500.5);
        assert_eq!(parse_record("1e2,2E3").unwrap().tof_us, 2000.0);
    }

    #[test]
    fn test_parse_wrong_field_count() {
        assert_eq!(parse_record("12.5"), Err(ParseError::FieldCount(1)));
        assert_eq!(parse_record("1,2,3"), Err(ParseError::FieldCount(3)));
        assert_eq!(parse_record(""), Err(ParseError::FieldCount(1)));
    }

    #[test]
    fn test_parse_non_numeric() {
        assert!(matches!(
            parse_record("abc,123"),
            Err(ParseError::InvalidNumber { index: 0, .. })
        ));
        assert!(matches!(
            parse_record("12,"),
            Err(ParseError::InvalidNumber { index: 1, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_finite() {
        assert_eq!(
            parse_record("NaN,10"),
            Err(ParseError::NonFinite { index: 0 })
        );
        assert_eq!(
            parse_record("1,inf"),
            Err(ParseError::NonFinite { index: 1 })
        );
    }
}
