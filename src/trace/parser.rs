//! Tracer line parser.
//!
//! A structured line carries exactly eight fields separated by `]::[`:
//!
//! ```text
//! <timestamp>]::[<container id>]::[<category>]::[<ppid>]::[<pid>]::[<syscall>]::[<exe>]::[<cmd>
//! ```
//!
//! The timestamp has the shape `YYYY-MM-DDThh:mm:ss.ffffff[+zone]`. Lines
//! containing [`OVERFLOW_MARKER`] announce lost events and carry no fields.

use chrono::NaiveDateTime;

use crate::container::ContainerID;

use super::event::TraceEvent;

/// Substring the tracer prints when its ring buffer dropped events.
pub const OVERFLOW_MARKER: &str = "drop event occured";

/// Field separator of structured lines.
pub const FIELD_SEPARATOR: &str = "]::[";

/// Outcome of parsing one tracer line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Event(TraceEvent),
    Overflow,
}

/// Named fields in a trace line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceField {
    Timestamp,
    ContainerId,
    Ppid,
    Pid,
}

impl std::fmt::Display for TraceField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TraceField::Timestamp => "timestamp",
            TraceField::ContainerId => "container_id",
            TraceField::Ppid => "ppid",
            TraceField::Pid => "pid",
        };
        write!(f, "{name}")
    }
}

/// Errors that may occur when parsing a trace line.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("expected 8 fields but found {found} in line: `{line}`")]
    FieldCount { found: usize, line: String },

    #[error("invalid `{field}` field `{value}` in line: `{line}`")]
    InvalidField {
        field: TraceField,
        value: String,
        line: String,
    },
}

/// Returns true if the line was emitted for the given container.
///
/// This is a substring test on the raw line so that lines of the monitor's own
/// container are dropped before any field parsing happens.
pub fn is_emitted_by(line: &str, container_id: &str) -> bool {
    let Some(start) = line.find(FIELD_SEPARATOR) else {
        return false;
    };
    line[start + FIELD_SEPARATOR.len()..]
        .split_once(FIELD_SEPARATOR)
        .is_some_and(|(id, _)| id == container_id)
}

/// Parses a single tracer line.
///
/// # Errors
///
/// Returns [`ParseError`] when the line is neither an overflow notice nor a
/// well formed structured line.
pub fn parse_line(line: &str) -> Result<ParsedLine, ParseError> {
    if line.contains(OVERFLOW_MARKER) {
        return Ok(ParsedLine::Overflow);
    }

    let parts: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    let [timestamp, container_id, category, ppid, pid, syscall, exe, cmd] = parts[..] else {
        return Err(ParseError::FieldCount {
            found: parts.len(),
            line: line.to_owned(),
        });
    };

    let invalid = |field: TraceField, value: &str| ParseError::InvalidField {
        field,
        value: value.to_owned(),
        line: line.to_owned(),
    };

    Ok(ParsedLine::Event(TraceEvent {
        timestamp: parse_timestamp(timestamp)
            .ok_or_else(|| invalid(TraceField::Timestamp, timestamp))?,
        container_id: ContainerID::new(container_id)
            .map_err(|_| invalid(TraceField::ContainerId, container_id))?,
        syscall_category: category.to_owned(),
        ppid: ppid
            .trim()
            .parse()
            .map_err(|_| invalid(TraceField::Ppid, ppid))?,
        pid: pid.trim().parse().map_err(|_| invalid(TraceField::Pid, pid))?,
        syscall_type: syscall.to_owned(),
        exe: exe.to_owned(),
        cmd: cmd.to_owned(),
    }))
}

/// Parses `YYYY-MM-DDThh:mm:ss.ffffff[+zone]`, ignoring the zone suffix.
///
/// The fractional seconds are mandatory.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let datetime = raw.split_once('+').map_or(raw, |(datetime, _)| datetime);
    let (_, fraction) = datetime.split_once('.')?;
    if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(datetime, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::event::TIMESTAMP_FORMAT;

    const LINE: &str = "2024-03-05T10:11:12.123456+0000]::[0123456789ab]::[file]::[1]::[42]::[openat]::[/usr/bin/cat]::[cat /etc/passwd";

    #[test]
    fn parses_structured_line() {
        let ParsedLine::Event(event) = parse_line(LINE).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.container_id.as_ref(), "0123456789ab");
        assert_eq!(event.syscall_category, "file");
        assert_eq!(event.ppid, 1);
        assert_eq!(event.pid, 42);
        assert_eq!(event.syscall_type, "openat");
        assert_eq!(event.exe, "/usr/bin/cat");
        assert_eq!(event.cmd, "cat /etc/passwd");
    }

    #[test]
    fn timestamp_round_trips() {
        let ParsedLine::Event(event) = parse_line(LINE).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(
            event.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            "2024-03-05T10:11:12.123456"
        );
    }

    #[test]
    fn timestamp_without_zone_is_accepted() {
        assert!(parse_timestamp("2024-03-05T10:11:12.000001").is_some());
    }

    #[test]
    fn timestamp_without_fraction_is_rejected() {
        assert!(parse_timestamp("2024-03-05T10:11:12").is_none());
        assert!(parse_timestamp("2024-03-05T10:11:12.+0000").is_none());
        assert!(parse_timestamp("garbage.123").is_none());
    }

    #[test]
    fn overflow_marker_wins_over_fields() {
        assert_eq!(
            parse_line("drop event occured").unwrap(),
            ParsedLine::Overflow
        );
        let noisy = format!("{LINE} drop event occured");
        assert_eq!(parse_line(&noisy).unwrap(), ParsedLine::Overflow);
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let err = parse_line("a]::[b]::[c").unwrap_err();
        assert!(matches!(err, ParseError::FieldCount { found: 3, .. }));

        let extra = format!("{LINE}]::[extra");
        let err = parse_line(&extra).unwrap_err();
        assert!(matches!(err, ParseError::FieldCount { found: 9, .. }));
    }

    #[test]
    fn non_numeric_pid_is_rejected() {
        let line = LINE.replace("]::[42]::[", "]::[forty-two]::[");
        match parse_line(&line).unwrap_err() {
            ParseError::InvalidField { field, .. } => assert_eq!(field, TraceField::Pid),
            err => panic!("unexpected error {err}"),
        }
    }

    #[test]
    fn invalid_timestamp_is_rejected() {
        let line = LINE.replace("2024-03-05T10", "2024-13-05T10");
        match parse_line(&line).unwrap_err() {
            ParseError::InvalidField { field, .. } => assert_eq!(field.to_string(), "timestamp"),
            err => panic!("unexpected error {err}"),
        }
    }

    #[test]
    fn detects_lines_of_container() {
        assert!(is_emitted_by(LINE, "0123456789ab"));
        assert!(!is_emitted_by(LINE, "0123456789"));
        assert!(!is_emitted_by("no separators here", "0123456789ab"));
    }
}
