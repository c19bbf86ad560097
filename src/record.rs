use std::fmt;
use std::sync::LazyLock;

use noodles_sam::alignment::record::Flags;
use regex::Regex;
use smallvec::SmallVec;
use thiserror::Error;

/// Number of leading columns needed to key a record: QNAME FLAG RNAME POS MAPQ CIGAR
const REQUIRED_FIELDS: usize = 6;

static UMI_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]+$").expect("valid umi regex"));
static LEADING_SOFT_CLIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)S").expect("valid soft clip regex"));

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strand::Forward => write!(f, "+"),
            Strand::Reverse => write!(f, "-"),
        }
    }
}

impl Strand {
    /// Strand of a mapped read. Unmapped reads have no strand.
    pub fn from_flags(flags: Flags) -> Option<Strand> {
        if flags.is_unmapped() {
            None
        } else if flags.is_reverse_complemented() {
            Some(Strand::Reverse)
        } else {
            Some(Strand::Forward)
        }
    }
}

/// A single alignment line, borrowed from the input buffer. Only the columns used for
/// deduplication are parsed; everything after the CIGAR is left untouched.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AlignmentRecord<'a> {
    pub read_id: &'a str,
    pub flags: Flags,
    pub reference_name: &'a str,
    pub position: i64,
    pub cigar: &'a str,
    soft_clip: Option<i64>,
}

impl<'a> AlignmentRecord<'a> {
    /// Parse the key columns of a record line. Only these columns need to be UTF-8, the rest
    /// of the line is never looked at.
    pub fn parse(line: &'a [u8]) -> Result<AlignmentRecord<'a>, RecordError> {
        let mut fields: SmallVec<[&str; REQUIRED_FIELDS]> = SmallVec::new();
        for (column, field) in line
            .split(u8::is_ascii_whitespace)
            .filter(|f| !f.is_empty())
            .take(REQUIRED_FIELDS)
            .enumerate()
        {
            let field = std::str::from_utf8(field).map_err(|_| RecordError::NotUtf8(column + 1))?;
            fields.push(field);
        }
        if fields.len() < REQUIRED_FIELDS {
            return Err(RecordError::TooFewFields(fields.len()));
        }

        let flag: u16 = lexical_core::parse(fields[1].as_bytes())
            .map_err(|_| RecordError::InvalidFlag(fields[1].to_string()))?;
        // unsigned POS keeps the clip subtraction in range
        let position: u32 = lexical_core::parse(fields[3].as_bytes())
            .map_err(|_| RecordError::InvalidPosition(fields[3].to_string()))?;
        let cigar = fields[5];

        Ok(AlignmentRecord {
            read_id: fields[0],
            flags: Flags::from(flag),
            reference_name: fields[2],
            position: i64::from(position),
            cigar,
            soft_clip: leading_soft_clip(cigar)?,
        })
    }

    pub fn umi(&self) -> Option<&'a str> {
        extract_umi(self.read_id)
    }

    pub fn strand(&self) -> Option<Strand> {
        Strand::from_flags(self.flags)
    }

    pub fn soft_clip(&self) -> Option<i64> {
        self.soft_clip
    }

    /// Start of the read before soft clipping. May fall before the first reference base.
    pub fn effective_start(&self) -> i64 {
        self.position - self.soft_clip.unwrap_or(0)
    }
}

/// The UMI is the trailing run of uppercase letters of the read name, e.g.
/// `NS500451:154:HWKTMBGXX:1:11101:24260:1121:CTGTTCAC` carries `CTGTTCAC`.
pub fn extract_umi(read_id: &str) -> Option<&str> {
    UMI_SUFFIX.find(read_id).map(|m| m.as_str())
}

/// Length of a soft clip at the start of the CIGAR, `None` when the alignment starts with
/// any other operation.
pub fn leading_soft_clip(cigar: &str) -> Result<Option<i64>, RecordError> {
    match LEADING_SOFT_CLIP.captures(cigar) {
        Some(caps) => {
            let len = &caps[1];
            lexical_core::parse::<u32>(len.as_bytes())
                .map(|n| Some(i64::from(n)))
                .map_err(|_| RecordError::InvalidSoftClip(cigar.to_string()))
        }
        None => Ok(None),
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RecordError {
    #[error("column {0} is not valid UTF-8")]
    NotUtf8(usize),
    #[error("expected at least 6 fields, found {0}")]
    TooFewFields(usize),
    #[error("flag is not a valid integer: {0:?}")]
    InvalidFlag(String),
    #[error("position is not a valid unsigned integer: {0:?}")]
    InvalidPosition(String),
    #[error("soft clip length out of range in cigar {0:?}")]
    InvalidSoftClip(String),
}
