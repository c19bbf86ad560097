use std::fmt;

use ahash::AHashMap;
use log::debug;

use crate::header::is_header_line;
use crate::metrics::{Metrics, Status};
use crate::record::{AlignmentRecord, RecordError, Strand};
use crate::umis::KnownUmis;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkResult {
    Header,
    Unique,
    Duplicate,
    BadUmi,
    Unmapped,
}

impl MarkResult {
    /// Header lines and unique records go to the output, everything else is dropped
    pub fn is_emitted(&self) -> bool {
        matches!(self, MarkResult::Header | MarkResult::Unique)
    }
}

impl From<MarkResult> for Status {
    fn from(r: MarkResult) -> Status {
        match r {
            MarkResult::Header => Status::HeaderLine,
            MarkResult::Unique => Status::Unique,
            MarkResult::Duplicate => Status::PcrDuplicate,
            MarkResult::BadUmi => Status::BadUmi,
            MarkResult::Unmapped => Status::Unmapped,
        }
    }
}

/// Identity of a read used to recognize PCR copies: UMI, strand, chromosome and unclipped start.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DedupKey<'a> {
    pub umi: &'a str,
    pub strand: Strand,
    pub reference_name: &'a str,
    pub position: i64,
}

impl fmt::Display for DedupKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}:{}", self.umi, self.strand, self.reference_name, self.position)
    }
}

/// Raw location of the last record accepted for a UMI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Locus {
    pub strand: Strand,
    pub reference_name: String,
    pub position: i64,
}

impl Locus {
    fn same_strand_and_reference(&self, strand: Strand, reference_name: &str) -> bool {
        self.strand == strand && self.reference_name == reference_name
    }
}

/// Keeps one locus per UMI, the one most recently accepted. On coordinate sorted input PCR
/// copies sit next to each other, so a copy separated from its original by another read with
/// the same UMI at a different position is not recognized.
#[derive(Debug, Default)]
pub struct DedupIndex(AHashMap<String, Locus>);

impl DedupIndex {
    pub fn get(&self, umi: &str) -> Option<&Locus> {
        self.0.get(umi)
    }

    pub fn insert(&mut self, umi: &str, strand: Strand, reference_name: &str, position: i64) {
        if let Some(locus) = self.0.get_mut(umi) {
            locus.strand = strand;
            locus.position = position;
            if locus.reference_name != reference_name {
                reference_name.clone_into(&mut locus.reference_name);
            }
        } else {
            self.0.insert(
                umi.to_owned(),
                Locus { strand, reference_name: reference_name.to_owned(), position },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Classifies every line of a coordinate sorted SAM stream. Owns the known UMIs, the index of
/// accepted loci and the metrics for a single run.
pub struct Deduper {
    known: KnownUmis,
    index: DedupIndex,
    metrics: Metrics,
}

impl Deduper {
    pub fn new(known: KnownUmis) -> Deduper {
        Deduper { known, index: DedupIndex::default(), metrics: Metrics::default() }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    /// Classify one input line and count the outcome. Lines that cannot be parsed are
    /// returned as an error and leave the counts and the index untouched.
    pub fn classify(&mut self, line: &[u8]) -> Result<MarkResult, RecordError> {
        let result = self.mark(line)?;
        self.metrics.count(result.into());
        Ok(result)
    }

    fn mark(&mut self, line: &[u8]) -> Result<MarkResult, RecordError> {
        if is_header_line(line) {
            return Ok(MarkResult::Header);
        }

        let record = AlignmentRecord::parse(line)?;

        let umi = match record.umi() {
            Some(umi) if self.known.contains(umi) => umi,
            Some(_) => return Ok(MarkResult::BadUmi),
            None => {
                debug!("No UMI at the end of read name {}", record.read_id);
                return Ok(MarkResult::BadUmi);
            }
        };

        let Some(strand) = record.strand() else {
            debug!("Skipping unmapped read {}", record.read_id);
            return Ok(MarkResult::Unmapped);
        };

        let key = DedupKey {
            umi,
            strand,
            reference_name: record.reference_name,
            position: record.effective_start(),
        };

        if let Some(last) = self.index.get(umi) {
            // a clipped read also matches a stored locus at its reported start
            if last.same_strand_and_reference(key.strand, key.reference_name)
                && (last.position == key.position || last.position == record.position)
            {
                debug!("{} duplicate of {}", record.read_id, key);
                return Ok(MarkResult::Duplicate);
            }
        }

        self.index.insert(umi, strand, record.reference_name, record.position);
        Ok(MarkResult::Unique)
    }
}
