use std::fmt;

/// Deduplication metrics.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Metrics {
    header_lines: usize,
    unique_records: usize,
    pcr_duplicates: usize,
    bad_umis: usize,
    unmapped_reads: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    HeaderLine,
    Unique,
    PcrDuplicate,
    BadUmi,
    Unmapped,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HEADER_LINES\tRECORDS_EXAMINED\tUNIQUE_RECORDS\tPCR_DUPLICATES\tBAD_UMIS\tUNMAPPED_READS\tPERCENT_DUPLICATION")?;
        writeln!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{:.6}",
            self.header_lines,
            self.records_examined(),
            self.unique_records,
            self.pcr_duplicates,
            self.bad_umis,
            self.unmapped_reads,
            self.percent_duplication()
        )
    }
}

impl Metrics {
    /// Fraction of keyed records (unique or duplicate) that were duplicates
    pub fn percent_duplication(&self) -> f64 {
        let keyed = self.unique_records + self.pcr_duplicates;
        if keyed == 0 {
            0.0
        } else {
            self.pcr_duplicates as f64 / keyed as f64
        }
    }

    pub fn records_examined(&self) -> usize {
        self.unique_records + self.pcr_duplicates + self.bad_umis + self.unmapped_reads
    }

    pub fn header_lines(&self) -> usize {
        self.header_lines
    }

    pub fn unique_records(&self) -> usize {
        self.unique_records
    }

    pub fn pcr_duplicates(&self) -> usize {
        self.pcr_duplicates
    }

    pub fn bad_umis(&self) -> usize {
        self.bad_umis
    }

    pub fn unmapped_reads(&self) -> usize {
        self.unmapped_reads
    }

    pub fn count(&mut self, status: Status) {
        self.count_many(status, 1);
    }

    pub fn count_many(&mut self, status: Status, count: usize) {
        match status {
            Status::HeaderLine => self.header_lines += count,
            Status::Unique => self.unique_records += count,
            Status::PcrDuplicate => self.pcr_duplicates += count,
            Status::BadUmi => self.bad_umis += count,
            Status::Unmapped => self.unmapped_reads += count,
        }
    }
}
