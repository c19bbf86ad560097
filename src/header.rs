use log::{debug, warn};
use noodles_sam::header::record::value::map::program::tag as program_tag;
pub use noodles_sam::header::ParseError;
use noodles_sam::header::{
    record::value::map::{Map, Program},
    Header,
};

pub const HEADER_SENTINEL: u8 = b'@';
pub const PROGRAM_ID: &str = "umidedup";

/// Program names written by duplicate markers
const MARKDUP_NAMES: [&str; 3] = ["MarkDuplicates", "rumidup", PROGRAM_ID];

pub fn is_header_line(line: &[u8]) -> bool {
    line.first() == Some(&HEADER_SENTINEL)
}

/// The header lines at the top of the input. Only kept for inspection, the output gets the
/// original bytes, so text that is not UTF-8 is stored lossily.
#[derive(Debug, Default)]
pub struct HeaderBlock {
    text: String,
}

impl HeaderBlock {
    pub fn push(&mut self, line: &[u8]) {
        self.text.push_str(&String::from_utf8_lossy(line));
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn ends_with_newline(&self) -> bool {
        self.text.is_empty() || self.text.ends_with('\n')
    }

    fn lines_of(&self, record_type: &'static str) -> impl Iterator<Item = &str> + '_ {
        self.text
            .lines()
            .filter(move |l| l.split('\t').next() == Some(record_type))
    }

    pub fn is_coordinate_sorted(&self) -> bool {
        self.lines_of("@HD")
            .next()
            .is_some_and(|hd| hd.split('\t').any(|field| field == "SO:coordinate"))
    }

    fn program_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.lines_of("@PG")
            .filter_map(|pg| pg.split('\t').find_map(|field| field.strip_prefix("ID:")))
    }

    /// ID of the first program record left by a duplicate marker: Picard MarkDuplicates,
    /// samtools markdup, sambamba markdup, rumidup or an earlier umidedup run.
    pub fn markdup_program(&self) -> Result<Option<String>, ParseError> {
        let header: Header = self.text.parse()?;
        Ok(header
            .programs()
            .as_ref()
            .iter()
            .find(|(_, pg)| is_markdup(pg))
            .map(|(id, _)| id.to_string()))
    }

    /// Warn about inputs this tool is not meant for. Never fails, sorting is the caller's
    /// responsibility.
    pub fn inspect(&self) {
        if self.is_empty() {
            warn!("Input has no header, coordinate sorting can not be verified");
            return;
        }
        if !self.is_coordinate_sorted() {
            warn!("Input header does not declare SO:coordinate, duplicates may be missed");
        }
        match self.markdup_program() {
            Ok(Some(id)) => warn!("Input was already processed by a duplicate marker: {}", id),
            Ok(None) => {}
            Err(e) => debug!("Unable to parse header for program records: {}", e),
        }
    }

    /// A `@PG` line for this run, chained to the last program already in the header. The ID
    /// gets a numeric suffix when an earlier run left one behind.
    pub fn program_record(&self, command_line: &str, version: &str) -> String {
        let ids: Vec<&str> = self.program_ids().collect();

        let mut id = PROGRAM_ID.to_string();
        let mut n = 0;
        while ids.contains(&id.as_str()) {
            n += 1;
            id = format!("{}.{}", PROGRAM_ID, n);
        }

        let mut pg = format!("@PG\tID:{}\tPN:{}", id, PROGRAM_ID);
        if let Some(previous) = ids.last() {
            pg.push_str("\tPP:");
            pg.push_str(previous);
        }
        pg.push_str("\tVN:");
        pg.push_str(version);
        pg.push_str("\tCL:");
        pg.push_str(&command_line.replace(['\t', '\n'], " "));
        pg.push('\n');
        pg
    }
}

fn is_markdup(pg: &Map<Program>) -> bool {
    let fields = pg.other_fields();
    let command_line = fields.get(&program_tag::COMMAND_LINE);
    match fields.get(&program_tag::NAME) {
        Some(name) => {
            MARKDUP_NAMES.iter().any(|&known| name == known)
                || (name == "samtools"
                    && command_line.is_some_and(|cl| cl.starts_with(b"samtools markdup")))
        }
        // sambamba doesn't set program name
        None => command_line.is_some_and(|cl| cl.starts_with(b"markdup")),
    }
}
