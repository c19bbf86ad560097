use std::marker::Unpin;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{info, warn};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite},
};

use crate::{
    header::{HeaderBlock, PROGRAM_ID},
    io::SamIo,
    markdups::{Deduper, MarkResult},
    record::RecordError,
    umis::{KnownUmis, UmiListError},
};

/// Appended to the input path when no output is given
pub const OUTPUT_SUFFIX: &str = "_deduped";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    /// The coordinate sorted SAM file to deduplicate
    #[clap(short = 'f', long = "file")]
    pub file: PathBuf,

    /// File with the known UMIs, one per line. Required, randomers are not supported
    #[clap(short = 'u', long = "umi")]
    pub umi: Option<PathBuf>,

    /// The input contains paired end reads. Not supported, umidedup stops when set
    #[clap(short = 'p', long)]
    pub paired_end: bool,

    /// The output SAM file. Defaults to the input path with `_deduped` appended
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// The duplication metrics file, if missing metrics will be written to stderr
    #[clap(short = 'm', long)]
    pub metrics: Option<PathBuf>,

    /// Add a @PG record for umidedup to the output header.
    /// By default the header is copied unchanged
    #[clap(short = 'g', long)]
    pub add_pg: bool,
}

impl Config {
    /// Check the options that make a run impossible and return the UMI list path.
    pub fn validate(&self) -> Result<&Path, UmiDedupError> {
        let umi = self.umi.as_deref().ok_or(UmiDedupError::MissingUmiList)?;
        if self.paired_end {
            return Err(UmiDedupError::PairedEndUnsupported);
        }
        Ok(umi)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let mut path = self.file.clone().into_os_string();
            path.push(OUTPUT_SUFFIX);
            PathBuf::from(path)
        })
    }
}

pub struct App {
    config: Config,
    output: PathBuf,
    samio: SamIo<File, File>,
    deduper: Deduper,
}

impl App {
    pub async fn new() -> Result<App, UmiDedupError> {
        App::with_config(Config::parse()).await
    }

    pub async fn with_config(config: Config) -> Result<App, UmiDedupError> {
        let umi_list = config.validate()?;
        let known = KnownUmis::load(umi_list).await?;
        info!("Loaded {} known UMIs from {}", known.len(), umi_list.display());

        let read = File::open(&config.file)
            .await
            .map_err(|source| UmiDedupError::Open { path: config.file.clone(), source })?;

        let output = config.output_path();
        let write = File::create(&output)
            .await
            .map_err(|source| UmiDedupError::Create { path: output.clone(), source })?;

        Ok(App { config, output, samio: SamIo::new(read, write), deduper: Deduper::new(known) })
    }

    /// Copy the header and every record not rejected by the deduper to the output, then
    /// report the metrics.
    pub async fn run(&mut self) -> Result<(), UmiDedupError> {
        info!("Input: {}", self.config.file.display());
        info!("Output: {}", self.output.display());

        let command_line = self
            .config
            .add_pg
            .then(|| std::env::args().collect::<Vec<_>>().join(" "));
        if let Err(e) =
            dedup_stream(&mut self.samio, &mut self.deduper, command_line.as_deref()).await
        {
            self.discard_output().await;
            return Err(e);
        }
        self.samio.shutdown().await?;

        let metrics = self.deduper.metrics();
        info!("Number of PCR duplicates: {}", metrics.pcr_duplicates());
        info!("Number of incorrect UMIs: {}", metrics.bad_umis());
        if metrics.unmapped_reads() > 0 {
            info!("Number of skipped unmapped reads: {}", metrics.unmapped_reads());
        }
        info!(
            "Wrote {} unique records for {} UMIs",
            metrics.unique_records(),
            self.deduper.index().len()
        );

        // print/write the metrics (sync)
        if let Some(path) = &self.config.metrics {
            use std::io::Write;
            let mut mout = std::fs::File::create(path)
                .map_err(|source| UmiDedupError::Create { path: path.clone(), source })?;
            write!(mout, "{}", metrics)?;
        } else {
            eprint!("{}", metrics);
        }

        Ok(())
    }

    // a failed run leaves no partial output behind
    async fn discard_output(&mut self) {
        // write errors are moot, the file goes next
        let _ = self.samio.shutdown().await;
        match tokio::fs::remove_file(&self.output).await {
            Ok(()) => warn!("Removed incomplete output {}", self.output.display()),
            Err(e) => warn!("Incomplete output left at {}: {}", self.output.display(), e),
        }
    }
}

/// Classify every line of `samio` and write headers and unique records. The leading header
/// block is inspected once the first record is reached; with `command_line` set a @PG line is
/// written after it.
pub async fn dedup_stream<R, W>(
    samio: &mut SamIo<R, W>,
    deduper: &mut Deduper,
    command_line: Option<&str>,
) -> Result<(), UmiDedupError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    let mut header = HeaderBlock::default();
    let mut in_header = true;

    while samio.read_line(&mut line).await? {
        let result = deduper
            .classify(&line)
            .map_err(|source| UmiDedupError::Malformed { line: samio.line_number(), source })?;

        if in_header {
            if result == MarkResult::Header {
                header.push(&line);
            } else {
                in_header = false;
                finish_header(samio, &header, command_line).await?;
            }
        }

        if result.is_emitted() {
            samio.write_line(&line).await?;
        }
    }

    if in_header {
        finish_header(samio, &header, command_line).await?;
    }

    Ok(())
}

async fn finish_header<R, W>(
    samio: &mut SamIo<R, W>,
    header: &HeaderBlock,
    command_line: Option<&str>,
) -> Result<(), UmiDedupError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    header.inspect();
    if let Some(command_line) = command_line {
        if !header.ends_with_newline() {
            samio.write_line(b"\n").await?;
        }
        samio
            .write_line(header.program_record(command_line, env!("CARGO_PKG_VERSION")).as_bytes())
            .await?;
        info!("Added @PG record for {}", PROGRAM_ID);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum UmiDedupError {
    #[error("A file of known UMIs is required (--umi), randomers are not supported")]
    MissingUmiList,
    #[error("Paired end reads are not supported")]
    PairedEndUnsupported,
    #[error("Unable to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to create {}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: RecordError,
    },
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error loading UMI list")]
    UmiListError(#[from] UmiListError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:248956422\n@SQ\tSN:chr2\tLN:242193529\n@PG\tID:bwa\tPN:bwa\tVN:0.7.17\n";

    fn known() -> KnownUmis {
        ["AACGCCAT", "AAGGTACG", "CTGTTCAC"].into_iter().collect()
    }

    fn record(name: &str, umi: &str, flag: u16, chr: &str, pos: i64, cigar: &str) -> String {
        format!("{name}:{umi}\t{flag}\t{chr}\t{pos}\t36\t{cigar}\t*\t0\t0\tACGTACGT\tEEEEEEEE\tNH:i:1\n")
    }

    async fn dedup_bytes(input: &[u8], command_line: Option<&str>) -> (Vec<u8>, Deduper) {
        let mut deduper = Deduper::new(known());
        let mut out = Vec::new();
        let mut samio = SamIo::new(input, &mut out);
        dedup_stream(&mut samio, &mut deduper, command_line).await.unwrap();
        samio.shutdown().await.unwrap();
        drop(samio);
        (out, deduper)
    }

    async fn dedup(input: &str, command_line: Option<&str>) -> (String, Deduper) {
        let (out, deduper) = dedup_bytes(input.as_bytes(), command_line).await;
        (String::from_utf8(out).unwrap(), deduper)
    }

    #[tokio::test]
    async fn end_to_end() {
        let first = record("r1", "AACGCCAT", 0, "chr1", 100, "36M");
        let input = format!("{HEADER}{first}{}", record("r2", "AACGCCAT", 0, "chr1", 100, "36M"));

        let (out, deduper) = dedup(&input, None).await;
        assert_eq!(out, format!("{HEADER}{first}"));
        assert_eq!(deduper.metrics().pcr_duplicates(), 1);
        assert_eq!(deduper.metrics().bad_umis(), 0);
        assert_eq!(deduper.metrics().header_lines(), 4);
    }

    #[tokio::test]
    async fn soft_clip_end_to_end() {
        let first = record("r1", "AACGCCAT", 0, "chr1", 100, "36M");
        let input = format!("{HEADER}{first}{}", record("r2", "AACGCCAT", 0, "chr1", 105, "5S31M"));

        let (out, deduper) = dedup(&input, None).await;
        assert_eq!(out, format!("{HEADER}{first}"));
        assert_eq!(deduper.metrics().pcr_duplicates(), 1);
    }

    #[tokio::test]
    async fn reprocessing_output_changes_nothing() {
        let input = [
            HEADER.to_string(),
            record("r1", "AACGCCAT", 0, "chr1", 100, "36M"),
            record("r2", "AACGCCAT", 0, "chr1", 100, "36M"),
            record("r3", "CTGTTCAC", 16, "chr1", 100, "36M"),
            record("r4", "TTTTTTTT", 0, "chr1", 100, "36M"),
            record("r5", "AACGCCAT", 0, "chr1", 103, "3S33M"),
            record("r6", "AACGCCAT", 0, "chr1", 250, "36M"),
            record("r7", "AACGCCAT", 4, "chr1", 250, "36M"),
            record("r8", "AACGCCAT", 0, "chr1", 100, "36M"),
            record("r9", "AAGGTACG", 0, "chr2", 100, "4S32M"),
            record("r10", "AAGGTACG", 0, "chr2", 96, "36M"),
        ]
        .concat();

        let (once, first) = dedup(&input, None).await;
        assert_eq!(first.metrics().pcr_duplicates(), 2);
        assert_eq!(first.metrics().bad_umis(), 1);
        assert_eq!(first.metrics().unmapped_reads(), 1);
        assert_eq!(first.metrics().unique_records(), 6);

        let (twice, second) = dedup(&once, None).await;
        assert_eq!(twice, once);
        assert_eq!(second.metrics().pcr_duplicates(), 0);
        assert_eq!(second.metrics().bad_umis(), 0);
        assert_eq!(second.metrics().unique_records(), 6);
    }

    #[tokio::test]
    async fn headers_pass_through() {
        let comment = "@CO\tsecond batch\n";
        let first = record("r1", "AACGCCAT", 0, "chr1", 100, "36M");
        let input = format!("{HEADER}{first}{comment}{}", record("r2", "GGGGGGGG", 0, "chr1", 100, "36M"));

        let (out, deduper) = dedup(&input, None).await;
        assert_eq!(out, format!("{HEADER}{first}{comment}"));
        assert_eq!(deduper.metrics().header_lines(), 5);
        assert_eq!(deduper.metrics().records_examined(), 2);
    }

    #[tokio::test]
    async fn non_utf8_header_and_tags_pass_through() {
        let comment: &[u8] = b"@CO\tlab M\xfcller\n";
        let first = record("r1", "AACGCCAT", 0, "chr1", 100, "36M");
        let second: &[u8] = b"r2:AAGGTACG\t0\tchr1\t120\t36\t36M\t*\t0\t0\tACGT\tEEEE\tCO:Z:M\xfcller\n";
        let input = [HEADER.as_bytes(), comment, first.as_bytes(), second].concat();

        let (out, deduper) = dedup_bytes(&input, Some("umidedup")).await;
        let pg = format!(
            "@PG\tID:umidedup\tPN:umidedup\tPP:bwa\tVN:{}\tCL:umidedup\n",
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(out, [HEADER.as_bytes(), comment, pg.as_bytes(), first.as_bytes(), second].concat());
        assert_eq!(deduper.metrics().header_lines(), 5);
        assert_eq!(deduper.metrics().unique_records(), 2);
    }

    #[tokio::test]
    async fn non_utf8_key_column_names_line() {
        let mut input = HEADER.as_bytes().to_vec();
        input.extend_from_slice(b"r1:AACGCCAT\t0\tchr\xfc\t100\t36\t36M\n");
        let mut deduper = Deduper::new(known());
        let mut samio = SamIo::new(input.as_slice(), Vec::new());

        let err = dedup_stream(&mut samio, &mut deduper, None).await.unwrap_err();
        assert!(matches!(err, UmiDedupError::Malformed { line: 5, source: RecordError::NotUtf8(3) }));
        assert_eq!(err.to_string(), "Malformed record on line 5: column 3 is not valid UTF-8");
    }

    #[tokio::test]
    async fn program_record_after_header() {
        let first = record("r1", "AACGCCAT", 0, "chr1", 100, "36M");
        let input = format!("{HEADER}{first}");

        let (out, deduper) = dedup(&input, Some("umidedup -f in.sam -u umis.txt -g")).await;
        let pg = format!(
            "@PG\tID:umidedup\tPN:umidedup\tPP:bwa\tVN:{}\tCL:umidedup -f in.sam -u umis.txt -g\n",
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(out, format!("{HEADER}{pg}{first}"));
        // the added line is not an input header line
        assert_eq!(deduper.metrics().header_lines(), 4);
    }

    #[tokio::test]
    async fn program_record_header_only() {
        let (out, _) = dedup("@HD\tVN:1.6\tSO:coordinate", Some("umidedup")).await;
        assert_eq!(
            out,
            format!(
                "@HD\tVN:1.6\tSO:coordinate\n@PG\tID:umidedup\tPN:umidedup\tVN:{}\tCL:umidedup\n",
                env!("CARGO_PKG_VERSION")
            )
        );

        let (out, _) = dedup("", None).await;
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn malformed_record_names_line() {
        let input = format!(
            "{HEADER}{}r2:AACGCCAT\t0\tchr1\tone-hundred\t36\t36M\n",
            record("r1", "AACGCCAT", 0, "chr1", 100, "36M")
        );
        let mut deduper = Deduper::new(known());
        let mut samio = SamIo::new(input.as_bytes(), Vec::new());

        let err = dedup_stream(&mut samio, &mut deduper, None).await.unwrap_err();
        assert!(matches!(
            err,
            UmiDedupError::Malformed { line: 6, source: RecordError::InvalidPosition(_) }
        ));
        assert!(err.to_string().starts_with("Malformed record on line 6"));
    }

    #[test]
    fn config() {
        let config = Config::try_parse_from(["umidedup", "-f", "/data/in.sam", "-u", "umis.txt"]).unwrap();
        assert_eq!(config.validate().unwrap(), Path::new("umis.txt"));
        assert_eq!(config.output_path(), PathBuf::from("/data/in.sam_deduped"));
        assert!(!config.add_pg);

        let config =
            Config::try_parse_from(["umidedup", "-f", "in.sam", "-u", "umis.txt", "-o", "out.sam"]).unwrap();
        assert_eq!(config.output_path(), PathBuf::from("out.sam"));

        let config = Config::try_parse_from(["umidedup", "-f", "in.sam"]).unwrap();
        assert!(matches!(config.validate(), Err(UmiDedupError::MissingUmiList)));

        let config = Config::try_parse_from(["umidedup", "-f", "in.sam", "-u", "umis.txt", "-p"]).unwrap();
        assert!(matches!(config.validate(), Err(UmiDedupError::PairedEndUnsupported)));

        assert!(Config::try_parse_from(["umidedup", "-u", "umis.txt"]).is_err());
    }

    #[tokio::test]
    async fn configuration_errors_stop_before_reading() {
        let config = Config::try_parse_from(["umidedup", "-f", "/nonexistent/in.sam", "-p", "-u", "/nonexistent/umis.txt"]).unwrap();
        assert!(matches!(App::with_config(config).await, Err(UmiDedupError::PairedEndUnsupported)));

        let config = Config::try_parse_from(["umidedup", "-f", "/nonexistent/in.sam"]).unwrap();
        assert!(matches!(App::with_config(config).await, Err(UmiDedupError::MissingUmiList)));
    }

    #[tokio::test]
    async fn run_with_files() {
        let dir = tempfile::tempdir().unwrap();
        let sam = dir.path().join("sample.sam");
        let umis = dir.path().join("umis.txt");
        let metrics = dir.path().join("sample.metrics");

        let first = record("r1", "AACGCCAT", 0, "chr1", 100, "36M");
        let input = [
            HEADER.to_string(),
            first.clone(),
            record("r2", "AACGCCAT", 0, "chr1", 105, "5S31M"),
            record("r3", "TTTTTTTT", 0, "chr1", 100, "36M"),
        ]
        .concat();
        std::fs::write(&sam, &input).unwrap();
        std::fs::write(&umis, "AACGCCAT\nAAGGTACG\n").unwrap();

        let config = Config::try_parse_from([
            "umidedup",
            "-f",
            sam.to_str().unwrap(),
            "-u",
            umis.to_str().unwrap(),
            "-m",
            metrics.to_str().unwrap(),
        ])
        .unwrap();
        let mut app = App::with_config(config).await.unwrap();
        app.run().await.unwrap();

        let out = std::fs::read_to_string(dir.path().join("sample.sam_deduped")).unwrap();
        assert_eq!(out, format!("{HEADER}{first}"));

        let report = std::fs::read_to_string(&metrics).unwrap();
        assert_eq!(report.lines().nth(1).unwrap(), "4\t3\t1\t1\t1\t0\t0.500000");
    }

    #[tokio::test]
    async fn failed_run_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let sam = dir.path().join("sample.sam");
        let umis = dir.path().join("umis.txt");

        let input = format!(
            "{HEADER}{}r2:AACGCCAT\t0\tchr1\t-100\t36\t36M\n",
            record("r1", "AACGCCAT", 0, "chr1", 100, "36M")
        );
        std::fs::write(&sam, &input).unwrap();
        std::fs::write(&umis, "AACGCCAT\n").unwrap();

        let config = Config::try_parse_from([
            "umidedup",
            "-f",
            sam.to_str().unwrap(),
            "-u",
            umis.to_str().unwrap(),
        ])
        .unwrap();
        let mut app = App::with_config(config).await.unwrap();
        let output = dir.path().join("sample.sam_deduped");
        assert!(output.exists());

        let err = app.run().await.unwrap_err();
        assert!(matches!(
            err,
            UmiDedupError::Malformed { line: 6, source: RecordError::InvalidPosition(_) }
        ));
        assert!(!output.exists());
    }

    #[test]
    fn io_error_shows_cause() {
        let err = UmiDedupError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"));
        assert_eq!(err.to_string(), "I/O error: pipe closed");
    }

    #[tokio::test]
    async fn missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let umis = dir.path().join("umis.txt");
        std::fs::write(&umis, "AACGCCAT\n").unwrap();
        let sam = dir.path().join("missing.sam");

        let config = Config::try_parse_from([
            "umidedup",
            "-f",
            sam.to_str().unwrap(),
            "-u",
            umis.to_str().unwrap(),
        ])
        .unwrap();
        match App::with_config(config).await {
            Err(UmiDedupError::Open { path, .. }) => assert_eq!(path, sam),
            _ => panic!("expected an open error"),
        }
    }
}
