use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// SamIo is created from a `Read` and a `Write` over SAM text. Lines are handed out as raw bytes
/// exactly as they were read, terminator included, so they can be copied to the output unchanged
/// whatever their encoding.
pub struct SamIo<R, W>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    in_sam: BufReader<R>,
    out_sam: BufWriter<W>,
    line_number: usize,
}

impl<R, W> SamIo<R, W>
where
    R: AsyncRead + std::marker::Unpin,
    W: AsyncWrite + std::marker::Unpin,
{
    pub fn new(read: R, write: W) -> SamIo<R, W> {
        SamIo {
            in_sam: BufReader::new(read),
            out_sam: BufWriter::new(write),
            line_number: 0,
        }
    }

    /// Replace the contents of `line` with the next input line. Returns false at end of input.
    pub async fn read_line(&mut self, line: &mut Vec<u8>) -> io::Result<bool> {
        line.clear();
        match self.in_sam.read_until(b'\n', line).await? {
            0 => Ok(false),
            _n => {
                self.line_number += 1;
                Ok(true)
            }
        }
    }

    /// 1-based number of the line last returned by `read_line`
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    pub async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.out_sam.write_all(line).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.out_sam.shutdown().await
    }
}
