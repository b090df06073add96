use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Bounded-memory reader over an append-only text log. The log may be
/// arbitrarily large, so lines are surfaced in blocks of roughly
/// `block_size` bytes instead of loading the whole file.
pub struct LogBlockReader {
    reader: BufReader<File>,
    block_size: usize,
}

impl LogBlockReader {
    /// Returns `Ok(None)` when the file does not exist: a missing log means
    /// "no records", never a fatal error.
    pub fn open(path: &Path) -> io::Result<Option<LogBlockReader>> {
        Self::with_block_size(path, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(path: &Path, block_size: usize) -> io::Result<Option<LogBlockReader>> {
        match File::open(path) {
            Ok(file) => Ok(Some(LogBlockReader {
                reader: BufReader::new(file),
                block_size: block_size.max(1),
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Next block of complete lines, trailing newlines stripped. `None` at
    /// end of file.
    pub fn next_block(&mut self) -> io::Result<Option<Vec<String>>> {
        let mut lines = Vec::new();
        let mut consumed = 0usize;
        while consumed < self.block_size {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            consumed += n;
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        if lines.is_empty() {
            Ok(None)
        } else {
            Ok(Some(lines))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LogBlockReader::open(&dir.path().join("absent.log"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn all_lines_come_back_in_bounded_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut file = File::create(&path).unwrap();
        for i in 0..1000 {
            writeln!(file, "line-{i}").unwrap();
        }
        drop(file);

        let mut reader = LogBlockReader::with_block_size(&path, 128).unwrap().unwrap();
        let mut seen = Vec::new();
        let mut blocks = 0;
        while let Some(block) = reader.next_block().unwrap() {
            assert!(!block.is_empty());
            blocks += 1;
            seen.extend(block);
        }
        assert!(blocks > 1, "expected more than one block");
        assert_eq!(seen.len(), 1000);
        assert_eq!(seen[0], "line-0");
        assert_eq!(seen[999], "line-999");
    }
}
