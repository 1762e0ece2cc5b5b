//! FASTQ file helpers: gzip-aware record counting, decompression and
//! output base names.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::command::partial_path;
use crate::error::PipelineError;

#[must_use]
pub fn is_gzipped(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("gz")
}

/// Open a FASTQ file, decompressing `.gz` transparently.
fn open_reader(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_gzipped(path) {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Number of FASTQ records (four lines each) in `path`.
///
/// # Errors
///
/// Returns [`PipelineError::Io`] if the file cannot be read.
pub fn count_records(path: &Path) -> Result<u64, PipelineError> {
    let reader = open_reader(path).map_err(|e| PipelineError::io(path, e))?;
    let mut lines = 0u64;
    for line in reader.lines() {
        let line = line.map_err(|e| PipelineError::io(path, e))?;
        if !line.is_empty() {
            lines += 1;
        }
    }
    Ok(lines / 4)
}

/// Decompress `src` into `dest_dir`, returning the new path (`src` file name
/// without `.gz`). The copy is moved into place once complete.
///
/// # Errors
///
/// Returns [`PipelineError::Io`] on read or write failure.
pub fn decompress(src: &Path, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
    let name = src
        .file_stem()
        .ok_or_else(|| PipelineError::config(format!("not a file: {}", src.display())))?;
    let dest = dest_dir.join(name);
    fs::create_dir_all(dest_dir).map_err(|e| PipelineError::io(dest_dir, e))?;

    let partial = partial_path(&dest);
    let mut reader = open_reader(src).map_err(|e| PipelineError::io(src, e))?;
    let mut writer = File::create(&partial).map_err(|e| PipelineError::io(&partial, e))?;
    io::copy(&mut reader, &mut writer).map_err(|e| PipelineError::io(src, e))?;
    writer.sync_all().map_err(|e| PipelineError::io(&partial, e))?;
    fs::rename(&partial, &dest).map_err(|e| PipelineError::io(&dest, e))?;
    Ok(dest)
}

/// Base name shared by a readset's outputs: the file name without `.gz`,
/// then without `.fastq`/`.fq`, then without a trailing `_R1`/`_R2`.
#[must_use]
pub fn minimal_basename(file_name: &str) -> String {
    let mut name = file_name.strip_suffix(".gz").unwrap_or(file_name);
    for ext in [".fastq", ".fq"] {
        if let Some(stripped) = name.strip_suffix(ext) {
            name = stripped;
            break;
        }
    }
    for suffix in ["_R1", "_R2"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped;
            break;
        }
    }
    name.to_string()
}

/// File name of `path` as UTF-8, lossily.
#[must_use]
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    pub(crate) fn fastq_text(reads: usize) -> String {
        (0..reads)
            .map(|i| format!("@read{i}\nACGTACGTAC\n+\nIIIIIIIIII\n"))
            .collect()
    }

    #[test]
    fn test_minimal_basename() {
        assert_eq!(minimal_basename("s1_R1.fastq.gz"), "s1");
        assert_eq!(minimal_basename("s1_R2.fq"), "s1");
        assert_eq!(minimal_basename("sample.fastq"), "sample");
        assert_eq!(minimal_basename("sample_R1_001.fastq.gz"), "sample_R1_001");
        assert_eq!(minimal_basename("reads"), "reads");
    }

    #[test]
    fn test_count_plain_and_gzipped() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.fastq");
        fs::write(&plain, fastq_text(25)).unwrap();
        assert_eq!(count_records(&plain).unwrap(), 25);

        let gz = dir.path().join("b.fastq.gz");
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(fastq_text(40).as_bytes()).unwrap();
        enc.finish().unwrap();
        assert_eq!(count_records(&gz).unwrap(), 40);
    }

    #[test]
    fn test_count_missing_file_is_io_error() {
        let err = count_records(Path::new("/nonexistent/x.fastq")).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }

    #[test]
    fn test_decompress_into_dir() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join("s1_R1.fastq.gz");
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(fastq_text(3).as_bytes()).unwrap();
        enc.finish().unwrap();

        let out = decompress(&gz, &dir.path().join("work")).unwrap();
        assert_eq!(out, dir.path().join("work/s1_R1.fastq"));
        assert_eq!(fs::read_to_string(&out).unwrap(), fastq_text(3));
    }
}
