//! FITS primary header access through `fitsio`. Only header keywords are
//! read or written; pixel data is never touched.

use std::collections::BTreeMap;
use std::ffi::{CStr, c_char, c_int};
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow, bail};
use fitsio::FitsFile;

pub const EXTENSIONS: &[&str] = &["fit", "fits", "fts"];

/// Buffer size for one keyword name, value or comment (cfitsio `FLEN_CARD`).
const FLEN_CARD: usize = 81;

/// Keywords describing the data layout. The writer derives these itself.
const STRUCTURAL: &[&str] = &["SIMPLE", "BITPIX", "NAXIS", "EXTEND", "PCOUNT", "GCOUNT", "END"];

/// Commentary cards carry no value.
const COMMENTARY: &[&str] = &["", "COMMENT", "HISTORY", "CONTINUE"];

pub fn is_fits_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_structural(keyword: &str) -> bool {
    STRUCTURAL.contains(&keyword)
        || keyword
            .strip_prefix("NAXIS")
            .is_some_and(|axis| axis.chars().all(|c| c.is_ascii_digit()))
}

/// Every valued keyword of the primary HDU. String values come back
/// without quotes; other values as written.
pub fn read_header(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut fptr = FitsFile::open(path)
        .map_err(|e| anyhow!("Failed to open FITS file {}: {}", path.display(), e))?;
    let hdu = fptr
        .primary_hdu()
        .map_err(|e| anyhow!("No primary HDU in {}: {}", path.display(), e))?;

    let mut cards = BTreeMap::new();
    for (keyword, raw) in primary_cards(&mut fptr, path)? {
        if COMMENTARY.contains(&keyword.as_str()) || raw.is_empty() {
            continue;
        }
        let value = hdu
            .read_key::<String>(&mut fptr, &keyword)
            .map(|value| value.trim_end().to_string())
            .unwrap_or(raw);
        cards.insert(keyword, value);
    }
    Ok(cards)
}

/// Keyword names and raw value strings of the current (primary) HDU.
fn primary_cards(fptr: &mut FitsFile, path: &Path) -> Result<Vec<(String, String)>> {
    let mut status: c_int = 0;
    let mut count: c_int = 0;
    let mut more: c_int = 0;
    let mut cards = Vec::new();
    // SAFETY: the handle belongs to an open file and every buffer holds a
    // full card, the most cfitsio writes into any of them.
    unsafe {
        let raw = fptr.as_raw();
        fitsio::sys::ffghsp(raw, &mut count, &mut more, &mut status);
        if status != 0 {
            bail!("Failed to size the header of {} (status {status})", path.display());
        }
        for index in 1..=count {
            let mut keyword = [0 as c_char; FLEN_CARD];
            let mut value = [0 as c_char; FLEN_CARD];
            let mut comment = [0 as c_char; FLEN_CARD];
            fitsio::sys::ffgkyn(
                raw,
                index,
                keyword.as_mut_ptr(),
                value.as_mut_ptr(),
                comment.as_mut_ptr(),
                &mut status,
            );
            if status != 0 {
                bail!("Failed to read card {index} of {} (status {status})", path.display());
            }
            cards.push((
                CStr::from_ptr(keyword.as_ptr()).to_string_lossy().trim().to_string(),
                CStr::from_ptr(value.as_ptr()).to_string_lossy().trim().to_string(),
            ));
        }
    }
    Ok(cards)
}

/// Writes a header-only FITS file, replacing any existing file. Numeric
/// values are written as numbers, everything else as strings. Used for
/// fixtures and by the `builtin` tool.
pub fn write_header(path: &Path, cards: &BTreeMap<String, String>) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .map_err(|e| anyhow!("Failed to replace {}: {}", path.display(), e))?;
    }
    let mut fptr = FitsFile::create(path)
        .open()
        .map_err(|e| anyhow!("Failed to create FITS file {}: {}", path.display(), e))?;
    let hdu = fptr
        .primary_hdu()
        .map_err(|e| anyhow!("No primary HDU in {}: {}", path.display(), e))?;

    for (keyword, value) in cards {
        if is_structural(keyword) || COMMENTARY.contains(&keyword.as_str()) {
            continue;
        }
        let written = if let Ok(number) = value.parse::<i64>() {
            hdu.write_key(&mut fptr, keyword, number)
        } else if let Ok(number) = value.parse::<f64>()
            && number.is_finite()
        {
            hdu.write_key(&mut fptr, keyword, number)
        } else {
            hdu.write_key(&mut fptr, keyword, value.as_str())
        };
        written.map_err(|e| {
            anyhow!("Failed to write {keyword} to {}: {}", path.display(), e)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_cards_survive_a_write() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("frame.fits");
        let cards = BTreeMap::from([
            ("IMAGETYP".to_string(), "Light Frame".to_string()),
            ("OBJECT".to_string(), "O'Brien nebula".to_string()),
            ("GAIN".to_string(), "100".to_string()),
            ("CCD-TEMP".to_string(), "-10.5".to_string()),
        ]);
        write_header(&path, &cards).unwrap();
        let read = read_header(&path).unwrap();
        assert_eq!(read.get("IMAGETYP").map(String::as_str), Some("Light Frame"));
        assert_eq!(read.get("OBJECT").map(String::as_str), Some("O'Brien nebula"));
        assert_eq!(read.get("GAIN").map(String::as_str), Some("100"));
        let temp_c: f64 = read["CCD-TEMP"].parse().unwrap();
        assert_eq!(temp_c, -10.5);
        assert!(read.contains_key("SIMPLE"));
        assert!(!read.contains_key("COMMENT"));
    }

    #[test]
    fn rewriting_replaces_the_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("master.fits");
        let first = BTreeMap::from([("NCOMBINE".to_string(), "2".to_string())]);
        write_header(&path, &first).unwrap();
        let second = BTreeMap::from([
            ("NCOMBINE".to_string(), "5".to_string()),
            ("NAXIS1".to_string(), "6248".to_string()),
        ]);
        write_header(&path, &second).unwrap();
        let read = read_header(&path).unwrap();
        assert_eq!(read.get("NCOMBINE").map(String::as_str), Some("5"));
        assert!(!read.contains_key("NAXIS1"));
    }

    #[test]
    fn rejects_non_fits_files() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("not.fits");
        std::fs::write(&path, vec![b'x'; 2880]).unwrap();
        assert!(read_header(&path).is_err());
        assert!(is_fits_path(&path));
    }
}
