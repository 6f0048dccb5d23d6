//! Segment file naming.
//!
//! A segment opened at 2024-03-06 12:30:15 by camera label `mice_cam01` is written as
//! `mice_cam01_20240306_12-30-15.mp4` and archived under `{save_root}/mice_cam01_20240306/`.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};

const STAMP_FORMAT: &str = "%Y%m%d_%H-%M-%S";
const DAY_FORMAT: &str = "%Y%m%d";
const STAMP_LEN: usize = "YYYYMMDD_HH-MM-SS".len();

#[inline]
pub fn segment_file_name(label: &str, opened_at: NaiveDateTime, extension: &str) -> String {
    format!("{label}_{}{extension}", opened_at.format(STAMP_FORMAT))
}

/// Like [`segment_file_name`], adding `_1`, `_2`, … before the extension while `taken`
/// reports the candidate as already in use.
#[inline]
pub fn unique_segment_name(
    label: &str,
    opened_at: NaiveDateTime,
    extension: &str,
    taken: impl Fn(&str) -> bool,
) -> String {
    let base = format!("{label}_{}", opened_at.format(STAMP_FORMAT));
    let mut name = format!("{base}{extension}");
    let mut suffix = 0u32;
    while taken(&name) {
        suffix += 1;
        name = format!("{base}_{suffix}{extension}");
    }
    name
}

#[inline]
pub fn day_directory(save_root: &Path, label: &str, day: NaiveDate) -> PathBuf {
    save_root.join(format!("{label}_{}", day.format(DAY_FORMAT)))
}

/// Recovers the label and open time from a segment file name.
#[inline]
pub fn parse_segment_name(file_name: &str, extension: &str) -> Option<(String, NaiveDateTime)> {
    let stem = file_name.strip_suffix(extension)?;
    split_stamp(stem).or_else(|| {
        let (head, suffix) = stem.rsplit_once('_')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        split_stamp(head)
    })
}

fn split_stamp(stem: &str) -> Option<(String, NaiveDateTime)> {
    let split = stem.len().checked_sub(STAMP_LEN + 1)?;
    let label = stem.get(..split)?;
    let stamp = stem.get(split..)?.strip_prefix('_')?;
    let opened_at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    (!label.is_empty()).then(|| (label.to_owned(), opened_at))
}
