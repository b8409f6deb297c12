//! Level payload parsing and content fingerprinting.
//!
//! A payload is line oriented:
//!
//! ```text
//! LevelEditor2,<author>,<uid>          header
//! <free-form>                          ignored
//! <validation>,<gold>,<silver>,<bronze>[,<skybox>,<ground>]
//! <block lines...>                     body
//! ```
//!
//! The fingerprint covers the skybox/ground pair and the body only, so
//! republishing with new checkpoint times or a new header keeps the same
//! content identity.

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::LevelMetrics;

pub const PLACEHOLDER_AUTHOR: &str = "Unknown Author";
pub const DEFAULT_SKYBOX: &str = "0";
pub const DEFAULT_GROUND: &str = "-1";

const HEADER_LINE: usize = 0;
const METRICS_LINE: usize = 2;
const BODY_START: usize = 3;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("malformed header: expected at least 3 comma separated fields, found {fields}")]
    MalformedHeader { fields: usize },
    #[error("header carries an empty content uid")]
    MissingUid,
}

/// One parsed payload file.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelFile {
    pub uid: String,
    pub author: String,
    pub metrics: LevelMetrics,
    pub skybox: String,
    pub ground: String,
    pub fingerprint: String,
}

pub fn parse_level(text: &str) -> Result<LevelFile, PayloadError> {
    if text.trim().is_empty() {
        return Err(PayloadError::EmptyPayload);
    }

    let lines: Vec<&str> = text.lines().collect();
    let header: Vec<&str> = lines[HEADER_LINE].split(',').collect();
    if header.len() < 3 {
        return Err(PayloadError::MalformedHeader {
            fields: header.len(),
        });
    }

    let author = match header[1].trim() {
        "" => PLACEHOLDER_AUTHOR.to_string(),
        name => name.to_string(),
    };
    let uid = header[2].trim();
    if uid.is_empty() {
        return Err(PayloadError::MissingUid);
    }

    let metrics_line = lines.get(METRICS_LINE).copied().unwrap_or_default();
    let metrics = parse_metrics(metrics_line);

    let fields: Vec<&str> = metrics_line.split(',').collect();
    let (skybox, ground) = if fields.len() == 6 {
        (fields[4], fields[5])
    } else {
        (DEFAULT_SKYBOX, DEFAULT_GROUND)
    };

    let body_lines = lines.get(BODY_START..).unwrap_or_default();
    let mut content = format!("{skybox},{ground}");
    for line in body_lines {
        content.push('\n');
        content.push_str(line);
    }

    Ok(LevelFile {
        uid: uid.to_string(),
        author,
        metrics,
        skybox: skybox.to_string(),
        ground: ground.to_string(),
        fingerprint: fingerprint(&content),
    })
}

/// Parse the checkpoint line. Anything short, unparsable or non-finite
/// yields zeroed, unvalidated metrics.
pub fn parse_metrics(line: &str) -> LevelMetrics {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 4 {
        return LevelMetrics::unvalidated();
    }

    let mut values = [0f64; 4];
    for (slot, raw) in values.iter_mut().zip(&fields[..4]) {
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => *slot = v,
            _ => return LevelMetrics::unvalidated(),
        }
    }

    let [validation, gold, silver, bronze] = values;
    LevelMetrics {
        validation,
        gold,
        silver,
        bronze,
        valid: true,
    }
}

/// Uppercase hex SHA-1 of the given content.
pub fn fingerprint(content: &str) -> String {
    hex::encode_upper(Sha1::digest(content.as_bytes()))
}
