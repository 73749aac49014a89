//! Images, their acquisition metadata, and the sessions they aggregate into.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// FITS header keywords the pipeline reads.
pub mod keys {
    pub const FILTER: &str = "FILTER";
    pub const IMAGETYP: &str = "IMAGETYP";
    pub const OBJECT: &str = "OBJECT";
    pub const TELESCOP: &str = "TELESCOP";
    pub const INSTRUME: &str = "INSTRUME";
    pub const DATE_OBS: &str = "DATE-OBS";
    pub const EXPTIME: &str = "EXPTIME";
    pub const GAIN: &str = "GAIN";
    pub const CCD_TEMP: &str = "CCD-TEMP";
    pub const NAXIS1: &str = "NAXIS1";
    pub const NAXIS2: &str = "NAXIS2";
    pub const BAYERPAT: &str = "BAYERPAT";
}

/// Images within this distance of a session's window join it.
pub fn session_window() -> TimeDelta {
    TimeDelta::hours(8)
}

static IMAGETYP_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("light", "light"),
        ("lightframe", "light"),
        ("object", "light"),
        ("science", "light"),
        ("dark", "dark"),
        ("darkframe", "dark"),
        ("masterdark", "dark"),
        ("flat", "flat"),
        ("flatframe", "flat"),
        ("flatfield", "flat"),
        ("masterflat", "flat"),
        ("bias", "bias"),
        ("biasframe", "bias"),
        ("offset", "bias"),
        ("zero", "bias"),
        ("masterbias", "bias"),
    ])
});

/// Lower-cased alphanumerics only: "Ha-OIII " and "haoiii" compare equal.
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Maps the many capture-software spellings of an image type onto
/// `light`, `dark`, `flat` and `bias`.
pub fn normalize_imagetyp(raw: &str) -> String {
    let token = normalize_token(raw);
    IMAGETYP_ALIASES
        .get(token.as_str())
        .map(|s| s.to_string())
        .unwrap_or(token)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(default)]
    pub id: Option<u64>,
    pub repo_url: String,
    /// Relative to the owning repo's base directory.
    pub path: PathBuf,
    pub metadata: BTreeMap<String, String>,
}

impl ImageRecord {
    pub fn new(
        repo_url: impl Into<String>,
        path: impl Into<PathBuf>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: None,
            repo_url: repo_url.into(),
            path: path.into(),
            metadata,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.meta(key).and_then(|s| s.parse::<f64>().ok())
    }

    pub fn imagetyp(&self) -> Option<String> {
        self.meta(keys::IMAGETYP).map(normalize_imagetyp)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.meta(keys::DATE_OBS).and_then(parse_timestamp)
    }

    pub fn is_color(&self) -> bool {
        self.meta(keys::BAYERPAT).is_some()
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::from_metadata(&self.metadata)
    }
}

/// Identity shared by every image of a session. Values are normalised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub filter: String,
    pub imagetyp: String,
    pub object: String,
    pub telescop: String,
}

impl SessionKey {
    pub fn from_metadata(metadata: &BTreeMap<String, String>) -> Self {
        let field = |key: &str| metadata.get(key).map(|s| s.trim()).unwrap_or("");
        Self {
            filter: normalize_token(field(keys::FILTER)),
            imagetyp: normalize_imagetyp(field(keys::IMAGETYP)),
            object: field(keys::OBJECT).to_string(),
            telescop: field(keys::TELESCOP).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repo_url: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub id: Option<u64>,
    pub key: SessionKey,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub num_images: u32,
    pub exptime_total: f64,
    pub reference: ImageRef,
    /// Metadata of the reference image, used for scoring and templating.
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    pub fn from_image(image: &ImageRecord) -> Result<Self> {
        let at = image.timestamp().ok_or_else(|| {
            anyhow!(
                "Image {} has no usable {} header",
                image.path.display(),
                keys::DATE_OBS
            )
        })?;
        Ok(Self {
            id: None,
            key: image.session_key(),
            start: at,
            end: at,
            num_images: 1,
            exptime_total: image.number(keys::EXPTIME).unwrap_or(0.0),
            reference: ImageRef {
                repo_url: image.repo_url.clone(),
                path: image.path.clone(),
            },
            metadata: image.metadata.clone(),
        })
    }

    /// Whether an image taken at `at` belongs in this session's window.
    pub fn accepts(&self, at: DateTime<Utc>) -> bool {
        at >= self.start - session_window() && at <= self.end + session_window()
    }

    /// Widens the window to include `image`. The window never shrinks.
    pub fn absorb(&mut self, image: &ImageRecord) {
        if let Some(at) = image.timestamp() {
            if at < self.start {
                self.start = at;
            }
            if at > self.end {
                self.end = at;
            }
        }
        self.num_images += 1;
        self.exptime_total += image.number(keys::EXPTIME).unwrap_or(0.0);
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn imagetyp(&self) -> &str {
        &self.key.imagetyp
    }

    pub fn target(&self) -> &str {
        &self.key.object
    }

    pub fn is_light(&self) -> bool {
        self.key.imagetyp == "light"
    }

    pub fn is_color(&self) -> bool {
        self.meta(keys::BAYERPAT).is_some()
    }

    pub fn instrument(&self) -> Option<String> {
        self.meta(keys::INSTRUME).map(normalize_token)
    }

    /// Observing night as `YYYY-MM-DD`.
    pub fn date(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }
}
