//! Image name parsing.

use cairn_core::{Error, Result};

/// A parsed `pool/image@snap` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Pool the image lives in.
    pub pool: String,
    /// Image name.
    pub image: String,
    /// Snapshot name, if the spec addresses one.
    pub snap: Option<String>,
}

impl ImageSpec {
    /// Parses a `pool/image@snap` spec, left to right on `/` then `@`.
    ///
    /// The pool and snapshot parts are optional; `default_pool` fills in a
    /// missing pool. Empty components are rejected.
    pub fn parse(spec: &str, default_pool: &str) -> Result<Self> {
        let (pool, rest) = match spec.split_once('/') {
            Some((pool, rest)) => (pool, rest),
            None => (default_pool, spec),
        };
        let (image, snap) = match rest.split_once('@') {
            Some((image, snap)) => (image, Some(snap)),
            None => (rest, None),
        };

        if pool.is_empty() {
            return Err(Error::invalid(format!("empty pool name in spec: {spec}")));
        }
        if image.is_empty() {
            return Err(Error::invalid(format!("empty image name in spec: {spec}")));
        }
        if snap.is_some_and(str::is_empty) {
            return Err(Error::invalid(format!("empty snapshot name in spec: {spec}")));
        }
        if image.contains('@') || image.contains('/') {
            return Err(Error::invalid(format!("malformed image spec: {spec}")));
        }

        Ok(Self {
            pool: pool.to_string(),
            image: image.to_string(),
            snap: snap.map(str::to_string),
        })
    }

    /// The spec with a snapshot attached, for error messages and output.
    #[must_use]
    pub fn with_snap(&self, snap: &str) -> Self {
        Self { pool: self.pool.clone(), image: self.image.clone(), snap: Some(snap.to_string()) }
    }
}

impl std::fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pool, self.image)?;
        if let Some(snap) = &self.snap {
            write!(f, "@{snap}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_spec() {
        let spec = ImageSpec::parse("vols/db01@backup", "images").unwrap();
        assert_eq!(spec.pool, "vols");
        assert_eq!(spec.image, "db01");
        assert_eq!(spec.snap.as_deref(), Some("backup"));
    }

    #[test]
    fn test_parse_defaults_pool() {
        let spec = ImageSpec::parse("db01", "images").unwrap();
        assert_eq!(spec.pool, "images");
        assert_eq!(spec.image, "db01");
        assert!(spec.snap.is_none());
    }

    #[test]
    fn test_parse_image_with_snap_no_pool() {
        let spec = ImageSpec::parse("db01@backup", "images").unwrap();
        assert_eq!(spec.pool, "images");
        assert_eq!(spec.snap.as_deref(), Some("backup"));
    }

    #[test]
    fn test_parse_rejects_empty_components() {
        assert!(ImageSpec::parse("/img", "p").is_err());
        assert!(ImageSpec::parse("pool/", "p").is_err());
        assert!(ImageSpec::parse("pool/img@", "p").is_err());
        assert!(ImageSpec::parse("", "p").is_err());
    }

    #[test]
    fn test_parse_splits_left_to_right() {
        // Only the first '/' separates the pool; a second one is malformed.
        assert!(ImageSpec::parse("a/b/c", "p").is_err());
        // A snap name may itself contain '@'? No: split is on the first one,
        // and the remainder belongs to the snap.
        let spec = ImageSpec::parse("pool/img@snap@x", "p").unwrap();
        assert_eq!(spec.snap.as_deref(), Some("snap@x"));
    }

    #[test]
    fn test_display_roundtrip() {
        let spec = ImageSpec::parse("vols/db01@backup", "images").unwrap();
        assert_eq!(spec.to_string(), "vols/db01@backup");
    }
}
