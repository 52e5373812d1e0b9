//! Dictionary metadata and packed marker codes.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::{fs, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum DictionaryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("marker size {0} needs more than 64 bits")]
    TooManyBits(usize),
    #[error("dictionary `{0}` has no codes")]
    Empty(String),
    #[error("unknown built-in dictionary `{0}`")]
    Unknown(String),
}

/// A fixed square-marker dictionary.
///
/// Codes hold the inner `marker_size × marker_size` bits in row-major order
/// with **black = 1**. The one-cell black border is not part of the code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dictionary {
    pub name: Cow<'static, str>,
    pub marker_size: usize,
    pub max_correction_bits: u8,
    pub codes: Cow<'static, [u64]>,
}

impl Dictionary {
    pub const fn from_static(
        name: &'static str,
        marker_size: usize,
        max_correction_bits: u8,
        codes: &'static [u64],
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            marker_size,
            max_correction_bits,
            codes: Cow::Borrowed(codes),
        }
    }

    /// Resolve `name` against the embedded dictionaries.
    pub fn builtin(name: &str) -> Result<Self, DictionaryError> {
        crate::builtins::builtin_dictionary(name)
            .ok_or_else(|| DictionaryError::Unknown(name.to_string()))
    }

    /// Load a dictionary from a JSON file with the same layout as the
    /// embedded `data/*_CODES.json` files.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, DictionaryError> {
        let raw = fs::read_to_string(path)?;
        let dict: Self = serde_json::from_str(&raw)?;
        dict.validate()?;
        Ok(dict)
    }

    pub fn validate(&self) -> Result<(), DictionaryError> {
        if self.bit_count() > 64 {
            return Err(DictionaryError::TooManyBits(self.marker_size));
        }
        if self.codes.is_empty() {
            return Err(DictionaryError::Empty(self.name.to_string()));
        }
        Ok(())
    }

    /// Total number of inner bits per marker.
    #[inline]
    pub fn bit_count(&self) -> usize {
        self.marker_size * self.marker_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_and_unknown_name() {
        let dict = Dictionary::builtin("DICT_APRILTAG_16h5").expect("embedded");
        assert_eq!(dict.marker_size, 4);
        assert_eq!(dict.len(), 30);
        assert!(matches!(
            Dictionary::builtin("DICT_NOPE"),
            Err(DictionaryError::Unknown(_))
        ));
    }

    #[test]
    fn loads_custom_dictionary_from_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom.json");
        fs::write(
            &path,
            r#"{"name":"CUSTOM","marker_size":3,"max_correction_bits":0,"codes":[5,17]}"#,
        )
        .expect("write");
        let dict = Dictionary::load_json(&path).expect("load");
        assert_eq!(dict.name, "CUSTOM");
        assert_eq!(dict.codes.as_ref(), &[5, 17]);

        fs::write(
            &path,
            r#"{"name":"BIG","marker_size":9,"max_correction_bits":0,"codes":[1]}"#,
        )
        .expect("write");
        assert!(matches!(
            Dictionary::load_json(&path),
            Err(DictionaryError::TooManyBits(9))
        ));
    }
}
