//! Calibration file persistence.
//!
//! XML layout:
//!
//! ```xml
//! <CalibrationData>
//!   <CameraMatrix>
//!     <Row><Cell>fx</Cell><Cell>0</Cell><Cell>cx</Cell></Row>
//!     ...
//!   </CameraMatrix>
//!   <DistCoeffs><Cell>k1</Cell>...<Cell>k3</Cell></DistCoeffs>
//! </CalibrationData>
//! ```
//!
//! JSON carries the same two sections: `{"CameraMatrix": [[..]; 3], "DistCoeffs": [..]}`.
//! Files ending in `.json` use JSON, everything else XML.

use crate::model::{Distortion, Intrinsics};
use log::{debug, info};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed calibration data in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("failed to encode calibration data: {0}")]
    Encode(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationFormat {
    Xml,
    Json,
}

impl CalibrationFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Xml,
        }
    }
}

/// `<Cell>` children of one XML element.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct XmlCells {
    #[serde(rename = "Cell", default)]
    pub cells: Vec<String>,
}

impl XmlCells {
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            cells: values.iter().map(f64::to_string).collect(),
        }
    }

    pub fn parse(&self) -> Result<Vec<f64>, String> {
        self.cells
            .iter()
            .map(|c| {
                let v: f64 = c
                    .trim()
                    .parse()
                    .map_err(|_| format!("cell {c:?} is not a number"))?;
                if v.is_finite() {
                    Ok(v)
                } else {
                    Err(format!("cell {c:?} is not finite"))
                }
            })
            .collect()
    }
}

/// `<CameraMatrix>` as three `<Row>` elements.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct XmlCameraMatrix {
    #[serde(rename = "Row", default)]
    pub rows: Vec<XmlCells>,
}

impl XmlCameraMatrix {
    pub fn from_matrix(m: &Matrix3<f64>) -> Self {
        Self {
            rows: (0..3)
                .map(|r| XmlCells::from_values(&[m[(r, 0)], m[(r, 1)], m[(r, 2)]]))
                .collect(),
        }
    }

    pub fn to_matrix(&self) -> Result<Matrix3<f64>, String> {
        if self.rows.len() != 3 {
            return Err(format!("camera matrix has {} rows, expected 3", self.rows.len()));
        }
        let mut m = Matrix3::zeros();
        for (r, row) in self.rows.iter().enumerate() {
            let values = row.parse()?;
            if values.len() != 3 {
                return Err(format!(
                    "camera matrix row {r} has {} cells, expected 3",
                    values.len()
                ));
            }
            for (c, v) in values.into_iter().enumerate() {
                m[(r, c)] = v;
            }
        }
        Ok(m)
    }
}

pub fn distortion_from_values(values: &[f64]) -> Result<Distortion, String> {
    Distortion::from_slice(values)
        .ok_or_else(|| format!("{} distortion coefficients, expected 4 or 5", values.len()))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "CalibrationData")]
struct CalibrationXml {
    #[serde(rename = "CameraMatrix")]
    camera_matrix: XmlCameraMatrix,
    #[serde(rename = "DistCoeffs")]
    dist_coeffs: XmlCells,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationJson {
    #[serde(rename = "CameraMatrix")]
    camera_matrix: [[f64; 3]; 3],
    #[serde(rename = "DistCoeffs")]
    dist_coeffs: Vec<f64>,
}

/// Serialize `intrinsics` into the text of a calibration file.
pub fn encode(intrinsics: &Intrinsics, format: CalibrationFormat) -> Result<String, StoreError> {
    let m = &intrinsics.camera_matrix;
    let coeffs = intrinsics.distortion.to_array();
    match format {
        CalibrationFormat::Xml => {
            let doc = CalibrationXml {
                camera_matrix: XmlCameraMatrix::from_matrix(m),
                dist_coeffs: XmlCells::from_values(&coeffs),
            };
            let body =
                quick_xml::se::to_string(&doc).map_err(|e| StoreError::Encode(e.to_string()))?;
            Ok(format!("{XML_DECLARATION}{body}"))
        }
        CalibrationFormat::Json => {
            let doc = CalibrationJson {
                camera_matrix: [0, 1, 2].map(|r| [m[(r, 0)], m[(r, 1)], m[(r, 2)]]),
                dist_coeffs: coeffs.to_vec(),
            };
            serde_json::to_string_pretty(&doc).map_err(|e| StoreError::Encode(e.to_string()))
        }
    }
}

/// Parse the text of a calibration file. The error is a human-readable reason.
pub fn decode(text: &str, format: CalibrationFormat) -> Result<Intrinsics, String> {
    let (camera_matrix, coeffs) = match format {
        CalibrationFormat::Xml => {
            let doc: CalibrationXml = quick_xml::de::from_str(text).map_err(|e| e.to_string())?;
            (doc.camera_matrix.to_matrix()?, doc.dist_coeffs.parse()?)
        }
        CalibrationFormat::Json => {
            let doc: CalibrationJson = serde_json::from_str(text).map_err(|e| e.to_string())?;
            let m = Matrix3::from_fn(|r, c| doc.camera_matrix[r][c]);
            if !m.iter().chain(&doc.dist_coeffs).all(|v| v.is_finite()) {
                return Err("non-finite value".to_string());
            }
            (m, doc.dist_coeffs)
        }
    };
    Ok(Intrinsics {
        camera_matrix,
        distortion: distortion_from_values(&coeffs)?,
    })
}

/// Write `intrinsics` to `path`, replacing any existing file.
pub fn save(intrinsics: &Intrinsics, path: impl AsRef<Path>) -> Result<(), StoreError> {
    let path = path.as_ref();
    check_path(path)?;
    let text = encode(intrinsics, CalibrationFormat::from_path(path))?;
    fs::write(path, text).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("saved calibration to {}", path.display());
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> Result<Intrinsics, StoreError> {
    let path = path.as_ref();
    check_path(path)?;
    let text = fs::read_to_string(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => StoreError::Malformed {
            path: path.to_path_buf(),
            reason: "file not found".into(),
        },
        _ => StoreError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    let intrinsics =
        decode(&text, CalibrationFormat::from_path(path)).map_err(|reason| StoreError::Malformed {
            path: path.to_path_buf(),
            reason,
        })?;
    debug!("loaded calibration from {}", path.display());
    Ok(intrinsics)
}

fn check_path(path: &Path) -> Result<(), StoreError> {
    let reason = if path.as_os_str().is_empty() {
        "empty path"
    } else if path.is_dir() {
        "path is a directory"
    } else {
        return Ok(());
    };
    Err(StoreError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Intrinsics {
        Intrinsics::new(
            812.345678901,
            809.1,
            319.75,
            241.0000001,
            Distortion {
                k1: -0.123456789012345,
                k2: 0.0456,
                p1: 1.5e-4,
                p2: -2.25e-5,
                k3: 0.0,
            },
        )
    }

    #[test]
    fn xml_text_has_expected_layout() {
        let text = encode(&sample(), CalibrationFormat::Xml).expect("encode");
        assert!(text.starts_with(XML_DECLARATION));
        assert!(text.contains("<CalibrationData><CameraMatrix><Row><Cell>812.345678901</Cell>"));
        assert!(text.contains("<DistCoeffs><Cell>-0.123456789012345</Cell>"));
        assert_eq!(decode(&text, CalibrationFormat::Xml), Ok(sample()));
    }

    #[test]
    fn hand_written_xml_with_whitespace_parses() {
        let text = r#"<?xml version="1.0"?>
            <CalibrationData>
              <CameraMatrix>
                <Row><Cell> 600 </Cell><Cell>0</Cell><Cell>320</Cell></Row>
                <Row><Cell>0</Cell><Cell>600</Cell><Cell>240</Cell></Row>
                <Row><Cell>0</Cell><Cell>0</Cell><Cell>1</Cell></Row>
              </CameraMatrix>
              <DistCoeffs><Cell>0.1</Cell><Cell>0.01</Cell><Cell>0</Cell><Cell>0</Cell></DistCoeffs>
            </CalibrationData>"#;
        let k = decode(text, CalibrationFormat::Xml).expect("parse");
        assert_eq!(k.fx(), 600.0);
        assert_eq!(k.distortion.k2, 0.01);
        assert_eq!(k.distortion.k3, 0.0);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let missing_dist = "<CalibrationData><CameraMatrix>\
            <Row><Cell>1</Cell><Cell>0</Cell><Cell>0</Cell></Row>\
            <Row><Cell>0</Cell><Cell>1</Cell><Cell>0</Cell></Row>\
            <Row><Cell>0</Cell><Cell>0</Cell><Cell>1</Cell></Row>\
            </CameraMatrix></CalibrationData>";
        assert!(decode(missing_dist, CalibrationFormat::Xml).is_err());

        let two_rows = "<CalibrationData><CameraMatrix>\
            <Row><Cell>1</Cell><Cell>0</Cell><Cell>0</Cell></Row>\
            <Row><Cell>0</Cell><Cell>1</Cell><Cell>0</Cell></Row>\
            </CameraMatrix><DistCoeffs><Cell>0</Cell><Cell>0</Cell><Cell>0</Cell><Cell>0</Cell></DistCoeffs>\
            </CalibrationData>";
        assert!(decode(two_rows, CalibrationFormat::Xml)
            .unwrap_err()
            .contains("2 rows"));

        let text = encode(&sample(), CalibrationFormat::Xml).expect("encode");
        let garbled = text.replacen("<Cell>809.1</Cell>", "<Cell>abc</Cell>", 1);
        assert!(decode(&garbled, CalibrationFormat::Xml)
            .unwrap_err()
            .contains("not a number"));

        assert!(decode("not xml at all <", CalibrationFormat::Xml).is_err());
        assert!(decode(r#"{"CameraMatrix": [[1,0,0]]}"#, CalibrationFormat::Json).is_err());
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(CalibrationFormat::from_path(Path::new("a/b.JSON")), CalibrationFormat::Json);
        assert_eq!(CalibrationFormat::from_path(Path::new("calib.xml")), CalibrationFormat::Xml);
        assert_eq!(CalibrationFormat::from_path(Path::new("calib")), CalibrationFormat::Xml);
    }
}
