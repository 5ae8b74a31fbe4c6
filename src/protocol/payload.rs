//! Volume ingestion and mask reply payloads
//!
//! ```json
//! {"dimensions": [d0, d1, d2], "spacing": [s0, s1, s2], "origin": [o0, o1, o2],
//!  "dtype": "float32", "data": "<base64, first axis fastest>"}
//! ```
//!
//! The reply carries the mask in the caller's original dimension order:
//!
//! ```json
//! {"dimensions": [d0, d1, d2], "data": "<base64 uint8>", "multiLabel": true,
//!  "segmentLabels": ["Left atrium", "Left ventricle", "Right atrium", "Right ventricle"]}
//! ```

use crate::error::{Result, SegError};
use crate::volume::decoder::{ElementType, VolumeBuffer};
use crate::volume::orientation::Orientation;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Volume ingestion payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumePayload {
    /// Leading dimensions in caller order (at least three)
    #[serde(default)]
    pub dimensions: Vec<usize>,
    /// Voxel spacing, padded with 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spacing: Option<Vec<f64>>,
    /// Volume origin, padded with 0.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Vec<f64>>,
    /// Element type tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    /// Anatomical orientation code of the decoded axes (default `"LPS"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    /// Base64 flat buffer, first axis fastest
    #[serde(default)]
    pub data: Option<String>,
}

impl VolumePayload {
    /// Build a payload from raw little-endian voxel bytes
    pub fn new(dimensions: [usize; 3], element_type: ElementType, raw: &[u8]) -> Self {
        VolumePayload {
            dimensions: dimensions.to_vec(),
            spacing: None,
            origin: None,
            dtype: Some(element_type.name().to_string()),
            orientation: None,
            data: Some(STANDARD.encode(raw)),
        }
    }

    /// Set voxel spacing
    pub fn with_spacing(mut self, spacing: [f64; 3]) -> Self {
        self.spacing = Some(spacing.to_vec());
        self
    }

    /// Set origin
    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = Some(origin.to_vec());
        self
    }

    /// Set the orientation code
    pub fn with_orientation(mut self, orientation: &str) -> Self {
        self.orientation = Some(orientation.to_string());
        self
    }

    /// Parse a payload from JSON bytes
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| SegError::InvalidRequest(format!("malformed volume payload: {}", e)))
    }

    /// Serialize to JSON bytes
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The first three dimensions
    pub fn leading_dims(&self) -> Result<[usize; 3]> {
        if self.dimensions.len() < 3 {
            return Err(SegError::InvalidRequest(format!(
                "dimensions must have at least 3 elements, got {}",
                self.dimensions.len()
            )));
        }
        Ok([self.dimensions[0], self.dimensions[1], self.dimensions[2]])
    }

    /// Validate fields and decode the buffer into a [`VolumeBuffer`]
    pub fn to_buffer(&self) -> Result<VolumeBuffer> {
        let data = self.data.as_deref().ok_or_else(|| {
            SegError::InvalidRequest("JSON body must include dimensions and data (base64)".to_string())
        })?;
        let dims = self.leading_dims()?;
        let spacing = pad3(self.spacing.as_deref(), 1.0);
        let origin = pad3(self.origin.as_deref(), 0.0);
        let element_type = ElementType::from_tag(self.dtype.as_deref());
        let orientation = match self.orientation.as_deref() {
            Some(code) => Orientation::parse(code)?,
            None => Orientation::LPS,
        };

        let raw = Bytes::from(STANDARD.decode(data.as_bytes())?);
        debug!(
            dims = ?dims,
            dtype = element_type.name(),
            bytes = raw.len(),
            "Volume payload decoded"
        );

        Ok(VolumeBuffer::new(dims, spacing, origin, element_type, raw).with_orientation(orientation))
    }
}

fn pad3(values: Option<&[f64]>, fill: f64) -> [f64; 3] {
    let mut out = [fill; 3];
    if let Some(values) = values {
        for (slot, value) in out.iter_mut().zip(values) {
            *slot = *value;
        }
    }
    out
}

/// Mask reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskReply {
    /// Caller's original leading dimensions
    pub dimensions: Vec<usize>,
    /// Base64 uint8 mask, first axis fastest
    pub data: String,
    /// Set when the mask holds several labels
    #[serde(rename = "multiLabel", default, skip_serializing_if = "Option::is_none")]
    pub multi_label: Option<bool>,
    /// Display names, index `i` is label `i + 1`
    #[serde(rename = "segmentLabels", default, skip_serializing_if = "Option::is_none")]
    pub segment_labels: Option<Vec<String>>,
}

impl MaskReply {
    /// Decode the mask bytes
    pub fn mask_bytes(&self) -> Result<Vec<u8>> {
        Ok(STANDARD.decode(self.data.as_bytes())?)
    }

    /// Parse from JSON bytes
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Error reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

impl From<&SegError> for ErrorReply {
    fn from(err: &SegError) -> Self {
        ErrorReply {
            error: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_padded() {
        let body = br#"{"dimensions":[2,2,2,1],"spacing":[0.5],"data":"AAAAAAAAAAA="}"#;
        let payload = VolumePayload::from_json(body).unwrap();
        let buffer = payload.to_buffer().unwrap();
        assert_eq!(buffer.dims(), [2, 2, 2]);
        assert_eq!(buffer.spacing(), [0.5, 1.0, 1.0]);
        assert_eq!(buffer.origin(), [0.0, 0.0, 0.0]);
        assert_eq!(buffer.element_type(), ElementType::Float32);
    }

    #[test]
    fn test_missing_data_rejected() {
        let payload = VolumePayload::from_json(br#"{"dimensions":[2,2,2]}"#).unwrap();
        let err = payload.to_buffer().unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_short_dimensions_rejected() {
        let payload = VolumePayload::new([1, 1, 1], ElementType::Uint8, &[0]);
        let payload = VolumePayload {
            dimensions: vec![1, 1],
            ..payload
        };
        assert!(matches!(
            payload.to_buffer(),
            Err(SegError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_mask_reply_field_names() {
        let reply = MaskReply {
            dimensions: vec![1, 1, 2],
            data: STANDARD.encode([0u8, 3]),
            multi_label: Some(true),
            segment_labels: Some(vec!["A".into()]),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["multiLabel"], true);
        assert_eq!(json["segmentLabels"][0], "A");
        assert_eq!(reply.mask_bytes().unwrap(), vec![0, 3]);

        let plain = MaskReply {
            multi_label: None,
            segment_labels: None,
            ..reply
        };
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("multiLabel").is_none());
    }
}
