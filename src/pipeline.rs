//! Request processing
//!
//! An [`ArtifactProcessor`] turns the artifacts of one completed transfer
//! into result artifacts. Two processors are provided:
//!
//! - [`SegmentationPipeline`]: volume → decode → canonicalize → engine →
//!   inverse → merge/repack → mask reply
//! - [`FeaturePipeline`]: image + mask → feature extraction → archived record
//!
//! Processors run synchronously; the server calls them on the blocking pool.
//!
//! # Example
//!
//! ```no_run
//! use seglink::config::EngineConfig;
//! use seglink::pipeline::SegmentationPipeline;
//! use seglink::sink::NullSink;
//! # use seglink::engine::SegmentationEngine;
//! # use std::sync::Arc;
//! # fn engine() -> Arc<dyn SegmentationEngine> { unimplemented!() }
//!
//! let pipeline = SegmentationPipeline::new(engine(), EngineConfig::default(), Arc::new(NullSink));
//! let (status, body) = pipeline.respond(br#"{"dimensions":[2,2,2]}"#);
//! assert_eq!(status, 400);
//! ```

use crate::compression::unwrap_gzip;
use crate::config::EngineConfig;
use crate::engine::{FeatureEngine, FeatureMap, SegmentationEngine};
use crate::error::{Result, SegError};
use crate::protocol::payload::{ErrorReply, MaskReply, VolumePayload};
use crate::sink::{archive_name, Sink};
use crate::transfer::session::{generate_session_id, ReceivedArtifact};
use crate::volume::array::Volume;
use crate::volume::decoder::VolumeDecoder;
use crate::volume::orientation::OrientationCanonicalizer;
use crate::volume::repack::{MaskRepacker, MultiLabelMask};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Artifact produced by processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultArtifact {
    pub name: String,
    pub data: Bytes,
}

/// Outcome of processing one request
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Artifacts returned to the client, in order
    pub artifacts: Vec<ResultArtifact>,
    /// Summary for the `completed` status
    pub message: String,
    /// Number of extracted features, for feature requests
    pub features_count: Option<usize>,
    /// Set when persistence failed; the result stays valid
    pub warning: Option<String>,
}

/// Processes the artifacts of one transfer
pub trait ArtifactProcessor: Send + Sync {
    /// Artifact names a request must carry, in transfer order
    fn expected_artifacts(&self) -> Vec<String>;

    fn process(&self, session_id: &str, artifacts: Vec<ReceivedArtifact>) -> Result<ProcessOutput>;
}

fn take_artifact(artifacts: &mut Vec<ReceivedArtifact>, name: &str) -> Result<Bytes> {
    let index = artifacts
        .iter()
        .position(|a| a.name == name)
        .ok_or_else(|| SegError::InvalidRequest(format!("request carries no '{}' artifact", name)))?;
    Ok(artifacts.swap_remove(index).data)
}

fn store_best_effort(sink: &dyn Sink, session_id: &str, name: &str, data: &[u8]) -> Option<String> {
    match sink.store(&archive_name(session_id, name), data) {
        Ok(()) => None,
        Err(e) => {
            warn!(session_id = session_id, artifact = name, error = %e, "Result not archived");
            Some(e.to_string())
        }
    }
}

/// Result of one segmentation request
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub reply: MaskReply,
    /// Sink failure, if any
    pub warning: Option<String>,
}

/// Segmentation request pipeline
pub struct SegmentationPipeline {
    engine: Arc<dyn SegmentationEngine>,
    config: EngineConfig,
    sink: Arc<dyn Sink>,
    canonicalizer: OrientationCanonicalizer,
}

impl SegmentationPipeline {
    /// Artifact carrying the volume payload
    pub const VOLUME_ARTIFACT: &'static str = "volume";
    /// Artifact carrying the mask reply
    pub const MASK_ARTIFACT: &'static str = "mask";

    pub fn new(engine: Arc<dyn SegmentationEngine>, config: EngineConfig, sink: Arc<dyn Sink>) -> Self {
        SegmentationPipeline {
            engine,
            config,
            sink,
            canonicalizer: OrientationCanonicalizer::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Segment one volume payload
    ///
    /// The original payload and the final mask are archived best-effort.
    pub fn segment(&self, session_id: &str, payload: &VolumePayload) -> Result<Segmentation> {
        let started = Instant::now();
        let buffer = payload.to_buffer()?;
        let decoded = VolumeDecoder::decode(&buffer)?;
        let (canonical, token) = self.canonicalizer.forward(&decoded);

        let task = &self.config.task;
        info!(
            session_id = session_id,
            engine = self.engine.name(),
            task = %task.task,
            device = self.config.device.name(),
            dims = ?canonical.dims(),
            "Running segmentation engine"
        );
        let outputs = self.engine.run(&canonical, task, self.config.device)?;
        drop(canonical);

        let merged = MaskRepacker::merge(&outputs, &task.labels, task.merge)?;
        drop(outputs);
        let restored = MultiLabelMask {
            mask: OrientationCanonicalizer::inverse(&merged.mask, &token, decoded.volume.dims())?,
            ..merged
        };
        let reply = MaskRepacker::repack(&restored, decoded.axis_order, decoded.source_dims)?;

        info!(
            session_id = session_id,
            dims = ?reply.dimensions,
            elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
            "Segmentation completed"
        );

        let mut warning = None;
        if let Ok(volume) = payload.to_json() {
            warning = store_best_effort(self.sink.as_ref(), session_id, "volume.json", &volume);
        }
        let mask = serde_json::to_vec(&reply)?;
        if let Some(w) = store_best_effort(self.sink.as_ref(), session_id, "mask.json", &mask) {
            warning.get_or_insert(w);
        }

        Ok(Segmentation { reply, warning })
    }

    /// Request/response entry point
    ///
    /// Takes a (possibly gzip-wrapped) JSON volume payload and returns a
    /// status code with a JSON body: the mask reply on 200, `{"error": ...}`
    /// otherwise.
    pub fn respond(&self, body: &[u8]) -> (u16, Vec<u8>) {
        let session_id = generate_session_id();
        let result = unwrap_gzip(Bytes::copy_from_slice(body))
            .and_then(|body| VolumePayload::from_json(&body))
            .and_then(|payload| self.segment(&session_id, &payload));

        match result {
            Ok(segmentation) => match serde_json::to_vec(&segmentation.reply) {
                Ok(body) => (200, body),
                Err(e) => error_response(&SegError::from(e)),
            },
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Segmentation request failed");
                error_response(&e)
            }
        }
    }
}

impl ArtifactProcessor for SegmentationPipeline {
    fn expected_artifacts(&self) -> Vec<String> {
        vec![Self::VOLUME_ARTIFACT.to_string()]
    }

    fn process(&self, session_id: &str, mut artifacts: Vec<ReceivedArtifact>) -> Result<ProcessOutput> {
        let raw = unwrap_gzip(take_artifact(&mut artifacts, Self::VOLUME_ARTIFACT)?)?;
        let payload = VolumePayload::from_json(&raw)?;
        drop(raw);

        let segmentation = self.segment(session_id, &payload)?;
        let labels = segmentation.reply.segment_labels.as_ref().map_or(1, Vec::len);
        Ok(ProcessOutput {
            artifacts: vec![ResultArtifact {
                name: Self::MASK_ARTIFACT.to_string(),
                data: Bytes::from(serde_json::to_vec(&segmentation.reply)?),
            }],
            message: format!("Segmentation completed with {} label(s)", labels),
            features_count: None,
            warning: segmentation.warning,
        })
    }
}

/// Archived feature record
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRecord {
    pub session_id: String,
    pub timestamp: String,
    pub label: u8,
    pub features: FeatureMap,
}

impl FeatureRecord {
    /// Features excluding `diagnostics_` metadata
    pub fn feature_count(&self) -> usize {
        self.features
            .keys()
            .filter(|k| !k.starts_with("diagnostics_"))
            .count()
    }
}

/// Feature extraction pipeline
pub struct FeaturePipeline {
    engine: Arc<dyn FeatureEngine>,
    sink: Arc<dyn Sink>,
}

impl FeaturePipeline {
    pub const IMAGE_ARTIFACT: &'static str = "image";
    pub const MASK_ARTIFACT: &'static str = "mask";
    pub const FEATURES_ARTIFACT: &'static str = "features";

    pub fn new(engine: Arc<dyn FeatureEngine>, sink: Arc<dyn Sink>) -> Self {
        FeaturePipeline { engine, sink }
    }

    /// Extract features of the labeled region of `mask` over `image`
    pub fn extract(&self, session_id: &str, image: &VolumePayload, mask: &VolumePayload) -> Result<FeatureRecord> {
        let image = VolumeDecoder::decode(&image.to_buffer()?)?;
        let mask = VolumeDecoder::decode(&mask.to_buffer()?)?;
        if image.source_dims != mask.source_dims {
            return Err(SegError::InvalidRequest(format!(
                "mask dimensions {:?} differ from image dimensions {:?}",
                mask.source_dims, image.source_dims
            )));
        }

        let mask = mask.volume.map(|v| v as u8);
        let label = detect_label(&mask, session_id)?;
        info!(
            session_id = session_id,
            engine = self.engine.name(),
            label = label,
            "Extracting features"
        );
        let features = self.engine.extract(&image, &mask, label)?;

        Ok(FeatureRecord {
            session_id: session_id.to_string(),
            timestamp: chrono::Local::now().to_rfc3339(),
            label,
            features,
        })
    }
}

impl ArtifactProcessor for FeaturePipeline {
    fn expected_artifacts(&self) -> Vec<String> {
        vec![Self::IMAGE_ARTIFACT.to_string(), Self::MASK_ARTIFACT.to_string()]
    }

    fn process(&self, session_id: &str, mut artifacts: Vec<ReceivedArtifact>) -> Result<ProcessOutput> {
        let image = VolumePayload::from_json(&unwrap_gzip(take_artifact(&mut artifacts, Self::IMAGE_ARTIFACT)?)?)?;
        let mask = VolumePayload::from_json(&unwrap_gzip(take_artifact(&mut artifacts, Self::MASK_ARTIFACT)?)?)?;

        let record = self.extract(session_id, &image, &mask)?;
        let count = record.feature_count();
        let body = serde_json::to_vec(&record)?;
        let warning = store_best_effort(self.sink.as_ref(), session_id, "features.json", &body);

        Ok(ProcessOutput {
            artifacts: vec![ResultArtifact {
                name: Self::FEATURES_ARTIFACT.to_string(),
                data: Bytes::from(body),
            }],
            message: format!("Extracted {} features", count),
            features_count: Some(count),
            warning,
        })
    }
}

/// Smallest non-zero voxel value of a mask
pub fn detect_label(mask: &Volume<u8>, session_id: &str) -> Result<u8> {
    let mut present = [false; 256];
    for &v in mask.as_slice() {
        present[v as usize] = true;
    }
    let labels: Vec<u8> = (1..=255u8).filter(|v| present[*v as usize]).collect();
    let label = *labels
        .first()
        .ok_or_else(|| SegError::InvalidRequest("mask has no labeled voxels".to_string()))?;
    if labels.len() > 1 {
        warn!(session_id = session_id, labels = ?labels, label = label, "Mask holds several labels, using the smallest");
    }
    Ok(label)
}

fn error_response(err: &SegError) -> (u16, Vec<u8>) {
    let body = serde_json::to_vec(&ErrorReply::from(err)).unwrap_or_else(|_| b"{}".to_vec());
    (err.status_code(), body)
}

/// Liveness payload
pub fn health() -> Value {
    json!({ "status": "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Device, SegmentationTask};
    use crate::sink::NullSink;
    use crate::volume::decoder::ElementType;
    use crate::volume::orientation::CanonicalVolume;
    use crate::volume::repack::LabelVolume;
    use std::sync::Mutex;

    /// Emits one sub-volume per declared label: voxels equal to its id
    struct EchoEngine {
        seen_dims: Mutex<Option<[usize; 3]>>,
    }

    impl EchoEngine {
        fn new() -> Arc<Self> {
            Arc::new(EchoEngine {
                seen_dims: Mutex::new(None),
            })
        }
    }

    impl SegmentationEngine for EchoEngine {
        fn run(&self, volume: &CanonicalVolume, task: &SegmentationTask, _device: Device) -> Result<Vec<LabelVolume>> {
            *self.seen_dims.lock().unwrap() = Some(volume.dims());
            Ok(task
                .labels
                .entries()
                .iter()
                .map(|e| {
                    let id = e.id as f32;
                    LabelVolume::new(&e.name, volume.volume.map(|v| u8::from(v == id)))
                })
                .collect())
        }
    }

    struct FailingEngine;

    impl SegmentationEngine for FailingEngine {
        fn run(&self, _: &CanonicalVolume, _: &SegmentationTask, _: Device) -> Result<Vec<LabelVolume>> {
            Err(SegError::EngineFailure("out of memory".into()))
        }
    }

    struct PartialEngine;

    impl SegmentationEngine for PartialEngine {
        fn run(&self, volume: &CanonicalVolume, _: &SegmentationTask, _: Device) -> Result<Vec<LabelVolume>> {
            Ok(vec![LabelVolume::new(
                "heart_atrium_left",
                Volume::filled(volume.dims(), 1u8),
            )])
        }
    }

    struct BrokenSink;

    impl Sink for BrokenSink {
        fn store(&self, _: &str, _: &[u8]) -> Result<()> {
            Err(SegError::SinkFailure("disk full".into()))
        }
    }

    struct MeanEngine;

    impl FeatureEngine for MeanEngine {
        fn extract(&self, image: &crate::volume::decoder::DecodedVolume, mask: &Volume<u8>, label: u8) -> Result<FeatureMap> {
            let selected: Vec<f32> = image
                .volume
                .as_slice()
                .iter()
                .zip(mask.as_slice())
                .filter(|(_, m)| **m == label)
                .map(|(v, _)| *v)
                .collect();
            let mean = selected.iter().sum::<f32>() / selected.len() as f32;
            let mut features = FeatureMap::new();
            features.insert("diagnostics_voxels".into(), json!(selected.len()));
            features.insert("firstorder_Mean".into(), json!(mean));
            Ok(features)
        }
    }

    fn chamber_volume(dims: [usize; 3]) -> (VolumePayload, Vec<u8>) {
        let n = dims[0] * dims[1] * dims[2];
        let raw: Vec<u8> = (0..n).map(|i| ((i * 7 + i / 13) % 5) as u8).collect();
        let payload = VolumePayload::new(dims, ElementType::Uint8, &raw)
            .with_spacing([2000.0, 1000.0, 1000.0])
            .with_origin([1.0, 2.0, 3.0]);
        (payload, raw)
    }

    #[test]
    fn test_depth_first_volume_round_trips() {
        let engine = EchoEngine::new();
        let pipeline = SegmentationPipeline::new(engine.clone(), EngineConfig::default(), Arc::new(NullSink));
        let (payload, raw) = chamber_volume([4, 256, 256]);

        let result = pipeline.segment("s1", &payload).unwrap();
        assert_eq!(*engine.seen_dims.lock().unwrap(), Some([256, 256, 4]));
        assert_eq!(result.reply.dimensions, vec![4, 256, 256]);
        assert_eq!(result.reply.mask_bytes().unwrap(), raw);
        assert_eq!(result.reply.multi_label, Some(true));
        assert_eq!(
            result.reply.segment_labels.as_deref().map(|l| l[0].as_str()),
            Some("Left atrium")
        );
        assert!(result.warning.is_none());
    }

    #[test]
    fn test_as_declared_volume_round_trips() {
        let pipeline = SegmentationPipeline::new(EchoEngine::new(), EngineConfig::default(), Arc::new(NullSink));
        let (payload, raw) = chamber_volume([9, 7, 5]);
        let payload = payload.with_orientation("PIL");
        let result = pipeline.segment("s2", &payload).unwrap();
        assert_eq!(result.reply.dimensions, vec![9, 7, 5]);
        assert_eq!(result.reply.mask_bytes().unwrap(), raw);
    }

    #[test]
    fn test_missing_structure_fails_whole_request() {
        let pipeline = SegmentationPipeline::new(Arc::new(PartialEngine), EngineConfig::default(), Arc::new(NullSink));
        let (payload, _) = chamber_volume([3, 4, 5]);
        let body = payload.to_json().unwrap();
        let (status, reply) = pipeline.respond(&body);
        assert_eq!(status, 404);
        let reply: ErrorReply = serde_json::from_slice(&reply).unwrap();
        assert!(reply.error.contains("heart_ventricle_left"));
    }

    #[test]
    fn test_status_codes() {
        let pipeline = SegmentationPipeline::new(Arc::new(FailingEngine), EngineConfig::default(), Arc::new(NullSink));
        assert_eq!(pipeline.respond(b"not json").0, 400);
        assert_eq!(pipeline.respond(br#"{"dimensions":[2,2,2]}"#).0, 400);

        let short = VolumePayload::new([2, 2, 2], ElementType::Uint8, &[0; 7]);
        assert_eq!(pipeline.respond(&short.to_json().unwrap()).0, 400);

        let (status, body) =
            pipeline.respond(br#"{"dimensions":[4611686018427387904,4,1],"dtype":"uint8","data":""}"#);
        assert_eq!(status, 400);
        let reply: ErrorReply = serde_json::from_slice(&body).unwrap();
        assert!(reply.error.contains("too large"));

        let (payload, _) = chamber_volume([2, 3, 4]);
        assert_eq!(pipeline.respond(&payload.to_json().unwrap()).0, 500);
    }

    #[test]
    fn test_sink_failure_is_warning() {
        let pipeline = SegmentationPipeline::new(EchoEngine::new(), EngineConfig::default(), Arc::new(BrokenSink));
        let (payload, raw) = chamber_volume([3, 4, 5]);
        let result = pipeline.segment("s3", &payload).unwrap();
        assert!(result.warning.is_some());
        assert_eq!(result.reply.mask_bytes().unwrap(), raw);
    }

    #[test]
    fn test_process_union_mask() {
        let config = EngineConfig::new(Device::Cpu, SegmentationTask::left_heart());
        let pipeline = SegmentationPipeline::new(EchoEngine::new(), config, Arc::new(NullSink));
        let (payload, raw) = chamber_volume([3, 4, 5]);
        let artifacts = vec![ReceivedArtifact {
            name: "volume".into(),
            data: Bytes::from(payload.to_json().unwrap()),
        }];

        let output = pipeline.process("s4", artifacts).unwrap();
        let reply = MaskReply::from_json(&output.artifacts[0].data).unwrap();
        let expected: Vec<u8> = raw.iter().map(|v| u8::from(*v == 1 || *v == 2)).collect();
        assert_eq!(reply.mask_bytes().unwrap(), expected);
        assert_eq!(reply.multi_label, None);
    }

    #[test]
    fn test_feature_pipeline() {
        let pipeline = FeaturePipeline::new(Arc::new(MeanEngine), Arc::new(NullSink));
        let image = VolumePayload::new([2, 2, 1], ElementType::Uint8, &[10, 20, 30, 40]);
        let mask = VolumePayload::new([2, 2, 1], ElementType::Uint8, &[0, 2, 2, 5]);
        let artifacts = vec![
            ReceivedArtifact {
                name: "mask".into(),
                data: Bytes::from(mask.to_json().unwrap()),
            },
            ReceivedArtifact {
                name: "image".into(),
                data: Bytes::from(image.to_json().unwrap()),
            },
        ];

        let output = pipeline.process("s5", artifacts).unwrap();
        assert_eq!(output.features_count, Some(1));
        let record: Value = serde_json::from_slice(&output.artifacts[0].data).unwrap();
        assert_eq!(record["label"], 2);
        assert_eq!(record["session_id"], "s5");
        assert_eq!(record["features"]["firstorder_Mean"], 25.0);
    }

    #[test]
    fn test_empty_mask_rejected() {
        let mask = Volume::filled([2, 2, 2], 0u8);
        assert!(matches!(detect_label(&mask, "s"), Err(SegError::InvalidRequest(_))));
    }

    #[test]
    fn test_health() {
        assert_eq!(health()["status"], "ok");
    }
}
