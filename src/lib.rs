//! Chunked volume transfer and segmentation round trip
//!
//! This library moves large three-dimensional image volumes from a client to
//! a processing service over a channel with a message-size ceiling, and
//! returns a result mask that overlays the original voxel for voxel, even
//! when client and service disagree on axis order and orientation.
//!
//! # Features
//!
//! - **Chunked transfer protocol** - Handshake, one outstanding chunk at a time, progress acks
//! - **Explicit session state machine** - Closed message set, validated transitions
//! - **Axis-order and unit heuristics** - Smallest-dimension-first detection, micrometer spacing
//! - **Exact orientation round trip** - Permutation + flip transforms with exact inverses
//! - **Multi-label masks** - Priority merge of engine sub-volumes with a fixed label table
//! - **Async I/O** - Tokio server and client, engine work on the blocking pool
//!
//! # Quick Start
//!
//! **Server:**
//! ```no_run
//! use seglink::config::{EngineConfig, TransferConfig};
//! use seglink::io::TransferServer;
//! use seglink::pipeline::SegmentationPipeline;
//! use seglink::sink::ArchiveSink;
//! use std::sync::Arc;
//! # use seglink::engine::SegmentationEngine;
//! # fn my_engine() -> Arc<dyn SegmentationEngine> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = Arc::new(ArchiveSink::new("results")?);
//!     let pipeline = SegmentationPipeline::new(my_engine(), EngineConfig::default(), sink);
//!
//!     let server = TransferServer::bind("0.0.0.0:8765", TransferConfig::default(), Arc::new(pipeline)).await?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! **Client:**
//! ```no_run
//! use seglink::config::TransferConfig;
//! use seglink::io::TransferClient;
//! use seglink::protocol::VolumePayload;
//! use seglink::volume::ElementType;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let raw = vec![0u8; 40 * 256 * 256 * 2];
//!     let payload = VolumePayload::new([40, 256, 256], ElementType::Int16, &raw)
//!         .with_spacing([1250.0, 1250.0, 8000.0]);
//!
//!     let mut client = TransferClient::connect("127.0.0.1:8765", TransferConfig::default()).await?;
//!     let (mask, outcome) = client.segment_volume(&payload).await?;
//!     assert_eq!(mask.dimensions, vec![40, 256, 256]);
//!     println!("{}: {:?}", outcome.status, mask.segment_labels);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **`transfer`** - Chunked transfer
//!   - `TransferSession` - Receiving-side state machine
//!   - `ChunkReassembler` - Ordered reassembly of one artifact
//!   - `ChunkSplitter` - Sending side
//!
//! - **`volume`** - Volume handling
//!   - `VolumeDecoder` - Element decoding, unit and axis-order heuristics
//!   - `OrientationCanonicalizer` - Reference orientation and exact inverse
//!   - `MaskRepacker` - Label merge and layout restoration
//!
//! - **`protocol`** - Frames, messages, payloads
//! - **`pipeline`** - Segmentation and feature extraction processors
//! - **`io`** - Async client and server
//! - **`engine`** / **`sink`** - Collaborator traits
//!
//! # Error Handling
//!
//! Every operation returns [`Result<T>`], an alias for
//! `std::result::Result<T, SegError>`. Protocol violations end the session
//! with an `error` message; a failed [`sink::Sink`] only downgrades the
//! final status to `warning`.

pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod protocol;
pub mod sink;
pub mod transfer;
pub mod volume;

// Re-export commonly used types
pub use error::{Result, SegError};
