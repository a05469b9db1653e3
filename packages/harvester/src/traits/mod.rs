//! Trait definitions for the harvester's external collaborators.
//!
//! - `MessageSource` / `SourceConnector`: remote message history
//! - `RecordSink`: delivery of normalized records

pub mod sink;
pub mod source;

pub use sink::RecordSink;
pub use source::{
    ChannelHandle, MediaFlags, MessageSource, SenderInfo, SourceConnector, SourceMessage,
    TextEntity, TextEntityKind,
};
