//! Transform pipelines over the raw byte stream
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s assembled by a
//! [`PipelineBuilder`]. Each stage maps one input chunk to zero or more output
//! items. An item is a chunk or an error; errors keep their position in the
//! stream and pass later stages untouched. Pipelines are never patched in place: when the underlying
//! connection changes, callers build a fresh one.
//!
//! [`PipelineReader`] attaches a pipeline to one fan-out subscription of a
//! [`crate::transport::Device`].

use std::borrow::Cow;
use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};

use crate::protocol::slip::SlipDecoder;
use crate::protocol::ProtocolError;

/// Kind of data flowing through a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    Text,
    Binary,
}

/// One unit of data in a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Binary(Vec<u8>),
    Text(String),
}

impl Chunk {
    pub fn kind(&self) -> ProtocolType {
        match self {
            Chunk::Binary(_) => ProtocolType::Binary,
            Chunk::Text(_) => ProtocolType::Text,
        }
    }

    /// View the chunk as text, replacing invalid UTF-8
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Chunk::Binary(b) => String::from_utf8_lossy(b),
            Chunk::Text(s) => Cow::Borrowed(s),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Chunk::Binary(b) => b,
            Chunk::Text(s) => s.into_bytes(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Chunk::Binary(b) => b.is_empty(),
            Chunk::Text(s) => s.is_empty(),
        }
    }
}

/// What a stage produces, in arrival order
pub type Item = Result<Chunk, ProtocolError>;

/// A single transform step
pub trait Stage: Send {
    /// Consume one chunk, pushing whatever it produces to `out`
    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Item>);

    /// A terminated stage accepts no further input
    fn is_terminated(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// Splits every chunk into single bytes or single characters
#[derive(Debug, Default)]
pub struct CharacterStage;

impl Stage for CharacterStage {
    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Item>) {
        match chunk {
            Chunk::Binary(bytes) => {
                out.extend(bytes.into_iter().map(|b| Ok(Chunk::Binary(vec![b]))))
            }
            Chunk::Text(text) => out.extend(text.chars().map(|c| Ok(Chunk::Text(c.to_string())))),
        }
    }

    fn name(&self) -> &'static str {
        "characters"
    }
}

/// Converts between binary and text chunks
///
/// Chunks whose kind differs from the configured input pass through
/// untouched. Binary-to-text decoding is incremental, so a multi-byte UTF-8
/// sequence split across chunks is decoded once complete.
#[derive(Debug)]
pub struct ConvertStage {
    input: ProtocolType,
    output: ProtocolType,
    character_device: bool,
    pending: Vec<u8>,
}

impl ConvertStage {
    pub fn new(input: ProtocolType, output: ProtocolType, character_device: bool) -> Self {
        Self {
            input,
            output,
            character_device,
            pending: Vec::new(),
        }
    }

    fn decode_utf8(&mut self, bytes: Vec<u8>) -> String {
        self.pending.extend(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + bad);
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more bytes
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        text
    }
}

impl Stage for ConvertStage {
    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Item>) {
        if chunk.kind() != self.input {
            out.push(Ok(chunk));
            return;
        }
        let converted = match (chunk, self.output) {
            (Chunk::Binary(bytes), ProtocolType::Text) => Chunk::Text(self.decode_utf8(bytes)),
            (Chunk::Text(text), ProtocolType::Binary) => Chunk::Binary(text.into_bytes()),
            (same, _) => same,
        };
        if converted.is_empty() {
            return;
        }
        if self.character_device {
            CharacterStage.transform(converted, out);
        } else {
            out.push(Ok(converted));
        }
    }

    fn name(&self) -> &'static str {
        "convert"
    }
}

/// Holds back text until a marker has been seen, then passes everything
/// after the marker through
#[derive(Debug)]
pub struct ReadAfterStage {
    marker: String,
    reading: bool,
    buffer: String,
}

impl ReadAfterStage {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            reading: false,
            buffer: String::new(),
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }
}

impl Stage for ReadAfterStage {
    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Item>) {
        if self.reading {
            out.push(Ok(chunk));
            return;
        }
        self.buffer.push_str(&chunk.as_text());
        if let Some(idx) = self.buffer.find(&self.marker) {
            self.reading = true;
            let rest = self.buffer.split_off(idx + self.marker.len());
            self.buffer.clear();
            if !rest.is_empty() {
                out.push(Ok(Chunk::Text(rest)));
            }
        }
    }

    fn name(&self) -> &'static str {
        "read-after"
    }
}

/// Runs binary chunks through a SLIP decoder, emitting one chunk per frame.
///
/// A rejected byte becomes an error item in place; frames on either side of
/// it are still delivered.
#[derive(Debug)]
pub struct FrameStage {
    decoder: SlipDecoder,
}

impl FrameStage {
    pub fn new(decoder: SlipDecoder) -> Self {
        Self { decoder }
    }
}

impl Stage for FrameStage {
    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Item>) {
        let decoded = self.decoder.decode_chunk(&chunk.into_bytes());
        out.extend(decoded.into_iter().map(|frame| frame.map(Chunk::Binary)));
    }

    fn is_terminated(&self) -> bool {
        self.decoder.is_terminated()
    }

    fn name(&self) -> &'static str {
        "frames"
    }
}

/// Pass-through that traces every chunk
#[derive(Debug)]
pub struct LoggingStage {
    label: &'static str,
}

impl LoggingStage {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl Stage for LoggingStage {
    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Item>) {
        trace!("{}: {:?}", self.label, chunk);
        out.push(Ok(chunk));
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// An ordered chain of stages
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Feed one chunk through every stage
    pub fn push(&mut self, chunk: Chunk) -> Vec<Item> {
        let mut current = vec![Ok(chunk)];
        for stage in self.stages.iter_mut() {
            let mut next = Vec::new();
            for item in current {
                if stage.is_terminated() {
                    break;
                }
                match item {
                    Ok(c) => stage.transform(c, &mut next),
                    Err(e) => next.push(Err(e)),
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// True once any stage has terminated
    pub fn is_terminated(&self) -> bool {
        self.stages.iter().any(|s| s.is_terminated())
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// Builder for [`Pipeline`]
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn characters(self) -> Self {
        self.stage(CharacterStage)
    }

    pub fn convert(self, input: ProtocolType, output: ProtocolType, character_device: bool) -> Self {
        self.stage(ConvertStage::new(input, output, character_device))
    }

    /// Binary to text, one chunk per character
    pub fn text_chars(self) -> Self {
        self.convert(ProtocolType::Binary, ProtocolType::Text, true)
    }

    pub fn read_after(self, marker: impl Into<String>) -> Self {
        self.stage(ReadAfterStage::new(marker))
    }

    pub fn frames(self, decoder: SlipDecoder) -> Self {
        self.stage(FrameStage::new(decoder))
    }

    pub fn logging(self, label: &'static str) -> Self {
        self.stage(LoggingStage::new(label))
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
        }
    }
}

/// A pipeline fed from one fan-out subscription
pub struct PipelineReader {
    rx: broadcast::Receiver<Bytes>,
    pipeline: Pipeline,
    ready: VecDeque<Item>,
}

impl PipelineReader {
    pub fn new(rx: broadcast::Receiver<Bytes>, pipeline: Pipeline) -> Self {
        Self {
            rx,
            pipeline,
            ready: VecDeque::new(),
        }
    }

    /// Next output chunk, or `None` once the source closed or the pipeline
    /// terminated.
    ///
    /// An error item is returned on its own; the chunks queued behind it are
    /// returned by the following calls. Cancel safe: dropping the future
    /// loses no data.
    pub async fn next(&mut self) -> Result<Option<Chunk>, ProtocolError> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return item.map(Some);
            }
            if self.pipeline.is_terminated() {
                return Ok(None);
            }
            match self.rx.recv().await {
                Ok(bytes) => {
                    let out = self.pipeline.push(Chunk::Binary(bytes.to_vec()));
                    self.ready.extend(out);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Pipeline reader lagged, {} chunks dropped", skipped);
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }
}
