//! Channel store
//!
//! Channels are bounded, re-readable topics: publisher-anyone,
//! reader-anyone, non-consuming reads by sequence range, eviction purely
//! by retention.

use std::sync::Arc;

use loom_domain::{
    validate, validate_channel_content, ChannelDescriptor, ChannelMessage, LoomError,
};
use loom_ports::{StreamSpec, StreamStats, Substrate, SubstrateError};
use tracing::warn;

pub const CHANNEL_READ_LIMIT_MAX: usize = 1000;
pub const CHANNEL_READ_LIMIT_DEFAULT: usize = 50;

pub struct Channels<S: Substrate> {
    substrate: Arc<S>,
    namespace: String,
    descriptors: Vec<ChannelDescriptor>,
}

/// Metrics for one channel
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub name: String,
    pub stats: StreamStats,
}

impl<S: Substrate> Channels<S> {
    pub fn new(substrate: Arc<S>, namespace: String, descriptors: Vec<ChannelDescriptor>) -> Self {
        Channels {
            substrate,
            namespace,
            descriptors,
        }
    }

    /// Create every configured channel stream. Idempotent.
    pub async fn init(&self) -> Result<(), LoomError> {
        for descriptor in &self.descriptors {
            descriptor.validate()?;
            self.substrate
                .ensure_stream(&StreamSpec::limits(
                    descriptor.stream_name(&self.namespace),
                    descriptor.subject(&self.namespace),
                    descriptor.retention,
                ))
                .await?;
        }
        Ok(())
    }

    pub fn list(&self) -> &[ChannelDescriptor] {
        &self.descriptors
    }

    fn descriptor(&self, channel: &str) -> Result<&ChannelDescriptor, LoomError> {
        self.descriptors
            .iter()
            .find(|d| d.name == channel)
            .ok_or_else(|| LoomError::not_found(format!("channel {channel:?}")))
    }

    /// Publish into a channel. The handle is the session handle; any
    /// participant may write.
    pub async fn send(
        &self,
        channel: &str,
        handle: &str,
        message: &str,
    ) -> Result<u64, LoomError> {
        let descriptor = self.descriptor(channel)?;
        if !validate::is_present(handle) {
            return Err(LoomError::validation(
                "no handle set; call handle_set first",
            ));
        }
        validate_channel_content(message)?;

        let payload = ChannelMessage::new(handle, message);
        let ack = self
            .substrate
            .publish(
                &descriptor.subject(&self.namespace),
                serde_json::to_vec(&payload)?,
            )
            .await?;
        Ok(ack.sequence)
    }

    /// Read the newest messages, oldest first, paging backwards with
    /// `offset`. The window never reaches below the first retained
    /// sequence; evicted sequences inside it are skipped.
    pub async fn read(
        &self,
        channel: &str,
        limit: usize,
        offset: u64,
    ) -> Result<Vec<ChannelMessage>, LoomError> {
        let descriptor = self.descriptor(channel)?;
        let limit = limit.clamp(1, CHANNEL_READ_LIMIT_MAX) as u64;
        let stream = descriptor.stream_name(&self.namespace);

        let stats = match self.substrate.stream_info(&stream).await {
            Ok(stats) => stats,
            Err(SubstrateError::StreamNotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if stats.messages == 0 {
            return Ok(Vec::new());
        }

        let end = stats
            .first_sequence
            .max(stats.last_sequence.saturating_sub(offset));
        let start = stats
            .first_sequence
            .max(end.saturating_sub(limit - 1));

        let stored = self.substrate.read_by_range(&stream, start, end).await?;
        let mut out = Vec::with_capacity(stored.len());
        for message in stored {
            match ChannelMessage::from_slice(&message.payload) {
                Ok(parsed) => out.push(parsed),
                Err(e) => {
                    warn!(channel, sequence = message.sequence, error = %e, "Skipping unreadable channel message");
                }
            }
        }
        Ok(out)
    }

    /// Stream metrics for one channel or for all of them.
    pub async fn status(&self, channel: Option<&str>) -> Result<Vec<ChannelStatus>, LoomError> {
        let selected: Vec<&ChannelDescriptor> = match channel {
            Some(name) => vec![self.descriptor(name)?],
            None => self.descriptors.iter().collect(),
        };

        let mut out = Vec::with_capacity(selected.len());
        for descriptor in selected {
            let stats = match self
                .substrate
                .stream_info(&descriptor.stream_name(&self.namespace))
                .await
            {
                Ok(stats) => stats,
                Err(SubstrateError::StreamNotFound { .. }) => StreamStats::default(),
                Err(e) => return Err(e.into()),
            };
            out.push(ChannelStatus {
                name: descriptor.name.clone(),
                stats,
            });
        }
        Ok(out)
    }
}
