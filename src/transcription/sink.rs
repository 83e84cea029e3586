//! Transcription backend clients
//!
//! The accumulator hands flushed batches to a [`TranscriptionSink`]. The
//! shipped implementation wraps the raw PCM in a WAV container (the
//! backend expects a self-describing audio blob, not bare samples) and
//! POSTs it over HTTPS. A null sink stands in when no backend is
//! configured so the relay runs unchanged without transcription.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::trace;

use crate::errors::{RelayError, RelayResult};

/// Sample rate of flushed audio. Both call legs are fixed at 8 kHz.
const FLUSH_SAMPLE_RATE: u32 = 8000;

/// One transcript segment returned by the backend
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// External transcription call, invoked once per flushed batch
#[async_trait]
pub trait TranscriptionSink: Send + Sync {
    /// Transcribe one batch of 16-bit little-endian linear PCM.
    async fn transcribe(&self, call_id: &str, pcm: Bytes) -> RelayResult<Vec<TranscriptSegment>>;
}

/// Wrap raw s16le PCM in a WAV container (8 kHz mono).
pub fn wav_container(pcm: &[u8]) -> RelayResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: FLUSH_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for sample in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
    }
    writer.finalize()?;

    Ok(cursor.into_inner())
}

/// HTTP transcription backend client
pub struct HttpTranscriptionSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    language: Option<String>,
}

impl HttpTranscriptionSink {
    pub fn new(endpoint: String, api_key: Option<String>, language: Option<String>) -> Self {
        HttpTranscriptionSink {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            language,
        }
    }
}

#[async_trait]
impl TranscriptionSink for HttpTranscriptionSink {
    async fn transcribe(&self, call_id: &str, pcm: Bytes) -> RelayResult<Vec<TranscriptSegment>> {
        let wav = wav_container(&pcm)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(http::header::CONTENT_TYPE, "audio/wav")
            .query(&[("call_id", call_id)])
            .body(wav);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(language) = &self.language {
            request = request.query(&[("language", language)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Flush(format!(
                "transcription backend returned {}",
                response.status()
            )));
        }

        let body: TranscriptionResponse = response.json().await?;
        Ok(body.segments)
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

/// Sink used when no transcription backend is configured
#[derive(Debug, Default)]
pub struct NullTranscriptionSink;

#[async_trait]
impl TranscriptionSink for NullTranscriptionSink {
    async fn transcribe(&self, call_id: &str, pcm: Bytes) -> RelayResult<Vec<TranscriptSegment>> {
        trace!(
            call_id = %call_id,
            bytes = pcm.len(),
            "Transcription disabled, discarding flushed batch"
        );
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_wav_container_header() {
        let pcm = vec![0u8; 320]; // 160 samples of silence
        let wav = wav_container(&pcm).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 320 bytes of sample data follow the 44-byte header.
        assert_eq!(wav.len(), 44 + 320);
    }

    #[test]
    fn test_wav_container_empty_input() {
        let wav = wav_container(&[]).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44);
    }

    #[tokio::test]
    async fn test_null_sink_accepts_everything() {
        let sink = NullTranscriptionSink;
        let segments = sink
            .transcribe("call-1", Bytes::from_static(&[0, 0]))
            .await
            .unwrap();
        assert!(segments.is_empty());
    }

    #[tokio::test]
    async fn test_http_sink_posts_wav_and_parses_segments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .and(query_param("call_id", "call-1"))
            .and(query_param("language", "fr-FR"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "segments": [{"text": "bonjour", "speaker": "customer"}]
            })))
            .mount(&server)
            .await;

        let sink = HttpTranscriptionSink::new(
            format!("{}/transcribe", server.uri()),
            Some("test-key".to_string()),
            Some("fr-FR".to_string()),
        );
        let segments = sink
            .transcribe("call-1", Bytes::from(vec![0u8; 64]))
            .await
            .unwrap();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "bonjour");
        assert_eq!(segments[0].speaker.as_deref(), Some("customer"));
    }

    #[tokio::test]
    async fn test_http_sink_maps_backend_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpTranscriptionSink::new(server.uri(), None, None);
        let err = sink
            .transcribe("call-1", Bytes::from(vec![0u8; 64]))
            .await
            .unwrap_err();
        assert!(err.is_flush_domain());
    }
}
