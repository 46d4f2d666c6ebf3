//! Framed codec for worker communication.
//!
//! LengthDelimitedCodec handles framing, serde_json the payload. Works over
//! child pipes and in-memory duplex streams alike.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames above this size are logged; routine outputs are usually small.
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

/// Upper bound on a single frame. Model outputs (embeddings, captions) stay
/// far below this.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Length-prefixed JSON codec.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > LARGE_FRAME_BYTES {
            tracing::debug!(
                frame_size_kb = json.len() / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
    use crate::job::JobId;
    use crate::results::Outcome;
    use serde_json::json;

    #[test]
    fn codec_carries_job_request() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();

        let id = JobId::new();
        let mut params = serde_json::Map::new();
        params.insert("x".to_string(), json!(21));
        codec
            .encode(
                WorkerRequest::Job {
                    id,
                    routine: "double".to_string(),
                    params,
                },
                &mut buf,
            )
            .unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            WorkerRequest::Job {
                id: decoded,
                routine,
                params,
            } => {
                assert_eq!(decoded, id);
                assert_eq!(routine, "double");
                assert_eq!(params["x"], json!(21));
            }
            other => panic!("wrong variant: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_carries_outcome_response() {
        let mut codec = JsonCodec::<WorkerResponse>::new();
        let mut buf = BytesMut::new();

        let id = JobId::new();
        codec
            .encode(
                WorkerResponse::Outcome {
                    id,
                    outcome: Outcome::Succeeded { value: json!(42) },
                },
                &mut buf,
            )
            .unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            WorkerResponse::Outcome { id: decoded, outcome } => {
                assert_eq!(decoded, id);
                assert_eq!(outcome, Outcome::Succeeded { value: json!(42) });
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();
        codec.encode(WorkerRequest::Stop, &mut buf).unwrap();

        let mut head = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut head).unwrap().is_none());

        head.unsplit(buf);
        assert!(matches!(
            codec.decode(&mut head).unwrap(),
            Some(WorkerRequest::Stop)
        ));
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 3]);
        buf.extend_from_slice(b"{x]");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
