//! Seams between the scheduler and the network.
//!
//! [`NovelAiClient`](crate::NovelAiClient) implements both traits; tests and
//! alternative backends can provide their own.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::future::Future;

use crate::error::TransportError;
use crate::payload::CompiledRequest;

/// Raw body chunks of a streaming generation response, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Turns a vibe reference image into the service's encoded representation.
pub trait ReferenceEncoder: Send + Sync {
    /// One network round trip per image. Failures are surfaced, not retried.
    fn encode_reference(
        &self,
        image: &[u8],
        information_extracted: f64,
        model: &str,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// Sends compiled requests and hands back the streaming response body.
pub trait GenerationTransport: ReferenceEncoder {
    /// Start a streaming generation. The returned chunks feed a
    /// [`StreamDecoder`](crate::StreamDecoder).
    fn open_stream(
        &self,
        request: &CompiledRequest,
    ) -> impl Future<Output = Result<ByteStream, TransportError>> + Send;
}

impl<T: ReferenceEncoder> ReferenceEncoder for std::sync::Arc<T> {
    fn encode_reference(
        &self,
        image: &[u8],
        information_extracted: f64,
        model: &str,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send {
        (**self).encode_reference(image, information_extracted, model)
    }
}

impl<T: GenerationTransport> GenerationTransport for std::sync::Arc<T> {
    fn open_stream(
        &self,
        request: &CompiledRequest,
    ) -> impl Future<Output = Result<ByteStream, TransportError>> + Send {
        (**self).open_stream(request)
    }
}
