//! Ordered list of decoder backends.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::domain::entities::{FileIdentity, ImageRequest};
use crate::domain::errors::DecodeError;
use crate::domain::ports::{DecodedImage, ImageDecoder};

use super::decoders::RawPreviewDecoder;

/// Decoders consulted in registration order.
///
/// Built once at startup and shared with every worker.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: Vec<Arc<dyn ImageDecoder>>,
}

impl DecoderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in specialized decoders.
    #[must_use]
    pub fn with_defaults(skip_raw_with_sibling: bool) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RawPreviewDecoder::new(skip_raw_with_sibling)));
        registry
    }

    /// Appends a decoder. Earlier registrations win.
    pub fn register(&mut self, decoder: Arc<dyn ImageDecoder>) {
        debug!(decoder = decoder.name(), "Registered image decoder");
        self.decoders.push(decoder);
    }

    /// Decodes with the first decoder that claims the file and succeeds.
    ///
    /// # Errors
    /// Returns the last decoder error, or [`DecodeError::UnsupportedFormat`]
    /// when no decoder claims the file.
    pub fn decode(
        &self,
        request: &ImageRequest,
        dim: Option<u32>,
        scratch: &mut Vec<u8>,
    ) -> Result<DecodedImage, DecodeError> {
        let path = request.file_system_path();
        let mut last_error = DecodeError::UnsupportedFormat;
        for decoder in self.decoders.iter().filter(|d| d.can_handle(path)) {
            match decoder.decode(request, dim, scratch) {
                Ok(decoded) => {
                    trace!(decoder = decoder.name(), file = %request.identity(), "Decoded");
                    return Ok(decoded);
                }
                Err(e) => {
                    debug!(decoder = decoder.name(), file = %request.identity(), error = %e, "Decoder failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Returns true if any registered decoder claims `identity`.
    #[must_use]
    pub fn might_decode(&self, identity: &FileIdentity) -> bool {
        self.decoders
            .iter()
            .any(|d| d.can_handle(identity.as_path()))
    }

    /// Returns the decoder names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    /// Returns the number of registered decoders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Returns true if no decoder is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("decoders", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::TargetSize;
    use crate::domain::ports::mock::FakeDecoder;

    fn request(path: &str) -> ImageRequest {
        ImageRequest::new(FileIdentity::new(path), TargetSize::Full, 0, None)
    }

    #[test]
    fn test_first_successful_decoder_wins() -> Result<(), DecodeError> {
        let failing = Arc::new(FakeDecoder::failing("broken", "xyz"));
        let first = Arc::new(FakeDecoder::succeeding("first", "xyz", (10, 10)));
        let second = Arc::new(FakeDecoder::succeeding("second", "xyz", (20, 20)));
        let mut registry = DecoderRegistry::new();
        registry.register(failing.clone());
        registry.register(first.clone());
        registry.register(second.clone());

        let decoded = registry.decode(&request("/a.xyz"), None, &mut Vec::new())?;
        assert_eq!(decoded.full_size, (10, 10));
        assert_eq!((failing.calls(), first.calls(), second.calls()), (1, 1, 0));
        Ok(())
    }

    #[test]
    fn test_unclaimed_file_is_unsupported() {
        let decoder = Arc::new(FakeDecoder::succeeding("fake", "xyz", (10, 10)));
        let mut registry = DecoderRegistry::new();
        registry.register(decoder.clone());

        let result = registry.decode(&request("/a.png"), None, &mut Vec::new());
        assert!(matches!(result, Err(DecodeError::UnsupportedFormat)));
        assert_eq!(decoder.calls(), 0);
    }

    #[test]
    fn test_might_decode() {
        let registry = DecoderRegistry::with_defaults(false);
        assert_eq!(registry.names(), ["raw-preview"]);
        assert!(registry.might_decode(&FileIdentity::new("/raw/IMG_1.NEF")));
        assert!(!registry.might_decode(&FileIdentity::new("/photos/a.jpg")));
    }
}
