mod image_cache_port;
mod image_client_port;
mod image_decoder_port;
mod video_thumbnailer_port;

pub use image_cache_port::ThumbnailPresence;
pub use image_client_port::{ClientHandle, ClientId, ImageClient};
pub use image_decoder_port::{DecodedImage, ImageDecoder};
pub use video_thumbnailer_port::VideoThumbnailer;

#[cfg(test)]
pub mod mock {
    pub use super::image_cache_port::mock::StaticPresence;
    pub use super::image_client_port::mock::{Delivery, RecordingClient};
    pub use super::image_decoder_port::mock::{FakeDecoder, GateDecoder};
    pub use super::video_thumbnailer_port::mock::RecordingThumbnailer;
}
