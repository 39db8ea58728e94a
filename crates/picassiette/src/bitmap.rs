//! A decoded RGBA image, usable as a cache payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::caching::{BinaryCodec, BinaryPayload, CacheError, Payload};

/// Magic bytes at the start of every encoded [`Bitmap`].
const MAGIC: &[u8; 4] = b"PCB1";

/// Size of the encoded header: magic, width and height.
const HEADER_SIZE: usize = 12;

/// Bytes per pixel, one each for red, green, blue and alpha.
const BYTES_PER_PIXEL: usize = 4;

/// A decoded image with 8-bit RGBA pixels in row-major order.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("byte_count", &self.byte_count())
            .finish()
    }
}

impl Bitmap {
    /// Creates a bitmap from raw RGBA pixels.
    ///
    /// Returns `None` if the number of bytes does not match the dimensions.
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Option<Self> {
        let pixels = pixels.into();
        (pixels.len() == pixel_bytes(width, height)?).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// The decoded size of this bitmap in memory.
    pub fn byte_count(&self) -> u64 {
        self.pixels.len() as u64
    }

    /// Returns a copy that keeps only every `in_sample_size`-th pixel in both directions.
    ///
    /// A sample size of 4 returns an image that is 1/4 the width and height of the original, and
    /// 1/16 the number of pixels. Values below 2 and empty bitmaps return an unchanged copy.
    pub fn downsample(&self, in_sample_size: u32) -> Self {
        if in_sample_size < 2 || self.width == 0 || self.height == 0 {
            return self.clone();
        }
        let width = (self.width / in_sample_size).max(1);
        let height = (self.height / in_sample_size).max(1);
        let stride = self.width as usize * BYTES_PER_PIXEL;

        let mut pixels = BytesMut::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
        for y in 0..height as usize {
            let row = y * in_sample_size as usize * stride;
            for x in 0..width as usize {
                let offset = row + x * in_sample_size as usize * BYTES_PER_PIXEL;
                pixels.put_slice(&self.pixels[offset..offset + BYTES_PER_PIXEL]);
            }
        }

        Self {
            width,
            height,
            pixels: pixels.freeze(),
        }
    }
}

fn pixel_bytes(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(BYTES_PER_PIXEL)
}

/// Calculates the largest power of two sample size that keeps both dimensions of an image at or
/// above the requested size.
///
/// An image of 2048x1536 requested at 100x100 can be sampled by 8, resulting in 256x192.
pub fn calculate_in_sample_size(width: u32, height: u32, req_width: u32, req_height: u32) -> u32 {
    let req_width = req_width.max(1);
    let req_height = req_height.max(1);
    let mut in_sample_size = 1;

    if height > req_height || width > req_width {
        let half_height = height / 2;
        let half_width = width / 2;

        while half_height / in_sample_size >= req_height && half_width / in_sample_size >= req_width
        {
            in_sample_size *= 2;
        }
    }

    in_sample_size
}

impl BinaryPayload for Bitmap {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.pixels.len());
        buf.put_slice(MAGIC);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_slice(&self.pixels);
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        let Some((header, pixels)) = bytes.split_at_checked(HEADER_SIZE) else {
            return Err(CacheError::Decode("truncated bitmap header".into()));
        };
        if &header[..4] != MAGIC {
            return Err(CacheError::Decode("invalid bitmap magic".into()));
        }
        let width = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let height = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        Self::new(width, height, Bytes::copy_from_slice(pixels)).ok_or_else(|| {
            CacheError::Decode(format!(
                "bitmap of {width}x{height} has {} bytes of pixels",
                pixels.len()
            ))
        })
    }
}

impl Payload for Bitmap {
    type Codec = BinaryCodec;

    fn weight(&self) -> u64 {
        self.byte_count()
    }
}

#[cfg(test)]
mod tests {
    use crate::caching::Codec;

    use super::*;

    fn checkerboard(width: u32, height: u32) -> Bitmap {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let v = if (x + y) % 2 == 0 { 0xff } else { 0x00 };
                pixels.extend_from_slice(&[v, v, v, 0xff]);
            }
        }
        Bitmap::new(width, height, pixels).unwrap()
    }

    #[test]
    fn test_byte_count() {
        let bitmap = checkerboard(3, 2);
        assert_eq!(bitmap.byte_count(), 24);
        assert_eq!(bitmap.weight(), 24);
        assert!(Bitmap::new(3, 2, vec![0; 23]).is_none());
    }

    #[test]
    fn test_encoding() {
        let codec = <Bitmap as Payload>::Codec::default();
        let bitmap = checkerboard(2, 1);

        let bytes = codec.encode(&bitmap).unwrap();
        assert_eq!(
            bytes,
            b"PCB1\x02\x00\x00\x00\x01\x00\x00\x00\xff\xff\xff\xff\x00\x00\x00\xff"
        );
        let decoded: Bitmap = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, bitmap);
    }

    #[test]
    fn test_decoding_rejects_garbage() {
        for bytes in [
            &b"PCB1"[..],
            &b"PNG\x00\x01\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00"[..],
            &b"PCB1\x01\x00\x00\x00\x01\x00\x00\x00\x00\x00"[..],
        ] {
            let err = Bitmap::from_bytes(bytes).unwrap_err();
            assert!(matches!(err, CacheError::Decode(_)), "{err:?}");
        }
    }

    #[test]
    fn test_calculate_in_sample_size() {
        assert_eq!(calculate_in_sample_size(2048, 1536, 100, 100), 8);
        assert_eq!(calculate_in_sample_size(100, 100, 100, 100), 1);
        assert_eq!(calculate_in_sample_size(50, 50, 100, 100), 1);
        assert_eq!(calculate_in_sample_size(400, 400, 100, 100), 4);
        // the smaller side decides
        assert_eq!(calculate_in_sample_size(4000, 300, 100, 100), 2);
        assert_eq!(calculate_in_sample_size(4000, 300, 0, 0), 256);
    }

    #[test]
    fn test_downsample() {
        let bitmap = checkerboard(4, 4);
        let sampled = bitmap.downsample(2);
        assert_eq!((sampled.width(), sampled.height()), (2, 2));
        // every kept pixel sits on an even coordinate, so they are all white
        assert!(sampled.pixels().iter().all(|b| *b == 0xff));

        assert_eq!(bitmap.downsample(1), bitmap);
        let tiny = bitmap.downsample(8);
        assert_eq!((tiny.width(), tiny.height()), (1, 1));
        for (width, height) in [(0, 0), (0, 5), (5, 0)] {
            let empty = Bitmap::new(width, height, Vec::new()).unwrap();
            assert_eq!(empty.downsample(2), empty);
        }
    }
}
