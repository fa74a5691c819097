//! Diff IDs: digests of uncompressed layer content.

use std::io::Write;

use a3s_oci_core::{Compression, Descriptor, Digest, Digester, OciError, Result};

use crate::content::{Provider, CHUNK_SIZE};

/// Compute the diff ID of `layer`.
///
/// For an uncompressed layer this is the layer digest. Compressed layers
/// (gzip or zstd per their media type) are streamed through a decoder and
/// the decompressed bytes are hashed. The compressed bytes are verified
/// against the layer digest at the same time.
pub async fn compute_diff_id<P: Provider + ?Sized>(provider: &P, layer: &Descriptor) -> Result<Digest> {
    let compression = Compression::from_media_type(&layer.media_type);
    if compression == Compression::None {
        return Ok(layer.digest.clone());
    }

    let reader = provider
        .reader_at(layer)
        .await
        .map_err(|e| e.context(format!("computing diff ID of layer {}", layer.digest)))?;

    let mut decoder = Decoder::new(compression)?;
    let mut compressed = Digester::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut offset = 0u64;
    loop {
        let n = reader.read_at(&mut buf, offset).await?;
        if n == 0 {
            break;
        }
        compressed.update(&buf[..n]);
        decoder
            .write_all(&buf[..n])
            .map_err(|e| decode_error(layer, compression, e))?;
        offset += n as u64;
    }

    let actual = compressed.finish();
    if actual != layer.digest {
        return Err(OciError::DigestMismatch {
            expected: layer.digest.to_string(),
            actual: actual.to_string(),
        });
    }

    let diff_id = decoder
        .finish()
        .map_err(|e| decode_error(layer, compression, e))?;
    tracing::debug!(layer = %layer.digest, diff_id = %diff_id, "Computed diff ID");
    Ok(diff_id)
}

fn decode_error(layer: &Descriptor, compression: Compression, e: std::io::Error) -> OciError {
    OciError::MalformedContent(format!(
        "Failed to decompress {:?} layer {}: {}",
        compression, layer.digest, e
    ))
}

/// Push-based decompressor feeding a digester.
enum Decoder {
    Gzip(flate2::write::GzDecoder<Digester>),
    Zstd(zstd::stream::write::Decoder<'static, Digester>),
}

impl Decoder {
    fn new(compression: Compression) -> Result<Self> {
        match compression {
            Compression::Gzip => Ok(Decoder::Gzip(flate2::write::GzDecoder::new(Digester::new()))),
            Compression::Zstd => Ok(Decoder::Zstd(zstd::stream::write::Decoder::new(
                Digester::new(),
            )?)),
            Compression::None => Err(OciError::Unsupported(
                "decoder for uncompressed content".to_string(),
            )),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Decoder::Gzip(d) => d.write_all(data),
            Decoder::Zstd(d) => d.write_all(data),
        }
    }

    fn finish(self) -> std::io::Result<Digest> {
        match self {
            Decoder::Gzip(d) => Ok(d.finish()?.finish()),
            Decoder::Zstd(mut d) => {
                d.flush()?;
                Ok(d.into_inner().finish())
            }
        }
    }
}
