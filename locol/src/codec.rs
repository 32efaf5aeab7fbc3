//! Request body decompression.

use std::io::Read;

use bytes::{Buf, Bytes};
use flate2::read::{MultiGzDecoder, ZlibDecoder};

/// Errors produced by [`decode`]
#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    /// The `Content-Encoding` names an encoding we do not understand
    #[error("Unsupported encoding type: {0}")]
    Unsupported(String),
    /// The body is not valid for the claimed encoding
    #[error("failed to decode input as {encoding}: {source}")]
    Decode {
        /// The encoding being undone
        encoding: String,
        /// Underlying decoder error
        #[source]
        source: std::io::Error,
    },
}

/// Decode an HTTP request body based on its `Content-Encoding` header.
/// Identity, gzip, deflate and zstd are supported.
///
/// Multiple encodings joined by `,` are undone in reverse of the order they
/// were applied, that is right to left.
///
/// See [RFC7231](https://httpwg.org/specs/rfc7231.html#header.content-encoding) for more details
/// on this header value.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for an unknown encoding and
/// [`Error::Decode`] when the body cannot be decoded.
pub(crate) fn decode(
    content_encoding: Option<&http::HeaderValue>,
    mut body: Bytes,
) -> Result<Bytes, Error> {
    let Some(content_encoding) = content_encoding else {
        return Ok(body);
    };
    let content_encoding = String::from_utf8_lossy(content_encoding.as_bytes());

    for encoding in content_encoding
        .rsplit(',')
        .map(str::trim)
        .map(str::to_lowercase)
    {
        let decode_error = |source| Error::Decode {
            encoding: encoding.clone(),
            source,
        };
        body = match encoding.as_ref() {
            "identity" | "" => body,
            "gzip" | "x-gzip" => {
                let mut decoded = Vec::new();
                MultiGzDecoder::new(body.reader())
                    .read_to_end(&mut decoded)
                    .map_err(decode_error)?;
                decoded.into()
            }
            "deflate" => {
                let mut decoded = Vec::new();
                ZlibDecoder::new(body.reader())
                    .read_to_end(&mut decoded)
                    .map_err(decode_error)?;
                decoded.into()
            }
            "zstd" => {
                let mut decoded = Vec::new();
                zstd::Decoder::new(body.reader())
                    .map_err(decode_error)?
                    .read_to_end(&mut decoded)
                    .map_err(decode_error)?;
                decoded.into()
            }
            other => return Err(Error::Unsupported(other.to_string())),
        }
    }

    Ok(body)
}
