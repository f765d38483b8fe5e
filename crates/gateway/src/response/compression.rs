//! Body decompression for the three encodings §4.6 lists upstream
//! providers may use: `gzip`, `deflate`, `br`. Adapted from the teacher's
//! `http::compression` module, trimmed to operate on an already-buffered
//! `Bytes` payload (the response handler only needs this for
//! non-streaming responses; streaming SSE bodies from every provider this
//! proxy talks to are sent uncompressed) and with the `zstd` branch
//! removed since no provider in scope here uses it.

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use tokio::io::AsyncReadExt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unsupported content encoding: {0}")]
	UnsupportedEncoding(String),
	#[error("decompression failed: {0}")]
	Io(#[from] std::io::Error),
}

pub async fn decompress(body: Bytes, encoding: Option<&str>) -> Result<Bytes, Error> {
	let Some(encoding) = encoding else { return Ok(body) };
	let encoding = encoding.trim();
	if encoding.is_empty() || encoding.eq_ignore_ascii_case("identity") {
		return Ok(body);
	}
	let mut out = Vec::new();
	match encoding.to_ascii_lowercase().as_str() {
		"gzip" => {
			GzipDecoder::new(&body[..]).read_to_end(&mut out).await?;
		},
		"deflate" => {
			ZlibDecoder::new(&body[..]).read_to_end(&mut out).await?;
		},
		"br" => {
			BrotliDecoder::new(&body[..]).read_to_end(&mut out).await?;
		},
		other => return Err(Error::UnsupportedEncoding(other.to_string())),
	}
	Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn identity_passthrough() {
		let body = Bytes::from_static(b"hello");
		let out = decompress(body.clone(), None).await.unwrap();
		assert_eq!(out, body);
	}

	#[tokio::test]
	async fn unsupported_encoding_rejected() {
		let err = decompress(Bytes::from_static(b"x"), Some("zstd")).await.unwrap_err();
		assert!(matches!(err, Error::UnsupportedEncoding(_)));
	}
}
