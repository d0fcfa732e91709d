//! HTTP MJPEG stream reader.
//!
//! Connects lazily, walks the multipart body part by part and reconnects on
//! the next `grab` after any read error. Endpoints that answer
//! with a plain image instead of a multipart stream are polled like snapshots.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::{BufRead, BufReader, Read};
use std::time::Duration;
use url::Url;

use super::{decode_jpeg, FrameGrabber, MAX_JPEG_BYTES};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

pub struct MjpegStreamGrabber {
    url: Url,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
}

enum HttpStream {
    Multipart(MjpegParts),
    SingleJpeg,
}

impl MjpegStreamGrabber {
    pub fn new(url: Url, timeout: Duration) -> Self {
        // Stream bodies are long-lived; only bound the connect and each read.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self {
            url,
            agent,
            stream: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(self.url.as_str())
            .call()
            .with_context(|| format!("connect to mjpeg stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            self.stream = Some(HttpStream::Multipart(MjpegParts::new(response.into_reader())));
        } else {
            log::warn!(
                "{} is not a multipart stream ({}); polling single images",
                self.url,
                content_type
            );
            self.stream = Some(HttpStream::SingleJpeg);
        }
        log::info!("mjpeg stream connected: {}", self.url);
        Ok(())
    }

    fn fetch_single(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(self.url.as_str())
            .call()
            .with_context(|| format!("fetch jpeg from {}", self.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg body")?;
        Ok(bytes)
    }
}

impl FrameGrabber for MjpegStreamGrabber {
    fn describe(&self) -> String {
        format!("mjpeg {}", self.url)
    }

    fn grab(&mut self) -> Result<RgbImage> {
        if self.stream.is_none() {
            self.connect()?;
        }
        let bytes = match self.stream.as_mut() {
            Some(HttpStream::Multipart(parts)) => parts.next_part(),
            Some(HttpStream::SingleJpeg) => self.fetch_single(),
            None => Err(anyhow!("mjpeg stream not connected")),
        };
        match bytes {
            Ok(bytes) => decode_jpeg(&bytes),
            Err(err) => {
                self.stream = None;
                Err(err)
            }
        }
    }
}

/// Longest boundary or part-header line accepted.
const MAX_HEADER_LINE: u64 = 1024;

/// Reads the parts of a `multipart/x-mixed-replace` body one JPEG at a time.
pub(crate) struct MjpegParts {
    reader: BufReader<Box<dyn Read + Send>>,
}

impl MjpegParts {
    pub(crate) fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader),
        }
    }

    /// Body of the next part. Uses the part's `Content-Length` when the camera
    /// sends one, else reads through the JPEG end-of-image marker.
    pub(crate) fn next_part(&mut self) -> Result<Vec<u8>> {
        match self.skip_to_part_body()? {
            Some(len) if len > MAX_JPEG_BYTES => {
                Err(anyhow!("mjpeg part of {} bytes exceeds the frame limit", len))
            }
            Some(len) => {
                let mut body = vec![0u8; len];
                self.reader
                    .read_exact(&mut body)
                    .context("read mjpeg part")?;
                Ok(body)
            }
            None => self.read_through_eoi(),
        }
    }

    /// Consume everything up to and including the next part's headers.
    fn skip_to_part_body(&mut self) -> Result<Option<usize>> {
        let mut skipped = 0usize;
        loop {
            let line = self.header_line()?;
            if line.starts_with(b"--") {
                break;
            }
            skipped += line.len();
            if skipped > MAX_JPEG_BYTES {
                return Err(anyhow!("no multipart boundary in mjpeg stream"));
            }
        }

        let mut content_length = None;
        loop {
            let line = self.header_line()?;
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                return Ok(content_length);
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                }
            }
        }
    }

    fn header_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_HEADER_LINE)
            .read_until(b'\n', &mut line)
            .context("read mjpeg stream")?;
        if read == 0 {
            return Err(anyhow!("mjpeg stream ended"));
        }
        Ok(line)
    }

    fn read_through_eoi(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while !body.ends_with(&JPEG_EOI) {
            let room = (MAX_JPEG_BYTES + 1).saturating_sub(body.len()) as u64;
            let read = (&mut self.reader)
                .take(room)
                .read_until(JPEG_EOI[1], &mut body)
                .context("read mjpeg part")?;
            if body.len() > MAX_JPEG_BYTES {
                return Err(anyhow!("mjpeg part without end marker within the frame limit"));
            }
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended mid-part"));
            }
        }
        let soi = body
            .windows(2)
            .position(|w| w == JPEG_SOI)
            .ok_or_else(|| anyhow!("mjpeg part has no JPEG start marker"))?;
        body.drain(..soi);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use std::io::Cursor;

    fn jpeg(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, image::Rgb([shade, shade, shade]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 80)
            .encode_image(&image)
            .unwrap();
        out
    }

    fn part(jpeg: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        )
        .into_bytes();
        out.extend_from_slice(jpeg);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn reads_parts_by_content_length() {
        let first = jpeg(16, 8, 10);
        let second = jpeg(16, 8, 200);
        let mut body = part(&first);
        body.extend(part(&second));

        let mut parts = MjpegParts::new(Box::new(Cursor::new(body)));
        let a = parts.next_part().unwrap();
        let b = parts.next_part().unwrap();
        assert_eq!(decode_jpeg(&a).unwrap().dimensions(), (16, 8));
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(parts.next_part().is_err());
    }

    #[test]
    fn reads_parts_without_length_through_end_marker() {
        let frame = jpeg(8, 8, 90);
        let mut body = b"preamble\r\n--myboundary\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(&frame);
        body.extend_from_slice(b"\r\n--myboundary\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(&[0xFF, 0xD8, 0x00]);

        let mut parts = MjpegParts::new(Box::new(Cursor::new(body)));
        assert_eq!(parts.next_part().unwrap(), frame);
        // Truncated second part.
        assert!(parts.next_part().is_err());
    }

    #[test]
    fn oversized_part_is_refused() {
        let body = format!(
            "--frame\r\nContent-Length: {}\r\n\r\n",
            MAX_JPEG_BYTES + 1
        );
        let mut parts = MjpegParts::new(Box::new(Cursor::new(body.into_bytes())));
        let err = parts.next_part().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
