//! Motion-JPEG AVI container writer.
//!
//! Writes a single-stream RIFF AVI: a fixed-size header list, one `00dc`
//! chunk per JPEG frame inside `movi`, and an `idx1` index. Sizes, frame
//! counts and dimensions are placeholders until [`AviWriter::finish`]
//! patches them, so frames can be appended without knowing the total.

use std::io::{self, Seek, SeekFrom, Write};

// Byte offsets of the fields patched on finish
const RIFF_SIZE: u64 = 4;
const AVIH_MAX_BYTES_PER_SEC: u64 = 36;
const AVIH_TOTAL_FRAMES: u64 = 48;
const AVIH_SUGGESTED_BUFFER: u64 = 60;
const AVIH_WIDTH: u64 = 64;
const STRH_LENGTH: u64 = 140;
const STRH_SUGGESTED_BUFFER: u64 = 144;
const STRH_FRAME_RECT: u64 = 156;
const STRF_WIDTH: u64 = 176;
const STRF_SIZE_IMAGE: u64 = 192;
const MOVI_SIZE: u64 = 216;
/// Position of the `movi` fourcc; index offsets are relative to it
const MOVI_FOURCC: u64 = 220;
const HEADER_LEN: u64 = 224;

const HDRL_SIZE: u32 = 192;
const STRL_SIZE: u32 = 116;

/// `AVIF_HASINDEX` in the main header, `AVIIF_KEYFRAME` in the index
const FLAG_INDEX_KEYFRAME: u32 = 0x10;

struct IndexEntry {
    offset: u32,
    size: u32,
}

pub struct AviWriter<W: Write + Seek> {
    inner: W,
    fps: u32,
    size: Option<(u32, u32)>,
    index: Vec<IndexEntry>,
    movi_len: u64,
    max_frame: u32,
}

fn fourcc(buf: &mut Vec<u8>, code: &[u8; 4]) {
    buf.extend_from_slice(code);
}

fn u32le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn u16le(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn header(fps: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_LEN as usize);
    fourcc(&mut h, b"RIFF");
    u32le(&mut h, 0);
    fourcc(&mut h, b"AVI ");

    fourcc(&mut h, b"LIST");
    u32le(&mut h, HDRL_SIZE);
    fourcc(&mut h, b"hdrl");

    fourcc(&mut h, b"avih");
    u32le(&mut h, 56);
    u32le(&mut h, 1_000_000 / fps.max(1));
    u32le(&mut h, 0); // max bytes/sec
    u32le(&mut h, 0); // padding granularity
    u32le(&mut h, FLAG_INDEX_KEYFRAME);
    u32le(&mut h, 0); // total frames
    u32le(&mut h, 0); // initial frames
    u32le(&mut h, 1); // streams
    u32le(&mut h, 0); // suggested buffer
    u32le(&mut h, 0); // width
    u32le(&mut h, 0); // height
    for _ in 0..4 {
        u32le(&mut h, 0);
    }

    fourcc(&mut h, b"LIST");
    u32le(&mut h, STRL_SIZE);
    fourcc(&mut h, b"strl");

    fourcc(&mut h, b"strh");
    u32le(&mut h, 56);
    fourcc(&mut h, b"vids");
    fourcc(&mut h, b"MJPG");
    u32le(&mut h, 0); // flags
    u16le(&mut h, 0); // priority
    u16le(&mut h, 0); // language
    u32le(&mut h, 0); // initial frames
    u32le(&mut h, 1); // scale
    u32le(&mut h, fps.max(1)); // rate
    u32le(&mut h, 0); // start
    u32le(&mut h, 0); // length
    u32le(&mut h, 0); // suggested buffer
    u32le(&mut h, u32::MAX); // quality: driver default
    u32le(&mut h, 0); // sample size
    for _ in 0..4 {
        u16le(&mut h, 0); // frame rect
    }

    fourcc(&mut h, b"strf");
    u32le(&mut h, 40);
    u32le(&mut h, 40); // biSize
    u32le(&mut h, 0); // width
    u32le(&mut h, 0); // height
    u16le(&mut h, 1); // planes
    u16le(&mut h, 24); // bit count
    fourcc(&mut h, b"MJPG");
    u32le(&mut h, 0); // size image
    for _ in 0..4 {
        u32le(&mut h, 0);
    }

    fourcc(&mut h, b"LIST");
    u32le(&mut h, 4);
    fourcc(&mut h, b"movi");
    debug_assert_eq!(h.len() as u64, HEADER_LEN);
    h
}

impl<W: Write + Seek> AviWriter<W> {
    /// Start a file with nominal playback rate `fps`.
    pub fn new(mut inner: W, fps: u32) -> io::Result<Self> {
        inner.write_all(&header(fps))?;
        Ok(Self {
            inner,
            fps: fps.max(1),
            size: None,
            index: Vec::new(),
            movi_len: 4,
            max_frame: 0,
        })
    }

    pub fn frame_count(&self) -> u32 {
        self.index.len() as u32
    }

    /// Append one JPEG frame of `width`x`height`. Every frame must have
    /// the size of the first one.
    pub fn write_frame(&mut self, jpeg: &[u8], width: u32, height: u32) -> io::Result<()> {
        match self.size {
            None => self.size = Some((width, height)),
            Some(size) if size != (width, height) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "frame size changed from {}x{} to {width}x{height}",
                        size.0, size.1
                    ),
                ));
            }
            Some(_) => {}
        }
        let len = u32::try_from(jpeg.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;

        self.index.push(IndexEntry {
            offset: (HEADER_LEN - MOVI_FOURCC + self.movi_len - 4) as u32,
            size: len,
        });
        self.inner.write_all(b"00dc")?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(jpeg)?;
        let padded = len as u64 + (len as u64 & 1);
        if len & 1 == 1 {
            self.inner.write_all(&[0])?;
        }
        self.movi_len += 8 + padded;
        self.max_frame = self.max_frame.max(len);
        Ok(())
    }

    fn patch_u32(&mut self, offset: u64, value: u32) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(&value.to_le_bytes())
    }

    /// Write the index, patch the header and return the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        let frames = self.frame_count();
        let mut idx = Vec::with_capacity(8 + self.index.len() * 16);
        fourcc(&mut idx, b"idx1");
        u32le(&mut idx, (self.index.len() * 16) as u32);
        for entry in &self.index {
            fourcc(&mut idx, b"00dc");
            u32le(&mut idx, FLAG_INDEX_KEYFRAME);
            u32le(&mut idx, entry.offset);
            u32le(&mut idx, entry.size);
        }
        self.inner.write_all(&idx)?;
        let end = self.inner.stream_position()?;

        let (width, height) = self.size.unwrap_or((0, 0));
        let avg_frame = if frames > 0 {
            (self.movi_len / frames as u64) as u32
        } else {
            0
        };

        self.patch_u32(RIFF_SIZE, (end - 8) as u32)?;
        self.patch_u32(AVIH_MAX_BYTES_PER_SEC, avg_frame.saturating_mul(self.fps))?;
        self.patch_u32(AVIH_TOTAL_FRAMES, frames)?;
        self.patch_u32(AVIH_SUGGESTED_BUFFER, self.max_frame + 8)?;
        self.patch_u32(AVIH_WIDTH, width)?;
        self.patch_u32(AVIH_WIDTH + 4, height)?;
        self.patch_u32(STRH_LENGTH, frames)?;
        self.patch_u32(STRH_SUGGESTED_BUFFER, self.max_frame + 8)?;

        self.inner.seek(SeekFrom::Start(STRH_FRAME_RECT))?;
        let rect = [0u16, 0, width.min(u16::MAX as u32) as u16, height.min(u16::MAX as u32) as u16];
        for v in rect {
            self.inner.write_all(&v.to_le_bytes())?;
        }

        self.patch_u32(STRF_WIDTH, width)?;
        self.patch_u32(STRF_WIDTH + 4, height)?;
        self.patch_u32(STRF_SIZE_IMAGE, width * height * 3)?;
        self.patch_u32(MOVI_SIZE, self.movi_len as u32)?;

        self.inner.seek(SeekFrom::Start(end))?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_u32(buf: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_header_layout() {
        let h = header(20);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(&h[24..28], b"avih");
        assert_eq!(&h[100..104], b"strh");
        assert_eq!(&h[164..168], b"strf");
        assert_eq!(&h[212..216], b"LIST");
        assert_eq!(&h[MOVI_FOURCC as usize..HEADER_LEN as usize], b"movi");
        assert_eq!(read_u32(&h, 32), 50_000);
    }

    #[test]
    fn test_finished_file_is_consistent() {
        let mut writer = AviWriter::new(Cursor::new(Vec::new()), 20).unwrap();
        writer.write_frame(b"\xFF\xD8abc", 64, 48).unwrap(); // odd length, padded
        writer.write_frame(b"\xFF\xD8abcd", 64, 48).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(read_u32(&bytes, AVIH_TOTAL_FRAMES as usize), 2);
        assert_eq!(read_u32(&bytes, STRH_LENGTH as usize), 2);
        assert_eq!(read_u32(&bytes, AVIH_WIDTH as usize), 64);
        assert_eq!(read_u32(&bytes, STRF_WIDTH as usize + 4), 48);

        // First chunk directly after the movi fourcc
        assert_eq!(&bytes[224..228], b"00dc");
        assert_eq!(read_u32(&bytes, 228), 5);
        // 5 bytes + pad, then the second chunk
        assert_eq!(&bytes[238..242], b"00dc");

        let movi_size = read_u32(&bytes, MOVI_SIZE as usize) as usize;
        let idx1 = 220 + movi_size;
        assert_eq!(&bytes[idx1..idx1 + 4], b"idx1");
        assert_eq!(read_u32(&bytes, idx1 + 4), 32);
        // Offsets are relative to the movi fourcc
        assert_eq!(read_u32(&bytes, idx1 + 16), 4);
        assert_eq!(read_u32(&bytes, idx1 + 32), 18);
        assert_eq!(read_u32(&bytes, idx1 + 36), 6);
    }

    #[test]
    fn test_rejects_size_change() {
        let mut writer = AviWriter::new(Cursor::new(Vec::new()), 20).unwrap();
        writer.write_frame(b"\xFF\xD8", 64, 48).unwrap();
        assert!(writer.write_frame(b"\xFF\xD8", 32, 24).is_err());
        assert_eq!(writer.frame_count(), 1);
    }
}
