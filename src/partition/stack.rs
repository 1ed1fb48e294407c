//! Tilt stacks and the MRC stack codec.
//!
//! Epistemic foundation:
//! - K_i: A stack is nz frames of nx·ny samples behind a 1024-byte header
//! - K_i: Frames are kept as raw bytes, so a stack round-trips byte for byte
//! - B_i: Files may be truncated or use unsupported modes → StackFormat
//! - I^B: Header fields other than depth and statistics are never interpreted

use crate::checkpoint::write_atomic;
use crate::models::{Result, TiltflowError};
use std::fs;
use std::path::Path;

/// Size of the fixed MRC header.
pub const HEADER_LEN: usize = 1024;

// Byte offsets of the header words we read or patch.
const NX: usize = 0;
const NY: usize = 4;
const NZ: usize = 8;
const MODE: usize = 12;
const MX: usize = 28;
const MY: usize = 32;
const MZ: usize = 36;
const CELLA: usize = 40;
const CELLB: usize = 52;
const MAPC: usize = 64;
const DMIN: usize = 76;
const DMAX: usize = 80;
const DMEAN: usize = 84;
const NSYMBT: usize = 92;
const MAP: usize = 208;
const MACHST: usize = 212;
const RMS: usize = 216;

/// Sample encoding of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Mode 0: signed 8-bit
    Int8,
    /// Mode 1: signed 16-bit
    Int16,
    /// Mode 2: 32-bit float
    Float32,
    /// Mode 6: unsigned 16-bit
    Uint16,
}

impl SampleMode {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::Int8),
            1 => Ok(Self::Int16),
            2 => Ok(Self::Float32),
            6 => Ok(Self::Uint16),
            other => Err(TiltflowError::StackFormat(format!(
                "Unsupported MRC mode {other}"
            ))),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Int8 => 0,
            Self::Int16 => 1,
            Self::Float32 => 2,
            Self::Uint16 => 6,
        }
    }

    /// Bytes per sample.
    pub fn width(self) -> usize {
        match self {
            Self::Int8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Float32 => 4,
        }
    }

    fn decode(self, bytes: &[u8]) -> impl Iterator<Item = f64> + '_ {
        bytes.chunks_exact(self.width()).map(move |b| match self {
            Self::Int8 => f64::from(b[0] as i8),
            Self::Int16 => f64::from(i16::from_le_bytes([b[0], b[1]])),
            Self::Float32 => f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            Self::Uint16 => f64::from(u16::from_le_bytes([b[0], b[1]])),
        })
    }
}

/// An ordered stack of 2-D frames.
///
/// Header and extended header are carried verbatim; sub-stacks produced by
/// [`TiltStack::with_frames`] share them with their parent.
#[derive(Debug, Clone, PartialEq)]
pub struct TiltStack {
    header: Vec<u8>,
    extended: Vec<u8>,
    nx: usize,
    ny: usize,
    mode: SampleMode,
    frames: Vec<Vec<u8>>,
}

impl TiltStack {
    /// Read a stack file.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| TiltflowError::io(format!("reading stack {}", path.display()), e))?;
        Self::from_bytes(&bytes).map_err(|e| match e {
            TiltflowError::StackFormat(msg) => {
                TiltflowError::StackFormat(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Decode an in-memory MRC image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(TiltflowError::StackFormat(format!(
                "File is {} bytes, shorter than the {HEADER_LEN}-byte header",
                bytes.len()
            )));
        }

        let nx = dimension(bytes, NX, "nx")?;
        let ny = dimension(bytes, NY, "ny")?;
        let nz = dimension(bytes, NZ, "nz")?;
        let mode = SampleMode::from_code(read_i32(bytes, MODE))?;
        let nsymbt = dimension(bytes, NSYMBT, "extended header size")?;

        let oversized = || {
            TiltflowError::StackFormat(format!(
                "Header dimensions {nx}x{ny}x{nz} (+{nsymbt} extended bytes) overflow"
            ))
        };
        let frame_len = nx
            .checked_mul(ny)
            .and_then(|n| n.checked_mul(mode.width()))
            .ok_or_else(oversized)?;
        let data_start = HEADER_LEN.checked_add(nsymbt).ok_or_else(oversized)?;
        let needed = nz
            .checked_mul(frame_len)
            .and_then(|n| n.checked_add(data_start))
            .ok_or_else(oversized)?;
        if bytes.len() < needed {
            return Err(TiltflowError::StackFormat(format!(
                "Truncated stack: expected {needed} bytes for {nz} frames of {nx}x{ny}, found {}",
                bytes.len()
            )));
        }

        if frame_len == 0 && nz > 0 {
            return Err(TiltflowError::StackFormat(format!(
                "{nz} frames of {nx}x{ny} hold no samples"
            )));
        }
        let frames = bytes[data_start..needed]
            .chunks_exact(frame_len.max(1))
            .map(<[u8]>::to_vec)
            .collect();

        Ok(Self {
            header: bytes[..HEADER_LEN].to_vec(),
            extended: bytes[HEADER_LEN..data_start].to_vec(),
            nx,
            ny,
            mode,
            frames,
        })
    }

    /// Build a mode-2 stack from float frames.
    pub fn from_f32_frames(nx: usize, ny: usize, frames: &[Vec<f32>]) -> Result<Self> {
        if let Some(bad) = frames.iter().position(|f| f.len() != nx * ny) {
            return Err(TiltflowError::StackFormat(format!(
                "Frame {bad} has {} samples, expected {}",
                frames[bad].len(),
                nx * ny
            )));
        }

        let mut header = vec![0u8; HEADER_LEN];
        let dims = [nx, ny, frames.len()].map(|d| i32::try_from(d).unwrap_or(i32::MAX));
        for (i, dim) in dims.iter().enumerate() {
            write_i32(&mut header, NX + 4 * i, *dim);
            write_i32(&mut header, MX + 4 * i, *dim);
            write_f32(&mut header, CELLA + 4 * i, *dim as f32);
            write_f32(&mut header, CELLB + 4 * i, 90.0);
            write_i32(&mut header, MAPC + 4 * i, i as i32 + 1);
        }
        write_i32(&mut header, MODE, SampleMode::Float32.code());
        header[MAP..MAP + 4].copy_from_slice(b"MAP ");
        header[MACHST..MACHST + 4].copy_from_slice(&[0x44, 0x44, 0, 0]);

        Ok(Self {
            header,
            extended: Vec::new(),
            nx,
            ny,
            mode: SampleMode::Float32,
            frames: frames
                .iter()
                .map(|f| f.iter().flat_map(|v| v.to_le_bytes()).collect())
                .collect(),
        })
    }

    /// A stack with this stack's header and geometry but different frames.
    pub fn with_frames(&self, frames: Vec<Vec<u8>>) -> Self {
        Self {
            header: self.header.clone(),
            extended: self.extended.clone(),
            nx: self.nx,
            ny: self.ny,
            mode: self.mode,
            frames,
        }
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    pub fn mode(&self) -> SampleMode {
        self.mode
    }

    /// Bytes per frame.
    pub fn frame_len(&self) -> usize {
        self.nx * self.ny * self.mode.width()
    }

    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        self.frames.get(index).map(Vec::as_slice)
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Vec<u8>> {
        self.frames
    }

    /// Whether frames of `other` can be interleaved with this stack's.
    pub fn same_geometry(&self, other: &TiltStack) -> bool {
        self.nx == other.nx && self.ny == other.ny && self.mode == other.mode
    }

    /// Decoded samples of one frame.
    pub fn frame_values(&self, index: usize) -> impl Iterator<Item = f64> + '_ {
        let bytes = self.frame(index).unwrap_or(&[]);
        self.mode.decode(bytes)
    }

    /// Decoded samples of the whole stack, frame by frame.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.frames.iter().flat_map(|f| self.mode.decode(f))
    }

    /// Encode as an MRC image with depth and statistics brought up to date.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = self.header.clone();
        let nz = i32::try_from(self.depth()).unwrap_or(i32::MAX);
        if read_i32(&header, MZ) == read_i32(&header, NZ) {
            write_i32(&mut header, MZ, nz);
        }
        write_i32(&mut header, NZ, nz);

        let (min, max, mean, rms) = self.header_statistics();
        write_f32(&mut header, DMIN, min as f32);
        write_f32(&mut header, DMAX, max as f32);
        write_f32(&mut header, DMEAN, mean as f32);
        write_f32(&mut header, RMS, rms as f32);

        let mut bytes =
            Vec::with_capacity(HEADER_LEN + self.extended.len() + self.depth() * self.frame_len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.extended);
        for frame in &self.frames {
            bytes.extend_from_slice(frame);
        }
        bytes
    }

    /// Atomically write the stack to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes())
    }

    fn header_statistics(&self) -> (f64, f64, f64, f64) {
        let mut count = 0usize;
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for v in self.values() {
            count += 1;
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        if count == 0 {
            return (0.0, 0.0, 0.0, 0.0);
        }
        let mean = sum / count as f64;
        let var = self.values().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        (min, max, mean, var.sqrt())
    }
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn write_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_f32(bytes: &mut [u8], offset: usize, value: f32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn dimension(bytes: &[u8], offset: usize, name: &str) -> Result<usize> {
    let value = read_i32(bytes, offset);
    usize::try_from(value)
        .map_err(|_| TiltflowError::StackFormat(format!("Negative {name} in header: {value}")))
}
